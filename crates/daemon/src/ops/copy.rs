use std::fs;
use std::path::Path;

use async_trait::async_trait;
use log::{error, info, warn};

use crate::catalog::{CatalogClient, Movie};
use crate::config::MoverConfig;
use crate::error::OperationError;
use crate::exec::{self, ProgressPipe};
use crate::integrity;
use crate::paths::PathMapper;
use crate::queue::{ItemStatus, OperationHandler, ProgressHandle};

/// Moves a movie's file from the fast tier to the slow tier with checksum
/// verification, then points the catalog at the new location.
///
/// The source file is never deleted here; on a verification failure only the
/// destination artifact is purged.
pub struct CopyOperationHandler {
    config: MoverConfig,
    mapper: PathMapper,
    catalog: CatalogClient,
}

impl CopyOperationHandler {
    pub fn new(config: MoverConfig, catalog: CatalogClient) -> Self {
        let mapper = PathMapper::new(&config.path_mappings);
        CopyOperationHandler {
            config,
            mapper,
            catalog,
        }
    }
}

#[async_trait]
impl OperationHandler for CopyOperationHandler {
    fn name(&self) -> &'static str {
        "copy"
    }

    async fn execute(&self, movie: &Movie, progress: &ProgressHandle) -> Result<(), OperationError> {
        self.config.validate()?;

        let movie_file = movie
            .movie_file
            .as_ref()
            .ok_or_else(|| OperationError::Validation("movie has no file".to_string()))?;
        let src_catalog = movie_file
            .path
            .as_deref()
            .ok_or_else(|| OperationError::Validation("movie file has no path".to_string()))?;

        let dst_catalog =
            destination_path(src_catalog, &self.config.fast_root, &self.config.slow_root)?;
        let host_src = self.mapper.to_host(src_catalog);
        let host_dst = self.mapper.to_host(&dst_catalog);

        // Step 1: copy with idle I/O class and lowest CPU priority
        progress.set_status(ItemStatus::Copying);
        progress.set_progress("Copying file...");
        info!("Starting copy: {} -> {}", host_src.display(), host_dst.display());

        let dst_dir = host_dst.parent().ok_or_else(|| {
            OperationError::Configuration(format!(
                "destination path has no parent directory: {}",
                host_dst.display()
            ))
        })?;
        fs::create_dir_all(dst_dir)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            fs::set_permissions(dst_dir, fs::Permissions::from_mode(0o755))?;
        }

        let mut cmd = exec::niced_command(&self.config.rsync_bin, true);
        cmd.args(build_rsync_args(&host_src, &host_dst));
        exec::run_streaming(cmd, ProgressPipe::Stdout, |line| {
            info!("Copy progress: {}", line);
            progress.set_progress(format!("Copying: {}", line));
        })
        .await?;
        info!("Copy completed: {}", host_dst.display());

        // Step 2: verify checksums on both sides
        progress.set_status(ItemStatus::Verifying);
        progress.set_progress("Verifying checksum...");

        let p = progress.clone();
        let src_checksum = integrity::hash_file(host_src.clone(), move |pct| {
            p.set_progress(format!("Verifying source: {}%", pct));
        })
        .await?;

        let p = progress.clone();
        let dst_checksum = integrity::hash_file(host_dst.clone(), move |pct| {
            p.set_progress(format!("Verifying destination: {}%", pct));
        })
        .await?;

        info!("Source checksum: {}", src_checksum);
        info!("Destination checksum: {}", dst_checksum);

        if src_checksum != dst_checksum {
            error!("Checksum mismatch, removing corrupted destination file");
            if let Err(e) = fs::remove_file(&host_dst) {
                warn!(
                    "Failed to remove corrupted destination {}: {}",
                    host_dst.display(),
                    e
                );
            }
            return Err(OperationError::Integrity(format!(
                "checksum mismatch: source {} vs destination {}",
                src_checksum, dst_checksum
            )));
        }
        info!("Checksum verification passed");

        // Step 3: point the catalog at the new location. The verified copy
        // stays on disk even if this step fails.
        progress.set_status(ItemStatus::UpdatingCatalog);
        progress.set_progress("Updating catalog...");

        let new_dir = Path::new(&dst_catalog)
            .parent()
            .map(|p| p.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.config.slow_root.clone());

        let mut updated = movie.clone();
        updated.path = Some(new_dir.clone());
        updated.root_folder_path = Some(self.config.slow_root.clone());

        info!("Updating catalog for movie {} -> {}", movie.id, new_dir);
        self.catalog.update_movie(movie.id, &updated).await?;

        progress.set_progress("Triggering catalog rescan...");
        info!("Triggering rescan for movie {}", movie.id);
        self.catalog.trigger_rescan(movie.id).await?;

        Ok(())
    }
}

/// Compute the slow-tier destination for a fast-tier source, both in catalog
/// path space.
fn destination_path(
    src: &str,
    fast_root: &str,
    slow_root: &str,
) -> Result<String, OperationError> {
    let fast_root = fast_root.trim_end_matches('/');
    let rest = src.strip_prefix(fast_root).ok_or_else(|| {
        OperationError::Validation(format!(
            "source path is not under the fast tier root: {}",
            src
        ))
    })?;
    if !rest.starts_with('/') {
        return Err(OperationError::Validation(format!(
            "source path is not under the fast tier root: {}",
            src
        )));
    }
    Ok(format!("{}{}", slow_root.trim_end_matches('/'), rest))
}

/// rsync argument list: archive mode, fixed directory/file modes, streaming
/// whole-file progress on stdout.
fn build_rsync_args(src: &Path, dst: &Path) -> Vec<String> {
    vec![
        "-a".to_string(),
        "--chmod=D0755,F0644".to_string(),
        "--info=progress2".to_string(),
        "--no-i-r".to_string(),
        src.to_string_lossy().into_owned(),
        dst.to_string_lossy().into_owned(),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_destination_path() {
        let dst = destination_path(
            "/movies_ssd/Heat (1995)/Heat.mkv",
            "/movies_ssd",
            "/movies_hdd",
        )
        .unwrap();
        assert_eq!(dst, "/movies_hdd/Heat (1995)/Heat.mkv");
    }

    #[test]
    fn test_destination_path_normalizes_trailing_separators() {
        let dst = destination_path("/movies_ssd/A/a.mkv", "/movies_ssd/", "/movies_hdd/").unwrap();
        assert_eq!(dst, "/movies_hdd/A/a.mkv");
    }

    #[test]
    fn test_destination_path_rejects_foreign_source() {
        let err = destination_path("/other/A/a.mkv", "/movies_ssd", "/movies_hdd").unwrap_err();
        assert!(matches!(err, OperationError::Validation(_)));
    }

    #[test]
    fn test_destination_path_rejects_sibling_prefix() {
        // "/movies_ssd2" shares the string prefix but is a different root.
        let err = destination_path("/movies_ssd2/A/a.mkv", "/movies_ssd", "/movies_hdd").unwrap_err();
        assert!(matches!(err, OperationError::Validation(_)));
    }

    #[test]
    fn test_rsync_args_set_modes_and_stream_progress() {
        let args = build_rsync_args(
            &PathBuf::from("/mnt/ssd/movies/A/a.mkv"),
            &PathBuf::from("/mnt/hdd/movies/A/a.mkv"),
        );
        assert!(args.contains(&"-a".to_string()));
        assert!(args.contains(&"--chmod=D0755,F0644".to_string()));
        assert!(args.contains(&"--info=progress2".to_string()));
        assert!(args.contains(&"--no-i-r".to_string()));
        // Source before destination
        let src_pos = args.iter().position(|a| a.ends_with("ssd/movies/A/a.mkv")).unwrap();
        let dst_pos = args.iter().position(|a| a.ends_with("hdd/movies/A/a.mkv")).unwrap();
        assert!(src_pos < dst_pos);
    }
}
