use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};

use log::{info, warn};
use walkdir::WalkDir;

use crate::catalog::{CatalogClient, Movie};
use crate::config::MoverConfig;
use crate::error::OperationError;
use crate::paths::PathMapper;

/// Video file extensions recognized when re-locating a movie's file
const VIDEO_EXTENSIONS: &[&str] = &["mkv", "mp4", "avi", "m4v", "mov"];

/// A fast-tier directory the catalog knows nothing about
#[derive(Debug, Clone)]
pub struct LeftoverEntry {
    pub name: String,
    pub host_path: PathBuf,
    pub size_bytes: u64,
    pub file_count: usize,
    /// A slow-tier catalog movie with this directory name exists but its
    /// file is missing on disk, so the fast-tier copy can be re-queued
    pub can_recopy: bool,
    pub movie_id: Option<i64>,
}

/// A slow-tier catalog movie whose file is absent on disk
#[derive(Debug, Clone)]
pub struct MissingFileEntry {
    pub movie_id: i64,
    pub title: String,
    pub catalog_path: String,
    pub host_path: PathBuf,
}

/// Read-side reconciliation between the catalog and the two storage tiers.
/// Queries run on demand; nothing here goes through a queue.
pub struct LeftoversManager {
    config: MoverConfig,
    mapper: PathMapper,
    catalog: CatalogClient,
}

impl LeftoversManager {
    pub fn new(config: MoverConfig, catalog: CatalogClient) -> Self {
        let mapper = PathMapper::new(&config.path_mappings);
        LeftoversManager {
            config,
            mapper,
            catalog,
        }
    }

    fn fast_root_host(&self) -> PathBuf {
        self.mapper.to_host(&self.config.fast_root)
    }

    /// Find top-level fast-tier directories with no corresponding catalog
    /// movie, with size and file count per entry.
    pub async fn find_untracked(&self) -> Result<Vec<LeftoverEntry>, OperationError> {
        self.config.validate()?;

        let movies = self.catalog.list_movies().await?;

        // Catalog paths on the fast tier, translated to host space
        let mut tracked: HashSet<PathBuf> = HashSet::new();
        // Slow-tier movies by directory name, for the recopy cross-reference
        let mut slow_by_name: HashMap<String, &Movie> = HashMap::new();

        for movie in &movies {
            let Some(path) = movie.path.as_deref() else {
                continue;
            };
            if path.starts_with(&self.config.fast_root) {
                tracked.insert(self.mapper.to_host(path));
            } else if path.starts_with(&self.config.slow_root) {
                if let Some(name) = Path::new(path).file_name() {
                    slow_by_name.insert(name.to_string_lossy().into_owned(), movie);
                }
            }
        }

        let root = self.fast_root_host();
        if !root.exists() {
            warn!("Fast tier root does not exist: {}", root.display());
            return Ok(Vec::new());
        }

        let mut leftovers = Vec::new();
        for entry in fs::read_dir(&root)? {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    warn!("Error reading directory entry: {}", e);
                    continue;
                }
            };
            let path = entry.path();
            if !path.is_dir() || tracked.contains(&path) {
                continue;
            }

            let (size_bytes, file_count) = directory_stats(path.clone()).await;
            let name = entry.file_name().to_string_lossy().into_owned();

            let mut can_recopy = false;
            let mut movie_id = None;
            if let Some(movie) = slow_by_name.get(&name) {
                movie_id = Some(movie.id);
                if movie.has_file {
                    if let Some(file_path) = movie.movie_file.as_ref().and_then(|f| f.path.as_deref()) {
                        if !self.mapper.to_host(file_path).exists() {
                            can_recopy = true;
                            info!("Found missing slow-tier file for {}, can recopy", name);
                        }
                    }
                }
            }

            leftovers.push(LeftoverEntry {
                name,
                host_path: path,
                size_bytes,
                file_count,
                can_recopy,
                movie_id,
            });
        }

        info!("Found {} leftover directories", leftovers.len());
        Ok(leftovers)
    }

    /// Find slow-tier catalog movies whose file is missing on disk.
    pub async fn find_missing(&self) -> Result<Vec<MissingFileEntry>, OperationError> {
        self.config.validate()?;

        let movies = self.catalog.filter_by_root_folder(&self.config.slow_root).await?;
        let mut missing = Vec::new();
        for movie in movies {
            let Some(catalog_path) = movie.movie_file.as_ref().and_then(|f| f.path.clone()) else {
                continue;
            };
            let host_path = self.mapper.to_host(&catalog_path);
            if !host_path.exists() {
                missing.push(MissingFileEntry {
                    movie_id: movie.id,
                    title: movie.title.clone(),
                    catalog_path,
                    host_path,
                });
            }
        }

        info!("Found {} movies with missing files on the slow tier", missing.len());
        Ok(missing)
    }

    /// Delete a leftover directory outright. Irreversible, no trash. The
    /// path must sit under the fast-tier root.
    pub fn delete_leftover(&self, host_path: &Path) -> Result<(), OperationError> {
        let root = self.fast_root_host();
        if root.as_os_str().is_empty() || !host_path.starts_with(&root) {
            return Err(OperationError::Validation(format!(
                "refusing to delete outside the fast tier root: {}",
                host_path.display()
            )));
        }
        if !host_path.exists() {
            return Err(OperationError::Validation(format!(
                "path does not exist: {}",
                host_path.display()
            )));
        }

        info!("Deleting leftover directory: {}", host_path.display());
        fs::remove_dir_all(host_path)?;
        info!("Successfully deleted: {}", host_path.display());
        Ok(())
    }

    /// Rewire a movie whose slow-tier file is missing back to its fast-tier
    /// counterpart, ready to be enqueued for the standard copy-and-verify
    /// protocol.
    pub async fn prepare_recopy(
        &self,
        movie_id: i64,
        fast_dir: &Path,
    ) -> Result<Movie, OperationError> {
        let root = self.fast_root_host();
        if root.as_os_str().is_empty() || !fast_dir.starts_with(&root) {
            return Err(OperationError::Validation(format!(
                "directory is not under the fast tier root: {}",
                fast_dir.display()
            )));
        }
        if !fast_dir.exists() {
            return Err(OperationError::Validation(format!(
                "directory does not exist: {}",
                fast_dir.display()
            )));
        }

        let mut movie = self.catalog.get_movie(movie_id).await?;

        let found = find_video_file(fast_dir.to_path_buf()).await.ok_or_else(|| {
            OperationError::Validation(format!(
                "no video file found in: {}",
                fast_dir.display()
            ))
        })?;

        // Point the snapshot at the fast-tier file; unmodeled movieFile
        // fields (quality etc.) are kept when present.
        let catalog_path = self.mapper.to_catalog(&found.0);
        match movie.movie_file.as_mut() {
            Some(file) => {
                file.path = Some(catalog_path);
                file.size = Some(found.1);
            }
            None => {
                movie.movie_file = Some(crate::catalog::MovieFile {
                    path: Some(catalog_path),
                    size: Some(found.1),
                    extra: serde_json::Map::new(),
                });
            }
        }
        movie.has_file = true;

        Ok(movie)
    }
}

/// Total size and file count of a directory tree, walked off the runtime
async fn directory_stats(dir: PathBuf) -> (u64, usize) {
    tokio::task::spawn_blocking(move || {
        let mut total_size = 0u64;
        let mut file_count = 0usize;
        for entry in WalkDir::new(&dir).follow_links(false).into_iter().filter_map(|e| e.ok()) {
            if entry.file_type().is_file() {
                if let Ok(meta) = entry.metadata() {
                    total_size += meta.len();
                    file_count += 1;
                }
            }
        }
        (total_size, file_count)
    })
    .await
    .unwrap_or((0, 0))
}

/// First video file under a directory, with its size
async fn find_video_file(dir: PathBuf) -> Option<(PathBuf, u64)> {
    tokio::task::spawn_blocking(move || {
        for entry in WalkDir::new(&dir).follow_links(false).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let is_video = entry
                .path()
                .extension()
                .and_then(|e| e.to_str())
                .map(|e| VIDEO_EXTENSIONS.contains(&e.to_lowercase().as_str()))
                .unwrap_or(false);
            if is_video {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                return Some((entry.path().to_path_buf(), size));
            }
        }
        None
    })
    .await
    .unwrap_or(None)
}
