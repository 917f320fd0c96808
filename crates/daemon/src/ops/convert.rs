use std::fs;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use async_trait::async_trait;
use log::{info, warn};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::catalog::{CatalogClient, Movie};
use crate::config::MoverConfig;
use crate::error::OperationError;
use crate::exec::{self, ProgressPipe};
use crate::paths::PathMapper;
use crate::probe::{self, AudioStreamProfile};
use crate::queue::{ItemStatus, OperationHandler, ProgressHandle};

/// Literal marker substituted for the DTS tag when deriving the output
/// filename in preserve mode.
const OUTPUT_FORMAT_MARKER: &str = "FLAC.7.1";

/// What happens to the original file once the merged output is ready
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplaceMode {
    /// Delete the original and give the merged output its name
    InPlace,
    /// Keep the original under a `.backup` suffix
    Preserve,
}

/// Channel mapping policy for the 5.1(side) -> 7.1 upmix.
///
/// The source has no distinct back channels, so a policy decides what the
/// new BL/BR carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpmixPolicy {
    /// Duplicate the side surrounds onto the back positions
    DuplicateRears,
    /// Leave the back positions silent
    SilentRears,
}

impl UpmixPolicy {
    /// ffmpeg pan filter implementing the policy
    pub fn pan_filter(&self) -> &'static str {
        match self {
            UpmixPolicy::DuplicateRears => {
                "pan=7.1|FL=FL|FR=FR|FC=FC|LFE=LFE|BL=SL|BR=SR|SL=SL|SR=SR"
            }
            UpmixPolicy::SilentRears => {
                "pan=7.1|FL=FL|FR=FR|FC=FC|LFE=LFE|BL=0*SL|BR=0*SR|SL=SL|SR=SR"
            }
        }
    }
}

/// Replaces a movie's lossy DTS 5.1(side) track with a losslessly re-encoded
/// FLAC 7.1 equivalent, merged back as the default audio stream.
pub struct ConvertOperationHandler {
    config: MoverConfig,
    mapper: PathMapper,
    catalog: CatalogClient,
}

impl ConvertOperationHandler {
    pub fn new(config: MoverConfig, catalog: CatalogClient) -> Self {
        let mapper = PathMapper::new(&config.path_mappings);
        ConvertOperationHandler {
            config,
            mapper,
            catalog,
        }
    }

    async fn run_pipeline(
        &self,
        movie: &Movie,
        host_src: &Path,
        temp_audio: &Path,
        duration_secs: Option<f64>,
        use_nice: bool,
        progress: &ProgressHandle,
    ) -> Result<(), OperationError> {
        // Step 2: transcode the audio stream only. The encode runs to
        // completion before its output is trusted.
        info!("Starting conversion to FLAC 7.1: {}", host_src.display());
        let mut cmd = exec::niced_command(&self.config.ffmpeg_bin, use_nice);
        cmd.args(build_transcode_args(host_src, temp_audio, self.config.upmix));
        exec::run_streaming(cmd, ProgressPipe::Stderr, |line| {
            if let (Some(secs), Some(total)) = (parse_ffmpeg_time(line), duration_secs) {
                progress.set_progress(format!("Converting: {:.1}%", secs / total * 100.0));
            }
        })
        .await?;

        if !temp_audio.exists() {
            return Err(OperationError::ExternalTool(
                "encoded audio track was not created".to_string(),
            ));
        }
        info!("Conversion completed: {}", temp_audio.display());

        // Step 3: remux into a side file next to the original, new audio as
        // default stream 0, everything else carried through untouched.
        progress.set_status(ItemStatus::Merging);
        progress.set_progress("Merging audio track into container...");

        let side_file = side_output_path(host_src);
        info!("Merging audio track into: {}", side_file.display());
        let mut cmd = exec::niced_command(&self.config.ffmpeg_bin, use_nice);
        cmd.args(build_remux_args(temp_audio, host_src, &side_file));
        if let Err(e) = exec::run_streaming(cmd, ProgressPipe::Stderr, |_| {}).await {
            remove_if_exists(&side_file);
            return Err(e);
        }
        if !side_file.exists() {
            return Err(OperationError::ExternalTool(
                "merged output was not created".to_string(),
            ));
        }

        // Step 4: the side file takes the original's place
        progress.set_status(ItemStatus::Replacing);
        progress.set_progress("Replacing original file...");

        let final_path = match self.replace_original(host_src, &side_file) {
            Ok(path) => path,
            Err(e) => {
                remove_if_exists(&side_file);
                return Err(e);
            }
        };
        info!("File replaced successfully: {}", final_path.display());

        // Step 5: rescan. File-side effects are final regardless of the
        // catalog's answer.
        progress.set_progress("Triggering catalog rescan...");
        info!("Triggering rescan for movie {}", movie.id);
        self.catalog.trigger_rescan(movie.id).await?;

        Ok(())
    }

    /// Swap the merged side file into place according to the configured
    /// replace mode, then reapply the original's ownership and permission
    /// bits where the host supports it.
    fn replace_original(&self, host_src: &Path, side_file: &Path) -> Result<PathBuf, OperationError> {
        if !side_file.exists() {
            return Err(OperationError::ExternalTool(
                "merged output disappeared before replacement".to_string(),
            ));
        }
        let original_meta = fs::metadata(host_src).ok();

        let final_path = match self.config.replace_mode {
            ReplaceMode::InPlace => {
                // The merged output is confirmed present; only now may the
                // original go away.
                fs::remove_file(host_src)?;
                fs::rename(side_file, host_src)?;
                host_src.to_path_buf()
            }
            ReplaceMode::Preserve => {
                let backup = backup_path_for(host_src);
                fs::rename(host_src, &backup)?;
                info!("Original preserved as: {}", backup.display());

                let parent = host_src.parent().unwrap_or_else(|| Path::new("."));
                let file_name = host_src
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_default();
                let target = collision_free_path(parent.join(derive_output_name(&file_name)));
                fs::rename(side_file, &target)?;
                target
            }
        };

        if let Some(meta) = original_meta {
            if let Err(e) = fs::set_permissions(&final_path, meta.permissions()) {
                warn!(
                    "Failed to restore permissions on {}: {}",
                    final_path.display(),
                    e
                );
            }
            #[cfg(unix)]
            {
                use std::os::unix::fs::MetadataExt;
                if let Err(e) =
                    std::os::unix::fs::chown(&final_path, Some(meta.uid()), Some(meta.gid()))
                {
                    warn!(
                        "Failed to restore ownership on {}: {}",
                        final_path.display(),
                        e
                    );
                }
            }
        }

        Ok(final_path)
    }
}

#[async_trait]
impl OperationHandler for ConvertOperationHandler {
    fn name(&self) -> &'static str {
        "convert"
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

        let host_src = self.mapper.to_host(src_catalog);
        // Files on the slow tier get the idle I/O treatment
        let use_nice = src_catalog.starts_with(&self.config.slow_root);

        // Step 1: validate the primary audio stream before touching anything
        progress.set_status(ItemStatus::Validating);
        progress.set_progress("Validating audio format...");
        info!("Validating audio format for: {}", host_src.display());

        let data = probe::probe_file(&self.config.ffprobe_bin, &host_src, Some("a:0")).await?;
        let profile = AudioStreamProfile::from_probe(&data)?;
        validate_profile(&profile)?;
        info!(
            "Audio validation passed: codec={}, layout={}, duration={:?}",
            profile.codec_family, profile.channel_layout, profile.duration_secs
        );

        // Step 2 onward, with the scratch audio cleaned up on every exit path
        progress.set_status(ItemStatus::Converting);
        progress.set_progress("Converting DTS to FLAC 7.1...");

        fs::create_dir_all(&self.config.temp_dir)?;
        let temp_audio = self
            .config
            .temp_dir
            .join(format!("convert_audio_{}.flac", std::process::id()));

        let result = self
            .run_pipeline(
                movie,
                &host_src,
                &temp_audio,
                profile.duration_secs,
                use_nice,
                progress,
            )
            .await;

        remove_if_exists(&temp_audio);
        result
    }
}

/// The convert operation accepts exactly one source shape: a DTS-family
/// codec laid out as 5.1(side). Near-matches are not converted.
fn validate_profile(profile: &AudioStreamProfile) -> Result<(), OperationError> {
    if !profile.codec_family.starts_with("dts") {
        return Err(OperationError::Validation(format!(
            "audio codec is not DTS (found: {})",
            profile.codec_family
        )));
    }
    if profile.channel_layout != "5.1(side)" {
        return Err(OperationError::Validation(format!(
            "channel layout is not 5.1(side) (found: {})",
            profile.channel_layout
        )));
    }
    Ok(())
}

/// ffmpeg arguments for the audio-only FLAC 7.1 encode at maximum
/// compression effort
fn build_transcode_args(input: &Path, output: &Path, policy: UpmixPolicy) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        input.to_string_lossy().into_owned(),
        "-vn".to_string(),
        "-c:a".to_string(),
        "flac".to_string(),
        "-compression_level".to_string(),
        "8".to_string(),
        "-channel_layout".to_string(),
        "7.1".to_string(),
        "-ac".to_string(),
        "8".to_string(),
        "-af".to_string(),
        policy.pan_filter().to_string(),
        "-loglevel".to_string(),
        "warning".to_string(),
        "-stats".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

/// ffmpeg arguments for the remux: new audio becomes stream 0, tagged and
/// marked default; original audio follows in order; video and subtitles are
/// copied through untouched.
fn build_remux_args(audio: &Path, original: &Path, output: &Path) -> Vec<String> {
    vec![
        "-y".to_string(),
        "-i".to_string(),
        audio.to_string_lossy().into_owned(),
        "-i".to_string(),
        original.to_string_lossy().into_owned(),
        "-map".to_string(),
        "1:v".to_string(),
        "-map".to_string(),
        "0:a:0".to_string(),
        "-map".to_string(),
        "1:a".to_string(),
        "-map".to_string(),
        "1:s?".to_string(),
        "-c".to_string(),
        "copy".to_string(),
        "-metadata:s:a:0".to_string(),
        "title=FLAC 7.1".to_string(),
        "-metadata:s:a:0".to_string(),
        "language=eng".to_string(),
        "-disposition:a:0".to_string(),
        "default".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
        output.to_string_lossy().into_owned(),
    ]
}

/// Sibling temp name for the merged output, same directory as the input so
/// the final rename stays on one filesystem
fn side_output_path(input: &Path) -> PathBuf {
    input.with_extension("tmp.flac71.mkv")
}

/// Extract the current position from an ffmpeg `-stats` line
fn parse_ffmpeg_time(line: &str) -> Option<f64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"time=(\d+):(\d+):(\d+(?:\.\d+)?)").unwrap());
    let caps = re.captures(line)?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

/// Derive the output filename from the input by replacing the first
/// case-insensitive DTS 5.1 marker with the new-format marker. Names without
/// a marker come back unchanged.
pub fn derive_output_name(file_name: &str) -> String {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(?i)dts(?:[-._ ]?hd)?(?:[-._ ]?ma)?[-._ ]?5[._ ]1(?:\(side\))?").unwrap()
    });
    re.replace(file_name, OUTPUT_FORMAT_MARKER).into_owned()
}

/// Resolve a name collision by appending an incrementing numeric suffix
/// before the extension.
fn collision_free_path(candidate: PathBuf) -> PathBuf {
    if !candidate.exists() {
        return candidate;
    }
    let stem = candidate
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let ext = candidate
        .extension()
        .map(|e| e.to_string_lossy().into_owned());
    let parent = candidate.parent().unwrap_or_else(|| Path::new("."));

    for n in 1u32.. {
        let name = match &ext {
            Some(ext) => format!("{}.{}.{}", stem, n, ext),
            None => format!("{}.{}", stem, n),
        };
        let next = parent.join(name);
        if !next.exists() {
            return next;
        }
    }
    unreachable!("collision counter exhausted");
}

/// Backup name for the preserved original, collision-avoided with a numeric
/// counter.
fn backup_path_for(original: &Path) -> PathBuf {
    let base = format!("{}.backup", original.display());
    let mut candidate = PathBuf::from(&base);
    let mut n = 1u32;
    while candidate.exists() {
        candidate = PathBuf::from(format!("{}.{}", base, n));
        n += 1;
    }
    candidate
}

fn remove_if_exists(path: &Path) {
    if path.exists() {
        if let Err(e) = fs::remove_file(path) {
            warn!("Failed to remove temp file {}: {}", path.display(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_rears_pan_filter() {
        assert_eq!(
            UpmixPolicy::DuplicateRears.pan_filter(),
            "pan=7.1|FL=FL|FR=FR|FC=FC|LFE=LFE|BL=SL|BR=SR|SL=SL|SR=SR"
        );
    }

    #[test]
    fn test_silent_rears_pan_filter_zeroes_backs() {
        let filter = UpmixPolicy::SilentRears.pan_filter();
        assert!(filter.contains("BL=0*SL"));
        assert!(filter.contains("BR=0*SR"));
        assert!(filter.contains("SL=SL"));
    }

    #[test]
    fn test_validate_accepts_dts_side_layout() {
        let profile = AudioStreamProfile {
            codec_family: "dts".to_string(),
            channel_layout: "5.1(side)".to_string(),
            channel_count: 6,
            sample_rate: Some(48000),
            duration_secs: Some(7384.2),
        };
        assert!(validate_profile(&profile).is_ok());
    }

    #[test]
    fn test_validate_rejects_wrong_codec() {
        let profile = AudioStreamProfile {
            codec_family: "aac".to_string(),
            channel_layout: "5.1".to_string(),
            channel_count: 6,
            sample_rate: Some(48000),
            duration_secs: None,
        };
        let err = validate_profile(&profile).unwrap_err();
        match err {
            OperationError::Validation(msg) => assert!(msg.contains("aac")),
            other => panic!("unexpected error kind: {:?}", other),
        }
    }

    #[test]
    fn test_validate_rejects_near_match_layout() {
        // Plain 5.1 is not speculatively converted.
        let profile = AudioStreamProfile {
            codec_family: "dts".to_string(),
            channel_layout: "5.1".to_string(),
            channel_count: 6,
            sample_rate: Some(48000),
            duration_secs: Some(100.0),
        };
        assert!(validate_profile(&profile).is_err());
    }

    #[test]
    fn test_transcode_args() {
        let args = build_transcode_args(
            Path::new("/m/in.mkv"),
            Path::new("/tmp/a.flac"),
            UpmixPolicy::DuplicateRears,
        );
        let joined = args.join(" ");
        assert!(joined.contains("-vn"));
        assert!(joined.contains("-c:a flac"));
        assert!(joined.contains("-compression_level 8"));
        assert!(joined.contains("-channel_layout 7.1"));
        assert!(joined.contains("-ac 8"));
        assert!(joined.contains("BL=SL|BR=SR"));
    }

    #[test]
    fn test_remux_args_order_and_tags() {
        let args = build_remux_args(
            Path::new("/tmp/a.flac"),
            Path::new("/m/in.mkv"),
            Path::new("/m/in.tmp.flac71.mkv"),
        );
        let joined = args.join(" ");
        // New audio first, then original audio in original order, video and
        // subtitles copied through.
        assert!(joined.contains("-map 1:v -map 0:a:0 -map 1:a -map 1:s?"));
        assert!(joined.contains("-c copy"));
        assert!(joined.contains("title=FLAC 7.1"));
        assert!(joined.contains("language=eng"));
        assert!(joined.contains("-disposition:a:0 default"));
    }

    #[test]
    fn test_side_output_path_is_sibling() {
        assert_eq!(
            side_output_path(Path::new("/m/Movie (2020).mkv")),
            PathBuf::from("/m/Movie (2020).tmp.flac71.mkv")
        );
    }

    #[test]
    fn test_parse_ffmpeg_time() {
        let line = "size=  102400kB time=01:02:03.45 bitrate= 225.0kbits/s speed=41x";
        assert_eq!(parse_ffmpeg_time(line), Some(3723.45));
        assert_eq!(parse_ffmpeg_time("frame=  100 fps= 25"), None);
    }

    #[test]
    fn test_derive_output_name_variants() {
        assert_eq!(
            derive_output_name("Movie.2020.DTS-HD.MA.5.1.mkv"),
            "Movie.2020.FLAC.7.1.mkv"
        );
        assert_eq!(derive_output_name("Movie.2020.DTS.5.1.mkv"), "Movie.2020.FLAC.7.1.mkv");
        assert_eq!(derive_output_name("movie dts 5.1 bluray.mkv"), "movie FLAC.7.1 bluray.mkv");
        assert_eq!(
            derive_output_name("Movie.dts-hd.ma.5.1(side).mkv"),
            "Movie.FLAC.7.1.mkv"
        );
    }

    #[test]
    fn test_derive_output_name_without_marker_is_unchanged() {
        assert_eq!(derive_output_name("Movie.2020.AC3.mkv"), "Movie.2020.AC3.mkv");
    }

    #[test]
    fn test_collision_free_path_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("Movie.FLAC.7.1.mkv");
        std::fs::write(&target, b"x").unwrap();

        let resolved = collision_free_path(target.clone());
        assert_eq!(resolved, dir.path().join("Movie.FLAC.7.1.1.mkv"));

        std::fs::write(&resolved, b"x").unwrap();
        let resolved2 = collision_free_path(target);
        assert_eq!(resolved2, dir.path().join("Movie.FLAC.7.1.2.mkv"));
    }

    #[test]
    fn test_backup_path_counter() {
        let dir = tempfile::tempdir().unwrap();
        let original = dir.path().join("Movie.mkv");
        std::fs::write(&original, b"x").unwrap();

        let first = backup_path_for(&original);
        assert_eq!(first, dir.path().join("Movie.mkv.backup"));

        std::fs::write(&first, b"x").unwrap();
        let second = backup_path_for(&original);
        assert_eq!(second, dir.path().join("Movie.mkv.backup.1"));
    }
}
