use std::fs::File;
use std::io::Read;
use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};

use crate::error::OperationError;

/// Chunk size for streaming checksums (8 MiB)
pub const HASH_CHUNK_SIZE: usize = 8 * 1024 * 1024;

/// Compute the streaming SHA-256 digest of a file, reporting progress at
/// each 10% boundary. Blocking; use [`hash_file`] from async code.
pub fn hash_file_blocking(
    path: &Path,
    mut on_progress: impl FnMut(u8),
) -> Result<String, OperationError> {
    let file_size = std::fs::metadata(path)?.len();
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    let mut bytes_read: u64 = 0;
    let mut last_decile: u64 = 0;

    log::info!(
        "Calculating SHA-256 checksum for {} ({:.2} GB)",
        path.display(),
        file_size as f64 / 1024.0 / 1024.0 / 1024.0
    );

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
        bytes_read += n as u64;

        // Report once per 10% step
        if file_size > 0 {
            let decile = bytes_read * 10 / file_size;
            if decile > last_decile {
                last_decile = decile;
                on_progress((decile * 10) as u8);
            }
        }
    }

    let checksum = format!("{:x}", hasher.finalize());
    log::info!("Checksum calculated: {}", checksum);
    Ok(checksum)
}

/// Async wrapper: runs the streaming hash on the blocking thread pool so a
/// multi-gigabyte read does not stall the runtime.
pub async fn hash_file(
    path: impl Into<PathBuf>,
    on_progress: impl FnMut(u8) + Send + 'static,
) -> Result<String, OperationError> {
    let path = path.into();
    tokio::task::spawn_blocking(move || hash_file_blocking(&path, on_progress))
        .await
        .map_err(|e| OperationError::ExternalTool(format!("checksum task failed: {}", e)))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use std::sync::{Arc, Mutex};

    fn write_temp(content: &[u8]) -> (tempfile::TempDir, PathBuf) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("file.bin");
        let mut f = File::create(&path).unwrap();
        f.write_all(content).unwrap();
        (dir, path)
    }

    #[test]
    fn test_same_bytes_hash_identically() {
        let (_d1, p1) = write_temp(b"the quick brown fox");
        let (_d2, p2) = write_temp(b"the quick brown fox");
        let h1 = hash_file_blocking(&p1, |_| {}).unwrap();
        let h2 = hash_file_blocking(&p2, |_| {}).unwrap();
        assert_eq!(h1, h2);
    }

    #[test]
    fn test_different_bytes_hash_differently() {
        let (_d1, p1) = write_temp(b"the quick brown fox");
        let (_d2, p2) = write_temp(b"the quick brown fix");
        let h1 = hash_file_blocking(&p1, |_| {}).unwrap();
        let h2 = hash_file_blocking(&p2, |_| {}).unwrap();
        assert_ne!(h1, h2);
    }

    #[test]
    fn test_known_digest() {
        let (_d, p) = write_temp(b"abc");
        let h = hash_file_blocking(&p, |_| {}).unwrap();
        assert_eq!(h, "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad");
    }

    #[test]
    fn test_empty_file() {
        let (_d, p) = write_temp(b"");
        let h = hash_file_blocking(&p, |_| {}).unwrap();
        assert_eq!(h, "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855");
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let err = hash_file_blocking(Path::new("/nonexistent/file.bin"), |_| {}).unwrap_err();
        assert!(matches!(err, OperationError::Io(_)));
    }

    #[tokio::test]
    async fn test_progress_reports_completion() {
        // Single-chunk read: every decile boundary is crossed at once,
        // so 100% must still be the final report.
        let (_d, p) = write_temp(&vec![7u8; 4096]);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen2 = Arc::clone(&seen);
        hash_file(p, move |pct| seen2.lock().unwrap().push(pct)).await.unwrap();
        let seen = seen.lock().unwrap();
        assert_eq!(*seen.last().unwrap(), 100);
    }
}
