//! File verification utilities (MD5 checksums and size checks).

use crate::error::TransferError;
use std::path::Path;
use tracing::{debug, info};

/// Computes the MD5 hash of a local file.
///
/// Reads in 1 MiB chunks on a blocking thread so large files neither sit in
/// memory nor stall the async runtime.
pub(crate) async fn compute_file_md5(path: &Path) -> Result<String, TransferError> {
    let path = path.to_path_buf();

    tokio::task::spawn_blocking(move || -> Result<String, TransferError> {
        use md5::{Digest, Md5};
        use std::io::Read;

        let file = std::fs::File::open(&path)?;
        let mut reader = std::io::BufReader::with_capacity(1024 * 1024, file);
        let mut hasher = Md5::new();
        let mut buffer = vec![0u8; 1024 * 1024];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(format!("{:x}", hasher.finalize()))
    })
    .await
    .map_err(|e| TransferError::Other(format!("Task join error: {}", e)))?
}

/// Returns the ETag as an MD5 digest when it is one.
///
/// Multipart uploads carry `<md5>-<parts>` ETags that say nothing about the
/// content hash; those yield `None`.
pub(crate) fn simple_etag(etag: Option<&str>) -> Option<String> {
    let etag = etag?.trim_matches('"');
    if etag.len() == 32 && etag.chars().all(|c| c.is_ascii_hexdigit()) {
        Some(etag.to_ascii_lowercase())
    } else {
        None
    }
}

/// Checks a finished file against the listed ETag.
pub(crate) async fn verify_etag(path: &Path, etag: Option<&str>) -> Result<(), TransferError> {
    let Some(expected) = simple_etag(etag) else {
        return Ok(());
    };
    let actual = compute_file_md5(path).await?;
    if actual != expected {
        return Err(TransferError::Inconsistent(format!(
            "MD5 mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        )));
    }
    debug!("MD5 verified for {}", path.display());
    Ok(())
}

/// Whether `path` already holds the complete object.
///
/// The size must match; when a simple ETag is known the MD5 must match too.
pub(crate) async fn is_complete(
    path: &Path,
    size: u64,
    etag: Option<&str>,
) -> Result<bool, TransferError> {
    let metadata = match tokio::fs::metadata(path).await {
        Ok(m) if m.is_file() => m,
        _ => return Ok(false),
    };

    if metadata.len() != size {
        debug!(
            "Size mismatch for {}: local={} bytes, remote={} bytes",
            path.display(),
            metadata.len(),
            size
        );
        return Ok(false);
    }

    match verify_etag(path, etag).await {
        Ok(()) => {
            info!("File {} already complete, skipping", path.display());
            Ok(true)
        }
        Err(TransferError::Inconsistent(msg)) => {
            info!("{}", msg);
            Ok(false)
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_simple_etag() {
        assert_eq!(
            simple_etag(Some("\"5D41402ABC4B2A76B9719D911017C592\"")),
            Some("5d41402abc4b2a76b9719d911017c592".to_string())
        );
        assert_eq!(simple_etag(Some("5d41402abc4b2a76b9719d911017c592-3")), None);
        assert_eq!(simple_etag(Some("")), None);
        assert_eq!(simple_etag(None), None);
    }

    #[tokio::test]
    async fn test_compute_and_verify_md5() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        std::fs::write(&path, b"hello").unwrap();

        let md5 = compute_file_md5(&path).await.unwrap();
        assert_eq!(md5, "5d41402abc4b2a76b9719d911017c592");

        assert!(verify_etag(&path, Some(&md5)).await.is_ok());
        let err = verify_etag(&path, Some("00000000000000000000000000000000"))
            .await
            .unwrap_err();
        assert!(err.is_transient());
    }

    #[tokio::test]
    async fn test_is_complete() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("hello.txt");
        assert!(!is_complete(&path, 5, None).await.unwrap());

        std::fs::write(&path, b"hello").unwrap();
        assert!(is_complete(&path, 5, None).await.unwrap());
        assert!(!is_complete(&path, 6, None).await.unwrap());
        assert!(is_complete(&path, 5, Some("5d41402abc4b2a76b9719d911017c592"))
            .await
            .unwrap());
        assert!(!is_complete(&path, 5, Some("00000000000000000000000000000000"))
            .await
            .unwrap());
    }
}
