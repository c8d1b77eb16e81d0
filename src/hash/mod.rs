// Content fingerprinting using BLAKE3

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::constants::HASH_CHUNK_SIZE;
use crate::error::{Result, TaktError};

/// Compute the full BLAKE3 content fingerprint of a file.
/// Format: "blake3:<hex>"
pub fn compute_fingerprint(path: &Path) -> Result<String> {
    let mut file = File::open(path)
        .map_err(|e| TaktError::Storage(format!("Failed to open {}: {}", path.display(), e)))?;

    let mut hasher = blake3::Hasher::new();
    let mut buffer = vec![0u8; HASH_CHUNK_SIZE];

    loop {
        let bytes_read = file
            .read(&mut buffer)
            .map_err(|e| TaktError::Storage(format!("Failed to read {}: {}", path.display(), e)))?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}

/// Verify a file matches its stored fingerprint.
pub fn verify_fingerprint(path: &Path, expected: &str) -> Result<bool> {
    let actual = compute_fingerprint(path)?;
    Ok(actual == expected)
}

/// The hex portion of a fingerprint, used for blob filenames.
pub fn fingerprint_hex(fingerprint: &str) -> &str {
    fingerprint
        .strip_prefix("blake3:")
        .unwrap_or(fingerprint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_fingerprint_prefix() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"Hello, World!").unwrap();

        let fp = compute_fingerprint(file.path()).unwrap();
        assert!(fp.starts_with("blake3:"));
        assert_eq!(fingerprint_hex(&fp).len(), 64);
    }

    #[test]
    fn test_same_content_same_fingerprint() {
        let mut a = NamedTempFile::new().unwrap();
        a.write_all(b"same content").unwrap();
        let mut b = NamedTempFile::new().unwrap();
        b.write_all(b"same content").unwrap();

        assert_eq!(
            compute_fingerprint(a.path()).unwrap(),
            compute_fingerprint(b.path()).unwrap()
        );
    }

    #[test]
    fn test_verify_detects_mismatch() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(b"original").unwrap();
        let fp = compute_fingerprint(file.path()).unwrap();

        assert!(verify_fingerprint(file.path(), &fp).unwrap());
        assert!(!verify_fingerprint(file.path(), "blake3:deadbeef").unwrap());
    }
}
