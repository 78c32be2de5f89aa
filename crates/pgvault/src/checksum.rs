use std::fs;
use std::io::Read;
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const BUFFER_SIZE: usize = 64 * 1024;

/// Streams the file and returns its hex-encoded SHA-256 digest.
pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path).map_err(|e| {
        Error::io(format!(
            "failed to open {} for checksum: {e}",
            path.display()
        ))
    })?;

    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUFFER_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| Error::io(format!("failed to read {}: {e}", path.display())))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Compares the file's digest against an expected hex string,
/// case-insensitively.
pub fn verify_file(path: &Path, expected: &str) -> Result<bool> {
    let actual = sha256_file(path)?;
    Ok(actual.eq_ignore_ascii_case(expected.trim()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn digest_is_deterministic_and_correct() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("payload.dump");
        fs::write(&path, b"hello backup").expect("write");

        let first = sha256_file(&path).expect("hash");
        let second = sha256_file(&path).expect("hash again");
        assert_eq!(first, second);
        assert_eq!(first.len(), 64);

        assert!(verify_file(&path, &first.to_uppercase()).expect("verify"));
        assert!(!verify_file(&path, &"0".repeat(64)).expect("verify mismatch"));
    }

    #[test]
    fn single_byte_change_changes_digest() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("payload.dump");
        fs::write(&path, b"aaaa").expect("write");
        let before = sha256_file(&path).expect("hash");
        fs::write(&path, b"aaab").expect("rewrite");
        let after = sha256_file(&path).expect("hash");
        assert_ne!(before, after);
    }

    #[test]
    fn unreadable_path_is_io_error() {
        let err = sha256_file(Path::new("/nonexistent/backup.dump")).unwrap_err();
        assert_eq!(err.class(), "IOError");
    }
}
