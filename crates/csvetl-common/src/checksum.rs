//! SHA-256 fingerprints for source files

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Compute the hex SHA-256 of a file, streaming it in fixed-size chunks
pub fn fingerprint_file(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    fingerprint(&mut file)
}

/// Compute the hex SHA-256 of any readable source
pub fn fingerprint<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = [0u8; 8192];

    loop {
        let bytes_read = reader.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use std::io::{Cursor, Write};

    #[test]
    fn test_fingerprint_known_value() {
        let mut cursor = Cursor::new(b"hello world");
        let checksum = fingerprint(&mut cursor).unwrap();
        assert_eq!(checksum, "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9");
    }

    #[test]
    fn test_fingerprint_file_matches_reader() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"id,amt\n1,10\n").unwrap();

        let from_file = fingerprint_file(file.path()).unwrap();
        let from_reader = fingerprint(&mut Cursor::new(b"id,amt\n1,10\n")).unwrap();
        assert_eq!(from_file, from_reader);
    }

    #[test]
    fn test_fingerprint_missing_file_is_io_error() {
        let err = fingerprint_file("/definitely/not/here.csv").unwrap_err();
        assert!(matches!(err, crate::CommonError::Io(_)));
    }
}
