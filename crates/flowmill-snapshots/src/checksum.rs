//! Snapshot directory checksums.
//!
//! Every persisted snapshot carries a `CHECKSUM` file of the form
//! `sha256 <hex>`, where the digest covers every other file in the directory
//! in file-name order (the name bytes, then the content bytes). Renaming or
//! altering any file breaks verification.

use sha2::{Digest, Sha256};
use std::fs;
use std::io::{self, Read};
use std::path::Path;

pub const CHECKSUM_FILE: &str = "CHECKSUM";

const ALGORITHM: &str = "sha256";

/// Compute the combined digest of every file in `dir` except the `CHECKSUM`
/// file itself. Synchronous; callers run it on a blocking worker.
pub fn compute(dir: &Path) -> io::Result<String> {
    let mut names: Vec<String> = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name().to_string_lossy().into_owned();
        if name != CHECKSUM_FILE && entry.file_type()?.is_file() {
            names.push(name);
        }
    }
    names.sort();

    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    for name in &names {
        hasher.update(name.as_bytes());
        let mut file = fs::File::open(dir.join(name))?;
        loop {
            let read = file.read(&mut buffer)?;
            if read == 0 {
                break;
            }
            hasher.update(&buffer[..read]);
        }
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Write the `CHECKSUM` file for `dir`.
pub fn write(dir: &Path) -> io::Result<()> {
    let digest = compute(dir)?;
    let contents = format!("{ALGORITHM} {digest}\n");
    fs::write(dir.join(CHECKSUM_FILE), contents)?;
    // Make the checksum durable before the snapshot becomes visible.
    fs::File::open(dir.join(CHECKSUM_FILE))?.sync_all()?;
    Ok(())
}

/// Verify `dir` against its `CHECKSUM` file. A missing or malformed checksum
/// file counts as a verification failure, not an error.
pub fn verify(dir: &Path) -> io::Result<bool> {
    let recorded = match fs::read_to_string(dir.join(CHECKSUM_FILE)) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(err),
    };
    let mut parts = recorded.split_whitespace();
    let algorithm = parts.next();
    let digest = parts.next();
    if algorithm != Some(ALGORITHM) {
        return Ok(false);
    }
    let Some(digest) = digest else {
        return Ok(false);
    };
    Ok(compute(dir)? == digest)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_write_then_verify() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("000001.sst"), b"payload").unwrap();
        write(dir.path()).unwrap();
        assert!(verify(dir.path()).unwrap());
    }

    #[test]
    fn test_tampered_file_fails_verification() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("000001.sst"), b"payload").unwrap();
        write(dir.path()).unwrap();
        fs::write(dir.path().join("000001.sst"), b"<--corrupted-->").unwrap();
        assert!(!verify(dir.path()).unwrap());
    }

    #[test]
    fn test_added_file_fails_verification() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("000001.sst"), b"payload").unwrap();
        write(dir.path()).unwrap();
        fs::write(dir.path().join("000002.sst"), b"extra").unwrap();
        assert!(!verify(dir.path()).unwrap());
    }

    #[test]
    fn test_renamed_file_fails_verification() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("000001.sst"), b"payload").unwrap();
        write(dir.path()).unwrap();
        fs::rename(
            dir.path().join("000001.sst"),
            dir.path().join("000009.sst"),
        )
        .unwrap();
        assert!(!verify(dir.path()).unwrap());
    }

    #[test]
    fn test_missing_checksum_file_fails_verification() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("000001.sst"), b"payload").unwrap();
        assert!(!verify(dir.path()).unwrap());
    }

    #[test]
    fn test_checksum_file_records_algorithm() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join("000001.sst"), b"payload").unwrap();
        write(dir.path()).unwrap();
        let recorded = fs::read_to_string(dir.path().join(CHECKSUM_FILE)).unwrap();
        assert!(recorded.starts_with("sha256 "));
    }
}
