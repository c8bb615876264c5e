use std::fs::File;
use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};

pub fn sha256_hex(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = [0_u8; 8192];
    loop {
        let read = file
            .read(&mut buf)
            .with_context(|| format!("failed to read {}", path.display()))?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn sha256_hex_of_empty_input() {
        assert_eq!(sha256_hex(b""), EMPTY_SHA256);
    }

    #[test]
    fn sha256_file_matches_in_memory_digest() {
        let path = std::env::temp_dir().join(format!(
            "rigger-security-checksum-{}.txt",
            std::process::id()
        ));
        std::fs::write(&path, b"hello rigger\n").expect("must write file");

        let digest = sha256_file(&path).expect("must hash file");
        assert_eq!(digest, sha256_hex(b"hello rigger\n"));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn sha256_file_errors_for_missing_file() {
        let path = std::env::temp_dir().join("rigger-security-checksum-missing.bin");
        assert!(sha256_file(&path).is_err());
    }
}
