//! Integrity: whole-file content fingerprint (SHA-256, lowercase hex) and comparison.

use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

use sha2::{Digest, Sha256};

const READ_BUF_LEN: usize = 8 * 1024;

/// Fingerprint a byte slice.
pub fn fingerprint(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Fingerprint everything readable from `reader`.
pub fn fingerprint_reader<R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; READ_BUF_LEN];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

/// Fingerprint a file on disk.
pub fn fingerprint_file(path: &Path) -> io::Result<String> {
    fingerprint_reader(File::open(path)?)
}

/// Compare two hex fingerprints, ignoring ASCII case.
pub fn fingerprints_match(local: &str, claimed: &str) -> bool {
    local.eq_ignore_ascii_case(claimed)
}
