//! Content hashing for packages and extracted artifacts.

use std::fs::File;
use std::io::{self, BufReader, Read, Write};
use std::path::Path;

use md5::Md5;
use sha2::{Digest, Sha256};

use crate::Result;

/// Supported checksum types
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumType {
    Md5,
    Sha256,
}

impl ChecksumType {
    /// Detect checksum type from length of hex string
    pub fn from_hex_length(len: usize) -> Option<Self> {
        match len {
            32 => Some(ChecksumType::Md5),
            64 => Some(ChecksumType::Sha256),
            _ => None,
        }
    }
}

fn hash_reader<D: Digest, R: Read>(mut reader: R) -> io::Result<String> {
    let mut hasher = D::new();
    let mut buffer = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Compute the checksum of a file, streaming its content.
pub fn compute_checksum(path: &Path, checksum_type: ChecksumType) -> Result<String> {
    let reader = BufReader::new(File::open(path)?);
    let digest = match checksum_type {
        ChecksumType::Md5 => hash_reader::<Md5, _>(reader)?,
        ChecksumType::Sha256 => hash_reader::<Sha256, _>(reader)?,
    };
    Ok(digest)
}

/// Compute the MD5 checksum of a file
pub fn compute_md5(path: &Path) -> Result<String> {
    compute_checksum(path, ChecksumType::Md5)
}

/// SHA-256 of an in-memory buffer.
pub fn sha256_bytes(data: &[u8]) -> String {
    hex_encode(&Sha256::digest(data))
}

/// Verify checksum of a file
pub fn verify_checksum(path: &Path, expected: &str, checksum_type: ChecksumType) -> Result<bool> {
    let actual = compute_checksum(path, checksum_type)?;
    Ok(actual.eq_ignore_ascii_case(expected))
}

/// Check a file against a declared hash and size.
///
/// When `expected_hash` is not a recognizable digest, falls back to
/// comparing the byte length with `expected_size`.
pub fn verify_content(path: &Path, expected_hash: &str, expected_size: u64) -> Result<bool> {
    match ChecksumType::from_hex_length(expected_hash.len()) {
        Some(checksum_type) => verify_checksum(path, expected_hash, checksum_type),
        None => {
            log::warn!(
                "No usable hash for {}, comparing length only",
                path.display()
            );
            let actual = std::fs::metadata(path)?.len();
            Ok(actual == expected_size)
        }
    }
}

/// Writer adapter that hashes everything written through it.
pub struct HashingWriter<W> {
    inner: W,
    hasher: Md5,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Md5::new(),
            written: 0,
        }
    }

    /// Bytes written so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    /// Finish hashing, returning the inner writer and the MD5 hex digest.
    pub fn finish(self) -> (W, String) {
        (self.inner, hex_encode(&self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
