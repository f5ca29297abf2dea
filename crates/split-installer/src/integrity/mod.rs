//! Integrity checks: content hashes and signing certificates.

mod checksum;
mod signature;

pub use checksum::{
    compute_checksum, compute_md5, sha256_bytes, verify_checksum, verify_content, ChecksumType,
    HashingWriter,
};
pub use signature::{CertificateVerifier, SignatureVerifier};
