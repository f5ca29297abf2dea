//! Package signature verification against the host's signing certificates.

use std::collections::HashSet;
use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use crate::integrity::checksum::sha256_bytes;
use crate::Result;

const CERT_DIR: &str = "META-INF/";
const CERT_EXTENSIONS: &[&str] = &[".RSA", ".DSA", ".EC"];
/// Certificate blocks are a few KiB. Anything larger is never trusted.
const MAX_CERTIFICATE_SIZE: u64 = 1 << 20;

/// Decides whether a package was signed by the same party as the host.
pub trait SignatureVerifier: Send + Sync {
    /// `Ok(false)` means the package is readable but not trusted.
    fn verify(&self, package: &Path) -> Result<bool>;
}

/// Compares the package's signing certificate blocks with the SHA-256
/// digests of the host's own certificates.
///
/// Every certificate in the package must be trusted and there must be at
/// least one.
#[derive(Debug, Clone, Default)]
pub struct CertificateVerifier {
    trusted: HashSet<String>,
}

impl CertificateVerifier {
    pub fn new<I, S>(trusted_digests: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            trusted: trusted_digests
                .into_iter()
                .map(|d| d.as_ref().to_ascii_lowercase())
                .collect(),
        }
    }

    fn is_certificate_entry(name: &str) -> bool {
        let upper = name.to_ascii_uppercase();
        upper.starts_with(CERT_DIR)
            && !upper[CERT_DIR.len()..].contains('/')
            && CERT_EXTENSIONS.iter().any(|ext| upper.ends_with(ext))
    }

    /// SHA-256 digests of every signing certificate block in `package`.
    ///
    /// A block over [`MAX_CERTIFICATE_SIZE`] is not read in full; it yields
    /// a placeholder that matches no digest.
    pub fn package_certificates(package: &Path) -> Result<Vec<String>> {
        let mut archive = zip::ZipArchive::new(BufReader::new(File::open(package)?))?;
        let mut digests = Vec::new();

        for i in 0..archive.len() {
            let mut entry = archive.by_index(i)?;
            if entry.is_dir() || !Self::is_certificate_entry(entry.name()) {
                continue;
            }
            let mut data = Vec::new();
            (&mut entry).take(MAX_CERTIFICATE_SIZE + 1).read_to_end(&mut data)?;
            if data.len() as u64 > MAX_CERTIFICATE_SIZE {
                log::warn!("{}: certificate block {} is too large", package.display(), entry.name());
                digests.push(format!("oversized:{}", entry.name()));
                continue;
            }
            digests.push(sha256_bytes(&data));
        }

        Ok(digests)
    }
}

impl SignatureVerifier for CertificateVerifier {
    fn verify(&self, package: &Path) -> Result<bool> {
        let certificates = Self::package_certificates(package)?;
        if certificates.is_empty() {
            log::warn!("{} carries no signing certificate", package.display());
            return Ok(false);
        }

        let untrusted = certificates
            .iter()
            .filter(|digest| !self.trusted.contains(*digest))
            .count();
        if untrusted > 0 {
            log::warn!(
                "{} has {} certificate(s) not trusted by the host",
                package.display(),
                untrusted
            );
        }
        Ok(untrusted == 0)
    }
}
