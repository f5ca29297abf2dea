//! Cross-process safe extraction of sub-artifacts from a module package.
//!
//! Both extractors (native libraries and secondary code archives) share one
//! protocol, implemented by [`ExtractionEngine`]:
//!
//! 1. Lock the destination directory.
//! 2. Unless forced, accept an earlier extraction whose recorded provenance
//!    still matches every file on disk.
//! 3. Otherwise write each artifact to a temp file in the destination,
//!    verify it, and rename it into place. Failed attempts are retried and
//!    their temp files discarded.
//! 4. Persist the provenance record.

mod code;
mod native;

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::{self, BufReader, BufWriter};
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Result, SplitError};
use crate::integrity::{compute_md5, HashingWriter};
use crate::lock::FileLock;
use crate::util::{atomic_write, remove_file_if_exists, retry};

pub use code::SecondaryCodeExtractor;
pub use native::NativeLibExtractor;

const LOCK_FILE: &str = ".extract.lock";
const RECORD_FILE: &str = ".extract.json";

/// Settings shared by both extractors.
#[derive(Debug, Clone)]
pub struct ExtractOptions {
    pub max_attempts: u32,
    pub lock_timeout: Option<Duration>,
    /// Skip validation of an existing extraction.
    pub force: bool,
}

impl Default for ExtractOptions {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            lock_timeout: None,
            force: false,
        }
    }
}

/// How an artifact is stored in the destination directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packaging {
    /// Copied byte for byte.
    Raw,
    /// Wrapped into a single-entry zip archive under `entry_name`.
    Archive { entry_name: String },
}

/// One artifact to extract from the package.
#[derive(Debug, Clone)]
pub struct ArtifactPlan {
    /// Entry name inside the source package.
    pub entry: String,
    /// File name inside the destination directory.
    pub file_name: String,
    /// Expected MD5 of the produced file, when known up front.
    pub expected_md5: Option<String>,
    pub expected_size: Option<u64>,
    pub packaging: Packaging,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct ArtifactRecord {
    md5: String,
    size: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ExtractionRecord {
    source_hash: String,
    artifacts: BTreeMap<String, ArtifactRecord>,
}

/// Outcome of an extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Extraction {
    /// Extracted files, in plan order.
    pub files: Vec<PathBuf>,
    /// Whether an earlier extraction was reused.
    pub reused: bool,
}

/// Extracts artifacts into one destination directory.
#[derive(Debug, Clone)]
pub struct ExtractionEngine {
    dest_dir: PathBuf,
    options: ExtractOptions,
}

impl ExtractionEngine {
    pub fn new(dest_dir: impl Into<PathBuf>, options: ExtractOptions) -> Self {
        Self {
            dest_dir: dest_dir.into(),
            options,
        }
    }

    pub fn dest_dir(&self) -> &Path {
        &self.dest_dir
    }

    /// Extract `plans` from `package`, whose content hash is `source_hash`.
    pub fn extract(&self, package: &Path, source_hash: &str, plans: &[ArtifactPlan]) -> Result<Extraction> {
        fs::create_dir_all(&self.dest_dir)?;
        let _lock = FileLock::acquire(self.dest_dir.join(LOCK_FILE), self.options.lock_timeout)?;

        if !self.options.force {
            if let Some(files) = self.validate_existing(source_hash, plans) {
                log::debug!(
                    "Reusing {} extracted artifact(s) in {}",
                    files.len(),
                    self.dest_dir.display()
                );
                return Ok(Extraction { files, reused: true });
            }
        }

        let files = self.extract_fresh(package, source_hash, plans)?;
        log::info!(
            "Extracted {} artifact(s) into {}",
            files.len(),
            self.dest_dir.display()
        );
        Ok(Extraction { files, reused: false })
    }

    fn record_path(&self) -> PathBuf {
        self.dest_dir.join(RECORD_FILE)
    }

    fn read_record(&self) -> Option<ExtractionRecord> {
        let data = fs::read(self.record_path()).ok()?;
        serde_json::from_slice(&data).ok()
    }

    /// Files of an earlier extraction, if all of them still check out.
    fn validate_existing(&self, source_hash: &str, plans: &[ArtifactPlan]) -> Option<Vec<PathBuf>> {
        let record = self.read_record()?;
        if !record.source_hash.eq_ignore_ascii_case(source_hash) {
            log::debug!("Extraction in {} came from another package", self.dest_dir.display());
            return None;
        }

        let mut files = Vec::with_capacity(plans.len());
        for plan in plans {
            let expected = record.artifacts.get(&plan.file_name)?;
            if let Some(md5) = &plan.expected_md5 {
                if !md5.eq_ignore_ascii_case(&expected.md5) {
                    return None;
                }
            }

            let path = self.dest_dir.join(&plan.file_name);
            let size = fs::metadata(&path).ok()?.len();
            if size != expected.size {
                log::warn!("{} has unexpected size {}", path.display(), size);
                return None;
            }
            let md5 = compute_md5(&path).ok()?;
            if !md5.eq_ignore_ascii_case(&expected.md5) {
                log::warn!("{} does not match its recorded hash", path.display());
                return None;
            }
            files.push(path);
        }

        Some(files)
    }

    fn extract_fresh(&self, package: &Path, source_hash: &str, plans: &[ArtifactPlan]) -> Result<Vec<PathBuf>> {
        let mut archive = ZipArchive::new(BufReader::new(File::open(package)?))?;

        for plan in plans {
            if archive.index_for_name(&plan.entry).is_none() {
                return Err(SplitError::Io(io::Error::new(
                    io::ErrorKind::NotFound,
                    format!("{} not found in {}", plan.entry, package.display()),
                )));
            }
        }

        // A record must never vouch for a half-replaced set of files.
        remove_file_if_exists(&self.record_path())?;
        self.remove_stale(plans)?;

        let mut record = ExtractionRecord {
            source_hash: source_hash.to_string(),
            artifacts: BTreeMap::new(),
        };
        let mut files = Vec::with_capacity(plans.len());

        for plan in plans {
            let what = format!("Extracting {}", plan.entry);
            let (path, artifact) = retry(self.options.max_attempts, &what, |_| {
                self.extract_one(&mut archive, plan)
            })?;
            record.artifacts.insert(plan.file_name.clone(), artifact);
            files.push(path);
        }

        atomic_write(&self.record_path(), &serde_json::to_vec_pretty(&record)?)?;
        Ok(files)
    }

    /// Delete visible files that the current plan does not produce.
    fn remove_stale(&self, plans: &[ArtifactPlan]) -> Result<()> {
        for entry in fs::read_dir(&self.dest_dir)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') || !entry.file_type()?.is_file() {
                continue;
            }
            if !plans.iter().any(|p| p.file_name == name) {
                log::debug!("Removing stale artifact {}", entry.path().display());
                remove_file_if_exists(&entry.path())?;
            }
        }
        Ok(())
    }

    fn extract_one<R>(&self, archive: &mut ZipArchive<R>, plan: &ArtifactPlan) -> Result<(PathBuf, ArtifactRecord)>
    where
        R: io::Read + io::Seek,
    {
        let mut entry = archive.by_name(&plan.entry)?;
        // Temp files start with '.', so they never show up as artifacts.
        let tmp = NamedTempFile::new_in(&self.dest_dir)?;

        let artifact = match &plan.packaging {
            Packaging::Raw => {
                let mut writer = HashingWriter::new(BufWriter::new(tmp.as_file()));
                io::copy(&mut entry, &mut writer)?;
                let size = writer.written();
                let (buffered, md5) = writer.finish();
                buffered.into_inner().map_err(|e| e.into_error())?.sync_all()?;

                if let Some(expected) = plan.expected_size.filter(|s| *s > 0) {
                    if expected != size {
                        return Err(SplitError::ChecksumMismatch { module: plan.entry.clone() });
                    }
                }
                if let Some(expected) = &plan.expected_md5 {
                    if !expected.eq_ignore_ascii_case(&md5) {
                        return Err(SplitError::ChecksumMismatch { module: plan.entry.clone() });
                    }
                }
                ArtifactRecord { md5, size }
            }
            Packaging::Archive { entry_name } => {
                let source_size = entry.size();
                let mut zip = ZipWriter::new(BufWriter::new(tmp.as_file()));
                let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);
                zip.start_file(entry_name.as_str(), options)?;

                let mut writer = HashingWriter::new(&mut zip);
                io::copy(&mut entry, &mut writer)?;
                let written = writer.written();
                let (_, content_md5) = writer.finish();
                zip.finish()?.into_inner().map_err(|e| e.into_error())?.sync_all()?;

                if written != source_size {
                    return Err(SplitError::ChecksumMismatch { module: plan.entry.clone() });
                }
                // Read the archive back; this also checks the entry CRC.
                let reread_md5 = archive_entry_md5(tmp.path(), entry_name)?;
                if reread_md5 != content_md5 {
                    return Err(SplitError::ChecksumMismatch { module: plan.entry.clone() });
                }

                ArtifactRecord {
                    md5: compute_md5(tmp.path())?,
                    size: fs::metadata(tmp.path())?.len(),
                }
            }
        };

        let path = self.dest_dir.join(&plan.file_name);
        tmp.persist(&path).map_err(|e| SplitError::Io(e.error))?;
        Ok((path, artifact))
    }
}

/// MD5 of the uncompressed content of `entry_name` inside a zip file.
pub(crate) fn archive_entry_md5(path: &Path, entry_name: &str) -> Result<String> {
    let mut archive = ZipArchive::new(BufReader::new(File::open(path)?))?;
    let mut entry = archive.by_name(entry_name)?;
    let mut writer = HashingWriter::new(io::sink());
    io::copy(&mut entry, &mut writer)?;
    Ok(writer.finish().1)
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::fs::File;
    use std::io::Write;
    use std::path::Path;

    use zip::write::SimpleFileOptions;

    /// Write a zip file containing `entries`.
    pub fn write_package(path: &Path, entries: &[(&str, &[u8])]) {
        let mut writer = zip::ZipWriter::new(File::create(path).unwrap());
        for (name, data) in entries {
            writer.start_file(*name, SimpleFileOptions::default()).unwrap();
            writer.write_all(data).unwrap();
        }
        writer.finish().unwrap();
    }

    pub fn md5_hex(data: &[u8]) -> String {
        use md5::{Digest, Md5};
        Md5::digest(data).iter().map(|b| format!("{:02x}", b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::test_support::{md5_hex, write_package};
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use tempfile::TempDir;

    fn raw_plan(entry: &str, file_name: &str, data: &[u8]) -> ArtifactPlan {
        ArtifactPlan {
            entry: entry.to_string(),
            file_name: file_name.to_string(),
            expected_md5: Some(md5_hex(data)),
            expected_size: Some(data.len() as u64),
            packaging: Packaging::Raw,
        }
    }

    #[test]
    fn test_fresh_then_reused() {
        let dir = TempDir::new().unwrap();
        let package = dir.path().join("m.pkg");
        write_package(&package, &[("lib/x86/liba.so", b"aaaa"), ("lib/x86/libb.so", b"bb")]);
        let plans = vec![
            raw_plan("lib/x86/liba.so", "liba.so", b"aaaa"),
            raw_plan("lib/x86/libb.so", "libb.so", b"bb"),
        ];
        let engine = ExtractionEngine::new(dir.path().join("out"), ExtractOptions::default());

        let first = engine.extract(&package, "hash", &plans).unwrap();
        assert!(!first.reused);
        assert_eq!(fs::read(&first.files[0]).unwrap(), b"aaaa");
        assert_eq!(fs::read(&first.files[1]).unwrap(), b"bb");

        let second = engine.extract(&package, "hash", &plans).unwrap();
        assert!(second.reused);
        assert_eq!(second.files, first.files);
    }

    #[test]
    fn test_tampered_file_triggers_fresh_extraction() {
        let dir = TempDir::new().unwrap();
        let package = dir.path().join("m.pkg");
        write_package(&package, &[("lib/x86/liba.so", b"aaaa")]);
        let plans = vec![raw_plan("lib/x86/liba.so", "liba.so", b"aaaa")];
        let engine = ExtractionEngine::new(dir.path().join("out"), ExtractOptions::default());

        let first = engine.extract(&package, "hash", &plans).unwrap();
        fs::write(&first.files[0], b"evil").unwrap();

        let second = engine.extract(&package, "hash", &plans).unwrap();
        assert!(!second.reused);
        assert_eq!(fs::read(&second.files[0]).unwrap(), b"aaaa");
    }

    #[test]
    fn test_new_source_hash_triggers_fresh_extraction_and_removes_stale() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out");
        let engine = ExtractionEngine::new(&out, ExtractOptions::default());

        let old_package = dir.path().join("old.pkg");
        write_package(&old_package, &[("lib/x86/libold.so", b"old")]);
        engine
            .extract(&old_package, "old", &[raw_plan("lib/x86/libold.so", "libold.so", b"old")])
            .unwrap();

        let new_package = dir.path().join("new.pkg");
        write_package(&new_package, &[("lib/x86/libnew.so", b"new")]);
        let result = engine
            .extract(&new_package, "new", &[raw_plan("lib/x86/libnew.so", "libnew.so", b"new")])
            .unwrap();

        assert!(!result.reused);
        assert!(!out.join("libold.so").exists());
        assert!(out.join("libnew.so").exists());
    }

    #[test]
    fn test_hash_mismatch_fails_without_visible_output() {
        let dir = TempDir::new().unwrap();
        let package = dir.path().join("m.pkg");
        write_package(&package, &[("lib/x86/liba.so", b"aaaa")]);
        let mut plan = raw_plan("lib/x86/liba.so", "liba.so", b"aaaa");
        plan.expected_md5 = Some(md5_hex(b"something else"));
        let out = dir.path().join("out");
        let engine = ExtractionEngine::new(&out, ExtractOptions::default());

        let result = engine.extract(&package, "hash", &[plan]);
        assert!(matches!(result, Err(SplitError::ChecksumMismatch { .. })));

        let visible: Vec<_> = fs::read_dir(&out)
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|n| !n.starts_with('.'))
            .collect();
        assert!(visible.is_empty(), "unexpected files: {:?}", visible);
        assert!(!out.join(RECORD_FILE).exists());
    }

    #[test]
    fn test_missing_entry_is_an_error() {
        let dir = TempDir::new().unwrap();
        let package = dir.path().join("m.pkg");
        write_package(&package, &[("other", b"x")]);
        let engine = ExtractionEngine::new(dir.path().join("out"), ExtractOptions::default());

        let result = engine.extract(&package, "hash", &[raw_plan("lib/x86/liba.so", "liba.so", b"a")]);
        assert!(matches!(result, Err(SplitError::Io(_))));
    }

    #[test]
    fn test_archive_packaging() {
        let dir = TempDir::new().unwrap();
        let package = dir.path().join("m.pkg");
        write_package(&package, &[("classes2.dex", b"second dex")]);
        let plan = ArtifactPlan {
            entry: "classes2.dex".into(),
            file_name: "m.classes2.zip".into(),
            expected_md5: None,
            expected_size: None,
            packaging: Packaging::Archive { entry_name: "classes.dex".into() },
        };
        let engine = ExtractionEngine::new(dir.path().join("out"), ExtractOptions::default());

        let result = engine.extract(&package, "hash", &[plan.clone()]).unwrap();
        assert_eq!(
            archive_entry_md5(&result.files[0], "classes.dex").unwrap(),
            md5_hex(b"second dex")
        );
        assert!(engine.extract(&package, "hash", &[plan]).unwrap().reused);
    }

    #[test]
    fn test_concurrent_extractions_only_expose_verified_files() {
        let dir = TempDir::new().unwrap();
        let package = Arc::new(dir.path().join("m.pkg"));
        let payload = vec![7u8; 256 * 1024];
        write_package(&package, &[("lib/x86/libbig.so", &payload)]);
        let expected_md5 = md5_hex(&payload);
        let out = dir.path().join("out");
        fs::create_dir_all(&out).unwrap();

        let writers: Vec<_> = (0..4)
            .map(|_| {
                let package = package.clone();
                let out = out.clone();
                let plan = raw_plan("lib/x86/libbig.so", "libbig.so", &payload);
                thread::spawn(move || {
                    let options = ExtractOptions { force: true, ..Default::default() };
                    let engine = ExtractionEngine::new(out, options);
                    for _ in 0..3 {
                        engine.extract(&package, "hash", &[plan.clone()]).unwrap();
                    }
                })
            })
            .collect();

        let reader = {
            let out = out.clone();
            let expected_md5 = expected_md5.clone();
            thread::spawn(move || {
                for _ in 0..50 {
                    for entry in fs::read_dir(&out).unwrap() {
                        let entry = entry.unwrap();
                        let name = entry.file_name().to_string_lossy().into_owned();
                        if name.starts_with('.') {
                            continue;
                        }
                        if let Ok(md5) = compute_md5(&entry.path()) {
                            assert_eq!(md5, expected_md5, "{} was visible before verification", name);
                        }
                    }
                }
            })
        };

        for writer in writers {
            writer.join().unwrap();
        }
        reader.join().unwrap();
        assert_eq!(compute_md5(&out.join("libbig.so")).unwrap(), expected_md5);
    }
}
