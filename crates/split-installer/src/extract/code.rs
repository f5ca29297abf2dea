use std::path::{Path, PathBuf};

use crate::error::{Result, SplitError};
use crate::extract::{ArtifactPlan, ExtractOptions, ExtractionEngine, Packaging};
use crate::manifest::ModuleDescriptor;
use crate::paths::PathStore;

const PRIMARY_ENTRY: &str = "classes.dex";

/// Repackages a module's secondary code archives (`classes2.dex`,
/// `classes3.dex`, ...) into single-entry zips under `code_cache/`, for
/// hosts that can only address one archive per file.
pub struct SecondaryCodeExtractor<'a> {
    paths: &'a PathStore,
    options: ExtractOptions,
}

impl<'a> SecondaryCodeExtractor<'a> {
    pub fn new(paths: &'a PathStore, options: ExtractOptions) -> Self {
        Self { paths, options }
    }

    fn archive_name(module: &ModuleDescriptor, index: u32) -> String {
        format!("{}.classes{}.zip", module.name, index)
    }

    fn plans(module: &ModuleDescriptor) -> Vec<ArtifactPlan> {
        (2..=module.dex_number)
            .map(|i| ArtifactPlan {
                entry: format!("classes{}.dex", i),
                file_name: Self::archive_name(module, i),
                expected_md5: None,
                expected_size: None,
                packaging: Packaging::Archive {
                    entry_name: PRIMARY_ENTRY.to_string(),
                },
            })
            .collect()
    }

    /// Extract every secondary archive, returning their paths in order.
    pub fn extract(&self, module: &ModuleDescriptor, package: &Path) -> Result<Vec<PathBuf>> {
        if module.secondary_archive_count() == 0 {
            return Ok(Vec::new());
        }

        let fail = |e: SplitError| SplitError::DexExtractFailed {
            module: module.name.clone(),
            reason: e.to_string(),
        };

        let dir = self.paths.code_cache_dir(module).map_err(fail)?;
        let extraction = ExtractionEngine::new(&dir, self.options.clone())
            .extract(package, &module.md5, &Self::plans(module))
            .map_err(fail)?;
        Ok(extraction.files)
    }

    /// Paths of previously extracted archives that are still on disk.
    pub fn existing(&self, module: &ModuleDescriptor) -> Result<Vec<PathBuf>> {
        if module.secondary_archive_count() == 0 {
            return Ok(Vec::new());
        }
        let dir = self.paths.code_cache_dir(module)?;
        Ok((2..=module.dex_number)
            .map(|i| dir.join(Self::archive_name(module, i)))
            .filter(|p| p.is_file())
            .collect())
    }
}
