use std::path::{Path, PathBuf};

use crate::error::{Result, SplitError};
use crate::extract::{ArtifactPlan, ExtractOptions, ExtractionEngine, Packaging};
use crate::manifest::ModuleDescriptor;
use crate::paths::PathStore;

/// Extracts a module's native libraries into `nativeLib/<abi>/`.
pub struct NativeLibExtractor<'a> {
    paths: &'a PathStore,
    options: ExtractOptions,
}

impl<'a> NativeLibExtractor<'a> {
    pub fn new(paths: &'a PathStore, options: ExtractOptions) -> Self {
        Self { paths, options }
    }

    fn plans(module: &ModuleDescriptor) -> Vec<ArtifactPlan> {
        let Some(info) = &module.lib_info else {
            return Vec::new();
        };
        info.libs
            .iter()
            .map(|lib| ArtifactPlan {
                entry: format!("lib/{}/{}", info.abi, lib.name),
                file_name: lib.name.clone(),
                expected_md5: Some(lib.md5.clone()),
                expected_size: Some(lib.size),
                packaging: Packaging::Raw,
            })
            .collect()
    }

    /// Extract every declared library. Returns the library directory, or
    /// `None` when the module has no native code.
    pub fn extract(&self, module: &ModuleDescriptor, package: &Path) -> Result<Option<PathBuf>> {
        let Some(info) = module.lib_info.as_ref().filter(|_| module.has_native_libs()) else {
            return Ok(None);
        };

        let fail = |e: SplitError| SplitError::LibExtractFailed {
            module: module.name.clone(),
            reason: e.to_string(),
        };

        let dir = self.paths.native_lib_dir(module, &info.abi).map_err(fail)?;
        let engine = ExtractionEngine::new(&dir, self.options.clone());
        engine
            .extract(package, &module.md5, &Self::plans(module))
            .map_err(fail)?;
        Ok(Some(dir))
    }
}
