//! Module manifest: descriptors, validation and the version-update record.

mod descriptor;
mod versions;

pub use descriptor::{DeviceProfile, LibDescriptor, LibInfo, Manifest, ModuleDescriptor};
pub use versions::{ManifestVersions, VersionStartup};
