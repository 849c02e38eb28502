//! Module descriptor and deployment manifest.
//!
//! A module is deployed as a directory holding the binary, an optional
//! debug-symbol file, an optional `plugin.toml` manifest and the module's
//! private dependency files. The layout is read, never written.

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use std::path::{Path, PathBuf};

use semver::{Version, VersionReq};
use serde::Deserialize;

use crate::binary::library_file_name;
use crate::config::defaults;
use crate::error::LoadError;

/// Parsed `plugin.toml`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct DeploymentManifest {
    /// Declared module name
    pub name: Option<String>,

    /// Module version (informational)
    pub version: Option<Version>,

    /// Binary file name, relative to the deployment directory
    pub binary: Option<PathBuf>,

    /// Dependencies the module needs bound at load time
    pub references: Vec<String>,

    /// Private dependency closure: identifier -> version requirement
    pub dependencies: BTreeMap<String, VersionReq>,

    /// Native libraries: identifier -> version requirement
    pub native: BTreeMap<String, VersionReq>,
}

impl DeploymentManifest {
    /// Parse a manifest document.
    pub fn from_toml_str(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }

    /// Read the manifest from a deployment directory. A missing manifest is an
    /// empty one.
    pub fn read_from_dir(dir: &Path) -> Result<Self, LoadError> {
        let path = dir.join(defaults::MANIFEST_FILE);
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(&path).map_err(|e| LoadError::ManifestInvalid {
            path: path.clone(),
            reason: e.to_string(),
        })?;
        Self::from_toml_str(&content).map_err(|e| LoadError::ManifestInvalid {
            path,
            reason: e.to_string(),
        })
    }
}

/// Everything needed to load one module. Read once at load.
#[derive(Debug, Clone)]
pub struct ModuleDescriptor {
    /// Declared module name
    pub name: String,

    /// Path of the module binary
    pub binary: PathBuf,

    /// Debug-symbol file, if one was found next to the binary
    pub debug_symbols: Option<PathBuf>,

    /// Deployment directory
    pub directory: PathBuf,

    /// Deployment manifest
    pub manifest: DeploymentManifest,
}

impl ModuleDescriptor {
    /// Build a descriptor from a deployment directory.
    ///
    /// The binary is taken from `binary_override`, then the manifest's `binary`,
    /// then the platform file name of the manifest's `name`, then the platform
    /// file name of the default module name. The binary's existence is not
    /// checked here; loading reports a missing binary.
    pub fn from_directory(dir: &Path, binary_override: Option<&Path>) -> Result<Self, LoadError> {
        let manifest = DeploymentManifest::read_from_dir(dir)?;

        let binary = match (binary_override, &manifest.binary, &manifest.name) {
            (Some(binary), _, _) => dir.join(binary),
            (None, Some(binary), _) => dir.join(binary),
            (None, None, Some(name)) => dir.join(library_file_name(name)),
            (None, None, None) => dir.join(library_file_name(defaults::PLUGIN_NAME)),
        };

        let name = manifest
            .name
            .clone()
            .unwrap_or_else(|| module_name_from_path(&binary));

        Ok(Self {
            name,
            debug_symbols: find_debug_symbols(&binary),
            directory: dir.to_path_buf(),
            binary,
            manifest,
        })
    }
}

impl Display for ModuleDescriptor {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match &self.manifest.version {
            Some(version) => write!(f, "{} v{} ({})", self.name, version, self.binary.display()),
            None => write!(f, "{} ({})", self.name, self.binary.display()),
        }
    }
}

/// Module name from a binary path: file stem without the platform library prefix.
pub fn module_name_from_path(path: &Path) -> String {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or(defaults::PLUGIN_NAME);
    let prefix = std::env::consts::DLL_PREFIX;
    if !prefix.is_empty() {
        if let Some(stripped) = stem.strip_prefix(prefix) {
            return stripped.to_string();
        }
    }
    stem.to_string()
}

/// Candidate debug-symbol files for a binary, in lookup order.
fn debug_symbol_candidates(binary: &Path) -> Vec<PathBuf> {
    let mut with_debug = binary.as_os_str().to_owned();
    with_debug.push(".debug");
    let mut with_dsym = binary.as_os_str().to_owned();
    with_dsym.push(".dSYM");

    vec![
        binary.with_extension("pdb"),
        PathBuf::from(with_debug),
        PathBuf::from(with_dsym),
    ]
}

fn find_debug_symbols(binary: &Path) -> Option<PathBuf> {
    debug_symbol_candidates(binary)
        .into_iter()
        .find(|candidate| candidate.exists())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_manifest() {
        let manifest = DeploymentManifest::from_toml_str(
            r#"
            name = "greeter"
            version = "0.3.1"
            references = ["codec", "runtime"]

            [dependencies]
            codec = "^1.2"

            [native]
            zstd = "*"
            "#,
        )
        .unwrap();

        assert_eq!(manifest.name.as_deref(), Some("greeter"));
        assert_eq!(manifest.version, Some(Version::new(0, 3, 1)));
        assert_eq!(manifest.references, vec!["codec", "runtime"]);
        assert!(manifest.dependencies["codec"].matches(&Version::new(1, 4, 0)));
        assert!(!manifest.dependencies["codec"].matches(&Version::new(2, 0, 0)));
        assert_eq!(manifest.native["zstd"], VersionReq::STAR);
    }

    #[test]
    fn test_manifest_rejects_unknown_fields() {
        assert!(DeploymentManifest::from_toml_str("entry = \"main\"").is_err());
    }

    #[test]
    fn test_manifest_rejects_bad_requirement() {
        let result = DeploymentManifest::from_toml_str("[dependencies]\ncodec = \"not-a-req\"");
        assert!(result.is_err());
    }

    #[test]
    fn test_descriptor_without_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let descriptor = ModuleDescriptor::from_directory(dir.path(), None).unwrap();

        assert_eq!(descriptor.name, defaults::PLUGIN_NAME);
        assert_eq!(
            descriptor.binary,
            dir.path().join(library_file_name(defaults::PLUGIN_NAME))
        );
        assert!(descriptor.debug_symbols.is_none());
        assert_eq!(descriptor.manifest, DeploymentManifest::default());
    }

    #[test]
    fn test_descriptor_binary_precedence() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join(defaults::MANIFEST_FILE),
            "name = \"greeter\"\n",
        )
        .unwrap();

        let descriptor = ModuleDescriptor::from_directory(dir.path(), None).unwrap();
        assert_eq!(descriptor.name, "greeter");
        assert_eq!(descriptor.binary, dir.path().join(library_file_name("greeter")));

        let descriptor =
            ModuleDescriptor::from_directory(dir.path(), Some(Path::new("custom.bin"))).unwrap();
        assert_eq!(descriptor.binary, dir.path().join("custom.bin"));
        assert_eq!(descriptor.name, "greeter");
    }

    #[test]
    fn test_descriptor_finds_debug_symbols() {
        let dir = tempfile::tempdir().unwrap();
        let binary = dir.path().join(library_file_name("greeter"));
        std::fs::write(&binary, b"").unwrap();
        let pdb = binary.with_extension("pdb");
        std::fs::write(&pdb, b"").unwrap();

        let descriptor = ModuleDescriptor::from_directory(dir.path(), Some(&binary)).unwrap();
        assert_eq!(descriptor.debug_symbols, Some(pdb));
        assert_eq!(descriptor.name, "greeter");
    }

    #[test]
    fn test_invalid_manifest_reported() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join(defaults::MANIFEST_FILE), "references = 3").unwrap();

        let result = ModuleDescriptor::from_directory(dir.path(), None);
        assert!(matches!(result, Err(LoadError::ManifestInvalid { .. })));
    }
}
