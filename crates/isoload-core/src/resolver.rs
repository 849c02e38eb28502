//! Per-context dependency resolution.
//!
//! A dependency declared in the module's manifest and present as a compatible
//! file in its deployment directory resolves privately; everything else is
//! deferred to the process-wide shared space. Answers are memoized, so an
//! identifier resolves to the same origin for the lifetime of the context.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use semver::{Version, VersionReq};

use crate::config::defaults;
use crate::descriptor::DeploymentManifest;
use crate::error::LoadError;

/// Where a module dependency lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// A file inside the module's deployment directory, loaded into its context
    Private(PathBuf),
    /// Deferred to the shared dependency registry
    Shared,
}

/// Where a native library is opened from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NativeTarget {
    /// A file inside the module's deployment directory
    Private(PathBuf),
    /// A bare library name handed to the platform loader
    System(String),
}

/// A dependency file found on disk.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    /// Version parsed from the file name; `None` for unversioned files
    pub version: Option<Version>,
    pub path: PathBuf,
}

/// Resolves dependency identifiers for one isolated context.
#[derive(Debug)]
pub struct DependencyResolver {
    context: String,
    module_dir: PathBuf,
    closure: BTreeMap<String, VersionReq>,
    native: BTreeMap<String, VersionReq>,
    resolved: Mutex<HashMap<String, Resolution>>,
    resolved_native: Mutex<HashMap<String, NativeTarget>>,
    invalidated: AtomicBool,
}

impl DependencyResolver {
    /// Create a resolver for a module deployed in `module_dir`.
    pub fn new(
        context: impl Into<String>,
        module_dir: impl Into<PathBuf>,
        manifest: &DeploymentManifest,
    ) -> Self {
        Self {
            context: context.into(),
            module_dir: module_dir.into(),
            closure: manifest.dependencies.clone(),
            native: manifest.native.clone(),
            resolved: Mutex::new(HashMap::new()),
            resolved_native: Mutex::new(HashMap::new()),
            invalidated: AtomicBool::new(false),
        }
    }

    /// Resolve a module dependency.
    pub fn resolve(&self, id: &str) -> Result<Resolution, LoadError> {
        self.ensure_valid()?;

        let mut resolved = self.resolved.lock();
        if let Some(resolution) = resolved.get(id) {
            return Ok(resolution.clone());
        }

        let resolution = match self.private_match(&self.closure, id) {
            Some(path) => {
                tracing::debug!(
                    "[{}] dependency '{}' resolved privately to {}",
                    self.context,
                    id,
                    path.display()
                );
                Resolution::Private(path)
            }
            None => {
                tracing::debug!("[{}] dependency '{}' deferred to shared space", self.context, id);
                Resolution::Shared
            }
        };

        resolved.insert(id.to_string(), resolution.clone());
        Ok(resolution)
    }

    /// Resolve a native library.
    pub fn resolve_native(&self, name: &str) -> Result<NativeTarget, LoadError> {
        self.ensure_valid()?;

        let mut resolved = self.resolved_native.lock();
        if let Some(target) = resolved.get(name) {
            return Ok(target.clone());
        }

        let target = match self.private_match(&self.native, name) {
            Some(path) => NativeTarget::Private(path),
            None => NativeTarget::System(name.to_string()),
        };
        tracing::debug!("[{}] native library '{}' -> {:?}", self.context, name, target);

        resolved.insert(name.to_string(), target.clone());
        Ok(target)
    }

    /// Refuse every further lookup.
    pub fn invalidate(&self) {
        self.invalidated.store(true, Ordering::SeqCst);
    }

    pub fn is_invalidated(&self) -> bool {
        self.invalidated.load(Ordering::SeqCst)
    }

    /// Identifiers resolved so far, with their origin.
    pub fn resolutions(&self) -> BTreeMap<String, Resolution> {
        self.resolved
            .lock()
            .iter()
            .map(|(id, resolution)| (id.clone(), resolution.clone()))
            .collect()
    }

    /// Directories scanned for private files.
    pub fn private_dirs(&self) -> [PathBuf; 2] {
        [
            self.module_dir.clone(),
            self.module_dir.join(defaults::PRIVATE_DEPS_DIR),
        ]
    }

    fn ensure_valid(&self) -> Result<(), LoadError> {
        if self.is_invalidated() {
            return Err(LoadError::ContextUnloading(self.context.clone()));
        }
        Ok(())
    }

    fn private_match(&self, declared: &BTreeMap<String, VersionReq>, id: &str) -> Option<PathBuf> {
        let requirement = declared.get(id)?;
        let candidates = self
            .private_dirs()
            .iter()
            .flat_map(|dir| find_candidates(dir, id))
            .collect::<Vec<_>>();
        best_match(candidates, requirement).map(|c| c.path)
    }
}

/// Scan `dir` for files providing `id`: `<prefix><id>-<version><suffix>` or
/// `<prefix><id><suffix>`. The platform library prefix is optional.
pub fn find_candidates(dir: &Path, id: &str) -> Vec<Candidate> {
    let Ok(entries) = std::fs::read_dir(dir) else {
        return Vec::new();
    };

    entries
        .flatten()
        .filter_map(|entry| {
            let path = entry.path();
            if !path.is_file() {
                return None;
            }
            let file_name = path.file_name()?.to_str()?;
            let version = parse_candidate_name(file_name, id)?;
            Some(Candidate { version, path })
        })
        .collect()
}

/// `Some(version)` if `file_name` provides `id`; the inner `None` marks an
/// unversioned file.
fn parse_candidate_name(file_name: &str, id: &str) -> Option<Option<Version>> {
    let stem = file_name.strip_suffix(std::env::consts::DLL_SUFFIX)?;
    let prefix = std::env::consts::DLL_PREFIX;
    let stem = if prefix.is_empty() {
        stem
    } else {
        stem.strip_prefix(prefix).unwrap_or(stem)
    };

    if stem == id {
        return Some(None);
    }
    let version = stem.strip_prefix(id)?.strip_prefix('-')?;
    Version::parse(version).ok().map(Some)
}

/// The strongest compatible candidate: the highest version satisfying
/// `requirement`. Unversioned files only satisfy a wildcard requirement and
/// rank below any versioned match.
pub fn best_match(candidates: Vec<Candidate>, requirement: &VersionReq) -> Option<Candidate> {
    candidates
        .into_iter()
        .filter(|c| match &c.version {
            Some(version) => requirement.matches(version),
            None => *requirement == VersionReq::STAR,
        })
        .max_by(|a, b| a.version.cmp(&b.version).then_with(|| b.path.cmp(&a.path)))
}
