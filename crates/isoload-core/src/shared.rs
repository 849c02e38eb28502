//! Process-wide shared dependency registry.
//!
//! Shared dependencies are loaded at most once per identifier and then served
//! to every context that asks. They outlive all contexts. Concurrent first
//! requests for the same identifier race on a per-identifier [`OnceCell`]:
//! exactly one loader runs, the rest block and reuse its result.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use once_cell::sync::{Lazy, OnceCell};
use parking_lot::Mutex;
use semver::Version;

use crate::binary::{BinaryLoader, ModuleBinary};
use crate::error::LoadError;
use crate::resolver::{Candidate, find_candidates};

/// A dependency loaded into the shared space.
pub struct SharedDependency {
    id: String,
    version: Option<Version>,
    binary: Box<dyn ModuleBinary>,
    loaded_at: chrono::DateTime<chrono::Utc>,
}

impl SharedDependency {
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Path the dependency was loaded from.
    pub fn origin(&self) -> &Path {
        self.binary.path()
    }

    pub fn version(&self) -> Option<&Version> {
        self.version.as_ref()
    }

    pub fn loaded_at(&self) -> chrono::DateTime<chrono::Utc> {
        self.loaded_at
    }
}

impl std::fmt::Debug for SharedDependency {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedDependency")
            .field("id", &self.id)
            .field("version", &self.version)
            .field("origin", &self.origin())
            .field("loaded_at", &self.loaded_at)
            .finish()
    }
}

type Slot = Arc<OnceCell<Arc<SharedDependency>>>;

static GLOBAL: Lazy<Arc<SharedRegistry>> = Lazy::new(|| Arc::new(SharedRegistry::new()));

/// Registry of shared dependencies.
#[derive(Default)]
pub struct SharedRegistry {
    slots: Mutex<HashMap<String, Slot>>,
    loads: AtomicUsize,
}

impl SharedRegistry {
    /// A fresh, independent registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry.
    pub fn global() -> Arc<SharedRegistry> {
        GLOBAL.clone()
    }

    /// Get `id`, loading it from `search_paths` on first request.
    pub fn get_or_load(
        &self,
        id: &str,
        search_paths: &[PathBuf],
        loader: &dyn BinaryLoader,
    ) -> Result<Arc<SharedDependency>, LoadError> {
        let slot = self.slot(id);
        slot.get_or_try_init(|| {
            let candidate = locate(id, search_paths).ok_or_else(|| {
                LoadError::DependencyUnresolved {
                    id: id.to_string(),
                    searched: search_paths.to_vec(),
                }
            })?;
            let binary = loader.open(&candidate.path)?;
            self.loads.fetch_add(1, Ordering::SeqCst);
            tracing::info!(
                "Loaded shared dependency '{}' from {}",
                id,
                candidate.path.display()
            );
            Ok(Arc::new(SharedDependency {
                id: id.to_string(),
                version: candidate.version,
                binary,
                loaded_at: chrono::Utc::now(),
            }))
        })
        .cloned()
    }

    /// A dependency already loaded, without triggering a load.
    pub fn get(&self, id: &str) -> Option<Arc<SharedDependency>> {
        let slots = self.slots.lock();
        slots.get(id).and_then(|slot| slot.get().cloned())
    }

    /// Identifiers currently loaded.
    pub fn loaded_ids(&self) -> Vec<String> {
        let slots = self.slots.lock();
        let mut ids = slots
            .iter()
            .filter(|(_, slot)| slot.get().is_some())
            .map(|(id, _)| id.clone())
            .collect::<Vec<_>>();
        ids.sort();
        ids
    }

    /// Number of successful loads performed by this registry.
    pub fn load_count(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    fn slot(&self, id: &str) -> Slot {
        let mut slots = self.slots.lock();
        slots.entry(id.to_string()).or_default().clone()
    }
}

/// First search path holding a usable file for `id`; the highest version wins
/// within a directory.
pub fn locate(id: &str, search_paths: &[PathBuf]) -> Option<Candidate> {
    search_paths
        .iter()
        .find_map(|dir| find_candidates(dir, id).into_iter().max_by(|a, b| a.version.cmp(&b.version)))
}
