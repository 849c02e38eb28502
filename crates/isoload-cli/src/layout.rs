//! Deployment layout checks.
//!
//! Answers, without opening any binary, where every reference and native
//! library of a deployed module would be bound from.

use std::fmt::{self, Display, Formatter};
use std::path::PathBuf;

use isoload_core::binary::library_file_name;
use isoload_core::config::HostConfig;
use isoload_core::descriptor::ModuleDescriptor;
use isoload_core::error::LoadError;
use isoload_core::resolver::{DependencyResolver, NativeTarget, Resolution};
use isoload_core::shared;

/// Where a dependency would come from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Origin {
    Private(PathBuf),
    Shared(PathBuf),
    System(String),
    Missing,
}

impl Display for Origin {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        match self {
            Origin::Private(path) => write!(f, "private  {}", path.display()),
            Origin::Shared(path) => write!(f, "shared   {}", path.display()),
            Origin::System(name) => write!(f, "system   {}", library_file_name(name)),
            Origin::Missing => write!(f, "MISSING"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LayoutEntry {
    pub kind: &'static str,
    pub id: String,
    pub origin: Origin,
}

/// Result of checking one deployment directory.
#[derive(Debug, Clone)]
pub struct LayoutReport {
    pub descriptor: ModuleDescriptor,
    pub binary_found: bool,
    pub entries: Vec<LayoutEntry>,
}

impl LayoutReport {
    pub fn is_ok(&self) -> bool {
        self.binary_found && self.entries.iter().all(|e| e.origin != Origin::Missing)
    }

    pub fn problems(&self) -> usize {
        let missing = self
            .entries
            .iter()
            .filter(|e| e.origin == Origin::Missing)
            .count();
        missing + usize::from(!self.binary_found)
    }
}

impl Display for LayoutReport {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        writeln!(f, "Module:    {}", self.descriptor)?;
        writeln!(f, "Directory: {}", self.descriptor.directory.display())?;
        writeln!(
            f,
            "Binary:    {}",
            if self.binary_found { "found" } else { "MISSING" }
        )?;
        if let Some(symbols) = &self.descriptor.debug_symbols {
            writeln!(f, "Symbols:   {}", symbols.display())?;
        }
        if self.entries.is_empty() {
            writeln!(f, "No references or native libraries declared.")?;
        }
        for entry in &self.entries {
            writeln!(f, "  {:<9} {:<20} {}", entry.kind, entry.id, entry.origin)?;
        }
        Ok(())
    }
}

/// Check the deployment directory named by `config`.
pub fn check_layout(config: &HostConfig) -> Result<LayoutReport, LoadError> {
    let binary = config.binary_path();
    let descriptor = ModuleDescriptor::from_directory(&config.plugin_dir, binary.as_deref())?;
    let resolver = DependencyResolver::new(
        descriptor.name.clone(),
        descriptor.directory.clone(),
        &descriptor.manifest,
    );

    let mut entries = Vec::new();
    for id in &descriptor.manifest.references {
        let origin = match resolver.resolve(id)? {
            Resolution::Private(path) => Origin::Private(path),
            Resolution::Shared => shared::locate(id, &config.shared_search_paths)
                .map(|candidate| Origin::Shared(candidate.path))
                .unwrap_or(Origin::Missing),
        };
        entries.push(LayoutEntry {
            kind: "reference",
            id: id.clone(),
            origin,
        });
    }
    for name in descriptor.manifest.native.keys() {
        let origin = match resolver.resolve_native(name)? {
            NativeTarget::Private(path) => Origin::Private(path),
            NativeTarget::System(name) => Origin::System(name),
        };
        entries.push(LayoutEntry {
            kind: "native",
            id: name.clone(),
            origin,
        });
    }

    Ok(LayoutReport {
        binary_found: descriptor.binary.is_file(),
        descriptor,
        entries,
    })
}
