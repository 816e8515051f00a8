//! Module backends
//!
//! A backend turns an entry binary into a [`ModuleImage`] from which plugin
//! types are instantiated, and loads private dependencies on behalf of an
//! isolation boundary. [`BackendSet`] picks the backend for a binary.

use bulwark_sdk::{Plugin, PluginError, ResourceLimits};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Loads entry binaries and private dependencies
pub trait ModuleBackend: Send + Sync {
    fn name(&self) -> &'static str;

    /// Whether this backend handles the binary at `path`
    fn supports(&self, path: &Path) -> bool;

    /// Open an entry binary
    fn open(
        &self,
        path: &Path,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn ModuleImage>, PluginError>;

    /// Load a private dependency module
    fn open_dependency(&self, path: &Path) -> Result<Box<dyn LoadedModule>, PluginError>;
}

/// A loaded entry binary
pub trait ModuleImage: Send + Sync {
    /// Names of the plugin types the binary exports
    fn exported_types(&self) -> Vec<String>;

    /// Construct an instance of `type_name`
    ///
    /// Returns `None` when the binary does not export that type.
    fn instantiate(&self, type_name: &str) -> Option<Result<Box<dyn Plugin>, PluginError>>;
}

/// A private dependency held in a boundary's handle table
pub trait LoadedModule: Send + Sync {
    fn path(&self) -> &Path;
}

/// Ordered set of backends; the first one that supports a binary wins
#[derive(Clone, Default)]
pub struct BackendSet {
    backends: Vec<Arc<dyn ModuleBackend>>,
}

impl BackendSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, backend: Arc<dyn ModuleBackend>) -> Self {
        self.backends.push(backend);
        self
    }

    pub fn select(&self, path: &Path) -> Option<Arc<dyn ModuleBackend>> {
        self.backends
            .iter()
            .find(|b| b.supports(path))
            .map(Arc::clone)
    }

    pub fn names(&self) -> Vec<&'static str> {
        self.backends.iter().map(|b| b.name()).collect()
    }
}

/// Constructor for a plugin type registered with the static backend
pub type StaticFactory = Arc<dyn Fn() -> Result<Box<dyn Plugin>, PluginError> + Send + Sync>;

/// In-process plugin types, keyed by entry binary file name
///
/// Used for plugins bundled with the host. The entry binary must still exist
/// on disk and is read on open, so verification and install flows are
/// identical to the dynamic backends.
#[derive(Default)]
pub struct StaticBackend {
    modules: HashMap<String, HashMap<String, StaticFactory>>,
}

impl StaticBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `type_name` as exported by the binary named `binary`
    pub fn register<F>(mut self, binary: &str, type_name: &str, factory: F) -> Self
    where
        F: Fn() -> Result<Box<dyn Plugin>, PluginError> + Send + Sync + 'static,
    {
        self.modules
            .entry(binary.to_string())
            .or_default()
            .insert(type_name.to_string(), Arc::new(factory));
        self
    }

    fn binary_name(path: &Path) -> Option<&str> {
        path.file_name().and_then(|n| n.to_str())
    }
}

impl ModuleBackend for StaticBackend {
    fn name(&self) -> &'static str {
        "static"
    }

    fn supports(&self, path: &Path) -> bool {
        Self::binary_name(path).is_some_and(|name| self.modules.contains_key(name))
    }

    fn open(
        &self,
        path: &Path,
        _limits: &ResourceLimits,
    ) -> Result<Box<dyn ModuleImage>, PluginError> {
        std::fs::metadata(path)?;

        let types = Self::binary_name(path)
            .and_then(|name| self.modules.get(name))
            .ok_or_else(|| {
                PluginError::Runtime(format!("no bundled module for {}", path.display()))
            })?;

        Ok(Box::new(StaticImage {
            types: types.clone(),
        }))
    }

    fn open_dependency(&self, path: &Path) -> Result<Box<dyn LoadedModule>, PluginError> {
        let bytes = std::fs::read(path)?;
        Ok(Box::new(StaticDependency {
            path: path.to_path_buf(),
            _bytes: bytes,
        }))
    }
}

struct StaticImage {
    types: HashMap<String, StaticFactory>,
}

impl ModuleImage for StaticImage {
    fn exported_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }

    fn instantiate(&self, type_name: &str) -> Option<Result<Box<dyn Plugin>, PluginError>> {
        self.types.get(type_name).map(|factory| factory())
    }
}

struct StaticDependency {
    path: PathBuf,
    _bytes: Vec<u8>,
}

impl LoadedModule for StaticDependency {
    fn path(&self) -> &Path {
        &self.path
    }
}
