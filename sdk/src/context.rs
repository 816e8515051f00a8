//! Sandboxed context handed to plugins
//!
//! `PluginContext` is the sole API surface through which a plugin reaches the
//! host. It exposes controlled access through handles that wrap host-side
//! implementations without revealing host internals:
//!
//! - `LogHandle`: a logger tagged with the plugin id
//! - `ServiceLocator`: capability-gated host services
//! - `ModuleHandle`: dependency resolution through the plugin's isolation boundary
//!
//! Services are looked up, never assumed: `ServiceLocator::get` returns `None`
//! when the service is absent or its permission was not granted.

use crate::errors::PluginError;
use crate::manifest::ResourceLimits;
use crate::permissions::{Permission, PermissionSet};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Log severity for plugin log records
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Handle for plugin logging
#[derive(Clone)]
pub struct LogHandle {
    inner: Arc<dyn LogHandleImpl>,
}

impl LogHandle {
    /// Create a new LogHandle with the given implementation
    pub fn new(inner: Arc<dyn LogHandleImpl>) -> Self {
        Self { inner }
    }

    /// A handle that discards every record
    pub fn null() -> Self {
        Self::new(Arc::new(NullLog))
    }

    pub fn debug(&self, message: &str) {
        self.inner.log(LogLevel::Debug, message);
    }

    pub fn info(&self, message: &str) {
        self.inner.log(LogLevel::Info, message);
    }

    pub fn warn(&self, message: &str) {
        self.inner.log(LogLevel::Warn, message);
    }

    pub fn error(&self, message: &str) {
        self.inner.log(LogLevel::Error, message);
    }
}

impl Default for LogHandle {
    fn default() -> Self {
        Self::null()
    }
}

/// Trait for log handle implementation (to be implemented by the host)
pub trait LogHandleImpl: Send + Sync {
    fn log(&self, level: LogLevel, message: &str);
}

/// Logger that drops every record
pub struct NullLog;

impl LogHandleImpl for NullLog {
    fn log(&self, _level: LogLevel, _message: &str) {}
}

/// Outcome of resolving a dependency through the isolation boundary
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    /// Use the host's already-loaded copy
    Shared { name: String },
    /// Loaded from the plugin's private dependency closure
    Private { name: String, path: PathBuf },
    /// Not part of the plugin's closure; the dependency is simply unused
    NotFound,
}

/// Handle for dependency resolution inside the plugin's isolation boundary
#[derive(Clone)]
pub struct ModuleHandle {
    inner: Arc<dyn ModuleHandleImpl>,
}

impl ModuleHandle {
    /// Create a new ModuleHandle with the given implementation
    pub fn new(inner: Arc<dyn ModuleHandleImpl>) -> Self {
        Self { inner }
    }

    /// A handle bound to no boundary, for exercising plugins outside a host
    ///
    /// Resolves nothing and denies native libraries.
    pub fn detached() -> Self {
        Self::new(Arc::new(Detached))
    }

    /// Resolve a named dependency
    ///
    /// Fails with `PluginError::SecurityViolation` for denied modules.
    pub fn resolve(&self, name: &str) -> Result<Resolution, PluginError> {
        self.inner.resolve(name)
    }

    /// Attempt to load a native library. Always denied for plugins.
    pub fn load_native_library(&self, name: &str) -> Result<(), PluginError> {
        self.inner.load_native_library(name)
    }
}

/// Trait for module handle implementation (implemented by the isolation boundary)
pub trait ModuleHandleImpl: Send + Sync {
    fn resolve(&self, name: &str) -> Result<Resolution, PluginError>;

    fn load_native_library(&self, name: &str) -> Result<(), PluginError>;
}

struct Detached;

impl ModuleHandleImpl for Detached {
    fn resolve(&self, _name: &str) -> Result<Resolution, PluginError> {
        Ok(Resolution::NotFound)
    }

    fn load_native_library(&self, name: &str) -> Result<(), PluginError> {
        Err(PluginError::NativeLibraryDenied {
            plugin_id: String::new(),
            library: name.to_string(),
        })
    }
}

struct ServiceEntry {
    permission: Permission,
    service: Arc<dyn Any + Send + Sync>,
}

/// Host services keyed by type, each gated by one permission
#[derive(Default)]
pub struct ServiceCatalog {
    services: HashMap<TypeId, ServiceEntry>,
}

impl ServiceCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a service that requires `permission`
    pub fn register<T: Any + Send + Sync>(&mut self, permission: Permission, service: Arc<T>) {
        self.services.insert(
            TypeId::of::<T>(),
            ServiceEntry {
                permission,
                service,
            },
        );
    }

    /// Builder-style variant of `register`
    pub fn with<T: Any + Send + Sync>(mut self, permission: Permission, service: Arc<T>) -> Self {
        self.register(permission, service);
        self
    }

    pub fn len(&self) -> usize {
        self.services.len()
    }

    pub fn is_empty(&self) -> bool {
        self.services.is_empty()
    }
}

/// Capability-gated view of the host's service catalog for one plugin
#[derive(Clone)]
pub struct ServiceLocator {
    catalog: Arc<ServiceCatalog>,
    granted: PermissionSet,
}

impl ServiceLocator {
    pub fn new(catalog: Arc<ServiceCatalog>, granted: PermissionSet) -> Self {
        Self { catalog, granted }
    }

    /// Look up a service; `None` when absent or its permission was not granted
    pub fn get<T: Any + Send + Sync>(&self) -> Option<Arc<T>> {
        let entry = self.catalog.services.get(&TypeId::of::<T>())?;
        if !self.granted.contains(&entry.permission) {
            return None;
        }
        Arc::clone(&entry.service).downcast::<T>().ok()
    }
}

/// The capability-scoped handle a loaded plugin uses to reach the host
#[derive(Clone)]
pub struct PluginContext {
    plugin_id: String,
    storage_dir: PathBuf,
    host_version: String,
    granted: PermissionSet,
    limits: ResourceLimits,
    log: LogHandle,
    services: ServiceLocator,
    modules: ModuleHandle,
}

impl PluginContext {
    /// Create a new PluginContext. Called by the host loader.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        plugin_id: impl Into<String>,
        storage_dir: PathBuf,
        host_version: impl Into<String>,
        granted: PermissionSet,
        limits: ResourceLimits,
        log: LogHandle,
        catalog: Arc<ServiceCatalog>,
        modules: ModuleHandle,
    ) -> Self {
        let services = ServiceLocator::new(catalog, granted.clone());
        Self {
            plugin_id: plugin_id.into(),
            storage_dir,
            host_version: host_version.into(),
            granted,
            limits,
            log,
            services,
            modules,
        }
    }

    pub fn plugin_id(&self) -> &str {
        &self.plugin_id
    }

    /// Private storage directory, created by the host before `on_load`
    pub fn storage_dir(&self) -> &Path {
        &self.storage_dir
    }

    pub fn host_version(&self) -> &str {
        &self.host_version
    }

    pub fn granted_permissions(&self) -> &PermissionSet {
        &self.granted
    }

    pub fn has_permission(&self, permission: Permission) -> bool {
        self.granted.contains(&permission)
    }

    pub fn resource_limits(&self) -> &ResourceLimits {
        &self.limits
    }

    pub fn log(&self) -> &LogHandle {
        &self.log
    }

    pub fn services(&self) -> &ServiceLocator {
        &self.services
    }

    pub fn modules(&self) -> &ModuleHandle {
        &self.modules
    }
}
