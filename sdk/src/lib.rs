//! Bulwark SDK
//!
//! Shared library providing the traits and types plugin authors compile
//! against. This crate is used by both the engine and plugins.

/// Plugin capability interface
pub mod plugin;

/// Sandboxed context handed to plugins
pub mod context;

/// Error types and handling
pub mod errors;

/// Manifest types
pub mod manifest;

/// Capability names
pub mod permissions;

/// Native plugin ABI
pub mod abi;

// Re-export commonly used types
pub use abi::{PluginDeclaration, PluginFactory, PluginRegistrar, PLUGIN_API_VERSION};
pub use context::{
    LogHandle, LogHandleImpl, LogLevel, ModuleHandle, ModuleHandleImpl, NullLog, PluginContext,
    Resolution, ServiceCatalog, ServiceLocator,
};
pub use errors::{ErrorExt, PluginError};
pub use manifest::{
    Compatibility, DependencySpec, EntryPoint, ManifestError, PluginKind, PluginManifest,
    ResourceLimits, MANIFEST_FILE_NAME,
};
pub use permissions::{Permission, PermissionSet};
pub use plugin::Plugin;
