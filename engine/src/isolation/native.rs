//! Native backend for plugins compiled as shared libraries
//!
//! The entry binary must export the static `bulwark_plugin_declaration`
//! produced by `bulwark_sdk::export_plugins!`. Its API version is checked
//! before any plugin code runs; the declaration's `register` function then
//! reports every exported type and its factory.
//!
//! `libloading` handles the platform-specific extensions:
//! - Linux: `.so`
//! - macOS: `.dylib`
//! - Windows: `.dll`
//!
//! Every instance keeps the library alive through an `Arc`, so the code
//! backing an instance is never unmapped while the instance exists.

use super::backend::{LoadedModule, ModuleBackend, ModuleImage};
use async_trait::async_trait;
use bulwark_sdk::abi::{PluginDeclaration, PluginFactory, PluginRegistrar, DECLARATION_SYMBOL};
use bulwark_sdk::{
    Plugin, PluginContext, PluginError, PluginKind, ResourceLimits, PLUGIN_API_VERSION,
};
use libloading::Library;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// Shared library extensions handled by this backend
const NATIVE_EXTENSIONS: &[&str] = &["so", "dylib", "dll"];

/// Backend that loads plugins via dlopen
#[derive(Debug, Default, Clone, Copy)]
pub struct NativeBackend;

impl NativeBackend {
    pub fn new() -> Self {
        Self
    }

    fn load_library(path: &Path) -> Result<Library, PluginError> {
        // SAFETY: the library's initializers run here. Only binaries that went
        // through verification and the load policy reach this point.
        unsafe { Library::new(path) }.map_err(|e| {
            tracing::error!("Failed to load library {}: {}", path.display(), e);
            PluginError::Runtime(format!("failed to load {}: {}", path.display(), e))
        })
    }
}

#[derive(Default)]
struct TypeTable(HashMap<String, PluginFactory>);

impl PluginRegistrar for TypeTable {
    fn register(&mut self, type_name: &str, factory: PluginFactory) {
        self.0.insert(type_name.to_string(), factory);
    }
}

impl ModuleBackend for NativeBackend {
    fn name(&self) -> &'static str {
        "native"
    }

    fn supports(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .is_some_and(|ext| NATIVE_EXTENSIONS.contains(&ext))
    }

    fn open(
        &self,
        path: &Path,
        _limits: &ResourceLimits,
    ) -> Result<Box<dyn ModuleImage>, PluginError> {
        let library = Self::load_library(path)?;

        // SAFETY: the symbol is the address of a `PluginDeclaration` static
        // emitted by `export_plugins!`; it is copied out while the library
        // is still loaded.
        let declaration: PluginDeclaration = unsafe {
            let symbol = library
                .get::<*const PluginDeclaration>(DECLARATION_SYMBOL)
                .map_err(|e| {
                    tracing::error!(
                        "Symbol 'bulwark_plugin_declaration' not found in {}: {}",
                        path.display(),
                        e
                    );
                    PluginError::Runtime(format!("missing plugin declaration: {}", e))
                })?;
            **symbol
        };

        if declaration.api_version != PLUGIN_API_VERSION {
            return Err(PluginError::Runtime(format!(
                "plugin API version {} is not supported (host expects {}, plugin built with sdk {})",
                declaration.api_version, PLUGIN_API_VERSION, declaration.sdk_version
            )));
        }

        let mut table = TypeTable::default();
        (declaration.register)(&mut table);
        tracing::debug!(
            "Library {} exports {} plugin type(s)",
            path.display(),
            table.0.len()
        );

        Ok(Box::new(NativeImage {
            types: table.0,
            library: Arc::new(library),
        }))
    }

    fn open_dependency(&self, path: &Path) -> Result<Box<dyn LoadedModule>, PluginError> {
        let library = Self::load_library(path)?;
        Ok(Box::new(NativeDependency {
            path: path.to_path_buf(),
            _library: library,
        }))
    }
}

struct NativeImage {
    types: HashMap<String, PluginFactory>,
    library: Arc<Library>,
}

impl ModuleImage for NativeImage {
    fn exported_types(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.keys().cloned().collect();
        names.sort();
        names
    }

    fn instantiate(&self, type_name: &str) -> Option<Result<Box<dyn Plugin>, PluginError>> {
        let factory = self.types.get(type_name)?;
        Some(factory().map(|plugin| {
            Box::new(NativeInstance {
                plugin,
                _library: Arc::clone(&self.library),
            }) as Box<dyn Plugin>
        }))
    }
}

/// Plugin instance paired with the library its code lives in
///
/// Field order matters: the plugin is dropped before the library.
struct NativeInstance {
    plugin: Box<dyn Plugin>,
    _library: Arc<Library>,
}

#[async_trait]
impl Plugin for NativeInstance {
    fn kind(&self) -> PluginKind {
        self.plugin.kind()
    }

    async fn on_load(
        &mut self,
        ctx: &PluginContext,
        cancel: &CancellationToken,
    ) -> Result<(), PluginError> {
        self.plugin.on_load(ctx, cancel).await
    }

    async fn on_initialize(&mut self, cancel: &CancellationToken) -> Result<(), PluginError> {
        self.plugin.on_initialize(cancel).await
    }

    async fn on_enable(&mut self, cancel: &CancellationToken) -> Result<(), PluginError> {
        self.plugin.on_enable(cancel).await
    }

    async fn on_disable(&mut self, cancel: &CancellationToken) -> Result<(), PluginError> {
        self.plugin.on_disable(cancel).await
    }

    async fn on_unload(&mut self, cancel: &CancellationToken) -> Result<(), PluginError> {
        self.plugin.on_unload(cancel).await
    }

    fn dispose(&mut self) {
        self.plugin.dispose();
    }
}

struct NativeDependency {
    path: PathBuf,
    _library: Library,
}

impl LoadedModule for NativeDependency {
    fn path(&self) -> &Path {
        &self.path
    }
}
