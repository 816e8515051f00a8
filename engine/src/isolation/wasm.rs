//! WASM backend for plugins compiled to WebAssembly
//!
//! Modules run inside Extism with WASI disabled, so a plugin has no access to
//! the file system, environment or processes. Memory is capped and every call
//! is bounded by the plugin's declared resource limits.
//!
//! # Module exports
//!
//! - `plugin_types` (required) - returns a JSON array of exported type names
//! - `on_load`, `on_initialize`, `on_enable`, `on_disable`, `on_unload`
//!   (optional) - lifecycle hooks, called with a JSON payload
//!
//! A hook signals failure by returning `{"error": "..."}`.

use super::backend::{LoadedModule, ModuleBackend, ModuleImage};
use async_trait::async_trait;
use bulwark_sdk::{Plugin, PluginContext, PluginError, ResourceLimits};
use extism::{Manifest as ExtismManifest, PluginBuilder, Wasm};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// WASM page size in bytes
const WASM_PAGE_SIZE: u64 = 64 * 1024;

/// Backend that runs plugins in an Extism sandbox
#[derive(Debug, Default, Clone, Copy)]
pub struct WasmBackend;

impl WasmBackend {
    pub fn new() -> Self {
        Self
    }
}

fn build_plugin(bytes: &[u8], limits: &ResourceLimits) -> Result<extism::Plugin, PluginError> {
    let memory_pages = (u64::from(limits.max_memory_mb) * 1024 * 1024 / WASM_PAGE_SIZE) as u32;
    let manifest = ExtismManifest::new([Wasm::data(bytes.to_vec())])
        .with_memory_max(memory_pages)
        .with_timeout(Duration::from_millis(limits.max_call_ms));

    PluginBuilder::new(manifest)
        .with_wasi(false)
        .build()
        .map_err(|e| PluginError::Runtime(format!("failed to create WASM sandbox: {}", e)))
}

impl ModuleBackend for WasmBackend {
    fn name(&self) -> &'static str {
        "wasm"
    }

    fn supports(&self, path: &Path) -> bool {
        path.extension().and_then(|e| e.to_str()) == Some("wasm")
    }

    fn open(
        &self,
        path: &Path,
        limits: &ResourceLimits,
    ) -> Result<Box<dyn ModuleImage>, PluginError> {
        let mut bytes = std::fs::read(path)?;
        // The signed trailer is not part of the module
        crate::signing::strip_signature(&mut bytes)
            .map_err(|e| PluginError::Runtime(format!("malformed signature trailer: {}", e)))?;
        let mut inspector = build_plugin(&bytes, limits)?;

        if !inspector.function_exists("plugin_types") {
            return Err(PluginError::Runtime(format!(
                "{} does not export 'plugin_types'",
                path.display()
            )));
        }
        let output = inspector
            .call::<&[u8], Vec<u8>>("plugin_types", b"")
            .map_err(|e| PluginError::Runtime(format!("plugin_types failed: {}", e)))?;
        let types: Vec<String> = serde_json::from_slice(&output)?;

        tracing::debug!(
            "WASM module {} exports {} plugin type(s)",
            path.display(),
            types.len()
        );

        Ok(Box::new(WasmImage {
            bytes: Arc::new(bytes),
            limits: *limits,
            types,
        }))
    }

    fn open_dependency(&self, path: &Path) -> Result<Box<dyn LoadedModule>, PluginError> {
        let bytes = std::fs::read(path)?;
        Ok(Box::new(WasmDependency {
            path: path.to_path_buf(),
            _bytes: bytes,
        }))
    }
}

struct WasmImage {
    bytes: Arc<Vec<u8>>,
    limits: ResourceLimits,
    types: Vec<String>,
}

impl ModuleImage for WasmImage {
    fn exported_types(&self) -> Vec<String> {
        self.types.clone()
    }

    fn instantiate(&self, type_name: &str) -> Option<Result<Box<dyn Plugin>, PluginError>> {
        if !self.types.iter().any(|t| t == type_name) {
            return None;
        }
        // Each instance gets its own sandbox
        Some(build_plugin(&self.bytes, &self.limits).map(|plugin| {
            Box::new(WasmPlugin {
                type_name: type_name.to_string(),
                plugin: Arc::new(Mutex::new(plugin)),
                payload: serde_json::Value::Null,
            }) as Box<dyn Plugin>
        }))
    }
}

#[derive(Deserialize)]
struct HookReply {
    #[serde(default)]
    error: Option<String>,
}

/// Plugin instance backed by an Extism sandbox
struct WasmPlugin {
    type_name: String,
    plugin: Arc<Mutex<extism::Plugin>>,
    /// Context summary handed to every hook
    payload: serde_json::Value,
}

impl WasmPlugin {
    async fn call_hook(&self, hook: &'static str, cancel: &CancellationToken) -> Result<(), PluginError> {
        let input = serde_json::to_vec(&serde_json::json!({
            "type_name": self.type_name,
            "hook": hook,
            "context": self.payload,
        }))?;

        let plugin = Arc::clone(&self.plugin);
        let cancel_handle = {
            let guard = plugin
                .lock()
                .map_err(|_| PluginError::Runtime("WASM sandbox poisoned".to_string()))?;
            if !guard.function_exists(hook) {
                return Ok(());
            }
            guard.cancel_handle()
        };

        let task = tokio::task::spawn_blocking(move || {
            let mut guard = plugin
                .lock()
                .map_err(|_| PluginError::Runtime("WASM sandbox poisoned".to_string()))?;
            guard
                .call::<&[u8], Vec<u8>>(hook, &input)
                .map_err(|e| PluginError::Runtime(format!("{} failed: {}", hook, e)))
        });

        let output = tokio::select! {
            joined = task => joined
                .map_err(|e| PluginError::Runtime(format!("{} aborted: {}", hook, e)))??,
            _ = cancel.cancelled() => {
                if let Err(e) = cancel_handle.cancel() {
                    tracing::warn!("Failed to cancel WASM call '{}': {}", hook, e);
                }
                return Err(PluginError::Cancelled);
            }
        };

        if output.is_empty() {
            return Ok(());
        }
        let reply: HookReply = serde_json::from_slice(&output)?;
        match reply.error {
            Some(message) => Err(PluginError::Hook(message)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl Plugin for WasmPlugin {
    async fn on_load(
        &mut self,
        ctx: &PluginContext,
        cancel: &CancellationToken,
    ) -> Result<(), PluginError> {
        self.payload = serde_json::json!({
            "plugin_id": ctx.plugin_id(),
            "host_version": ctx.host_version(),
            "storage_dir": ctx.storage_dir(),
            "permissions": ctx.granted_permissions(),
        });
        self.call_hook("on_load", cancel).await
    }

    async fn on_initialize(&mut self, cancel: &CancellationToken) -> Result<(), PluginError> {
        self.call_hook("on_initialize", cancel).await
    }

    async fn on_enable(&mut self, cancel: &CancellationToken) -> Result<(), PluginError> {
        self.call_hook("on_enable", cancel).await
    }

    async fn on_disable(&mut self, cancel: &CancellationToken) -> Result<(), PluginError> {
        self.call_hook("on_disable", cancel).await
    }

    async fn on_unload(&mut self, cancel: &CancellationToken) -> Result<(), PluginError> {
        self.call_hook("on_unload", cancel).await
    }
}

struct WasmDependency {
    path: PathBuf,
    _bytes: Vec<u8>,
}

impl LoadedModule for WasmDependency {
    fn path(&self) -> &Path {
        &self.path
    }
}
