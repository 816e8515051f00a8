//! Plugin registry
//!
//! In-memory index of loaded plugins keyed by identifier; the source of truth
//! for "is X already loaded". Only the loader mutates it, so every mutator is
//! crate-private. Callers outside the crate receive [`PluginInfo`] snapshots.

use crate::isolation::IsolationBoundary;
use crate::lifecycle::LifecycleState;
use crate::verification::TrustTier;
use bulwark_sdk::{PermissionSet, Plugin, PluginContext, PluginKind, PluginManifest};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};

/// Live instance shared between the registry and in-flight operations
pub(crate) type SharedInstance = Arc<Mutex<Box<dyn Plugin>>>;

/// The registry's unit of record for one loaded plugin
pub struct LoadedPlugin {
    pub(crate) manifest: PluginManifest,
    pub(crate) instance: SharedInstance,
    pub(crate) boundary: IsolationBoundary,
    pub(crate) context: PluginContext,
    pub(crate) directory: PathBuf,
    pub(crate) granted: PermissionSet,
    pub(crate) tier: TrustTier,
    pub(crate) thumbprint: Option<String>,
    pub(crate) enabled: bool,
    pub(crate) state: LifecycleState,
    pub(crate) loaded_at: DateTime<Utc>,
}

impl LoadedPlugin {
    pub fn id(&self) -> &str {
        &self.manifest.id
    }

    pub fn manifest(&self) -> &PluginManifest {
        &self.manifest
    }

    pub fn context(&self) -> &PluginContext {
        &self.context
    }

    pub fn info(&self) -> PluginInfo {
        PluginInfo {
            id: self.manifest.id.clone(),
            name: self.manifest.name.clone(),
            version: self.manifest.version.clone(),
            author: self.manifest.author.clone(),
            kind: self.manifest.kind,
            directory: self.directory.clone(),
            tier: self.tier,
            thumbprint: self.thumbprint.clone(),
            granted: self.granted.clone(),
            enabled: self.enabled,
            state: self.state,
            backend: self.boundary.backend_name(),
            loaded_at: self.loaded_at,
        }
    }
}

/// Snapshot of a loaded plugin
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PluginInfo {
    pub id: String,
    pub name: String,
    pub version: String,
    pub author: String,
    pub kind: PluginKind,
    pub directory: PathBuf,
    pub tier: TrustTier,
    pub thumbprint: Option<String>,
    pub granted: PermissionSet,
    pub enabled: bool,
    pub state: LifecycleState,
    pub backend: &'static str,
    pub loaded_at: DateTime<Utc>,
}

#[derive(Default)]
struct RegistryInner {
    plugins: HashMap<String, LoadedPlugin>,
    /// Identifiers in registration order
    order: Vec<String>,
}

/// Thread-safe registry of loaded plugins
#[derive(Default)]
pub struct PluginRegistry {
    inner: RwLock<RegistryInner>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn contains(&self, id: &str) -> bool {
        self.inner.read().await.plugins.contains_key(id)
    }

    pub async fn get(&self, id: &str) -> Option<PluginInfo> {
        self.inner.read().await.plugins.get(id).map(LoadedPlugin::info)
    }

    /// Every loaded plugin, in load order
    pub async fn list(&self) -> Vec<PluginInfo> {
        let inner = self.inner.read().await;
        inner
            .order
            .iter()
            .filter_map(|id| inner.plugins.get(id))
            .map(LoadedPlugin::info)
            .collect()
    }

    pub async fn ids_in_load_order(&self) -> Vec<String> {
        self.inner.read().await.order.clone()
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.plugins.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.plugins.is_empty()
    }

    /// Version and state of a registered plugin, for dependency checks
    pub(crate) async fn dependency_status(
        &self,
        id: &str,
    ) -> Option<(String, LifecycleState)> {
        self.inner
            .read()
            .await
            .plugins
            .get(id)
            .map(|p| (p.manifest.version.clone(), p.state))
    }

    /// Register a plugin, refusing duplicates without mutating the registry
    pub(crate) async fn register(&self, plugin: LoadedPlugin) -> Result<(), Box<LoadedPlugin>> {
        let mut inner = self.inner.write().await;
        if inner.plugins.contains_key(plugin.id()) {
            return Err(Box::new(plugin));
        }
        let id = plugin.id().to_string();
        inner.order.push(id.clone());
        inner.plugins.insert(id, plugin);
        Ok(())
    }

    /// Instance, state and enabled flag of a registered plugin
    pub(crate) async fn instance(
        &self,
        id: &str,
    ) -> Option<(SharedInstance, LifecycleState, bool)> {
        self.inner
            .read()
            .await
            .plugins
            .get(id)
            .map(|p| (Arc::clone(&p.instance), p.state, p.enabled))
    }

    /// Apply a lifecycle transition and enabled flag
    ///
    /// Returns false when the plugin is absent or the transition is illegal.
    pub(crate) async fn set_state(&self, id: &str, state: LifecycleState, enabled: bool) -> bool {
        let mut inner = self.inner.write().await;
        let Some(plugin) = inner.plugins.get_mut(id) else {
            return false;
        };
        if plugin.state != state && !plugin.state.can_transition_to(state) {
            tracing::warn!(
                plugin = %id,
                "Refusing lifecycle transition {} -> {}",
                plugin.state,
                state
            );
            return false;
        }
        plugin.state = state;
        plugin.enabled = enabled;
        true
    }

    pub(crate) async fn remove(&self, id: &str) -> Option<LoadedPlugin> {
        let mut inner = self.inner.write().await;
        let plugin = inner.plugins.remove(id)?;
        inner.order.retain(|existing| existing != id);
        Some(plugin)
    }
}
