//! Plugin isolation boundary
//!
//! Each plugin gets its own [`IsolationBoundary`]: a disposable loading scope
//! bound to the plugin's entry binary. The boundary
//!
//! - loads the entry binary through its [`ModuleBackend`],
//! - resolves dependency names against the [`IsolationPolicy`] (deny first,
//!   then the shared allow-list, then the plugin's private closure),
//! - refuses every native library load requested by plugin code,
//! - owns a handle table of every private module it loaded.
//!
//! Tearing a boundary down drops its handle table and entry image. Teardown
//! happens on [`IsolationBoundary::unload`] or when the boundary is dropped, so
//! a failed or cancelled load can never leak one.
//!
//! # Private dependency manifest
//!
//! The private closure is declared next to the entry binary in
//! `<entry-stem>.deps.json`:
//!
//! ```json
//! { "dependencies": { "chart_math": "deps/libchart_math.so" } }
//! ```
//!
//! Paths are relative to the plugin directory and may not leave it.

pub mod backend;
pub mod native;
pub mod policy;
pub mod wasm;

pub use backend::{BackendSet, LoadedModule, ModuleBackend, ModuleImage, StaticBackend};
pub use native::NativeBackend;
pub use policy::{IsolationPolicy, PolicyDecision};
pub use wasm::WasmBackend;

use crate::audit::{AuditEventKind, AuditSink, AuditSinkExt};
use bulwark_sdk::{ModuleHandle, ModuleHandleImpl, PluginError, Resolution, ResourceLimits};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

/// Live boundary count per plugin id
#[derive(Debug, Clone, Default)]
pub struct BoundaryTracker {
    live: Arc<Mutex<HashMap<String, usize>>>,
}

impl BoundaryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, usize>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn acquire(&self, plugin_id: &str) {
        *self.lock().entry(plugin_id.to_string()).or_insert(0) += 1;
    }

    fn release(&self, plugin_id: &str) {
        let mut live = self.lock();
        if let Some(count) = live.get_mut(plugin_id) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                live.remove(plugin_id);
            }
        }
    }

    /// Boundaries currently alive for `plugin_id`
    pub fn active(&self, plugin_id: &str) -> usize {
        self.lock().get(plugin_id).copied().unwrap_or(0)
    }

    /// Boundaries currently alive across all plugins
    pub fn total(&self) -> usize {
        self.lock().values().sum()
    }
}

#[derive(Debug, Default, Deserialize)]
struct PrivateDependencyManifest {
    #[serde(default)]
    dependencies: HashMap<String, String>,
}

#[derive(Default)]
struct BoundaryState {
    unloaded: bool,
    modules: HashMap<String, Box<dyn LoadedModule>>,
    entry: Option<Arc<dyn ModuleImage>>,
}

struct BoundaryCore {
    plugin_id: String,
    plugin_dir: PathBuf,
    entry_path: PathBuf,
    policy: Arc<IsolationPolicy>,
    backend: Arc<dyn ModuleBackend>,
    private_deps: HashMap<String, String>,
    state: Mutex<BoundaryState>,
    audit: Arc<dyn AuditSink>,
}

impl BoundaryCore {
    fn state(&self) -> MutexGuard<'_, BoundaryState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn violation(&self, module: &str) -> PluginError {
        tracing::error!(
            plugin = %self.plugin_id,
            module = %module,
            "Security violation: denied module requested"
        );
        self.audit.emit(
            &self.plugin_id,
            AuditEventKind::SecurityViolation,
            format!("attempted to load denied module '{}'", module),
        );
        PluginError::SecurityViolation {
            plugin_id: self.plugin_id.clone(),
            module: module.to_string(),
        }
    }

    fn resolve(&self, name: &str) -> Result<Resolution, PluginError> {
        if self.state().unloaded {
            return Err(PluginError::BoundaryUnloaded(self.plugin_id.clone()));
        }

        match self.policy.decide(name) {
            PolicyDecision::Deny => Err(self.violation(name)),
            PolicyDecision::Shared => Ok(Resolution::Shared {
                name: name.to_string(),
            }),
            PolicyDecision::Private => self.resolve_private(name),
        }
    }

    fn resolve_private(&self, name: &str) -> Result<Resolution, PluginError> {
        let key = name.replace('-', "_");
        let Some(relative) = self
            .private_deps
            .get(name)
            .or_else(|| self.private_deps.get(&key))
        else {
            return Ok(Resolution::NotFound);
        };

        let relative = Path::new(relative);
        if relative.is_absolute()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
        {
            return Err(self.violation(name));
        }
        let path = self.plugin_dir.join(relative);

        let mut state = self.state();
        if state.unloaded {
            return Err(PluginError::BoundaryUnloaded(self.plugin_id.clone()));
        }
        if !state.modules.contains_key(&key) {
            if !path.exists() {
                return Ok(Resolution::NotFound);
            }
            let module = self.backend.open_dependency(&path)?;
            tracing::debug!(
                plugin = %self.plugin_id,
                "Loaded private dependency '{}' from {}",
                name,
                module.path().display()
            );
            state.modules.insert(key, module);
        }

        Ok(Resolution::Private {
            name: name.to_string(),
            path,
        })
    }

    fn deny_native_library(&self, library: &str) -> PluginError {
        tracing::error!(
            plugin = %self.plugin_id,
            library = %library,
            "Security violation: native library load requested"
        );
        self.audit.emit(
            &self.plugin_id,
            AuditEventKind::SecurityViolation,
            format!("attempted to load native library '{}'", library),
        );
        PluginError::NativeLibraryDenied {
            plugin_id: self.plugin_id.clone(),
            library: library.to_string(),
        }
    }
}

/// Handle given to plugin code; does not keep the boundary alive
struct BoundaryModules {
    core: Weak<BoundaryCore>,
    plugin_id: String,
}

impl ModuleHandleImpl for BoundaryModules {
    fn resolve(&self, name: &str) -> Result<Resolution, PluginError> {
        match self.core.upgrade() {
            Some(core) => core.resolve(name),
            None => Err(PluginError::BoundaryUnloaded(self.plugin_id.clone())),
        }
    }

    fn load_native_library(&self, name: &str) -> Result<(), PluginError> {
        match self.core.upgrade() {
            Some(core) => Err(core.deny_native_library(name)),
            None => Err(PluginError::NativeLibraryDenied {
                plugin_id: self.plugin_id.clone(),
                library: name.to_string(),
            }),
        }
    }
}

/// A single plugin's dependency-resolution scope and capability gate
pub struct IsolationBoundary {
    core: Arc<BoundaryCore>,
    tracker: BoundaryTracker,
}

impl IsolationBoundary {
    /// Create a boundary for the entry binary at `entry_path`
    ///
    /// Reads the optional `<entry-stem>.deps.json` next to the entry binary.
    ///
    /// # Errors
    ///
    /// Returns an error if the private dependency manifest exists but cannot
    /// be read or parsed.
    pub fn new(
        plugin_id: &str,
        entry_path: &Path,
        policy: Arc<IsolationPolicy>,
        backend: Arc<dyn ModuleBackend>,
        tracker: BoundaryTracker,
        audit: Arc<dyn AuditSink>,
    ) -> Result<Self, PluginError> {
        let plugin_dir = entry_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let private_deps = read_private_manifest(entry_path)?;

        tracker.acquire(plugin_id);
        tracing::debug!(
            plugin = %plugin_id,
            backend = backend.name(),
            "Created isolation boundary with {} private dependencies",
            private_deps.len()
        );

        Ok(Self {
            core: Arc::new(BoundaryCore {
                plugin_id: plugin_id.to_string(),
                plugin_dir,
                entry_path: entry_path.to_path_buf(),
                policy,
                backend,
                private_deps,
                state: Mutex::new(BoundaryState::default()),
                audit,
            }),
            tracker,
        })
    }

    pub fn plugin_id(&self) -> &str {
        &self.core.plugin_id
    }

    pub fn entry_path(&self) -> &Path {
        &self.core.entry_path
    }

    pub fn backend_name(&self) -> &'static str {
        self.core.backend.name()
    }

    /// Open the entry binary through the backend
    ///
    /// Runs on the blocking pool since opening may map, compile or read the
    /// whole binary.
    pub async fn load_entry(
        &self,
        limits: ResourceLimits,
    ) -> Result<Arc<dyn ModuleImage>, PluginError> {
        if self.is_unloaded() {
            return Err(PluginError::BoundaryUnloaded(self.core.plugin_id.clone()));
        }

        let core = Arc::clone(&self.core);
        let image = tokio::task::spawn_blocking(move || {
            core.backend.open(&core.entry_path, &limits)
        })
        .await
        .map_err(|e| PluginError::Runtime(format!("entry load aborted: {}", e)))??;

        let image: Arc<dyn ModuleImage> = Arc::from(image);
        let mut state = self.core.state();
        if state.unloaded {
            return Err(PluginError::BoundaryUnloaded(self.core.plugin_id.clone()));
        }
        state.entry = Some(Arc::clone(&image));
        Ok(image)
    }

    /// Resolve a dependency name under the isolation policy
    pub fn resolve(&self, name: &str) -> Result<Resolution, PluginError> {
        self.core.resolve(name)
    }

    /// Native library loading is always denied for plugin code
    pub fn load_native_library(&self, name: &str) -> Result<(), PluginError> {
        Err(self.core.deny_native_library(name))
    }

    /// Handle through which plugin code reaches this boundary
    pub fn module_handle(&self) -> ModuleHandle {
        ModuleHandle::new(Arc::new(BoundaryModules {
            core: Arc::downgrade(&self.core),
            plugin_id: self.core.plugin_id.clone(),
        }))
    }

    /// Number of private modules currently held
    pub fn loaded_modules(&self) -> usize {
        self.core.state().modules.len()
    }

    pub fn is_unloaded(&self) -> bool {
        self.core.state().unloaded
    }

    /// Tear the boundary down, releasing every module loaded through it
    ///
    /// Idempotent.
    pub fn unload(&self) {
        let (modules, entry) = {
            let mut state = self.core.state();
            if state.unloaded {
                return;
            }
            state.unloaded = true;
            (std::mem::take(&mut state.modules), state.entry.take())
        };

        let released = modules.len();
        drop(entry);
        drop(modules);
        self.tracker.release(&self.core.plugin_id);

        tracing::debug!(
            plugin = %self.core.plugin_id,
            "Isolation boundary torn down ({} private modules released)",
            released
        );
    }
}

impl Drop for IsolationBoundary {
    fn drop(&mut self) {
        self.unload();
    }
}

fn read_private_manifest(entry_path: &Path) -> Result<HashMap<String, String>, PluginError> {
    let Some(stem) = entry_path.file_stem().and_then(|s| s.to_str()) else {
        return Ok(HashMap::new());
    };
    let path = entry_path.with_file_name(format!("{}.deps.json", stem));
    if !path.exists() {
        return Ok(HashMap::new());
    }

    let content = std::fs::read_to_string(&path)?;
    let manifest: PrivateDependencyManifest = serde_json::from_str(&content)?;
    Ok(manifest
        .dependencies
        .into_iter()
        .map(|(name, rel)| (name.replace('-', "_"), rel))
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::audit::MemoryAuditSink;

    struct Fixture {
        dir: tempfile::TempDir,
        tracker: BoundaryTracker,
        audit: Arc<MemoryAuditSink>,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::tempdir().unwrap();
            std::fs::write(dir.path().join("widget.bin"), b"bundled").unwrap();
            Self {
                dir,
                tracker: BoundaryTracker::new(),
                audit: Arc::new(MemoryAuditSink::new()),
            }
        }

        fn boundary(&self) -> IsolationBoundary {
            IsolationBoundary::new(
                "widget",
                &self.dir.path().join("widget.bin"),
                Arc::new(IsolationPolicy::default()),
                Arc::new(StaticBackend::new()),
                self.tracker.clone(),
                self.audit.clone(),
            )
            .unwrap()
        }
    }

    #[test]
    fn test_denied_module_is_security_violation() {
        let fx = Fixture::new();
        let boundary = fx.boundary();

        let err = boundary.resolve("std::process").unwrap_err();
        assert!(matches!(
            &err,
            PluginError::SecurityViolation { plugin_id, module }
                if plugin_id == "widget" && module == "std::process"
        ));
        assert_eq!(fx.audit.count("widget", AuditEventKind::SecurityViolation), 1);

        for module in ["std::os::unix::process", "std::os::windows::process::CommandExt"] {
            let err = boundary.resolve(module).unwrap_err();
            assert!(err.is_security_violation(), "{} resolved", module);
        }
        assert_eq!(fx.audit.count("widget", AuditEventKind::SecurityViolation), 3);
    }

    #[test]
    fn test_shared_and_missing_modules() {
        let fx = Fixture::new();
        let boundary = fx.boundary();

        assert_eq!(
            boundary.resolve("serde_json").unwrap(),
            Resolution::Shared {
                name: "serde_json".into()
            }
        );
        assert_eq!(boundary.resolve("left_pad").unwrap(), Resolution::NotFound);
    }

    #[test]
    fn test_private_dependency_loaded_once() {
        let fx = Fixture::new();
        std::fs::create_dir(fx.dir.path().join("deps")).unwrap();
        std::fs::write(fx.dir.path().join("deps/chart_math.bin"), b"dep").unwrap();
        std::fs::write(
            fx.dir.path().join("widget.deps.json"),
            r#"{ "dependencies": { "chart-math": "deps/chart_math.bin" } }"#,
        )
        .unwrap();

        let boundary = fx.boundary();
        let first = boundary.resolve("chart-math").unwrap();
        let second = boundary.resolve("chart_math").unwrap();
        assert!(matches!(first, Resolution::Private { .. }));
        assert_eq!(first, Resolution::Private {
            name: "chart-math".into(),
            path: fx.dir.path().join("deps/chart_math.bin"),
        });
        assert!(matches!(second, Resolution::Private { .. }));
        assert_eq!(boundary.loaded_modules(), 1);
    }

    #[test]
    fn test_private_path_may_not_escape_plugin_dir() {
        let fx = Fixture::new();
        std::fs::write(
            fx.dir.path().join("widget.deps.json"),
            r#"{ "dependencies": { "evil": "../evil.bin" } }"#,
        )
        .unwrap();

        let boundary = fx.boundary();
        assert!(boundary.resolve("evil").unwrap_err().is_security_violation());
    }

    #[test]
    fn test_native_library_always_denied() {
        let fx = Fixture::new();
        let boundary = fx.boundary();
        let handle = boundary.module_handle();

        assert!(matches!(
            handle.load_native_library("libc.so.6"),
            Err(PluginError::NativeLibraryDenied { .. })
        ));
        assert!(boundary.load_native_library("kernel32.dll").is_err());
        assert_eq!(fx.audit.count("widget", AuditEventKind::SecurityViolation), 2);
    }

    #[test]
    fn test_drop_releases_tracker_slot() {
        let fx = Fixture::new();
        let boundary = fx.boundary();
        let handle = boundary.module_handle();
        assert_eq!(fx.tracker.active("widget"), 1);

        drop(boundary);
        assert_eq!(fx.tracker.active("widget"), 0);
        assert!(matches!(
            handle.resolve("serde"),
            Err(PluginError::BoundaryUnloaded(_))
        ));
    }

    #[test]
    fn test_unload_is_idempotent() {
        let fx = Fixture::new();
        let a = fx.boundary();
        let b = fx.boundary();
        assert_eq!(fx.tracker.active("widget"), 2);

        a.unload();
        a.unload();
        assert_eq!(fx.tracker.active("widget"), 1);
        assert!(matches!(
            a.resolve("serde"),
            Err(PluginError::BoundaryUnloaded(_))
        ));
        drop(a);
        drop(b);
        assert_eq!(fx.tracker.total(), 0);
    }
}
