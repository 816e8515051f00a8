//! Plugin loader
//!
//! The single orchestrator of plugin load, enable, disable, unload and
//! install, and the only component that mutates the [`PluginRegistry`].
//!
//! # Load protocol
//!
//! One load runs at a time behind the load lock. Each step may short-circuit
//! to a typed [`LoadError`]:
//!
//! 1. Read and validate `plugin.json`
//! 2. Refuse an identifier that is already registered
//! 3. Verify the entry binary; enforce the signing policy
//! 4. Check the host version against the compatibility bounds
//! 5. Check every required dependency is registered at a sufficient version
//! 6. Negotiate permissions against the trust tier
//! 7. Create an isolation boundary bound to the entry binary
//! 8. Load the entry binary through the boundary
//! 9. Resolve the declared entry type
//! 10. Instantiate it
//! 11. Build the sandboxed context
//! 12. Run `on_load` then `on_initialize`, each under the hook timeout
//! 13. Register the plugin
//!
//! Any failure or cancellation after step 7 tears the boundary down before
//! returning.
//!
//! Plugin code (the type constructor and every hook) runs on the blocking
//! pool. A panic surfaces as [`LoadError::Initialization`], and a hook that
//! overruns the timeout is abandoned with its token cancelled.

pub mod discovery;
pub mod error;
pub mod install;

pub use discovery::{dependency_order, discover, read_manifest, Discovered};
pub use error::{LoadError, LoadErrorKind};

use crate::audit::{AuditEventKind, AuditSink, AuditSinkExt};
use crate::isolation::{
    BackendSet, BoundaryTracker, IsolationBoundary, IsolationPolicy, ModuleImage, NativeBackend,
    WasmBackend,
};
use crate::lifecycle::{Lifecycle, LifecycleState};
use crate::permissions::{
    DenyAllPrompt, PermissionManager, PermissionPrompt, PermissionRequest, TierPermissionManager,
};
use crate::registry::{LoadedPlugin, PluginInfo, PluginRegistry, SharedInstance};
use crate::verification::{VerificationResult, VerificationService, VerificationStatus};
use bulwark_sdk::manifest::parse_version;
use bulwark_sdk::{
    LogHandle, LogHandleImpl, LogLevel, PermissionSet, Plugin, PluginContext, PluginError,
    PluginManifest, ServiceCatalog,
};
use chrono::Utc;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Default timeout for `on_load` and `on_initialize`
pub const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a failed load waits for `dispose` before moving on
const DISPOSE_GRACE: Duration = Duration::from_millis(250);

/// Host policy and locations used by the loader
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    /// Managed install root; one subdirectory per plugin
    pub install_dir: PathBuf,
    /// Root of the per-plugin storage directories
    pub storage_root: PathBuf,
    pub host_version: semver::Version,
    pub hook_timeout: Duration,
    /// Refuse every plugin whose verification did not succeed
    pub require_signed: bool,
    /// Refuse plugins with an invalid signature even when unsigned ones may load
    pub reject_invalid_signatures: bool,
}

impl LoaderOptions {
    pub fn new(
        install_dir: impl Into<PathBuf>,
        storage_root: impl Into<PathBuf>,
        host_version: semver::Version,
    ) -> Self {
        Self {
            install_dir: install_dir.into(),
            storage_root: storage_root.into(),
            host_version,
            hook_timeout: DEFAULT_HOOK_TIMEOUT,
            require_signed: cfg!(feature = "production"),
            reject_invalid_signatures: false,
        }
    }
}

/// Result of one attempt inside a batch load
#[derive(Debug)]
pub struct LoadOutcome {
    pub directory: PathBuf,
    pub result: Result<PluginInfo, LoadError>,
}

/// Plugin log handle backed by `tracing`, tagged with the plugin id
struct TracingPluginLog {
    plugin_id: String,
}

impl LogHandleImpl for TracingPluginLog {
    fn log(&self, level: LogLevel, message: &str) {
        match level {
            LogLevel::Debug => tracing::debug!(target: "plugin", plugin = %self.plugin_id, "{}", message),
            LogLevel::Info => tracing::info!(target: "plugin", plugin = %self.plugin_id, "{}", message),
            LogLevel::Warn => tracing::warn!(target: "plugin", plugin = %self.plugin_id, "{}", message),
            LogLevel::Error => tracing::error!(target: "plugin", plugin = %self.plugin_id, "{}", message),
        }
    }
}

enum Hook {
    Load(PluginContext),
    Initialize,
    Enable,
    Disable,
    /// `on_unload` followed by `dispose`
    Unload,
    Dispose,
}

impl Hook {
    fn name(&self) -> &'static str {
        match self {
            Hook::Load(_) => "on_load",
            Hook::Initialize => "on_initialize",
            Hook::Enable => "on_enable",
            Hook::Disable => "on_disable",
            Hook::Unload => "on_unload",
            Hook::Dispose => "dispose",
        }
    }
}

/// Orchestrates the plugin lifecycle
pub struct PluginLoader {
    options: LoaderOptions,
    registry: PluginRegistry,
    verification: Arc<VerificationService>,
    permissions: Arc<dyn PermissionManager>,
    prompt: Arc<dyn PermissionPrompt>,
    backends: BackendSet,
    policy: Arc<IsolationPolicy>,
    tracker: BoundaryTracker,
    services: Arc<ServiceCatalog>,
    audit: Arc<dyn AuditSink>,
    load_lock: Mutex<()>,
}

impl PluginLoader {
    /// Create a loader with the native and WASM backends, the default
    /// isolation policy, tier-based permissions and a prompt that declines
    pub fn new(
        options: LoaderOptions,
        verification: Arc<VerificationService>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        Self {
            options,
            registry: PluginRegistry::new(),
            verification,
            permissions: Arc::new(TierPermissionManager::new()),
            prompt: Arc::new(DenyAllPrompt),
            backends: BackendSet::new()
                .with(Arc::new(NativeBackend::new()))
                .with(Arc::new(WasmBackend::new())),
            policy: Arc::new(IsolationPolicy::default()),
            tracker: BoundaryTracker::new(),
            services: Arc::new(ServiceCatalog::new()),
            audit,
            load_lock: Mutex::new(()),
        }
    }

    pub fn with_permission_manager(mut self, manager: Arc<dyn PermissionManager>) -> Self {
        self.permissions = manager;
        self
    }

    pub fn with_prompt(mut self, prompt: Arc<dyn PermissionPrompt>) -> Self {
        self.prompt = prompt;
        self
    }

    pub fn with_backends(mut self, backends: BackendSet) -> Self {
        self.backends = backends;
        self
    }

    pub fn with_policy(mut self, policy: IsolationPolicy) -> Self {
        self.policy = Arc::new(policy);
        self
    }

    pub fn with_services(mut self, services: ServiceCatalog) -> Self {
        self.services = Arc::new(services);
        self
    }

    pub fn options(&self) -> &LoaderOptions {
        &self.options
    }

    pub fn verification(&self) -> &VerificationService {
        &self.verification
    }

    pub fn registry(&self) -> &PluginRegistry {
        &self.registry
    }

    /// Load the plugin in `directory`
    pub async fn load(
        &self,
        directory: &Path,
        cancel: &CancellationToken,
    ) -> Result<PluginInfo, LoadError> {
        let _guard = self.lock_loads(cancel).await?;
        let manifest = match read_manifest(directory).await {
            Ok(manifest) => manifest,
            Err(e) => {
                self.report_failure(&directory_label(directory), &e);
                return Err(e);
            }
        };
        self.load_locked(directory, manifest, cancel).await
    }

    /// Enumerate plugin directories under the install root
    pub async fn discover(&self) -> std::io::Result<Vec<Discovered>> {
        discover(&self.options.install_dir).await
    }

    /// Load every plugin under the install root
    ///
    /// Dependencies load before their dependents. Returns one outcome per
    /// directory; a failure never stops the batch.
    pub async fn load_all(&self, cancel: &CancellationToken) -> Vec<LoadOutcome> {
        let found = match self.discover().await {
            Ok(found) => found,
            Err(e) => {
                tracing::error!(
                    "Failed to list plugin directory {}: {}",
                    self.options.install_dir.display(),
                    e
                );
                return vec![LoadOutcome {
                    directory: self.options.install_dir.clone(),
                    result: Err(LoadError::Load(format!(
                        "cannot list install root: {}",
                        e
                    ))),
                }];
            }
        };

        let mut outcomes = Vec::with_capacity(found.len());
        let mut candidates = Vec::new();
        for item in found {
            match item.manifest {
                Ok(manifest) => candidates.push((item.directory, manifest)),
                Err(e) => {
                    self.report_failure(&directory_label(&item.directory), &e);
                    outcomes.push(LoadOutcome {
                        directory: item.directory,
                        result: Err(e),
                    });
                }
            }
        }

        let order = {
            let manifests: Vec<&PluginManifest> = candidates.iter().map(|(_, m)| m).collect();
            dependency_order(&manifests)
        };
        let mut slots: Vec<Option<(PathBuf, PluginManifest)>> =
            candidates.into_iter().map(Some).collect();

        for index in order {
            let Some((directory, manifest)) = slots[index].take() else {
                continue;
            };
            let result = match self.lock_loads(cancel).await {
                Ok(_guard) => self.load_locked(&directory, manifest, cancel).await,
                Err(e) => Err(e),
            };
            outcomes.push(LoadOutcome { directory, result });
        }

        let loaded = outcomes.iter().filter(|o| o.result.is_ok()).count();
        tracing::info!(
            "Loaded {}/{} plugins from {}",
            loaded,
            outcomes.len(),
            self.options.install_dir.display()
        );
        outcomes
    }

    /// Copy a plugin payload into the install root and load it
    ///
    /// Any loaded plugin with the same identifier is unloaded and its previous
    /// install replaced.
    pub async fn install(
        &self,
        source: &Path,
        cancel: &CancellationToken,
    ) -> Result<PluginInfo, LoadError> {
        let manifest = match read_manifest(source).await {
            Ok(manifest) => manifest,
            Err(e) => {
                self.report_failure(&directory_label(source), &e);
                return Err(e);
            }
        };
        let _guard = self.lock_loads(cancel).await?;
        let id = manifest.id.clone();
        let target = self.options.install_dir.join(&id);

        if self.registry.contains(&id).await && !self.unload(&id).await {
            tracing::warn!(plugin = %id, "Previous instance did not unload cleanly, replacing it anyway");
        }

        if !install::same_directory(source, &target) {
            checkpoint(cancel, "install copy")?;
            let copy = async {
                match install::remove_payload(&target).await {
                    Ok(()) => install::copy_payload(source, &target).await,
                    Err(e) => Err(e),
                }
            };
            let copied = cancellable(cancel, "install copy", copy)
                .await?
                .map_err(|e| {
                    LoadError::Load(format!(
                        "failed to copy {} to {}: {}",
                        source.display(),
                        target.display(),
                        e
                    ))
                })?;
            self.audit.emit(
                &id,
                AuditEventKind::Installed,
                format!("{} files from {}", copied, source.display()),
            );
            tracing::info!(plugin = %id, "Installed {} files into {}", copied, target.display());
        }

        let manifest = read_manifest(&target).await?;
        self.load_locked(&target, manifest, cancel).await
    }

    /// Call `on_enable` and mark the plugin enabled
    ///
    /// Returns false when the plugin is unknown or the hook fails; a failed
    /// hook leaves the plugin registered in its prior state.
    pub async fn enable(&self, id: &str, cancel: &CancellationToken) -> bool {
        self.switch(id, true, cancel).await
    }

    /// Call `on_disable` and mark the plugin disabled
    pub async fn disable(&self, id: &str, cancel: &CancellationToken) -> bool {
        self.switch(id, false, cancel).await
    }

    /// Unload a plugin and tear down its isolation boundary
    ///
    /// Best-effort: every step runs even if an earlier one failed, and the
    /// plugin is always removed. Returns false if it was not loaded or any
    /// step failed.
    ///
    /// Not serialized with loads: a dependent whose dependency check passed
    /// just before this call keeps running against a removed dependency.
    pub async fn unload(&self, id: &str) -> bool {
        let Some((_, _, enabled)) = self.registry.instance(id).await else {
            tracing::warn!("Cannot unload '{}': not loaded", id);
            return false;
        };

        let cancel = CancellationToken::new();
        let mut clean = true;
        if enabled && !self.disable(id, &cancel).await {
            tracing::warn!(plugin = %id, "Disable failed during unload, continuing");
            clean = false;
        }

        let Some(plugin) = self.registry.remove(id).await else {
            tracing::warn!("Plugin '{}' was removed by a concurrent unload", id);
            return false;
        };
        let LoadedPlugin {
            instance,
            boundary,
            context,
            ..
        } = plugin;

        if let Err(e) = call_hook(Arc::clone(&instance), Hook::Unload, cancel).await {
            tracing::error!(plugin = %id, "on_unload failed: {}", e);
            clean = false;
        }

        drop(context);
        if Arc::strong_count(&instance) > 1 {
            tracing::warn!(plugin = %id, "Instance still referenced by an in-flight operation");
        }
        drop(instance);
        boundary.unload();

        self.audit.emit(
            id,
            AuditEventKind::Unloaded,
            if clean { "clean" } else { "completed with errors" },
        );
        tracing::info!(plugin = %id, "Unloaded plugin (clean: {})", clean);
        clean
    }

    /// Unload every plugin in reverse load order
    pub async fn unload_all(&self) -> Vec<(String, bool)> {
        let mut results = Vec::new();
        for id in self.registry.ids_in_load_order().await.into_iter().rev() {
            let clean = self.unload(&id).await;
            results.push((id, clean));
        }
        results
    }

    pub async fn get(&self, id: &str) -> Option<PluginInfo> {
        self.registry.get(id).await
    }

    pub async fn list(&self) -> Vec<PluginInfo> {
        self.registry.list().await
    }

    pub async fn is_loaded(&self, id: &str) -> bool {
        self.registry.contains(id).await
    }

    /// Isolation boundaries currently alive for `id`
    pub fn active_boundaries(&self, id: &str) -> usize {
        self.tracker.active(id)
    }

    async fn lock_loads(
        &self,
        cancel: &CancellationToken,
    ) -> Result<MutexGuard<'_, ()>, LoadError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(LoadError::Cancelled(
                "cancelled while waiting for the load lock".to_string(),
            )),
            guard = self.load_lock.lock() => Ok(guard),
        }
    }

    /// Steps 2-13 with the load lock held
    async fn load_locked(
        &self,
        directory: &Path,
        manifest: PluginManifest,
        cancel: &CancellationToken,
    ) -> Result<PluginInfo, LoadError> {
        let id = manifest.id.clone();
        let result = self.run_load(directory, manifest, cancel).await;
        match &result {
            Ok(info) => tracing::info!(
                plugin = %id,
                "Loaded {} v{} ({}, {} backend)",
                info.name,
                info.version,
                info.tier,
                info.backend
            ),
            Err(e) => self.report_failure(&id, e),
        }
        result
    }

    fn report_failure(&self, plugin_id: &str, error: &LoadError) {
        tracing::warn!(plugin = %plugin_id, "Load failed ({}): {}", error.kind(), error.reason());
        let kind = match error {
            LoadError::Security(_) => AuditEventKind::LoadRejected,
            _ => AuditEventKind::LoadFailed,
        };
        self.audit
            .emit(plugin_id, kind, format!("{}: {}", error.kind(), error.reason()));
    }

    async fn run_load(
        &self,
        directory: &Path,
        manifest: PluginManifest,
        cancel: &CancellationToken,
    ) -> Result<PluginInfo, LoadError> {
        let id = manifest.id.clone();

        checkpoint(cancel, "registry check")?;
        if self.registry.contains(&id).await {
            return Err(LoadError::AlreadyLoaded(id));
        }

        let entry_path = directory.join(&manifest.entry.binary);
        let verification = cancellable(
            cancel,
            "verification",
            self.verification.verify(&manifest, &entry_path),
        )
        .await?;
        self.enforce_signing_policy(&manifest, &verification)?;
        let tier = verification.tier();

        checkpoint(cancel, "compatibility check")?;
        self.check_compatibility(&manifest)?;

        checkpoint(cancel, "dependency check")?;
        self.check_dependencies(&manifest).await?;

        let requested = manifest.requested_permissions();
        let request = PermissionRequest {
            plugin_id: &id,
            plugin_name: &manifest.name,
            requested: &requested,
            tier,
        };
        let granted = cancellable(
            cancel,
            "permission negotiation",
            self.permissions.negotiate(request, self.prompt.as_ref()),
        )
        .await?;
        self.audit.emit(
            &id,
            AuditEventKind::PermissionsGranted,
            format!(
                "tier {}: granted [{}] of [{}]",
                tier,
                join_permissions(&granted),
                join_permissions(&requested)
            ),
        );

        checkpoint(cancel, "isolation")?;
        let backend = self.backends.select(&entry_path).ok_or_else(|| {
            LoadError::Load(format!(
                "no module backend supports '{}'",
                manifest.entry.binary
            ))
        })?;
        let boundary = IsolationBoundary::new(
            &id,
            &entry_path,
            Arc::clone(&self.policy),
            backend,
            self.tracker.clone(),
            Arc::clone(&self.audit),
        )
        .map_err(|e| LoadError::Load(format!("failed to create isolation boundary: {}", e)))?;

        let (instance, context, lifecycle) = match self
            .activate(&manifest, &boundary, &granted, cancel)
            .await
        {
            Ok(activated) => activated,
            Err(e) => {
                boundary.unload();
                return Err(e);
            }
        };

        let record = LoadedPlugin {
            manifest,
            instance,
            boundary,
            context,
            directory: directory.to_path_buf(),
            granted,
            tier,
            thumbprint: verification.thumbprint().map(str::to_string),
            enabled: false,
            state: lifecycle.state(),
            loaded_at: Utc::now(),
        };
        let info = record.info();

        if let Err(rejected) = self.registry.register(record).await {
            release(&id, rejected.instance).await;
            return Err(LoadError::AlreadyLoaded(id));
        }
        Ok(info)
    }

    fn enforce_signing_policy(
        &self,
        manifest: &PluginManifest,
        result: &VerificationResult,
    ) -> Result<(), LoadError> {
        if result.success() {
            return Ok(());
        }

        let reason = match result.status() {
            VerificationStatus::Unsigned => "plugin is unsigned".to_string(),
            _ => result.error().unwrap_or("verification failed").to_string(),
        };

        if self.options.require_signed {
            return Err(LoadError::Security(format!(
                "{}; signed plugins are required",
                reason
            )));
        }
        if result.status() == VerificationStatus::Invalid && self.options.reject_invalid_signatures
        {
            return Err(LoadError::Security(format!("invalid signature: {}", reason)));
        }

        tracing::warn!(
            plugin = %manifest.id,
            "Verification did not succeed ({}), continuing as {}",
            reason,
            result.tier()
        );
        Ok(())
    }

    /// Host version must lie within the inclusive bounds
    fn check_compatibility(&self, manifest: &PluginManifest) -> Result<(), LoadError> {
        let host = &self.options.host_version;
        let bounds = &manifest.compatibility;

        if let Some(min) = bounds.min_host_version.as_deref() {
            let min = parse_bound(min)?;
            if *host < min {
                return Err(LoadError::Compatibility(format!(
                    "requires host version >= {}, running {}",
                    min, host
                )));
            }
        }
        if let Some(max) = bounds.max_host_version.as_deref() {
            let max = parse_bound(max)?;
            if *host > max {
                return Err(LoadError::Compatibility(format!(
                    "requires host version <= {}, running {}",
                    max, host
                )));
            }
        }
        Ok(())
    }

    async fn check_dependencies(&self, manifest: &PluginManifest) -> Result<(), LoadError> {
        for dep in &manifest.dependencies {
            let Some((version, state)) = self.registry.dependency_status(&dep.id).await else {
                if dep.optional {
                    tracing::debug!(plugin = %manifest.id, "Optional dependency '{}' not loaded", dep.id);
                    continue;
                }
                return Err(LoadError::Dependency(match &dep.min_version {
                    Some(min) => format!("missing dependency '{}' (requires >= {})", dep.id, min),
                    None => format!("missing dependency '{}'", dep.id),
                }));
            };

            if dep.optional {
                continue;
            }
            if !state.is_active() {
                return Err(LoadError::Dependency(format!(
                    "dependency '{}' is {}",
                    dep.id, state
                )));
            }
            if let Some(min) = dep.min_version.as_deref() {
                let required = parse_bound(min)?;
                let actual = parse_version(&version).ok_or_else(|| {
                    LoadError::Dependency(format!(
                        "dependency '{}' has unparseable version '{}'",
                        dep.id, version
                    ))
                })?;
                if actual < required {
                    return Err(LoadError::Dependency(format!(
                        "dependency '{}' is version {}, requires >= {}",
                        dep.id, actual, required
                    )));
                }
            }
        }
        Ok(())
    }

    /// Steps 8-12: load, resolve, instantiate, build context, run hooks
    ///
    /// On error the instance is disposed before returning; the caller tears
    /// down the boundary.
    async fn activate(
        &self,
        manifest: &PluginManifest,
        boundary: &IsolationBoundary,
        granted: &PermissionSet,
        cancel: &CancellationToken,
    ) -> Result<(SharedInstance, PluginContext, Lifecycle), LoadError> {
        let id = manifest.id.as_str();
        let limits = manifest.limits();

        let image = cancellable(cancel, "entry load", boundary.load_entry(limits))
            .await?
            .map_err(|e| {
                if e.is_security_violation() {
                    LoadError::Security(e.to_string())
                } else {
                    LoadError::Load(format!(
                        "failed to load '{}': {}",
                        manifest.entry.binary, e
                    ))
                }
            })?;

        checkpoint(cancel, "instantiation")?;
        let instance = self.construct(manifest, image, cancel).await?;

        let storage_dir = self.options.storage_root.join(id);
        if let Err(e) = tokio::fs::create_dir_all(&storage_dir).await {
            release(id, instance).await;
            return Err(LoadError::Initialization(format!(
                "failed to create storage directory {}: {}",
                storage_dir.display(),
                e
            )));
        }

        let context = PluginContext::new(
            id,
            storage_dir,
            self.options.host_version.to_string(),
            granted.clone(),
            limits,
            LogHandle::new(Arc::new(TracingPluginLog {
                plugin_id: id.to_string(),
            })),
            Arc::clone(&self.services),
            boundary.module_handle(),
        );

        let mut lifecycle = Lifecycle::new();
        if let Err(e) = self
            .initialize(id, &instance, &context, &mut lifecycle, cancel)
            .await
        {
            lifecycle.fail();
            release(id, instance).await;
            return Err(e);
        }

        Ok((instance, context, lifecycle))
    }

    /// Run the entry type's constructor on the blocking pool
    async fn construct(
        &self,
        manifest: &PluginManifest,
        image: Arc<dyn ModuleImage>,
        cancel: &CancellationToken,
    ) -> Result<SharedInstance, LoadError> {
        let type_name = manifest.entry.type_name.clone();
        let step = format!("constructor of '{}'", type_name);
        let factory = Arc::clone(&image);
        let task = tokio::task::spawn_blocking(move || factory.instantiate(&type_name));

        let constructed = self
            .await_plugin_task(&manifest.id, &step, cancel, &cancel.child_token(), task)
            .await?;
        match constructed {
            Some(Ok(instance)) => Ok(Arc::new(Mutex::new(instance))),
            Some(Err(e)) => Err(LoadError::Initialization(format!(
                "failed to construct '{}': {}",
                manifest.entry.type_name, e
            ))),
            None => Err(LoadError::TypeNotFound(format!(
                "'{}' is not exported by '{}' (exports: [{}])",
                manifest.entry.type_name,
                manifest.entry.binary,
                image.exported_types().join(", ")
            ))),
        }
    }

    async fn initialize(
        &self,
        id: &str,
        instance: &SharedInstance,
        context: &PluginContext,
        lifecycle: &mut Lifecycle,
        cancel: &CancellationToken,
    ) -> Result<(), LoadError> {
        let hook_cancel = cancel.child_token();

        self.timed_hook(id, instance, Hook::Load(context.clone()), cancel, &hook_cancel)
            .await?;
        advance(lifecycle, LifecycleState::Loaded)?;
        self.audit.emit(id, AuditEventKind::Loaded, "on_load completed");

        self.timed_hook(id, instance, Hook::Initialize, cancel, &hook_cancel)
            .await?;
        advance(lifecycle, LifecycleState::Initialized)?;
        self.audit
            .emit(id, AuditEventKind::Initialized, "on_initialize completed");
        Ok(())
    }

    /// Run a load-time hook under the hook timeout and the caller's token
    ///
    /// `hook_cancel` is a child of `cancel` and is cancelled on timeout so a
    /// cooperative hook can stop its own work.
    async fn timed_hook(
        &self,
        plugin_id: &str,
        instance: &SharedInstance,
        hook: Hook,
        cancel: &CancellationToken,
        hook_cancel: &CancellationToken,
    ) -> Result<(), LoadError> {
        let name = hook.name();
        let task = spawn_hook(Arc::clone(instance), hook, hook_cancel.clone());
        match self
            .await_plugin_task(plugin_id, name, cancel, hook_cancel, task)
            .await?
        {
            Ok(()) => Ok(()),
            Err(PluginError::Cancelled) if cancel.is_cancelled() => {
                Err(LoadError::Cancelled(format!("cancelled during {}", name)))
            }
            Err(e) if e.is_security_violation() => Err(LoadError::Security(e.to_string())),
            Err(e) => Err(LoadError::Initialization(format!("{} failed: {}", name, e))),
        }
    }

    /// Wait for plugin code running on the blocking pool
    ///
    /// On timeout or cancellation `hook_cancel` is cancelled and the task is
    /// detached. A task stuck in plugin code holds its thread until it
    /// returns.
    async fn await_plugin_task<T>(
        &self,
        plugin_id: &str,
        step: &str,
        cancel: &CancellationToken,
        hook_cancel: &CancellationToken,
        task: JoinHandle<T>,
    ) -> Result<T, LoadError> {
        let limit = self.options.hook_timeout;
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                hook_cancel.cancel();
                Err(LoadError::Cancelled(format!("cancelled during {}", step)))
            }
            joined = tokio::time::timeout(limit, task) => match joined {
                Ok(Ok(output)) => Ok(output),
                Ok(Err(e)) if e.is_panic() => {
                    tracing::error!(plugin = %plugin_id, "{} panicked", step);
                    Err(LoadError::Initialization(format!("{} panicked", step)))
                }
                Ok(Err(e)) => Err(LoadError::Initialization(format!("{} aborted: {}", step, e))),
                Err(_) => {
                    hook_cancel.cancel();
                    tracing::error!(plugin = %plugin_id, "{} timed out after {:?}", step, limit);
                    Err(LoadError::Initialization(format!(
                        "{} timed out after {} ms",
                        step,
                        limit.as_millis()
                    )))
                }
            },
        }
    }

    async fn switch(&self, id: &str, enable: bool, cancel: &CancellationToken) -> bool {
        let (hook, target, kind) = if enable {
            (Hook::Enable, LifecycleState::Enabled, AuditEventKind::Enabled)
        } else {
            (Hook::Disable, LifecycleState::Disabled, AuditEventKind::Disabled)
        };

        let name = hook.name();
        let Some((instance, state, enabled)) = self.registry.instance(id).await else {
            tracing::warn!("Cannot run {} for '{}': not loaded", name, id);
            return false;
        };
        if enabled == enable {
            return true;
        }
        if !state.can_transition_to(target) {
            tracing::warn!(plugin = %id, "Cannot move from {} to {}", state, target);
            return false;
        }

        match call_hook(instance, hook, cancel.clone()).await {
            Ok(()) => {
                if !self.registry.set_state(id, target, enable).await {
                    tracing::warn!(plugin = %id, "Plugin was unloaded while {} ran", name);
                    return false;
                }
                self.audit.emit(id, kind, format!("{} completed", name));
                tracing::info!(plugin = %id, "Plugin {}", target);
                true
            }
            Err(e) => {
                tracing::error!(plugin = %id, "{} failed, staying {}: {}", name, state, e);
                false
            }
        }
    }
}

/// Run a hook on the blocking pool
///
/// The plugin holds a pool thread rather than a runtime worker, so a hook
/// that blocks cannot starve the loader and a panic comes back as a
/// `JoinError`. Unload and dispose always end with `dispose`.
fn spawn_hook(
    instance: SharedInstance,
    hook: Hook,
    cancel: CancellationToken,
) -> JoinHandle<Result<(), PluginError>> {
    let runtime = tokio::runtime::Handle::current();
    tokio::task::spawn_blocking(move || {
        runtime.block_on(async move {
            let mut guard = instance.lock().await;
            let plugin: &mut dyn Plugin = &mut **guard;
            let result = {
                let run = async {
                    match &hook {
                        Hook::Load(context) => plugin.on_load(context, &cancel).await,
                        Hook::Initialize => plugin.on_initialize(&cancel).await,
                        Hook::Enable => plugin.on_enable(&cancel).await,
                        Hook::Disable => plugin.on_disable(&cancel).await,
                        Hook::Unload => plugin.on_unload(&cancel).await,
                        Hook::Dispose => Ok(()),
                    }
                };
                tokio::select! {
                    result = run => result,
                    _ = cancel.cancelled() => Err(PluginError::Cancelled),
                }
            };
            if matches!(hook, Hook::Unload | Hook::Dispose) {
                plugin.dispose();
            }
            result
        })
    })
}

/// Run a post-load hook; a panic becomes a runtime error
async fn call_hook(
    instance: SharedInstance,
    hook: Hook,
    cancel: CancellationToken,
) -> Result<(), PluginError> {
    let name = hook.name();
    spawn_hook(instance, hook, cancel).await.map_err(|e| {
        if e.is_panic() {
            PluginError::Runtime(format!("{} panicked", name))
        } else {
            PluginError::Runtime(format!("{} aborted: {}", name, e))
        }
    })?
}

/// Dispose an instance that never reached the registry
///
/// Waits briefly; an instance still inside an abandoned hook is disposed
/// once that hook returns.
async fn release(plugin_id: &str, instance: SharedInstance) {
    let task = spawn_hook(instance, Hook::Dispose, CancellationToken::new());
    match tokio::time::timeout(DISPOSE_GRACE, task).await {
        Ok(Ok(_)) => {}
        Ok(Err(e)) => tracing::error!(plugin = %plugin_id, "dispose failed: {}", e),
        Err(_) => tracing::warn!(
            plugin = %plugin_id,
            "Instance is still inside a hook; disposing it when the hook returns"
        ),
    }
}

fn advance(lifecycle: &mut Lifecycle, next: LifecycleState) -> Result<(), LoadError> {
    lifecycle.transition(next).map_err(|(from, to)| {
        LoadError::Initialization(format!("illegal lifecycle transition {} -> {}", from, to))
    })
}

fn parse_bound(raw: &str) -> Result<semver::Version, LoadError> {
    parse_version(raw).ok_or_else(|| LoadError::Manifest(format!("'{}' is not a version", raw)))
}

fn checkpoint(cancel: &CancellationToken, step: &str) -> Result<(), LoadError> {
    if cancel.is_cancelled() {
        return Err(LoadError::Cancelled(format!("cancelled before {}", step)));
    }
    Ok(())
}

async fn cancellable<F: Future>(
    cancel: &CancellationToken,
    step: &str,
    future: F,
) -> Result<F::Output, LoadError> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(LoadError::Cancelled(format!("cancelled during {}", step))),
        output = future => Ok(output),
    }
}

fn join_permissions(set: &PermissionSet) -> String {
    set.iter().map(|p| p.as_str()).collect::<Vec<_>>().join(", ")
}

/// Audit label for a directory whose manifest could not be read
fn directory_label(directory: &Path) -> String {
    directory
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| directory.display().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint() {
        let cancel = CancellationToken::new();
        assert!(checkpoint(&cancel, "x").is_ok());
        cancel.cancel();
        assert_eq!(
            checkpoint(&cancel, "x").unwrap_err().kind(),
            LoadErrorKind::Cancelled
        );
    }

    #[tokio::test]
    async fn test_cancellable_prefers_cancellation() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let result = cancellable(&cancel, "step", async { 1 }).await;
        assert!(matches!(result, Err(LoadError::Cancelled(_))));
    }

    #[test]
    fn test_directory_label() {
        assert_eq!(directory_label(Path::new("/plugins/dps-meter")), "dps-meter");
    }

    #[test]
    fn test_default_options() {
        let options = LoaderOptions::new("/i", "/s", semver::Version::new(1, 0, 0));
        assert_eq!(options.hook_timeout, DEFAULT_HOOK_TIMEOUT);
        assert!(!options.reject_invalid_signatures);
        assert_eq!(options.require_signed, cfg!(feature = "production"));
    }
}
