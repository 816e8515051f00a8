//! Plugin capability interface
//!
//! This module defines the `Plugin` trait that every plugin type must
//! implement. The host drives an instance through its lifecycle:
//!
//! `on_load` → `on_initialize` → (`on_enable` ⇄ `on_disable`) → `on_unload` → `dispose`
//!
//! Every hook receives a cancellation token. Long-running hooks should check
//! it and return `PluginError::Cancelled` once it fires. `on_load` and
//! `on_initialize` are additionally bounded by a host-imposed timeout; when it
//! expires the token is cancelled and the hook's future is dropped.

use crate::context::PluginContext;
use crate::errors::PluginError;
use crate::manifest::PluginKind;
use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

/// Trait that all plugin types must implement
///
/// Plugins are constructed through a factory registered with the host (see
/// [`crate::abi`]) and must be `Send + Sync` so the host can drive them from
/// any task.
///
/// # Examples
///
/// ```
/// use async_trait::async_trait;
/// use bulwark_sdk::{Plugin, PluginContext, PluginError};
/// use tokio_util::sync::CancellationToken;
///
/// #[derive(Default)]
/// struct Counter {
///     ctx: Option<PluginContext>,
/// }
///
/// #[async_trait]
/// impl Plugin for Counter {
///     async fn on_load(
///         &mut self,
///         ctx: &PluginContext,
///         _cancel: &CancellationToken,
///     ) -> Result<(), PluginError> {
///         ctx.log().info("counter loaded");
///         self.ctx = Some(ctx.clone());
///         Ok(())
///     }
/// }
/// ```
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Role the plugin plays; specialized roles extend this base interface
    fn kind(&self) -> PluginKind {
        PluginKind::General
    }

    /// Called once after construction with the plugin's sandboxed context
    async fn on_load(
        &mut self,
        ctx: &PluginContext,
        cancel: &CancellationToken,
    ) -> Result<(), PluginError>;

    /// Called once after `on_load` succeeded
    async fn on_initialize(&mut self, _cancel: &CancellationToken) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_enable(&mut self, _cancel: &CancellationToken) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_disable(&mut self, _cancel: &CancellationToken) -> Result<(), PluginError> {
        Ok(())
    }

    /// Called once before the instance is disposed
    async fn on_unload(&mut self, _cancel: &CancellationToken) -> Result<(), PluginError> {
        Ok(())
    }

    /// Release resources synchronously. Called exactly once, after the last hook.
    fn dispose(&mut self) {}
}
