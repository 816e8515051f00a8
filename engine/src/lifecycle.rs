//! Plugin lifecycle state machine
//!
//! `Unloaded → Loaded → Initialized → {Enabled ⇄ Disabled} → Unloaded`,
//! plus the absorbing `Error` state reachable from any state.

use serde::Serialize;
use std::fmt;

/// Current state of a plugin instance
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleState {
    Unloaded,
    Loaded,
    Initialized,
    Enabled,
    Disabled,
    Error,
}

impl LifecycleState {
    /// Whether moving from `self` to `next` is a legal transition
    pub fn can_transition_to(self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (self, next) {
            (Error, _) => false,
            (_, Error) => true,
            (Unloaded, Loaded) => true,
            (Loaded, Initialized) => true,
            (Initialized, Enabled) | (Initialized, Disabled) => true,
            (Enabled, Disabled) | (Disabled, Enabled) => true,
            (Loaded | Initialized | Enabled | Disabled, Unloaded) => true,
            _ => false,
        }
    }

    /// States in which the plugin is registered and usable
    pub fn is_active(self) -> bool {
        matches!(
            self,
            LifecycleState::Initialized | LifecycleState::Enabled | LifecycleState::Disabled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LifecycleState::Unloaded => "unloaded",
            LifecycleState::Loaded => "loaded",
            LifecycleState::Initialized => "initialized",
            LifecycleState::Enabled => "enabled",
            LifecycleState::Disabled => "disabled",
            LifecycleState::Error => "error",
        }
    }
}

impl fmt::Display for LifecycleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Tracks one instance's state and refuses illegal transitions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lifecycle {
    state: LifecycleState,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self {
            state: LifecycleState::Unloaded,
        }
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> LifecycleState {
        self.state
    }

    /// Move to `next`, returning the illegal pair on failure
    pub fn transition(
        &mut self,
        next: LifecycleState,
    ) -> Result<(), (LifecycleState, LifecycleState)> {
        if !self.state.can_transition_to(next) {
            return Err((self.state, next));
        }
        self.state = next;
        Ok(())
    }

    /// Enter the absorbing error state
    pub fn fail(&mut self) {
        self.state = LifecycleState::Error;
    }
}
