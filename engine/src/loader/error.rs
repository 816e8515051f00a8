//! Load failure taxonomy
//!
//! Every failure of the loader's public surface is a typed [`LoadError`].
//! Callers branch on [`LoadError::kind`], never on the message.

use bulwark_sdk::{ErrorExt, ManifestError};
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Discriminant of a [`LoadError`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LoadErrorKind {
    Manifest,
    AlreadyLoaded,
    Security,
    Compatibility,
    Dependency,
    Load,
    TypeNotFound,
    Initialization,
    Cancelled,
}

impl fmt::Display for LoadErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            LoadErrorKind::Manifest => "manifest_error",
            LoadErrorKind::AlreadyLoaded => "already_loaded",
            LoadErrorKind::Security => "security_error",
            LoadErrorKind::Compatibility => "compatibility_error",
            LoadErrorKind::Dependency => "dependency_error",
            LoadErrorKind::Load => "load_error",
            LoadErrorKind::TypeNotFound => "type_not_found",
            LoadErrorKind::Initialization => "initialization_error",
            LoadErrorKind::Cancelled => "cancelled",
        };
        f.write_str(name)
    }
}

/// Typed failure of one load attempt
#[derive(Debug, Error)]
pub enum LoadError {
    #[error("Manifest error: {0}")]
    Manifest(String),

    #[error("Plugin '{0}' is already loaded")]
    AlreadyLoaded(String),

    #[error("Security error: {0}")]
    Security(String),

    #[error("Compatibility error: {0}")]
    Compatibility(String),

    #[error("Dependency error: {0}")]
    Dependency(String),

    #[error("Load error: {0}")]
    Load(String),

    #[error("Type not found: {0}")]
    TypeNotFound(String),

    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("Load cancelled: {0}")]
    Cancelled(String),
}

impl LoadError {
    pub fn kind(&self) -> LoadErrorKind {
        match self {
            LoadError::Manifest(_) => LoadErrorKind::Manifest,
            LoadError::AlreadyLoaded(_) => LoadErrorKind::AlreadyLoaded,
            LoadError::Security(_) => LoadErrorKind::Security,
            LoadError::Compatibility(_) => LoadErrorKind::Compatibility,
            LoadError::Dependency(_) => LoadErrorKind::Dependency,
            LoadError::Load(_) => LoadErrorKind::Load,
            LoadError::TypeNotFound(_) => LoadErrorKind::TypeNotFound,
            LoadError::Initialization(_) => LoadErrorKind::Initialization,
            LoadError::Cancelled(_) => LoadErrorKind::Cancelled,
        }
    }

    /// Human-readable reason without the kind prefix
    pub fn reason(&self) -> &str {
        match self {
            LoadError::Manifest(r)
            | LoadError::AlreadyLoaded(r)
            | LoadError::Security(r)
            | LoadError::Compatibility(r)
            | LoadError::Dependency(r)
            | LoadError::Load(r)
            | LoadError::TypeNotFound(r)
            | LoadError::Initialization(r)
            | LoadError::Cancelled(r) => r,
        }
    }
}

impl From<ManifestError> for LoadError {
    fn from(e: ManifestError) -> Self {
        LoadError::Manifest(e.to_string())
    }
}

impl ErrorExt for LoadError {
    fn user_hint(&self) -> &str {
        match self {
            LoadError::Manifest(_) => "Check the plugin's plugin.json",
            LoadError::AlreadyLoaded(_) => "Unload the plugin before loading it again",
            LoadError::Security(_) => {
                "Plugin was rejected by the security policy. Install a signed build"
            }
            LoadError::Compatibility(_) => "Install a plugin version built for this host version",
            LoadError::Dependency(_) => "Load the plugin's dependencies first",
            LoadError::Load(_) => "Plugin binary could not be loaded. Reinstall the plugin",
            LoadError::TypeNotFound(_) => "Plugin binary does not export the declared type",
            LoadError::Initialization(_) => "Plugin failed to start. Check plugin logs",
            LoadError::Cancelled(_) => "Load was cancelled",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            LoadError::Security(_) | LoadError::TypeNotFound(_) | LoadError::Compatibility(_) => {
                false
            }

            _ => true,
        }
    }
}
