//! Error types and handling
//!
//! This module provides the error type plugins and the host exchange across the
//! plugin capability interface. All errors implement the `ErrorExt` trait which
//! provides user-friendly hints and indicates whether errors are recoverable.
//!
//! # Security
//!
//! Error messages never carry file contents, signing material or host
//! internals. Module and plugin identifiers are included so that security
//! violations can be attributed.

use thiserror::Error;

/// Trait for Bulwark error extensions
///
/// This trait provides additional context for errors, including user-friendly
/// hints and recoverability information.
pub trait ErrorExt {
    /// Returns a user-friendly hint for the error
    ///
    /// The hint is safe to display to end users and does not contain
    /// internal implementation details.
    fn user_hint(&self) -> &str;

    /// Returns whether the error is recoverable
    ///
    /// Recoverable errors can be retried or worked around. Non-recoverable
    /// errors require the plugin to be fixed, re-signed or removed.
    fn is_recoverable(&self) -> bool;
}

/// Error raised by plugin hooks and by the sandboxed services handed to plugins
///
/// # Examples
///
/// ```
/// use bulwark_sdk::errors::{ErrorExt, PluginError};
///
/// let error = PluginError::SecurityViolation {
///     plugin_id: "dps-meter".to_string(),
///     module: "std::process".to_string(),
/// };
/// assert!(error.to_string().contains("dps-meter"));
/// assert!(!error.is_recoverable());
/// ```
#[derive(Debug, Error)]
pub enum PluginError {
    /// The plugin attempted to resolve a module on the host deny-list
    #[error("Security violation: plugin '{plugin_id}' attempted to load denied module '{module}'")]
    SecurityViolation { plugin_id: String, module: String },

    /// The plugin attempted to load a native library
    #[error("Security violation: plugin '{plugin_id}' attempted to load native library '{library}'")]
    NativeLibraryDenied { plugin_id: String, library: String },

    /// The plugin's isolation boundary has already been torn down
    #[error("Isolation boundary for plugin '{0}' has been unloaded")]
    BoundaryUnloaded(String),

    /// A required permission was not granted
    #[error("Permission denied: {0}")]
    PermissionDenied(String),

    /// A hook observed cancellation and stopped early
    #[error("Operation cancelled")]
    Cancelled,

    /// Plugin construction failed
    #[error("Construction failed: {0}")]
    Construction(String),

    /// A lifecycle hook failed
    #[error("Hook failed: {0}")]
    Hook(String),

    /// Failure inside a module backend (native or WASM)
    #[error("Runtime error: {0}")]
    Runtime(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PluginError {
    /// Convenience constructor for hook failures
    pub fn hook(message: impl Into<String>) -> Self {
        Self::Hook(message.into())
    }

    /// Returns true for errors raised by the isolation policy
    pub fn is_security_violation(&self) -> bool {
        matches!(
            self,
            Self::SecurityViolation { .. } | Self::NativeLibraryDenied { .. }
        )
    }
}

impl ErrorExt for PluginError {
    fn user_hint(&self) -> &str {
        match self {
            Self::SecurityViolation { .. } => {
                "Plugin tried to use a forbidden host facility and was blocked"
            }
            Self::NativeLibraryDenied { .. } => "Plugins may not load native libraries",
            Self::BoundaryUnloaded(_) => "Plugin has been unloaded. Load it again to use it",
            Self::PermissionDenied(_) => "Grant the plugin the required permission",
            Self::Cancelled => "Operation was cancelled",
            Self::Construction(_) => "Plugin could not be created. Check plugin logs",
            Self::Hook(_) => "Plugin reported an error. Check plugin logs",
            Self::Runtime(_) => "Plugin runtime failed. Check plugin logs",
            Self::Serialization(_) => "Plugin exchanged malformed data",
            Self::Io(_) => "File system operation failed",
        }
    }

    fn is_recoverable(&self) -> bool {
        match self {
            // Policy rejections never succeed on retry
            Self::SecurityViolation { .. }
            | Self::NativeLibraryDenied { .. }
            | Self::BoundaryUnloaded(_) => false,

            _ => true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_security_violation_names_plugin_and_module() {
        let err = PluginError::SecurityViolation {
            plugin_id: "dps-meter".into(),
            module: "libloading".into(),
        };
        let msg = err.to_string();
        assert!(msg.contains("dps-meter"));
        assert!(msg.contains("libloading"));
        assert!(err.is_security_violation());
        assert!(!err.is_recoverable());
    }

    #[test]
    fn test_native_library_denied_is_security_violation() {
        let err = PluginError::NativeLibraryDenied {
            plugin_id: "p".into(),
            library: "libc.so.6".into(),
        };
        assert!(err.is_security_violation());
        assert_eq!(err.user_hint(), "Plugins may not load native libraries");
    }

    #[test]
    fn test_hook_errors_are_recoverable() {
        let err = PluginError::hook("database busy");
        assert_eq!(err.to_string(), "Hook failed: database busy");
        assert!(err.is_recoverable());
        assert!(!err.is_security_violation());
    }

    #[test]
    fn test_from_io_error() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file missing");
        let err: PluginError = io_err.into();
        assert!(matches!(err, PluginError::Io(_)));
        assert!(err.to_string().contains("file missing"));
    }
}
