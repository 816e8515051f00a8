//! Bulwark Engine Library
//!
//! Plugin isolation and trust host: verifies plugin binaries, negotiates
//! permissions, loads each plugin behind its own isolation boundary and
//! drives the plugin lifecycle. Used by the `bulwark` binary and by
//! integration tests.

/// Append-only security audit stream
pub mod audit;

/// Embedded signature format and certificate chains
pub mod signing;

/// Binary verification and trust tiers
pub mod verification;

/// Per-plugin isolation boundaries and module backends
pub mod isolation;

/// Permission negotiation
pub mod permissions;

/// Plugin lifecycle state machine
pub mod lifecycle;

/// Registry of loaded plugins
pub mod registry;

/// Plugin load orchestration
pub mod loader;

/// Configuration management module
pub mod config;

/// Telemetry and Observability
pub mod telemetry;

/// CLI interface module
pub mod cli;

/// Command handlers module
pub mod handlers;

pub use loader::{LoadError, LoadErrorKind, LoaderOptions, PluginLoader};
pub use registry::PluginInfo;
pub use verification::{TrustTier, VerificationResult, VerificationService};
