//! Manifest types for plugin metadata
//!
//! Every plugin install directory carries one `plugin.json` describing the
//! plugin's identity, entry point, requested permissions, dependencies and
//! compatibility bounds. The identifier is the primary key across the host.

use crate::permissions::{Permission, PermissionSet};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

/// File name of the manifest inside a plugin directory
pub const MANIFEST_FILE_NAME: &str = "plugin.json";

/// Manifest parse and validation errors
#[derive(Debug, Error)]
pub enum ManifestError {
    #[error("Malformed manifest: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid manifest field '{field}': {reason}")]
    Invalid { field: String, reason: String },
}

impl ManifestError {
    fn invalid(field: &str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field: field.to_string(),
            reason: reason.into(),
        }
    }
}

/// Role a plugin plays inside the host
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PluginKind {
    DataAnalysis,
    Export,
    UiComponent,
    CustomParser,
    #[default]
    General,
}

/// Entry binary and the exported type implementing the plugin interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntryPoint {
    /// File name of the entry binary, relative to the plugin directory
    pub binary: String,
    /// Name of the exported plugin type inside the binary
    pub type_name: String,
}

/// Dependency on another plugin
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySpec {
    pub id: String,
    #[serde(default)]
    pub min_version: Option<String>,
    #[serde(default)]
    pub optional: bool,
}

/// Inclusive host version bounds
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Compatibility {
    #[serde(default)]
    pub min_host_version: Option<String>,
    #[serde(default)]
    pub max_host_version: Option<String>,
}

/// Resource limits a plugin declares for itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceLimits {
    /// Maximum memory in megabytes (enforced by the WASM backend)
    #[serde(default = "default_max_memory_mb")]
    pub max_memory_mb: u32,
    /// Maximum size of the plugin's storage directory in megabytes
    #[serde(default = "default_max_storage_mb")]
    pub max_storage_mb: u32,
    /// Maximum duration of a single call into the plugin in milliseconds
    #[serde(default = "default_max_call_ms")]
    pub max_call_ms: u64,
}

fn default_max_memory_mb() -> u32 {
    64
}

fn default_max_storage_mb() -> u32 {
    100
}

fn default_max_call_ms() -> u64 {
    5_000
}

impl Default for ResourceLimits {
    fn default() -> Self {
        Self {
            max_memory_mb: default_max_memory_mb(),
            max_storage_mb: default_max_storage_mb(),
            max_call_ms: default_max_call_ms(),
        }
    }
}

/// Plugin manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PluginManifest {
    pub id: String,
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub author: String,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub kind: PluginKind,
    pub entry: EntryPoint,
    #[serde(default)]
    pub permissions: Vec<Permission>,
    #[serde(default)]
    pub dependencies: Vec<DependencySpec>,
    #[serde(default)]
    pub compatibility: Compatibility,
    /// Expected signer certificate thumbprint (hex, case-insensitive)
    #[serde(default)]
    pub signer_thumbprint: Option<String>,
    #[serde(default)]
    pub resource_limits: Option<ResourceLimits>,
}

impl PluginManifest {
    /// Parse and validate a manifest from a JSON string
    pub fn from_json(json: &str) -> Result<Self, ManifestError> {
        let manifest: PluginManifest = serde_json::from_str(json)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Serialize manifest to a pretty JSON string
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Requested permissions as a set
    pub fn requested_permissions(&self) -> PermissionSet {
        self.permissions.iter().copied().collect()
    }

    /// Declared limits, or the defaults when the manifest has none
    pub fn limits(&self) -> ResourceLimits {
        self.resource_limits.unwrap_or_default()
    }

    /// Parsed plugin version
    pub fn semver(&self) -> Result<semver::Version, ManifestError> {
        parse_version(&self.version).ok_or_else(|| {
            ManifestError::invalid("version", format!("'{}' is not a version", self.version))
        })
    }

    /// Check structural invariants the serde schema cannot express
    pub fn validate(&self) -> Result<(), ManifestError> {
        if !is_valid_id(&self.id) {
            return Err(ManifestError::invalid(
                "id",
                "must be non-empty and contain only a-z, 0-9, '.', '_' or '-'",
            ));
        }
        if self.name.trim().is_empty() {
            return Err(ManifestError::invalid("name", "must not be empty"));
        }
        self.semver()?;

        if self.entry.binary.trim().is_empty() {
            return Err(ManifestError::invalid("entry.binary", "must not be empty"));
        }
        if self.entry.binary.contains(['/', '\\']) || self.entry.binary.contains("..") {
            return Err(ManifestError::invalid(
                "entry.binary",
                "must be a plain file name inside the plugin directory",
            ));
        }
        if self.entry.type_name.trim().is_empty() {
            return Err(ManifestError::invalid("entry.type_name", "must not be empty"));
        }

        let mut seen = HashSet::new();
        for dep in &self.dependencies {
            if dep.id == self.id {
                return Err(ManifestError::invalid(
                    "dependencies",
                    "plugin cannot depend on itself",
                ));
            }
            if !seen.insert(dep.id.as_str()) {
                return Err(ManifestError::invalid(
                    "dependencies",
                    format!("duplicate dependency '{}'", dep.id),
                ));
            }
            if let Some(min) = &dep.min_version {
                if parse_version(min).is_none() {
                    return Err(ManifestError::invalid(
                        "dependencies",
                        format!("'{}' is not a version (dependency '{}')", min, dep.id),
                    ));
                }
            }
        }

        for (field, bound) in [
            ("compatibility.min_host_version", &self.compatibility.min_host_version),
            ("compatibility.max_host_version", &self.compatibility.max_host_version),
        ] {
            if let Some(bound) = bound {
                if parse_version(bound).is_none() {
                    return Err(ManifestError::invalid(
                        field,
                        format!("'{}' is not a version", bound),
                    ));
                }
            }
        }

        Ok(())
    }
}

fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || matches!(c, '.' | '_' | '-'))
}

/// Parse a version, accepting short forms such as `1` or `1.2`
///
/// # Examples
///
/// ```
/// use bulwark_sdk::manifest::parse_version;
///
/// assert_eq!(parse_version("1.2").unwrap(), semver::Version::new(1, 2, 0));
/// assert!(parse_version("latest").is_none());
/// ```
pub fn parse_version(raw: &str) -> Option<semver::Version> {
    let raw = raw.trim().trim_start_matches('v');
    if let Ok(version) = semver::Version::parse(raw) {
        return Some(version);
    }

    let parts: Vec<&str> = raw.split('.').collect();
    if parts.is_empty() || parts.len() > 3 {
        return None;
    }
    let mut numbers = [0u64; 3];
    for (slot, part) in numbers.iter_mut().zip(&parts) {
        *slot = part.parse().ok()?;
    }
    Some(semver::Version::new(numbers[0], numbers[1], numbers[2]))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_json() -> String {
        serde_json::json!({
            "id": "dps-meter",
            "name": "DPS Meter",
            "version": "1.4.0",
            "author": "Bulwark Team",
            "kind": "data_analysis",
            "entry": { "binary": "libdps_meter.so", "type_name": "DpsMeter" },
            "permissions": ["read_logs", "network"],
            "dependencies": [
                { "id": "core-utils", "min_version": "1.2.0" },
                { "id": "charts", "optional": true }
            ],
            "compatibility": { "min_host_version": "0.1.0", "max_host_version": "2.0" },
            "signer_thumbprint": "ABCDEF"
        })
        .to_string()
    }

    #[test]
    fn test_parse_full_manifest() {
        let manifest = PluginManifest::from_json(&sample_json()).unwrap();
        assert_eq!(manifest.id, "dps-meter");
        assert_eq!(manifest.kind, PluginKind::DataAnalysis);
        assert_eq!(manifest.entry.type_name, "DpsMeter");
        assert_eq!(manifest.dependencies.len(), 2);
        assert!(manifest.dependencies[1].optional);
        assert!(manifest.requested_permissions().contains(&Permission::Network));
        assert_eq!(manifest.limits(), ResourceLimits::default());
    }

    #[test]
    fn test_minimal_manifest_uses_defaults() {
        let json = r#"{
            "id": "minimal",
            "name": "Minimal",
            "version": "0.1.0",
            "entry": { "binary": "minimal.wasm", "type_name": "Minimal" }
        }"#;
        let manifest = PluginManifest::from_json(json).unwrap();
        assert_eq!(manifest.kind, PluginKind::General);
        assert!(manifest.permissions.is_empty());
        assert!(manifest.signer_thumbprint.is_none());
    }

    #[test]
    fn test_unknown_permission_is_rejected() {
        let json = r#"{
            "id": "x", "name": "X", "version": "1.0.0",
            "entry": { "binary": "x.so", "type_name": "X" },
            "permissions": ["root_access"]
        }"#;
        assert!(matches!(
            PluginManifest::from_json(json),
            Err(ManifestError::Parse(_))
        ));
    }

    #[test]
    fn test_invalid_id_rejected() {
        let json = r#"{
            "id": "Bad Id", "name": "X", "version": "1.0.0",
            "entry": { "binary": "x.so", "type_name": "X" }
        }"#;
        let err = PluginManifest::from_json(json).unwrap_err();
        assert!(err.to_string().contains("'id'"));
    }

    #[test]
    fn test_entry_binary_must_not_escape_directory() {
        let json = r#"{
            "id": "x", "name": "X", "version": "1.0.0",
            "entry": { "binary": "../../evil.so", "type_name": "X" }
        }"#;
        assert!(PluginManifest::from_json(json).is_err());
    }

    #[test]
    fn test_self_dependency_rejected() {
        let json = r#"{
            "id": "x", "name": "X", "version": "1.0.0",
            "entry": { "binary": "x.so", "type_name": "X" },
            "dependencies": [{ "id": "x" }]
        }"#;
        assert!(PluginManifest::from_json(json).is_err());
    }

    #[test]
    fn test_parse_version_short_forms() {
        assert_eq!(parse_version("2").unwrap(), semver::Version::new(2, 0, 0));
        assert_eq!(parse_version("v1.2.3").unwrap(), semver::Version::new(1, 2, 3));
        assert!(parse_version("1.2.3.4").is_none());
        assert!(parse_version("").is_none());
    }
}
