//! Configuration management
//!
//! This module handles loading, validation, and management of the Bulwark
//! configuration. Configuration is stored in TOML format at
//! ~/.bulwark/config.toml.
//!
//! # Configuration Sections
//!
//! - **core**: Log level, data directory
//! - **plugins**: Install and storage roots, host version, signing policy
//! - **trust**: Thumbprint allow-lists, revocations, chain trust roots
//! - **audit**: Optional JSON-lines audit file
//! - **isolation**: Extra deny-list and shared-module entries
//!
//! # Path Expansion
//!
//! Every path supports `~` expansion. The data, install and storage
//! directories are created if they don't exist.
//!
//! # Examples
//!
//! ```no_run
//! use bulwark_engine::config::Config;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Config::load_or_create()?;
//! println!("Plugins: {:?}", config.plugins.install_dir);
//! println!("Require signed: {}", config.plugins.require_signed);
//! # Ok(())
//! # }
//! ```

use crate::isolation::IsolationPolicy;
use crate::loader::LoaderOptions;
use crate::signing::TrustRoot;
use bulwark_sdk::manifest::parse_version;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

/// Subject of the root key compiled into the binary
pub const OFFICIAL_ROOT_SUBJECT: &str = "Bulwark Official Root";

/// Official root public key (hex) baked in at build time, if one was provided
pub const BUILTIN_OFFICIAL_ROOT: Option<&str> = option_env!("BULWARK_OFFICIAL_ROOT");

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration error: {0}")]
    Invalid(String),

    #[error("Failed to read config file {0}: {1}")]
    Read(PathBuf, std::io::Error),

    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Failed to serialize config: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("Failed to write config file {0}: {1}")]
    Write(PathBuf, std::io::Error),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Core engine settings
    pub core: CoreConfig,

    /// Plugin loading policy and locations
    pub plugins: PluginsConfig,

    /// Signature trust settings
    #[serde(default)]
    pub trust: TrustConfig,

    /// Audit stream settings
    #[serde(default)]
    pub audit: AuditConfig,

    /// Isolation policy extensions
    #[serde(default)]
    pub isolation: IsolationConfig,
}

/// Core engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoreConfig {
    /// Log level (error, warn, info, debug, trace)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Data directory path (supports ~ expansion)
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
}

/// Plugin configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PluginsConfig {
    /// Managed install root (supports ~ expansion)
    #[serde(default = "default_install_dir")]
    pub install_dir: PathBuf,

    /// Root of per-plugin storage directories (supports ~ expansion)
    #[serde(default = "default_storage_dir")]
    pub storage_dir: PathBuf,

    /// Host version checked against plugin compatibility bounds
    #[serde(default = "default_host_version")]
    pub host_version: String,

    /// Timeout for on_load and on_initialize hooks
    #[serde(default = "default_hook_timeout_secs")]
    pub hook_timeout_secs: u64,

    /// Refuse plugins whose verification did not succeed
    #[serde(default = "default_require_signed")]
    pub require_signed: bool,

    /// Refuse plugins with invalid signatures even when unsigned ones may load
    #[serde(default)]
    pub reject_invalid_signatures: bool,
}

/// Trust configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrustConfig {
    /// Signer thumbprints granted the signed-trusted tier
    #[serde(default)]
    pub trusted_thumbprints: Vec<String>,

    /// Signer thumbprints granted the official tier
    #[serde(default)]
    pub official_thumbprints: Vec<String>,

    /// Revoked certificate serials
    #[serde(default)]
    pub revoked_serials: Vec<String>,

    /// Accept expired but otherwise valid certificates
    #[serde(default = "default_true")]
    pub allow_expired: bool,

    /// Chain trust roots in addition to the built-in official root
    #[serde(default)]
    pub roots: Vec<TrustRootConfig>,
}

impl Default for TrustConfig {
    fn default() -> Self {
        Self {
            trusted_thumbprints: Vec::new(),
            official_thumbprints: Vec::new(),
            revoked_serials: Vec::new(),
            allow_expired: true,
            roots: Vec::new(),
        }
    }
}

/// A configured chain trust root
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustRootConfig {
    pub subject: String,
    /// Hex-encoded Ed25519 public key
    pub public_key: String,
}

/// Audit configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Append-only JSON-lines audit file (supports ~ expansion)
    #[serde(default)]
    pub jsonl_path: Option<PathBuf>,
}

/// Isolation configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IsolationConfig {
    /// Module names denied in addition to the built-in deny-list
    #[serde(default)]
    pub extra_denied: Vec<String>,

    /// Module names shared from the host in addition to the built-in list
    #[serde(default)]
    pub extra_shared: Vec<String>,
}

// Default value functions
fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("~/.bulwark")
}

fn default_install_dir() -> PathBuf {
    PathBuf::from("~/.bulwark/plugins")
}

fn default_storage_dir() -> PathBuf {
    PathBuf::from("~/.bulwark/storage")
}

fn default_host_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_hook_timeout_secs() -> u64 {
    30
}

fn default_require_signed() -> bool {
    cfg!(feature = "production")
}

impl Config {
    /// Load configuration from the default location (~/.bulwark/config.toml)
    ///
    /// If the configuration file doesn't exist, creates a default configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or validation fails.
    pub fn load_or_create() -> Result<Self, ConfigError> {
        let config_path = Self::default_config_path()?;

        if config_path.exists() {
            Self::load_from_path(&config_path)
        } else {
            Self::create_default(&config_path)
        }
    }

    /// Load configuration from a specific path
    pub fn load_from_path(path: &Path) -> Result<Self, ConfigError> {
        let contents =
            fs::read_to_string(path).map_err(|e| ConfigError::Read(path.to_path_buf(), e))?;
        let mut config: Config = toml::from_str(&contents)?;
        config.validate_and_process()?;
        Ok(config)
    }

    /// Write the configuration to `path`
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| ConfigError::Write(parent.to_path_buf(), e))?;
        }
        let toml_string = toml::to_string_pretty(self)?;
        fs::write(path, toml_string).map_err(|e| ConfigError::Write(path.to_path_buf(), e))?;
        tracing::debug!("Saved configuration to {}", path.display());
        Ok(())
    }

    /// Create default configuration and save to path
    fn create_default(path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default_config();
        config.validate_and_process()?;
        config.save(path)?;
        tracing::info!("Created default configuration at {}", path.display());
        Ok(config)
    }

    /// Get the default configuration file path (~/.bulwark/config.toml)
    pub fn default_config_path() -> Result<PathBuf, ConfigError> {
        let home = dirs::home_dir()
            .ok_or_else(|| ConfigError::Invalid("Could not determine home directory".into()))?;
        Ok(home.join(".bulwark").join("config.toml"))
    }

    /// Create a default configuration
    pub fn default_config() -> Self {
        Self {
            core: CoreConfig {
                log_level: default_log_level(),
                data_dir: default_data_dir(),
            },
            plugins: PluginsConfig {
                install_dir: default_install_dir(),
                storage_dir: default_storage_dir(),
                host_version: default_host_version(),
                hook_timeout_secs: default_hook_timeout_secs(),
                require_signed: default_require_signed(),
                reject_invalid_signatures: false,
            },
            trust: TrustConfig::default(),
            audit: AuditConfig::default(),
            isolation: IsolationConfig::default(),
        }
    }

    /// Validate and process configuration
    ///
    /// Checks the log level, host version, hook timeout, thumbprints and root
    /// keys, normalizes thumbprints to uppercase, expands `~` and creates the
    /// data, install and storage directories.
    pub fn validate_and_process(&mut self) -> Result<(), ConfigError> {
        let valid_log_levels = ["error", "warn", "info", "debug", "trace"];
        if !valid_log_levels.contains(&self.core.log_level.as_str()) {
            return Err(ConfigError::Invalid(format!(
                "Invalid log level '{}'. Must be one of: {}",
                self.core.log_level,
                valid_log_levels.join(", ")
            )));
        }

        let host = parse_version(&self.plugins.host_version).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "host_version '{}' is not a version",
                self.plugins.host_version
            ))
        })?;
        self.plugins.host_version = host.to_string();

        if self.plugins.hook_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "hook_timeout_secs must be greater than 0".to_string(),
            ));
        }

        for list in [
            &mut self.trust.trusted_thumbprints,
            &mut self.trust.official_thumbprints,
        ] {
            for thumbprint in list.iter_mut() {
                *thumbprint = normalize_thumbprint(thumbprint)?;
            }
        }

        for root in &self.trust.roots {
            TrustRoot::from_hex(root.subject.clone(), &root.public_key).map_err(|e| {
                ConfigError::Invalid(format!("trust root '{}': {}", root.subject, e))
            })?;
        }

        self.core.data_dir = expand_path(&self.core.data_dir)?;
        self.plugins.install_dir = expand_path(&self.plugins.install_dir)?;
        self.plugins.storage_dir = expand_path(&self.plugins.storage_dir)?;
        if let Some(path) = &self.audit.jsonl_path {
            self.audit.jsonl_path = Some(expand_path(path)?);
        }

        for dir in [
            &self.core.data_dir,
            &self.plugins.install_dir,
            &self.plugins.storage_dir,
        ] {
            if !dir.exists() {
                fs::create_dir_all(dir).map_err(|e| {
                    ConfigError::Invalid(format!("Failed to create directory {:?}: {}", dir, e))
                })?;
            }
        }

        Ok(())
    }

    /// Host version as a parsed semver
    pub fn host_version(&self) -> Result<semver::Version, ConfigError> {
        parse_version(&self.plugins.host_version).ok_or_else(|| {
            ConfigError::Invalid(format!(
                "host_version '{}' is not a version",
                self.plugins.host_version
            ))
        })
    }

    pub fn hook_timeout(&self) -> Duration {
        Duration::from_secs(self.plugins.hook_timeout_secs)
    }

    /// Loader options derived from the `[plugins]` section
    pub fn loader_options(&self) -> Result<LoaderOptions, ConfigError> {
        let mut options = LoaderOptions::new(
            &self.plugins.install_dir,
            &self.plugins.storage_dir,
            self.host_version()?,
        );
        options.hook_timeout = self.hook_timeout();
        options.require_signed = self.plugins.require_signed;
        options.reject_invalid_signatures = self.plugins.reject_invalid_signatures;
        Ok(options)
    }

    /// Configured chain roots plus the built-in official root, if any
    pub fn trust_roots(&self) -> Result<Vec<TrustRoot>, ConfigError> {
        let mut roots = Vec::with_capacity(self.trust.roots.len() + 1);
        if let Some(key) = BUILTIN_OFFICIAL_ROOT {
            roots.push(TrustRoot::from_hex(OFFICIAL_ROOT_SUBJECT, key).map_err(|e| {
                ConfigError::Invalid(format!("built-in official root: {}", e))
            })?);
        }
        for root in &self.trust.roots {
            roots.push(
                TrustRoot::from_hex(root.subject.clone(), &root.public_key).map_err(|e| {
                    ConfigError::Invalid(format!("trust root '{}': {}", root.subject, e))
                })?,
            );
        }
        Ok(roots)
    }

    /// Isolation policy with the configured extensions applied
    pub fn isolation_policy(&self) -> IsolationPolicy {
        IsolationPolicy::default()
            .with_denied(self.isolation.extra_denied.iter().cloned())
            .with_shared(self.isolation.extra_shared.iter().cloned())
    }

    /// Add a thumbprint to the trusted or official allow-list
    ///
    /// Returns false if it was already present.
    pub fn add_thumbprint(&mut self, thumbprint: &str, official: bool) -> Result<bool, ConfigError> {
        let thumbprint = normalize_thumbprint(thumbprint)?;
        let list = if official {
            &mut self.trust.official_thumbprints
        } else {
            &mut self.trust.trusted_thumbprints
        };
        if list.contains(&thumbprint) {
            return Ok(false);
        }
        list.push(thumbprint);
        Ok(true)
    }

    /// Remove a thumbprint from both allow-lists
    ///
    /// Returns false if it was on neither.
    pub fn remove_thumbprint(&mut self, thumbprint: &str) -> Result<bool, ConfigError> {
        let thumbprint = normalize_thumbprint(thumbprint)?;
        let before = self.trust.trusted_thumbprints.len() + self.trust.official_thumbprints.len();
        self.trust.trusted_thumbprints.retain(|t| t != &thumbprint);
        self.trust.official_thumbprints.retain(|t| t != &thumbprint);
        let after = self.trust.trusted_thumbprints.len() + self.trust.official_thumbprints.len();
        Ok(after < before)
    }
}

/// Uppercase a hex thumbprint, rejecting anything that isn't hex
fn normalize_thumbprint(raw: &str) -> Result<String, ConfigError> {
    let trimmed = raw.trim();
    if trimmed.is_empty() || hex::decode(trimmed).is_err() {
        return Err(ConfigError::Invalid(format!(
            "thumbprint '{}' is not a hex string",
            raw
        )));
    }
    Ok(trimmed.to_ascii_uppercase())
}

/// Expand ~ in path to user's home directory
fn expand_path(path: &Path) -> Result<PathBuf, ConfigError> {
    let path_str = path
        .to_str()
        .ok_or_else(|| ConfigError::Invalid("Invalid UTF-8 in path".to_string()))?;

    if let Some(rest) = path_str.strip_prefix("~/") {
        let home = dirs::home_dir()
            .ok_or_else(|| ConfigError::Invalid("Could not determine home directory".into()))?;
        Ok(home.join(rest))
    } else if path_str == "~" {
        dirs::home_dir()
            .ok_or_else(|| ConfigError::Invalid("Could not determine home directory".into()))
    } else {
        Ok(path.to_path_buf())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config_in(dir: &Path) -> Config {
        let mut config = Config::default_config();
        config.core.data_dir = dir.join("data");
        config.plugins.install_dir = dir.join("plugins");
        config.plugins.storage_dir = dir.join("storage");
        config
    }

    #[test]
    fn test_default_config_creation() {
        let config = Config::default_config();

        assert_eq!(config.core.log_level, "info");
        assert_eq!(config.plugins.hook_timeout_secs, 30);
        assert!(!config.plugins.reject_invalid_signatures);
        assert!(config.trust.allow_expired);
    }

    #[test]
    fn test_validate_creates_directories() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.validate_and_process().unwrap();

        assert!(dir.path().join("plugins").is_dir());
        assert!(dir.path().join("storage").is_dir());
    }

    #[test]
    fn test_invalid_log_level_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.core.log_level = "loud".into();
        assert!(config.validate_and_process().is_err());
    }

    #[test]
    fn test_host_version_normalized() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.plugins.host_version = "2.1".into();
        config.validate_and_process().unwrap();
        assert_eq!(config.plugins.host_version, "2.1.0");

        config.plugins.host_version = "latest".into();
        assert!(config.validate_and_process().is_err());
    }

    #[test]
    fn test_zero_hook_timeout_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.plugins.hook_timeout_secs = 0;
        assert!(config.validate_and_process().is_err());
    }

    #[test]
    fn test_bad_root_key_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_in(dir.path());
        config.trust.roots.push(TrustRootConfig {
            subject: "Vendor CA".into(),
            public_key: "abcd".into(),
        });
        assert!(config.validate_and_process().is_err());
    }

    #[test]
    fn test_thumbprint_add_remove() {
        let mut config = Config::default_config();
        assert!(config.add_thumbprint("ab12", false).unwrap());
        assert!(!config.add_thumbprint("AB12", false).unwrap());
        assert!(config.add_thumbprint("cd34", true).unwrap());
        assert_eq!(config.trust.trusted_thumbprints, vec!["AB12".to_string()]);

        assert!(config.remove_thumbprint("cd34").unwrap());
        assert!(!config.remove_thumbprint("cd34").unwrap());
        assert!(config.add_thumbprint("not hex", true).is_err());
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.toml");
        let mut config = config_in(dir.path());
        config.add_thumbprint("ff00", true).unwrap();
        config.isolation.extra_denied.push("evil_crate".into());
        config.validate_and_process().unwrap();
        config.save(&path).unwrap();

        let loaded = Config::load_from_path(&path).unwrap();
        assert_eq!(loaded.trust.official_thumbprints, vec!["FF00".to_string()]);
        assert!(loaded.isolation_policy().is_denied("evil_crate"));
        assert_eq!(loaded.loader_options().unwrap().install_dir, dir.path().join("plugins"));
    }

    #[test]
    fn test_expand_path_with_tilde() {
        let expanded = expand_path(&PathBuf::from("~/test")).unwrap();
        let home = dirs::home_dir().unwrap();
        assert_eq!(expanded, home.join("test"));
    }

    #[test]
    fn test_expand_path_without_tilde() {
        let path = PathBuf::from("/absolute/path");
        assert_eq!(expand_path(&path).unwrap(), path);
    }
}
