//! Capability names plugins request and the host grants

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// A named, revocable grant that gates access to a sandboxed service
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Permission {
    /// Read parsed combat log events
    ReadLogs,
    /// Read aggregated statistics
    ReadStatistics,
    /// Read files outside the plugin's storage directory
    FileSystemRead,
    /// Write files outside the plugin's storage directory
    FileSystemWrite,
    /// Make outbound network requests
    Network,
    /// Read and write the system clipboard
    Clipboard,
    /// Show notifications
    Notifications,
    /// Contribute UI components
    UserInterface,
    /// Read and write host settings
    Settings,
    /// Export data through host exporters
    Export,
}

impl Permission {
    /// Every permission, in declaration order
    pub const ALL: [Permission; 10] = [
        Permission::ReadLogs,
        Permission::ReadStatistics,
        Permission::FileSystemRead,
        Permission::FileSystemWrite,
        Permission::Network,
        Permission::Clipboard,
        Permission::Notifications,
        Permission::UserInterface,
        Permission::Settings,
        Permission::Export,
    ];

    /// Permissions that can leak data off the machine or modify user files
    pub fn is_sensitive(&self) -> bool {
        matches!(
            self,
            Permission::FileSystemWrite | Permission::Network | Permission::Clipboard
        )
    }

    /// Stable snake_case name, identical to the manifest spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Permission::ReadLogs => "read_logs",
            Permission::ReadStatistics => "read_statistics",
            Permission::FileSystemRead => "file_system_read",
            Permission::FileSystemWrite => "file_system_write",
            Permission::Network => "network",
            Permission::Clipboard => "clipboard",
            Permission::Notifications => "notifications",
            Permission::UserInterface => "user_interface",
            Permission::Settings => "settings",
            Permission::Export => "export",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ordered set of permissions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PermissionSet(BTreeSet<Permission>);

impl PermissionSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, permission: Permission) -> bool {
        self.0.insert(permission)
    }

    pub fn remove(&mut self, permission: &Permission) -> bool {
        self.0.remove(permission)
    }

    pub fn contains(&self, permission: &Permission) -> bool {
        self.0.contains(permission)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Permission> {
        self.0.iter()
    }

    /// True when every permission in `self` is also in `other`
    pub fn is_subset(&self, other: &PermissionSet) -> bool {
        self.0.is_subset(&other.0)
    }

    /// Permissions in `self` that are missing from `other`
    pub fn difference(&self, other: &PermissionSet) -> PermissionSet {
        PermissionSet(self.0.difference(&other.0).copied().collect())
    }
}

impl FromIterator<Permission> for PermissionSet {
    fn from_iter<I: IntoIterator<Item = Permission>>(iter: I) -> Self {
        PermissionSet(iter.into_iter().collect())
    }
}

impl<'a> IntoIterator for &'a PermissionSet {
    type Item = &'a Permission;
    type IntoIter = std::collections::btree_set::Iter<'a, Permission>;

    fn into_iter(self) -> Self::IntoIter {
        self.0.iter()
    }
}

impl fmt::Display for PermissionSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.0.iter().map(Permission::as_str).collect();
        write!(f, "[{}]", names.join(", "))
    }
}
