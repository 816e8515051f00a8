//! Permission negotiation
//!
//! Reconciles the permissions a plugin requests with its trust tier and,
//! where policy asks for it, an interactive prompt. The granted set is always
//! a subset of the request; plugins must tolerate partial grants.

use crate::verification::TrustTier;
use async_trait::async_trait;
use bulwark_sdk::{Permission, PermissionSet};

/// Permissions granted to untrusted plugins without asking
pub const UNTRUSTED_AUTO_GRANT: &[Permission] = &[
    Permission::ReadLogs,
    Permission::ReadStatistics,
    Permission::UserInterface,
    Permission::Notifications,
];

/// A permission negotiation request for one plugin
#[derive(Debug, Clone)]
pub struct PermissionRequest<'a> {
    pub plugin_id: &'a str,
    pub plugin_name: &'a str,
    pub requested: &'a PermissionSet,
    pub tier: TrustTier,
}

/// Channel used to ask the operator about a single permission
#[async_trait]
pub trait PermissionPrompt: Send + Sync {
    async fn confirm(&self, plugin_id: &str, permission: Permission, tier: TrustTier) -> bool;
}

/// Prompt that declines everything; used for unattended runs
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAllPrompt;

#[async_trait]
impl PermissionPrompt for DenyAllPrompt {
    async fn confirm(&self, _plugin_id: &str, _permission: Permission, _tier: TrustTier) -> bool {
        false
    }
}

/// Prompt that accepts everything
#[derive(Debug, Default, Clone, Copy)]
pub struct AllowAllPrompt;

#[async_trait]
impl PermissionPrompt for AllowAllPrompt {
    async fn confirm(&self, _plugin_id: &str, _permission: Permission, _tier: TrustTier) -> bool {
        true
    }
}

/// Decides the granted permission set for a plugin
#[async_trait]
pub trait PermissionManager: Send + Sync {
    async fn negotiate(
        &self,
        request: PermissionRequest<'_>,
        prompt: &dyn PermissionPrompt,
    ) -> PermissionSet;
}

/// How a tier treats one requested permission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Decision {
    Grant,
    Prompt,
    Deny,
}

/// Default tier-based policy
///
/// - `OfficialTrusted`: everything requested
/// - `SignedTrusted`: non-sensitive granted, sensitive prompted
/// - `Untrusted`: a read-only baseline granted, sensitive denied, the rest prompted
#[derive(Debug, Default, Clone, Copy)]
pub struct TierPermissionManager;

impl TierPermissionManager {
    pub fn new() -> Self {
        Self
    }

    fn decide(tier: TrustTier, permission: Permission) -> Decision {
        match tier {
            TrustTier::OfficialTrusted => Decision::Grant,
            TrustTier::SignedTrusted if permission.is_sensitive() => Decision::Prompt,
            TrustTier::SignedTrusted => Decision::Grant,
            TrustTier::Untrusted if permission.is_sensitive() => Decision::Deny,
            TrustTier::Untrusted if UNTRUSTED_AUTO_GRANT.contains(&permission) => Decision::Grant,
            TrustTier::Untrusted => Decision::Prompt,
        }
    }
}

#[async_trait]
impl PermissionManager for TierPermissionManager {
    async fn negotiate(
        &self,
        request: PermissionRequest<'_>,
        prompt: &dyn PermissionPrompt,
    ) -> PermissionSet {
        let mut granted = PermissionSet::new();

        for &permission in request.requested {
            let allowed = match Self::decide(request.tier, permission) {
                Decision::Grant => true,
                Decision::Deny => false,
                Decision::Prompt => prompt.confirm(request.plugin_id, permission, request.tier).await,
            };
            if allowed {
                granted.insert(permission);
            } else {
                tracing::debug!(
                    plugin = %request.plugin_id,
                    "Permission '{}' not granted (tier {})",
                    permission,
                    request.tier
                );
            }
        }

        granted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn all() -> PermissionSet {
        Permission::ALL.into_iter().collect()
    }

    async fn negotiate(tier: TrustTier, prompt: &dyn PermissionPrompt) -> PermissionSet {
        let requested = all();
        TierPermissionManager::new()
            .negotiate(
                PermissionRequest {
                    plugin_id: "p",
                    plugin_name: "P",
                    requested: &requested,
                    tier,
                },
                prompt,
            )
            .await
    }

    #[tokio::test]
    async fn test_official_gets_everything_requested() {
        assert_eq!(negotiate(TrustTier::OfficialTrusted, &DenyAllPrompt).await, all());
    }

    #[tokio::test]
    async fn test_signed_trusted_prompts_for_sensitive() {
        let denied = negotiate(TrustTier::SignedTrusted, &DenyAllPrompt).await;
        assert!(denied.contains(&Permission::FileSystemRead));
        assert!(!denied.contains(&Permission::Network));

        let allowed = negotiate(TrustTier::SignedTrusted, &AllowAllPrompt).await;
        assert_eq!(allowed, all());
    }

    #[tokio::test]
    async fn test_untrusted_never_gets_sensitive() {
        let granted = negotiate(TrustTier::Untrusted, &AllowAllPrompt).await;
        for permission in Permission::ALL {
            assert_eq!(granted.contains(&permission), !permission.is_sensitive());
        }

        let baseline = negotiate(TrustTier::Untrusted, &DenyAllPrompt).await;
        assert_eq!(baseline, UNTRUSTED_AUTO_GRANT.iter().copied().collect());
    }

    #[tokio::test]
    async fn test_grant_is_subset_of_request() {
        let requested: PermissionSet = [Permission::ReadLogs].into_iter().collect();
        let granted = TierPermissionManager::new()
            .negotiate(
                PermissionRequest {
                    plugin_id: "p",
                    plugin_name: "P",
                    requested: &requested,
                    tier: TrustTier::OfficialTrusted,
                },
                &AllowAllPrompt,
            )
            .await;
        assert!(granted.is_subset(&requested));
        assert_eq!(granted.len(), 1);
    }
}
