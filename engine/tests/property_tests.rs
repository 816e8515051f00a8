use bulwark_engine::config::Config;
use bulwark_engine::isolation::{IsolationPolicy, PolicyDecision};
use bulwark_engine::lifecycle::{Lifecycle, LifecycleState};
use bulwark_engine::permissions::{
    AllowAllPrompt, DenyAllPrompt, PermissionManager, PermissionPrompt, PermissionRequest,
    TierPermissionManager,
};
use bulwark_engine::signing::{extract, sign_binary, Certificate};
use bulwark_engine::TrustTier;
use bulwark_sdk::{Permission, PermissionSet};
use chrono::{Duration, Utc};
use ed25519_dalek::SigningKey;
use proptest::prelude::*;

// Configuration round-trip: every field the operator edits survives
// serialize -> parse unchanged
proptest! {
    #[test]
    fn test_config_parsing_round_trip(
        log_level in "error|warn|info|debug|trace",
        host_version in "[0-9]{1,2}\\.[0-9]{1,2}\\.[0-9]{1,2}",
        hook_timeout_secs in 1..=600u64,
        require_signed in any::<bool>(),
        reject_invalid in any::<bool>(),
        allow_expired in any::<bool>(),
        thumbprints in prop::collection::vec("[0-9A-F]{64}", 0..4),
        extra_denied in prop::collection::vec("[a-z_]{3,12}(::[a-z_]{3,8})?", 0..4),
    ) {
        let mut config = Config::default_config();
        config.core.log_level = log_level;
        config.plugins.host_version = host_version;
        config.plugins.hook_timeout_secs = hook_timeout_secs;
        config.plugins.require_signed = require_signed;
        config.plugins.reject_invalid_signatures = reject_invalid;
        config.trust.allow_expired = allow_expired;
        config.trust.official_thumbprints = thumbprints;
        config.isolation.extra_denied = extra_denied;

        let toml_string = toml::to_string(&config).expect("Failed to serialize Config to string");
        let parsed: Config = toml::from_str(&toml_string).expect("Failed to deserialize TOML to Config");

        prop_assert_eq!(&config.core.log_level, &parsed.core.log_level);
        prop_assert_eq!(&config.plugins.host_version, &parsed.plugins.host_version);
        prop_assert_eq!(config.plugins.hook_timeout_secs, parsed.plugins.hook_timeout_secs);
        prop_assert_eq!(config.plugins.require_signed, parsed.plugins.require_signed);
        prop_assert_eq!(
            config.plugins.reject_invalid_signatures,
            parsed.plugins.reject_invalid_signatures
        );
        prop_assert_eq!(config.trust.allow_expired, parsed.trust.allow_expired);
        prop_assert_eq!(&config.trust.official_thumbprints, &parsed.trust.official_thumbprints);
        prop_assert_eq!(&config.isolation.extra_denied, &parsed.isolation.extra_denied);
    }
}

fn tier_strategy() -> impl Strategy<Value = TrustTier> {
    prop_oneof![
        Just(TrustTier::Untrusted),
        Just(TrustTier::SignedTrusted),
        Just(TrustTier::OfficialTrusted),
    ]
}

fn permission_set_strategy() -> impl Strategy<Value = PermissionSet> {
    prop::collection::vec(prop::sample::select(Permission::ALL.to_vec()), 0..Permission::ALL.len())
        .prop_map(|permissions| permissions.into_iter().collect())
}

fn negotiate(tier: TrustTier, requested: &PermissionSet, operator_accepts: bool) -> PermissionSet {
    let prompt: &dyn PermissionPrompt = if operator_accepts {
        &AllowAllPrompt
    } else {
        &DenyAllPrompt
    };
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .unwrap();
    runtime.block_on(TierPermissionManager::new().negotiate(
        PermissionRequest {
            plugin_id: "widget",
            plugin_name: "Widget",
            requested,
            tier,
        },
        prompt,
    ))
}

// Grants never exceed the request, and an untrusted plugin never receives a
// sensitive permission even when the operator accepts every prompt
proptest! {
    #[test]
    fn test_grant_is_bounded_by_request_and_tier(
        tier in tier_strategy(),
        requested in permission_set_strategy(),
        operator_accepts in any::<bool>(),
    ) {
        let granted = negotiate(tier, &requested, operator_accepts);

        prop_assert!(granted.is_subset(&requested));
        if tier == TrustTier::Untrusted {
            prop_assert!(granted.iter().all(|p| !p.is_sensitive()));
        }
        if tier == TrustTier::OfficialTrusted {
            prop_assert_eq!(&granted, &requested);
        }
    }
}

// The deny-list always wins: a denied name or any module nested under it is
// denied even if the same name is also listed as shared
proptest! {
    #[test]
    fn test_deny_list_beats_shared_list(
        base in "[a-z]{2,5}_[a-z]{2,5}",
        nested in prop::collection::vec("[a-z]{2,8}", 0..3),
        separator in "::|\\.",
    ) {
        let policy = IsolationPolicy::default()
            .with_denied([base.as_str()])
            .with_shared([base.as_str()]);

        let mut module = base.clone();
        for segment in &nested {
            module.push_str(&separator);
            module.push_str(segment);
        }

        prop_assert_eq!(policy.decide(&module), PolicyDecision::Deny);
        prop_assert_eq!(policy.decide(&module.replace('_', "-")), PolicyDecision::Deny);
    }
}

// Error is absorbing: once a lifecycle fails, no sequence of transitions
// leaves it
proptest! {
    #[test]
    fn test_error_state_is_absorbing(
        steps in prop::collection::vec(
            prop::sample::select(vec![
                LifecycleState::Unloaded,
                LifecycleState::Loaded,
                LifecycleState::Initialized,
                LifecycleState::Enabled,
                LifecycleState::Disabled,
            ]),
            0..12,
        ),
    ) {
        let mut lifecycle = Lifecycle::new();
        lifecycle.fail();
        for step in steps {
            prop_assert!(lifecycle.transition(step).is_err());
            prop_assert_eq!(lifecycle.state(), LifecycleState::Error);
        }
    }
}

// Tampering with any single content byte of a signed binary breaks the
// content signature
proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]
    #[test]
    fn test_any_content_tamper_is_detected(
        content in prop::collection::vec(any::<u8>(), 1..512),
        index in any::<prop::sample::Index>(),
        flip in 1..=255u8,
    ) {
        let key = SigningKey::from_bytes(&[9u8; 32]);
        let cert = Certificate::self_signed(
            "prop-1",
            "Prop Publisher",
            &key,
            Utc::now() - Duration::hours(1),
            Duration::days(1),
        )
        .unwrap();
        let mut signed = sign_binary(&content, &key, vec![cert]).unwrap();

        let position = index.index(content.len());
        signed[position] ^= flip;

        let (tampered, block) = extract(&signed).unwrap().unwrap();
        prop_assert!(block.verify_content(tampered).is_err());
    }
}
