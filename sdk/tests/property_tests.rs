use bulwark_sdk::errors::{ErrorExt, PluginError};
use bulwark_sdk::manifest::parse_version;
use bulwark_sdk::PluginManifest;
use proptest::prelude::*;

// User hints are never empty and never echo the raw error payload
proptest! {
    #[test]
    fn test_error_user_hint_completeness(payload in "[a-z0-9/_.]{8,40}") {
        let errs = vec![
            PluginError::SecurityViolation {
                plugin_id: payload.clone(),
                module: payload.clone(),
            },
            PluginError::NativeLibraryDenied {
                plugin_id: payload.clone(),
                library: payload.clone(),
            },
            PluginError::BoundaryUnloaded(payload.clone()),
            PluginError::PermissionDenied(payload.clone()),
            PluginError::Construction(payload.clone()),
            PluginError::Hook(payload.clone()),
            PluginError::Runtime(payload.clone()),
        ];

        for err in errs {
            let hint = err.user_hint();
            prop_assert!(!hint.is_empty());
            prop_assert!(!hint.contains(&payload));
            if err.is_security_violation() {
                prop_assert!(!err.is_recoverable());
                prop_assert!(err.to_string().contains(&payload));
            }
        }
    }
}

// Any dotted numeric version with one to three parts parses, and missing
// parts default to zero
proptest! {
    #[test]
    fn test_short_versions_parse(parts in prop::collection::vec(0..1000u64, 1..=3)) {
        let raw = parts.iter().map(u64::to_string).collect::<Vec<_>>().join(".");
        let version = parse_version(&raw).unwrap();

        prop_assert_eq!(version.major, parts[0]);
        prop_assert_eq!(version.minor, parts.get(1).copied().unwrap_or(0));
        prop_assert_eq!(version.patch, parts.get(2).copied().unwrap_or(0));
    }
}

// Identifiers outside [a-z0-9._-] are rejected; valid ones are accepted
proptest! {
    #[test]
    fn test_manifest_id_charset(
        valid in "[a-z0-9][a-z0-9._-]{0,30}",
        invalid in "[a-z]{1,8}[A-Z /!@]{1,3}[a-z]{0,8}",
    ) {
        let manifest = |id: &str| {
            serde_json::json!({
                "id": id,
                "name": "Widget",
                "version": "1.0.0",
                "entry": { "binary": "widget.bin", "type_name": "Widget" }
            })
            .to_string()
        };

        prop_assert!(PluginManifest::from_json(&manifest(&valid)).is_ok());
        prop_assert!(PluginManifest::from_json(&manifest(&invalid)).is_err());
    }
}
