//! Build script for embedding build metadata and the official signing root
//!
//! The official root public key is the trust anchor for plugins published by
//! the Bulwark team. It is looked up in the following locations (in order):
//! 1. Environment variable `BULWARK_OFFICIAL_ROOT_KEY` (hex-encoded)
//! 2. File `keys/official_root.hex` at the workspace root (hex-encoded)
//!
//! If no key is found the engine is built without a built-in root and only
//! roots from the config file are trusted.

use std::env;
use std::fs;
use std::path::PathBuf;

fn main() {
    let commit_hash = std::process::Command::new("git")
        .args(["rev-parse", "--short", "HEAD"])
        .output()
        .ok()
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "unknown".to_string());

    println!("cargo:rustc-env=GIT_COMMIT_HASH={}", commit_hash);

    let build_time = chrono::Utc::now().to_rfc3339();
    println!("cargo:rustc-env=BUILD_TIMESTAMP={}", build_time);

    match load_official_root_key() {
        Some(key_hex) => {
            println!("cargo:rustc-env=BULWARK_OFFICIAL_ROOT={}", key_hex);
        }
        None => {
            println!("cargo:warning=No official root key found, building without a built-in root");
        }
    }

    println!("cargo:rerun-if-changed=../keys/official_root.hex");
    println!("cargo:rerun-if-env-changed=BULWARK_OFFICIAL_ROOT_KEY");
}

/// Load the official root key as lowercase hex, if one is provided
fn load_official_root_key() -> Option<String> {
    if let Ok(key_hex) = env::var("BULWARK_OFFICIAL_ROOT_KEY") {
        if is_valid_key(&key_hex) {
            return Some(key_hex.trim().to_lowercase());
        }
        println!("cargo:warning=Invalid BULWARK_OFFICIAL_ROOT_KEY (must be 32 bytes hex)");
    }

    // build.rs runs from the crate dir (engine/), key files are at workspace root
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR").ok()?);
    let workspace_root = manifest_dir.parent().unwrap_or(&manifest_dir);

    let hex_path = workspace_root.join("keys/official_root.hex");
    if hex_path.exists() {
        if let Ok(key_hex) = fs::read_to_string(&hex_path) {
            if is_valid_key(&key_hex) {
                return Some(key_hex.trim().to_lowercase());
            }
        }
        println!("cargo:warning=Invalid keys/official_root.hex (must be 32 bytes hex)");
    }

    None
}

fn is_valid_key(key_hex: &str) -> bool {
    hex::decode(key_hex.trim())
        .map(|bytes| bytes.len() == 32)
        .unwrap_or(false)
}
