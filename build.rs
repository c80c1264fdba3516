//! Build script for fleetlink
//!
//! Embeds git commit, build timestamp, target, compiler version and the
//! enabled cargo features so every host can report exactly what it runs.

use std::env;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=.git/HEAD");
    println!("cargo:rerun-if-changed=.git/index");

    let git_hash = git(&["rev-parse", "--short=8", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let git_branch = git(&["rev-parse", "--abbrev-ref", "HEAD"]).unwrap_or_else(|| "unknown".to_string());
    let git_dirty = match git(&["status", "--porcelain"]) {
        Some(out) if !out.is_empty() => "true",
        Some(_) => "false",
        None => "unknown",
    };

    let build_timestamp = chrono::Utc::now().format("%Y-%m-%d %H:%M:%S UTC").to_string();
    let target = env::var("TARGET").unwrap_or_else(|_| "unknown".to_string());
    let profile = env::var("PROFILE").unwrap_or_else(|_| "unknown".to_string());
    let rustc_version = rustc_version();
    let features = enabled_features();

    println!("cargo:rustc-env=FLEETLINK_GIT_HASH={}", git_hash);
    println!("cargo:rustc-env=FLEETLINK_GIT_BRANCH={}", git_branch);
    println!("cargo:rustc-env=FLEETLINK_GIT_DIRTY={}", git_dirty);
    println!("cargo:rustc-env=FLEETLINK_BUILD_TIMESTAMP={}", build_timestamp);
    println!("cargo:rustc-env=FLEETLINK_TARGET={}", target);
    println!("cargo:rustc-env=FLEETLINK_PROFILE={}", profile);
    println!("cargo:rustc-env=FLEETLINK_RUSTC_VERSION={}", rustc_version);
    println!("cargo:rustc-env=FLEETLINK_FEATURES={}", features);
}

/// Trimmed stdout of a successful git invocation
fn git(args: &[&str]) -> Option<String> {
    Command::new("git")
        .args(args)
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
}

fn rustc_version() -> String {
    let rustc = env::var("RUSTC").unwrap_or_else(|_| "rustc".to_string());
    Command::new(rustc)
        .arg("--version")
        .output()
        .ok()
        .filter(|output| output.status.success())
        .and_then(|output| String::from_utf8(output.stdout).ok())
        .map(|s| s.trim().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// Cargo exposes enabled features as CARGO_FEATURE_<NAME>
fn enabled_features() -> String {
    let mut features: Vec<String> = env::vars()
        .filter_map(|(key, _)| key.strip_prefix("CARGO_FEATURE_").map(|f| f.to_lowercase().replace('_', "-")))
        .collect();
    features.sort();
    if features.is_empty() {
        "none".to_string()
    } else {
        features.join(",")
    }
}
