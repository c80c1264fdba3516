//! Version and build information embedded by `build.rs`

use std::fmt;

use crate::transport::wire::PROTOCOL_VERSION;

/// Package version from Cargo.toml
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Build information embedded at compile time
#[derive(Debug, Clone)]
pub struct BuildInfo {
    pub version: &'static str,
    pub name: &'static str,
    /// Git commit hash (short)
    pub git_hash: &'static str,
    pub git_branch: &'static str,
    /// Raw git dirty string ("true" or "false")
    git_dirty_str: &'static str,
    pub build_timestamp: &'static str,
    /// Target triple (e.g., x86_64-unknown-linux-gnu)
    pub target: &'static str,
    /// Build profile (debug/release)
    pub profile: &'static str,
    pub rustc_version: &'static str,
    /// Comma separated cargo features, or "none"
    pub features: &'static str,
}

impl BuildInfo {
    pub const fn current() -> Self {
        Self {
            version: VERSION,
            name: env!("CARGO_PKG_NAME"),
            git_hash: env!("FLEETLINK_GIT_HASH"),
            git_branch: env!("FLEETLINK_GIT_BRANCH"),
            git_dirty_str: env!("FLEETLINK_GIT_DIRTY"),
            build_timestamp: env!("FLEETLINK_BUILD_TIMESTAMP"),
            target: env!("FLEETLINK_TARGET"),
            profile: env!("FLEETLINK_PROFILE"),
            rustc_version: env!("FLEETLINK_RUSTC_VERSION"),
            features: env!("FLEETLINK_FEATURES"),
        }
    }

    pub fn git_dirty(&self) -> bool {
        self.git_dirty_str == "true"
    }

    /// Version plus commit, e.g. "0.1.0-abc1234"
    pub fn full_version(&self) -> String {
        if self.git_dirty() {
            format!("{}-{}-dirty", self.version, self.git_hash)
        } else {
            format!("{}-{}", self.version, self.git_hash)
        }
    }

    pub fn short_version(&self) -> String {
        format!("{} ({}, protocol {})", self.version, self.git_hash, PROTOCOL_VERSION)
    }

    /// Whether accelerator detection was compiled in
    pub fn has_gpu_support(&self) -> bool {
        self.features.split(',').any(|f| f == "gpu")
    }
}

impl fmt::Display for BuildInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} {}", self.name, self.full_version())?;
        writeln!(f)?;
        writeln!(f, "Build Information:")?;
        writeln!(f, "  Version:    {}", self.version)?;
        writeln!(f, "  Protocol:   {}", PROTOCOL_VERSION)?;
        writeln!(f, "  Git Hash:   {}{}", self.git_hash, if self.git_dirty() { " (dirty)" } else { "" })?;
        writeln!(f, "  Git Branch: {}", self.git_branch)?;
        writeln!(f, "  Built:      {}", self.build_timestamp)?;
        writeln!(f, "  Profile:    {}", self.profile)?;
        writeln!(f, "  Features:   {}", self.features)?;
        writeln!(f, "  Target:     {}", self.target)?;
        writeln!(f, "  Compiler:   {}", self.rustc_version)?;
        Ok(())
    }
}

pub fn build_info() -> BuildInfo {
    BuildInfo::current()
}

pub fn print_version() {
    print!("{}", build_info());
}

pub fn print_short_version() {
    println!("{}", build_info().short_version());
}
