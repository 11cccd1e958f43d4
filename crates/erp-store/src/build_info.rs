use serde::{Deserialize, Serialize};

/// Version metadata of the running build.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
    pub version_name: String,
    pub version_code: i64,
}

impl BuildInfo {
    pub fn new(version_name: impl Into<String>, version_code: i64) -> Self {
        Self {
            version_name: version_name.into(),
            version_code,
        }
    }

    /// The build this crate was compiled as. `ERP_VERSION_CODE` at compile
    /// time overrides the code derived from the package version.
    pub fn current() -> Self {
        let version_code = option_env!("ERP_VERSION_CODE")
            .and_then(|code| code.parse().ok())
            .unwrap_or_else(|| {
                version_code_from_semver(
                    env!("CARGO_PKG_VERSION_MAJOR"),
                    env!("CARGO_PKG_VERSION_MINOR"),
                    env!("CARGO_PKG_VERSION_PATCH"),
                )
            });
        Self::new(env!("CARGO_PKG_VERSION"), version_code)
    }
}

/// `major * 10_000 + minor * 100 + patch`, so codes grow with releases.
fn version_code_from_semver(major: &str, minor: &str, patch: &str) -> i64 {
    let part = |s: &str| s.parse::<i64>().unwrap_or(0);
    part(major) * 10_000 + part(minor) * 100 + part(patch)
}
