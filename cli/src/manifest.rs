//! Release identity of this build.

use opwire_core::Edition;

pub const ARTIFACT_ID: &str = "opwire-agent";

pub fn version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

/// Revision stamped at build time, empty for local builds.
pub fn revision() -> &'static str {
    option_env!("OPWIRE_AGENT_REVISION").unwrap_or("")
}

pub fn edition() -> Edition {
    Edition::new(revision(), version())
}

/// One-line build description for startup logs.
pub fn info_string() -> String {
    let mut info = format!("{ARTIFACT_ID} | version[{}]", version());
    if !revision().is_empty() {
        info.push_str(&format!(" revision[{}]", revision()));
    }
    info
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn edition_carries_the_package_version() {
        let edition = edition();
        assert_eq!(edition.version, env!("CARGO_PKG_VERSION"));
    }

    #[test]
    fn info_string_names_the_artifact() {
        assert!(info_string().starts_with("opwire-agent | version["));
    }
}
