//! Version signature matching.

use regex::Regex;
use std::sync::LazyLock;

use crate::discovery::types::NodeKind;

static STABLE_RELEASE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^0\.[0-9]{3}\.[0-9]{5}$").expect("static pattern"));

static DEV_BUILD: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[0-9]+\.[0-9]+\.[0-9]+-[0-9a-f]{8}$").expect("static pattern"));

/// Returns true when the version carries a target-node signature: either a
/// stable release (`0.806.30102`) or a development build (`0.1.0-1a2b3c4d`).
pub fn is_target_version(version: &str) -> bool {
    STABLE_RELEASE.is_match(version) || DEV_BUILD.is_match(version)
}

pub fn classify(version: Option<&str>) -> NodeKind {
    match version {
        Some(v) if is_target_version(v) => NodeKind::Target,
        _ => NodeKind::Generic,
    }
}
