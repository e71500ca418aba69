//! Per-target record of which steps and lifecycle scripts ran, when, and
//! against which input hashes.

use std::cmp::Ordering;
use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

/// Bump on any breaking change to the manifest layout. Manifests written
/// with another version are discarded, never partially trusted.
pub const MANIFEST_FORMAT_VERSION: u32 = 2;

/// Version of this tool, recorded when the build environment is rebuilt.
pub const TOOL_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheManifest {
    pub format_version: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub build_environment_hash: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_version: Option<String>,
    #[serde(default)]
    pub steps: BTreeMap<String, StepCacheEntry>,
    #[serde(default)]
    pub scripts: BTreeMap<String, ScriptCacheEntry>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepCacheEntry {
    /// RFC 3339 UTC timestamp of the successful run.
    pub last_run_at: String,
    pub dependency_hashes: BTreeMap<String, String>,
    pub artifacts: Vec<String>,
    /// Recorded for inspection; rebuild decisions only check artifact existence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub combined_artifact_hash: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptCacheEntry {
    pub last_run_at: String,
    pub script_hash: String,
    pub dependency_hashes: BTreeMap<String, String>,
    pub generated_artifacts: Vec<String>,
}

impl Default for CacheManifest {
    fn default() -> Self {
        Self::empty()
    }
}

impl CacheManifest {
    pub fn empty() -> Self {
        Self {
            format_version: MANIFEST_FORMAT_VERSION,
            build_environment_hash: None,
            tool_version: None,
            steps: BTreeMap::new(),
            scripts: BTreeMap::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.steps.is_empty() && self.scripts.is_empty() && self.build_environment_hash.is_none()
    }

    pub fn step(&self, step_id: &str) -> Option<&StepCacheEntry> {
        self.steps.get(step_id)
    }

    pub fn record_step(&mut self, step_id: &str, entry: StepCacheEntry) {
        self.steps.insert(step_id.to_string(), entry);
    }

    pub fn record_script(&mut self, key: &str, entry: ScriptCacheEntry) {
        self.scripts.insert(key.to_string(), entry);
    }
}

/// Current time as an RFC 3339 UTC string with sub-second precision.
pub fn now_timestamp() -> String {
    OffsetDateTime::now_utc()
        .format(&Rfc3339)
        .unwrap_or_else(|_| OffsetDateTime::now_utc().unix_timestamp().to_string())
}

/// Order two recorded timestamps.
///
/// Both sides are parsed as instants so differing sub-second precision or
/// offsets compare correctly; unparseable values fall back to string order.
pub fn compare_timestamps(a: &str, b: &str) -> Ordering {
    match (
        OffsetDateTime::parse(a, &Rfc3339),
        OffsetDateTime::parse(b, &Rfc3339),
    ) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_manifest_is_empty_and_current() {
        let m = CacheManifest::empty();
        assert_eq!(m.format_version, MANIFEST_FORMAT_VERSION);
        assert!(m.is_empty());
        assert!(m.step("frontend").is_none());
    }

    #[test]
    fn record_step_overwrites_previous_entry() {
        let mut m = CacheManifest::empty();
        let entry = |ts: &str| StepCacheEntry {
            last_run_at: ts.to_string(),
            dependency_hashes: BTreeMap::new(),
            artifacts: vec!["cache/app".to_string()],
            combined_artifact_hash: None,
        };
        m.record_step("application", entry("2024-01-01T00:00:00Z"));
        m.record_step("application", entry("2024-01-02T00:00:00Z"));
        assert_eq!(m.steps.len(), 1);
        assert_eq!(m.step("application").unwrap().last_run_at, "2024-01-02T00:00:00Z");
    }

    #[test]
    fn serialized_form_uses_snake_case_and_skips_absent_fields() {
        let m = CacheManifest::empty();
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("\"format_version\":2"));
        assert!(!json.contains("build_environment_hash"));
    }

    #[test]
    fn timestamps_compare_as_instants() {
        assert_eq!(
            compare_timestamps("2024-05-01T10:00:00.5Z", "2024-05-01T10:00:00.25Z"),
            Ordering::Greater
        );
        assert_eq!(
            compare_timestamps("2024-05-01T12:00:00+02:00", "2024-05-01T10:00:00Z"),
            Ordering::Equal
        );
        assert_eq!(
            compare_timestamps("2024-05-01T10:00:00Z", "2024-05-02T10:00:00Z"),
            Ordering::Less
        );
    }

    #[test]
    fn now_timestamp_parses_back() {
        let ts = now_timestamp();
        assert!(OffsetDateTime::parse(&ts, &Rfc3339).is_ok());
    }
}
