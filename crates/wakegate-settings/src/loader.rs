//! Loading flow: compiled defaults, then the JSON file deep-merged over
//! them, then `WAKEGATE_*` environment overrides.
//!
//! Merge rules: objects merge per key, arrays and primitives are replaced,
//! nulls in the file are skipped.

use std::path::Path;

use serde_json::Value;
use tracing::{debug, warn};

use crate::errors::Result;
use crate::types::WakegateSettings;

/// Load from `path` (missing file means defaults), apply environment
/// overrides and validate.
pub fn load_settings_from_path(path: &Path) -> Result<WakegateSettings> {
    let defaults = serde_json::to_value(WakegateSettings::default())?;

    let merged = if path.exists() {
        debug!(?path, "loading settings file");
        let content = std::fs::read_to_string(path)?;
        let user: Value = serde_json::from_str(&content)?;
        deep_merge(defaults, user)
    } else {
        debug!(?path, "settings file not found, using defaults");
        defaults
    };

    let mut settings: WakegateSettings = serde_json::from_value(merged)?;
    apply_env_overrides(&mut settings);
    settings.validate()?;
    Ok(settings)
}

pub fn deep_merge(target: Value, source: Value) -> Value {
    match (target, source) {
        (Value::Object(mut target_map), Value::Object(source_map)) => {
            for (key, source_val) in source_map {
                if source_val.is_null() {
                    continue;
                }
                let merged = match target_map.remove(&key) {
                    Some(target_val) => deep_merge(target_val, source_val),
                    None => source_val,
                };
                target_map.insert(key, merged);
            }
            Value::Object(target_map)
        }
        (_, source) => source,
    }
}

pub fn apply_env_overrides(settings: &mut WakegateSettings) {
    apply_overrides_from(settings, |name| std::env::var(name).ok());
}

/// Same as [`apply_env_overrides`] with an injectable variable lookup.
pub fn apply_overrides_from(settings: &mut WakegateSettings, lookup: impl Fn(&str) -> Option<String>) {
    let env = EnvReader { lookup };

    if let Some(v) = env.u64_in("WAKEGATE_PORT", 1, 65_535) {
        settings.server.port = v as u16;
    }
    if let Some(v) = env.string("WAKEGATE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = env.string("WAKEGATE_DB") {
        settings.storage.database_path = v;
    }
    if let Some(v) = env.string("WAKEGATE_BLOB_ROOT") {
        settings.storage.blob_root = v;
    }
    if let Some(v) = env.u64_in("WAKEGATE_DEFAULT_CADENCE_MINUTES", 1, 24 * 60) {
        settings.protocol.default_cadence_minutes = v as u32;
    }
    if let Some(v) = env.u64_in("WAKEGATE_STALE_SECS", 10, 86_400) {
        settings.protocol.stale_transfer_secs = v;
    }
    if let Some(v) = env.u64_in("WAKEGATE_ACTIVITY_TOLERANCE_SECS", 0, 86_400) {
        settings.snapshot.activity_tolerance_secs = v;
    }
    if let Some(v) = env.string("WAKEGATE_LOG_LEVEL") {
        settings.telemetry.log_level = v;
    }
}

pub fn parse_u64_range(val: &str, min: u64, max: u64) -> Option<u64> {
    let n: u64 = val.trim().parse().ok()?;
    (min..=max).contains(&n).then_some(n)
}

struct EnvReader<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> EnvReader<F> {
    fn string(&self, name: &str) -> Option<String> {
        (self.lookup)(name).filter(|v| !v.trim().is_empty())
    }

    fn u64_in(&self, name: &str, min: u64, max: u64) -> Option<u64> {
        let raw = self.string(name)?;
        let parsed = parse_u64_range(&raw, min, max);
        if parsed.is_none() {
            warn!(key = name, value = %raw, min, max, "invalid env override, ignoring");
        }
        parsed
    }
}
