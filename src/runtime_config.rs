// growerd: Config provider: dynamic tuning intervals
//
// Interval values come from the device document's config/intervals child,
// falling back to a local JSON cache, then to hard defaults. Every
// accessor returns the current value; the sync and evaluator loops
// re-read each tick so document updates take effect live.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use parking_lot::RwLock;
use serde_json::Value;
use tracing::{debug, info, warn};

/// Recognised interval keys with (default, min, max) bounds in seconds.
const INTERVAL_BOUNDS: [(&str, u64, u64, u64); 5] = [
    ("heartbeat_interval_s", 30, 5, 3600),
    ("hardware_state_sync_interval_s", 30, 5, 3600),
    ("local_hardware_read_interval_s", 5, 1, 300),
    ("window_recheck_interval_s", 60, 10, 3600),
    ("command_timeout_s", 10, 1, 120),
];

const CACHE_FILE: &str = "intervals.json";

fn defaults() -> BTreeMap<String, u64> {
    INTERVAL_BOUNDS
        .iter()
        .map(|(key, default, _, _)| (key.to_string(), *default))
        .collect()
}

fn bounds_for(key: &str) -> Option<(u64, u64)> {
    INTERVAL_BOUNDS
        .iter()
        .find(|(k, _, _, _)| *k == key)
        .map(|(_, _, min, max)| (*min, *max))
}

/// Live interval map with bounds validation and local persistence.
pub struct RuntimeConfig {
    intervals: RwLock<BTreeMap<String, u64>>,
    cache_path: Option<PathBuf>,
}

impl RuntimeConfig {
    /// Create with defaults only (no disk cache).
    pub fn new() -> Self {
        Self {
            intervals: RwLock::new(defaults()),
            cache_path: None,
        }
    }

    /// Create backed by the interval cache under `data_dir`, loading any
    /// previously cached values.
    pub fn with_cache_dir(data_dir: &Path) -> Self {
        let cache_path = data_dir.join(CACHE_FILE);
        let config = Self {
            intervals: RwLock::new(defaults()),
            cache_path: Some(cache_path.clone()),
        };

        match std::fs::read_to_string(&cache_path) {
            Ok(contents) => match serde_json::from_str::<Value>(&contents) {
                Ok(value) => {
                    let accepted = config.apply_value(&value, false);
                    if accepted > 0 {
                        info!(
                            path = %cache_path.display(),
                            accepted, "Intervals loaded from local cache"
                        );
                    }
                }
                Err(e) => warn!(path = %cache_path.display(), error = %e, "Interval cache unreadable, using defaults"),
            },
            Err(_) => debug!(path = %cache_path.display(), "No interval cache yet"),
        }

        config
    }

    /// Apply an intervals document. Each key is validated against its
    /// bounds; out-of-bound or non-integer values are rejected with a WARN
    /// and the previous value retained. Returns the number of accepted
    /// keys. Accepted updates are re-cached to disk.
    pub fn apply_document(&self, value: &Value) -> usize {
        let accepted = self.apply_value(value, true);
        if accepted > 0 {
            self.cache_to_disk();
        }
        accepted
    }

    fn apply_value(&self, value: &Value, log_changes: bool) -> usize {
        let Some(obj) = value.as_object() else {
            warn!("Intervals document is not an object, ignored");
            return 0;
        };

        let mut accepted = 0;
        let mut intervals = self.intervals.write();

        for (key, raw) in obj {
            let Some((min, max)) = bounds_for(key) else {
                warn!(key = %key, "Unknown interval key ignored");
                continue;
            };

            let Some(secs) = raw.as_u64().or_else(|| {
                raw.as_f64()
                    .filter(|f| *f >= 0.0 && f.fract() == 0.0)
                    .map(|f| f as u64)
            }) else {
                warn!(key = %key, value = %raw, "Interval is not an integer, previous value kept");
                continue;
            };

            if secs < min || secs > max {
                warn!(
                    key = %key,
                    value = secs,
                    min,
                    max,
                    "Interval out of bounds, previous value kept"
                );
                continue;
            }

            let previous = intervals.insert(key.clone(), secs);
            if log_changes && previous != Some(secs) {
                info!(key = %key, from = ?previous, to = secs, "Interval updated");
            }
            accepted += 1;
        }

        accepted
    }

    fn cache_to_disk(&self) {
        let Some(path) = &self.cache_path else {
            return;
        };
        let snapshot = self.intervals.read().clone();
        let write = (|| -> std::io::Result<()> {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let body = serde_json::to_string_pretty(&snapshot)?;
            std::fs::write(path, body)
        })();
        if let Err(e) = write {
            // Not retried; the next accepted update writes again.
            warn!(path = %path.display(), error = %e, "Failed to cache intervals locally");
        }
    }

    fn get_secs(&self, key: &str) -> u64 {
        let intervals = self.intervals.read();
        intervals.get(key).copied().unwrap_or_else(|| {
            INTERVAL_BOUNDS
                .iter()
                .find(|(k, _, _, _)| *k == key)
                .map(|(_, d, _, _)| *d)
                .unwrap_or(30)
        })
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.get_secs("heartbeat_interval_s"))
    }

    pub fn hardware_state_sync_interval(&self) -> Duration {
        Duration::from_secs(self.get_secs("hardware_state_sync_interval_s"))
    }

    pub fn local_hardware_read_interval(&self) -> Duration {
        Duration::from_secs(self.get_secs("local_hardware_read_interval_s"))
    }

    pub fn window_recheck_interval(&self) -> Duration {
        Duration::from_secs(self.get_secs("window_recheck_interval_s"))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.get_secs("command_timeout_s"))
    }

    pub fn all_intervals(&self) -> BTreeMap<String, u64> {
        self.intervals.read().clone()
    }
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn defaults_present() {
        let config = RuntimeConfig::new();
        assert_eq!(config.local_hardware_read_interval(), Duration::from_secs(5));
        assert_eq!(config.window_recheck_interval(), Duration::from_secs(60));
        assert_eq!(config.command_timeout(), Duration::from_secs(10));
    }

    #[test]
    fn valid_update_applies() {
        let config = RuntimeConfig::new();
        let accepted = config.apply_document(&json!({
            "local_hardware_read_interval_s": 2,
            "hardware_state_sync_interval_s": 120
        }));
        assert_eq!(accepted, 2);
        assert_eq!(config.local_hardware_read_interval(), Duration::from_secs(2));
        assert_eq!(
            config.hardware_state_sync_interval(),
            Duration::from_secs(120)
        );
    }

    #[test]
    fn out_of_bounds_rejected_previous_kept() {
        let config = RuntimeConfig::new();
        config.apply_document(&json!({"local_hardware_read_interval_s": 2}));
        let accepted = config.apply_document(&json!({
            "local_hardware_read_interval_s": 9000,
            "heartbeat_interval_s": 1
        }));
        assert_eq!(accepted, 0);
        assert_eq!(config.local_hardware_read_interval(), Duration::from_secs(2));
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(30));
    }

    #[test]
    fn non_integer_and_unknown_rejected() {
        let config = RuntimeConfig::new();
        let accepted = config.apply_document(&json!({
            "heartbeat_interval_s": "fast",
            "warp_drive_interval_s": 10
        }));
        assert_eq!(accepted, 0);
    }

    #[test]
    fn cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        {
            let config = RuntimeConfig::with_cache_dir(dir.path());
            config.apply_document(&json!({"window_recheck_interval_s": 15}));
        }
        let reloaded = RuntimeConfig::with_cache_dir(dir.path());
        assert_eq!(reloaded.window_recheck_interval(), Duration::from_secs(15));
    }
}
