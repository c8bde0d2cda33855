// growerd: Startup configuration (CLI flags + environment)

use std::path::PathBuf;

use clap::Parser;

use crate::error::{ControlError, ControlResult};

/// Startup configuration for the growerd control plane.
///
/// Every value can be supplied as a CLI flag or an environment variable;
/// the environment is what systemd units use in production.
#[derive(Debug, Clone, Parser)]
#[command(name = "growerd", version, about = "GPIO control plane for the growerd appliance")]
pub struct Settings {
    /// Device serial (primary identifier). Falls back to the board serial
    /// from /proc/cpuinfo, then to a hostname-derived identifier.
    #[arg(long, env = "GROWERD_SERIAL")]
    pub serial: Option<String>,

    /// Base URL of the remote document database REST endpoint.
    #[arg(long, env = "GROWERD_STORE_URL", default_value = "https://store.growerd.io/v1")]
    pub store_url: String,

    /// Path to the document-store credentials file (opaque bearer token).
    #[arg(long, env = "GROWERD_CREDENTIALS")]
    pub credentials: Option<PathBuf>,

    /// Run against the in-memory pin driver instead of real hardware.
    #[arg(long, env = "GROWERD_SIMULATE")]
    pub simulate: bool,

    /// Log level filter (trace, debug, info, warn, error).
    #[arg(long, env = "GROWERD_LOG_LEVEL", default_value = "info")]
    pub log_level: String,

    /// Port for the diagnostics HTTP server.
    #[arg(long, env = "GROWERD_HTTP_PORT", default_value_t = 8880)]
    pub http_port: u16,

    /// Directory for locally cached state (interval cache).
    #[arg(long, env = "GROWERD_DATA_DIR", default_value = "./data")]
    pub data_dir: PathBuf,

    /// Capacity of the in-memory log ring buffer.
    #[arg(long, env = "GROWERD_LOG_BUFFER", default_value_t = 2000)]
    pub log_buffer: usize,

    /// Document poll cadence for the watcher, in milliseconds.
    #[arg(long, env = "GROWERD_POLL_INTERVAL_MS", default_value_t = 1000)]
    pub poll_interval_ms: u64,
}

impl Settings {
    /// Resolve the effective device serial.
    ///
    /// Priority: explicit setting, the immutable board serial from
    /// /proc/cpuinfo, then a hostname-derived development identifier.
    pub fn resolve_serial(&self) -> String {
        if let Some(serial) = &self.serial {
            let trimmed = serial.trim();
            if !trimmed.is_empty() {
                return trimmed.to_string();
            }
        }

        if let Some(serial) = read_cpuinfo_serial("/proc/cpuinfo") {
            return serial;
        }

        let host = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "unknown".to_string());
        format!("dev-{}", host.to_lowercase().replace('.', "-"))
    }

    /// Load the opaque store credentials token.
    ///
    /// Missing credentials are a fatal initialisation error unless the
    /// process runs in simulation mode (where the in-memory store is used).
    pub fn load_credentials(&self) -> ControlResult<Option<String>> {
        match &self.credentials {
            Some(path) => {
                let token = std::fs::read_to_string(path).map_err(|e| {
                    ControlError::FatalInit(format!(
                        "cannot read credentials file {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                let token = token.trim().to_string();
                if token.is_empty() {
                    return Err(ControlError::FatalInit(format!(
                        "credentials file {} is empty",
                        path.display()
                    )));
                }
                Ok(Some(token))
            }
            None if self.simulate => Ok(None),
            None => Err(ControlError::FatalInit(
                "no credentials configured (set GROWERD_CREDENTIALS)".to_string(),
            )),
        }
    }
}

fn read_cpuinfo_serial(path: &str) -> Option<String> {
    let contents = std::fs::read_to_string(path).ok()?;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("Serial") {
            let serial = rest.trim_start_matches([' ', '\t', ':']).trim();
            if !serial.is_empty() {
                return Some(serial.to_string());
            }
        }
    }
    None
}
