// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

//! Runtime configuration.
//!
//! Resolution precedence for every field: explicit flag > environment
//! variable > file in `--config-dir` > built-in default. `clap`'s `env`
//! attribute covers the flag/env half automatically; [`Config::resolve`]
//! fills in the config-dir and default fallbacks clap can't express.

use std::path::PathBuf;
use std::time::Duration;

use uuid::Uuid;

/// Separator used in store keys and bus topic names. Must not occur in any
/// application, service, or session name.
pub const SEPARATOR: &str = "_";

/// Sidecar runtime configuration.
#[derive(Debug, Clone, clap::Parser)]
#[command(name = "karsidecar")]
pub struct Config {
    /// The name of the application.
    #[arg(long, env = "KAR_APP")]
    pub app: String,

    /// The name of the service being joined to the application.
    #[arg(long, env = "KAR_SERVICE")]
    pub service: String,

    /// Actor types implemented by this service, comma separated.
    #[arg(long, env = "KAR_ACTORS", value_delimiter = ',')]
    pub actors: Vec<String>,

    /// Actor reminder processing interval.
    #[arg(long, env = "KAR_ACTOR_REMINDER_INTERVAL_MS", default_value_t = 100)]
    pub actor_reminder_interval_ms: u64,

    /// Threshold at which reminders are logged as being late.
    #[arg(long, env = "KAR_ACTOR_REMINDER_ACCEPTABLE_DELAY_MS", default_value_t = 3_000)]
    pub actor_reminder_acceptable_delay_ms: u64,

    /// Timeout for acquiring a busy actor session lock.
    #[arg(long, env = "KAR_ACTOR_TIMEOUT_MS", default_value_t = 10_000)]
    pub actor_timeout_ms: u64,

    /// The application's HTTP service port.
    #[arg(long, env = "KAR_SEND_PORT", default_value_t = 8080)]
    pub service_port: u16,

    /// The sidecar runtime's own HTTP port.
    #[arg(long, env = "KAR_RECV_PORT", default_value_t = 3500)]
    pub runtime_port: u16,

    /// Bus brokers, comma separated.
    #[arg(long, env = "KAR_BUS_BROKERS", value_delimiter = ',')]
    pub bus_brokers: Vec<String>,

    /// Use TLS to communicate with the bus.
    #[arg(long, env = "KAR_BUS_ENABLE_TLS", default_value_t = false)]
    pub bus_enable_tls: bool,

    /// SASL username for the bus, if any.
    #[arg(long, env = "KAR_BUS_USERNAME")]
    pub bus_username: Option<String>,

    /// SASL password for the bus, if any.
    #[arg(long, env = "KAR_BUS_PASSWORD")]
    pub bus_password: Option<String>,

    /// Expected bus protocol version.
    #[arg(long, env = "KAR_BUS_VERSION")]
    pub bus_version: Option<String>,

    /// KV store host.
    #[arg(long, env = "KAR_KV_HOST")]
    pub kv_host: Option<String>,

    /// KV store port.
    #[arg(long, env = "KAR_KV_PORT")]
    pub kv_port: Option<u16>,

    /// Use TLS to communicate with the KV store.
    #[arg(long, env = "KAR_KV_ENABLE_TLS", default_value_t = false)]
    pub kv_enable_tls: bool,

    /// KV store password, if any.
    #[arg(long, env = "KAR_KV_PASSWORD")]
    pub kv_password: Option<String>,

    /// Logging verbosity (error, warn, info, debug, trace).
    #[arg(long, env = "KAR_VERBOSITY", default_value = "info")]
    pub verbosity: String,

    /// Directory containing file-backed configuration defaults, one file per key.
    #[arg(long, env = "KAR_CONFIG_DIR")]
    pub config_dir: Option<PathBuf>,

    /// Retention window for locally-started progress offsets. `None` (default)
    /// disables pruning; the original left this policy unspecified.
    #[arg(long, env = "KAR_PROGRESS_RETAIN_MS")]
    pub progress_retain_ms: Option<u64>,

    /// Unique id of this sidecar instance.
    #[arg(skip = Uuid::new_v4().to_string())]
    pub id: String,
}

impl Config {
    pub fn actor_reminder_interval(&self) -> Duration {
        Duration::from_millis(self.actor_reminder_interval_ms)
    }

    pub fn actor_reminder_acceptable_delay(&self) -> Duration {
        Duration::from_millis(self.actor_reminder_acceptable_delay_ms)
    }

    pub fn actor_timeout(&self) -> Duration {
        Duration::from_millis(self.actor_timeout_ms)
    }

    pub fn progress_retain(&self) -> Option<Duration> {
        self.progress_retain_ms.map(Duration::from_millis)
    }

    /// Fill in config-dir-backed and built-in defaults for fields `clap`
    /// cannot resolve on its own (file fallback, and defaults that depend on
    /// other fields).
    pub fn resolve(&mut self) -> anyhow::Result<()> {
        if self.app.is_empty() {
            anyhow::bail!("app name is required");
        }
        if self.service.is_empty() {
            anyhow::bail!("service name is required");
        }
        for name in [&self.app, &self.service] {
            if name.contains(SEPARATOR) {
                anyhow::bail!("name {name:?} must not contain the reserved separator {SEPARATOR:?}");
            }
        }

        if self.bus_username.is_none() {
            self.bus_username = self
                .file_backed("bus_username")
                .or_else(|| Some("token".to_owned()));
        }
        if self.bus_password.is_none() {
            self.bus_password = self.file_backed("bus_password");
        }
        if self.bus_version.is_none() {
            self.bus_version = Some(
                self.file_backed("bus_version")
                    .unwrap_or_else(|| "2.2.0".to_owned()),
            );
        }
        if self.bus_brokers.is_empty() {
            let brokers = self
                .file_backed("bus_brokers")
                .ok_or_else(|| anyhow::anyhow!("at least one bus broker is required"))?;
            self.bus_brokers = brokers.split(',').map(str::to_owned).collect();
        }

        if self.kv_host.is_none() {
            self.kv_host = Some(
                self.file_backed("kv_host")
                    .ok_or_else(|| anyhow::anyhow!("KV store host is required"))?,
            );
        }
        if self.kv_port.is_none() {
            self.kv_port = Some(
                self.file_backed("kv_port")
                    .map(|s| s.parse())
                    .transpose()?
                    .unwrap_or(6379),
            );
        }
        if self.kv_password.is_none() {
            self.kv_password = self.file_backed("kv_password");
        }

        Ok(())
    }

    fn file_backed(&self, key: &str) -> Option<String> {
        let dir = self.config_dir.as_ref()?;
        std::fs::read_to_string(dir.join(key)).ok().map(|s| s.trim().to_owned())
    }

    /// Bus topic name for this application.
    pub fn topic(&self) -> String {
        format!("kar{SEPARATOR}{}", self.app)
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
