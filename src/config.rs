use crate::fleet::reconciler::ReconcilerSettings;
use crate::mqtt::message_manager::DEFAULT_LOG_CAPACITY;
use crate::mqtt::topics::DEFAULT_NAMESPACE;
use crate::persistence::{config_root, SessionStore};
use color_eyre::{eyre::eyre, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info};

const CONFIG_FILE: &str = "config.toml";

/// One week. Longer silences are not worth tracking as liveness.
pub const MAX_LIVENESS_TIMEOUT_SECS: u64 = 7 * 24 * 60 * 60;
pub const MAX_SWEEP_INTERVAL_SECS: u64 = 60 * 60;
/// The MQTT keep-alive field is 16 bits wide.
pub const MAX_KEEP_ALIVE_SECS: u64 = u16::MAX as u64;
pub const MAX_RECONNECT_DELAY_MS: u64 = 10 * 60 * 1000;

/// Application configuration. Every field has a default, so a missing file
/// (or a partial one) still yields a working setup.
#[derive(Deserialize, Serialize, Clone, Debug, PartialEq, Eq)]
#[serde(default)]
pub struct AppConfig {
    pub namespace: String,
    pub module_prefix: String,
    pub liveness_timeout_secs: u64,
    pub sweep_interval_secs: u64,
    pub message_log_capacity: usize,
    pub keep_alive_secs: u64,
    pub reconnect_delay_ms: u64,
    pub default_subscriptions: Vec<String>,
    /// Routes `response/settings/all` through the per-module fan-out.
    pub fan_out_batch_settings: bool,
    /// Overrides where the resumable session is kept.
    pub state_dir: Option<PathBuf>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            module_prefix: "bmotion".to_string(),
            liveness_timeout_secs: 300,
            sweep_interval_secs: 30,
            message_log_capacity: DEFAULT_LOG_CAPACITY,
            keep_alive_secs: 30,
            reconnect_delay_ms: 2000,
            default_subscriptions: vec![
                format!("{}/status/health/+", DEFAULT_NAMESPACE),
                format!("{}/response/#", DEFAULT_NAMESPACE),
            ],
            fan_out_batch_settings: false,
            state_dir: None,
        }
    }
}

impl AppConfig {
    pub fn default_path() -> PathBuf {
        config_root().join(CONFIG_FILE)
    }

    /// Loads the config file, falling back to defaults when it does not exist.
    pub async fn load(path: Option<&Path>) -> Result<Self> {
        let path = path.map(Path::to_path_buf).unwrap_or_else(Self::default_path);

        if !tokio::fs::try_exists(&path)
            .await
            .map_err(|e| eyre!("Failed to check if config file exists: {}", e))?
        {
            info!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(&path)
            .await
            .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
        let config: Self = toml::from_str(&content)
            .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))?;
        config.validate()?;

        debug!("Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.namespace.is_empty() || self.namespace.contains(['+', '#']) {
            return Err(eyre!("namespace '{}' is not a valid topic prefix", self.namespace));
        }
        if self.sweep_interval_secs == 0 {
            return Err(eyre!("sweep_interval_secs must be positive"));
        }
        if self.sweep_interval_secs > MAX_SWEEP_INTERVAL_SECS {
            return Err(eyre!(
                "sweep_interval_secs must be at most {}",
                MAX_SWEEP_INTERVAL_SECS
            ));
        }
        if self.liveness_timeout_secs > MAX_LIVENESS_TIMEOUT_SECS {
            return Err(eyre!(
                "liveness_timeout_secs must be at most {}",
                MAX_LIVENESS_TIMEOUT_SECS
            ));
        }
        if self.keep_alive_secs > MAX_KEEP_ALIVE_SECS {
            return Err(eyre!("keep_alive_secs must be at most {}", MAX_KEEP_ALIVE_SECS));
        }
        if self.reconnect_delay_ms > MAX_RECONNECT_DELAY_MS {
            return Err(eyre!(
                "reconnect_delay_ms must be at most {}",
                MAX_RECONNECT_DELAY_MS
            ));
        }
        if self.liveness_timeout_secs < self.sweep_interval_secs {
            return Err(eyre!(
                "liveness_timeout_secs ({}) must not be shorter than sweep_interval_secs ({})",
                self.liveness_timeout_secs,
                self.sweep_interval_secs
            ));
        }
        Ok(())
    }

    // The accessors clamp as well, since a config built in code skips `validate`.

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.clamp(1, MAX_SWEEP_INTERVAL_SECS))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.keep_alive_secs.min(MAX_KEEP_ALIVE_SECS))
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_millis(self.reconnect_delay_ms.min(MAX_RECONNECT_DELAY_MS))
    }

    pub fn liveness_timeout(&self) -> chrono::Duration {
        let secs = self.liveness_timeout_secs.min(MAX_LIVENESS_TIMEOUT_SECS);
        chrono::Duration::seconds(secs as i64)
    }

    pub fn reconciler_settings(&self) -> ReconcilerSettings {
        ReconcilerSettings {
            namespace: self.namespace.clone(),
            module_prefix: self.module_prefix.clone(),
            liveness_timeout: self.liveness_timeout(),
            fan_out_batch_settings: self.fan_out_batch_settings,
        }
    }

    pub fn session_store(&self) -> SessionStore {
        match &self.state_dir {
            Some(dir) => SessionStore::new(dir.clone()),
            None => SessionStore::default(),
        }
    }
}
