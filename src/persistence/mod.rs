//! # Persistence Module
//!
//! Keeps just enough client-side state to resume a session after a restart:
//! the broker connection parameters and the confirmed subscription list.
//! Both live as TOML files in the session directory and are removed together
//! on an explicit disconnect.
//!
//! ## Error Handling Strategy
//! File operations return `color_eyre` results with context. Callers treat a
//! failed write as a degraded but working session, never as fatal.

pub mod session_store;

use crate::mqtt::config::BrokerConfig;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

pub use session_store::SessionStore;

const APP_DIR: &str = "bmtl-fleet";

/// Root directory for configuration and persisted session state.
pub fn config_root() -> PathBuf {
    let base = dirs::config_dir().or_else(dirs::home_dir).unwrap_or_else(|| {
        warn!("Could not determine config or home directory, using current directory");
        PathBuf::from(".")
    });
    base.join(APP_DIR)
}

/// Everything needed to replay a connect + resubscribe sequence.
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq, Eq)]
pub struct PersistedSession {
    pub config: BrokerConfig,
    pub subscriptions: Vec<String>,
}

/// On-disk shape of the subscription file.
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
struct SubscriptionFile {
    topics: Vec<String>,
}
