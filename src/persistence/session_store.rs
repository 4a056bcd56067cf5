use super::{config_root, PersistedSession, SubscriptionFile};
use crate::mqtt::config::BrokerConfig;
use color_eyre::{eyre::eyre, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

const SESSION_DIR: &str = "session";
const CONNECTION_FILE: &str = "connection.toml";
const SUBSCRIPTIONS_FILE: &str = "subscriptions.toml";

#[derive(Debug, Clone)]
pub struct SessionStore {
    dir: PathBuf,
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new(config_root().join(SESSION_DIR))
    }
}

impl SessionStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn connection_path(&self) -> PathBuf {
        self.dir.join(CONNECTION_FILE)
    }

    fn subscriptions_path(&self) -> PathBuf {
        self.dir.join(SUBSCRIPTIONS_FILE)
    }

    async fn ensure_dir(&self) -> Result<()> {
        if !tokio::fs::try_exists(&self.dir)
            .await
            .map_err(|e| eyre!("Failed to check if session directory exists: {}", e))?
        {
            tokio::fs::create_dir_all(&self.dir)
                .await
                .map_err(|e| eyre!("Failed to create session directory: {}", e))?;
        }
        Ok(())
    }

    /// Returns the persisted session, or `None` when no connection was saved.
    pub async fn load(&self) -> Result<Option<PersistedSession>> {
        let connection_path = self.connection_path();
        if !tokio::fs::try_exists(&connection_path)
            .await
            .map_err(|e| eyre!("Failed to check if connection file exists: {}", e))?
        {
            debug!("No persisted connection in {}", self.dir.display());
            return Ok(None);
        }

        let content = tokio::fs::read_to_string(&connection_path)
            .await
            .map_err(|e| eyre!("Failed to read connection file: {}", e))?;
        let config: BrokerConfig =
            toml::from_str(&content).map_err(|e| eyre!("Failed to parse connection file: {}", e))?;

        let subscriptions_path = self.subscriptions_path();
        let subscriptions = if tokio::fs::try_exists(&subscriptions_path)
            .await
            .map_err(|e| eyre!("Failed to check if subscriptions file exists: {}", e))?
        {
            let content = tokio::fs::read_to_string(&subscriptions_path)
                .await
                .map_err(|e| eyre!("Failed to read subscriptions file: {}", e))?;
            let file: SubscriptionFile = toml::from_str(&content)
                .map_err(|e| eyre!("Failed to parse subscriptions file: {}", e))?;
            file.topics
        } else {
            warn!("Subscriptions file missing, resuming without subscriptions");
            Vec::new()
        };

        Ok(Some(PersistedSession {
            config,
            subscriptions,
        }))
    }

    pub async fn save_config(&self, config: &BrokerConfig) -> Result<()> {
        self.ensure_dir().await?;
        let content = toml::to_string_pretty(config)
            .map_err(|e| eyre!("Failed to serialize connection config: {}", e))?;
        tokio::fs::write(self.connection_path(), content)
            .await
            .map_err(|e| eyre!("Failed to write connection file: {}", e))?;
        debug!("Saved connection config for {}:{}", config.host, config.port);
        Ok(())
    }

    pub async fn save_subscriptions(&self, topics: &[String]) -> Result<()> {
        self.ensure_dir().await?;
        let file = SubscriptionFile {
            topics: topics.to_vec(),
        };
        let content = toml::to_string_pretty(&file)
            .map_err(|e| eyre!("Failed to serialize subscriptions: {}", e))?;
        tokio::fs::write(self.subscriptions_path(), content)
            .await
            .map_err(|e| eyre!("Failed to write subscriptions file: {}", e))?;
        debug!("Saved {} subscriptions", topics.len());
        Ok(())
    }

    /// Removes every persisted file. Missing files are fine.
    pub async fn clear(&self) -> Result<()> {
        for path in [self.connection_path(), self.subscriptions_path()] {
            if tokio::fs::try_exists(&path)
                .await
                .map_err(|e| eyre!("Failed to check {}: {}", path.display(), e))?
            {
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| eyre!("Failed to remove {}: {}", path.display(), e))?;
            }
        }
        debug!("Cleared persisted session in {}", self.dir.display());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn empty_store_has_no_session() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session"));
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn saved_session_loads_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path().join("session"));
        let config = BrokerConfig::new("ws://broker.local", 9001).with_credentials("ops", "secret");
        let topics = vec!["bmtl/status/health/+".to_string(), "bmtl/response/#".to_string()];

        store.save_config(&config).await.unwrap();
        store.save_subscriptions(&topics).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert_eq!(loaded.config, config);
        assert_eq!(loaded.subscriptions, topics);
    }

    #[tokio::test]
    async fn config_without_subscriptions_resumes_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save_config(&BrokerConfig::new("broker", 1883)).await.unwrap();

        let loaded = store.load().await.unwrap().unwrap();
        assert!(loaded.subscriptions.is_empty());
    }

    #[tokio::test]
    async fn clear_removes_everything_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        store.save_config(&BrokerConfig::new("broker", 1883)).await.unwrap();
        store.save_subscriptions(&["a/b".to_string()]).await.unwrap();

        store.clear().await.unwrap();
        store.clear().await.unwrap();
        assert_eq!(store.load().await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_connection_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::new(dir.path());
        tokio::fs::write(dir.path().join(CONNECTION_FILE), "host = [").await.unwrap();
        assert!(store.load().await.is_err());
    }
}
