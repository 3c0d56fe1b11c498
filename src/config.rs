use config::builder::DefaultState;
use config::{ConfigBuilder, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;
use std::sync::Arc;

use crate::audit::engine::{AuditChain, DEFAULT_QUEUE_CAPACITY};
use crate::audit::hasher::{KeyRing, SigningKey};
use crate::error::{AuditError, AuditResult};
use crate::storage::{AuditStorage, MemoryStorage, PostgresStorage, RetentionPolicy, SqliteStorage};

/// Default configuration file, looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "audit-chain.toml";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    #[serde(default)]
    pub signing: SigningConfig,
    pub retention: RetentionConfig,
    pub writer_queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageBackend {
    Memory,
    Sqlite,
    Postgres,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub backend: StorageBackend,
    pub database_url: Option<String>,
    pub max_connections: u32,
}

#[derive(Clone, Serialize, Deserialize)]
pub struct KeyConfig {
    pub version: u32,
    pub key: String,
}

impl std::fmt::Debug for KeyConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyConfig")
            .field("version", &self.version)
            .field("key", &"<redacted>")
            .finish()
    }
}

/// Signing keys by version.
///
/// The audit store remembers every version it has used (by fingerprint),
/// so a key added at runtime through rotation must be added here before
/// the next start, under the version rotation returned.
#[derive(Clone, Default, Serialize, Deserialize)]
pub struct SigningConfig {
    /// Shorthand for a single key at version 1, e.g. `AUDIT__SIGNING__KEY`.
    #[serde(default)]
    pub key: Option<String>,
    #[serde(default)]
    pub keys: Vec<KeyConfig>,
}

impl std::fmt::Debug for SigningConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningConfig")
            .field("key", &self.key.as_ref().map(|_| "<redacted>"))
            .field("keys", &self.keys)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetentionConfig {
    pub max_age_days: Option<u32>,
    pub max_entries: Option<u64>,
    pub interval_secs: u64,
}

impl RetentionConfig {
    pub fn policy(&self) -> RetentionPolicy {
        RetentionPolicy {
            max_age_days: self.max_age_days,
            max_entries: self.max_entries,
        }
    }
}

impl AppConfig {
    /// Load `audit-chain.toml` (or the file named by `AUDIT_CONFIG`)
    /// overlaid with `AUDIT__*` environment variables.
    pub fn load() -> AuditResult<Self> {
        let file = match env::var("AUDIT_CONFIG") {
            Ok(path) => File::from(PathBuf::from(path)).required(true),
            Err(_) => File::with_name(DEFAULT_CONFIG_FILE).required(false),
        };

        let config = Self::defaults()?
            .add_source(file)
            .add_source(
                Environment::with_prefix("AUDIT")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;
        config.try_deserialize::<Self>()?.validated()
    }

    /// Parse a TOML document on top of the defaults
    pub fn from_toml(document: &str) -> AuditResult<Self> {
        let config = Self::defaults()?
            .add_source(File::from_str(document, FileFormat::Toml))
            .build()?;
        config.try_deserialize::<Self>()?.validated()
    }

    fn defaults() -> AuditResult<ConfigBuilder<DefaultState>> {
        Ok(config::Config::builder()
            .set_default("server.host", "0.0.0.0")?
            .set_default("server.port", 3000_i64)?
            .set_default("storage.backend", "sqlite")?
            .set_default("storage.max_connections", 5_i64)?
            .set_default("retention.interval_secs", 3600_i64)?
            .set_default("writer_queue_capacity", DEFAULT_QUEUE_CAPACITY as i64)?)
    }

    fn validated(self) -> AuditResult<Self> {
        if self.signing.key.is_none() && self.signing.keys.is_empty() {
            return Err(AuditError::Config(
                "at least one signing key is required (signing.key or signing.keys)".to_string(),
            ));
        }
        if self.storage.backend == StorageBackend::Postgres && self.storage.database_url.is_none() {
            return Err(AuditError::Config(
                "storage.database_url is required for the postgres backend".to_string(),
            ));
        }
        Ok(self)
    }

    pub fn key_ring(&self) -> AuditResult<KeyRing> {
        let mut versions = Vec::with_capacity(self.signing.keys.len() + 1);
        if let Some(key) = &self.signing.key {
            versions.push((1, SigningKey::new(key.clone())?));
        }
        for entry in &self.signing.keys {
            versions.push((entry.version, SigningKey::new(entry.key.clone())?));
        }
        KeyRing::from_versions(versions)
    }

    pub async fn build_storage(&self) -> AuditResult<Arc<dyn AuditStorage>> {
        let storage: Arc<dyn AuditStorage> = match self.storage.backend {
            StorageBackend::Memory => Arc::new(MemoryStorage::new()),
            StorageBackend::Sqlite => {
                let url = self
                    .storage
                    .database_url
                    .as_deref()
                    .unwrap_or("sqlite://audit-chain.db");
                Arc::new(SqliteStorage::connect(url, self.storage.max_connections).await?)
            }
            StorageBackend::Postgres => {
                let url = self.storage.database_url.as_deref().ok_or_else(|| {
                    AuditError::Config("storage.database_url is required".to_string())
                })?;
                Arc::new(PostgresStorage::connect(url, self.storage.max_connections).await?)
            }
        };
        Ok(storage)
    }

    /// Storage, key ring and engine, not yet initialized
    pub async fn build_chain(&self) -> AuditResult<AuditChain> {
        let storage = self.build_storage().await?;
        Ok(AuditChain::new(storage, self.key_ring()?).with_queue_capacity(self.writer_queue_capacity))
    }

    pub fn bind_address(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const KEY: &str = "config-test-signing-key-0123456789abcdef";

    #[test]
    fn test_defaults_apply() {
        let config = AppConfig::from_toml(&format!("[signing]\nkey = \"{KEY}\"\n")).unwrap();
        assert_eq!(config.server.port, 3000);
        assert_eq!(config.storage.backend, StorageBackend::Sqlite);
        assert_eq!(config.writer_queue_capacity, DEFAULT_QUEUE_CAPACITY);
        assert!(config.retention.policy().is_noop());
        assert_eq!(config.key_ring().unwrap().active_version(), 1);
    }

    #[test]
    fn test_versioned_keys_and_retention() {
        let config = AppConfig::from_toml(&format!(
            r#"
            writer_queue_capacity = 16

            [storage]
            backend = "memory"

            [retention]
            max_age_days = 30
            max_entries = 1000

            [[signing.keys]]
            version = 1
            key = "{KEY}-old"

            [[signing.keys]]
            version = 2
            key = "{KEY}-new"
            "#
        ))
        .unwrap();

        assert_eq!(config.writer_queue_capacity, 16);
        assert_eq!(config.storage.backend, StorageBackend::Memory);
        assert_eq!(config.retention.policy().max_entries, Some(1000));
        let ring = config.key_ring().unwrap();
        assert_eq!(ring.versions(), vec![1, 2]);
        assert_eq!(ring.active_version(), 2);
    }

    #[test]
    fn test_missing_key_is_rejected() {
        let err = AppConfig::from_toml("[server]\nport = 8080\n").unwrap_err();
        assert!(matches!(err, AuditError::Config(_)));
    }

    #[test]
    fn test_postgres_requires_url() {
        let err = AppConfig::from_toml(&format!(
            "[storage]\nbackend = \"postgres\"\n\n[signing]\nkey = \"{KEY}\"\n"
        ))
        .unwrap_err();
        assert!(matches!(err, AuditError::Config(_)));
    }

    #[test]
    fn test_debug_redacts_keys() {
        let config = AppConfig::from_toml(&format!("[signing]\nkey = \"{KEY}\"\n")).unwrap();
        assert!(!format!("{:?}", config).contains(KEY));
    }

    #[tokio::test]
    async fn test_build_memory_chain() {
        let config = AppConfig::from_toml(&format!(
            "[storage]\nbackend = \"memory\"\n\n[signing]\nkey = \"{KEY}\"\n"
        ))
        .unwrap();
        let chain = config.build_chain().await.unwrap();
        chain.initialize().await.unwrap();
        assert!(chain.verify().await.unwrap().valid);
    }
}
