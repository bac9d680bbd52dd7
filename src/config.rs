//! Configuration schema and the immutable snapshot it loads into.
//!
//! The snapshot is held behind an [`arc_swap::ArcSwap`] so a reload
//! replaces the pointer atomically: handles created against the old
//! snapshot keep their `Arc` clone alive until the tunnel ends.

use std::collections::HashSet;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

use crate::authorizer::TablePermission;
use crate::error::BrokerError;
use crate::identity::LocalUser;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionKind {
    Postgres,
    Redis,
    Http,
    Https,
    Tcp,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagMatch {
    All,
    Any,
}

impl Default for TagMatch {
    fn default() -> Self {
        TagMatch::All
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, Default)]
pub struct ConnectionMetadata {
    pub description: Option<String>,
    pub environment: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConnectionDefinition {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: ConnectionKind,
    pub host: String,
    pub port: u16,
    pub scheme: Option<String>,
    #[serde(default, with = "humantime_serde::option")]
    pub duration: Option<Duration>,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub metadata: ConnectionMetadata,
    pub backend_username: Option<String>,
    pub backend_password: Option<String>,
    pub backend_database: Option<String>,
    #[serde(default)]
    pub redis_cluster: bool,
    /// Table-level operation rules for the SQL semantic gate. For Postgres
    /// connections this is the authoritative enforcement point; a policy's
    /// regex `whitelist` is informational context alongside it rather than
    /// a second gate.
    pub sql_permissions: Option<Vec<TablePermission>>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Policy {
    pub name: String,
    pub roles: HashSet<String>,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub tag_match: TagMatch,
    #[serde(default)]
    pub whitelist: Vec<String>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuthProviderType {
    Local,
    Oidc,
    Saml2,
    Ldap,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthProvider {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: AuthProviderType,
    pub enabled: bool,
    #[serde(default)]
    pub config: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    pub jwt_secret: String,
    #[serde(with = "humantime_serde")]
    pub token_expiry: Duration,
    #[serde(default)]
    pub users: Vec<LocalUser>,
    #[serde(default)]
    pub providers: Vec<AuthProvider>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub port: u16,
    #[serde(with = "humantime_serde")]
    pub max_connection_duration: Duration,
    pub base_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    pub audit_log_path: String,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    pub audit_memory_mb: Option<usize>,
}

fn default_log_level() -> String {
    "info".to_string()
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalPatternConfig {
    pub pattern: String,
    #[serde(default)]
    pub tags: HashSet<String>,
    #[serde(default)]
    pub tag_match: TagMatch,
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct WebhookConfig {
    pub url: String,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct SlackConfig {
    pub webhook_url: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApprovalConfig {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub patterns: Vec<ApprovalPatternConfig>,
    pub webhook: Option<WebhookConfig>,
    pub slack: Option<SlackConfig>,
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    File,
    Kubernetes,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(rename = "type")]
    pub kind: StorageKind,
    #[serde(flatten)]
    pub extra: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RawConfig {
    pub server: ServerConfig,
    pub auth: AuthConfig,
    #[serde(default)]
    pub connections: Vec<ConnectionDefinition>,
    #[serde(default)]
    pub policies: Vec<Policy>,
    pub logging: LoggingConfig,
    pub approval: Option<ApprovalConfig>,
    pub storage: Option<StorageConfig>,
}

/// An immutable, fully-validated view of the configuration. Reloads
/// produce a brand new snapshot; nothing mutates a `ConfigSnapshot` in
/// place.
#[derive(Debug)]
pub struct ConfigSnapshot {
    pub raw: RawConfig,
}

impl ConfigSnapshot {
    pub fn connection(&self, name: &str) -> Option<&ConnectionDefinition> {
        self.raw.connections.iter().find(|c| c.name == name)
    }

    pub fn validate(raw: &RawConfig) -> Result<(), BrokerError> {
        let mut seen = HashSet::new();
        for conn in &raw.connections {
            if !seen.insert(conn.name.as_str()) {
                return Err(BrokerError::ConfigError(format!(
                    "duplicate connection name: {}",
                    conn.name
                )));
            }
        }
        Ok(())
    }
}

pub fn load_from_str(yaml: &str) -> Result<ConfigSnapshot, BrokerError> {
    let raw: RawConfig = serde_yaml::from_str(yaml)
        .map_err(|e| BrokerError::ConfigError(format!("invalid config: {e}")))?;
    ConfigSnapshot::validate(&raw)?;
    Ok(ConfigSnapshot { raw })
}

pub fn load_from_path(path: impl AsRef<Path>) -> Result<ConfigSnapshot, BrokerError> {
    let contents = fs::read_to_string(path)
        .map_err(|e| BrokerError::ConfigError(format!("could not read config file: {e}")))?;
    load_from_str(&contents)
}

/// A live, swap-in-place config handle shared across the process.
pub struct ConfigHandle(ArcSwap<ConfigSnapshot>);

impl ConfigHandle {
    pub fn new(initial: ConfigSnapshot) -> Self {
        Self(ArcSwap::from_pointee(initial))
    }

    pub fn load(&self) -> Arc<ConfigSnapshot> {
        self.0.load_full()
    }

    /// Swap in a freshly-loaded snapshot. Existing handles keep their
    /// `Arc` clone of the old snapshot alive; nothing in flight is
    /// invalidated.
    pub fn reload(&self, next: ConfigSnapshot) {
        self.0.store(Arc::new(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
server:
  port: 8080
  max_connection_duration: 1h
auth:
  jwt_secret: topsecret
  token_expiry: 1h
  users:
    - username: alice
      password: hunter2
      roles: [developer]
connections:
  - name: pg-test
    type: postgres
    host: 127.0.0.1
    port: 5432
    tags: [env:test]
policies:
  - name: dev
    roles: [developer]
    tags: [env:test]
    whitelist: ["^SELECT.*"]
logging:
  audit_log_path: "-"
  log_level: info
"#;

    #[test]
    fn parses_sample_config() {
        let snap = load_from_str(SAMPLE).unwrap();
        assert_eq!(snap.raw.connections.len(), 1);
        assert_eq!(snap.connection("pg-test").unwrap().port, 5432);
    }

    #[test]
    fn rejects_duplicate_connection_names() {
        const DUP: &str = r#"
server:
  port: 8080
  max_connection_duration: 1h
auth:
  jwt_secret: topsecret
  token_expiry: 1h
connections:
  - name: pg-test
    type: postgres
    host: a
    port: 1
  - name: pg-test
    type: tcp
    host: b
    port: 2
logging:
  audit_log_path: "-"
"#;
        assert!(load_from_str(DUP).is_err());
    }
}
