//! Configuration management for the node.

use std::env;
use std::path::PathBuf;
use std::time::Duration;

use tandem_engine::NodeId;

use crate::transport::PeerHandle;

/// Node configuration loaded from environment variables.
#[derive(Debug, Clone)]
pub struct Config {
    /// This device's node identity
    pub node_id: NodeId,
    /// SQLite connection URL
    pub database_url: String,
    /// Address accepting peer sessions
    pub listen_addr: String,
    /// Address of the HTTP status surface
    pub status_addr: String,
    /// Statically known peers
    pub peers: Vec<PeerHandle>,
    /// Optional JSON schema file replacing the built-in business schema
    pub schema_path: Option<PathBuf>,
    /// Anti-entropy period
    pub sync_interval: Duration,
    /// Skew threshold for clock anomaly warnings
    pub max_clock_drift_ms: u64,
    pub session: SessionConfig,
}

/// The settings a sync session runs with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    /// Per-receive timeout
    pub timeout: Duration,
    /// Retries after a transient failure
    pub retries: u32,
    /// Base backoff, doubled per attempt
    pub retry_backoff: Duration,
    /// Operations per delta batch
    pub batch_size: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(15),
            retries: 3,
            retry_backoff: Duration::from_millis(500),
            batch_size: 256,
        }
    }
}

impl SessionConfig {
    /// Delay before retry number `attempt` (zero based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        self.retry_backoff
            .saturating_mul(2u32.saturating_pow(attempt))
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Load configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let node_id = lookup("NODE_ID")
            .filter(|id| !id.trim().is_empty())
            .ok_or(ConfigError::MissingNodeId)?;

        let database_url =
            lookup("DATABASE_URL").unwrap_or_else(|| "sqlite://tandem.db?mode=rwc".to_string());
        let listen_addr = lookup("LISTEN_ADDR").unwrap_or_else(|| "0.0.0.0:7400".to_string());
        let status_addr = lookup("STATUS_ADDR").unwrap_or_else(|| "127.0.0.1:7401".to_string());

        let peers = match lookup("PEERS") {
            Some(list) => parse_peers(&list)?,
            None => Vec::new(),
        };

        let defaults = SessionConfig::default();
        let session = SessionConfig {
            timeout: Duration::from_secs(positive(&lookup, "SESSION_TIMEOUT_SECS", 15)?),
            retries: number(&lookup, "SYNC_RETRIES", u64::from(defaults.retries))? as u32,
            retry_backoff: Duration::from_millis(number(&lookup, "RETRY_BACKOFF_MS", 500)?),
            batch_size: positive(&lookup, "BATCH_SIZE", defaults.batch_size as u64)? as usize,
        };

        Ok(Self {
            node_id,
            database_url,
            listen_addr,
            status_addr,
            peers,
            schema_path: lookup("SCHEMA_PATH").map(PathBuf::from),
            sync_interval: Duration::from_secs(positive(&lookup, "SYNC_INTERVAL_SECS", 30)?),
            max_clock_drift_ms: number(&lookup, "MAX_CLOCK_DRIFT_MS", 60_000)?,
            session,
        })
    }
}

fn number<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::InvalidNumber(key)),
        None => Ok(default),
    }
}

/// Like [`number`], rejecting zero.
fn positive<F>(lookup: &F, key: &'static str, default: u64) -> Result<u64, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    match number(lookup, key, default)? {
        0 => Err(ConfigError::InvalidNumber(key)),
        value => Ok(value),
    }
}

/// Parse `node_id@host:port` entries separated by commas.
fn parse_peers(list: &str) -> Result<Vec<PeerHandle>, ConfigError> {
    list.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .map(|entry| match entry.split_once('@') {
            Some((node_id, address)) if !node_id.is_empty() && !address.is_empty() => {
                Ok(PeerHandle::new(node_id, address))
            }
            _ => Err(ConfigError::InvalidPeer(entry.to_string())),
        })
        .collect()
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("NODE_ID environment variable is required")]
    MissingNodeId,

    #[error("Invalid {0} value")]
    InvalidNumber(&'static str),

    #[error("Invalid peer entry '{0}', expected node_id@host:port")]
    InvalidPeer(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults() {
        let config = Config::from_lookup(lookup(&[("NODE_ID", "laptop")])).unwrap();

        assert_eq!(config.node_id, "laptop");
        assert_eq!(config.database_url, "sqlite://tandem.db?mode=rwc");
        assert_eq!(config.listen_addr, "0.0.0.0:7400");
        assert_eq!(config.status_addr, "127.0.0.1:7401");
        assert!(config.peers.is_empty());
        assert_eq!(config.sync_interval, Duration::from_secs(30));
        assert_eq!(config.max_clock_drift_ms, 60_000);
        assert_eq!(config.session, SessionConfig::default());
    }

    #[test]
    fn test_missing_node_id() {
        let err = Config::from_lookup(lookup(&[])).unwrap_err();
        assert!(matches!(err, ConfigError::MissingNodeId));
    }

    #[test]
    fn test_peer_list() {
        let config = Config::from_lookup(lookup(&[
            ("NODE_ID", "laptop"),
            ("PEERS", "phone@10.0.0.2:7400, tablet@10.0.0.3:7400"),
        ]))
        .unwrap();

        assert_eq!(
            config.peers,
            vec![
                PeerHandle::new("phone", "10.0.0.2:7400"),
                PeerHandle::new("tablet", "10.0.0.3:7400"),
            ]
        );
    }

    #[test]
    fn test_invalid_values() {
        let err = Config::from_lookup(lookup(&[("NODE_ID", "a"), ("PEERS", "phone")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidPeer(_)));

        let err = Config::from_lookup(lookup(&[("NODE_ID", "a"), ("SYNC_RETRIES", "many")]))
            .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber("SYNC_RETRIES")));

        let err =
            Config::from_lookup(lookup(&[("NODE_ID", "a"), ("BATCH_SIZE", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::InvalidNumber("BATCH_SIZE")));
    }

    #[test]
    fn test_zero_periods_rejected() {
        for key in ["SYNC_INTERVAL_SECS", "SESSION_TIMEOUT_SECS"] {
            let err = Config::from_lookup(lookup(&[("NODE_ID", "a"), (key, "0")])).unwrap_err();
            assert!(matches!(err, ConfigError::InvalidNumber(k) if k == key), "{key}");
        }

        let config =
            Config::from_lookup(lookup(&[("NODE_ID", "a"), ("SYNC_INTERVAL_SECS", "1")])).unwrap();
        assert_eq!(config.sync_interval, Duration::from_secs(1));
    }

    #[test]
    fn test_backoff_doubles() {
        let session = SessionConfig {
            retry_backoff: Duration::from_millis(100),
            ..Default::default()
        };
        assert_eq!(session.backoff(0), Duration::from_millis(100));
        assert_eq!(session.backoff(1), Duration::from_millis(200));
        assert_eq!(session.backoff(3), Duration::from_millis(800));
    }
}
