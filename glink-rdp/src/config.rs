//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use glink_core::{Identity, IdentityError};
use serde::Deserialize;

use crate::client::ClientConfig;
use crate::server::ServerConfig;

/// Daemon configuration. File: ~/.config/glink/config.toml or /etc/glink/config.toml.
/// Env overrides: GLINK_PORT, GLINK_HANDSHAKE_TIMEOUT_MS, GLINK_HEALTH_PERIOD_MS.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// UDP listen port (default 5555).
    #[serde(default = "default_port")]
    pub port: u16,
    /// Client wait for the accept, in milliseconds (default 5000).
    #[serde(default = "default_handshake_timeout_ms")]
    pub handshake_timeout_ms: u64,
    /// Client health report interval, in milliseconds (default 5000).
    #[serde(default = "default_health_period_ms")]
    pub health_period_ms: u64,
    /// Bounded queue capacity (default 100).
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
    #[serde(default, rename = "cluster")]
    pub clusters: Vec<ClusterConfig>,
}

/// One `[[cluster]]` table.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterConfig {
    pub index: u16,
    pub name: String,
    #[serde(default = "default_partitions")]
    pub partitions: u32,
    /// Base64 identity secret. A fresh identity is generated when absent.
    #[serde(default)]
    pub identity: Option<String>,
}

impl ClusterConfig {
    pub fn identity(&self) -> Result<Identity, ConfigError> {
        match &self.identity {
            Some(secret) => Identity::from_base64(secret).map_err(|source| ConfigError::Identity {
                cluster: self.name.clone(),
                source,
            }),
            None => Ok(Identity::generate()),
        }
    }
}

fn default_port() -> u16 {
    5555
}
fn default_handshake_timeout_ms() -> u64 {
    5000
}
fn default_health_period_ms() -> u64 {
    5000
}
fn default_queue_capacity() -> usize {
    100
}
fn default_partitions() -> u32 {
    1
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: default_port(),
            handshake_timeout_ms: default_handshake_timeout_ms(),
            health_period_ms: default_health_period_ms(),
            queue_capacity: default_queue_capacity(),
            clusters: Vec::new(),
        }
    }
}

impl Config {
    pub fn client(&self) -> ClientConfig {
        ClientConfig {
            handshake_timeout: Duration::from_millis(self.handshake_timeout_ms),
            health_period: Duration::from_millis(self.health_period_ms),
            queue_capacity: self.queue_capacity,
        }
    }

    pub fn server(&self) -> ServerConfig {
        ServerConfig {
            queue_capacity: self.queue_capacity,
        }
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(p) = var("GLINK_PORT").and_then(|s| s.parse().ok()) {
            self.port = p;
        }
        if let Some(ms) = var("GLINK_HANDSHAKE_TIMEOUT_MS").and_then(|s| s.parse().ok()) {
            self.handshake_timeout_ms = ms;
        }
        if let Some(ms) = var("GLINK_HEALTH_PERIOD_MS").and_then(|s| s.parse().ok()) {
            self.health_period_ms = ms;
        }
    }
}

/// Load config: merge default, then the first config file found, then env vars.
pub fn load() -> Result<Config, ConfigError> {
    let mut c = match config_paths().into_iter().find(|p| p.exists()) {
        Some(path) => load_from(&path)?,
        None => Config::default(),
    };
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

/// Load one file, then env vars.
pub fn load_path(path: &Path) -> Result<Config, ConfigError> {
    let mut c = load_from(path)?;
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

/// Parse one file, without env overrides.
pub fn load_from(path: &Path) -> Result<Config, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })?;
    toml::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/glink/config.toml"));
    }
    out.push(PathBuf::from("/etc/glink/config.toml"));
    out
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid config {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
    #[error("cluster {cluster}: invalid identity: {source}")]
    Identity {
        cluster: String,
        #[source]
        source: IdentityError,
    },
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::io::Write;

    use super::*;

    fn write(text: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(text.as_bytes()).unwrap();
        f
    }

    #[test]
    fn defaults_when_empty() {
        let f = write("");
        let c = load_from(f.path()).unwrap();
        assert_eq!(c.port, 5555);
        assert_eq!(c.client().handshake_timeout, Duration::from_secs(5));
        assert_eq!(c.client().health_period, Duration::from_secs(5));
        assert_eq!(c.server().queue_capacity, 100);
        assert!(c.clusters.is_empty());
    }

    #[test]
    fn clusters_and_identity() {
        let id = Identity::generate();
        let f = write(&format!(
            r#"
port = 6000
queue_capacity = 8

[[cluster]]
index = 1
name = "ingest"
partitions = 12
identity = "{}"

[[cluster]]
index = 2
name = "scratch"
"#,
            id.to_base64()
        ));
        let c = load_from(f.path()).unwrap();
        assert_eq!(c.port, 6000);
        assert_eq!(c.clusters.len(), 2);
        assert_eq!(c.clusters[0].partitions, 12);
        assert_eq!(c.clusters[0].identity().unwrap().certificate(), id.certificate());
        assert_eq!(c.clusters[1].partitions, 1);
        assert!(c.clusters[1].identity().is_ok());
    }

    #[test]
    fn bad_identity_names_cluster() {
        let f = write("[[cluster]]\nindex = 1\nname = \"x\"\nidentity = \"AAAA\"\n");
        let c = load_from(f.path()).unwrap();
        let err = c.clusters[0].identity().unwrap_err();
        assert!(err.to_string().contains("cluster x"));
    }

    #[test]
    fn unknown_fields_rejected() {
        let f = write("proxy_port = 1\n");
        assert!(matches!(load_from(f.path()), Err(ConfigError::Parse { .. })));
        assert!(matches!(
            load_from(Path::new("/nonexistent/glink.toml")),
            Err(ConfigError::Read { .. })
        ));
    }

    #[test]
    fn env_overrides() {
        let env = HashMap::from([
            ("GLINK_PORT", "7000"),
            ("GLINK_HANDSHAKE_TIMEOUT_MS", "250"),
            ("GLINK_HEALTH_PERIOD_MS", "not a number"),
        ]);
        let mut c = Config::default();
        c.apply_env(|k| env.get(k).map(|v| v.to_string()));
        assert_eq!(c.port, 7000);
        assert_eq!(c.handshake_timeout_ms, 250);
        assert_eq!(c.health_period_ms, 5000);
    }
}
