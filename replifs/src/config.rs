//! Runtime configuration.
//!
//! Loaded from a TOML file, overridable per-key from the command line, and
//! handed explicitly to the composition root.

use std::collections::HashMap;
use std::fmt;

use serde::Deserialize;

use crate::error::FsError;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct RuntimeConfig {
    /// Data root holding the replicated tree
    pub base_path: String,
    /// Root for the raft log, meta and snapshot directories
    pub raft_path: String,
    /// Raft group identifier
    pub group_id: String,
    /// This node's consensus address, `ip:port` or `ip:port:index`
    pub peer_addr: String,
    /// Comma-separated peer identities forming the initial cluster
    pub initial_conf: String,
    pub election_timeout_ms: u64,
    pub snapshot_interval_s: u64,
    /// Client RPC bind address
    pub rpc_addr: String,
    /// Client RPC bind port
    pub rpc_port: u16,
    /// Prometheus scrape endpoint
    pub metrics_addr: String,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        RuntimeConfig {
            base_path: "./data/fs".to_string(),
            raft_path: "./data/raft".to_string(),
            group_id: "replifs".to_string(),
            peer_addr: "127.0.0.1:8100".to_string(),
            initial_conf: "127.0.0.1:8100:0".to_string(),
            election_timeout_ms: 1000,
            snapshot_interval_s: 600,
            rpc_addr: "0.0.0.0".to_string(),
            rpc_port: 8200,
            metrics_addr: "0.0.0.0:8210".to_string(),
        }
    }
}

impl RuntimeConfig {
    pub fn from_toml(path: &str) -> Result<RuntimeConfig, FsError> {
        let contents = std::fs::read_to_string(path)?;
        toml::from_str(&contents).map_err(|e| FsError::Serialization(format!("config parse: {e}")))
    }

    pub fn validate(&self) -> Result<(), String> {
        for (name, value) in [
            ("base_path", &self.base_path),
            ("raft_path", &self.raft_path),
            ("group_id", &self.group_id),
            ("peer_addr", &self.peer_addr),
            ("initial_conf", &self.initial_conf),
            ("rpc_addr", &self.rpc_addr),
            ("metrics_addr", &self.metrics_addr),
        ] {
            if value.is_empty() {
                return Err(format!("{name} cannot be empty"));
            }
        }
        if self.election_timeout_ms == 0 {
            return Err("election_timeout_ms must be positive".to_string());
        }
        if self.rpc_port == 0 {
            return Err("rpc_port must be specified".to_string());
        }
        self.peers()?;
        self.self_id()?;
        Ok(())
    }

    /// Parses `initial_conf` into peer identities. Raft node ids are the
    /// 1-based positions in this list and must agree on every node.
    pub fn peers(&self) -> Result<Vec<PeerId>, String> {
        let mut peers = Vec::new();
        for part in self.initial_conf.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            peers.push(PeerId::parse(part)?);
        }
        if peers.is_empty() {
            return Err("initial_conf names no peers".to_string());
        }
        Ok(peers)
    }

    /// This node's raft id, found by locating `peer_addr` in `initial_conf`.
    pub fn self_id(&self) -> Result<u64, String> {
        let me = PeerId::parse(&self.peer_addr)?;
        self.peers()?
            .iter()
            .position(|peer| *peer == me)
            .map(|pos| pos as u64 + 1)
            .ok_or_else(|| format!("peer_addr {} is not in initial_conf", self.peer_addr))
    }

    /// Raft id to displayable peer identity.
    pub fn peer_names(&self) -> Result<HashMap<u64, String>, String> {
        Ok(self
            .peers()?
            .iter()
            .enumerate()
            .map(|(pos, peer)| (pos as u64 + 1, peer.to_string()))
            .collect())
    }

    /// Raft id to dialable socket address.
    pub fn peer_addrs(&self) -> Result<HashMap<u64, String>, String> {
        Ok(self
            .peers()?
            .iter()
            .enumerate()
            .map(|(pos, peer)| (pos as u64 + 1, peer.addr.clone()))
            .collect())
    }
}

/// Cluster member identity: consensus bind address plus a disambiguating
/// index, rendered as `ip:port:index`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerId {
    pub addr: String,
    pub index: u32,
}

impl PeerId {
    /// Accepts `ip:port` (index defaults to 0) or `ip:port:index`.
    pub fn parse(s: &str) -> Result<PeerId, String> {
        let parts: Vec<&str> = s.split(':').collect();
        let (ip, port, index) = match parts.as_slice() {
            [ip, port] => (*ip, *port, 0u32),
            [ip, port, index] => {
                let index = index
                    .parse::<u32>()
                    .map_err(|_| format!("invalid peer index in {s}"))?;
                (*ip, *port, index)
            }
            _ => return Err(format!("invalid peer identity: {s}")),
        };
        if ip.is_empty() {
            return Err(format!("invalid peer identity: {s}"));
        }
        port.parse::<u16>()
            .map_err(|_| format!("invalid peer port in {s}"))?;
        Ok(PeerId {
            addr: format!("{ip}:{port}"),
            index,
        })
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.addr, self.index)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        RuntimeConfig::default().validate().unwrap();
    }

    #[test]
    fn rejects_empty_required_strings() {
        let mut config = RuntimeConfig::default();
        config.group_id = String::new();
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_non_positive_integers() {
        let mut config = RuntimeConfig::default();
        config.election_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = RuntimeConfig::default();
        config.rpc_port = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn peer_identity_parses_with_and_without_index() {
        let plain = PeerId::parse("10.0.0.1:9000").unwrap();
        assert_eq!(plain.addr, "10.0.0.1:9000");
        assert_eq!(plain.index, 0);
        assert_eq!(plain.to_string(), "10.0.0.1:9000:0");

        let indexed = PeerId::parse("10.0.0.1:9000:2").unwrap();
        assert_eq!(indexed.index, 2);

        assert!(PeerId::parse("10.0.0.1").is_err());
        assert!(PeerId::parse("10.0.0.1:notaport").is_err());
        assert!(PeerId::parse(":9000").is_err());
    }

    #[test]
    fn self_id_is_the_position_in_initial_conf() {
        let mut config = RuntimeConfig::default();
        config.initial_conf =
            "10.0.0.1:9000:0,10.0.0.2:9000:0,10.0.0.3:9000:0".to_string();
        config.peer_addr = "10.0.0.2:9000".to_string();
        assert_eq!(config.self_id().unwrap(), 2);
        assert_eq!(config.peers().unwrap().len(), 3);

        config.peer_addr = "10.0.0.9:9000".to_string();
        assert!(config.self_id().is_err());
    }

    #[test]
    fn loads_from_toml() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            r#"
base_path = "/var/lib/replifs/data"
peer_addr = "127.0.0.1:9100"
initial_conf = "127.0.0.1:9100:0"
rpc_port = 9200
"#,
        )
        .unwrap();
        let config = RuntimeConfig::from_toml(path.to_str().unwrap()).unwrap();
        assert_eq!(config.base_path, "/var/lib/replifs/data");
        assert_eq!(config.rpc_port, 9200);
        // untouched keys keep their defaults
        assert_eq!(config.election_timeout_ms, 1000);
        config.validate().unwrap();
    }
}
