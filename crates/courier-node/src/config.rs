//! Courier node configuration.
//!
//! Loaded from YAML with every key optional (`CourierConfigInput`), then
//! resolved into a concrete `CourierConfig` with every default filled in.
//! `node_id` left at its default is replaced with the machine hostname
//! at resolve time, mirroring the reference loader.

use std::path::Path;

use serde::Deserialize;

use courier_transport::custody::CustodyConfig;
use courier_transport::receiver::ReceiveConfig;
use courier_transport::sender::{FecConfig, SendConfig};

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CourierConfigInput {
    pub node: NodeConfigInput,
    pub transfer: TransferConfigInput,
    pub fec: FecConfigInput,
    pub custody: CustodyConfigInput,
    pub storage: StorageConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NodeConfigInput {
    pub port: Option<u16>,
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct TransferConfigInput {
    pub chunk_size: Option<usize>,
    pub window_size: Option<u32>,
    pub base_rto_ms: Option<f64>,
    pub ttl_sec: Option<u64>,
    pub max_rto_ms: Option<f64>,
    pub pacing_delay_ms: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct FecConfigInput {
    pub enabled: Option<bool>,
    pub k: Option<u16>,
    pub r: Option<u16>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct CustodyConfigInput {
    pub max_retries: Option<u32>,
    pub backoff_base_sec: Option<f64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct StorageConfigInput {
    pub db_path: Option<String>,
    pub cleanup_interval_sec: Option<u64>,
    pub max_bytes: Option<u64>,
    pub output_dir: Option<String>,
}

/// Fully resolved configuration — every field has a concrete value.
#[derive(Debug, Clone)]
pub struct CourierConfig {
    pub port: u16,
    pub node_id: String,
    pub send: SendConfig,
    pub fec: FecConfig,
    pub receive: ReceiveConfig,
    pub custody: CustodyConfig,
    pub db_path: String,
    pub cleanup_interval_sec: u64,
    pub max_bytes: Option<u64>,
    pub output_dir: String,
}

const DEFAULT_NODE_ID: &str = "localhost";

impl CourierConfigInput {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let input: CourierConfigInput = serde_yaml::from_str(&raw)?;
        Ok(input)
    }

    /// Fills in every default. `node_id` left unset (or explicitly
    /// "localhost") is replaced with the machine hostname.
    pub fn resolve(self) -> CourierConfig {
        let node_id = match self.node.node_id {
            Some(id) if id != DEFAULT_NODE_ID => id,
            _ => hostname::get()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_else(|| DEFAULT_NODE_ID.to_string()),
        };

        let ttl_sec = self.transfer.ttl_sec.unwrap_or(300);

        let base_rto_ms = self.transfer.base_rto_ms.unwrap_or(900.0);
        let max_rto_ms = self.transfer.max_rto_ms.unwrap_or(500.0);
        let max_rto_ms = if max_rto_ms < base_rto_ms {
            tracing::warn!(
                base_rto_ms,
                max_rto_ms,
                clamped_to = base_rto_ms,
                "max_rto_ms below base_rto_ms, clamping"
            );
            base_rto_ms
        } else {
            max_rto_ms
        };

        let port = self.node.port.unwrap_or(5000);

        CourierConfig {
            port,
            node_id,
            send: SendConfig {
                chunk_size: self.transfer.chunk_size.unwrap_or(1150),
                window_size: self.transfer.window_size.unwrap_or(1024),
                base_rto_ms,
                ttl_sec,
                max_rto_ms,
                pacing_delay_ms: self.transfer.pacing_delay_ms.unwrap_or(0),
            },
            fec: FecConfig {
                enabled: self.fec.enabled.unwrap_or(true),
                k: self.fec.k.unwrap_or(4),
                r: self.fec.r.unwrap_or(2),
            },
            receive: ReceiveConfig {
                ttl_sec,
                sack_every: 50,
                flush_every: 500,
            },
            custody: CustodyConfig {
                max_retries: self.custody.max_retries.unwrap_or(10),
                backoff_base_sec: self.custody.backoff_base_sec.unwrap_or(2.0),
            },
            db_path: self
                .storage
                .db_path
                .unwrap_or_else(|| format!("courier_{node_id}_{port}.db")),
            cleanup_interval_sec: self.storage.cleanup_interval_sec.unwrap_or(60),
            max_bytes: self.storage.max_bytes,
            output_dir: self.storage.output_dir.unwrap_or_else(|| ".".to_string()),
        }
    }
}

impl CourierConfig {
    /// Resolved defaults with no file on disk.
    pub fn defaults() -> Self {
        CourierConfigInput::default().resolve()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_reference_values() {
        let cfg = CourierConfig::defaults();
        assert_eq!(cfg.port, 5000);
        assert_eq!(cfg.send.chunk_size, 1150);
        assert_eq!(cfg.send.window_size, 1024);
        assert_eq!(cfg.send.base_rto_ms, 900.0);
        assert_eq!(cfg.fec.k, 4);
        assert_eq!(cfg.fec.r, 2);
        assert_eq!(cfg.custody.max_retries, 10);
        assert_eq!(cfg.cleanup_interval_sec, 60);
        assert!(!cfg.node_id.is_empty());
        assert_ne!(cfg.node_id, DEFAULT_NODE_ID);
    }

    #[test]
    fn default_max_rto_is_clamped_up_to_base_rto() {
        // The shipped defaults (base=900, max=500) contradict max >= base;
        // resolve() clamps max up to base rather than rejecting the config.
        let cfg = CourierConfig::defaults();
        assert_eq!(cfg.send.max_rto_ms, cfg.send.base_rto_ms);
    }

    #[test]
    fn max_rto_above_base_rto_is_kept_as_is() {
        let input = CourierConfigInput {
            transfer: TransferConfigInput {
                base_rto_ms: Some(200.0),
                max_rto_ms: Some(1000.0),
                ..Default::default()
            },
            ..Default::default()
        };
        let cfg = input.resolve();
        assert_eq!(cfg.send.max_rto_ms, 1000.0);
    }

    #[test]
    fn unset_db_path_defaults_to_computed_filename() {
        let input = CourierConfigInput {
            node: NodeConfigInput {
                port: Some(7000),
                node_id: Some("node-a".to_string()),
            },
            ..Default::default()
        };
        let cfg = input.resolve();
        assert_eq!(cfg.db_path, "courier_node-a_7000.db");
        assert_eq!(cfg.output_dir, ".");
    }

    #[test]
    fn explicit_db_path_and_output_dir_are_kept() {
        let input = CourierConfigInput {
            storage: StorageConfigInput {
                db_path: Some("custom.db".to_string()),
                output_dir: Some("/tmp/received".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let cfg = input.resolve();
        assert_eq!(cfg.db_path, "custom.db");
        assert_eq!(cfg.output_dir, "/tmp/received");
    }

    #[test]
    fn explicit_node_id_is_kept() {
        let input = CourierConfigInput {
            node: NodeConfigInput {
                port: None,
                node_id: Some("node-a".to_string()),
            },
            ..Default::default()
        };
        let cfg = input.resolve();
        assert_eq!(cfg.node_id, "node-a");
    }

    #[test]
    fn parses_partial_yaml_and_fills_defaults() {
        let yaml = "node:\n  port: 6000\nfec:\n  enabled: false\n";
        let input: CourierConfigInput = serde_yaml::from_str(yaml).unwrap();
        let cfg = input.resolve();
        assert_eq!(cfg.port, 6000);
        assert!(!cfg.fec.enabled);
        assert_eq!(cfg.send.window_size, 1024);
    }
}
