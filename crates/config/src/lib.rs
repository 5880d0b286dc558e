use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use alloy::primitives::{Address, ChainId};
use serde::Deserialize;
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unknown network: {0}")]
    UnknownNetwork(String),
    #[error("missing env var {0}")]
    MissingEnv(String),
    #[error("invalid value for {name}: {value}")]
    InvalidEnv { name: String, value: String },
}

/// Built-in parameters for a supported network. RPC/WSS endpoints come from
/// the environment (`{NAME}_RPC`, `{NAME}_WSS`) since they carry credentials.
#[derive(Debug, Clone)]
pub struct NetworkPreset {
    pub name: &'static str,
    pub chain_id: ChainId,
    pub gate: Address,
    pub config: Address,
    pub deployment_block: u64,
}

impl NetworkPreset {
    pub fn for_name(name: &str) -> Option<Self> {
        match name {
            "blast" => Some(Self {
                name: "blast",
                chain_id: 81457,
                gate: addr("0x9e71e2fb8c1c6f82a3a4e5bfbcb07891fbd65644"),
                config: addr("0x3c8989b171e9e2c4c8a17f65bbbbb1d9a1593d9a"),
                deployment_block: 178_066,
            }),
            "base" => Some(Self {
                name: "base",
                chain_id: 8453,
                gate: addr("0x208b443983d8bcc8578e9d86db23fbb4c5d3a141"),
                config: addr("0x50b46c4ea54b5a8889c1e1e5b95b43d1a0b0b6f7"),
                deployment_block: 12_438_220,
            }),
            "arbitrum" => Some(Self {
                name: "arbitrum",
                chain_id: 42161,
                gate: addr("0xe02e8bbbcaa0aa0e0c8e0a62c2a74b2e69b0aa00"),
                config: addr("0x7b9e1b3f9e1c9a14c7d2cce7f9e0e3a2b5a6c901"),
                deployment_block: 125_130_007,
            }),
            _ => None,
        }
    }
}

fn addr(s: &str) -> Address {
    Address::from_str(s).expect("valid preset address")
}

/// Ingestion tuning. All fields carry service defaults; flags only override.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct IngestConfig {
    /// Trailing blocks held back before logs are considered final.
    pub confirmation: u64,
    /// Blocks fetched per `getLogs` range during sync.
    pub batch_size: u64,
    /// Downstream channel depth at which the sync loop suspends.
    pub threshold: usize,
    /// Override for the first indexed block (defaults to the preset).
    pub from_block: Option<u64>,
    /// Concurrent `getLogs` calls per fetch.
    pub parallel: usize,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            confirmation: 2,
            batch_size: 5000,
            threshold: 10_000,
            from_block: None,
            parallel: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SnapshotConfig {
    /// Persist the live snapshot every `interval` blocks.
    pub interval: u64,
    /// Snapshots more than `outdated` blocks behind head are pruned.
    pub outdated: u64,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            interval: 1800,
            outdated: 43_200,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReorgConfig {
    /// Width of the re-checked block window.
    pub span: u64,
    /// Blocks behind the stored tip where the window ends.
    pub delay: u64,
    /// Minimum block distance between two reconciliations.
    pub interval: u64,
}

impl Default for ReorgConfig {
    fn default() -> Self {
        Self {
            span: 100,
            delay: 10,
            interval: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct SubscriberConfig {
    #[serde(with = "humantime_serde")]
    pub keep_alive_interval: Duration,
    #[serde(with = "humantime_serde")]
    pub keep_alive_timeout: Duration,
    #[serde(with = "humantime_serde")]
    pub reconnect_delay: Duration,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
}

impl Default for SubscriberConfig {
    fn default() -> Self {
        Self {
            keep_alive_interval: Duration::from_secs(3),
            keep_alive_timeout: Duration::from_secs(1),
            reconnect_delay: Duration::from_secs(1),
            request_timeout: Duration::from_secs(3),
        }
    }
}

/// Fully resolved service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub network: NetworkPreset,
    pub rpc_url: Url,
    pub wss_url: Option<Url>,
    pub db_dir: PathBuf,
    pub amqp_url: Option<Url>,
    pub host: IpAddr,
    pub port: u16,
    pub readonly: bool,
    pub disable_websocket: bool,
    pub ingest: IngestConfig,
    pub snapshot: SnapshotConfig,
    pub reorg: ReorgConfig,
    pub subscriber: SubscriberConfig,
}

impl ServiceConfig {
    /// Assembles a config for `network` from presets plus the environment.
    /// `{NAME}_RPC` is required; `{NAME}_WSS` and `AMQP_URL` are optional.
    pub fn from_env(network: &str) -> Result<Self, ConfigError> {
        let preset = NetworkPreset::for_name(network)
            .ok_or_else(|| ConfigError::UnknownNetwork(network.to_string()))?;
        let upper = preset.name.to_uppercase();

        let rpc_url = require_url(&format!("{upper}_RPC"))?;
        let wss_url = optional_url(&format!("{upper}_WSS"))?;
        let amqp_url = optional_url("AMQP_URL")?;
        let db_dir = std::env::var("API_DB_URL")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("db"));

        Ok(Self {
            network: preset,
            rpc_url,
            wss_url,
            db_dir,
            amqp_url,
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 43210,
            readonly: false,
            disable_websocket: false,
            ingest: IngestConfig::default(),
            snapshot: SnapshotConfig::default(),
            reorg: ReorgConfig::default(),
            subscriber: SubscriberConfig::default(),
        })
    }

    pub fn initial_block(&self) -> u64 {
        self.ingest
            .from_block
            .unwrap_or(self.network.deployment_block)
    }
}

fn require_url(name: &str) -> Result<Url, ConfigError> {
    let value = std::env::var(name).map_err(|_| ConfigError::MissingEnv(name.to_string()))?;
    Url::parse(&value).map_err(|_| ConfigError::InvalidEnv {
        name: name.to_string(),
        value,
    })
}

fn optional_url(name: &str) -> Result<Option<Url>, ConfigError> {
    match std::env::var(name) {
        Ok(value) => Url::parse(&value)
            .map(Some)
            .map_err(|_| ConfigError::InvalidEnv {
                name: name.to_string(),
                value,
            }),
        Err(_) => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_network_presets() {
        let blast = NetworkPreset::for_name("blast").expect("blast preset");
        assert_eq!(blast.chain_id, 81457);
        assert!(NetworkPreset::for_name("goerli").is_none());
    }

    #[test]
    fn ingest_defaults_match_service_contract() {
        let ingest = IngestConfig::default();
        assert_eq!(ingest.confirmation, 2);
        assert_eq!(ingest.threshold, 10_000);
        assert_eq!(ingest.parallel, 10);
    }
}
