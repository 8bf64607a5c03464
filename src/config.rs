//! Engine configuration.
//!
//! The upstream config loader is an external collaborator; its stand-in here
//! is a JSON file (`ponder.config.json` by default) merged with environment
//! variables. `DATABASE_URL` supplies the connection string and
//! `PONDER_RPC_URL_{chainId}` overrides a network's transport by convention.

use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::path::Path;

use alloy_primitives::{Address, B256};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::source::{
    AbiEvent, AddressCriteria, FactoryCriteria, FactoryParameter, LogFilter, Source,
};

pub const DEFAULT_POLLING_INTERVAL_MS: u64 = 1000;
pub const DEFAULT_MAX_REQUESTS_PER_SECOND: u32 = 50;
pub const DEFAULT_FINALITY_DEPTH: u64 = 65;
pub const DEFAULT_IDLE_TIMEOUT_MS: u64 = 30_000;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("contract {0} references unknown network {1}")]
    UnknownNetwork(String, String),

    #[error("contract {0} must set exactly one of address or factory")]
    AddressXorFactory(String),

    #[error("contract {0} has an invalid address: {1}")]
    InvalidAddress(String, String),

    #[error("contract {0} has an unparseable event signature: {1}")]
    InvalidAbiEvent(String, String),

    #[error("contract {0} filter references event {1} not present in its abi")]
    UnknownFilterEvent(String, String),

    #[error("contract {0} has an invalid filter argument: {1}")]
    InvalidFilterArg(String, String),

    #[error("network {0} has no transport url and PONDER_RPC_URL_{1} is unset")]
    MissingTransport(String, u64),

    #[error("network {0}: {1} must be positive")]
    NonPositive(String, &'static str),

    #[error("contract {0}: end_block {1} precedes start_block {2}")]
    EmptyBlockRange(String, u64, u64),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DatabaseKind {
    Postgres,
    /// The embedded kind. `pglite` is accepted as an alias for configs
    /// written against the original surface.
    #[serde(alias = "pglite")]
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    pub kind: DatabaseKind,
    /// Falls back to `DATABASE_URL`, then to a local file database.
    #[serde(default)]
    pub connection_string: Option<String>,
    /// User schema name; only meaningful on postgres.
    #[serde(default = "default_schema")]
    pub schema: String,
}

fn default_schema() -> String {
    "public".to_string()
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        DatabaseConfig {
            kind: DatabaseKind::Sqlite,
            connection_string: None,
            schema: default_schema(),
        }
    }
}

impl DatabaseConfig {
    pub fn resolve_connection_string(&self) -> String {
        self.connection_string
            .clone()
            .or_else(|| env::var("DATABASE_URL").ok())
            .unwrap_or_else(|| "sqlite://ponder.db?mode=rwc".to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkConfig {
    pub chain_id: u64,
    /// RPC URL. `PONDER_RPC_URL_{chainId}` takes precedence when set.
    #[serde(default)]
    pub transport: Option<String>,
    #[serde(default = "default_polling_interval")]
    pub polling_interval_ms: u64,
    #[serde(default = "default_max_rps")]
    pub max_requests_per_second: u32,
    /// In-flight request cap; defaults to the machine's core count.
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_requests: u32,
    #[serde(default = "default_finality_depth")]
    pub finality_depth: u64,
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_ms: u64,
    #[serde(default)]
    pub disable_cache: bool,
}

fn default_polling_interval() -> u64 {
    DEFAULT_POLLING_INTERVAL_MS
}
fn default_max_rps() -> u32 {
    DEFAULT_MAX_REQUESTS_PER_SECOND
}
fn default_max_concurrent() -> u32 {
    num_cpus::get().max(1) as u32
}
fn default_finality_depth() -> u64 {
    DEFAULT_FINALITY_DEPTH
}
fn default_idle_timeout() -> u64 {
    DEFAULT_IDLE_TIMEOUT_MS
}

impl NetworkConfig {
    /// The effective RPC URL after environment interpolation.
    pub fn resolve_transport(&self, network_name: &str) -> Result<String, ConfigError> {
        if let Ok(url) = env::var(format!("PONDER_RPC_URL_{}", self.chain_id)) {
            return Ok(url);
        }
        self.transport
            .clone()
            .ok_or_else(|| ConfigError::MissingTransport(network_name.to_string(), self.chain_id))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FactoryConfig {
    pub address: String,
    /// Canonical signature of the creation event.
    pub event: String,
    /// `"topic1" | "topic2" | "topic3"` or a data word offset.
    pub parameter: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FilterConfig {
    #[serde(default)]
    pub event: Option<String>,
    /// Positional topic values for topics 1..=3; null entries match anything.
    #[serde(default)]
    pub args: Vec<Option<String>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContractConfig {
    pub network: String,
    /// Canonical event signatures, e.g. `Transfer(address,address,uint256)`.
    pub abi: Vec<String>,
    #[serde(default)]
    pub address: Option<String>,
    #[serde(default)]
    pub factory: Option<FactoryConfig>,
    #[serde(default)]
    pub filter: Option<FilterConfig>,
    #[serde(default)]
    pub start_block: u64,
    #[serde(default)]
    pub end_block: Option<u64>,
    #[serde(default)]
    pub include_transaction_receipts: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub networks: BTreeMap<String, NetworkConfig>,
    pub contracts: BTreeMap<String, ContractConfig>,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default = "default_server_host")]
    pub server_host: String,
    #[serde(default = "default_server_port")]
    pub server_port: u16,
    /// Dev mode: instant view cutover, no crash recovery, stale dev tables
    /// always dropped.
    #[serde(default)]
    pub dev: bool,
}

fn default_server_host() -> String {
    "0.0.0.0".to_string()
}
fn default_server_port() -> u16 {
    42069
}

impl Config {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config: Config = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, network) in &self.networks {
            if network.polling_interval_ms == 0 {
                return Err(ConfigError::NonPositive(name.clone(), "polling_interval_ms"));
            }
            if network.max_requests_per_second == 0 {
                return Err(ConfigError::NonPositive(
                    name.clone(),
                    "max_requests_per_second",
                ));
            }
            if network.finality_depth == 0 {
                return Err(ConfigError::NonPositive(name.clone(), "finality_depth"));
            }
        }
        for (name, contract) in &self.contracts {
            if !self.networks.contains_key(&contract.network) {
                return Err(ConfigError::UnknownNetwork(
                    name.clone(),
                    contract.network.clone(),
                ));
            }
            if contract.address.is_some() == contract.factory.is_some() {
                return Err(ConfigError::AddressXorFactory(name.clone()));
            }
            if let Some(end) = contract.end_block {
                if end < contract.start_block {
                    return Err(ConfigError::EmptyBlockRange(
                        name.clone(),
                        end,
                        contract.start_block,
                    ));
                }
            }
        }
        Ok(())
    }

    /// Materialize the declarative contract table into sync sources.
    pub fn sources(&self) -> Result<Vec<Source>, ConfigError> {
        let mut sources = Vec::with_capacity(self.contracts.len());
        for (name, contract) in &self.contracts {
            let network = self
                .networks
                .get(&contract.network)
                .ok_or_else(|| ConfigError::UnknownNetwork(name.clone(), contract.network.clone()))?;

            let address = match (&contract.address, &contract.factory) {
                (Some(raw), None) => AddressCriteria::Single(parse_address(name, raw)?),
                (None, Some(factory)) => {
                    let event = AbiEvent::parse(&factory.event).ok_or_else(|| {
                        ConfigError::InvalidAbiEvent(name.clone(), factory.event.clone())
                    })?;
                    let parameter = match factory.parameter.as_str() {
                        "topic1" => FactoryParameter::Topic1,
                        "topic2" => FactoryParameter::Topic2,
                        "topic3" => FactoryParameter::Topic3,
                        offset => FactoryParameter::DataWord(offset.parse().map_err(|_| {
                            ConfigError::InvalidFilterArg(name.clone(), offset.to_string())
                        })?),
                    };
                    AddressCriteria::Factory(FactoryCriteria {
                        address: parse_address(name, &factory.address)?,
                        event_topic0: event.topic0,
                        parameter,
                    })
                }
                _ => return Err(ConfigError::AddressXorFactory(name.clone())),
            };

            let mut events = Vec::with_capacity(contract.abi.len());
            for signature in &contract.abi {
                let event = AbiEvent::parse(signature).ok_or_else(|| {
                    ConfigError::InvalidAbiEvent(name.clone(), signature.clone())
                })?;
                events.push(event);
            }

            let filter = match &contract.filter {
                Some(filter) => {
                    if let Some(event_name) = &filter.event {
                        if !events.iter().any(|e| &e.name == event_name) {
                            return Err(ConfigError::UnknownFilterEvent(
                                name.clone(),
                                event_name.clone(),
                            ));
                        }
                    }
                    let mut args = Vec::with_capacity(filter.args.len());
                    for arg in &filter.args {
                        args.push(match arg {
                            Some(raw) => Some(raw.parse::<B256>().map_err(|_| {
                                ConfigError::InvalidFilterArg(name.clone(), raw.clone())
                            })?),
                            None => None,
                        });
                    }
                    LogFilter {
                        event: filter.event.clone(),
                        args,
                    }
                }
                None => LogFilter::default(),
            };

            sources.push(Source {
                name: name.clone(),
                network: contract.network.clone(),
                chain_id: network.chain_id,
                address,
                events,
                filter,
                start_block: contract.start_block,
                end_block: contract.end_block,
                include_transaction_receipts: contract.include_transaction_receipts,
            });
        }
        Ok(sources)
    }

    /// Deterministic digest of the configuration; one input of the build id.
    pub fn fingerprint(&self) -> String {
        let canonical = serde_json::to_string(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(canonical.as_bytes());
        alloy_primitives::hex::encode(&hasher.finalize()[..8])
    }
}

fn parse_address(contract: &str, raw: &str) -> Result<Address, ConfigError> {
    raw.parse::<Address>()
        .map_err(|_| ConfigError::InvalidAddress(contract.to_string(), raw.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal() -> Config {
        serde_json::from_value(serde_json::json!({
            "networks": {
                "mainnet": { "chain_id": 1, "transport": "http://localhost:8545" }
            },
            "contracts": {
                "Token": {
                    "network": "mainnet",
                    "abi": ["Transfer(address,address,uint256)"],
                    "address": "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa",
                    "start_block": 100
                }
            }
        }))
        .unwrap()
    }

    #[test]
    fn defaults_applied() {
        let config = minimal();
        let network = &config.networks["mainnet"];
        assert_eq!(network.polling_interval_ms, 1000);
        assert_eq!(network.max_requests_per_second, 50);
        assert!(network.max_concurrent_requests >= 1);
        assert_eq!(network.finality_depth, 65);
        assert_eq!(network.idle_timeout_ms, 30_000);
        assert!(!network.disable_cache);
        assert_eq!(config.server_port, 42069);
        assert!(matches!(config.database.kind, DatabaseKind::Sqlite));
    }

    #[test]
    fn pglite_is_an_alias_for_the_embedded_kind() {
        let database: DatabaseConfig =
            serde_json::from_value(serde_json::json!({ "kind": "pglite" })).unwrap();
        assert!(matches!(database.kind, DatabaseKind::Sqlite));
        let database: DatabaseConfig =
            serde_json::from_value(serde_json::json!({ "kind": "postgres" })).unwrap();
        assert!(matches!(database.kind, DatabaseKind::Postgres));
    }

    #[test]
    fn address_and_factory_are_mutually_exclusive() {
        let mut config = minimal();
        let contract = config.contracts.get_mut("Token").unwrap();
        contract.factory = Some(FactoryConfig {
            address: "0xbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbbb".into(),
            event: "ChildCreated(address)".into(),
            parameter: "topic1".into(),
        });
        assert!(matches!(
            config.validate(),
            Err(ConfigError::AddressXorFactory(_))
        ));
    }

    #[test]
    fn unknown_network_rejected() {
        let mut config = minimal();
        config.contracts.get_mut("Token").unwrap().network = "nope".into();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::UnknownNetwork(_, _))
        ));
    }

    #[test]
    fn sources_resolve_addresses_and_events() {
        let sources = minimal().sources().unwrap();
        assert_eq!(sources.len(), 1);
        let source = &sources[0];
        assert_eq!(source.chain_id, 1);
        assert_eq!(source.events[0].name, "Transfer");
        assert_eq!(source.start_block, 100);
    }

    #[test]
    fn filter_must_name_a_known_event() {
        let mut config = minimal();
        config.contracts.get_mut("Token").unwrap().filter = Some(FilterConfig {
            event: Some("Approval".into()),
            args: vec![],
        });
        assert!(matches!(
            config.sources(),
            Err(ConfigError::UnknownFilterEvent(_, _))
        ));
    }

    #[test]
    fn fingerprint_tracks_content() {
        let a = minimal();
        let mut b = minimal();
        assert_eq!(a.fingerprint(), b.fingerprint());
        b.contracts.get_mut("Token").unwrap().start_block = 101;
        assert_ne!(a.fingerprint(), b.fingerprint());
    }
}
