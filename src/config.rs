use crate::types::{DEFAULT_BLOCK_REWARD, DEFAULT_GAS_PRICE, DEFAULT_SUPPLY_CAP};
use std::env;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Missing required environment variable {0}")]
    Missing(&'static str),
    #[error("Invalid value for {0}: {1}")]
    Invalid(&'static str, String),
}

/// Node configuration, read once from the process environment at startup.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// RPC service port.
    pub port: u16,
    /// KV + stream endpoint.
    pub redis_url: String,
    /// Seed peer multiaddrs.
    pub seed_nodes: Vec<String>,
    pub gas_price: u64,
    pub block_reward: u64,
    pub supply_cap: u64,
    /// Hex seed for the validator signing key. Missing keys are fatal.
    pub validator_seed: String,
    pub validator_stake: u64,
    /// Gossip listen port; 0 picks an ephemeral port.
    pub gossip_port: u16,
    /// Stream consumer workers in this process.
    pub stream_workers: usize,
}

impl NodeConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            port: parse_or("PORT", 8080)?,
            redis_url: env::var("REDIS_URL").map_err(|_| ConfigError::Missing("REDIS_URL"))?,
            seed_nodes: env::var("SEED_NODES")
                .unwrap_or_default()
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_owned)
                .collect(),
            gas_price: parse_or("GAS_PRICE", DEFAULT_GAS_PRICE)?,
            block_reward: parse_or("BLOCK_REWARD", DEFAULT_BLOCK_REWARD)?,
            supply_cap: parse_or("SUPPLY_CAP", DEFAULT_SUPPLY_CAP)?,
            validator_seed: env::var("VALIDATOR_SEED")
                .map_err(|_| ConfigError::Missing("VALIDATOR_SEED"))?,
            validator_stake: parse_or("VALIDATOR_STAKE", 0)?,
            gossip_port: parse_or("GOSSIP_PORT", 0)?,
            stream_workers: parse_or("STREAM_WORKERS", 2usize)?,
        })
    }
}

fn parse_or<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .parse()
            .map_err(|_| ConfigError::Invalid(name, raw)),
        Err(_) => Ok(default),
    }
}
