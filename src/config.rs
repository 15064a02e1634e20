// TRANSACTION LIFECYCLE - CONFIGURATION
// Handles: environment-driven settings with typed defaults

use std::{str::FromStr, time::Duration};

use crate::gas::DEFAULT_GAS_BUFFER;

#[derive(Clone)]
pub struct Config {
    pub port: u16,
    pub rpc_url: String,
    pub redis_url: Option<String>,
    pub event_channel: String,
    pub key_manager_url: Option<String>,
    pub key_id: Option<String>,
    pub signer_private_key: Option<String>,
    pub network_id: String,
    pub tx_history_limit: usize,
    pub nonce_lock_timeout: Duration,
    pub gas_buffer: u64,
    pub replacement_gas_bump_percent: u64,
    pub block_poll_interval: Duration,
    pub event_channel_capacity: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 3010,
            rpc_url: "http://localhost:8545".to_string(),
            redis_url: None,
            event_channel: "tx_events".to_string(),
            key_manager_url: None,
            key_id: None,
            signer_private_key: None,
            network_id: "1".to_string(),
            tx_history_limit: 40,
            nonce_lock_timeout: Duration::from_millis(30_000),
            gas_buffer: DEFAULT_GAS_BUFFER,
            replacement_gas_bump_percent: 10,
            block_poll_interval: Duration::from_millis(4_000),
            event_channel_capacity: 1024,
        }
    }
}

// Key material stays out of logs.
impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("rpc_url", &self.rpc_url)
            .field("redis_url", &self.redis_url)
            .field("event_channel", &self.event_channel)
            .field("key_manager_url", &self.key_manager_url)
            .field("key_id", &self.key_id)
            .field("signer_private_key", &self.signer_private_key.as_ref().map(|_| "<redacted>"))
            .field("network_id", &self.network_id)
            .field("tx_history_limit", &self.tx_history_limit)
            .field("nonce_lock_timeout", &self.nonce_lock_timeout)
            .field("gas_buffer", &self.gas_buffer)
            .field("replacement_gas_bump_percent", &self.replacement_gas_bump_percent)
            .field("block_poll_interval", &self.block_poll_interval)
            .field("event_channel_capacity", &self.event_channel_capacity)
            .finish()
    }
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_optional(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|s| !s.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            port: env_parse("PORT", defaults.port),
            rpc_url: std::env::var("RPC_URL").unwrap_or(defaults.rpc_url),
            redis_url: env_optional("REDIS_URL"),
            event_channel: std::env::var("EVENT_CHANNEL").unwrap_or(defaults.event_channel),
            key_manager_url: env_optional("KEY_MANAGER_URL"),
            key_id: env_optional("KEY_ID"),
            signer_private_key: env_optional("SIGNER_PRIVATE_KEY"),
            network_id: std::env::var("NETWORK_ID").unwrap_or(defaults.network_id),
            tx_history_limit: env_parse("TX_HISTORY_LIMIT", defaults.tx_history_limit),
            nonce_lock_timeout: Duration::from_millis(env_parse(
                "NONCE_LOCK_TIMEOUT_MS",
                defaults.nonce_lock_timeout.as_millis() as u64,
            )),
            gas_buffer: env_parse("GAS_BUFFER", defaults.gas_buffer),
            replacement_gas_bump_percent: env_parse(
                "REPLACEMENT_GAS_BUMP_PERCENT",
                defaults.replacement_gas_bump_percent,
            ),
            block_poll_interval: Duration::from_millis(env_parse(
                "BLOCK_POLL_INTERVAL_MS",
                defaults.block_poll_interval.as_millis() as u64,
            )),
            event_channel_capacity: env_parse(
                "EVENT_CHANNEL_CAPACITY",
                defaults.event_channel_capacity,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.gas_buffer, 100_000);
        assert_eq!(config.tx_history_limit, 40);
        assert_eq!(config.nonce_lock_timeout, Duration::from_secs(30));
    }

    #[test]
    fn debug_output_hides_private_key() {
        let config = Config {
            signer_private_key: Some("deadbeef".to_string()),
            ..Config::default()
        };
        let rendered = format!("{:?}", config);
        assert!(!rendered.contains("deadbeef"));
        assert!(rendered.contains("<redacted>"));
    }

    #[test]
    fn unparsable_values_fall_back() {
        assert_eq!(env_parse("WALLET_TX_LIFECYCLE_UNSET_VAR", 7u16), 7);
    }
}
