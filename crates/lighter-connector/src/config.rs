//! Connector configuration.
//!
//! Loaded from a TOML file with `LIGHTER_`-prefixed environment overrides
//! (`LIGHTER_ACCOUNT_INDEX`, `LIGHTER_WS__BACKOFF_CEILING_MS`, ...). Key
//! material is never inline: `key` names an environment variable or a file.

use std::time::Duration;

use config::{Config, Environment, File, FileFormat};
use lighter_auth::signer::API_KEY_INDEX_RANGE;
use lighter_auth::KeySource;
use lighter_core::{MarketId, Network};
use lighter_rest::AccountTier;
use lighter_ws::ConnectionConfig;
use serde::Deserialize;

use crate::error::{ConnectorError, ConnectorResult};

pub const ENV_PREFIX: &str = "LIGHTER";

/// WebSocket settings shared by the public and private streams.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct WsSettings {
    #[serde(default = "default_backoff_floor_ms")]
    pub backoff_floor_ms: u64,
    #[serde(default = "default_backoff_ceiling_ms")]
    pub backoff_ceiling_ms: u64,
    /// Uptime after which the backoff resets to the floor.
    #[serde(default = "default_stability_threshold_secs")]
    pub stability_threshold_secs: u64,
    /// Usage fraction of a per-IP ceiling that triggers a warning.
    #[serde(default = "default_budget_warn_fraction")]
    pub budget_warn_fraction: f64,
    #[serde(default = "default_heartbeat_interval_secs")]
    pub heartbeat_interval_secs: u64,
    #[serde(default = "default_heartbeat_timeout_secs")]
    pub heartbeat_timeout_secs: u64,
    /// Consecutive failed attempts before giving up (0 = infinite).
    #[serde(default)]
    pub max_reconnect_attempts: u32,
}

fn default_backoff_floor_ms() -> u64 {
    1_000
}

fn default_backoff_ceiling_ms() -> u64 {
    60_000
}

fn default_stability_threshold_secs() -> u64 {
    30
}

fn default_budget_warn_fraction() -> f64 {
    0.8
}

fn default_heartbeat_interval_secs() -> u64 {
    30
}

fn default_heartbeat_timeout_secs() -> u64 {
    10
}

impl Default for WsSettings {
    fn default() -> Self {
        Self {
            backoff_floor_ms: default_backoff_floor_ms(),
            backoff_ceiling_ms: default_backoff_ceiling_ms(),
            stability_threshold_secs: default_stability_threshold_secs(),
            budget_warn_fraction: default_budget_warn_fraction(),
            heartbeat_interval_secs: default_heartbeat_interval_secs(),
            heartbeat_timeout_secs: default_heartbeat_timeout_secs(),
            max_reconnect_attempts: 0,
        }
    }
}

impl WsSettings {
    /// Connection settings for one stream.
    pub fn connection(&self, url: &str, stream: &str) -> ConnectionConfig {
        ConnectionConfig {
            url: url.to_string(),
            stream: stream.to_string(),
            backoff_floor: Duration::from_millis(self.backoff_floor_ms),
            backoff_ceiling: Duration::from_millis(self.backoff_ceiling_ms),
            stability_threshold: Duration::from_secs(self.stability_threshold_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            heartbeat_timeout: Duration::from_secs(self.heartbeat_timeout_secs),
            max_reconnect_attempts: self.max_reconnect_attempts,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ConnectorConfig {
    #[serde(default)]
    pub network: Network,
    pub account_index: u64,
    /// 0 and 1 are reserved by the exchange, 255 is invalid.
    pub api_key_index: u8,
    #[serde(default)]
    pub account_tier: AccountTier,
    pub key: KeySource,
    /// Markets whose books are streamed at startup.
    #[serde(default)]
    pub markets: Vec<u32>,
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,
    /// PENDING_CREATE / PENDING_CANCEL age that triggers a status query.
    #[serde(default = "default_order_ack_timeout_ms")]
    pub order_ack_timeout_ms: u64,
    #[serde(default = "default_auth_token_lifetime_secs")]
    pub auth_token_lifetime_secs: u64,
    #[serde(default)]
    pub ws: WsSettings,
    /// Perpetual account: also stream positions and funding.
    #[serde(default)]
    pub derivative: bool,
}

fn default_request_timeout_ms() -> u64 {
    10_000
}

fn default_order_ack_timeout_ms() -> u64 {
    10_000
}

fn default_auth_token_lifetime_secs() -> u64 {
    3_600
}

impl ConnectorConfig {
    /// Load `path` and apply environment overrides, then validate.
    pub fn load(path: &str) -> ConnectorResult<Self> {
        let settings = Config::builder()
            .add_source(File::with_name(path))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .map_err(|e| ConnectorError::Config(format!("Failed to read config: {e}")))?;
        Self::from_settings(settings)
    }

    /// Parse TOML text without environment overrides.
    pub fn from_toml(content: &str) -> ConnectorResult<Self> {
        let settings = Config::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()
            .map_err(|e| ConnectorError::Config(format!("Failed to parse config: {e}")))?;
        Self::from_settings(settings)
    }

    fn from_settings(settings: Config) -> ConnectorResult<Self> {
        let config: Self = settings
            .try_deserialize()
            .map_err(|e| ConnectorError::Config(format!("Invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> ConnectorResult<()> {
        if !API_KEY_INDEX_RANGE.contains(&self.api_key_index) {
            return Err(ConnectorError::Config(format!(
                "api_key_index {} outside 2..=254",
                self.api_key_index
            )));
        }
        let durations = [
            ("request_timeout_ms", self.request_timeout_ms),
            ("order_ack_timeout_ms", self.order_ack_timeout_ms),
            ("auth_token_lifetime_secs", self.auth_token_lifetime_secs),
            ("ws.backoff_floor_ms", self.ws.backoff_floor_ms),
            ("ws.heartbeat_interval_secs", self.ws.heartbeat_interval_secs),
            ("ws.heartbeat_timeout_secs", self.ws.heartbeat_timeout_secs),
        ];
        if let Some((name, _)) = durations.iter().find(|(_, v)| *v == 0) {
            return Err(ConnectorError::Config(format!("{name} must be positive")));
        }
        if self.ws.backoff_ceiling_ms < self.ws.backoff_floor_ms {
            return Err(ConnectorError::Config(
                "ws.backoff_ceiling_ms below ws.backoff_floor_ms".to_string(),
            ));
        }
        let fraction = self.ws.budget_warn_fraction;
        if !(fraction > 0.0 && fraction <= 1.0) {
            return Err(ConnectorError::Config(format!(
                "ws.budget_warn_fraction {fraction} outside (0, 1]"
            )));
        }
        Ok(())
    }

    pub fn rest_url(&self) -> &'static str {
        self.network.rest_url()
    }

    pub fn ws_url(&self) -> &'static str {
        self.network.ws_url()
    }

    pub fn market_ids(&self) -> Vec<MarketId> {
        self.markets.iter().copied().map(MarketId).collect()
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    pub fn order_ack_timeout(&self) -> Duration {
        Duration::from_millis(self.order_ack_timeout_ms)
    }

    pub fn auth_token_lifetime(&self) -> Duration {
        Duration::from_secs(self.auth_token_lifetime_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        account_index = 42
        api_key_index = 3

        [key]
        source = "env_var"
        var_name = "LIGHTER_TEST_KEY"
    "#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = ConnectorConfig::from_toml(MINIMAL).unwrap();
        assert_eq!(config.network, Network::Mainnet);
        assert_eq!(config.account_tier, AccountTier::Standard);
        assert_eq!(config.order_ack_timeout(), Duration::from_secs(10));
        assert_eq!(config.ws, WsSettings::default());
        assert!(!config.derivative);
        assert_eq!(
            config.key,
            KeySource::EnvVar {
                var_name: "LIGHTER_TEST_KEY".to_string()
            }
        );
    }

    #[test]
    fn test_full_config() {
        let config = ConnectorConfig::from_toml(
            r#"
            network = "testnet"
            account_index = 7
            api_key_index = 254
            account_tier = "premium"
            markets = [0, 1]
            derivative = true

            [key]
            source = "file"
            path = "/run/secrets/lighter"

            [ws]
            backoff_ceiling_ms = 30000
            budget_warn_fraction = 0.5
            "#,
        )
        .unwrap();
        assert_eq!(config.rest_url(), Network::Testnet.rest_url());
        assert_eq!(config.market_ids(), vec![MarketId(0), MarketId(1)]);
        assert_eq!(config.account_tier, AccountTier::Premium);

        let conn = config.ws.connection(config.ws_url(), "public");
        assert_eq!(conn.backoff_ceiling, Duration::from_secs(30));
        assert_eq!(conn.backoff_floor, Duration::from_secs(1));
        assert!(conn.url.starts_with("wss://testnet"));
    }

    #[test]
    fn test_rejects_reserved_key_index() {
        for index in [0u8, 1, 255] {
            let text = MINIMAL.replace("api_key_index = 3", &format!("api_key_index = {index}"));
            assert!(matches!(
                ConnectorConfig::from_toml(&text),
                Err(ConnectorError::Config(_))
            ));
        }
    }

    #[test]
    fn test_rejects_zero_timeout_and_bad_fraction() {
        let mut config = ConnectorConfig::from_toml(MINIMAL).unwrap();
        config.order_ack_timeout_ms = 0;
        assert!(config.validate().is_err());

        let mut config = ConnectorConfig::from_toml(MINIMAL).unwrap();
        config.ws.budget_warn_fraction = 0.0;
        assert!(config.validate().is_err());
        config.ws.budget_warn_fraction = 1.0;
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_inline_key_not_accepted() {
        let text = MINIMAL.replace(
            "source = \"env_var\"\n        var_name = \"LIGHTER_TEST_KEY\"",
            "source = \"inline\"\n        value = \"0xabc\"",
        );
        assert!(ConnectorConfig::from_toml(&text).is_err());
    }
}
