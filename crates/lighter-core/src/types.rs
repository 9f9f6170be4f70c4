//! Shared plumbing types.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::pin::Pin;

/// Boxed future for dyn-compatible async trait methods.
pub type BoxFuture<'a, T> = Pin<Box<dyn std::future::Future<Output = T> + Send + 'a>>;

/// Current wall-clock time in Unix milliseconds.
pub fn now_millis() -> u64 {
    chrono::Utc::now().timestamp_millis().max(0) as u64
}

/// Lighter deployment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[default]
    Mainnet,
    Testnet,
}

impl Network {
    pub fn rest_url(&self) -> &'static str {
        match self {
            Self::Mainnet => "https://mainnet.zklighter.elliot.ai",
            Self::Testnet => "https://testnet.zklighter.elliot.ai",
        }
    }

    pub fn ws_url(&self) -> &'static str {
        match self {
            Self::Mainnet => "wss://mainnet.zklighter.elliot.ai/ws",
            Self::Testnet => "wss://testnet.zklighter.elliot.ai/ws",
        }
    }
}

impl fmt::Display for Network {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Mainnet => write!(f, "mainnet"),
            Self::Testnet => write!(f, "testnet"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_network_urls() {
        assert!(Network::Testnet.rest_url().contains("testnet"));
        assert!(Network::Mainnet.ws_url().ends_with("/ws"));
        let parsed: Network = serde_json::from_str("\"testnet\"").unwrap();
        assert_eq!(parsed, Network::Testnet);
    }
}
