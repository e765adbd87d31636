//! Supported chains and address normalisation.

use crate::error::GatewayError;
use std::str::FromStr;

/// Wire-shape family of a chain's upstream node API
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFamily {
    /// JSON-RPC `eth_subscribe` / `eth_subscription`
    Evm,
    /// JSON-RPC `logsSubscribe` / `logsNotification`
    Solana,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Chain {
    Ethereum,
    Base,
    Arbitrum,
    Optimism,
    Polygon,
    Solana,
}

impl Chain {
    pub const ALL: [Chain; 6] = [
        Chain::Ethereum,
        Chain::Base,
        Chain::Arbitrum,
        Chain::Optimism,
        Chain::Polygon,
        Chain::Solana,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ethereum",
            Chain::Base => "base",
            Chain::Arbitrum => "arbitrum",
            Chain::Optimism => "optimism",
            Chain::Polygon => "polygon",
            Chain::Solana => "solana",
        }
    }

    pub fn family(&self) -> ChainFamily {
        match self {
            Chain::Solana => ChainFamily::Solana,
            _ => ChainFamily::Evm,
        }
    }

    /// Prefix of the `<CHAIN>_WSS_URL` override variable
    pub fn env_prefix(&self) -> &'static str {
        match self {
            Chain::Ethereum => "ETHEREUM",
            Chain::Base => "BASE",
            Chain::Arbitrum => "ARBITRUM",
            Chain::Optimism => "OPTIMISM",
            Chain::Polygon => "POLYGON",
            Chain::Solana => "SOLANA",
        }
    }

    /// Hosted endpoint built from a provider API key
    /// (Alchemy for EVM chains, Helius for Solana).
    pub fn hosted_ws_url(&self, api_key: &str) -> String {
        match self {
            Chain::Ethereum => format!("wss://eth-mainnet.g.alchemy.com/v2/{}", api_key),
            Chain::Base => format!("wss://base-mainnet.g.alchemy.com/v2/{}", api_key),
            Chain::Arbitrum => format!("wss://arb-mainnet.g.alchemy.com/v2/{}", api_key),
            Chain::Optimism => format!("wss://opt-mainnet.g.alchemy.com/v2/{}", api_key),
            Chain::Polygon => format!("wss://polygon-mainnet.g.alchemy.com/v2/{}", api_key),
            Chain::Solana => format!("wss://mainnet.helius-rpc.com/?api-key={}", api_key),
        }
    }

    /// Validate a wallet address for this chain and return its canonical form.
    ///
    /// EVM addresses are lower-cased; Solana addresses are case-sensitive
    /// base58 and returned verbatim.
    pub fn normalize_address(&self, raw: &str) -> Result<String, GatewayError> {
        let raw = raw.trim();
        match self.family() {
            ChainFamily::Evm => {
                let body = raw
                    .strip_prefix("0x")
                    .or_else(|| raw.strip_prefix("0X"))
                    .ok_or_else(|| {
                        GatewayError::ClientProtocol(format!(
                            "Malformed {} address '{}': missing 0x prefix",
                            self, raw
                        ))
                    })?;
                if body.len() != 40 || hex::decode(body).is_err() {
                    return Err(GatewayError::ClientProtocol(format!(
                        "Malformed {} address '{}': expected 20 hex-encoded bytes",
                        self, raw
                    )));
                }
                Ok(format!("0x{}", body.to_lowercase()))
            }
            ChainFamily::Solana => match bs58::decode(raw).into_vec() {
                Ok(bytes) if bytes.len() == 32 => Ok(raw.to_string()),
                _ => Err(GatewayError::ClientProtocol(format!(
                    "Malformed solana address '{}': expected a base58 public key",
                    raw
                ))),
            },
        }
    }
}

impl std::fmt::Display for Chain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Chain {
    type Err = GatewayError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_lowercase();
        Chain::ALL
            .iter()
            .copied()
            .find(|c| c.as_str() == wanted)
            .ok_or_else(|| GatewayError::ClientProtocol(format!("Unknown chain: {}", s)))
    }
}
