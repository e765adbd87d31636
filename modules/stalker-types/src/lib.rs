//! Shared types for the stalker gateway and its WebSocket / RPC clients.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

// =====================================================
// Session Protocol: client -> gateway
// =====================================================

/// A command sent by a UI client over its session socket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientCommand {
    Watch { wallet: String, chain: String },
    Unwatch { wallet: String, chain: String },
    Status { chain: String },
}

// =====================================================
// Domain Types
// =====================================================

/// Two-state liveness of a watched wallet
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActivityState {
    /// Activity observed within the active threshold
    Active,
    /// No activity within the threshold, or none observed yet
    Idle,
}

impl std::fmt::Display for ActivityState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ActivityState::Active => write!(f, "active"),
            ActivityState::Idle => write!(f, "idle"),
        }
    }
}

/// Connection state of a chain's upstream link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinkState {
    /// No wallets watched yet, nothing to connect for
    Idle,
    /// First connection attempt in progress
    Connecting,
    Connected,
    /// Link dropped, waiting out the backoff delay
    Disconnected,
    /// Reconnect attempt in progress
    Reconnecting,
    /// Retry budget exhausted; still retrying at the slow interval
    Failed,
}

impl std::fmt::Display for LinkState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkState::Idle => write!(f, "idle"),
            LinkState::Connecting => write!(f, "connecting"),
            LinkState::Connected => write!(f, "connected"),
            LinkState::Disconnected => write!(f, "disconnected"),
            LinkState::Reconnecting => write!(f, "reconnecting"),
            LinkState::Failed => write!(f, "failed"),
        }
    }
}

/// A debounced on-chain event for one watched wallet
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletActivity {
    pub wallet: String,
    pub tx_identifier: String,
    /// Block number (EVM) or slot (Solana), when the frame carried one
    pub block_ref: Option<String>,
    /// RFC 3339 time at which the gateway accepted the event
    pub observed_time: String,
    pub chain: String,
    pub state: ActivityState,
}

/// Per-wallet entry of a status snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WalletStatus {
    pub state: ActivityState,
    /// Human readable age, e.g. "12s ago", "4m ago" or "Never"
    pub last_activity: String,
    pub last_activity_timestamp: Option<String>,
    pub last_tx_identifier: Option<String>,
    pub observed_count: u64,
}

// =====================================================
// Session Protocol: gateway -> client
// =====================================================

/// Every message the gateway pushes to a session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Connected {
        session_id: String,
    },
    WatchStarted {
        wallet: String,
        chain: String,
    },
    WatchStopped {
        wallet: String,
        chain: String,
    },
    WalletActivity(WalletActivity),
    StatusUpdate {
        chain: String,
        link: LinkState,
        wallets: BTreeMap<String, WalletStatus>,
    },
    Error {
        message: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        chain: Option<String>,
    },
}

impl ServerMessage {
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            chain: None,
        }
    }

    pub fn chain_error(chain: impl Into<String>, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            chain: Some(chain.into()),
        }
    }

    /// Short name used in log lines
    pub fn kind(&self) -> &'static str {
        match self {
            ServerMessage::Connected { .. } => "connected",
            ServerMessage::WatchStarted { .. } => "watch_started",
            ServerMessage::WatchStopped { .. } => "watch_stopped",
            ServerMessage::WalletActivity(_) => "wallet_activity",
            ServerMessage::StatusUpdate { .. } => "status_update",
            ServerMessage::Error { .. } => "error",
        }
    }
}

// =====================================================
// HTTP RPC Types
// =====================================================

/// Link summary for one enabled chain
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChainStatus {
    pub chain: String,
    pub link: LinkState,
    pub watched_wallets: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub running: bool,
    pub uptime_secs: u64,
    pub connected_sessions: usize,
    pub chains: Vec<ChainStatus>,
}

/// Generic RPC response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RpcResponse<T: Serialize> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl<T: Serialize> RpcResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(msg: impl Into<String>) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(msg.into()),
        }
    }
}
