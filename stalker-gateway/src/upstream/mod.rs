//! Upstream node links.
//!
//! One persistent WebSocket per chain carries every watched wallet's
//! subscription. Chain families speak different JSON-RPC dialects; a
//! [`WireCodec`] turns each dialect into the chain-neutral [`RawEvent`].

pub mod evm;
pub mod solana;
pub mod ws_link;

pub use ws_link::WsConnector;

use crate::error::GatewayError;
use crate::stalker::chain::{Chain, ChainFamily};
use async_trait::async_trait;
use serde_json::Value;

/// Opaque subscription id issued by the upstream node.
///
/// Only valid on the link that issued it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(String);

impl SubscriptionHandle {
    pub fn new(id: impl Into<String>) -> Self {
        SubscriptionHandle(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A decoded push frame, before debouncing.
#[derive(Debug, Clone)]
pub struct RawEvent {
    pub chain: Chain,
    pub tx_identifier: String,
    /// Addresses the frame names (normalised to the chain's canonical form)
    pub address_refs: Vec<String>,
    pub block_ref: Option<String>,
    pub raw_payload: Value,
    /// Subscription the frame was delivered on, if the wire shape names one
    pub subscription: Option<SubscriptionHandle>,
}

/// A live connection to one chain's node.
#[async_trait]
pub trait UpstreamLink: Send {
    /// Issue one subscribe request scoped to `address` and wait for its ack.
    async fn subscribe(&mut self, address: &str) -> Result<SubscriptionHandle, GatewayError>;

    async fn unsubscribe(&mut self, handle: &SubscriptionHandle) -> Result<(), GatewayError>;

    /// Wait for the next event frame.
    ///
    /// Must be cancel-safe: the chain worker races it against client
    /// commands and drops the future when a command wins.
    async fn receive(&mut self) -> Result<RawEvent, GatewayError>;

    async fn close(&mut self);
}

#[async_trait]
pub trait UpstreamConnector: Send + Sync {
    async fn connect(&self, chain: Chain) -> Result<Box<dyn UpstreamLink>, GatewayError>;
}

/// Chain-family specific request builders and notification decoder.
pub trait WireCodec: Send + Sync {
    fn subscribe_request(&self, id: u64, address: &str) -> Value;

    fn unsubscribe_request(&self, id: u64, handle: &SubscriptionHandle) -> Value;

    /// Extract the handle from a subscribe acknowledgment's `result`.
    fn parse_handle(&self, result: &Value) -> Result<SubscriptionHandle, GatewayError>;

    /// Decode a notification. `Ok(None)` means the frame is valid but carries
    /// nothing to report (other methods, reorg removals).
    fn decode_notification(
        &self,
        chain: Chain,
        method: &str,
        params: &Value,
    ) -> Result<Option<RawEvent>, GatewayError>;
}

pub fn codec_for(chain: Chain) -> Box<dyn WireCodec> {
    match chain.family() {
        ChainFamily::Evm => Box::new(evm::EvmCodec),
        ChainFamily::Solana => Box::new(solana::SolanaCodec),
    }
}

/// One inbound JSON-RPC frame, classified.
#[derive(Debug)]
pub enum Frame {
    /// Successful response to request `id`
    Ack { id: u64, result: Value },
    /// Error response to request `id`
    Reject { id: u64, message: String },
    Event(RawEvent),
    Ignored,
}

pub fn parse_frame(codec: &dyn WireCodec, chain: Chain, text: &str) -> Result<Frame, GatewayError> {
    let value: Value = serde_json::from_str(text)?;

    if let Some(method) = value.get("method").and_then(|m| m.as_str()) {
        let params = value.get("params").cloned().unwrap_or(Value::Null);
        return Ok(match codec.decode_notification(chain, method, &params)? {
            Some(event) => Frame::Event(event),
            None => Frame::Ignored,
        });
    }

    if let Some(id) = value.get("id").and_then(|i| i.as_u64()) {
        if let Some(error) = value.get("error") {
            let message = error
                .get("message")
                .and_then(|m| m.as_str())
                .map(|m| m.to_string())
                .unwrap_or_else(|| error.to_string());
            return Ok(Frame::Reject { id, message });
        }
        if let Some(result) = value.get("result") {
            return Ok(Frame::Ack {
                id,
                result: result.clone(),
            });
        }
    }

    Err(GatewayError::Protocol(format!(
        "unrecognised frame: {}",
        truncate(text, 120)
    )))
}

fn truncate(text: &str, max: usize) -> &str {
    match text.char_indices().nth(max) {
        Some((idx, _)) => &text[..idx],
        None => text,
    }
}
