//! Solana JSON-RPC dialect (`logsSubscribe` / `logsNotification`).
//!
//! Log notifications carry a signature and slot but not the mentioned
//! account, so events are routed by subscription id alone.

use super::{RawEvent, SubscriptionHandle, WireCodec};
use crate::error::GatewayError;
use crate::stalker::chain::Chain;
use serde_json::{json, Value};

pub struct SolanaCodec;

impl WireCodec for SolanaCodec {
    fn subscribe_request(&self, id: u64, address: &str) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "logsSubscribe",
            "params": [
                { "mentions": [address] },
                { "commitment": "confirmed" }
            ]
        })
    }

    fn unsubscribe_request(&self, id: u64, handle: &SubscriptionHandle) -> Value {
        // Solana subscription ids are integers on the wire
        let param = match handle.as_str().parse::<u64>() {
            Ok(n) => json!(n),
            Err(_) => json!(handle.as_str()),
        };
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "logsUnsubscribe",
            "params": [param]
        })
    }

    fn parse_handle(&self, result: &Value) -> Result<SubscriptionHandle, GatewayError> {
        match result {
            Value::Number(n) => Ok(SubscriptionHandle::new(n.to_string())),
            Value::String(s) => Ok(SubscriptionHandle::new(s.clone())),
            other => Err(GatewayError::Protocol(format!(
                "logsSubscribe returned unexpected id: {}",
                other
            ))),
        }
    }

    fn decode_notification(
        &self,
        chain: Chain,
        method: &str,
        params: &Value,
    ) -> Result<Option<RawEvent>, GatewayError> {
        if method != "logsNotification" {
            return Ok(None);
        }

        let subscription = match params.get("subscription") {
            Some(Value::Number(n)) => Some(SubscriptionHandle::new(n.to_string())),
            Some(Value::String(s)) => Some(SubscriptionHandle::new(s.clone())),
            _ => None,
        };
        let result = params.get("result").unwrap_or(&Value::Null);
        let value = result.get("value").unwrap_or(&Value::Null);

        let signature = value
            .get("signature")
            .and_then(|s| s.as_str())
            .ok_or_else(|| {
                GatewayError::Protocol("logsNotification without signature".to_string())
            })?;

        let slot = result
            .get("context")
            .and_then(|c| c.get("slot"))
            .and_then(|s| s.as_u64())
            .map(|s| s.to_string());

        Ok(Some(RawEvent {
            chain,
            tx_identifier: signature.to_string(),
            address_refs: Vec::new(),
            block_ref: slot,
            raw_payload: value.clone(),
            subscription,
        }))
    }
}
