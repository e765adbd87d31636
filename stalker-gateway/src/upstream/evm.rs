//! EVM JSON-RPC dialect (`eth_subscribe` / `eth_subscription`).
//!
//! Wallets are subscribed through Alchemy's `alchemy_minedTransactions`
//! stream filtered on the address as sender or recipient. Plain `logs`
//! notifications are decoded as well, matching the wallet against the
//! emitting contract and any address-shaped topic.

use super::{RawEvent, SubscriptionHandle, WireCodec};
use crate::error::GatewayError;
use crate::stalker::chain::Chain;
use serde_json::{json, Value};

pub struct EvmCodec;

impl WireCodec for EvmCodec {
    fn subscribe_request(&self, id: u64, address: &str) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "eth_subscribe",
            "params": [
                "alchemy_minedTransactions",
                {
                    "addresses": [{ "from": address }, { "to": address }],
                    "includeRemoved": false,
                    "hashesOnly": false
                }
            ]
        })
    }

    fn unsubscribe_request(&self, id: u64, handle: &SubscriptionHandle) -> Value {
        json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "eth_unsubscribe",
            "params": [handle.as_str()]
        })
    }

    fn parse_handle(&self, result: &Value) -> Result<SubscriptionHandle, GatewayError> {
        result
            .as_str()
            .map(SubscriptionHandle::new)
            .ok_or_else(|| {
                GatewayError::Protocol(format!("eth_subscribe returned non-string id: {}", result))
            })
    }

    fn decode_notification(
        &self,
        chain: Chain,
        method: &str,
        params: &Value,
    ) -> Result<Option<RawEvent>, GatewayError> {
        if method != "eth_subscription" {
            return Ok(None);
        }

        let subscription = params
            .get("subscription")
            .and_then(|s| s.as_str())
            .map(SubscriptionHandle::new);
        let result = params.get("result").unwrap_or(&Value::Null);

        if result.get("removed").and_then(|r| r.as_bool()) == Some(true) {
            log::debug!("[UPSTREAM] {} ignoring reorged-out notification", chain);
            return Ok(None);
        }

        // Mined transaction shape: { removed, transaction: { hash, blockNumber, from, to } }
        if let Some(tx) = result.get("transaction") {
            let hash = tx.get("hash").and_then(|h| h.as_str()).ok_or_else(|| {
                GatewayError::Protocol("mined transaction without hash".to_string())
            })?;
            let address_refs = ["from", "to"]
                .iter()
                .filter_map(|k| tx.get(*k).and_then(|v| v.as_str()))
                .map(|a| a.to_lowercase())
                .collect();
            return Ok(Some(RawEvent {
                chain,
                tx_identifier: hash.to_lowercase(),
                address_refs,
                block_ref: tx.get("blockNumber").and_then(block_ref),
                raw_payload: result.clone(),
                subscription,
            }));
        }

        // Log shape: { address, topics, transactionHash, blockNumber }
        let hash = result
            .get("transactionHash")
            .and_then(|h| h.as_str())
            .ok_or_else(|| {
                GatewayError::Protocol("eth_subscription frame without transaction hash".to_string())
            })?;

        let mut address_refs: Vec<String> = Vec::new();
        if let Some(addr) = result.get("address").and_then(|a| a.as_str()) {
            address_refs.push(addr.to_lowercase());
        }
        if let Some(topics) = result.get("topics").and_then(|t| t.as_array()) {
            for topic in topics.iter().filter_map(|t| t.as_str()) {
                if let Some(addr) = topic_address(topic) {
                    if !address_refs.contains(&addr) {
                        address_refs.push(addr);
                    }
                }
            }
        }

        Ok(Some(RawEvent {
            chain,
            tx_identifier: hash.to_lowercase(),
            address_refs,
            block_ref: result.get("blockNumber").and_then(block_ref),
            raw_payload: result.clone(),
            subscription,
        }))
    }
}

fn block_ref(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Recover an address from a topic, either raw (20 bytes) or a 32-byte
/// word left-padded with zeros.
fn topic_address(topic: &str) -> Option<String> {
    let body = topic.strip_prefix("0x")?;
    let addr = match body.len() {
        40 => body,
        64 => {
            let (padding, addr) = body.split_at(24);
            if !padding.bytes().all(|b| b == b'0') {
                return None;
            }
            addr
        }
        _ => return None,
    };
    if addr.bytes().all(|b| b.is_ascii_hexdigit()) {
        Some(format!("0x{}", addr.to_lowercase()))
    } else {
        None
    }
}
