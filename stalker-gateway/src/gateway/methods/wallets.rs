//! watch / unwatch session commands
//!
//! Both resolve the chain, normalise the address for it and forward to the
//! chain's worker. Replies echo the canonical address so clients can match
//! later `wallet_activity` messages against it.

use crate::error::GatewayError;
use crate::gateway::Gateway;
use stalker_types::ServerMessage;

/// Handle the `watch` command
pub async fn handle_watch(
    gateway: &Gateway,
    wallet: &str,
    chain: &str,
) -> Result<ServerMessage, GatewayError> {
    let monitor = gateway.monitor(chain)?;
    let chain = monitor.chain();
    let wallet = chain.normalize_address(wallet)?;

    monitor.watch(&wallet).await?;
    log::info!("[watch] {} on {}", wallet, chain);

    Ok(ServerMessage::WatchStarted {
        wallet,
        chain: chain.to_string(),
    })
}

/// Handle the `unwatch` command. Unwatching an unknown wallet still succeeds.
pub async fn handle_unwatch(
    gateway: &Gateway,
    wallet: &str,
    chain: &str,
) -> Result<ServerMessage, GatewayError> {
    let monitor = gateway.monitor(chain)?;
    let chain = monitor.chain();
    let wallet = chain.normalize_address(wallet)?;

    monitor.unwatch(&wallet).await?;
    log::info!("[unwatch] {} on {}", wallet, chain);

    Ok(ServerMessage::WatchStopped {
        wallet,
        chain: chain.to_string(),
    })
}
