use crate::error::GatewayError;
use crate::gateway::Gateway;
use stalker_types::ServerMessage;

/// Handle the `status` command: link state plus every watched wallet's record
pub async fn handle_status(gateway: &Gateway, chain: &str) -> Result<ServerMessage, GatewayError> {
    let monitor = gateway.monitor(chain)?;
    let snapshot = monitor.status().await?;

    log::debug!(
        "[status] {} link {} with {} wallet(s)",
        monitor.chain(),
        snapshot.link,
        snapshot.wallets.len()
    );

    Ok(ServerMessage::StatusUpdate {
        chain: monitor.chain().to_string(),
        link: snapshot.link,
        wallets: snapshot.wallets,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::methods::handle_watch;
    use crate::gateway::tests::offline_gateway;
    use stalker_types::{ActivityState, LinkState};

    const WALLET: &str = "0x1111111111111111111111111111111111111111";

    #[tokio::test]
    async fn test_status_lists_watched_wallets() {
        let gateway = offline_gateway();
        handle_watch(&gateway, WALLET, "ethereum").await.unwrap();

        match handle_status(&gateway, "ethereum").await.unwrap() {
            ServerMessage::StatusUpdate {
                chain,
                link,
                wallets,
            } => {
                assert_eq!(chain, "ethereum");
                // No endpoint is reachable, so the lazy connect failed
                assert_eq!(link, LinkState::Disconnected);
                assert_eq!(wallets.len(), 1);
                assert_eq!(wallets[WALLET].state, ActivityState::Idle);
                assert_eq!(wallets[WALLET].last_activity, "Never");
            }
            other => panic!("expected status_update, got {:?}", other),
        }
    }
}
