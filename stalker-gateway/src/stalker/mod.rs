//! Wallet stalking: per-chain watch state and the worker task that owns it.
//!
//! A [`ChainMonitor`] is the cloneable handle sessions use; every call is a
//! message to the chain's worker, which answers over a oneshot channel.

pub mod activity;
pub mod chain;
pub mod debounce;
pub mod registry;
mod worker;

#[cfg(test)]
mod monitor_tests;

pub use worker::ChainSnapshot;

use crate::config::MonitorConfig;
use crate::error::GatewayError;
use crate::gateway::events::EventBroadcaster;
use crate::upstream::UpstreamConnector;
use chain::Chain;
use parking_lot::RwLock;
use stalker_types::LinkState;
use std::collections::BTreeSet;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use worker::{ChainWorker, MonitorCmd};

/// Pending commands per chain before callers wait
const COMMAND_QUEUE_SIZE: usize = 64;

#[derive(Clone)]
pub struct ChainMonitor {
    chain: Chain,
    cmd_tx: mpsc::Sender<MonitorCmd>,
    link_state: Arc<RwLock<LinkState>>,
}

impl ChainMonitor {
    /// Start the worker for `chain`. It runs until `cancel` fires.
    pub fn spawn(
        chain: Chain,
        connector: Arc<dyn UpstreamConnector>,
        hub: Arc<EventBroadcaster>,
        config: MonitorConfig,
        cancel: CancellationToken,
    ) -> (Self, JoinHandle<()>) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_QUEUE_SIZE);
        let link_state = Arc::new(RwLock::new(LinkState::Idle));

        let worker = ChainWorker::new(chain, connector, hub, config, cancel, link_state.clone());
        let handle = tokio::spawn(worker.run(cmd_rx));

        (
            Self {
                chain,
                cmd_tx,
                link_state,
            },
            handle,
        )
    }

    pub fn chain(&self) -> Chain {
        self.chain
    }

    /// Current upstream link state, without a round trip to the worker.
    pub fn link_state(&self) -> LinkState {
        *self.link_state.read()
    }

    /// Add one watcher for `wallet` (already normalised for this chain).
    pub async fn watch(&self, wallet: &str) -> Result<(), GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCmd::Watch {
            wallet: wallet.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.unavailable())?
    }

    /// Release one watcher for `wallet`. Unknown wallets are a no-op.
    pub async fn unwatch(&self, wallet: &str) -> Result<(), GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCmd::Unwatch {
            wallet: wallet.to_string(),
            reply,
        })
        .await?;
        rx.await.map_err(|_| self.unavailable())
    }

    pub async fn status(&self) -> Result<ChainSnapshot, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCmd::Status { reply }).await?;
        rx.await.map_err(|_| self.unavailable())
    }

    pub async fn list_watched(&self) -> Result<BTreeSet<String>, GatewayError> {
        let (reply, rx) = oneshot::channel();
        self.send(MonitorCmd::ListWatched { reply }).await?;
        rx.await.map_err(|_| self.unavailable())
    }

    async fn send(&self, cmd: MonitorCmd) -> Result<(), GatewayError> {
        self.cmd_tx.send(cmd).await.map_err(|_| self.unavailable())
    }

    fn unavailable(&self) -> GatewayError {
        GatewayError::Unavailable(format!("{} monitor is not running", self.chain))
    }
}
