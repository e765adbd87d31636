pub mod actix_ws;
pub mod events;
pub mod methods;

pub use events::EventBroadcaster;

use crate::config::Config;
use crate::error::GatewayError;
use crate::stalker::chain::Chain;
use crate::stalker::ChainMonitor;
use crate::upstream::UpstreamConnector;
use parking_lot::Mutex;
use stalker_types::{ChainStatus, ServiceStatus};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Owns one chain worker per enabled chain and the broadcast hub that
/// connects them to client sessions.
pub struct Gateway {
    monitors: BTreeMap<Chain, ChainMonitor>,
    broadcaster: Arc<EventBroadcaster>,
    cancel: CancellationToken,
    workers: Mutex<Vec<JoinHandle<()>>>,
    release_on_disconnect: bool,
    start_time: Instant,
}

impl Gateway {
    /// Spawn the hub and a worker for every chain with a configured endpoint.
    pub fn start(config: &Config, connector: Arc<dyn UpstreamConnector>) -> Self {
        let broadcaster = Arc::new(EventBroadcaster::new(config.client_queue_capacity));
        let cancel = CancellationToken::new();

        let mut monitors = BTreeMap::new();
        let mut workers = Vec::new();
        for chain in config.enabled_chains() {
            let (monitor, handle) = ChainMonitor::spawn(
                chain,
                connector.clone(),
                broadcaster.clone(),
                config.monitor.clone(),
                cancel.child_token(),
            );
            monitors.insert(chain, monitor);
            workers.push(handle);
        }

        log::info!(
            "[GATEWAY] Monitoring {} chain(s): {}",
            monitors.len(),
            monitors
                .keys()
                .map(|c: &Chain| c.as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );

        Self {
            monitors,
            broadcaster,
            cancel,
            workers: Mutex::new(workers),
            release_on_disconnect: config.release_on_disconnect,
            start_time: Instant::now(),
        }
    }

    /// Resolve a client-supplied chain name to its running monitor.
    pub fn monitor(&self, chain: &str) -> Result<&ChainMonitor, GatewayError> {
        let chain: Chain = chain.parse()?;
        self.monitors.get(&chain).ok_or_else(|| {
            GatewayError::ClientProtocol(format!("Chain {} is not enabled on this gateway", chain))
        })
    }

    pub fn broadcaster(&self) -> Arc<EventBroadcaster> {
        self.broadcaster.clone()
    }

    pub fn release_on_disconnect(&self) -> bool {
        self.release_on_disconnect
    }

    pub fn is_shutting_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub async fn status(&self) -> ServiceStatus {
        let mut chains = Vec::with_capacity(self.monitors.len());
        for (chain, monitor) in &self.monitors {
            let watched_wallets = match monitor.list_watched().await {
                Ok(wallets) => wallets.len(),
                Err(_) => 0,
            };
            chains.push(ChainStatus {
                chain: chain.to_string(),
                link: monitor.link_state(),
                watched_wallets,
            });
        }

        ServiceStatus {
            running: !self.is_shutting_down(),
            uptime_secs: self.start_time.elapsed().as_secs(),
            connected_sessions: self.broadcaster.client_count(),
            chains,
        }
    }

    /// Stop retrying, release every upstream subscription, then drop sessions.
    pub async fn shutdown(&self) {
        log::info!("[GATEWAY] Shutting down");
        self.cancel.cancel();

        let workers = std::mem::take(&mut *self.workers.lock());
        for handle in workers {
            if let Err(e) = handle.await {
                log::error!("[GATEWAY] Chain worker ended abnormally: {}", e);
            }
        }

        self.broadcaster.shutdown();
        log::info!("[GATEWAY] Shutdown complete");
    }
}
