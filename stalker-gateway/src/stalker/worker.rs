//! Per-chain worker task.
//!
//! Owns the chain's upstream link, watch registry, debounce caches and
//! activity records, and is the only code that mutates them. Client
//! commands, upstream frames, reconnect timers and the liveness sweep are
//! all multiplexed on one `select!` loop, so a reconnect replay can never
//! interleave with a watch or unwatch.

use super::activity::ActivityTracker;
use super::chain::Chain;
use super::debounce::DebounceCache;
use super::registry::{SubscriptionRegistry, UnwatchOutcome, WatchOutcome};
use crate::config::MonitorConfig;
use crate::error::GatewayError;
use crate::gateway::events::EventBroadcaster;
use crate::upstream::{RawEvent, UpstreamConnector, UpstreamLink};
use chrono::Utc;
use parking_lot::RwLock;
use rand::Rng;
use stalker_types::{LinkState, ServerMessage, WalletActivity, WalletStatus};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, oneshot};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

/// Point-in-time view of one chain, for `status` replies
#[derive(Debug, Clone)]
pub struct ChainSnapshot {
    pub link: LinkState,
    pub wallets: BTreeMap<String, WalletStatus>,
}

pub(crate) enum MonitorCmd {
    Watch {
        wallet: String,
        reply: oneshot::Sender<Result<(), GatewayError>>,
    },
    Unwatch {
        wallet: String,
        reply: oneshot::Sender<()>,
    },
    Status {
        reply: oneshot::Sender<ChainSnapshot>,
    },
    ListWatched {
        reply: oneshot::Sender<BTreeSet<String>>,
    },
}

pub(crate) struct ChainWorker {
    chain: Chain,
    connector: Arc<dyn UpstreamConnector>,
    hub: Arc<EventBroadcaster>,
    config: MonitorConfig,
    cancel: CancellationToken,
    link: Option<Box<dyn UpstreamLink>>,
    link_state: Arc<RwLock<LinkState>>,
    registry: SubscriptionRegistry,
    debounce: DebounceCache,
    tracker: ActivityTracker,
    /// Consecutive failed connection attempts
    failures: u32,
    /// Consecutive malformed frames on the current link
    protocol_errors: u32,
    next_attempt: tokio::time::Instant,
}

impl ChainWorker {
    pub(crate) fn new(
        chain: Chain,
        connector: Arc<dyn UpstreamConnector>,
        hub: Arc<EventBroadcaster>,
        config: MonitorConfig,
        cancel: CancellationToken,
        link_state: Arc<RwLock<LinkState>>,
    ) -> Self {
        Self {
            chain,
            connector,
            hub,
            debounce: DebounceCache::new(config.debounce_capacity),
            tracker: ActivityTracker::new(config.active_threshold),
            config,
            cancel,
            link: None,
            link_state,
            registry: SubscriptionRegistry::new(),
            failures: 0,
            protocol_errors: 0,
            next_attempt: tokio::time::Instant::now(),
        }
    }

    pub(crate) async fn run(mut self, mut cmd_rx: mpsc::Receiver<MonitorCmd>) {
        log::info!("[STALKER] {} worker started", self.chain);

        let cancel = self.cancel.clone();
        let mut sweep = tokio::time::interval(self.config.sweep_interval);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            let wants_link = self.link.is_none() && !self.registry.is_empty();
            let next_attempt = self.next_attempt;

            tokio::select! {
                _ = cancel.cancelled() => break,
                cmd = cmd_rx.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => break,
                },
                frame = next_frame(&mut self.link) => self.handle_frame(frame),
                _ = tokio::time::sleep_until(next_attempt), if wants_link => self.connect().await,
                _ = sweep.tick() => self.sweep(),
            }
        }

        self.shutdown().await;
        log::info!("[STALKER] {} worker stopped", self.chain);
    }

    fn state(&self) -> LinkState {
        *self.link_state.read()
    }

    fn set_state(&self, state: LinkState) {
        let mut current = self.link_state.write();
        if *current != state {
            log::debug!("[STALKER] {} link {} -> {}", self.chain, *current, state);
            *current = state;
        }
    }

    // ── commands ─────────────────────────────────────────────────────

    async fn handle_command(&mut self, cmd: MonitorCmd) {
        match cmd {
            MonitorCmd::Watch { wallet, reply } => {
                let result = self.watch(&wallet).await;
                let _ = reply.send(result);
            }
            MonitorCmd::Unwatch { wallet, reply } => {
                self.unwatch(&wallet).await;
                let _ = reply.send(());
            }
            MonitorCmd::Status { reply } => {
                let _ = reply.send(ChainSnapshot {
                    link: self.state(),
                    wallets: self.tracker.snapshot(Instant::now()),
                });
            }
            MonitorCmd::ListWatched { reply } => {
                let _ = reply.send(self.registry.list_watched());
            }
        }
    }

    async fn watch(&mut self, wallet: &str) -> Result<(), GatewayError> {
        // Links are opened lazily, on the first wallet
        if self.state() == LinkState::Idle && self.link.is_none() {
            self.connect().await;
        }

        if let WatchOutcome::AlreadyWatched { watchers } = self.registry.watch(wallet) {
            log::debug!(
                "[STALKER] {} {} already watched ({} watchers)",
                self.chain,
                wallet,
                watchers
            );
            return Ok(());
        }
        self.tracker.track(wallet);

        let result = match self.link.as_mut() {
            Some(link) => link.subscribe(wallet).await,
            None => {
                log::info!(
                    "[STALKER] {} link down, {} will be subscribed on reconnect",
                    self.chain,
                    wallet
                );
                return Ok(());
            }
        };

        match result {
            Ok(handle) => {
                log::info!("[STALKER] {} watching {} ({})", self.chain, wallet, handle);
                self.registry.bind(wallet, handle);
                Ok(())
            }
            Err(e) if e.is_link_fatal() => {
                // Wallet stays registered and is picked up by the replay
                self.link_lost(e);
                Ok(())
            }
            Err(e) => {
                log::warn!("[STALKER] {} subscribe for {} rejected: {}", self.chain, wallet, e);
                self.registry.rollback(wallet);
                self.tracker.remove(wallet);
                self.debounce.remove(wallet);
                Err(e)
            }
        }
    }

    async fn unwatch(&mut self, wallet: &str) {
        let handle = match self.registry.unwatch(wallet) {
            UnwatchOutcome::NotWatched => {
                log::debug!("[STALKER] {} unwatch of unwatched {}", self.chain, wallet);
                return;
            }
            UnwatchOutcome::StillWatched { watchers } => {
                log::debug!(
                    "[STALKER] {} {} still has {} watchers",
                    self.chain,
                    wallet,
                    watchers
                );
                return;
            }
            UnwatchOutcome::Released { handle } => handle,
        };

        self.debounce.remove(wallet);
        self.tracker.remove(wallet);
        log::info!("[STALKER] {} stopped watching {}", self.chain, wallet);

        let (Some(handle), Some(link)) = (handle, self.link.as_mut()) else {
            self.settle_if_unused();
            return;
        };
        let result = link.unsubscribe(&handle).await;
        match result {
            Ok(()) => {}
            Err(e) if e.is_link_fatal() => self.link_lost(e),
            Err(e) => log::warn!(
                "[STALKER] {} unsubscribe of {} failed: {}",
                self.chain,
                handle,
                e
            ),
        }
    }

    // ── upstream events ──────────────────────────────────────────────

    fn handle_frame(&mut self, frame: Result<RawEvent, GatewayError>) {
        match frame {
            Ok(event) => {
                self.protocol_errors = 0;
                self.dispatch(event);
            }
            Err(GatewayError::Protocol(msg)) => {
                self.protocol_errors += 1;
                log::warn!(
                    "[STALKER] {} dropped malformed frame ({} in a row): {}",
                    self.chain,
                    self.protocol_errors,
                    msg
                );
                if self.protocol_errors >= self.config.max_protocol_errors {
                    let count = self.protocol_errors;
                    self.link_lost(GatewayError::Protocol(format!(
                        "{} consecutive malformed frames",
                        count
                    )));
                }
            }
            Err(e) => self.link_lost(e),
        }
    }

    /// Route one event to the wallets it concerns, debounce, record and publish.
    fn dispatch(&mut self, event: RawEvent) {
        if event.chain != self.chain {
            log::warn!(
                "[STALKER] {} worker dropped {} event {}",
                self.chain,
                event.chain,
                event.tx_identifier
            );
            return;
        }

        let mut targets: Vec<String> = Vec::new();
        if let Some(wallet) = event
            .subscription
            .as_ref()
            .and_then(|h| self.registry.wallet_for_handle(h))
        {
            targets.push(wallet.to_string());
        }
        for address in &event.address_refs {
            if self.registry.contains(address) && !targets.contains(address) {
                targets.push(address.clone());
            }
        }

        if targets.is_empty() {
            log::debug!(
                "[STALKER] {} event {} matches no watched wallet",
                self.chain,
                event.tx_identifier
            );
            return;
        }

        let now = Instant::now();
        let observed_at = Utc::now();

        for wallet in targets {
            if !self.debounce.accept(&wallet, &event.tx_identifier) {
                log::debug!(
                    "[STALKER] {} duplicate {} for {} suppressed",
                    self.chain,
                    event.tx_identifier,
                    wallet
                );
                continue;
            }

            let state = self
                .tracker
                .record_activity(&wallet, &event.tx_identifier, now, observed_at);
            log::info!(
                "[STALKER] {} activity on {}: {}",
                self.chain,
                wallet,
                event.tx_identifier
            );
            log::debug!("[STALKER] {} payload: {}", self.chain, event.raw_payload);

            self.hub.publish(ServerMessage::WalletActivity(WalletActivity {
                wallet,
                tx_identifier: event.tx_identifier.clone(),
                block_ref: event.block_ref.clone(),
                observed_time: observed_at.to_rfc3339(),
                chain: self.chain.to_string(),
                state,
            }));
        }
    }

    fn sweep(&mut self) {
        for wallet in self.tracker.sweep(Instant::now()) {
            log::info!("[STALKER] {} wallet {} went idle", self.chain, wallet);
        }
    }

    // ── reconnection ─────────────────────────────────────────────────

    async fn connect(&mut self) {
        match self.state() {
            LinkState::Idle => self.set_state(LinkState::Connecting),
            LinkState::Failed => {}
            _ => self.set_state(LinkState::Reconnecting),
        }

        let attempt = tokio::select! {
            _ = self.cancel.cancelled() => return,
            result = self.connector.connect(self.chain) => result,
        };

        let link = match attempt {
            Ok(link) => link,
            Err(e) => return self.connect_failed(e),
        };

        self.link = Some(link);
        self.registry.clear_handles();
        self.protocol_errors = 0;

        if let Err(e) = self.replay().await {
            self.link = None;
            self.registry.clear_handles();
            return self.connect_failed(e);
        }

        if self.failures > 0 {
            log::info!(
                "[STALKER] {} link restored after {} failed attempt(s)",
                self.chain,
                self.failures
            );
        }
        self.failures = 0;
        self.set_state(LinkState::Connected);
    }

    /// Reissue one subscribe per wallet in the current desired set.
    async fn replay(&mut self) -> Result<(), GatewayError> {
        let wallets = self.registry.unsubscribed();
        if wallets.is_empty() {
            return Ok(());
        }
        log::info!(
            "[STALKER] {} resubscribing {} wallet(s)",
            self.chain,
            wallets.len()
        );

        for wallet in wallets {
            let result = match self.link.as_mut() {
                Some(link) => link.subscribe(&wallet).await,
                None => break,
            };
            match result {
                Ok(handle) => {
                    self.registry.bind(&wallet, handle);
                }
                Err(e) if e.is_link_fatal() => return Err(e),
                Err(e) => log::warn!(
                    "[STALKER] {} could not resubscribe {}: {}",
                    self.chain,
                    wallet,
                    e
                ),
            }
        }
        Ok(())
    }

    fn connect_failed(&mut self, err: GatewayError) {
        self.failures += 1;
        let now = tokio::time::Instant::now();

        if self.failures < self.config.reconnect_max_attempts {
            let delay = self.backoff(self.failures + 1);
            log::warn!(
                "[STALKER] {} connection attempt {} failed: {} (retrying in {}ms)",
                self.chain,
                self.failures,
                err,
                delay.as_millis()
            );
            self.set_state(LinkState::Disconnected);
            self.next_attempt = now + delay;
            return;
        }

        if self.state() != LinkState::Failed {
            log::error!(
                "[STALKER] {} link failed after {} attempts: {}",
                self.chain,
                self.failures,
                err
            );
            self.set_state(LinkState::Failed);
            self.hub.publish(ServerMessage::chain_error(
                self.chain.as_str(),
                format!(
                    "{} link down after {} connection attempts, retrying every {}s",
                    self.chain,
                    self.failures,
                    self.config.failed_retry_interval.as_secs()
                ),
            ));
        } else {
            log::warn!("[STALKER] {} retry failed: {}", self.chain, err);
        }
        self.next_attempt = now + self.config.failed_retry_interval;
    }

    /// Drop the link; wallets keep their registration and are replayed.
    fn link_lost(&mut self, err: GatewayError) {
        log::error!("[STALKER] {} link lost: {}", self.chain, err);
        self.link = None;
        self.registry.clear_handles();
        self.protocol_errors = 0;
        self.failures = 0;
        self.set_state(LinkState::Disconnected);
        self.next_attempt = tokio::time::Instant::now() + self.backoff(1);
        self.settle_if_unused();
    }

    /// With nothing watched and no link there is nothing to reconnect for:
    /// go back to `Idle` so the next watch opens the link lazily.
    fn settle_if_unused(&mut self) {
        if self.link.is_none() && self.registry.is_empty() {
            self.failures = 0;
            self.set_state(LinkState::Idle);
        }
    }

    /// Exponential delay before attempt `attempt` (1-based), with up to 20% jitter.
    fn backoff(&self, attempt: u32) -> Duration {
        let exp = attempt.saturating_sub(1).min(16);
        let delay = self
            .config
            .reconnect_base_delay
            .saturating_mul(1u32 << exp)
            .min(self.config.reconnect_max_delay);
        let jitter_ms = delay.as_millis() as u64 / 5;
        if jitter_ms == 0 {
            return delay;
        }
        delay + Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
    }

    async fn shutdown(&mut self) {
        if let Some(mut link) = self.link.take() {
            let live = self.registry.live_handles();
            log::info!(
                "[STALKER] {} releasing {} subscription(s)",
                self.chain,
                live.len()
            );
            for (wallet, handle) in live {
                if let Err(e) = link.unsubscribe(&handle).await {
                    log::warn!(
                        "[STALKER] {} unsubscribe of {} failed on shutdown: {}",
                        self.chain,
                        wallet,
                        e
                    );
                    if e.is_link_fatal() {
                        break;
                    }
                }
            }
            link.close().await;
        }
        self.registry.clear_handles();
        self.set_state(LinkState::Disconnected);
    }
}

/// Next frame from the live link; pends forever while there is none.
async fn next_frame(link: &mut Option<Box<dyn UpstreamLink>>) -> Result<RawEvent, GatewayError> {
    match link {
        Some(link) => link.receive().await,
        None => std::future::pending().await,
    }
}
