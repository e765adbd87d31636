//! Integration tests for the chain worker.
//!
//! A scripted in-memory upstream stands in for the node: it records every
//! subscribe / unsubscribe, can refuse connections or reject subscribes, and
//! lets the test push frames (or link failures) into the live link.

use super::chain::Chain;
use super::ChainMonitor;
use crate::config::MonitorConfig;
use crate::error::GatewayError;
use crate::gateway::events::EventBroadcaster;
use crate::upstream::{RawEvent, SubscriptionHandle, UpstreamConnector, UpstreamLink};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::Value;
use stalker_types::{ActivityState, LinkState, ServerMessage};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout, Duration};
use tokio_util::sync::CancellationToken;

const W: &str = "0x1111111111111111111111111111111111111111";
const V: &str = "0x2222222222222222222222222222222222222222";
const X: &str = "0x3333333333333333333333333333333333333333";

type FrameResult = Result<RawEvent, GatewayError>;

#[derive(Default)]
struct UpstreamState {
    connects: usize,
    /// Connection attempts still to refuse
    refuse_connects: usize,
    rejected: HashSet<String>,
    subscribes: Vec<String>,
    unsubscribes: Vec<SubscriptionHandle>,
    /// Most recent handle issued per address
    handles: HashMap<String, SubscriptionHandle>,
    frames: Option<mpsc::UnboundedSender<FrameResult>>,
}

#[derive(Clone, Default)]
struct ScriptedUpstream {
    state: Arc<Mutex<UpstreamState>>,
}

#[async_trait]
impl UpstreamConnector for ScriptedUpstream {
    async fn connect(&self, _chain: Chain) -> Result<Box<dyn UpstreamLink>, GatewayError> {
        let mut state = self.state.lock();
        state.connects += 1;
        if state.refuse_connects > 0 {
            state.refuse_connects -= 1;
            return Err(GatewayError::Connection("connection refused".to_string()));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        state.frames = Some(tx);
        Ok(Box::new(ScriptedLink {
            generation: state.connects,
            issued: 0,
            rx,
            state: self.state.clone(),
        }))
    }
}

struct ScriptedLink {
    generation: usize,
    issued: usize,
    rx: mpsc::UnboundedReceiver<FrameResult>,
    state: Arc<Mutex<UpstreamState>>,
}

#[async_trait]
impl UpstreamLink for ScriptedLink {
    async fn subscribe(&mut self, address: &str) -> Result<SubscriptionHandle, GatewayError> {
        let mut state = self.state.lock();
        if state.rejected.contains(address) {
            return Err(GatewayError::Subscribe(format!("invalid address {}", address)));
        }
        self.issued += 1;
        let handle = SubscriptionHandle::new(format!("sub-{}-{}", self.generation, self.issued));
        state.subscribes.push(address.to_string());
        state.handles.insert(address.to_string(), handle.clone());
        Ok(handle)
    }

    async fn unsubscribe(&mut self, handle: &SubscriptionHandle) -> Result<(), GatewayError> {
        self.state.lock().unsubscribes.push(handle.clone());
        Ok(())
    }

    async fn receive(&mut self) -> Result<RawEvent, GatewayError> {
        match self.rx.recv().await {
            Some(frame) => frame,
            None => Err(GatewayError::Connection("scripted link closed".to_string())),
        }
    }

    async fn close(&mut self) {
        self.rx.close();
    }
}

/// Test harness wiring one chain worker to a scripted upstream and a real
/// broadcast hub with one subscribed client.
struct TestHarness {
    chain: Chain,
    monitor: ChainMonitor,
    upstream: ScriptedUpstream,
    hub: Arc<EventBroadcaster>,
    client_rx: mpsc::Receiver<ServerMessage>,
    cancel: CancellationToken,
    worker: JoinHandle<()>,
}

impl TestHarness {
    fn new(chain: Chain) -> Self {
        Self::with_config(chain, test_config(), ScriptedUpstream::default())
    }

    fn with_config(chain: Chain, config: MonitorConfig, upstream: ScriptedUpstream) -> Self {
        let hub = Arc::new(EventBroadcaster::new(64));
        let (_client_id, client_rx) = hub.subscribe();
        let cancel = CancellationToken::new();
        let (monitor, worker) = ChainMonitor::spawn(
            chain,
            Arc::new(upstream.clone()),
            hub.clone(),
            config,
            cancel.clone(),
        );
        Self {
            chain,
            monitor,
            upstream,
            hub,
            client_rx,
            cancel,
            worker,
        }
    }

    fn push(&self, frame: FrameResult) {
        let state = self.upstream.state.lock();
        let tx = state.frames.as_ref().expect("no live upstream link");
        tx.send(frame).expect("link receiver gone");
    }

    /// A frame for `wallet` delivered on its current subscription.
    fn push_tx(&self, wallet: &str, tx_identifier: &str) {
        let handle = self.handle_of(wallet);
        self.push(Ok(RawEvent {
            chain: self.chain,
            tx_identifier: tx_identifier.to_string(),
            address_refs: vec![wallet.to_string()],
            block_ref: Some("0x10".to_string()),
            raw_payload: Value::Null,
            subscription: Some(handle),
        }));
    }

    fn handle_of(&self, wallet: &str) -> SubscriptionHandle {
        self.upstream
            .state
            .lock()
            .handles
            .get(wallet)
            .cloned()
            .expect("wallet never subscribed")
    }

    fn subscribes(&self) -> Vec<String> {
        self.upstream.state.lock().subscribes.clone()
    }

    fn unsubscribes(&self) -> Vec<SubscriptionHandle> {
        self.upstream.state.lock().unsubscribes.clone()
    }

    fn connects(&self) -> usize {
        self.upstream.state.lock().connects
    }

    async fn next_message(&mut self) -> ServerMessage {
        next_message(&mut self.client_rx).await
    }

    /// Next message, which must be an activity event; returns (wallet, tx).
    async fn next_activity(&mut self) -> (String, String) {
        match self.next_message().await {
            ServerMessage::WalletActivity(activity) => (activity.wallet, activity.tx_identifier),
            other => panic!("expected wallet_activity, got {:?}", other),
        }
    }
}

fn test_config() -> MonitorConfig {
    MonitorConfig {
        debounce_capacity: 100,
        active_threshold: Duration::from_secs(30),
        sweep_interval: Duration::from_secs(1),
        reconnect_base_delay: Duration::from_millis(10),
        reconnect_max_delay: Duration::from_millis(40),
        reconnect_max_attempts: 5,
        failed_retry_interval: Duration::from_millis(30),
        max_protocol_errors: 10,
    }
}

async fn next_message(rx: &mut mpsc::Receiver<ServerMessage>) -> ServerMessage {
    timeout(Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for a message")
        .expect("hub dropped the client")
}

async fn wait_until(mut condition: impl FnMut() -> bool) {
    timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not reached in time");
}

// ============================================================================
// Reference counting
// ============================================================================

#[tokio::test]
async fn test_two_clients_share_one_subscription() {
    let mut h = TestHarness::new(Chain::Ethereum);
    let (_b_id, mut client_b) = h.hub.subscribe();

    // Client A and client B both watch W; only one upstream subscribe
    h.monitor.watch(W).await.unwrap();
    h.monitor.watch(W).await.unwrap();
    h.monitor.watch(V).await.unwrap();
    assert_eq!(h.subscribes(), vec![W.to_string(), V.to_string()]);

    h.push_tx(W, "0xabc");
    assert_eq!(h.next_activity().await, (W.to_string(), "0xabc".to_string()));
    match next_message(&mut client_b).await {
        ServerMessage::WalletActivity(activity) => {
            assert_eq!(activity.wallet, W);
            assert_eq!(activity.chain, "ethereum");
            assert_eq!(activity.state, ActivityState::Active);
        }
        other => panic!("expected wallet_activity, got {:?}", other),
    }

    // A leaves: W is still subscribed
    h.monitor.unwatch(W).await.unwrap();
    assert!(h.unsubscribes().is_empty());
    assert!(h.monitor.list_watched().await.unwrap().contains(W));

    // B leaves: subscription released
    let w_handle = h.handle_of(W);
    h.monitor.unwatch(W).await.unwrap();
    assert_eq!(h.unsubscribes(), vec![w_handle]);
    assert!(!h.monitor.list_watched().await.unwrap().contains(W));

    // A straggling frame for W produces nothing; V's frame is the next message
    h.push_tx(W, "0xabc");
    h.push_tx(V, "0xdef");
    assert_eq!(h.next_activity().await, (V.to_string(), "0xdef".to_string()));
}

#[tokio::test]
async fn test_subscribed_iff_watched_across_interleavings() {
    let h = TestHarness::new(Chain::Ethereum);
    let steps: [(bool, &str); 9] = [
        (true, W),
        (true, V),
        (true, W),
        (false, W),
        (false, V),
        (false, V),
        (true, V),
        (false, W),
        (false, X),
    ];

    for (watch, wallet) in steps {
        if watch {
            h.monitor.watch(wallet).await.unwrap();
        } else {
            h.monitor.unwatch(wallet).await.unwrap();
        }
        let live = h.subscribes().len() - h.unsubscribes().len();
        assert_eq!(live, h.monitor.list_watched().await.unwrap().len());
    }

    assert_eq!(h.subscribes(), vec![W.to_string(), V.to_string(), V.to_string()]);
    assert_eq!(h.monitor.list_watched().await.unwrap().len(), 1);
}

#[tokio::test]
async fn test_rejected_subscribe_rolls_back() {
    let upstream = ScriptedUpstream::default();
    upstream.state.lock().rejected.insert(X.to_string());
    let h = TestHarness::with_config(Chain::Ethereum, test_config(), upstream);

    let err = h.monitor.watch(X).await.unwrap_err();
    assert!(matches!(err, GatewayError::Subscribe(_)));
    assert!(h.monitor.list_watched().await.unwrap().is_empty());

    // The link itself is unaffected
    h.monitor.watch(W).await.unwrap();
    assert_eq!(h.subscribes(), vec![W.to_string()]);
    assert_eq!(h.monitor.link_state(), LinkState::Connected);
}

// ============================================================================
// Debounce and activity
// ============================================================================

#[tokio::test]
async fn test_duplicate_frames_produce_one_event() {
    let mut h = TestHarness::new(Chain::Ethereum);
    h.monitor.watch(W).await.unwrap();

    for _ in 0..5 {
        h.push_tx(W, "0xabc");
    }
    h.push_tx(W, "0xfeed");

    assert_eq!(h.next_activity().await, (W.to_string(), "0xabc".to_string()));
    assert_eq!(h.next_activity().await, (W.to_string(), "0xfeed".to_string()));

    let status = h.monitor.status().await.unwrap();
    assert_eq!(status.wallets[W].observed_count, 2);
}

#[tokio::test]
async fn test_event_naming_two_watched_wallets_reaches_both() {
    let mut h = TestHarness::new(Chain::Base);
    h.monitor.watch(W).await.unwrap();
    h.monitor.watch(V).await.unwrap();

    // W -> V transfer delivered on W's subscription, then again on V's
    let mut frame = RawEvent {
        chain: Chain::Base,
        tx_identifier: "0x77".to_string(),
        address_refs: vec![W.to_string(), V.to_string()],
        block_ref: None,
        raw_payload: Value::Null,
        subscription: Some(h.handle_of(W)),
    };
    h.push(Ok(frame.clone()));
    frame.subscription = Some(h.handle_of(V));
    h.push(Ok(frame));
    h.push_tx(W, "0x78");

    assert_eq!(h.next_activity().await, (W.to_string(), "0x77".to_string()));
    assert_eq!(h.next_activity().await, (V.to_string(), "0x77".to_string()));
    assert_eq!(h.next_activity().await, (W.to_string(), "0x78".to_string()));
}

#[tokio::test]
async fn test_solana_frames_route_by_handle() {
    let wallet = "So11111111111111111111111111111111111111112";
    let mut h = TestHarness::new(Chain::Solana);
    h.monitor.watch(wallet).await.unwrap();

    h.push(Ok(RawEvent {
        chain: Chain::Solana,
        tx_identifier: "5h6xBEauJ3PK6SWCZ1PGjBvj8vDdWG3KpwATGy1ARAXF".to_string(),
        address_refs: Vec::new(),
        block_ref: Some("5208469".to_string()),
        raw_payload: Value::Null,
        subscription: Some(h.handle_of(wallet)),
    }));

    match h.next_message().await {
        ServerMessage::WalletActivity(activity) => {
            assert_eq!(activity.wallet, wallet);
            assert_eq!(activity.chain, "solana");
            assert_eq!(activity.block_ref.as_deref(), Some("5208469"));
        }
        other => panic!("expected wallet_activity, got {:?}", other),
    }
}

#[tokio::test]
async fn test_event_tagged_with_another_chain_is_dropped() {
    let mut h = TestHarness::new(Chain::Ethereum);
    h.monitor.watch(W).await.unwrap();

    h.push(Ok(RawEvent {
        chain: Chain::Polygon,
        tx_identifier: "0xstray".to_string(),
        address_refs: vec![W.to_string()],
        block_ref: None,
        raw_payload: Value::Null,
        subscription: Some(h.handle_of(W)),
    }));
    h.push_tx(W, "0xmine");
    assert_eq!(h.next_activity().await, (W.to_string(), "0xmine".to_string()));
}

#[tokio::test]
async fn test_status_reports_activity_records() {
    let mut h = TestHarness::new(Chain::Ethereum);
    h.monitor.watch(W).await.unwrap();
    h.monitor.watch(V).await.unwrap();
    h.push_tx(W, "0xabc");
    h.next_activity().await;

    let status = h.monitor.status().await.unwrap();
    assert_eq!(status.link, LinkState::Connected);

    let w = &status.wallets[W];
    assert_eq!(w.state, ActivityState::Active);
    assert_eq!(w.last_tx_identifier.as_deref(), Some("0xabc"));
    assert!(w.last_activity.ends_with("s ago"));
    assert!(w.last_activity_timestamp.is_some());

    let v = &status.wallets[V];
    assert_eq!(v.state, ActivityState::Idle);
    assert_eq!(v.last_activity, "Never");
    assert_eq!(v.observed_count, 0);
}

// ============================================================================
// Reconnection
// ============================================================================

#[tokio::test]
async fn test_reconnect_resubscribes_current_watch_set() {
    let mut h = TestHarness::new(Chain::Ethereum);
    h.monitor.watch(W).await.unwrap();
    h.monitor.watch(V).await.unwrap();
    h.monitor.watch(X).await.unwrap();
    h.monitor.unwatch(V).await.unwrap();
    let old_w = h.handle_of(W);

    h.push(Err(GatewayError::Connection("connection reset".to_string())));

    wait_until(|| h.connects() == 2 && h.subscribes().len() == 5).await;
    wait_until(|| h.monitor.link_state() == LinkState::Connected).await;
    assert_eq!(h.subscribes()[3..], [W.to_string(), X.to_string()]);

    // Handles were reissued; events route through the new ones only
    let new_w = h.handle_of(W);
    assert_ne!(old_w, new_w);
    h.push_tx(W, "0xafter");
    assert_eq!(h.next_activity().await, (W.to_string(), "0xafter".to_string()));
}

#[tokio::test]
async fn test_watch_while_link_down_is_replayed() {
    let mut h = TestHarness::new(Chain::Ethereum);
    h.monitor.watch(W).await.unwrap();
    h.upstream.state.lock().refuse_connects = usize::MAX;
    h.push(Err(GatewayError::Connection("connection reset".to_string())));
    wait_until(|| h.monitor.link_state() != LinkState::Connected).await;

    // Acknowledged now, subscribed by the next replay
    h.monitor.watch(V).await.unwrap();
    assert_eq!(h.subscribes(), vec![W.to_string()]);

    h.upstream.state.lock().refuse_connects = 0;
    wait_until(|| h.monitor.link_state() == LinkState::Connected).await;
    assert_eq!(
        h.subscribes(),
        vec![W.to_string(), W.to_string(), V.to_string()]
    );

    h.push_tx(V, "0x1");
    assert_eq!(h.next_activity().await, (V.to_string(), "0x1".to_string()));
}

#[tokio::test]
async fn test_link_drop_with_nothing_watched_returns_to_idle() {
    let h = TestHarness::new(Chain::Ethereum);
    h.monitor.watch(W).await.unwrap();
    h.monitor.unwatch(W).await.unwrap();
    assert_eq!(h.monitor.link_state(), LinkState::Connected);

    h.push(Err(GatewayError::Connection("connection reset".to_string())));
    wait_until(|| h.monitor.link_state() == LinkState::Idle).await;

    // No reconnect for an empty watch set
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.connects(), 1);

    // The next watch opens the link again
    h.monitor.watch(V).await.unwrap();
    assert_eq!(h.connects(), 2);
    assert_eq!(h.monitor.link_state(), LinkState::Connected);
    assert_eq!(h.subscribes(), vec![W.to_string(), V.to_string()]);
}

#[tokio::test]
async fn test_unwatching_last_wallet_while_down_returns_to_idle() {
    let h = TestHarness::new(Chain::Ethereum);
    h.monitor.watch(W).await.unwrap();
    h.upstream.state.lock().refuse_connects = usize::MAX;
    h.push(Err(GatewayError::Connection("connection reset".to_string())));
    wait_until(|| h.monitor.link_state() != LinkState::Connected).await;

    h.monitor.unwatch(W).await.unwrap();
    assert_eq!(h.monitor.link_state(), LinkState::Idle);

    let attempts = h.connects();
    sleep(Duration::from_millis(100)).await;
    assert_eq!(h.connects(), attempts);
}

#[tokio::test]
async fn test_failed_state_notifies_clients_then_recovers_silently() {
    let upstream = ScriptedUpstream::default();
    upstream.state.lock().refuse_connects = 3;
    let config = MonitorConfig {
        reconnect_max_attempts: 2,
        ..test_config()
    };
    let mut h = TestHarness::with_config(Chain::Ethereum, config, upstream);

    // First attempt happens inline and fails; the watch is still accepted
    h.monitor.watch(W).await.unwrap();

    match h.next_message().await {
        ServerMessage::Error { chain, message } => {
            assert_eq!(chain.as_deref(), Some("ethereum"));
            assert!(message.contains("link down"));
        }
        other => panic!("expected error, got {:?}", other),
    }
    assert_eq!(h.monitor.link_state(), LinkState::Failed);

    // Third attempt fails quietly, fourth succeeds
    wait_until(|| h.monitor.link_state() == LinkState::Connected).await;
    assert_eq!(h.connects(), 4);
    assert_eq!(h.subscribes(), vec![W.to_string()]);

    // No second error: the next message is ordinary activity
    h.push_tx(W, "0xback");
    assert_eq!(h.next_activity().await, (W.to_string(), "0xback".to_string()));
}

#[tokio::test]
async fn test_consecutive_protocol_errors_force_reconnect() {
    let mut h = TestHarness::new(Chain::Ethereum);
    h.monitor.watch(W).await.unwrap();

    let garbage = || Err(GatewayError::Protocol("unrecognised frame".to_string()));

    // A valid frame resets the streak
    for _ in 0..9 {
        h.push(garbage());
    }
    h.push_tx(W, "0x1");
    h.next_activity().await;
    assert_eq!(h.connects(), 1);

    for _ in 0..10 {
        h.push(garbage());
    }
    wait_until(|| h.connects() == 2 && h.subscribes().len() == 2).await;
    wait_until(|| h.monitor.link_state() == LinkState::Connected).await;
}

// ============================================================================
// Shutdown
// ============================================================================

#[tokio::test]
async fn test_shutdown_releases_subscriptions() {
    let h = TestHarness::new(Chain::Ethereum);
    h.monitor.watch(W).await.unwrap();
    h.monitor.watch(V).await.unwrap();
    let mut expected = vec![h.handle_of(W), h.handle_of(V)];

    h.cancel.cancel();
    timeout(Duration::from_secs(2), h.worker)
        .await
        .expect("worker did not stop")
        .unwrap();

    let mut released = h.upstream.state.lock().unsubscribes.clone();
    released.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    expected.sort_by(|a, b| a.as_str().cmp(b.as_str()));
    assert_eq!(released, expected);

    assert!(matches!(
        h.monitor.watch(X).await,
        Err(GatewayError::Unavailable(_))
    ));
}
