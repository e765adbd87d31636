use crate::error::GatewayError;
use dashmap::DashMap;
use stalker_types::ServerMessage;
use std::sync::Arc;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Internal commands sent to the background fan-out task.
enum BroadcastCmd {
    /// Deliver a message to every current subscriber.
    Send(ServerMessage),
    /// Notify every subscriber, drop them all and stop the loop.
    Shutdown,
}

/// Fans server messages out to every connected client session.
///
/// `publish()` never blocks: the message goes onto an unbounded command
/// channel and a background task does the per-client delivery. Each client
/// has its own bounded queue; a client that lets it fill up is evicted so a
/// slow consumer can never stall a chain worker.
pub struct EventBroadcaster {
    cmd_tx: mpsc::UnboundedSender<BroadcastCmd>,
    /// Shared so `subscribe` / `unsubscribe` / `client_count` work without
    /// a round trip through the command channel.
    clients: Arc<DashMap<String, mpsc::Sender<ServerMessage>>>,
    queue_capacity: usize,
}

impl EventBroadcaster {
    /// Must be called from within a tokio runtime.
    pub fn new(queue_capacity: usize) -> Self {
        let clients: Arc<DashMap<String, mpsc::Sender<ServerMessage>>> = Arc::new(DashMap::new());
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();

        tokio::spawn(Self::run_loop(cmd_rx, clients.clone()));

        Self {
            cmd_tx,
            clients,
            queue_capacity: queue_capacity.max(1),
        }
    }

    /// Subscribe a new client and return (client_id, receiver).
    pub fn subscribe(&self) -> (String, mpsc::Receiver<ServerMessage>) {
        let client_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::channel(self.queue_capacity);
        self.clients.insert(client_id.clone(), tx);
        log::debug!("[BROADCAST] Client {} subscribed", client_id);
        (client_id, rx)
    }

    pub fn unsubscribe(&self, client_id: &str) {
        if self.clients.remove(client_id).is_some() {
            log::debug!("[BROADCAST] Client {} unsubscribed", client_id);
        }
    }

    /// Queue a message for every subscriber. Returns immediately.
    pub fn publish(&self, message: ServerMessage) {
        if self.cmd_tx.send(BroadcastCmd::Send(message)).is_err() {
            log::debug!("[BROADCAST] Publish after shutdown ignored");
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.len()
    }

    /// Tell every session the gateway is going away, then drop them.
    ///
    /// Messages published before this call are delivered first.
    pub fn shutdown(&self) {
        let _ = self.cmd_tx.send(BroadcastCmd::Shutdown);
    }

    // ── background task ──────────────────────────────────────────────

    async fn run_loop(
        mut cmd_rx: mpsc::UnboundedReceiver<BroadcastCmd>,
        clients: Arc<DashMap<String, mpsc::Sender<ServerMessage>>>,
    ) {
        while let Some(cmd) = cmd_rx.recv().await {
            match cmd {
                BroadcastCmd::Send(message) => {
                    Self::deliver(&clients, message);
                }
                BroadcastCmd::Shutdown => {
                    let notice = ServerMessage::error("gateway shutting down");
                    for entry in clients.iter() {
                        let _ = entry.value().try_send(notice.clone());
                    }
                    let count = clients.len();
                    clients.clear();
                    log::info!("[BROADCAST] Dropped {} client(s) on shutdown", count);
                    break;
                }
            }
        }

        log::info!("[BROADCAST] Background broadcast loop shutting down");
    }

    fn deliver(clients: &DashMap<String, mpsc::Sender<ServerMessage>>, message: ServerMessage) {
        let kind = message.kind();

        if log::log_enabled!(log::Level::Debug) {
            if let Ok(json) = serde_json::to_string(&message) {
                log::debug!(
                    "[DATAGRAM] BROADCAST '{}' to {} clients:\n{}",
                    kind,
                    clients.len(),
                    json
                );
            }
        }

        let mut evicted = Vec::new();
        let mut closed = Vec::new();

        for entry in clients.iter() {
            match entry.value().try_send(message.clone()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(_)) => evicted.push(entry.key().clone()),
                Err(mpsc::error::TrySendError::Closed(_)) => closed.push(entry.key().clone()),
            }
        }

        // Dropping the sender ends the session's event stream, which closes it
        for client_id in evicted {
            clients.remove(&client_id);
            let err = GatewayError::Capacity(format!(
                "client {} fell behind on '{}' messages",
                client_id, kind
            ));
            log::warn!("[BROADCAST] Evicting slow client: {}", err);
        }
        for client_id in closed {
            clients.remove(&client_id);
            log::debug!("[BROADCAST] Removed disconnected client {}", client_id);
        }
    }
}
