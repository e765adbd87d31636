//! Actix-Web WebSocket handler for client sessions.
//!
//! A session is `Connecting` until the upgrade completes, `Open` while it
//! accepts commands, and `Closed` once either side hangs up or the hub drops
//! it. Each command gets exactly one reply; broadcast events are interleaved
//! by a separate forwarding task.

use crate::gateway::methods;
use crate::gateway::Gateway;
use crate::stalker::chain::Chain;
use actix_web::{web, HttpRequest, HttpResponse};
use actix_ws::AggregatedMessage;
use futures_util::StreamExt;
use stalker_types::{ClientCommand, ServerMessage};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Replies waiting to be written to one session
const REPLY_QUEUE_SIZE: usize = 32;

/// WebSocket handler for Actix-Web
pub async fn ws_handler(
    req: HttpRequest,
    stream: web::Payload,
    gateway: web::Data<Arc<Gateway>>,
) -> Result<HttpResponse, actix_web::Error> {
    let (response, session, msg_stream) = actix_ws::handle(&req, stream)?;

    let gateway = gateway.get_ref().clone();
    actix_web::rt::spawn(handle_ws_connection(session, msg_stream, gateway));

    Ok(response)
}

async fn handle_ws_connection(
    mut session: actix_ws::Session,
    msg_stream: actix_ws::MessageStream,
    gateway: Arc<Gateway>,
) {
    let mut msg_stream = msg_stream
        .aggregate_continuations()
        .max_continuation_size(64 * 1024);

    let broadcaster = gateway.broadcaster();
    let (session_id, mut event_rx) = broadcaster.subscribe();
    log::info!(
        "[WEBSOCKET] Session {} opened (total: {} sessions)",
        session_id,
        broadcaster.client_count()
    );

    // Written directly so it precedes any broadcast event
    let hello = ServerMessage::Connected {
        session_id: session_id.clone(),
    };
    if send_message(&mut session, &hello).await.is_err() {
        broadcaster.unsubscribe(&session_id);
        return;
    }

    let (tx, mut rx) = mpsc::channel::<ServerMessage>(REPLY_QUEUE_SIZE);
    let closed = CancellationToken::new();

    let mut send_session = session.clone();
    let send_closed = closed.clone();
    let send_gateway = gateway.clone();
    let send_id = session_id.clone();

    // Task to forward replies and broadcast events to the WebSocket
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(reply) = rx.recv() => {
                    if send_message(&mut send_session, &reply).await.is_err() {
                        break;
                    }
                }
                event = event_rx.recv() => match event {
                    Some(event) => {
                        if send_message(&mut send_session, &event).await.is_err() {
                            log::warn!("[WEBSOCKET] Failed to send '{}' to session {}", event.kind(), send_id);
                            break;
                        }
                    }
                    None => {
                        // The hub dropped us: shutdown already said goodbye,
                        // otherwise the queue overflowed
                        if !send_gateway.is_shutting_down() {
                            log::warn!("[WEBSOCKET] Session {} fell behind, disconnecting", send_id);
                            let notice = ServerMessage::error("event queue overflowed, disconnecting");
                            let _ = send_message(&mut send_session, &notice).await;
                        }
                        let _ = send_session.close(None).await;
                        break;
                    }
                },
            }
        }
        send_closed.cancel();
    });

    let mut watches = SessionWatches::default();

    loop {
        let next = tokio::select! {
            _ = closed.cancelled() => break,
            next = msg_stream.next() => next,
        };
        let Some(msg_result) = next else {
            break;
        };

        match msg_result {
            Ok(AggregatedMessage::Text(text)) => {
                log::debug!("[DATAGRAM] <<< FROM SESSION {}:\n{}", session_id, text);
                let reply = process_command(&text, &gateway).await;
                watches.record(&reply);
                if tx.send(reply).await.is_err() {
                    break;
                }
            }
            Ok(AggregatedMessage::Binary(_)) => {
                let reply = ServerMessage::error("Binary frames are not supported");
                if tx.send(reply).await.is_err() {
                    break;
                }
            }
            Ok(AggregatedMessage::Ping(data)) => {
                if session.pong(&data).await.is_err() {
                    break;
                }
            }
            Ok(AggregatedMessage::Close(_)) => {
                break;
            }
            Err(e) => {
                log::error!("[WEBSOCKET] Session {} error: {:?}", session_id, e);
                break;
            }
            _ => {}
        }
    }

    // Cleanup
    broadcaster.unsubscribe(&session_id);
    send_task.abort();

    if gateway.release_on_disconnect() {
        for (chain, wallet) in watches.drain() {
            if let Ok(monitor) = gateway.monitor(chain.as_str()) {
                if let Err(e) = monitor.unwatch(&wallet).await {
                    log::warn!("[WEBSOCKET] Release of {} on {} failed: {}", wallet, chain, e);
                }
            }
        }
    }

    let _ = session.close(None).await;
    log::info!("[WEBSOCKET] Session {} closed", session_id);
}

async fn send_message(
    session: &mut actix_ws::Session,
    message: &ServerMessage,
) -> Result<(), actix_ws::Closed> {
    match serde_json::to_string(message) {
        Ok(json) => {
            log::debug!("[DATAGRAM] >>> TO SESSION ({}):\n{}", message.kind(), json);
            session.text(json).await
        }
        Err(e) => {
            log::error!("[WEBSOCKET] Failed to serialize '{}': {}", message.kind(), e);
            Ok(())
        }
    }
}

/// Decode one text frame and run it. Always yields exactly one reply.
pub async fn process_command(text: &str, gateway: &Gateway) -> ServerMessage {
    let command: ClientCommand = match serde_json::from_str(text) {
        Ok(command) => command,
        Err(e) => return ServerMessage::error(format!("Invalid command: {}", e)),
    };

    let (result, chain) = match command {
        ClientCommand::Watch { wallet, chain } => {
            (methods::handle_watch(gateway, &wallet, &chain).await, chain)
        }
        ClientCommand::Unwatch { wallet, chain } => {
            (methods::handle_unwatch(gateway, &wallet, &chain).await, chain)
        }
        ClientCommand::Status { chain } => (methods::handle_status(gateway, &chain).await, chain),
    };

    result.unwrap_or_else(|e| {
        log::warn!("[WEBSOCKET] Command on {} failed: {}", chain, e);
        ServerMessage::chain_error(chain, e.to_string())
    })
}

/// Watches issued by one session, released on close when the gateway is
/// configured to do so.
#[derive(Debug, Default)]
struct SessionWatches {
    counts: HashMap<(Chain, String), usize>,
}

impl SessionWatches {
    /// Track the effect of a command reply.
    fn record(&mut self, reply: &ServerMessage) {
        match reply {
            ServerMessage::WatchStarted { wallet, chain } => {
                if let Ok(chain) = chain.parse::<Chain>() {
                    *self.counts.entry((chain, wallet.clone())).or_insert(0) += 1;
                }
            }
            ServerMessage::WatchStopped { wallet, chain } => {
                let Ok(chain) = chain.parse::<Chain>() else {
                    return;
                };
                let key = (chain, wallet.clone());
                if let Some(count) = self.counts.get_mut(&key) {
                    *count -= 1;
                    if *count == 0 {
                        self.counts.remove(&key);
                    }
                }
            }
            _ => {}
        }
    }

    /// One entry per outstanding watch.
    fn drain(&mut self) -> Vec<(Chain, String)> {
        let mut released = Vec::new();
        for ((chain, wallet), count) in self.counts.drain() {
            for _ in 0..count {
                released.push((chain, wallet.clone()));
            }
        }
        released
    }
}
