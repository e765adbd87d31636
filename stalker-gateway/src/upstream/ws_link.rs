//! tokio-tungstenite implementation of [`UpstreamLink`].

use super::{codec_for, parse_frame, Frame, RawEvent, SubscriptionHandle, UpstreamConnector, UpstreamLink, WireCodec};
use crate::error::GatewayError;
use crate::stalker::chain::Chain;
use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::Value;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::time::Instant;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// Type alias for upstream WebSocket stream
type UpstreamWsStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// Strip credentials, path and query (API keys live there) for logging.
pub fn redact_endpoint(endpoint: &str) -> String {
    match url::Url::parse(endpoint) {
        Ok(u) => format!("{}://{}", u.scheme(), u.host_str().unwrap_or("?")),
        Err(_) => "<invalid url>".to_string(),
    }
}

/// Opens WebSocket links to the configured node endpoint of each chain.
pub struct WsConnector {
    endpoints: HashMap<Chain, String>,
    ack_timeout: Duration,
    idle_ping: Duration,
}

impl WsConnector {
    pub fn new(endpoints: HashMap<Chain, String>, ack_timeout: Duration, idle_ping: Duration) -> Self {
        Self {
            endpoints,
            ack_timeout,
            idle_ping,
        }
    }
}

#[async_trait]
impl UpstreamConnector for WsConnector {
    async fn connect(&self, chain: Chain) -> Result<Box<dyn UpstreamLink>, GatewayError> {
        let endpoint = self.endpoints.get(&chain).ok_or_else(|| {
            GatewayError::Connection(format!("no WebSocket endpoint configured for {}", chain))
        })?;

        log::info!(
            "[UPSTREAM] Connecting to {} node at {}",
            chain,
            redact_endpoint(endpoint)
        );

        let (stream, _response) = tokio::time::timeout(self.ack_timeout, connect_async(endpoint.as_str()))
            .await
            .map_err(|_| {
                GatewayError::Connection(format!(
                    "{} connect timed out after {}s",
                    chain,
                    self.ack_timeout.as_secs()
                ))
            })??;

        log::info!("[UPSTREAM] Connected to {} WebSocket", chain);

        Ok(Box::new(WsLink {
            chain,
            codec: codec_for(chain),
            stream,
            next_id: 1,
            backlog: VecDeque::new(),
            ack_timeout: self.ack_timeout,
            idle_ping: self.idle_ping,
            last_frame: Instant::now(),
            ping_sent_at: None,
        }))
    }
}

pub struct WsLink {
    chain: Chain,
    codec: Box<dyn WireCodec>,
    stream: UpstreamWsStream,
    next_id: u64,
    /// Events that arrived while a request was waiting for its ack
    backlog: VecDeque<RawEvent>,
    ack_timeout: Duration,
    idle_ping: Duration,
    /// When the node last sent anything, data or control
    last_frame: Instant,
    /// Set while a keep-alive ping is unanswered
    ping_sent_at: Option<Instant>,
}

impl WsLink {
    /// The keep-alive clock lives on the link, not in the `receive` future,
    /// so the worker dropping and re-polling `receive` does not reset it.
    fn keepalive_deadline(&self) -> Instant {
        match self.ping_sent_at {
            Some(sent) => sent + self.idle_ping,
            None => self.last_frame + self.idle_ping,
        }
    }

    fn saw_frame(&mut self) {
        self.last_frame = Instant::now();
        self.ping_sent_at = None;
    }

    /// Text payload of a data frame; control frames yield `None`.
    fn text_of(&self, msg: Message) -> Result<Option<String>, GatewayError> {
        match msg {
            Message::Text(text) => Ok(Some(text)),
            Message::Binary(bytes) => Ok(String::from_utf8(bytes).ok()),
            Message::Close(frame) => Err(GatewayError::Connection(format!(
                "{} node closed the connection ({:?})",
                self.chain, frame
            ))),
            _ => Ok(None),
        }
    }

    /// Send one request and wait for the response carrying its id.
    ///
    /// Notifications that arrive in the meantime are queued for `receive`.
    /// A response to any other id means the link is out of sync and must be
    /// rebuilt.
    async fn request(&mut self, build: impl FnOnce(&dyn WireCodec, u64) -> Value) -> Result<Value, GatewayError> {
        let id = self.next_id;
        self.next_id += 1;

        let payload = build(self.codec.as_ref(), id).to_string();
        log::debug!("[UPSTREAM] >>> {} request:\n{}", self.chain, payload);
        self.stream.send(Message::Text(payload)).await?;

        let deadline = Instant::now() + self.ack_timeout;
        loop {
            let msg = match tokio::time::timeout_at(deadline, self.stream.next()).await {
                Err(_) => {
                    return Err(GatewayError::Connection(format!(
                        "no acknowledgment for request {} within {}s",
                        id,
                        self.ack_timeout.as_secs()
                    )))
                }
                Ok(None) => {
                    return Err(GatewayError::Connection(format!(
                        "{} stream ended while awaiting ack",
                        self.chain
                    )))
                }
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(msg))) => msg,
            };
            self.saw_frame();

            let Some(text) = self.text_of(msg)? else {
                continue;
            };
            log::debug!("[UPSTREAM] <<< {} frame:\n{}", self.chain, text);

            match parse_frame(self.codec.as_ref(), self.chain, &text) {
                Ok(Frame::Ack { id: got, result }) if got == id => return Ok(result),
                Ok(Frame::Reject { id: got, message }) if got == id => {
                    return Err(GatewayError::Subscribe(message))
                }
                Ok(Frame::Ack { id: got, .. }) | Ok(Frame::Reject { id: got, .. }) => {
                    return Err(GatewayError::Connection(format!(
                        "{} link out of sync: acknowledgment for request {} while waiting for {}",
                        self.chain, got, id
                    )))
                }
                Ok(Frame::Event(event)) => self.backlog.push_back(event),
                Ok(Frame::Ignored) => {}
                Err(e) => log::warn!("[UPSTREAM] {} dropped frame: {}", self.chain, e),
            }
        }
    }
}

#[async_trait]
impl UpstreamLink for WsLink {
    async fn subscribe(&mut self, address: &str) -> Result<SubscriptionHandle, GatewayError> {
        let result = self
            .request(|codec, id| codec.subscribe_request(id, address))
            .await?;
        self.codec.parse_handle(&result)
    }

    async fn unsubscribe(&mut self, handle: &SubscriptionHandle) -> Result<(), GatewayError> {
        let result = self
            .request(|codec, id| codec.unsubscribe_request(id, handle))
            .await?;
        match result.as_bool() {
            Some(false) => Err(GatewayError::Subscribe(format!(
                "{} node refused to drop subscription {}",
                self.chain, handle
            ))),
            _ => Ok(()),
        }
    }

    async fn receive(&mut self) -> Result<RawEvent, GatewayError> {
        if let Some(event) = self.backlog.pop_front() {
            return Ok(event);
        }

        loop {
            let deadline = self.keepalive_deadline();
            let msg = match tokio::time::timeout_at(deadline, self.stream.next()).await {
                Err(_) => {
                    if self.ping_sent_at.is_some() {
                        return Err(GatewayError::Connection(format!(
                            "{} node silent for {}ms after ping",
                            self.chain,
                            self.idle_ping.as_millis()
                        )));
                    }
                    log::debug!("[UPSTREAM] {} idle, sending ping", self.chain);
                    self.ping_sent_at = Some(Instant::now());
                    self.stream.send(Message::Ping(Vec::new())).await?;
                    continue;
                }
                Ok(None) => {
                    return Err(GatewayError::Connection(format!(
                        "{} stream ended",
                        self.chain
                    )))
                }
                Ok(Some(Err(e))) => return Err(e.into()),
                Ok(Some(Ok(msg))) => msg,
            };
            self.saw_frame();

            let Some(text) = self.text_of(msg)? else {
                continue;
            };
            log::debug!("[UPSTREAM] <<< {} frame:\n{}", self.chain, text);

            match parse_frame(self.codec.as_ref(), self.chain, &text)? {
                Frame::Event(event) => return Ok(event),
                Frame::Ignored => {}
                Frame::Ack { id, .. } | Frame::Reject { id, .. } => {
                    return Err(GatewayError::Connection(format!(
                        "{} link out of sync: unsolicited acknowledgment for request {}",
                        self.chain, id
                    )))
                }
            }
        }
    }

    async fn close(&mut self) {
        if let Err(e) = self.stream.close(None).await {
            log::debug!("[UPSTREAM] {} close error: {}", self.chain, e);
        }
    }
}
