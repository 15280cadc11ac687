use std::{collections::HashMap, sync::Arc, time::Duration};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use shared::protocol::{ClientFrame, ServerFrame};
use tokio::{
    net::TcpStream,
    sync::{broadcast, mpsc, Mutex},
    task::JoinHandle,
    time::{interval, Instant, MissedTickBehavior},
};
use tokio_tungstenite::{
    connect_async, tungstenite::Message as WsMessage, MaybeTlsStream, WebSocketStream,
};
use tracing::{info, warn};
use url::Url;

use crate::error::TransportError;

pub(crate) const RECONNECT_BACKOFF: Duration = Duration::from_secs(3);
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(20);
const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Connection lifecycle of the single physical link to the messaging backend.
///
/// `Disconnected -> Connecting -> Connected -> Reconnecting -> Connected ...`
/// with `disconnect()` reachable from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[derive(Debug, Clone)]
pub enum TransportEvent {
    StateChanged(ConnectionState),
    /// A serialized message payload delivered on a subscribed topic.
    Frame { topic: String, payload: String },
    SubscribeRejected { topic: String, reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutboundFrame {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Publish { topic: String, payload: String },
    Ping,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Message { topic: String, payload: String },
    SubscribeRejected { topic: String, reason: String },
    Pong,
}

/// Opens one physical link per call. Production uses [`WsConnector`]; tests
/// plug in an in-memory connector.
#[async_trait]
pub trait TransportConnector: Send + Sync {
    async fn open(&self, credential: &str) -> Result<Box<dyn TransportLink>>;
}

#[async_trait]
pub trait TransportLink: Send {
    async fn send(&mut self, frame: OutboundFrame) -> Result<()>;
    /// Returns `None` once the link is closed by the peer.
    async fn recv(&mut self) -> Option<InboundFrame>;
}

/// Owns the single connection to the messaging backend for the lifetime of
/// the messaging view. Subscriptions made while the link is down are recorded
/// as intent and materialized on the next successful connect; after a
/// mid-session drop every desired topic is restored before `Connected` is
/// announced. Transport failures never surface as errors to callers, only as
/// state transitions on the event stream.
pub struct TransportSession {
    connector: Arc<dyn TransportConnector>,
    inner: Mutex<SessionInner>,
    events: broadcast::Sender<TransportEvent>,
}

struct SessionInner {
    state: ConnectionState,
    /// Bumped by every connect() and disconnect(); a supervisor spawned under
    /// an older generation must not touch session state.
    generation: u64,
    next_handle: u64,
    topics: HashMap<SubscriptionHandle, String>,
    link_tx: Option<mpsc::UnboundedSender<OutboundFrame>>,
    supervisor: Option<JoinHandle<()>>,
}

impl TransportSession {
    pub fn new(connector: Arc<dyn TransportConnector>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            connector,
            inner: Mutex::new(SessionInner {
                state: ConnectionState::Disconnected,
                generation: 0,
                next_handle: 0,
                topics: HashMap::new(),
                link_tx: None,
                supervisor: None,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<TransportEvent> {
        self.events.subscribe()
    }

    pub async fn state(&self) -> ConnectionState {
        self.inner.lock().await.state
    }

    /// Idempotent: a session that is already connecting, connected, or
    /// retrying keeps doing so. The credential is attached once per physical
    /// connect, not per subscription.
    pub async fn connect(self: &Arc<Self>, credential: &str) {
        {
            let mut guard = self.inner.lock().await;
            if guard.state != ConnectionState::Disconnected {
                return;
            }
            guard.state = ConnectionState::Connecting;
            guard.generation += 1;
            let generation = guard.generation;
            let _ = self
                .events
                .send(TransportEvent::StateChanged(ConnectionState::Connecting));
            let session = Arc::clone(self);
            let credential = credential.to_string();
            // Spawned and registered under the lock, so a concurrent
            // disconnect() always finds the handle to abort.
            guard.supervisor = Some(tokio::spawn(async move {
                session.run_supervisor(credential, generation).await;
            }));
        }
    }

    /// Tears the connection down and cancels any pending retry. Idempotent.
    pub async fn disconnect(&self) {
        let supervisor = {
            let mut guard = self.inner.lock().await;
            if guard.state == ConnectionState::Disconnected {
                return;
            }
            guard.state = ConnectionState::Disconnected;
            guard.generation += 1;
            guard.link_tx = None;
            guard.supervisor.take()
        };
        if let Some(task) = supervisor {
            task.abort();
        }
        let _ = self
            .events
            .send(TransportEvent::StateChanged(ConnectionState::Disconnected));
    }

    /// Records the topic as desired and returns a handle for it. If the link
    /// is live the subscribe frame goes out immediately; otherwise it is sent
    /// when the connection (re)establishes.
    pub async fn subscribe(&self, topic: impl Into<String>) -> SubscriptionHandle {
        let topic = topic.into();
        let mut guard = self.inner.lock().await;
        guard.next_handle += 1;
        let handle = SubscriptionHandle(guard.next_handle);
        let already_wanted = guard.topics.values().any(|t| *t == topic);
        guard.topics.insert(handle, topic.clone());
        if !already_wanted {
            if let Some(tx) = &guard.link_tx {
                let _ = tx.send(OutboundFrame::Subscribe { topic });
            }
        }
        handle
    }

    pub async fn unsubscribe(&self, handle: SubscriptionHandle) {
        let mut guard = self.inner.lock().await;
        let Some(topic) = guard.topics.remove(&handle) else {
            return;
        };
        let still_wanted = guard.topics.values().any(|t| *t == topic);
        if !still_wanted {
            if let Some(tx) = &guard.link_tx {
                let _ = tx.send(OutboundFrame::Unsubscribe { topic });
            }
        }
    }

    /// Hands the payload to the live link. A payload accepted here is only
    /// queued; nothing is assumed delivered if the link drops afterwards.
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: String,
    ) -> Result<(), TransportError> {
        let guard = self.inner.lock().await;
        if guard.state != ConnectionState::Connected {
            return Err(TransportError::NotConnected);
        }
        let Some(tx) = &guard.link_tx else {
            return Err(TransportError::NotConnected);
        };
        tx.send(OutboundFrame::Publish {
            topic: topic.into(),
            payload,
        })
        .map_err(|_| TransportError::NotConnected)
    }

    async fn run_supervisor(self: Arc<Self>, credential: String, generation: u64) {
        loop {
            match self.connector.open(&credential).await {
                Ok(link) => {
                    if let Err(err) = self.run_link(link, generation).await {
                        warn!(error = %err, "transport link lost");
                    }
                }
                Err(err) => {
                    warn!(error = %err, "transport connect failed");
                }
            }

            {
                let mut guard = self.inner.lock().await;
                if guard.generation != generation {
                    return;
                }
                guard.link_tx = None;
                guard.state = ConnectionState::Reconnecting;
            }
            let _ = self
                .events
                .send(TransportEvent::StateChanged(ConnectionState::Reconnecting));
            tokio::time::sleep(RECONNECT_BACKOFF).await;
        }
    }

    async fn run_link(&self, mut link: Box<dyn TransportLink>, generation: u64) -> Result<()> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let topics: Vec<String> = {
            let mut guard = self.inner.lock().await;
            if guard.generation != generation {
                // disconnect() raced the open; this link belongs to a dead
                // session and must not resurrect it.
                return Ok(());
            }
            guard.link_tx = Some(tx);
            guard.state = ConnectionState::Connected;
            let mut topics: Vec<String> = guard.topics.values().cloned().collect();
            topics.sort();
            topics.dedup();
            topics
        };

        // Restore every desired topic before announcing the connection, so a
        // listener that reconciles on Connected sees a consistent registry.
        for topic in topics {
            link.send(OutboundFrame::Subscribe { topic }).await?;
        }
        info!("transport connected");
        let _ = self
            .events
            .send(TransportEvent::StateChanged(ConnectionState::Connected));

        let mut heartbeat = interval(HEARTBEAT_INTERVAL);
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.tick().await;
        let mut last_inbound = Instant::now();

        loop {
            tokio::select! {
                command = rx.recv() => {
                    let Some(frame) = command else {
                        return Ok(());
                    };
                    link.send(frame).await?;
                }
                inbound = link.recv() => {
                    let Some(frame) = inbound else {
                        return Err(anyhow!("link closed by peer"));
                    };
                    last_inbound = Instant::now();
                    match frame {
                        InboundFrame::Message { topic, payload } => {
                            let _ = self.events.send(TransportEvent::Frame { topic, payload });
                        }
                        InboundFrame::SubscribeRejected { topic, reason } => {
                            warn!(topic = %topic, reason = %reason, "subscription rejected by server");
                            let _ = self
                                .events
                                .send(TransportEvent::SubscribeRejected { topic, reason });
                        }
                        InboundFrame::Pong => {}
                    }
                }
                _ = heartbeat.tick() => {
                    if last_inbound.elapsed() > HEARTBEAT_INTERVAL * 2 {
                        return Err(anyhow!("heartbeat timed out"));
                    }
                    link.send(OutboundFrame::Ping).await?;
                }
            }
        }
    }
}

/// WebSocket connector for the real backend; speaks JSON
/// [`ClientFrame`]/[`ServerFrame`] over a `/sync` endpoint with the
/// credential supplied as a query parameter at connect time.
pub struct WsConnector {
    endpoint: Url,
}

impl WsConnector {
    pub fn new(server_url: &str) -> Result<Self> {
        let ws_url = if let Some(rest) = server_url.strip_prefix("https://") {
            format!("wss://{rest}")
        } else if let Some(rest) = server_url.strip_prefix("http://") {
            format!("ws://{rest}")
        } else {
            return Err(anyhow!("server_url must start with http:// or https://"));
        };
        let endpoint = Url::parse(&format!("{}/sync", ws_url.trim_end_matches('/')))
            .with_context(|| format!("invalid server url: {server_url}"))?;
        Ok(Self { endpoint })
    }
}

#[async_trait]
impl TransportConnector for WsConnector {
    async fn open(&self, credential: &str) -> Result<Box<dyn TransportLink>> {
        let mut url = self.endpoint.clone();
        url.query_pairs_mut().clear().append_pair("token", credential);
        let (stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("failed to connect websocket: {}", self.endpoint))?;
        Ok(Box::new(WsLink { stream }))
    }
}

struct WsLink {
    stream: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl WsLink {
    fn encode(frame: OutboundFrame) -> ClientFrame {
        match frame {
            OutboundFrame::Subscribe { topic } => ClientFrame::Subscribe { topic },
            OutboundFrame::Unsubscribe { topic } => ClientFrame::Unsubscribe { topic },
            OutboundFrame::Publish { topic, payload } => ClientFrame::Publish { topic, payload },
            OutboundFrame::Ping => ClientFrame::Ping,
        }
    }
}

#[async_trait]
impl TransportLink for WsLink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<()> {
        let text = serde_json::to_string(&Self::encode(frame))?;
        self.stream
            .send(WsMessage::Text(text))
            .await
            .context("websocket send failed")
    }

    async fn recv(&mut self) -> Option<InboundFrame> {
        loop {
            match self.stream.next().await? {
                Ok(WsMessage::Text(text)) => match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::MessageDelivered { topic, payload }) => {
                        return Some(InboundFrame::Message { topic, payload });
                    }
                    Ok(ServerFrame::SubscribeRejected { topic, error }) => {
                        return Some(InboundFrame::SubscribeRejected {
                            topic,
                            reason: error.to_string(),
                        });
                    }
                    Ok(ServerFrame::Pong) => return Some(InboundFrame::Pong),
                    Err(err) => {
                        warn!(error = %err, "invalid server frame; skipping");
                    }
                },
                Ok(WsMessage::Close(_)) => return None,
                Ok(_) => {}
                Err(err) => {
                    warn!(error = %err, "websocket receive failed");
                    return None;
                }
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/transport_tests.rs"]
mod tests;
