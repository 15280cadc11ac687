use std::{collections::HashSet, sync::Arc};

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use shared::{
    domain::{GroupId, UserId},
    protocol::{AttachmentRef, GroupSummary, MessagePayload},
};
use tokio::{
    sync::{broadcast, Mutex},
    task::JoinHandle,
};
use tracing::{info, warn};

pub mod conversation;
pub mod error;
pub mod ingest;
pub mod preview;
pub mod registry;
pub mod transport;

pub use conversation::ConversationSnapshot;
pub use error::{SendError, TransportError};
pub use ingest::IngestOutcome;
pub use preview::{ChatPreview, LastMessagePreview};
pub use transport::{ConnectionState, TransportConnector, TransportSession, WsConnector};

use ingest::MessageIngestEngine;
use registry::{group_for_topic, SubscriptionRegistry};
use transport::TransportEvent;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The REST boundary this layer consumes: membership, transcript history,
/// and the send call whose return value is ingested like a pushed message.
#[async_trait]
pub trait SyncBackend: Send + Sync {
    async fn fetch_my_groups(&self, user_id: UserId) -> Result<Vec<GroupSummary>>;
    /// Returns the existing transcript in arrival order, oldest first.
    async fn fetch_group_messages(
        &self,
        user_id: UserId,
        group_id: GroupId,
    ) -> Result<Vec<MessagePayload>>;
    async fn send_message(&self, request: SendMessageRequest) -> Result<MessagePayload>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SendMessageRequest {
    pub sender_id: UserId,
    pub group_id: GroupId,
    pub content: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub attachment: Option<AttachmentRef>,
}

pub struct HttpSyncBackend {
    http: Client,
    server_url: String,
}

impl HttpSyncBackend {
    pub fn new(server_url: impl Into<String>) -> Self {
        Self {
            http: Client::new(),
            server_url: server_url.into(),
        }
    }
}

#[async_trait]
impl SyncBackend for HttpSyncBackend {
    async fn fetch_my_groups(&self, user_id: UserId) -> Result<Vec<GroupSummary>> {
        let groups = self
            .http
            .get(format!("{}/groups", self.server_url))
            .query(&[("user_id", user_id.0)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid group list response")?;
        Ok(groups)
    }

    async fn fetch_group_messages(
        &self,
        user_id: UserId,
        group_id: GroupId,
    ) -> Result<Vec<MessagePayload>> {
        let messages = self
            .http
            .get(format!(
                "{}/groups/{}/messages",
                self.server_url, group_id.0
            ))
            .query(&[("user_id", user_id.0)])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid transcript response")?;
        Ok(messages)
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<MessagePayload> {
        let message = self
            .http
            .post(format!("{}/messages", self.server_url))
            .json(&request)
            .send()
            .await?
            .error_for_status()?
            .json()
            .await
            .context("invalid send response")?;
        Ok(message)
    }
}

/// Everything the UI layer can observe about the sync state.
#[derive(Debug, Clone)]
pub enum SyncEvent {
    ConnectionChanged(ConnectionState),
    PreviewsChanged(Vec<ChatPreview>),
    ConversationChanged {
        group_id: GroupId,
        messages: Vec<MessagePayload>,
    },
    ConversationLoadFailed {
        group_id: GroupId,
        reason: String,
    },
    SendFailed {
        group_id: GroupId,
        reason: String,
    },
    Error(String),
}

/// Facade over the whole synchronization layer: one transport session, the
/// subscription registry reconciled against group membership, and the ingest
/// funnel feeding the conversation buffer and preview list. Owned by the
/// messaging view for its lifetime; `start` on mount, `shutdown` on unmount.
pub struct GroupSyncClient {
    backend: Arc<dyn SyncBackend>,
    transport: Arc<TransportSession>,
    inner: Mutex<ClientInner>,
    events: broadcast::Sender<SyncEvent>,
}

struct ClientInner {
    user_id: Option<UserId>,
    registry: SubscriptionRegistry,
    engine: Option<MessageIngestEngine>,
    pump: Option<JoinHandle<()>>,
}

impl GroupSyncClient {
    pub fn new(backend: Arc<dyn SyncBackend>, connector: Arc<dyn TransportConnector>) -> Arc<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Arc::new(Self {
            backend,
            transport: TransportSession::new(connector),
            inner: Mutex::new(ClientInner {
                user_id: None,
                registry: SubscriptionRegistry::new(),
                engine: None,
                pump: None,
            }),
            events,
        })
    }

    pub fn subscribe_events(&self) -> broadcast::Receiver<SyncEvent> {
        self.events.subscribe()
    }

    pub async fn connection_state(&self) -> ConnectionState {
        self.transport.state().await
    }

    /// Fetches membership, seeds one preview per group from its transcript,
    /// then brings the push transport up and reconciles subscriptions. The
    /// event pump starts before the connect so no state transition is missed.
    pub async fn start(self: &Arc<Self>, user_id: UserId, credential: &str) -> Result<()> {
        {
            let mut guard = self.inner.lock().await;
            if guard.user_id.is_some() {
                return Err(anyhow!("sync client already started"));
            }
            guard.user_id = Some(user_id);
            guard.engine = Some(MessageIngestEngine::new(user_id));
        }

        let groups = match self.backend.fetch_my_groups(user_id).await {
            Ok(groups) => groups,
            Err(err) => {
                // Leave the client restartable after a failed initial load.
                let mut guard = self.inner.lock().await;
                guard.user_id = None;
                guard.engine = None;
                return Err(err).context("failed to fetch group membership");
            }
        };
        info!(groups = groups.len(), "starting group sync");

        for group in &groups {
            let last = match self
                .backend
                .fetch_group_messages(user_id, group.group_id)
                .await
            {
                Ok(history) => history.into_iter().last(),
                Err(err) => {
                    warn!(
                        group_id = group.group_id.0,
                        error = %err,
                        "history seed failed; preview starts empty"
                    );
                    None
                }
            };
            let mut guard = self.inner.lock().await;
            if let Some(engine) = guard.engine.as_mut() {
                engine.seed_preview(group.group_id, group.name.clone(), last.as_ref());
            }
        }
        self.emit_previews().await;

        let pump = {
            let client = Arc::clone(self);
            let transport_events = self.transport.subscribe_events();
            tokio::spawn(async move { client.run_pump(transport_events).await })
        };

        {
            let mut guard = self.inner.lock().await;
            guard.pump = Some(pump);
            guard
                .registry
                .set_desired(groups.iter().map(|group| group.group_id));
            guard.registry.reconcile_now(&self.transport).await;
        }

        self.transport.connect(credential).await;
        Ok(())
    }

    /// Re-fetches the membership set and reconciles subscriptions and
    /// previews against it. Safe to call from any event that suggests the
    /// membership might have changed.
    pub async fn refresh_membership(&self) -> Result<()> {
        let user_id = self
            .inner
            .lock()
            .await
            .user_id
            .ok_or_else(|| anyhow!("sync client not started"))?;
        let groups = self
            .backend
            .fetch_my_groups(user_id)
            .await
            .context("failed to fetch group membership")?;
        let desired: HashSet<GroupId> = groups.iter().map(|group| group.group_id).collect();

        // Seed previews for newly joined groups without holding the state
        // lock across the history fetches.
        let mut seeds = Vec::new();
        for group in &groups {
            let known = {
                let guard = self.inner.lock().await;
                guard
                    .engine
                    .as_ref()
                    .is_some_and(|engine| engine.has_preview(group.group_id))
            };
            if known {
                continue;
            }
            let last = self
                .backend
                .fetch_group_messages(user_id, group.group_id)
                .await
                .map(|history| history.into_iter().last())
                .unwrap_or_default();
            seeds.push((group.clone(), last));
        }

        {
            let mut guard = self.inner.lock().await;
            if let Some(engine) = guard.engine.as_mut() {
                for (group, last) in seeds {
                    engine.seed_preview(group.group_id, group.name, last.as_ref());
                }
                for group in &groups {
                    if engine.has_preview(group.group_id) {
                        engine.seed_preview(group.group_id, group.name.clone(), None);
                    }
                }
                engine.retain_groups(&desired);
            }
            guard.registry.set_desired(desired.iter().copied());
            guard.registry.reconcile_now(&self.transport).await;
        }
        self.emit_previews().await;
        Ok(())
    }

    /// Makes `group_id` the open conversation: resets its unread counter,
    /// installs a fresh buffer, and loads the transcript in the background.
    /// A result that arrives after the user has moved on is discarded via the
    /// buffer epoch, never merged into the wrong buffer.
    pub async fn open_conversation(self: &Arc<Self>, group_id: GroupId) -> Result<()> {
        let (user_id, epoch) = {
            let mut guard = self.inner.lock().await;
            let user_id = guard
                .user_id
                .ok_or_else(|| anyhow!("sync client not started"))?;
            let engine = guard
                .engine
                .as_mut()
                .ok_or_else(|| anyhow!("sync client not started"))?;
            (user_id, engine.open_conversation(group_id))
        };
        self.emit_previews().await;

        let client = Arc::clone(self);
        tokio::spawn(async move {
            match client.backend.fetch_group_messages(user_id, group_id).await {
                Ok(history) => {
                    let snapshot = {
                        let mut guard = client.inner.lock().await;
                        guard.engine.as_mut().and_then(|engine| {
                            engine
                                .install_history(epoch, history)
                                .then(|| engine.conversation_snapshot())
                                .flatten()
                        })
                    };
                    if let Some(snapshot) = snapshot {
                        let _ = client.events.send(SyncEvent::ConversationChanged {
                            group_id: snapshot.group_id,
                            messages: snapshot.messages,
                        });
                    }
                }
                Err(err) => {
                    let still_open = {
                        let guard = client.inner.lock().await;
                        guard
                            .engine
                            .as_ref()
                            .is_some_and(|engine| engine.epoch() == epoch)
                    };
                    // A failure for a conversation the user already left is
                    // not worth surfacing.
                    if still_open {
                        warn!(group_id = group_id.0, error = %err, "history fetch failed");
                        let _ = client.events.send(SyncEvent::ConversationLoadFailed {
                            group_id,
                            reason: err.to_string(),
                        });
                    }
                }
            }
        });
        Ok(())
    }

    pub async fn close_conversation(&self) {
        let mut guard = self.inner.lock().await;
        if let Some(engine) = guard.engine.as_mut() {
            engine.close_conversation();
        }
    }

    /// Sends through the REST boundary and feeds the returned message into
    /// the same ingest funnel as pushed ones; the id-based de-dup absorbs the
    /// push echo whichever side arrives first. A rejected send is surfaced on
    /// this message only and never ingested.
    pub async fn send_and_ingest(
        self: &Arc<Self>,
        group_id: GroupId,
        content: &str,
        attachment: Option<AttachmentRef>,
    ) -> Result<MessagePayload, SendError> {
        let sender_id = self
            .inner
            .lock()
            .await
            .user_id
            .ok_or(SendError::NotStarted)?;
        let request = SendMessageRequest {
            sender_id,
            group_id,
            content: content.to_string(),
            attachment,
        };
        match self.backend.send_message(request).await {
            Ok(message) => {
                self.ingest(message.clone()).await;
                Ok(message)
            }
            Err(err) => {
                let reason = err.to_string();
                warn!(group_id = group_id.0, error = %reason, "send failed");
                let _ = self.events.send(SyncEvent::SendFailed {
                    group_id,
                    reason: reason.clone(),
                });
                Err(SendError::Backend(reason))
            }
        }
    }

    pub async fn previews(&self) -> Vec<ChatPreview> {
        let guard = self.inner.lock().await;
        guard
            .engine
            .as_ref()
            .map(|engine| engine.previews_snapshot())
            .unwrap_or_default()
    }

    pub async fn conversation(&self) -> Option<ConversationSnapshot> {
        let guard = self.inner.lock().await;
        guard
            .engine
            .as_ref()
            .and_then(|engine| engine.conversation_snapshot())
    }

    /// Stops the event pump and tears the transport down. The client cannot
    /// be restarted afterwards; the messaging view constructs a fresh one.
    pub async fn shutdown(&self) {
        let pump = {
            let mut guard = self.inner.lock().await;
            guard.pump.take()
        };
        if let Some(task) = pump {
            task.abort();
        }
        self.transport.disconnect().await;
        // The pump is gone, so announce the final state ourselves.
        let _ = self
            .events
            .send(SyncEvent::ConnectionChanged(ConnectionState::Disconnected));
    }

    async fn ingest(&self, message: MessagePayload) {
        let (conversation, previews) = {
            let mut guard = self.inner.lock().await;
            let Some(engine) = guard.engine.as_mut() else {
                return;
            };
            let outcome = engine.ingest(message);
            let conversation = if outcome.appended {
                engine.conversation_snapshot()
            } else {
                None
            };
            let previews = outcome
                .previews_changed
                .then(|| engine.previews_snapshot());
            (conversation, previews)
        };
        if let Some(snapshot) = conversation {
            let _ = self.events.send(SyncEvent::ConversationChanged {
                group_id: snapshot.group_id,
                messages: snapshot.messages,
            });
        }
        if let Some(previews) = previews {
            let _ = self.events.send(SyncEvent::PreviewsChanged(previews));
        }
    }

    async fn emit_previews(&self) {
        let previews = self.previews().await;
        let _ = self.events.send(SyncEvent::PreviewsChanged(previews));
    }

    /// Routes transport events into the ingest funnel. Runs until shutdown.
    /// Reconciliation re-runs on every Connected transition so a reconnect
    /// restores exactly the desired subscription set.
    async fn run_pump(self: Arc<Self>, mut events: broadcast::Receiver<TransportEvent>) {
        loop {
            match events.recv().await {
                Ok(TransportEvent::StateChanged(state)) => {
                    let _ = self.events.send(SyncEvent::ConnectionChanged(state));
                    if state == ConnectionState::Connected {
                        let mut guard = self.inner.lock().await;
                        guard.registry.reconcile_now(&self.transport).await;
                    }
                }
                Ok(TransportEvent::Frame { topic, payload }) => {
                    match serde_json::from_str::<MessagePayload>(&payload) {
                        Ok(message) => {
                            if group_for_topic(&topic) != Some(message.group_id) {
                                warn!(
                                    topic = %topic,
                                    group_id = message.group_id.0,
                                    "message group does not match its topic; dropping"
                                );
                                continue;
                            }
                            self.ingest(message).await;
                        }
                        Err(err) => {
                            let _ = self
                                .events
                                .send(SyncEvent::Error(format!("invalid message payload: {err}")));
                        }
                    }
                }
                Ok(TransportEvent::SubscribeRejected { topic, reason }) => {
                    if let Some(group_id) = group_for_topic(&topic) {
                        let mut guard = self.inner.lock().await;
                        guard.registry.mark_rejected(group_id);
                    }
                    let _ = self.events.send(SyncEvent::Error(format!(
                        "subscription rejected for {topic}: {reason}"
                    )));
                }
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "transport event stream lagged");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    }
}

#[cfg(test)]
#[path = "tests/support.rs"]
pub(crate) mod test_support;

#[cfg(test)]
#[path = "tests/lib_tests.rs"]
mod tests;
