//! Shared test doubles: an in-memory transport connector and a stub backend.

use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicBool, AtomicI64, AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use shared::{
    domain::{GroupId, MessageId, MessageKind, UserId},
    protocol::{GroupSummary, MessagePayload},
};
use tokio::sync::mpsc;

use crate::{
    transport::{InboundFrame, OutboundFrame, TransportConnector, TransportLink},
    SendMessageRequest, SyncBackend,
};

/// Connector whose links are driven entirely by the test: outbound frames are
/// recorded, inbound frames are injected, and dropping the injection side
/// closes the link as a peer disconnect would.
pub(crate) struct MockConnector {
    pub sent: Arc<Mutex<Vec<OutboundFrame>>>,
    pub connects: Arc<AtomicUsize>,
    pub fail_connect: Arc<AtomicBool>,
    inbound: Arc<Mutex<Option<mpsc::UnboundedSender<InboundFrame>>>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sent: Arc::new(Mutex::new(Vec::new())),
            connects: Arc::new(AtomicUsize::new(0)),
            fail_connect: Arc::new(AtomicBool::new(false)),
            inbound: Arc::new(Mutex::new(None)),
        })
    }

    pub fn sent_frames(&self) -> Vec<OutboundFrame> {
        self.sent.lock().unwrap().clone()
    }

    pub fn clear_sent(&self) {
        self.sent.lock().unwrap().clear();
    }

    pub fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Delivers a frame on the currently open link.
    pub fn push_inbound(&self, frame: InboundFrame) {
        let guard = self.inbound.lock().unwrap();
        let tx = guard.as_ref().expect("no open link");
        tx.send(frame).expect("link receiver dropped");
    }

    /// Simulates the server dropping the connection.
    pub fn drop_link(&self) {
        self.inbound.lock().unwrap().take();
    }
}

#[async_trait]
impl TransportConnector for MockConnector {
    async fn open(&self, _credential: &str) -> Result<Box<dyn TransportLink>> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(anyhow!("connection refused"));
        }
        let (tx, rx) = mpsc::unbounded_channel();
        *self.inbound.lock().unwrap() = Some(tx);
        Ok(Box::new(MockLink {
            sent: Arc::clone(&self.sent),
            rx,
        }))
    }
}

struct MockLink {
    sent: Arc<Mutex<Vec<OutboundFrame>>>,
    rx: mpsc::UnboundedReceiver<InboundFrame>,
}

#[async_trait]
impl TransportLink for MockLink {
    async fn send(&mut self, frame: OutboundFrame) -> Result<()> {
        self.sent.lock().unwrap().push(frame);
        Ok(())
    }

    async fn recv(&mut self) -> Option<InboundFrame> {
        self.rx.recv().await
    }
}

/// In-memory [`SyncBackend`] with per-test failure switches.
pub(crate) struct StubBackend {
    pub groups: Mutex<Vec<GroupSummary>>,
    pub histories: Mutex<HashMap<GroupId, Vec<MessagePayload>>>,
    pub fail_history: AtomicBool,
    pub fail_send: AtomicBool,
    next_message_id: AtomicI64,
}

impl StubBackend {
    pub fn new(groups: Vec<(i64, &str)>) -> Arc<Self> {
        Arc::new(Self {
            groups: Mutex::new(
                groups
                    .into_iter()
                    .map(|(id, name)| GroupSummary {
                        group_id: GroupId(id),
                        name: name.to_string(),
                    })
                    .collect(),
            ),
            histories: Mutex::new(HashMap::new()),
            fail_history: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            next_message_id: AtomicI64::new(1000),
        })
    }

    pub fn set_history(&self, group_id: GroupId, messages: Vec<MessagePayload>) {
        self.histories.lock().unwrap().insert(group_id, messages);
    }
}

#[async_trait]
impl SyncBackend for StubBackend {
    async fn fetch_my_groups(&self, _user_id: UserId) -> Result<Vec<GroupSummary>> {
        Ok(self.groups.lock().unwrap().clone())
    }

    async fn fetch_group_messages(
        &self,
        _user_id: UserId,
        group_id: GroupId,
    ) -> Result<Vec<MessagePayload>> {
        if self.fail_history.load(Ordering::SeqCst) {
            return Err(anyhow!("history unavailable"));
        }
        Ok(self
            .histories
            .lock()
            .unwrap()
            .get(&group_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn send_message(&self, request: SendMessageRequest) -> Result<MessagePayload> {
        if self.fail_send.load(Ordering::SeqCst) {
            return Err(anyhow!("message rejected"));
        }
        let id = self.next_message_id.fetch_add(1, Ordering::SeqCst);
        let message = MessagePayload {
            message_id: MessageId(id),
            group_id: request.group_id,
            sender_id: request.sender_id,
            sender_name: None,
            kind: MessageKind::Text,
            content: request.content,
            attachment: request.attachment,
            event: None,
            sent_at: Utc::now(),
        };
        self.histories
            .lock()
            .unwrap()
            .entry(request.group_id)
            .or_default()
            .push(message.clone());
        Ok(message)
    }
}

pub(crate) fn at(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).single().unwrap()
}

pub(crate) fn message(id: i64, group: i64, sender: i64, content: &str, secs: i64) -> MessagePayload {
    MessagePayload {
        message_id: MessageId(id),
        group_id: GroupId(group),
        sender_id: UserId(sender),
        sender_name: Some(format!("user-{sender}")),
        kind: MessageKind::Text,
        content: content.to_string(),
        attachment: None,
        event: None,
        sent_at: at(secs),
    }
}
