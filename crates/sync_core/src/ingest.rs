use std::collections::HashSet;

use shared::{
    domain::{GroupId, UserId},
    protocol::MessagePayload,
};
use tracing::debug;

use crate::{
    conversation::{ConversationSnapshot, ConversationStore},
    preview::{ChatPreview, PreviewAggregator},
};

/// What one [`MessageIngestEngine::ingest`] call changed, so the caller knows
/// which listeners to notify.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IngestOutcome {
    pub appended: bool,
    pub previews_changed: bool,
}

/// The single funnel every inbound message passes through, whether it was
/// pushed on a subscription or returned from a send call. Owns the
/// conversation buffer and the preview collection outright; nothing else may
/// mutate them, which is what keeps the de-dup and ordering rules enforceable
/// in one place.
pub struct MessageIngestEngine {
    current_user: UserId,
    conversation: ConversationStore,
    previews: PreviewAggregator,
}

impl MessageIngestEngine {
    pub fn new(current_user: UserId) -> Self {
        Self {
            current_user,
            conversation: ConversationStore::default(),
            previews: PreviewAggregator::new(),
        }
    }

    /// Ingests one message exactly once.
    ///
    /// A duplicate id is only detectable against the materialized buffer:
    /// when the message targets the open group and the buffer already holds
    /// its id (the user's own send racing its push echo, in either order) the
    /// whole ingest is a no-op, so previews cannot double-count either.
    /// Otherwise the buffer append (open group only) preserves arrival order
    /// and the preview update runs unconditionally.
    pub fn ingest(&mut self, message: MessagePayload) -> IngestOutcome {
        let open_group = self.conversation.open_group();
        if open_group == Some(message.group_id) {
            if !self.conversation.append(message.clone()) {
                debug!(
                    message_id = message.message_id.0,
                    group_id = message.group_id.0,
                    "duplicate message dropped"
                );
                return IngestOutcome::default();
            }
            self.previews.apply(&message, open_group, self.current_user);
            IngestOutcome {
                appended: true,
                previews_changed: true,
            }
        } else {
            self.previews.apply(&message, open_group, self.current_user);
            IngestOutcome {
                appended: false,
                previews_changed: true,
            }
        }
    }

    /// Replaces the materialized buffer with a fresh one for `group_id` and
    /// clears its unread counter. Returns the buffer epoch for the history
    /// install.
    pub fn open_conversation(&mut self, group_id: GroupId) -> u64 {
        let epoch = self.conversation.open(group_id);
        self.previews.mark_opened(group_id);
        epoch
    }

    pub fn close_conversation(&mut self) {
        self.conversation.close();
    }

    pub fn install_history(&mut self, epoch: u64, history: Vec<MessagePayload>) -> bool {
        self.conversation.install_history(epoch, history)
    }

    pub fn epoch(&self) -> u64 {
        self.conversation.epoch()
    }

    pub fn open_group(&self) -> Option<GroupId> {
        self.conversation.open_group()
    }

    pub fn seed_preview(
        &mut self,
        group_id: GroupId,
        name: String,
        last: Option<&MessagePayload>,
    ) {
        self.previews.seed(group_id, name, last, self.current_user);
    }

    pub fn has_preview(&self, group_id: GroupId) -> bool {
        self.previews.contains(group_id)
    }

    /// Applies a membership shrink: departed groups lose their preview, and
    /// an open conversation for a departed group is closed.
    pub fn retain_groups(&mut self, desired: &HashSet<GroupId>) {
        self.previews.retain_groups(desired);
        if let Some(open) = self.conversation.open_group() {
            if !desired.contains(&open) {
                self.conversation.close();
            }
        }
    }

    pub fn conversation_snapshot(&self) -> Option<ConversationSnapshot> {
        self.conversation.snapshot()
    }

    pub fn previews_snapshot(&self) -> Vec<ChatPreview> {
        self.previews.snapshot()
    }
}

#[cfg(test)]
#[path = "tests/ingest_tests.rs"]
mod tests;
