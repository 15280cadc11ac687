use std::collections::HashSet;

use shared::{
    domain::{GroupId, MessageId},
    protocol::MessagePayload,
};
use tracing::debug;

/// Snapshot of the open conversation for rendering. `loading` is true while
/// the history fetch for the current epoch is still outstanding.
#[derive(Debug, Clone, PartialEq)]
pub struct ConversationSnapshot {
    pub group_id: GroupId,
    pub loading: bool,
    pub messages: Vec<MessagePayload>,
}

/// Owns the single materialized transcript buffer: exactly one group's
/// ordered message log, for the group currently open in the UI.
///
/// Every `open` bumps an epoch counter; a history fetch result carries the
/// epoch it was started under and is discarded if the user has navigated away
/// since. Live messages that arrive while history is loading are buffered and
/// merged by id once the transcript lands, so the fetch/push race can never
/// drop or duplicate a message.
#[derive(Debug, Default)]
pub struct ConversationStore {
    epoch: u64,
    open: Option<OpenConversation>,
}

#[derive(Debug)]
struct OpenConversation {
    group_id: GroupId,
    epoch: u64,
    history_loaded: bool,
    messages: Vec<MessagePayload>,
}

impl ConversationStore {
    /// Discards any existing buffer and installs an empty one for `group_id`.
    /// Returns the epoch the caller must present when installing history.
    pub fn open(&mut self, group_id: GroupId) -> u64 {
        self.epoch += 1;
        self.open = Some(OpenConversation {
            group_id,
            epoch: self.epoch,
            history_loaded: false,
            messages: Vec::new(),
        });
        self.epoch
    }

    /// Closing counts as navigation: the epoch advances so outstanding
    /// history fetches for the closed buffer resolve as stale.
    pub fn close(&mut self) {
        self.epoch += 1;
        self.open = None;
    }

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn open_group(&self) -> Option<GroupId> {
        self.open.as_ref().map(|open| open.group_id)
    }

    pub fn snapshot(&self) -> Option<ConversationSnapshot> {
        self.open.as_ref().map(|open| ConversationSnapshot {
            group_id: open.group_id,
            loading: !open.history_loaded,
            messages: open.messages.clone(),
        })
    }

    /// Appends in arrival order unless a message with the same id is already
    /// present. Returns whether the message was added.
    pub fn append(&mut self, message: MessagePayload) -> bool {
        let Some(open) = self.open.as_mut() else {
            return false;
        };
        if open.group_id != message.group_id {
            return false;
        }
        if contains(&open.messages, message.message_id) {
            return false;
        }
        open.messages.push(message);
        true
    }

    /// Installs a finished history fetch. A stale epoch means the user opened
    /// another group (or closed the view) while the fetch was in flight; the
    /// result is discarded and `false` returned. Messages ingested live
    /// during the load are re-appended after the transcript, skipping ids the
    /// transcript already covers.
    pub fn install_history(&mut self, epoch: u64, history: Vec<MessagePayload>) -> bool {
        let Some(open) = self.open.as_mut() else {
            debug!(epoch, "history resolved with no open conversation");
            return false;
        };
        if open.epoch != epoch {
            debug!(
                epoch,
                current_epoch = open.epoch,
                "discarding stale history result"
            );
            return false;
        }

        let live = std::mem::take(&mut open.messages);
        let mut seen: HashSet<MessageId> = HashSet::new();
        let mut merged: Vec<MessagePayload> = Vec::with_capacity(history.len() + live.len());
        for message in history.into_iter().chain(live) {
            if seen.insert(message.message_id) {
                merged.push(message);
            }
        }
        open.messages = merged;
        open.history_loaded = true;
        true
    }
}

fn contains(messages: &[MessagePayload], id: MessageId) -> bool {
    messages.iter().any(|message| message.message_id == id)
}
