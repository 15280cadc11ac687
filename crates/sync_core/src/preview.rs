use std::{cmp::Ordering, collections::HashSet};

use chrono::{DateTime, Utc};
use shared::{
    domain::{GroupId, UserId},
    protocol::MessagePayload,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastMessagePreview {
    pub content: String,
    pub sender_name: String,
    pub sent_at: DateTime<Utc>,
    pub is_own: bool,
}

/// Sidebar summary for one group the user belongs to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatPreview {
    pub group_id: GroupId,
    pub name: String,
    pub last_message: Option<LastMessagePreview>,
    pub unread_count: u32,
}

/// The sorted group-list projection: one [`ChatPreview`] per membership
/// group, kept ordered by most recent activity. Sorting is stable so groups
/// untouched since the last pass keep their relative order; groups with no
/// message yet sort last.
#[derive(Debug, Default)]
pub struct PreviewAggregator {
    entries: Vec<ChatPreview>,
}

impl PreviewAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs the initial preview for a membership group from its most
    /// recent transcript entry, if any. Re-seeding an existing entry only
    /// refreshes the group name; unread state is preserved.
    pub fn seed(
        &mut self,
        group_id: GroupId,
        name: String,
        last: Option<&MessagePayload>,
        current_user: UserId,
    ) {
        match self.entries.iter_mut().find(|p| p.group_id == group_id) {
            Some(entry) => {
                entry.name = name;
                if entry.last_message.is_none() {
                    entry.last_message = last.map(|message| project(message, current_user));
                }
            }
            None => {
                self.entries.push(ChatPreview {
                    group_id,
                    name,
                    last_message: last.map(|message| project(message, current_user)),
                    unread_count: 0,
                });
            }
        }
        self.resort();
    }

    pub fn contains(&self, group_id: GroupId) -> bool {
        self.entries.iter().any(|p| p.group_id == group_id)
    }

    /// Drops previews for groups no longer in the membership set.
    pub fn retain_groups(&mut self, desired: &HashSet<GroupId>) {
        self.entries.retain(|p| desired.contains(&p.group_id));
    }

    /// Applies one ingested message: updates the last-message projection,
    /// bumps the unread count when the message targets a background group and
    /// was not authored by the current user, then re-sorts.
    pub fn apply(
        &mut self,
        message: &MessagePayload,
        open_group: Option<GroupId>,
        current_user: UserId,
    ) {
        let projection = project(message, current_user);
        let counts_as_unread =
            open_group != Some(message.group_id) && message.sender_id != current_user;

        match self
            .entries
            .iter_mut()
            .find(|p| p.group_id == message.group_id)
        {
            Some(entry) => {
                entry.last_message = Some(projection);
                if counts_as_unread {
                    entry.unread_count += 1;
                }
            }
            None => {
                // A push can beat the membership refresh that introduces the
                // group; the name arrives with the next seed.
                self.entries.push(ChatPreview {
                    group_id: message.group_id,
                    name: String::new(),
                    last_message: Some(projection),
                    unread_count: u32::from(counts_as_unread),
                });
            }
        }
        self.resort();
    }

    /// Clears the unread counter the moment a group becomes the open group.
    pub fn mark_opened(&mut self, group_id: GroupId) -> bool {
        match self.entries.iter_mut().find(|p| p.group_id == group_id) {
            Some(entry) if entry.unread_count != 0 => {
                entry.unread_count = 0;
                true
            }
            _ => false,
        }
    }

    pub fn snapshot(&self) -> Vec<ChatPreview> {
        self.entries.clone()
    }

    fn resort(&mut self) {
        // sort_by is stable: ties keep their existing relative order.
        self.entries.sort_by(|a, b| {
            match (&a.last_message, &b.last_message) {
                (Some(a), Some(b)) => b.sent_at.cmp(&a.sent_at),
                (Some(_), None) => Ordering::Less,
                (None, Some(_)) => Ordering::Greater,
                (None, None) => Ordering::Equal,
            }
        });
    }
}

fn project(message: &MessagePayload, current_user: UserId) -> LastMessagePreview {
    LastMessagePreview {
        content: message.content.clone(),
        sender_name: message
            .sender_name
            .clone()
            .unwrap_or_else(|| format!("user:{}", message.sender_id.0)),
        sent_at: message.sent_at,
        is_own: message.sender_id == current_user,
    }
}
