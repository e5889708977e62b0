//! Ordered, de-duplicated message list.
//!
//! Holds the messages of a chat view oldest first. Messages from the history load and
//! from the live feed are merged by identity, so a message delivered twice, or seen by
//! both sources, appears once.

use std::collections::HashSet;

use super::types::Message;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageTimeline {
    messages: Vec<Message>,
    ids: HashSet<String>,
}

impl MessageTimeline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a timeline from a history page in any order.
    pub fn from_history(history: Vec<Message>) -> Self {
        let mut timeline = Self::new();
        for message in history {
            timeline.merge(message);
        }
        timeline
    }

    /// Adds `message` unless its id is already present. Returns whether it was added.
    ///
    /// Insertion keeps the list sorted by `created_at`; a message with the same
    /// timestamp as existing ones goes after them.
    pub fn merge(&mut self, message: Message) -> bool {
        if self.ids.contains(&message.id) {
            return false;
        }
        let position = self
            .messages
            .partition_point(|existing| existing.created_at <= message.created_at);
        self.ids.insert(message.id.clone());
        self.messages.insert(position, message);
        true
    }

    /// Replaces the contents with a fresh history page.
    ///
    /// Messages already held that are missing from the page but not older than its
    /// oldest entry arrived while the page was being fetched, so they are kept.
    pub fn replace_history(&mut self, history: Vec<Message>) {
        let mut refreshed = Self::from_history(history);
        let cutoff = refreshed.messages.first().map(|oldest| oldest.created_at);
        for message in self.messages.drain(..) {
            let keep = match cutoff {
                Some(cutoff) => message.created_at >= cutoff,
                None => true,
            };
            if keep {
                refreshed.merge(message);
            }
        }
        *self = refreshed;
    }

    pub fn remove(&mut self, id: &str) -> Option<Message> {
        if !self.ids.remove(id) {
            return None;
        }
        let position = self.messages.iter().position(|message| message.id == id)?;
        Some(self.messages.remove(position))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.ids.contains(id)
    }

    pub fn get(&self, id: &str) -> Option<&Message> {
        self.messages.iter().find(|message| message.id == id)
    }

    pub fn as_slice(&self) -> &[Message] {
        &self.messages
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Message> {
        self.messages.iter()
    }

    pub fn last(&self) -> Option<&Message> {
        self.messages.last()
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn to_vec(&self) -> Vec<Message> {
        self.messages.clone()
    }
}

impl<'a> IntoIterator for &'a MessageTimeline {
    type Item = &'a Message;
    type IntoIter = std::slice::Iter<'a, Message>;

    fn into_iter(self) -> Self::IntoIter {
        self.messages.iter()
    }
}
