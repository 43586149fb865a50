//! Message log with duplicate suppression.

use std::collections::HashSet;

use crate::protocol::ChatMessage;

/// Identity of a logged message for duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct MessageKey {
    pub id: u32,
    pub is_from_current_user: bool,
    pub timestamp: u64,
}

impl From<&ChatMessage> for MessageKey {
    fn from(m: &ChatMessage) -> Self {
        Self {
            id: m.id,
            is_from_current_user: m.is_from_current_user,
            timestamp: m.timestamp,
        }
    }
}

/// Ordered, in-memory conversation log. Not persisted.
#[derive(Debug, Default)]
pub struct MessageLog {
    entries: Vec<ChatMessage>,
    keys: HashSet<MessageKey>,
    authored: HashSet<(u32, bool)>,
}

impl MessageLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a message received from the peer. Returns false (and appends
    /// nothing) when an entry with the same key is already present.
    pub fn append_inbound(&mut self, message: ChatMessage) -> bool {
        let key = MessageKey::from(&message);
        if !self.keys.insert(key) {
            return false;
        }
        self.authored.insert((message.id, message.is_from_current_user));
        self.entries.push(message);
        true
    }

    /// Append a message this side sent. Guarded only against re-adding the
    /// same `(id, is_from_current_user)` pair.
    pub fn append_outbound(&mut self, message: ChatMessage) -> bool {
        if !self.authored.insert((message.id, message.is_from_current_user)) {
            return false;
        }
        self.keys.insert(MessageKey::from(&message));
        self.entries.push(message);
        true
    }

    pub fn entries(&self) -> &[ChatMessage] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ChatMessage;

    fn inbound(id: u32, timestamp: u64) -> ChatMessage {
        let mut m = ChatMessage::text(id, "hi", timestamp);
        m.is_from_current_user = false;
        m
    }

    #[test]
    fn second_identical_inbound_is_suppressed() {
        let mut log = MessageLog::new();
        assert!(log.append_inbound(inbound(1, 100)));
        assert!(!log.append_inbound(inbound(1, 100)));
        assert_eq!(log.len(), 1);
    }

    #[test]
    fn same_id_different_timestamp_is_kept() {
        let mut log = MessageLog::new();
        assert!(log.append_inbound(inbound(1, 100)));
        assert!(log.append_inbound(inbound(1, 101)));
        assert_eq!(log.len(), 2);
    }

    #[test]
    fn media_duplicates_are_suppressed_too() {
        let mut log = MessageLog::new();
        let mut img = ChatMessage::image(4, vec![1, 2, 3], 9);
        img.is_from_current_user = false;
        assert!(log.append_inbound(img.clone()));
        assert!(!log.append_inbound(img));
    }

    #[test]
    fn outbound_guard_is_id_and_author() {
        let mut log = MessageLog::new();
        let sent = ChatMessage::text(0x8000_0001, "yo", 5);
        assert!(log.append_outbound(sent.clone()));
        let mut retry = sent.clone();
        retry.timestamp = 6;
        assert!(!log.append_outbound(retry));
        // A peer message sharing the numeric id is a different author.
        assert!(log.append_inbound(inbound(0x8000_0001, 5)));
        assert_eq!(log.len(), 2);
        assert_eq!(log.entries()[0].content, "yo");
    }
}
