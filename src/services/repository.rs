use std::sync::Mutex;

use crate::models::{Conversation, MessageDelta};

/// Rollback token returned by `optimistic_set`. Opaque so call sites can
/// only restore the exact snapshot they displaced.
pub struct Snapshot(Vec<Conversation>);

/// In-memory cache of every conversation; the single source of truth the
/// rest of the system reads. Durable writes happen after the fact through
/// the store, and failed ones roll this cache back.
#[derive(Default)]
pub struct ConversationRepository {
    inner: Mutex<Vec<Conversation>>,
}

impl ConversationRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_conversations(conversations: Vec<Conversation>) -> Self {
        Self {
            inner: Mutex::new(conversations),
        }
    }

    /// Current authoritative snapshot, newest conversation first.
    pub fn read(&self) -> Vec<Conversation> {
        self.inner.lock().unwrap().clone()
    }

    pub fn get(&self, conversation_id: &str) -> Option<Conversation> {
        self.inner
            .lock()
            .unwrap()
            .iter()
            .find(|c| c.id == conversation_id)
            .cloned()
    }

    /// Replace the snapshot immediately, before any durable write. The
    /// returned token restores the displaced state on failure.
    pub fn optimistic_set(&self, conversations: Vec<Conversation>) -> Snapshot {
        let mut inner = self.inner.lock().unwrap();
        Snapshot(std::mem::replace(&mut *inner, conversations))
    }

    pub fn rollback(&self, snapshot: Snapshot) {
        *self.inner.lock().unwrap() = snapshot.0;
    }

    /// Fold one streamed chunk into the unique in-progress message of the
    /// given conversation. A missing target is an expected race (the
    /// stream was finalized or rolled back first) and is silently ignored.
    pub fn patch_streaming_message(&self, conversation_id: &str, delta: &MessageDelta) {
        let mut inner = self.inner.lock().unwrap();
        let Some(conversation) = inner.iter_mut().find(|c| c.id == conversation_id) else {
            return;
        };
        let Some(message) = conversation.streaming_message_mut() else {
            return;
        };
        message.merge(delta);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{LogicalModel, Message};

    fn seeded() -> (ConversationRepository, String) {
        let mut conv = Conversation::new(LogicalModel::Flash);
        conv.messages.push(Message::user("hi", Vec::new()));
        conv.messages.push(Message::placeholder());
        let id = conv.id.clone();
        (ConversationRepository::with_conversations(vec![conv]), id)
    }

    fn text_delta(s: &str) -> MessageDelta {
        MessageDelta {
            text: Some(s.to_string()),
            ..Default::default()
        }
    }

    #[test]
    fn rollback_restores_the_exact_prior_snapshot() {
        let (repo, id) = seeded();
        let before = repo.read();

        let mut altered = before.clone();
        altered[0].title = "changed".to_string();
        altered[0].messages.push(Message::user("more", Vec::new()));
        let snapshot = repo.optimistic_set(altered);

        repo.rollback(snapshot);

        let after = repo.read();
        assert_eq!(after.len(), before.len());
        assert_eq!(after[0].id, id);
        assert_eq!(after[0].title, before[0].title);
        assert_eq!(after[0].messages.len(), before[0].messages.len());
    }

    #[test]
    fn patch_folds_into_the_streaming_message() {
        let (repo, id) = seeded();

        repo.patch_streaming_message(&id, &text_delta("Hel"));
        repo.patch_streaming_message(&id, &text_delta("lo"));

        let conv = repo.get(&id).unwrap();
        let streaming = conv.streaming_message().unwrap();
        assert_eq!(streaming.content, "Hello");
    }

    #[test]
    fn patch_is_a_noop_without_a_streaming_message() {
        let mut conv = Conversation::new(LogicalModel::Flash);
        conv.messages.push(Message::user("hi", Vec::new()));
        let id = conv.id.clone();
        let repo = ConversationRepository::with_conversations(vec![conv]);

        // Must neither panic nor touch any finalized message
        repo.patch_streaming_message(&id, &text_delta("late chunk"));
        repo.patch_streaming_message("no-such-conversation", &text_delta("x"));

        assert_eq!(repo.get(&id).unwrap().messages[0].content, "hi");
    }

    #[test]
    fn at_most_one_streaming_message_is_observable() {
        let (repo, id) = seeded();
        let conv = repo.get(&id).unwrap();
        let streaming = conv.messages.iter().filter(|m| m.is_streaming()).count();
        assert_eq!(streaming, 1);
    }
}
