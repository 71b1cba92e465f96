use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::api::models::{Conversation, ConversationKind, Message, MessagePatch};

pub type SharedStore = Arc<Mutex<ConversationStore>>;

/// Lock the shared store, ignoring poisoning.
pub fn lock(store: &SharedStore) -> MutexGuard<'_, ConversationStore> {
    store.lock().unwrap_or_else(PoisonError::into_inner)
}

/// The part of the store that survives restarts.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoreSnapshot {
    pub conversations: Vec<Conversation>,
    pub messages: HashMap<String, Vec<Message>>,
    pub active_conversation_id: Option<String>,
}

#[derive(Debug, Default)]
pub struct ConversationStore {
    conversations: Vec<Conversation>,
    messages: HashMap<String, Vec<Message>>,
    active_conversation_id: Option<String>,
    typing_users: HashMap<String, Vec<String>>,
}

impl ConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared(self) -> SharedStore {
        Arc::new(Mutex::new(self))
    }

    pub fn restore(snapshot: StoreSnapshot) -> Self {
        let mut store = Self::new();
        store.set_conversations(snapshot.conversations);
        store.messages = snapshot.messages;
        store.active_conversation_id = snapshot.active_conversation_id;
        store
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        StoreSnapshot {
            conversations: self.conversations.clone(),
            messages: self.messages.clone(),
            active_conversation_id: self.active_conversation_id.clone(),
        }
    }

    pub fn conversations(&self) -> &[Conversation] {
        &self.conversations
    }

    pub fn conversation(&self, id: &str) -> Option<&Conversation> {
        self.conversations.iter().find(|c| c.id == id)
    }

    /// The direct conversation that includes `user_id`, if any.
    pub fn find_dm_with(&self, user_id: &str) -> Option<&Conversation> {
        self.conversations
            .iter()
            .find(|c| c.kind == ConversationKind::Dm && c.has_participant(user_id))
    }

    pub fn messages(&self, conversation_id: &str) -> &[Message] {
        self.messages
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    pub fn active_conversation_id(&self) -> Option<&str> {
        self.active_conversation_id.as_deref()
    }

    pub fn typing_users(&self, conversation_id: &str) -> &[String] {
        self.typing_users
            .get(conversation_id)
            .map(Vec::as_slice)
            .unwrap_or_default()
    }

    /// Replace the conversation list. Later duplicates (same id, or a direct
    /// conversation for an already-present participant pair) are dropped.
    pub fn set_conversations(&mut self, conversations: Vec<Conversation>) {
        let mut kept: Vec<Conversation> = Vec::with_capacity(conversations.len());
        for conv in conversations {
            if kept.iter().any(|k| k.id == conv.id || k.same_dm_pair(&conv)) {
                warn!("Dropping duplicate conversation {}", conv.id);
                continue;
            }
            kept.push(conv);
        }
        self.conversations = kept;
    }

    /// Insert at the top and return the id it is held under. An existing
    /// direct conversation for the same pair wins.
    pub fn add_conversation(&mut self, conversation: Conversation) -> String {
        if let Some(existing) = self.conversations.iter_mut().find(|c| c.id == conversation.id) {
            *existing = conversation;
            return existing.id.clone();
        }
        if let Some(existing) = self.conversations.iter().find(|c| c.same_dm_pair(&conversation)) {
            debug!(
                "Direct conversation {} already covers this pair; ignoring {}",
                existing.id, conversation.id
            );
            return existing.id.clone();
        }
        let id = conversation.id.clone();
        self.conversations.insert(0, conversation);
        id
    }

    /// Remove a conversation together with its messages. If it was active, the
    /// first remaining conversation becomes active.
    pub fn remove_conversation(&mut self, conversation_id: &str) -> bool {
        let before = self.conversations.len();
        self.conversations.retain(|c| c.id != conversation_id);
        if self.conversations.len() == before {
            return false;
        }
        self.messages.remove(conversation_id);
        self.typing_users.remove(conversation_id);
        if self.active_conversation_id.as_deref() == Some(conversation_id) {
            self.active_conversation_id = self.conversations.first().map(|c| c.id.clone());
        }
        true
    }

    pub fn add_user_to_conversation(&mut self, conversation_id: &str, user_id: &str) -> bool {
        match self.conversations.iter_mut().find(|c| c.id == conversation_id) {
            Some(conv) if !conv.has_participant(user_id) => {
                conv.participants.push(user_id.to_string());
                true
            }
            _ => false,
        }
    }

    /// Mark each direct conversation online when its other participant is in
    /// `online`. Returns how many changed.
    pub fn apply_presence(&mut self, me: &str, online: &[String]) -> usize {
        let mut changed = 0;
        for conv in self
            .conversations
            .iter_mut()
            .filter(|c| c.kind == ConversationKind::Dm)
        {
            let is_online = conv
                .other_participant(me)
                .is_some_and(|other| online.iter().any(|id| id == other));
            if conv.is_online != is_online {
                conv.is_online = is_online;
                changed += 1;
            }
        }
        changed
    }

    pub fn set_active_conversation(&mut self, conversation_id: Option<String>) {
        self.active_conversation_id = conversation_id;
    }

    pub fn add_message(&mut self, conversation_id: &str, message: Message) {
        self.messages
            .entry(conversation_id.to_string())
            .or_default()
            .push(message);
    }

    pub fn set_messages(&mut self, conversation_id: &str, messages: Vec<Message>) {
        self.messages.insert(conversation_id.to_string(), messages);
    }

    pub fn update_message(&mut self, conversation_id: &str, message_id: &str, patch: MessagePatch) -> bool {
        let Some(msg) = self
            .messages
            .get_mut(conversation_id)
            .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
        else {
            return false;
        };
        if let Some(status) = patch.status {
            msg.status = status;
        }
        if let Some(content) = patch.content {
            msg.content = content;
        }
        if let Some(files) = patch.files {
            msg.files = files;
        }
        true
    }

    pub fn mark_as_read(&mut self, conversation_id: &str, message_id: &str, user_id: &str) -> bool {
        let Some(msg) = self
            .messages
            .get_mut(conversation_id)
            .and_then(|list| list.iter_mut().find(|m| m.id == message_id))
        else {
            return false;
        };
        if !msg.read_by.iter().any(|u| u == user_id) {
            msg.read_by.push(user_id.to_string());
        }
        true
    }

    pub fn add_typing_user(&mut self, conversation_id: &str, user_id: &str) {
        let set = self.typing_users.entry(conversation_id.to_string()).or_default();
        if !set.iter().any(|u| u == user_id) {
            set.push(user_id.to_string());
        }
    }

    pub fn remove_typing_user(&mut self, conversation_id: &str, user_id: &str) {
        if let Some(set) = self.typing_users.get_mut(conversation_id) {
            set.retain(|u| u != user_id);
            if set.is_empty() {
                self.typing_users.remove(conversation_id);
            }
        }
    }

    /// Drop everything tied to the signed-in user.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::api::models::{MessageKind, MessageStatus};
    use chrono::Utc;

    pub(crate) fn dm(id: &str, a: &str, b: &str) -> Conversation {
        Conversation {
            id: id.to_string(),
            kind: ConversationKind::Dm,
            name: b.to_string(),
            participants: vec![a.to_string(), b.to_string()],
            is_online: false,
            last_message: None,
            last_message_time: Utc::now(),
            unread_count: 0,
        }
    }

    pub(crate) fn group(id: &str, members: &[&str]) -> Conversation {
        Conversation {
            id: id.to_string(),
            kind: ConversationKind::Group,
            name: format!("group {}", id),
            participants: members.iter().map(|m| m.to_string()).collect(),
            is_online: false,
            last_message: None,
            last_message_time: Utc::now(),
            unread_count: 0,
        }
    }

    pub(crate) fn text_message(id: &str, sender: &str, content: &str) -> Message {
        Message {
            id: id.to_string(),
            sender_id: sender.to_string(),
            sender_name: sender.to_string(),
            content: content.to_string(),
            timestamp: Utc::now(),
            kind: MessageKind::Text,
            files: vec![],
            status: None,
            reply_to: None,
            reply_text: None,
            reply_sender: None,
            content_lang: None,
            read_by: vec![],
            client_id: None,
        }
    }

    #[test]
    fn messages_keep_insertion_order() {
        let mut store = ConversationStore::new();
        for id in ["m1", "m2", "m3"] {
            store.add_message("c1", text_message(id, "u2", id));
        }
        let ids: Vec<&str> = store.messages("c1").iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, ["m1", "m2", "m3"]);
        assert!(store.messages("other").is_empty());
    }

    #[test]
    fn one_dm_per_pair() {
        let mut store = ConversationStore::new();
        assert_eq!(store.add_conversation(dm("c1", "u1", "u2")), "c1");
        assert_eq!(store.add_conversation(dm("c2", "u2", "u1")), "c1");
        assert_eq!(store.conversations().len(), 1);

        store.set_conversations(vec![dm("a", "u1", "u2"), dm("b", "u1", "u2"), dm("a", "u1", "u3")]);
        let ids: Vec<&str> = store.conversations().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["a"]);
    }

    #[test]
    fn add_conversation_prepends_and_replaces_by_id() {
        let mut store = ConversationStore::new();
        store.add_conversation(dm("c1", "u1", "u2"));
        store.add_conversation(group("g1", &["u1", "u3"]));
        assert_eq!(store.conversations()[0].id, "g1");

        let mut renamed = group("g1", &["u1", "u3"]);
        renamed.name = "renamed".into();
        store.add_conversation(renamed);
        assert_eq!(store.conversations().len(), 2);
        assert_eq!(store.conversation("g1").unwrap().name, "renamed");
    }

    #[test]
    fn removing_active_conversation_moves_selection() {
        let mut store = ConversationStore::new();
        store.set_conversations(vec![dm("c1", "u1", "u2"), group("g1", &["u1"])]);
        store.add_message("c1", text_message("m1", "u2", "hi"));
        store.set_active_conversation(Some("c1".into()));

        assert!(store.remove_conversation("c1"));
        assert_eq!(store.active_conversation_id(), Some("g1"));
        assert!(store.messages("c1").is_empty());
        assert!(!store.remove_conversation("c1"));

        assert!(store.remove_conversation("g1"));
        assert_eq!(store.active_conversation_id(), None);
    }

    #[test]
    fn update_and_read_receipts() {
        let mut store = ConversationStore::new();
        let mut pending = text_message("m1", "u1", "hi");
        pending.status = Some(MessageStatus::Sending);
        store.add_message("c1", pending);

        let patch = MessagePatch {
            status: Some(Some(MessageStatus::Failed)),
            ..MessagePatch::default()
        };
        assert!(store.update_message("c1", "m1", patch));
        assert_eq!(store.messages("c1")[0].status, Some(MessageStatus::Failed));
        assert!(!store.update_message("c1", "nope", MessagePatch::default()));

        assert!(store.mark_as_read("c1", "m1", "u2"));
        assert!(store.mark_as_read("c1", "m1", "u2"));
        assert_eq!(store.messages("c1")[0].read_by, vec!["u2".to_string()]);
    }

    #[test]
    fn typing_sets() {
        let mut store = ConversationStore::new();
        store.add_typing_user("c1", "u2");
        store.add_typing_user("c1", "u2");
        store.add_typing_user("c1", "u3");
        assert_eq!(store.typing_users("c1"), ["u2".to_string(), "u3".to_string()]);
        store.remove_typing_user("c1", "u2");
        store.remove_typing_user("c1", "u3");
        assert!(store.typing_users("c1").is_empty());
    }

    #[test]
    fn group_membership() {
        let mut store = ConversationStore::new();
        store.add_conversation(group("g1", &["u1"]));
        assert!(store.add_user_to_conversation("g1", "u4"));
        assert!(!store.add_user_to_conversation("g1", "u4"));
        assert!(!store.add_user_to_conversation("missing", "u4"));
        assert!(store.conversation("g1").unwrap().has_participant("u4"));
    }

    #[test]
    fn presence_marks_direct_peers_only() {
        let mut store = ConversationStore::new();
        store.set_conversations(vec![dm("c1", "u1", "u2"), dm("c2", "u1", "u3"), group("g1", &["u1", "u2"])]);
        assert_eq!(store.apply_presence("u1", &["u2".to_string()]), 1);
        assert!(store.conversation("c1").unwrap().is_online);
        assert!(!store.conversation("c2").unwrap().is_online);
        assert!(!store.conversation("g1").unwrap().is_online);

        assert_eq!(store.apply_presence("u1", &[]), 1);
        assert!(!store.conversation("c1").unwrap().is_online);
    }

    #[test]
    fn snapshot_skips_typing_state() {
        let mut store = ConversationStore::new();
        store.add_conversation(dm("c1", "u1", "u2"));
        store.add_message("c1", text_message("m1", "u2", "hi"));
        store.set_active_conversation(Some("c1".into()));
        store.add_typing_user("c1", "u2");

        let restored = ConversationStore::restore(store.snapshot());
        assert_eq!(restored.snapshot(), store.snapshot());
        assert!(restored.typing_users("c1").is_empty());
    }
}
