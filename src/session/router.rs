//! Addressing and reconciliation between wire frames and the store.

use log::{debug, info, warn};

use crate::api::events::{InboundMessage, OutgoingFrame, SendMessageFrame};
use crate::api::models::{
    ConversationKind, Identity, Message, MessageDraft, MessageKind, MessagePatch, MessageStatus,
};
use crate::error::SendError;
use crate::store::{self, SharedStore};
use crate::utils;

/// A resolved send: the frame to transmit and the optimistic entry that
/// goes into the store ahead of it.
#[derive(Debug, Clone)]
pub struct OutboundPlan {
    pub conversation_id: String,
    pub frame: OutgoingFrame,
    pub optimistic: Message,
}

/// Outcome of routing an inbound `message` frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Routed {
    Appended { conversation_id: String, message: Message },
    /// Our own message came back; the pending entry was confirmed in place.
    Confirmed { conversation_id: String, message_id: String },
    Dropped,
}

pub struct MessageRouter {
    store: SharedStore,
    language: String,
}

impl MessageRouter {
    pub fn new(store: SharedStore, language: impl Into<String>) -> Self {
        Self {
            store,
            language: language.into(),
        }
    }

    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    /// Resolve where `draft` goes and build what would be sent. Nothing is
    /// committed to the store.
    pub fn plan_send(
        &self,
        me: &Identity,
        conversation_id: &str,
        draft: MessageDraft,
    ) -> Result<OutboundPlan, SendError> {
        let guard = store::lock(&self.store);
        let conversation = guard
            .conversation(conversation_id)
            .ok_or_else(|| SendError::UnknownConversation(conversation_id.to_string()))?;

        let (to_user, group_id) = match conversation.kind {
            ConversationKind::Dm => {
                let other = conversation
                    .other_participant(&me.user_id)
                    .ok_or_else(|| SendError::NoRecipient(conversation_id.to_string()))?;
                debug!("Sending DM to {} in {}", other, conversation_id);
                (Some(other.to_string()), None)
            }
            ConversationKind::Group => (None, Some(conversation.id.clone())),
        };
        let chat_type = conversation.kind;
        drop(guard);

        let local_id = utils::new_local_id();
        let frame = OutgoingFrame::SendMessage(SendMessageFrame {
            chat_type,
            to_user,
            group_id,
            conversation_id: conversation_id.to_string(),
            text: draft.text.clone(),
            source_lang: self.language.clone(),
            files: draft.files.clone(),
            reply_to: draft.reply_to.clone(),
            reply_text: draft.reply_text.clone(),
            reply_sender: draft.reply_sender.clone(),
            client_id: Some(local_id.clone()),
        });

        let optimistic = Message {
            id: local_id.clone(),
            sender_id: me.user_id.clone(),
            sender_name: me.label(),
            content: draft.text,
            timestamp: utils::now(),
            kind: MessageKind::for_files(&draft.files),
            files: draft.files,
            status: Some(MessageStatus::Sending),
            reply_to: draft.reply_to,
            reply_text: draft.reply_text,
            reply_sender: draft.reply_sender,
            content_lang: Some(self.language.clone()),
            read_by: Vec::new(),
            client_id: Some(local_id),
        };

        Ok(OutboundPlan {
            conversation_id: conversation_id.to_string(),
            frame,
            optimistic,
        })
    }

    pub fn commit_optimistic(&self, plan: &OutboundPlan) {
        store::lock(&self.store).add_message(&plan.conversation_id, plan.optimistic.clone());
    }

    pub fn mark_failed(&self, conversation_id: &str, message_id: &str) {
        let patch = MessagePatch {
            status: Some(Some(MessageStatus::Failed)),
            ..MessagePatch::default()
        };
        store::lock(&self.store).update_message(conversation_id, message_id, patch);
    }

    /// Find the conversation an inbound frame belongs to and record it.
    /// Frames for conversations we do not know are dropped; no conversation
    /// is created from inbound traffic.
    pub fn route_inbound(&self, me: Option<&str>, frame: InboundMessage) -> Routed {
        let from_self = me.is_some_and(|id| id == frame.from_user);
        let mut guard = store::lock(&self.store);

        if from_self {
            if let Some((conversation_id, message_id)) = find_own_pending(&guard, &frame) {
                let patch = MessagePatch {
                    status: Some(None),
                    ..MessagePatch::default()
                };
                guard.update_message(&conversation_id, &message_id, patch);
                debug!("Confirmed {} in {}", message_id, conversation_id);
                return Routed::Confirmed { conversation_id, message_id };
            }
        }

        let conversation_id = match frame.chat_type {
            // Every direct conversation contains us, so our own DM echoes
            // cannot be placed without a correlation match.
            ConversationKind::Dm if from_self => None,
            ConversationKind::Dm => guard.find_dm_with(&frame.from_user).map(|c| c.id.clone()),
            ConversationKind::Group => frame.group_id().map(str::to_string),
        };
        let Some(conversation_id) = conversation_id else {
            warn!(
                "No conversation for {:?} message from {}; dropping",
                frame.chat_type, frame.from_user
            );
            return Routed::Dropped;
        };

        let message = inbound_to_message(frame);
        info!("Adding message {} to conversation {}", message.id, conversation_id);
        guard.add_message(&conversation_id, message.clone());
        Routed::Appended { conversation_id, message }
    }
}

// Match by echoed client id first; otherwise the oldest own message still
// pending in the frame's group with the same text. A translated echo cannot
// be compared by text and takes the oldest pending entry.
fn find_own_pending(
    store: &crate::store::ConversationStore,
    frame: &InboundMessage,
) -> Option<(String, String)> {
    if let Some(client_id) = frame.client_id.as_deref() {
        for conv in store.conversations() {
            if let Some(msg) = store
                .messages(&conv.id)
                .iter()
                .find(|m| m.is_pending() && m.client_id.as_deref() == Some(client_id))
            {
                return Some((conv.id.clone(), msg.id.clone()));
            }
        }
    }
    if frame.chat_type == ConversationKind::Group {
        let group_id = frame.group_id()?;
        let msg = store
            .messages(group_id)
            .iter()
            .find(|m| m.is_pending() && m.sender_id == frame.from_user && echoes(m, frame))?;
        return Some((group_id.to_string(), msg.id.clone()));
    }
    None
}

fn echoes(sent: &Message, frame: &InboundMessage) -> bool {
    let translated = match (frame.lang.as_deref(), sent.content_lang.as_deref()) {
        (Some(echo), Some(ours)) => echo != ours,
        _ => false,
    };
    translated || sent.content == frame.text
}

fn inbound_to_message(frame: InboundMessage) -> Message {
    let files = frame.files();
    let (reply_to, reply_text, reply_sender) = frame.reply();
    Message {
        id: utils::new_local_id(),
        sender_name: frame.from_user.clone(),
        sender_id: frame.from_user,
        content: frame.text,
        timestamp: utils::now(),
        kind: MessageKind::for_files(&files),
        files,
        status: None,
        reply_to,
        reply_text,
        reply_sender,
        content_lang: frame.lang,
        read_by: Vec::new(),
        client_id: frame.client_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::tests::{dm, group};
    use crate::store::ConversationStore;

    fn me() -> Identity {
        Identity {
            user_id: "u1".into(),
            email: Some("ann@example.com".into()),
            name: Some("ann".into()),
            display_name: Some("Ann".into()),
            token: "tok".into(),
        }
    }

    fn router_with(convs: Vec<crate::api::models::Conversation>) -> MessageRouter {
        let mut store = ConversationStore::new();
        store.set_conversations(convs);
        MessageRouter::new(store.shared(), "en")
    }

    fn inbound(chat_type: ConversationKind, from: &str, group_id: Option<&str>, text: &str) -> InboundMessage {
        InboundMessage {
            from_user: from.into(),
            chat_type,
            text: text.into(),
            files: None,
            group_id: group_id.map(str::to_string),
            lang: Some("en".into()),
            reply_to: None,
            reply_text: None,
            reply_sender: None,
            client_id: None,
        }
    }

    #[test]
    fn dm_resolves_other_participant() {
        let router = router_with(vec![dm("c1", "u1", "u2")]);
        let plan = router.plan_send(&me(), "c1", MessageDraft::text("hi")).unwrap();
        let OutgoingFrame::SendMessage(frame) = &plan.frame else {
            panic!("expected send_message");
        };
        assert_eq!(frame.to_user.as_deref(), Some("u2"));
        assert_eq!(frame.group_id, None);
        assert_eq!(frame.conversation_id, "c1");
        assert_eq!(frame.client_id.as_deref(), Some(plan.optimistic.id.as_str()));
        assert_eq!(plan.optimistic.status, Some(MessageStatus::Sending));
        assert_eq!(plan.optimistic.sender_name, "Ann");
        // planning alone commits nothing
        assert!(store::lock(router.store()).messages("c1").is_empty());
    }

    #[test]
    fn group_uses_conversation_id() {
        let router = router_with(vec![group("g1", &["u1", "u2", "u3"])]);
        let draft = MessageDraft {
            text: "look".into(),
            files: vec!["https://cdn/a.png".into()],
            ..MessageDraft::default()
        };
        let plan = router.plan_send(&me(), "g1", draft).unwrap();
        let OutgoingFrame::SendMessage(frame) = &plan.frame else {
            panic!("expected send_message");
        };
        assert_eq!(frame.group_id.as_deref(), Some("g1"));
        assert_eq!(frame.to_user, None);
        assert_eq!(plan.optimistic.kind, MessageKind::File);
    }

    #[test]
    fn dm_without_other_participant_fails() {
        let mut lonely = dm("c1", "u1", "u2");
        lonely.participants = vec!["u1".into()];
        let router = router_with(vec![lonely]);
        assert!(matches!(
            router.plan_send(&me(), "c1", MessageDraft::text("hi")),
            Err(SendError::NoRecipient(_))
        ));
        assert!(matches!(
            router.plan_send(&me(), "missing", MessageDraft::text("hi")),
            Err(SendError::UnknownConversation(_))
        ));
    }

    #[test]
    fn inbound_dm_goes_to_matching_conversation_only() {
        let router = router_with(vec![dm("c1", "u1", "u2"), dm("c2", "u1", "u3")]);
        let routed = router.route_inbound(Some("u1"), inbound(ConversationKind::Dm, "u2", None, "hello"));
        assert!(matches!(routed, Routed::Appended { ref conversation_id, .. } if conversation_id == "c1"));

        let guard = store::lock(router.store());
        assert_eq!(guard.messages("c1").len(), 1);
        assert_eq!(guard.messages("c1")[0].sender_id, "u2");
        assert_eq!(guard.messages("c1")[0].status, None);
        assert!(guard.messages("c2").is_empty());
    }

    #[test]
    fn inbound_dm_from_stranger_is_dropped() {
        let router = router_with(vec![dm("c1", "u1", "u2")]);
        let before = store::lock(router.store()).snapshot();
        let routed = router.route_inbound(Some("u1"), inbound(ConversationKind::Dm, "u9", None, "hey"));
        assert_eq!(routed, Routed::Dropped);
        assert_eq!(store::lock(router.store()).snapshot(), before);
    }

    #[test]
    fn inbound_group_uses_frame_group_id() {
        let router = router_with(vec![]);
        router.route_inbound(Some("u1"), inbound(ConversationKind::Group, "u3", Some("g7"), "a"));
        router.route_inbound(Some("u1"), inbound(ConversationKind::Group, "u4", Some("g7"), "b"));
        assert_eq!(
            router.route_inbound(Some("u1"), inbound(ConversationKind::Group, "u4", None, "c")),
            Routed::Dropped
        );
        let guard = store::lock(router.store());
        let texts: Vec<&str> = guard.messages("g7").iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, ["a", "b"]);
    }

    #[test]
    fn own_group_echo_confirms_oldest_pending() {
        let router = router_with(vec![group("g1", &["u1", "u2"])]);
        let first = router.plan_send(&me(), "g1", MessageDraft::text("one")).unwrap();
        let second = router.plan_send(&me(), "g1", MessageDraft::text("two")).unwrap();
        router.commit_optimistic(&first);
        router.commit_optimistic(&second);

        let routed = router.route_inbound(Some("u1"), inbound(ConversationKind::Group, "u1", Some("g1"), "one"));
        assert_eq!(
            routed,
            Routed::Confirmed {
                conversation_id: "g1".into(),
                message_id: first.optimistic.id.clone()
            }
        );
        let guard = store::lock(router.store());
        let msgs = guard.messages("g1");
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].status, None);
        assert_eq!(msgs[1].status, Some(MessageStatus::Sending));
    }

    #[test]
    fn lost_send_does_not_swallow_later_echo() {
        let router = router_with(vec![group("g1", &["u1", "u2"])]);
        let lost = router.plan_send(&me(), "g1", MessageDraft::text("one")).unwrap();
        let kept = router.plan_send(&me(), "g1", MessageDraft::text("two")).unwrap();
        router.commit_optimistic(&lost);
        router.commit_optimistic(&kept);

        let routed = router.route_inbound(Some("u1"), inbound(ConversationKind::Group, "u1", Some("g1"), "two"));
        assert_eq!(
            routed,
            Routed::Confirmed {
                conversation_id: "g1".into(),
                message_id: kept.optimistic.id.clone()
            }
        );
        let guard = store::lock(router.store());
        assert_eq!(guard.messages("g1")[0].status, Some(MessageStatus::Sending));
        assert_eq!(guard.messages("g1")[1].status, None);
    }

    #[test]
    fn translated_echo_falls_back_to_oldest_pending() {
        let router = router_with(vec![group("g1", &["u1", "u2"])]);
        let plan = router.plan_send(&me(), "g1", MessageDraft::text("hello")).unwrap();
        router.commit_optimistic(&plan);

        let mut echo = inbound(ConversationKind::Group, "u1", Some("g1"), "hola");
        echo.lang = Some("es".into());
        assert!(matches!(router.route_inbound(Some("u1"), echo), Routed::Confirmed { .. }));
    }

    #[test]
    fn echo_with_client_id_matches_exactly() {
        let router = router_with(vec![dm("c1", "u1", "u2")]);
        let plan = router.plan_send(&me(), "c1", MessageDraft::text("hi")).unwrap();
        router.commit_optimistic(&plan);

        let mut echo = inbound(ConversationKind::Dm, "u1", None, "hi");
        echo.client_id = plan.optimistic.client_id.clone();
        assert!(matches!(router.route_inbound(Some("u1"), echo), Routed::Confirmed { .. }));

        // an uncorrelated DM from ourselves has nowhere to go
        let stray = inbound(ConversationKind::Dm, "u1", None, "again");
        assert_eq!(router.route_inbound(Some("u1"), stray), Routed::Dropped);
        assert_eq!(store::lock(router.store()).messages("c1").len(), 1);
    }

    #[test]
    fn mark_failed_updates_status() {
        let router = router_with(vec![dm("c1", "u1", "u2")]);
        let plan = router.plan_send(&me(), "c1", MessageDraft::text("hi")).unwrap();
        router.commit_optimistic(&plan);
        router.mark_failed("c1", &plan.optimistic.id);
        assert_eq!(
            store::lock(router.store()).messages("c1")[0].status,
            Some(MessageStatus::Failed)
        );
    }
}
