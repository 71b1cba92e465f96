use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::api::models::{non_empty, ConversationKind};
use crate::error::CodecError;

/// Frames this client writes to the realtime socket.
#[derive(Debug, Serialize, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutgoingFrame {
    SendMessage(SendMessageFrame),
    CreateGroup { name: String, members: Vec<String> },
    JoinGroup { group_id: String },
}

#[derive(Debug, Serialize, Clone, PartialEq)]
pub struct SendMessageFrame {
    pub chat_type: ConversationKind,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub to_user: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub group_id: Option<String>,
    pub conversation_id: String,
    pub text: String,
    pub source_lang: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub files: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reply_sender: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// Frames the server pushes to us.
#[derive(Debug, Clone, PartialEq)]
pub enum IncomingFrame {
    Message(InboundMessage),
    GroupCreated(GroupNotice),
    JoinedGroup(GroupNotice),
    Error { error: String },
    /// Anything with a `type` we do not handle. Logged and dropped.
    Unknown { kind: String },
}

#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct InboundMessage {
    pub from_user: String,
    pub chat_type: ConversationKind,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub files: Option<Vec<String>>,
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub lang: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub reply_text: Option<String>,
    #[serde(default)]
    pub reply_sender: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl InboundMessage {
    pub fn files(&self) -> Vec<String> {
        self.files.clone().unwrap_or_default()
    }

    pub fn group_id(&self) -> Option<&str> {
        self.group_id.as_deref().filter(|g| !g.is_empty())
    }

    pub fn reply(&self) -> (Option<String>, Option<String>, Option<String>) {
        (
            non_empty(self.reply_to.clone()),
            non_empty(self.reply_text.clone()),
            non_empty(self.reply_sender.clone()),
        )
    }
}

#[derive(Debug, Deserialize, Clone, PartialEq, Default)]
pub struct GroupNotice {
    #[serde(default)]
    pub group_id: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
}

#[derive(Deserialize)]
struct ErrorBody {
    #[serde(default)]
    error: String,
}

pub fn encode(frame: &OutgoingFrame) -> Result<String, CodecError> {
    Ok(serde_json::to_string(frame)?)
}

pub fn decode(text: &str) -> Result<IncomingFrame, CodecError> {
    let value: Value = serde_json::from_str(text)?;
    let kind = value
        .get("type")
        .and_then(Value::as_str)
        .map(|k| k.trim().to_string())
        .ok_or(CodecError::MissingType)?;

    let frame = match kind.as_str() {
        "message" => IncomingFrame::Message(serde_json::from_value(value)?),
        "group_created" => IncomingFrame::GroupCreated(serde_json::from_value(value)?),
        "joined_group" => IncomingFrame::JoinedGroup(serde_json::from_value(value)?),
        "error" => {
            let body: ErrorBody = serde_json::from_value(value)?;
            IncomingFrame::Error { error: body.error }
        }
        _ => IncomingFrame::Unknown { kind },
    };
    Ok(frame)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn dm_send_frame_shape() {
        let frame = OutgoingFrame::SendMessage(SendMessageFrame {
            chat_type: ConversationKind::Dm,
            to_user: Some("u2".into()),
            group_id: None,
            conversation_id: "c1".into(),
            text: "hi".into(),
            source_lang: "en".into(),
            files: vec![],
            reply_to: None,
            reply_text: None,
            reply_sender: None,
            client_id: Some("local-1".into()),
        });
        let value: Value = serde_json::from_str(&encode(&frame).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({
                "type": "send_message",
                "chat_type": "dm",
                "to_user": "u2",
                "conversation_id": "c1",
                "text": "hi",
                "source_lang": "en",
                "client_id": "local-1"
            })
        );
    }

    #[test]
    fn create_and_join_group_shapes() {
        let create = OutgoingFrame::CreateGroup {
            name: "Team".into(),
            members: vec!["u2".into(), "u3".into()],
        };
        let value: Value = serde_json::from_str(&encode(&create).unwrap()).unwrap();
        assert_eq!(
            value,
            json!({"type": "create_group", "name": "Team", "members": ["u2", "u3"]})
        );

        let join = OutgoingFrame::JoinGroup { group_id: "g9".into() };
        let value: Value = serde_json::from_str(&encode(&join).unwrap()).unwrap();
        assert_eq!(value, json!({"type": "join_group", "group_id": "g9"}));
    }

    #[test]
    fn decodes_group_message() {
        let frame = decode(
            r#"{"type":"message","chat_type":"group","from_user":"u3","group_id":"g1","text":"yo","lang":"en"}"#,
        )
        .unwrap();
        let IncomingFrame::Message(msg) = frame else {
            panic!("expected message frame");
        };
        assert_eq!(msg.chat_type, ConversationKind::Group);
        assert_eq!(msg.group_id(), Some("g1"));
        assert!(msg.files().is_empty());
    }

    #[test]
    fn decodes_notices_and_errors() {
        assert_eq!(
            decode(r#"{"type":"group_created","group_id":"g2","text":"group created"}"#).unwrap(),
            IncomingFrame::GroupCreated(GroupNotice {
                group_id: Some("g2".into()),
                text: Some("group created".into()),
            })
        );
        assert!(matches!(
            decode(r#"{"type":"joined_group"}"#).unwrap(),
            IncomingFrame::JoinedGroup(_)
        ));
        assert_eq!(
            decode(r#"{"type":"error","error":"unknown_type"}"#).unwrap(),
            IncomingFrame::Error { error: "unknown_type".into() }
        );
    }

    #[test]
    fn unknown_kind_is_not_an_error() {
        assert_eq!(
            decode(r#"{"type":"presence","user":"u2"}"#).unwrap(),
            IncomingFrame::Unknown { kind: "presence".into() }
        );
    }

    #[test]
    fn malformed_frames_fail() {
        assert!(matches!(decode("not json"), Err(CodecError::Malformed(_))));
        assert!(matches!(decode(r#"{"text":"x"}"#), Err(CodecError::MissingType)));
        assert!(matches!(
            decode(r#"{"type":"message","chat_type":"dm"}"#),
            Err(CodecError::Malformed(_))
        ));
    }
}
