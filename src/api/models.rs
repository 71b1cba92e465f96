use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

const AUDIO_EXTENSIONS: [&str; 5] = [".mp3", ".wav", ".webm", ".ogg", ".m4a"];

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum ConversationKind {
    Dm,
    Group,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Conversation {
    pub id: String,
    #[serde(rename = "type")]
    pub kind: ConversationKind,
    #[serde(default)]
    pub name: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub participants: Vec<String>,
    #[serde(default)]
    pub is_online: bool,
    #[serde(default, deserialize_with = "loose_text")]
    pub last_message: Option<String>,
    #[serde(default = "Utc::now")]
    pub last_message_time: DateTime<Utc>,
    #[serde(default)]
    pub unread_count: u32,
}

impl Conversation {
    /// The participant of a direct conversation that is not `me`.
    pub fn other_participant(&self, me: &str) -> Option<&str> {
        self.participants
            .iter()
            .map(String::as_str)
            .find(|id| *id != me)
    }

    pub fn has_participant(&self, user_id: &str) -> bool {
        self.participants.iter().any(|p| p == user_id)
    }

    /// Two direct conversations are the same chat when they hold the same
    /// unordered pair of participants.
    pub fn same_dm_pair(&self, other: &Conversation) -> bool {
        if self.kind != ConversationKind::Dm || other.kind != ConversationKind::Dm {
            return false;
        }
        let mut a: Vec<&str> = self.participants.iter().map(String::as_str).collect();
        let mut b: Vec<&str> = other.participants.iter().map(String::as_str).collect();
        a.sort_unstable();
        a.dedup();
        b.sort_unstable();
        b.dedup();
        a.len() == 2 && a == b
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageKind {
    Text,
    File,
    Voice,
}

impl MessageKind {
    pub fn for_files(files: &[String]) -> Self {
        if files.iter().any(|f| is_audio(f)) {
            MessageKind::Voice
        } else if files.is_empty() {
            MessageKind::Text
        } else {
            MessageKind::File
        }
    }
}

fn is_audio(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    AUDIO_EXTENSIONS.iter().any(|ext| lower.ends_with(ext))
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum MessageStatus {
    Sending,
    Sent,
    Failed,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub sender_id: String,
    pub sender_name: String,
    pub content: String,
    pub timestamp: DateTime<Utc>,
    #[serde(rename = "type")]
    pub kind: MessageKind,
    #[serde(default)]
    pub files: Vec<String>,
    /// `None` once the server has confirmed the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<MessageStatus>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub reply_text: Option<String>,
    #[serde(default)]
    pub reply_sender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_lang: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub read_by: Vec<String>,
    /// Correlation id carried on our own outbound frames.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

impl Message {
    pub fn is_pending(&self) -> bool {
        self.status == Some(MessageStatus::Sending)
    }
}

/// Partial update applied with `ConversationStore::update_message`.
#[derive(Debug, Default, Clone)]
pub struct MessagePatch {
    pub status: Option<Option<MessageStatus>>,
    pub content: Option<String>,
    pub files: Option<Vec<String>>,
}

/// What the user composed; the router turns it into a frame and an
/// optimistic `Message`.
#[derive(Debug, Default, Clone)]
pub struct MessageDraft {
    pub text: String,
    pub files: Vec<String>,
    pub reply_to: Option<String>,
    pub reply_text: Option<String>,
    pub reply_sender: Option<String>,
}

impl MessageDraft {
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Self::default()
        }
    }
}

/// The signed-in user as far as the session is concerned.
#[derive(Debug, Clone, PartialEq)]
pub struct Identity {
    pub user_id: String,
    pub email: Option<String>,
    pub name: Option<String>,
    pub display_name: Option<String>,
    pub token: String,
}

impl Identity {
    /// Name shown on our own messages.
    pub fn label(&self) -> String {
        self.display_name
            .clone()
            .or_else(|| self.name.clone())
            .or_else(|| self.email.clone())
            .unwrap_or_else(|| self.user_id.clone())
    }
}

/// Search result / DM peer.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct UserSummary {
    pub id: String,
    pub email: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub avatar: Option<String>,
    #[serde(default)]
    pub is_online: bool,
}

impl UserSummary {
    pub fn short_name(&self) -> String {
        match &self.name {
            Some(name) if !name.is_empty() => name.clone(),
            _ => self
                .email
                .split('@')
                .next()
                .unwrap_or_default()
                .to_string(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct MeResponse {
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub language: Option<String>,
    #[serde(default)]
    pub locale: Option<String>,
    #[serde(default)]
    pub is_verified: bool,
}

/// Body of `PUT /me`. Unset fields are left alone by the server.
#[derive(Debug, Serialize, Clone, Default, PartialEq)]
pub struct ProfileUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(rename = "displayName", skip_serializing_if = "Option::is_none")]
    pub display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Response of `POST /upload`; `url` is what goes into `send_message.files`.
#[derive(Debug, Deserialize, Clone, PartialEq)]
pub struct UploadedFile {
    pub url: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default, rename = "type")]
    pub content_type: Option<String>,
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct PresenceSnapshot {
    #[serde(default, deserialize_with = "null_as_default")]
    pub online: Vec<String>,
}

/// Content type the upload endpoint expects for a local file, by extension.
pub fn upload_mime(file_name: &str) -> &'static str {
    let ext = file_name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "mp4" => "video/mp4",
        "mp3" => "audio/mpeg",
        "wav" => "audio/wav",
        "webm" => "audio/webm",
        "ogg" => "audio/ogg",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub user_id: String,
}

/// One row of `/messages/dm` or `/messages/group`.
#[derive(Debug, Deserialize)]
pub struct HistoryRecord {
    #[serde(rename = "_id", alias = "id")]
    pub id: String,
    pub sender_id: String,
    #[serde(default)]
    pub sender_name: Option<String>,
    #[serde(default)]
    pub sender_display_name: Option<String>,
    #[serde(default)]
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub files: Vec<String>,
    #[serde(default)]
    pub content_lang: Option<String>,
    #[serde(default)]
    pub reply_to: Option<String>,
    #[serde(default)]
    pub reply_text: Option<String>,
    #[serde(default)]
    pub reply_sender: Option<String>,
}

impl From<HistoryRecord> for Message {
    fn from(rec: HistoryRecord) -> Self {
        let sender_name = rec
            .sender_name
            .or(rec.sender_display_name)
            .unwrap_or_else(|| rec.sender_id.clone());
        Message {
            id: rec.id,
            kind: MessageKind::for_files(&rec.files),
            sender_id: rec.sender_id,
            sender_name,
            content: rec.content,
            timestamp: rec.created_at,
            files: rec.files,
            status: None,
            reply_to: non_empty(rec.reply_to),
            reply_text: non_empty(rec.reply_text),
            reply_sender: non_empty(rec.reply_sender),
            content_lang: rec.content_lang,
            read_by: Vec::new(),
            client_id: None,
        }
    }
}

/// Turn a raw history payload into messages, oldest first. Anything that is
/// not an array yields nothing and rows that fail to parse are skipped.
pub fn normalize_history(raw: Value) -> Vec<Message> {
    let Value::Array(rows) = raw else {
        log::warn!("History payload was not a list; treating as empty");
        return Vec::new();
    };
    let mut out: Vec<Message> = rows
        .into_iter()
        .filter(Value::is_object)
        .filter_map(|row| match serde_json::from_value::<HistoryRecord>(row) {
            Ok(rec) => Some(Message::from(rec)),
            Err(e) => {
                log::debug!("Skipping history row: {}", e);
                None
            }
        })
        .collect();
    out.reverse();
    out
}

pub(crate) fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|s| !s.is_empty())
}

fn null_as_default<'de, D, T>(de: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(de)?.unwrap_or_default())
}

// Server sends the last message as whatever it stored; keep strings and
// stringify anything else.
fn loose_text<'de, D>(de: D) -> Result<Option<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match Value::deserialize(de)? {
        Value::Null => None,
        Value::String(s) => Some(s),
        other => Some(other.to_string()),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn profile_update_sends_only_set_fields() {
        let update = ProfileUpdate {
            display_name: Some("Ann".into()),
            ..ProfileUpdate::default()
        };
        assert_eq!(serde_json::to_value(&update).unwrap(), json!({ "displayName": "Ann" }));
    }

    #[test]
    fn upload_and_presence_shapes() {
        let up: UploadedFile = serde_json::from_value(json!({
            "url": "http://localhost:5000/uploads/a.png",
            "filename": "a.png",
            "size": 12,
            "type": "image/png"
        }))
        .unwrap();
        assert_eq!(up.content_type.as_deref(), Some("image/png"));

        let presence: PresenceSnapshot = serde_json::from_value(json!({ "online": null })).unwrap();
        assert!(presence.online.is_empty());

        assert_eq!(upload_mime("Voice.OGG"), "audio/ogg");
        assert_eq!(upload_mime("notes"), "application/octet-stream");
    }

    #[test]
    fn conversation_from_server_shape() {
        let conv: Conversation = serde_json::from_value(json!({
            "id": "c1",
            "type": "dm",
            "name": "Bob",
            "participants": ["u1", "u2"],
            "lastMessage": null,
            "lastMessageTime": "2024-05-01T10:00:00Z",
            "unreadCount": 2,
            "isOnline": true
        }))
        .unwrap();
        assert_eq!(conv.kind, ConversationKind::Dm);
        assert_eq!(conv.other_participant("u1"), Some("u2"));
        assert_eq!(conv.unread_count, 2);
        assert!(conv.last_message.is_none());
    }

    #[test]
    fn null_participants_become_empty() {
        let conv: Conversation = serde_json::from_value(json!({
            "id": "g1", "type": "group", "participants": null, "lastMessage": {"text": "x"}
        }))
        .unwrap();
        assert!(conv.participants.is_empty());
        assert_eq!(conv.last_message.as_deref(), Some(r#"{"text":"x"}"#));
    }

    #[test]
    fn dm_pair_ignores_order() {
        let mk = |id: &str, p: [&str; 2]| Conversation {
            id: id.into(),
            kind: ConversationKind::Dm,
            name: String::new(),
            participants: p.iter().map(|s| s.to_string()).collect(),
            is_online: false,
            last_message: None,
            last_message_time: Utc::now(),
            unread_count: 0,
        };
        assert!(mk("a", ["u1", "u2"]).same_dm_pair(&mk("b", ["u2", "u1"])));
        assert!(!mk("a", ["u1", "u2"]).same_dm_pair(&mk("b", ["u1", "u3"])));
    }

    #[test]
    fn history_is_reversed_and_filtered() {
        let msgs = normalize_history(json!([
            {"_id": "m2", "sender_id": "u2", "content": "second", "created_at": "2024-05-01T10:01:00Z",
             "files": ["https://cdn/x/note.OGG"], "reply_to": ""},
            null,
            {"broken": true},
            {"_id": "m1", "sender_id": "u1", "sender_display_name": "Ann", "content": "first",
             "created_at": "2024-05-01T10:00:00Z", "files": null}
        ]));
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].id, "m1");
        assert_eq!(msgs[0].sender_name, "Ann");
        assert_eq!(msgs[0].kind, MessageKind::Text);
        assert_eq!(msgs[1].kind, MessageKind::Voice);
        assert_eq!(msgs[1].sender_name, "u2");
        assert!(msgs[1].reply_to.is_none());
    }

    #[test]
    fn non_array_history_is_empty() {
        assert!(normalize_history(Value::Null).is_empty());
        assert!(normalize_history(json!({"error": "nope"})).is_empty());
    }

    #[test]
    fn kind_for_files() {
        assert_eq!(MessageKind::for_files(&[]), MessageKind::Text);
        assert_eq!(
            MessageKind::for_files(&["https://cdn/a.pdf".to_string()]),
            MessageKind::File
        );
    }
}
