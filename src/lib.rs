pub mod api;
pub mod app;
pub mod auth;
pub mod error;
pub mod session;
pub mod storage;
pub mod store;
pub mod sync;
pub mod utils;

pub use api::models::{Conversation, ConversationKind, Identity, Message, MessageDraft, MessageStatus};
pub use error::{ApiError, SendError};
pub use session::state::{ConnectionStatus, SessionSettings};
pub use session::{SessionHandle, SessionManager, SessionNotice};
pub use store::{ConversationStore, SharedStore};
