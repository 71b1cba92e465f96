use std::sync::Arc;

use log::{error, info};
use tokio::sync::mpsc;

use crate::api::client::ChatDirectory;
use crate::api::events::GroupNotice;
use crate::api::models::Conversation;
use crate::error::ApiError;
use crate::session::LoopEvent;
use crate::store::{self, SharedStore};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupEvent {
    Created,
    Joined,
}

/// Refreshes the conversation list when the server confirms a group change.
/// The fetch runs off the loop; its result comes back as
/// `LoopEvent::ConversationsRefreshed` and is applied in order with
/// everything else.
pub struct GroupLifecycleHandler {
    directory: Arc<dyn ChatDirectory>,
    store: SharedStore,
}

impl GroupLifecycleHandler {
    pub fn new(directory: Arc<dyn ChatDirectory>, store: SharedStore) -> Self {
        Self { directory, store }
    }

    pub fn on_notice(
        &self,
        event: GroupEvent,
        notice: &GroupNotice,
        epoch: u64,
        events: &mpsc::UnboundedSender<LoopEvent>,
    ) {
        info!(
            "Group {:?}: {}",
            event,
            notice.group_id.as_deref().unwrap_or("<unknown>")
        );
        let directory = Arc::clone(&self.directory);
        let tx = events.clone();
        tokio::spawn(async move {
            let result = directory.conversations().await;
            let _ = tx.send(LoopEvent::ConversationsRefreshed { epoch, result });
        });
    }

    /// Replace the conversation list wholesale. Failures are logged and
    /// leave the store untouched; nothing is retried here.
    pub fn apply_refresh(&self, result: Result<Vec<Conversation>, ApiError>) -> bool {
        match result {
            Ok(conversations) => {
                info!("Refetched {} conversations after group change", conversations.len());
                store::lock(&self.store).set_conversations(conversations);
                true
            }
            Err(e) => {
                error!("Failed to refetch conversations after group change: {}", e);
                false
            }
        }
    }
}
