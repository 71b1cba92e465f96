use std::path::Path;
use std::sync::Arc;

use chrono::Utc;
use log::{debug, error, info, warn};

use crate::api::client::ChatDirectory;
use crate::api::models::{Conversation, ConversationKind, Identity, Message, UserSummary};
use crate::error::ApiError;
use crate::store::{self, SharedStore};

pub struct ConversationSync {
    directory: Arc<dyn ChatDirectory>,
    store: SharedStore,
}

impl ConversationSync {
    pub fn new(directory: Arc<dyn ChatDirectory>, store: SharedStore) -> Self {
        Self { directory, store }
    }

    /// Fetch the conversation list and each conversation's history, then make
    /// the first conversation active. If the list cannot be fetched, what the
    /// store already holds is left alone.
    pub async fn load_conversations(&self, me: &Identity) -> Result<usize, ApiError> {
        let fetched = self.directory.conversations().await.inspect_err(|e| {
            error!("Failed to load conversations: {}", e);
        })?;
        info!("Loaded {} conversations", fetched.len());

        let conversations = {
            let mut guard = store::lock(&self.store);
            if !fetched.is_empty() {
                guard.set_conversations(fetched);
            }
            guard.conversations().to_vec()
        };

        for conv in &conversations {
            let history = self.history_for(me, conv).await;
            store::lock(&self.store).set_messages(&conv.id, history);
        }

        if let Some(first) = conversations.first() {
            store::lock(&self.store).set_active_conversation(Some(first.id.clone()));
        }
        Ok(conversations.len())
    }

    async fn history_for(&self, me: &Identity, conv: &Conversation) -> Vec<Message> {
        let result = match conv.kind {
            ConversationKind::Dm => match conv.other_participant(&me.user_id) {
                Some(other) => self.directory.dm_history(other).await,
                None => Ok(Vec::new()),
            },
            ConversationKind::Group => self.directory.group_history(&conv.id).await,
        };
        result.unwrap_or_else(|e| {
            warn!("Failed to load messages for {}: {}", conv.id, e);
            Vec::new()
        })
    }

    /// Open (or reuse) the direct conversation with `peer` and make it
    /// active. When the server cannot create one, a local conversation stands
    /// in for it.
    pub async fn open_direct_conversation(&self, me: &Identity, peer: &UserSummary) -> String {
        let conversation = match self.directory.create_dm_conversation(&peer.email).await {
            Ok(conv) => conv,
            Err(e) => {
                warn!("Could not create conversation with {} on the server: {}", peer.email, e);
                let now = Utc::now();
                Conversation {
                    id: format!("dm-{}", now.timestamp_millis()),
                    kind: ConversationKind::Dm,
                    name: peer.short_name(),
                    participants: vec![me.user_id.clone(), peer.id.clone()],
                    is_online: peer.is_online,
                    last_message: None,
                    last_message_time: now,
                    unread_count: 0,
                }
            }
        };

        let mut guard = store::lock(&self.store);
        let id = guard.add_conversation(conversation);
        guard.set_active_conversation(Some(id.clone()));
        info!("Opened conversation {}", id);
        id
    }

    pub async fn delete_conversation(&self, conversation_id: &str) -> Result<(), ApiError> {
        self.directory.delete_conversation(conversation_id).await?;
        store::lock(&self.store).remove_conversation(conversation_id);
        info!("Deleted conversation {}", conversation_id);
        Ok(())
    }

    /// Mark direct conversations whose peer is currently connected.
    pub async fn refresh_presence(&self, me: &Identity) -> Result<usize, ApiError> {
        let online = self.directory.presence().await?;
        let changed = store::lock(&self.store).apply_presence(&me.user_id, &online);
        debug!("{} users online, {} conversations changed", online.len(), changed);
        Ok(online.len())
    }

    /// Upload a file and return the url to reference it by in a message.
    pub async fn upload_attachment(&self, path: &Path) -> Result<String, ApiError> {
        let uploaded = self.directory.upload_file(path).await.inspect_err(|e| {
            error!("Upload of {} failed: {}", path.display(), e);
        })?;
        info!("Uploaded {} as {}", path.display(), uploaded.url);
        Ok(uploaded.url)
    }

    /// Search for people to start a chat with: never ourselves, and nobody
    /// we already have a direct conversation with.
    pub async fn search_users(&self, me: &Identity, query: &str) -> Result<Vec<UserSummary>, ApiError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let found = self.directory.search_users(query).await?;
        let guard = store::lock(&self.store);
        Ok(found
            .into_iter()
            .filter(|u| u.id != me.user_id && me.email.as_deref() != Some(u.email.as_str()))
            .filter(|u| guard.find_dm_with(&u.id).is_none())
            .collect())
    }
}
