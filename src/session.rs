//! Conversation session: the conversation id and its message log. Durability
//! is delegated to a [`ConversationStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tracing::{debug, error, info, instrument};
use uuid::Uuid;

use crate::constants::ACKNOWLEDGEMENT;
use crate::error::{ChatError, Result};

pub type ConversationId = String;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: String,
    pub content: String,
    pub is_user_message: bool,
    pub created_at: DateTime<Utc>,
    pub conversation_id: ConversationId,
}

/// A message as acknowledged by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredMessage {
    pub id: String,
    pub content: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub conversation_id: ConversationId,
}

#[derive(Debug, Deserialize)]
struct CreatedConversation {
    id: ConversationId,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PostMessage<'a> {
    content: &'a str,
    conversation_id: &'a str,
}

/// External conversation/message store.
#[async_trait]
pub trait ConversationStore: Send + Sync {
    async fn create(&self) -> Result<ConversationId>;
    async fn post(&self, conversation_id: &str, content: &str) -> Result<StoredMessage>;
}

/// Store reached over HTTP: `POST {base}/conversations` and `POST {base}/messages`.
#[derive(Debug, Clone)]
pub struct HttpConversationStore {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpConversationStore {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Self {
        Self {
            client: Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout,
        }
    }

    fn request_error(what: &str, e: reqwest::Error) -> ChatError {
        if e.is_timeout() {
            ChatError::Timeout(what.to_string())
        } else {
            ChatError::SendFailed(format!("{}: {}", what, e))
        }
    }
}

#[async_trait]
impl ConversationStore for HttpConversationStore {
    #[instrument(skip(self))]
    async fn create(&self) -> Result<ConversationId> {
        let url = format!("{}/conversations", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .send()
            .await
            .map_err(|e| Self::request_error("POST /conversations", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            error!(%status, %error_body, "Conversation store rejected new conversation");
            return Err(ChatError::SendFailed(format!(
                "creating conversation failed with status {}",
                status
            )));
        }

        let created = response
            .json::<CreatedConversation>()
            .await
            .map_err(|e| ChatError::SendFailed(format!("malformed conversation response: {}", e)))?;
        Ok(created.id)
    }

    #[instrument(skip(self, content))]
    async fn post(&self, conversation_id: &str, content: &str) -> Result<StoredMessage> {
        let url = format!("{}/messages", self.base_url);
        let response = self
            .client
            .post(&url)
            .timeout(self.timeout)
            .json(&PostMessage {
                content,
                conversation_id,
            })
            .send()
            .await
            .map_err(|e| Self::request_error("POST /messages", e))?;

        if !response.status().is_success() {
            let status = response.status();
            let error_body = response.text().await.unwrap_or_default();
            error!(%status, %error_body, "Conversation store rejected message");
            return Err(ChatError::SendFailed(format!("status {}", status)));
        }

        let mut stored = response
            .json::<StoredMessage>()
            .await
            .map_err(|e| ChatError::SendFailed(format!("malformed message response: {}", e)))?;
        if stored.conversation_id.is_empty() {
            stored.conversation_id = conversation_id.to_string();
        }
        Ok(stored)
    }
}

/// Process-local store, used when no store URL is configured.
#[derive(Debug, Clone, Default)]
pub struct InMemoryConversationStore {
    conversations: Arc<RwLock<HashMap<ConversationId, Vec<StoredMessage>>>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn messages(&self, conversation_id: &str) -> Vec<StoredMessage> {
        let conversations = self.conversations.read().await;
        conversations.get(conversation_id).cloned().unwrap_or_default()
    }
}

#[async_trait]
impl ConversationStore for InMemoryConversationStore {
    async fn create(&self) -> Result<ConversationId> {
        let id = Uuid::new_v4().to_string();
        self.conversations.write().await.insert(id.clone(), Vec::new());
        Ok(id)
    }

    async fn post(&self, conversation_id: &str, content: &str) -> Result<StoredMessage> {
        let mut conversations = self.conversations.write().await;
        let log = conversations
            .get_mut(conversation_id)
            .ok_or_else(|| ChatError::SendFailed(format!("unknown conversation {}", conversation_id)))?;
        let stored = StoredMessage {
            id: Uuid::new_v4().to_string(),
            content: content.to_string(),
            created_at: Utc::now(),
            conversation_id: conversation_id.to_string(),
        };
        log.push(stored.clone());
        Ok(stored)
    }
}

/// One chat's conversation id and ordered message log.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ConversationSession {
    pub id: Option<ConversationId>,
    pub messages: Vec<Message>,
}

impl ConversationSession {
    /// Open a new conversation in `store`.
    pub async fn start(store: &dyn ConversationStore) -> Result<Self> {
        let id = store.create().await?;
        info!("Started conversation {}", id);
        Ok(Self::with_id(id))
    }

    pub fn with_id(id: ConversationId) -> Self {
        Self {
            id: Some(id),
            messages: Vec::new(),
        }
    }

    pub fn has_conversation(&self) -> bool {
        self.id.is_some()
    }

    /// Post `content` and record the exchange. Nothing is appended on failure.
    pub async fn send(&mut self, store: &dyn ConversationStore, content: &str) -> Result<Message> {
        let id = self.id.clone().ok_or(ChatError::NoConversation)?;
        if content.trim().is_empty() {
            return Err(ChatError::EmptyMessage);
        }
        let stored = store.post(&id, content).await?;
        Ok(self.record_exchange(stored))
    }

    /// Append a stored user message followed by the acknowledgement.
    ///
    /// Returns the user message. Messages for another conversation are
    /// not appended.
    pub fn record_exchange(&mut self, stored: StoredMessage) -> Message {
        let user = Message {
            id: stored.id,
            content: stored.content,
            is_user_message: true,
            created_at: stored.created_at,
            conversation_id: stored.conversation_id,
        };
        if self.id.as_deref() != Some(user.conversation_id.as_str()) {
            debug!(
                "Dropping reply for conversation {} (current: {:?})",
                user.conversation_id, self.id
            );
            return user;
        }
        let acknowledgement = Message {
            id: format!("{}-bot", user.id),
            content: ACKNOWLEDGEMENT.to_string(),
            is_user_message: false,
            created_at: Utc::now(),
            conversation_id: user.conversation_id.clone(),
        };
        self.messages.push(user.clone());
        self.messages.push(acknowledgement);
        user
    }
}
