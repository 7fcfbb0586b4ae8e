use thiserror::Error;

/// Errors surfaced by the catalog, composer and conversation layers.
///
/// None of these are fatal: the widget stays interactive after any of them.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("{catalog} catalog unavailable: {reason}")]
    CatalogUnavailable { catalog: &'static str, reason: String },

    #[error("Failed to send message: {0}")]
    SendFailed(String),

    #[error("{0} timed out")]
    Timeout(String),

    #[error("A message is already being sent")]
    Busy,

    #[error("Cannot send an empty message")]
    EmptyMessage,

    #[error("No active conversation")]
    NoConversation,

    #[error("Unknown question template: {0}")]
    UnknownTemplate(String),

    #[error("Chat widget is no longer running")]
    WidgetClosed,
}

impl ChatError {
    pub fn catalog(catalog: &'static str, reason: impl ToString) -> Self {
        ChatError::CatalogUnavailable {
            catalog,
            reason: reason.to_string(),
        }
    }

    /// Whether repeating the same request may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChatError::SendFailed(_) | ChatError::Timeout(_))
    }
}

pub type Result<T> = std::result::Result<T, ChatError>;
