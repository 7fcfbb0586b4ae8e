pub mod catalog;
pub mod chat;
pub mod composer;
pub mod constants;
pub mod error;
pub mod selection;
pub mod session;
pub mod template;
pub mod web_server;
pub mod widget;

pub use catalog::{Catalog, CatalogSource, CsvCatalog, HttpCatalog, Item, Location, QuestionTemplate};
pub use composer::{Composer, ComposerState, ComposerText, Phase, Requirement};
pub use error::{ChatError, Result};
pub use selection::SelectionSet;
pub use session::{
    ConversationSession, ConversationStore, HttpConversationStore, InMemoryConversationStore, Message,
    StoredMessage,
};
pub use template::{render, Placeholders};
pub use widget::{PendingReply, WidgetConfig, WidgetHandle, WidgetSnapshot};
