//! One chat widget instance as an actor.
//!
//! A single task owns the [`Composer`] and the [`ConversationSession`]; every
//! user interaction and every completion of a store call is funneled through
//! its command queue, so a render always sees a consistent
//! template/items/locations triple. Store calls run in spawned tasks and post
//! their result back into the same queue.

use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::catalog::Catalog;
use crate::composer::{Composer, ComposerState, Requirement};
use crate::constants;
use crate::error::{ChatError, Result};
use crate::session::{ConversationId, ConversationSession, ConversationStore, Message, StoredMessage};
use crate::template::Placeholders;

#[derive(Debug, Clone)]
pub struct WidgetConfig {
    pub placeholders: Placeholders,
    /// Pause before a successful send is recorded, shown to users as "typing".
    pub reply_delay: Duration,
    /// Upper bound for each conversation store call.
    pub request_timeout: Duration,
}

impl Default for WidgetConfig {
    fn default() -> Self {
        Self {
            placeholders: Placeholders::default(),
            reply_delay: *constants::REPLY_DELAY,
            request_timeout: *constants::REQUEST_TIMEOUT,
        }
    }
}

/// Everything a host UI needs to draw the widget.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct WidgetSnapshot {
    pub composer: ComposerState,
    pub pending_requirements: Vec<Requirement>,
    pub conversation: ConversationSession,
    /// User message being delivered to the current conversation, shown
    /// ahead of the log until the store answers.
    pub pending_message: Option<String>,
    /// Catalog lists that could not be loaded.
    pub notices: Vec<String>,
}

enum WidgetCommand {
    ChooseTemplate {
        template_id: Option<String>,
        reply: oneshot::Sender<Result<ComposerState>>,
    },
    AddItems {
        payload: serde_json::Value,
        reply: oneshot::Sender<ComposerState>,
    },
    AddLocations {
        payload: serde_json::Value,
        reply: oneshot::Sender<ComposerState>,
    },
    EditText {
        text: String,
        reply: oneshot::Sender<ComposerState>,
    },
    Reset {
        reply: oneshot::Sender<ComposerState>,
    },
    Send {
        reply: oneshot::Sender<Result<Message>>,
    },
    NewConversation {
        reply: oneshot::Sender<Result<ConversationId>>,
    },
    Snapshot {
        reply: oneshot::Sender<WidgetSnapshot>,
    },
    SendFinished {
        result: Result<StoredMessage>,
        reply: oneshot::Sender<Result<Message>>,
    },
    ConversationStarted {
        result: Result<ConversationId>,
        reply: oneshot::Sender<Result<ConversationId>>,
    },
}

struct Widget {
    composer: Composer,
    session: ConversationSession,
    catalog: Arc<Catalog>,
    store: Arc<dyn ConversationStore>,
    config: WidgetConfig,
    commands: mpsc::WeakSender<WidgetCommand>,
    updates: broadcast::Sender<WidgetSnapshot>,
    in_flight: Option<InFlight>,
}

/// The message a running send is delivering.
struct InFlight {
    conversation_id: ConversationId,
    content: String,
}

impl Widget {
    async fn run(mut self, mut rx: mpsc::Receiver<WidgetCommand>) {
        info!("Chat widget started");
        while let Some(command) = rx.recv().await {
            self.handle(command);
        }
        info!("Chat widget stopped");
    }

    fn handle(&mut self, command: WidgetCommand) {
        match command {
            WidgetCommand::ChooseTemplate { template_id, reply } => {
                let result = match template_id {
                    None => {
                        self.composer.choose_template(None);
                        Ok(self.composer.state())
                    }
                    Some(id) => match self.catalog.template(&id) {
                        Some(template) => {
                            self.composer.choose_template(Some(template.clone()));
                            Ok(self.composer.state())
                        }
                        None => Err(ChatError::UnknownTemplate(id)),
                    },
                };
                let _ = reply.send(result);
            }
            WidgetCommand::AddItems { payload, reply } => {
                self.composer.add_items_payload(&payload);
                let _ = reply.send(self.composer.state());
            }
            WidgetCommand::AddLocations { payload, reply } => {
                self.composer.add_locations_payload(&payload);
                let _ = reply.send(self.composer.state());
            }
            WidgetCommand::EditText { text, reply } => {
                self.composer.edit_text(text);
                let _ = reply.send(self.composer.state());
            }
            WidgetCommand::Reset { reply } => {
                self.composer.reset();
                let _ = reply.send(self.composer.state());
            }
            WidgetCommand::Send { reply } => self.begin_send(reply),
            WidgetCommand::NewConversation { reply } => self.begin_new_conversation(reply),
            WidgetCommand::Snapshot { reply } => {
                let _ = reply.send(self.snapshot());
                return;
            }
            WidgetCommand::SendFinished { result, reply } => {
                self.in_flight = None;
                self.composer.finish_send(result.is_ok());
                let outcome = result.map(|stored| self.session.record_exchange(stored));
                if let Err(e) = &outcome {
                    warn!("Send failed: {}", e);
                }
                let _ = reply.send(outcome);
            }
            WidgetCommand::ConversationStarted { result, reply } => {
                match &result {
                    Ok(id) => {
                        // Replaced wholesale; replies still in flight for the
                        // old conversation are dropped when they arrive.
                        self.session = ConversationSession::with_id(id.clone());
                        info!("Conversation {} is now active", id);
                    }
                    Err(e) => warn!("Could not start conversation: {}", e),
                }
                let _ = reply.send(result);
            }
        }
        self.publish();
    }

    fn begin_send(&mut self, reply: oneshot::Sender<Result<Message>>) {
        let ticket = match self.composer.begin_send(self.session.has_conversation()) {
            Ok(ticket) => ticket,
            Err(e) => {
                debug!("Send rejected: {}", e);
                let _ = reply.send(Err(e));
                return;
            }
        };
        let (Some(conversation_id), Some(commands)) = (self.session.id.clone(), self.commands.upgrade())
        else {
            self.composer.finish_send(false);
            let _ = reply.send(Err(ChatError::NoConversation));
            return;
        };

        self.in_flight = Some(InFlight {
            conversation_id: conversation_id.clone(),
            content: ticket.content.clone(),
        });
        let store = self.store.clone();
        let limit = self.config.request_timeout;
        let delay = self.config.reply_delay;
        tokio::spawn(async move {
            let result = match timeout(limit, store.post(&conversation_id, &ticket.content)).await {
                Ok(result) => result,
                Err(_) => Err(ChatError::Timeout("sending message".to_string())),
            };
            if result.is_ok() && !delay.is_zero() {
                tokio::time::sleep(delay).await;
            }
            let _ = commands.send(WidgetCommand::SendFinished { result, reply }).await;
        });
    }

    fn begin_new_conversation(&mut self, reply: oneshot::Sender<Result<ConversationId>>) {
        let Some(commands) = self.commands.upgrade() else {
            let _ = reply.send(Err(ChatError::WidgetClosed));
            return;
        };
        let store = self.store.clone();
        let limit = self.config.request_timeout;
        tokio::spawn(async move {
            let result = match timeout(limit, store.create()).await {
                Ok(result) => result,
                Err(_) => Err(ChatError::Timeout("creating conversation".to_string())),
            };
            let _ = commands
                .send(WidgetCommand::ConversationStarted { result, reply })
                .await;
        });
    }

    fn snapshot(&self) -> WidgetSnapshot {
        WidgetSnapshot {
            composer: self.composer.state(),
            pending_requirements: self.composer.pending_requirements(),
            pending_message: self
                .in_flight
                .as_ref()
                .filter(|sending| self.session.id.as_deref() == Some(sending.conversation_id.as_str()))
                .map(|sending| sending.content.clone()),
            conversation: self.session.clone(),
            notices: self.catalog.notices.clone(),
        }
    }

    fn publish(&self) {
        // No subscribers is fine.
        let _ = self.updates.send(self.snapshot());
    }
}

/// Cloneable handle to a running widget.
#[derive(Clone)]
pub struct WidgetHandle {
    commands: mpsc::Sender<WidgetCommand>,
    updates: broadcast::Sender<WidgetSnapshot>,
    catalog: Arc<Catalog>,
}

impl WidgetHandle {
    /// Start a widget task. No conversation is open until
    /// [`new_conversation`](Self::new_conversation) succeeds.
    pub fn spawn(catalog: Catalog, store: Arc<dyn ConversationStore>, config: WidgetConfig) -> Self {
        let (tx, rx) = mpsc::channel(64);
        let (updates, _) = broadcast::channel(100);
        let catalog = Arc::new(catalog);

        let widget = Widget {
            composer: Composer::new(config.placeholders.clone()),
            session: ConversationSession::default(),
            catalog: catalog.clone(),
            store,
            config,
            commands: tx.downgrade(),
            updates: updates.clone(),
            in_flight: None,
        };
        tokio::spawn(widget.run(rx));

        Self {
            commands: tx,
            updates,
            catalog,
        }
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Snapshots published after every change.
    pub fn subscribe(&self) -> broadcast::Receiver<WidgetSnapshot> {
        self.updates.subscribe()
    }

    async fn enqueue<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> WidgetCommand,
    ) -> Result<oneshot::Receiver<T>> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(command(reply))
            .await
            .map_err(|_| ChatError::WidgetClosed)?;
        Ok(rx)
    }

    async fn request<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> WidgetCommand,
    ) -> Result<T> {
        self.enqueue(command)
            .await?
            .await
            .map_err(|_| ChatError::WidgetClosed)
    }

    /// Activate the template with `template_id`, or clear it with `None`.
    pub async fn choose_template(&self, template_id: Option<String>) -> Result<ComposerState> {
        self.request(|reply| WidgetCommand::ChooseTemplate { template_id, reply })
            .await?
    }

    pub async fn add_items(&self, payload: serde_json::Value) -> Result<ComposerState> {
        self.request(|reply| WidgetCommand::AddItems { payload, reply }).await
    }

    pub async fn add_locations(&self, payload: serde_json::Value) -> Result<ComposerState> {
        self.request(|reply| WidgetCommand::AddLocations { payload, reply }).await
    }

    pub async fn edit_text(&self, text: impl Into<String>) -> Result<ComposerState> {
        let text = text.into();
        self.request(|reply| WidgetCommand::EditText { text, reply }).await
    }

    pub async fn reset(&self) -> Result<ComposerState> {
        self.request(|reply| WidgetCommand::Reset { reply }).await
    }

    /// Send the current text. Resolves once the store has answered.
    pub async fn send(&self) -> Result<Message> {
        self.queue_send().await?.wait().await
    }

    /// Queue a send behind the commands already issued and return without
    /// waiting for the store.
    pub async fn queue_send(&self) -> Result<PendingReply<Message>> {
        let rx = self.enqueue(|reply| WidgetCommand::Send { reply }).await?;
        Ok(PendingReply(rx))
    }

    /// Open a new conversation, replacing the current one.
    pub async fn new_conversation(&self) -> Result<ConversationId> {
        self.queue_new_conversation().await?.wait().await
    }

    pub async fn queue_new_conversation(&self) -> Result<PendingReply<ConversationId>> {
        let rx = self.enqueue(|reply| WidgetCommand::NewConversation { reply }).await?;
        Ok(PendingReply(rx))
    }

    pub async fn snapshot(&self) -> Result<WidgetSnapshot> {
        self.request(|reply| WidgetCommand::Snapshot { reply }).await
    }
}

/// Outcome of a queued command that waits on the conversation store.
pub struct PendingReply<T>(oneshot::Receiver<Result<T>>);

impl<T> PendingReply<T> {
    pub async fn wait(self) -> Result<T> {
        self.0.await.map_err(|_| ChatError::WidgetClosed)?
    }
}
