use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        Query, State,
    },
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::{get, post, put},
    serve, Json, Router,
};
use futures::{
    sink::SinkExt,
    stream::{SplitSink, StreamExt},
};
use minijinja::{path_loader, Environment};
use minijinja_autoreload::AutoReloader;
use serde::{Deserialize, Serialize};
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tokio::sync::{broadcast, mpsc};
use tower_http::{services::ServeDir, trace::TraceLayer};
use tracing::{error, info, warn};

use crate::catalog::{Item, Location, QuestionTemplate};
use crate::composer::ComposerState;
use crate::error::ChatError;
use crate::session::{ConversationSession, Message};
use crate::widget::{PendingReply, WidgetHandle, WidgetSnapshot};

// Messages exchanged over the WebSocket, in both directions.
#[derive(Clone, Debug, Serialize, Deserialize)]
struct BroadcastMessage {
    message_type: String,
    #[serde(default)]
    payload: serde_json::Value,
}

impl BroadcastMessage {
    fn new(message_type: &str, payload: impl Serialize) -> Self {
        Self {
            message_type: message_type.to_string(),
            payload: serde_json::to_value(payload).unwrap_or_default(),
        }
    }
}

// Shared application state
#[derive(Clone)]
pub struct AppState {
    templates: Arc<AutoReloader>,
    widget: WidgetHandle,
}

impl AppState {
    pub fn new(widget: WidgetHandle, templates_dir: impl Into<PathBuf>) -> Self {
        Self {
            templates: Arc::new(create_minijinja_env(templates_dir.into())),
            widget,
        }
    }
}

fn create_minijinja_env(templates_dir: PathBuf) -> AutoReloader {
    AutoReloader::new(move |notifier| {
        let mut env = Environment::new();
        env.set_loader(path_loader(&templates_dir));
        notifier.watch_path(&templates_dir, true);
        Ok(env)
    })
}

/// JSON error body: `{"error": "...", "retryable": bool}`.
impl IntoResponse for ChatError {
    fn into_response(self) -> Response {
        let status = match &self {
            ChatError::EmptyMessage => StatusCode::BAD_REQUEST,
            ChatError::UnknownTemplate(_) => StatusCode::NOT_FOUND,
            ChatError::Busy | ChatError::NoConversation => StatusCode::CONFLICT,
            ChatError::SendFailed(_) => StatusCode::BAD_GATEWAY,
            ChatError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
            ChatError::CatalogUnavailable { .. } => StatusCode::SERVICE_UNAVAILABLE,
            ChatError::WidgetClosed => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = serde_json::json!({
            "error": self.to_string(),
            "retryable": self.is_retryable(),
        });
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = std::result::Result<Json<T>, ChatError>;

async fn index_handler(State(state): State<AppState>) -> std::result::Result<Html<String>, Html<String>> {
    let catalog = state.widget.catalog();
    state
        .templates
        .acquire_env()
        .and_then(|env| {
            env.get_template("index.html").and_then(|tmpl| {
                let context = minijinja::context! {
                    title => "Guided chat",
                    templates => &catalog.templates,
                    items => &catalog.items,
                    locations => &catalog.locations,
                    categories => catalog.categories(),
                    location_types => catalog.location_types(),
                    notices => &catalog.notices,
                };
                tmpl.render(context)
            })
        })
        .map(Html)
        .map_err(|e| {
            error!("Failed to get or render template: {}", e);
            Html(format!("Internal Server Error: {}", e))
        })
}

#[derive(Debug, Deserialize)]
struct ItemFilter {
    #[serde(default)]
    category: String,
}

#[derive(Debug, Deserialize)]
struct LocationFilter {
    #[serde(default, rename = "type")]
    kind: String,
}

async fn list_items(State(state): State<AppState>, Query(filter): Query<ItemFilter>) -> Json<Vec<Item>> {
    Json(state.widget.catalog().items_in(&filter.category).cloned().collect())
}

async fn list_locations(
    State(state): State<AppState>,
    Query(filter): Query<LocationFilter>,
) -> Json<Vec<Location>> {
    Json(state.widget.catalog().locations_of(&filter.kind).cloned().collect())
}

async fn list_questions(State(state): State<AppState>) -> Json<Vec<QuestionTemplate>> {
    Json(state.widget.catalog().templates.clone())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CatalogSummary {
    categories: Vec<String>,
    location_types: Vec<String>,
    notices: Vec<String>,
}

async fn catalog_summary(State(state): State<AppState>) -> Json<CatalogSummary> {
    let catalog = state.widget.catalog();
    Json(CatalogSummary {
        categories: catalog.categories().into_iter().map(str::to_string).collect(),
        location_types: catalog.location_types().into_iter().map(str::to_string).collect(),
        notices: catalog.notices.clone(),
    })
}

async fn composer_snapshot(State(state): State<AppState>) -> ApiResult<WidgetSnapshot> {
    Ok(Json(state.widget.snapshot().await?))
}

#[derive(Debug, Deserialize)]
struct TemplateChoice {
    #[serde(default)]
    id: Option<String>,
}

async fn choose_template(
    State(state): State<AppState>,
    Json(choice): Json<TemplateChoice>,
) -> ApiResult<ComposerState> {
    Ok(Json(state.widget.choose_template(choice.id).await?))
}

async fn add_items(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult<ComposerState> {
    Ok(Json(state.widget.add_items(payload).await?))
}

async fn add_locations(
    State(state): State<AppState>,
    Json(payload): Json<serde_json::Value>,
) -> ApiResult<ComposerState> {
    Ok(Json(state.widget.add_locations(payload).await?))
}

#[derive(Debug, Deserialize)]
struct TextEdit {
    text: String,
}

async fn edit_text(State(state): State<AppState>, Json(edit): Json<TextEdit>) -> ApiResult<ComposerState> {
    Ok(Json(state.widget.edit_text(edit.text).await?))
}

async fn reset_composer(State(state): State<AppState>) -> ApiResult<ComposerState> {
    Ok(Json(state.widget.reset().await?))
}

#[derive(Debug, Serialize)]
struct ConversationCreated {
    id: String,
}

async fn new_conversation(State(state): State<AppState>) -> ApiResult<ConversationCreated> {
    let id = state.widget.new_conversation().await?;
    Ok(Json(ConversationCreated { id }))
}

async fn current_conversation(State(state): State<AppState>) -> ApiResult<ConversationSession> {
    Ok(Json(state.widget.snapshot().await?.conversation))
}

async fn send_message(State(state): State<AppState>) -> ApiResult<Message> {
    Ok(Json(state.widget.send().await?))
}

// WebSocket upgrade handler
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket connection upgrade requested");
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn outcome_message(message_type: &str, outcome: crate::error::Result<()>) -> BroadcastMessage {
    match outcome {
        Ok(()) => BroadcastMessage::new("Ack", message_type),
        Err(e) => BroadcastMessage::new(
            "Error",
            serde_json::json!({ "error": e.to_string(), "retryable": e.is_retryable() }),
        ),
    }
}

// Awaits a queued store-bound command off the connection loop.
fn reply_later<T: Send + 'static>(
    replies: &mpsc::Sender<BroadcastMessage>,
    message_type: String,
    pending: PendingReply<T>,
) {
    let replies = replies.clone();
    tokio::spawn(async move {
        let outcome = pending.wait().await.map(|_| ());
        if let Err(e) = &outcome {
            warn!("{} failed: {}", message_type, e);
        }
        let _ = replies.send(outcome_message(&message_type, outcome)).await;
    });
}

/// Apply one client command. Returns the reply when it is known right away;
/// `Send` and `NewConversation` answer later through `replies`.
async fn dispatch(
    widget: &WidgetHandle,
    msg: BroadcastMessage,
    replies: &mpsc::Sender<BroadcastMessage>,
) -> Option<BroadcastMessage> {
    let outcome = match msg.message_type.as_str() {
        "ChooseTemplate" => {
            let template_id = msg.payload.as_str().map(str::to_string);
            widget.choose_template(template_id).await.map(|_| ())
        }
        "AddItems" => widget.add_items(msg.payload).await.map(|_| ()),
        "AddLocations" => widget.add_locations(msg.payload).await.map(|_| ()),
        "EditText" => {
            let text = msg.payload.as_str().unwrap_or_default().to_string();
            widget.edit_text(text).await.map(|_| ())
        }
        "Reset" => widget.reset().await.map(|_| ()),
        "Send" => match widget.queue_send().await {
            Ok(pending) => {
                reply_later(replies, msg.message_type, pending);
                return None;
            }
            Err(e) => Err(e),
        },
        "NewConversation" => match widget.queue_new_conversation().await {
            Ok(pending) => {
                reply_later(replies, msg.message_type, pending);
                return None;
            }
            Err(e) => Err(e),
        },
        other => {
            warn!("Unknown WebSocket message type: {}", other);
            return Some(BroadcastMessage::new("Error", format!("Unknown message type: {}", other)));
        }
    };
    Some(outcome_message(&msg.message_type, outcome))
}

async fn send_json(sender: &mut SplitSink<WebSocket, WsMessage>, message: &BroadcastMessage) -> bool {
    match serde_json::to_string(message) {
        Ok(json_msg) => sender.send(WsMessage::Text(json_msg)).await.is_ok(),
        Err(e) => {
            error!("Failed to serialize {} message: {}", message.message_type, e);
            true
        }
    }
}

// Each connection receives every snapshot and may drive the widget with
// `{"message_type": "AddItems", "payload": [...]}` style messages.
async fn handle_socket(socket: WebSocket, state: AppState) {
    info!("New WebSocket connection established");
    let mut updates = state.widget.subscribe();
    let (mut sender, mut receiver) = socket.split();
    let (replies_tx, mut replies_rx) = mpsc::channel::<BroadcastMessage>(16);

    match state.widget.snapshot().await {
        Ok(snapshot) => {
            if !send_json(&mut sender, &BroadcastMessage::new("Snapshot", snapshot)).await {
                warn!("Failed to send initial snapshot to new WebSocket client");
                return;
            }
        }
        Err(e) => {
            error!("Widget unavailable for WebSocket client: {}", e);
            return;
        }
    }

    loop {
        let outgoing = tokio::select! {
            update = updates.recv() => match update {
                Ok(snapshot) => BroadcastMessage::new("Snapshot", snapshot),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    // The next snapshot supersedes the missed ones.
                    warn!("WebSocket client lagged by {} snapshots", skipped);
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => {
                    info!("Widget stopped; closing WebSocket");
                    break;
                }
            },

            Some(reply) = replies_rx.recv() => reply,

            incoming = receiver.next() => match incoming {
                Some(Ok(WsMessage::Text(text))) => {
                    let reply = match serde_json::from_str::<BroadcastMessage>(&text) {
                        Ok(command) => dispatch(&state.widget, command, &replies_tx).await,
                        Err(e) => Some(BroadcastMessage::new("Error", format!("Malformed message: {}", e))),
                    };
                    match reply {
                        Some(reply) => reply,
                        None => continue,
                    }
                }
                Some(Ok(WsMessage::Binary(_))) => {
                    warn!("Received unexpected binary message from client");
                    continue;
                }
                Some(Ok(WsMessage::Ping(_) | WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(_))) => {
                    info!("Client requested WebSocket close");
                    break;
                }
                Some(Err(e)) => {
                    warn!("WebSocket receive error: {}", e);
                    break;
                }
                None => {
                    info!("WebSocket client disconnected");
                    break;
                }
            },
        };

        if !send_json(&mut sender, &outgoing).await {
            warn!("WebSocket client disconnected or send error. Closing connection.");
            break;
        }
    }
    info!("WebSocket connection closed");
}

pub fn router(state: AppState, static_dir: impl Into<PathBuf>) -> Router {
    let static_files_service = ServeDir::new(static_dir.into()).not_found_service(tower::service_fn(|_| async {
        Ok::<_, std::convert::Infallible>((hyper::StatusCode::NOT_FOUND, "Not Found").into_response())
    }));

    Router::new()
        .route("/", get(index_handler))
        .route("/api/catalog", get(catalog_summary))
        .route("/api/items", get(list_items))
        .route("/api/locations", get(list_locations))
        .route("/api/questions", get(list_questions))
        .route("/api/composer", get(composer_snapshot))
        .route("/api/composer/template", post(choose_template))
        .route("/api/composer/items", post(add_items))
        .route("/api/composer/locations", post(add_locations))
        .route("/api/composer/text", put(edit_text))
        .route("/api/composer/reset", post(reset_composer))
        .route("/api/conversations", post(new_conversation))
        .route("/api/conversations/current", get(current_conversation))
        .route("/api/messages", post(send_message))
        .route("/ws", get(ws_handler))
        .nest_service("/static", static_files_service)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

pub async fn start_web_server(port: u16, state: AppState, static_dir: PathBuf) -> Result<()> {
    let app = router(state, static_dir);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!("Web server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context(format!("Failed to bind to address {}", addr))?;

    serve(listener, app.into_make_service())
        .await
        .context("Web server failed")?;

    Ok(())
}
