use async_trait::async_trait;
use axum::http::StatusCode;
use axum_test::{TestServer, TestServerConfig, TestWebSocket};
use guidechat::catalog::{Catalog, CsvCatalog, Item, Location, QuestionTemplate};
use guidechat::error::Result;
use guidechat::session::{ConversationId, ConversationStore, InMemoryConversationStore, Message, StoredMessage};
use guidechat::template::Placeholders;
use guidechat::web_server::{router, AppState};
use guidechat::widget::{WidgetConfig, WidgetHandle};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::timeout;

async fn spawn_widget(store: Arc<dyn ConversationStore>) -> WidgetHandle {
    // The bundled data directory doubles as a fixture.
    let catalog = Catalog::load(&CsvCatalog::new("data")).await;
    let config = WidgetConfig {
        placeholders: Placeholders::braced(),
        reply_delay: Duration::ZERO,
        request_timeout: Duration::from_secs(5),
    };
    WidgetHandle::spawn(catalog, store, config)
}

async fn test_server() -> TestServer {
    let widget = spawn_widget(Arc::new(InMemoryConversationStore::new())).await;
    TestServer::new(router(AppState::new(widget, "templates"), "static")).unwrap()
}

/// WebSocket upgrades need a real HTTP transport.
fn ws_server(widget: WidgetHandle) -> TestServer {
    TestServerConfig::builder()
        .http_transport()
        .build_server(router(AppState::new(widget, "templates"), "static"))
        .unwrap()
}

async fn connect(server: &TestServer) -> TestWebSocket {
    server.get_websocket("/ws").await.into_websocket().await
}

/// Read frames until one of `message_type` arrives, skipping the rest.
async fn next_of_type(ws: &mut TestWebSocket, message_type: &str) -> Value {
    timeout(Duration::from_secs(5), async {
        loop {
            let frame: Value = ws.receive_json().await;
            if frame["message_type"] == message_type {
                return frame;
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("no {} frame arrived", message_type))
}

/// Read snapshots until one satisfies `check`.
async fn snapshot_where(ws: &mut TestWebSocket, check: impl Fn(&Value) -> bool) -> Value {
    timeout(Duration::from_secs(5), async {
        loop {
            let frame = next_of_type(ws, "Snapshot").await;
            if check(&frame["payload"]) {
                return frame["payload"].clone();
            }
        }
    })
    .await
    .expect("no matching snapshot arrived")
}

/// Holds every post until the test opens the gate.
struct GatedStore {
    inner: InMemoryConversationStore,
    gate: Arc<Notify>,
}

#[async_trait]
impl ConversationStore for GatedStore {
    async fn create(&self) -> Result<ConversationId> {
        self.inner.create().await
    }

    async fn post(&self, conversation_id: &str, content: &str) -> Result<StoredMessage> {
        self.gate.notified().await;
        self.inner.post(conversation_id, content).await
    }
}

#[tokio::test]
async fn test_catalog_lists_and_filters() {
    let server = test_server().await;

    let items: Vec<Item> = server.get("/api/items").await.json();
    assert!(items.len() >= 3);

    let lighting: Vec<Item> = server
        .get("/api/items")
        .add_query_param("category", "Lighting")
        .await
        .json();
    assert!(!lighting.is_empty());
    assert!(lighting.iter().all(|item| item.category == "Lighting"));

    let rooms: Vec<Location> = server
        .get("/api/locations")
        .add_query_param("type", "Room")
        .await
        .json();
    assert!(!rooms.is_empty());
    assert!(rooms.iter().all(|location| location.kind == "Room"));

    let templates: Vec<QuestionTemplate> = server.get("/api/questions").await.json();
    assert!(templates.iter().any(|t| t.id == "which-at"));

    let summary: Value = server.get("/api/catalog").await.json();
    assert!(summary["notices"].as_array().unwrap().is_empty());
    assert!(summary["categories"].as_array().unwrap().len() >= 2);
}

#[tokio::test]
async fn test_compose_and_send_over_http() {
    let server = test_server().await;

    let created: Value = server.post("/api/conversations").await.json();
    let conversation_id = created["id"].as_str().unwrap().to_string();

    server
        .post("/api/composer/template")
        .json(&json!({ "id": "which-at" }))
        .await
        .assert_status_ok();
    server
        .post("/api/composer/items")
        .json(&json!(["Lamp", "Chair"]))
        .await
        .assert_status_ok();
    let state: Value = server
        .post("/api/composer/locations")
        .json(&json!(["Kitchen"]))
        .await
        .json();
    assert_eq!(state["phase"], "Composing");
    assert_eq!(state["text"]["source"], "derived");
    let text = state["text"]["text"].as_str().unwrap().to_string();
    assert!(text.contains("Lamp; Chair"));
    assert!(text.contains("Kitchen"));

    let sent: Message = server.post("/api/messages").await.json();
    assert_eq!(sent.content, text);
    assert_eq!(sent.conversation_id, conversation_id);

    let conversation: Value = server.get("/api/conversations/current").await.json();
    let messages = conversation["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0]["isUserMessage"], true);
    assert_eq!(messages[1]["isUserMessage"], false);

    let snapshot: Value = server.get("/api/composer").await.json();
    assert_eq!(snapshot["composer"]["phase"], "Idle");
    assert_eq!(snapshot["composer"]["text"]["text"], "");
}

#[tokio::test]
async fn test_send_errors_map_to_statuses() {
    let server = test_server().await;

    let response = server.post("/api/messages").await;
    response.assert_status(StatusCode::CONFLICT);
    let body: Value = response.json();
    assert_eq!(body["retryable"], false);

    server.post("/api/conversations").await.assert_status_ok();
    let response = server.post("/api/messages").await;
    response.assert_status(StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_unknown_template_is_not_found() {
    let server = test_server().await;
    let response = server
        .post("/api/composer/template")
        .json(&json!({ "id": "no-such-question" }))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_manual_edit_is_sent_verbatim() {
    let server = test_server().await;
    server.post("/api/conversations").await.assert_status_ok();

    let state: Value = server
        .put("/api/composer/text")
        .json(&json!({ "text": "Is the parking open at night?" }))
        .await
        .json();
    assert_eq!(state["text"]["source"], "edited");

    let sent: Message = server.post("/api/messages").await.json();
    assert_eq!(sent.content, "Is the parking open at night?");
}

#[tokio::test]
async fn test_reset_clears_composer() {
    let server = test_server().await;
    server
        .post("/api/composer/template")
        .json(&json!({ "id": "where-is" }))
        .await
        .assert_status_ok();
    server
        .post("/api/composer/items")
        .json(&json!(["Lamp"]))
        .await
        .assert_status_ok();

    let state: Value = server.post("/api/composer/reset").await.json();
    assert_eq!(state["phase"], "Idle");
    assert!(state["activeTemplate"].is_null());
    assert!(state["items"].as_array().unwrap().is_empty());
}

#[tokio::test]
async fn test_static_files_and_missing_files() {
    let server = test_server().await;
    server.get("/static/chat.js").await.assert_status_ok();
    server
        .get("/static/missing.js")
        .await
        .assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_ws_sends_snapshot_then_acks_commands() {
    let widget = spawn_widget(Arc::new(InMemoryConversationStore::new())).await;
    let server = ws_server(widget.clone());
    let mut ws = connect(&server).await;

    let first: Value = timeout(Duration::from_secs(5), ws.receive_json()).await.unwrap();
    assert_eq!(first["message_type"], "Snapshot");
    assert_eq!(first["payload"]["composer"]["phase"], "Idle");

    ws.send_json(&json!({ "message_type": "ChooseTemplate", "payload": "which-at" }))
        .await;
    // Immediate commands are acknowledged before their snapshot goes out.
    let ack = next_of_type(&mut ws, "Ack").await;
    assert_eq!(ack["payload"], "ChooseTemplate");
    let snapshot = snapshot_where(&mut ws, |s| s["composer"]["activeTemplate"]["id"] == "which-at").await;
    assert_eq!(snapshot["composer"]["phase"], "TemplateChosen");
    assert_eq!(snapshot["pendingRequirements"], json!(["items", "locations"]));

    ws.send_json(&json!({ "message_type": "AddItems", "payload": ["Lamp"] }))
        .await;
    let ack = next_of_type(&mut ws, "Ack").await;
    assert_eq!(ack["payload"], "AddItems");
    let snapshot = snapshot_where(&mut ws, |s| s["composer"]["phase"] == "Composing").await;
    assert_eq!(snapshot["composer"]["items"], json!(["Lamp"]));
    assert_eq!(widget.snapshot().await.unwrap().composer.items.len(), 1);
}

#[tokio::test]
async fn test_ws_reports_unknown_and_malformed_messages() {
    let widget = spawn_widget(Arc::new(InMemoryConversationStore::new())).await;
    let server = ws_server(widget);
    let mut ws = connect(&server).await;

    ws.send_json(&json!({ "message_type": "Dance" })).await;
    let error = next_of_type(&mut ws, "Error").await;
    assert_eq!(error["payload"], "Unknown message type: Dance");

    ws.send_text("not json").await;
    let error = next_of_type(&mut ws, "Error").await;
    assert!(error["payload"].as_str().unwrap().starts_with("Malformed message"));

    ws.send_json(&json!({ "message_type": "Send" })).await;
    let error = next_of_type(&mut ws, "Error").await;
    assert_eq!(error["payload"]["error"], "No active conversation");
    assert_eq!(error["payload"]["retryable"], false);
}

#[tokio::test]
async fn test_ws_keeps_working_while_send_is_in_flight() {
    let gate = Arc::new(Notify::new());
    let store = GatedStore {
        inner: InMemoryConversationStore::new(),
        gate: gate.clone(),
    };
    let widget = spawn_widget(Arc::new(store)).await;
    widget.new_conversation().await.unwrap();
    widget.edit_text("Where is the first aid kit?").await.unwrap();
    let server = ws_server(widget.clone());
    let mut ws = connect(&server).await;

    ws.send_json(&json!({ "message_type": "Send" })).await;
    let busy = snapshot_where(&mut ws, |s| s["composer"]["busy"] == true).await;
    assert_eq!(busy["pendingMessage"], "Where is the first aid kit?");

    ws.send_json(&json!({ "message_type": "ChooseTemplate", "payload": "where-is" }))
        .await;
    let ack = next_of_type(&mut ws, "Ack").await;
    assert_eq!(ack["payload"], "ChooseTemplate");
    let state = widget.snapshot().await.unwrap();
    assert!(state.composer.busy);
    assert_eq!(state.composer.active_template.map(|t| t.id).as_deref(), Some("where-is"));

    ws.send_json(&json!({ "message_type": "Send" })).await;
    let error = next_of_type(&mut ws, "Error").await;
    assert_eq!(error["payload"]["error"], "A message is already being sent");

    gate.notify_one();
    // The Send acknowledgement and the final snapshot travel separately.
    let (mut acked, mut done) = (false, None);
    while !acked || done.is_none() {
        let frame: Value = timeout(Duration::from_secs(5), ws.receive_json()).await.unwrap();
        match frame["message_type"].as_str() {
            Some("Ack") => acked |= frame["payload"] == "Send",
            Some("Snapshot") if frame["payload"]["composer"]["busy"] == false => {
                done = Some(frame["payload"].clone())
            }
            _ => {}
        }
    }
    let done = done.unwrap();
    assert_eq!(done["conversation"]["messages"].as_array().unwrap().len(), 2);
    assert!(done["pendingMessage"].is_null());
    assert_eq!(done["composer"]["phase"], "Idle");
}
