//! End-to-end engine behavior over scripted transports.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chatera_client::{
    ByteStream, ChannelConnector, ChannelEvent, ChatApi, ChatEngine, ClientConfig, ClientError,
    ConversationUpdate, Document, EngineEvent, FrameStream, HttpChatApi, QueryRequest,
    StreamState,
};
use chatera_core::{Conversation, ConversationId, HistoryMessage, Message, UploadStatus};
use futures::{stream, StreamExt};
use serde_json::json;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

// =============================================================================
// Scripted transports
// =============================================================================

/// Chunks of a query body, each delivered after its delay.
type BodyScript = Vec<(Duration, &'static str)>;

#[derive(Default)]
struct FakeApi {
    creates: AtomicUsize,
    history_fetches: AtomicUsize,
    fail_create: bool,
    listing: Vec<Conversation>,
    history: Vec<HistoryMessage>,
    bodies: Mutex<VecDeque<BodyScript>>,
    queries: Mutex<Vec<QueryRequest>>,
}

impl FakeApi {
    fn with_bodies(bodies: Vec<BodyScript>) -> Self {
        Self {
            bodies: Mutex::new(bodies.into()),
            ..Self::default()
        }
    }
}

#[async_trait]
impl ChatApi for FakeApi {
    async fn create_conversation(
        &self,
        _client_id: &str,
        title: &str,
    ) -> chatera_client::Result<Conversation> {
        let n = self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create {
            return Err(ClientError::Api {
                status: 500,
                message: "database unavailable".into(),
            });
        }
        Ok(conversation(&format!("s-{n}"), title))
    }

    async fn list_conversations(&self, _client_id: &str) -> chatera_client::Result<Vec<Conversation>> {
        Ok(self.listing.clone())
    }

    async fn update_conversation(
        &self,
        id: &ConversationId,
        update: &ConversationUpdate,
    ) -> chatera_client::Result<Conversation> {
        let mut updated = conversation(id.as_str(), update.title.as_deref().unwrap_or("Old"));
        updated.is_pinned = update.is_pinned.unwrap_or(false);
        Ok(updated)
    }

    async fn delete_conversation(&self, _id: &ConversationId) -> chatera_client::Result<()> {
        Ok(())
    }

    async fn fetch_history(&self, _id: &ConversationId) -> chatera_client::Result<Vec<HistoryMessage>> {
        self.history_fetches.fetch_add(1, Ordering::SeqCst);
        Ok(self.history.clone())
    }

    async fn list_documents(&self, _client_id: &str) -> chatera_client::Result<Vec<Document>> {
        Ok(Vec::new())
    }

    async fn delete_documents(&self, _client_id: &str, _doc_ids: &[String]) -> chatera_client::Result<()> {
        Ok(())
    }

    async fn open_query(&self, request: &QueryRequest) -> chatera_client::Result<ByteStream> {
        self.queries.lock().unwrap().push(request.clone());
        let script = self.bodies.lock().unwrap().pop_front().unwrap_or_default();
        let chunks = stream::iter(script).then(|(delay, chunk)| async move {
            tokio::time::sleep(delay).await;
            Ok::<_, ClientError>(chunk.as_bytes().to_vec())
        });
        Ok(chunks.boxed())
    }
}

/// Connector whose connections deliver scripted frames and then stay open.
#[derive(Default)]
struct ScriptedChannels {
    scripts: Mutex<VecDeque<Vec<(Duration, String)>>>,
    urls: Mutex<Vec<String>>,
}

impl ScriptedChannels {
    fn with_frames(frames: Vec<(Duration, serde_json::Value)>) -> Self {
        let script = frames
            .into_iter()
            .map(|(delay, frame)| (delay, frame.to_string()))
            .collect();
        Self {
            scripts: Mutex::new(VecDeque::from([script])),
            ..Self::default()
        }
    }

    fn urls(&self) -> Vec<String> {
        self.urls.lock().unwrap().clone()
    }
}

#[async_trait]
impl ChannelConnector for ScriptedChannels {
    async fn connect(&self, url: &str) -> chatera_client::Result<FrameStream> {
        self.urls.lock().unwrap().push(url.to_string());
        let script = self.scripts.lock().unwrap().pop_front().unwrap_or_default();
        let frames = stream::iter(script)
            .then(|(delay, frame)| async move {
                tokio::time::sleep(delay).await;
                Ok::<_, ClientError>(frame)
            })
            .chain(stream::pending());
        Ok(frames.boxed())
    }
}

fn conversation(id: &str, title: &str) -> Conversation {
    Conversation {
        id: ConversationId::new(id).unwrap(),
        title: title.to_string(),
        timestamp: "2024-05-01T10:00:00".into(),
        is_pinned: false,
    }
}

fn token(text: &str) -> String {
    format!("data: {}\n", json!({"event": "token", "data": text}))
}

fn leak(s: String) -> &'static str {
    Box::leak(s.into_boxed_str())
}

fn ms(n: u64) -> Duration {
    Duration::from_millis(n)
}

const END: &str = "data: {\"event\":\"end\"}\n";

fn engine(api: Arc<FakeApi>, channels: Arc<ScriptedChannels>) -> ChatEngine {
    ChatEngine::new(api, channels, ClientConfig::default())
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn first_message_creates_conversation_and_streams_answer() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/sessions/create"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "newSession": {"id": "s-1", "title": "New Chat", "timestamp": "2024-05-01T10:00:00", "isPinned": false}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/query"))
        .respond_with(ResponseTemplate::new(200).set_body_raw(
            format!(
                "{}{}{}{END}",
                token("Recursion"),
                token(" is"),
                token(" a function calling itself.")
            ),
            "text/event-stream",
        ))
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/chats"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"messages": []})))
        .expect(0)
        .mount(&server)
        .await;

    let config = ClientConfig {
        api_base_url: server.uri(),
        ..ClientConfig::default()
    };
    let api = Arc::new(HttpChatApi::new(&config).unwrap());
    let channels = Arc::new(ScriptedChannels::default());
    let mut engine = ChatEngine::new(api, channels, config);

    let state = engine.send_message("  Explain recursion ").await.unwrap();
    assert_eq!(state, StreamState::Completed);

    let id = ConversationId::new("s-1").unwrap();
    assert_eq!(engine.current_conversation(), Some(&id));
    assert_eq!(engine.conversations().get(&id).unwrap().title, "Explain recursion");

    let messages = engine.store().messages();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[0].text(), "Explain recursion");
    assert_eq!(messages[1].text(), "Recursion is a function calling itself.");
    assert!(!engine.store().is_streaming());

    // A follow-up reuses the conversation.
    let state = engine.send_message("And iteration?").await.unwrap();
    assert_eq!(state, StreamState::Completed);
    assert_eq!(engine.store().messages().len(), 4);
}

#[tokio::test(start_paused = true)]
async fn code_block_grows_then_completes() {
    let api = Arc::new(FakeApi::with_bodies(vec![vec![
        (ms(10), leak(token("```py\ndef f():\n"))),
        (ms(10), leak(token("    pass\n```\n"))),
        (ms(10), END),
    ]]));
    let mut engine = engine(Arc::clone(&api), Arc::new(ScriptedChannels::default()));
    let mut log = engine.subscribe_log();

    let observer = async {
        let mut seen = Vec::new();
        loop {
            log.changed().await.unwrap();
            let snapshot = log.borrow_and_update().clone();
            let Some(answer) = snapshot.last().and_then(|m| m.as_assistant()) else {
                continue;
            };
            if let Some(block) = answer.code_blocks.first() {
                seen.push(block.clone());
                if block.is_complete {
                    return seen;
                }
            }
        }
    };
    let (state, seen) = tokio::join!(engine.send_message("Write a stub"), observer);

    assert_eq!(state.unwrap(), StreamState::Completed);
    let first = &seen[0];
    assert_eq!(first.language, "py");
    assert!(!first.is_complete);
    let last = seen.last().unwrap();
    assert!(last.is_complete);
    assert_eq!(last.id, first.id);
    assert_eq!(last.content, "def f():\n    pass");
}

#[tokio::test(start_paused = true)]
async fn duplicate_status_events_are_recorded_once() {
    let status = json!({
        "type": "status",
        "message": "Searching documents",
        "timestamp": "2024-05-01T10:00:01"
    });
    let channels = Arc::new(ScriptedChannels::with_frames(vec![
        (ms(5), status.clone()),
        (ms(1), status),
        (
            ms(1),
            json!({"type": "status", "message": "Reading handbook.pdf", "timestamp": "2024-05-01T10:00:02"}),
        ),
    ]));
    let api = Arc::new(FakeApi::with_bodies(vec![vec![
        (ms(50), leak(token("Done."))),
        (ms(50), END),
    ]]));
    let mut engine = engine(api, Arc::clone(&channels));

    let state = engine.send_message("Summarize the handbook").await.unwrap();
    assert_eq!(state, StreamState::Completed);

    let answer = engine.store().tail().and_then(Message::as_assistant).unwrap();
    assert_eq!(
        answer.thinking_events,
        vec!["Searching documents".to_string(), "Reading handbook.pdf".to_string()]
    );
    assert_eq!(channels.urls(), vec!["ws://127.0.0.1:8000/ws/s-0".to_string()]);
}

#[tokio::test]
async fn creation_failure_is_shown_inline() {
    let api = Arc::new(FakeApi {
        fail_create: true,
        ..FakeApi::default()
    });
    let mut engine = engine(Arc::clone(&api), Arc::new(ScriptedChannels::default()));

    let err = engine.send_message("hello").await.unwrap_err();
    assert!(matches!(err, ClientError::Api { status: 500, .. }));
    assert_eq!(engine.current_conversation(), None);
    assert!(api.queries.lock().unwrap().is_empty());

    let messages = engine.store().messages();
    assert_eq!(messages[0].text(), "hello");
    let answer = messages[1].as_assistant().unwrap();
    assert!(answer.is_error);
    assert!(answer.text.starts_with("Error: "));
    assert!(answer.text.contains("database unavailable"));
}

#[tokio::test]
async fn blank_message_is_ignored() {
    let api = Arc::new(FakeApi::default());
    let mut engine = engine(Arc::clone(&api), Arc::new(ScriptedChannels::default()));

    let state = engine.send_message("   ").await.unwrap();
    assert_eq!(state, StreamState::Idle);
    assert!(engine.store().messages().is_empty());
    assert_eq!(api.creates.load(Ordering::SeqCst), 0);
}

#[tokio::test(start_paused = true)]
async fn stream_error_event_replaces_answer() {
    let api = Arc::new(FakeApi::with_bodies(vec![vec![
        (ms(10), leak(token("Partial"))),
        (ms(10), "data: {\"event\":\"error\",\"data\":\"model overloaded\"}\n"),
    ]]));
    let mut engine = engine(api, Arc::new(ScriptedChannels::default()));

    let state = engine.send_message("hi").await.unwrap();
    assert_eq!(state, StreamState::Failed);
    let answer = engine.store().tail().and_then(Message::as_assistant).unwrap();
    assert!(answer.is_error);
    assert_eq!(answer.text, "Error: model overloaded");
}

#[tokio::test(start_paused = true)]
async fn selecting_conversation_loads_history_and_follows_channel() {
    let history: Vec<HistoryMessage> = serde_json::from_value(json!([
        {"type": "user", "text": "Earlier question"},
        {"type": "ai", "text": "Earlier answer"}
    ]))
    .unwrap();
    let api = Arc::new(FakeApi {
        history,
        ..FakeApi::default()
    });
    let channels = Arc::new(ScriptedChannels::default());
    let mut engine = engine(Arc::clone(&api), Arc::clone(&channels));

    let id = ConversationId::new("s-7").unwrap();
    engine.select_conversation(Some(id.clone())).await.unwrap();
    assert_eq!(engine.store().messages().len(), 2);
    assert_eq!(engine.store().conversation_id(), Some(&id));

    // Selecting the same conversation again keeps the log.
    engine.select_conversation(Some(id)).await.unwrap();
    assert_eq!(api.history_fetches.load(Ordering::SeqCst), 1);

    tokio::time::sleep(ms(10)).await;
    assert_eq!(channels.urls(), vec!["ws://127.0.0.1:8000/ws/s-7".to_string()]);

    engine.new_conversation().await.unwrap();
    assert!(engine.store().messages().is_empty());
    assert_eq!(engine.current_conversation(), None);
}

#[tokio::test(start_paused = true)]
async fn cancelling_selection_token_detaches_stream() {
    let api = Arc::new(FakeApi::with_bodies(vec![vec![
        (ms(10), leak(token("Recursion"))),
        (Duration::from_secs(3600), END),
    ]]));
    let mut engine = engine(api, Arc::new(ScriptedChannels::default()));
    let cancel = engine.stream_cancel_token();

    let stop = async {
        tokio::time::sleep(ms(100)).await;
        cancel.cancel();
    };
    let (result, ()) = tokio::join!(engine.send_message("Explain recursion"), stop);

    assert!(matches!(result, Err(ClientError::Cancelled)));
    assert!(!engine.store().is_streaming());
    let answer = engine.store().tail().and_then(Message::as_assistant).unwrap();
    assert_eq!(answer.text, "Recursion");
    assert!(!answer.is_error);
}

#[tokio::test(start_paused = true)]
async fn refresh_after_creation_keeps_conversation_without_recreating() {
    let api = Arc::new(FakeApi {
        listing: vec![conversation("s-5", "Other")],
        ..FakeApi::with_bodies(vec![
            vec![(ms(10), leak(token("Recursion"))), (ms(10), END)],
            vec![(ms(10), leak(token("Iteration"))), (ms(10), END)],
        ])
    });
    let mut engine = engine(Arc::clone(&api), Arc::new(ScriptedChannels::default()));

    let state = engine.send_message("Explain recursion").await.unwrap();
    assert_eq!(state, StreamState::Completed);
    let id = ConversationId::new("s-0").unwrap();
    assert_eq!(engine.current_conversation(), Some(&id));

    // The listing lags behind the creation.
    engine.refresh_conversations().await.unwrap();
    assert!(engine.conversations().get(&id).is_some());
    assert!(engine.conversations().get(&ConversationId::new("s-5").unwrap()).is_some());

    engine.select_conversation(Some(id.clone())).await.unwrap();
    let state = engine.send_message("And iteration?").await.unwrap();
    assert_eq!(state, StreamState::Completed);

    assert_eq!(api.creates.load(Ordering::SeqCst), 1);
    assert_eq!(api.history_fetches.load(Ordering::SeqCst), 0);
    assert_eq!(engine.current_conversation(), Some(&id));
    assert!(engine.conversations().get(&id).is_some());
    let messages = engine.store().messages();
    assert_eq!(messages.len(), 4);
    assert_eq!(messages[3].text(), "Iteration");
}

#[tokio::test(start_paused = true)]
async fn title_update_renames_current_conversation() {
    let channels = Arc::new(ScriptedChannels::with_frames(vec![(
        ms(5),
        json!({"type": "title_update", "new_title": "Recursion basics"}),
    )]));
    let api = Arc::new(FakeApi {
        listing: vec![conversation("s-7", "Explain recursion")],
        ..FakeApi::default()
    });
    let mut engine = engine(api, channels);
    engine.refresh_conversations().await.unwrap();

    let id = ConversationId::new("s-7").unwrap();
    engine.select_conversation(Some(id.clone())).await.unwrap();

    loop {
        let event = engine.next_event().await.unwrap();
        if matches!(event, EngineEvent::Conversation(ChannelEvent::TitleUpdate(_))) {
            break;
        }
    }
    assert_eq!(engine.conversations().get(&id).unwrap().title, "Recursion basics");
}

#[tokio::test(start_paused = true)]
async fn upload_progress_is_tracked() {
    let channels = Arc::new(ScriptedChannels::with_frames(vec![
        (
            ms(5),
            json!({"type": "upload_progress", "doc_id": "d-1", "filename": "handbook.pdf",
                   "status": "processing", "message": "Embedding", "current_chunk": 1, "total_chunks": 4}),
        ),
        (
            ms(5),
            json!({"type": "upload_progress", "doc_id": "d-1", "filename": "handbook.pdf",
                   "status": "completed", "message": "Done"}),
        ),
    ]));
    let mut engine = engine(Arc::new(FakeApi::default()), Arc::clone(&channels));

    let batch = engine.track_uploads();
    let mut progress = Vec::new();
    while progress.len() < 2 {
        if let Some(EngineEvent::Upload(ChannelEvent::UploadProgress(p))) = engine.next_event().await {
            progress.push(p.percent());
        }
    }

    assert_eq!(progress, vec![25, 100]);
    assert_eq!(engine.uploads()[0].status, UploadStatus::Completed);
    assert_eq!(
        channels.urls(),
        vec![format!("ws://127.0.0.1:8000/ws/{batch}")]
    );

    engine.stop_tracking_uploads();
    assert!(engine.uploads().is_empty());
}

#[tokio::test]
async fn pin_and_delete() {
    let api = Arc::new(FakeApi {
        listing: vec![conversation("s-1", "First"), conversation("s-2", "Second")],
        ..FakeApi::default()
    });
    let mut engine = engine(api, Arc::new(ScriptedChannels::default()));
    engine.refresh_conversations().await.unwrap();

    let second = ConversationId::new("s-2").unwrap();
    assert!(engine.toggle_pin(&second).await.unwrap());
    assert_eq!(engine.conversations().sorted()[0].id, second);

    engine.select_conversation(Some(second.clone())).await.unwrap();
    engine.delete_conversation(&second).await.unwrap();
    assert!(!engine.conversations().contains(&second));
    assert_eq!(engine.current_conversation(), None);

    let missing = ConversationId::new("s-9").unwrap();
    assert!(matches!(
        engine.toggle_pin(&missing).await,
        Err(ClientError::Core(_))
    ));
}
