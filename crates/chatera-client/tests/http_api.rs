//! REST client tests against a mock chat service.

use chatera_client::{
    ChatApi, ClientConfig, ClientError, ConversationUpdate, HttpChatApi, QueryRequest,
    StreamIngestor, StreamState,
};
use chatera_core::{ConversationId, ConversationStore, Role};
use futures::TryStreamExt;
use serde_json::json;
use wiremock::matchers::{body_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn api_for(server: &MockServer) -> HttpChatApi {
    let config = ClientConfig {
        api_base_url: server.uri(),
        ..ClientConfig::default()
    };
    HttpChatApi::new(&config).unwrap()
}

fn session(id: &str, title: &str, pinned: bool) -> serde_json::Value {
    json!({
        "id": id,
        "title": title,
        "timestamp": "2024-05-01T10:00:00",
        "isPinned": pinned,
    })
}

#[tokio::test]
async fn create_conversation_sends_client_and_title() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/sessions/create"))
        .and(body_json(json!({"clientId": "user_12345", "title": "Explain recursion"})))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({"newSession": session("s-1", "Explain recursion", false)})),
        )
        .expect(1)
        .mount(&server)
        .await;

    let created = api_for(&server)
        .create_conversation("user_12345", "Explain recursion")
        .await
        .unwrap();
    assert_eq!(created.id.as_str(), "s-1");
    assert_eq!(created.title, "Explain recursion");
    assert!(created.timestamp_utc().is_some());
}

#[tokio::test]
async fn list_conversations_by_client() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/sessions"))
        .and(query_param("clientId", "user_12345"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "sessions": [session("s-1", "First", false), session("s-2", "Second", true)]
        })))
        .mount(&server)
        .await;

    let listed = api_for(&server).list_conversations("user_12345").await.unwrap();
    assert_eq!(listed.len(), 2);
    assert!(listed[1].is_pinned);
}

#[tokio::test]
async fn update_sends_only_changed_fields() {
    let server = MockServer::start().await;
    Mock::given(method("PATCH"))
        .and(path("/api/sessions/s-1"))
        .and(body_json(json!({"isPinned": true})))
        .respond_with(ResponseTemplate::new(200).set_body_json(session("s-1", "First", true)))
        .expect(1)
        .mount(&server)
        .await;

    let update = ConversationUpdate {
        is_pinned: Some(true),
        ..ConversationUpdate::default()
    };
    let id = ConversationId::new("s-1").unwrap();
    let updated = api_for(&server).update_conversation(&id, &update).await.unwrap();
    assert!(updated.is_pinned);
}

#[tokio::test]
async fn delete_conversation() {
    let server = MockServer::start().await;
    Mock::given(method("DELETE"))
        .and(path("/api/sessions/s-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"message": "deleted"})))
        .expect(1)
        .mount(&server)
        .await;

    let id = ConversationId::new("s-1").unwrap();
    api_for(&server).delete_conversation(&id).await.unwrap();
}

#[tokio::test]
async fn fetch_history_accepts_legacy_records() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/chats"))
        .and(query_param("sessionId", "s-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "messages": [
                {"type": "user", "text": "Show me a loop"},
                {
                    "type": "ai",
                    "id": "m-2",
                    "text": "```py\nfor i in x:\n    pass\n```",
                    "thinkingEvents": ["Searching documents"],
                    "isThinkingVisible": true,
                    "canvasMode": false
                }
            ]
        })))
        .mount(&server)
        .await;

    let id = ConversationId::new("s-1").unwrap();
    let history = api_for(&server).fetch_history(&id).await.unwrap();
    assert_eq!(history.len(), 2);
    assert_eq!(history[0].role, Role::User);
    assert!(history[0].thinking_events.is_none());
    assert_eq!(history[1].role, Role::Assistant);

    let mut store = ConversationStore::new();
    store.replace_history(Some(id), history);
    let answer = store.messages()[1].as_assistant().unwrap();
    assert_eq!(answer.code_blocks.len(), 1);
    assert!(answer.code_blocks[0].is_complete);
    assert!(answer.thinking_visible);
}

#[tokio::test]
async fn documents_list_and_delete() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/documents"))
        .and(query_param("clientId", "user_12345"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "documents": [{"id": "d-1", "name": "handbook.pdf"}]
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/documents/delete"))
        .and(body_json(json!({"doc_ids": ["d-1"], "clientId": "user_12345"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"deleted": 1})))
        .expect(1)
        .mount(&server)
        .await;

    let api = api_for(&server);
    let documents = api.list_documents("user_12345").await.unwrap();
    assert_eq!(documents[0].name, "handbook.pdf");
    api.delete_documents("user_12345", &["d-1".to_string()])
        .await
        .unwrap();
}

#[tokio::test]
async fn error_detail_is_surfaced() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/chats"))
        .respond_with(ResponseTemplate::new(404).set_body_json(json!({"detail": "Session not found"})))
        .mount(&server)
        .await;

    let id = ConversationId::new("missing").unwrap();
    let err = api_for(&server).fetch_history(&id).await.unwrap_err();
    match err {
        ClientError::Api { status, message } => {
            assert_eq!(status, 404);
            assert_eq!(message, "Session not found");
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn error_without_detail() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/api/sessions"))
        .respond_with(ResponseTemplate::new(502).set_body_string("bad gateway"))
        .mount(&server)
        .await;

    let err = api_for(&server).list_conversations("c").await.unwrap_err();
    assert!(matches!(
        err,
        ClientError::Api { status: 502, ref message } if message == "Unknown error"
    ));
}

#[tokio::test]
async fn query_body_streams_into_store() {
    let server = MockServer::start().await;
    let body = concat!(
        "data: {\"event\":\"token\",\"data\":\"Recursion\"}\n",
        "data: {\"event\":\"token\",\"data\":\" is\"}\n",
        "\n",
        "data: {\"event\":\"token\",\"data\":\" a function calling itself.\"}\n",
        "data: {\"event\":\"end\"}\n",
    );
    Mock::given(method("POST"))
        .and(path("/api/query"))
        .and(body_json(json!({
            "clientId": "user_12345",
            "sessionId": "s-1",
            "message": "Explain recursion",
            "documentIds": []
        })))
        .respond_with(ResponseTemplate::new(200).set_body_raw(body, "text/event-stream"))
        .mount(&server)
        .await;

    let request = QueryRequest {
        client_id: "user_12345".into(),
        session_id: ConversationId::new("s-1").unwrap(),
        message: "Explain recursion".into(),
        document_ids: Vec::new(),
    };
    let chunks: Vec<Vec<u8>> = api_for(&server)
        .open_query(&request)
        .await
        .unwrap()
        .try_collect()
        .await
        .unwrap();

    let mut store = ConversationStore::for_conversation(request.session_id.clone());
    store.append_user("Explain recursion");
    store.append_assistant_placeholder(false);

    let mut ingestor = StreamIngestor::new();
    ingestor.begin();
    ingestor.opened();
    let mut state = ingestor.state();
    for chunk in &chunks {
        state = ingestor.ingest(chunk, &mut store);
    }
    if !state.is_terminal() {
        state = ingestor.finish(&mut store);
    }

    assert_eq!(state, StreamState::Completed);
    assert_eq!(
        store.tail().unwrap().text(),
        "Recursion is a function calling itself."
    );
    assert!(!store.is_streaming());
}

#[tokio::test]
async fn query_rejected_before_streaming() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/api/query"))
        .respond_with(ResponseTemplate::new(422).set_body_json(json!({
            "detail": [{"loc": ["body", "sessionId"], "msg": "field required"}]
        })))
        .mount(&server)
        .await;

    let request = QueryRequest {
        client_id: "c".into(),
        session_id: ConversationId::new("s-1").unwrap(),
        message: "hi".into(),
        document_ids: Vec::new(),
    };
    let Err(err) = api_for(&server).open_query(&request).await else {
        panic!("query should be rejected");
    };
    match err {
        ClientError::Api { status, message } => {
            assert_eq!(status, 422);
            assert!(message.contains("field required"));
        }
        other => panic!("unexpected error: {other:?}"),
    }
}
