//! HTTP client for the chat service REST API.
//!
//! [`ChatApi`] abstracts the service so the engine can be driven by a fake in tests;
//! [`HttpChatApi`] is the reqwest implementation.

use std::time::Duration;

use async_trait::async_trait;
use chatera_core::{Conversation, ConversationId, HistoryMessage};
use futures::stream::BoxStream;
use futures::{StreamExt, TryStreamExt};
use reqwest::{Client, RequestBuilder, Response};
use serde::{Deserialize, Serialize};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};

/// Raw body chunks of a query response.
pub type ByteStream = BoxStream<'static, Result<Vec<u8>>>;

// =============================================================================
// Wire Types
// =============================================================================

/// Body of a streaming query.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct QueryRequest {
    /// Client identifier.
    pub client_id: String,
    /// Conversation the question belongs to.
    pub session_id: ConversationId,
    /// The user's message.
    pub message: String,
    /// Documents the answer should be grounded on.
    pub document_ids: Vec<String>,
}

/// Fields changed by a conversation update; `None` leaves a field untouched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationUpdate {
    /// New title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    /// New pinned flag.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_pinned: Option<bool>,
}

/// A document available for grounding answers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Document {
    /// Document id.
    pub id: String,
    /// Display name.
    pub name: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationRequest<'a> {
    client_id: &'a str,
    title: &'a str,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateConversationResponse {
    new_session: Conversation,
}

#[derive(Deserialize)]
struct ListConversationsResponse {
    #[serde(default)]
    sessions: Vec<Conversation>,
}

#[derive(Deserialize)]
struct HistoryResponse {
    #[serde(default)]
    messages: Vec<HistoryMessage>,
}

#[derive(Deserialize)]
struct ListDocumentsResponse {
    #[serde(default)]
    documents: Vec<Document>,
}

#[derive(Serialize)]
struct DeleteDocumentsRequest<'a> {
    doc_ids: &'a [String],
    #[serde(rename = "clientId")]
    client_id: &'a str,
}

#[derive(Deserialize)]
struct ApiErrorResponse {
    detail: serde_json::Value,
}

// =============================================================================
// Trait
// =============================================================================

/// Operations offered by the chat service.
#[async_trait]
pub trait ChatApi: Send + Sync {
    /// Create a conversation titled `title`.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the service rejects it.
    async fn create_conversation(&self, client_id: &str, title: &str) -> Result<Conversation>;

    /// List the client's conversations.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn list_conversations(&self, client_id: &str) -> Result<Vec<Conversation>>;

    /// Rename or pin a conversation, returning the updated record.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the conversation does not exist.
    async fn update_conversation(
        &self,
        id: &ConversationId,
        update: &ConversationUpdate,
    ) -> Result<Conversation>;

    /// Delete a conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn delete_conversation(&self, id: &ConversationId) -> Result<()>;

    /// Fetch the persisted messages of a conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn fetch_history(&self, id: &ConversationId) -> Result<Vec<HistoryMessage>>;

    /// List the client's documents.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn list_documents(&self, client_id: &str) -> Result<Vec<Document>>;

    /// Delete documents by id.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    async fn delete_documents(&self, client_id: &str, doc_ids: &[String]) -> Result<()>;

    /// Open a query and return its body as a stream of raw chunks.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be sent or the service answers with an
    /// error status.
    async fn open_query(&self, request: &QueryRequest) -> Result<ByteStream>;
}

// =============================================================================
// HTTP Implementation
// =============================================================================

/// reqwest-backed [`ChatApi`].
#[derive(Debug, Clone)]
pub struct HttpChatApi {
    client: Client,
    base_url: String,
    request_timeout: Duration,
}

impl HttpChatApi {
    /// Create a client from configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn new(config: &ClientConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// Create a client around an existing reqwest client.
    #[must_use]
    pub fn with_client(client: Client, config: &ClientConfig) -> Self {
        Self {
            client,
            base_url: config.api_base_url.trim_end_matches('/').to_string(),
            request_timeout: config.request_timeout(),
        }
    }

    /// Get the base URL of the service.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    /// Send a non-streaming request and fail on error statuses.
    async fn send(&self, request: RequestBuilder) -> Result<Response> {
        let response = request.timeout(self.request_timeout).send().await?;
        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }
        Ok(response)
    }

    async fn json<T: serde::de::DeserializeOwned>(response: Response) -> Result<T> {
        response
            .json()
            .await
            .map_err(|e| ClientError::Parse(e.to_string()))
    }

    /// Handle API error responses.
    async fn handle_error(response: Response) -> ClientError {
        let status = response.status().as_u16();
        let message = match response.json::<ApiErrorResponse>().await {
            Ok(ApiErrorResponse {
                detail: serde_json::Value::String(detail),
            }) => detail,
            Ok(err) => err.detail.to_string(),
            Err(_) => "Unknown error".to_string(),
        };
        ClientError::Api { status, message }
    }
}

#[async_trait]
impl ChatApi for HttpChatApi {
    async fn create_conversation(&self, client_id: &str, title: &str) -> Result<Conversation> {
        let body = CreateConversationRequest { client_id, title };
        let response = self
            .send(self.client.post(self.url("/api/sessions/create")).json(&body))
            .await?;
        let created: CreateConversationResponse = Self::json(response).await?;
        tracing::debug!(conversation = %created.new_session.id, "conversation created");
        Ok(created.new_session)
    }

    async fn list_conversations(&self, client_id: &str) -> Result<Vec<Conversation>> {
        let response = self
            .send(
                self.client
                    .get(self.url("/api/sessions"))
                    .query(&[("clientId", client_id)]),
            )
            .await?;
        let body: ListConversationsResponse = Self::json(response).await?;
        Ok(body.sessions)
    }

    async fn update_conversation(
        &self,
        id: &ConversationId,
        update: &ConversationUpdate,
    ) -> Result<Conversation> {
        let response = self
            .send(
                self.client
                    .patch(self.url(&format!("/api/sessions/{id}")))
                    .json(update),
            )
            .await?;
        Self::json(response).await
    }

    async fn delete_conversation(&self, id: &ConversationId) -> Result<()> {
        self.send(self.client.delete(self.url(&format!("/api/sessions/{id}"))))
            .await?;
        Ok(())
    }

    async fn fetch_history(&self, id: &ConversationId) -> Result<Vec<HistoryMessage>> {
        let response = self
            .send(
                self.client
                    .get(self.url("/api/chats"))
                    .query(&[("sessionId", id.as_str())]),
            )
            .await?;
        let body: HistoryResponse = Self::json(response).await?;
        Ok(body.messages)
    }

    async fn list_documents(&self, client_id: &str) -> Result<Vec<Document>> {
        let response = self
            .send(
                self.client
                    .get(self.url("/api/documents"))
                    .query(&[("clientId", client_id)]),
            )
            .await?;
        let body: ListDocumentsResponse = Self::json(response).await?;
        Ok(body.documents)
    }

    async fn delete_documents(&self, client_id: &str, doc_ids: &[String]) -> Result<()> {
        let body = DeleteDocumentsRequest { doc_ids, client_id };
        self.send(
            self.client
                .post(self.url("/api/documents/delete"))
                .json(&body),
        )
        .await?;
        Ok(())
    }

    async fn open_query(&self, request: &QueryRequest) -> Result<ByteStream> {
        // No timeout: the body stays open for as long as the answer is produced.
        let response = self
            .client
            .post(self.url("/api/query"))
            .json(request)
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(Self::handle_error(response).await);
        }

        Ok(response
            .bytes_stream()
            .map_ok(|chunk| chunk.to_vec())
            .map_err(ClientError::from)
            .boxed())
    }
}
