//! The streaming conversation engine.
//!
//! [`ChatEngine`] owns the conversation state and reconciles three sources into it:
//! the user's commands, the query stream of the message being answered, and the
//! side channels. While a query streams, tokens and channel events are merged in
//! arrival order by a single `select!` loop.
//!
//! Every stream is bound to a cancellation token that is cancelled when a different
//! conversation is selected.

use std::sync::Arc;

use chatera_core::{
    ChannelId, Conversation, ConversationId, ConversationList, ConversationStore, CoreError,
    InProgressFile, MessageId, MessageLog, UploadStatus, UploadTracker,
};
use futures::StreamExt;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::{ChatApi, ConversationUpdate, Document, HttpChatApi, QueryRequest};
use crate::channel::{ChannelConnector, ChannelEvent, ChannelState, EventChannel, WsConnector};
use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::session::{SelectionEffect, SessionCoordinator};
use crate::stream::{StreamIngestor, StreamState};

/// A side-channel event after the engine applied it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineEvent {
    /// From the selected conversation's channel.
    Conversation(ChannelEvent),
    /// From the upload-batch channel.
    Upload(ChannelEvent),
}

/// Client-side engine for one user.
pub struct ChatEngine {
    api: Arc<dyn ChatApi>,
    config: ClientConfig,
    coordinator: SessionCoordinator,
    store: ConversationStore,
    conversations: ConversationList,
    channel: EventChannel,
    upload_channel: EventChannel,
    uploads: UploadTracker,
    selected_documents: Vec<String>,
    selection_cancel: CancellationToken,
    log_tx: watch::Sender<MessageLog>,
}

impl ChatEngine {
    /// Create an engine over the given service and channel transport.
    #[must_use]
    pub fn new(
        api: Arc<dyn ChatApi>,
        connector: Arc<dyn ChannelConnector>,
        config: ClientConfig,
    ) -> Self {
        let store = ConversationStore::new();
        let (log_tx, _) = watch::channel(store.snapshot());
        Self {
            api,
            coordinator: SessionCoordinator::new(config.client_id.clone(), config.title_max_chars),
            store,
            conversations: ConversationList::new(),
            channel: EventChannel::new(Arc::clone(&connector), &config),
            upload_channel: EventChannel::new(connector, &config),
            uploads: UploadTracker::new(),
            selected_documents: Vec::new(),
            selection_cancel: CancellationToken::new(),
            log_tx,
            config,
        }
    }

    /// Create an engine talking HTTP and WebSocket to the configured service.
    ///
    /// # Errors
    ///
    /// Returns an error if the HTTP client cannot be built.
    pub fn connect(config: ClientConfig) -> Result<Self> {
        let api = HttpChatApi::new(&config)?;
        Ok(Self::new(Arc::new(api), Arc::new(WsConnector), config))
    }

    // =========================================================================
    // Accessors
    // =========================================================================

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// The message log of the selected conversation.
    #[must_use]
    pub fn store(&self) -> &ConversationStore {
        &self.store
    }

    /// Known conversations.
    #[must_use]
    pub fn conversations(&self) -> &ConversationList {
        &self.conversations
    }

    /// The selected conversation, if it exists server-side.
    #[must_use]
    pub fn current_conversation(&self) -> Option<&ConversationId> {
        self.coordinator.current()
    }

    /// Documents being ingested.
    #[must_use]
    pub fn uploads(&self) -> &[InProgressFile] {
        self.uploads.files()
    }

    /// Documents sent with every query.
    #[must_use]
    pub fn selected_documents(&self) -> &[String] {
        &self.selected_documents
    }

    /// State of the selected conversation's channel.
    #[must_use]
    pub fn channel_state(&self) -> ChannelState {
        self.channel.state()
    }

    /// Receive a snapshot of the log after every change.
    #[must_use]
    pub fn subscribe_log(&self) -> watch::Receiver<MessageLog> {
        self.log_tx.subscribe()
    }

    /// Token cancelling the stream of the current selection.
    ///
    /// The token is replaced whenever the selection changes, so fetch it right
    /// before sending.
    #[must_use]
    pub fn stream_cancel_token(&self) -> CancellationToken {
        self.selection_cancel.clone()
    }

    // =========================================================================
    // Conversations
    // =========================================================================

    /// Reload the conversation list from the service.
    ///
    /// The selected conversation is kept in the list even if the listing does not
    /// contain it yet.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn refresh_conversations(&mut self) -> Result<()> {
        let listed = self.api.list_conversations(&self.config.client_id).await?;
        let current = self
            .coordinator
            .current()
            .and_then(|id| self.conversations.get(id))
            .cloned();

        self.conversations.replace_all(listed);
        if let Some(conversation) = current {
            self.conversations.announce(conversation);
        }
        Ok(())
    }

    /// Select a conversation, or `None` to start a new one.
    ///
    /// Cancels the stream of the previous selection, reloads history unless the
    /// conversation was just created by this engine, and moves the side channel.
    ///
    /// # Errors
    ///
    /// Returns an error if history cannot be fetched; the log is left empty.
    pub async fn select_conversation(&mut self, id: Option<ConversationId>) -> Result<()> {
        let effect = self.coordinator.on_selection_changed(id.as_ref());
        if effect != SelectionEffect::Skip {
            self.selection_cancel.cancel();
            self.selection_cancel = CancellationToken::new();
        }

        match &id {
            Some(id) => self.channel.subscribe(ChannelId::for_conversation(id)),
            None => self.channel.unsubscribe(),
        }

        match (effect, id) {
            (SelectionEffect::ReloadHistory, Some(id)) => {
                self.store.replace_history(Some(id.clone()), Vec::new());
                self.publish();
                let history = self.api.fetch_history(&id).await?;
                debug!(conversation = %id, messages = history.len(), "history loaded");
                self.store.replace_history(Some(id), history);
            }
            (SelectionEffect::Clear, _) => self.store.clear(),
            _ => {}
        }
        self.publish();
        Ok(())
    }

    /// Start a new, not yet persisted conversation.
    ///
    /// # Errors
    ///
    /// Never fails in practice; shares the signature of `select_conversation`.
    pub async fn new_conversation(&mut self) -> Result<()> {
        self.select_conversation(None).await
    }

    /// Rename a conversation.
    ///
    /// # Errors
    ///
    /// Returns an error if the service rejects the update or the conversation is
    /// not listed.
    pub async fn rename_conversation(
        &mut self,
        id: &ConversationId,
        title: impl Into<String>,
    ) -> Result<Conversation> {
        let update = ConversationUpdate {
            title: Some(title.into()),
            ..ConversationUpdate::default()
        };
        let updated = self.api.update_conversation(id, &update).await?;
        self.conversations.rename(id, updated.title.clone())?;
        Ok(updated)
    }

    /// Flip the pinned flag of a conversation and return the new value.
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation is not listed or the service rejects
    /// the update.
    pub async fn toggle_pin(&mut self, id: &ConversationId) -> Result<bool> {
        let pinned = self
            .conversations
            .get(id)
            .map(|c| c.is_pinned)
            .ok_or_else(|| CoreError::ConversationNotFound(id.clone()))?;
        let update = ConversationUpdate {
            is_pinned: Some(!pinned),
            ..ConversationUpdate::default()
        };
        let updated = self.api.update_conversation(id, &update).await?;
        self.conversations.set_pinned(id, updated.is_pinned)?;
        Ok(updated.is_pinned)
    }

    /// Delete a conversation, deselecting it if selected.
    ///
    /// # Errors
    ///
    /// Returns an error if the service rejects the deletion.
    pub async fn delete_conversation(&mut self, id: &ConversationId) -> Result<()> {
        self.api.delete_conversation(id).await?;
        self.conversations.remove(id);
        if self.coordinator.current() == Some(id) {
            self.select_conversation(None).await?;
        }
        Ok(())
    }

    /// Flip the thinking-trace visibility of an assistant message.
    ///
    /// # Errors
    ///
    /// Returns an error if the message is unknown or not an assistant message.
    pub fn toggle_thinking(&mut self, id: &MessageId) -> Result<bool> {
        let visible = self.store.toggle_thinking(id)?;
        self.publish();
        Ok(visible)
    }

    // =========================================================================
    // Documents
    // =========================================================================

    /// List the client's documents.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn list_documents(&self) -> Result<Vec<Document>> {
        self.api.list_documents(&self.config.client_id).await
    }

    /// Delete documents and drop them from the selection.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails.
    pub async fn delete_documents(&mut self, doc_ids: &[String]) -> Result<()> {
        self.api
            .delete_documents(&self.config.client_id, doc_ids)
            .await?;
        self.selected_documents.retain(|id| !doc_ids.contains(id));
        Ok(())
    }

    /// Set the documents sent with every query.
    pub fn select_documents(&mut self, doc_ids: Vec<String>) {
        self.selected_documents = doc_ids;
    }

    /// Open a fresh upload-batch channel and return its id for the ingestion service.
    pub fn track_uploads(&mut self) -> ChannelId {
        let channel = ChannelId::upload_batch();
        self.upload_channel.subscribe(channel.clone());
        channel
    }

    /// Close the upload-batch channel and forget settled documents.
    pub fn stop_tracking_uploads(&mut self) {
        self.upload_channel.unsubscribe();
        let settled: Vec<String> = self
            .uploads
            .files()
            .iter()
            .filter(|f| f.status.is_terminal())
            .map(|f| f.doc_id.clone())
            .collect();
        for doc_id in settled {
            self.uploads.remove(&doc_id);
        }
    }

    // =========================================================================
    // Messages
    // =========================================================================

    /// Send a message and stream the answer into the log.
    ///
    /// Returns the terminal state of the stream. Failures inside the stream are
    /// shown in the log and reported as [`StreamState::Failed`].
    ///
    /// # Errors
    ///
    /// Returns an error if the conversation cannot be created, the query cannot
    /// be opened, or the stream is cancelled. The user message stays in the log
    /// and the assistant placeholder shows the error.
    pub async fn send_message(&mut self, text: &str) -> Result<StreamState> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(StreamState::Idle);
        }

        self.store.append_user(text);
        self.store
            .append_assistant_placeholder(self.config.canvas_mode);
        self.publish();

        let resolved = self
            .coordinator
            .resolve(self.api.as_ref(), &mut self.conversations, text)
            .await;
        let conversation = match resolved {
            Ok(id) => id,
            Err(e) => {
                warn!(error = %e, "could not create conversation");
                self.store.fail(&e.to_string());
                self.publish();
                return Err(e);
            }
        };
        if self.store.conversation_id() != Some(&conversation) {
            self.store.bind_conversation(conversation.clone());
        }
        self.select_conversation(Some(conversation.clone())).await?;

        let request = QueryRequest {
            client_id: self.config.client_id.clone(),
            session_id: conversation,
            message: text.to_string(),
            document_ids: self.selected_documents.clone(),
        };
        self.stream_answer(&request).await
    }

    async fn stream_answer(&mut self, request: &QueryRequest) -> Result<StreamState> {
        let cancel = self.selection_cancel.child_token();
        let mut ingestor = StreamIngestor::new();
        ingestor.begin();
        info!(conversation = %request.session_id, documents = request.document_ids.len(), "opening query stream");

        let opened = tokio::select! {
            () = cancel.cancelled() => {
                ingestor.abandon();
                self.detach_stream();
                return Err(ClientError::Cancelled);
            }
            result = self.api.open_query(request) => result,
        };
        let mut body = match opened {
            Ok(body) => body,
            Err(e) => {
                warn!(error = %e, "query stream failed to open");
                ingestor.fail(&e.to_string(), &mut self.store);
                self.publish();
                return Err(e);
            }
        };
        ingestor.opened();

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("query stream cancelled");
                    ingestor.abandon();
                    self.detach_stream();
                    return Err(ClientError::Cancelled);
                }
                chunk = body.next() => {
                    let state = match chunk {
                        Some(Ok(bytes)) => ingestor.ingest(&bytes, &mut self.store),
                        Some(Err(e)) => {
                            warn!(error = %e, "query stream broke");
                            ingestor.fail(&e.to_string(), &mut self.store)
                        }
                        None => ingestor.finish(&mut self.store),
                    };
                    self.publish();
                    if state.is_terminal() {
                        info!(state = ?state, "query stream finished");
                        return Ok(state);
                    }
                }
                Some(event) = self.channel.recv() => self.apply_conversation_event(&event),
                Some(event) = self.upload_channel.recv() => self.apply_upload_event(&event),
            }
        }
    }

    /// Wait for the next side-channel event and apply it.
    ///
    /// Used between answers; while an answer streams, `send_message` applies
    /// channel events itself.
    pub async fn next_event(&mut self) -> Option<EngineEvent> {
        tokio::select! {
            Some(event) = self.channel.recv() => {
                self.apply_conversation_event(&event);
                Some(EngineEvent::Conversation(event))
            }
            Some(event) = self.upload_channel.recv() => {
                self.apply_upload_event(&event);
                Some(EngineEvent::Upload(event))
            }
            else => None,
        }
    }

    fn apply_conversation_event(&mut self, event: &ChannelEvent) {
        match event {
            ChannelEvent::Status(status) => {
                if self.store.apply_status_event(status) {
                    self.publish();
                }
            }
            ChannelEvent::TitleUpdate(title) => {
                if let Some(id) = self.coordinator.current() {
                    if self.conversations.apply_title_update(id, title) {
                        info!(conversation = %id, title = %title, "title updated");
                    }
                }
            }
            ChannelEvent::UploadProgress(progress) => {
                self.uploads.apply(progress);
            }
            ChannelEvent::StateChanged(state) => {
                debug!(state = ?state, "conversation channel state changed");
            }
        }
    }

    fn apply_upload_event(&mut self, event: &ChannelEvent) {
        match event {
            ChannelEvent::UploadProgress(progress) => {
                if self.uploads.apply(progress) == UploadStatus::Completed {
                    info!(doc_id = %progress.doc_id, filename = %progress.filename, "document ingested");
                }
            }
            ChannelEvent::Status(status) => {
                debug!(message = %status.message, "upload channel status");
            }
            ChannelEvent::TitleUpdate(_) => {}
            ChannelEvent::StateChanged(state) => {
                debug!(state = ?state, "upload channel state changed");
            }
        }
    }

    /// Close the open assistant message, keeping what has arrived.
    ///
    /// A caller cancelling through `stream_cancel_token` must not cancel later
    /// sends in the same conversation, so a spent token is replaced.
    fn detach_stream(&mut self) {
        if self.selection_cancel.is_cancelled() {
            self.selection_cancel = CancellationToken::new();
        }
        if self.store.finalize() {
            self.publish();
        }
    }

    fn publish(&self) {
        self.log_tx.send_replace(self.store.snapshot());
    }
}

impl std::fmt::Debug for ChatEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatEngine")
            .field("selection", self.coordinator.selection())
            .field("messages", &self.store.messages().len())
            .field("channel", &self.channel)
            .finish_non_exhaustive()
    }
}
