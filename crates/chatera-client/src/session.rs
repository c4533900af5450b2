//! Lazy creation of the server-side conversation.
//!
//! A conversation is created when its first message is sent. Creating it changes
//! the selection, and a selection change normally reloads history from the service,
//! which would wipe the message log that is just being filled. The coordinator
//! records the creation as [`Selection::JustCreated`] so that the first selection
//! change for that id is recognised and skipped.

use chatera_core::{Conversation, ConversationId, ConversationList};
use tracing::{debug, info};

use crate::api::ChatApi;
use crate::error::Result;

/// Which conversation is selected and how it got selected.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum Selection {
    /// A new, not yet persisted conversation.
    #[default]
    None,
    /// A conversation picked by the user.
    Selected(ConversationId),
    /// A conversation created by the coordinator whose selection change has not
    /// been observed yet.
    JustCreated(ConversationId),
}

impl Selection {
    /// The selected conversation id, if any.
    #[must_use]
    pub fn id(&self) -> Option<&ConversationId> {
        match self {
            Self::None => None,
            Self::Selected(id) | Self::JustCreated(id) => Some(id),
        }
    }
}

/// What the owner must do after the selection changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SelectionEffect {
    /// Keep the current log.
    Skip,
    /// Replace the log with the conversation's persisted history.
    ReloadHistory,
    /// Empty the log.
    Clear,
}

/// Resolves the conversation id a message is sent under.
#[derive(Debug, Clone)]
pub struct SessionCoordinator {
    client_id: String,
    title_max_chars: usize,
    selection: Selection,
}

impl SessionCoordinator {
    /// Create a coordinator with nothing selected.
    #[must_use]
    pub fn new(client_id: impl Into<String>, title_max_chars: usize) -> Self {
        Self {
            client_id: client_id.into(),
            title_max_chars,
            selection: Selection::None,
        }
    }

    /// Current selection.
    #[must_use]
    pub fn selection(&self) -> &Selection {
        &self.selection
    }

    /// Currently selected conversation id.
    #[must_use]
    pub fn current(&self) -> Option<&ConversationId> {
        self.selection.id()
    }

    /// Return the id to send `first_message` under, creating the conversation if
    /// none is selected.
    ///
    /// A created conversation is titled after the first characters of the message,
    /// announced to `conversations` and recorded as just created.
    ///
    /// # Errors
    ///
    /// Returns the creation error; the selection is left unchanged.
    pub async fn resolve<A>(
        &mut self,
        api: &A,
        conversations: &mut ConversationList,
        first_message: &str,
    ) -> Result<ConversationId>
    where
        A: ChatApi + ?Sized,
    {
        if let Some(id) = self.current() {
            return Ok(id.clone());
        }

        let title = derive_title(first_message, self.title_max_chars);
        let created = api.create_conversation(&self.client_id, &title).await?;
        if created.title != title {
            debug!(conversation = %created.id, server_title = %created.title, "correcting title locally");
        }
        let conversation = Conversation { title, ..created };

        info!(conversation = %conversation.id, "created conversation");
        let id = conversation.id.clone();
        conversations.announce(conversation);
        self.selection = Selection::JustCreated(id.clone());
        Ok(id)
    }

    /// Record a selection change and decide whether the log must be reloaded.
    pub fn on_selection_changed(&mut self, selected: Option<&ConversationId>) -> SelectionEffect {
        let Some(selected) = selected else {
            self.selection = Selection::None;
            return SelectionEffect::Clear;
        };

        match &self.selection {
            Selection::JustCreated(id) if id == selected => {
                debug!(conversation = %id, "skipping reload for just-created conversation");
                self.selection = Selection::Selected(selected.clone());
                SelectionEffect::Skip
            }
            Selection::Selected(id) if id == selected => SelectionEffect::Skip,
            _ => {
                self.selection = Selection::Selected(selected.clone());
                SelectionEffect::ReloadHistory
            }
        }
    }
}

/// The first `max_chars` characters of a message.
#[must_use]
pub fn derive_title(message: &str, max_chars: usize) -> String {
    message.trim().chars().take(max_chars).collect()
}
