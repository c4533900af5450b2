//! The client's list of conversations.

use tracing::debug;

use crate::error::{CoreError, Result};
use crate::ids::ConversationId;
use crate::types::Conversation;

/// Conversations known to the client, newest first as delivered by the service.
#[derive(Debug, Clone, Default)]
pub struct ConversationList {
    items: Vec<Conversation>,
}

impl ConversationList {
    /// An empty list.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the whole list with a fresh listing from the service.
    pub fn replace_all(&mut self, conversations: Vec<Conversation>) {
        self.items = conversations;
    }

    /// Insert a just-created conversation at the front.
    ///
    /// Returns `false` if a conversation with that id is already listed.
    pub fn announce(&mut self, conversation: Conversation) -> bool {
        if self.contains(&conversation.id) {
            debug!(conversation = %conversation.id, "conversation already announced");
            return false;
        }
        self.items.insert(0, conversation);
        true
    }

    /// Apply a title correction pushed by the side channel.
    ///
    /// Unknown ids are ignored; returns whether a title changed.
    pub fn apply_title_update(&mut self, id: &ConversationId, title: &str) -> bool {
        match self.items.iter_mut().find(|c| &c.id == id) {
            Some(conversation) if conversation.title != title => {
                conversation.title = title.to_string();
                true
            }
            _ => false,
        }
    }

    /// Set the title after a successful rename.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConversationNotFound`] if the id is not listed.
    pub fn rename(&mut self, id: &ConversationId, title: impl Into<String>) -> Result<()> {
        self.get_mut(id)?.title = title.into();
        Ok(())
    }

    /// Set the pinned flag after a successful pin toggle.
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::ConversationNotFound`] if the id is not listed.
    pub fn set_pinned(&mut self, id: &ConversationId, pinned: bool) -> Result<()> {
        self.get_mut(id)?.is_pinned = pinned;
        Ok(())
    }

    /// Remove a conversation, returning it if it was listed.
    pub fn remove(&mut self, id: &ConversationId) -> Option<Conversation> {
        let index = self.items.iter().position(|c| &c.id == id)?;
        Some(self.items.remove(index))
    }

    /// Look up a conversation.
    #[must_use]
    pub fn get(&self, id: &ConversationId) -> Option<&Conversation> {
        self.items.iter().find(|c| &c.id == id)
    }

    /// Whether the id is listed.
    #[must_use]
    pub fn contains(&self, id: &ConversationId) -> bool {
        self.get(id).is_some()
    }

    /// Conversations in service order.
    #[must_use]
    pub fn iter(&self) -> std::slice::Iter<'_, Conversation> {
        self.items.iter()
    }

    /// Pinned conversations first, otherwise in service order.
    #[must_use]
    pub fn sorted(&self) -> Vec<&Conversation> {
        let mut sorted: Vec<&Conversation> = self.items.iter().collect();
        sorted.sort_by_key(|c| !c.is_pinned);
        sorted
    }

    /// Number of conversations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.items.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    fn get_mut(&mut self, id: &ConversationId) -> Result<&mut Conversation> {
        self.items
            .iter_mut()
            .find(|c| &c.id == id)
            .ok_or_else(|| CoreError::ConversationNotFound(id.clone()))
    }
}

impl<'a> IntoIterator for &'a ConversationList {
    type Item = &'a Conversation;
    type IntoIter = std::slice::Iter<'a, Conversation>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn conversation(id: &str, title: &str, pinned: bool) -> Conversation {
        Conversation {
            id: ConversationId::new(id).unwrap(),
            title: title.to_string(),
            timestamp: String::new(),
            is_pinned: pinned,
        }
    }

    fn id(raw: &str) -> ConversationId {
        ConversationId::new(raw).unwrap()
    }

    #[test]
    fn announce_once() {
        let mut list = ConversationList::new();
        assert!(list.announce(conversation("a", "First", false)));
        assert!(!list.announce(conversation("a", "First again", false)));
        assert_eq!(list.len(), 1);
        assert_eq!(list.get(&id("a")).unwrap().title, "First");
    }

    #[test]
    fn announce_inserts_at_front() {
        let mut list = ConversationList::new();
        list.replace_all(vec![conversation("old", "Old", false)]);
        list.announce(conversation("new", "New", false));
        let ids: Vec<_> = list.iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["new", "old"]);
    }

    #[test]
    fn title_update_applies_to_matching_conversation() {
        let mut list = ConversationList::new();
        list.replace_all(vec![conversation("a", "Explain recursion", false)]);
        assert!(list.apply_title_update(&id("a"), "Recursion basics"));
        assert!(!list.apply_title_update(&id("a"), "Recursion basics"));
        assert!(!list.apply_title_update(&id("missing"), "x"));
        assert_eq!(list.get(&id("a")).unwrap().title, "Recursion basics");
    }

    #[test]
    fn sorted_puts_pinned_first_and_keeps_order() {
        let mut list = ConversationList::new();
        list.replace_all(vec![
            conversation("a", "A", false),
            conversation("b", "B", true),
            conversation("c", "C", false),
            conversation("d", "D", true),
        ]);
        let ids: Vec<_> = list.sorted().iter().map(|c| c.id.as_str()).collect();
        assert_eq!(ids, ["b", "d", "a", "c"]);
    }

    #[test]
    fn rename_pin_remove() {
        let mut list = ConversationList::new();
        list.replace_all(vec![conversation("a", "A", false)]);
        list.rename(&id("a"), "Renamed").unwrap();
        list.set_pinned(&id("a"), true).unwrap();
        assert!(list.get(&id("a")).unwrap().is_pinned);
        assert!(matches!(
            list.rename(&id("zz"), "x"),
            Err(CoreError::ConversationNotFound(_))
        ));
        assert_eq!(list.remove(&id("a")).unwrap().title, "Renamed");
        assert!(list.is_empty());
        assert!(list.remove(&id("a")).is_none());
    }
}
