//! Progress of documents being ingested by the service.
//!
//! Fed by `upload_progress` events on an upload-batch channel.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Processing stage of an uploaded document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadStatus {
    /// Received, not yet processed.
    Pending,
    /// Being chunked and indexed.
    Processing,
    /// Ready to be selected for queries.
    Completed,
    /// Ingestion failed.
    Error,
}

impl UploadStatus {
    /// Parse a wire status, treating unknown values as `Processing`.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        match raw {
            "pending" => Self::Pending,
            "completed" => Self::Completed,
            "error" => Self::Error,
            _ => Self::Processing,
        }
    }

    /// Whether no further progress will be reported.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Error)
    }
}

impl fmt::Display for UploadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Completed => "completed",
            Self::Error => "error",
        };
        f.write_str(s)
    }
}

/// One `upload_progress` notice.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct UploadProgress {
    /// Document being ingested.
    pub doc_id: String,
    /// Original file name.
    pub filename: String,
    /// Raw status string.
    pub status: String,
    /// Human-readable detail.
    #[serde(default)]
    pub message: String,
    /// Chunks processed so far.
    #[serde(default)]
    pub current_chunk: Option<u64>,
    /// Total chunks to process.
    #[serde(default)]
    pub total_chunks: Option<u64>,
}

impl UploadProgress {
    /// Completion percentage in `0..=100`.
    #[must_use]
    pub fn percent(&self) -> u8 {
        match (self.current_chunk, self.total_chunks) {
            (Some(current), Some(total)) if current > 0 && total > 0 => {
                // round(current / total * 100) in integer arithmetic
                let (current, total) = (u128::from(current), u128::from(total));
                let rounded = (current * 200 + total) / (2 * total);
                u8::try_from(rounded.min(100)).unwrap_or(100)
            }
            _ if UploadStatus::parse(&self.status) == UploadStatus::Completed => 100,
            _ => 0,
        }
    }
}

/// A document whose ingestion is being tracked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InProgressFile {
    /// Document id.
    pub doc_id: String,
    /// Original file name.
    pub filename: String,
    /// Current stage.
    pub status: UploadStatus,
    /// Percentage complete.
    pub progress: u8,
    /// Latest detail message.
    pub message: String,
}

/// Per-document upload progress, in first-seen order.
#[derive(Debug, Clone, Default)]
pub struct UploadTracker {
    files: Vec<InProgressFile>,
}

impl UploadTracker {
    /// An empty tracker.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a progress notice and return the document's new status.
    pub fn apply(&mut self, event: &UploadProgress) -> UploadStatus {
        let status = UploadStatus::parse(&event.status);
        let entry = InProgressFile {
            doc_id: event.doc_id.clone(),
            filename: event.filename.clone(),
            status,
            progress: event.percent(),
            message: event.message.clone(),
        };

        match self.files.iter_mut().find(|f| f.doc_id == event.doc_id) {
            Some(existing) => *existing = entry,
            None => self.files.push(entry),
        }
        status
    }

    /// Stop tracking a document.
    pub fn remove(&mut self, doc_id: &str) -> Option<InProgressFile> {
        let index = self.files.iter().position(|f| f.doc_id == doc_id)?;
        Some(self.files.remove(index))
    }

    /// Tracked documents.
    #[must_use]
    pub fn files(&self) -> &[InProgressFile] {
        &self.files
    }

    /// Whether every tracked document reached a terminal status.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.files.iter().all(|f| f.status.is_terminal())
    }
}
