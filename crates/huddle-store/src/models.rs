//! Records persisted by the attachment store.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use huddle_shared::types::{ChunkId, MessageId};

/// Metadata registered for a message's attachment before any chunk arrives.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AttachmentMetadata {
    /// Same id as the message the attachment belongs to.
    #[serde(rename = "ID")]
    pub id: MessageId,
    /// Original file name.
    pub name: String,
    /// MIME type declared by the uploader.
    #[serde(rename = "meta")]
    pub mime: String,
    /// Declared total size in bytes.
    pub size: u64,
    /// Upload progress, 0.0 ..= 1.0. Exactly 1.0 once the final chunk is stored.
    pub ratio: f32,
    /// Set when the upload was abandoned or refused.
    pub failed: bool,
    #[serde(skip)]
    pub created_at: DateTime<Utc>,
}

impl AttachmentMetadata {
    pub fn new(id: MessageId, name: String, mime: String, size: u64) -> Self {
        Self {
            id,
            name,
            mime,
            size,
            ratio: 0.0,
            failed: false,
            created_at: Utc::now(),
        }
    }

    pub fn is_complete(&self) -> bool {
        !self.failed && self.ratio >= 1.0
    }
}

/// One node of an attachment's chunk list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttachmentChunk {
    pub id: ChunkId,
    pub data: Bytes,
    /// `None` on the last chunk.
    pub next: Option<ChunkId>,
}
