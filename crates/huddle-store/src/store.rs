use huddle_shared::types::{ChunkId, MessageId};

use crate::database::Database;
use crate::error::Result;
use crate::models::{AttachmentChunk, AttachmentMetadata};

/// Storage operations the attachment manager needs.
///
/// Lookups return [`StoreError::NotFound`] for missing records. The store is
/// owned by a single task, so implementations need `Send` but not `Sync`.
///
/// [`StoreError::NotFound`]: crate::StoreError::NotFound
pub trait AttachmentStore: Send {
    fn insert_metadata(&mut self, meta: &AttachmentMetadata) -> Result<()>;
    fn get_metadata(&self, id: MessageId) -> Result<AttachmentMetadata>;
    fn update_ratio(&mut self, id: MessageId, ratio: f32) -> Result<()>;
    fn mark_failed(&mut self, id: MessageId) -> Result<()>;
    fn delete_metadata(&mut self, id: MessageId) -> Result<bool>;

    fn insert_chunk(&mut self, chunk: &AttachmentChunk) -> Result<()>;
    fn get_chunk(&self, id: ChunkId) -> Result<AttachmentChunk>;
    fn delete_chunk(&mut self, id: ChunkId) -> Result<bool>;
}

impl AttachmentStore for Database {
    fn insert_metadata(&mut self, meta: &AttachmentMetadata) -> Result<()> {
        Database::insert_metadata(self, meta)
    }

    fn get_metadata(&self, id: MessageId) -> Result<AttachmentMetadata> {
        Database::get_metadata(self, id)
    }

    fn update_ratio(&mut self, id: MessageId, ratio: f32) -> Result<()> {
        Database::update_ratio(self, id, ratio)
    }

    fn mark_failed(&mut self, id: MessageId) -> Result<()> {
        Database::mark_failed(self, id)
    }

    fn delete_metadata(&mut self, id: MessageId) -> Result<bool> {
        Database::delete_metadata(self, id)
    }

    fn insert_chunk(&mut self, chunk: &AttachmentChunk) -> Result<()> {
        Database::insert_chunk(self, chunk)
    }

    fn get_chunk(&self, id: ChunkId) -> Result<AttachmentChunk> {
        Database::get_chunk(self, id)
    }

    fn delete_chunk(&mut self, id: ChunkId) -> Result<bool> {
        Database::delete_chunk(self, id)
    }
}

impl<S: AttachmentStore + ?Sized> AttachmentStore for Box<S> {
    fn insert_metadata(&mut self, meta: &AttachmentMetadata) -> Result<()> {
        (**self).insert_metadata(meta)
    }

    fn get_metadata(&self, id: MessageId) -> Result<AttachmentMetadata> {
        (**self).get_metadata(id)
    }

    fn update_ratio(&mut self, id: MessageId, ratio: f32) -> Result<()> {
        (**self).update_ratio(id, ratio)
    }

    fn mark_failed(&mut self, id: MessageId) -> Result<()> {
        (**self).mark_failed(id)
    }

    fn delete_metadata(&mut self, id: MessageId) -> Result<bool> {
        (**self).delete_metadata(id)
    }

    fn insert_chunk(&mut self, chunk: &AttachmentChunk) -> Result<()> {
        (**self).insert_chunk(chunk)
    }

    fn get_chunk(&self, id: ChunkId) -> Result<AttachmentChunk> {
        (**self).get_chunk(id)
    }

    fn delete_chunk(&mut self, id: ChunkId) -> Result<bool> {
        (**self).delete_chunk(id)
    }
}
