use std::collections::HashMap;

use huddle_shared::types::{ChunkId, MessageId};

use crate::error::{Result, StoreError};
use crate::models::{AttachmentChunk, AttachmentMetadata};
use crate::store::AttachmentStore;

/// In-memory attachment store. Nothing survives a restart.
#[derive(Debug, Default, Clone)]
pub struct MemoryStore {
    metadata: HashMap<MessageId, AttachmentMetadata>,
    chunks: HashMap<ChunkId, AttachmentChunk>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }

    pub fn metadata_count(&self) -> usize {
        self.metadata.len()
    }
}

impl AttachmentStore for MemoryStore {
    fn insert_metadata(&mut self, meta: &AttachmentMetadata) -> Result<()> {
        if self.metadata.contains_key(&meta.id) {
            return Err(StoreError::Duplicate(meta.id.to_string()));
        }
        self.metadata.insert(meta.id, meta.clone());
        Ok(())
    }

    fn get_metadata(&self, id: MessageId) -> Result<AttachmentMetadata> {
        self.metadata.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    fn update_ratio(&mut self, id: MessageId, ratio: f32) -> Result<()> {
        let meta = self.metadata.get_mut(&id).ok_or(StoreError::NotFound)?;
        meta.ratio = ratio;
        Ok(())
    }

    fn mark_failed(&mut self, id: MessageId) -> Result<()> {
        let meta = self.metadata.get_mut(&id).ok_or(StoreError::NotFound)?;
        meta.failed = true;
        Ok(())
    }

    fn delete_metadata(&mut self, id: MessageId) -> Result<bool> {
        Ok(self.metadata.remove(&id).is_some())
    }

    fn insert_chunk(&mut self, chunk: &AttachmentChunk) -> Result<()> {
        if self.chunks.contains_key(&chunk.id) {
            return Err(StoreError::Duplicate(chunk.id.to_string()));
        }
        self.chunks.insert(chunk.id, chunk.clone());
        Ok(())
    }

    fn get_chunk(&self, id: ChunkId) -> Result<AttachmentChunk> {
        self.chunks.get(&id).cloned().ok_or(StoreError::NotFound)
    }

    fn delete_chunk(&mut self, id: ChunkId) -> Result<bool> {
        Ok(self.chunks.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;

    #[test]
    fn test_memory_store_matches_trait_contract() {
        let mut store = MemoryStore::new();
        let meta =
            AttachmentMetadata::new(MessageId::new(), "a.txt".into(), "text/plain".into(), 3);

        store.insert_metadata(&meta).unwrap();
        assert!(matches!(
            store.insert_metadata(&meta),
            Err(StoreError::Duplicate(_))
        ));
        store.update_ratio(meta.id, 1.0).unwrap();
        assert!(store.get_metadata(meta.id).unwrap().is_complete());

        let chunk = AttachmentChunk {
            id: ChunkId::from(meta.id),
            data: Bytes::from_static(b"abc"),
            next: None,
        };
        store.insert_chunk(&chunk).unwrap();
        assert_eq!(store.get_chunk(chunk.id).unwrap(), chunk);
        assert!(store.delete_chunk(chunk.id).unwrap());
        assert!(store.get_chunk(chunk.id).unwrap_err().is_not_found());
        assert!(store.update_ratio(MessageId::new(), 0.1).unwrap_err().is_not_found());
    }
}
