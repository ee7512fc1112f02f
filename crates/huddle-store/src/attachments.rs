use bytes::Bytes;
use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use huddle_shared::types::{ChunkId, MessageId};

use crate::database::Database;
use crate::error::{Result, StoreError};
use crate::models::{AttachmentChunk, AttachmentMetadata};

impl Database {
    pub fn insert_metadata(&self, meta: &AttachmentMetadata) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO attachment_metadata (id, name, mime, size, ratio, failed, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                params![
                    meta.id.to_string(),
                    meta.name,
                    meta.mime,
                    meta.size as i64,
                    meta.ratio as f64,
                    meta.failed as i32,
                    meta.created_at.to_rfc3339(),
                ],
            )
            .map_err(|e| duplicate_or(e, || meta.id.to_string()))?;
        Ok(())
    }

    pub fn get_metadata(&self, id: MessageId) -> Result<AttachmentMetadata> {
        self.conn()
            .query_row(
                "SELECT id, name, mime, size, ratio, failed, created_at
                 FROM attachment_metadata
                 WHERE id = ?1",
                params![id.to_string()],
                row_to_metadata,
            )
            .map_err(|e| match e {
                rusqlite::Error::QueryReturnedNoRows => StoreError::NotFound,
                other => StoreError::Sqlite(other),
            })
    }

    pub fn update_ratio(&self, id: MessageId, ratio: f32) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE attachment_metadata SET ratio = ?2 WHERE id = ?1",
            params![id.to_string(), ratio as f64],
        )?;
        require_row(affected)
    }

    pub fn mark_failed(&self, id: MessageId) -> Result<()> {
        let affected = self.conn().execute(
            "UPDATE attachment_metadata SET failed = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        require_row(affected)
    }

    pub fn delete_metadata(&self, id: MessageId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM attachment_metadata WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn insert_chunk(&self, chunk: &AttachmentChunk) -> Result<()> {
        self.conn()
            .execute(
                "INSERT INTO attachment_chunks (id, data, next_chunk_id) VALUES (?1, ?2, ?3)",
                params![
                    chunk.id.to_string(),
                    chunk.data.as_ref(),
                    chunk.next.map(|next| next.to_string()),
                ],
            )
            .map_err(|e| duplicate_or(e, || chunk.id.to_string()))?;
        Ok(())
    }

    pub fn get_chunk(&self, id: ChunkId) -> Result<AttachmentChunk> {
        let row = self
            .conn()
            .query_row(
                "SELECT data, next_chunk_id FROM attachment_chunks WHERE id = ?1",
                params![id.to_string()],
                |row| Ok((row.get::<_, Vec<u8>>(0)?, row.get::<_, Option<String>>(1)?)),
            )
            .optional()?;

        let (data, next) = row.ok_or(StoreError::NotFound)?;
        let next = next
            .map(|s| Uuid::parse_str(&s).map(ChunkId))
            .transpose()?;

        Ok(AttachmentChunk {
            id,
            data: Bytes::from(data),
            next,
        })
    }

    pub fn delete_chunk(&self, id: ChunkId) -> Result<bool> {
        let affected = self.conn().execute(
            "DELETE FROM attachment_chunks WHERE id = ?1",
            params![id.to_string()],
        )?;
        Ok(affected > 0)
    }

    pub fn count_chunks(&self) -> Result<usize> {
        let count: i64 = self
            .conn()
            .query_row("SELECT COUNT(*) FROM attachment_chunks", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

fn require_row(affected: usize) -> Result<()> {
    if affected == 0 {
        Err(StoreError::NotFound)
    } else {
        Ok(())
    }
}

fn duplicate_or(e: rusqlite::Error, id: impl FnOnce() -> String) -> StoreError {
    match e {
        rusqlite::Error::SqliteFailure(ref err, _)
            if err.code == rusqlite::ErrorCode::ConstraintViolation =>
        {
            StoreError::Duplicate(id())
        }
        other => StoreError::Sqlite(other),
    }
}

fn row_to_metadata(row: &rusqlite::Row<'_>) -> rusqlite::Result<AttachmentMetadata> {
    let id_str: String = row.get(0)?;
    let name: String = row.get(1)?;
    let mime: String = row.get(2)?;
    let size: i64 = row.get(3)?;
    let ratio: f64 = row.get(4)?;
    let failed_int: i32 = row.get(5)?;
    let created_str: String = row.get(6)?;

    let id = Uuid::parse_str(&id_str).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;

    let created_at: DateTime<Utc> = DateTime::parse_from_rfc3339(&created_str)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(6, rusqlite::types::Type::Text, Box::new(e))
        })?;

    Ok(AttachmentMetadata {
        id: MessageId(id),
        name,
        mime,
        size: size.max(0) as u64,
        ratio: ratio as f32,
        failed: failed_int != 0,
        created_at,
    })
}
