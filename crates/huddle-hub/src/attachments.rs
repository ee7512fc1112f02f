//! Attachment transfer actor.
//!
//! Owns the in-flight [`Upload`] table and the attachment store. An
//! attachment is uploaded as a run of chunks: every chunk of exactly
//! [`CHUNK_SIZE`] bytes is non-final, the first shorter chunk ends the
//! upload. Chunks are persisted as a linked list whose head has the message
//! id, so downloads and deletes walk it from there.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use huddle_shared::constants::CHUNK_SIZE;
use huddle_shared::protocol::ServerEvent;
use huddle_shared::types::{ChunkId, MessageId, UserId};
use huddle_store::{AttachmentChunk, AttachmentMetadata, AttachmentStore, StoreError};

use crate::connections::UserSender;
use crate::error::AttachmentError;
use crate::supervisor::guarded;

pub(crate) const ACTOR: &str = "attachments";

type Reply<T> = oneshot::Sender<Result<T, AttachmentError>>;

pub(crate) enum AttachmentCommand {
    RegisterMetadata {
        meta: AttachmentMetadata,
        reply: Reply<AttachmentMetadata>,
    },
    GetMetadata {
        id: MessageId,
        reply: Reply<AttachmentMetadata>,
    },
    UploadChunk {
        uploader: UserId,
        msg_id: MessageId,
        data: Bytes,
        audience: HashSet<UserId>,
        reply: Reply<ChunkAck>,
    },
    Delete {
        msg_id: MessageId,
        uploader: Option<UserId>,
        reply: Reply<bool>,
    },
    Download {
        msg_id: MessageId,
        reply: Reply<AttachmentDownload>,
    },
    UploaderDisconnected {
        uid: UserId,
    },
}

/// Acknowledgement for an accepted chunk.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ChunkAck {
    /// A non-final chunk was stored as chunk number `index`.
    Stored { index: u32, ratio: f32 },
    /// The final chunk was stored and the attachment is complete.
    Complete,
}

/// A complete attachment, read back in chunk order.
#[derive(Debug, Clone)]
pub struct AttachmentDownload {
    pub metadata: AttachmentMetadata,
    pub chunks: Vec<Bytes>,
}

impl AttachmentDownload {
    pub fn len(&self) -> usize {
        self.chunks.iter().map(Bytes::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type UploadKey = (UserId, MessageId);

#[derive(Debug)]
struct Upload {
    index: u32,
    total_bytes: u64,
    next_chunk_id: ChunkId,
    last_chunk: Instant,
    timed_out: bool,
    audience: HashSet<UserId>,
}

impl Upload {
    fn ratio(&self) -> f32 {
        if self.total_bytes == 0 {
            return 0.0;
        }
        let sent = self.index as f64 * CHUNK_SIZE as f64;
        (sent / self.total_bytes as f64) as f32
    }
}

/// An event for a set of users, delivered after the state change is done.
type Notice = (HashSet<UserId>, ServerEvent);

pub(crate) struct AttachmentManager<S> {
    store: S,
    uploads: HashMap<UploadKey, Upload>,
    users: UserSender,
    idle_limit: Duration,
    max_attachment_size: u64,
}

impl<S: AttachmentStore> AttachmentManager<S> {
    pub(crate) fn new(
        store: S,
        users: UserSender,
        idle_limit: Duration,
        max_attachment_size: u64,
    ) -> Self {
        Self {
            store,
            uploads: HashMap::new(),
            users,
            idle_limit,
            max_attachment_size,
        }
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::Receiver<AttachmentCommand>) {
        let mut sweep = interval(self.idle_limit);
        sweep.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // The first tick completes immediately.
        sweep.tick().await;

        loop {
            tokio::select! {
                command = rx.recv() => match command {
                    Some(command) => guarded(ACTOR, self.handle(command)).await,
                    None => break,
                },
                _ = sweep.tick() => {
                    guarded(ACTOR, async {
                        let notices = self.sweep(Instant::now());
                        notify(&self.users, notices).await;
                    })
                    .await;
                }
            }
        }
        debug!("Attachment manager stopped");
    }

    async fn handle(&mut self, command: AttachmentCommand) {
        match command {
            AttachmentCommand::RegisterMetadata { meta, reply } => {
                let _ = reply.send(self.register_metadata(meta));
            }
            AttachmentCommand::GetMetadata { id, reply } => {
                let _ = reply.send(self.get_metadata(id));
            }
            AttachmentCommand::UploadChunk {
                uploader,
                msg_id,
                data,
                audience,
                reply,
            } => {
                let (result, notice) =
                    self.accept_chunk(uploader, msg_id, data, audience, Instant::now());
                let _ = reply.send(result);
                notify(&self.users, notice).await;
            }
            AttachmentCommand::Delete {
                msg_id,
                uploader,
                reply,
            } => {
                let _ = reply.send(self.delete_attachment(msg_id, uploader));
            }
            AttachmentCommand::Download { msg_id, reply } => {
                let _ = reply.send(self.download(msg_id));
            }
            AttachmentCommand::UploaderDisconnected { uid } => {
                let notices = self.uploader_disconnected(uid);
                notify(&self.users, notices).await;
            }
        }
    }

    fn register_metadata(
        &mut self,
        mut meta: AttachmentMetadata,
    ) -> Result<AttachmentMetadata, AttachmentError> {
        let too_large = meta.size > self.max_attachment_size;
        meta.ratio = 0.0;
        meta.failed = too_large;

        self.store.insert_metadata(&meta).map_err(|e| match e {
            StoreError::Duplicate(_) => AttachmentError::AlreadyExists(meta.id),
            other => AttachmentError::Store(other),
        })?;

        if too_large {
            info!(msg = %meta.id, size = meta.size, "Attachment refused: too large");
            return Err(AttachmentError::TooLarge {
                size: meta.size,
                max: self.max_attachment_size,
            });
        }
        debug!(
            msg = %meta.id,
            size = meta.size,
            name = %meta.name,
            "Attachment metadata registered"
        );
        Ok(meta)
    }

    fn get_metadata(&self, id: MessageId) -> Result<AttachmentMetadata, AttachmentError> {
        self.store.get_metadata(id).map_err(|e| missing_as(e, id))
    }

    fn accept_chunk(
        &mut self,
        uploader: UserId,
        msg_id: MessageId,
        data: Bytes,
        audience: HashSet<UserId>,
        now: Instant,
    ) -> (Result<ChunkAck, AttachmentError>, Option<Notice>) {
        if data.len() > CHUNK_SIZE {
            return (
                Err(AttachmentError::ChunkTooLarge {
                    size: data.len(),
                    max: CHUNK_SIZE,
                }),
                None,
            );
        }

        let key = (uploader, msg_id);

        let refused = match self.store.get_metadata(msg_id) {
            Ok(meta) if meta.failed => Some(AttachmentError::Failed(msg_id)),
            Ok(meta) => {
                self.uploads.entry(key).or_insert_with(|| Upload {
                    index: 0,
                    total_bytes: meta.size,
                    next_chunk_id: ChunkId::new(),
                    last_chunk: now,
                    timed_out: false,
                    audience: HashSet::new(),
                });
                None
            }
            Err(StoreError::NotFound) => Some(AttachmentError::NoMetadata(msg_id)),
            Err(e) => return (Err(AttachmentError::Store(e)), None),
        };
        if let Some(err) = refused {
            self.uploads.remove(&key);
            self.cascade_delete(msg_id.into());
            if let Err(e) = self.store.delete_metadata(msg_id) {
                warn!(msg = %msg_id, "Failed to remove refused attachment metadata: {}", e);
            }
            debug!(msg = %msg_id, "Chunk refused: {}", err);
            return (Err(err), None);
        }

        let Some(upload) = self.uploads.get(&key) else {
            return (Err(AttachmentError::NoMetadata(msg_id)), None);
        };
        if upload.timed_out {
            return (Err(AttachmentError::TimedOut(msg_id)), None);
        }

        let is_final = data.len() < CHUNK_SIZE;
        let index = upload.index;
        let chunk = AttachmentChunk {
            id: if index == 0 {
                msg_id.into()
            } else {
                upload.next_chunk_id
            },
            data,
            next: (!is_final).then(ChunkId::new),
        };

        if let Err(e) = self.store.insert_chunk(&chunk) {
            warn!(msg = %msg_id, index, "Failed to store attachment chunk: {}", e);
            self.uploads.remove(&key);
            self.cascade_delete(msg_id.into());
            if let Err(e) = self.store.mark_failed(msg_id) {
                warn!(msg = %msg_id, "Failed to flag attachment as failed: {}", e);
            }
            let notice = (audience, progress(msg_id, 0.0, true));
            return (Err(AttachmentError::Store(e)), Some(notice));
        }

        if is_final {
            self.uploads.remove(&key);
            if let Err(e) = self.store.update_ratio(msg_id, 1.0) {
                warn!(msg = %msg_id, "Failed to record upload completion: {}", e);
            }
            info!(msg = %msg_id, chunks = index + 1, "Attachment upload complete");
            return (Ok(ChunkAck::Complete), Some((audience, progress(msg_id, 1.0, false))));
        }

        let Some(upload) = self.uploads.get_mut(&key) else {
            return (Err(AttachmentError::NoMetadata(msg_id)), None);
        };
        let ratio = upload.ratio();
        upload.index += 1;
        if let Some(next) = chunk.next {
            upload.next_chunk_id = next;
        }
        upload.last_chunk = now;
        upload.audience = audience.clone();

        if let Err(e) = self.store.update_ratio(msg_id, ratio) {
            warn!(msg = %msg_id, "Failed to record upload progress: {}", e);
        }
        (
            Ok(ChunkAck::Stored { index, ratio }),
            Some((audience, progress(msg_id, ratio, false))),
        )
    }

    /// Flag uploads idle for longer than the limit, tear down their chunks
    /// and mark their metadata failed. Uploads flagged by a previous sweep
    /// are evicted.
    fn sweep(&mut self, now: Instant) -> Vec<Notice> {
        let idle_limit = self.idle_limit;
        self.uploads.retain(|_, upload| !upload.timed_out);

        let expired: Vec<UploadKey> = self
            .uploads
            .iter()
            .filter(|(_, upload)| now.saturating_duration_since(upload.last_chunk) > idle_limit)
            .map(|(key, _)| *key)
            .collect();

        let mut notices = Vec::with_capacity(expired.len());
        for key in expired {
            let (uploader, msg_id) = key;
            let Some(upload) = self.uploads.get_mut(&key) else {
                continue;
            };
            upload.timed_out = true;
            let ratio = upload.ratio();
            let audience = upload.audience.clone();

            let removed = self.cascade_delete(msg_id.into());
            if let Err(e) = self.store.mark_failed(msg_id) {
                warn!(msg = %msg_id, "Failed to flag timed out attachment: {}", e);
            }
            warn!(
                msg = %msg_id,
                uploader = %uploader.short(),
                removed_chunks = removed,
                "Attachment upload timed out"
            );
            notices.push((audience, progress(msg_id, ratio, true)));
        }
        notices
    }

    fn uploader_disconnected(&mut self, uid: UserId) -> Vec<Notice> {
        let keys: Vec<UploadKey> = self
            .uploads
            .keys()
            .filter(|(uploader, _)| *uploader == uid)
            .copied()
            .collect();

        let mut notices = Vec::new();
        for key in keys {
            let Some(upload) = self.uploads.remove(&key) else {
                continue;
            };
            let msg_id = key.1;
            self.cascade_delete(msg_id.into());
            if upload.timed_out {
                continue;
            }
            if let Err(e) = self.store.mark_failed(msg_id) {
                warn!(msg = %msg_id, "Failed to flag abandoned attachment: {}", e);
            }
            info!(msg = %msg_id, "Attachment upload abandoned by disconnect");
            let ratio = upload.ratio();
            notices.push((upload.audience, progress(msg_id, ratio, true)));
        }
        notices
    }

    fn delete_attachment(
        &mut self,
        msg_id: MessageId,
        uploader: Option<UserId>,
    ) -> Result<bool, AttachmentError> {
        match uploader {
            Some(uid) => {
                self.uploads.remove(&(uid, msg_id));
            }
            None => self.uploads.retain(|(_, id), _| *id != msg_id),
        }
        let chunks = self.cascade_delete(msg_id.into());
        let had_metadata = self.store.delete_metadata(msg_id)?;
        debug!(msg = %msg_id, chunks, "Attachment deleted");
        Ok(had_metadata || chunks > 0)
    }

    fn download(&self, msg_id: MessageId) -> Result<AttachmentDownload, AttachmentError> {
        let metadata = self.get_metadata(msg_id)?;
        if metadata.failed {
            return Err(AttachmentError::Failed(msg_id));
        }
        if metadata.ratio < 1.0 {
            return Err(AttachmentError::Incomplete(msg_id));
        }

        let mut chunks = Vec::new();
        let mut next = Some(ChunkId::from(msg_id));
        while let Some(id) = next {
            let chunk = self.store.get_chunk(id).map_err(|e| match e {
                StoreError::NotFound => AttachmentError::Corrupt(msg_id),
                other => AttachmentError::Store(other),
            })?;
            chunks.push(chunk.data);
            next = chunk.next;
        }
        Ok(AttachmentDownload { metadata, chunks })
    }

    /// Delete the chunk list starting at `start`, following next pointers
    /// until the end or the first missing link. Returns how many chunks
    /// were removed.
    fn cascade_delete(&mut self, start: ChunkId) -> usize {
        let mut removed = 0;
        let mut next = Some(start);
        while let Some(id) = next {
            let chunk = match self.store.get_chunk(id) {
                Ok(chunk) => chunk,
                Err(StoreError::NotFound) => break,
                Err(e) => {
                    warn!(chunk = %id, "Chunk lookup failed during delete: {}", e);
                    break;
                }
            };
            match self.store.delete_chunk(id) {
                Ok(_) => removed += 1,
                Err(e) => {
                    warn!(chunk = %id, "Chunk delete failed: {}", e);
                    break;
                }
            }
            next = chunk.next;
        }
        removed
    }
}

// Takes the sender rather than the manager so the store never has to be `Sync`.
async fn notify(users: &UserSender, notices: impl IntoIterator<Item = Notice>) {
    for (audience, event) in notices {
        users.send_event(audience, &event).await;
    }
}

fn progress(id: MessageId, ratio: f32, failed: bool) -> ServerEvent {
    ServerEvent::AttachmentProgress { id, ratio, failed }
}

fn missing_as(e: StoreError, id: MessageId) -> AttachmentError {
    match e {
        StoreError::NotFound => AttachmentError::NoMetadata(id),
        other => AttachmentError::Store(other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connections::ConnectionCommand;
    use huddle_store::{MemoryStore, Result as StoreResult};

    const MIB: usize = 1024 * 1024;

    /// Wraps a [`MemoryStore`] and fails chunk writes once `fail_after`
    /// chunks have been stored.
    struct FlakyStore {
        inner: MemoryStore,
        fail_after: usize,
        written: usize,
    }

    impl AttachmentStore for FlakyStore {
        fn insert_metadata(&mut self, meta: &AttachmentMetadata) -> StoreResult<()> {
            self.inner.insert_metadata(meta)
        }
        fn get_metadata(&self, id: MessageId) -> StoreResult<AttachmentMetadata> {
            self.inner.get_metadata(id)
        }
        fn update_ratio(&mut self, id: MessageId, ratio: f32) -> StoreResult<()> {
            self.inner.update_ratio(id, ratio)
        }
        fn mark_failed(&mut self, id: MessageId) -> StoreResult<()> {
            self.inner.mark_failed(id)
        }
        fn delete_metadata(&mut self, id: MessageId) -> StoreResult<bool> {
            self.inner.delete_metadata(id)
        }
        fn insert_chunk(&mut self, chunk: &AttachmentChunk) -> StoreResult<()> {
            if self.written >= self.fail_after {
                return Err(StoreError::Io(std::io::Error::other("disk full")));
            }
            self.written += 1;
            self.inner.insert_chunk(chunk)
        }
        fn get_chunk(&self, id: ChunkId) -> StoreResult<AttachmentChunk> {
            self.inner.get_chunk(id)
        }
        fn delete_chunk(&mut self, id: ChunkId) -> StoreResult<bool> {
            self.inner.delete_chunk(id)
        }
    }

    fn manager<S: AttachmentStore>(
        store: S,
    ) -> (AttachmentManager<S>, mpsc::Receiver<ConnectionCommand>) {
        let (tx, rx) = mpsc::channel(64);
        let mgr = AttachmentManager::new(
            store,
            UserSender::new(tx),
            Duration::from_secs(15),
            20 * MIB as u64,
        );
        (mgr, rx)
    }

    fn register<S: AttachmentStore>(mgr: &mut AttachmentManager<S>, size: usize) -> MessageId {
        let id = MessageId::new();
        mgr.register_metadata(AttachmentMetadata::new(
            id,
            "file.bin".into(),
            "application/octet-stream".into(),
            size as u64,
        ))
        .unwrap();
        id
    }

    fn bytes(len: usize) -> Bytes {
        Bytes::from(vec![7u8; len])
    }

    fn ratio_of(notice: &Option<Notice>) -> (f32, bool) {
        match notice {
            Some((_, ServerEvent::AttachmentProgress { ratio, failed, .. })) => (*ratio, *failed),
            other => panic!("expected progress notice, got {other:?}"),
        }
    }

    #[test]
    fn test_three_chunk_upload() {
        let (mut mgr, _rx) = manager(MemoryStore::new());
        let uploader = UserId::new();
        let viewer = UserId::new();
        let msg = register(&mut mgr, 9 * MIB);
        let audience = HashSet::from([viewer]);
        let now = Instant::now();

        let (ack, notice) = mgr.accept_chunk(uploader, msg, bytes(4 * MIB), audience.clone(), now);
        assert_eq!(ack.unwrap(), ChunkAck::Stored { index: 0, ratio: 0.0 });
        assert_eq!(ratio_of(&notice), (0.0, false));
        assert_eq!(mgr.uploads[&(uploader, msg)].index, 1);

        let (ack, notice) = mgr.accept_chunk(uploader, msg, bytes(4 * MIB), audience.clone(), now);
        assert!(matches!(ack.unwrap(), ChunkAck::Stored { index: 1, .. }));
        let (ratio, failed) = ratio_of(&notice);
        assert!((ratio - 4.0 / 9.0).abs() < 1e-3);
        assert!(!failed);

        let (ack, notice) = mgr.accept_chunk(uploader, msg, bytes(MIB), audience.clone(), now);
        assert_eq!(ack.unwrap(), ChunkAck::Complete);
        assert_eq!(ratio_of(&notice), (1.0, false));
        assert_eq!(notice.unwrap().0, audience);
        assert!(mgr.uploads.is_empty());

        // first -> second -> third
        assert_eq!(mgr.store.chunk_count(), 3);
        let first = mgr.store.get_chunk(msg.into()).unwrap();
        let second = mgr.store.get_chunk(first.next.unwrap()).unwrap();
        let third = mgr.store.get_chunk(second.next.unwrap()).unwrap();
        assert_eq!(third.next, None);
        assert_eq!(third.data.len(), MIB);

        let download = mgr.download(msg).unwrap();
        assert_eq!(download.chunks.len(), 3);
        assert_eq!(download.len(), 9 * MIB);
        assert!(download.metadata.is_complete());
    }

    #[test]
    fn test_exact_chunk_size_is_not_final() {
        let (mut mgr, _rx) = manager(MemoryStore::new());
        let uploader = UserId::new();
        let msg = register(&mut mgr, 4 * MIB);

        let (ack, _) =
            mgr.accept_chunk(uploader, msg, bytes(4 * MIB), HashSet::new(), Instant::now());
        assert!(matches!(ack.unwrap(), ChunkAck::Stored { index: 0, .. }));
        assert!(mgr.uploads.contains_key(&(uploader, msg)));
        assert!(matches!(mgr.download(msg), Err(AttachmentError::Incomplete(_))));

        // An empty chunk terminates it.
        let (ack, _) =
            mgr.accept_chunk(uploader, msg, Bytes::new(), HashSet::new(), Instant::now());
        assert_eq!(ack.unwrap(), ChunkAck::Complete);
        assert_eq!(mgr.download(msg).unwrap().len(), 4 * MIB);
    }

    #[test]
    fn test_oversized_chunk_rejected() {
        let (mut mgr, _rx) = manager(MemoryStore::new());
        let msg = register(&mut mgr, 9 * MIB);
        let (ack, notice) = mgr.accept_chunk(
            UserId::new(),
            msg,
            bytes(4 * MIB + 1),
            HashSet::new(),
            Instant::now(),
        );
        assert!(matches!(ack, Err(AttachmentError::ChunkTooLarge { .. })));
        assert!(notice.is_none());
        assert_eq!(mgr.store.chunk_count(), 0);
    }

    #[test]
    fn test_chunk_without_metadata_rejected() {
        let (mut mgr, _rx) = manager(MemoryStore::new());
        let msg = MessageId::new();
        let (ack, _) =
            mgr.accept_chunk(UserId::new(), msg, bytes(10), HashSet::new(), Instant::now());
        assert!(matches!(ack, Err(AttachmentError::NoMetadata(id)) if id == msg));
        assert_eq!(mgr.store.chunk_count(), 0);
        assert!(mgr.uploads.is_empty());
    }

    #[test]
    fn test_too_large_metadata_refuses_chunks() {
        let (mut mgr, _rx) = manager(MemoryStore::new());
        let msg = MessageId::new();
        let result = mgr.register_metadata(AttachmentMetadata::new(
            msg,
            "huge.iso".into(),
            "application/octet-stream".into(),
            21 * MIB as u64,
        ));
        assert!(matches!(result, Err(AttachmentError::TooLarge { .. })));
        assert!(mgr.get_metadata(msg).unwrap().failed);

        let (ack, _) =
            mgr.accept_chunk(UserId::new(), msg, bytes(10), HashSet::new(), Instant::now());
        assert!(matches!(ack, Err(AttachmentError::Failed(_))));
        // Refusal removes the failed metadata as well.
        assert!(matches!(mgr.get_metadata(msg), Err(AttachmentError::NoMetadata(_))));
    }

    #[test]
    fn test_duplicate_metadata() {
        let (mut mgr, _rx) = manager(MemoryStore::new());
        let msg = register(&mut mgr, 10);
        let again = mgr.register_metadata(AttachmentMetadata::new(msg, "x".into(), "y".into(), 10));
        assert!(matches!(again, Err(AttachmentError::AlreadyExists(id)) if id == msg));
    }

    #[test]
    fn test_sweep_times_out_idle_upload() {
        let (mut mgr, _rx) = manager(MemoryStore::new());
        let uploader = UserId::new();
        let viewer = UserId::new();
        let msg = register(&mut mgr, 9 * MIB);
        let start = Instant::now();

        mgr.accept_chunk(uploader, msg, bytes(4 * MIB), HashSet::from([viewer]), start)
            .0
            .unwrap();
        assert_eq!(mgr.store.chunk_count(), 1);

        // Not idle long enough yet.
        assert!(mgr.sweep(start + Duration::from_secs(15)).is_empty());

        let notices = mgr.sweep(start + Duration::from_secs(16));
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].0, HashSet::from([viewer]));
        assert!(matches!(
            notices[0].1,
            ServerEvent::AttachmentProgress { failed: true, .. }
        ));
        assert_eq!(mgr.store.chunk_count(), 0);
        assert!(mgr.get_metadata(msg).unwrap().failed);
        assert!(mgr.uploads[&(uploader, msg)].timed_out);

        // Later chunks are refused and nothing new is stored.
        let later = start + Duration::from_secs(17);
        let (ack, notice) = mgr.accept_chunk(uploader, msg, bytes(4 * MIB), HashSet::new(), later);
        assert!(ack.is_err());
        assert!(notice.is_none());
        assert_eq!(mgr.store.chunk_count(), 0);
    }

    #[test]
    fn test_timed_out_upload_rejects_silently_until_evicted() {
        let (mut mgr, _rx) = manager(MemoryStore::new());
        let uploader = UserId::new();
        let msg = register(&mut mgr, 9 * MIB);
        let start = Instant::now();
        mgr.accept_chunk(uploader, msg, bytes(4 * MIB), HashSet::new(), start)
            .0
            .unwrap();

        // Flag as timed out without touching the metadata.
        mgr.uploads.get_mut(&(uploader, msg)).unwrap().timed_out = true;
        let (ack, notice) = mgr.accept_chunk(uploader, msg, bytes(4 * MIB), HashSet::new(), start);
        assert!(matches!(ack, Err(AttachmentError::TimedOut(_))));
        assert!(notice.is_none());
        assert_eq!(mgr.store.chunk_count(), 1);

        // The next sweep evicts it.
        assert!(mgr.sweep(start).is_empty());
        assert!(mgr.uploads.is_empty());
    }

    #[test]
    fn test_delete_completed_attachment_leaves_no_orphans() {
        let (mut mgr, _rx) = manager(MemoryStore::new());
        let uploader = UserId::new();
        let msg = register(&mut mgr, 9 * MIB);
        let now = Instant::now();
        for len in [4 * MIB, 4 * MIB, MIB] {
            mgr.accept_chunk(uploader, msg, bytes(len), HashSet::new(), now)
                .0
                .unwrap();
        }
        assert_eq!(mgr.store.chunk_count(), 3);

        assert!(mgr.delete_attachment(msg, Some(uploader)).unwrap());
        assert_eq!(mgr.store.chunk_count(), 0);
        assert_eq!(mgr.store.metadata_count(), 0);
        assert!(!mgr.delete_attachment(msg, Some(uploader)).unwrap());
    }

    #[test]
    fn test_cascade_stops_at_missing_link() {
        let (mut mgr, _rx) = manager(MemoryStore::new());
        let head = ChunkId::new();
        mgr.store
            .insert_chunk(&AttachmentChunk {
                id: head,
                data: bytes(1),
                next: Some(ChunkId::new()),
            })
            .unwrap();
        assert_eq!(mgr.cascade_delete(head), 1);
        assert_eq!(mgr.cascade_delete(head), 0);
    }

    #[test]
    fn test_long_chain_deletes_iteratively() {
        let (mut mgr, _rx) = manager(MemoryStore::new());
        let ids: Vec<ChunkId> = (0..10_000).map(|_| ChunkId::new()).collect();
        for (i, id) in ids.iter().enumerate() {
            mgr.store
                .insert_chunk(&AttachmentChunk {
                    id: *id,
                    data: Bytes::new(),
                    next: ids.get(i + 1).copied(),
                })
                .unwrap();
        }
        assert_eq!(mgr.cascade_delete(ids[0]), 10_000);
        assert_eq!(mgr.store.chunk_count(), 0);
    }

    #[test]
    fn test_store_failure_cleans_up() {
        let store = FlakyStore {
            inner: MemoryStore::new(),
            fail_after: 2,
            written: 0,
        };
        let (mut mgr, _rx) = manager(store);
        let uploader = UserId::new();
        let msg = register(&mut mgr, 12 * MIB);
        let now = Instant::now();

        for _ in 0..2 {
            mgr.accept_chunk(uploader, msg, bytes(4 * MIB), HashSet::new(), now)
                .0
                .unwrap();
        }
        let (ack, notice) = mgr.accept_chunk(uploader, msg, bytes(4 * MIB), HashSet::new(), now);
        assert!(matches!(ack, Err(AttachmentError::Store(_))));
        assert!(ratio_of(&notice).1);
        assert_eq!(mgr.store.inner.chunk_count(), 0);
        assert!(mgr.uploads.is_empty());
        assert!(mgr.get_metadata(msg).unwrap().failed);
    }

    #[test]
    fn test_disconnect_tears_down_uploads() {
        let (mut mgr, _rx) = manager(MemoryStore::new());
        let uploader = UserId::new();
        let other = UserId::new();
        let mine = register(&mut mgr, 9 * MIB);
        let theirs = register(&mut mgr, 9 * MIB);
        let now = Instant::now();
        mgr.accept_chunk(uploader, mine, bytes(4 * MIB), HashSet::new(), now)
            .0
            .unwrap();
        mgr.accept_chunk(other, theirs, bytes(4 * MIB), HashSet::new(), now)
            .0
            .unwrap();

        let notices = mgr.uploader_disconnected(uploader);
        assert_eq!(notices.len(), 1);
        assert!(!mgr.uploads.contains_key(&(uploader, mine)));
        assert!(mgr.uploads.contains_key(&(other, theirs)));
        assert_eq!(mgr.store.chunk_count(), 1);
        assert!(mgr.get_metadata(mine).unwrap().failed);
    }

    #[test]
    fn test_download_guards() {
        let (mut mgr, _rx) = manager(MemoryStore::new());
        assert!(matches!(
            mgr.download(MessageId::new()),
            Err(AttachmentError::NoMetadata(_))
        ));

        let msg = register(&mut mgr, 10);
        assert!(matches!(mgr.download(msg), Err(AttachmentError::Incomplete(_))));

        mgr.store.mark_failed(msg).unwrap();
        assert!(matches!(mgr.download(msg), Err(AttachmentError::Failed(_))));
    }

    #[tokio::test]
    async fn test_progress_delivered_to_audience() {
        let (mut mgr, mut rx) = manager(MemoryStore::new());
        let viewer = UserId::new();
        let msg = register(&mut mgr, 5);
        let (reply, ack) = oneshot::channel();
        mgr.handle(AttachmentCommand::UploadChunk {
            uploader: UserId::new(),
            msg_id: msg,
            data: bytes(5),
            audience: HashSet::from([viewer]),
            reply,
        })
        .await;
        assert_eq!(ack.await.unwrap().unwrap(), ChunkAck::Complete);

        match rx.try_recv() {
            Ok(ConnectionCommand::SendToUsers { uids, frame }) => {
                assert_eq!(uids, HashSet::from([viewer]));
                let value: serde_json::Value = serde_json::from_str(frame.as_str()).unwrap();
                assert_eq!(value["TYPE"], "ATTACHMENT_PROGRESS");
                assert_eq!(value["ID"], msg.to_string());
                assert_eq!(value["ratio"], 1.0);
                assert_eq!(value["failed"], false);
            }
            _ => panic!("expected a progress delivery"),
        }
    }
}
