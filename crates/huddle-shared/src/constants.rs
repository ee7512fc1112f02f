use std::time::Duration;

/// Size of one attachment chunk (4 MiB). A chunk shorter than this ends the
/// upload; a chunk of exactly this size never does.
pub const CHUNK_SIZE: usize = 4 * 1024 * 1024;

/// Largest attachment a client may declare (20 MiB)
pub const MAX_ATTACHMENT_SIZE: u64 = 20 * 1024 * 1024;

/// Maximum number of topics a single connection may be subscribed to
pub const MAX_SUBSCRIPTIONS_PER_CONNECTION: usize = 128;

/// Interval of the upload timeout sweep, also the idle limit for an upload
pub const UPLOAD_SWEEP_INTERVAL: Duration = Duration::from_secs(15);

/// Capacity of each actor's command channel
pub const COMMAND_BUFFER: usize = 64;

/// Capacity of each connection's outbound queue
pub const OUTBOX_BUFFER: usize = 256;

/// Default HTTP API port
pub const DEFAULT_HTTP_PORT: u16 = 8080;

/// Topic prefixes
pub const TOPIC_USER: &str = "user=";
pub const TOPIC_ROOM_DISPLAY_DATA: &str = "room-display-data=";
pub const TOPIC_ROOM_CHANNEL_DATA: &str = "room-channel-data=";
pub const TOPIC_CHANNEL: &str = "channel:";
