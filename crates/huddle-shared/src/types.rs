use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::constants::{TOPIC_CHANNEL, TOPIC_ROOM_CHANNEL_DATA, TOPIC_ROOM_DISPLAY_DATA, TOPIC_USER};
use crate::error::ProtocolError;

macro_rules! uuid_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[serde(transparent)]
        pub struct $name(pub Uuid);

        impl $name {
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            pub fn short(&self) -> String {
                self.0.simple().to_string()[..8].to_string()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl FromStr for $name {
            type Err = ProtocolError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Uuid::parse_str(s.trim())
                    .map(Self)
                    .map_err(|_| ProtocolError::InvalidId(s.to_string()))
            }
        }
    };
}

uuid_id!(
    /// Identity a connection authenticated as
    UserId
);
uuid_id!(
    /// A chat message; also the id of its attachment's first chunk
    MessageId
);
uuid_id!(
    /// One stored attachment chunk
    ChunkId
);

impl From<MessageId> for ChunkId {
    fn from(id: MessageId) -> Self {
        Self(id.0)
    }
}

/// Process-local handle for one live client connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnId(pub u64);

impl fmt::Display for ConnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// A pub/sub topic name.
///
/// The recognised families are `user=<id>`, `room-display-data=<id>`,
/// `room-channel-data=<id>` and `channel:<id>`, but any string is a valid
/// topic as far as the hub is concerned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Topic(String);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicFamily {
    User,
    RoomDisplayData,
    RoomChannelData,
    Channel,
    Other,
}

impl Topic {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn user(uid: &UserId) -> Self {
        Self(format!("{TOPIC_USER}{uid}"))
    }

    pub fn room_display_data(room_id: &Uuid) -> Self {
        Self(format!("{TOPIC_ROOM_DISPLAY_DATA}{room_id}"))
    }

    pub fn room_channel_data(room_id: &Uuid) -> Self {
        Self(format!("{TOPIC_ROOM_CHANNEL_DATA}{room_id}"))
    }

    pub fn channel(channel_id: &Uuid) -> Self {
        Self(format!("{TOPIC_CHANNEL}{channel_id}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn family(&self) -> TopicFamily {
        let name = self.0.as_str();
        if name.starts_with(TOPIC_USER) {
            TopicFamily::User
        } else if name.starts_with(TOPIC_ROOM_DISPLAY_DATA) {
            TopicFamily::RoomDisplayData
        } else if name.starts_with(TOPIC_ROOM_CHANNEL_DATA) {
            TopicFamily::RoomChannelData
        } else if name.starts_with(TOPIC_CHANNEL) {
            TopicFamily::Channel
        } else {
            TopicFamily::Other
        }
    }
}

impl fmt::Display for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Topic {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for Topic {
    fn from(s: String) -> Self {
        Self(s)
    }
}
