//! JSON wire protocol.
//!
//! Every outbound frame is a single JSON object whose `TYPE` field names the
//! event; event-specific fields sit beside it at the top level. Inbound
//! frames name their event in `event_type` instead, which keeps the two
//! directions easy to tell apart.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ProtocolError;
use crate::types::{MessageId, Topic, UserId};

/// An encoded outbound frame, shared cheaply across every recipient of a
/// fan-out.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame(Arc<str>);

impl Frame {
    /// Encode a hub event.
    pub fn event(event: &ServerEvent) -> Result<Self, serde_json::Error> {
        Ok(Self(serde_json::to_string(event)?.into()))
    }

    /// Serialize an arbitrary payload and merge a `TYPE` discriminator into
    /// it. Objects get the field added; `null` becomes `{"TYPE": ..}`; any
    /// other value is carried under `DATA`.
    pub fn typed<T: Serialize + ?Sized>(
        event_type: &str,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        let mut object = match serde_json::to_value(payload)? {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("DATA".to_string(), other);
                map
            }
        };
        object.insert("TYPE".to_string(), Value::String(event_type.to_string()));
        Ok(Self(serde_json::to_string(&Value::Object(object))?.into()))
    }

    /// Wrap bytes that are already a complete JSON frame.
    pub fn raw(text: impl Into<Arc<str>>) -> Self {
        Self(text.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// WebRTC signaling payload relayed verbatim between call peers, together
/// with the sender's media stream id and camera / screen-share flags.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallSignal {
    pub signal: String,
    #[serde(default)]
    pub um_stream_id: String,
    #[serde(default)]
    pub um_vid: bool,
    #[serde(default)]
    pub dm_vid: bool,
}

/// Events the hub itself originates.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "TYPE")]
pub enum ServerEvent {
    /// Entity change notification. `data` is itself JSON-encoded.
    #[serde(rename = "CHANGE")]
    Change {
        #[serde(rename = "METHOD")]
        method: String,
        #[serde(rename = "ENTITY")]
        entity: String,
        #[serde(rename = "DATA")]
        data: String,
    },

    /// Reply to a single connection, usually an error. `data` is
    /// JSON-encoded `{"msg": .., "err": ..}`.
    #[serde(rename = "RESPONSE_MESSAGE")]
    ResponseMessage {
        #[serde(rename = "DATA")]
        data: String,
    },

    #[serde(rename = "ATTACHMENT_PROGRESS")]
    AttachmentProgress {
        #[serde(rename = "ID")]
        id: MessageId,
        ratio: f32,
        failed: bool,
    },

    #[serde(rename = "CALL_USER_ACKNOWLEDGE")]
    CallUserAcknowledge { caller: UserId, called: UserId },

    #[serde(rename = "CALL_USER_RESPONSE")]
    CallUserResponse {
        caller: UserId,
        called: UserId,
        accept: bool,
    },

    #[serde(rename = "CALL_LEFT")]
    CallLeft {},

    #[serde(rename = "CALL_WEBRTC_OFFER_FROM_INITIATOR")]
    CallOfferFromInitiator(CallSignal),

    #[serde(rename = "CALL_WEBRTC_ANSWER_FROM_RECIPIENT")]
    CallAnswerFromRecipient(CallSignal),

    #[serde(rename = "CALL_WEBRTC_REQUESTED_REINITIALIZATION")]
    CallRequestedReinitialization {},
}

impl ServerEvent {
    /// Presence change published on `user=<uid>`.
    pub fn presence(uid: &UserId, online: bool) -> Self {
        Self::Change {
            method: "UPDATE".to_string(),
            entity: "USER".to_string(),
            data: json!({ "ID": uid, "online": online }).to_string(),
        }
    }

    pub fn response(msg: &str, err: bool) -> Self {
        Self::ResponseMessage {
            data: json!({ "msg": msg, "err": err }).to_string(),
        }
    }

    pub fn error(msg: &str) -> Self {
        Self::response(msg, true)
    }
}

/// Events a client may send over its socket.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event_type")]
pub enum ClientEvent {
    #[serde(rename = "WATCH_USER")]
    WatchUser {
        #[serde(rename = "ID")]
        id: UserId,
    },

    #[serde(rename = "STOP_WATCHING_USER")]
    StopWatchingUser {
        #[serde(rename = "ID")]
        id: UserId,
    },

    #[serde(rename = "OPEN_SUBSCRIPTION")]
    OpenSubscription { name: Topic },

    #[serde(rename = "CLOSE_SUBSCRIPTION")]
    CloseSubscription { name: Topic },

    #[serde(rename = "CALL_USER")]
    CallUser { uid: UserId },

    #[serde(rename = "CALL_USER_RESPONSE")]
    CallUserResponse {
        caller: UserId,
        called: UserId,
        accept: bool,
    },

    #[serde(rename = "CALL_LEAVE")]
    CallLeave {},

    #[serde(rename = "CALL_WEBRTC_OFFER")]
    CallWebrtcOffer(CallSignal),

    #[serde(rename = "CALL_WEBRTC_ANSWER")]
    CallWebrtcAnswer(CallSignal),

    #[serde(rename = "CALL_WEBRTC_RECIPIENT_REQUEST_REINITIALIZATION")]
    CallRequestReinitialization {},
}

/// Discriminant of [`ClientEvent`], used to key the socket dispatch table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientEventKind {
    WatchUser,
    StopWatchingUser,
    OpenSubscription,
    CloseSubscription,
    CallUser,
    CallUserResponse,
    CallLeave,
    CallWebrtcOffer,
    CallWebrtcAnswer,
    CallRequestReinitialization,
}

impl ClientEventKind {
    pub const ALL: [ClientEventKind; 10] = [
        Self::WatchUser,
        Self::StopWatchingUser,
        Self::OpenSubscription,
        Self::CloseSubscription,
        Self::CallUser,
        Self::CallUserResponse,
        Self::CallLeave,
        Self::CallWebrtcOffer,
        Self::CallWebrtcAnswer,
        Self::CallRequestReinitialization,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Self::WatchUser => "WATCH_USER",
            Self::StopWatchingUser => "STOP_WATCHING_USER",
            Self::OpenSubscription => "OPEN_SUBSCRIPTION",
            Self::CloseSubscription => "CLOSE_SUBSCRIPTION",
            Self::CallUser => "CALL_USER",
            Self::CallUserResponse => "CALL_USER_RESPONSE",
            Self::CallLeave => "CALL_LEAVE",
            Self::CallWebrtcOffer => "CALL_WEBRTC_OFFER",
            Self::CallWebrtcAnswer => "CALL_WEBRTC_ANSWER",
            Self::CallRequestReinitialization => "CALL_WEBRTC_RECIPIENT_REQUEST_REINITIALIZATION",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.name() == name)
    }
}

impl ClientEvent {
    /// Decode one inbound text frame.
    ///
    /// Unknown event names are reported as such rather than as a generic
    /// decode failure so the client gets a useful error back.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let name = value
            .get("event_type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingEventType)?;
        if ClientEventKind::from_name(name).is_none() {
            return Err(ProtocolError::UnknownEvent(name.to_string()));
        }
        Ok(serde_json::from_value(value)?)
    }

    pub fn kind(&self) -> ClientEventKind {
        match self {
            Self::WatchUser { .. } => ClientEventKind::WatchUser,
            Self::StopWatchingUser { .. } => ClientEventKind::StopWatchingUser,
            Self::OpenSubscription { .. } => ClientEventKind::OpenSubscription,
            Self::CloseSubscription { .. } => ClientEventKind::CloseSubscription,
            Self::CallUser { .. } => ClientEventKind::CallUser,
            Self::CallUserResponse { .. } => ClientEventKind::CallUserResponse,
            Self::CallLeave {} => ClientEventKind::CallLeave,
            Self::CallWebrtcOffer(_) => ClientEventKind::CallWebrtcOffer,
            Self::CallWebrtcAnswer(_) => ClientEventKind::CallWebrtcAnswer,
            Self::CallRequestReinitialization {} => ClientEventKind::CallRequestReinitialization,
        }
    }
}
