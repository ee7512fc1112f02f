//! WebSocket endpoint.
//!
//! Each socket gets a reader loop (this task) and a writer task draining
//! the connection's outbox. Inbound text frames decode into a
//! [`ClientEvent`] and are dispatched by variant; any failure is answered
//! to this connection alone as a `RESPONSE_MESSAGE` error.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::IntoResponse,
};
use futures::StreamExt;
use serde::Deserialize;
use tracing::{debug, info, warn};

use huddle_hub::{run_writer, Connection, Hub};
use huddle_shared::protocol::{ClientEvent, ClientEventKind, Frame, ServerEvent};
use huddle_shared::types::{Topic, TopicFamily, UserId};

use crate::api::{optional_caller, AppState};
use crate::error::{ServerError, SocketError};

#[derive(Debug, Default, Deserialize)]
pub struct WsConnectParams {
    /// Fallback for clients that cannot set the identity header.
    pub uid: Option<String>,
}

pub async fn ws_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(params): Query<WsConnectParams>,
    ws: WebSocketUpgrade,
) -> Result<impl IntoResponse, ServerError> {
    let uid = match optional_caller(&headers)? {
        Some(uid) => Some(uid),
        None => params
            .uid
            .as_deref()
            .map(|raw| {
                raw.parse::<UserId>()
                    .map_err(|e| ServerError::BadRequest(e.to_string()))
            })
            .transpose()?,
    };
    let hub = state.hub.clone();
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub, uid)))
}

async fn handle_socket(socket: WebSocket, hub: Hub, uid: Option<UserId>) {
    let (conn, outbox) = hub.new_connection();
    let conn_id = conn.id();
    let (sink, mut stream) = socket.split();

    let writer = tokio::spawn(run_writer(conn_id, outbox, sink, |frame: Frame| {
        Message::Text(frame.as_str().to_owned())
    }));

    if let Err(e) = hub.register_connection(conn.clone(), uid).await {
        warn!(conn = %conn_id, "Failed to register connection: {}", e);
        writer.abort();
        return;
    }

    let session = Session { hub, conn, uid };

    while let Some(msg) = stream.next().await {
        match msg {
            Ok(Message::Text(text)) => session.handle_text(&text).await,
            Ok(Message::Close(_)) => break,
            Ok(_) => {}
            Err(e) => {
                debug!(conn = %conn_id, "Socket read failed: {}", e);
                break;
            }
        }
    }

    if let Err(e) = session.hub.unregister_connection(conn_id).await {
        warn!(conn = %conn_id, "Failed to unregister connection: {}", e);
    }
    writer.abort();
    info!(conn = %conn_id, "Socket closed");
}

/// One live socket as seen by its reader loop.
struct Session {
    hub: Hub,
    conn: Connection,
    uid: Option<UserId>,
}

impl Session {
    async fn handle_text(&self, text: &str) {
        let result = match ClientEvent::decode(text) {
            Ok(event) => self.dispatch(event).await,
            Err(e) => Err(e.into()),
        };
        if let Err(e) = result {
            debug!(conn = %self.conn.id(), "Rejected socket event: {}", e);
            self.reply_error(&e.to_string());
        }
    }

    fn reply_error(&self, msg: &str) {
        match Frame::event(&ServerEvent::error(msg)) {
            Ok(frame) => {
                self.conn.deliver(frame);
            }
            Err(e) => warn!("Failed to encode error reply: {}", e),
        }
    }

    /// The signed-in user, required by every call event.
    fn me(&self, kind: ClientEventKind) -> Result<UserId, SocketError> {
        self.uid.ok_or(SocketError::Anonymous(kind.name()))
    }

    async fn dispatch(&self, event: ClientEvent) -> Result<(), SocketError> {
        let kind = event.kind();
        match event {
            ClientEvent::WatchUser { id } => {
                self.hub
                    .subscribe(Topic::user(&id), self.uid, &self.conn)
                    .await?
            }
            ClientEvent::StopWatchingUser { id } => {
                self.hub.unsubscribe(Topic::user(&id), self.conn.id()).await?
            }
            ClientEvent::OpenSubscription { name } => {
                if name.family() != TopicFamily::User {
                    return Err(SocketError::ForbiddenTopic(name));
                }
                self.hub.subscribe(name, self.uid, &self.conn).await?
            }
            ClientEvent::CloseSubscription { name } => {
                self.hub.unsubscribe(name, self.conn.id()).await?
            }
            ClientEvent::CallUser { uid } => self.hub.call_request(self.me(kind)?, uid).await?,
            ClientEvent::CallUserResponse {
                caller,
                called,
                accept,
            } => {
                self.hub
                    .call_response(self.me(kind)?, caller, called, accept)
                    .await?
            }
            ClientEvent::CallLeave {} => self.hub.leave_call(self.me(kind)?).await?,
            ClientEvent::CallWebrtcOffer(signal) => {
                self.hub.relay_offer(self.me(kind)?, signal).await?
            }
            ClientEvent::CallWebrtcAnswer(signal) => {
                self.hub.relay_answer(self.me(kind)?, signal).await?
            }
            ClientEvent::CallRequestReinitialization {} => {
                self.hub.relay_reinit_request(self.me(kind)?).await?
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use huddle_hub::{HubConfig, OutboxReceiver};
    use huddle_store::MemoryStore;
    use serde_json::Value;

    use super::*;

    async fn session(uid: Option<UserId>) -> (Session, OutboxReceiver) {
        let hub = Hub::start(HubConfig::default(), MemoryStore::new());
        let (conn, rx) = hub.connect(uid).await.unwrap();
        (Session { hub, conn, uid }, rx)
    }

    async fn next_error(rx: &mut OutboxReceiver) -> String {
        let frame = rx.recv().await.unwrap();
        let value: Value = serde_json::from_str(frame.as_str()).unwrap();
        assert_eq!(value["TYPE"], "RESPONSE_MESSAGE");
        let data: Value = serde_json::from_str(value["DATA"].as_str().unwrap()).unwrap();
        assert_eq!(data["err"], true);
        data["msg"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_malformed_and_unknown_events_reply_error() {
        let (session, mut rx) = session(None).await;

        session.handle_text("{nope").await;
        assert!(next_error(&mut rx).await.starts_with("Malformed frame"));

        session.handle_text(r#"{"event_type":"JUGGLE"}"#).await;
        assert!(next_error(&mut rx).await.contains("JUGGLE"));
    }

    #[tokio::test]
    async fn test_anonymous_cannot_call() {
        let (session, mut rx) = session(None).await;
        let target = UserId::new();
        session
            .handle_text(&format!(r#"{{"event_type":"CALL_USER","uid":"{target}"}}"#))
            .await;
        assert!(next_error(&mut rx).await.contains("CALL_USER"));
    }

    #[tokio::test]
    async fn test_watch_user_subscribes() {
        let uid = UserId::new();
        let (session, _rx) = session(Some(uid)).await;
        let watched = UserId::new();
        session
            .handle_text(&format!(r#"{{"event_type":"WATCH_USER","ID":"{watched}"}}"#))
            .await;

        let members = session.hub.topic_members(Topic::user(&watched)).await.unwrap();
        assert!(members.contains(&uid));

        session
            .handle_text(&format!(r#"{{"event_type":"STOP_WATCHING_USER","ID":"{watched}"}}"#))
            .await;
        assert!(session
            .hub
            .topic_members(Topic::user(&watched))
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_open_subscription_restricted_to_user_topics() {
        let (session, mut rx) = session(Some(UserId::new())).await;
        session
            .handle_text(r#"{"event_type":"OPEN_SUBSCRIPTION","name":"channel:abc"}"#)
            .await;
        assert!(next_error(&mut rx).await.contains("channel:abc"));
        assert_eq!(session.hub.subscription_count(session.conn.id()).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_self_call_rejected() {
        let uid = UserId::new();
        let (session, mut rx) = session(Some(uid)).await;
        session
            .handle_text(&format!(r#"{{"event_type":"CALL_USER","uid":"{uid}"}}"#))
            .await;
        assert!(next_error(&mut rx).await.contains("call yourself"));
    }
}
