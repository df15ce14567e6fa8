//! WebSocket endpoint speaking the JSON protocol.
//!
//! Architecture:
//! ```text
//! Client A ──┐                         ┌── SessionRegistry / PresenceTracker
//!             ├── CollabServer ── CollabService ── EditBroker / CommentManager
//! Client B ──┘        │                └── WorkflowEngine
//!                     │                          │
//!                     │         BroadcastHub ◄───┘ (per-session mpsc queue)
//!                     ▼                 │
//!              reply frames      fan-out frames
//! ```
//!
//! Each connection owns one outbound queue. Joining attaches that queue to
//! the session, so the hub pushes channel events into it; direct replies
//! (`session_state`, `edit_ack`, `heartbeat_ack`, `error`) are written to
//! the socket by the connection task itself. A closed socket detaches the
//! session, which stays around for a rejoin until the sweeper expires it.

use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, RwLock};
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::broadcast::Connection;
use crate::error::{CollabError, CollabResult};
use crate::protocol::{ClientMessage, ProtocolError, ServerEvent};
use crate::service::CollabService;
use crate::session::StartOptions;

/// Server statistics.
#[derive(Debug, Clone, Default)]
pub struct ServerStats {
    pub total_connections: u64,
    pub active_connections: u64,
    pub total_messages: u64,
    pub total_bytes: u64,
    /// Inbound frames answered with an `error` event
    pub rejected_messages: u64,
}

/// The session a connection is currently attached to.
#[derive(Debug, Clone)]
struct Attachment {
    session_id: Uuid,
    user_id: String,
}

pub struct CollabServer {
    service: Arc<CollabService>,
    stats: Arc<RwLock<ServerStats>>,
}

impl CollabServer {
    pub fn new(service: Arc<CollabService>) -> Self {
        Self {
            service,
            stats: Arc::new(RwLock::new(ServerStats::default())),
        }
    }

    /// Bind the configured address, run the sweeper and serve until the
    /// listener fails.
    pub async fn run(&self) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let listener = TcpListener::bind(&self.service.config().bind_addr).await?;
        log::info!("Collaboration server listening on {}", listener.local_addr()?);

        let sweeper = self.service.sweeper().spawn();
        let result = self.serve(listener).await;
        sweeper.stop().await;
        result
    }

    /// Accept connections on an already bound listener.
    pub async fn serve(&self, listener: TcpListener) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        loop {
            let (stream, addr) = listener.accept().await?;
            log::debug!("New TCP connection from {addr}");

            let service = self.service.clone();
            let stats = self.stats.clone();
            tokio::spawn(async move {
                if let Err(e) = Self::handle_connection(stream, addr, service, stats).await {
                    log::error!("Connection error from {addr}: {e}");
                }
            });
        }
    }

    async fn handle_connection(
        stream: TcpStream,
        addr: SocketAddr,
        service: Arc<CollabService>,
        stats: Arc<RwLock<ServerStats>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut ws_sender, mut ws_receiver) = ws_stream.split();

        log::info!("WebSocket connection established from {addr}");

        {
            let mut s = stats.write().await;
            s.total_connections += 1;
            s.active_connections += 1;
        }

        let (connection, mut outbound) = service.new_connection();
        let mut attachment: Option<Attachment> = None;

        let result = async {
            loop {
                tokio::select! {
                    msg = ws_receiver.next() => {
                        match msg {
                            Some(Ok(Message::Text(text))) => {
                                {
                                    let mut s = stats.write().await;
                                    s.total_messages += 1;
                                    s.total_bytes += text.len() as u64;
                                }
                                let reply = Self::dispatch(&service, &mut attachment, &connection, text.as_str()).await;
                                if let Some(event) = reply {
                                    if matches!(event, ServerEvent::Error { .. }) {
                                        stats.write().await.rejected_messages += 1;
                                    }
                                    for frame in Self::frames_for_reply(&mut outbound, &event)? {
                                        ws_sender.send(Message::Text(frame.into())).await?;
                                    }
                                }
                            }

                            Some(Ok(Message::Binary(_))) => {
                                let err = CollabError::from(ProtocolError::Malformed(
                                    "binary frames are not supported".into(),
                                ));
                                stats.write().await.rejected_messages += 1;
                                for frame in Self::frames_for_reply(&mut outbound, &ServerEvent::from_error(&err))? {
                                    ws_sender.send(Message::Text(frame.into())).await?;
                                }
                            }

                            Some(Ok(Message::Ping(data))) => {
                                ws_sender.send(Message::Pong(data)).await?;
                            }

                            Some(Ok(Message::Close(_))) | None => {
                                log::info!("Connection closed from {addr}");
                                break;
                            }

                            Some(Err(e)) => {
                                log::error!("WebSocket error from {addr}: {e}");
                                break;
                            }

                            _ => {}
                        }
                    }

                    // Channel events queued for this connection by the hub
                    Some(frame) = outbound.recv() => {
                        ws_sender.send(Message::Text(frame.to_string().into())).await?;
                    }
                }
            }
            Ok::<(), Box<dyn std::error::Error + Send + Sync>>(())
        }
        .await;

        if let Some(attached) = attachment {
            if let Err(e) = service.disconnect(attached.session_id, connection.id()).await {
                log::warn!("Failed to detach session {} after close: {e}", attached.session_id);
            }
        }
        {
            let mut s = stats.write().await;
            s.active_connections = s.active_connections.saturating_sub(1);
        }

        result
    }

    /// Frames to write for a direct reply. Events the hub already queued
    /// for this connection go first so the reply never overtakes them.
    fn frames_for_reply(
        outbound: &mut mpsc::Receiver<Arc<str>>,
        reply: &ServerEvent,
    ) -> Result<Vec<String>, ProtocolError> {
        let mut frames = Vec::new();
        while let Ok(frame) = outbound.try_recv() {
            frames.push(frame.to_string());
        }
        frames.push(reply.encode()?);
        Ok(frames)
    }

    /// Handle one inbound frame; returns the direct reply, if any.
    async fn dispatch(
        service: &CollabService,
        attachment: &mut Option<Attachment>,
        connection: &Connection,
        text: &str,
    ) -> Option<ServerEvent> {
        let message = match ClientMessage::parse(text) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Rejected inbound frame: {e}");
                return Some(ServerEvent::from_error(&e.into()));
            }
        };
        let kind = message.kind();
        match Self::handle(service, attachment, connection, message).await {
            Ok(reply) => reply,
            Err(e) => {
                log::debug!("{kind} failed: {e}");
                Some(ServerEvent::from_error(&e))
            }
        }
    }

    async fn handle(
        service: &CollabService,
        attachment: &mut Option<Attachment>,
        connection: &Connection,
        message: ClientMessage,
    ) -> CollabResult<Option<ServerEvent>> {
        match message {
            ClientMessage::JoinSession {
                session_id,
                content_id,
                user_id,
                force_new,
            } => {
                let snapshot = match (session_id, content_id) {
                    (Some(session_id), _) => {
                        service
                            .join_session(session_id, &user_id, connection.clone())
                            .await?
                    }
                    (None, Some(content_id)) => {
                        let options = StartOptions {
                            force_new,
                            connection: Some(connection.clone()),
                        };
                        service.start_session(&content_id, &user_id, options).await?
                    }
                    (None, None) => {
                        return Err(CollabError::Validation(
                            "join_session needs a session_id or a content_id".into(),
                        ));
                    }
                };

                let joined = Attachment {
                    session_id: snapshot.session.id,
                    user_id,
                };
                if let Some(previous) = attachment.replace(joined) {
                    if previous.session_id != snapshot.session.id {
                        service.disconnect(previous.session_id, connection.id()).await?;
                    }
                }
                Ok(Some(ServerEvent::SessionState { snapshot }))
            }

            ClientMessage::EditOperation { operation } => {
                let attached = Self::attached(attachment)?;
                let outcome = service.broadcast_edit(attached.session_id, operation).await?;
                Ok(Some(ServerEvent::EditAck {
                    operation_id: outcome.operation_id,
                    applied: outcome.applied,
                    conflicts: outcome.conflicts,
                }))
            }

            ClientMessage::CursorUpdate { cursor, selection } => {
                let attached = Self::attached(attachment)?;
                service
                    .update_cursor(attached.session_id, cursor, selection)
                    .await?;
                Ok(None)
            }

            ClientMessage::ResolveConflicts { conflicts } => {
                let attached = Self::attached(attachment)?;
                let resolutions = service
                    .resolve_conflicts(attached.session_id, conflicts)
                    .await?;
                Ok(Some(ServerEvent::ConflictsResolved {
                    session_id: attached.session_id,
                    user_id: attached.user_id.clone(),
                    resolutions,
                }))
            }

            ClientMessage::LeaveSession => {
                if let Some(attached) = attachment.take() {
                    service
                        .leave_session(attached.session_id, &attached.user_id)
                        .await?;
                }
                Ok(None)
            }

            ClientMessage::Heartbeat => {
                let head_sequence = match attachment {
                    Some(attached) => service.heartbeat(attached.session_id).await?,
                    None => 0,
                };
                Ok(Some(ServerEvent::HeartbeatAck { head_sequence }))
            }
        }
    }

    fn attached(attachment: &Option<Attachment>) -> CollabResult<&Attachment> {
        attachment
            .as_ref()
            .ok_or_else(|| CollabError::Validation("no session joined on this connection".into()))
    }

    pub async fn stats(&self) -> ServerStats {
        self.stats.read().await.clone()
    }

    pub fn bind_addr(&self) -> &str {
        &self.service.config().bind_addr
    }

    pub fn service(&self) -> &Arc<CollabService> {
        &self.service
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollabConfig;

    fn service() -> Arc<CollabService> {
        Arc::new(CollabService::in_memory(CollabConfig::for_testing()))
    }

    #[tokio::test]
    async fn test_server_stats_initial() {
        let server = CollabServer::new(service());
        let stats = server.stats().await;
        assert_eq!(stats.total_connections, 0);
        assert_eq!(stats.active_connections, 0);
        assert_eq!(stats.total_messages, 0);
        assert_eq!(stats.rejected_messages, 0);
        assert_eq!(server.bind_addr(), "127.0.0.1:0");
    }

    #[tokio::test]
    async fn test_dispatch_unknown_type() {
        let service = service();
        let (connection, _rx) = service.new_connection();
        let mut attachment = None;
        let reply = CollabServer::dispatch(&service, &mut attachment, &connection, r#"{"type":"rewind"}"#)
            .await
            .unwrap();
        match reply {
            ServerEvent::Error { code, message } => {
                assert_eq!(code, "protocol_error");
                assert!(message.contains("rewind"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_dispatch_requires_join() {
        let service = service();
        let (connection, _rx) = service.new_connection();
        let mut attachment = None;
        let reply = CollabServer::dispatch(
            &service,
            &mut attachment,
            &connection,
            r#"{"type":"cursor_update","cursor":3}"#,
        )
        .await;
        assert!(matches!(reply, Some(ServerEvent::Error { ref code, .. }) if code == "validation_error"));

        let ack = CollabServer::dispatch(&service, &mut attachment, &connection, r#"{"type":"heartbeat"}"#).await;
        assert_eq!(ack, Some(ServerEvent::HeartbeatAck { head_sequence: 0 }));
    }

    #[tokio::test]
    async fn test_dispatch_join_then_edit() {
        let service = service();
        let (connection, _rx) = service.new_connection();
        let mut attachment = None;

        let reply = CollabServer::dispatch(
            &service,
            &mut attachment,
            &connection,
            r#"{"type":"join_session","content_id":"c1","user_id":"u1"}"#,
        )
        .await;
        let Some(ServerEvent::SessionState { snapshot }) = reply else {
            panic!("expected session_state");
        };
        assert_eq!(snapshot.head_sequence, 0);
        assert_eq!(attachment.as_ref().unwrap().session_id, snapshot.session.id);

        let reply = CollabServer::dispatch(
            &service,
            &mut attachment,
            &connection,
            r#"{"type":"edit_operation","operation":{"kind":"insert","payload":{"position":0,"text":"hello"}}}"#,
        )
        .await;
        assert_eq!(
            reply,
            Some(ServerEvent::EditAck {
                operation_id: 1,
                applied: true,
                conflicts: Vec::new(),
            })
        );

        let reply = CollabServer::dispatch(&service, &mut attachment, &connection, r#"{"type":"leave_session"}"#).await;
        assert!(reply.is_none());
        assert!(attachment.is_none());
        assert_eq!(service.session_count().await, 0);
    }

    #[tokio::test]
    async fn test_reply_follows_queued_channel_events() {
        let service = service();
        let (connection, mut outbound) = service.new_connection();
        let mut attachment = None;
        CollabServer::dispatch(
            &service,
            &mut attachment,
            &connection,
            r#"{"type":"join_session","content_id":"c1","user_id":"u1"}"#,
        )
        .await;

        let other = service
            .start_session("c1", "u2", StartOptions::default())
            .await
            .unwrap();
        service
            .broadcast_edit(
                other.session.id,
                crate::oplog::EditRequest::new(
                    crate::oplog::OperationKind::Insert,
                    crate::oplog::EditPayload::insert(0, "ab"),
                ),
            )
            .await
            .unwrap();

        let reply = CollabServer::dispatch(
            &service,
            &mut attachment,
            &connection,
            r#"{"type":"edit_operation","operation":{"kind":"insert","payload":{"position":2,"text":"c"}}}"#,
        )
        .await
        .unwrap();
        let frames = CollabServer::frames_for_reply(&mut outbound, &reply).unwrap();
        let kinds: Vec<&'static str> = frames
            .iter()
            .map(|f| ServerEvent::decode(f).unwrap().event.kind())
            .collect();
        assert_eq!(kinds, vec!["user_joined", "edit_operation", "edit_ack"]);
        assert!(outbound.try_recv().is_err());
    }
}
