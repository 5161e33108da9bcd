//! Relay protocol handler.
//!
//! This module implements the `ProtocolHandler` trait for handling
//! incoming iroh connections and processing the relay protocol.
//!
//! Each connection runs one loop that multiplexes two sources: lines read
//! from the client and pushes queued on the connection's sink by the state
//! authority. All server-to-client traffic flows through the sink, so state
//! mutation never waits on a peer's socket.

use std::sync::Arc;

use anyhow::Result;
use futures_lite::future::Boxed as BoxFuture;
use iroh::endpoint::Connection;
use iroh::protocol::ProtocolHandler;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::gate::GateClient;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::{ClientSink, Push, State};

/// Outbound queue depth per connection. Overflow drops events (at-most-once).
const SINK_CAPACITY: usize = 64;

/// The relay protocol handler.
#[derive(Debug, Clone)]
pub struct RelayHandler {
    state: Arc<State>,
    gate: GateClient,
}

impl RelayHandler {
    /// Create a new relay handler.
    pub fn new(state: Arc<State>, gate: GateClient) -> Self {
        Self { state, gate }
    }

    /// Handle a single client connection.
    async fn handle_connection(&self, conn: Connection) -> Result<()> {
        let remote_node_id = conn.remote_node_id()?;
        info!(?remote_node_id, "New connection");

        // Accept a bidirectional stream for the protocol
        let (send, recv) = conn.accept_bi().await?;
        let mut writer = send;
        let mut reader = BufReader::new(recv);

        // Read and discard the init message that triggered the stream
        let mut init_line = String::new();
        reader.read_line(&mut init_line).await?;
        debug!(?remote_node_id, "Received init message");

        let handle_id = self.state.next_handle_id();
        let (push_tx, mut push_rx) = mpsc::channel::<Push>(SINK_CAPACITY);
        let sink = ClientSink::new(push_tx);
        self.state.connection_opened(handle_id, sink.clone());

        // The id this connection registered, once it has
        let mut bound_user: Option<String> = None;

        let mut line = String::new();
        loop {
            tokio::select! {
                // Drain pushes queued by the state authority
                Some(push) = push_rx.recv() => {
                    match push {
                        Push::Event(event) => {
                            if let Err(e) = send_message(&mut writer, &event).await {
                                warn!(?remote_node_id, "Failed to push event: {}", e);
                                break;
                            }
                        }
                        Push::Terminate(notice) => {
                            if let Some(event) = notice {
                                let _ = send_message(&mut writer, &event).await;
                            }
                            debug!(?remote_node_id, "Connection terminated by server");
                            break;
                        }
                    }
                }

                // Handle incoming messages from the client
                result = reader.read_line(&mut line) => {
                    match result {
                        Ok(0) => {
                            debug!(?remote_node_id, "Connection closed");
                            break;
                        }
                        Ok(_) => {
                            let trimmed = line.trim();
                            if trimmed.is_empty() {
                                line.clear();
                                continue;
                            }

                            match serde_json::from_str::<ClientMessage>(trimmed) {
                                Ok(msg) => {
                                    self.handle_message(handle_id, &mut bound_user, &sink, msg)
                                        .await;
                                }
                                // Malformed requests are dropped, not answered
                                Err(e) => {
                                    warn!(?remote_node_id, "Invalid message: {}", e);
                                }
                            }
                            line.clear();
                        }
                        Err(e) => {
                            error!(?remote_node_id, "Read error: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        // Cascade cleanup; a no-op if this handle was evicted or banned
        self.state.disconnect(handle_id);
        self.state.connection_closed(handle_id);
        info!(?remote_node_id, "Connection handler finished");

        Ok(())
    }

    /// Handle a single client message. Unauthorized or invalid requests fall
    /// through silently; nothing here surfaces an error to the wire.
    async fn handle_message(
        &self,
        handle_id: u64,
        bound_user: &mut Option<String>,
        sink: &ClientSink,
        msg: ClientMessage,
    ) {
        match msg {
            ClientMessage::Register { profile } => {
                if profile.id.is_empty() {
                    debug!("Register without id dropped");
                    return;
                }
                // The admission gate decides before the profile may register
                if let Err(e) = self.gate.screen(&profile).await {
                    warn!(user_id = %profile.id, "Profile rejected by gate: {}", e);
                    return;
                }
                *bound_user = Some(profile.id.clone());
                self.state.register(handle_id, profile, sink.clone());
            }
            ClientMessage::Search {
                name,
                gender,
                country,
            } => {
                if let Some(user) = bound_user {
                    self.state.search(
                        user,
                        name.as_deref(),
                        gender.as_deref(),
                        country.as_deref(),
                    );
                }
            }
            ClientMessage::KnockSend { target_user_id } => {
                if let Some(user) = bound_user {
                    self.state.knock_send(user, &target_user_id);
                }
            }
            ClientMessage::KnockAccept { from_user_id } => {
                if let Some(user) = bound_user {
                    self.state.knock_accept(user, &from_user_id);
                }
            }
            ClientMessage::SessionJoin { session_id } => {
                if let Some(user) = bound_user {
                    self.state.session_join(user, &session_id);
                }
            }
            ClientMessage::MessageSend {
                session_id,
                payload,
                kind,
                metadata,
            } => {
                if let Some(user) = bound_user {
                    self.state
                        .message_send(user, &session_id, payload, kind, metadata);
                }
            }
            ClientMessage::MessagesGet { session_id } => {
                if let Some(user) = bound_user {
                    self.state.messages_get(user, &session_id);
                }
            }
            ClientMessage::UserReport { target_user_id } => {
                if let Some(user) = bound_user {
                    self.state.report(user, &target_user_id);
                }
            }
            ClientMessage::UserBlock { target_user_id } => {
                if let Some(user) = bound_user {
                    self.state.block(user, &target_user_id);
                }
            }
            ClientMessage::SessionClose { session_id } => {
                if let Some(user) = bound_user {
                    self.state.session_close(user, &session_id);
                }
            }
            ClientMessage::Ping => {
                self.state.touch(handle_id);
                sink.deliver(ServerMessage::Pong);
            }
        }
    }
}

/// Write one message to the client as a JSON line.
async fn send_message(
    writer: &mut iroh::endpoint::SendStream,
    msg: &ServerMessage,
) -> Result<()> {
    let json = serde_json::to_string(msg)?;
    writer.write_all(json.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await?;
    Ok(())
}

impl ProtocolHandler for RelayHandler {
    fn accept(&self, conn: Connection) -> BoxFuture<Result<()>> {
        let this = self.clone();
        Box::pin(async move { this.handle_connection(conn).await })
    }
}
