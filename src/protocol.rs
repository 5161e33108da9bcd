//! Protocol message types for the relay service.
//!
//! All messages are JSON over iroh ALPN protocol `parlor/1`, one message
//! per line in both directions.

#![allow(dead_code)]

use serde::{Deserialize, Serialize};

/// The ALPN protocol identifier for the relay service.
pub const ALPN: &[u8] = b"parlor/1";

/// A user profile as supplied at registration and echoed in presence lists.
///
/// Only `id` is required. Attributes beyond the named ones are opaque to the
/// server and carried through unchanged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    /// Externally supplied unique identifier.
    pub id: String,
    /// Display name, substring-searchable.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gender: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub country: Option<String>,
    /// Avatar reference, screened by the admission gate before registration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub avatar: Option<String>,
    /// Any further attributes, passed through opaquely.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Profile {
    /// A profile carrying only an id, for tests and terse clients.
    pub fn bare(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: None,
            gender: None,
            country: None,
            avatar: None,
            extra: serde_json::Map::new(),
        }
    }
}

/// A relayed message, stored per session and delivered whole to both
/// participants.
///
/// The payload is opaque to the server; clients encrypt end-to-end.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: String,
    pub session_id: String,
    pub sender_id: String,
    pub payload: String,
    /// Client-defined type tag, `"text"` when unspecified.
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,
    /// Unix milliseconds at send time.
    pub sent_at: u64,
    /// `sent_at` plus the fixed message TTL.
    pub expires_at: u64,
}

/// Messages sent from the client to the server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Register a profile on this connection, replacing any prior live
    /// handle for the same id.
    Register { profile: Profile },
    /// Filter the requester's visible users. Absent filters match everything.
    Search {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        gender: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        country: Option<String>,
    },
    /// Propose a session to another user.
    KnockSend { target_user_id: String },
    /// Accept a pending knock from another user.
    KnockAccept { from_user_id: String },
    /// Rejoin an existing session after reconnecting.
    SessionJoin { session_id: String },
    /// Send a message into a session.
    MessageSend {
        session_id: String,
        payload: String,
        #[serde(
            rename = "message_type",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        kind: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        metadata: Option<serde_json::Value>,
    },
    /// Fetch the non-expired messages of a session.
    MessagesGet { session_id: String },
    /// Report a user for abuse.
    UserReport { target_user_id: String },
    /// Block a user.
    UserBlock { target_user_id: String },
    /// Close a session.
    SessionClose { session_id: String },
    /// Heartbeat to keep the connection alive.
    Ping,
}

/// Messages sent from the server to the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Registration acknowledgment to the registering connection.
    Registered { user_id: String, profile: Profile },
    /// Someone visible to this recipient came online.
    UserRegistered { profile: Profile },
    /// The recipient's block-filtered view of who is online.
    PresenceList { users: Vec<Profile> },
    /// Aggregate connection counts, unfiltered.
    PresenceCount { connected: usize, registered: usize },
    /// Results for a search request, to the caller only.
    SearchResults { users: Vec<Profile> },
    /// Someone wants to start a session with the recipient.
    KnockReceived {
        knock_id: String,
        from_user_id: String,
        from_profile: Profile,
    },
    /// Acknowledgment that a knock was delivered.
    KnockSent { target_user_id: String },
    /// A session exists and the recipient is a participant. Sent to the
    /// accepter on knock-accept and to the caller on session-join.
    SessionCreated {
        session_id: String,
        participants: Vec<String>,
        partner_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partner_profile: Option<Profile>,
    },
    /// The recipient's knock was accepted; the session is live.
    KnockAccepted {
        session_id: String,
        partner_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        partner_profile: Option<Profile>,
    },
    /// Send acknowledgment to the message author.
    MessageAck { success: bool, message_id: String },
    /// A message was relayed into a session the recipient participates in.
    MessageReceived { message: Message },
    /// The non-expired messages of a session, in arrival order.
    MessagesList {
        session_id: String,
        messages: Vec<Message>,
    },
    /// A buffered message reached its TTL and was purged.
    MessageExpired {
        session_id: String,
        message_id: String,
    },
    /// A session was torn down (close, block, disconnect, or ban).
    SessionClosed { session_id: String },
    /// Block acknowledgment to the blocker.
    BlockedAck { target_user_id: String },
    /// Termination notice; the connection is dropped right after.
    Banned,
    /// Heartbeat response.
    Pong,
}
