//! Parlor - Ephemeral Relay Service Library
//!
//! A rendezvous and relay server that lets strangers discover each other,
//! negotiate one-to-one sessions via a knock/accept handshake, and exchange
//! short-lived messages over iroh P2P networking.
//!
//! ## Design Principles
//!
//! * **Zero persistent state** — everything expires or dies with the
//!   connection; nothing is written to disk
//! * **One serialized authority** — every mutation of registry, session,
//!   message, block, and report state goes through a single lock
//! * **At-most-once delivery** — outbound events are fire-and-forget; a
//!   slow or dead recipient never blocks anyone else
//! * **Silent failure** — malformed or unauthorized requests are dropped
//!   without a response, so probes learn nothing
//!
//! ## Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use parlor::{GateClient, RelayHandler, State, ALPN};
//! use iroh::protocol::Router;
//! use iroh::Endpoint;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! // Create the endpoint
//! let endpoint = Endpoint::builder()
//!     .alpns(vec![ALPN.to_vec()])
//!     .bind()
//!     .await?;
//!
//! // Create shared state
//! let state = Arc::new(State::new());
//!
//! // Create the protocol handler
//! let handler = RelayHandler::new(state, GateClient::new(None));
//!
//! // Build and spawn the router
//! let router = Router::builder(endpoint.clone())
//!     .accept(ALPN, handler)
//!     .spawn();
//! # Ok(())
//! # }
//! ```

pub mod gate;
pub mod handler;
pub mod protocol;
pub mod state;

// Re-export main types for convenience
pub use gate::{GateClient, GateError};
pub use handler::RelayHandler;
pub use protocol::{ClientMessage, Message, Profile, ServerMessage, ALPN};
pub use state::{ClientSink, Clock, Push, Session, State, SystemClock, UserRecord};
