//! STOMP 1.2 transport carrying JSON-RPC payloads in frame bodies.
//!
//! The server ([`StompProtocol`]) plugs into the protocol detector; the
//! client ([`StompClient`]) implements
//! [`ClientTransport`](crate::client::ClientTransport). Both share
//! [`StompCodec`] and the [`Frame`] model.

mod client;
mod codec;
mod frame;
mod server;

pub use client::{StompClient, StompOptions};
pub use codec::{StompCodec, encode_frame};
pub use frame::{Command, Frame, JSON_CONTENT_TYPE, STOMP_VERSION, headers};
pub use server::{PROTOCOL_NAME, StompProtocol, StompSession};

/// Destination clients send requests to unless told otherwise.
pub const DEFAULT_REQUEST_DESTINATION: &str = "/queue/host.requests";

/// Destination replies go to when a request carries no `reply-to`.
pub const DEFAULT_RESPONSE_DESTINATION: &str = "/topic/host.responses";
