#![doc(html_root_url = "https://docs.rs/hostwire/latest")]
//! Single-port, multi-protocol JSON-RPC host agent.
//!
//! A [`reactor::Reactor`] multiplexes non-blocking sockets on one thread.
//! The [`acceptor::Acceptor`] owns the listening socket, optionally runs a
//! TLS handshake, and hands every connection to a
//! [`detector::ProtocolDetector`] that peeks at the first bytes and passes
//! the socket to the matching transport: [`framed`] (8-byte length prefix)
//! or [`stomp`] (STOMP 1.2). Both carry JSON-RPC 2.0 payloads handled by
//! [`jsonrpc`]. Matching clients live alongside the servers.

pub mod acceptor;
pub mod client;
pub mod codec;
pub mod config;
pub mod connection;
pub mod detector;
pub mod framed;
pub mod jsonrpc;
pub mod metrics;
pub mod panic;
pub mod reactor;
pub mod session;
pub mod stomp;
pub mod stream;
pub mod tls;
pub mod transport;

pub use acceptor::{Acceptor, AcceptorError, AcceptorHandle};
pub use client::{ClientConfig, ClientError, ClientTransport};
pub use connection::ConnectionId;
pub use jsonrpc::{JsonRpcClient, JsonRpcServer, RpcError};
pub use reactor::{Reactor, ReactorHandle};
pub use session::SessionRegistry;
