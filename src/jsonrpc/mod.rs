//! JSON-RPC 2.0 engine shared by both transports.
//!
//! [`JsonRpcServer`] is the [`RequestHandler`](crate::transport::RequestHandler)
//! the server protocols feed; [`JsonRpcClient`] runs over any
//! [`ClientTransport`](crate::client::ClientTransport). Requests without an
//! `id` are notifications and are never answered.

mod client;
mod error;
mod message;
mod pool;
mod server;

pub use client::{ALL_EVENTS, AcceptAll, Call, Event, EventQueue, EventSchema, JsonRpcClient, SubscriptionId};
pub use error::{ErrorObject, RpcError, error_codes};
pub use message::{
    Inbound,
    JSONRPC_VERSION,
    Params,
    Request,
    Response,
    classify,
    encode_requests,
    encode_responses,
};
pub use pool::{DEFAULT_CAPACITY, DEFAULT_WORKERS, PoolExhausted, WorkerPool};
pub use server::{Bridge, JsonRpcServer, Method, MethodTable, event_payload, method_key, publish_event};

#[cfg(test)]
mod tests;
