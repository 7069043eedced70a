//! Seams between the server transports and the request engine above them.
//!
//! Both the framed and the STOMP transports surface each complete inbound
//! payload to a [`RequestHandler`] together with a [`Responder`] bound to the
//! originating connection. The handler may answer at any time, from any
//! thread.

use std::sync::Arc;

use bytes::Bytes;

/// Sends replies back to the connection a request arrived on.
pub trait Responder: Send + Sync {
    /// Queue `payload` for the originating client. Replies to a connection
    /// that has since closed are dropped.
    fn respond(&self, payload: Bytes);
}

/// Consumes complete inbound payloads.
pub trait RequestHandler: Send + Sync {
    /// Handle one payload. Runs on the reactor thread, so implementations
    /// must hand slow work to another thread.
    fn handle_request(&self, payload: Bytes, responder: Arc<dyn Responder>);
}

impl<F> RequestHandler for F
where
    F: Fn(Bytes, Arc<dyn Responder>) + Send + Sync,
{
    fn handle_request(&self, payload: Bytes, responder: Arc<dyn Responder>) { self(payload, responder); }
}
