//! Metric helpers for `hostwire`.
//!
//! Metric names are exported as constants so dashboards and tests can refer
//! to them. With the `metrics` feature disabled every helper compiles to a
//! no-op.

/// Gauge tracking connections currently owned by a reactor.
pub const CONNECTIONS_ACTIVE: &str = "hostwire_connections_active";
/// Counter of connections bound to a protocol, labelled by protocol name.
pub const PROTOCOLS_DETECTED: &str = "hostwire_protocols_detected_total";
/// Counter of connections closed before a protocol was detected.
pub const DETECTION_FAILURES: &str = "hostwire_detection_failures_total";
/// Counter of failed or timed-out TLS handshakes.
pub const HANDSHAKE_FAILURES: &str = "hostwire_tls_handshake_failures_total";
/// Counter of frames moved across connections, labelled by direction.
pub const FRAMES_PROCESSED: &str = "hostwire_frames_processed_total";
/// Counter of JSON-RPC requests executed by the server.
pub const RPC_CALLS: &str = "hostwire_rpc_calls_total";
/// Counter of JSON-RPC requests that produced an error response.
pub const RPC_ERRORS: &str = "hostwire_rpc_errors_total";

/// Direction of frame processing.
#[derive(Clone, Copy, Debug)]
pub enum Direction {
    /// Frames decoded from a peer.
    Inbound,
    /// Frames queued for a peer.
    Outbound,
}

impl Direction {
    #[cfg_attr(not(feature = "metrics"), allow(dead_code))]
    fn as_str(self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
        }
    }
}

#[cfg(feature = "metrics")]
mod imp {
    use metrics::{counter, gauge};

    use super::*;

    pub fn inc_connections() { gauge!(CONNECTIONS_ACTIVE).increment(1.0); }

    pub fn dec_connections() { gauge!(CONNECTIONS_ACTIVE).decrement(1.0); }

    pub fn inc_detected(protocol: &str) {
        counter!(PROTOCOLS_DETECTED, "protocol" => protocol.to_owned()).increment(1);
    }

    pub fn inc_detection_failures() { counter!(DETECTION_FAILURES).increment(1); }

    pub fn inc_handshake_failures() { counter!(HANDSHAKE_FAILURES).increment(1); }

    pub fn inc_frames(direction: Direction) {
        counter!(FRAMES_PROCESSED, "direction" => direction.as_str()).increment(1);
    }

    pub fn inc_rpc_calls() { counter!(RPC_CALLS).increment(1); }

    pub fn inc_rpc_errors() { counter!(RPC_ERRORS).increment(1); }
}

#[cfg(not(feature = "metrics"))]
mod imp {
    use super::Direction;

    pub fn inc_connections() {}

    pub fn dec_connections() {}

    pub fn inc_detected(_protocol: &str) {}

    pub fn inc_detection_failures() {}

    pub fn inc_handshake_failures() {}

    pub fn inc_frames(_direction: Direction) {}

    pub fn inc_rpc_calls() {}

    pub fn inc_rpc_errors() {}
}

pub use imp::*;
