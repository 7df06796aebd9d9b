// Realtime session — handshake, framing, and rate-limited streaming to the live endpoint.

pub mod error;
pub mod protocol;
pub mod session;
pub mod throttle;
pub mod transport;
