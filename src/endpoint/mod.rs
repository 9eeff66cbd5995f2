//! The endpoint half of the relay: a long-lived client that speaks the same
//! `/ws/relay` protocol as the server, plus the pairing handshake and QR
//! encode/decode helpers used to bootstrap a session.

pub mod pairing_flow;
pub mod qr;
pub mod relay_client;

pub use relay_client::{EndpointEvent, RelayClient};
