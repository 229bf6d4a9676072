//! Gateway RPC client: one persistent WebSocket to a long-lived gateway, carrying
//! request/response pairs and push events, reconnecting with backoff when the socket drops.

pub mod backoff;
pub mod client;
pub mod config;
pub mod error;
pub mod protocol;
pub mod transport;

pub use client::{ClientBuilder, ConnectionState, GatewayClient};
pub use error::ClientError;
pub use protocol::{ErrorInfo, EventFrame, Frame, HelloOk};
