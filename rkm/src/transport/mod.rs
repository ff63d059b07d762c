//! QUIC transport between controllers and machine agents.
//!
//! Every request travels on its own bidirectional stream as one bincode
//! encoded [`common::MachineMessage`]; the agent answers on the same stream
//! with one [`common::MachineResponse`].

pub mod client;
pub mod server;
pub mod tls;

pub use client::MachineClient;
pub use server::{BoundEndpoint, dispatch, serve};
pub use tls::init_crypto;

/// Upper bound on a single encoded request or response.
pub const MAX_MESSAGE_SIZE: usize = 1 << 20;
