//! Session gateway: viewer WebSocket endpoints, the access gate, and
//! the control channel protocol.

pub mod client;
pub mod config;
pub mod ctrl;
pub mod security;
pub mod server;

pub use client::{ClientId, ClientRegistry, Namespace};
pub use config::{ConfigError, GateConfig};
pub use ctrl::CtrlChannel;
pub use security::{
    authorize_connection, sign_nonce, ConnectAuth, FixedWindowRateLimiter, IssuedNonce, NonceStore,
};
pub use server::{build_router, start, AppState, ServerConfig, ServerHandle};
