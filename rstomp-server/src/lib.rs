//! # rstomp-server
//!
//! STOMP broker server for rstomp.
//!
//! This crate provides:
//! - TCP, TLS and STOMP-over-WebSocket listeners
//! - Per-connection read loop over pooled buffers
//! - Session management with heart-beats and idle timeouts
//! - Frame handlers for every client command
//! - Passcode authentication with a login attempt limit
//! - Prometheus metrics

pub mod auth;
pub mod channel;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod server;
pub mod session;
pub mod stream;
pub mod tls;

pub use auth::{AuthenticationService, CredentialStore, LoginResult};
pub use channel::{Channel, TcpChannel, WebSocketChannel};
pub use config::{
    AuthConfig, BufferConfig, Config, ConfigError, MetricsConfig, NetworkConfig, ProtocolConfig,
    TlsConfig,
};
pub use error::ServerError;
pub use handler::{FrameHandler, ServerInfo};
pub use metrics::Metrics;
pub use server::{Listener, Server, ServerConfig, ServerStats};
pub use session::{HeartBeat, OutboundSink, Session, SessionState};
