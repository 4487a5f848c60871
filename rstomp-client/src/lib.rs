//! # rstomp-client
//!
//! Async Rust client for the rstomp broker.
//!
//! # Example
//!
//! ```no_run
//! use rstomp_client::{AckMode, Client, ConnectionConfig};
//!
//! # async fn example() -> Result<(), rstomp_client::ClientError> {
//! let client = Client::connect(ConnectionConfig::new("127.0.0.1:61613".parse().unwrap())).await?;
//!
//! let mut orders = client.subscribe("/queue/orders", AckMode::ClientIndividual).await?;
//! client.send("/queue/orders", "order-1").await?;
//!
//! if let Some(message) = orders.next().await {
//!     println!("{:?}", message.body_str());
//!     client.ack(&message).await?;
//! }
//!
//! client.disconnect().await?;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod connection;
pub mod error;

pub use client::{AckMode, Client, Message, Subscription, Transaction};
pub use connection::{Connection, ConnectionConfig, SessionInfo};
pub use error::ClientError;
