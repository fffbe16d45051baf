//! Pair Relay - asker/helper pairing relay with resumable sessions
//!
//! Peers connect over one WebSocket each, receive a short shareable UID and
//! take a role. A helper pairs with an asker by naming the asker's UID;
//! from then on questions, answers and audio flow between the two. Sessions
//! survive disconnects for a TTL window so a dropped peer can resume its
//! identity and pairing.
//!
//! The server side is [`server::RelayServer`]; the reconnecting peer side
//! is [`client::RelayClient`].
//!
//! # Example
//!
//! ```no_run
//! use pair_relay::client::RelayClient;
//! use pair_relay::config::{ClientConfig, RelayConfig};
//! use pair_relay::server::RelayServer;
//! use pair_relay::session_store::Role;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let server = RelayServer::bind(&RelayConfig::default()).await?;
//!
//!     let client = RelayClient::new(ClientConfig::default());
//!     let uid = client.connect(Role::Asker, None, None, None).await?;
//!     println!("share this UID with your helper: {uid}");
//!
//!     server.wait().await
//! }
//! ```

pub mod actor;
pub mod client;
pub mod config;
pub mod error;
pub mod handler;
pub mod hub;
pub mod metrics;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod session_store;
pub mod uid;


pub use client::{ClientEvent, RelayClient};
pub use error::{ClientError, ProtocolError};
pub use server::RelayServer;
pub use session_store::Role;
