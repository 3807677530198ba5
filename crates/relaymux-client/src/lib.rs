//! Client side of the relay multiplexing transport
//!
//! Nodes that cannot reach each other directly connect to shared relay
//! servers. Each relay link carries many logical point-to-point
//! [`Transport`]s, multiplexed by 16-bit channel id.
//!
//! # Layers
//!
//! - [`Transport`]: one logical stream and its REQUEST/ACCEPT handshake
//! - [`Connection`]: one relay link, its channel table and reader loop
//! - [`Client`]: the pool of relay links and this node's discovery entry
//!
//! Establishing the encrypted stream to a relay is delegated to a
//! [`RelayConnector`]; looking up and publishing relay sets is delegated to a
//! [`DiscoveryClient`](relaymux_discovery::DiscoveryClient).
//!
//! # Example
//!
//! ```ignore
//! use relaymux_client::{Client, ClientConfig};
//! use relaymux_discovery::HttpDiscovery;
//! use relaymux_proto::Keypair;
//! use std::sync::Arc;
//!
//! let discovery = Arc::new(HttpDiscovery::new("http://discovery.local:9090")?);
//! let client = Client::new(Keypair::generate(), discovery, connector, ClientConfig::default())?;
//!
//! client.initiate_servers(1).await?;
//! let transport = client.dial(peer).await?;
//! transport.send(bytes::Bytes::from_static(b"hello")).await?;
//! ```

pub mod client;
pub mod config;
pub mod connection;
pub mod connector;
pub mod error;
pub mod factory;
pub mod transport;

mod writer;

pub use client::{Client, TYPE_NAME};
pub use config::{ClientConfig, ClientConfigBuilder};
pub use connection::Connection;
pub use connector::{BoxedRelayStream, ConnectError, RelayConnector, RelayStream};
pub use error::{ClientError, ClientResult};
pub use factory::TransportFactory;
pub use transport::{Role, Transport, TransportState};
