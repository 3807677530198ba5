//! Seam to the encrypted stream layer
//!
//! A relay connection runs on top of a byte stream that is already
//! authenticated and encrypted with the relay server's long-term key. How that
//! stream is established (TCP plus a Noise handshake in production) is up to
//! the [`RelayConnector`] implementation handed to the client.

use async_trait::async_trait;
use relaymux_proto::{Keypair, PublicKey};
use std::fmt::Debug;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};

/// Errors establishing a relay stream
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake with relay {server} failed: {reason}")]
    Handshake { server: PublicKey, reason: String },

    #[error("Relay {0} does not advertise an address")]
    NoAddress(PublicKey),

    #[error("Timeout connecting to relay")]
    Timeout,
}

/// Byte stream to a relay server
pub trait RelayStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> RelayStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Owned, type-erased relay stream
pub type BoxedRelayStream = Box<dyn RelayStream>;

/// Establishes authenticated, encrypted streams to relay servers
#[async_trait]
pub trait RelayConnector: Send + Sync + Debug {
    /// Connect to the relay `server` listening on `addr`
    ///
    /// Both sides authenticate with their long-term keys. A failed handshake
    /// must be reported as an error; no stream is returned.
    async fn connect(
        &self,
        local: &Keypair,
        server: PublicKey,
        addr: &str,
    ) -> Result<BoxedRelayStream, ConnectError>;
}
