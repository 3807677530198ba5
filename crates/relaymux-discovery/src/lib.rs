//! Discovery service client for relay multiplexing
//!
//! Clients publish which relay servers they are reachable through, and look
//! up the relays of the peers they want to reach. Relay servers publish their
//! own address in the same store.
//!
//! # Implementations
//!
//! - [`MemoryDiscovery`]: process-local store, used by tests and embedded setups
//! - [`HttpDiscovery`]: client for a remote messaging-discovery service

pub mod entry;
pub mod http;
pub mod memory;

pub use entry::{ClientInfo, Entry, ServerInfo, ENTRY_VERSION};
pub use http::HttpDiscovery;
pub use memory::MemoryDiscovery;

use async_trait::async_trait;
use relaymux_proto::PublicKey;
use std::fmt::Debug;
use thiserror::Error;

/// Discovery errors
#[derive(Debug, Error)]
pub enum DiscoveryError {
    #[error("Entry not found: {0}")]
    NotFound(PublicKey),

    #[error("Entry already exists: {0}")]
    AlreadyExists(PublicKey),

    #[error("Invalid entry signature")]
    InvalidSignature,

    #[error("Signing key does not own the entry")]
    SignerMismatch,

    #[error("Sequence out of order: stored {stored}, got {got}")]
    SequenceOutOfOrder { stored: u64, got: u64 },

    #[error("Discovery returned HTTP {status}: {message}")]
    Http { status: u16, message: String },

    #[error("Discovery transport error: {0}")]
    Transport(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl DiscoveryError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, DiscoveryError::NotFound(_))
    }
}

/// Result type for discovery operations
pub type DiscoveryResult<T> = Result<T, DiscoveryError>;

/// Lookup and publication of discovery entries
#[async_trait]
pub trait DiscoveryClient: Send + Sync + Debug {
    /// Fetch the entry owned by `pk`
    async fn entry(&self, pk: &PublicKey) -> DiscoveryResult<Entry>;

    /// Store a new signed entry
    async fn create_entry(&self, entry: &Entry) -> DiscoveryResult<()>;

    /// Replace an existing entry with a newer signed version
    async fn update_entry(&self, entry: &Entry) -> DiscoveryResult<()>;

    /// Relay servers currently accepting clients, in preference order
    async fn available_servers(&self) -> DiscoveryResult<Vec<Entry>>;
}
