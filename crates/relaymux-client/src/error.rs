//! Client error types

use crate::connector::ConnectError;
use relaymux_discovery::DiscoveryError;
use relaymux_proto::{ChannelId, FrameError, FrameType};
use thiserror::Error;

/// Errors surfaced by transports, relay connections and the client pool
#[derive(Debug, Error)]
pub enum ClientError {
    // Stream errors: fatal to the relay connection
    #[error("Frame error: {0}")]
    Frame(#[from] FrameError),

    #[error("Relay disconnected")]
    RelayDisconnected,

    // Handshake errors
    #[error("Handshake rejected on channel {channel_id} (reason {reason})")]
    HandshakeRejected { channel_id: ChannelId, reason: u8 },

    #[error("Handshake timed out on channel {0}")]
    HandshakeTimeout(ChannelId),

    #[error("Unexpected {frame_type} frame on channel {channel_id}")]
    UnexpectedFrame {
        channel_id: ChannelId,
        frame_type: FrameType,
    },

    #[error("ACCEPT on channel {0} does not match the request")]
    AcceptMismatch(ChannelId),

    // Resource exhaustion
    #[error("No free channel id on relay connection")]
    NoFreeChannel,

    // Availability errors
    #[error("No relay server available")]
    NoRelayAvailable,

    #[error("All relay servers failed")]
    AllRelaysFailed,

    #[error("Discovery error: {0}")]
    Discovery(#[from] DiscoveryError),

    #[error("Relay connect error: {0}")]
    Connect(#[from] ConnectError),

    // Closed resources
    #[error("Client closed")]
    ClientClosed,

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Transport {0} closed")]
    TransportClosed(ChannelId),

    #[error("Connection is already being served")]
    AlreadyServing,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

/// Result type for client operations
pub type ClientResult<T> = Result<T, ClientError>;
