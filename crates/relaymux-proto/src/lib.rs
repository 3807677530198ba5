//! Relay multiplexing protocol definitions
//!
//! This crate defines the wire frames exchanged between a client and a relay
//! server, the codec that reads and writes them over an async byte stream,
//! and the Ed25519 identities that name clients and relays.

pub mod codec;
pub mod frame;
pub mod identity;

pub use codec::FrameCodec;
pub use frame::{
    close_reason, is_locally_initiated, is_remotely_initiated, join_public_keys,
    split_public_keys, ChannelId, Frame, FrameError, FrameType,
};
pub use identity::{KeyError, Keypair, PublicKey, Signature, PUBLIC_KEY_LEN};

/// Number of channel slots in one relay connection
pub const CHANNEL_CAPACITY: usize = 1 << 16;
