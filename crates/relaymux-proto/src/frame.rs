//! Multiplexing frames exchanged over a relay link

use crate::identity::{PublicKey, PUBLIC_KEY_LEN};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Channel identifier, unique within one relay connection
pub type ChannelId = u16;

/// Reason codes carried in CLOSE payloads
pub mod close_reason {
    /// Normal close
    pub const NORMAL: u8 = 0x00;
    /// Peer violated the frame protocol on this channel
    pub const PROTOCOL: u8 = 0x01;
    /// Local consumer did not drain the channel in time
    pub const STALLED: u8 = 0x02;
}

/// Frame types for relay multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrameType {
    Request,
    Accept,
    Close,
    Fwd,
    /// Tag not understood by this implementation
    Unknown(u8),
}

impl FrameType {
    pub const REQUEST: u8 = 0x01;
    pub const ACCEPT: u8 = 0x02;
    pub const CLOSE: u8 = 0x03;
    pub const FWD: u8 = 0x0a;

    pub fn as_u8(&self) -> u8 {
        match self {
            FrameType::Request => Self::REQUEST,
            FrameType::Accept => Self::ACCEPT,
            FrameType::Close => Self::CLOSE,
            FrameType::Fwd => Self::FWD,
            FrameType::Unknown(tag) => *tag,
        }
    }
}

impl From<u8> for FrameType {
    fn from(value: u8) -> Self {
        match value {
            Self::REQUEST => FrameType::Request,
            Self::ACCEPT => FrameType::Accept,
            Self::CLOSE => FrameType::Close,
            Self::FWD => FrameType::Fwd,
            other => FrameType::Unknown(other),
        }
    }
}

impl std::fmt::Display for FrameType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameType::Request => write!(f, "REQUEST"),
            FrameType::Accept => write!(f, "ACCEPT"),
            FrameType::Close => write!(f, "CLOSE"),
            FrameType::Fwd => write!(f, "FWD"),
            FrameType::Unknown(tag) => write!(f, "UNKNOWN(0x{:02x})", tag),
        }
    }
}

/// Frame errors
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("Stream ended mid-frame ({0} bytes buffered)")]
    Truncated(usize),
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub frame_type: FrameType,
    pub channel_id: ChannelId,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: frame_type (1) + channel_id (2) + length (2) = 5 bytes
    pub const HEADER_SIZE: usize = 5;

    /// Largest payload a single frame can carry
    pub const MAX_PAYLOAD: usize = u16::MAX as usize;

    pub fn new(frame_type: FrameType, channel_id: ChannelId, payload: Bytes) -> Self {
        Self {
            frame_type,
            channel_id,
            payload,
        }
    }

    /// REQUEST frame opening `channel_id` from `initiator` to `responder`
    pub fn request(channel_id: ChannelId, initiator: &PublicKey, responder: &PublicKey) -> Self {
        Self::new(
            FrameType::Request,
            channel_id,
            join_public_keys(initiator, responder),
        )
    }

    /// ACCEPT frame echoing the request's key pair
    pub fn accept(channel_id: ChannelId, initiator: &PublicKey, responder: &PublicKey) -> Self {
        Self::new(
            FrameType::Accept,
            channel_id,
            join_public_keys(initiator, responder),
        )
    }

    pub fn close(channel_id: ChannelId, reason: u8) -> Self {
        Self::new(FrameType::Close, channel_id, Bytes::copy_from_slice(&[reason]))
    }

    pub fn fwd(channel_id: ChannelId, payload: Bytes) -> Self {
        Self::new(FrameType::Fwd, channel_id, payload)
    }

    /// Reason byte of a CLOSE frame; an empty payload reads as a normal close
    pub fn close_reason(&self) -> u8 {
        self.payload.first().copied().unwrap_or(close_reason::NORMAL)
    }

    /// Size of the frame once encoded
    pub fn encoded_len(&self) -> usize {
        Self::HEADER_SIZE + self.payload.len()
    }

    /// Append the encoded frame to `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), FrameError> {
        let payload_len = self.payload.len();
        if payload_len > Self::MAX_PAYLOAD {
            return Err(FrameError::FrameTooLarge(payload_len));
        }

        buf.reserve(self.encoded_len());
        buf.put_u8(self.frame_type.as_u8());
        buf.put_u16(self.channel_id);
        buf.put_u16(payload_len as u16);
        buf.put_slice(&self.payload);
        Ok(())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, FrameError> {
        let mut buf = BytesMut::with_capacity(self.encoded_len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`
    ///
    /// Returns `None` (leaving `buf` untouched) until a whole frame is buffered.
    pub fn decode(buf: &mut BytesMut) -> Option<Self> {
        if buf.len() < Self::HEADER_SIZE {
            return None;
        }

        let length = u16::from_be_bytes([buf[3], buf[4]]) as usize;
        if buf.len() < Self::HEADER_SIZE + length {
            buf.reserve(Self::HEADER_SIZE + length - buf.len());
            return None;
        }

        let frame_type = FrameType::from(buf.get_u8());
        let channel_id = buf.get_u16();
        let _ = buf.get_u16();
        let payload = buf.split_to(length).freeze();

        Some(Self {
            frame_type,
            channel_id,
            payload,
        })
    }
}

/// Channel ids allocated by the local endpoint are even
pub fn is_locally_initiated(id: ChannelId) -> bool {
    id % 2 == 0
}

/// Channel ids allocated by the remote endpoint are odd
pub fn is_remotely_initiated(id: ChannelId) -> bool {
    id % 2 == 1
}

/// `initiator || responder`
pub fn join_public_keys(initiator: &PublicKey, responder: &PublicKey) -> Bytes {
    let mut buf = BytesMut::with_capacity(PUBLIC_KEY_LEN * 2);
    buf.put_slice(initiator.as_bytes());
    buf.put_slice(responder.as_bytes());
    buf.freeze()
}

/// Split a REQUEST/ACCEPT payload into `(initiator, responder)`
pub fn split_public_keys(payload: &[u8]) -> Option<(PublicKey, PublicKey)> {
    if payload.len() != PUBLIC_KEY_LEN * 2 {
        return None;
    }
    let initiator = PublicKey::from_slice(&payload[..PUBLIC_KEY_LEN]).ok()?;
    let responder = PublicKey::from_slice(&payload[PUBLIC_KEY_LEN..]).ok()?;
    Some((initiator, responder))
}
