//! `tokio_util` codec for relay frames

use crate::frame::{Frame, FrameError};
use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

/// Frame codec used with `FramedRead`/`FramedWrite` over a relay stream
///
/// Decoding waits for a complete frame. A stream that ends in the middle of a
/// frame yields [`FrameError::Truncated`]; framing cannot be recovered after that.
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = FrameError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        Ok(Frame::decode(src))
    }

    fn decode_eof(&mut self, buf: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match self.decode(buf)? {
            Some(frame) => Ok(Some(frame)),
            None if buf.is_empty() => Ok(None),
            None => Err(FrameError::Truncated(buf.len())),
        }
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = FrameError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), Self::Error> {
        frame.encode_into(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameType;
    use bytes::Bytes;
    use futures::{SinkExt, StreamExt};
    use tokio::io::AsyncWriteExt;
    use tokio_util::codec::{FramedRead, FramedWrite};

    #[test]
    fn test_decode_multiple() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec
            .encode(Frame::fwd(2, Bytes::from_static(b"one")), &mut buf)
            .unwrap();
        codec.encode(Frame::close(4, 0), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first.frame_type, FrameType::Fwd);
        assert_eq!(first.channel_id, 2);
        assert_eq!(second.frame_type, FrameType::Close);
        assert_eq!(second.channel_id, 4);
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn test_truncated_at_eof() {
        let mut codec = FrameCodec::new();
        let encoded = Frame::fwd(2, Bytes::from_static(b"payload")).encode().unwrap();
        let mut buf = BytesMut::from(&encoded[..6]);

        assert!(matches!(
            codec.decode_eof(&mut buf),
            Err(FrameError::Truncated(6))
        ));
    }

    #[test]
    fn test_clean_eof() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();
        assert!(codec.decode_eof(&mut buf).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_framed_over_duplex() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client, FrameCodec::new());
        let mut reader = FramedRead::new(server, FrameCodec::new());

        // Larger than the duplex buffer so the frame arrives in pieces
        let big = Bytes::from(vec![7u8; 1000]);
        let sent = big.clone();
        let send_task = tokio::spawn(async move {
            writer.send(Frame::fwd(10, sent)).await.unwrap();
            writer.send(Frame::close(10, 0)).await.unwrap();
            writer.into_inner().shutdown().await.unwrap();
        });

        let first = reader.next().await.unwrap().unwrap();
        assert_eq!(first.payload, big);
        let second = reader.next().await.unwrap().unwrap();
        assert_eq!(second.frame_type, FrameType::Close);
        assert!(reader.next().await.is_none());

        send_task.await.unwrap();
    }
}
