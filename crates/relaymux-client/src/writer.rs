//! Shared write half of a relay stream

use crate::connector::BoxedRelayStream;
use futures::SinkExt;
use relaymux_proto::{Frame, FrameCodec, FrameError};
use std::sync::Arc;
use tokio::io::WriteHalf;
use tokio::sync::Mutex;
use tokio_util::codec::FramedWrite;

/// Serializes frame writes from the reader loop and every transport
#[derive(Clone)]
pub(crate) struct FrameWriter {
    inner: Arc<Mutex<FramedWrite<WriteHalf<BoxedRelayStream>, FrameCodec>>>,
}

impl FrameWriter {
    pub(crate) fn new(write_half: WriteHalf<BoxedRelayStream>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(FramedWrite::new(write_half, FrameCodec::new()))),
        }
    }

    /// Write and flush one frame
    pub(crate) async fn write(&self, frame: Frame) -> Result<(), FrameError> {
        self.inner.lock().await.send(frame).await
    }

    /// Flush and shut down the write side of the stream
    pub(crate) async fn shutdown(&self) -> Result<(), FrameError> {
        SinkExt::<Frame>::close(&mut *self.inner.lock().await).await
    }
}

impl std::fmt::Debug for FrameWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameWriter").finish_non_exhaustive()
    }
}
