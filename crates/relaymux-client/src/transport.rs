//! Logical point-to-point stream multiplexed over a relay connection
//!
//! A [`Transport`] is one end of a channel between the local client and one
//! remote client. The owning [`Connection`](crate::Connection) creates it,
//! keeps it in its channel table, and hands it every inbound frame addressed to
//! its channel id through `deliver`. Nothing else reads frames for a transport.
//!
//! # Inbound buffering
//!
//! Delivered frames go into a bounded queue of `transport_buffer` frames. The
//! reader loop waits at most `deliver_timeout` for space. A transport whose
//! consumer does not keep up within that allowance is closed as stalled, so a
//! slow consumer only ever costs the other channels on the same relay link
//! that one bounded wait.

use crate::config::ClientConfig;
use crate::writer::FrameWriter;
use crate::{ClientError, ClientResult};
use bytes::Bytes;
use relaymux_proto::{close_reason, split_public_keys, ChannelId, Frame, FrameType, PublicKey};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

/// Transport lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Handshaking,
    Open,
    Closed,
}

impl TransportState {
    fn as_u8(self) -> u8 {
        match self {
            TransportState::Handshaking => 0,
            TransportState::Open => 1,
            TransportState::Closed => 2,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            0 => TransportState::Handshaking,
            1 => TransportState::Open,
            _ => TransportState::Closed,
        }
    }
}

impl std::fmt::Display for TransportState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TransportState::Handshaking => write!(f, "handshaking"),
            TransportState::Open => write!(f, "open"),
            TransportState::Closed => write!(f, "closed"),
        }
    }
}

/// Which side opened the channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// Sent the REQUEST; owns an even channel id
    Initiator,
    /// Answered a REQUEST; owns an odd channel id
    Responder,
}

struct TransportInner {
    id: ChannelId,
    local: PublicKey,
    remote: PublicKey,
    role: Role,
    writer: FrameWriter,
    state: AtomicU8,
    closing: AtomicBool,
    done: CancellationToken,
    inbound_tx: mpsc::Sender<Frame>,
    inbound_rx: Mutex<mpsc::Receiver<Frame>>,
    /// Shared with the parent connection's channel allocator
    slot_freed: Arc<Notify>,
    handshake_timeout: Duration,
    deliver_timeout: Duration,
    write_timeout: Duration,
}

/// Handle to one multiplexed channel; clones share the same channel
#[derive(Clone)]
pub struct Transport {
    inner: Arc<TransportInner>,
}

impl Transport {
    pub(crate) fn new(
        writer: FrameWriter,
        local: PublicKey,
        remote: PublicKey,
        id: ChannelId,
        role: Role,
        config: &ClientConfig,
        slot_freed: Arc<Notify>,
    ) -> Self {
        let (inbound_tx, inbound_rx) = mpsc::channel(config.transport_buffer);

        Self {
            inner: Arc::new(TransportInner {
                id,
                local,
                remote,
                role,
                writer,
                state: AtomicU8::new(TransportState::Handshaking.as_u8()),
                closing: AtomicBool::new(false),
                done: CancellationToken::new(),
                inbound_tx,
                inbound_rx: Mutex::new(inbound_rx),
                slot_freed,
                handshake_timeout: config.handshake_timeout,
                deliver_timeout: config.deliver_timeout,
                write_timeout: config.write_timeout,
            }),
        }
    }

    pub fn id(&self) -> ChannelId {
        self.inner.id
    }

    pub fn local(&self) -> PublicKey {
        self.inner.local
    }

    pub fn remote(&self) -> PublicKey {
        self.inner.remote
    }

    pub fn role(&self) -> Role {
        self.inner.role
    }

    pub fn is_initiator(&self) -> bool {
        self.inner.role == Role::Initiator
    }

    pub fn state(&self) -> TransportState {
        TransportState::from_u8(self.inner.state.load(Ordering::SeqCst))
    }

    /// True once closed; the channel slot may then be reused
    pub fn is_done(&self) -> bool {
        self.state() == TransportState::Closed
    }

    pub(crate) fn ptr_eq(&self, other: &Transport) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Run this side of the channel handshake
    ///
    /// The initiator sends REQUEST and waits up to `handshake_timeout` for the
    /// matching ACCEPT. The responder sends ACCEPT.
    pub async fn handshake(&self) -> ClientResult<()> {
        match self.inner.role {
            Role::Initiator => self.initiator_handshake().await,
            Role::Responder => self.responder_handshake().await,
        }
    }

    async fn initiator_handshake(&self) -> ClientResult<()> {
        let id = self.inner.id;
        if let Err(e) = self
            .inner
            .writer
            .write(Frame::request(id, &self.inner.local, &self.inner.remote))
            .await
        {
            self.mark_closed();
            return Err(e.into());
        }
        trace!("Sent REQUEST on channel {}", id);

        let mut rx = self.inner.inbound_rx.lock().await;
        let waited = tokio::time::timeout(self.inner.handshake_timeout, async {
            let frame = tokio::select! {
                biased;
                frame = rx.recv() => frame,
                _ = self.inner.done.cancelled() => rx.try_recv().ok(),
            };
            let Some(frame) = frame else {
                return Err(ClientError::TransportClosed(id));
            };

            match frame.frame_type {
                FrameType::Accept if self.accept_matches(&frame) => Ok(()),
                FrameType::Accept => Err(ClientError::AcceptMismatch(id)),
                FrameType::Close => {
                    self.mark_closed();
                    Err(ClientError::HandshakeRejected {
                        channel_id: id,
                        reason: frame.close_reason(),
                    })
                }
                other => Err(ClientError::UnexpectedFrame {
                    channel_id: id,
                    frame_type: other,
                }),
            }
        })
        .await;
        drop(rx);

        let result = match waited {
            Ok(result) => result,
            Err(_) => Err(ClientError::HandshakeTimeout(id)),
        };

        match result {
            // Already open: the reader switches state when it delivers the
            // ACCEPT. Frames right behind it may have closed it again.
            Ok(()) => {
                debug!(
                    "Transport {} to {} open (initiator, {})",
                    id,
                    self.inner.remote.short(),
                    self.state()
                );
                Ok(())
            }
            Err(e) => {
                let reason = match e {
                    ClientError::HandshakeTimeout(_) => close_reason::NORMAL,
                    _ => close_reason::PROTOCOL,
                };
                self.close_with(reason).await;
                Err(e)
            }
        }
    }

    async fn responder_handshake(&self) -> ClientResult<()> {
        let id = self.inner.id;
        // ACCEPT echoes the request: initiator || responder
        let accept = Frame::accept(id, &self.inner.remote, &self.inner.local);

        match tokio::time::timeout(self.inner.write_timeout, self.inner.writer.write(accept)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                self.mark_closed();
                return Err(e.into());
            }
            Err(_) => {
                self.mark_closed();
                return Err(ClientError::HandshakeTimeout(id));
            }
        }

        if !self.transition(TransportState::Handshaking, TransportState::Open) {
            return Err(ClientError::TransportClosed(id));
        }
        debug!(
            "Transport {} from {} open (responder)",
            id,
            self.inner.remote.short()
        );
        Ok(())
    }

    /// Hand an inbound frame to this transport
    ///
    /// Only the owning connection's reader loop calls this. Returns `false`
    /// when the transport is (or just became) closed, telling the connection
    /// to clear the channel slot.
    ///
    /// A matching ACCEPT opens an initiator here rather than in the handshake
    /// waiter, so the frames that follow it on the stream get the open-channel
    /// rules in stream order.
    pub(crate) async fn deliver(&self, frame: Frame) -> bool {
        match self.state() {
            TransportState::Closed => false,
            TransportState::Handshaking if self.is_initiator() => {
                if frame.frame_type == FrameType::Accept
                    && self.accept_matches(&frame)
                    && !self.transition(TransportState::Handshaking, TransportState::Open)
                {
                    return false;
                }
                self.enqueue(frame).await
            }
            TransportState::Handshaking | TransportState::Open => match frame.frame_type {
                FrameType::Fwd => self.enqueue(frame).await,
                FrameType::Close => {
                    debug!(
                        "Transport {} closed by remote (reason {})",
                        self.inner.id,
                        frame.close_reason()
                    );
                    self.mark_closed();
                    false
                }
                FrameType::Accept => {
                    trace!("Duplicate ACCEPT on channel {} ignored", self.inner.id);
                    true
                }
                FrameType::Request | FrameType::Unknown(_) => {
                    warn!(
                        "Unexpected {} frame on open channel {}, closing",
                        frame.frame_type, self.inner.id
                    );
                    self.close_with(close_reason::PROTOCOL).await;
                    false
                }
            },
        }
    }

    fn accept_matches(&self, frame: &Frame) -> bool {
        // ACCEPT echoes the request: initiator || responder
        split_public_keys(&frame.payload) == Some((self.inner.local, self.inner.remote))
    }

    async fn enqueue(&self, frame: Frame) -> bool {
        let sent = tokio::select! {
            res = self.inner.inbound_tx.send_timeout(frame, self.inner.deliver_timeout) => res,
            _ = self.inner.done.cancelled() => return false,
        };

        match sent {
            Ok(()) => true,
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    "Transport {} buffer full for {:?}, closing as stalled",
                    self.inner.id, self.inner.deliver_timeout
                );
                self.close_with(close_reason::STALLED).await;
                false
            }
            Err(SendTimeoutError::Closed(_)) => false,
        }
    }

    /// Send payload data on an open transport
    ///
    /// Data longer than one frame is split across several FWD frames.
    pub async fn send(&self, data: Bytes) -> ClientResult<()> {
        let mut rest = data;
        while !rest.is_empty() {
            if self.state() != TransportState::Open {
                return Err(ClientError::TransportClosed(self.inner.id));
            }
            let chunk = rest.split_to(rest.len().min(Frame::MAX_PAYLOAD));
            self.inner
                .writer
                .write(Frame::fwd(self.inner.id, chunk))
                .await?;
        }
        Ok(())
    }

    /// Receive the next payload
    ///
    /// Returns `None` once the transport is closed and buffered data is drained.
    pub async fn recv(&self) -> ClientResult<Option<Bytes>> {
        let mut rx = self.inner.inbound_rx.lock().await;
        loop {
            let frame = tokio::select! {
                biased;
                frame = rx.recv() => frame,
                _ = self.inner.done.cancelled() => rx.try_recv().ok(),
            };

            match frame {
                Some(frame) if frame.frame_type == FrameType::Fwd => {
                    return Ok(Some(frame.payload));
                }
                Some(_) => continue,
                None => return Ok(None),
            }
        }
    }

    /// Close the transport, notifying the remote end best-effort
    ///
    /// Idempotent.
    pub async fn close(&self) {
        self.close_with(close_reason::NORMAL).await;
    }

    pub(crate) async fn close_with(&self, reason: u8) {
        if self.inner.closing.swap(true, Ordering::SeqCst) {
            return;
        }

        let frame = Frame::close(self.inner.id, reason);
        match tokio::time::timeout(self.inner.write_timeout, self.inner.writer.write(frame)).await {
            Ok(Ok(())) => trace!("Sent CLOSE on channel {}", self.inner.id),
            Ok(Err(e)) => debug!("Failed to send CLOSE on channel {}: {}", self.inner.id, e),
            Err(_) => debug!("Timed out sending CLOSE on channel {}", self.inner.id),
        }

        self.mark_closed();
    }

    /// Mark closed without writing anything; used when the remote closed the
    /// channel or the relay stream is gone
    pub(crate) fn mark_closed(&self) {
        self.inner.closing.store(true, Ordering::SeqCst);
        let previous = self
            .inner
            .state
            .swap(TransportState::Closed.as_u8(), Ordering::SeqCst);

        if TransportState::from_u8(previous) != TransportState::Closed {
            self.inner.done.cancel();
            self.inner.slot_freed.notify_waiters();
        }
    }

    fn transition(&self, from: TransportState, to: TransportState) -> bool {
        self.inner
            .state
            .compare_exchange(from.as_u8(), to.as_u8(), Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport")
            .field("id", &self.inner.id)
            .field("local", &self.inner.local)
            .field("remote", &self.inner.remote)
            .field("role", &self.inner.role)
            .field("state", &self.state())
            .finish()
    }
}
