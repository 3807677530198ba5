//! Relay connection multiplexer
//!
//! One [`Connection`] owns one stream to a relay server. Its reader loop
//! ([`Connection::serve`]) is the only task that reads frames from that
//! stream; it dispatches each frame to the [`Transport`] registered for the
//! frame's channel id, or handles it itself when no transport owns the id.
//!
//! Channel ids are split in two namespaces: even ids are allocated locally by
//! [`Connection::dial_transport`], odd ids are assigned by the relay for
//! transports initiated by remote clients.

use crate::config::ClientConfig;
use crate::connector::BoxedRelayStream;
use crate::transport::{Role, Transport};
use crate::writer::FrameWriter;
use crate::{ClientError, ClientResult};
use futures::future::join_all;
use futures::StreamExt;
use relaymux_proto::{
    close_reason, is_remotely_initiated, split_public_keys, ChannelId, Frame, FrameCodec,
    FrameType, PublicKey, CHANNEL_CAPACITY,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::io::ReadHalf;
use tokio::sync::{mpsc, Mutex, Notify, RwLock};
use tokio_util::codec::FramedRead;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

type FrameReader = FramedRead<ReadHalf<BoxedRelayStream>, FrameCodec>;

/// Number of ids in the even (locally initiated) namespace
const LOCAL_IDS: usize = CHANNEL_CAPACITY / 2;

/// Dispatch table indexed by channel id
struct ChannelTable {
    slots: Box<[Option<Transport>]>,
    /// Next even id to try; wraps at 2^16
    next_local_id: ChannelId,
}

impl ChannelTable {
    fn new() -> Self {
        Self {
            slots: (0..CHANNEL_CAPACITY).map(|_| None).collect(),
            next_local_id: 0,
        }
    }

    /// Transport owning `id`, unless the slot is empty or its transport is done
    fn live(&self, id: ChannelId) -> Option<&Transport> {
        self.slots[id as usize].as_ref().filter(|tp| !tp.is_done())
    }

    fn insert(&mut self, tp: Transport) {
        let idx = tp.id() as usize;
        self.slots[idx] = Some(tp);
    }

    /// Clear the slot only if it still holds `tp`
    fn remove(&mut self, tp: &Transport) -> bool {
        let slot = &mut self.slots[tp.id() as usize];
        match slot {
            Some(current) if current.ptr_eq(tp) => {
                *slot = None;
                true
            }
            _ => false,
        }
    }

    /// Sweep the even namespace once from the cursor for a free id
    ///
    /// The cursor moves past the returned id so it is not handed out again
    /// until every other even id has been tried.
    fn allocate_local(&mut self) -> Option<ChannelId> {
        for _ in 0..LOCAL_IDS {
            let id = self.next_local_id;
            self.next_local_id = id.wrapping_add(2);
            if self.live(id).is_none() {
                return Some(id);
            }
        }
        None
    }

    fn drain(&mut self) -> Vec<Transport> {
        self.slots.iter_mut().filter_map(Option::take).collect()
    }

    fn live_count(&self) -> usize {
        self.slots
            .iter()
            .flatten()
            .filter(|tp| !tp.is_done())
            .count()
    }
}

/// Closes a dialed transport whose handshake future was dropped mid-flight
struct PendingDial(Option<Transport>);

impl PendingDial {
    fn complete(mut self) {
        self.0 = None;
    }
}

impl Drop for PendingDial {
    fn drop(&mut self) {
        if let Some(tp) = self.0.take() {
            match tokio::runtime::Handle::try_current() {
                Ok(handle) => {
                    handle.spawn(async move { tp.close().await });
                }
                Err(_) => tp.mark_closed(),
            }
        }
    }
}

struct ConnectionInner {
    local: PublicKey,
    remote_server: PublicKey,
    config: Arc<ClientConfig>,
    table: RwLock<ChannelTable>,
    writer: FrameWriter,
    reader: Mutex<Option<FrameReader>>,
    slot_freed: Arc<Notify>,
    /// Set under the table write lock once no new transports may be added
    closed: AtomicBool,
    serving: AtomicBool,
    /// Stops the reader loop
    shutdown: CancellationToken,
    /// Cancelled when the reader loop has returned
    stopped: CancellationToken,
}

/// Multiplexed connection to one relay server
#[derive(Clone)]
pub struct Connection {
    inner: Arc<ConnectionInner>,
}

impl Connection {
    /// Wrap an established relay stream
    ///
    /// Nothing is read until [`serve`](Self::serve) is started.
    pub fn new(
        stream: BoxedRelayStream,
        local: PublicKey,
        remote_server: PublicKey,
        config: Arc<ClientConfig>,
    ) -> Self {
        let (read_half, write_half) = tokio::io::split(stream);

        Self {
            inner: Arc::new(ConnectionInner {
                local,
                remote_server,
                config,
                table: RwLock::new(ChannelTable::new()),
                writer: FrameWriter::new(write_half),
                reader: Mutex::new(Some(FramedRead::new(read_half, FrameCodec::new()))),
                slot_freed: Arc::new(Notify::new()),
                closed: AtomicBool::new(false),
                serving: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
                stopped: CancellationToken::new(),
            }),
        }
    }

    pub fn local(&self) -> PublicKey {
        self.inner.local
    }

    pub fn remote_server(&self) -> PublicKey {
        self.inner.remote_server
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn ptr_eq(&self, other: &Connection) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    /// Number of transports currently occupying a channel slot
    pub async fn live_transports(&self) -> usize {
        self.inner.table.read().await.live_count()
    }

    /// Open a transport to `remote` through this relay
    ///
    /// Allocates a free even channel id, waiting up to `dial_timeout` for one
    /// to be freed when the namespace is full, then runs the initiator
    /// handshake. Dropping the returned future closes the half-open transport.
    pub async fn dial_transport(&self, remote: PublicKey) -> ClientResult<Transport> {
        let tp = match tokio::time::timeout(
            self.inner.config.dial_timeout,
            self.reserve_local(remote),
        )
        .await
        {
            Ok(reserved) => reserved?,
            Err(_) => {
                warn!(
                    "No free channel on relay {} after {:?}",
                    self.inner.remote_server.short(),
                    self.inner.config.dial_timeout
                );
                return Err(ClientError::NoFreeChannel);
            }
        };

        debug!(
            "Dialing {} on channel {} via relay {}",
            remote.short(),
            tp.id(),
            self.inner.remote_server.short()
        );

        let pending = PendingDial(Some(tp.clone()));
        if let Err(e) = tp.handshake().await {
            pending.complete();
            self.remove_slot(&tp).await;
            debug!("Dial to {} on channel {} failed: {}", remote.short(), tp.id(), e);
            return Err(e);
        }
        pending.complete();

        info!(
            "Dialed transport {} to {} via relay {}",
            tp.id(),
            remote.short(),
            self.inner.remote_server.short()
        );
        Ok(tp)
    }

    async fn reserve_local(&self, remote: PublicKey) -> ClientResult<Transport> {
        loop {
            let freed = self.inner.slot_freed.notified();
            tokio::pin!(freed);
            freed.as_mut().enable();

            {
                let mut table = self.inner.table.write().await;
                if self.is_closed() {
                    return Err(ClientError::ConnectionClosed);
                }
                if let Some(id) = table.allocate_local() {
                    let tp = self.new_transport(remote, id, Role::Initiator);
                    table.insert(tp.clone());
                    return Ok(tp);
                }
            }

            trace!(
                "Channel table full on relay {}, waiting for a free slot",
                self.inner.remote_server.short()
            );
            tokio::select! {
                _ = &mut freed => {}
                _ = self.inner.shutdown.cancelled() => return Err(ClientError::ConnectionClosed),
            }
        }
    }

    fn new_transport(&self, remote: PublicKey, id: ChannelId, role: Role) -> Transport {
        Transport::new(
            self.inner.writer.clone(),
            self.inner.local,
            remote,
            id,
            role,
            &self.inner.config,
            self.inner.slot_freed.clone(),
        )
    }

    async fn remove_slot(&self, tp: &Transport) {
        if self.inner.table.write().await.remove(tp) {
            trace!("Freed channel {}", tp.id());
            self.inner.slot_freed.notify_waiters();
        }
    }

    /// Run the reader loop until the stream fails or the connection is closed
    ///
    /// Transports opened by remote clients are pushed to `accept_tx`. Returns
    /// `Ok(())` after [`close`](Self::close); a stream error (EOF included) is
    /// returned after every transport has been marked closed. Can only be
    /// started once.
    pub async fn serve(&self, accept_tx: mpsc::Sender<Transport>) -> ClientResult<()> {
        if self.inner.serving.swap(true, Ordering::SeqCst) {
            return Err(ClientError::AlreadyServing);
        }
        let _stopped = self.inner.stopped.clone().drop_guard();

        let Some(mut reader) = self.inner.reader.lock().await.take() else {
            return Err(ClientError::AlreadyServing);
        };

        debug!("Serving relay {}", self.inner.remote_server.short());
        let result = self.read_loop(&mut reader, &accept_tx).await;

        match &result {
            Ok(()) => debug!("Reader for relay {} stopped", self.inner.remote_server.short()),
            Err(e) => {
                warn!(
                    "Connection to relay {} failed: {}",
                    self.inner.remote_server.short(),
                    e
                );
                self.fail_transports().await;
            }
        }
        result
    }

    async fn read_loop(
        &self,
        reader: &mut FrameReader,
        accept_tx: &mpsc::Sender<Transport>,
    ) -> ClientResult<()> {
        loop {
            let frame = tokio::select! {
                biased;
                _ = self.inner.shutdown.cancelled() => return Ok(()),
                next = reader.next() => match next {
                    Some(Ok(frame)) => frame,
                    Some(Err(e)) => return Err(e.into()),
                    None => return Err(ClientError::RelayDisconnected),
                },
            };

            trace!(
                "Received {} frame on channel {} ({} bytes)",
                frame.frame_type,
                frame.channel_id,
                frame.payload.len()
            );
            self.dispatch(frame, accept_tx).await?;
        }
    }

    async fn dispatch(&self, frame: Frame, accept_tx: &mpsc::Sender<Transport>) -> ClientResult<()> {
        let id = frame.channel_id;
        let owner = self.inner.table.read().await.live(id).cloned();

        if let Some(tp) = owner {
            if !tp.deliver(frame).await {
                self.remove_slot(&tp).await;
            }
            return Ok(());
        }

        match frame.frame_type {
            FrameType::Request => self.handle_request(frame, accept_tx).await,
            FrameType::Close => {
                trace!("Ignoring CLOSE for untracked channel {}", id);
                Ok(())
            }
            other => {
                debug!("{} frame for untracked channel {}, replying CLOSE", other, id);
                self.write_control(Frame::close(id, close_reason::PROTOCOL))
                    .await
            }
        }
    }

    async fn handle_request(
        &self,
        frame: Frame,
        accept_tx: &mpsc::Sender<Transport>,
    ) -> ClientResult<()> {
        let id = frame.channel_id;
        let initiator = match split_public_keys(&frame.payload) {
            Some((initiator, responder))
                if responder == self.inner.local && is_remotely_initiated(id) =>
            {
                initiator
            }
            _ => {
                warn!(
                    "Rejecting invalid REQUEST on channel {} from relay {}",
                    id,
                    self.inner.remote_server.short()
                );
                return self
                    .write_control(Frame::close(id, close_reason::PROTOCOL))
                    .await;
            }
        };

        let tp = self.new_transport(initiator, id, Role::Responder);
        {
            let mut table = self.inner.table.write().await;
            if self.is_closed() {
                return Ok(());
            }
            table.insert(tp.clone());
        }

        // A failed ACCEPT leaves the relay stream in an unknown state
        tp.handshake().await?;

        info!(
            "Accepted transport {} from {} via relay {}",
            id,
            initiator.short(),
            self.inner.remote_server.short()
        );

        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => {
                tp.close().await;
                Ok(())
            }
            sent = accept_tx.send(tp.clone()) => match sent {
                Ok(()) => Ok(()),
                Err(_) => {
                    tp.close().await;
                    Err(ClientError::ClientClosed)
                }
            },
        }
    }

    /// Write a protocol reply; only stream failures are fatal
    async fn write_control(&self, frame: Frame) -> ClientResult<()> {
        let id = frame.channel_id;
        match tokio::time::timeout(self.inner.config.write_timeout, self.inner.writer.write(frame))
            .await
        {
            Ok(written) => written.map_err(Into::into),
            Err(_) => {
                warn!("Timed out writing reply on channel {}", id);
                Ok(())
            }
        }
    }

    /// Mark every transport closed without writing to the failed stream
    async fn fail_transports(&self) {
        let transports = {
            let mut table = self.inner.table.write().await;
            self.inner.closed.store(true, Ordering::SeqCst);
            table.drain()
        };
        for tp in &transports {
            tp.mark_closed();
        }
        self.inner.shutdown.cancel();
        self.inner.slot_freed.notify_waiters();
    }

    /// Close every transport, then the stream, then wait for the reader loop
    ///
    /// Idempotent. Once this returns the reader loop (if it was started) has
    /// exited and every transport that was live reports `is_done()`.
    pub async fn close(&self) {
        let transports = {
            let mut table = self.inner.table.write().await;
            if self.inner.closed.swap(true, Ordering::SeqCst) {
                None
            } else {
                Some(table.drain())
            }
        };

        if let Some(transports) = transports {
            info!(
                "Closing connection to relay {} ({} transports)",
                self.inner.remote_server.short(),
                transports.len()
            );
            join_all(transports.iter().map(|tp| tp.close())).await;

            self.inner.shutdown.cancel();
            self.inner.slot_freed.notify_waiters();

            match tokio::time::timeout(self.inner.config.write_timeout, self.inner.writer.shutdown())
                .await
            {
                Ok(Ok(())) => {}
                Ok(Err(e)) => debug!("Error shutting down relay stream: {}", e),
                Err(_) => debug!("Timed out shutting down relay stream"),
            }
        }

        if self.inner.serving.load(Ordering::SeqCst) {
            self.inner.stopped.cancelled().await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("local", &self.inner.local)
            .field("remote_server", &self.inner.remote_server)
            .field("closed", &self.is_closed())
            .finish()
    }
}
