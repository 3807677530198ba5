//! Relay client: connection pool and discovery sync
//!
//! A [`Client`] keeps at most one [`Connection`] per relay server, opens new
//! ones on demand when dialing a peer, and keeps this node's discovery entry
//! listing the relays it is reachable through.

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::connector::{ConnectError, RelayConnector};
use crate::transport::Transport;
use crate::{ClientError, ClientResult};
use futures::future::join_all;
use relaymux_discovery::{DiscoveryClient, Entry};
use relaymux_proto::{Keypair, PublicKey};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Name reported by [`Client::type_name`]
pub const TYPE_NAME: &str = "relaymux";

/// Outcome of adding a freshly opened connection to the pool
enum PoolSlot {
    Inserted,
    /// Another dial won the race
    Taken(Connection),
    Closed,
}

struct ClientInner {
    keypair: Keypair,
    local: PublicKey,
    discovery: Arc<dyn DiscoveryClient>,
    connector: Arc<dyn RelayConnector>,
    config: Arc<ClientConfig>,
    conns: RwLock<HashMap<PublicKey, Connection>>,
    accept_tx: mpsc::Sender<Transport>,
    accept_rx: Mutex<mpsc::Receiver<Transport>>,
    /// Serializes read-modify-write of our discovery entry
    publish_lock: Mutex<()>,
    closed: AtomicBool,
    shutdown: CancellationToken,
}

/// Client side of the relay transport
///
/// Cheap to clone; all clones share the same pool.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl Client {
    pub fn new(
        keypair: Keypair,
        discovery: Arc<dyn DiscoveryClient>,
        connector: Arc<dyn RelayConnector>,
        config: ClientConfig,
    ) -> ClientResult<Self> {
        config.validate()?;
        let (accept_tx, accept_rx) = mpsc::channel(config.accept_queue);
        let local = keypair.public_key();

        Ok(Self {
            inner: Arc::new(ClientInner {
                keypair,
                local,
                discovery,
                connector,
                config: Arc::new(config),
                conns: RwLock::new(HashMap::new()),
                accept_tx,
                accept_rx: Mutex::new(accept_rx),
                publish_lock: Mutex::new(()),
                closed: AtomicBool::new(false),
                shutdown: CancellationToken::new(),
            }),
        })
    }

    pub fn local(&self) -> PublicKey {
        self.inner.local
    }

    pub fn type_name(&self) -> &'static str {
        TYPE_NAME
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    pub async fn connection_count(&self) -> usize {
        self.inner.conns.read().await.len()
    }

    /// Relays with an open connection, in key order
    pub async fn delegated_servers(&self) -> Vec<PublicKey> {
        let mut servers: Vec<PublicKey> = self
            .inner
            .conns
            .read()
            .await
            .iter()
            .filter(|(_, conn)| !conn.is_closed())
            .map(|(server, _)| *server)
            .collect();
        servers.sort();
        servers
    }

    fn ensure_open(&self) -> ClientResult<()> {
        if self.is_closed() {
            Err(ClientError::ClientClosed)
        } else {
            Ok(())
        }
    }

    /// Open a transport to `remote` through one of the relays it delegates
    pub async fn dial(&self, remote: PublicKey) -> ClientResult<Transport> {
        self.ensure_open()?;

        let entry = match self.inner.discovery.entry(&remote).await {
            Ok(entry) => entry,
            Err(e) if e.is_not_found() => {
                debug!("No discovery entry for {}", remote.short());
                return Err(ClientError::NoRelayAvailable);
            }
            Err(e) => return Err(e.into()),
        };

        let servers = entry.delegated_servers();
        if servers.is_empty() {
            debug!("{} delegates no relay servers", remote.short());
            return Err(ClientError::NoRelayAvailable);
        }

        let conn = self.find_or_open_connection(servers).await?;
        conn.dial_transport(remote).await
    }

    /// Prefer an open connection to any candidate, in order; otherwise connect
    /// to the first candidate that accepts
    async fn find_or_open_connection(&self, servers: &[PublicKey]) -> ClientResult<Connection> {
        {
            let conns = self.inner.conns.read().await;
            for server in servers {
                if let Some(conn) = conns.get(server).filter(|c| !c.is_closed()) {
                    return Ok(conn.clone());
                }
            }
        }

        for server in servers {
            match self.open_connection(*server).await {
                Ok(conn) => {
                    if let Err(e) = self.publish_relay_set().await {
                        error!("Failed to publish relay set: {}", e);
                    }
                    return Ok(conn);
                }
                Err(ClientError::ClientClosed) => return Err(ClientError::ClientClosed),
                Err(e) => warn!("Failed to connect to relay {}: {}", server.short(), e),
            }
        }

        Err(ClientError::NoRelayAvailable)
    }

    /// Resolve the relay's address through discovery and connect to it
    async fn open_connection(&self, server: PublicKey) -> ClientResult<Connection> {
        let entry = self.inner.discovery.entry(&server).await?;
        let addr = entry
            .server_address()
            .ok_or(ConnectError::NoAddress(server))?;
        self.open_connection_at(server, addr).await
    }

    async fn open_connection_at(&self, server: PublicKey, addr: &str) -> ClientResult<Connection> {
        debug!("Connecting to relay {} at {}", server.short(), addr);

        let stream = match tokio::time::timeout(
            self.inner.config.dial_timeout,
            self.inner.connector.connect(&self.inner.keypair, server, addr),
        )
        .await
        {
            Ok(stream) => stream?,
            Err(_) => return Err(ConnectError::Timeout.into()),
        };

        let conn = Connection::new(stream, self.inner.local, server, self.inner.config.clone());

        let slot = {
            let mut conns = self.inner.conns.write().await;
            if self.inner.shutdown.is_cancelled() {
                PoolSlot::Closed
            } else {
                let existing = conns.get(&server).filter(|c| !c.is_closed()).cloned();
                match existing {
                    Some(existing) => PoolSlot::Taken(existing),
                    None => {
                        conns.insert(server, conn.clone());
                        PoolSlot::Inserted
                    }
                }
            }
        };

        match slot {
            PoolSlot::Closed => {
                conn.close().await;
                Err(ClientError::ClientClosed)
            }
            PoolSlot::Taken(existing) => {
                debug!("Already connected to relay {}, dropping new link", server.short());
                conn.close().await;
                Ok(existing)
            }
            PoolSlot::Inserted => {
                self.spawn_serve(conn.clone());
                info!("Connected to relay {} at {}", server.short(), addr);
                Ok(conn)
            }
        }
    }

    fn spawn_serve(&self, conn: Connection) {
        let client: Weak<ClientInner> = Arc::downgrade(&self.inner);
        let accept_tx = self.inner.accept_tx.clone();
        let shutdown = self.inner.shutdown.clone();

        tokio::spawn(async move {
            let result = {
                let serve = conn.serve(accept_tx);
                tokio::pin!(serve);

                tokio::select! {
                    result = &mut serve => result,
                    // Client closed or dropped; the reader must keep running
                    // until the connection's close waits it out
                    _ = shutdown.cancelled() => {
                        let ((), result) = tokio::join!(conn.close(), &mut serve);
                        result
                    }
                }
            };

            if let Some(inner) = client.upgrade() {
                Client { inner }.connection_lost(conn, result).await;
            }
        });
    }

    /// Drop a connection whose reader loop ended, then republish
    async fn connection_lost(&self, conn: Connection, result: ClientResult<()>) {
        let server = conn.remote_server();
        match result {
            Ok(()) => debug!("Reader for relay {} exited", server.short()),
            Err(e) => warn!("Lost relay {}: {}", server.short(), e),
        }

        if self.inner.shutdown.is_cancelled() {
            return;
        }

        conn.close().await;

        let removed = {
            let mut conns = self.inner.conns.write().await;
            let current = conns.get(&server).is_some_and(|c| c.ptr_eq(&conn));
            if current {
                conns.remove(&server);
            }
            current
        };

        if removed {
            info!("Removed relay {} from pool", server.short());
            if let Err(e) = self.publish_relay_set().await {
                error!("Failed to publish relay set: {}", e);
            }
        }
    }

    /// Connect to up to `n` relay servers listed by discovery
    ///
    /// Polls discovery every `discovery_retry_interval` until it lists at
    /// least one server. Individual connection failures are tolerated; the
    /// call fails only if the pool ends up empty. Callers bound the wait with
    /// `tokio::time::timeout`; the poll also ends when the client is closed.
    pub async fn initiate_servers(&self, n: usize) -> ClientResult<()> {
        if n == 0 {
            return Ok(());
        }
        self.ensure_open()?;

        let servers = loop {
            match self.inner.discovery.available_servers().await {
                Ok(servers) if !servers.is_empty() => break servers,
                Ok(_) => debug!("No relay servers available yet"),
                Err(e) => warn!("Failed to list relay servers: {}", e),
            }

            tokio::select! {
                _ = self.inner.shutdown.cancelled() => return Err(ClientError::ClientClosed),
                _ = tokio::time::sleep(self.inner.config.discovery_retry_interval) => {}
            }
        };

        for entry in servers {
            if self.connection_count().await >= n {
                break;
            }
            let server = entry.static_pk;
            if self.inner.conns.read().await.contains_key(&server) {
                continue;
            }
            let Some(addr) = entry.server_address() else {
                warn!("Relay {} lists no address, skipping", server.short());
                continue;
            };

            match self.open_connection_at(server, addr).await {
                Ok(_) => {}
                Err(ClientError::ClientClosed) => return Err(ClientError::ClientClosed),
                Err(e) => warn!("Failed to connect to relay {}: {}", server.short(), e),
            }
        }

        if self.connection_count().await == 0 {
            return Err(ClientError::AllRelaysFailed);
        }

        self.publish_relay_set().await
    }

    /// Write the current relay set to this client's discovery entry
    ///
    /// Creates the entry on first publish, otherwise updates it with the next
    /// sequence number. Both are signed with the client's key.
    pub async fn publish_relay_set(&self) -> ClientResult<()> {
        let _guard = self.inner.publish_lock.lock().await;
        let servers = self.delegated_servers().await;
        let count = servers.len();

        match self.inner.discovery.entry(&self.inner.local).await {
            Ok(mut entry) => {
                entry.set_delegated_servers(servers);
                entry.advance();
                entry.sign(&self.inner.keypair)?;
                self.inner.discovery.update_entry(&entry).await?;
                debug!(
                    "Updated discovery entry (sequence {}, {} relays)",
                    entry.sequence, count
                );
            }
            Err(e) if e.is_not_found() => {
                let mut entry = Entry::new_client(self.inner.local, 0, servers);
                entry.sign(&self.inner.keypair)?;
                self.inner.discovery.create_entry(&entry).await?;
                debug!("Created discovery entry ({} relays)", count);
            }
            Err(e) => return Err(e.into()),
        }
        Ok(())
    }

    /// Wait for a transport opened by a remote client
    pub async fn accept(&self) -> ClientResult<Transport> {
        self.ensure_open()?;
        let mut rx = self.inner.accept_rx.lock().await;

        tokio::select! {
            biased;
            _ = self.inner.shutdown.cancelled() => Err(ClientError::ClientClosed),
            tp = rx.recv() => tp.ok_or(ClientError::ClientClosed),
        }
    }

    /// Close every relay connection and the accept queue
    ///
    /// Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.shutdown.cancel();

        let conns: Vec<Connection> = self
            .inner
            .conns
            .write()
            .await
            .drain()
            .map(|(_, conn)| conn)
            .collect();
        info!("Closing client {} ({} relays)", self.inner.local.short(), conns.len());

        join_all(conns.iter().map(|conn| conn.close())).await;

        let mut rx = self.inner.accept_rx.lock().await;
        rx.close();
        while let Ok(tp) = rx.try_recv() {
            tp.close().await;
        }
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        // Last handle gone without close(): stop the serve tasks
        self.shutdown.cancel();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("local", &self.inner.local)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
