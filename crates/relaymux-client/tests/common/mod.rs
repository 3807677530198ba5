//! Shared fixtures for relay client integration tests
//!
//! [`MemoryRelay`] plays the relay server: it accepts client links over
//! in-memory duplex streams, assigns odd channel ids on the responder side and
//! forwards frames between the two ends of each channel.

#![allow(dead_code)]

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use relaymux_client::{BoxedRelayStream, Client, ClientConfig, ConnectError, RelayConnector};
use relaymux_discovery::{DiscoveryClient, Entry, MemoryDiscovery};
use relaymux_proto::{
    close_reason, split_public_keys, ChannelId, Frame, FrameCodec, FrameType, Keypair, PublicKey,
};
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;
use tokio_util::sync::CancellationToken;

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Short timeouts so failing tests fail fast
pub fn fast_config() -> ClientConfig {
    ClientConfig::builder()
        .handshake_timeout(Duration::from_secs(2))
        .dial_timeout(Duration::from_secs(2))
        .write_timeout(Duration::from_secs(1))
        .discovery_retry_interval(Duration::from_millis(20))
        .build()
        .unwrap()
}

/// Poll `check` until it returns true, panicking after two seconds
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(2);
    while !check().await {
        if tokio::time::Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

struct Link {
    id: u64,
    tx: mpsc::UnboundedSender<Frame>,
    next_odd: ChannelId,
    cancel: CancellationToken,
}

#[derive(Default)]
struct RelayState {
    links: HashMap<PublicKey, Link>,
    routes: HashMap<(PublicKey, ChannelId), (PublicKey, ChannelId)>,
    /// Frames that arrived for a channel with no route
    unrouted: Vec<(PublicKey, Frame)>,
}

struct RelayInner {
    keypair: Keypair,
    address: String,
    online: AtomicBool,
    next_link: AtomicU64,
    state: Mutex<RelayState>,
}

/// In-memory relay server
#[derive(Clone)]
pub struct MemoryRelay {
    inner: Arc<RelayInner>,
}

impl MemoryRelay {
    pub fn new() -> Self {
        let keypair = Keypair::generate();
        let address = format!("relay-{}.test:8081", keypair.public_key().short());

        Self {
            inner: Arc::new(RelayInner {
                keypair,
                address,
                online: AtomicBool::new(true),
                next_link: AtomicU64::new(0),
                state: Mutex::new(RelayState::default()),
            }),
        }
    }

    pub fn public_key(&self) -> PublicKey {
        self.inner.keypair.public_key()
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    /// Signed server entry advertising this relay
    pub fn server_entry(&self) -> Entry {
        let mut entry = Entry::new_server(self.public_key(), 0, self.address(), 100);
        entry.sign(&self.inner.keypair).unwrap();
        entry
    }

    pub fn is_connected(&self, client: &PublicKey) -> bool {
        self.inner.state.lock().unwrap().links.contains_key(client)
    }

    pub fn connected_clients(&self) -> usize {
        self.inner.state.lock().unwrap().links.len()
    }

    pub fn unrouted(&self) -> Vec<(PublicKey, Frame)> {
        self.inner.state.lock().unwrap().unrouted.clone()
    }

    /// Send a raw frame to a connected client
    pub fn inject(&self, client: &PublicKey, frame: Frame) {
        let state = self.inner.state.lock().unwrap();
        let link = state.links.get(client).expect("client not connected");
        link.tx.send(frame).unwrap();
    }

    /// Drop every client link and refuse new ones
    pub fn shutdown(&self) {
        self.inner.online.store(false, Ordering::SeqCst);
        let state = self.inner.state.lock().unwrap();
        for link in state.links.values() {
            link.cancel.cancel();
        }
    }

    fn attach(&self, client: PublicKey) -> Result<BoxedRelayStream, ConnectError> {
        if !self.inner.online.load(Ordering::SeqCst) {
            return Err(ConnectError::Handshake {
                server: self.public_key(),
                reason: "relay offline".to_string(),
            });
        }

        let (client_end, relay_end) = tokio::io::duplex(256 * 1024);
        let (tx, mut rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        let link_id = self.inner.next_link.fetch_add(1, Ordering::SeqCst);

        {
            let mut state = self.inner.state.lock().unwrap();
            let link = Link {
                id: link_id,
                tx,
                next_odd: 1,
                cancel: cancel.clone(),
            };
            if let Some(old) = state.links.insert(client, link) {
                old.cancel.cancel();
            }
        }

        let relay = self.clone();
        tokio::spawn(async move {
            let (mut sink, mut stream) = Framed::new(relay_end, FrameCodec::new()).split();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    outbound = rx.recv() => match outbound {
                        Some(frame) => {
                            if sink.send(frame).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    },
                    inbound = stream.next() => match inbound {
                        Some(Ok(frame)) => relay.route(client, frame),
                        _ => break,
                    },
                }
            }
            relay.detach(client, link_id);
        });

        Ok(Box::new(client_end))
    }

    fn route(&self, from: PublicKey, frame: Frame) {
        let mut state = self.inner.state.lock().unwrap();
        let id = frame.channel_id;

        match frame.frame_type {
            FrameType::Request => {
                let target = split_public_keys(&frame.payload)
                    .map(|(_, responder)| responder)
                    .filter(|responder| state.links.contains_key(responder));
                let Some(responder) = target else {
                    state.reply(&from, Frame::close(id, close_reason::NORMAL));
                    return;
                };

                let Some(link) = state.links.get_mut(&responder) else {
                    return;
                };
                let odd = link.next_odd;
                link.next_odd = odd.wrapping_add(2);
                let _ = link
                    .tx
                    .send(Frame::new(FrameType::Request, odd, frame.payload));

                state.routes.insert((from, id), (responder, odd));
                state.routes.insert((responder, odd), (from, id));
            }
            FrameType::Close => match state.routes.remove(&(from, id)) {
                Some((peer, peer_id)) => {
                    state.routes.remove(&(peer, peer_id));
                    state.reply(&peer, Frame::close(peer_id, frame.close_reason()));
                }
                None => state.unrouted.push((from, frame)),
            },
            frame_type => match state.routes.get(&(from, id)).copied() {
                Some((peer, peer_id)) => {
                    state.reply(&peer, Frame::new(frame_type, peer_id, frame.payload));
                }
                None => {
                    state.unrouted.push((from, frame));
                    state.reply(&from, Frame::close(id, close_reason::NORMAL));
                }
            },
        }
    }

    fn detach(&self, client: PublicKey, link_id: u64) {
        let mut state = self.inner.state.lock().unwrap();
        if state.links.get(&client).map(|l| l.id) == Some(link_id) {
            state.links.remove(&client);
        }

        let dead: Vec<_> = state
            .routes
            .keys()
            .filter(|(owner, _)| *owner == client)
            .copied()
            .collect();
        for key in dead {
            if let Some((peer, peer_id)) = state.routes.remove(&key) {
                state.routes.remove(&(peer, peer_id));
                state.reply(&peer, Frame::close(peer_id, close_reason::NORMAL));
            }
        }
    }
}

impl RelayState {
    fn reply(&self, to: &PublicKey, frame: Frame) {
        if let Some(link) = self.links.get(to) {
            let _ = link.tx.send(frame);
        }
    }
}

impl std::fmt::Debug for MemoryRelay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryRelay")
            .field("public_key", &self.public_key())
            .field("address", &self.inner.address)
            .finish()
    }
}

/// Connector that attaches clients to registered in-memory relays
#[derive(Debug, Default)]
pub struct MemoryConnector {
    relays: Mutex<HashMap<PublicKey, MemoryRelay>>,
    connects: AtomicUsize,
}

impl MemoryConnector {
    pub fn register(&self, relay: MemoryRelay) {
        self.relays
            .lock()
            .unwrap()
            .insert(relay.public_key(), relay);
    }

    /// Connection attempts so far, successful or not
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelayConnector for MemoryConnector {
    async fn connect(
        &self,
        local: &Keypair,
        server: PublicKey,
        addr: &str,
    ) -> Result<BoxedRelayStream, ConnectError> {
        self.connects.fetch_add(1, Ordering::SeqCst);

        let relay = self.relays.lock().unwrap().get(&server).cloned();
        match relay {
            Some(relay) if relay.address() == addr => relay.attach(local.public_key()),
            _ => Err(ConnectError::Io(std::io::Error::new(
                std::io::ErrorKind::ConnectionRefused,
                format!("nothing listening at {}", addr),
            ))),
        }
    }
}

/// Discovery, connector and relays shared by the clients of one test
#[derive(Clone)]
pub struct TestNet {
    pub discovery: Arc<MemoryDiscovery>,
    pub connector: Arc<MemoryConnector>,
}

impl TestNet {
    pub fn new() -> Self {
        init_tracing();
        Self {
            discovery: Arc::new(MemoryDiscovery::new()),
            connector: Arc::new(MemoryConnector::default()),
        }
    }

    /// Start a relay and advertise it in discovery
    pub async fn add_relay(&self) -> MemoryRelay {
        let relay = MemoryRelay::new();
        self.discovery
            .create_entry(&relay.server_entry())
            .await
            .unwrap();
        self.connector.register(relay.clone());
        relay
    }

    pub fn client(&self) -> Client {
        self.client_with(Keypair::generate(), fast_config())
    }

    pub fn client_with(&self, keypair: Keypair, config: ClientConfig) -> Client {
        Client::new(
            keypair,
            self.discovery.clone(),
            self.connector.clone(),
            config,
        )
        .unwrap()
    }

    /// Publish a client entry without connecting anything
    pub async fn publish_client(&self, keypair: &Keypair, servers: Vec<PublicKey>) {
        let mut entry = Entry::new_client(keypair.public_key(), 0, servers);
        entry.sign(keypair).unwrap();
        self.discovery.create_entry(&entry).await.unwrap();
    }

    pub async fn delegated_servers_of(&self, pk: &PublicKey) -> Vec<PublicKey> {
        self.discovery
            .entry(pk)
            .await
            .map(|entry| entry.delegated_servers().to_vec())
            .unwrap_or_default()
    }
}
