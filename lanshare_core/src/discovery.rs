//! LAN presence: a periodic UDP beacon and a listener that keeps a table of
//! the peers it has heard from.
//!
//! Beacon payload is the JSON object `{"name": <display name>}`. A peer's
//! address always comes from the datagram's source, never from the payload.

use crate::PresenceMsg;
use crate::transfer::protocol::encode_json;
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Well-known UDP port for beacons
pub const DISCOVERY_PORT: u16 = 9998;

/// Seconds between two beacons
pub const BEACON_INTERVAL_SECS: u64 = 3;

const MAX_DATAGRAM_SIZE: usize = 2048;
const RECV_ERROR_BACKOFF: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerRecord {
    pub address: IpAddr,
    pub display_name: String,
}

/// Peers heard so far, keyed by address. Entries never expire.
///
/// Cloning shares the same table, so the application can query it from any
/// thread while the listener task updates it.
#[derive(Debug, Clone, Default)]
pub struct PeerTable {
    inner: Arc<RwLock<HashMap<IpAddr, String>>>,
}

impl PeerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a sighting. Returns true when the address is new or its name changed.
    pub fn observe(&self, address: IpAddr, name: &str) -> bool {
        let mut peers = self.inner.write().unwrap_or_else(|e| e.into_inner());
        match peers.get(&address) {
            Some(known) if known == name => false,
            _ => {
                peers.insert(address, name.to_string());
                true
            }
        }
    }

    pub fn get(&self, address: &IpAddr) -> Option<String> {
        let peers = self.inner.read().unwrap_or_else(|e| e.into_inner());
        peers.get(address).cloned()
    }

    /// All known peers, ordered by address
    pub fn snapshot(&self) -> Vec<PeerRecord> {
        let peers = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut records: Vec<PeerRecord> = peers
            .iter()
            .map(|(address, name)| PeerRecord {
                address: *address,
                display_name: name.clone(),
            })
            .collect();
        records.sort_by_key(|r| r.address);
        records
    }

    pub fn len(&self) -> usize {
        self.inner.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Encode this device's beacon payload
pub fn encode_presence(name: &str) -> io::Result<Vec<u8>> {
    let msg = PresenceMsg {
        name: name.to_string(),
    };
    encode_json(&msg).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
}

/// Decode a beacon payload. Anything that isn't a JSON object with a string
/// `name` yields `None`.
pub fn decode_presence(data: &[u8]) -> Option<PresenceMsg> {
    serde_json::from_slice(data).ok()
}

/// Periodic beacon task. Dropping the handle does not stop it; call [`Beacon::stop`].
pub struct Beacon {
    task: JoinHandle<()>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
}

impl Beacon {
    /// Bind an ephemeral socket with broadcast enabled and send `name` to
    /// `target` now and then every `interval`.
    pub async fn start(
        name: &str,
        target: SocketAddr,
        interval: Duration,
        cancel: CancellationToken,
    ) -> io::Result<Self> {
        if interval.is_zero() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "beacon interval must be non-zero",
            ));
        }
        let bind_addr = match target {
            SocketAddr::V4(_) => SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0)),
            SocketAddr::V6(_) => SocketAddr::from((Ipv6Addr::UNSPECIFIED, 0)),
        };
        let socket = UdpSocket::bind(bind_addr).await?;
        socket.set_broadcast(true)?;
        let local_addr = socket.local_addr()?;

        let packet = encode_presence(name)?;
        info!("Broadcasting presence as {:?} to {} every {:?}", name, target, interval);

        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = ticker.tick() => {
                        if let Err(e) = socket.send_to(&packet, target).await {
                            warn!("Beacon send to {} failed: {}", target, e);
                        }
                    }
                }
            }
            debug!("Beacon stopped");
        });

        Ok(Self {
            task,
            cancel,
            local_addr,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Stop and wait for the task to exit
    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Broadcast `name` on the local subnet at `port` every three seconds
pub async fn start_broadcasting(name: &str, port: u16) -> io::Result<Beacon> {
    Beacon::start(
        name,
        SocketAddr::from((Ipv4Addr::BROADCAST, port)),
        Duration::from_secs(BEACON_INTERVAL_SECS),
        CancellationToken::new(),
    )
    .await
}

/// Listener task that feeds a [`PeerTable`] and reports new sightings.
pub struct DiscoveryListener {
    task: JoinHandle<()>,
    cancel: CancellationToken,
    local_addr: SocketAddr,
    peers: PeerTable,
}

impl DiscoveryListener {
    /// Bind `addr`, then spawn the receive loop. `on_peer_found` runs on the
    /// listener task for every new (address, name) pair.
    pub async fn bind<F>(
        addr: SocketAddr,
        peers: PeerTable,
        on_peer_found: F,
        cancel: CancellationToken,
    ) -> io::Result<Self>
    where
        F: Fn(IpAddr, &str) + Send + Sync + 'static,
    {
        let socket = UdpSocket::bind(addr).await?;
        let local_addr = socket.local_addr()?;
        info!("Listening for peers on {}", local_addr);

        let task_peers = peers.clone();
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut buf = [0u8; MAX_DATAGRAM_SIZE];
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    res = socket.recv_from(&mut buf) => match res {
                        Ok((len, from)) => {
                            handle_datagram(&buf[..len], from, &task_peers, &on_peer_found);
                        }
                        Err(e) => {
                            warn!("Discovery receive error: {}", e);
                            tokio::time::sleep(RECV_ERROR_BACKOFF).await;
                        }
                    }
                }
            }
            debug!("Discovery listener stopped");
        });

        Ok(Self {
            task,
            cancel,
            local_addr,
            peers,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peers(&self) -> &PeerTable {
        &self.peers
    }

    pub fn stop(&self) {
        self.cancel.cancel();
    }

    pub async fn shutdown(self) {
        self.cancel.cancel();
        let _ = self.task.await;
    }
}

/// Listen on all interfaces at `port` with a fresh peer table
pub async fn listen_for_peers<F>(port: u16, on_peer_found: F) -> io::Result<DiscoveryListener>
where
    F: Fn(IpAddr, &str) + Send + Sync + 'static,
{
    DiscoveryListener::bind(
        SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)),
        PeerTable::new(),
        on_peer_found,
        CancellationToken::new(),
    )
    .await
}

fn handle_datagram<F>(data: &[u8], from: SocketAddr, peers: &PeerTable, on_peer_found: &F)
where
    F: Fn(IpAddr, &str),
{
    let Some(msg) = decode_presence(data) else {
        debug!("Dropped {} byte non-beacon datagram from {}", data.len(), from);
        return;
    };

    let address = from.ip();
    if !peers.observe(address, &msg.name) {
        return;
    }

    info!("Peer found: {} ({})", msg.name, address);
    if catch_unwind(AssertUnwindSafe(|| on_peer_found(address, &msg.name))).is_err() {
        warn!("Peer callback panicked for {}", address);
    }
}
