//! Server: one UDP socket in front of many clusters.
//!
//! Three activities share the socket: the reader demultiplexes on the routing
//! prefix, the connection pipeline verifies handshakes, and a single writer
//! drains the outbox every cluster sends into.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use glink_core::wire::{Route, PACKET_SIZE, RESERVED_CLUSTER_INDEX};
use glink_core::{codec, Certificate, ConnectCmd, Identity, Packet, SignedMessage};
use tokio::net::{ToSocketAddrs, UdpSocket};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::cluster::{Cluster, Outbound};
use crate::error::{RdpError, Result};
use crate::peer::Peer;

/// Server tuning.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Capacity of the outbox and the connection pipeline.
    pub queue_capacity: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self { queue_capacity: 100 }
    }
}

pub struct Server {
    name: String,
    config: ServerConfig,
    clusters: RwLock<HashMap<u16, Arc<Cluster>>>,
    outbox: mpsc::Sender<Outbound>,
    outbox_rx: Mutex<Option<mpsc::Receiver<Outbound>>>,
}

impl Server {
    pub fn new(name: impl Into<String>, config: ServerConfig) -> Arc<Self> {
        let (outbox, outbox_rx) = mpsc::channel(config.queue_capacity.max(1));
        Arc::new(Self {
            name: name.into(),
            config,
            clusters: RwLock::new(HashMap::new()),
            outbox,
            outbox_rx: Mutex::new(Some(outbox_rx)),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Create a cluster with a fresh identity.
    pub fn add_cluster(&self, index: u16, name: &str, partitions: u32) -> Result<Arc<Cluster>> {
        self.add_cluster_with_identity(index, name, partitions, Identity::generate())
    }

    /// Create a cluster with a known identity, so its certificate survives restarts.
    pub fn add_cluster_with_identity(
        &self,
        index: u16,
        name: &str,
        partitions: u32,
        identity: Identity,
    ) -> Result<Arc<Cluster>> {
        if index == RESERVED_CLUSTER_INDEX {
            return Err(RdpError::ReservedClusterIndex(index));
        }
        let mut clusters = self.clusters.write().unwrap_or_else(PoisonError::into_inner);
        if clusters.contains_key(&index) {
            return Err(RdpError::DuplicateCluster(index));
        }
        let cluster = Arc::new(Cluster::new(
            index,
            name,
            partitions,
            identity,
            self.outbox.clone(),
        )?);
        clusters.insert(index, cluster.clone());
        info!(server = %self.name, cluster = name, index, certificate = %cluster.certificate(), "cluster created");
        Ok(cluster)
    }

    pub fn cluster(&self, index: u16) -> Option<Arc<Cluster>> {
        self.clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&index)
            .cloned()
    }

    pub fn cluster_by_certificate(&self, certificate: &Certificate) -> Option<Arc<Cluster>> {
        self.clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .find(|c| c.certificate() == *certificate)
            .cloned()
    }

    pub fn clusters(&self) -> Vec<Arc<Cluster>> {
        let mut all: Vec<_> = self
            .clusters
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        all.sort_by_key(|c| c.index());
        all
    }

    /// Bind the socket. The server can be bound once.
    pub async fn bind(self: &Arc<Self>, addr: impl ToSocketAddrs) -> Result<Listener> {
        let outbox = self
            .outbox_rx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(RdpError::AlreadyListening)?;
        let socket = match UdpSocket::bind(addr).await {
            Ok(s) => s,
            Err(e) => {
                *self.outbox_rx.lock().unwrap_or_else(PoisonError::into_inner) = Some(outbox);
                return Err(e.into());
            }
        };
        Ok(Listener {
            server: self.clone(),
            socket: Arc::new(socket),
            outbox,
        })
    }

    /// Bind on all interfaces and serve until `cancel` fires.
    pub async fn listen(self: &Arc<Self>, port: u16, cancel: CancellationToken) -> Result<()> {
        let listener = self.bind(("0.0.0.0", port)).await?;
        info!(server = %self.name, addr = %listener.local_addr()?, "listening");
        listener.run(cancel).await
    }

    async fn accept_connection(&self, addr: SocketAddr, body: &[u8]) -> Result<Arc<Peer>> {
        let message: SignedMessage = codec::decode(body)?;
        let connect: ConnectCmd = codec::decode(&message.data)?;
        let cluster = self
            .cluster_by_certificate(&connect.cluster)
            .ok_or(RdpError::UnknownCluster(connect.cluster))?;
        if !message.verify(&connect.peer.certificate()) {
            return Err(RdpError::InvalidSignature(format!(
                "{} ({addr})",
                connect.peer.certificate()
            )));
        }
        cluster.register_peer(connect.peer, addr, connect.version).await
    }
}

struct Inbound {
    addr: SocketAddr,
    packet: Packet,
}

/// A bound server socket, ready to run.
pub struct Listener {
    server: Arc<Server>,
    socket: Arc<UdpSocket>,
    outbox: mpsc::Receiver<Outbound>,
}

impl Listener {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    /// Serve until `cancel` fires or the socket fails.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let Listener {
            server,
            socket,
            outbox,
        } = self;
        let (conn_tx, conn_rx) = mpsc::channel(server.config.queue_capacity.max(1));
        let writer_cancel = cancel.child_token();

        let pipeline = tokio::spawn(run_connection_pipe(server.clone(), conn_rx));
        let writer = tokio::spawn(run_outbox(socket.clone(), outbox, writer_cancel.clone()));

        let result = run_reader(&server, &socket, conn_tx, &cancel).await;
        writer_cancel.cancel();
        if let Err(e) = pipeline.await {
            error!(error = %e, "connection pipeline panicked");
        }
        if let Err(e) = writer.await {
            error!(error = %e, "writer panicked");
        }
        info!(server = %server.name, "listener stopped");
        result
    }
}

async fn run_reader(
    server: &Server,
    socket: &UdpSocket,
    conn_tx: mpsc::Sender<Inbound>,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut buf = [0u8; PACKET_SIZE];
    loop {
        let received = tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            r = socket.recv_from(&mut buf) => r,
        };
        let (n, from) = match received {
            Ok(r) => r,
            Err(e) if is_fatal(&e) => return Err(e.into()),
            Err(e) => {
                warn!(error = %e, "cannot read datagram");
                continue;
            }
        };
        let packet = match Packet::from_datagram(&buf[..n]) {
            Ok(p) => p,
            Err(e) => {
                warn!(%from, error = %e, "invalid datagram");
                continue;
            }
        };
        match packet.route() {
            Route::Connect => {
                debug!(%from, "connection message");
                if conn_tx.send(Inbound { addr: from, packet }).await.is_err() {
                    return Ok(());
                }
            }
            Route::Cluster(index) => match server.cluster(index) {
                Some(cluster) => {
                    if let Err(e) = cluster.handle_inbound(from, packet.body()) {
                        warn!(cluster = cluster.name(), %from, error = %e, "cannot handle cluster message");
                    }
                }
                None => warn!(cluster = index, %from, "cluster not found"),
            },
        }
    }
}

/// Errors after which the socket cannot deliver anything more. The rest concern
/// a single datagram.
fn is_fatal(e: &std::io::Error) -> bool {
    use std::io::ErrorKind;
    !matches!(
        e.kind(),
        ErrorKind::ConnectionReset
            | ErrorKind::ConnectionRefused
            | ErrorKind::ConnectionAborted
            | ErrorKind::Interrupted
            | ErrorKind::WouldBlock
            | ErrorKind::TimedOut
            | ErrorKind::OutOfMemory
    )
}

async fn run_connection_pipe(server: Arc<Server>, mut rx: mpsc::Receiver<Inbound>) {
    while let Some(Inbound { addr, packet }) = rx.recv().await {
        match server.accept_connection(addr, packet.body()).await {
            Ok(peer) => debug!(%addr, peer = %peer.certificate(), "handshake accepted"),
            Err(e) => warn!(%addr, error = %e, "handshake rejected"),
        }
    }
}

async fn run_outbox(
    socket: Arc<UdpSocket>,
    mut outbox: mpsc::Receiver<Outbound>,
    cancel: CancellationToken,
) {
    loop {
        let out = tokio::select! {
            _ = cancel.cancelled() => return,
            out = outbox.recv() => match out {
                Some(out) => out,
                None => return,
            },
        };
        if let Err(e) = socket.send_to(out.packet.as_bytes(), out.addr).await {
            warn!(addr = %out.addr, error = %e, "cannot send to peer");
        }
    }
}
