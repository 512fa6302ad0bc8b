//! Cluster: a named, partitioned group of peers behind one identity.

use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use glink_core::{
    codec, protected_commands, AcceptCmd, Certificate, Command, Identity, MetricsCmd, Packet,
    PeerKey, ProtectedCommand, PublicKey, QuantumPool, SignedMessage, StartCmd, StopCmd, Version,
};
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::{debug, info};

use crate::dispatch::{protect, HandlerTable};
use crate::error::{RdpError, Result};
use crate::peer::{Peer, PeerRegistry, PeerSelector};

/// A packet queued for the server's single writer.
#[derive(Debug)]
pub struct Outbound {
    pub addr: SocketAddr,
    pub packet: Packet,
}

pub struct Cluster {
    index: u16,
    name: String,
    identity: Identity,
    peers: Mutex<PeerRegistry>,
    handlers: HandlerTable<Peer>,
    quanta: Mutex<QuantumPool>,
    outbox: mpsc::Sender<Outbound>,
}

impl Cluster {
    pub(crate) fn new(
        index: u16,
        name: impl Into<String>,
        partitions: u32,
        identity: Identity,
        outbox: mpsc::Sender<Outbound>,
    ) -> Result<Self> {
        let cluster = Self {
            index,
            name: name.into(),
            identity,
            peers: Mutex::new(PeerRegistry::default()),
            handlers: HandlerTable::new(protected_commands()),
            quanta: Mutex::new(QuantumPool::new(partitions)),
            outbox,
        };
        cluster.handlers.register(handle_metrics)?;
        Ok(cluster)
    }

    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Certificate clients name when they connect.
    pub fn certificate(&self) -> Certificate {
        self.identity.certificate()
    }

    pub fn public_key(&self) -> PublicKey {
        self.identity.public()
    }

    /// Handle a command from peers of this cluster. One handler per command type.
    pub fn on_command<C, F>(&self, handler: F) -> Result<()>
    where
        C: Command,
        F: Fn(&Peer, C) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.register(handler)
    }

    /// Process the body of an upstream packet routed to this cluster.
    pub fn handle_inbound(&self, from: SocketAddr, body: &[u8]) -> Result<()> {
        let peer = self
            .lock_peers()
            .get(&PeerSelector::Address(from))
            .ok_or_else(|| RdpError::UnknownPeer(from.to_string()))?;
        peer.touch();
        let message: ProtectedCommand = codec::decode(body)?;
        self.handlers.dispatch(&peer, &message, peer.session())
    }

    /// Register a verified client and send it the signed accept.
    pub async fn register_peer(
        &self,
        key: PeerKey,
        addr: SocketAddr,
        version: Version,
    ) -> Result<Arc<Peer>> {
        let session = self.identity.session(&key.public());
        let peer = Arc::new(Peer::new(key, addr, version, session));
        let evicted = self.lock_peers().insert(peer.clone());
        for old in &evicted {
            debug!(cluster = %self.name, peer = %old.certificate(), addr = %old.addr(), "evicted stale peer");
        }
        info!(cluster = %self.name, peer = %peer.certificate(), %addr, %version, "peer added");

        let accept = AcceptCmd {
            key: self.identity.public(),
            cluster_index: self.index,
        };
        let signed = SignedMessage::sign(&self.identity, &accept)?;
        let packet = Packet::bare(&codec::encode(&signed)?)?;
        self.enqueue(addr, packet).await?;
        peer.mark_accepted();
        Ok(peer)
    }

    /// Ask a peer to start work. `config` travels as JSON.
    pub async fn send_start<T: Serialize + ?Sized>(
        &self,
        peer: impl Into<PeerSelector>,
        config: &T,
    ) -> Result<()> {
        let config = serde_json::to_vec(config)?;
        self.send(peer, &StartCmd { config, start: true }).await
    }

    pub async fn send_stop(&self, peer: impl Into<PeerSelector>) -> Result<()> {
        self.send(peer, &StopCmd { stop: true }).await
    }

    /// Encrypt any registered command for one peer and queue it.
    pub async fn send<C: Command>(&self, peer: impl Into<PeerSelector>, command: &C) -> Result<()> {
        let selector = peer.into();
        let peer = self
            .peer(selector)
            .ok_or_else(|| RdpError::UnknownPeer(selector.to_string()))?;
        let protected = protect(protected_commands(), peer.session(), command)?;
        let packet = Packet::bare(&codec::encode(&protected)?)?;
        debug!(cluster = %self.name, peer = %peer.certificate(), command = C::NAME, "send command");
        self.enqueue(peer.addr(), packet).await
    }

    pub fn peer(&self, selector: impl Into<PeerSelector>) -> Option<Arc<Peer>> {
        self.lock_peers().get(&selector.into())
    }

    /// Drop a peer from both indexes. Its packets are rejected afterwards.
    pub fn disable(&self, peer: impl Into<PeerSelector>) -> Result<Arc<Peer>> {
        let selector = peer.into();
        let removed = self
            .lock_peers()
            .remove(&selector)
            .ok_or_else(|| RdpError::UnknownPeer(selector.to_string()))?;
        info!(cluster = %self.name, peer = %removed.certificate(), "peer disabled");
        Ok(removed)
    }

    pub fn peers(&self) -> Vec<Arc<Peer>> {
        self.lock_peers().snapshot()
    }

    pub fn set_partitions(&self, partitions: u32) {
        let released = self
            .quanta
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .resize(partitions);
        debug!(cluster = %self.name, partitions, released = released.len(), "partitions resized");
    }

    pub fn partitions(&self) -> u32 {
        self.quanta.lock().unwrap_or_else(PoisonError::into_inner).size()
    }

    async fn enqueue(&self, addr: SocketAddr, packet: Packet) -> Result<()> {
        self.outbox
            .send(Outbound { addr, packet })
            .await
            .map_err(|_| RdpError::OutboxClosed)
    }

    fn lock_peers(&self) -> MutexGuard<'_, PeerRegistry> {
        self.peers.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

fn handle_metrics(peer: &Peer, metrics: MetricsCmd) -> anyhow::Result<()> {
    debug!(
        peer = %peer.certificate(),
        cpu = metrics.cpu_percent(),
        mem_used = metrics.mem_used,
        mem_total = metrics.mem_total,
        "metrics"
    );
    peer.update_metrics(metrics);
    Ok(())
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("certificate", &self.certificate())
            .finish()
    }
}
