//! Server-side view of a connected client.

use std::collections::HashMap;
use std::fmt;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;

use glink_core::{Certificate, MetricsCmd, PeerKey, PublicKey, SessionKey, Version};

/// Mutable part of a peer.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    pub accepted: bool,
    pub metrics: Option<MetricsCmd>,
    pub last_seen: Instant,
}

/// A client registered with a cluster.
pub struct Peer {
    key: PeerKey,
    addr: SocketAddr,
    version: Version,
    session: SessionKey,
    status: Mutex<PeerStatus>,
}

impl Peer {
    pub fn new(key: PeerKey, addr: SocketAddr, version: Version, session: SessionKey) -> Self {
        Self {
            key,
            addr,
            version,
            session,
            status: Mutex::new(PeerStatus {
                accepted: false,
                metrics: None,
                last_seen: Instant::now(),
            }),
        }
    }

    pub fn certificate(&self) -> Certificate {
        self.key.certificate()
    }

    pub fn public_key(&self) -> PublicKey {
        self.key.public()
    }

    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub(crate) fn session(&self) -> &SessionKey {
        &self.session
    }

    pub fn status(&self) -> PeerStatus {
        self.lock().clone()
    }

    pub fn is_accepted(&self) -> bool {
        self.lock().accepted
    }

    /// Last health sample reported by the client.
    pub fn metrics(&self) -> Option<MetricsCmd> {
        self.lock().metrics.clone()
    }

    pub(crate) fn mark_accepted(&self) {
        self.lock().accepted = true;
    }

    pub(crate) fn touch(&self) {
        self.lock().last_seen = Instant::now();
    }

    pub(crate) fn update_metrics(&self, metrics: MetricsCmd) {
        self.lock().metrics = Some(metrics);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, PeerStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Peer")
            .field("certificate", &self.certificate())
            .field("addr", &self.addr)
            .field("version", &self.version)
            .finish()
    }
}

/// How a caller names a peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerSelector {
    Certificate(Certificate),
    Address(SocketAddr),
}

impl From<Certificate> for PeerSelector {
    fn from(c: Certificate) -> Self {
        PeerSelector::Certificate(c)
    }
}

impl From<SocketAddr> for PeerSelector {
    fn from(a: SocketAddr) -> Self {
        PeerSelector::Address(a)
    }
}

impl From<&Peer> for PeerSelector {
    fn from(p: &Peer) -> Self {
        PeerSelector::Certificate(p.certificate())
    }
}

impl fmt::Display for PeerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PeerSelector::Certificate(c) => write!(f, "{c}"),
            PeerSelector::Address(a) => write!(f, "{a}"),
        }
    }
}

/// Peers of one cluster, indexed by certificate and by address.
#[derive(Default)]
pub struct PeerRegistry {
    by_cert: HashMap<Certificate, Arc<Peer>>,
    by_addr: HashMap<SocketAddr, Certificate>,
}

impl PeerRegistry {
    /// Insert `peer`, evicting any entry holding the same certificate or address.
    pub fn insert(&mut self, peer: Arc<Peer>) -> Vec<Arc<Peer>> {
        let mut evicted = Vec::new();
        if let Some(old) = self.remove(&PeerSelector::Certificate(peer.certificate())) {
            evicted.push(old);
        }
        if let Some(old) = self.remove(&PeerSelector::Address(peer.addr())) {
            evicted.push(old);
        }
        self.by_addr.insert(peer.addr(), peer.certificate());
        self.by_cert.insert(peer.certificate(), peer);
        evicted
    }

    pub fn get(&self, selector: &PeerSelector) -> Option<Arc<Peer>> {
        match selector {
            PeerSelector::Certificate(c) => self.by_cert.get(c).cloned(),
            PeerSelector::Address(a) => self.by_addr.get(a).and_then(|c| self.by_cert.get(c)).cloned(),
        }
    }

    pub fn remove(&mut self, selector: &PeerSelector) -> Option<Arc<Peer>> {
        let cert = match selector {
            PeerSelector::Certificate(c) => *c,
            PeerSelector::Address(a) => *self.by_addr.get(a)?,
        };
        let peer = self.by_cert.remove(&cert)?;
        self.by_addr.remove(&peer.addr());
        Some(peer)
    }

    pub fn snapshot(&self) -> Vec<Arc<Peer>> {
        self.by_cert.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.by_cert.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_cert.is_empty()
    }

    #[cfg(test)]
    fn consistent(&self) -> bool {
        self.by_cert.len() == self.by_addr.len()
            && self
                .by_addr
                .iter()
                .all(|(addr, cert)| self.by_cert.get(cert).map(|p| p.addr()) == Some(*addr))
    }
}
