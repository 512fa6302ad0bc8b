//! Framing: fixed 300-byte packets with a 2-byte routing prefix on the upstream path.
//!
//! Upstream (client → server): `[route: 2][record]`, where route is the connect
//! marker `{1, 1}` or a big-endian cluster index. Downstream (server → client):
//! `[record]` from byte 0. Unused tail bytes are zero.

use std::fmt;

/// Size of every datagram on the wire.
pub const PACKET_SIZE: usize = 300;
/// Routing prefix length on upstream packets.
pub const ROUTE_SIZE: usize = 2;
/// Prefix marking a connect (handshake) packet.
pub const CONNECT_MARKER: [u8; ROUTE_SIZE] = [0x01, 0x01];
/// Cluster index that would collide with [`CONNECT_MARKER`]; never assigned.
pub const RESERVED_CLUSTER_INDEX: u16 = u16::from_be_bytes(CONNECT_MARKER);
/// Largest record that fits an upstream packet.
pub const MAX_ROUTED_PAYLOAD: usize = PACKET_SIZE - ROUTE_SIZE;

/// Where an upstream packet should go.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Connect,
    Cluster(u16),
}

impl Route {
    fn prefix(self) -> [u8; ROUTE_SIZE] {
        match self {
            Route::Connect => CONNECT_MARKER,
            Route::Cluster(index) => index.to_be_bytes(),
        }
    }
}

/// One fixed-size datagram.
#[derive(Clone, PartialEq, Eq)]
pub struct Packet([u8; PACKET_SIZE]);

impl Packet {
    /// Upstream handshake packet.
    pub fn connect(record: &[u8]) -> Result<Self, FrameError> {
        Self::routed(Route::Connect, record)
    }

    /// Upstream packet for the given route. Oversized records are rejected, never truncated.
    pub fn routed(route: Route, record: &[u8]) -> Result<Self, FrameError> {
        if let Route::Cluster(RESERVED_CLUSTER_INDEX) = route {
            return Err(FrameError::ReservedIndex);
        }
        check_len(record.len(), MAX_ROUTED_PAYLOAD)?;
        let mut out = [0u8; PACKET_SIZE];
        out[..ROUTE_SIZE].copy_from_slice(&route.prefix());
        out[ROUTE_SIZE..ROUTE_SIZE + record.len()].copy_from_slice(record);
        Ok(Packet(out))
    }

    /// Downstream packet: record starts at byte 0.
    pub fn bare(record: &[u8]) -> Result<Self, FrameError> {
        check_len(record.len(), PACKET_SIZE)?;
        let mut out = [0u8; PACKET_SIZE];
        out[..record.len()].copy_from_slice(record);
        Ok(Packet(out))
    }

    /// Copy a received datagram; shorter datagrams are zero padded.
    pub fn from_datagram(bytes: &[u8]) -> Result<Self, FrameError> {
        Self::bare(bytes)
    }

    /// Routing decision for an upstream packet.
    pub fn route(&self) -> Route {
        let prefix = [self.0[0], self.0[1]];
        if prefix == CONNECT_MARKER {
            Route::Connect
        } else {
            Route::Cluster(u16::from_be_bytes(prefix))
        }
    }

    /// Record bytes of an upstream packet (everything after the route).
    pub fn body(&self) -> &[u8] {
        &self.0[ROUTE_SIZE..]
    }

    pub fn as_bytes(&self) -> &[u8; PACKET_SIZE] {
        &self.0
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8; PACKET_SIZE] {
        &mut self.0
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet({:?})", self.route())
    }
}

fn check_len(size: usize, max: usize) -> Result<(), FrameError> {
    if size > max {
        return Err(FrameError::TooLarge { size, max });
    }
    Ok(())
}

/// Error framing a record into a packet.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("record of {size} bytes exceeds packet capacity of {max}")]
    TooLarge { size: usize, max: usize },
    #[error("cluster index {RESERVED_CLUSTER_INDEX} is reserved for the connect marker")]
    ReservedIndex,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn connect_marker_routes_to_handshake() {
        let p = Packet::connect(&[9, 9, 9]).unwrap();
        assert_eq!(&p.as_bytes()[..5], &[1, 1, 9, 9, 9]);
        assert_eq!(p.route(), Route::Connect);
        assert_eq!(&p.body()[..3], &[9, 9, 9]);
        assert!(p.body()[3..].iter().all(|&b| b == 0));
    }

    #[test]
    fn cluster_index_is_big_endian() {
        let p = Packet::routed(Route::Cluster(0x0203), &[7]).unwrap();
        assert_eq!(&p.as_bytes()[..3], &[2, 3, 7]);
        assert_eq!(p.route(), Route::Cluster(0x0203));
        assert_eq!(Packet::routed(Route::Cluster(1), &[]).unwrap().route(), Route::Cluster(1));
    }

    #[test]
    fn reserved_index_cannot_be_framed() {
        assert_eq!(RESERVED_CLUSTER_INDEX, 257);
        assert!(matches!(
            Packet::routed(Route::Cluster(257), &[]),
            Err(FrameError::ReservedIndex)
        ));
    }

    #[test]
    fn oversized_records_rejected() {
        assert!(Packet::routed(Route::Cluster(1), &[0; MAX_ROUTED_PAYLOAD]).is_ok());
        assert!(matches!(
            Packet::routed(Route::Cluster(1), &[0; MAX_ROUTED_PAYLOAD + 1]),
            Err(FrameError::TooLarge { size: 299, max: 298 })
        ));
        assert!(Packet::bare(&[0; PACKET_SIZE]).is_ok());
        assert!(Packet::bare(&[0; PACKET_SIZE + 1]).is_err());
    }

    #[test]
    fn short_datagram_is_padded() {
        let p = Packet::from_datagram(&[0, 5, 1]).unwrap();
        assert_eq!(p.route(), Route::Cluster(5));
        assert_eq!(p.body()[0], 1);
        assert_eq!(p.as_bytes().len(), PACKET_SIZE);
    }
}
