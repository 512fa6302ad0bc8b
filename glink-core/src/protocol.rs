//! Control-plane records: handshake envelopes, protected commands, versions.

use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::codec::{self, CodecError};
use crate::command::Command;
use crate::identity::{Certificate, Identity, PeerKey, PublicKey};

/// Signed, unencrypted envelope. Used only for the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedMessage {
    pub data: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SignedMessage {
    /// Encode `record` and sign the encoded bytes.
    pub fn sign<T: Serialize>(identity: &Identity, record: &T) -> Result<Self, CodecError> {
        let data = codec::encode(record)?;
        let signature = identity.sign(&data);
        Ok(Self { data, signature })
    }

    pub fn verify(&self, signer: &Certificate) -> bool {
        signer.verify(&self.data, &self.signature)
    }
}

/// Encrypted, tagged command exchanged after the handshake.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProtectedCommand {
    pub command: u16,
    pub payload: Vec<u8>,
}

/// Client → server: join `cluster` as `peer`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectCmd {
    pub cluster: Certificate,
    pub peer: PeerKey,
    pub version: Version,
}

/// Server → client: handshake accepted; cluster public key and routing index.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptCmd {
    pub key: PublicKey,
    pub cluster_index: u16,
}

/// Server → client: start work with an opaque (JSON) configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartCmd {
    pub config: Vec<u8>,
    pub start: bool,
}

impl Command for StartCmd {
    const NAME: &'static str = "start";
}

/// Server → client: stop work.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopCmd {
    pub stop: bool,
}

impl Command for StopCmd {
    const NAME: &'static str = "stop";
}

/// Client → server: periodic health sample. CPU in hundredths of a percent, memory in MiB.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricsCmd {
    pub cpu_usage: u32,
    pub mem_total: u32,
    pub mem_used: u32,
    pub mem_free: u32,
}

impl Command for MetricsCmd {
    const NAME: &'static str = "metrics";
}

impl MetricsCmd {
    pub fn cpu_percent(&self) -> f64 {
        f64::from(self.cpu_usage) / 100.0
    }
}

/// Packed version: major (8 bits) | minor (8 bits) | build (16 bits).
#[derive(Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Version(u32);

impl Version {
    pub const ZERO: Version = Version(0);

    pub const fn new(major: u8, minor: u8, build: u16) -> Self {
        Version((major as u32) << 24 | (minor as u32) << 16 | build as u32)
    }

    pub fn major(&self) -> u8 {
        (self.0 >> 24) as u8
    }

    pub fn minor(&self) -> u8 {
        (self.0 >> 16) as u8
    }

    pub fn build(&self) -> u16 {
        self.0 as u16
    }

    /// Compare major and minor only; builds of the same minor are compatible.
    pub fn compare_by_minor(&self, other: &Version) -> Ordering {
        (self.0 >> 16).cmp(&(other.0 >> 16))
    }

    pub fn as_u32(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major(), self.minor(), self.build())
    }
}

impl fmt::Debug for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Version({self})")
    }
}

impl FromStr for Version {
    type Err = VersionError;

    /// Parse `major[.minor[.build]]`.
    fn from_str(s: &str) -> Result<Self, VersionError> {
        let invalid = || VersionError(s.to_string());
        let mut parts = s.trim().split('.');
        let major = parts.next().ok_or_else(invalid)?.parse::<u8>().map_err(|_| invalid())?;
        let minor = match parts.next() {
            Some(p) => p.parse::<u8>().map_err(|_| invalid())?,
            None => 0,
        };
        let build = match parts.next() {
            Some(p) => p.parse::<u16>().map_err(|_| invalid())?,
            None => 0,
        };
        if parts.next().is_some() {
            return Err(invalid());
        }
        Ok(Version::new(major, minor, build))
    }
}

#[derive(Debug, thiserror::Error)]
#[error("invalid version string {0:?}")]
pub struct VersionError(String);
