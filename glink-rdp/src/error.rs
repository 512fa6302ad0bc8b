//! Errors surfaced by the client, clusters and the server.

use std::net::SocketAddr;

use glink_core::{Certificate, CodecError, CommandId, CryptoError, FrameError, RegistryError};

#[derive(Debug, thiserror::Error)]
pub enum RdpError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("frame: {0}")]
    Frame(#[from] FrameError),
    #[error("crypto: {0}")]
    Crypto(#[from] CryptoError),
    #[error("registry: {0}")]
    Registry(#[from] RegistryError),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("invalid signature from {0}")]
    InvalidSignature(String),
    #[error("cannot decrypt command {command}")]
    Decrypt { command: CommandId },
    #[error("unknown command {0}")]
    UnknownCommand(CommandId),
    #[error("no handler for command {0}")]
    MissingHandler(CommandId),
    #[error("command {0} is not registered")]
    UnregisteredCommand(&'static str),
    #[error("handler for command {0} already registered")]
    DuplicateHandler(&'static str),
    #[error("unknown peer {0}")]
    UnknownPeer(String),
    #[error("cluster not found {0}")]
    UnknownCluster(Certificate),
    #[error("cluster index {0} already in use")]
    DuplicateCluster(u16),
    #[error("cluster index {0} is reserved")]
    ReservedClusterIndex(u16),
    #[error("no accept from {0} before timeout")]
    HandshakeTimeout(SocketAddr),
    #[error("cancelled")]
    Cancelled,
    #[error("client already has a live session")]
    SessionActive,
    #[error("listener already bound")]
    AlreadyListening,
    #[error("outbound queue closed")]
    OutboxClosed,
    #[error("input stream closed")]
    InputClosed,
    #[error("handler failed: {0:#}")]
    Handler(anyhow::Error),
}

pub type Result<T, E = RdpError> = std::result::Result<T, E>;
