//! glink control-plane core.
//! No I/O: wire codec, identities and crypto, packet framing, protocol records.

pub mod codec;
pub mod command;
pub mod identity;
pub mod protocol;
pub mod quantum;
pub mod wire;

pub use codec::CodecError;
pub use command::{protected_commands, Command, CommandId, CommandRegistry, RegistryError};
pub use identity::{Certificate, CryptoError, Identity, IdentityError, PeerKey, PublicKey, SessionKey};
pub use protocol::{
    AcceptCmd, ConnectCmd, MetricsCmd, ProtectedCommand, SignedMessage, StartCmd, StopCmd, Version,
};
pub use quantum::{Quantum, QuantumPool};
pub use wire::{FrameError, Packet, Route, PACKET_SIZE};
