//! Command registry: maps protected command types to stable numeric tags.
//!
//! The table is built once and never mutated. Both ends must use the same
//! table; [`protected_commands`] is the process-wide one.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::OnceLock;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::codec::{self, CodecError};
use crate::protocol::{MetricsCmd, StartCmd, StopCmd};

/// Numeric tag carried in [`ProtectedCommand::command`](crate::protocol::ProtectedCommand).
pub type CommandId = u16;

/// Tag of [`MetricsCmd`] in the standard table.
pub const METRICS: CommandId = 1;
/// Tag of [`StartCmd`] in the standard table.
pub const START: CommandId = 2;
/// Tag of [`StopCmd`] in the standard table.
pub const STOP: CommandId = 3;

/// A payload that can travel inside a protected command.
pub trait Command: Serialize + DeserializeOwned + Default + Send + 'static {
    /// Short name for logs.
    const NAME: &'static str;
}

/// Decoded command of a type known only by its tag.
pub type AnyCommand = Box<dyn Any + Send>;

struct Entry {
    name: &'static str,
    type_id: TypeId,
    zero: fn() -> AnyCommand,
    decode: fn(&[u8]) -> Result<AnyCommand, CodecError>,
}

fn zero_of<C: Command>() -> AnyCommand {
    Box::new(C::default())
}

fn decode_as<C: Command>(bytes: &[u8]) -> Result<AnyCommand, CodecError> {
    let value: C = codec::decode(bytes)?;
    Ok(Box::new(value))
}

/// Bidirectional tag ↔ type table.
pub struct CommandRegistry {
    by_type: HashMap<TypeId, CommandId>,
    by_id: HashMap<CommandId, Entry>,
}

impl CommandRegistry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder {
            registry: CommandRegistry {
                by_type: HashMap::new(),
                by_id: HashMap::new(),
            },
        }
    }

    /// Tag registered for type `C`.
    pub fn resolve_by_type<C: Command>(&self) -> Option<CommandId> {
        self.by_type.get(&TypeId::of::<C>()).copied()
    }

    /// Fresh zero value of the type registered under `id`.
    pub fn resolve_by_id(&self, id: CommandId) -> Option<AnyCommand> {
        self.by_id.get(&id).map(|e| (e.zero)())
    }

    /// Tag of the concrete type behind `value`. A boxed [`AnyCommand`], such as
    /// the result of [`resolve_by_id`](Self::resolve_by_id), resolves to the
    /// type inside the box.
    pub fn resolve_by_value(&self, value: &dyn Any) -> Option<CommandId> {
        let type_id = match value.downcast_ref::<AnyCommand>() {
            Some(boxed) => {
                let inner: &(dyn Any + Send) = &**boxed;
                inner.type_id()
            }
            None => value.type_id(),
        };
        self.by_type.get(&type_id).copied()
    }

    pub fn name(&self, id: CommandId) -> Option<&'static str> {
        self.by_id.get(&id).map(|e| e.name)
    }

    pub fn contains(&self, id: CommandId) -> bool {
        self.by_id.contains_key(&id)
    }

    /// Decode `bytes` into the type registered under `id`.
    pub fn decode(&self, id: CommandId, bytes: &[u8]) -> Result<AnyCommand, RegistryError> {
        let entry = self.by_id.get(&id).ok_or(RegistryError::UnknownId(id))?;
        (entry.decode)(bytes).map_err(|source| RegistryError::Decode {
            name: entry.name,
            source,
        })
    }

    /// Encode a command, returning its tag and bytes.
    pub fn encode<C: Command>(&self, command: &C) -> Result<(CommandId, Vec<u8>), RegistryError> {
        let id = self
            .resolve_by_type::<C>()
            .ok_or(RegistryError::Unregistered(C::NAME))?;
        let bytes = codec::encode(command).map_err(|source| RegistryError::Encode {
            name: C::NAME,
            source,
        })?;
        Ok((id, bytes))
    }

    pub fn len(&self) -> usize {
        self.by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_id.is_empty()
    }
}

/// Collects registrations; duplicates are rejected before the table exists.
pub struct RegistryBuilder {
    registry: CommandRegistry,
}

impl RegistryBuilder {
    pub fn register<C: Command>(mut self, id: CommandId) -> Result<Self, RegistryError> {
        let type_id = TypeId::of::<C>();
        if let Some(existing) = self.registry.by_id.get(&id) {
            return Err(RegistryError::DuplicateId {
                id,
                existing: existing.name,
            });
        }
        if let Some(&existing) = self.registry.by_type.get(&type_id) {
            return Err(RegistryError::DuplicateType {
                name: C::NAME,
                existing,
            });
        }
        self.registry.by_type.insert(type_id, id);
        self.registry.by_id.insert(
            id,
            Entry {
                name: C::NAME,
                type_id,
                zero: zero_of::<C>,
                decode: decode_as::<C>,
            },
        );
        Ok(self)
    }

    pub fn build(self) -> CommandRegistry {
        debug_assert!(self
            .registry
            .by_id
            .iter()
            .all(|(id, e)| self.registry.by_type.get(&e.type_id) == Some(id)));
        self.registry
    }
}

/// The standard table: metrics = 1, start = 2, stop = 3.
pub fn standard_registry() -> Result<CommandRegistry, RegistryError> {
    Ok(CommandRegistry::builder()
        .register::<MetricsCmd>(METRICS)?
        .register::<StartCmd>(START)?
        .register::<StopCmd>(STOP)?
        .build())
}

/// Process-wide command table, built on first use.
pub fn protected_commands() -> &'static CommandRegistry {
    static REGISTRY: OnceLock<CommandRegistry> = OnceLock::new();
    REGISTRY.get_or_init(|| standard_registry().expect("standard command ids are unique"))
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("command id {id} already registered for {existing}")]
    DuplicateId { id: CommandId, existing: &'static str },
    #[error("command {name} already registered as id {existing}")]
    DuplicateType { name: &'static str, existing: CommandId },
    #[error("unknown command id {0}")]
    UnknownId(CommandId),
    #[error("command {0} is not registered")]
    Unregistered(&'static str),
    #[error("cannot encode command {name}: {source}")]
    Encode {
        name: &'static str,
        #[source]
        source: CodecError,
    },
    #[error("cannot decode command {name}: {source}")]
    Decode {
        name: &'static str,
        #[source]
        source: CodecError,
    },
}
