//! Handler table shared by the client and the clusters.
//!
//! Inbound flow: resolve the command tag, find the handler, decrypt with the
//! session key, decode into the registered type, invoke.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use glink_core::command::AnyCommand;
use glink_core::{codec, Command, CommandId, CommandRegistry, ProtectedCommand, SessionKey};

use crate::error::{RdpError, Result};

type Handler<Ctx> = Arc<dyn Fn(&Ctx, AnyCommand) -> anyhow::Result<()> + Send + Sync>;

struct Slot<Ctx> {
    name: &'static str,
    handler: Handler<Ctx>,
    fallback: bool,
}

/// One handler per command id. `Ctx` is what the handler sees besides the
/// command (the sending peer on a cluster, nothing on a client).
pub struct HandlerTable<Ctx> {
    registry: &'static CommandRegistry,
    slots: RwLock<HashMap<CommandId, Slot<Ctx>>>,
}

impl<Ctx: 'static> HandlerTable<Ctx> {
    pub fn new(registry: &'static CommandRegistry) -> Self {
        Self {
            registry,
            slots: RwLock::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &'static CommandRegistry {
        self.registry
    }

    /// Install the handler for `C`. Fails if `C` is not in the registry or
    /// already has a handler. A fallback handler may be replaced once.
    pub fn register<C, F>(&self, handler: F) -> Result<()>
    where
        C: Command,
        F: Fn(&Ctx, C) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert::<C, F>(handler, false)
    }

    /// Install a handler that a later [`register`](Self::register) replaces.
    pub fn register_fallback<C, F>(&self, handler: F) -> Result<()>
    where
        C: Command,
        F: Fn(&Ctx, C) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.insert::<C, F>(handler, true)
    }

    fn insert<C, F>(&self, handler: F, fallback: bool) -> Result<()>
    where
        C: Command,
        F: Fn(&Ctx, C) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let id = self
            .registry
            .resolve_by_type::<C>()
            .ok_or(RdpError::UnregisteredCommand(C::NAME))?;
        let erased: Handler<Ctx> = Arc::new(move |ctx: &Ctx, command: AnyCommand| {
            let command = command
                .downcast::<C>()
                .map_err(|_| anyhow::anyhow!("command {} decoded to a foreign type", C::NAME))?;
            handler(ctx, *command)
        });

        let mut slots = self.slots.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = slots.get(&id) {
            if !existing.fallback {
                return Err(RdpError::DuplicateHandler(C::NAME));
            }
        }
        slots.insert(
            id,
            Slot {
                name: C::NAME,
                handler: erased,
                fallback,
            },
        );
        Ok(())
    }

    pub fn has_handler(&self, id: CommandId) -> bool {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(&id)
    }

    fn handler(&self, id: CommandId) -> Option<(&'static str, Handler<Ctx>)> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&id)
            .map(|slot| (slot.name, slot.handler.clone()))
    }

    /// Run one inbound command through its handler.
    pub fn dispatch(&self, ctx: &Ctx, message: &ProtectedCommand, session: &SessionKey) -> Result<()> {
        let id = message.command;
        if !self.registry.contains(id) {
            return Err(RdpError::UnknownCommand(id));
        }
        let (name, handler) = self.handler(id).ok_or(RdpError::MissingHandler(id))?;
        let plain = session
            .decrypt(&message.payload)
            .map_err(|_| RdpError::Decrypt { command: id })?;
        let command = self.registry.decode(id, &plain)?;
        tracing::trace!(command = name, "dispatch");
        handler(ctx, command).map_err(RdpError::Handler)
    }
}

/// Encode and encrypt `command` for the holder of `session`.
pub fn protect<C: Command>(
    registry: &CommandRegistry,
    session: &SessionKey,
    command: &C,
) -> Result<ProtectedCommand> {
    let id = registry
        .resolve_by_type::<C>()
        .ok_or(RdpError::UnregisteredCommand(C::NAME))?;
    let bytes = codec::encode(command)?;
    let payload = session.encrypt(&bytes)?;
    Ok(ProtectedCommand { command: id, payload })
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use glink_core::{protected_commands, Identity, MetricsCmd, StartCmd, StopCmd};

    use super::*;

    fn session_pair() -> (SessionKey, SessionKey) {
        let a = Identity::generate();
        let b = Identity::generate();
        (a.session(&b.public()), b.session(&a.public()))
    }

    #[test]
    fn dispatch_decrypts_and_invokes() {
        let table: HandlerTable<u32> = HandlerTable::new(protected_commands());
        let seen = Arc::new(AtomicU32::new(0));
        let seen_in = seen.clone();
        table
            .register(move |ctx: &u32, cmd: MetricsCmd| {
                seen_in.store(ctx + cmd.cpu_usage, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();

        let (ours, theirs) = session_pair();
        let cmd = MetricsCmd {
            cpu_usage: 1250,
            ..Default::default()
        };
        let protected = protect(protected_commands(), &theirs, &cmd).unwrap();
        assert_eq!(protected.command, 1);
        table.dispatch(&7, &protected, &ours).unwrap();
        assert_eq!(seen.load(Ordering::SeqCst), 1257);
    }

    #[test]
    fn dispatch_failures() {
        let table: HandlerTable<()> = HandlerTable::new(protected_commands());
        table.register(|_: &(), _: StopCmd| Ok(())).unwrap();
        let (ours, theirs) = session_pair();

        let unknown = ProtectedCommand {
            command: 99,
            payload: vec![],
        };
        assert!(matches!(
            table.dispatch(&(), &unknown, &ours),
            Err(RdpError::UnknownCommand(99))
        ));

        let start = protect(protected_commands(), &theirs, &StartCmd::default()).unwrap();
        assert!(matches!(
            table.dispatch(&(), &start, &ours),
            Err(RdpError::MissingHandler(2))
        ));

        let mut stop = protect(protected_commands(), &theirs, &StopCmd { stop: true }).unwrap();
        stop.payload[20] ^= 1;
        assert!(matches!(
            table.dispatch(&(), &stop, &ours),
            Err(RdpError::Decrypt { command: 3 })
        ));
    }

    #[test]
    fn handler_errors_are_wrapped() {
        let table: HandlerTable<()> = HandlerTable::new(protected_commands());
        table
            .register(|_: &(), _: StopCmd| Err(anyhow::anyhow!("busy")))
            .unwrap();
        let (ours, theirs) = session_pair();
        let stop = protect(protected_commands(), &theirs, &StopCmd { stop: true }).unwrap();
        let err = table.dispatch(&(), &stop, &ours).unwrap_err();
        assert!(matches!(err, RdpError::Handler(_)));
        assert!(err.to_string().contains("busy"));
    }

    #[test]
    fn one_handler_per_command() {
        let table: HandlerTable<()> = HandlerTable::new(protected_commands());
        table.register_fallback(|_: &(), _: StartCmd| Ok(())).unwrap();
        table.register(|_: &(), _: StartCmd| Ok(())).unwrap();
        assert!(matches!(
            table.register(|_: &(), _: StartCmd| Ok(())),
            Err(RdpError::DuplicateHandler("start"))
        ));
        assert!(table.has_handler(2));
        assert!(!table.has_handler(3));
    }

    #[test]
    fn unregistered_command_rejected() {
        #[derive(Default, serde::Serialize, serde::Deserialize)]
        struct Custom;
        impl Command for Custom {
            const NAME: &'static str = "custom";
        }
        let table: HandlerTable<()> = HandlerTable::new(protected_commands());
        assert!(matches!(
            table.register(|_: &(), _: Custom| Ok(())),
            Err(RdpError::UnregisteredCommand("custom"))
        ));
        let (ours, _) = session_pair();
        assert!(matches!(
            protect(protected_commands(), &ours, &Custom),
            Err(RdpError::UnregisteredCommand("custom"))
        ));
    }
}
