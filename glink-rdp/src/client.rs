//! Client endpoint: joins a cluster, reports health, runs command handlers.
//!
//! A session runs three tasks on one connected UDP socket: the reader (inbound
//! commands), the health ticker and the single writer. Any of them stopping, or
//! the cancellation token firing, closes the session.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use glink_core::wire::{Route, PACKET_SIZE};
use glink_core::{
    codec, protected_commands, AcceptCmd, Certificate, Command, ConnectCmd, Identity, Packet,
    ProtectedCommand, PublicKey, SessionKey, SignedMessage, StartCmd, StopCmd, Version,
};
use tokio::net::{lookup_host, ToSocketAddrs, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinSet;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};

use crate::dispatch::{protect, HandlerTable};
use crate::error::{RdpError, Result};
use crate::health::{MetricsSource, SystemMetrics};
use crate::input::{Event, InputStream};

/// Client tuning.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// How long to wait for the cluster's accept.
    pub handshake_timeout: Duration,
    /// Interval between health reports.
    pub health_period: Duration,
    /// Capacity of the outbound queue.
    pub queue_capacity: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: Duration::from_secs(5),
            health_period: Duration::from_secs(5),
            queue_capacity: 100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    Idle,
    Handshaking,
    Connected,
    Closed,
}

/// Health source shared by every session of one client. Created on the first
/// tick when none was configured.
type SharedMetrics = Arc<Mutex<Option<Box<dyn MetricsSource>>>>;

pub struct Client {
    identity: Arc<Identity>,
    version: Version,
    config: ClientConfig,
    handlers: Arc<HandlerTable<()>>,
    metrics: SharedMetrics,
    state: Arc<watch::Sender<ClientState>>,
}

impl Client {
    pub fn new(version: Version, config: ClientConfig) -> Self {
        Self::with_identity(Identity::generate(), version, config)
    }

    pub fn with_identity(identity: Identity, version: Version, config: ClientConfig) -> Self {
        let handlers = HandlerTable::new(protected_commands());
        let fallbacks = handlers
            .register_fallback(|_: &(), cmd: StartCmd| {
                info!(config = %String::from_utf8_lossy(&cmd.config), "start");
                Ok(())
            })
            .and_then(|_| {
                handlers.register_fallback(|_: &(), _: StopCmd| {
                    info!("stop");
                    Ok(())
                })
            });
        if let Err(e) = fallbacks {
            warn!(error = %e, "cannot install default handlers");
        }
        let (state, _) = watch::channel(ClientState::Idle);
        Self {
            identity: Arc::new(identity),
            version,
            config,
            handlers: Arc::new(handlers),
            metrics: Arc::new(Mutex::new(None)),
            state: Arc::new(state),
        }
    }

    /// Report health from `source` instead of the host's CPU and memory.
    pub fn with_metrics_source(self, source: impl MetricsSource + 'static) -> Self {
        *self.metrics.lock().unwrap_or_else(PoisonError::into_inner) = Some(Box::new(source));
        self
    }

    pub fn certificate(&self) -> Certificate {
        self.identity.certificate()
    }

    pub fn version(&self) -> Version {
        self.version
    }

    pub fn state(&self) -> ClientState {
        *self.state.borrow()
    }

    pub fn watch_state(&self) -> watch::Receiver<ClientState> {
        self.state.subscribe()
    }

    /// Handle a command from the cluster. One handler per command type; the
    /// built-in start and stop loggers are replaced.
    pub fn on_command<C, F>(&self, handler: F) -> Result<()>
    where
        C: Command,
        F: Fn(C) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.handlers.register(move |_: &(), cmd: C| handler(cmd))
    }

    /// Called with the raw (JSON) configuration of every start command.
    pub fn on_start<F>(&self, handler: F) -> Result<()>
    where
        F: Fn(&[u8]) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_command(move |cmd: StartCmd| handler(&cmd.config))
    }

    pub fn on_stop<F>(&self, handler: F) -> Result<()>
    where
        F: Fn() -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.on_command(move |_: StopCmd| handler())
    }

    /// Join the cluster identified by `cluster` at `coordinator`. The session
    /// lives until `cancel` fires or the transport fails. A failed handshake
    /// returns the client to idle; it is not retried. One session at a time:
    /// connecting while handshaking or connected is `SessionActive`.
    pub async fn connect(
        &self,
        coordinator: impl ToSocketAddrs,
        cluster: Certificate,
        cancel: CancellationToken,
    ) -> Result<Session> {
        let mut busy = false;
        self.state.send_if_modified(|state| match state {
            ClientState::Handshaking | ClientState::Connected => {
                busy = true;
                false
            }
            ClientState::Idle | ClientState::Closed => {
                *state = ClientState::Handshaking;
                true
            }
        });
        if busy {
            return Err(RdpError::SessionActive);
        }
        let span = info_span!("client", id = %self.certificate());
        match self.handshake(coordinator, cluster, &cancel).instrument(span.clone()).await {
            Ok((socket, remote, accept)) => {
                info!(parent: &span, %remote, cluster = accept.cluster_index, "connection accepted");
                self.state.send_replace(ClientState::Connected);
                Ok(self.start_session(socket, cluster, accept, cancel, span))
            }
            Err(e) => {
                self.state.send_replace(ClientState::Idle);
                Err(e)
            }
        }
    }

    async fn handshake(
        &self,
        coordinator: impl ToSocketAddrs,
        cluster: Certificate,
        cancel: &CancellationToken,
    ) -> Result<(UdpSocket, SocketAddr, AcceptCmd)> {
        let remote = lookup_host(coordinator).await?.next().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "coordinator address did not resolve")
        })?;
        let local: SocketAddr = if remote.is_ipv4() {
            ([0, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        debug!(%remote, "dial");
        let socket = UdpSocket::bind(local).await?;
        socket.connect(remote).await?;

        let connect = ConnectCmd {
            cluster,
            peer: self.identity.peer_key(),
            version: self.version,
        };
        let signed = SignedMessage::sign(&self.identity, &connect)?;
        let packet = Packet::connect(&codec::encode(&signed)?)?;
        socket.send(packet.as_bytes()).await?;

        let mut buf = [0u8; PACKET_SIZE];
        let n = tokio::select! {
            _ = cancel.cancelled() => return Err(RdpError::Cancelled),
            r = tokio::time::timeout(self.config.handshake_timeout, socket.recv(&mut buf)) => {
                r.map_err(|_| RdpError::HandshakeTimeout(remote))??
            }
        };
        let reply: SignedMessage = codec::decode(&buf[..n])?;
        if !reply.verify(&cluster) {
            return Err(RdpError::InvalidSignature(cluster.to_string()));
        }
        let accept: AcceptCmd = codec::decode(&reply.data)?;
        Ok((socket, remote, accept))
    }

    fn start_session(
        &self,
        socket: UdpSocket,
        cluster: Certificate,
        accept: AcceptCmd,
        parent: CancellationToken,
        span: tracing::Span,
    ) -> Session {
        let socket = Arc::new(socket);
        let cancel = parent.child_token();
        let finished = CancellationToken::new();
        let (tx, rx) = mpsc::channel(self.config.queue_capacity.max(1));
        let sender = CommandSender {
            cluster_index: accept.cluster_index,
            session: self.identity.session(&accept.key),
            outbox: tx,
        };

        let mut tasks = JoinSet::new();
        tasks.spawn(
            run_reader(
                socket.clone(),
                self.handlers.clone(),
                sender.session.clone(),
                cancel.clone(),
            )
            .instrument(span.clone()),
        );
        tasks.spawn(
            run_health(self.metrics.clone(), sender.clone(), self.config.health_period, cancel.clone())
                .instrument(span.clone()),
        );
        tasks.spawn(run_writer(socket, rx, cancel.clone()).instrument(span.clone()));

        let state = self.state.clone();
        let (stop, done) = (cancel.clone(), finished.clone());
        tokio::spawn(
            async move {
                while let Some(joined) = tasks.join_next().await {
                    stop.cancel();
                    if let Err(e) = joined {
                        error!(error = %e, "session task failed");
                    }
                }
                state.send_replace(ClientState::Closed);
                info!("session closed");
                done.cancel();
            }
            .instrument(span),
        );

        Session {
            cluster,
            cluster_index: accept.cluster_index,
            cluster_key: accept.key,
            sender,
            cancel,
            finished,
        }
    }
}

/// Encrypts commands for the cluster and queues them for the writer.
#[derive(Clone)]
struct CommandSender {
    cluster_index: u16,
    session: SessionKey,
    outbox: mpsc::Sender<Packet>,
}

impl CommandSender {
    async fn send<C: Command>(&self, command: &C) -> Result<()> {
        let protected = protect(protected_commands(), &self.session, command)?;
        let packet = Packet::routed(
            Route::Cluster(self.cluster_index),
            &codec::encode(&protected)?,
        )?;
        self.outbox.send(packet).await.map_err(|_| RdpError::OutboxClosed)
    }
}

/// An established connection to one cluster.
pub struct Session {
    cluster: Certificate,
    cluster_index: u16,
    cluster_key: PublicKey,
    sender: CommandSender,
    cancel: CancellationToken,
    finished: CancellationToken,
}

impl Session {
    pub fn cluster(&self) -> Certificate {
        self.cluster
    }

    /// Routing index assigned by the server.
    pub fn cluster_index(&self) -> u16 {
        self.cluster_index
    }

    /// The cluster's agreement key, as received in the accept.
    pub fn cluster_key(&self) -> PublicKey {
        self.cluster_key
    }

    /// Send any registered command to the cluster.
    pub async fn send<C: Command>(&self, command: &C) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(RdpError::OutboxClosed);
        }
        self.sender.send(command).await
    }

    /// Event queue for a dataflow consumer; closes with the session.
    pub fn input<T: Send + 'static>(&self, capacity: usize) -> (InputStream<T>, mpsc::Receiver<Event<T>>) {
        InputStream::channel(capacity, self.cancel.clone())
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.finished.is_cancelled()
    }

    /// Resolves once every session task has stopped.
    pub async fn closed(&self) {
        self.finished.cancelled().await
    }
}

async fn run_reader(
    socket: Arc<UdpSocket>,
    handlers: Arc<HandlerTable<()>>,
    session: SessionKey,
    cancel: CancellationToken,
) {
    let mut buf = [0u8; PACKET_SIZE];
    loop {
        let n = tokio::select! {
            _ = cancel.cancelled() => return,
            r = socket.recv(&mut buf) => match r {
                Ok(n) => n,
                Err(e) => {
                    error!(error = %e, "cannot read from server");
                    return;
                }
            },
        };
        let message: ProtectedCommand = match codec::decode(&buf[..n]) {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "invalid message format");
                continue;
            }
        };
        debug!(command = message.command, "client command");
        if let Err(e) = handlers.dispatch(&(), &message, &session) {
            warn!(command = message.command, error = %e, "cannot handle command");
        }
    }
}

async fn run_health(
    source: SharedMetrics,
    sender: CommandSender,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }
        let metrics = {
            let mut source = source.lock().unwrap_or_else(PoisonError::into_inner);
            source
                .get_or_insert_with(|| -> Box<dyn MetricsSource> {
                    Box::new(SystemMetrics::new())
                })
                .sample()
        };
        match sender.send(&metrics).await {
            Ok(()) => debug!(cpu = metrics.cpu_percent(), mem_used = metrics.mem_used, "metrics sent"),
            Err(RdpError::OutboxClosed) => return,
            Err(e) => warn!(error = %e, "cannot publish metrics"),
        }
    }
}

async fn run_writer(socket: Arc<UdpSocket>, mut rx: mpsc::Receiver<Packet>, cancel: CancellationToken) {
    loop {
        let packet = tokio::select! {
            _ = cancel.cancelled() => return,
            p = rx.recv() => match p {
                Some(p) => p,
                None => return,
            },
        };
        if let Err(e) = socket.send(packet.as_bytes()).await {
            error!(error = %e, "cannot write to server");
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn start_and_stop_handlers_replace_defaults_once() {
        let client = Client::new(Version::new(1, 0, 0), ClientConfig::default());
        client.on_start(|_| Ok(())).unwrap();
        client.on_stop(|| Ok(())).unwrap();
        assert!(matches!(
            client.on_stop(|| Ok(())),
            Err(RdpError::DuplicateHandler("stop"))
        ));
        client.on_command(|_: glink_core::MetricsCmd| Ok(())).unwrap();
        assert_eq!(client.state(), ClientState::Idle);
    }

    #[tokio::test]
    async fn silent_coordinator_times_out_to_idle() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let config = ClientConfig {
            handshake_timeout: Duration::from_millis(100),
            ..Default::default()
        };
        let client = Client::new(Version::new(1, 1, 1), config);
        let err = client
            .connect(
                silent.local_addr().unwrap(),
                Identity::generate().certificate(),
                CancellationToken::new(),
            )
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RdpError::HandshakeTimeout(_)));
        assert_eq!(client.state(), ClientState::Idle);

        let mut buf = [0u8; PACKET_SIZE + 8];
        let (n, _) = silent.recv_from(&mut buf).await.unwrap();
        assert_eq!(n, PACKET_SIZE);
        assert_eq!(&buf[..2], &[1, 1]);
    }

    #[tokio::test]
    async fn cancel_aborts_handshake() {
        let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let client = Client::new(Version::ZERO, ClientConfig::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let err = client
            .connect(silent.local_addr().unwrap(), Identity::generate().certificate(), cancel)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RdpError::Cancelled));
    }

    #[tokio::test]
    async fn forged_accept_is_rejected() {
        let fake = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let cluster = Identity::generate();
        let impostor = Identity::generate();
        let client = Client::new(Version::ZERO, ClientConfig::default());

        let fake_addr = fake.local_addr().unwrap();
        let responder = tokio::spawn(async move {
            let mut buf = [0u8; PACKET_SIZE];
            let (_, from) = fake.recv_from(&mut buf).await.unwrap();
            let accept = AcceptCmd {
                key: impostor.public(),
                cluster_index: 1,
            };
            let signed = SignedMessage::sign(&impostor, &accept).unwrap();
            let packet = Packet::bare(&codec::encode(&signed).unwrap()).unwrap();
            fake.send_to(packet.as_bytes(), from).await.unwrap();
        });

        let err = client
            .connect(fake_addr, cluster.certificate(), CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, RdpError::InvalidSignature(_)));
        assert_eq!(client.state(), ClientState::Idle);
        responder.await.unwrap();
    }
}
