use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use thiserror::Error;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep_until;
use tracing::{debug, info, warn};

use crate::client::{ClientKey, ClientRegistry, ClientState, RegistryError, StaticClient};
use crate::connection::{ConnectionError, ConnectionHandle, InjectedPacket, ShardOutcome};
use crate::constants::{DEFAULT_IDLE_TIMEOUT, DEFAULT_MESSAGE_SIZE, HEADER_SIZE};
use crate::server::{
    open_connected, open_listener, spawn_workers, ConfigError, ListenerConfig, ListenerState,
    ReadDisposition, ReplyJob, RequestJob, WorkerContext, WriteOutcome,
};
use crate::types::{CodeSet, PacketAddress, PacketCode, PacketVerifier};

#[derive(Debug, Error)]
pub enum ServerError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Client registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Failed opening UDP socket: {0}")]
    Io(#[from] std::io::Error),
}

/// One bound listener with its worker pool. `run` consumes the server and
/// loops until the socket dies.
pub struct Server {
    state: ListenerState,
    socket: UdpSocket,
    local: SocketAddr,
    use_connected: bool,
    idle_timeout: Duration,

    job_tx: mpsc::Sender<RequestJob>,
    reply_rx: mpsc::Receiver<ReplyJob>,
    worker_ctx: Arc<WorkerContext>,
    workers: Vec<JoinHandle<()>>,
}

impl Server {
    /// Bind the listener socket and start the worker pool.
    pub fn bind(
        config: &ListenerConfig,
        statics: Vec<StaticClient>,
        allowed: CodeSet,
        verifier: Arc<dyn PacketVerifier>,
        worker_ctx: Arc<WorkerContext>,
        workers: usize,
    ) -> Result<Self, ServerError> {
        config.validate()?;

        let address = config.address()?;
        let port = config.resolve_port()?;
        let bind = SocketAddr::new(address, port);

        let (socket, reuse_port) = open_listener(
            bind,
            config.interface.as_deref(),
            config.recv_buff,
            config.connected,
        )?;
        let local = socket.local_addr()?;
        let use_connected = config.connected && reuse_port;

        let mut registry =
            ClientRegistry::with_max_connections(config.limits(), config.max_connections())?;
        for client in statics {
            registry.add_static(client)?;
        }

        let name = format!("proto udp address {} port {}", local.ip(), local.port());
        info!("Listening on radius address {name}");

        let mut state = ListenerState::new(
            name,
            registry,
            allowed,
            config.cleanup_delay(),
            verifier,
        );
        for code in [
            PacketCode::AccessRequest,
            PacketCode::AccountingRequest,
            PacketCode::CoaRequest,
            PacketCode::DisconnectRequest,
            PacketCode::StatusServer,
        ] {
            state.set_priority(code, config.priority_for(code));
        }

        let (job_tx, job_rx) = mpsc::channel(1024);
        let (reply_tx, reply_rx) = mpsc::channel(1024);
        let handles = spawn_workers(workers.max(1), worker_ctx.clone(), job_rx, reply_tx);

        let idle_timeout = config
            .limits()
            .map(|l| l.idle_timeout)
            .unwrap_or(DEFAULT_IDLE_TIMEOUT);

        Ok(Self {
            state,
            socket,
            local,
            use_connected,
            idle_timeout,
            job_tx,
            reply_rx,
            worker_ctx,
            workers: handles,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }

    pub fn stats(&self) -> crate::server::ListenerStats {
        self.state.stats.clone()
    }

    /// The master event loop: socket reads, worker replies and timers.
    pub async fn run(mut self) -> Result<(), ServerError> {
        let mut buf = vec![0u8; DEFAULT_MESSAGE_SIZE];

        loop {
            let deadline = self.state.next_deadline();

            tokio::select! {
                result = self.socket.recv_from(&mut buf) => {
                    match result {
                        Ok((len, src)) => {
                            let now = Instant::now();
                            let disposition =
                                self.state.receive(&buf[..len], src, self.local, 0, now);
                            self.apply(disposition, now).await;
                        }
                        Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                        Err(err) => {
                            // Fatal for the socket; let the caller decide.
                            warn!(%err, "read error on listener socket");
                            return Err(err.into());
                        }
                    }
                }

                reply = self.reply_rx.recv() => {
                    let Some(reply) = reply else {
                        debug!("all workers gone, shutting down listener");
                        return Ok(());
                    };
                    let now = Instant::now();
                    match self.state.handle_reply(reply, now) {
                        WriteOutcome::Send { reply, to } => self.send(&reply, to).await,
                        WriteOutcome::Redispatch(job) => {
                            let _ = self.job_tx.send(job).await;
                        }
                        WriteOutcome::Nothing => {}
                    }

                    // A define may have unblocked a queue of packets.
                    while let Some(disposition) = self.state.next_pending() {
                        let now = Instant::now();
                        self.apply(disposition, now).await;
                    }
                }

                _ = maybe_sleep(deadline) => {
                    self.state.expire(Instant::now());
                }
            }
        }
    }

    async fn apply(&mut self, disposition: ReadDisposition, now: Instant) {
        match disposition {
            ReadDisposition::Drop => {}
            ReadDisposition::Dispatch(job) => {
                if self.job_tx.send(job).await.is_err() {
                    warn!("worker queue closed, dropping packet");
                }
            }
            ReadDisposition::Resend { reply, to } => self.send(&reply, to).await,
            ReadDisposition::Shard {
                client,
                address,
                buffer,
            } => self.shard(client, address, buffer, now),
        }
    }

    async fn send(&mut self, reply: &[u8], to: SocketAddr) {
        if reply.len() < HEADER_SIZE {
            return;
        }
        if let Err(err) = self.socket.send_to(reply, to).await {
            self.state.socket_error(&err);
        }
    }

    /// Drain the job queue and wait for the workers to finish.
    pub async fn shutdown(self) {
        drop(self.job_tx);
        for handle in self.workers {
            let _ = handle.await;
        }
    }

    /// Route a packet to its per-flow child socket, spawning the child on
    /// first use.
    fn shard(&mut self, client_key: ClientKey, address: PacketAddress, buffer: Vec<u8>, now: Instant) {
        if !self.use_connected {
            return;
        }

        let Some(client) = self.state.registry.get(client_key) else {
            return;
        };
        let Some(connections) = client.connections.clone() else {
            return;
        };

        let pending = client.state == ClientState::Pending;
        let child_def = StaticClient {
            network: client.prefix,
            secret: String::from_utf8_lossy(&client.secret).into_owned(),
            shortname: client.shortname.clone(),
            require_message_authenticator: client.require_message_authenticator,
            use_connected: false,
        };
        let dynamic = client.dynamic;

        let local = self.local;
        let worker_ctx = self.worker_ctx.clone();
        let verifier = self.state.verifier.clone();
        let allowed = self.state.allowed.clone();
        let cleanup_delay = self.state.cleanup_delay;
        let idle_timeout = self.idle_timeout;

        let outcome = connections.shard(address.tuple(), buffer, now, |key| {
            let socket = open_connected(local, key.src)?;
            let (tx, rx) = mpsc::channel(256);
            let handle = ConnectionHandle::new(*key, tx);
            if pending {
                // No socket reads until the client is defined.
                handle.pause();
            }
            let (dead, paused) = handle.flags();

            let name = format!(
                "proto udp connected socket from client {} port {} to address {} port {}",
                key.src.ip(),
                key.src.port(),
                local.ip(),
                local.port()
            );

            let mut registry =
                ClientRegistry::new(None).map_err(|_| ConnectionError::CloneFailed)?;
            registry
                .add_child(child_def.clone(), pending, dynamic)
                .map_err(|_| ConnectionError::CloneFailed)?;

            let mut state =
                ListenerState::new(name.clone(), registry, allowed.clone(), cleanup_delay, verifier.clone());
            state.connected = true;

            info!("starting connection {name}");
            tokio::spawn(run_connection(
                socket,
                rx,
                dead,
                paused,
                state,
                worker_ctx.clone(),
                idle_timeout,
            ));
            Ok(handle)
        });

        match outcome {
            ShardOutcome::Injected | ShardOutcome::Spawned => {}
            ShardOutcome::Nak | ShardOutcome::Dead => {}
            ShardOutcome::Dropped => {
                self.state.stats.total_packets_dropped += 1;
            }
        }
    }
}

async fn maybe_sleep(deadline: Option<Instant>) {
    match deadline {
        Some(at) => sleep_until(at.into()).await,
        None => std::future::pending().await,
    }
}

/// The child side of a connected socket: one flow, its own tracking, its
/// own event loop. Requests are processed in order on this task, so the
/// flow never needs cross-connection synchronization.
pub async fn run_connection(
    socket: UdpSocket,
    mut inject_rx: mpsc::Receiver<InjectedPacket>,
    dead: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    mut state: ListenerState,
    ctx: Arc<WorkerContext>,
    idle_timeout: Duration,
) {
    let Ok(local) = socket.local_addr() else {
        dead.store(true, Ordering::Release);
        return;
    };
    let Ok(peer) = socket.peer_addr() else {
        dead.store(true, Ordering::Release);
        return;
    };

    let mut buf = vec![0u8; DEFAULT_MESSAGE_SIZE];
    let mut last_activity = Instant::now();

    loop {
        if dead.load(Ordering::Acquire) {
            break;
        }

        let reading = !paused.load(Ordering::Acquire);

        tokio::select! {
            injected = inject_rx.recv() => {
                match injected {
                    Some(packet) => {
                        last_activity = Instant::now();
                        process_connection_packet(
                            &socket, &mut state, &ctx, &packet.buffer, peer, local, packet.recv_time,
                        )
                        .await;

                        // The define may have completed; resume reads.
                        if paused.load(Ordering::Acquire) && !state.has_pending_client() {
                            paused.store(false, Ordering::Release);
                        }
                    }
                    None => break,
                }
            }

            result = socket.recv(&mut buf), if reading => {
                match result {
                    Ok(len) => {
                        last_activity = Instant::now();
                        let now = Instant::now();
                        process_connection_packet(
                            &socket, &mut state, &ctx, &buf[..len], peer, local, now,
                        )
                        .await;
                    }
                    Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => {}
                    Err(err) => {
                        warn!(listener = %state.name, %err, "connection socket error");
                        break;
                    }
                }
            }

            _ = tokio::time::sleep(idle_timeout.min(Duration::from_secs(30))) => {
                if last_activity.elapsed() >= idle_timeout {
                    debug!(listener = %state.name, "idle timeout for connection");
                    break;
                }
                state.expire(Instant::now());
            }
        }
    }

    dead.store(true, Ordering::Release);
    debug!(listener = %state.name, "connection closed");
}

/// Process one packet fully on the child task: classify, run the worker
/// path inline, then write the reply straight back to the connected
/// socket.
async fn process_connection_packet(
    socket: &UdpSocket,
    state: &mut ListenerState,
    ctx: &Arc<WorkerContext>,
    buffer: &[u8],
    peer: SocketAddr,
    local: SocketAddr,
    recv_time: Instant,
) {
    let mut next = Some(state.receive(buffer, peer, local, 0, recv_time));

    while let Some(disposition) = next.take() {
        match disposition {
            ReadDisposition::Drop | ReadDisposition::Shard { .. } => {}
            ReadDisposition::Resend { reply, .. } => {
                if let Err(err) = socket.send(&reply).await {
                    state.socket_error(&err);
                }
            }
            ReadDisposition::Dispatch(job) => {
                let reply = ctx.process(job).await;
                let now = Instant::now();
                let mut outcome = state.handle_reply(reply, now);

                loop {
                    match outcome {
                        WriteOutcome::Send { reply, to: _ } => {
                            if let Err(err) = socket.send(&reply).await {
                                state.socket_error(&err);
                            }
                            break;
                        }
                        WriteOutcome::Redispatch(job) => {
                            let reply = ctx.process(job).await;
                            outcome = state.handle_reply(reply, Instant::now());
                        }
                        WriteOutcome::Nothing => break,
                    }
                }

                // Resuming a promoted connection also drains its backlog.
                if let Some(pending) = state.next_pending() {
                    next = Some(pending);
                }
            }
        }
    }
}
