use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use thiserror::Error;
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::types::AddressTuple;

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Too many open connections")]
    TooManyConnections,

    #[error("Failed opening connected socket: {0}")]
    Socket(#[from] std::io::Error),

    #[error("Connection inject queue is full")]
    QueueFull,

    #[error("Failed cloning client for connection")]
    CloneFailed,

    #[error("Connection is dead")]
    Dead,
}

/// A packet handed from the master socket to a child connection, as if the
/// child had read it from the network itself.
#[derive(Debug)]
pub struct InjectedPacket {
    pub buffer: Vec<u8>,
    pub recv_time: Instant,
}

/// Parent-side handle to a child connection.
///
/// The child owns its socket and task; the parent only ever touches the
/// inject queue and the shared flags. Death is signalled by the child and
/// observed by the parent on the next packet.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub key: AddressTuple,
    tx: mpsc::Sender<InjectedPacket>,
    dead: Arc<AtomicBool>,
    paused: Arc<AtomicBool>,
    nak: bool,
}

impl ConnectionHandle {
    pub fn new(key: AddressTuple, tx: mpsc::Sender<InjectedPacket>) -> Self {
        Self {
            key,
            tx,
            dead: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            nak: false,
        }
    }

    /// A placeholder entry for a connection whose dynamic definition was
    /// refused. It keeps the key occupied so packets for the flow are
    /// dropped instead of respawning a socket.
    pub fn new_nak(key: AddressTuple) -> Self {
        let (tx, _rx) = mpsc::channel(1);
        Self {
            key,
            tx,
            dead: Arc::new(AtomicBool::new(false)),
            paused: Arc::new(AtomicBool::new(false)),
            nak: true,
        }
    }

    pub fn is_nak(&self) -> bool {
        self.nak
    }

    pub fn is_dead(&self) -> bool {
        self.dead.load(Ordering::Acquire)
    }

    /// Child-side flag handles.
    pub fn flags(&self) -> (Arc<AtomicBool>, Arc<AtomicBool>) {
        (self.dead.clone(), self.paused.clone())
    }

    pub fn mark_dead(&self) {
        self.dead.store(true, Ordering::Release);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Acquire)
    }

    /// Pause socket reads while the connection's client is pending; the
    /// child task honors the flag before polling its socket.
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Release);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Release);
    }

    pub fn inject(&self, buffer: Vec<u8>, recv_time: Instant) -> Result<(), ConnectionError> {
        if self.is_dead() {
            return Err(ConnectionError::Dead);
        }

        self.tx
            .try_send(InjectedPacket { buffer, recv_time })
            .map_err(|_| ConnectionError::QueueFull)
    }
}

/// Result of pushing a packet through the sharder.
#[derive(Debug, PartialEq, Eq)]
pub enum ShardOutcome {
    /// Delivered to an existing connection.
    Injected,
    /// A new connection was spawned for the flow and got the packet.
    Spawned,
    /// The flow is negatively cached; the packet was dropped.
    Nak,
    /// The connection was dead; the entry was removed and the packet
    /// dropped. The next packet for the flow will respawn it.
    Dead,
    /// Dropped: over quota, spawn failure or full queue.
    Dropped,
}

/// The per-client set of connected child sockets, hashed by full 4-tuple
/// plus interface. One mutex per client; connections never create peer
/// connections.
#[derive(Debug)]
pub struct ConnectionSet {
    inner: Mutex<HashMap<AddressTuple, ConnectionHandle>>,
    max_connections: u32,
}

impl ConnectionSet {
    pub fn new(max_connections: u32) -> Self {
        Self {
            inner: Mutex::new(HashMap::new()),
            max_connections,
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn find(&self, key: &AddressTuple) -> Option<ConnectionHandle> {
        self.inner.lock().unwrap().get(key).cloned()
    }

    pub fn remove(&self, key: &AddressTuple) -> Option<ConnectionHandle> {
        self.inner.lock().unwrap().remove(key)
    }

    /// Replace a NAK placeholder (or stale entry) with a fresh handle.
    pub fn insert(&self, handle: ConnectionHandle) {
        self.inner.lock().unwrap().insert(handle.key, handle);
    }

    /// Route one packet to the flow's connection, spawning it on first use.
    ///
    /// `spawn` opens the connected socket and starts the child task; it is
    /// only invoked while the set is under quota. Spawn failures drop the
    /// packet: the peer will retransmit.
    pub fn shard<F>(
        &self,
        key: AddressTuple,
        buffer: Vec<u8>,
        recv_time: Instant,
        spawn: F,
    ) -> ShardOutcome
    where
        F: FnOnce(&AddressTuple) -> Result<ConnectionHandle, ConnectionError>,
    {
        let mut inner = self.inner.lock().unwrap();

        if let Some(handle) = inner.get(&key) {
            if handle.is_nak() {
                debug!(%key, "Discarding packet to NAKed connection");
                return ShardOutcome::Nak;
            }

            if handle.is_dead() {
                debug!(%key, "Removing dead connection");
                inner.remove(&key);
                return ShardOutcome::Dead;
            }

            return match handle.inject(buffer, recv_time) {
                Ok(()) => ShardOutcome::Injected,
                Err(err) => {
                    debug!(%key, %err, "Failed injecting packet");
                    ShardOutcome::Dropped
                }
            };
        }

        if inner.len() as u32 >= self.max_connections {
            debug!(%key, "Too many open connections. Discarding packet");
            return ShardOutcome::Dropped;
        }

        let handle = match spawn(&key) {
            Ok(handle) => handle,
            Err(err) => {
                error!(%key, %err, "Failed to allocate connection. Discarding packet");
                return ShardOutcome::Dropped;
            }
        };

        let outcome = match handle.inject(buffer, recv_time) {
            Ok(()) => ShardOutcome::Spawned,
            Err(_) => ShardOutcome::Dropped,
        };

        inner.insert(key, handle);
        outcome
    }

    /// Drop every connection, waking the children so they notice.
    pub fn close_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        for handle in inner.values() {
            handle.mark_dead();
        }
        inner.clear();
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use super::*;

    fn tuple(src_port: u16) -> AddressTuple {
        AddressTuple {
            src: SocketAddr::from(([203, 0, 113, 7], src_port)),
            dst: SocketAddr::from(([203, 0, 113, 1], 1812)),
            if_index: 0,
        }
    }

    fn handle(key: AddressTuple) -> (ConnectionHandle, mpsc::Receiver<InjectedPacket>) {
        let (tx, rx) = mpsc::channel(8);
        (ConnectionHandle::new(key, tx), rx)
    }

    #[test]
    fn two_flows_get_two_connections() {
        let set = ConnectionSet::new(16);
        let now = Instant::now();
        let mut receivers = Vec::new();

        for port in [1000, 1001] {
            let outcome = set.shard(tuple(port), vec![1, 2, 3], now, |key| {
                let (h, rx) = handle(*key);
                receivers.push((port, rx));
                Ok(h)
            });
            assert_eq!(outcome, ShardOutcome::Spawned);
        }

        assert_eq!(set.len(), 2);

        // Packets stay on their own flow.
        set.shard(tuple(1000), vec![9], now, |_| unreachable!());
        {
            let (_, rx_a) = &mut receivers[0];
            assert_eq!(rx_a.try_recv().unwrap().buffer, vec![1, 2, 3]);
            assert_eq!(rx_a.try_recv().unwrap().buffer, vec![9]);
        }
        let (_, rx_b) = &mut receivers[1];
        assert_eq!(rx_b.try_recv().unwrap().buffer, vec![1, 2, 3]);
        assert!(rx_b.try_recv().is_err());
    }

    #[test]
    fn quota_rejects_new_flows() {
        let set = ConnectionSet::new(1);
        let now = Instant::now();
        let (h, _rx) = handle(tuple(1000));
        set.insert(h);

        let outcome = set.shard(tuple(1001), vec![0], now, |_| unreachable!());
        assert_eq!(outcome, ShardOutcome::Dropped);
    }

    #[test]
    fn dead_connection_is_reaped_on_next_packet() {
        let set = ConnectionSet::new(4);
        let now = Instant::now();
        let (h, _rx) = handle(tuple(1000));
        h.mark_dead();
        set.insert(h);

        assert_eq!(
            set.shard(tuple(1000), vec![0], now, |_| unreachable!()),
            ShardOutcome::Dead
        );
        assert!(set.is_empty());
    }

    #[test]
    fn nak_connection_swallows_packets() {
        let set = ConnectionSet::new(4);
        set.insert(ConnectionHandle::new_nak(tuple(1000)));

        assert_eq!(
            set.shard(tuple(1000), vec![0], Instant::now(), |_| unreachable!()),
            ShardOutcome::Nak
        );
    }

    #[test]
    fn spawn_failure_drops_packet() {
        let set = ConnectionSet::new(4);
        let outcome = set.shard(tuple(1000), vec![0], Instant::now(), |_| {
            Err(ConnectionError::TooManyConnections)
        });
        assert_eq!(outcome, ShardOutcome::Dropped);
        assert!(set.is_empty());
    }

    #[test]
    fn pause_resume_round_trip() {
        let (h, _rx) = handle(tuple(1000));
        assert!(!h.is_paused());
        h.pause();
        assert!(h.is_paused());
        h.resume();
        assert!(!h.is_paused());
    }
}
