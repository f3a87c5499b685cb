use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, trace};

use crate::client::{ClientKey, ClientRegistry, ClientState, DefineOutcome, QueueOutcome};
use crate::constants::HEADER_SIZE;
use crate::tracking::{TrackingKey, TrackingStatus};
use crate::types::{
    validate_datagram, CodeSet, PacketAddress, PacketCode, PacketVerifier, Priority, ProtocolError,
};

/// Per-listener counters. Owned by the network task; read via snapshots.
#[derive(Debug, Default, Clone)]
pub struct ListenerStats {
    pub total_requests: u64,
    pub total_responses: u64,
    pub total_dup_requests: u64,
    pub total_malformed_requests: u64,
    pub total_unknown_types: u64,
    pub total_invalid_requests: u64,
    pub total_bad_authenticators: u64,
    pub total_packets_dropped: u64,
    /// Unique pieces of work handed to the worker pool.
    pub worker_dispatches: u64,
}

/// Work for the worker pool.
#[derive(Debug)]
pub struct RequestJob {
    pub buffer: Vec<u8>,
    pub address: PacketAddress,
    pub recv_time: Instant,
    pub priority: Priority,
    /// Retransmission of a request another worker may already be
    /// answering; the reply path discards whichever loses the race.
    pub is_dup: bool,
    pub client: ClientKey,
    pub secret: Arc<[u8]>,
    /// Run the dynamic-client definition policy instead of normal
    /// processing.
    pub define: bool,
    pub track: TrackingKey,
}

/// A worker's verdict coming back to the network task.
#[derive(Debug)]
pub struct ReplyJob {
    pub client: ClientKey,
    pub track: TrackingKey,
    pub request_time: Instant,
    /// Encoded reply; anything shorter than a RADIUS header means "do not
    /// respond".
    pub reply: Vec<u8>,
    /// Present for define jobs.
    pub define: Option<DefineOutcome>,
}

/// What the read path decided about one datagram.
#[derive(Debug)]
pub enum ReadDisposition {
    /// Hand to the worker pool.
    Dispatch(RequestJob),
    /// Duplicate with a cached reply: retransmit without dispatch.
    Resend { reply: Vec<u8>, to: SocketAddr },
    /// Route to a per-flow connected socket.
    Shard {
        client: ClientKey,
        address: PacketAddress,
        buffer: Vec<u8>,
    },
    /// Dropped; counters say why.
    Drop,
}

/// What the write path decided about one reply.
#[derive(Debug)]
pub enum WriteOutcome {
    Send { reply: Vec<u8>, to: SocketAddr },
    /// A define came back with "retry": run the definition again.
    Redispatch(RequestJob),
    Nothing,
}

/// The transport-independent core of the master I/O path: tracking,
/// client lifecycle and reply caching. The async shell owns the socket
/// and feeds this state; everything here is synchronous and
/// deterministic.
pub struct ListenerState {
    pub name: String,
    pub registry: ClientRegistry,
    pub allowed: CodeSet,
    pub cleanup_delay: Duration,
    pub verifier: Arc<dyn PacketVerifier>,
    pub stats: ListenerStats,
    /// This state runs a connected child socket; the single client's
    /// tracking ignores addresses.
    pub connected: bool,
    priority_overrides: Vec<(PacketCode, Priority)>,
}

impl ListenerState {
    pub fn new(
        name: impl Into<String>,
        registry: ClientRegistry,
        allowed: CodeSet,
        cleanup_delay: Duration,
        verifier: Arc<dyn PacketVerifier>,
    ) -> Self {
        Self {
            name: name.into(),
            registry,
            allowed,
            cleanup_delay,
            verifier,
            stats: ListenerStats::default(),
            connected: false,
            priority_overrides: Vec::new(),
        }
    }

    pub fn set_priority(&mut self, code: PacketCode, priority: Priority) {
        self.priority_overrides.push((code, priority));
    }

    fn priority_for(&self, code: PacketCode) -> Priority {
        self.priority_overrides
            .iter()
            .find(|(c, _)| *c == code)
            .map(|(_, p)| *p)
            .unwrap_or_else(|| code.default_priority())
    }

    /// Classify one datagram. This is `read` minus the socket: dedup,
    /// client lookup and creation, pending queuing and shard routing.
    pub fn receive(
        &mut self,
        buffer: &[u8],
        src: SocketAddr,
        dst: SocketAddr,
        if_index: u32,
        now: Instant,
    ) -> ReadDisposition {
        let header = match validate_datagram(buffer, &self.allowed) {
            Ok(header) => header,
            Err(err) => {
                match err {
                    ProtocolError::TooShort(size) => {
                        debug!(listener = %self.name, size, "got 'too short' packet");
                        self.stats.total_malformed_requests += 1;
                    }
                    ProtocolError::BadLength { .. } => {
                        debug!(listener = %self.name, "got a packet which isn't RADIUS");
                        self.stats.total_malformed_requests += 1;
                    }
                    ProtocolError::InvalidCode(code) => {
                        debug!(listener = %self.name, code, "got invalid packet code");
                        self.stats.total_unknown_types += 1;
                    }
                    ProtocolError::DisallowedCode(code) => {
                        debug!(listener = %self.name, %code, "got unexpected packet code");
                        self.stats.total_unknown_types += 1;
                    }
                }
                return ReadDisposition::Drop;
            }
        };

        let mut address = PacketAddress::new(src, dst, header.code, header.id);
        address.if_index = if_index;

        let client_key = match self.registry.find(&src.ip()) {
            Some(key) => key,
            None => {
                if !self.registry.dynamic_enabled() {
                    return self.unknown_client(&address);
                }
                match self.registry.create_pending(&address) {
                    Ok(key) => key,
                    Err(err) => {
                        debug!(listener = %self.name, %err, "ignoring packet");
                        return self.unknown_client(&address);
                    }
                }
            }
        };

        let client = self
            .registry
            .get(client_key)
            .expect("looked-up client exists");

        // Negative cache entry. Drop the packet.
        if client.state == ClientState::Nak {
            trace!(listener = %self.name, client = %client.shortname, "dropping packet for NAKed client");
            return ReadDisposition::Drop;
        }

        // Connected sockets take the whole flow; tracking happens on the
        // child.
        if client.use_connected && client.connections.is_some() && !self.connected {
            return ReadDisposition::Shard {
                client: client_key,
                address,
                buffer: buffer.to_vec(),
            };
        }

        if client.state == ClientState::Pending {
            return self.receive_pending(client_key, &address, buffer, now);
        }

        // Active client: verify the packet signature before tracking it.
        let secret = client.secret.clone();
        if !self.verifier.verify(buffer, &secret) {
            debug!(listener = %self.name, "packet failed verification");
            self.stats.total_bad_authenticators += 1;
            return ReadDisposition::Drop;
        }

        let priority = self.priority_for(address.code);
        let cleanup_delay = self.cleanup_delay;
        let client = self
            .registry
            .get_mut(client_key)
            .expect("looked-up client exists");

        let (status, track) = match client.table.insert(&address, buffer, now, false) {
            Ok(result) => result,
            Err(err) => {
                debug!(listener = %self.name, %err, "failed tracking packet - discarding it");
                self.stats.total_packets_dropped += 1;
                return ReadDisposition::Drop;
            }
        };

        let mut is_dup = false;
        let mut recv_time = now;

        match status {
            TrackingStatus::Unused => {
                self.stats.total_packets_dropped += 1;
                return ReadDisposition::Drop;
            }

            TrackingStatus::Same => {
                self.stats.total_dup_requests += 1;
                let entry = client.table.get_mut(&track).expect("entry just touched");

                // The cleanup delay counts from the last retransmission we
                // answered, not the first.
                if entry.cleanup_at.is_some() {
                    entry.cleanup_at = Some(now + cleanup_delay);
                }

                if entry.reply_suppressed {
                    // We are intentionally not responding.
                    return ReadDisposition::Drop;
                }

                if let Some(reply) = &entry.reply {
                    return ReadDisposition::Resend {
                        reply: reply.clone(),
                        to: address.src,
                    };
                }

                // No reply yet: let the worker see it, flagged so the
                // losing answer is discarded.
                is_dup = true;
                recv_time = entry.timestamp;
            }

            TrackingStatus::New | TrackingStatus::Updated | TrackingStatus::Conflicting => {}
        }

        client.packets += 1;
        client.touch();

        self.stats.total_requests += 1;
        self.stats.worker_dispatches += 1;

        ReadDisposition::Dispatch(RequestJob {
            buffer: buffer.to_vec(),
            address,
            recv_time,
            priority,
            is_dup,
            client: client_key,
            secret,
            define: false,
            track,
        })
    }

    /// Queue a packet for a client whose definition is still running; the
    /// first packet also carries the definition work.
    fn receive_pending(
        &mut self,
        client_key: ClientKey,
        address: &PacketAddress,
        buffer: &[u8],
        now: Instant,
    ) -> ReadDisposition {
        let priority = self.priority_for(address.code);
        let client = self
            .registry
            .get_mut(client_key)
            .expect("pending client exists");

        let (status, track) = match client.table.insert(address, buffer, now, true) {
            Ok(result) => result,
            Err(err) => {
                debug!(listener = %self.name, %err, "failed tracking packet - discarding it");
                self.stats.total_packets_dropped += 1;
                return ReadDisposition::Drop;
            }
        };

        if status == TrackingStatus::Unused {
            self.stats.total_packets_dropped += 1;
            return ReadDisposition::Drop;
        }

        let secret = client.secret.clone();
        match self
            .registry
            .queue_pending_packet(client_key, buffer.to_vec(), priority, now, track)
        {
            QueueOutcome::Dropped => {
                self.stats.total_packets_dropped += 1;
                ReadDisposition::Drop
            }
            QueueOutcome::Queued => ReadDisposition::Drop,
            QueueOutcome::Define => {
                // Mark the tracking entry as defining a dynamic client.
                if let Some(client) = self.registry.get_mut(client_key) {
                    if let Some(entry) = client.table.get_mut(&track) {
                        entry.dynamic = Some(now);
                    }
                }

                self.stats.worker_dispatches += 1;
                ReadDisposition::Dispatch(RequestJob {
                    buffer: buffer.to_vec(),
                    address: *address,
                    recv_time: now,
                    priority,
                    is_dup: false,
                    client: client_key,
                    secret,
                    define: true,
                    track,
                })
            }
        }
    }

    fn unknown_client(&mut self, address: &PacketAddress) -> ReadDisposition {
        info!(
            listener = %self.name,
            src = %address.src,
            "Packet from unknown client - ignoring"
        );
        self.stats.total_invalid_requests += 1;
        ReadDisposition::Drop
    }

    /// Drain one packet queued behind a (now defined) client.
    pub fn next_pending(&mut self) -> Option<ReadDisposition> {
        let (client_key, pending) = self.registry.pop_pending()?;
        let client = self.registry.get_mut(client_key)?;

        // Promoted clients that use connected sockets shard their backlog
        // instead of processing it here.
        if client.use_connected && client.connections.is_some() {
            let mut address = client.table.get(&pending.track)?.address;
            address.code = PacketCode::try_from(pending.buffer[0]).ok()?;
            address.id = pending.buffer[1];
            client.table.delete(&pending.track, pending.recv_time);
            return Some(ReadDisposition::Shard {
                client: client_key,
                address,
                buffer: pending.buffer,
            });
        }

        client.packets += 1;
        client.touch();
        let secret = client.secret.clone();
        let address = client.table.get(&pending.track)?.address;

        self.stats.total_requests += 1;
        self.stats.worker_dispatches += 1;

        Some(ReadDisposition::Dispatch(RequestJob {
            buffer: pending.buffer,
            address,
            recv_time: pending.recv_time,
            priority: pending.priority,
            is_dup: false,
            client: client_key,
            secret,
            define: false,
            track: pending.track,
        }))
    }

    /// Handle a worker's reply: dynamic-define results, conflict
    /// suppression, reply caching and cleanup scheduling.
    pub fn handle_reply(&mut self, reply: ReplyJob, now: Instant) -> WriteOutcome {
        if let Some(outcome) = reply.define {
            return self.handle_define(reply.client, outcome, now);
        }

        let cleanup_delay = self.cleanup_delay;
        let Some(client) = self.registry.get_mut(reply.client) else {
            return WriteOutcome::Nothing;
        };

        let Some(entry) = client.table.get(&reply.track) else {
            // Entry already cleaned up (e.g. a conflict was processed
            // first); nothing to send.
            return WriteOutcome::Nothing;
        };

        // The original packet has been superseded by a conflicting one;
        // the peer would never accept this response.
        if entry.timestamp != reply.request_time {
            debug!(listener = %self.name, "Suppressing reply as we have a newer packet");
            self.stats.total_packets_dropped += 1;
            client.table.release(&reply.track);
            client.packets = client.packets.saturating_sub(1);
            self.arm_idle(reply.client, now);
            return WriteOutcome::Nothing;
        }

        // A duplicate raced us and the original already answered: resend
        // the cached reply instead of the loser's.
        if let Some(cached) = &entry.reply {
            let cached = cached.clone();
            let to = entry.address.src;
            client.table.release(&reply.track);
            client.packets = client.packets.saturating_sub(1);
            self.arm_idle(reply.client, now);
            return WriteOutcome::Send { reply: cached, to };
        }

        let code = entry.address.code;
        let to = entry.address.src;
        let respond = reply.reply.len() >= HEADER_SIZE;

        client.table.attach_reply(&reply.track, &reply.reply);

        // Access-Request replies stay cached for the cleanup delay; other
        // codes release as soon as the reply is on the wire.
        if code == PacketCode::AccessRequest && !cleanup_delay.is_zero() {
            client
                .table
                .schedule_cleanup(&reply.track, now + cleanup_delay);
        } else {
            client.table.release(&reply.track);
            client.packets = client.packets.saturating_sub(1);
        }

        self.arm_idle(reply.client, now);

        if respond {
            self.stats.total_responses += 1;
            WriteOutcome::Send {
                reply: reply.reply,
                to,
            }
        } else {
            trace!(listener = %self.name, "Got NAK, not writing reply");
            WriteOutcome::Nothing
        }
    }

    fn handle_define(
        &mut self,
        client_key: ClientKey,
        outcome: DefineOutcome,
        now: Instant,
    ) -> WriteOutcome {
        match outcome {
            DefineOutcome::Accept(definition) => {
                if let Err(err) = self.registry.promote(client_key, *definition) {
                    debug!(listener = %self.name, %err, "rejecting dynamic client definition");
                    self.registry.mark_nak(client_key, now);
                }
                WriteOutcome::Nothing
            }

            DefineOutcome::Nak => {
                self.registry.mark_nak(client_key, now);
                WriteOutcome::Nothing
            }

            DefineOutcome::Retry => {
                debug!(
                    listener = %self.name,
                    "Request has timed out trying to define a new client. Trying again"
                );
                let Some(client) = self.registry.get(client_key) else {
                    return WriteOutcome::Nothing;
                };
                let Some(pending) = client.peek_pending() else {
                    return WriteOutcome::Nothing;
                };

                let Some(entry) = client.table.get(&pending.track) else {
                    return WriteOutcome::Nothing;
                };

                self.stats.worker_dispatches += 1;
                WriteOutcome::Redispatch(RequestJob {
                    buffer: pending.buffer.clone(),
                    address: entry.address,
                    recv_time: pending.recv_time,
                    priority: pending.priority,
                    is_dup: false,
                    client: client_key,
                    secret: client.secret.clone(),
                    define: true,
                    track: pending.track,
                })
            }
        }
    }

    fn arm_idle(&mut self, client_key: ClientKey, now: Instant) {
        let Some(client) = self.registry.get(client_key) else {
            return;
        };
        if client.state == ClientState::Static {
            return;
        }
        if client.outstanding() == 0 {
            self.registry.arm_timer(client_key, now);
        }
    }

    /// Run all due timers: per-entry cleanup delays, then client expiry.
    pub fn expire(&mut self, now: Instant) {
        for key in self.registry.keys() {
            let Some(client) = self.registry.get_mut(key) else {
                continue;
            };
            let released = client.table.expire(now);
            if released > 0 {
                client.packets = client.packets.saturating_sub(released);
                self.arm_idle(key, now);
            }
        }

        for removed in self.registry.expire(now) {
            debug!(listener = %self.name, ?removed, "client expired");
        }
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        let clients = self.registry.next_deadline();
        let tracking = self
            .registry
            .keys()
            .into_iter()
            .filter_map(|key| self.registry.get(key))
            .filter_map(|client| client.table.next_deadline())
            .min();

        match (clients, tracking) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Any client still waiting for its dynamic definition?
    pub fn has_pending_client(&self) -> bool {
        self.registry
            .keys()
            .into_iter()
            .filter_map(|key| self.registry.get(key))
            .any(|client| client.state == ClientState::Pending)
    }

    /// Dead socket on write: log and let the shell close it.
    pub fn socket_error(&mut self, err: &std::io::Error) {
        error!(listener = %self.name, %err, "socket error on write");
        self.stats.total_packets_dropped += 1;
    }
}
