use std::cmp::Ordering;
use std::collections::BinaryHeap;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ipnetwork::IpNetwork;
use thiserror::Error;
use tracing::{debug, info};

use crate::connection::ConnectionSet;
use crate::constants::{
    DEFAULT_CHECK_INTERVAL, DEFAULT_IDLE_TIMEOUT, DEFAULT_MAX_CLIENTS,
    DEFAULT_MAX_PENDING_CLIENTS, DEFAULT_MAX_PENDING_PACKETS, DEFAULT_NAK_LIFETIME,
    MAX_NEGATIVE_CLIENTS,
};
use crate::tracking::{TrackingKey, TrackingTable};
use crate::trie::{PrefixTrie, TrieError};
use crate::types::{PacketAddress, Priority};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Too many dynamic clients are defined")]
    TooManyClients,

    #[error("Too many pending dynamic clients")]
    TooManyPendingClients,

    #[error("Source IP address {0} was not within a known network")]
    UnknownNetwork(IpAddr),

    #[error(transparent)]
    Trie(#[from] TrieError),
}

#[derive(Debug, Error)]
pub enum PromoteError {
    #[error("Client IP address {client} IP version does not match the source network {network}")]
    FamilyMismatch { client: IpNetwork, network: IpNetwork },

    #[error("Client IP address {client} is not within the defined network {network}")]
    OutsideNetwork { client: IpNetwork, network: IpNetwork },

    #[error("Cannot define a dynamic client as a network")]
    NotHostPrefix,

    #[error("Client is not pending")]
    NotPending,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientState {
    /// From static configuration at startup; never idle-expires.
    Static,
    /// Dynamically learned, definition still running; packets queue.
    Pending,
    /// Dynamically learned and accepted; idle-expires.
    Dynamic,
    /// Negative cache entry; drops packets until it expires.
    Nak,
    /// Placeholder on a child socket; all traffic lives on the child.
    Connected,
}

/// A statically configured client.
#[derive(Debug, Clone)]
pub struct StaticClient {
    pub network: IpNetwork,
    pub secret: String,
    pub shortname: String,
    pub require_message_authenticator: bool,
    pub use_connected: bool,
}

/// What the dynamic-client policy hands back when it accepts a source.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientDefinition {
    pub ipaddr: IpNetwork,
    pub secret: String,
    pub shortname: String,
    pub require_message_authenticator: bool,
    pub use_connected: bool,
}

/// Result of running the defining policy for a pending client.
///
/// On the wire this is a 1-octet NAK sentinel (0x01), a 1-octet retry
/// sentinel (0x00), or a serialized [`ClientDefinition`].
#[derive(Debug)]
pub enum DefineOutcome {
    Accept(Box<ClientDefinition>),
    Nak,
    Retry,
}

/// A packet queued while its client is being defined (or parked for a
/// connected socket).
#[derive(Debug)]
pub struct PendingPacket {
    pub buffer: Vec<u8>,
    pub priority: Priority,
    pub recv_time: Instant,
    pub track: TrackingKey,
}

impl PartialEq for PendingPacket {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingPacket {}

impl Ord for PendingPacket {
    fn cmp(&self, other: &Self) -> Ordering {
        // Highest priority first; at equal priority, oldest first.
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.recv_time.cmp(&self.recv_time))
    }
}

impl PartialOrd for PendingPacket {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

#[derive(Debug)]
struct PendingClientRef {
    priority: Priority,
    recv_time: Instant,
    client: ClientKey,
}

impl PartialEq for PendingClientRef {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for PendingClientRef {}

impl Ord for PendingClientRef {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .cmp(&other.priority)
            .then_with(|| other.recv_time.cmp(&self.recv_time))
    }
}

impl PartialOrd for PendingClientRef {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Index of a client inside the registry arena. Stable for the lifetime of
/// the client; slots are recycled after removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ClientKey(usize);

#[derive(Debug)]
pub struct Client {
    pub state: ClientState,

    /// The network this client was learned from. For static clients this
    /// is the configured prefix itself.
    pub network: IpNetwork,

    /// The client's own address/prefix; key of the registry trie.
    pub prefix: IpNetwork,

    pub secret: Arc<[u8]>,
    pub shortname: String,

    pub dynamic: bool,
    pub active: bool,
    pub use_connected: bool,
    pub require_message_authenticator: bool,

    /// Live packets being processed. Excludes packets still queued in the
    /// pending heap.
    pub packets: u32,

    pending: BinaryHeap<PendingPacket>,

    pub table: TrackingTable,

    /// Child connections, present only when `use_connected` is set.
    pub connections: Option<Arc<ConnectionSet>>,

    pub ready_to_delete: bool,
    pub expires_at: Option<Instant>,

    in_master_heap: bool,
}

impl Client {
    pub fn outstanding(&self) -> u32 {
        self.packets + self.pending.len() as u32
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// The packet that would drain next; for pending clients this is the
    /// defining packet.
    pub fn peek_pending(&self) -> Option<&PendingPacket> {
        self.pending.peek()
    }

    /// The client is in use again; cancel any idle cleanup.
    pub fn touch(&mut self) {
        self.expires_at = None;
        self.ready_to_delete = false;
    }
}

/// Limits and timers for dynamically learned clients.
#[derive(Debug, Clone)]
pub struct DynamicClientLimits {
    pub networks: Vec<IpNetwork>,
    pub max_clients: u32,
    pub max_pending_clients: u32,
    pub max_pending_packets: u32,
    pub idle_timeout: Duration,
    pub nak_lifetime: Duration,
    pub check_interval: Duration,
}

impl Default for DynamicClientLimits {
    fn default() -> Self {
        Self {
            networks: Vec::new(),
            max_clients: DEFAULT_MAX_CLIENTS,
            max_pending_clients: DEFAULT_MAX_PENDING_CLIENTS,
            max_pending_packets: DEFAULT_MAX_PENDING_PACKETS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            nak_lifetime: DEFAULT_NAK_LIFETIME,
            check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

/// What to queue after a packet arrives for a pending client.
#[derive(Debug, PartialEq, Eq)]
pub enum QueueOutcome {
    /// First packet: run the dynamic definition with it.
    Define,
    /// Cached until the client has been defined.
    Queued,
    /// Per-client pending quota reached; the packet was dropped.
    Dropped,
}

/// The registry of everything we are willing to talk to: a trie of client
/// prefixes over an arena of client records, plus the allowed dynamic
/// networks and the cross-client pending heap.
///
/// Owned and mutated exclusively by the listener's network task.
#[derive(Debug)]
pub struct ClientRegistry {
    clients: Vec<Option<Client>>,
    free: Vec<usize>,
    trie: PrefixTrie<ClientKey>,
    networks: PrefixTrie<IpNetwork>,
    pending_clients: BinaryHeap<PendingClientRef>,

    limits: DynamicClientLimits,
    dynamic_enabled: bool,
    max_connections: u32,

    pub num_clients: u32,
    pub num_pending_clients: u32,
    pub num_pending_packets: u32,
    pub num_negative_clients: u32,
}

impl ClientRegistry {
    pub fn new(dynamic: Option<DynamicClientLimits>) -> Result<Self, RegistryError> {
        Self::with_max_connections(dynamic, crate::constants::DEFAULT_MAX_CONNECTIONS)
    }

    pub fn with_max_connections(
        dynamic: Option<DynamicClientLimits>,
        max_connections: u32,
    ) -> Result<Self, RegistryError> {
        let dynamic_enabled = dynamic.is_some();
        let limits = dynamic.unwrap_or_default();

        let mut networks = PrefixTrie::new();
        for network in &limits.networks {
            networks.insert(*network, *network)?;
        }

        Ok(Self {
            clients: Vec::new(),
            free: Vec::new(),
            trie: PrefixTrie::new(),
            networks,
            pending_clients: BinaryHeap::new(),
            limits,
            dynamic_enabled,
            max_connections,
            num_clients: 0,
            num_pending_clients: 0,
            num_pending_packets: 0,
            num_negative_clients: 0,
        })
    }

    pub fn dynamic_enabled(&self) -> bool {
        self.dynamic_enabled
    }

    pub fn limits(&self) -> &DynamicClientLimits {
        &self.limits
    }

    pub fn get(&self, key: ClientKey) -> Option<&Client> {
        self.clients.get(key.0).and_then(|slot| slot.as_ref())
    }

    pub fn get_mut(&mut self, key: ClientKey) -> Option<&mut Client> {
        self.clients.get_mut(key.0).and_then(|slot| slot.as_mut())
    }

    pub fn find(&self, ip: &IpAddr) -> Option<ClientKey> {
        self.trie.lookup(ip).map(|(_, key)| *key)
    }

    /// Every live client key; the order is arbitrary.
    pub fn keys(&self) -> Vec<ClientKey> {
        self.clients
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| slot.as_ref().map(|_| ClientKey(index)))
            .collect()
    }

    /// The allowed dynamic network enclosing `ip`, if any.
    pub fn network_for(&self, ip: &IpAddr) -> Option<IpNetwork> {
        self.networks.lookup(ip).map(|(_, network)| *network)
    }

    fn alloc(&mut self, client: Client) -> Result<ClientKey, RegistryError> {
        let prefix = client.prefix;
        let key = match self.free.pop() {
            Some(index) => {
                self.clients[index] = Some(client);
                ClientKey(index)
            }
            None => {
                self.clients.push(Some(client));
                ClientKey(self.clients.len() - 1)
            }
        };

        if let Err(err) = self.trie.insert(prefix, key) {
            self.clients[key.0] = None;
            self.free.push(key.0);
            return Err(err.into());
        }

        Ok(key)
    }

    pub fn add_static(&mut self, def: StaticClient) -> Result<ClientKey, RegistryError> {
        let use_connected = def.use_connected;
        let max_connections = self.max_connections;
        let client = Client {
            state: ClientState::Static,
            network: def.network,
            prefix: def.network,
            secret: def.secret.into_bytes().into(),
            shortname: def.shortname,
            dynamic: false,
            active: true,
            use_connected,
            require_message_authenticator: def.require_message_authenticator,
            packets: 0,
            pending: BinaryHeap::new(),
            table: TrackingTable::new(false),
            connections: use_connected.then(|| Arc::new(ConnectionSet::new(max_connections))),
            ready_to_delete: false,
            expires_at: None,
            in_master_heap: false,
        };
        self.alloc(client)
    }

    /// Add the cloned client record backing one child connection. Its
    /// tracking table ignores addresses: every packet on a connected
    /// socket belongs to the same peer.
    pub fn add_child(
        &mut self,
        def: StaticClient,
        pending: bool,
        dynamic: bool,
    ) -> Result<ClientKey, RegistryError> {
        let client = Client {
            state: if pending {
                ClientState::Pending
            } else {
                ClientState::Connected
            },
            network: def.network,
            prefix: def.network,
            secret: def.secret.into_bytes().into(),
            shortname: def.shortname,
            dynamic,
            active: !pending,
            use_connected: false,
            require_message_authenticator: def.require_message_authenticator,
            packets: 0,
            pending: BinaryHeap::new(),
            table: TrackingTable::new(true),
            connections: None,
            ready_to_delete: false,
            expires_at: None,
            in_master_heap: false,
        };

        let key = self.alloc(client)?;
        if pending {
            self.num_pending_clients += 1;
        }
        Ok(key)
    }

    /// Lazily create a Pending client for a packet from an allowed network.
    pub fn create_pending(&mut self, address: &PacketAddress) -> Result<ClientKey, RegistryError> {
        let src_ip = address.src_ip();

        if self.num_clients >= self.limits.max_clients {
            return Err(RegistryError::TooManyClients);
        }
        if self.num_pending_clients >= self.limits.max_pending_clients {
            return Err(RegistryError::TooManyPendingClients);
        }

        let network = self
            .network_for(&src_ip)
            .ok_or(RegistryError::UnknownNetwork(src_ip))?;

        debug!(ip = %src_ip, %network, "Found matching network. Checking for dynamic client definition");

        let prefix = IpNetwork::new(src_ip, host_prefix_len(&src_ip))
            .expect("host prefix length is always valid");

        let client = Client {
            state: ClientState::Pending,
            network,
            prefix,
            secret: Arc::from(&b""[..]),
            shortname: src_ip.to_string(),
            dynamic: true,
            active: false,
            use_connected: false,
            require_message_authenticator: false,
            packets: 0,
            pending: BinaryHeap::new(),
            table: TrackingTable::new(false),
            connections: None,
            ready_to_delete: false,
            expires_at: None,
            in_master_heap: false,
        };

        let key = self.alloc(client)?;
        self.num_clients += 1;
        self.num_pending_clients += 1;
        Ok(key)
    }

    /// Queue a packet on a pending client's heap.
    pub fn queue_pending_packet(
        &mut self,
        key: ClientKey,
        buffer: Vec<u8>,
        priority: Priority,
        recv_time: Instant,
        track: TrackingKey,
    ) -> QueueOutcome {
        let max_pending = self.limits.max_pending_packets;
        let Some(client) = self.get_mut(key) else {
            return QueueOutcome::Dropped;
        };

        if client.pending.len() as u32 >= max_pending {
            debug!(client = %client.shortname, "Too many pending packets - ignoring packet");
            return QueueOutcome::Dropped;
        }

        client.pending.push(PendingPacket {
            buffer,
            priority,
            recv_time,
            track,
        });

        self.num_pending_packets += 1;

        let client = self.get(key).unwrap();
        if client.pending.len() == 1 {
            // The first packet runs the dynamic definition.
            QueueOutcome::Define
        } else {
            debug!(
                client = %client.shortname,
                "Client is still being dynamically defined. Caching this packet until the client has been defined"
            );
            QueueOutcome::Queued
        }
    }

    /// Promote a pending client with the definition the policy returned.
    ///
    /// On success the client starts accepting traffic and its queued
    /// packets become eligible via [`ClientRegistry::pop_pending`].
    pub fn promote(
        &mut self,
        key: ClientKey,
        def: ClientDefinition,
    ) -> Result<(), PromoteError> {
        let max_connections = self.max_connections;
        let client = self.get_mut(key).ok_or(PromoteError::NotPending)?;

        if client.state != ClientState::Pending {
            return Err(PromoteError::NotPending);
        }

        let network = client.network;
        if ipnetwork_family(&def.ipaddr) != ipnetwork_family(&network) {
            return Err(PromoteError::FamilyMismatch {
                client: def.ipaddr,
                network,
            });
        }

        // The network prefix must enclose the client the policy defined.
        if network.prefix() > def.ipaddr.prefix() || !network.contains(def.ipaddr.ip()) {
            return Err(PromoteError::OutsideNetwork {
                client: def.ipaddr,
                network,
            });
        }

        if def.ipaddr.prefix() != host_prefix_len(&def.ipaddr.ip()) {
            return Err(PromoteError::NotHostPrefix);
        }

        info!(client = %def.shortname, "Defining new client");

        client.secret = def.secret.into_bytes().into();
        client.shortname = def.shortname;
        client.require_message_authenticator = def.require_message_authenticator;
        client.use_connected = def.use_connected;
        client.dynamic = true;

        if client.use_connected {
            // Stay Pending: each connection will define its own client.
            client.connections = Some(Arc::new(ConnectionSet::new(max_connections)));
        } else {
            client.state = ClientState::Dynamic;
            client.active = true;
        }

        self.num_pending_clients = self.num_pending_clients.saturating_sub(1);
        self.push_master(key);
        Ok(())
    }

    /// Turn a pending client into a negative cache entry, dropping all of
    /// its queued packets and their tracking entries.
    ///
    /// Returns false when the negative cache is full; the client is then
    /// removed outright and the next packet starts a fresh definition.
    pub fn mark_nak(&mut self, key: ClientKey, now: Instant) -> bool {
        let nak_lifetime = self.limits.nak_lifetime;
        let cache_full = self.num_negative_clients >= MAX_NEGATIVE_CLIENTS;

        let Some(client) = self.get_mut(key) else {
            return false;
        };

        let drained = client.pending.len() as u32;
        while let Some(pending) = client.pending.pop() {
            client.table.delete(&pending.track, pending.recv_time);
        }
        self.num_pending_packets = self.num_pending_packets.saturating_sub(drained);
        self.num_pending_clients = self.num_pending_clients.saturating_sub(1);

        if cache_full {
            self.remove(key);
            return false;
        }

        let client = self.get_mut(key).unwrap();
        client.state = ClientState::Nak;
        client.active = false;
        client.expires_at = Some(now + nak_lifetime);
        self.num_negative_clients += 1;
        true
    }

    /// Remove a client and its trie entry.
    pub fn remove(&mut self, key: ClientKey) -> Option<Client> {
        let client = self.clients.get_mut(key.0)?.take()?;
        self.free.push(key.0);
        self.trie.remove(&client.prefix);

        if client.dynamic {
            self.num_clients = self.num_clients.saturating_sub(1);
        }
        if client.state == ClientState::Nak {
            self.num_negative_clients = self.num_negative_clients.saturating_sub(1);
        }

        Some(client)
    }

    fn push_master(&mut self, key: ClientKey) {
        let Some(client) = self.get_mut(key) else {
            return;
        };
        if client.in_master_heap {
            return;
        }
        let Some(head) = client.pending.peek() else {
            return;
        };

        let entry = PendingClientRef {
            priority: head.priority,
            recv_time: head.recv_time,
            client: key,
        };
        client.in_master_heap = true;
        self.pending_clients.push(entry);
    }

    pub fn has_pending(&self) -> bool {
        !self.pending_clients.is_empty()
    }

    /// Pop the next pending packet across all promoted clients, in
    /// (priority desc, receive-time asc) order.
    ///
    /// Packets superseded by a conflicting packet while they waited are
    /// silently discarded.
    pub fn pop_pending(&mut self) -> Option<(ClientKey, PendingPacket)> {
        loop {
            let entry = self.pending_clients.pop()?;
            let key = entry.client;

            let Some(client) = self.get_mut(key) else {
                continue;
            };
            client.in_master_heap = false;

            let Some(pending) = client.pending.pop() else {
                continue;
            };

            let superseded = match client.table.get(&pending.track) {
                Some(track) => track.timestamp != pending.recv_time,
                None => true,
            };

            self.num_pending_packets = self.num_pending_packets.saturating_sub(1);

            // Keep the client in the heap while it has more packets.
            if self.get(key).is_some_and(|c| !c.pending.is_empty()) {
                self.push_master(key);
            }

            if superseded {
                debug!("Discarding old packet");
                continue;
            }

            return Some((key, pending));
        }
    }

    /// Arm the expiry timer appropriate for the client's current state.
    pub fn arm_timer(&mut self, key: ClientKey, now: Instant) {
        let limits = self.limits.clone();
        let Some(client) = self.get_mut(key) else {
            return;
        };

        let delay = match client.state {
            ClientState::Static => return,
            ClientState::Nak => limits.nak_lifetime,
            ClientState::Dynamic | ClientState::Connected => limits.idle_timeout,
            ClientState::Pending => {
                if client.connections.is_some() {
                    limits.check_interval
                } else {
                    limits.idle_timeout
                }
            }
        };

        if delay.is_zero() {
            return;
        }
        client.expires_at = Some(now + delay);
    }

    pub fn next_deadline(&self) -> Option<Instant> {
        self.clients
            .iter()
            .flatten()
            .filter_map(|c| c.expires_at)
            .min()
    }

    /// Run every due client timer. Returns the clients that were deleted.
    pub fn expire(&mut self, now: Instant) -> Vec<ClientKey> {
        let due: Vec<ClientKey> = self
            .clients
            .iter()
            .enumerate()
            .filter_map(|(index, slot)| {
                let client = slot.as_ref()?;
                client
                    .expires_at
                    .is_some_and(|at| at <= now)
                    .then_some(ClientKey(index))
            })
            .collect();

        let mut removed = Vec::new();
        for key in due {
            if self.expire_one(key, now) {
                removed.push(key);
            }
        }
        removed
    }

    fn expire_one(&mut self, key: ClientKey, now: Instant) -> bool {
        let limits = self.limits.clone();
        let Some(client) = self.get_mut(key) else {
            return false;
        };

        debug!(client = %client.shortname, "TIMER - checking status of client");
        client.expires_at = None;

        match client.state {
            ClientState::Static => false,

            ClientState::Nak => {
                debug!(client = %client.shortname, "deleting negative client");
                self.remove(key);
                true
            }

            ClientState::Dynamic | ClientState::Connected => {
                if client.outstanding() > 0 {
                    client.ready_to_delete = false;
                    return false;
                }

                if client.ready_to_delete {
                    debug!(client = %client.shortname, "idle timeout for client");
                    self.remove(key);
                    return true;
                }

                client.ready_to_delete = true;
                client.expires_at = Some(now + limits.idle_timeout);
                false
            }

            ClientState::Pending => {
                // With connections, poll until all children have closed.
                if let Some(connections) = &client.connections {
                    if !connections.is_empty() {
                        client.ready_to_delete = false;
                        client.expires_at = Some(now + limits.check_interval);
                        return false;
                    }
                }

                if client.outstanding() == 0 {
                    debug!(client = %client.shortname, "deleting stalled pending client");
                    let drained = client.pending_len() as u32;
                    // Promoted use_connected parents already left the
                    // pending-client count behind.
                    let promoted = client.connections.is_some();
                    self.num_pending_packets = self.num_pending_packets.saturating_sub(drained);
                    if !promoted {
                        self.num_pending_clients = self.num_pending_clients.saturating_sub(1);
                    }
                    self.remove(key);
                    return true;
                }

                client.ready_to_delete = true;
                false
            }
        }
    }
}

fn host_prefix_len(ip: &IpAddr) -> u8 {
    match ip {
        IpAddr::V4(_) => 32,
        IpAddr::V6(_) => 128,
    }
}

fn ipnetwork_family(network: &IpNetwork) -> u8 {
    match network {
        IpNetwork::V4(_) => 4,
        IpNetwork::V6(_) => 6,
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use crate::types::PacketCode;

    use super::*;

    fn limits() -> DynamicClientLimits {
        DynamicClientLimits {
            networks: vec!["198.51.100.0/24".parse().unwrap()],
            max_pending_packets: 4,
            ..Default::default()
        }
    }

    fn address(last_octet: u8, id: u8) -> PacketAddress {
        PacketAddress::new(
            SocketAddr::from(([198, 51, 100, last_octet], 1000)),
            SocketAddr::from(([203, 0, 113, 1], 1812)),
            PacketCode::AccessRequest,
            id,
        )
    }

    fn packet(id: u8, authenticator: u8) -> Vec<u8> {
        let mut buf = vec![1, id, 0, 20];
        buf.extend_from_slice(&[authenticator; 16]);
        buf
    }

    fn definition(ip: &str) -> ClientDefinition {
        ClientDefinition {
            ipaddr: ip.parse().unwrap(),
            secret: "s3cr3t".into(),
            shortname: "nas1".into(),
            require_message_authenticator: false,
            use_connected: false,
        }
    }

    fn queue(
        registry: &mut ClientRegistry,
        key: ClientKey,
        addr: &PacketAddress,
        auth: u8,
        recv_time: Instant,
    ) -> QueueOutcome {
        let buf = packet(addr.id, auth);
        let client = registry.get_mut(key).unwrap();
        let (_, track) = client
            .table
            .insert(addr, &buf, recv_time, true)
            .map(|(status, track)| (status, track))
            .unwrap();
        registry.queue_pending_packet(key, buf, Priority::HIGH, recv_time, track)
    }

    #[test]
    fn static_client_lookup() {
        let mut registry = ClientRegistry::new(None).unwrap();
        registry
            .add_static(StaticClient {
                network: "203.0.113.7/32".parse().unwrap(),
                secret: "abc".into(),
                shortname: "nas".into(),
                require_message_authenticator: false,
                use_connected: false,
            })
            .unwrap();

        assert!(registry.find(&"203.0.113.7".parse().unwrap()).is_some());
        assert!(registry.find(&"203.0.113.8".parse().unwrap()).is_none());
    }

    #[test]
    fn pending_lifecycle_accept() {
        let mut registry = ClientRegistry::new(Some(limits())).unwrap();
        let now = Instant::now();
        let addr = address(42, 1);

        let key = registry.create_pending(&addr).unwrap();
        assert_eq!(registry.get(key).unwrap().state, ClientState::Pending);
        assert_eq!(registry.num_pending_clients, 1);

        assert_eq!(queue(&mut registry, key, &addr, 1, now), QueueOutcome::Define);
        let addr2 = address(42, 2);
        assert_eq!(queue(&mut registry, key, &addr2, 2, now), QueueOutcome::Queued);

        registry.promote(key, definition("198.51.100.42/32")).unwrap();
        let client = registry.get(key).unwrap();
        assert_eq!(client.state, ClientState::Dynamic);
        assert!(client.active);
        assert_eq!(registry.num_pending_clients, 0);

        // Both queued packets drain in order.
        assert!(registry.pop_pending().is_some());
        assert!(registry.pop_pending().is_some());
        assert!(registry.pop_pending().is_none());
        assert_eq!(registry.num_pending_packets, 0);
    }

    #[test]
    fn pending_packet_bound() {
        let mut registry = ClientRegistry::new(Some(limits())).unwrap();
        let now = Instant::now();
        let key = registry.create_pending(&address(42, 0)).unwrap();

        for id in 0..4 {
            let outcome = queue(&mut registry, key, &address(42, id), id, now);
            assert_ne!(outcome, QueueOutcome::Dropped);
        }

        // The fifth packet exceeds max_pending_packets = 4.
        let outcome = queue(&mut registry, key, &address(42, 4), 4, now);
        assert_eq!(outcome, QueueOutcome::Dropped);
        assert_eq!(registry.get(key).unwrap().pending_len(), 4);
    }

    #[test]
    fn nak_caches_and_expires() {
        let mut registry = ClientRegistry::new(Some(limits())).unwrap();
        let now = Instant::now();
        let addr = address(99, 1);

        let key = registry.create_pending(&addr).unwrap();
        queue(&mut registry, key, &addr, 1, now);

        assert!(registry.mark_nak(key, now));
        let client = registry.get(key).unwrap();
        assert_eq!(client.state, ClientState::Nak);
        assert_eq!(client.pending_len(), 0);
        assert!(client.table.is_empty());
        assert_eq!(registry.num_negative_clients, 1);

        // Still resolvable (and droppable) during the NAK lifetime.
        assert_eq!(registry.find(&addr.src_ip()), Some(key));

        // Expires after nak_lifetime.
        let removed = registry.expire(now + DEFAULT_NAK_LIFETIME + Duration::from_secs(1));
        assert_eq!(removed, vec![key]);
        assert!(registry.find(&addr.src_ip()).is_none());
        assert_eq!(registry.num_negative_clients, 0);
    }

    #[test]
    fn promote_rejects_outside_network() {
        let mut registry = ClientRegistry::new(Some(limits())).unwrap();
        let key = registry.create_pending(&address(42, 1)).unwrap();

        let err = registry
            .promote(key, definition("203.0.113.9/32"))
            .unwrap_err();
        assert!(matches!(err, PromoteError::OutsideNetwork { .. }));
    }

    #[test]
    fn promote_rejects_network_definition() {
        let mut registry = ClientRegistry::new(Some(limits())).unwrap();
        let key = registry.create_pending(&address(42, 1)).unwrap();

        let err = registry
            .promote(key, definition("198.51.100.0/24"))
            .unwrap_err();
        assert!(matches!(err, PromoteError::NotHostPrefix));
    }

    #[test]
    fn pending_client_bounds() {
        let mut limits = limits();
        limits.max_pending_clients = 1;
        let mut registry = ClientRegistry::new(Some(limits)).unwrap();

        registry.create_pending(&address(42, 1)).unwrap();
        let err = registry.create_pending(&address(43, 1)).unwrap_err();
        assert!(matches!(err, RegistryError::TooManyPendingClients));
    }

    #[test]
    fn unknown_network_rejected() {
        let mut registry = ClientRegistry::new(Some(limits())).unwrap();
        let mut addr = address(42, 1);
        addr.src = SocketAddr::from(([192, 0, 2, 1], 1000));
        let err = registry.create_pending(&addr).unwrap_err();
        assert!(matches!(err, RegistryError::UnknownNetwork(_)));
    }

    #[test]
    fn superseded_pending_packet_is_discarded() {
        let mut registry = ClientRegistry::new(Some(limits())).unwrap();
        let t0 = Instant::now();
        let t1 = t0 + Duration::from_millis(10);
        let addr = address(42, 7);

        let key = registry.create_pending(&addr).unwrap();
        queue(&mut registry, key, &addr, 1, t0);

        // A conflicting packet takes over the tracking entry.
        let client = registry.get_mut(key).unwrap();
        client.table.insert(&addr, &packet(7, 2), t1, true).unwrap();

        registry.promote(key, definition("198.51.100.42/32")).unwrap();
        assert!(registry.pop_pending().is_none());
    }

    #[test]
    fn idle_timeout_two_phase() {
        let mut registry = ClientRegistry::new(Some(limits())).unwrap();
        let now = Instant::now();
        let addr = address(42, 1);
        let key = registry.create_pending(&addr).unwrap();
        queue(&mut registry, key, &addr, 1, now);
        registry.promote(key, definition("198.51.100.42/32")).unwrap();
        registry.pop_pending();

        registry.arm_timer(key, now);

        // First expiry only marks ready_to_delete.
        let idle = registry.limits().idle_timeout;
        assert!(registry.expire(now + idle + Duration::from_secs(1)).is_empty());
        assert!(registry.get(key).unwrap().ready_to_delete);

        // Second expiry deletes.
        let removed = registry.expire(now + idle + idle + Duration::from_secs(2));
        assert_eq!(removed, vec![key]);
    }

    #[test]
    fn activity_resets_ready_to_delete() {
        let mut registry = ClientRegistry::new(Some(limits())).unwrap();
        let now = Instant::now();
        let addr = address(42, 1);
        let key = registry.create_pending(&addr).unwrap();
        queue(&mut registry, key, &addr, 1, now);
        registry.promote(key, definition("198.51.100.42/32")).unwrap();
        registry.pop_pending();

        registry.get_mut(key).unwrap().packets = 1;
        registry.arm_timer(key, now);

        let idle = registry.limits().idle_timeout;
        assert!(registry.expire(now + idle + Duration::from_secs(1)).is_empty());
        assert!(!registry.get(key).unwrap().ready_to_delete);
    }
}
