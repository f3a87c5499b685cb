use std::time::Duration;

/// Fixed RADIUS header: code, id, length, request authenticator.
pub const HEADER_SIZE: usize = 20;

/// Largest datagram we will read off the wire.
pub const DEFAULT_MESSAGE_SIZE: usize = 4096;

pub const AUTH_VECTOR_SIZE: usize = 16;

pub const SERVER_PORT: u16 = 1812;
pub const ACCT_PORT: u16 = 1813;

pub const MAX_PACKET_CODE: u8 = 52;

/// `cleanup_delay` bounds (seconds). Only Access-Request replies are cached.
pub const MAX_CLEANUP_DELAY_SECS: u64 = 30;
pub const DEFAULT_CLEANUP_DELAY_SECS: u64 = 5;

/// Kernel receive buffer floor, in bytes.
pub const MIN_RECV_BUFF: usize = 32;

pub const DEFAULT_MAX_CLIENTS: u32 = 65536;
pub const DEFAULT_MAX_PENDING_CLIENTS: u32 = 256;
pub const DEFAULT_MAX_PENDING_PACKETS: u32 = 65536;
pub const DEFAULT_MAX_CONNECTIONS: u32 = 65536;

pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(600);
pub const DEFAULT_NAK_LIFETIME: Duration = Duration::from_secs(30);
pub const DEFAULT_CHECK_INTERVAL: Duration = Duration::from_secs(30);

pub const DEFAULT_MAX_REQUEST_TIME: Duration = Duration::from_secs(30);

/// Negative cache population cap, shared by all sources.
pub const MAX_NEGATIVE_CLIENTS: u32 = 1024;

/// Nesting limit for `foreach` blocks.
pub const MAX_FOREACH_DEPTH: usize = 8;
