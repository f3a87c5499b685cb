use std::cmp::Ordering;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};

use crate::types::PacketCode;

/// Everything we know about where a packet came from and where it was
/// received, plus the (code, id) pair used for duplicate detection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PacketAddress {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub if_index: u32,

    pub code: PacketCode,
    pub id: u8,
}

impl PacketAddress {
    pub fn new(src: SocketAddr, dst: SocketAddr, code: PacketCode, id: u8) -> Self {
        Self {
            src,
            dst,
            if_index: 0,
            code,
            id,
        }
    }

    pub fn src_ip(&self) -> IpAddr {
        self.src.ip()
    }

    pub fn tuple(&self) -> AddressTuple {
        AddressTuple {
            src: self.src,
            dst: self.dst,
            if_index: self.if_index,
        }
    }
}

impl Display for PacketAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

/// The 4-tuple plus receiving interface. Keys connections and (for
/// unconnected sockets) tracking entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressTuple {
    pub src: SocketAddr,
    pub dst: SocketAddr,
    pub if_index: u32,
}

impl Ord for AddressTuple {
    fn cmp(&self, other: &Self) -> Ordering {
        // Ports first: they're the cheapest discriminator and the most
        // likely to differ behind a NAT.
        self.src
            .port()
            .cmp(&other.src.port())
            .then_with(|| self.dst.port().cmp(&other.dst.port()))
            .then_with(|| self.if_index.cmp(&other.if_index))
            .then_with(|| self.src.ip().cmp(&other.src.ip()))
            .then_with(|| self.dst.ip().cmp(&other.dst.ip()))
    }
}

impl PartialOrd for AddressTuple {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Display for AddressTuple {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.src, self.dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(src_port: u16, dst_port: u16) -> AddressTuple {
        AddressTuple {
            src: SocketAddr::from(([203, 0, 113, 7], src_port)),
            dst: SocketAddr::from(([203, 0, 113, 1], dst_port)),
            if_index: 0,
        }
    }

    #[test]
    fn orders_by_ports_first() {
        assert!(addr(1000, 1812) < addr(1001, 1812));
        assert!(addr(1000, 1812) < addr(1000, 1813));
        assert_eq!(addr(1000, 1812), addr(1000, 1812));
    }
}
