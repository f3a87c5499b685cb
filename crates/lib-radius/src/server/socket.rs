use std::io;
use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;
use tracing::warn;

use crate::constants::MIN_RECV_BUFF;

/// Open the master UDP socket for a listener.
///
/// `reuse_port` is required for connected child sockets to share the
/// listener address; when the kernel refuses it the caller disables
/// connected sockets and carries on.
pub fn open_listener(
    bind: SocketAddr,
    interface: Option<&str>,
    recv_buff: Option<usize>,
    reuse_port: bool,
) -> io::Result<(UdpSocket, bool)> {
    let socket = new_udp_socket(&bind)?;

    let mut reuse_port_ok = false;
    if reuse_port {
        match socket.set_reuse_port(true) {
            Ok(()) => reuse_port_ok = true,
            Err(err) => {
                warn!(%err, "Failed to set socket 'reuseport': disabling connected sockets");
            }
        }
    }

    if let Some(size) = recv_buff {
        socket.set_recv_buffer_size(size.max(MIN_RECV_BUFF))?;
    }

    bind_interface(&socket, interface)?;
    socket.bind(&bind.into())?;

    Ok((into_tokio(socket)?, reuse_port_ok))
}

/// Open a connected child socket sharing the listener address, so replies
/// originate from the server port and the kernel steers the flow to this
/// socket.
pub fn open_connected(local: SocketAddr, peer: SocketAddr) -> io::Result<UdpSocket> {
    let socket = new_udp_socket(&local)?;
    socket.set_reuse_port(true)?;
    socket.bind(&local.into())?;
    socket.connect(&peer.into())?;
    into_tokio(socket)
}

fn new_udp_socket(addr: &SocketAddr) -> io::Result<Socket> {
    let domain = match addr {
        SocketAddr::V4(_) => Domain::IPV4,
        SocketAddr::V6(_) => Domain::IPV6,
    };
    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    Ok(socket)
}

#[cfg(target_os = "linux")]
fn bind_interface(socket: &Socket, interface: Option<&str>) -> io::Result<()> {
    if let Some(name) = interface {
        socket.bind_device(Some(name.as_bytes()))?;
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn bind_interface(_socket: &Socket, interface: Option<&str>) -> io::Result<()> {
    if interface.is_some() {
        warn!("'interface' is only supported on Linux; ignoring");
    }
    Ok(())
}

fn into_tokio(socket: Socket) -> io::Result<UdpSocket> {
    UdpSocket::from_std(socket.into())
}

/// Resolve a UDP service name (`port_name`) against /etc/services.
pub fn lookup_service(name: &str) -> Option<u16> {
    let contents = std::fs::read_to_string("/etc/services").ok()?;

    for line in contents.lines() {
        let line = line.split('#').next().unwrap_or_default().trim();
        if line.is_empty() {
            continue;
        }

        let mut fields = line.split_whitespace();
        let service = fields.next()?;
        let Some(port_proto) = fields.next() else {
            continue;
        };
        let Some((port, proto)) = port_proto.split_once('/') else {
            continue;
        };
        if proto != "udp" {
            continue;
        }

        let aliases: Vec<&str> = fields.collect();
        if service == name || aliases.contains(&name) {
            return port.parse().ok();
        }
    }

    None
}
