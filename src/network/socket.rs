//! Socket setup for the multicast channel roles.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, UdpSocket};

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tracing::debug;

use crate::core::ErrorCode;

/// Hop limit for outgoing multicast; discovery never leaves the local segment
const MULTICAST_TTL: u32 = 1;

/// Parses an IPv4 or IPv6 literal, tolerating surrounding brackets
pub fn parse_ip(address: &str) -> Result<IpAddr, ErrorCode> {
    let trimmed = address.trim().trim_start_matches('[').trim_end_matches(']');
    trimmed.parse::<IpAddr>().map_err(|_| {
        debug!("unable to parse '{}' as an IP address", address);
        ErrorCode::ADDRESS_PARSE
    })
}

fn unspecified_like(address: &IpAddr) -> IpAddr {
    match address {
        IpAddr::V4(_) => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        IpAddr::V6(_) => IpAddr::V6(Ipv6Addr::UNSPECIFIED),
    }
}

fn new_udp_socket(target: &SocketAddr) -> Result<Socket, ErrorCode> {
    Socket::new(Domain::for_address(*target), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| ErrorCode::from_io(&e, ErrorCode::INVALID_SOCKET))
}

fn into_std(socket: Socket) -> Result<UdpSocket, ErrorCode> {
    socket
        .set_nonblocking(true)
        .map_err(|e| ErrorCode::from_io(&e, ErrorCode::INVALID_SOCKET))?;
    Ok(socket.into())
}

/// Opens the receive side of a channel.
///
/// With a multicast `group` the socket binds the wildcard address of the group's
/// family on `port` and joins the group on the interface named by `bind`
/// (wildcard means any interface). A unicast `group` is treated as a plain
/// endpoint: the socket binds `bind:port` and joins nothing.
pub fn bind_receiver(bind: &str, group: &str, port: u16) -> Result<UdpSocket, ErrorCode> {
    let bind_ip = parse_ip(bind)?;
    let group_ip = parse_ip(group)?;

    let interface = if bind_ip.is_ipv4() == group_ip.is_ipv4() {
        bind_ip
    } else if bind_ip.is_unspecified() {
        unspecified_like(&group_ip)
    } else {
        return Err(ErrorCode::ADDRESS_FAMILY_NOT_SUPPORTED);
    };

    let local = if group_ip.is_multicast() {
        SocketAddr::new(unspecified_like(&group_ip), port)
    } else {
        SocketAddr::new(interface, port)
    };

    let socket = new_udp_socket(&local)?;
    socket
        .set_reuse_address(true)
        .map_err(|e| ErrorCode::from_io(&e, ErrorCode::BIND))?;
    socket
        .bind(&SockAddr::from(local))
        .map_err(|e| ErrorCode::from_io(&e, ErrorCode::BIND))?;

    match (group_ip, interface) {
        (IpAddr::V4(group), IpAddr::V4(iface)) if group.is_multicast() => {
            socket
                .join_multicast_v4(&group, &iface)
                .map_err(|e| ErrorCode::from_io(&e, ErrorCode::BIND))?;
            let _ = socket.set_multicast_loop_v4(true);
        }
        (IpAddr::V6(group), _) if group.is_multicast() => {
            socket
                .join_multicast_v6(&group, 0)
                .map_err(|e| ErrorCode::from_io(&e, ErrorCode::BIND))?;
            let _ = socket.set_multicast_loop_v6(true);
        }
        _ => {}
    }

    debug!("receiver bound to {} for group {}", local, group_ip);
    into_std(socket)
}

/// Opens the send side of a channel and resolves its target endpoint.
///
/// The socket binds an ephemeral port. Multicast targets get loopback enabled,
/// a hop limit of one and, for IPv4, the outgoing interface named by `interface`.
pub fn bind_sender(
    group: &str,
    port: u16,
    interface: Option<&str>,
) -> Result<(UdpSocket, SocketAddr), ErrorCode> {
    let group_ip = parse_ip(group)?;
    let target = SocketAddr::new(group_ip, port);
    let local = SocketAddr::new(unspecified_like(&group_ip), 0);

    let socket = new_udp_socket(&target)?;
    socket
        .bind(&SockAddr::from(local))
        .map_err(|e| ErrorCode::from_io(&e, ErrorCode::BIND))?;

    match group_ip {
        IpAddr::V4(group) if group.is_multicast() => {
            socket
                .set_multicast_loop_v4(true)
                .map_err(|e| ErrorCode::from_io(&e, ErrorCode::BIND))?;
            let _ = socket.set_multicast_ttl_v4(MULTICAST_TTL);
            if let Some(IpAddr::V4(iface)) = interface.map(parse_ip).transpose()? {
                if !iface.is_unspecified() {
                    socket
                        .set_multicast_if_v4(&iface)
                        .map_err(|e| ErrorCode::from_io(&e, ErrorCode::ADDRESS_NOT_AVAILABLE))?;
                }
            }
        }
        IpAddr::V6(group) if group.is_multicast() => {
            socket
                .set_multicast_loop_v6(true)
                .map_err(|e| ErrorCode::from_io(&e, ErrorCode::BIND))?;
            let _ = socket.set_multicast_hops_v6(MULTICAST_TTL);
        }
        _ => {}
    }

    Ok((into_std(socket)?, target))
}
