//! Binding the listening socket.
//!
//! Mirrors `validate_port`: resolve the service with `AF_UNSPEC` +
//! `AI_PASSIVE`, try each candidate address, `SO_REUSEADDR`, bind, and
//! listen with a backlog of 50.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6, TcpListener};

use socket2::{Domain, Socket, Type};

use crate::error::{Error, Result};

const LISTEN_BACKLOG: i32 = 50;

/// Candidate addresses reproducing `getaddrinfo(NULL, port, {AI_PASSIVE,
/// AF_UNSPEC})`'s wildcard-bind behavior: `("", port)` doesn't resolve to
/// the wildcard address the way a null `getaddrinfo` node does, so the
/// wildcard addresses are built directly instead of going through
/// `ToSocketAddrs`.
pub fn bind_listener(port: u16) -> Result<TcpListener> {
    let candidates: Vec<SocketAddr> = vec![
        SocketAddr::V6(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)),
        SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port)),
    ];

    let mut last_err = None;
    for addr in candidates {
        match try_bind(addr) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                log::debug!("bind to {addr} failed: {e}");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| Error::Misconfig("bind failed on all addresses".into())))
}

fn try_bind(addr: SocketAddr) -> Result<TcpListener> {
    let domain = if addr.is_ipv6() { Domain::IPV6 } else { Domain::IPV4 };
    let socket = Socket::new(domain, Type::STREAM, None)?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(LISTEN_BACKLOG)?;
    Ok(socket.into())
}
