//! Socket creation and option pass-through.
//!
//! Sockets are created with `socket2` so options can be applied before
//! bind, then handed to mio for readiness registration.

use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::time::Duration;

use mio::net::{TcpListener, TcpStream, UdpSocket};
use socket2::{Domain, Protocol, SockRef, Socket, Type};

/// Default listen backlog.
pub const DEFAULT_BACKLOG: i32 = 128;

/// Protocol family of outgoing datagram sockets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressFamily {
    Inet,
    Inet6,
}

impl AddressFamily {
    fn of(addr: &SocketAddr) -> Self {
        match addr {
            SocketAddr::V4(_) => AddressFamily::Inet,
            SocketAddr::V6(_) => AddressFamily::Inet6,
        }
    }

    fn domain(self) -> Domain {
        match self {
            AddressFamily::Inet => Domain::IPV4,
            AddressFamily::Inet6 => Domain::IPV6,
        }
    }

    fn unspecified(self) -> SocketAddr {
        match self {
            AddressFamily::Inet => (Ipv4Addr::UNSPECIFIED, 0).into(),
            AddressFamily::Inet6 => (Ipv6Addr::UNSPECIFIED, 0).into(),
        }
    }
}

/// Options applied to TCP sockets of a crusher.
///
/// `None` leaves the system default in place.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpSocketOptions {
    pub nodelay: Option<bool>,
    pub keep_alive: Option<bool>,
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
    /// Listen backlog of the bound socket.
    pub backlog: i32,
}

impl Default for TcpSocketOptions {
    fn default() -> Self {
        Self {
            nodelay: None,
            keep_alive: None,
            recv_buffer_size: None,
            send_buffer_size: None,
            backlog: DEFAULT_BACKLOG,
        }
    }
}

impl TcpSocketOptions {
    fn apply(&self, socket: SockRef<'_>) -> io::Result<()> {
        if let Some(nodelay) = self.nodelay {
            socket.set_nodelay(nodelay)?;
        }
        if let Some(keep_alive) = self.keep_alive {
            socket.set_keepalive(keep_alive)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        Ok(())
    }
}

/// Options applied to UDP sockets of a crusher.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatagramSocketOptions {
    pub broadcast: Option<bool>,
    /// Family of the per-client outgoing sockets. Defaults to the family of
    /// the connect address.
    pub family: Option<AddressFamily>,
    pub recv_buffer_size: Option<usize>,
    pub send_buffer_size: Option<usize>,
}

impl DatagramSocketOptions {
    fn apply(&self, socket: &Socket) -> io::Result<()> {
        if let Some(broadcast) = self.broadcast {
            socket.set_broadcast(broadcast)?;
        }
        if let Some(size) = self.recv_buffer_size {
            socket.set_recv_buffer_size(size)?;
        }
        if let Some(size) = self.send_buffer_size {
            socket.set_send_buffer_size(size)?;
        }
        Ok(())
    }
}

/// Bind a non-blocking listener with `SO_REUSEADDR`.
pub(crate) fn tcp_listen(addr: SocketAddr, options: &TcpSocketOptions) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    if let Some(size) = options.recv_buffer_size {
        // Inherited by accepted sockets, so it must be set before listen
        socket.set_recv_buffer_size(size)?;
    }
    socket.bind(&addr.into())?;
    socket.listen(options.backlog)?;

    Ok(TcpListener::from_std(socket.into()))
}

/// Start a non-blocking connect to `addr`. Completion is signalled by
/// writable readiness.
pub(crate) fn tcp_connect(addr: SocketAddr, options: &TcpSocketOptions) -> io::Result<TcpStream> {
    let stream = TcpStream::connect(addr)?;
    options.apply(SockRef::from(&stream))?;
    Ok(stream)
}

pub(crate) fn tcp_configure(stream: &TcpStream, options: &TcpSocketOptions) -> io::Result<()> {
    options.apply(SockRef::from(stream))
}

/// Outcome of polling a connecting stream.
#[derive(Debug)]
pub(crate) enum ConnectState {
    Connected,
    InProgress,
}

/// Check whether a non-blocking connect finished.
pub(crate) fn tcp_connect_state(stream: &TcpStream) -> io::Result<ConnectState> {
    if let Some(e) = stream.take_error()? {
        return Err(e);
    }
    match stream.peer_addr() {
        Ok(_) => Ok(ConnectState::Connected),
        Err(e) if e.kind() == io::ErrorKind::NotConnected => Ok(ConnectState::InProgress),
        Err(e) => Err(e),
    }
}

/// Make the next close send RST instead of FIN.
pub(crate) fn tcp_abort(stream: &TcpStream) {
    let _ = SockRef::from(stream).set_linger(Some(Duration::ZERO));
}

/// Bind the client-facing datagram socket.
pub(crate) fn udp_bind(addr: SocketAddr, options: &DatagramSocketOptions) -> io::Result<UdpSocket> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_nonblocking(true)?;
    options.apply(&socket)?;
    socket.bind(&addr.into())?;

    Ok(UdpSocket::from_std(socket.into()))
}

/// Open a datagram socket on an ephemeral port, connected to `remote`.
pub(crate) fn udp_connect(remote: SocketAddr, options: &DatagramSocketOptions) -> io::Result<UdpSocket> {
    let family = options.family.unwrap_or_else(|| AddressFamily::of(&remote));
    let socket = Socket::new(family.domain(), Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    options.apply(&socket)?;
    socket.bind(&family.unspecified().into())?;
    socket.connect(&remote.into())?;

    Ok(UdpSocket::from_std(socket.into()))
}
