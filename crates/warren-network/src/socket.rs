//! Non-blocking endpoint over TCP, UNIX-domain and UDP sockets.
//!
//! One `Socket` wraps one file descriptor plus the bookkeeping the reactor
//! needs: listen/connect role, protocol, flow direction, connection state and
//! activity timestamps. All I/O retries `EINTR` internally and reports
//! `EAGAIN` as a benign zero-length transfer.

use std::{
    ffi::CString,
    mem,
    net::Ipv4Addr,
    os::fd::RawFd,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use tracing::warn;

use crate::{NetError, NetResult};

/// Sentinel for a closed or never-opened descriptor.
pub const FD_UNKNOWN: RawFd = -1;

/// `listen()` backlog, also the reactor wait capacity.
pub const LISTEN_BACKLOG: usize = 511;

const LISTEN_SNDBUF: libc::c_int = 0x0040_0000;
const ACCEPTED_SNDBUF: libc::c_int = 0x0030_0000;
const CONNECT_SNDBUF: libc::c_int = 100 * 1024;
const USER_TIMEOUT_MS: libc::c_uint = 10_000;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockType {
    Listen,
    Connect,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockProto {
    Tcp,
    Udp,
    Unix,
    /// TCP carrying HTTP framing; identical at this layer.
    Http,
    Channel,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockFlag {
    Send,
    Recv,
    Bidi,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SockState {
    Unconnected,
    Listened,
    Connected,
}

pub(crate) fn unix_micros() -> i64 {
    SystemTime::now().duration_since(UNIX_EPOCH).map_or(0, |d| d.as_micros() as i64)
}

pub(crate) fn setsockopt<T>(
    fd: RawFd,
    level: libc::c_int,
    name: libc::c_int,
    value: &T,
    ctx: &'static str,
) -> NetResult<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            (value as *const T).cast::<libc::c_void>(),
            mem::size_of::<T>() as libc::socklen_t,
        )
    };
    if rc == -1 { Err(NetError::io(ctx)) } else { Ok(()) }
}

pub(crate) fn set_nonblock_fd(fd: RawFd, ctx: &'static str) -> NetResult<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL, 0) };
    if flags == -1 {
        return Err(NetError::io(ctx));
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } == -1 {
        return Err(NetError::io(ctx));
    }
    Ok(())
}

fn sockaddr_in(host: &str, port: u16) -> NetResult<libc::sockaddr_in> {
    let addr: Ipv4Addr = host
        .parse()
        .map_err(|_| NetError::InvalidArgument("sockaddr_in", "not an IPv4 address"))?;
    let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
    sa.sin_family = libc::AF_INET as libc::sa_family_t;
    sa.sin_port = port.to_be();
    sa.sin_addr.s_addr = u32::from(addr).to_be();
    Ok(sa)
}

fn sockaddr_un(path: &str) -> NetResult<(libc::sockaddr_un, libc::socklen_t)> {
    let mut sa: libc::sockaddr_un = unsafe { mem::zeroed() };
    sa.sun_family = libc::AF_UNIX as libc::sa_family_t;
    let bytes = path.as_bytes();
    if bytes.is_empty() || bytes.len() >= sa.sun_path.len() {
        return Err(NetError::InvalidArgument("sockaddr_un", "bad path length"));
    }
    for (dst, src) in sa.sun_path.iter_mut().zip(bytes) {
        *dst = *src as libc::c_char;
    }
    let len = (mem::size_of::<libc::sa_family_t>() + bytes.len() + 1) as libc::socklen_t;
    Ok((sa, len))
}

/// Unified endpoint handle.
pub struct Socket {
    fd: RawFd,
    kind: SockType,
    proto: SockProto,
    flag: SockFlag,
    state: SockState,
    host: String,
    port: u16,
    make_tm: i64,
    recv_tm: i64,
    send_tm: i64,
    keep_alive: bool,
    /// Last datagram peer, for UDP replies.
    peer: Option<libc::sockaddr_in>,
}

impl Socket {
    pub fn new(kind: SockType, proto: SockProto) -> Self {
        Self {
            fd: FD_UNKNOWN,
            kind,
            proto,
            flag: SockFlag::Bidi,
            state: SockState::Unconnected,
            host: String::new(),
            port: 0,
            make_tm: unix_micros(),
            recv_tm: 0,
            send_tm: 0,
            keep_alive: false,
            peer: None,
        }
    }

    /// Wraps a descriptor returned by `accept`.
    pub fn from_accepted(fd: RawFd, proto: SockProto, host: String, port: u16) -> Self {
        let mut s = Self::new(SockType::Connect, proto);
        s.fd = fd;
        s.host = host;
        s.port = port;
        s.state = SockState::Connected;
        s
    }

    pub fn with_flag(mut self, flag: SockFlag) -> Self {
        self.flag = flag;
        self
    }

    pub fn with_keepalive(mut self) -> Self {
        self.keep_alive = true;
        self
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    #[inline]
    pub fn kind(&self) -> SockType {
        self.kind
    }

    #[inline]
    pub fn proto(&self) -> SockProto {
        self.proto
    }

    #[inline]
    pub fn flag(&self) -> SockFlag {
        self.flag
    }

    #[inline]
    pub fn state(&self) -> SockState {
        self.state
    }

    #[inline]
    pub fn set_state(&mut self, state: SockState) {
        self.state = state;
    }

    #[inline]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[inline]
    pub fn port(&self) -> u16 {
        self.port
    }

    #[inline]
    pub fn make_tm(&self) -> i64 {
        self.make_tm
    }

    /// Creates the descriptor and applies the protocol's base options.
    pub fn open(&mut self) -> NetResult<()> {
        let (domain, ty) = match self.proto {
            SockProto::Tcp | SockProto::Http => (libc::AF_INET, libc::SOCK_STREAM),
            SockProto::Udp => (libc::AF_INET, libc::SOCK_DGRAM),
            SockProto::Unix => (libc::AF_UNIX, libc::SOCK_STREAM),
            SockProto::Channel => {
                return Err(NetError::InvalidArgument("Socket::open", "channel uses socketpair"));
            }
        };

        let fd = unsafe { libc::socket(domain, ty, 0) };
        if fd == -1 {
            return Err(NetError::io("Socket::open socket()"));
        }
        self.fd = fd;

        if matches!(self.proto, SockProto::Tcp | SockProto::Http) {
            let on: libc::c_int = 1;
            setsockopt(fd, libc::SOL_SOCKET, libc::SO_REUSEADDR, &on, "Socket::open SO_REUSEADDR")?;
            let ling = libc::linger { l_onoff: 0, l_linger: 0 };
            setsockopt(fd, libc::SOL_SOCKET, libc::SO_LINGER, &ling, "Socket::open SO_LINGER")?;
            if self.keep_alive {
                self.set_keepalive(30, 30, 3)?;
            }
        }
        Ok(())
    }

    pub fn bind(&mut self, host: &str, port: u16) -> NetResult<()> {
        self.host = host.to_owned();
        self.port = port;

        let rc = match self.proto {
            SockProto::Tcp | SockProto::Http | SockProto::Udp => {
                let sa = sockaddr_in(host, port)?;
                unsafe {
                    libc::bind(
                        self.fd,
                        (&sa as *const libc::sockaddr_in).cast(),
                        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                }
            }
            SockProto::Unix => {
                // A previous run may have left the path behind.
                unlink_path(host);
                let (sa, len) = sockaddr_un(host)?;
                unsafe { libc::bind(self.fd, (&sa as *const libc::sockaddr_un).cast(), len) }
            }
            SockProto::Channel => {
                return Err(NetError::InvalidArgument("Socket::bind", "channel is unaddressed"));
            }
        };
        if rc == -1 {
            return Err(NetError::io("Socket::bind bind()"));
        }
        Ok(())
    }

    /// Binds and starts listening; UDP endpoints only bind and go straight to
    /// `Connected` since datagrams have no accept step.
    pub fn listen(&mut self, host: &str, port: u16) -> NetResult<()> {
        self.bind(host, port)?;

        if self.proto == SockProto::Udp {
            self.state = SockState::Connected;
            return self.set_nonblock();
        }

        setsockopt(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &LISTEN_SNDBUF,
            "Socket::listen SO_SNDBUF",
        )?;
        if unsafe { libc::listen(self.fd, LISTEN_BACKLOG as libc::c_int) } == -1 {
            return Err(NetError::io("Socket::listen listen()"));
        }
        self.state = SockState::Listened;
        self.set_nonblock()
    }

    /// Connects outward, optionally bounded by `timeout`.
    pub fn connect(&mut self, host: &str, port: u16, timeout: Option<Duration>) -> NetResult<()> {
        self.host = host.to_owned();
        self.port = port;

        if matches!(self.proto, SockProto::Tcp | SockProto::Http) {
            setsockopt(
                self.fd,
                libc::SOL_SOCKET,
                libc::SO_SNDBUF,
                &CONNECT_SNDBUF,
                "Socket::connect SO_SNDBUF",
            )?;
        }
        if timeout.is_some() {
            self.set_nonblock()?;
        }

        let rc = match self.proto {
            SockProto::Unix => {
                let (sa, len) = sockaddr_un(host)?;
                unsafe { libc::connect(self.fd, (&sa as *const libc::sockaddr_un).cast(), len) }
            }
            _ => {
                let sa = sockaddr_in(host, port)?;
                unsafe {
                    libc::connect(
                        self.fd,
                        (&sa as *const libc::sockaddr_in).cast(),
                        mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                    )
                }
            }
        };

        if rc == -1 {
            let Some(timeout) = timeout else {
                return Err(NetError::io("Socket::connect connect()"));
            };
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                return Err(NetError::Io { ctx: "Socket::connect connect()", source: err });
            }
            self.wait_connected(timeout)?;
        }

        self.state = SockState::Connected;
        Ok(())
    }

    /// Waits for an in-progress connect, then checks `SO_ERROR`.
    fn wait_connected(&self, timeout: Duration) -> NetResult<()> {
        let mut pfd =
            libc::pollfd { fd: self.fd, events: libc::POLLIN | libc::POLLOUT, revents: 0 };
        loop {
            let rc = unsafe { libc::poll(&mut pfd, 1, timeout.as_millis() as libc::c_int) };
            if rc == -1 {
                if std::io::Error::last_os_error().raw_os_error() == Some(libc::EINTR) {
                    continue;
                }
                return Err(NetError::io("Socket::connect poll()"));
            }
            if rc == 0 {
                return Err(NetError::Timeout);
            }
            let mut val: libc::c_int = 0;
            let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
            let rc = unsafe {
                libc::getsockopt(
                    self.fd,
                    libc::SOL_SOCKET,
                    libc::SO_ERROR,
                    (&mut val as *mut libc::c_int).cast(),
                    &mut len,
                )
            };
            if rc == -1 {
                return Err(NetError::io("Socket::connect SO_ERROR"));
            }
            if val != 0 {
                return Err(NetError::Io {
                    ctx: "Socket::connect connect()",
                    source: std::io::Error::from_raw_os_error(val),
                });
            }
            return Ok(());
        }
    }

    /// Accepts one pending connection. `Ok(None)` means the backlog is drained.
    pub fn accept(&mut self) -> NetResult<Option<(RawFd, String, u16)>> {
        if self.kind != SockType::Listen {
            return Err(NetError::InvalidArgument("Socket::accept", "not a listen socket"));
        }

        if self.proto == SockProto::Unix {
            let mut sa: libc::sockaddr_un = unsafe { mem::zeroed() };
            let mut len = mem::size_of::<libc::sockaddr_un>() as libc::socklen_t;
            return Ok(self
                .accept_fd((&mut sa as *mut libc::sockaddr_un).cast(), &mut len)?
                .map(|fd| (fd, self.host.clone(), 0)));
        }

        let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let Some(fd) = self.accept_fd((&mut sa as *mut libc::sockaddr_in).cast(), &mut len)?
        else {
            return Ok(None);
        };
        let host = Ipv4Addr::from(u32::from_be(sa.sin_addr.s_addr)).to_string();
        let port = u16::from_be(sa.sin_port);

        if let Err(e) = setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_SNDBUF,
            &ACCEPTED_SNDBUF,
            "Socket::accept SO_SNDBUF",
        ) {
            warn!(error = %e, "accepted socket: SO_SNDBUF not applied");
        }
        Ok(Some((fd, host, port)))
    }

    fn accept_fd(
        &mut self,
        sa: *mut libc::sockaddr,
        len: *mut libc::socklen_t,
    ) -> NetResult<Option<RawFd>> {
        loop {
            let fd = unsafe { libc::accept(self.fd, sa, len) };
            if fd >= 0 {
                return Ok(Some(fd));
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EAGAIN) => return Ok(None),
                Some(libc::EINTR) => continue,
                _ => return Err(NetError::io("Socket::accept accept()")),
            }
        }
    }

    /// Reads into `buf`. `Ok(0)` means the call would block.
    pub fn recv_bytes(&mut self, buf: &mut [u8]) -> NetResult<usize> {
        self.recv_tm = unix_micros();
        loop {
            let n = if self.proto == SockProto::Udp {
                let mut sa: libc::sockaddr_in = unsafe { mem::zeroed() };
                let mut len = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
                let n = unsafe {
                    libc::recvfrom(
                        self.fd,
                        buf.as_mut_ptr().cast(),
                        buf.len(),
                        0,
                        (&mut sa as *mut libc::sockaddr_in).cast(),
                        &mut len,
                    )
                };
                if n > 0 {
                    self.peer = Some(sa);
                }
                n
            } else {
                unsafe { libc::recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), 0) }
            };

            if n > 0 {
                return Ok(n as usize);
            }
            if n == 0 {
                return Err(NetError::ClosedByPeer);
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EAGAIN) => return Ok(0),
                Some(libc::EINTR) => continue,
                _ => return Err(NetError::io("Socket::recv_bytes recv()")),
            }
        }
    }

    /// Writes as much of `buf` as the kernel takes; `Ok(n)` with `n < len`
    /// means the socket buffer filled up.
    pub fn send_bytes(&mut self, buf: &[u8]) -> NetResult<usize> {
        self.send_tm = unix_micros();
        let mut sent = 0usize;
        while sent < buf.len() {
            let rest = &buf[sent..];
            let n = if self.proto == SockProto::Udp {
                match self.peer.as_ref() {
                    Some(sa) => unsafe {
                        libc::sendto(
                            self.fd,
                            rest.as_ptr().cast(),
                            rest.len(),
                            0,
                            (sa as *const libc::sockaddr_in).cast(),
                            mem::size_of::<libc::sockaddr_in>() as libc::socklen_t,
                        )
                    },
                    None => {
                        return Err(NetError::InvalidArgument(
                            "Socket::send_bytes",
                            "udp endpoint has no peer yet",
                        ));
                    }
                }
            } else {
                unsafe { libc::send(self.fd, rest.as_ptr().cast(), rest.len(), libc::MSG_NOSIGNAL) }
            };

            if n >= 0 {
                sent += n as usize;
                continue;
            }
            match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EAGAIN) => return Ok(sent),
                Some(libc::EINTR) => continue,
                Some(libc::EPIPE) => return Err(NetError::ClosedByPeer),
                _ => return Err(NetError::io("Socket::send_bytes send()")),
            }
        }
        Ok(sent)
    }

    pub fn set_nonblock(&mut self) -> NetResult<()> {
        set_nonblock_fd(self.fd, "Socket::set_nonblock fcntl()")
    }

    /// Enables TCP keep-alive probing plus `TCP_USER_TIMEOUT` where present.
    pub fn set_keepalive(&mut self, idle: i32, intvl: i32, cnt: i32) -> NetResult<()> {
        let on: libc::c_int = 1;
        setsockopt(self.fd, libc::SOL_SOCKET, libc::SO_KEEPALIVE, &on, "SO_KEEPALIVE")?;
        setsockopt(self.fd, libc::IPPROTO_TCP, libc::TCP_KEEPIDLE, &idle, "TCP_KEEPIDLE")?;
        setsockopt(self.fd, libc::IPPROTO_TCP, libc::TCP_KEEPINTVL, &intvl, "TCP_KEEPINTVL")?;
        setsockopt(self.fd, libc::IPPROTO_TCP, libc::TCP_KEEPCNT, &cnt, "TCP_KEEPCNT")?;
        #[cfg(target_os = "linux")]
        setsockopt(
            self.fd,
            libc::IPPROTO_TCP,
            libc::TCP_USER_TIMEOUT,
            &USER_TIMEOUT_MS,
            "TCP_USER_TIMEOUT",
        )?;
        Ok(())
    }

    pub fn set_send_timeout(&mut self, timeout: Duration) -> NetResult<()> {
        let tv = clamp_timeval(timeout);
        setsockopt(self.fd, libc::SOL_SOCKET, libc::SO_SNDTIMEO, &tv, "SO_SNDTIMEO")
    }

    pub fn set_recv_timeout(&mut self, timeout: Duration) -> NetResult<()> {
        let tv = clamp_timeval(timeout);
        setsockopt(self.fd, libc::SOL_SOCKET, libc::SO_RCVTIMEO, &tv, "SO_RCVTIMEO")
    }

    /// Closes the descriptor. Safe to call more than once.
    pub fn close(&mut self) {
        if self.fd == FD_UNKNOWN {
            return;
        }
        unsafe {
            libc::close(self.fd);
        }
        if self.proto == SockProto::Unix && self.kind == SockType::Listen && !self.host.is_empty()
        {
            unlink_path(&self.host);
        }
        self.fd = FD_UNKNOWN;
        self.state = SockState::Unconnected;
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        self.close();
    }
}

fn unlink_path(path: &str) {
    if let Ok(c) = CString::new(path) {
        unsafe {
            let _ = libc::unlink(c.as_ptr());
        }
    }
}

fn clamp_timeval(timeout: Duration) -> libc::timeval {
    let timeout = if timeout.is_zero() { Duration::from_secs(30) } else { timeout };
    libc::timeval {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_usec: timeout.subsec_micros() as libc::suseconds_t,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn close_is_idempotent() {
        let mut s = Socket::new(SockType::Connect, SockProto::Tcp);
        s.open().unwrap();
        assert_ne!(s.fd(), FD_UNKNOWN);
        s.close();
        assert_eq!(s.fd(), FD_UNKNOWN);
        s.close();
        assert_eq!(s.fd(), FD_UNKNOWN);
    }

    #[test]
    fn accept_rejects_connect_sockets() {
        let mut s = Socket::new(SockType::Connect, SockProto::Tcp);
        s.open().unwrap();
        assert!(matches!(s.accept(), Err(NetError::InvalidArgument(..))));
    }

    #[test]
    fn connect_timeout_is_classified() {
        // 203.0.113.0/24 is TEST-NET-3, nothing answers there.
        let mut s = Socket::new(SockType::Connect, SockProto::Tcp);
        s.open().unwrap();
        let err = s.connect("203.0.113.1", 9, Some(Duration::from_millis(50))).unwrap_err();
        assert!(matches!(err, NetError::Timeout | NetError::Io { .. }));
    }
}
