//! Full-duplex master/worker IPC over a `socketpair`.
//!
//! The pair carries the same length-prefixed frames as every other endpoint.
//! Frames named [`frame::CHANNEL_OPEN_NAME`] additionally transport a file
//! descriptor as `SCM_RIGHTS` ancillary data: the send path re-reads the fd
//! from the encoded payload and attaches it, the receive path validates the
//! control message and surfaces the duplicated descriptor to the caller.

use std::{mem, os::fd::RawFd};

use tracing::warn;

use crate::{
    FD_UNKNOWN, NetError, NetResult, SockState,
    frame::{self, ChannelOpen},
    socket::{set_nonblock_fd, unix_micros},
};

/// Control buffer sized for one descriptor, 8-byte aligned for `cmsghdr`.
const CMSG_WORDS: usize = 4;

/// Master/worker channel endpoint.
///
/// Convention: the spawning side reads and writes through `fds[0]`, the
/// spawned side through `fds[1]`. After `fork` each process closes the ends
/// it does not own.
pub struct ChannelPair {
    fds: [RawFd; 2],
    state: SockState,
    recv_tm: i64,
    send_tm: i64,
}

impl ChannelPair {
    /// Creates the pair, both ends non-blocking and close-on-exec.
    pub fn open() -> NetResult<Self> {
        let mut fds = [FD_UNKNOWN; 2];
        if unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) } == -1
        {
            return Err(NetError::io("ChannelPair::open socketpair()"));
        }
        for fd in fds {
            set_nonblock_fd(fd, "ChannelPair::open O_NONBLOCK")?;
            if unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) } == -1 {
                warn!(fd, "channel end left without FD_CLOEXEC");
            }
        }
        Ok(Self { fds, state: SockState::Connected, recv_tm: 0, send_tm: 0 })
    }

    /// Wraps a write end received from another process. The read half is not
    /// ours, so only sends are possible.
    pub fn from_write_end(fd: RawFd) -> Self {
        Self { fds: [fd, FD_UNKNOWN], state: SockState::Connected, recv_tm: 0, send_tm: 0 }
    }

    #[inline]
    pub fn write_end(&self) -> RawFd {
        self.fds[0]
    }

    #[inline]
    pub fn read_end(&self) -> RawFd {
        self.fds[1]
    }

    #[inline]
    pub fn state(&self) -> SockState {
        self.state
    }

    /// Drops one end after `fork`; the other process owns it.
    pub fn close_end(&mut self, index: usize) {
        if self.fds[index] != FD_UNKNOWN {
            unsafe {
                libc::close(self.fds[index]);
            }
            self.fds[index] = FD_UNKNOWN;
        }
    }

    /// Closes whatever ends are still open. Safe to call more than once.
    pub fn close(&mut self) {
        self.close_end(0);
        self.close_end(1);
        self.state = SockState::Unconnected;
    }

    /// Sends one fully-framed buffer, attaching the descriptor of a
    /// channel-open frame as ancillary data. `Ok(0)` means the call would
    /// block; retrying is the caller's business.
    pub fn send_bytes(&mut self, buf: &[u8]) -> NetResult<usize> {
        if buf.len() < frame::LEN_HEADER_SIZE + 1 {
            return Err(NetError::InvalidArgument("ChannelPair::send_bytes", "short frame"));
        }
        self.send_tm = unix_micros();

        let pass_fd = frame::peek_named(buf)
            .filter(|(name, _)| *name == frame::CHANNEL_OPEN_NAME)
            .and_then(|(_, body)| bitcode::deserialize::<ChannelOpen>(body).ok())
            .map(|open| open.fd);

        let mut iov =
            libc::iovec { iov_base: buf.as_ptr() as *mut libc::c_void, iov_len: buf.len() };
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;

        let mut cbuf = [0u64; CMSG_WORDS];
        if let Some(fd) = pass_fd {
            msg.msg_control = cbuf.as_mut_ptr().cast();
            msg.msg_controllen =
                unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as libc::c_uint) } as _;
            unsafe {
                let cmsg = libc::CMSG_FIRSTHDR(&msg);
                (*cmsg).cmsg_level = libc::SOL_SOCKET;
                (*cmsg).cmsg_type = libc::SCM_RIGHTS;
                (*cmsg).cmsg_len = libc::CMSG_LEN(mem::size_of::<RawFd>() as libc::c_uint) as _;
                std::ptr::copy_nonoverlapping(
                    &fd as *const RawFd,
                    libc::CMSG_DATA(cmsg).cast::<RawFd>(),
                    1,
                );
            }
        }

        let n = unsafe { libc::sendmsg(self.fds[0], &msg, libc::MSG_NOSIGNAL) };
        if n >= 0 {
            return Ok(n as usize);
        }
        match std::io::Error::last_os_error().raw_os_error() {
            Some(libc::EINTR) | Some(libc::EAGAIN) => Ok(0),
            _ => Err(NetError::io("ChannelPair::send_bytes sendmsg()")),
        }
    }

    /// Receives into `buf`, surfacing a passed descriptor when the control
    /// message checks out. `Ok((0, None))` means the call would block.
    pub fn recv_bytes(&mut self, buf: &mut [u8]) -> NetResult<(usize, Option<RawFd>)> {
        self.recv_tm = unix_micros();

        let mut iov =
            libc::iovec { iov_base: buf.as_mut_ptr().cast::<libc::c_void>(), iov_len: buf.len() };
        let mut cbuf = [0u64; CMSG_WORDS];
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = &mut iov;
        msg.msg_iovlen = 1;
        msg.msg_control = cbuf.as_mut_ptr().cast();
        msg.msg_controllen =
            unsafe { libc::CMSG_SPACE(mem::size_of::<RawFd>() as libc::c_uint) } as _;

        let n = unsafe { libc::recvmsg(self.fds[1], &mut msg, 0) };
        if n == 0 {
            return Err(NetError::ClosedByPeer);
        }
        if n == -1 {
            return match std::io::Error::last_os_error().raw_os_error() {
                Some(libc::EINTR) | Some(libc::EAGAIN) => Ok((0, None)),
                _ => Err(NetError::io("ChannelPair::recv_bytes recvmsg()")),
            };
        }

        if msg.msg_flags & (libc::MSG_TRUNC | libc::MSG_CTRUNC) != 0 {
            warn!("channel recvmsg truncated data, frame dropped");
            return Err(NetError::Truncated);
        }

        let fd = unsafe {
            let cmsg = libc::CMSG_FIRSTHDR(&msg);
            if cmsg.is_null() {
                None
            } else if (*cmsg).cmsg_level != libc::SOL_SOCKET ||
                (*cmsg).cmsg_type != libc::SCM_RIGHTS
            {
                warn!("channel recvmsg returned invalid ancillary data");
                None
            } else if (*cmsg).cmsg_len <
                libc::CMSG_LEN(mem::size_of::<RawFd>() as libc::c_uint) as _
            {
                warn!("channel recvmsg returned too small ancillary data");
                None
            } else {
                Some(*libc::CMSG_DATA(cmsg).cast::<RawFd>())
            }
        };

        Ok((n as usize, fd))
    }
}

impl Drop for ChannelPair {
    fn drop(&mut self) {
        self.close();
    }
}
