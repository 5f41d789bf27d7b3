use std::io;

use thiserror::Error;

/// Failure taxonomy shared by sockets, channels and framing.
///
/// `EINTR` and `EAGAIN` never show up here: the I/O loops absorb them and
/// report a benign zero-length transfer instead.
#[derive(Error, Debug)]
pub enum NetError {
    #[error("{ctx}: {source}")]
    Io {
        ctx: &'static str,
        #[source]
        source: io::Error,
    },
    #[error("{0}: {1}")]
    InvalidArgument(&'static str, &'static str),
    #[error("operation timed out")]
    Timeout,
    #[error("peer closed the connection")]
    ClosedByPeer,
    #[error("bad frame length {0}")]
    Framing(u32),
    #[error("datagram dropped payload or ancillary bytes")]
    Truncated,
}

impl NetError {
    /// Captures `errno` for the syscall that just failed.
    #[inline]
    pub fn io(ctx: &'static str) -> Self {
        Self::Io { ctx, source: io::Error::last_os_error() }
    }
}

pub type NetResult<T> = Result<T, NetError>;
