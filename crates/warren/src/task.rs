//! Per-connection state: buffering, framing, dispatch and heartbeat.
//!
//! A `Task` owns exactly one endpoint and two `PACKAGE_SIZE` buffers with
//! read/write cursors. The receive loop drains the socket until it would
//! block, walks every complete frame in the buffer and hands the payload to
//! the handler registered for its command id or type name. Handlers reply
//! through an [`Outbox`], which also collects deferred cross-worker relays
//! for the reactor to flush after dispatch.

use std::{
    collections::{HashMap, VecDeque},
    os::fd::RawFd,
    time::{Duration, Instant},
};

use tracing::{debug, warn};
use warren_network::{
    ChannelPair, FD_UNKNOWN, NetError, NetResult, SockFlag, SockProto, SockState, SockType,
    Socket,
    frame::{self, ChannelOpen, LEN_HEADER_SIZE, PACKAGE_SIZE, Payload},
};
use warren_utils::codec;

/// Missed heartbeats tolerated before a task is considered dead.
pub const HEARTBEAT_LIMIT: u8 = 3;

/// Linear buffer with read/write cursors and front compaction.
pub(crate) struct StreamBuf {
    buf: Box<[u8]>,
    read: usize,
    write: usize,
}

impl StreamBuf {
    fn new() -> Self {
        Self { buf: vec![0u8; PACKAGE_SIZE].into_boxed_slice(), read: 0, write: 0 }
    }

    #[inline]
    fn len(&self) -> usize {
        self.write - self.read
    }

    #[inline]
    fn readable(&self) -> &[u8] {
        &self.buf[self.read..self.write]
    }

    #[inline]
    fn tail(&mut self) -> &mut [u8] {
        &mut self.buf[self.write..]
    }

    #[inline]
    fn tail_len(&self) -> usize {
        self.buf.len() - self.write
    }

    #[inline]
    fn advance_write(&mut self, n: usize) {
        self.write += n;
    }

    #[inline]
    fn advance_read(&mut self, n: usize) {
        self.read += n;
        if self.read == self.write {
            self.read = 0;
            self.write = 0;
        }
    }

    /// Moves the residual bytes to the front to recover tail space.
    fn compact(&mut self) {
        if self.read > 0 {
            self.buf.copy_within(self.read..self.write, 0);
            self.write -= self.read;
            self.read = 0;
        }
    }

    fn maybe_compact(&mut self) {
        if self.read >= self.buf.len() / 2 {
            self.compact();
        }
    }

    /// Appends `bytes` if the buffer has room for them, compacting first when
    /// the tail alone is too short.
    fn append(&mut self, bytes: &[u8]) -> bool {
        if self.buf.len() - self.len() < bytes.len() {
            return false;
        }
        if self.tail_len() < bytes.len() {
            self.compact();
        }
        self.buf[self.write..self.write + bytes.len()].copy_from_slice(bytes);
        self.write += bytes.len();
        true
    }
}

/// Borrowed view of one decoded payload handed to a handler.
pub struct Request<'a> {
    pub buf: &'a [u8],
    /// Descriptor that rode the frame as ancillary data, when one did.
    pub fd: Option<RawFd>,
}

/// Reply surface available to handlers during dispatch.
pub struct Outbox<'a> {
    send: &'a mut StreamBuf,
    relays: &'a mut Vec<Relay>,
}

impl Outbox<'_> {
    /// Frames and enqueues a command reply on this connection.
    pub fn reply_command(&mut self, cmd: u8, para: u8, body: &[u8]) -> NetResult<()> {
        let mut framed = Vec::with_capacity(LEN_HEADER_SIZE + 3 + body.len());
        frame::frame_command(&mut framed, cmd, para, body)?;
        self.reply_frame(&framed)
    }

    /// Frames and enqueues a named reply on this connection.
    pub fn reply_named(&mut self, name: &str, body: &[u8]) -> NetResult<()> {
        let mut framed = Vec::new();
        frame::frame_named(&mut framed, name, body)?;
        self.reply_frame(&framed)
    }

    /// Enqueues an already-framed envelope.
    pub fn reply_frame(&mut self, framed: &[u8]) -> NetResult<()> {
        if !self.send.append(framed) {
            return Err(NetError::Framing(framed.len() as u32));
        }
        Ok(())
    }

    /// Defers a command frame for another worker; the reactor relays it over
    /// the channel bus once this handler returns.
    pub fn to_worker(&mut self, slot: u32, cmd: u8, para: u8, body: &[u8]) -> NetResult<()> {
        let mut framed = Vec::new();
        frame::frame_command(&mut framed, cmd, para, body)?;
        self.relays.push(Relay { slot, frame: framed });
        Ok(())
    }
}

/// Cross-worker send deferred out of handler context.
pub(crate) struct Relay {
    pub slot: u32,
    pub frame: Vec<u8>,
}

/// Control-plane frames intercepted on channel tasks.
pub(crate) enum Control {
    Open(ChannelOpen, Option<RawFd>),
    Quit,
    Terminate,
}

pub type Handler = Box<dyn FnMut(Request<'_>, &mut Outbox<'_>) -> i32 + Send>;

/// One endpoint, dispatched by protocol variant.
pub enum Conduit {
    Plain(Socket),
    Channel(ChannelPair),
}

impl Conduit {
    #[inline]
    pub fn fd(&self) -> RawFd {
        match self {
            Self::Plain(s) => s.fd(),
            Self::Channel(c) => {
                if c.read_end() != FD_UNKNOWN {
                    c.read_end()
                } else {
                    c.write_end()
                }
            }
        }
    }

    #[inline]
    pub fn proto(&self) -> SockProto {
        match self {
            Self::Plain(s) => s.proto(),
            Self::Channel(_) => SockProto::Channel,
        }
    }

    #[inline]
    pub fn kind(&self) -> SockType {
        match self {
            Self::Plain(s) => s.kind(),
            Self::Channel(_) => SockType::Connect,
        }
    }

    #[inline]
    pub fn state(&self) -> SockState {
        match self {
            Self::Plain(s) => s.state(),
            Self::Channel(c) => c.state(),
        }
    }

    #[inline]
    pub fn flag(&self) -> SockFlag {
        match self {
            Self::Plain(s) => s.flag(),
            Self::Channel(_) => SockFlag::Bidi,
        }
    }

    fn recv(&mut self, buf: &mut [u8]) -> NetResult<(usize, Option<RawFd>)> {
        match self {
            Self::Plain(s) => Ok((s.recv_bytes(buf)?, None)),
            Self::Channel(c) => c.recv_bytes(buf),
        }
    }

    fn send(&mut self, buf: &[u8]) -> NetResult<usize> {
        match self {
            Self::Plain(s) => s.send_bytes(buf),
            Self::Channel(c) => c.send_bytes(buf),
        }
    }
}

/// Per-connection state machine.
pub struct Task {
    conduit: Conduit,
    kind: SockProto,
    recv: StreamBuf,
    send: StreamBuf,
    heartbeat: u8,
    cmd_handlers: HashMap<u16, Handler>,
    name_handlers: HashMap<String, Handler>,
    /// HTTP tasks bypass length framing; buffered bytes go here untouched.
    raw_handler: Option<Handler>,
    pending_fds: VecDeque<RawFd>,
    relays: Vec<Relay>,
    controls: Vec<Control>,
}

impl Task {
    pub fn new(conduit: Conduit) -> Self {
        let kind = conduit.proto();
        Self {
            conduit,
            kind,
            recv: StreamBuf::new(),
            send: StreamBuf::new(),
            heartbeat: 0,
            cmd_handlers: HashMap::new(),
            name_handlers: HashMap::new(),
            raw_handler: None,
            pending_fds: VecDeque::new(),
            relays: Vec::new(),
            controls: Vec::new(),
        }
    }

    #[inline]
    pub fn conduit(&self) -> &Conduit {
        &self.conduit
    }

    #[inline]
    pub fn conduit_mut(&mut self) -> &mut Conduit {
        &mut self.conduit
    }

    #[inline]
    pub fn fd(&self) -> RawFd {
        self.conduit.fd()
    }

    #[inline]
    pub fn kind(&self) -> SockProto {
        self.kind
    }

    #[inline]
    pub fn state(&self) -> SockState {
        self.conduit.state()
    }

    #[inline]
    pub fn is_listener(&self) -> bool {
        self.conduit.kind() == SockType::Listen && self.conduit.state() == SockState::Listened
    }

    /// UDP and channel tasks are the endpoint itself; I/O errors never remove
    /// them from the pool.
    #[inline]
    pub fn is_endpoint(&self) -> bool {
        matches!(self.kind, SockProto::Udp | SockProto::Channel)
    }

    /// Registers a handler for the `(cmd, para)` command id.
    pub fn on<F>(&mut self, cmd: u8, para: u8, handler: F)
    where
        F: FnMut(Request<'_>, &mut Outbox<'_>) -> i32 + Send + 'static,
    {
        self.cmd_handlers.insert(codec::cmd_id(cmd, para), Box::new(handler));
    }

    /// Registers a handler for a named payload.
    pub fn on_named<F>(&mut self, name: &str, handler: F)
    where
        F: FnMut(Request<'_>, &mut Outbox<'_>) -> i32 + Send + 'static,
    {
        self.name_handlers.insert(name.to_owned(), Box::new(handler));
    }

    /// Registers the raw passthrough used by HTTP tasks.
    pub fn on_raw<F>(&mut self, handler: F)
    where
        F: FnMut(Request<'_>, &mut Outbox<'_>) -> i32 + Send + 'static,
    {
        self.raw_handler = Some(Box::new(handler));
    }

    #[inline]
    pub fn send_len(&self) -> usize {
        self.send.len()
    }

    #[inline]
    pub fn heartbeat_out(&self) -> bool {
        self.heartbeat > HEARTBEAT_LIMIT
    }

    #[inline]
    pub fn heartbeat_reset(&mut self) {
        self.heartbeat = 0;
    }

    /// Enqueues a keepalive frame and counts it as missed until the peer
    /// answers with any traffic.
    pub(crate) fn heartbeat_send(&mut self) -> NetResult<()> {
        self.send_frame(&frame::heartbeat())?;
        self.heartbeat = self.heartbeat.saturating_add(1);
        Ok(())
    }

    /// Frames and enqueues a command envelope for the async send path.
    pub fn send_command(&mut self, cmd: u8, para: u8, body: &[u8]) -> NetResult<()> {
        let mut framed = Vec::with_capacity(LEN_HEADER_SIZE + 3 + body.len());
        frame::frame_command(&mut framed, cmd, para, body)?;
        self.send_frame(&framed)
    }

    /// Frames and enqueues a named envelope for the async send path.
    pub fn send_named(&mut self, name: &str, body: &[u8]) -> NetResult<()> {
        let mut framed = Vec::new();
        frame::frame_named(&mut framed, name, body)?;
        self.send_frame(&framed)
    }

    /// Appends an already-framed envelope to the send ring. A full ring is a
    /// hard error; the reactor drops the task.
    pub fn send_frame(&mut self, framed: &[u8]) -> NetResult<()> {
        if !self.send.append(framed) {
            return Err(NetError::Framing(framed.len() as u32));
        }
        Ok(())
    }

    pub(crate) fn take_relays(&mut self) -> Vec<Relay> {
        std::mem::take(&mut self.relays)
    }

    pub(crate) fn take_controls(&mut self) -> Vec<Control> {
        std::mem::take(&mut self.controls)
    }

    /// Drains the socket until it would block, dispatching every complete
    /// frame. Errors mean the connection is unusable.
    pub(crate) fn task_recv(&mut self) -> NetResult<usize> {
        let mut total = 0usize;
        loop {
            if self.recv.tail_len() == 0 {
                self.recv.compact();
            }
            if self.recv.tail_len() == 0 {
                // A frame larger than the buffer can never complete.
                return Err(NetError::Framing(self.recv.len() as u32));
            }

            let n = {
                let Self { conduit, recv, pending_fds, .. } = self;
                let (n, fd) = conduit.recv(recv.tail())?;
                if let Some(fd) = fd {
                    pending_fds.push_back(fd);
                }
                recv.advance_write(n);
                n
            };
            if n == 0 {
                break;
            }
            total += n;
            self.heartbeat = 0;
            self.dispatch_frames()?;
        }
        Ok(total)
    }

    /// Drains the send ring until it empties or the kernel pushes back.
    pub(crate) fn task_send(&mut self) -> NetResult<usize> {
        let Self { conduit, send, .. } = self;
        let mut total = 0usize;
        while send.len() > 0 {
            let n = conduit.send(send.readable())?;
            if n == 0 {
                break;
            }
            send.advance_read(n);
            total += n;
        }
        send.maybe_compact();
        Ok(total)
    }

    /// Walks complete frames in the receive buffer and dispatches them.
    fn dispatch_frames(&mut self) -> NetResult<()> {
        if self.kind == SockProto::Http {
            return self.dispatch_raw();
        }

        loop {
            let flen = {
                let Self {
                    recv, send, cmd_handlers, name_handlers, pending_fds, relays, controls, kind, ..
                } = self;

                let readable = recv.readable();
                if readable.len() < LEN_HEADER_SIZE {
                    break;
                }
                let total = frame::total_len(readable);
                frame::check_total_len(total)?;
                let flen = LEN_HEADER_SIZE + total as usize;
                if readable.len() < flen {
                    break;
                }

                let payload = frame::parse(&readable[..flen])?;
                if frame::is_heartbeat(&payload) {
                    // Keepalives only refresh the counter, done on receive.
                } else if *kind == SockProto::Channel &&
                    intercept_control(&payload, pending_fds, controls)
                {
                    // Consumed by the control plane.
                } else {
                    match payload {
                        Payload::Command { id, body } => {
                            if let Some(handler) = cmd_handlers.get_mut(&id) {
                                let mut out = Outbox { send, relays };
                                let rc = handler(Request { buf: body, fd: None }, &mut out);
                                if rc != 0 {
                                    debug!(id, rc, "command handler reported failure");
                                }
                            } else {
                                let (cmd, para) = codec::split_cmd_id(id);
                                warn!(cmd, para, "no handler for command, frame dropped");
                            }
                        }
                        Payload::Named { name, body } => {
                            let fd = if name == frame::CHANNEL_OPEN_NAME {
                                pending_fds.pop_front()
                            } else {
                                None
                            };
                            if let Some(handler) = name_handlers.get_mut(name) {
                                let mut out = Outbox { send, relays };
                                let rc = handler(Request { buf: body, fd }, &mut out);
                                if rc != 0 {
                                    debug!(name, rc, "named handler reported failure");
                                }
                            } else {
                                warn!(name, "no handler for message, frame dropped");
                            }
                        }
                    }
                }
                flen
            };
            self.recv.advance_read(flen);
        }
        self.recv.maybe_compact();
        Ok(())
    }

    /// HTTP passthrough: the buffered bytes go to the raw handler unframed.
    fn dispatch_raw(&mut self) -> NetResult<()> {
        let consumed = {
            let Self { recv, send, raw_handler, relays, .. } = self;
            if recv.len() == 0 {
                return Ok(());
            }
            if let Some(handler) = raw_handler {
                let mut out = Outbox { send, relays };
                handler(Request { buf: recv.readable(), fd: None }, &mut out);
            }
            recv.len()
        };
        self.recv.advance_read(consumed);
        Ok(())
    }

    /// Blocking send of one fully-framed envelope, bounded by `timeout`.
    /// For use outside the event loop only.
    pub fn sync_send(&mut self, framed: &[u8], timeout: Duration) -> NetResult<usize> {
        let deadline = Instant::now() + timeout;
        let mut sent = 0usize;
        while sent < framed.len() {
            let n = self.conduit.send(&framed[sent..])?;
            sent += n;
            if sent < framed.len() && n == 0 {
                wait_io(self.fd(), libc::POLLOUT, deadline)?;
            }
        }
        Ok(sent)
    }

    /// Blocking receive of exactly one legal, non-heartbeat frame, bounded by
    /// `timeout`. With `expect_len` the frame must be exactly that long on
    /// the wire. For bootstrap handshakes outside the event loop only.
    pub fn sync_recv(
        &mut self,
        timeout: Duration,
        expect_len: Option<usize>,
    ) -> NetResult<Vec<u8>> {
        let deadline = Instant::now() + timeout;
        loop {
            loop {
                let (flen, heartbeat) = {
                    let readable = self.recv.readable();
                    if readable.len() < LEN_HEADER_SIZE {
                        break;
                    }
                    let total = frame::total_len(readable);
                    frame::check_total_len(total)?;
                    let flen = LEN_HEADER_SIZE + total as usize;
                    if readable.len() < flen {
                        break;
                    }
                    (flen, frame::is_heartbeat(&frame::parse(&readable[..flen])?))
                };
                if heartbeat {
                    self.recv.advance_read(flen);
                    continue;
                }
                if let Some(want) = expect_len &&
                    flen != want
                {
                    return Err(NetError::InvalidArgument(
                        "Task::sync_recv",
                        "frame length mismatch",
                    ));
                }
                let framed = self.recv.readable()[..flen].to_vec();
                self.recv.advance_read(flen);
                self.heartbeat = 0;
                return Ok(framed);
            }

            wait_io(self.fd(), libc::POLLIN, deadline)?;
            let Self { conduit, recv, pending_fds, .. } = self;
            if recv.tail_len() == 0 {
                recv.compact();
            }
            let (n, fd) = conduit.recv(recv.tail())?;
            if let Some(fd) = fd {
                pending_fds.push_back(fd);
            }
            recv.advance_write(n);
        }
    }
}

/// Channel-bus frames the framework consumes itself.
fn intercept_control(
    payload: &Payload<'_>,
    pending_fds: &mut VecDeque<RawFd>,
    controls: &mut Vec<Control>,
) -> bool {
    match payload {
        Payload::Named { name, body } if *name == frame::CHANNEL_OPEN_NAME => {
            match bitcode::deserialize::<ChannelOpen>(body) {
                Ok(mut open) => {
                    let fd = pending_fds.pop_front();
                    if let Some(fd) = fd {
                        open.fd = fd;
                    }
                    controls.push(Control::Open(open, fd));
                }
                Err(_) => warn!("undecodable channel-open payload, frame dropped"),
            }
            true
        }
        Payload::Command { id, .. } => {
            let (cmd, para) = codec::split_cmd_id(*id);
            if cmd != frame::CMD_CHANNEL {
                return false;
            }
            match para {
                frame::CHANNEL_QUIT => {
                    controls.push(Control::Quit);
                    true
                }
                frame::CHANNEL_TERMINATE => {
                    controls.push(Control::Terminate);
                    true
                }
                _ => false,
            }
        }
        Payload::Named { .. } => false,
    }
}

/// Waits for readiness on `fd` until `deadline`.
fn wait_io(fd: RawFd, events: libc::c_short, deadline: Instant) -> NetResult<()> {
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(NetError::Timeout);
        }
        let left = (deadline - now).as_millis().max(1) as libc::c_int;
        let mut pfd = libc::pollfd { fd, events, revents: 0 };
        let rc = unsafe { libc::poll(&mut pfd, 1, left) };
        if rc > 0 {
            return Ok(());
        }
        if rc == 0 {
            return Err(NetError::Timeout);
        }
        if std::io::Error::last_os_error().raw_os_error() != Some(libc::EINTR) {
            return Err(NetError::io("wait_io poll()"));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stream_buf_cursors_and_compaction() {
        let mut b = StreamBuf::new();
        assert!(b.append(&[1, 2, 3, 4, 5, 6]));
        assert_eq!(b.readable(), &[1, 2, 3, 4, 5, 6]);
        b.advance_read(4);
        assert_eq!(b.readable(), &[5, 6]);
        b.compact();
        assert_eq!(b.readable(), &[5, 6]);
        b.advance_read(2);
        assert_eq!(b.len(), 0);
        // Cursors rewind once drained.
        assert_eq!(b.tail_len(), PACKAGE_SIZE);
    }

    #[test]
    fn stream_buf_rejects_overflow() {
        let mut b = StreamBuf::new();
        assert!(b.append(&vec![0u8; PACKAGE_SIZE]));
        assert!(!b.append(&[1]));
        b.advance_read(1);
        assert!(b.append(&[1]));
    }

    #[test]
    fn stream_buf_append_compacts_for_tail_space() {
        let mut b = StreamBuf::new();
        assert!(b.append(&vec![7u8; PACKAGE_SIZE - 2]));
        b.advance_read(PACKAGE_SIZE - 4);
        // Tail alone holds 2 bytes, but compaction frees the front.
        assert!(b.append(&[8, 8, 8, 8]));
        assert_eq!(b.readable(), &[7, 7, 8, 8, 8, 8]);
    }

    #[test]
    fn heartbeat_counter_trips_after_limit() {
        let mut task = Task::new(Conduit::Plain(Socket::new(SockType::Connect, SockProto::Tcp)));
        assert!(!task.heartbeat_out());
        for _ in 0..=HEARTBEAT_LIMIT {
            task.heartbeat_send().unwrap();
        }
        assert!(task.heartbeat_out());
        task.heartbeat_reset();
        assert!(!task.heartbeat_out());
    }

    #[test]
    fn send_ring_overflow_is_an_error() {
        let mut task = Task::new(Conduit::Plain(Socket::new(SockType::Connect, SockProto::Tcp)));
        let body = vec![0u8; frame::MAX_TOTAL_LEN - 3];
        task.send_command(1, 0, &body).unwrap();
        assert!(matches!(task.send_command(1, 0, &body), Err(NetError::Framing(_))));
    }
}
