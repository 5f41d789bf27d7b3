//! Edge-triggered readiness reactor for one worker process.
//!
//! The loop runs four stages per iteration: claim the accept mutex (maybe),
//! wait for readiness, dispatch events, release the mutex. Listener tasks
//! only sit in the poll while the mutex is held, so each arriving connection
//! wakes exactly one worker.

use std::{io, mem, os::fd::RawFd, path::PathBuf, time::Duration};

use mio::{Events, Interest, Poll, Token, event::Event, unix::SourceFd};
use tracing::{debug, error, info, warn};
use warren_network::{
    ChannelPair, FD_UNKNOWN, LISTEN_BACKLOG, NetError, NetResult, SockFlag, SockProto, SockState,
    SockType, Socket, frame::ChannelOpen,
};
use warren_utils::Repeater;

use crate::{
    accept::{AcceptBackend, AcceptMutex},
    master::{MAX_PROCESS, WorkerRecord},
    signal,
    task::{Conduit, Control, Task},
};

type TaskHook = Box<dyn FnMut(&mut Task) + Send>;

/// Reactor tuning. Every knob has the production default; tests shrink the
/// intervals.
pub struct ServerConfig {
    /// Readiness wait bound.
    pub timeout: Duration,
    /// Heartbeat sweep interval.
    pub tick: Duration,
    pub heartbeat_turn: bool,
    pub accept_turn: bool,
    pub accept_backend: AcceptBackend,
    /// Shared-memory link or advisory-lock path for the accept mutex.
    pub accept_path: PathBuf,
    /// Task-pool size beyond which this worker backs off from accepting.
    pub high_water: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(10),
            tick: Duration::from_millis(10),
            heartbeat_turn: true,
            accept_turn: true,
            accept_backend: AcceptBackend::SharedAtomic,
            accept_path: std::env::temp_dir().join("warren.accept"),
            high_water: 1024,
        }
    }
}

impl ServerConfig {
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_tick(mut self, tick: Duration) -> Self {
        self.tick = tick;
        self
    }

    pub fn with_heartbeat(mut self, on: bool) -> Self {
        self.heartbeat_turn = on;
        self
    }

    pub fn with_accept_turn(mut self, on: bool) -> Self {
        self.accept_turn = on;
        self
    }

    pub fn with_accept_backend(mut self, backend: AcceptBackend) -> Self {
        self.accept_backend = backend;
        self
    }

    pub fn with_accept_path(mut self, path: PathBuf) -> Self {
        self.accept_path = path;
        self
    }

    pub fn with_high_water(mut self, high_water: usize) -> Self {
        self.high_water = high_water;
        self
    }
}

/// One worker's reactor: multiplexer, listener set, task pool, tick timer.
pub struct Server {
    cfg: ServerConfig,
    poll: Option<Poll>,
    events: Events,
    tasks: Vec<(Token, Task)>,
    listener_tokens: Vec<Token>,
    listeners_polled: bool,
    next_token: usize,
    accept_mutex: Option<AcceptMutex>,
    accept_held: bool,
    use_accept_turn: bool,
    accept_disabled: i32,
    exiting: bool,
    tick: Repeater,
    pid: i32,
    slot: Option<usize>,
    worker_num: u32,
    pub(crate) workers: Vec<WorkerRecord>,
    task_setup: Option<TaskHook>,
    on_connect: Option<TaskHook>,
    on_disconnect: Option<TaskHook>,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Self {
        let tick = Repeater::every(cfg.tick);
        Self {
            cfg,
            poll: None,
            events: Events::with_capacity(LISTEN_BACKLOG),
            tasks: Vec::new(),
            listener_tokens: Vec::new(),
            listeners_polled: false,
            next_token: 0,
            accept_mutex: None,
            accept_held: false,
            use_accept_turn: false,
            accept_disabled: 0,
            exiting: false,
            tick,
            pid: std::process::id() as i32,
            slot: None,
            worker_num: 1,
            workers: (0..MAX_PROCESS).map(|_| WorkerRecord::default()).collect(),
            task_setup: None,
            on_connect: None,
            on_disconnect: None,
        }
    }

    #[inline]
    pub fn config(&self) -> &ServerConfig {
        &self.cfg
    }

    #[inline]
    pub fn set_worker_num(&mut self, worker_num: u32) {
        self.worker_num = worker_num.max(1);
    }

    #[inline]
    pub fn worker_num(&self) -> u32 {
        self.worker_num
    }

    #[inline]
    pub fn slot(&self) -> Option<usize> {
        self.slot
    }

    #[inline]
    pub fn exiting(&self) -> bool {
        self.exiting
    }

    #[inline]
    pub fn accept_held(&self) -> bool {
        self.accept_held
    }

    #[inline]
    pub fn task_count(&self) -> usize {
        self.tasks.len()
    }

    /// Connected stream tasks still in the pool; endpoints and listeners do
    /// not count.
    pub fn active_connections(&self) -> usize {
        self.tasks
            .iter()
            .filter(|(_, t)| {
                t.conduit().kind() == SockType::Connect &&
                    matches!(t.kind(), SockProto::Tcp | SockProto::Unix | SockProto::Http)
            })
            .count()
    }

    /// Called for every task entering the pool so the application can
    /// register its handlers.
    pub fn on_task_setup<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Task) + Send + 'static,
    {
        self.task_setup = Some(Box::new(hook));
    }

    pub fn on_connect<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Task) + Send + 'static,
    {
        self.on_connect = Some(Box::new(hook));
    }

    pub fn on_disconnect<F>(&mut self, hook: F)
    where
        F: FnMut(&mut Task) + Send + 'static,
    {
        self.on_disconnect = Some(Box::new(hook));
    }

    /// Opens a listening endpoint and installs it in the pool. Registration
    /// with the poll happens at startup or when the accept mutex is claimed.
    pub fn add_listener(&mut self, host: &str, port: u16, proto: SockProto) -> NetResult<()> {
        let kind =
            if proto == SockProto::Udp { SockType::Connect } else { SockType::Listen };
        let mut socket = Socket::new(kind, proto);
        socket.open()?;
        socket.listen(host, port)?;

        let mut task = Task::new(Conduit::Plain(socket));
        if let Some(setup) = self.task_setup.as_mut() {
            setup(&mut task);
        }
        let token = self.add_to_pool(task);
        self.listener_tokens.push(token);
        Ok(())
    }

    /// Single-process mode: listeners always polled, herd lock off.
    pub fn single_start(&mut self) -> NetResult<()> {
        self.single_prepare()?;
        self.run_loop()
    }

    /// Startup half of [`single_start`], split out so callers can drive the
    /// loop themselves.
    pub fn single_prepare(&mut self) -> NetResult<()> {
        self.pid = unsafe { libc::getpid() };
        self.init_poll()?;
        self.listeners_to_poll()?;
        self.use_accept_turn = false;
        Ok(())
    }

    /// Prefork worker mode: listeners plus the channel bus, herd lock on when
    /// there is competition.
    pub fn worker_start(&mut self, slot: usize) -> NetResult<()> {
        self.slot = Some(slot);
        self.pid = unsafe { libc::getpid() };
        self.init_poll()?;
        self.listeners_to_poll()?;
        self.channels_to_poll()?;

        self.use_accept_turn = self.cfg.accept_turn && self.worker_num > 1;
        if self.use_accept_turn {
            self.accept_mutex =
                Some(AcceptMutex::open(self.cfg.accept_backend, &self.cfg.accept_path)?);
            self.listeners_from_poll();
        }
        info!(slot, pid = self.pid, "worker reactor running");
        self.run_loop()
    }

    fn run_loop(&mut self) -> NetResult<()> {
        loop {
            if self.exiting && self.active_connections() == 0 {
                self.process_exit();
                return Ok(());
            }
            self.recv_once()?;
            if self.handle_signal() {
                return Ok(());
            }
            self.check_tick();
        }
    }

    /// One reactor iteration: claim, wait, dispatch, release.
    pub fn recv_once(&mut self) -> NetResult<()> {
        if self.tasks.len() > self.cfg.high_water {
            self.accept_disabled += 1;
        }

        let pid = self.pid;
        if self.use_accept_turn && !self.accept_held && !self.exiting {
            if self.accept_disabled > 0 {
                self.accept_disabled -= 1;
            } else if self.accept_mutex.as_mut().is_some_and(|m| m.try_acquire(pid)) {
                self.accept_held = true;
                if let Err(e) = self.listeners_to_poll() {
                    error!(error = %e, "listeners did not reach the poll");
                }
            }
        }

        let timeout = self.cfg.timeout;
        let mut events = mem::replace(&mut self.events, Events::with_capacity(0));
        if let Some(poll) = self.poll.as_mut() &&
            let Err(e) = poll.poll(&mut events, Some(timeout)) &&
            e.kind() != io::ErrorKind::Interrupted
        {
            warren_utils::safe_panic!("reactor wait failed: {e}");
        }
        for event in events.iter() {
            self.handle_event(event);
        }
        self.events = events;

        if self.use_accept_turn &&
            self.accept_held &&
            self.accept_mutex.as_mut().is_some_and(|m| m.release(pid))
        {
            self.accept_held = false;
            self.listeners_from_poll();
        }
        Ok(())
    }

    fn handle_event(&mut self, event: &Event) {
        let token = event.token();
        let Some(idx) = self.tasks.iter().position(|(t, _)| *t == token) else {
            return;
        };

        let (fd_unknown, endpoint, listener, connected) = {
            let task = &self.tasks[idx].1;
            (
                task.fd() == FD_UNKNOWN,
                task.is_endpoint(),
                task.is_listener(),
                task.conduit().kind() == SockType::Connect &&
                    task.state() == SockState::Connected,
            )
        };

        if fd_unknown || event.is_error() || event.is_priority() {
            if !endpoint {
                self.disconnect_at(idx);
            }
            return;
        }

        if listener {
            if event.is_readable() &&
                let Err(e) = self.accept_conn(idx)
            {
                error!(error = %e, "accept failed");
            }
            return;
        }

        if connected {
            if event.is_readable() && self.task_recv_at(idx).is_err() {
                if !endpoint {
                    self.disconnect_at(idx);
                }
                return;
            }
            if event.is_writable() {
                if self.tasks[idx].1.send_len() == 0 {
                    self.rearm(idx, Interest::READABLE);
                } else if self.tasks[idx].1.task_send().is_err() && !endpoint {
                    self.disconnect_at(idx);
                }
            }
        }
    }

    /// Drains the listener backlog, building one task per connection.
    fn accept_conn(&mut self, idx: usize) -> NetResult<()> {
        loop {
            let proto = self.tasks[idx].1.kind();
            let accepted = match self.tasks[idx].1.conduit_mut() {
                Conduit::Plain(s) => s.accept()?,
                Conduit::Channel(_) => {
                    return Err(NetError::InvalidArgument(
                        "Server::accept_conn",
                        "channel cannot accept",
                    ));
                }
            };
            let Some((fd, host, port)) = accepted else {
                return Ok(());
            };

            let mut socket = Socket::from_accepted(fd, proto, host, port);
            if let Err(e) = socket.set_nonblock() {
                warn!(error = %e, "accepted socket rejected");
                continue;
            }

            let mut task = Task::new(Conduit::Plain(socket));
            if let Some(setup) = self.task_setup.as_mut() {
                setup(&mut task);
            }
            let token = match self.add_task(task, Interest::READABLE) {
                Ok(token) => token,
                Err(e) => {
                    warn!(error = %e, "accepted task not registered");
                    continue;
                }
            };

            let mut hook = self.on_connect.take();
            if let Some(h) = hook.as_mut() &&
                let Some(i) = self.tasks.iter().position(|(t, _)| *t == token)
            {
                h(&mut self.tasks[i].1);
            }
            self.on_connect = hook;
        }
    }

    fn task_recv_at(&mut self, idx: usize) -> NetResult<()> {
        let res = self.tasks[idx].1.task_recv();
        self.apply_controls(idx);
        self.drain_relays(idx);
        if self.tasks[idx].1.send_len() > 0 {
            self.rearm(idx, Interest::READABLE | Interest::WRITABLE);
        }
        res.map(|_| ())
    }

    /// Framework-consumed channel frames: shutdown flags and peer channels.
    fn apply_controls(&mut self, idx: usize) {
        for control in self.tasks[idx].1.take_controls() {
            match control {
                Control::Quit => signal::request_quit(),
                Control::Terminate => signal::request_terminate(),
                Control::Open(open, fd) => self.open_peer_channel(open, fd),
            }
        }
    }

    fn open_peer_channel(&mut self, open: ChannelOpen, fd: Option<RawFd>) {
        let Some(fd) = fd else {
            warn!(slot = open.slot, "channel-open arrived without a descriptor");
            return;
        };
        let slot = open.slot as usize;
        if slot >= MAX_PROCESS {
            warn!(slot, "channel-open for out-of-range slot");
            unsafe {
                libc::close(fd);
            }
            return;
        }

        let task = Task::new(Conduit::Channel(ChannelPair::from_write_end(fd)));
        match self.add_task(task, Interest::READABLE) {
            Ok(token) => {
                debug!(slot, pid = open.pid, "peer channel installed");
                self.workers[slot].pid = open.pid;
                self.workers[slot].token = Some(token);
            }
            Err(e) => error!(error = %e, slot, "peer channel not registered"),
        }
    }

    fn drain_relays(&mut self, idx: usize) {
        for relay in self.tasks[idx].1.take_relays() {
            self.async_worker(&relay.frame, relay.slot, &[]);
        }
    }

    /// Enqueues a framed envelope for `token` and arms write interest.
    pub fn send(&mut self, token: Token, framed: &[u8]) -> NetResult<()> {
        let Some(idx) = self.tasks.iter().position(|(t, _)| *t == token) else {
            return Err(NetError::InvalidArgument("Server::send", "unknown token"));
        };
        self.tasks[idx].1.send_frame(framed)?;
        self.rearm(idx, Interest::READABLE | Interest::WRITABLE);
        Ok(())
    }

    /// Enqueues a framed envelope to every connected sendable TCP task.
    pub fn broadcast(&mut self, framed: &[u8]) {
        let mut i = self.tasks.len();
        while i != 0 {
            i -= 1;
            let eligible = {
                let t = &self.tasks[i].1;
                t.conduit().kind() == SockType::Connect &&
                    t.state() == SockState::Connected &&
                    t.kind() == SockProto::Tcp &&
                    matches!(t.conduit().flag(), SockFlag::Send | SockFlag::Bidi)
            };
            if eligible {
                if self.tasks[i].1.send_frame(framed).is_ok() {
                    self.rearm(i, Interest::READABLE | Interest::WRITABLE);
                } else {
                    warn!("broadcast dropped for a full send ring");
                }
            }
        }
    }

    /// Queues a frame onto a worker's channel through the reactor. Slot
    /// `MAX_PROCESS` broadcasts to every live peer not in `blacklist`.
    pub fn async_worker(&mut self, framed: &[u8], slot: u32, blacklist: &[u32]) {
        if self.worker_num <= 1 {
            return;
        }
        if slot as usize == MAX_PROCESS {
            for i in 0..MAX_PROCESS {
                if blacklist.contains(&(i as u32)) {
                    continue;
                }
                self.async_to_slot(i, framed);
            }
        } else if (slot as usize) < MAX_PROCESS {
            self.async_to_slot(slot as usize, framed);
        }
    }

    fn async_to_slot(&mut self, slot: usize, framed: &[u8]) {
        if Some(slot) == self.slot || self.workers[slot].pid == -1 {
            return;
        }
        let Some(token) = self.workers[slot].token else {
            return;
        };
        let Some(idx) = self.tasks.iter().position(|(t, _)| *t == token) else {
            return;
        };
        if self.tasks[idx].1.fd() == FD_UNKNOWN {
            return;
        }
        if self.tasks[idx].1.send_frame(framed).is_ok() {
            self.rearm(idx, Interest::READABLE | Interest::WRITABLE);
        } else {
            warn!(slot, "channel send ring full, frame dropped");
        }
    }

    /// Writes a frame onto a worker's channel immediately, bypassing the
    /// reactor. For bootstrap messages.
    pub fn sync_worker(&mut self, framed: &[u8], slot: u32, blacklist: &[u32]) {
        if self.worker_num <= 1 {
            return;
        }
        if slot as usize == MAX_PROCESS {
            for i in 0..MAX_PROCESS {
                if blacklist.contains(&(i as u32)) {
                    continue;
                }
                self.sync_to_slot(i, framed);
            }
        } else if (slot as usize) < MAX_PROCESS {
            self.sync_to_slot(slot as usize, framed);
        }
    }

    fn sync_to_slot(&mut self, slot: usize, framed: &[u8]) {
        if Some(slot) == self.slot || self.workers[slot].pid == -1 {
            return;
        }
        let Some(token) = self.workers[slot].token else {
            return;
        };
        let Some(idx) = self.tasks.iter().position(|(t, _)| *t == token) else {
            return;
        };
        if let Conduit::Channel(channel) = self.tasks[idx].1.conduit_mut() {
            match channel.send_bytes(framed) {
                Ok(n) if n == framed.len() => {}
                Ok(_) => warn!(slot, "short channel write"),
                Err(e) => warn!(slot, error = %e, "channel write failed"),
            }
        }
    }

    /// Observes the process-wide flags once per iteration. Returns true when
    /// the reactor must stop now.
    pub fn handle_signal(&mut self) -> bool {
        if signal::terminate_requested() {
            self.process_exit();
            return true;
        }
        if signal::take_quit() && !self.exiting {
            info!("draining for graceful shutdown");
            self.exiting = true;
            self.listeners_from_poll();
        }
        false
    }

    /// Heartbeat sweep. Unconnected tasks are dropped, everyone else gets a
    /// keepalive, and anyone past the missed-heartbeat limit is removed.
    pub fn check_tick(&mut self) {
        if !self.tick.fired() {
            return;
        }
        if !self.cfg.heartbeat_turn {
            return;
        }

        let mut i = self.tasks.len();
        while i != 0 {
            i -= 1;
            let sweepable = {
                let t = &self.tasks[i].1;
                t.conduit().kind() == SockType::Connect &&
                    matches!(t.kind(), SockProto::Tcp | SockProto::Unix)
            };
            if !sweepable {
                continue;
            }
            if self.tasks[i].1.state() == SockState::Unconnected {
                self.disconnect_at(i);
                continue;
            }
            if self.tasks[i].1.heartbeat_send().is_ok() {
                self.rearm(i, Interest::READABLE | Interest::WRITABLE);
            }
            if self.tasks[i].1.heartbeat_out() {
                self.disconnect_at(i);
            }
        }
    }

    fn init_poll(&mut self) -> NetResult<()> {
        let poll = Poll::new().map_err(|source| NetError::Io { ctx: "Server::init_poll", source })?;
        self.poll = Some(poll);
        self.events = Events::with_capacity(LISTEN_BACKLOG);
        Ok(())
    }

    /// Installs a task in the pool and the poll.
    pub fn add_task(&mut self, task: Task, interest: Interest) -> NetResult<Token> {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.register(task.fd(), token, interest)?;
        self.tasks.push((token, task));
        Ok(token)
    }

    /// Pool-only insertion for listeners created before the poll exists.
    fn add_to_pool(&mut self, task: Task) -> Token {
        let token = Token(self.next_token);
        self.next_token += 1;
        self.tasks.push((token, task));
        token
    }

    fn disconnect_at(&mut self, idx: usize) {
        let mut hook = self.on_disconnect.take();
        if let Some(h) = hook.as_mut() {
            h(&mut self.tasks[idx].1);
        }
        self.on_disconnect = hook;

        let (token, task) = self.tasks.swap_remove(idx);
        self.deregister(task.fd());
        self.listener_tokens.retain(|t| *t != token);
        for rec in &mut self.workers {
            if rec.token == Some(token) {
                rec.token = None;
            }
        }
        // Dropping the task closes its descriptor.
    }

    fn channels_to_poll(&mut self) -> NetResult<()> {
        for slot in 0..self.workers.len() {
            if self.workers[slot].pid == -1 {
                continue;
            }
            let Some(pair) = self.workers[slot].channel.take() else {
                continue;
            };
            let task = Task::new(Conduit::Channel(pair));
            let token = self.add_task(task, Interest::READABLE)?;
            self.workers[slot].token = Some(token);
        }
        Ok(())
    }

    fn listeners_to_poll(&mut self) -> NetResult<()> {
        if self.listeners_polled {
            return Ok(());
        }
        for i in 0..self.listener_tokens.len() {
            let token = self.listener_tokens[i];
            let Some(idx) = self.tasks.iter().position(|(t, _)| *t == token) else {
                continue;
            };
            self.register(self.tasks[idx].1.fd(), token, Interest::READABLE)?;
        }
        self.listeners_polled = true;
        Ok(())
    }

    fn listeners_from_poll(&mut self) {
        if !self.listeners_polled {
            return;
        }
        for i in 0..self.listener_tokens.len() {
            let token = self.listener_tokens[i];
            if let Some(idx) = self.tasks.iter().position(|(t, _)| *t == token) {
                self.deregister(self.tasks[idx].1.fd());
            }
        }
        self.listeners_polled = false;
    }

    fn register(&self, fd: RawFd, token: Token, interest: Interest) -> NetResult<()> {
        let poll = self
            .poll
            .as_ref()
            .ok_or(NetError::InvalidArgument("Server", "reactor not initialized"))?;
        poll.registry()
            .register(&mut SourceFd(&fd), token, interest)
            .map_err(|source| NetError::Io { ctx: "Server register()", source })
    }

    fn rearm(&mut self, idx: usize, interest: Interest) {
        let (token, fd) = (self.tasks[idx].0, self.tasks[idx].1.fd());
        if let Some(poll) = self.poll.as_ref() &&
            let Err(e) = poll.registry().reregister(&mut SourceFd(&fd), token, interest)
        {
            debug!(error = %e, "reregister failed");
        }
    }

    fn deregister(&self, fd: RawFd) {
        if fd == FD_UNKNOWN {
            return;
        }
        if let Some(poll) = self.poll.as_ref() &&
            let Err(e) = poll.registry().deregister(&mut SourceFd(&fd))
        {
            debug!(error = %e, "deregister failed");
        }
    }

    fn release_accept_mutex(&mut self) {
        if self.accept_held {
            if let Some(mutex) = self.accept_mutex.as_mut() {
                mutex.release(self.pid);
            }
            self.accept_held = false;
            self.listeners_from_poll();
        }
    }

    /// Tears the worker down: mutex released, pool dropped (closing every
    /// descriptor), multiplexer closed.
    fn process_exit(&mut self) {
        self.release_accept_mutex();
        self.tasks.clear();
        self.listener_tokens.clear();
        self.listeners_polled = false;
        for rec in &mut self.workers {
            rec.token = None;
        }
        self.poll = None;
        self.accept_mutex = None;
        info!(pid = self.pid, "reactor exited");
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        if self.poll.is_some() {
            self.process_exit();
        }
    }
}
