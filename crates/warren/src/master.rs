//! Master process: spawns and monitors the worker pool.
//!
//! Each worker gets a channel pair created before `fork`; the master keeps
//! end `[0]`, the worker reads end `[1]`. When a new worker appears, its
//! write end is handed to every older worker over the bus as a channel-open
//! frame, so any worker can message any other. The master never runs a
//! reactor; it writes to workers directly and spends its life reaping and
//! respawning.

use std::time::Duration;

use mio::Token;
use tracing::{error, info, warn};
use warren_network::{
    ChannelPair, NetError, NetResult,
    frame::{self, ChannelOpen},
};

use crate::{accept::AcceptMutex, server::Server, signal};

/// Upper bound on worker slots; doubles as the broadcast sentinel.
pub const MAX_PROCESS: usize = 128;

/// One slot in the worker table. In the master the channel stays here; in a
/// worker it moves into a channel task and `token` points at it.
pub struct WorkerRecord {
    pub pid: libc::pid_t,
    pub channel: Option<ChannelPair>,
    pub token: Option<Token>,
    pub exiting: bool,
}

impl Default for WorkerRecord {
    fn default() -> Self {
        Self { pid: -1, channel: None, token: None, exiting: false }
    }
}

impl WorkerRecord {
    #[inline]
    pub fn live(&self) -> bool {
        self.pid != -1
    }
}

pub struct Master {
    server: Server,
    worker_num: u32,
    mutex: Option<AcceptMutex>,
    shutting_down: bool,
}

impl Master {
    pub fn new(server: Server, worker_num: u32) -> Self {
        let worker_num = worker_num.clamp(1, MAX_PROCESS as u32);
        Self { server, worker_num, mutex: None, shutting_down: false }
    }

    #[inline]
    pub fn server(&self) -> &Server {
        &self.server
    }

    #[inline]
    pub fn server_mut(&mut self) -> &mut Server {
        &mut self.server
    }

    /// Installs signals, creates the accept mutex, forks the pool and settles
    /// into the monitor loop. Worker processes never return from here.
    pub fn master_start(&mut self) -> NetResult<()> {
        signal::install()
            .map_err(|source| NetError::Io { ctx: "Master::master_start signals", source })?;
        self.server.set_worker_num(self.worker_num);

        if self.server.config().accept_turn && self.worker_num > 1 {
            self.mutex = Some(AcceptMutex::create(
                self.server.config().accept_backend,
                &self.server.config().accept_path,
            )?);
        }

        for slot in 0..self.worker_num as usize {
            self.spawn_worker(slot)?;
        }
        info!(workers = self.worker_num, "master running");
        self.master_loop()
    }

    fn spawn_worker(&mut self, slot: usize) -> NetResult<()> {
        let pair = ChannelPair::open()?;
        {
            let rec = &mut self.server.workers[slot];
            rec.pid = -1;
            rec.channel = Some(pair);
            rec.token = None;
            rec.exiting = false;
        }

        match unsafe { libc::fork() } {
            -1 => {
                self.server.workers[slot].channel = None;
                Err(NetError::io("Master::spawn_worker fork()"))
            }
            0 => {
                let pid = unsafe { libc::getpid() };
                self.server.workers[slot].pid = pid;
                self.prepare_child(slot);
                let code = match self.server.worker_start(slot) {
                    Ok(()) => 0,
                    Err(e) => {
                        error!(error = %e, slot, "worker reactor failed");
                        1
                    }
                };
                std::process::exit(code);
            }
            pid => {
                self.server.workers[slot].pid = pid;
                self.pass_open_channel(slot);
                info!(slot, pid, "worker spawned");
                Ok(())
            }
        }
    }

    /// In the child: drop the channel ends owned by other processes.
    fn prepare_child(&mut self, slot: usize) {
        for (i, rec) in self.server.workers.iter_mut().enumerate() {
            if let Some(channel) = rec.channel.as_mut() {
                if i == slot {
                    channel.close_end(0);
                } else {
                    channel.close_end(1);
                }
            }
        }
    }

    /// Hands the new worker's write end to every older live worker so the
    /// bus stays fully connected.
    fn pass_open_channel(&mut self, slot: usize) {
        let (pid, fd) = {
            let rec = &self.server.workers[slot];
            let Some(channel) = rec.channel.as_ref() else {
                return;
            };
            (rec.pid, channel.write_end())
        };

        let open = ChannelOpen { slot: slot as u32, pid, fd };
        let mut framed = Vec::new();
        if frame::frame_channel_open(&mut framed, &open).is_err() {
            return;
        }

        for (i, rec) in self.server.workers.iter_mut().enumerate() {
            if i == slot || !rec.live() {
                continue;
            }
            let Some(channel) = rec.channel.as_mut() else {
                continue;
            };
            match channel.send_bytes(&framed) {
                Ok(n) if n == framed.len() => {}
                Ok(_) => warn!(slot = i, "short channel-open write"),
                Err(e) => warn!(slot = i, error = %e, "channel-open send failed"),
            }
        }
    }

    fn master_loop(&mut self) -> NetResult<()> {
        loop {
            self.reap_workers();

            if signal::terminate_requested() {
                self.broadcast_control(frame::CHANNEL_TERMINATE);
                self.signal_workers(libc::SIGTERM);
                self.wait_then_kill();
                break;
            }
            if signal::take_quit() && !self.shutting_down {
                info!("master draining workers");
                self.shutting_down = true;
                self.broadcast_control(frame::CHANNEL_QUIT);
                self.signal_workers(libc::SIGQUIT);
            }
            if self.shutting_down && self.live_workers() == 0 {
                break;
            }
            std::thread::sleep(Duration::from_millis(50));
        }

        if let Some(mutex) = self.mutex.take() {
            mutex.destroy(&self.server.config().accept_path);
        }
        info!("master exited");
        Ok(())
    }

    /// Collects dead children. The accept mutex is always reset with the
    /// dead worker's pid, covering workers killed while holding it.
    fn reap_workers(&mut self) {
        loop {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
            if pid <= 0 {
                break;
            }
            if let Some(mutex) = self.mutex.as_mut() {
                mutex.force_release(pid);
            }
            let Some(slot) = self.server.workers.iter().position(|r| r.pid == pid) else {
                continue;
            };
            warn!(slot, pid, status, "worker exited");
            self.server.workers[slot].pid = -1;
            self.server.workers[slot].channel = None;

            if !self.shutting_down && !signal::terminate_requested() {
                if let Err(e) = self.spawn_worker(slot) {
                    error!(error = %e, slot, "respawn failed");
                }
            }
        }
    }

    fn wait_then_kill(&mut self) {
        for _ in 0..20 {
            self.reap_workers();
            if self.live_workers() == 0 {
                return;
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        for rec in &self.server.workers {
            if rec.live() {
                unsafe {
                    libc::kill(rec.pid, libc::SIGKILL);
                }
            }
        }
        while self.live_workers() > 0 {
            let mut status: libc::c_int = 0;
            let pid = unsafe { libc::waitpid(-1, &mut status, 0) };
            if pid <= 0 {
                break;
            }
            if let Some(mutex) = self.mutex.as_mut() {
                mutex.force_release(pid);
            }
            if let Some(slot) = self.server.workers.iter().position(|r| r.pid == pid) {
                self.server.workers[slot].pid = -1;
                self.server.workers[slot].channel = None;
            }
        }
    }

    /// Sends a channel control command to every live worker.
    fn broadcast_control(&mut self, para: u8) {
        let mut framed = Vec::new();
        if frame::frame_command(&mut framed, frame::CMD_CHANNEL, para, &[]).is_err() {
            return;
        }
        for rec in self.server.workers.iter_mut() {
            if !rec.live() {
                continue;
            }
            let Some(channel) = rec.channel.as_mut() else {
                continue;
            };
            if let Err(e) = channel.send_bytes(&framed) {
                warn!(pid = rec.pid, error = %e, "control frame not delivered");
            }
        }
    }

    fn signal_workers(&self, sig: libc::c_int) {
        for rec in &self.server.workers {
            if rec.live() {
                unsafe {
                    libc::kill(rec.pid, sig);
                }
            }
        }
    }

    fn live_workers(&self) -> usize {
        self.server.workers.iter().filter(|r| r.live()).count()
    }
}
