//! Cluster-wide accept serialization.
//!
//! At most one worker may have its listeners registered at any instant. Two
//! interchangeable backings provide that guarantee: a 32-bit atomic in a
//! shared-memory segment claimed by CAS against the holder's pid, or a
//! non-blocking exclusive advisory lock on a well-known path. The choice is
//! invisible on the wire.

use std::{
    ffi::CString,
    mem,
    os::fd::RawFd,
    path::Path,
    sync::atomic::{AtomicI32, Ordering},
};

use shared_memory::{Shmem, ShmemConf};
use tracing::warn;
use warren_network::{FD_UNKNOWN, NetError, NetResult};

/// Atomic value meaning "nobody holds the mutex".
const FREE: i32 = -1;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AcceptBackend {
    SharedAtomic,
    AdvisoryLock,
}

pub enum AcceptMutex {
    SharedAtomic { shmem: Shmem },
    AdvisoryLock { fd: RawFd, locked: bool },
}

// The segment pointer is only ever dereferenced as an AtomicI32.
unsafe impl Send for AcceptMutex {}

impl AcceptMutex {
    /// Master side: creates the backing object and marks the mutex free.
    pub fn create(backend: AcceptBackend, path: &Path) -> NetResult<Self> {
        match backend {
            AcceptBackend::SharedAtomic => {
                let shmem = ShmemConf::new()
                    .size(mem::size_of::<AtomicI32>())
                    .flink(path)
                    .create()
                    .map_err(|_| {
                        NetError::InvalidArgument("AcceptMutex::create", "shmem create failed")
                    })?;
                let m = Self::SharedAtomic { shmem };
                m.atom().store(FREE, Ordering::SeqCst);
                Ok(m)
            }
            AcceptBackend::AdvisoryLock => Self::open_lock_file(path),
        }
    }

    /// Worker side: attaches to the backing object the master created.
    pub fn open(backend: AcceptBackend, path: &Path) -> NetResult<Self> {
        match backend {
            AcceptBackend::SharedAtomic => {
                let shmem = ShmemConf::new().flink(path).open().map_err(|_| {
                    NetError::InvalidArgument("AcceptMutex::open", "shmem open failed")
                })?;
                Ok(Self::SharedAtomic { shmem })
            }
            AcceptBackend::AdvisoryLock => Self::open_lock_file(path),
        }
    }

    fn open_lock_file(path: &Path) -> NetResult<Self> {
        let c = CString::new(path.as_os_str().as_encoded_bytes())
            .map_err(|_| NetError::InvalidArgument("AcceptMutex", "bad lock path"))?;
        let fd = unsafe { libc::open(c.as_ptr(), libc::O_CREAT | libc::O_RDWR, 0o644) };
        if fd == -1 {
            return Err(NetError::io("AcceptMutex open()"));
        }
        Ok(Self::AdvisoryLock { fd, locked: false })
    }

    fn atom(&self) -> &AtomicI32 {
        match self {
            Self::SharedAtomic { shmem } => unsafe { &*shmem.as_ptr().cast::<AtomicI32>() },
            Self::AdvisoryLock { .. } => unreachable!("advisory lock has no atomic"),
        }
    }

    /// Attempts the claim. Failure is benign: another worker holds it.
    pub fn try_acquire(&mut self, pid: i32) -> bool {
        match self {
            Self::SharedAtomic { .. } => self
                .atom()
                .compare_exchange_weak(FREE, pid, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok(),
            Self::AdvisoryLock { fd, locked } => {
                if unsafe { libc::flock(*fd, libc::LOCK_EX | libc::LOCK_NB) } == 0 {
                    *locked = true;
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Releases a claim made with the same pid. A `false` return means the
    /// release did not take this round; the caller retries next iteration.
    pub fn release(&mut self, pid: i32) -> bool {
        match self {
            Self::SharedAtomic { .. } => self
                .atom()
                .compare_exchange_weak(pid, FREE, Ordering::SeqCst, Ordering::Relaxed)
                .is_ok(),
            Self::AdvisoryLock { fd, locked } => {
                if unsafe { libc::flock(*fd, libc::LOCK_UN) } == 0 {
                    *locked = false;
                    true
                } else {
                    warn!("advisory accept lock release failed");
                    false
                }
            }
        }
    }

    /// Master-side recovery after a worker died, possibly while holding the
    /// claim. The advisory lock releases itself when the holder's descriptors
    /// close, so only the atomic needs resetting.
    pub fn force_release(&mut self, pid: i32) {
        if let Self::SharedAtomic { .. } = self {
            let _ = self.atom().compare_exchange(pid, FREE, Ordering::SeqCst, Ordering::Relaxed);
        }
    }

    /// Current holder pid, when the backing exposes one.
    pub fn holder(&self) -> Option<i32> {
        match self {
            Self::SharedAtomic { .. } => {
                let v = self.atom().load(Ordering::SeqCst);
                (v != FREE).then_some(v)
            }
            Self::AdvisoryLock { .. } => None,
        }
    }

    /// Master-side teardown; removes the lock file. The shared segment itself
    /// is unmapped (and its link removed) when the owner drops.
    pub fn destroy(self, path: &Path) {
        if let Self::AdvisoryLock { .. } = &self {
            let _ = std::fs::remove_file(path);
        }
    }
}

impl Drop for AcceptMutex {
    fn drop(&mut self) {
        if let Self::AdvisoryLock { fd, .. } = self {
            if *fd != FD_UNKNOWN {
                unsafe {
                    libc::close(*fd);
                }
                *fd = FD_UNKNOWN;
            }
        }
    }
}
