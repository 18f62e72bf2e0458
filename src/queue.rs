//! Emulated message queue: a [`SharedHeap`] inside one shared file.
//!
//! The file starts with a 64-byte control block holding the futex words
//! that blocked senders and receivers sleep on; the heap region follows.
//! Every heap mutation happens under an exclusive `flock` of the file.

use std::fs::File;
use std::mem::size_of;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use log::debug;

use crate::config::QueueConfig;
use crate::core::heap::required_region_size;
use crate::core::wait::{bump_and_wake, remaining, wait_while_equal};
use crate::core::{Error, MmapFile, RegionLock, Result, SharedHeap, SharedRegion};

pub const CTRL_MAGIC: u32 = 0x4950_4351; // 'IPCQ'
pub const CTRL_VERSION: u32 = 1;
pub const CONTROL_SIZE: usize = 64;

const INIT_IN_PROGRESS: u32 = 1;
const INIT_READY: u32 = 2;
const INIT_TIMEOUT: Duration = Duration::from_secs(1);

#[repr(C, align(64))]
struct ControlBlock {
    magic: AtomicU32,
    version: AtomicU32,
    init_state: AtomicU32,
    // Bumped after every push; receivers sleep on it.
    not_empty_seq: AtomicU32,
    // Bumped after every pop; senders sleep on it.
    not_full_seq: AtomicU32,
    _pad: [u8; 44],
}

const _: () = assert!(size_of::<ControlBlock>() == CONTROL_SIZE);

/// The part of the mapping behind the control block.
struct QueueRegion {
    map: MmapFile,
    base: *mut u8,
}

// SAFETY: QueueRegion owns the mapping its base pointer points into.
unsafe impl Send for QueueRegion {}

impl QueueRegion {
    fn new(mut map: MmapFile) -> Result<Self> {
        if map.len() < CONTROL_SIZE {
            return Err(Error::Corrupt("queue file smaller than control block"));
        }
        let base = map.as_mut_slice().as_mut_ptr();
        Ok(Self { map, base })
    }

    fn control(&self) -> &ControlBlock {
        // SAFETY: the mapping is page aligned and at least CONTROL_SIZE bytes.
        unsafe { &*(self.base as *const ControlBlock) }
    }
}

impl SharedRegion for QueueRegion {
    fn as_mut_ptr(&mut self) -> *mut u8 {
        // SAFETY: CONTROL_SIZE <= map.len(), checked in `new`.
        unsafe { self.base.add(CONTROL_SIZE) }
    }

    fn len(&self) -> usize {
        self.map.len() - CONTROL_SIZE
    }
}

/// Total file size for a queue of `capacity` messages of up to
/// `max_message_size` bytes.
pub fn required_size(capacity: usize, max_message_size: usize) -> Result<usize> {
    required_region_size(capacity, max_message_size)?
        .checked_add(CONTROL_SIZE)
        .ok_or(Error::InvalidConfig("queue size overflows usize"))
}

/// Default location for a queue named `name`.
pub fn shm_path(name: &str) -> PathBuf {
    Path::new("/dev/shm").join(name.trim_start_matches('/'))
}

pub struct SharedQueue {
    path: PathBuf,
    heap: SharedHeap<QueueRegion>,
    lock_file: File,
    nonblocking: bool,
}

impl SharedQueue {
    pub fn create(path: &Path, config: &QueueConfig) -> Result<Self> {
        config.validate()?;
        let size = required_size(config.capacity, config.max_message_size)?;
        let map = MmapFile::create_new(path, size, config.mode)?;
        let queue = Self::format(path, map, config).map_err(|err| {
            let _ = std::fs::remove_file(path);
            err
        })?;
        debug!(
            "created shared queue {} (capacity {}, max message {} bytes)",
            path.display(),
            config.capacity,
            config.max_message_size
        );
        Ok(queue)
    }

    pub fn open(path: &Path) -> Result<Self> {
        Self::open_with(path, false)
    }

    /// Opens a queue whose send/receive fail instead of blocking.
    pub fn open_nonblocking(path: &Path) -> Result<Self> {
        Self::open_with(path, true)
    }

    pub fn open_or_create(path: &Path, config: &QueueConfig) -> Result<Self> {
        match Self::create(path, config) {
            Err(Error::AlreadyExists(_)) => Self::open_with(path, config.nonblocking),
            other => other,
        }
    }

    /// Removes the backing file. Handles already open keep working.
    pub fn destroy(path: &Path) -> Result<()> {
        std::fs::remove_file(path).map_err(|err| match err.kind() {
            std::io::ErrorKind::NotFound => Error::NotFound(path.display().to_string()),
            _ => Error::Io(err),
        })?;
        debug!("destroyed shared queue {}", path.display());
        Ok(())
    }

    fn format(path: &Path, map: MmapFile, config: &QueueConfig) -> Result<Self> {
        let lock_file = map.file().try_clone()?;
        let region = QueueRegion::new(map)?;
        let ctrl = region.control();
        ctrl.init_state.store(INIT_IN_PROGRESS, Ordering::Relaxed);
        ctrl.version.store(CTRL_VERSION, Ordering::Relaxed);
        ctrl.not_empty_seq.store(0, Ordering::Relaxed);
        ctrl.not_full_seq.store(0, Ordering::Relaxed);
        let heap = SharedHeap::create(region, config.capacity, config.max_message_size)?;
        let ctrl = heap.region().control();
        ctrl.magic.store(CTRL_MAGIC, Ordering::Relaxed);
        ctrl.init_state.store(INIT_READY, Ordering::Release);
        Ok(Self {
            path: path.to_path_buf(),
            heap,
            lock_file,
            nonblocking: config.nonblocking,
        })
    }

    fn open_with(path: &Path, nonblocking: bool) -> Result<Self> {
        let deadline = Instant::now() + INIT_TIMEOUT;
        let map = map_when_sized(path, deadline)?;
        let lock_file = map.file().try_clone()?;
        let region = QueueRegion::new(map)?;
        wait_ready(region.control(), deadline)?;
        let heap = SharedHeap::open(region)?;
        debug!("opened shared queue {}", path.display());
        Ok(Self {
            path: path.to_path_buf(),
            heap,
            lock_file,
            nonblocking,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn capacity(&self) -> usize {
        self.heap.max_size()
    }

    pub fn max_message_size(&self) -> usize {
        self.heap.max_message_size()
    }

    /// Messages currently queued, as seen without taking the lock.
    pub fn len(&self) -> usize {
        self.heap.observer_len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queues `payload`, blocking while the queue is full unless the handle
    /// is non-blocking.
    pub fn send(&mut self, payload: &[u8], priority: i32) -> Result<()> {
        self.send_until(payload, priority, !self.nonblocking, None)
    }

    pub fn try_send(&mut self, payload: &[u8], priority: i32) -> Result<()> {
        self.send_until(payload, priority, false, None)
    }

    pub fn send_timeout(&mut self, payload: &[u8], priority: i32, timeout: Duration) -> Result<()> {
        self.send_until(payload, priority, true, Some(Instant::now() + timeout))
    }

    /// Pops the highest-priority message into `buf`, returning its length
    /// and priority. Blocks while empty unless the handle is non-blocking.
    pub fn receive(&mut self, buf: &mut [u8]) -> Result<(usize, i32)> {
        self.receive_until(buf, !self.nonblocking, None)
    }

    pub fn try_receive(&mut self, buf: &mut [u8]) -> Result<(usize, i32)> {
        self.receive_until(buf, false, None)
    }

    pub fn receive_timeout(&mut self, buf: &mut [u8], timeout: Duration) -> Result<(usize, i32)> {
        self.receive_until(buf, true, Some(Instant::now() + timeout))
    }

    /// Waits until the queue looks non-empty. Returns `false` on timeout.
    pub fn wait_not_empty(&self, timeout: Option<Duration>) -> Result<bool> {
        let deadline = timeout.map(|timeout| Instant::now() + timeout);
        let ctrl = self.control();
        loop {
            let seq = ctrl.not_empty_seq.load(Ordering::Acquire);
            if self.heap.observer_len() > 0 {
                return Ok(true);
            }
            let left = remaining(deadline);
            if left == Some(Duration::ZERO) {
                return Ok(false);
            }
            wait_while_equal(&ctrl.not_empty_seq, seq, left)?;
        }
    }

    fn control(&self) -> &ControlBlock {
        self.heap.region().control()
    }

    fn send_until(
        &mut self,
        payload: &[u8],
        priority: i32,
        block: bool,
        deadline: Option<Instant>,
    ) -> Result<()> {
        loop {
            let seq = self.control().not_full_seq.load(Ordering::Acquire);
            let pushed = {
                let _guard = RegionLock::acquire(&self.lock_file)?;
                match self.heap.push(priority, payload) {
                    Ok(()) => true,
                    Err(Error::CapacityExceeded) => false,
                    Err(err) => return Err(err),
                }
            };
            if pushed {
                return bump_and_wake(&self.control().not_empty_seq);
            }
            if !block {
                return Err(Error::CapacityExceeded);
            }
            let left = remaining(deadline);
            if left == Some(Duration::ZERO) {
                return Err(Error::Timeout);
            }
            wait_while_equal(&self.control().not_full_seq, seq, left)?;
        }
    }

    fn receive_until(
        &mut self,
        buf: &mut [u8],
        block: bool,
        deadline: Option<Instant>,
    ) -> Result<(usize, i32)> {
        loop {
            let seq = self.control().not_empty_seq.load(Ordering::Acquire);
            let popped = {
                let _guard = RegionLock::acquire(&self.lock_file)?;
                match self.heap.pop(buf) {
                    Ok(msg) => Some(msg),
                    Err(Error::QueueEmpty) => None,
                    Err(err) => return Err(err),
                }
            };
            if let Some(msg) = popped {
                bump_and_wake(&self.control().not_full_seq)?;
                return Ok(msg);
            }
            if !block {
                return Err(Error::QueueEmpty);
            }
            let left = remaining(deadline);
            if left == Some(Duration::ZERO) {
                return Err(Error::Timeout);
            }
            wait_while_equal(&self.control().not_empty_seq, seq, left)?;
        }
    }
}

/// Maps `path`, treating a still-empty file as a creator that has not
/// sized it yet.
fn map_when_sized(path: &Path, deadline: Instant) -> Result<MmapFile> {
    loop {
        match MmapFile::open(path) {
            Err(Error::Corrupt(_)) if Instant::now() < deadline => {
                std::thread::sleep(Duration::from_millis(1));
            }
            other => return other,
        }
    }
}

fn wait_ready(ctrl: &ControlBlock, deadline: Instant) -> Result<()> {
    while ctrl.init_state.load(Ordering::Acquire) != INIT_READY {
        if Instant::now() >= deadline {
            return Err(Error::Corrupt("queue never finished initialising"));
        }
        std::thread::yield_now();
    }
    if ctrl.magic.load(Ordering::Acquire) != CTRL_MAGIC {
        return Err(Error::Corrupt("queue control magic mismatch"));
    }
    if ctrl.version.load(Ordering::Acquire) != CTRL_VERSION {
        return Err(Error::Corrupt("unsupported queue control version"));
    }
    Ok(())
}
