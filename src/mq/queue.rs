use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::{Duration, SystemTime};

use log::debug;

use crate::config::QueueConfig;
use crate::core::{Error, Result};
use crate::mq::notify::NotifySession;
use crate::mq::sys::{self, MqAttr};

/// An open kernel message queue. Closed on drop; the queue itself lives
/// until [`KernelQueue::destroy`].
#[derive(Debug)]
pub struct KernelQueue {
    fd: OwnedFd,
    name: String,
}

impl KernelQueue {
    /// Creates `name` exclusively with the config's dimensions.
    pub fn create(name: &str, config: &QueueConfig) -> Result<Self> {
        Self::open_with(name, libc::O_CREAT | libc::O_EXCL, config)
    }

    pub fn open(name: &str) -> Result<Self> {
        Self::open_with(name, 0, &QueueConfig::default())
    }

    pub fn open_or_create(name: &str, config: &QueueConfig) -> Result<Self> {
        Self::open_with(name, libc::O_CREAT, config)
    }

    fn open_with(name: &str, create_flags: libc::c_int, config: &QueueConfig) -> Result<Self> {
        let mut flags = libc::O_RDWR | libc::O_CLOEXEC | create_flags;
        if config.nonblocking {
            flags |= libc::O_NONBLOCK;
        }
        let attrs = if create_flags & libc::O_CREAT != 0 {
            config.validate()?;
            Some(MqAttr::new(config.capacity, config.max_message_size))
        } else {
            None
        };
        let fd = sys::mq_open(name, flags, config.mode as libc::mode_t, attrs.as_ref())?;
        debug!("opened kernel queue {name} as fd {fd}");
        Ok(Self {
            // SAFETY: mq_open returned a fresh descriptor we now own.
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            name: name.to_string(),
        })
    }

    pub fn destroy(name: &str) -> Result<()> {
        sys::mq_unlink(name)?;
        debug!("unlinked kernel queue {name}");
        Ok(())
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The queue descriptor; this is the id notifications carry.
    pub fn id(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn send(&self, payload: &[u8], priority: u32) -> Result<()> {
        sys::mq_timedsend(self.id(), payload, priority, None)
    }

    pub fn send_timeout(&self, payload: &[u8], priority: u32, timeout: Duration) -> Result<()> {
        sys::mq_timedsend(self.id(), payload, priority, Some(deadline(timeout)?))
    }

    /// `buf` must be at least [`KernelQueue::max_message_size`] long.
    pub fn receive(&self, buf: &mut [u8]) -> Result<(usize, u32)> {
        sys::mq_timedreceive(self.id(), buf, None)
    }

    pub fn receive_timeout(&self, buf: &mut [u8], timeout: Duration) -> Result<(usize, u32)> {
        sys::mq_timedreceive(self.id(), buf, Some(deadline(timeout)?))
    }

    pub fn attributes(&self) -> Result<MqAttr> {
        sys::mq_getsetattr(self.id(), None)
    }

    pub fn max_message_size(&self) -> Result<usize> {
        Ok(self.attributes()?.max_message_size as usize)
    }

    /// Switches blocking mode, returning the attributes in force before.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<MqAttr> {
        let current = self.attributes()?;
        sys::mq_getsetattr(self.id(), Some(&current.with_nonblocking(nonblocking)))
    }

    /// Starts streaming "became non-empty" notifications for this queue.
    pub fn notify(&self) -> Result<NotifySession> {
        NotifySession::arm(self.id())
    }
}

fn deadline(timeout: Duration) -> Result<SystemTime> {
    SystemTime::now()
        .checked_add(timeout)
        .ok_or(Error::InvalidConfig("timeout overflows the realtime clock"))
}
