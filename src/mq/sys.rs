//! Raw `mq_*` system calls and the kernel structures they take.
//!
//! Calls go straight through `syscall(2)` rather than the libc wrappers:
//! `mq_notify` with a netlink target and caller-owned cookie is only
//! reachable at this level. Every pointer handed to the kernel comes from a
//! borrow that outlives the call.

use std::ffi::CString;
use std::marker::PhantomData;
use std::mem::size_of;
use std::os::unix::io::RawFd;
use std::time::{SystemTime, UNIX_EPOCH};

use libc::{c_int, c_long, c_uint, mode_t};

use crate::core::{Error, Result};

pub const SIGEV_THREAD: c_int = 2;

pub const NOTIFY_COOKIE_LEN: usize = 32;
/// Status the kernel writes into the cookie's last byte.
pub const NOTIFY_WOKENUP: u8 = 1;
pub const NOTIFY_REMOVED: u8 = 2;

const SIGEVENT_SIZE: usize = 64;
const SIGEVENT_PAD: usize = SIGEVENT_SIZE - 3 * size_of::<usize>() - 2 * size_of::<c_int>();

/// `struct mq_attr` as the kernel reads and writes it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MqAttr {
    pub flags: c_long,
    pub max_messages: c_long,
    pub max_message_size: c_long,
    pub current_messages: c_long,
    _reserved: [c_long; 4],
}

const _: () = assert!(size_of::<MqAttr>() == 8 * size_of::<c_long>());

impl MqAttr {
    pub fn new(max_messages: usize, max_message_size: usize) -> Self {
        Self {
            max_messages: max_messages as c_long,
            max_message_size: max_message_size as c_long,
            ..Self::default()
        }
    }

    pub fn with_nonblocking(mut self, nonblocking: bool) -> Self {
        if nonblocking {
            self.flags |= libc::O_NONBLOCK as c_long;
        } else {
            self.flags &= !(libc::O_NONBLOCK as c_long);
        }
        self
    }

    pub fn is_nonblocking(&self) -> bool {
        self.flags & libc::O_NONBLOCK as c_long != 0
    }
}

/// The 32-byte payload the kernel echoes back on the netlink socket.
///
/// The first machine word carries the queue descriptor; the kernel
/// overwrites the last byte with a `NOTIFY_*` status on delivery.
#[repr(C, align(8))]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NotifyCookie([u8; NOTIFY_COOKIE_LEN]);

const _: () = assert!(size_of::<NotifyCookie>() == NOTIFY_COOKIE_LEN);

impl NotifyCookie {
    pub fn for_queue(queue_id: RawFd) -> Self {
        let mut bytes = [0u8; NOTIFY_COOKIE_LEN];
        let word = (queue_id as isize).to_ne_bytes();
        bytes[..word.len()].copy_from_slice(&word);
        Self(bytes)
    }

    /// Decodes a delivery, or `None` if it is not exactly one cookie.
    pub fn decode(bytes: &[u8]) -> Option<(RawFd, u8)> {
        if bytes.len() != NOTIFY_COOKIE_LEN {
            return None;
        }
        let word: [u8; size_of::<isize>()] = bytes[..size_of::<isize>()].try_into().ok()?;
        let queue_id = RawFd::try_from(isize::from_ne_bytes(word)).ok()?;
        Some((queue_id, bytes[NOTIFY_COOKIE_LEN - 1]))
    }

    pub fn as_bytes(&self) -> &[u8; NOTIFY_COOKIE_LEN] {
        &self.0
    }
}

/// `struct sigevent` laid out as the kernel's 64-byte ABI block.
///
/// The lifetime ties a netlink event to the cookie its value points at, so
/// the cookie cannot move or drop while the event is in use.
#[repr(C)]
pub struct SigEvent<'a> {
    value: usize,
    signo: c_int,
    notify: c_int,
    function: usize,
    attributes: usize,
    _pad: [u8; SIGEVENT_PAD],
    _cookie: PhantomData<&'a NotifyCookie>,
}

const _: () = assert!(size_of::<SigEvent<'static>>() == SIGEVENT_SIZE);

impl<'a> SigEvent<'a> {
    fn raw(notify: c_int, signo: c_int, value: usize) -> Self {
        Self {
            value,
            signo,
            notify,
            function: 0,
            attributes: 0,
            _pad: [0u8; SIGEVENT_PAD],
            _cookie: PhantomData,
        }
    }

    /// Delivers `cookie` to the netlink socket `socket`.
    pub fn netlink(socket: RawFd, cookie: &'a NotifyCookie) -> Self {
        Self::raw(SIGEV_THREAD, socket, cookie.as_bytes().as_ptr() as usize)
    }

    pub fn notify_mode(&self) -> c_int {
        self.notify
    }
}

fn last_errno() -> c_int {
    std::io::Error::last_os_error().raw_os_error().unwrap_or(0)
}

/// The kernel takes the bare name; the conventional leading `/` is dropped.
fn queue_name(name: &str) -> Result<CString> {
    let bare = name.strip_prefix('/').unwrap_or(name);
    if bare.is_empty() || bare.contains('/') {
        return Err(Error::InvalidConfig("queue name must be one path component"));
    }
    CString::new(bare).map_err(|_| Error::InvalidConfig("queue name contains NUL"))
}

/// Converts an absolute deadline into the realtime `timespec` the kernel wants.
pub fn deadline_timespec(deadline: SystemTime) -> libc::timespec {
    let since_epoch = deadline.duration_since(UNIX_EPOCH).unwrap_or_default();
    libc::timespec {
        tv_sec: since_epoch.as_secs() as libc::time_t,
        tv_nsec: since_epoch.subsec_nanos() as c_long,
    }
}

pub fn mq_open(name: &str, flags: c_int, mode: mode_t, attrs: Option<&MqAttr>) -> Result<RawFd> {
    let cname = queue_name(name)?;
    let attrs_ptr = attrs.map_or(std::ptr::null(), |attrs| attrs as *const MqAttr);
    // SAFETY: cname and attrs are borrowed for the duration of the call.
    let res = unsafe {
        libc::syscall(
            libc::SYS_mq_open,
            cname.as_ptr(),
            flags as c_long,
            mode as c_long,
            attrs_ptr,
        )
    };
    if res < 0 {
        return Err(match last_errno() {
            libc::ENOENT => Error::NotFound(name.to_string()),
            libc::EEXIST => Error::AlreadyExists(name.to_string()),
            code => Error::SyscallFailed {
                operation: "mq_open",
                code,
            },
        });
    }
    Ok(res as RawFd)
}

pub fn mq_timedsend(
    id: RawFd,
    payload: &[u8],
    priority: u32,
    deadline: Option<SystemTime>,
) -> Result<()> {
    let ts = deadline.map(deadline_timespec);
    let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |ts| ts as *const libc::timespec);
    // SAFETY: payload and ts outlive the call; the kernel only reads them.
    let res = unsafe {
        libc::syscall(
            libc::SYS_mq_timedsend,
            id as c_long,
            payload.as_ptr(),
            payload.len(),
            priority as c_long,
            ts_ptr,
        )
    };
    if res < 0 {
        return Err(match last_errno() {
            libc::ETIMEDOUT => Error::Timeout,
            libc::EAGAIN => Error::CapacityExceeded,
            libc::EMSGSIZE => Error::MessageTooLarge {
                len: payload.len(),
                max: mq_getsetattr(id, None)
                    .map(|attrs| attrs.max_message_size as usize)
                    .unwrap_or(0),
            },
            code => Error::SyscallFailed {
                operation: "mq_timedsend",
                code,
            },
        });
    }
    Ok(())
}

/// Receives into `buf`, which must hold at least the queue's maximum
/// message size. Returns `(bytes_read, priority)`.
pub fn mq_timedreceive(
    id: RawFd,
    buf: &mut [u8],
    deadline: Option<SystemTime>,
) -> Result<(usize, u32)> {
    let ts = deadline.map(deadline_timespec);
    let ts_ptr = ts.as_ref().map_or(std::ptr::null(), |ts| ts as *const libc::timespec);
    let mut priority: c_uint = 0;
    // SAFETY: buf is writable for buf.len() bytes and priority is a live local.
    let res = unsafe {
        libc::syscall(
            libc::SYS_mq_timedreceive,
            id as c_long,
            buf.as_mut_ptr(),
            buf.len(),
            &mut priority as *mut c_uint,
            ts_ptr,
        )
    };
    if res < 0 {
        return Err(match last_errno() {
            libc::ETIMEDOUT => Error::Timeout,
            libc::EAGAIN => Error::QueueEmpty,
            libc::EMSGSIZE => Error::BufferTooSmall {
                needed: mq_getsetattr(id, None)
                    .map(|attrs| attrs.max_message_size as usize)
                    .unwrap_or(0),
                available: buf.len(),
            },
            code => Error::SyscallFailed {
                operation: "mq_timedreceive",
                code,
            },
        });
    }
    Ok((res as usize, priority))
}

/// Registers (`Some`) or drops (`None`) the queue's one-shot notification.
pub fn mq_notify(id: RawFd, event: Option<&SigEvent<'_>>) -> Result<()> {
    let event_ptr = event.map_or(std::ptr::null(), |event| event as *const SigEvent<'_>);
    // SAFETY: event is null or borrowed, together with its cookie, for the call.
    let res = unsafe { libc::syscall(libc::SYS_mq_notify, id as c_long, event_ptr) };
    if res < 0 {
        return Err(match last_errno() {
            libc::EBUSY => Error::AlreadyArmed,
            code => Error::SyscallFailed {
                operation: "mq_notify",
                code,
            },
        });
    }
    Ok(())
}

/// Returns the current attributes, applying the flags of `new_attrs` in the
/// same call when given.
pub fn mq_getsetattr(id: RawFd, new_attrs: Option<&MqAttr>) -> Result<MqAttr> {
    let mut old = MqAttr::default();
    let new_ptr = new_attrs.map_or(std::ptr::null(), |attrs| attrs as *const MqAttr);
    // SAFETY: new_attrs is null or borrowed; old is a live local the kernel fills.
    let res = unsafe {
        libc::syscall(
            libc::SYS_mq_getsetattr,
            id as c_long,
            new_ptr,
            &mut old as *mut MqAttr,
        )
    };
    if res < 0 {
        return Err(Error::SyscallFailed {
            operation: "mq_getsetattr",
            code: last_errno(),
        });
    }
    Ok(old)
}

pub fn mq_unlink(name: &str) -> Result<()> {
    let cname = queue_name(name)?;
    // SAFETY: cname is a NUL-terminated string alive for the call.
    let res = unsafe { libc::syscall(libc::SYS_mq_unlink, cname.as_ptr()) };
    if res < 0 {
        return Err(match last_errno() {
            libc::ENOENT => Error::NotFound(name.to_string()),
            code => Error::SyscallFailed {
                operation: "mq_unlink",
                code,
            },
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn abi_block_sizes() {
        assert_eq!(size_of::<MqAttr>(), 8 * size_of::<c_long>());
        assert_eq!(size_of::<SigEvent<'static>>(), 64);
        assert_eq!(size_of::<NotifyCookie>(), NOTIFY_COOKIE_LEN);
    }

    #[test]
    fn sigevent_fields_land_at_kernel_offsets() {
        let cookie = NotifyCookie::for_queue(7);
        let event = SigEvent::netlink(11, &cookie);
        let base = &event as *const SigEvent<'_> as usize;
        assert_eq!(&event.value as *const usize as usize - base, 0);
        assert_eq!(&event.signo as *const c_int as usize - base, size_of::<usize>());
        assert_eq!(
            &event.notify as *const c_int as usize - base,
            size_of::<usize>() + size_of::<c_int>()
        );
        assert_eq!(event.notify_mode(), SIGEV_THREAD);
        assert_eq!(event.value, cookie.as_bytes().as_ptr() as usize);
    }

    #[test]
    fn cookie_decodes_queue_id_and_status() {
        let mut bytes = *NotifyCookie::for_queue(42).as_bytes();
        bytes[NOTIFY_COOKIE_LEN - 1] = NOTIFY_WOKENUP;
        assert_eq!(NotifyCookie::decode(&bytes), Some((42, NOTIFY_WOKENUP)));
        assert_eq!(NotifyCookie::decode(&bytes[..31]), None);
    }

    #[test]
    fn nonblocking_flag_round_trips() {
        let attrs = MqAttr::new(4, 128).with_nonblocking(true);
        assert!(attrs.is_nonblocking());
        assert!(!attrs.with_nonblocking(false).is_nonblocking());
    }

    #[test]
    fn deadline_splits_seconds_and_nanos() {
        let deadline = UNIX_EPOCH + Duration::new(12, 345);
        let ts = deadline_timespec(deadline);
        assert_eq!(ts.tv_sec, 12);
        assert_eq!(ts.tv_nsec, 345);
    }

    #[test]
    fn names_with_nul_are_invalid() {
        assert!(matches!(
            mq_open("/bad\0name", libc::O_RDONLY, 0, None),
            Err(Error::InvalidConfig(_))
        ));
        assert!(matches!(queue_name("/a/b"), Err(Error::InvalidConfig(_))));
        assert!(matches!(queue_name("/"), Err(Error::InvalidConfig(_))));
        assert_eq!(queue_name("/jobs").expect("name").as_bytes(), b"jobs");
        assert_eq!(queue_name("jobs").expect("name").as_bytes(), b"jobs");
    }

    #[test]
    fn unlink_missing_queue_is_not_found() {
        let name = format!("/ipc-mq-missing-{}", std::process::id());
        assert!(matches!(mq_unlink(&name), Err(Error::NotFound(_))));
    }
}
