//! Turns the kernel's one-shot "queue became non-empty" notification into a
//! continuous, cancellable stream of queue ids.
//!
//! Arming opens a netlink socket for the kernel to deliver cookies to and a
//! Unix listener at a well-known path. A background thread polls both: a
//! cookie is republished and the notification re-armed; any connection on
//! the listener ends the session. Because the path only depends on the pid
//! and the netlink descriptor number, any process can cancel a session
//! without sharing memory or descriptors with it.

use std::os::unix::io::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::net::{UnixListener, UnixStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::{debug, warn};

use crate::core::{Error, Result};
use crate::mq::sys::{self, NotifyCookie, SigEvent, NOTIFY_COOKIE_LEN, NOTIFY_REMOVED};

pub const RENDEZVOUS_DIR: &str = "/tmp";

/// Path a session armed by `pid` with netlink socket `monitor_fd` listens on.
pub fn rendezvous_path(pid: u32, monitor_fd: RawFd) -> PathBuf {
    Path::new(RENDEZVOUS_DIR).join(format!("ipc-mq.{pid}.{monitor_fd}.sock"))
}

/// Cancels the session armed by `pid` on `monitor_fd` from anywhere.
///
/// Fails once the session is gone: its listener path no longer exists.
pub fn cancel_remote(pid: u32, monitor_fd: RawFd) -> Result<()> {
    UnixStream::connect(rendezvous_path(pid, monitor_fd))?;
    Ok(())
}

/// A live notification subscription for one queue.
pub struct NotifySession {
    queue_id: RawFd,
    monitor_fd: RawFd,
    rendezvous: PathBuf,
    events: Receiver<RawFd>,
    armed: Arc<AtomicU64>,
    handle: Option<JoinHandle<Result<()>>>,
}

impl NotifySession {
    /// Arms notification for `queue_id` and starts the listener thread.
    pub fn arm(queue_id: RawFd) -> Result<Self> {
        let monitor = open_monitor_socket().map_err(Error::ArmFailed)?;
        let monitor_fd = monitor.as_raw_fd();
        let rendezvous = rendezvous_path(std::process::id(), monitor_fd);
        let _ = std::fs::remove_file(&rendezvous);
        let listener = UnixListener::bind(&rendezvous).map_err(Error::ArmFailed)?;
        let cleanup = PathGuard(rendezvous.clone());

        let cookie = NotifyCookie::for_queue(queue_id);
        sys::mq_notify(queue_id, Some(&SigEvent::netlink(monitor_fd, &cookie)))?;

        let (tx, events) = mpsc::channel();
        let armed = Arc::new(AtomicU64::new(1));
        let listener_state = Listener {
            queue_id,
            monitor,
            listener,
            events: tx,
            armed: Arc::clone(&armed),
            _cleanup: cleanup,
        };
        let handle = thread::Builder::new()
            .name(format!("mq-notify-{queue_id}"))
            .spawn(move || listener_state.run())
            .map_err(|err| {
                let _ = sys::mq_notify(queue_id, None);
                Error::ArmFailed(err)
            })?;
        debug!(
            "armed notifications for queue {queue_id} (rendezvous {})",
            rendezvous.display()
        );
        Ok(Self {
            queue_id,
            monitor_fd,
            rendezvous,
            events,
            armed,
            handle: Some(handle),
        })
    }

    pub fn queue_id(&self) -> RawFd {
        self.queue_id
    }

    /// Netlink descriptor number; with the pid it names the rendezvous path.
    pub fn monitor_fd(&self) -> RawFd {
        self.monitor_fd
    }

    pub fn rendezvous_path(&self) -> &Path {
        &self.rendezvous
    }

    /// Queue ids, one per delivered notification. Disconnects when the
    /// session ends.
    pub fn events(&self) -> &Receiver<RawFd> {
        &self.events
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Option<RawFd> {
        match self.events.recv_timeout(timeout) {
            Ok(id) => Some(id),
            Err(RecvTimeoutError::Timeout) | Err(RecvTimeoutError::Disconnected) => None,
        }
    }

    /// Number of successful kernel registrations so far, the initial one
    /// included.
    pub fn armed_count(&self) -> u64 {
        self.armed.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.handle.as_ref().map_or(true, |handle| handle.is_finished())
    }

    /// Signals the listener through the rendezvous socket and waits for it.
    ///
    /// Returns the listener's own exit status. Calling this on a session
    /// that already ended is an error.
    pub fn cancel(&mut self) -> Result<()> {
        let handle = self.handle.take().ok_or_else(|| {
            Error::Io(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "notification session already ended",
            ))
        })?;
        if let Err(err) = UnixStream::connect(&self.rendezvous) {
            if handle.is_finished() {
                let _ = join_listener(handle);
            } else {
                self.handle = Some(handle);
            }
            return Err(Error::Io(err));
        }
        let outcome = join_listener(handle);
        debug!("cancelled notifications for queue {}", self.queue_id);
        outcome
    }

    /// Waits for the listener to exit on its own (remote cancel or failure).
    pub fn join(mut self) -> Result<()> {
        match self.handle.take() {
            Some(handle) => join_listener(handle),
            None => Ok(()),
        }
    }
}

impl Drop for NotifySession {
    fn drop(&mut self) {
        if let Some(handle) = self.handle.take() {
            if handle.is_finished() || UnixStream::connect(&self.rendezvous).is_ok() {
                let _ = join_listener(handle);
            }
        }
    }
}

fn join_listener(handle: JoinHandle<Result<()>>) -> Result<()> {
    handle
        .join()
        .unwrap_or(Err(Error::Corrupt("notification listener panicked")))
}

fn open_monitor_socket() -> std::io::Result<OwnedFd> {
    // SAFETY: socket(2) takes no pointers.
    let fd = unsafe {
        libc::socket(
            libc::AF_NETLINK,
            libc::SOCK_RAW | libc::SOCK_CLOEXEC,
            libc::NETLINK_ROUTE,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error());
    }
    // SAFETY: fd was just returned by socket(2) and is owned by nobody else.
    Ok(unsafe { OwnedFd::from_raw_fd(fd) })
}

/// Removes the rendezvous path when the session's sockets go away.
struct PathGuard(PathBuf);

impl Drop for PathGuard {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.0);
    }
}

enum Wake {
    Cancelled,
    Notified,
    Interrupted,
}

struct Listener {
    queue_id: RawFd,
    monitor: OwnedFd,
    listener: UnixListener,
    events: Sender<RawFd>,
    armed: Arc<AtomicU64>,
    // Declared last: the path goes only after both sockets are closed.
    _cleanup: PathGuard,
}

/// What one read from the netlink socket amounted to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Delivery {
    Event(RawFd),
    Removed,
    Malformed,
}

impl Delivery {
    fn classify(read: Option<(RawFd, u8)>) -> Self {
        match read {
            Some((_, status)) if status == NOTIFY_REMOVED => Delivery::Removed,
            Some((queue_id, _)) => Delivery::Event(queue_id),
            None => Delivery::Malformed,
        }
    }
}

/// The kernel registration a listener keeps alive.
trait Registration {
    fn queue_id(&self) -> RawFd;

    fn rearm(&self) -> Result<()>;

    fn unregister(&self);
}

/// Acts on one delivery. `Ok(true)` keeps the listener running.
fn dispatch<R: Registration>(
    delivery: Delivery,
    events: &Sender<RawFd>,
    reg: &R,
) -> Result<bool> {
    let queue_id = reg.queue_id();
    match delivery {
        Delivery::Removed => {
            debug!("notification for queue {queue_id} removed by kernel");
            Ok(false)
        }
        Delivery::Event(id) => {
            if events.send(id).is_err() {
                debug!("notification consumer for queue {queue_id} went away");
                reg.unregister();
                return Ok(false);
            }
            if let Err(err) = reg.rearm() {
                warn!("failed to re-arm notification for queue {queue_id}: {err}");
                return Err(err);
            }
            Ok(true)
        }
        Delivery::Malformed => {
            warn!("dropping malformed notification for queue {queue_id}");
            match reg.rearm() {
                // Nothing was consumed, so the old registration may still stand.
                Ok(()) | Err(Error::AlreadyArmed) => Ok(true),
                Err(err) => {
                    warn!("failed to re-arm notification for queue {queue_id}: {err}");
                    Err(err)
                }
            }
        }
    }
}

impl Registration for Listener {
    fn queue_id(&self) -> RawFd {
        self.queue_id
    }

    fn rearm(&self) -> Result<()> {
        let cookie = NotifyCookie::for_queue(self.queue_id);
        sys::mq_notify(
            self.queue_id,
            Some(&SigEvent::netlink(self.monitor.as_raw_fd(), &cookie)),
        )?;
        self.armed.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    fn unregister(&self) {
        let _ = sys::mq_notify(self.queue_id, None);
    }
}

impl Listener {
    fn run(self) -> Result<()> {
        let mut buf = [0u8; NOTIFY_COOKIE_LEN];
        loop {
            match self.poll()? {
                Wake::Cancelled => {
                    let _ = self.listener.accept();
                    self.unregister();
                    return Ok(());
                }
                Wake::Interrupted => continue,
                Wake::Notified => {}
            }
            let delivery = Delivery::classify(self.read_cookie(&mut buf));
            if !dispatch(delivery, &self.events, &self)? {
                return Ok(());
            }
        }
    }

    fn poll(&self) -> Result<Wake> {
        let mut fds = [
            libc::pollfd {
                fd: self.monitor.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
            libc::pollfd {
                fd: self.listener.as_raw_fd(),
                events: libc::POLLIN,
                revents: 0,
            },
        ];
        // SAFETY: fds is a live array of fds.len() pollfd entries.
        let res = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
        if res < 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::Interrupted {
                return Ok(Wake::Interrupted);
            }
            return Err(Error::Io(err));
        }
        if fds[1].revents != 0 {
            return Ok(Wake::Cancelled);
        }
        if fds[0].revents & libc::POLLIN != 0 {
            return Ok(Wake::Notified);
        }
        if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
            return Err(Error::Corrupt("notification socket failed"));
        }
        Ok(Wake::Interrupted)
    }

    fn read_cookie(&self, buf: &mut [u8; NOTIFY_COOKIE_LEN]) -> Option<(RawFd, u8)> {
        // SAFETY: buf is writable for buf.len() bytes for the whole call.
        let n = unsafe {
            libc::recv(
                self.monitor.as_raw_fd(),
                buf.as_mut_ptr() as *mut libc::c_void,
                buf.len(),
                libc::MSG_NOSIGNAL | libc::MSG_WAITALL,
            )
        };
        if n < 0 {
            return None;
        }
        NotifyCookie::decode(&buf[..n as usize])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mq::sys::NOTIFY_WOKENUP;
    use std::cell::{Cell, RefCell};

    #[test]
    fn rendezvous_path_is_deterministic() {
        assert_eq!(
            rendezvous_path(4242, 7),
            PathBuf::from("/tmp/ipc-mq.4242.7.sock")
        );
    }

    #[test]
    fn cancel_remote_without_session_fails() {
        assert!(cancel_remote(std::process::id(), -1).is_err());
    }

    #[test]
    fn arm_on_bad_descriptor_cleans_up() {
        let result = NotifySession::arm(-1);
        assert!(matches!(
            result,
            Err(Error::SyscallFailed { operation: "mq_notify", code: libc::EBADF })
        ));
    }

    #[derive(Default)]
    struct FakeRegistration {
        rearm_results: RefCell<Vec<Result<()>>>,
        rearms: Cell<usize>,
        unregistered: Cell<bool>,
    }

    impl FakeRegistration {
        fn failing_with(err: Error) -> Self {
            Self {
                rearm_results: RefCell::new(vec![Err(err)]),
                ..Self::default()
            }
        }
    }

    impl Registration for FakeRegistration {
        fn queue_id(&self) -> RawFd {
            5
        }

        fn rearm(&self) -> Result<()> {
            self.rearms.set(self.rearms.get() + 1);
            self.rearm_results.borrow_mut().pop().unwrap_or(Ok(()))
        }

        fn unregister(&self) {
            self.unregistered.set(true);
        }
    }

    fn delivered(status: u8) -> Option<(RawFd, u8)> {
        let mut bytes = *NotifyCookie::for_queue(5).as_bytes();
        bytes[NOTIFY_COOKIE_LEN - 1] = status;
        NotifyCookie::decode(&bytes)
    }

    #[test]
    fn classify_reads() {
        assert_eq!(Delivery::classify(delivered(NOTIFY_WOKENUP)), Delivery::Event(5));
        assert_eq!(Delivery::classify(delivered(NOTIFY_REMOVED)), Delivery::Removed);
        assert_eq!(Delivery::classify(None), Delivery::Malformed);
        assert_eq!(
            Delivery::classify(NotifyCookie::decode(&[0u8; 12])),
            Delivery::Malformed
        );
    }

    #[test]
    fn event_is_published_then_rearmed() -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let reg = FakeRegistration::default();
        assert!(dispatch(Delivery::Event(5), &tx, &reg)?);
        assert_eq!(rx.try_recv().ok(), Some(5));
        assert_eq!(reg.rearms.get(), 1);
        assert!(!reg.unregistered.get());
        Ok(())
    }

    #[test]
    fn rearm_failure_after_event_ends_listener() {
        let (tx, rx) = mpsc::channel();
        let reg = FakeRegistration::failing_with(Error::SyscallFailed {
            operation: "mq_notify",
            code: libc::EBADF,
        });
        let result = dispatch(Delivery::Event(5), &tx, &reg);
        assert!(matches!(result, Err(Error::SyscallFailed { .. })));
        assert_eq!(rx.try_recv().ok(), Some(5));
    }

    #[test]
    fn malformed_delivery_is_dropped_and_listener_continues() -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let reg = FakeRegistration::failing_with(Error::AlreadyArmed);
        assert!(dispatch(Delivery::Malformed, &tx, &reg)?);
        assert_eq!(reg.rearms.get(), 1);
        assert!(rx.try_recv().is_err());

        let reg = FakeRegistration::default();
        assert!(dispatch(Delivery::Malformed, &tx, &reg)?);
        assert_eq!(reg.rearms.get(), 1);
        Ok(())
    }

    #[test]
    fn malformed_delivery_with_broken_registration_ends_listener() {
        let (tx, _rx) = mpsc::channel();
        let reg = FakeRegistration::failing_with(Error::SyscallFailed {
            operation: "mq_notify",
            code: libc::EBADF,
        });
        assert!(dispatch(Delivery::Malformed, &tx, &reg).is_err());
    }

    #[test]
    fn removal_stops_without_rearming() -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let reg = FakeRegistration::default();
        assert!(!dispatch(Delivery::Removed, &tx, &reg)?);
        assert_eq!(reg.rearms.get(), 0);
        assert!(rx.try_recv().is_err());
        Ok(())
    }

    #[test]
    fn gone_consumer_unregisters() -> Result<()> {
        let (tx, rx) = mpsc::channel();
        drop(rx);
        let reg = FakeRegistration::default();
        assert!(!dispatch(Delivery::Event(5), &tx, &reg)?);
        assert!(reg.unregistered.get());
        assert_eq!(reg.rearms.get(), 0);
        Ok(())
    }
}
