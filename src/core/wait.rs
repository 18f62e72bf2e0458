//! Cross-process sleep/wake on a 32-bit word inside a shared mapping.
//!
//! Waits use the shared (non-private) futex operations so a waker in one
//! process reaches sleepers in another as long as both map the same file.

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use crate::core::Result;

/// Sleeps while `word == expected`, for at most `timeout`.
///
/// Returns `false` only when the timeout elapsed. Spurious wakeups and
/// signals return `true`; callers re-check their condition.
#[cfg(target_os = "linux")]
pub fn wait_while_equal(
    word: &AtomicU32,
    expected: u32,
    timeout: Option<Duration>,
) -> Result<bool> {
    use libc::{syscall, timespec, EAGAIN, EINTR, ETIMEDOUT, FUTEX_WAIT, SYS_futex};

    let ts = timeout.map(|timeout| timespec {
        tv_sec: timeout.as_secs() as libc::time_t,
        tv_nsec: timeout.subsec_nanos() as libc::c_long,
    });
    let ts_ptr = ts
        .as_ref()
        .map_or(std::ptr::null(), |ts| ts as *const timespec);

    // SAFETY: word is a live, aligned u32; ts is null or outlives the call.
    let res = unsafe {
        syscall(
            SYS_futex,
            word as *const AtomicU32 as *const u32,
            FUTEX_WAIT,
            expected,
            ts_ptr,
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res == 0 {
        return Ok(true);
    }
    let err = std::io::Error::last_os_error();
    match err.raw_os_error() {
        Some(ETIMEDOUT) => Ok(false),
        Some(code) if code == EAGAIN || code == EINTR => Ok(true),
        _ => Err(err.into()),
    }
}

/// Bumps `word` and wakes every sleeper waiting on it.
#[cfg(target_os = "linux")]
pub fn bump_and_wake(word: &AtomicU32) -> Result<()> {
    use libc::{syscall, FUTEX_WAKE, SYS_futex};

    word.fetch_add(1, Ordering::Release);
    // SAFETY: word is a live, aligned u32; FUTEX_WAKE reads no other pointer.
    let res = unsafe {
        syscall(
            SYS_futex,
            word as *const AtomicU32 as *const u32,
            FUTEX_WAKE,
            i32::MAX,
            std::ptr::null::<u32>(),
            std::ptr::null::<u32>(),
            0,
        )
    };
    if res < 0 {
        return Err(std::io::Error::last_os_error().into());
    }
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn wait_while_equal(
    word: &AtomicU32,
    expected: u32,
    timeout: Option<Duration>,
) -> Result<bool> {
    let nap = Duration::from_millis(1);
    let sleep = timeout.map_or(nap, |timeout| timeout.min(nap));
    std::thread::sleep(sleep);
    Ok(word.load(Ordering::Acquire) != expected || timeout.map_or(true, |t| t > sleep))
}

#[cfg(not(target_os = "linux"))]
pub fn bump_and_wake(word: &AtomicU32) -> Result<()> {
    word.fetch_add(1, Ordering::Release);
    Ok(())
}

/// Time left until `deadline`, `None` meaning "no deadline".
pub(crate) fn remaining(deadline: Option<Instant>) -> Option<Duration> {
    deadline.map(|deadline| deadline.saturating_duration_since(Instant::now()))
}
