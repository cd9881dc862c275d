//! Absolute-deadline waits on a Linux `timerfd`.
//!
//! tokio's own timer wheel works in whole milliseconds, which turns the
//! 100 µs and 200 µs periods of the fastest rates into bursts. The timerfd is
//! armed with `TFD_TIMER_ABSTIME` on `CLOCK_MONOTONIC` and registered with the
//! reactor, so the sockets keep being served while it runs.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::time::Duration;
use tokio::io::unix::AsyncFd;
use tokio::time::Instant;

const NANOS_PER_SEC: u64 = 1_000_000_000;

#[derive(Debug)]
pub(crate) struct TimerFd {
    fd: AsyncFd<OwnedFd>,
}

impl TimerFd {
    /// Create a disarmed timer. Must be called inside a tokio runtime with IO
    /// enabled.
    pub(crate) fn new() -> io::Result<Self> {
        // SAFETY: plain syscall; the result is checked before use.
        let raw = unsafe {
            libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC)
        };
        if raw < 0 {
            return Err(io::Error::last_os_error());
        }
        // SAFETY: `raw` is a freshly created descriptor nothing else owns.
        let fd = unsafe { OwnedFd::from_raw_fd(raw) };
        Ok(Self {
            fd: AsyncFd::new(fd)?,
        })
    }

    /// Sleep until `deadline`, returning at once if it has already passed.
    pub(crate) async fn wait_until(&self, deadline: Instant) -> io::Result<()> {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Ok(());
        }
        self.arm(remaining)?;

        loop {
            let mut guard = self.fd.readable().await?;
            // A would-block read clears the cached readiness left by the
            // previous expiry, so only a fresh expiry ends the wait
            if let Ok(result) = guard.try_io(|fd| read_expirations(fd.get_ref())) {
                return result.map(|_| ());
            }
        }
    }

    fn arm(&self, delay: Duration) -> io::Result<()> {
        // SAFETY: itimerspec is plain old data; a zero interval is one-shot.
        let mut value: libc::itimerspec = unsafe { mem::zeroed() };
        value.it_value = monotonic_after(delay)?;

        // SAFETY: valid timerfd and itimerspec; the old value is not wanted.
        let rc = unsafe {
            libc::timerfd_settime(
                self.fd.as_raw_fd(),
                libc::TFD_TIMER_ABSTIME,
                &value,
                std::ptr::null_mut(),
            )
        };
        if rc != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

/// `CLOCK_MONOTONIC` now plus `delay`, the same clock tokio's `Instant` reads.
fn monotonic_after(delay: Duration) -> io::Result<libc::timespec> {
    // SAFETY: timespec is plain old data.
    let mut now: libc::timespec = unsafe { mem::zeroed() };
    // SAFETY: `now` is a valid out-pointer.
    if unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut now) } != 0 {
        return Err(io::Error::last_os_error());
    }

    let nanos = now.tv_nsec as u64 + u64::from(delay.subsec_nanos());
    now.tv_sec += (delay.as_secs() + nanos / NANOS_PER_SEC) as libc::time_t;
    now.tv_nsec = (nanos % NANOS_PER_SEC) as _;
    Ok(now)
}

fn read_expirations(fd: &OwnedFd) -> io::Result<u64> {
    let mut expirations = 0u64;
    // SAFETY: the buffer is a valid u64, the exact size a timerfd read needs.
    let read = unsafe {
        libc::read(
            fd.as_raw_fd(),
            std::ptr::addr_of_mut!(expirations).cast(),
            mem::size_of::<u64>(),
        )
    };
    if read < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(expirations)
}
