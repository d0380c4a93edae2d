//! Backend plumbing: one module per OS readiness primitive.
//!
//! Every backend implements [`Selector`]. The reactor proper owns exactly
//! one boxed selector and never cares which primitive is underneath; the
//! backends normalize raw readiness into [`crate::Events`].

use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::reactor::Grade;
use crate::{Events, Interest};

/// Run a libc function and turn `-1` into `io::Error::last_os_error()`.
macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

mod poll;
mod select;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;

#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
mod kqueue;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) use self::epoll::EpollSelector;
#[cfg(any(
    target_os = "dragonfly",
    target_os = "freebsd",
    target_os = "ios",
    target_os = "macos",
    target_os = "netbsd",
    target_os = "openbsd"
))]
pub(crate) use self::kqueue::KqueueSelector;
pub(crate) use self::poll::PollSelector;
pub(crate) use self::select::SelectSelector;

/// One OS readiness primitive.
///
/// All methods take `&self`; the stateful backends (`select`, `poll`) keep
/// their registration tables behind a `RefCell`, which is fine because the
/// reactor is single-threaded.
pub(crate) trait Selector {
    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()>;

    /// Rewrite the full interest mask for `fd` from `interest`.
    fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()>;

    fn deregister(&self, fd: RawFd) -> io::Result<()>;

    /// Block up to `timeout` (`None` is infinite) and fill `events` with
    /// normalized readiness.
    fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()>;

    fn grade(&self) -> Grade;

    /// Whether the dispatcher should probe readable transports for a peer
    /// hangup with a peek. kqueue reports hangup through `EV_EOF` instead.
    fn wants_hup_peek(&self) -> bool {
        true
    }
}

/// Millisecond timeout encoding shared by the poll and epoll backends,
/// rounding sub-millisecond waits up so they do not become busy loops.
pub(crate) fn millis(timeout: Option<Duration>) -> libc::c_int {
    timeout
        .map(|to| {
            to.checked_add(Duration::from_nanos(999_999))
                .unwrap_or(to)
                .as_millis()
                .min(libc::c_int::MAX as u128) as libc::c_int
        })
        .unwrap_or(-1)
}
