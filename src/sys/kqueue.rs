use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::time::Duration;
use std::{cmp, ptr};

use crate::reactor::Grade;
use crate::sys::Selector;
use crate::{event, Event, Events, Interest};

// Width of the `filter` field differs across the BSDs.
#[cfg(any(target_os = "freebsd", target_os = "openbsd"))]
type Filter = libc::c_short;
#[cfg(any(target_os = "macos", target_os = "ios"))]
type Filter = i16;
#[cfg(target_os = "netbsd")]
type Filter = u32;
#[cfg(target_os = "dragonfly")]
type Filter = libc::c_short;

#[cfg(not(target_os = "netbsd"))]
type Count = libc::c_int;
#[cfg(target_os = "netbsd")]
type Count = libc::size_t;

macro_rules! kevent {
    ($id: expr, $filter: expr, $flags: expr) => {
        libc::kevent {
            ident: $id as libc::uintptr_t,
            filter: $filter as Filter,
            flags: $flags,
            fflags: 0,
            data: 0,
            udata: std::ptr::null_mut(),
        }
    };
}

/// Backend over `kqueue(2)`.
///
/// Every registered transport gets a read filter for its whole lifetime; the
/// write filter is added and removed as interest changes. There is no
/// out-of-band readiness notion, so priority events are never produced, and
/// peer hangup arrives as `EV_EOF` on either filter.
#[derive(Debug)]
pub(crate) struct KqueueSelector {
    kq: OwnedFd,
    scratch: RefCell<Vec<libc::kevent>>,
}

impl KqueueSelector {
    pub(crate) fn new() -> io::Result<KqueueSelector> {
        let kq = syscall!(kqueue())?;
        syscall!(fcntl(kq, libc::F_SETFD, libc::FD_CLOEXEC))?;
        // SAFETY: `kqueue(2)` returned a fresh, valid fd.
        let kq = unsafe { OwnedFd::from_raw_fd(kq) };
        Ok(KqueueSelector {
            kq,
            scratch: RefCell::new(Vec::with_capacity(1024)),
        })
    }

    fn apply(&self, changes: &mut [libc::kevent], ignored: &[i64]) -> io::Result<()> {
        syscall!(kevent(
            self.kq.as_raw_fd(),
            changes.as_ptr(),
            changes.len() as Count,
            changes.as_mut_ptr(),
            changes.len() as Count,
            ptr::null(),
        ))
        .map(|_| ())
        .or_else(|err| {
            // "When kevent() call fails with EINTR error, all changes in the
            // changelist have been applied" (FreeBSD man page).
            if err.raw_os_error() == Some(libc::EINTR) {
                Ok(())
            } else {
                Err(err)
            }
        })?;

        for change in changes.iter() {
            let data = change.data as i64;
            if change.flags & libc::EV_ERROR != 0 && data != 0 && !ignored.contains(&data) {
                return Err(io::Error::from_raw_os_error(data as i32));
            }
        }
        Ok(())
    }
}

impl Selector for KqueueSelector {
    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let flags = libc::EV_RECEIPT | libc::EV_ADD;
        let mut changes = [
            kevent!(fd, libc::EVFILT_READ, flags),
            kevent!(
                fd,
                libc::EVFILT_WRITE,
                if interest.is_writable() {
                    flags
                } else {
                    libc::EV_RECEIPT | libc::EV_DELETE
                }
            ),
        ];
        // Removing a write filter that was never added reports ENOENT, which
        // is the state we wanted anyway. EPIPE can surface when the other
        // end of a pipe-like descriptor is already gone yet events will
        // still be delivered.
        self.apply(&mut changes, &[libc::ENOENT as i64, libc::EPIPE as i64])
    }

    fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.register(fd, interest)
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let flags = libc::EV_RECEIPT | libc::EV_DELETE;
        let mut changes = [
            kevent!(fd, libc::EVFILT_READ, flags),
            kevent!(fd, libc::EVFILT_WRITE, flags),
        ];
        self.apply(&mut changes, &[libc::ENOENT as i64])
    }

    fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let timespec = timeout.map(|to| libc::timespec {
            tv_sec: cmp::min(to.as_secs(), libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: libc::c_long::from(to.subsec_nanos() as i32),
        });
        let timespec_ptr = timespec
            .as_ref()
            .map(|ts| ts as *const libc::timespec)
            .unwrap_or(ptr::null());

        let mut scratch = self.scratch.borrow_mut();
        let capacity = scratch.capacity();
        scratch.clear();

        let n_events = syscall!(kevent(
            self.kq.as_raw_fd(),
            ptr::null(),
            0,
            scratch.as_mut_ptr(),
            capacity as Count,
            timespec_ptr,
        ))?;
        // SAFETY: `kevent` initialized `n_events` entries.
        unsafe { scratch.set_len(n_events as usize) };

        for raw in scratch.iter() {
            let mut flags = 0;
            if raw.filter == libc::EVFILT_READ as Filter {
                flags |= event::READABLE;
            }
            if raw.filter == libc::EVFILT_WRITE as Filter {
                flags |= event::WRITABLE;
            }
            if raw.flags & libc::EV_EOF != 0 {
                flags |= event::HUP;
                if raw.fflags != 0 {
                    flags |= event::ERROR;
                }
            }
            events.push(Event::new(raw.ident as RawFd, flags));
        }
        Ok(())
    }

    fn grade(&self) -> Grade {
        Grade::RockSolid
    }

    fn wants_hup_peek(&self) -> bool {
        false
    }
}
