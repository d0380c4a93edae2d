use std::cell::RefCell;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::ptr;
use std::time::Duration;

use crate::reactor::Grade;
use crate::sys::{millis, Selector};
use crate::{event, Event, Events, Interest};

/// Backend over `epoll(7)`, level-triggered.
///
/// Interest edits go through `EPOLL_CTL_MOD`, which the kernel applies
/// atomically with respect to a concurrent `epoll_wait`; flag changes never
/// require pausing the reactor.
#[derive(Debug)]
pub(crate) struct EpollSelector {
    ep: OwnedFd,
    scratch: RefCell<Vec<libc::epoll_event>>,
}

fn interest_to_epoll(interest: Interest) -> u32 {
    // Level-triggered on purpose: the reactor re-polls interest every cycle.
    let mut kind = 0;
    if interest.is_readable() {
        kind |= libc::EPOLLIN | libc::EPOLLPRI;
    }
    if interest.is_writable() {
        kind |= libc::EPOLLOUT;
    }
    kind as u32
}

impl EpollSelector {
    pub(crate) fn new() -> io::Result<EpollSelector> {
        let ep = syscall!(epoll_create1(libc::EPOLL_CLOEXEC))?;
        // SAFETY: `epoll_create1(2)` returned a fresh, valid fd.
        let ep = unsafe { OwnedFd::from_raw_fd(ep) };
        Ok(EpollSelector {
            ep,
            scratch: RefCell::new(Vec::with_capacity(1024)),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Option<Interest>) -> io::Result<()> {
        let mut ev = interest.map(|interest| libc::epoll_event {
            events: interest_to_epoll(interest),
            u64: fd as u64,
        });
        let ev_ptr = ev
            .as_mut()
            .map(|ev| ev as *mut libc::epoll_event)
            .unwrap_or(ptr::null_mut());
        syscall!(epoll_ctl(self.ep.as_raw_fd(), op, fd, ev_ptr)).map(|_| ())
    }
}

impl Selector for EpollSelector {
    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, Some(interest))
    }

    fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, Some(interest))
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.ctl(libc::EPOLL_CTL_DEL, fd, None)
    }

    fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let mut scratch = self.scratch.borrow_mut();
        let capacity = scratch.capacity();
        scratch.clear();

        let n_events = syscall!(epoll_wait(
            self.ep.as_raw_fd(),
            scratch.as_mut_ptr(),
            capacity as libc::c_int,
            millis(timeout),
        ))?;
        // SAFETY: `epoll_wait` initialized `n_events` entries.
        unsafe { scratch.set_len(n_events as usize) };

        for raw in scratch.iter() {
            let bits = raw.events as libc::c_int;
            let mut flags = 0;
            if bits & libc::EPOLLIN != 0 {
                flags |= event::READABLE;
            }
            if bits & libc::EPOLLPRI != 0 {
                flags |= event::PRIORITY;
            }
            if bits & libc::EPOLLOUT != 0 {
                flags |= event::WRITABLE;
            }
            if bits & libc::EPOLLERR != 0 {
                flags |= event::ERROR;
            }
            if bits & libc::EPOLLHUP != 0 {
                flags |= event::HUP;
            }
            events.push(Event::new(raw.u64 as RawFd, flags));
        }
        Ok(())
    }

    fn grade(&self) -> Grade {
        Grade::RockSolid
    }
}
