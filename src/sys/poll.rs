use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::reactor::Grade;
use crate::sys::{millis, Selector};
use crate::{event, Event, Events, Interest};

/// Backend over `poll(2)`.
///
/// The pollfd array is rebuilt from the interest table on every call, so an
/// interest change becomes visible on the next cycle without re-registering
/// anything mid-wait. That is what makes the light "change flags"
/// interrupt path safe here.
#[derive(Debug)]
pub(crate) struct PollSelector {
    registered: RefCell<HashMap<RawFd, Interest>>,
}

fn interest_to_poll(interest: Interest) -> libc::c_short {
    // Errors, hangup and invalid-fd conditions are always reported.
    let mut flags = libc::POLLERR | libc::POLLHUP | libc::POLLNVAL;
    if interest.is_readable() {
        flags |= libc::POLLIN | libc::POLLPRI;
    }
    if interest.is_writable() {
        flags |= libc::POLLOUT;
    }
    flags
}

fn revents_to_event(fd: RawFd, revents: libc::c_short) -> Event {
    let mut flags = 0;
    if revents & libc::POLLIN != 0 {
        flags |= event::READABLE;
    }
    if revents & libc::POLLPRI != 0 {
        flags |= event::PRIORITY;
    }
    if revents & libc::POLLOUT != 0 {
        flags |= event::WRITABLE;
    }
    if revents & (libc::POLLERR | libc::POLLNVAL) != 0 {
        flags |= event::ERROR;
    }
    if revents & libc::POLLHUP != 0 {
        flags |= event::HUP;
    }
    Event::new(fd, flags)
}

impl PollSelector {
    pub(crate) fn new() -> io::Result<PollSelector> {
        Ok(PollSelector {
            registered: RefCell::new(HashMap::new()),
        })
    }
}

impl Selector for PollSelector {
    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.registered.borrow_mut().insert(fd, interest);
        Ok(())
    }

    fn reregister(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        self.registered.borrow_mut().insert(fd, interest);
        Ok(())
    }

    fn deregister(&self, fd: RawFd) -> io::Result<()> {
        self.registered.borrow_mut().remove(&fd);
        Ok(())
    }

    fn select(&self, events: &mut Events, timeout: Option<Duration>) -> io::Result<()> {
        events.clear();

        let mut poll_fds: Vec<libc::pollfd> = self
            .registered
            .borrow()
            .iter()
            .map(|(&fd, &interest)| libc::pollfd {
                fd,
                events: interest_to_poll(interest),
                revents: 0,
            })
            .collect();

        syscall!(poll(
            poll_fds.as_mut_ptr(),
            poll_fds.len() as libc::nfds_t,
            millis(timeout),
        ))?;

        for poll_fd in poll_fds.iter().filter(|p| p.revents != 0) {
            events.push(revents_to_event(poll_fd.fd, poll_fd.revents));
        }
        Ok(())
    }

    fn grade(&self) -> Grade {
        Grade::Robust
    }
}
