use std::cell::RefCell;
use std::collections::HashMap;
use std::io;
use std::mem::MaybeUninit;
use std::os::unix::io::RawFd;
use std::time::Duration;

use crate::reactor::Grade;
use crate::sys::Selector;
use crate::{event, Event, Events, Interest};

/// Backend over `select(2)`.
///
/// Every registered descriptor is polled for read readiness (the reader set
/// is implicit); only the writer set follows interest. Out-of-band data is
/// watched through the except set for every descriptor. Mutation while the
/// reactor is blocked requires the full interrupt handshake, which is why
/// this backend is graded fragile.
#[derive(Debug)]
pub(crate) struct SelectSelector {
    registered: RefCell<HashMap<RawFd, Interest>>,
}

impl SelectSelector {
    pub(crate) fn new() -> io::Result<SelectSelector> {
        Ok(SelectSelector {
            registered: RefCell::new(HashMap::new()),
        })
    }
}

impl Selector for SelectSelector {
    fn register(&self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                "fd beyond FD_SETSIZE, select cannot watch it",
            ));
        }
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

        let mut read_set = unsafe { MaybeUninit::<libc::fd_set>::zeroed().assume_init() };
        let mut write_set = unsafe { MaybeUninit::<libc::fd_set>::zeroed().assume_init() };
        let mut except_set = unsafe { MaybeUninit::<libc::fd_set>::zeroed().assume_init() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_ZERO(&mut except_set);
        }

        let mut max_fd: RawFd = -1;
        let registered = self.registered.borrow().clone();
        for (&fd, interest) in registered.iter() {
            unsafe {
                libc::FD_SET(fd, &mut read_set);
                libc::FD_SET(fd, &mut except_set);
                if interest.is_writable() {
                    libc::FD_SET(fd, &mut write_set);
                }
            }
            max_fd = max_fd.max(fd);
        }

        let mut timeval = timeout.map(|to| libc::timeval {
            tv_sec: to.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_usec: libc::suseconds_t::from(to.subsec_micros() as i32),
        });
        let timeval_ptr = timeval
            .as_mut()
            .map(|tv| tv as *mut libc::timeval)
            .unwrap_or(std::ptr::null_mut());

        syscall!(select(
            max_fd + 1,
            &mut read_set,
            &mut write_set,
            &mut except_set,
            timeval_ptr,
        ))?;

        for &fd in registered.keys() {
            let mut flags = 0;
            unsafe {
                if libc::FD_ISSET(fd, &read_set) {
                    flags |= event::READABLE;
                }
                if libc::FD_ISSET(fd, &write_set) {
                    flags |= event::WRITABLE;
                }
                if libc::FD_ISSET(fd, &except_set) {
                    flags |= event::PRIORITY;
                }
            }
            if flags != 0 {
                events.push(Event::new(fd, flags));
            }
        }
        Ok(())
    }

    fn grade(&self) -> Grade {
        Grade::Fragile
    }
}
