use std::fmt;
use std::os::unix::io::RawFd;

pub(crate) const READABLE: u8 = 0b0_0001;
pub(crate) const WRITABLE: u8 = 0b0_0010;
pub(crate) const PRIORITY: u8 = 0b0_0100;
pub(crate) const ERROR: u8 = 0b0_1000;
pub(crate) const HUP: u8 = 0b1_0000;

/// A single readiness event, normalized across backends.
///
/// `readable`/`writable` correspond to the plain readiness classes,
/// `priority` to out-of-band data (never set by the kqueue backend),
/// `error` to `POLLERR`/`POLLNVAL`-class conditions and `hup` to an observed
/// peer hangup (`POLLHUP`, `EV_EOF`).
#[derive(Copy, Clone)]
pub struct Event {
    fd: RawFd,
    flags: u8,
}

impl Event {
    pub(crate) fn new(fd: RawFd, flags: u8) -> Event {
        Event { fd, flags }
    }

    /// The file descriptor the event is for.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    pub fn is_readable(&self) -> bool {
        self.flags & READABLE != 0
    }

    pub fn is_writable(&self) -> bool {
        self.flags & WRITABLE != 0
    }

    pub fn is_priority(&self) -> bool {
        self.flags & PRIORITY != 0
    }

    pub fn is_error(&self) -> bool {
        self.flags & ERROR != 0
    }

    pub fn is_hup(&self) -> bool {
        self.flags & HUP != 0
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut dbg = fmt.debug_struct("Event");
        dbg.field("fd", &self.fd);
        for (name, bit) in [
            ("readable", READABLE),
            ("writable", WRITABLE),
            ("priority", PRIORITY),
            ("error", ERROR),
            ("hup", HUP),
        ] {
            if self.flags & bit != 0 {
                dbg.field(name, &true);
            }
        }
        dbg.finish()
    }
}

/// A buffer of readiness events filled by one poll call.
#[derive(Debug)]
pub struct Events {
    inner: Vec<Event>,
}

impl Events {
    pub fn with_capacity(capacity: usize) -> Events {
        Events {
            inner: Vec::with_capacity(capacity),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Event> {
        self.inner.iter()
    }

    pub(crate) fn clear(&mut self) {
        self.inner.clear();
    }

    pub(crate) fn push(&mut self, event: Event) {
        self.inner.push(event);
    }
}

impl Default for Events {
    fn default() -> Events {
        Events::with_capacity(256)
    }
}

impl<'a> IntoIterator for &'a Events {
    type Item = &'a Event;
    type IntoIter = std::slice::Iter<'a, Event>;

    fn into_iter(self) -> Self::IntoIter {
        self.inner.iter()
    }
}
