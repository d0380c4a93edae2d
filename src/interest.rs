use std::{fmt, ops};

/// Readiness interest for a registered transport.
///
/// Unlike the raw flag words of the individual backends this is a
/// backend-neutral pair of bits. An empty set is legal: a registered
/// transport is always watched for errors and hangup, interest only controls
/// read and write readiness.
#[derive(Copy, Clone, Default, PartialEq, Eq)]
pub struct Interest(u8);

const READABLE: u8 = 0b01;
const WRITABLE: u8 = 0b10;

impl Interest {
    /// No read or write interest.
    pub const NONE: Interest = Interest(0);

    /// Interest in read readiness.
    pub const READABLE: Interest = Interest(READABLE);

    /// Interest in write readiness.
    pub const WRITABLE: Interest = Interest(WRITABLE);

    /// Combine two interest sets. Also available through `|`.
    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub const fn is_readable(self) -> bool {
        self.0 & READABLE != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & WRITABLE != 0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        self.add(other)
    }
}

impl ops::BitOrAssign for Interest {
    fn bitor_assign(&mut self, other: Interest) {
        self.0 |= other.0;
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.is_readable(), self.is_writable()) {
            (true, true) => write!(fmt, "READABLE | WRITABLE"),
            (true, false) => write!(fmt, "READABLE"),
            (false, true) => write!(fmt, "WRITABLE"),
            (false, false) => write!(fmt, "(empty)"),
        }
    }
}
