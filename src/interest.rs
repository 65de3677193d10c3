use std::ops::{BitOr, BitOrAssign};

/// A bitmask of readiness conditions, used both for the interest a
/// [`Channel`](crate::channel::Channel) registers and for the ready bits a
/// [`Poller`](crate::poller::Poller) reports back.
///
/// Named abstractly per the kernel readiness flags this crate actually
/// cares about; backends translate to/from `POLL*`/`EPOLL*` bits at their
/// boundary rather than leaking kernel constants into the rest of the
/// crate.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Interest(u8);

impl Interest {
    pub const NONE: Interest = Interest(0);
    pub const READABLE: Interest = Interest(0b0000_0001);
    pub const WRITABLE: Interest = Interest(0b0000_0010);
    pub const PRIORITY: Interest = Interest(0b0000_0100);
    pub const HANGUP: Interest = Interest(0b0000_1000);
    pub const ERROR: Interest = Interest(0b0001_0000);
    pub const READ_CLOSED: Interest = Interest(0b0010_0000);
    pub const INVALID: Interest = Interest(0b0100_0000);

    pub fn is_none(self) -> bool {
        self.0 == 0
    }

    pub fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    pub fn remove(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }

    pub fn is_readable(self) -> bool {
        self.intersects(Interest::READABLE.or(Interest::PRIORITY))
    }

    pub fn is_writable(self) -> bool {
        self.intersects(Interest::WRITABLE)
    }

    pub fn or(self, other: Interest) -> Interest {
        self | other
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

impl BitOrAssign for Interest {
    fn bitor_assign(&mut self, rhs: Interest) {
        self.0 |= rhs.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_has_no_bits() {
        assert!(Interest::NONE.is_none());
        assert!(!Interest::READABLE.is_none());
    }

    #[test]
    fn or_accumulates() {
        let rw = Interest::READABLE | Interest::WRITABLE;
        assert!(rw.contains(Interest::READABLE));
        assert!(rw.contains(Interest::WRITABLE));
        assert!(!rw.contains(Interest::ERROR));
    }

    #[test]
    fn remove_clears_only_named_bit() {
        let rw = Interest::READABLE | Interest::WRITABLE;
        let r = rw.remove(Interest::WRITABLE);
        assert!(r.contains(Interest::READABLE));
        assert!(!r.contains(Interest::WRITABLE));
    }
}
