use std::fmt;
use std::ops::{BitAnd, BitOr, BitOrAssign, Not, Sub};

/// Raw OS descriptor watched by a multiplexer.
#[cfg(unix)]
pub type Descriptor = std::os::unix::io::RawFd;

/// Raw OS descriptor watched by a multiplexer.
///
/// Sockets are passed as-is. Handles given to the completion backend are
/// passed as their integer value.
#[cfg(windows)]
pub type Descriptor = std::os::windows::io::RawSocket;

///
/// Abstract event bitmask.
///
/// Used both as the interest set of a registration and as the readiness
/// reported for it.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Interest(u8);

impl Interest {
    /// No events.
    pub const NONE: Interest = Interest(0);
    /// Descriptor is readable.
    pub const READ: Interest = Interest(0b0001);
    /// Descriptor is writable.
    pub const WRITE: Interest = Interest(0b0010);
    /// Descriptor is in an error state.
    pub const ERROR: Interest = Interest(0b0100);
    /// Peer hung up, or the descriptor was closed for reading.
    pub const HANGUP: Interest = Interest(0b1000);
    /// Every event.
    pub const ALL: Interest = Interest(0b1111);

    pub const fn bits(self) -> u8 {
        self.0
    }

    /// Builds an interest from raw bits, dropping unknown ones.
    pub const fn from_bits_truncate(bits: u8) -> Interest {
        Interest(bits & Self::ALL.0)
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: Interest) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn intersects(self, other: Interest) -> bool {
        self.0 & other.0 != 0
    }

    pub const fn is_readable(self) -> bool {
        self.intersects(Self::READ)
    }

    pub const fn is_writable(self) -> bool {
        self.intersects(Self::WRITE)
    }

    pub const fn is_error(self) -> bool {
        self.intersects(Self::ERROR)
    }

    pub const fn is_hangup(self) -> bool {
        self.intersects(Self::HANGUP)
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

impl BitAnd for Interest {
    type Output = Interest;

    fn bitand(self, rhs: Interest) -> Interest {
        Interest(self.0 & rhs.0)
    }
}

impl Sub for Interest {
    type Output = Interest;

    fn sub(self, rhs: Interest) -> Interest {
        Interest(self.0 & !rhs.0)
    }
}

impl Not for Interest {
    type Output = Interest;

    fn not(self) -> Interest {
        Interest(!self.0 & Self::ALL.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_empty() {
            return f.write_str("NONE");
        }
        let names = [
            (Self::READ, "READ"),
            (Self::WRITE, "WRITE"),
            (Self::ERROR, "ERROR"),
            (Self::HANGUP, "HANGUP"),
        ];
        let mut first = true;
        for (flag, name) in names {
            if self.contains(flag) {
                if !first {
                    f.write_str(" | ")?;
                }
                f.write_str(name)?;
                first = false;
            }
        }
        Ok(())
    }
}

///
/// Opaque caller value stored with a registration and handed back with every
/// event for it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Token(pub usize);

///
/// Opaque per-operation marker of a completion, the address of the
/// `OVERLAPPED` the operation was issued with on IOCP.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub struct CompletionMarker(pub usize);

impl CompletionMarker {
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }
}

/// What happened to a descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum EventKind {
    /// The descriptor can perform the I/O named by the bits without blocking.
    Readiness(Interest),
    /// An operation issued on the descriptor finished.
    Completion {
        /// Marker the operation was issued with.
        marker: CompletionMarker,
        /// Bytes transferred by the operation.
        bytes: u32,
    },
}

///
/// One dispatched notification.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Event {
    pub(crate) descriptor: Descriptor,
    pub(crate) token: Token,
    pub(crate) kind: EventKind,
}

impl Event {
    pub(crate) fn readiness(descriptor: Descriptor, token: Token, ready: Interest) -> Event {
        Event {
            descriptor,
            token,
            kind: EventKind::Readiness(ready),
        }
    }

    #[cfg_attr(not(windows), allow(dead_code))]
    pub(crate) fn completion(
        descriptor: Descriptor,
        token: Token,
        marker: CompletionMarker,
        bytes: u32,
    ) -> Event {
        Event {
            descriptor,
            token,
            kind: EventKind::Completion { marker, bytes },
        }
    }

    pub fn descriptor(&self) -> Descriptor {
        self.descriptor
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn kind(&self) -> EventKind {
        self.kind
    }

    /// Readiness bits of the event, empty for completions.
    pub fn ready(&self) -> Interest {
        match self.kind {
            EventKind::Readiness(ready) => ready,
            EventKind::Completion { .. } => Interest::NONE,
        }
    }

    pub fn is_completion(&self) -> bool {
        matches!(self.kind, EventKind::Completion { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interest_set_algebra() {
        let rw = Interest::READ | Interest::WRITE;
        assert!(rw.contains(Interest::READ));
        assert!(rw.is_writable());
        assert!(!rw.is_error());
        assert_eq!(rw - Interest::WRITE, Interest::READ);
        assert_eq!(!rw, Interest::ERROR | Interest::HANGUP);
        assert_eq!(Interest::from_bits_truncate(0xff), Interest::ALL);
    }

    #[test]
    fn interest_debug_names_flags() {
        assert_eq!(format!("{:?}", Interest::NONE), "NONE");
        assert_eq!(
            format!("{:?}", Interest::READ | Interest::HANGUP),
            "READ | HANGUP"
        );
    }

    #[test]
    fn completion_events_have_no_readiness() {
        let ev = Event::completion(3, Token(9), CompletionMarker(0x10), 42);
        assert!(ev.is_completion());
        assert_eq!(ev.ready(), Interest::NONE);
        assert_eq!(
            ev.kind(),
            EventKind::Completion {
                marker: CompletionMarker(0x10),
                bytes: 42
            }
        );
    }
}
