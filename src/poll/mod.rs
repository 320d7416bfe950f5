//! Readiness polling: interest sets, packed events, and the poller facilities.
//!
//! Two facilities exist. [`EpollPoller`] is the Linux fast path: one shared
//! level-triggered instance that tolerates subscription changes while a wait
//! is in progress. [`SelectPoller`] is the portable fallback over `poll(2)`:
//! it needs a consistent snapshot per wait, so the [`PollMux`] queues
//! subscription changes and applies them between waits.

mod epoll;
mod mux;
mod select;

pub use epoll::EpollPoller;
pub use mux::PollMux;
pub use select::SelectPoller;

use std::{fmt, ops};

/// A set of readiness conditions.
///
/// `Interest` is used both to declare what a subscription watches and to
/// report what a [`PollEvent`] observed. Only read and write can be
/// subscribed; error and closed are reported on top by the facility.
///
/// # Examples
///
/// ```
/// use swarm_ws::poll::Interest;
///
/// let interest = Interest::READ | Interest::WRITE;
///
/// assert!(interest.is_readable());
/// assert!(interest.is_writable());
/// assert!(!interest.is_error());
/// ```
#[derive(Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Interest(u8);

const READ: u8 = 0b0001;
const WRITE: u8 = 0b0010;
const ERROR: u8 = 0b0100;
const CLOSED: u8 = 0b1000;

impl Interest {
    pub const READ: Interest = Interest(READ);
    pub const WRITE: Interest = Interest(WRITE);
    pub const ERROR: Interest = Interest(ERROR);
    pub const CLOSED: Interest = Interest(CLOSED);

    pub fn empty() -> Interest {
        Interest(0)
    }

    pub fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub fn is_readable(self) -> bool {
        self.contains(Interest::READ)
    }

    pub fn is_writable(self) -> bool {
        self.contains(Interest::WRITE)
    }

    pub fn is_error(self) -> bool {
        self.contains(Interest::ERROR)
    }

    pub fn is_closed(self) -> bool {
        self.contains(Interest::CLOSED)
    }

    pub fn contains(self, other: Interest) -> bool {
        (self.0 & other.0) == other.0
    }

    pub fn insert(&mut self, other: Interest) {
        self.0 |= other.0;
    }

    pub fn remove(&mut self, other: Interest) {
        self.0 &= !other.0;
    }

    fn bits(self) -> u8 {
        self.0
    }

    fn from_bits(bits: u8) -> Interest {
        Interest(bits)
    }
}

impl ops::BitOr for Interest {
    type Output = Interest;

    fn bitor(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }
}

impl ops::BitAnd for Interest {
    type Output = Interest;

    fn bitand(self, other: Interest) -> Interest {
        Interest(self.0 & other.0)
    }
}

impl ops::Sub for Interest {
    type Output = Interest;

    fn sub(self, other: Interest) -> Interest {
        Interest(self.0 & !other.0)
    }
}

impl fmt::Debug for Interest {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let mut one = false;
        let flags = [
            (Interest::READ, "Read"),
            (Interest::WRITE, "Write"),
            (Interest::ERROR, "Error"),
            (Interest::CLOSED, "Closed"),
        ];

        for (flag, msg) in flags {
            if self.contains(flag) {
                if one {
                    write!(fmt, " | ")?
                }
                write!(fmt, "{}", msg)?;
                one = true;
            }
        }

        if !one {
            write!(fmt, "(empty)")?;
        }

        Ok(())
    }
}

/// One readiness notification, packed into 64 bits.
///
/// The low 56 bits carry an opaque tag the subscriber chose; the engine packs
/// an arena slot and its generation in there and the poller never looks
/// inside. The high 8 bits carry the observed [`Interest`] set. A queued
/// event can be *cleared* (event bits zeroed) to cancel delivery after the
/// tagged connection is gone.
#[derive(Copy, Clone, PartialEq, Eq)]
pub struct PollEvent(u64);

/// Tags are limited to 56 bits.
pub const TAG_MASK: u64 = (1 << 56) - 1;

/// Reserved tag for the internal wakeup descriptor.
pub(crate) const TAG_AWAKEN: u64 = TAG_MASK;

impl PollEvent {
    pub fn new(tag: u64, events: Interest) -> PollEvent {
        debug_assert!(tag <= TAG_MASK);
        PollEvent((tag & TAG_MASK) | ((events.bits() as u64) << 56))
    }

    pub fn tag(self) -> u64 {
        self.0 & TAG_MASK
    }

    pub fn events(self) -> Interest {
        Interest::from_bits((self.0 >> 56) as u8)
    }

    /// Cancel a queued notification in place.
    pub fn clear_events(&mut self) {
        self.0 &= TAG_MASK;
    }

    pub fn is_cleared(self) -> bool {
        self.events().is_empty()
    }

    pub(crate) fn merge(&mut self, events: Interest) {
        self.0 |= (events.bits() as u64) << 56;
    }
}

impl fmt::Debug for PollEvent {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "PollEvent({}, {:?})", self.tag(), self.events())
    }
}

/// A readiness notification facility tracking a set of sockets.
///
/// Implementations differ in one capability, reported by
/// [`follow_epoll`](Poller::follow_epoll): whether the tracked set may be
/// modified while another thread is blocked in
/// [`wait_for_modified`](Poller::wait_for_modified). The multiplexer defers
/// modifications through a command queue when it may not.
pub trait Poller: Send + Sync {
    /// Start watching `fd`, reporting `interest` under `tag`.
    fn subscribe(&self, fd: std::os::unix::io::RawFd, tag: u64, interest: Interest) -> bool;

    /// Stop watching `fd`.
    fn unsubscribe(&self, fd: std::os::unix::io::RawFd) -> bool;

    /// Block up to `timeout_ms` for notifications; append them to `results`.
    /// Returns true when at least one event was appended.
    fn wait_for_modified(&self, results: &mut Vec<PollEvent>, timeout_ms: u64) -> bool;

    /// How many sockets this instance can track.
    fn max_sockets(&self) -> usize;

    /// Current number of tracked sockets.
    fn count(&self) -> usize;

    /// True when the facility accepts subscription changes during a wait.
    fn follow_epoll(&self) -> bool;

    /// Wake every blocked wait and refuse further ones.
    fn terminate(&self);
}
