use std::fmt;

/// Identifies one live connection for the lifetime of a server.
///
/// Handles are positive 31-bit integers handed out monotonically by the
/// registry; zero means "not a connection". They are never reused, so a
/// stale handle simply stops resolving.
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Handle(pub u32);

/// Largest value a handle may take before allocation becomes a fatal error.
pub const MAX_HANDLE: u32 = i32::MAX as u32;

impl Handle {
    pub fn is_valid(self) -> bool {
        self.0 != 0
    }
}

impl From<u32> for Handle {
    #[inline]
    fn from(val: u32) -> Handle {
        Handle(val)
    }
}

impl From<Handle> for u32 {
    #[inline]
    fn from(val: Handle) -> u32 {
        val.0
    }
}

impl fmt::Debug for Handle {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "Handle({})", self.0)
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "{}", self.0)
    }
}
