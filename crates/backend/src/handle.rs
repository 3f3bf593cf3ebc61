//! Opaque identifiers for sessions and device buffers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

static NEXT_SESSION: AtomicU64 = AtomicU64::new(1);

/// Process-unique id of a device session. Never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SessionId(u64);

impl SessionId {
    pub(crate) fn next() -> Self {
        Self(NEXT_SESSION.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A region of device memory owned by one session.
///
/// Handles are plain values; they become dangling when their session closes
/// and are rejected by every other session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferHandle {
    address: u32,
    len: usize,
    session: SessionId,
}

impl BufferHandle {
    pub(crate) fn new(address: u32, len: usize, session: SessionId) -> Self {
        Self {
            address,
            len,
            session,
        }
    }

    /// Device address as marshaled into kernel argument words.
    pub fn address(&self) -> u32 {
        self.address
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn session(&self) -> SessionId {
        self.session
    }
}

impl fmt::Display for BufferHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}+{} (session {})", self.address, self.len, self.session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_ids_are_unique() {
        let first = SessionId::next();
        let second = SessionId::next();
        assert_ne!(first, second);
        assert!(second > first);
    }
}
