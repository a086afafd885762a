//! Connection identifier allocation
//!
//! Each tunnel sharing a suffix domain needs its own identifier. The
//! generator is owned by whoever creates connections and passed in, so
//! tests can run many connections side by side with predictable ids.

use std::sync::atomic::{AtomicU16, Ordering};

/// Hands out connection identifiers in sequence, starting at a seed
#[derive(Debug)]
pub struct ConnIdGenerator {
    next: AtomicU16,
}

impl ConnIdGenerator {
    /// Generator starting at `seed`
    pub fn with_seed(seed: u16) -> Self {
        Self {
            next: AtomicU16::new(seed),
        }
    }

    /// Generator starting at a random point, so restarted clients are
    /// unlikely to collide with connections the responder still tracks
    pub fn new() -> Self {
        Self::with_seed(rand::random::<u16>())
    }

    /// Next identifier; wraps after 65535
    pub fn next_id(&self) -> u16 {
        self.next.fetch_add(1, Ordering::Relaxed)
    }
}

impl Default for ConnIdGenerator {
    fn default() -> Self {
        Self::new()
    }
}
