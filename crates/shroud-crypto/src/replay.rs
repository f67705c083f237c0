//! Bounded nonce window for replay detection.
//!
//! Frame nonces are random rather than sequential, so the window is a set of
//! the most recently accepted nonces with FIFO eviction instead of a bitmap.
//!
//! # Thread Safety
//!
//! Not thread-safe. Each ingestion worker owns its window.

use std::collections::{HashSet, VecDeque};

use shroud_common::NONCE_LEN;

/// Remembers the last `capacity` nonces accepted for one key.
#[derive(Debug, Clone)]
pub struct NonceWindow {
    seen: HashSet<[u8; NONCE_LEN]>,
    order: VecDeque<[u8; NONCE_LEN]>,
    capacity: usize,
}

impl Default for NonceWindow {
    fn default() -> Self {
        Self::new()
    }
}

impl NonceWindow {
    /// Default window: 4096 nonces.
    pub const DEFAULT_CAPACITY: usize = 4096;

    pub fn new() -> Self {
        Self::with_capacity(Self::DEFAULT_CAPACITY)
    }

    /// Create a window; a capacity of zero is treated as one.
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            seen: HashSet::with_capacity(capacity),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Check without recording.
    pub fn check(&self, nonce: &[u8]) -> bool {
        match <[u8; NONCE_LEN]>::try_from(nonce) {
            Ok(nonce) => !self.seen.contains(&nonce),
            Err(_) => false,
        }
    }

    /// Returns true and records the nonce if it was not seen recently.
    ///
    /// Nonces of the wrong length are always rejected.
    pub fn check_and_insert(&mut self, nonce: &[u8]) -> bool {
        let Ok(nonce) = <[u8; NONCE_LEN]>::try_from(nonce) else {
            return false;
        };
        if !self.seen.insert(nonce) {
            return false;
        }
        self.order.push_back(nonce);
        if self.order.len() > self.capacity {
            if let Some(evicted) = self.order.pop_front() {
                self.seen.remove(&evicted);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn reset(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nonce(n: u32) -> [u8; NONCE_LEN] {
        let mut out = [0u8; NONCE_LEN];
        out[..4].copy_from_slice(&n.to_le_bytes());
        out
    }

    #[test]
    fn test_duplicate_rejected() {
        let mut window = NonceWindow::new();
        assert!(window.check_and_insert(&nonce(1)));
        assert!(!window.check_and_insert(&nonce(1)));
        assert!(window.check_and_insert(&nonce(2)));
        assert_eq!(window.len(), 2);
    }

    #[test]
    fn test_check_does_not_record() {
        let mut window = NonceWindow::new();
        assert!(window.check(&nonce(5)));
        assert!(window.check(&nonce(5)));
        window.check_and_insert(&nonce(5));
        assert!(!window.check(&nonce(5)));
    }

    #[test]
    fn test_eviction() {
        let mut window = NonceWindow::with_capacity(3);
        for n in 0..4 {
            assert!(window.check_and_insert(&nonce(n)));
        }
        assert_eq!(window.len(), 3);
        // Oldest one fell out of the window.
        assert!(window.check_and_insert(&nonce(0)));
        assert!(!window.check_and_insert(&nonce(3)));
    }

    #[test]
    fn test_wrong_length_rejected() {
        let mut window = NonceWindow::new();
        assert!(!window.check_and_insert(&[0u8; 8]));
        assert!(!window.check(&[0u8; 13]));
        assert!(window.is_empty());
    }

    #[test]
    fn test_reset() {
        let mut window = NonceWindow::new();
        window.check_and_insert(&nonce(9));
        window.reset();
        assert!(window.is_empty());
        assert!(window.check_and_insert(&nonce(9)));
    }
}
