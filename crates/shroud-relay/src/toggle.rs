use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Process-wide decryption switch shared by every ingest worker.
///
/// Workers read it once per frame, so a flip takes effect on the next
/// dequeued frame of every stream.
#[derive(Debug, Clone)]
pub struct DecryptionToggle {
    enabled: Arc<AtomicBool>,
}

impl DecryptionToggle {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: Arc::new(AtomicBool::new(enabled)),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Flip the switch and return the new state.
    pub fn flip(&self) -> bool {
        !self.enabled.fetch_xor(true, Ordering::AcqRel)
    }

    pub fn set(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }
}

impl Default for DecryptionToggle {
    fn default() -> Self {
        Self::new(true)
    }
}
