use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Shared stop flag checked by tasks and provider walkers between batches.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    flag: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_cancelled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }

    /// Returns true if this call flipped the flag.
    pub fn cancel(&self) -> bool {
        !self.flag.swap(true, Ordering::SeqCst)
    }

    /// Guard that cancels the token when dropped.
    pub fn drop_guard(&self) -> CancelOnDrop {
        CancelOnDrop {
            token: self.clone(),
        }
    }
}

/// Stops a background walker when the consuming future goes away.
pub struct CancelOnDrop {
    token: CancellationToken,
}

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.token.cancel();
    }
}
