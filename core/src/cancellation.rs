use std::cell::Cell;
use std::rc::Rc;

/// Cooperative cancellation flag shared between the initiator and a running unit of work.
///
/// Clones observe the same flag. Not `Send`: tokens live on the thread that drives
/// the promises observing them.
#[derive(Debug, Clone, Default)]
pub struct CancellationToken {
    cancelled: Rc<Cell<bool>>,
}

impl CancellationToken {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.set(true);
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.get()
    }

    pub fn reset(&self) {
        self.cancelled.set(false);
    }
}
