use std::thread;
use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::promise::Promise;

pub const DEFAULT_CANCEL_POLL: Duration = Duration::from_millis(100);
pub const DEFAULT_CANCEL_DELAY: Duration = Duration::from_millis(500);

/// Something that can be cancelled cooperatively.
pub trait Cancelable {
    fn cancel(&self);

    fn is_cancelled(&self) -> bool;

    /// Whether a later `cancel()` can still take effect.
    fn can_cancel(&self) -> bool {
        !self.is_cancelled()
    }

    /// Cancel when `condition` holds. Returns whether it did.
    fn cancel_if(&self, condition: impl FnOnce() -> bool) -> bool {
        if condition() {
            self.cancel();
            return true;
        }
        false
    }

    /// Block, polling `condition` every `interval`, until it holds (then cancel) or
    /// cancellation can no longer take effect.
    fn cancel_when(&self, mut condition: impl FnMut() -> bool, interval: Duration) {
        while self.can_cancel() {
            if condition() {
                self.cancel();
                return;
            }
            thread::sleep(interval);
        }
    }

    /// When `condition` holds, wait `delay` and then cancel. Returns whether it did.
    fn cancel_after_if(&self, condition: impl FnOnce() -> bool, delay: Duration) -> bool {
        if !condition() {
            return false;
        }
        thread::sleep(delay);
        self.cancel();
        true
    }
}

impl Cancelable for CancellationToken {
    fn cancel(&self) {
        CancellationToken::cancel(self);
    }

    fn is_cancelled(&self) -> bool {
        CancellationToken::is_cancelled(self)
    }
}

impl<T: 'static> Cancelable for Promise<T> {
    fn cancel(&self) {
        Promise::cancel(self);
    }

    fn is_cancelled(&self) -> bool {
        Promise::is_cancelled(self)
    }

    fn can_cancel(&self) -> bool {
        self.is_pending()
    }
}
