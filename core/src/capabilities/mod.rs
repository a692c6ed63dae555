//! Small capability interfaces that tasks compose instead of inheriting behavior.

mod cancelable;
mod retry;
mod task;
mod thenable;

pub use cancelable::{Cancelable, DEFAULT_CANCEL_DELAY, DEFAULT_CANCEL_POLL};
pub use retry::RetryPolicy;
pub use task::{PromiseTask, Task};
pub use thenable::{Callbacks, Thenable};
