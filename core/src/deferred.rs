use crate::error::AsyncError;
use crate::promise::Promise;

/// A promise settled from outside its own unit of work.
///
/// Bridges callback-style completion into the promise model. Driving the promise
/// before either `resolve` or `reject` is called fulfills it with `None`.
pub struct Deferred<T> {
    promise: Promise<Option<T>>,
}

impl<T: Clone + 'static> Deferred<T> {
    #[must_use]
    pub fn new() -> Self {
        Self {
            promise: Promise::from_fn(|| Ok::<_, AsyncError>(None)),
        }
    }

    #[must_use]
    pub fn promise(&self) -> Promise<Option<T>> {
        self.promise.clone()
    }

    /// Fulfill with `value`. Returns false if the promise had already settled.
    pub fn resolve(&self, value: T) -> bool {
        self.promise.fulfill(Some(value))
    }

    /// Reject with `error`. Returns false if the promise had already settled.
    pub fn reject(&self, error: impl Into<AsyncError>) -> bool {
        self.promise.fail(error.into())
    }
}

impl<T: Clone + 'static> Default for Deferred<T> {
    fn default() -> Self {
        Self::new()
    }
}
