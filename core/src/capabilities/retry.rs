use std::fmt;
use std::thread;
use std::time::Duration;

use crate::promise::Promise;

/// Bounded retry counter with an optional fixed pause between attempts.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    max_retries: u32,
    retry_count: u32,
    delay: Duration,
}

impl RetryPolicy {
    /// Allow up to `max_retries` retries after the first attempt.
    #[must_use]
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    #[must_use]
    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    #[must_use]
    pub fn retry_count(&self) -> u32 {
        self.retry_count
    }

    #[must_use]
    pub fn should_retry(&self) -> bool {
        self.retry_count < self.max_retries
    }

    pub fn increment(&mut self) {
        self.retry_count = self.retry_count.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.retry_count = 0;
    }

    /// Call `attempt` until it succeeds or retries are exhausted.
    ///
    /// `attempt` receives the number of retries so far (0 on the first call). The
    /// last error is returned once the budget is spent.
    pub fn run<T, E, F>(&mut self, mut attempt: F) -> Result<T, E>
    where
        E: fmt::Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        loop {
            match attempt(self.retry_count) {
                Ok(value) => return Ok(value),
                Err(err) if self.should_retry() => {
                    self.increment();
                    tracing::debug!(
                        retry = self.retry_count,
                        max_retries = self.max_retries,
                        error = %err,
                        "Attempt failed, retrying"
                    );
                    if !self.delay.is_zero() {
                        thread::sleep(self.delay);
                    }
                }
                Err(err) => return Err(err),
            }
        }
    }

    /// A promise that builds and drives a fresh promise per attempt.
    pub fn promise<T, F>(self, mut factory: F) -> Promise<T>
    where
        T: Clone + 'static,
        F: FnMut() -> Promise<T> + 'static,
    {
        let mut policy = self;
        Promise::from_fn(move || policy.run(|_| factory().run()))
    }
}
