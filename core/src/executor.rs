//! Wraps units of work into promises with cooperative cancellation checks.

use std::time::Duration;

use crate::cancellation::CancellationToken;
use crate::error::{AsyncError, CancelStage};
use crate::promise::Promise;

#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    pub timeout: Option<Duration>,
    pub token: Option<CancellationToken>,
}

impl RunOptions {
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    #[must_use]
    pub fn token(mut self, token: CancellationToken) -> Self {
        self.token = Some(token);
        self
    }
}

/// Entry point for running work as a promise.
pub struct Async;

impl Async {
    pub fn run<T, F, E>(work: F) -> Promise<T>
    where
        T: 'static,
        F: FnOnce() -> Result<T, E> + 'static,
        E: Into<AsyncError>,
    {
        Self::run_with(work, RunOptions::default())
    }

    /// Run `work` when the returned promise is driven.
    ///
    /// The token is consulted before the work starts and after it returns; a
    /// cancellation observed at either point rejects the promise with
    /// [`AsyncError::CancelledAt`]. Failures of the work itself are captured as the
    /// rejection cause and only surface when the promise is driven.
    pub fn run_with<T, F, E>(work: F, options: RunOptions) -> Promise<T>
    where
        T: 'static,
        F: FnOnce() -> Result<T, E> + 'static,
        E: Into<AsyncError>,
    {
        let RunOptions { timeout, token } = options;
        let promise = Promise::from_fn(move || {
            let outcome = guarded(work, token.as_ref());
            if let Err(err) = &outcome {
                tracing::debug!(error = %err, "Unit of work failed");
            }
            outcome
        });
        match timeout {
            Some(timeout) => promise.timeout(timeout),
            None => promise,
        }
    }

    /// Abort the current unit of work if cancellation was requested.
    ///
    /// This is the only way cancellation interrupts work that is already running.
    pub fn checkpoint(token: &CancellationToken, message: &str) -> Result<(), AsyncError> {
        if token.is_cancelled() {
            return Err(AsyncError::Checkpoint(message.to_string()));
        }
        Ok(())
    }
}

fn guarded<T, F, E>(work: F, token: Option<&CancellationToken>) -> Result<T, AsyncError>
where
    F: FnOnce() -> Result<T, E>,
    E: Into<AsyncError>,
{
    check(token, CancelStage::Before)?;
    let value = work().map_err(Into::into)?;
    check(token, CancelStage::After)?;
    Ok(value)
}

fn check(token: Option<&CancellationToken>, stage: CancelStage) -> Result<(), AsyncError> {
    match token {
        Some(token) if token.is_cancelled() => Err(AsyncError::CancelledAt { stage }),
        _ => Ok(()),
    }
}
