//! Blocking wait operations over promises.
//!
//! Entries are driven one after another on the calling thread. There is no real
//! concurrency here: "first to settle" means first in evaluation order.

use std::thread;
use std::time::{Duration, Instant};

use serde::Serialize;

use crate::error::{AsyncError, duration_ms};
use crate::promise::Promise;

pub const DEFAULT_UNTIL_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_UNTIL_INTERVAL: Duration = Duration::from_millis(100);

/// Per-entry outcome reported by [`Await::all_settled`].
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "lowercase")]
pub enum Settlement<T> {
    Fulfilled { value: T },
    Rejected {
        #[serde(serialize_with = "serialize_reason")]
        reason: AsyncError,
    },
}

impl<T> Settlement<T> {
    #[must_use]
    pub fn status(&self) -> &'static str {
        match self {
            Settlement::Fulfilled { .. } => "fulfilled",
            Settlement::Rejected { .. } => "rejected",
        }
    }

    #[must_use]
    pub fn value(&self) -> Option<&T> {
        match self {
            Settlement::Fulfilled { value } => Some(value),
            Settlement::Rejected { .. } => None,
        }
    }

    #[must_use]
    pub fn reason(&self) -> Option<&AsyncError> {
        match self {
            Settlement::Fulfilled { .. } => None,
            Settlement::Rejected { reason } => Some(reason),
        }
    }
}

fn serialize_reason<S: serde::Serializer>(reason: &AsyncError, s: S) -> Result<S::Ok, S::Error> {
    s.collect_str(reason)
}

pub struct Await;

impl Await {
    pub fn one<T: Clone + 'static>(promise: &Promise<T>) -> Result<T, AsyncError> {
        promise.run()
    }

    /// Drive every entry in order and collect the values.
    ///
    /// Stops at the first rejection; later entries are left undriven.
    pub fn all<T, I>(promises: I) -> Result<Vec<T>, AsyncError>
    where
        T: Clone + 'static,
        I: IntoIterator<Item = Promise<T>>,
    {
        promises.into_iter().map(|promise| promise.run()).collect()
    }

    /// [`Await::all`] for keyed entries, preserving key order.
    pub fn all_keyed<K, T, I>(entries: I) -> Result<Vec<(K, T)>, AsyncError>
    where
        T: Clone + 'static,
        I: IntoIterator<Item = (K, Promise<T>)>,
    {
        entries
            .into_iter()
            .map(|(key, promise)| promise.run().map(|value| (key, value)))
            .collect()
    }

    /// Outcome of the first entry to settle.
    ///
    /// Entries that are already settled win in input order; otherwise the first entry
    /// is driven and its outcome (value or error) is returned.
    pub fn race<T: Clone + 'static>(promises: &[Promise<T>]) -> Result<T, AsyncError> {
        if let Some(settled) = promises.iter().find(|promise| !promise.is_pending()) {
            return settled.run();
        }
        match promises.first() {
            Some(first) => first.run(),
            None => Err(AsyncError::Empty),
        }
    }

    /// First fulfilled value in input order, tolerating rejections.
    ///
    /// Every pending entry is started before any outcome is inspected, so later
    /// entries run even when an earlier one fulfills. Fails with
    /// [`AsyncError::AllRejected`] carrying every error, in input order, when no
    /// entry fulfills.
    pub fn any<T: Clone + 'static>(promises: &[Promise<T>]) -> Result<T, AsyncError> {
        for promise in promises.iter().filter(|promise| promise.is_pending()) {
            let _ = promise.run();
        }

        let mut errors = Vec::with_capacity(promises.len());
        for promise in promises {
            match promise.run() {
                Ok(value) => return Ok(value),
                Err(err) => errors.push(err),
            }
        }
        Err(AsyncError::AllRejected(errors))
    }

    /// Drive every entry and report each outcome. Never fails.
    pub fn all_settled<T, I>(promises: I) -> Vec<Settlement<T>>
    where
        T: Clone + 'static,
        I: IntoIterator<Item = Promise<T>>,
    {
        promises
            .into_iter()
            .map(|promise| match promise.run() {
                Ok(value) => Settlement::Fulfilled { value },
                Err(reason) => Settlement::Rejected { reason },
            })
            .collect()
    }

    /// [`Await::until_within`] with a 10 s budget polled every 100 ms.
    pub fn until<V, F>(condition: F) -> Result<V, AsyncError>
    where
        F: FnMut() -> Option<V>,
    {
        Self::until_within(condition, DEFAULT_UNTIL_TIMEOUT, DEFAULT_UNTIL_INTERVAL)
    }

    /// Poll `condition` until it yields a value or `timeout` elapses.
    ///
    /// Blocks the calling thread between polls.
    pub fn until_within<V, F>(
        mut condition: F,
        timeout: Duration,
        interval: Duration,
    ) -> Result<V, AsyncError>
    where
        F: FnMut() -> Option<V>,
    {
        let started = Instant::now();
        loop {
            if let Some(value) = condition() {
                return Ok(value);
            }
            if started.elapsed() > timeout {
                return Err(AsyncError::ConditionTimeout {
                    ms: duration_ms(timeout),
                });
            }
            thread::sleep(interval);
        }
    }

    /// Block the whole thread for `duration`.
    pub fn delay(duration: Duration) {
        thread::sleep(duration);
    }
}
