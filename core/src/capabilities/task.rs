use serde::Serialize;
use serde_json::Value;

use crate::capabilities::thenable::{Callbacks, Thenable};
use crate::promise::Promise;

/// A unit a host scheduler can trigger.
pub trait Task {
    fn run(&mut self) -> anyhow::Result<Value>;
}

/// Drives a promise and reports its value as JSON.
#[derive(Debug)]
pub struct PromiseTask<T: 'static> {
    promise: Promise<T>,
    callbacks: Callbacks,
}

impl<T: 'static> PromiseTask<T> {
    #[must_use]
    pub fn new(promise: Promise<T>) -> Self {
        Self {
            promise,
            callbacks: Callbacks::default(),
        }
    }
}

impl<T: 'static> Thenable for PromiseTask<T> {
    fn callbacks(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }
}

impl<T: Serialize + Clone + 'static> Task for PromiseTask<T> {
    fn run(&mut self) -> anyhow::Result<Value> {
        let outcome = self
            .promise
            .run()
            .map_err(anyhow::Error::from)
            .and_then(|value| Ok(serde_json::to_value(value)?));
        self.callbacks.trigger(&outcome);
        outcome
    }
}
