use std::fmt;

use serde_json::Value;

use crate::promise::invoke_handler;

type ValueCallback = Box<dyn FnOnce(&Value)>;
type ErrorCallback = Box<dyn FnOnce(&anyhow::Error)>;
type FinallyCallback = Box<dyn FnOnce()>;

/// Outcome callbacks held by a task. Each fires at most once.
#[derive(Default)]
pub struct Callbacks {
    then: Option<ValueCallback>,
    catch: Option<ErrorCallback>,
    finally: Option<FinallyCallback>,
}

impl Callbacks {
    /// Fire the callbacks matching `outcome`, then `finally`.
    ///
    /// Callbacks are consumed on the first trigger, so repeated runs of the owning
    /// task never fire them again. A panicking callback is logged and does not stop
    /// `finally` from firing.
    pub fn trigger(&mut self, outcome: &anyhow::Result<Value>) {
        match outcome {
            Ok(value) => {
                if let Some(then) = self.then.take() {
                    invoke_handler("then", || then(value));
                }
            }
            Err(err) => {
                if let Some(catch) = self.catch.take() {
                    invoke_handler("catch", || catch(err));
                }
            }
        }
        if let Some(finally) = self.finally.take() {
            invoke_handler("finally", finally);
        }
    }
}

impl fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Callbacks")
            .field("then", &self.then.is_some())
            .field("catch", &self.catch.is_some())
            .field("finally", &self.finally.is_some())
            .finish()
    }
}

/// Fluent then/catch/finally registration for types that own [`Callbacks`].
pub trait Thenable: Sized {
    fn callbacks(&mut self) -> &mut Callbacks;

    fn then(mut self, callback: impl FnOnce(&Value) + 'static) -> Self {
        self.callbacks().then = Some(Box::new(callback));
        self
    }

    fn catch(mut self, callback: impl FnOnce(&anyhow::Error) + 'static) -> Self {
        self.callbacks().catch = Some(Box::new(callback));
        self
    }

    fn finally(mut self, callback: impl FnOnce() + 'static) -> Self {
        self.callbacks().finally = Some(Box::new(callback));
        self
    }
}
