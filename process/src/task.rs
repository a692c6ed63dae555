use serde_json::{Value, json};
use tokio::runtime::Builder;

use fibril_core::capabilities::{Callbacks, RetryPolicy, Task, Thenable};

use crate::dispatcher::{DispatchOptions, Dispatcher};
use crate::job::Job;

/// Dispatches a job when a host scheduler triggers it.
///
/// `run` drives its own single-threaded runtime, so it must not be called from
/// inside an async context.
#[derive(Debug)]
pub struct ProcessTask<J: Job> {
    dispatcher: Dispatcher,
    job: J,
    options: DispatchOptions,
    retry: Option<RetryPolicy>,
    callbacks: Callbacks,
}

impl<J: Job> ProcessTask<J> {
    #[must_use]
    pub fn new(dispatcher: Dispatcher, job: J) -> Self {
        Self {
            dispatcher,
            job,
            options: DispatchOptions::default(),
            retry: None,
            callbacks: Callbacks::default(),
        }
    }

    pub fn options(mut self, options: DispatchOptions) -> Self {
        self.options = options;
        self
    }

    /// Retry failed dispatches (throttling included) under `policy`.
    pub fn retry(mut self, policy: RetryPolicy) -> Self {
        self.retry = Some(policy);
        self
    }

    fn dispatch_once(&self) -> anyhow::Result<Value> {
        let runtime = Builder::new_current_thread().enable_all().build()?;
        let pid = runtime.block_on(self.dispatcher.dispatch(&self.job, self.options.clone()))?;
        Ok(json!({ "pid": pid.map(u32::from), "job": J::NAME }))
    }
}

impl<J: Job> Thenable for ProcessTask<J> {
    fn callbacks(&mut self) -> &mut Callbacks {
        &mut self.callbacks
    }
}

impl<J: Job> Task for ProcessTask<J> {
    fn run(&mut self) -> anyhow::Result<Value> {
        let outcome = match self.retry.take() {
            Some(mut policy) => {
                let outcome = policy.run(|_| self.dispatch_once());
                policy.reset();
                self.retry = Some(policy);
                outcome
            }
            None => self.dispatch_once(),
        };
        self.callbacks.trigger(&outcome);
        outcome
    }
}
