//! Promise state machine.
//!
//! A [`Promise`] wraps a unit of work that runs when the promise is first driven with
//! [`Promise::run`]. Driving is synchronous: there is no scheduler, so the caller's
//! thread executes the work and every chained transform in order. Once settled, a
//! promise hands out the same value or error on every `run()` without re-executing
//! anything.
//!
//! Handlers attached with [`Promise::catch`] and [`Promise::finally`] fire at most
//! once per promise. Attaching after settlement invokes the handler inline, unless a
//! handler for that slot has already fired. A panicking handler is logged and never
//! disturbs settlement.
//!
//! No `RefCell` borrow is held while user code runs, so work and handlers may freely
//! inspect (or cancel) the promise they belong to. Driving a promise from inside its
//! own unit of work yields [`AsyncError::Reentrant`].

use std::any::Any;
use std::cell::RefCell;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::rc::Rc;
use std::time::{Duration, Instant};

use fibril_types::PromiseState;

use crate::error::{AsyncError, duration_ms};

type Work<T> = Box<dyn FnOnce() -> Result<T, AsyncError>>;
type RejectHandler = Box<dyn FnOnce(&AsyncError)>;
type SettleHandler = Box<dyn FnOnce()>;

/// A value a `then` transform may return: a plain `Result` or a nested promise that
/// is driven to completion before the chain continues.
pub trait Chain {
    type Output;

    fn settle(self) -> Result<Self::Output, AsyncError>;
}

impl<U, E> Chain for Result<U, E>
where
    E: Into<AsyncError>,
{
    type Output = U;

    fn settle(self) -> Result<U, AsyncError> {
        self.map_err(Into::into)
    }
}

impl<U: Clone + 'static> Chain for Promise<U> {
    type Output = U;

    fn settle(self) -> Result<U, AsyncError> {
        self.run()
    }
}

enum Settled<T> {
    Fulfilled(T),
    Rejected(AsyncError),
    Cancelled(AsyncError),
}

impl<T: Clone> Settled<T> {
    fn outcome(&self) -> Result<T, AsyncError> {
        match self {
            Settled::Fulfilled(value) => Ok(value.clone()),
            Settled::Rejected(err) | Settled::Cancelled(err) => Err(err.clone()),
        }
    }
}

impl<T> Settled<T> {
    fn state(&self) -> PromiseState {
        match self {
            Settled::Fulfilled(_) => PromiseState::Fulfilled,
            Settled::Rejected(_) => PromiseState::Rejected,
            Settled::Cancelled(_) => PromiseState::Cancelled,
        }
    }
}

/// Fire-once handler slot.
enum Latch<H> {
    Empty,
    Armed(H),
    Fired,
}

impl<H> Latch<H> {
    fn take_armed(&mut self) -> Option<H> {
        match mem::replace(self, Latch::Fired) {
            Latch::Armed(handler) => Some(handler),
            Latch::Empty => {
                *self = Latch::Empty;
                None
            }
            Latch::Fired => None,
        }
    }

    fn has_fired(&self) -> bool {
        matches!(self, Latch::Fired)
    }
}

struct Inner<T> {
    settled: Option<Settled<T>>,
    work: Option<Work<T>>,
    driving: bool,
    created_at: Instant,
    timeout: Option<Duration>,
    on_rejected: Latch<RejectHandler>,
    on_settled: Latch<SettleHandler>,
}

impl<T> Inner<T> {
    fn new(work: Option<Work<T>>, settled: Option<Settled<T>>) -> Self {
        Self {
            settled,
            work,
            driving: false,
            created_at: Instant::now(),
            timeout: None,
            on_rejected: Latch::Empty,
            on_settled: Latch::Empty,
        }
    }

    fn deadline_error(&self) -> Option<AsyncError> {
        let timeout = self.timeout?;
        (self.created_at.elapsed() > timeout).then(|| AsyncError::Timeout {
            ms: duration_ms(timeout),
        })
    }
}

/// Handle to a single eventual outcome.
///
/// Clones share the same state. Not `Send`: a promise and everything chained from it
/// live on the thread that drives them.
pub struct Promise<T> {
    inner: Rc<RefCell<Inner<T>>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl<T: 'static> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl<T: 'static> Promise<T> {
    /// Wrap a unit of work. Nothing runs until the promise is driven.
    pub fn from_fn<F, E>(work: F) -> Self
    where
        F: FnOnce() -> Result<T, E> + 'static,
        E: Into<AsyncError>,
    {
        let work: Work<T> = Box::new(move || work().map_err(Into::into));
        Self::with_inner(Inner::new(Some(work), None))
    }

    /// An already-fulfilled promise.
    pub fn resolve(value: T) -> Self {
        Self::with_inner(Inner::new(None, Some(Settled::Fulfilled(value))))
    }

    /// An already-rejected promise.
    pub fn reject(error: impl Into<AsyncError>) -> Self {
        Self::with_inner(Inner::new(None, Some(Settled::Rejected(error.into()))))
    }

    fn with_inner(inner: Inner<T>) -> Self {
        Self {
            inner: Rc::new(RefCell::new(inner)),
        }
    }

    fn from_outcome(outcome: Result<T, AsyncError>) -> Self {
        match outcome {
            Ok(value) => Self::resolve(value),
            Err(err) => Self::reject(err),
        }
    }

    /// Set the deadline, measured from the promise's creation.
    ///
    /// An already-elapsed deadline takes effect the next time the promise is driven.
    pub fn timeout(&self, timeout: Duration) -> Self {
        self.inner.borrow_mut().timeout = Some(timeout);
        self.clone()
    }

    /// Register a rejection handler. Fires at most once; never for cancellation.
    pub fn catch<F>(&self, handler: F) -> Self
    where
        F: FnOnce(&AsyncError) + 'static,
    {
        let error = {
            let mut guard = self.inner.borrow_mut();
            let inner = &mut *guard;
            if inner.on_rejected.has_fired() {
                return self.clone();
            }
            match &inner.settled {
                None => {
                    inner.on_rejected = Latch::Armed(Box::new(handler));
                    return self.clone();
                }
                Some(Settled::Rejected(err)) => {
                    let err = err.clone();
                    inner.on_rejected = Latch::Fired;
                    err
                }
                Some(_) => return self.clone(),
            }
        };
        invoke_handler("catch", || handler(&error));
        self.clone()
    }

    /// Register a handler for any terminal state. Fires at most once.
    pub fn finally<F>(&self, handler: F) -> Self
    where
        F: FnOnce() + 'static,
    {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.on_settled.has_fired() {
                return self.clone();
            }
            if inner.settled.is_none() {
                inner.on_settled = Latch::Armed(Box::new(handler));
                return self.clone();
            }
            inner.on_settled = Latch::Fired;
        }
        invoke_handler("finally", handler);
        self.clone()
    }

    /// Force a pending promise into `Cancelled`. Returns whether the call took effect.
    pub fn cancel(&self) -> bool {
        self.settle(Settled::Cancelled(AsyncError::Cancelled))
    }

    pub(crate) fn fulfill(&self, value: T) -> bool {
        self.settle(Settled::Fulfilled(value))
    }

    pub(crate) fn fail(&self, error: AsyncError) -> bool {
        self.settle(Settled::Rejected(error))
    }

    fn settle(&self, settled: Settled<T>) -> bool {
        let (on_rejected, on_settled, error) = {
            let mut inner = self.inner.borrow_mut();
            if inner.settled.is_some() {
                return false;
            }
            let (on_rejected, error) = match &settled {
                Settled::Rejected(err) => (inner.on_rejected.take_armed(), Some(err.clone())),
                _ => (None, None),
            };
            let on_settled = inner.on_settled.take_armed();
            inner.settled = Some(settled);
            inner.work = None;
            (on_rejected, on_settled, error)
        };

        if let (Some(handler), Some(error)) = (on_rejected, error) {
            invoke_handler("catch", || handler(&error));
        }
        if let Some(handler) = on_settled {
            invoke_handler("finally", handler);
        }
        true
    }

    #[must_use]
    pub fn state(&self) -> PromiseState {
        self.inner
            .borrow()
            .settled
            .as_ref()
            .map_or(PromiseState::Pending, Settled::state)
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.state() == PromiseState::Pending
    }

    #[must_use]
    pub fn is_fulfilled(&self) -> bool {
        self.state() == PromiseState::Fulfilled
    }

    #[must_use]
    pub fn is_rejected(&self) -> bool {
        self.state() == PromiseState::Rejected
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.state() == PromiseState::Cancelled
    }

    /// Error of a rejected or cancelled promise.
    #[must_use]
    pub fn error(&self) -> Option<AsyncError> {
        match &self.inner.borrow().settled {
            Some(Settled::Rejected(err) | Settled::Cancelled(err)) => Some(err.clone()),
            _ => None,
        }
    }
}

impl<T: Clone + 'static> Promise<T> {
    /// Drive the promise to a terminal state and return its outcome.
    ///
    /// The deadline is checked before the work starts and again after it returns; a
    /// late result is discarded and the promise is cancelled with a timeout error.
    pub fn run(&self) -> Result<T, AsyncError> {
        let work = {
            let mut inner = self.inner.borrow_mut();
            if let Some(settled) = &inner.settled {
                return settled.outcome();
            }
            if inner.driving {
                return Err(AsyncError::Reentrant);
            }
            let expired = inner.deadline_error();
            if let Some(err) = expired {
                drop(inner);
                self.settle(Settled::Cancelled(err));
                return self.outcome();
            }
            let Some(work) = inner.work.take() else {
                return Err(AsyncError::Reentrant);
            };
            inner.driving = true;
            work
        };

        let produced = panic::catch_unwind(AssertUnwindSafe(work))
            .unwrap_or_else(|payload| Err(AsyncError::Panicked(panic_message(&*payload))));

        let late = {
            let mut inner = self.inner.borrow_mut();
            inner.driving = false;
            inner.deadline_error()
        };

        // No-op when the work cancelled or resolved its own promise.
        self.settle(match (produced, late) {
            (_, Some(err)) => Settled::Cancelled(err),
            (Ok(value), None) => Settled::Fulfilled(value),
            (Err(err), None) => Settled::Rejected(err),
        });
        self.outcome()
    }

    fn outcome(&self) -> Result<T, AsyncError> {
        self.inner
            .borrow()
            .settled
            .as_ref()
            .map_or(Err(AsyncError::Reentrant), Settled::outcome)
    }

    /// Fulfilled value, without driving.
    #[must_use]
    pub fn result(&self) -> Option<T> {
        match &self.inner.borrow().settled {
            Some(Settled::Fulfilled(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// Chain a transform onto the fulfilled value.
    ///
    /// The transform may return a `Result` or another promise; a returned promise is
    /// driven to completion and its outcome substituted. On a settled parent the
    /// transform runs immediately; on a pending parent the returned promise drives the
    /// parent first when it is itself driven. Errors propagate without running `f`.
    pub fn then<C, F>(&self, f: F) -> Promise<C::Output>
    where
        F: FnOnce(T) -> C + 'static,
        C: Chain,
        C::Output: 'static,
    {
        if self.is_pending() {
            let parent = self.clone();
            return Promise::from_fn(move || f(parent.run()?).settle());
        }
        match self.outcome() {
            Ok(value) => Promise::from_outcome(f(value).settle()),
            Err(err) => Promise::reject(err),
        }
    }

    /// Chain a pure value transform.
    pub fn map<U, F>(&self, f: F) -> Promise<U>
    where
        F: FnOnce(T) -> U + 'static,
        U: 'static,
    {
        self.then(move |value| Ok::<U, AsyncError>(f(value)))
    }

    /// Observe the fulfilled value and pass it through unchanged.
    pub fn tap<F>(&self, f: F) -> Promise<T>
    where
        F: FnOnce(&T) + 'static,
    {
        self.map(move |value| {
            f(&value);
            value
        })
    }

    /// Turn a rejection (or cancellation) back into a fulfillment.
    pub fn recover<C, F>(&self, handler: F) -> Promise<T>
    where
        F: FnOnce(AsyncError) -> C + 'static,
        C: Chain<Output = T>,
    {
        if self.is_pending() {
            let parent = self.clone();
            return Promise::from_fn(move || match parent.run() {
                Ok(value) => Ok(value),
                Err(err) => handler(err).settle(),
            });
        }
        match self.outcome() {
            Ok(value) => Promise::resolve(value),
            Err(err) => Promise::from_outcome(handler(err).settle()),
        }
    }

    /// `recover` with a plain fallback value.
    pub fn recover_with<F>(&self, handler: F) -> Promise<T>
    where
        F: FnOnce(AsyncError) -> T + 'static,
    {
        self.recover(move |err| Ok::<T, AsyncError>(handler(err)))
    }

    /// A promise that drives `promise` under a deadline counted from now.
    pub fn with_timeout(promise: &Promise<T>, timeout: Duration) -> Promise<T> {
        let inner = promise.clone();
        Promise::from_fn(move || inner.run()).timeout(timeout)
    }
}

pub(crate) fn invoke_handler(kind: &'static str, handler: impl FnOnce()) {
    if let Err(payload) = panic::catch_unwind(AssertUnwindSafe(handler)) {
        tracing::warn!(
            handler = kind,
            panic = %panic_message(&*payload),
            "Promise handler panicked"
        );
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
