//! Cooperative promises for fibril.
//!
//! Everything here runs on the calling thread. A [`Promise`] wraps a unit of work
//! that executes when the promise is first driven; [`Async`] adds cancellation
//! checkpoints, [`Await`] composes promises, and [`Deferred`] settles a promise from
//! outside. Suspension happens only where work calls [`Async::checkpoint`] or blocks
//! in [`Await::until`] / [`Await::delay`].

pub mod capabilities;
mod cancellation;
mod combinators;
mod deferred;
mod error;
mod executor;
mod promise;

pub use cancellation::CancellationToken;
pub use combinators::{Await, DEFAULT_UNTIL_INTERVAL, DEFAULT_UNTIL_TIMEOUT, Settlement};
pub use deferred::Deferred;
pub use error::{AsyncError, CancelStage};
pub use executor::{Async, RunOptions};
pub use fibril_types::PromiseState;
pub use promise::{Chain, Promise};
