//! Promise and combinator behavior through the public `fibril_core` API.

use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::thread;
use std::time::Duration;

use fibril_core::capabilities::{Cancelable, RetryPolicy};
use fibril_core::{
    Async, AsyncError, Await, CancellationToken, Deferred, Promise, PromiseState, RunOptions,
};

#[test]
fn settled_promise_never_reruns_its_work() {
    let calls = Rc::new(Cell::new(0));
    let counter = Rc::clone(&calls);
    let promise = Promise::from_fn(move || {
        counter.set(counter.get() + 1);
        Ok::<_, AsyncError>("done")
    });

    assert_eq!(promise.run().unwrap(), "done");
    assert_eq!(promise.run().unwrap(), "done");
    assert_eq!(calls.get(), 1);

    let failing = Promise::<u8>::from_fn(|| Err(AsyncError::msg("boom")));
    let first = failing.run().unwrap_err().to_string();
    let second = failing.run().unwrap_err().to_string();
    assert_eq!(first, second);
}

#[test]
fn chain_runs_in_order_and_flattens_nested_promises() {
    let order = Rc::new(RefCell::new(Vec::new()));
    let (a, b, c) = (Rc::clone(&order), Rc::clone(&order), Rc::clone(&order));

    let result = Promise::from_fn(move || {
        a.borrow_mut().push("work");
        Ok::<_, AsyncError>(1)
    })
    .then(move |v| {
        b.borrow_mut().push("first");
        Promise::resolve(v + 1).then(|v| Promise::resolve(v * 10))
    })
    .map(move |v| {
        c.borrow_mut().push("second");
        v + 5
    })
    .run()
    .unwrap();

    assert_eq!(result, 25);
    assert_eq!(*order.borrow(), vec!["work", "first", "second"]);
}

#[test]
fn catch_and_finally_fire_once_even_when_reattached() {
    let caught = Rc::new(Cell::new(0));
    let settled = Rc::new(Cell::new(0));
    let promise = Promise::<u8>::from_fn(|| Err(AsyncError::msg("nope")));

    let (c1, s1) = (Rc::clone(&caught), Rc::clone(&settled));
    promise
        .catch(move |_| c1.set(c1.get() + 1))
        .finally(move || s1.set(s1.get() + 1));
    let _ = promise.run();
    let _ = promise.run();

    let (c2, s2) = (Rc::clone(&caught), Rc::clone(&settled));
    promise
        .catch(move |_| c2.set(c2.get() + 1))
        .finally(move || s2.set(s2.get() + 1));

    assert_eq!(caught.get(), 1);
    assert_eq!(settled.get(), 1);
}

#[test]
fn recover_adopts_handler_value() {
    let recovered = Promise::<String>::reject(AsyncError::msg("lost"))
        .recover(|err| Ok::<_, AsyncError>(format!("recovered from {err}")))
        .run()
        .unwrap();
    assert_eq!(recovered, "recovered from lost");

    let untouched = Promise::resolve(3).recover_with(|_| 0).run().unwrap();
    assert_eq!(untouched, 3);
}

#[test]
fn all_preserves_order_and_keys() {
    let values = Await::all(vec![
        Promise::resolve("a"),
        Promise::resolve("b"),
        Promise::resolve("c"),
    ])
    .unwrap();
    assert_eq!(values, vec!["a", "b", "c"]);

    let keyed = Await::all_keyed(vec![
        ("x", Promise::resolve(1)),
        ("y", Promise::resolve(2)),
    ])
    .unwrap();
    assert_eq!(keyed, vec![("x", 1), ("y", 2)]);
}

#[test]
fn any_returns_first_fulfilment_or_aggregates() {
    let value = Await::any(&[
        Promise::from_fn(|| Err::<&str, _>(AsyncError::msg("bad"))),
        Promise::from_fn(|| Ok::<_, AsyncError>("x")),
    ])
    .unwrap();
    assert_eq!(value, "x");

    let err = Await::any(&[
        Promise::<u8>::reject(AsyncError::msg("one")),
        Promise::<u8>::reject(AsyncError::msg("two")),
    ])
    .unwrap_err();
    match err {
        AsyncError::AllRejected(errors) => assert_eq!(errors.len(), 2),
        other => panic!("expected AllRejected, got {other:?}"),
    }
}

#[test]
fn race_takes_first_entry_in_evaluation_order() {
    let early = Promise::from_fn(|| Ok::<_, AsyncError>("early"));
    let late = Promise::from_fn(|| {
        thread::sleep(Duration::from_millis(200));
        Ok::<_, AsyncError>("late")
    });
    assert_eq!(Await::race(&[early, late.clone()]).unwrap(), "early");
    assert!(late.is_pending());
}

#[test]
fn all_settled_reports_every_outcome() {
    let outcomes = Await::all_settled(vec![
        Promise::resolve(1),
        Promise::reject(AsyncError::msg("broken")),
    ]);
    assert_eq!(outcomes[0].status(), "fulfilled");
    assert_eq!(outcomes[0].value(), Some(&1));
    assert_eq!(outcomes[1].status(), "rejected");
    assert_eq!(outcomes[1].reason().unwrap().to_string(), "broken");
}

#[test]
fn slow_work_past_timeout_is_cancelled() {
    let promise = Promise::from_fn(|| {
        thread::sleep(Duration::from_millis(200));
        Ok::<_, AsyncError>(1)
    })
    .timeout(Duration::from_millis(50));

    let err = promise.run().unwrap_err();
    assert!(err.is_timeout());
    assert!(promise.is_cancelled());
    assert_eq!(promise.state(), PromiseState::Cancelled);
}

#[test]
fn until_polls_condition() {
    let mut calls = 0;
    let value = Await::until_within(
        || {
            calls += 1;
            (calls == 3).then_some("ready")
        },
        Duration::from_millis(200),
        Duration::from_millis(10),
    )
    .unwrap();
    assert_eq!(value, "ready");

    let err = Await::until_within(
        || None::<()>,
        Duration::from_millis(50),
        Duration::from_millis(10),
    )
    .unwrap_err();
    assert!(matches!(err, AsyncError::ConditionTimeout { ms: 50 }));
}

#[test]
fn cancellation_token_stops_work_at_checkpoint() {
    let token = CancellationToken::new();
    let inner = token.clone();
    let promise = Async::run_with(
        move || {
            inner.cancel();
            Async::checkpoint(&inner, "stopped midway")?;
            Ok::<_, AsyncError>(1)
        },
        RunOptions::default().token(token.clone()),
    );

    let err = promise.run().unwrap_err();
    assert!(err.is_cancellation());
    assert!(token.is_cancelled());
}

#[test]
fn deferred_settles_from_outside() {
    let deferred = Deferred::new();
    let doubled = deferred.promise().map(|v: Option<u32>| v.map(|v| v * 2));
    assert!(deferred.resolve(21));
    assert!(!deferred.reject(AsyncError::msg("too late")));
    assert_eq!(doubled.run().unwrap(), Some(42));

    let unresolved = Deferred::<u8>::new();
    assert_eq!(unresolved.promise().run().unwrap(), None);
}

#[test]
fn retry_policy_and_cancelable_compose() {
    let attempts = Rc::new(Cell::new(0));
    let counter = Rc::clone(&attempts);
    let promise = RetryPolicy::new(2).promise(move || {
        counter.set(counter.get() + 1);
        if counter.get() < 3 {
            Promise::reject(AsyncError::msg("flaky"))
        } else {
            Promise::resolve("ok")
        }
    });
    assert_eq!(promise.run().unwrap(), "ok");
    assert_eq!(attempts.get(), 3);

    let pending = Promise::from_fn(|| Ok::<_, AsyncError>(()));
    assert!(pending.cancel_if(|| true));
    assert!(pending.is_cancelled());
    assert!(!pending.can_cancel());
}
