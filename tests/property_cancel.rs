//! Property-based tests for cancellation bookkeeping.
//!
//! Random interleavings of register/deregister, then one cancel. The model
//! is a plain Vec of surviving registration tags; the implementation must
//! drain exactly the survivors, in reverse registration order, and report
//! deregistration found/not-found in agreement with the model.

mod common;

use common::*;
use proptest::prelude::*;
use quell::{CancelSource, Registration};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
enum Op {
    Register,
    Deregister(usize),
}

fn arb_ops() -> impl Strategy<Value = Vec<Op>> {
    proptest::collection::vec(
        prop_oneof![
            3 => Just(Op::Register),
            2 => any::<usize>().prop_map(Op::Deregister),
        ],
        0..64,
    )
}

proptest! {
    #![proptest_config(ProptestConfig {
        cases: proptest_cases(128),
        ..ProptestConfig::default()
    })]

    #[test]
    fn drain_matches_the_survivor_model(ops in arb_ops()) {
        init_test_logging();
        let source = CancelSource::new();
        let token = source.token();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles: Vec<(usize, Registration)> = Vec::new();
        let mut live: Vec<usize> = Vec::new();
        let mut next_tag = 0_usize;

        for op in ops {
            match op {
                Op::Register => {
                    let tag = next_tag;
                    next_tag += 1;
                    let sink = Arc::clone(&order);
                    let registration = token.register(move || {
                        sink.lock().expect("order poisoned").push(tag);
                    });
                    handles.push((tag, registration));
                    live.push(tag);
                }
                Op::Deregister(raw) => {
                    if handles.is_empty() {
                        continue;
                    }
                    let index = raw % handles.len();
                    let (tag, registration) = &mut handles[index];
                    let removed = registration.deregister();
                    let was_live = live.contains(tag);
                    prop_assert_eq!(
                        removed, was_live,
                        "deregister must agree with the model for tag {}", tag
                    );
                    let tag = *tag;
                    live.retain(|&t| t != tag);
                }
            }
        }

        source.cancel().expect("no callback panics in this model");

        let mut expected = live;
        expected.reverse();
        let drained = order.lock().expect("order poisoned");
        prop_assert_eq!(&*drained, &expected);
    }

    // Registering on a cancelled source is always synchronous, regardless of
    // what happened before cancellation.
    #[test]
    fn late_registrations_always_run_synchronously(survivors in 0_usize..16) {
        init_test_logging();
        let source = CancelSource::new();
        for _ in 0..survivors {
            source.token().register(|| {});
        }
        source.cancel().expect("cancel failed");

        let ran = Arc::new(Mutex::new(false));
        let seen = Arc::clone(&ran);
        let mut registration = source.token().register(move || {
            *seen.lock().expect("flag poisoned") = true;
        });
        prop_assert!(*ran.lock().expect("flag poisoned"));
        prop_assert!(!registration.deregister());
    }
}
