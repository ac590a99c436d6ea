//! Connection refcount properties
//!
//! A shadow model tracks how many live subscriptions each destination has.
//! After every step the transport must hold a connection exactly when the
//! model says at least one live subscription exists, and every connect must
//! be paired with at most one disconnect.

use proptest::prelude::*;
use reactive_messaging::{Destination, Multiplexer, OverflowPolicy, Subscription};
use std::sync::{Arc, Barrier};
use std::thread;
use test_utils::InMemoryTransport;

const DESTINATIONS: usize = 3;

#[derive(Debug, Clone)]
enum Op {
    Subscribe(usize),
    Unsubscribe { destination: usize, pick: usize },
    LoseConnection(usize),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0..DESTINATIONS).prop_map(Op::Subscribe),
        4 => (0..DESTINATIONS, any::<usize>())
            .prop_map(|(destination, pick)| Op::Unsubscribe { destination, pick }),
        1 => (0..DESTINATIONS).prop_map(Op::LoseConnection),
    ]
}

/// Shadow of the multiplexer's per-destination bookkeeping.
struct Model {
    live: Vec<Vec<Subscription>>,
    orphaned: Vec<Subscription>,
    expected_connects: Vec<usize>,
}

impl Model {
    fn new() -> Self {
        Self {
            live: (0..DESTINATIONS).map(|_| Vec::new()).collect(),
            orphaned: Vec::new(),
            expected_connects: vec![0; DESTINATIONS],
        }
    }
}

fn destination(index: usize) -> Destination {
    Destination::new(format!("prop-{}", index))
}

proptest! {
    #[test]
    fn prop_connected_iff_live_subscriptions(ops in prop::collection::vec(op(), 1..64)) {
        let transport = Arc::new(InMemoryTransport::new());
        let multiplexer = Multiplexer::with_transport(transport.clone());
        let mut model = Model::new();

        for op in ops {
            match op {
                Op::Subscribe(d) => {
                    if model.live[d].is_empty() {
                        model.expected_connects[d] += 1;
                    }
                    model.live[d].push(multiplexer.subscribe(destination(d), OverflowPolicy::Unbounded));
                }
                Op::Unsubscribe { destination: d, pick } => {
                    if !model.live[d].is_empty() {
                        let index = pick % model.live[d].len();
                        let subscription = model.live[d].swap_remove(index);
                        subscription.unsubscribe();
                        // A second release must not count twice.
                        subscription.unsubscribe();
                    }
                }
                Op::LoseConnection(d) => {
                    let lost = transport.lose_connection(destination(d), "injected");
                    prop_assert_eq!(lost, !model.live[d].is_empty());
                    let orphaned: Vec<Subscription> = model.live[d].drain(..).collect();
                    model.orphaned.extend(orphaned);
                }
            }

            for d in 0..DESTINATIONS {
                let live = model.live[d].len();
                prop_assert_eq!(transport.is_connected(destination(d)), live > 0);
                prop_assert_eq!(multiplexer.is_connected(&destination(d)), live > 0);
                prop_assert_eq!(multiplexer.refcount(&destination(d)), live);
            }
        }

        // Releasing subscriptions of a lost connection never touches the transport.
        let disconnects_before: Vec<usize> =
            (0..DESTINATIONS).map(|d| transport.disconnect_count(destination(d))).collect();
        model.orphaned.clear();
        for d in 0..DESTINATIONS {
            prop_assert_eq!(transport.disconnect_count(destination(d)), disconnects_before[d]);
        }

        model.live.iter_mut().for_each(Vec::clear);
        for d in 0..DESTINATIONS {
            prop_assert_eq!(transport.connect_count(destination(d)), model.expected_connects[d]);
            prop_assert_eq!(transport.disconnect_count(destination(d)), model.expected_connects[d]);
            prop_assert!(!transport.is_connected(destination(d)));
        }
        prop_assert!(transport.violations().is_empty(), "{:?}", transport.violations());
        prop_assert_eq!(multiplexer.stats().active_destinations, 0);
    }
}

fn churn(multiplexer: &Multiplexer, threads: usize, rounds: usize) {
    let barrier = Arc::new(Barrier::new(threads));
    let handles: Vec<_> = (0..threads)
        .map(|_| {
            let multiplexer = multiplexer.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                for _ in 0..rounds {
                    let subscription = multiplexer.subscribe("contended", OverflowPolicy::LatestOnly);
                    thread::yield_now();
                    drop(subscription);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
}

#[test]
fn test_concurrent_subscribe_and_release_pairs_connects() {
    let transport = Arc::new(InMemoryTransport::new());
    let multiplexer = Multiplexer::with_transport(transport.clone());

    churn(&multiplexer, 8, 200);

    assert!(!transport.is_connected("contended"));
    assert_eq!(
        transport.connect_count("contended"),
        transport.disconnect_count("contended")
    );
    assert!(transport.connect_count("contended") >= 1);
    assert!(transport.violations().is_empty(), "{:?}", transport.violations());
    assert_eq!(multiplexer.refcount(&Destination::new("contended")), 0);
}

#[test]
fn test_held_subscription_keeps_single_connection() {
    let transport = Arc::new(InMemoryTransport::new());
    let multiplexer = Multiplexer::with_transport(transport.clone());
    let holder = multiplexer.subscribe("contended", OverflowPolicy::Unbounded);

    churn(&multiplexer, 8, 200);

    assert!(transport.is_connected("contended"));
    assert_eq!(transport.connect_count("contended"), 1);
    assert_eq!(transport.disconnect_count("contended"), 0);
    assert_eq!(multiplexer.refcount(&Destination::new("contended")), 1);

    drop(holder);
    assert_eq!(transport.disconnect_count("contended"), 1);
    assert!(transport.violations().is_empty(), "{:?}", transport.violations());
}
