// Copyright 2025 Reflow project contributors (see CONTRIBUTORS.md).
// Licensed under the Apache License, Version 2.0 (see LICENSE).
use std::sync::atomic::{self, AtomicBool, AtomicI64, AtomicUsize};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

use crate::carrier::Carrier;
use crate::{
    connect_chain, make_async_transformer, make_cached_transformer, make_listener,
    make_transformer, make_transformer_with, AsyncContext, AsyncMode, CachedTerminal, DataState,
    Descriptor, Error, Manager, Node, PropagateMode, ProgressCheck, Provider, Trigger,
};

macro_rules! assert_atomic_usize_eq {
    ($actual: expr, $expected: expr) => {{
        assert_eq!($actual.load(atomic::Ordering::SeqCst), $expected);
    }};
}

///
/// Drive the manager until the condition holds or the timeout elapses. Returns whether the
/// condition was observed.
///
fn pump_until(manager: &Manager, timeout: Duration, condition: impl Fn() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() > deadline {
            return false;
        }
        manager.update();
        thread::sleep(Duration::from_millis(2));
    }
}

#[test]
fn carrier_take_and_peek() {
    let mut owned: Carrier<String> = Carrier::owned("payload".to_string());
    assert!(!owned.is_empty());
    assert_eq!(owned.peek().unwrap(), "payload");
    assert!(!owned.is_empty());
    assert_eq!(owned.take().unwrap(), "payload");
    assert!(owned.is_empty());
    assert_eq!(owned.take(), Err(Error::NoData));

    let mut shared: Carrier<String> = Carrier::shared(Arc::new("payload".to_string()));
    assert_eq!(shared.take().unwrap(), "payload");
    // A shared carrier survives being taken from.
    assert!(!shared.is_empty());
    assert_eq!(shared.take().unwrap(), "payload");
}

#[test]
fn eager_propagation() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i64>::cached(PropagateMode::Eager));

    let received = Arc::new(AtomicI64::new(0));
    let received2 = received.clone();
    let listener = manager.add_node(make_listener(move |v: &i64| {
        received2.store(*v, atomic::Ordering::SeqCst);
    }));

    provider.connect_successor(&listener).unwrap();

    provider.update_value(42);
    assert_eq!(received.load(atomic::Ordering::SeqCst), 42);

    provider.update_value(100);
    assert_eq!(received.load(atomic::Ordering::SeqCst), 100);
}

#[test]
fn connect_checks_type_identity() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let ok = manager.add_node(make_listener(|_: &i32| {}));
    assert_eq!(provider.connect_successor(&ok), Ok(()));

    let f32_listener = manager.add_node(make_listener(|_: &f32| {}));
    assert_eq!(
        provider.connect_successor(&f32_listener),
        Err(Error::InvalidType)
    );

    // Strict identity: no widening between integer types.
    let i64_listener = manager.add_node(make_listener(|_: &i64| {}));
    assert_eq!(
        provider.connect_successor(&i64_listener),
        Err(Error::InvalidType)
    );
}

#[test]
fn connect_rejects_rings() {
    let manager = Manager::new();
    let t1 = manager.add_node(make_transformer(PropagateMode::Eager, |v: i32| v));
    let t2 = manager.add_node(make_transformer(PropagateMode::Eager, |v: i32| v));
    let t3 = manager.add_node(make_transformer(PropagateMode::Eager, |v: i32| v));

    assert_eq!(t1.connect_successor(&t2), Ok(()));
    assert_eq!(t2.connect_successor(&t3), Ok(()));
    assert_eq!(t3.connect_successor(&t1), Err(Error::RingDetected));

    // Self edges are rings too.
    assert_eq!(t1.connect_successor(&t1), Err(Error::RingDetected));

    // The failed attempts left the graph unchanged: the slot on t1 is still free, so retrying
    // reports the ring again rather than a type mismatch against an occupied slot.
    assert_eq!(t3.connect_successor(&t1), Err(Error::RingDetected));
}

#[test]
fn connection_retains_successor() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));
    let terminal = manager.add_node(CachedTerminal::<i32>::new(PropagateMode::Eager));

    // One handle here, one in the manager registry.
    assert_eq!(provider.ref_count(), 2);
    assert_eq!(terminal.ref_count(), 2);

    provider.connect_successor(&terminal).unwrap();
    // The parent side of the edge owns the child; nothing owns the parent for the child's sake.
    assert_eq!(provider.ref_count(), 2);
    assert_eq!(terminal.ref_count(), 3);

    manager.erase_node(&terminal);
    manager.update();
    assert_eq!(terminal.ref_count(), 2);

    manager.erase_node(&provider);
    manager.update();
    assert_eq!(provider.ref_count(), 1);

    drop(provider);
    // With the last parent gone, only our handle keeps the terminal alive.
    assert_eq!(terminal.ref_count(), 1);
}

struct DropFlag {
    dropped: Arc<AtomicBool>,
}

impl Drop for DropFlag {
    fn drop(&mut self) {
        self.dropped.store(true, atomic::Ordering::SeqCst);
    }
}

#[test]
fn parents_keep_children_alive() {
    let dropped = Arc::new(AtomicBool::new(false));
    let provider = Provider::<i32>::cached(PropagateMode::Eager);

    {
        let guard = DropFlag {
            dropped: dropped.clone(),
        };
        let listener = make_listener(move |_: &i32| {
            let _ = &guard;
        });
        provider.connect_successor(&listener).unwrap();
        // The user handle goes out of scope here; the edge keeps the listener alive.
    }
    assert!(!dropped.load(atomic::Ordering::SeqCst));

    // Destroying the root cascades downward.
    drop(provider);
    assert!(dropped.load(atomic::Ordering::SeqCst));
}

#[test]
fn handle_reset_releases_and_adopts() {
    let first_dropped = Arc::new(AtomicBool::new(false));
    let second_dropped = Arc::new(AtomicBool::new(false));

    let guard1 = DropFlag {
        dropped: first_dropped.clone(),
    };
    let first = make_listener(move |_: &i32| {
        let _ = &guard1;
    });
    let guard2 = DropFlag {
        dropped: second_dropped.clone(),
    };
    let second = make_listener(move |_: &i32| {
        let _ = &guard2;
    });

    let mut handle = first.as_dyn();
    drop(first);
    assert!(!first_dropped.load(atomic::Ordering::SeqCst));

    // One operation: the released node is destroyed with its last reference while the new one
    // is adopted.
    handle.reset(second.as_dyn());
    assert!(first_dropped.load(atomic::Ordering::SeqCst));
    assert!(!second_dropped.load(atomic::Ordering::SeqCst));
    assert!(handle == second);
    assert_eq!(second.ref_count(), 2);
}

struct CloneCounter {
    value: i32,
    clones: Arc<AtomicUsize>,
}

impl Clone for CloneCounter {
    fn clone(&self) -> CloneCounter {
        self.clones.fetch_add(1, atomic::Ordering::SeqCst);
        CloneCounter {
            value: self.value,
            clones: self.clones.clone(),
        }
    }
}

#[test]
fn fan_out_moves_to_the_final_consumer() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<CloneCounter>::general(PropagateMode::Eager));
    let transform = manager.add_node(make_transformer(
        PropagateMode::Eager,
        |v: CloneCounter| v,
    ));
    let t1 = manager.add_node(CachedTerminal::<CloneCounter>::new(PropagateMode::Eager));
    let t2 = manager.add_node(CachedTerminal::<CloneCounter>::new(PropagateMode::Eager));
    let t3 = manager.add_node(CachedTerminal::<CloneCounter>::new(PropagateMode::Eager));

    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&t1).unwrap();
    transform.connect_successor(&t2).unwrap();
    transform.connect_successor(&t3).unwrap();

    let clones = Arc::new(AtomicUsize::new(0));
    provider.update_value(CloneCounter {
        value: 7,
        clones: clones.clone(),
    });

    // Three consumers: the first two receive copies, the final one receives the move.
    assert_atomic_usize_eq!(clones, 2);
    assert_eq!(t1.request_cache().unwrap().value, 7);
    assert_eq!(t3.request_cache().unwrap().value, 7);
}

#[test]
fn single_consumer_chain_moves_through_the_transformer() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<CloneCounter>::cached(PropagateMode::Eager));
    let transform = manager.add_node(make_transformer(
        PropagateMode::Eager,
        |v: CloneCounter| v,
    ));

    let received = Arc::new(AtomicI64::new(0));
    let received2 = received.clone();
    let listener = manager.add_node(make_listener(move |v: &CloneCounter| {
        received2.store(v.value as i64, atomic::Ordering::SeqCst);
    }));

    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&listener).unwrap();

    let clones = Arc::new(AtomicUsize::new(0));
    provider.update_value(CloneCounter {
        value: 9,
        clones: clones.clone(),
    });

    assert_eq!(received.load(atomic::Ordering::SeqCst), 9);
    // The retained provider cache contributes the single copy; the transformer hop and the
    // final delivery to the listener are moves.
    assert_atomic_usize_eq!(clones, 1);
}

#[test]
fn lazy_chain_is_inert_until_pulled() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let computations = Arc::new(AtomicUsize::new(0));
    let computations2 = computations.clone();
    let transform = manager.add_node(make_transformer(PropagateMode::Lazy, move |v: i32| {
        computations2.fetch_add(1, atomic::Ordering::SeqCst);
        v * 2
    }));
    let terminal = manager.add_node(CachedTerminal::<i32>::new(PropagateMode::Lazy));

    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&terminal).unwrap();

    provider.update_value(10);
    assert_atomic_usize_eq!(computations, 0);
    assert_eq!(terminal.data_state(), DataState::Expired);

    assert_eq!(terminal.request_cache().unwrap(), 20);
    assert_atomic_usize_eq!(computations, 1);
    assert_eq!(terminal.data_state(), DataState::Fresh);

    // A fully cached terminal does not recompute without an upstream change.
    assert_eq!(terminal.request_cache().unwrap(), 20);
    assert_atomic_usize_eq!(computations, 1);

    provider.update_value(20);
    assert_atomic_usize_eq!(computations, 1);
    assert_eq!(terminal.data_state(), DataState::Expired);

    assert_eq!(terminal.request_cache().unwrap(), 40);
    assert_atomic_usize_eq!(computations, 2);
}

#[test]
fn cached_output_serves_multiple_pulls() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let computations = Arc::new(AtomicUsize::new(0));
    let computations2 = computations.clone();
    let transform = manager.add_node(make_transformer_with(
        PropagateMode::Lazy,
        &[Descriptor::default()],
        Descriptor {
            cache: true,
            quiet: false,
        },
        move |v: i32| {
            computations2.fetch_add(1, atomic::Ordering::SeqCst);
            v * 2
        },
    ));
    let t1 = manager.add_node(CachedTerminal::<i32>::new(PropagateMode::Lazy));
    let t2 = manager.add_node(CachedTerminal::<i32>::new(PropagateMode::Lazy));

    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&t1).unwrap();
    transform.connect_successor(&t2).unwrap();

    provider.update_value(10);
    assert_atomic_usize_eq!(computations, 0);

    assert_eq!(t1.request_cache().unwrap(), 20);
    assert_atomic_usize_eq!(computations, 1);

    // The second terminal is served from the output cache.
    assert_eq!(t2.request_cache().unwrap(), 20);
    assert_atomic_usize_eq!(computations, 1);
}

#[test]
fn argument_cached_transformer_recomputes_each_pull() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let computations = Arc::new(AtomicUsize::new(0));
    let computations2 = computations.clone();
    let transform = manager.add_node(make_cached_transformer(
        PropagateMode::Lazy,
        move |v: i32| {
            computations2.fetch_add(1, atomic::Ordering::SeqCst);
            v * 2
        },
    ));
    let terminal = manager.add_node(CachedTerminal::<i32>::new(PropagateMode::Lazy));
    let terminal2 = manager.add_node(CachedTerminal::<i32>::new(PropagateMode::Lazy));

    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&terminal).unwrap();
    transform.connect_successor(&terminal2).unwrap();

    provider.update_value(10);
    assert_eq!(terminal.request_cache().unwrap(), 20);
    // No output cache: a second pull re-runs the function on the retained arguments.
    assert_eq!(terminal2.request_cache().unwrap(), 20);
    assert_atomic_usize_eq!(computations, 2);
}

#[test]
fn quiet_inputs_do_not_publish() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let received = Arc::new(AtomicUsize::new(0));
    let received2 = received.clone();
    let transform = manager.add_node(make_transformer_with(
        PropagateMode::Eager,
        &[Descriptor {
            cache: true,
            quiet: true,
        }],
        Descriptor::default(),
        |v: i32| v,
    ));
    let listener = manager.add_node(make_listener(move |_: &i32| {
        received2.fetch_add(1, atomic::Ordering::SeqCst);
    }));

    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&listener).unwrap();

    provider.update_value(42);
    assert_atomic_usize_eq!(received, 0);
}

#[test]
fn pulse_coalesces_updates_between_ticks() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Pulse));

    let deliveries = Arc::new(AtomicUsize::new(0));
    let last = Arc::new(AtomicI64::new(0));
    let (deliveries2, last2) = (deliveries.clone(), last.clone());
    let listener = manager.add_node(make_listener(move |v: &i32| {
        deliveries2.fetch_add(1, atomic::Ordering::SeqCst);
        last2.store(*v as i64, atomic::Ordering::SeqCst);
    }));

    provider.connect_successor(&listener).unwrap();

    for v in 1..=5 {
        provider.update_value(v);
    }
    assert_atomic_usize_eq!(deliveries, 0);

    manager.update();
    // Five updates, one delivery, carrying the most recent value.
    assert_atomic_usize_eq!(deliveries, 1);
    assert_eq!(last.load(atomic::Ordering::SeqCst), 5);

    // An idle tick delivers nothing further.
    manager.update();
    assert_atomic_usize_eq!(deliveries, 1);

    provider.update_value(55);
    manager.update();
    assert_atomic_usize_eq!(deliveries, 2);
    assert_eq!(last.load(atomic::Ordering::SeqCst), 55);
}

#[test]
fn pulse_transformer_defers_compute_to_tick() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let computations = Arc::new(AtomicUsize::new(0));
    let computations2 = computations.clone();
    let transform = manager.add_node(make_transformer(PropagateMode::Pulse, move |v: i32| {
        computations2.fetch_add(1, atomic::Ordering::SeqCst);
        v
    }));
    let listener = manager.add_node(make_listener(|_: &i32| {}));

    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&listener).unwrap();

    provider.update_value(1);
    assert_atomic_usize_eq!(computations, 0);

    manager.update();
    assert_atomic_usize_eq!(computations, 1);

    provider.update_value(2);
    assert_atomic_usize_eq!(computations, 1);

    manager.update();
    assert_atomic_usize_eq!(computations, 2);
}

#[test]
fn trigger_disabled_suppresses_execution() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let computations = Arc::new(AtomicUsize::new(0));
    let computations2 = computations.clone();
    let transform = manager.add_node(make_transformer(PropagateMode::Eager, move |v: i32| {
        computations2.fetch_add(1, atomic::Ordering::SeqCst);
        v
    }));
    transform.set_trigger_type(Trigger::Disabled);

    provider.connect_successor(&transform).unwrap();
    provider.update_value(1);

    assert_atomic_usize_eq!(computations, 0);
}

#[test]
fn trigger_on_pulse_fires_exactly_once() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let computations = Arc::new(AtomicUsize::new(0));
    let computations2 = computations.clone();
    let transform = manager.add_node(make_transformer(PropagateMode::Eager, move |v: i32| {
        computations2.fetch_add(1, atomic::Ordering::SeqCst);
        v
    }));
    transform.set_trigger_type(Trigger::OnPulse);

    provider.connect_successor(&transform).unwrap();

    provider.update_value(1);
    assert_atomic_usize_eq!(computations, 1);
    assert_eq!(transform.get_trigger_type(), Trigger::Disabled);

    provider.update_value(2);
    assert_atomic_usize_eq!(computations, 1);
}

#[test]
fn trigger_as_input_gates_and_fires() {
    let manager = Manager::new();
    let data = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));
    let gate = manager.add_node(Provider::<Trigger>::cached(PropagateMode::Eager));

    let computations = Arc::new(AtomicUsize::new(0));
    let computations2 = computations.clone();
    let transform = manager.add_node(make_cached_transformer(
        PropagateMode::Eager,
        move |v: i32, _t: Trigger| {
            computations2.fetch_add(1, atomic::Ordering::SeqCst);
            v
        },
    ));
    transform.set_trigger_type(Trigger::Disabled);

    data.connect_successor(&transform).unwrap();
    gate.connect_successor(&transform).unwrap();

    gate.update_value(Trigger::Disabled);
    data.update_value(1);
    assert_atomic_usize_eq!(computations, 0);

    // The transition to active recomputes once with the recorded arguments.
    gate.update_value(Trigger::Active);
    assert_eq!(transform.get_trigger_type(), Trigger::Active);
    assert_atomic_usize_eq!(computations, 1);

    data.update_value(2);
    assert_atomic_usize_eq!(computations, 2);
}

#[test]
fn failed_compute_skips_listeners_and_recovers() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<String>::cached(PropagateMode::Eager));

    let parse = manager.add_node(make_transformer(PropagateMode::Eager, |s: String| {
        s.parse::<i32>().expect("input must be numeric")
    }));
    let double = manager.add_node(make_transformer(PropagateMode::Eager, |v: i32| v * 2));

    let deliveries = Arc::new(AtomicUsize::new(0));
    let last = Arc::new(AtomicI64::new(0));
    let (deliveries2, last2) = (deliveries.clone(), last.clone());
    let listener = manager.add_node(make_listener(move |v: &i32| {
        deliveries2.fetch_add(1, atomic::Ordering::SeqCst);
        last2.store(*v as i64, atomic::Ordering::SeqCst);
    }));

    connect_chain(&[
        &provider.as_dyn(),
        &parse.as_dyn(),
        &double.as_dyn(),
        &listener.as_dyn(),
    ])
    .unwrap();

    provider.update_value("123".to_string());
    assert_atomic_usize_eq!(deliveries, 1);
    assert_eq!(last.load(atomic::Ordering::SeqCst), 246);

    // The panic is contained at the parse node: failure flows along the edges and the listener
    // is skipped rather than delivered a sentinel.
    provider.update_value("abc".to_string());
    assert_atomic_usize_eq!(deliveries, 1);
    assert_eq!(parse.get_data_state(), DataState::Failed);

    // A later successful recompute clears the failure.
    provider.update_value("124".to_string());
    assert_atomic_usize_eq!(deliveries, 2);
    assert_eq!(last.load(atomic::Ordering::SeqCst), 248);
    assert_eq!(parse.get_data_state(), DataState::Fresh);
}

#[test]
fn provider_request_returns_cache() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    assert_eq!(provider.request_raw(false), Err(Error::NoData));
    provider.update_value(123);
    assert_eq!(provider.request_raw(false), Ok(123));
}

#[test]
fn async_basic_execution() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let executed = Arc::new(AtomicBool::new(false));
    let executed2 = executed.clone();
    let transform = manager.add_node(make_async_transformer(
        PropagateMode::Eager,
        AsyncMode::Latest,
        move |_: &AsyncContext, v: i32| {
            executed2.store(true, atomic::Ordering::SeqCst);
            v * 2
        },
    ));

    let result = Arc::new(AtomicI64::new(0));
    let result2 = result.clone();
    let listener = manager.add_node(make_listener(move |v: &i32| {
        result2.store(*v as i64, atomic::Ordering::SeqCst);
    }));

    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&listener).unwrap();

    provider.update_value(10);

    assert!(pump_until(&manager, Duration::from_secs(2), || result
        .load(atomic::Ordering::SeqCst)
        == 20));
    assert!(executed.load(atomic::Ordering::SeqCst));
}

#[test]
fn async_trigger_disabled() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    let transform = manager.add_node(make_async_transformer(
        PropagateMode::Eager,
        AsyncMode::Latest,
        move |_: &AsyncContext, v: i32| {
            count2.fetch_add(1, atomic::Ordering::SeqCst);
            v
        },
    ));
    transform.set_trigger_type(Trigger::Disabled);

    let listener = manager.add_node(make_listener(|_: &i32| {}));
    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&listener).unwrap();

    provider.update_value(1);

    for _ in 0..10 {
        manager.update();
        thread::sleep(Duration::from_millis(5));
    }
    assert_atomic_usize_eq!(count, 0);
}

#[test]
fn async_trigger_on_pulse_consumes_to_disabled() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    let transform = manager.add_node(make_async_transformer(
        PropagateMode::Eager,
        AsyncMode::Latest,
        move |_: &AsyncContext, v: i32| {
            count2.fetch_add(1, atomic::Ordering::SeqCst);
            v
        },
    ));
    transform.set_trigger_type(Trigger::OnPulse);

    let listener = manager.add_node(make_listener(|_: &i32| {}));
    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&listener).unwrap();

    provider.update_value(1);
    assert!(pump_until(&manager, Duration::from_secs(1), || count
        .load(atomic::Ordering::SeqCst)
        == 1));
    assert_eq!(transform.get_trigger_type(), Trigger::Disabled);

    provider.update_value(2);
    for _ in 0..10 {
        manager.update();
        thread::sleep(Duration::from_millis(5));
    }
    assert_atomic_usize_eq!(count, 1);
}

#[test]
fn async_pulse_mode_waits_for_tick() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let count = Arc::new(AtomicUsize::new(0));
    let count2 = count.clone();
    let transform = manager.add_node(make_async_transformer(
        PropagateMode::Pulse,
        AsyncMode::Latest,
        move |_: &AsyncContext, v: i32| {
            count2.fetch_add(1, atomic::Ordering::SeqCst);
            v
        },
    ));
    transform.set_trigger_type(Trigger::OnPulse);

    provider.connect_successor(&transform).unwrap();

    provider.update_value(1);
    thread::sleep(Duration::from_millis(20));
    // No tick yet: the gate has not been consumed and nothing ran.
    assert_atomic_usize_eq!(count, 0);
    assert_eq!(transform.get_trigger_type(), Trigger::OnPulse);

    assert!(pump_until(&manager, Duration::from_secs(1), || count
        .load(atomic::Ordering::SeqCst)
        == 1));
    assert_eq!(transform.get_trigger_type(), Trigger::Disabled);
}

#[test]
fn async_latest_flood_delivers_final_value() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let transform = manager.add_node(make_async_transformer(
        PropagateMode::Eager,
        AsyncMode::Latest,
        |_: &AsyncContext, v: i32| {
            thread::sleep(Duration::from_millis(30));
            v * 2
        },
    ));

    let deliveries = Arc::new(AtomicUsize::new(0));
    let last = Arc::new(AtomicI64::new(0));
    let (deliveries2, last2) = (deliveries.clone(), last.clone());
    let listener = manager.add_node(make_listener(move |v: &i32| {
        deliveries2.fetch_add(1, atomic::Ordering::SeqCst);
        last2.store(*v as i64, atomic::Ordering::SeqCst);
    }));

    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&listener).unwrap();

    for v in 1..=10 {
        provider.update_value(v);
    }

    assert!(pump_until(&manager, Duration::from_secs(5), || last
        .load(atomic::Ordering::SeqCst)
        == 20));
    // Intermediate inputs were superseded: strictly fewer results than inputs were published.
    assert!(deliveries.load(atomic::Ordering::SeqCst) < 10);
}

#[test]
fn async_queued_runs_all_in_submission_order() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let transform = manager.add_node(make_async_transformer(
        PropagateMode::Eager,
        AsyncMode::Queued,
        |_: &AsyncContext, v: i32| {
            thread::sleep(Duration::from_millis(5));
            v * 2
        },
    ));

    let results = Arc::new(Mutex::new(Vec::new()));
    let results2 = results.clone();
    let listener = manager.add_node(make_listener(move |v: &i32| {
        results2.lock().push(*v);
    }));

    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&listener).unwrap();

    for v in 1..=5 {
        provider.update_value(v);
    }

    assert!(pump_until(&manager, Duration::from_secs(5), || results
        .lock()
        .len()
        == 5));
    assert_eq!(*results.lock(), vec![2, 4, 6, 8, 10]);
}

#[test]
fn async_single_drops_input_while_running() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let transform = manager.add_node(make_async_transformer(
        PropagateMode::Eager,
        AsyncMode::Single,
        |_: &AsyncContext, v: i32| {
            thread::sleep(Duration::from_millis(30));
            v * 2
        },
    ));

    let results = Arc::new(Mutex::new(Vec::new()));
    let results2 = results.clone();
    let listener = manager.add_node(make_listener(move |v: &i32| {
        results2.lock().push(*v);
    }));

    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&listener).unwrap();

    provider.update_value(1);
    provider.update_value(2);

    assert!(pump_until(&manager, Duration::from_secs(2), || !results
        .lock()
        .is_empty()));
    // Give a superseding task time to surface if one was (incorrectly) launched.
    for _ in 0..20 {
        manager.update();
        thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(*results.lock(), vec![2]);
}

#[test]
fn async_inline_degrades_to_synchronous() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let transform = manager.add_node(make_async_transformer(
        PropagateMode::Eager,
        AsyncMode::Inline,
        |_: &AsyncContext, v: i32| v * 2,
    ));

    let result = Arc::new(AtomicI64::new(0));
    let result2 = result.clone();
    let listener = manager.add_node(make_listener(move |v: &i32| {
        result2.store(*v as i64, atomic::Ordering::SeqCst);
    }));

    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&listener).unwrap();

    provider.update_value(21);
    // No tick required: the computation ran in the caller's thread.
    assert_eq!(result.load(atomic::Ordering::SeqCst), 42);
}

#[test]
fn request_with_wait_blocks_for_the_task() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let transform = manager.add_node(make_async_transformer(
        PropagateMode::Eager,
        AsyncMode::Single,
        |_: &AsyncContext, v: i32| {
            thread::sleep(Duration::from_millis(20));
            v + 1
        },
    ));
    provider.connect_successor(&transform).unwrap();

    provider.update_value(41);
    assert_eq!(transform.request_raw(false), Err(Error::Pending));
    // Blocks until the in-flight task resolves; publication still waits for the next tick.
    assert_eq!(transform.request_raw(true), Ok(42));
}

#[test]
fn cancellation_discards_the_result() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let started = Arc::new(AtomicBool::new(false));
    let started2 = started.clone();
    let transform = manager.add_node(make_async_transformer(
        PropagateMode::Eager,
        AsyncMode::Single,
        move |ctx: &AsyncContext, v: i32| {
            started2.store(true, atomic::Ordering::SeqCst);
            let deadline = Instant::now() + Duration::from_secs(2);
            while !ctx.stop_requested() && Instant::now() < deadline {
                thread::sleep(Duration::from_millis(2));
            }
            v * 2
        },
    ));

    let deliveries = Arc::new(AtomicUsize::new(0));
    let deliveries2 = deliveries.clone();
    let listener = manager.add_node(make_listener(move |_: &i32| {
        deliveries2.fetch_add(1, atomic::Ordering::SeqCst);
    }));

    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&listener).unwrap();

    provider.update_value(1);
    assert!(pump_until(&manager, Duration::from_secs(1), || started
        .load(atomic::Ordering::SeqCst)));

    transform.async_cancel();
    for _ in 0..50 {
        manager.update();
        thread::sleep(Duration::from_millis(2));
    }
    assert_atomic_usize_eq!(deliveries, 0);

    // The node remains usable for subsequent inputs.
    started.store(false, atomic::Ordering::SeqCst);
    provider.update_value(3);
    assert!(pump_until(&manager, Duration::from_secs(1), || started
        .load(atomic::Ordering::SeqCst)));
    transform.async_cancel();
}

#[test]
fn in_flight_task_keeps_node_alive() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let release = Arc::new(AtomicBool::new(false));
    let release2 = release.clone();
    let transform = manager.add_node(make_async_transformer(
        PropagateMode::Eager,
        AsyncMode::Single,
        move |_: &AsyncContext, v: i32| {
            while !release2.load(atomic::Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(2));
            }
            v
        },
    ));

    // One handle here, one in the manager.
    assert_eq!(transform.ref_count(), 2);
    provider.connect_successor(&transform).unwrap();
    assert_eq!(transform.ref_count(), 3);

    // Launching a task adds the task's own strong reference.
    provider.update_value(42);
    assert_eq!(transform.ref_count(), 4);

    release.store(true, atomic::Ordering::SeqCst);
    assert!(pump_until(&manager, Duration::from_secs(2), || {
        transform.ref_count() == 3
    }));
}

#[test]
fn erased_node_survives_until_task_exit() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let dropped = Arc::new(AtomicBool::new(false));
    let started = Arc::new(AtomicBool::new(false));
    let release = Arc::new(AtomicBool::new(false));
    let guard = DropFlag {
        dropped: dropped.clone(),
    };
    let (started2, release2) = (started.clone(), release.clone());
    let transform = manager.add_node(make_async_transformer(
        PropagateMode::Eager,
        AsyncMode::Single,
        move |_: &AsyncContext, v: i32| {
            let _ = &guard;
            started2.store(true, atomic::Ordering::SeqCst);
            while !release2.load(atomic::Ordering::SeqCst) {
                thread::sleep(Duration::from_millis(2));
            }
            v
        },
    ));
    let listener = manager.add_node(make_listener(|_: &i32| {}));

    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&listener).unwrap();

    provider.update_value(1);
    assert!(pump_until(&manager, Duration::from_secs(1), || started
        .load(atomic::Ordering::SeqCst)));

    // Disconnect and erase while the task runs: the task's handle keeps the node alive.
    provider.disconnect_successor(&transform);
    transform.disconnect_successor(&listener);
    manager.erase_node(&transform);
    manager.update();
    drop(transform);
    assert!(!dropped.load(atomic::Ordering::SeqCst));

    release.store(true, atomic::Ordering::SeqCst);
    assert!(pump_until(&manager, Duration::from_secs(2), || dropped
        .load(atomic::Ordering::SeqCst)));
}

#[test]
fn progress_reaches_receivers_on_ticks() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let transform = manager.add_node(make_async_transformer(
        PropagateMode::Eager,
        AsyncMode::Latest,
        |ctx: &AsyncContext, v: i32| {
            for step in 1..=4_u64 {
                ctx.set_progress(step, 4);
                thread::sleep(Duration::from_millis(10));
            }
            ctx.set_progress_done();
            v
        },
    ));

    let observed = Arc::new(Mutex::new(Vec::new()));
    let observed2 = observed.clone();
    let progress_listener = manager.add_node(make_listener(move |p: &ProgressCheck| {
        if p.changed {
            observed2.lock().push((p.current, p.total));
        }
    }));
    transform.add_progress_receiver(&progress_listener);

    let done = Arc::new(AtomicUsize::new(0));
    let done2 = done.clone();
    let listener = manager.add_node(make_listener(move |_: &i32| {
        done2.fetch_add(1, atomic::Ordering::SeqCst);
    }));

    provider.connect_successor(&transform).unwrap();
    transform.connect_successor(&listener).unwrap();

    provider.update_value(7);
    assert!(pump_until(&manager, Duration::from_secs(2), || done
        .load(atomic::Ordering::SeqCst)
        == 1));
    // Drain the final progress event.
    manager.update();

    let observed = observed.lock();
    assert!(!observed.is_empty());
    let &(current, total) = observed.last().unwrap();
    assert_eq!((current, total), (4, 4));
    assert!((ProgressCheck {
        current,
        total,
        changed: true
    })
    .fraction()
        >= 1.0);
}

#[test]
fn posted_actions_from_foreign_threads() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let sum = Arc::new(AtomicI64::new(0));
    let sum2 = sum.clone();
    let listener = manager.add_node(make_listener(move |v: &i32| {
        sum2.fetch_add(*v as i64, atomic::Ordering::SeqCst);
    }));

    provider.connect_successor(&listener).unwrap();

    let num_threads: i64 = 10;
    thread::scope(|scope| {
        for _ in 0..num_threads {
            let manager = &manager;
            let provider = provider.clone();
            scope.spawn(move || {
                manager.push_posted_act(move || {
                    provider.update_value(1);
                });
            });
        }
    });

    assert!(pump_until(&manager, Duration::from_secs(2), || sum
        .load(atomic::Ordering::SeqCst)
        == num_threads));
}

#[test]
fn posted_updates_are_atomic_per_action() {
    let _logger = env_logger::try_init();
    let manager = Manager::new();
    let left = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));
    let right = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    // A pulse join observes both inputs only on ticks; two updates posted in one action must
    // never be witnessed half-applied.
    let torn = Arc::new(AtomicUsize::new(0));
    let torn2 = torn.clone();
    let join = manager.add_node(make_cached_transformer(
        PropagateMode::Pulse,
        move |a: i32, b: i32| {
            if a != b {
                torn2.fetch_add(1, atomic::Ordering::SeqCst);
            }
            a + b
        },
    ));
    let listener = manager.add_node(make_listener(|_: &i32| {}));

    left.connect_successor(&join).unwrap();
    right.connect_successor(&join).unwrap();
    join.connect_successor(&listener).unwrap();

    let observed = Arc::new(AtomicUsize::new(0));
    thread::scope(|scope| {
        let manager = &manager;
        let (left, right) = (left.clone(), right.clone());
        let observed2 = observed.clone();
        scope.spawn(move || {
            for v in 0..20 {
                manager.push_posted_act({
                    let (left, right) = (left.clone(), right.clone());
                    move || {
                        left.update_value(v);
                        right.update_value(v);
                    }
                });
                thread::sleep(Duration::from_millis(1));
            }
            observed2.store(1, atomic::Ordering::SeqCst);
        });

        let deadline = Instant::now() + Duration::from_secs(2);
        while observed.load(atomic::Ordering::SeqCst) == 0 && Instant::now() < deadline {
            manager.update();
            thread::sleep(Duration::from_millis(1));
        }
    });
    for _ in 0..5 {
        manager.update();
    }

    assert_atomic_usize_eq!(torn, 0);
}

#[test]
fn foreign_thread_updates_via_posted_act() {
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Eager));

    let received = Arc::new(AtomicI64::new(0));
    let received2 = received.clone();
    let listener = manager.add_node(make_listener(move |v: &i32| {
        received2.store(*v as i64, atomic::Ordering::SeqCst);
    }));
    provider.connect_successor(&listener).unwrap();

    thread::scope(|scope| {
        let manager = &manager;
        let provider = provider.clone();
        scope.spawn(move || {
            thread::sleep(Duration::from_millis(20));
            manager.push_posted_act(move || {
                provider.update_value(100);
            });
        });

        assert!(pump_until(manager, Duration::from_secs(2), || received
            .load(atomic::Ordering::SeqCst)
            == 100));
    });
}

#[test]
fn random_updates_pull_consistently() {
    use rand::Rng;

    let _logger = env_logger::try_init();
    let manager = Manager::new();
    let provider = manager.add_node(Provider::<i32>::cached(PropagateMode::Lazy));
    let a = manager.add_node(make_transformer(PropagateMode::Lazy, |v: i32| v + 1));
    let b = manager.add_node(make_transformer(PropagateMode::Lazy, |v: i32| v * 3));
    let terminal = manager.add_node(CachedTerminal::<i32>::new(PropagateMode::Lazy));

    connect_chain(&[
        &provider.as_dyn(),
        &a.as_dyn(),
        &b.as_dyn(),
        &terminal.as_dyn(),
    ])
    .unwrap();

    let mut rng = rand::thread_rng();
    for _ in 0..100 {
        let v: i32 = rng.gen_range(-1000..1000);
        provider.update_value(v);
        // Repeated pulls between updates must agree with the single upstream value.
        assert_eq!(terminal.request_cache().unwrap(), (v + 1) * 3);
        assert_eq!(terminal.request_cache().unwrap(), (v + 1) * 3);
    }
}
