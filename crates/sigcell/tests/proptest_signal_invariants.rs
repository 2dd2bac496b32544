#![forbid(unsafe_code)]

//! Property-based invariant tests for signals and the state manager.
//!
//! 1. A `Mutable` driven from one thread always reads back the last write.
//! 2. Each write produces exactly one notification carrying the new value.
//! 3. Concurrent commutative updates on an `AtomicMutable` lose nothing.
//! 4. A `State` fed messages in order equals the left fold of `update`.
//! 5. A panicking message leaves the `State` model untouched.
//! 6. Dropped dependents are never notified.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use parking_lot::Mutex;
use proptest::prelude::*;
use sigcell::{
    Dependent, DirtyFlag, Signal, SignalId, StateError, create_atomic_mutable, create_mutable,
    create_state,
};

// ── Strategies ──────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
enum Op {
    Set(i64),
    Add(i64),
    Scale(i64),
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        (-1000i64..1000).prop_map(Op::Set),
        (-1000i64..1000).prop_map(Op::Add),
        (-3i64..4).prop_map(Op::Scale),
    ]
}

fn apply(op: &Op, current: i64) -> i64 {
    match *op {
        Op::Set(v) => v,
        Op::Add(d) => current.wrapping_add(d),
        Op::Scale(k) => current.wrapping_mul(k),
    }
}

// ── Helpers ─────────────────────────────────────────────────────────────

struct CountingDependent {
    hits: Arc<AtomicUsize>,
}

impl Dependent for CountingDependent {
    fn update_dirty_flag(&self, _source: SignalId) {
        self.hits.fetch_add(1, Ordering::SeqCst);
    }

    fn has_dependencies(&self) -> bool {
        true
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 1-2. Mutable read-after-write and notification count
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn mutable_reads_back_every_write(initial in -1000i64..1000, ops in proptest::collection::vec(op(), 0..64)) {
        let m = create_mutable(initial);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let _sub = m.subscribe(move |v| seen_clone.lock().push(*v));

        let mut expected = initial;
        let mut history = Vec::new();
        for op in &ops {
            expected = apply(op, expected);
            match op {
                Op::Set(v) => m.set(*v).unwrap(),
                other => {
                    let installed = m.update(|cur| apply(other, *cur)).unwrap();
                    prop_assert_eq!(installed, expected);
                }
            }
            prop_assert_eq!(m.value(), expected);
            history.push(expected);
        }

        prop_assert_eq!(m.version(), ops.len() as u64);
        prop_assert_eq!(&*seen.lock(), &history);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 3. AtomicMutable: no lost updates
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn atomic_concurrent_adds_sum(initial in -1000i64..1000, deltas in proptest::collection::vec(-50i64..50, 1..8)) {
        let a = create_atomic_mutable(initial);
        let handles: Vec<_> = deltas
            .iter()
            .map(|&c| {
                let a = a.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        a.update(|x| x + c).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("updater panicked");
        }

        let expected = initial + deltas.iter().sum::<i64>() * 50;
        prop_assert_eq!(a.value(), expected);
        prop_assert_eq!(a.version(), deltas.len() as u64 * 50);
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 4-5. State equals the fold of its messages; faults are no-ops
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn state_matches_left_fold(initial in -1000i64..1000, ops in proptest::collection::vec(op(), 0..32)) {
        let s = create_state(initial, |msg: Op, model: &i64| apply(&msg, *model)).unwrap();

        let mut expected = initial;
        for op in &ops {
            expected = apply(op, expected);
            prop_assert_eq!(s.update(op.clone()).unwrap(), expected);
        }
        prop_assert_eq!(s.get().unwrap(), expected);
        prop_assert_eq!(s.signal().value(), expected);
        s.dispose();
    }

    #[test]
    fn state_faults_do_not_change_model(msgs in proptest::collection::vec(-5i64..5, 1..24)) {
        let s = create_state(0i64, |msg: i64, model: &i64| {
            if msg == 0 {
                panic!("zero message");
            }
            model + msg
        })
        .unwrap();

        let mut expected = 0i64;
        for msg in msgs {
            match s.update(msg) {
                Ok(model) => {
                    expected += msg;
                    prop_assert_eq!(model, expected);
                }
                Err(StateError::UpdatePanicked { .. }) => prop_assert_eq!(msg, 0),
                Err(other) => prop_assert!(false, "unexpected error {}", other),
            }
        }
        prop_assert_eq!(s.get().unwrap(), expected);
        s.dispose();
    }
}

// ═════════════════════════════════════════════════════════════════════════
// 6. Dropped dependents are never called
// ═════════════════════════════════════════════════════════════════════════

proptest! {
    #[test]
    fn dropped_dependents_never_called(keep in proptest::collection::vec(any::<bool>(), 1..16)) {
        let m = create_mutable(0u32);
        let hits = Arc::new(AtomicUsize::new(0));
        let mut kept = Vec::new();
        for &k in &keep {
            let dep = Arc::new(CountingDependent { hits: Arc::clone(&hits) });
            m.track(&dep);
            if k {
                kept.push(dep);
            }
        }

        m.set(1).unwrap();
        prop_assert_eq!(hits.load(Ordering::SeqCst), kept.len());
        prop_assert_eq!(m.dependent_count(), kept.len());
        prop_assert_eq!(m.has_dependencies(), !kept.is_empty());

        let flag = DirtyFlag::new();
        m.track(&flag);
        drop(kept);
        m.set(2).unwrap();
        prop_assert_eq!(m.dependent_count(), 1);
        prop_assert!(flag.is_dirty());
    }
}
