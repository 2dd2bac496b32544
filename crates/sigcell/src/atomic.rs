#![forbid(unsafe_code)]

//! Lock-free read/write signal.
//!
//! # Design
//!
//! [`AtomicMutable<T>`] keeps its value in an `ArcSwap<T>`. Readers load the
//! current `Arc<T>` without locking and always see a complete value.
//! [`update`](AtomicMutable::update) is an optimistic retry loop:
//!
//! 1. load the current `Arc<T>`,
//! 2. compute `f(&current)`,
//! 3. `compare_and_swap` the result in only if the cell still holds the
//!    same `Arc`,
//! 4. otherwise back off and start again from the freshly loaded value.
//!
//! Comparison is by pointer identity of the loaded `Arc`, which is held for
//! the whole attempt, so an intervening write of an equal value is still
//! detected.
//!
//! # Failure Modes
//!
//! - **Contention**: `f` runs once per attempt. It must be pure; side effects
//!   may be observed several times.
//! - **Panicking `f`**: the panic unwinds to the caller, nothing is installed
//!   and no notification is sent.
//! - **Starvation**: retries are unbounded. [`Backoff`] spins, then yields.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread;

use arc_swap::ArcSwap;

use crate::error::{Result, SignalError};
use crate::registry::{AsDependent, DependencyRegistry, SignalId, Subscription};
use crate::signal::{Signal, SignalMut};

/// Spin steps before the backoff starts yielding the thread.
const SPIN_LIMIT: u32 = 6;
/// Cap on the backoff exponent.
const YIELD_LIMIT: u32 = 10;

/// Exponential backoff for the retry loop.
#[derive(Debug, Default)]
pub(crate) struct Backoff {
    step: u32,
}

impl Backoff {
    pub(crate) fn snooze(&mut self) {
        if self.step <= SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                std::hint::spin_loop();
            }
        } else {
            thread::yield_now();
        }
        if self.step <= YIELD_LIMIT {
            self.step += 1;
        }
    }

    pub(crate) fn is_yielding(&self) -> bool {
        self.step > SPIN_LIMIT
    }
}

struct AtomicInner<T> {
    id: SignalId,
    cell: ArcSwap<T>,
    version: AtomicU64,
    registry: DependencyRegistry<T>,
    disposed: AtomicBool,
}

/// A read/write signal safe for any number of concurrent readers and writers.
///
/// Cloning creates another handle to the same cell and registry.
pub struct AtomicMutable<T> {
    inner: Arc<AtomicInner<T>>,
}

impl<T> Clone for AtomicMutable<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for AtomicMutable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomicMutable")
            .field("id", &self.inner.id)
            .field("value", &**self.inner.cell.load())
            .field("version", &self.inner.version.load(Ordering::Acquire))
            .field("disposed", &self.inner.disposed.load(Ordering::Acquire))
            .finish()
    }
}

impl<T: Clone + Send + Sync + 'static> AtomicMutable<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        let id = SignalId::next();
        Self {
            inner: Arc::new(AtomicInner {
                id,
                cell: ArcSwap::from_pointee(value),
                version: AtomicU64::new(0),
                registry: DependencyRegistry::new(id),
                disposed: AtomicBool::new(false),
            }),
        }
    }

    /// Snapshot of the current value without cloning `T`.
    #[must_use]
    pub fn load_full(&self) -> Arc<T> {
        self.inner.cell.load_full()
    }

    /// Unconditionally install `value`, then notify once.
    ///
    /// # Errors
    ///
    /// [`SignalError::Disposed`] after [`dispose`](Self::dispose).
    pub fn set(&self, value: T) -> Result<()> {
        self.ensure_live()?;
        self.inner.cell.swap(Arc::new(value));
        self.publish();
        Ok(())
    }

    /// Install `f(current)` with a compare-and-swap retry loop and return the
    /// installed value.
    ///
    /// `f` must be a pure function of its input: under contention it is
    /// called again with the freshly observed value. Dependents are notified
    /// exactly once, after the successful swap.
    ///
    /// # Errors
    ///
    /// [`SignalError::Disposed`] after [`dispose`](Self::dispose).
    pub fn update(&self, f: impl Fn(&T) -> T) -> Result<T> {
        self.ensure_live()?;
        let mut backoff = Backoff::default();
        let mut attempts = 1u32;
        let installed = loop {
            let current = self.inner.cell.load_full();
            let next = Arc::new(f(&current));
            let previous = self.inner.cell.compare_and_swap(&current, Arc::clone(&next));
            if Arc::ptr_eq(&current, &previous) {
                break next;
            }
            attempts += 1;
            backoff.snooze();
        };
        if attempts > 1 {
            tracing::trace!(
                message = "atomic.retry",
                signal = %self.inner.id,
                attempts,
                yielded = backoff.is_yielding()
            );
        }
        self.publish();
        Ok(T::clone(&installed))
    }

    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.inner.registry.close();
        tracing::debug!(message = "atomic.dispose", signal = %self.inner.id);
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.inner.disposed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn dependent_count(&self) -> usize {
        self.inner.registry.dependent_count()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.inner.registry.subscriber_count()
    }

    fn ensure_live(&self) -> Result<()> {
        if self.is_disposed() {
            return Err(SignalError::Disposed { id: self.inner.id });
        }
        Ok(())
    }

    fn publish(&self) {
        self.inner.version.fetch_add(1, Ordering::AcqRel);
        let current = self.inner.cell.load_full();
        self.inner.registry.mark_dirty(&current);
    }
}

impl<T: Clone + Send + Sync + 'static> Signal for AtomicMutable<T> {
    type Value = T;

    fn id(&self) -> SignalId {
        self.inner.id
    }

    fn value(&self) -> T {
        T::clone(&self.inner.cell.load())
    }

    fn version(&self) -> u64 {
        self.inner.version.load(Ordering::Acquire)
    }

    fn subscribe_boxed(&self, observer: Box<dyn Fn(&T) + Send + Sync>) -> Subscription {
        self.inner.registry.subscribe(observer)
    }

    fn track(&self, dependent: &dyn AsDependent) {
        self.inner.registry.add(dependent);
    }

    fn untrack(&self, dependent: &dyn AsDependent) {
        self.inner.registry.remove(dependent);
    }

    fn has_dependencies(&self) -> bool {
        self.inner.registry.has_dependencies()
    }
}

impl<T: Clone + Send + Sync + 'static> SignalMut for AtomicMutable<T> {
    type Error = SignalError;

    fn set(&self, value: T) -> Result<()> {
        AtomicMutable::set(self, value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::DirtyFlag;
    use std::panic::{AssertUnwindSafe, catch_unwind};
    use std::sync::Barrier;
    use std::sync::atomic::AtomicUsize;
    use tracing_test::traced_test;

    #[test]
    fn set_and_update() {
        let a = AtomicMutable::new(10);
        a.set(20).unwrap();
        assert_eq!(a.value(), 20);
        assert_eq!(a.update(|v| v * 2).unwrap(), 40);
        assert_eq!(*a.load_full(), 40);
        assert_eq!(a.version(), 2);
    }

    #[test]
    fn two_concurrent_increments() {
        let a = AtomicMutable::new(10);
        let barrier = Arc::new(Barrier::new(2));
        let handles: Vec<_> = (0..2)
            .map(|_| {
                let a = a.clone();
                let b = Arc::clone(&barrier);
                thread::spawn(move || {
                    b.wait();
                    a.update(|x| x + 1).unwrap()
                })
            })
            .collect();
        for h in handles {
            h.join().expect("updater panicked");
        }
        assert_eq!(a.value(), 12);
    }

    #[test]
    fn one_notification_per_update() {
        let a = AtomicMutable::new(0u64);
        let flag = DirtyFlag::new();
        a.track(&flag);

        let threads = 4;
        let per_thread = 250;
        let handles: Vec<_> = (0..threads)
            .map(|_| {
                let a = a.clone();
                thread::spawn(move || {
                    for _ in 0..per_thread {
                        a.update(|x| x + 1).unwrap();
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().expect("updater panicked");
        }

        let total = (threads * per_thread) as u64;
        assert_eq!(a.value(), total);
        assert_eq!(flag.notifications(), total);
        assert_eq!(a.version(), total);
    }

    #[test]
    #[traced_test]
    fn update_fn_may_rerun_under_contention() {
        let a = AtomicMutable::new(0u32);
        let calls = Arc::new(AtomicUsize::new(0));
        let calls_clone = Arc::clone(&calls);
        let a_clone = a.clone();

        // The first attempt races a write from inside `f`, forcing a retry.
        let result = a
            .update(move |x| {
                if calls_clone.fetch_add(1, Ordering::SeqCst) == 0 {
                    a_clone.set(100).unwrap();
                }
                x + 1
            })
            .unwrap();

        assert_eq!(result, 101);
        assert_eq!(a.value(), 101);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(logs_contain("atomic.retry"));
    }

    #[test]
    fn panicking_update_installs_nothing() {
        let a = AtomicMutable::new(7);
        let flag = DirtyFlag::new();
        a.track(&flag);

        let result = catch_unwind(AssertUnwindSafe(|| {
            let _ = a.update(|_| panic!("bad transform"));
        }));
        assert!(result.is_err());
        assert_eq!(a.value(), 7);
        assert_eq!(a.version(), 0);
        assert!(!flag.is_dirty());
    }

    #[test]
    fn subscriber_sees_installed_value() {
        let a = AtomicMutable::new(1);
        let last = Arc::new(AtomicUsize::new(0));
        let last_clone = Arc::clone(&last);
        let _sub = a.subscribe(move |v| last_clone.store(*v, Ordering::SeqCst));

        a.update(|v| v + 41).unwrap();
        assert_eq!(last.load(Ordering::SeqCst), 42);
    }

    #[test]
    fn dispose_rejects_mutation() {
        let a = AtomicMutable::new(1);
        let flag = DirtyFlag::new();
        a.track(&flag);

        a.dispose();
        a.dispose();
        assert!(a.is_disposed());
        assert_eq!(a.dependent_count(), 0);
        assert!(a.set(2).is_err());
        assert!(matches!(a.update(|v| v + 1), Err(SignalError::Disposed { .. })));
        assert_eq!(a.value(), 1);
        assert!(!flag.is_dirty());
    }

    #[test]
    fn backoff_escalates_to_yield() {
        let mut backoff = Backoff::default();
        assert!(!backoff.is_yielding());
        for _ in 0..=SPIN_LIMIT {
            backoff.snooze();
        }
        assert!(backoff.is_yielding());
        for _ in 0..20 {
            backoff.snooze();
        }
        assert!(backoff.is_yielding());
    }

    #[test]
    fn debug_format() {
        let a = AtomicMutable::new(3);
        let dbg = format!("{a:?}");
        assert!(dbg.contains("AtomicMutable"));
        assert!(dbg.contains('3'));
    }
}
