#![forbid(unsafe_code)]

//! Per-signal dependency registry with weak dependents and push subscribers.
//!
//! # Design
//!
//! Every signal owns one [`DependencyRegistry<T>`]. The registry keeps two
//! lists behind a single `parking_lot::Mutex`:
//!
//! - **Dependents** stored as `Weak<dyn Dependent>`. Being tracked never keeps
//!   a dependent alive; a dependent whose last strong handle was dropped is
//!   pruned the next time the registry is touched.
//! - **Subscribers** stored as shared callbacks keyed by a registry-local
//!   counter. Each [`Subscription`] removes exactly its own entry.
//!
//! [`mark_dirty`](DependencyRegistry::mark_dirty) copies the live entries out
//! of the lock and then invokes them, so callbacks may freely re-enter the
//! registry (track, untrack, subscribe, or mutate another signal).
//!
//! # Invariants
//!
//! 1. A dependent is registered at most once (by pointer identity).
//! 2. Dependents and subscribers are notified in insertion order.
//! 3. An expired dependent is never called back.
//! 4. A closed registry accepts no new entries and notifies nobody.
//! 5. A panicking callback does not stop delivery to the entries after it.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::error::panic_message;

static NEXT_SIGNAL_ID: AtomicU64 = AtomicU64::new(1);

/// Process-unique identity of a signal, passed to dependents as the
/// originating source of a dirty notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SignalId(u64);

impl SignalId {
    /// Allocate a fresh identity.
    #[must_use]
    pub fn next() -> Self {
        Self(NEXT_SIGNAL_ID.fetch_add(1, Ordering::Relaxed))
    }

    /// Raw numeric value.
    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SignalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An entity that can be marked dirty by the signals it depends on.
///
/// Implementors are registered weakly; the signal never owns them.
pub trait Dependent: Send + Sync {
    /// Called synchronously when `source` changed.
    fn update_dirty_flag(&self, source: SignalId);

    /// Whether this dependent still depends on anything.
    fn has_dependencies(&self) -> bool;
}

/// Conversion into the weak handle a registry stores.
///
/// Implemented for `Arc<D>` of any concrete dependent and for
/// `Arc<dyn Dependent>`, so callers never have to coerce by hand.
pub trait AsDependent {
    fn downgrade_dependent(&self) -> Weak<dyn Dependent>;
}

impl<D: Dependent + 'static> AsDependent for Arc<D> {
    fn downgrade_dependent(&self) -> Weak<dyn Dependent> {
        let weak: Weak<D> = Arc::downgrade(self);
        weak
    }
}

impl AsDependent for Arc<dyn Dependent> {
    fn downgrade_dependent(&self) -> Weak<dyn Dependent> {
        Arc::downgrade(self)
    }
}

type Observer<T> = Arc<dyn Fn(&T) + Send + Sync>;

struct SubscriberEntry<T> {
    key: u64,
    observer: Observer<T>,
}

struct Entries<T> {
    dependents: Vec<Weak<dyn Dependent>>,
    subscribers: Vec<SubscriberEntry<T>>,
    next_key: u64,
    closed: bool,
}

impl<T> Entries<T> {
    /// Drop expired dependents, returning how many were removed.
    fn prune(&mut self) -> usize {
        let before = self.dependents.len();
        self.dependents.retain(|w| w.strong_count() > 0);
        before - self.dependents.len()
    }
}

/// Tracks the dependents and subscribers of one owning signal.
pub struct DependencyRegistry<T> {
    owner: SignalId,
    entries: Arc<Mutex<Entries<T>>>,
}

impl<T> fmt::Debug for DependencyRegistry<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let entries = self.entries.lock();
        f.debug_struct("DependencyRegistry")
            .field("owner", &self.owner)
            .field("dependents", &entries.dependents.len())
            .field("subscribers", &entries.subscribers.len())
            .field("closed", &entries.closed)
            .finish()
    }
}

impl<T: 'static> DependencyRegistry<T> {
    /// Create an empty registry for `owner`.
    #[must_use]
    pub fn new(owner: SignalId) -> Self {
        Self {
            owner,
            entries: Arc::new(Mutex::new(Entries {
                dependents: Vec::new(),
                subscribers: Vec::new(),
                next_key: 0,
                closed: false,
            })),
        }
    }

    /// The signal this registry belongs to.
    #[must_use]
    pub fn owner(&self) -> SignalId {
        self.owner
    }

    /// Register `dependent`. Adding an already-registered dependent is a no-op.
    pub fn add(&self, dependent: &dyn AsDependent) {
        let weak = dependent.downgrade_dependent();
        let mut entries = self.entries.lock();
        if entries.closed {
            tracing::debug!(message = "registry.closed", owner = %self.owner, op = "add");
            return;
        }
        entries.prune();
        if entries.dependents.iter().any(|w| Weak::ptr_eq(w, &weak)) {
            return;
        }
        entries.dependents.push(weak);
    }

    /// Deregister `dependent`. Safe to call when it is not registered.
    pub fn remove(&self, dependent: &dyn AsDependent) {
        let weak = dependent.downgrade_dependent();
        let mut entries = self.entries.lock();
        entries
            .dependents
            .retain(|w| w.strong_count() > 0 && !Weak::ptr_eq(w, &weak));
    }

    /// Deregister every dependent and subscriber. The registry stays usable.
    pub fn remove_all(&self) {
        let mut entries = self.entries.lock();
        entries.dependents.clear();
        entries.subscribers.clear();
    }

    /// Deregister everything and refuse further registrations.
    ///
    /// Called when the owning signal is disposed. Idempotent.
    pub fn close(&self) {
        let mut entries = self.entries.lock();
        entries.closed = true;
        entries.dependents.clear();
        entries.subscribers.clear();
    }

    /// Whether [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.entries.lock().closed
    }

    /// Notify every live dependent with this registry's owner as the source,
    /// then every subscriber with `value`.
    ///
    /// Expired dependents are pruned silently. Entries added or removed by a
    /// callback take effect from the next call. A panicking callback is
    /// logged and skipped; every other entry is still notified.
    pub fn mark_dirty(&self, value: &T) {
        let (dependents, observers) = {
            let mut entries = self.entries.lock();
            if entries.closed {
                return;
            }
            let mut live = Vec::with_capacity(entries.dependents.len());
            let before = entries.dependents.len();
            entries.dependents.retain(|w| match w.upgrade() {
                Some(dependent) => {
                    live.push(dependent);
                    true
                }
                None => false,
            });
            let pruned = before - entries.dependents.len();
            if pruned > 0 {
                tracing::trace!(message = "registry.prune", owner = %self.owner, pruned);
            }
            let observers: Vec<Observer<T>> = entries
                .subscribers
                .iter()
                .map(|s| Arc::clone(&s.observer))
                .collect();
            (live, observers)
        };

        for dependent in &dependents {
            self.contain(|| dependent.update_dirty_flag(self.owner));
        }
        for observer in &observers {
            self.contain(|| observer(value));
        }
    }

    /// Run one callback; a panic is logged and does not reach the writer or
    /// the remaining callbacks.
    fn contain(&self, callback: impl FnOnce()) {
        if let Err(payload) = catch_unwind(AssertUnwindSafe(callback)) {
            let panic = panic_message(payload.as_ref());
            tracing::warn!(message = "registry.callback.panicked", owner = %self.owner, %panic);
        }
    }

    /// True iff at least one live dependent or subscriber remains.
    #[must_use]
    pub fn has_dependencies(&self) -> bool {
        let entries = self.entries.lock();
        !entries.subscribers.is_empty() || entries.dependents.iter().any(|w| w.strong_count() > 0)
    }

    /// Number of live dependents.
    #[must_use]
    pub fn dependent_count(&self) -> usize {
        let mut entries = self.entries.lock();
        entries.prune();
        entries.dependents.len()
    }

    /// Number of active subscriptions.
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.entries.lock().subscribers.len()
    }

    /// Subscribe `observer` to change notifications.
    ///
    /// The observer is not called with the current value; it sees each
    /// subsequent change. On a closed registry the returned subscription is
    /// already inactive.
    pub fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        let key = {
            let mut entries = self.entries.lock();
            if entries.closed {
                tracing::debug!(message = "registry.closed", owner = %self.owner, op = "subscribe");
                return Subscription::inactive();
            }
            let key = entries.next_key;
            entries.next_key += 1;
            entries.subscribers.push(SubscriberEntry {
                key,
                observer: Arc::new(observer),
            });
            key
        };

        let weak = Arc::downgrade(&self.entries);
        Subscription::new(move || {
            if let Some(entries) = weak.upgrade() {
                entries.lock().subscribers.retain(|s| s.key != key);
            }
        })
    }
}

/// Handle for one push subscription.
///
/// [`dispose`](Self::dispose) (or dropping the handle) removes exactly this
/// subscription. Removal happens at most once.
pub struct Subscription {
    remove: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    active: AtomicBool,
}

impl Subscription {
    fn new(remove: impl FnOnce() + Send + 'static) -> Self {
        Self {
            remove: Mutex::new(Some(Box::new(remove))),
            active: AtomicBool::new(true),
        }
    }

    fn inactive() -> Self {
        Self {
            remove: Mutex::new(None),
            active: AtomicBool::new(false),
        }
    }

    /// Remove the subscription. Later calls do nothing.
    pub fn dispose(&self) {
        self.active.store(false, Ordering::Release);
        let remove = self.remove.lock().take();
        if let Some(remove) = remove {
            remove();
        }
    }

    /// Whether the subscription is still registered by this handle.
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("active", &self.is_active())
            .finish_non_exhaustive()
    }
}

/// A ready-made [`Dependent`] that records whether any source changed.
#[derive(Debug, Default)]
pub struct DirtyFlag {
    dirty: AtomicBool,
    notifications: AtomicU64,
    last_source: Mutex<Option<SignalId>>,
}

impl DirtyFlag {
    #[must_use]
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    #[must_use]
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::Acquire)
    }

    /// Clear the flag, returning whether it was set.
    pub fn take(&self) -> bool {
        self.dirty.swap(false, Ordering::AcqRel)
    }

    /// Total dirty notifications received.
    #[must_use]
    pub fn notifications(&self) -> u64 {
        self.notifications.load(Ordering::Acquire)
    }

    /// Source of the most recent notification.
    #[must_use]
    pub fn last_source(&self) -> Option<SignalId> {
        *self.last_source.lock()
    }
}

impl Dependent for DirtyFlag {
    fn update_dirty_flag(&self, source: SignalId) {
        *self.last_source.lock() = Some(source);
        self.notifications.fetch_add(1, Ordering::AcqRel);
        self.dirty.store(true, Ordering::Release);
    }

    fn has_dependencies(&self) -> bool {
        true
    }
}
