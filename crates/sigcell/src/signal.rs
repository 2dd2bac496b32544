#![forbid(unsafe_code)]

//! Signal capabilities and the read-only signal view.
//!
//! Two orthogonal traits describe what a reactive value can do:
//!
//! - [`Signal`]: read the current value, subscribe for pushes, and take part
//!   in dependency tracking.
//! - [`SignalMut`]: additionally accept a new value.
//!
//! [`Mutable`](crate::Mutable), [`AtomicMutable`](crate::AtomicMutable) and
//! [`State`](crate::State) implement both; [`ReadSignal`] implements only
//! [`Signal`].

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use parking_lot::RwLock;

use crate::error::{Result, SignalError};
use crate::registry::{AsDependent, DependencyRegistry, SignalId, Subscription};

/// A reactive value that can be read, observed and depended upon.
pub trait Signal: Send + Sync {
    type Value: Clone + Send + Sync + 'static;

    /// Identity passed to dependents as the source of dirty notifications.
    fn id(&self) -> SignalId;

    /// Clone of the current value. Pure read.
    fn value(&self) -> Self::Value;

    /// Number of notified changes so far.
    fn version(&self) -> u64;

    /// Object-safe form of [`subscribe`](Self::subscribe).
    fn subscribe_boxed(&self, observer: Box<dyn Fn(&Self::Value) + Send + Sync>) -> Subscription;

    /// Register `observer` for every subsequent change.
    fn subscribe<F>(&self, observer: F) -> Subscription
    where
        F: Fn(&Self::Value) + Send + Sync + 'static,
        Self: Sized,
    {
        self.subscribe_boxed(Box::new(observer))
    }

    /// Register `dependent` to be marked dirty on change. Idempotent.
    fn track(&self, dependent: &dyn AsDependent);

    /// Deregister `dependent`. Safe when not tracked.
    fn untrack(&self, dependent: &dyn AsDependent);

    /// Whether any live dependent or subscriber remains.
    fn has_dependencies(&self) -> bool;
}

/// A [`Signal`] that can also be assigned.
pub trait SignalMut: Signal {
    type Error: std::error::Error + Send + Sync + 'static;

    fn set(&self, value: Self::Value) -> std::result::Result<(), Self::Error>;
}

/// Value cell plus registry shared by [`Mutable`](crate::Mutable),
/// [`ReadSignal`] and the state manager's published model.
pub(crate) struct SignalCore<T> {
    id: SignalId,
    value: RwLock<T>,
    version: AtomicU64,
    registry: DependencyRegistry<T>,
    disposed: AtomicBool,
}

impl<T: Clone + Send + Sync + 'static> SignalCore<T> {
    pub(crate) fn new(value: T) -> Self {
        let id = SignalId::next();
        Self {
            id,
            value: RwLock::new(value),
            version: AtomicU64::new(0),
            registry: DependencyRegistry::new(id),
            disposed: AtomicBool::new(false),
        }
    }

    pub(crate) fn id(&self) -> SignalId {
        self.id
    }

    pub(crate) fn get(&self) -> T {
        self.value.read().clone()
    }

    pub(crate) fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        f(&self.value.read())
    }

    pub(crate) fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    pub(crate) fn registry(&self) -> &DependencyRegistry<T> {
        &self.registry
    }

    pub(crate) fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }

    /// Store `value`, bump the version and mark dependents dirty on the
    /// calling thread.
    ///
    /// No lock is held while dependents and subscribers run, so they may
    /// read or write this signal again.
    pub(crate) fn replace(&self, value: T) -> Result<()> {
        if self.is_disposed() {
            return Err(SignalError::Disposed { id: self.id });
        }
        let snapshot = value.clone();
        *self.value.write() = value;
        self.version.fetch_add(1, Ordering::AcqRel);
        self.registry.mark_dirty(&snapshot);
        Ok(())
    }

    /// Release all registrations. Idempotent.
    pub(crate) fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.registry.close();
        tracing::debug!(message = "signal.dispose", signal = %self.id);
    }
}

impl<T: fmt::Debug> fmt::Debug for SignalCore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signal")
            .field("id", &self.id)
            .field("value", &*self.value.read())
            .field("version", &self.version.load(Ordering::Acquire))
            .field("disposed", &self.disposed.load(Ordering::Acquire))
            .finish()
    }
}

/// Read-only view of a signal.
///
/// Cloning creates another handle to the same value and registry. A view
/// cannot dispose its source; it goes quiet when the source is disposed.
pub struct ReadSignal<T> {
    core: Arc<SignalCore<T>>,
}

impl<T> Clone for ReadSignal<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for ReadSignal<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.core, f)
    }
}

impl<T: Clone + Send + Sync + 'static> ReadSignal<T> {
    pub(crate) fn from_core(core: Arc<SignalCore<T>>) -> Self {
        Self { core }
    }

    /// Access the current value by reference.
    ///
    /// The closure runs under a read lock; it must not write the source.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.core.with(f)
    }

    /// Whether the source signal has been disposed.
    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.core.is_disposed()
    }

    #[must_use]
    pub fn dependent_count(&self) -> usize {
        self.core.registry().dependent_count()
    }

    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.core.registry().subscriber_count()
    }
}

impl<T: Clone + Send + Sync + 'static> Signal for ReadSignal<T> {
    type Value = T;

    fn id(&self) -> SignalId {
        self.core.id()
    }

    fn value(&self) -> T {
        self.core.get()
    }

    fn version(&self) -> u64 {
        self.core.version()
    }

    fn subscribe_boxed(&self, observer: Box<dyn Fn(&T) + Send + Sync>) -> Subscription {
        self.core.registry().subscribe(observer)
    }

    fn track(&self, dependent: &dyn AsDependent) {
        self.core.registry().add(dependent);
    }

    fn untrack(&self, dependent: &dyn AsDependent) {
        self.core.registry().remove(dependent);
    }

    fn has_dependencies(&self) -> bool {
        self.core.registry().has_dependencies()
    }
}
