#![forbid(unsafe_code)]

//! Plain read/write signal.
//!
//! [`Mutable<T>`] stores its value behind a lock so reads never observe a
//! half-written value, but it does not serialize writers: two threads that
//! `update` the same `Mutable` can lose one of the writes. Use
//! [`AtomicMutable`](crate::AtomicMutable) or [`State`](crate::State) when
//! writers share a value across threads.

use std::fmt;
use std::sync::Arc;

use crate::error::{Result, SignalError};
use crate::registry::{AsDependent, SignalId, Subscription};
use crate::signal::{ReadSignal, Signal, SignalCore, SignalMut};

/// A read/write signal that notifies synchronously on the writer's thread.
///
/// Cloning creates another handle to the same value and registry.
pub struct Mutable<T> {
    core: Arc<SignalCore<T>>,
}

impl<T> Clone for Mutable<T> {
    fn clone(&self) -> Self {
        Self {
            core: Arc::clone(&self.core),
        }
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutable<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.core, f)
    }
}

impl<T: Clone + Send + Sync + 'static> Mutable<T> {
    #[must_use]
    pub fn new(value: T) -> Self {
        Self {
            core: Arc::new(SignalCore::new(value)),
        }
    }

    /// Replace the value, then mark every dependent dirty and notify
    /// subscribers before returning.
    ///
    /// # Errors
    ///
    /// [`SignalError::Disposed`] after [`dispose`](Self::dispose).
    pub fn set(&self, value: T) -> Result<()> {
        self.core.replace(value)
    }

    /// Set the value to `f(current)`.
    ///
    /// Read and write are separate steps; concurrent writers may interleave.
    /// `f` runs on a clone of the current value with no lock held, so it may
    /// read or write this signal.
    ///
    /// # Errors
    ///
    /// [`SignalError::Disposed`] after [`dispose`](Self::dispose).
    pub fn update(&self, f: impl FnOnce(&T) -> T) -> Result<T> {
        if self.core.is_disposed() {
            return Err(SignalError::Disposed { id: self.core.id() });
        }
        let current = self.core.get();
        let next = f(&current);
        self.core.replace(next.clone())?;
        Ok(next)
    }

    /// Access the current value by reference.
    ///
    /// The closure runs under a read lock; it must not write this signal.
    /// Use [`update`](Self::update) to derive the next value.
    pub fn with<R>(&self, f: impl FnOnce(&T) -> R) -> R {
        self.core.with(f)
    }

    /// A read-only view sharing this signal's value and registry.
    #[must_use]
    pub fn read_only(&self) -> ReadSignal<T> {
        ReadSignal::from_core(Arc::clone(&self.core))
    }

    /// Deregister every dependent and subscriber and reject later writes.
    /// Calling it again does nothing.
    pub fn dispose(&self) {
        self.core.dispose();
    }

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

impl<T: Clone + Send + Sync + 'static> Signal for Mutable<T> {
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

impl<T: Clone + Send + Sync + 'static> SignalMut for Mutable<T> {
    type Error = SignalError;

    fn set(&self, value: T) -> Result<()> {
        Mutable::set(self, value)
    }
}
