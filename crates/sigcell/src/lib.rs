#![forbid(unsafe_code)]

//! Reactive signals with dependency tracking and two thread-safe mutation
//! disciplines.
//!
//! - [`Mutable`]: plain read/write signal; notifies synchronously on the
//!   writer's thread.
//! - [`AtomicMutable`]: lock-free read/write signal; updates use a
//!   compare-and-swap retry loop.
//! - [`State`]: single-writer model owned by a processing thread; every
//!   read, replace and update is queued and served in order.
//!
//! All of them implement [`Signal`] (read, subscribe, track dependents) and
//! [`SignalMut`] (assign). Dependents are held weakly by each signal's
//! [`DependencyRegistry`], so observing a signal never keeps the observer
//! alive.
//!
//! # Example
//!
//! ```
//! use sigcell::{DirtyFlag, Signal, create_mutable, create_state};
//!
//! let count = create_mutable(0);
//! let flag = DirtyFlag::new();
//! count.track(&flag);
//!
//! count.set(5).unwrap();
//! assert!(flag.is_dirty());
//! assert_eq!(count.value(), 5);
//!
//! let total = create_state(0, |msg: i32, model: &i32| model + msg).unwrap();
//! assert_eq!(total.update(3).unwrap(), 3);
//! assert_eq!(total.update(4).unwrap(), 7);
//! assert_eq!(total.get().unwrap(), 7);
//! ```

pub mod atomic;
pub mod error;
pub mod mutable;
pub mod registry;
pub mod signal;
pub mod state;

pub use atomic::AtomicMutable;
pub use error::{Result, SignalError, StateError};
pub use mutable::Mutable;
pub use registry::{AsDependent, Dependent, DependencyRegistry, DirtyFlag, SignalId, Subscription};
pub use signal::{ReadSignal, Signal, SignalMut};
pub use state::{State, StateConfig, UpdateFaultPolicy};

/// Create a [`Mutable`] holding `initial`.
#[must_use]
pub fn create_mutable<T: Clone + Send + Sync + 'static>(initial: T) -> Mutable<T> {
    Mutable::new(initial)
}

/// Create an [`AtomicMutable`] holding `initial`.
#[must_use]
pub fn create_atomic_mutable<T: Clone + Send + Sync + 'static>(initial: T) -> AtomicMutable<T> {
    AtomicMutable::new(initial)
}

/// Create a [`State`] with the default [`StateConfig`].
///
/// # Errors
///
/// [`StateError::Spawn`] if the processing thread cannot be started.
pub fn create_state<Model, Msg, F>(initial: Model, update: F) -> Result<State<Model, Msg>, StateError>
where
    Model: Clone + Send + Sync + 'static,
    Msg: Send + 'static,
    F: FnMut(Msg, &Model) -> Model + Send + 'static,
{
    State::new(initial, update)
}

/// Create a [`State`] with an explicit configuration.
///
/// # Errors
///
/// [`StateError::Spawn`] if the processing thread cannot be started.
pub fn create_state_with_config<Model, Msg, F>(
    initial: Model,
    update: F,
    config: StateConfig,
) -> Result<State<Model, Msg>, StateError>
where
    Model: Clone + Send + Sync + 'static,
    Msg: Send + 'static,
    F: FnMut(Msg, &Model) -> Model + Send + 'static,
{
    State::with_config(initial, update, config)
}
