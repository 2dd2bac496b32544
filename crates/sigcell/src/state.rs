#![forbid(unsafe_code)]

//! Serialized state manager.
//!
//! [`State<Model, Msg>`] owns a model and an update function on a dedicated
//! processing thread. Callers never touch the model directly; they send
//! requests through an ordered channel and wait for the reply.
//!
//! # Ordering
//!
//! The processing thread is the only consumer of the request queue and the
//! only owner of the model. Requests are served one at a time in the order
//! they entered the queue, so every transition is computed against the true
//! current model. Update functions may be impure or expensive; they are never
//! retried.
//!
//! Each transition runs four steps in order:
//!
//! 1. compute the new model,
//! 2. publish it to the state's [`ReadSignal`] (dependents and subscribers
//!    run on the processing thread),
//! 3. install it as the current model,
//! 4. reply to the caller with the new model.
//!
//! # Failure Modes
//!
//! - **Update panics**: the caller that sent the message receives
//!   [`StateError::UpdatePanicked`]. The model is left unchanged. Under
//!   [`UpdateFaultPolicy::Continue`] the loop keeps serving; under
//!   [`UpdateFaultPolicy::Terminate`] it stops and later requests fail with
//!   [`StateError::Closed`].
//! - **Subscriber panics during publish**: logged per callback; the other
//!   dependents and subscribers are still notified and the transition
//!   completes.
//! - **Synchronous request from a subscriber**: rejected with
//!   [`StateError::Reentrant`] instead of deadlocking the processing thread.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc;
use std::thread::{self, JoinHandle, ThreadId};

use futures::channel::oneshot;
use parking_lot::Mutex;

use crate::error::StateError;
use crate::registry::{AsDependent, SignalId, Subscription};
use crate::signal::{ReadSignal, Signal, SignalCore, SignalMut};

/// What the processing loop does after an update function panics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum UpdateFaultPolicy {
    /// Keep the last good model and keep serving requests.
    #[default]
    Continue,
    /// Reply with the fault, then stop the loop.
    Terminate,
}

/// Configuration for a [`State`].
#[derive(Debug, Clone)]
pub struct StateConfig {
    /// Name of the processing thread.
    pub thread_name: String,
    /// Behaviour after an update function panics.
    pub fault_policy: UpdateFaultPolicy,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            thread_name: "sigcell-state".to_string(),
            fault_policy: UpdateFaultPolicy::Continue,
        }
    }
}

impl StateConfig {
    #[must_use]
    pub fn with_thread_name(mut self, name: impl Into<String>) -> Self {
        self.thread_name = name.into();
        self
    }

    #[must_use]
    pub fn with_fault_policy(mut self, policy: UpdateFaultPolicy) -> Self {
        self.fault_policy = policy;
        self
    }
}

type Reply<Model> = oneshot::Sender<Result<Model, StateError>>;

/// Requests served by the processing loop.
enum Request<Model, Msg> {
    Get { reply: Reply<Model> },
    Set { model: Model, reply: Reply<Model> },
    Update { msg: Msg, reply: Reply<Model> },
}

struct Shared<Model, Msg> {
    sender: Mutex<Option<mpsc::Sender<Request<Model, Msg>>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
    loop_thread: ThreadId,
    signal: Arc<SignalCore<Model>>,
    disposed: AtomicBool,
}

impl<Model, Msg> Shared<Model, Msg>
where
    Model: Clone + Send + Sync + 'static,
{
    /// Close the queue, let the loop drain what is already queued, join it
    /// and release the published signal. Idempotent.
    fn shutdown(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(self.sender.lock().take());
        let handle = self.handle.lock().take();
        if let Some(handle) = handle {
            // Never join from the processing thread itself.
            if thread::current().id() != self.loop_thread {
                let _ = handle.join();
            }
        }
        self.signal.dispose();
        tracing::debug!(message = "state.dispose", signal = %self.signal.id());
    }
}

impl<Model, Msg> Drop for Shared<Model, Msg> {
    fn drop(&mut self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }
        drop(self.sender.get_mut().take());
        if let Some(handle) = self.handle.get_mut().take() {
            if thread::current().id() != self.loop_thread {
                let _ = handle.join();
            }
        }
    }
}

/// Single-writer state container reached by message passing.
///
/// Cloning creates another handle to the same processing loop. Dropping the
/// last handle stops the loop after it drains queued requests.
pub struct State<Model, Msg> {
    shared: Arc<Shared<Model, Msg>>,
}

impl<Model, Msg> Clone for State<Model, Msg> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<Model: fmt::Debug, Msg> fmt::Debug for State<Model, Msg> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("State")
            .field("signal", &self.shared.signal)
            .field("disposed", &self.shared.disposed.load(Ordering::Acquire))
            .finish()
    }
}

impl<Model, Msg> State<Model, Msg>
where
    Model: Clone + Send + Sync + 'static,
    Msg: Send + 'static,
{
    /// Start a processing loop with the default [`StateConfig`].
    ///
    /// # Errors
    ///
    /// [`StateError::Spawn`] if the processing thread cannot be started.
    pub fn new<F>(initial: Model, update: F) -> Result<Self, StateError>
    where
        F: FnMut(Msg, &Model) -> Model + Send + 'static,
    {
        Self::with_config(initial, update, StateConfig::default())
    }

    /// Start a processing loop with an explicit configuration.
    ///
    /// # Errors
    ///
    /// [`StateError::Spawn`] if the processing thread cannot be started.
    pub fn with_config<F>(initial: Model, update: F, config: StateConfig) -> Result<Self, StateError>
    where
        F: FnMut(Msg, &Model) -> Model + Send + 'static,
    {
        let signal = Arc::new(SignalCore::new(initial.clone()));
        let (tx, rx) = mpsc::channel::<Request<Model, Msg>>();
        let loop_signal = Arc::clone(&signal);
        let policy = config.fault_policy;

        let handle = thread::Builder::new()
            .name(config.thread_name)
            .spawn(move || run_loop(initial, update, rx, &loop_signal, policy))?;
        let loop_thread = handle.thread().id();

        Ok(Self {
            shared: Arc::new(Shared {
                sender: Mutex::new(Some(tx)),
                handle: Mutex::new(Some(handle)),
                loop_thread,
                signal,
                disposed: AtomicBool::new(false),
            }),
        })
    }

    /// Current model. Blocks until the request is served.
    ///
    /// # Errors
    ///
    /// [`StateError::Disposed`], [`StateError::Closed`] or
    /// [`StateError::Reentrant`].
    pub fn get(&self) -> Result<Model, StateError> {
        self.ensure_not_loop_thread()?;
        let rx = self.submit(|reply| Request::Get { reply })?;
        wait(rx)
    }

    /// Replace the model. Blocks until published and installed.
    ///
    /// # Errors
    ///
    /// [`StateError::Disposed`], [`StateError::Closed`] or
    /// [`StateError::Reentrant`].
    pub fn set(&self, model: Model) -> Result<Model, StateError> {
        self.ensure_not_loop_thread()?;
        let rx = self.submit(|reply| Request::Set { model, reply })?;
        wait(rx)
    }

    /// Apply `update(msg, current)` and return the new model. Blocks until
    /// published and installed.
    ///
    /// # Errors
    ///
    /// [`StateError::UpdatePanicked`] if the update function panicked, plus
    /// the errors of [`get`](Self::get).
    pub fn update(&self, msg: Msg) -> Result<Model, StateError> {
        self.ensure_not_loop_thread()?;
        let rx = self.submit(|reply| Request::Update { msg, reply })?;
        wait(rx)
    }

    /// Asynchronous [`get`](Self::get). The request is queued immediately;
    /// only the returned future waits.
    ///
    /// # Errors
    ///
    /// [`StateError::Disposed`] or [`StateError::Closed`].
    pub fn get_async(
        &self,
    ) -> impl Future<Output = Result<Model, StateError>> + Send + use<Model, Msg> {
        let rx = self.submit(|reply| Request::Get { reply });
        settle(rx)
    }

    /// Asynchronous [`set`](Self::set).
    ///
    /// # Errors
    ///
    /// [`StateError::Disposed`] or [`StateError::Closed`].
    pub fn set_async(
        &self,
        model: Model,
    ) -> impl Future<Output = Result<Model, StateError>> + Send + use<Model, Msg> {
        let rx = self.submit(|reply| Request::Set { model, reply });
        settle(rx)
    }

    /// Asynchronous [`update`](Self::update).
    ///
    /// # Errors
    ///
    /// [`StateError::UpdatePanicked`], [`StateError::Disposed`] or
    /// [`StateError::Closed`].
    pub fn update_async(
        &self,
        msg: Msg,
    ) -> impl Future<Output = Result<Model, StateError>> + Send + use<Model, Msg> {
        let rx = self.submit(|reply| Request::Update { msg, reply });
        settle(rx)
    }

    /// Read-only signal republishing every installed model.
    ///
    /// Its initial value is the initial model.
    #[must_use]
    pub fn signal(&self) -> ReadSignal<Model> {
        ReadSignal::from_core(Arc::clone(&self.shared.signal))
    }

    /// Stop accepting requests, let queued requests finish, stop the loop
    /// and release every dependent and subscriber. Calling it again does
    /// nothing.
    pub fn dispose(&self) {
        self.shared.shutdown();
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.shared.disposed.load(Ordering::Acquire)
    }

    /// Whether the processing loop is still alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.shared
            .handle
            .lock()
            .as_ref()
            .is_some_and(|h| !h.is_finished())
    }

    fn ensure_not_loop_thread(&self) -> Result<(), StateError> {
        if thread::current().id() == self.shared.loop_thread {
            return Err(StateError::Reentrant);
        }
        Ok(())
    }

    fn submit(
        &self,
        make: impl FnOnce(Reply<Model>) -> Request<Model, Msg>,
    ) -> Result<oneshot::Receiver<Result<Model, StateError>>, StateError> {
        if self.is_disposed() {
            return Err(StateError::Disposed);
        }
        let (tx, rx) = oneshot::channel();
        let sender = self.shared.sender.lock();
        let sender = sender.as_ref().ok_or(StateError::Disposed)?;
        sender.send(make(tx)).map_err(|_| StateError::Closed)?;
        Ok(rx)
    }
}

fn wait<Model>(rx: oneshot::Receiver<Result<Model, StateError>>) -> Result<Model, StateError> {
    futures::executor::block_on(rx).unwrap_or(Err(StateError::Closed))
}

async fn settle<Model>(
    rx: Result<oneshot::Receiver<Result<Model, StateError>>, StateError>,
) -> Result<Model, StateError> {
    rx?.await.unwrap_or(Err(StateError::Closed))
}

/// Publish `next` to the state's signal; a panic while publishing is
/// logged rather than taking down the loop.
fn publish<Model: Clone + Send + Sync + 'static>(signal: &SignalCore<Model>, next: &Model) {
    let published = catch_unwind(AssertUnwindSafe(|| signal.replace(next.clone())));
    match published {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            tracing::trace!(message = "state.publish.skipped", signal = %signal.id(), %err);
        }
        Err(payload) => {
            let err = StateError::from_panic(payload.as_ref());
            tracing::warn!(message = "state.publish.panicked", signal = %signal.id(), %err);
        }
    }
}

/// The processing loop. Owns the model exclusively.
fn run_loop<Model, Msg, F>(
    mut model: Model,
    mut update: F,
    rx: mpsc::Receiver<Request<Model, Msg>>,
    signal: &SignalCore<Model>,
    policy: UpdateFaultPolicy,
) where
    Model: Clone + Send + Sync + 'static,
    F: FnMut(Msg, &Model) -> Model,
{
    tracing::debug!(message = "state.loop.start", signal = %signal.id(), ?policy);
    let mut served = 0u64;

    while let Ok(request) = rx.recv() {
        served += 1;
        match request {
            Request::Get { reply } => {
                let _ = reply.send(Ok(model.clone()));
            }
            Request::Set { model: next, reply } => {
                publish(signal, &next);
                model = next;
                let _ = reply.send(Ok(model.clone()));
            }
            Request::Update { msg, reply } => {
                match catch_unwind(AssertUnwindSafe(|| update(msg, &model))) {
                    Ok(next) => {
                        publish(signal, &next);
                        model = next;
                        let _ = reply.send(Ok(model.clone()));
                    }
                    Err(payload) => {
                        let err = StateError::from_panic(payload.as_ref());
                        tracing::warn!(
                            message = "state.update.panicked",
                            signal = %signal.id(),
                            %err,
                            ?policy
                        );
                        let _ = reply.send(Err(err));
                        if policy == UpdateFaultPolicy::Terminate {
                            break;
                        }
                    }
                }
            }
        }
    }

    tracing::debug!(message = "state.loop.stop", signal = %signal.id(), served);
}

impl<Model, Msg> Signal for State<Model, Msg>
where
    Model: Clone + Send + Sync + 'static,
    Msg: Send + 'static,
{
    type Value = Model;

    fn id(&self) -> SignalId {
        self.shared.signal.id()
    }

    /// Last published model. Does not queue a request.
    fn value(&self) -> Model {
        self.shared.signal.get()
    }

    fn version(&self) -> u64 {
        self.shared.signal.version()
    }

    fn subscribe_boxed(&self, observer: Box<dyn Fn(&Model) + Send + Sync>) -> Subscription {
        self.shared.signal.registry().subscribe(observer)
    }

    fn track(&self, dependent: &dyn AsDependent) {
        self.shared.signal.registry().add(dependent);
    }

    fn untrack(&self, dependent: &dyn AsDependent) {
        self.shared.signal.registry().remove(dependent);
    }

    fn has_dependencies(&self) -> bool {
        self.shared.signal.registry().has_dependencies()
    }
}

impl<Model, Msg> SignalMut for State<Model, Msg>
where
    Model: Clone + Send + Sync + 'static,
    Msg: Send + 'static,
{
    type Error = StateError;

    fn set(&self, value: Model) -> Result<(), StateError> {
        State::set(self, value).map(drop)
    }
}
