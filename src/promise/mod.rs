//! A one-shot settable result with listeners and blocking waiters.
//!
//! A [`Promise`] starts out pending and moves exactly once to one of three
//! terminal states: success, failure, or cancelled. Any clone of the promise
//! can complete it, wait on it, or attach listeners; the first completion
//! wins and everything after it observes the same outcome.
//!
//! # Example
//!
//! ```
//! use rebound::promise::Promise;
//! use std::thread;
//!
//! let promise: Promise<u32> = Promise::new();
//! let setter = promise.clone();
//! thread::spawn(move || {
//!     setter.set_success(42).unwrap();
//! });
//! assert_eq!(promise.get().unwrap(), 42);
//! ```
//!
//! # Listener semantics
//!
//! Listeners fire exactly once, in the order they were added. A listener
//! added after completion fires on the adding call. A listener added while a
//! notification wave is running (including by another listener) fires after
//! the current wave. A panicking listener is logged and skipped.

use std::{
    fmt,
    panic::{AssertUnwindSafe, catch_unwind},
    sync::{Arc, Condvar, Mutex, MutexGuard},
    time::{Duration, Instant},
};
use thiserror::Error;
use tracing::warn;

/// Failure cause attached to a promise, shared between all observers.
pub type Cause = Arc<dyn std::error::Error + Send + Sync>;

/// Errors surfaced by [`Promise`] operations.
#[derive(Debug, Clone, Error)]
pub enum PromiseError {
    /// A completing call found the promise already completed.
    #[error("promise already completed")]
    AlreadyComplete,
    /// The blocking-waiter budget was exhausted.
    #[error("too many waiters blocked on one promise")]
    TooManyWaiters,
    /// A timed wait elapsed before completion.
    #[error("timed out waiting for completion")]
    Timeout,
    /// The promise was cancelled.
    #[error("promise was cancelled")]
    Cancelled,
    /// The promise completed with a failure.
    #[error("promise failed: {0}")]
    Failed(Cause),
}

/// Identifies a listener for [`Promise::remove_listener`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

enum Outcome<T> {
    Success(T),
    Failure(Cause),
    Cancelled,
}

type Listener<T> = Box<dyn FnOnce(&Promise<T>) + Send>;

struct State<T> {
    outcome: Option<Outcome<T>>,
    uncancellable: bool,
    listeners: Vec<(ListenerId, Listener<T>)>,
    notifying: bool,
    waiters: u16,
    next_listener: u64,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

const MAX_WAITERS: u16 = i16::MAX as u16;

/// A cloneable handle to a one-shot result.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Promise { inner: Arc::clone(&self.inner) }
    }
}

impl<T: Send + 'static> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send + 'static> Promise<T> {
    pub fn new() -> Self {
        Promise {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    outcome: None,
                    uncancellable: false,
                    listeners: Vec::new(),
                    notifying: false,
                    waiters: 0,
                    next_listener: 0,
                }),
                done: Condvar::new(),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, State<T>> {
        self.inner.state.lock().unwrap()
    }

    fn complete(&self, outcome: Outcome<T>) -> bool {
        let mut state = self.lock();
        if state.outcome.is_some() {
            return false;
        }
        state.outcome = Some(outcome);
        self.inner.done.notify_all();
        self.notify_listeners(state);
        true
    }

    // Serialized by the notifying flag: whichever call sets it owns the wave
    // and keeps draining until no listener is left, so listeners appended
    // mid-wave run after the wave in insertion order.
    fn notify_listeners<'a>(&'a self, mut state: MutexGuard<'a, State<T>>) {
        if state.notifying {
            return;
        }
        state.notifying = true;
        self.drain_listeners(state);
    }

    fn drain_listeners<'a>(&'a self, mut state: MutexGuard<'a, State<T>>) {
        loop {
            let batch = std::mem::take(&mut state.listeners);
            if batch.is_empty() {
                state.notifying = false;
                return;
            }
            drop(state);
            for (_, listener) in batch {
                self.invoke(listener);
            }
            state = self.lock();
        }
    }

    fn invoke(&self, listener: Listener<T>) {
        if catch_unwind(AssertUnwindSafe(|| listener(self))).is_err() {
            warn!("promise listener panicked; continuing notification");
        }
    }

    /// Complete with `value`, or fail if the promise is already terminal.
    pub fn set_success(&self, value: T) -> Result<(), PromiseError> {
        if self.complete(Outcome::Success(value)) {
            Ok(())
        } else {
            Err(PromiseError::AlreadyComplete)
        }
    }

    /// Complete with `value`. Returns false if the promise was already
    /// terminal.
    pub fn try_success(&self, value: T) -> bool {
        self.complete(Outcome::Success(value))
    }

    /// Complete with a failure cause, or fail if already terminal.
    pub fn set_failure(
        &self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> Result<(), PromiseError> {
        if self.try_failure(cause) {
            Ok(())
        } else {
            Err(PromiseError::AlreadyComplete)
        }
    }

    /// Complete with a failure cause. Returns false if already terminal.
    pub fn try_failure(
        &self,
        cause: impl Into<Box<dyn std::error::Error + Send + Sync>>,
    ) -> bool {
        self.complete(Outcome::Failure(Arc::from(cause.into())))
    }

    /// Cancel the promise. Returns false if it is already terminal or was
    /// marked uncancellable.
    pub fn cancel(&self) -> bool {
        let mut state = self.lock();
        if state.outcome.is_some() || state.uncancellable {
            return false;
        }
        state.outcome = Some(Outcome::Cancelled);
        self.inner.done.notify_all();
        self.notify_listeners(state);
        true
    }

    /// Forbid cancellation. Returns true if the promise is now
    /// uncancellable, or already completed without being cancelled.
    pub fn set_uncancellable(&self) -> bool {
        let mut state = self.lock();
        match &state.outcome {
            None => {
                state.uncancellable = true;
                true
            }
            Some(Outcome::Cancelled) => false,
            Some(_) => true,
        }
    }

    /// True once the promise is terminal. An uncancellable but pending
    /// promise is not done.
    pub fn is_done(&self) -> bool {
        self.lock().outcome.is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.lock().outcome, Some(Outcome::Success(_)))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.lock().outcome, Some(Outcome::Failure(_)))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.lock().outcome, Some(Outcome::Cancelled))
    }

    /// True while the promise is pending and cancellation is still allowed.
    pub fn is_cancellable(&self) -> bool {
        let state = self.lock();
        state.outcome.is_none() && !state.uncancellable
    }

    /// The failure cause, if the promise failed.
    pub fn cause(&self) -> Option<Cause> {
        match &self.lock().outcome {
            Some(Outcome::Failure(cause)) => Some(cause.clone()),
            _ => None,
        }
    }

    /// Attach a listener. Fires on this call if the promise is already
    /// terminal and no notification wave is running.
    pub fn add_listener(
        &self,
        listener: impl FnOnce(&Promise<T>) + Send + 'static,
    ) -> ListenerId {
        let mut state = self.lock();
        let id = ListenerId(state.next_listener);
        state.next_listener += 1;
        if state.outcome.is_none() || state.notifying {
            state.listeners.push((id, Box::new(listener)));
            return id;
        }
        state.notifying = true;
        drop(state);
        self.invoke(Box::new(listener));
        self.drain_listeners(self.lock());
        id
    }

    /// Detach a listener that has not fired yet. Removing an unknown or
    /// already-fired listener is a no-op that returns false.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut state = self.lock();
        match state.listeners.iter().position(|(lid, _)| *lid == id) {
            Some(pos) => {
                state.listeners.remove(pos);
                true
            }
            None => false,
        }
    }

    fn wait_done(&self) -> Result<MutexGuard<'_, State<T>>, PromiseError> {
        let mut state = self.lock();
        loop {
            if state.outcome.is_some() {
                return Ok(state);
            }
            if state.waiters >= MAX_WAITERS {
                return Err(PromiseError::TooManyWaiters);
            }
            state.waiters += 1;
            state = self.inner.done.wait(state).unwrap();
            state.waiters -= 1;
        }
    }

    /// Block until the promise is terminal.
    pub fn wait(&self) -> Result<(), PromiseError> {
        self.wait_done().map(|_| ())
    }

    /// Block until the promise is terminal or `timeout` elapses. Returns
    /// whether the promise completed.
    pub fn wait_timeout(&self, timeout: Duration) -> Result<bool, PromiseError> {
        let deadline = Instant::now() + timeout;
        let mut state = self.lock();
        loop {
            if state.outcome.is_some() {
                return Ok(true);
            }
            let now = Instant::now();
            if now >= deadline {
                return Ok(false);
            }
            if state.waiters >= MAX_WAITERS {
                return Err(PromiseError::TooManyWaiters);
            }
            state.waiters += 1;
            let (next, _) = self.inner.done.wait_timeout(state, deadline - now).unwrap();
            state = next;
            state.waiters -= 1;
        }
    }
}

impl<T: Clone + Send + 'static> Promise<T> {
    fn result_of(state: &State<T>) -> Result<T, PromiseError> {
        match &state.outcome {
            Some(Outcome::Success(value)) => Ok(value.clone()),
            Some(Outcome::Failure(cause)) => Err(PromiseError::Failed(cause.clone())),
            Some(Outcome::Cancelled) | None => Err(PromiseError::Cancelled),
        }
    }

    /// The outcome without blocking, if the promise is terminal.
    pub fn get_now(&self) -> Option<Result<T, PromiseError>> {
        let state = self.lock();
        state.outcome.as_ref().map(|_| Self::result_of(&state))
    }

    /// Block until terminal and return the value, failure cause, or
    /// cancellation.
    pub fn get(&self) -> Result<T, PromiseError> {
        let state = self.wait_done()?;
        Self::result_of(&state)
    }

    /// Like [`get`](Self::get) with a deadline.
    pub fn get_timeout(&self, timeout: Duration) -> Result<T, PromiseError> {
        if !self.wait_timeout(timeout)? {
            return Err(PromiseError::Timeout);
        }
        let state = self.lock();
        Self::result_of(&state)
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock().unwrap();
        let name = match &state.outcome {
            None if state.uncancellable => "pending (uncancellable)",
            None => "pending",
            Some(Outcome::Success(_)) => "success",
            Some(Outcome::Failure(_)) => "failure",
            Some(Outcome::Cancelled) => "cancelled",
        };
        write!(f, "Promise({name})")
    }
}
