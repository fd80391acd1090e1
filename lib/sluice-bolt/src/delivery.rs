//! Delivery outcomes.
//!
//! Broker clients report the outcome of a publish from their own I/O thread, at some point after the request was
//! submitted. [`channel`] pairs the two sides of that exchange: the client holds the [`DeliveryPromise`] and completes
//! it exactly once, while the submitter holds the [`DeliveryHandle`] and either blocks on it or registers a
//! continuation to run when the outcome arrives.

use std::{
    fmt,
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
};

use snafu::Snafu;

/// Delivery error.
#[derive(Clone, Debug, Eq, PartialEq, Snafu)]
#[snafu(context(suffix(false)))]
pub enum DeliveryError {
    /// The broker could not be reached.
    #[snafu(display("broker unavailable"))]
    BrokerUnavailable,

    /// The broker rejected the message.
    #[snafu(display("broker rejected message: {}", reason))]
    Rejected {
        /// Reason given by the broker.
        reason: String,
    },

    /// The broker client dropped the request without reporting an outcome.
    #[snafu(display("delivery abandoned by broker client"))]
    Abandoned,

    /// The broker client reported an error.
    #[snafu(display("broker client error: {}", reason))]
    Client {
        /// Error reported by the client.
        reason: String,
    },
}

/// Outcome of a publish.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum DeliveryOutcome {
    /// The broker accepted the message.
    ///
    /// The offset is `-1` when no acknowledgment was requested from the broker.
    Success {
        /// Partition the message was appended to.
        partition: i32,

        /// Offset of the message within the partition.
        offset: i64,
    },

    /// The message was not delivered.
    Failure(DeliveryError),
}

impl DeliveryOutcome {
    /// Returns `true` if the message was delivered.
    pub fn is_success(&self) -> bool {
        matches!(self, DeliveryOutcome::Success { .. })
    }
}

type Continuation = Box<dyn FnOnce(DeliveryOutcome) + Send>;

enum State {
    Pending(Option<Continuation>),
    Complete(Option<DeliveryOutcome>),
}

struct Shared {
    state: Mutex<State>,
    ready: Condvar,
}

impl Shared {
    fn lock_state(&self) -> MutexGuard<'_, State> {
        // Continuations never run while the lock is held, so a poisoned lock still holds a consistent state.
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn complete(&self, outcome: DeliveryOutcome) {
        let mut state = self.lock_state();
        match &mut *state {
            State::Pending(continuation) => match continuation.take() {
                Some(continuation) => {
                    *state = State::Complete(None);
                    drop(state);
                    continuation(outcome);
                }
                None => {
                    *state = State::Complete(Some(outcome));
                    drop(state);
                    self.ready.notify_all();
                }
            },
            // Promises are consumed on completion, so there is never a second outcome to record.
            State::Complete(_) => {}
        }
    }
}

/// Creates a connected promise/handle pair.
pub fn channel() -> (DeliveryPromise, DeliveryHandle) {
    let shared = Arc::new(Shared {
        state: Mutex::new(State::Pending(None)),
        ready: Condvar::new(),
    });

    (
        DeliveryPromise {
            shared: Some(Arc::clone(&shared)),
        },
        DeliveryHandle { shared },
    )
}

/// The completing side of a delivery.
///
/// Dropping a promise without completing it completes it with [`DeliveryError::Abandoned`].
pub struct DeliveryPromise {
    shared: Option<Arc<Shared>>,
}

impl DeliveryPromise {
    /// Completes the delivery with the given outcome.
    ///
    /// If a continuation was registered on the handle, it runs on the calling thread before this method returns.
    pub fn complete(mut self, outcome: DeliveryOutcome) {
        if let Some(shared) = self.shared.take() {
            shared.complete(outcome);
        }
    }
}

impl Drop for DeliveryPromise {
    fn drop(&mut self) {
        if let Some(shared) = self.shared.take() {
            shared.complete(DeliveryOutcome::Failure(DeliveryError::Abandoned));
        }
    }
}

impl fmt::Debug for DeliveryPromise {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeliveryPromise")
            .field("completed", &self.shared.is_none())
            .finish()
    }
}

/// The waiting side of a delivery.
pub struct DeliveryHandle {
    shared: Arc<Shared>,
}

impl DeliveryHandle {
    /// Blocks the calling thread until the delivery completes, and returns its outcome.
    pub fn wait(self) -> DeliveryOutcome {
        let mut state = self.shared.lock_state();
        loop {
            if let State::Complete(outcome) = &mut *state {
                if let Some(outcome) = outcome.take() {
                    return outcome;
                }
            }

            state = self.shared.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Registers a continuation to run with the outcome of the delivery.
    ///
    /// The continuation runs on the thread that completes the promise. If the delivery has already completed, it runs
    /// immediately on the calling thread instead.
    pub fn on_complete<F>(self, f: F)
    where
        F: FnOnce(DeliveryOutcome) + Send + 'static,
    {
        let mut state = self.shared.lock_state();
        match &mut *state {
            State::Pending(continuation) => *continuation = Some(Box::new(f)),
            State::Complete(outcome) => {
                if let Some(outcome) = outcome.take() {
                    drop(state);
                    f(outcome);
                }
            }
        }
    }

    /// Returns the outcome if the delivery has completed, without blocking.
    ///
    /// The outcome stays with the handle, so a later [`wait`](Self::wait) or
    /// [`on_complete`](Self::on_complete) still receives it.
    pub fn try_outcome(&mut self) -> Option<DeliveryOutcome> {
        match &*self.shared.lock_state() {
            State::Complete(outcome) => outcome.clone(),
            State::Pending(_) => None,
        }
    }
}

impl fmt::Debug for DeliveryHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let complete = matches!(&*self.shared.lock_state(), State::Complete(_));
        f.debug_struct("DeliveryHandle").field("complete", &complete).finish()
    }
}
