//! Output collectors.

use std::{
    sync::{Condvar, Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use sluice_error::GenericError;

use crate::record::{Record, RecordId};

/// Receives the disposition of each record handled by a bolt.
///
/// Collectors can be signaled from the bolt's processing thread and from the broker client's I/O thread, possibly at
/// the same time, so implementations must be thread-safe.
pub trait OutputCollector: Send + Sync {
    /// Marks the record as fully processed.
    fn ack(&self, record: &Record);

    /// Marks the record as failed, so that the pipeline can replay it.
    fn fail(&self, record: &Record);

    /// Reports a processing error.
    fn report_error(&self, error: &GenericError);
}

/// A single-threaded collector.
///
/// Wrap it in [`Synchronized`] to use it as an [`OutputCollector`].
pub trait RecordCollector: Send {
    /// Marks the record as fully processed.
    fn ack(&mut self, record: &Record);

    /// Marks the record as failed.
    fn fail(&mut self, record: &Record);

    /// Reports a processing error.
    fn report_error(&mut self, error: &GenericError);
}

/// Serializes access to a [`RecordCollector`].
pub struct Synchronized<C> {
    inner: Mutex<C>,
}

impl<C> Synchronized<C> {
    /// Creates a new `Synchronized` wrapper.
    pub fn new(collector: C) -> Self {
        Self {
            inner: Mutex::new(collector),
        }
    }

    /// Consumes the wrapper, returning the inner collector.
    pub fn into_inner(self) -> C {
        self.inner.into_inner().unwrap_or_else(PoisonError::into_inner)
    }

    fn lock(&self) -> MutexGuard<'_, C> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl<C: RecordCollector> OutputCollector for Synchronized<C> {
    fn ack(&self, record: &Record) {
        self.lock().ack(record);
    }

    fn fail(&self, record: &Record) {
        self.lock().fail(record);
    }

    fn report_error(&self, error: &GenericError) {
        self.lock().report_error(error);
    }
}

/// Final disposition of a record.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Disposition {
    /// The record was acknowledged.
    Acked(RecordId),

    /// The record was failed.
    Failed(RecordId),
}

impl Disposition {
    /// Returns the identity of the record.
    pub fn record_id(&self) -> RecordId {
        match self {
            Disposition::Acked(id) | Disposition::Failed(id) => *id,
        }
    }
}

#[derive(Default)]
struct Recorded {
    dispositions: Vec<Disposition>,
    errors: Vec<String>,
}

/// A collector that records everything it receives.
///
/// Mostly useful for tests: [`wait_for`](Self::wait_for) lets a test block until completions arriving on another
/// thread have been recorded.
#[derive(Default)]
pub struct RecordingCollector {
    recorded: Mutex<Recorded>,
    changed: Condvar,
}

impl RecordingCollector {
    /// Creates a new, empty `RecordingCollector`.
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Recorded> {
        self.recorded.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn record(&self, disposition: Disposition) {
        self.lock().dispositions.push(disposition);
        self.changed.notify_all();
    }

    /// Returns every disposition, in the order received.
    pub fn dispositions(&self) -> Vec<Disposition> {
        self.lock().dispositions.clone()
    }

    /// Returns the identities of acknowledged records, in the order received.
    pub fn acked(&self) -> Vec<RecordId> {
        self.lock()
            .dispositions
            .iter()
            .filter_map(|d| match d {
                Disposition::Acked(id) => Some(*id),
                Disposition::Failed(_) => None,
            })
            .collect()
    }

    /// Returns the identities of failed records, in the order received.
    pub fn failed(&self) -> Vec<RecordId> {
        self.lock()
            .dispositions
            .iter()
            .filter_map(|d| match d {
                Disposition::Failed(id) => Some(*id),
                Disposition::Acked(_) => None,
            })
            .collect()
    }

    /// Returns the messages of every reported error, including their causes.
    pub fn errors(&self) -> Vec<String> {
        self.lock().errors.clone()
    }

    /// Waits until at least `count` dispositions have been recorded.
    ///
    /// Returns `false` if the timeout elapsed first.
    pub fn wait_for(&self, count: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut recorded = self.lock();
        while recorded.dispositions.len() < count {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }

            recorded = self
                .changed
                .wait_timeout(recorded, remaining)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        true
    }
}

impl OutputCollector for RecordingCollector {
    fn ack(&self, record: &Record) {
        self.record(Disposition::Acked(record.id()));
    }

    fn fail(&self, record: &Record) {
        self.record(Disposition::Failed(record.id()));
    }

    fn report_error(&self, error: &GenericError) {
        self.lock().errors.push(format!("{:#}", error));
    }
}
