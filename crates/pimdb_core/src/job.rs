//! Completion handles for asynchronous operations.
//!
//! Every façade operation returns a [`Job`]: a handle that eventually
//! completes with `Ok`, `Err` or `Cancelled`. In the cooperative
//! single-threaded model most jobs complete before the handle is
//! returned; the handle shape stays the same so callers need not care.

use crate::error::{Error, ErrorKind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender, TryRecvError};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Terminal state of a job.
#[derive(Debug)]
pub enum JobResult<T> {
    /// Completed successfully.
    Ok(T),
    /// Completed with an error.
    Err(Error),
    /// Cancelled before completion; no callback fires after this.
    Cancelled,
}

impl<T> JobResult<T> {
    /// True if the job completed successfully.
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, JobResult::Ok(_))
    }

    /// Converts to a plain result, mapping cancellation to its error.
    pub fn into_result(self) -> crate::error::Result<T> {
        match self {
            JobResult::Ok(value) => Ok(value),
            JobResult::Err(error) => Err(error),
            JobResult::Cancelled => Err(Error::Cancelled),
        }
    }
}

/// Completion side of a pending job.
pub struct JobCompleter<T> {
    sender: Sender<JobResult<T>>,
    cancelled: Arc<AtomicBool>,
}

impl<T> JobCompleter<T> {
    /// True if the job was cancelled; the completer should stop work
    /// and acknowledge with [`JobCompleter::acknowledge_cancellation`].
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    /// Completes the job successfully.
    pub fn complete(self, value: T) {
        let _ = self.sender.send(JobResult::Ok(value));
    }

    /// Completes the job with an error.
    pub fn fail(self, error: Error) {
        let _ = self.sender.send(JobResult::Err(error));
    }

    /// Acknowledges a cancellation; the job observes `Cancelled` and
    /// no other outcome may be reported afterwards.
    pub fn acknowledge_cancellation(self) {
        let _ = self.sender.send(JobResult::Cancelled);
    }
}

/// Handle to an eventually-completing operation.
pub struct Job<T> {
    receiver: Receiver<JobResult<T>>,
    cancelled: Arc<AtomicBool>,
    /// Set once a terminal state was taken out of the channel.
    taken: Option<()>,
}

impl<T> Job<T> {
    /// Creates a pending job and its completer.
    #[must_use]
    pub fn pending() -> (Job<T>, JobCompleter<T>) {
        let (sender, receiver) = channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        (
            Job {
                receiver,
                cancelled: Arc::clone(&cancelled),
                taken: None,
            },
            JobCompleter { sender, cancelled },
        )
    }

    /// Creates an already-completed job.
    #[must_use]
    pub fn ready(value: T) -> Job<T> {
        let (job, completer) = Job::pending();
        completer.complete(value);
        job
    }

    /// Creates an already-failed job.
    #[must_use]
    pub fn failed(error: Error) -> Job<T> {
        let (job, completer) = Job::pending();
        completer.fail(error);
        job
    }

    /// Requests cancellation. The completer observes the flag at its
    /// next yield point and acknowledges.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Returns the result if the job has completed.
    pub fn poll(&mut self) -> Option<JobResult<T>> {
        if self.taken.is_some() {
            return None;
        }
        match self.receiver.try_recv() {
            Ok(result) => {
                self.taken = Some(());
                Some(result)
            }
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                self.taken = Some(());
                Some(JobResult::Err(Error::transient(
                    "job completer dropped without result",
                )))
            }
        }
    }

    /// Waits for completion, up to `timeout`.
    pub fn wait_timeout(mut self, timeout: Duration) -> JobResult<T> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(result) = self.poll() {
                return result;
            }
            if Instant::now() >= deadline {
                return JobResult::Err(Error::transient("timed out waiting for job"));
            }
            std::thread::yield_now();
        }
    }

    /// Waits for completion (tests and tooling; production callers
    /// poll from the event loop).
    pub fn wait(self) -> JobResult<T> {
        self.wait_timeout(Duration::from_secs(30))
    }
}

impl<T> std::fmt::Debug for Job<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("cancelled", &self.cancelled.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl<T> From<crate::error::Result<T>> for Job<T> {
    fn from(result: crate::error::Result<T>) -> Self {
        match result {
            Ok(value) => Job::ready(value),
            Err(error) => Job::failed(error),
        }
    }
}

impl Error {
    /// Convenience for job plumbing that reports kinds.
    #[must_use]
    pub fn is_cancellation(&self) -> bool {
        self.kind() == ErrorKind::Cancelled
    }
}
