//! Notification fan-out.
//!
//! The resource emits notifications for committed revisions, flush
//! completion, status transitions and errors. Subscribers receive
//! every notification emitted after they subscribe, in order.

use crate::error::ErrorKind;
use crate::key::{Identifier, Revision};
use parking_lot::RwLock;
use std::sync::mpsc::{channel, Receiver, Sender};

/// Coarse activity state reported by the synchronizer and resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    /// Nothing in flight.
    Idle,
    /// A request is being processed.
    Busy,
    /// The last request failed.
    Error,
}

/// A notification delivered to subscribers.
#[derive(Debug, Clone)]
pub enum Notification {
    /// A commit raised the maximum revision.
    RevisionUpdated(Revision),
    /// Both message queues drained.
    PipelinesDrained,
    /// Every replay consumer advanced past the flush token.
    FlushComplete {
        /// The token the client submitted.
        flush_id: String,
    },
    /// A status transition, optionally tied to a request.
    Status {
        /// New status.
        status: Status,
        /// Human-readable reason.
        message: String,
        /// The request that caused the transition, if any.
        request_id: Option<String>,
    },
    /// Progress of a long-running request.
    Progress {
        /// Completed units.
        done: usize,
        /// Total units, when known.
        total: usize,
        /// Entities the progress applies to.
        entities: Vec<Identifier>,
    },
    /// A surfaced error.
    Error {
        /// Classification.
        kind: ErrorKind,
        /// Human-readable description.
        message: String,
    },
}

/// Distributes notifications to any number of subscribers.
///
/// Disconnected subscribers are dropped at the next emission.
#[derive(Default)]
pub struct Notifier {
    subscribers: RwLock<Vec<Sender<Notification>>>,
}

impl Notifier {
    /// Creates a notifier with no subscribers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Subscribes; the receiver sees all future notifications.
    pub fn subscribe(&self) -> Receiver<Notification> {
        let (sender, receiver) = channel();
        self.subscribers.write().push(sender);
        receiver
    }

    /// Emits one notification to every live subscriber.
    pub fn emit(&self, notification: &Notification) {
        let mut subscribers = self.subscribers.write();
        subscribers.retain(|sender| sender.send(notification.clone()).is_ok());
    }

    /// Number of live subscribers (after the last emission).
    #[must_use]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }
}

impl std::fmt::Debug for Notifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Notifier")
            .field("subscribers", &self.subscriber_count())
            .finish()
    }
}
