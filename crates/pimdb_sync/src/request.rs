//! Sync requests and queue merging.

use pimdb_core::Query;

/// What a sync request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRequestKind {
    /// Pull from the remote source.
    Synchronization,
    /// Push pending local changes to the source.
    ChangeReplay,
    /// Fence: complete once everything queued before it is done.
    Flush,
}

/// One unit of work for the synchronizer.
#[derive(Debug, Clone)]
pub struct SyncRequest {
    /// What to do.
    pub kind: SyncRequestKind,
    /// Scope of the work (synchronization requests).
    pub query: Query,
    /// Caller-supplied id echoed in status notifications.
    pub request_id: Option<String>,
    /// Ask for a flush once this request completes.
    pub request_flush: bool,
}

impl SyncRequest {
    /// A pull request for the given scope.
    #[must_use]
    pub fn synchronization(query: Query) -> Self {
        Self {
            kind: SyncRequestKind::Synchronization,
            query,
            request_id: None,
            request_flush: false,
        }
    }

    /// A push request for pending local changes.
    #[must_use]
    pub fn change_replay() -> Self {
        Self {
            kind: SyncRequestKind::ChangeReplay,
            query: Query::default(),
            request_id: None,
            request_flush: false,
        }
    }

    /// A flush fence with the given token.
    #[must_use]
    pub fn flush(request_id: impl Into<String>) -> Self {
        Self {
            kind: SyncRequestKind::Flush,
            query: Query::default(),
            request_id: Some(request_id.into()),
            request_flush: false,
        }
    }

    /// Tags the request with an id.
    #[must_use]
    pub fn with_request_id(mut self, request_id: impl Into<String>) -> Self {
        self.request_id = Some(request_id.into());
        self
    }

    /// True when another queued request makes this one redundant.
    ///
    /// Two synchronizations with the same scope collapse; change
    /// replays collapse unconditionally; flushes never collapse (each
    /// token must be answered).
    #[must_use]
    pub fn is_subsumed_by(&self, other: &SyncRequest) -> bool {
        if self.kind != other.kind {
            return false;
        }
        match self.kind {
            SyncRequestKind::Flush => false,
            SyncRequestKind::ChangeReplay => true,
            SyncRequestKind::Synchronization => {
                self.query.types == other.query.types
                    && self.query.ids == other.query.ids
                    && self.query.property_filter == other.query.property_filter
            }
        }
    }
}

/// Adds a request to the queue unless an equivalent one is already
/// waiting.
pub fn merge_into_queue(request: SyncRequest, queue: &mut std::collections::VecDeque<SyncRequest>) {
    if queue.iter().any(|queued| request.is_subsumed_by(queued)) {
        tracing::debug!(kind = ?request.kind, "sync request subsumed by queued work");
        return;
    }
    queue.push_back(request);
}
