//! The protocol-adapter seam.

use crate::error::SyncResult;
use crate::reconcile::Reconciler;
use crate::request::SyncRequest;
use pimdb_core::{Entity, Operation, Query};

/// What a protocol adapter (IMAP, CalDAV, maildir, ...) implements.
///
/// The synchronizer owns scheduling, reconciliation and write-back
/// bookkeeping; the source only fetches and applies.
pub trait RemoteSource {
    /// Name for status notifications and logs.
    fn name(&self) -> &str {
        "source"
    }

    /// Decomposes an application query into concrete requests.
    ///
    /// The default is one pull for the query as given. Sources
    /// override this to expand "give me everything" into, say, a
    /// folder listing followed by bounded per-folder fetches.
    fn get_sync_requests(&self, query: &Query) -> Vec<SyncRequest> {
        vec![SyncRequest::synchronization(query.clone())]
    }

    /// Pulls remote state for the query, reporting every fetched
    /// entity through the reconciler.
    ///
    /// # Errors
    ///
    /// A remote failure aborts this request; local state is left as
    /// the reconciler last put it.
    fn synchronize_with_source(
        &mut self,
        query: &Query,
        reconciler: &mut Reconciler<'_>,
    ) -> SyncResult<()>;

    /// Applies one committed local change to the remote side.
    ///
    /// Returns the (possibly new) remote id, or `None` when the remote
    /// object is gone (removal). The synchronizer updates the mapping
    /// accordingly.
    fn replay_change(
        &mut self,
        entity_type: &str,
        entity: &Entity,
        operation: Operation,
        old_remote_id: Option<&str>,
    ) -> SyncResult<Option<String>>;
}
