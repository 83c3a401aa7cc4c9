//! Work items and reply-channel handles.
//!
//! A [`WorkItem`] is what sits in the pending queue: the submitted request
//! plus whatever the dispatch decision needs later (reply slot, deadline,
//! delivery variant). [`ReplySlot`] is the opaque handle a worker uses to
//! answer a synchronous submitter directly.

use tokio::sync::oneshot;

use crate::clock::{Deadline, Micros};
use crate::error::PoolError;

// ── Reply slot ───────────────────────────────────────────────────────

/// Opaque reply-channel handle for a synchronous submission.
///
/// The submitter blocks on the receiving half with its own timeout; the
/// slot travels with the work item and is consumed exactly once, either by
/// the worker's reply or by the shutdown drain.
pub struct ReplySlot<Res> {
    tx: oneshot::Sender<Result<Res, PoolError>>,
}

impl<Res> ReplySlot<Res> {
    /// Create a slot and the receiver the submitter waits on.
    pub fn channel() -> (Self, oneshot::Receiver<Result<Res, PoolError>>) {
        let (tx, rx) = oneshot::channel();
        (Self { tx }, rx)
    }

    /// Whether the submitter is still waiting for a reply.
    ///
    /// Returns `false` once the submitter has dropped its receiver (local
    /// timeout elapsed, or the submitter died).
    pub fn is_live(&self) -> bool {
        !self.tx.is_closed()
    }

    /// Deliver the worker's reply. A send to a gone submitter is ignored.
    pub fn reply(self, res: Res) {
        let _ = self.tx.send(Ok(res));
    }

    /// Deliver an error instead of a reply (shutdown drain).
    pub fn fail(self, err: PoolError) {
        let _ = self.tx.send(Err(err));
    }
}

impl<Res> std::fmt::Debug for ReplySlot<Res> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplySlot")
            .field("live", &self.is_live())
            .finish()
    }
}

// ── Delivery kind ────────────────────────────────────────────────────

/// Which delivery primitive a work item uses once matched to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryKind {
    Cast,
    Call,
    Event { all_state: bool },
    SyncEvent { all_state: bool },
}

impl DeliveryKind {
    /// Stable label for logs and latency traces.
    pub fn label(&self) -> &'static str {
        match self {
            DeliveryKind::Cast => "cast",
            DeliveryKind::Call => "call",
            DeliveryKind::Event { .. } => "event",
            DeliveryKind::SyncEvent { .. } => "sync_event",
        }
    }
}

// ── Work item ────────────────────────────────────────────────────────

/// A submitted request waiting in the pending queue.
///
/// The queued entry keeps the all-state flag for both event variants, so
/// an all-state event dispatched after queueing still uses the all-state
/// delivery primitive.
pub(crate) enum WorkItem<Req, Res> {
    Cast {
        req: Req,
        enqueued_at: Micros,
    },
    Call {
        client: ReplySlot<Res>,
        req: Req,
        deadline: Deadline,
        enqueued_at: Micros,
    },
    Event {
        req: Req,
        all_state: bool,
        enqueued_at: Micros,
    },
    SyncEvent {
        client: ReplySlot<Res>,
        req: Req,
        deadline: Deadline,
        all_state: bool,
        enqueued_at: Micros,
    },
}

impl<Req, Res> WorkItem<Req, Res> {
    pub(crate) fn kind(&self) -> DeliveryKind {
        match self {
            WorkItem::Cast { .. } => DeliveryKind::Cast,
            WorkItem::Call { .. } => DeliveryKind::Call,
            WorkItem::Event { all_state, .. } => DeliveryKind::Event {
                all_state: *all_state,
            },
            WorkItem::SyncEvent { all_state, .. } => DeliveryKind::SyncEvent {
                all_state: *all_state,
            },
        }
    }

    pub(crate) fn enqueued_at(&self) -> Micros {
        match self {
            WorkItem::Cast { enqueued_at, .. }
            | WorkItem::Call { enqueued_at, .. }
            | WorkItem::Event { enqueued_at, .. }
            | WorkItem::SyncEvent { enqueued_at, .. } => *enqueued_at,
        }
    }
}
