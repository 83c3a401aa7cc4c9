//! Worker identity, delivery port, and the per-worker runtime glue.
//!
//! The queue manager never executes work itself: it hands a [`Delivery`]
//! to a worker's port. [`spawn_worker`] is the bundled runtime — a task
//! that wraps a user-supplied async handler, replies to synchronous
//! submitters through their [`ReplySlot`], and reports its own lifecycle
//! transitions back to the manager.

use std::fmt;
use std::future::Future;
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::PoolError;
use crate::manager::PoolHandle;
use crate::work::{DeliveryKind, ReplySlot};

// ── Worker identity ──────────────────────────────────────────────────

/// Opaque, totally-ordered worker name.
///
/// Names are unique within a pool, so ordering ties never occur; the
/// manager uses the ordering to pick a deterministic "smallest" idle
/// worker.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WorkerId(Arc<str>);

impl WorkerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into().into())
    }

    /// Conventional `pool-N` name for the nth worker of a pool.
    pub fn numbered(pool: &str, n: usize) -> Self {
        Self::new(format!("{pool}-{n}"))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Delivery ─────────────────────────────────────────────────────────

/// A matched work item, as handed to a worker.
///
/// Synchronous variants carry the submitter's [`ReplySlot`] directly: the
/// worker answers the client without going back through the dispatch loop.
pub enum Delivery<Req, Res> {
    /// Fire-and-forget request.
    Cast { req: Req },
    /// Synchronous request; reply through `client`.
    Call { client: ReplySlot<Res>, req: Req },
    /// Fire-and-forget event for a state-machine worker.
    Event { req: Req, all_state: bool },
    /// Synchronous event; reply through `client`.
    SyncEvent {
        client: ReplySlot<Res>,
        req: Req,
        all_state: bool,
    },
}

impl<Req, Res> Delivery<Req, Res> {
    pub fn kind(&self) -> DeliveryKind {
        match self {
            Delivery::Cast { .. } => DeliveryKind::Cast,
            Delivery::Call { .. } => DeliveryKind::Call,
            Delivery::Event { all_state, .. } => DeliveryKind::Event {
                all_state: *all_state,
            },
            Delivery::SyncEvent { all_state, .. } => DeliveryKind::SyncEvent {
                all_state: *all_state,
            },
        }
    }
}

// ── Worker port ──────────────────────────────────────────────────────

/// The manager's handle to one worker: an identity plus a non-blocking
/// delivery channel.
pub struct WorkerPort<Req, Res> {
    id: WorkerId,
    tx: mpsc::UnboundedSender<Delivery<Req, Res>>,
}

impl<Req, Res> WorkerPort<Req, Res> {
    /// Create a port and the receiving half the worker consumes.
    pub fn channel(id: WorkerId) -> (Self, mpsc::UnboundedReceiver<Delivery<Req, Res>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { id, tx }, rx)
    }

    pub fn id(&self) -> &WorkerId {
        &self.id
    }

    /// Hand a delivery to the worker. Never blocks.
    ///
    /// Returns `false` if the worker's receiving half is gone (the worker
    /// died without its `worker_dead` notification reaching the manager yet).
    pub fn deliver(&self, delivery: Delivery<Req, Res>) -> bool {
        self.tx.send(delivery).is_ok()
    }
}

impl<Req, Res> Clone for WorkerPort<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            id: self.id.clone(),
            tx: self.tx.clone(),
        }
    }
}

impl<Req, Res> fmt::Debug for WorkerPort<Req, Res> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WorkerPort").field("id", &self.id).finish()
    }
}

// ── Runtime glue ─────────────────────────────────────────────────────

/// A delivery as seen by a [`spawn_worker`] handler: the request plus the
/// delivery variant it arrived through.
#[derive(Debug)]
pub struct WorkRequest<Req> {
    pub req: Req,
    pub kind: DeliveryKind,
}

/// Spawn a worker task that services deliveries with `handler`.
///
/// The worker announces itself via `new_worker`, reports `worker_ready`
/// after every serviced item, and `worker_dead` when its delivery channel
/// closes. Synchronous deliveries are answered through the submitter's
/// reply slot; fire-and-forget results are discarded.
pub fn spawn_worker<Req, Res, F, Fut>(
    pool: &PoolHandle<Req, Res>,
    id: WorkerId,
    mut handler: F,
) -> Result<JoinHandle<()>, PoolError>
where
    Req: Send + std::fmt::Debug + 'static,
    Res: Send + 'static,
    F: FnMut(WorkRequest<Req>) -> Fut + Send + 'static,
    Fut: Future<Output = Res> + Send + 'static,
{
    let (port, mut deliveries) = WorkerPort::channel(id.clone());
    pool.new_worker(port)?;

    let pool = pool.clone();
    Ok(tokio::spawn(async move {
        while let Some(delivery) = deliveries.recv().await {
            let kind = delivery.kind();
            match delivery {
                Delivery::Cast { req } | Delivery::Event { req, .. } => {
                    handler(WorkRequest { req, kind }).await;
                }
                Delivery::Call { client, req } | Delivery::SyncEvent { client, req, .. } => {
                    let res = handler(WorkRequest { req, kind }).await;
                    client.reply(res);
                }
            }

            if pool.worker_ready(id.clone()).is_err() {
                // Manager is gone; nothing left to serve.
                break;
            }
        }

        let _ = pool.worker_dead(id.clone());
        debug!(worker = %id, "worker loop ended");
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn worker_ids_order_by_name() {
        let w1 = WorkerId::numbered("pool", 1);
        let w2 = WorkerId::numbered("pool", 2);
        assert!(w1 < w2);
        assert_eq!(w1.as_str(), "pool-1");
        assert_eq!(w1.to_string(), "pool-1");
    }

    #[test]
    fn port_delivery_reaches_receiver() {
        let (port, mut rx) = WorkerPort::<&str, ()>::channel(WorkerId::new("w"));
        assert!(port.deliver(Delivery::Cast { req: "job" }));
        match rx.try_recv().unwrap() {
            Delivery::Cast { req } => assert_eq!(req, "job"),
            _ => panic!("expected Cast"),
        }
    }

    #[test]
    fn port_reports_dead_receiver() {
        let (port, rx) = WorkerPort::<(), ()>::channel(WorkerId::new("w"));
        drop(rx);
        assert!(!port.deliver(Delivery::Cast { req: () }));
    }
}
