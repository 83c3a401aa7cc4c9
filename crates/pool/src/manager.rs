//! The queue manager: the pool's single-threaded dispatch loop.
//!
//! All mutations of the idle-worker set, the pending FIFO, and the pending
//! counter happen inside one tokio task that consumes a command channel.
//! Submitters and workers are concurrent external actors; they only ever
//! send messages. The loop never blocks on anything but its own channel:
//! hand-off to a worker is an unbounded send, and synchronous submitters
//! wait on their own reply channel, never on the manager.
//!
//! Guarantees owned here:
//! - pending work is consumed in strict submission order, except that an
//!   expired or dead-client synchronous entry is dropped, not promoted;
//! - among idle workers the smallest identifier is always chosen;
//! - a worker is either idle or executing, never both;
//! - on termination every queued synchronous submitter gets a
//!   `QueueShutdown` reply and every fire-and-forget item is logged.

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use crate::clock::{self, Deadline, Micros};
use crate::config::PoolConfig;
use crate::error::PoolError;
use crate::queue::{IdleWorkers, PendingQueue};
use crate::registry::PoolRegistry;
use crate::trace::TraceSession;
use crate::work::{DeliveryKind, ReplySlot, WorkItem};
use crate::worker::{spawn_worker, Delivery, WorkRequest, WorkerId, WorkerPort};

// ── Introspection ────────────────────────────────────────────────────

/// Snapshot returned by `worker_counts`: idle workers and queued items.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerCounts {
    pub idle: usize,
    pub pending: usize,
}

// ── Commands ─────────────────────────────────────────────────────────

/// Everything the dispatch loop reacts to: work submissions from callers
/// and lifecycle notifications from workers.
enum Command<Req, Res> {
    Cast {
        req: Req,
    },
    Event {
        req: Req,
        all_state: bool,
    },
    Call {
        client: ReplySlot<Res>,
        req: Req,
        deadline: Deadline,
    },
    SyncEvent {
        client: ReplySlot<Res>,
        req: Req,
        deadline: Deadline,
        all_state: bool,
    },
    NewWorker {
        port: WorkerPort<Req, Res>,
    },
    WorkerReady {
        id: WorkerId,
    },
    WorkerBusy {
        id: WorkerId,
    },
    WorkerDead {
        id: WorkerId,
    },
    WorkerCounts {
        reply: oneshot::Sender<WorkerCounts>,
    },
    AttachTrace {
        session: TraceSession,
    },
    Shutdown {
        reason: String,
    },
}

// ── Handle ───────────────────────────────────────────────────────────

/// Clonable submitter-side handle to a pool's queue manager.
pub struct PoolHandle<Req, Res> {
    name: Arc<str>,
    born: DateTime<Utc>,
    tx: mpsc::UnboundedSender<Command<Req, Res>>,
}

impl<Req, Res> Clone for PoolHandle<Req, Res> {
    fn clone(&self) -> Self {
        Self {
            name: self.name.clone(),
            born: self.born,
            tx: self.tx.clone(),
        }
    }
}

impl<Req, Res> std::fmt::Debug for PoolHandle<Req, Res> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolHandle")
            .field("pool", &self.name)
            .field("born", &self.born)
            .finish()
    }
}

impl<Req, Res> PoolHandle<Req, Res>
where
    Req: Send + Debug + 'static,
    Res: Send + 'static,
{
    pub fn name(&self) -> &str {
        &self.name
    }

    /// When the queue manager was created.
    pub fn born(&self) -> DateTime<Utc> {
        self.born
    }

    // ── Work submissions ─────────────────────────────────────────

    /// Fire-and-forget: hand `req` to the first available worker, queueing
    /// it if every worker is busy. Never blocks.
    pub fn cast_to_available_worker(&self, req: Req) -> Result<(), PoolError> {
        self.send(Command::Cast { req })
    }

    /// Fire-and-forget event delivery to the first available worker.
    pub fn send_event_to_available_worker(&self, req: Req) -> Result<(), PoolError> {
        self.send(Command::Event {
            req,
            all_state: false,
        })
    }

    /// All-state variant of [`send_event_to_available_worker`]; the
    /// variant survives queueing.
    ///
    /// [`send_event_to_available_worker`]: Self::send_event_to_available_worker
    pub fn send_all_event_to_available_worker(&self, req: Req) -> Result<(), PoolError> {
        self.send(Command::Event {
            req,
            all_state: true,
        })
    }

    /// Synchronous call: wait up to `timeout` for a worker's reply.
    ///
    /// `None` means wait forever. The same timeout becomes the queued
    /// entry's deadline, checked lazily when a worker frees up; the local
    /// wait elapsing yields [`PoolError::Timeout`] without removing the
    /// entry.
    pub async fn call_available_worker(
        &self,
        req: Req,
        timeout: Option<Duration>,
    ) -> Result<Res, PoolError> {
        let deadline = Deadline::from_timeout(clock::now_micros(), timeout);
        let (client, rx) = ReplySlot::channel();
        self.send(Command::Call {
            client,
            req,
            deadline,
        })?;
        Self::await_reply(rx, timeout).await
    }

    /// Synchronous event delivery with a reply.
    pub async fn sync_send_event_to_available_worker(
        &self,
        req: Req,
        timeout: Option<Duration>,
    ) -> Result<Res, PoolError> {
        self.sync_event(req, timeout, false).await
    }

    /// All-state variant of [`sync_send_event_to_available_worker`].
    ///
    /// [`sync_send_event_to_available_worker`]: Self::sync_send_event_to_available_worker
    pub async fn sync_send_all_event_to_available_worker(
        &self,
        req: Req,
        timeout: Option<Duration>,
    ) -> Result<Res, PoolError> {
        self.sync_event(req, timeout, true).await
    }

    async fn sync_event(
        &self,
        req: Req,
        timeout: Option<Duration>,
        all_state: bool,
    ) -> Result<Res, PoolError> {
        let deadline = Deadline::from_timeout(clock::now_micros(), timeout);
        let (client, rx) = ReplySlot::channel();
        self.send(Command::SyncEvent {
            client,
            req,
            deadline,
            all_state,
        })?;
        Self::await_reply(rx, timeout).await
    }

    async fn await_reply(
        rx: oneshot::Receiver<Result<Res, PoolError>>,
        timeout: Option<Duration>,
    ) -> Result<Res, PoolError> {
        match timeout {
            Some(t) => match tokio::time::timeout(t, rx).await {
                Ok(Ok(result)) => result,
                Ok(Err(_)) => Err(PoolError::ManagerGone),
                Err(_) => Err(PoolError::Timeout(t)),
            },
            None => rx.await.unwrap_or(Err(PoolError::ManagerGone)),
        }
    }

    // ── Worker lifecycle ─────────────────────────────────────────

    /// Introduce a worker to the pool; equivalent to an immediate
    /// `worker_ready`.
    pub fn new_worker(&self, port: WorkerPort<Req, Res>) -> Result<(), PoolError> {
        self.send(Command::NewWorker { port })
    }

    /// The worker finished its item and can accept work again.
    pub fn worker_ready(&self, id: WorkerId) -> Result<(), PoolError> {
        self.send(Command::WorkerReady { id })
    }

    /// The worker started executing outside the pool's dispatch; no-op if
    /// it was not idle.
    pub fn worker_busy(&self, id: WorkerId) -> Result<(), PoolError> {
        self.send(Command::WorkerBusy { id })
    }

    /// The worker is gone; no-op if unknown. Queued work is untouched —
    /// assignment only ever happens at dispatch time.
    pub fn worker_dead(&self, id: WorkerId) -> Result<(), PoolError> {
        self.send(Command::WorkerDead { id })
    }

    // ── Introspection & control ──────────────────────────────────

    /// Idle-worker and pending-queue counts. O(1) on the manager side.
    pub async fn worker_counts(&self) -> Result<WorkerCounts, PoolError> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::WorkerCounts { reply: tx })?;
        rx.await.map_err(|_| PoolError::ManagerGone)
    }

    /// Attach a latency tracing session; replaces any active one. The
    /// manager detaches it on its own once the window elapses.
    pub fn attach_trace(&self, session: TraceSession) -> Result<(), PoolError> {
        self.send(Command::AttachTrace { session })
    }

    /// Terminate the manager: pending synchronous submitters receive
    /// `QueueShutdown(reason)`, fire-and-forget items are logged and lost.
    pub fn shutdown(&self, reason: impl Into<String>) -> Result<(), PoolError> {
        self.send(Command::Shutdown {
            reason: reason.into(),
        })
    }

    fn send(&self, cmd: Command<Req, Res>) -> Result<(), PoolError> {
        self.tx.send(cmd).map_err(|_| PoolError::ManagerGone)
    }
}

// ── Queue manager ────────────────────────────────────────────────────

/// Owner of the dispatch state. Constructed via [`QueueManager::spawn`],
/// which moves it into its own task.
pub struct QueueManager<Req, Res> {
    name: Arc<str>,
    idle: IdleWorkers,
    pending: PendingQueue<Req, Res>,
    ports: HashMap<WorkerId, WorkerPort<Req, Res>>,
    tracer: Option<TraceSession>,
}

impl<Req, Res> QueueManager<Req, Res>
where
    Req: Send + Debug + 'static,
    Res: Send + 'static,
{
    /// Spawn the dispatch loop for a new pool and return the handle.
    pub fn spawn(pool_name: impl Into<String>) -> PoolHandle<Req, Res> {
        let name: Arc<str> = pool_name.into().into();
        let (tx, rx) = mpsc::unbounded_channel();

        let manager = QueueManager {
            name: name.clone(),
            idle: IdleWorkers::new(),
            pending: PendingQueue::new(),
            ports: HashMap::new(),
            tracer: None,
        };
        tokio::spawn(manager.run(rx));

        info!(pool = %name, "queue manager started");
        PoolHandle {
            name,
            born: Utc::now(),
            tx,
        }
    }

    /// The dispatch loop: one command processed to completion at a time.
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<Command<Req, Res>>) {
        while let Some(cmd) = rx.recv().await {
            match cmd {
                Command::Cast { req } => self.on_cast(req),
                Command::Event { req, all_state } => self.on_event(req, all_state),
                Command::Call {
                    client,
                    req,
                    deadline,
                } => self.on_call(client, req, deadline),
                Command::SyncEvent {
                    client,
                    req,
                    deadline,
                    all_state,
                } => self.on_sync_event(client, req, deadline, all_state),
                Command::NewWorker { port } => self.on_new_worker(port),
                Command::WorkerReady { id } => self.on_worker_ready(id),
                Command::WorkerBusy { id } => {
                    self.idle.remove(&id);
                }
                Command::WorkerDead { id } => self.on_worker_dead(id),
                Command::WorkerCounts { reply } => {
                    let _ = reply.send(WorkerCounts {
                        idle: self.idle.len(),
                        pending: self.pending.count(),
                    });
                }
                Command::AttachTrace { session } => {
                    info!(pool = %self.name, session = %session.id(), "trace session attached");
                    self.tracer = Some(session);
                }
                Command::Shutdown { reason } => {
                    rx.close();
                    self.drain(&reason);
                    return;
                }
            }

            // A worker cannot idle while work waits.
            debug_assert!(self.pending.is_empty() || self.idle.is_empty());
        }

        self.drain("all pool handles dropped");
    }

    // ── Submission handlers ──────────────────────────────────────

    fn on_cast(&mut self, req: Req) {
        match self.next_idle_port() {
            Some((_, port)) => {
                self.trace(DeliveryKind::Cast, 0);
                self.deliver(port, Delivery::Cast { req });
            }
            None => self.pending.push(WorkItem::Cast {
                req,
                enqueued_at: clock::now_micros(),
            }),
        }
    }

    fn on_event(&mut self, req: Req, all_state: bool) {
        match self.next_idle_port() {
            Some((_, port)) => {
                self.trace(DeliveryKind::Event { all_state }, 0);
                self.deliver(port, Delivery::Event { req, all_state });
            }
            None => self.pending.push(WorkItem::Event {
                req,
                all_state,
                enqueued_at: clock::now_micros(),
            }),
        }
    }

    fn on_call(&mut self, client: ReplySlot<Res>, req: Req, deadline: Deadline) {
        let now = clock::now_micros();
        match self.next_idle_port() {
            Some((id, port)) => {
                if client.is_live() && !deadline.is_expired(now) {
                    self.trace(DeliveryKind::Call, 0);
                    self.deliver(port, Delivery::Call { client, req });
                } else {
                    // The worker was never handed anything; it stays idle.
                    info!(pool = %self.name, payload = ?req, "dropping dead or expired call at dispatch");
                    self.idle.insert(id);
                }
            }
            None => self.pending.push(WorkItem::Call {
                client,
                req,
                deadline,
                enqueued_at: now,
            }),
        }
    }

    fn on_sync_event(
        &mut self,
        client: ReplySlot<Res>,
        req: Req,
        deadline: Deadline,
        all_state: bool,
    ) {
        let now = clock::now_micros();
        match self.next_idle_port() {
            Some((id, port)) => {
                if client.is_live() && !deadline.is_expired(now) {
                    self.trace(DeliveryKind::SyncEvent { all_state }, 0);
                    self.deliver(
                        port,
                        Delivery::SyncEvent {
                            client,
                            req,
                            all_state,
                        },
                    );
                } else {
                    info!(pool = %self.name, payload = ?req, "dropping dead or expired sync event at dispatch");
                    self.idle.insert(id);
                }
            }
            None => self.pending.push(WorkItem::SyncEvent {
                client,
                req,
                deadline,
                all_state,
                enqueued_at: now,
            }),
        }
    }

    // ── Lifecycle handlers ───────────────────────────────────────

    fn on_new_worker(&mut self, port: WorkerPort<Req, Res>) {
        let id = port.id().clone();
        if self.ports.insert(id.clone(), port).is_some() {
            debug!(pool = %self.name, worker = %id, "replacing port of known worker");
        }
        info!(pool = %self.name, worker = %id, "new worker");
        self.on_worker_ready(id);
    }

    /// The central matching rule: pair the freed worker with the head of
    /// the pending queue, dropping expired or abandoned synchronous
    /// entries along the way. Each iteration consumes exactly one pending
    /// entry, so the loop runs at most `pending_count` times before the
    /// worker either receives an item or goes idle.
    fn on_worker_ready(&mut self, id: WorkerId) {
        let Some(port) = self.ports.get(&id).cloned() else {
            warn!(pool = %self.name, worker = %id, "ready from unknown worker ignored");
            return;
        };
        if self.idle.contains(&id) {
            // Duplicate ready; the queue is necessarily empty already.
            debug!(pool = %self.name, worker = %id, "ready from already idle worker");
            return;
        }

        loop {
            let Some(item) = self.pending.pop() else {
                self.idle.insert(id);
                break;
            };

            let now = clock::now_micros();
            let kind = item.kind();
            let wait = now - item.enqueued_at();

            match item {
                WorkItem::Cast { req, .. } => {
                    self.trace(kind, wait);
                    self.deliver(port, Delivery::Cast { req });
                    break;
                }
                WorkItem::Event { req, all_state, .. } => {
                    self.trace(kind, wait);
                    self.deliver(port, Delivery::Event { req, all_state });
                    break;
                }
                WorkItem::Call {
                    client,
                    req,
                    deadline,
                    ..
                } => {
                    if client.is_live() && !deadline.is_expired(now) {
                        self.trace(kind, wait);
                        self.deliver(port, Delivery::Call { client, req });
                        break;
                    }
                    info!(pool = %self.name, payload = ?req, "dropping dead or expired call at match");
                }
                WorkItem::SyncEvent {
                    client,
                    req,
                    deadline,
                    all_state,
                    ..
                } => {
                    if client.is_live() && !deadline.is_expired(now) {
                        self.trace(kind, wait);
                        self.deliver(
                            port,
                            Delivery::SyncEvent {
                                client,
                                req,
                                all_state,
                            },
                        );
                        break;
                    }
                    info!(pool = %self.name, payload = ?req, "dropping dead or expired sync event at match");
                }
            }
        }
    }

    fn on_worker_dead(&mut self, id: WorkerId) {
        self.idle.remove(&id);
        if self.ports.remove(&id).is_some() {
            info!(pool = %self.name, worker = %id, "worker dead");
        }
    }

    // ── Helpers ──────────────────────────────────────────────────

    /// Take the smallest idle worker that still has a usable port.
    fn next_idle_port(&mut self) -> Option<(WorkerId, WorkerPort<Req, Res>)> {
        while let Some(id) = self.idle.take_smallest() {
            match self.ports.get(&id) {
                Some(port) => return Some((id, port.clone())),
                None => {
                    debug!(pool = %self.name, worker = %id, "idle worker without a port, skipping")
                }
            }
        }
        None
    }

    fn deliver(&mut self, port: WorkerPort<Req, Res>, delivery: Delivery<Req, Res>) {
        if !port.deliver(delivery) {
            // The item is lost; a synchronous submitter will observe its
            // local timeout.
            warn!(pool = %self.name, worker = %port.id(), "delivery to dead worker lost");
            self.ports.remove(port.id());
        }
    }

    fn trace(&mut self, kind: DeliveryKind, wait_micros: Micros) {
        let expired = match &self.tracer {
            Some(session) => !session.record(kind.label(), wait_micros),
            None => return,
        };
        if expired {
            if let Some(session) = self.tracer.take() {
                info!(pool = %self.name, session = %session.id(), "trace session expired, detaching");
            }
        }
    }

    /// Drain the pending queue head-first on termination.
    fn drain(mut self, reason: &str) {
        info!(
            pool = %self.name,
            reason,
            pending = self.pending.count(),
            "queue manager terminating"
        );

        while let Some(item) = self.pending.pop() {
            match item {
                WorkItem::Cast { req, .. } => {
                    info!(pool = %self.name, reason, payload = ?req, "cast lost on terminate");
                }
                WorkItem::Event { req, .. } => {
                    info!(pool = %self.name, reason, payload = ?req, "event lost on terminate");
                }
                WorkItem::Call { client, .. } | WorkItem::SyncEvent { client, .. } => {
                    client.fail(PoolError::QueueShutdown(reason.to_string()));
                }
            }
        }
    }
}

// ── Pool setup glue ──────────────────────────────────────────────────

/// Start a pool from a config: spawn the manager, `config.workers` workers
/// running `handler`, and optionally register the pool for introspection.
pub async fn start_pool<Req, Res, F, Fut>(
    config: &PoolConfig,
    registry: Option<&PoolRegistry>,
    handler: F,
) -> Result<PoolHandle<Req, Res>, PoolError>
where
    Req: Send + Debug + 'static,
    Res: Send + 'static,
    F: FnMut(WorkRequest<Req>) -> Fut + Clone + Send + 'static,
    Fut: Future<Output = Res> + Send + 'static,
{
    config.validate()?;

    let handle = QueueManager::spawn(config.name.clone());
    for n in 1..=config.workers {
        spawn_worker(
            &handle,
            WorkerId::numbered(&config.name, n),
            handler.clone(),
        )?;
    }

    if let Some(registry) = registry {
        registry
            .register(config.workers, Arc::new(handle.clone()))
            .await;
    }

    Ok(handle)
}
