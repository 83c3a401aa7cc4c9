//! Integration tests for the dispatch loop: immediate dispatch, queueing
//! order, deadline handling, tie-breaks, and worker lifecycle.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, Notify};

use rangier_pool::{
    spawn_worker, Delivery, DeliveryKind, PoolError, PoolHandle, QueueManager, WorkRequest,
    WorkerId, WorkerPort,
};

const SETTLE: Duration = Duration::from_millis(50);
const TIMEOUT: Duration = Duration::from_secs(5);

/// Poll until the pool reports the expected counts.
async fn wait_for_counts<Req, Res>(pool: &PoolHandle<Req, Res>, idle: usize, pending: usize)
where
    Req: Send + std::fmt::Debug + 'static,
    Res: Send + 'static,
{
    for _ in 0..200 {
        let counts = pool.worker_counts().await.unwrap();
        if counts.idle == idle && counts.pending == pending {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("pool never reached idle={idle} pending={pending}");
}

#[tokio::test]
async fn immediate_dispatch_round_trip() {
    let pool = QueueManager::<&'static str, &'static str>::spawn("ping-pool");
    spawn_worker(&pool, WorkerId::new("w1"), |incoming: WorkRequest<&'static str>| {
        async move {
            assert_eq!(incoming.req, "ping");
            "pong"
        }
    })
    .unwrap();
    wait_for_counts(&pool, 1, 0).await;

    let reply = pool
        .call_available_worker("ping", Some(TIMEOUT))
        .await
        .unwrap();
    assert_eq!(reply, "pong");

    // After the worker reports ready it is idle again.
    wait_for_counts(&pool, 1, 0).await;
}

#[tokio::test]
async fn worker_is_not_idle_while_executing() {
    let pool = QueueManager::<&'static str, &'static str>::spawn("busy-pool");

    let gate = Arc::new(Notify::new());
    let worker_gate = gate.clone();
    spawn_worker(&pool, WorkerId::new("w1"), move |incoming: WorkRequest<&'static str>| {
        let gate = worker_gate.clone();
        async move {
            gate.notified().await;
            incoming.req
        }
    })
    .unwrap();
    wait_for_counts(&pool, 1, 0).await;

    let caller = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.call_available_worker("job", Some(TIMEOUT)).await })
    };
    tokio::time::sleep(SETTLE).await;

    let counts = pool.worker_counts().await.unwrap();
    assert_eq!(counts.idle, 0, "executing worker must not be idle");
    assert_eq!(counts.pending, 0);

    gate.notify_one();
    assert_eq!(caller.await.unwrap().unwrap(), "job");
    wait_for_counts(&pool, 1, 0).await;
}

#[tokio::test]
async fn queued_work_dispatches_in_submission_order() {
    let pool = QueueManager::<&'static str, ()>::spawn("queue-pool");

    pool.cast_to_available_worker("A").unwrap();
    pool.cast_to_available_worker("B").unwrap();
    pool.cast_to_available_worker("C").unwrap();

    let counts = pool.worker_counts().await.unwrap();
    assert_eq!(counts.pending, 3);
    assert_eq!(counts.idle, 0);

    let id = WorkerId::new("w1");
    let (port, mut deliveries) = WorkerPort::channel(id.clone());
    pool.new_worker(port).unwrap();

    for expected in ["A", "B", "C"] {
        match tokio::time::timeout(TIMEOUT, deliveries.recv()).await.unwrap() {
            Some(Delivery::Cast { req }) => assert_eq!(req, expected),
            other => panic!("expected Cast {expected:?}, got {:?}", other.map(|d| d.kind())),
        }
        let counts = pool.worker_counts().await.unwrap();
        // No worker may idle while work still waits.
        assert_eq!(counts.idle, 0);
        if expected != "C" {
            pool.worker_ready(id.clone()).unwrap();
        }
    }

    pool.worker_ready(id.clone()).unwrap();
    wait_for_counts(&pool, 1, 0).await;
}

#[tokio::test]
async fn queued_entries_drain_through_one_worker() {
    let pool = QueueManager::<u32, ()>::spawn("drain-order-pool");
    for n in 1..=5 {
        pool.cast_to_available_worker(n).unwrap();
    }

    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    spawn_worker(&pool, WorkerId::new("w1"), move |incoming: WorkRequest<u32>| {
        let sink = sink.clone();
        async move {
            sink.lock().await.push(incoming.req);
        }
    })
    .unwrap();

    wait_for_counts(&pool, 1, 0).await;
    assert_eq!(*seen.lock().await, vec![1, 2, 3, 4, 5]);
}

#[tokio::test]
async fn expired_call_is_dropped_at_match_time() {
    let pool = QueueManager::<&'static str, &'static str>::spawn("deadline-pool");

    let caller = {
        let pool = pool.clone();
        tokio::spawn(async move {
            pool.call_available_worker("X", Some(Duration::from_millis(10)))
                .await
        })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    // The caller already observed its local timeout...
    match caller.await.unwrap() {
        Err(PoolError::Timeout(t)) => assert_eq!(t, Duration::from_millis(10)),
        other => panic!("expected Timeout, got {other:?}"),
    }
    // ...but the entry is still queued.
    assert_eq!(pool.worker_counts().await.unwrap().pending, 1);

    let (port, mut deliveries) = WorkerPort::channel(WorkerId::new("w1"));
    pool.new_worker(port).unwrap();

    // The expired entry is dropped, nothing reaches the worker, and the
    // worker ends up idle.
    wait_for_counts(&pool, 1, 0).await;
    assert!(deliveries.try_recv().is_err());
}

#[tokio::test]
async fn infinite_timeout_never_expires() {
    let pool = QueueManager::<&'static str, &'static str>::spawn("forever-pool");

    let caller = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.call_available_worker("X", None).await })
    };
    tokio::time::sleep(SETTLE).await;

    let id = WorkerId::new("w1");
    let (port, mut deliveries) = WorkerPort::channel(id.clone());
    pool.new_worker(port).unwrap();

    match tokio::time::timeout(TIMEOUT, deliveries.recv()).await.unwrap() {
        Some(Delivery::Call { client, req }) => {
            assert_eq!(req, "X");
            client.reply("late but fine");
        }
        other => panic!("expected Call, got {:?}", other.map(|d| d.kind())),
    }

    assert_eq!(caller.await.unwrap().unwrap(), "late but fine");
}

#[tokio::test]
async fn smallest_idle_worker_wins() {
    let pool = QueueManager::<&'static str, &'static str>::spawn("tie-pool");

    let (p2, mut rx2) = WorkerPort::channel(WorkerId::new("w2"));
    pool.new_worker(p2).unwrap();
    let (p1, mut rx1) = WorkerPort::channel(WorkerId::new("w1"));
    pool.new_worker(p1).unwrap();
    wait_for_counts(&pool, 2, 0).await;

    let caller = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.call_available_worker("X", None).await })
    };

    match tokio::time::timeout(TIMEOUT, rx1.recv()).await.unwrap() {
        Some(Delivery::Call { client, req }) => {
            assert_eq!(req, "X");
            client.reply("from w1");
        }
        other => panic!("expected Call on w1, got {:?}", other.map(|d| d.kind())),
    }
    assert_eq!(caller.await.unwrap().unwrap(), "from w1");
    assert!(rx2.try_recv().is_err(), "w2 must not receive anything");
}

#[tokio::test]
async fn ready_consumes_all_expired_entries_in_one_pass() {
    let pool = QueueManager::<&'static str, &'static str>::spawn("recursion-pool");

    let mut callers = Vec::new();
    for _ in 0..3 {
        let pool = pool.clone();
        callers.push(tokio::spawn(async move {
            pool.call_available_worker("X", Some(Duration::from_millis(5)))
                .await
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;
    for caller in callers {
        assert!(matches!(caller.await.unwrap(), Err(PoolError::Timeout(_))));
    }
    assert_eq!(pool.worker_counts().await.unwrap().pending, 3);

    let (port, mut deliveries) = WorkerPort::channel(WorkerId::new("w1"));
    pool.new_worker(port).unwrap();

    // One ready handling drops all three expired entries.
    wait_for_counts(&pool, 1, 0).await;
    assert!(deliveries.try_recv().is_err());
}

#[tokio::test]
async fn dead_submitter_entry_is_skipped_for_the_next_one() {
    let pool = QueueManager::<&'static str, &'static str>::spawn("abandon-pool");

    let caller = {
        let pool = pool.clone();
        tokio::spawn(async move { pool.call_available_worker("doomed", Some(TIMEOUT)).await })
    };
    tokio::time::sleep(SETTLE).await;
    // The submitter dies before a worker frees up.
    caller.abort();
    tokio::time::sleep(SETTLE).await;

    pool.cast_to_available_worker("survivor").unwrap();
    assert_eq!(pool.worker_counts().await.unwrap().pending, 2);

    let (port, mut deliveries) = WorkerPort::channel(WorkerId::new("w1"));
    pool.new_worker(port).unwrap();

    // The abandoned call is dropped; the cast behind it is matched.
    match tokio::time::timeout(TIMEOUT, deliveries.recv()).await.unwrap() {
        Some(Delivery::Cast { req }) => assert_eq!(req, "survivor"),
        other => panic!("expected Cast, got {:?}", other.map(|d| d.kind())),
    }
    assert_eq!(pool.worker_counts().await.unwrap().pending, 0);
}

#[tokio::test]
async fn queued_event_keeps_its_all_state_variant() {
    let pool = QueueManager::<&'static str, ()>::spawn("event-pool");

    pool.send_all_event_to_available_worker("all").unwrap();
    pool.send_event_to_available_worker("single").unwrap();
    assert_eq!(pool.worker_counts().await.unwrap().pending, 2);

    let id = WorkerId::new("w1");
    let (port, mut deliveries) = WorkerPort::channel(id.clone());
    pool.new_worker(port).unwrap();

    match tokio::time::timeout(TIMEOUT, deliveries.recv()).await.unwrap() {
        Some(Delivery::Event { req, all_state }) => {
            assert_eq!(req, "all");
            assert!(all_state, "all-state variant must survive queueing");
        }
        other => panic!("expected Event, got {:?}", other.map(|d| d.kind())),
    }

    pool.worker_ready(id).unwrap();
    match tokio::time::timeout(TIMEOUT, deliveries.recv()).await.unwrap() {
        Some(Delivery::Event { req, all_state }) => {
            assert_eq!(req, "single");
            assert!(!all_state);
        }
        other => panic!("expected Event, got {:?}", other.map(|d| d.kind())),
    }
}

#[tokio::test]
async fn sync_events_reply_through_the_worker() {
    let pool = QueueManager::<&'static str, String>::spawn("sync-event-pool");
    spawn_worker(&pool, WorkerId::new("w1"), |incoming: WorkRequest<&'static str>| {
        async move {
            match incoming.kind {
                DeliveryKind::Call => format!("call:{}", incoming.req),
                DeliveryKind::SyncEvent { all_state } => {
                    format!("sync_event:{all_state}:{}", incoming.req)
                }
                DeliveryKind::Cast => format!("cast:{}", incoming.req),
                DeliveryKind::Event { all_state } => format!("event:{all_state}:{}", incoming.req),
            }
        }
    })
    .unwrap();
    wait_for_counts(&pool, 1, 0).await;

    let reply = pool
        .sync_send_event_to_available_worker("e1", Some(TIMEOUT))
        .await
        .unwrap();
    assert_eq!(reply, "sync_event:false:e1");

    wait_for_counts(&pool, 1, 0).await;
    let reply = pool
        .sync_send_all_event_to_available_worker("e2", Some(TIMEOUT))
        .await
        .unwrap();
    assert_eq!(reply, "sync_event:true:e2");
}

#[tokio::test]
async fn lifecycle_notifications_are_idempotent() {
    let pool = QueueManager::<&'static str, ()>::spawn("lifecycle-pool");

    // busy/dead on unknown workers are no-ops.
    pool.worker_busy(WorkerId::new("ghost")).unwrap();
    pool.worker_dead(WorkerId::new("ghost")).unwrap();
    assert_eq!(pool.worker_counts().await.unwrap().idle, 0);

    let id = WorkerId::new("w1");
    let (port, _deliveries) = WorkerPort::channel(id.clone());
    pool.new_worker(port).unwrap();
    assert_eq!(pool.worker_counts().await.unwrap().idle, 1);

    // busy then ready leaves the worker idle.
    pool.worker_busy(id.clone()).unwrap();
    assert_eq!(pool.worker_counts().await.unwrap().idle, 0);
    pool.worker_ready(id.clone()).unwrap();
    assert_eq!(pool.worker_counts().await.unwrap().idle, 1);

    // dead removes it entirely; a late ready from it is ignored.
    pool.worker_dead(id.clone()).unwrap();
    assert_eq!(pool.worker_counts().await.unwrap().idle, 0);
    pool.worker_ready(id).unwrap();
    assert_eq!(pool.worker_counts().await.unwrap().idle, 0);
}

#[tokio::test]
async fn pending_count_tracks_queue_across_interleavings() {
    let pool = QueueManager::<u32, ()>::spawn("count-pool");

    for n in 0..4 {
        pool.cast_to_available_worker(n).unwrap();
        assert_eq!(pool.worker_counts().await.unwrap().pending as u32, n + 1);
    }

    let id = WorkerId::new("w1");
    let (port, mut deliveries) = WorkerPort::channel(id.clone());
    pool.new_worker(port).unwrap();

    let mut expected = 4;
    while expected > 0 {
        tokio::time::timeout(TIMEOUT, deliveries.recv())
            .await
            .unwrap()
            .unwrap();
        expected -= 1;
        assert_eq!(pool.worker_counts().await.unwrap().pending, expected);
        pool.worker_ready(id.clone()).unwrap();
    }

    wait_for_counts(&pool, 1, 0).await;
}
