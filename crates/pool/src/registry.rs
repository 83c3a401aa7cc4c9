//! Pool registry and the introspection surface built on it.
//!
//! The registry is a process-wide table keyed by pool name, consulted only
//! for introspection: listing pools, deriving [`PoolStats`], and the
//! optional JSON stats endpoint. Dispatch never reads it; stats are
//! best-effort snapshots.

use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::RwLock;

use crate::error::PoolError;
use crate::manager::{PoolHandle, WorkerCounts};

// ── Introspection seam ───────────────────────────────────────────────

/// Type-erased view of one pool, enough to derive stats.
#[async_trait]
pub trait PoolIntrospect: Send + Sync {
    fn pool_name(&self) -> &str;

    fn born(&self) -> DateTime<Utc>;

    async fn worker_counts(&self) -> Result<WorkerCounts, PoolError>;
}

#[async_trait]
impl<Req, Res> PoolIntrospect for PoolHandle<Req, Res>
where
    Req: Send + Debug + 'static,
    Res: Send + 'static,
{
    fn pool_name(&self) -> &str {
        self.name()
    }

    fn born(&self) -> DateTime<Utc> {
        PoolHandle::born(self)
    }

    async fn worker_counts(&self) -> Result<WorkerCounts, PoolError> {
        PoolHandle::worker_counts(self).await
    }
}

// ── Stats ────────────────────────────────────────────────────────────

/// Derived snapshot of one pool.
#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool: String,
    /// Declared worker count at registration.
    pub size: usize,
    pub idle: usize,
    /// `size − idle`; workers currently executing.
    pub busy: usize,
    pub pending: usize,
    pub age_secs: i64,
}

// ── Registry ─────────────────────────────────────────────────────────

struct PoolEntry {
    size: usize,
    handle: Arc<dyn PoolIntrospect>,
}

/// Process-wide pool table. Cheap to clone; all clones share the table.
#[derive(Clone, Default)]
pub struct PoolRegistry {
    pools: Arc<RwLock<HashMap<String, PoolEntry>>>,
}

impl PoolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a pool under its own name, replacing any previous entry.
    pub async fn register(&self, size: usize, handle: Arc<dyn PoolIntrospect>) {
        let name = handle.pool_name().to_string();
        let mut pools = self.pools.write().await;
        pools.insert(name, PoolEntry { size, handle });
    }

    /// Remove a pool; `false` if it was not registered.
    pub async fn deregister(&self, name: &str) -> bool {
        self.pools.write().await.remove(name).is_some()
    }

    /// Registered pool names, sorted.
    pub async fn list_pools(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().await.keys().cloned().collect();
        names.sort();
        names
    }

    /// Stats for one pool, or `InvalidPool` if the name is unknown.
    pub async fn stats(&self, name: &str) -> Result<PoolStats, PoolError> {
        let (size, handle) = {
            let pools = self.pools.read().await;
            let entry = pools
                .get(name)
                .ok_or_else(|| PoolError::InvalidPool(name.to_string()))?;
            (entry.size, entry.handle.clone())
        };

        let counts = handle.worker_counts().await?;
        Ok(PoolStats {
            pool: name.to_string(),
            size,
            idle: counts.idle,
            busy: size.saturating_sub(counts.idle),
            pending: counts.pending,
            age_secs: (Utc::now() - handle.born()).num_seconds(),
        })
    }

    /// Stats for every registered pool. Pools whose manager is gone are
    /// skipped rather than failing the whole listing.
    pub async fn stats_all(&self) -> Vec<PoolStats> {
        let names = self.list_pools().await;
        let mut all = Vec::with_capacity(names.len());
        for name in names {
            if let Ok(stats) = self.stats(&name).await {
                all.push(stats);
            }
        }
        all
    }
}

// ── Stats HTTP endpoint ──────────────────────────────────────────────

/// Spawn the JSON stats server: `GET /pools` and `GET /pools/:name`.
///
/// Returns a `JoinHandle` that resolves when the server shuts down.
pub fn spawn_stats_server(
    port: u16,
    registry: PoolRegistry,
    shutdown: tokio::sync::watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let app = axum::Router::new()
            .route("/pools", axum::routing::get(pools_handler))
            .route("/pools/:name", axum::routing::get(pool_handler))
            .with_state(registry);

        let addr = std::net::SocketAddr::from(([0, 0, 0, 0], port));
        let listener = match tokio::net::TcpListener::bind(addr).await {
            Ok(l) => l,
            Err(e) => {
                tracing::error!(port, error = %e, "failed to bind stats HTTP server");
                return;
            }
        };

        tracing::info!(port, "stats HTTP server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let mut rx = shutdown;
                while !*rx.borrow() {
                    if rx.changed().await.is_err() {
                        break;
                    }
                }
            })
            .await
            .ok();

        tracing::info!("stats HTTP server stopped");
    })
}

/// Axum handler: `GET /pools` → stats for every pool.
async fn pools_handler(
    axum::extract::State(registry): axum::extract::State<PoolRegistry>,
) -> axum::Json<Vec<PoolStats>> {
    axum::Json(registry.stats_all().await)
}

/// Axum handler: `GET /pools/:name` → stats for one pool or 404.
async fn pool_handler(
    axum::extract::State(registry): axum::extract::State<PoolRegistry>,
    axum::extract::Path(name): axum::extract::Path<String>,
) -> Result<axum::Json<PoolStats>, axum::http::StatusCode> {
    match registry.stats(&name).await {
        Ok(stats) => Ok(axum::Json(stats)),
        Err(PoolError::InvalidPool(_)) => Err(axum::http::StatusCode::NOT_FOUND),
        Err(_) => Err(axum::http::StatusCode::SERVICE_UNAVAILABLE),
    }
}
