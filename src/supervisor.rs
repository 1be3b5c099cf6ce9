//! Multi-database supervision.
//!
//! The [`Supervisor`] keeps one continuous replication worker per user
//! database on the source peer. Startup brings every known database up
//! with a one-shot run before handing it to a worker; from then on a
//! monitor loop reaps workers that died, health-checks the destination,
//! and discovers databases created after startup. Workers are plain
//! tokio tasks owning their [`Session`]; the supervisor never shares
//! state with them and uses task termination as its only failure signal.

use miette::Diagnostic;
use rustc_hash::FxHashMap;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};
use tracing::{error, info, warn};

use crate::config::ReplicatorConfig;
use crate::session::{ReplicateError, Session, load_session, replicate, replicate_continuously};
use crate::store::{RESERVED_PREFIX, Server, Store, StoreError};

/// Caller-provided predicate narrowing which source databases replicate.
pub type NamesFilter = Arc<dyn Fn(&str) -> bool + Send + Sync>;

#[derive(Debug, Error, Diagnostic)]
pub enum SupervisorError {
    #[error(transparent)]
    #[diagnostic(code(weft::supervisor::store))]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(code(weft::supervisor::replicate))]
    Replicate(#[from] ReplicateError),
}

pub struct Supervisor {
    src: Server,
    dst: Server,
    src_id: String,
    dst_id: String,
    names_filter: Option<NamesFilter>,
    workers: FxHashMap<String, JoinHandle<()>>,
    config: ReplicatorConfig,
}

impl Supervisor {
    /// Build a supervisor over two peers, resolving each node id once
    /// for the process lifetime.
    pub async fn new(
        src: Arc<dyn Store>,
        dst: Arc<dyn Store>,
        names_filter: Option<NamesFilter>,
        config: ReplicatorConfig,
    ) -> Result<Self, SupervisorError> {
        let src = Server::new(src);
        let dst = Server::new(dst);
        let src_id = src.node_id().await?;
        let dst_id = dst.node_id().await?;
        Ok(Self {
            src,
            dst,
            src_id,
            dst_id,
            names_filter,
            workers: FxHashMap::default(),
            config,
        })
    }

    /// User databases on the source: reserved names dropped, the
    /// caller's predicate applied, sorted.
    async fn names(&self) -> Result<Vec<String>, SupervisorError> {
        let mut names: Vec<String> = self
            .src
            .all_dbs()
            .await?
            .into_iter()
            .filter(|name| !name.starts_with(RESERVED_PREFIX))
            .filter(|name| self.names_filter.as_ref().is_none_or(|keep| keep(name)))
            .collect();
        names.sort();
        Ok(names)
    }

    /// Databases with a live worker, sorted.
    pub fn active(&self) -> Vec<String> {
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        names
    }

    /// Bring every source database up, then monitor forever.
    ///
    /// Returns only by propagating an error, which in steady state means
    /// the destination peer became unreachable.
    pub async fn run(&mut self) -> Result<(), SupervisorError> {
        let names = self.names().await?;
        self.bring_up(&names).await?;
        info!(replications = ?self.active(), "initial sync-up complete");
        loop {
            // The monitor period is a floor measured start of iteration
            // to start of iteration: an iteration that overran it
            // proceeds immediately, without an extra full period on top.
            let start = Instant::now();
            self.monitor_once().await?;
            sleep(self.config.monitor_period().saturating_sub(start.elapsed())).await;
        }
    }

    /// Initial sync-up: one-shot each database to completion before
    /// handing it to a continuous worker.
    async fn bring_up(&mut self, names: &[String]) -> Result<(), SupervisorError> {
        for name in names {
            let mut session = self.load(name).await?;
            replicate(&mut session).await?;
            self.spawn_worker(name, session);
        }
        Ok(())
    }

    /// One monitor iteration: reap, health-check, discover.
    pub async fn monitor_once(&mut self) -> Result<(), SupervisorError> {
        self.reap_workers().await;
        // Fail fast if the destination is unreachable; the discovery
        // request below covers the source the same way.
        self.dst.welcome().await?;
        for name in self.names().await? {
            if !self.workers.contains_key(&name) {
                self.restart_worker(&name).await?;
            }
        }
        Ok(())
    }

    /// Wait a short bounded time on each worker and drop the ones that
    /// terminated. A continuous worker exiting always indicates failure.
    async fn reap_workers(&mut self) {
        let deadline = self.config.reap_timeout();
        let mut reaped = Vec::new();
        let mut names: Vec<String> = self.workers.keys().cloned().collect();
        names.sort();
        for name in names {
            let Some(handle) = self.workers.get_mut(&name) else {
                continue;
            };
            if timeout(deadline, handle).await.is_ok() {
                reaped.push(name);
            }
        }
        for name in reaped {
            self.workers.remove(&name);
            warn!(db = %name, "reaped replication worker (possible crash)");
        }
    }

    /// Start continuous replication for a database in a fresh worker,
    /// skipping the initial one-shot: a database that just appeared is
    /// either empty on both sides or a re-catch-up after a crash, and
    /// continuous mode handles both from the last good checkpoint.
    async fn restart_worker(&mut self, name: &str) -> Result<(), SupervisorError> {
        let session = self.load(name).await?;
        info!(db = %name, "starting continuous replication worker");
        self.spawn_worker(name, session);
        Ok(())
    }

    async fn load(&self, name: &str) -> Result<Session, ReplicateError> {
        let src = self.src.database(name);
        let dst = self.dst.database(name);
        load_session(&self.src_id, src, &self.dst_id, dst, &self.config).await
    }

    fn spawn_worker(&mut self, name: &str, mut session: Session) {
        let db = name.to_string();
        let handle = tokio::spawn(async move {
            if let Err(e) = replicate_continuously(&mut session).await {
                error!(db = %db, error = %e, "continuous replication failed");
            }
        });
        self.workers.insert(name.to_string(), handle);
    }
}
