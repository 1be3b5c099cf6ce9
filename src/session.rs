//! Replication sessions.
//!
//! A [`Session`] is the owned state of one directional replication of
//! one database pair, for one process lifetime. Every worker holds its
//! session exclusively (sessions are values, never shared), so no field
//! needs synchronization, and the strictly sequential batch loop is what
//! gives the checkpoint its meaning: everything up to `update_seq` is
//! durable on the destination before the next batch begins.

use miette::Diagnostic;
use serde_json::Value;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, info, instrument, warn};

use crate::batch::{BatchOutcome, replicate_one_batch};
use crate::checkpoint;
use crate::config::ReplicatorConfig;
use crate::ident;
use crate::store::{Db, Query, StoreError};

#[derive(Debug, Error, Diagnostic)]
pub enum ReplicateError {
    #[error(transparent)]
    #[diagnostic(code(weft::replicate::store))]
    Store(#[from] StoreError),

    /// The peer answered with JSON the replicator cannot make sense of.
    #[error("malformed reply from {path}: {message}")]
    #[diagnostic(
        code(weft::replicate::wire),
        help("The peer does not speak the reference document-store protocol.")
    )]
    Wire { path: String, message: String },
}

/// Which `_changes` feed mode a session polls with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Feed {
    /// Return immediately, possibly empty. One-shot replication.
    Normal,
    /// Suspend server-side until at least one change or a timeout.
    /// Continuous replication; the long poll is also what paces the
    /// polling loop on a quiet database.
    LongPoll,
}

/// Per-database replication state.
///
/// Built by [`load_session`], driven by [`replicate`] or
/// [`replicate_continuously`], and owned by exactly one worker for its
/// whole life.
///
/// # Examples
///
/// ```rust,no_run
/// # use weft::config::ReplicatorConfig;
/// # use weft::session::load_session;
/// # use weft::store::Db;
/// # async fn example(src: Db, dst: Db) -> Result<(), weft::session::ReplicateError> {
/// let session = load_session("node-a", src, "node-b", dst, &ReplicatorConfig::default()).await?;
/// assert_eq!(session.doc_count, 0);
/// assert_eq!(session.session_id.len(), 24);
/// # Ok(())
/// # }
/// ```
pub struct Session {
    pub replication_id: String,
    /// Fresh for every process start; never reused across runs.
    pub session_id: String,
    pub(crate) src: Db,
    pub(crate) dst: Db,
    pub(crate) src_doc: Value,
    pub(crate) dst_doc: Value,
    /// Committed progress: the source sequence up to which everything is
    /// durable on the destination. Absent until the first checkpoint.
    pub update_seq: Option<u64>,
    /// Progress staged by the current batch, not yet committed.
    pub(crate) new_update_seq: Option<u64>,
    /// Documents transferred by this session.
    pub doc_count: u64,
    pub(crate) feed: Feed,
    pub(crate) batch_limit: usize,
}

impl Session {
    /// Move the staged sequence into the committed slot, reporting
    /// whether anything actually changed.
    pub(crate) fn commit_staged_seq(&mut self) -> BatchOutcome {
        let staged = self.new_update_seq.take();
        if staged.is_none() || staged == self.update_seq {
            return BatchOutcome::Idle;
        }
        self.update_seq = staged;
        BatchOutcome::Progressed
    }
}

/// Prepare a session for the `(src, dst)` database pair.
///
/// Computes the replication id, loads both checkpoints, ensures the
/// destination database exists, and applies the resume rule: the session
/// continues from the slower peer's committed sequence when both
/// checkpoints agree on a previous run, and from zero otherwise.
///
/// # Parameters
///
/// * `src_node` - The source peer's node identifier
/// * `src` - Handle on the source database
/// * `dst_node` - The destination peer's node identifier
/// * `dst` - Handle on the destination database
/// * `config` - Replication knobs (batch limit)
///
/// # Returns
///
/// A [`Session`] with a fresh `session_id`, `doc_count` of zero, and
/// `update_seq` set to the resume point or `None` for "start from
/// zero".
///
/// # Panics
///
/// Panics when source and destination are the same `(node, db)` pair;
/// see [`crate::ident::replication_id`].
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use weft::config::ReplicatorConfig;
/// use weft::session::load_session;
/// use weft::store::{MemoryStore, Server};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let src = Server::new(Arc::new(MemoryStore::new()));
/// let dst = Server::new(Arc::new(MemoryStore::new()));
/// src.database("things").ensure().await?;
///
/// let session = load_session(
///     &src.node_id().await?,
///     src.database("things"),
///     &dst.node_id().await?,
///     dst.database("things"),
///     &ReplicatorConfig::default(),
/// )
/// .await?;
/// assert_eq!(session.replication_id.len(), 48);
/// assert_eq!(session.update_seq, None); // nothing to resume
/// # Ok(())
/// # }
/// ```
#[instrument(skip_all, fields(src_db = %src.name(), dst_db = %dst.name()), err)]
pub async fn load_session(
    src_node: &str,
    src: Db,
    dst_node: &str,
    dst: Db,
    config: &ReplicatorConfig,
) -> Result<Session, ReplicateError> {
    let replication_id = ident::replication_id(src_node, src.name(), dst_node, dst.name());
    let src_doc = checkpoint::load_checkpoint(&src, &replication_id).await?;
    dst.ensure().await?;
    let dst_doc = checkpoint::load_checkpoint(&dst, &replication_id).await?;
    let update_seq = checkpoint::resume_seq(&src_doc, &dst_doc);
    match update_seq {
        Some(seq) => info!(%replication_id, update_seq = seq, "resuming replication session"),
        None => warn!(%replication_id, "cannot resume replication, starting from zero"),
    }
    Ok(Session {
        replication_id,
        session_id: ident::random_id(),
        src,
        dst,
        src_doc,
        dst_doc,
        update_seq,
        new_update_seq: None,
        doc_count: 0,
        feed: Feed::Normal,
        batch_limit: config.batch_limit(),
    })
}

/// Persist the session's progress on both peers.
///
/// The order is fixed: fsync the documents just written on the
/// destination, record progress there, then on the source. Dying after
/// the fsync but before the destination write only re-sends revisions
/// the destination already has (`_revs_diff` reports them as not
/// missing); dying between the two checkpoint writes leaves them
/// mismatched, and the next run restarts from zero: safe, just slower.
///
/// # Parameters
///
/// * `session` - The session whose committed `update_seq` to record
///
/// # Returns
///
/// `Ok(())` with both checkpoint copies on the session refreshed; a
/// no-op when nothing has been committed yet. Each checkpoint write
/// retries once on conflict, then propagates.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use serde_json::json;
/// use weft::batch::replicate_one_batch;
/// use weft::config::ReplicatorConfig;
/// use weft::session::{load_session, save_session};
/// use weft::store::{MemoryStore, Query, Server};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let src = Server::new(Arc::new(MemoryStore::new()));
/// let dst = Server::new(Arc::new(MemoryStore::new()));
/// let things = src.database("things");
/// things.ensure().await?;
/// things
///     .put(Some(&json!({"_id": "a"})), &["a"], &Query::new())
///     .await?;
///
/// let mut session = load_session(
///     &src.node_id().await?,
///     things,
///     &dst.node_id().await?,
///     dst.database("things"),
///     &ReplicatorConfig::default(),
/// )
/// .await?;
/// replicate_one_batch(&mut session).await?;
/// save_session(&mut session).await?;
///
/// let ckpt = dst
///     .database("things")
///     .get(&["_local", &session.replication_id], &Query::new())
///     .await?;
/// assert_eq!(ckpt["update_seq"], 1);
/// # Ok(())
/// # }
/// ```
#[instrument(skip(session), fields(replication_id = %session.replication_id), err)]
pub async fn save_session(session: &mut Session) -> Result<(), ReplicateError> {
    let Some(update_seq) = session.update_seq else {
        return Ok(());
    };
    session
        .dst
        .post(None, &["_ensure_full_commit"], &Query::new())
        .await?;
    session.dst_doc = checkpoint::save_checkpoint(
        &session.dst,
        &session.dst_doc,
        &session.replication_id,
        &session.session_id,
        update_seq,
    )
    .await?;
    session.src_doc = checkpoint::save_checkpoint(
        &session.src,
        &session.src_doc,
        &session.replication_id,
        &session.session_id,
        update_seq,
    )
    .await?;
    debug!(update_seq, "checkpoint saved");
    Ok(())
}

/// One-shot replication: run batches until the source's changes as of
/// launch have all been transferred.
///
/// The stop sequence is sampled once, before the loop; writes landing on
/// the source during the run are deliberately left to a later run or to
/// continuous mode. Checkpoints are persisted after every batch that
/// makes progress, so an interrupted run resumes instead of starting
/// over.
///
/// # Parameters
///
/// * `session` - The session to drive to the launch sequence
///
/// # Returns
///
/// `Ok(())` once the destination holds every non-reserved revision the
/// source had at launch; `session.doc_count` tallies what this session
/// transferred.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use serde_json::json;
/// use weft::config::ReplicatorConfig;
/// use weft::session::{load_session, replicate};
/// use weft::store::{MemoryStore, Query, Server};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let src = Server::new(Arc::new(MemoryStore::new()));
/// let dst = Server::new(Arc::new(MemoryStore::new()));
/// let things = src.database("things");
/// things.ensure().await?;
/// for n in 0..3 {
///     let id = format!("doc-{n}");
///     things
///         .put(Some(&json!({"_id": id, "n": n})), &[&id], &Query::new())
///         .await?;
/// }
///
/// let mut session = load_session(
///     &src.node_id().await?,
///     things,
///     &dst.node_id().await?,
///     dst.database("things"),
///     &ReplicatorConfig::default(),
/// )
/// .await?;
/// replicate(&mut session).await?;
/// assert_eq!(session.doc_count, 3);
/// assert_eq!(session.update_seq, Some(3));
/// # Ok(())
/// # }
/// ```
pub async fn replicate(session: &mut Session) -> Result<(), ReplicateError> {
    info!(src = %session.src.name(), dst = %session.dst.name(), "one-shot replication");
    session.feed = Feed::Normal;
    let stop_at_seq = session.src.update_seq().await?;
    let start = Instant::now();
    while replicate_one_batch(session).await? == BatchOutcome::Progressed {
        save_session(session).await?;
        if session.update_seq.is_some_and(|seq| seq >= stop_at_seq) {
            debug!(update_seq = session.update_seq, stop_at_seq, "caught up to launch sequence");
            break;
        }
    }
    info!(
        doc_count = session.doc_count,
        elapsed_ms = start.elapsed().as_millis() as u64,
        src = %session.src.name(),
        dst = %session.dst.name(),
        "one-shot replication finished"
    );
    Ok(())
}

/// Continuous replication: long-poll the source's changes feed forever,
/// checkpointing after every batch that makes progress.
///
/// Returns only by propagating an error; the supervisor treats worker
/// exit as the failure signal and respawns from the last good
/// checkpoint.
///
/// # Examples
///
/// ```rust,no_run
/// # use weft::session::{Session, replicate_continuously};
/// # async fn example(mut session: Session) -> Result<(), weft::session::ReplicateError> {
/// // Runs until an error propagates out of a batch or checkpoint.
/// replicate_continuously(&mut session).await?;
/// # Ok(())
/// # }
/// ```
pub async fn replicate_continuously(session: &mut Session) -> Result<(), ReplicateError> {
    info!(src = %session.src.name(), dst = %session.dst.name(), "continuous replication");
    session.feed = Feed::LongPoll;
    loop {
        // An idle feed has already slept server-side in the long poll.
        if replicate_one_batch(session).await? == BatchOutcome::Progressed {
            save_session(session).await?;
        }
    }
}
