//! The core transfer algorithm: one invocation, one batch.
//!
//! A batch pulls a bounded page of changes from the source, asks the
//! destination which of those revisions it is missing, fetches each
//! missing revision with its full edit history and any attachments the
//! destination does not already hold, and writes the lot to the
//! destination with `new_edits=false` so conflict branches survive the
//! transfer verbatim.

use rustc_hash::FxHashMap;
use serde::Deserialize;
use serde_json::{Value, json};
use tracing::instrument;

use crate::session::{Feed, ReplicateError, Session};
use crate::store::{Query, RESERVED_PREFIX};

/// What one batch accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchOutcome {
    /// The committed sequence moved; checkpoints should be persisted.
    Progressed,
    /// Nothing new under the staged sequence. Seen when a session is
    /// caught up, or when a long poll returned only filtered-out rows.
    Idle,
}

#[derive(Debug, Deserialize)]
struct ChangesFeed {
    last_seq: u64,
    results: Vec<ChangeRow>,
}

#[derive(Debug, Deserialize)]
struct ChangeRow {
    id: String,
    changes: Vec<ChangeRev>,
}

#[derive(Debug, Deserialize)]
struct ChangeRev {
    rev: String,
}

#[derive(Debug, Deserialize)]
struct MissingInfo {
    missing: Vec<String>,
    #[serde(default)]
    possible_ancestors: Vec<String>,
}

fn decode<T: serde::de::DeserializeOwned>(value: Value, path: &str) -> Result<T, ReplicateError> {
    serde_json::from_value(value).map_err(|e| ReplicateError::Wire {
        path: path.to_string(),
        message: e.to_string(),
    })
}

/// Pull one page of changes and diff it against the destination.
///
/// Stages the page's `last_seq` on the session and returns the
/// destination's report of missing revisions per document. Rows whose id
/// starts with the reserved prefix are dropped before the diff, so
/// design and other internal documents never propagate.
async fn get_missing_changes(
    session: &mut Session,
) -> Result<FxHashMap<String, MissingInfo>, ReplicateError> {
    let mut query = Query::new()
        .json("limit", &session.batch_limit)
        .str("style", "all_docs");
    if session.feed == Feed::LongPoll {
        query = query.str("feed", "longpoll");
    }
    if let Some(seq) = session.update_seq {
        query = query.json("since", &seq);
    }
    let reply = session.src.get(&["_changes"], &query).await?;
    let feed: ChangesFeed = decode(reply, "_changes")?;
    session.new_update_seq = Some(feed.last_seq);

    let mut changes: FxHashMap<String, Vec<String>> = FxHashMap::default();
    for row in feed.results {
        if row.id.starts_with(RESERVED_PREFIX) {
            continue;
        }
        changes.insert(row.id, row.changes.into_iter().map(|c| c.rev).collect());
    }
    if changes.is_empty() {
        return Ok(FxHashMap::default());
    }
    let reply = session
        .dst
        .post(Some(&json!(changes)), &["_revs_diff"], &Query::new())
        .await?;
    decode(reply, "_revs_diff")
}

/// Run one replication batch: fetch a page of changes, diff it against
/// the destination, transfer the missing revisions, and commit the
/// staged sequence.
///
/// The session drivers in [`crate::session`] call this in a loop; use
/// it directly to single-step a replication.
///
/// # Parameters
///
/// * `session` - The session to advance by one batch
///
/// # Returns
///
/// * `Ok(BatchOutcome::Progressed)` - The committed sequence moved;
///   the caller should persist checkpoints
/// * `Ok(BatchOutcome::Idle)` - Nothing new under the staged sequence
/// * `Err(ReplicateError)` - The batch aborted without advancing
///   `update_seq`; the last successful checkpoint remains the truth
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use serde_json::json;
/// use weft::batch::{BatchOutcome, replicate_one_batch};
/// use weft::config::ReplicatorConfig;
/// use weft::session::load_session;
/// use weft::store::{MemoryStore, Query, Server};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
/// let src = Server::new(Arc::new(MemoryStore::new()));
/// let dst = Server::new(Arc::new(MemoryStore::new()));
/// let things = src.database("things");
/// things.ensure().await?;
/// things
///     .put(Some(&json!({"_id": "a", "n": 1})), &["a"], &Query::new())
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
/// assert_eq!(
///     replicate_one_batch(&mut session).await?,
///     BatchOutcome::Progressed
/// );
/// assert_eq!(session.doc_count, 1);
/// assert_eq!(
///     replicate_one_batch(&mut session).await?,
///     BatchOutcome::Idle
/// );
/// # Ok(())
/// # }
/// ```
#[instrument(skip(session), fields(db = %session.src.name()), err)]
pub async fn replicate_one_batch(session: &mut Session) -> Result<BatchOutcome, ReplicateError> {
    let missing = get_missing_changes(session).await?;
    let mut docs: Vec<Value> = Vec::new();
    for (doc_id, info) in missing {
        // Revisions the destination already holds double as attachment
        // ancestors: the source then inlines only attachment bodies the
        // destination cannot already have.
        let mut atts_since = info.possible_ancestors;
        for rev in info.missing {
            let query = Query::new()
                .str("rev", rev.as_str())
                .json("revs", &true)
                .json("attachments", &true)
                .json("atts_since", &atts_since);
            docs.push(session.src.get(&[doc_id.as_str()], &query).await?);
            // The next missing revision of this document is a successor
            // branch and sees this one as a known ancestor.
            atts_since.push(rev);
        }
    }
    if !docs.is_empty() {
        let transferred = docs.len() as u64;
        let body = json!({"docs": docs, "new_edits": false});
        session
            .dst
            .post(Some(&body), &["_bulk_docs"], &Query::new())
            .await?;
        session.doc_count += transferred;
    }
    Ok(session.commit_staged_seq())
}
