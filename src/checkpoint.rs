//! Durable replication progress records.
//!
//! Each peer keeps one small local document per directional replication,
//! stored under `_local/<replication_id>` so it never replicates itself:
//!
//! ```json
//! {
//!   "_id": "_local/<replication_id>",
//!   "_rev": "0-3",
//!   "session_id": "<24-char base-32 run id>",
//!   "update_seq": 69
//! }
//! ```
//!
//! The documents stay opaque [`Value`]s: the store assigns `_rev` on
//! every save and the replicator only ever touches the two progress
//! fields, so in-place updates survive whatever other bookkeeping a peer
//! attaches.

use serde_json::{Value, json};

use crate::ident;
use crate::store::{Db, Query, Result};

/// Load a peer's checkpoint for one replication.
///
/// # Parameters
///
/// * `db` - The database holding the checkpoint
/// * `replication_id` - The directional replication id naming it
///
/// # Returns
///
/// The stored checkpoint document, or a fresh one-field document
/// carrying only `_id` when the peer has never seen this replication.
/// Any other store failure propagates.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use weft::checkpoint::load_checkpoint;
/// use weft::store::{Db, MemoryStore, Store};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), weft::store::StoreError> {
/// let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
/// let db = Db::new(store, "mydb");
/// db.ensure().await?;
///
/// let doc = load_checkpoint(&db, "REPLICATIONX").await?;
/// assert_eq!(doc["_id"], "_local/REPLICATIONX");
/// assert!(doc["session_id"].is_null()); // nothing recorded yet
/// # Ok(())
/// # }
/// ```
pub async fn load_checkpoint(db: &Db, replication_id: &str) -> Result<Value> {
    match db.get(&["_local", replication_id], &Query::new()).await {
        Ok(doc) => Ok(doc),
        Err(e) if e.is_not_found() => Ok(json!({"_id": format!("_local/{replication_id}")})),
        Err(e) => Err(e),
    }
}

/// Apply the single mutation the replicator ever makes to a checkpoint
/// document: stamping the run's `session_id` and committed `update_seq`.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use weft::checkpoint::mark;
///
/// let mut doc = json!({"_id": "_local/example"});
/// mark(&mut doc, "SESSIONRUNID", 42);
/// assert_eq!(doc["session_id"], "SESSIONRUNID");
/// assert_eq!(doc["update_seq"], 42);
/// ```
pub fn mark(doc: &mut Value, session_id: &str, update_seq: u64) {
    doc["session_id"] = json!(session_id);
    doc["update_seq"] = json!(update_seq);
}

/// Persist `(session_id, update_seq)` onto a peer's checkpoint, with one
/// conflict retry against the newest revision.
///
/// # Parameters
///
/// * `db` - The database holding the checkpoint
/// * `doc` - The caller's copy of the checkpoint document
/// * `replication_id` - The directional replication id naming it
/// * `session_id` - This run's session id
/// * `update_seq` - The committed source sequence
///
/// # Returns
///
/// The saved document carrying the `_rev` the store assigned, so the
/// next save is an in-place update. A second conflict propagates.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use weft::checkpoint::{load_checkpoint, save_checkpoint};
/// use weft::store::{Db, MemoryStore, Store};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), weft::store::StoreError> {
/// let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
/// let db = Db::new(store, "mydb");
/// db.ensure().await?;
///
/// let fresh = load_checkpoint(&db, "REPLICATIONX").await?;
/// let saved = save_checkpoint(&db, &fresh, "REPLICATIONX", "SESSIONRUNID", 7).await?;
/// assert_eq!(saved["update_seq"], 7);
/// assert!(saved["_rev"].is_string());
/// # Ok(())
/// # }
/// ```
pub async fn save_checkpoint(
    db: &Db,
    doc: &Value,
    replication_id: &str,
    session_id: &str,
    update_seq: u64,
) -> Result<Value> {
    db.update_local(replication_id, doc, |doc| mark(doc, session_id, update_seq))
        .await
}

/// Where both peers agree the previous session left off.
///
/// A session is resumable iff both checkpoints carry the same
/// well-formed base-32 `session_id` and both `update_seq` values are
/// positive integers; the resume point clamps to the slower peer.
///
/// # Returns
///
/// `Some(min(src, dst))` when the checkpoints agree, `None` for
/// anything else, which means "start from zero".
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use weft::checkpoint::resume_seq;
/// use weft::ident::random_id;
///
/// let sid = random_id();
/// let src = json!({"session_id": sid, "update_seq": 69});
/// let dst = json!({"session_id": sid, "update_seq": 42});
/// assert_eq!(resume_seq(&src, &dst), Some(42)); // clamp to the slower peer
///
/// // A missing, mismatched, or zero-sequence checkpoint never resumes.
/// assert_eq!(resume_seq(&src, &json!({})), None);
/// assert_eq!(resume_seq(&src, &json!({"session_id": sid, "update_seq": 0})), None);
/// ```
pub fn resume_seq(src_doc: &Value, dst_doc: &Value) -> Option<u64> {
    let session_id = src_doc["session_id"].as_str()?;
    if dst_doc["session_id"].as_str() != Some(session_id) || !ident::is_encoded(session_id) {
        return None;
    }
    let src_seq = positive(&src_doc["update_seq"])?;
    let dst_seq = positive(&dst_doc["update_seq"])?;
    Some(src_seq.min(dst_seq))
}

fn positive(value: &Value) -> Option<u64> {
    value.as_u64().filter(|n| *n > 0)
}
