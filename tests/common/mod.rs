//! Shared fixtures for the replication integration tests.
#![allow(dead_code)]

use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use weft::config::ReplicatorConfig;
use weft::session::{Session, load_session};
use weft::store::{Db, MemoryStore, Query, Server, Store};

/// A fresh in-process peer.
pub fn memory_server() -> Server {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    Server::new(store)
}

/// Load a session replicating `name` from `src` to `dst` with default
/// configuration.
pub async fn session_for(src: &Server, dst: &Server, name: &str) -> Session {
    load_session(
        &src.node_id().await.unwrap(),
        src.database(name),
        &dst.node_id().await.unwrap(),
        dst.database(name),
        &ReplicatorConfig::default(),
    )
    .await
    .unwrap()
}

/// Seed `count` documents on `db`, every third one carrying an inline
/// attachment. Ids are zero-padded so listings sort naturally.
pub async fn seed_docs(db: &Db, count: usize) -> Vec<String> {
    let mut ids = Vec::with_capacity(count);
    for n in 0..count {
        let id = format!("doc-{n:03}");
        let mut body = json!({"_id": id, "n": n});
        if n % 3 == 0 {
            body["_attachments"] = attachment(n);
        }
        db.put(Some(&body), &[&id], &Query::new()).await.unwrap();
        ids.push(id);
    }
    ids
}

/// An inline base64-ish attachment whose content varies with `n`.
pub fn attachment(n: usize) -> Value {
    use std::fmt::Write;
    let mut data = String::new();
    for byte in format!("payload-{n}").bytes() {
        write!(data, "{byte:02x}").unwrap();
    }
    json!({
        "blob": {
            "content_type": "application/octet-stream",
            "data": data,
        }
    })
}

/// Current winning revision of a document.
pub async fn winner(db: &Db, id: &str) -> Value {
    db.get(&[id], &Query::new()).await.unwrap()
}

/// Fetch the winner, apply `mutate`, and save against its revision.
pub async fn bump(db: &Db, id: &str, mutate: impl FnOnce(&mut Value)) {
    let mut doc = winner(db, id).await;
    mutate(&mut doc);
    db.put(Some(&doc), &[id], &Query::new()).await.unwrap();
}

/// Whole-database digest: every document's winning revision, keyed by
/// id. Two converged peers digest identically (same bodies, same revs).
pub async fn digest(db: &Db) -> BTreeMap<String, Value> {
    let query = Query::new().str("style", "all_docs").json("since", &0_u64);
    let feed = db.get(&["_changes"], &query).await.unwrap();
    let mut out = BTreeMap::new();
    for row in feed["results"].as_array().unwrap() {
        if row["deleted"].as_bool().unwrap_or(false) {
            continue;
        }
        let id = row["id"].as_str().unwrap();
        out.insert(id.to_string(), winner(db, id).await);
    }
    out
}

/// All leaf revisions of one document, from the changes feed with
/// `style=all_docs`; conflict branches show up as extra revs.
pub async fn leaf_revs(db: &Db, id: &str) -> Vec<String> {
    let query = Query::new().str("style", "all_docs").json("since", &0_u64);
    let feed = db.get(&["_changes"], &query).await.unwrap();
    for row in feed["results"].as_array().unwrap() {
        if row["id"] == id {
            return row["changes"]
                .as_array()
                .unwrap()
                .iter()
                .map(|c| c["rev"].as_str().unwrap().to_string())
                .collect();
        }
    }
    Vec::new()
}

/// The stored checkpoint document on `db`, if any.
pub async fn stored_checkpoint(db: &Db, replication_id: &str) -> Option<Value> {
    db.get(&["_local", replication_id], &Query::new())
        .await
        .ok()
}
