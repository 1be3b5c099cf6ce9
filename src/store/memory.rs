//! In-process document store.
//!
//! [`MemoryStore`] is a volatile [`Store`] with the same observable wire
//! semantics as a CouchDB peer for every endpoint the replicator
//! consumes: `_all_dbs`, database create/info/delete, `_changes` (with
//! `since`, `limit`, `style`, and a bounded `longpoll`), `_revs_diff`,
//! `_bulk_docs` (`new_edits` both ways, edit paths materialized from
//! `_revisions`), per-revision document reads with `revs=true`,
//! `_local/*` documents with conflict detection, and
//! `_ensure_full_commit`. Non-durable; suitable for tests and ephemeral
//! runs.
//!
//! Revision trees are kept per document as `rev → entry(body, parent)`;
//! a leaf is a revision no other revision names as its parent, and the
//! winning revision is the greatest non-deleted leaf ordered by
//! `(generation, hash)`.

use async_trait::async_trait;
use data_encoding::HEXLOWER;
use parking_lot::RwLock;
use rand::Rng;
use rustc_hash::FxHashMap;
use serde_json::{Value, json};
use sha2::{Digest, Sha256};
use std::collections::hash_map::Entry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

use super::{Query, Result, Store, StoreError};

#[derive(Debug, Clone)]
struct RevEntry {
    /// `None` for ancestors known only as stubs from an edit path.
    body: Option<Value>,
    parent: Option<String>,
    deleted: bool,
}

#[derive(Debug, Clone, Default)]
struct DocTree {
    revs: FxHashMap<String, RevEntry>,
    /// Sequence of this document's most recent change.
    seq: u64,
}

#[derive(Default)]
struct Database {
    update_seq: u64,
    docs: FxHashMap<String, DocTree>,
    local: FxHashMap<String, Value>,
    notify: Arc<Notify>,
}

fn parse_rev(rev: &str) -> Option<(u64, &str)> {
    let (generation, hash) = rev.split_once('-')?;
    Some((generation.parse().ok()?, hash))
}

fn rev_key(rev: &str) -> (u64, String) {
    parse_rev(rev).map_or((0, String::new()), |(generation, hash)| {
        (generation, hash.to_string())
    })
}

fn make_rev(generation: u64, parent: Option<&str>, body: &Value) -> String {
    let mut hasher = Sha256::new();
    if let Some(parent) = parent {
        hasher.update(parent.as_bytes());
    }
    hasher.update(body.to_string().as_bytes());
    let digest = HEXLOWER.encode(&hasher.finalize());
    format!("{generation}-{}", &digest[..32])
}

impl DocTree {
    fn is_leaf(&self, rev: &str) -> bool {
        !self.revs.values().any(|e| e.parent.as_deref() == Some(rev))
    }

    /// All leaf revisions carrying a body, greatest first.
    fn leaf_revs(&self) -> Vec<String> {
        let mut leaves: Vec<&String> = self
            .revs
            .iter()
            .filter(|(rev, entry)| entry.body.is_some() && self.is_leaf(rev))
            .map(|(rev, _)| rev)
            .collect();
        leaves.sort_by_key(|rev| std::cmp::Reverse(rev_key(rev)));
        leaves.into_iter().cloned().collect()
    }

    fn winner(&self) -> Option<&str> {
        self.revs
            .iter()
            .filter(|(rev, entry)| entry.body.is_some() && !entry.deleted && self.is_leaf(rev))
            .max_by_key(|(rev, _)| rev_key(rev))
            .map(|(rev, _)| rev.as_str())
    }

    /// The `_revisions` edit history for `rev`, walking known parents.
    fn revisions_of(&self, rev: &str) -> Value {
        let Some((start, hash)) = parse_rev(rev) else {
            return json!({"start": 0, "ids": []});
        };
        let mut ids = vec![hash.to_string()];
        let mut cursor = self.revs.get(rev).and_then(|e| e.parent.clone());
        while let Some(parent) = cursor {
            if let Some((_, h)) = parse_rev(&parent) {
                ids.push(h.to_string());
            }
            cursor = self.revs.get(&parent).and_then(|e| e.parent.clone());
        }
        json!({"start": start, "ids": ids})
    }
}

/// The full edit path of a replicated document, leaf first, derived from
/// its `_revisions` field; falls back to the bare `_rev` when no history
/// was sent.
fn edit_path(doc: &Value) -> Vec<(String, Option<String>)> {
    if let (Some(start), Some(ids)) = (
        doc["_revisions"]["start"].as_u64(),
        doc["_revisions"]["ids"].as_array(),
    ) {
        let revs: Vec<String> = ids
            .iter()
            .enumerate()
            .filter_map(|(k, hash)| {
                let hash = hash.as_str()?;
                start.checked_sub(k as u64).map(|g| format!("{g}-{hash}"))
            })
            .collect();
        return revs
            .iter()
            .enumerate()
            .map(|(k, rev)| (rev.clone(), revs.get(k + 1).cloned()))
            .collect();
    }
    match doc["_rev"].as_str() {
        Some(rev) => vec![(rev.to_string(), None)],
        None => Vec::new(),
    }
}

fn stored_body(doc: &Value) -> Value {
    let mut body = doc.clone();
    if let Some(map) = body.as_object_mut() {
        map.remove("_revisions");
    }
    body
}

fn path_of(parts: &[&str]) -> String {
    format!("/{}", parts.join("/"))
}

fn not_found(parts: &[&str]) -> StoreError {
    StoreError::NotFound {
        path: path_of(parts),
    }
}

fn db_missing(name: &str) -> StoreError {
    StoreError::NotFound {
        path: format!("/{name}"),
    }
}

fn doc_missing(name: &str, id: &str) -> StoreError {
    StoreError::NotFound {
        path: format!("/{name}/{id}"),
    }
}

fn bad_request(parts: &[&str], reason: &str) -> StoreError {
    StoreError::BadRequest {
        path: path_of(parts),
        reason: reason.to_string(),
    }
}

/// Volatile in-process [`Store`].
pub struct MemoryStore {
    uuid: String,
    longpoll_wait: Duration,
    inner: RwLock<FxHashMap<String, Database>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    #[must_use]
    pub fn new() -> Self {
        let bytes: [u8; 16] = rand::rng().random();
        Self {
            uuid: HEXLOWER.encode(&bytes),
            longpoll_wait: Duration::from_millis(25),
            inner: RwLock::new(FxHashMap::default()),
        }
    }

    /// How long an empty long-poll `_changes` request waits for a write
    /// before returning. Bounded so a quiet database can never hang a
    /// continuous session.
    #[must_use]
    pub fn with_longpoll_wait(mut self, wait: Duration) -> Self {
        self.longpoll_wait = wait;
        self
    }

    fn db_info(&self, name: &str) -> Result<Value> {
        let guard = self.inner.read();
        let db = guard.get(name).ok_or_else(|| db_missing(name))?;
        let doc_count = db.docs.values().filter(|t| t.winner().is_some()).count();
        Ok(json!({
            "db_name": name,
            "update_seq": db.update_seq,
            "doc_count": doc_count,
        }))
    }

    fn db_create(&self, name: &str) -> Result<Value> {
        let mut guard = self.inner.write();
        if guard.contains_key(name) {
            return Err(StoreError::PreconditionFailed {
                path: format!("/{name}"),
            });
        }
        guard.insert(name.to_string(), Database::default());
        Ok(json!({"ok": true}))
    }

    fn db_delete(&self, name: &str) -> Result<Value> {
        let mut guard = self.inner.write();
        guard
            .remove(name)
            .map(|_| json!({"ok": true}))
            .ok_or_else(|| db_missing(name))
    }

    fn all_dbs(&self) -> Value {
        let guard = self.inner.read();
        let mut names: Vec<&String> = guard.keys().collect();
        names.sort();
        json!(names)
    }

    fn save_standard(&self, name: &str, id: &str, mut body: Value, expected: Option<String>) -> Result<Value> {
        let notify;
        let reply;
        {
            let mut guard = self.inner.write();
            let db = guard.get_mut(name).ok_or_else(|| db_missing(name))?;
            let Database {
                docs,
                update_seq,
                notify: db_notify,
                ..
            } = db;
            if !body.is_object() {
                return Err(bad_request(&[name, id], "document body is not an object"));
            }
            let tree = docs.entry(id.to_string()).or_default();
            let current = tree.winner().map(str::to_string);
            if current.as_deref() != expected.as_deref() {
                return Err(StoreError::Conflict {
                    path: format!("/{name}/{id}"),
                });
            }
            let deleted = body["_deleted"].as_bool().unwrap_or(false);
            let generation = expected
                .as_deref()
                .and_then(parse_rev)
                .map_or(0, |(g, _)| g);
            let rev = make_rev(generation + 1, expected.as_deref(), &body);
            body["_id"] = json!(id);
            body["_rev"] = json!(rev);
            tree.revs.insert(
                rev.clone(),
                RevEntry {
                    body: Some(body),
                    parent: expected,
                    deleted,
                },
            );
            *update_seq += 1;
            tree.seq = *update_seq;
            notify = Arc::clone(db_notify);
            reply = json!({"ok": true, "id": id, "rev": rev});
        }
        notify.notify_waiters();
        Ok(reply)
    }

    fn doc_put(&self, name: &str, id: &str, body: Option<&Value>, query: &Query) -> Result<Value> {
        let body = body
            .ok_or_else(|| bad_request(&[name, id], "document body required"))?
            .clone();
        let expected = query
            .get("rev")
            .map(str::to_string)
            .or_else(|| body["_rev"].as_str().map(str::to_string));
        self.save_standard(name, id, body, expected)
    }

    fn doc_post(&self, name: &str, body: Option<&Value>) -> Result<Value> {
        let body = body
            .ok_or_else(|| bad_request(&[name], "document body required"))?
            .clone();
        let id = match body["_id"].as_str() {
            Some(id) => id.to_string(),
            None => {
                let bytes: [u8; 16] = rand::rng().random();
                HEXLOWER.encode(&bytes)
            }
        };
        let expected = body["_rev"].as_str().map(str::to_string);
        self.save_standard(name, &id, body, expected)
    }

    fn doc_get(&self, name: &str, id: &str, query: &Query) -> Result<Value> {
        let guard = self.inner.read();
        let db = guard.get(name).ok_or_else(|| db_missing(name))?;
        let tree = db.docs.get(id).ok_or_else(|| doc_missing(name, id))?;
        let rev = match query.get("rev") {
            Some(rev) => rev.to_string(),
            None => tree
                .winner()
                .ok_or_else(|| doc_missing(name, id))?
                .to_string(),
        };
        let entry = tree.revs.get(&rev).ok_or_else(|| doc_missing(name, id))?;
        let mut body = entry
            .body
            .clone()
            .ok_or_else(|| doc_missing(name, id))?;
        if query.get("revs") == Some("true") {
            body["_revisions"] = tree.revisions_of(&rev);
        }
        // Attachments are stored inline with the body; `atts_since` is a
        // bandwidth concern for a networked peer and is ignored here.
        Ok(body)
    }

    fn bulk_docs(&self, name: &str, body: Option<&Value>) -> Result<Value> {
        let parts = [name, "_bulk_docs"];
        let body = body.ok_or_else(|| bad_request(&parts, "body required"))?;
        let docs = body["docs"]
            .as_array()
            .ok_or_else(|| bad_request(&parts, "body carries no docs array"))?;
        if body["new_edits"].as_bool().unwrap_or(true) {
            let mut rows = Vec::with_capacity(docs.len());
            for doc in docs {
                let id = doc["_id"]
                    .as_str()
                    .ok_or_else(|| bad_request(&parts, "doc carries no _id"))?
                    .to_string();
                let expected = doc["_rev"].as_str().map(str::to_string);
                rows.push(self.save_standard(name, &id, doc.clone(), expected)?);
            }
            return Ok(Value::Array(rows));
        }

        // new_edits=false: accept each document's revision history
        // verbatim, creating or extending conflict branches.
        let notify;
        {
            let mut guard = self.inner.write();
            let db = guard.get_mut(name).ok_or_else(|| db_missing(name))?;
            let Database {
                docs: trees,
                update_seq,
                notify: db_notify,
                ..
            } = db;
            for doc in docs {
                let Some(id) = doc["_id"].as_str() else {
                    continue;
                };
                let tree = trees.entry(id.to_string()).or_default();
                let deleted = doc["_deleted"].as_bool().unwrap_or(false);
                let chain = edit_path(doc);
                let mut touched = false;
                for (idx, (rev, parent)) in chain.iter().enumerate().rev() {
                    match tree.revs.entry(rev.clone()) {
                        Entry::Occupied(mut known) => {
                            // A revision previously known only as a stub
                            // gains its body when the leaf arrives.
                            if idx == 0 && known.get().body.is_none() {
                                known.get_mut().body = Some(stored_body(doc));
                                known.get_mut().deleted = deleted;
                                touched = true;
                            }
                        }
                        Entry::Vacant(slot) => {
                            slot.insert(RevEntry {
                                body: (idx == 0).then(|| stored_body(doc)),
                                parent: parent.clone(),
                                deleted: idx == 0 && deleted,
                            });
                            touched = true;
                        }
                    }
                }
                if touched {
                    *update_seq += 1;
                    tree.seq = *update_seq;
                }
            }
            notify = Arc::clone(db_notify);
        }
        notify.notify_waiters();
        Ok(json!([]))
    }

    fn revs_diff(&self, name: &str, body: Option<&Value>) -> Result<Value> {
        let parts = [name, "_revs_diff"];
        let body = body
            .ok_or_else(|| bad_request(&parts, "body required"))?
            .as_object()
            .ok_or_else(|| bad_request(&parts, "body is not an id → revs map"))?
            .clone();
        let guard = self.inner.read();
        let db = guard.get(name).ok_or_else(|| db_missing(name))?;
        let mut out = serde_json::Map::new();
        for (id, revs) in &body {
            let Some(revs) = revs.as_array() else {
                continue;
            };
            let tree = db.docs.get(id);
            let missing: Vec<&str> = revs
                .iter()
                .filter_map(Value::as_str)
                .filter(|rev| tree.is_none_or(|t| !t.revs.contains_key(*rev)))
                .collect();
            if missing.is_empty() {
                continue;
            }
            let mut entry = json!({"missing": missing});
            if let Some(ancestors) = tree.map(DocTree::leaf_revs)
                && !ancestors.is_empty()
            {
                entry["possible_ancestors"] = json!(ancestors);
            }
            out.insert(id.clone(), entry);
        }
        Ok(Value::Object(out))
    }

    async fn changes(&self, name: &str, query: &Query) -> Result<Value> {
        let since = query
            .get("since")
            .and_then(|s| s.parse::<u64>().ok())
            .unwrap_or(0);
        let limit = query
            .get("limit")
            .and_then(|s| s.parse::<usize>().ok())
            .unwrap_or(usize::MAX);
        let all_docs = query.get("style") == Some("all_docs");
        let longpoll = query.get("feed") == Some("longpoll");

        let notify = {
            let guard = self.inner.read();
            let db = guard.get(name).ok_or_else(|| db_missing(name))?;
            let feed = collect_changes(db, since, limit, all_docs);
            let empty = feed["results"].as_array().is_some_and(Vec::is_empty);
            if !(longpoll && empty) {
                return Ok(feed);
            }
            Arc::clone(&db.notify)
        };
        // Long poll: hold until a write lands or the bounded wait lapses,
        // then report once more.
        let _ = tokio::time::timeout(self.longpoll_wait, notify.notified()).await;
        let guard = self.inner.read();
        let db = guard.get(name).ok_or_else(|| db_missing(name))?;
        Ok(collect_changes(db, since, limit, all_docs))
    }

    fn ensure_full_commit(&self, name: &str) -> Result<Value> {
        let guard = self.inner.read();
        guard
            .get(name)
            .map(|_| json!({"ok": true, "instance_start_time": "0"}))
            .ok_or_else(|| db_missing(name))
    }

    fn local_get(&self, name: &str, id: &str) -> Result<Value> {
        let guard = self.inner.read();
        let db = guard.get(name).ok_or_else(|| db_missing(name))?;
        db.local
            .get(id)
            .cloned()
            .ok_or_else(|| doc_missing(name, &format!("_local/{id}")))
    }

    fn local_put(&self, name: &str, id: &str, body: Option<&Value>) -> Result<Value> {
        let parts = [name, "_local", id];
        let mut body = body
            .ok_or_else(|| bad_request(&parts, "document body required"))?
            .clone();
        if !body.is_object() {
            return Err(bad_request(&parts, "document body is not an object"));
        }
        let mut guard = self.inner.write();
        let db = guard.get_mut(name).ok_or_else(|| db_missing(name))?;
        let current = db.local.get(id).and_then(|doc| doc["_rev"].as_str());
        if current != body["_rev"].as_str() {
            return Err(StoreError::Conflict {
                path: path_of(&parts),
            });
        }
        let next = current
            .and_then(|rev| rev.strip_prefix("0-"))
            .and_then(|n| n.parse::<u64>().ok())
            .unwrap_or(0)
            + 1;
        let rev = format!("0-{next}");
        let full_id = format!("_local/{id}");
        body["_id"] = json!(full_id);
        body["_rev"] = json!(rev);
        db.local.insert(id.to_string(), body);
        Ok(json!({"ok": true, "id": full_id, "rev": rev}))
    }

    fn local_delete(&self, name: &str, id: &str) -> Result<Value> {
        let mut guard = self.inner.write();
        let db = guard.get_mut(name).ok_or_else(|| db_missing(name))?;
        db.local
            .remove(id)
            .map(|_| json!({"ok": true}))
            .ok_or_else(|| doc_missing(name, &format!("_local/{id}")))
    }
}

fn collect_changes(db: &Database, since: u64, limit: usize, all_docs: bool) -> Value {
    let mut changed: Vec<(u64, &String, &DocTree)> = db
        .docs
        .iter()
        .filter(|(_, tree)| tree.seq > since)
        .map(|(id, tree)| (tree.seq, id, tree))
        .collect();
    changed.sort_by_key(|(seq, ..)| *seq);
    changed.truncate(limit);
    let last_seq = changed.last().map_or(db.update_seq, |(seq, ..)| *seq);
    let results: Vec<Value> = changed
        .into_iter()
        .map(|(seq, id, tree)| {
            let revs = if all_docs {
                tree.leaf_revs()
            } else {
                tree.winner().map(str::to_string).into_iter().collect()
            };
            let changes: Vec<Value> = revs.iter().map(|rev| json!({"rev": rev})).collect();
            let mut row = json!({"seq": seq, "id": id, "changes": changes});
            if tree.winner().is_none() {
                row["deleted"] = json!(true);
            }
            row
        })
        .collect();
    json!({"last_seq": last_seq, "results": results})
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, parts: &[&str], query: &Query) -> Result<Value> {
        match parts {
            [] => Ok(json!({
                "couchdb": "Welcome",
                "uuid": self.uuid,
                "version": "1.6.1",
            })),
            ["_all_dbs"] => Ok(self.all_dbs()),
            [db] => self.db_info(db),
            [db, "_changes"] => self.changes(db, query).await,
            [db, "_local", id] => self.local_get(db, id),
            [db, id] => self.doc_get(db, id, query),
            _ => Err(not_found(parts)),
        }
    }

    async fn post(&self, body: Option<&Value>, parts: &[&str], _query: &Query) -> Result<Value> {
        match parts {
            [db, "_revs_diff"] => self.revs_diff(db, body),
            [db, "_bulk_docs"] => self.bulk_docs(db, body),
            [db, "_ensure_full_commit"] => self.ensure_full_commit(db),
            [db] => self.doc_post(db, body),
            _ => Err(not_found(parts)),
        }
    }

    async fn put(&self, body: Option<&Value>, parts: &[&str], query: &Query) -> Result<Value> {
        match parts {
            [db] => self.db_create(db),
            [db, "_local", id] => self.local_put(db, id, body),
            [db, id] => self.doc_put(db, id, body, query),
            _ => Err(not_found(parts)),
        }
    }

    async fn delete(&self, parts: &[&str], _query: &Query) -> Result<Value> {
        match parts {
            [db] => self.db_delete(db),
            [db, "_local", id] => self.local_delete(db, id),
            _ => Err(not_found(parts)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new()
    }

    #[tokio::test]
    async fn database_lifecycle() {
        let s = store();
        assert!(s.db_create("alpha").is_ok());
        let err = s.db_create("alpha").unwrap_err();
        assert!(err.is_precondition_failed());
        let info = s.db_info("alpha").unwrap();
        assert_eq!(info["update_seq"], 0);
        assert!(s.db_delete("alpha").is_ok());
        assert!(s.db_info("alpha").unwrap_err().is_not_found());
    }

    #[tokio::test]
    async fn writes_advance_the_changes_feed() {
        let s = store();
        s.db_create("db").unwrap();
        for n in 0..3 {
            let body = json!({"_id": format!("doc-{n}"), "n": n});
            s.doc_put("db", &format!("doc-{n}"), Some(&body), &Query::new())
                .unwrap();
        }
        let feed = s.changes("db", &Query::new().json("since", &0_u64)).await.unwrap();
        assert_eq!(feed["last_seq"], 3);
        assert_eq!(feed["results"].as_array().unwrap().len(), 3);

        let feed = s.changes("db", &Query::new().json("since", &2_u64)).await.unwrap();
        assert_eq!(feed["results"].as_array().unwrap().len(), 1);
        assert_eq!(feed["results"][0]["id"], "doc-2");
    }

    #[tokio::test]
    async fn update_bumps_generation_and_replaces_winner() {
        let s = store();
        s.db_create("db").unwrap();
        let saved = s
            .doc_put("db", "d", Some(&json!({"_id": "d", "x": 1})), &Query::new())
            .unwrap();
        let rev1 = saved["rev"].as_str().unwrap().to_string();
        assert!(rev1.starts_with("1-"));
        let saved = s
            .doc_put(
                "db",
                "d",
                Some(&json!({"_id": "d", "_rev": rev1, "x": 2})),
                &Query::new(),
            )
            .unwrap();
        assert!(saved["rev"].as_str().unwrap().starts_with("2-"));
        let doc = s.doc_get("db", "d", &Query::new()).unwrap();
        assert_eq!(doc["x"], 2);
    }

    #[tokio::test]
    async fn stale_rev_conflicts() {
        let s = store();
        s.db_create("db").unwrap();
        s.doc_put("db", "d", Some(&json!({"_id": "d"})), &Query::new())
            .unwrap();
        let err = s
            .doc_put(
                "db",
                "d",
                Some(&json!({"_id": "d", "_rev": "1-bogus"})),
                &Query::new(),
            )
            .unwrap_err();
        assert!(err.is_conflict());
    }

    #[tokio::test]
    async fn new_edits_false_preserves_branches() {
        let s = store();
        s.db_create("db").unwrap();
        let branches = json!({
            "docs": [
                {
                    "_id": "d",
                    "_rev": "2-aaa",
                    "x": "foo",
                    "_revisions": {"start": 2, "ids": ["aaa", "base"]},
                },
                {
                    "_id": "d",
                    "_rev": "2-bbb",
                    "x": "bar",
                    "_revisions": {"start": 2, "ids": ["bbb", "base"]},
                },
            ],
            "new_edits": false,
        });
        s.bulk_docs("db", Some(&branches)).unwrap();

        let feed = collect_changes(&s.inner.read()["db"], 0, usize::MAX, true);
        let row = &feed["results"][0];
        let leaves: Vec<&str> = row["changes"]
            .as_array()
            .unwrap()
            .iter()
            .map(|c| c["rev"].as_str().unwrap())
            .collect();
        assert_eq!(leaves, vec!["2-bbb", "2-aaa"]);

        // Winner is the greatest leaf; its history walks the stub.
        let doc = s
            .doc_get("db", "d", &Query::new().json("revs", &true))
            .unwrap();
        assert_eq!(doc["_rev"], "2-bbb");
        assert_eq!(doc["_revisions"], json!({"start": 2, "ids": ["bbb", "base"]}));
    }

    #[tokio::test]
    async fn pushing_a_known_revision_is_a_no_op() {
        let s = store();
        s.db_create("db").unwrap();
        let push = json!({
            "docs": [{
                "_id": "d",
                "_rev": "1-aaa",
                "_revisions": {"start": 1, "ids": ["aaa"]},
            }],
            "new_edits": false,
        });
        s.bulk_docs("db", Some(&push)).unwrap();
        let seq_before = s.db_info("db").unwrap()["update_seq"].clone();
        s.bulk_docs("db", Some(&push)).unwrap();
        assert_eq!(s.db_info("db").unwrap()["update_seq"], seq_before);
    }

    #[tokio::test]
    async fn revs_diff_reports_only_unknown_revisions() {
        let s = store();
        s.db_create("db").unwrap();
        let saved = s
            .doc_put("db", "d", Some(&json!({"_id": "d"})), &Query::new())
            .unwrap();
        let known = saved["rev"].as_str().unwrap();
        let diff = s
            .revs_diff("db", Some(&json!({"d": [known, "9-nope"], "ghost": ["1-x"]})))
            .unwrap();
        assert_eq!(diff["d"]["missing"], json!(["9-nope"]));
        assert_eq!(diff["d"]["possible_ancestors"], json!([known]));
        assert_eq!(diff["ghost"]["missing"], json!(["1-x"]));
        assert!(diff["ghost"]["possible_ancestors"].is_null());
    }

    #[tokio::test]
    async fn local_docs_conflict_on_stale_rev() {
        let s = store();
        s.db_create("db").unwrap();
        let saved = s
            .local_put("db", "ckpt", Some(&json!({"update_seq": 1})))
            .unwrap();
        assert_eq!(saved["rev"], "0-1");
        let err = s
            .local_put("db", "ckpt", Some(&json!({"update_seq": 2})))
            .unwrap_err();
        assert!(err.is_conflict());
        let current = s.local_get("db", "ckpt").unwrap();
        let saved = s
            .local_put(
                "db",
                "ckpt",
                Some(&json!({"_rev": current["_rev"], "update_seq": 2})),
            )
            .unwrap();
        assert_eq!(saved["rev"], "0-2");
    }

    #[tokio::test]
    async fn longpoll_returns_once_a_write_lands() {
        let s = Arc::new(store());
        s.db_create("db").unwrap();
        let writer = Arc::clone(&s);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            writer
                .doc_put("db", "d", Some(&json!({"_id": "d"})), &Query::new())
                .unwrap();
        });
        let query = Query::new().str("feed", "longpoll").json("since", &0_u64);
        let feed = s.changes("db", &query).await.unwrap();
        assert_eq!(feed["results"].as_array().unwrap().len(), 1);
        handle.await.unwrap();
    }
}
