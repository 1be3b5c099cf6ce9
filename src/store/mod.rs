//! Document-store access layer.
//!
//! Everything above this module speaks to a peer through the [`Store`]
//! trait: four JSON REST verbs addressed by server-rooted path segments
//! plus a [`Query`]. Two implementations are provided:
//!
//! - [`HttpStore`]: a CouchDB peer over HTTP (reqwest, rustls, basic
//!   auth, single transparent retry on closed-idle connections).
//! - [`MemoryStore`]: an in-process store with the same observable
//!   semantics, for tests and ephemeral runs.
//!
//! [`Server`] and [`Db`] are thin handles layered on an `Arc<dyn Store>`;
//! a `Db` is a `Server` plus a database name, from which all paths are
//! derived. Handles are cheap to clone and share one underlying client,
//! so connections are reused across databases on the same peer.

use async_trait::async_trait;
use miette::Diagnostic;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;
use tracing::warn;

pub mod http;
pub mod memory;

pub use http::HttpStore;
pub use memory::MemoryStore;

/// Prefix marking names internal to the document store: design and
/// local documents, system databases. Such names never replicate.
pub const RESERVED_PREFIX: char = '_';

/// Errors surfaced by store implementations.
///
/// The variants mirror the document store's failure modes rather than any
/// particular transport: callers branch on [`is_not_found`] for missing
/// checkpoints, [`is_conflict`] for checkpoint races, and
/// [`is_precondition_failed`] for "database already exists".
///
/// [`is_not_found`]: StoreError::is_not_found
/// [`is_conflict`]: StoreError::is_conflict
/// [`is_precondition_failed`]: StoreError::is_precondition_failed
#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("not found: {path}")]
    #[diagnostic(code(weft::store::not_found))]
    NotFound { path: String },

    #[error("conflict: {path}")]
    #[diagnostic(code(weft::store::conflict))]
    Conflict { path: String },

    #[error("precondition failed: {path}")]
    #[diagnostic(code(weft::store::precondition_failed))]
    PreconditionFailed { path: String },

    #[error("unauthorized: {path}")]
    #[diagnostic(
        code(weft::store::unauthorized),
        help("Check the peer credentials; auth failures are fatal for a session.")
    )]
    Unauthorized { path: String },

    #[error("bad request: {path}: {reason}")]
    #[diagnostic(code(weft::store::bad_request))]
    BadRequest { path: String, reason: String },

    #[error("client error {status} on {path}: {reason}")]
    #[diagnostic(code(weft::store::client))]
    Client {
        status: u16,
        path: String,
        reason: String,
    },

    #[error("server error {status} on {path}: {reason}")]
    #[diagnostic(
        code(weft::store::server),
        help("The peer is unhealthy; the session aborts and the supervisor respawns it.")
    )]
    Server {
        status: u16,
        path: String,
        reason: String,
    },

    #[error("request timed out: {path}")]
    #[diagnostic(code(weft::store::timeout))]
    Timeout { path: String },

    #[error("transport error on {path}: {message}")]
    #[diagnostic(code(weft::store::transport))]
    Transport { path: String, message: String },

    #[error("undecodable response from {path}: {message}")]
    #[diagnostic(code(weft::store::decode))]
    Decode { path: String, message: String },
}

impl StoreError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }

    pub fn is_precondition_failed(&self) -> bool {
        matches!(self, Self::PreconditionFailed { .. })
    }

    /// Map an HTTP-shaped status code onto the taxonomy.
    pub(crate) fn from_status(status: u16, path: &str, reason: &str) -> Self {
        let path = path.to_string();
        let reason = reason.to_string();
        match status {
            400 => Self::BadRequest { path, reason },
            401 => Self::Unauthorized { path },
            404 => Self::NotFound { path },
            409 => Self::Conflict { path },
            412 => Self::PreconditionFailed { path },
            s if s >= 500 => Self::Server {
                status: s,
                path,
                reason,
            },
            s => Self::Client {
                status: s,
                path,
                reason,
            },
        }
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// Query-string pairs with the store's value encoding: values that are
/// not already strings are JSON-encoded, and pairs are emitted sorted by
/// key so requests are canonical.
///
/// # Examples
///
/// ```
/// use weft::store::Query;
///
/// let query = Query::new()
///     .str("style", "all_docs")
///     .json("limit", &50_u64)
///     .json("atts_since", &vec!["1-a".to_string()]);
/// assert_eq!(
///     query.pairs(),
///     vec![
///         ("atts_since", r#"["1-a"]"#),
///         ("limit", "50"),
///         ("style", "all_docs"),
///     ]
/// );
/// ```
#[derive(Debug, Clone, Default)]
pub struct Query {
    pairs: Vec<(String, String)>,
}

impl Query {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw string value, emitted as-is.
    #[must_use]
    pub fn str(mut self, key: &str, value: impl Into<String>) -> Self {
        self.pairs.push((key.to_string(), value.into()));
        self
    }

    /// Append a JSON-encoded value (numbers, booleans, arrays), the
    /// encoding the store expects for every non-string parameter.
    #[must_use]
    pub fn json<T: Serialize + ?Sized>(mut self, key: &str, value: &T) -> Self {
        let encoded =
            serde_json::to_string(value).expect("query values are plain JSON scalars or arrays");
        self.pairs.push((key.to_string(), encoded));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }

    /// The pairs, sorted by key.
    pub fn pairs(&self) -> Vec<(&str, &str)> {
        let mut out: Vec<(&str, &str)> = self
            .pairs
            .iter()
            .map(|(k, v)| (k.as_str(), v.as_str()))
            .collect();
        out.sort();
        out
    }

    /// Look up a value by key (last write wins).
    pub fn get(&self, key: &str) -> Option<&str> {
        self.pairs
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// Abstract document-store client.
///
/// Paths are server-rooted segment lists (`["db", "_changes"]`), never
/// pre-joined strings, so implementations control their own encoding.
/// Request bodies are empty or JSON; response bodies are JSON. With
/// these four verbs the entire replication protocol is reachable; the
/// [`Server`] and [`Db`] handles layer the path bookkeeping on top.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync`: one store instance is shared
/// by every database handle on a peer, across worker tasks.
///
/// # Examples
///
/// ```
/// use serde_json::json;
/// use weft::store::{MemoryStore, Query, Store};
///
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() -> Result<(), weft::store::StoreError> {
/// let store = MemoryStore::new();
/// store.put(None, &["mydb"], &Query::new()).await?;
/// store
///     .put(Some(&json!({"x": 1})), &["mydb", "doc"], &Query::new())
///     .await?;
/// let doc = store.get(&["mydb", "doc"], &Query::new()).await?;
/// assert_eq!(doc["x"], 1);
/// # Ok(())
/// # }
/// ```
#[async_trait]
pub trait Store: Send + Sync {
    /// `GET` the resource at `parts`.
    ///
    /// # Returns
    ///
    /// The response body as JSON; failures map onto [`StoreError`].
    async fn get(&self, parts: &[&str], query: &Query) -> Result<Value>;

    /// `POST` `body` (or an empty body) to the resource at `parts`.
    ///
    /// # Returns
    ///
    /// The response body as JSON; failures map onto [`StoreError`].
    async fn post(&self, body: Option<&Value>, parts: &[&str], query: &Query) -> Result<Value>;

    /// `PUT` `body` (or an empty body) at `parts`.
    ///
    /// # Returns
    ///
    /// The response body as JSON; failures map onto [`StoreError`].
    async fn put(&self, body: Option<&Value>, parts: &[&str], query: &Query) -> Result<Value>;

    /// `DELETE` the resource at `parts`.
    ///
    /// # Returns
    ///
    /// The response body as JSON; failures map onto [`StoreError`].
    async fn delete(&self, parts: &[&str], query: &Query) -> Result<Value>;
}

/// Handle on a peer's root resource.
#[derive(Clone)]
pub struct Server {
    store: Arc<dyn Store>,
}

impl Server {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self { store }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    /// `GET /`, the peer's welcome resource.
    pub async fn welcome(&self) -> Result<Value> {
        self.store.get(&[], &Query::new()).await
    }

    /// The peer's opaque node identifier, used only as replication-id
    /// input. One `GET /` per call; the supervisor fetches it once per
    /// peer and caches it for the process lifetime.
    ///
    /// # Returns
    ///
    /// The `uuid` field of the welcome resource, or a decode error when
    /// the peer does not carry one.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use weft::store::{MemoryStore, Server};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), weft::store::StoreError> {
    /// let server = Server::new(Arc::new(MemoryStore::new()));
    /// let node_id = server.node_id().await?;
    /// assert!(!node_id.is_empty());
    /// assert_eq!(node_id, server.node_id().await?); // stable per peer
    /// # Ok(())
    /// # }
    /// ```
    pub async fn node_id(&self) -> Result<String> {
        let welcome = self.welcome().await?;
        welcome["uuid"]
            .as_str()
            .map(str::to_string)
            .ok_or_else(|| StoreError::Decode {
                path: "/".to_string(),
                message: "peer welcome resource carries no uuid".to_string(),
            })
    }

    /// `GET /_all_dbs`.
    ///
    /// # Returns
    ///
    /// Every database name on the peer, reserved names included; the
    /// supervisor filters those out itself.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use weft::store::{MemoryStore, Server};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), weft::store::StoreError> {
    /// let server = Server::new(Arc::new(MemoryStore::new()));
    /// server.database("beta").ensure().await?;
    /// server.database("alpha").ensure().await?;
    /// assert_eq!(server.all_dbs().await?, vec!["alpha", "beta"]);
    /// # Ok(())
    /// # }
    /// ```
    pub async fn all_dbs(&self) -> Result<Vec<String>> {
        let value = self.store.get(&["_all_dbs"], &Query::new()).await?;
        serde_json::from_value(value).map_err(|e| StoreError::Decode {
            path: "/_all_dbs".to_string(),
            message: e.to_string(),
        })
    }

    pub fn database(&self, name: &str) -> Db {
        Db::new(Arc::clone(&self.store), name)
    }
}

/// Handle on one database of a peer: a [`Store`] plus a name, from which
/// all paths are derived.
#[derive(Clone)]
pub struct Db {
    store: Arc<dyn Store>,
    name: String,
}

impl Db {
    pub fn new(store: Arc<dyn Store>, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn scoped<'a>(&'a self, parts: &[&'a str]) -> Vec<&'a str> {
        let mut full = Vec::with_capacity(parts.len() + 1);
        full.push(self.name.as_str());
        full.extend_from_slice(parts);
        full
    }

    pub async fn get(&self, parts: &[&str], query: &Query) -> Result<Value> {
        self.store.get(&self.scoped(parts), query).await
    }

    pub async fn post(&self, body: Option<&Value>, parts: &[&str], query: &Query) -> Result<Value> {
        self.store.post(body, &self.scoped(parts), query).await
    }

    pub async fn put(&self, body: Option<&Value>, parts: &[&str], query: &Query) -> Result<Value> {
        self.store.put(body, &self.scoped(parts), query).await
    }

    pub async fn delete(&self, parts: &[&str], query: &Query) -> Result<Value> {
        self.store.delete(&self.scoped(parts), query).await
    }

    /// `GET /{db}`, database info, including `update_seq`.
    pub async fn info(&self) -> Result<Value> {
        self.get(&[], &Query::new()).await
    }

    /// The database's current update sequence.
    ///
    /// # Returns
    ///
    /// The `update_seq` field of the database info, the position in the
    /// change log a one-shot replication snapshots as its stop point.
    pub async fn update_seq(&self) -> Result<u64> {
        let info = self.info().await?;
        info["update_seq"]
            .as_u64()
            .ok_or_else(|| StoreError::Decode {
                path: format!("/{}", self.name),
                message: "database info carries no integer update_seq".to_string(),
            })
    }

    /// Ensure the database exists.
    ///
    /// Attempts the create and swallows the precondition failure raised
    /// when it already exists, so callers can invoke this at any time.
    ///
    /// # Returns
    ///
    /// `true` iff this call created the database.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use weft::store::{Db, MemoryStore};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), weft::store::StoreError> {
    /// let db = Db::new(Arc::new(MemoryStore::new()), "mydb");
    /// assert!(db.ensure().await?);
    /// assert!(!db.ensure().await?); // idempotent
    /// # Ok(())
    /// # }
    /// ```
    pub async fn ensure(&self) -> Result<bool> {
        match self.put(None, &[], &Query::new()).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_precondition_failed() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Apply `mutate` to the local document `id` and save it, with one
    /// conflict retry.
    ///
    /// On a conflict the latest revision is re-fetched and `mutate` is
    /// applied again before the second (and final) save attempt; a second
    /// conflict propagates. This is the only mutation pattern the
    /// replicator needs, and the single retry keeps it bounded.
    ///
    /// # Parameters
    ///
    /// * `id` - The local document id, without the `_local/` prefix
    /// * `doc` - The caller's copy of the document
    /// * `mutate` - The update to apply in place, possibly twice
    ///
    /// # Returns
    ///
    /// The saved document carrying the `_rev` assigned by the store, so
    /// follow-up saves are in-place updates.
    ///
    /// # Examples
    ///
    /// ```
    /// use std::sync::Arc;
    /// use serde_json::json;
    /// use weft::store::{Db, MemoryStore};
    ///
    /// # #[tokio::main(flavor = "current_thread")]
    /// # async fn main() -> Result<(), weft::store::StoreError> {
    /// let db = Db::new(Arc::new(MemoryStore::new()), "mydb");
    /// db.ensure().await?;
    ///
    /// let doc = json!({"_id": "_local/ckpt"});
    /// let saved = db
    ///     .update_local("ckpt", &doc, |doc| {
    ///         doc["update_seq"] = json!(7);
    ///     })
    ///     .await?;
    /// assert_eq!(saved["update_seq"], 7);
    /// assert_eq!(saved["_rev"], "0-1");
    /// # Ok(())
    /// # }
    /// ```
    pub async fn update_local<F>(&self, id: &str, doc: &Value, mutate: F) -> Result<Value>
    where
        F: Fn(&mut Value),
    {
        let mut doc = doc.clone();
        mutate(&mut doc);
        match self.save_local(id, doc.clone()).await {
            Ok(saved) => return Ok(saved),
            Err(e) if e.is_conflict() => {
                warn!(db = %self.name, id, "conflict saving local doc, retrying once");
            }
            Err(e) => return Err(e),
        }
        let mut latest = self.get(&["_local", id], &Query::new()).await?;
        mutate(&mut latest);
        self.save_local(id, latest).await
    }

    async fn save_local(&self, id: &str, mut doc: Value) -> Result<Value> {
        let reply = self.put(Some(&doc), &["_local", id], &Query::new()).await?;
        if let Some(rev) = reply["rev"].as_str() {
            doc["_rev"] = Value::String(rev.to_string());
        }
        Ok(doc)
    }
}
