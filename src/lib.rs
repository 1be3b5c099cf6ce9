//! # Weft: CouchDB-compatible logical replication
//!
//! Weft propagates every non-design document from a source database to a
//! destination database, attachments and conflict branches included, with
//! resumable checkpointed sessions, a continuous long-poll mode, and a
//! supervisor that keeps every user database on two peers in sync.
//!
//! ## Core Concepts
//!
//! - **Replication id**: a stable 48-character name for one directional
//!   replication of one database pair ([`ident`])
//! - **Checkpoint**: small `_local` documents on both peers recording
//!   the furthest update sequence safely transferred ([`checkpoint`])
//! - **Batch**: one bounded changes page pulled, diffed, fetched and
//!   pushed with edit histories preserved ([`batch`])
//! - **Session**: the owned per-database state driving batches one-shot
//!   or forever ([`session`])
//! - **Supervisor**: one continuous worker per source database, with
//!   discovery and crash respawn ([`supervisor`])
//!
//! ## Quick Start
//!
//! ### Replicating one database pair
//!
//! ```
//! use std::sync::Arc;
//! use serde_json::json;
//! use weft::config::ReplicatorConfig;
//! use weft::session::{load_session, replicate};
//! use weft::store::{MemoryStore, Query, Server, Store};
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let src: Arc<dyn Store> = Arc::new(MemoryStore::new());
//! let dst: Arc<dyn Store> = Arc::new(MemoryStore::new());
//! let src_server = Server::new(Arc::clone(&src));
//! let dst_server = Server::new(Arc::clone(&dst));
//!
//! let fruit = src_server.database("fruit");
//! fruit.ensure().await?;
//! fruit
//!     .put(Some(&json!({"_id": "apple", "color": "red"})), &["apple"], &Query::new())
//!     .await?;
//!
//! let mut session = load_session(
//!     &src_server.node_id().await?,
//!     fruit,
//!     &dst_server.node_id().await?,
//!     dst_server.database("fruit"),
//!     &ReplicatorConfig::default(),
//! )
//! .await?;
//! replicate(&mut session).await?;
//! assert_eq!(session.doc_count, 1);
//! assert_eq!(session.update_seq, Some(1));
//! # Ok(())
//! # }
//! ```
//!
//! ### Supervising every database on two peers
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use weft::config::{PeerConfig, ReplicatorConfig};
//! use weft::store::{HttpStore, Store};
//! use weft::supervisor::Supervisor;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! weft::telemetry::init();
//! let src: Arc<dyn Store> = Arc::new(HttpStore::connect(&PeerConfig::from_env("WEFT_SRC")?)?);
//! let dst: Arc<dyn Store> = Arc::new(HttpStore::connect(&PeerConfig::from_env("WEFT_DST")?)?);
//! let mut supervisor = Supervisor::new(src, dst, None, ReplicatorConfig::default()).await?;
//! supervisor.run().await?; // brings up, then monitors forever
//! # Ok(())
//! # }
//! ```
//!
//! ## Faithfulness
//!
//! Transfers use `style=all_docs` on the changes feed and
//! `new_edits=false` on the bulk write, so conflicting revision branches
//! arrive on the destination exactly as they exist on the source:
//! replication is faithful, not last-write-wins. Documents whose id
//! starts with `_` (design documents, local documents) never propagate.
//!
//! ## Module Guide
//!
//! - [`ident`] - Replication ids and run ids
//! - [`store`] - The document-store interface, HTTP and in-memory
//! - [`checkpoint`] - Durable progress records on both peers
//! - [`batch`] - The one-batch transfer algorithm
//! - [`session`] - Per-database session state and the replication drivers
//! - [`supervisor`] - Multi-database worker lifecycle
//! - [`config`] - Peer and replicator configuration
//! - [`telemetry`] - Tracing setup

pub mod batch;
pub mod checkpoint;
pub mod config;
pub mod ident;
pub mod session;
pub mod store;
pub mod supervisor;
pub mod telemetry;
