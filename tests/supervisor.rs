mod common;

use common::*;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use weft::config::ReplicatorConfig;
use weft::store::{MemoryStore, Query, Server, Store};
use weft::supervisor::Supervisor;

fn fast_config() -> ReplicatorConfig {
    ReplicatorConfig::new()
        .with_monitor_period(Duration::from_millis(40))
        .with_reap_timeout(Duration::from_millis(5))
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(400)).await;
}

fn peer() -> (Arc<dyn Store>, Server) {
    let store: Arc<dyn Store> = Arc::new(MemoryStore::new());
    let server = Server::new(Arc::clone(&store));
    (store, server)
}

#[tokio::test(flavor = "multi_thread")]
async fn brings_up_then_discovers_and_streams() {
    let (src_store, src) = peer();
    let (dst_store, dst) = peer();

    let alpha = src.database("alpha");
    alpha.ensure().await.unwrap();
    seed_docs(&alpha, 7).await;

    let mut supervisor = Supervisor::new(src_store, dst_store, None, fast_config())
        .await
        .unwrap();
    let runner = tokio::spawn(async move { supervisor.run().await });

    // Initial sync-up replicates the pre-existing database.
    settle().await;
    let dst_alpha = dst.database("alpha");
    assert_eq!(digest(&alpha).await, digest(&dst_alpha).await);
    assert_eq!(digest(&dst_alpha).await.len(), 7);

    // A database created after startup is discovered within a tick and
    // replicated by a worker spawned directly into continuous mode.
    let beta = src.database("beta");
    beta.ensure().await.unwrap();
    seed_docs(&beta, 5).await;
    settle().await;
    assert_eq!(digest(&beta).await, digest(&dst.database("beta")).await);

    // Continuous mode keeps streaming without any further one-shots.
    alpha
        .put(Some(&json!({"_id": "late", "fresh": true})), &["late"], &Query::new())
        .await
        .unwrap();
    settle().await;
    assert_eq!(winner(&dst_alpha, "late").await["fresh"], true);

    runner.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn reserved_and_filtered_names_are_skipped() {
    let (src_store, src) = peer();
    let (dst_store, dst) = peer();

    for name in ["kept", "skipme", "_users"] {
        let db = src.database(name);
        db.ensure().await.unwrap();
        db.put(Some(&json!({"_id": "x"})), &["x"], &Query::new())
            .await
            .unwrap();
    }

    let filter: weft::supervisor::NamesFilter = Arc::new(|name: &str| name != "skipme");
    let mut supervisor = Supervisor::new(src_store, dst_store, Some(filter), fast_config())
        .await
        .unwrap();
    let runner = tokio::spawn(async move { supervisor.run().await });

    settle().await;
    let dst_server = dst;
    let dbs = dst_server.all_dbs().await.unwrap();
    assert!(dbs.contains(&"kept".to_string()));
    assert!(!dbs.contains(&"skipme".to_string()));
    assert!(!dbs.contains(&"_users".to_string()));

    runner.abort();
}

#[tokio::test(flavor = "multi_thread")]
async fn crashed_workers_are_reaped_and_respawned_on_rediscovery() {
    let (src_store, src) = peer();
    let (dst_store, dst) = peer();

    let alpha = src.database("alpha");
    alpha.ensure().await.unwrap();
    seed_docs(&alpha, 3).await;

    let mut supervisor = Supervisor::new(src_store, dst_store, None, fast_config())
        .await
        .unwrap();
    let runner = tokio::spawn(async move { supervisor.run().await });
    settle().await;
    assert_eq!(digest(&dst.database("alpha")).await.len(), 3);

    // Dropping the source database kills the worker on its next poll;
    // recreating it makes discovery spawn a fresh one, which resumes
    // from zero and converges again.
    src.store().delete(&["alpha"], &Query::new()).await.unwrap();
    settle().await;

    let reborn = src.database("alpha");
    reborn.ensure().await.unwrap();
    reborn
        .put(Some(&json!({"_id": "phoenix"})), &["phoenix"], &Query::new())
        .await
        .unwrap();
    settle().await;
    let dst_alpha = dst.database("alpha");
    assert_eq!(winner(&dst_alpha, "phoenix").await["_id"], "phoenix");

    runner.abort();
}

/// Three databases, paired supervisors: a database present on both
/// peers converges bidirectionally, and databases private to either
/// peer appear on the other.
#[tokio::test(flavor = "multi_thread")]
async fn paired_supervisors_converge_both_ways() {
    let (store_one, one) = peer();
    let (store_two, two) = peer();

    let alpha_one = one.database("alpha");
    alpha_one.ensure().await.unwrap();
    alpha_one
        .put(Some(&json!({"_id": "from-one"})), &["from-one"], &Query::new())
        .await
        .unwrap();
    let alpha_two = two.database("alpha");
    alpha_two.ensure().await.unwrap();
    alpha_two
        .put(Some(&json!({"_id": "from-two"})), &["from-two"], &Query::new())
        .await
        .unwrap();

    let beta = one.database("beta");
    beta.ensure().await.unwrap();
    seed_docs(&beta, 3).await;

    let gamma = two.database("gamma");
    gamma.ensure().await.unwrap();
    seed_docs(&gamma, 2).await;

    let mut forward = Supervisor::new(
        Arc::clone(&store_one),
        Arc::clone(&store_two),
        None,
        fast_config(),
    )
    .await
    .unwrap();
    let mut backward = Supervisor::new(store_two, store_one, None, fast_config())
        .await
        .unwrap();
    let fwd = tokio::spawn(async move { forward.run().await });
    let bwd = tokio::spawn(async move { backward.run().await });

    settle().await;
    settle().await;

    assert_eq!(one.all_dbs().await.unwrap(), two.all_dbs().await.unwrap());
    for peer in [&one, &two] {
        let alpha = peer.database("alpha");
        assert_eq!(winner(&alpha, "from-one").await["_id"], "from-one");
        assert_eq!(winner(&alpha, "from-two").await["_id"], "from-two");
    }
    assert_eq!(
        digest(&one.database("beta")).await,
        digest(&two.database("beta")).await
    );
    assert_eq!(
        digest(&one.database("gamma")).await,
        digest(&two.database("gamma")).await
    );

    fwd.abort();
    bwd.abort();
}
