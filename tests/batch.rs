mod common;

use common::*;
use serde_json::json;
use weft::batch::{BatchOutcome, replicate_one_batch};
use weft::session::replicate;
use weft::store::Query;

#[tokio::test]
async fn design_documents_never_propagate() {
    let src = memory_server();
    let dst = memory_server();
    let src_db = src.database("mydb");
    src_db.ensure().await.unwrap();

    seed_docs(&src_db, 4).await;
    let design = json!({"_id": "_design/widget", "views": {"all": {"map": "_count"}}});
    src_db
        .put(Some(&design), &["_design/widget"], &Query::new())
        .await
        .unwrap();

    let mut session = session_for(&src, &dst, "mydb").await;
    replicate(&mut session).await.unwrap();

    // Progress covers the design row's sequence, but the document
    // itself never reaches the destination.
    assert_eq!(session.doc_count, 4);
    assert_eq!(session.update_seq, Some(5));
    let dst_db = dst.database("mydb");
    let err = dst_db
        .get(&["_design/widget"], &Query::new())
        .await
        .unwrap_err();
    assert!(err.is_not_found());
    assert_eq!(digest(&dst_db).await.len(), 4);
}

#[tokio::test]
async fn filtered_only_changes_still_advance_the_checkpoint() {
    let src = memory_server();
    let dst = memory_server();
    let src_db = src.database("mydb");
    src_db.ensure().await.unwrap();
    let design = json!({"_id": "_design/only", "language": "javascript"});
    src_db
        .put(Some(&design), &["_design/only"], &Query::new())
        .await
        .unwrap();

    let mut session = session_for(&src, &dst, "mydb").await;
    replicate(&mut session).await.unwrap();

    assert_eq!(session.doc_count, 0);
    assert_eq!(session.update_seq, Some(1));
    let ckpt = stored_checkpoint(&dst.database("mydb"), &session.replication_id)
        .await
        .unwrap();
    assert_eq!(ckpt["update_seq"], 1);
}

#[tokio::test]
async fn caught_up_batches_report_idle() {
    let src = memory_server();
    let dst = memory_server();
    let src_db = src.database("mydb");
    src_db.ensure().await.unwrap();
    seed_docs(&src_db, 3).await;

    let mut session = session_for(&src, &dst, "mydb").await;
    assert_eq!(
        replicate_one_batch(&mut session).await.unwrap(),
        BatchOutcome::Progressed
    );
    assert_eq!(session.doc_count, 3);

    // Nothing new: the staged sequence equals the committed one.
    assert_eq!(
        replicate_one_batch(&mut session).await.unwrap(),
        BatchOutcome::Idle
    );
    assert_eq!(session.doc_count, 3);
}

#[tokio::test]
async fn transfers_preserve_edit_history() {
    let src = memory_server();
    let dst = memory_server();
    let src_db = src.database("mydb");
    let dst_db = dst.database("mydb");
    src_db.ensure().await.unwrap();

    seed_docs(&src_db, 1).await;
    bump(&src_db, "doc-000", |doc| doc["n"] = json!(1)).await;
    bump(&src_db, "doc-000", |doc| doc["n"] = json!(2)).await;

    let mut session = session_for(&src, &dst, "mydb").await;
    replicate(&mut session).await.unwrap();

    // Only the leaf crosses the wire, but it carries its ancestry: the
    // destination can extend this branch later instead of conflicting.
    assert_eq!(session.doc_count, 1);
    let src_doc = src_db
        .get(&["doc-000"], &Query::new().json("revs", &true))
        .await
        .unwrap();
    let dst_doc = dst_db
        .get(&["doc-000"], &Query::new().json("revs", &true))
        .await
        .unwrap();
    assert_eq!(dst_doc["_revisions"], src_doc["_revisions"]);
    assert_eq!(dst_doc["_revisions"]["start"], 3);
}
