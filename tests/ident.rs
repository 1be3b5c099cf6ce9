use proptest::prelude::*;
use weft::ident::{DB32_ALPHABET, is_encoded, random_id, replication_id};

#[test]
fn distinct_database_pairs_get_distinct_ids() {
    let ids = [
        replication_id("node-A", "db-FOO", "node-B", "db-FOO"),
        replication_id("node-B", "db-FOO", "node-A", "db-FOO"),
        replication_id("node-A", "db-FOO", "node-B", "db-BAR"),
        replication_id("node-A", "db-BAR", "node-B", "db-FOO"),
    ];
    for (i, a) in ids.iter().enumerate() {
        assert_eq!(a.len(), 48);
        for b in &ids[i + 1..] {
            assert_ne!(a, b);
        }
    }
}

proptest! {
    /// Pure and directional over arbitrary node and database names.
    #[test]
    fn replication_id_is_pure_and_directional(
        src_node in "[a-z0-9-]{1,24}",
        src_db in "[a-z0-9_-]{1,24}",
        dst_node in "[a-z0-9-]{1,24}",
        dst_db in "[a-z0-9_-]{1,24}",
    ) {
        prop_assume!((src_node.as_str(), src_db.as_str()) != (dst_node.as_str(), dst_db.as_str()));
        let forward = replication_id(&src_node, &src_db, &dst_node, &dst_db);
        prop_assert_eq!(&forward, &replication_id(&src_node, &src_db, &dst_node, &dst_db));
        prop_assert_eq!(forward.len(), 48);
        prop_assert!(forward.chars().all(|c| DB32_ALPHABET.contains(c)));
        prop_assert!(is_encoded(&forward));
        let reverse = replication_id(&dst_node, &dst_db, &src_node, &src_db);
        prop_assert_ne!(forward, reverse);
    }

    #[test]
    fn run_ids_always_validate(_seed in 0u8..16) {
        let id = random_id();
        prop_assert_eq!(id.len(), 24);
        prop_assert!(is_encoded(&id));
    }
}
