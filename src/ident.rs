//! Replication identifiers and run ids.
//!
//! A replication id names one *directional* replication of one database
//! pair. It is a pure function of `(src_node, src_db, dst_node, dst_db)`:
//! the quadruple is serialized to canonical JSON under a protocol label,
//! hashed with SHA-512, and the first 30 bytes of the digest are encoded
//! with the D-Base32 alphabet, yielding a fixed 48-character string with
//! no padding (240 bits is an even multiple of 5).
//!
//! Run ids ([`random_id`]) are 120-bit random strings in the same
//! alphabet; a fresh one identifies each process-lifetime session.

use data_encoding::{Encoding, Specification};
use rand::Rng;
use sha2::{Digest, Sha512};
use std::sync::LazyLock;

/// Protocol label mixed into every replication id.
///
/// Bumping this constant invalidates all existing checkpoints, which is
/// exactly what a wire-protocol change requires.
pub const PROTOCOL: &str = "weft/protocol0";

/// The D-Base32 alphabet: sorted, unambiguous, no padding.
pub const DB32_ALPHABET: &str = "3456789ABCDEFGHIJKLMNOPQRSTUVWXY";

static DB32: LazyLock<Encoding> = LazyLock::new(|| {
    let mut spec = Specification::new();
    spec.symbols.push_str(DB32_ALPHABET);
    spec.encoding().expect("static base-32 alphabet is valid")
});

/// Build the replication id for a directional `(source, destination)`
/// database pair.
///
/// The id is stable across processes and hosts: it does not matter
/// whether the replicator runs on the source, the destination, or a
/// third machine, only which peer is which.
///
/// ```
/// use weft::ident::replication_id;
///
/// let ab = replication_id("node-A", "db-FOO", "node-B", "db-FOO");
/// let ba = replication_id("node-B", "db-FOO", "node-A", "db-FOO");
/// assert_eq!(ab.len(), 48);
/// assert_ne!(ab, ba); // directional
/// assert_eq!(ab, replication_id("node-A", "db-FOO", "node-B", "db-FOO"));
/// ```
///
/// # Panics
///
/// Panics when source and destination are the same `(node, db)` pair;
/// replicating a database onto itself is a caller misconfiguration.
pub fn replication_id(src_node: &str, src_db: &str, dst_node: &str, dst_db: &str) -> String {
    assert!(
        (src_node, src_db) != (dst_node, dst_db),
        "source and destination must differ: ({src_node:?}, {src_db:?})"
    );
    let info = serde_json::json!({
        "replicator": PROTOCOL,
        "src_node": src_node,
        "src_db": src_db,
        "dst_node": dst_node,
        "dst_db": dst_db,
    });
    // serde_json's default map is ordered by key and `to_string` is
    // compact, giving the canonical form the digest depends on.
    let data = info.to_string();
    let digest = Sha512::digest(data.as_bytes());
    DB32.encode(&digest[..30])
}

/// Generate a fresh 24-character run id (120 random bits).
pub fn random_id() -> String {
    let bytes: [u8; 15] = rand::rng().random();
    DB32.encode(&bytes)
}

/// Whether `s` is well-formed D-Base32: non-empty, a whole number of
/// 40-bit groups, and drawn entirely from the alphabet.
pub fn is_encoded(s: &str) -> bool {
    !s.is_empty() && s.len() % 8 == 0 && DB32.decode(s.as_bytes()).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn id_is_deterministic_and_directional() {
        let ab = replication_id("node-A", "db-FOO", "node-B", "db-FOO");
        assert_eq!(ab, replication_id("node-A", "db-FOO", "node-B", "db-FOO"));
        assert_ne!(ab, replication_id("node-B", "db-FOO", "node-A", "db-FOO"));
        assert_ne!(ab, replication_id("node-A", "db-FOO", "node-B", "db-BAR"));
    }

    #[test]
    fn id_uses_only_the_alphabet() {
        let id = replication_id("a", "b", "c", "d");
        assert_eq!(id.len(), 48);
        assert!(id.chars().all(|c| DB32_ALPHABET.contains(c)));
        assert!(is_encoded(&id));
    }

    #[test]
    #[should_panic(expected = "source and destination must differ")]
    fn identical_endpoints_panic() {
        replication_id("node-A", "db-FOO", "node-A", "db-FOO");
    }

    #[test]
    fn run_ids_are_well_formed() {
        let id = random_id();
        assert_eq!(id.len(), 24);
        assert!(is_encoded(&id));
        assert_ne!(id, random_id());
    }

    #[test]
    fn rejects_malformed_encodings() {
        assert!(!is_encoded(""));
        assert!(!is_encoded("abc"));
        assert!(!is_encoded("12345678")); // '1' and '2' are not in the alphabet
        assert!(!is_encoded("AAAAAAA")); // 7 chars, not a whole group
        assert!(is_encoded("AAAAAAAA"));
    }
}
