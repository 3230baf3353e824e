//! Property-based tests for key encoding and checksum round-trips.
//!
//! - Encoding: every valid key survives `to_string` / `parse` unchanged
//! - Equality: keys are equal exactly when their encodings are
//! - Checksums: what a file node records equals independently computed digests

use mimir_core::checksum::{SHA_1, SHA_256, SHA_512};
use mimir_core::{
    ArtifactCoordinate, Checksums, Entry, FileNode, FileNodeConfig, Key, LocalNode, Scheme,
};
use proptest::prelude::*;
use sha1::Digest as _;
use sha2::Digest as _;
use tempfile::TempDir;

// =============================================================================
// Strategies for generating test data
// =============================================================================

fn container_strategy() -> impl Strategy<Value = String> {
    "[A-Za-z0-9_-][A-Za-z0-9._-]{0,15}".prop_map(String::from)
}

fn segment_strategy() -> impl Strategy<Value = String> {
    "[a-z0-9][a-z0-9_-]{0,10}".prop_map(String::from)
}

fn coordinate_strategy() -> impl Strategy<Value = ArtifactCoordinate> {
    (
        prop::collection::vec(segment_strategy(), 1..4),
        segment_strategy(),
        prop_oneof![Just("jar".to_string()), Just("pom".to_string())],
        prop::option::of(segment_strategy()),
        "[0-9]{1,2}\\.[0-9]{1,2}(-SNAPSHOT)?".prop_map(String::from),
    )
        .prop_map(|(group, artifact, extension, classifier, version)| {
            let coordinate = ArtifactCoordinate::new(group.join("."), artifact, extension, version);
            match classifier {
                Some(c) => coordinate.with_classifier(c),
                None => coordinate,
            }
        })
}

fn key_strategy() -> impl Strategy<Value = Key> {
    prop_oneof![
        (container_strategy(), coordinate_strategy())
            .prop_map(|(container, coordinate)| Key::artifact(container, &coordinate).unwrap()),
        (container_strategy(), prop::collection::vec(segment_strategy(), 1..5))
            .prop_map(|(container, parts)| Key::file(container, parts.join("/")).unwrap()),
        (container_strategy(), "[a-f0-9]{4,64}")
            .prop_map(|(container, digest)| Key::content_address(container, digest).unwrap()),
    ]
}

// =============================================================================
// Property Tests: Encoding
// =============================================================================

proptest! {
    /// Contract: the string form parses back to the same key
    #[test]
    fn key_round_trips(key in key_strategy()) {
        let encoded = key.to_string();
        let decoded: Key = encoded.parse().unwrap();
        prop_assert_eq!(&decoded, &key);
        prop_assert_eq!(decoded.to_string(), encoded);
    }

    /// Contract: equality follows the encoding
    #[test]
    fn key_equality_matches_encoding(a in key_strategy(), b in key_strategy()) {
        prop_assert_eq!(a == b, a.to_string() == b.to_string());
    }

    /// Contract: artifact payloads parse back to the coordinate
    #[test]
    fn artifact_payload_round_trips(container in container_strategy(), coordinate in coordinate_strategy()) {
        let key = Key::artifact(container, &coordinate).unwrap();
        prop_assert_eq!(key.scheme(), Scheme::Artifact);
        prop_assert_eq!(key.coordinate().unwrap(), coordinate);
    }

    /// Contract: garbage never parses into a key
    #[test]
    fn garbage_is_rejected(input in "[a-z:]{0,12}") {
        prop_assume!(!input.starts_with("mimir:"));
        prop_assert!(input.parse::<Key>().is_err());
    }
}

// =============================================================================
// Property Tests: Checksums
// =============================================================================

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    /// Contract: stored checksums equal independently computed digests
    #[test]
    fn stored_checksums_match_reference(content in prop::collection::vec(any::<u8>(), 0..4096)) {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .unwrap();
        let checksums = runtime.block_on(async {
            let tmp = TempDir::new().unwrap();
            let node = FileNode::new(
                FileNodeConfig::new("file", tmp.path().join("store"))
                    .with_checksum_algorithms([SHA_1, SHA_256, SHA_512]),
            )
            .unwrap();
            let key: Key = "mimir:cas:prop:abcd".parse().unwrap();
            let src = tmp.path().join("src");
            tokio::fs::write(&src, &content).await.unwrap();
            node.store(&key, &src, &Default::default(), &Checksums::new())
                .await
                .unwrap();
            node.locate(&key).await.unwrap().unwrap().checksums().clone()
        });

        prop_assert_eq!(&checksums[SHA_1], &hex::encode(sha1::Sha1::digest(&content).as_slice()));
        prop_assert_eq!(&checksums[SHA_256], &hex::encode(sha2::Sha256::digest(&content).as_slice()));
        prop_assert_eq!(&checksums[SHA_512], &hex::encode(sha2::Sha512::digest(&content).as_slice()));
    }
}
