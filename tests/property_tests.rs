// tests/property_tests.rs

//! Property tests for version strings and the content store

use conary_core::Error;
use conary_core::datastore::DataStore;
use conary_core::files::sha256_hex;
use conary_core::version::Version;
use proptest::prelude::*;
use tempfile::TempDir;

fn label() -> impl Strategy<Value = String> {
    ("[a-z]{1,8}", "[a-z]{1,4}", "[a-z]{1,8}")
        .prop_map(|(host, namespace, tag)| format!("{}.com@{}:{}", host, namespace, tag))
}

fn revision() -> impl Strategy<Value = String> {
    ("[0-9]\\.[0-9]{1,2}[a-z]?", 1u32..20, 1u32..20)
        .prop_map(|(upstream, source, build)| format!("{}-{}-{}", upstream, source, build))
}

/// A version with one or two branch hops and millisecond timestamps
fn version() -> impl Strategy<Value = Version> {
    (
        label(),
        revision(),
        proptest::option::of((label(), revision())),
        0u64..4_000_000_000_000,
        0u64..4_000_000_000_000,
    )
        .prop_map(|(label, revision, branch, first, second)| {
            let first = first as f64 / 1000.0;
            match branch {
                Some((branch_label, branch_revision)) => Version::from_string_with_timestamps(
                    &format!("/{}/{}/{}/{}", label, revision, branch_label, branch_revision),
                    &[first, second as f64 / 1000.0],
                ),
                None => Version::from_string_with_timestamps(
                    &format!("/{}/{}", label, revision),
                    &[first],
                ),
            }
            .unwrap()
        })
}

proptest! {
    #[test]
    fn test_freeze_thaw_round_trip(v in version()) {
        let thawed = Version::thaw(v.freeze()).unwrap();
        prop_assert_eq!(thawed.freeze(), v.freeze());
        prop_assert_eq!(thawed.as_string(), v.as_string());
        prop_assert_eq!(&thawed, &v);
    }

    #[test]
    fn test_display_string_reparses(v in version()) {
        let parsed = Version::parse(&v.as_string()).unwrap();
        prop_assert_eq!(parsed.as_string(), v.as_string());
        let restamped = parsed.with_timestamps(&v.timestamps()).unwrap();
        prop_assert_eq!(restamped, v);
    }

    #[test]
    fn test_ordering_is_antisymmetric(a in version(), b in version()) {
        prop_assert_eq!(a.cmp(&b), b.cmp(&a).reverse());
        prop_assert_eq!(a.cmp(&b) == std::cmp::Ordering::Equal, a == b);
    }

    #[test]
    fn test_closeness_to_self_is_positive(v in version()) {
        prop_assert!(v.closeness(&v) > 0.0);
    }

    #[test]
    fn test_content_store_is_write_once(contents in proptest::collection::vec(any::<u8>(), 0..2048)) {
        let dir = TempDir::new().unwrap();
        let store = DataStore::new(dir.path()).unwrap();
        let hash = sha256_hex(&contents);

        prop_assert_eq!(store.add_file(&hash, &mut &contents[..]).unwrap(), contents.len() as u64);
        prop_assert_eq!(store.read(&hash).unwrap(), contents.clone());
        prop_assert!(matches!(
            store.add_file(&hash, &mut &contents[..]),
            Err(Error::DuplicateHash(_))
        ));

        store.remove(&hash).unwrap();
        prop_assert!(!store.has_file(&hash).unwrap());
        store.add_file(&hash, &mut &contents[..]).unwrap();
        prop_assert!(store.has_file(&hash).unwrap());
    }
}
