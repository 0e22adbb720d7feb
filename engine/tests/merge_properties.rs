//! Property tests for the merge engine.
//!
//! Every generated snapshot uses device ids `1..=n` and remote ids built from
//! small integers, so remote and local views of the same record can be
//! paired up freely.

use proptest::prelude::*;
use serde_json::json;
use tandem_engine::{
    derive_stable_local_id, merge, CollectionDescriptor, FieldDef, FieldType, IdentityRule,
    LocalId, Record, Snapshot,
};
use uuid::Uuid;

fn notes() -> CollectionDescriptor {
    CollectionDescriptor::new(
        "notes",
        vec![
            FieldDef::required("title", FieldType::String),
            FieldDef::optional("content", FieldType::String),
        ],
    )
    .with_identity(IdentityRule::prefix(&["title", "content"], 50))
}

fn remote_id(n: u32) -> String {
    Uuid::from_u128(n as u128 + 1).to_string()
}

/// (title, content, updated_at, remote id seed)
type RecordSeed = (String, String, u64, Option<u32>);

fn record_seed() -> impl Strategy<Value = RecordSeed> {
    (
        "[a-z ]{0,12}",
        "[a-z ]{0,24}",
        1u64..1_000_000,
        proptest::option::of(0u32..64),
    )
}

fn local_snapshot(seeds: Vec<RecordSeed>) -> Snapshot {
    let mut used = std::collections::HashSet::new();
    let records = seeds
        .into_iter()
        .enumerate()
        .map(|(i, (title, content, updated_at, seed))| {
            let record = Record::new(
                LocalId(i as u64 + 1),
                updated_at,
                json!({"title": title, "content": content}),
            );
            match seed {
                // remote ids are unique within one snapshot
                Some(n) if used.insert(n) => record.with_remote_id(remote_id(n)),
                _ => record,
            }
        })
        .collect();
    Snapshot::from_records(records).unwrap()
}

fn remote_records(seeds: Vec<(String, String, u64, u32)>) -> Vec<Record> {
    let mut used = std::collections::HashSet::new();
    seeds
        .into_iter()
        .filter(|(_, _, _, n)| used.insert(*n))
        .map(|(title, content, updated_at, n)| {
            let id = remote_id(n);
            Record::new(
                derive_stable_local_id(&id),
                updated_at,
                json!({"title": title, "content": content}),
            )
            .with_remote_id(id)
        })
        .collect()
}

/// The remote view of a snapshot: its synced records, as the server has them.
fn remote_of(snapshot: &Snapshot) -> Vec<Record> {
    snapshot.iter().filter(|r| r.is_synced()).cloned().collect()
}

proptest! {
    #[test]
    fn merge_with_own_remote_view_is_identity(seeds in prop::collection::vec(record_seed(), 0..24)) {
        let local = local_snapshot(seeds);
        let outcome = merge(&notes(), &local, &remote_of(&local));
        prop_assert_eq!(outcome.snapshot, local);
    }

    #[test]
    fn no_local_record_is_lost(
        local_seeds in prop::collection::vec(record_seed(), 0..24),
        remote_seeds in prop::collection::vec(("[a-z ]{0,12}", "[a-z ]{0,24}", 1u64..1_000_000, 0u32..64), 0..24),
    ) {
        let local = local_snapshot(local_seeds);
        let remote = remote_records(remote_seeds);
        let merged = merge(&notes(), &local, &remote).snapshot;

        for record in &local {
            prop_assert!(merged.contains(record.local_id), "lost {}", record.local_id);
        }
        // merged output is always a valid snapshot
        prop_assert!(Snapshot::from_records(merged.into_records()).is_ok());
    }

    #[test]
    fn strictly_newer_remote_wins(
        title in "[a-z]{1,12}",
        remote_title in "[a-z]{1,12}",
        local_at in 1u64..500_000,
        delta in 1u64..500_000,
        n in 0u32..64,
    ) {
        let id = remote_id(n);
        let local = Snapshot::from_records(vec![
            Record::new(LocalId(7), local_at, json!({"title": title, "content": "mine"})).with_remote_id(id.clone()),
        ]).unwrap();
        let remote = vec![
            Record::new(LocalId(0), local_at + delta, json!({"title": remote_title, "content": "theirs"}))
                .with_remote_id(id.clone()),
        ];

        let merged = merge(&notes(), &local, &remote).snapshot;
        let record = merged.get(LocalId(7)).unwrap();
        prop_assert_eq!(&record.fields, &remote[0].fields);
        prop_assert_eq!(record.updated_at, local_at + delta);
        prop_assert_eq!(record.remote_id.as_deref(), Some(id.as_str()));
        prop_assert_eq!(merged.len(), 1);
    }

    #[test]
    fn empty_remote_returns_local(seeds in prop::collection::vec(record_seed(), 1..24)) {
        let local = local_snapshot(seeds);
        let outcome = merge(&notes(), &local, &[]);
        prop_assert!(outcome.report.empty_remote);
        prop_assert_eq!(outcome.snapshot, local);
    }

    #[test]
    fn derived_ids_are_stable(n in any::<u128>()) {
        let id = Uuid::from_u128(n).to_string();
        prop_assert_eq!(derive_stable_local_id(&id), derive_stable_local_id(&id));
        prop_assert!(derive_stable_local_id(&id).is_derived());
    }

    #[test]
    fn merge_twice_is_stable(
        local_seeds in prop::collection::vec(record_seed(), 0..16),
        remote_seeds in prop::collection::vec(("[a-z ]{0,12}", "[a-z ]{0,24}", 1u64..1_000_000, 0u32..64), 0..16),
    ) {
        let local = local_snapshot(local_seeds);
        let remote = remote_records(remote_seeds);
        let once = merge(&notes(), &local, &remote).snapshot;
        let twice = merge(&notes(), &once, &remote);
        prop_assert_eq!(&twice.snapshot, &once);
        prop_assert!(!twice.report.changed());
    }
}
