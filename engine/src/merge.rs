//! Merge of a local and a remote snapshot of one collection.
//!
//! # Algorithm
//!
//! 1. Start from the local snapshot (the latest user intent on this device)
//! 2. For each remote record:
//!    - same remote id locally: take the remote content only if its
//!      `updated_at` is strictly newer; the local id never changes
//!    - otherwise, an unsynced local record with matching content (see
//!      [`IdentityRule`](crate::IdentityRule)) adopts the remote id instead of
//!      importing a duplicate
//!    - otherwise the remote record is appended under a derived local id
//! 3. Local-only records are kept unchanged
//!
//! Absence never implies deletion. An empty remote snapshot leaves the local
//! snapshot untouched, which guards against an uninitialized remote
//! collection appearing to wipe local data on first sync.

use crate::{
    derive_stable_local_id, CollectionDescriptor, LocalId, Record, RemoteId, Snapshot,
    DERIVED_ID_BASE,
};
use serde::Serialize;
use std::collections::HashSet;

/// An unsynced local record that took over a remote identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Adoption {
    pub local_id: LocalId,
    pub remote_id: RemoteId,
    /// Whether the remote content replaced the local content
    pub took_remote_content: bool,
}

/// What a merge did, for logging and scheduling.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MergeReport {
    /// Local records whose content was replaced by a newer remote copy
    pub refreshed: Vec<LocalId>,
    /// Remote-only records appended under derived local ids
    pub imported: Vec<LocalId>,
    /// Duplicate-content matches resolved by adopting the remote id
    pub adopted: Vec<Adoption>,
    /// Local records left exactly as they were
    pub kept_local: usize,
    /// The remote snapshot was empty and the merge was skipped
    pub empty_remote: bool,
}

impl MergeReport {
    /// Whether the merged snapshot differs from the local input.
    pub fn changed(&self) -> bool {
        !self.refreshed.is_empty() || !self.imported.is_empty() || !self.adopted.is_empty()
    }
}

/// Merged snapshot plus the report describing it.
#[derive(Debug, Clone, PartialEq)]
pub struct MergeOutcome {
    pub snapshot: Snapshot,
    pub report: MergeReport,
}

/// Merge a remote snapshot into a local one.
///
/// Remote records without a remote id are ignored; they cannot be matched
/// and the remote store never produces them.
pub fn merge(descriptor: &CollectionDescriptor, local: &Snapshot, remote: &[Record]) -> MergeOutcome {
    let mut report = MergeReport::default();

    if remote.is_empty() {
        report.empty_remote = true;
        report.kept_local = local.len();
        return MergeOutcome {
            snapshot: local.clone(),
            report,
        };
    }

    let mut merged = local.clone();
    let mut touched: HashSet<LocalId> = HashSet::new();

    for incoming in remote {
        let Some(remote_id) = incoming.remote_id.as_deref() else {
            continue;
        };

        if let Some(existing) = merged.find_by_remote_id_mut(remote_id) {
            if incoming.updated_at > existing.updated_at {
                existing.replace_content(incoming);
                touched.insert(existing.local_id);
                report.refreshed.push(existing.local_id);
            }
            continue;
        }

        let candidate = merged
            .records
            .iter_mut()
            .find(|r| !r.is_synced() && descriptor.identity.matches(r, incoming));
        if let Some(existing) = candidate {
            let took_remote_content = incoming.updated_at > existing.updated_at;
            if took_remote_content {
                existing.replace_content(incoming);
            }
            existing.remote_id = Some(remote_id.to_string());
            touched.insert(existing.local_id);
            report.adopted.push(Adoption {
                local_id: existing.local_id,
                remote_id: remote_id.to_string(),
                took_remote_content,
            });
            continue;
        }

        let local_id = free_derived_id(&merged, remote_id);
        let mut imported = incoming.clone();
        imported.local_id = local_id;
        merged.records.push(imported);
        report.imported.push(local_id);
    }

    report.kept_local = local
        .iter()
        .filter(|r| !touched.contains(&r.local_id))
        .count();

    MergeOutcome {
        snapshot: merged,
        report,
    }
}

/// Derived local id for a remote id, probed upward past ids already taken.
fn free_derived_id(snapshot: &Snapshot, remote_id: &str) -> LocalId {
    let mut candidate = derive_stable_local_id(remote_id);
    while snapshot.contains(candidate) {
        let next = candidate.0 + 1;
        candidate = if next >= 2 * DERIVED_ID_BASE {
            LocalId(DERIVED_ID_BASE)
        } else {
            LocalId(next)
        };
    }
    candidate
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{FieldDef, FieldType, IdentityRule};
    use serde_json::json;

    const R1: &str = "0b5e3f4c-6a43-4a8e-9a4f-3e2d1c0b9a87";
    const R2: &str = "7c9e6679-7425-40de-944b-e07fc1f90ae7";

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

    fn note(id: u64, title: &str, content: &str, updated_at: u64) -> Record {
        Record::new(LocalId(id), updated_at, json!({"title": title, "content": content}))
    }

    fn remote_note(remote_id: &str, title: &str, content: &str, updated_at: u64) -> Record {
        Record::new(derive_stable_local_id(remote_id), updated_at, json!({"title": title, "content": content}))
            .with_remote_id(remote_id)
    }

    #[test]
    fn empty_remote_is_a_no_op() {
        let local = Snapshot::from_records(vec![note(1, "a", "x", 10)]).unwrap();
        let outcome = merge(&notes(), &local, &[]);

        assert_eq!(outcome.snapshot, local);
        assert!(outcome.report.empty_remote);
        assert!(!outcome.report.changed());
    }

    #[test]
    fn newer_remote_replaces_content_keeps_local_id() {
        let local =
            Snapshot::from_records(vec![note(1, "old", "x", 10).with_remote_id(R1)]).unwrap();
        let remote = vec![remote_note(R1, "new", "y", 20)];

        let outcome = merge(&notes(), &local, &remote);
        let record = outcome.snapshot.get(LocalId(1)).unwrap();

        assert_eq!(record.str_field("title"), Some("new"));
        assert_eq!(record.updated_at, 20);
        assert_eq!(record.remote_id.as_deref(), Some(R1));
        assert_eq!(outcome.snapshot.len(), 1);
        assert_eq!(outcome.report.refreshed, vec![LocalId(1)]);
    }

    #[test]
    fn equal_or_older_remote_keeps_local() {
        let local =
            Snapshot::from_records(vec![note(1, "mine", "x", 20).with_remote_id(R1)]).unwrap();

        for stamp in [10, 20] {
            let outcome = merge(&notes(), &local, &[remote_note(R1, "theirs", "y", stamp)]);
            assert_eq!(outcome.snapshot, local);
            assert_eq!(outcome.report.kept_local, 1);
        }
    }

    #[test]
    fn remote_only_records_are_imported_with_derived_ids() {
        let local = Snapshot::from_records(vec![note(1, "local", "x", 10)]).unwrap();
        let remote = vec![remote_note(R2, "remote", "y", 30)];

        let outcome = merge(&notes(), &local, &remote);

        assert_eq!(outcome.snapshot.len(), 2);
        let imported = outcome.snapshot.find_by_remote_id(R2).unwrap();
        assert_eq!(imported.local_id, derive_stable_local_id(R2));
        assert_eq!(outcome.report.imported, vec![imported.local_id]);
        // local-only record survives and stays first
        assert_eq!(outcome.snapshot.records()[0].local_id, LocalId(1));
    }

    #[test]
    fn shorter_remote_never_drops_local_records() {
        let local = Snapshot::from_records(vec![
            note(1, "synced", "x", 10).with_remote_id(R1),
            note(2, "just created", "y", 11),
        ])
        .unwrap();
        let remote = vec![remote_note(R2, "elsewhere", "z", 5)];

        let outcome = merge(&notes(), &local, &remote);
        assert!(outcome.snapshot.contains(LocalId(1)));
        assert!(outcome.snapshot.contains(LocalId(2)));
        assert_eq!(outcome.report.kept_local, 2);
    }

    #[test]
    fn duplicate_content_adopts_remote_id() {
        let local = Snapshot::from_records(vec![note(1, "Groceries", "eggs", 10)]).unwrap();
        let remote = vec![remote_note(R1, "Groceries", "eggs", 10)];

        let outcome = merge(&notes(), &local, &remote);

        assert_eq!(outcome.snapshot.len(), 1);
        let record = outcome.snapshot.get(LocalId(1)).unwrap();
        assert_eq!(record.remote_id.as_deref(), Some(R1));
        assert_eq!(
            outcome.report.adopted,
            vec![Adoption {
                local_id: LocalId(1),
                remote_id: R1.to_string(),
                took_remote_content: false,
            }]
        );
    }

    #[test]
    fn synced_records_are_never_adopted() {
        // Same title but a different remote identity: two distinct notes.
        let local = Snapshot::from_records(vec![
            note(1, "Groceries", "eggs", 10).with_remote_id(R2)
        ])
        .unwrap();
        let remote = vec![remote_note(R1, "Groceries", "eggs", 10)];

        let outcome = merge(&notes(), &local, &remote);
        assert_eq!(outcome.snapshot.len(), 2);
        assert!(outcome.report.adopted.is_empty());
    }

    #[test]
    fn each_local_record_adopts_at_most_once() {
        let local = Snapshot::from_records(vec![note(1, "Same", "body", 10)]).unwrap();
        let remote = vec![
            remote_note(R1, "Same", "body", 10),
            remote_note(R2, "Same", "body", 10),
        ];

        let outcome = merge(&notes(), &local, &remote);
        assert_eq!(outcome.report.adopted.len(), 1);
        assert_eq!(outcome.report.imported.len(), 1);
        assert_eq!(outcome.snapshot.len(), 2);
    }

    #[test]
    fn derived_id_collision_is_probed() {
        let taken = derive_stable_local_id(R1);
        let local = Snapshot::from_records(vec![note(taken.0, "squatter", "x", 1)]).unwrap();
        let outcome = merge(&notes(), &local, &[remote_note(R1, "remote", "y", 2)]);

        let imported = outcome.snapshot.find_by_remote_id(R1).unwrap();
        assert_eq!(imported.local_id, LocalId(taken.0 + 1));
    }

    #[test]
    fn merge_is_deterministic() {
        let local = Snapshot::from_records(vec![note(1, "a", "x", 10).with_remote_id(R1)]).unwrap();
        let remote = vec![remote_note(R1, "b", "y", 20), remote_note(R2, "c", "z", 15)];

        assert_eq!(merge(&notes(), &local, &remote), merge(&notes(), &local, &remote));
    }
}
