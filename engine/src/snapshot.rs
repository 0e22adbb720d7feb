//! Collection snapshots.
//!
//! A snapshot is the full, ordered contents of one collection at a point in
//! time. It is what the local store persists under the collection key and
//! what the merge consumes and produces. Serialized as a plain JSON array of
//! records.

use crate::{error::Result, Error, LocalId, Record, Timestamp, DERIVED_ID_BASE};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// The ordered records of one collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Snapshot {
    pub(crate) records: Vec<Record>,
}

impl Snapshot {
    /// Create an empty snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot, rejecting duplicate local ids.
    pub fn from_records(records: Vec<Record>) -> Result<Self> {
        let mut seen = HashSet::with_capacity(records.len());
        for record in &records {
            if !seen.insert(record.local_id) {
                return Err(Error::DuplicateLocalId(record.local_id));
            }
        }
        Ok(Self { records })
    }

    /// All records in order.
    pub fn records(&self) -> &[Record] {
        &self.records
    }

    /// Consume the snapshot into its records.
    pub fn into_records(self) -> Vec<Record> {
        self.records
    }

    pub fn iter(&self) -> impl Iterator<Item = &Record> {
        self.records.iter()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Get a record by local id.
    pub fn get(&self, local_id: LocalId) -> Option<&Record> {
        self.records.iter().find(|r| r.local_id == local_id)
    }

    /// Get a mutable record by local id.
    pub fn get_mut(&mut self, local_id: LocalId) -> Option<&mut Record> {
        self.records.iter_mut().find(|r| r.local_id == local_id)
    }

    /// Get a record by remote id.
    pub fn find_by_remote_id(&self, remote_id: &str) -> Option<&Record> {
        self.records
            .iter()
            .find(|r| r.remote_id.as_deref() == Some(remote_id))
    }

    pub(crate) fn find_by_remote_id_mut(&mut self, remote_id: &str) -> Option<&mut Record> {
        self.records
            .iter_mut()
            .find(|r| r.remote_id.as_deref() == Some(remote_id))
    }

    /// Check whether a local id is taken.
    pub fn contains(&self, local_id: LocalId) -> bool {
        self.get(local_id).is_some()
    }

    /// Append a record, rejecting a duplicate local id.
    pub fn push(&mut self, record: Record) -> Result<()> {
        if self.contains(record.local_id) {
            return Err(Error::DuplicateLocalId(record.local_id));
        }
        self.records.push(record);
        Ok(())
    }

    /// Remove a record by local id.
    pub fn remove(&mut self, local_id: LocalId) -> Option<Record> {
        let index = self.records.iter().position(|r| r.local_id == local_id)?;
        Some(self.records.remove(index))
    }

    /// Records the remote store has never accepted.
    pub fn unsynced(&self) -> impl Iterator<Item = &Record> {
        self.records.iter().filter(|r| !r.is_synced())
    }

    /// Next free device-assigned local id.
    pub fn next_local_id(&self) -> LocalId {
        let max = self
            .records
            .iter()
            .map(|r| r.local_id.0)
            .filter(|id| *id < DERIVED_ID_BASE)
            .max()
            .unwrap_or(0);
        LocalId(max + 1)
    }

    /// Prepare a full-collection save on top of the previously stored snapshot.
    ///
    /// - duplicate local ids are rejected
    /// - a remote id already back-filled into `previous` is carried onto an
    ///   incoming record that lacks one
    /// - `updated_at` is stamped: changed content gets
    ///   `max(now, previous + 1)`, unchanged content keeps the newer of the
    ///   two timestamps, a new record without a timestamp gets `now`
    pub fn prepare_save(previous: &Snapshot, incoming: Vec<Record>, now: Timestamp) -> Result<Self> {
        let mut next = Self::from_records(incoming)?;

        for record in &mut next.records {
            let Some(prior) = previous.get(record.local_id) else {
                if record.updated_at == 0 {
                    record.updated_at = now;
                }
                continue;
            };

            if record.remote_id.is_none() {
                record.remote_id = prior.remote_id.clone();
            }

            record.updated_at = if record.same_content(prior) {
                record.updated_at.max(prior.updated_at)
            } else {
                now.max(prior.updated_at + 1)
            };
        }

        Ok(next)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string(self).map_err(|e| Error::InvalidSnapshot(e.to_string()))
    }

    /// Deserialize from JSON, rejecting duplicate local ids.
    pub fn from_json(json: &str) -> Result<Self> {
        let records: Vec<Record> =
            serde_json::from_str(json).map_err(|e| Error::InvalidSnapshot(e.to_string()))?;
        Self::from_records(records)
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a Record;
    type IntoIter = std::slice::Iter<'a, Record>;

    fn into_iter(self) -> Self::IntoIter {
        self.records.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const REMOTE: &str = "0b5e3f4c-6a43-4a8e-9a4f-3e2d1c0b9a87";

    fn note(id: u64, title: &str, updated_at: Timestamp) -> Record {
        Record::new(LocalId(id), updated_at, json!({"title": title}))
    }

    #[test]
    fn duplicate_local_ids_rejected() {
        let err = Snapshot::from_records(vec![note(1, "a", 1), note(1, "b", 2)]).unwrap_err();
        assert_eq!(err, Error::DuplicateLocalId(LocalId(1)));

        let mut snapshot = Snapshot::from_records(vec![note(1, "a", 1)]).unwrap();
        assert!(snapshot.push(note(1, "again", 2)).is_err());
        assert!(snapshot.push(note(2, "b", 2)).is_ok());
        assert_eq!(snapshot.len(), 2);
    }

    #[test]
    fn lookup_and_remove() {
        let mut snapshot = Snapshot::from_records(vec![
            note(1, "a", 1),
            note(2, "b", 1).with_remote_id(REMOTE),
        ])
        .unwrap();

        assert_eq!(snapshot.find_by_remote_id(REMOTE).unwrap().local_id, LocalId(2));
        assert_eq!(snapshot.unsynced().count(), 1);

        let removed = snapshot.remove(LocalId(1)).unwrap();
        assert_eq!(removed.str_field("title"), Some("a"));
        assert!(snapshot.remove(LocalId(1)).is_none());
        assert_eq!(snapshot.len(), 1);
    }

    #[test]
    fn next_local_id_ignores_derived_range() {
        let snapshot = Snapshot::from_records(vec![
            note(3, "a", 1),
            note(DERIVED_ID_BASE + 10, "remote", 1),
        ])
        .unwrap();
        assert_eq!(snapshot.next_local_id(), LocalId(4));
        assert_eq!(Snapshot::new().next_local_id(), LocalId(1));
    }

    #[test]
    fn json_is_a_plain_array() {
        let snapshot = Snapshot::from_records(vec![note(1, "a", 5)]).unwrap();
        let json = snapshot.to_json().unwrap();
        assert!(json.starts_with('['));

        let parsed = Snapshot::from_json(&json).unwrap();
        assert_eq!(parsed, snapshot);

        assert!(matches!(
            Snapshot::from_json("{\"not\": \"an array\"}"),
            Err(Error::InvalidSnapshot(_))
        ));
        assert!(matches!(
            Snapshot::from_json(r#"[{"localId": 1}, {"localId": 1}]"#),
            Err(Error::DuplicateLocalId(_))
        ));
    }

    #[test]
    fn prepare_save_stamps_changed_records() {
        let previous = Snapshot::from_records(vec![note(1, "a", 1000), note(2, "b", 1000)]).unwrap();
        let incoming = vec![note(1, "a edited", 1000), note(2, "b", 1000)];

        let next = Snapshot::prepare_save(&previous, incoming, 5000).unwrap();
        assert_eq!(next.get(LocalId(1)).unwrap().updated_at, 5000);
        assert_eq!(next.get(LocalId(2)).unwrap().updated_at, 1000);
    }

    #[test]
    fn prepare_save_is_monotonic_under_clock_skew() {
        let previous = Snapshot::from_records(vec![note(1, "a", 9000)]).unwrap();
        let next = Snapshot::prepare_save(&previous, vec![note(1, "changed", 9000)], 100).unwrap();
        assert_eq!(next.get(LocalId(1)).unwrap().updated_at, 9001);
    }

    #[test]
    fn prepare_save_carries_back_filled_remote_id() {
        let previous =
            Snapshot::from_records(vec![note(1, "a", 1000).with_remote_id(REMOTE)]).unwrap();
        // The caller's copy predates the back-fill.
        let next = Snapshot::prepare_save(&previous, vec![note(1, "a", 1000)], 2000).unwrap();
        assert_eq!(next.get(LocalId(1)).unwrap().remote_id.as_deref(), Some(REMOTE));
    }

    #[test]
    fn prepare_save_new_records() {
        let previous = Snapshot::new();
        let next = Snapshot::prepare_save(
            &previous,
            vec![note(1, "fresh", 0), note(2, "imported", 1234)],
            7000,
        )
        .unwrap();
        assert_eq!(next.get(LocalId(1)).unwrap().updated_at, 7000);
        assert_eq!(next.get(LocalId(2)).unwrap().updated_at, 1234);
    }

    #[test]
    fn prepare_save_rejects_duplicates() {
        let err = Snapshot::prepare_save(&Snapshot::new(), vec![note(1, "a", 0), note(1, "b", 0)], 1)
            .unwrap_err();
        assert_eq!(err, Error::DuplicateLocalId(LocalId(1)));
    }
}
