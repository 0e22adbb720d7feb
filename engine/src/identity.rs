//! Identifier reconciliation between local and remote regimes.
//!
//! Local code keys records off small integers assigned on the device; the
//! remote store issues UUIDs. A record created offline keeps its local id
//! for life and has its remote id back-filled once the server accepts it.
//! A record that only exists remotely gets a local id derived from its
//! remote id, so the same remote record always materializes with the same
//! local id on every device.
//!
//! Derived ids occupy `[DERIVED_ID_BASE, 2 * DERIVED_ID_BASE)`; device-assigned
//! ids stay below `DERIVED_ID_BASE`. Both ranges are exact in an IEEE-754
//! double.

use crate::{error::Result, Error, LocalId, Snapshot};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Lower bound of the derived local id range (2^52).
pub const DERIVED_ID_BASE: u64 = 1 << 52;

/// Check that a value has the remote identifier format (hyphenated UUID).
pub fn is_remote_id(value: &str) -> bool {
    value.len() == 36 && Uuid::parse_str(value).is_ok()
}

/// Derive the local id a remote-only record is materialized under.
///
/// Pure and deterministic: the remote id is normalized to lowercase and
/// hashed, and the low 52 bits of the digest are placed in the derived range.
pub fn derive_stable_local_id(remote_id: &str) -> LocalId {
    let digest = Sha256::digest(remote_id.to_ascii_lowercase().as_bytes());
    let mut prefix = [0u8; 8];
    prefix.copy_from_slice(&digest[..8]);
    let hash = u64::from_be_bytes(prefix);
    LocalId(DERIVED_ID_BASE | (hash & (DERIVED_ID_BASE - 1)))
}

/// Back-fill a remote id onto the record with the given local id.
///
/// Returns `Ok(false)` when no record has that local id (it was deleted
/// while the remote write was in flight).
pub fn attach_remote_id(
    snapshot: &mut Snapshot,
    local_id: LocalId,
    remote_id: &str,
) -> Result<bool> {
    if !is_remote_id(remote_id) {
        return Err(Error::InvalidRemoteId(remote_id.to_string()));
    }

    match snapshot.get_mut(local_id) {
        Some(record) => {
            record.remote_id = Some(remote_id.to_string());
            Ok(true)
        }
        None => Ok(false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Record;
    use serde_json::json;

    const REMOTE: &str = "0b5e3f4c-6a43-4a8e-9a4f-3e2d1c0b9a87";

    #[test]
    fn recognizes_remote_ids() {
        assert!(is_remote_id(REMOTE));
        assert!(is_remote_id(&REMOTE.to_uppercase()));
        assert!(!is_remote_id("42"));
        assert!(!is_remote_id(""));
        assert!(!is_remote_id("0b5e3f4c6a434a8e9a4f3e2d1c0b9a87"));
        assert!(!is_remote_id("0b5e3f4c-6a43-4a8e-9a4f-3e2d1c0b9a8z"));
    }

    #[test]
    fn derived_ids_are_stable() {
        assert_eq!(derive_stable_local_id(REMOTE), derive_stable_local_id(REMOTE));
        assert_eq!(
            derive_stable_local_id(REMOTE),
            derive_stable_local_id(&REMOTE.to_uppercase())
        );
    }

    #[test]
    fn derived_ids_stay_in_range() {
        for _ in 0..64 {
            let id = derive_stable_local_id(&Uuid::new_v4().to_string());
            assert!(id.is_derived());
            assert!(id.0 < 2 * DERIVED_ID_BASE);
        }
    }

    #[test]
    fn distinct_remote_ids_derive_distinct_local_ids() {
        let other = "7c9e6679-7425-40de-944b-e07fc1f90ae7";
        assert_ne!(derive_stable_local_id(REMOTE), derive_stable_local_id(other));
    }

    #[test]
    fn attach_back_fills_matching_record() {
        let mut snapshot = Snapshot::from_records(vec![
            Record::new(LocalId(1), 1000, json!({"title": "a"})),
            Record::new(LocalId(2), 1000, json!({"title": "b"})),
        ])
        .unwrap();

        assert!(attach_remote_id(&mut snapshot, LocalId(2), REMOTE).unwrap());
        assert_eq!(
            snapshot.get(LocalId(2)).unwrap().remote_id.as_deref(),
            Some(REMOTE)
        );
        assert!(snapshot.get(LocalId(1)).unwrap().remote_id.is_none());
    }

    #[test]
    fn attach_reports_missing_record() {
        let mut snapshot = Snapshot::new();
        assert!(!attach_remote_id(&mut snapshot, LocalId(9), REMOTE).unwrap());
    }

    #[test]
    fn attach_rejects_malformed_remote_id() {
        let mut snapshot =
            Snapshot::from_records(vec![Record::new(LocalId(1), 1000, json!({"title": "a"}))]).unwrap();
        let err = attach_remote_id(&mut snapshot, LocalId(1), "not-a-uuid").unwrap_err();
        assert_eq!(err, Error::InvalidRemoteId("not-a-uuid".into()));
    }
}
