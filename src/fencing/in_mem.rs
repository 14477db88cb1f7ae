//! Standalone in-memory fencing authority.

use std::sync::Mutex;

use super::*;

/// Fencing authority keeping its epoch counters in memory.
///
/// Useful when the state store has no fencing of its own, and in
/// tests. Counters do not survive a restart, so a durable deployment
/// uses the store's own implementation instead.
#[derive(Debug, Default)]
pub struct InMemFencing {
    table: Mutex<FenceTable>,
}

impl InMemFencing {
    pub fn new() -> Self {
        Self::default()
    }

    /// Check a token, returning why it is stale if so.
    pub fn check(&self, token: &OwnershipToken) -> Result<(), StaleWriter> {
        self.table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .check(token)
    }
}

impl FencingAuthority for InMemFencing {
    fn acquire(&self, range: &KeyRange, candidate: &HolderId) -> Result<OwnershipToken, StoreError> {
        Ok(self
            .table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .acquire(range, candidate))
    }

    fn current_epoch(&self, range: &KeyRange) -> Result<Option<Epoch>, StoreError> {
        Ok(self
            .table
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .current(range)
            .map(|token| token.epoch))
    }
}

#[test]
fn validate_reports_current_epoch() {
    let fencing = InMemFencing::new();
    let range = KeyRange::between("a", "z");

    let old = fencing.acquire(&range, &HolderId::from("node1")).unwrap();
    assert_eq!(fencing.validate(&old), Ok(Validity::Valid));

    let new = fencing.acquire(&range, &HolderId::from("node2")).unwrap();
    assert_eq!(
        fencing.validate(&old),
        Ok(Validity::Stale { current: Epoch(2) })
    );
    assert_eq!(fencing.validate(&new), Ok(Validity::Valid));
    assert_eq!(fencing.current_epoch(&range), Ok(Some(Epoch(2))));
    assert!(fencing.check(&old).is_err());
}

#[test]
fn ranges_are_fenced_independently() {
    let fencing = InMemFencing::new();
    let left = KeyRange::between("a", "m");
    let right = KeyRange::new(b"m".to_vec(), None);

    let l1 = fencing.acquire(&left, &HolderId::from("node1")).unwrap();
    let r1 = fencing.acquire(&right, &HolderId::from("node1")).unwrap();
    let _l2 = fencing.acquire(&left, &HolderId::from("node2")).unwrap();

    assert!(fencing.check(&l1).is_err());
    assert!(fencing.check(&r1).is_ok());
    assert_eq!(fencing.current_epoch(&KeyRange::full()), Ok(None));
}
