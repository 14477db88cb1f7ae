//! Authoritative dedup layer backed by the state store's dedup log.

use super::*;
use crate::store::StateStore;

/// Looks record IDs up in the store's durable dedup log.
///
/// The log is only ever appended to by checkpoints, so there is
/// nothing to remember here.
pub struct DurableLayer {
    store: Arc<dyn StateStore>,
}

impl DurableLayer {
    pub fn new(store: Arc<dyn StateStore>) -> Self {
        Self { store }
    }
}

impl DedupLayer for DurableLayer {
    fn probe(&self, key: &Key, record_id: &RecordId) -> Result<Probe, StoreError> {
        Ok(if self.store.dedup_contains(key, record_id)? {
            Probe::Present
        } else {
            Probe::Absent
        })
    }

    fn remember(&self, _key: &Key, _record_id: &RecordId) {}
}

#[test]
fn answers_from_the_log() {
    use crate::fencing::{FencingAuthority, HolderId, KeyRange};
    use crate::store::{in_mem::test_checkpoint, InMemStore};

    let store = Arc::new(InMemStore::new());
    let token = store.acquire(&KeyRange::full(), &HolderId::from("n1")).unwrap();
    let id = RecordId::random();
    store
        .checkpoint(&test_checkpoint("x", "s", &[id], &token, 0))
        .unwrap();

    let layer = DurableLayer::new(store.clone());
    assert_eq!(layer.probe(&Key::from("x"), &id).unwrap(), Probe::Present);
    assert_eq!(
        layer.probe(&Key::from("x"), &RecordId::random()).unwrap(),
        Probe::Absent
    );
}
