use parking_lot::RwLock;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::models::Snapshot;

/// Détient le snapshot courant + un anneau borné des snapshots récents.
///
/// Écrivain unique (la boucle de scan), lecteurs concurrents illimités.
/// La publication échange une référence Arc sous un verrou court : un lecteur
/// voit toujours un snapshot entièrement formé, jamais une mutation partielle.
pub struct SnapshotStore {
    inner: RwLock<StoreInner>,
    capacity: usize,
}

struct StoreInner {
    latest: Option<Arc<Snapshot>>,
    ring: VecDeque<Arc<Snapshot>>,
}

impl SnapshotStore {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: RwLock::new(StoreInner { latest: None, ring: VecDeque::with_capacity(capacity) }),
            capacity: capacity.max(1),
        }
    }

    pub fn publish(&self, snapshot: Snapshot) -> Arc<Snapshot> {
        let snapshot = Arc::new(snapshot);
        let mut inner = self.inner.write();
        if inner.ring.len() == self.capacity {
            inner.ring.pop_front();
        }
        inner.ring.push_back(snapshot.clone());
        inner.latest = Some(snapshot.clone());
        snapshot
    }

    pub fn latest(&self) -> Option<Arc<Snapshot>> {
        self.inner.read().latest.clone()
    }

    /// Les `n` derniers snapshots, du plus ancien au plus récent.
    pub fn history(&self, n: usize) -> Vec<Arc<Snapshot>> {
        let inner = self.inner.read();
        let skip = inner.ring.len().saturating_sub(n);
        inner.ring.iter().skip(skip).cloned().collect()
    }
}
