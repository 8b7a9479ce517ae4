use ahash::AHashMap as HashMap;
use gateway_controller_core::ir::ObjectSource;
use gateway_controller_translator::envoy::{type_urls, XdsResource};
use parking_lot::RwLock;
use std::sync::Arc;
use tokio::sync::watch;

/// The resources of one type and their combined version.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Resources {
    pub version: String,
    pub items: Vec<XdsResource>,
}

/// Everything one client is served.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct Snapshot {
    /// The gateway whose configuration the client runs.
    pub gateway: ObjectSource,
    pub clusters: Resources,
    pub endpoints: Resources,
    pub listeners: Resources,
    pub routes: Resources,
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum CacheError {
    #[error("snapshot cache is full ({0} clients)")]
    CacheFull(usize),
}

pub type SnapshotRx = watch::Receiver<Option<Arc<Snapshot>>>;

/// Published snapshots by client resource name.
///
/// Each key has a watch so that streams may subscribe before the first
/// snapshot for their client is published. Published snapshots are never
/// mutated.
#[derive(Clone, Debug)]
pub struct SnapshotCache {
    inner: Arc<RwLock<HashMap<String, watch::Sender<Option<Arc<Snapshot>>>>>>,
    capacity: usize,
}

// === impl Resources ===

impl Resources {
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.items.iter().map(|r| r.name.as_str())
    }
}

// === impl Snapshot ===

impl Snapshot {
    pub fn resources(&self, type_url: &str) -> Option<&Resources> {
        match type_url {
            type_urls::CLUSTER => Some(&self.clusters),
            type_urls::CLUSTER_LOAD_ASSIGNMENT => Some(&self.endpoints),
            type_urls::LISTENER => Some(&self.listeners),
            type_urls::ROUTE_CONFIGURATION => Some(&self.routes),
            _ => None,
        }
    }

    pub(crate) fn versions(&self) -> [&str; 4] {
        [
            &self.clusters.version,
            &self.endpoints.version,
            &self.listeners.version,
            &self.routes.version,
        ]
    }
}

// === impl SnapshotCache ===

impl SnapshotCache {
    /// Creates a cache holding snapshots for at most `capacity` clients.
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Default::default(),
            capacity,
        }
    }

    /// Publishes a client's snapshot, replacing any previous one.
    ///
    /// Fails without publishing when the client has no snapshot yet and the
    /// cache is at capacity.
    pub fn set(&self, key: &str, snapshot: Arc<Snapshot>) -> Result<(), CacheError> {
        let mut snapshots = self.inner.write();
        Self::prune(&mut snapshots);

        if let Some(tx) = snapshots.get(key) {
            if tx.borrow().is_some() {
                tx.send_replace(Some(snapshot));
                return Ok(());
            }
        }

        let published = snapshots.values().filter(|tx| tx.borrow().is_some()).count();
        if published >= self.capacity {
            return Err(CacheError::CacheFull(self.capacity));
        }
        match snapshots.get(key) {
            Some(tx) => {
                tx.send_replace(Some(snapshot));
            }
            None => {
                let (tx, _) = watch::channel(Some(snapshot));
                snapshots.insert(key.to_string(), tx);
            }
        }
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Arc<Snapshot>> {
        self.inner.read().get(key).and_then(|tx| tx.borrow().clone())
    }

    /// Watches a client's snapshot. The receiver holds `None` until a
    /// snapshot is published and after it is removed.
    pub fn watch(&self, key: &str) -> SnapshotRx {
        if let Some(tx) = self.inner.read().get(key) {
            return tx.subscribe();
        }
        self.inner
            .write()
            .entry(key.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    pub fn remove(&self, key: &str) {
        let mut snapshots = self.inner.write();
        if let Some(tx) = snapshots.get(key) {
            tx.send_replace(None);
        }
        Self::prune(&mut snapshots);
    }

    /// Every published snapshot, ordered by key.
    pub fn snapshots(&self) -> Vec<(String, Arc<Snapshot>)> {
        let mut snapshots = self
            .inner
            .read()
            .iter()
            .filter_map(|(k, tx)| Some((k.clone(), tx.borrow().clone()?)))
            .collect::<Vec<_>>();
        snapshots.sort_by(|(a, _), (b, _)| a.cmp(b));
        snapshots
    }

    /// Drops keys that have neither a snapshot nor a watcher.
    fn prune(snapshots: &mut HashMap<String, watch::Sender<Option<Arc<Snapshot>>>>) {
        snapshots.retain(|_, tx| tx.borrow().is_some() || tx.receiver_count() > 0);
    }
}
