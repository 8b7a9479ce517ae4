use super::{next_source_id, Collection, Dependent, Dependents, Event, Item, Source};
use ahash::{AHashMap as HashMap, AHashSet as HashSet, RandomState};
use parking_lot::RwLock;
use std::{
    collections::BTreeMap,
    hash::Hash,
    sync::{Arc, Weak},
};

/// A secondary lookup from `K` to the values of a collection.
pub struct Index<K, T> {
    inner: Arc<Inner<K, T>>,
}

type Extract<K, T> = Box<dyn Fn(&T) -> Vec<K> + Send + Sync>;

struct Inner<K, T> {
    id: u64,
    name: String,
    hasher: RandomState,
    extract: Extract<K, T>,
    /// Held so that a derived source outlives the handles that built it.
    collection: Collection<T>,
    state: RwLock<State<K, T>>,
    dependents: Dependents,
}

struct State<K, T> {
    by_key: HashMap<K, BTreeMap<String, Arc<T>>>,
    keys_of: HashMap<String, Vec<K>>,
}

// === impl Index ===

impl<K, T> Clone for Index<K, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<K, T> std::fmt::Debug for Index<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.inner.name)
            .finish()
    }
}

impl<K, T> Index<K, T>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Item,
{
    pub fn new(
        name: impl Into<String>,
        collection: &Collection<T>,
        extract: impl Fn(&T) -> Vec<K> + Send + Sync + 'static,
    ) -> Self {
        let inner = Arc::new(Inner {
            id: next_source_id(),
            name: name.into(),
            hasher: RandomState::new(),
            extract: Box::new(extract),
            collection: collection.clone(),
            state: RwLock::new(State {
                by_key: HashMap::new(),
                keys_of: HashMap::new(),
            }),
            dependents: Dependents::default(),
        });

        let weak = Arc::downgrade(&inner);
        inner.collection.subscribe(move |events| {
            if let Some(inner) = weak.upgrade() {
                inner.on_events(events);
            }
        });
        let initial = inner
            .collection
            .list()
            .into_iter()
            .map(Event::Added)
            .collect::<Vec<_>>();
        inner.on_events(&initial);

        Self { inner }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Returns the values indexed under `key`, ordered by resource name.
    pub fn lookup(&self, key: &K) -> Vec<Arc<T>> {
        self.inner
            .state
            .read()
            .by_key
            .get(key)
            .map(|items| items.values().cloned().collect())
            .unwrap_or_default()
    }

    pub(crate) fn key_hash(&self, key: &K) -> u64 {
        self.inner.hasher.hash_one(key)
    }

    pub(crate) fn source(&self) -> Arc<dyn Source> {
        self.inner.clone()
    }
}

// === impl Inner ===

impl<K, T> Inner<K, T>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Item,
{
    fn on_events(&self, events: &[Event<T>]) {
        let mut changed = HashSet::new();
        {
            let mut state = self.state.write();
            let State { by_key, keys_of } = &mut *state;
            for event in events {
                let name = event.key();
                for key in keys_of.remove(&name).into_iter().flatten() {
                    if let Some(items) = by_key.get_mut(&key) {
                        items.remove(&name);
                        if items.is_empty() {
                            by_key.remove(&key);
                        }
                    }
                    changed.insert(key);
                }

                if let Event::Added(item) | Event::Updated { new: item, .. } = event {
                    let keys = (self.extract)(item);
                    for key in &keys {
                        by_key
                            .entry(key.clone())
                            .or_default()
                            .insert(name.clone(), item.clone());
                        changed.insert(key.clone());
                    }
                    keys_of.insert(name, keys);
                }
            }
        }

        let hashes = changed
            .iter()
            .map(|k| self.hasher.hash_one(k))
            .collect::<Vec<_>>();
        self.dependents.notify(self.id, &hashes);
    }
}

impl<K, T> Source for Inner<K, T>
where
    K: Hash + Eq + Clone + Send + Sync + 'static,
    T: Item,
{
    fn source_id(&self) -> u64 {
        self.id
    }

    fn add_dependent(&self, dependent: Weak<dyn Dependent>) {
        self.dependents.add(dependent);
    }
}
