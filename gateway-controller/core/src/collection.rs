//! Keyed collections of shared values, with derivations that are recomputed
//! only for the keys whose inputs changed.
//!
//! A [`Collection`] is either a source (written by a Kubernetes watch) or the
//! output of a derivation over another collection. Derivation handlers run
//! with a [`HandlerContext`] that records every collection and [`Index`] read;
//! when one of those reads changes, only the input keys whose handler observed
//! it are re-run. Outputs are compared with [`Equals`] and unchanged outputs do
//! not propagate.

mod context;
mod derive;
mod index;
mod join;

#[cfg(test)]
mod tests;

pub use self::{context::HandlerContext, index::Index, join::join};
use ahash::{AHashMap as HashMap, RandomState};
use parking_lot::{Mutex, RwLock};
use std::{
    any::Any,
    collections::hash_map::Entry,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::sync::watch;

/// A value with a stable primary key.
pub trait Keyed {
    fn resource_name(&self) -> String;
}

/// The change-detection relation for collection values.
///
/// Implementations ignore fields that change without changing meaning, such as
/// timestamps and observed generations.
pub trait Equals {
    fn equals(&self, other: &Self) -> bool;
}

pub trait Item: Keyed + Equals + Send + Sync + 'static {}

impl<T> Item for T where T: Keyed + Equals + Send + Sync + 'static {}

#[derive(Debug)]
pub enum Event<T> {
    Added(Arc<T>),
    Updated { old: Arc<T>, new: Arc<T> },
    Removed(Arc<T>),
}

/// A keyed set of shared values.
pub struct Collection<T> {
    inner: Arc<Inner<T>>,
}

pub(crate) struct WeakCollection<T>(Weak<Inner<T>>);

type EventHandler<T> = Arc<dyn Fn(&[Event<T>]) + Send + Sync>;

struct Inner<T> {
    id: u64,
    name: String,
    hasher: RandomState,
    items: RwLock<HashMap<String, Arc<T>>>,
    failures: RwLock<HashMap<String, String>>,
    handlers: RwLock<Vec<EventHandler<T>>>,
    dependents: Dependents,
    synced: Synced,
    derivations: Mutex<Vec<Arc<dyn Any + Send + Sync>>>,
}

/// Something that may be read through a [`HandlerContext`].
pub(crate) trait Source: Send + Sync {
    fn source_id(&self) -> u64;

    fn add_dependent(&self, dependent: Weak<dyn Dependent>);
}

/// Something that re-runs when a [`Source`] it read has changed.
pub(crate) trait Dependent: Send + Sync {
    /// `keys` are the hashes of the changed keys, as computed by the source.
    fn on_changed(&self, source: u64, keys: &[u64]);
}

#[derive(Default)]
pub(crate) struct Dependents(RwLock<Vec<Weak<dyn Dependent>>>);

struct Synced {
    tx: watch::Sender<bool>,
    waiters: Mutex<Vec<Box<dyn FnOnce() + Send>>>,
}

static NEXT_SOURCE_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_source_id() -> u64 {
    NEXT_SOURCE_ID.fetch_add(1, Ordering::Relaxed)
}

// === impl Event ===

impl<T> Clone for Event<T> {
    fn clone(&self) -> Self {
        match self {
            Self::Added(item) => Self::Added(item.clone()),
            Self::Updated { old, new } => Self::Updated {
                old: old.clone(),
                new: new.clone(),
            },
            Self::Removed(item) => Self::Removed(item.clone()),
        }
    }
}

impl<T: Keyed> Event<T> {
    pub fn key(&self) -> String {
        self.latest().resource_name()
    }

    /// The value after the event, or the removed value.
    pub fn latest(&self) -> &Arc<T> {
        match self {
            Self::Added(item) | Self::Updated { new: item, .. } | Self::Removed(item) => item,
        }
    }
}

// === impl Collection ===

impl<T> Clone for Collection<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> std::fmt::Debug for Collection<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Collection")
            .field("name", &self.inner.name)
            .field("len", &self.inner.items.read().len())
            .finish()
    }
}

impl<T: Item> Collection<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                id: next_source_id(),
                name: name.into(),
                hasher: RandomState::new(),
                items: Default::default(),
                failures: Default::default(),
                handlers: Default::default(),
                dependents: Default::default(),
                synced: Synced::new(),
                derivations: Default::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn get(&self, key: &str) -> Option<Arc<T>> {
        self.inner.items.read().get(key).cloned()
    }

    /// Returns all values, ordered by key.
    pub fn list(&self) -> Vec<Arc<T>> {
        let mut items = self
            .inner
            .items
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Vec<_>>();
        items.sort_by(|(a, _), (b, _)| a.cmp(b));
        items.into_iter().map(|(_, v)| v).collect()
    }

    pub fn len(&self) -> usize {
        self.inner.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn upsert(&self, item: T) {
        self.apply(vec![Arc::new(item)], Vec::new());
    }

    pub fn remove(&self, key: &str) {
        self.apply(Vec::new(), vec![key.to_string()]);
    }

    /// Replaces the contents of the collection, as after a relist. Keys absent
    /// from `items` are removed.
    pub fn reset(&self, items: Vec<T>) {
        let items = items.into_iter().map(Arc::new).collect::<Vec<_>>();
        let keep = items
            .iter()
            .map(|i| i.resource_name())
            .collect::<ahash::AHashSet<_>>();
        let removed = self
            .inner
            .items
            .read()
            .keys()
            .filter(|k| !keep.contains(*k))
            .cloned()
            .collect();
        self.apply(items, removed);
    }

    /// Marks the initial listing as complete.
    pub fn mark_synced(&self) {
        self.inner.synced.mark();
    }

    pub fn has_synced(&self) -> bool {
        self.inner.synced.is_synced()
    }

    /// Completes once the collection has synced.
    pub async fn synced(&self) {
        self.inner.synced.wait().await
    }

    /// Input keys whose derivation panicked, with the panic message.
    pub fn failures(&self) -> Vec<(String, String)> {
        let mut failures = self
            .inner
            .failures
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect::<Vec<_>>();
        failures.sort();
        failures
    }

    /// Registers a handler for batches of changes. Handlers are invoked
    /// synchronously by the writer, after the change has been applied.
    pub fn subscribe(&self, handler: impl Fn(&[Event<T>]) + Send + Sync + 'static) {
        self.inner.handlers.write().push(Arc::new(handler));
    }

    /// Derives a collection holding at most one output per input.
    pub fn map<O: Item>(
        &self,
        name: impl Into<String>,
        f: impl Fn(&mut HandlerContext, &T) -> Option<O> + Send + Sync + 'static,
    ) -> Collection<O> {
        derive::derive(
            self,
            name.into(),
            Box::new(move |ctx, item| f(ctx, item).into_iter().collect()),
        )
    }

    /// Derives a collection holding any number of outputs per input. Outputs
    /// are keyed by their own resource names.
    pub fn flat_map<O: Item>(
        &self,
        name: impl Into<String>,
        f: impl Fn(&mut HandlerContext, &T) -> Vec<O> + Send + Sync + 'static,
    ) -> Collection<O> {
        derive::derive(self, name.into(), Box::new(f))
    }

    pub fn index<K>(
        &self,
        name: impl Into<String>,
        extract: impl Fn(&T) -> Vec<K> + Send + Sync + 'static,
    ) -> Index<K, T>
    where
        K: std::hash::Hash + Eq + Clone + Send + Sync + 'static,
    {
        Index::new(name, self, extract)
    }

    pub(crate) fn key_hash(&self, key: &str) -> u64 {
        self.inner.hasher.hash_one(key)
    }

    pub(crate) fn source(&self) -> Arc<dyn Source> {
        self.inner.clone()
    }

    pub(crate) fn downgrade(&self) -> WeakCollection<T> {
        WeakCollection(Arc::downgrade(&self.inner))
    }

    pub(crate) fn keep_alive(&self, derivation: Arc<dyn Any + Send + Sync>) {
        self.inner.derivations.lock().push(derivation);
    }

    pub(crate) fn on_synced(&self, f: impl FnOnce() + Send + 'static) {
        self.inner.synced.on_synced(Box::new(f));
    }

    pub(crate) fn record_failure(&self, key: &str, message: String) {
        self.inner.failures.write().insert(key.to_string(), message);
    }

    pub(crate) fn clear_failure(&self, key: &str) {
        if self.inner.failures.read().contains_key(key) {
            self.inner.failures.write().remove(key);
        }
    }

    /// Applies a batch of writes and dispatches the resulting events. Values
    /// equal to the current value are skipped.
    pub(crate) fn apply(&self, upserts: Vec<Arc<T>>, removals: Vec<String>) {
        let mut events = Vec::new();
        {
            let mut items = self.inner.items.write();
            for key in removals {
                if let Some(old) = items.remove(&key) {
                    events.push(Event::Removed(old));
                }
            }
            for item in upserts {
                match items.entry(item.resource_name()) {
                    Entry::Vacant(entry) => {
                        entry.insert(item.clone());
                        events.push(Event::Added(item));
                    }
                    Entry::Occupied(mut entry) => {
                        if entry.get().equals(&item) {
                            continue;
                        }
                        let old = entry.insert(item.clone());
                        events.push(Event::Updated { old, new: item });
                    }
                }
            }
        }
        self.dispatch(&events);
    }

    fn dispatch(&self, events: &[Event<T>]) {
        if events.is_empty() {
            return;
        }
        tracing::trace!(collection = %self.inner.name, events = events.len(), "dispatching");

        let handlers = self.inner.handlers.read().clone();
        for handler in &handlers {
            handler(events);
        }

        let keys = events
            .iter()
            .map(|e| self.key_hash(&e.key()))
            .collect::<Vec<_>>();
        self.inner.dependents.notify(self.inner.id, &keys);
    }
}

impl<T: Item> Source for Inner<T> {
    fn source_id(&self) -> u64 {
        self.id
    }

    fn add_dependent(&self, dependent: Weak<dyn Dependent>) {
        self.dependents.add(dependent);
    }
}

// === impl WeakCollection ===

impl<T> Clone for WeakCollection<T> {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl<T> WeakCollection<T> {
    pub(crate) fn upgrade(&self) -> Option<Collection<T>> {
        self.0.upgrade().map(|inner| Collection { inner })
    }
}

// === impl Dependents ===

impl Dependents {
    pub(crate) fn add(&self, dependent: Weak<dyn Dependent>) {
        self.0.write().push(dependent);
    }

    pub(crate) fn notify(&self, source: u64, keys: &[u64]) {
        if keys.is_empty() {
            return;
        }
        let live = {
            let mut dependents = self.0.write();
            dependents.retain(|d| d.strong_count() > 0);
            dependents.iter().filter_map(Weak::upgrade).collect::<Vec<_>>()
        };
        for dependent in live {
            dependent.on_changed(source, keys);
        }
    }
}

// === impl Synced ===

impl Synced {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            tx,
            waiters: Default::default(),
        }
    }

    fn is_synced(&self) -> bool {
        *self.tx.borrow()
    }

    fn mark(&self) {
        let waiters = {
            let mut waiters = self.waiters.lock();
            if self.is_synced() {
                return;
            }
            self.tx.send_replace(true);
            std::mem::take(&mut *waiters)
        };
        for waiter in waiters {
            waiter();
        }
    }

    fn on_synced(&self, f: Box<dyn FnOnce() + Send>) {
        let mut waiters = self.waiters.lock();
        if self.is_synced() {
            drop(waiters);
            f();
        } else {
            waiters.push(f);
        }
    }

    async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // The sender is owned by the collection, so the channel cannot close
        // while we hold a reference to it.
        let _ = rx.wait_for(|synced| *synced).await;
    }
}
