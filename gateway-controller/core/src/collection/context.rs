use super::{Collection, Index, Item, Source};
use std::{hash::Hash, sync::Arc};

/// Records the reads performed by a derivation handler.
///
/// A context that is not owned by a derivation may be used to query
/// collections directly; its reads are simply discarded.
#[derive(Default)]
pub struct HandlerContext {
    reads: Vec<Read>,
}

pub(crate) struct Read {
    pub(crate) source: Arc<dyn Source>,
    /// The hashed key that was read, or `None` when the whole source was read.
    pub(crate) key: Option<u64>,
}

impl HandlerContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fetch<T: Item>(&mut self, collection: &Collection<T>, key: &str) -> Option<Arc<T>> {
        self.reads.push(Read {
            source: collection.source(),
            key: Some(collection.key_hash(key)),
        });
        collection.get(key)
    }

    /// Returns every value in the collection, ordered by key. The caller is
    /// re-run on any change to the collection.
    pub fn fetch_all<T: Item>(&mut self, collection: &Collection<T>) -> Vec<Arc<T>> {
        self.reads.push(Read {
            source: collection.source(),
            key: None,
        });
        collection.list()
    }

    pub fn fetch_index<K, T>(&mut self, index: &Index<K, T>, key: &K) -> Vec<Arc<T>>
    where
        K: Hash + Eq + Clone + Send + Sync + 'static,
        T: Item,
    {
        self.reads.push(Read {
            source: index.source(),
            key: Some(index.key_hash(key)),
        });
        index.lookup(key)
    }

    pub(crate) fn into_reads(self) -> Vec<Read> {
        self.reads
    }
}
