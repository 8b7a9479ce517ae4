use super::{Collection, Event, Item, WeakCollection};
use ahash::AHashMap as HashMap;
use parking_lot::Mutex;
use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

struct Join<T> {
    name: String,
    inputs: Vec<Collection<T>>,
    output: WeakCollection<T>,
    /// The input that last wrote each key.
    owners: Mutex<HashMap<String, usize>>,
}

/// Merges collections with disjoint keys into one collection.
///
/// A key written by more than one input is logged; the most recent write wins
/// and the other input's value is restored if the winner later removes it.
pub fn join<T: Item>(name: impl Into<String>, inputs: &[Collection<T>]) -> Collection<T> {
    let name = name.into();
    let output = Collection::new(name.clone());
    let join = Arc::new(Join {
        name,
        inputs: inputs.to_vec(),
        output: output.downgrade(),
        owners: Mutex::default(),
    });
    output.keep_alive(join.clone());

    for (i, input) in inputs.iter().enumerate() {
        let weak = Arc::downgrade(&join);
        input.subscribe(move |events| {
            if let Some(join) = weak.upgrade() {
                join.on_input(i, events);
            }
        });
        let initial = input
            .list()
            .into_iter()
            .map(Event::Added)
            .collect::<Vec<_>>();
        join.on_input(i, &initial);
    }

    let pending = Arc::new(AtomicUsize::new(inputs.len()));
    if inputs.is_empty() {
        output.mark_synced();
    }
    for input in inputs {
        let pending = pending.clone();
        let output = output.downgrade();
        input.on_synced(move || {
            if pending.fetch_sub(1, Ordering::AcqRel) == 1 {
                if let Some(output) = output.upgrade() {
                    output.mark_synced();
                }
            }
        });
    }

    output
}

// === impl Join ===

impl<T: Item> Join<T> {
    fn on_input(&self, index: usize, events: &[Event<T>]) {
        let Some(output) = self.output.upgrade() else {
            return;
        };

        let mut owners = self.owners.lock();
        let mut upserts = Vec::new();
        let mut removals = Vec::new();
        for event in events {
            let key = event.key();
            match event {
                Event::Removed(_) => {
                    if owners.get(&key) != Some(&index) {
                        continue;
                    }
                    owners.remove(&key);
                    match self.fallback(index, &key) {
                        Some((i, item)) => {
                            owners.insert(key, i);
                            upserts.push(item);
                        }
                        None => removals.push(key),
                    }
                }
                Event::Added(item) | Event::Updated { new: item, .. } => {
                    if let Some(&owner) = owners.get(&key) {
                        if owner != index {
                            tracing::warn!(
                                collection = %self.name,
                                %key,
                                "Joined collections produced the same key"
                            );
                        }
                    }
                    owners.insert(key, index);
                    upserts.push(item.clone());
                }
            }
        }
        output.apply(upserts, removals);
    }

    fn fallback(&self, removed_from: usize, key: &str) -> Option<(usize, Arc<T>)> {
        self.inputs
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != removed_from)
            .find_map(|(i, input)| input.get(key).map(|item| (i, item)))
    }
}
