use super::{context::Read, Collection, Dependent, Event, HandlerContext, Item, WeakCollection};
use ahash::{AHashMap as HashMap, AHashSet as HashSet};
use parking_lot::Mutex;
use std::{
    collections::BTreeSet,
    panic::{self, AssertUnwindSafe},
    sync::{Arc, Weak},
};

pub(super) type Handler<I, O> = Box<dyn Fn(&mut HandlerContext, &I) -> Vec<O> + Send + Sync>;

/// A derivation from an input collection into an output collection.
///
/// All runs of a derivation are serialized by its state lock, so updates for a
/// given input key are applied in the order they were observed.
struct Derivation<I, O> {
    name: String,
    input: Collection<I>,
    output: WeakCollection<O>,
    handler: Handler<I, O>,
    state: Mutex<State>,
    this: Weak<Self>,
}

type Dep = (u64, Option<u64>);

#[derive(Default)]
struct State {
    /// Output keys produced by each input key.
    outputs: HashMap<String, Vec<String>>,
    /// Reads observed by the last run for each input key.
    reads: HashMap<String, Vec<Dep>>,
    /// Input keys that observed each read.
    readers: HashMap<Dep, HashSet<String>>,
    /// Sources this derivation is registered with.
    sources: HashSet<u64>,
}

pub(super) fn derive<I: Item, O: Item>(
    input: &Collection<I>,
    name: String,
    handler: Handler<I, O>,
) -> Collection<O> {
    let output = Collection::new(name.clone());
    let derivation = Arc::new_cyclic(|this| Derivation {
        name,
        input: input.clone(),
        output: output.downgrade(),
        handler,
        state: Mutex::default(),
        this: this.clone(),
    });
    output.keep_alive(derivation.clone());

    let weak = Arc::downgrade(&derivation);
    input.subscribe(move |events| {
        if let Some(derivation) = weak.upgrade() {
            derivation.on_input(events);
        }
    });
    derivation.run_all();

    let synced = output.downgrade();
    input.on_synced(move || {
        if let Some(output) = synced.upgrade() {
            output.mark_synced();
        }
    });

    output
}

// === impl Derivation ===

impl<I: Item, O: Item> Derivation<I, O> {
    fn on_input(&self, events: &[Event<I>]) {
        let mut state = self.state.lock();
        for event in events {
            self.run(&mut state, &event.key());
        }
    }

    fn run_all(&self) {
        let mut state = self.state.lock();
        for item in self.input.list() {
            self.run(&mut state, &item.resource_name());
        }
    }

    /// Re-runs the handler for a single input key and applies the difference to
    /// the output collection.
    fn run(&self, state: &mut State, key: &str) {
        let Some(output) = self.output.upgrade() else {
            return;
        };

        let Some(item) = self.input.get(key) else {
            state.forget(key);
            output.clear_failure(key);
            let stale = state.outputs.remove(key).unwrap_or_default();
            output.apply(Vec::new(), stale);
            return;
        };

        let mut ctx = HandlerContext::new();
        let handler = &self.handler;
        let result = panic::catch_unwind(AssertUnwindSafe(|| handler(&mut ctx, &*item)));
        self.track(state, key, ctx.into_reads());

        match result {
            Ok(items) => {
                output.clear_failure(key);
                let keys = items.iter().map(|i| i.resource_name()).collect::<Vec<_>>();
                let current = keys.iter().cloned().collect::<HashSet<_>>();
                let stale = state
                    .outputs
                    .insert(key.to_string(), keys)
                    .unwrap_or_default()
                    .into_iter()
                    .filter(|k| !current.contains(k))
                    .collect();
                output.apply(items.into_iter().map(Arc::new).collect(), stale);
            }
            Err(panic) => {
                let message = panic_message(panic.as_ref());
                tracing::error!(
                    collection = %self.name,
                    %key,
                    %message,
                    "Derivation failed; keeping previous outputs"
                );
                output.record_failure(key, message);
            }
        }
    }

    fn track(&self, state: &mut State, key: &str, reads: Vec<Read>) {
        state.forget(key);
        let mut deps = Vec::with_capacity(reads.len());
        for Read { source, key: read } in reads {
            let id = source.source_id();
            if state.sources.insert(id) {
                let this: Weak<dyn Dependent> = self.this.clone();
                source.add_dependent(this);
            }
            let dep = (id, read);
            state
                .readers
                .entry(dep)
                .or_default()
                .insert(key.to_string());
            deps.push(dep);
        }
        state.reads.insert(key.to_string(), deps);
    }
}

impl<I: Item, O: Item> Dependent for Derivation<I, O> {
    fn on_changed(&self, source: u64, keys: &[u64]) {
        let mut state = self.state.lock();
        let mut affected = BTreeSet::new();
        if let Some(readers) = state.readers.get(&(source, None)) {
            affected.extend(readers.iter().cloned());
        }
        for key in keys {
            if let Some(readers) = state.readers.get(&(source, Some(*key))) {
                affected.extend(readers.iter().cloned());
            }
        }
        for key in affected {
            self.run(&mut state, &key);
        }
    }
}

// === impl State ===

impl State {
    fn forget(&mut self, key: &str) {
        let Some(deps) = self.reads.remove(key) else {
            return;
        };
        for dep in deps {
            if let Some(readers) = self.readers.get_mut(&dep) {
                readers.remove(key);
                if readers.is_empty() {
                    self.readers.remove(&dep);
                }
            }
        }
    }
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        return (*s).to_string();
    }
    if let Some(s) = panic.downcast_ref::<String>() {
        return s.clone();
    }
    "unknown panic".to_string()
}
