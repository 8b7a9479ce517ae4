use super::*;
use std::sync::atomic::AtomicUsize;

#[derive(Clone, Debug, PartialEq)]
struct Obj {
    name: String,
    value: u32,
    /// Ignored by `Equals`.
    revision: u32,
}

impl Keyed for Obj {
    fn resource_name(&self) -> String {
        self.name.clone()
    }
}

impl Equals for Obj {
    fn equals(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value
    }
}

fn obj(name: &str, value: u32) -> Obj {
    Obj {
        name: name.to_string(),
        value,
        revision: 0,
    }
}

#[test]
fn map_propagates_changes() {
    let source = Collection::<Obj>::new("source");
    source.upsert(obj("a", 1));

    let doubled = source.map("doubled", |_, o| Some(obj(&o.name, o.value * 2)));
    assert_eq!(doubled.get("a").map(|o| o.value), Some(2));

    source.upsert(obj("b", 5));
    assert_eq!(doubled.get("b").map(|o| o.value), Some(10));

    source.upsert(obj("a", 3));
    assert_eq!(doubled.get("a").map(|o| o.value), Some(6));

    source.remove("a");
    assert!(doubled.get("a").is_none());
    assert_eq!(doubled.len(), 1);
}

#[test]
fn map_filters_outputs() {
    let source = Collection::<Obj>::new("source");
    let odd = source.map("odd", |_, o| (o.value % 2 == 1).then(|| o.clone()));

    source.upsert(obj("a", 1));
    assert!(odd.get("a").is_some());
    source.upsert(obj("a", 2));
    assert!(odd.get("a").is_none());
}

#[test]
fn equal_values_do_not_propagate() {
    let source = Collection::<Obj>::new("source");
    let runs = Arc::new(AtomicUsize::new(0));
    let derived = {
        let runs = runs.clone();
        source.map("derived", move |_, o| {
            runs.fetch_add(1, Ordering::SeqCst);
            Some(o.clone())
        })
    };

    source.upsert(obj("a", 1));
    assert_eq!(runs.load(Ordering::SeqCst), 1);

    // Only the ignored field differs.
    source.upsert(Obj {
        revision: 7,
        ..obj("a", 1)
    });
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(derived.get("a").map(|o| o.revision), Some(0));
}

#[test]
fn flat_map_tracks_outputs_per_input() {
    let source = Collection::<Obj>::new("source");
    let expanded = source.flat_map("expanded", |_, o| {
        (0..o.value)
            .map(|i| obj(&format!("{}-{i}", o.name), i))
            .collect()
    });

    source.upsert(obj("a", 3));
    assert_eq!(expanded.len(), 3);

    source.upsert(obj("a", 1));
    assert_eq!(
        expanded
            .list()
            .iter()
            .map(|o| o.name.clone())
            .collect::<Vec<_>>(),
        vec!["a-0".to_string()]
    );

    source.remove("a");
    assert!(expanded.is_empty());
}

#[test]
fn fetch_recomputes_only_dependent_keys() {
    let config = Collection::<Obj>::new("config");
    config.upsert(obj("x", 10));
    config.upsert(obj("y", 20));

    let source = Collection::<Obj>::new("source");
    source.upsert(obj("uses-x", 0));
    source.upsert(obj("uses-y", 0));

    let runs = Arc::new(parking_lot::Mutex::new(Vec::<String>::new()));
    let derived = {
        let config = config.clone();
        let runs = runs.clone();
        source.map("derived", move |ctx, o| {
            runs.lock().push(o.name.clone());
            let key = o.name.trim_start_matches("uses-");
            let value = ctx.fetch(&config, key).map(|c| c.value).unwrap_or(0);
            Some(obj(&o.name, value))
        })
    };
    assert_eq!(derived.get("uses-x").map(|o| o.value), Some(10));
    runs.lock().clear();

    config.upsert(obj("x", 11));
    assert_eq!(*runs.lock(), vec!["uses-x".to_string()]);
    assert_eq!(derived.get("uses-x").map(|o| o.value), Some(11));
    assert_eq!(derived.get("uses-y").map(|o| o.value), Some(20));

    // A key that did not exist when read is still tracked.
    runs.lock().clear();
    source.upsert(obj("uses-z", 0));
    assert_eq!(derived.get("uses-z").map(|o| o.value), Some(0));
    config.upsert(obj("z", 3));
    assert_eq!(derived.get("uses-z").map(|o| o.value), Some(3));
}

#[test]
fn fetch_all_recomputes_on_any_change() {
    let others = Collection::<Obj>::new("others");
    let source = Collection::<Obj>::new("source");
    source.upsert(obj("count", 0));

    let derived = {
        let others = others.clone();
        source.map("derived", move |ctx, o| {
            Some(obj(&o.name, ctx.fetch_all(&others).len() as u32))
        })
    };
    assert_eq!(derived.get("count").map(|o| o.value), Some(0));

    others.upsert(obj("a", 1));
    others.upsert(obj("b", 1));
    assert_eq!(derived.get("count").map(|o| o.value), Some(2));

    others.remove("a");
    assert_eq!(derived.get("count").map(|o| o.value), Some(1));
}

#[test]
fn index_lookups_follow_the_collection() {
    let source = Collection::<Obj>::new("source");
    source.upsert(obj("a", 1));
    let by_value = source.index("by-value", |o| vec![o.value]);
    source.upsert(obj("b", 1));
    source.upsert(obj("c", 2));

    let names = |v: u32| {
        by_value
            .lookup(&v)
            .iter()
            .map(|o| o.name.clone())
            .collect::<Vec<_>>()
    };
    assert_eq!(names(1), vec!["a".to_string(), "b".to_string()]);
    assert_eq!(names(2), vec!["c".to_string()]);

    source.upsert(obj("a", 2));
    assert_eq!(names(1), vec!["b".to_string()]);
    assert_eq!(names(2), vec!["a".to_string(), "c".to_string()]);

    source.remove("c");
    assert_eq!(names(2), vec!["a".to_string()]);
}

#[test]
fn indexes_keep_derived_collections_alive() {
    let source = Collection::<Obj>::new("source");
    let by_value = {
        let copies = source.flat_map("copies", |_, o| {
            vec![obj(&format!("{}-1", o.name), o.value), obj(&format!("{}-2", o.name), o.value)]
        });
        copies.index("copies-by-value", |o| vec![o.value])
    };

    source.upsert(obj("a", 7));
    assert_eq!(by_value.lookup(&7).len(), 2);

    source.upsert(obj("a", 8));
    assert!(by_value.lookup(&7).is_empty());
    assert_eq!(by_value.lookup(&8).len(), 2);
}

#[test]
fn fetch_index_recomputes_readers_of_the_key() {
    let members = Collection::<Obj>::new("members");
    let groups = Collection::<Obj>::new("groups");
    groups.upsert(obj("1", 0));
    groups.upsert(obj("2", 0));
    let by_group = members.index("by-group", |o| vec![o.value]);

    let sizes = {
        let by_group = by_group.clone();
        groups.map("sizes", move |ctx, g| {
            let id = g.name.parse::<u32>().unwrap_or_default();
            Some(obj(&g.name, ctx.fetch_index(&by_group, &id).len() as u32))
        })
    };

    members.upsert(obj("m1", 1));
    members.upsert(obj("m2", 1));
    members.upsert(obj("m3", 2));
    assert_eq!(sizes.get("1").map(|o| o.value), Some(2));
    assert_eq!(sizes.get("2").map(|o| o.value), Some(1));

    members.upsert(obj("m2", 2));
    assert_eq!(sizes.get("1").map(|o| o.value), Some(1));
    assert_eq!(sizes.get("2").map(|o| o.value), Some(2));
}

#[test]
fn join_merges_inputs() {
    let a = Collection::<Obj>::new("a");
    let b = Collection::<Obj>::new("b");
    a.upsert(obj("x", 1));
    let joined = join("joined", &[a.clone(), b.clone()]);
    b.upsert(obj("y", 2));
    assert_eq!(joined.len(), 2);

    // A collision is resolved in favor of the latest writer.
    b.upsert(obj("x", 3));
    assert_eq!(joined.get("x").map(|o| o.value), Some(3));

    // Removing the winner restores the other input's value.
    b.remove("x");
    assert_eq!(joined.get("x").map(|o| o.value), Some(1));

    a.remove("x");
    assert!(joined.get("x").is_none());
}

#[test]
fn panicking_handlers_keep_prior_outputs() {
    let source = Collection::<Obj>::new("source");
    let derived = source.map("derived", |_, o| {
        if o.value == 13 {
            panic!("unlucky");
        }
        Some(o.clone())
    });

    source.upsert(obj("a", 1));
    source.upsert(obj("a", 13));
    assert_eq!(derived.get("a").map(|o| o.value), Some(1));
    assert_eq!(
        derived.failures(),
        vec![("a".to_string(), "unlucky".to_string())]
    );

    source.upsert(obj("a", 2));
    assert_eq!(derived.get("a").map(|o| o.value), Some(2));
    assert!(derived.failures().is_empty());
}

#[test]
fn reset_removes_absent_keys() {
    let source = Collection::<Obj>::new("source");
    let derived = source.map("derived", |_, o| Some(o.clone()));
    source.upsert(obj("a", 1));
    source.upsert(obj("b", 1));

    source.reset(vec![obj("b", 2), obj("c", 1)]);
    assert!(source.get("a").is_none());
    assert_eq!(derived.get("b").map(|o| o.value), Some(2));
    assert!(derived.get("c").is_some());
    assert_eq!(derived.len(), 2);
}

#[test]
fn subscribers_receive_batches() {
    let source = Collection::<Obj>::new("source");
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    {
        let seen = seen.clone();
        source.subscribe(move |events| {
            let mut seen = seen.lock();
            for e in events {
                seen.push(match e {
                    Event::Added(o) => format!("+{}", o.name),
                    Event::Updated { new, .. } => format!("~{}", new.name),
                    Event::Removed(o) => format!("-{}", o.name),
                });
            }
        });
    }
    source.upsert(obj("a", 1));
    source.upsert(obj("a", 2));
    source.upsert(obj("a", 2));
    source.remove("a");
    source.remove("a");
    assert_eq!(*seen.lock(), vec!["+a", "~a", "-a"]);
}

#[tokio::test]
async fn derived_collections_sync_with_their_inputs() {
    let a = Collection::<Obj>::new("a");
    let b = Collection::<Obj>::new("b");
    let mapped = a.map("mapped", |_, o| Some(o.clone()));
    let joined = join("joined", &[mapped.clone(), b.clone()]);
    assert!(!mapped.has_synced());

    a.mark_synced();
    mapped.synced().await;
    assert!(!joined.has_synced());

    let wait = tokio::spawn({
        let joined = joined.clone();
        async move { joined.synced().await }
    });
    b.mark_synced();
    tokio::time::timeout(std::time::Duration::from_secs(1), wait)
        .await
        .expect("join must sync")
        .expect("task must not fail");
    assert!(joined.has_synced());

    assert!(join::<Obj>("empty", &[]).has_synced());
}
