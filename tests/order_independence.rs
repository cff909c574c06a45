#[path = "../src/test_support.rs"]
mod test_support;

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use imgmaster::model::ItemDescriptor;
use test_support::{engine, generate_dataset, shuffled, FakeWorld};

async fn partition(world: &Arc<FakeWorld>, items: Vec<ItemDescriptor>) -> BTreeSet<BTreeSet<String>> {
    let engine = engine(world);
    let outcomes = engine.ingest(items).await.unwrap();
    let mut groups: BTreeMap<_, BTreeSet<String>> = BTreeMap::new();
    for outcome in outcomes {
        groups.entry(outcome.cluster).or_default().insert(outcome.locator);
    }
    groups.into_values().collect()
}

#[tokio::test]
async fn shuffled_batches_produce_the_same_partition() {
    let world = FakeWorld::new();
    let items = generate_dataset(&world, 6, 40, 7);

    let forward = partition(&world, items.clone()).await;
    let backward = partition(&world, shuffled(&items, 99)).await;

    assert_eq!(forward, backward);
    // Two CDN aliases of the same image never split into separate groups.
    assert!(forward.len() <= 6);
}

#[tokio::test]
async fn reingesting_the_same_batch_is_idempotent() {
    let world = FakeWorld::new();
    let items = generate_dataset(&world, 4, 20, 3);

    let engine = engine(&world);
    let first = engine.ingest(items.clone()).await.unwrap();
    let alive_after_first = engine.metrics().alive;

    let second = engine.ingest(items).await.unwrap();
    assert_eq!(engine.metrics().alive, alive_after_first);

    // Every repeated observation lands on the cluster the first pass built.
    for (a, b) in first.iter().zip(second.iter()) {
        assert_eq!(a.locator, b.locator);
        assert_eq!(
            engine.resolve(a.cluster).unwrap(),
            engine.resolve(b.cluster).unwrap()
        );
    }
}
