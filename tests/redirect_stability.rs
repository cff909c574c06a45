#[path = "../src/test_support.rs"]
mod test_support;

use imgmaster::model::Rgb;
use imgmaster::IdentityKind;
use test_support::{engine, item, solid, solid_with_spots, FakeImage, FakeWorld};

#[tokio::test]
async fn historical_ids_resolve_to_the_survivor_after_a_similarity_merge() {
    let world = FakeWorld::new();
    world.add(
        "http://a.example.com/orig.png",
        FakeImage::new(solid(40, 40, 100), 0),
    );
    // Two brightened pixels out of 1600 and a nearby coarse hash: a
    // near-duplicate, not a byte-identical copy.
    world.add(
        "http://b.example.com/copy.png",
        FakeImage::new(solid_with_spots(40, 40, 100, 2), 0b1111),
    );

    let engine = engine(&world);
    let first = engine
        .ingest(vec![item("http://a.example.com/orig.png", "http://site/p1")])
        .await
        .unwrap();
    let original = first[0].cluster;

    let second = engine
        .ingest(vec![item("http://b.example.com/copy.png", "http://site/p2")])
        .await
        .unwrap();
    let survivor = second[0].cluster;

    assert_ne!(original, survivor);
    assert_eq!(engine.resolve(original).unwrap(), survivor);

    // A lookup through the stale id lands on the merged cluster.
    let through_stale = engine.cluster(original).unwrap();
    assert_eq!(through_stale.identities_of(IdentityKind::Url).len(), 4);
    assert_eq!(
        through_stale
            .identities_of(IdentityKind::PageOccurrence)
            .len(),
        2
    );

    let metrics = engine.metrics();
    assert_eq!(metrics.alive, 1);
    assert_eq!(metrics.retired, 1);
}

#[tokio::test]
async fn mid_score_pair_is_marked_similar_not_merged() {
    let world = FakeWorld::new();
    let palette = vec![Rgb::new(200, 30, 30), Rgb::new(30, 200, 30)];
    world.add(
        "http://a.example.com/sale-v1.png",
        FakeImage::new(solid(20, 20, 10), 0)
            .with_palette(palette.clone())
            .with_words(&["summer", "sale"], 0.9),
    );
    // Completely different pixels, but close coarse hash, same palette and
    // same recognized text.
    world.add(
        "http://b.example.com/sale-v2.png",
        FakeImage::new(solid(20, 20, 200), 1)
            .with_palette(palette)
            .with_words(&["summer", "sale"], 0.8),
    );

    let engine = engine(&world);
    let outcomes = engine
        .ingest(vec![
            item("http://a.example.com/sale-v1.png", "http://site/p1"),
            item("http://b.example.com/sale-v2.png", "http://site/p2"),
        ])
        .await
        .unwrap();

    assert_ne!(outcomes[0].cluster, outcomes[1].cluster);
    assert_eq!(engine.metrics().alive, 2);

    // Perceptual 0 + palette 20 + text 30 lands between the thresholds,
    // so both sides carry a mark pointing at the other.
    let a = engine.cluster(outcomes[0].cluster).unwrap();
    let b = engine.cluster(outcomes[1].cluster).unwrap();
    assert!(a.contains_kind(IdentityKind::SimilarMark));
    assert!(b.contains_kind(IdentityKind::SimilarMark));
}
