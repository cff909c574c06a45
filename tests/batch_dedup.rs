#[path = "../src/test_support.rs"]
mod test_support;

use std::time::Duration;

use imgmaster::{EngineConfig, IdentityKind};
use test_support::{engine, engine_with, item, solid, FakeImage, FakeWorld};

#[tokio::test]
async fn identical_content_behind_different_urls_collapses_to_one_cluster() {
    let world = FakeWorld::new();
    let pixels = solid(8, 8, 42);
    world.add(
        "http://cdn-a.example.com/x.png",
        FakeImage::new(pixels.clone(), 0xAB),
    );
    world.add(
        "http://cdn-b.example.com/y.png",
        FakeImage::new(pixels, 0xAB),
    );

    let engine = engine(&world);
    let outcomes = engine
        .ingest(vec![
            item("http://cdn-a.example.com/x.png", "http://site/page1"),
            item("http://cdn-b.example.com/y.png", "http://site/page2"),
        ])
        .await
        .unwrap();

    assert_eq!(outcomes.len(), 2);
    assert_eq!(outcomes[0].cluster, outcomes[1].cluster);

    let cluster = engine.cluster(outcomes[0].cluster).unwrap();
    assert_eq!(cluster.identities_of(IdentityKind::ContentHash).len(), 1);
    assert_eq!(cluster.identities_of(IdentityKind::PageOccurrence).len(), 2);
    assert_eq!(engine.metrics().alive, 1);
}

#[tokio::test]
async fn fetch_concurrency_respects_the_configured_ceiling() {
    let world = FakeWorld::new();
    for i in 0u64..12 {
        // Shades 20 apart so nothing scores as a near-duplicate.
        world.add(
            format!("http://cdn.example.com/img{i}.png"),
            FakeImage::new(solid(4, 4, (i * 20) as u8), i),
        );
    }
    world.set_fetch_delay(Duration::from_millis(10));

    let mut config = EngineConfig::default();
    config.tuning.max_in_flight = 2;
    let engine = engine_with(&world, config);

    let items = (0..12)
        .map(|i| {
            item(
                &format!("http://cdn.example.com/img{i}.png"),
                "http://site/page",
            )
        })
        .collect();
    let outcomes = engine.ingest(items).await.unwrap();

    assert_eq!(outcomes.len(), 12);
    assert_eq!(world.fetch_count(), 12);
    assert!(world.peak_fetch_concurrency() <= 2);
    assert_eq!(engine.metrics().alive, 12);
}

#[tokio::test]
async fn repeat_observation_of_a_known_url_skips_the_fetch() {
    let world = FakeWorld::new();
    world.add(
        "http://img.example.com/banner.png",
        FakeImage::new(solid(8, 8, 7), 0x10),
    );

    let engine = engine(&world);
    let first = engine
        .ingest(vec![item(
            "http://img.example.com/banner.png",
            "http://site/home",
        )])
        .await
        .unwrap();
    assert_eq!(world.fetch_count(), 1);

    let second = engine
        .ingest(vec![item(
            "http://img.example.com/banner.png",
            "http://site/about",
        )])
        .await
        .unwrap();

    assert_eq!(first[0].cluster, second[0].cluster);
    assert_eq!(world.fetch_count(), 1);

    // Both sightings are recorded even though only one was fetched.
    let cluster = engine.cluster(first[0].cluster).unwrap();
    assert_eq!(cluster.identities_of(IdentityKind::PageOccurrence).len(), 2);
}

#[tokio::test]
async fn variant_url_joins_a_later_observation_without_refetch() {
    let world = FakeWorld::new();
    world.add(
        "http://img.example.com/full.png",
        FakeImage::new(solid(8, 8, 50), 0x20),
    );

    let engine = engine(&world);
    let first = engine
        .ingest(vec![item(
            "http://img.example.com/full.png",
            "http://site/gallery",
        )
        .with_variant("http://img.example.com/thumb.png")])
        .await
        .unwrap();
    assert_eq!(world.fetch_count(), 1);

    // The thumbnail was never registered in the world; only the variant
    // identity can place it.
    let second = engine
        .ingest(vec![item(
            "http://img.example.com/thumb.png",
            "http://site/teaser",
        )])
        .await
        .unwrap();

    assert_eq!(first[0].cluster, second[0].cluster);
    assert_eq!(world.fetch_count(), 1);
    assert_eq!(engine.metrics().alive, 1);
}
