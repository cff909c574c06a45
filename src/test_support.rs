//! Deterministic fakes and dataset generators shared by the integration
//! tests. Included from `tests/` via `#[path]`, never compiled into the
//! library itself.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};

use imgmaster::analysis::{
    Analyzers, ImageDecoder, OcrEngine, OcrOutcome, PaletteExtractor, PerceptualFingerprint,
    PerceptualHasher, ResourceFetcher, Sha256ContentHasher,
};
use imgmaster::cache::MemoryCache;
use imgmaster::config::EngineConfig;
use imgmaster::error::AcquireError;
use imgmaster::identity::FineFingerprint;
use imgmaster::model::{FetchedResource, ItemDescriptor, PageContext, PixelBuffer, Rgb};
use imgmaster::ImgMaster;

/// One registered image: what the fake fetcher/decoder/analyzers will
/// report for its locator.
#[derive(Debug, Clone)]
pub struct FakeImage {
    pub pixels: PixelBuffer,
    pub phash: u64,
    pub palette: Vec<Rgb>,
    pub words: Vec<String>,
    pub confidence: f32,
    pub etag: Option<String>,
}

#[allow(dead_code)]
impl FakeImage {
    pub fn new(pixels: PixelBuffer, phash: u64) -> Self {
        Self {
            pixels,
            phash,
            palette: Vec::new(),
            words: Vec::new(),
            confidence: 0.0,
            etag: None,
        }
    }

    pub fn with_palette(mut self, palette: Vec<Rgb>) -> Self {
        self.palette = palette;
        self
    }

    pub fn with_words(mut self, words: &[&str], confidence: f32) -> Self {
        self.words = words.iter().map(|w| w.to_string()).collect();
        self.confidence = confidence;
        self
    }

    pub fn with_etag(mut self, etag: &str) -> Self {
        self.etag = Some(etag.to_string());
        self
    }
}

/// A closed world of images keyed by locator, standing in for the network
/// and the analysis backends. Every answer is a pure function of what was
/// registered, so test runs are reproducible.
#[derive(Default)]
pub struct FakeWorld {
    images: Mutex<HashMap<String, FakeImage>>,
    by_pixels: Mutex<HashMap<Vec<u8>, FakeImage>>,
    fetch_failures: Mutex<HashSet<String>>,
    decode_failures: Mutex<HashSet<String>>,
    fetches: AtomicU64,
    fetches_in_flight: AtomicU64,
    peak_fetches: AtomicU64,
    fetch_delay: Mutex<Option<Duration>>,
}

#[allow(dead_code)]
impl FakeWorld {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, locator: impl Into<String>, image: FakeImage) {
        self.by_pixels
            .lock()
            .insert(image.pixels.pixels.clone(), image.clone());
        self.images.lock().insert(locator.into(), image);
    }

    pub fn fail_fetch(&self, locator: impl Into<String>) {
        self.fetch_failures.lock().insert(locator.into());
    }

    pub fn fail_decode(&self, locator: impl Into<String>) {
        self.decode_failures.lock().insert(locator.into());
    }

    pub fn analyzers(self: &Arc<Self>) -> Analyzers {
        Analyzers {
            fetcher: Arc::clone(self) as _,
            decoder: Arc::clone(self) as _,
            content: Arc::new(Sha256ContentHasher),
            perceptual: Arc::clone(self) as _,
            palette: Arc::clone(self) as _,
            ocr: Arc::clone(self) as _,
        }
    }

    /// How many fetches the engine actually issued.
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    /// Highest number of fetches that were ever in flight at once.
    pub fn peak_fetch_concurrency(&self) -> u64 {
        self.peak_fetches.load(Ordering::SeqCst)
    }

    /// Make every fetch dwell, so concurrent fetches actually overlap.
    pub fn set_fetch_delay(&self, delay: Duration) {
        *self.fetch_delay.lock() = Some(delay);
    }

    fn by_pixels(&self, pixels: &PixelBuffer) -> Option<FakeImage> {
        self.by_pixels.lock().get(&pixels.pixels).cloned()
    }
}

#[async_trait]
impl ResourceFetcher for FakeWorld {
    async fn fetch(&self, locator: &str) -> Result<FetchedResource, AcquireError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.fetches_in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_fetches.fetch_max(now, Ordering::SeqCst);
        let delay = *self.fetch_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.fetches_in_flight.fetch_sub(1, Ordering::SeqCst);
        if self.fetch_failures.lock().contains(locator) {
            return Err(AcquireError::Fetch {
                locator: locator.to_string(),
                reason: "connection refused".to_string(),
            });
        }
        let images = self.images.lock();
        let image = images.get(locator).ok_or_else(|| AcquireError::Fetch {
            locator: locator.to_string(),
            reason: "404 not found".to_string(),
        })?;
        Ok(FetchedResource {
            locator: locator.to_string(),
            bytes: image.pixels.pixels.clone(),
            etag: image.etag.clone(),
            last_modified: None,
            content_length: Some(image.pixels.pixels.len() as u64),
        })
    }
}

#[async_trait]
impl ImageDecoder for FakeWorld {
    async fn decode(&self, resource: &FetchedResource) -> Result<PixelBuffer, AcquireError> {
        if self.decode_failures.lock().contains(&resource.locator) {
            return Err(AcquireError::Decode {
                locator: resource.locator.clone(),
                reason: "corrupt payload".to_string(),
            });
        }
        let images = self.images.lock();
        let image = images
            .get(&resource.locator)
            .ok_or_else(|| AcquireError::Decode {
                locator: resource.locator.clone(),
                reason: "unknown format".to_string(),
            })?;
        Ok(image.pixels.clone())
    }
}

#[async_trait]
impl PerceptualHasher for FakeWorld {
    async fn fingerprint(&self, pixels: &PixelBuffer) -> anyhow::Result<PerceptualFingerprint> {
        let hash = self.by_pixels(pixels).map(|image| image.phash).unwrap_or(0);
        Ok(PerceptualFingerprint {
            hash,
            fine: luma_of(pixels),
        })
    }
}

#[async_trait]
impl PaletteExtractor for FakeWorld {
    async fn palette(&self, pixels: &PixelBuffer) -> anyhow::Result<Vec<Rgb>> {
        Ok(self
            .by_pixels(pixels)
            .map(|image| image.palette)
            .unwrap_or_default())
    }
}

#[async_trait]
impl OcrEngine for FakeWorld {
    async fn recognize(&self, pixels: &PixelBuffer) -> anyhow::Result<OcrOutcome> {
        Ok(self
            .by_pixels(pixels)
            .map(|image| OcrOutcome {
                words: image.words,
                confidence: image.confidence,
            })
            .unwrap_or(OcrOutcome {
                words: Vec::new(),
                confidence: 0.0,
            }))
    }
}

/// Fine fingerprint of a buffer: the red channel as luma.
pub fn luma_of(pixels: &PixelBuffer) -> FineFingerprint {
    let luma = pixels.pixels.iter().step_by(3).copied().collect();
    FineFingerprint::new(pixels.width, pixels.height, luma)
}

/// A width x height buffer filled with one shade.
pub fn solid(width: u32, height: u32, shade: u8) -> PixelBuffer {
    PixelBuffer::new(width, height, vec![shade; (width * height * 3) as usize])
}

/// Like [`solid`] but with the first `spots` pixels brightened, for
/// controlled pixel-level differences between two buffers.
#[allow(dead_code)]
pub fn solid_with_spots(width: u32, height: u32, shade: u8, spots: usize) -> PixelBuffer {
    let mut pixels = vec![shade; (width * height * 3) as usize];
    for pixel in pixels.chunks_mut(3).take(spots) {
        for channel in pixel {
            *channel = shade.wrapping_add(64);
        }
    }
    PixelBuffer::new(width, height, pixels)
}

pub fn page(origin: &str) -> PageContext {
    PageContext {
        origin: origin.to_string(),
        ..PageContext::default()
    }
}

pub fn item(locator: &str, origin: &str) -> ItemDescriptor {
    ItemDescriptor::new(locator, page(origin))
}

/// Engine wired to a fake world with an in-memory cache and defaults.
pub fn engine(world: &Arc<FakeWorld>) -> ImgMaster {
    engine_with(world, EngineConfig::default())
}

/// [`engine`] with explicit configuration.
#[allow(dead_code)]
pub fn engine_with(world: &Arc<FakeWorld>, config: EngineConfig) -> ImgMaster {
    ImgMaster::new(world.analyzers(), Arc::new(MemoryCache::new()), config)
}

/// Register `distinct` unrelated images, each reachable through two CDN
/// aliases, then draw `observations` random sightings of them. Same seed,
/// same dataset.
#[allow(dead_code)]
pub fn generate_dataset(
    world: &FakeWorld,
    distinct: usize,
    observations: usize,
    seed: u64,
) -> Vec<ItemDescriptor> {
    let mut rng = StdRng::seed_from_u64(seed);
    for i in 0..distinct {
        let shade = (i * 37 % 251) as u8;
        let pixels = solid(16, 16, shade);
        // Hashes far apart so the prefilter keeps distinct images distinct.
        let phash = (i as u64 + 1) * 0x0101_0101;
        for alias in 0..2 {
            world.add(
                format!("http://cdn{alias}.example.com/img{i}.png"),
                FakeImage::new(pixels.clone(), phash),
            );
        }
    }
    (0..observations)
        .map(|_| {
            let i = rng.random_range(0..distinct);
            let alias = rng.random_range(0..2_u32);
            item(
                &format!("http://cdn{alias}.example.com/img{i}.png"),
                &format!("http://site.example.com/page{}", rng.random_range(0..5)),
            )
        })
        .collect()
}

/// Deterministically reorder a batch.
#[allow(dead_code)]
pub fn shuffled(items: &[ItemDescriptor], seed: u64) -> Vec<ItemDescriptor> {
    let mut rng = StdRng::seed_from_u64(seed);
    let mut out = items.to_vec();
    out.shuffle(&mut rng);
    out
}
