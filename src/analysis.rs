//! # Analysis Collaborators
//!
//! Seams for the external decode/analysis collaborators. The engine consumes
//! these as opaque scoring primitives; production wiring plugs in real
//! implementations, tests plug in deterministic fakes.

use crate::error::AcquireError;
use crate::identity::FineFingerprint;
use crate::model::{FetchedResource, PixelBuffer, Rgb};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;

/// Fetches the raw resource behind a locator.
#[async_trait]
pub trait ResourceFetcher: Send + Sync {
    async fn fetch(&self, locator: &str) -> Result<FetchedResource, AcquireError>;
}

/// Decodes a fetched resource into a pixel buffer.
#[async_trait]
pub trait ImageDecoder: Send + Sync {
    async fn decode(&self, resource: &FetchedResource) -> Result<PixelBuffer, AcquireError>;
}

/// Cryptographic digest of decoded pixel data.
pub trait ContentHasher: Send + Sync {
    fn digest(&self, pixels: &PixelBuffer) -> String;
}

/// Perceptual fingerprint: coarse 64-bit hash plus a fine grayscale grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PerceptualFingerprint {
    pub hash: u64,
    pub fine: FineFingerprint,
}

#[async_trait]
pub trait PerceptualHasher: Send + Sync {
    async fn fingerprint(&self, pixels: &PixelBuffer) -> anyhow::Result<PerceptualFingerprint>;
}

/// Ranked top-color extraction.
#[async_trait]
pub trait PaletteExtractor: Send + Sync {
    async fn palette(&self, pixels: &PixelBuffer) -> anyhow::Result<Vec<Rgb>>;
}

/// Recognized text with confidence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OcrOutcome {
    pub words: Vec<String>,
    pub confidence: f32,
}

#[async_trait]
pub trait OcrEngine: Send + Sync {
    async fn recognize(&self, pixels: &PixelBuffer) -> anyhow::Result<OcrOutcome>;
}

/// SHA-256 over the raw pixel bytes plus dimensions, hex encoded.
#[derive(Debug, Clone, Copy, Default)]
pub struct Sha256ContentHasher;

impl ContentHasher for Sha256ContentHasher {
    fn digest(&self, pixels: &PixelBuffer) -> String {
        let mut hasher = Sha256::new();
        hasher.update(pixels.width.to_be_bytes());
        hasher.update(pixels.height.to_be_bytes());
        hasher.update(&pixels.pixels);
        hex::encode(hasher.finalize())
    }
}

/// The full collaborator bundle handed to the engine at construction.
#[derive(Clone)]
pub struct Analyzers {
    pub fetcher: Arc<dyn ResourceFetcher>,
    pub decoder: Arc<dyn ImageDecoder>,
    pub content: Arc<dyn ContentHasher>,
    pub perceptual: Arc<dyn PerceptualHasher>,
    pub palette: Arc<dyn PaletteExtractor>,
    pub ocr: Arc<dyn OcrEngine>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_hash_is_stable_and_dimension_aware() {
        let hasher = Sha256ContentHasher;
        let a = PixelBuffer::new(2, 1, vec![0; 6]);
        let b = PixelBuffer::new(2, 1, vec![0; 6]);
        let c = PixelBuffer::new(1, 2, vec![0; 6]);

        assert_eq!(hasher.digest(&a), hasher.digest(&b));
        assert_ne!(hasher.digest(&a), hasher.digest(&c));
        assert_eq!(hasher.digest(&a).len(), 64);
    }
}
