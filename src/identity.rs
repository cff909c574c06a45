//! # Identity Model
//!
//! A closed set of identity variants, each a typed fact attached to a
//! cluster. Capability flags (`strong`, `singleton`, instigator,
//! collaborator) drive arbitration and similarity scoring; every variant
//! implements the same small method set (`merge_other`, `merge_weight`,
//! candidate pre-filtering) instead of relying on runtime type inspection.

use crate::model::{ClusterId, Rgb};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

/// Coarse hamming-distance pre-filter threshold for perceptual candidates.
pub const HAMMING_PREFILTER: u32 = 20;

/// Two fine-fingerprint luma samples closer than this count as the same pixel.
const PIXEL_DIFF_TOLERANCE: u8 = 8;

/// Discriminator for identity variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum IdentityKind {
    Url,
    ContentHash,
    PageOccurrence,
    Perceptual,
    ColorPalette,
    OcrText,
    SequenceOrder,
    SimilarMark,
}

impl IdentityKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Url => "url",
            Self::ContentHash => "content-hash",
            Self::PageOccurrence => "page-occurrence",
            Self::Perceptual => "perceptual",
            Self::ColorPalette => "color-palette",
            Self::OcrText => "ocr-text",
            Self::SequenceOrder => "sequence-order",
            Self::SimilarMark => "similar-mark",
        }
    }
}

impl fmt::Display for IdentityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Map key for identities: the id string is meaningful only within its
/// kind's namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct IdentityKey {
    pub kind: IdentityKind,
    pub id: String,
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.kind, self.id)
    }
}

/// Canonical resource identity derived from a URL plus cache validators,
/// falling back to the raw URL when no validator exists.
#[derive(Debug, Clone, PartialEq)]
pub struct UrlIdentity {
    pub url: String,
    /// Cache validator (`etag:`/`mod:`/`len:` prefixed), if known
    pub validator: Option<String>,
}

/// Cryptographic hash of decoded pixel data (hex digest).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContentHashIdentity {
    pub digest: String,
}

/// Unique per site+instance+URL; aggregates analytics per occurrence and
/// never merges across distinct occurrences.
#[derive(Debug, Clone, PartialEq)]
pub struct PageOccurrenceIdentity {
    pub origin: String,
    pub url: String,
    pub instance: u32,
    /// Free-form per-occurrence properties (alt text, dimensions, flags)
    pub properties: HashMap<String, String>,
}

/// Downsampled grayscale fingerprint used for the fine pixel comparison.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FineFingerprint {
    pub width: u32,
    pub height: u32,
    /// `width * height` luma bytes
    pub luma: Vec<u8>,
}

impl FineFingerprint {
    pub fn new(width: u32, height: u32, luma: Vec<u8>) -> Self {
        debug_assert_eq!(luma.len(), (width * height) as usize);
        Self {
            width,
            height,
            luma,
        }
    }

    fn sample(&self, x: u32, y: u32) -> u8 {
        self.luma[(y * self.width + x) as usize]
    }
}

/// Near-duplicate detector: coarse 64-bit hash for the hamming pre-filter
/// plus a fine fingerprint for the full pixel comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct PerceptualIdentity {
    pub hash: u64,
    pub fine: Arc<FineFingerprint>,
}

impl PerceptualIdentity {
    pub fn hamming(&self, other: &PerceptualIdentity) -> u32 {
        (self.hash ^ other.hash).count_ones()
    }
}

/// Ranked top-color list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColorPaletteIdentity {
    pub colors: Vec<Rgb>,
}

/// Recognized text with confidence.
#[derive(Debug, Clone, PartialEq)]
pub struct OcrTextIdentity {
    pub words: Vec<String>,
    pub confidence: f32,
}

/// Bidirectional soft cross-reference between two clusters marked as
/// similar; non-owning and released automatically on any merge involving
/// either side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimilarMarkIdentity {
    pub other: ClusterId,
    pub score: u32,
}

/// A typed fact attached to a cluster.
#[derive(Debug, Clone, PartialEq)]
pub enum Identity {
    Url(UrlIdentity),
    ContentHash(ContentHashIdentity),
    PageOccurrence(PageOccurrenceIdentity),
    Perceptual(PerceptualIdentity),
    ColorPalette(ColorPaletteIdentity),
    OcrText(OcrTextIdentity),
    SequenceOrder(u64),
    SimilarMark(SimilarMarkIdentity),
}

impl Identity {
    /// Build a URL identity, preferring the validator-qualified form.
    pub fn url(url: impl Into<String>, validator: Option<String>) -> Self {
        Self::Url(UrlIdentity {
            url: url.into(),
            validator,
        })
    }

    pub fn content_hash(digest: impl Into<String>) -> Self {
        Self::ContentHash(ContentHashIdentity {
            digest: digest.into(),
        })
    }

    pub fn kind(&self) -> IdentityKind {
        match self {
            Self::Url(_) => IdentityKind::Url,
            Self::ContentHash(_) => IdentityKind::ContentHash,
            Self::PageOccurrence(_) => IdentityKind::PageOccurrence,
            Self::Perceptual(_) => IdentityKind::Perceptual,
            Self::ColorPalette(_) => IdentityKind::ColorPalette,
            Self::OcrText(_) => IdentityKind::OcrText,
            Self::SequenceOrder(_) => IdentityKind::SequenceOrder,
            Self::SimilarMark(_) => IdentityKind::SimilarMark,
        }
    }

    /// The id string within this variant's namespace.
    pub fn identity_id(&self) -> String {
        match self {
            Self::Url(url) => match &url.validator {
                Some(validator) => format!("{}#{}", url.url, validator),
                None => url.url.clone(),
            },
            Self::ContentHash(hash) => hash.digest.clone(),
            Self::PageOccurrence(occ) => {
                format!("{}|{}|{}", occ.origin, occ.url, occ.instance)
            }
            Self::Perceptual(phash) => format!("{:016x}", phash.hash),
            Self::ColorPalette(palette) => {
                let mut id = String::with_capacity(palette.colors.len() * 7);
                for color in &palette.colors {
                    id.push_str(&color.to_string());
                }
                id
            }
            Self::OcrText(ocr) => {
                use std::hash::{Hash, Hasher};
                let mut hasher = std::collections::hash_map::DefaultHasher::new();
                ocr.words.hash(&mut hasher);
                format!("{:016x}", hasher.finish())
            }
            Self::SequenceOrder(seq) => seq.to_string(),
            Self::SimilarMark(mark) => format!("similar:{}", mark.other),
        }
    }

    pub fn key(&self) -> IdentityKey {
        IdentityKey {
            kind: self.kind(),
            id: self.identity_id(),
        }
    }

    /// Strong identities must be globally unique across all live clusters;
    /// their appearance in two clusters forces a merge.
    pub fn is_strong(&self) -> bool {
        matches!(
            self.kind(),
            IdentityKind::Url
                | IdentityKind::ContentHash
                | IdentityKind::PageOccurrence
                | IdentityKind::SequenceOrder
        )
    }

    /// At most one instance of a singleton kind may exist per cluster.
    pub fn is_singleton(&self) -> bool {
        matches!(
            self.kind(),
            IdentityKind::Perceptual | IdentityKind::ColorPalette | IdentityKind::OcrText
        )
    }

    /// Instigators trigger a similarity pass when newly added.
    pub fn is_similarity_instigator(&self) -> bool {
        matches!(self.kind(), IdentityKind::Perceptual)
    }

    /// Collaborators contribute a weighted score to pairwise comparison.
    pub fn is_similarity_collaborator(&self) -> bool {
        matches!(
            self.kind(),
            IdentityKind::Perceptual | IdentityKind::ColorPalette | IdentityKind::OcrText
        )
    }

    /// Reconcile another instance of the same identity into this one when
    /// clusters merge. Idempotent; side effects on `self` only.
    pub fn merge_other(&mut self, other: &Identity) {
        match (self, other) {
            (Self::Url(mine), Self::Url(theirs)) => {
                if mine.validator.is_none() {
                    mine.validator = theirs.validator.clone();
                }
            }
            (Self::PageOccurrence(mine), Self::PageOccurrence(theirs)) => {
                // Same occurrence observed twice: union properties, first
                // writer keeps precedence per key.
                for (key, value) in &theirs.properties {
                    mine.properties
                        .entry(key.clone())
                        .or_insert_with(|| value.clone());
                }
            }
            (Self::OcrText(mine), Self::OcrText(theirs)) => {
                if theirs.confidence > mine.confidence {
                    mine.words = theirs.words.clone();
                    mine.confidence = theirs.confidence;
                }
            }
            // Content hash, perceptual, palette, sequence and marks carry
            // nothing to reconcile.
            _ => {}
        }
    }

    /// Cheap candidate pruning for instigators: retain clusters whose
    /// perceptual hash is within the coarse hamming threshold. Non-perceptual
    /// identities keep the full candidate set.
    pub fn filter_similar_clusters<'a>(
        &self,
        candidates: Vec<(ClusterId, &'a Identity)>,
    ) -> Vec<(ClusterId, &'a Identity)> {
        self.filter_similar_clusters_with(candidates, HAMMING_PREFILTER)
    }

    /// [`Self::filter_similar_clusters`] with an explicit hamming threshold.
    pub fn filter_similar_clusters_with<'a>(
        &self,
        candidates: Vec<(ClusterId, &'a Identity)>,
        max_distance: u32,
    ) -> Vec<(ClusterId, &'a Identity)> {
        match self {
            Self::Perceptual(mine) => candidates
                .into_iter()
                .filter(|(_, identity)| match identity {
                    Identity::Perceptual(theirs) => mine.hamming(theirs) <= max_distance,
                    _ => false,
                })
                .collect(),
            _ => candidates,
        }
    }

    /// Non-negative contribution of this identity pair to a merge score.
    ///
    /// Weight tables:
    /// - color palette: 20/15/10/5/0 as the symmetric difference of top-color
    ///   sets grows past 0, 10%, 20%, 40% of the larger palette
    /// - OCR text: 30/20/10/5/0 at the same breakpoints over the larger word
    ///   set
    /// - perceptual: 100/100/100/70/60/50/0 as the pixel-difference count
    ///   crosses 0, 0.2%, 0.4%, 0.8%, 1.2%, 1.6% of compared pixels at the
    ///   lower of the two resolutions; 0 outright past the hamming pre-filter
    pub async fn merge_weight(&self, other: &Identity) -> u32 {
        match (self, other) {
            (Self::Perceptual(a), Self::Perceptual(b)) => perceptual_weight(a, b),
            (Self::ColorPalette(a), Self::ColorPalette(b)) => {
                symmetric_difference_weight(&a.colors, &b.colors, &[20, 15, 10, 5, 0])
            }
            (Self::OcrText(a), Self::OcrText(b)) => {
                symmetric_difference_weight(&a.words, &b.words, &[30, 20, 10, 5, 0])
            }
            _ => 0,
        }
    }
}

/// Bucketed weight over the symmetric difference of two sets, relative to
/// the larger set: exact match, then past 10%, 20%, 40%.
fn symmetric_difference_weight<T: Eq + std::hash::Hash>(
    a: &[T],
    b: &[T],
    weights: &[u32; 5],
) -> u32 {
    let set_a: std::collections::HashSet<&T> = a.iter().collect();
    let set_b: std::collections::HashSet<&T> = b.iter().collect();
    let larger = set_a.len().max(set_b.len()) as u64;
    if larger == 0 {
        return 0;
    }
    let diff = set_a.symmetric_difference(&set_b).count() as u64;
    if diff == 0 {
        weights[0]
    } else if diff * 10 <= larger {
        weights[1]
    } else if diff * 5 <= larger {
        weights[2]
    } else if diff * 5 <= larger * 2 {
        weights[3]
    } else {
        weights[4]
    }
}

fn perceptual_weight(a: &PerceptualIdentity, b: &PerceptualIdentity) -> u32 {
    if a.hamming(b) > HAMMING_PREFILTER {
        return 0;
    }
    let (diff, total) = pixel_difference(&a.fine, &b.fine);
    if total == 0 {
        return 0;
    }
    // Breakpoints are per-mille of compared pixels: 0, 2, 4, 8, 12, 16.
    if diff == 0 || diff * 1000 <= total * 4 {
        100
    } else if diff * 1000 <= total * 8 {
        70
    } else if diff * 1000 <= total * 12 {
        60
    } else if diff * 1000 <= total * 16 {
        50
    } else {
        0
    }
}

/// Count differing pixels between two fine fingerprints, sampled at the
/// lower of the two resolutions for a fair comparison.
fn pixel_difference(a: &FineFingerprint, b: &FineFingerprint) -> (u64, u64) {
    let width = a.width.min(b.width);
    let height = a.height.min(b.height);
    if width == 0 || height == 0 {
        return (0, 0);
    }
    let mut diff = 0u64;
    for y in 0..height {
        for x in 0..width {
            let la = a.sample(x * a.width / width, y * a.height / height);
            let lb = b.sample(x * b.width / width, y * b.height / height);
            if la.abs_diff(lb) > PIXEL_DIFF_TOLERANCE {
                diff += 1;
            }
        }
    }
    (diff, (width as u64) * (height as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn perceptual(hash: u64, fine: FineFingerprint) -> PerceptualIdentity {
        PerceptualIdentity {
            hash,
            fine: Arc::new(fine),
        }
    }

    fn flat_fingerprint(side: u32, value: u8) -> FineFingerprint {
        FineFingerprint::new(side, side, vec![value; (side * side) as usize])
    }

    /// Fingerprint with exactly `flips` pixels pushed past the tolerance.
    fn flipped_fingerprint(side: u32, value: u8, flips: usize) -> FineFingerprint {
        let mut luma = vec![value; (side * side) as usize];
        for slot in luma.iter_mut().take(flips) {
            *slot = value.wrapping_add(64);
        }
        FineFingerprint::new(side, side, luma)
    }

    #[test]
    fn capability_flags() {
        let url = Identity::url("http://a/x.png", None);
        assert!(url.is_strong());
        assert!(!url.is_singleton());

        let phash = Identity::Perceptual(perceptual(0, flat_fingerprint(4, 10)));
        assert!(!phash.is_strong());
        assert!(phash.is_singleton());
        assert!(phash.is_similarity_instigator());
        assert!(phash.is_similarity_collaborator());

        let palette = Identity::ColorPalette(ColorPaletteIdentity { colors: vec![] });
        assert!(!palette.is_similarity_instigator());
        assert!(palette.is_similarity_collaborator());
    }

    #[test]
    fn url_identity_prefers_validator() {
        let bare = Identity::url("http://a/x.png", None);
        assert_eq!(bare.identity_id(), "http://a/x.png");

        let validated = Identity::url("http://a/x.png", Some("etag:\"v1\"".into()));
        assert_eq!(validated.identity_id(), "http://a/x.png#etag:\"v1\"");
    }

    #[test]
    fn url_merge_adopts_missing_validator() {
        let mut bare = Identity::url("http://a/x.png", None);
        let validated = Identity::url("http://a/x.png", Some("len:9".into()));
        bare.merge_other(&validated);
        match bare {
            Identity::Url(url) => assert_eq!(url.validator.as_deref(), Some("len:9")),
            other => panic!("unexpected variant {other:?}"),
        }
    }

    #[test]
    fn occurrence_merge_unions_properties() {
        let mut first = Identity::PageOccurrence(PageOccurrenceIdentity {
            origin: "http://site/page".into(),
            url: "http://site/img.png".into(),
            instance: 1,
            properties: HashMap::from([("alt".to_string(), "logo".to_string())]),
        });
        let second = Identity::PageOccurrence(PageOccurrenceIdentity {
            origin: "http://site/page".into(),
            url: "http://site/img.png".into(),
            instance: 1,
            properties: HashMap::from([
                ("alt".to_string(), "other".to_string()),
                ("degraded".to_string(), "fetch-failed".to_string()),
            ]),
        });
        first.merge_other(&second);
        match first {
            Identity::PageOccurrence(occ) => {
                assert_eq!(occ.properties["alt"], "logo");
                assert_eq!(occ.properties["degraded"], "fetch-failed");
            }
            other => panic!("unexpected variant {other:?}"),
        }
    }

    async fn palette_weight(base: &[Rgb], other: &[Rgb]) -> u32 {
        let a = Identity::ColorPalette(ColorPaletteIdentity {
            colors: base.to_vec(),
        });
        let b = Identity::ColorPalette(ColorPaletteIdentity {
            colors: other.to_vec(),
        });
        a.merge_weight(&b).await
    }

    #[tokio::test]
    async fn palette_weight_buckets() {
        let base: Vec<Rgb> = (0..10).map(|i| Rgb::new(i, i, i)).collect();

        assert_eq!(palette_weight(&base, &base).await, 20);

        // One color missing: symmetric difference 1 of 10 = 10%.
        assert_eq!(palette_weight(&base, &base[..9]).await, 15);

        // One color swapped: symmetric difference 2 of 10 = 20%.
        let mut one_off = base.clone();
        one_off[9] = Rgb::new(200, 0, 0);
        assert_eq!(palette_weight(&base, &one_off).await, 10);

        // Two swapped: 4 of 10 = 40%.
        let mut two_off = base.clone();
        two_off[8] = Rgb::new(200, 0, 0);
        two_off[9] = Rgb::new(0, 200, 0);
        assert_eq!(palette_weight(&base, &two_off).await, 5);

        let disjoint: Vec<Rgb> = (0..10).map(|i| Rgb::new(100 + i, 0, 0)).collect();
        assert_eq!(palette_weight(&base, &disjoint).await, 0);
    }

    async fn ocr_weight(base: &[String], other: &[String]) -> u32 {
        let a = Identity::OcrText(OcrTextIdentity {
            words: base.to_vec(),
            confidence: 0.9,
        });
        let b = Identity::OcrText(OcrTextIdentity {
            words: other.to_vec(),
            confidence: 0.9,
        });
        a.merge_weight(&b).await
    }

    #[tokio::test]
    async fn ocr_weight_buckets() {
        let base: Vec<String> = (0..20).map(|i| format!("word{i}")).collect();

        assert_eq!(ocr_weight(&base, &base).await, 30);

        // One word replaced: difference 2 of 20 = 10%.
        let mut one_off = base.clone();
        one_off[0] = "changed".into();
        assert_eq!(ocr_weight(&base, &one_off).await, 20);

        // Two replaced: 4 of 20 = 20%.
        let mut two_off = base.clone();
        two_off[0] = "changed".into();
        two_off[1] = "also".into();
        assert_eq!(ocr_weight(&base, &two_off).await, 10);

        // Four replaced: 8 of 20 = 40%.
        let mut four_off = base.clone();
        for (i, word) in four_off.iter_mut().enumerate().take(4) {
            *word = format!("other{i}");
        }
        assert_eq!(ocr_weight(&base, &four_off).await, 5);

        let disjoint: Vec<String> = (0..20).map(|i| format!("else{i}")).collect();
        assert_eq!(ocr_weight(&base, &disjoint).await, 0);

        // Two empty texts share nothing worth scoring.
        assert_eq!(ocr_weight(&[], &[]).await, 0);
    }

    async fn flip_weight(flips: usize) -> u32 {
        // 50x50 fingerprint: 2500 compared pixels.
        let a = Identity::Perceptual(perceptual(0, flat_fingerprint(50, 100)));
        let b = Identity::Perceptual(perceptual(3, flipped_fingerprint(50, 100, flips)));
        a.merge_weight(&b).await
    }

    #[tokio::test]
    async fn perceptual_weight_buckets() {
        assert_eq!(flip_weight(0).await, 100);
        assert_eq!(flip_weight(5).await, 100); // 0.2%
        assert_eq!(flip_weight(10).await, 100); // 0.4%
        assert_eq!(flip_weight(20).await, 70); // 0.8%
        assert_eq!(flip_weight(30).await, 60); // 1.2%
        assert_eq!(flip_weight(40).await, 50); // 1.6%
        assert_eq!(flip_weight(41).await, 0);
    }

    #[tokio::test]
    async fn perceptual_weight_zero_past_prefilter() {
        let a = Identity::Perceptual(perceptual(0, flat_fingerprint(8, 100)));
        let b = Identity::Perceptual(perceptual(
            0x1FFFFF, // hamming distance 21
            flat_fingerprint(8, 100),
        ));
        assert_eq!(a.merge_weight(&b).await, 0);
    }

    #[test]
    fn perceptual_compare_uses_lower_resolution() {
        let small = flat_fingerprint(10, 100);
        let large = flat_fingerprint(40, 100);
        let (diff, total) = pixel_difference(&small, &large);
        assert_eq!(diff, 0);
        assert_eq!(total, 100);
    }

    #[test]
    fn prefilter_keeps_near_hashes_only() {
        let instigator = Identity::Perceptual(perceptual(0, flat_fingerprint(4, 0)));
        let near = Identity::Perceptual(perceptual(0b11111, flat_fingerprint(4, 0)));
        let far = Identity::Perceptual(perceptual(0x1FFFFF, flat_fingerprint(4, 0)));

        let kept = instigator.filter_similar_clusters(vec![
            (ClusterId(1), &near),
            (ClusterId(2), &far),
        ]);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].0, ClusterId(1));
    }
}
