//! # Identity Providers
//!
//! Each identity variant registers for zero or more of four ordered
//! lifecycle phases, run once per item. Within a phase all interested
//! providers run concurrently through the shared bounded runner; a provider
//! failure after preflight is isolated and logged, and the item proceeds
//! with whatever identities succeeded.

use crate::analysis::Analyzers;
use crate::cache::{memoized, AnalysisCache};
use crate::error::AcquireError;
use crate::identity::{
    Identity, IdentityKind, OcrTextIdentity, PageOccurrenceIdentity, PerceptualIdentity,
};
use crate::model::{FetchedResource, ItemDescriptor, PixelBuffer};
use crate::runner::TaskRunner;
use async_trait::async_trait;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::sync::Arc;
use tracing::warn;

/// The four ordered identification phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    /// Before any resource fetch; establishes cheap/strong identity so
    /// later expensive work can be skipped for known duplicates.
    Preflight,
    /// Raw resource available, no decoded pixels yet.
    Postflight,
    /// Decoded pixel buffer available.
    PostflightDecoded,
    /// Resource acquisition or decoding failed; attaches a minimal
    /// degraded identity so the item stays visible.
    PostError,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Preflight => "preflight",
            Self::Postflight => "postflight",
            Self::PostflightDecoded => "postflight-decoded",
            Self::PostError => "post-error",
        };
        f.write_str(name)
    }
}

/// Per-item state threaded through the phases. The driver fills in the
/// resource/pixels/error fields as acquisition progresses.
#[derive(Debug, Clone)]
pub struct ItemRun {
    pub item: ItemDescriptor,
    /// Engine-wide monotonic sequence number of this observation
    pub seq: u64,
    pub resource: Option<Arc<FetchedResource>>,
    pub pixels: Option<Arc<PixelBuffer>>,
    pub error: Option<AcquireError>,
}

impl ItemRun {
    pub fn new(item: ItemDescriptor, seq: u64) -> Self {
        Self {
            item,
            seq,
            resource: None,
            pixels: None,
            error: None,
        }
    }
}

/// Collaborators available to every provider.
pub struct ProviderDeps {
    pub analyzers: Analyzers,
    pub cache: Arc<dyn AnalysisCache>,
}

/// Run-wide shared mutable scratch, keyed by identity kind. Each provider
/// must treat its own kind's slice as exclusively its own; cross-item
/// aggregates live here without polluting per-item state.
#[derive(Default)]
pub struct Scratch {
    slots: Mutex<HashMap<IdentityKind, Arc<dyn Any + Send + Sync>>>,
}

impl Scratch {
    pub fn new() -> Self {
        Self::default()
    }

    /// The scratch slice for one identity kind, created on first use.
    pub fn slot<T>(&self, kind: IdentityKind) -> Arc<Mutex<T>>
    where
        T: Default + Send + 'static,
    {
        let mut slots = self.slots.lock();
        let entry = slots
            .entry(kind)
            .or_insert_with(|| Arc::new(Mutex::new(T::default())) as Arc<dyn Any + Send + Sync>);
        Arc::clone(entry)
            .downcast::<Mutex<T>>()
            .expect("scratch slot reused with a different type")
    }
}

/// One identity variant's computation, registered for a set of phases.
#[async_trait]
pub trait IdentityProvider: Send + Sync {
    fn kind(&self) -> IdentityKind;

    fn phases(&self) -> &'static [Phase];

    async fn run(
        &self,
        phase: Phase,
        ctx: Arc<ItemRun>,
        deps: Arc<ProviderDeps>,
        scratch: Arc<Scratch>,
    ) -> anyhow::Result<Vec<Identity>>;
}

/// The registered providers, constructed once at engine start.
#[derive(Clone, Default)]
pub struct ProviderSet {
    providers: Vec<Arc<dyn IdentityProvider>>,
}

impl ProviderSet {
    /// The built-in provider lineup.
    pub fn standard() -> Self {
        Self::default()
            .with(Arc::new(UrlProvider))
            .with(Arc::new(OccurrenceProvider))
            .with(Arc::new(ContentHashProvider))
            .with(Arc::new(PerceptualProvider))
            .with(Arc::new(PaletteProvider))
            .with(Arc::new(OcrProvider))
    }

    pub fn with(mut self, provider: Arc<dyn IdentityProvider>) -> Self {
        self.providers.push(provider);
        self
    }

    /// Run every provider registered for `phase` concurrently and collect
    /// the identities that succeeded. Failures are isolated per provider.
    pub async fn run_phase(
        &self,
        phase: Phase,
        ctx: &Arc<ItemRun>,
        deps: &Arc<ProviderDeps>,
        scratch: &Arc<Scratch>,
        runner: &TaskRunner,
    ) -> Vec<Identity> {
        let tasks: Vec<_> = self
            .providers
            .iter()
            .filter(|provider| provider.phases().contains(&phase))
            .map(|provider| {
                let provider = Arc::clone(provider);
                let ctx = Arc::clone(ctx);
                let deps = Arc::clone(deps);
                let scratch = Arc::clone(scratch);
                async move {
                    let kind = provider.kind();
                    match provider.run(phase, ctx, deps, scratch).await {
                        Ok(identities) => identities,
                        Err(err) => {
                            warn!(%phase, %kind, error = %err, "identity provider failed");
                            Vec::new()
                        }
                    }
                }
            })
            .collect();

        runner.run_all(tasks).await.into_iter().flatten().collect()
    }
}

/// URL-derived strong identity. Preflight attaches raw-URL identities for
/// the locator and every pre-resolved variant; postflight refines the
/// locator identity with the cache validator from the response.
pub struct UrlProvider;

#[async_trait]
impl IdentityProvider for UrlProvider {
    fn kind(&self) -> IdentityKind {
        IdentityKind::Url
    }

    fn phases(&self) -> &'static [Phase] {
        &[Phase::Preflight, Phase::Postflight]
    }

    async fn run(
        &self,
        phase: Phase,
        ctx: Arc<ItemRun>,
        _deps: Arc<ProviderDeps>,
        _scratch: Arc<Scratch>,
    ) -> anyhow::Result<Vec<Identity>> {
        match phase {
            Phase::Preflight => {
                let mut identities = vec![Identity::url(ctx.item.locator.clone(), None)];
                for variant in &ctx.item.variants {
                    identities.push(Identity::url(variant.clone(), None));
                }
                Ok(identities)
            }
            Phase::Postflight => {
                let Some(resource) = &ctx.resource else {
                    return Ok(Vec::new());
                };
                match resource.validator() {
                    Some(validator) => Ok(vec![Identity::url(
                        ctx.item.locator.clone(),
                        Some(validator),
                    )]),
                    None => Ok(Vec::new()),
                }
            }
            _ => Ok(Vec::new()),
        }
    }
}

/// Scratch slice of the occurrence provider: per-(origin, url) instance
/// tallies plus the instance assigned to each observation, so the
/// post-error phase reproduces the same occurrence id preflight issued.
#[derive(Default)]
pub struct OccurrenceScratch {
    tallies: HashMap<(String, String), u32>,
    assigned: HashMap<u64, u32>,
}

/// Page-occurrence identity: unique per site+instance+URL, carrying the
/// per-occurrence analytics properties. The post-error phase re-attaches it
/// with a degraded flag so failed items stay visible.
pub struct OccurrenceProvider;

impl OccurrenceProvider {
    fn build(ctx: &ItemRun, instance: u32, degraded: Option<&AcquireError>) -> Identity {
        let page = &ctx.item.page;
        let mut properties = std::collections::HashMap::new();
        if let Some(alt) = &page.alt {
            properties.insert("alt".to_string(), alt.clone());
        }
        if let Some(width) = page.width {
            properties.insert("width".to_string(), width.to_string());
        }
        if let Some(height) = page.height {
            properties.insert("height".to_string(), height.to_string());
        }
        if let Some(error) = degraded {
            properties.insert("degraded".to_string(), error.to_string());
        }
        Identity::PageOccurrence(PageOccurrenceIdentity {
            origin: page.origin.clone(),
            url: ctx.item.locator.clone(),
            instance,
            properties,
        })
    }

    fn instance_for(ctx: &ItemRun, scratch: &Scratch) -> u32 {
        let slot = scratch.slot::<OccurrenceScratch>(IdentityKind::PageOccurrence);
        let mut state = slot.lock();
        if let Some(&assigned) = state.assigned.get(&ctx.seq) {
            return assigned;
        }
        let instance = if ctx.item.page.instance != 0 {
            ctx.item.page.instance
        } else {
            let tally = state
                .tallies
                .entry((ctx.item.page.origin.clone(), ctx.item.locator.clone()))
                .or_insert(0);
            *tally += 1;
            *tally
        };
        state.assigned.insert(ctx.seq, instance);
        instance
    }
}

#[async_trait]
impl IdentityProvider for OccurrenceProvider {
    fn kind(&self) -> IdentityKind {
        IdentityKind::PageOccurrence
    }

    fn phases(&self) -> &'static [Phase] {
        &[Phase::Preflight, Phase::PostError]
    }

    async fn run(
        &self,
        phase: Phase,
        ctx: Arc<ItemRun>,
        _deps: Arc<ProviderDeps>,
        scratch: Arc<Scratch>,
    ) -> anyhow::Result<Vec<Identity>> {
        let instance = Self::instance_for(&ctx, &scratch);
        let identity = match phase {
            Phase::Preflight => Self::build(&ctx, instance, None),
            Phase::PostError => Self::build(&ctx, instance, ctx.error.as_ref()),
            _ => return Ok(Vec::new()),
        };
        Ok(vec![identity])
    }
}

/// Cryptographic content hash of the decoded pixel buffer.
pub struct ContentHashProvider;

#[async_trait]
impl IdentityProvider for ContentHashProvider {
    fn kind(&self) -> IdentityKind {
        IdentityKind::ContentHash
    }

    fn phases(&self) -> &'static [Phase] {
        &[Phase::PostflightDecoded]
    }

    async fn run(
        &self,
        _phase: Phase,
        ctx: Arc<ItemRun>,
        deps: Arc<ProviderDeps>,
        _scratch: Arc<Scratch>,
    ) -> anyhow::Result<Vec<Identity>> {
        let Some(pixels) = &ctx.pixels else {
            return Ok(Vec::new());
        };
        let digest = deps.analyzers.content.digest(pixels);
        Ok(vec![Identity::content_hash(digest)])
    }
}

/// Perceptual fingerprint, memoized by content digest.
pub struct PerceptualProvider;

#[async_trait]
impl IdentityProvider for PerceptualProvider {
    fn kind(&self) -> IdentityKind {
        IdentityKind::Perceptual
    }

    fn phases(&self) -> &'static [Phase] {
        &[Phase::PostflightDecoded]
    }

    async fn run(
        &self,
        _phase: Phase,
        ctx: Arc<ItemRun>,
        deps: Arc<ProviderDeps>,
        _scratch: Arc<Scratch>,
    ) -> anyhow::Result<Vec<Identity>> {
        let Some(pixels) = &ctx.pixels else {
            return Ok(Vec::new());
        };
        let digest = deps.analyzers.content.digest(pixels);
        let fingerprint = memoized(deps.cache.as_ref(), &digest, "perceptual", 1, || async {
            deps.analyzers.perceptual.fingerprint(pixels).await
        })
        .await?;
        Ok(vec![Identity::Perceptual(PerceptualIdentity {
            hash: fingerprint.hash,
            fine: Arc::new(fingerprint.fine),
        })])
    }
}

/// Ranked top-color palette, memoized by content digest.
pub struct PaletteProvider;

#[async_trait]
impl IdentityProvider for PaletteProvider {
    fn kind(&self) -> IdentityKind {
        IdentityKind::ColorPalette
    }

    fn phases(&self) -> &'static [Phase] {
        &[Phase::PostflightDecoded]
    }

    async fn run(
        &self,
        _phase: Phase,
        ctx: Arc<ItemRun>,
        deps: Arc<ProviderDeps>,
        _scratch: Arc<Scratch>,
    ) -> anyhow::Result<Vec<Identity>> {
        let Some(pixels) = &ctx.pixels else {
            return Ok(Vec::new());
        };
        let digest = deps.analyzers.content.digest(pixels);
        let colors = memoized(deps.cache.as_ref(), &digest, "palette", 1, || async {
            deps.analyzers.palette.palette(pixels).await
        })
        .await?;
        if colors.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Identity::ColorPalette(
            crate::identity::ColorPaletteIdentity { colors },
        )])
    }
}

/// Run-local OCR sub-pool keyed by content digest, so repeated content in
/// one run never reaches the OCR engine twice even on a cold cache.
type OcrPool = HashMap<String, crate::analysis::OcrOutcome>;

/// Recognized text, pooled per run and memoized by content digest.
pub struct OcrProvider;

#[async_trait]
impl IdentityProvider for OcrProvider {
    fn kind(&self) -> IdentityKind {
        IdentityKind::OcrText
    }

    fn phases(&self) -> &'static [Phase] {
        &[Phase::PostflightDecoded]
    }

    async fn run(
        &self,
        _phase: Phase,
        ctx: Arc<ItemRun>,
        deps: Arc<ProviderDeps>,
        scratch: Arc<Scratch>,
    ) -> anyhow::Result<Vec<Identity>> {
        let Some(pixels) = &ctx.pixels else {
            return Ok(Vec::new());
        };
        let digest = deps.analyzers.content.digest(pixels);

        let pool = scratch.slot::<OcrPool>(IdentityKind::OcrText);
        let pooled = pool.lock().get(&digest).cloned();
        let outcome = match pooled {
            Some(outcome) => outcome,
            None => {
                let outcome = memoized(deps.cache.as_ref(), &digest, "ocr", 1, || async {
                    deps.analyzers.ocr.recognize(pixels).await
                })
                .await?;
                pool.lock().insert(digest, outcome.clone());
                outcome
            }
        };

        if outcome.words.is_empty() {
            return Ok(Vec::new());
        }
        Ok(vec![Identity::OcrText(OcrTextIdentity {
            words: outcome.words,
            confidence: outcome.confidence,
        })])
    }
}
