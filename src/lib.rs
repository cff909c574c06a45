//! # Imgmaster
//!
//! An incremental entity-resolution and clustering engine for items
//! (images discovered by a crawler) that may be the same logical entity
//! even though they arrive as independent observations.
//!
//! The engine gives deterministic, race-free dedup results while identities
//! are computed asynchronously and out of order: clusters can be merged
//! mid-flight and in-flight work always resolves to the surviving cluster
//! through the registry's redirect table.

pub mod analysis;
pub mod cache;
pub mod cluster;
pub mod config;
pub mod error;
pub mod identity;
pub mod model;
pub mod provider;
pub mod registry;
pub mod runner;
pub mod similarity;

// Re-export main types for convenience
pub use analysis::{Analyzers, OcrOutcome, PerceptualFingerprint, Sha256ContentHasher};
pub use cache::{AnalysisCache, MemoryCache};
pub use cluster::Cluster;
pub use config::{EngineConfig, Tuning};
pub use error::{AcquireError, InvariantViolation};
pub use identity::{Identity, IdentityKey, IdentityKind};
pub use model::{ClusterId, FetchedResource, ItemDescriptor, PageContext, PixelBuffer, Rgb};
pub use provider::{IdentityProvider, Phase, ProviderSet};
pub use registry::{ClusterRegistry, RegistryMetrics};
pub use runner::TaskRunner;
pub use similarity::{Decision, SimilarityEngine, SimilarityOutcome};

use crate::error::AcquireError as Acquire;
use crate::model::ResourceHandle;
use crate::provider::{ItemRun, ProviderDeps, Scratch};
use anyhow::Result;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::task::JoinSet;
use tracing::{debug, warn};

/// Where one ingested observation ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestOutcome {
    pub locator: String,
    pub cluster: ClusterId,
}

/// Main API for image entity mastering.
pub struct ImgMaster {
    registry: Arc<Mutex<ClusterRegistry>>,
    providers: Arc<ProviderSet>,
    deps: Arc<ProviderDeps>,
    scratch: Arc<Scratch>,
    runner: TaskRunner,
    similarity: SimilarityEngine,
    config: EngineConfig,
    seq: AtomicU64,
}

impl ImgMaster {
    /// Create an engine with the built-in provider lineup.
    pub fn new(analyzers: Analyzers, cache: Arc<dyn AnalysisCache>, config: EngineConfig) -> Self {
        Self::with_providers(analyzers, cache, config, ProviderSet::standard())
    }

    /// Create an engine with a custom provider registration.
    pub fn with_providers(
        analyzers: Analyzers,
        cache: Arc<dyn AnalysisCache>,
        config: EngineConfig,
        providers: ProviderSet,
    ) -> Self {
        Self {
            registry: Arc::new(Mutex::new(ClusterRegistry::new())),
            providers: Arc::new(providers),
            deps: Arc::new(ProviderDeps { analyzers, cache }),
            scratch: Arc::new(Scratch::new()),
            runner: TaskRunner::new(config.tuning.max_in_flight),
            similarity: SimilarityEngine::new(config.tuning),
            config,
            seq: AtomicU64::new(0),
        }
    }

    /// Request a drain: in-flight work completes and is merged, nothing new
    /// starts.
    pub fn stop(&self) {
        self.runner.stop();
    }

    /// Ingest a batch of item observations: create a cluster per item, run
    /// the identification phases, then run the similarity pass over the
    /// batch's newly added instigator identities.
    ///
    /// Outcomes are returned in input order. Invariant violations abort the
    /// batch; transient acquisition failures do not.
    pub async fn ingest(&self, items: Vec<ItemDescriptor>) -> Result<Vec<IngestOutcome>> {
        let mut set = JoinSet::new();
        for (index, item) in items.into_iter().enumerate() {
            if self.runner.is_stopped() {
                break;
            }
            let seq = self.seq.fetch_add(1, Ordering::SeqCst);
            let worker = ItemWorker {
                registry: Arc::clone(&self.registry),
                providers: Arc::clone(&self.providers),
                deps: Arc::clone(&self.deps),
                scratch: Arc::clone(&self.scratch),
                runner: self.runner.clone(),
                kind: self.config.cluster_kind.clone(),
            };
            set.spawn(async move {
                let locator = item.locator.clone();
                let identified = worker.identify(item, seq).await;
                identified.map(|(cluster, instigators)| (index, locator, cluster, instigators))
            });
        }

        let mut indexed = Vec::new();
        let mut instigators = Vec::new();
        while let Some(joined) = set.join_next().await {
            let (index, locator, cluster, mut added) = joined??;
            indexed.push((index, IngestOutcome { locator, cluster }));
            instigators.append(&mut added);
        }

        // Deterministic similarity order regardless of completion order.
        instigators.sort_by(|(a, ka), (b, kb)| (a, &ka.id).cmp(&(b, &kb.id)));
        self.similarity
            .run_batch(&self.registry, &self.runner, instigators)
            .await?;

        indexed.sort_by_key(|(index, _)| *index);
        let registry = self.registry.lock();
        indexed
            .into_iter()
            .map(|(_, outcome)| {
                // Report the final survivor: the cluster may have been
                // merged away during the similarity pass.
                let cluster = registry.resolve(outcome.cluster)?;
                Ok(IngestOutcome { cluster, ..outcome })
            })
            .collect()
    }

    /// Resolve any historical cluster id to its current alive id.
    pub fn resolve(&self, id: ClusterId) -> Result<ClusterId> {
        Ok(self.registry.lock().resolve(id)?)
    }

    /// Snapshot of the cluster behind any historical id.
    pub fn cluster(&self, id: ClusterId) -> Result<Cluster> {
        Ok(self.registry.lock().get(id)?.clone())
    }

    /// Snapshots of all alive clusters, optionally restricted to one
    /// domain category.
    pub fn all_clusters(&self, kind: Option<&str>) -> Vec<Cluster> {
        self.registry
            .lock()
            .all_clusters(kind)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Snapshots of all alive clusters carrying an identity of `kind`.
    pub fn clusters_with_identity(&self, kind: IdentityKind) -> Vec<Cluster> {
        self.registry
            .lock()
            .clusters_with_identity(kind)
            .into_iter()
            .cloned()
            .collect()
    }

    /// Flattened per-occurrence property values for one cluster.
    pub fn occurrence_values(&self, id: ClusterId, property: &str) -> Result<Vec<String>> {
        Ok(self.registry.lock().get(id)?.occurrence_values(property))
    }

    pub fn metrics(&self) -> RegistryMetrics {
        self.registry.lock().metrics()
    }
}

/// Owned context for one item's identification, movable into a task.
struct ItemWorker {
    registry: Arc<Mutex<ClusterRegistry>>,
    providers: Arc<ProviderSet>,
    deps: Arc<ProviderDeps>,
    scratch: Arc<Scratch>,
    runner: TaskRunner,
    kind: String,
}

impl ItemWorker {
    /// Drive one item through the four identification phases. Returns the
    /// id of the cluster the item finally lives on plus the instigator
    /// identities added along the way.
    async fn identify(
        &self,
        item: ItemDescriptor,
        seq: u64,
    ) -> Result<(ClusterId, Vec<(ClusterId, IdentityKey)>), InvariantViolation> {
        let mut ctx = ItemRun::new(item, seq);
        let mut instigators = Vec::new();

        let mut current = self
            .registry
            .lock()
            .new_cluster(&self.kind, Identity::SequenceOrder(seq), None)?;

        let identities = self.run_phase(Phase::Preflight, &ctx).await;
        current = self.add_all(current, identities, &mut instigators)?;

        // Preflight resolved this item onto an already-identified cluster:
        // skip the expensive fetch/decode work.
        if self
            .registry
            .lock()
            .get(current)?
            .contains_kind(IdentityKind::ContentHash)
        {
            debug!(cluster = %current, locator = %ctx.item.locator, "duplicate known after preflight, skipping acquisition");
            return Ok((current, instigators));
        }

        let fetched = self
            .runner
            .run_one(self.deps.analyzers.fetcher.fetch(&ctx.item.locator))
            .await;
        match fetched {
            Ok(resource) => {
                let resource = Arc::new(resource);
                ctx.resource = Some(Arc::clone(&resource));
                self.registry
                    .lock()
                    .attach_resource(current, ResourceHandle((*resource).clone()))?;

                let identities = self.run_phase(Phase::Postflight, &ctx).await;
                current = self.add_all(current, identities, &mut instigators)?;

                let decoded = self
                    .runner
                    .run_one(self.deps.analyzers.decoder.decode(&resource))
                    .await;
                match decoded {
                    Ok(pixels) => {
                        ctx.pixels = Some(Arc::new(pixels));
                        let identities = self.run_phase(Phase::PostflightDecoded, &ctx).await;
                        current = self.add_all(current, identities, &mut instigators)?;
                    }
                    Err(err) => {
                        current = self.acquisition_failed(current, &mut ctx, err, &mut instigators).await?;
                    }
                }
            }
            Err(err) => {
                current = self.acquisition_failed(current, &mut ctx, err, &mut instigators).await?;
            }
        }

        let current = self.registry.lock().resolve(current)?;
        Ok((current, instigators))
    }

    /// Route a transient acquisition failure through the post-error phase
    /// so the item still receives a degraded identity and stays visible.
    async fn acquisition_failed(
        &self,
        current: ClusterId,
        ctx: &mut ItemRun,
        err: Acquire,
        instigators: &mut Vec<(ClusterId, IdentityKey)>,
    ) -> Result<ClusterId, InvariantViolation> {
        warn!(locator = err.locator(), error = %err, "resource acquisition failed");
        ctx.error = Some(err);
        let identities = self.run_phase(Phase::PostError, ctx).await;
        self.add_all(current, identities, instigators)
    }

    async fn run_phase(&self, phase: Phase, ctx: &ItemRun) -> Vec<Identity> {
        let ctx = Arc::new(ctx.clone());
        self.providers
            .run_phase(phase, &ctx, &self.deps, &self.scratch, &self.runner)
            .await
    }

    /// Add identities through the registry, tracking where the cluster
    /// lands after strong arbitration and which instigators arrived.
    fn add_all(
        &self,
        mut current: ClusterId,
        identities: Vec<Identity>,
        instigators: &mut Vec<(ClusterId, IdentityKey)>,
    ) -> Result<ClusterId, InvariantViolation> {
        let mut registry = self.registry.lock();
        for identity in identities {
            let is_instigator = identity.is_similarity_instigator();
            let key = identity.key();
            current = registry.add_identity(current, identity)?;
            if is_instigator {
                instigators.push((current, key));
            }
        }
        Ok(current)
    }
}
