//! # Similarity Engine
//!
//! Pairwise weighted scoring between clusters using soft identities. After
//! a batch of newly created clusters finishes identification, every newly
//! added instigator identity is compared against the live population; the
//! full score decides between merging, marking as similar, or nothing.

use crate::config::Tuning;
use crate::error::InvariantViolation;
use crate::identity::{Identity, IdentityKey, IdentityKind};
use crate::model::ClusterId;
use crate::registry::ClusterRegistry;
use crate::runner::TaskRunner;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

/// Collaborator kinds, in scoring order.
const COLLABORATOR_KINDS: [IdentityKind; 3] = [
    IdentityKind::Perceptual,
    IdentityKind::ColorPalette,
    IdentityKind::OcrText,
];

/// What a pairwise score led to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Score reached the merge threshold; the candidate was folded into
    /// the instigating cluster.
    Merge,
    /// Score reached the similar threshold only; both clusters were marked.
    Similar,
    /// Score below both thresholds; no relationship recorded.
    Unrelated,
}

/// One scored pair and the decision applied for it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimilarityOutcome {
    pub instigator: ClusterId,
    pub candidate: ClusterId,
    pub score: u32,
    pub decision: Decision,
}

/// Weighted scoring and the 80/40 decision policy.
#[derive(Debug, Clone)]
pub struct SimilarityEngine {
    tuning: Tuning,
}

impl SimilarityEngine {
    pub fn new(tuning: Tuning) -> Self {
        Self { tuning }
    }

    /// Decision policy, evaluated after the full score is known.
    pub fn decide(&self, score: u32) -> Decision {
        if score >= self.tuning.merge_threshold {
            Decision::Merge
        } else if score >= self.tuning.similar_threshold {
            Decision::Similar
        } else {
            Decision::Unrelated
        }
    }

    /// Compare every instigator identity added during a batch against all
    /// other live clusters of the same identity kind and apply the
    /// decisions. The candidate is always folded into the instigating
    /// cluster, never the reverse, so a half-finished comparison loop never
    /// operates on a now-dead instigator.
    pub async fn run_batch(
        &self,
        registry: &Arc<Mutex<ClusterRegistry>>,
        runner: &TaskRunner,
        instigators: Vec<(ClusterId, IdentityKey)>,
    ) -> Result<Vec<SimilarityOutcome>, InvariantViolation> {
        let mut outcomes = Vec::new();

        for (cluster_id, key) in instigators {
            if runner.is_stopped() {
                break;
            }

            // Snapshot the instigator and its candidate pairs under the
            // lock; scoring runs without it.
            let snapshot = {
                let registry = registry.lock();
                self.snapshot_candidates(&registry, cluster_id, &key)?
            };
            let Some((home, pairs)) = snapshot else {
                continue;
            };
            if pairs.is_empty() {
                continue;
            }

            let scores = runner
                .run_all(pairs.into_iter().map(|(candidate, shared)| async move {
                    let mut score = 0u32;
                    for (mine, theirs) in &shared {
                        score += mine.merge_weight(theirs).await;
                    }
                    (candidate, score)
                }))
                .await;

            // Apply decisions in candidate-id order for determinism.
            let mut scores = scores;
            scores.sort_by_key(|(candidate, _)| *candidate);

            let mut registry = registry.lock();
            for (candidate, score) in scores {
                let candidate_now = registry.resolve(candidate)?;
                let home_now = registry.resolve(home)?;
                if candidate_now == home_now {
                    continue; // already folded together by an earlier pair
                }
                let decision = self.decide(score);
                debug!(instigator = %home_now, %candidate, score, ?decision, "similarity decision");
                match decision {
                    Decision::Merge => {
                        registry.merge_clusters(home_now, candidate_now)?;
                    }
                    Decision::Similar => {
                        registry.mark_similar(home_now, candidate_now, score)?;
                    }
                    Decision::Unrelated => {}
                }
                outcomes.push(SimilarityOutcome {
                    instigator: home_now,
                    candidate,
                    score,
                    decision,
                });
            }
        }
        Ok(outcomes)
    }

    /// Gather the instigator's cluster and, per surviving candidate, the
    /// owned collaborator identity pairs shared by both clusters.
    #[allow(clippy::type_complexity)]
    fn snapshot_candidates(
        &self,
        registry: &ClusterRegistry,
        cluster_id: ClusterId,
        key: &IdentityKey,
    ) -> Result<Option<(ClusterId, Vec<(ClusterId, Vec<(Identity, Identity)>)>)>, InvariantViolation>
    {
        let home = registry.resolve(cluster_id)?;
        let cluster = registry.get(home)?;

        // The instigator may have been reconciled away if its cluster was
        // merged mid-batch; the surviving singleton of the kind stands in.
        let Some(instigator) = cluster.get(key).or_else(|| cluster.singleton_of(key.kind))
        else {
            return Ok(None);
        };

        let candidates: Vec<(ClusterId, &Identity)> = registry
            .clusters_with_identity(key.kind)
            .into_iter()
            .filter(|candidate| candidate.id != home)
            .filter_map(|candidate| {
                candidate
                    .singleton_of(key.kind)
                    .map(|identity| (candidate.id, identity))
            })
            .collect();
        let surviving =
            instigator.filter_similar_clusters_with(candidates, self.tuning.hamming_prefilter);

        let pairs = surviving
            .into_iter()
            .map(|(candidate_id, _)| {
                let candidate = registry.get(candidate_id)?;
                let shared: Vec<(Identity, Identity)> = COLLABORATOR_KINDS
                    .iter()
                    .filter_map(|&kind| {
                        match (cluster.singleton_of(kind), candidate.singleton_of(kind)) {
                            (Some(mine), Some(theirs)) => Some((mine.clone(), theirs.clone())),
                            _ => None,
                        }
                    })
                    .collect();
                Ok((candidate_id, shared))
            })
            .collect::<Result<Vec<_>, InvariantViolation>>()?;

        Ok(Some((home, pairs)))
    }
}
