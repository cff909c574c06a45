//! # Cluster Registry
//!
//! Owns all clusters, arbitrates global uniqueness of strong identities,
//! applies merges, and maintains the redirect table that lets already
//! in-flight async work resolve to the correct surviving cluster.
//!
//! The registry's mutation path is synchronous and never suspends; callers
//! wrap it in a mutex and release the lock before awaiting external work,
//! which makes merges atomic with respect to the redirect table.

use crate::cluster::Cluster;
use crate::error::InvariantViolation;
use crate::identity::{Identity, IdentityKey, IdentityKind, SimilarMarkIdentity};
use crate::model::{ClusterId, ResourceHandle};
use hashbrown::HashMap;
use rustc_hash::FxHashMap;
use tracing::debug;

/// Point-in-time registry counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegistryMetrics {
    /// Currently alive clusters
    pub alive: usize,
    /// Retired cluster ids held in the redirect table
    pub retired: usize,
    /// Strong identity keys under arbitration
    pub strong_keys: usize,
}

/// Arena of alive clusters plus the redirect and arbitration tables.
///
/// Invariants:
/// - every id ever issued resolves, through at most one redirect hop, to
///   exactly one alive cluster
/// - a strong identity id is owned by at most one alive cluster at any
///   instant
/// - the tables only grow; clusters are retired, never deleted
#[derive(Debug, Default)]
pub struct ClusterRegistry {
    /// Alive clusters by id
    clusters: FxHashMap<ClusterId, Cluster>,
    /// Historical id -> surviving id, eagerly rewritten to one hop on merge
    redirects: FxHashMap<ClusterId, ClusterId>,
    /// Strong identity key -> owning cluster (global arbitration table)
    strong: HashMap<IdentityKey, ClusterId>,
    /// Next cluster id
    counter: u32,
}

impl ClusterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a new cluster seeded with one identity. Returns the id the
    /// cluster finally lives under: a strong seed that is already owned
    /// elsewhere merges the fresh cluster away immediately.
    pub fn new_cluster(
        &mut self,
        kind: &str,
        seed: Identity,
        resource: Option<ResourceHandle>,
    ) -> Result<ClusterId, InvariantViolation> {
        let id = ClusterId(self.counter);
        self.counter += 1;

        let mut cluster = Cluster::new(id, kind);
        if let Some(resource) = resource {
            cluster.attach_resource(resource)?;
        }
        self.clusters.insert(id, cluster);
        self.add_identity(id, seed)
    }

    /// Resolve any historical id to its current alive cluster id. Safe to
    /// call with ids captured arbitrarily long ago, across any number of
    /// intervening merges.
    pub fn resolve(&self, id: ClusterId) -> Result<ClusterId, InvariantViolation> {
        if self.clusters.contains_key(&id) {
            return Ok(id);
        }
        // Redirects are rewritten eagerly on every merge, so one hop is
        // always enough.
        self.redirects
            .get(&id)
            .copied()
            .ok_or(InvariantViolation::UnknownCluster(id))
    }

    /// The current alive cluster behind any historical id.
    pub fn get(&self, id: ClusterId) -> Result<&Cluster, InvariantViolation> {
        let id = self.resolve(id)?;
        self.clusters
            .get(&id)
            .ok_or(InvariantViolation::UnknownCluster(id))
    }

    /// Attach a resource payload to the cluster behind `id`. First owner
    /// wins when the item was merged into a cluster that already has one.
    pub fn attach_resource(
        &mut self,
        id: ClusterId,
        resource: ResourceHandle,
    ) -> Result<(), InvariantViolation> {
        let id = self.resolve(id)?;
        self.clusters
            .get_mut(&id)
            .ok_or(InvariantViolation::UnknownCluster(id))?
            .attach_resource(resource)
    }

    /// Insert an identity into the cluster behind `id` and run strong
    /// arbitration. Returns the id of the cluster the identity finally
    /// lives on, which differs from `id` when the insertion triggered a
    /// merge.
    ///
    /// Arbitration is first-registered-wins: the cluster that registered a
    /// strong id first is always the survivor, so a half-finished operation
    /// on the owner never sees its own cluster replaced.
    ///
    /// A singleton arriving through a historical id whose survivor already
    /// holds one of that kind is reconciled via `merge_other`, not rejected:
    /// the caller followed the redirect protocol, it just lost a race with a
    /// merge.
    pub fn add_identity(
        &mut self,
        id: ClusterId,
        identity: Identity,
    ) -> Result<ClusterId, InvariantViolation> {
        let id = self.resolve(id)?;
        let strong = identity.is_strong();
        let key = identity.key();

        self.clusters
            .get_mut(&id)
            .ok_or(InvariantViolation::UnknownCluster(id))?
            .adopt(identity)?;

        if strong {
            if let Some(&owner) = self.strong.get(&key) {
                let owner = self.resolve(owner)?;
                if owner != id {
                    debug!(%key, %owner, duplicate = %id, "strong identity collision, merging");
                    return self.merge_clusters(owner, id);
                }
            } else {
                self.strong.insert(key, id);
            }
        }
        Ok(id)
    }

    /// Fold `loser` into `winner`. No-op when both resolve to the same
    /// cluster. Similar-marks touching either side are released first; the
    /// redirect table is rewritten eagerly for the loser and everything it
    /// had previously absorbed.
    pub fn merge_clusters(
        &mut self,
        winner: ClusterId,
        loser: ClusterId,
    ) -> Result<ClusterId, InvariantViolation> {
        let winner = self.resolve(winner)?;
        let loser = self.resolve(loser)?;
        if winner == loser {
            return Ok(winner);
        }
        debug!(%winner, %loser, "merging clusters");

        self.release_marks_of(winner);
        self.release_marks_of(loser);

        let mut dead = self
            .clusters
            .remove(&loser)
            .ok_or(InvariantViolation::UnknownCluster(loser))?;
        let absorbed = dead.take_absorbed();
        let drained = dead.retire(winner);

        for (key, identity) in drained {
            if identity.is_strong() {
                if let Some(&owner) = self.strong.get(&key) {
                    if owner != loser && owner != winner {
                        return Err(InvariantViolation::StrongCollision {
                            key: key.to_string(),
                            owner,
                            winner,
                        });
                    }
                }
                self.strong.insert(key, winner);
            }
            self.clusters
                .get_mut(&winner)
                .ok_or(InvariantViolation::UnknownCluster(winner))?
                .adopt(identity)?;
        }

        for id in absorbed.iter().copied().chain([loser]) {
            self.redirects.insert(id, winner);
        }
        self.clusters
            .get_mut(&winner)
            .ok_or(InvariantViolation::UnknownCluster(winner))?
            .record_absorbed(absorbed, loser);

        Ok(winner)
    }

    /// Record a bidirectional similar-mark between two clusters. A no-op
    /// when both sides already resolve to the same cluster.
    pub fn mark_similar(
        &mut self,
        a: ClusterId,
        b: ClusterId,
        score: u32,
    ) -> Result<(), InvariantViolation> {
        let a = self.resolve(a)?;
        let b = self.resolve(b)?;
        if a == b {
            return Ok(());
        }
        self.clusters
            .get_mut(&a)
            .ok_or(InvariantViolation::UnknownCluster(a))?
            .insert(Identity::SimilarMark(SimilarMarkIdentity { other: b, score }))?;
        self.clusters
            .get_mut(&b)
            .ok_or(InvariantViolation::UnknownCluster(b))?
            .insert(Identity::SimilarMark(SimilarMarkIdentity { other: a, score }))?;
        Ok(())
    }

    /// Drop every similar-mark on `id` together with the back-references on
    /// its partners. Marks are advisory; any merge involving a marked
    /// cluster releases them.
    fn release_marks_of(&mut self, id: ClusterId) {
        let keys = match self.clusters.get(&id) {
            Some(cluster) => cluster.keys_of(IdentityKind::SimilarMark),
            None => return,
        };
        for key in keys {
            let mark = self
                .clusters
                .get_mut(&id)
                .and_then(|cluster| cluster.remove(&key));
            if let Some(Identity::SimilarMark(mark)) = mark {
                let back = IdentityKey {
                    kind: IdentityKind::SimilarMark,
                    id: format!("similar:{id}"),
                };
                if let Some(partner) = self.clusters.get_mut(&mark.other) {
                    partner.remove(&back);
                }
            }
        }
    }

    /// All alive clusters, optionally restricted to one domain category,
    /// ordered by id.
    pub fn all_clusters(&self, kind: Option<&str>) -> Vec<&Cluster> {
        let mut clusters: Vec<&Cluster> = self
            .clusters
            .values()
            .filter(|cluster| kind.map_or(true, |k| cluster.kind == k))
            .collect();
        clusters.sort_by_key(|cluster| cluster.id);
        clusters
    }

    /// All alive clusters carrying at least one identity of `kind`,
    /// ordered by id.
    pub fn clusters_with_identity(&self, kind: IdentityKind) -> Vec<&Cluster> {
        let mut clusters: Vec<&Cluster> = self
            .clusters
            .values()
            .filter(|cluster| cluster.contains_kind(kind))
            .collect();
        clusters.sort_by_key(|cluster| cluster.id);
        clusters
    }

    pub fn metrics(&self) -> RegistryMetrics {
        RegistryMetrics {
            alive: self.clusters.len(),
            retired: self.redirects.len(),
            strong_keys: self.strong.len(),
        }
    }
}
