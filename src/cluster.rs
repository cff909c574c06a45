//! # Cluster Entity
//!
//! A mutable bag of identities representing one candidate real-world entity,
//! plus the externally-owned resource payload. All mutation is funneled
//! through the registry; a retired cluster holds zero identities and rejects
//! every further mutation.

use crate::error::InvariantViolation;
use crate::identity::{Identity, IdentityKey, IdentityKind};
use crate::model::{ClusterId, ResourceHandle};
use hashbrown::HashMap;

/// Result of inserting one identity into a cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Inserted {
    /// The identity was new to this cluster.
    Fresh,
    /// An instance with the same key already existed and was reconciled
    /// via `merge_other`.
    Reconciled,
}

/// A candidate real-world entity.
#[derive(Debug, Clone)]
pub struct Cluster {
    pub id: ClusterId,
    /// Domain category (e.g. "image")
    pub kind: String,
    identities: HashMap<IdentityKey, Identity>,
    by_kind: HashMap<IdentityKind, Vec<IdentityKey>>,
    resource: Option<ResourceHandle>,
    /// Set exactly once, when this cluster is folded into a survivor;
    /// permanently dead afterwards.
    replaced_by: Option<ClusterId>,
    /// Transitive list of cluster ids folded into this one.
    absorbed: Vec<ClusterId>,
}

impl Cluster {
    pub(crate) fn new(id: ClusterId, kind: impl Into<String>) -> Self {
        Self {
            id,
            kind: kind.into(),
            identities: HashMap::new(),
            by_kind: HashMap::new(),
            resource: None,
            replaced_by: None,
            absorbed: Vec::new(),
        }
    }

    pub fn is_alive(&self) -> bool {
        self.replaced_by.is_none()
    }

    pub fn replaced_by(&self) -> Option<ClusterId> {
        self.replaced_by
    }

    pub fn absorbed_ids(&self) -> &[ClusterId] {
        &self.absorbed
    }

    pub fn resource(&self) -> Option<&ResourceHandle> {
        self.resource.as_ref()
    }

    /// Attach the resource payload. The first owner wins; a payload arriving
    /// after a merge already supplied one is dropped.
    pub(crate) fn attach_resource(
        &mut self,
        resource: ResourceHandle,
    ) -> Result<(), InvariantViolation> {
        if !self.is_alive() {
            return Err(InvariantViolation::DeadCluster(self.id));
        }
        if self.resource.is_none() {
            self.resource = Some(resource);
        }
        Ok(())
    }

    /// Insert an identity, enforcing the singleton invariant. Inserting a
    /// second singleton of an already-present kind under a different key is
    /// a fatal programming error; the same key reconciles idempotently.
    pub(crate) fn insert(&mut self, identity: Identity) -> Result<Inserted, InvariantViolation> {
        if !self.is_alive() {
            return Err(InvariantViolation::DeadCluster(self.id));
        }
        let key = identity.key();

        if let Some(existing) = self.identities.get_mut(&key) {
            existing.merge_other(&identity);
            return Ok(Inserted::Reconciled);
        }

        if identity.is_singleton() {
            if let Some(keys) = self.by_kind.get(&key.kind) {
                if !keys.is_empty() {
                    return Err(InvariantViolation::DuplicateSingleton {
                        kind: key.kind,
                        cluster: self.id,
                    });
                }
            }
        }

        self.by_kind.entry(key.kind).or_default().push(key.clone());
        self.identities.insert(key, identity);
        Ok(Inserted::Fresh)
    }

    /// Reconcile an identity arriving from an absorbed cluster. Singletons
    /// fold into the local instance when one exists; everything else is
    /// adopted (or reconciled when the key is already present).
    pub(crate) fn adopt(&mut self, identity: Identity) -> Result<Inserted, InvariantViolation> {
        if !self.is_alive() {
            return Err(InvariantViolation::DeadCluster(self.id));
        }
        if identity.is_singleton() {
            if let Some(local) = self.singleton_of_mut(identity.kind()) {
                local.merge_other(&identity);
                return Ok(Inserted::Reconciled);
            }
        }
        self.insert(identity)
    }

    /// Retire this cluster: clear identities, release the resource handle,
    /// and record the survivor. Further mutation is rejected.
    pub(crate) fn retire(&mut self, survivor: ClusterId) -> Vec<(IdentityKey, Identity)> {
        let drained = self.identities.drain().collect();
        self.by_kind.clear();
        self.resource = None;
        self.replaced_by = Some(survivor);
        drained
    }

    pub(crate) fn take_absorbed(&mut self) -> Vec<ClusterId> {
        std::mem::take(&mut self.absorbed)
    }

    pub(crate) fn record_absorbed(&mut self, mut ids: Vec<ClusterId>, direct: ClusterId) {
        self.absorbed.append(&mut ids);
        self.absorbed.push(direct);
    }

    pub(crate) fn remove(&mut self, key: &IdentityKey) -> Option<Identity> {
        let removed = self.identities.remove(key);
        if removed.is_some() {
            if let Some(keys) = self.by_kind.get_mut(&key.kind) {
                keys.retain(|k| k != key);
            }
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.identities.is_empty()
    }

    pub fn get(&self, key: &IdentityKey) -> Option<&Identity> {
        self.identities.get(key)
    }

    pub fn contains_kind(&self, kind: IdentityKind) -> bool {
        self.by_kind
            .get(&kind)
            .map(|keys| !keys.is_empty())
            .unwrap_or(false)
    }

    /// All identities of one kind.
    pub fn identities_of(&self, kind: IdentityKind) -> Vec<&Identity> {
        self.by_kind
            .get(&kind)
            .into_iter()
            .flatten()
            .filter_map(|key| self.identities.get(key))
            .collect()
    }

    /// The single instance of a singleton kind, if present.
    pub fn singleton_of(&self, kind: IdentityKind) -> Option<&Identity> {
        self.by_kind
            .get(&kind)
            .and_then(|keys| keys.first())
            .and_then(|key| self.identities.get(key))
    }

    fn singleton_of_mut(&mut self, kind: IdentityKind) -> Option<&mut Identity> {
        let key = self.by_kind.get(&kind)?.first()?.clone();
        self.identities.get_mut(&key)
    }

    pub fn keys_of(&self, kind: IdentityKind) -> Vec<IdentityKey> {
        self.by_kind.get(&kind).cloned().unwrap_or_default()
    }

    /// Flattened values of one property across all page-occurrence
    /// identities (the analytics surface for the reporting collaborator).
    pub fn occurrence_values(&self, property: &str) -> Vec<String> {
        let mut values: Vec<String> = self
            .identities_of(IdentityKind::PageOccurrence)
            .into_iter()
            .filter_map(|identity| match identity {
                Identity::PageOccurrence(occ) => occ.properties.get(property).cloned(),
                _ => None,
            })
            .collect();
        values.sort();
        values
    }
}
