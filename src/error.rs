//! # Error Taxonomy
//!
//! Splits failures into the two classes the engine treats differently:
//! transient acquisition failures (recovered via the post-error phase) and
//! invariant violations (fatal, never retried — they mean the redirect or
//! arbitration protocol was bypassed).

use crate::identity::IdentityKind;
use crate::model::ClusterId;
use thiserror::Error;

/// Fatal programming-error invariant violations.
///
/// These are never swallowed or retried: silently continuing would silently
/// corrupt the dedup result.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvariantViolation {
    /// A mutation was attempted against a retired cluster.
    #[error("operation on dead cluster {0}: redirect protocol bypassed")]
    DeadCluster(ClusterId),

    /// A second singleton identity of an already-present kind was inserted.
    #[error("duplicate singleton identity {kind} on cluster {cluster}")]
    DuplicateSingleton {
        kind: IdentityKind,
        cluster: ClusterId,
    },

    /// A strong-identity collision survived into absorb. Strong identities
    /// are unique by construction, so arbitration must have been bypassed.
    #[error("strong identity {key} owned by {owner} collided while absorbing into {winner}")]
    StrongCollision {
        key: String,
        owner: ClusterId,
        winner: ClusterId,
    },

    /// A cluster id that was never issued by this registry.
    #[error("unknown cluster id {0}")]
    UnknownCluster(ClusterId),
}

/// Transient resource acquisition failure. Recovered locally by routing the
/// item through the post-error phase; never fatal.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AcquireError {
    #[error("fetch failed for {locator}: {reason}")]
    Fetch { locator: String, reason: String },

    #[error("decode failed for {locator}: {reason}")]
    Decode { locator: String, reason: String },
}

impl AcquireError {
    pub fn locator(&self) -> &str {
        match self {
            Self::Fetch { locator, .. } | Self::Decode { locator, .. } => locator,
        }
    }
}
