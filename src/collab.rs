//! Collaborator interfaces (§6): contracts the CORE consumes without owning
//! an implementation. The signal/indicator pipeline, the ML model, and the
//! scanning heuristics themselves are explicitly out of scope (§1); this
//! module defines only the trait boundary and a deterministic stub used by
//! tests and a `--dry-run` startup.

use crate::types::{IndicatorSnapshot, Opportunity};

/// Produces trade candidates; backed by the out-of-scope scanning
/// heuristics in a full deployment.
pub trait SignalSource: Send + Sync {
    fn scan(&self) -> Vec<Opportunity>;
}

/// Supplies the concrete indicator fields a Position's exit rules consume
/// (§9 "broad indicators dict" redesign — no opaque maps).
pub trait IndicatorProvider: Send + Sync {
    fn latest(&self, symbol: &str) -> IndicatorSnapshot;
}

/// Reweights raw features before scoring; backed by the out-of-scope ML
/// model in a full deployment.
pub trait ModelWeighter: Send + Sync {
    fn weight(&self, features: IndicatorSnapshot) -> IndicatorSnapshot;
}

/// A `SignalSource` that never finds anything, for `--dry-run` and tests.
pub struct NoOpSignalSource;

impl SignalSource for NoOpSignalSource {
    fn scan(&self) -> Vec<Opportunity> {
        Vec::new()
    }
}

/// An `IndicatorProvider` returning a flat, neutral snapshot.
pub struct NeutralIndicatorProvider;

impl IndicatorProvider for NeutralIndicatorProvider {
    fn latest(&self, _symbol: &str) -> IndicatorSnapshot {
        IndicatorSnapshot::default()
    }
}

/// A `ModelWeighter` that passes features through unchanged.
pub struct IdentityWeighter;

impl ModelWeighter for IdentityWeighter {
    fn weight(&self, features: IndicatorSnapshot) -> IndicatorSnapshot {
        features
    }
}
