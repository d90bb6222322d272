//! Signature matching over a tier index.
//!
//! Shared by span detection (attribute keys) and structure discovery
//! (top-level keys of a response object).

use rustc_hash::FxHashSet;

use crate::domain::dsl::CompiledBundle;
use crate::domain::dsl::bundle::{SignatureEntry, TierIndex};
use crate::utils::string::wildcard_indices;

impl TierIndex {
    /// Restrict field ids to this tier's universe, sorted and deduplicated.
    pub fn reduce(&self, ids: impl IntoIterator<Item = u32>) -> Vec<u32> {
        let mut reduced: Vec<u32> = ids
            .into_iter()
            .filter(|id| self.universe.contains(id))
            .collect();
        reduced.sort_unstable();
        reduced.dedup();
        reduced
    }

    pub fn exact_match(&self, signature: &[u32]) -> Option<&SignatureEntry> {
        if signature.is_empty() {
            return None;
        }
        self.signature_to_provider.get(signature)
    }

    /// Most specific pattern whose required set is contained in `signature`.
    ///
    /// Buckets are scanned from the observed size down; within a bucket the
    /// compile-time order (weight, then declaration) decides. Candidates whose
    /// discounted confidence falls below `min_confidence` are skipped.
    pub fn subset_match(
        &self,
        signature: &[u32],
        discount: f64,
        min_confidence: f64,
    ) -> Option<(&SignatureEntry, f64)> {
        let present: FxHashSet<u32> = signature.iter().copied().collect();
        self.size_bucketed_subsets
            .range(..=signature.len())
            .rev()
            .flat_map(|(_, bucket)| bucket)
            .filter(|entry| entry.signature.iter().all(|id| present.contains(id)))
            .map(|entry| (entry, entry.confidence * discount))
            .find(|(_, confidence)| *confidence >= min_confidence)
    }
}

/// Interned ids of keys that appear verbatim in some pattern.
pub fn literal_ids<'k>(
    bundle: &CompiledBundle,
    keys: impl IntoIterator<Item = &'k str>,
) -> Vec<u32> {
    keys.into_iter()
        .filter_map(|key| bundle.field_id(key))
        .collect()
}

/// Interned ids of keys after rewriting numeric segments to `*`.
pub fn wildcard_ids<'k>(
    bundle: &CompiledBundle,
    keys: impl IntoIterator<Item = &'k str>,
) -> Vec<u32> {
    keys.into_iter()
        .filter_map(wildcard_indices)
        .filter_map(|normalized| bundle.field_id(&normalized))
        .collect()
}
