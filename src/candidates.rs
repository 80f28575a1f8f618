// Result shape of candidate generation.
// An AllocationCandidates value is what a caller picks one entry from and
// feeds back (with the observed generations) into the commit engine.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::contracts::PlacementSnapshot;
use crate::errors::Result;
use crate::types::{ClassId, ProviderId, ProviderUuid};

/// One (provider, class, amount) line of an allocation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationEntry {
    pub provider_uuid: ProviderUuid,
    pub resource_class: String,
    pub amount: i64,
}

/// One complete way to satisfy the request: an ordered list of
/// allocation lines plus, per group suffix, the providers that served
/// that group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRequest {
    pub allocations: Vec<AllocationEntry>,
    pub mappings: BTreeMap<String, BTreeSet<ProviderUuid>>,
}

/// Capacity and usage of one class on a summarized provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SummaryResource {
    pub resource_class: String,
    pub capacity: i64,
    pub used: i64,
}

/// Everything a caller needs to know about one provider participating
/// in at least one allocation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSummary {
    pub provider_uuid: ProviderUuid,
    pub name: String,
    pub root_uuid: ProviderUuid,
    pub parent_uuid: Option<ProviderUuid>,
    /// Every inventoried class, not just the requested ones.
    pub resources: Vec<SummaryResource>,
    pub traits: BTreeSet<String>,
}

/// The matcher's result: candidates plus summaries of exactly the
/// providers the candidates use.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationCandidates {
    pub allocation_requests: Vec<AllocationRequest>,
    pub provider_summaries: Vec<ProviderSummary>,
}

impl AllocationCandidates {
    pub fn is_empty(&self) -> bool {
        self.allocation_requests.is_empty()
    }
}

/// Build summaries for the given provider ids from the snapshot the
/// candidates were enumerated against. Summaries list effective
/// capacity and current usage for every inventoried class, and the
/// provider's trait names.
pub fn build_provider_summaries(
    snapshot: &PlacementSnapshot,
    provider_ids: &BTreeSet<ProviderId>,
) -> Result<Vec<ProviderSummary>> {
    let mut summaries = Vec::with_capacity(provider_ids.len());
    for id in provider_ids {
        let provider = match snapshot.provider(*id) {
            Some(p) => p,
            None => continue,
        };
        let mut resources = Vec::with_capacity(provider.inventories.len());
        for (class_id, inventory) in &provider.inventories {
            resources.push(SummaryResource {
                resource_class: snapshot.classes.name_of(*class_id)?,
                capacity: inventory.effective_capacity(),
                used: provider.usage(*class_id),
            });
        }
        let mut traits = BTreeSet::new();
        for trait_id in &provider.traits {
            traits.insert(snapshot.traits.name_of(*trait_id)?);
        }
        let parent_uuid = provider
            .parent_id
            .and_then(|pid| snapshot.provider(pid))
            .map(|p| p.uuid);
        let root_uuid = snapshot
            .provider(provider.root_id)
            .map(|p| p.uuid)
            .unwrap_or(provider.uuid);
        summaries.push(ProviderSummary {
            provider_uuid: provider.uuid,
            name: provider.name.clone(),
            root_uuid,
            parent_uuid,
            resources,
            traits,
        });
    }
    Ok(summaries)
}

/// Render an amounts map to ordered allocation lines.
pub(crate) fn render_entries(
    snapshot: &PlacementSnapshot,
    amounts: &BTreeMap<(ProviderId, ClassId), i64>,
) -> Result<Vec<AllocationEntry>> {
    let mut entries = Vec::with_capacity(amounts.len());
    for ((provider_id, class_id), amount) in amounts {
        let provider = snapshot
            .provider(*provider_id)
            .expect("amounts only reference snapshot providers");
        entries.push(AllocationEntry {
            provider_uuid: provider.uuid,
            resource_class: snapshot.classes.name_of(*class_id)?,
            amount: *amount,
        });
    }
    Ok(entries)
}
