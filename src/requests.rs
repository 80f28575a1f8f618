// External request adapter.
// The HTTP collaborator hands us name-keyed, schema-validated payloads;
// this module turns them into id-keyed internal shapes exactly once per
// request, and owns the commit-plan input of the allocation engine.
// Names are resolved here so the matcher and store work on integers.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::time::Instant;
use uuid::Uuid;

use crate::contracts::PlacementSnapshot;
use crate::errors::{PlacementError, Result};
use crate::types::{
    AggregateUuid, ClassId, ConsumerUuid, Generation, ProviderUuid, ResourceClassName, TraitId,
};
use crate::validation;

/// Distinctness policy across granular groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPolicy {
    /// No constraint between the providers different groups choose.
    #[default]
    None,
    /// Every granular group must land on a distinct provider.
    Isolate,
}

/// One request group as parsed by the transport layer. The empty suffix
/// is the unnumbered group (resources may split across a tree and its
/// sharers); any other suffix is granular (single provider).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedRequestGroup {
    pub resources: BTreeMap<String, i64>,
    #[serde(default)]
    pub required_traits: BTreeSet<String>,
    #[serde(default)]
    pub forbidden_traits: BTreeSet<String>,
    /// AND across the outer list, OR within each inner list.
    #[serde(default)]
    pub member_of: Vec<Vec<Uuid>>,
    #[serde(default)]
    pub forbidden_aggregates: Vec<Uuid>,
}

/// A whole candidate request: suffix-keyed groups plus top-level knobs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ParsedRequest {
    /// Keyed by group suffix; `""` is the unnumbered group. Insertion
    /// order is preserved into the result mappings.
    pub groups: IndexMap<String, ParsedRequestGroup>,
    #[serde(default)]
    pub limit: Option<i64>,
    #[serde(default)]
    pub group_policy: GroupPolicy,
    #[serde(default)]
    pub tree_root: Option<Uuid>,
    #[serde(default)]
    pub randomize: bool,
}

/// A group after name resolution, as the matcher consumes it.
#[derive(Debug, Clone)]
pub struct RequestGroup {
    pub suffix: String,
    pub resources: BTreeMap<ClassId, i64>,
    pub required_traits: BTreeSet<TraitId>,
    pub forbidden_traits: BTreeSet<TraitId>,
    pub member_of: Vec<BTreeSet<AggregateUuid>>,
    pub forbidden_aggregates: BTreeSet<AggregateUuid>,
    /// Granular groups take every resource from one provider; the
    /// unnumbered group may split across a tree and its sharers.
    pub use_same_provider: bool,
}

/// A fully resolved request ready for candidate generation.
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub groups: Vec<RequestGroup>,
    pub limit: Option<usize>,
    pub group_policy: GroupPolicy,
    pub tree_root: Option<ProviderUuid>,
    pub randomize: bool,
    /// Checked between enumeration stages; expiry yields a partial set.
    pub deadline: Option<Instant>,
}

impl PlacementRequest {
    /// Attach a deadline the matcher will honor between stages.
    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

impl ParsedRequest {
    /// Resolve every class, trait and aggregate reference, mapping names
    /// to internal ids. Unknown class or trait names fail with NotFound;
    /// structural problems fail with Validation. This is the only place
    /// names are resolved on the read path.
    pub fn resolve(&self, snapshot: &PlacementSnapshot) -> Result<PlacementRequest> {
        if self.groups.is_empty() {
            return Err(PlacementError::invalid(
                "a placement request needs at least one group",
            ));
        }
        if let Some(limit) = self.limit {
            validation::request::validate_limit(limit)?;
        }

        let mut groups = Vec::with_capacity(self.groups.len());
        for (suffix, parsed) in &self.groups {
            groups.push(resolve_group(snapshot, suffix, parsed)?);
        }

        let tree_root = match self.tree_root {
            Some(uuid) => Some(ProviderUuid::from_uuid(uuid)?),
            None => None,
        };

        Ok(PlacementRequest {
            groups,
            limit: self.limit.map(|l| l as usize),
            group_policy: self.group_policy,
            tree_root,
            randomize: self.randomize,
            deadline: None,
        })
    }
}

fn resolve_group(
    snapshot: &PlacementSnapshot,
    suffix: &str,
    parsed: &ParsedRequestGroup,
) -> Result<RequestGroup> {
    if parsed.resources.is_empty() {
        return Err(PlacementError::invalid(format!(
            "request group {suffix:?} has no resources"
        )));
    }
    validation::request::validate_member_of(&parsed.member_of)?;

    let mut resources = BTreeMap::new();
    for (class_name, amount) in &parsed.resources {
        validation::request::validate_amount(class_name, *amount)?;
        let class_id = snapshot.classes.id_of(class_name)?;
        resources.insert(class_id, *amount);
    }

    let mut required_traits = BTreeSet::new();
    for name in &parsed.required_traits {
        required_traits.insert(snapshot.traits.id_of(name)?);
    }
    let mut forbidden_traits = BTreeSet::new();
    for name in &parsed.forbidden_traits {
        forbidden_traits.insert(snapshot.traits.id_of(name)?);
    }

    let mut member_of = Vec::with_capacity(parsed.member_of.len());
    for inner in &parsed.member_of {
        let mut set = BTreeSet::new();
        for agg in inner {
            set.insert(AggregateUuid::from_uuid(*agg)?);
        }
        member_of.push(set);
    }

    let mut forbidden_aggregates = BTreeSet::new();
    for agg in &parsed.forbidden_aggregates {
        forbidden_aggregates.insert(AggregateUuid::from_uuid(*agg)?);
    }

    Ok(RequestGroup {
        suffix: suffix.to_string(),
        resources,
        required_traits,
        forbidden_traits,
        member_of,
        forbidden_aggregates,
        use_same_provider: !suffix.is_empty(),
    })
}

// ---------------------------------------------------------------------------
// Commit-side shapes
// ---------------------------------------------------------------------------

/// Desired allocations against one provider, with the generation the
/// caller last observed for it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderAllocations {
    pub provider: ProviderUuid,
    pub expected_generation: Generation,
    /// class name -> amount, every amount >= 1
    pub resources: Vec<(ResourceClassName, i64)>,
}

/// The full desired state for one consumer. An empty `allocations` list
/// deletes the consumer's allocations (its generation still advances).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConsumerAllocationSet {
    pub consumer: ConsumerUuid,
    /// Must be `None` exactly when the consumer does not exist yet.
    pub expected_generation: Option<Generation>,
    pub project_id: String,
    pub user_id: String,
    pub consumer_type: String,
    pub allocations: Vec<ProviderAllocations>,
}

/// Input to the commit engine: one or more consumers replaced atomically.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AllocationReplacePlan {
    pub consumers: Vec<ConsumerAllocationSet>,
}

impl AllocationReplacePlan {
    pub fn for_consumer(set: ConsumerAllocationSet) -> Self {
        Self {
            consumers: vec![set],
        }
    }

    /// Cheap structural checks before the store transaction: positive
    /// amounts, non-empty external ids, no duplicate consumer entries.
    pub fn validate(&self) -> Result<()> {
        if self.consumers.is_empty() {
            return Err(PlacementError::invalid("allocation plan has no consumers"));
        }
        let mut seen = BTreeSet::new();
        for set in &self.consumers {
            if !seen.insert(set.consumer) {
                return Err(PlacementError::invalid(format!(
                    "consumer {} appears twice in one plan",
                    set.consumer
                )));
            }
            validation::names::validate_external_id("project_id", &set.project_id)?;
            validation::names::validate_external_id("user_id", &set.user_id)?;
            validation::names::validate_external_id("consumer_type", &set.consumer_type)?;
            let mut providers = BTreeSet::new();
            for alloc in &set.allocations {
                if !providers.insert(alloc.provider) {
                    return Err(PlacementError::invalid(format!(
                        "provider {} appears twice for consumer {}",
                        alloc.provider, set.consumer
                    )));
                }
                if alloc.resources.is_empty() {
                    return Err(PlacementError::invalid(format!(
                        "provider {} entry for consumer {} has no resources",
                        alloc.provider, set.consumer
                    )));
                }
                for (class, amount) in &alloc.resources {
                    validation::request::validate_amount(class.as_str(), *amount)?;
                }
            }
        }
        Ok(())
    }
}
