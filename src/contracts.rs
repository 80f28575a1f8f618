// Contract-First Design
// This module defines the records the store persists, the snapshot the
// matcher reads, and the PlacementStore trait every backend must honor.
// Doc comments state the preconditions and postconditions each operation
// is held to at runtime.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};

use crate::errors::Result;
use crate::registry::{ResourceClassRegistry, TraitRegistry};
use crate::requests::AllocationReplacePlan;
use crate::types::{
    AggregateUuid, ClassId, ConsumerUuid, Generation, ProviderId, ProviderUuid, TraitId, TraitName,
};
use crate::validation;

/// One resource provider row.
///
/// # Invariants
/// - `uuid` and `name` are unique store-wide
/// - `root_id == id` iff `parent_id` is `None`
/// - `generation` advances by exactly 1 on every mutation touching this
///   provider (inventory, aggregates, traits, allocations, rename, reparent)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceProvider {
    pub id: ProviderId,
    pub uuid: ProviderUuid,
    pub name: String,
    pub generation: Generation,
    pub parent_id: Option<ProviderId>,
    pub root_id: ProviderId,
}

/// Input for creating a provider. The store assigns `id`, `root_id` and
/// the initial generation.
#[derive(Debug, Clone)]
pub struct NewProvider {
    pub uuid: ProviderUuid,
    pub name: String,
    pub parent: Option<ProviderUuid>,
}

impl NewProvider {
    pub fn new(uuid: ProviderUuid, name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validation::names::validate_external_id("provider name", &name)?;
        Ok(Self {
            uuid,
            name,
            parent: None,
        })
    }

    pub fn with_parent(mut self, parent: ProviderUuid) -> Self {
        self.parent = Some(parent);
        self
    }
}

/// Fields an update may touch. `parent` uses two levels of Option:
/// `None` leaves the parent alone, `Some(None)` detaches the provider
/// into a new root, `Some(Some(p))` re-homes it under `p`.
#[derive(Debug, Clone, Default)]
pub struct ProviderUpdate {
    pub name: Option<String>,
    pub parent: Option<Option<ProviderUuid>>,
}

/// Filters for provider listing. All present filters are ANDed.
#[derive(Debug, Clone, Default)]
pub struct ProviderFilters {
    /// Case-sensitive substring on the provider name.
    pub name_contains: Option<String>,
    /// Restrict to these uuids.
    pub uuids: Option<Vec<ProviderUuid>>,
    /// AND across the outer list, OR within each inner set.
    pub member_of: Vec<BTreeSet<AggregateUuid>>,
    /// Providers reaching any of these aggregates are excluded.
    pub forbidden_aggregates: BTreeSet<AggregateUuid>,
    pub required_traits: BTreeSet<TraitId>,
    pub forbidden_traits: BTreeSet<TraitId>,
    /// Restrict to the tree this provider belongs to.
    pub in_tree: Option<ProviderUuid>,
    /// Only providers with admissible capacity for every entry.
    pub has_resources: BTreeMap<ClassId, i64>,
}

/// One inventory record for a (provider, resource class) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Inventory {
    pub resource_class_id: ClassId,
    pub total: i64,
    pub reserved: i64,
    pub min_unit: i64,
    pub max_unit: i64,
    pub step_size: i64,
    pub allocation_ratio: f64,
}

impl Inventory {
    /// Create a record, checking the cross-field constraints.
    ///
    /// # Invariants
    /// - `0 <= reserved <= total`
    /// - `1 <= min_unit <= max_unit <= total`
    /// - `step_size >= 1`, `allocation_ratio > 0`
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        resource_class_id: ClassId,
        total: i64,
        reserved: i64,
        min_unit: i64,
        max_unit: i64,
        step_size: i64,
        allocation_ratio: f64,
    ) -> Result<Self> {
        validation::inventory::validate_fields(
            total,
            reserved,
            min_unit,
            max_unit,
            step_size,
            allocation_ratio,
        )?;
        Ok(Self {
            resource_class_id,
            total,
            reserved,
            min_unit,
            max_unit,
            step_size,
            allocation_ratio,
        })
    }

    /// `floor((total - reserved) * allocation_ratio)`
    pub fn effective_capacity(&self) -> i64 {
        (((self.total - self.reserved) as f64) * self.allocation_ratio).floor() as i64
    }

    /// Whether `amount` fits this inventory given current usage:
    /// unit window, step alignment, and remaining effective capacity.
    pub fn admits(&self, amount: i64, usage: i64) -> bool {
        amount >= self.min_unit
            && amount <= self.max_unit
            && amount % self.step_size == 0
            && usage + amount <= self.effective_capacity()
    }
}

/// One allocation row: `used` units of one class on one provider,
/// held by one consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Allocation {
    pub consumer_uuid: ConsumerUuid,
    pub provider_id: ProviderId,
    pub resource_class_id: ClassId,
    pub used: i64,
}

/// A consumer of resources. Rows persist (with advanced generation)
/// after their allocations are deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Consumer {
    pub uuid: ConsumerUuid,
    pub project_id: String,
    pub user_id: String,
    pub consumer_type: String,
    pub generation: Generation,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// One allocation row rendered for external callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocationRecord {
    pub provider_uuid: ProviderUuid,
    pub resource_class: String,
    pub used: i64,
}

/// Everything the matcher needs about one provider, read in one snapshot.
#[derive(Debug, Clone)]
pub struct ProviderView {
    pub id: ProviderId,
    pub uuid: ProviderUuid,
    pub name: String,
    pub generation: Generation,
    pub parent_id: Option<ProviderId>,
    pub root_id: ProviderId,
    pub aggregates: BTreeSet<AggregateUuid>,
    pub traits: BTreeSet<TraitId>,
    pub inventories: BTreeMap<ClassId, Inventory>,
    pub usages: BTreeMap<ClassId, i64>,
}

impl ProviderView {
    pub fn usage(&self, class_id: ClassId) -> i64 {
        self.usages.get(&class_id).copied().unwrap_or(0)
    }

    /// Admissibility of `amount` of `class_id` on this provider alone.
    pub fn admits(&self, class_id: ClassId, amount: i64) -> bool {
        self.inventories
            .get(&class_id)
            .map(|inv| inv.admits(amount, self.usage(class_id)))
            .unwrap_or(false)
    }

    pub fn has_trait(&self, trait_id: TraitId) -> bool {
        self.traits.contains(&trait_id)
    }
}

/// A consistent read of the whole store, taken under one read guard.
/// The matcher works exclusively against this; it never goes back to the
/// store mid-enumeration.
#[derive(Debug, Clone)]
pub struct PlacementSnapshot {
    pub providers: BTreeMap<ProviderId, ProviderView>,
    pub classes: ResourceClassRegistry,
    pub traits: TraitRegistry,
    pub sharing_trait: TraitId,
}

impl PlacementSnapshot {
    pub fn provider(&self, id: ProviderId) -> Option<&ProviderView> {
        self.providers.get(&id)
    }

    /// Members of the tree rooted at `root_id`, in id order.
    pub fn tree_members(&self, root_id: ProviderId) -> Vec<&ProviderView> {
        self.providers
            .values()
            .filter(|p| p.root_id == root_id)
            .collect()
    }

    /// Aggregates a provider is considered a member of for filtering:
    /// its direct aggregates plus its root's direct aggregates.
    /// Root-level aggregates span the tree downward; child-level
    /// aggregates never span upward.
    pub fn member_aggregates(&self, provider: &ProviderView) -> BTreeSet<AggregateUuid> {
        let mut aggs = provider.aggregates.clone();
        if let Some(root) = self.providers.get(&provider.root_id) {
            aggs.extend(root.aggregates.iter().copied());
        }
        aggs
    }

    /// Whether a provider bears the sharing marker trait.
    pub fn is_sharing(&self, provider: &ProviderView) -> bool {
        provider.has_trait(self.sharing_trait)
    }

    /// Whether sharer `sharer` is reachable from the tree rooted at
    /// `root_id`: some provider of that tree has a direct aggregate in
    /// common with the sharer's direct aggregates.
    pub fn sharer_reaches_tree(&self, sharer: &ProviderView, root_id: ProviderId) -> bool {
        self.providers
            .values()
            .filter(|p| p.root_id == root_id)
            .any(|p| p.aggregates.intersection(&sharer.aggregates).next().is_some())
    }
}

/// Core trait for placement storage backends.
///
/// The bundled implementation is [`crate::memory_store::MemoryStore`];
/// a relational backend implements the same contract with row locks and
/// a real transaction where `MemoryStore` holds its write guard.
#[async_trait]
pub trait PlacementStore: Send + Sync {
    // -- resource providers ------------------------------------------------

    /// Create a provider.
    ///
    /// # Preconditions
    /// - `uuid` and `name` not yet present
    /// - `parent`, when given, names an existing provider
    ///
    /// # Postconditions
    /// - generation starts at 0
    /// - `root_id` is the parent's root, or the new id for a new root
    async fn create_provider(&self, new: NewProvider) -> Result<ResourceProvider>;

    /// Rename and/or re-parent a provider.
    ///
    /// # Preconditions
    /// - `expected` equals the stored generation (else ConcurrentUpdate)
    /// - re-parenting may not create a cycle (else InvariantViolation)
    ///
    /// # Postconditions
    /// - on re-parent, every descendant's `root_id` is rewritten in the
    ///   same critical section
    /// - generation advanced by 1
    async fn update_provider(
        &self,
        uuid: ProviderUuid,
        expected: Generation,
        update: ProviderUpdate,
    ) -> Result<ResourceProvider>;

    /// Delete a provider with no inventory, no allocations and no
    /// children (else InvariantViolation).
    async fn delete_provider(&self, uuid: ProviderUuid) -> Result<()>;

    async fn get_provider(&self, uuid: ProviderUuid) -> Result<ResourceProvider>;

    /// List providers matching all present filters.
    async fn list_providers(&self, filters: &ProviderFilters) -> Result<Vec<ResourceProvider>>;

    // -- aggregates and traits ---------------------------------------------

    /// Replace the provider's aggregate set. Generation-checked; bumps
    /// the generation.
    async fn set_provider_aggregates(
        &self,
        uuid: ProviderUuid,
        expected: Generation,
        aggregates: Vec<AggregateUuid>,
    ) -> Result<ResourceProvider>;

    async fn provider_aggregates(&self, uuid: ProviderUuid) -> Result<BTreeSet<AggregateUuid>>;

    /// Replace the provider's trait set. Custom trait names are created
    /// on first use. Generation-checked; bumps the generation.
    async fn set_provider_traits(
        &self,
        uuid: ProviderUuid,
        expected: Generation,
        traits: Vec<TraitName>,
    ) -> Result<ResourceProvider>;

    async fn provider_traits(&self, uuid: ProviderUuid) -> Result<BTreeSet<String>>;

    // -- inventories --------------------------------------------------------

    /// Replace all inventory for a provider.
    ///
    /// # Preconditions
    /// - `expected` equals the stored generation
    /// - no class with remaining usage may be removed, and no class may
    ///   shrink below its current usage (else InvariantViolation)
    ///
    /// # Postconditions
    /// - generation advanced by 1, even when the set is unchanged
    async fn replace_inventories(
        &self,
        uuid: ProviderUuid,
        expected: Generation,
        inventories: Vec<Inventory>,
    ) -> Result<ResourceProvider>;

    /// Insert or update a single class. Same stranding rule on shrink.
    async fn upsert_inventory(
        &self,
        uuid: ProviderUuid,
        expected: Generation,
        inventory: Inventory,
    ) -> Result<ResourceProvider>;

    /// Delete a single class; refused while usage remains.
    async fn delete_inventory(
        &self,
        uuid: ProviderUuid,
        expected: Generation,
        class_id: ClassId,
    ) -> Result<ResourceProvider>;

    async fn list_inventories(&self, uuid: ProviderUuid) -> Result<Vec<Inventory>>;

    // -- usage views ---------------------------------------------------------

    /// Sum of allocation `used` for one (provider, class).
    async fn usage(&self, uuid: ProviderUuid, class_id: ClassId) -> Result<i64>;

    async fn allocations_for_consumer(
        &self,
        consumer: ConsumerUuid,
    ) -> Result<Vec<AllocationRecord>>;

    async fn get_consumer(&self, consumer: ConsumerUuid) -> Result<Consumer>;

    /// Per-class usage totals for a project, optionally narrowed to one
    /// user.
    async fn usage_report(
        &self,
        project_id: &str,
        user_id: Option<&str>,
    ) -> Result<BTreeMap<String, i64>>;

    // -- registries ----------------------------------------------------------

    async fn ensure_resource_class(&self, name: &str) -> Result<ClassId>;
    async fn resource_class_id(&self, name: &str) -> Result<ClassId>;
    async fn list_resource_classes(&self) -> Result<Vec<(ClassId, String)>>;
    /// Delete a custom class no inventory or allocation references.
    async fn delete_custom_resource_class(&self, name: &str) -> Result<()>;

    async fn ensure_trait(&self, name: &str) -> Result<TraitId>;
    async fn trait_id(&self, name: &str) -> Result<TraitId>;
    async fn list_traits(&self) -> Result<Vec<(TraitId, String)>>;
    /// Delete a custom trait no provider is associated with.
    async fn delete_custom_trait(&self, name: &str) -> Result<()>;

    // -- the commit engine ---------------------------------------------------

    /// Replace all allocations for the plan's consumers in one
    /// transaction.
    ///
    /// # Preconditions
    /// - every consumer's supplied generation matches (null on first
    ///   creation), every provider's supplied generation matches
    /// - every desired row fits `sum(used) <= effective_capacity` after
    ///   the replacement
    ///
    /// # Postconditions
    /// - prior rows for each consumer are gone, desired rows are in
    /// - every involved provider and consumer generation advanced by 1
    /// - on any failure nothing changed at all
    async fn replace_allocations(&self, plan: AllocationReplacePlan) -> Result<()>;

    // -- matcher entry -------------------------------------------------------

    /// A consistent snapshot of providers, inventories, usages, traits,
    /// aggregates and both registries.
    async fn snapshot(&self) -> Result<PlacementSnapshot>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_effective_capacity() {
        let inv = Inventory::new(0, 24, 0, 1, 24, 1, 16.0).unwrap();
        assert_eq!(inv.effective_capacity(), 384);

        let inv = Inventory::new(0, 2000, 100, 10, 2000, 10, 1.0).unwrap();
        assert_eq!(inv.effective_capacity(), 1900);

        // ratio below one shrinks capacity
        let inv = Inventory::new(0, 2000, 0, 1, 2000, 1, 0.5).unwrap();
        assert_eq!(inv.effective_capacity(), 1000);
    }

    #[test]
    fn test_admits_window_and_step() {
        let inv = Inventory::new(0, 32768, 0, 64, 2048, 64, 1.0).unwrap();
        assert!(inv.admits(64, 0));
        assert!(inv.admits(2048, 0));
        // below min_unit
        assert!(!inv.admits(32, 0));
        // above max_unit
        assert!(!inv.admits(2112, 0));
        // step misaligned
        assert!(!inv.admits(96, 0));
    }

    #[test]
    fn test_admits_capacity() {
        let inv = Inventory::new(0, 10, 2, 1, 10, 1, 1.0).unwrap();
        assert_eq!(inv.effective_capacity(), 8);
        assert!(inv.admits(8, 0));
        assert!(!inv.admits(8, 1));
        assert!(inv.admits(1, 7));
        assert!(!inv.admits(1, 8));
    }

    #[test]
    fn test_fully_reserved_admits_nothing() {
        let inv = Inventory::new(0, 16, 16, 1, 16, 1, 1.0).unwrap();
        assert_eq!(inv.effective_capacity(), 0);
        assert!(!inv.admits(1, 0));
    }

    #[test]
    fn test_inventory_validation() {
        assert!(Inventory::new(0, 16, 0, 1, 16, 1, 1.0).is_ok());
        assert!(Inventory::new(0, 16, 20, 1, 16, 1, 1.0).is_err());
        assert!(Inventory::new(0, 16, 0, 0, 16, 1, 1.0).is_err());
        assert!(Inventory::new(0, 16, 0, 1, 20, 1, 1.0).is_err());
        assert!(Inventory::new(0, 16, 0, 1, 16, 1, -1.0).is_err());
    }
}
