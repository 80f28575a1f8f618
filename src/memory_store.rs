// In-memory PlacementStore implementation.
// State lives behind one tokio RwLock: commits hold the write guard for
// the whole transaction, snapshots clone under the read guard. A SQL
// backend would replace the guard with row locks and a real transaction;
// everything above the trait stays the same.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::contracts::{
    Allocation, AllocationRecord, Consumer, Inventory, NewProvider, PlacementSnapshot,
    PlacementStore, ProviderFilters, ProviderUpdate, ProviderView, ResourceProvider,
};
use crate::errors::{EntityKind, PlacementError, Result};
use crate::registry::{ResourceClassRegistry, TraitRegistry};
use crate::requests::AllocationReplacePlan;
use crate::types::{
    AggregateUuid, ClassId, ConsumerUuid, Generation, ProviderId, ProviderUuid, TraitId, TraitName,
};

#[derive(Debug, Default)]
struct StoreState {
    providers: BTreeMap<ProviderId, ResourceProvider>,
    by_uuid: HashMap<ProviderUuid, ProviderId>,
    by_name: HashMap<String, ProviderId>,
    inventories: BTreeMap<ProviderId, BTreeMap<ClassId, Inventory>>,
    aggregates: BTreeMap<ProviderId, BTreeSet<AggregateUuid>>,
    provider_traits: BTreeMap<ProviderId, BTreeSet<TraitId>>,
    allocations: BTreeMap<ConsumerUuid, Vec<Allocation>>,
    consumers: BTreeMap<ConsumerUuid, Consumer>,
    classes: ResourceClassRegistry,
    traits: TraitRegistry,
    next_provider_id: ProviderId,
}

impl StoreState {
    fn new() -> Self {
        Self {
            classes: ResourceClassRegistry::new(),
            traits: TraitRegistry::new(),
            next_provider_id: 1,
            ..Default::default()
        }
    }

    fn provider_id(&self, uuid: ProviderUuid) -> Result<ProviderId> {
        self.by_uuid.get(&uuid).copied().ok_or_else(|| {
            PlacementError::not_found(EntityKind::ResourceProvider, uuid.to_string())
        })
    }

    fn provider(&self, id: ProviderId) -> &ResourceProvider {
        &self.providers[&id]
    }

    fn check_generation(&self, id: ProviderId, expected: Generation) -> Result<()> {
        let provider = self.provider(id);
        if provider.generation != expected {
            return Err(PlacementError::ConcurrentUpdate {
                entity: EntityKind::ResourceProvider,
                identifier: provider.uuid.to_string(),
                expected: Some(expected.value()),
                current: provider.generation.value(),
            });
        }
        Ok(())
    }

    fn bump_generation(&mut self, id: ProviderId) {
        let provider = self.providers.get_mut(&id).expect("caller verified id");
        provider.generation = provider.generation.next();
    }

    /// Sum of `used` over all consumers for one (provider, class).
    fn usage(&self, provider_id: ProviderId, class_id: ClassId) -> i64 {
        self.allocations
            .values()
            .flatten()
            .filter(|a| a.provider_id == provider_id && a.resource_class_id == class_id)
            .map(|a| a.used)
            .sum()
    }

    fn usage_map(&self, provider_id: ProviderId) -> BTreeMap<ClassId, i64> {
        let mut usages = BTreeMap::new();
        for alloc in self.allocations.values().flatten() {
            if alloc.provider_id == provider_id {
                *usages.entry(alloc.resource_class_id).or_insert(0) += alloc.used;
            }
        }
        usages
    }

    fn has_allocations(&self, provider_id: ProviderId) -> bool {
        self.allocations
            .values()
            .flatten()
            .any(|a| a.provider_id == provider_id)
    }

    fn children(&self, id: ProviderId) -> Vec<ProviderId> {
        self.providers
            .values()
            .filter(|p| p.parent_id == Some(id))
            .map(|p| p.id)
            .collect()
    }

    /// The provider and all its descendants, walking parent links.
    fn subtree(&self, id: ProviderId) -> Vec<ProviderId> {
        let mut members = vec![id];
        let mut frontier = vec![id];
        while let Some(current) = frontier.pop() {
            for child in self.children(current) {
                members.push(child);
                frontier.push(child);
            }
        }
        members
    }

    fn rewrite_subtree_root(&mut self, subtree: &[ProviderId], new_root: ProviderId) {
        for id in subtree {
            self.providers.get_mut(id).expect("subtree ids exist").root_id = new_root;
        }
    }

    /// Providers and classes already in use must survive a new inventory
    /// set: a used class may not disappear, and remaining usage may not
    /// exceed the new effective capacity.
    fn check_not_stranding(
        &self,
        provider_id: ProviderId,
        new_inventories: &BTreeMap<ClassId, Inventory>,
    ) -> Result<()> {
        let provider = self.provider(provider_id);
        for (class_id, used) in self.usage_map(provider_id) {
            if used == 0 {
                continue;
            }
            match new_inventories.get(&class_id) {
                None => {
                    return Err(PlacementError::invariant(format!(
                        "removing class id {class_id} from provider {} would strand {used} used units",
                        provider.uuid
                    )));
                }
                Some(inventory) => {
                    let capacity = inventory.effective_capacity();
                    if used > capacity {
                        return Err(PlacementError::invariant(format!(
                            "shrinking class id {class_id} on provider {} below {used} used units (new capacity {capacity})",
                            provider.uuid
                        )));
                    }
                }
            }
        }
        Ok(())
    }

    fn view(&self, provider: &ResourceProvider) -> ProviderView {
        ProviderView {
            id: provider.id,
            uuid: provider.uuid,
            name: provider.name.clone(),
            generation: provider.generation,
            parent_id: provider.parent_id,
            root_id: provider.root_id,
            aggregates: self
                .aggregates
                .get(&provider.id)
                .cloned()
                .unwrap_or_default(),
            traits: self
                .provider_traits
                .get(&provider.id)
                .cloned()
                .unwrap_or_default(),
            inventories: self
                .inventories
                .get(&provider.id)
                .cloned()
                .unwrap_or_default(),
            usages: self.usage_map(provider.id),
        }
    }

    /// Aggregates a provider is considered a member of: direct plus the
    /// root's direct set.
    fn member_aggregates(&self, provider: &ResourceProvider) -> BTreeSet<AggregateUuid> {
        let mut aggs = self
            .aggregates
            .get(&provider.id)
            .cloned()
            .unwrap_or_default();
        if let Some(root_aggs) = self.aggregates.get(&provider.root_id) {
            aggs.extend(root_aggs.iter().copied());
        }
        aggs
    }
}

/// The bundled in-memory placement store.
pub struct MemoryStore {
    state: RwLock<StoreState>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(StoreState::new()),
        }
    }
}

/// Create a store with seeded registries, ready for use.
pub fn create_memory_store() -> MemoryStore {
    MemoryStore::new()
}

#[async_trait]
impl PlacementStore for MemoryStore {
    async fn create_provider(&self, new: NewProvider) -> Result<ResourceProvider> {
        let mut state = self.state.write().await;
        if state.by_uuid.contains_key(&new.uuid) {
            return Err(PlacementError::invariant(format!(
                "provider uuid {} already exists",
                new.uuid
            )));
        }
        if state.by_name.contains_key(&new.name) {
            return Err(PlacementError::invariant(format!(
                "provider name {} already exists",
                new.name
            )));
        }
        let parent_id = match new.parent {
            Some(parent_uuid) => Some(state.provider_id(parent_uuid)?),
            None => None,
        };

        let id = state.next_provider_id;
        state.next_provider_id += 1;
        let root_id = parent_id
            .map(|pid| state.provider(pid).root_id)
            .unwrap_or(id);
        let provider = ResourceProvider {
            id,
            uuid: new.uuid,
            name: new.name.clone(),
            generation: Generation::initial(),
            parent_id,
            root_id,
        };
        state.by_uuid.insert(new.uuid, id);
        state.by_name.insert(new.name, id);
        state.providers.insert(id, provider.clone());
        info!(uuid = %provider.uuid, name = %provider.name, "created resource provider");
        Ok(provider)
    }

    async fn update_provider(
        &self,
        uuid: ProviderUuid,
        expected: Generation,
        update: ProviderUpdate,
    ) -> Result<ResourceProvider> {
        let mut state = self.state.write().await;
        let id = state.provider_id(uuid)?;
        state.check_generation(id, expected)?;

        if let Some(new_name) = &update.name {
            if let Some(other) = state.by_name.get(new_name) {
                if *other != id {
                    return Err(PlacementError::invariant(format!(
                        "provider name {new_name} already exists"
                    )));
                }
            }
            let old_name = state.provider(id).name.clone();
            state.by_name.remove(&old_name);
            state.by_name.insert(new_name.clone(), id);
            state.providers.get_mut(&id).expect("id exists").name = new_name.clone();
        }

        if let Some(new_parent) = update.parent {
            let subtree = state.subtree(id);
            let (parent_id, new_root) = match new_parent {
                None => (None, id),
                Some(parent_uuid) => {
                    let parent_id = state.provider_id(parent_uuid)?;
                    if subtree.contains(&parent_id) {
                        return Err(PlacementError::invariant(format!(
                            "re-parenting provider {uuid} under {parent_uuid} would create a cycle"
                        )));
                    }
                    (Some(parent_id), state.provider(parent_id).root_id)
                }
            };
            state.providers.get_mut(&id).expect("id exists").parent_id = parent_id;
            state.rewrite_subtree_root(&subtree, new_root);
        }

        state.bump_generation(id);
        Ok(state.provider(id).clone())
    }

    async fn delete_provider(&self, uuid: ProviderUuid) -> Result<()> {
        let mut state = self.state.write().await;
        let id = state.provider_id(uuid)?;
        if state
            .inventories
            .get(&id)
            .map(|m| !m.is_empty())
            .unwrap_or(false)
        {
            return Err(PlacementError::invariant(format!(
                "provider {uuid} still has inventory"
            )));
        }
        if state.has_allocations(id) {
            return Err(PlacementError::invariant(format!(
                "provider {uuid} still has allocations"
            )));
        }
        if !state.children(id).is_empty() {
            return Err(PlacementError::invariant(format!(
                "provider {uuid} still has child providers"
            )));
        }
        let provider = state.providers.remove(&id).expect("id exists");
        state.by_uuid.remove(&provider.uuid);
        state.by_name.remove(&provider.name);
        state.inventories.remove(&id);
        state.aggregates.remove(&id);
        state.provider_traits.remove(&id);
        info!(uuid = %uuid, "deleted resource provider");
        Ok(())
    }

    async fn get_provider(&self, uuid: ProviderUuid) -> Result<ResourceProvider> {
        let state = self.state.read().await;
        let id = state.provider_id(uuid)?;
        Ok(state.provider(id).clone())
    }

    async fn list_providers(&self, filters: &ProviderFilters) -> Result<Vec<ResourceProvider>> {
        let state = self.state.read().await;
        let in_tree_root = match filters.in_tree {
            Some(uuid) => Some(state.provider(state.provider_id(uuid)?).root_id),
            None => None,
        };
        let uuid_set: Option<BTreeSet<ProviderUuid>> =
            filters.uuids.as_ref().map(|u| u.iter().copied().collect());

        let mut matched = Vec::new();
        for provider in state.providers.values() {
            if let Some(fragment) = &filters.name_contains {
                if !provider.name.contains(fragment.as_str()) {
                    continue;
                }
            }
            if let Some(uuids) = &uuid_set {
                if !uuids.contains(&provider.uuid) {
                    continue;
                }
            }
            if let Some(root) = in_tree_root {
                if provider.root_id != root {
                    continue;
                }
            }
            let traits = state
                .provider_traits
                .get(&provider.id)
                .cloned()
                .unwrap_or_default();
            if !filters.required_traits.is_subset(&traits) {
                continue;
            }
            if !filters.forbidden_traits.is_disjoint(&traits) {
                continue;
            }
            if !filters.member_of.is_empty() || !filters.forbidden_aggregates.is_empty() {
                let member = state.member_aggregates(provider);
                if !filters.member_of.iter().all(|any| !any.is_disjoint(&member)) {
                    continue;
                }
                if !member.is_disjoint(&filters.forbidden_aggregates) {
                    continue;
                }
            }
            if !filters.has_resources.is_empty() {
                let inventories = state.inventories.get(&provider.id);
                let admits_all = filters.has_resources.iter().all(|(class_id, amount)| {
                    inventories
                        .and_then(|m| m.get(class_id))
                        .map(|inv| inv.admits(*amount, state.usage(provider.id, *class_id)))
                        .unwrap_or(false)
                });
                if !admits_all {
                    continue;
                }
            }
            matched.push(provider.clone());
        }
        Ok(matched)
    }

    async fn set_provider_aggregates(
        &self,
        uuid: ProviderUuid,
        expected: Generation,
        aggregates: Vec<AggregateUuid>,
    ) -> Result<ResourceProvider> {
        let mut state = self.state.write().await;
        let id = state.provider_id(uuid)?;
        state.check_generation(id, expected)?;
        state.aggregates.insert(id, aggregates.into_iter().collect());
        state.bump_generation(id);
        Ok(state.provider(id).clone())
    }

    async fn provider_aggregates(&self, uuid: ProviderUuid) -> Result<BTreeSet<AggregateUuid>> {
        let state = self.state.read().await;
        let id = state.provider_id(uuid)?;
        Ok(state.aggregates.get(&id).cloned().unwrap_or_default())
    }

    async fn set_provider_traits(
        &self,
        uuid: ProviderUuid,
        expected: Generation,
        traits: Vec<TraitName>,
    ) -> Result<ResourceProvider> {
        let mut state = self.state.write().await;
        let id = state.provider_id(uuid)?;
        state.check_generation(id, expected)?;
        let mut trait_ids = BTreeSet::new();
        for name in &traits {
            trait_ids.insert(state.traits.ensure(name)?);
        }
        state.provider_traits.insert(id, trait_ids);
        state.bump_generation(id);
        Ok(state.provider(id).clone())
    }

    async fn provider_traits(&self, uuid: ProviderUuid) -> Result<BTreeSet<String>> {
        let state = self.state.read().await;
        let id = state.provider_id(uuid)?;
        let mut names = BTreeSet::new();
        for trait_id in state.provider_traits.get(&id).into_iter().flatten() {
            names.insert(state.traits.name_of(*trait_id)?);
        }
        Ok(names)
    }

    async fn replace_inventories(
        &self,
        uuid: ProviderUuid,
        expected: Generation,
        inventories: Vec<Inventory>,
    ) -> Result<ResourceProvider> {
        let mut state = self.state.write().await;
        let id = state.provider_id(uuid)?;
        state.check_generation(id, expected)?;

        let mut new_set: BTreeMap<ClassId, Inventory> = BTreeMap::new();
        for inventory in inventories {
            if !state.classes.contains_id(inventory.resource_class_id) {
                return Err(PlacementError::not_found(
                    EntityKind::ResourceClass,
                    format!("id {}", inventory.resource_class_id),
                ));
            }
            if new_set
                .insert(inventory.resource_class_id, inventory)
                .is_some()
            {
                return Err(PlacementError::invalid(
                    "duplicate resource class in inventory set",
                ));
            }
        }
        state.check_not_stranding(id, &new_set)?;
        state.inventories.insert(id, new_set);
        state.bump_generation(id);
        debug!(uuid = %uuid, "replaced inventories");
        Ok(state.provider(id).clone())
    }

    async fn upsert_inventory(
        &self,
        uuid: ProviderUuid,
        expected: Generation,
        inventory: Inventory,
    ) -> Result<ResourceProvider> {
        let mut state = self.state.write().await;
        let id = state.provider_id(uuid)?;
        state.check_generation(id, expected)?;
        if !state.classes.contains_id(inventory.resource_class_id) {
            return Err(PlacementError::not_found(
                EntityKind::ResourceClass,
                format!("id {}", inventory.resource_class_id),
            ));
        }
        let mut new_set = state.inventories.get(&id).cloned().unwrap_or_default();
        new_set.insert(inventory.resource_class_id, inventory);
        state.check_not_stranding(id, &new_set)?;
        state.inventories.insert(id, new_set);
        state.bump_generation(id);
        Ok(state.provider(id).clone())
    }

    async fn delete_inventory(
        &self,
        uuid: ProviderUuid,
        expected: Generation,
        class_id: ClassId,
    ) -> Result<ResourceProvider> {
        let mut state = self.state.write().await;
        let id = state.provider_id(uuid)?;
        state.check_generation(id, expected)?;
        let mut new_set = state.inventories.get(&id).cloned().unwrap_or_default();
        if new_set.remove(&class_id).is_none() {
            return Err(PlacementError::not_found(
                EntityKind::Inventory,
                format!("provider {uuid} class id {class_id}"),
            ));
        }
        state.check_not_stranding(id, &new_set)?;
        state.inventories.insert(id, new_set);
        state.bump_generation(id);
        Ok(state.provider(id).clone())
    }

    async fn list_inventories(&self, uuid: ProviderUuid) -> Result<Vec<Inventory>> {
        let state = self.state.read().await;
        let id = state.provider_id(uuid)?;
        Ok(state
            .inventories
            .get(&id)
            .map(|m| m.values().cloned().collect())
            .unwrap_or_default())
    }

    async fn usage(&self, uuid: ProviderUuid, class_id: ClassId) -> Result<i64> {
        let state = self.state.read().await;
        let id = state.provider_id(uuid)?;
        Ok(state.usage(id, class_id))
    }

    async fn allocations_for_consumer(
        &self,
        consumer: ConsumerUuid,
    ) -> Result<Vec<AllocationRecord>> {
        let state = self.state.read().await;
        let mut records = Vec::new();
        for alloc in state.allocations.get(&consumer).into_iter().flatten() {
            records.push(AllocationRecord {
                provider_uuid: state.provider(alloc.provider_id).uuid,
                resource_class: state.classes.name_of(alloc.resource_class_id)?,
                used: alloc.used,
            });
        }
        Ok(records)
    }

    async fn get_consumer(&self, consumer: ConsumerUuid) -> Result<Consumer> {
        let state = self.state.read().await;
        state
            .consumers
            .get(&consumer)
            .cloned()
            .ok_or_else(|| PlacementError::not_found(EntityKind::Consumer, consumer.to_string()))
    }

    async fn usage_report(
        &self,
        project_id: &str,
        user_id: Option<&str>,
    ) -> Result<BTreeMap<String, i64>> {
        let state = self.state.read().await;
        let mut report: BTreeMap<String, i64> = BTreeMap::new();
        for (consumer_uuid, rows) in &state.allocations {
            let consumer = match state.consumers.get(consumer_uuid) {
                Some(c) => c,
                None => continue,
            };
            if consumer.project_id != project_id {
                continue;
            }
            if let Some(user) = user_id {
                if consumer.user_id != user {
                    continue;
                }
            }
            for row in rows {
                let class = state.classes.name_of(row.resource_class_id)?;
                *report.entry(class).or_insert(0) += row.used;
            }
        }
        Ok(report)
    }

    async fn ensure_resource_class(&self, name: &str) -> Result<ClassId> {
        let mut state = self.state.write().await;
        let validated = crate::types::ResourceClassName::new(name)?;
        state.classes.ensure(&validated)
    }

    async fn resource_class_id(&self, name: &str) -> Result<ClassId> {
        let state = self.state.read().await;
        state.classes.id_of(name)
    }

    async fn list_resource_classes(&self) -> Result<Vec<(ClassId, String)>> {
        let state = self.state.read().await;
        Ok(state.classes.list())
    }

    async fn delete_custom_resource_class(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let class_id = state.classes.id_of(name)?;
        let inventoried = state
            .inventories
            .values()
            .any(|m| m.contains_key(&class_id));
        if inventoried {
            return Err(PlacementError::invariant(format!(
                "resource class {name} still has inventory"
            )));
        }
        let allocated = state
            .allocations
            .values()
            .flatten()
            .any(|a| a.resource_class_id == class_id);
        if allocated {
            return Err(PlacementError::invariant(format!(
                "resource class {name} still has allocations"
            )));
        }
        state.classes.remove_custom(name)?;
        Ok(())
    }

    async fn ensure_trait(&self, name: &str) -> Result<TraitId> {
        let mut state = self.state.write().await;
        let validated = TraitName::new(name)?;
        state.traits.ensure(&validated)
    }

    async fn trait_id(&self, name: &str) -> Result<TraitId> {
        let state = self.state.read().await;
        state.traits.id_of(name)
    }

    async fn list_traits(&self) -> Result<Vec<(TraitId, String)>> {
        let state = self.state.read().await;
        Ok(state.traits.list())
    }

    async fn delete_custom_trait(&self, name: &str) -> Result<()> {
        let mut state = self.state.write().await;
        let trait_id = state.traits.id_of(name)?;
        let associated = state
            .provider_traits
            .values()
            .any(|set| set.contains(&trait_id));
        if associated {
            return Err(PlacementError::invariant(format!(
                "trait {name} is still associated with providers"
            )));
        }
        state.traits.remove_custom(name)?;
        Ok(())
    }

    async fn replace_allocations(&self, plan: AllocationReplacePlan) -> Result<()> {
        plan.validate()?;
        let mut state = self.state.write().await;

        // Phase 1: resolve and assert. Nothing is mutated until every
        // check across every consumer in the plan has passed.
        struct ResolvedConsumer {
            consumer: ConsumerUuid,
            exists: bool,
            rows: Vec<Allocation>,
        }
        let mut resolved: Vec<ResolvedConsumer> = Vec::with_capacity(plan.consumers.len());
        let mut involved_providers: BTreeSet<ProviderId> = BTreeSet::new();

        for set in &plan.consumers {
            let existing = state.consumers.get(&set.consumer);
            match (existing, set.expected_generation) {
                (Some(consumer), expected) => {
                    if expected != Some(consumer.generation) {
                        return Err(PlacementError::ConcurrentUpdate {
                            entity: EntityKind::Consumer,
                            identifier: set.consumer.to_string(),
                            expected: expected.map(|g| g.value()),
                            current: consumer.generation.value(),
                        });
                    }
                }
                (None, Some(expected)) => {
                    return Err(PlacementError::ConcurrentUpdate {
                        entity: EntityKind::Consumer,
                        identifier: set.consumer.to_string(),
                        expected: Some(expected.value()),
                        current: 0,
                    });
                }
                (None, None) => {
                    if set.allocations.is_empty() {
                        return Err(PlacementError::not_found(
                            EntityKind::Consumer,
                            set.consumer.to_string(),
                        ));
                    }
                }
            }

            let mut rows = Vec::new();
            for alloc in &set.allocations {
                let provider_id = state.provider_id(alloc.provider)?;
                state.check_generation(provider_id, alloc.expected_generation)?;
                involved_providers.insert(provider_id);
                for (class_name, amount) in &alloc.resources {
                    let class_id = state.classes.id_of(class_name.as_str())?;
                    rows.push(Allocation {
                        consumer_uuid: set.consumer,
                        provider_id,
                        resource_class_id: class_id,
                        used: *amount,
                    });
                }
            }
            // Providers losing rows are touched too; their generation
            // advances even without an entry in the desired list.
            for old in state.allocations.get(&set.consumer).into_iter().flatten() {
                involved_providers.insert(old.provider_id);
            }
            resolved.push(ResolvedConsumer {
                consumer: set.consumer,
                exists: existing.is_some(),
                rows,
            });
        }

        // Phase 2: capacity. Build the post-replacement usage for every
        // involved (provider, class) and hold it against inventory.
        let plan_consumers: BTreeSet<ConsumerUuid> =
            resolved.iter().map(|r| r.consumer).collect();
        let mut new_usage: BTreeMap<(ProviderId, ClassId), i64> = BTreeMap::new();
        for (consumer_uuid, rows) in &state.allocations {
            if plan_consumers.contains(consumer_uuid) {
                continue;
            }
            for row in rows {
                *new_usage
                    .entry((row.provider_id, row.resource_class_id))
                    .or_insert(0) += row.used;
            }
        }
        let mut touched: BTreeSet<(ProviderId, ClassId)> = BTreeSet::new();
        for r in &resolved {
            for row in &r.rows {
                let key = (row.provider_id, row.resource_class_id);
                touched.insert(key);
                *new_usage.entry(key).or_insert(0) += row.used;

                // Per-row unit window, as the admissibility contract
                // demands even at commit time.
                let provider = state.provider(row.provider_id);
                let inventory = state
                    .inventories
                    .get(&row.provider_id)
                    .and_then(|m| m.get(&row.resource_class_id));
                let class = state.classes.name_of(row.resource_class_id)?;
                match inventory {
                    None => {
                        return Err(PlacementError::CapacityExceeded {
                            provider: provider.uuid.to_string(),
                            class,
                            requested: row.used,
                            available: 0,
                        });
                    }
                    Some(inv) => {
                        if row.used < inv.min_unit
                            || row.used > inv.max_unit
                            || row.used % inv.step_size != 0
                        {
                            return Err(PlacementError::CapacityExceeded {
                                provider: provider.uuid.to_string(),
                                class,
                                requested: row.used,
                                available: inv.effective_capacity(),
                            });
                        }
                    }
                }
            }
        }
        for (provider_id, class_id) in &touched {
            let total = new_usage[&(*provider_id, *class_id)];
            let provider = state.provider(*provider_id);
            let inventory = state
                .inventories
                .get(provider_id)
                .and_then(|m| m.get(class_id))
                .expect("checked above");
            let capacity = inventory.effective_capacity();
            if total > capacity {
                let used_elsewhere = total
                    - resolved
                        .iter()
                        .flat_map(|r| &r.rows)
                        .filter(|row| {
                            row.provider_id == *provider_id && row.resource_class_id == *class_id
                        })
                        .map(|row| row.used)
                        .sum::<i64>();
                return Err(PlacementError::CapacityExceeded {
                    provider: provider.uuid.to_string(),
                    class: state.classes.name_of(*class_id)?,
                    requested: total - used_elsewhere,
                    available: capacity - used_elsewhere,
                });
            }
        }

        // Phase 3: apply. Everything has been asserted; no failure below.
        let now = Utc::now();
        for (r, set) in resolved.iter().zip(&plan.consumers) {
            if r.rows.is_empty() {
                state.allocations.remove(&r.consumer);
            } else {
                state.allocations.insert(r.consumer, r.rows.clone());
            }
            if r.exists {
                let consumer = state
                    .consumers
                    .get_mut(&r.consumer)
                    .expect("existence checked");
                consumer.generation = consumer.generation.next();
                consumer.updated_at = now;
            } else {
                state.consumers.insert(
                    r.consumer,
                    Consumer {
                        uuid: r.consumer,
                        project_id: set.project_id.clone(),
                        user_id: set.user_id.clone(),
                        consumer_type: set.consumer_type.clone(),
                        generation: Generation::initial().next(),
                        created_at: now,
                        updated_at: now,
                    },
                );
            }
        }
        for provider_id in involved_providers {
            state.bump_generation(provider_id);
        }
        info!(consumers = plan.consumers.len(), "replaced allocations");
        Ok(())
    }

    async fn snapshot(&self) -> Result<PlacementSnapshot> {
        let state = self.state.read().await;
        let mut providers = BTreeMap::new();
        for provider in state.providers.values() {
            providers.insert(provider.id, state.view(provider));
        }
        Ok(PlacementSnapshot {
            providers,
            classes: state.classes.clone(),
            traits: state.traits.clone(),
            sharing_trait: state.traits.sharing_trait_id(),
        })
    }
}
