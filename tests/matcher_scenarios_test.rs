// End-to-end matcher scenarios against the in-memory store: local-only
// placement, shared inventory via aggregates, nested trees with traits,
// aggregate inheritance, limits and boundary behaviors.

use std::collections::{BTreeSet, HashMap};

use placedb::{
    find_candidates, simple_request, AggregateUuid, AllocationCandidates, GroupPolicy,
    InventoryBuilder, MemoryStore, NewProvider, PlacementError, PlacementStore, ProviderUuid,
    RequestBuilder, TraitName,
};
use pretty_assertions::assert_eq;

struct Env {
    store: MemoryStore,
    names: HashMap<ProviderUuid, String>,
}

impl Env {
    fn new() -> Self {
        Self {
            store: MemoryStore::new(),
            names: HashMap::new(),
        }
    }

    async fn provider(&mut self, name: &str) -> ProviderUuid {
        self.provider_under(name, None).await
    }

    async fn provider_under(&mut self, name: &str, parent: Option<ProviderUuid>) -> ProviderUuid {
        let mut new = NewProvider::new(ProviderUuid::generate(), name).unwrap();
        if let Some(parent) = parent {
            new = new.with_parent(parent);
        }
        let created = self.store.create_provider(new).await.unwrap();
        self.names.insert(created.uuid, name.to_string());
        created.uuid
    }

    async fn add_inventory(
        &self,
        uuid: ProviderUuid,
        class: &str,
        total: i64,
        customize: impl FnOnce(InventoryBuilder) -> InventoryBuilder,
    ) {
        let class_id = self.store.resource_class_id(class).await.unwrap();
        let inventory = customize(InventoryBuilder::new(class_id, total))
            .build()
            .unwrap();
        let generation = self.store.get_provider(uuid).await.unwrap().generation;
        self.store
            .upsert_inventory(uuid, generation, inventory)
            .await
            .unwrap();
    }

    async fn set_traits(&self, uuid: ProviderUuid, traits: &[&str]) {
        let names = traits
            .iter()
            .map(|t| TraitName::new(*t).unwrap())
            .collect::<Vec<_>>();
        let generation = self.store.get_provider(uuid).await.unwrap().generation;
        self.store
            .set_provider_traits(uuid, generation, names)
            .await
            .unwrap();
    }

    async fn set_aggregates(&self, uuid: ProviderUuid, aggregates: &[AggregateUuid]) {
        let generation = self.store.get_provider(uuid).await.unwrap().generation;
        self.store
            .set_provider_aggregates(uuid, generation, aggregates.to_vec())
            .await
            .unwrap();
    }

    /// Candidate allocation requests rendered to (name, class, amount)
    /// sets, order-insensitive.
    fn request_sets(&self, result: &AllocationCandidates) -> Vec<BTreeSet<(String, String, i64)>> {
        let mut sets: Vec<BTreeSet<(String, String, i64)>> = result
            .allocation_requests
            .iter()
            .map(|request| {
                request
                    .allocations
                    .iter()
                    .map(|entry| {
                        (
                            self.names[&entry.provider_uuid].clone(),
                            entry.resource_class.clone(),
                            entry.amount,
                        )
                    })
                    .collect()
            })
            .collect();
        sets.sort();
        sets
    }

    fn expect_requests(&self, result: &AllocationCandidates, expected: &[&[(&str, &str, i64)]]) {
        let mut want: Vec<BTreeSet<(String, String, i64)>> = expected
            .iter()
            .map(|request| {
                request
                    .iter()
                    .map(|(name, class, amount)| (name.to_string(), class.to_string(), *amount))
                    .collect()
            })
            .collect();
        want.sort();
        assert_eq!(want, self.request_sets(result));
    }

    fn summary_names(&self, result: &AllocationCandidates) -> BTreeSet<String> {
        result
            .provider_summaries
            .iter()
            .map(|s| self.names[&s.provider_uuid].clone())
            .collect()
    }
}

/// Three compute nodes with local disk; the third is too small.
async fn local_fixture() -> Env {
    let mut env = Env::new();
    for name in ["cn1", "cn2", "cn3"] {
        let cn = env.provider(name).await;
        env.add_inventory(cn, "VCPU", 24, |b| b.allocation_ratio(16.0))
            .await;
        env.add_inventory(cn, "MEMORY_MB", 32768, |b| {
            b.min_unit(64).step_size(64).allocation_ratio(1.5)
        })
        .await;
        let disk_total = if name == "cn3" { 1000 } else { 2000 };
        env.add_inventory(cn, "DISK_GB", disk_total, |b| {
            b.reserved(100).min_unit(10).step_size(10)
        })
        .await;
    }
    env
}

#[tokio::test]
async fn test_local_only() {
    let env = local_fixture().await;
    let request = simple_request(&[("VCPU", 1), ("MEMORY_MB", 64), ("DISK_GB", 1500)]).unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();

    // cn3 is excluded: 1000 total - 100 reserved < 1500
    env.expect_requests(
        &result,
        &[
            &[("cn1", "VCPU", 1), ("cn1", "MEMORY_MB", 64), ("cn1", "DISK_GB", 1500)],
            &[("cn2", "VCPU", 1), ("cn2", "MEMORY_MB", 64), ("cn2", "DISK_GB", 1500)],
        ],
    );
    assert_eq!(
        env.summary_names(&result),
        BTreeSet::from(["cn1".to_string(), "cn2".to_string()])
    );

    // summaries report effective capacity for every inventoried class
    let cn1_summary = result
        .provider_summaries
        .iter()
        .find(|s| env.names[&s.provider_uuid] == "cn1")
        .unwrap();
    let vcpu = cn1_summary
        .resources
        .iter()
        .find(|r| r.resource_class == "VCPU")
        .unwrap();
    assert_eq!(vcpu.capacity, 384);
    assert_eq!(vcpu.used, 0);
}

#[tokio::test]
async fn test_local_with_required_and_forbidden_traits() {
    let env = local_fixture().await;
    let request = RequestBuilder::new()
        .group("")
        .resource("VCPU", 1)
        .unwrap()
        .resource("MEMORY_MB", 64)
        .unwrap()
        .resource("DISK_GB", 1500)
        .unwrap()
        .require_trait("HW_CPU_X86_AVX2")
        .unwrap()
        .build()
        .unwrap();

    // nobody has AVX2 yet
    let result = find_candidates(&env.store, &request, None).await.unwrap();
    assert!(result.is_empty());

    // attach it to cn2 only
    let cn2 = *env
        .names
        .iter()
        .find(|(_, name)| name.as_str() == "cn2")
        .unwrap()
        .0;
    env.set_traits(cn2, &["HW_CPU_X86_AVX2"]).await;

    let result = find_candidates(&env.store, &request, None).await.unwrap();
    env.expect_requests(
        &result,
        &[&[("cn2", "VCPU", 1), ("cn2", "MEMORY_MB", 64), ("cn2", "DISK_GB", 1500)]],
    );
    let summary = &result.provider_summaries[0];
    assert!(summary.traits.contains("HW_CPU_X86_AVX2"));

    // forbidding the trait flips the result to cn1
    let request = RequestBuilder::new()
        .group("")
        .resource("VCPU", 1)
        .unwrap()
        .resource("MEMORY_MB", 64)
        .unwrap()
        .resource("DISK_GB", 1500)
        .unwrap()
        .forbid_trait("HW_CPU_X86_AVX2")
        .unwrap()
        .build()
        .unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();
    env.expect_requests(
        &result,
        &[&[("cn1", "VCPU", 1), ("cn1", "MEMORY_MB", 64), ("cn1", "DISK_GB", 1500)]],
    );
}

#[tokio::test]
async fn test_shared_disk() {
    let mut env = Env::new();
    let agg = AggregateUuid::generate();

    for name in ["cn1", "cn2"] {
        let cn = env.provider(name).await;
        env.add_inventory(cn, "VCPU", 24, |b| b.allocation_ratio(16.0))
            .await;
        env.add_inventory(cn, "MEMORY_MB", 1024, |b| {
            b.min_unit(64).step_size(64).allocation_ratio(1.5)
        })
        .await;
        env.set_aggregates(cn, &[agg]).await;
    }
    let ss = env.provider("ss").await;
    env.add_inventory(ss, "DISK_GB", 2000, |b| b.reserved(100)).await;
    env.set_traits(ss, &["MISC_SHARES_VIA_AGGREGATE"]).await;
    env.set_aggregates(ss, &[agg]).await;

    let request = simple_request(&[("VCPU", 1), ("MEMORY_MB", 64), ("DISK_GB", 1500)]).unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();

    env.expect_requests(
        &result,
        &[
            &[("cn1", "VCPU", 1), ("cn1", "MEMORY_MB", 64), ("ss", "DISK_GB", 1500)],
            &[("cn2", "VCPU", 1), ("cn2", "MEMORY_MB", 64), ("ss", "DISK_GB", 1500)],
        ],
    );
    assert_eq!(
        env.summary_names(&result),
        BTreeSet::from(["cn1".to_string(), "cn2".to_string(), "ss".to_string()])
    );
}

#[tokio::test]
async fn test_mix_local_and_shared() {
    let mut env = Env::new();
    let agg = AggregateUuid::generate();

    let cn1 = env.provider("cn1").await;
    env.add_inventory(cn1, "VCPU", 24, |b| b).await;
    env.add_inventory(cn1, "DISK_GB", 1600, |b| b).await;
    env.set_aggregates(cn1, &[agg]).await;

    let ss = env.provider("ss").await;
    env.add_inventory(ss, "DISK_GB", 2000, |b| b).await;
    env.set_traits(ss, &["MISC_SHARES_VIA_AGGREGATE"]).await;
    env.set_aggregates(ss, &[agg]).await;

    let request = simple_request(&[("VCPU", 2), ("DISK_GB", 1500)]).unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();

    // local disk and shared disk are both viable
    env.expect_requests(
        &result,
        &[
            &[("cn1", "VCPU", 2), ("cn1", "DISK_GB", 1500)],
            &[("cn1", "VCPU", 2), ("ss", "DISK_GB", 1500)],
        ],
    );
}

#[tokio::test]
async fn test_required_trait_elsewhere_in_tree() {
    let mut env = Env::new();
    let cn = env.provider("cn").await;
    env.add_inventory(cn, "VCPU", 16, |b| b).await;
    env.add_inventory(cn, "MEMORY_MB", 32768, |b| b).await;
    let numa0 = env.provider_under("numa0", Some(cn)).await;
    let numa1 = env.provider_under("numa1", Some(cn)).await;
    let pf0 = env.provider_under("pf0", Some(numa0)).await;
    env.add_inventory(pf0, "SRIOV_NET_VF", 8, |b| b).await;
    let pf1 = env.provider_under("pf1", Some(numa1)).await;
    env.add_inventory(pf1, "SRIOV_NET_VF", 8, |b| b).await;
    env.set_traits(pf1, &["HW_NIC_OFFLOAD_GENEVE"]).await;

    let request = RequestBuilder::new()
        .group("")
        .resource("VCPU", 2)
        .unwrap()
        .resource("MEMORY_MB", 256)
        .unwrap()
        .resource("SRIOV_NET_VF", 1)
        .unwrap()
        .require_trait("HW_NIC_OFFLOAD_GENEVE")
        .unwrap()
        .build()
        .unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();

    // exactly one candidate: cn serves VCPU and memory, pf1 serves the
    // VF because only pf1 carries the trait
    env.expect_requests(
        &result,
        &[&[("cn", "VCPU", 2), ("cn", "MEMORY_MB", 256), ("pf1", "SRIOV_NET_VF", 1)]],
    );
}

#[tokio::test]
async fn test_aggregate_on_root_spans_tree() {
    let mut env = Env::new();
    let agg1 = AggregateUuid::generate();

    let cn1 = env.provider("cn1").await;
    env.set_aggregates(cn1, &[agg1]).await;
    let pf0 = env.provider_under("pf0", Some(cn1)).await;
    env.add_inventory(pf0, "SRIOV_NET_VF", 8, |b| b).await;
    let pf1 = env.provider_under("pf1", Some(cn1)).await;
    env.add_inventory(pf1, "SRIOV_NET_VF", 8, |b| b).await;

    let request = RequestBuilder::new()
        .group("")
        .resource("SRIOV_NET_VF", 1)
        .unwrap()
        .member_of_any(vec![agg1.as_uuid()])
        .unwrap()
        .build()
        .unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();

    // the aggregate sits on the root; both children inherit it
    env.expect_requests(
        &result,
        &[&[("pf0", "SRIOV_NET_VF", 1)], &[("pf1", "SRIOV_NET_VF", 1)]],
    );
}

#[tokio::test]
async fn test_aggregate_on_child_does_not_span_upward() {
    let mut env = Env::new();
    let agg2 = AggregateUuid::generate();

    let cn2 = env.provider("cn2").await;
    env.add_inventory(cn2, "VCPU", 16, |b| b).await;
    let pf1 = env.provider_under("pf1", Some(cn2)).await;
    env.add_inventory(pf1, "SRIOV_NET_VF", 8, |b| b).await;
    env.set_aggregates(pf1, &[agg2]).await;

    let request = RequestBuilder::new()
        .group("")
        .resource("VCPU", 1)
        .unwrap()
        .member_of_any(vec![agg2.as_uuid()])
        .unwrap()
        .build()
        .unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();

    // VCPU lives on the root, which is not a member of agg2
    assert!(result.is_empty());
}

#[tokio::test]
async fn test_tree_root_filter() {
    let env = local_fixture().await;
    let cn2 = *env
        .names
        .iter()
        .find(|(_, name)| name.as_str() == "cn2")
        .unwrap()
        .0;

    let request = RequestBuilder::new()
        .group("")
        .resource("VCPU", 1)
        .unwrap()
        .resource("DISK_GB", 100)
        .unwrap()
        .in_tree(cn2.as_uuid())
        .build()
        .unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();
    env.expect_requests(&result, &[&[("cn2", "VCPU", 1), ("cn2", "DISK_GB", 100)]]);

    // an unknown tree root is a miss, not an error
    let request = RequestBuilder::new()
        .group("")
        .resource("VCPU", 1)
        .unwrap()
        .in_tree(uuid::Uuid::new_v4())
        .build()
        .unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn test_limit_and_randomize() {
    let env = local_fixture().await;

    let request = RequestBuilder::new()
        .group("")
        .resource("VCPU", 1)
        .unwrap()
        .limit(1)
        .build()
        .unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();
    assert_eq!(result.allocation_requests.len(), 1);
    // summaries cover only the post-limit candidate set
    assert_eq!(result.provider_summaries.len(), 1);

    // randomized sampling returns the same count; contents may vary
    let request = RequestBuilder::new()
        .group("")
        .resource("VCPU", 1)
        .unwrap()
        .limit(2)
        .randomize(true)
        .build()
        .unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();
    assert_eq!(result.allocation_requests.len(), 2);
    assert_eq!(result.provider_summaries.len(), 2);
}

#[tokio::test]
async fn test_granular_groups_and_policies() {
    let mut env = Env::new();
    let cn = env.provider("cn").await;
    env.add_inventory(cn, "VCPU", 16, |b| b).await;
    let pf0 = env.provider_under("pf0", Some(cn)).await;
    env.add_inventory(pf0, "SRIOV_NET_VF", 8, |b| b).await;
    let pf1 = env.provider_under("pf1", Some(cn)).await;
    env.add_inventory(pf1, "SRIOV_NET_VF", 8, |b| b).await;

    let build = |policy| {
        RequestBuilder::new()
            .group("")
            .resource("VCPU", 2)
            .unwrap()
            .group("1")
            .resource("SRIOV_NET_VF", 1)
            .unwrap()
            .group("2")
            .resource("SRIOV_NET_VF", 1)
            .unwrap()
            .group_policy(policy)
            .build()
            .unwrap()
    };

    // isolate: the two VF groups must land on different PFs
    let result = find_candidates(&env.store, &build(GroupPolicy::Isolate), None)
        .await
        .unwrap();
    assert_eq!(result.allocation_requests.len(), 2);
    for request in &result.allocation_requests {
        let group1 = &request.mappings["1"];
        let group2 = &request.mappings["2"];
        assert!(group1.is_disjoint(group2));
    }

    // none: both groups may stack on one PF, which then serves 2 VFs
    let result = find_candidates(&env.store, &build(GroupPolicy::None), None)
        .await
        .unwrap();
    assert_eq!(result.allocation_requests.len(), 4);
    let stacked = result
        .allocation_requests
        .iter()
        .filter(|r| r.allocations.iter().any(|e| e.amount == 2))
        .count();
    assert_eq!(stacked, 2);
}

#[tokio::test]
async fn test_boundary_behaviors() {
    let mut env = Env::new();
    let cn = env.provider("cn1").await;
    env.add_inventory(cn, "VCPU", 32, |b| b.min_unit(2).max_unit(8).step_size(2))
        .await;

    // amount == max_unit accepted
    let request = simple_request(&[("VCPU", 8)]).unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();
    assert_eq!(result.allocation_requests.len(), 1);

    // max_unit + step_size rejected
    let request = simple_request(&[("VCPU", 10)]).unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();
    assert!(result.is_empty());

    // step misalignment rejected
    let request = simple_request(&[("VCPU", 3)]).unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn test_fully_reserved_inventory_is_unusable() {
    let mut env = Env::new();
    let cn = env.provider("cn1").await;
    env.add_inventory(cn, "DISK_GB", 100, |b| b.reserved(100)).await;

    let request = simple_request(&[("DISK_GB", 1)]).unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn test_class_without_inventory_yields_no_candidates() {
    let mut env = Env::new();
    let cn = env.provider("cn1").await;
    env.add_inventory(cn, "VCPU", 16, |b| b).await;

    // PGPU exists as a class, but nobody offers it
    let request = simple_request(&[("VCPU", 1), ("PGPU", 1)]).unwrap();
    let result = find_candidates(&env.store, &request, None).await.unwrap();
    assert!(result.is_empty());
}

#[tokio::test]
async fn test_unknown_trait_is_not_found() {
    let mut env = Env::new();
    let cn = env.provider("cn1").await;
    env.add_inventory(cn, "VCPU", 16, |b| b).await;

    let request = RequestBuilder::new()
        .group("")
        .resource("VCPU", 1)
        .unwrap()
        .require_trait("CUSTOM_NEVER_CREATED")
        .unwrap()
        .build()
        .unwrap();
    let err = find_candidates(&env.store, &request, None).await.unwrap_err();
    assert!(matches!(err, PlacementError::NotFound { .. }));
}

#[tokio::test]
async fn test_requery_after_noop_update_is_stable() {
    let env = local_fixture().await;
    let request = simple_request(&[("VCPU", 1), ("DISK_GB", 100)]).unwrap();
    let before = find_candidates(&env.store, &request, None).await.unwrap();

    // a no-op mutation bumps generations but changes no capacity
    let cn1 = *env
        .names
        .iter()
        .find(|(_, name)| name.as_str() == "cn1")
        .unwrap()
        .0;
    let aggs = env.store.provider_aggregates(cn1).await.unwrap();
    let generation = env.store.get_provider(cn1).await.unwrap().generation;
    env.store
        .set_provider_aggregates(cn1, generation, aggs.into_iter().collect())
        .await
        .unwrap();

    let after = find_candidates(&env.store, &request, None).await.unwrap();
    assert_eq!(env.request_sets(&before), env.request_sets(&after));
}
