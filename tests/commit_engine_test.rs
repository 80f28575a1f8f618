// Commit engine behavior: generation conflicts, capacity enforcement,
// atomicity across consumers, and the replace/delete lifecycle.

use placedb::{
    AllocationReplacePlan, ConsumerAllocationSet, ConsumerUuid, Generation, InventoryBuilder,
    MemoryStore, NewProvider, PlacementError, PlacementStore, ProviderAllocations, ProviderUuid,
    ResourceClassName,
};

async fn provider_with_vcpu(store: &MemoryStore, name: &str, total: i64) -> ProviderUuid {
    let created = store
        .create_provider(NewProvider::new(ProviderUuid::generate(), name).unwrap())
        .await
        .unwrap();
    let vcpu = store.resource_class_id("VCPU").await.unwrap();
    let inventory = InventoryBuilder::new(vcpu, total).build().unwrap();
    store
        .upsert_inventory(created.uuid, created.generation, inventory)
        .await
        .unwrap();
    created.uuid
}

fn consumer_set(
    consumer: ConsumerUuid,
    expected_generation: Option<Generation>,
    allocations: Vec<(ProviderUuid, Generation, Vec<(&str, i64)>)>,
) -> ConsumerAllocationSet {
    ConsumerAllocationSet {
        consumer,
        expected_generation,
        project_id: "project-a".to_string(),
        user_id: "user-a".to_string(),
        consumer_type: "INSTANCE".to_string(),
        allocations: allocations
            .into_iter()
            .map(|(provider, generation, resources)| ProviderAllocations {
                provider,
                expected_generation: generation,
                resources: resources
                    .into_iter()
                    .map(|(class, amount)| (ResourceClassName::new(class).unwrap(), amount))
                    .collect(),
            })
            .collect(),
    }
}

#[tokio::test]
async fn test_commit_writes_allocations_and_bumps_generations() {
    let store = MemoryStore::new();
    let cn = provider_with_vcpu(&store, "cn1", 16).await;
    let generation = store.get_provider(cn).await.unwrap().generation;
    let consumer = ConsumerUuid::generate();

    store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            consumer,
            None,
            vec![(cn, generation, vec![("VCPU", 4)])],
        )))
        .await
        .unwrap();

    let vcpu = store.resource_class_id("VCPU").await.unwrap();
    assert_eq!(store.usage(cn, vcpu).await.unwrap(), 4);

    // provider generation advanced by exactly 1
    let after = store.get_provider(cn).await.unwrap();
    assert_eq!(after.generation, generation.next());
    // a fresh consumer lands at generation 1
    let consumer_row = store.get_consumer(consumer).await.unwrap();
    assert_eq!(consumer_row.generation.value(), 1);

    let records = store.allocations_for_consumer(consumer).await.unwrap();
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].used, 4);
    assert_eq!(records[0].resource_class, "VCPU");
}

#[tokio::test]
async fn test_stale_provider_generation_is_rejected() {
    let store = MemoryStore::new();
    let cn = provider_with_vcpu(&store, "cn1", 16).await;
    let observed = store.get_provider(cn).await.unwrap().generation;

    // another actor bumps cn in the meantime
    let aggs = store.provider_aggregates(cn).await.unwrap();
    store
        .set_provider_aggregates(cn, observed, aggs.into_iter().collect())
        .await
        .unwrap();

    let consumer = ConsumerUuid::generate();
    let err = store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            consumer,
            None,
            vec![(cn, observed, vec![("VCPU", 4)])],
        )))
        .await
        .unwrap_err();

    match err {
        PlacementError::ConcurrentUpdate {
            expected, current, ..
        } => {
            assert_eq!(expected, Some(observed.value()));
            assert_eq!(current, observed.next().value());
        }
        other => panic!("expected ConcurrentUpdate, got {other:?}"),
    }

    // nothing was written
    let vcpu = store.resource_class_id("VCPU").await.unwrap();
    assert_eq!(store.usage(cn, vcpu).await.unwrap(), 0);
    assert!(store.get_consumer(consumer).await.is_err());
}

#[tokio::test]
async fn test_consumer_generation_contract() {
    let store = MemoryStore::new();
    let cn = provider_with_vcpu(&store, "cn1", 16).await;
    let consumer = ConsumerUuid::generate();

    // creation must claim a null generation
    let generation = store.get_provider(cn).await.unwrap().generation;
    let err = store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            consumer,
            Some(Generation::from_value(0)),
            vec![(cn, generation, vec![("VCPU", 1)])],
        )))
        .await
        .unwrap_err();
    assert!(matches!(err, PlacementError::ConcurrentUpdate { .. }));

    store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            consumer,
            None,
            vec![(cn, generation, vec![("VCPU", 1)])],
        )))
        .await
        .unwrap();

    // replacing with a stale consumer generation fails
    let generation = store.get_provider(cn).await.unwrap().generation;
    let err = store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            consumer,
            Some(Generation::from_value(9)),
            vec![(cn, generation, vec![("VCPU", 2)])],
        )))
        .await
        .unwrap_err();
    assert!(matches!(
        err,
        PlacementError::ConcurrentUpdate { current: 1, .. }
    ));

    // claiming null for an existing consumer fails too
    let err = store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            consumer,
            None,
            vec![(cn, generation, vec![("VCPU", 2)])],
        )))
        .await
        .unwrap_err();
    assert!(matches!(err, PlacementError::ConcurrentUpdate { .. }));
}

#[tokio::test]
async fn test_over_capacity_aborts() {
    let store = MemoryStore::new();
    let cn = provider_with_vcpu(&store, "cn1", 10).await;

    // first consumer takes 8 of 10
    let generation = store.get_provider(cn).await.unwrap().generation;
    store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            ConsumerUuid::generate(),
            None,
            vec![(cn, generation, vec![("VCPU", 8)])],
        )))
        .await
        .unwrap();

    // a second consumer asking for 4 busts the capacity
    let generation = store.get_provider(cn).await.unwrap().generation;
    let consumer = ConsumerUuid::generate();
    let err = store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            consumer,
            None,
            vec![(cn, generation, vec![("VCPU", 4)])],
        )))
        .await
        .unwrap_err();
    match err {
        PlacementError::CapacityExceeded {
            requested,
            available,
            ..
        } => {
            assert_eq!(requested, 4);
            assert_eq!(available, 2);
        }
        other => panic!("expected CapacityExceeded, got {other:?}"),
    }

    // the failed consumer was not created, usage is unchanged
    let vcpu = store.resource_class_id("VCPU").await.unwrap();
    assert_eq!(store.usage(cn, vcpu).await.unwrap(), 8);
    assert!(store.get_consumer(consumer).await.is_err());
}

#[tokio::test]
async fn test_multi_consumer_plan_is_atomic() {
    let store = MemoryStore::new();
    let cn = provider_with_vcpu(&store, "cn1", 10).await;
    let generation = store.get_provider(cn).await.unwrap().generation;

    let first = ConsumerUuid::generate();
    let second = ConsumerUuid::generate();

    // jointly 6 + 6 > 10: the whole plan must fail, including the
    // first consumer that would have fit alone
    let plan = AllocationReplacePlan {
        consumers: vec![
            consumer_set(first, None, vec![(cn, generation, vec![("VCPU", 6)])]),
            consumer_set(second, None, vec![(cn, generation, vec![("VCPU", 6)])]),
        ],
    };
    let err = store.replace_allocations(plan).await.unwrap_err();
    assert!(matches!(err, PlacementError::CapacityExceeded { .. }));

    let vcpu = store.resource_class_id("VCPU").await.unwrap();
    assert_eq!(store.usage(cn, vcpu).await.unwrap(), 0);
    assert!(store.get_consumer(first).await.is_err());
    assert!(store.get_consumer(second).await.is_err());

    // provider generation untouched by the failed plan
    assert_eq!(store.get_provider(cn).await.unwrap().generation, generation);
}

#[tokio::test]
async fn test_replace_same_set_is_idempotent_up_to_generation() {
    let store = MemoryStore::new();
    let cn = provider_with_vcpu(&store, "cn1", 16).await;
    let consumer = ConsumerUuid::generate();

    let generation = store.get_provider(cn).await.unwrap().generation;
    store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            consumer,
            None,
            vec![(cn, generation, vec![("VCPU", 4)])],
        )))
        .await
        .unwrap();
    let records_before = store.allocations_for_consumer(consumer).await.unwrap();
    let consumer_generation = store.get_consumer(consumer).await.unwrap().generation;

    // same rows, current generations
    let generation = store.get_provider(cn).await.unwrap().generation;
    store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            consumer,
            Some(consumer_generation),
            vec![(cn, generation, vec![("VCPU", 4)])],
        )))
        .await
        .unwrap();

    let records_after = store.allocations_for_consumer(consumer).await.unwrap();
    assert_eq!(records_before, records_after);
    assert_eq!(
        store.get_consumer(consumer).await.unwrap().generation,
        consumer_generation.next()
    );
}

#[tokio::test]
async fn test_empty_list_deletes_and_advances_generation() {
    let store = MemoryStore::new();
    let cn = provider_with_vcpu(&store, "cn1", 16).await;
    let consumer = ConsumerUuid::generate();

    let generation = store.get_provider(cn).await.unwrap().generation;
    store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            consumer,
            None,
            vec![(cn, generation, vec![("VCPU", 4)])],
        )))
        .await
        .unwrap();

    let consumer_generation = store.get_consumer(consumer).await.unwrap().generation;
    let provider_generation = store.get_provider(cn).await.unwrap().generation;

    store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            consumer,
            Some(consumer_generation),
            vec![],
        )))
        .await
        .unwrap();

    let vcpu = store.resource_class_id("VCPU").await.unwrap();
    assert_eq!(store.usage(cn, vcpu).await.unwrap(), 0);
    assert!(store
        .allocations_for_consumer(consumer)
        .await
        .unwrap()
        .is_empty());

    // the consumer row survives with an advanced generation, and the
    // provider that lost rows advanced too
    assert_eq!(
        store.get_consumer(consumer).await.unwrap().generation,
        consumer_generation.next()
    );
    assert_eq!(
        store.get_provider(cn).await.unwrap().generation,
        provider_generation.next()
    );
}

#[tokio::test]
async fn test_unknown_provider_and_class() {
    let store = MemoryStore::new();
    let cn = provider_with_vcpu(&store, "cn1", 16).await;
    let generation = store.get_provider(cn).await.unwrap().generation;

    // unknown provider
    let err = store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            ConsumerUuid::generate(),
            None,
            vec![(ProviderUuid::generate(), generation, vec![("VCPU", 1)])],
        )))
        .await
        .unwrap_err();
    assert!(matches!(err, PlacementError::NotFound { .. }));

    // unknown custom class
    let err = store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            ConsumerUuid::generate(),
            None,
            vec![(cn, generation, vec![("CUSTOM_UNSEEN", 1)])],
        )))
        .await
        .unwrap_err();
    assert!(matches!(err, PlacementError::NotFound { .. }));
}

#[tokio::test]
async fn test_allocation_against_uninventoried_class() {
    let store = MemoryStore::new();
    let cn = provider_with_vcpu(&store, "cn1", 16).await;
    let generation = store.get_provider(cn).await.unwrap().generation;

    // DISK_GB is a known class but cn has no inventory for it
    let err = store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            ConsumerUuid::generate(),
            None,
            vec![(cn, generation, vec![("DISK_GB", 10)])],
        )))
        .await
        .unwrap_err();
    assert!(matches!(err, PlacementError::CapacityExceeded { .. }));
}

#[tokio::test]
async fn test_usage_report_by_project_and_user() {
    let store = MemoryStore::new();
    let cn = provider_with_vcpu(&store, "cn1", 16).await;
    let generation = store.get_provider(cn).await.unwrap().generation;

    let mut set = consumer_set(
        ConsumerUuid::generate(),
        None,
        vec![(cn, generation, vec![("VCPU", 4)])],
    );
    set.user_id = "user-b".to_string();
    store
        .replace_allocations(AllocationReplacePlan::for_consumer(set))
        .await
        .unwrap();

    let generation = store.get_provider(cn).await.unwrap().generation;
    store
        .replace_allocations(AllocationReplacePlan::for_consumer(consumer_set(
            ConsumerUuid::generate(),
            None,
            vec![(cn, generation, vec![("VCPU", 2)])],
        )))
        .await
        .unwrap();

    let report = store.usage_report("project-a", None).await.unwrap();
    assert_eq!(report["VCPU"], 6);

    let report = store.usage_report("project-a", Some("user-b")).await.unwrap();
    assert_eq!(report["VCPU"], 4);

    let report = store.usage_report("project-z", None).await.unwrap();
    assert!(report.is_empty());
}
