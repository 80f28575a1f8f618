// PlaceDB - A Resource Provider Inventory and Placement Engine
// Root library module

pub mod builders;
pub mod candidates;
pub mod config;
pub mod contracts;
pub mod errors;
pub mod matcher;
pub mod memory_store;
pub mod observability;
pub mod registry;
pub mod requests;
pub mod types;
pub mod validation;

// Re-export key types
pub use errors::{EntityKind, PlacementError, Result};

pub use types::{
    AggregateUuid, ClassId, ConsumerUuid, Generation, ProviderId, ProviderUuid, RequestedAmount,
    ResourceClassName, TraitId, TraitName,
};

pub use contracts::{
    Allocation, AllocationRecord, Consumer, Inventory, NewProvider, PlacementSnapshot,
    PlacementStore, ProviderFilters, ProviderUpdate, ProviderView, ResourceProvider,
};

// Re-export the bundled store implementation
pub use memory_store::{create_memory_store, MemoryStore};

// Re-export registries and the standard tables
pub use registry::{
    ResourceClassRegistry, TraitRegistry, MISC_SHARES_VIA_AGGREGATE, STANDARD_RESOURCE_CLASSES,
    STANDARD_TRAITS,
};

// Re-export the request adapter shapes
pub use requests::{
    AllocationReplacePlan, ConsumerAllocationSet, GroupPolicy, ParsedRequest, ParsedRequestGroup,
    PlacementRequest, ProviderAllocations, RequestGroup,
};

// Re-export candidate generation
pub use candidates::{
    AllocationCandidates, AllocationEntry, AllocationRequest, ProviderSummary, SummaryResource,
};
pub use matcher::{allocation_candidates, find_candidates, match_one};

// Re-export builders
pub use builders::{simple_request, InventoryBuilder, RequestBuilder};

// Re-export configuration
pub use config::PlacementConfig;

// Re-export observability entry points
pub use observability::{
    init_logging, init_logging_with_level, log_operation, operation_counters, Operation,
    OperationCounters,
};
