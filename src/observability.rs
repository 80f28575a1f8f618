// Centralized observability infrastructure.
// Structured logging setup plus a typed Operation vocabulary so every
// log line about a placement operation carries the same fields.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

// Global atomic counters for coarse metrics
static MATCH_COUNTER: AtomicU64 = AtomicU64::new(0);
static COMMIT_COUNTER: AtomicU64 = AtomicU64::new(0);
static CONFLICT_COUNTER: AtomicU64 = AtomicU64::new(0);
static MUTATION_COUNTER: AtomicU64 = AtomicU64::new(0);
static ERROR_COUNTER: AtomicU64 = AtomicU64::new(0);

/// Initialize the logging and tracing infrastructure.
/// Call once at application startup.
pub fn init_logging() -> Result<()> {
    init_logging_with_level(false, false)
}

/// Initialize logging with configurable verbosity.
pub fn init_logging_with_level(verbose: bool, quiet: bool) -> Result<()> {
    let filter_level = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("placedb=debug,info")
    } else {
        EnvFilter::new("placedb=warn,error")
    };

    // Quiet always wins; otherwise RUST_LOG may override the flags.
    let env_filter = if quiet {
        EnvFilter::new("error")
    } else if std::env::var("RUST_LOG").is_ok() {
        EnvFilter::try_from_default_env().unwrap_or(filter_level)
    } else {
        filter_level
    };

    let fmt_layer = tracing_subscriber::fmt::layer()
        .with_target(!quiet)
        .with_ansi(true);

    match tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt_layer)
        .try_init()
    {
        Ok(()) => {
            if !quiet {
                info!("placedb observability initialized");
            }
            Ok(())
        }
        // Already initialized, which is fine in test environments
        Err(_) => Ok(()),
    }
}

/// The operations worth a structured log line.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Operation {
    CandidateSearch {
        groups: usize,
        candidates: usize,
    },
    AllocationCommit {
        consumers: usize,
    },
    AllocationConflict {
        identifier: String,
    },
    ProviderCreate {
        uuid: Uuid,
    },
    ProviderUpdate {
        uuid: Uuid,
    },
    ProviderDelete {
        uuid: Uuid,
    },
    InventoryReplace {
        uuid: Uuid,
        classes: usize,
    },
    RegistryChange {
        name: String,
    },
}

impl Operation {
    fn counter(&self) -> &'static AtomicU64 {
        match self {
            Operation::CandidateSearch { .. } => &MATCH_COUNTER,
            Operation::AllocationCommit { .. } => &COMMIT_COUNTER,
            Operation::AllocationConflict { .. } => &CONFLICT_COUNTER,
            _ => &MUTATION_COUNTER,
        }
    }
}

/// Log one operation outcome and maintain the counters.
pub fn log_operation<T, E: std::fmt::Display>(
    operation: &Operation,
    result: &std::result::Result<T, E>,
) {
    operation.counter().fetch_add(1, Ordering::Relaxed);
    match result {
        Ok(_) => info!(op = ?operation, "operation succeeded"),
        Err(e) => {
            ERROR_COUNTER.fetch_add(1, Ordering::Relaxed);
            error!(op = ?operation, error = %e, "operation failed");
        }
    }
}

/// Counter snapshot for health endpoints and tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationCounters {
    pub matches: u64,
    pub commits: u64,
    pub conflicts: u64,
    pub mutations: u64,
    pub errors: u64,
}

pub fn operation_counters() -> OperationCounters {
    OperationCounters {
        matches: MATCH_COUNTER.load(Ordering::Relaxed),
        commits: COMMIT_COUNTER.load(Ordering::Relaxed),
        conflicts: CONFLICT_COUNTER.load(Ordering::Relaxed),
        mutations: MUTATION_COUNTER.load(Ordering::Relaxed),
        errors: ERROR_COUNTER.load(Ordering::Relaxed),
    }
}
