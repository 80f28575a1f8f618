// Error taxonomy for placedb
// Every fallible operation in the crate returns one of these discrete kinds.
// Collaborators (e.g. an HTTP layer) map kinds to status codes; see
// `PlacementError::suggested_http_status`.

use thiserror::Error;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, PlacementError>;

/// What kind of entity a `NotFound` refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntityKind {
    ResourceProvider,
    Consumer,
    ResourceClass,
    Trait,
    Inventory,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EntityKind::ResourceProvider => "resource provider",
            EntityKind::Consumer => "consumer",
            EntityKind::ResourceClass => "resource class",
            EntityKind::Trait => "trait",
            EntityKind::Inventory => "inventory",
        };
        f.write_str(name)
    }
}

/// Structured errors carrying the offending identifier.
///
/// The matcher only ever surfaces `NotFound` (unknown class/trait name) and
/// `Validation`; inventory state that cannot satisfy a request yields an
/// empty candidate set, not an error. The commit engine surfaces
/// `ConcurrentUpdate`, `CapacityExceeded`, `NotFound` and
/// `InvariantViolation`.
#[derive(Debug, Error)]
pub enum PlacementError {
    /// An entity referenced by name or uuid does not exist.
    #[error("{kind} {identifier} not found")]
    NotFound {
        kind: EntityKind,
        identifier: String,
    },

    /// Malformed input: bad names, non-positive amounts, inconsistent
    /// inventory fields, bad aggregate sets.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Generation mismatch on a provider or consumer. Carries the
    /// generation currently stored so the caller can re-read and retry.
    #[error("concurrent update on {entity} {identifier}: expected generation {expected:?}, current is {current}")]
    ConcurrentUpdate {
        entity: EntityKind,
        identifier: String,
        expected: Option<u32>,
        current: u32,
    },

    /// An allocation would push usage past effective capacity.
    #[error("capacity exceeded on provider {provider} for {class}: requested {requested}, available {available}")]
    CapacityExceeded {
        provider: String,
        class: String,
        requested: i64,
        available: i64,
    },

    /// The mutation would strand allocations, create a tree cycle, or
    /// violate a uniqueness constraint.
    #[error("invariant violation: {0}")]
    InvariantViolation(String),

    /// Unexpected store failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl PlacementError {
    pub fn not_found(kind: EntityKind, identifier: impl Into<String>) -> Self {
        PlacementError::NotFound {
            kind,
            identifier: identifier.into(),
        }
    }

    pub fn invalid(message: impl Into<String>) -> Self {
        PlacementError::Validation(message.into())
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        PlacementError::InvariantViolation(message.into())
    }

    /// The HTTP status a transport collaborator would map this kind to.
    pub fn suggested_http_status(&self) -> u16 {
        match self {
            PlacementError::NotFound { .. } => 404,
            PlacementError::Validation(_) => 400,
            PlacementError::ConcurrentUpdate { .. } => 409,
            PlacementError::CapacityExceeded { .. } => 409,
            PlacementError::InvariantViolation(_) => 409,
            PlacementError::Internal(_) => 500,
        }
    }
}
