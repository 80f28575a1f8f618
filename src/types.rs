// Validated Types
// Strongly-typed wrappers that enforce invariants at construction time.
// These types cannot be built with invalid data, so the store and matcher
// never re-check what the boundary already proved.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::errors::{PlacementError, Result};
use crate::validation;

/// Internal integer id of a resource provider row.
pub type ProviderId = i32;

/// Internal integer id of a resource class.
pub type ClassId = i32;

/// Internal integer id of a trait.
pub type TraitId = i32;

/// A resource class name that has passed charset and prefix checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResourceClassName {
    inner: String,
}

impl ResourceClassName {
    /// Create a validated class name.
    ///
    /// # Invariants
    /// - Matches `^[A-Z0-9_]+$`, at most 255 characters
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validation::names::validate_name(&name)?;
        Ok(Self { inner: name })
    }

    /// Create a validated custom class name (`CUSTOM_` prefix required).
    pub fn new_custom(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validation::names::validate_custom_name(&name)?;
        Ok(Self { inner: name })
    }

    pub fn is_custom(&self) -> bool {
        self.inner.starts_with(validation::names::CUSTOM_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for ResourceClassName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A trait name that has passed charset and prefix checks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TraitName {
    inner: String,
}

impl TraitName {
    /// Create a validated trait name; same naming discipline as classes.
    pub fn new(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validation::names::validate_name(&name)?;
        Ok(Self { inner: name })
    }

    /// Create a validated custom trait name (`CUSTOM_` prefix required).
    pub fn new_custom(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        validation::names::validate_custom_name(&name)?;
        Ok(Self { inner: name })
    }

    pub fn is_custom(&self) -> bool {
        self.inner.starts_with(validation::names::CUSTOM_PREFIX)
    }

    pub fn as_str(&self) -> &str {
        &self.inner
    }
}

impl fmt::Display for TraitName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A resource provider uuid, guaranteed non-nil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProviderUuid {
    inner: Uuid,
}

impl ProviderUuid {
    pub fn generate() -> Self {
        Self {
            inner: Uuid::new_v4(),
        }
    }

    pub fn from_uuid(id: Uuid) -> Result<Self> {
        if id.is_nil() {
            return Err(PlacementError::invalid("provider uuid cannot be nil"));
        }
        Ok(Self { inner: id })
    }

    pub fn parse(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s)
            .map_err(|e| PlacementError::invalid(format!("bad provider uuid {s}: {e}")))?;
        Self::from_uuid(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.inner
    }
}

impl fmt::Display for ProviderUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A consumer uuid, guaranteed non-nil.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConsumerUuid {
    inner: Uuid,
}

impl ConsumerUuid {
    pub fn generate() -> Self {
        Self {
            inner: Uuid::new_v4(),
        }
    }

    pub fn from_uuid(id: Uuid) -> Result<Self> {
        if id.is_nil() {
            return Err(PlacementError::invalid("consumer uuid cannot be nil"));
        }
        Ok(Self { inner: id })
    }

    pub fn parse(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s)
            .map_err(|e| PlacementError::invalid(format!("bad consumer uuid {s}: {e}")))?;
        Self::from_uuid(uuid)
    }

    pub fn as_uuid(&self) -> Uuid {
        self.inner
    }
}

impl fmt::Display for ConsumerUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// An aggregate label. Opaque: aggregates exist only as membership tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AggregateUuid {
    inner: Uuid,
}

impl AggregateUuid {
    pub fn generate() -> Self {
        Self {
            inner: Uuid::new_v4(),
        }
    }

    pub fn from_uuid(id: Uuid) -> Result<Self> {
        if id.is_nil() {
            return Err(PlacementError::invalid("aggregate uuid cannot be nil"));
        }
        Ok(Self { inner: id })
    }

    pub fn as_uuid(&self) -> Uuid {
        self.inner
    }
}

impl fmt::Display for AggregateUuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A monotonically advancing 32-bit version counter.
///
/// Every mutation of a provider or consumer bumps its generation by one.
/// The counter wraps at `u32::MAX`; a stale writer is only fooled after
/// exactly 2^32 interleaved mutations, which is out of reach for any
/// reasonable process lifetime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default,
)]
pub struct Generation {
    inner: u32,
}

impl Generation {
    pub fn initial() -> Self {
        Self { inner: 0 }
    }

    pub fn from_value(value: u32) -> Self {
        Self { inner: value }
    }

    #[must_use]
    pub fn next(self) -> Self {
        Self {
            inner: self.inner.wrapping_add(1),
        }
    }

    pub fn value(self) -> u32 {
        self.inner
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner)
    }
}

/// A positive requested amount of one resource class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RequestedAmount {
    inner: i64,
}

impl RequestedAmount {
    pub fn new(amount: i64) -> Result<Self> {
        if amount < 1 {
            return Err(PlacementError::invalid(format!(
                "requested amount must be >= 1, got {amount}"
            )));
        }
        Ok(Self { inner: amount })
    }

    pub fn get(self) -> i64 {
        self.inner
    }
}
