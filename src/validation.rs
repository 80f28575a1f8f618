// Leaf validation functions shared across the crate.
// Grouped by area so callers can pull in exactly what they need.

use crate::errors::{PlacementError, Result};

/// Name validation for resource classes and traits.
pub mod names {
    use super::*;
    use once_cell::sync::Lazy;
    use regex::Regex;

    /// Prefix required on caller-defined classes and traits.
    pub const CUSTOM_PREFIX: &str = "CUSTOM_";

    pub const MAX_NAME_LENGTH: usize = 255;

    static NAME_PATTERN: Lazy<Regex> =
        Lazy::new(|| Regex::new(r"^[A-Z0-9_]+$").expect("name pattern is valid"));

    /// Validate a resource class or trait name.
    ///
    /// Names are upper-case alphanumerics and underscores, non-empty,
    /// at most 255 characters.
    pub fn validate_name(name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(PlacementError::invalid("name cannot be empty"));
        }
        if name.len() > MAX_NAME_LENGTH {
            return Err(PlacementError::invalid(format!(
                "name {name:.32} exceeds {MAX_NAME_LENGTH} characters"
            )));
        }
        if !NAME_PATTERN.is_match(name) {
            return Err(PlacementError::invalid(format!(
                "name {name} must match ^[A-Z0-9_]+$"
            )));
        }
        Ok(())
    }

    /// Validate a custom name: same charset rules plus the CUSTOM_ prefix.
    pub fn validate_custom_name(name: &str) -> Result<()> {
        validate_name(name)?;
        if !name.starts_with(CUSTOM_PREFIX) {
            return Err(PlacementError::invalid(format!(
                "custom name {name} must start with {CUSTOM_PREFIX}"
            )));
        }
        Ok(())
    }

    /// Validate an external string id (project, user, consumer type).
    pub fn validate_external_id(label: &str, value: &str) -> Result<()> {
        if value.is_empty() {
            return Err(PlacementError::invalid(format!("{label} cannot be empty")));
        }
        if value.len() > MAX_NAME_LENGTH {
            return Err(PlacementError::invalid(format!(
                "{label} exceeds {MAX_NAME_LENGTH} characters"
            )));
        }
        Ok(())
    }
}

/// Inventory field constraints.
pub mod inventory {
    use super::*;

    /// Check the cross-field constraints of one inventory record.
    ///
    /// # Invariants
    /// - `0 <= reserved <= total`
    /// - `min_unit >= 1`, `step_size >= 1`
    /// - `1 <= max_unit <= total` and `min_unit <= max_unit`
    /// - `allocation_ratio` finite and `> 0`
    pub fn validate_fields(
        total: i64,
        reserved: i64,
        min_unit: i64,
        max_unit: i64,
        step_size: i64,
        allocation_ratio: f64,
    ) -> Result<()> {
        if total < 1 {
            return Err(PlacementError::invalid("inventory total must be >= 1"));
        }
        if reserved < 0 || reserved > total {
            return Err(PlacementError::invalid(format!(
                "reserved {reserved} must be within [0, total {total}]"
            )));
        }
        if min_unit < 1 {
            return Err(PlacementError::invalid("min_unit must be >= 1"));
        }
        if max_unit < 1 || max_unit > total {
            return Err(PlacementError::invalid(format!(
                "max_unit {max_unit} must be within [1, total {total}]"
            )));
        }
        if min_unit > max_unit {
            return Err(PlacementError::invalid(format!(
                "min_unit {min_unit} must be <= max_unit {max_unit}"
            )));
        }
        if step_size < 1 {
            return Err(PlacementError::invalid("step_size must be >= 1"));
        }
        if !allocation_ratio.is_finite() || allocation_ratio <= 0.0 {
            return Err(PlacementError::invalid(
                "allocation_ratio must be finite and > 0",
            ));
        }
        Ok(())
    }
}

/// Request-shape constraints enforced at the adapter boundary.
pub mod request {
    use super::*;

    pub fn validate_amount(class_name: &str, amount: i64) -> Result<()> {
        if amount < 1 {
            return Err(PlacementError::invalid(format!(
                "requested amount for {class_name} must be >= 1, got {amount}"
            )));
        }
        Ok(())
    }

    pub fn validate_limit(limit: i64) -> Result<()> {
        if limit < 1 {
            return Err(PlacementError::invalid(format!(
                "limit must be a positive integer, got {limit}"
            )));
        }
        Ok(())
    }

    /// Each inner member_of set must be non-empty: an empty OR-set can
    /// never be satisfied and is a caller mistake rather than a miss.
    pub fn validate_member_of(member_of: &[Vec<uuid::Uuid>]) -> Result<()> {
        for set in member_of {
            if set.is_empty() {
                return Err(PlacementError::invalid(
                    "member_of contains an empty aggregate set",
                ));
            }
        }
        Ok(())
    }
}
