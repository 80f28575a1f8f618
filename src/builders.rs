// Builder Patterns
// Fluent construction for the two shapes callers assemble by hand most
// often: inventory records (many defaulted fields) and placement
// requests (suffix-keyed groups).

use uuid::Uuid;

use crate::contracts::Inventory;
use crate::errors::{PlacementError, Result};
use crate::requests::{GroupPolicy, ParsedRequest, ParsedRequestGroup};
use crate::types::ClassId;

/// Fluent builder for one inventory record. Only the class and total
/// are required; the rest default the way a plain capacity record is
/// usually written: nothing reserved, unit window [1, total], step 1,
/// ratio 1.0.
pub struct InventoryBuilder {
    resource_class_id: ClassId,
    total: i64,
    reserved: i64,
    min_unit: i64,
    max_unit: Option<i64>,
    step_size: i64,
    allocation_ratio: f64,
}

impl InventoryBuilder {
    pub fn new(resource_class_id: ClassId, total: i64) -> Self {
        Self {
            resource_class_id,
            total,
            reserved: 0,
            min_unit: 1,
            max_unit: None,
            step_size: 1,
            allocation_ratio: 1.0,
        }
    }

    pub fn reserved(mut self, reserved: i64) -> Self {
        self.reserved = reserved;
        self
    }

    pub fn min_unit(mut self, min_unit: i64) -> Self {
        self.min_unit = min_unit;
        self
    }

    pub fn max_unit(mut self, max_unit: i64) -> Self {
        self.max_unit = Some(max_unit);
        self
    }

    pub fn step_size(mut self, step_size: i64) -> Self {
        self.step_size = step_size;
        self
    }

    pub fn allocation_ratio(mut self, allocation_ratio: f64) -> Self {
        self.allocation_ratio = allocation_ratio;
        self
    }

    pub fn build(self) -> Result<Inventory> {
        Inventory::new(
            self.resource_class_id,
            self.total,
            self.reserved,
            self.min_unit,
            self.max_unit.unwrap_or(self.total),
            self.step_size,
            self.allocation_ratio,
        )
    }
}

/// Fluent builder for a ParsedRequest. Groups accumulate in insertion
/// order; the empty suffix is the unnumbered group.
pub struct RequestBuilder {
    request: ParsedRequest,
    current: Option<(String, ParsedRequestGroup)>,
}

impl Default for RequestBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestBuilder {
    pub fn new() -> Self {
        Self {
            request: ParsedRequest::default(),
            current: None,
        }
    }

    /// Start a group with the given suffix. Finishes the previous group.
    pub fn group(mut self, suffix: impl Into<String>) -> Self {
        self.finish_current();
        self.current = Some((suffix.into(), ParsedRequestGroup::default()));
        self
    }

    /// Add a resource to the current group.
    pub fn resource(mut self, class_name: impl Into<String>, amount: i64) -> Result<Self> {
        let group = self.current_group()?;
        group.resources.insert(class_name.into(), amount);
        Ok(self)
    }

    pub fn require_trait(mut self, name: impl Into<String>) -> Result<Self> {
        self.current_group()?.required_traits.insert(name.into());
        Ok(self)
    }

    pub fn forbid_trait(mut self, name: impl Into<String>) -> Result<Self> {
        self.current_group()?.forbidden_traits.insert(name.into());
        Ok(self)
    }

    /// Add one OR-set to the current group's member_of expression.
    pub fn member_of_any(mut self, aggregates: Vec<Uuid>) -> Result<Self> {
        self.current_group()?.member_of.push(aggregates);
        Ok(self)
    }

    pub fn forbid_aggregate(mut self, aggregate: Uuid) -> Result<Self> {
        self.current_group()?.forbidden_aggregates.push(aggregate);
        Ok(self)
    }

    pub fn limit(mut self, limit: i64) -> Self {
        self.request.limit = Some(limit);
        self
    }

    pub fn group_policy(mut self, policy: GroupPolicy) -> Self {
        self.request.group_policy = policy;
        self
    }

    pub fn in_tree(mut self, root: Uuid) -> Self {
        self.request.tree_root = Some(root);
        self
    }

    pub fn randomize(mut self, randomize: bool) -> Self {
        self.request.randomize = randomize;
        self
    }

    pub fn build(mut self) -> Result<ParsedRequest> {
        self.finish_current();
        if self.request.groups.is_empty() {
            return Err(PlacementError::invalid(
                "a placement request needs at least one group",
            ));
        }
        Ok(self.request)
    }

    fn finish_current(&mut self) {
        if let Some((suffix, group)) = self.current.take() {
            self.request.groups.insert(suffix, group);
        }
    }

    fn current_group(&mut self) -> Result<&mut ParsedRequestGroup> {
        self.current
            .as_mut()
            .map(|(_, group)| group)
            .ok_or_else(|| PlacementError::invalid("call group() before adding constraints"))
    }
}

/// Shorthand for the common single-group case: one unnumbered group
/// with the given resources.
pub fn simple_request(resources: &[(&str, i64)]) -> Result<ParsedRequest> {
    let mut builder = RequestBuilder::new().group("");
    for (class_name, amount) in resources {
        builder = builder.resource(*class_name, *amount)?;
    }
    builder.build()
}
