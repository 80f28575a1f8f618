// Resource class and trait registries.
// Both are interning tables: name <-> stable integer id. Standard entries
// are seeded at construction; custom entries (CUSTOM_ prefix) are created
// on first use and may be deleted again once nothing references them.

use std::collections::HashMap;

use crate::errors::{EntityKind, PlacementError, Result};
use crate::types::{ClassId, ResourceClassName, TraitId, TraitName};
use crate::validation::names::CUSTOM_PREFIX;

/// Trait marking a provider as sharing its inventory with any provider
/// it has an aggregate in common with.
pub const MISC_SHARES_VIA_AGGREGATE: &str = "MISC_SHARES_VIA_AGGREGATE";

/// Resource classes every registry starts with. Their ids are their index
/// in this table and never change.
pub const STANDARD_RESOURCE_CLASSES: &[&str] = &[
    "VCPU",
    "MEMORY_MB",
    "DISK_GB",
    "PCI_DEVICE",
    "SRIOV_NET_VF",
    "NUMA_SOCKET",
    "NUMA_CORE",
    "NUMA_THREAD",
    "NUMA_MEMORY_MB",
    "IPV4_ADDRESS",
    "VGPU",
    "VGPU_DISPLAY_HEAD",
    "NET_BW_EGR_KILOBIT_PER_SEC",
    "NET_BW_IGR_KILOBIT_PER_SEC",
    "PCPU",
    "MEM_ENCRYPTION_CONTEXT",
    "FPGA",
    "PGPU",
];

/// Traits every registry starts with.
pub const STANDARD_TRAITS: &[&str] = &[
    "COMPUTE_VOLUME_MULTI_ATTACH",
    "COMPUTE_TRUSTED_CERTS",
    "COMPUTE_NET_ATTACH_INTERFACE",
    "HW_CPU_X86_AVX2",
    "HW_CPU_X86_SSE",
    "HW_NIC_OFFLOAD_GENEVE",
    "HW_NIC_SRIOV",
    "HW_GPU_API_VULKAN",
    "STORAGE_DISK_SSD",
    "STORAGE_DISK_HDD",
    MISC_SHARES_VIA_AGGREGATE,
];

/// Custom entries get ids from this base upward so standard ids stay
/// stable across releases that extend the standard tables.
const CUSTOM_ID_BASE: i32 = 1000;

/// Interning table shared by both registries.
#[derive(Debug, Clone)]
struct SymbolTable {
    kind: EntityKind,
    by_name: HashMap<String, i32>,
    by_id: HashMap<i32, String>,
    next_custom_id: i32,
}

impl SymbolTable {
    fn seeded(kind: EntityKind, standard: &[&str]) -> Self {
        let mut by_name = HashMap::with_capacity(standard.len());
        let mut by_id = HashMap::with_capacity(standard.len());
        for (id, name) in standard.iter().enumerate() {
            by_name.insert((*name).to_string(), id as i32);
            by_id.insert(id as i32, (*name).to_string());
        }
        Self {
            kind,
            by_name,
            by_id,
            next_custom_id: CUSTOM_ID_BASE,
        }
    }

    /// Look up or create. Unknown names must carry the CUSTOM_ prefix;
    /// an unknown standard-looking name is a caller error, not an insert.
    fn ensure(&mut self, name: &str) -> Result<i32> {
        if let Some(id) = self.by_name.get(name) {
            return Ok(*id);
        }
        if !name.starts_with(CUSTOM_PREFIX) {
            return Err(PlacementError::invalid(format!(
                "unknown {} {name}: new entries must start with {CUSTOM_PREFIX}",
                self.kind
            )));
        }
        let id = self.next_custom_id;
        self.next_custom_id += 1;
        self.by_name.insert(name.to_string(), id);
        self.by_id.insert(id, name.to_string());
        Ok(id)
    }

    fn id_of(&self, name: &str) -> Result<i32> {
        self.by_name
            .get(name)
            .copied()
            .ok_or_else(|| PlacementError::not_found(self.kind, name))
    }

    fn name_of(&self, id: i32) -> Result<String> {
        self.by_id
            .get(&id)
            .cloned()
            .ok_or_else(|| PlacementError::not_found(self.kind, format!("id {id}")))
    }

    fn list(&self) -> Vec<(i32, String)> {
        let mut entries: Vec<(i32, String)> =
            self.by_id.iter().map(|(id, n)| (*id, n.clone())).collect();
        entries.sort();
        entries
    }

    /// Remove a custom entry. Standard entries are permanent. The caller
    /// is responsible for the nothing-references-it check.
    fn remove_custom(&mut self, name: &str) -> Result<i32> {
        let id = self.id_of(name)?;
        if !name.starts_with(CUSTOM_PREFIX) {
            return Err(PlacementError::invalid(format!(
                "standard {} {name} cannot be deleted",
                self.kind
            )));
        }
        self.by_name.remove(name);
        self.by_id.remove(&id);
        Ok(id)
    }

    fn contains_id(&self, id: i32) -> bool {
        self.by_id.contains_key(&id)
    }
}

/// Canonical list of resource classes plus caller-defined customs.
#[derive(Debug, Clone)]
pub struct ResourceClassRegistry {
    table: SymbolTable,
}

impl Default for ResourceClassRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl ResourceClassRegistry {
    pub fn new() -> Self {
        Self {
            table: SymbolTable::seeded(EntityKind::ResourceClass, STANDARD_RESOURCE_CLASSES),
        }
    }

    pub fn ensure(&mut self, name: &ResourceClassName) -> Result<ClassId> {
        self.table.ensure(name.as_str())
    }

    pub fn id_of(&self, name: &str) -> Result<ClassId> {
        self.table.id_of(name)
    }

    pub fn name_of(&self, id: ClassId) -> Result<String> {
        self.table.name_of(id)
    }

    pub fn list(&self) -> Vec<(ClassId, String)> {
        self.table.list()
    }

    pub fn remove_custom(&mut self, name: &str) -> Result<ClassId> {
        self.table.remove_custom(name)
    }

    pub fn contains_id(&self, id: ClassId) -> bool {
        self.table.contains_id(id)
    }
}

/// Canonical list of traits plus caller-defined customs.
#[derive(Debug, Clone)]
pub struct TraitRegistry {
    table: SymbolTable,
}

impl Default for TraitRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl TraitRegistry {
    pub fn new() -> Self {
        Self {
            table: SymbolTable::seeded(EntityKind::Trait, STANDARD_TRAITS),
        }
    }

    pub fn ensure(&mut self, name: &TraitName) -> Result<TraitId> {
        self.table.ensure(name.as_str())
    }

    pub fn id_of(&self, name: &str) -> Result<TraitId> {
        self.table.id_of(name)
    }

    pub fn name_of(&self, id: TraitId) -> Result<String> {
        self.table.name_of(id)
    }

    pub fn list(&self) -> Vec<(TraitId, String)> {
        self.table.list()
    }

    pub fn remove_custom(&mut self, name: &str) -> Result<TraitId> {
        self.table.remove_custom(name)
    }

    pub fn contains_id(&self, id: TraitId) -> bool {
        self.table.contains_id(id)
    }

    /// Id of the sharing marker trait; seeded, so the lookup cannot fail.
    pub fn sharing_trait_id(&self) -> TraitId {
        self.table
            .id_of(MISC_SHARES_VIA_AGGREGATE)
            .expect("sharing trait is seeded")
    }
}
