//! Core identifier and handle types for the cable model.

use std::fmt;

/// Index of a node inside its partition's node arrays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(pub usize);

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "N{}", self.0)
    }
}

/// Index of a partition (thread-local or distributed subdomain).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PartitionId(pub usize);

impl fmt::Display for PartitionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "P{}", self.0)
    }
}

/// Index of a mechanism type in the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MechTypeId(pub usize);

impl fmt::Display for MechTypeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "M{}", self.0)
    }
}

/// Identifier shared by root copies of one physical node that has been split
/// across partitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SplitKey(pub u64);

/// Location of a mechanism instance: its list inside the partition and its
/// position in that list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InstanceRef {
    pub list: usize,
    pub index: usize,
}

/// Reference to one `f64` storage location inside a partition.
///
/// Node arrays own voltage and right-hand-side storage; mechanism instance
/// lists own their private fields. Handles are plain indices checked on every
/// access, so they never dangle. Assembly hands out a fresh set after each
/// structure change, and inserting a mechanism list moves later field
/// handles with [`Handle::after_list_insert`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Handle {
    /// Membrane potential of a node
    Voltage(NodeId),
    /// Right-hand-side (derivative) slot of a node
    Rhs(NodeId),
    /// Potential of an extracellular layer at a node
    ExtVoltage { node: NodeId, layer: usize },
    /// Right-hand-side slot of an extracellular layer at a node
    ExtRhs { node: NodeId, layer: usize },
    /// A mechanism field: list index and flat offset into its field table
    Field { list: usize, offset: usize },
}

impl Handle {
    /// The same storage after a mechanism list was inserted at index `at`.
    pub fn after_list_insert(self, at: usize) -> Self {
        match self {
            Handle::Field { list, offset } if list >= at => Handle::Field { list: list + 1, offset },
            other => other,
        }
    }
}

impl fmt::Display for Handle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Handle::Voltage(n) => write!(f, "v[{}]", n),
            Handle::Rhs(n) => write!(f, "rhs[{}]", n),
            Handle::ExtVoltage { node, layer } => write!(f, "vext{}[{}]", layer, node),
            Handle::ExtRhs { node, layer } => write!(f, "rhsext{}[{}]", layer, node),
            Handle::Field { list, offset } => write!(f, "ml{}[{}]", list, offset),
        }
    }
}
