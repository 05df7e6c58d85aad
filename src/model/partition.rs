//! Per-partition storage: node arrays and mechanism instance lists.

use std::sync::Arc;

use super::types::{Handle, InstanceRef, MechTypeId, NodeId, PartitionId, SplitKey};
use crate::mechanisms::{field_index, Mechanism};

/// Extracellular layer storage for the nodes of one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct Extracellular {
    /// Layers per node
    pub nlayer: usize,
    /// Whether each node carries the layers
    pub present: Vec<bool>,
    /// Layer potentials, `node * nlayer + layer`
    pub v: Vec<f64>,
    /// Layer right-hand sides, same indexing as `v`
    pub rhs: Vec<f64>,
}

impl Extracellular {
    pub fn new(nlayer: usize) -> Self {
        Self {
            nlayer,
            present: Vec::new(),
            v: Vec::new(),
            rhs: Vec::new(),
        }
    }

    fn push(&mut self, present: bool) {
        self.present.push(present);
        self.v.extend(std::iter::repeat(0.0).take(self.nlayer));
        self.rhs.extend(std::iter::repeat(0.0).take(self.nlayer));
    }

    /// Flat index of a layer at a node, if that node carries layers.
    pub fn index(&self, node: NodeId, layer: usize) -> Option<usize> {
        match self.present.get(node.0) {
            Some(true) if layer < self.nlayer => Some(node.0 * self.nlayer + layer),
            _ => None,
        }
    }

    /// Number of nodes carrying layers.
    pub fn node_count(&self) -> usize {
        self.present.iter().filter(|&&p| p).count()
    }
}

/// Tree-ordered node storage.
///
/// Roots occupy `0..root_end`; every other node has a parent with a smaller
/// index. The off-diagonals follow the tree matrix convention: `a[i]` couples
/// node `i` into its parent's row, `b[i]` couples the parent into row `i`.
/// For a plain axial conductance `g` both equal `-g`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NodeArrays {
    /// Membrane potential (mV)
    pub v: Vec<f64>,
    /// Right-hand side / current accumulator (nA)
    pub rhs: Vec<f64>,
    /// Matrix diagonal (uS)
    pub d: Vec<f64>,
    pub a: Vec<f64>,
    pub b: Vec<f64>,
    pub parent: Vec<Option<usize>>,
    /// Membrane capacitance (nF), exactly zero for algebraic nodes
    pub cm: Vec<f64>,
    /// Potential assigned on initialization
    pub v_init: Vec<f64>,
    /// Internal calcium concentration (mM)
    pub cai: Vec<f64>,
    pub root_end: usize,
    /// Split key of each root (always `None` for non-roots)
    pub split: Vec<Option<SplitKey>>,
    pub ext: Option<Extracellular>,
}

/// Resting calcium concentration written to new nodes.
const DEFAULT_CAI: f64 = 5e-5;

impl NodeArrays {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.v.len()
    }

    pub fn is_empty(&self) -> bool {
        self.v.is_empty()
    }

    pub fn is_root(&self, i: usize) -> bool {
        i < self.root_end
    }

    pub fn has_capacitance(&self, i: usize) -> bool {
        self.cm[i] != 0.0
    }

    /// Append a root. Roots must be pushed before any other node.
    pub fn push_root(&mut self, cm: f64, v: f64, split: Option<SplitKey>) -> NodeId {
        debug_assert_eq!(self.root_end, self.len(), "roots must precede other nodes");
        let id = self.push(None, 0.0, cm, v);
        self.split[id.0] = split;
        self.root_end += 1;
        id
    }

    /// Append a child of `parent` connected by axial conductance `g` (uS).
    pub fn push_child(&mut self, parent: NodeId, g: f64, cm: f64, v: f64) -> NodeId {
        self.push(Some(parent.0), g, cm, v)
    }

    fn push(&mut self, parent: Option<usize>, g: f64, cm: f64, v: f64) -> NodeId {
        let id = NodeId(self.len());
        self.v.push(v);
        self.rhs.push(0.0);
        self.d.push(0.0);
        self.a.push(-g);
        self.b.push(-g);
        self.parent.push(parent);
        self.cm.push(cm);
        self.v_init.push(v);
        self.cai.push(DEFAULT_CAI);
        self.split.push(None);
        if let Some(ext) = self.ext.as_mut() {
            ext.push(false);
        }
        id
    }

    /// Attach extracellular layers to every node flagged in `present`.
    pub fn attach_extracellular(&mut self, nlayer: usize, present: &[bool]) {
        let mut ext = Extracellular::new(nlayer);
        for i in 0..self.len() {
            ext.push(present.get(i).copied().unwrap_or(false));
        }
        self.ext = Some(ext);
    }

    /// Number of nodes carrying extracellular layers.
    pub fn extracellular_nodes(&self) -> usize {
        self.ext.as_ref().map_or(0, Extracellular::node_count)
    }
}

/// Per-instance field table of one mechanism type.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Instances {
    /// Node each instance is located at
    pub nodes: Vec<NodeId>,
    /// Row-major field table, `width` values per instance
    pub data: Vec<f64>,
    pub width: usize,
    pub names: Vec<String>,
}

impl Instances {
    pub fn new(width: usize) -> Self {
        Self {
            width,
            ..Self::default()
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Flat offset of a field of one instance.
    pub fn offset(&self, instance: usize, field: usize) -> usize {
        instance * self.width + field
    }

    pub fn row(&self, instance: usize) -> &[f64] {
        let start = instance * self.width;
        &self.data[start..start + self.width]
    }

    pub fn row_mut(&mut self, instance: usize) -> &mut [f64] {
        let start = instance * self.width;
        &mut self.data[start..start + self.width]
    }

    pub fn push(&mut self, node: NodeId, name: impl Into<String>, row: &[f64]) -> usize {
        debug_assert_eq!(row.len(), self.width);
        self.nodes.push(node);
        self.names.push(name.into());
        self.data.extend_from_slice(row);
        self.nodes.len() - 1
    }

    pub fn position(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }
}

/// All instances of one mechanism type in a partition.
#[derive(Debug, Clone)]
pub struct MechList {
    pub type_id: MechTypeId,
    pub mechanism: Arc<dyn Mechanism>,
    pub instances: Instances,
}

impl MechList {
    pub fn new(type_id: MechTypeId, mechanism: Arc<dyn Mechanism>) -> Self {
        let width = mechanism.fields().len();
        Self {
            type_id,
            mechanism,
            instances: Instances::new(width),
        }
    }
}

/// An independently assembled subset of the model.
#[derive(Debug, Clone)]
pub struct Partition {
    pub id: PartitionId,
    pub nodes: NodeArrays,
    pub node_names: Vec<String>,
    /// Sorted by type id; instances keep insertion order
    pub mech_lists: Vec<MechList>,
}

impl Partition {
    pub fn new(id: PartitionId) -> Self {
        Self {
            id,
            nodes: NodeArrays::new(),
            node_names: Vec::new(),
            mech_lists: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.mech_lists.iter().all(|ml| ml.instances.is_empty())
    }

    pub fn find_node(&self, name: &str) -> Option<NodeId> {
        self.node_names.iter().position(|n| n == name).map(NodeId)
    }

    pub fn node_name(&self, node: NodeId) -> &str {
        &self.node_names[node.0]
    }

    /// Insert an instance, creating the type's list at its sorted position.
    pub fn insert_instance(
        &mut self,
        type_id: MechTypeId,
        mechanism: &Arc<dyn Mechanism>,
        node: NodeId,
        name: impl Into<String>,
        row: &[f64],
    ) -> InstanceRef {
        let list = match self.mech_lists.binary_search_by_key(&type_id, |ml| ml.type_id) {
            Ok(list) => list,
            Err(list) => {
                self.mech_lists
                    .insert(list, MechList::new(type_id, Arc::clone(mechanism)));
                list
            }
        };
        let index = self.mech_lists[list].instances.push(node, name, row);
        InstanceRef { list, index }
    }

    /// Find an instance by name.
    pub fn find_instance(&self, name: &str) -> Option<InstanceRef> {
        self.mech_lists.iter().enumerate().find_map(|(list, ml)| {
            ml.instances
                .position(name)
                .map(|index| InstanceRef { list, index })
        })
    }

    /// Handle to a named field of a named instance.
    pub fn field_handle(&self, instance: &str, field: &str) -> Option<Handle> {
        let at = self.find_instance(instance)?;
        let ml = &self.mech_lists[at.list];
        let f = field_index(ml.mechanism.as_ref(), field)?;
        Some(Handle::Field {
            list: at.list,
            offset: ml.instances.offset(at.index, f),
        })
    }

    /// Whether a handle resolves to storage in this partition.
    pub fn contains(&self, handle: Handle) -> bool {
        self.get(handle).is_some()
    }

    pub fn get(&self, handle: Handle) -> Option<f64> {
        match handle {
            Handle::Voltage(n) => self.nodes.v.get(n.0).copied(),
            Handle::Rhs(n) => self.nodes.rhs.get(n.0).copied(),
            Handle::ExtVoltage { node, layer } => {
                let ext = self.nodes.ext.as_ref()?;
                ext.index(node, layer).map(|i| ext.v[i])
            }
            Handle::ExtRhs { node, layer } => {
                let ext = self.nodes.ext.as_ref()?;
                ext.index(node, layer).map(|i| ext.rhs[i])
            }
            Handle::Field { list, offset } => self
                .mech_lists
                .get(list)
                .and_then(|ml| ml.instances.data.get(offset))
                .copied(),
        }
    }

    pub fn slot_mut(&mut self, handle: Handle) -> Option<&mut f64> {
        match handle {
            Handle::Voltage(n) => self.nodes.v.get_mut(n.0),
            Handle::Rhs(n) => self.nodes.rhs.get_mut(n.0),
            Handle::ExtVoltage { node, layer } => {
                let ext = self.nodes.ext.as_mut()?;
                let i = ext.index(node, layer)?;
                ext.v.get_mut(i)
            }
            Handle::ExtRhs { node, layer } => {
                let ext = self.nodes.ext.as_mut()?;
                let i = ext.index(node, layer)?;
                ext.rhs.get_mut(i)
            }
            Handle::Field { list, offset } => self
                .mech_lists
                .get_mut(list)
                .and_then(|ml| ml.instances.data.get_mut(offset)),
        }
    }

    /// Write through a handle. Returns false if the handle does not resolve.
    pub fn set(&mut self, handle: Handle, value: f64) -> bool {
        match self.slot_mut(handle) {
            Some(slot) => {
                *slot = value;
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanisms::{ExpSyn, Passive};

    fn two_node() -> Partition {
        let mut p = Partition::new(PartitionId(0));
        let soma = p.nodes.push_root(1.0, -65.0, None);
        p.nodes.push_child(soma, 0.5, 0.0, -65.0);
        p.node_names = vec!["soma".into(), "dend".into()];
        p
    }

    #[test]
    fn test_tree_order_and_coefficients() {
        let p = two_node();
        assert_eq!(p.nodes.root_end, 1);
        assert_eq!(p.nodes.parent, vec![None, Some(0)]);
        assert_eq!(p.nodes.a[1], -0.5);
        assert!(p.nodes.has_capacitance(0));
        assert!(!p.nodes.has_capacitance(1));
    }

    #[test]
    fn test_mech_lists_stay_sorted_by_type() {
        let mut p = two_node();
        let syn: Arc<dyn Mechanism> = Arc::new(ExpSyn);
        let pas: Arc<dyn Mechanism> = Arc::new(Passive);
        p.insert_instance(MechTypeId(4), &syn, NodeId(1), "syn", &[2.0, 0.0, 0.0, 0.0, 0.0]);
        let at = p.insert_instance(MechTypeId(0), &pas, NodeId(0), "leak", &[0.01, -65.0, 0.0]);
        assert_eq!(at, InstanceRef { list: 0, index: 0 });
        assert_eq!(p.mech_lists[1].type_id, MechTypeId(4));
        assert_eq!(p.find_instance("syn"), Some(InstanceRef { list: 1, index: 0 }));
    }

    #[test]
    fn test_handles_resolve_and_reject() {
        let mut p = two_node();
        let pas: Arc<dyn Mechanism> = Arc::new(Passive);
        p.insert_instance(MechTypeId(0), &pas, NodeId(0), "leak", &[0.01, -65.0, 0.0]);

        let h = p.field_handle("leak", "e").unwrap();
        assert_eq!(p.get(h), Some(-65.0));
        assert!(p.set(h, -70.0));
        assert_eq!(p.get(h), Some(-70.0));

        assert!(p.contains(Handle::Voltage(NodeId(1))));
        assert!(!p.contains(Handle::Voltage(NodeId(2))));
        assert!(!p.contains(Handle::Field { list: 0, offset: 3 }));
        assert!(!p.contains(Handle::ExtVoltage { node: NodeId(0), layer: 0 }));
    }

    #[test]
    fn test_extracellular_only_on_flagged_nodes() {
        let mut p = two_node();
        p.nodes.attach_extracellular(2, &[true, false]);
        assert!(p.contains(Handle::ExtVoltage { node: NodeId(0), layer: 1 }));
        assert!(!p.contains(Handle::ExtVoltage { node: NodeId(0), layer: 2 }));
        assert!(!p.contains(Handle::ExtRhs { node: NodeId(1), layer: 0 }));
        assert_eq!(p.nodes.extracellular_nodes(), 1);
    }
}
