//! Algebraic (zero-capacitance) node resolution.
//!
//! A node with exactly zero capacitance has no voltage equation. Before every
//! derivative evaluation its potential is set from local current balance,
//! linearized around the previous potential:
//!
//! ```text
//! (g + sum g_axial) * v = g * v_old - i(v_old) + sum g_axial * v_neighbour
//! ```
//!
//! Only point processes contribute `i` and `g` here; density mechanisms carry
//! no current at a node without membrane area.

use super::evaluator::FaultLog;
use super::FaultPhase;
use crate::mechanisms::StepContext;
use crate::model::{NodeArrays, Partition};

/// Instances of one mechanism list located at algebraic nodes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReducedList {
    /// Index of the list in the partition
    pub list: usize,
    /// Instance indices, in list order
    pub instances: Vec<usize>,
}

/// Algebraic nodes of a partition and the currents acting on them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct NoCapStructure {
    /// Algebraic nodes, ascending
    pub nodes: Vec<usize>,
    /// Nodes whose parent is algebraic
    pub child_nodes: Vec<usize>,
    pub lists: Vec<ReducedList>,
}

impl NoCapStructure {
    /// Derive the algebraic structure of a partition.
    pub fn build(partition: &Partition) -> Self {
        let arrays = &partition.nodes;
        let nodes: Vec<usize> = (0..arrays.len()).filter(|&i| !arrays.has_capacitance(i)).collect();
        let child_nodes = (arrays.root_end..arrays.len())
            .filter(|&i| arrays.parent[i].map_or(false, |p| !arrays.has_capacitance(p)))
            .collect();

        let mut lists = Vec::new();
        if !nodes.is_empty() {
            for (list, ml) in partition.mech_lists.iter().enumerate() {
                if !(ml.mechanism.is_point_process() && ml.mechanism.has_current()) {
                    continue;
                }
                let instances: Vec<usize> = (0..ml.instances.len())
                    .filter(|&k| !arrays.has_capacitance(ml.instances.nodes[k].0))
                    .collect();
                if !instances.is_empty() {
                    lists.push(ReducedList { list, instances });
                }
            }
        }

        Self {
            nodes,
            child_nodes,
            lists,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Local sums of `d` and `rhs` at every algebraic node.
    ///
    /// For a split algebraic root the sums of all copies must be added
    /// together before [`NoCapStructure::finalize`].
    pub fn accumulate(&self, partition: &mut Partition, ctx: &StepContext, log: &mut FaultLog) {
        if self.is_empty() {
            return;
        }
        let Partition { nodes, mech_lists, .. } = partition;
        for &i in &self.nodes {
            nodes.rhs[i] = 0.0;
            nodes.d[i] = 0.0;
        }

        for reduced in &self.lists {
            let ml = &mut mech_lists[reduced.list];
            let Some(current) = ml.mechanism.current() else {
                continue;
            };
            for &k in &reduced.instances {
                let node = ml.instances.nodes[k].0;
                match current.evaluate(ml.instances.row_mut(k), nodes.v[node], ctx) {
                    Ok(sample) => {
                        nodes.rhs[node] -= sample.current;
                        nodes.d[node] += sample.conductance;
                    }
                    Err(e) => log.record(FaultPhase::NoCap, reduced.list, ml.mechanism.name(), k, &e),
                }
            }
        }

        for &i in &self.nodes {
            nodes.rhs[i] += nodes.d[i] * nodes.v[i];
            if let Some(p) = nodes.parent[i] {
                nodes.rhs[i] -= nodes.b[i] * nodes.v[p];
                nodes.d[i] -= nodes.b[i];
            }
        }
        for &c in &self.child_nodes {
            if let Some(p) = nodes.parent[c] {
                nodes.rhs[p] -= nodes.a[c] * nodes.v[c];
                nodes.d[p] -= nodes.a[c];
            }
        }
    }

    /// `v = rhs / d` at every algebraic node. A node with nothing attached
    /// has `d == 0` and keeps its potential.
    pub fn finalize(&self, nodes: &mut NodeArrays) {
        for &i in &self.nodes {
            if nodes.d[i] != 0.0 {
                nodes.v[i] = nodes.rhs[i] / nodes.d[i];
            }
        }
    }

    pub fn resolve(&self, partition: &mut Partition, ctx: &StepContext, log: &mut FaultLog) {
        self.accumulate(partition, ctx, log);
        self.finalize(&mut partition.nodes);
    }
}
