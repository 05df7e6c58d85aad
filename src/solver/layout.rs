//! Equation index assembly.
//!
//! Builds, for one partition, the mapping from flat-vector position to the
//! storage holding that state and its derivative.

use tracing::debug;

use super::LayoutMode;
use crate::error::{DendriteError, Result};
use crate::model::{Handle, NodeId, Partition};

/// What an equation integrates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EquationKind {
    /// Membrane potential of a node
    Voltage,
    /// Potential of one extracellular layer
    Extracellular,
    /// A mechanism ODE state
    State,
}

/// One assembled equation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Equation {
    pub value: Handle,
    pub derivative: Handle,
    pub kind: EquationKind,
    /// Multiplies the global absolute tolerance
    pub scale: f64,
}

/// Equation layout of one partition.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EquationLayout {
    pub mode: LayoutMode,
    /// Handle-backed equations in flat order
    pub equations: Vec<Equation>,
    /// Node voltage equations
    pub nvoltage: usize,
    /// Auxiliary equations appended after the handle-backed ones
    pub aux_count: usize,
    /// Tolerance scales of the auxiliary equations
    pub aux_scales: Vec<f64>,
    /// Start of this partition's slice in the global flat vector
    pub offset: usize,
}

impl EquationLayout {
    /// Equations owned by this partition, auxiliary ones included.
    pub fn size(&self) -> usize {
        self.equations.len() + self.aux_count
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Position of the first auxiliary equation in the partition slice.
    pub fn aux_offset(&self) -> usize {
        self.equations.len()
    }

    /// Local equation index of a handle's value, if the handle is integrated.
    pub fn index_of(&self, handle: Handle) -> Option<usize> {
        self.equations.iter().position(|eq| eq.value == handle)
    }

    /// Absolute tolerances: `atol` times each equation's scale, times `vtol`
    /// for potentials.
    pub fn tolerances(&self, atol: f64, vtol: f64) -> Vec<f64> {
        let mut tol = Vec::with_capacity(self.size());
        for eq in &self.equations {
            let t = match eq.kind {
                EquationKind::Voltage | EquationKind::Extracellular => atol * vtol,
                EquationKind::State => atol * eq.scale,
            };
            tol.push(t);
        }
        tol.extend(self.aux_scales.iter().map(|s| atol * s));
        tol
    }
}

fn voltage(node: usize) -> Equation {
    Equation {
        value: Handle::Voltage(NodeId(node)),
        derivative: Handle::Rhs(NodeId(node)),
        kind: EquationKind::Voltage,
        scale: 1.0,
    }
}

/// Assemble the layout of one partition.
///
/// `aux_scales` holds one tolerance scale per auxiliary equation. Assembly
/// fails with [`DendriteError::InconsistentLayout`] if a mechanism reports
/// handles that disagree with its declared state count or that do not resolve.
pub fn assemble(partition: &Partition, mode: LayoutMode, aux_scales: Vec<f64>) -> Result<EquationLayout> {
    let nodes = &partition.nodes;
    let mut equations = Vec::new();

    match mode {
        LayoutMode::Explicit => {
            if nodes.extracellular_nodes() > 0 {
                return Err(DendriteError::config(format!(
                    "partition {} has extracellular layers, which need the implicit layout",
                    partition.id
                )));
            }
            equations.extend((0..nodes.len()).filter(|&i| nodes.has_capacitance(i)).map(voltage));
        }
        LayoutMode::Implicit => {
            for i in 0..nodes.len() {
                equations.push(voltage(i));
                if let Some(ext) = nodes.ext.as_ref() {
                    if ext.present[i] {
                        for layer in 0..ext.nlayer {
                            let node = NodeId(i);
                            equations.push(Equation {
                                value: Handle::ExtVoltage { node, layer },
                                derivative: Handle::ExtRhs { node, layer },
                                kind: EquationKind::Extracellular,
                                scale: 1.0,
                            });
                        }
                    }
                }
            }
        }
    }
    let nvoltage = equations
        .iter()
        .filter(|eq| eq.kind == EquationKind::Voltage)
        .count();

    for (list, ml) in partition.mech_lists.iter().enumerate() {
        let Some(ode) = ml.mechanism.ode() else {
            continue;
        };
        let count = ode.count();
        for instance in 0..ml.instances.len() {
            let base = equations.len();
            let map = ode.map(list, instance, &ml.instances, base);
            let fail = |message: String| {
                DendriteError::inconsistent_layout(partition.id.0, base, ml.mechanism.name(), message)
            };
            if map.values.len() != count
                || map.derivatives.len() != count
                || map.tolerances.len() != count
            {
                return Err(fail(format!(
                    "instance {} declares {} states but supplied {} values, {} derivatives, {} tolerances",
                    instance,
                    count,
                    map.values.len(),
                    map.derivatives.len(),
                    map.tolerances.len()
                )));
            }
            for k in 0..count {
                let (value, derivative) = (map.values[k], map.derivatives[k]);
                for handle in [value, derivative] {
                    if !partition.contains(handle) {
                        return Err(fail(format!("instance {} handle {} does not resolve", instance, handle)));
                    }
                }
                equations.push(Equation {
                    value,
                    derivative,
                    kind: EquationKind::State,
                    scale: map.tolerances[k],
                });
            }
        }
    }

    let layout = EquationLayout {
        mode,
        nvoltage,
        aux_count: aux_scales.len(),
        aux_scales,
        equations,
        offset: 0,
    };
    debug!(
        partition = partition.id.0,
        mode = mode.name(),
        voltages = layout.nvoltage,
        states = layout.equations.len() - layout.nvoltage,
        auxiliary = layout.aux_count,
        "assembled equation layout"
    );
    Ok(layout)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanisms::{HodgkinHuxley, Mechanism, Passive};
    use crate::model::{MechTypeId, PartitionId};
    use std::sync::Arc;

    fn partition() -> Partition {
        let mut p = Partition::new(PartitionId(0));
        let soma = p.nodes.push_root(1.0, -65.0, None);
        let mid = p.nodes.push_child(soma, 0.5, 0.0, -65.0);
        p.nodes.push_child(mid, 0.5, 2.0, -65.0);
        p.node_names = vec!["soma".into(), "mid".into(), "tip".into()];
        let hh: Arc<dyn Mechanism> = Arc::new(HodgkinHuxley);
        let pas: Arc<dyn Mechanism> = Arc::new(Passive);
        let row: Vec<f64> = hh.fields().iter().map(|f| f.default).collect();
        p.insert_instance(MechTypeId(1), &hh, NodeId(0), "hh0", &row);
        p.insert_instance(MechTypeId(0), &pas, NodeId(2), "leak", &[0.001, -70.0, 0.0]);
        p.insert_instance(MechTypeId(1), &hh, NodeId(2), "hh2", &row);
        p
    }

    #[test]
    fn test_explicit_order() {
        let p = partition();
        let layout = assemble(&p, LayoutMode::Explicit, vec![1.0]).unwrap();
        assert_eq!(layout.nvoltage, 2);
        assert_eq!(layout.size(), 2 + 6 + 1);
        assert_eq!(layout.aux_offset(), 8);
        assert_eq!(layout.equations[0].value, Handle::Voltage(NodeId(0)));
        assert_eq!(layout.equations[1].value, Handle::Voltage(NodeId(2)));
        // hh list sorts after pas, instances in insertion order: m h n of hh0, then hh2
        let hh = &p.mech_lists[1];
        assert_eq!(
            layout.equations[2].value,
            Handle::Field { list: 1, offset: hh.instances.offset(0, 6) }
        );
        assert_eq!(
            layout.equations[5].value,
            Handle::Field { list: 1, offset: hh.instances.offset(1, 6) }
        );
    }

    #[test]
    fn test_implicit_includes_algebraic_nodes() {
        let mut p = partition();
        p.nodes.attach_extracellular(2, &[false, true, false]);
        let layout = assemble(&p, LayoutMode::Implicit, Vec::new()).unwrap();
        assert_eq!(layout.nvoltage, 3);
        assert_eq!(layout.equations[1].value, Handle::Voltage(NodeId(1)));
        assert_eq!(layout.equations[2].value, Handle::ExtVoltage { node: NodeId(1), layer: 0 });
        assert_eq!(layout.equations[3].value, Handle::ExtVoltage { node: NodeId(1), layer: 1 });
        assert_eq!(layout.equations[4].value, Handle::Voltage(NodeId(2)));
    }

    #[test]
    fn test_explicit_rejects_extracellular() {
        let mut p = partition();
        p.nodes.attach_extracellular(1, &[true, false, false]);
        assert!(matches!(
            assemble(&p, LayoutMode::Explicit, Vec::new()),
            Err(DendriteError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_tolerances() {
        let p = partition();
        let layout = assemble(&p, LayoutMode::Explicit, vec![2.0]).unwrap();
        let tol = layout.tolerances(1e-3, 0.1);
        assert_eq!(tol.len(), layout.size());
        assert!((tol[0] - 1e-4).abs() < 1e-15);
        assert!((tol[2] - 1e-3).abs() < 1e-15);
        assert!((tol[8] - 2e-3).abs() < 1e-15);
    }
}
