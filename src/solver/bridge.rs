//! Copies between a partition's slice of the flat vectors and the storage the
//! equation handles point at.
//!
//! Slices passed here cover the handle-backed equations only; auxiliary
//! entries are handed to the partition's auxiliary block directly.

use super::layout::EquationLayout;
use crate::model::Partition;

/// Flat states into storage, then reconcile aliased views.
pub fn scatter_y(partition: &mut Partition, layout: &EquationLayout, y: &[f64]) {
    for (eq, &value) in layout.equations.iter().zip(y) {
        let stored = partition.set(eq.value, value);
        debug_assert!(stored, "unresolved handle {}", eq.value);
    }
    reconcile_synonyms(partition);
}

/// Storage into flat states.
pub fn gather_y(partition: &Partition, layout: &EquationLayout, y: &mut [f64]) {
    for (eq, slot) in layout.equations.iter().zip(y.iter_mut()) {
        if let Some(value) = partition.get(eq.value) {
            *slot = value;
        }
    }
}

/// Flat derivatives (or solve operands) into derivative storage.
pub fn scatter_ydot(partition: &mut Partition, layout: &EquationLayout, ydot: &[f64]) {
    for (eq, &value) in layout.equations.iter().zip(ydot) {
        let stored = partition.set(eq.derivative, value);
        debug_assert!(stored, "unresolved handle {}", eq.derivative);
    }
}

/// Derivative storage into flat derivatives.
pub fn gather_ydot(partition: &Partition, layout: &EquationLayout, ydot: &mut [f64]) {
    for (eq, slot) in layout.equations.iter().zip(ydot.iter_mut()) {
        if let Some(value) = partition.get(eq.derivative) {
            *slot = value;
        }
    }
}

/// Run the synonym hook of every mechanism type that has one.
pub fn reconcile_synonyms(partition: &mut Partition) {
    let Partition { nodes, mech_lists, .. } = partition;
    for ml in mech_lists.iter() {
        let Some(synonym) = ml.mechanism.synonym() else {
            continue;
        };
        for k in 0..ml.instances.len() {
            synonym.reconcile(ml.instances.row(k), ml.instances.nodes[k], nodes);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mechanisms::{CaDecay, HodgkinHuxley, Mechanism};
    use crate::model::{MechTypeId, NodeId, PartitionId};
    use crate::solver::{assemble, LayoutMode};
    use std::sync::Arc;

    fn partition() -> Partition {
        let mut p = Partition::new(PartitionId(0));
        let soma = p.nodes.push_root(1.0, -65.0, None);
        p.nodes.push_child(soma, 0.2, 1.0, -65.0);
        p.node_names = vec!["soma".into(), "dend".into()];
        let hh: Arc<dyn Mechanism> = Arc::new(HodgkinHuxley);
        let cad: Arc<dyn Mechanism> = Arc::new(CaDecay);
        let row: Vec<f64> = hh.fields().iter().map(|f| f.default).collect();
        p.insert_instance(MechTypeId(1), &hh, NodeId(0), "hh", &row);
        p.insert_instance(MechTypeId(2), &cad, NodeId(1), "cad", &[80.0, 5e-5, 5e-5, 0.0]);
        p
    }

    #[test]
    fn test_round_trip() {
        let mut p = partition();
        let layout = assemble(&p, LayoutMode::Explicit, Vec::new()).unwrap();
        let y: Vec<f64> = (0..layout.size()).map(|i| 0.1 * i as f64 - 1.0).collect();
        scatter_y(&mut p, &layout, &y);
        let mut back = vec![0.0; y.len()];
        gather_y(&p, &layout, &mut back);
        assert_eq!(back, y);

        scatter_ydot(&mut p, &layout, &y);
        let mut back = vec![0.0; y.len()];
        gather_ydot(&p, &layout, &mut back);
        assert_eq!(back, y);
    }

    #[test]
    fn test_synonym_follows_state() {
        let mut p = partition();
        let layout = assemble(&p, LayoutMode::Explicit, Vec::new()).unwrap();
        let ca = layout.size() - 1;
        let mut y = vec![0.0; layout.size()];
        y[ca] = 2e-4;
        scatter_y(&mut p, &layout, &y);
        assert_eq!(p.nodes.cai[1], 2e-4);
        assert_eq!(p.nodes.cai[0], 5e-5);
    }
}
