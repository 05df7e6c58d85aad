//! Right-hand-side and implicit-matrix kernels for one partition.
//!
//! The coordinator sequences these; each one touches a single partition and
//! never blocks.

use tracing::warn;

use super::{FaultPhase, NumericFault};
use crate::mechanisms::{DomainError, HookPoint, Mechanism, StepContext};
use crate::model::{InstanceRef, MechList, NodeArrays, Partition, PartitionId};

/// Numeric faults raised in one partition during one callback.
///
/// A mechanism list is recorded at most once per phase; later failures of the
/// same list in the same callback are dropped.
#[derive(Debug, Clone)]
pub struct FaultLog {
    partition: PartitionId,
    t: f64,
    faults: Vec<NumericFault>,
}

impl FaultLog {
    pub fn new(partition: PartitionId) -> Self {
        Self {
            partition,
            t: 0.0,
            faults: Vec::new(),
        }
    }

    /// Start a new callback at time `t`.
    pub fn begin(&mut self, t: f64) {
        self.t = t;
        self.faults.clear();
    }

    pub fn record(
        &mut self,
        phase: FaultPhase,
        list: usize,
        mechanism: &'static str,
        instance: usize,
        error: &DomainError,
    ) {
        if self.faults.iter().any(|f| f.list == list && f.phase == phase) {
            return;
        }
        let fault = NumericFault {
            partition: self.partition,
            phase,
            mechanism,
            list,
            instance,
            t: self.t,
            detail: error.detail,
        };
        warn!(
            partition = self.partition.0,
            mechanism,
            instance,
            t = self.t,
            "numeric fault during {}: {}",
            phase,
            error
        );
        self.faults.push(fault);
    }

    pub fn faults(&self) -> &[NumericFault] {
        &self.faults
    }

    pub fn is_empty(&self) -> bool {
        self.faults.is_empty()
    }

    pub fn drain(&mut self) -> std::vec::Drain<'_, NumericFault> {
        self.faults.drain(..)
    }
}

/// Run `f` on every instance of every list, with the instance row and the
/// index of its node. `f` returns `None` when the list lacks the capability,
/// which skips the rest of the list. Faults go to `log` under `phase`.
fn for_each_instance<F>(
    mech_lists: &mut [MechList],
    nodes: &mut NodeArrays,
    log: &mut FaultLog,
    phase: FaultPhase,
    mut f: F,
) where
    F: FnMut(&dyn Mechanism, &mut [f64], &mut NodeArrays, usize) -> Option<Result<(), DomainError>>,
{
    for (list, ml) in mech_lists.iter_mut().enumerate() {
        let MechList { mechanism, instances, .. } = ml;
        for k in 0..instances.len() {
            let node = instances.nodes[k].0;
            match f(mechanism.as_ref(), instances.row_mut(k), nodes, node) {
                None => break,
                Some(Ok(())) => {}
                Some(Err(e)) => log.record(phase, list, mechanism.name(), k, &e),
            }
        }
    }
}

/// Membrane currents and axial terms into `rhs` (nA).
pub(crate) fn compute_rhs(partition: &mut Partition, ctx: &StepContext, log: &mut FaultLog) {
    let Partition { nodes, mech_lists, .. } = partition;
    nodes.rhs.fill(0.0);

    for_each_instance(mech_lists, nodes, log, FaultPhase::Current, |mechanism, row, nodes, node| {
        let current = mechanism.current()?;
        Some(current.evaluate(row, nodes.v[node], ctx).map(|s| {
            nodes.rhs[node] -= s.current;
        }))
    });

    for i in nodes.root_end..nodes.len() {
        let Some(p) = nodes.parent[i] else {
            continue;
        };
        let dv = nodes.v[p] - nodes.v[i];
        nodes.rhs[i] -= nodes.b[i] * dv;
        nodes.rhs[p] += nodes.a[i] * dv;
    }
}

/// Diagonal of `cm * cj + G`, where `G` is the membrane slope plus the axial
/// conductance matrix.
pub(crate) fn compute_lhs(partition: &mut Partition, ctx: &StepContext, cj: f64, log: &mut FaultLog) {
    let Partition { nodes, mech_lists, .. } = partition;
    nodes.d.fill(0.0);

    for_each_instance(mech_lists, nodes, log, FaultPhase::Jacobian, |mechanism, row, nodes, node| {
        let current = mechanism.current()?;
        Some(current.evaluate(row, nodes.v[node], ctx).map(|s| {
            nodes.d[node] += s.conductance;
        }))
    });

    for i in 0..nodes.len() {
        nodes.d[i] += nodes.cm[i] * cj;
    }
    for i in nodes.root_end..nodes.len() {
        let Some(p) = nodes.parent[i] else {
            continue;
        };
        nodes.d[i] -= nodes.b[i];
        nodes.d[p] -= nodes.a[i];
    }
}

/// Turn the voltage part of `b` into the right-hand side of the scaled
/// system. Algebraic rows get zero.
pub(crate) fn scale_rhs_for_solve(nodes: &mut NodeArrays, cj: f64) {
    for i in 0..nodes.len() {
        if nodes.has_capacitance(i) {
            nodes.rhs[i] *= nodes.cm[i] * cj;
        } else {
            nodes.rhs[i] = 0.0;
        }
    }
}

/// Mechanism state derivatives.
pub(crate) fn compute_ode_spec(partition: &mut Partition, ctx: &StepContext, log: &mut FaultLog) {
    let Partition { nodes, mech_lists, .. } = partition;
    for_each_instance(mech_lists, nodes, log, FaultPhase::OdeSpec, |mechanism, row, nodes, node| {
        let ode = mechanism.ode()?;
        Some(ode.spec(row, nodes.v[node], ctx))
    });
}

/// `dv/dt = rhs / cm` for capacitive nodes.
pub(crate) fn divide_capacitance(nodes: &mut NodeArrays) {
    for i in 0..nodes.len() {
        if nodes.has_capacitance(i) {
            nodes.rhs[i] /= nodes.cm[i];
        }
    }
}

/// Diagonal implicit solve of the mechanism states, in place in their
/// derivative fields.
pub(crate) fn ode_matsol(partition: &mut Partition, ctx: &StepContext, log: &mut FaultLog) {
    let Partition { nodes, mech_lists, .. } = partition;
    for_each_instance(mech_lists, nodes, log, FaultPhase::OdeSolve, |mechanism, row, nodes, node| {
        let ode = mechanism.ode()?;
        Some(ode.matsol(row, nodes.v[node], ctx))
    });
}

/// Blocks registered for `point`, in list then instance order.
pub(crate) fn before_after(partition: &mut Partition, point: HookPoint, ctx: &StepContext, log: &mut FaultLog) {
    let Partition { nodes, mech_lists, .. } = partition;
    for_each_instance(mech_lists, nodes, log, FaultPhase::Hook, |mechanism, row, nodes, node| {
        let hooks = mechanism.hooks().filter(|h| h.points().contains(&point))?;
        Some(hooks.run(point, row, nodes.v[node], ctx))
    });
}

/// Initial state of one instance at its node's present potential.
pub(crate) fn initialize_instance(partition: &mut Partition, at: InstanceRef) {
    let Partition { nodes, mech_lists, .. } = partition;
    if let Some(ml) = mech_lists.get_mut(at.list) {
        if at.index < ml.instances.len() {
            let v = nodes.v[ml.instances.nodes[at.index].0];
            ml.mechanism.initialize(ml.instances.row_mut(at.index), v);
        }
    }
}

/// Set every node to its initial potential and every mechanism to its
/// initial state.
pub(crate) fn initialize_partition(partition: &mut Partition) {
    partition.nodes.v.copy_from_slice(&partition.nodes.v_init);
    for list in 0..partition.mech_lists.len() {
        for index in 0..partition.mech_lists[list].instances.len() {
            initialize_instance(partition, InstanceRef { list, index });
        }
    }
}
