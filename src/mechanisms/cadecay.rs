//! Calcium pool relaxing to a resting concentration.
//!
//!   dca/dt = (cainf - ca) / tau
//!
//! The node's ion concentration `cai` is an alias of this pool's state; the
//! synonym hook copies the state into it after every scatter.

use super::{DomainError, FieldSpec, Mechanism, OdeStates, StateSlot, StepContext, Synonym};
use crate::model::{NodeArrays, NodeId};

const TAU: usize = 0;
const CAINF: usize = 1;
const CA: usize = 2;
const DCA: usize = 3;

static FIELDS: [FieldSpec; 4] = [
    FieldSpec::parameter("tau", 80.0),
    FieldSpec::parameter("cainf", 5e-5),
    FieldSpec::state("ca", 5e-5),
    FieldSpec::derivative("dca"),
];

static SLOTS: [StateSlot; 1] = [StateSlot { value: CA, derivative: DCA, tolerance: 1.0 }];

/// First-order calcium buffer (mM, ms).
#[derive(Debug, Clone, Copy, Default)]
pub struct CaDecay;

fn tau(row: &[f64]) -> Result<f64, DomainError> {
    if row[TAU] > 0.0 {
        Ok(row[TAU])
    } else {
        Err(DomainError::new("cadecay: tau must be positive"))
    }
}

impl Mechanism for CaDecay {
    fn name(&self) -> &'static str {
        "cadecay"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        &FIELDS
    }

    fn ode(&self) -> Option<&dyn OdeStates> {
        Some(self)
    }

    fn synonym(&self) -> Option<&dyn Synonym> {
        Some(self)
    }
}

impl OdeStates for CaDecay {
    fn slots(&self) -> &[StateSlot] {
        &SLOTS
    }

    fn spec(&self, row: &mut [f64], _v: f64, _ctx: &StepContext) -> Result<(), DomainError> {
        row[DCA] = (row[CAINF] - row[CA]) / tau(row)?;
        Ok(())
    }

    fn matsol(&self, row: &mut [f64], _v: f64, ctx: &StepContext) -> Result<(), DomainError> {
        row[DCA] /= 1.0 + ctx.gamma / tau(row)?;
        Ok(())
    }
}

impl Synonym for CaDecay {
    fn reconcile(&self, row: &[f64], node: NodeId, nodes: &mut NodeArrays) {
        nodes.cai[node.0] = row[CA];
    }
}
