//! Exponentially decaying synaptic conductance.
//!
//!   i = g * (v - e)
//!   dg/dt = -g / tau

use super::{
    CurrentSample, DomainError, FieldSpec, Mechanism, MembraneCurrent, OdeStates, StateSlot,
    StepContext,
};

const TAU: usize = 0;
const E: usize = 1;
const G: usize = 2;
const DG: usize = 3;
const I: usize = 4;

static FIELDS: [FieldSpec; 5] = [
    FieldSpec::parameter("tau", 2.0),
    FieldSpec::parameter("e", 0.0),
    FieldSpec::state("g", 0.0),
    FieldSpec::derivative("dg"),
    FieldSpec::assigned("i"),
];

static SLOTS: [StateSlot; 1] = [StateSlot { value: G, derivative: DG, tolerance: 1.0 }];

/// Point-process synapse whose conductance `g` (uS) decays with time constant `tau` (ms).
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpSyn;

fn tau(row: &[f64]) -> Result<f64, DomainError> {
    if row[TAU] > 0.0 {
        Ok(row[TAU])
    } else {
        Err(DomainError::new("expsyn: tau must be positive"))
    }
}

impl Mechanism for ExpSyn {
    fn name(&self) -> &'static str {
        "expsyn"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        &FIELDS
    }

    fn is_point_process(&self) -> bool {
        true
    }

    fn current(&self) -> Option<&dyn MembraneCurrent> {
        Some(self)
    }

    fn ode(&self) -> Option<&dyn OdeStates> {
        Some(self)
    }
}

impl MembraneCurrent for ExpSyn {
    fn evaluate(
        &self,
        row: &mut [f64],
        v: f64,
        _ctx: &StepContext,
    ) -> Result<CurrentSample, DomainError> {
        let i = row[G] * (v - row[E]);
        row[I] = i;
        Ok(CurrentSample {
            current: i,
            conductance: row[G],
        })
    }
}

impl OdeStates for ExpSyn {
    fn slots(&self) -> &[StateSlot] {
        &SLOTS
    }

    fn spec(&self, row: &mut [f64], _v: f64, _ctx: &StepContext) -> Result<(), DomainError> {
        row[DG] = -row[G] / tau(row)?;
        Ok(())
    }

    fn matsol(&self, row: &mut [f64], _v: f64, ctx: &StepContext) -> Result<(), DomainError> {
        row[DG] /= 1.0 + ctx.gamma / tau(row)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_decay_and_current() {
        let mut row = vec![2.0, 0.0, 0.01, 0.0, 0.0];
        let ctx = StepContext { t: 0.0, dt: 0.025, gamma: 0.025 };
        ExpSyn.spec(&mut row, -65.0, &ctx).unwrap();
        assert_relative_eq!(row[DG], -0.005);
        let s = ExpSyn.evaluate(&mut row, -65.0, &ctx).unwrap();
        assert_relative_eq!(s.current, -0.65);
        assert_relative_eq!(s.conductance, 0.01);
    }

    #[test]
    fn test_non_positive_tau_is_domain_error() {
        let mut row = vec![0.0, 0.0, 0.01, 0.0, 0.0];
        let ctx = StepContext { t: 0.0, dt: 0.025, gamma: 0.025 };
        assert!(ExpSyn.spec(&mut row, -65.0, &ctx).is_err());
        assert!(ExpSyn.matsol(&mut row, -65.0, &ctx).is_err());
    }
}
