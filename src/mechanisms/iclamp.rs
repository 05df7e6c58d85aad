//! Current clamp point process.
//!
//! Injects `amp` (nA) into its node for `del <= t < del + dur`.

use super::{CurrentSample, DomainError, FieldSpec, Mechanism, MembraneCurrent, StepContext};

const DEL: usize = 0;
const DUR: usize = 1;
const AMP: usize = 2;
const I: usize = 3;

static FIELDS: [FieldSpec; 4] = [
    FieldSpec::parameter("del", 0.0),
    FieldSpec::parameter("dur", 0.0),
    FieldSpec::parameter("amp", 0.0),
    FieldSpec::assigned("i"),
];

/// Square current pulse. `i` records the injected (inward) current.
#[derive(Debug, Clone, Copy, Default)]
pub struct IClamp;

impl Mechanism for IClamp {
    fn name(&self) -> &'static str {
        "iclamp"
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
}

impl MembraneCurrent for IClamp {
    fn evaluate(
        &self,
        row: &mut [f64],
        _v: f64,
        ctx: &StepContext,
    ) -> Result<CurrentSample, DomainError> {
        let on = ctx.t >= row[DEL] && ctx.t < row[DEL] + row[DUR];
        let injected = if on { row[AMP] } else { 0.0 };
        row[I] = injected;
        // Electrode current is inward, i.e. negative outward current.
        Ok(CurrentSample {
            current: -injected,
            conductance: 0.0,
        })
    }
}
