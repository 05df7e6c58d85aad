//! Passive leak conductance.
//!
//!   i = g * (v - e)

use super::{CurrentSample, DomainError, FieldSpec, Mechanism, MembraneCurrent, StepContext};

const G: usize = 0;
const E: usize = 1;
const I: usize = 2;

static FIELDS: [FieldSpec; 3] = [
    FieldSpec::parameter("g", 0.001),
    FieldSpec::parameter("e", -70.0),
    FieldSpec::assigned("i"),
];

/// Linear leak with conductance `g` (uS) and reversal `e` (mV).
#[derive(Debug, Clone, Copy, Default)]
pub struct Passive;

impl Mechanism for Passive {
    fn name(&self) -> &'static str {
        "pas"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        &FIELDS
    }

    fn current(&self) -> Option<&dyn MembraneCurrent> {
        Some(self)
    }
}

impl MembraneCurrent for Passive {
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

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_passive_current_and_slope() {
        let mut row = vec![0.01, -65.0, 0.0];
        let ctx = StepContext { t: 0.0, dt: 0.025, gamma: 0.025 };
        let s = Passive.evaluate(&mut row, -55.0, &ctx).unwrap();
        assert_relative_eq!(s.current, 0.1);
        assert_relative_eq!(s.conductance, 0.01);
        assert_relative_eq!(row[I], 0.1);
    }
}
