//! Hodgkin-Huxley sodium, potassium, and leak channels.
//!
//! Squid axon kinetics at 6.3 degC. Conductances are absolute (uS) so the
//! model stays independent of compartment geometry.
//!
//!   i = gnabar * m^3 * h * (v - ena) + gkbar * n^4 * (v - ek) + gl * (v - el)
//!
//! Each gate relaxes toward its steady state:
//!
//!   dx/dt = (xinf(v) - x) / xtau(v)

use super::{
    finite, CurrentSample, DomainError, FieldSpec, Mechanism, MembraneCurrent, OdeStates,
    StateSlot, StepContext,
};

const GNABAR: usize = 0;
const GKBAR: usize = 1;
const GL: usize = 2;
const EL: usize = 3;
const ENA: usize = 4;
const EK: usize = 5;
const M: usize = 6;
const H: usize = 7;
const N: usize = 8;
const DM: usize = 9;
const DH: usize = 10;
const DN: usize = 11;
const I: usize = 12;

static FIELDS: [FieldSpec; 13] = [
    FieldSpec::parameter("gnabar", 120.0),
    FieldSpec::parameter("gkbar", 36.0),
    FieldSpec::parameter("gl", 0.3),
    FieldSpec::parameter("el", -54.3),
    FieldSpec::parameter("ena", 50.0),
    FieldSpec::parameter("ek", -77.0),
    FieldSpec::state("m", 0.0529),
    FieldSpec::state("h", 0.5961),
    FieldSpec::state("n", 0.3177),
    FieldSpec::derivative("dm"),
    FieldSpec::derivative("dh"),
    FieldSpec::derivative("dn"),
    FieldSpec::assigned("i"),
];

static SLOTS: [StateSlot; 3] = [
    StateSlot { value: M, derivative: DM, tolerance: 1.0 },
    StateSlot { value: H, derivative: DH, tolerance: 1.0 },
    StateSlot { value: N, derivative: DN, tolerance: 1.0 },
];

/// Hodgkin-Huxley channel set.
#[derive(Debug, Clone, Copy, Default)]
pub struct HodgkinHuxley;

/// Steady state and time constant of the three gates at one potential.
#[derive(Debug, Clone, Copy)]
struct Rates {
    minf: f64,
    mtau: f64,
    hinf: f64,
    htau: f64,
    ninf: f64,
    ntau: f64,
}

/// x / (exp(x/y) - 1) with the removable singularity at x = 0 handled.
fn vtrap(x: f64, y: f64) -> f64 {
    if (x / y).abs() < 1e-6 {
        y * (1.0 - x / y / 2.0)
    } else {
        x / ((x / y).exp() - 1.0)
    }
}

fn rates(v: f64) -> Result<Rates, DomainError> {
    let alpha_m = 0.1 * vtrap(-(v + 40.0), 10.0);
    let beta_m = 4.0 * (-(v + 65.0) / 18.0).exp();
    let alpha_h = 0.07 * (-(v + 65.0) / 20.0).exp();
    let beta_h = 1.0 / ((-(v + 35.0) / 10.0).exp() + 1.0);
    let alpha_n = 0.01 * vtrap(-(v + 55.0), 10.0);
    let beta_n = 0.125 * (-(v + 65.0) / 80.0).exp();

    let mtau = finite(1.0 / (alpha_m + beta_m), "hh: m rate out of domain")?;
    let htau = finite(1.0 / (alpha_h + beta_h), "hh: h rate out of domain")?;
    let ntau = finite(1.0 / (alpha_n + beta_n), "hh: n rate out of domain")?;
    Ok(Rates {
        minf: alpha_m * mtau,
        mtau,
        hinf: alpha_h * htau,
        htau,
        ninf: alpha_n * ntau,
        ntau,
    })
}

impl Mechanism for HodgkinHuxley {
    fn name(&self) -> &'static str {
        "hh"
    }

    fn fields(&self) -> &'static [FieldSpec] {
        &FIELDS
    }

    fn current(&self) -> Option<&dyn MembraneCurrent> {
        Some(self)
    }

    fn ode(&self) -> Option<&dyn OdeStates> {
        Some(self)
    }

    fn initialize(&self, row: &mut [f64], v: f64) {
        if let Ok(r) = rates(v) {
            row[M] = r.minf;
            row[H] = r.hinf;
            row[N] = r.ninf;
        }
    }
}

impl MembraneCurrent for HodgkinHuxley {
    fn evaluate(
        &self,
        row: &mut [f64],
        v: f64,
        _ctx: &StepContext,
    ) -> Result<CurrentSample, DomainError> {
        let m = row[M];
        let n = row[N];
        let gna = row[GNABAR] * m * m * m * row[H];
        let gk = row[GKBAR] * n * n * n * n;
        let gl = row[GL];
        let i = finite(
            gna * (v - row[ENA]) + gk * (v - row[EK]) + gl * (v - row[EL]),
            "hh: non-finite current",
        )?;
        row[I] = i;
        Ok(CurrentSample {
            current: i,
            conductance: gna + gk + gl,
        })
    }
}

impl OdeStates for HodgkinHuxley {
    fn slots(&self) -> &[StateSlot] {
        &SLOTS
    }

    fn spec(&self, row: &mut [f64], v: f64, _ctx: &StepContext) -> Result<(), DomainError> {
        let r = rates(v)?;
        row[DM] = (r.minf - row[M]) / r.mtau;
        row[DH] = (r.hinf - row[H]) / r.htau;
        row[DN] = (r.ninf - row[N]) / r.ntau;
        Ok(())
    }

    fn matsol(&self, row: &mut [f64], v: f64, ctx: &StepContext) -> Result<(), DomainError> {
        let r = rates(v)?;
        row[DM] /= 1.0 + ctx.gamma / r.mtau;
        row[DH] /= 1.0 + ctx.gamma / r.htau;
        row[DN] /= 1.0 + ctx.gamma / r.ntau;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    fn row() -> Vec<f64> {
        FIELDS.iter().map(|f| f.default).collect()
    }

    #[test]
    fn test_resting_state_is_near_steady() {
        let mut r = row();
        HodgkinHuxley.initialize(&mut r, -65.0);
        let ctx = StepContext { t: 0.0, dt: 0.025, gamma: 0.025 };
        HodgkinHuxley.spec(&mut r, -65.0, &ctx).unwrap();
        assert_abs_diff_eq!(r[DM], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(r[DH], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(r[DN], 0.0, epsilon = 1e-12);
        assert_abs_diff_eq!(r[M], 0.0529, epsilon = 1e-3);
    }

    #[test]
    fn test_vtrap_singularity() {
        // alpha_m at v = -40 sits on the removable singularity
        assert_abs_diff_eq!(vtrap(0.0, 10.0), 10.0, epsilon = 1e-12);
        assert!(rates(-40.0).is_ok());
    }

    #[test]
    fn test_non_finite_voltage_is_domain_error() {
        let mut r = row();
        let ctx = StepContext { t: 0.0, dt: 0.025, gamma: 0.025 };
        assert!(HodgkinHuxley.spec(&mut r, f64::NAN, &ctx).is_err());
        assert!(HodgkinHuxley.evaluate(&mut r, f64::NAN, &ctx).is_err());
    }

    #[test]
    fn test_matsol_shrinks_by_relaxation_factor() {
        let mut r = row();
        r[DM] = 1.0;
        let ctx = StepContext { t: 0.0, dt: 0.1, gamma: 0.1 };
        HodgkinHuxley.matsol(&mut r, -65.0, &ctx).unwrap();
        let mtau = rates(-65.0).unwrap().mtau;
        assert_abs_diff_eq!(r[DM], 1.0 / (1.0 + 0.1 / mtau), epsilon = 1e-12);
    }
}
