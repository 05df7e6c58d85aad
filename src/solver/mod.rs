//! Integrator bridge for the cable equation.
//!
//! This module maps the partitioned cable model onto the flat state vector of
//! an adaptive-step integrator and provides the two callbacks such an
//! integrator drives:
//!
//! - `fun(t, y) -> ydot`: derivative evaluation
//! - `solve(gamma, b) -> x`: one linear solve of `(I - gamma * J) x = b`
//!
//! ## Equation layout
//!
//! Each partition owns a contiguous slice of the flat vector:
//! ```text
//! [ v of capacitive nodes | mechanism states by type, then instance | auxiliary ]
//! ```
//! Nodes with exactly zero capacitance are algebraic. Their voltage is not
//! integrated; it is recomputed by local current balance at the start of every
//! derivative evaluation.
//!
//! ## Current balance
//!
//! For node `i` with parent `p` and axial coupling `a[i] = b[i] = -g`:
//! ```text
//! cm[i] * dv[i]/dt = -sum(i_mech) - b[i] * (v[p] - v[i]) + sum over children c of a[c] * (v[c] - v[i])
//! ```
//! Units: mV, ms, nA, uS, nF.

mod auxiliary;
mod bridge;
mod coordinator;
mod evaluator;
mod layout;
mod nocap;
mod playrec;
mod simulator;
mod transport;
mod tree;

pub use auxiliary::{AuxiliaryBlock, LinearDecay};
pub use bridge::{gather_y, gather_ydot, reconcile_synonyms, scatter_y, scatter_ydot};
pub use coordinator::{CableSystem, PartitionContext};
pub use evaluator::FaultLog;
pub use layout::{assemble, Equation, EquationKind, EquationLayout};
pub use nocap::{NoCapStructure, ReducedList};
pub use playrec::{Continuous, Record, RecordId, VectorPlay};
pub use simulator::{Simulator, Trace};
pub use transport::{LocalTransport, SharedTransport, SplitSums, Transport};
pub use tree::{HinesSolver, TreeSolver};

use std::fmt;

use crate::model::PartitionId;

/// Step size handed to mechanisms when the integrator reports exactly zero.
pub const ZERO_STEP_SENTINEL: f64 = 1e-8;

/// Default global absolute tolerance.
pub const DEFAULT_ATOL: f64 = 1e-3;

/// Default fixed step of the reference driver (ms).
pub const DEFAULT_DT: f64 = 0.025;

/// Default stop time of the reference driver (ms).
pub const DEFAULT_TSTOP: f64 = 5.0;

/// How much of the Jacobian the implicit solve accounts for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stiffness {
    /// Voltage solve only, mechanism states pass through
    None,
    /// Same treatment as `None`; kept distinct for callers that select it
    Voltage,
    /// Voltage solve plus the diagonal mechanism-state solve
    #[default]
    Full,
}

impl Stiffness {
    /// Map the numeric level used in description files (0, 1, 2).
    pub fn from_level(level: u8) -> Option<Self> {
        match level {
            0 => Some(Self::None),
            1 => Some(Self::Voltage),
            2 => Some(Self::Full),
            _ => None,
        }
    }
}

/// Equation ordering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutMode {
    /// Capacitive voltages first, algebraic nodes excluded (ODE integrator)
    #[default]
    Explicit,
    /// Every node in tree order with its extracellular layers right after it
    /// (DAE integrator). Only assembly, initialization and state transfer
    /// are available: no residual is defined for this ordering, so `fun`
    /// and `solve` return [`crate::DendriteError::UnsupportedLayout`].
    Implicit,
}

impl LayoutMode {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Explicit => "explicit",
            Self::Implicit => "implicit",
        }
    }

    pub fn from_keyword(keyword: &str) -> Option<Self> {
        match keyword.to_ascii_lowercase().as_str() {
            "explicit" | "ode" => Some(Self::Explicit),
            "implicit" | "dae" => Some(Self::Implicit),
            _ => None,
        }
    }
}

/// Contract between the bridge and an adaptive-step integrator.
///
/// The integrator owns the flat vectors; every slice passed in must have
/// length [`OdeSystem::neq`].
pub trait OdeSystem {
    /// Total number of equations.
    fn neq(&self) -> usize;

    /// Per-equation absolute tolerance.
    fn tolerances(&self) -> Vec<f64>;

    /// Step size the integrator is about to attempt (used by time-dependent
    /// event logic only).
    fn set_step_size(&mut self, h: f64);

    /// Evaluate `ydot = f(t, y)`.
    fn fun(&mut self, t: f64, y: &[f64], ydot: &mut [f64]) -> crate::Result<()>;

    /// Overwrite `b` with the solution of `(I - gamma * J) x = b` at state `y`.
    fn solve(&mut self, gamma: f64, b: &mut [f64], y: &[f64]) -> crate::Result<()>;
}

/// Phase in which a numeric fault was raised.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultPhase {
    /// Current evaluation for the right-hand side
    Current,
    /// Current evaluation at algebraic nodes
    NoCap,
    /// Slope evaluation for the implicit matrix
    Jacobian,
    /// Mechanism state derivatives
    OdeSpec,
    /// Mechanism state implicit solve
    OdeSolve,
    /// Before/after blocks
    Hook,
}

impl fmt::Display for FaultPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Current => "current evaluation",
            Self::NoCap => "algebraic node resolution",
            Self::Jacobian => "jacobian evaluation",
            Self::OdeSpec => "ode evaluation",
            Self::OdeSolve => "implicit solve",
            Self::Hook => "before/after block",
        };
        f.write_str(s)
    }
}

/// A non-fatal domain error raised by a mechanism kernel.
#[derive(Debug, Clone, PartialEq)]
pub struct NumericFault {
    pub partition: PartitionId,
    pub phase: FaultPhase,
    pub mechanism: &'static str,
    /// Mechanism list index within the partition
    pub list: usize,
    /// First faulting instance of that list
    pub instance: usize,
    pub t: f64,
    pub detail: &'static str,
}

impl fmt::Display for NumericFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "numeric fault during {} at t={}: {} instance {} in {}: {}",
            self.phase, self.t, self.mechanism, self.instance, self.partition, self.detail
        )
    }
}

/// Faults kept in [`Diagnostics`]; later ones are only counted.
pub const FAULT_SAMPLE: usize = 64;

/// Numeric faults accumulated across callbacks.
///
/// The first [`FAULT_SAMPLE`] faults are kept; every fault is counted.
#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    faults: Vec<NumericFault>,
    total: usize,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, fault: NumericFault) {
        self.total += 1;
        if self.faults.len() < FAULT_SAMPLE {
            self.faults.push(fault);
        }
    }

    /// The kept faults, oldest first.
    pub fn faults(&self) -> &[NumericFault] {
        &self.faults
    }

    /// Every fault recorded since the last [`Diagnostics::take`].
    pub fn fault_count(&self) -> usize {
        self.total
    }

    /// Faults counted but not kept.
    pub fn dropped(&self) -> usize {
        self.total - self.faults.len()
    }

    /// Whether any fault has fired. Accuracy is not guaranteed afterwards.
    pub fn is_degraded(&self) -> bool {
        self.total > 0
    }

    /// Hand out the kept faults and reset the count.
    pub fn take(&mut self) -> Vec<NumericFault> {
        self.total = 0;
        std::mem::take(&mut self.faults)
    }

    pub fn clear(&mut self) {
        self.faults.clear();
        self.total = 0;
    }
}

/// Configuration for the bridge and the reference driver.
#[derive(Debug, Clone, PartialEq)]
pub struct SolverConfig {
    /// Global absolute tolerance
    pub atol: f64,
    /// Smallest non-zero declared voltage tolerance scale
    pub voltage_tolerance: Option<f64>,
    pub stiffness: Stiffness,
    pub layout: LayoutMode,
    /// Partitions that unassigned trees are distributed over
    pub threads: usize,
    /// Driver step (ms)
    pub dt: f64,
    /// Driver stop time (ms)
    pub tstop: f64,
}

impl Default for SolverConfig {
    fn default() -> Self {
        Self {
            atol: DEFAULT_ATOL,
            voltage_tolerance: None,
            stiffness: Stiffness::default(),
            layout: LayoutMode::default(),
            threads: 1,
            dt: DEFAULT_DT,
            tstop: DEFAULT_TSTOP,
        }
    }
}

impl SolverConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_atol(mut self, atol: f64) -> Self {
        self.atol = atol;
        self
    }

    /// Declare a voltage tolerance scale. Repeated declarations keep the
    /// smallest; zero means "not declared" and is ignored.
    pub fn with_voltage_tolerance(mut self, scale: f64) -> Self {
        if scale > 0.0 {
            self.voltage_tolerance = Some(match self.voltage_tolerance {
                Some(current) => current.min(scale),
                None => scale,
            });
        }
        self
    }

    pub fn with_stiffness(mut self, stiffness: Stiffness) -> Self {
        self.stiffness = stiffness;
        self
    }

    pub fn with_layout(mut self, layout: LayoutMode) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_threads(mut self, threads: usize) -> Self {
        self.threads = threads.max(1);
        self
    }

    pub fn with_dt(mut self, dt: f64) -> Self {
        self.dt = dt;
        self
    }

    pub fn with_tstop(mut self, tstop: f64) -> Self {
        self.tstop = tstop;
        self
    }

    /// Scale applied to voltage equations: the smallest declared voltage
    /// tolerance, never more than 1.
    pub fn vtol(&self) -> f64 {
        self.voltage_tolerance.map_or(1.0, |r| r.min(1.0))
    }

    pub fn validate(&self) -> crate::Result<()> {
        use crate::error::DendriteError;
        if !(self.atol > 0.0) {
            return Err(DendriteError::config(format!("atol must be positive, got {}", self.atol)));
        }
        if !(self.dt > 0.0) {
            return Err(DendriteError::config(format!("dt must be positive, got {}", self.dt)));
        }
        if !(self.tstop >= 0.0) {
            return Err(DendriteError::config(format!("tstop must not be negative, got {}", self.tstop)));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_vtol_keeps_smallest_and_caps_at_one() {
        let config = SolverConfig::new();
        assert_eq!(config.vtol(), 1.0);

        let config = SolverConfig::new()
            .with_voltage_tolerance(0.5)
            .with_voltage_tolerance(0.0)
            .with_voltage_tolerance(0.1)
            .with_voltage_tolerance(0.3);
        assert_eq!(config.vtol(), 0.1);

        let config = SolverConfig::new().with_voltage_tolerance(4.0);
        assert_eq!(config.vtol(), 1.0);
    }

    #[test]
    fn test_config_validation() {
        assert!(SolverConfig::new().validate().is_ok());
        assert!(SolverConfig::new().with_atol(0.0).validate().is_err());
        assert!(SolverConfig::new().with_dt(-1.0).validate().is_err());
    }

    fn fault(instance: usize) -> NumericFault {
        NumericFault {
            partition: PartitionId(0),
            phase: FaultPhase::OdeSpec,
            mechanism: "cadecay",
            list: 0,
            instance,
            t: 0.0,
            detail: "negative time constant",
        }
    }

    #[test]
    fn test_diagnostics_stay_bounded() {
        let mut diagnostics = Diagnostics::new();
        for i in 0..10_000 {
            diagnostics.record(fault(i));
        }
        assert_eq!(diagnostics.faults().len(), FAULT_SAMPLE);
        assert_eq!(diagnostics.faults()[0].instance, 0);
        assert_eq!(diagnostics.fault_count(), 10_000);
        assert_eq!(diagnostics.dropped(), 10_000 - FAULT_SAMPLE);
        assert!(diagnostics.is_degraded());

        assert_eq!(diagnostics.take().len(), FAULT_SAMPLE);
        assert!(!diagnostics.is_degraded());
        diagnostics.record(fault(1));
        assert_eq!(diagnostics.fault_count(), 1);
    }

    #[test]
    fn test_keyword_parsing() {
        assert_eq!(Stiffness::from_level(2), Some(Stiffness::Full));
        assert_eq!(Stiffness::from_level(3), None);
        assert_eq!(LayoutMode::from_keyword("DAE"), Some(LayoutMode::Implicit));
        assert_eq!(LayoutMode::from_keyword("sparse"), None);
    }
}
