//! Membrane mechanism capability tables.
//!
//! A mechanism type contributes membrane current and/or its own ODE states at
//! the nodes it is inserted into. Each type is a [`Mechanism`] exposing optional
//! capabilities; the solver asks for a capability and skips the phase when the
//! type does not provide it:
//!
//! - [`MembraneCurrent`]: outward current and its slope at a membrane potential
//! - [`OdeStates`]: state count, mapping, derivative kernel, diagonal Jacobian solve
//! - [`Synonym`]: reconcile an aliased view of a state with its authoritative storage
//! - [`StepHooks`]: blocks run at fixed points of each evaluation and step
//!
//! Built-in types:
//! - Density: [`Passive`] leak, [`HodgkinHuxley`] squid axon channels, [`CaDecay`] calcium pool
//! - Point processes: [`IClamp`] current clamp, [`ExpSyn`] exponential synapse
//!
//! Units: mV, ms, nA, uS, nF.

mod cadecay;
mod expsyn;
mod hh;
mod iclamp;
mod passive;

pub use cadecay::CaDecay;
pub use expsyn::ExpSyn;
pub use hh::HodgkinHuxley;
pub use iclamp::IClamp;
pub use passive::Passive;

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{DendriteError, Result};
use crate::model::{Handle, Instances, MechTypeId, NodeArrays, NodeId};

/// Role of a field in a mechanism's per-instance table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    /// Settable from a description file
    Parameter,
    /// ODE state, settable as an initial value
    State,
    /// Derivative slot paired with a state
    Derivative,
    /// Computed by the mechanism (currents, diagnostics)
    Assigned,
}

/// Declaration of one field of a mechanism instance.
#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub name: &'static str,
    pub default: f64,
    pub kind: FieldKind,
}

impl FieldSpec {
    pub const fn parameter(name: &'static str, default: f64) -> Self {
        Self { name, default, kind: FieldKind::Parameter }
    }

    pub const fn state(name: &'static str, default: f64) -> Self {
        Self { name, default, kind: FieldKind::State }
    }

    pub const fn derivative(name: &'static str) -> Self {
        Self { name, default: 0.0, kind: FieldKind::Derivative }
    }

    pub const fn assigned(name: &'static str) -> Self {
        Self { name, default: 0.0, kind: FieldKind::Assigned }
    }
}

/// Pairing of a state field with its derivative field and tolerance scale.
#[derive(Debug, Clone, Copy)]
pub struct StateSlot {
    pub value: usize,
    pub derivative: usize,
    /// Multiplies the global absolute tolerance for this state
    pub tolerance: f64,
}

/// Handles and tolerance scales for the states of one instance.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StateMap {
    pub values: Vec<Handle>,
    pub derivatives: Vec<Handle>,
    pub tolerances: Vec<f64>,
}

/// Time information handed to mechanism kernels.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StepContext {
    /// Current time (ms)
    pub t: f64,
    /// Step size hint, never zero
    pub dt: f64,
    /// Effective step size of the implicit system (equal to `dt` outside `solve`)
    pub gamma: f64,
}

/// Outward membrane current and its slope at one instance.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CurrentSample {
    /// Outward current (nA)
    pub current: f64,
    /// dI/dv (uS)
    pub conductance: f64,
}

/// Domain error raised by a kernel, e.g. a rate expression evaluated outside
/// its domain. Reported as a numeric fault, never aborts the step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DomainError {
    pub detail: &'static str,
}

impl DomainError {
    pub const fn new(detail: &'static str) -> Self {
        Self { detail }
    }
}

impl fmt::Display for DomainError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.detail)
    }
}

/// Return `x` if finite, a domain error otherwise.
pub fn finite(x: f64, detail: &'static str) -> std::result::Result<f64, DomainError> {
    if x.is_finite() {
        Ok(x)
    } else {
        Err(DomainError::new(detail))
    }
}

/// Current contribution of a mechanism type.
pub trait MembraneCurrent: Send + Sync {
    /// Outward current and dI/dv of one instance at membrane potential `v`.
    /// May store assigned values (such as the current itself) in `row`.
    fn evaluate(
        &self,
        row: &mut [f64],
        v: f64,
        ctx: &StepContext,
    ) -> std::result::Result<CurrentSample, DomainError>;
}

/// ODE states owned by a mechanism type.
pub trait OdeStates: Send + Sync {
    /// State/derivative field pairs, in equation order.
    fn slots(&self) -> &[StateSlot];

    /// Number of states per instance.
    fn count(&self) -> usize {
        self.slots().len()
    }

    /// Handles of one instance's states. `base_index` is the position of the
    /// first state in the partition's equation layout.
    fn map(&self, list: usize, instance: usize, instances: &Instances, base_index: usize) -> StateMap {
        let _ = base_index;
        let mut map = StateMap::default();
        for slot in self.slots() {
            map.values.push(Handle::Field {
                list,
                offset: instances.offset(instance, slot.value),
            });
            map.derivatives.push(Handle::Field {
                list,
                offset: instances.offset(instance, slot.derivative),
            });
            map.tolerances.push(slot.tolerance);
        }
        map
    }

    /// Write the state derivatives of one instance into its derivative fields.
    fn spec(&self, row: &mut [f64], v: f64, ctx: &StepContext) -> std::result::Result<(), DomainError>;

    /// The derivative fields hold `b`; replace them with the solution of
    /// `(1 - gamma * J) x = b` using the diagonal of the state Jacobian.
    fn matsol(&self, row: &mut [f64], v: f64, ctx: &StepContext) -> std::result::Result<(), DomainError>;
}

/// Keeps an aliased view of a state consistent with the state itself.
pub trait Synonym: Send + Sync {
    fn reconcile(&self, row: &[f64], node: NodeId, nodes: &mut NodeArrays);
}

/// Point in the evaluation sequence where a [`StepHooks`] block runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// After algebraic potentials are resolved, before membrane currents
    BeforeBreakpoint,
    /// After the derivatives are gathered
    AfterSolve,
    /// Before records sample an accepted step
    BeforeStep,
}

/// Per-instance blocks that run outside the current and state kernels, e.g.
/// to copy a potential into a field or update a running measure.
pub trait StepHooks: Send + Sync {
    /// Points this type has a block for.
    fn points(&self) -> &[HookPoint];

    fn run(
        &self,
        point: HookPoint,
        row: &mut [f64],
        v: f64,
        ctx: &StepContext,
    ) -> std::result::Result<(), DomainError>;
}

/// A registered mechanism type.
pub trait Mechanism: Send + Sync + fmt::Debug {
    /// Keyword used in description files.
    fn name(&self) -> &'static str;

    /// Per-instance field table.
    fn fields(&self) -> &'static [FieldSpec];

    /// Point processes are located at a single node and are the only
    /// mechanisms that contribute current at zero-capacitance nodes.
    fn is_point_process(&self) -> bool {
        false
    }

    fn current(&self) -> Option<&dyn MembraneCurrent> {
        None
    }

    fn ode(&self) -> Option<&dyn OdeStates> {
        None
    }

    fn synonym(&self) -> Option<&dyn Synonym> {
        None
    }

    fn hooks(&self) -> Option<&dyn StepHooks> {
        None
    }

    fn has_current(&self) -> bool {
        self.current().is_some()
    }

    /// Set states to their initial values at membrane potential `v`.
    fn initialize(&self, row: &mut [f64], v: f64) {
        let _ = (row, v);
    }
}

/// Field index of `name` in a mechanism's table.
pub fn field_index(mechanism: &dyn Mechanism, name: &str) -> Option<usize> {
    mechanism.fields().iter().position(|f| f.name == name)
}

/// Build an instance row from defaults and user parameters.
pub fn build_row(mechanism: &dyn Mechanism, owner: &str, params: &HashMap<String, f64>) -> Result<Vec<f64>> {
    let fields = mechanism.fields();
    let mut row: Vec<f64> = fields.iter().map(|f| f.default).collect();
    for (name, &value) in params {
        let idx = field_index(mechanism, name).ok_or_else(|| DendriteError::InvalidParameter {
            owner: owner.to_string(),
            param: name.clone(),
            message: format!("'{}' has no such field", mechanism.name()),
        })?;
        match fields[idx].kind {
            FieldKind::Parameter | FieldKind::State => row[idx] = value,
            FieldKind::Derivative | FieldKind::Assigned => {
                return Err(DendriteError::InvalidParameter {
                    owner: owner.to_string(),
                    param: name.clone(),
                    message: "field is computed and cannot be set".to_string(),
                });
            }
        }
    }
    Ok(row)
}

/// Registry of mechanism types. Type ids follow registration order, which is
/// also the order mechanism lists are visited in a partition.
#[derive(Debug, Default, Clone)]
pub struct MechanismRegistry {
    types: Vec<Arc<dyn Mechanism>>,
    by_name: HashMap<String, MechTypeId>,
}

impl MechanismRegistry {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry holding the built-in mechanism types.
    pub fn builtin() -> Self {
        let mut registry = Self::new();
        registry.register_builtin(Arc::new(Passive));
        registry.register_builtin(Arc::new(HodgkinHuxley));
        registry.register_builtin(Arc::new(CaDecay));
        registry.register_builtin(Arc::new(IClamp));
        registry.register_builtin(Arc::new(ExpSyn));
        registry
    }

    fn register_builtin(&mut self, mechanism: Arc<dyn Mechanism>) {
        let id = MechTypeId(self.types.len());
        self.by_name.insert(mechanism.name().to_ascii_lowercase(), id);
        self.types.push(mechanism);
    }

    /// Register a mechanism type and return its id.
    pub fn register(&mut self, mechanism: Arc<dyn Mechanism>) -> Result<MechTypeId> {
        let key = mechanism.name().to_ascii_lowercase();
        if self.by_name.contains_key(&key) {
            return Err(DendriteError::config(format!(
                "mechanism '{}' is already registered",
                mechanism.name()
            )));
        }
        let id = MechTypeId(self.types.len());
        self.by_name.insert(key, id);
        self.types.push(mechanism);
        Ok(id)
    }

    /// Look up a type id by keyword (case-insensitive).
    pub fn lookup(&self, name: &str) -> Option<MechTypeId> {
        self.by_name.get(&name.to_ascii_lowercase()).copied()
    }

    /// Get a mechanism type by id.
    pub fn get(&self, id: MechTypeId) -> Option<&Arc<dyn Mechanism>> {
        self.types.get(id.0)
    }

    pub fn len(&self) -> usize {
        self.types.len()
    }

    pub fn is_empty(&self) -> bool {
        self.types.is_empty()
    }
}
