//! Reference driver.
//!
//! A fixed-step linearly-implicit Euler integrator built only on the
//! [`CableSystem`] callbacks. Each step solves
//! `(I - dt * J) dy = dt * f(t, y)` and advances `y += dy`, which is enough to
//! exercise the bridge end to end without an external integrator.

use tracing::{debug, info, warn};

use super::coordinator::CableSystem;
use super::playrec::RecordId;
use crate::error::Result;
use crate::model::{Handle, Model};

/// Recorded node potentials over time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Trace {
    /// Column names, one per recorded node
    pub names: Vec<String>,
    pub times: Vec<f64>,
    /// One column per name, each as long as `times`
    pub columns: Vec<Vec<f64>>,
}

impl Trace {
    /// Number of time points.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        let i = self.names.iter().position(|n| n == name)?;
        self.columns.get(i).map(Vec::as_slice)
    }
}

/// The reference simulator.
#[derive(Debug)]
pub struct Simulator {
    system: CableSystem,
    y: Vec<f64>,
    ydot: Vec<f64>,
    /// Solve operand, overwritten with the step increment
    b: Vec<f64>,
    t: f64,
    dt: f64,
    times: Vec<f64>,
    probes: Vec<(String, RecordId)>,
    initialized: bool,
}

impl Simulator {
    /// Wrap a coordinator. The step is taken from its configuration.
    pub fn new(system: CableSystem) -> Self {
        let dt = system.config().dt;
        Self {
            system,
            y: Vec::new(),
            ydot: Vec::new(),
            b: Vec::new(),
            t: 0.0,
            dt,
            times: Vec::new(),
            probes: Vec::new(),
            initialized: false,
        }
    }

    /// Build a simulator recording the model's probes, or every node when
    /// the description declares none.
    pub fn from_model(model: Model) -> Result<Self> {
        let mut targets: Vec<(String, usize, Handle)> = model
            .probes
            .iter()
            .map(|p| (p.name.clone(), p.partition, Handle::Voltage(p.node)))
            .collect();
        if targets.is_empty() {
            for (pi, partition) in model.partitions.iter().enumerate() {
                for (i, name) in partition.node_names.iter().enumerate() {
                    targets.push((name.clone(), pi, Handle::Voltage(crate::model::NodeId(i))));
                }
            }
        }

        let mut simulator = Self::new(CableSystem::from_model(model)?);
        for (name, partition, handle) in targets {
            simulator.probe(name, partition, handle)?;
        }
        Ok(simulator)
    }

    /// Record `handle` under `name`.
    pub fn probe(&mut self, name: impl Into<String>, partition: usize, handle: Handle) -> Result<RecordId> {
        let id = self.system.add_record(partition, handle)?;
        self.probes.push((name.into(), id));
        Ok(id)
    }

    pub fn system(&self) -> &CableSystem {
        &self.system
    }

    pub fn system_mut(&mut self) -> &mut CableSystem {
        &mut self.system
    }

    pub fn t(&self) -> f64 {
        self.t
    }

    pub fn dt(&self) -> f64 {
        self.dt
    }

    /// Current flat state vector.
    pub fn state(&self) -> &[f64] {
        &self.y
    }

    fn resize(&mut self) {
        let n = self.system.neq();
        self.y.resize(n, 0.0);
        self.ydot.resize(n, 0.0);
        self.b.resize(n, 0.0);
    }

    /// Reset every state to its initial value at `t0` and take the first
    /// sample.
    pub fn initialize(&mut self, t0: f64) -> Result<()> {
        self.system.prepare()?;
        self.resize();
        self.t = t0;
        self.system.initialize(t0, &mut self.y)?;
        self.system.set_step_size(self.dt);
        self.system.fun(t0, &self.y, &mut self.ydot)?;
        self.system.record_continuous(t0);
        self.times.clear();
        self.times.push(t0);
        self.initialized = true;
        debug!(neq = self.y.len(), t0, "simulator initialized");
        Ok(())
    }

    /// Advance one step of `dt`.
    pub fn step(&mut self) -> Result<()> {
        if self.system.structure_changed() {
            // Carry the current storage over into the new layout. Inserted
            // instances were initialized when they were added.
            self.system.prepare()?;
            self.resize();
            self.system.gather_y(&mut self.y)?;
            self.system.fun(self.t, &self.y, &mut self.ydot)?;
        }

        let h = self.dt;
        self.system.set_step_size(h);
        for (b, &f) in self.b.iter_mut().zip(&self.ydot) {
            *b = h * f;
        }
        self.system.solve(h, &mut self.b, &self.y)?;
        for (y, &dy) in self.y.iter_mut().zip(&self.b) {
            *y += dy;
        }
        self.t += h;

        self.system.fun(self.t, &self.y, &mut self.ydot)?;
        self.system.record_continuous(self.t);
        self.times.push(self.t);
        Ok(())
    }

    /// Integrate from the current time (0 if not initialized) to `tstop` and
    /// return the recorded trace.
    pub fn run(&mut self, tstop: f64) -> Result<Trace> {
        if !self.initialized {
            self.initialize(0.0)?;
        }
        info!(
            neq = self.system.neq(),
            dt = self.dt,
            tstop,
            "starting simulation"
        );

        let mut steps = 0usize;
        while self.t < tstop - 0.5 * self.dt {
            self.step()?;
            steps += 1;
        }

        let diagnostics = self.system.diagnostics();
        if diagnostics.is_degraded() {
            warn!(
                faults = diagnostics.fault_count(),
                dropped = diagnostics.dropped(),
                "numeric faults occurred, accuracy is not guaranteed"
            );
        }
        info!(steps, t = self.t, "simulation finished");
        Ok(self.trace())
    }

    /// Everything recorded so far.
    pub fn trace(&self) -> Trace {
        let mut trace = Trace {
            times: self.times.clone(),
            ..Trace::default()
        };
        for (name, id) in &self.probes {
            let values = self.system.record(*id).map(|r| r.values().to_vec()).unwrap_or_default();
            trace.names.push(name.clone());
            trace.columns.push(values);
        }
        trace
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parse;
    use approx::assert_relative_eq;

    fn simulator(src: &str) -> Simulator {
        let model = Model::from_ast(&parse(src).unwrap()).unwrap();
        Simulator::from_model(model).unwrap()
    }

    #[test]
    fn test_passive_decay_to_reversal() {
        let mut sim = simulator(".dt 0.1\n.probe soma\nnode soma cm=1 v=-50\npas leak soma g=0.1 e=-70");
        let trace = sim.run(100.0).unwrap();
        let v = trace.column("soma").unwrap();
        assert_eq!(v.len(), trace.len());
        assert_eq!(v[0], -50.0);
        // tau = cm / g = 10 ms, so after 10 tau the potential has settled.
        assert_relative_eq!(*v.last().unwrap(), -70.0, epsilon = 1e-2);
        assert!(v.windows(2).all(|w| w[1] <= w[0]));
    }

    #[test]
    fn test_records_every_node_without_probes() {
        let mut sim = simulator(".tstop 0.1\nnode a\nnode b a g=1 cm=0");
        let trace = sim.run(0.1).unwrap();
        assert_eq!(trace.names, vec!["a", "b"]);
        assert_eq!(trace.len(), 5);
        // b has no capacitance and no currents, so it follows a.
        for (a, b) in trace.columns[0].iter().zip(&trace.columns[1]) {
            assert_relative_eq!(*a, *b);
        }
    }

    #[test]
    fn test_step_after_structure_edit() {
        let mut sim = simulator("node a v=-60");
        sim.initialize(0.0).unwrap();
        sim.step().unwrap();
        assert_eq!(sim.state().len(), 1);

        let registry = crate::mechanisms::MechanismRegistry::builtin();
        let params = [("g".to_string(), 0.5)].into_iter().collect();
        sim.system_mut()
            .insert_mechanism(&registry, "pas", "leak", 0, crate::model::NodeId(0), &params)
            .unwrap();
        sim.step().unwrap();
        assert!(sim.state()[0] < -60.0);
    }

    #[test]
    fn test_inserted_channel_starts_at_steady_state() {
        use crate::mechanisms::{HodgkinHuxley, Mechanism};

        let mut sim = simulator("node a v=-60");
        sim.initialize(0.0).unwrap();
        let registry = crate::mechanisms::MechanismRegistry::builtin();
        sim.system_mut()
            .insert_mechanism(&registry, "hh", "h1", 0, crate::model::NodeId(0), &Default::default())
            .unwrap();
        let (partition, m) = sim.system().field_handle("h1", "m").unwrap();
        let mut expected: Vec<f64> = HodgkinHuxley.fields().iter().map(|f| f.default).collect();
        HodgkinHuxley.initialize(&mut expected, -60.0);
        assert_eq!(sim.system().partition(partition).unwrap().get(m), Some(expected[6]));
        assert!(expected[6] != HodgkinHuxley.fields()[6].default);

        sim.step().unwrap();
        // v, m, h, n
        assert_eq!(sim.state().len(), 4);
        // Near steady state nothing moves much in one step.
        assert!((sim.state()[1] - expected[6]).abs() < 1e-3);
    }
}
