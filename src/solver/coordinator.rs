//! Partition coordinator.
//!
//! [`CableSystem`] owns every partition of one rank and implements
//! [`OdeSystem`] over their concatenated equation layouts. Each callback runs
//! as one or more phases; a phase visits every partition on its own pool
//! worker and joins before the next begins. Quantities shared between
//! partitions (split roots, global counts) are only combined on the calling
//! thread between phases.

use std::collections::HashMap;
use std::sync::Arc;

use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use tracing::{debug, info};

use super::auxiliary::AuxiliaryBlock;
use super::bridge::{gather_y, gather_ydot, reconcile_synonyms, scatter_y, scatter_ydot};
use super::evaluator::{
    before_after, compute_lhs, compute_ode_spec, compute_rhs, divide_capacitance, initialize_instance,
    initialize_partition, ode_matsol, scale_rhs_for_solve, FaultLog,
};
use super::layout::{assemble, EquationLayout};
use super::nocap::NoCapStructure;
use super::playrec::{Continuous, Record, RecordId};
use super::transport::{LocalTransport, SplitSums, Transport};
use super::tree::{HinesSolver, TreeSolver};
use super::{
    Diagnostics, LayoutMode, NumericFault, OdeSystem, SolverConfig, Stiffness, ZERO_STEP_SENTINEL,
};
use crate::error::{DendriteError, Result};
use crate::mechanisms::{build_row, HookPoint, MechanismRegistry, StepContext};
use crate::model::{Handle, InstanceRef, Model, NodeArrays, NodeId, Partition, SplitKey};

/// One partition with everything the callbacks need to process it.
#[derive(Debug)]
pub struct PartitionContext {
    pub partition: Partition,
    pub layout: EquationLayout,
    pub nocap: NoCapStructure,
    aux: Option<Box<dyn AuxiliaryBlock>>,
    plays: Vec<Box<dyn Continuous>>,
    records: Vec<Record>,
    log: FaultLog,
    /// Roots shared with other partitions
    split_roots: Vec<(usize, SplitKey)>,
    /// `dv/dt` of capacitive split roots from the cross-partition sum
    split_dvdt: Vec<(usize, f64)>,
}

impl PartitionContext {
    fn new(partition: Partition) -> Self {
        let log = FaultLog::new(partition.id);
        Self {
            partition,
            layout: EquationLayout::default(),
            nocap: NoCapStructure::default(),
            aux: None,
            plays: Vec::new(),
            records: Vec::new(),
            log,
            split_roots: Vec::new(),
            split_dvdt: Vec::new(),
        }
    }

    /// Equations owned by this partition.
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn aux(&self) -> Option<&dyn AuxiliaryBlock> {
        self.aux.as_deref()
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    fn aux_scales(&self) -> Vec<f64> {
        match &self.aux {
            Some(block) => {
                let mut scales = vec![1.0; block.count()];
                block.abstol(&mut scales);
                scales
            }
            None => Vec::new(),
        }
    }

    fn assemble(&mut self, mode: LayoutMode) -> Result<()> {
        self.layout = assemble(&self.partition, mode, self.aux_scales())?;
        self.nocap = match mode {
            LayoutMode::Explicit => NoCapStructure::build(&self.partition),
            LayoutMode::Implicit => NoCapStructure::default(),
        };
        let nodes = &self.partition.nodes;
        self.split_roots = (0..nodes.root_end)
            .filter_map(|i| nodes.split[i].map(|key| (i, key)))
            .collect();
        self.split_dvdt.clear();
        Ok(())
    }

    /// Split roots that are capacitive (`Some(true)`), algebraic
    /// (`Some(false)`), or all of them.
    fn split_nodes(&self, capacitive: Option<bool>) -> impl Iterator<Item = (usize, SplitKey)> + '_ {
        let nodes = &self.partition.nodes;
        self.split_roots
            .iter()
            .copied()
            .filter(move |&(i, _)| capacitive.map_or(true, |c| nodes.has_capacitance(i) == c))
    }

    /// Move every record and play target after a storage move.
    fn relocate(&mut self, map: impl Fn(Handle) -> Handle) {
        for play in &mut self.plays {
            play.relocate(&map);
        }
        for record in &mut self.records {
            record.relocate(&map);
        }
    }

    fn play(&mut self, t: f64) {
        for play in &mut self.plays {
            play.continuous(t, &mut self.partition);
        }
    }

    fn record(&mut self, ctx: &StepContext) {
        self.log.begin(ctx.t);
        before_after(&mut self.partition, HookPoint::BeforeStep, ctx, &mut self.log);
        for record in &mut self.records {
            record.sample(ctx.t, &self.partition);
        }
    }

    fn scatter(&mut self, y: &[f64], transport: &dyn Transport) {
        let n = self.layout.aux_offset();
        scatter_y(&mut self.partition, &self.layout, &y[..n]);
        transport.after_scatter(&mut self.partition);
    }

    fn gather(&mut self, y: &mut [f64], transport: &dyn Transport) {
        let n = self.layout.aux_offset();
        transport.before_gather(&mut self.partition);
        gather_y(&self.partition, &self.layout, &mut y[..n]);
    }

    fn initialize(&mut self, t: f64, y: &mut [f64], transport: &dyn Transport) {
        initialize_partition(&mut self.partition);
        reconcile_synonyms(&mut self.partition);
        self.play(t);
        self.gather(y, transport);
        let n = self.layout.aux_offset();
        if let Some(aux) = self.aux.as_mut() {
            aux.initialize(&mut y[n..]);
        }
    }

    /// Nothing to evaluate: no nodes and no equations. A partition holding
    /// only algebraic nodes has no equations but still takes part in the
    /// current balance of the roots it shares.
    fn is_idle(&self) -> bool {
        self.layout.is_empty() && self.partition.nodes.is_empty()
    }

    /// Play, scatter, and local sums at algebraic nodes.
    fn fun_begin(&mut self, ctx: &StepContext, y: &[f64], transport: &dyn Transport) {
        self.log.begin(ctx.t);
        self.play(ctx.t);
        if self.is_idle() {
            return;
        }
        self.scatter(y, transport);
        self.nocap.accumulate(&mut self.partition, ctx, &mut self.log);
    }

    /// Algebraic potentials, voltage transfer, auxiliary derivatives, and
    /// the current balance.
    fn fun_middle(&mut self, ctx: &StepContext, y: &[f64], ydot: &mut [f64], transport: &dyn Transport) {
        if self.is_idle() {
            return;
        }
        self.nocap.finalize(&mut self.partition.nodes);
        transport.transfer_voltages(&mut self.partition);
        if self.layout.is_empty() {
            return;
        }
        if let Some(aux) = self.aux.as_mut() {
            let n = self.layout.aux_offset();
            aux.fun(ctx.t, &y[n..], &mut ydot[n..]);
        }
        before_after(&mut self.partition, HookPoint::BeforeBreakpoint, ctx, &mut self.log);
        compute_rhs(&mut self.partition, ctx, &mut self.log);
    }

    /// Mechanism derivatives, `dv/dt`, and the gather.
    fn fun_end(&mut self, ctx: &StepContext, ydot: &mut [f64]) {
        if self.layout.is_empty() {
            return;
        }
        compute_ode_spec(&mut self.partition, ctx, &mut self.log);
        divide_capacitance(&mut self.partition.nodes);
        for &(i, dvdt) in &self.split_dvdt {
            self.partition.nodes.rhs[i] = dvdt;
        }
        let n = self.layout.aux_offset();
        gather_ydot(&self.partition, &self.layout, &mut ydot[..n]);
        before_after(&mut self.partition, HookPoint::AfterSolve, ctx, &mut self.log);
    }

    fn fun(&mut self, ctx: &StepContext, y: &[f64], ydot: &mut [f64], transport: &dyn Transport) {
        self.fun_begin(ctx, y, transport);
        self.fun_middle(ctx, y, ydot, transport);
        self.fun_end(ctx, ydot);
    }

    /// Matrix, right-hand side, and elimination toward the roots.
    fn solve_begin(&mut self, ctx: &StepContext, b: &[f64], tree: &dyn TreeSolver) {
        self.log.begin(ctx.t);
        if self.is_idle() {
            return;
        }
        let cj = 1.0 / ctx.gamma;
        compute_lhs(&mut self.partition, ctx, cj, &mut self.log);
        let n = self.layout.aux_offset();
        scatter_ydot(&mut self.partition, &self.layout, &b[..n]);
        scale_rhs_for_solve(&mut self.partition.nodes, cj);
        tree.triangularize(&mut self.partition.nodes);
    }

    /// Substitution, mechanism states, and the gather into `b`.
    fn solve_end(
        &mut self,
        ctx: &StepContext,
        stiffness: Stiffness,
        b: &mut [f64],
        y: &[f64],
        tree: &dyn TreeSolver,
    ) {
        if self.is_idle() {
            return;
        }
        tree.back_substitute(&mut self.partition.nodes);
        if stiffness == Stiffness::Full {
            ode_matsol(&mut self.partition, ctx, &mut self.log);
        }
        // Otherwise the state entries of b pass through unchanged. Whether
        // they should be multiplied by gamma is an open question.
        let n = self.layout.aux_offset();
        gather_ydot(&self.partition, &self.layout, &mut b[..n]);
        if let Some(aux) = self.aux.as_mut() {
            aux.solve(ctx.gamma, &mut b[n..], &y[n..]);
        }
    }
}

/// Run `f` on every context, on the pool when there is one.
fn run<F>(pool: Option<&ThreadPool>, contexts: &mut [PartitionContext], f: F)
where
    F: Fn(&mut PartitionContext) + Send + Sync,
{
    match pool {
        Some(pool) => pool.install(|| contexts.par_iter_mut().for_each(&f)),
        None => contexts.iter_mut().for_each(&f),
    }
}

/// Run `f` on every context paired with its item.
fn run_zip<T, F>(pool: Option<&ThreadPool>, contexts: &mut [PartitionContext], items: Vec<T>, f: F)
where
    T: Send,
    F: Fn(&mut PartitionContext, T) + Send + Sync,
{
    match pool {
        Some(pool) => pool.install(|| {
            contexts
                .par_iter_mut()
                .zip(items)
                .for_each(|(c, item)| f(c, item))
        }),
        None => contexts.iter_mut().zip(items).for_each(|(c, item)| f(c, item)),
    }
}

fn try_run<F>(pool: Option<&ThreadPool>, contexts: &mut [PartitionContext], f: F) -> Result<()>
where
    F: Fn(&mut PartitionContext) -> Result<()> + Send + Sync,
{
    match pool {
        Some(pool) => pool.install(|| contexts.par_iter_mut().try_for_each(&f)),
        None => contexts.iter_mut().try_for_each(&f),
    }
}

/// Cut a flat vector into consecutive per-partition slices.
fn split_flat<'a>(flat: &'a [f64], sizes: &[usize]) -> Vec<&'a [f64]> {
    let mut rest = flat;
    sizes
        .iter()
        .map(|&n| {
            let (head, tail) = rest.split_at(n);
            rest = tail;
            head
        })
        .collect()
}

fn split_flat_mut<'a>(flat: &'a mut [f64], sizes: &[usize]) -> Vec<&'a mut [f64]> {
    let mut rest = flat;
    let mut out = Vec::with_capacity(sizes.len());
    for &n in sizes {
        let (head, tail) = std::mem::take(&mut rest).split_at_mut(n);
        out.push(head);
        rest = tail;
    }
    out
}

/// The cable equation of one rank, as seen by an adaptive integrator.
#[derive(Debug)]
pub struct CableSystem {
    contexts: Vec<PartitionContext>,
    pool: Option<ThreadPool>,
    transport: Arc<dyn Transport>,
    tree: Arc<dyn TreeSolver>,
    config: SolverConfig,
    structure_changed: bool,
    assembled: bool,
    requires_integration: bool,
    neq: usize,
    global_neq: usize,
    /// Step size hint from the integrator
    h: f64,
    /// Time of the last derivative evaluation
    t: f64,
    diagnostics: Diagnostics,
}

impl CableSystem {
    /// Coordinator for a single rank.
    pub fn new(partitions: Vec<Partition>, config: SolverConfig) -> Result<Self> {
        Self::with_transport(partitions, config, Arc::new(LocalTransport))
    }

    /// Coordinator for one rank of a distributed model.
    pub fn with_transport(
        partitions: Vec<Partition>,
        config: SolverConfig,
        transport: Arc<dyn Transport>,
    ) -> Result<Self> {
        config.validate()?;
        if config.layout == LayoutMode::Implicit && (partitions.len() > 1 || transport.size() > 1) {
            return Err(DendriteError::config(format!(
                "the implicit layout needs a single partition on a single rank, got {} partitions on {} ranks",
                partitions.len(),
                transport.size()
            )));
        }

        let pool = if partitions.len() > 1 {
            Some(
                ThreadPoolBuilder::new()
                    .num_threads(partitions.len())
                    .thread_name(|i| format!("dendrite-{}", i))
                    .build()?,
            )
        } else {
            None
        };

        Ok(Self {
            contexts: partitions.into_iter().map(PartitionContext::new).collect(),
            pool,
            transport,
            tree: Arc::new(HinesSolver),
            config,
            structure_changed: true,
            assembled: false,
            requires_integration: false,
            neq: 0,
            global_neq: 0,
            h: 0.0,
            t: 0.0,
            diagnostics: Diagnostics::new(),
        })
    }

    pub fn from_model(model: Model) -> Result<Self> {
        Self::new(model.partitions, model.config)
    }

    /// Replace the tree elimination routine.
    pub fn with_tree_solver(mut self, tree: Arc<dyn TreeSolver>) -> Self {
        self.tree = tree;
        self
    }

    // ============ Assembly ============

    /// Whether integration needs a layout at all, evaluated only after a
    /// structure change (an unchanged structure returns `false`).
    ///
    /// A rank without nodes still needs one when the implicit layout is
    /// selected or an auxiliary block exists on any rank. When distributed,
    /// every rank must call this together.
    pub fn init_global(&mut self) -> Result<bool> {
        if !self.structure_changed {
            return Ok(false);
        }
        let has_model = usize::from(self.contexts.iter().any(|c| !c.partition.is_empty()));
        let aux: usize = self.contexts.iter().map(|c| c.aux.as_ref().map_or(0, |a| a.count())).sum();
        let mut needs = has_model + aux;
        if self.transport.size() > 1 {
            needs = self.transport.sum_reduce(needs);
        }
        let required = self.config.layout == LayoutMode::Implicit || needs > 0;
        debug!(rank = self.transport.rank(), needs, required, "checked integration requirement");
        Ok(required)
    }

    /// Assemble every partition's layout and compute offsets and counts.
    pub fn init_eqn(&mut self) -> Result<()> {
        let mode = self.config.layout;
        try_run(self.pool.as_ref(), &mut self.contexts, |c| c.assemble(mode))?;

        let mut offset = 0;
        for c in &mut self.contexts {
            c.layout.offset = offset;
            offset += c.layout.size();
        }
        self.neq = offset;
        self.global_neq = if self.transport.size() > 1 {
            self.transport.sum_reduce(offset)
        } else {
            offset
        };
        self.structure_changed = false;
        self.assembled = true;
        info!(
            rank = self.transport.rank(),
            partitions = self.contexts.len(),
            neq = self.neq,
            global_neq = self.global_neq,
            multisplit = self.is_multisplit(),
            "equation layout assembled"
        );
        Ok(())
    }

    /// Re-assemble if the structure changed since the last assembly.
    pub fn prepare(&mut self) -> Result<()> {
        if !self.structure_changed {
            return Ok(());
        }
        self.requires_integration = self.init_global()?;
        self.init_eqn()
    }

    fn check_assembled(&self) -> Result<()> {
        if self.structure_changed || !self.assembled {
            Err(DendriteError::StaleLayout)
        } else {
            Ok(())
        }
    }

    fn check_callback(&self, operation: &'static str) -> Result<()> {
        self.check_assembled()?;
        if self.config.layout == LayoutMode::Implicit {
            return Err(DendriteError::UnsupportedLayout {
                operation,
                mode: self.config.layout.name(),
            });
        }
        Ok(())
    }

    fn sizes(&self) -> Vec<usize> {
        self.contexts.iter().map(PartitionContext::size).collect()
    }

    /// Whether callbacks sum split roots between phases.
    pub fn is_multisplit(&self) -> bool {
        self.transport.size() > 1 || self.contexts.iter().any(|c| !c.split_roots.is_empty())
    }

    // ============ Callbacks ============

    /// Evaluate `ydot = f(t, y)`.
    pub fn fun(&mut self, t: f64, y: &[f64], ydot: &mut [f64]) -> Result<()> {
        self.check_callback("fun")?;
        DendriteError::check_len("y", self.neq, y.len())?;
        DendriteError::check_len("ydot", self.neq, ydot.len())?;

        self.t = t;
        let ctx = self.step_context(t);
        let sizes = self.sizes();
        let ys = split_flat(y, &sizes);
        let mut ydots = split_flat_mut(ydot, &sizes);

        if self.is_multisplit() {
            self.fun_multisplit(&ctx, &ys, &mut ydots);
        } else {
            let transport = &*self.transport;
            let items: Vec<_> = ys.into_iter().zip(ydots).collect();
            run_zip(self.pool.as_ref(), &mut self.contexts, items, |c, (y, ydot)| {
                c.fun(&ctx, y, ydot, transport)
            });
        }
        self.collect_faults();
        Ok(())
    }

    fn step_context(&self, t: f64) -> StepContext {
        let dt = if self.h == 0.0 { ZERO_STEP_SENTINEL } else { self.h };
        StepContext { t, dt, gamma: dt }
    }

    fn fun_multisplit(&mut self, ctx: &StepContext, ys: &[&[f64]], ydots: &mut [&mut [f64]]) {
        let transport = Arc::clone(&self.transport);
        let transport = &*transport;
        run_zip(self.pool.as_ref(), &mut self.contexts, ys.to_vec(), |c, y| {
            c.fun_begin(ctx, y, transport)
        });

        self.reduce_split_roots(
            Some(false),
            |nodes, i| [nodes.d[i], nodes.rhs[i]],
            |c, i, [d, rhs]| {
                c.partition.nodes.d[i] = d;
                c.partition.nodes.rhs[i] = rhs;
            },
        );

        let items: Vec<_> = ys.iter().zip(ydots.iter_mut()).collect();
        run_zip(self.pool.as_ref(), &mut self.contexts, items, |c, (y, ydot)| {
            c.fun_middle(ctx, y, ydot, transport)
        });

        for c in &mut self.contexts {
            c.split_dvdt.clear();
        }
        self.reduce_split_roots(
            Some(true),
            |nodes, i| [nodes.rhs[i], nodes.cm[i]],
            |c, i, [rhs, cm]| c.split_dvdt.push((i, rhs / cm)),
        );

        let items: Vec<_> = ydots.iter_mut().collect();
        run_zip(self.pool.as_ref(), &mut self.contexts, items, |c, ydot| c.fun_end(ctx, ydot));
    }

    /// Sum two quantities of the selected split roots over every copy, on
    /// this rank and across ranks, and hand each copy the totals.
    fn reduce_split_roots<G, S>(&mut self, capacitive: Option<bool>, get: G, mut set: S)
    where
        G: Fn(&NodeArrays, usize) -> [f64; 2],
        S: FnMut(&mut PartitionContext, usize, [f64; 2]),
    {
        let mut sums = SplitSums::new();
        for c in &self.contexts {
            for (i, key) in c.split_nodes(capacitive) {
                let value = get(&c.partition.nodes, i);
                let total = sums.entry(key).or_insert([0.0; 2]);
                total[0] += value[0];
                total[1] += value[1];
            }
        }
        self.transport.reduce_split(&mut sums);
        for c in &mut self.contexts {
            let roots: Vec<(usize, SplitKey)> = c.split_nodes(capacitive).collect();
            for (i, key) in roots {
                if let Some(&total) = sums.get(&key) {
                    set(c, i, total);
                }
            }
        }
    }

    /// Overwrite `b` with the solution of `(I - gamma * J) x = b`.
    ///
    /// Numeric faults in mechanism kernels are recorded in
    /// [`CableSystem::diagnostics`]; the call still succeeds.
    pub fn solve(&mut self, gamma: f64, b: &mut [f64], y: &[f64]) -> Result<()> {
        self.check_callback("solve")?;
        DendriteError::check_len("b", self.neq, b.len())?;
        DendriteError::check_len("y", self.neq, y.len())?;
        if !(gamma > 0.0) {
            return Err(DendriteError::config(format!("gamma must be positive, got {}", gamma)));
        }

        let ctx = StepContext {
            t: self.t,
            dt: gamma,
            gamma,
        };
        let stiffness = self.config.stiffness;
        let tree = Arc::clone(&self.tree);
        let tree = &*tree;
        let sizes = self.sizes();
        let ys = split_flat(y, &sizes);
        let mut bs = split_flat_mut(b, &sizes);

        if self.is_multisplit() {
            let items: Vec<&[f64]> = bs.iter().map(|b| &**b).collect();
            run_zip(self.pool.as_ref(), &mut self.contexts, items, |c, b| {
                c.solve_begin(&ctx, b, tree)
            });
            self.reduce_split_roots(
                None,
                |nodes, i| [nodes.d[i], nodes.rhs[i]],
                |c, i, [d, rhs]| {
                    c.partition.nodes.d[i] = d;
                    c.partition.nodes.rhs[i] = rhs;
                },
            );
            let items: Vec<_> = bs.iter_mut().zip(ys).collect();
            run_zip(self.pool.as_ref(), &mut self.contexts, items, |c, (b, y)| {
                c.solve_end(&ctx, stiffness, b, y, tree)
            });
        } else {
            let items: Vec<_> = bs.into_iter().zip(ys).collect();
            run_zip(self.pool.as_ref(), &mut self.contexts, items, |c, (b, y)| {
                c.solve_begin(&ctx, &*b, tree);
                c.solve_end(&ctx, stiffness, b, y, tree);
            });
        }
        self.collect_faults();
        Ok(())
    }

    fn collect_faults(&mut self) {
        for c in &mut self.contexts {
            for fault in c.log.drain() {
                self.diagnostics.record(fault);
            }
        }
    }

    /// Absolute tolerance of every equation, in flat order.
    pub fn tolerances(&self) -> Vec<f64> {
        let vtol = self.config.vtol();
        self.contexts
            .iter()
            .flat_map(|c| c.layout.tolerances(self.config.atol, vtol))
            .collect()
    }

    pub fn set_step_size(&mut self, h: f64) {
        self.h = h;
    }

    // ============ State transfer ============

    /// Reset potentials and mechanism states to their initial values and
    /// gather them into `y`.
    pub fn initialize(&mut self, t0: f64, y: &mut [f64]) -> Result<()> {
        self.prepare()?;
        DendriteError::check_len("y", self.neq, y.len())?;
        self.t = t0;
        let transport = &*self.transport;
        let sizes = self.sizes();
        let items = split_flat_mut(y, &sizes);
        run_zip(self.pool.as_ref(), &mut self.contexts, items, |c, y| c.initialize(t0, y, transport));
        Ok(())
    }

    pub fn scatter_y(&mut self, y: &[f64]) -> Result<()> {
        self.check_assembled()?;
        DendriteError::check_len("y", self.neq, y.len())?;
        let transport = &*self.transport;
        let items = split_flat(y, &self.sizes());
        run_zip(self.pool.as_ref(), &mut self.contexts, items, |c, y| c.scatter(y, transport));
        Ok(())
    }

    pub fn gather_y(&mut self, y: &mut [f64]) -> Result<()> {
        self.check_assembled()?;
        DendriteError::check_len("y", self.neq, y.len())?;
        let transport = &*self.transport;
        let sizes = self.sizes();
        let items = split_flat_mut(y, &sizes);
        run_zip(self.pool.as_ref(), &mut self.contexts, items, |c, y| c.gather(y, transport));
        Ok(())
    }

    pub fn scatter_ydot(&mut self, ydot: &[f64]) -> Result<()> {
        self.check_assembled()?;
        DendriteError::check_len("ydot", self.neq, ydot.len())?;
        let items = split_flat(ydot, &self.sizes());
        run_zip(self.pool.as_ref(), &mut self.contexts, items, |c, ydot| {
            let n = c.layout.aux_offset();
            scatter_ydot(&mut c.partition, &c.layout, &ydot[..n]);
        });
        Ok(())
    }

    pub fn gather_ydot(&mut self, ydot: &mut [f64]) -> Result<()> {
        self.dstates(ydot)
    }

    /// Copy the current state values into `y` without synchronization hooks.
    pub fn states(&self, y: &mut [f64]) -> Result<()> {
        self.check_assembled()?;
        DendriteError::check_len("y", self.neq, y.len())?;
        for (c, y) in self.contexts.iter().zip(split_flat_mut(y, &self.sizes())) {
            let n = c.layout.aux_offset();
            gather_y(&c.partition, &c.layout, &mut y[..n]);
        }
        Ok(())
    }

    /// Copy the current derivative storage into `ydot`.
    pub fn dstates(&self, ydot: &mut [f64]) -> Result<()> {
        self.check_assembled()?;
        DendriteError::check_len("ydot", self.neq, ydot.len())?;
        for (c, ydot) in self.contexts.iter().zip(split_flat_mut(ydot, &self.sizes())) {
            let n = c.layout.aux_offset();
            gather_ydot(&c.partition, &c.layout, &mut ydot[..n]);
        }
        Ok(())
    }

    // ============ Play and record ============

    pub fn play_continuous(&mut self, t: f64) {
        run(self.pool.as_ref(), &mut self.contexts, |c| c.play(t));
    }

    /// Sample every record. The driver calls this after each accepted step.
    pub fn record_continuous(&mut self, t: f64) {
        let ctx = self.step_context(t);
        run(self.pool.as_ref(), &mut self.contexts, |c| c.record(&ctx));
        self.collect_faults();
    }

    pub fn add_play(&mut self, partition: usize, play: Box<dyn Continuous>) -> Result<()> {
        self.context_mut(partition)?.plays.push(play);
        Ok(())
    }

    /// Record the value behind `source` after every accepted step.
    pub fn add_record(&mut self, partition: usize, source: Handle) -> Result<RecordId> {
        let context = self.context_mut(partition)?;
        if !context.partition.contains(source) {
            return Err(DendriteError::config(format!(
                "record source {} does not resolve in partition {}",
                source, partition
            )));
        }
        context.records.push(Record::new(source));
        Ok(RecordId {
            partition,
            index: context.records.len() - 1,
        })
    }

    pub fn record(&self, id: RecordId) -> Option<&Record> {
        self.contexts.get(id.partition)?.records.get(id.index)
    }

    pub fn records(&self) -> impl Iterator<Item = (RecordId, &Record)> + '_ {
        self.contexts.iter().enumerate().flat_map(|(partition, c)| {
            c.records
                .iter()
                .enumerate()
                .map(move |(index, r)| (RecordId { partition, index }, r))
        })
    }

    // ============ Structure ============

    /// Handle to a named field of a named mechanism instance.
    pub fn field_handle(&self, instance: &str, field: &str) -> Option<(usize, Handle)> {
        self.contexts
            .iter()
            .enumerate()
            .find_map(|(i, c)| c.partition.field_handle(instance, field).map(|h| (i, h)))
    }

    /// Handle to the potential of a named node.
    pub fn node_handle(&self, name: &str) -> Option<(usize, Handle)> {
        self.contexts
            .iter()
            .enumerate()
            .find_map(|(i, c)| c.partition.find_node(name).map(|n| (i, Handle::Voltage(n))))
    }

    /// Change a node's capacitance. Moving to or from zero changes which
    /// nodes are algebraic, so the layout is invalidated either way.
    pub fn set_capacitance(&mut self, partition: usize, node: NodeId, cm: f64) -> Result<()> {
        if !(cm >= 0.0) {
            return Err(DendriteError::topology(format!("capacitance must not be negative, got {}", cm)));
        }
        let nodes = &mut self.context_mut(partition)?.partition.nodes;
        let slot = nodes
            .cm
            .get_mut(node.0)
            .ok_or_else(|| DendriteError::NodeNotFound { node: node.to_string() })?;
        *slot = cm;
        self.mark_structure_changed();
        Ok(())
    }

    /// Insert a mechanism instance at a node, with its states initialized
    /// at the node's present potential.
    ///
    /// Inserting the first instance of a type adds a mechanism list, which
    /// moves the storage of every later list. Records and plays held by the
    /// system follow their storage; handles obtained earlier from
    /// [`CableSystem::field_handle`] must be looked up again.
    pub fn insert_mechanism(
        &mut self,
        registry: &MechanismRegistry,
        keyword: &str,
        name: &str,
        partition: usize,
        node: NodeId,
        params: &HashMap<String, f64>,
    ) -> Result<InstanceRef> {
        let type_id = registry.lookup(keyword).ok_or_else(|| DendriteError::UnknownMechanism {
            mechanism: keyword.to_string(),
            line: 0,
        })?;
        let mechanism = registry
            .get(type_id)
            .ok_or_else(|| DendriteError::invalid_instance(name, 0, "mechanism type vanished"))?;
        if self.contexts.iter().any(|c| c.partition.find_instance(name).is_some()) {
            return Err(DendriteError::DuplicateInstance { name: name.to_string() });
        }
        let row = build_row(mechanism.as_ref(), name, params)?;
        let context = self.context_mut(partition)?;
        if node.0 >= context.partition.nodes.len() {
            return Err(DendriteError::NodeNotFound { node: node.to_string() });
        }
        let lists = context.partition.mech_lists.len();
        let at = context.partition.insert_instance(type_id, mechanism, node, name, &row);
        if context.partition.mech_lists.len() > lists {
            context.relocate(|h| h.after_list_insert(at.list));
        }
        initialize_instance(&mut context.partition, at);
        debug!(partition, mechanism = keyword, instance = name, list = at.list, "mechanism inserted");
        self.mark_structure_changed();
        Ok(at)
    }

    /// Attach an auxiliary block to a partition, replacing any previous one.
    pub fn set_auxiliary(&mut self, partition: usize, block: Box<dyn AuxiliaryBlock>) -> Result<()> {
        self.context_mut(partition)?.aux = Some(block);
        self.mark_structure_changed();
        Ok(())
    }

    /// Invalidate the layout. The next [`CableSystem::prepare`] re-assembles.
    /// When distributed, every rank must mark the change before the next
    /// assembly.
    pub fn mark_structure_changed(&mut self) {
        self.structure_changed = true;
    }

    // ============ Accessors ============

    fn context_mut(&mut self, partition: usize) -> Result<&mut PartitionContext> {
        let count = self.contexts.len();
        self.contexts.get_mut(partition).ok_or_else(|| {
            DendriteError::config(format!("partition {} out of range ({} partitions)", partition, count))
        })
    }

    pub fn contexts(&self) -> &[PartitionContext] {
        &self.contexts
    }

    pub fn partition(&self, index: usize) -> Option<&Partition> {
        self.contexts.get(index).map(|c| &c.partition)
    }

    pub fn config(&self) -> &SolverConfig {
        &self.config
    }

    pub fn transport(&self) -> &dyn Transport {
        &*self.transport
    }

    /// Equations on this rank.
    pub fn neq(&self) -> usize {
        self.neq
    }

    /// Equations over all ranks.
    pub fn global_neq(&self) -> usize {
        self.global_neq
    }

    pub fn structure_changed(&self) -> bool {
        self.structure_changed
    }

    /// Result of the last [`CableSystem::init_global`] run by
    /// [`CableSystem::prepare`].
    pub fn requires_integration(&self) -> bool {
        self.requires_integration
    }

    pub fn step_size(&self) -> f64 {
        self.h
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    pub fn take_faults(&mut self) -> Vec<NumericFault> {
        self.diagnostics.take()
    }
}

impl OdeSystem for CableSystem {
    fn neq(&self) -> usize {
        self.neq
    }

    fn tolerances(&self) -> Vec<f64> {
        CableSystem::tolerances(self)
    }

    fn set_step_size(&mut self, h: f64) {
        CableSystem::set_step_size(self, h)
    }

    fn fun(&mut self, t: f64, y: &[f64], ydot: &mut [f64]) -> Result<()> {
        CableSystem::fun(self, t, y, ydot)
    }

    fn solve(&mut self, gamma: f64, b: &mut [f64], y: &[f64]) -> Result<()> {
        CableSystem::solve(self, gamma, b, y)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dsl::parse;
    use approx::assert_relative_eq;

    fn system(src: &str) -> CableSystem {
        let model = Model::from_ast(&parse(src).unwrap()).unwrap();
        let mut system = CableSystem::from_model(model).unwrap();
        system.prepare().unwrap();
        system
    }

    #[test]
    fn test_callbacks_need_assembly() {
        let model = Model::from_ast(&parse("node a").unwrap()).unwrap();
        let mut system = CableSystem::from_model(model).unwrap();
        let mut ydot = vec![0.0];
        assert!(matches!(system.fun(0.0, &[0.0], &mut ydot), Err(DendriteError::StaleLayout)));
        system.prepare().unwrap();
        assert!(system.fun(0.0, &[-65.0], &mut ydot).is_ok());
        system.mark_structure_changed();
        assert!(matches!(system.fun(0.0, &[-65.0], &mut ydot), Err(DendriteError::StaleLayout)));
    }

    #[test]
    fn test_dimension_mismatch() {
        let mut system = system("node a\nnode b a g=1");
        let mut ydot = vec![0.0; 3];
        assert!(matches!(
            system.fun(0.0, &[0.0; 2], &mut ydot),
            Err(DendriteError::DimensionMismatch { vector: "ydot", expected: 2, got: 3 })
        ));
    }

    #[test]
    fn test_implicit_layout_rejects_callbacks() {
        let mut system = system(".layout implicit\nnode a\nnode b a g=1 cm=0");
        assert_eq!(system.neq(), 2);
        let mut ydot = vec![0.0; 2];
        assert!(matches!(
            system.fun(0.0, &[0.0; 2], &mut ydot),
            Err(DendriteError::UnsupportedLayout { operation: "fun", mode: "implicit" })
        ));
    }

    #[test]
    fn test_implicit_layout_single_partition_only() {
        let model = Model::from_ast(&parse(".layout implicit\n.threads 2\nnode a").unwrap()).unwrap();
        assert!(matches!(CableSystem::from_model(model), Err(DendriteError::InvalidConfig { .. })));
    }

    #[test]
    fn test_threaded_partitions_match_serial() {
        let src = "node a part=0\nnode a1 a g=0.3\npas pa a g=0.01 e=-70\n\
                   node b part=1 v=-50\nnode b1 b g=0.1 cm=0\nhh hb b";
        let mut threaded = system(&format!(".threads 2\n{}", src));
        let mut serial = system(&src.replace(" part=1", " part=0"));
        assert_eq!(threaded.neq(), serial.neq());

        let mut y = vec![0.0; threaded.neq()];
        threaded.initialize(0.0, &mut y).unwrap();
        let mut ydot_t = vec![0.0; y.len()];
        threaded.fun(0.0, &y, &mut ydot_t).unwrap();

        let mut y_s = vec![0.0; serial.neq()];
        serial.initialize(0.0, &mut y_s).unwrap();
        let mut ydot_s = vec![0.0; y.len()];
        serial.fun(0.0, &y_s, &mut ydot_s).unwrap();

        // Same trees, same order of equations within each tree.
        let mut a = ydot_t.clone();
        let mut b = ydot_s.clone();
        a.sort_by(|x, y| x.total_cmp(y));
        b.sort_by(|x, y| x.total_cmp(y));
        for (x, y) in a.iter().zip(&b) {
            assert_relative_eq!(*x, *y, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_algebraic_only_partition_stays_active() {
        let split = system(".threads 2\nnode s0 cm=0 split=1 part=0\nnode s1 cm=0 split=1 part=1\nnode d s1 g=1");
        let idle: Vec<bool> = split.contexts().iter().map(PartitionContext::is_idle).collect();
        assert_eq!(split.contexts()[0].size(), 0);
        assert_eq!(idle, vec![false, false]);

        let empty = system(".threads 2\nnode a part=1");
        assert!(empty.contexts()[0].is_idle());
    }

    #[test]
    fn test_solve_rejects_non_positive_gamma() {
        let mut system = system("node a");
        let mut b = vec![1.0];
        assert!(system.solve(0.0, &mut b, &[0.0]).is_err());
    }

    #[test]
    fn test_capacitance_edit_changes_layout() {
        let mut system = system("node a\nnode b a g=1");
        assert_eq!(system.neq(), 2);
        system.set_capacitance(0, NodeId(1), 0.0).unwrap();
        assert!(system.structure_changed());
        system.prepare().unwrap();
        assert_eq!(system.neq(), 1);
        assert_eq!(system.contexts()[0].nocap.nodes, vec![1]);

        assert!(system.set_capacitance(0, NodeId(1), -1.0).is_err());
        assert!(matches!(
            system.set_capacitance(0, NodeId(5), 1.0),
            Err(DendriteError::NodeNotFound { .. })
        ));
    }

    #[test]
    fn test_record_requires_resolving_handle() {
        let mut system = system("node a");
        assert!(system.add_record(0, Handle::Voltage(NodeId(3))).is_err());
        assert!(system.add_record(1, Handle::Voltage(NodeId(0))).is_err());
        let id = system.add_record(0, Handle::Voltage(NodeId(0))).unwrap();
        system.record_continuous(0.0);
        assert_eq!(system.record(id).unwrap().values(), &[-65.0]);
    }
}
