//! # Dendrite Core
//!
//! Adaptive-step integration core for multi-compartment neuron models.
//!
//! This library provides:
//! - A line-oriented description language for cable trees and mechanisms
//! - A partitioned model of node arrays and mechanism instance lists
//! - An integrator bridge exposing the cable equation as `ydot = f(t, y)`
//!   and the linear solve `(I - gamma * J) x = b`
//! - A reference fixed-step driver built only on those two callbacks
//!
//! ## Architecture
//!
//! - [`dsl`] - Parser for the model description language
//! - [`model`] - Partitions, node arrays, mechanism storage and handles
//! - [`mechanisms`] - Mechanism capability table and built-in mechanisms
//! - [`solver`] - Equation layout, scatter/gather, callbacks, coordination
//! - [`output`] - Text output of recorded traces
//!
//! ## Usage
//!
//! ```bash
//! dendrite cell.den --tstop 50 > trace.dat
//! ```
//!
//! ```no_run
//! use dendrite_core::{dsl, Model, Simulator};
//!
//! let ast = dsl::parse("node soma\npas leak soma g=0.01 e=-70\n.probe soma")?;
//! let mut sim = Simulator::from_model(Model::from_ast(&ast)?)?;
//! let trace = sim.run(10.0)?;
//! println!("{} samples", trace.len());
//! # Ok::<(), dendrite_core::DendriteError>(())
//! ```
//!
//! ## Integration Method
//!
//! An external adaptive-step integrator owns a flat state vector. Every
//! partition maps a contiguous slice of it onto capacitive node potentials,
//! mechanism states and auxiliary equations. Nodes without capacitance are
//! algebraic and resolved by current balance at the start of each `fun`.
//! Partitions are processed in parallel, one pool worker each, with values at
//! split roots summed between phases.

pub mod dsl;
pub mod error;
pub mod mechanisms;
pub mod model;
pub mod output;
pub mod solver;

// Re-export main types for convenience
pub use error::{DendriteError, Result};
pub use model::Model;
pub use solver::{CableSystem, OdeSystem, Simulator, SolverConfig, Trace};
