//! Cable model representation.
//!
//! A model is a forest of nodes split into partitions. Each [`Partition`]
//! owns its node arrays and the instance lists of the mechanisms inserted into
//! its nodes; storage inside a partition is addressed with [`Handle`]s.

mod graph;
mod partition;
mod types;
mod validate;

pub use graph::{Model, Probe, DEFAULT_CM, DEFAULT_V};
pub use partition::{Extracellular, Instances, MechList, NodeArrays, Partition};
pub use types::*;
pub use validate::validate_model;
