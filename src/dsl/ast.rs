//! Abstract Syntax Tree types for the model description language.

use std::collections::HashMap;

use crate::solver::{LayoutMode, Stiffness};

/// Complete AST representation of a parsed model description.
#[derive(Debug, Clone, Default)]
pub struct ModelAst {
    /// Node declarations in file order
    pub nodes: Vec<NodeDef>,
    /// Mechanism instances in file order
    pub mechanisms: Vec<MechanismDef>,
    /// Solver directives in file order; later ones win
    pub directives: Vec<DirectiveDef>,
}

impl ModelAst {
    /// Create a new empty AST.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a directive that overrides earlier ones (line 0 marks a
    /// directive that did not come from the file).
    pub fn push_override(&mut self, directive: Directive) {
        self.directives.push(DirectiveDef { directive, line: 0 });
    }
}

/// A node declaration.
///
/// ```text
/// node <name> [<parent>] [g=<uS>] [cm=<nF>] [v=<mV>] [part=<n>] [split=<key>] [ext=1]
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct NodeDef {
    pub name: String,
    /// Parent node; `None` makes this node a root
    pub parent: Option<String>,
    /// Axial conductance to the parent (uS)
    pub g: Option<f64>,
    /// Membrane capacitance (nF)
    pub cm: Option<f64>,
    /// Initial potential (mV)
    pub v: Option<f64>,
    /// Partition of a root
    pub part: Option<usize>,
    /// Split key of a root shared with copies in other partitions
    pub split: Option<u64>,
    /// Carries extracellular layers
    pub ext: bool,
    /// Source line number for error reporting
    pub line: usize,
}

/// A mechanism instance.
///
/// ```text
/// <keyword> <instance name> <node> {<field>=<value>}
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct MechanismDef {
    /// Registry keyword (pas, hh, ...)
    pub keyword: String,
    pub name: String,
    pub node: String,
    /// Initial field values (parameters and states)
    pub params: HashMap<String, f64>,
    pub line: usize,
}

/// A directive with its source line.
#[derive(Debug, Clone, PartialEq)]
pub struct DirectiveDef {
    pub directive: Directive,
    pub line: usize,
}

/// Solver directives.
#[derive(Debug, Clone, PartialEq)]
pub enum Directive {
    /// `.atol <value>`: global absolute tolerance
    Atol(f64),
    /// `.vtol <scale>`: declared voltage tolerance scale (repeatable)
    Vtol(f64),
    /// `.stiff 0|1|2`
    Stiff(Stiffness),
    /// `.layout explicit|implicit`
    Layout(LayoutMode),
    /// `.threads <n>`: partitions that unassigned trees are spread over
    Threads(usize),
    /// `.dt <ms>`
    Dt(f64),
    /// `.tstop <ms>`
    Tstop(f64),
    /// `.extracellular <layers>`
    Extracellular(usize),
    /// `.probe <node>`: record and print a node's potential
    Probe(String),
}

impl Directive {
    /// Keyword used in description files.
    pub fn keyword(&self) -> &'static str {
        match self {
            Self::Atol(_) => ".atol",
            Self::Vtol(_) => ".vtol",
            Self::Stiff(_) => ".stiff",
            Self::Layout(_) => ".layout",
            Self::Threads(_) => ".threads",
            Self::Dt(_) => ".dt",
            Self::Tstop(_) => ".tstop",
            Self::Extracellular(_) => ".extracellular",
            Self::Probe(_) => ".probe",
        }
    }
}
