//! Parser for model descriptions.
//!
//! A line-oriented text language describing a forest of cable nodes, the
//! mechanisms inserted into them, and solver settings.
//!
//! # Grammar Overview
//!
//! ```text
//! model       = { line }
//! line        = comment | directive | node | mechanism | empty
//! comment     = ('#' | ';') { any_char }
//! directive   = '.' directive_name { argument }
//! node        = "node" name [parent] { param }
//! mechanism   = keyword name node_name { param }
//! param       = identifier '=' value
//!
//! value       = number [unit_suffix]
//! number      = ['-'|'+'] digit+ ['.' digit+] [('e'|'E') ['-'|'+'] digit+]
//! unit_suffix = 'p' | 'n' | 'u' | 'm' | 'k' | 'M' | 'G'
//! identifier  = (letter | '_') { letter | digit | '_' }
//! ```
//!
//! # Node Parameters
//!
//! | Parameter | Description | Default |
//! |-----------|-------------|---------|
//! | g | Axial conductance to the parent (uS), required for non-roots | - |
//! | cm | Membrane capacitance (nF), 0 makes the node algebraic | 1 |
//! | v | Initial potential (mV) | -65 |
//! | part | Partition of a root | round-robin |
//! | split | Key shared by root copies in other partitions | - |
//! | ext | Node carries extracellular layers | 0 |
//!
//! # Directives
//!
//! | Directive | Description | Syntax |
//! |-----------|-------------|--------|
//! | .atol | Global absolute tolerance | `.atol <value>` |
//! | .vtol | Voltage tolerance scale | `.vtol <scale>` |
//! | .stiff | Jacobian treatment | `.stiff 0\|1\|2` |
//! | .layout | Equation ordering | `.layout explicit\|implicit` |
//! | .threads | Partition count | `.threads <n>` |
//! | .dt | Driver step (ms) | `.dt <value>` |
//! | .tstop | Driver stop time (ms) | `.tstop <value>` |
//! | .extracellular | Layers per flagged node | `.extracellular <n>` |
//! | .probe | Print a node's potential | `.probe <node>` |
//!
//! # Example
//!
//! ```text
//! # Ball and stick
//! .tstop 20
//! .probe soma
//!
//! node soma cm=1 v=-65
//! node dend soma g=0.5 cm=0.5
//! hh hh1 soma
//! pas leak dend g=0.001 e=-65
//! iclamp stim soma del=1 dur=5 amp=0.1
//! ```

mod ast;
mod lexer;
mod parser;

pub use ast::*;
pub use lexer::{parse_value, Lexer, Token, TokenKind};
pub use parser::Parser;

use crate::error::Result;

/// Parse a description string into an AST.
pub fn parse(input: &str) -> Result<ModelAst> {
    let lexer = Lexer::new(input);
    let mut parser = Parser::new(lexer)?;
    parser.parse()
}

/// Parse a description file.
pub fn parse_file(path: &std::path::Path) -> Result<ModelAst> {
    let content = std::fs::read_to_string(path).map_err(|e| crate::error::DendriteError::FileReadError {
        path: path.display().to_string(),
        source: e,
    })?;
    parse(&content)
}
