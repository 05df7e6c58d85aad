//! Error types for the Dendrite integration core.
//!
//! This module provides a unified error type [`DendriteError`] that covers
//! description parsing, model construction, equation assembly, and the
//! integrator callbacks.
//!
//! Numeric faults raised by mechanism kernels during a step are *not* errors:
//! they are recorded as [`crate::solver::NumericFault`] and the step continues.

use thiserror::Error;

/// Result type alias using [`DendriteError`].
pub type Result<T> = std::result::Result<T, DendriteError>;

/// Unified error type for all Dendrite operations.
#[derive(Error, Debug)]
pub enum DendriteError {
    // ============ Description Parsing Errors ============
    /// Error during lexical analysis
    #[error("Lexer error at line {line}, column {column}: {message}")]
    LexerError {
        line: usize,
        column: usize,
        message: String,
    },

    /// Error during parsing
    #[error("Parse error at line {line}: {message}")]
    ParseError { line: usize, message: String },

    /// Mechanism keyword not present in the registry
    #[error("Unknown mechanism '{mechanism}' at line {line}")]
    UnknownMechanism { mechanism: String, line: usize },

    /// Invalid mechanism instance definition
    #[error("Invalid mechanism instance '{name}' at line {line}: {message}")]
    InvalidInstance {
        name: String,
        line: usize,
        message: String,
    },

    /// Invalid parameter value or unknown parameter name
    #[error("Invalid parameter '{param}' for '{owner}': {message}")]
    InvalidParameter {
        owner: String,
        param: String,
        message: String,
    },

    // ============ Model Errors ============
    /// Node not found in the model
    #[error("Node '{node}' not found in model")]
    NodeNotFound { node: String },

    /// Node declared twice
    #[error("Duplicate node name '{name}'")]
    DuplicateNode { name: String },

    /// Mechanism instance name declared twice
    #[error("Duplicate mechanism instance name '{name}'")]
    DuplicateInstance { name: String },

    /// Invalid tree topology
    #[error("Invalid topology: {message}")]
    InvalidTopology { message: String },

    /// Invalid solver configuration
    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    // ============ Assembly Errors ============
    /// A mechanism supplied handles that disagree with its declared state count,
    /// or a handle that does not resolve to storage in its partition.
    #[error("Inconsistent equation layout in partition {partition} at equation {equation} ({mechanism}): {message}")]
    InconsistentLayout {
        partition: usize,
        equation: usize,
        mechanism: String,
        message: String,
    },

    /// Worker pool could not be created
    #[error("Failed to build worker pool: {0}")]
    ThreadPool(#[from] rayon::ThreadPoolBuildError),

    // ============ Integrator Callback Errors ============
    /// The model structure changed since the last assembly
    #[error("Equation layout is stale - structure changed since last assembly")]
    StaleLayout,

    /// Callback not available for the active layout mode
    #[error("Operation '{operation}' is not supported with the {mode} layout")]
    UnsupportedLayout {
        operation: &'static str,
        mode: &'static str,
    },

    /// Flat vector length does not match the assembled equation count
    #[error("Flat vector '{vector}' has length {got}, expected {expected}")]
    DimensionMismatch {
        vector: &'static str,
        expected: usize,
        got: usize,
    },

    // ============ I/O Errors ============
    /// Error reading a model description file
    #[error("Failed to read model file '{path}': {source}")]
    FileReadError {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// Error writing trace output
    #[error("Trace output error: {message}")]
    OutputError { message: String },
}

impl DendriteError {
    /// Create a lexer error
    pub fn lexer(line: usize, column: usize, message: impl Into<String>) -> Self {
        Self::LexerError {
            line,
            column,
            message: message.into(),
        }
    }

    /// Create a parse error
    pub fn parse(line: usize, message: impl Into<String>) -> Self {
        Self::ParseError {
            line,
            message: message.into(),
        }
    }

    /// Create an invalid instance error
    pub fn invalid_instance(name: impl Into<String>, line: usize, message: impl Into<String>) -> Self {
        Self::InvalidInstance {
            name: name.into(),
            line,
            message: message.into(),
        }
    }

    /// Create an invalid topology error
    pub fn topology(message: impl Into<String>) -> Self {
        Self::InvalidTopology {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create an inconsistent layout error
    pub fn inconsistent_layout(
        partition: usize,
        equation: usize,
        mechanism: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        Self::InconsistentLayout {
            partition,
            equation,
            mechanism: mechanism.into(),
            message: message.into(),
        }
    }

    /// Check a flat vector length against the assembled size.
    pub fn check_len(vector: &'static str, expected: usize, got: usize) -> Result<()> {
        if expected == got {
            Ok(())
        } else {
            Err(Self::DimensionMismatch {
                vector,
                expected,
                got,
            })
        }
    }
}
