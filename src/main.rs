//! Dendrite - Multi-Compartment Neuron Simulator
//!
//! Runs a model description with the reference fixed-step driver and prints
//! the probed potentials as whitespace-separated columns.
//!
//! # Usage
//!
//! ```bash
//! RUST_LOG=info dendrite cell.den --tstop 50 > trace.dat
//! ```

use std::io;
use std::path::PathBuf;

use clap::Parser;
use dendrite_core::{
    dsl::{self, Directive},
    error::Result,
    output::write_trace,
    Model, Simulator,
};
use tracing_subscriber::EnvFilter;

/// Multi-compartment neuron simulator
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the model description file
    #[arg(value_name = "MODEL_FILE")]
    model_file: PathBuf,

    /// Step size in ms (overrides `.dt`)
    #[arg(long)]
    dt: Option<f64>,

    /// Stop time in ms (overrides `.tstop`)
    #[arg(long)]
    tstop: Option<f64>,

    /// Partitions for trees without `part=` (overrides `.threads`)
    #[arg(short, long)]
    threads: Option<usize>,

    /// Global absolute tolerance (overrides `.atol`)
    #[arg(long)]
    atol: Option<f64>,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    // Parse the description, then apply command-line overrides after the
    // file's own directives so they win.
    let mut ast = dsl::parse_file(&args.model_file)?;
    if let Some(dt) = args.dt {
        ast.push_override(Directive::Dt(dt));
    }
    if let Some(tstop) = args.tstop {
        ast.push_override(Directive::Tstop(tstop));
    }
    if let Some(threads) = args.threads {
        ast.push_override(Directive::Threads(threads));
    }
    if let Some(atol) = args.atol {
        ast.push_override(Directive::Atol(atol));
    }

    let model = Model::from_ast(&ast)?;
    let tstop = model.config.tstop;

    let mut simulator = Simulator::from_model(model)?;
    let trace = simulator.run(tstop)?;

    write_trace(&trace, io::stdout().lock())
}
