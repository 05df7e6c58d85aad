//! Trace output for the CLI frontend.
//!
//! Writes a recorded [`Trace`] as whitespace-separated text columns: a `#`
//! header naming each column, then one line per time point with the time
//! followed by every recorded value.

use std::io::{self, Write};

use crate::error::{DendriteError, Result};
use crate::solver::Trace;

fn output_error(e: io::Error) -> DendriteError {
    DendriteError::OutputError {
        message: e.to_string(),
    }
}

/// Column writer over any byte sink.
pub struct TraceWriter<W: Write> {
    out: io::BufWriter<W>,
}

impl<W: Write> TraceWriter<W> {
    pub fn new(out: W) -> Self {
        Self {
            out: io::BufWriter::new(out),
        }
    }

    /// Write the header line.
    pub fn write_header(&mut self, names: &[String]) -> Result<()> {
        write!(self.out, "# t").map_err(output_error)?;
        for name in names {
            write!(self.out, " {}", name).map_err(output_error)?;
        }
        writeln!(self.out).map_err(output_error)
    }

    /// Write one time point.
    pub fn write_row(&mut self, t: f64, values: impl IntoIterator<Item = f64>) -> Result<()> {
        write!(self.out, "{}", t).map_err(output_error)?;
        for value in values {
            write!(self.out, " {}", value).map_err(output_error)?;
        }
        writeln!(self.out).map_err(output_error)
    }

    pub fn flush(&mut self) -> Result<()> {
        self.out.flush().map_err(output_error)
    }
}

/// Write a whole trace and flush.
pub fn write_trace<W: Write>(trace: &Trace, out: W) -> Result<()> {
    let mut writer = TraceWriter::new(out);
    writer.write_header(&trace.names)?;
    for (row, &t) in trace.times.iter().enumerate() {
        let values = trace
            .columns
            .iter()
            .map(|column| column.get(row).copied().unwrap_or(f64::NAN));
        writer.write_row(t, values)?;
    }
    writer.flush()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_columns() {
        let trace = Trace {
            names: vec!["soma".into(), "dend".into()],
            times: vec![0.0, 0.5],
            columns: vec![vec![-65.0, -64.5], vec![-65.0, -65.25]],
        };
        let mut buf = Vec::new();
        write_trace(&trace, &mut buf).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert_eq!(text, "# t soma dend\n0 -65 -65\n0.5 -64.5 -65.25\n");
    }

    #[test]
    fn test_empty_trace_has_header_only() {
        let mut buf = Vec::new();
        write_trace(&Trace::default(), &mut buf).unwrap();
        assert_eq!(buf, b"# t\n");
    }
}
