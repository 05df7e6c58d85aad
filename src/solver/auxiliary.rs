//! Externally supplied equations appended to a partition's slice.

use std::fmt;

/// A block of equations integrated alongside the cable, outside any node or
/// mechanism storage. The block sees only its own part of the flat vectors.
pub trait AuxiliaryBlock: Send + fmt::Debug {
    /// Number of equations.
    fn count(&self) -> usize;

    /// Tolerance scales, prefilled with 1.
    fn abstol(&self, scales: &mut [f64]) {
        let _ = scales;
    }

    /// Initial values.
    fn initialize(&mut self, y: &mut [f64]) {
        let _ = y;
    }

    fn fun(&mut self, t: f64, y: &[f64], ydot: &mut [f64]);

    /// Overwrite `b` with the solution of `(I - gamma * J) x = b`.
    fn solve(&mut self, gamma: f64, b: &mut [f64], y: &[f64]);
}

/// Independent first-order decays, `dy/dt = -k * y`.
#[derive(Debug, Clone, PartialEq)]
pub struct LinearDecay {
    pub rates: Vec<f64>,
    pub initial: Vec<f64>,
    /// Tolerance scale of every equation
    pub tolerance: f64,
}

impl LinearDecay {
    pub fn new(rates: Vec<f64>, initial: Vec<f64>) -> Self {
        Self {
            rates,
            initial,
            tolerance: 1.0,
        }
    }

    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }
}

impl AuxiliaryBlock for LinearDecay {
    fn count(&self) -> usize {
        self.rates.len()
    }

    fn abstol(&self, scales: &mut [f64]) {
        scales.fill(self.tolerance);
    }

    fn initialize(&mut self, y: &mut [f64]) {
        for (slot, &y0) in y.iter_mut().zip(&self.initial) {
            *slot = y0;
        }
    }

    fn fun(&mut self, _t: f64, y: &[f64], ydot: &mut [f64]) {
        for ((d, &y), &k) in ydot.iter_mut().zip(y).zip(&self.rates) {
            *d = -k * y;
        }
    }

    fn solve(&mut self, gamma: f64, b: &mut [f64], _y: &[f64]) {
        for (b, &k) in b.iter_mut().zip(&self.rates) {
            *b /= 1.0 + gamma * k;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_linear_decay() {
        let mut block = LinearDecay::new(vec![0.5, 2.0], vec![1.0, 4.0]).with_tolerance(0.1);
        let mut scales = vec![1.0; block.count()];
        block.abstol(&mut scales);
        assert_eq!(scales, vec![0.1, 0.1]);

        let mut y = vec![0.0; 2];
        block.initialize(&mut y);
        let mut ydot = vec![0.0; 2];
        block.fun(0.0, &y, &mut ydot);
        assert_eq!(ydot, vec![-0.5, -8.0]);

        let mut b = vec![1.0, 1.0];
        block.solve(0.5, &mut b, &y);
        assert_relative_eq!(b[0], 1.0 / 1.25);
        assert_relative_eq!(b[1], 0.5);
    }
}
