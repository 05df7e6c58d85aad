//! Continuous play and record.
//!
//! Play items drive a storage location from a time series before every
//! derivative evaluation; records sample one after every accepted step.

use std::fmt;

use crate::error::{DendriteError, Result};
use crate::model::{Handle, Partition};

/// A time-continuous item attached to a partition.
pub trait Continuous: Send + fmt::Debug {
    fn continuous(&mut self, t: f64, partition: &mut Partition);

    /// Follow storage moved by a structure edit.
    fn relocate(&mut self, map: &dyn Fn(Handle) -> Handle) {
        let _ = map;
    }
}

/// Plays a piecewise-linear time series into a storage location.
#[derive(Debug, Clone, PartialEq)]
pub struct VectorPlay {
    target: Handle,
    times: Vec<f64>,
    values: Vec<f64>,
}

impl VectorPlay {
    /// `times` must be non-empty and non-decreasing, with one value per time.
    pub fn new(target: Handle, times: Vec<f64>, values: Vec<f64>) -> Result<Self> {
        if times.is_empty() || times.len() != values.len() {
            return Err(DendriteError::config(format!(
                "play into {} needs matching non-empty series, got {} times and {} values",
                target,
                times.len(),
                values.len()
            )));
        }
        if times.windows(2).any(|w| !(w[0] <= w[1])) {
            return Err(DendriteError::config(format!(
                "play into {} has decreasing times",
                target
            )));
        }
        Ok(Self { target, times, values })
    }

    pub fn target(&self) -> Handle {
        self.target
    }

    /// Linear interpolation, held constant outside the series.
    pub fn value_at(&self, t: f64) -> f64 {
        let n = self.times.len();
        if t <= self.times[0] {
            return self.values[0];
        }
        if t >= self.times[n - 1] {
            return self.values[n - 1];
        }
        let hi = self.times.partition_point(|&x| x <= t);
        let lo = hi - 1;
        let (t0, t1) = (self.times[lo], self.times[hi]);
        let (v0, v1) = (self.values[lo], self.values[hi]);
        if t1 == t0 {
            v1
        } else {
            v0 + (v1 - v0) * (t - t0) / (t1 - t0)
        }
    }
}

impl Continuous for VectorPlay {
    fn continuous(&mut self, t: f64, partition: &mut Partition) {
        partition.set(self.target, self.value_at(t));
    }

    fn relocate(&mut self, map: &dyn Fn(Handle) -> Handle) {
        self.target = map(self.target);
    }
}

/// Identifies a record inside a [`crate::solver::CableSystem`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RecordId {
    pub partition: usize,
    pub index: usize,
}

/// Samples a storage location.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Record {
    source: Option<Handle>,
    times: Vec<f64>,
    values: Vec<f64>,
}

impl Record {
    pub fn new(source: Handle) -> Self {
        Self {
            source: Some(source),
            ..Self::default()
        }
    }

    pub fn source(&self) -> Option<Handle> {
        self.source
    }

    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    pub fn clear(&mut self) {
        self.times.clear();
        self.values.clear();
    }

    pub fn sample(&mut self, t: f64, partition: &Partition) {
        if let Some(value) = self.source.and_then(|h| partition.get(h)) {
            self.times.push(t);
            self.values.push(value);
        }
    }
}

impl Continuous for Record {
    fn continuous(&mut self, t: f64, partition: &mut Partition) {
        self.sample(t, partition);
    }

    fn relocate(&mut self, map: &dyn Fn(Handle) -> Handle) {
        self.source = self.source.map(map);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{NodeId, PartitionId};

    #[test]
    fn test_interpolation() {
        let play = VectorPlay::new(
            Handle::Voltage(NodeId(0)),
            vec![0.0, 1.0, 1.0, 3.0],
            vec![0.0, 10.0, 20.0, 40.0],
        )
        .unwrap();
        assert_eq!(play.value_at(-1.0), 0.0);
        assert_eq!(play.value_at(0.5), 5.0);
        assert_eq!(play.value_at(2.0), 30.0);
        assert_eq!(play.value_at(9.0), 40.0);
    }

    #[test]
    fn test_invalid_series() {
        let h = Handle::Voltage(NodeId(0));
        assert!(VectorPlay::new(h, vec![], vec![]).is_err());
        assert!(VectorPlay::new(h, vec![0.0, 1.0], vec![1.0]).is_err());
        assert!(VectorPlay::new(h, vec![1.0, 0.0], vec![1.0, 2.0]).is_err());
    }

    #[test]
    fn test_play_then_record() {
        let mut p = Partition::new(PartitionId(0));
        p.nodes.push_root(1.0, -65.0, None);
        let h = Handle::Voltage(NodeId(0));
        let mut play = VectorPlay::new(h, vec![0.0, 2.0], vec![-65.0, -55.0]).unwrap();
        let mut record = Record::new(h);
        for t in [0.0, 1.0, 2.0] {
            play.continuous(t, &mut p);
            record.continuous(t, &mut p);
        }
        assert_eq!(record.times(), &[0.0, 1.0, 2.0]);
        assert_eq!(record.values(), &[-65.0, -60.0, -55.0]);
    }
}
