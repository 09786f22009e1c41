//! Running distributions for packet sizes and inter-arrival times.
//!
//! Two storage strategies share one interface: [`Moments`] keeps a constant
//! amount of state per distribution (Welford mean/M2 plus sum, min, max) and is
//! what large captures should use; the full strategy keeps every sample so the
//! summary is computed with an exact two-pass formula. Both merge associatively,
//! which is what lets partial flow tables from parallel workers be combined.

use serde::{Deserialize, Serialize};

/// How an aggregate stores its distributions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleStorage {
    #[default]
    Moments,
    Full,
}

/// Finished statistics of one distribution. All fields are 0 for an empty one.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct Summary {
    pub count: u64,
    pub max: f64,
    pub min: f64,
    pub mean: f64,
    pub std: f64,
    pub variance: f64,
    pub total: f64,
}

/// Constant-size accumulator.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Moments {
    pub count: u64,
    pub sum: f64,
    pub mean: f64,
    pub m2: f64,
    pub min: f64,
    pub max: f64,
}

impl Default for Moments {
    fn default() -> Self {
        Self {
            count: 0,
            sum: 0.0,
            mean: 0.0,
            m2: 0.0,
            min: f64::INFINITY,
            max: f64::NEG_INFINITY,
        }
    }
}

impl Moments {
    pub fn push(&mut self, value: f64) {
        self.count += 1;
        self.sum += value;

        // Online mean and variance (Welford's algorithm)
        let n = self.count as f64;
        let delta = value - self.mean;
        self.mean += delta / n;
        let delta2 = value - self.mean;
        self.m2 += delta * delta2;

        self.min = self.min.min(value);
        self.max = self.max.max(value);
    }

    /// Chan et al. pairwise combination.
    pub fn merge(&mut self, other: &Moments) {
        if other.count == 0 {
            return;
        }
        if self.count == 0 {
            *self = *other;
            return;
        }
        let n_a = self.count as f64;
        let n_b = other.count as f64;
        let n = n_a + n_b;
        let delta = other.mean - self.mean;

        self.mean += delta * n_b / n;
        self.m2 += other.m2 + delta * delta * n_a * n_b / n;
        self.count += other.count;
        self.sum += other.sum;
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
    }

    pub fn summary(&self) -> Summary {
        if self.count == 0 {
            return Summary::default();
        }
        let n = self.count as f64;
        // Population variance, zero for a single sample
        let variance = if self.count > 1 { (self.m2 / n).max(0.0) } else { 0.0 };
        Summary {
            count: self.count,
            max: self.max,
            min: self.min,
            mean: self.mean,
            std: variance.sqrt(),
            variance,
            total: self.sum,
        }
    }
}

/// One distribution under the configured storage strategy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Samples {
    Moments(Moments),
    Full(Vec<f64>),
}

impl Samples {
    pub fn new(storage: SampleStorage) -> Self {
        match storage {
            SampleStorage::Moments => Samples::Moments(Moments::default()),
            SampleStorage::Full => Samples::Full(Vec::new()),
        }
    }

    pub fn push(&mut self, value: f64) {
        match self {
            Samples::Moments(m) => m.push(value),
            Samples::Full(values) => values.push(value),
        }
    }

    pub fn len(&self) -> u64 {
        match self {
            Samples::Moments(m) => m.count,
            Samples::Full(values) => values.len() as u64,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends `other`, which holds samples that came after ours.
    pub fn merge(&mut self, other: &Samples) {
        // Storage strategies never mix inside one run; if they do, degrade to moments
        let degraded = match (&*self, other) {
            (Samples::Full(values), Samples::Moments(b)) => {
                let mut moments = Moments::default();
                values.iter().for_each(|v| moments.push(*v));
                moments.merge(b);
                Some(moments)
            }
            _ => None,
        };
        if let Some(moments) = degraded {
            *self = Samples::Moments(moments);
            return;
        }

        match (self, other) {
            (Samples::Moments(a), Samples::Moments(b)) => a.merge(b),
            (Samples::Full(a), Samples::Full(b)) => a.extend_from_slice(b),
            (Samples::Moments(a), Samples::Full(b)) => b.iter().for_each(|v| a.push(*v)),
            (Samples::Full(_), Samples::Moments(_)) => {}
        }
    }

    pub fn summary(&self) -> Summary {
        match self {
            Samples::Moments(m) => m.summary(),
            Samples::Full(values) => summarize(values),
        }
    }

    /// Approximate heap bytes held beyond the enum itself.
    pub fn heap_bytes(&self) -> usize {
        match self {
            Samples::Moments(_) => 0,
            Samples::Full(values) => values.capacity() * std::mem::size_of::<f64>(),
        }
    }
}

/// Exact two-pass statistics over a slice.
pub fn summarize(values: &[f64]) -> Summary {
    if values.is_empty() {
        return Summary::default();
    }
    let n = values.len() as f64;
    let total: f64 = values.iter().sum();
    let mean = total / n;
    let variance = if values.len() > 1 {
        values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / n
    } else {
        0.0
    };
    let min = values.iter().copied().fold(f64::INFINITY, f64::min);
    let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
    Summary {
        count: values.len() as u64,
        max,
        min,
        mean,
        std: variance.sqrt(),
        variance,
        total,
    }
}
