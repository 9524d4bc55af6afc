//! Calibration sample selection
//!
//! Takes samples in order until `nsamples` are collected. Axis 0 is the
//! sequence axis: longer samples are cropped to a seeded random window of
//! `pad_max_length` rows; with `use_max_length` shorter ones are skipped.

use crate::config::CalibrationConfig;
use ndarray::{ArrayD, Axis, Slice};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

/// Selected calibration inputs for the first block
#[derive(Clone, Debug, Default, PartialEq)]
pub struct CalibrationSet {
    samples: Vec<ArrayD<f64>>,
}

impl CalibrationSet {
    pub fn new(samples: Vec<ArrayD<f64>>) -> Self {
        Self { samples }
    }

    pub fn samples(&self) -> &[ArrayD<f64>] {
        &self.samples
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ArrayD<f64>> {
        self.samples.iter()
    }
}

impl From<Vec<ArrayD<f64>>> for CalibrationSet {
    fn from(samples: Vec<ArrayD<f64>>) -> Self {
        Self::new(samples)
    }
}

/// Outcome of sample selection
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CalibrationReport {
    pub requested: usize,
    pub selected: usize,
    /// Samples cropped to `pad_max_length`
    pub cropped: usize,
    /// Samples skipped for being too short (or scalar)
    pub skipped: usize,
}

impl CalibrationReport {
    /// Samples missing from the requested count
    pub fn shortfall(&self) -> usize {
        self.requested.saturating_sub(self.selected)
    }

    pub fn is_complete(&self) -> bool {
        self.shortfall() == 0
    }
}

/// Picks the first `nsamples` usable samples
#[derive(Clone, Debug)]
pub struct CalibrationSampler {
    config: CalibrationConfig,
}

impl CalibrationSampler {
    pub fn new(config: CalibrationConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &CalibrationConfig {
        &self.config
    }

    pub fn select<I>(&self, candidates: I) -> (CalibrationSet, CalibrationReport)
    where
        I: IntoIterator<Item = ArrayD<f64>>,
    {
        let pad = self.config.pad_max_length;
        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let mut report = CalibrationReport {
            requested: self.config.nsamples,
            ..CalibrationReport::default()
        };
        let mut samples = Vec::with_capacity(self.config.nsamples);

        for sample in candidates {
            if samples.len() == self.config.nsamples {
                break;
            }
            if sample.ndim() == 0 {
                report.skipped += 1;
                continue;
            }
            let len = sample.len_of(Axis(0));
            if len > pad {
                let start = rng.random_range(0..len - pad);
                let window = sample.slice_axis(Axis(0), Slice::from(start..start + pad));
                samples.push(window.to_owned());
                report.cropped += 1;
            } else if len == pad || !self.config.use_max_length {
                samples.push(sample);
            } else {
                report.skipped += 1;
            }
        }

        report.selected = samples.len();
        if report.is_complete() {
            tracing::info!(nsamples = report.selected, "collected calibration samples");
        } else {
            tracing::warn!(
                requested = report.requested,
                selected = report.selected,
                shortfall = report.shortfall(),
                skipped = report.skipped,
                "insufficient calibration samples"
            );
        }
        (CalibrationSet::new(samples), report)
    }
}
