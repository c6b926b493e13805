//! Setpoint waveform generation.
//!
//! A [`Waveform`] is an immutable, finite, ordered sequence of setpoints built
//! from a [`WaveformSpec`]. Segments are linearly interpolated with both
//! endpoints included, so consecutive segments repeat their shared vertex.
//!
//! ```text
//! Linear:      min ───────────> max                        (N)
//! Sawtooth:    0 ──> min ──> max ──> 0                      (3N)
//! MultiPhase:  0 ──> min ══> max ══> min ══> max ──> 0      (8N)
//! ```
//!
//! Clamping and pointwise transforms return new waveforms; the source is never
//! modified. Generate again to get a fresh sequence.

use std::fmt;
use std::ops::Index;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{DaqError, DaqResult};

/// Shape of the generated sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WaveformKind {
    /// Three segments: 0 -> min -> max -> 0
    Sawtooth,
    /// One segment: min -> max
    #[serde(alias = "linspace")]
    Linear,
    /// Five segments with repeated excursions, for hysteresis sweeps
    #[default]
    #[serde(alias = "multiphase", alias = "wilfred")]
    MultiPhase,
}

impl FromStr for WaveformKind {
    type Err = DaqError;

    fn from_str(tag: &str) -> Result<Self, Self::Err> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "sawtooth" => Ok(WaveformKind::Sawtooth),
            "linear" | "linspace" => Ok(WaveformKind::Linear),
            "multi_phase" | "multiphase" | "wilfred" => Ok(WaveformKind::MultiPhase),
            other => Err(DaqError::Configuration(format!(
                "Unrecognized waveform variant '{other}'. Must be one of: sawtooth, linear, multi_phase"
            ))),
        }
    }
}

impl fmt::Display for WaveformKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WaveformKind::Sawtooth => write!(f, "sawtooth"),
            WaveformKind::Linear => write!(f, "linear"),
            WaveformKind::MultiPhase => write!(f, "multi_phase"),
        }
    }
}

/// Parameters of a waveform.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaveformSpec {
    /// Shape to generate
    pub kind: WaveformKind,
    /// Lowest excursion
    pub min: f64,
    /// Highest excursion
    pub max: f64,
    /// Points in a single-length segment
    pub points_per_segment: usize,
}

impl WaveformSpec {
    /// Create a spec.
    pub fn new(kind: WaveformKind, min: f64, max: f64, points_per_segment: usize) -> Self {
        Self {
            kind,
            min,
            max,
            points_per_segment,
        }
    }
}

/// `num` evenly spaced samples over `[start, stop]`, endpoints included.
///
/// A single sample yields `[start]`; zero samples yield an empty vector.
pub fn linspace(start: f64, stop: f64, num: usize) -> Vec<f64> {
    match num {
        0 => Vec::new(),
        1 => vec![start],
        _ => {
            let step = (stop - start) / (num - 1) as f64;
            let mut out: Vec<f64> = (0..num - 1).map(|i| start + step * i as f64).collect();
            out.push(stop);
            out
        }
    }
}

/// Points of a ramp from `start` to `target`; the last point is always `target`.
///
/// Fewer than two points collapse to a single step straight to `target`.
pub fn ramp_profile(start: f64, target: f64, points: usize) -> Vec<f64> {
    if points < 2 {
        return vec![target];
    }
    linspace(start, target, points)
}

/// Generate the setpoint sequence described by `spec`.
pub fn generate(spec: &WaveformSpec) -> DaqResult<Waveform> {
    let n = spec.points_per_segment;
    if n == 0 {
        return Err(DaqError::Configuration(
            "points_per_segment must be greater than 0".to_string(),
        ));
    }
    if !spec.min.is_finite() || !spec.max.is_finite() {
        return Err(DaqError::Configuration(format!(
            "Waveform bounds must be finite, got [{}, {}]",
            spec.min, spec.max
        )));
    }

    let (min, max) = (spec.min, spec.max);
    let segments: Vec<(f64, f64, usize)> = match spec.kind {
        WaveformKind::Linear => vec![(min, max, n)],
        WaveformKind::Sawtooth => vec![(0.0, min, n), (min, max, n), (max, 0.0, n)],
        WaveformKind::MultiPhase => vec![
            (0.0, min, n),
            (min, max, 2 * n),
            (max, min, 2 * n),
            (min, max, 2 * n),
            (max, 0.0, n),
        ],
    };

    let data = segments
        .into_iter()
        .flat_map(|(start, stop, num)| linspace(start, stop, num))
        .collect();
    Ok(Waveform { data })
}

/// Immutable setpoint sequence.
#[derive(Debug, Clone, PartialEq)]
pub struct Waveform {
    data: Vec<f64>,
}

impl Waveform {
    /// Wrap an externally supplied sequence (e.g. read back from an input file).
    pub fn from_values(data: Vec<f64>) -> Self {
        Self { data }
    }

    /// Number of setpoints.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the waveform has no setpoints.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Setpoint at `index`, if any.
    pub fn get(&self, index: usize) -> Option<f64> {
        self.data.get(index).copied()
    }

    /// Iterate over setpoints in order.
    pub fn iter(&self) -> std::iter::Copied<std::slice::Iter<'_, f64>> {
        self.data.iter().copied()
    }

    /// Borrow the underlying values.
    pub fn as_slice(&self) -> &[f64] {
        &self.data
    }

    /// New waveform with every value clamped to `[lo, hi]`.
    pub fn clamp(&self, lo: f64, hi: f64) -> DaqResult<Waveform> {
        if lo.is_nan() || hi.is_nan() || lo > hi {
            return Err(DaqError::Configuration(format!(
                "Invalid clamp interval [{lo}, {hi}]"
            )));
        }
        Ok(self.map(|v| v.clamp(lo, hi)))
    }

    /// New waveform with `f` applied to every value.
    pub fn map<F>(&self, f: F) -> Waveform
    where
        F: Fn(f64) -> f64,
    {
        Waveform {
            data: self.data.iter().map(|&v| f(v)).collect(),
        }
    }

    /// Values lying within `[lo, hi]`, in order.
    pub fn select(&self, lo: f64, hi: f64) -> Vec<f64> {
        self.data
            .iter()
            .copied()
            .filter(|v| *v >= lo && *v <= hi)
            .collect()
    }
}

impl Index<usize> for Waveform {
    type Output = f64;

    fn index(&self, index: usize) -> &Self::Output {
        &self.data[index]
    }
}

impl<'a> IntoIterator for &'a Waveform {
    type Item = f64;
    type IntoIter = std::iter::Copied<std::slice::Iter<'a, f64>>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl fmt::Display for Waveform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for v in &self.data {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{v}")?;
            first = false;
        }
        Ok(())
    }
}
