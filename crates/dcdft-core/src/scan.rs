//! DCDFT scans over a frequency or period grid.
//!
//! Each grid step fits the scanned frequency (plus any fixed frequencies)
//! with the [`Projector`], records a point in the result series and feeds
//! the [`TopHitTracker`].

use std::fmt;
use std::str::FromStr;

use crate::cancel::CancellationToken;
use crate::error::{PeriodError, Result};
use crate::projector::Projector;
use crate::series::TimeSeries;
use crate::tophits::{
    PeriodAnalysisDataPoint, PeriodAnalysisSeries, TopHitTracker, TopHits, DEFAULT_TOP_HITS,
};

/// Largest grid a range scan will walk.
pub const MAX_SCAN_STEPS: usize = 100_000_000;

/// A frequency grid `low, low + resolution, …` up to `high`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyRange {
    pub low: f64,
    pub high: f64,
    pub resolution: f64,
}

/// A period grid `low, low + resolution, …` up to `high`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodRange {
    pub low: f64,
    pub high: f64,
    pub resolution: f64,
}

/// Scan grid selection.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub enum ScanMode {
    /// Multiples of the cutoff frequency, `(degree + 1)·step … N·step`
    #[default]
    Standard,
    FrequencyRange(FrequencyRange),
    PeriodRange(PeriodRange),
}

impl fmt::Display for ScanMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScanMode::Standard => write!(f, "standard"),
            ScanMode::FrequencyRange(r) => {
                write!(f, "frequency_range:{},{},{}", r.low, r.high, r.resolution)
            }
            ScanMode::PeriodRange(r) => {
                write!(f, "period_range:{},{},{}", r.low, r.high, r.resolution)
            }
        }
    }
}

impl FromStr for ScanMode {
    type Err = PeriodError;

    /// Parse `standard`, `frequency_range:LOW,HIGH,RES` or
    /// `period_range:LOW,HIGH,RES` (case-insensitive, with aliases).
    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let lower = s.trim().to_lowercase();
        let (name, args) = match lower.split_once(':') {
            Some((name, args)) => (name.trim(), Some(args)),
            None => (lower.as_str(), None),
        };

        match name {
            "standard" | "standard_scan" | "dcdft" => match args {
                None => Ok(Self::Standard),
                Some(_) => Err(PeriodError::invalid_parameter(
                    "mode",
                    s,
                    "standard scan takes no arguments",
                )),
            },
            "frequency" | "frequency_range" | "freq" => {
                let (low, high, resolution) = parse_triple(s, args)?;
                Ok(Self::FrequencyRange(FrequencyRange {
                    low,
                    high,
                    resolution,
                }))
            }
            "period" | "period_range" => {
                let (low, high, resolution) = parse_triple(s, args)?;
                Ok(Self::PeriodRange(PeriodRange {
                    low,
                    high,
                    resolution,
                }))
            }
            _ => Err(PeriodError::invalid_parameter(
                "mode",
                s,
                "expected standard, frequency_range or period_range",
            )),
        }
    }
}

fn parse_triple(raw: &str, args: Option<&str>) -> Result<(f64, f64, f64)> {
    let reason = "expected three comma-separated numbers LOW,HIGH,RESOLUTION";
    let args = args.ok_or_else(|| PeriodError::invalid_parameter("mode", raw, reason))?;
    let values = args
        .split(',')
        .map(|v| v.trim().parse::<f64>())
        .collect::<std::result::Result<Vec<f64>, _>>()
        .map_err(|_| PeriodError::invalid_parameter("mode", raw, reason))?;
    match values.as_slice() {
        [low, high, resolution] => Ok((*low, *high, *resolution)),
        _ => Err(PeriodError::invalid_parameter("mode", raw, reason)),
    }
}

/// Options for [`scan`].
#[derive(Debug, Clone, PartialEq)]
pub struct ScanOptions {
    /// Grid selection
    pub mode: ScanMode,
    /// Polynomial degree of the trend removed alongside each sinusoid
    pub degree: usize,
    /// Bias categories given an offset column
    pub bias: Vec<String>,
    /// Frequencies fitted at every step but never scanned
    pub fixed_frequencies: Vec<f64>,
    /// Capacity of the top-hit table
    pub top_hits: usize,
}

impl Default for ScanOptions {
    fn default() -> Self {
        Self {
            mode: ScanMode::Standard,
            degree: 0,
            bias: Vec::new(),
            fixed_frequencies: Vec::new(),
            top_hits: DEFAULT_TOP_HITS,
        }
    }
}

impl ScanOptions {
    pub fn with_mode(mut self, mode: ScanMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_degree(mut self, degree: usize) -> Self {
        self.degree = degree;
        self
    }

    pub fn with_fixed_frequencies(mut self, frequencies: Vec<f64>) -> Self {
        self.fixed_frequencies = frequencies;
        self
    }

    pub fn with_bias(mut self, categories: Vec<String>) -> Self {
        self.bias = categories;
        self
    }

    /// Check every option.
    pub fn validate(&self) -> Result<()> {
        if self.top_hits == 0 {
            return Err(PeriodError::invalid_parameter(
                "top_hits",
                self.top_hits,
                "must be at least 1",
            ));
        }
        for &f in &self.fixed_frequencies {
            if !f.is_finite() || f <= 0.0 {
                return Err(PeriodError::invalid_parameter(
                    "fixed_frequencies",
                    f,
                    "must be positive and finite",
                ));
            }
        }
        match self.mode {
            ScanMode::Standard => Ok(()),
            ScanMode::FrequencyRange(r) => {
                check_bounds("frequency", r.low, r.high, r.resolution)
            }
            ScanMode::PeriodRange(r) => check_bounds("period", r.low, r.high, r.resolution),
        }
    }
}

fn check_bounds(kind: &str, low: f64, high: f64, resolution: f64) -> Result<()> {
    if !resolution.is_finite() || resolution <= 0.0 {
        return Err(PeriodError::invalid_parameter(
            "resolution",
            resolution,
            "must be positive and finite",
        ));
    }
    for (name, value) in [("low", low), ("high", high)] {
        if !value.is_finite() || value <= 0.0 {
            return Err(PeriodError::invalid_parameter(
                &format!("{}_{}", kind, name),
                value,
                "must be positive and finite",
            ));
        }
    }
    if high > low && step_count(low, high, resolution).is_none() {
        return Err(too_many_steps(resolution));
    }
    Ok(())
}

/// Grid points `low, low + resolution, …` up to `high`, or `None` when the
/// count is not finite or exceeds [`MAX_SCAN_STEPS`].
fn step_count(low: f64, high: f64, resolution: f64) -> Option<usize> {
    let steps = ((high - low) / resolution).floor();
    if steps.is_finite() && (0.0..MAX_SCAN_STEPS as f64).contains(&steps) {
        Some(steps as usize + 1)
    } else {
        None
    }
}

fn too_many_steps(resolution: f64) -> PeriodError {
    PeriodError::invalid_parameter(
        "resolution",
        resolution,
        format!("grid would exceed {} steps", MAX_SCAN_STEPS),
    )
}

/// Outcome of a scan.
#[derive(Debug, Clone)]
pub struct ScanResult {
    /// Every evaluated point, in grid order
    pub series: PeriodAnalysisSeries,
    /// Local power maxima, highest first
    pub top_hits: TopHits,
    /// True when the scan stopped early on request
    pub cancelled: bool,
}

/// Default frequency-range parameters for a series and polynomial degree.
///
/// `low = (dim + 1)·step / 2`, `high = N·step`, `resolution = step`, where
/// `step` is the cutoff frequency and `dim` the dimension of a
/// single-frequency model.
pub fn default_frequency_range(series: &TimeSeries, degree: usize) -> FrequencyRange {
    let step = series.cutoff_frequency();
    let dim = degree + 2;
    FrequencyRange {
        low: (dim + 1) as f64 * step / 2.0,
        high: series.active_count() as f64 * step,
        resolution: step,
    }
}

/// Frequencies of the first `count` harmonics of `fundamental`
/// (`f, 2f, …, count·f`).
pub fn harmonics(fundamental: f64, count: usize) -> Vec<f64> {
    (1..=count).map(|k| k as f64 * fundamental).collect()
}

/// Frequency of the `i`-th grid step, computed on demand.
#[derive(Debug, Clone, Copy)]
enum StepRule {
    Multiples { first: usize, step: f64 },
    Frequencies { low: f64, resolution: f64 },
    Periods { low: f64, resolution: f64 },
}

impl StepRule {
    fn frequency(self, i: usize) -> f64 {
        match self {
            StepRule::Multiples { first, step } => (first + i) as f64 * step,
            StepRule::Frequencies { low, resolution } => low + i as f64 * resolution,
            StepRule::Periods { low, resolution } => 1.0 / (low + i as f64 * resolution),
        }
    }
}

enum Grid {
    Steps { count: usize, rule: StepRule },
    Single(f64),
}

fn build_grid(series: &TimeSeries, mode: &ScanMode, degree: usize) -> Result<Grid> {
    match *mode {
        ScanMode::Standard => Ok(Grid::Steps {
            count: series.active_count().saturating_sub(degree),
            rule: StepRule::Multiples {
                first: degree + 1,
                step: series.cutoff_frequency(),
            },
        }),
        ScanMode::FrequencyRange(r) => {
            if r.high > r.low {
                let count = step_count(r.low, r.high, r.resolution)
                    .ok_or_else(|| too_many_steps(r.resolution))?;
                Ok(Grid::Steps {
                    count,
                    rule: StepRule::Frequencies {
                        low: r.low,
                        resolution: r.resolution,
                    },
                })
            } else {
                Ok(Grid::Single(r.high))
            }
        }
        ScanMode::PeriodRange(r) => {
            if r.high >= r.low + r.resolution {
                let count = step_count(r.low, r.high, r.resolution)
                    .ok_or_else(|| too_many_steps(r.resolution))?;
                Ok(Grid::Steps {
                    count,
                    rule: StepRule::Periods {
                        low: r.low,
                        resolution: r.resolution,
                    },
                })
            } else {
                Ok(Grid::Single(1.0 / r.low))
            }
        }
    }
}

/// Run a DCDFT scan.
///
/// # Arguments
/// * `series` - The prepared series
/// * `options` - Grid, model and table options
/// * `cancel` - Polled before every step
///
/// # Returns
/// The evaluated series and top hits. Degenerate steps get zero power;
/// cancellation returns the points computed so far with `cancelled` set.
pub fn scan(
    series: &TimeSeries,
    options: &ScanOptions,
    cancel: &CancellationToken,
) -> Result<ScanResult> {
    scan_until(series, options, || cancel.is_cancelled())
}

/// Scan, polling `stop` once before any work and again before every step.
pub(crate) fn scan_until<S>(
    series: &TimeSeries,
    options: &ScanOptions,
    mut stop: S,
) -> Result<ScanResult>
where
    S: FnMut() -> bool,
{
    options.validate()?;

    let mut result = ScanResult {
        series: PeriodAnalysisSeries::new(),
        top_hits: TopHits::new(options.top_hits),
        cancelled: false,
    };
    if stop() {
        tracing::info!(mode = %options.mode, "scan cancelled before start");
        result.cancelled = true;
        return Ok(result);
    }

    let grid = build_grid(series, &options.mode, options.degree)?;
    let projector = Projector::new(series, options.degree).with_bias(&options.bias);

    let mut frequencies = Vec::with_capacity(1 + options.fixed_frequencies.len());
    frequencies.push(0.0);
    frequencies.extend_from_slice(&options.fixed_frequencies);

    let mut evaluate = |f: f64| {
        frequencies[0] = f;
        let fit = projector.evaluate(&frequencies);
        PeriodAnalysisDataPoint::from_frequency(f, fit.fourier_power, fit.amplitude)
    };

    match grid {
        Grid::Single(f) => {
            tracing::info!(mode = %options.mode, frequency = f, "single-frequency evaluation");
            let point = evaluate(f);
            result.series.push(point);
            result.top_hits.force_insert(point);
        }
        Grid::Steps { count, rule } => {
            tracing::info!(
                mode = %options.mode,
                steps = count,
                degree = options.degree,
                fixed = options.fixed_frequencies.len(),
                "starting scan"
            );
            let mut tracker = TopHitTracker::new();
            for i in 0..count {
                if i > 0 && stop() {
                    tracing::info!(completed = i, total = count, "scan cancelled");
                    result.cancelled = true;
                    break;
                }
                let point = evaluate(rule.frequency(i));
                result.series.push(point);
                tracker.observe(point, &mut result.top_hits);
            }
        }
    }

    tracing::info!(
        points = result.series.len(),
        top_hits = result.top_hits.len(),
        best_frequency = result.top_hits.best().map(|p| p.frequency),
        "scan finished"
    );
    Ok(result)
}
