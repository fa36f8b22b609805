//! Time-series preparation.
//!
//! Observations arrive in arbitrary order. [`TimeSeries::new`] sorts them,
//! re-anchors the time axis onto a well-conditioned origin and computes the
//! statistics every projection against the series relies on. All derived
//! quantities are computed exactly once and the series is read-only
//! afterwards.

use crate::error::{PeriodError, Result};
use crate::stats::{weighted_moments, WeightedMoments};

/// Minimum number of observations with positive weight.
pub const MIN_ACTIVE_OBSERVATIONS: usize = 2;

/// Ratio of the cutoff frequency below which projections degenerate.
pub const GUARD_RATIO: f64 = 0.95;

/// A single observation.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// Time of the observation (absolute units, e.g. Julian Date)
    pub time: f64,
    /// Observed magnitude
    pub magnitude: f64,
    /// Weight; 0 excludes the observation from every fit
    pub weight: f64,
    /// Optional observer / instrument tag used for bias terms
    pub bias: Option<String>,
}

impl Observation {
    /// Create an observation with unit weight and no bias tag.
    pub fn new(time: f64, magnitude: f64) -> Self {
        Self {
            time,
            magnitude,
            weight: 1.0,
            bias: None,
        }
    }

    /// Set the weight.
    pub fn with_weight(mut self, weight: f64) -> Self {
        self.weight = weight;
        self
    }

    /// Set the bias tag.
    pub fn with_bias(mut self, tag: impl Into<String>) -> Self {
        self.bias = Some(tag.into());
        self
    }

    fn is_active(&self) -> bool {
        self.weight > 0.0
    }
}

/// A prepared, time-ordered series.
///
/// Times are stored relative to [`TimeSeries::origin`].
#[derive(Debug, Clone)]
pub struct TimeSeries {
    times: Vec<f64>,
    magnitudes: Vec<f64>,
    weights: Vec<f64>,
    bias_tags: Vec<Option<String>>,
    origin: f64,
    scale: f64,
    zero_point: f64,
    magnitude_stats: WeightedMoments,
    time_stats: WeightedMoments,
    cutoff: f64,
    bias_categories: Vec<String>,
}

impl TimeSeries {
    /// Prepare a series from observations in arbitrary order.
    ///
    /// # Arguments
    /// * `observations` - The raw observations
    ///
    /// # Returns
    /// The prepared series, or a configuration error when an observation
    /// carries a non-finite value or a negative weight, or when fewer than
    /// two observations have positive weight.
    pub fn new(observations: Vec<Observation>) -> Result<Self> {
        for (i, ob) in observations.iter().enumerate() {
            if !ob.time.is_finite() || !ob.magnitude.is_finite() || !ob.weight.is_finite() {
                return Err(PeriodError::InvalidInput(format!(
                    "observation {} has a non-finite time, magnitude or weight",
                    i
                )));
            }
            if ob.weight < 0.0 {
                return Err(PeriodError::InvalidInput(format!(
                    "observation {} has negative weight {}",
                    i, ob.weight
                )));
            }
        }

        let active = observations.iter().filter(|ob| ob.is_active()).count();
        if active < MIN_ACTIVE_OBSERVATIONS {
            return Err(PeriodError::InsufficientData {
                needed: MIN_ACTIVE_OBSERVATIONS,
                got: active,
            });
        }

        let sorted = sort_by_time(observations);
        let origin = time_origin(&sorted);

        let n = sorted.len();
        let mut times = Vec::with_capacity(n);
        let mut magnitudes = Vec::with_capacity(n);
        let mut weights = Vec::with_capacity(n);
        let mut bias_tags = Vec::with_capacity(n);
        for ob in sorted {
            times.push(ob.time - origin);
            magnitudes.push(ob.magnitude);
            weights.push(ob.weight);
            bias_tags.push(ob.bias);
        }

        let magnitude_stats = weighted_moments(&magnitudes, &weights);
        let time_stats = weighted_moments(&times, &weights);

        let (first, last) = active_bounds(&times, &weights);
        let (scale, zero_point) = scale_and_zero(last - first, time_stats.mean);

        let cutoff = if time_stats.variance > 0.0 {
            1.0 / (12.0 * time_stats.variance).sqrt() / 4.0
        } else {
            f64::INFINITY
        };

        let mut bias_categories: Vec<String> = Vec::new();
        for (tag, &w) in bias_tags.iter().zip(weights.iter()) {
            if let Some(tag) = tag {
                if w > 0.0 && !bias_categories.iter().any(|c| c == tag) {
                    bias_categories.push(tag.clone());
                }
            }
        }

        tracing::debug!(
            observations = n,
            active,
            origin,
            scale,
            zero_point,
            cutoff,
            "prepared time series"
        );

        Ok(Self {
            times,
            magnitudes,
            weights,
            bias_tags,
            origin,
            scale,
            zero_point,
            magnitude_stats,
            time_stats,
            cutoff,
            bias_categories,
        })
    }

    /// Prepare a unit-weight series from parallel time and magnitude columns.
    pub fn from_columns(times: &[f64], magnitudes: &[f64]) -> Result<Self> {
        if times.len() != magnitudes.len() {
            return Err(PeriodError::InvalidInput(format!(
                "time and magnitude columns differ in length ({} vs {})",
                times.len(),
                magnitudes.len()
            )));
        }
        Self::new(
            times
                .iter()
                .zip(magnitudes.iter())
                .map(|(&t, &x)| Observation::new(t, x))
                .collect(),
        )
    }

    /// Number of observations, including zero-weight ones.
    pub fn len(&self) -> usize {
        self.times.len()
    }

    pub fn is_empty(&self) -> bool {
        self.times.is_empty()
    }

    /// Number of observations with positive weight.
    pub fn active_count(&self) -> usize {
        self.magnitude_stats.count
    }

    /// Times relative to the origin, ascending.
    pub fn times(&self) -> &[f64] {
        &self.times
    }

    pub fn magnitudes(&self) -> &[f64] {
        &self.magnitudes
    }

    pub fn weights(&self) -> &[f64] {
        &self.weights
    }

    pub fn bias_tags(&self) -> &[Option<String>] {
        &self.bias_tags
    }

    /// Time origin subtracted from every absolute time.
    pub fn origin(&self) -> f64 {
        self.origin
    }

    /// Power of ten by which relative times are divided in the basis.
    pub fn scale(&self) -> f64 {
        self.scale
    }

    /// Zero point (relative time) of the normalized time axis.
    pub fn zero_point(&self) -> f64 {
        self.zero_point
    }

    pub fn magnitude_stats(&self) -> &WeightedMoments {
        &self.magnitude_stats
    }

    /// Statistics of the relative times.
    pub fn time_stats(&self) -> &WeightedMoments {
        &self.time_stats
    }

    /// Cutoff ("step") frequency `1 / (4 sqrt(12 Var(t)))`.
    pub fn cutoff_frequency(&self) -> f64 {
        self.cutoff
    }

    /// Frequencies below this value yield a degenerate projection.
    pub fn guard_frequency(&self) -> f64 {
        GUARD_RATIO * self.cutoff
    }

    /// Distinct bias tags of active observations in order of first appearance.
    pub fn bias_categories(&self) -> &[String] {
        &self.bias_categories
    }

    /// Span between the first and last active relative time.
    pub fn span(&self) -> f64 {
        let (first, last) = active_bounds(&self.times, &self.weights);
        last - first
    }

    /// Map a relative time onto the normalized axis `(t - zero) / scale`.
    pub fn normalize_time(&self, relative: f64) -> f64 {
        (relative - self.zero_point) / self.scale
    }

    pub fn absolute_time(&self, relative: f64) -> f64 {
        relative + self.origin
    }

    pub fn relative_time(&self, absolute: f64) -> f64 {
        absolute - self.origin
    }

    /// Indices of observations with positive weight.
    pub(crate) fn active_indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.weights
            .iter()
            .enumerate()
            .filter(|(_, &w)| w > 0.0)
            .map(|(i, _)| i)
    }
}

/// Ordered insertion: each observation is inserted after every earlier one
/// with a time less than or equal to its own, shifting later entries back.
///
/// Stable, O(n²) in the worst case. Input that is already nearly sorted, the
/// usual case for photometric data, costs close to O(n).
fn sort_by_time(observations: Vec<Observation>) -> Vec<Observation> {
    let mut sorted: Vec<Observation> = Vec::with_capacity(observations.len());
    for ob in observations {
        let pos = sorted
            .iter()
            .rposition(|o| o.time <= ob.time)
            .map_or(0, |i| i + 1);
        sorted.insert(pos, ob);
    }
    sorted
}

/// Integer floor of the earliest time, re-anchored down to a multiple of a
/// resolution power of ten minus one unit of it.
fn time_origin(sorted: &[Observation]) -> f64 {
    let (first, last) = match (sorted.first(), sorted.last()) {
        (Some(f), Some(l)) => (f.time, l.time),
        _ => return 0.0,
    };

    let floor = first.floor();
    let span = (last - floor).max(1.0);
    let resolution = 10f64.powf((span.log10() - 0.5).trunc());
    ((floor / resolution).floor() - 1.0) * resolution
}

fn active_bounds(times: &[f64], weights: &[f64]) -> (f64, f64) {
    let mut active = times
        .iter()
        .zip(weights.iter())
        .filter(|(_, &w)| w > 0.0)
        .map(|(&t, _)| t);
    let first = active.next().unwrap_or(0.0);
    let last = active.last().unwrap_or(first);
    (first, last)
}

fn scale_and_zero(span: f64, mean_time: f64) -> (f64, f64) {
    if span <= 0.0 {
        return (1.0, mean_time);
    }
    let exponent = (span.log10() + 0.5).floor();
    let scale = 10f64.powf(exponent);
    let step = 10f64.powf(exponent - 3.0);
    (scale, step * (mean_time / step + 0.5).floor())
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use proptest::prelude::*;

    fn daily_series(start: f64, n: usize) -> Vec<Observation> {
        (0..n)
            .map(|i| {
                let t = start + i as f64;
                Observation::new(t, t.to_radians().sin())
            })
            .collect()
    }

    #[test]
    fn test_origin_scale_and_zero_point() {
        let series = TimeSeries::new(daily_series(2459301.0, 360)).unwrap();

        assert_relative_eq!(series.origin(), 2459200.0);
        assert_relative_eq!(series.scale(), 1000.0);
        assert_relative_eq!(series.zero_point(), 281.0);
        assert_relative_eq!(series.times()[0], 101.0);
        assert_relative_eq!(series.absolute_time(series.times()[0]), 2459301.0);
        assert_relative_eq!(series.span(), 359.0);
    }

    #[test]
    fn test_small_span_origin() {
        let series = TimeSeries::from_columns(&[2450000.25, 2450000.75], &[1.0, 2.0]).unwrap();
        // span clamps to 1 so the resolution is 1
        assert_relative_eq!(series.origin(), 2449999.0);
        assert_relative_eq!(series.times()[0], 1.25);
    }

    #[test]
    fn test_sorted_and_stable() {
        let obs = vec![
            Observation::new(3.0, 30.0),
            Observation::new(1.0, 10.0),
            Observation::new(2.0, 20.0).with_bias("a"),
            Observation::new(2.0, 21.0).with_bias("b"),
            Observation::new(0.5, 5.0),
        ];
        let series = TimeSeries::new(obs).unwrap();
        assert_eq!(series.magnitudes(), &[5.0, 10.0, 20.0, 21.0, 30.0]);
        assert_eq!(series.bias_tags()[2].as_deref(), Some("a"));
        assert_eq!(series.bias_tags()[3].as_deref(), Some("b"));
    }

    #[test]
    fn test_weighted_statistics() {
        let obs = vec![
            Observation::new(10.0, 1.0),
            Observation::new(11.0, 3.0),
            Observation::new(12.0, 100.0).with_weight(0.0),
        ];
        let series = TimeSeries::new(obs).unwrap();

        assert_eq!(series.len(), 3);
        assert_eq!(series.active_count(), 2);
        assert_relative_eq!(series.magnitude_stats().mean, 2.0);
        assert_relative_eq!(series.magnitude_stats().variance, 1.0);
        assert_relative_eq!(series.magnitude_stats().std_dev, 2.0_f64.sqrt());
        assert_relative_eq!(series.time_stats().variance, 0.25);
        assert_relative_eq!(series.span(), 1.0);
    }

    #[test]
    fn test_cutoff_frequency() {
        let series = TimeSeries::new(daily_series(100.0, 10)).unwrap();
        let var = series.time_stats().variance;
        assert_relative_eq!(var, 8.25, epsilon = 1e-12);
        let expected = 1.0 / (12.0 * var).sqrt() / 4.0;
        assert_relative_eq!(series.cutoff_frequency(), expected, epsilon = 1e-12);
        assert_relative_eq!(series.guard_frequency(), 0.95 * expected, epsilon = 1e-12);
    }

    #[test]
    fn test_zero_span_series() {
        let series = TimeSeries::from_columns(&[5.0, 5.0, 5.0], &[1.0, 2.0, 3.0]).unwrap();
        assert_eq!(series.scale(), 1.0);
        assert_relative_eq!(series.zero_point(), series.time_stats().mean);
        assert!(series.cutoff_frequency().is_infinite());
    }

    #[test]
    fn test_bias_categories_first_appearance() {
        let obs = vec![
            Observation::new(1.0, 1.0).with_bias("ABC"),
            Observation::new(2.0, 1.0).with_bias("XYZ"),
            Observation::new(3.0, 1.0).with_bias("ABC"),
            Observation::new(4.0, 1.0).with_bias("OFF").with_weight(0.0),
            Observation::new(5.0, 1.0),
        ];
        let series = TimeSeries::new(obs).unwrap();
        assert_eq!(series.bias_categories(), &["ABC".to_string(), "XYZ".to_string()]);
    }

    #[test]
    fn test_insufficient_data() {
        let err = TimeSeries::new(vec![Observation::new(1.0, 1.0)]).unwrap_err();
        assert!(matches!(
            err,
            PeriodError::InsufficientData { needed: 2, got: 1 }
        ));

        let obs = vec![
            Observation::new(1.0, 1.0),
            Observation::new(2.0, 1.0).with_weight(0.0),
        ];
        assert!(matches!(
            TimeSeries::new(obs),
            Err(PeriodError::InsufficientData { got: 1, .. })
        ));
    }

    #[test]
    fn test_invalid_observations() {
        let obs = vec![
            Observation::new(1.0, 1.0),
            Observation::new(2.0, f64::NAN),
            Observation::new(3.0, 1.0),
        ];
        assert!(matches!(
            TimeSeries::new(obs),
            Err(PeriodError::InvalidInput(_))
        ));

        let obs = vec![
            Observation::new(1.0, 1.0),
            Observation::new(2.0, 1.0).with_weight(-1.0),
            Observation::new(3.0, 1.0),
        ];
        assert!(matches!(
            TimeSeries::new(obs),
            Err(PeriodError::InvalidInput(_))
        ));

        assert!(TimeSeries::from_columns(&[1.0, 2.0], &[1.0]).is_err());
    }

    #[test]
    fn test_normalize_time() {
        let series = TimeSeries::new(daily_series(2459301.0, 360)).unwrap();
        assert_relative_eq!(series.normalize_time(281.0), 0.0);
        assert_relative_eq!(series.normalize_time(381.0), 0.1, epsilon = 1e-12);
        assert_relative_eq!(series.relative_time(2459301.0), 101.0);
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(64))]

        #[test]
        fn prop_sort_matches_stable_sort(
            times in prop::collection::vec(0u32..50, 2..60)
        ) {
            let obs: Vec<Observation> = times
                .iter()
                .enumerate()
                .map(|(i, &t)| Observation::new(1000.0 + t as f64, i as f64))
                .collect();

            let mut expected = obs.clone();
            expected.sort_by(|a, b| a.time.total_cmp(&b.time));

            let sorted = sort_by_time(obs);
            prop_assert_eq!(sorted, expected);
        }

        #[test]
        fn prop_relative_times_are_positive_and_ordered(
            times in prop::collection::vec(2_440_000.0f64..2_460_000.0, 2..40)
        ) {
            let mags = vec![1.0; times.len()];
            let series = TimeSeries::from_columns(&times, &mags).unwrap();
            prop_assert!(series.times()[0] > 0.0);
            prop_assert!(series.times().windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
