//! Descriptive statistics for observation and residual vectors.
//!
//! Weighted moments drive the time-series preparation (magnitude and time
//! statistics); residual summaries feed the model fit metrics.

use statrs::statistics::Statistics;

/// Weighted first and second moments of a vector.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct WeightedMoments {
    /// Number of entries with positive weight
    pub count: usize,
    /// Sum of the positive weights
    pub weight_sum: f64,
    /// Weighted mean
    pub mean: f64,
    /// Weighted population variance, never negative
    pub variance: f64,
    /// Sample standard deviation `sqrt(variance * n / (n - 1))`
    pub std_dev: f64,
}

/// Compute weighted moments over the entries with positive weight.
///
/// # Arguments
/// * `values` - The values
/// * `weights` - One weight per value; entries with weight `<= 0` are skipped
///
/// # Returns
/// Moments of the active entries. An empty active set yields all zeros.
pub fn weighted_moments(values: &[f64], weights: &[f64]) -> WeightedMoments {
    let active = || {
        values
            .iter()
            .zip(weights.iter())
            .filter(|(_, &w)| w > 0.0)
    };

    let (count, weight_sum, sum) = active().fold((0usize, 0.0, 0.0), |(n, sw, s), (&x, &w)| {
        (n + 1, sw + w, s + w * x)
    });

    if count == 0 || weight_sum <= 0.0 {
        return WeightedMoments::default();
    }

    let mean = sum / weight_sum;
    let variance = (active()
        .map(|(&x, &w)| w * (x - mean) * (x - mean))
        .sum::<f64>()
        / weight_sum)
        .max(0.0);

    let std_dev = if count > 1 {
        (variance * count as f64 / (count - 1) as f64).sqrt()
    } else {
        0.0
    };

    WeightedMoments {
        count,
        weight_sum,
        mean,
        variance,
        std_dev,
    }
}

/// Summary of a residual vector.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct ResidualSummary {
    /// Number of residuals
    pub count: usize,
    /// Arithmetic mean
    pub mean: f64,
    /// Sample variance (zero for fewer than two residuals)
    pub variance: f64,
    /// Sum of squared residuals
    pub sum_squares: f64,
    /// Root mean square `sqrt(sum_squares / n)`
    pub rms: f64,
}

/// Summarize residuals.
pub fn residual_summary(residuals: &[f64]) -> ResidualSummary {
    let count = residuals.len();
    if count == 0 {
        return ResidualSummary::default();
    }

    let mean = residuals.iter().mean();
    let variance = if count > 1 {
        residuals.iter().variance()
    } else {
        0.0
    };
    let sum_squares: f64 = residuals.iter().map(|r| r * r).sum();

    ResidualSummary {
        count,
        mean,
        variance,
        sum_squares,
        rms: (sum_squares / count as f64).sqrt(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_unit_weights_match_plain_moments() {
        let values = [1.0, 2.0, 3.0, 4.0, 5.0];
        let weights = [1.0; 5];
        let m = weighted_moments(&values, &weights);

        assert_eq!(m.count, 5);
        assert_relative_eq!(m.weight_sum, 5.0);
        assert_relative_eq!(m.mean, 3.0, epsilon = 1e-12);
        assert_relative_eq!(m.variance, 2.0, epsilon = 1e-12);
        assert_relative_eq!(m.std_dev, 2.5_f64.sqrt(), epsilon = 1e-12);
    }

    #[test]
    fn test_zero_weight_entries_are_skipped() {
        let values = [1.0, 100.0, 3.0];
        let weights = [1.0, 0.0, 1.0];
        let m = weighted_moments(&values, &weights);

        assert_eq!(m.count, 2);
        assert_relative_eq!(m.mean, 2.0, epsilon = 1e-12);
        assert_relative_eq!(m.variance, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_weights_shift_the_mean() {
        let m = weighted_moments(&[0.0, 10.0], &[3.0, 1.0]);
        assert_relative_eq!(m.mean, 2.5, epsilon = 1e-12);
        assert_relative_eq!(m.variance, 18.75, epsilon = 1e-12);
    }

    #[test]
    fn test_single_entry_has_no_spread() {
        let m = weighted_moments(&[7.0], &[1.0]);
        assert_eq!(m.count, 1);
        assert_relative_eq!(m.mean, 7.0);
        assert_eq!(m.variance, 0.0);
        assert_eq!(m.std_dev, 0.0);
    }

    #[test]
    fn test_empty_moments() {
        let m = weighted_moments(&[], &[]);
        assert_eq!(m, WeightedMoments::default());
    }

    #[test]
    fn test_residual_summary() {
        let s = residual_summary(&[1.0, -1.0, 1.0, -1.0]);
        assert_eq!(s.count, 4);
        assert_relative_eq!(s.mean, 0.0, epsilon = 1e-12);
        assert_relative_eq!(s.variance, 4.0 / 3.0, epsilon = 1e-12);
        assert_relative_eq!(s.sum_squares, 4.0, epsilon = 1e-12);
        assert_relative_eq!(s.rms, 1.0, epsilon = 1e-12);
    }

    #[test]
    fn test_residual_summary_degenerate() {
        assert_eq!(residual_summary(&[]), ResidualSummary::default());
        let s = residual_summary(&[2.0]);
        assert_eq!(s.variance, 0.0);
        assert_relative_eq!(s.rms, 2.0);
    }
}
