//! Least-squares polynomial trend fitting.
//!
//! Runs the shared [`Projector`] without any frequencies, so the trend is
//! fitted on the same normalized time axis used by scans.

use crate::error::{PeriodError, Result};
use crate::model::{Curve, FitMetrics, ModelFunction, ModelOptions, ModelSample, SampleTag};
use crate::projector::{FitResult, Projector};
use crate::series::TimeSeries;

/// Polynomial degrees must stay below this.
pub const MAX_POLYNOMIAL_DEGREE: usize = 50;

/// A fitted polynomial trend.
#[derive(Debug, Clone)]
pub struct PolynomialFit {
    pub degree: usize,
    /// The underlying projection
    pub fit: FitResult,
    /// Coefficients of `((t - zeroPoint) / scale)^k`
    pub coefficients: Vec<f64>,
    /// Coefficients of `(t - zeroPoint)^k`
    pub physical_coefficients: Vec<f64>,
    pub power: f64,
    /// Standard error of the fit
    pub standard_error: f64,
    /// Trend sampled on a regular grid across the active span
    pub curve: Vec<ModelSample>,
    /// Fitted value at every active observation
    pub fitted: Vec<ModelSample>,
    /// Observed minus fitted at every active observation
    pub residuals: Vec<ModelSample>,
    pub metrics: FitMetrics,
    pub description: String,
    trend: Curve,
}

impl PolynomialFit {
    /// RMS of the residuals.
    pub fn rms(&self) -> f64 {
        self.metrics.rms
    }

    /// Absolute time of the zero point.
    pub fn zero_point(&self) -> f64 {
        self.trend.zero_point()
    }
}

impl ModelFunction for PolynomialFit {
    fn value(&self, t: f64) -> f64 {
        self.trend.value(t)
    }

    fn first_derivative(&self, t: f64) -> f64 {
        self.trend.first_derivative(t)
    }

    fn second_derivative(&self, t: f64) -> f64 {
        self.trend.second_derivative(t)
    }
}

/// Fit a polynomial trend of `options.degree` to the active observations.
///
/// Bias categories in `options` get an offset column; the offsets are part of
/// the fitted values and residuals but not of the sampled curve.
///
/// # Errors
/// * `InvalidParameter` - degree 0 or at least [`MAX_POLYNOMIAL_DEGREE`]
/// * `InsufficientData` - fewer than `degree + 2` active observations
/// * `ZeroVariance`, `SingularMatrix` - the fit is degenerate
pub fn polynomial_fit(series: &TimeSeries, options: &ModelOptions) -> Result<PolynomialFit> {
    let degree = options.degree;
    if degree == 0 || degree >= MAX_POLYNOMIAL_DEGREE {
        return Err(PeriodError::invalid_parameter(
            "degree",
            degree,
            format!("must be between 1 and {}", MAX_POLYNOMIAL_DEGREE - 1),
        ));
    }
    let n = series.active_count();
    if n < degree + 2 {
        return Err(PeriodError::InsufficientData {
            needed: degree + 2,
            got: n,
        });
    }

    let projector = Projector::new(series, degree).with_bias(&options.bias);
    let fit = projector.solve(&[])?;

    let coefficients = fit.polynomial().to_vec();
    let physical_coefficients: Vec<f64> = coefficients
        .iter()
        .enumerate()
        .map(|(k, c)| c / series.scale().powi(k as i32))
        .collect();

    let variance = series.magnitude_stats().variance;
    let nm1 = (n - 1) as f64;
    let p = degree as f64;
    let standard_error =
        (variance * (nm1 - p * fit.power) / nm1 / (nm1 - p)).max(0.0).sqrt();

    let description = format!("Polynomial fit of degree {}", degree);
    let trend = Curve::from_fit(series, &fit);

    let mut fitted = Vec::with_capacity(n);
    let mut residuals = Vec::with_capacity(n);
    let mut residual_values = Vec::with_capacity(n);
    let (mut t_lo, mut t_hi) = (f64::INFINITY, f64::NEG_INFINITY);
    for i in series.active_indices() {
        let t = series.times()[i];
        t_lo = t_lo.min(t);
        t_hi = t_hi.max(t);
        let value = projector.predict(&fit, t, series.bias_tags()[i].as_deref());
        let residual = series.magnitudes()[i] - value;
        let time = series.absolute_time(t);
        fitted.push(ModelSample {
            time,
            value,
            tag: SampleTag::Model,
            description: description.clone(),
        });
        residuals.push(ModelSample {
            time,
            value: residual,
            tag: SampleTag::Residual,
            description: description.clone(),
        });
        residual_values.push(residual);
    }

    let curve = sample_curve(series, &projector, &fit, t_lo, t_hi, &description);
    let metrics = FitMetrics::from_residuals(&residual_values, fit.coefficients.len());

    tracing::info!(
        degree,
        rms = metrics.rms,
        power = fit.power,
        curve_points = curve.len(),
        "fitted polynomial trend"
    );

    Ok(PolynomialFit {
        degree,
        power: fit.power,
        fit,
        coefficients,
        physical_coefficients,
        standard_error,
        curve,
        fitted,
        residuals,
        metrics,
        description,
        trend,
    })
}

/// Sample the trend (without bias offsets) every `10^(int(log10 span) - 2)`
/// time units, starting at the first grid point after `t_lo`.
fn sample_curve(
    series: &TimeSeries,
    projector: &Projector<'_>,
    fit: &FitResult,
    t_lo: f64,
    t_hi: f64,
    description: &str,
) -> Vec<ModelSample> {
    let span = t_hi - t_lo;
    if !(span > 0.0) {
        return Vec::new();
    }
    let step = 10f64.powi(span.log10().trunc() as i32 - 2);
    let start = step * ((t_lo / step).trunc() + 1.0);
    if start > t_hi {
        return Vec::new();
    }
    let count = ((t_hi - start) / step).trunc() as usize + 1;

    (0..count)
        .map(|i| {
            let t = start + i as f64 * step;
            ModelSample {
                time: series.absolute_time(t),
                value: projector.predict(fit, t, None),
                tag: SampleTag::Model,
                description: description.to_string(),
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::series::Observation;
    use approx::assert_relative_eq;

    fn options(degree: usize) -> ModelOptions {
        ModelOptions {
            degree,
            ..Default::default()
        }
    }

    fn daily_sine() -> TimeSeries {
        let times: Vec<f64> = (2459301..=2459660).map(|t| t as f64).collect();
        let mags: Vec<f64> = times.iter().map(|t| t.to_radians().sin()).collect();
        TimeSeries::from_columns(&times, &mags).unwrap()
    }

    #[test]
    fn test_recovers_quadratic() {
        let times: Vec<f64> = (0..40).map(|i| 5000.0 + 0.75 * i as f64).collect();
        let mags: Vec<f64> = times
            .iter()
            .map(|&t| {
                let u = t - 5010.0;
                1.0 - 0.2 * u + 0.03 * u * u
            })
            .collect();
        let series = TimeSeries::from_columns(&times, &mags).unwrap();
        let poly = polynomial_fit(&series, &options(2)).unwrap();

        assert_eq!(poly.coefficients.len(), 3);
        assert_eq!(poly.physical_coefficients.len(), 3);
        assert_relative_eq!(poly.physical_coefficients[2], 0.03, epsilon = 1e-9);
        assert!(poly.rms() < 1e-9);
        assert!(poly.standard_error < 1e-6);

        for t in [5001.3, 5012.0, 5027.9] {
            let u = t - 5010.0;
            assert_relative_eq!(poly.value(t), 1.0 - 0.2 * u + 0.03 * u * u, epsilon = 1e-8);
            assert_relative_eq!(poly.first_derivative(t), -0.2 + 0.06 * u, epsilon = 1e-8);
            assert_relative_eq!(poly.second_derivative(t), 0.06, epsilon = 1e-8);
        }
    }

    #[test]
    fn test_degree_nine_sine() {
        let series = daily_sine();
        let poly = polynomial_fit(&series, &options(9)).unwrap();

        assert_eq!(poly.fitted.len(), 360);
        assert_relative_eq!(poly.fitted[0].time, 2459301.0, epsilon = 1e-6);
        assert!((poly.fitted[0].value - 0.629248).abs() < 1e-6);
        assert!((poly.rms() - 1.621667e-5).abs() < 1e-9);
        assert_relative_eq!(poly.value(2459301.0), poly.fitted[0].value, epsilon = 1e-9);
    }

    #[test]
    fn test_curve_grid() {
        let series = daily_sine();
        let poly = polynomial_fit(&series, &options(3)).unwrap();

        // span 359 days: unit step from the day after the first observation
        assert_eq!(poly.curve.len(), 359);
        assert_relative_eq!(poly.curve[0].time, 2459302.0, epsilon = 1e-6);
        assert_relative_eq!(poly.curve[358].time, 2459660.0, epsilon = 1e-6);
        for sample in poly.curve.iter().step_by(50) {
            assert_relative_eq!(poly.value(sample.time), sample.value, epsilon = 1e-9);
            assert_eq!(sample.tag, SampleTag::Model);
        }
    }

    #[test]
    fn test_standard_error_matches_residual_scale() {
        let series = daily_sine();
        let poly = polynomial_fit(&series, &options(2)).unwrap();
        // the unexplained variance is the mean squared residual
        let ss: f64 = poly.residuals.iter().map(|r| r.value * r.value).sum();
        let expected = (ss / 360.0 / (360.0 - 1.0 - 2.0)).sqrt();
        assert_relative_eq!(poly.standard_error, expected, max_relative = 1e-6);
    }

    #[test]
    fn test_bias_offsets_excluded_from_curve() {
        let obs: Vec<Observation> = (0..50)
            .map(|i| {
                let t = 100.0 + i as f64;
                let x = 2.0 + 0.1 * i as f64;
                if i % 2 == 0 {
                    Observation::new(t, x + 0.5).with_bias("R")
                } else {
                    Observation::new(t, x)
                }
            })
            .collect();
        let series = TimeSeries::new(obs).unwrap();
        let poly = polynomial_fit(
            &series,
            &ModelOptions {
                degree: 1,
                bias: vec!["R".to_string()],
            },
        )
        .unwrap();

        assert!(poly.residuals.iter().all(|r| r.value.abs() < 1e-9));
        assert_relative_eq!(poly.fit.bias_offset("R").unwrap(), 0.5, epsilon = 1e-9);
        assert_relative_eq!(poly.fitted[0].value - poly.value(100.0), 0.5, epsilon = 1e-9);
    }

    #[test]
    fn test_invalid_degree() {
        let series = daily_sine();
        assert!(matches!(
            polynomial_fit(&series, &options(0)),
            Err(PeriodError::InvalidParameter { .. })
        ));
        assert!(matches!(
            polynomial_fit(&series, &options(50)),
            Err(PeriodError::InvalidParameter { .. })
        ));

        let small = TimeSeries::from_columns(&[1.0, 2.0, 3.0], &[1.0, 4.0, 2.0]).unwrap();
        assert!(matches!(
            polynomial_fit(&small, &options(2)),
            Err(PeriodError::InsufficientData { needed: 4, got: 3 })
        ));
    }
}
