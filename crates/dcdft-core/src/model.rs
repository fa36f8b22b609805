//! Multi-periodic model reconstruction.
//!
//! A single projection with every frequency fixed yields the model
//! coefficients; the model is then evaluated at each active observation to
//! produce fitted values and residuals, together with fit metrics and
//! parameter uncertainties.

use std::f64::consts::PI;
use std::fmt;

use crate::error::{PeriodError, Result};
use crate::projector::{FitResult, Projector};
use crate::scan::ScanResult;
use crate::series::TimeSeries;
use crate::stats::residual_summary;
use crate::tophits::{Coordinate, PeriodAnalysisSeries, TopHits};

/// Tolerance used to match a frequency against scan results.
pub const FREQUENCY_MATCH_TOLERANCE: f64 = 1e-9;

/// A continuous model of magnitude against absolute time.
pub trait ModelFunction {
    fn value(&self, t: f64) -> f64;
    fn first_derivative(&self, t: f64) -> f64;
    fn second_derivative(&self, t: f64) -> f64;
}

/// Polynomial plus sinusoids on the normalized time axis of a series.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct Curve {
    zero_point: f64,
    scale: f64,
    polynomial: Vec<f64>,
    /// (frequency, cosine, sine)
    sinusoids: Vec<(f64, f64, f64)>,
}

impl Curve {
    pub(crate) fn from_fit(series: &TimeSeries, fit: &FitResult) -> Self {
        Self {
            zero_point: series.absolute_time(series.zero_point()),
            scale: series.scale(),
            polynomial: fit.polynomial().to_vec(),
            sinusoids: fit
                .frequencies
                .iter()
                .enumerate()
                .map(|(k, &f)| (f, fit.cosine(k), fit.sine(k)))
                .collect(),
        }
    }

    pub(crate) fn zero_point(&self) -> f64 {
        self.zero_point
    }

    /// `order`-th derivative at absolute time `t` (order 0 is the value).
    fn derivative(&self, t: f64, order: u32) -> f64 {
        let u = t - self.zero_point;
        let tau = u / self.scale;

        let mut poly = 0.0;
        for (k, &c) in self.polynomial.iter().enumerate().skip(order as usize) {
            let falling: f64 = (0..order).map(|j| (k as u32 - j) as f64).product();
            poly += c * falling * tau.powi(k as i32 - order as i32);
        }
        poly /= self.scale.powi(order as i32);

        let shift = order as f64 * PI / 2.0;
        let trig: f64 = self
            .sinusoids
            .iter()
            .map(|&(f, a, b)| {
                let omega = 2.0 * PI * f;
                let x = omega * u + shift;
                omega.powi(order as i32) * (a * x.cos() + b * x.sin())
            })
            .sum();

        poly + trig
    }
}

impl ModelFunction for Curve {
    fn value(&self, t: f64) -> f64 {
        self.derivative(t, 0)
    }

    fn first_derivative(&self, t: f64) -> f64 {
        self.derivative(t, 1)
    }

    fn second_derivative(&self, t: f64) -> f64 {
        self.derivative(t, 2)
    }
}

/// Fitted parameters of one frequency.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodFitParameters {
    pub frequency: f64,
    pub period: f64,
    /// Semi-amplitude `sqrt(cosine² + sine²)`
    pub amplitude: f64,
    pub cosine: f64,
    pub sine: f64,
    /// Constant term of the model
    pub constant: f64,
    /// Absolute time at which the phase is zero
    pub zero_point: f64,
}

impl PeriodFitParameters {
    /// Contribution of this frequency at absolute time `t` (without the
    /// constant term).
    pub fn value_at(&self, t: f64) -> f64 {
        let phase = 2.0 * PI * self.frequency * (t - self.zero_point);
        self.cosine * phase.cos() + self.sine * phase.sin()
    }

    /// One-line description of every parameter.
    pub fn to_prosaic_string(&self) -> String {
        format!(
            "frequency={:.6}, period={:.6}, amplitude={:.6}, cosine coefficient={:.6}, \
             sine coefficient={:.6}, constant coefficient={:.6}",
            self.frequency, self.period, self.amplitude, self.cosine, self.sine, self.constant
        )
    }
}

impl fmt::Display for PeriodFitParameters {
    /// The two terms, e.g. `+1.250000 × cos(2π × 0.073100 × (t - zeroPoint)) -0.300000 × sin(…)`.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let arg = format!("2π × {:.6} × (t - zeroPoint)", self.frequency);
        write!(
            f,
            "{:+.6} × cos({}) {:+.6} × sin({})",
            self.cosine, arg, self.sine, arg
        )
    }
}

/// Kind of a [`ModelSample`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleTag {
    Model,
    Residual,
}

/// A model or residual value at an observation time.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelSample {
    /// Absolute time
    pub time: f64,
    pub value: f64,
    pub tag: SampleTag,
    pub description: String,
}

/// Goodness-of-fit summary.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FitMetrics {
    /// Number of residuals
    pub count: usize,
    /// Number of estimated coefficients
    pub parameters: usize,
    pub residual_mean: f64,
    /// Sample variance of the residuals
    pub residual_variance: f64,
    pub rms: f64,
    /// Akaike information criterion; NaN for a perfect fit
    pub aic: f64,
    /// Bayesian information criterion; NaN for a perfect fit
    pub bic: f64,
}

impl FitMetrics {
    /// Metrics for residuals of a model with `parameters` coefficients.
    pub fn from_residuals(residuals: &[f64], parameters: usize) -> Self {
        let summary = residual_summary(residuals);
        let n = summary.count as f64;
        let (aic, bic) = if summary.count > 0 && summary.sum_squares > 0.0 {
            let common = n * (summary.sum_squares / n).ln();
            (
                common + 2.0 * parameters as f64,
                common + parameters as f64 * n.ln(),
            )
        } else {
            (f64::NAN, f64::NAN)
        };
        Self {
            count: summary.count,
            parameters,
            residual_mean: summary.mean,
            residual_variance: summary.variance,
            rms: summary.rms,
            aic,
            bic,
        }
    }
}

/// Options for [`multi_periodic_fit`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ModelOptions {
    /// Polynomial degree of the trend
    pub degree: usize,
    /// Bias categories given an offset column
    pub bias: Vec<String>,
}

/// Low and high frequency of a peak's full width at half maximum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Fwhm {
    pub low: f64,
    pub high: f64,
}

impl Fwhm {
    pub fn width(&self) -> f64 {
        self.high - self.low
    }
}

/// A reconstructed multi-periodic model.
#[derive(Debug, Clone)]
pub struct MultiPeriodicModel {
    /// One entry per period, in input order
    pub parameters: Vec<PeriodFitParameters>,
    /// The underlying projection
    pub fit: FitResult,
    /// Fitted value at every active observation
    pub model: Vec<ModelSample>,
    /// Observed minus fitted at every active observation
    pub residuals: Vec<ModelSample>,
    pub metrics: FitMetrics,
    pub description: String,
    curve: Curve,
    scale: f64,
    zero_point: f64,
}

impl MultiPeriodicModel {
    /// Parameters of the first (fundamental) frequency.
    pub fn fundamental(&self) -> &PeriodFitParameters {
        &self.parameters[0]
    }

    /// Human-readable model function.
    pub fn function_string(&self) -> String {
        let mut s = format!("zeroPoint is {:.4}\n\nf(t:real) : real {{\n", self.zero_point);
        s.push_str(&format!("{:.6}\n", self.fit.coefficients[0]));
        for (k, c) in self.fit.polynomial().iter().enumerate().skip(1) {
            s.push_str(&format!(
                "{:+.6} × ((t - zeroPoint) / {})^{}\n",
                c, self.scale, k
            ));
        }
        for p in &self.parameters {
            s.push_str(&format!("{}\n", p));
        }
        s.push('}');
        s
    }

    fn single_frequency(&self) -> Result<&PeriodFitParameters> {
        if self.parameters.len() != 1 {
            return Err(PeriodError::InvalidInput(format!(
                "standard errors need a single-frequency model, got {} frequencies",
                self.parameters.len()
            )));
        }
        Ok(&self.parameters[0])
    }

    /// Standard error of the frequency, `sqrt(6 s² / (π² n A² T²))`.
    pub fn frequency_standard_error(&self) -> Result<f64> {
        let params = self.single_frequency()?;
        let n = self.residuals.len();
        let span = match (self.residuals.first(), self.residuals.last()) {
            (Some(first), Some(last)) => last.time - first.time,
            _ => 0.0,
        };
        if params.amplitude <= 0.0 || span <= 0.0 {
            return Err(PeriodError::InvalidInput(
                "standard error needs a non-zero amplitude and time span".to_string(),
            ));
        }
        let a = params.amplitude;
        Ok(
            (6.0 * self.metrics.residual_variance / (PI * PI * n as f64 * a * a * span * span))
                .sqrt(),
        )
    }

    /// Standard error of the semi-amplitude, `sqrt(2 s² / n)`.
    pub fn amplitude_standard_error(&self) -> Result<f64> {
        self.single_frequency()?;
        let n = self.residuals.len() as f64;
        Ok((2.0 * self.metrics.residual_variance / n).sqrt())
    }

    /// FWHM of the scan peak at the fundamental frequency.
    pub fn fwhm(&self, scan: &ScanResult) -> Result<Fwhm> {
        fwhm(&scan.series, &scan.top_hits, self.fundamental().frequency)
    }
}

impl ModelFunction for MultiPeriodicModel {
    fn value(&self, t: f64) -> f64 {
        self.curve.value(t)
    }

    fn first_derivative(&self, t: f64) -> f64 {
        self.curve.first_derivative(t)
    }

    fn second_derivative(&self, t: f64) -> f64 {
        self.curve.second_derivative(t)
    }
}

/// Fit a model with the given periods and reconstruct it at every active
/// observation.
///
/// # Arguments
/// * `series` - The prepared series
/// * `periods` - Final periods, all fixed
/// * `options` - Polynomial degree and bias categories
///
/// # Errors
/// Configuration errors for an empty or non-positive period list; numeric
/// degeneracies of the projection are returned as typed errors.
pub fn multi_periodic_fit(
    series: &TimeSeries,
    periods: &[f64],
    options: &ModelOptions,
) -> Result<MultiPeriodicModel> {
    if periods.is_empty() {
        return Err(PeriodError::InvalidInput(
            "a model needs at least one period".to_string(),
        ));
    }
    for &p in periods {
        if !p.is_finite() || p <= 0.0 {
            return Err(PeriodError::invalid_parameter(
                "period",
                p,
                "must be positive and finite",
            ));
        }
    }

    let frequencies: Vec<f64> = periods.iter().map(|p| 1.0 / p).collect();
    let projector = Projector::new(series, options.degree).with_bias(&options.bias);
    let fit = projector.solve(&frequencies)?;

    let zero_point = series.absolute_time(series.zero_point());
    let constant = fit.coefficients[0];
    let parameters: Vec<PeriodFitParameters> = frequencies
        .iter()
        .zip(periods.iter())
        .enumerate()
        .map(|(k, (&frequency, &period))| PeriodFitParameters {
            frequency,
            period,
            amplitude: fit.semi_amplitude(k),
            cosine: fit.cosine(k),
            sine: fit.sine(k),
            constant,
            zero_point,
        })
        .collect();

    let description = format!(
        "Fit from periods: {}",
        periods
            .iter()
            .map(|p| format!("{:.4}", p))
            .collect::<Vec<_>>()
            .join(" ")
    );

    let mut model = Vec::with_capacity(series.active_count());
    let mut residuals = Vec::with_capacity(series.active_count());
    let mut residual_values = Vec::with_capacity(series.active_count());
    for i in series.active_indices() {
        let t = series.times()[i];
        let fitted = projector.predict(&fit, t, series.bias_tags()[i].as_deref());
        let residual = series.magnitudes()[i] - fitted;
        let time = series.absolute_time(t);
        model.push(ModelSample {
            time,
            value: fitted,
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

    let metrics = FitMetrics::from_residuals(&residual_values, fit.coefficients.len());
    tracing::info!(
        periods = periods.len(),
        rms = metrics.rms,
        power = fit.power,
        "reconstructed multi-periodic model"
    );

    Ok(MultiPeriodicModel {
        parameters,
        curve: Curve::from_fit(series, &fit),
        fit,
        model,
        residuals,
        metrics,
        description,
        scale: series.scale(),
        zero_point,
    })
}

/// Full width at half maximum of a scan peak.
///
/// Walks the scan series left and right of `frequency` while the power stays
/// at or above half the peak power.
///
/// # Errors
/// `InvalidParameter` when `frequency` is not a top hit or does not occur in
/// the series.
pub fn fwhm(series: &PeriodAnalysisSeries, top_hits: &TopHits, frequency: f64) -> Result<Fwhm> {
    if top_hits
        .find_frequency(frequency, FREQUENCY_MATCH_TOLERANCE)
        .is_none()
    {
        return Err(PeriodError::invalid_parameter(
            "frequency",
            frequency,
            "is not a top hit",
        ));
    }

    let frequencies = series.get(Coordinate::Frequency);
    let powers = series.get(Coordinate::Power);
    let index = frequencies
        .iter()
        .position(|&f| (f - frequency).abs() <= FREQUENCY_MATCH_TOLERANCE)
        .ok_or_else(|| {
            PeriodError::invalid_parameter("frequency", frequency, "does not occur in the scan")
        })?;

    let half = powers[index] / 2.0;
    let mut low = frequencies[index];
    for i in (0..=index).rev() {
        if powers[i] < half {
            break;
        }
        low = frequencies[i];
    }
    let mut high = frequencies[index];
    for i in index..powers.len() {
        if powers[i] < half {
            break;
        }
        high = frequencies[i];
    }

    Ok(Fwhm { low, high })
}
