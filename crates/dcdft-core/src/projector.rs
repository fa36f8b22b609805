//! Weighted least-squares projection onto a polynomial + sinusoid + bias
//! basis (the date-compensated DFT kernel).
//!
//! For a prepared [`TimeSeries`] and an ordered list of frequencies the
//! projector accumulates the normal equations of the model
//!
//! ```text
//! x(t) = Σ_k c_k τ^k + Σ_j (a_j cos(2π f_j scale τ) + b_j sin(2π f_j scale τ)) + Σ_b d_b [tag = b]
//! ```
//!
//! with `τ = (t - zero) / scale`, inverts them and reports the explained
//! variance together with the power statistics used by scans and
//! refinement.

use faer::linalg::solvers::DenseSolveCore;
use faer::Mat;

use crate::error::{PeriodError, Result};
use crate::series::TimeSeries;

/// Frequencies closer than this are treated as identical.
pub const MIN_FREQUENCY_SEPARATION: f64 = 1e-8;

/// Outcome of one projection.
#[derive(Debug, Clone, PartialEq)]
pub struct FitResult {
    /// Frequencies of the sinusoid columns, in column order
    pub frequencies: Vec<f64>,
    /// Coefficients: `degree + 1` polynomial terms, a cosine/sine pair per
    /// frequency, then one offset per bias category. Empty when degenerate.
    pub coefficients: Vec<f64>,
    /// Polynomial degree
    pub degree: usize,
    /// Bias categories with a column in the model
    pub bias_categories: Vec<String>,
    /// Variance explained by the model (`damp2`)
    pub explained_variance: f64,
    /// F-statistic-like power of the whole model
    pub power: f64,
    /// Power of the sinusoids over the polynomial baseline
    pub fourier_power: f64,
    /// Semi-amplitude of the leading frequency
    pub amplitude: f64,
    /// Amplitude derived from the variance explained over the baseline
    pub fourier_amplitude: f64,
    /// Number of non-constant model columns
    pub dimension: usize,
}

impl FitResult {
    fn zeroed(frequencies: &[f64], degree: usize, bias_categories: &[String]) -> Self {
        Self {
            frequencies: frequencies.to_vec(),
            coefficients: Vec::new(),
            degree,
            bias_categories: bias_categories.to_vec(),
            explained_variance: 0.0,
            power: 0.0,
            fourier_power: 0.0,
            amplitude: 0.0,
            fourier_amplitude: 0.0,
            dimension: degree + 2 * frequencies.len() + bias_categories.len(),
        }
    }

    /// True when the projection degenerated and carries no coefficients.
    pub fn is_degenerate(&self) -> bool {
        self.coefficients.is_empty()
    }

    /// Polynomial coefficients in normalized time units.
    pub fn polynomial(&self) -> &[f64] {
        if self.is_degenerate() {
            &[]
        } else {
            &self.coefficients[..=self.degree]
        }
    }

    /// Cosine coefficient of the `k`-th frequency.
    pub fn cosine(&self, k: usize) -> f64 {
        self.coefficients
            .get(self.degree + 1 + 2 * k)
            .copied()
            .unwrap_or(0.0)
    }

    /// Sine coefficient of the `k`-th frequency.
    pub fn sine(&self, k: usize) -> f64 {
        self.coefficients
            .get(self.degree + 2 + 2 * k)
            .copied()
            .unwrap_or(0.0)
    }

    /// Semi-amplitude `sqrt(cos² + sin²)` of the `k`-th frequency.
    pub fn semi_amplitude(&self, k: usize) -> f64 {
        self.cosine(k).hypot(self.sine(k))
    }

    /// Fitted offset of a bias category.
    pub fn bias_offset(&self, category: &str) -> Option<f64> {
        let first = self.degree + 1 + 2 * self.frequencies.len();
        self.bias_categories
            .iter()
            .position(|c| c == category)
            .and_then(|i| self.coefficients.get(first + i).copied())
    }
}

/// Call-local normal equations `M c = v`.
#[derive(Debug, Clone)]
pub struct NormalEquations {
    matrix: Mat<f64>,
    vector: Vec<f64>,
    weight_sum: f64,
}

impl NormalEquations {
    /// Zeroed system for `size` basis columns.
    pub fn new(size: usize) -> Self {
        Self {
            matrix: Mat::zeros(size, size),
            vector: vec![0.0; size],
            weight_sum: 0.0,
        }
    }

    pub fn size(&self) -> usize {
        self.vector.len()
    }

    /// Add `w·row·rowᵀ` and `w·x·row` (upper triangle only).
    pub fn accumulate(&mut self, row: &[f64], weight: f64, value: f64) {
        let n = self.size();
        let wx = weight * value;
        for a in 0..n {
            let wa = weight * row[a];
            self.vector[a] += wx * row[a];
            for b in a..n {
                self.matrix[(a, b)] += wa * row[b];
            }
        }
        self.weight_sum += weight;
    }

    /// Normalize by the weight sum and mirror the upper triangle.
    pub fn finish(&mut self) {
        let n = self.size();
        if self.weight_sum > 0.0 {
            for a in 0..n {
                self.vector[a] /= self.weight_sum;
                for b in a..n {
                    self.matrix[(a, b)] /= self.weight_sum;
                }
            }
        }
        for a in 1..n {
            for b in 0..a {
                self.matrix[(a, b)] = self.matrix[(b, a)];
            }
        }
    }

    /// Solve for the coefficients.
    ///
    /// # Returns
    /// `(coefficients, c·v)`
    pub fn solve(&self) -> Result<(Vec<f64>, f64)> {
        let inverse = invert(&self.matrix)?;
        let n = self.size();
        let coefficients: Vec<f64> = (0..n)
            .map(|a| (0..n).map(|b| inverse[(a, b)] * self.vector[b]).sum())
            .collect();
        if coefficients.iter().any(|c| !c.is_finite()) {
            return Err(PeriodError::SingularMatrix { dim: n });
        }
        let projection = coefficients
            .iter()
            .zip(self.vector.iter())
            .map(|(c, v)| c * v)
            .sum();
        Ok((coefficients, projection))
    }
}

/// Invert a square matrix through its partial-pivoting LU factorization.
///
/// # Errors
/// `SingularMatrix` when the inverse has a non-finite entry, which is how a
/// zero pivot surfaces.
pub fn invert(matrix: &Mat<f64>) -> Result<Mat<f64>> {
    let n = matrix.nrows();
    if matrix.ncols() != n {
        return Err(PeriodError::SingularMatrix { dim: n });
    }
    let inverse = matrix.partial_piv_lu().inverse();
    let finite = (0..n).all(|j| (0..n).all(|i| inverse[(i, j)].is_finite()));
    if !finite {
        return Err(PeriodError::SingularMatrix { dim: n });
    }
    Ok(inverse)
}

/// Projects a [`TimeSeries`] onto frequency models.
///
/// The polynomial degree and bias categories are fixed at construction; the
/// frequencies vary per call. Every call allocates its own normal equations,
/// so a projector can be shared freely.
#[derive(Debug, Clone)]
pub struct Projector<'a> {
    series: &'a TimeSeries,
    degree: usize,
    bias_categories: Vec<String>,
    baseline: f64,
}

impl<'a> Projector<'a> {
    /// Create a projector with a polynomial of the given degree and no bias
    /// terms.
    pub fn new(series: &'a TimeSeries, degree: usize) -> Self {
        let mut projector = Self {
            series,
            degree,
            bias_categories: Vec::new(),
            baseline: 0.0,
        };
        if degree > 0 {
            projector.baseline = match projector.fit(&[]) {
                Ok(fit) => fit.explained_variance,
                Err(e) => {
                    tracing::warn!(degree, error = %e, "polynomial baseline failed, using 0");
                    0.0
                }
            };
        }
        projector
    }

    /// Add one offset column per selected bias category.
    ///
    /// Categories without active observations are dropped. When the
    /// selection covers every active observation the first category is
    /// dropped as well, becoming the reference level absorbed by the
    /// constant term.
    pub fn with_bias<S: AsRef<str>>(mut self, categories: &[S]) -> Self {
        let present = self.series.bias_categories();
        let mut selected: Vec<String> = Vec::new();
        for c in categories {
            let c = c.as_ref();
            if present.iter().any(|p| p == c) && !selected.iter().any(|s| s == c) {
                selected.push(c.to_string());
            } else if !present.iter().any(|p| p == c) {
                tracing::debug!(category = c, "bias category absent from active data");
            }
        }

        let series = self.series;
        let covers_all = !selected.is_empty()
            && series.active_indices().all(|i| {
                series.bias_tags()[i]
                    .as_deref()
                    .is_some_and(|t| selected.iter().any(|s| s == t))
            });
        if covers_all {
            let reference = selected.remove(0);
            tracing::debug!(category = %reference, "bias categories cover all data; using as reference");
        }

        self.bias_categories = selected;
        self
    }

    pub fn series(&self) -> &'a TimeSeries {
        self.series
    }

    pub fn degree(&self) -> usize {
        self.degree
    }

    pub fn bias_categories(&self) -> &[String] {
        &self.bias_categories
    }

    /// Variance explained by the polynomial alone (0 for degree 0).
    pub fn baseline(&self) -> f64 {
        self.baseline
    }

    /// Number of non-constant model columns for `n_frequencies`.
    pub fn dimension(&self, n_frequencies: usize) -> usize {
        self.degree + 2 * n_frequencies + self.bias_categories.len()
    }

    /// Project for use in scans: any degeneracy yields a zeroed result.
    pub fn evaluate(&self, frequencies: &[f64]) -> FitResult {
        match self.solve(frequencies) {
            Ok(fit) => fit,
            Err(e) => {
                tracing::debug!(?frequencies, error = %e, "degenerate projection");
                FitResult::zeroed(frequencies, self.degree, &self.bias_categories)
            }
        }
    }

    /// Project and report degeneracy as a typed error.
    ///
    /// # Errors
    /// * `DegenerateFrequencies` - a frequency below the guard or two
    ///   frequencies closer than [`MIN_FREQUENCY_SEPARATION`]
    /// * `ZeroVariance` - the magnitudes have no variance
    /// * `SingularMatrix` - the normal matrix cannot be inverted
    pub fn solve(&self, frequencies: &[f64]) -> Result<FitResult> {
        self.check_frequencies(frequencies)?;
        if self.series.magnitude_stats().variance <= 0.0 {
            return Err(PeriodError::ZeroVariance);
        }
        self.fit(frequencies)
    }

    fn check_frequencies(&self, frequencies: &[f64]) -> Result<()> {
        let guard = self.series.guard_frequency();
        for (i, &f) in frequencies.iter().enumerate() {
            if !f.is_finite() || f < guard {
                return Err(PeriodError::DegenerateFrequencies(format!(
                    "frequency {} is below the guard frequency {}",
                    f, guard
                )));
            }
            for &g in &frequencies[i + 1..] {
                if (f - g).abs() < MIN_FREQUENCY_SEPARATION {
                    return Err(PeriodError::DegenerateFrequencies(format!(
                        "frequencies {} and {} are not separable",
                        f, g
                    )));
                }
            }
        }
        Ok(())
    }

    fn fit(&self, frequencies: &[f64]) -> Result<FitResult> {
        let series = self.series;
        let size = 1 + self.dimension(frequencies.len());
        let mut equations = NormalEquations::new(size);
        let mut row = vec![0.0; size];

        for i in series.active_indices() {
            self.basis_row(
                series.times()[i],
                series.bias_tags()[i].as_deref(),
                frequencies,
                &mut row,
            );
            equations.accumulate(&row, series.weights()[i], series.magnitudes()[i]);
        }
        equations.finish();

        let (coefficients, projection) = equations.solve()?;

        let stats = series.magnitude_stats();
        let n = stats.count as f64;
        let dimension = size - 1;
        let explained_variance = (projection - stats.mean * stats.mean).max(0.0);

        let power = if dimension > 0 && stats.variance > 0.0 {
            (n - 1.0) * explained_variance / stats.variance / dimension as f64
        } else {
            0.0
        };

        let over_baseline = explained_variance - self.baseline;
        let residual_baseline = stats.variance - self.baseline;
        let fourier_power = if residual_baseline > 0.0 {
            (n - 1.0) * over_baseline / residual_baseline / 2.0
        } else {
            0.0
        };

        let mut fit = FitResult {
            frequencies: frequencies.to_vec(),
            coefficients,
            degree: self.degree,
            bias_categories: self.bias_categories.clone(),
            explained_variance,
            power,
            fourier_power,
            amplitude: 0.0,
            fourier_amplitude: (2.0 * over_baseline).max(0.0).sqrt(),
            dimension,
        };
        if !frequencies.is_empty() {
            fit.amplitude = fit.semi_amplitude(0);
        }
        Ok(fit)
    }

    /// Fill `row` with the basis functions at a relative time.
    pub(crate) fn basis_row(
        &self,
        relative_time: f64,
        tag: Option<&str>,
        frequencies: &[f64],
        row: &mut [f64],
    ) {
        let series = self.series;
        let tau = series.normalize_time(relative_time);

        row[0] = 1.0;
        for k in 1..=self.degree {
            row[k] = row[k - 1] * tau;
        }

        let mut col = self.degree + 1;
        for &f in frequencies {
            let phase = 2.0 * std::f64::consts::PI * f * series.scale() * tau;
            row[col] = phase.cos();
            row[col + 1] = phase.sin();
            col += 2;
        }

        for category in &self.bias_categories {
            row[col] = if tag == Some(category.as_str()) {
                1.0
            } else {
                0.0
            };
            col += 1;
        }
    }

    /// Model value of `fit` at a relative time, including the offset of
    /// `tag` when it has a bias column.
    pub(crate) fn predict(&self, fit: &FitResult, relative_time: f64, tag: Option<&str>) -> f64 {
        let mut row = vec![0.0; fit.coefficients.len()];
        if row.is_empty() {
            return 0.0;
        }
        self.basis_row(relative_time, tag, &fit.frequencies, &mut row);
        row.iter()
            .zip(fit.coefficients.iter())
            .map(|(r, c)| r * c)
            .sum()
    }
}
