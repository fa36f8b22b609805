//! CLEANest refinement of candidate periods.
//!
//! Variable components are stepped in period by a per-component resolution
//! while the Fourier power of the joint fit strictly improves. Components
//! are visited in rotation until a full round passes without improvement.

use std::fmt;
use std::str::FromStr;

use crate::cancel::CancellationToken;
use crate::error::{PeriodError, Result};
use crate::projector::Projector;
use crate::series::TimeSeries;
use crate::tophits::PeriodAnalysisDataPoint;

/// Default cap on projector evaluations per refinement.
pub const DEFAULT_MAX_EVALUATIONS: usize = 100_000;

/// How the refiner treats a component.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ComponentRole {
    /// Part of the model, never searched
    Fixed,
    /// Optimised by the refiner
    Variable,
    /// Included in every fit but never moved
    Locked,
}

impl fmt::Display for ComponentRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ComponentRole::Fixed => "fixed",
            ComponentRole::Variable => "variable",
            ComponentRole::Locked => "locked",
        };
        f.write_str(name)
    }
}

impl FromStr for ComponentRole {
    type Err = PeriodError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "fixed" | "f" => Ok(Self::Fixed),
            "variable" | "var" | "v" => Ok(Self::Variable),
            "locked" | "lock" | "l" => Ok(Self::Locked),
            _ => Err(PeriodError::invalid_parameter(
                "role",
                s,
                "expected fixed, variable or locked",
            )),
        }
    }
}

/// A frequency in a multi-frequency model.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FrequencyComponent {
    pub frequency: f64,
    pub role: ComponentRole,
}

impl FrequencyComponent {
    pub fn new(frequency: f64, role: ComponentRole) -> Self {
        Self { frequency, role }
    }

    pub fn fixed(frequency: f64) -> Self {
        Self::new(frequency, ComponentRole::Fixed)
    }

    pub fn variable(frequency: f64) -> Self {
        Self::new(frequency, ComponentRole::Variable)
    }

    pub fn locked(frequency: f64) -> Self {
        Self::new(frequency, ComponentRole::Locked)
    }

    pub fn period(&self) -> f64 {
        1.0 / self.frequency
    }
}

/// Options for [`cleanest`].
#[derive(Debug, Clone, PartialEq)]
pub struct RefineOptions {
    /// Polynomial degree included in every fit
    pub degree: usize,
    /// Bias categories given an offset column
    pub bias: Vec<String>,
    /// Projector evaluations allowed before giving up
    pub max_evaluations: usize,
}

impl Default for RefineOptions {
    fn default() -> Self {
        Self {
            degree: 0,
            bias: Vec::new(),
            max_evaluations: DEFAULT_MAX_EVALUATIONS,
        }
    }
}

impl RefineOptions {
    pub fn validate(&self) -> Result<()> {
        if self.max_evaluations == 0 {
            return Err(PeriodError::invalid_parameter(
                "max_evaluations",
                self.max_evaluations,
                "must be at least 1",
            ));
        }
        Ok(())
    }
}

/// Outcome of a refinement.
#[derive(Debug, Clone)]
pub struct RefinementResult {
    /// Components with their final frequencies, in input order
    pub components: Vec<FrequencyComponent>,
    /// Period step of each component (0 for components that never move)
    pub resolutions: Vec<f64>,
    /// Fourier power of the final configuration
    pub power: f64,
    /// One point per component carrying the final power and the
    /// component's own semi-amplitude
    pub delta_top_hits: Vec<PeriodAnalysisDataPoint>,
    /// Power at start followed by every improvement
    pub power_history: Vec<f64>,
    /// Projector evaluations spent
    pub evaluations: usize,
    /// True when refinement stopped early on request
    pub cancelled: bool,
}

/// Round a period resolution to a mantissa of 1, 2 or 5 times a power of
/// ten and snap the period onto a multiple of it.
///
/// # Returns
/// `(resolution, snapped_period)`, or `None` for a zero or non-finite
/// resolution.
pub fn resolve_period(resolution: f64, period: f64) -> Option<(f64, f64)> {
    if !resolution.is_finite() || resolution <= 0.0 {
        return None;
    }

    let mut mantissa = resolution;
    let mut exponent = 0i32;
    while mantissa < 1.0 {
        mantissa *= 10.0;
        exponent -= 1;
    }
    while mantissa >= 10.0 {
        mantissa /= 10.0;
        exponent += 1;
    }

    let digit = if mantissa < 2.0 {
        1.0
    } else if mantissa < 5.0 {
        2.0
    } else {
        5.0
    };
    let resolution = digit * 10f64.powi(exponent);
    Some((resolution, resolution * (period / resolution + 0.5).floor()))
}

struct Search<'a, 'b> {
    projector: &'b Projector<'a>,
    frequencies: Vec<f64>,
    evaluations: usize,
    max_evaluations: usize,
}

impl Search<'_, '_> {
    fn power(&mut self) -> Result<f64> {
        self.evaluations += 1;
        if self.evaluations > self.max_evaluations {
            return Err(PeriodError::ConvergenceFailure(format!(
                "no convergence within {} evaluations",
                self.max_evaluations
            )));
        }
        Ok(self.projector.evaluate(&self.frequencies).fourier_power)
    }

    fn power_with(&mut self, index: usize, period: f64) -> Result<f64> {
        let saved = self.frequencies[index];
        self.frequencies[index] = 1.0 / period;
        let power = self.power();
        self.frequencies[index] = saved;
        power
    }
}

/// Refine candidate periods with the CLEANest coordinate search.
///
/// # Arguments
/// * `series` - The prepared series
/// * `components` - Starting frequencies and their roles
/// * `options` - Model options and the evaluation cap
/// * `cancel` - Polled between component visits
///
/// # Returns
/// The refined components with the delta top hits and power history.
///
/// # Errors
/// * `InvalidInput` / `InvalidParameter` - no components, or a
///   non-positive frequency
/// * `ConvergenceFailure` - a variable component has no usable resolution,
///   or the evaluation cap is exceeded
pub fn cleanest(
    series: &TimeSeries,
    components: &[FrequencyComponent],
    options: &RefineOptions,
    cancel: &CancellationToken,
) -> Result<RefinementResult> {
    cleanest_until(series, components, options, || cancel.is_cancelled())
}

/// Refine, polling `stop` before every component visit.
pub(crate) fn cleanest_until<S>(
    series: &TimeSeries,
    components: &[FrequencyComponent],
    options: &RefineOptions,
    mut stop: S,
) -> Result<RefinementResult>
where
    S: FnMut() -> bool,
{
    options.validate()?;
    if components.is_empty() {
        return Err(PeriodError::InvalidInput(
            "refinement needs at least one component".to_string(),
        ));
    }
    for c in components {
        if !c.frequency.is_finite() || c.frequency <= 0.0 {
            return Err(PeriodError::invalid_parameter(
                "frequency",
                c.frequency,
                "must be positive and finite",
            ));
        }
    }

    let cutoff = series.cutoff_frequency();
    let mut periods: Vec<f64> = components.iter().map(|c| c.period()).collect();
    let mut resolutions = vec![0.0; components.len()];
    let mut variable = Vec::new();

    for (i, c) in components.iter().enumerate() {
        if c.role != ComponentRole::Variable {
            continue;
        }
        let (resolution, snapped) = resolve_period(cutoff * periods[i] * periods[i] / 10.0, periods[i])
            .ok_or_else(|| {
                PeriodError::ConvergenceFailure(format!(
                    "no usable period resolution for frequency {}",
                    c.frequency
                ))
            })?;
        if !(snapped > 0.0) {
            return Err(PeriodError::ConvergenceFailure(format!(
                "period {} snaps to {} at resolution {}",
                periods[i], snapped, resolution
            )));
        }
        resolutions[i] = resolution;
        periods[i] = snapped;
        variable.push(i);
    }

    let projector = Projector::new(series, options.degree).with_bias(&options.bias);
    let mut search = Search {
        projector: &projector,
        frequencies: components
            .iter()
            .zip(periods.iter())
            .map(|(c, &p)| match c.role {
                ComponentRole::Variable => 1.0 / p,
                _ => c.frequency,
            })
            .collect(),
        evaluations: 0,
        max_evaluations: options.max_evaluations,
    };

    tracing::info!(
        components = components.len(),
        variable = variable.len(),
        "starting CLEANest refinement"
    );

    let initial = search.power()?;
    let mut best = if initial == 0.0 { 1.0 } else { initial };
    let mut history = vec![initial];
    let mut cancelled = false;

    let mut unchanged = 0;
    let mut cursor = 0;
    while unchanged < variable.len() {
        if stop() {
            tracing::info!(evaluations = search.evaluations, "refinement cancelled");
            cancelled = true;
            break;
        }

        let nv = variable[cursor];
        cursor = (cursor + 1) % variable.len();

        let mut improved = false;
        for direction in [1.0, -1.0] {
            loop {
                let candidate = periods[nv] + direction * resolutions[nv];
                if candidate <= 0.0 {
                    break;
                }
                let power = search.power_with(nv, candidate)?;
                if power > best {
                    best = power;
                    periods[nv] = candidate;
                    search.frequencies[nv] = 1.0 / candidate;
                    history.push(power);
                    improved = true;
                    tracing::debug!(component = nv, period = candidate, power, "improved");
                } else {
                    break;
                }
            }
            if improved {
                break;
            }
        }

        unchanged = if improved { 0 } else { unchanged + 1 };
    }

    let final_fit = projector.evaluate(&search.frequencies);
    let refined: Vec<FrequencyComponent> = components
        .iter()
        .zip(search.frequencies.iter())
        .map(|(c, &f)| FrequencyComponent::new(f, c.role))
        .collect();
    let delta_top_hits = refined
        .iter()
        .enumerate()
        .map(|(k, c)| {
            PeriodAnalysisDataPoint::from_frequency(
                c.frequency,
                final_fit.fourier_power,
                final_fit.semi_amplitude(k),
            )
        })
        .collect();

    tracing::info!(
        power = final_fit.fourier_power,
        improvements = history.len() - 1,
        evaluations = search.evaluations,
        "CLEANest refinement finished"
    );

    Ok(RefinementResult {
        components: refined,
        resolutions,
        power: final_fit.fourier_power,
        delta_top_hits,
        power_history: history,
        evaluations: search.evaluations,
        cancelled,
    })
}
