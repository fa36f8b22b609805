//! Extremum search on a fitted [`ModelFunction`].
//!
//! Two strategies are provided:
//!
//! * [`BracketingExtremaFinder`] grows a bracket from the search interval by
//!   golden-ratio expansion with parabolic extrapolation, then polishes it
//!   with argmin's bounded Brent solver. When the iteration cap is hit the cap is raised
//!   tenfold and the search retried.
//! * [`DerivativeExtremaFinder`] walks sample times looking for sign changes
//!   of the first derivative, localizes each by bisection and classifies it
//!   with the second derivative.

use std::fmt;
use std::str::FromStr;

use argmin::core::{CostFunction, Error as ArgminError, Executor, State, TerminationReason};
use argmin::solver::brent::BrentOpt;

use crate::cancel::CancellationToken;
use crate::error::{PeriodError, Result};
use crate::model::ModelFunction;
use crate::series::TimeSeries;

const GOLDEN_RATIO: f64 = 1.618_033_988_749_895;
const TINY: f64 = 1e-21;

/// Default bracket growth limit for parabolic extrapolation.
pub const DEFAULT_GROWTH_LIMIT: f64 = 100.0;
/// Default iteration cap of the first attempt.
pub const DEFAULT_MAX_ITERATIONS: usize = 100;
/// Attempts made before giving up, each with a tenfold iteration cap.
pub const DEFAULT_RETRIES: usize = 5;
/// Default number of sampling intervals of the derivative finder.
pub const DEFAULT_SAMPLES: usize = 1000;

/// Which extremum to look for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtremumGoal {
    Minimize,
    Maximize,
}

impl ExtremumGoal {
    /// Multiplier turning the goal into a minimization.
    fn sign(self) -> f64 {
        match self {
            ExtremumGoal::Minimize => 1.0,
            ExtremumGoal::Maximize => -1.0,
        }
    }
}

impl fmt::Display for ExtremumGoal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExtremumGoal::Minimize => write!(f, "minimize"),
            ExtremumGoal::Maximize => write!(f, "maximize"),
        }
    }
}

impl FromStr for ExtremumGoal {
    type Err = PeriodError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "min" | "minimum" | "minimize" => Ok(ExtremumGoal::Minimize),
            "max" | "maximum" | "maximize" => Ok(ExtremumGoal::Maximize),
            _ => Err(PeriodError::invalid_parameter(
                "goal",
                s,
                "expected one of: minimize, maximize",
            )),
        }
    }
}

/// A located extremum.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Extremum {
    /// Absolute time
    pub time: f64,
    pub value: f64,
    pub goal: ExtremumGoal,
}

/// Finds an extremum of a model function.
pub trait ExtremaFinder {
    /// Locate an extremum of the kind `goal` starting from the absolute time
    /// interval `range`.
    ///
    /// # Errors
    /// * `InvalidParameter` - the interval is empty or not finite
    /// * `ConvergenceFailure` - no extremum was found
    fn find(&self, goal: ExtremumGoal, range: (f64, f64)) -> Result<Extremum>;
}

fn check_range(range: (f64, f64)) -> Result<()> {
    let (lo, hi) = range;
    if !lo.is_finite() || !hi.is_finite() || lo >= hi {
        return Err(PeriodError::invalid_parameter(
            "range",
            format!("({}, {})", lo, hi),
            "must be a finite interval with low < high",
        ));
    }
    Ok(())
}

/// Search interval around the most extreme observation: from the nearest
/// less extreme observation on the left to the nearest one on the right.
///
/// Returns absolute times, or `None` when no observation is active.
pub fn search_interval(series: &TimeSeries, goal: ExtremumGoal) -> Option<(f64, f64)> {
    let active: Vec<usize> = series.active_indices().collect();
    let mags = series.magnitudes();
    let better = |a: f64, b: f64| goal.sign() * a < goal.sign() * b;

    let mut best = *active.first()?;
    for &i in &active {
        if better(mags[i], mags[best]) {
            best = i;
        }
    }

    let position = active.iter().position(|&i| i == best)?;
    let left = active[..position]
        .iter()
        .rev()
        .find(|&&i| better(mags[best], mags[i]))
        .copied()
        .unwrap_or(best);
    let right = active[position + 1..]
        .iter()
        .find(|&&i| better(mags[best], mags[i]))
        .copied()
        .unwrap_or(best);

    Some((
        series.absolute_time(series.times()[left]),
        series.absolute_time(series.times()[right]),
    ))
}

/// Why a single bracketing attempt failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AttemptFailure {
    IterationCap,
    NonFinite,
}

/// Three points `(lo, mid, hi)` with `g(mid)` below both ends.
#[derive(Debug, Clone, Copy)]
struct Bracket {
    lo: f64,
    mid: f64,
    hi: f64,
}

/// Bracket growth followed by Brent's method ([`BrentOpt`]).
pub struct BracketingExtremaFinder<'a, F: ?Sized> {
    function: &'a F,
    growth_limit: f64,
    max_iterations: usize,
    retries: usize,
    absolute_tolerance: f64,
    relative_tolerance: f64,
    cancel: Option<CancellationToken>,
}

impl<'a, F: ModelFunction + ?Sized> BracketingExtremaFinder<'a, F> {
    pub fn new(function: &'a F) -> Self {
        Self {
            function,
            growth_limit: DEFAULT_GROWTH_LIMIT,
            max_iterations: DEFAULT_MAX_ITERATIONS,
            retries: DEFAULT_RETRIES,
            absolute_tolerance: 1e-10,
            relative_tolerance: 1e-14,
            cancel: None,
        }
    }

    pub fn with_growth_limit(mut self, growth_limit: f64) -> Self {
        self.growth_limit = growth_limit;
        self
    }

    pub fn with_max_iterations(mut self, max_iterations: usize) -> Self {
        self.max_iterations = max_iterations;
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    /// Poll `token` before every attempt.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn objective(&self, goal: ExtremumGoal, t: f64) -> std::result::Result<f64, AttemptFailure> {
        let value = goal.sign() * self.function.value(t);
        if value.is_finite() && t.is_finite() {
            Ok(value)
        } else {
            Err(AttemptFailure::NonFinite)
        }
    }

    /// Expand from `(a, b)` downhill until the middle point is lowest.
    fn bracket(
        &self,
        goal: ExtremumGoal,
        a: f64,
        b: f64,
        max_iterations: usize,
    ) -> std::result::Result<Bracket, AttemptFailure> {
        let g = |t: f64| self.objective(goal, t);

        let (mut xa, mut xb) = (a, b);
        let (mut fa, mut fb) = (g(xa)?, g(xb)?);
        if fb > fa {
            std::mem::swap(&mut xa, &mut xb);
            std::mem::swap(&mut fa, &mut fb);
        }
        let mut xc = xb + GOLDEN_RATIO * (xb - xa);
        let mut fc = g(xc)?;

        let mut iterations = 0;
        while fb > fc {
            iterations += 1;
            if iterations > max_iterations {
                return Err(AttemptFailure::IterationCap);
            }

            let r = (xb - xa) * (fb - fc);
            let q = (xb - xc) * (fb - fa);
            let diff = q - r;
            let denom = if diff.abs() < TINY { 2.0 * TINY.copysign(diff) } else { 2.0 * diff };
            let mut u = xb - ((xb - xc) * q - (xb - xa) * r) / denom;
            let limit = xb + self.growth_limit * (xc - xb);
            let mut fu;

            if (xb - u) * (u - xc) > 0.0 {
                // parabolic point between b and c
                fu = g(u)?;
                if fu < fc {
                    xa = xb;
                    xb = u;
                    fa = fb;
                    fb = fu;
                    break;
                } else if fu > fb {
                    xc = u;
                    fc = fu;
                    break;
                }
                u = xc + GOLDEN_RATIO * (xc - xb);
                fu = g(u)?;
            } else if (xc - u) * (u - limit) > 0.0 {
                // parabolic point between c and the growth limit
                fu = g(u)?;
                if fu < fc {
                    xb = xc;
                    xc = u;
                    u = xc + GOLDEN_RATIO * (xc - xb);
                    fb = fc;
                    fc = fu;
                    fu = g(u)?;
                }
            } else if (u - limit) * (limit - xc) >= 0.0 {
                u = limit;
                fu = g(u)?;
            } else {
                u = xc + GOLDEN_RATIO * (xc - xb);
                fu = g(u)?;
            }

            xa = xb;
            xb = xc;
            xc = u;
            fa = fb;
            fb = fc;
            fc = fu;
        }

        let (lo, hi) = if xa < xc { (xa, xc) } else { (xc, xa) };
        Ok(Bracket { lo, mid: xb, hi })
    }

    /// Brent's method inside a bracket, run by argmin on offsets from the
    /// bracket midpoint.
    fn polish(
        &self,
        goal: ExtremumGoal,
        bracket: Bracket,
        max_iterations: usize,
    ) -> std::result::Result<f64, AttemptFailure> {
        let objective = Objective {
            function: self.function,
            sign: goal.sign(),
            origin: bracket.mid,
        };
        let solver = BrentOpt::new(bracket.lo - bracket.mid, bracket.hi - bracket.mid)
            .set_tolerance(self.relative_tolerance, self.absolute_tolerance);

        let result = Executor::new(objective, solver)
            .configure(|state| state.max_iters(max_iterations as u64))
            .run()
            .map_err(|e| {
                tracing::debug!(error = %e, "Brent minimisation failed");
                AttemptFailure::NonFinite
            })?;

        let state = result.state();
        if !matches!(
            state.get_termination_reason(),
            Some(TerminationReason::SolverConverged)
        ) {
            return Err(AttemptFailure::IterationCap);
        }
        state
            .get_best_param()
            .or(state.get_param())
            .map(|offset| bracket.mid + offset)
            .filter(|t| t.is_finite())
            .ok_or(AttemptFailure::NonFinite)
    }
}

/// The model function as an argmin cost, in offsets from `origin` and
/// signed so that the goal is a minimum.
struct Objective<'f, F: ?Sized> {
    function: &'f F,
    sign: f64,
    origin: f64,
}

impl<F: ModelFunction + ?Sized> CostFunction for Objective<'_, F> {
    type Param = f64;
    type Output = f64;

    fn cost(&self, offset: &f64) -> std::result::Result<f64, ArgminError> {
        let t = self.origin + offset;
        let value = self.sign * self.function.value(t);
        if value.is_finite() {
            Ok(value)
        } else {
            Err(ArgminError::msg(format!("model value at {} is not finite", t)))
        }
    }
}

impl<F: ModelFunction + ?Sized> ExtremaFinder for BracketingExtremaFinder<'_, F> {
    fn find(&self, goal: ExtremumGoal, range: (f64, f64)) -> Result<Extremum> {
        check_range(range)?;

        let mut max_iterations = self.max_iterations;
        for attempt in 1..=self.retries {
            if self.cancel.as_ref().is_some_and(|c| c.is_cancelled()) {
                tracing::info!(attempt, "extremum search cancelled");
                return Err(PeriodError::ConvergenceFailure(
                    "extremum search was cancelled".to_string(),
                ));
            }

            let outcome = self
                .bracket(goal, range.0, range.1, max_iterations)
                .and_then(|bracket| self.polish(goal, bracket, max_iterations));
            match outcome {
                Ok(time) => {
                    let value = self.function.value(time);
                    tracing::debug!(%goal, time, value, attempt, "located extremum");
                    return Ok(Extremum { time, value, goal });
                }
                Err(failure) => {
                    tracing::debug!(?failure, attempt, max_iterations, "extremum attempt failed");
                    max_iterations = max_iterations.saturating_mul(10);
                }
            }
        }

        Err(PeriodError::ConvergenceFailure(format!(
            "no {} found after {} attempts",
            goal, self.retries
        )))
    }
}

/// Derivative sign-change search over sample times.
pub struct DerivativeExtremaFinder<'a, F: ?Sized> {
    function: &'a F,
    sample_times: Option<Vec<f64>>,
    samples: usize,
    tolerance: f64,
}

impl<'a, F: ModelFunction + ?Sized> DerivativeExtremaFinder<'a, F> {
    /// Sample the search interval on a uniform grid of [`DEFAULT_SAMPLES`]
    /// intervals.
    pub fn new(function: &'a F) -> Self {
        Self {
            function,
            sample_times: None,
            samples: DEFAULT_SAMPLES,
            tolerance: 1e-9,
        }
    }

    /// Use explicit sample times (e.g. the observation times) instead of a
    /// uniform grid. Times outside the search interval are ignored.
    pub fn with_sample_times(mut self, times: Vec<f64>) -> Self {
        self.sample_times = Some(times);
        self
    }

    pub fn with_samples(mut self, samples: usize) -> Self {
        self.samples = samples.max(1);
        self
    }

    /// Bisection stops once the bracket is narrower than this.
    pub fn with_tolerance(mut self, tolerance: f64) -> Self {
        self.tolerance = tolerance;
        self
    }

    fn grid(&self, lo: f64, hi: f64) -> Vec<f64> {
        let mut times = match &self.sample_times {
            Some(times) => {
                let mut inside: Vec<f64> = times
                    .iter()
                    .copied()
                    .filter(|t| *t > lo && *t < hi)
                    .collect();
                inside.push(lo);
                inside.push(hi);
                inside
            }
            None => {
                let step = (hi - lo) / self.samples as f64;
                let mut grid: Vec<f64> =
                    (0..self.samples).map(|i| lo + i as f64 * step).collect();
                grid.push(hi);
                grid
            }
        };
        times.sort_by(|a, b| a.total_cmp(b));
        times.dedup();
        times
    }

    /// Root of the first derivative in `[a, b]`, where its sign changes.
    fn bisect(&self, mut a: f64, mut b: f64) -> f64 {
        let mut da = self.function.first_derivative(a);
        while b - a > self.tolerance {
            let m = 0.5 * (a + b);
            if m <= a || m >= b {
                break;
            }
            let dm = self.function.first_derivative(m);
            if dm == 0.0 {
                return m;
            }
            if dm.signum() == da.signum() {
                a = m;
                da = dm;
            } else {
                b = m;
            }
        }
        0.5 * (a + b)
    }
}

impl<F: ModelFunction + ?Sized> ExtremaFinder for DerivativeExtremaFinder<'_, F> {
    fn find(&self, goal: ExtremumGoal, range: (f64, f64)) -> Result<Extremum> {
        check_range(range)?;

        let times = self.grid(range.0, range.1);
        let mut best: Option<Extremum> = None;

        for pair in times.windows(2) {
            let (a, b) = (pair[0], pair[1]);
            let da = self.function.first_derivative(a);
            let db = self.function.first_derivative(b);

            let root = if da == 0.0 {
                a
            } else if db != 0.0 && da.signum() != db.signum() {
                self.bisect(a, b)
            } else {
                continue;
            };

            let curvature = self.function.second_derivative(root);
            let kind = if curvature < 0.0 {
                ExtremumGoal::Maximize
            } else if curvature > 0.0 {
                ExtremumGoal::Minimize
            } else {
                continue;
            };
            if kind != goal {
                continue;
            }

            let candidate = Extremum {
                time: root,
                value: self.function.value(root),
                goal,
            };
            let improves = match &best {
                Some(current) => goal.sign() * candidate.value < goal.sign() * current.value,
                None => true,
            };
            if improves {
                best = Some(candidate);
            }
        }

        match best {
            Some(extremum) => {
                tracing::debug!(%goal, time = extremum.time, value = extremum.value, "located extremum");
                Ok(extremum)
            }
            None => Err(PeriodError::ConvergenceFailure(format!(
                "no {} of the first derivative in ({}, {})",
                match goal {
                    ExtremumGoal::Minimize => "minimum",
                    ExtremumGoal::Maximize => "maximum",
                },
                range.0,
                range.1
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::f64::consts::PI;

    struct Wave {
        zero: f64,
        frequency: f64,
        cosine: f64,
        sine: f64,
    }

    impl Wave {
        fn omega(&self) -> f64 {
            2.0 * PI * self.frequency
        }

        /// Time of the `k`-th maximum after the zero point.
        fn peak(&self, k: i32) -> f64 {
            self.zero
                + self.sine.atan2(self.cosine) / self.omega()
                + k as f64 / self.frequency
        }
    }

    impl ModelFunction for Wave {
        fn value(&self, t: f64) -> f64 {
            let x = self.omega() * (t - self.zero);
            self.cosine * x.cos() + self.sine * x.sin()
        }

        fn first_derivative(&self, t: f64) -> f64 {
            let x = self.omega() * (t - self.zero);
            self.omega() * (-self.cosine * x.sin() + self.sine * x.cos())
        }

        fn second_derivative(&self, t: f64) -> f64 {
            -self.omega() * self.omega() * self.value(t)
        }
    }

    struct Line;

    impl ModelFunction for Line {
        fn value(&self, t: f64) -> f64 {
            2.0 * t
        }
        fn first_derivative(&self, _t: f64) -> f64 {
            2.0
        }
        fn second_derivative(&self, _t: f64) -> f64 {
            0.0
        }
    }

    fn wave() -> Wave {
        Wave {
            zero: 2450000.0,
            frequency: 0.0731,
            cosine: 1.25,
            sine: 0.3,
        }
    }

    #[test]
    fn test_goal_from_str() {
        assert_eq!("max".parse::<ExtremumGoal>().unwrap(), ExtremumGoal::Maximize);
        assert_eq!("Minimum".parse::<ExtremumGoal>().unwrap(), ExtremumGoal::Minimize);
        assert!("sideways".parse::<ExtremumGoal>().is_err());
        assert_eq!(ExtremumGoal::Maximize.to_string(), "maximize");
    }

    #[test]
    fn test_bracketing_finds_maximum() {
        let w = wave();
        let peak = w.peak(3);
        let found = BracketingExtremaFinder::new(&w)
            .find(ExtremumGoal::Maximize, (peak - 2.0, peak + 2.5))
            .unwrap();
        assert!((found.time - peak).abs() < 1e-6);
        assert!((found.value - 1.25_f64.hypot(0.3)).abs() < 1e-10);
        assert_eq!(found.goal, ExtremumGoal::Maximize);
    }

    #[test]
    fn test_bracketing_finds_minimum() {
        let w = wave();
        let trough = w.peak(2) + 0.5 / w.frequency;
        let found = BracketingExtremaFinder::new(&w)
            .find(ExtremumGoal::Minimize, (trough - 1.0, trough + 1.5))
            .unwrap();
        assert!((found.time - trough).abs() < 1e-6);
        assert!((found.value + 1.25_f64.hypot(0.3)).abs() < 1e-10);
    }

    #[test]
    fn test_brent_polish_inside_bracket() {
        let w = wave();
        let peak = w.peak(5);
        let finder = BracketingExtremaFinder::new(&w);
        let bracket = Bracket {
            lo: peak - 1.0,
            mid: peak + 0.2,
            hi: peak + 1.0,
        };

        let time = finder.polish(ExtremumGoal::Maximize, bracket, 1000).unwrap();
        assert!((time - peak).abs() < 1e-6);
        assert_eq!(
            finder.polish(ExtremumGoal::Maximize, bracket, 1),
            Err(AttemptFailure::IterationCap)
        );
    }

    #[test]
    fn test_bracketing_raises_cap_on_retry() {
        let w = wave();
        let peak = w.peak(3);
        let found = BracketingExtremaFinder::new(&w)
            .with_max_iterations(2)
            .find(ExtremumGoal::Maximize, (peak - 2.0, peak + 2.5))
            .unwrap();
        assert!((found.time - peak).abs() < 1e-6);

        let err = BracketingExtremaFinder::new(&w)
            .with_max_iterations(1)
            .with_retries(1)
            .find(ExtremumGoal::Maximize, (peak - 2.0, peak + 2.5))
            .unwrap_err();
        assert!(matches!(err, PeriodError::ConvergenceFailure(_)));
    }

    #[test]
    fn test_bracketing_gives_up_without_extremum() {
        let err = BracketingExtremaFinder::new(&Line)
            .with_retries(2)
            .find(ExtremumGoal::Maximize, (0.0, 1.0))
            .unwrap_err();
        assert!(matches!(err, PeriodError::ConvergenceFailure(_)));
    }

    #[test]
    fn test_bracketing_honours_cancellation() {
        let w = wave();
        let token = CancellationToken::new();
        token.cancel();
        let peak = w.peak(1);
        let err = BracketingExtremaFinder::new(&w)
            .with_cancellation(token)
            .find(ExtremumGoal::Maximize, (peak - 1.0, peak + 1.0))
            .unwrap_err();
        assert!(matches!(err, PeriodError::ConvergenceFailure(_)));
    }

    #[test]
    fn test_derivative_finds_maximum() {
        let w = wave();
        let peak = w.peak(4);
        let found = DerivativeExtremaFinder::new(&w)
            .find(ExtremumGoal::Maximize, (peak - 5.0, peak + 5.0))
            .unwrap();
        assert!((found.time - peak).abs() < 1e-6);
    }

    #[test]
    fn test_derivative_picks_most_extreme() {
        // two maxima in range; the trend makes the later one higher
        struct Trended(Wave);
        impl ModelFunction for Trended {
            fn value(&self, t: f64) -> f64 {
                self.0.value(t) + 0.01 * (t - self.0.zero)
            }
            fn first_derivative(&self, t: f64) -> f64 {
                self.0.first_derivative(t) + 0.01
            }
            fn second_derivative(&self, t: f64) -> f64 {
                self.0.second_derivative(t)
            }
        }

        let w = wave();
        let (first, second) = (w.peak(1), w.peak(2));
        let f = Trended(wave());
        let found = DerivativeExtremaFinder::new(&f)
            .find(ExtremumGoal::Maximize, (first - 3.0, second + 3.0))
            .unwrap();
        assert!((found.time - second).abs() < 0.1);
        assert!(found.time > 0.5 * (first + second));
    }

    #[test]
    fn test_derivative_with_sample_times() {
        let w = wave();
        let peak = w.peak(2);
        let times: Vec<f64> = (0..40).map(|i| peak - 6.0 + 0.3 * i as f64).collect();
        let found = DerivativeExtremaFinder::new(&w)
            .with_sample_times(times)
            .find(ExtremumGoal::Maximize, (peak - 6.0, peak + 6.0))
            .unwrap();
        assert!((found.time - peak).abs() < 1e-6);
    }

    #[test]
    fn test_derivative_reports_missing_extremum() {
        let w = wave();
        let peak = w.peak(1);
        let err = DerivativeExtremaFinder::new(&w)
            .find(ExtremumGoal::Minimize, (peak - 3.0, peak + 3.0))
            .unwrap_err();
        assert!(matches!(err, PeriodError::ConvergenceFailure(_)));
        assert!(DerivativeExtremaFinder::new(&Line)
            .find(ExtremumGoal::Maximize, (0.0, 10.0))
            .is_err());
    }

    #[test]
    fn test_invalid_range() {
        let w = wave();
        assert!(matches!(
            DerivativeExtremaFinder::new(&w).find(ExtremumGoal::Maximize, (5.0, 5.0)),
            Err(PeriodError::InvalidParameter { .. })
        ));
        assert!(matches!(
            BracketingExtremaFinder::new(&w).find(ExtremumGoal::Maximize, (f64::NAN, 5.0)),
            Err(PeriodError::InvalidParameter { .. })
        ));
    }

    #[test]
    fn test_search_interval() {
        let times = [10.0, 11.0, 12.0, 13.0, 14.0, 15.0];
        let mags = [1.0, 3.0, 5.0, 5.0, 2.0, 0.5];
        let series = TimeSeries::from_columns(&times, &mags).unwrap();

        let (lo, hi) = search_interval(&series, ExtremumGoal::Maximize).unwrap();
        assert!((lo - 11.0).abs() < 1e-9);
        assert!((hi - 14.0).abs() < 1e-9);

        let (lo, hi) = search_interval(&series, ExtremumGoal::Minimize).unwrap();
        assert!((lo - 14.0).abs() < 1e-9);
        assert!((hi - 15.0).abs() < 1e-9);
    }
}
