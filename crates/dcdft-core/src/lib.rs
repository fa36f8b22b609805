//! Date-compensated DFT period analysis for irregularly sampled series.
//!
//! This crate provides the Rust implementation of the DCDFT period search,
//! CLEANest period refinement, multi-periodic model reconstruction,
//! polynomial trend fitting and extremum search on fitted models.
//!
//! A typical session prepares a [`TimeSeries`], runs a [`scan()`], refines
//! the best candidates with [`cleanest`] and reconstructs the final model
//! with [`multi_periodic_fit`].

pub mod cancel;
pub mod error;
pub mod extrema;
pub mod model;
pub mod polyfit;
pub mod projector;
pub mod refine;
pub mod scan;
pub mod series;
pub mod stats;
pub mod tophits;

// Re-exports for convenience
pub use cancel::CancellationToken;
pub use error::{ErrorCategory, PeriodError, Result};
pub use extrema::{
    search_interval, BracketingExtremaFinder, DerivativeExtremaFinder, ExtremaFinder, Extremum,
    ExtremumGoal,
};
pub use model::{
    fwhm, multi_periodic_fit, FitMetrics, Fwhm, ModelFunction, ModelOptions, ModelSample,
    MultiPeriodicModel, PeriodFitParameters, SampleTag,
};
pub use polyfit::{polynomial_fit, PolynomialFit, MAX_POLYNOMIAL_DEGREE};
pub use projector::{FitResult, NormalEquations, Projector, MIN_FREQUENCY_SEPARATION};
pub use refine::{
    cleanest, resolve_period, ComponentRole, FrequencyComponent, RefineOptions, RefinementResult,
    DEFAULT_MAX_EVALUATIONS,
};
pub use scan::{
    default_frequency_range, harmonics, scan, FrequencyRange, PeriodRange, ScanMode, ScanOptions,
    ScanResult, MAX_SCAN_STEPS,
};
pub use series::{Observation, TimeSeries};
pub use stats::{residual_summary, weighted_moments, ResidualSummary, WeightedMoments};
pub use tophits::{
    Coordinate, PeriodAnalysisDataPoint, PeriodAnalysisSeries, SlopeState, TopHitTracker,
    TopHits, DEFAULT_TOP_HITS,
};
