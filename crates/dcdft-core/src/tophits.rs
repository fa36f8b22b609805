//! Period-analysis result series and the bounded top-hit table.

use std::fmt;
use std::str::FromStr;

use crate::error::{PeriodError, Result};

/// Default number of entries retained in a [`TopHits`] table.
pub const DEFAULT_TOP_HITS: usize = 20;

/// One evaluated candidate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct PeriodAnalysisDataPoint {
    pub frequency: f64,
    pub period: f64,
    pub power: f64,
    /// Semi-amplitude of the candidate sinusoid
    pub amplitude: f64,
}

impl PeriodAnalysisDataPoint {
    pub fn new(frequency: f64, period: f64, power: f64, amplitude: f64) -> Self {
        Self {
            frequency,
            period,
            power,
            amplitude,
        }
    }

    /// Build a point from a frequency; the period is its reciprocal (0 for a
    /// zero frequency).
    pub fn from_frequency(frequency: f64, power: f64, amplitude: f64) -> Self {
        let period = if frequency != 0.0 { 1.0 / frequency } else { 0.0 };
        Self::new(frequency, period, power, amplitude)
    }

    pub fn get(&self, coordinate: Coordinate) -> f64 {
        match coordinate {
            Coordinate::Frequency => self.frequency,
            Coordinate::Period => self.period,
            Coordinate::Power => self.power,
            Coordinate::Amplitude => self.amplitude,
        }
    }
}

/// Coordinate of a period-analysis series.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Coordinate {
    Frequency,
    Period,
    Power,
    Amplitude,
}

impl Coordinate {
    pub const ALL: [Coordinate; 4] = [
        Coordinate::Frequency,
        Coordinate::Period,
        Coordinate::Power,
        Coordinate::Amplitude,
    ];
}

impl fmt::Display for Coordinate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Coordinate::Frequency => "frequency",
            Coordinate::Period => "period",
            Coordinate::Power => "power",
            Coordinate::Amplitude => "amplitude",
        };
        f.write_str(name)
    }
}

impl FromStr for Coordinate {
    type Err = PeriodError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "frequency" | "freq" | "f" => Ok(Self::Frequency),
            "period" | "p" => Ok(Self::Period),
            "power" | "pow" => Ok(Self::Power),
            "amplitude" | "amp" | "semi_amplitude" => Ok(Self::Amplitude),
            _ => Err(PeriodError::invalid_parameter(
                "coordinate",
                s,
                "expected frequency, period, power or amplitude",
            )),
        }
    }
}

/// Four same-length coordinate lists, in evaluation order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PeriodAnalysisSeries {
    frequency: Vec<f64>,
    period: Vec<f64>,
    power: Vec<f64>,
    amplitude: Vec<f64>,
}

impl PeriodAnalysisSeries {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, point: PeriodAnalysisDataPoint) {
        self.frequency.push(point.frequency);
        self.period.push(point.period);
        self.power.push(point.power);
        self.amplitude.push(point.amplitude);
    }

    pub fn len(&self) -> usize {
        self.frequency.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frequency.is_empty()
    }

    /// All values of one coordinate.
    pub fn get(&self, coordinate: Coordinate) -> &[f64] {
        match coordinate {
            Coordinate::Frequency => &self.frequency,
            Coordinate::Period => &self.period,
            Coordinate::Power => &self.power,
            Coordinate::Amplitude => &self.amplitude,
        }
    }

    pub fn point(&self, index: usize) -> Option<PeriodAnalysisDataPoint> {
        if index >= self.len() {
            return None;
        }
        Some(PeriodAnalysisDataPoint::new(
            self.frequency[index],
            self.period[index],
            self.power[index],
            self.amplitude[index],
        ))
    }

    pub fn points(&self) -> impl Iterator<Item = PeriodAnalysisDataPoint> + '_ {
        (0..self.len()).filter_map(move |i| self.point(i))
    }
}

/// Fixed-capacity table of points sorted by descending power.
#[derive(Debug, Clone, PartialEq)]
pub struct TopHits {
    capacity: usize,
    entries: Vec<PeriodAnalysisDataPoint>,
}

impl Default for TopHits {
    fn default() -> Self {
        Self::new(DEFAULT_TOP_HITS)
    }
}

impl TopHits {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            entries: Vec::with_capacity(capacity),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Entries, highest power first.
    pub fn entries(&self) -> &[PeriodAnalysisDataPoint] {
        &self.entries
    }

    pub fn best(&self) -> Option<&PeriodAnalysisDataPoint> {
        self.entries.first()
    }

    pub fn into_vec(self) -> Vec<PeriodAnalysisDataPoint> {
        self.entries
    }

    /// Offer a point to the table.
    ///
    /// The point goes before the first entry of lower power, shifting the
    /// rest down and dropping whatever falls off the end. With no lower entry
    /// it is appended if there is room and its power is positive.
    ///
    /// # Returns
    /// Whether the point was retained.
    pub fn insert(&mut self, point: PeriodAnalysisDataPoint) -> bool {
        if self.capacity == 0 || point.power.is_nan() {
            return false;
        }
        match self.entries.iter().position(|e| point.power > e.power) {
            Some(pos) => {
                self.entries.insert(pos, point);
                self.entries.truncate(self.capacity);
                true
            }
            None if self.entries.len() < self.capacity && point.power > 0.0 => {
                self.entries.push(point);
                true
            }
            None => false,
        }
    }

    /// Insert a point even if its power would not earn it a place, evicting
    /// the lowest entry of a full table.
    pub fn force_insert(&mut self, point: PeriodAnalysisDataPoint) {
        if self.capacity == 0 {
            return;
        }
        if self.entries.len() == self.capacity {
            self.entries.pop();
        }
        let pos = self
            .entries
            .iter()
            .position(|e| point.power > e.power)
            .unwrap_or(self.entries.len());
        self.entries.insert(pos, point);
    }

    /// Offer every point of `points` in order.
    ///
    /// # Returns
    /// Number of points retained at the time they were offered.
    pub fn merge<I>(&mut self, points: I) -> usize
    where
        I: IntoIterator<Item = PeriodAnalysisDataPoint>,
    {
        points.into_iter().filter(|p| self.insert(*p)).count()
    }

    /// Position of the entry whose frequency matches within `tolerance`.
    pub fn find_frequency(&self, frequency: f64, tolerance: f64) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| (e.frequency - frequency).abs() <= tolerance)
    }
}

/// Slope of the power curve as seen by the [`TopHitTracker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SlopeState {
    #[default]
    Rising,
    Falling,
}

/// Detects local power maxima in a stream of points.
///
/// When a point's power drops below its predecessor's while the curve was
/// rising, the predecessor is an apex and is offered to the table.
#[derive(Debug, Clone, Default)]
pub struct TopHitTracker {
    state: SlopeState,
    previous: Option<PeriodAnalysisDataPoint>,
}

impl TopHitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> SlopeState {
        self.state
    }

    /// Feed the next point.
    ///
    /// # Returns
    /// The apex offered to `hits`, if any.
    pub fn observe(
        &mut self,
        point: PeriodAnalysisDataPoint,
        hits: &mut TopHits,
    ) -> Option<PeriodAnalysisDataPoint> {
        let mut apex = None;
        if let Some(previous) = self.previous {
            if point.power < previous.power {
                if self.state == SlopeState::Rising {
                    hits.insert(previous);
                    apex = Some(previous);
                }
                self.state = SlopeState::Falling;
            } else {
                self.state = SlopeState::Rising;
            }
        }
        self.previous = Some(point);
        apex
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn point(frequency: f64, power: f64) -> PeriodAnalysisDataPoint {
        PeriodAnalysisDataPoint::from_frequency(frequency, power, 1.0)
    }

    #[test]
    fn test_insert_keeps_descending_order() {
        let mut hits = TopHits::new(3);
        assert!(hits.insert(point(1.0, 5.0)));
        assert!(hits.insert(point(2.0, 7.0)));
        assert!(hits.insert(point(3.0, 6.0)));
        let powers: Vec<f64> = hits.entries().iter().map(|p| p.power).collect();
        assert_eq!(powers, vec![7.0, 6.0, 5.0]);

        // full: a lower point is rejected, a higher one evicts the lowest
        assert!(!hits.insert(point(4.0, 1.0)));
        assert!(hits.insert(point(5.0, 6.5)));
        let powers: Vec<f64> = hits.entries().iter().map(|p| p.power).collect();
        assert_eq!(powers, vec![7.0, 6.5, 6.0]);
        assert_eq!(hits.best().unwrap().frequency, 2.0);
    }

    #[test]
    fn test_insert_rejects_non_positive_and_nan() {
        let mut hits = TopHits::default();
        assert_eq!(hits.capacity(), DEFAULT_TOP_HITS);
        assert!(!hits.insert(point(1.0, 0.0)));
        assert!(!hits.insert(point(1.0, f64::NAN)));
        assert!(hits.is_empty());

        let mut none = TopHits::new(0);
        assert!(!none.insert(point(1.0, 3.0)));
    }

    #[test]
    fn test_equal_power_goes_after_existing() {
        let mut hits = TopHits::new(5);
        hits.insert(point(1.0, 5.0));
        hits.insert(point(2.0, 5.0));
        assert_eq!(hits.entries()[0].frequency, 1.0);
        assert_eq!(hits.entries()[1].frequency, 2.0);
    }

    #[test]
    fn test_force_insert() {
        let mut hits = TopHits::new(2);
        hits.insert(point(1.0, 5.0));
        hits.insert(point(2.0, 4.0));
        hits.force_insert(point(3.0, 0.0));
        assert_eq!(hits.len(), 2);
        assert_eq!(hits.entries()[1].frequency, 3.0);
    }

    #[test]
    fn test_merge_and_find() {
        let mut hits = TopHits::new(3);
        hits.insert(point(0.1, 10.0));
        let merged = hits.merge(vec![point(0.2, 12.0), point(0.3, 1.0), point(0.4, 0.0)]);
        assert_eq!(merged, 2);
        assert_eq!(hits.len(), 3);
        assert_eq!(hits.find_frequency(0.2, 1e-9), Some(0));
        assert_eq!(hits.find_frequency(0.25, 1e-9), None);
    }

    #[test]
    fn test_tracker_finds_apexes() {
        let powers = [1.0, 3.0, 2.0, 2.0, 4.0, 5.0, 1.0, 0.5];
        let mut hits = TopHits::new(10);
        let mut tracker = TopHitTracker::new();
        let mut apexes = Vec::new();
        for (i, &p) in powers.iter().enumerate() {
            if let Some(apex) = tracker.observe(point(i as f64 + 1.0, p), &mut hits) {
                apexes.push(apex.power);
            }
        }
        assert_eq!(apexes, vec![3.0, 5.0]);
        assert_eq!(hits.entries()[0].power, 5.0);
        assert_eq!(tracker.state(), SlopeState::Falling);
    }

    #[test]
    fn test_tracker_plateau_then_drop() {
        // equal powers keep the curve rising, so the last plateau point is the apex
        let mut hits = TopHits::new(10);
        let mut tracker = TopHitTracker::new();
        for (i, &p) in [2.0, 2.0, 1.0].iter().enumerate() {
            tracker.observe(point(i as f64 + 1.0, p), &mut hits);
        }
        assert_eq!(hits.len(), 1);
        assert_eq!(hits.entries()[0].frequency, 2.0);
    }

    #[test]
    fn test_coordinate_parsing() {
        assert_eq!("Frequency".parse::<Coordinate>().unwrap(), Coordinate::Frequency);
        assert_eq!("amp".parse::<Coordinate>().unwrap(), Coordinate::Amplitude);
        assert!("phase".parse::<Coordinate>().is_err());
        assert_eq!(Coordinate::Period.to_string(), "period");
    }

    #[test]
    fn test_series_accessors() {
        let mut series = PeriodAnalysisSeries::new();
        series.push(point(0.5, 3.0));
        series.push(point(0.25, 4.0));
        assert_eq!(series.len(), 2);
        assert_eq!(series.get(Coordinate::Period), &[2.0, 4.0]);
        assert_eq!(series.point(1).unwrap().power, 4.0);
        assert!(series.point(2).is_none());
        for c in Coordinate::ALL {
            assert_eq!(series.get(c).len(), 2);
        }
    }

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(128))]

        #[test]
        fn prop_table_sorted_and_bounded(
            powers in prop::collection::vec(0.0f64..100.0, 0..80),
            capacity in 1usize..25
        ) {
            let mut hits = TopHits::new(capacity);
            for (i, &p) in powers.iter().enumerate() {
                hits.insert(point(i as f64, p));
            }
            prop_assert!(hits.len() <= capacity);
            prop_assert!(hits.entries().windows(2).all(|w| w[0].power >= w[1].power));

            // the table holds the largest positive powers offered
            let mut positive: Vec<f64> = powers.iter().copied().filter(|&p| p > 0.0).collect();
            positive.sort_by(|a, b| b.total_cmp(a));
            positive.truncate(capacity);
            let kept: Vec<f64> = hits.entries().iter().map(|p| p.power).collect();
            prop_assert_eq!(kept, positive);
        }

        #[test]
        fn prop_tracker_apexes_are_local_maxima(
            powers in prop::collection::vec(0.0f64..10.0, 2..60)
        ) {
            let mut hits = TopHits::new(100);
            let mut tracker = TopHitTracker::new();
            for (i, &p) in powers.iter().enumerate() {
                if let Some(apex) = tracker.observe(point(i as f64, p), &mut hits) {
                    let idx = apex.frequency as usize;
                    prop_assert!(powers[idx + 1] < powers[idx]);
                    if idx > 0 {
                        prop_assert!(powers[idx - 1] <= powers[idx]);
                    }
                }
            }
        }
    }
}
