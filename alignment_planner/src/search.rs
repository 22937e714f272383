//! Alignment search engine.
//!
//! For every date in a request, plus the day before the first, and every
//! body in the scene filter the engine resolves the body's rise/set window
//! at the landmark, samples the window at the mode's time step, refines the
//! samples whose azimuth comes closest to the observer→landmark bearing, and
//! classifies what survives. Events are reported on their own local date.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, NaiveDate, NaiveTime, Utc};
use log::{debug, info};

use crate::celestial::{CelestialProvider, HorizontalPosition, RiseSet};
use crate::classify::{accuracy_for_deviation, quality_score};
use crate::geometry::{bearing, circular_difference, distance, elevation_angle};
use crate::{
    AlignmentEvent, AlignmentPlannerError, AlignmentPlannerResult, Body, DateRange, EventSubtype,
    Landmark, LocationId, Observer, SearchMetadata, SearchMode, SearchRequest, SearchResult,
};

/// Largest span (days) a precise search may cover.
pub const PRECISE_MAX_SPAN_DAYS: i64 = 90;
/// `auto` picks precise up to this many days...
pub const AUTO_PRECISE_MAX_DAYS: i64 = 7;
/// ...balanced up to this many, and fast beyond.
pub const AUTO_BALANCED_MAX_DAYS: i64 = 366;
/// Observers closer than this to the landmark have no usable bearing.
const MIN_SIGHT_DISTANCE_M: f64 = 1.0;

/// Time resolution and tolerances of one search mode.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SearchModeConfig {
    /// Concrete mode (never `Auto`)
    pub mode: SearchMode,
    /// Sampling step across the rise/set window
    pub step: Duration,
    /// Refinement stops once the bracket is this narrow
    pub refine_resolution: Duration,
    /// Samples further off than this (degrees) are not refined
    pub coarse_bound: f64,
    /// Refined deviations beyond this (degrees) are dropped
    pub tolerance: f64,
    /// Maximum request span in days, if capped
    pub max_span_days: Option<i64>,
}

impl SearchModeConfig {
    /// Configuration of a concrete mode. `Auto` maps to balanced; use
    /// [`resolve_mode`] to pick according to the request span.
    pub fn for_mode(mode: SearchMode) -> Self {
        match mode {
            SearchMode::Fast => Self {
                mode,
                step: Duration::minutes(5),
                refine_resolution: Duration::seconds(15),
                coarse_bound: 3.0,
                tolerance: 1.0,
                max_span_days: None,
            },
            SearchMode::Balanced | SearchMode::Auto => Self {
                mode: SearchMode::Balanced,
                step: Duration::minutes(1),
                refine_resolution: Duration::seconds(5),
                coarse_bound: 2.0,
                tolerance: 1.0,
                max_span_days: None,
            },
            SearchMode::Precise => Self {
                mode,
                step: Duration::seconds(10),
                refine_resolution: Duration::seconds(1),
                coarse_bound: 1.5,
                tolerance: 0.5,
                max_span_days: Some(PRECISE_MAX_SPAN_DAYS),
            },
        }
    }
}

/// Picks the concrete configuration for `mode` over `span_days`, rejecting
/// spans beyond the mode's cap.
pub fn resolve_mode(mode: SearchMode, span_days: i64) -> AlignmentPlannerResult<SearchModeConfig> {
    let resolved = match mode {
        SearchMode::Auto if span_days <= AUTO_PRECISE_MAX_DAYS => SearchMode::Precise,
        SearchMode::Auto if span_days <= AUTO_BALANCED_MAX_DAYS => SearchMode::Balanced,
        SearchMode::Auto => SearchMode::Fast,
        other => other,
    };
    let config = SearchModeConfig::for_mode(resolved);
    if let Some(max_days) = config.max_span_days {
        if span_days > max_days {
            return Err(AlignmentPlannerError::RangeTooLarge {
                mode: resolved,
                requested_days: span_days,
                max_days,
            });
        }
    }
    Ok(config)
}

/// Cooperative cancellation shared between a caller and a running search.
#[derive(Debug, Clone, Default)]
pub struct CancelFlag(Arc<AtomicBool>);

impl CancelFlag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Observer→landmark line of sight.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SightLine {
    /// Bearing from the observer to the landmark (degrees)
    pub bearing: f64,
    pub distance_m: f64,
    /// Apparent elevation of the apex above the observer's horizon (degrees)
    pub apex_elevation: f64,
}

/// Result of scanning one body on one date.
#[derive(Debug, Clone, PartialEq)]
pub enum DayOutcome {
    /// The body does not rise that day
    NoWindow,
    /// The body never came within tolerance; carries the best deviation seen
    ToleranceNotMet { best_deviation: f64 },
    Found(Vec<AlignmentEvent>),
}

/// One sample of the coarse scan.
#[derive(Debug, Clone, Copy)]
struct Sample {
    time: DateTime<Utc>,
    /// Signed azimuth - bearing, [-180, 180)
    deviation: f64,
}

/// Stateless alignment search over an injected celestial provider.
pub struct AlignmentEngine {
    provider: Arc<dyn CelestialProvider>,
    landmark: Landmark,
    utc_offset: FixedOffset,
}

impl AlignmentEngine {
    /// # Arguments
    /// * `provider` - Source of sun/moon positions
    /// * `landmark` - Alignment reference (coordinates and apex height)
    /// * `utc_offset` - Offset of the local calendar used for dates
    pub fn new(
        provider: Arc<dyn CelestialProvider>,
        landmark: Landmark,
        utc_offset: FixedOffset,
    ) -> Self {
        Self {
            provider,
            landmark,
            utc_offset,
        }
    }

    pub fn landmark(&self) -> &Landmark {
        &self.landmark
    }

    pub fn provider(&self) -> &dyn CelestialProvider {
        self.provider.as_ref()
    }

    pub fn utc_offset(&self) -> FixedOffset {
        self.utc_offset
    }

    /// Local midnight of `date`, as a UTC instant.
    pub fn day_start(&self, date: NaiveDate) -> DateTime<Utc> {
        let midnight = date.and_time(NaiveTime::default());
        midnight.and_utc() - Duration::seconds(self.utc_offset.local_minus_utc() as i64)
    }

    /// Calendar date of `time` in the local calendar.
    pub fn local_date(&self, time: DateTime<Utc>) -> NaiveDate {
        time.with_timezone(&self.utc_offset).date_naive()
    }

    /// Bearing, distance and apex elevation from `observer` to the landmark.
    ///
    /// # Errors
    /// `GeometryError` for invalid coordinates, `InvalidInput` when the
    /// observer stands on the landmark itself.
    pub fn sight_line(&self, observer: &Observer) -> AlignmentPlannerResult<SightLine> {
        let from = observer.point();
        from.validate()?;
        if !observer.elevation.is_finite() {
            return Err(AlignmentPlannerError::GeometryError(
                "observer elevation is not finite".to_string(),
            ));
        }
        let to = self.landmark.point();
        let distance_m = distance(from, to);
        if distance_m < MIN_SIGHT_DISTANCE_M {
            return Err(AlignmentPlannerError::InvalidInput(
                "observer is standing on the landmark".to_string(),
            ));
        }
        Ok(SightLine {
            bearing: bearing(from, to),
            distance_m,
            apex_elevation: elevation_angle(self.landmark.apex_height - observer.elevation, distance_m),
        })
    }

    /// Validates a request and resolves its mode without touching the provider.
    pub fn prepare(&self, request: &SearchRequest) -> AlignmentPlannerResult<(SearchModeConfig, SightLine)> {
        if request.end_date < request.start_date {
            return Err(AlignmentPlannerError::InvalidInput(format!(
                "end date {} is before start date {}",
                request.end_date, request.start_date
            )));
        }
        let sight = self.sight_line(&request.observer)?;
        let config = resolve_mode(request.mode, request.range().span_days())?;
        Ok((config, sight))
    }

    /// Runs a full search.
    ///
    /// Each date's window is scanned together with the previous date's, so
    /// an event after local midnight is reported on its own local date.
    ///
    /// # Returns
    /// All events whose local date lies in the request range, sorted by time, truncated to
    /// `request.limit` if set, with metadata describing the run.
    ///
    /// # Errors
    /// Validation errors (`InvalidInput`, `GeometryError`, `RangeTooLarge`)
    /// are raised before any provider call. Provider failures abort the search.
    /// `Cancelled` is returned as soon as `cancel` is observed.
    pub fn search(
        &self,
        request: &SearchRequest,
        cancel: &CancelFlag,
    ) -> AlignmentPlannerResult<SearchResult> {
        let (config, sight) = self.prepare(request)?;
        let started = std::time::Instant::now();

        let range = request.range();
        // A window rising the evening before can set after local midnight
        let scanned = DateRange::new(range.start - Duration::days(1), range.end);

        let mut events = Vec::new();
        for date in scanned.days() {
            if cancel.is_cancelled() {
                return Err(AlignmentPlannerError::Cancelled(format!(
                    "search cancelled at {date}"
                )));
            }
            for &body in request.scene.bodies() {
                match self.search_day(&request.observer, &sight, request.location_id, body, date, &config)? {
                    DayOutcome::Found(found) => events.extend(
                        found
                            .into_iter()
                            .filter(|e| range.contains(self.local_date(e.time))),
                    ),
                    DayOutcome::NoWindow => debug!("{body} on {date}: no rise/set window"),
                    DayOutcome::ToleranceNotMet { best_deviation } => debug!(
                        "{body} on {date}: best deviation {best_deviation:.3}° outside tolerance"
                    ),
                }
            }
        }
        events.sort_by_key(|e| e.time);
        events.dedup_by(|later, earlier| {
            later.kind == earlier.kind && (later.time - earlier.time).abs() < config.step
        });

        let original_total = events.len();
        let is_limited = matches!(request.limit, Some(limit) if limit < original_total);
        if let Some(limit) = request.limit {
            events.truncate(limit);
        }

        info!(
            "{} search {}..{} ({}): {} events in {:?}",
            config.mode,
            request.start_date,
            request.end_date,
            request.scene,
            original_total,
            started.elapsed()
        );

        Ok(SearchResult {
            metadata: SearchMetadata {
                total_events: events.len(),
                search_interval_seconds: config.step.num_seconds(),
                is_limited,
                original_total,
                resolved_mode: config.mode,
                landmark_bearing: sight.bearing,
                landmark_distance_km: sight.distance_m / 1000.0,
                landmark_elevation: sight.apex_elevation,
            },
            events,
        })
    }

    /// Scans one body on one date.
    pub fn search_day(
        &self,
        observer: &Observer,
        sight: &SightLine,
        location_id: Option<LocationId>,
        body: Body,
        date: NaiveDate,
        config: &SearchModeConfig,
    ) -> AlignmentPlannerResult<DayOutcome> {
        // The window is taken at the landmark: that is where the observer looks
        let Some(window) = self.provider.rise_set(
            body,
            &self.landmark.standing_point(),
            self.day_start(date),
        )?
        else {
            return Ok(DayOutcome::NoWindow);
        };

        let samples = self.scan_window(body, observer, sight.bearing, &window, config.step)?;
        let best_deviation = samples
            .iter()
            .map(|s| s.deviation.abs())
            .fold(f64::INFINITY, f64::min);

        let mut events: Vec<AlignmentEvent> = Vec::new();
        for candidate in local_minima(&samples, config.coarse_bound) {
            let (time, position, deviation) =
                self.refine(body, observer, sight.bearing, candidate, &window, config)?;
            if deviation.abs() > config.tolerance {
                continue;
            }
            // Neighbouring minima can converge on the same moment
            if events.iter().any(|e| (e.time - time).abs() < config.step) {
                continue;
            }
            if let Some(event) =
                self.classify(body, location_id, &window, time, position, deviation)?
            {
                events.push(event);
            }
        }

        if events.is_empty() {
            return Ok(DayOutcome::ToleranceNotMet { best_deviation });
        }
        events.sort_by_key(|e| e.time);
        Ok(DayOutcome::Found(events))
    }

    fn deviation_at(
        &self,
        body: Body,
        observer: &Observer,
        target_bearing: f64,
        time: DateTime<Utc>,
    ) -> AlignmentPlannerResult<(HorizontalPosition, f64)> {
        let position = self.provider.position_at(body, time, observer)?;
        Ok((position, circular_difference(position.azimuth, target_bearing)))
    }

    /// Samples the window at `step`, always including both ends.
    fn scan_window(
        &self,
        body: Body,
        observer: &Observer,
        target_bearing: f64,
        window: &RiseSet,
        step: Duration,
    ) -> AlignmentPlannerResult<Vec<Sample>> {
        let mut samples = Vec::new();
        let mut current = window.rise;
        loop {
            let (_, deviation) = self.deviation_at(body, observer, target_bearing, current)?;
            samples.push(Sample {
                time: current,
                deviation,
            });
            if current >= window.set {
                break;
            }
            current = (current + step).min(window.set);
        }
        Ok(samples)
    }

    /// Narrows the match around a coarse sample.
    ///
    /// A sign change in the bracket is bisected; otherwise the absolute
    /// deviation is minimised by golden-section search.
    fn refine(
        &self,
        body: Body,
        observer: &Observer,
        target_bearing: f64,
        candidate: Sample,
        window: &RiseSet,
        config: &SearchModeConfig,
    ) -> AlignmentPlannerResult<(DateTime<Utc>, HorizontalPosition, f64)> {
        let mut low = (candidate.time - config.step).max(window.rise);
        let mut high = (candidate.time + config.step).min(window.set);

        let (_, mut dev_low) = self.deviation_at(body, observer, target_bearing, low)?;
        let (_, dev_high) = self.deviation_at(body, observer, target_bearing, high)?;

        let crosses = dev_low.signum() != dev_high.signum()
            && dev_low.abs() < 90.0
            && dev_high.abs() < 90.0;

        if crosses {
            while high - low > config.refine_resolution {
                let mid = low + (high - low) / 2;
                let (_, dev_mid) = self.deviation_at(body, observer, target_bearing, mid)?;
                if dev_mid.signum() == dev_low.signum() {
                    low = mid;
                    dev_low = dev_mid;
                } else {
                    high = mid;
                }
            }
        } else {
            let phi = (1.0 + 5.0_f64.sqrt()) / 2.0;
            let max_iterations = 60;
            let mut iterations = 0;
            while high - low > config.refine_resolution && iterations < max_iterations {
                iterations += 1;
                let span = (high - low).num_milliseconds() as f64;
                let c = high - Duration::milliseconds((span / phi) as i64);
                let d = low + Duration::milliseconds((span / phi) as i64);
                let (_, dev_c) = self.deviation_at(body, observer, target_bearing, c)?;
                let (_, dev_d) = self.deviation_at(body, observer, target_bearing, d)?;
                if dev_c.abs() < dev_d.abs() {
                    high = d;
                } else {
                    low = c;
                }
            }
        }

        // Best of the bracket ends and the original sample
        let mut best = (candidate.time, candidate.deviation);
        for time in [low, high, low + (high - low) / 2] {
            let (_, deviation) = self.deviation_at(body, observer, target_bearing, time)?;
            if deviation.abs() < best.1.abs() {
                best = (time, deviation);
            }
        }
        let (position, deviation) = self.deviation_at(body, observer, target_bearing, best.0)?;
        Ok((best.0, position, deviation))
    }

    /// Turns a refined match into an event, or `None` beyond the outer tier.
    fn classify(
        &self,
        body: Body,
        location_id: Option<LocationId>,
        window: &RiseSet,
        time: DateTime<Utc>,
        position: HorizontalPosition,
        deviation: f64,
    ) -> AlignmentPlannerResult<Option<AlignmentEvent>> {
        let Some(accuracy) = accuracy_for_deviation(deviation) else {
            return Ok(None);
        };
        let kind = body.event_kind();
        let rising = window.elapsed_fraction(time) < 0.5;

        let (moon_phase, moon_illumination) = match body {
            Body::Moon => {
                let phase = self.provider.moon_phase(time)?;
                (Some(phase.phase), Some(phase.illumination))
            }
            Body::Sun => (None, None),
        };

        let location = location_id
            .map(|id| id.to_string())
            .unwrap_or_else(|| "adhoc".to_string());

        Ok(Some(AlignmentEvent {
            id: format!("{kind}-{location}-{}", time.format("%Y%m%dT%H%M%S")),
            location_id,
            kind,
            subtype: EventSubtype::for_phase(body, rising),
            time,
            azimuth: position.azimuth,
            altitude: position.altitude,
            azimuth_deviation: deviation.abs(),
            accuracy,
            quality: quality_score(kind, deviation, position.altitude, moon_illumination),
            moon_phase,
            moon_illumination,
        }))
    }
}

/// Samples whose absolute deviation is a local minimum within `bound`.
fn local_minima(samples: &[Sample], bound: f64) -> Vec<Sample> {
    let mut minima = Vec::new();
    for (i, sample) in samples.iter().enumerate() {
        let here = sample.deviation.abs();
        if here > bound {
            continue;
        }
        let left = if i > 0 {
            samples[i - 1].deviation.abs()
        } else {
            f64::INFINITY
        };
        let right = samples
            .get(i + 1)
            .map(|s| s.deviation.abs())
            .unwrap_or(f64::INFINITY);
        if here < left && here <= right {
            minima.push(*sample);
        }
    }
    minima
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::celestial::MoonPhase;
    use crate::geometry::{destination_point, normalize_degrees};
    use crate::{Accuracy, EventKind, SceneFilter};
    use approx::assert_abs_diff_eq;
    use chrono::{TimeZone, Timelike};
    use std::sync::atomic::AtomicUsize;

    /// Deterministic sky: each body sweeps azimuth linearly from `start_azimuth`
    /// at `rate` degrees per minute between 06:00 and 18:00 UTC.
    pub(crate) struct LinearSky {
        pub start_azimuth: f64,
        pub rate: f64,
        pub moon_offset: f64,
        pub calls: AtomicUsize,
    }

    impl LinearSky {
        pub(crate) fn new(start_azimuth: f64, rate: f64) -> Self {
            Self {
                start_azimuth,
                rate,
                moon_offset: 0.0,
                calls: AtomicUsize::new(0),
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }

        fn window_for(time: DateTime<Utc>) -> RiseSet {
            let day = time.date_naive().and_time(NaiveTime::default()).and_utc();
            RiseSet {
                rise: day + Duration::hours(6),
                set: day + Duration::hours(18),
            }
        }
    }

    impl CelestialProvider for LinearSky {
        fn position_at(
            &self,
            body: Body,
            time: DateTime<Utc>,
            _observer: &Observer,
        ) -> AlignmentPlannerResult<HorizontalPosition> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let window = Self::window_for(time);
            let minutes = (time - window.rise).num_milliseconds() as f64 / 60_000.0;
            let offset = match body {
                Body::Sun => 0.0,
                Body::Moon => self.moon_offset,
            };
            Ok(HorizontalPosition {
                azimuth: normalize_degrees(self.start_azimuth + offset + self.rate * minutes),
                altitude: 5.0,
            })
        }

        fn rise_set(
            &self,
            _body: Body,
            _observer: &Observer,
            day_start: DateTime<Utc>,
        ) -> AlignmentPlannerResult<Option<RiseSet>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Some(Self::window_for(day_start)))
        }

        fn moon_phase(&self, _time: DateTime<Utc>) -> AlignmentPlannerResult<MoonPhase> {
            Ok(MoonPhase {
                phase: 180.0,
                illumination: 1.0,
            })
        }
    }

    /// Night sky: the sun never clears the horizon and the moon is up from
    /// 20:00 to 08:00 UTC the next morning, sweeping 150 -> 330 at 0.25
    /// deg/min, so it crosses the ~270 bearing at about 04:00.
    pub(crate) struct NightMoonSky;

    impl NightMoonSky {
        fn rise_before(time: DateTime<Utc>) -> DateTime<Utc> {
            let evening = (time - Duration::hours(20)).date_naive();
            evening.and_time(NaiveTime::default()).and_utc() + Duration::hours(20)
        }
    }

    impl CelestialProvider for NightMoonSky {
        fn position_at(
            &self,
            _body: Body,
            time: DateTime<Utc>,
            _observer: &Observer,
        ) -> AlignmentPlannerResult<HorizontalPosition> {
            let minutes = (time - Self::rise_before(time)).num_milliseconds() as f64 / 60_000.0;
            Ok(HorizontalPosition {
                azimuth: normalize_degrees(150.0 + 0.25 * minutes),
                altitude: 10.0,
            })
        }

        fn rise_set(
            &self,
            body: Body,
            _observer: &Observer,
            day_start: DateTime<Utc>,
        ) -> AlignmentPlannerResult<Option<RiseSet>> {
            Ok(match body {
                Body::Sun => None,
                Body::Moon => Some(RiseSet {
                    rise: day_start + Duration::hours(20),
                    set: day_start + Duration::hours(32),
                }),
            })
        }

        fn moon_phase(&self, _time: DateTime<Utc>) -> AlignmentPlannerResult<MoonPhase> {
            Ok(MoonPhase {
                phase: 200.0,
                illumination: 0.9,
            })
        }
    }

    struct NoWindowSky;

    impl CelestialProvider for NoWindowSky {
        fn position_at(
            &self,
            _body: Body,
            _time: DateTime<Utc>,
            _observer: &Observer,
        ) -> AlignmentPlannerResult<HorizontalPosition> {
            Err(AlignmentPlannerError::ProviderError("unused".to_string()))
        }

        fn rise_set(
            &self,
            _body: Body,
            _observer: &Observer,
            _day_start: DateTime<Utc>,
        ) -> AlignmentPlannerResult<Option<RiseSet>> {
            Ok(None)
        }

        fn moon_phase(&self, _time: DateTime<Utc>) -> AlignmentPlannerResult<MoonPhase> {
            Err(AlignmentPlannerError::ProviderError("unused".to_string()))
        }
    }

    /// Observer 60 km due east of the landmark, looking west (bearing ~270).
    pub(crate) fn east_observer() -> Observer {
        let p = destination_point(Landmark::default().point(), 90.0, 60_000.0);
        Observer::new(p.latitude, p.longitude, 50.0)
    }

    pub(crate) fn engine_with(provider: Arc<dyn CelestialProvider>) -> AlignmentEngine {
        AlignmentEngine::new(provider, Landmark::default(), FixedOffset::east_opt(0).unwrap())
    }

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_resolve_mode() {
        assert_eq!(resolve_mode(SearchMode::Auto, 1).unwrap().mode, SearchMode::Precise);
        assert_eq!(resolve_mode(SearchMode::Auto, 30).unwrap().mode, SearchMode::Balanced);
        assert_eq!(resolve_mode(SearchMode::Auto, 400).unwrap().mode, SearchMode::Fast);
        assert!(resolve_mode(SearchMode::Precise, 90).is_ok());
        assert!(resolve_mode(SearchMode::Fast, 3650).is_ok());
        assert_eq!(
            resolve_mode(SearchMode::Precise, 91),
            Err(AlignmentPlannerError::RangeTooLarge {
                mode: SearchMode::Precise,
                requested_days: 91,
                max_days: 90,
            })
        );
    }

    #[test]
    fn test_finds_sunset_alignment() {
        // Sweeps 180 -> 360 over 12h: crosses the ~270 bearing at about 12:00
        let sky = Arc::new(LinearSky::new(180.0, 0.25));
        let engine = engine_with(sky.clone());
        let request = SearchRequest::new(east_observer(), date(2025, 5, 1), date(2025, 5, 3))
            .with_scene(SceneFilter::Diamond)
            .with_mode(SearchMode::Balanced);

        let result = engine.search(&request, &CancelFlag::new()).unwrap();
        assert_eq!(result.events.len(), 3);
        assert_eq!(result.metadata.resolved_mode, SearchMode::Balanced);
        assert_eq!(result.metadata.search_interval_seconds, 60);
        assert!(!result.metadata.is_limited);

        let bearing = result.metadata.landmark_bearing;
        for event in &result.events {
            assert_eq!(event.kind, EventKind::Diamond);
            assert!(event.azimuth_deviation <= 0.05, "{event:?}");
            assert_eq!(event.accuracy, Accuracy::Perfect);
            assert_abs_diff_eq!(
                circular_difference(event.azimuth, bearing),
                0.0,
                epsilon = 0.05
            );
            assert!((0.0..360.0).contains(&event.azimuth));
            assert!(event.moon_phase.is_none());
        }
        assert!(result.events.windows(2).all(|w| w[0].time < w[1].time));
    }

    #[test]
    fn test_subtype_follows_window_phase() {
        // Crossing ~2h after rise: rising phase
        let early = Arc::new(LinearSky::new(240.0, 0.25));
        let engine = engine_with(early);
        let request = SearchRequest::new(east_observer(), date(2025, 5, 1), date(2025, 5, 1))
            .with_mode(SearchMode::Fast);
        let result = engine.search(&request, &CancelFlag::new()).unwrap();
        assert!(!result.events.is_empty());
        for event in &result.events {
            assert!(event.time.hour() < 12);
            assert!(matches!(
                event.subtype,
                EventSubtype::Sunrise | EventSubtype::Rising
            ));
        }
    }

    #[test]
    fn test_pearl_events_carry_phase() {
        let mut sky = LinearSky::new(180.0, 0.25);
        sky.moon_offset = 10.0;
        let engine = engine_with(Arc::new(sky));
        let request = SearchRequest::new(east_observer(), date(2025, 5, 1), date(2025, 5, 1))
            .with_scene(SceneFilter::All)
            .with_mode(SearchMode::Balanced);
        let result = engine.search(&request, &CancelFlag::new()).unwrap();

        assert_eq!(result.events.len(), 2);
        let pearl = result
            .events
            .iter()
            .find(|e| e.kind == EventKind::Pearl)
            .unwrap();
        assert_eq!(pearl.moon_illumination, Some(1.0));
        assert_eq!(pearl.moon_phase, Some(180.0));
        // Moon runs 10 degrees ahead, so it aligns 40 minutes earlier
        let diamond = result
            .events
            .iter()
            .find(|e| e.kind == EventKind::Diamond)
            .unwrap();
        assert!(pearl.time < diamond.time);
        assert_eq!(result.events[0].kind, EventKind::Pearl);
    }

    #[test]
    fn test_out_of_reach_bearing_yields_nothing() {
        // Sweeps 0 -> 90 only; the landmark lies to the west
        let engine = engine_with(Arc::new(LinearSky::new(0.0, 0.125)));
        let request = SearchRequest::new(east_observer(), date(2025, 5, 1), date(2025, 5, 2));
        let result = engine.search(&request, &CancelFlag::new()).unwrap();
        assert!(result.events.is_empty());
        assert_eq!(result.metadata.original_total, 0);
    }

    #[test]
    fn test_tolerance_not_met_reports_best_deviation() {
        let engine = engine_with(Arc::new(LinearSky::new(0.0, 0.125)));
        let observer = east_observer();
        let sight = engine.sight_line(&observer).unwrap();
        let config = SearchModeConfig::for_mode(SearchMode::Fast);
        let outcome = engine
            .search_day(&observer, &sight, None, Body::Sun, date(2025, 5, 1), &config)
            .unwrap();
        match outcome {
            DayOutcome::ToleranceNotMet { best_deviation } => assert!(best_deviation > 45.0),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_missing_window_yields_no_events() {
        let engine = engine_with(Arc::new(NoWindowSky));
        let observer = east_observer();
        let sight = engine.sight_line(&observer).unwrap();
        let config = SearchModeConfig::for_mode(SearchMode::Precise);
        let outcome = engine
            .search_day(&observer, &sight, None, Body::Moon, date(2025, 5, 1), &config)
            .unwrap();
        assert_eq!(outcome, DayOutcome::NoWindow);
    }

    #[test]
    fn test_precise_range_rejected_without_provider_calls() {
        let sky = Arc::new(LinearSky::new(180.0, 0.25));
        let engine = engine_with(sky.clone());
        let request = SearchRequest::new(east_observer(), date(2025, 1, 1), date(2025, 6, 30))
            .with_mode(SearchMode::Precise);
        let err = engine.search(&request, &CancelFlag::new()).unwrap_err();
        assert!(matches!(err, AlignmentPlannerError::RangeTooLarge { .. }));
        assert_eq!(sky.calls(), 0);
    }

    #[test]
    fn test_event_after_midnight_belongs_to_its_own_date() {
        let engine = engine_with(Arc::new(NightMoonSky));
        let pearls = |start: NaiveDate, end: NaiveDate| {
            let request = SearchRequest::new(east_observer(), start, end)
                .with_scene(SceneFilter::Pearl)
                .with_mode(SearchMode::Balanced);
            engine.search(&request, &CancelFlag::new()).unwrap().events
        };

        // The moon rising on May 1 lines up at about 04:00 on May 2
        let events = pearls(date(2025, 5, 2), date(2025, 5, 2));
        assert_eq!(events.len(), 1, "{events:?}");
        assert_eq!(engine.local_date(events[0].time), date(2025, 5, 2));
        assert_eq!(events[0].time.hour(), 4);
        assert_eq!(events[0].subtype, EventSubtype::Setting);

        // First day of a range
        let events = pearls(date(2025, 6, 1), date(2025, 6, 3));
        let dates: Vec<NaiveDate> = events.iter().map(|e| engine.local_date(e.time)).collect();
        assert_eq!(dates, vec![date(2025, 6, 1), date(2025, 6, 2), date(2025, 6, 3)]);
    }

    #[test]
    fn test_finer_modes_do_not_lose_accuracy() {
        let observer = east_observer();
        let bearing = engine_with(Arc::new(NoWindowSky))
            .sight_line(&observer)
            .unwrap()
            .bearing;
        let mut deviations = Vec::new();
        for mode in [SearchMode::Fast, SearchMode::Balanced, SearchMode::Precise] {
            // 0.3 deg/min crossing the bearing 17335.8 s after rise, between grid points
            let start_azimuth = bearing - 0.3 * 17_335.8 / 60.0;
            let engine = engine_with(Arc::new(LinearSky::new(start_azimuth, 0.3)));
            let request = SearchRequest::new(observer, date(2025, 5, 1), date(2025, 5, 1))
                .with_scene(SceneFilter::Diamond)
                .with_mode(mode);
            let result = engine.search(&request, &CancelFlag::new()).unwrap();
            assert_eq!(result.events.len(), 1, "{mode}");
            deviations.push(result.events[0].azimuth_deviation);
        }
        // Each mode stays within half its refinement resolution worth of sweep
        assert!(deviations[0] <= 0.3 * 15.0 / 60.0);
        assert!(deviations[1] <= 0.3 * 5.0 / 60.0);
        assert!(deviations[2] <= 0.3 * 1.0 / 60.0);
        assert!(
            deviations[2] <= deviations[1] && deviations[1] <= deviations[0],
            "{deviations:?}"
        );
    }

    #[test]
    fn test_limit_truncates_and_reports() {
        let engine = engine_with(Arc::new(LinearSky::new(180.0, 0.25)));
        let request = SearchRequest::new(east_observer(), date(2025, 5, 1), date(2025, 5, 5))
            .with_scene(SceneFilter::Diamond)
            .with_mode(SearchMode::Fast)
            .with_limit(2);
        let result = engine.search(&request, &CancelFlag::new()).unwrap();
        assert_eq!(result.events.len(), 2);
        assert!(result.metadata.is_limited);
        assert_eq!(result.metadata.original_total, 5);
        assert_eq!(result.metadata.total_events, 2);
    }

    #[test]
    fn test_cancelled_search_stops() {
        let sky = Arc::new(LinearSky::new(180.0, 0.25));
        let engine = engine_with(sky.clone());
        let cancel = CancelFlag::new();
        cancel.cancel();
        let request = SearchRequest::new(east_observer(), date(2025, 5, 1), date(2025, 5, 30))
            .with_mode(SearchMode::Fast);
        assert!(matches!(
            engine.search(&request, &cancel),
            Err(AlignmentPlannerError::Cancelled(_))
        ));
        assert_eq!(sky.calls(), 0);
    }

    #[test]
    fn test_invalid_requests() {
        let engine = engine_with(Arc::new(LinearSky::new(180.0, 0.25)));
        let backwards = SearchRequest::new(east_observer(), date(2025, 5, 2), date(2025, 5, 1));
        assert!(matches!(
            engine.search(&backwards, &CancelFlag::new()),
            Err(AlignmentPlannerError::InvalidInput(_))
        ));

        let nan = SearchRequest::new(Observer::new(f64::NAN, 0.0, 0.0), date(2025, 5, 1), date(2025, 5, 1));
        assert!(matches!(
            engine.search(&nan, &CancelFlag::new()),
            Err(AlignmentPlannerError::GeometryError(_))
        ));

        let landmark = Landmark::default().standing_point();
        let on_top = SearchRequest::new(landmark, date(2025, 5, 1), date(2025, 5, 1));
        assert!(matches!(
            engine.search(&on_top, &CancelFlag::new()),
            Err(AlignmentPlannerError::InvalidInput(_))
        ));
    }

    #[test]
    fn test_elevated_observer_looks_down() {
        let engine = engine_with(Arc::new(LinearSky::new(180.0, 0.25)));
        let high = Observer::new(east_observer().latitude, east_observer().longitude, 5000.0);
        let sight = engine.sight_line(&high).unwrap();
        assert!(sight.apex_elevation < 0.0);
    }

    #[test]
    fn test_local_minima_detection() {
        let t0 = Utc::now();
        let samples: Vec<Sample> = [5.0, 2.0, 0.5, 1.0, 3.0, 1.2, 4.0]
            .iter()
            .enumerate()
            .map(|(i, d)| Sample {
                time: t0 + Duration::minutes(i as i64),
                deviation: *d,
            })
            .collect();
        let minima = local_minima(&samples, 1.5);
        assert_eq!(minima.len(), 2);
        assert_eq!(minima[0].deviation, 0.5);
        assert_eq!(minima[1].deviation, 1.2);
    }

    #[test]
    fn test_day_start_uses_local_calendar() {
        let engine = AlignmentEngine::new(
            Arc::new(NoWindowSky),
            Landmark::default(),
            FixedOffset::east_opt(9 * 3600).unwrap(),
        );
        let start = engine.day_start(date(2025, 1, 1));
        assert_eq!(start, Utc.with_ymd_and_hms(2024, 12, 31, 15, 0, 0).unwrap());
        assert_eq!(engine.local_date(start), date(2025, 1, 1));
    }
}
