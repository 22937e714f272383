//! Celestial position provider.
//!
//! The search engine only talks to [`CelestialProvider`]. This module also
//! ships a low-precision built-in ephemeris (a few arc-minutes for the sun,
//! a few tenths of a degree for the moon) and a retrying decorator.

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::warn;
use serde::{Deserialize, Serialize};

use crate::geometry::normalize_degrees;
use crate::{AlignmentPlannerError, AlignmentPlannerResult, Body, Observer};

/// Apparent altitude of the sun's center at rise/set (refraction + semi-diameter).
const SUN_HORIZON_DEG: f64 = -0.833;
/// Same for the moon, applied to the parallax-corrected altitude.
const MOON_HORIZON_DEG: f64 = -0.583;
const EQUATORIAL_RADIUS_KM: f64 = 6378.14;
/// Longest span a moon window is allowed to last.
const MAX_WINDOW_HOURS: i64 = 30;

/// Azimuth/altitude of a body as seen by an observer.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HorizontalPosition {
    /// Degrees clockwise from north, [0, 360)
    pub azimuth: f64,
    /// Degrees above the horizon, negative below
    pub altitude: f64,
}

/// Rise and following set of a body; `set` is always after `rise`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RiseSet {
    pub rise: DateTime<Utc>,
    pub set: DateTime<Utc>,
}

impl RiseSet {
    pub fn duration(&self) -> Duration {
        self.set - self.rise
    }

    /// Fraction of the window elapsed at `time`, clamped to [0, 1].
    pub fn elapsed_fraction(&self, time: DateTime<Utc>) -> f64 {
        let total = self.duration().num_milliseconds() as f64;
        if total <= 0.0 {
            return 0.0;
        }
        ((time - self.rise).num_milliseconds() as f64 / total).clamp(0.0, 1.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MoonPhase {
    /// Sun-moon elongation in ecliptic longitude (degrees, 0 = new, 180 = full)
    pub phase: f64,
    /// Illuminated fraction of the disk, [0, 1]
    pub illumination: f64,
}

/// Source of sun/moon positions.
///
/// Implementations must be deterministic for a given input so that searches
/// are repeatable and cacheable.
pub trait CelestialProvider: Send + Sync {
    /// Position of `body` at `time` for `observer`.
    fn position_at(
        &self,
        body: Body,
        time: DateTime<Utc>,
        observer: &Observer,
    ) -> AlignmentPlannerResult<HorizontalPosition>;

    /// First rise of `body` within the 24 hours starting at `day_start`, and the
    /// set that follows it. `None` when the body does not rise that day.
    fn rise_set(
        &self,
        body: Body,
        observer: &Observer,
        day_start: DateTime<Utc>,
    ) -> AlignmentPlannerResult<Option<RiseSet>>;

    fn moon_phase(&self, time: DateTime<Utc>) -> AlignmentPlannerResult<MoonPhase>;
}

impl<P: CelestialProvider + ?Sized> CelestialProvider for Arc<P> {
    fn position_at(
        &self,
        body: Body,
        time: DateTime<Utc>,
        observer: &Observer,
    ) -> AlignmentPlannerResult<HorizontalPosition> {
        (**self).position_at(body, time, observer)
    }

    fn rise_set(
        &self,
        body: Body,
        observer: &Observer,
        day_start: DateTime<Utc>,
    ) -> AlignmentPlannerResult<Option<RiseSet>> {
        (**self).rise_set(body, observer, day_start)
    }

    fn moon_phase(&self, time: DateTime<Utc>) -> AlignmentPlannerResult<MoonPhase> {
        (**self).moon_phase(time)
    }
}

/// Built-in ephemeris from mean orbital elements.
#[derive(Debug, Clone)]
pub struct LowPrecisionEphemeris {
    /// Coarse step used when looking for horizon crossings
    pub sample_step: Duration,
    /// Resolution of the bisection that refines horizon crossings
    pub crossing_resolution: Duration,
}

impl Default for LowPrecisionEphemeris {
    fn default() -> Self {
        Self {
            sample_step: Duration::minutes(10),
            crossing_resolution: Duration::seconds(1),
        }
    }
}

/// Equatorial coordinates plus the ecliptic longitude they came from.
struct Equatorial {
    right_ascension: f64,
    declination: f64,
    ecliptic_longitude: f64,
    distance_km: Option<f64>,
}

fn julian_date(time: DateTime<Utc>) -> f64 {
    let unix = time.timestamp() as f64;
    let sub = time.timestamp_subsec_nanos() as f64 * 1e-9;
    2440587.5 + (unix + sub) / 86400.0
}

fn obliquity(n: f64) -> f64 {
    (23.439 - 0.0000004 * n).to_radians()
}

fn sun_equatorial(n: f64) -> Equatorial {
    // Mean longitude and mean anomaly (degrees)
    let l = normalize_degrees(280.460 + 0.9856474 * n);
    let g = normalize_degrees(357.528 + 0.9856003 * n).to_radians();

    let lambda = normalize_degrees(l + 1.915 * g.sin() + 0.020 * (2.0 * g).sin());
    let lambda_rad = lambda.to_radians();
    let epsilon = obliquity(n);

    Equatorial {
        right_ascension: (lambda_rad.sin() * epsilon.cos()).atan2(lambda_rad.cos()),
        declination: (lambda_rad.sin() * epsilon.sin()).asin(),
        ecliptic_longitude: lambda,
        distance_km: None,
    }
}

fn moon_equatorial(n: f64) -> Equatorial {
    let l_prime = normalize_degrees(218.316 + 13.176396 * n);
    let m_prime = normalize_degrees(134.963 + 13.064993 * n).to_radians();
    let f = normalize_degrees(93.272 + 13.229350 * n).to_radians();
    let d = normalize_degrees(297.850 + 12.190749 * n).to_radians();
    let m = normalize_degrees(357.529 + 0.98560028 * n).to_radians();

    let lambda = normalize_degrees(
        l_prime + 6.289 * m_prime.sin() + 1.274 * (2.0 * d - m_prime).sin()
            + 0.658 * (2.0 * d).sin()
            + 0.214 * (2.0 * m_prime).sin()
            - 0.186 * m.sin()
            - 0.114 * (2.0 * f).sin(),
    );
    let beta = 5.128 * f.sin()
        + 0.281 * (m_prime + f).sin()
        + 0.278 * (m_prime - f).sin()
        + 0.173 * (2.0 * d - f).sin();
    let distance = 385001.0
        - 20905.0 * m_prime.cos()
        - 3699.0 * (2.0 * d - m_prime).cos()
        - 2956.0 * (2.0 * d).cos();

    let lambda_rad = lambda.to_radians();
    let beta_rad = beta.to_radians();
    let epsilon = obliquity(n);

    let right_ascension = (lambda_rad.sin() * epsilon.cos() - beta_rad.tan() * epsilon.sin())
        .atan2(lambda_rad.cos());
    let declination = (beta_rad.sin() * epsilon.cos()
        + beta_rad.cos() * epsilon.sin() * lambda_rad.sin())
    .clamp(-1.0, 1.0)
    .asin();

    Equatorial {
        right_ascension,
        declination,
        ecliptic_longitude: lambda,
        distance_km: Some(distance),
    }
}

/// Converts equatorial coordinates to (altitude, azimuth) in degrees.
fn to_horizontal(eq: &Equatorial, jd: f64, observer: &Observer) -> (f64, f64) {
    let n = jd - 2451545.0;
    let t = n / 36525.0;
    let gmst = 280.46061837 + 360.98564736629 * n + 0.000387933 * t.powi(2) - t.powi(3) / 38710000.0;
    let lst = normalize_degrees(gmst + observer.longitude).to_radians();

    let hour_angle = lst - eq.right_ascension;
    let lat = observer.latitude.to_radians();
    let dec = eq.declination;

    let sin_alt = dec.sin() * lat.sin() + dec.cos() * lat.cos() * hour_angle.cos();
    let altitude = sin_alt.clamp(-1.0, 1.0).asin().to_degrees();

    // Measured from south, westward; shifted to north-based azimuth
    let azimuth = hour_angle
        .sin()
        .atan2(hour_angle.cos() * lat.sin() - dec.tan() * lat.cos())
        .to_degrees()
        + 180.0;

    (altitude, normalize_degrees(azimuth))
}

impl LowPrecisionEphemeris {
    fn altitude(&self, body: Body, time: DateTime<Utc>, observer: &Observer) -> f64 {
        let (altitude, _) = self.alt_az(body, time, observer);
        altitude
    }

    fn alt_az(&self, body: Body, time: DateTime<Utc>, observer: &Observer) -> (f64, f64) {
        let jd = julian_date(time);
        let n = jd - 2451545.0;
        match body {
            Body::Sun => to_horizontal(&sun_equatorial(n), jd, observer),
            Body::Moon => {
                let eq = moon_equatorial(n);
                let (geocentric_alt, azimuth) = to_horizontal(&eq, jd, observer);
                // Topocentric parallax in altitude (~1 degree for the moon)
                let distance = eq.distance_km.unwrap_or(385001.0);
                let parallax = (EQUATORIAL_RADIUS_KM / distance).asin().to_degrees();
                (
                    geocentric_alt - parallax * geocentric_alt.to_radians().cos(),
                    azimuth,
                )
            }
        }
    }

    fn horizon(body: Body) -> f64 {
        match body {
            Body::Sun => SUN_HORIZON_DEG,
            Body::Moon => MOON_HORIZON_DEG,
        }
    }

    /// First horizon crossing in the given direction between `from` and `until`.
    fn find_crossing(
        &self,
        body: Body,
        observer: &Observer,
        from: DateTime<Utc>,
        until: DateTime<Utc>,
        rising: bool,
    ) -> Option<DateTime<Utc>> {
        let horizon = Self::horizon(body);
        let mut previous = from;
        let mut was_above = self.altitude(body, from, observer) > horizon;
        let mut current = from + self.sample_step;

        while current <= until {
            let is_above = self.altitude(body, current, observer) > horizon;
            if rising && is_above && !was_above {
                return Some(self.bisect_crossing(body, observer, previous, current, true));
            }
            if !rising && !is_above && was_above {
                return Some(self.bisect_crossing(body, observer, previous, current, false));
            }
            was_above = is_above;
            previous = current;
            current += self.sample_step;
        }
        None
    }

    /// Binary search for the horizon crossing inside `[low, high]`.
    fn bisect_crossing(
        &self,
        body: Body,
        observer: &Observer,
        time_before: DateTime<Utc>,
        time_after: DateTime<Utc>,
        rising: bool,
    ) -> DateTime<Utc> {
        let horizon = Self::horizon(body);
        let mut low = time_before;
        let mut high = time_after;

        while high - low > self.crossing_resolution {
            let mid = low + (high - low) / 2;
            let above = self.altitude(body, mid, observer) > horizon;
            if above == rising {
                high = mid;
            } else {
                low = mid;
            }
        }

        if rising {
            high
        } else {
            low
        }
    }
}

impl CelestialProvider for LowPrecisionEphemeris {
    fn position_at(
        &self,
        body: Body,
        time: DateTime<Utc>,
        observer: &Observer,
    ) -> AlignmentPlannerResult<HorizontalPosition> {
        if !observer.latitude.is_finite() || !observer.longitude.is_finite() {
            return Err(AlignmentPlannerError::GeometryError(
                "observer coordinates are not finite".to_string(),
            ));
        }
        let (altitude, azimuth) = self.alt_az(body, time, observer);
        Ok(HorizontalPosition { azimuth, altitude })
    }

    fn rise_set(
        &self,
        body: Body,
        observer: &Observer,
        day_start: DateTime<Utc>,
    ) -> AlignmentPlannerResult<Option<RiseSet>> {
        let day_end = day_start + Duration::days(1);
        let Some(rise) = self.find_crossing(body, observer, day_start, day_end, true) else {
            return Ok(None);
        };
        let Some(set) = self.find_crossing(
            body,
            observer,
            rise,
            rise + Duration::hours(MAX_WINDOW_HOURS),
            false,
        ) else {
            return Ok(None);
        };
        Ok(Some(RiseSet { rise, set }))
    }

    fn moon_phase(&self, time: DateTime<Utc>) -> AlignmentPlannerResult<MoonPhase> {
        let n = julian_date(time) - 2451545.0;
        let phase = normalize_degrees(
            moon_equatorial(n).ecliptic_longitude - sun_equatorial(n).ecliptic_longitude,
        );
        let illumination = (1.0 - phase.to_radians().cos()) / 2.0;
        Ok(MoonPhase {
            phase,
            illumination,
        })
    }
}

/// Bounded exponential backoff for transient provider failures.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff: std::time::Duration,
    pub max_backoff: std::time::Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff: std::time::Duration::from_millis(50),
            max_backoff: std::time::Duration::from_secs(1),
        }
    }
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based).
    pub fn backoff(&self, attempt: u32) -> std::time::Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial_backoff
            .saturating_mul(factor)
            .min(self.max_backoff)
    }
}

/// Wraps a provider and retries calls that fail with `ProviderError`.
///
/// Sleeps on the calling thread, so it belongs on blocking workers.
pub struct RetryingProvider<P> {
    inner: P,
    policy: RetryPolicy,
}

impl<P: CelestialProvider> RetryingProvider<P> {
    pub fn new(inner: P, policy: RetryPolicy) -> Self {
        Self { inner, policy }
    }

    fn retry<T>(
        &self,
        operation: &str,
        call: impl Fn() -> AlignmentPlannerResult<T>,
    ) -> AlignmentPlannerResult<T> {
        let mut attempt = 1;
        loop {
            match call() {
                Ok(value) => return Ok(value),
                Err(e) if e.is_transient() && attempt < self.policy.max_attempts => {
                    let delay = self.policy.backoff(attempt);
                    warn!(
                        "{operation} failed (attempt {attempt}/{}): {e}; retrying in {delay:?}",
                        self.policy.max_attempts
                    );
                    std::thread::sleep(delay);
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

impl<P: CelestialProvider> CelestialProvider for RetryingProvider<P> {
    fn position_at(
        &self,
        body: Body,
        time: DateTime<Utc>,
        observer: &Observer,
    ) -> AlignmentPlannerResult<HorizontalPosition> {
        self.retry("position_at", || self.inner.position_at(body, time, observer))
    }

    fn rise_set(
        &self,
        body: Body,
        observer: &Observer,
        day_start: DateTime<Utc>,
    ) -> AlignmentPlannerResult<Option<RiseSet>> {
        self.retry("rise_set", || self.inner.rise_set(body, observer, day_start))
    }

    fn moon_phase(&self, time: DateTime<Utc>) -> AlignmentPlannerResult<MoonPhase> {
        self.retry("moon_phase", || self.inner.moon_phase(time))
    }
}
