//! Virtual vantage points.
//!
//! For a target elevation angle, find where an observer would have to stand
//! so that the landmark apex appears at that angle while the sun or moon sits
//! at the same altitude directly behind it.

use chrono::{DateTime, Duration, NaiveDate, Utc};
use log::debug;

use crate::celestial::{CelestialProvider, RiseSet};
use crate::geometry::{destination_point, normalize_degrees};
use crate::search::AlignmentEngine;
use crate::{AlignmentPlannerError, AlignmentPlannerResult, Body, ElevationPoint, Observer};

/// Targets are capped this far (degrees) below the day's culmination.
const CULMINATION_MARGIN: f64 = 1.0;
/// Maximum altitude mismatch (degrees) accepted for a scan sample.
const ALTITUDE_TOLERANCE: f64 = 2.0;
/// At or below this elevation (degrees) the vantage point runs off to infinity.
const MIN_ELEVATION: f64 = 0.5;
const MIN_DISTANCE_KM: f64 = 0.1;
const MAX_DISTANCE_KM: f64 = 500.0;
const SCAN_STEP_MINUTES: i64 = 1;
const TRANSIT_STEP_MINUTES: i64 = 10;

/// Default target elevations: 0..=30 for the sun, 0..=60 for the moon, 5 degree steps.
pub fn default_elevations(body: Body) -> Vec<f64> {
    let top = match body {
        Body::Sun => 30,
        Body::Moon => 60,
    };
    (0..=top).step_by(5).map(f64::from).collect()
}

/// Find the maximum altitude reached inside `window` using a coarse scan
/// followed by golden section search.
pub(crate) fn find_max_altitude(
    provider: &dyn CelestialProvider,
    body: Body,
    observer: &Observer,
    window: &RiseSet,
    step: Duration,
) -> AlignmentPlannerResult<(DateTime<Utc>, f64)> {
    // First do a coarse search to find approximate peak
    let mut max_altitude = f64::NEG_INFINITY;
    let mut max_time = window.rise;
    let mut current_time = window.rise;
    while current_time <= window.set {
        let altitude = provider.position_at(body, current_time, observer)?.altitude;
        if altitude > max_altitude {
            max_altitude = altitude;
            max_time = current_time;
        }
        current_time += step;
    }

    // Golden section over one step on each side of the coarse peak
    let phi = (1.0 + 5.0_f64.sqrt()) / 2.0;
    let mut a = (max_time - step).max(window.rise);
    let mut b = (max_time + step).min(window.set);

    let max_iterations = 50;
    let mut iterations = 0;
    while (b - a) > Duration::seconds(1) && iterations < max_iterations {
        iterations += 1;
        let span = (b - a).num_milliseconds() as f64;
        let c = b - Duration::milliseconds((span / phi) as i64);
        let d = a + Duration::milliseconds((span / phi) as i64);
        let alt_c = provider.position_at(body, c, observer)?.altitude;
        let alt_d = provider.position_at(body, d, observer)?.altitude;

        if alt_c > alt_d {
            b = d;
            if alt_c > max_altitude {
                max_altitude = alt_c;
                max_time = c;
            }
        } else {
            a = c;
            if alt_d > max_altitude {
                max_altitude = alt_d;
                max_time = d;
            }
        }
    }

    Ok((max_time, max_altitude))
}

/// Compute virtual vantage points for `body` on `date`.
///
/// # Arguments
/// * `engine` - Provides the landmark, the provider and the local calendar
/// * `date` - Local calendar date
/// * `body` - Sun or moon
/// * `elevations` - Target elevation angles in degrees; defaults per body when `None`
///
/// # Returns
/// Up to two points per reachable target, in the order of `elevations`: the
/// body passes each altitude once while climbing and once while sinking, and
/// the climbing point comes first. Targets above
/// the day's culmination, too close to the horizon, or leading to implausible
/// distances are skipped. A body that does not rise yields an empty list.
///
/// # Errors
/// `InvalidInput` for non-finite targets; provider failures are propagated.
pub fn elevation_points(
    engine: &AlignmentEngine,
    date: NaiveDate,
    body: Body,
    elevations: Option<&[f64]>,
) -> AlignmentPlannerResult<Vec<ElevationPoint>> {
    let targets = match elevations {
        Some(targets) => targets.to_vec(),
        None => default_elevations(body),
    };
    if let Some(bad) = targets.iter().find(|t| !t.is_finite()) {
        return Err(AlignmentPlannerError::InvalidInput(format!(
            "elevation {bad} is not a number"
        )));
    }

    let landmark = engine.landmark();
    let standing = landmark.standing_point();
    let provider = engine.provider();

    let Some(window) = provider.rise_set(body, &standing, engine.day_start(date))? else {
        debug!("{body} on {date}: no window, no elevation points");
        return Ok(Vec::new());
    };

    let (transit, culmination) = find_max_altitude(
        provider,
        body,
        &standing,
        &window,
        Duration::minutes(TRANSIT_STEP_MINUTES),
    )?;
    let cap = culmination - CULMINATION_MARGIN;

    // One pass over the window, reused for every target
    let mut samples = Vec::new();
    let mut current = window.rise;
    while current <= window.set {
        samples.push((current, provider.position_at(body, current, &standing)?));
        current += Duration::minutes(SCAN_STEP_MINUTES);
    }
    let (climbing, sinking): (Vec<_>, Vec<_>) =
        samples.into_iter().partition(|(time, _)| *time <= transit);

    let mut points = Vec::new();
    for &target in &targets {
        if target <= MIN_ELEVATION || target > cap {
            debug!("{body} on {date}: elevation {target}° out of reach (cap {cap:.1}°)");
            continue;
        }

        for half in [&climbing, &sinking] {
            let closest = half.iter().min_by(|(_, a), (_, b)| {
                (a.altitude - target)
                    .abs()
                    .total_cmp(&(b.altitude - target).abs())
            });
            let Some(&(time, position)) = closest else {
                continue;
            };
            if (position.altitude - target).abs() > ALTITUDE_TOLERANCE {
                continue;
            }

            let distance_km = landmark.apex_height / target.to_radians().tan() / 1000.0;
            if !(MIN_DISTANCE_KM..=MAX_DISTANCE_KM).contains(&distance_km) {
                continue;
            }

            // Stand on the far side of the landmark from the body
            let bearing = normalize_degrees(position.azimuth + 180.0);
            let point = destination_point(landmark.point(), bearing, distance_km * 1000.0);

            points.push(ElevationPoint {
                body,
                elevation: target,
                latitude: point.latitude,
                longitude: point.longitude,
                distance_km,
                bearing,
                body_azimuth: position.azimuth,
                time,
            });
        }
    }

    Ok(points)
}
