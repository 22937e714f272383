//! Data model shared by the search engine, the cache and the aggregators.

use std::fmt;

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::geometry::GeoPoint;

/// Identifier of a saved photography location.
pub type LocationId = u64;

/// Observer location on Earth.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Observer {
    /// Latitude in degrees (-90 to 90)
    pub latitude: f64,
    /// Longitude in degrees (-180 to 180)
    pub longitude: f64,
    /// Elevation in meters above sea level
    pub elevation: f64,
}

impl Observer {
    pub fn new(latitude: f64, longitude: f64, elevation: f64) -> Self {
        Self {
            latitude,
            longitude,
            elevation,
        }
    }

    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }
}

/// The fixed structure every alignment is measured against.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Landmark {
    pub name: String,
    pub latitude: f64,
    pub longitude: f64,
    /// Height of the apex above sea level (meters)
    pub apex_height: f64,
}

impl Landmark {
    pub fn point(&self) -> GeoPoint {
        GeoPoint::new(self.latitude, self.longitude)
    }

    /// The landmark apex used as a standing reference for rise/set windows.
    pub fn standing_point(&self) -> Observer {
        Observer::new(self.latitude, self.longitude, self.apex_height)
    }
}

impl Default for Landmark {
    fn default() -> Self {
        Self {
            name: "Mount Fuji".to_string(),
            latitude: 35.3606,
            longitude: 138.7274,
            apex_height: 3776.0,
        }
    }
}

/// A saved photography location, as handed over by the persistence layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Location {
    pub id: LocationId,
    pub name: String,
    pub observer: Observer,
}

/// Celestial body taking part in an alignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Body {
    Sun,
    Moon,
}

impl Body {
    pub fn event_kind(self) -> EventKind {
        match self {
            Body::Sun => EventKind::Diamond,
            Body::Moon => EventKind::Pearl,
        }
    }
}

impl fmt::Display for Body {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Body::Sun => write!(f, "sun"),
            Body::Moon => write!(f, "moon"),
        }
    }
}

/// Which alignments a request is interested in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SceneFilter {
    All,
    Diamond,
    Pearl,
}

impl SceneFilter {
    pub fn bodies(self) -> &'static [Body] {
        match self {
            SceneFilter::All => &[Body::Sun, Body::Moon],
            SceneFilter::Diamond => &[Body::Sun],
            SceneFilter::Pearl => &[Body::Moon],
        }
    }

    pub fn accepts(self, kind: EventKind) -> bool {
        match self {
            SceneFilter::All => true,
            SceneFilter::Diamond => kind == EventKind::Diamond,
            SceneFilter::Pearl => kind == EventKind::Pearl,
        }
    }
}

impl fmt::Display for SceneFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SceneFilter::All => write!(f, "all"),
            SceneFilter::Diamond => write!(f, "diamond"),
            SceneFilter::Pearl => write!(f, "pearl"),
        }
    }
}

/// Resolution/range tradeoff of a search.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SearchMode {
    Auto,
    Fast,
    Balanced,
    Precise,
}

impl fmt::Display for SearchMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SearchMode::Auto => write!(f, "auto"),
            SearchMode::Fast => write!(f, "fast"),
            SearchMode::Balanced => write!(f, "balanced"),
            SearchMode::Precise => write!(f, "precise"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Diamond,
    Pearl,
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventKind::Diamond => write!(f, "diamond"),
            EventKind::Pearl => write!(f, "pearl"),
        }
    }
}

/// Phase of the body's passage through its rise/set window.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EventSubtype {
    Sunrise,
    Sunset,
    Rising,
    Setting,
}

impl EventSubtype {
    pub fn for_phase(body: Body, rising: bool) -> Self {
        match (body, rising) {
            (Body::Sun, true) => EventSubtype::Sunrise,
            (Body::Sun, false) => EventSubtype::Sunset,
            (Body::Moon, true) => EventSubtype::Rising,
            (Body::Moon, false) => EventSubtype::Setting,
        }
    }
}

/// Discrete match quality. Declaration order is the total order:
/// `Perfect > Excellent > Good > Fair`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Accuracy {
    Fair,
    Good,
    Excellent,
    Perfect,
}

/// A single alignment of the sun or moon with the landmark.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlignmentEvent {
    pub id: String,
    /// Saved location the search was run for, if any
    pub location_id: Option<LocationId>,
    pub kind: EventKind,
    pub subtype: EventSubtype,
    pub time: DateTime<Utc>,
    /// Body azimuth (degrees, [0, 360))
    pub azimuth: f64,
    /// Body altitude (degrees, negative below the horizon)
    pub altitude: f64,
    /// Absolute angle between the body azimuth and the landmark bearing (degrees)
    pub azimuth_deviation: f64,
    pub accuracy: Accuracy,
    /// Desirability score in [0, 1]
    pub quality: f64,
    /// Moon phase angle (degrees, 0 = new, 180 = full), pearl events only
    pub moon_phase: Option<f64>,
    /// Illuminated fraction of the lunar disk, pearl events only
    pub moon_illumination: Option<f64>,
}

/// Inclusive range of calendar dates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    pub start: NaiveDate,
    pub end: NaiveDate,
}

impl DateRange {
    pub fn new(start: NaiveDate, end: NaiveDate) -> Self {
        Self { start, end }
    }

    /// Number of days covered, both ends included.
    pub fn span_days(&self) -> i64 {
        (self.end - self.start).num_days() + 1
    }

    pub fn contains(&self, date: NaiveDate) -> bool {
        date >= self.start && date <= self.end
    }

    pub fn days(&self) -> impl Iterator<Item = NaiveDate> {
        let start = self.start;
        let count = self.span_days().max(0);
        (0..count).map(move |offset| start + Duration::days(offset))
    }

    /// Whole calendar months touched by this range, as `(year, month)`.
    pub fn months(&self) -> Vec<(i32, u32)> {
        let mut months = Vec::new();
        if self.end < self.start {
            return months;
        }
        let (mut year, mut month) = (self.start.year(), self.start.month());
        let last = (self.end.year(), self.end.month());
        loop {
            months.push((year, month));
            if (year, month) == last {
                break;
            }
            if month == 12 {
                year += 1;
                month = 1;
            } else {
                month += 1;
            }
        }
        months
    }

    /// The full calendar month `year`/`month`.
    pub fn month(year: i32, month: u32) -> Option<Self> {
        let start = NaiveDate::from_ymd_opt(year, month, 1)?;
        let next = if month == 12 {
            NaiveDate::from_ymd_opt(year + 1, 1, 1)?
        } else {
            NaiveDate::from_ymd_opt(year, month + 1, 1)?
        };
        Some(Self::new(start, next - Duration::days(1)))
    }
}

/// A single search call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchRequest {
    pub observer: Observer,
    /// Saved location the observer belongs to; used for cache keys and event ids
    pub location_id: Option<LocationId>,
    pub scene: SceneFilter,
    pub mode: SearchMode,
    pub start_date: NaiveDate,
    /// Inclusive
    pub end_date: NaiveDate,
    /// Maximum number of events to return
    pub limit: Option<usize>,
}

impl SearchRequest {
    pub fn new(observer: Observer, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            observer,
            location_id: None,
            scene: SceneFilter::All,
            mode: SearchMode::Auto,
            start_date,
            end_date,
            limit: None,
        }
    }

    pub fn for_location(location: &Location, start_date: NaiveDate, end_date: NaiveDate) -> Self {
        Self {
            location_id: Some(location.id),
            ..Self::new(location.observer, start_date, end_date)
        }
    }

    pub fn with_scene(mut self, scene: SceneFilter) -> Self {
        self.scene = scene;
        self
    }

    pub fn with_mode(mut self, mode: SearchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn range(&self) -> DateRange {
        DateRange::new(self.start_date, self.end_date)
    }

    /// Stable identifier of the observer for cache keys.
    pub fn location_key(&self) -> String {
        match self.location_id {
            Some(id) => format!("loc-{id}"),
            None => format!(
                "{:.4},{:.4},{:.0}",
                self.observer.latitude, self.observer.longitude, self.observer.elevation
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchMetadata {
    pub total_events: usize,
    pub search_interval_seconds: i64,
    /// True when `limit` truncated the event list
    pub is_limited: bool,
    /// Event count before truncation
    pub original_total: usize,
    /// Concrete mode the request ran with (never `Auto`)
    pub resolved_mode: SearchMode,
    /// Bearing from the observer to the landmark (degrees)
    pub landmark_bearing: f64,
    pub landmark_distance_km: f64,
    /// Angle above the observer's horizon at which the apex appears (degrees)
    pub landmark_elevation: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub events: Vec<AlignmentEvent>,
    pub metadata: SearchMetadata,
}

/// A "virtual vantage point": where to stand so the apex and the body share
/// the same elevation angle.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ElevationPoint {
    pub body: Body,
    /// Target elevation angle (degrees)
    pub elevation: f64,
    pub latitude: f64,
    pub longitude: f64,
    pub distance_km: f64,
    /// Bearing from the landmark to the vantage point (degrees)
    pub bearing: f64,
    /// Body azimuth at `time` (degrees)
    pub body_azimuth: f64,
    pub time: DateTime<Utc>,
}
