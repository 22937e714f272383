//! Calendar grouping, best-day ranking and statistics over event sets.

use std::collections::BTreeMap;

use chrono::{Datelike, FixedOffset, NaiveDate};
use serde::{Deserialize, Serialize};

use crate::classify::accuracy_bonus;
use crate::{Accuracy, AlignmentEvent, EventKind, Location, LocationId};

/// What kind of alignments a calendar day holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DayKind {
    Diamond,
    Pearl,
    Both,
}

/// All events of one local calendar day.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalendarEvent {
    pub date: NaiveDate,
    pub kind: DayKind,
    /// Chronological
    pub events: Vec<AlignmentEvent>,
    /// Event count plus the accuracy bonus of every event
    pub score: f64,
}

fn day_kind(events: &[AlignmentEvent]) -> Option<DayKind> {
    let diamond = events.iter().any(|e| e.kind == EventKind::Diamond);
    let pearl = events.iter().any(|e| e.kind == EventKind::Pearl);
    match (diamond, pearl) {
        (true, true) => Some(DayKind::Both),
        (true, false) => Some(DayKind::Diamond),
        (false, true) => Some(DayKind::Pearl),
        (false, false) => None,
    }
}

fn day_score(events: &[AlignmentEvent]) -> f64 {
    events.len() as f64 + events.iter().map(|e| accuracy_bonus(e.accuracy)).sum::<f64>()
}

/// Groups events by local calendar date.
///
/// Days come out in ascending date order, events within a day in time order.
pub fn group_by_date(events: &[AlignmentEvent], utc_offset: FixedOffset) -> Vec<CalendarEvent> {
    let mut days: BTreeMap<NaiveDate, Vec<AlignmentEvent>> = BTreeMap::new();
    for event in events {
        let date = event.time.with_timezone(&utc_offset).date_naive();
        days.entry(date).or_default().push(event.clone());
    }

    days.into_iter()
        .filter_map(|(date, mut events)| {
            events.sort_by_key(|e| e.time);
            let kind = day_kind(&events)?;
            let score = day_score(&events);
            Some(CalendarEvent {
                date,
                kind,
                events,
                score,
            })
        })
        .collect()
}

/// Best `limit` days of `year`/`month`, highest score first (earlier date on ties).
pub fn best_shot_days(
    events: &[AlignmentEvent],
    year: i32,
    month: u32,
    limit: usize,
    utc_offset: FixedOffset,
) -> Vec<CalendarEvent> {
    let mut days: Vec<CalendarEvent> = group_by_date(events, utc_offset)
        .into_iter()
        .filter(|day| day.date.year() == year && day.date.month() == month)
        .collect();
    days.sort_by(|a, b| b.score.total_cmp(&a.score).then(a.date.cmp(&b.date)));
    days.truncate(limit);
    days
}

/// Partitions events by the saved location they were computed for.
/// Every event lands in exactly one group; ad hoc searches group under `None`.
pub fn group_by_location(
    events: &[AlignmentEvent],
) -> BTreeMap<Option<LocationId>, Vec<AlignmentEvent>> {
    let mut groups: BTreeMap<Option<LocationId>, Vec<AlignmentEvent>> = BTreeMap::new();
    for event in events {
        groups.entry(event.location_id).or_default().push(event.clone());
    }
    groups
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccuracyHistogram {
    pub perfect: usize,
    pub excellent: usize,
    pub good: usize,
    pub fair: usize,
}

impl AccuracyHistogram {
    fn record(&mut self, accuracy: Accuracy) {
        match accuracy {
            Accuracy::Perfect => self.perfect += 1,
            Accuracy::Excellent => self.excellent += 1,
            Accuracy::Good => self.good += 1,
            Accuracy::Fair => self.fair += 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocationCount {
    pub location_id: Option<LocationId>,
    pub name: Option<String>,
    pub count: usize,
}

/// Yearly roll-up of an event set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Stats {
    pub year: i32,
    pub total: usize,
    pub diamond: usize,
    pub pearl: usize,
    /// Index 0 is January
    pub monthly: [usize; 12],
    pub by_accuracy: AccuracyHistogram,
    /// Sorted by location id, unassigned events first
    pub by_location: Vec<LocationCount>,
}

impl Stats {
    pub fn empty(year: i32) -> Self {
        Self {
            year,
            total: 0,
            diamond: 0,
            pearl: 0,
            monthly: [0; 12],
            by_accuracy: AccuracyHistogram::default(),
            by_location: Vec::new(),
        }
    }

    /// Adds another roll-up of the same year into this one.
    pub fn merge(mut self, other: &Stats) -> Stats {
        self.total += other.total;
        self.diamond += other.diamond;
        self.pearl += other.pearl;
        for (mine, theirs) in self.monthly.iter_mut().zip(other.monthly.iter()) {
            *mine += theirs;
        }
        self.by_accuracy.perfect += other.by_accuracy.perfect;
        self.by_accuracy.excellent += other.by_accuracy.excellent;
        self.by_accuracy.good += other.by_accuracy.good;
        self.by_accuracy.fair += other.by_accuracy.fair;

        let mut merged: BTreeMap<Option<LocationId>, LocationCount> = self
            .by_location
            .into_iter()
            .map(|c| (c.location_id, c))
            .collect();
        for count in &other.by_location {
            let entry = merged.entry(count.location_id).or_insert(LocationCount {
                location_id: count.location_id,
                name: None,
                count: 0,
            });
            entry.count += count.count;
            if entry.name.is_none() {
                entry.name = count.name.clone();
            }
        }
        self.by_location = merged.into_values().collect();
        self
    }
}

/// Statistics over the events of `year`.
///
/// Every location in `locations` appears in `by_location`, with zero if it
/// has no events; events of unknown locations are counted as well.
pub fn stats(
    events: &[AlignmentEvent],
    year: i32,
    locations: &[Location],
    utc_offset: FixedOffset,
) -> Stats {
    let mut stats = Stats::empty(year);
    let mut per_location: BTreeMap<Option<LocationId>, usize> = locations
        .iter()
        .map(|location| (Some(location.id), 0))
        .collect();

    for event in events {
        let date = event.time.with_timezone(&utc_offset).date_naive();
        if date.year() != year {
            continue;
        }
        stats.total += 1;
        match event.kind {
            EventKind::Diamond => stats.diamond += 1,
            EventKind::Pearl => stats.pearl += 1,
        }
        stats.monthly[date.month0() as usize] += 1;
        stats.by_accuracy.record(event.accuracy);
        *per_location.entry(event.location_id).or_insert(0) += 1;
    }

    stats.by_location = per_location
        .into_iter()
        .map(|(location_id, count)| LocationCount {
            location_id,
            name: location_id
                .and_then(|id| locations.iter().find(|l| l.id == id))
                .map(|l| l.name.clone()),
            count,
        })
        .collect();
    stats
}
