//! Async facade over the engine and the event cache.
//!
//! Searches are split into cache-sized chunks (one day, or whole calendar
//! months), each chunk is served from the cache or computed on the blocking
//! pool under a timeout, and the results are stitched back together.

use std::sync::Arc;

use chrono::{Datelike, NaiveDate};
use log::{info, warn};

use crate::cache::{CacheKey, CacheStore, EventCache};
use crate::celestial::{CelestialProvider, RetryingProvider};
use crate::config::PlannerConfig;
use crate::search::{AlignmentEngine, CancelFlag};
use crate::{
    AlignmentEvent, AlignmentPlannerError, AlignmentPlannerResult, Body, DateRange,
    ElevationPoint, EventKind, Location, LocationId, SceneFilter, SearchMetadata, SearchMode,
    SearchRequest, SearchResult,
};

/// Outcome of recomputing one location.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecomputeReport {
    /// (month, mode) pairs refreshed
    pub recomputed: usize,
    pub failed: usize,
}

/// Outcome of recomputing many locations.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchReport {
    pub locations: usize,
    pub recomputed: usize,
    pub failed: usize,
    /// Locations with at least one failed month
    pub failed_locations: Vec<LocationId>,
}

/// Sets the flag when dropped, so an abandoned caller stops its search.
struct CancelOnDrop(CancelFlag);

impl Drop for CancelOnDrop {
    fn drop(&mut self) {
        self.0.cancel();
    }
}

pub struct AlignmentService<S> {
    engine: Arc<AlignmentEngine>,
    cache: EventCache<S>,
    cache_ttl: chrono::Duration,
    search_timeout: std::time::Duration,
    recompute_modes: Vec<SearchMode>,
}

impl<S: CacheStore> AlignmentService<S> {
    pub fn new(engine: AlignmentEngine, store: S, config: &PlannerConfig) -> Self {
        Self {
            engine: Arc::new(engine),
            cache: EventCache::new(store),
            cache_ttl: config.cache_ttl(),
            search_timeout: config.search_timeout(),
            recompute_modes: config.recompute_modes.clone(),
        }
    }

    /// Builds the engine from `config`, wrapping `provider` with the
    /// configured retry policy.
    pub fn from_config(
        config: &PlannerConfig,
        provider: Arc<dyn CelestialProvider>,
        store: S,
    ) -> AlignmentPlannerResult<Self> {
        config.validate()?;
        let provider = RetryingProvider::new(provider, config.retry_policy());
        let engine = AlignmentEngine::new(
            Arc::new(provider),
            config.landmark.clone(),
            config.utc_offset()?,
        );
        Ok(Self::new(engine, store, config))
    }

    pub fn engine(&self) -> &AlignmentEngine {
        &self.engine
    }

    pub fn cache(&self) -> &EventCache<S> {
        &self.cache
    }

    /// Cached search.
    ///
    /// # Errors
    /// Validation errors before any work; `Cancelled` when a chunk exceeds the
    /// search timeout; provider errors once retries are exhausted.
    pub async fn search(&self, request: &SearchRequest) -> AlignmentPlannerResult<SearchResult> {
        let (config, sight) = self.engine.prepare(request)?;
        let range = request.range();
        let location = request.location_key();

        let chunks: Vec<(CacheKey, DateRange)> = if range.span_days() == 1 {
            let day = range.start;
            vec![(
                CacheKey::day(
                    day.year(),
                    day.month(),
                    day.day(),
                    location.clone(),
                    request.scene,
                    config.mode,
                ),
                range,
            )]
        } else {
            range
                .months()
                .into_iter()
                .filter_map(|(year, month)| {
                    DateRange::month(year, month).map(|chunk| {
                        (
                            CacheKey::month(year, month, location.clone(), request.scene, config.mode),
                            chunk,
                        )
                    })
                })
                .collect()
        };

        let mut events = Vec::new();
        for (key, chunk) in chunks {
            let chunk_request = SearchRequest {
                start_date: chunk.start,
                end_date: chunk.end,
                mode: config.mode,
                limit: None,
                ..request.clone()
            };
            let found = self
                .cache
                .get_or_compute(&key, self.cache_ttl, || self.run_search(chunk_request))
                .await?;
            events.extend(
                found
                    .into_iter()
                    .filter(|e| range.contains(self.engine.local_date(e.time))),
            );
        }
        events.sort_by_key(|e| e.time);

        let original_total = events.len();
        let is_limited = matches!(request.limit, Some(limit) if limit < original_total);
        if let Some(limit) = request.limit {
            events.truncate(limit);
        }

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

    /// Virtual vantage points for `body` on `date`. Not cached.
    pub async fn elevation_points(
        &self,
        date: NaiveDate,
        body: Body,
        elevations: Option<Vec<f64>>,
    ) -> AlignmentPlannerResult<Vec<ElevationPoint>> {
        let engine = self.engine.clone();
        tokio::task::spawn_blocking(move || {
            crate::elevation::elevation_points(&engine, date, body, elevations.as_deref())
        })
        .await
        .map_err(|e| AlignmentPlannerError::CalculationError(format!("elevation task failed: {e}")))?
    }

    /// Recomputes every month `range` touches for `location`, in each
    /// maintenance mode, and replaces the all/diamond/pearl entries.
    ///
    /// Failures are logged and counted; they never abort the remaining months.
    pub async fn recompute(&self, location: &Location, range: DateRange) -> RecomputeReport {
        let mut report = RecomputeReport::default();
        let location_key = format!("loc-{}", location.id);

        for (year, month) in range.months() {
            let Some(chunk) = DateRange::month(year, month) else {
                continue;
            };
            for &mode in &self.recompute_modes {
                let request = SearchRequest::for_location(location, chunk.start, chunk.end)
                    .with_mode(mode)
                    .with_scene(SceneFilter::All);

                let refreshed = match self.run_search(request).await {
                    Ok(events) => self.store_scenes(&location_key, year, month, mode, &events).await,
                    Err(e) => Err(e),
                };
                match refreshed {
                    Ok(()) => report.recomputed += 1,
                    Err(e) => {
                        warn!(
                            "recompute failed for location {} ({}) {year}-{month:02} {mode}: {e}",
                            location.id, location.name
                        );
                        report.failed += 1;
                    }
                }
            }
        }

        info!(
            "recomputed location {} over {}..{}: {} ok, {} failed",
            location.id, range.start, range.end, report.recomputed, report.failed
        );
        report
    }

    /// Recomputes each location in turn; one location failing does not stop
    /// the others.
    pub async fn recompute_batch(&self, locations: &[Location], range: DateRange) -> BatchReport {
        let mut batch = BatchReport {
            locations: locations.len(),
            ..BatchReport::default()
        };
        for location in locations {
            let report = self.recompute(location, range).await;
            batch.recomputed += report.recomputed;
            batch.failed += report.failed;
            if report.failed > 0 {
                batch.failed_locations.push(location.id);
            }
        }
        batch
    }

    async fn store_scenes(
        &self,
        location_key: &str,
        year: i32,
        month: u32,
        mode: SearchMode,
        events: &[AlignmentEvent],
    ) -> AlignmentPlannerResult<()> {
        let diamonds: Vec<AlignmentEvent> = events
            .iter()
            .filter(|e| e.kind == EventKind::Diamond)
            .cloned()
            .collect();
        let pearls: Vec<AlignmentEvent> = events
            .iter()
            .filter(|e| e.kind == EventKind::Pearl)
            .cloned()
            .collect();

        for (scene, scene_events) in [
            (SceneFilter::All, events),
            (SceneFilter::Diamond, diamonds.as_slice()),
            (SceneFilter::Pearl, pearls.as_slice()),
        ] {
            let key = CacheKey::month(year, month, location_key, scene, mode);
            self.cache.put(&key, scene_events, self.cache_ttl).await?;
        }
        Ok(())
    }

    /// Runs one engine search on the blocking pool under the search timeout.
    async fn run_search(&self, request: SearchRequest) -> AlignmentPlannerResult<Vec<AlignmentEvent>> {
        let cancel = CancelFlag::new();
        let _guard = CancelOnDrop(cancel.clone());

        let engine = self.engine.clone();
        let task_cancel = cancel.clone();
        let task = tokio::task::spawn_blocking(move || engine.search(&request, &task_cancel));

        match tokio::time::timeout(self.search_timeout, task).await {
            Ok(Ok(result)) => result.map(|r| r.events),
            Ok(Err(e)) => Err(AlignmentPlannerError::CalculationError(format!(
                "search task failed: {e}"
            ))),
            Err(_) => {
                cancel.cancel();
                Err(AlignmentPlannerError::Cancelled(format!(
                    "search exceeded {:?}",
                    self.search_timeout
                )))
            }
        }
    }
}
