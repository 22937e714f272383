//! Scheduled cache maintenance.
//!
//! Yearly, monthly and daily jobs recompute the cache ahead of expiry for a
//! set of saved locations. Each job kind runs as a single instance at a time,
//! guarded by a lease in [`JobRegistry`]; a lease older than the configured
//! lease duration is considered abandoned and may be taken over.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Datelike, Duration, NaiveDate, Utc};
use log::{info, warn};
use tokio::task::JoinHandle;

use crate::cache::CacheStore;
use crate::config::PlannerConfig;
use crate::service::{AlignmentService, BatchReport};
use crate::{DateRange, Location};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum JobKind {
    /// The whole of next calendar year
    Yearly,
    /// The whole of next calendar month
    Monthly,
    /// Today and the six days after
    Daily,
}

impl JobKind {
    pub fn date_range(self, today: NaiveDate) -> DateRange {
        match self {
            JobKind::Yearly => {
                let year = today.year() + 1;
                match (
                    NaiveDate::from_ymd_opt(year, 1, 1),
                    NaiveDate::from_ymd_opt(year, 12, 31),
                ) {
                    (Some(start), Some(end)) => DateRange::new(start, end),
                    _ => DateRange::new(today, today),
                }
            }
            JobKind::Monthly => {
                let (year, month) = if today.month() == 12 {
                    (today.year() + 1, 1)
                } else {
                    (today.year(), today.month() + 1)
                };
                DateRange::month(year, month).unwrap_or(DateRange::new(today, today))
            }
            JobKind::Daily => DateRange::new(today, today + Duration::days(6)),
        }
    }
}

impl fmt::Display for JobKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobKind::Yearly => write!(f, "yearly"),
            JobKind::Monthly => write!(f, "monthly"),
            JobKind::Daily => write!(f, "daily"),
        }
    }
}

/// Active job instances, one per kind.
#[derive(Debug)]
pub struct JobRegistry {
    lease: Duration,
    active: Mutex<HashMap<JobKind, DateTime<Utc>>>,
}

impl JobRegistry {
    pub fn new(lease: Duration) -> Arc<Self> {
        Arc::new(Self {
            lease,
            active: Mutex::new(HashMap::new()),
        })
    }

    /// Claims `kind` at `now`. Returns `None` while another instance holds a
    /// lease younger than the lease duration.
    pub fn try_acquire(self: &Arc<Self>, kind: JobKind, now: DateTime<Utc>) -> Option<JobLease> {
        let mut active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(&started_at) = active.get(&kind) {
            if now - started_at < self.lease {
                return None;
            }
            warn!("{kind} job lease from {started_at} is stale, taking over");
        }
        active.insert(kind, now);
        Some(JobLease {
            registry: self.clone(),
            kind,
            started_at: now,
        })
    }

    pub fn is_active(&self, kind: JobKind) -> bool {
        let active = self.active.lock().unwrap_or_else(|p| p.into_inner());
        active.contains_key(&kind)
    }
}

/// Held while a job runs. Released on drop, unless another instance has
/// taken the lease over in the meantime.
#[derive(Debug)]
pub struct JobLease {
    registry: Arc<JobRegistry>,
    kind: JobKind,
    started_at: DateTime<Utc>,
}

impl JobLease {
    pub fn kind(&self) -> JobKind {
        self.kind
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

impl Drop for JobLease {
    fn drop(&mut self) {
        let mut active = self
            .registry
            .active
            .lock()
            .unwrap_or_else(|p| p.into_inner());
        if active.get(&self.kind) == Some(&self.started_at) {
            active.remove(&self.kind);
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobOutcome {
    /// Another instance of the job is still running
    Skipped,
    Completed(BatchReport),
}

/// Runs maintenance jobs against a service.
pub struct MaintenanceScheduler<S> {
    service: Arc<AlignmentService<S>>,
    registry: Arc<JobRegistry>,
}

impl<S: CacheStore + 'static> MaintenanceScheduler<S> {
    pub fn new(service: Arc<AlignmentService<S>>, lease: Duration) -> Self {
        Self {
            service,
            registry: JobRegistry::new(lease),
        }
    }

    /// Scheduler whose leases last `job_lease_minutes` from `config`.
    pub fn from_config(service: Arc<AlignmentService<S>>, config: &PlannerConfig) -> Self {
        Self::new(service, config.job_lease())
    }

    pub fn lease(&self) -> Duration {
        self.registry.lease
    }

    pub fn registry(&self) -> &Arc<JobRegistry> {
        &self.registry
    }

    /// Runs `kind` once for `locations`, relative to the local date `today`.
    pub async fn run(&self, kind: JobKind, locations: &[Location], today: NaiveDate) -> JobOutcome {
        let Some(_lease) = self.registry.try_acquire(kind, Utc::now()) else {
            info!("{kind} job already running, skipping");
            return JobOutcome::Skipped;
        };

        let range = kind.date_range(today);
        info!(
            "{kind} job: {} locations over {}..{}",
            locations.len(),
            range.start,
            range.end
        );
        let report = self.service.recompute_batch(locations, range).await;
        if report.failed > 0 {
            warn!(
                "{kind} job finished with {} failures (locations {:?})",
                report.failed, report.failed_locations
            );
        }
        JobOutcome::Completed(report)
    }

    /// Runs `kind` every `period` until the returned handle is aborted.
    pub fn spawn(
        self: Arc<Self>,
        kind: JobKind,
        period: std::time::Duration,
        locations: Arc<Vec<Location>>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let today = self.service.engine().local_date(Utc::now());
                self.run(kind, &locations, today).await;
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{CacheKey, MemoryCacheStore};
    use crate::config::PlannerConfig;
    use crate::search::tests::{east_observer, engine_with, LinearSky};
    use crate::{SceneFilter, SearchMode};
    use chrono::TimeZone;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn scheduler() -> MaintenanceScheduler<MemoryCacheStore> {
        let service = AlignmentService::new(
            engine_with(Arc::new(LinearSky::new(180.0, 0.25))),
            MemoryCacheStore::new(),
            &PlannerConfig::default(),
        );
        MaintenanceScheduler::from_config(Arc::new(service), &PlannerConfig::default())
    }

    fn spots() -> Vec<Location> {
        vec![Location {
            id: 1,
            name: "east shore".to_string(),
            observer: east_observer(),
        }]
    }

    #[test]
    fn test_job_ranges() {
        let today = date(2025, 12, 15);
        assert_eq!(
            JobKind::Yearly.date_range(today),
            DateRange::new(date(2026, 1, 1), date(2026, 12, 31))
        );
        assert_eq!(
            JobKind::Monthly.date_range(today),
            DateRange::new(date(2026, 1, 1), date(2026, 1, 31))
        );
        assert_eq!(
            JobKind::Monthly.date_range(date(2024, 1, 31)),
            DateRange::new(date(2024, 2, 1), date(2024, 2, 29))
        );
        let daily = JobKind::Daily.date_range(today);
        assert_eq!(daily.span_days(), 7);
        assert_eq!(daily.end, date(2025, 12, 21));
    }

    #[test]
    fn test_single_instance_per_kind() {
        let registry = JobRegistry::new(Duration::minutes(60));
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();

        let lease = registry.try_acquire(JobKind::Monthly, now).unwrap();
        assert!(registry
            .try_acquire(JobKind::Monthly, now + Duration::minutes(10))
            .is_none());
        // Other kinds are independent
        assert!(registry.try_acquire(JobKind::Daily, now).is_some());

        drop(lease);
        assert!(!registry.is_active(JobKind::Monthly));
        assert!(registry.try_acquire(JobKind::Monthly, now).is_some());
    }

    #[test]
    fn test_stale_lease_is_taken_over() {
        let registry = JobRegistry::new(Duration::minutes(60));
        let now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();

        let stuck = registry.try_acquire(JobKind::Yearly, now).unwrap();
        let fresh = registry
            .try_acquire(JobKind::Yearly, now + Duration::minutes(61))
            .unwrap();
        assert_eq!(fresh.kind(), JobKind::Yearly);

        // The stuck instance finishing late must not release the new lease
        drop(stuck);
        assert!(registry.is_active(JobKind::Yearly));
        drop(fresh);
        assert!(!registry.is_active(JobKind::Yearly));
    }

    #[test]
    fn test_lease_comes_from_config() {
        let config = PlannerConfig {
            job_lease_minutes: 5,
            ..PlannerConfig::default()
        };
        let service = AlignmentService::new(
            engine_with(Arc::new(LinearSky::new(180.0, 0.25))),
            MemoryCacheStore::new(),
            &config,
        );
        let scheduler = MaintenanceScheduler::from_config(Arc::new(service), &config);
        assert_eq!(scheduler.lease(), Duration::minutes(5));
        assert_eq!(self::scheduler().lease(), Duration::minutes(60));

        let now = Utc.with_ymd_and_hms(2025, 3, 1, 0, 0, 0).unwrap();
        let _stuck = scheduler.registry().try_acquire(JobKind::Daily, now).unwrap();
        assert!(scheduler
            .registry()
            .try_acquire(JobKind::Daily, now + Duration::minutes(4))
            .is_none());
        assert!(scheduler
            .registry()
            .try_acquire(JobKind::Daily, now + Duration::minutes(6))
            .is_some());
    }

    #[tokio::test]
    async fn test_run_recomputes_and_skips_overlap() {
        let scheduler = scheduler();

        let held = scheduler
            .registry()
            .try_acquire(JobKind::Monthly, Utc::now())
            .unwrap();
        let outcome = scheduler.run(JobKind::Monthly, &spots(), date(2025, 4, 10)).await;
        assert_eq!(outcome, JobOutcome::Skipped);
        drop(held);

        let outcome = scheduler.run(JobKind::Monthly, &spots(), date(2025, 4, 10)).await;
        match outcome {
            JobOutcome::Completed(report) => {
                assert_eq!(report.recomputed, 1);
                assert_eq!(report.failed, 0);
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(!scheduler.registry().is_active(JobKind::Monthly));

        let key = CacheKey::month(2025, 5, "loc-1", SceneFilter::Diamond, SearchMode::Balanced);
        assert!(scheduler.service.cache().get(&key).await.unwrap().is_hit());
    }

    #[tokio::test]
    async fn test_spawned_job_runs_on_schedule() {
        let scheduler = Arc::new(scheduler());
        let service = scheduler.service.clone();
        let handle = scheduler.spawn(
            JobKind::Daily,
            std::time::Duration::from_secs(3600),
            Arc::new(spots()),
        );

        // The first tick fires immediately
        let today = service.engine().local_date(Utc::now());
        let key = CacheKey::month(
            today.year(),
            today.month(),
            "loc-1",
            SceneFilter::All,
            SearchMode::Balanced,
        );
        let mut hit = false;
        for _ in 0..100 {
            if service.cache().get(&key).await.unwrap().is_hit() {
                hit = true;
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }
        handle.abort();
        assert!(hit);
    }
}
