//! Alignment Planner
//!
//! A crate for finding the dates and times at which the sun ("diamond") or
//! the moon ("pearl") lines up behind a tall landmark, as seen from a chosen
//! observer location.

use thiserror::Error;

pub mod aggregate;
pub mod cache;
pub mod celestial;
pub mod classify;
pub mod config;
pub mod elevation;
pub mod geometry;
pub mod jobs;
pub mod search;
pub mod service;
pub mod types;

pub use aggregate::{best_shot_days, group_by_date, group_by_location, stats, CalendarEvent, Stats};
pub use cache::{CacheEntry, CacheKey, CacheLookup, CacheStore, EventCache, FileCacheStore, MemoryCacheStore};
pub use celestial::{CelestialProvider, LowPrecisionEphemeris, RetryPolicy, RetryingProvider};
pub use config::PlannerConfig;
pub use elevation::elevation_points;
pub use jobs::{JobKind, JobOutcome, JobRegistry, MaintenanceScheduler};
pub use search::{AlignmentEngine, CancelFlag, SearchModeConfig};
pub use service::{AlignmentService, BatchReport, RecomputeReport};
pub use types::*;

/// Result type alias for alignment planner operations.
pub type AlignmentPlannerResult<T> = Result<T, AlignmentPlannerError>;

/// Error types for alignment planner operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AlignmentPlannerError {
    #[error("GeometryError: {0}")]
    GeometryError(String),
    #[error("ProviderError: {0}")]
    ProviderError(String),
    #[error("RangeTooLarge: {mode} mode allows at most {max_days} days, {requested_days} requested")]
    RangeTooLarge {
        mode: SearchMode,
        requested_days: i64,
        max_days: i64,
    },
    #[error("CacheCorruption: {0}")]
    CacheCorruption(String),
    #[error("InvalidInput: {0}")]
    InvalidInput(String),
    #[error("Cancelled: {0}")]
    Cancelled(String),
    #[error("CalculationError: {0}")]
    CalculationError(String),
    #[error("StorageError: {0}")]
    StorageError(String),
    #[error("ConfigError: {0}")]
    ConfigError(String),
}

impl AlignmentPlannerError {
    /// Whether a retry of the same call could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        matches!(self, AlignmentPlannerError::ProviderError(_))
    }
}
