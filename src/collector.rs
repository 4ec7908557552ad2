//! Paginated collection loop with checkpointed resume.
//!
//! The collector enumerates pages from a `PageSource`, passing every fetch
//! through the rate limiter, retrying transient failures through a bounded
//! backoff schedule, and persisting rows + checkpoint after each page so an
//! interrupted run resumes with at most one page re-fetched. A page that
//! fails after all retries halts the run; a silent gap would corrupt
//! completeness.

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

use crate::checkpoint::{CheckpointError, CheckpointStore, CollectionCheckpoint, CursorState};
use crate::coerce::{coerce_field, CoercedValue, CoercionError, RawRow, RawValue};
use crate::rate_limit::{RateLimitError, RateLimiter};
use crate::schema::{SchemaRegistry, SemanticType};
use crate::table::{QualityTier, RankingRecord, RankingTable};

/// Safety cap: a paginated source that never terminates would otherwise
/// loop forever.
const MAX_PAGES: u32 = 100;

/// Transient upstream failure during a fetch.
#[derive(Debug)]
pub enum FetchError {
    Network { message: String },
    RateLimited { retry_after: Option<Duration> },
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Network { message } => write!(f, "network error: {message}"),
            Self::RateLimited { retry_after } => match retry_after {
                Some(d) => write!(f, "rate limited upstream (retry after {}s)", d.as_secs()),
                None => write!(f, "rate limited upstream"),
            },
        }
    }
}

impl std::error::Error for FetchError {}

/// A paginated upstream source of entity rows.
///
/// The collector is polymorphic over the transport; a source only has to
/// enumerate 1-indexed pages and report a total item count for cursor
/// validation. Rows come back keyed by canonical field name with untyped
/// values; the collector owns coercion.
#[async_trait]
pub trait PageSource: Send + Sync {
    fn source_tag(&self) -> &str;
    fn per_page(&self) -> u32;
    async fn total_items(&self) -> Result<u64, FetchError>;
    async fn fetch_page(&self, page: u32) -> Result<Vec<RawRow>, FetchError>;
}

#[derive(Debug, Clone)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
        }
    }
}

/// Bounded backoff state machine, independent of the fetch logic it wraps.
#[derive(Debug)]
pub struct RetrySchedule {
    retries_used: u32,
    max_attempts: u32,
    next_delay: Duration,
    max_delay: Duration,
}

impl RetrySchedule {
    pub fn new(policy: &RetryPolicy) -> Self {
        Self {
            retries_used: 0,
            max_attempts: policy.max_attempts.max(1),
            next_delay: policy.base_delay,
            max_delay: policy.max_delay,
        }
    }

    /// Delay before the next retry, or `None` once attempts are exhausted.
    /// Delays double up to `max_delay`.
    pub fn next_backoff(&mut self) -> Option<Duration> {
        if self.retries_used + 1 >= self.max_attempts {
            return None;
        }
        self.retries_used += 1;
        let delay = self.next_delay;
        self.next_delay = (self.next_delay * 2).min(self.max_delay);
        Some(delay)
    }

    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }
}

#[derive(Debug)]
pub enum CollectError {
    Checkpoint(CheckpointError),
    Coercion(CoercionError),
    Quota(RateLimitError),
    /// A page failed after all retry attempts; the run halts rather than
    /// leaving a gap.
    PageFailed {
        page: u32,
        attempts: u32,
        source: FetchError,
    },
    TooManyPages {
        pages: u32,
    },
}

impl fmt::Display for CollectError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Checkpoint(e) => write!(f, "{e}"),
            Self::Coercion(e) => write!(f, "{e}"),
            Self::Quota(e) => write!(f, "{e}"),
            Self::PageFailed {
                page,
                attempts,
                source,
            } => write!(f, "page {page} failed after {attempts} attempts: {source}"),
            Self::TooManyPages { pages } => {
                write!(f, "pagination exceeded safety cap at page {pages}")
            }
        }
    }
}

impl std::error::Error for CollectError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Checkpoint(e) => Some(e),
            Self::Coercion(e) => Some(e),
            Self::Quota(e) => Some(e),
            Self::PageFailed { source, .. } => Some(source),
            Self::TooManyPages { .. } => None,
        }
    }
}

impl From<CheckpointError> for CollectError {
    fn from(e: CheckpointError) -> Self {
        Self::Checkpoint(e)
    }
}

impl From<CoercionError> for CollectError {
    fn from(e: CoercionError) -> Self {
        Self::Coercion(e)
    }
}

/// Run counters for observability.
#[derive(Debug, Clone, Default, Serialize)]
pub struct CollectionMetrics {
    pub api_calls: u64,
    pub rows_collected: u64,
    pub duplicates_skipped: u64,
    pub failed_requests: u64,
    pub pages_completed: u32,
    pub resumed_from_page: Option<u32>,
}

/// Sequential paginated collector.
///
/// Owns the run's rate limiter and checkpoint state exclusively; nothing here
/// is process-global, so concurrent logical collections cannot interfere.
/// Pagination stays strictly sequential because checkpoint correctness
/// depends on monotonically increasing page indices.
pub struct Collector {
    rate_limiter: RateLimiter,
    checkpoints: CheckpointStore,
    registry: SchemaRegistry,
    retry: RetryPolicy,
    metrics: CollectionMetrics,
}

impl Collector {
    pub fn new(
        rate_limiter: RateLimiter,
        checkpoints: CheckpointStore,
        registry: SchemaRegistry,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            rate_limiter,
            checkpoints,
            registry,
            retry,
            metrics: CollectionMetrics::default(),
        }
    }

    pub fn metrics(&self) -> &CollectionMetrics {
        &self.metrics
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.rate_limiter
    }

    /// Collect every page for one date, resuming from a prior checkpoint when
    /// one exists. Ranks are assigned densely in accumulated source order.
    pub async fn collect<S: PageSource>(
        &mut self,
        source: &S,
        run_id: &str,
        date: NaiveDate,
    ) -> Result<RankingTable, CollectError> {
        let per_page = source.per_page();
        let total = self.fetch_total(source).await?;
        let pages_needed = (total.div_ceil(per_page as u64)) as u32;
        info!(
            source = source.source_tag(),
            run_id,
            total,
            pages_needed,
            "starting collection"
        );

        let mut rows: Vec<RankingRecord>;
        let mut seen: HashSet<String>;
        let mut next_page: u32;

        match self.checkpoints.load(run_id)? {
            Some(cp) => {
                cp.validate_cursor(total, per_page)?;
                rows = self.checkpoints.load_rows(run_id, cp.accumulated_row_count)?;
                seen = rows.iter().map(|r| r.coin_id.clone()).collect();
                next_page = cp.last_completed_page + 1;
                self.metrics.resumed_from_page = Some(next_page);
                info!(run_id, page = next_page, rows = rows.len(), "resuming from checkpoint");
            }
            None => {
                rows = Vec::new();
                seen = HashSet::new();
                next_page = 1;
            }
        }

        let started = std::time::Instant::now();
        let mut last_progress = started;

        loop {
            if next_page > MAX_PAGES {
                return Err(CollectError::TooManyPages { pages: next_page });
            }

            let raw = self.fetch_page_with_retry(source, next_page).await?;
            let fetched = raw.len();

            // Page boundaries can overlap when ranks shuffle upstream between
            // requests; dedup by primary key so a coin never appears twice.
            let mut page_rows = Vec::with_capacity(fetched);
            for entity in &raw {
                let mut record =
                    record_from_raw(&self.registry, entity, date, source.source_tag())?;
                if !seen.insert(record.coin_id.clone()) {
                    self.metrics.duplicates_skipped += 1;
                    continue;
                }
                record.rank = (rows.len() + page_rows.len() + 1) as i64;
                page_rows.push(record);
            }
            self.metrics.rows_collected += page_rows.len() as u64;

            // Rows first, then the checkpoint that makes them authoritative;
            // a crash between the two re-fetches exactly this page.
            self.checkpoints.append_rows(run_id, &page_rows)?;
            rows.extend(page_rows);
            self.checkpoints.save(&CollectionCheckpoint {
                run_id: run_id.to_string(),
                last_completed_page: next_page,
                cursor_state: CursorState {
                    total_items: total,
                    per_page,
                },
                accumulated_row_count: rows.len() as u64,
                timestamp: Utc::now(),
            })?;
            self.metrics.pages_completed += 1;

            if last_progress.elapsed() > Duration::from_secs(30) {
                info!(
                    page = next_page,
                    pages_needed,
                    rows = rows.len(),
                    elapsed_s = started.elapsed().as_secs(),
                    "collection progress"
                );
                last_progress = std::time::Instant::now();
            }

            if fetched == 0 {
                info!(page = next_page, "empty page, collection complete");
                break;
            }
            if (fetched as u32) < per_page {
                info!(page = next_page, fetched, "partial page, collection complete");
                break;
            }
            if pages_needed > 0 && next_page >= pages_needed {
                break;
            }
            next_page += 1;
        }

        self.checkpoints.retire(run_id)?;
        info!(
            rows = rows.len(),
            api_calls = self.metrics.api_calls,
            duplicates_skipped = self.metrics.duplicates_skipped,
            "collection finished"
        );
        Ok(RankingTable::from_rows(rows))
    }

    async fn fetch_total<S: PageSource>(&mut self, source: &S) -> Result<u64, CollectError> {
        let mut schedule = RetrySchedule::new(&self.retry);
        loop {
            self.rate_limiter.acquire().await.map_err(CollectError::Quota)?;
            self.metrics.api_calls += 1;
            match source.total_items().await {
                Ok(total) => return Ok(total),
                Err(err) => self.backoff_or_fail(0, err, &mut schedule).await?,
            }
        }
    }

    async fn fetch_page_with_retry<S: PageSource>(
        &mut self,
        source: &S,
        page: u32,
    ) -> Result<Vec<RawRow>, CollectError> {
        let mut schedule = RetrySchedule::new(&self.retry);
        loop {
            self.rate_limiter.acquire().await.map_err(CollectError::Quota)?;
            self.metrics.api_calls += 1;
            match source.fetch_page(page).await {
                Ok(rows) => return Ok(rows),
                Err(err) => self.backoff_or_fail(page, err, &mut schedule).await?,
            }
        }
    }

    /// Transient failures sleep and retry; an exhausted schedule halts the
    /// run. Upstream rate rejections additionally escalate local pacing.
    async fn backoff_or_fail(
        &mut self,
        page: u32,
        err: FetchError,
        schedule: &mut RetrySchedule,
    ) -> Result<(), CollectError> {
        self.metrics.failed_requests += 1;
        if matches!(err, FetchError::RateLimited { .. }) {
            self.rate_limiter.record_rejection();
        }
        match schedule.next_backoff() {
            Some(delay) => {
                let delay = match &err {
                    FetchError::RateLimited {
                        retry_after: Some(ra),
                    } => delay.max(*ra),
                    _ => delay,
                };
                warn!(
                    page,
                    error = %err,
                    delay_ms = delay.as_millis() as u64,
                    "fetch failed, retrying"
                );
                sleep(delay).await;
                Ok(())
            }
            None => Err(CollectError::PageFailed {
                page,
                attempts: schedule.max_attempts(),
                source: err,
            }),
        }
    }
}

fn coerce_named(
    registry: &SchemaRegistry,
    raw: &RawRow,
    name: &str,
) -> Result<CoercedValue, CoercionError> {
    let field = registry.field(name).ok_or_else(|| CoercionError {
        field: name.to_string(),
        raw: "<unregistered>".to_string(),
        expected: SemanticType::Text,
        reason: "field not in schema registry".to_string(),
    })?;
    let value = raw.get(name).cloned().unwrap_or(RawValue::Null);
    coerce_field(field, &value)
}

/// Build a record from one raw entity. Rank is assigned by the caller after
/// dedup; the tier here is a placeholder, the merge engine owns assignment.
fn record_from_raw(
    registry: &SchemaRegistry,
    raw: &RawRow,
    date: NaiveDate,
    source_tag: &str,
) -> Result<RankingRecord, CoercionError> {
    Ok(RankingRecord {
        date,
        rank: 0,
        coin_id: coerce_named(registry, raw, "coin_id")?.require_text("coin_id")?,
        symbol: coerce_named(registry, raw, "symbol")?.optional_text("symbol")?,
        name: coerce_named(registry, raw, "name")?.optional_text("name")?,
        market_cap: coerce_named(registry, raw, "market_cap")?.require_f64("market_cap")?,
        price: coerce_named(registry, raw, "price")?.require_f64("price")?,
        volume_24h: coerce_named(registry, raw, "volume_24h")?.require_f64("volume_24h")?,
        circulating_supply: coerce_named(registry, raw, "circulating_supply")?
            .optional_f64("circulating_supply")?,
        source: source_tag.to_string(),
        quality_tier: QualityTier::Unverified,
    })
}
