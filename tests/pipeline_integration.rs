//! End-to-end pipeline test over an in-memory source: collect, validate,
//! merge, bias-screen, publish, read back.

use async_trait::async_trait;
use chrono::NaiveDate;
use std::time::Duration;

use marketcap_rank::artifact::ArtifactStore;
use marketcap_rank::bias::{BiasDetector, ReferenceFacts};
use marketcap_rank::checkpoint::CheckpointStore;
use marketcap_rank::coerce::{RawRow, RawValue};
use marketcap_rank::collector::{Collector, FetchError, PageSource, RetryPolicy};
use marketcap_rank::merge::{MergeEngine, MergeInput, MergePolicy, SourceSpec};
use marketcap_rank::rate_limit::{RateLimitConfig, RateLimiter};
use marketcap_rank::schema::SchemaRegistry;
use marketcap_rank::table::QualityTier;
use marketcap_rank::validate::Validator;

struct StaticSource {
    rows: Vec<RawRow>,
    per_page: u32,
}

impl StaticSource {
    /// A small market where caps are consistent with price * supply, so
    /// merged rows verify cleanly.
    fn market() -> Self {
        let coin = |id: &str, price: f64, supply: f64| {
            let mut row = RawRow::new();
            row.insert("coin_id".to_string(), RawValue::Text(id.to_string()));
            row.insert("symbol".to_string(), RawValue::Text(id[..3].to_string()));
            row.insert("name".to_string(), RawValue::Text(id.to_string()));
            row.insert("price".to_string(), RawValue::Float(price));
            row.insert("market_cap".to_string(), RawValue::Float(price * supply));
            row.insert("volume_24h".to_string(), RawValue::Float(price * supply / 10.0));
            row.insert("circulating_supply".to_string(), RawValue::Float(supply));
            row
        };
        Self {
            rows: vec![
                coin("bitcoin", 46_300.0, 18_920_000.0),
                coin("ethereum", 3_700.0, 119_000_000.0),
                coin("tether", 1.0, 78_000_000_000.0),
                coin("solana", 170.0, 310_000_000.0),
                coin("cardano", 1.3, 33_000_000_000.0),
            ],
            per_page: 2,
        }
    }
}

#[async_trait]
impl PageSource for StaticSource {
    fn source_tag(&self) -> &str {
        "coingecko"
    }

    fn per_page(&self) -> u32 {
        self.per_page
    }

    async fn total_items(&self) -> Result<u64, FetchError> {
        Ok(self.rows.len() as u64)
    }

    async fn fetch_page(&self, page: u32) -> Result<Vec<RawRow>, FetchError> {
        let start = ((page - 1) * self.per_page) as usize;
        let end = (start + self.per_page as usize).min(self.rows.len());
        if start >= self.rows.len() {
            return Ok(Vec::new());
        }
        Ok(self.rows[start..end].to_vec())
    }
}

#[tokio::test]
async fn collect_merge_screen_publish_read_back() {
    let date = NaiveDate::from_ymd_opt(2022, 1, 1).unwrap();
    let checkpoint_dir = tempfile::tempdir().unwrap();
    let registry = SchemaRegistry::canonical();

    let rate_limiter = RateLimiter::new(RateLimitConfig {
        max_calls: 1_000,
        window: Duration::from_secs(60),
        session_quota: None,
        ..RateLimitConfig::default()
    });
    let checkpoints = CheckpointStore::new(checkpoint_dir.path()).unwrap();
    let mut collector = Collector::new(
        rate_limiter,
        checkpoints,
        registry.clone(),
        RetryPolicy::default(),
    );

    let source = StaticSource::market();
    let collected = collector
        .collect(&source, "coingecko-2022-01-01", date)
        .await
        .unwrap();
    assert_eq!(collected.len(), 5);

    let validator = Validator::new(registry.clone());
    let report = validator.validate_strict(&collected).unwrap();
    assert!(report.violations().is_empty(), "{report}");

    let engine = MergeEngine::new(
        MergePolicy::new(vec![SourceSpec {
            tag: "coingecko".to_string(),
            priority: 2,
            fallback_tier: QualityTier::Unverified,
        }]),
        Validator::new(registry),
    );
    let outcome = engine
        .merge(vec![MergeInput {
            table: collected,
            tag: "coingecko".to_string(),
        }])
        .unwrap();
    assert!(outcome.report.passed(), "{}", outcome.report);

    // Every row carries a supply consistent with its cap.
    assert!(outcome
        .table
        .rows()
        .iter()
        .all(|r| r.quality_tier == QualityTier::Verified));
    // Ranks follow merged market caps: bitcoin, ethereum, tether, solana,
    // cardano by cap.
    assert_eq!(outcome.table.rows()[0].coin_id, "bitcoin");
    assert_eq!(outcome.table.rows()[0].rank, 1);

    let bias = BiasDetector::new().check(&outcome.table, &ReferenceFacts::builtin());
    assert!(bias.clean(), "{:?}", bias.errors);

    let store = ArtifactStore::in_memory().unwrap();
    assert_eq!(store.publish(&outcome.table).unwrap(), 5);
    let loaded = store.load_date(date).unwrap();
    assert_eq!(loaded, outcome.table);
}

#[tokio::test]
async fn defunct_window_table_without_dead_asset_is_flagged() {
    let date = NaiveDate::from_ymd_opt(2022, 5, 1).unwrap(); // inside LUNA/FTT windows
    let checkpoint_dir = tempfile::tempdir().unwrap();
    let registry = SchemaRegistry::canonical();

    let rate_limiter = RateLimiter::new(RateLimitConfig {
        max_calls: 1_000,
        session_quota: None,
        ..RateLimitConfig::default()
    });
    let checkpoints = CheckpointStore::new(checkpoint_dir.path()).unwrap();
    let mut collector = Collector::new(
        rate_limiter,
        checkpoints,
        registry.clone(),
        RetryPolicy::default(),
    );

    let source = StaticSource::market();
    let collected = collector
        .collect(&source, "coingecko-2022-05-01", date)
        .await
        .unwrap();

    let engine = MergeEngine::new(
        MergePolicy::new(vec![SourceSpec {
            tag: "coingecko".to_string(),
            priority: 2,
            fallback_tier: QualityTier::Unverified,
        }]),
        Validator::new(registry),
    );
    let outcome = engine
        .merge(vec![MergeInput {
            table: collected,
            tag: "coingecko".to_string(),
        }])
        .unwrap();

    // 2022-05-01 sits inside the terra-luna and ftx-token active windows;
    // a snapshot without them is survivorship-biased.
    let bias = BiasDetector::new().check(&outcome.table, &ReferenceFacts::builtin());
    assert!(!bias.clean());
    assert!(bias.errors.len() >= 2);
}
