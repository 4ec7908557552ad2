//! Pipeline entry point: collect one date's rankings from CoinGecko,
//! validate, merge, screen for bias, and publish the SQLite artifact.

use anyhow::{bail, Context, Result};
use chrono::{NaiveDate, Utc};
use clap::Parser;
use dotenv::dotenv;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use marketcap_rank::artifact::ArtifactStore;
use marketcap_rank::bias::{BiasDetector, ReferenceFacts};
use marketcap_rank::checkpoint::CheckpointStore;
use marketcap_rank::collector::{Collector, RetryPolicy};
use marketcap_rank::merge::{MergeEngine, MergeInput, MergePolicy, SourceSpec};
use marketcap_rank::rate_limit::{RateLimitConfig, RateLimiter};
use marketcap_rank::schema::SchemaRegistry;
use marketcap_rank::sources::coingecko::CoinGeckoSource;
use marketcap_rank::table::QualityTier;
use marketcap_rank::validate::Validator;

#[derive(Parser, Debug)]
#[command(name = "marketcap-rank", about = "Historical market-cap rankings pipeline")]
struct Args {
    /// Snapshot date (YYYY-MM-DD); defaults to today.
    #[arg(long)]
    date: Option<NaiveDate>,

    /// Directory for resumable collection checkpoints.
    #[arg(long, default_value = "data/checkpoints")]
    checkpoint_dir: PathBuf,

    /// Output artifact path.
    #[arg(long, default_value = "data/rankings.db")]
    out: PathBuf,

    /// CoinGecko API key; anonymous access gets heavier pacing.
    #[arg(long, env = "COINGECKO_API_KEY")]
    api_key: Option<String>,

    /// Rate-limit window call budget.
    #[arg(long, default_value_t = 30)]
    max_calls: usize,

    /// Rate-limit window length in seconds.
    #[arg(long, default_value_t = 60)]
    window_seconds: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let date = args.date.unwrap_or_else(|| Utc::now().date_naive());

    let max_calls = if args.api_key.is_some() {
        args.max_calls
    } else {
        // Anonymous clients get throttled well below the documented limit.
        (args.max_calls / 3).max(1)
    };
    let rate_limiter = RateLimiter::new(RateLimitConfig {
        max_calls,
        window: Duration::from_secs(args.window_seconds),
        ..RateLimitConfig::default()
    });

    let registry = SchemaRegistry::canonical();
    let checkpoints = CheckpointStore::new(&args.checkpoint_dir)
        .context("failed to open checkpoint directory")?;
    let mut collector = Collector::new(
        rate_limiter,
        checkpoints,
        registry.clone(),
        RetryPolicy::default(),
    );

    let source = CoinGeckoSource::new(args.api_key)?;
    let run_id = format!("coingecko-{date}");
    info!(%date, run_id, "collecting market-cap rankings");

    let collected = collector
        .collect(&source, &run_id, date)
        .await
        .context("collection failed")?;
    info!(
        rows = collected.len(),
        api_calls = collector.metrics().api_calls,
        "collection complete"
    );

    let validator = Validator::new(registry.clone());
    let report = validator
        .validate_strict(&collected)
        .map_err(|failed| anyhow::anyhow!("{}", failed.report))?;
    for violation in report.violations() {
        warn!(%violation, "validation warning");
    }

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
        .context("merge failed")?;
    if !outcome.report.passed() {
        bail!("merged table failed validation:\n{}", outcome.report);
    }

    let bias = BiasDetector::new().check(&outcome.table, &ReferenceFacts::builtin());
    if !bias.clean() {
        // Findings are never repaired automatically; fabricated rows would
        // be worse than the bias they hide.
        let details: Vec<String> = bias.errors.iter().map(|e| e.to_string()).collect();
        bail!("bias detected:\n{}", details.join("\n"));
    }

    let store = ArtifactStore::create(&args.out).context("failed to create artifact")?;
    let published = store.publish(&outcome.table)?;
    info!(
        rows = published,
        artifact = %args.out.display(),
        "pipeline complete"
    );
    Ok(())
}
