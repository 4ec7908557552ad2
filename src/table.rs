//! Canonical ranking table types.
//!
//! `RankingRecord` is the one row shape every pipeline stage speaks; the
//! collector produces it, the validator and merge engine consume it, and the
//! artifact store persists it.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Relative tolerance for the supply cross-check: a record is supply-backed
/// when `|market_cap - price * circulating_supply| <= tolerance * market_cap`.
pub const MARKET_CAP_TOLERANCE: f64 = 0.005;

/// Provenance/confidence label for a record's market capitalization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum QualityTier {
    /// Supply-based market-cap cross-check passed.
    Verified,
    /// Source provided only a pre-computed market cap; accepted with this
    /// explicit flag.
    Unverified,
    /// Historical accuracy could not be established. Documented fallback,
    /// never assigned silently.
    Uncertain,
}

impl QualityTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            QualityTier::Verified => "verified",
            QualityTier::Unverified => "unverified",
            QualityTier::Uncertain => "uncertain",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "verified" => Some(QualityTier::Verified),
            "unverified" => Some(QualityTier::Unverified),
            "uncertain" => Some(QualityTier::Uncertain),
            _ => None,
        }
    }
}

impl fmt::Display for QualityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Primary key of a published row.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RecordKey {
    pub date: NaiveDate,
    pub coin_id: String,
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.date, self.coin_id)
    }
}

/// One point-in-time ranking row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RankingRecord {
    pub date: NaiveDate,
    /// Dense rank within `date`, 1 = largest market cap.
    pub rank: i64,
    pub coin_id: String,
    pub symbol: Option<String>,
    pub name: Option<String>,
    pub market_cap: f64,
    pub price: f64,
    pub volume_24h: f64,
    pub circulating_supply: Option<f64>,
    /// Tag of the source that contributed this record.
    pub source: String,
    pub quality_tier: QualityTier,
}

impl RankingRecord {
    pub fn key(&self) -> RecordKey {
        RecordKey {
            date: self.date,
            coin_id: self.coin_id.clone(),
        }
    }

    /// Supply-based market-cap cross-check.
    ///
    /// `None` when the source did not provide a circulating supply (the check
    /// cannot run); `Some(false)` when supply is present but the implied cap
    /// disagrees beyond `tolerance`.
    pub fn supply_check(&self, tolerance: f64) -> Option<bool> {
        let supply = self.circulating_supply?;
        if !supply.is_finite() || !self.price.is_finite() || !self.market_cap.is_finite() {
            return Some(false);
        }
        if supply <= 0.0 || self.market_cap <= 0.0 {
            return Some(false);
        }
        let implied = self.price * supply;
        Some((self.market_cap - implied).abs() <= tolerance * self.market_cap)
    }
}

/// Ordered collection of ranking rows.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RankingTable {
    rows: Vec<RankingRecord>,
}

impl RankingTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_rows(rows: Vec<RankingRecord>) -> Self {
        Self { rows }
    }

    pub fn rows(&self) -> &[RankingRecord] {
        &self.rows
    }

    pub fn into_rows(self) -> Vec<RankingRecord> {
        self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn push(&mut self, record: RankingRecord) {
        self.rows.push(record);
    }

    /// Inclusive date coverage, `None` for an empty table.
    pub fn date_range(&self) -> Option<(NaiveDate, NaiveDate)> {
        let min = self.rows.iter().map(|r| r.date).min()?;
        let max = self.rows.iter().map(|r| r.date).max()?;
        Some((min, max))
    }

    /// Rows grouped by date, dates in ascending order.
    pub fn partition_by_date(&self) -> BTreeMap<NaiveDate, Vec<&RankingRecord>> {
        let mut partitions: BTreeMap<NaiveDate, Vec<&RankingRecord>> = BTreeMap::new();
        for row in &self.rows {
            partitions.entry(row.date).or_default().push(row);
        }
        partitions
    }

    /// Canonical row order: date ascending, then rank, then coin_id.
    pub fn sort_canonical(&mut self) {
        self.rows
            .sort_by(|a, b| (a.date, a.rank, &a.coin_id).cmp(&(b.date, b.rank, &b.coin_id)));
    }
}
