//! Deterministic multi-source merge with quality tiers.
//!
//! Each input table is tier-tagged, conflicts on (date, coin_id) resolve by
//! source priority, and ranks are re-derived from merged market caps so the
//! output is internally consistent. Same input sets always merge to the same
//! output regardless of input order: conflicts between equal priorities are
//! either within tolerance (deterministic pick) or a hard error.

use std::collections::BTreeMap;
use std::fmt;
use tracing::{debug, warn};

use crate::table::{QualityTier, RankingRecord, RankingTable, RecordKey, MARKET_CAP_TOLERANCE};
use crate::validate::{ValidationReport, Validator};

/// Per-source merge configuration.
#[derive(Debug, Clone)]
pub struct SourceSpec {
    pub tag: String,
    /// Higher wins. Sources not listed fall back to tier rank alone.
    pub priority: u32,
    /// Tier assigned to rows whose supply cannot be cross-checked.
    pub fallback_tier: QualityTier,
}

#[derive(Debug, Clone)]
pub struct MergePolicy {
    pub specs: Vec<SourceSpec>,
    /// Relative market-cap tolerance for same-priority conflicts.
    pub tolerance: f64,
}

impl MergePolicy {
    pub fn new(specs: Vec<SourceSpec>) -> Self {
        Self {
            specs,
            tolerance: MARKET_CAP_TOLERANCE,
        }
    }

    fn spec_for(&self, tag: &str) -> Option<&SourceSpec> {
        self.specs.iter().find(|s| s.tag == tag)
    }

    /// Effective priority of a record: configured source priority scaled
    /// above tier rank, so an explicit spec always dominates tier ordering
    /// between unlisted sources.
    fn priority_for(&self, tag: &str, tier: QualityTier) -> u64 {
        let tier_rank = match tier {
            QualityTier::Verified => 3,
            QualityTier::Unverified => 2,
            QualityTier::Uncertain => 1,
        };
        match self.spec_for(tag) {
            Some(spec) => (spec.priority as u64) * 10 + tier_rank,
            None => tier_rank,
        }
    }

    fn fallback_tier_for(&self, tag: &str) -> QualityTier {
        self.spec_for(tag)
            .map(|s| s.fallback_tier)
            .unwrap_or(QualityTier::Unverified)
    }

    /// Tie order among equal effective priorities: earlier position in the
    /// spec list wins, unlisted sources fall back to tag order. Input order
    /// never decides a merge.
    fn precedes(&self, a: &str, b: &str) -> bool {
        let index = |tag: &str| {
            self.specs
                .iter()
                .position(|s| s.tag == tag)
                .unwrap_or(self.specs.len())
        };
        (index(a), a) < (index(b), b)
    }
}

pub struct MergeInput {
    pub table: RankingTable,
    pub tag: String,
}

#[derive(Debug)]
pub enum MergeError {
    /// Equal-priority sources disagree beyond tolerance. Silent picks here
    /// would make the merge input-order dependent.
    UnresolvedConflict {
        key: RecordKey,
        sources: Vec<String>,
        market_caps: Vec<f64>,
    },
    EmptyInput,
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::UnresolvedConflict {
                key,
                sources,
                market_caps,
            } => write!(
                f,
                "unresolved conflict at {key}: sources {sources:?} report market caps {market_caps:?}"
            ),
            Self::EmptyInput => write!(f, "no input tables to merge"),
        }
    }
}

impl std::error::Error for MergeError {}

pub struct MergeOutcome {
    pub table: RankingTable,
    pub report: ValidationReport,
}

pub struct MergeEngine {
    policy: MergePolicy,
    validator: Validator,
}

impl MergeEngine {
    pub fn new(policy: MergePolicy, validator: Validator) -> Self {
        Self { policy, validator }
    }

    /// Merge input tables into one validated table.
    ///
    /// Tier assignment happens first (supply cross-check per row), then
    /// key-level conflict resolution, then per-date rank re-derivation, then
    /// a full validation pass over the result.
    pub fn merge(&self, inputs: Vec<MergeInput>) -> Result<MergeOutcome, MergeError> {
        if inputs.is_empty() {
            return Err(MergeError::EmptyInput);
        }

        let mut chosen: BTreeMap<RecordKey, (RankingRecord, u64)> = BTreeMap::new();
        for input in inputs {
            for mut record in input.table.into_rows() {
                record.source = input.tag.clone();
                record.quality_tier = self.assign_tier(&record);
                let priority = self.policy.priority_for(&input.tag, record.quality_tier);
                let key = record.key();
                match chosen.get_mut(&key) {
                    None => {
                        chosen.insert(key, (record, priority));
                    }
                    Some((incumbent, incumbent_priority)) => {
                        if priority > *incumbent_priority {
                            debug!(
                                key = %key,
                                winner = %record.source,
                                loser = %incumbent.source,
                                "conflict resolved by priority"
                            );
                            *incumbent = record;
                            *incumbent_priority = priority;
                        } else if priority == *incumbent_priority {
                            self.check_agreement(incumbent, &record)?;
                            // Within tolerance: policy order picks the
                            // survivor, independent of input order.
                            if self.policy.precedes(&record.source, &incumbent.source) {
                                *incumbent = record;
                            }
                        }
                    }
                }
            }
        }

        let mut rows: Vec<RankingRecord> = chosen.into_values().map(|(r, _)| r).collect();
        rederive_ranks(&mut rows);
        let mut table = RankingTable::from_rows(rows);
        table.sort_canonical();

        let report = self.validator.validate(&table);
        if !report.passed() {
            warn!(%report, "merged table failed validation");
        }
        Ok(MergeOutcome { table, report })
    }

    /// Supply cross-check decides the tier: a row whose market cap is
    /// reproducible from price * circulating_supply is `Verified`; a row
    /// that contradicts its own supply is `Uncertain`; a row with no supply
    /// takes the source's fallback tier.
    fn assign_tier(&self, record: &RankingRecord) -> QualityTier {
        match record.supply_check(self.policy.tolerance) {
            Some(true) => QualityTier::Verified,
            Some(false) => {
                warn!(
                    key = %record.key(),
                    market_cap = record.market_cap,
                    "market cap inconsistent with price * supply"
                );
                QualityTier::Uncertain
            }
            None => self.policy.fallback_tier_for(&record.source),
        }
    }

    fn check_agreement(
        &self,
        incumbent: &RankingRecord,
        challenger: &RankingRecord,
    ) -> Result<(), MergeError> {
        let reference = incumbent.market_cap.abs().max(f64::EPSILON);
        let delta = (incumbent.market_cap - challenger.market_cap).abs() / reference;
        if delta > self.policy.tolerance {
            return Err(MergeError::UnresolvedConflict {
                key: incumbent.key(),
                sources: vec![incumbent.source.clone(), challenger.source.clone()],
                market_caps: vec![incumbent.market_cap, challenger.market_cap],
            });
        }
        Ok(())
    }
}

/// Re-derive dense per-date ranks from merged market caps. Ties break on
/// coin_id so the ordering is total.
fn rederive_ranks(rows: &mut [RankingRecord]) {
    rows.sort_by(|a, b| {
        a.date
            .cmp(&b.date)
            .then(b.market_cap.total_cmp(&a.market_cap))
            .then(a.coin_id.cmp(&b.coin_id))
    });
    let mut current_date = None;
    let mut rank = 0i64;
    for row in rows.iter_mut() {
        if current_date != Some(row.date) {
            current_date = Some(row.date);
            rank = 0;
        }
        rank += 1;
        row.rank = rank;
    }
}
