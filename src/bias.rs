//! Historical-bias detection over ranking tables.
//!
//! Two failure modes matter for point-in-time data. Survivorship bias:
//! assets that later died are missing from dates where they were alive and
//! large. Look-ahead bias: a row claims information that did not exist on
//! its own date, detectable through circulating-supply checkpoints. Findings
//! are reported, never silently repaired; fabricating rows would be worse
//! than the bias itself.

use chrono::NaiveDate;
use std::collections::BTreeMap;
use std::fmt;
use tracing::info;

use crate::table::{RankingRecord, RankingTable, RecordKey};
use crate::validate::{
    check_rank_consistency, Severity, ValidationReport, Violation, RULE_ORDERING,
};

pub const RULE_SURVIVORSHIP: &str = "survivorship_bias";
pub const RULE_LOOK_AHEAD: &str = "look_ahead_bias";

/// An asset that existed and then ceased, with its active window.
#[derive(Debug, Clone)]
pub struct DefunctEntity {
    pub coin_id: &'static str,
    pub symbol: &'static str,
    pub active_from: NaiveDate,
    pub active_until: NaiveDate,
    pub note: &'static str,
}

/// Known circulating supply bound for a reference asset at a date.
#[derive(Debug, Clone)]
pub struct SupplyCheckpoint {
    pub coin_id: &'static str,
    pub date: NaiveDate,
    pub min_supply: f64,
    pub max_supply: f64,
}

/// Curated external facts the detector checks tables against.
#[derive(Debug, Clone, Default)]
pub struct ReferenceFacts {
    pub defunct: Vec<DefunctEntity>,
    pub supply: Vec<SupplyCheckpoint>,
}

fn ymd(y: i32, m: u32, d: u32) -> NaiveDate {
    // All builtin facts are valid calendar dates.
    NaiveDate::from_ymd_opt(y, m, d).unwrap_or_default()
}

impl ReferenceFacts {
    /// The builtin fact set: major assets that died publicly, and Bitcoin's
    /// supply schedule, which is deterministic enough to bound per-date.
    pub fn builtin() -> Self {
        let defunct = vec![
            DefunctEntity {
                coin_id: "bitconnect",
                symbol: "BCC",
                active_from: ymd(2016, 1, 1),
                active_until: ymd(2018, 1, 16),
                note: "Ponzi scheme, exchange shut down",
            },
            DefunctEntity {
                coin_id: "terra-luna",
                symbol: "LUNA",
                active_from: ymd(2019, 7, 1),
                active_until: ymd(2022, 5, 13),
                note: "UST depeg collapse",
            },
            DefunctEntity {
                coin_id: "ftx-token",
                symbol: "FTT",
                active_from: ymd(2019, 7, 1),
                active_until: ymd(2022, 11, 11),
                note: "FTX bankruptcy",
            },
        ];
        let supply = vec![
            SupplyCheckpoint { coin_id: "bitcoin", date: ymd(2015, 1, 1), min_supply: 14.0e6, max_supply: 14.5e6 },
            SupplyCheckpoint { coin_id: "bitcoin", date: ymd(2016, 1, 1), min_supply: 15.0e6, max_supply: 15.5e6 },
            SupplyCheckpoint { coin_id: "bitcoin", date: ymd(2017, 1, 1), min_supply: 16.0e6, max_supply: 16.5e6 },
            SupplyCheckpoint { coin_id: "bitcoin", date: ymd(2018, 1, 1), min_supply: 16.75e6, max_supply: 17.25e6 },
            SupplyCheckpoint { coin_id: "bitcoin", date: ymd(2019, 1, 1), min_supply: 17.5e6, max_supply: 18.0e6 },
            SupplyCheckpoint { coin_id: "bitcoin", date: ymd(2020, 5, 12), min_supply: 18.35e6, max_supply: 18.4e6 },
            SupplyCheckpoint { coin_id: "bitcoin", date: ymd(2021, 1, 1), min_supply: 18.6e6, max_supply: 18.7e6 },
            SupplyCheckpoint { coin_id: "bitcoin", date: ymd(2022, 1, 1), min_supply: 18.9e6, max_supply: 19.0e6 },
            SupplyCheckpoint { coin_id: "bitcoin", date: ymd(2024, 4, 20), min_supply: 19.68e6, max_supply: 19.69e6 },
        ];
        Self { defunct, supply }
    }
}

#[derive(Debug)]
pub enum BiasError {
    /// A defunct asset has no record anywhere inside its active window.
    /// `sources_present` names the tags that did contribute rows in that
    /// window, so the caller knows which source(s) to reject.
    Survivorship {
        coin_id: String,
        window: (NaiveDate, NaiveDate),
        sources_present: Vec<String>,
    },
    /// A row carries data that could not have been known on its date.
    LookAhead {
        key: RecordKey,
        source: String,
        detail: String,
    },
}

impl fmt::Display for BiasError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Survivorship {
                coin_id,
                window,
                sources_present,
            } => write!(
                f,
                "survivorship bias: '{coin_id}' (active {} to {}) absent from sources [{}]",
                window.0,
                window.1,
                sources_present.join(", ")
            ),
            Self::LookAhead { key, source, detail } => {
                write!(f, "look-ahead bias at {key} (source '{source}'): {detail}")
            }
        }
    }
}

impl std::error::Error for BiasError {}

pub struct BiasOutcome {
    pub report: ValidationReport,
    pub errors: Vec<BiasError>,
}

impl BiasOutcome {
    pub fn clean(&self) -> bool {
        self.errors.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct BiasDetector;

impl BiasDetector {
    pub fn new() -> Self {
        Self
    }

    /// Check a table against reference facts. Findings land both in the
    /// structured error list and in a report for display.
    pub fn check(&self, table: &RankingTable, facts: &ReferenceFacts) -> BiasOutcome {
        let mut report = ValidationReport::new(table.len());
        let mut errors = Vec::new();

        self.check_survivorship(table, facts, &mut report, &mut errors);
        self.check_supply_facts(table, facts, &mut report, &mut errors);
        self.check_supply_monotonic(table, facts, &mut report, &mut errors);
        self.check_rank_consistency(table, &mut report);

        info!(
            rows = table.len(),
            findings = errors.len(),
            "bias detection finished"
        );
        BiasOutcome { report, errors }
    }

    /// A defunct asset must appear at least once inside its active window
    /// whenever the table has any coverage there. Windows the table never
    /// touches are skipped; a present-day table proves nothing about 2018.
    fn check_survivorship(
        &self,
        table: &RankingTable,
        facts: &ReferenceFacts,
        report: &mut ValidationReport,
        errors: &mut Vec<BiasError>,
    ) {
        let by_date = table.partition_by_date();
        for entity in &facts.defunct {
            let in_window: Vec<&RankingRecord> = by_date
                .range(entity.active_from..=entity.active_until)
                .flat_map(|(_, rows)| rows.iter().copied())
                .collect();
            if in_window.is_empty() {
                continue;
            }
            let present = in_window.iter().any(|r| {
                r.coin_id.eq_ignore_ascii_case(entity.coin_id)
                    || r.symbol
                        .as_deref()
                        .is_some_and(|s| s.eq_ignore_ascii_case(entity.symbol))
            });
            if !present {
                let mut sources: Vec<String> =
                    in_window.iter().map(|r| r.source.clone()).collect();
                sources.sort();
                sources.dedup();
                report.push(Violation {
                    rule: RULE_SURVIVORSHIP,
                    severity: Severity::Error,
                    message: format!(
                        "'{}' ({}) has no record in its active window; sources present: [{}]",
                        entity.coin_id,
                        entity.note,
                        sources.join(", ")
                    ),
                    affected_keys: Vec::new(),
                });
                errors.push(BiasError::Survivorship {
                    coin_id: entity.coin_id.to_string(),
                    window: (entity.active_from, entity.active_until),
                    sources_present: sources,
                });
            }
        }
    }

    /// Reported supply on an exact checkpoint date must fall inside the
    /// known bounds for that date.
    fn check_supply_facts(
        &self,
        table: &RankingTable,
        facts: &ReferenceFacts,
        report: &mut ValidationReport,
        errors: &mut Vec<BiasError>,
    ) {
        for row in table.rows() {
            let Some(supply) = row.circulating_supply else {
                continue;
            };
            for cp in &facts.supply {
                if cp.coin_id != row.coin_id || cp.date != row.date {
                    continue;
                }
                if supply < cp.min_supply || supply > cp.max_supply {
                    let detail = format!(
                        "reported supply {supply:.0} outside known bounds [{:.0}, {:.0}]",
                        cp.min_supply, cp.max_supply
                    );
                    report.push(Violation {
                        rule: RULE_LOOK_AHEAD,
                        severity: Severity::Error,
                        message: detail.clone(),
                        affected_keys: vec![row.key()],
                    });
                    errors.push(BiasError::LookAhead {
                        key: row.key(),
                        source: row.source.clone(),
                        detail,
                    });
                }
            }
        }
    }

    /// For assets with supply checkpoints the circulating supply only grows;
    /// a later table date reporting less supply than an earlier one means at
    /// least one row was backfilled from the wrong point in time.
    fn check_supply_monotonic(
        &self,
        table: &RankingTable,
        facts: &ReferenceFacts,
        report: &mut ValidationReport,
        errors: &mut Vec<BiasError>,
    ) {
        let reference_ids: Vec<&str> = facts.supply.iter().map(|cp| cp.coin_id).collect();
        let mut series: BTreeMap<&str, BTreeMap<NaiveDate, (f64, &str)>> = BTreeMap::new();
        for row in table.rows() {
            if !reference_ids.contains(&row.coin_id.as_str()) {
                continue;
            }
            if let Some(supply) = row.circulating_supply {
                series
                    .entry(row.coin_id.as_str())
                    .or_default()
                    .insert(row.date, (supply, row.source.as_str()));
            }
        }
        for (coin_id, points) in series {
            let mut prev: Option<(NaiveDate, f64)> = None;
            for (date, (supply, source)) in points {
                if let Some((prev_date, prev_supply)) = prev {
                    if supply < prev_supply {
                        let key = RecordKey {
                            date,
                            coin_id: coin_id.to_string(),
                        };
                        let detail = format!(
                            "supply {supply:.0} on {date} below {prev_supply:.0} on {prev_date}"
                        );
                        report.push(Violation {
                            rule: RULE_LOOK_AHEAD,
                            severity: Severity::Error,
                            message: detail.clone(),
                            affected_keys: vec![key.clone()],
                        });
                        errors.push(BiasError::LookAhead {
                            key,
                            source: source.to_string(),
                            detail,
                        });
                    }
                }
                prev = Some((date, supply));
            }
        }
    }

    /// Internally inconsistent ranks are a bias symptom too: they mean rows
    /// were assembled from different snapshots.
    fn check_rank_consistency(&self, table: &RankingTable, report: &mut ValidationReport) {
        for (date, rows) in table.partition_by_date() {
            if let Err(message) = check_rank_consistency(&rows) {
                report.push(Violation {
                    rule: RULE_ORDERING,
                    severity: Severity::Warning,
                    message: format!("{date}: {message}"),
                    affected_keys: Vec::new(),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::{QualityTier, RankingRecord};

    fn record(date: &str, rank: i64, coin_id: &str, market_cap: f64) -> RankingRecord {
        RankingRecord {
            date: date.parse::<NaiveDate>().unwrap(),
            rank,
            coin_id: coin_id.to_string(),
            symbol: Some(coin_id[..2].to_uppercase()),
            name: None,
            market_cap,
            price: 10.0,
            volume_24h: 100.0,
            circulating_supply: None,
            source: "test".to_string(),
            quality_tier: QualityTier::Unverified,
        }
    }

    #[test]
    fn missing_defunct_asset_inside_window_is_survivorship_bias() {
        // 2017-06-01 falls inside BitConnect's active window; a table for
        // that date without it is biased.
        let table = RankingTable::from_rows(vec![
            record("2017-06-01", 1, "bitcoin", 900e9),
            record("2017-06-01", 2, "ethereum", 400e9),
        ]);
        let outcome = BiasDetector::new().check(&table, &ReferenceFacts::builtin());
        assert!(!outcome.clean());
        assert!(outcome.errors.iter().any(|e| matches!(
            e,
            BiasError::Survivorship { coin_id, sources_present, .. }
                if coin_id == "bitconnect" && sources_present == &["test".to_string()]
        )));
    }

    #[test]
    fn one_in_window_record_satisfies_survivorship() {
        // Present on the first in-window date, absent on the second; a
        // single record inside the active window is enough.
        let table = RankingTable::from_rows(vec![
            record("2017-06-01", 1, "bitcoin", 900e9),
            record("2017-06-01", 2, "bitconnect", 2e9),
            record("2017-06-02", 1, "bitcoin", 905e9),
        ]);
        let outcome = BiasDetector::new().check(&table, &ReferenceFacts::builtin());
        assert!(
            outcome.errors.iter().all(|e| !matches!(e, BiasError::Survivorship { .. })),
            "{:?}",
            outcome.errors
        );
    }

    #[test]
    fn present_defunct_asset_passes() {
        let table = RankingTable::from_rows(vec![
            record("2017-06-01", 1, "bitcoin", 900e9),
            record("2017-06-01", 2, "bitconnect", 2e9),
        ]);
        let outcome = BiasDetector::new().check(&table, &ReferenceFacts::builtin());
        assert!(outcome
            .errors
            .iter()
            .all(|e| !matches!(e, BiasError::Survivorship { coin_id, .. } if coin_id == "bitconnect")));
    }

    #[test]
    fn symbol_match_counts_as_present() {
        let mut row = record("2017-06-01", 2, "bcc-listing", 2e9);
        row.symbol = Some("BCC".to_string());
        let table = RankingTable::from_rows(vec![record("2017-06-01", 1, "bitcoin", 900e9), row]);
        let outcome = BiasDetector::new().check(&table, &ReferenceFacts::builtin());
        assert!(outcome
            .errors
            .iter()
            .all(|e| !matches!(e, BiasError::Survivorship { coin_id, .. } if coin_id == "bitconnect")));
    }

    #[test]
    fn window_outside_table_range_is_not_checked() {
        // Present-day table: all builtin defunct windows are in the past.
        let table = RankingTable::from_rows(vec![record("2025-01-01", 1, "bitcoin", 2000e9)]);
        let outcome = BiasDetector::new().check(&table, &ReferenceFacts::builtin());
        assert!(outcome.clean());
    }

    #[test]
    fn supply_outside_checkpoint_bounds_is_look_ahead() {
        // Bitcoin supply on 2017-01-01 was ~16M; 19.5M is a later figure.
        let mut row = record("2017-01-01", 1, "bitcoin", 16e9);
        row.circulating_supply = Some(19.5e6);
        let mut other = record("2017-01-01", 2, "bitconnect", 1e9);
        other.symbol = Some("BCC".to_string());
        let table = RankingTable::from_rows(vec![row, other]);
        let outcome = BiasDetector::new().check(&table, &ReferenceFacts::builtin());
        assert!(outcome.errors.iter().any(|e| matches!(
            e,
            BiasError::LookAhead { key, source, .. }
                if key.coin_id == "bitcoin" && source == "test"
        )));
    }

    #[test]
    fn supply_inside_checkpoint_bounds_passes() {
        let mut row = record("2022-01-01", 1, "bitcoin", 900e9);
        row.circulating_supply = Some(18.95e6);
        let table = RankingTable::from_rows(vec![row]);
        let outcome = BiasDetector::new().check(&table, &ReferenceFacts::builtin());
        assert!(outcome.clean(), "{:?}", outcome.errors);
    }

    #[test]
    fn decreasing_supply_over_time_is_look_ahead() {
        let mut early = record("2025-01-01", 1, "bitcoin", 2000e9);
        early.circulating_supply = Some(19.8e6);
        let mut late = record("2025-06-01", 1, "bitcoin", 2100e9);
        late.circulating_supply = Some(19.7e6);
        let table = RankingTable::from_rows(vec![early, late]);
        let outcome = BiasDetector::new().check(&table, &ReferenceFacts::builtin());
        assert!(outcome.errors.iter().any(|e| matches!(
            e,
            BiasError::LookAhead { key, .. } if key.date == ymd(2025, 6, 1)
        )));
    }

    #[test]
    fn inconsistent_ranks_are_reported_not_fatal() {
        let table = RankingTable::from_rows(vec![
            record("2025-01-01", 1, "bitcoin", 2000e9),
            record("2025-01-01", 3, "ethereum", 400e9),
        ]);
        let outcome = BiasDetector::new().check(&table, &ReferenceFacts::builtin());
        assert!(outcome.clean());
        assert!(outcome
            .report
            .violations()
            .iter()
            .any(|v| v.rule == RULE_ORDERING));
    }
}
