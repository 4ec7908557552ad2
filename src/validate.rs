//! Rule-based validation of ranking tables.
//!
//! Every rule runs over the whole table and every violation is reported;
//! validation never stops at the first finding. Callers wanting a hard gate
//! use `validate_strict`, which fails when any error-severity violation is
//! present.

use rayon::prelude::*;
use std::collections::HashMap;
use std::fmt;

use crate::schema::SchemaRegistry;
use crate::table::{RankingRecord, RankingTable, RecordKey};

pub const RULE_SCHEMA: &str = "schema";
pub const RULE_DUPLICATE_KEY: &str = "duplicate_key";
pub const RULE_NULL_REQUIRED: &str = "null_required";
pub const RULE_RANGE: &str = "range";
pub const RULE_ORDERING: &str = "ordering";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Violation {
    pub rule: &'static str,
    pub severity: Severity,
    pub message: String,
    pub affected_keys: Vec<RecordKey>,
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}: {}", self.severity, self.rule, self.message)?;
        if !self.affected_keys.is_empty() {
            let shown: Vec<String> = self
                .affected_keys
                .iter()
                .take(5)
                .map(|k| k.to_string())
                .collect();
            write!(f, " ({}", shown.join(", "))?;
            if self.affected_keys.len() > 5 {
                write!(f, ", +{} more", self.affected_keys.len() - 5)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct ValidationReport {
    violations: Vec<Violation>,
    pub rows_checked: usize,
}

impl ValidationReport {
    pub fn new(rows_checked: usize) -> Self {
        Self {
            violations: Vec::new(),
            rows_checked,
        }
    }

    pub fn passed(&self) -> bool {
        !self
            .violations
            .iter()
            .any(|v| v.severity == Severity::Error)
    }

    pub fn violations(&self) -> &[Violation] {
        &self.violations
    }

    pub fn errors(&self) -> impl Iterator<Item = &Violation> {
        self.violations
            .iter()
            .filter(|v| v.severity == Severity::Error)
    }

    pub fn push(&mut self, violation: Violation) {
        self.violations.push(violation);
    }

    pub fn merge(&mut self, other: ValidationReport) {
        self.violations.extend(other.violations);
    }
}

impl fmt::Display for ValidationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.violations.is_empty() {
            return write!(f, "{} rows checked, no violations", self.rows_checked);
        }
        writeln!(
            f,
            "{} rows checked, {} violations:",
            self.rows_checked,
            self.violations.len()
        )?;
        for v in &self.violations {
            writeln!(f, "  {v}")?;
        }
        Ok(())
    }
}

/// Returned by `validate_strict` when error-severity violations exist.
#[derive(Debug)]
pub struct ValidationFailed {
    pub report: ValidationReport,
}

impl fmt::Display for ValidationFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let errors = self.report.errors().count();
        write!(f, "validation failed with {errors} error(s)")
    }
}

impl std::error::Error for ValidationFailed {}

pub struct Validator {
    registry: SchemaRegistry,
}

impl Validator {
    pub fn new(registry: SchemaRegistry) -> Self {
        Self { registry }
    }

    /// Run all rules and collect every violation.
    pub fn validate(&self, table: &RankingTable) -> ValidationReport {
        let mut report = ValidationReport {
            violations: Vec::new(),
            rows_checked: table.len(),
        };
        self.check_schema(table, &mut report);
        self.check_duplicates(table, &mut report);
        self.check_null_required(table, &mut report);
        self.check_ranges(table, &mut report);
        self.check_ordering(table, &mut report);
        report
    }

    pub fn validate_strict(&self, table: &RankingTable) -> Result<ValidationReport, ValidationFailed> {
        let report = self.validate(table);
        if report.passed() {
            Ok(report)
        } else {
            Err(ValidationFailed { report })
        }
    }

    /// Structural conformance: finite numerics and a well-formed identifier.
    /// Type shape itself is guaranteed by construction; what can still go
    /// wrong at this layer is payload content.
    fn check_schema(&self, table: &RankingTable, report: &mut ValidationReport) {
        debug_assert!(self.registry.field("coin_id").is_some());
        let mut bad_numeric = Vec::new();
        let mut bad_id = Vec::new();
        for row in table.rows() {
            let numerics = [
                row.market_cap,
                row.price,
                row.volume_24h,
                row.circulating_supply.unwrap_or(0.0),
            ];
            if numerics.iter().any(|v| !v.is_finite()) {
                bad_numeric.push(row.key());
            }
            if !is_id_slug(&row.coin_id) {
                bad_id.push(row.key());
            }
        }
        if !bad_numeric.is_empty() {
            report.push(Violation {
                rule: RULE_SCHEMA,
                severity: Severity::Error,
                message: "non-finite numeric value".to_string(),
                affected_keys: bad_numeric,
            });
        }
        if !bad_id.is_empty() {
            report.push(Violation {
                rule: RULE_SCHEMA,
                severity: Severity::Error,
                message: "coin_id is not a lowercase identifier slug".to_string(),
                affected_keys: bad_id,
            });
        }
    }

    /// (date, coin_id) must be unique across the table.
    fn check_duplicates(&self, table: &RankingTable, report: &mut ValidationReport) {
        let mut counts: HashMap<RecordKey, usize> = HashMap::new();
        for row in table.rows() {
            *counts.entry(row.key()).or_insert(0) += 1;
        }
        let mut dupes: Vec<RecordKey> =
            counts.into_iter().filter(|(_, n)| *n > 1).map(|(k, _)| k).collect();
        if !dupes.is_empty() {
            dupes.sort();
            report.push(Violation {
                rule: RULE_DUPLICATE_KEY,
                severity: Severity::Error,
                message: "duplicate (date, coin_id) keys".to_string(),
                affected_keys: dupes,
            });
        }
    }

    /// Required text fields must carry content. Required numerics cannot be
    /// absent by construction, so only the strings need checking here.
    fn check_null_required(&self, table: &RankingTable, report: &mut ValidationReport) {
        let empty: Vec<RecordKey> = table
            .rows()
            .iter()
            .filter(|r| r.coin_id.trim().is_empty() || r.source.trim().is_empty())
            .map(|r| r.key())
            .collect();
        if !empty.is_empty() {
            report.push(Violation {
                rule: RULE_NULL_REQUIRED,
                severity: Severity::Error,
                message: "empty value in required field".to_string(),
                affected_keys: empty,
            });
        }
    }

    /// Value-domain checks, parallel per date partition.
    fn check_ranges(&self, table: &RankingTable, report: &mut ValidationReport) {
        let partitions: Vec<_> = table.partition_by_date().into_iter().collect();
        let mut findings: Vec<Violation> = partitions
            .par_iter()
            .flat_map(|(_, rows)| check_ranges_for_date(rows))
            .collect();
        // Parallel collection order is nondeterministic; keep reports stable.
        findings.sort_by(|a, b| {
            a.affected_keys
                .first()
                .cmp(&b.affected_keys.first())
                .then(a.message.cmp(&b.message))
        });
        for v in findings {
            report.push(v);
        }
    }

    fn check_ordering(&self, table: &RankingTable, report: &mut ValidationReport) {
        for (date, rows) in table.partition_by_date() {
            if let Err(message) = check_rank_consistency(&rows) {
                report.push(Violation {
                    rule: RULE_ORDERING,
                    severity: Severity::Error,
                    message: format!("{date}: {message}"),
                    affected_keys: rows.iter().map(|r| r.key()).collect(),
                });
            }
        }
    }
}

fn is_id_slug(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-' || c == '_')
}

fn check_ranges_for_date(rows: &[&RankingRecord]) -> Vec<Violation> {
    let mut violations = Vec::new();
    let mut push = |message: &str, severity: Severity, keys: Vec<RecordKey>| {
        if !keys.is_empty() {
            violations.push(Violation {
                rule: RULE_RANGE,
                severity,
                message: message.to_string(),
                affected_keys: keys,
            });
        }
    };

    let row_count = rows.len() as i64;
    push(
        "rank outside [1, row count for date]",
        Severity::Error,
        rows.iter()
            .filter(|r| r.rank < 1 || r.rank > row_count)
            .map(|r| r.key())
            .collect(),
    );
    // Zero quotes are legitimate for delisted snapshots; only negatives are
    // out of domain.
    push(
        "market_cap must be non-negative",
        Severity::Error,
        rows.iter()
            .filter(|r| r.market_cap < 0.0)
            .map(|r| r.key())
            .collect(),
    );
    push(
        "price must be non-negative",
        Severity::Error,
        rows.iter().filter(|r| r.price < 0.0).map(|r| r.key()).collect(),
    );
    push(
        "volume_24h must be non-negative",
        Severity::Error,
        rows.iter()
            .filter(|r| r.volume_24h < 0.0)
            .map(|r| r.key())
            .collect(),
    );
    // Zero supply exists for pre-mine oddities upstream; flag, don't fail.
    push(
        "circulating_supply should be positive when present",
        Severity::Warning,
        rows.iter()
            .filter(|r| matches!(r.circulating_supply, Some(s) if !(s > 0.0)))
            .map(|r| r.key())
            .collect(),
    );
    violations
}

/// Rank consistency within one date: ranks are dense 1..N and market cap is
/// non-increasing along them. Tie-safe: equal caps at adjacent ranks pass.
pub fn check_rank_consistency(rows: &[&RankingRecord]) -> Result<(), String> {
    let mut sorted: Vec<&&RankingRecord> = rows.iter().collect();
    sorted.sort_by_key(|r| r.rank);
    for (i, row) in sorted.iter().enumerate() {
        let expected = (i + 1) as i64;
        if row.rank != expected {
            return Err(format!(
                "ranks are not dense: expected {expected}, found {} ({})",
                row.rank,
                row.key()
            ));
        }
    }
    for pair in sorted.windows(2) {
        if pair[1].market_cap > pair[0].market_cap {
            return Err(format!(
                "market cap increases from rank {} to rank {}",
                pair[0].rank, pair[1].rank
            ));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::table::QualityTier;
    use chrono::NaiveDate;

    fn record(date: &str, rank: i64, coin_id: &str, market_cap: f64) -> RankingRecord {
        RankingRecord {
            date: date.parse::<NaiveDate>().unwrap(),
            rank,
            coin_id: coin_id.to_string(),
            symbol: Some(coin_id.get(..1).unwrap_or_default().to_string()),
            name: Some(coin_id.to_string()),
            market_cap,
            price: 10.0,
            volume_24h: 100.0,
            circulating_supply: None,
            source: "test".to_string(),
            quality_tier: QualityTier::Unverified,
        }
    }

    fn clean_table() -> RankingTable {
        RankingTable::from_rows(vec![
            record("2022-01-01", 1, "bitcoin", 900e9),
            record("2022-01-01", 2, "ethereum", 400e9),
            record("2022-01-01", 3, "tether", 80e9),
        ])
    }

    fn validator() -> Validator {
        Validator::new(SchemaRegistry::canonical())
    }

    #[test]
    fn clean_table_passes_all_rules() {
        let report = validator().validate(&clean_table());
        assert!(report.passed(), "{report}");
        assert!(report.violations().is_empty());
        assert_eq!(report.rows_checked, 3);
    }

    #[test]
    fn duplicate_keys_are_errors() {
        let mut table = clean_table();
        table.push(record("2022-01-01", 4, "bitcoin", 1e9));
        let report = validator().validate(&table);
        assert!(!report.passed());
        assert!(report
            .violations()
            .iter()
            .any(|v| v.rule == RULE_DUPLICATE_KEY));
    }

    #[test]
    fn bad_coin_id_slug_is_schema_error() {
        let mut table = clean_table();
        table.push(record("2022-01-01", 4, "Bad Coin!", 1e9));
        let report = validator().validate(&table);
        assert!(report.violations().iter().any(|v| v.rule == RULE_SCHEMA));
    }

    #[test]
    fn empty_required_field_is_error() {
        let mut table = clean_table();
        table.push(record("2022-01-01", 4, "", 1e9));
        let report = validator().validate(&table);
        assert!(report
            .violations()
            .iter()
            .any(|v| v.rule == RULE_NULL_REQUIRED));
    }

    #[test]
    fn negative_market_cap_is_range_error() {
        let mut row = record("2022-01-01", 4, "badcap", -5.0);
        row.market_cap = -5.0;
        let mut table = clean_table();
        table.push(row);
        let report = validator().validate(&table);
        assert!(report
            .violations()
            .iter()
            .any(|v| v.rule == RULE_RANGE && v.severity == Severity::Error));
    }

    #[test]
    fn rank_beyond_row_count_is_range_error() {
        let table = RankingTable::from_rows(vec![
            record("2022-01-01", 1, "bitcoin", 900e9),
            record("2022-01-01", 5000, "ethereum", 400e9),
        ]);
        let report = validator().validate(&table);
        assert!(report
            .violations()
            .iter()
            .any(|v| v.rule == RULE_RANGE && v.severity == Severity::Error));
    }

    #[test]
    fn zero_quotes_are_not_range_errors() {
        let mut row = record("2022-01-01", 4, "delisted", 0.0);
        row.price = 0.0;
        row.volume_24h = 0.0;
        let mut table = clean_table();
        table.push(row);
        let report = validator().validate(&table);
        assert!(report
            .violations()
            .iter()
            .all(|v| v.rule != RULE_RANGE || v.severity != Severity::Error));
    }

    #[test]
    fn zero_supply_is_warning_only() {
        let mut row = record("2022-01-01", 4, "oddsupply", 1e9);
        row.circulating_supply = Some(0.0);
        let mut table = clean_table();
        table.push(row);
        let report = validator().validate(&table);
        assert!(report.passed());
        assert!(report
            .violations()
            .iter()
            .any(|v| v.rule == RULE_RANGE && v.severity == Severity::Warning));
    }

    #[test]
    fn rank_gap_is_ordering_error() {
        let table = RankingTable::from_rows(vec![
            record("2022-01-01", 1, "bitcoin", 900e9),
            record("2022-01-01", 3, "ethereum", 400e9),
        ]);
        let report = validator().validate(&table);
        assert!(report.violations().iter().any(|v| v.rule == RULE_ORDERING));
    }

    #[test]
    fn cap_inversion_is_ordering_error() {
        let table = RankingTable::from_rows(vec![
            record("2022-01-01", 1, "bitcoin", 400e9),
            record("2022-01-01", 2, "ethereum", 900e9),
        ]);
        let report = validator().validate(&table);
        assert!(report.violations().iter().any(|v| v.rule == RULE_ORDERING));
    }

    #[test]
    fn equal_caps_at_adjacent_ranks_pass() {
        let table = RankingTable::from_rows(vec![
            record("2022-01-01", 1, "alpha", 100.0),
            record("2022-01-01", 2, "beta", 100.0),
        ]);
        assert!(validator().validate(&table).passed());
    }

    #[test]
    fn ordering_is_checked_per_date() {
        // Both dates are individually consistent.
        let table = RankingTable::from_rows(vec![
            record("2022-01-01", 1, "bitcoin", 900e9),
            record("2022-01-02", 1, "bitcoin", 100e9),
            record("2022-01-02", 2, "ethereum", 50e9),
        ]);
        assert!(validator().validate(&table).passed());
    }

    #[test]
    fn multiple_violations_all_reported() {
        let mut table = clean_table();
        table.push(record("2022-01-01", 4, "bitcoin", 1e9)); // dup
        table.push(record("2022-01-01", 6, "GapCoin", -1.0)); // slug + range + gap
        let report = validator().validate(&table);
        let rules: Vec<&str> = report.violations().iter().map(|v| v.rule).collect();
        assert!(rules.contains(&RULE_DUPLICATE_KEY));
        assert!(rules.contains(&RULE_SCHEMA));
        assert!(rules.contains(&RULE_RANGE));
        assert!(rules.contains(&RULE_ORDERING));
    }

    #[test]
    fn strict_validation_errors_on_failure() {
        let mut table = clean_table();
        table.push(record("2022-01-01", 4, "bitcoin", 1e9));
        assert!(validator().validate_strict(&table).is_err());
        assert!(validator().validate_strict(&clean_table()).is_ok());
    }
}
