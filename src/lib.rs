//! Point-in-time historical market-cap rankings pipeline.
//!
//! Collects paginated market snapshots from upstream sources under strict
//! rate limits, coerces and validates them against a canonical schema,
//! merges multi-source tables with quality tiers, screens the result for
//! survivorship and look-ahead bias, and publishes a versioned SQLite
//! artifact.

pub mod artifact;
pub mod bias;
pub mod checkpoint;
pub mod coerce;
pub mod collector;
pub mod merge;
pub mod rate_limit;
pub mod schema;
pub mod sources;
pub mod table;
pub mod validate;
