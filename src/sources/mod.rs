//! Upstream data source adapters.

pub mod coingecko;
