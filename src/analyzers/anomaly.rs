//! Hour-of-day congestion bands.
//!
//! Every traffic row is grouped by its `Hour`. An hour's normal band is
//! the mean congestion of that hour ± `sigmas` population standard
//! deviations. A zone-day-hour whose mean congestion leaves its hour's band
//! is an anomaly.

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::analyzers::normalize::{cell, parse_date, parse_hour, parse_number};
use crate::analyzers::types::Period;
use crate::analyzers::utility::{mean, stddev};
use crate::error::ConfigError;
use crate::parser::RawTable;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AnomalyConfig {
    /// Band half-width in standard deviations.
    pub sigmas: f64,
    /// Hours with fewer observations get no band.
    pub min_observations: usize,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            sigmas: 2.0,
            min_observations: 3,
        }
    }
}

impl AnomalyConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(self.sigmas.is_finite() && self.sigmas > 0.0) {
            return Err(ConfigError::InvalidThreshold {
                name: "anomaly.sigmas".into(),
                reason: format!("expected a positive number, got {}", self.sigmas),
            });
        }
        if self.min_observations < 2 {
            return Err(ConfigError::InvalidThreshold {
                name: "anomaly.min_observations".into(),
                reason: format!("expected at least 2, got {}", self.min_observations),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HourlyBand {
    pub hour: u8,
    pub observations: usize,
    pub mean: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CongestionAnomaly {
    pub zone_id: String,
    pub period: Period,
    pub congestion_index: f64,
    pub lower: f64,
    pub upper: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CongestionAnomalies {
    pub bands: Vec<HourlyBand>,
    /// Sorted by zone, then period.
    pub anomalies: Vec<CongestionAnomaly>,
}

/// Builds hourly bands from the raw traffic table and flags the zone
/// hours outside them.
///
/// `congestion_domain` clamps raw values the way snapshots do. `keep`
/// receives each row's zone and date. A table without `Hour` or
/// `Congestion_Index` yields nothing.
pub fn congestion_anomalies(
    table: &RawTable,
    congestion_domain: [f64; 2],
    config: &AnomalyConfig,
    keep: impl Fn(&str, NaiveDate) -> bool,
) -> CongestionAnomalies {
    let (Some(date_idx), Some(hour_idx), Some(zone_idx), Some(value_idx)) = (
        table.column_index("Date"),
        table.column_index("Hour"),
        table.column_index("Zone_Name"),
        table.column_index("Congestion_Index"),
    ) else {
        return CongestionAnomalies::default();
    };
    let [low, high] = congestion_domain;

    let mut by_hour: BTreeMap<u8, Vec<f64>> = BTreeMap::new();
    let mut by_zone_hour: BTreeMap<(String, Period), Vec<f64>> = BTreeMap::new();

    for row in &table.rows {
        let zone = cell(row, zone_idx).trim();
        let (Some(date), Some(hour), Some(value)) = (
            parse_date(cell(row, date_idx)),
            parse_hour(cell(row, hour_idx)),
            parse_number(cell(row, value_idx)),
        ) else {
            continue;
        };
        if zone.is_empty() || !keep(zone, date) {
            continue;
        }

        let value = value.clamp(low, high);
        by_hour.entry(hour).or_default().push(value);
        by_zone_hour
            .entry((zone.to_string(), Period::hourly(date, hour)))
            .or_default()
            .push(value);
    }

    let bands: Vec<HourlyBand> = by_hour
        .into_iter()
        .filter(|(_, values)| values.len() >= config.min_observations)
        .map(|(hour, values)| {
            let m = mean(&values);
            let width = config.sigmas * stddev(&values, m);
            HourlyBand {
                hour,
                observations: values.len(),
                mean: m,
                lower: m - width,
                upper: m + width,
            }
        })
        .collect();

    let band_for = |hour: Option<u8>| hour.and_then(|h| bands.iter().find(|b| b.hour == h));
    let anomalies: Vec<CongestionAnomaly> = by_zone_hour
        .into_iter()
        .filter_map(|((zone_id, period), values)| {
            let band = band_for(period.hour)?;
            let congestion_index = mean(&values);
            (congestion_index < band.lower || congestion_index > band.upper).then(|| {
                CongestionAnomaly {
                    zone_id,
                    period,
                    congestion_index,
                    lower: band.lower,
                    upper: band.upper,
                }
            })
        })
        .collect();

    debug!(
        bands = bands.len(),
        anomalies = anomalies.len(),
        "Congestion bands built"
    );

    CongestionAnomalies { bands, anomalies }
}
