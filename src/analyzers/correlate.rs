//! Pairwise correlation of snapshot metrics.
//!
//! Series are aligned on shared `(zone, period)` keys: a snapshot only
//! contributes a point when both metrics are present in it. Results state
//! association only.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::analyzers::types::{CorrelationResult, ZoneScope, ZoneSnapshot};
use crate::analyzers::utility::pearson;
use crate::error::ConfigError;

/// Smallest sample for which a coefficient is ever reported.
pub const MIN_DEFINED_SAMPLES: usize = 3;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CorrelationConfig {
    pub pairs: Vec<(String, String)>,
    /// Below this many aligned points the coefficient is `None`.
    pub min_samples: usize,
    /// `|r|` must exceed this for a result to be significant.
    pub significance_threshold: f64,
    /// Sample size must exceed this for a result to be significant.
    pub significance_min_samples: usize,
    /// Also correlate within each zone, not only city-wide.
    pub per_zone: bool,
}

impl Default for CorrelationConfig {
    fn default() -> Self {
        let metrics = [
            "congestion_index",
            "energy_kwh",
            "bin_fill_pct",
            "open_grievance_count",
        ];
        let mut pairs = Vec::new();
        for (i, a) in metrics.iter().enumerate() {
            for b in &metrics[i + 1..] {
                pairs.push((a.to_string(), b.to_string()));
            }
        }

        Self {
            pairs,
            min_samples: MIN_DEFINED_SAMPLES,
            significance_threshold: 0.5,
            significance_min_samples: 10,
            per_zone: true,
        }
    }
}

impl CorrelationConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_samples < MIN_DEFINED_SAMPLES {
            return Err(ConfigError::InvalidThreshold {
                name: "correlation.min_samples".into(),
                reason: format!("must be at least {MIN_DEFINED_SAMPLES}, got {}", self.min_samples),
            });
        }
        if !(0.0..=1.0).contains(&self.significance_threshold) {
            return Err(ConfigError::InvalidThreshold {
                name: "correlation.significance_threshold".into(),
                reason: format!("must be within [0, 1], got {}", self.significance_threshold),
            });
        }
        Ok(())
    }
}

fn aligned_series<'a>(
    snapshots: impl Iterator<Item = &'a ZoneSnapshot>,
    metric_a: &str,
    metric_b: &str,
) -> (Vec<f64>, Vec<f64>) {
    snapshots
        .filter_map(|s| Some((s.metric(metric_a)?, s.metric(metric_b)?)))
        .unzip()
}

/// Correlates one pair of metrics over the given snapshots.
pub fn correlate_pair<'a>(
    snapshots: impl Iterator<Item = &'a ZoneSnapshot>,
    metric_a: &str,
    metric_b: &str,
    zone_scope: ZoneScope,
    config: &CorrelationConfig,
) -> CorrelationResult {
    let (xs, ys) = aligned_series(snapshots, metric_a, metric_b);
    let sample_size = xs.len();

    let coefficient = if sample_size < config.min_samples.max(MIN_DEFINED_SAMPLES) {
        None
    } else {
        pearson(&xs, &ys)
    };

    let significance_flag = coefficient.is_some_and(|r| {
        r.abs() > config.significance_threshold && sample_size > config.significance_min_samples
    });

    CorrelationResult {
        metric_a: metric_a.to_string(),
        metric_b: metric_b.to_string(),
        zone_scope,
        coefficient,
        sample_size,
        significance_flag,
    }
}

/// Correlates every requested pair city-wide and, when enabled, per zone.
///
/// Output order: for each pair, the city-wide result then one result per
/// zone in zone order.
#[tracing::instrument(skip_all, fields(snapshots = snapshots.len(), pairs = metric_pairs.len()))]
pub fn correlate(
    snapshots: &[ZoneSnapshot],
    metric_pairs: &[(String, String)],
    config: &CorrelationConfig,
) -> Vec<CorrelationResult> {
    let mut by_zone: BTreeMap<&str, Vec<&ZoneSnapshot>> = BTreeMap::new();
    if config.per_zone {
        for s in snapshots {
            by_zone.entry(s.zone_id.as_str()).or_default().push(s);
        }
    }

    let mut results = Vec::new();
    for (a, b) in metric_pairs {
        results.push(correlate_pair(
            snapshots.iter(),
            a,
            b,
            ZoneScope::CityWide,
            config,
        ));

        for (zone, zone_snapshots) in &by_zone {
            results.push(correlate_pair(
                zone_snapshots.iter().copied(),
                a,
                b,
                ZoneScope::Zone(zone.to_string()),
                config,
            ));
        }
    }

    debug!(
        results = results.len(),
        significant = results.iter().filter(|r| r.significance_flag).count(),
        "Correlations computed"
    );
    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::types::Period;
    use chrono::NaiveDate;

    #[test]
    fn test_fewer_than_three_points_is_null() {
        let snapshots = series("A", &[(0.1, 10.0), (0.9, 90.0)]);
        let r = correlate_pair(
            snapshots.iter(),
            "congestion_index",
            "energy_kwh",
            ZoneScope::CityWide,
            &CorrelationConfig::default(),
        );

        assert_eq!(r.sample_size, 2);
        assert_eq!(r.coefficient, None);
        assert!(!r.significance_flag);
    }

    #[test]
    fn test_strong_but_small_sample_not_significant() {
        let points: Vec<(f64, f64)> = (0..5).map(|i| (i as f64, 2.0 * i as f64)).collect();
        let snapshots = series("A", &points);
        let r = correlate_pair(
            snapshots.iter(),
            "congestion_index",
            "energy_kwh",
            ZoneScope::CityWide,
            &CorrelationConfig::default(),
        );

        assert!((r.coefficient.unwrap() - 1.0).abs() < 1e-12);
        assert!(!r.significance_flag);
    }

    #[test]
    fn test_significant_when_large_and_strong() {
        let points: Vec<(f64, f64)> = (0..12)
            .map(|i| (i as f64, 100.0 - 3.0 * i as f64))
            .collect();
        let snapshots = series("A", &points);
        let r = correlate_pair(
            snapshots.iter(),
            "congestion_index",
            "energy_kwh",
            ZoneScope::CityWide,
            &CorrelationConfig::default(),
        );

        assert_eq!(r.sample_size, 12);
        assert!(r.coefficient.unwrap() < -0.99);
        assert!(r.significance_flag);
    }

    #[test]
    fn test_only_aligned_points_counted() {
        let mut snapshots = series("A", &[(0.1, 1.0), (0.2, 2.0), (0.3, 3.0)]);
        snapshots.push(ZoneSnapshot {
            zone_id: "A".into(),
            period: Period::day(NaiveDate::from_ymd_opt(2024, 2, 1).unwrap()),
            congestion_index: Some(0.9),
            ..Default::default()
        });
        let r = correlate_pair(
            snapshots.iter(),
            "congestion_index",
            "energy_kwh",
            ZoneScope::CityWide,
            &CorrelationConfig::default(),
        );
        assert_eq!(r.sample_size, 3);
    }

    #[test]
    fn test_per_zone_scopes() {
        let mut snapshots = series("A", &[(0.1, 1.0), (0.2, 2.0), (0.3, 3.0)]);
        snapshots.extend(series("B", &[(0.3, 1.0), (0.2, 2.0), (0.1, 3.0)]));
        let config = CorrelationConfig::default();
        let pairs = vec![("congestion_index".to_string(), "energy_kwh".to_string())];

        let results = correlate(&snapshots, &pairs, &config);

        assert_eq!(results.len(), 3);
        assert_eq!(results[0].zone_scope, ZoneScope::CityWide);
        assert_eq!(results[0].sample_size, 6);
        assert_eq!(results[1].zone_scope, ZoneScope::Zone("A".into()));
        assert!(results[1].coefficient.unwrap() > 0.99);
        assert_eq!(results[2].zone_scope, ZoneScope::Zone("B".into()));
        assert!(results[2].coefficient.unwrap() < -0.99);
    }

    #[test]
    fn test_min_samples_below_three_rejected() {
        let config = CorrelationConfig {
            min_samples: 2,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    // Helper functions for tests
    fn series(zone: &str, points: &[(f64, f64)]) -> Vec<ZoneSnapshot> {
        let start = NaiveDate::from_ymd_opt(2024, 1, 1).unwrap();
        points
            .iter()
            .enumerate()
            .map(|(i, (congestion, energy))| ZoneSnapshot {
                zone_id: zone.to_string(),
                period: Period::day(start + chrono::Days::new(i as u64)),
                congestion_index: Some(*congestion),
                energy_kwh: Some(*energy),
                ..Default::default()
            })
            .collect()
    }
}
