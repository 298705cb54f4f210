//! Composite zone stress scoring.
//!
//! Every domain maps to a 0-100 sub-score by min-max scaling its metrics
//! against a reference table. The composite is the weighted mean of the
//! sub-scores that exist, with weights renormalized over present domains.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::analyzers::grade::stress_band;
use crate::analyzers::types::{Domain, StressScore, ZoneSnapshot};
use crate::analyzers::utility::mean;
use crate::error::ConfigError;

const WEIGHT_TOLERANCE: f64 = 1e-6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    HigherIsWorse,
    LowerIsWorse,
}

/// Reference range for one metric: `low` maps to 0 stress and `high` to
/// 100 when higher is worse, the reverse otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricReference {
    pub low: f64,
    pub high: f64,
    pub direction: Direction,
}

impl MetricReference {
    pub fn new(low: f64, high: f64, direction: Direction) -> Self {
        Self {
            low,
            high,
            direction,
        }
    }

    /// Scales `value` into `[0, 100]`.
    pub fn sub_score(&self, value: f64) -> f64 {
        let t = ((value - self.low) / (self.high - self.low)).clamp(0.0, 1.0);
        match self.direction {
            Direction::HigherIsWorse => t * 100.0,
            Direction::LowerIsWorse => (1.0 - t) * 100.0,
        }
    }
}

/// What to do with metrics the normalizer flagged out of range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutOfRangePolicy {
    /// Score the clamped value.
    Clamp,
    /// Leave the metric out of its domain sub-score.
    Ignore,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StressConfig {
    pub weights: BTreeMap<Domain, f64>,
    pub references: BTreeMap<Domain, BTreeMap<String, MetricReference>>,
    pub out_of_range: OutOfRangePolicy,
}

impl Default for StressConfig {
    fn default() -> Self {
        use Direction::*;

        let weights = BTreeMap::from([
            (Domain::Traffic, 0.3),
            (Domain::Energy, 0.25),
            (Domain::Waste, 0.25),
            (Domain::Grievance, 0.2),
        ]);

        let table = |entries: &[(&str, MetricReference)]| -> BTreeMap<String, MetricReference> {
            entries
                .iter()
                .map(|(name, r)| (name.to_string(), *r))
                .collect()
        };

        let references = BTreeMap::from([
            (
                Domain::Traffic,
                table(&[
                    ("congestion_index", MetricReference::new(0.3, 0.8, HigherIsWorse)),
                    ("avg_speed", MetricReference::new(15.0, 40.0, LowerIsWorse)),
                ]),
            ),
            (
                Domain::Energy,
                table(&[
                    ("power_cut_hours", MetricReference::new(0.0, 3.0, HigherIsWorse)),
                    ("min_grid_voltage", MetricReference::new(200.0, 230.0, LowerIsWorse)),
                ]),
            ),
            (
                Domain::Waste,
                table(&[
                    ("missed_pickups", MetricReference::new(0.0, 5.0, HigherIsWorse)),
                    ("bin_fill_pct", MetricReference::new(50.0, 90.0, HigherIsWorse)),
                    ("segregation_pct", MetricReference::new(60.0, 90.0, LowerIsWorse)),
                ]),
            ),
            (
                Domain::Grievance,
                table(&[
                    ("open_grievance_count", MetricReference::new(0.0, 10.0, HigherIsWorse)),
                    ("min_open_sla_days", MetricReference::new(1.0, 7.0, LowerIsWorse)),
                ]),
            ),
        ]);

        Self {
            weights,
            references,
            out_of_range: OutOfRangePolicy::Clamp,
        }
    }
}

impl StressConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (domain, weight) in &self.weights {
            if !weight.is_finite() || *weight < 0.0 {
                return Err(ConfigError::NegativeWeight {
                    domain: *domain,
                    weight: *weight,
                });
            }
        }

        let total: f64 = self.weights.values().sum();
        if (total - 1.0).abs() > WEIGHT_TOLERANCE {
            return Err(ConfigError::WeightsDoNotSumToOne(total));
        }

        for (domain, metrics) in &self.references {
            for (metric, r) in metrics {
                if !(r.low.is_finite() && r.high.is_finite() && r.low < r.high) {
                    return Err(ConfigError::InvalidReferenceRange {
                        domain: *domain,
                        metric: metric.clone(),
                        low: r.low,
                        high: r.high,
                    });
                }
            }
        }

        Ok(())
    }
}

/// Sub-score of one domain, or `None` when the snapshot has no usable
/// metric for it.
fn domain_sub_score(
    snapshot: &ZoneSnapshot,
    references: &BTreeMap<String, MetricReference>,
    policy: OutOfRangePolicy,
) -> Option<f64> {
    let scores: Vec<f64> = references
        .iter()
        .filter(|(metric, _)| {
            !(policy == OutOfRangePolicy::Ignore && snapshot.is_out_of_range(metric))
        })
        .filter_map(|(metric, r)| snapshot.metric(metric).map(|v| r.sub_score(v)))
        .collect();

    (!scores.is_empty()).then(|| mean(&scores))
}

/// Scores a single snapshot.
pub fn score_snapshot(snapshot: &ZoneSnapshot, config: &StressConfig) -> StressScore {
    let mut component_scores = BTreeMap::new();
    for (domain, references) in &config.references {
        if !snapshot.has_domain(*domain) {
            continue;
        }
        if let Some(s) = domain_sub_score(snapshot, references, config.out_of_range) {
            component_scores.insert(*domain, s);
        }
    }

    let present_weight: f64 = component_scores
        .keys()
        .map(|d| config.weights.get(d).copied().unwrap_or(0.0))
        .sum();

    let mut composite = 0.0;
    let mut dominant: Option<(Domain, f64)> = None;

    if present_weight > 0.0 {
        // BTreeMap iterates domains by name, so keeping the first maximum
        // breaks ties toward the lexicographically smallest domain.
        for (domain, sub_score) in &component_scores {
            let weight = config.weights.get(domain).copied().unwrap_or(0.0) / present_weight;
            let contribution = weight * sub_score;
            composite += contribution;

            if dominant.is_none_or(|(_, best)| contribution > best) {
                dominant = Some((*domain, contribution));
            }
        }
    }

    let composite_score = composite.clamp(0.0, 100.0);

    StressScore {
        zone_id: snapshot.zone_id.clone(),
        period: snapshot.period,
        composite_score,
        component_scores,
        dominant_domain: dominant.map(|(d, _)| d),
        band: stress_band(composite_score),
    }
}

/// One [`StressScore`] per snapshot, in input order.
#[tracing::instrument(skip_all, fields(snapshots = snapshots.len()))]
pub fn score(snapshots: &[ZoneSnapshot], config: &StressConfig) -> Vec<StressScore> {
    let scores: Vec<StressScore> = snapshots
        .iter()
        .map(|s| score_snapshot(s, config))
        .collect();

    debug!(scored = scores.len(), "Stress scores computed");
    scores
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::normalize::{NormalizerConfig, normalize};
    use crate::analyzers::types::StressBand;
    use crate::parser::{RawTable, RawTables};

    #[test]
    fn test_default_config_is_valid() {
        StressConfig::default().validate().unwrap();
    }

    #[test]
    fn test_weights_must_sum_to_one() {
        let mut config = StressConfig::default();
        config.weights.insert(Domain::Traffic, 0.5);

        match config.validate() {
            Err(ConfigError::WeightsDoNotSumToOne(total)) => assert!((total - 1.2).abs() < 1e-9),
            other => panic!("expected WeightsDoNotSumToOne, got {other:?}"),
        }
    }

    #[test]
    fn test_inverted_reference_range_rejected() {
        let mut config = StressConfig::default();
        config
            .references
            .get_mut(&Domain::Waste)
            .unwrap()
            .insert("missed_pickups".into(), MetricReference::new(5.0, 0.0, Direction::HigherIsWorse));

        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidReferenceRange { .. })
        ));
    }

    #[test]
    fn test_sub_score_directions() {
        let up = MetricReference::new(0.0, 10.0, Direction::HigherIsWorse);
        assert_eq!(up.sub_score(-3.0), 0.0);
        assert_eq!(up.sub_score(5.0), 50.0);
        assert_eq!(up.sub_score(12.0), 100.0);

        let down = MetricReference::new(200.0, 230.0, Direction::LowerIsWorse);
        assert_eq!(down.sub_score(230.0), 0.0);
        assert_eq!(down.sub_score(190.0), 100.0);
    }

    #[test]
    fn test_missing_domain_is_absent_not_zero() {
        let snapshot = ZoneSnapshot {
            zone_id: "A".into(),
            congestion_index: Some(0.8),
            ..Default::default()
        };
        let s = score_snapshot(&snapshot, &StressConfig::default());

        assert_eq!(s.component_scores.len(), 1);
        assert!(!s.component_scores.contains_key(&Domain::Energy));
        // Only traffic present: its weight renormalizes to 1.
        assert_eq!(s.composite_score, 100.0);
        assert_eq!(s.dominant_domain, Some(Domain::Traffic));
        assert_eq!(s.band, StressBand::Severe);
    }

    #[test]
    fn test_composite_is_renormalized_weighted_sum() {
        let snapshot = ZoneSnapshot {
            zone_id: "A".into(),
            congestion_index: Some(0.55),
            missed_pickups: Some(0),
            ..Default::default()
        };
        let config = StressConfig::default();
        let s = score_snapshot(&snapshot, &config);

        let traffic = s.component_scores[&Domain::Traffic];
        let waste = s.component_scores[&Domain::Waste];
        assert!((traffic - 50.0).abs() < 1e-9);
        assert_eq!(waste, 0.0);

        let expected = (0.3 * traffic + 0.25 * waste) / 0.55;
        assert!((s.composite_score - expected).abs() < 1e-9);
        assert!((0.0..=100.0).contains(&s.composite_score));
    }

    #[test]
    fn test_dominant_tie_breaks_lexicographically() {
        let mut config = StressConfig::default();
        config.weights = BTreeMap::from([
            (Domain::Traffic, 0.25),
            (Domain::Energy, 0.25),
            (Domain::Waste, 0.25),
            (Domain::Grievance, 0.25),
        ]);
        let snapshot = ZoneSnapshot {
            zone_id: "A".into(),
            congestion_index: Some(0.8),
            missed_pickups: Some(5),
            ..Default::default()
        };
        let s = score_snapshot(&snapshot, &config);

        assert_eq!(s.component_scores[&Domain::Traffic], 100.0);
        assert_eq!(s.component_scores[&Domain::Waste], 100.0);
        assert_eq!(s.dominant_domain, Some(Domain::Traffic));
    }

    #[test]
    fn test_ignore_policy_drops_flagged_metric() {
        let mut snapshot = ZoneSnapshot {
            zone_id: "A".into(),
            bin_fill_pct: Some(100.0),
            missed_pickups: Some(0),
            ..Default::default()
        };
        snapshot.out_of_range.insert("bin_fill_pct".into());

        let clamp = score_snapshot(&snapshot, &StressConfig::default());
        assert_eq!(clamp.component_scores[&Domain::Waste], 50.0);

        let config = StressConfig {
            out_of_range: OutOfRangePolicy::Ignore,
            ..Default::default()
        };
        let ignore = score_snapshot(&snapshot, &config);
        assert_eq!(ignore.component_scores[&Domain::Waste], 0.0);
    }

    #[test]
    fn test_ignore_policy_drops_flagged_power_cut() {
        let tables = RawTables {
            energy: Some(RawTable::new(
                &[
                    "Date",
                    "Hour",
                    "Zone_Name",
                    "Feeder_ID",
                    "Energy_Consumption_kWh",
                    "Grid_Voltage",
                    "Power_Cut_Flag",
                ],
                vec![vec!["2024-01-01", "0", "A", "F1", "100", "230", "7"]],
            )),
            ..Default::default()
        };
        let snapshot = &normalize(&tables, &NormalizerConfig::default()).snapshots[0];
        assert_eq!(snapshot.power_cut_hours, Some(1));

        let clamp = score_snapshot(snapshot, &StressConfig::default());
        assert!(clamp.component_scores[&Domain::Energy] > 0.0);

        let config = StressConfig {
            out_of_range: OutOfRangePolicy::Ignore,
            ..Default::default()
        };
        let ignore = score_snapshot(snapshot, &config);
        assert_eq!(ignore.component_scores[&Domain::Energy], 0.0);
    }

    #[test]
    fn test_empty_input() {
        assert!(score(&[], &StressConfig::default()).is_empty());
    }
}
