//! End-to-end run: normalize, score, correlate, evaluate rules, decide,
//! aggregate. Every stage reads the previous stage's output and nothing
//! downstream feeds back.

use chrono::NaiveDate;
use serde::Serialize;
use std::collections::BTreeSet;
use tracing::info;

use crate::analyzers::anomaly::{CongestionAnomalies, congestion_anomalies};
use crate::analyzers::correlate::correlate;
use crate::analyzers::decide::{DecisionSummary, decide, summarize};
use crate::analyzers::insights::{ZoneRank, aggregate, rank_zones};
use crate::analyzers::normalize::{NormalizeDiagnostics, normalize};
use crate::analyzers::rules::evaluate;
use crate::analyzers::stress::score;
use crate::analyzers::types::{
    Action, CorrelationResult, Event, Recommendation, StressScore, ZoneSnapshot,
};
use crate::config::PipelineConfig;
use crate::error::ConfigError;
use crate::parser::RawTables;
use crate::stats::{CityStats, DepartmentStats, department_stats};

/// Inclusive date range and zone set applied to normalized snapshots
/// before scoring. Empty `zones` keeps every zone.
#[derive(Debug, Clone, Default)]
pub struct SnapshotFilter {
    pub from: Option<NaiveDate>,
    pub to: Option<NaiveDate>,
    pub zones: BTreeSet<String>,
}

impl SnapshotFilter {
    pub fn matches(&self, snapshot: &ZoneSnapshot) -> bool {
        self.contains(&snapshot.zone_id, snapshot.period.date)
    }

    pub fn contains(&self, zone: &str, date: NaiveDate) -> bool {
        self.from.is_none_or(|from| date >= from)
            && self.to.is_none_or(|to| date <= to)
            && (self.zones.is_empty() || self.zones.contains(zone))
    }
}

/// Everything one run produces.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    pub diagnostics: NormalizeDiagnostics,
    pub city_stats: CityStats,
    pub department_stats: Vec<DepartmentStats>,
    pub congestion_anomalies: CongestionAnomalies,
    pub decision_summary: DecisionSummary,
    pub zone_ranking: Vec<ZoneRank>,
    pub snapshots: Vec<ZoneSnapshot>,
    pub stress_scores: Vec<StressScore>,
    pub correlations: Vec<CorrelationResult>,
    pub events: Vec<Event>,
    pub actions: Vec<Action>,
    pub recommendations: Vec<Recommendation>,
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    config: PipelineConfig,
}

impl Pipeline {
    /// Refuses configuration that fails validation.
    pub fn new(config: PipelineConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self { config })
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    #[tracing::instrument(skip_all)]
    pub fn run(&self, tables: &RawTables, filter: &SnapshotFilter) -> Report {
        let normalized = normalize(tables, &self.config.normalizer);

        let snapshots: Vec<ZoneSnapshot> = normalized
            .snapshots
            .into_iter()
            .filter(|s| filter.matches(s))
            .collect();

        let keep = |zone: &str, date: NaiveDate| filter.contains(zone, date);
        let departments = tables
            .grievance
            .as_ref()
            .map(|t| department_stats(t, keep))
            .unwrap_or_default();
        let anomalies = tables
            .traffic
            .as_ref()
            .map(|t| {
                congestion_anomalies(
                    t,
                    self.config.normalizer.congestion_domain,
                    &self.config.anomaly,
                    keep,
                )
            })
            .unwrap_or_default();

        let mut report = self.analyze(snapshots, normalized.diagnostics);
        report.department_stats = departments;
        report.congestion_anomalies = anomalies;
        report
    }

    /// Runs every stage after normalization over already-built snapshots.
    /// The raw-table roll-ups (departments, congestion bands) stay empty.
    pub fn analyze(&self, snapshots: Vec<ZoneSnapshot>, diagnostics: NormalizeDiagnostics) -> Report {
        let config = &self.config;

        let stress_scores = score(&snapshots, &config.stress);
        let correlations = correlate(&snapshots, &config.correlation.pairs, &config.correlation);
        let events = evaluate(&snapshots, &stress_scores, &config.rules);
        let actions = decide(&events, &config.decision);
        let recommendations = aggregate(
            &stress_scores,
            &correlations,
            &events,
            &actions,
            &config.insights,
        );

        let decision_summary = summarize(&actions);
        let city_stats =
            CityStats::from_snapshots(&snapshots, &events, config.normalizer.congestion_domain[1]);
        let zone_ranking = rank_zones(&stress_scores);

        info!(
            zones = city_stats.zones,
            snapshots = snapshots.len(),
            events = events.len(),
            critical = city_stats.critical_events,
            critical_issues = city_stats.critical_issues,
            actions = actions.len(),
            success_rate = decision_summary.success_rate,
            recommendations = recommendations.len(),
            "Pipeline run complete"
        );

        Report {
            diagnostics,
            city_stats,
            department_stats: Vec::new(),
            congestion_anomalies: CongestionAnomalies::default(),
            decision_summary,
            zone_ranking,
            snapshots,
            stress_scores,
            correlations,
            events,
            actions,
            recommendations,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::types::Period;

    #[test]
    fn test_invalid_config_refused() {
        let mut config = PipelineConfig::default();
        config.decision.default_success_probability = 1.5;
        assert!(Pipeline::new(config).is_err());
    }

    #[test]
    fn test_filter_by_date_and_zone() {
        let filter = SnapshotFilter {
            from: Some(date(2)),
            to: Some(date(3)),
            zones: BTreeSet::from(["A".to_string()]),
        };

        assert!(!filter.matches(&snapshot("A", 1)));
        assert!(filter.matches(&snapshot("A", 2)));
        assert!(filter.matches(&snapshot("A", 3)));
        assert!(!filter.matches(&snapshot("A", 4)));
        assert!(!filter.matches(&snapshot("B", 2)));
    }

    #[test]
    fn test_empty_filter_keeps_everything() {
        assert!(SnapshotFilter::default().matches(&snapshot("Z", 9)));
    }

    #[test]
    fn test_empty_input_gives_empty_report() {
        let pipeline = Pipeline::new(PipelineConfig::default()).unwrap();
        let report = pipeline.run(&RawTables::default(), &SnapshotFilter::default());

        assert!(report.snapshots.is_empty());
        assert!(report.events.is_empty());
        assert!(report.recommendations.is_empty());
        assert_eq!(report.diagnostics.missing_tables.len(), 4);
    }

    // Helper functions for tests
    fn date(day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, day).unwrap()
    }

    fn snapshot(zone: &str, day: u32) -> ZoneSnapshot {
        ZoneSnapshot {
            zone_id: zone.to_string(),
            period: Period::day(date(day)),
            ..Default::default()
        }
    }
}
