//! Rolls stress scores, correlations, events and action outcomes up into
//! ranked recommendations, one per zone and domain with events.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use tracing::debug;

use crate::analyzers::types::{
    Action, ActionStatus, CorrelationResult, Domain, Event, Recommendation, Severity, StressScore,
    ZoneScope, metric_domain,
};
use crate::analyzers::utility::{mean, stddev};
use crate::error::ConfigError;

/// Estimated cost and benefit of one executed action of a given type.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ActionEconomics {
    pub cost: f64,
    pub benefit: f64,
}

impl ActionEconomics {
    pub fn new(cost: f64, benefit: f64) -> Self {
        Self { cost, benefit }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InsightsConfig {
    pub severity_weights: BTreeMap<Severity, f64>,
    /// Multiplies the summed `|r|` of significant correlations touching
    /// the recommendation's zone and domain.
    pub correlation_weight: f64,
    /// Per failed or still pending action.
    pub unresolved_weight: f64,
    /// Multiplies the zone's peak composite stress scaled to [0, 1].
    pub stress_weight: f64,
    /// Recommendations backed by a warning or critical event rank above
    /// this value; info-only ones never exceed it.
    pub actionable_floor: f64,
    pub economics: BTreeMap<String, ActionEconomics>,
    pub default_economics: ActionEconomics,
    pub titles: BTreeMap<Domain, String>,
    pub cross_domain_title: String,
}

impl Default for InsightsConfig {
    fn default() -> Self {
        let economics = [
            ("adjust_signal_timing", 2.0, 5.0),
            ("alert_traffic_police", 1.0, 2.0),
            ("activate_backup_supply", 5.0, 12.0),
            ("dispatch_technician", 2.0, 4.0),
            ("schedule_priority_pickup", 1.5, 3.0),
            ("escalate_to_supervisor", 0.5, 1.5),
            ("assign_senior_officer", 0.5, 1.0),
            ("notify_emergency_response", 3.0, 6.0),
            ("notify_zone_officer", 0.5, 1.0),
            ("log_for_review", 0.1, 0.1),
            ("manual_review", 0.5, 0.5),
        ]
        .into_iter()
        .map(|(t, cost, benefit)| (t.to_string(), ActionEconomics::new(cost, benefit)))
        .collect();

        let titles = BTreeMap::from([
            (Domain::Traffic, "Dynamic Traffic Signals".to_string()),
            (Domain::Energy, "Grid Modernization".to_string()),
            (Domain::Waste, "Smart Bin System".to_string()),
            (Domain::Grievance, "Mobile App for Grievances".to_string()),
        ]);

        Self {
            severity_weights: BTreeMap::from([
                (Severity::Info, 0.5),
                (Severity::Warning, 3.0),
                (Severity::Critical, 10.0),
            ]),
            correlation_weight: 5.0,
            unresolved_weight: 2.0,
            stress_weight: 10.0,
            actionable_floor: 1000.0,
            economics,
            default_economics: ActionEconomics::new(1.0, 1.0),
            titles,
            cross_domain_title: "Integrated Zone Response".to_string(),
        }
    }
}

impl InsightsConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let non_negative = |name: &str, value: f64| {
            if value.is_finite() && value >= 0.0 {
                Ok(())
            } else {
                Err(ConfigError::InvalidThreshold {
                    name: format!("insights.{name}"),
                    reason: format!("must be a finite non-negative number, got {value}"),
                })
            }
        };

        for (severity, weight) in &self.severity_weights {
            non_negative(&format!("severity_weights.{severity}"), *weight)?;
        }
        for severity in [Severity::Warning, Severity::Critical] {
            if self.severity_weight(severity) <= 0.0 {
                return Err(ConfigError::InvalidThreshold {
                    name: format!("insights.severity_weights.{severity}"),
                    reason: "must be greater than zero".into(),
                });
            }
        }
        non_negative("correlation_weight", self.correlation_weight)?;
        non_negative("unresolved_weight", self.unresolved_weight)?;
        non_negative("stress_weight", self.stress_weight)?;

        if !(self.actionable_floor.is_finite() && self.actionable_floor > 0.0) {
            return Err(ConfigError::InvalidThreshold {
                name: "insights.actionable_floor".into(),
                reason: format!("must be positive, got {}", self.actionable_floor),
            });
        }

        for (action_type, e) in self
            .economics
            .iter()
            .map(|(k, v)| (k.as_str(), v))
            .chain(std::iter::once(("default", &self.default_economics)))
        {
            if !(e.cost.is_finite() && e.cost > 0.0) {
                return Err(ConfigError::InvalidThreshold {
                    name: format!("insights.economics.{action_type}.cost"),
                    reason: format!("must be positive, got {}", e.cost),
                });
            }
            non_negative(&format!("economics.{action_type}.benefit"), e.benefit)?;
        }

        Ok(())
    }

    fn severity_weight(&self, severity: Severity) -> f64 {
        self.severity_weights.get(&severity).copied().unwrap_or(0.0)
    }

    fn economics_for(&self, action_type: &str) -> ActionEconomics {
        self.economics
            .get(action_type)
            .copied()
            .unwrap_or(self.default_economics)
    }

    fn title_for(&self, domain: Option<Domain>) -> &str {
        domain
            .and_then(|d| self.titles.get(&d))
            .map(String::as_str)
            .unwrap_or(&self.cross_domain_title)
    }
}

/// Composite stress of one zone over the analysed window.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneRank {
    pub zone_id: String,
    pub mean_composite: f64,
    pub stddev_composite: f64,
    pub peak_composite: f64,
    pub periods: usize,
}

fn correlation_magnitude(
    correlations: &[CorrelationResult],
    zone_id: &str,
    domain: Option<Domain>,
) -> f64 {
    correlations
        .iter()
        .filter(|c| c.significance_flag)
        .filter(|c| match &c.zone_scope {
            ZoneScope::CityWide => true,
            ZoneScope::Zone(z) => z == zone_id,
        })
        .filter(|c| {
            domain.is_none_or(|d| {
                metric_domain(&c.metric_a) == Some(d) || metric_domain(&c.metric_b) == Some(d)
            })
        })
        .filter_map(|c| c.coefficient)
        .map(f64::abs)
        .sum()
}

/// Builds one [`Recommendation`] per `(zone, domain)` that has events,
/// sorted by `priority_rank` descending, then zone, then title.
///
/// The rank is non-decreasing in every input: more or more severe events,
/// stronger significant correlations, more unresolved actions, higher
/// stress. Recommendations backed only by info events always rank below
/// any backed by a warning or critical event.
#[tracing::instrument(skip_all, fields(events = events.len(), actions = actions.len()))]
pub fn aggregate(
    stress_scores: &[StressScore],
    correlations: &[CorrelationResult],
    events: &[Event],
    actions: &[Action],
    config: &InsightsConfig,
) -> Vec<Recommendation> {
    let mut groups: BTreeMap<(&str, Option<Domain>), Vec<&Event>> = BTreeMap::new();
    for e in events {
        groups.entry((e.zone_id.as_str(), e.domain)).or_default().push(e);
    }

    let mut actions_by_event: BTreeMap<&str, Vec<&Action>> = BTreeMap::new();
    for a in actions {
        actions_by_event.entry(a.event_id.as_str()).or_default().push(a);
    }

    let mut peak_stress: BTreeMap<&str, f64> = BTreeMap::new();
    for s in stress_scores {
        let peak = peak_stress.entry(s.zone_id.as_str()).or_insert(0.0);
        *peak = peak.max(s.composite_score);
    }

    let mut recommendations: Vec<Recommendation> = groups
        .into_iter()
        .map(|((zone_id, domain), group)| {
            let supporting_events: BTreeSet<String> =
                group.iter().map(|e| e.event_id.clone()).collect();

            let severity_score: f64 = group
                .iter()
                .map(|e| config.severity_weight(e.severity))
                .sum();

            let group_actions: Vec<&Action> = supporting_events
                .iter()
                .filter_map(|id| actions_by_event.get(id.as_str()))
                .flatten()
                .copied()
                .collect();

            let unresolved_actions = group_actions
                .iter()
                .filter(|a| a.status != ActionStatus::Success)
                .count();

            let (cost_estimate, benefit) = group_actions
                .iter()
                .map(|a| config.economics_for(&a.action_type))
                .fold((0.0, 0.0), |(c, b), e| (c + e.cost, b + e.benefit));

            let estimated_roi = if cost_estimate > 0.0 {
                (benefit - cost_estimate) / cost_estimate
            } else {
                0.0
            };

            let stress = peak_stress.get(zone_id).copied().unwrap_or(0.0) / 100.0;

            let score = severity_score
                + config.correlation_weight * correlation_magnitude(correlations, zone_id, domain)
                + config.unresolved_weight * unresolved_actions as f64
                + config.stress_weight * stress;

            let actionable = group.iter().any(|e| e.severity > Severity::Info);
            let priority_rank = if actionable {
                config.actionable_floor + score
            } else {
                score.min(config.actionable_floor)
            };

            Recommendation {
                title: config.title_for(domain).to_string(),
                zone_id: zone_id.to_string(),
                domain,
                supporting_events,
                estimated_roi,
                priority_rank,
                cost_estimate,
                unresolved_actions,
            }
        })
        .collect();

    recommendations.sort_by(|a, b| {
        b.priority_rank
            .total_cmp(&a.priority_rank)
            .then_with(|| a.zone_id.cmp(&b.zone_id))
            .then_with(|| a.title.cmp(&b.title))
    });

    debug!(recommendations = recommendations.len(), "Recommendations ranked");
    recommendations
}

/// Zones ordered by mean composite stress, highest first.
pub fn rank_zones(stress_scores: &[StressScore]) -> Vec<ZoneRank> {
    let mut by_zone: BTreeMap<&str, Vec<f64>> = BTreeMap::new();
    for s in stress_scores {
        by_zone
            .entry(s.zone_id.as_str())
            .or_default()
            .push(s.composite_score);
    }

    let mut ranks: Vec<ZoneRank> = by_zone
        .into_iter()
        .map(|(zone_id, scores)| {
            let avg = mean(&scores);
            ZoneRank {
                zone_id: zone_id.to_string(),
                mean_composite: avg,
                stddev_composite: stddev(&scores, avg),
                peak_composite: scores.iter().copied().fold(0.0, f64::max),
                periods: scores.len(),
            }
        })
        .collect();

    ranks.sort_by(|a, b| {
        b.mean_composite
            .total_cmp(&a.mean_composite)
            .then_with(|| a.zone_id.cmp(&b.zone_id))
    });
    ranks
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::types::{Period, StressBand};
    use chrono::NaiveDate;

    #[test]
    fn test_default_config_is_valid() {
        InsightsConfig::default().validate().unwrap();
    }

    #[test]
    fn test_zero_cost_rejected() {
        let mut config = InsightsConfig::default();
        config
            .economics
            .insert("adjust_signal_timing".into(), ActionEconomics::new(0.0, 5.0));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::InvalidThreshold { .. })
        ));
    }

    #[test]
    fn test_zero_critical_weight_rejected() {
        let mut config = InsightsConfig::default();
        config.severity_weights.insert(Severity::Critical, 0.0);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_extra_critical_event_never_lowers_rank() {
        let config = InsightsConfig::default();
        let base = vec![
            event("TR003", "A", 1, Severity::Warning, Some(Domain::Traffic)),
            event("TR001", "B", 1, Severity::Critical, Some(Domain::Traffic)),
        ];
        let mut more = base.clone();
        more.push(event("TR001", "A", 2, Severity::Critical, Some(Domain::Traffic)));

        let before = rank_of(&aggregate(&[], &[], &base, &[], &config), "A");
        let after = rank_of(&aggregate(&[], &[], &more, &[], &config), "A");
        assert!(after > before);
    }

    #[test]
    fn test_rank_monotonic_in_correlation_and_unresolved() {
        let config = InsightsConfig::default();
        let events = vec![event("TR001", "A", 1, Severity::Critical, Some(Domain::Traffic))];
        let plain = rank_of(&aggregate(&[], &[], &events, &[], &config), "A");

        let corr = vec![CorrelationResult {
            metric_a: "congestion_index".into(),
            metric_b: "energy_kwh".into(),
            zone_scope: ZoneScope::Zone("A".into()),
            coefficient: Some(-0.8),
            sample_size: 20,
            significance_flag: true,
        }];
        let with_corr = rank_of(&aggregate(&[], &corr, &events, &[], &config), "A");
        assert!((with_corr - plain - 5.0 * 0.8).abs() < 1e-9);

        let mut failed = action(&events[0], "adjust_signal_timing");
        failed.status = ActionStatus::Failed;
        let recs = aggregate(&[], &corr, &events, &[failed], &config);
        assert!(rank_of(&recs, "A") > with_corr);
        assert_eq!(recs[0].unresolved_actions, 1);
    }

    #[test]
    fn test_unrelated_correlations_ignored() {
        let config = InsightsConfig::default();
        let events = vec![event("WS001", "A", 1, Severity::Warning, Some(Domain::Waste))];
        let corr = vec![CorrelationResult {
            metric_a: "congestion_index".into(),
            metric_b: "energy_kwh".into(),
            zone_scope: ZoneScope::CityWide,
            coefficient: Some(0.9),
            sample_size: 30,
            significance_flag: true,
        }];

        let plain = rank_of(&aggregate(&[], &[], &events, &[], &config), "A");
        let with_corr = rank_of(&aggregate(&[], &corr, &events, &[], &config), "A");
        assert_eq!(plain, with_corr);
    }

    #[test]
    fn test_info_only_ranked_lowest() {
        let config = InsightsConfig::default();
        let mut events: Vec<Event> = (1..=50)
            .map(|d| event("WS003", "A", d, Severity::Info, Some(Domain::Waste)))
            .collect();
        events.push(event("TR003", "B", 1, Severity::Warning, Some(Domain::Traffic)));

        let recs = aggregate(&[], &[], &events, &[], &config);

        assert_eq!(recs.len(), 2);
        assert_eq!(recs[0].zone_id, "B");
        assert_eq!(recs[1].zone_id, "A");
        assert_eq!(recs[1].supporting_events.len(), 50);
    }

    #[test]
    fn test_cost_and_roi_from_economics_table() {
        let config = InsightsConfig::default();
        let e = event("TR001", "A", 1, Severity::Critical, Some(Domain::Traffic));
        let actions = vec![action(&e, "adjust_signal_timing")];

        let recs = aggregate(&[], &[], &[e], &actions, &config);

        assert_eq!(recs[0].title, "Dynamic Traffic Signals");
        assert_eq!(recs[0].cost_estimate, 2.0);
        assert!((recs[0].estimated_roi - 1.5).abs() < 1e-9);
        assert_eq!(recs[0].unresolved_actions, 0);
    }

    #[test]
    fn test_cross_domain_title() {
        let config = InsightsConfig::default();
        let e = event("XD001", "A", 1, Severity::Critical, None);
        let recs = aggregate(&[], &[], &[e], &[], &config);
        assert_eq!(recs[0].title, "Integrated Zone Response");
        assert_eq!(recs[0].estimated_roi, 0.0);
    }

    #[test]
    fn test_rank_zones_by_mean_stress() {
        let scores = vec![
            stress("A", 1, 20.0),
            stress("A", 2, 40.0),
            stress("B", 1, 90.0),
        ];
        let ranks = rank_zones(&scores);

        assert_eq!(ranks[0].zone_id, "B");
        assert_eq!(ranks[1].zone_id, "A");
        assert_eq!(ranks[1].mean_composite, 30.0);
        assert_eq!(ranks[1].stddev_composite, 10.0);
        assert_eq!(ranks[1].peak_composite, 40.0);
        assert_eq!(ranks[1].periods, 2);
    }

    // Helper functions for tests
    fn period(day: u32) -> Period {
        Period::day(NaiveDate::from_ymd_opt(2024, 1, day).unwrap())
    }

    fn event(rule: &str, zone: &str, day: u32, severity: Severity, domain: Option<Domain>) -> Event {
        let period = period(day);
        Event {
            event_id: format!("{rule}:{zone}:{period}"),
            zone_id: zone.to_string(),
            period,
            severity,
            rule_id: rule.to_string(),
            domain,
            triggering_metrics: vec![],
            message: String::new(),
        }
    }

    fn action(event: &Event, action_type: &str) -> Action {
        let mut a = Action::pending(event, action_type, "test");
        a.complete(ActionStatus::Success, event.period.start(), 100, "ok".into())
            .unwrap();
        a
    }

    fn stress(zone: &str, day: u32, composite: f64) -> StressScore {
        StressScore {
            zone_id: zone.to_string(),
            period: period(day),
            composite_score: composite,
            component_scores: BTreeMap::new(),
            dominant_domain: None,
            band: StressBand::Low,
        }
    }

    fn rank_of(recs: &[Recommendation], zone: &str) -> f64 {
        recs.iter()
            .find(|r| r.zone_id == zone)
            .map(|r| r.priority_rank)
            .unwrap()
    }
}
