//! Declarative rule engine.
//!
//! Rules are records evaluated uniformly against each zone/period. A rule
//! that references a metric the zone does not have is skipped, so absent
//! data never produces an event. Every match yields its own [`Event`].

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::debug;

use crate::analyzers::types::{
    Domain, Event, Period, Severity, StressScore, TriggeringMetric, ZoneSnapshot,
};
use crate::error::ConfigError;

/// Metric name resolving to the composite stress score.
pub const STRESS_COMPOSITE: &str = "stress_composite";
/// Prefix resolving to a domain sub-score, e.g. `stress_traffic`.
pub const STRESS_PREFIX: &str = "stress_";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Ne,
}

impl Operator {
    pub fn apply(&self, value: f64, threshold: f64) -> bool {
        match self {
            Operator::Gt => value > threshold,
            Operator::Gte => value >= threshold,
            Operator::Lt => value < threshold,
            Operator::Lte => value <= threshold,
            Operator::Eq => value == threshold,
            Operator::Ne => value != threshold,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Condition {
    Threshold {
        metric: String,
        operator: Operator,
        threshold: f64,
    },
    /// Inclusive on both ends.
    Range { metric: String, min: f64, max: f64 },
    All { conditions: Vec<Condition> },
    Any { conditions: Vec<Condition> },
}

impl Condition {
    pub fn threshold(metric: &str, operator: Operator, threshold: f64) -> Self {
        Condition::Threshold {
            metric: metric.to_string(),
            operator,
            threshold,
        }
    }

    pub fn range(metric: &str, min: f64, max: f64) -> Self {
        Condition::Range {
            metric: metric.to_string(),
            min,
            max,
        }
    }

    /// `Some(matched)` when every metric needed to decide is present,
    /// `None` otherwise. Metrics read are appended to `used`.
    fn evaluate(&self, ctx: &RuleContext<'_>, used: &mut Vec<TriggeringMetric>) -> Option<bool> {
        match self {
            Condition::Threshold {
                metric,
                operator,
                threshold,
            } => {
                let value = ctx.read(metric, used)?;
                Some(operator.apply(value, *threshold))
            }
            Condition::Range { metric, min, max } => {
                let value = ctx.read(metric, used)?;
                Some(*min <= value && value <= *max)
            }
            Condition::All { conditions } => {
                let results: Vec<Option<bool>> =
                    conditions.iter().map(|c| c.evaluate(ctx, used)).collect();
                if results.contains(&Some(false)) {
                    Some(false)
                } else if results.contains(&None) {
                    None
                } else {
                    Some(true)
                }
            }
            Condition::Any { conditions } => {
                // Only members that matched contribute triggering metrics.
                let mut matched = false;
                let mut undecided = false;
                for c in conditions {
                    let mut read = Vec::new();
                    match c.evaluate(ctx, &mut read) {
                        Some(true) => {
                            matched = true;
                            for m in read {
                                if !used.iter().any(|u| u.metric == m.metric) {
                                    used.push(m);
                                }
                            }
                        }
                        Some(false) => {}
                        None => undecided = true,
                    }
                }
                if matched {
                    Some(true)
                } else if undecided {
                    None
                } else {
                    Some(false)
                }
            }
        }
    }

    fn validate(&self, rule_id: &str) -> Result<(), ConfigError> {
        match self {
            Condition::Threshold { threshold, .. } if !threshold.is_finite() => {
                Err(ConfigError::InvalidThreshold {
                    name: format!("rules.{rule_id}"),
                    reason: "threshold must be finite".into(),
                })
            }
            Condition::Range { min, max, .. } if !(min <= max) => Err(ConfigError::InvalidThreshold {
                name: format!("rules.{rule_id}"),
                reason: format!("range needs min <= max, got [{min}, {max}]"),
            }),
            Condition::All { conditions } | Condition::Any { conditions } => {
                if conditions.is_empty() {
                    return Err(ConfigError::InvalidThreshold {
                        name: format!("rules.{rule_id}"),
                        reason: "composite condition has no members".into(),
                    });
                }
                conditions.iter().try_for_each(|c| c.validate(rule_id))
            }
            _ => Ok(()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Rule {
    pub rule_id: String,
    /// `None` for rules spanning several domains.
    #[serde(default)]
    pub domain: Option<Domain>,
    pub condition: Condition,
    pub severity: Severity,
    /// Supports `{zone}`, `{period}` and `{<metric name>}` placeholders.
    pub message_template: String,
}

impl Rule {
    pub fn new(
        rule_id: &str,
        domain: Option<Domain>,
        condition: Condition,
        severity: Severity,
        message_template: &str,
    ) -> Self {
        Self {
            rule_id: rule_id.to_string(),
            domain,
            condition,
            severity,
            message_template: message_template.to_string(),
        }
    }

    /// Evaluates the rule for one zone/period, returning the event if it
    /// matches.
    pub fn evaluate(&self, snapshot: &ZoneSnapshot, stress: Option<&StressScore>) -> Option<Event> {
        let ctx = RuleContext { snapshot, stress };
        let mut used = Vec::new();

        if self.condition.evaluate(&ctx, &mut used) != Some(true) {
            return None;
        }

        let message = render_message(
            &self.message_template,
            &snapshot.zone_id,
            &snapshot.period,
            &used,
        );

        Some(Event {
            event_id: format!("{}:{}:{}", self.rule_id, snapshot.zone_id, snapshot.period),
            zone_id: snapshot.zone_id.clone(),
            period: snapshot.period,
            severity: self.severity,
            rule_id: self.rule_id.clone(),
            domain: self.domain,
            triggering_metrics: used,
            message,
        })
    }
}

/// Rule inputs for one zone/period: its snapshot and, if scored, its
/// stress score.
struct RuleContext<'a> {
    snapshot: &'a ZoneSnapshot,
    stress: Option<&'a StressScore>,
}

impl RuleContext<'_> {
    fn metric(&self, name: &str) -> Option<f64> {
        if name == STRESS_COMPOSITE {
            return self.stress.map(|s| s.composite_score);
        }
        if let Some(domain) = name.strip_prefix(STRESS_PREFIX) {
            return self.stress.and_then(|s| {
                s.component_scores
                    .iter()
                    .find(|(d, _)| d.as_str() == domain)
                    .map(|(_, v)| *v)
            });
        }
        self.snapshot.metric(name)
    }

    fn read(&self, name: &str, used: &mut Vec<TriggeringMetric>) -> Option<f64> {
        let value = self.metric(name)?;
        if !used.iter().any(|m| m.metric == name) {
            used.push(TriggeringMetric {
                metric: name.to_string(),
                value,
            });
        }
        Some(value)
    }
}

fn render_message(
    template: &str,
    zone: &str,
    period: &Period,
    metrics: &[TriggeringMetric],
) -> String {
    let mut message = template
        .replace("{zone}", zone)
        .replace("{period}", &period.to_string());
    for m in metrics {
        message = message.replace(&format!("{{{}}}", m.metric), &format_value(m.value));
    }
    message
}

fn format_value(value: f64) -> String {
    if value.fract() == 0.0 {
        format!("{value:.0}")
    } else {
        format!("{value:.2}")
    }
}

/// Checks ids are unique and every condition is well formed.
pub fn validate_rules(rules: &[Rule]) -> Result<(), ConfigError> {
    let mut seen = HashSet::new();
    for rule in rules {
        if !seen.insert(rule.rule_id.as_str()) {
            return Err(ConfigError::DuplicateRuleId(rule.rule_id.clone()));
        }
        rule.condition.validate(&rule.rule_id)?;
    }
    Ok(())
}

/// Evaluates every rule against every snapshot.
///
/// Events come out ordered by zone, then period, then rule declaration
/// order. Identical input always yields identical events.
#[tracing::instrument(skip_all, fields(snapshots = snapshots.len(), rules = rules.len()))]
pub fn evaluate(
    snapshots: &[ZoneSnapshot],
    stress_scores: &[StressScore],
    rules: &[Rule],
) -> Vec<Event> {
    let stress_by_key: BTreeMap<(&str, Period), &StressScore> = stress_scores
        .iter()
        .map(|s| ((s.zone_id.as_str(), s.period), s))
        .collect();

    let mut ordered: Vec<&ZoneSnapshot> = snapshots.iter().collect();
    ordered.sort_by(|a, b| (&a.zone_id, a.period).cmp(&(&b.zone_id, b.period)));

    let mut events = Vec::new();
    for snapshot in ordered {
        let stress = stress_by_key
            .get(&(snapshot.zone_id.as_str(), snapshot.period))
            .copied();
        events.extend(rules.iter().filter_map(|r| r.evaluate(snapshot, stress)));
    }

    debug!(
        events = events.len(),
        critical = events.iter().filter(|e| e.severity == Severity::Critical).count(),
        "Rules evaluated"
    );
    events
}

/// Rule table applied when the configuration does not supply one.
pub fn default_rules() -> Vec<Rule> {
    use Operator::*;
    use Severity::*;

    vec![
        Rule::new(
            "TR001",
            Some(Domain::Traffic),
            Condition::threshold("congestion_index", Gt, 0.8),
            Critical,
            "Severe congestion in {zone} on {period}: index {congestion_index}",
        ),
        Rule::new(
            "TR002",
            Some(Domain::Traffic),
            Condition::range("congestion_index", 0.5, 0.8),
            Warning,
            "Moderate congestion in {zone} on {period}: index {congestion_index}",
        ),
        Rule::new(
            "TR003",
            Some(Domain::Traffic),
            Condition::threshold("avg_speed", Lt, 20.0),
            Warning,
            "Average speed in {zone} down to {avg_speed} km/h",
        ),
        Rule::new(
            "EN001",
            Some(Domain::Energy),
            Condition::threshold("power_cut_hours", Gt, 0.0),
            Critical,
            "Power outage in {zone} on {period}: {power_cut_hours} hour(s) affected",
        ),
        Rule::new(
            "EN002",
            Some(Domain::Energy),
            Condition::threshold("min_grid_voltage", Lt, 200.0),
            Critical,
            "Critical grid voltage in {zone}: {min_grid_voltage} V",
        ),
        Rule::new(
            "EN003",
            Some(Domain::Energy),
            Condition::All {
                conditions: vec![
                    Condition::threshold("min_grid_voltage", Gte, 200.0),
                    Condition::threshold("min_grid_voltage", Lt, 220.0),
                ],
            },
            Warning,
            "Low grid voltage in {zone}: {min_grid_voltage} V",
        ),
        Rule::new(
            "WS001",
            Some(Domain::Waste),
            Condition::threshold("bin_fill_pct", Gt, 85.0),
            Warning,
            "Bins {bin_fill_pct}% full in {zone}",
        ),
        Rule::new(
            "WS002",
            Some(Domain::Waste),
            Condition::threshold("missed_pickups", Gt, 2.0),
            Warning,
            "{missed_pickups} missed pickups in {zone} on {period}",
        ),
        Rule::new(
            "WS003",
            Some(Domain::Waste),
            Condition::threshold("segregation_pct", Lt, 75.0),
            Info,
            "Segregation efficiency in {zone} at {segregation_pct}%",
        ),
        Rule::new(
            "GR001",
            Some(Domain::Grievance),
            Condition::threshold("min_open_sla_days", Lte, 1.0),
            Critical,
            "SLA breach imminent in {zone}: open ticket with {min_open_sla_days} day(s) left",
        ),
        Rule::new(
            "GR002",
            Some(Domain::Grievance),
            Condition::All {
                conditions: vec![
                    Condition::threshold("min_open_sla_days", Gt, 1.0),
                    Condition::threshold("min_open_sla_days", Lte, 2.0),
                ],
            },
            Warning,
            "SLA at risk in {zone}: open ticket with {min_open_sla_days} day(s) left",
        ),
        Rule::new(
            "XD001",
            None,
            Condition::threshold(STRESS_COMPOSITE, Gte, 75.0),
            Critical,
            "Multi-domain stress in {zone} on {period}: composite {stress_composite}",
        ),
        Rule::new(
            "XD002",
            None,
            Condition::All {
                conditions: vec![
                    Condition::threshold(STRESS_COMPOSITE, Gte, 50.0),
                    Condition::threshold(STRESS_COMPOSITE, Lt, 75.0),
                ],
            },
            Warning,
            "Elevated stress in {zone} on {period}: composite {stress_composite}",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzers::types::StressBand;
    use Operator::Gt;
    use chrono::NaiveDate;

    #[test]
    fn test_default_rules_are_valid() {
        validate_rules(&default_rules()).unwrap();
    }

    #[test]
    fn test_duplicate_rule_id_rejected() {
        let mut rules = default_rules();
        rules.push(rules[0].clone());
        assert!(matches!(
            validate_rules(&rules),
            Err(ConfigError::DuplicateRuleId(id)) if id == "TR001"
        ));
    }

    #[test]
    fn test_threshold_match_emits_event() {
        let s = snapshot("A", |s| s.congestion_index = Some(0.9));
        let events = evaluate(&[s], &[], &default_rules());

        assert_eq!(events.len(), 1);
        let e = &events[0];
        assert_eq!(e.rule_id, "TR001");
        assert_eq!(e.severity, Severity::Critical);
        assert_eq!(e.event_id, "TR001:A:2024-01-01");
        assert_eq!(e.triggering_metrics[0].metric, "congestion_index");
        assert_eq!(e.message, "Severe congestion in A on 2024-01-01: index 0.90");
    }

    #[test]
    fn test_missing_metric_skips_rule() {
        let s = snapshot("A", |s| s.bin_fill_pct = Some(50.0));
        let events = evaluate(&[s], &[], &default_rules());
        assert!(events.is_empty());
    }

    #[test]
    fn test_multiple_matches_are_not_merged() {
        let s = snapshot("A", |s| {
            s.congestion_index = Some(0.95);
            s.avg_speed = Some(12.0);
            s.missed_pickups = Some(4);
        });
        let events = evaluate(&[s], &[], &default_rules());
        let ids: Vec<&str> = events.iter().map(|e| e.rule_id.as_str()).collect();

        assert_eq!(ids, vec!["TR001", "TR003", "WS002"]);
    }

    #[test]
    fn test_stress_metrics_resolve() {
        let s = snapshot("A", |s| s.congestion_index = Some(0.2));
        let stress = StressScore {
            zone_id: "A".into(),
            period: s.period,
            composite_score: 80.0,
            component_scores: BTreeMap::from([(Domain::Traffic, 80.0)]),
            dominant_domain: Some(Domain::Traffic),
            band: StressBand::Severe,
        };
        let rules = vec![
            Rule::new(
                "S1",
                None,
                Condition::threshold("stress_traffic", Gt, 70.0),
                Severity::Warning,
                "{stress_traffic}",
            ),
            Rule::new(
                "S2",
                None,
                Condition::threshold("stress_energy", Gt, 0.0),
                Severity::Warning,
                "",
            ),
        ];

        let events = evaluate(&[s], &[stress], &rules);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "80");
    }

    #[test]
    fn test_composite_conditions_with_partial_data() {
        let s = snapshot("A", |s| s.congestion_index = Some(0.9));
        let any = Rule::new(
            "ANY",
            None,
            Condition::Any {
                conditions: vec![
                    Condition::threshold("congestion_index", Gt, 0.8),
                    Condition::threshold("energy_kwh", Gt, 10.0),
                ],
            },
            Severity::Info,
            "",
        );
        let all = Rule::new(
            "ALL",
            None,
            Condition::All {
                conditions: vec![
                    Condition::threshold("congestion_index", Gt, 0.8),
                    Condition::threshold("energy_kwh", Gt, 10.0),
                ],
            },
            Severity::Info,
            "",
        );

        assert!(any.evaluate(&s, None).is_some());
        assert!(all.evaluate(&s, None).is_none());
    }

    #[test]
    fn test_any_reports_only_matching_members() {
        let s = snapshot("A", |s| {
            s.congestion_index = Some(0.3);
            s.missed_pickups = Some(9);
        });
        let rule = Rule::new(
            "ANY",
            None,
            Condition::Any {
                conditions: vec![
                    Condition::threshold("congestion_index", Gt, 0.8),
                    Condition::threshold("missed_pickups", Gt, 5.0),
                ],
            },
            Severity::Warning,
            "",
        );

        let event = rule.evaluate(&s, None).unwrap();
        let metrics: Vec<&str> = event
            .triggering_metrics
            .iter()
            .map(|m| m.metric.as_str())
            .collect();
        assert_eq!(metrics, vec!["missed_pickups"]);
    }

    #[test]
    fn test_evaluation_is_idempotent() {
        let snapshots = vec![
            snapshot("B", |s| s.power_cut_hours = Some(2)),
            snapshot("A", |s| {
                s.congestion_index = Some(0.6);
                s.min_open_sla_days = Some(1.0);
            }),
        ];
        let rules = default_rules();

        let first = evaluate(&snapshots, &[], &rules);
        let second = evaluate(&snapshots, &[], &rules);

        assert_eq!(first, second);
        assert_eq!(first[0].zone_id, "A");
        assert_eq!(first.last().unwrap().rule_id, "EN001");
    }

    #[test]
    fn test_condition_round_trips_through_json() {
        let json = r#"{"type":"range","metric":"bin_fill_pct","min":70,"max":85}"#;
        let c: Condition = serde_json::from_str(json).unwrap();
        assert_eq!(c, Condition::range("bin_fill_pct", 70.0, 85.0));
    }

    // Helper functions for tests
    fn snapshot(zone: &str, f: impl FnOnce(&mut ZoneSnapshot)) -> ZoneSnapshot {
        let mut s = ZoneSnapshot {
            zone_id: zone.to_string(),
            period: Period::day(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()),
            ..Default::default()
        };
        f(&mut s);
        s
    }
}
