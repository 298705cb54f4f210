//! Data types shared by every stage of the analysis pipeline.

use chrono::{NaiveDate, NaiveDateTime, NaiveTime};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::error::TransitionError;

/// Municipal data domain. Declared in lexicographic order so the derived
/// `Ord` matches ordering by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Domain {
    Energy,
    Grievance,
    Traffic,
    Waste,
}

impl Domain {
    pub const ALL: [Domain; 4] = [
        Domain::Energy,
        Domain::Grievance,
        Domain::Traffic,
        Domain::Waste,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::Energy => "energy",
            Domain::Grievance => "grievance",
            Domain::Traffic => "traffic",
            Domain::Waste => "waste",
        }
    }
}

impl fmt::Display for Domain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time bucket: a calendar day, optionally narrowed to one hour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Period {
    pub date: NaiveDate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hour: Option<u8>,
}

impl Period {
    pub fn day(date: NaiveDate) -> Self {
        Self { date, hour: None }
    }

    pub fn hourly(date: NaiveDate, hour: u8) -> Self {
        Self {
            date,
            hour: Some(hour),
        }
    }

    /// First instant covered by this period.
    pub fn start(&self) -> NaiveDateTime {
        let time = self
            .hour
            .and_then(|h| NaiveTime::from_hms_opt(u32::from(h), 0, 0))
            .unwrap_or(NaiveTime::MIN);
        self.date.and_time(time)
    }
}

impl Default for Period {
    fn default() -> Self {
        Self::day(NaiveDate::MIN)
    }
}

impl fmt::Display for Period {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.hour {
            Some(h) => write!(f, "{}T{:02}", self.date.format("%Y-%m-%d"), h),
            None => write!(f, "{}", self.date.format("%Y-%m-%d")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordFlag {
    OutOfRange,
}

/// One observation produced by the normalizer from a raw row.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ZoneMetricRecord {
    pub zone_id: String,
    pub period: Period,
    pub domain: Domain,
    pub metric_name: &'static str,
    pub value: f64,
    pub unit: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub flag: Option<RecordFlag>,
}

/// All observations for one zone in one period.
///
/// A domain with no rows leaves its fields `None`; absence is never zero.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ZoneSnapshot {
    pub zone_id: String,
    pub period: Period,

    // traffic
    pub congestion_index: Option<f64>,
    pub peak_congestion_index: Option<f64>,
    pub avg_speed: Option<f64>,
    pub vehicle_volume: Option<f64>,

    // energy
    pub energy_kwh: Option<f64>,
    pub grid_voltage: Option<f64>,
    pub min_grid_voltage: Option<f64>,
    pub power_cut_flag: Option<bool>,
    pub power_cut_hours: Option<u32>,

    // waste
    pub waste_kg: Option<f64>,
    pub bin_fill_pct: Option<f64>,
    pub segregation_pct: Option<f64>,
    pub missed_pickups: Option<u32>,

    // grievances
    pub open_grievance_count: Option<u32>,
    pub total_grievance_count: Option<u32>,
    pub resolved_grievance_count: Option<u32>,
    /// Open tickets whose SLA has at most one day left.
    pub critical_grievance_count: Option<u32>,
    pub avg_sla_days: Option<f64>,
    pub min_open_sla_days: Option<f64>,

    /// Metric names whose raw values fell outside their declared domain.
    pub out_of_range: BTreeSet<String>,
}

impl ZoneSnapshot {
    /// Looks up a derived metric by name. Unknown names and absent data
    /// both yield `None`.
    pub fn metric(&self, name: &str) -> Option<f64> {
        match name {
            "congestion_index" => self.congestion_index,
            "peak_congestion_index" => self.peak_congestion_index,
            "avg_speed" => self.avg_speed,
            "vehicle_volume" => self.vehicle_volume,
            "energy_kwh" => self.energy_kwh,
            "grid_voltage" => self.grid_voltage,
            "min_grid_voltage" => self.min_grid_voltage,
            "power_cut_flag" => self.power_cut_flag.map(|f| if f { 1.0 } else { 0.0 }),
            "power_cut_hours" => self.power_cut_hours.map(f64::from),
            "waste_kg" => self.waste_kg,
            "bin_fill_pct" => self.bin_fill_pct,
            "segregation_pct" => self.segregation_pct,
            "missed_pickups" => self.missed_pickups.map(f64::from),
            "open_grievance_count" => self.open_grievance_count.map(f64::from),
            "total_grievance_count" => self.total_grievance_count.map(f64::from),
            "resolved_grievance_count" => self.resolved_grievance_count.map(f64::from),
            "critical_grievance_count" => self.critical_grievance_count.map(f64::from),
            "avg_sla_days" => self.avg_sla_days,
            "min_open_sla_days" => self.min_open_sla_days,
            _ => None,
        }
    }

    pub fn has_domain(&self, domain: Domain) -> bool {
        SNAPSHOT_METRICS
            .iter()
            .filter(|(_, d)| *d == domain)
            .any(|(name, _)| self.metric(name).is_some())
    }

    pub fn is_out_of_range(&self, metric: &str) -> bool {
        self.out_of_range.contains(metric)
    }
}

/// Every metric a snapshot exposes, with the domain it belongs to.
pub const SNAPSHOT_METRICS: &[(&str, Domain)] = &[
    ("congestion_index", Domain::Traffic),
    ("peak_congestion_index", Domain::Traffic),
    ("avg_speed", Domain::Traffic),
    ("vehicle_volume", Domain::Traffic),
    ("energy_kwh", Domain::Energy),
    ("grid_voltage", Domain::Energy),
    ("min_grid_voltage", Domain::Energy),
    ("power_cut_flag", Domain::Energy),
    ("power_cut_hours", Domain::Energy),
    ("waste_kg", Domain::Waste),
    ("bin_fill_pct", Domain::Waste),
    ("segregation_pct", Domain::Waste),
    ("missed_pickups", Domain::Waste),
    ("open_grievance_count", Domain::Grievance),
    ("total_grievance_count", Domain::Grievance),
    ("resolved_grievance_count", Domain::Grievance),
    ("critical_grievance_count", Domain::Grievance),
    ("avg_sla_days", Domain::Grievance),
    ("min_open_sla_days", Domain::Grievance),
];

/// Domain owning a snapshot metric, if the name is known.
pub fn metric_domain(name: &str) -> Option<Domain> {
    SNAPSHOT_METRICS
        .iter()
        .find(|(metric, _)| *metric == name)
        .map(|(_, domain)| *domain)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StressBand {
    Low,
    Moderate,
    High,
    Severe,
}

/// Composite stress index for one zone and period.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StressScore {
    pub zone_id: String,
    pub period: Period,
    pub composite_score: f64,
    pub component_scores: BTreeMap<Domain, f64>,
    pub dominant_domain: Option<Domain>,
    pub band: StressBand,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "zone_id")]
pub enum ZoneScope {
    CityWide,
    Zone(String),
}

/// Linear association between two metric series. Carries no causal claim.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CorrelationResult {
    pub metric_a: String,
    pub metric_b: String,
    pub zone_scope: ZoneScope,
    pub coefficient: Option<f64>,
    pub sample_size: usize,
    pub significance_flag: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Critical,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Critical => "critical",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TriggeringMetric {
    pub metric: String,
    pub value: f64,
}

/// A rule match at one zone and period. Never mutated after creation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Event {
    pub event_id: String,
    pub zone_id: String,
    pub period: Period,
    pub severity: Severity,
    pub rule_id: String,
    pub domain: Option<Domain>,
    pub triggering_metrics: Vec<TriggeringMetric>,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ActionStatus {
    Pending,
    Success,
    Failed,
}

/// Simulated remedial response owned by exactly one [`Event`].
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    pub action_id: String,
    pub event_id: String,
    pub zone_id: String,
    pub action_type: String,
    pub status: ActionStatus,
    pub target_system: String,
    pub executed_at: Option<NaiveDateTime>,
    pub latency_ms: Option<u64>,
    pub outcome_detail: Option<String>,
}

impl Action {
    pub fn pending(event: &Event, action_type: &str, target_system: &str) -> Self {
        Action {
            action_id: format!("ACT-{}", event.event_id),
            event_id: event.event_id.clone(),
            zone_id: event.zone_id.clone(),
            action_type: action_type.to_string(),
            status: ActionStatus::Pending,
            target_system: target_system.to_string(),
            executed_at: None,
            latency_ms: None,
            outcome_detail: None,
        }
    }

    /// Moves a pending action to its terminal status. Terminal actions
    /// reject any further change.
    pub fn complete(
        &mut self,
        status: ActionStatus,
        executed_at: NaiveDateTime,
        latency_ms: u64,
        detail: String,
    ) -> Result<(), TransitionError> {
        if self.status != ActionStatus::Pending || status == ActionStatus::Pending {
            return Err(TransitionError {
                action_id: self.action_id.clone(),
                from: self.status,
                to: status,
            });
        }

        self.status = status;
        self.executed_at = Some(executed_at);
        self.latency_ms = Some(latency_ms);
        self.outcome_detail = Some(detail);
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status != ActionStatus::Pending
    }
}

/// Ranked, cost/benefit-annotated suggestion for one zone.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Recommendation {
    pub title: String,
    pub zone_id: String,
    pub domain: Option<Domain>,
    pub supporting_events: BTreeSet<String>,
    pub estimated_roi: f64,
    pub priority_rank: f64,
    pub cost_estimate: f64,
    pub unresolved_actions: usize,
}
