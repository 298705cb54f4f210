//! Decision engine: one simulated remedial action per event.
//!
//! Action selection is a policy table lookup (domain + severity beats
//! severity alone). Execution goes through [`ActionExecutor`] so a live
//! dispatcher can replace the simulation. A live executor is where an
//! ack-or-timeout external call belongs; the simulation returns at once.

use chrono::{Duration, NaiveDateTime};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use tracing::{debug, warn};

use crate::analyzers::types::{Action, ActionStatus, Domain, Event, Severity};
use crate::analyzers::utility::{fnv1a, mean};
use crate::error::ConfigError;

/// Upper bound on a configured acknowledgement latency: one day.
pub const MAX_LATENCY_MS: u64 = 86_400_000;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PolicyEntry {
    pub severity: Severity,
    /// `None` makes the entry a severity-only default.
    #[serde(default)]
    pub domain: Option<Domain>,
    pub action_type: String,
    pub target_system: String,
}

impl PolicyEntry {
    fn new(severity: Severity, domain: Option<Domain>, action_type: &str, target_system: &str) -> Self {
        Self {
            severity,
            domain,
            action_type: action_type.to_string(),
            target_system: target_system.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActionTemplate {
    pub action_type: String,
    pub target_system: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DecisionConfig {
    pub policies: Vec<PolicyEntry>,
    /// Used when no policy entry matches the event.
    pub fallback: ActionTemplate,
    pub success_probability: BTreeMap<String, f64>,
    pub default_success_probability: f64,
    pub seed: u64,
    /// Inclusive `[min, max]` simulated acknowledgement latency.
    pub latency_ms: [u64; 2],
}

impl Default for DecisionConfig {
    fn default() -> Self {
        use Severity::*;

        let policies = vec![
            PolicyEntry::new(Critical, Some(Domain::Traffic), "adjust_signal_timing", "traffic_control"),
            PolicyEntry::new(Warning, Some(Domain::Traffic), "alert_traffic_police", "traffic_control"),
            PolicyEntry::new(Critical, Some(Domain::Energy), "activate_backup_supply", "grid_scada"),
            PolicyEntry::new(Warning, Some(Domain::Energy), "dispatch_technician", "grid_maintenance"),
            PolicyEntry::new(Critical, Some(Domain::Waste), "schedule_priority_pickup", "fleet_dispatch"),
            PolicyEntry::new(Warning, Some(Domain::Waste), "schedule_priority_pickup", "fleet_dispatch"),
            PolicyEntry::new(Critical, Some(Domain::Grievance), "escalate_to_supervisor", "grievance_portal"),
            PolicyEntry::new(Warning, Some(Domain::Grievance), "assign_senior_officer", "grievance_portal"),
            PolicyEntry::new(Critical, None, "notify_emergency_response", "command_center"),
            PolicyEntry::new(Warning, None, "notify_zone_officer", "command_center"),
            PolicyEntry::new(Info, None, "log_for_review", "operations_log"),
        ];

        Self {
            policies,
            fallback: ActionTemplate {
                action_type: "manual_review".into(),
                target_system: "operations_desk".into(),
            },
            success_probability: BTreeMap::new(),
            default_success_probability: 0.96,
            seed: 42,
            latency_ms: [5_000, 30_000],
        }
    }
}

impl DecisionConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        let defaults = std::iter::once(("default", self.default_success_probability));
        let per_type = self
            .success_probability
            .iter()
            .map(|(k, v)| (k.as_str(), *v));

        for (action_type, p) in defaults.chain(per_type) {
            if !(0.0..=1.0).contains(&p) {
                return Err(ConfigError::InvalidProbability {
                    action_type: action_type.to_string(),
                    probability: p,
                });
            }
        }

        let [lo, hi] = self.latency_ms;
        if lo > hi {
            return Err(ConfigError::InvalidThreshold {
                name: "decision.latency_ms".into(),
                reason: format!("expected min <= max, got [{lo}, {hi}]"),
            });
        }
        if hi > MAX_LATENCY_MS {
            return Err(ConfigError::InvalidThreshold {
                name: "decision.latency_ms".into(),
                reason: format!("max {hi} exceeds {MAX_LATENCY_MS} ms"),
            });
        }
        Ok(())
    }

    /// Most specific policy for the event: an entry matching domain and
    /// severity wins over a severity-only one, earlier entries win ties.
    pub fn select(&self, event: &Event) -> (&str, &str) {
        let exact = self
            .policies
            .iter()
            .find(|p| p.severity == event.severity && p.domain.is_some() && p.domain == event.domain);
        let general = || {
            self.policies
                .iter()
                .find(|p| p.severity == event.severity && p.domain.is_none())
        };

        match exact.or_else(general) {
            Some(p) => (p.action_type.as_str(), p.target_system.as_str()),
            None => (
                self.fallback.action_type.as_str(),
                self.fallback.target_system.as_str(),
            ),
        }
    }

    pub fn success_probability(&self, action_type: &str) -> f64 {
        self.success_probability
            .get(action_type)
            .copied()
            .unwrap_or(self.default_success_probability)
    }
}

/// What the engine asks an executor to do.
#[derive(Debug, Clone, Copy)]
pub struct ActionIntent<'a> {
    pub event: &'a Event,
    pub action_type: &'a str,
    pub target_system: &'a str,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ActionOutcome {
    pub succeeded: bool,
    pub latency_ms: u64,
    pub detail: String,
}

/// Carries an action out and reports how it went. Failures are returned
/// as data, never raised.
pub trait ActionExecutor {
    fn execute(&self, intent: &ActionIntent<'_>) -> ActionOutcome;
}

/// Samples outcomes from per-action-type success probabilities.
///
/// Each event draws from its own `StdRng` seeded with the configured seed
/// mixed with a hash of the event's rule, zone and period, so outcomes do
/// not depend on evaluation order.
pub struct SimulatedExecutor {
    config: DecisionConfig,
}

impl SimulatedExecutor {
    pub fn from_config(config: &DecisionConfig) -> Self {
        Self {
            config: config.clone(),
        }
    }

    fn rng_for(&self, event: &Event) -> StdRng {
        StdRng::seed_from_u64(self.config.seed ^ fnv1a(event.event_id.as_bytes()))
    }
}

impl ActionExecutor for SimulatedExecutor {
    fn execute(&self, intent: &ActionIntent<'_>) -> ActionOutcome {
        let mut rng = self.rng_for(intent.event);
        let p = self.config.success_probability(intent.action_type);

        let succeeded = rng.gen_range(0.0..1.0) < p;
        let [lo, hi] = self.config.latency_ms;
        let latency_ms = rng.gen_range(lo.min(hi)..=hi);

        let detail = if succeeded {
            format!(
                "{} acknowledged by {} in {} ms",
                intent.action_type, intent.target_system, latency_ms
            )
        } else {
            format!(
                "{} not acknowledged by {} after {} ms",
                intent.action_type, intent.target_system, latency_ms
            )
        };

        ActionOutcome {
            succeeded,
            latency_ms,
            detail,
        }
    }
}

/// Maps each event to exactly one action and executes it.
///
/// Duplicate event ids are dispatched once. Failed actions are final: no
/// retries and no new events.
#[tracing::instrument(skip_all, fields(events = events.len()))]
pub fn decide_with(
    events: &[Event],
    config: &DecisionConfig,
    executor: &dyn ActionExecutor,
) -> Vec<Action> {
    let mut dispatched = HashSet::new();
    let mut actions = Vec::with_capacity(events.len());

    for event in events {
        if !dispatched.insert(event.event_id.as_str()) {
            warn!(event_id = %event.event_id, "Duplicate event skipped");
            continue;
        }

        let (action_type, target_system) = config.select(event);
        let mut action = Action::pending(event, action_type, target_system);

        let outcome = executor.execute(&ActionIntent {
            event,
            action_type,
            target_system,
        });
        let start = event.period.start();
        let (status, executed_at, detail) = match acknowledged_at(start, outcome.latency_ms) {
            Some(at) if outcome.succeeded => (ActionStatus::Success, at, outcome.detail),
            Some(at) => (ActionStatus::Failed, at, outcome.detail),
            None => {
                warn!(event_id = %event.event_id, latency_ms = outcome.latency_ms, "Latency out of range");
                let detail = format!("latency {} ms out of range", outcome.latency_ms);
                (ActionStatus::Failed, start, detail)
            }
        };

        if let Err(e) = action.complete(status, executed_at, outcome.latency_ms, detail) {
            warn!(error = %e, "Action left pending");
        }
        actions.push(action);
    }

    debug!(
        actions = actions.len(),
        failed = actions.iter().filter(|a| a.status == ActionStatus::Failed).count(),
        "Actions executed"
    );
    actions
}

/// `start + latency_ms`, or `None` when the sum leaves chrono's range.
fn acknowledged_at(start: NaiveDateTime, latency_ms: u64) -> Option<NaiveDateTime> {
    let ms = i64::try_from(latency_ms).ok()?;
    start.checked_add_signed(Duration::try_milliseconds(ms)?)
}

/// [`decide_with`] using the seeded simulation.
pub fn decide(events: &[Event], config: &DecisionConfig) -> Vec<Action> {
    decide_with(events, config, &SimulatedExecutor::from_config(config))
}

/// Roll-up of action outcomes.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DecisionSummary {
    pub total: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub success_rate: f64,
    pub mean_latency_ms: f64,
    pub by_action_type: BTreeMap<String, usize>,
}

pub fn summarize(actions: &[Action]) -> DecisionSummary {
    let mut summary = DecisionSummary {
        total: actions.len(),
        ..Default::default()
    };

    let mut latencies = Vec::new();
    for a in actions {
        match a.status {
            ActionStatus::Success => summary.succeeded += 1,
            ActionStatus::Failed => summary.failed += 1,
            ActionStatus::Pending => {}
        }
        if let Some(l) = a.latency_ms {
            latencies.push(l as f64);
        }
        *summary.by_action_type.entry(a.action_type.clone()).or_default() += 1;
    }

    if summary.total > 0 {
        summary.success_rate = summary.succeeded as f64 / summary.total as f64;
    }
    summary.mean_latency_ms = mean(&latencies);
    summary
}
