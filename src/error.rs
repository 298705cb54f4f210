//! Error types surfaced by the analysis core.

use thiserror::Error;

use crate::analyzers::types::{ActionStatus, Domain};

/// A required column is missing from one of the input tables.
///
/// Fatal for that table only: the other domains still normalize.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("{domain} table is missing required column '{column}'")]
pub struct SchemaError {
    pub domain: Domain,
    pub column: String,
}

/// Invalid weight, threshold or policy configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("stress weights must sum to 1.0, got {0}")]
    WeightsDoNotSumToOne(f64),

    #[error("weight for {domain} must be non-negative, got {weight}")]
    NegativeWeight { domain: Domain, weight: f64 },

    #[error("reference range for {domain}.{metric} needs low < high, got ({low}, {high})")]
    InvalidReferenceRange {
        domain: Domain,
        metric: String,
        low: f64,
        high: f64,
    },

    #[error("success probability for '{action_type}' must be within [0, 1], got {probability}")]
    InvalidProbability { action_type: String, probability: f64 },

    #[error("invalid threshold '{name}': {reason}")]
    InvalidThreshold { name: String, reason: String },

    #[error("rule id '{0}' is declared more than once")]
    DuplicateRuleId(String),

    #[error("config parse error: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("config IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// An Action status change that does not follow pending -> success | failed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("action '{action_id}' cannot move from {from:?} to {to:?}")]
pub struct TransitionError {
    pub action_id: String,
    pub from: ActionStatus,
    pub to: ActionStatus,
}
