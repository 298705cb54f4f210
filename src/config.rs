use serde::{Deserialize, Serialize};

use crate::analyzers::anomaly::AnomalyConfig;
use crate::analyzers::correlate::CorrelationConfig;
use crate::analyzers::decide::DecisionConfig;
use crate::analyzers::insights::InsightsConfig;
use crate::analyzers::normalize::NormalizerConfig;
use crate::analyzers::rules::{Rule, default_rules, validate_rules};
use crate::analyzers::stress::StressConfig;
use crate::error::ConfigError;

/// Tunable settings for every pipeline stage.
///
/// Stored as a JSON object on disk; any section or field left out takes
/// its default:
/// ```json
/// {
///   "normalizer": { "congestion_domain": [0, 100] },
///   "decision": { "seed": 7 }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub normalizer: NormalizerConfig,
    pub stress: StressConfig,
    pub correlation: CorrelationConfig,
    pub rules: Vec<Rule>,
    pub decision: DecisionConfig,
    pub insights: InsightsConfig,
    pub anomaly: AnomalyConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            normalizer: NormalizerConfig::default(),
            stress: StressConfig::default(),
            correlation: CorrelationConfig::default(),
            rules: default_rules(),
            decision: DecisionConfig::default(),
            insights: InsightsConfig::default(),
            anomaly: AnomalyConfig::default(),
        }
    }
}

impl PipelineConfig {
    /// Loads the config from a JSON file at `path`.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ConfigError> {
        Ok(serde_json::from_str(content)?)
    }

    /// Runs every section's checks, returning the first failure.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.normalizer.validate()?;
        self.stress.validate()?;
        self.correlation.validate()?;
        validate_rules(&self.rules)?;
        self.decision.validate()?;
        self.insights.validate()?;
        self.anomaly.validate()?;
        Ok(())
    }
}
