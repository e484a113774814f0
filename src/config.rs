use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

/// Step of the average-score risk function: averages strictly below `below`
/// map to `risk`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScoreBucket {
    pub below: f64,
    pub risk: f64,
}

/// Tunables of the multi-factor risk model used by `ml_risk_prediction`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RiskModelConfig {
    /// Ascending by `below`, with non-increasing `risk`.
    pub average_buckets: Vec<ScoreBucket>,
    /// Risk for averages at or above the last bucket.
    pub floor_risk: f64,
    pub volatility_multiplier: f64,
    pub trend_multiplier: f64,
    /// Upper bound of the volatility and trend components.
    pub component_cap: f64,
}

impl Default for RiskModelConfig {
    fn default() -> Self {
        Self {
            average_buckets: vec![
                ScoreBucket { below: 200.0, risk: 80.0 },
                ScoreBucket { below: 300.0, risk: 60.0 },
                ScoreBucket { below: 400.0, risk: 40.0 },
            ],
            floor_risk: 20.0,
            volatility_multiplier: 2.0,
            trend_multiplier: 4.0,
            component_cap: 80.0,
        }
    }
}

impl RiskModelConfig {
    pub fn average_risk(&self, average: f64) -> f64 {
        self.average_buckets
            .iter()
            .find(|bucket| average < bucket.below)
            .map(|bucket| bucket.risk)
            .unwrap_or(self.floor_risk)
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        for pair in self.average_buckets.windows(2) {
            anyhow::ensure!(
                pair[0].below < pair[1].below,
                "risk_model.average_buckets must be sorted by ascending `below`"
            );
            anyhow::ensure!(
                pair[0].risk >= pair[1].risk,
                "risk_model.average_buckets risk must not increase with the average"
            );
        }
        if let Some(last) = self.average_buckets.last() {
            anyhow::ensure!(
                last.risk >= self.floor_risk,
                "risk_model.floor_risk must not exceed the last bucket's risk"
            );
        }
        anyhow::ensure!(
            self.volatility_multiplier >= 0.0 && self.trend_multiplier >= 0.0,
            "risk_model multipliers must be non-negative"
        );
        anyhow::ensure!(
            (0.0..=100.0).contains(&self.component_cap),
            "risk_model.component_cap must be within [0, 100]"
        );
        Ok(())
    }
}

/// Diagnostic heuristics behind the algorithmic side of the priority list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct HeuristicConfig {
    pub pass_score: f64,
    pub min_failing_scores: usize,
    pub failing_weight: f64,
    pub average_floor: f64,
    pub average_weight: f64,
    pub severe_score: f64,
    pub severe_weight: f64,
    pub extreme_score: f64,
    pub extreme_weight: f64,
    pub high_risk_at: f64,
    pub medium_risk_at: f64,
    /// Risk shown for manual entries that carry no stored score.
    pub manual_default_risk: f64,
}

impl Default for HeuristicConfig {
    fn default() -> Self {
        Self {
            pass_score: 60.0,
            min_failing_scores: 2,
            failing_weight: 20.0,
            average_floor: 70.0,
            average_weight: 2.0,
            severe_score: 40.0,
            severe_weight: 30.0,
            extreme_score: 30.0,
            extreme_weight: 40.0,
            high_risk_at: 80.0,
            medium_risk_at: 40.0,
            manual_default_risk: 50.0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl RetryPolicy {
    /// Delay before retry number `attempt` (1-based), doubling each time.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(100),
        }
    }
}

/// Runtime knobs of the execution coordinator.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    pub concurrency: usize,
    pub run_timeout: Duration,
    pub retry: RetryPolicy,
    pub risk_model: RiskModelConfig,
    pub heuristics: HeuristicConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 4,
            run_timeout: Duration::from_secs(300),
            retry: RetryPolicy::default(),
            risk_model: RiskModelConfig::default(),
            heuristics: HeuristicConfig::default(),
        }
    }
}

/// Shape of the optional `--config` JSON file.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelSettings {
    pub risk_model: RiskModelConfig,
    pub heuristics: HeuristicConfig,
}

impl ModelSettings {
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        let settings = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path)
                    .with_context(|| format!("failed to read config file {}", path.display()))?;
                serde_json::from_str(&raw)
                    .with_context(|| format!("failed to parse config file {}", path.display()))?
            }
            None => ModelSettings::default(),
        };
        settings.risk_model.validate()?;
        Ok(settings)
    }
}
