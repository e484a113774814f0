//! Typed rule conditions, keyed by the `type` tag of the stored payload.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RuleConditions {
    ConsecutiveFails(ConsecutiveFails),
    GradeDecline(GradeDecline),
    ExamFail(ExamFail),
    HomeworkDefault(HomeworkDefault),
    MlRiskPrediction(RiskPrediction),
    MlAnomalyDetection(AnomalyDetection),
    MlTrendAnalysis(TrendAnalysis),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsecutiveFails {
    #[serde(alias = "count")]
    pub times: usize,
    #[serde(alias = "threshold")]
    pub score_threshold: f64,
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GradeDecline {
    pub decline_threshold: f64,
    pub consecutive_count: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExamFail {
    pub threshold: f64,
    #[serde(default)]
    pub subject: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomeworkDefault {
    pub count: usize,
    #[serde(default)]
    pub include_late: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RiskPrediction {
    pub threshold: f64,
    pub sensitivity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnomalyDetection {
    pub z_threshold: f64,
    pub sensitivity: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrendAnalysis {
    pub decline_rate: f64,
    pub confidence_threshold: f64,
}

impl RuleConditions {
    /// Parse and validate a stored conditions payload.
    pub fn parse(value: &serde_json::Value) -> Result<Self> {
        let mut conditions: RuleConditions = serde_json::from_value(value.clone())
            .map_err(|err| EngineError::Configuration(format!("invalid rule conditions: {err}")))?;
        conditions.normalize();
        conditions.validate()?;
        Ok(conditions)
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            RuleConditions::ConsecutiveFails(_) => "consecutive_fails",
            RuleConditions::GradeDecline(_) => "grade_decline",
            RuleConditions::ExamFail(_) => "exam_fail",
            RuleConditions::HomeworkDefault(_) => "homework_default",
            RuleConditions::MlRiskPrediction(_) => "ml_risk_prediction",
            RuleConditions::MlAnomalyDetection(_) => "ml_anomaly_detection",
            RuleConditions::MlTrendAnalysis(_) => "ml_trend_analysis",
        }
    }

    // "all" is how rule editors spell "no subject filter".
    fn normalize(&mut self) {
        let subject = match self {
            RuleConditions::ConsecutiveFails(c) => &mut c.subject,
            RuleConditions::ExamFail(c) => &mut c.subject,
            _ => return,
        };
        if subject
            .as_deref()
            .map(|s| s.trim().is_empty() || s.eq_ignore_ascii_case("all"))
            .unwrap_or(false)
        {
            *subject = None;
        }
    }

    fn validate(&self) -> Result<()> {
        match self {
            RuleConditions::ConsecutiveFails(c) => {
                require(c.times >= 1, "consecutive_fails.times must be at least 1")?;
                require(c.score_threshold.is_finite(), "consecutive_fails.score_threshold must be finite")
            }
            RuleConditions::GradeDecline(c) => {
                require(c.consecutive_count >= 1, "grade_decline.consecutive_count must be at least 1")?;
                require(
                    c.decline_threshold.is_finite() && c.decline_threshold >= 0.0,
                    "grade_decline.decline_threshold must be a non-negative number",
                )
            }
            RuleConditions::ExamFail(c) => require(c.threshold.is_finite(), "exam_fail.threshold must be finite"),
            RuleConditions::HomeworkDefault(c) => require(c.count >= 1, "homework_default.count must be at least 1"),
            RuleConditions::MlRiskPrediction(c) => {
                require(c.threshold.is_finite(), "ml_risk_prediction.threshold must be finite")?;
                require_sensitivity(c.sensitivity, "ml_risk_prediction")
            }
            RuleConditions::MlAnomalyDetection(c) => {
                require(
                    c.z_threshold.is_finite() && c.z_threshold > 0.0,
                    "ml_anomaly_detection.z_threshold must be positive",
                )?;
                require_sensitivity(c.sensitivity, "ml_anomaly_detection")
            }
            RuleConditions::MlTrendAnalysis(c) => {
                require(c.decline_rate.is_finite(), "ml_trend_analysis.decline_rate must be finite")?;
                require(
                    (0.0..=1.0).contains(&c.confidence_threshold),
                    "ml_trend_analysis.confidence_threshold must be within [0, 1]",
                )
            }
        }
    }
}

fn require(condition: bool, message: &str) -> Result<()> {
    if condition {
        Ok(())
    } else {
        Err(EngineError::Configuration(message.to_string()))
    }
}

fn require_sensitivity(value: f64, rule_type: &str) -> Result<()> {
    require(
        value > 0.0 && value <= 1.0,
        &format!("{rule_type}.sensitivity must be within (0, 1]"),
    )
}
