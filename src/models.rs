use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::EngineError;

/// Implements `as_str` and `FromStr` for enums persisted as lowercase text.
macro_rules! text_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($name::$variant => $text),+
                }
            }
        }

        impl std::str::FromStr for $name {
            type Err = EngineError;

            fn from_str(value: &str) -> Result<Self, Self::Err> {
                match value {
                    $($text => Ok($name::$variant),)+
                    other => Err(EngineError::DataAccess(format!(
                        "unknown {} value '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                f.write_str(self.as_str())
            }
        }
    };
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    pub name: String,
    pub class_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PerformanceRecord {
    pub entity_id: String,
    pub subject: String,
    pub score: f64,
    pub assessment_date: NaiveDate,
    pub assessment_title: String,
    pub rank: Option<i32>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HomeworkStatus {
    Submitted,
    Late,
    Missing,
}

text_enum!(HomeworkStatus {
    Submitted => "submitted",
    Late => "late",
    Missing => "missing",
});

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HomeworkSubmission {
    pub entity_id: String,
    pub homework_title: String,
    pub due_date: NaiveDate,
    pub status: HomeworkStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleCategory {
    Grade,
    Attendance,
    Behavior,
    Progress,
    Homework,
    Composite,
}

text_enum!(RuleCategory {
    Grade => "grade",
    Attendance => "attendance",
    Behavior => "behavior",
    Progress => "progress",
    Homework => "homework",
    Composite => "composite",
});

/// Ordered so that `High` compares greatest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
}

text_enum!(Severity {
    Low => "low",
    Medium => "medium",
    High => "high",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleScope {
    Global,
    Exam,
    Class,
    Student,
}

text_enum!(RuleScope {
    Global => "global",
    Exam => "exam",
    Class => "class",
    Student => "student",
});

/// A rule as stored. `conditions` stays raw JSON until dispatch so that a
/// single malformed rule cannot break catalog loading.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleDefinition {
    pub id: Uuid,
    pub name: String,
    pub category: RuleCategory,
    pub conditions: serde_json::Value,
    pub severity: Severity,
    pub scope: RuleScope,
    pub priority: i32,
    pub is_active: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Completed,
    Failed,
}

text_enum!(RunStatus {
    Running => "running",
    Completed => "completed",
    Failed => "failed",
});

impl RunStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, RunStatus::Running)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub id: Uuid,
    pub trigger: Option<String>,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub totals: ExecutionTotals,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionTotals {
    pub total_rules: usize,
    pub matched_entities: usize,
    pub generated_warnings: usize,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleExecutionRecord {
    pub id: Uuid,
    pub execution_id: Uuid,
    pub rule_id: Uuid,
    pub rule_snapshot: serde_json::Value,
    pub status: RunStatus,
    pub affected_entities: usize,
    pub generated_warnings: usize,
    pub duration_ms: u64,
    pub error_message: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Terminal state written back onto a rule execution row.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleExecutionOutcome {
    pub status: RunStatus,
    pub affected_entities: usize,
    pub generated_warnings: usize,
    pub duration_ms: u64,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WarningStatus {
    Active,
    Resolved,
}

text_enum!(WarningStatus {
    Active => "active",
    Resolved => "resolved",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AnomalyDirection {
    Drop,
    Spike,
}

/// Trigger details persisted with a warning, one variant per rule type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WarningDetails {
    ConsecutiveFails {
        fail_count: usize,
        subjects: Vec<String>,
        threshold: f64,
        window: String,
    },
    GradeDecline {
        decline_amount: f64,
        periods: usize,
        from_assessment: String,
        to_assessment: String,
    },
    ExamFail {
        score: f64,
        subject: String,
        exam_title: String,
    },
    HomeworkDefault {
        default_count: usize,
        missing_count: usize,
        late_count: usize,
    },
    MlRiskPrediction {
        risk_score: f64,
        trigger_score: f64,
        average_risk: f64,
        volatility_risk: f64,
        trend_risk: f64,
        data_points: usize,
        factors: Vec<String>,
    },
    MlAnomalyDetection {
        z_score: f64,
        severity: f64,
        confidence: f64,
        direction: AnomalyDirection,
        latest_score: f64,
        mean: f64,
        stdev: f64,
        factors: Vec<String>,
    },
    MlTrendAnalysis {
        slope: f64,
        intercept: f64,
        r_squared: f64,
        predicted_next: f64,
        data_points: usize,
        factors: Vec<String>,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WarningRecord {
    pub id: Uuid,
    pub entity_id: String,
    pub rule_id: Uuid,
    pub details: WarningDetails,
    pub status: WarningStatus,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl WarningRecord {
    pub fn new_active(entity_id: &str, rule_id: Uuid, details: WarningDetails) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.to_string(),
            rule_id,
            details,
            status: WarningStatus::Active,
            created_at: Utc::now(),
            resolved_at: None,
        }
    }
}

/// Result of a store-level warning insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    Inserted,
    /// An active warning for the same `(entity_id, rule_id)` already existed.
    Duplicate,
}

/// Ordered by ranking tier: manual first, then hybrid, then algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provenance {
    Manual,
    Hybrid,
    Algorithm,
}

text_enum!(Provenance {
    Manual => "manual",
    Hybrid => "hybrid",
    Algorithm => "algorithm",
});

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PriorityStatus {
    Active,
    Paused,
    Completed,
    Cancelled,
}

text_enum!(PriorityStatus {
    Active => "active",
    Paused => "paused",
    Completed => "completed",
    Cancelled => "cancelled",
});

/// Durable, human-curated priority record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ManualPriority {
    pub id: Uuid,
    pub entity_id: String,
    pub severity: Severity,
    pub status: PriorityStatus,
    pub custom_tags: Vec<String>,
    pub reason: Option<String>,
    pub intervention_goals: Vec<String>,
    pub notes: Option<String>,
    /// Score captured when the entry was created from a recommendation.
    pub algorithm_score: Option<f64>,
    pub created_at: DateTime<Utc>,
}

impl ManualPriority {
    pub fn new(entity_id: &str, severity: Severity, reason: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_id: entity_id.to_string(),
            severity,
            status: PriorityStatus::Active,
            custom_tags: Vec::new(),
            reason,
            intervention_goals: Vec::new(),
            notes: None,
            algorithm_score: None,
            created_at: Utc::now(),
        }
    }
}

/// One line of the consolidated priority list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriorityEntry {
    /// Identity of the manual record; `None` for pure algorithm entries.
    pub id: Option<Uuid>,
    pub entity_id: String,
    pub entity_name: Option<String>,
    pub class_name: Option<String>,
    pub provenance: Provenance,
    pub severity: Severity,
    pub custom_tags: Vec<String>,
    pub risk_score: f64,
    pub reason: String,
    pub intervention_goals: Vec<String>,
    pub notes: Option<String>,
    pub status: PriorityStatus,
}

/// Per-rule line of an execution report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleResult {
    pub rule_id: Uuid,
    pub matched_entities: Vec<String>,
    pub generated_warnings: usize,
    pub duration_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunSummary {
    pub total_rules: usize,
    pub matched_entities: usize,
    pub generated_warnings: usize,
    pub total_execution_time_ms: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionReport {
    pub execution_id: Uuid,
    pub results: Vec<RuleResult>,
    pub summary: RunSummary,
}
