use std::sync::Arc;

use tracing::debug;

use crate::conditions::RuleConditions;
use crate::config::RiskModelConfig;
use crate::error::Result;
use crate::models::WarningDetails;
use crate::statistical;
use crate::store::{DataAccess, RecordFilter};
use crate::threshold;

/// One entity matched by a rule, with the details a warning would carry.
#[derive(Debug, Clone, PartialEq)]
pub struct RuleMatch {
    pub entity_id: String,
    pub details: WarningDetails,
}

/// Fetches the data a rule needs and dispatches it to its strategy.
pub struct RuleEvaluator {
    store: Arc<dyn DataAccess>,
    risk_model: RiskModelConfig,
}

impl RuleEvaluator {
    pub fn new(store: Arc<dyn DataAccess>, risk_model: RiskModelConfig) -> Self {
        Self { store, risk_model }
    }

    pub async fn evaluate(&self, conditions: &RuleConditions) -> Result<Vec<RuleMatch>> {
        let matches = match conditions {
            RuleConditions::ConsecutiveFails(params) => {
                let records = self
                    .store
                    .performance_records(&RecordFilter::for_subject(params.subject.clone()))
                    .await?;
                threshold::consecutive_fails(&records, params)
            }
            RuleConditions::GradeDecline(params) => {
                let records = self.store.performance_records(&RecordFilter::default()).await?;
                threshold::grade_decline(&records, params)
            }
            RuleConditions::ExamFail(params) => {
                let records = self
                    .store
                    .performance_records(&RecordFilter::for_subject(params.subject.clone()))
                    .await?;
                threshold::exam_fail(&records, params)
            }
            RuleConditions::HomeworkDefault(params) => {
                let submissions = self.store.homework_submissions().await?;
                threshold::homework_default(&submissions, params)
            }
            RuleConditions::MlRiskPrediction(params) => {
                let records = self.store.performance_records(&RecordFilter::default()).await?;
                statistical::risk_prediction(&records, params, &self.risk_model)
            }
            RuleConditions::MlAnomalyDetection(params) => {
                let records = self.store.performance_records(&RecordFilter::default()).await?;
                statistical::anomaly_detection(&records, params)
            }
            RuleConditions::MlTrendAnalysis(params) => {
                let records = self.store.performance_records(&RecordFilter::default()).await?;
                statistical::trend_analysis(&records, params)
            }
        };

        debug!(
            rule_type = conditions.type_name(),
            matched = matches.len(),
            "strategy evaluated"
        );
        Ok(matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{HomeworkStatus, HomeworkSubmission, PerformanceRecord};
    use crate::store::MemoryStore;
    use chrono::NaiveDate;
    use serde_json::json;

    fn record(subject: &str, score: f64, day: u32) -> PerformanceRecord {
        PerformanceRecord {
            entity_id: "S1".to_string(),
            subject: subject.to_string(),
            score,
            assessment_date: NaiveDate::from_ymd_opt(2026, 4, day).unwrap(),
            assessment_title: format!("Quiz {day}"),
            rank: None,
        }
    }

    fn evaluator(store: MemoryStore) -> RuleEvaluator {
        RuleEvaluator::new(Arc::new(store), RiskModelConfig::default())
    }

    #[tokio::test]
    async fn subject_filter_is_pushed_to_the_query() {
        let store = MemoryStore::new();
        store
            .add_records(vec![record("math", 90.0, 1), record("english", 30.0, 1)])
            .unwrap();

        let conditions =
            RuleConditions::parse(&json!({"type": "exam_fail", "threshold": 60, "subject": "math"})).unwrap();
        assert!(evaluator(store).evaluate(&conditions).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn homework_rule_reads_submissions() {
        let store = MemoryStore::new();
        store
            .add_homework((1..=3).map(|day| HomeworkSubmission {
                entity_id: "S1".to_string(),
                homework_title: format!("Worksheet {day}"),
                due_date: NaiveDate::from_ymd_opt(2026, 4, day).unwrap(),
                status: HomeworkStatus::Missing,
            }))
            .unwrap();

        let conditions = RuleConditions::parse(&json!({"type": "homework_default", "count": 3})).unwrap();
        let matches = evaluator(store).evaluate(&conditions).await.unwrap();
        assert_eq!(matches.len(), 1);
        assert_eq!(
            matches[0].details,
            WarningDetails::HomeworkDefault {
                default_count: 3,
                missing_count: 3,
                late_count: 0,
            }
        );
    }

    #[tokio::test]
    async fn store_errors_propagate() {
        let store = MemoryStore::new();
        store.fail_record_queries(1);

        let conditions = RuleConditions::parse(&json!({"type": "grade_decline", "decline_threshold": 5, "consecutive_count": 1})).unwrap();
        let err = evaluator(store).evaluate(&conditions).await.unwrap_err();
        assert!(err.is_retryable());
    }
}
