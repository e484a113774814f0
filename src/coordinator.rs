//! Orchestrates one complete warning run with an audit trail.
//!
//! A run creates its execution record, loads the catalog, evaluates every
//! active rule on a bounded worker pool and finalizes the record. Only
//! bootstrap failures abort the run; everything that goes wrong inside a rule
//! is confined to that rule's result and audit row.

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::catalog::RuleCatalog;
use crate::conditions::RuleConditions;
use crate::config::{EngineConfig, RetryPolicy};
use crate::error::{EngineError, Result};
use crate::evaluator::RuleEvaluator;
use crate::models::{
    ExecutionReport, ExecutionTotals, RuleDefinition, RuleExecutionOutcome, RuleExecutionRecord,
    RuleResult, RunStatus, RunSummary,
};
use crate::store::DataAccess;
use crate::writer::WarningWriter;

pub struct ExecutionCoordinator {
    store: Arc<dyn DataAccess>,
    catalog: RuleCatalog,
    runner: Arc<RuleRunner>,
    concurrency: usize,
    run_timeout: Duration,
}

impl ExecutionCoordinator {
    pub fn new(store: Arc<dyn DataAccess>, config: &EngineConfig) -> Self {
        let runner = RuleRunner {
            store: store.clone(),
            evaluator: RuleEvaluator::new(store.clone(), config.risk_model.clone()),
            writer: WarningWriter::new(store.clone()),
            retry: config.retry,
        };
        Self {
            catalog: RuleCatalog::new(store.clone()),
            store,
            runner: Arc::new(runner),
            concurrency: config.concurrency.max(1),
            run_timeout: config.run_timeout,
        }
    }

    pub async fn execute_all(&self, trigger: Option<&str>) -> Result<ExecutionReport> {
        let started = Instant::now();
        info!(trigger = trigger.unwrap_or("manual"), "starting warning run");

        let execution = self
            .store
            .start_execution(trigger)
            .await
            .map_err(|err| EngineError::Fatal(format!("failed to create execution record: {err}")))?;

        let rules = match self.catalog.load_active().await {
            Ok(rules) => rules,
            Err(err) => {
                error!(execution_id = %execution.id, error = %err, "aborting warning run");
                let totals = ExecutionTotals {
                    duration_ms: elapsed_ms(started),
                    ..ExecutionTotals::default()
                };
                if let Err(mark_err) = self
                    .store
                    .finish_execution(execution.id, RunStatus::Failed, &totals, Some(&err.to_string()))
                    .await
                {
                    error!(execution_id = %execution.id, error = %mark_err, "failed to mark execution as failed");
                }
                return Err(err);
            }
        };

        let results = self.run_rules(execution.id, &rules).await;

        let summary = RunSummary {
            total_rules: rules.len(),
            matched_entities: results.iter().map(|r| r.matched_entities.len()).sum(),
            generated_warnings: results.iter().map(|r| r.generated_warnings).sum(),
            total_execution_time_ms: elapsed_ms(started),
        };
        let totals = ExecutionTotals {
            total_rules: summary.total_rules,
            matched_entities: summary.matched_entities,
            generated_warnings: summary.generated_warnings,
            duration_ms: summary.total_execution_time_ms,
        };
        if let Err(err) = self
            .runner
            .retrying("finalize execution", || {
                self.store
                    .finish_execution(execution.id, RunStatus::Completed, &totals, None)
            })
            .await
        {
            let message = format!("failed to finalize execution record: {err}");
            error!(execution_id = %execution.id, error = %err, "aborting warning run");
            if let Err(mark_err) = self
                .store
                .finish_execution(execution.id, RunStatus::Failed, &totals, Some(&message))
                .await
            {
                error!(execution_id = %execution.id, error = %mark_err, "failed to mark execution as failed");
            }
            return Err(EngineError::Fatal(message));
        }

        info!(
            execution_id = %execution.id,
            rules = summary.total_rules,
            matched = summary.matched_entities,
            generated = summary.generated_warnings,
            elapsed_ms = summary.total_execution_time_ms,
            "warning run completed"
        );

        Ok(ExecutionReport {
            execution_id: execution.id,
            results,
            summary,
        })
    }

    /// Runs every rule on the worker pool and returns results in catalog order.
    async fn run_rules(&self, execution_id: Uuid, rules: &[RuleDefinition]) -> Vec<RuleResult> {
        let started = Instant::now();
        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = JoinSet::new();
        let audit_ids: Vec<Uuid> = rules.iter().map(|_| Uuid::new_v4()).collect();
        let progress: Vec<Arc<RuleProgress>> = rules.iter().map(|_| Arc::default()).collect();

        for (index, rule) in rules.iter().cloned().enumerate() {
            let runner = self.runner.clone();
            let semaphore = semaphore.clone();
            let audit_id = audit_ids[index];
            let rule_progress = progress[index].clone();
            let span = info_span!("rule", rule_id = %rule.id, rule = %rule.name);
            tasks.spawn(
                async move {
                    let _permit = semaphore.acquire_owned().await.ok();
                    (index, runner.run(execution_id, audit_id, rule, &rule_progress).await)
                }
                .instrument(span),
            );
        }

        let mut slots: Vec<Option<RuleResult>> = vec![None; rules.len()];
        let deadline = tokio::time::Instant::now() + self.run_timeout;
        let mut timed_out = false;

        loop {
            match tokio::time::timeout_at(deadline, tasks.join_next()).await {
                Ok(Some(Ok((index, result)))) => slots[index] = Some(result),
                Ok(Some(Err(join_err))) => {
                    error!(%execution_id, error = %join_err, "rule task terminated unexpectedly");
                }
                Ok(None) => break,
                Err(_) => {
                    timed_out = true;
                    warn!(
                        %execution_id,
                        timeout_secs = self.run_timeout.as_secs_f64(),
                        "run timeout reached, cancelling unfinished rules"
                    );
                    tasks.abort_all();
                    // Drain so no cancelled task can still touch the store.
                    while let Some(joined) = tasks.join_next().await {
                        if let Ok((index, result)) = joined {
                            slots[index] = Some(result);
                        }
                    }
                    break;
                }
            }
        }

        if slots.iter().all(Option::is_some) {
            return slots.into_iter().flatten().collect();
        }

        let message = if timed_out {
            format!("cancelled: run timeout of {:?} exceeded", self.run_timeout)
        } else {
            "rule task terminated unexpectedly".to_string()
        };
        let elapsed = elapsed_ms(started);

        // Unfinished rules keep whatever they wrote before they stopped.
        let mut fallback: Vec<Option<RuleResult>> = Vec::with_capacity(rules.len());
        for (index, rule) in rules.iter().enumerate() {
            if slots[index].is_some() {
                fallback.push(None);
                continue;
            }
            let (matched_entities, generated_warnings) = progress[index].snapshot();
            let closing = RuleExecutionOutcome {
                status: RunStatus::Failed,
                affected_entities: matched_entities.len(),
                generated_warnings,
                duration_ms: elapsed,
                error_message: Some(message.clone()),
            };
            if let Err(err) = self.store.finish_rule_execution(audit_ids[index], &closing).await {
                warn!(%execution_id, rule_id = %rule.id, error = %err, "could not close rule execution record");
            }
            fallback.push(Some(RuleResult {
                rule_id: rule.id,
                matched_entities,
                generated_warnings,
                duration_ms: elapsed,
                error: Some(message.clone()),
            }));
        }

        match self
            .store
            .fail_running_rule_executions(execution_id, &message)
            .await
        {
            Ok(updated) => warn!(%execution_id, updated, "marked unfinished rule executions as failed"),
            Err(err) => error!(%execution_id, error = %err, "failed to close unfinished rule executions"),
        }

        slots
            .into_iter()
            .zip(fallback)
            .filter_map(|(slot, fallback)| slot.or(fallback))
            .collect()
    }
}

/// Matches and inserts a rule has made so far, readable after the rule's
/// task is gone.
#[derive(Default)]
struct RuleProgress {
    matched: Mutex<Vec<String>>,
    generated: AtomicUsize,
}

impl RuleProgress {
    fn record_matches(&self, entity_ids: Vec<String>) {
        if let Ok(mut matched) = self.matched.lock() {
            *matched = entity_ids;
        }
    }

    fn record_insert(&self) {
        self.generated.fetch_add(1, Ordering::SeqCst);
    }

    fn snapshot(&self) -> (Vec<String>, usize) {
        let matched = self
            .matched
            .lock()
            .map(|matched| matched.clone())
            .unwrap_or_default();
        (matched, self.generated.load(Ordering::SeqCst))
    }
}

/// Everything a worker needs to run one rule end to end.
struct RuleRunner {
    store: Arc<dyn DataAccess>,
    evaluator: RuleEvaluator,
    writer: WarningWriter,
    retry: RetryPolicy,
}

impl RuleRunner {
    async fn run(
        &self,
        execution_id: Uuid,
        audit_id: Uuid,
        rule: RuleDefinition,
        progress: &RuleProgress,
    ) -> RuleResult {
        let started = Instant::now();
        let audit = RuleExecutionRecord {
            id: audit_id,
            execution_id,
            rule_id: rule.id,
            rule_snapshot: serde_json::to_value(&rule).unwrap_or(serde_json::Value::Null),
            status: RunStatus::Running,
            affected_entities: 0,
            generated_warnings: 0,
            duration_ms: 0,
            error_message: None,
            started_at: chrono::Utc::now(),
            completed_at: None,
        };

        if let Err(err) = self
            .retrying("start rule execution", || self.store.start_rule_execution(&audit))
            .await
        {
            warn!(error = %err, "could not open rule execution record");
            return RuleResult {
                rule_id: rule.id,
                matched_entities: Vec::new(),
                generated_warnings: 0,
                duration_ms: elapsed_ms(started),
                error: Some(err.to_string()),
            };
        }

        let outcome = self.evaluate_and_write(&rule, progress).await;
        let duration_ms = elapsed_ms(started);
        let (matched_entities, generated_warnings) = progress.snapshot();

        let (result, closing) = match outcome {
            Ok(()) => {
                info!(
                    matched = matched_entities.len(),
                    generated = generated_warnings,
                    duration_ms,
                    "rule completed"
                );
                let closing = RuleExecutionOutcome {
                    status: RunStatus::Completed,
                    affected_entities: matched_entities.len(),
                    generated_warnings,
                    duration_ms,
                    error_message: None,
                };
                let result = RuleResult {
                    rule_id: rule.id,
                    matched_entities,
                    generated_warnings,
                    duration_ms,
                    error: None,
                };
                (result, closing)
            }
            Err(err) => {
                match &err {
                    EngineError::Configuration(_) => warn!(error = %err, "skipping rule with invalid conditions"),
                    _ => warn!(error = %err, "rule failed"),
                }
                let closing = RuleExecutionOutcome {
                    status: RunStatus::Failed,
                    affected_entities: matched_entities.len(),
                    generated_warnings,
                    duration_ms,
                    error_message: Some(err.to_string()),
                };
                let result = RuleResult {
                    rule_id: rule.id,
                    matched_entities,
                    generated_warnings,
                    duration_ms,
                    error: Some(err.to_string()),
                };
                (result, closing)
            }
        };

        if let Err(err) = self
            .retrying("finish rule execution", || {
                self.store.finish_rule_execution(audit.id, &closing)
            })
            .await
        {
            error!(error = %err, "could not close rule execution record");
        }

        result
    }

    /// Counts go to `progress` as they happen, so a rule that fails midway
    /// still reports the warnings it already persisted.
    async fn evaluate_and_write(&self, rule: &RuleDefinition, progress: &RuleProgress) -> Result<()> {
        let conditions = RuleConditions::parse(&rule.conditions)?;
        let matches = self
            .retrying("evaluate", || self.evaluator.evaluate(&conditions))
            .await?;
        progress.record_matches(matches.iter().map(|m| m.entity_id.clone()).collect());

        for matched in matches.iter() {
            if self
                .retrying("write warning", || self.writer.write(rule.id, matched))
                .await?
            {
                progress.record_insert();
            }
        }
        Ok(())
    }

    /// Retries data-access failures with exponential backoff. Other errors
    /// are returned on the first attempt.
    async fn retrying<T, F, Fut>(&self, operation: &str, mut attempt_fn: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 1;
        loop {
            match attempt_fn().await {
                Ok(value) => return Ok(value),
                Err(err) if err.is_retryable() && attempt < self.retry.max_attempts => {
                    let delay = self.retry.delay_for(attempt);
                    warn!(
                        operation,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying after data access error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(err) => return Err(err),
            }
        }
    }
}

fn elapsed_ms(started: Instant) -> u64 {
    started.elapsed().as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{
        Entity, PerformanceRecord, RuleCategory, RuleScope, Severity, WarningDetails,
    };
    use crate::seed::sample_dataset;
    use crate::store::MemoryStore;
    use chrono::NaiveDate;
    use serde_json::json;

    fn fast_config() -> EngineConfig {
        EngineConfig {
            retry: RetryPolicy {
                max_attempts: 3,
                base_delay: Duration::from_millis(1),
            },
            ..EngineConfig::default()
        }
    }

    fn rule(name: &str, priority: i32, conditions: serde_json::Value) -> RuleDefinition {
        RuleDefinition {
            id: Uuid::new_v4(),
            name: name.to_string(),
            category: RuleCategory::Grade,
            conditions,
            severity: Severity::High,
            scope: RuleScope::Global,
            priority,
            is_active: true,
        }
    }

    fn scores(entity: &str, subject: &str, values: &[f64]) -> Vec<PerformanceRecord> {
        values
            .iter()
            .enumerate()
            .map(|(i, score)| PerformanceRecord {
                entity_id: entity.to_string(),
                subject: subject.to_string(),
                score: *score,
                assessment_date: NaiveDate::from_ymd_opt(2026, 2, 1 + i as u32 * 7).unwrap(),
                assessment_title: format!("Exam {}", i + 1),
                rank: None,
            })
            .collect()
    }

    async fn store_with(rules: Vec<RuleDefinition>, records: Vec<PerformanceRecord>) -> Arc<MemoryStore> {
        let store = Arc::new(MemoryStore::new());
        store
            .add_entity(Entity {
                entity_id: "S1".to_string(),
                name: "Avery Lee".to_string(),
                class_name: "7A".to_string(),
            })
            .unwrap();
        store.add_records(records).unwrap();
        for rule in rules.iter() {
            store.insert_rule(rule).await.unwrap();
        }
        store
    }

    async fn assert_all_terminal(store: &MemoryStore, execution_id: Uuid) {
        let rule_runs = store.rule_executions(execution_id).await.unwrap();
        assert!(rule_runs.iter().all(|r| r.status.is_terminal()), "{rule_runs:?}");
    }

    #[tokio::test]
    async fn consecutive_fails_creates_exactly_one_warning() {
        let fails = rule(
            "fails",
            1,
            json!({"type": "consecutive_fails", "times": 3, "score_threshold": 60}),
        );
        let store = store_with(vec![fails.clone()], scores("S1", "math", &[55.0, 58.0, 50.0, 52.0])).await;
        let coordinator = ExecutionCoordinator::new(store.clone(), &fast_config());

        let report = coordinator.execute_all(Some("test")).await.unwrap();
        assert_eq!(report.summary.generated_warnings, 1);
        assert_eq!(report.results[0].matched_entities, vec!["S1".to_string()]);

        let warnings = store.active_warnings().await.unwrap();
        assert_eq!(warnings.len(), 1);
        assert_eq!(warnings[0].rule_id, fails.id);
        match &warnings[0].details {
            WarningDetails::ConsecutiveFails { fail_count, window, .. } => {
                assert!(*fail_count >= 3);
                assert!(window.starts_with("at least 3 consecutive sub-threshold scores"));
            }
            other => panic!("unexpected details {other:?}"),
        }
    }

    #[tokio::test]
    async fn repeated_runs_are_idempotent() {
        let store = Arc::new(MemoryStore::with_dataset(sample_dataset().unwrap()).unwrap());
        let coordinator = ExecutionCoordinator::new(store.clone(), &fast_config());

        let first = coordinator.execute_all(None).await.unwrap();
        assert!(first.summary.generated_warnings > 0);
        let after_first = store.active_warnings().await.unwrap().len();

        let second = coordinator.execute_all(None).await.unwrap();
        assert_eq!(second.summary.generated_warnings, 0);
        assert_eq!(second.summary.matched_entities, first.summary.matched_entities);
        assert_eq!(store.active_warnings().await.unwrap().len(), after_first);

        let warnings = store.active_warnings().await.unwrap();
        let mut pairs: Vec<(String, Uuid)> = warnings.iter().map(|w| (w.entity_id.clone(), w.rule_id)).collect();
        pairs.sort();
        pairs.dedup();
        assert_eq!(pairs.len(), warnings.len());
    }

    #[tokio::test]
    async fn trend_rule_predicts_next_total() {
        let trend = rule(
            "trend",
            1,
            json!({"type": "ml_trend_analysis", "decline_rate": -2, "confidence_threshold": 0.5}),
        );
        let store = store_with(vec![trend], scores("S1", "total", &[300.0, 290.0, 250.0, 200.0])).await;
        let coordinator = ExecutionCoordinator::new(store.clone(), &fast_config());

        let report = coordinator.execute_all(None).await.unwrap();
        assert_eq!(report.summary.generated_warnings, 1);

        let warnings = store.active_warnings().await.unwrap();
        match &warnings[0].details {
            WarningDetails::MlTrendAnalysis {
                slope,
                intercept,
                predicted_next,
                data_points,
                ..
            } => {
                assert!((slope + 34.0).abs() < 1e-9);
                assert!((predicted_next - (slope * 5.0 + intercept)).abs() < 1e-9);
                assert!((predicted_next - 175.0).abs() < 1e-9);
                assert_eq!(*data_points, 4);
            }
            other => panic!("unexpected details {other:?}"),
        }
    }

    #[tokio::test]
    async fn invalid_rule_is_skipped_and_run_continues() {
        let broken = rule("broken", 10, json!({"type": "attendance_rate", "threshold": 0.8}));
        let exam = rule("exam", 1, json!({"type": "exam_fail", "threshold": 60}));
        let store = store_with(vec![broken.clone(), exam.clone()], scores("S1", "math", &[80.0, 45.0])).await;
        let coordinator = ExecutionCoordinator::new(store.clone(), &fast_config());

        let report = coordinator.execute_all(None).await.unwrap();
        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].rule_id, broken.id);
        assert!(report.results[0]
            .error
            .as_deref()
            .unwrap()
            .starts_with("configuration error"));
        assert_eq!(report.results[1].rule_id, exam.id);
        assert!(report.results[1].error.is_none());
        assert_eq!(report.summary.generated_warnings, 1);

        let rule_runs = store.rule_executions(report.execution_id).await.unwrap();
        let broken_run = rule_runs.iter().find(|r| r.rule_id == broken.id).unwrap();
        assert_eq!(broken_run.status, RunStatus::Failed);
        assert_eq!(broken_run.rule_snapshot["name"], "broken");
        assert_all_terminal(&store, report.execution_id).await;

        let execution = store.execution(report.execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, RunStatus::Completed);
        assert_eq!(execution.totals.total_rules, 2);
    }

    #[tokio::test]
    async fn transient_data_errors_are_retried() {
        let exam = rule("exam", 1, json!({"type": "exam_fail", "threshold": 60}));
        let store = store_with(vec![exam], scores("S1", "math", &[45.0])).await;
        store.fail_record_queries(2);
        let coordinator = ExecutionCoordinator::new(store.clone(), &fast_config());

        let report = coordinator.execute_all(None).await.unwrap();
        assert!(report.results[0].error.is_none());
        assert_eq!(report.summary.generated_warnings, 1);
    }

    #[tokio::test]
    async fn exhausted_retries_fail_only_that_rule() {
        let exam = rule("exam", 1, json!({"type": "exam_fail", "threshold": 60}));
        let store = store_with(vec![exam], scores("S1", "math", &[45.0])).await;
        store.fail_record_queries(5);
        let coordinator = ExecutionCoordinator::new(store.clone(), &fast_config());

        let report = coordinator.execute_all(None).await.unwrap();
        assert!(report.results[0]
            .error
            .as_deref()
            .unwrap()
            .contains("record query timed out"));

        let rule_runs = store.rule_executions(report.execution_id).await.unwrap();
        assert_eq!(rule_runs[0].status, RunStatus::Failed);
        let execution = store.execution(report.execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn unavailable_catalog_aborts_and_marks_execution_failed() {
        let store = store_with(Vec::new(), Vec::new()).await;
        store.set_catalog_unavailable(true);
        let coordinator = ExecutionCoordinator::new(store.clone(), &fast_config());

        let err = coordinator.execute_all(Some("nightly")).await.unwrap_err();
        assert!(matches!(err, EngineError::Fatal(_)));

        let executions = store.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, RunStatus::Failed);
        assert!(executions[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("rule catalog"));
    }

    #[tokio::test]
    async fn failed_finalize_marks_execution_failed() {
        let exam = rule("exam", 1, json!({"type": "exam_fail", "threshold": 60}));
        let store = store_with(vec![exam], scores("S1", "math", &[45.0])).await;
        store.set_finalize_unavailable(true);
        let coordinator = ExecutionCoordinator::new(store.clone(), &fast_config());

        let err = coordinator.execute_all(Some("nightly")).await.unwrap_err();
        assert!(matches!(err, EngineError::Fatal(_)));
        assert!(err.to_string().contains("connection reset"));

        let executions = store.executions();
        assert_eq!(executions.len(), 1);
        assert_eq!(executions[0].status, RunStatus::Failed);
        assert_eq!(executions[0].totals.generated_warnings, 1);
        assert!(executions[0]
            .error_message
            .as_deref()
            .unwrap()
            .contains("failed to finalize execution record"));
    }

    #[tokio::test]
    async fn rule_failing_midway_reports_warnings_already_written() {
        let exam = rule("exam", 1, json!({"type": "exam_fail", "threshold": 60}));
        let mut records = scores("S1", "math", &[45.0]);
        records.extend(scores("S2", "math", &[40.0]));
        let store = store_with(vec![exam], records).await;
        store.fail_warning_inserts_after(1);
        let coordinator = ExecutionCoordinator::new(store.clone(), &fast_config());

        let report = coordinator.execute_all(None).await.unwrap();
        let result = &report.results[0];
        assert!(result.error.as_deref().unwrap().contains("disk full"));
        assert_eq!(result.generated_warnings, 1);
        assert_eq!(result.matched_entities, vec!["S1".to_string(), "S2".to_string()]);
        assert_eq!(report.summary.generated_warnings, 1);
        assert_eq!(store.active_warnings().await.unwrap().len(), 1);

        let rule_runs = store.rule_executions(report.execution_id).await.unwrap();
        assert_eq!(rule_runs[0].status, RunStatus::Failed);
        assert_eq!(rule_runs[0].generated_warnings, 1);
        assert_eq!(rule_runs[0].affected_entities, 2);
    }

    #[tokio::test]
    async fn timed_out_rule_keeps_its_persisted_warnings() {
        let exam = rule("exam", 1, json!({"type": "exam_fail", "threshold": 60}));
        let mut records = scores("S1", "math", &[45.0]);
        records.extend(scores("S2", "math", &[40.0]));
        let store = store_with(vec![exam], records).await;
        store.stall_warning_inserts_after(1);
        let config = EngineConfig {
            run_timeout: Duration::from_millis(200),
            ..fast_config()
        };
        let coordinator = ExecutionCoordinator::new(store.clone(), &config);

        let report = coordinator.execute_all(None).await.unwrap();
        let result = &report.results[0];
        assert!(result.error.as_deref().unwrap().contains("run timeout"));
        assert_eq!(result.generated_warnings, 1);
        assert_eq!(result.matched_entities.len(), 2);
        assert_eq!(store.active_warnings().await.unwrap().len(), 1);

        let rule_runs = store.rule_executions(report.execution_id).await.unwrap();
        assert_eq!(rule_runs[0].status, RunStatus::Failed);
        assert_eq!(rule_runs[0].generated_warnings, 1);
        let execution = store.execution(report.execution_id).await.unwrap().unwrap();
        assert_eq!(execution.totals.generated_warnings, 1);
    }

    #[tokio::test]
    async fn run_timeout_closes_every_rule_execution() {
        let rules = vec![
            rule("slow-a", 2, json!({"type": "exam_fail", "threshold": 60})),
            rule("slow-b", 1, json!({"type": "grade_decline", "decline_threshold": 5, "consecutive_count": 1})),
        ];
        let store = store_with(rules, scores("S1", "math", &[80.0, 45.0])).await;
        store.set_record_latency(Duration::from_millis(500));
        let config = EngineConfig {
            run_timeout: Duration::from_millis(50),
            ..fast_config()
        };
        let coordinator = ExecutionCoordinator::new(store.clone(), &config);

        let report = coordinator.execute_all(None).await.unwrap();
        assert!(report
            .results
            .iter()
            .all(|r| r.error.as_deref().unwrap_or_default().contains("run timeout")));

        let rule_runs = store.rule_executions(report.execution_id).await.unwrap();
        assert_eq!(rule_runs.len(), 2);
        assert!(rule_runs.iter().all(|r| r.status == RunStatus::Failed));
        let execution = store.execution(report.execution_id).await.unwrap().unwrap();
        assert_eq!(execution.status, RunStatus::Completed);
    }

    #[tokio::test]
    async fn results_follow_catalog_priority_under_concurrency() {
        let rules: Vec<RuleDefinition> = (0..6)
            .map(|i| rule(&format!("rule-{i}"), i, json!({"type": "exam_fail", "threshold": 60})))
            .collect();
        let store = store_with(rules.clone(), scores("S1", "math", &[45.0])).await;
        let config = EngineConfig {
            concurrency: 3,
            ..fast_config()
        };
        let coordinator = ExecutionCoordinator::new(store.clone(), &config);

        let report = coordinator.execute_all(None).await.unwrap();
        let expected: Vec<Uuid> = rules.iter().rev().map(|r| r.id).collect();
        let actual: Vec<Uuid> = report.results.iter().map(|r| r.rule_id).collect();
        assert_eq!(actual, expected);
        assert_eq!(report.summary.generated_warnings, 6);
        assert_all_terminal(&store, report.execution_id).await;
    }
}
