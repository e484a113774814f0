//! The data-access seam between the engine and its storage.
//!
//! [`PgStore`](crate::db::PgStore) is the production implementation;
//! [`MemoryStore`] backs the `demo` command and the test suite. Both enforce
//! the one-active-warning-per-`(entity_id, rule_id)` invariant themselves.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{
    Entity, ExecutionRecord, ExecutionTotals, HomeworkSubmission, InsertOutcome, ManualPriority,
    PerformanceRecord, PriorityStatus, RuleDefinition, RuleExecutionOutcome, RuleExecutionRecord,
    RunStatus, WarningRecord, WarningStatus,
};
use crate::seed::Dataset;

/// Restricts which performance records a query returns. Empty lists mean
/// "no restriction".
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordFilter {
    pub subject: Option<String>,
    pub class_names: Vec<String>,
    pub assessment_titles: Vec<String>,
    pub since: Option<NaiveDate>,
}

impl RecordFilter {
    pub fn for_subject(subject: Option<String>) -> Self {
        Self {
            subject,
            ..Self::default()
        }
    }

    pub fn matches(&self, record: &PerformanceRecord, class_name: Option<&str>) -> bool {
        if let Some(subject) = &self.subject {
            if &record.subject != subject {
                return false;
            }
        }
        if !self.class_names.is_empty() {
            match class_name {
                Some(class_name) if self.class_names.iter().any(|c| c == class_name) => {}
                _ => return false,
            }
        }
        if !self.assessment_titles.is_empty()
            && !self.assessment_titles.iter().any(|t| t == &record.assessment_title)
        {
            return false;
        }
        if let Some(since) = self.since {
            if record.assessment_date < since {
                return false;
            }
        }
        true
    }
}

#[async_trait]
pub trait DataAccess: Send + Sync {
    /// Active rules, highest priority first.
    async fn active_rules(&self) -> Result<Vec<RuleDefinition>>;

    async fn insert_rule(&self, rule: &RuleDefinition) -> Result<()>;

    /// Records ordered by entity, then date, title and subject.
    async fn performance_records(&self, filter: &RecordFilter) -> Result<Vec<PerformanceRecord>>;

    async fn homework_submissions(&self) -> Result<Vec<HomeworkSubmission>>;

    async fn entities(&self) -> Result<Vec<Entity>>;

    async fn start_execution(&self, trigger: Option<&str>) -> Result<ExecutionRecord>;

    async fn finish_execution(
        &self,
        execution_id: Uuid,
        status: RunStatus,
        totals: &ExecutionTotals,
        error_message: Option<&str>,
    ) -> Result<()>;

    async fn execution(&self, execution_id: Uuid) -> Result<Option<ExecutionRecord>>;

    /// Idempotent on `record.id`, so a retried insert never duplicates the row.
    async fn start_rule_execution(&self, record: &RuleExecutionRecord) -> Result<()>;

    async fn finish_rule_execution(&self, id: Uuid, outcome: &RuleExecutionOutcome) -> Result<()>;

    /// Marks every still-running rule execution of a run as failed.
    async fn fail_running_rule_executions(&self, execution_id: Uuid, message: &str) -> Result<usize>;

    async fn rule_executions(&self, execution_id: Uuid) -> Result<Vec<RuleExecutionRecord>>;

    async fn has_active_warning(&self, entity_id: &str, rule_id: Uuid) -> Result<bool>;

    /// Must report `Duplicate` instead of creating a second active warning
    /// for the same `(entity_id, rule_id)`.
    async fn insert_warning(&self, warning: &WarningRecord) -> Result<InsertOutcome>;

    async fn resolve_warning(&self, warning_id: Uuid) -> Result<bool>;

    async fn active_warnings(&self) -> Result<Vec<WarningRecord>>;

    async fn active_priority_entries(&self) -> Result<Vec<ManualPriority>>;

    /// `Duplicate` when the entity already has an active manual entry.
    async fn insert_priority_entry(&self, entry: &ManualPriority) -> Result<InsertOutcome>;

    async fn set_priority_status(&self, id: Uuid, status: PriorityStatus) -> Result<bool>;
}

#[derive(Default)]
struct MemoryState {
    entities: Vec<Entity>,
    records: Vec<PerformanceRecord>,
    homework: Vec<HomeworkSubmission>,
    rules: Vec<RuleDefinition>,
    executions: HashMap<Uuid, ExecutionRecord>,
    rule_executions: Vec<RuleExecutionRecord>,
    warnings: Vec<WarningRecord>,
    priorities: Vec<ManualPriority>,
}

/// What a warning insert does once its budget is spent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(not(test), allow(dead_code))]
enum InsertLimit {
    Fail,
    Stall,
}

/// In-process store. Every check-then-write happens under one lock.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    record_failures: AtomicU32,
    catalog_unavailable: AtomicBool,
    record_latency_ms: AtomicU64,
    finalize_unavailable: AtomicBool,
    warning_budget: Mutex<Option<(u32, InsertLimit)>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_dataset(dataset: Dataset) -> Result<Self> {
        let store = Self::new();
        {
            let mut state = store.state()?;
            state.entities = dataset.entities;
            state.records = dataset.records;
            state.homework = dataset.homework;
            state.rules = dataset.rules;
            state.priorities = dataset.priorities;
        }
        Ok(store)
    }

    #[cfg(test)]
    pub fn add_entity(&self, entity: Entity) -> Result<()> {
        self.state()?.entities.push(entity);
        Ok(())
    }

    #[cfg(test)]
    pub fn add_records(&self, records: impl IntoIterator<Item = PerformanceRecord>) -> Result<()> {
        self.state()?.records.extend(records);
        Ok(())
    }

    #[cfg(test)]
    pub fn add_homework(&self, submissions: impl IntoIterator<Item = HomeworkSubmission>) -> Result<()> {
        self.state()?.homework.extend(submissions);
        Ok(())
    }

    /// Makes the next `count` record queries fail with a data-access error.
    #[cfg(test)]
    pub fn fail_record_queries(&self, count: u32) {
        self.record_failures.store(count, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn set_catalog_unavailable(&self, unavailable: bool) {
        self.catalog_unavailable.store(unavailable, Ordering::SeqCst);
    }

    #[cfg(test)]
    pub fn set_record_latency(&self, latency: Duration) {
        self.record_latency_ms
            .store(latency.as_millis() as u64, Ordering::SeqCst);
    }

    /// Makes `finish_execution` reject the `completed` status.
    #[cfg(test)]
    pub fn set_finalize_unavailable(&self, unavailable: bool) {
        self.finalize_unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Lets `allowed` warning inserts through, then fails every later one.
    #[cfg(test)]
    pub fn fail_warning_inserts_after(&self, allowed: u32) {
        if let Ok(mut budget) = self.warning_budget.lock() {
            *budget = Some((allowed, InsertLimit::Fail));
        }
    }

    /// Lets `allowed` warning inserts through, then blocks every later one.
    #[cfg(test)]
    pub fn stall_warning_inserts_after(&self, allowed: u32) {
        if let Ok(mut budget) = self.warning_budget.lock() {
            *budget = Some((allowed, InsertLimit::Stall));
        }
    }

    #[cfg(test)]
    pub fn executions(&self) -> Vec<ExecutionRecord> {
        self.state()
            .map(|state| state.executions.values().cloned().collect())
            .unwrap_or_default()
    }

    fn spend_warning_budget(&self) -> Result<Option<InsertLimit>> {
        let mut budget = self
            .warning_budget
            .lock()
            .map_err(|_| EngineError::DataAccess("memory store lock poisoned".to_string()))?;
        match budget.as_mut() {
            Some((0, limit)) => Ok(Some(*limit)),
            Some((remaining, _)) => {
                *remaining -= 1;
                Ok(None)
            }
            None => Ok(None),
        }
    }

    fn state(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| EngineError::DataAccess("memory store lock poisoned".to_string()))
    }
}

#[async_trait]
impl DataAccess for MemoryStore {
    async fn active_rules(&self) -> Result<Vec<RuleDefinition>> {
        if self.catalog_unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::DataAccess("rule catalog unavailable".to_string()));
        }
        let mut rules: Vec<RuleDefinition> = self
            .state()?
            .rules
            .iter()
            .filter(|rule| rule.is_active)
            .cloned()
            .collect();
        rules.sort_by(|a, b| b.priority.cmp(&a.priority));
        Ok(rules)
    }

    async fn insert_rule(&self, rule: &RuleDefinition) -> Result<()> {
        self.state()?.rules.push(rule.clone());
        Ok(())
    }

    async fn performance_records(&self, filter: &RecordFilter) -> Result<Vec<PerformanceRecord>> {
        let latency = self.record_latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }

        if self
            .record_failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
        {
            return Err(EngineError::DataAccess("record query timed out".to_string()));
        }

        let state = self.state()?;
        let classes: HashMap<&str, &str> = state
            .entities
            .iter()
            .map(|e| (e.entity_id.as_str(), e.class_name.as_str()))
            .collect();

        let mut records: Vec<PerformanceRecord> = state
            .records
            .iter()
            .filter(|r| filter.matches(r, classes.get(r.entity_id.as_str()).copied()))
            .cloned()
            .collect();
        records.sort_by(|a, b| {
            a.entity_id
                .cmp(&b.entity_id)
                .then_with(|| a.assessment_date.cmp(&b.assessment_date))
                .then_with(|| a.assessment_title.cmp(&b.assessment_title))
                .then_with(|| a.subject.cmp(&b.subject))
        });
        Ok(records)
    }

    async fn homework_submissions(&self) -> Result<Vec<HomeworkSubmission>> {
        Ok(self.state()?.homework.clone())
    }

    async fn entities(&self) -> Result<Vec<Entity>> {
        Ok(self.state()?.entities.clone())
    }

    async fn start_execution(&self, trigger: Option<&str>) -> Result<ExecutionRecord> {
        let record = ExecutionRecord {
            id: Uuid::new_v4(),
            trigger: trigger.map(str::to_string),
            status: RunStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            totals: ExecutionTotals::default(),
            error_message: None,
        };
        self.state()?.executions.insert(record.id, record.clone());
        Ok(record)
    }

    async fn finish_execution(
        &self,
        execution_id: Uuid,
        status: RunStatus,
        totals: &ExecutionTotals,
        error_message: Option<&str>,
    ) -> Result<()> {
        if status == RunStatus::Completed && self.finalize_unavailable.load(Ordering::SeqCst) {
            return Err(EngineError::DataAccess("connection reset".to_string()));
        }
        let mut state = self.state()?;
        let record = state
            .executions
            .get_mut(&execution_id)
            .ok_or_else(|| EngineError::DataAccess(format!("execution {execution_id} not found")))?;
        record.status = status;
        record.totals = totals.clone();
        record.error_message = error_message.map(str::to_string);
        record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn execution(&self, execution_id: Uuid) -> Result<Option<ExecutionRecord>> {
        Ok(self.state()?.executions.get(&execution_id).cloned())
    }

    async fn start_rule_execution(&self, record: &RuleExecutionRecord) -> Result<()> {
        let mut state = self.state()?;
        if !state.rule_executions.iter().any(|r| r.id == record.id) {
            state.rule_executions.push(record.clone());
        }
        Ok(())
    }

    async fn finish_rule_execution(&self, id: Uuid, outcome: &RuleExecutionOutcome) -> Result<()> {
        let mut state = self.state()?;
        let record = state
            .rule_executions
            .iter_mut()
            .find(|r| r.id == id)
            .ok_or_else(|| EngineError::DataAccess(format!("rule execution {id} not found")))?;
        record.status = outcome.status;
        record.affected_entities = outcome.affected_entities;
        record.generated_warnings = outcome.generated_warnings;
        record.duration_ms = outcome.duration_ms;
        record.error_message = outcome.error_message.clone();
        record.completed_at = Some(Utc::now());
        Ok(())
    }

    async fn fail_running_rule_executions(&self, execution_id: Uuid, message: &str) -> Result<usize> {
        let mut state = self.state()?;
        let now = Utc::now();
        let mut updated = 0;
        for record in state
            .rule_executions
            .iter_mut()
            .filter(|r| r.execution_id == execution_id && r.status == RunStatus::Running)
        {
            record.status = RunStatus::Failed;
            record.error_message = Some(message.to_string());
            record.completed_at = Some(now);
            updated += 1;
        }
        Ok(updated)
    }

    async fn rule_executions(&self, execution_id: Uuid) -> Result<Vec<RuleExecutionRecord>> {
        Ok(self
            .state()?
            .rule_executions
            .iter()
            .filter(|r| r.execution_id == execution_id)
            .cloned()
            .collect())
    }

    async fn has_active_warning(&self, entity_id: &str, rule_id: Uuid) -> Result<bool> {
        Ok(self.state()?.warnings.iter().any(|w| {
            w.entity_id == entity_id && w.rule_id == rule_id && w.status == WarningStatus::Active
        }))
    }

    async fn insert_warning(&self, warning: &WarningRecord) -> Result<InsertOutcome> {
        match self.spend_warning_budget()? {
            Some(InsertLimit::Fail) => return Err(EngineError::DataAccess("disk full".to_string())),
            Some(InsertLimit::Stall) => tokio::time::sleep(Duration::from_secs(60)).await,
            None => {}
        }

        let mut state = self.state()?;
        let duplicate = warning.status == WarningStatus::Active
            && state.warnings.iter().any(|w| {
                w.entity_id == warning.entity_id
                    && w.rule_id == warning.rule_id
                    && w.status == WarningStatus::Active
            });
        if duplicate {
            return Ok(InsertOutcome::Duplicate);
        }
        state.warnings.push(warning.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn resolve_warning(&self, warning_id: Uuid) -> Result<bool> {
        let mut state = self.state()?;
        match state
            .warnings
            .iter_mut()
            .find(|w| w.id == warning_id && w.status == WarningStatus::Active)
        {
            Some(warning) => {
                warning.status = WarningStatus::Resolved;
                warning.resolved_at = Some(Utc::now());
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn active_warnings(&self) -> Result<Vec<WarningRecord>> {
        Ok(self
            .state()?
            .warnings
            .iter()
            .filter(|w| w.status == WarningStatus::Active)
            .cloned()
            .collect())
    }

    async fn active_priority_entries(&self) -> Result<Vec<ManualPriority>> {
        Ok(self
            .state()?
            .priorities
            .iter()
            .filter(|p| p.status == PriorityStatus::Active)
            .cloned()
            .collect())
    }

    async fn insert_priority_entry(&self, entry: &ManualPriority) -> Result<InsertOutcome> {
        let mut state = self.state()?;
        let duplicate = entry.status == PriorityStatus::Active
            && state
                .priorities
                .iter()
                .any(|p| p.entity_id == entry.entity_id && p.status == PriorityStatus::Active);
        if duplicate {
            return Ok(InsertOutcome::Duplicate);
        }
        state.priorities.push(entry.clone());
        Ok(InsertOutcome::Inserted)
    }

    async fn set_priority_status(&self, id: Uuid, status: PriorityStatus) -> Result<bool> {
        let mut state = self.state()?;
        if status == PriorityStatus::Active {
            let entity_id = match state.priorities.iter().find(|p| p.id == id) {
                Some(entry) => entry.entity_id.clone(),
                None => return Ok(false),
            };
            let conflict = state
                .priorities
                .iter()
                .any(|p| p.id != id && p.entity_id == entity_id && p.status == PriorityStatus::Active);
            if conflict {
                return Err(EngineError::Configuration(format!(
                    "entity {entity_id} already has an active priority entry"
                )));
            }
        }
        match state.priorities.iter_mut().find(|p| p.id == id) {
            Some(entry) => {
                entry.status = status;
                Ok(true)
            }
            None => Ok(false),
        }
    }
}
