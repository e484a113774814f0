use anyhow::Context;
use async_trait::async_trait;
use chrono::{NaiveDate, Utc};
use sqlx::postgres::{PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use uuid::Uuid;

use crate::error::{EngineError, Result};
use crate::models::{
    Entity, ExecutionRecord, ExecutionTotals, HomeworkSubmission, InsertOutcome, ManualPriority,
    PerformanceRecord, PriorityStatus, RuleDefinition, RuleExecutionOutcome, RuleExecutionRecord,
    RunStatus, WarningRecord,
};
use crate::seed::sample_dataset;
use crate::store::{DataAccess, RecordFilter};

pub async fn connect(database_url: &str) -> anyhow::Result<PgPool> {
    PgPoolOptions::new()
        .max_connections(5)
        .connect(database_url)
        .await
        .context("failed to connect to Postgres")
}

pub async fn init_db(pool: &PgPool) -> anyhow::Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

pub async fn seed(pool: &PgPool) -> anyhow::Result<()> {
    let dataset = sample_dataset()?;
    let store = PgStore::new(pool.clone());

    for entity in dataset.entities.iter() {
        upsert_entity(pool, &entity.entity_id, &entity.name, &entity.class_name).await?;
    }

    for record in dataset.records.iter() {
        insert_record(pool, record).await?;
    }

    for submission in dataset.homework.iter() {
        sqlx::query(
            r#"
            INSERT INTO cohort_warning.homework_submissions
            (id, entity_id, homework_title, due_date, status)
            VALUES ($1, $2, $3, $4, $5)
            ON CONFLICT (entity_id, homework_title) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&submission.entity_id)
        .bind(&submission.homework_title)
        .bind(submission.due_date)
        .bind(submission.status.as_str())
        .execute(pool)
        .await?;
    }

    for rule in dataset.rules.iter() {
        store.insert_rule(rule).await?;
    }

    for entry in dataset.priorities.iter() {
        store.insert_priority_entry(entry).await?;
    }

    Ok(())
}

/// Imports performance records; returns how many were new.
pub async fn import_csv(pool: &PgPool, csv_path: &std::path::Path) -> anyhow::Result<usize> {
    #[derive(serde::Deserialize)]
    struct CsvRow {
        entity_id: String,
        name: String,
        class_name: String,
        subject: String,
        score: f64,
        assessment_date: NaiveDate,
        assessment_title: String,
        rank: Option<i32>,
    }

    let mut reader = csv::Reader::from_path(csv_path)?;
    let mut inserted = 0usize;

    for result in reader.deserialize::<CsvRow>() {
        let row = result?;
        upsert_entity(pool, &row.entity_id, &row.name, &row.class_name).await?;

        let record = PerformanceRecord {
            entity_id: row.entity_id,
            subject: row.subject,
            score: row.score,
            assessment_date: row.assessment_date,
            assessment_title: row.assessment_title,
            rank: row.rank,
        };
        if insert_record(pool, &record).await? {
            inserted += 1;
        }
    }

    Ok(inserted)
}

async fn upsert_entity(pool: &PgPool, entity_id: &str, name: &str, class_name: &str) -> anyhow::Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cohort_warning.entities (entity_id, name, class_name)
        VALUES ($1, $2, $3)
        ON CONFLICT (entity_id) DO UPDATE
        SET name = EXCLUDED.name, class_name = EXCLUDED.class_name
        "#,
    )
    .bind(entity_id)
    .bind(name)
    .bind(class_name)
    .execute(pool)
    .await?;
    Ok(())
}

async fn insert_record(pool: &PgPool, record: &PerformanceRecord) -> anyhow::Result<bool> {
    let result = sqlx::query(
        r#"
        INSERT INTO cohort_warning.performance_records
        (id, entity_id, subject, score, assessment_date, assessment_title, rank)
        VALUES ($1, $2, $3, $4, $5, $6, $7)
        ON CONFLICT (entity_id, subject, assessment_title, assessment_date) DO NOTHING
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(&record.entity_id)
    .bind(&record.subject)
    .bind(record.score)
    .bind(record.assessment_date)
    .bind(&record.assessment_title)
    .bind(record.rank)
    .execute(pool)
    .await?;

    Ok(result.rows_affected() > 0)
}

/// Postgres-backed [`DataAccess`].
#[derive(Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

fn rule_from_row(row: &PgRow) -> Result<RuleDefinition> {
    Ok(RuleDefinition {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        category: row.try_get::<String, _>("category")?.parse()?,
        conditions: row.try_get("conditions")?,
        severity: row.try_get::<String, _>("severity")?.parse()?,
        scope: row.try_get::<String, _>("scope")?.parse()?,
        priority: row.try_get("priority")?,
        is_active: row.try_get("is_active")?,
    })
}

fn execution_from_row(row: &PgRow) -> Result<ExecutionRecord> {
    Ok(ExecutionRecord {
        id: row.try_get("id")?,
        trigger: row.try_get("trigger_source")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
        totals: ExecutionTotals {
            total_rules: row.try_get::<i64, _>("total_rules")? as usize,
            matched_entities: row.try_get::<i64, _>("matched_entities")? as usize,
            generated_warnings: row.try_get::<i64, _>("generated_warnings")? as usize,
            duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
        },
        error_message: row.try_get("error_message")?,
    })
}

fn rule_execution_from_row(row: &PgRow) -> Result<RuleExecutionRecord> {
    Ok(RuleExecutionRecord {
        id: row.try_get("id")?,
        execution_id: row.try_get("execution_id")?,
        rule_id: row.try_get("rule_id")?,
        rule_snapshot: row.try_get("rule_snapshot")?,
        status: row.try_get::<String, _>("status")?.parse()?,
        affected_entities: row.try_get::<i64, _>("affected_entities")? as usize,
        generated_warnings: row.try_get::<i64, _>("generated_warnings")? as usize,
        duration_ms: row.try_get::<i64, _>("duration_ms")? as u64,
        error_message: row.try_get("error_message")?,
        started_at: row.try_get("started_at")?,
        completed_at: row.try_get("completed_at")?,
    })
}

fn warning_from_row(row: &PgRow) -> Result<WarningRecord> {
    Ok(WarningRecord {
        id: row.try_get("id")?,
        entity_id: row.try_get("entity_id")?,
        rule_id: row.try_get("rule_id")?,
        details: serde_json::from_value(row.try_get("details")?)?,
        status: row.try_get::<String, _>("status")?.parse()?,
        created_at: row.try_get("created_at")?,
        resolved_at: row.try_get("resolved_at")?,
    })
}

fn priority_from_row(row: &PgRow) -> Result<ManualPriority> {
    Ok(ManualPriority {
        id: row.try_get("id")?,
        entity_id: row.try_get("entity_id")?,
        severity: row.try_get::<String, _>("severity")?.parse()?,
        status: row.try_get::<String, _>("status")?.parse()?,
        custom_tags: row.try_get("custom_tags")?,
        reason: row.try_get("reason")?,
        intervention_goals: row.try_get("intervention_goals")?,
        notes: row.try_get("notes")?,
        algorithm_score: row.try_get("algorithm_score")?,
        created_at: row.try_get("created_at")?,
    })
}

#[async_trait]
impl DataAccess for PgStore {
    async fn active_rules(&self) -> Result<Vec<RuleDefinition>> {
        let rows = sqlx::query(
            r#"
            SELECT id, name, category, conditions, severity, scope, priority, is_active
            FROM cohort_warning.warning_rules
            WHERE is_active
            ORDER BY priority DESC, created_at
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(rule_from_row).collect()
    }

    async fn insert_rule(&self, rule: &RuleDefinition) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cohort_warning.warning_rules
            (id, name, category, conditions, severity, scope, priority, is_active)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
            ON CONFLICT (id) DO UPDATE
            SET name = EXCLUDED.name, category = EXCLUDED.category,
                conditions = EXCLUDED.conditions, severity = EXCLUDED.severity,
                scope = EXCLUDED.scope, priority = EXCLUDED.priority,
                is_active = EXCLUDED.is_active
            "#,
        )
        .bind(rule.id)
        .bind(&rule.name)
        .bind(rule.category.as_str())
        .bind(&rule.conditions)
        .bind(rule.severity.as_str())
        .bind(rule.scope.as_str())
        .bind(rule.priority)
        .bind(rule.is_active)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn performance_records(&self, filter: &RecordFilter) -> Result<Vec<PerformanceRecord>> {
        let mut query = String::from(
            "SELECT p.entity_id, p.subject, p.score, p.assessment_date, p.assessment_title, p.rank \
             FROM cohort_warning.performance_records p \
             LEFT JOIN cohort_warning.entities e ON e.entity_id = p.entity_id \
             WHERE TRUE",
        );

        let mut position = 0;
        let mut placeholder = || {
            position += 1;
            format!("${position}")
        };
        if filter.subject.is_some() {
            query.push_str(&format!(" AND p.subject = {}", placeholder()));
        }
        if !filter.class_names.is_empty() {
            query.push_str(&format!(" AND e.class_name = ANY({})", placeholder()));
        }
        if !filter.assessment_titles.is_empty() {
            query.push_str(&format!(" AND p.assessment_title = ANY({})", placeholder()));
        }
        if filter.since.is_some() {
            query.push_str(&format!(" AND p.assessment_date >= {}", placeholder()));
        }
        query.push_str(" ORDER BY p.entity_id, p.assessment_date, p.assessment_title, p.subject");

        let mut rows = sqlx::query(&query);
        if let Some(subject) = &filter.subject {
            rows = rows.bind(subject.clone());
        }
        if !filter.class_names.is_empty() {
            rows = rows.bind(filter.class_names.clone());
        }
        if !filter.assessment_titles.is_empty() {
            rows = rows.bind(filter.assessment_titles.clone());
        }
        if let Some(since) = filter.since {
            rows = rows.bind(since);
        }

        let records = rows.fetch_all(&self.pool).await?;
        let mut result = Vec::with_capacity(records.len());
        for row in records {
            result.push(PerformanceRecord {
                entity_id: row.try_get("entity_id")?,
                subject: row.try_get("subject")?,
                score: row.try_get("score")?,
                assessment_date: row.try_get("assessment_date")?,
                assessment_title: row.try_get("assessment_title")?,
                rank: row.try_get("rank")?,
            });
        }
        Ok(result)
    }

    async fn homework_submissions(&self) -> Result<Vec<HomeworkSubmission>> {
        let rows = sqlx::query(
            r#"
            SELECT entity_id, homework_title, due_date, status
            FROM cohort_warning.homework_submissions
            ORDER BY entity_id, due_date
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(HomeworkSubmission {
                    entity_id: row.try_get("entity_id")?,
                    homework_title: row.try_get("homework_title")?,
                    due_date: row.try_get("due_date")?,
                    status: row.try_get::<String, _>("status")?.parse()?,
                })
            })
            .collect()
    }

    async fn entities(&self) -> Result<Vec<Entity>> {
        let rows = sqlx::query(
            "SELECT entity_id, name, class_name FROM cohort_warning.entities ORDER BY entity_id",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                Ok(Entity {
                    entity_id: row.try_get("entity_id")?,
                    name: row.try_get("name")?,
                    class_name: row.try_get("class_name")?,
                })
            })
            .collect()
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

        sqlx::query(
            r#"
            INSERT INTO cohort_warning.warning_executions
            (id, trigger_source, status, started_at)
            VALUES ($1, $2, $3, $4)
            "#,
        )
        .bind(record.id)
        .bind(&record.trigger)
        .bind(record.status.as_str())
        .bind(record.started_at)
        .execute(&self.pool)
        .await?;

        Ok(record)
    }

    async fn finish_execution(
        &self,
        execution_id: Uuid,
        status: RunStatus,
        totals: &ExecutionTotals,
        error_message: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE cohort_warning.warning_executions
            SET status = $2, completed_at = now(), total_rules = $3, matched_entities = $4,
                generated_warnings = $5, duration_ms = $6, error_message = $7
            WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .bind(status.as_str())
        .bind(totals.total_rules as i64)
        .bind(totals.matched_entities as i64)
        .bind(totals.generated_warnings as i64)
        .bind(totals.duration_ms as i64)
        .bind(error_message)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(EngineError::DataAccess(format!("execution {execution_id} not found")));
        }
        Ok(())
    }

    async fn execution(&self, execution_id: Uuid) -> Result<Option<ExecutionRecord>> {
        let row = sqlx::query(
            r#"
            SELECT id, trigger_source, status, started_at, completed_at, total_rules,
                   matched_entities, generated_warnings, duration_ms, error_message
            FROM cohort_warning.warning_executions
            WHERE id = $1
            "#,
        )
        .bind(execution_id)
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(execution_from_row).transpose()
    }

    async fn start_rule_execution(&self, record: &RuleExecutionRecord) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cohort_warning.warning_rule_executions
            (id, execution_id, rule_id, rule_snapshot, status, started_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(record.id)
        .bind(record.execution_id)
        .bind(record.rule_id)
        .bind(&record.rule_snapshot)
        .bind(record.status.as_str())
        .bind(record.started_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn finish_rule_execution(&self, id: Uuid, outcome: &RuleExecutionOutcome) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE cohort_warning.warning_rule_executions
            SET status = $2, affected_entities = $3, generated_warnings = $4,
                duration_ms = $5, error_message = $6, completed_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(outcome.status.as_str())
        .bind(outcome.affected_entities as i64)
        .bind(outcome.generated_warnings as i64)
        .bind(outcome.duration_ms as i64)
        .bind(&outcome.error_message)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn fail_running_rule_executions(&self, execution_id: Uuid, message: &str) -> Result<usize> {
        let result = sqlx::query(
            r#"
            UPDATE cohort_warning.warning_rule_executions
            SET status = 'failed', error_message = $2, completed_at = now()
            WHERE execution_id = $1 AND status = 'running'
            "#,
        )
        .bind(execution_id)
        .bind(message)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() as usize)
    }

    async fn rule_executions(&self, execution_id: Uuid) -> Result<Vec<RuleExecutionRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, execution_id, rule_id, rule_snapshot, status, affected_entities,
                   generated_warnings, duration_ms, error_message, started_at, completed_at
            FROM cohort_warning.warning_rule_executions
            WHERE execution_id = $1
            ORDER BY started_at
            "#,
        )
        .bind(execution_id)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(rule_execution_from_row).collect()
    }

    async fn has_active_warning(&self, entity_id: &str, rule_id: Uuid) -> Result<bool> {
        let row = sqlx::query(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM cohort_warning.warning_records
                WHERE entity_id = $1 AND rule_id = $2 AND status = 'active'
            ) AS present
            "#,
        )
        .bind(entity_id)
        .bind(rule_id)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.try_get("present")?)
    }

    async fn insert_warning(&self, warning: &WarningRecord) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO cohort_warning.warning_records
            (id, entity_id, rule_id, details, status, created_at)
            VALUES ($1, $2, $3, $4, $5, $6)
            ON CONFLICT (entity_id, rule_id) WHERE status = 'active' DO NOTHING
            "#,
        )
        .bind(warning.id)
        .bind(&warning.entity_id)
        .bind(warning.rule_id)
        .bind(serde_json::to_value(&warning.details)?)
        .bind(warning.status.as_str())
        .bind(warning.created_at)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() > 0 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        })
    }

    async fn resolve_warning(&self, warning_id: Uuid) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE cohort_warning.warning_records
            SET status = 'resolved', resolved_at = now()
            WHERE id = $1 AND status = 'active'
            "#,
        )
        .bind(warning_id)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn active_warnings(&self) -> Result<Vec<WarningRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_id, rule_id, details, status, created_at, resolved_at
            FROM cohort_warning.warning_records
            WHERE status = 'active'
            ORDER BY created_at, entity_id
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(warning_from_row).collect()
    }

    async fn active_priority_entries(&self) -> Result<Vec<ManualPriority>> {
        let rows = sqlx::query(
            r#"
            SELECT id, entity_id, severity, status, custom_tags, reason, intervention_goals,
                   notes, algorithm_score, created_at
            FROM cohort_warning.priority_entries
            WHERE status = 'active'
            ORDER BY created_at DESC
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(priority_from_row).collect()
    }

    async fn insert_priority_entry(&self, entry: &ManualPriority) -> Result<InsertOutcome> {
        let result = sqlx::query(
            r#"
            INSERT INTO cohort_warning.priority_entries
            (id, entity_id, severity, status, custom_tags, reason, intervention_goals,
             notes, algorithm_score, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)
            ON CONFLICT DO NOTHING
            "#,
        )
        .bind(entry.id)
        .bind(&entry.entity_id)
        .bind(entry.severity.as_str())
        .bind(entry.status.as_str())
        .bind(&entry.custom_tags)
        .bind(&entry.reason)
        .bind(&entry.intervention_goals)
        .bind(&entry.notes)
        .bind(entry.algorithm_score)
        .bind(entry.created_at)
        .execute(&self.pool)
        .await?;

        Ok(if result.rows_affected() > 0 {
            InsertOutcome::Inserted
        } else {
            InsertOutcome::Duplicate
        })
    }

    async fn set_priority_status(&self, id: Uuid, status: PriorityStatus) -> Result<bool> {
        if status == PriorityStatus::Active {
            let conflict: Option<String> = sqlx::query(
                r#"
                SELECT other.entity_id
                FROM cohort_warning.priority_entries target
                JOIN cohort_warning.priority_entries other
                  ON other.entity_id = target.entity_id AND other.id <> target.id
                WHERE target.id = $1 AND other.status = 'active'
                LIMIT 1
                "#,
            )
            .bind(id)
            .fetch_optional(&self.pool)
            .await?
            .map(|row| row.try_get("entity_id"))
            .transpose()?;

            if let Some(entity_id) = conflict {
                return Err(EngineError::Configuration(format!(
                    "entity {entity_id} already has an active priority entry"
                )));
            }
        }

        let result = sqlx::query("UPDATE cohort_warning.priority_entries SET status = $2 WHERE id = $1")
            .bind(id)
            .bind(status.as_str())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}
