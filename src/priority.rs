//! The ranked follow-up list: heuristic candidates merged with manual entries.

use std::collections::HashMap;
use std::sync::Arc;

use tracing::{debug, info};
use uuid::Uuid;

use crate::config::HeuristicConfig;
use crate::error::{EngineError, Result};
use crate::models::{InsertOutcome, ManualPriority, PriorityEntry, PriorityStatus, Provenance};
use crate::risk::{cutoff_date, score_candidates, Candidate, TimeRange};
use crate::store::{DataAccess, RecordFilter};

const MANUAL_REASON: &str = "manually added for follow-up";

/// Narrows the heuristic candidates. Manual entries are never filtered.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PriorityFilter {
    pub class_names: Vec<String>,
    pub assessment_titles: Vec<String>,
    pub time_range: TimeRange,
}

impl PriorityFilter {
    fn record_filter(&self) -> RecordFilter {
        RecordFilter {
            subject: None,
            class_names: self.class_names.clone(),
            assessment_titles: self.assessment_titles.clone(),
            since: cutoff_date(self.time_range),
        }
    }
}

pub struct PriorityConsolidator {
    store: Arc<dyn DataAccess>,
    heuristics: HeuristicConfig,
}

impl PriorityConsolidator {
    pub fn new(store: Arc<dyn DataAccess>, heuristics: HeuristicConfig) -> Self {
        Self { store, heuristics }
    }

    pub async fn priority_list(&self, limit: usize, filter: &PriorityFilter) -> Result<Vec<PriorityEntry>> {
        let records = self.store.performance_records(&filter.record_filter()).await?;
        let candidates = score_candidates(&records, &self.heuristics);
        let manual = self.store.active_priority_entries().await?;
        debug!(
            candidates = candidates.len(),
            manual = manual.len(),
            "merging priority sources"
        );

        let mut entries = merge(candidates, manual, &self.heuristics);

        let entities: HashMap<String, (String, String)> = self
            .store
            .entities()
            .await?
            .into_iter()
            .map(|e| (e.entity_id, (e.name, e.class_name)))
            .collect();
        for entry in entries.iter_mut() {
            if let Some((name, class_name)) = entities.get(&entry.entity_id) {
                entry.entity_name = Some(name.clone());
                entry.class_name = Some(class_name.clone());
            }
        }

        rank(&mut entries);
        entries.truncate(limit);
        Ok(entries)
    }

    pub async fn add_priority_entry(&self, entry: ManualPriority) -> Result<ManualPriority> {
        match self.store.insert_priority_entry(&entry).await? {
            InsertOutcome::Inserted => {
                info!(entity_id = %entry.entity_id, id = %entry.id, "added manual priority entry");
                Ok(entry)
            }
            InsertOutcome::Duplicate => Err(EngineError::Configuration(format!(
                "entity {} already has an active priority entry",
                entry.entity_id
            ))),
        }
    }

    pub async fn set_priority_status(&self, id: Uuid, status: PriorityStatus) -> Result<bool> {
        let updated = self.store.set_priority_status(id, status).await?;
        if updated {
            info!(%id, status = %status, "priority entry status changed");
        }
        Ok(updated)
    }
}

/// Combines both sources, one entry per entity.
pub fn merge(
    candidates: Vec<Candidate>,
    manual: Vec<ManualPriority>,
    config: &HeuristicConfig,
) -> Vec<PriorityEntry> {
    let mut merged: HashMap<String, PriorityEntry> = candidates
        .into_iter()
        .map(|candidate| (candidate.entity_id.clone(), algorithm_entry(candidate)))
        .collect();

    for entry in manual.into_iter() {
        match merged.remove(&entry.entity_id) {
            Some(algorithm) => {
                let hybrid = hybrid_entry(entry, algorithm);
                merged.insert(hybrid.entity_id.clone(), hybrid);
            }
            None => {
                let manual = manual_entry(entry, config);
                merged.insert(manual.entity_id.clone(), manual);
            }
        }
    }

    merged.into_values().collect()
}

fn algorithm_entry(candidate: Candidate) -> PriorityEntry {
    PriorityEntry {
        id: None,
        entity_id: candidate.entity_id,
        entity_name: None,
        class_name: None,
        provenance: Provenance::Algorithm,
        severity: candidate.severity,
        reason: candidate.tags.join("; "),
        custom_tags: candidate.tags,
        risk_score: candidate.risk_score,
        intervention_goals: Vec::new(),
        notes: None,
        status: PriorityStatus::Active,
    }
}

fn manual_entry(entry: ManualPriority, config: &HeuristicConfig) -> PriorityEntry {
    PriorityEntry {
        id: Some(entry.id),
        entity_id: entry.entity_id,
        entity_name: None,
        class_name: None,
        provenance: Provenance::Manual,
        severity: entry.severity,
        custom_tags: entry.custom_tags,
        risk_score: entry.algorithm_score.unwrap_or(config.manual_default_risk),
        reason: entry.reason.unwrap_or_else(|| MANUAL_REASON.to_string()),
        intervention_goals: entry.intervention_goals,
        notes: entry.notes,
        status: entry.status,
    }
}

fn hybrid_entry(entry: ManualPriority, algorithm: PriorityEntry) -> PriorityEntry {
    let mut tags = entry.custom_tags;
    for tag in algorithm.custom_tags.into_iter() {
        if !tags.contains(&tag) {
            tags.push(tag);
        }
    }

    PriorityEntry {
        id: Some(entry.id),
        entity_id: entry.entity_id,
        entity_name: None,
        class_name: None,
        provenance: Provenance::Hybrid,
        severity: entry.severity,
        custom_tags: tags,
        risk_score: algorithm.risk_score,
        reason: entry.reason.unwrap_or(algorithm.reason),
        intervention_goals: entry.intervention_goals,
        notes: entry.notes,
        status: entry.status,
    }
}

/// Manual before hybrid before algorithm, then severity and risk.
pub fn rank(entries: &mut [PriorityEntry]) {
    entries.sort_by(|a, b| {
        a.provenance
            .cmp(&b.provenance)
            .then_with(|| b.severity.cmp(&a.severity))
            .then_with(|| b.risk_score.total_cmp(&a.risk_score))
            .then_with(|| a.entity_id.cmp(&b.entity_id))
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Entity, PerformanceRecord, Severity};
    use crate::seed::sample_dataset;
    use crate::store::MemoryStore;
    use chrono::NaiveDate;

    fn candidate(entity: &str, risk_score: f64, severity: Severity, tags: &[&str]) -> Candidate {
        Candidate {
            entity_id: entity.to_string(),
            risk_score,
            severity,
            tags: tags.iter().map(|t| t.to_string()).collect(),
        }
    }

    fn failing_scores(entity: &str) -> Vec<PerformanceRecord> {
        ["math", "english", "science"]
            .iter()
            .map(|subject| PerformanceRecord {
                entity_id: entity.to_string(),
                subject: subject.to_string(),
                score: 35.0,
                assessment_date: NaiveDate::from_ymd_opt(2026, 1, 15).unwrap(),
                assessment_title: "Final".to_string(),
                rank: None,
            })
            .collect()
    }

    #[test]
    fn hybrid_keeps_manual_fields_and_heuristic_risk() {
        let mut manual = ManualPriority::new("S1", Severity::Low, None);
        manual.custom_tags = vec!["tutoring".to_string(), "low_average(50.0)".to_string()];
        manual.intervention_goals = vec!["Weekly check-in".to_string()];
        let manual_id = manual.id;

        let merged = merge(
            vec![candidate("S1", 120.0, Severity::High, &["low_average(50.0)", "severe_failure(math)"])],
            vec![manual],
            &HeuristicConfig::default(),
        );
        assert_eq!(merged.len(), 1);

        let entry = &merged[0];
        assert_eq!(entry.provenance, Provenance::Hybrid);
        assert_eq!(entry.id, Some(manual_id));
        assert_eq!(entry.severity, Severity::Low);
        assert_eq!(entry.risk_score, 120.0);
        assert_eq!(
            entry.custom_tags,
            vec![
                "tutoring".to_string(),
                "low_average(50.0)".to_string(),
                "severe_failure(math)".to_string(),
            ]
        );
        assert_eq!(entry.reason, "low_average(50.0); severe_failure(math)");
        assert_eq!(entry.intervention_goals, vec!["Weekly check-in".to_string()]);
    }

    #[test]
    fn manual_only_entry_uses_default_risk() {
        let merged = merge(
            Vec::new(),
            vec![ManualPriority::new("S9", Severity::Medium, None)],
            &HeuristicConfig::default(),
        );
        assert_eq!(merged[0].provenance, Provenance::Manual);
        assert_eq!(merged[0].risk_score, 50.0);
        assert_eq!(merged[0].reason, MANUAL_REASON);
    }

    #[test]
    fn provenance_outranks_severity_and_score() {
        let mut entries = merge(
            vec![
                candidate("A1", 250.0, Severity::High, &["severe_failure(math)"]),
                candidate("H1", 10.0, Severity::Low, &["low_average(65.0)"]),
                candidate("A2", 250.0, Severity::High, &["severe_failure(math)"]),
            ],
            vec![
                ManualPriority::new("H1", Severity::Low, None),
                ManualPriority::new("M1", Severity::Low, None),
            ],
            &HeuristicConfig::default(),
        );
        rank(&mut entries);

        let order: Vec<&str> = entries.iter().map(|e| e.entity_id.as_str()).collect();
        assert_eq!(order, vec!["M1", "H1", "A1", "A2"]);
    }

    #[tokio::test]
    async fn manual_entries_bypass_the_filter() {
        let store = Arc::new(MemoryStore::new());
        for (id, class_name) in [("S1", "7A"), ("S2", "7B")] {
            store
                .add_entity(Entity {
                    entity_id: id.to_string(),
                    name: format!("Student {id}"),
                    class_name: class_name.to_string(),
                })
                .unwrap();
        }
        store.add_records(failing_scores("S2")).unwrap();
        store
            .insert_priority_entry(&ManualPriority::new("S1", Severity::Medium, None))
            .await
            .unwrap();

        let consolidator = PriorityConsolidator::new(store, HeuristicConfig::default());
        let filter = PriorityFilter {
            class_names: vec!["7B".to_string()],
            assessment_titles: vec!["Final".to_string()],
            time_range: TimeRange::All,
        };
        let list = consolidator.priority_list(10, &filter).await.unwrap();

        assert_eq!(list.len(), 2);
        assert_eq!(list[0].entity_id, "S1");
        assert_eq!(list[0].provenance, Provenance::Manual);
        assert_eq!(list[0].class_name.as_deref(), Some("7A"));
        assert_eq!(list[1].entity_id, "S2");
        assert_eq!(list[1].provenance, Provenance::Algorithm);
        assert_eq!(list[1].entity_name.as_deref(), Some("Student S2"));
    }

    #[tokio::test]
    async fn sample_list_is_ranked_and_truncated() {
        let store = Arc::new(MemoryStore::with_dataset(sample_dataset().unwrap()).unwrap());
        let consolidator = PriorityConsolidator::new(store, HeuristicConfig::default());

        let full = consolidator
            .priority_list(usize::MAX, &PriorityFilter::default())
            .await
            .unwrap();
        // S1006 is manual only, S1004 is manual and flagged by the heuristics.
        assert_eq!(full[0].entity_id, "S1006");
        assert_eq!(full[0].provenance, Provenance::Manual);
        assert_eq!(full[1].entity_id, "S1004");
        assert_eq!(full[1].provenance, Provenance::Hybrid);
        assert!(full[2..].iter().all(|e| e.provenance == Provenance::Algorithm));

        let top = consolidator
            .priority_list(2, &PriorityFilter::default())
            .await
            .unwrap();
        assert_eq!(top, full[..2].to_vec());
    }

    #[tokio::test]
    async fn second_active_manual_entry_is_rejected() {
        let store = Arc::new(MemoryStore::new());
        let consolidator = PriorityConsolidator::new(store, HeuristicConfig::default());

        let first = consolidator
            .add_priority_entry(ManualPriority::new("S1", Severity::High, None))
            .await
            .unwrap();
        let err = consolidator
            .add_priority_entry(ManualPriority::new("S1", Severity::Low, None))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Configuration(_)));

        assert!(consolidator
            .set_priority_status(first.id, PriorityStatus::Completed)
            .await
            .unwrap());
        consolidator
            .add_priority_entry(ManualPriority::new("S1", Severity::Low, None))
            .await
            .unwrap();
    }
}
