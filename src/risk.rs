use std::collections::BTreeMap;
use std::str::FromStr;

use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};

use crate::config::HeuristicConfig;
use crate::error::EngineError;
use crate::models::{PerformanceRecord, Severity};

/// How far back the priority heuristics look.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeRange {
    Month,
    Quarter,
    Semester,
    Year,
    #[default]
    All,
}

impl TimeRange {
    pub fn days(self) -> Option<i64> {
        match self {
            TimeRange::Month => Some(30),
            TimeRange::Quarter => Some(90),
            TimeRange::Semester => Some(180),
            TimeRange::Year => Some(365),
            TimeRange::All => None,
        }
    }
}

impl FromStr for TimeRange {
    type Err = EngineError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "month" => Ok(TimeRange::Month),
            "quarter" => Ok(TimeRange::Quarter),
            "semester" => Ok(TimeRange::Semester),
            "year" => Ok(TimeRange::Year),
            "all" => Ok(TimeRange::All),
            other => Err(EngineError::Configuration(format!("unknown time range '{other}'"))),
        }
    }
}

pub fn cutoff_date(range: TimeRange) -> Option<NaiveDate> {
    range
        .days()
        .map(|days| Utc::now().date_naive() - Duration::days(days))
}

/// An entity flagged by the score heuristics.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub entity_id: String,
    pub risk_score: f64,
    pub severity: Severity,
    pub tags: Vec<String>,
}

pub fn score_candidates(records: &[PerformanceRecord], config: &HeuristicConfig) -> Vec<Candidate> {
    let mut by_entity: BTreeMap<&str, Vec<&PerformanceRecord>> = BTreeMap::new();
    for record in records.iter() {
        by_entity.entry(record.entity_id.as_str()).or_default().push(record);
    }

    by_entity
        .into_iter()
        .filter_map(|(entity_id, scores)| score_entity(entity_id, &scores, config))
        .collect()
}

fn score_entity(entity_id: &str, scores: &[&PerformanceRecord], config: &HeuristicConfig) -> Option<Candidate> {
    if scores.is_empty() {
        return None;
    }

    let mut tags = Vec::new();
    let mut risk = 0.0;

    let failing: Vec<&str> = below(scores, config.pass_score);
    if failing.len() >= config.min_failing_scores {
        tags.push(format!("multiple_failing_subjects({})", failing.join(", ")));
        risk += failing.len() as f64 * config.failing_weight;
    }

    let average = scores.iter().map(|r| r.score).sum::<f64>() / scores.len() as f64;
    if average < config.average_floor {
        tags.push(format!("low_average({average:.1})"));
        risk += (config.average_floor - average) * config.average_weight;
    }

    let severe = below(scores, config.severe_score);
    if !severe.is_empty() {
        tags.push(format!("severe_failure({})", severe.join(", ")));
        risk += severe.len() as f64 * config.severe_weight;
    }

    let extreme = below(scores, config.extreme_score);
    if !extreme.is_empty() {
        tags.push(format!("extremely_low_scores({})", extreme.len()));
        risk += extreme.len() as f64 * config.extreme_weight;
    }

    if tags.is_empty() {
        return None;
    }

    let risk_score = risk.round();
    Some(Candidate {
        entity_id: entity_id.to_string(),
        risk_score,
        severity: severity_for(risk_score, config),
        tags,
    })
}

fn below<'a>(scores: &[&'a PerformanceRecord], limit: f64) -> Vec<&'a str> {
    scores
        .iter()
        .filter(|r| r.score < limit)
        .map(|r| r.subject.as_str())
        .collect()
}

pub fn severity_for(risk_score: f64, config: &HeuristicConfig) -> Severity {
    if risk_score >= config.high_risk_at {
        Severity::High
    } else if risk_score >= config.medium_risk_at {
        Severity::Medium
    } else {
        Severity::Low
    }
}
