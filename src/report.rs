use std::collections::HashMap;
use std::fmt::Write;

use chrono::NaiveDate;
use uuid::Uuid;

use crate::models::{Entity, PriorityEntry, RuleDefinition, Severity, WarningDetails, WarningRecord};

#[derive(Debug, Clone, PartialEq)]
pub struct RuleWarningSummary {
    pub rule_id: Uuid,
    pub rule_name: String,
    pub severity: Option<Severity>,
    pub count: usize,
}

pub fn summarize_by_rule(warnings: &[WarningRecord], rules: &[RuleDefinition]) -> Vec<RuleWarningSummary> {
    let mut counts: HashMap<Uuid, usize> = HashMap::new();
    for warning in warnings {
        *counts.entry(warning.rule_id).or_insert(0) += 1;
    }

    let mut summaries: Vec<RuleWarningSummary> = counts
        .into_iter()
        .map(|(rule_id, count)| {
            let rule = rules.iter().find(|r| r.id == rule_id);
            RuleWarningSummary {
                rule_id,
                rule_name: rule
                    .map(|r| r.name.clone())
                    .unwrap_or_else(|| format!("rule {rule_id}")),
                severity: rule.map(|r| r.severity),
                count,
            }
        })
        .collect();

    summaries.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.rule_name.cmp(&b.rule_name)));
    summaries
}

/// One-line human description of a warning payload.
pub fn describe(details: &WarningDetails) -> String {
    match details {
        WarningDetails::ConsecutiveFails {
            fail_count,
            subjects,
            threshold,
            ..
        } => format!(
            "{fail_count} consecutive scores below {threshold} in {}",
            subjects.join(", ")
        ),
        WarningDetails::GradeDecline {
            decline_amount,
            periods,
            from_assessment,
            to_assessment,
        } => format!(
            "total fell {decline_amount:.1} over {periods} assessments ({from_assessment} to {to_assessment})"
        ),
        WarningDetails::ExamFail {
            score,
            subject,
            exam_title,
        } => format!("scored {score:.1} in {subject} on {exam_title}"),
        WarningDetails::HomeworkDefault {
            default_count,
            missing_count,
            late_count,
        } => format!("{default_count} homework defaults ({missing_count} missing, {late_count} late)"),
        WarningDetails::MlRiskPrediction {
            risk_score,
            factors,
            ..
        } => format!("risk score {risk_score:.1} [{}]", factors.join(", ")),
        WarningDetails::MlAnomalyDetection {
            z_score,
            latest_score,
            mean,
            ..
        } => format!("latest {latest_score:.1} vs mean {mean:.1} (z {z_score:.2})"),
        WarningDetails::MlTrendAnalysis {
            slope,
            r_squared,
            predicted_next,
            ..
        } => format!("slope {slope:.1} per assessment (R² {r_squared:.2}), next ≈ {predicted_next:.1}"),
    }
}

pub fn build_report(
    generated_on: NaiveDate,
    warnings: &[WarningRecord],
    rules: &[RuleDefinition],
    entities: &[Entity],
    priorities: &[PriorityEntry],
) -> String {
    let summaries = summarize_by_rule(warnings, rules);
    let names: HashMap<&str, &str> = entities
        .iter()
        .map(|e| (e.entity_id.as_str(), e.name.as_str()))
        .collect();

    let mut output = String::new();

    let _ = writeln!(output, "# Student Early Warning Report");
    let _ = writeln!(
        output,
        "Generated on {} with {} active warnings",
        generated_on,
        warnings.len()
    );
    let _ = writeln!(output);
    let _ = writeln!(output, "## Warnings by Rule");

    if summaries.is_empty() {
        let _ = writeln!(output, "No active warnings.");
    } else {
        for summary in summaries.iter() {
            let severity = summary.severity.map(|s| s.as_str()).unwrap_or("unknown");
            let _ = writeln!(
                output,
                "- {} ({}): {} students",
                summary.rule_name, severity, summary.count
            );
        }
    }

    let _ = writeln!(output);
    let _ = writeln!(output, "## Priority Follow-up");

    if priorities.is_empty() {
        let _ = writeln!(output, "No students flagged for follow-up.");
    } else {
        for entry in priorities.iter() {
            let _ = writeln!(
                output,
                "- {} ({}, {}) {} priority, risk {:.0}: {}",
                entry.entity_name.as_deref().unwrap_or(&entry.entity_id),
                entry.class_name.as_deref().unwrap_or("unknown class"),
                entry.provenance,
                entry.severity,
                entry.risk_score,
                entry.reason
            );
        }
    }

    let mut recent: Vec<&WarningRecord> = warnings.iter().collect();
    recent.sort_by(|a, b| b.created_at.cmp(&a.created_at));
    let _ = writeln!(output);
    let _ = writeln!(output, "## Recent Warnings");

    if recent.is_empty() {
        let _ = writeln!(output, "No active warnings.");
    } else {
        for warning in recent.iter().take(10) {
            let _ = writeln!(
                output,
                "- {} on {}: {}",
                names.get(warning.entity_id.as_str()).copied().unwrap_or(&warning.entity_id),
                warning.created_at.date_naive(),
                describe(&warning.details)
            );
        }
    }

    output
}
