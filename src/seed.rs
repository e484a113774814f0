//! Realistic sample data shared by `seed` (Postgres) and `demo` (in memory).

use anyhow::Context;
use chrono::NaiveDate;
use serde_json::json;
use uuid::Uuid;

use crate::models::{
    Entity, HomeworkStatus, HomeworkSubmission, ManualPriority, PerformanceRecord, RuleCategory,
    RuleDefinition, RuleScope, Severity,
};

#[derive(Debug, Clone, Default)]
pub struct Dataset {
    pub entities: Vec<Entity>,
    pub records: Vec<PerformanceRecord>,
    pub homework: Vec<HomeworkSubmission>,
    pub rules: Vec<RuleDefinition>,
    pub priorities: Vec<ManualPriority>,
}

const EXAMS: [(&str, u32, u32); 4] = [
    ("September Baseline", 9, 20),
    ("October Monthly", 10, 25),
    ("Midterm", 11, 20),
    ("December Monthly", 12, 18),
];

const SUBJECTS: [&str; 3] = ["math", "english", "science"];

pub fn sample_dataset() -> anyhow::Result<Dataset> {
    let students: [(&str, &str, &str, [[f64; 3]; 4]); 6] = [
        (
            "S1001",
            "Avery Lee",
            "Grade 7A",
            [[88.0, 91.0, 85.0], [86.0, 90.0, 87.0], [89.0, 88.0, 84.0], [87.0, 92.0, 86.0]],
        ),
        (
            "S1002",
            "Jules Moreno",
            "Grade 7A",
            [[55.0, 72.0, 64.0], [58.0, 70.0, 61.0], [50.0, 68.0, 57.0], [52.0, 66.0, 55.0]],
        ),
        (
            "S1003",
            "Kiara Patel",
            "Grade 7A",
            [[95.0, 93.0, 96.0], [90.0, 88.0, 91.0], [78.0, 80.0, 82.0], [64.0, 70.0, 66.0]],
        ),
        (
            "S1004",
            "Noah Kim",
            "Grade 7B",
            [[42.0, 38.0, 45.0], [35.0, 40.0, 33.0], [28.0, 36.0, 31.0], [25.0, 30.0, 27.0]],
        ),
        (
            "S1005",
            "Mia Okafor",
            "Grade 7B",
            [[82.0, 84.0, 80.0], [81.0, 85.0, 83.0], [83.0, 82.0, 81.0], [45.0, 50.0, 48.0]],
        ),
        (
            "S1006",
            "Leo Schmidt",
            "Grade 7B",
            [[76.0, 78.0, 74.0], [77.0, 75.0, 79.0], [78.0, 76.0, 77.0], [77.0, 79.0, 75.0]],
        ),
    ];

    let mut dataset = Dataset::default();

    for (entity_id, name, class_name, exams) in students.iter() {
        dataset.entities.push(Entity {
            entity_id: entity_id.to_string(),
            name: name.to_string(),
            class_name: class_name.to_string(),
        });

        for ((title, month, day), scores) in EXAMS.iter().zip(exams.iter()) {
            let assessment_date = NaiveDate::from_ymd_opt(2025, *month, *day).context("invalid date")?;
            for (subject, score) in SUBJECTS.iter().zip(scores.iter()) {
                dataset.records.push(PerformanceRecord {
                    entity_id: entity_id.to_string(),
                    subject: subject.to_string(),
                    score: *score,
                    assessment_date,
                    assessment_title: title.to_string(),
                    rank: None,
                });
            }
        }
    }

    let homework = [
        ("S1002", HomeworkStatus::Missing),
        ("S1002", HomeworkStatus::Late),
        ("S1002", HomeworkStatus::Missing),
        ("S1004", HomeworkStatus::Missing),
        ("S1004", HomeworkStatus::Missing),
        ("S1004", HomeworkStatus::Missing),
        ("S1006", HomeworkStatus::Late),
    ];
    for (index, (entity_id, status)) in homework.iter().enumerate() {
        dataset.homework.push(HomeworkSubmission {
            entity_id: entity_id.to_string(),
            homework_title: format!("Problem Set {}", index + 1),
            due_date: NaiveDate::from_ymd_opt(2025, 12, 1 + index as u32).context("invalid date")?,
            status: *status,
        });
    }

    dataset.rules = vec![
        rule(
            "3b4f8a52-5d0e-4c1f-9a57-0d6f0e1c2a01",
            "Three failing scores in a row",
            RuleCategory::Grade,
            Severity::High,
            100,
            json!({"type": "consecutive_fails", "times": 3, "score_threshold": 60}),
        )?,
        rule(
            "3b4f8a52-5d0e-4c1f-9a57-0d6f0e1c2a02",
            "Sustained grade decline",
            RuleCategory::Progress,
            Severity::High,
            90,
            json!({"type": "grade_decline", "decline_threshold": 30, "consecutive_count": 2}),
        )?,
        rule(
            "3b4f8a52-5d0e-4c1f-9a57-0d6f0e1c2a03",
            "Failed latest exam",
            RuleCategory::Grade,
            Severity::Medium,
            80,
            json!({"type": "exam_fail", "threshold": 40, "subject": "all"}),
        )?,
        rule(
            "3b4f8a52-5d0e-4c1f-9a57-0d6f0e1c2a04",
            "Homework defaults",
            RuleCategory::Homework,
            Severity::Medium,
            70,
            json!({"type": "homework_default", "count": 3, "include_late": true}),
        )?,
        rule(
            "3b4f8a52-5d0e-4c1f-9a57-0d6f0e1c2a05",
            "Composite risk model",
            RuleCategory::Composite,
            Severity::High,
            60,
            json!({"type": "ml_risk_prediction", "threshold": 60, "sensitivity": 0.8}),
        )?,
        rule(
            "3b4f8a52-5d0e-4c1f-9a57-0d6f0e1c2a06",
            "Sudden score change",
            RuleCategory::Composite,
            Severity::Medium,
            50,
            json!({"type": "ml_anomaly_detection", "z_threshold": 1.5, "sensitivity": 0.5}),
        )?,
        rule(
            "3b4f8a52-5d0e-4c1f-9a57-0d6f0e1c2a07",
            "Declining trend",
            RuleCategory::Progress,
            Severity::Medium,
            40,
            json!({"type": "ml_trend_analysis", "decline_rate": -10, "confidence_threshold": 0.8}),
        )?,
    ];

    let mut follow_up = ManualPriority::new(
        "S1006",
        Severity::Medium,
        Some("Family circumstances reported by homeroom teacher".to_string()),
    );
    follow_up.custom_tags = vec!["wellbeing".to_string()];
    follow_up.intervention_goals = vec!["Weekly check-in with counselor".to_string()];
    dataset.priorities.push(follow_up);

    let mut tutoring = ManualPriority::new(
        "S1004",
        Severity::High,
        Some("Enrolled in after-school tutoring".to_string()),
    );
    tutoring.custom_tags = vec!["tutoring".to_string()];
    tutoring.intervention_goals = vec!["Raise math average above 50".to_string()];
    dataset.priorities.push(tutoring);

    Ok(dataset)
}

fn rule(
    id: &str,
    name: &str,
    category: RuleCategory,
    severity: Severity,
    priority: i32,
    conditions: serde_json::Value,
) -> anyhow::Result<RuleDefinition> {
    Ok(RuleDefinition {
        id: Uuid::parse_str(id)?,
        name: name.to_string(),
        category,
        conditions,
        severity,
        scope: RuleScope::Global,
        priority,
        is_active: true,
    })
}
