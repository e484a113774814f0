//! Threshold rules evaluated as pure functions over sorted per-entity series.

use std::collections::BTreeMap;

use crate::conditions::{ConsecutiveFails, ExamFail, GradeDecline, HomeworkDefault};
use crate::evaluator::RuleMatch;
use crate::models::{HomeworkStatus, HomeworkSubmission, PerformanceRecord, WarningDetails};
use crate::series::{assessment_series, subject_series};

/// Longest run of consecutive scores strictly below `threshold`.
pub fn longest_fail_run<'a>(scores: impl IntoIterator<Item = &'a f64>, threshold: f64) -> usize {
    let mut longest = 0;
    let mut current = 0;
    for score in scores {
        if *score < threshold {
            current += 1;
            longest = longest.max(current);
        } else {
            current = 0;
        }
    }
    longest
}

/// An entity matches when any subject history holds at least `times`
/// consecutive sub-threshold scores.
pub fn consecutive_fails(records: &[PerformanceRecord], params: &ConsecutiveFails) -> Vec<RuleMatch> {
    let mut matches = Vec::new();

    for (entity_id, subjects) in subject_series(records) {
        let mut fail_count = 0;
        let mut failing_subjects = Vec::new();

        for (subject, series) in subjects.iter() {
            if let Some(filter) = params.subject.as_deref() {
                if subject != filter {
                    continue;
                }
            }
            let scores: Vec<f64> = series.iter().map(|r| r.score).collect();
            let run = longest_fail_run(&scores, params.score_threshold);
            if run >= params.times {
                fail_count = fail_count.max(run);
                failing_subjects.push(subject.clone());
            }
        }

        if !failing_subjects.is_empty() {
            matches.push(RuleMatch {
                entity_id,
                details: WarningDetails::ConsecutiveFails {
                    fail_count,
                    subjects: failing_subjects,
                    threshold: params.score_threshold,
                    window: format!(
                        "at least {} consecutive sub-threshold scores within the ordered subject history",
                        params.times
                    ),
                },
            });
        }
    }

    sort_matches(matches)
}

/// The last `consecutive_count` transitions of the assessment series must all
/// decline, by `decline_threshold` or more in total.
pub fn grade_decline(records: &[PerformanceRecord], params: &GradeDecline) -> Vec<RuleMatch> {
    let mut matches = Vec::new();
    let window_len = params.consecutive_count + 1;

    for (entity_id, series) in assessment_series(records) {
        if series.len() < window_len {
            continue;
        }
        let window = &series[series.len() - window_len..];
        let strictly_declining = window.windows(2).all(|pair| pair[1].total < pair[0].total);
        if !strictly_declining {
            continue;
        }

        let first = &window[0];
        let last = &window[window.len() - 1];
        let decline_amount = first.total - last.total;
        if decline_amount >= params.decline_threshold {
            matches.push(RuleMatch {
                entity_id,
                details: WarningDetails::GradeDecline {
                    decline_amount,
                    periods: params.consecutive_count,
                    from_assessment: first.title.clone(),
                    to_assessment: last.title.clone(),
                },
            });
        }
    }

    sort_matches(matches)
}

/// Looks only at each entity's most recent assessment and reports its lowest
/// sub-threshold score.
pub fn exam_fail(records: &[PerformanceRecord], params: &ExamFail) -> Vec<RuleMatch> {
    let mut latest: BTreeMap<&str, Vec<&PerformanceRecord>> = BTreeMap::new();

    for record in records {
        if let Some(filter) = params.subject.as_deref() {
            if record.subject != filter {
                continue;
            }
        }
        let slot = latest.entry(record.entity_id.as_str()).or_default();
        let key = (record.assessment_date, record.assessment_title.as_str());
        match slot.first().copied() {
            Some(current) => {
                let current_key = (current.assessment_date, current.assessment_title.as_str());
                if key > current_key {
                    slot.clear();
                    slot.push(record);
                } else if key == current_key {
                    slot.push(record);
                }
            }
            None => slot.push(record),
        }
    }

    latest
        .into_iter()
        .filter_map(|(entity_id, assessment)| {
            let lowest = assessment
                .into_iter()
                .filter(|r| r.score < params.threshold)
                .min_by(|a, b| a.score.partial_cmp(&b.score).unwrap_or(std::cmp::Ordering::Equal))?;
            Some(RuleMatch {
                entity_id: entity_id.to_string(),
                details: WarningDetails::ExamFail {
                    score: lowest.score,
                    subject: lowest.subject.clone(),
                    exam_title: lowest.assessment_title.clone(),
                },
            })
        })
        .collect()
}

pub fn homework_default(submissions: &[HomeworkSubmission], params: &HomeworkDefault) -> Vec<RuleMatch> {
    let mut counts: BTreeMap<&str, (usize, usize)> = BTreeMap::new();

    for submission in submissions {
        let entry = counts.entry(submission.entity_id.as_str()).or_insert((0, 0));
        match submission.status {
            HomeworkStatus::Missing => entry.0 += 1,
            HomeworkStatus::Late => entry.1 += 1,
            HomeworkStatus::Submitted => {}
        }
    }

    counts
        .into_iter()
        .filter_map(|(entity_id, (missing_count, late_count))| {
            let default_count = if params.include_late {
                missing_count + late_count
            } else {
                missing_count
            };
            (default_count >= params.count).then(|| RuleMatch {
                entity_id: entity_id.to_string(),
                details: WarningDetails::HomeworkDefault {
                    default_count,
                    missing_count,
                    late_count,
                },
            })
        })
        .collect()
}

fn sort_matches(mut matches: Vec<RuleMatch>) -> Vec<RuleMatch> {
    matches.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn record(entity: &str, subject: &str, score: f64, day: u32, title: &str) -> PerformanceRecord {
        PerformanceRecord {
            entity_id: entity.to_string(),
            subject: subject.to_string(),
            score,
            assessment_date: NaiveDate::from_ymd_opt(2026, 4, day).unwrap(),
            assessment_title: title.to_string(),
            rank: None,
        }
    }

    fn homework(entity: &str, day: u32, status: HomeworkStatus) -> HomeworkSubmission {
        HomeworkSubmission {
            entity_id: entity.to_string(),
            homework_title: format!("Set {day}"),
            due_date: NaiveDate::from_ymd_opt(2026, 4, day).unwrap(),
            status,
        }
    }

    #[test]
    fn fail_run_resets_on_passing_score() {
        assert_eq!(longest_fail_run(&[55.0, 58.0, 50.0, 52.0], 60.0), 4);
        assert_eq!(longest_fail_run(&[55.0, 70.0, 50.0, 52.0], 60.0), 2);
        assert_eq!(longest_fail_run(&[60.0, 61.0], 60.0), 0);
    }

    #[test]
    fn consecutive_fails_reports_run_length_and_subjects() {
        let records = vec![
            record("S1", "math", 55.0, 1, "Quiz 1"),
            record("S1", "math", 58.0, 2, "Quiz 2"),
            record("S1", "math", 50.0, 3, "Quiz 3"),
            record("S1", "math", 52.0, 4, "Quiz 4"),
            record("S1", "english", 90.0, 1, "Quiz 1"),
            record("S2", "math", 55.0, 1, "Quiz 1"),
            record("S2", "math", 75.0, 2, "Quiz 2"),
            record("S2", "math", 50.0, 3, "Quiz 3"),
        ];
        let params = ConsecutiveFails {
            times: 3,
            score_threshold: 60.0,
            subject: None,
        };

        let matches = consecutive_fails(&records, &params);
        assert_eq!(matches.len(), 1);
        assert_eq!(matches[0].entity_id, "S1");
        match &matches[0].details {
            WarningDetails::ConsecutiveFails {
                fail_count, subjects, ..
            } => {
                assert!(*fail_count >= 3);
                assert_eq!(subjects, &vec!["math".to_string()]);
            }
            other => panic!("unexpected details {other:?}"),
        }
    }

    #[test]
    fn consecutive_fails_respects_subject_filter() {
        let records = vec![
            record("S1", "math", 40.0, 1, "Quiz 1"),
            record("S1", "math", 40.0, 2, "Quiz 2"),
        ];
        let params = ConsecutiveFails {
            times: 2,
            score_threshold: 60.0,
            subject: Some("physics".to_string()),
        };
        assert!(consecutive_fails(&records, &params).is_empty());
    }

    #[test]
    fn grade_decline_needs_strict_decline_over_window() {
        let declining = vec![
            record("S1", "math", 95.0, 1, "Exam 1"),
            record("S1", "math", 85.0, 2, "Exam 2"),
            record("S1", "math", 70.0, 3, "Exam 3"),
        ];
        let bumpy = vec![
            record("S2", "math", 95.0, 1, "Exam 1"),
            record("S2", "math", 99.0, 2, "Exam 2"),
            record("S2", "math", 70.0, 3, "Exam 3"),
        ];
        let params = GradeDecline {
            decline_threshold: 20.0,
            consecutive_count: 2,
        };

        let mut records = declining;
        records.extend(bumpy);
        let matches = grade_decline(&records, &params);
        assert_eq!(matches.len(), 1);
        assert_eq!(
            matches[0].details,
            WarningDetails::GradeDecline {
                decline_amount: 25.0,
                periods: 2,
                from_assessment: "Exam 1".to_string(),
                to_assessment: "Exam 3".to_string(),
            }
        );
    }

    #[test]
    fn exam_fail_only_considers_latest_assessment() {
        let records = vec![
            record("S1", "math", 30.0, 1, "Midterm"),
            record("S1", "math", 80.0, 9, "Final"),
            record("S1", "english", 45.0, 9, "Final"),
            record("S1", "physics", 52.0, 9, "Final"),
            record("S2", "math", 20.0, 1, "Midterm"),
            record("S2", "math", 90.0, 9, "Final"),
        ];
        let params = ExamFail {
            threshold: 60.0,
            subject: None,
        };

        let matches = exam_fail(&records, &params);
        assert_eq!(matches.len(), 1);
        assert_eq!(
            matches[0].details,
            WarningDetails::ExamFail {
                score: 45.0,
                subject: "english".to_string(),
                exam_title: "Final".to_string(),
            }
        );
    }

    #[test]
    fn homework_default_counts_late_only_when_asked() {
        let submissions = vec![
            homework("S1", 1, HomeworkStatus::Missing),
            homework("S1", 2, HomeworkStatus::Late),
            homework("S1", 3, HomeworkStatus::Late),
            homework("S1", 4, HomeworkStatus::Submitted),
        ];

        let strict = HomeworkDefault {
            count: 3,
            include_late: false,
        };
        assert!(homework_default(&submissions, &strict).is_empty());

        let lenient = HomeworkDefault {
            count: 3,
            include_late: true,
        };
        let matches = homework_default(&submissions, &lenient);
        assert_eq!(matches.len(), 1);
        assert_eq!(
            matches[0].details,
            WarningDetails::HomeworkDefault {
                default_count: 3,
                missing_count: 1,
                late_count: 2,
            }
        );
    }
}
