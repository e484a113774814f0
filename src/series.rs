//! Per-entity series construction and the small amount of statistics the
//! strategies need.

use std::collections::{BTreeMap, HashMap};

use chrono::NaiveDate;

use crate::models::PerformanceRecord;

/// Deviations below this are treated as zero.
pub const EPSILON: f64 = 1e-9;

/// One point of an assessment series: all subject scores of one assessment summed.
#[derive(Debug, Clone, PartialEq)]
pub struct AssessmentPoint {
    pub date: NaiveDate,
    pub title: String,
    pub total: f64,
}

/// Group records per entity into chronologically ordered assessment totals.
pub fn assessment_series(records: &[PerformanceRecord]) -> HashMap<String, Vec<AssessmentPoint>> {
    let mut grouped: HashMap<String, BTreeMap<(NaiveDate, String), f64>> = HashMap::new();

    for record in records {
        *grouped
            .entry(record.entity_id.clone())
            .or_default()
            .entry((record.assessment_date, record.assessment_title.clone()))
            .or_insert(0.0) += record.score;
    }

    grouped
        .into_iter()
        .map(|(entity_id, points)| {
            let series = points
                .into_iter()
                .map(|((date, title), total)| AssessmentPoint { date, title, total })
                .collect();
            (entity_id, series)
        })
        .collect()
}

/// Group records per `(entity, subject)`, each list sorted by date then title.
pub fn subject_series(
    records: &[PerformanceRecord],
) -> HashMap<String, BTreeMap<String, Vec<&PerformanceRecord>>> {
    let mut grouped: HashMap<String, BTreeMap<String, Vec<&PerformanceRecord>>> = HashMap::new();

    for record in records {
        grouped
            .entry(record.entity_id.clone())
            .or_default()
            .entry(record.subject.clone())
            .or_default()
            .push(record);
    }

    for subjects in grouped.values_mut() {
        for series in subjects.values_mut() {
            series.sort_by(|a, b| {
                a.assessment_date
                    .cmp(&b.assessment_date)
                    .then_with(|| a.assessment_title.cmp(&b.assessment_title))
            });
        }
    }

    grouped
}

pub fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}

/// Population standard deviation.
pub fn std_dev(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    let avg = mean(values);
    let variance = values.iter().map(|v| (v - avg).powi(2)).sum::<f64>() / values.len() as f64;
    variance.sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LinearFit {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
}

impl LinearFit {
    /// Value of the fitted line at period `x` (periods start at 1).
    pub fn predict(&self, x: f64) -> f64 {
        self.slope * x + self.intercept
    }
}

/// Ordinary least squares over `(1..=n, y)`.
///
/// Returns `None` for fewer than two points. A series without variance has
/// nothing to explain, so its R² is reported as 0.
pub fn linear_fit(y: &[f64]) -> Option<LinearFit> {
    let n = y.len();
    if n < 2 {
        return None;
    }

    let xs: Vec<f64> = (1..=n).map(|i| i as f64).collect();
    let mean_x = mean(&xs);
    let mean_y = mean(y);

    let mut sxy = 0.0;
    let mut sxx = 0.0;
    for (x, value) in xs.iter().zip(y) {
        sxy += (x - mean_x) * (value - mean_y);
        sxx += (x - mean_x).powi(2);
    }

    let slope = sxy / sxx;
    let intercept = mean_y - slope * mean_x;

    let ss_tot: f64 = y.iter().map(|v| (v - mean_y).powi(2)).sum();
    let ss_res: f64 = xs
        .iter()
        .zip(y)
        .map(|(x, v)| (v - (slope * x + intercept)).powi(2))
        .sum();
    let r_squared = if ss_tot <= EPSILON {
        0.0
    } else {
        (1.0 - ss_res / ss_tot).clamp(0.0, 1.0)
    };

    Some(LinearFit {
        slope,
        intercept,
        r_squared,
    })
}
