//! Statistical rules: multi-factor risk scoring, z-score anomaly detection
//! and OLS trend analysis over each entity's assessment totals.

use crate::conditions::{AnomalyDetection, RiskPrediction, TrendAnalysis};
use crate::config::RiskModelConfig;
use crate::evaluator::RuleMatch;
use crate::models::{AnomalyDirection, PerformanceRecord, WarningDetails};
use crate::series::{assessment_series, linear_fit, mean, std_dev, EPSILON};

const AVERAGE_WEIGHT: f64 = 0.4;
const VOLATILITY_WEIGHT: f64 = 0.3;
const TREND_WEIGHT: f64 = 0.3;

pub const MIN_RISK_POINTS: usize = 2;
pub const MIN_ANOMALY_POINTS: usize = 3;
pub const MIN_TREND_POINTS: usize = 3;

#[derive(Debug, Clone, PartialEq)]
pub struct RiskBreakdown {
    /// Composite score, always within `[0, 100]`.
    pub score: f64,
    pub average_risk: f64,
    pub volatility_risk: f64,
    pub trend_risk: f64,
    pub data_points: usize,
    pub factors: Vec<String>,
}

/// Score any series, including empty, single-point or flat ones.
pub fn risk_score(series: &[f64], config: &RiskModelConfig) -> RiskBreakdown {
    let values: Vec<f64> = series.iter().copied().filter(|v| v.is_finite()).collect();
    let average = mean(&values);
    let stdev = std_dev(&values);
    let cap = config.component_cap;

    let average_risk = config.average_risk(average);

    let volatility_risk = if average.abs() <= EPSILON {
        if stdev > EPSILON {
            cap
        } else {
            0.0
        }
    } else {
        (stdev / average.abs() * 100.0 * config.volatility_multiplier).min(cap)
    };

    let trend_risk = match linear_fit(&values) {
        Some(fit) if values.len() >= MIN_TREND_POINTS && fit.slope < 0.0 => {
            if average.abs() <= EPSILON {
                cap
            } else {
                (fit.slope.abs() / average.abs() * 100.0 * config.trend_multiplier).min(cap)
            }
        }
        _ => 0.0,
    };

    let total = AVERAGE_WEIGHT * average_risk + VOLATILITY_WEIGHT * volatility_risk + TREND_WEIGHT * trend_risk;
    let score = if total.is_finite() { total.clamp(0.0, 100.0) } else { 0.0 };

    let mut factors = Vec::new();
    if average_risk >= 60.0 {
        factors.push("low_average_score".to_string());
    }
    if volatility_risk > 40.0 {
        factors.push("high_volatility".to_string());
    }
    if trend_risk > 0.0 {
        factors.push("declining_trend".to_string());
    }

    RiskBreakdown {
        score,
        average_risk,
        volatility_risk,
        trend_risk,
        data_points: values.len(),
        factors,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct AnomalyReading {
    pub z_score: f64,
    pub severity: f64,
    pub confidence: f64,
    pub direction: AnomalyDirection,
    pub latest: f64,
    pub mean: f64,
    pub stdev: f64,
}

/// Deviation of the latest point from the series' own distribution.
///
/// `None` below three points or when the series has no spread.
pub fn detect_anomaly(series: &[f64]) -> Option<AnomalyReading> {
    if series.len() < MIN_ANOMALY_POINTS {
        return None;
    }
    let avg = mean(series);
    let stdev = std_dev(series);
    if !stdev.is_finite() || stdev <= EPSILON {
        return None;
    }

    let latest = *series.last()?;
    let z_score = (latest - avg).abs() / stdev;
    Some(AnomalyReading {
        z_score,
        severity: (z_score / 3.0).min(1.0),
        confidence: (z_score / 4.0).min(0.95),
        direction: if latest < avg {
            AnomalyDirection::Drop
        } else {
            AnomalyDirection::Spike
        },
        latest,
        mean: avg,
        stdev,
    })
}

#[derive(Debug, Clone, PartialEq)]
pub struct TrendReading {
    pub slope: f64,
    pub intercept: f64,
    pub r_squared: f64,
    pub predicted_next: f64,
    pub data_points: usize,
}

pub fn analyze_trend(series: &[f64]) -> Option<TrendReading> {
    if series.len() < MIN_TREND_POINTS {
        return None;
    }
    let fit = linear_fit(series)?;
    let n = series.len();
    Some(TrendReading {
        slope: fit.slope,
        intercept: fit.intercept,
        r_squared: fit.r_squared,
        predicted_next: fit.predict((n + 1) as f64),
        data_points: n,
    })
}

pub fn risk_prediction(
    records: &[PerformanceRecord],
    params: &RiskPrediction,
    config: &RiskModelConfig,
) -> Vec<RuleMatch> {
    let trigger_score = params.threshold * params.sensitivity;

    collect_matches(records, |series| {
        if series.len() < MIN_RISK_POINTS {
            return None;
        }
        let breakdown = risk_score(series, config);
        (breakdown.score >= trigger_score).then(|| WarningDetails::MlRiskPrediction {
            risk_score: breakdown.score,
            trigger_score,
            average_risk: breakdown.average_risk,
            volatility_risk: breakdown.volatility_risk,
            trend_risk: breakdown.trend_risk,
            data_points: breakdown.data_points,
            factors: breakdown.factors,
        })
    })
}

pub fn anomaly_detection(records: &[PerformanceRecord], params: &AnomalyDetection) -> Vec<RuleMatch> {
    collect_matches(records, |series| {
        let reading = detect_anomaly(series)?;
        if reading.z_score < params.z_threshold || reading.severity < params.sensitivity {
            return None;
        }

        let mut factors = vec![match reading.direction {
            AnomalyDirection::Drop => "score_drop".to_string(),
            AnomalyDirection::Spike => "score_spike".to_string(),
        }];
        if reading.z_score >= 3.0 {
            factors.push("extreme_deviation".to_string());
        }

        Some(WarningDetails::MlAnomalyDetection {
            z_score: reading.z_score,
            severity: reading.severity,
            confidence: reading.confidence,
            direction: reading.direction,
            latest_score: reading.latest,
            mean: reading.mean,
            stdev: reading.stdev,
            factors,
        })
    })
}

pub fn trend_analysis(records: &[PerformanceRecord], params: &TrendAnalysis) -> Vec<RuleMatch> {
    collect_matches(records, |series| {
        let reading = analyze_trend(series)?;
        if reading.slope > params.decline_rate || reading.r_squared < params.confidence_threshold {
            return None;
        }

        let mut factors = vec!["declining_trend".to_string()];
        if reading.slope <= 2.0 * params.decline_rate {
            factors.push("steep_decline".to_string());
        }

        Some(WarningDetails::MlTrendAnalysis {
            slope: reading.slope,
            intercept: reading.intercept,
            r_squared: reading.r_squared,
            predicted_next: reading.predicted_next,
            data_points: reading.data_points,
            factors,
        })
    })
}

fn collect_matches<F>(records: &[PerformanceRecord], mut evaluate: F) -> Vec<RuleMatch>
where
    F: FnMut(&[f64]) -> Option<WarningDetails>,
{
    let mut matches: Vec<RuleMatch> = assessment_series(records)
        .into_iter()
        .filter_map(|(entity_id, points)| {
            let totals: Vec<f64> = points.iter().map(|p| p.total).collect();
            evaluate(&totals).map(|details| RuleMatch { entity_id, details })
        })
        .collect();
    matches.sort_by(|a, b| a.entity_id.cmp(&b.entity_id));
    matches
}
