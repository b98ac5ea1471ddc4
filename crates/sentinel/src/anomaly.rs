//! Per-agent transaction anomaly scoring. Advisory.
//!
//! Each agent gets a bounded history of feature rows (log-amount,
//! hour-of-day, day-of-week, amount z-score against the rolling mean). A
//! per-agent model is trained once history reaches [`MIN_TRAIN_EVENTS`] and
//! refreshed every [`RETRAIN_EVERY`] new samples rather than per request.
//! Inference runs on the blocking pool so the governance loop never stalls
//! on scoring. Below the training threshold the scorer returns a neutral
//! assessment.

use chrono::{DateTime, Datelike, Timelike, Utc};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Events required before a model is trained for an agent.
pub const MIN_TRAIN_EVENTS: usize = 20;
/// New samples between model refreshes.
pub const RETRAIN_EVERY: usize = 10;
/// Most recent events kept per agent.
pub const HISTORY_CAP: usize = 256;

const FEATURES: usize = 4;
// Per-feature deviation cap; keeps a single wild feature from saturating
// the whole score.
const Z_CAP: f64 = 6.0;
const EPSILON: f64 = 1e-9;

/// Scoring result handed to the engine.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RiskAssessment {
    /// 0.0 (ordinary) to 1.0 (far outside the agent's pattern).
    pub risk_score: f64,
    pub anomalous: bool,
    pub model_trained: bool,
}

impl RiskAssessment {
    fn neutral() -> Self {
        Self {
            risk_score: 0.5,
            anomalous: false,
            model_trained: false,
        }
    }
}

#[derive(Debug, Clone)]
struct GaussianModel {
    mean: [f64; FEATURES],
    std: [f64; FEATURES],
}

impl GaussianModel {
    fn train(rows: &VecDeque<[f64; FEATURES]>) -> Self {
        let n = rows.len() as f64;
        let mut mean = [0.0; FEATURES];
        for row in rows {
            for (i, value) in row.iter().enumerate() {
                mean[i] += value / n;
            }
        }
        let mut std = [0.0; FEATURES];
        for row in rows {
            for (i, value) in row.iter().enumerate() {
                std[i] += (value - mean[i]).powi(2) / n;
            }
        }
        for s in &mut std {
            *s = s.sqrt();
        }
        Self { mean, std }
    }

    fn deviation(&self, row: &[f64; FEATURES]) -> f64 {
        let mut total = 0.0;
        for i in 0..FEATURES {
            let delta = (row[i] - self.mean[i]).abs();
            let z = if self.std[i] > EPSILON {
                delta / self.std[i]
            } else if delta > EPSILON {
                Z_CAP
            } else {
                0.0
            };
            total += z.min(Z_CAP);
        }
        total / FEATURES as f64
    }
}

#[derive(Default)]
struct AgentHistory {
    rows: VecDeque<[f64; FEATURES]>,
    amounts: VecDeque<f64>,
    model: Option<GaussianModel>,
    samples_since_train: usize,
}

/// Process-local anomaly scorer.
pub struct AnomalyScorer {
    agents: Arc<Mutex<HashMap<String, AgentHistory>>>,
    anomaly_threshold: f64,
}

impl Default for AnomalyScorer {
    fn default() -> Self {
        Self::new()
    }
}

impl AnomalyScorer {
    pub fn new() -> Self {
        Self {
            agents: Arc::new(Mutex::new(HashMap::new())),
            anomaly_threshold: 0.8,
        }
    }

    pub fn with_threshold(mut self, threshold: f64) -> Self {
        self.anomaly_threshold = threshold;
        self
    }

    /// Events currently tracked for an agent.
    pub fn tracked_events(&self, agent_id: &str) -> usize {
        self.agents
            .lock()
            .get(agent_id)
            .map(|h| h.rows.len())
            .unwrap_or(0)
    }

    /// Score a transaction and fold it into the agent's history.
    ///
    /// The feature row is recorded after its z-score is computed from prior
    /// history, so stored samples are never contaminated by placeholder
    /// values.
    pub async fn score(
        &self,
        agent_id: &str,
        amount_minor: i64,
        timestamp: DateTime<Utc>,
        vendor_url: Option<&str>,
    ) -> RiskAssessment {
        let (row, model) = {
            let mut agents = self.agents.lock();
            let history = agents.entry(agent_id.to_string()).or_default();

            let amount = amount_minor as f64;
            let z = amount_zscore(&history.amounts, amount);
            let row = [
                amount.max(1.0).ln(),
                timestamp.hour() as f64,
                timestamp.weekday().num_days_from_monday() as f64,
                z,
            ];

            if history.rows.len() >= MIN_TRAIN_EVENTS
                && (history.model.is_none() || history.samples_since_train >= RETRAIN_EVERY)
            {
                history.model = Some(GaussianModel::train(&history.rows));
                history.samples_since_train = 0;
            }

            history.rows.push_back(row);
            history.amounts.push_back(amount);
            while history.rows.len() > HISTORY_CAP {
                history.rows.pop_front();
                history.amounts.pop_front();
            }
            history.samples_since_train += 1;

            (row, history.model.clone())
        };

        let Some(model) = model else {
            return RiskAssessment::neutral();
        };

        let threshold = self.anomaly_threshold;
        let inference = tokio::task::spawn_blocking(move || {
            let deviation = model.deviation(&row);
            let risk_score = (deviation / 3.0).clamp(0.0, 1.0);
            RiskAssessment {
                risk_score,
                anomalous: risk_score >= threshold,
                model_trained: true,
            }
        })
        .await;

        match inference {
            Ok(assessment) => {
                if assessment.anomalous {
                    tracing::warn!(
                        agent_id = %agent_id,
                        amount_minor,
                        vendor_url = vendor_url.unwrap_or("-"),
                        risk_score = assessment.risk_score,
                        "transaction outside agent pattern"
                    );
                }
                assessment
            }
            Err(err) => {
                tracing::warn!(agent_id = %agent_id, error = %err, "anomaly inference task failed");
                RiskAssessment::neutral()
            }
        }
    }
}

fn amount_zscore(prior: &VecDeque<f64>, amount: f64) -> f64 {
    if prior.is_empty() {
        return 0.0;
    }
    let n = prior.len() as f64;
    let mean = prior.iter().sum::<f64>() / n;
    let variance = prior.iter().map(|a| (a - mean).powi(2)).sum::<f64>() / n;
    let std = variance.sqrt();
    if std > EPSILON {
        (amount - mean) / std
    } else if (amount - mean).abs() > EPSILON {
        Z_CAP
    } else {
        0.0
    }
}
