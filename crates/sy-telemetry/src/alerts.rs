use std::collections::BTreeMap;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::metrics::MetricStore;

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Warning,
    Error,
    Critical,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompareOp {
    Gt,
    Gte,
    Lt,
    Lte,
    Eq,
    Neq,
}

impl CompareOp {
    pub fn holds(&self, value: f64, threshold: f64) -> bool {
        match self {
            CompareOp::Gt => value > threshold,
            CompareOp::Gte => value >= threshold,
            CompareOp::Lt => value < threshold,
            CompareOp::Lte => value <= threshold,
            CompareOp::Eq => value == threshold,
            CompareOp::Neq => value != threshold,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Aggregation {
    #[default]
    Avg,
    Sum,
    Min,
    Max,
    Count,
    Last,
}

impl Aggregation {
    /// `None` for an empty slice.
    pub fn apply(&self, values: &[f64]) -> Option<f64> {
        let last = *values.last()?;
        Some(match self {
            Aggregation::Avg => values.iter().sum::<f64>() / values.len() as f64,
            Aggregation::Sum => values.iter().sum(),
            Aggregation::Min => values.iter().copied().fold(f64::INFINITY, f64::min),
            Aggregation::Max => values.iter().copied().fold(f64::NEG_INFINITY, f64::max),
            Aggregation::Count => values.len() as f64,
            Aggregation::Last => last,
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertCondition {
    pub metric: String,
    pub operator: CompareOp,
    pub threshold: f64,
    /// Sustained window in milliseconds. Without one only the newest point
    /// is considered.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub duration_ms: Option<u64>,
    #[serde(default)]
    pub aggregation: Aggregation,
}

impl AlertCondition {
    pub fn new(metric: impl Into<String>, operator: CompareOp, threshold: f64) -> Self {
        Self {
            metric: metric.into(),
            operator,
            threshold,
            duration_ms: None,
            aggregation: Aggregation::default(),
        }
    }

    pub fn sustained_for(mut self, duration_ms: u64) -> Self {
        self.duration_ms = Some(duration_ms);
        self
    }

    pub fn aggregated(mut self, aggregation: Aggregation) -> Self {
        self.aggregation = aggregation;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub severity: Severity,
    pub condition: AlertCondition,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Set while the condition holds. Notifications fire on changes only.
    #[serde(default)]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_triggered: Option<DateTime<Utc>>,
}

fn default_true() -> bool {
    true
}

impl Alert {
    pub fn new(name: impl Into<String>, severity: Severity, condition: AlertCondition) -> Self {
        Self {
            name: name.into(),
            description: String::new(),
            severity,
            condition,
            enabled: true,
            active: false,
            last_triggered: None,
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertState {
    Triggered,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertNotification {
    pub alert: String,
    pub severity: Severity,
    pub state: AlertState,
    /// Aggregated value that caused the transition.
    pub value: f64,
    pub threshold: f64,
    pub at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// AlertManager
// ---------------------------------------------------------------------------

/// Registered alerts and their subscribers.
#[derive(Debug, Default)]
pub struct AlertManager {
    alerts: BTreeMap<String, Alert>,
    subscribers: Vec<flume::Sender<AlertNotification>>,
}

impl AlertManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace an alert by name.
    pub fn add_alert(&mut self, alert: Alert) -> Option<Alert> {
        self.alerts.insert(alert.name.clone(), alert)
    }

    pub fn remove_alert(&mut self, name: &str) -> Option<Alert> {
        self.alerts.remove(name)
    }

    /// Returns `false` when no alert has that name.
    pub fn set_enabled(&mut self, name: &str, enabled: bool) -> bool {
        match self.alerts.get_mut(name) {
            Some(alert) => {
                alert.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<&Alert> {
        self.alerts.get(name)
    }

    pub fn alerts(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.values()
    }

    pub fn active(&self) -> impl Iterator<Item = &Alert> {
        self.alerts.values().filter(|a| a.active)
    }

    pub fn subscribe(&mut self) -> flume::Receiver<AlertNotification> {
        let (tx, rx) = flume::unbounded();
        self.subscribers.push(tx);
        rx
    }

    /// Evaluate every enabled alert at `now`, publish the transitions and
    /// return them.
    pub fn evaluate(&mut self, store: &MetricStore, now: DateTime<Utc>) -> Vec<AlertNotification> {
        let mut fired = Vec::new();
        for alert in self.alerts.values_mut().filter(|a| a.enabled) {
            let value = window_value(store, &alert.condition, now);
            let breaching = value.is_some_and(|v| alert.condition.operator.holds(v, alert.condition.threshold));

            let state = match (alert.active, breaching) {
                (false, true) => AlertState::Triggered,
                (true, false) => AlertState::Resolved,
                _ => continue,
            };
            alert.active = breaching;
            let value = value.unwrap_or(f64::NAN);
            match state {
                AlertState::Triggered => {
                    alert.last_triggered = Some(now);
                    warn!(alert = %alert.name, severity = ?alert.severity, value, threshold = alert.condition.threshold, "alert triggered");
                }
                AlertState::Resolved => {
                    info!(alert = %alert.name, value, "alert resolved");
                }
            }
            fired.push(AlertNotification {
                alert: alert.name.clone(),
                severity: alert.severity,
                state,
                value,
                threshold: alert.condition.threshold,
                at: now,
            });
        }

        for notification in &fired {
            self.subscribers
                .retain(|tx| tx.send(notification.clone()).is_ok());
        }
        fired
    }
}

/// Aggregate of the condition's window at `now`, or `None` when there is not
/// enough data.
///
/// A sustained window covers `(now - duration, now]` plus the value in effect
/// at the window start; a series that does not reach back to the start has
/// not been sustained long enough.
fn window_value(store: &MetricStore, condition: &AlertCondition, now: DateTime<Utc>) -> Option<f64> {
    let values: Vec<f64> = match condition.duration_ms {
        None => vec![store.value_at(&condition.metric, now)?.value],
        Some(ms) => {
            let start = now - Duration::milliseconds(ms as i64);
            let anchor = store.value_at(&condition.metric, start)?;
            std::iter::once(anchor.value)
                .chain(
                    store
                        .points_between(&condition.metric, start, now)
                        .into_iter()
                        .map(|p| p.value),
                )
                .collect()
        }
    };
    condition.aggregation.apply(&values)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::{Labels, MetricType};

    #[test]
    fn aggregations() {
        let v = [4.0, 1.0, 7.0];
        assert_eq!(Aggregation::Avg.apply(&v), Some(4.0));
        assert_eq!(Aggregation::Sum.apply(&v), Some(12.0));
        assert_eq!(Aggregation::Min.apply(&v), Some(1.0));
        assert_eq!(Aggregation::Max.apply(&v), Some(7.0));
        assert_eq!(Aggregation::Count.apply(&v), Some(3.0));
        assert_eq!(Aggregation::Last.apply(&v), Some(7.0));
        assert_eq!(Aggregation::Avg.apply(&[]), None);
    }

    #[test]
    fn operators() {
        assert!(CompareOp::Gt.holds(2.0, 1.0));
        assert!(!CompareOp::Gt.holds(1.0, 1.0));
        assert!(CompareOp::Gte.holds(1.0, 1.0));
        assert!(CompareOp::Lte.holds(1.0, 1.0));
        assert!(CompareOp::Neq.holds(1.0, 2.0));
        assert!(CompareOp::Eq.holds(2.0, 2.0));
    }

    #[test]
    fn missing_metric_never_triggers() {
        let store = MetricStore::new();
        let mut alerts = AlertManager::new();
        alerts.add_alert(Alert::new(
            "ghost",
            Severity::Critical,
            AlertCondition::new("does_not_exist", CompareOp::Gte, 0.0),
        ));
        assert!(alerts.evaluate(&store, Utc::now()).is_empty());
        assert!(!alerts.get("ghost").unwrap().active);
    }

    #[test]
    fn instant_alert_uses_newest_point() {
        let mut store = MetricStore::new();
        store.register("q", MetricType::Gauge, "").unwrap();
        let mut alerts = AlertManager::new();
        alerts.add_alert(Alert::new("deep", Severity::Warning, AlertCondition::new("q", CompareOp::Gt, 100.0)));
        let t0 = Utc::now();

        store.set_gauge_at("q", &Labels::empty(), 500.0, t0).unwrap();
        store.set_gauge_at("q", &Labels::empty(), 50.0, t0 + Duration::seconds(1)).unwrap();
        assert!(alerts.evaluate(&store, t0 + Duration::seconds(1)).is_empty());
        // evaluating in the past sees the value in effect then
        let fired = alerts.evaluate(&store, t0);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].value, 500.0);
    }

    #[test]
    fn disabled_alert_is_skipped() {
        let mut store = MetricStore::new();
        store.register("q", MetricType::Gauge, "").unwrap();
        store.set_gauge("q", &Labels::empty(), 1_000.0).unwrap();
        let mut alerts = AlertManager::new();
        alerts.add_alert(Alert::new("deep", Severity::Info, AlertCondition::new("q", CompareOp::Gt, 1.0)));
        assert!(alerts.set_enabled("deep", false));
        assert!(alerts.evaluate(&store, Utc::now()).is_empty());
        assert!(!alerts.set_enabled("missing", true));
        assert!(alerts.remove_alert("deep").is_some());
        assert_eq!(alerts.alerts().count(), 0);
    }
}
