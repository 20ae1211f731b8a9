use std::fmt;

use ahash::AHashMap;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

// ---------------------------------------------------------------------------
// Error
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum MetricsError {
    #[error("metric not registered: `{0}`")]
    NotRegistered(String),
    #[error("metric `{name}` is a {actual}, not a {expected}")]
    TypeMismatch {
        name: String,
        expected: MetricType,
        actual: MetricType,
    },
}

// ---------------------------------------------------------------------------
// Types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricType {
    Counter,
    Gauge,
    Histogram,
    Summary,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
            MetricType::Histogram => "histogram",
            MetricType::Summary => "summary",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A label set is a sorted list of key=value pairs. Two points with the same
/// labels belong to the same series.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Labels(Vec<(String, String)>);

impl Labels {
    pub fn new(pairs: &[(&str, &str)]) -> Self {
        let mut v: Vec<(String, String)> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        v.sort_by(|a, b| a.0.cmp(&b.0));
        Self(v)
    }

    pub fn empty() -> Self {
        Self(Vec::new())
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Format labels as `{key="value",key2="value2"}`; empty for no labels.
    pub fn prometheus_str(&self) -> String {
        if self.0.is_empty() {
            return String::new();
        }
        let inner: Vec<String> = self
            .0
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, escape_label(v)))
            .collect();
        format!("{{{}}}", inner.join(","))
    }

    pub fn to_json(&self) -> Value {
        let map: Map<String, Value> = self
            .0
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect();
        Value::Object(map)
    }
}

/// HELP text escapes only backslash and newline.
fn escape_help(text: &str) -> String {
    text.replace('\\', "\\\\").replace('\n', "\\n")
}

fn escape_label(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub labels: Labels,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricDefinition {
    pub name: String,
    pub metric_type: MetricType,
    pub description: String,
}

#[derive(Debug, Clone)]
struct Series {
    definition: MetricDefinition,
    /// Append-only, in recording order.
    points: Vec<MetricPoint>,
}

impl Series {
    fn last_for(&self, labels: &Labels) -> Option<&MetricPoint> {
        self.points.iter().rev().find(|p| &p.labels == labels)
    }
}

// ---------------------------------------------------------------------------
// MetricStore
// ---------------------------------------------------------------------------

/// Name-keyed time series.
///
/// Counters append `last + delta` for the matching label set, gauges and
/// distributions append the raw value. Reads see the latest point per label
/// set.
#[derive(Debug, Default)]
pub struct MetricStore {
    series: AHashMap<String, Series>,
}

impl MetricStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a metric. Registering an existing name again keeps its
    /// points and updates the description.
    pub fn register(
        &mut self,
        name: &str,
        metric_type: MetricType,
        description: &str,
    ) -> Result<(), MetricsError> {
        if let Some(existing) = self.series.get_mut(name) {
            if existing.definition.metric_type != metric_type {
                return Err(MetricsError::TypeMismatch {
                    name: name.to_string(),
                    expected: metric_type,
                    actual: existing.definition.metric_type,
                });
            }
            existing.definition.description = description.to_string();
            return Ok(());
        }
        self.series.insert(
            name.to_string(),
            Series {
                definition: MetricDefinition {
                    name: name.to_string(),
                    metric_type,
                    description: description.to_string(),
                },
                points: Vec::new(),
            },
        );
        Ok(())
    }

    pub fn definition(&self, name: &str) -> Option<&MetricDefinition> {
        self.series.get(name).map(|s| &s.definition)
    }

    /// Registered definitions sorted by name.
    pub fn definitions(&self) -> Vec<&MetricDefinition> {
        let mut defs: Vec<&MetricDefinition> = self.series.values().map(|s| &s.definition).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    pub fn len(&self) -> usize {
        self.series.len()
    }

    pub fn is_empty(&self) -> bool {
        self.series.is_empty()
    }

    // -- Recording -----------------------------------------------------------

    /// Add `delta` to a counter. Returns the new value.
    pub fn increment(&mut self, name: &str, labels: &Labels, delta: f64) -> Result<f64, MetricsError> {
        self.increment_at(name, labels, delta, Utc::now())
    }

    pub fn increment_at(
        &mut self,
        name: &str,
        labels: &Labels,
        delta: f64,
        at: DateTime<Utc>,
    ) -> Result<f64, MetricsError> {
        let series = self.typed(name, &[MetricType::Counter])?;
        let value = series.last_for(labels).map_or(0.0, |p| p.value) + delta;
        series.points.push(MetricPoint {
            timestamp: at,
            value,
            labels: labels.clone(),
        });
        Ok(value)
    }

    pub fn set_gauge(&mut self, name: &str, labels: &Labels, value: f64) -> Result<(), MetricsError> {
        self.set_gauge_at(name, labels, value, Utc::now())
    }

    pub fn set_gauge_at(
        &mut self,
        name: &str,
        labels: &Labels,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<(), MetricsError> {
        self.append(name, &[MetricType::Gauge], labels, value, at)
    }

    /// Record one observation of a histogram or summary.
    pub fn observe(&mut self, name: &str, labels: &Labels, value: f64) -> Result<(), MetricsError> {
        self.observe_at(name, labels, value, Utc::now())
    }

    pub fn observe_at(
        &mut self,
        name: &str,
        labels: &Labels,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<(), MetricsError> {
        self.append(
            name,
            &[MetricType::Histogram, MetricType::Summary],
            labels,
            value,
            at,
        )
    }

    // -- Reading ---------------------------------------------------------------

    /// All points of a metric in recording order.
    pub fn points(&self, name: &str) -> &[MetricPoint] {
        self.series
            .get(name)
            .map(|s| s.points.as_slice())
            .unwrap_or(&[])
    }

    /// Points with `from < timestamp <= to`.
    pub fn points_between(&self, name: &str, from: DateTime<Utc>, to: DateTime<Utc>) -> Vec<&MetricPoint> {
        self.points(name)
            .iter()
            .filter(|p| p.timestamp > from && p.timestamp <= to)
            .collect()
    }

    /// The newest point recorded at or before `at`, across all label sets.
    pub fn value_at(&self, name: &str, at: DateTime<Utc>) -> Option<&MetricPoint> {
        self.points(name)
            .iter()
            .filter(|p| p.timestamp <= at)
            .max_by_key(|p| p.timestamp)
    }

    pub fn latest(&self, name: &str, labels: &Labels) -> Option<f64> {
        self.series.get(name)?.last_for(labels).map(|p| p.value)
    }

    /// Latest point of every distinct label set, ordered by labels.
    pub fn latest_by_labels(&self, name: &str) -> Vec<&MetricPoint> {
        let mut latest: AHashMap<&Labels, &MetricPoint> = AHashMap::new();
        for point in self.points(name) {
            latest.insert(&point.labels, point);
        }
        let mut points: Vec<&MetricPoint> = latest.into_iter().map(|(_, p)| p).collect();
        points.sort_by(|a, b| a.labels.cmp(&b.labels));
        points
    }

    // -- Retention -------------------------------------------------------------

    /// Drop points older than `retention`. The newest point of each label
    /// set is always kept so counters continue from their last value.
    /// Returns the number of points removed.
    pub fn prune(&mut self, now: DateTime<Utc>, retention: Duration) -> usize {
        let cutoff = now - retention;
        let mut removed = 0;
        for series in self.series.values_mut() {
            let mut newest: AHashMap<Labels, usize> = AHashMap::new();
            for (i, p) in series.points.iter().enumerate() {
                newest.insert(p.labels.clone(), i);
            }
            let before = series.points.len();
            let mut index = 0;
            series.points.retain(|p| {
                let keep = p.timestamp >= cutoff || newest.get(&p.labels) == Some(&index);
                index += 1;
                keep
            });
            removed += before - series.points.len();
        }
        if removed > 0 {
            tracing::debug!(removed, "pruned metric points");
        }
        removed
    }

    // -- Export ------------------------------------------------------------------

    /// Prometheus text exposition: `# HELP`, `# TYPE`, then one line per
    /// label set with its latest value.
    pub fn export_prometheus(&self) -> String {
        let mut out = String::new();
        for def in self.definitions() {
            out.push_str(&format!("# HELP {} {}\n", def.name, escape_help(&def.description)));
            out.push_str(&format!("# TYPE {} {}\n", def.name, def.metric_type));
            for point in self.latest_by_labels(&def.name) {
                out.push_str(&format!(
                    "{}{} {}\n",
                    def.name,
                    point.labels.prometheus_str(),
                    point.value
                ));
            }
        }
        out
    }

    pub fn export_json(&self) -> Value {
        let mut metrics = Map::new();
        for def in self.definitions() {
            let series: Vec<Value> = self
                .latest_by_labels(&def.name)
                .into_iter()
                .map(|p| {
                    json!({
                        "labels": p.labels.to_json(),
                        "value": p.value,
                        "timestamp": p.timestamp,
                    })
                })
                .collect();
            metrics.insert(
                def.name.clone(),
                json!({
                    "type": def.metric_type,
                    "description": def.description,
                    "series": series,
                }),
            );
        }
        Value::Object(metrics)
    }

    // -- Internals -------------------------------------------------------------

    fn typed(&mut self, name: &str, allowed: &[MetricType]) -> Result<&mut Series, MetricsError> {
        let series = self
            .series
            .get_mut(name)
            .ok_or_else(|| MetricsError::NotRegistered(name.to_string()))?;
        let actual = series.definition.metric_type;
        if !allowed.contains(&actual) {
            return Err(MetricsError::TypeMismatch {
                name: name.to_string(),
                expected: allowed[0],
                actual,
            });
        }
        Ok(series)
    }

    fn append(
        &mut self,
        name: &str,
        allowed: &[MetricType],
        labels: &Labels,
        value: f64,
        at: DateTime<Utc>,
    ) -> Result<(), MetricsError> {
        let series = self.typed(name, allowed)?;
        series.points.push(MetricPoint {
            timestamp: at,
            value,
            labels: labels.clone(),
        });
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn labels_sorted_and_formatted() {
        let l = Labels::new(&[("z", "1"), ("a", "2")]);
        assert_eq!(l.prometheus_str(), "{a=\"2\",z=\"1\"}");
        assert_eq!(Labels::empty().prometheus_str(), "");
        assert_eq!(Labels::new(&[("q", "say \"hi\"")]).prometheus_str(), "{q=\"say \\\"hi\\\"\"}");
    }

    #[test]
    fn counter_accumulates_per_label_set() {
        let mut store = MetricStore::new();
        store.register("tasks_total", MetricType::Counter, "Tasks").unwrap();
        let ok = Labels::new(&[("status", "ok")]);
        let err = Labels::new(&[("status", "err")]);
        store.increment("tasks_total", &ok, 1.0).unwrap();
        store.increment("tasks_total", &ok, 2.0).unwrap();
        assert_eq!(store.increment("tasks_total", &err, 1.0).unwrap(), 1.0);
        assert_eq!(store.latest("tasks_total", &ok), Some(3.0));
        assert_eq!(store.points("tasks_total").len(), 3);
    }

    #[test]
    fn type_is_enforced() {
        let mut store = MetricStore::new();
        store.register("depth", MetricType::Gauge, "Depth").unwrap();
        let err = store.increment("depth", &Labels::empty(), 1.0).unwrap_err();
        assert!(matches!(err, MetricsError::TypeMismatch { .. }));
        assert!(store.register("depth", MetricType::Counter, "x").is_err());
        assert_eq!(
            store.set_gauge("nope", &Labels::empty(), 1.0),
            Err(MetricsError::NotRegistered("nope".into()))
        );
    }

    #[test]
    fn prune_keeps_newest_per_series() {
        let mut store = MetricStore::new();
        store.register("g", MetricType::Gauge, "").unwrap();
        let now = Utc::now();
        let l = Labels::empty();
        store.set_gauge_at("g", &l, 1.0, now - Duration::hours(3)).unwrap();
        store.set_gauge_at("g", &l, 2.0, now - Duration::hours(2)).unwrap();
        let removed = store.prune(now, Duration::hours(1));
        assert_eq!(removed, 1);
        assert_eq!(store.latest("g", &l), Some(2.0));

        store.set_gauge_at("g", &l, 3.0, now).unwrap();
        assert_eq!(store.prune(now, Duration::hours(1)), 1);
        assert_eq!(store.points("g").len(), 1);
    }

    #[test]
    fn window_queries() {
        let mut store = MetricStore::new();
        store.register("g", MetricType::Gauge, "").unwrap();
        let t0 = Utc::now();
        let l = Labels::empty();
        for s in 0..5 {
            store.set_gauge_at("g", &l, s as f64, t0 + Duration::seconds(s)).unwrap();
        }
        let mid = store.points_between("g", t0 + Duration::seconds(1), t0 + Duration::seconds(3));
        let values: Vec<f64> = mid.iter().map(|p| p.value).collect();
        assert_eq!(values, vec![2.0, 3.0]);
        assert_eq!(store.value_at("g", t0 + Duration::milliseconds(1500)).map(|p| p.value), Some(1.0));
        assert!(store.value_at("g", t0 - Duration::seconds(1)).is_none());
    }
}
