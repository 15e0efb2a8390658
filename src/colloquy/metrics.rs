//! Metrics collection over the event bus.
//!
//! [`MetricsCollector`] subscribes to the event bus and maintains
//! counters, gauges, and histograms keyed on the conversation's pack,
//! prompt, model, tool, session, and turn labels plus any user-supplied
//! base labels. Label names follow the Prometheus naming rule
//! `[A-Za-z_][A-Za-z0-9_]*` and must not start with `__`.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use crate::colloquy::error::RuntimeError;
use crate::colloquy::event::{EventSubscriber, EventType, RuntimeEvent};

/// Validate a metric/label name: `[A-Za-z_][A-Za-z0-9_]*`, not starting
/// with `__` (reserved).
pub fn validate_label_name(name: &str) -> Result<(), RuntimeError> {
    if name.starts_with("__") {
        return Err(RuntimeError::Validation(format!(
            "label name '{}' must not start with '__'",
            name
        )));
    }
    let mut chars = name.chars();
    let valid_first = chars
        .next()
        .map(|c| c.is_ascii_alphabetic() || c == '_')
        .unwrap_or(false);
    if !valid_first || !chars.all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(RuntimeError::Validation(format!(
            "invalid label name '{}'",
            name
        )));
    }
    Ok(())
}

/// Aggregated observations for one histogram series.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HistogramValue {
    /// Number of observations.
    pub count: u64,
    /// Sum of observed values.
    pub sum: f64,
    /// Smallest observation.
    pub min: f64,
    /// Largest observation.
    pub max: f64,
}

impl HistogramValue {
    fn observe(&mut self, value: f64) {
        if self.count == 0 {
            self.min = value;
            self.max = value;
        } else {
            self.min = self.min.min(value);
            self.max = self.max.max(value);
        }
        self.count += 1;
        self.sum += value;
    }
}

/// A metric series key: name plus its sorted label set.
pub type SeriesKey = (String, BTreeMap<String, String>);

#[derive(Default)]
struct Registry {
    counters: HashMap<SeriesKey, u64>,
    gauges: HashMap<SeriesKey, f64>,
    histograms: HashMap<SeriesKey, HistogramValue>,
}

/// Event-bus subscriber that exports counters, gauges, and histograms.
pub struct MetricsCollector {
    base_labels: BTreeMap<String, String>,
    registry: Mutex<Registry>,
}

impl MetricsCollector {
    /// Create a collector with no base labels.
    pub fn new() -> Self {
        Self {
            base_labels: BTreeMap::new(),
            registry: Mutex::new(Registry::default()),
        }
    }

    /// Create a collector with user-supplied base labels attached to every
    /// series. Invalid label names are rejected.
    pub fn with_base_labels(
        labels: impl IntoIterator<Item = (String, String)>,
    ) -> Result<Self, RuntimeError> {
        let mut base = BTreeMap::new();
        for (name, value) in labels {
            validate_label_name(&name)?;
            base.insert(name, value);
        }
        Ok(Self {
            base_labels: base,
            registry: Mutex::new(Registry::default()),
        })
    }

    fn labels_for(&self, event: &RuntimeEvent) -> BTreeMap<String, String> {
        let mut labels = self.base_labels.clone();
        labels.insert("session_id".into(), event.session_id.clone());
        for key in ["pack", "prompt", "model", "tool", "turn_index"] {
            if let Some(value) = event.data.get(key) {
                let text = match value {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                labels.insert(key.to_string(), text);
            }
        }
        labels
    }

    /// Counter value for a series, zero when unobserved.
    pub fn counter(&self, name: &str, labels: &BTreeMap<String, String>) -> u64 {
        let registry = self.registry.lock().unwrap();
        registry
            .counters
            .get(&(name.to_string(), labels.clone()))
            .copied()
            .unwrap_or(0)
    }

    /// Sum a counter across all label sets.
    pub fn counter_total(&self, name: &str) -> u64 {
        let registry = self.registry.lock().unwrap();
        registry
            .counters
            .iter()
            .filter(|((n, _), _)| n == name)
            .map(|(_, v)| *v)
            .sum()
    }

    /// Histogram aggregate across all label sets.
    pub fn histogram_total(&self, name: &str) -> HistogramValue {
        let registry = self.registry.lock().unwrap();
        let mut total = HistogramValue::default();
        for ((n, _), value) in registry.histograms.iter() {
            if n == name {
                if total.count == 0 {
                    total.min = value.min;
                    total.max = value.max;
                } else {
                    total.min = total.min.min(value.min);
                    total.max = total.max.max(value.max);
                }
                total.count += value.count;
                total.sum += value.sum;
            }
        }
        total
    }

    /// Snapshot of all counter series.
    pub fn counters(&self) -> HashMap<SeriesKey, u64> {
        self.registry.lock().unwrap().counters.clone()
    }

    /// Latest gauge value for a series.
    pub fn gauge(&self, name: &str, labels: &BTreeMap<String, String>) -> Option<f64> {
        self.registry
            .lock()
            .unwrap()
            .gauges
            .get(&(name.to_string(), labels.clone()))
            .copied()
    }

    fn increment(&self, name: &str, labels: BTreeMap<String, String>) {
        let mut registry = self.registry.lock().unwrap();
        *registry
            .counters
            .entry((name.to_string(), labels))
            .or_insert(0) += 1;
    }

    fn gauge_set(&self, name: &str, labels: BTreeMap<String, String>, value: f64) {
        let mut registry = self.registry.lock().unwrap();
        registry.gauges.insert((name.to_string(), labels), value);
    }

    fn observe(&self, name: &str, labels: BTreeMap<String, String>, value: f64) {
        let mut registry = self.registry.lock().unwrap();
        registry
            .histograms
            .entry((name.to_string(), labels))
            .or_default()
            .observe(value);
    }
}

impl Default for MetricsCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl EventSubscriber for MetricsCollector {
    fn on_event(&self, event: &RuntimeEvent) {
        let labels = self.labels_for(event);
        match event.event_type {
            EventType::PipelineCompleted => {
                self.increment("turns_completed_total", labels);
            }
            EventType::PipelineFailed => {
                self.increment("turns_failed_total", labels);
            }
            EventType::ProviderCallCompleted => {
                self.increment("provider_calls_total", labels.clone());
                if let Some(tokens) = event.data.get("total_tokens").and_then(|v| v.as_u64()) {
                    self.observe("provider_tokens", labels, tokens as f64);
                }
            }
            EventType::ProviderCallFailed => {
                self.increment("provider_call_failures_total", labels);
            }
            EventType::ToolCallCompleted => {
                self.increment("tool_calls_total", labels.clone());
                if let Some(ms) = event.data.get("elapsed_ms").and_then(|v| v.as_f64()) {
                    self.observe("tool_call_duration_ms", labels, ms);
                }
            }
            EventType::ToolCallFailed => {
                self.increment("tool_call_failures_total", labels);
            }
            EventType::StageCompleted => {
                if let Some(ms) = event.data.get("elapsed_ms").and_then(|v| v.as_f64()) {
                    self.observe("stage_duration_ms", labels, ms);
                }
            }
            EventType::ContextAssembled => {
                if let Some(n) = event.data.get("messages").and_then(|v| v.as_u64()) {
                    self.gauge_set("context_messages", labels, n as f64);
                }
            }
            EventType::EventDropped => {
                self.increment("events_dropped_total", labels);
            }
            _ => {}
        }
    }
}
