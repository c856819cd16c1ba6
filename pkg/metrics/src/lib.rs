use std::collections::BTreeMap;
use std::fmt::Write;
use std::sync::{PoisonError, RwLock};

/// Sorted `(label, value)` pairs identifying one series of a family.
type LabelSet = Vec<(String, String)>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Counter,
    Gauge,
}

impl Kind {
    fn as_str(self) -> &'static str {
        match self {
            Kind::Counter => "counter",
            Kind::Gauge => "gauge",
        }
    }
}

struct Family {
    kind: Kind,
    help: String,
    series: BTreeMap<LabelSet, i64>,
}

/// A lightweight, thread-safe metrics registry with labelled series that
/// renders in Prometheus text exposition format.
///
/// Updating a family that was never registered is a no-op.
pub struct MetricsRegistry {
    families: RwLock<BTreeMap<String, Family>>,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            families: RwLock::new(BTreeMap::new()),
        }
    }

    /// Register a counter family. If it already exists, this is a no-op.
    pub fn register_counter(&self, name: &str, help: &str) {
        self.register(name, help, Kind::Counter);
    }

    /// Register a gauge family. If it already exists, this is a no-op.
    pub fn register_gauge(&self, name: &str, help: &str) {
        self.register(name, help, Kind::Gauge);
    }

    fn register(&self, name: &str, help: &str, kind: Kind) {
        let mut families = self.families.write().unwrap_or_else(PoisonError::into_inner);
        families.entry(name.to_string()).or_insert_with(|| Family {
            kind,
            help: help.to_string(),
            series: BTreeMap::new(),
        });
    }

    /// Increment the counter series identified by `labels` by 1.
    pub fn counter_inc(&self, name: &str, labels: &[(&str, &str)]) {
        self.update(name, labels, Kind::Counter, |v| *v += 1);
    }

    /// Set the gauge series identified by `labels`.
    pub fn gauge_set(&self, name: &str, labels: &[(&str, &str)], val: i64) {
        self.update(name, labels, Kind::Gauge, |v| *v = val);
    }

    fn update(&self, name: &str, labels: &[(&str, &str)], kind: Kind, f: impl FnOnce(&mut i64)) {
        let mut families = self.families.write().unwrap_or_else(PoisonError::into_inner);
        if let Some(family) = families.get_mut(name)
            && family.kind == kind
        {
            let mut key: LabelSet = labels
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect();
            key.sort();
            f(family.series.entry(key).or_insert(0));
        }
    }

    /// Current value of a series, mostly for tests.
    pub fn value(&self, name: &str, labels: &[(&str, &str)]) -> Option<i64> {
        let families = self.families.read().unwrap_or_else(PoisonError::into_inner);
        let mut key: LabelSet = labels
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        key.sort();
        families.get(name)?.series.get(&key).copied()
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        let families = self.families.read().unwrap_or_else(PoisonError::into_inner);
        let mut output = String::new();
        for (name, family) in families.iter() {
            let _ = writeln!(output, "# HELP {} {}", name, family.help);
            let _ = writeln!(output, "# TYPE {} {}", name, family.kind.as_str());
            for (labels, value) in &family.series {
                if labels.is_empty() {
                    let _ = writeln!(output, "{} {}", name, value);
                } else {
                    let rendered: Vec<String> = labels
                        .iter()
                        .map(|(k, v)| format!("{}=\"{}\"", k, escape(v)))
                        .collect();
                    let _ = writeln!(output, "{}{{{}}} {}", name, rendered.join(","), value);
                }
            }
        }
        output
    }
}

fn escape(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}
