//! Prometheus-compatible reconstruction metrics.
//!
//! Counters are kept per category and rendered in Prometheus text exposition
//! format, one family per metric name.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Duration;

/// Category label of items naming no registered category. Request input is
/// never used as a label value.
pub const UNKNOWN_CATEGORY_LABEL: &str = "unknown";

/// A single Prometheus sample.
#[derive(Debug, Clone, PartialEq)]
pub struct Metric {
    /// Metric name (e.g., "archivum_recon_items_ok_total").
    pub name: String,
    /// Help text for the metric.
    pub help: String,
    /// Metric type ("counter" or "gauge").
    pub metric_type: String,
    /// Labels as key=value pairs.
    pub labels: Vec<(String, String)>,
    /// Current value.
    pub value: f64,
}

impl Metric {
    /// Create a new counter sample.
    pub fn counter(name: &str, help: &str, labels: Vec<(String, String)>, value: f64) -> Self {
        Self {
            name: name.to_string(),
            help: help.to_string(),
            metric_type: "counter".to_string(),
            labels,
            value,
        }
    }

    /// The sample line, without HELP/TYPE headers.
    pub fn sample_line(&self) -> String {
        if self.labels.is_empty() {
            return format!("{} {}\n", self.name, self.format_value());
        }
        let label_str = self
            .labels
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"", k, v.replace('\\', "\\\\").replace('"', "\\\"")))
            .collect::<Vec<_>>()
            .join(",");
        format!("{}{{{}}} {}\n", self.name, label_str, self.format_value())
    }

    fn format_value(&self) -> String {
        if self.value.fract() == 0.0 && self.value.abs() < 1e15 {
            format!("{}", self.value as i64)
        } else {
            format!("{}", self.value)
        }
    }
}

/// Render samples, emitting HELP/TYPE once per metric name.
pub fn format_prometheus(metrics: &[Metric]) -> String {
    let mut output = String::new();
    let mut last_name: Option<&str> = None;
    for m in metrics {
        if last_name != Some(m.name.as_str()) {
            output.push_str(&format!("# HELP {} {}\n", m.name, m.help));
            output.push_str(&format!("# TYPE {} {}\n", m.name, m.metric_type));
            last_name = Some(m.name.as_str());
        }
        output.push_str(&m.sample_line());
    }
    output
}

/// Counters of one category.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategoryCounters {
    /// Items that ended OK.
    pub items_ok: u64,
    /// Items that ended KO.
    pub items_ko: u64,
    /// Backup-log entries applied to the sinks.
    pub entries_applied: u64,
    /// Entries skipped because their object was missing.
    pub entries_skipped: u64,
    /// Total time spent on items, in milliseconds.
    pub duration_ms: u64,
    /// Documents written into graph snapshots.
    pub graph_documents_stored: u64,
    /// Graph-only documents purged.
    pub graph_only_purged: u64,
}

/// Thread-safe metrics registry shared by the services.
#[derive(Debug, Default)]
pub struct ReconstructionMetrics {
    by_category: Mutex<BTreeMap<String, CategoryCounters>>,
}

impl ReconstructionMetrics {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    fn update(&self, category: &str, f: impl FnOnce(&mut CategoryCounters)) {
        if let Ok(mut map) = self.by_category.lock() {
            f(map.entry(category.to_string()).or_default());
        }
    }

    /// Record the outcome of one item.
    pub fn record_item(&self, category: &str, ok: bool, applied: u64, skipped: u64, elapsed: Duration) {
        self.update(category, |c| {
            if ok {
                c.items_ok += 1;
            } else {
                c.items_ko += 1;
            }
            c.entries_applied += applied;
            c.entries_skipped += skipped;
            c.duration_ms += elapsed.as_millis() as u64;
        });
    }

    /// Record a graph snapshot.
    pub fn record_graph_stored(&self, category: &str, documents: u64) {
        self.update(category, |c| c.graph_documents_stored += documents);
    }

    /// Record a graph-only purge.
    pub fn record_purge(&self, category: &str, purged: u64) {
        self.update(category, |c| c.graph_only_purged += purged);
    }

    /// Counters of one category (zeros if never touched).
    pub fn counters(&self, category: &str) -> CategoryCounters {
        self.by_category
            .lock()
            .ok()
            .and_then(|m| m.get(category).cloned())
            .unwrap_or_default()
    }

    /// All samples, grouped by metric name.
    pub fn to_metrics(&self) -> Vec<Metric> {
        let snapshot = self
            .by_category
            .lock()
            .map(|m| m.clone())
            .unwrap_or_default();

        type Getter = fn(&CategoryCounters) -> u64;
        let families: [(&str, &str, Getter); 7] = [
            ("archivum_recon_items_ok_total", "Reconstruction items completed OK", |c| c.items_ok),
            ("archivum_recon_items_ko_total", "Reconstruction items failed", |c| c.items_ko),
            ("archivum_recon_entries_applied_total", "Backup log entries applied", |c| c.entries_applied),
            ("archivum_recon_entries_skipped_total", "Backup log entries skipped as missing", |c| c.entries_skipped),
            ("archivum_recon_duration_ms_total", "Time spent reconstructing, in milliseconds", |c| c.duration_ms),
            ("archivum_graph_documents_stored_total", "Documents written to graph snapshots", |c| c.graph_documents_stored),
            ("archivum_graph_only_purged_total", "Graph-only documents purged", |c| c.graph_only_purged),
        ];

        let mut out = Vec::new();
        for (name, help, get) in families {
            for (category, counters) in &snapshot {
                out.push(Metric::counter(
                    name,
                    help,
                    vec![("category".to_string(), category.clone())],
                    get(counters) as f64,
                ));
            }
        }
        out
    }

    /// Format everything as Prometheus text exposition format.
    pub fn to_prometheus(&self) -> String {
        format_prometheus(&self.to_metrics())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_item() {
        let m = ReconstructionMetrics::new();
        m.record_item("UNIT", true, 3, 1, Duration::from_millis(20));
        m.record_item("UNIT", false, 0, 0, Duration::from_millis(5));
        let c = m.counters("UNIT");
        assert_eq!(c.items_ok, 1);
        assert_eq!(c.items_ko, 1);
        assert_eq!(c.entries_applied, 3);
        assert_eq!(c.entries_skipped, 1);
        assert_eq!(c.duration_ms, 25);
        assert_eq!(m.counters("OBJECTGROUP"), CategoryCounters::default());
    }

    #[test]
    fn test_prometheus_headers_once_per_family() {
        let m = ReconstructionMetrics::new();
        m.record_item("UNIT", true, 2, 0, Duration::ZERO);
        m.record_item("OBJECTGROUP", true, 1, 0, Duration::ZERO);
        let text = m.to_prometheus();
        assert_eq!(text.matches("# TYPE archivum_recon_items_ok_total counter").count(), 1);
        assert!(text.contains("archivum_recon_entries_applied_total{category=\"UNIT\"} 2\n"));
        assert!(text.contains("archivum_recon_entries_applied_total{category=\"OBJECTGROUP\"} 1\n"));
    }

    #[test]
    fn test_empty_registry_renders_nothing() {
        assert!(ReconstructionMetrics::new().to_prometheus().is_empty());
    }

    #[test]
    fn test_label_escaping() {
        let metric = Metric::counter("x_total", "x", vec![("category".into(), "a\"b".into())], 1.5);
        assert_eq!(metric.sample_line(), "x_total{category=\"a\\\"b\"} 1.5\n");
    }
}
