//! Prometheus text exposition of monitor records and pipeline counters.
//!
//! Renders the state a scraper or push job publishes: the folded metrics
//! of each namespace's monitor record plus the process-wide counters from
//! [`StatsSnapshot`].
//!
//! # Design
//!
//! Samples are collected per metric family and rendered once at the end,
//! so a family's `# HELP`/`# TYPE` header appears exactly once and its
//! samples stay contiguous no matter how many records are added. Families
//! render in name order.
//!
//! Record fields become gauges named `tally_window_<field>` with a
//! `namespace` label. When the namespace's latency source declares
//! histogram bounds, its `_sum`, `_count` and cumulative `_le_<bound>`
//! fields are rendered together as one histogram family instead.
//!
//! # Example
//!
//! ```rust
//! use tally::export::PromExporter;
//! use tally::stats::StatsSnapshot;
//!
//! let mut exporter = PromExporter::new().with_label("hostname", "node-1");
//! exporter.add_stats(&StatsSnapshot::default(), 2);
//! let text = exporter.render();
//! assert!(text.contains("# TYPE tally_namespaces gauge"));
//! assert!(text.contains("tally_namespaces{hostname=\"node-1\"} 2"));
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::fmt::Write as _;

use crate::monitor::MonitorRecord;
use crate::namespace::NamespaceConfig;
use crate::stats::StatsSnapshot;

const PREFIX: &str = "tally";

/// Prometheus metric type of a family.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MetricKind {
    /// Monotonic counter.
    Counter,
    /// Point-in-time value.
    Gauge,
    /// Cumulative buckets with `_sum` and `_count`.
    Histogram,
    /// `_sum` and `_count` without quantiles.
    Summary,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Histogram => "histogram",
            Self::Summary => "summary",
        }
    }
}

#[derive(Debug)]
struct Family {
    help: String,
    kind: MetricKind,
    samples: Vec<String>,
}

/// Accumulates samples and renders them in the text exposition format.
#[derive(Debug, Default)]
pub struct PromExporter {
    labels: Vec<(String, String)>,
    families: BTreeMap<String, Family>,
}

impl PromExporter {
    /// Creates an empty exporter.
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a label attached to every sample, such as `hostname`.
    #[must_use]
    pub fn with_label(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.push((sanitize(&name.into()), value.into()));
        self
    }

    /// Adds one namespace's monitor record.
    #[allow(clippy::cast_precision_loss)] // Window counts are small
    pub fn add_record(&mut self, namespace: &NamespaceConfig, record: &MonitorRecord) {
        let labels = [("namespace", record.namespace.as_str())];
        let mut histogram_fields = BTreeSet::new();

        if let Some(latency) = namespace.filter.latency.as_ref().filter(|l| !l.buckets.is_empty()) {
            let family = format!("{PREFIX}_window_{}", sanitize(&latency.metric));
            let help = format!("Distribution of {} over the monitor range.", latency.metric);
            for (bound, field) in latency.bucket_fields() {
                let le = bound.to_string();
                self.sample(
                    &family,
                    MetricKind::Histogram,
                    &help,
                    "_bucket",
                    &[labels[0], ("le", le.as_str())],
                    record.metric(&field),
                );
                histogram_fields.insert(field);
            }
            let count = record.metric(&latency.count_field());
            self.sample(&family, MetricKind::Histogram, &help, "_bucket", &[labels[0], ("le", "+Inf")], count);
            self.sample(
                &family,
                MetricKind::Histogram,
                &help,
                "_sum",
                &labels,
                record.metric(&latency.sum_field()),
            );
            self.sample(&family, MetricKind::Histogram, &help, "_count", &labels, count);
            histogram_fields.insert(latency.sum_field());
            histogram_fields.insert(latency.count_field());
        }

        for (field, value) in &record.metrics {
            if histogram_fields.contains(field) {
                continue;
            }
            let family = format!("{PREFIX}_window_{}", sanitize(field));
            let help = format!("Folded {field} over the monitor range.");
            self.sample(&family, MetricKind::Gauge, &help, "", &labels, *value);
        }

        self.sample(
            &format!("{PREFIX}_window_count"),
            MetricKind::Gauge,
            "Windows folded into the monitor record.",
            "",
            &labels,
            record.windows as f64,
        );
        self.sample(
            &format!("{PREFIX}_window_stale"),
            MetricKind::Gauge,
            "Whether any folded window failed to persist.",
            "",
            &labels,
            if record.stale { 1.0 } else { 0.0 },
        );
    }

    /// Adds the pipeline counters for `namespaces` registered namespaces.
    #[allow(clippy::cast_precision_loss)] // Counters are exposed as f64 samples
    pub fn add_stats(&mut self, stats: &StatsSnapshot, namespaces: usize) {
        let counters = [
            ("processed_total", "Events offered to the pipeline.", stats.processed),
            ("accepted_total", "Events reduced into a window.", stats.accepted),
            (
                "classification_errors_total",
                "Events no namespace could be resolved for.",
                stats.classification_errors,
            ),
            ("discarded_total", "Events that reached no window.", stats.discarded()),
            ("persisted_total", "Acknowledged store writes.", stats.persisted),
            ("retries_total", "Store write retries.", stats.retries),
            ("degraded_total", "Writes that exhausted their retries.", stats.degraded),
            ("evictions_total", "Buckets evicted by capacity or age.", stats.evictions),
        ];
        for (name, help, value) in counters {
            self.sample(&format!("{PREFIX}_{name}"), MetricKind::Counter, help, "", &[], value as f64);
        }

        let filtered = format!("{PREFIX}_filtered_total");
        for (namespace, count) in &stats.filtered {
            self.sample(
                &filtered,
                MetricKind::Counter,
                "Filter rejections per namespace.",
                "",
                &[("namespace", namespace.as_str())],
                *count as f64,
            );
        }

        self.sample(
            &format!("{PREFIX}_namespaces"),
            MetricKind::Gauge,
            "Registered namespaces.",
            "",
            &[],
            namespaces as f64,
        );

        let ingest = format!("{PREFIX}_ingest_seconds");
        let help = "Time spent ingesting events.";
        self.sample(&ingest, MetricKind::Summary, help, "_sum", &[], seconds(stats.ingest_nanos));
        self.sample(&ingest, MetricKind::Summary, help, "_count", &[], stats.processed as f64);

        let monitor = format!("{PREFIX}_monitor_seconds");
        let help = "Time spent answering monitor queries.";
        self.sample(&monitor, MetricKind::Summary, help, "_sum", &[], seconds(stats.monitor_nanos));
        self.sample(&monitor, MetricKind::Summary, help, "_count", &[], stats.monitors as f64);
    }

    /// Renders every family added so far.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (name, family) in &self.families {
            let _ = writeln!(out, "# HELP {name} {}", escape_help(&family.help));
            let _ = writeln!(out, "# TYPE {name} {}", family.kind.as_str());
            for sample in &family.samples {
                out.push_str(sample);
                out.push('\n');
            }
        }
        out
    }

    fn sample(&mut self, family: &str, kind: MetricKind, help: &str, suffix: &str, labels: &[(&str, &str)], value: f64) {
        let mut line = format!("{family}{suffix}");
        let all: Vec<(&str, &str)> = labels
            .iter()
            .copied()
            .chain(self.labels.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .collect();
        if !all.is_empty() {
            line.push('{');
            for (i, (name, value)) in all.iter().enumerate() {
                if i > 0 {
                    line.push(',');
                }
                let _ = write!(line, "{name}=\"{}\"", escape_label(value));
            }
            line.push('}');
        }
        let _ = write!(line, " {}", format_value(value));

        self.families
            .entry(family.to_string())
            .or_insert_with(|| Family {
                help: help.to_string(),
                kind,
                samples: Vec::new(),
            })
            .samples
            .push(line);
    }
}

/// Maps a field name onto the metric name alphabet `[a-zA-Z0-9_]`.
fn sanitize(name: &str) -> String {
    let mut out: String = name
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' { c } else { '_' })
        .collect();
    if out.starts_with(|c: char| c.is_ascii_digit()) {
        out.insert(0, '_');
    }
    out
}

fn escape_label(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"").replace('\n', "\\n")
}

fn escape_help(help: &str) -> String {
    help.replace('\\', "\\\\").replace('\n', "\\n")
}

fn format_value(value: f64) -> String {
    if value.is_nan() {
        "NaN".to_string()
    } else if value == f64::INFINITY {
        "+Inf".to_string()
    } else if value == f64::NEG_INFINITY {
        "-Inf".to_string()
    } else {
        value.to_string()
    }
}

#[allow(clippy::cast_precision_loss)]
fn seconds(nanos: u64) -> f64 {
    nanos as f64 / 1e9
}
