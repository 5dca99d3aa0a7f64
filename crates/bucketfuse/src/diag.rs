//! Structured diagnostic surface.
//!
//! Instead of printing, the engine hands structured events to an optionally
//! installed [`DiagSink`]. The human-readable bucket table goes through a
//! pluggable [`TableFormatter`]; without one the report renders as a plain
//! listing. Neither collaborator being absent is ever an error.

use std::fmt;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::bucket::Bucket;

/// External pretty-printer for tabular diagnostics.
pub trait TableFormatter: Send + Sync {
    fn format_table(&self, headers: &[&str], rows: &[[String; 3]]) -> String;
}

/// Receiver for engine diagnostics.
pub trait DiagSink: Send + Sync {
    /// Bucket assignments were computed for a compilation attempt.
    fn bucket_report(&self, report: &BucketReport);

    /// A partition finished compiling and was installed under `target`.
    fn partition_compiled(&self, _target: &str) {}
}

static TABLE_FORMATTER: RwLock<Option<Arc<dyn TableFormatter>>> = RwLock::new(None);
static DIAG_SINK: RwLock<Option<Arc<dyn DiagSink>>> = RwLock::new(None);

/// Installs (or clears) the process-wide table formatter.
pub fn set_table_formatter(formatter: Option<Arc<dyn TableFormatter>>) {
    *TABLE_FORMATTER
        .write()
        .expect("table formatter lock poisoned") = formatter;
}

/// Installs (or clears) the process-wide diagnostic sink.
pub fn set_diag_sink(sink: Option<Arc<dyn DiagSink>>) {
    *DIAG_SINK.write().expect("diag sink lock poisoned") = sink;
}

pub(crate) fn emit_bucket_report(report: &BucketReport) {
    let sink = DIAG_SINK.read().expect("diag sink lock poisoned").clone();
    if let Some(sink) = sink {
        sink.bucket_report(report);
    }
}

pub(crate) fn partition_compiled(target: &str) {
    let sink = DIAG_SINK.read().expect("diag sink lock poisoned").clone();
    if let Some(sink) = sink {
        sink.partition_compiled(target);
    }
}

/// Serializable snapshot of one compilation attempt's bucket assignments.
#[derive(Debug, Clone, Serialize)]
pub struct BucketReport {
    pub bucket_bytes_cap: usize,
    pub buckets: Vec<BucketEntry>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BucketEntry {
    pub index: usize,
    pub size_bytes: usize,
    pub param_names: Vec<String>,
}

impl BucketReport {
    pub fn new(bucket_bytes_cap: usize, buckets: &[Bucket]) -> Self {
        let buckets = buckets
            .iter()
            .enumerate()
            .map(|(index, bucket)| BucketEntry {
                index,
                size_bytes: bucket.size_bytes,
                param_names: bucket.param_names.clone(),
            })
            .collect();
        Self {
            bucket_bytes_cap,
            buckets,
        }
    }

    /// Renders the assignment table in forward-execution order through the
    /// installed formatter, or as a plain listing without one. Buckets with
    /// no parameters are elided.
    pub fn render(&self) -> String {
        const HEADERS: [&str; 3] = ["Index", "Size (b)", "Param Names"];

        let mut rows: Vec<[String; 3]> = Vec::new();
        for entry in self.buckets.iter().rev() {
            if entry.param_names.is_empty() {
                continue;
            }
            rows.push([
                entry.index.to_string(),
                entry.size_bytes.to_string(),
                entry.param_names[0].clone(),
            ]);
            for name in &entry.param_names[1..] {
                rows.push([String::new(), String::new(), name.clone()]);
            }
        }

        let formatter = TABLE_FORMATTER
            .read()
            .expect("table formatter lock poisoned")
            .clone();
        if let Some(formatter) = formatter {
            return formatter.format_table(&HEADERS, &rows);
        }

        let mut out = format!(
            "bucket assignments (cap {} bytes):\n{:>6}  {:>10}  {}\n",
            self.bucket_bytes_cap, HEADERS[0], HEADERS[1], HEADERS[2]
        );
        for [index, size, name] in &rows {
            out.push_str(&format!("{index:>6}  {size:>10}  {name}\n"));
        }
        out
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }
}

impl fmt::Display for BucketReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render())
    }
}
