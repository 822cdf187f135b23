use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Instant;

/// JSON-lines timing log. A `<stem>_hot.log` ranking the most expensive spans
/// and largest counters is written when the last handle is dropped.
#[derive(Clone)]
pub struct PerfLogger {
    inner: Arc<Mutex<PerfState>>,
}

impl std::fmt::Debug for PerfLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PerfLogger").finish_non_exhaustive()
    }
}

struct PerfState {
    writer: BufWriter<File>,
    path: PathBuf,
    span_totals: HashMap<String, f64>,
    span_counts: HashMap<String, u64>,
    count_totals: HashMap<String, u64>,
}

impl PerfLogger {
    pub fn new(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::create(&path)?;
        Ok(Self {
            inner: Arc::new(Mutex::new(PerfState {
                writer: BufWriter::new(file),
                path,
                span_totals: HashMap::new(),
                span_counts: HashMap::new(),
                count_totals: HashMap::new(),
            })),
        })
    }

    /// Starts timing `name`; the span is logged when [`PerfSpan::finish`] is called.
    pub fn span(&self, name: &str, document: Option<&str>) -> PerfSpan {
        PerfSpan {
            logger: self.clone(),
            name: name.to_string(),
            document: document.map(str::to_string),
            started: Instant::now(),
        }
    }

    pub fn log_span_ms(&self, name: &str, document: Option<&str>, ms: f64) {
        let line = json!({
            "type": "perf.span",
            "name": name,
            "document": document,
            "unit": "ms",
            "ms": (ms * 1000.0).round() / 1000.0,
        });
        if let Ok(mut state) = self.inner.lock() {
            *state.span_totals.entry(name.to_string()).or_insert(0.0) += ms;
            let entry = state.span_counts.entry(name.to_string()).or_insert(0);
            *entry = entry.saturating_add(1);
            let _ = writeln!(state.writer, "{line}");
        }
    }

    pub fn log_counts(&self, name: &str, document: Option<&str>, counts: &[(&str, u64)]) {
        let counts_obj: Map<String, Value> = counts
            .iter()
            .map(|(key, value)| (key.to_string(), Value::from(*value)))
            .collect();
        let line = json!({
            "type": "perf.counts",
            "name": name,
            "document": document,
            "counts": counts_obj,
        });
        if let Ok(mut state) = self.inner.lock() {
            for (key, value) in counts {
                let entry = state.count_totals.entry(format!("{name}.{key}")).or_insert(0);
                *entry = entry.saturating_add(*value);
            }
            let _ = writeln!(state.writer, "{line}");
        }
    }

    pub fn flush(&self) {
        if let Ok(mut state) = self.inner.lock() {
            let _ = state.writer.flush();
        }
    }
}

#[must_use = "a span is only logged when finished"]
pub struct PerfSpan {
    logger: PerfLogger,
    name: String,
    document: Option<String>,
    started: Instant,
}

impl PerfSpan {
    pub fn finish(self) {
        let ms = self.started.elapsed().as_secs_f64() * 1000.0;
        self.logger
            .log_span_ms(&self.name, self.document.as_deref(), ms);
    }
}

impl Drop for PerfState {
    fn drop(&mut self) {
        let _ = self.writer.flush();
        let Ok(file) = File::create(hot_path_for(&self.path)) else {
            return;
        };
        let mut writer = BufWriter::new(file);

        let mut spans: Vec<(&String, &f64)> = self.span_totals.iter().collect();
        spans.sort_by(|a, b| b.1.partial_cmp(a.1).unwrap_or(std::cmp::Ordering::Equal));
        for (rank, (name, ms)) in spans.into_iter().take(100).enumerate() {
            let count = self.span_counts.get(name).copied().unwrap_or(1).max(1);
            let line = json!({
                "type": "perf.hot.span",
                "rank": rank + 1,
                "name": name,
                "unit": "ms",
                "agg": "sum",
                "ms": (ms * 1000.0).round() / 1000.0,
                "count": count,
                "avg_ms": (ms / count as f64 * 1000.0).round() / 1000.0,
            });
            let _ = writeln!(writer, "{line}");
        }

        let mut counts: Vec<(&String, &u64)> = self.count_totals.iter().collect();
        counts.sort_by(|a, b| b.1.cmp(a.1).then_with(|| a.0.cmp(b.0)));
        for (rank, (name, value)) in counts.into_iter().take(100).enumerate() {
            let line = json!({
                "type": "perf.hot.count",
                "rank": rank + 1,
                "name": name,
                "value": value,
            });
            let _ = writeln!(writer, "{line}");
        }
        let _ = writer.flush();
    }
}

fn hot_path_for(path: &Path) -> PathBuf {
    let file_name = path
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("setlist_overlay_perf.log");
    let stem = file_name
        .rsplit_once('.')
        .map(|(s, _)| s)
        .unwrap_or(file_name);
    path.with_file_name(format!("{stem}_hot.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spans_and_counts_are_json_lines_with_hot_summary() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("export.log");
        {
            let perf = PerfLogger::new(&path).unwrap();
            perf.log_span_ms("export.page", Some("doc-1"), 4.0);
            perf.log_span_ms("export.page", Some("doc-1"), 6.0);
            perf.log_counts("export", None, &[("pages", 3), ("failures", 0)]);
            perf.span("export.batch", None).finish();
        }

        let body = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<Value> = body
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 4);
        assert_eq!(lines[0]["type"], "perf.span");
        assert_eq!(lines[0]["document"], "doc-1");
        assert_eq!(lines[2]["counts"]["pages"], 3);
        assert!(lines[2]["document"].is_null());

        let hot = std::fs::read_to_string(dir.path().join("export_hot.log")).unwrap();
        let first: Value = serde_json::from_str(hot.lines().next().unwrap()).unwrap();
        assert_eq!(first["name"], "export.page");
        assert_eq!(first["count"], 2);
        assert_eq!(first["avg_ms"], 5.0);
    }

    #[test]
    fn hot_path_replaces_extension() {
        assert_eq!(
            hot_path_for(Path::new("/tmp/run.jsonl")),
            PathBuf::from("/tmp/run_hot.log")
        );
        assert_eq!(hot_path_for(Path::new("perf")), PathBuf::from("perf_hot.log"));
    }
}
