//! Statistics emission (SPEC_FULL §4.6): a plain `struct` of the
//! counters/gauges tabled per daemon in §4.2/§4.3/§4.4, a derived
//! `Serialize` for the JSON sibling, and a hand-written Prometheus
//! text-exposition writer - both written through the same
//! temp-file-then-`rename` atomic pattern used for `requestlists/` entries
//! so a concurrent reader (e.g. a node-exporter textfile collector) never
//! observes a half-written file.

use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

fn now_unix() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Writes `contents` into `<dir>/<name>.tmp.XXXXXX` then renames it onto
/// `<dir>/<name>`, so readers only ever see complete files.
async fn atomic_write(dir: &Path, name: &str, contents: &[u8]) -> io::Result<()> {
    tokio::fs::create_dir_all(dir).await?;
    let final_path = dir.join(name);
    let tmp = tempfile::Builder::new()
        .prefix(&format!("{name}.tmp."))
        .tempfile_in(dir)?;
    tokio::fs::write(tmp.path(), contents).await?;
    let (_, tmp_path) = tmp.keep()?;
    tokio::fs::rename(&tmp_path, &final_path).await?;
    Ok(())
}

/// Prometheus metric type (SPEC_FULL §4.2/§4.3/§4.4 tables distinguish
/// monotonic counters from point-in-time gauges; getting this wrong breaks
/// a consumer's `rate()`/counter-reset handling).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum MetricKind {
    Counter,
    Gauge,
}

impl MetricKind {
    fn as_str(self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

/// Renders `fields` (name, help text, kind, value) as Prometheus text
/// exposition format, with `hsm="<short-desc>"` on every metric line
/// (SPEC_FULL §6).
fn render_prometheus(component: &str, hsm: &str, fields: &[(&str, &str, MetricKind, f64)]) -> String {
    let mut out = String::new();
    for (name, help, kind, value) in fields {
        let metric = format!("endit_{component}_{name}");
        out.push_str(&format!("# HELP {metric} {help}\n"));
        out.push_str(&format!("# TYPE {metric} {}\n", kind.as_str()));
        out.push_str(&format!("{metric}{{hsm=\"{hsm}\"}} {value}\n"));
    }
    out
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct ArchiverStats {
    pub flushed_bytes: u64,
    pub flushed_files: u64,
    pub flush_retries: u64,
    pub usage_bytes: u64,
    pub usage_files: u64,
    pub working_bytes: u64,
    pub working_files: u64,
    pub pending_bytes: u64,
    pub pending_files: u64,
    pub busyworkers: u32,
    pub maxworkers: u32,
    pub time: u64,
}

impl ArchiverStats {
    pub fn stamp(&mut self) {
        self.time = now_unix();
    }

    fn prometheus(&self, hsm: &str) -> String {
        use MetricKind::{Counter, Gauge};
        render_prometheus(
            "archiver",
            hsm,
            &[
                ("flushed_bytes", "Bytes successfully flushed to tape", Counter, self.flushed_bytes as f64),
                ("flushed_files", "Files successfully flushed to tape", Counter, self.flushed_files as f64),
                ("flush_retries", "Files that needed a retry to flush", Counter, self.flush_retries as f64),
                ("usage_bytes", "Total bytes pending and in flight", Gauge, self.usage_bytes as f64),
                ("usage_files", "Total files pending and in flight", Gauge, self.usage_files as f64),
                ("working_bytes", "Bytes owned by a running worker", Gauge, self.working_bytes as f64),
                ("working_files", "Files owned by a running worker", Gauge, self.working_files as f64),
                ("pending_bytes", "Bytes not yet claimed by a worker", Gauge, self.pending_bytes as f64),
                ("pending_files", "Files not yet claimed by a worker", Gauge, self.pending_files as f64),
                ("busyworkers", "Archive workers currently running", Gauge, self.busyworkers as f64),
                ("maxworkers", "Archive workers last triggered", Gauge, self.maxworkers as f64),
                ("time", "Unix timestamp of this sample", Gauge, self.time as f64),
            ],
        )
    }

    pub async fn emit(&self, statsdir: &Path, hsm: &str) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        atomic_write(statsdir, &format!("{hsm}-archiver-stats.json"), &json).await?;
        let prom = self.prometheus(hsm);
        atomic_write(statsdir, &format!("{hsm}-archiver-stats.prom"), prom.as_bytes()).await
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct RetrieverStats {
    pub hintfile_mtime: u64,
    pub hintfile_entries: u64,
    pub staged_bytes: u64,
    pub staged_files: u64,
    pub stage_retries: u64,
    pub working_bytes: u64,
    pub working_files: u64,
    pub requests_bytes: u64,
    pub requests_files: u64,
    pub in_avail_bytes: u64,
    pub busyworkers: u32,
    pub maxworkers: u32,
    pub time: u64,
}

impl RetrieverStats {
    pub fn stamp(&mut self) {
        self.time = now_unix();
    }

    fn prometheus(&self, hsm: &str) -> String {
        use MetricKind::{Counter, Gauge};
        render_prometheus(
            "retriever",
            hsm,
            &[
                ("hintfile_mtime", "Last loaded tape-hint file mtime", Gauge, self.hintfile_mtime as f64),
                ("hintfile_entries", "Entries in the loaded tape-hint file", Gauge, self.hintfile_entries as f64),
                ("staged_bytes", "Bytes successfully retrieved from tape", Counter, self.staged_bytes as f64),
                ("staged_files", "Files successfully retrieved from tape", Counter, self.staged_files as f64),
                ("stage_retries", "Retrieve attempts that needed a retry", Counter, self.stage_retries as f64),
                ("working_bytes", "Bytes owned by a running worker", Gauge, self.working_bytes as f64),
                ("working_files", "Files owned by a running worker", Gauge, self.working_files as f64),
                ("requests_bytes", "Bytes of outstanding retrieval requests", Gauge, self.requests_bytes as f64),
                ("requests_files", "Outstanding retrieval requests", Gauge, self.requests_files as f64),
                ("in_avail_bytes", "Free space on the in/ filesystem", Gauge, self.in_avail_bytes as f64),
                ("busyworkers", "Retrieve workers currently running", Gauge, self.busyworkers as f64),
                ("maxworkers", "Configured maximum retrieve workers", Gauge, self.maxworkers as f64),
                ("time", "Unix timestamp of this sample", Gauge, self.time as f64),
            ],
        )
    }

    pub async fn emit(&self, statsdir: &Path, hsm: &str) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        atomic_write(statsdir, &format!("{hsm}-retriever-stats.json"), &json).await?;
        let prom = self.prometheus(hsm);
        atomic_write(statsdir, &format!("{hsm}-retriever-stats.prom"), prom.as_bytes()).await
    }
}

#[derive(Clone, Debug, Default, Serialize)]
pub struct DeleterStats {
    pub queued_files: u64,
    pub deleted_files: u64,
    pub delete_retries: u64,
    pub batches_pending: u64,
    pub time: u64,
}

impl DeleterStats {
    pub fn stamp(&mut self) {
        self.time = now_unix();
    }

    fn prometheus(&self, hsm: &str) -> String {
        use MetricKind::{Counter, Gauge};
        render_prometheus(
            "deleter",
            hsm,
            &[
                ("queued_files", "Files enqueued for tape deletion", Counter, self.queued_files as f64),
                ("deleted_files", "Files successfully deleted from tape", Counter, self.deleted_files as f64),
                ("delete_retries", "Files re-queued after a failed batch", Counter, self.delete_retries as f64),
                ("batches_pending", "Batch files currently in trash/queue", Gauge, self.batches_pending as f64),
                ("time", "Unix timestamp of this sample", Gauge, self.time as f64),
            ],
        )
    }

    pub async fn emit(&self, statsdir: &Path, hsm: &str) -> io::Result<()> {
        let json = serde_json::to_vec_pretty(self)?;
        atomic_write(statsdir, &format!("{hsm}-deleter-stats.json"), &json).await?;
        let prom = self.prometheus(hsm);
        atomic_write(statsdir, &format!("{hsm}-deleter-stats.prom"), prom.as_bytes()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn emits_json_and_prom_atomically() {
        let tmp = tempfile::tempdir().unwrap();
        let mut stats = ArchiverStats { flushed_bytes: 10, flushed_files: 1, ..Default::default() };
        stats.stamp();
        stats.emit(tmp.path(), "endit").await.unwrap();

        let json_path = tmp.path().join("endit-archiver-stats.json");
        let prom_path = tmp.path().join("endit-archiver-stats.prom");
        assert!(json_path.exists());
        assert!(prom_path.exists());

        let parsed: ArchiverStats =
            serde_json::from_slice(&std::fs::read(&json_path).unwrap()).unwrap();
        assert_eq!(parsed.flushed_bytes, 10);

        let prom = std::fs::read_to_string(&prom_path).unwrap();
        assert!(prom.contains(r#"hsm="endit""#));
        assert!(prom.contains("endit_archiver_flushed_bytes"));
        assert!(prom.contains("# TYPE endit_archiver_flushed_bytes counter"));
        assert!(prom.contains("# TYPE endit_archiver_usage_bytes gauge"));
    }

    #[tokio::test]
    async fn rewrite_produces_byte_identical_json_for_same_data() {
        let tmp = tempfile::tempdir().unwrap();
        let stats = RetrieverStats { staged_bytes: 42, time: 100, ..Default::default() };
        stats.emit(tmp.path(), "endit").await.unwrap();
        let first = std::fs::read(tmp.path().join("endit-retriever-stats.json")).unwrap();
        stats.emit(tmp.path(), "endit").await.unwrap();
        let second = std::fs::read(tmp.path().join("endit-retriever-stats.json")).unwrap();
        assert_eq!(first, second);
    }
}
