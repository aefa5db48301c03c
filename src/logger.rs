use chrono::Utc;
use serde_json::{Map, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use tracing_subscriber::EnvFilter;

/// Diagnostic log filter from `RUST_LOG`-style directives, `info` when unset or invalid
pub fn diagnostic_filter(directives: Option<&str>) -> EnvFilter {
    directives
        .filter(|d| !d.trim().is_empty())
        .and_then(|d| EnvFilter::try_new(d).ok())
        .unwrap_or_else(|| EnvFilter::new("info"))
}

/// Default size ceiling before the audit file is trimmed
pub const DEFAULT_MAX_BYTES: u64 = 1024 * 1024;

/// Append-only audit trail of rotation and routing decisions
///
/// Every event goes to two sinks: a `tracing` event under the `audit` target and one
/// JSON line in the audit file. Writes never fail outward; a broken file only produces
/// a warning on the diagnostic stream.
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    max_bytes: u64,
    file_lock: Mutex<()>,
}

impl AuditLog {
    pub fn new(path: impl Into<PathBuf>, max_bytes: u64) -> Self {
        Self {
            path: path.into(),
            max_bytes,
            file_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Record one event
    ///
    /// `fields` must be a JSON object; it must only carry derived key ids, never tokens.
    pub async fn record(&self, event: &str, fields: Value) {
        info!(target: "audit", event = event, fields = %fields, "audit");

        let line = match render_line(event, fields) {
            Ok(line) => line,
            Err(e) => {
                warn!(event = event, "Failed to serialize audit record: {}", e);
                return;
            }
        };

        let _guard = self.file_lock.lock().await;
        if let Err(e) = self.rotate_if_needed().await {
            warn!(path = %self.path.display(), "Audit log rotation failed: {}", e);
        }
        if let Err(e) = self.append(&line).await {
            warn!(path = %self.path.display(), "Audit log write failed: {}", e);
        }
    }

    async fn append(&self, line: &str) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(line.as_bytes()).await?;
        file.flush().await
    }

    async fn rotate_if_needed(&self) -> std::io::Result<()> {
        let size = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e),
        };
        if size <= self.max_bytes {
            return Ok(());
        }

        let content = tokio::fs::read_to_string(&self.path).await?;
        let kept = retain_newest_half(&content);
        tokio::fs::write(&self.path, kept).await?;

        debug!(
            path = %self.path.display(),
            previous_bytes = size,
            "Audit log trimmed"
        );
        Ok(())
    }
}

pub type SharedAuditLog = Arc<AuditLog>;

fn render_line(event: &str, fields: Value) -> serde_json::Result<String> {
    let mut record = Map::new();
    record.insert("timestamp".into(), Value::String(Utc::now().to_rfc3339()));
    record.insert("event".into(), Value::String(event.to_string()));
    match fields {
        Value::Object(map) => record.extend(map),
        Value::Null => {}
        other => {
            record.insert("detail".into(), other);
        }
    }

    let mut line = serde_json::to_string(&Value::Object(record))?;
    line.push('\n');
    Ok(line)
}

/// Keep the newest `ceil(n / 2)` of the `n` lines in `content`
pub fn retain_newest_half(content: &str) -> String {
    let lines: Vec<&str> = content.lines().filter(|l| !l.is_empty()).collect();
    let keep = (lines.len() + 1) / 2;

    let mut out = lines[lines.len() - keep..].join("\n");
    if !out.is_empty() {
        out.push('\n');
    }
    out
}
