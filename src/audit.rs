//! Write-only audit contract between the monitor and its record keepers
//!
//! The scheduler reports every probe, remediation attempt and lifecycle
//! transition through `AuditSink`. Sinks shipped here render the log lines
//! downstream parsers consume, append structured JSON records, and keep the
//! latest per-target snapshot for the status endpoint.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::{
    fs::{File, OpenOptions},
    io::AsyncWriteExt,
    sync::Mutex,
};
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum AuditError {
    #[error("failed to open audit file {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to write audit record: {0}")]
    Write(#[from] std::io::Error),
    #[error("failed to encode audit record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("status board lock poisoned")]
    Poisoned,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct StatusRecord {
    pub timestamp: DateTime<Utc>,
    pub target_name: String,
    pub service: String,
    pub status: String,
    pub is_active: bool,
    pub host: String,
    pub method: String,
    pub metadata: Map<String, Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RemediationRecord {
    pub timestamp: DateTime<Utc>,
    pub target_name: String,
    pub service: String,
    pub action: String,
    pub success: bool,
    pub host: String,
    pub method: String,
    pub metadata: Map<String, Value>,
    pub error_detail: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEvent {
    Start,
    Stop,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct LifecycleRecord {
    pub timestamp: DateTime<Utc>,
    pub event: LifecycleEvent,
    pub detail: Value,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AuditRecord {
    Status(StatusRecord),
    Remediation(RemediationRecord),
    Lifecycle(LifecycleRecord),
}

#[async_trait]
pub trait AuditSink: Send + Sync {
    async fn record_status(&self, record: &StatusRecord) -> Result<(), AuditError>;
    async fn record_remediation(&self, record: &RemediationRecord) -> Result<(), AuditError>;
    async fn record_lifecycle(&self, record: &LifecycleRecord) -> Result<(), AuditError>;

    async fn flush(&self) -> Result<(), AuditError> {
        Ok(())
    }
}

/// Renders records as the plain log lines parsed downstream:
/// `[<target>] status=<token> active=<bool>` and
/// `[<target>] <action> executed successfully|failed: <detail>`.
#[derive(Debug, Default)]
pub struct LogLineSink;

impl LogLineSink {
    pub fn new() -> Self {
        Self
    }
}

pub fn status_line(record: &StatusRecord) -> String {
    format!(
        "[{}] status={} active={}",
        record.target_name, record.status, record.is_active
    )
}

pub fn remediation_line(record: &RemediationRecord) -> String {
    if record.success {
        format!("[{}] {} executed successfully", record.target_name, record.action)
    } else {
        format!(
            "[{}] {} failed: {}",
            record.target_name,
            record.action,
            record.error_detail.as_deref().unwrap_or("unknown error")
        )
    }
}

#[async_trait]
impl AuditSink for LogLineSink {
    async fn record_status(&self, record: &StatusRecord) -> Result<(), AuditError> {
        let line = status_line(record);
        match (&record.error, record.is_active) {
            (Some(err), _) => {
                error!("{line}");
                error!("[{}] {err}", record.target_name);
            }
            (None, true) => info!("{line}"),
            (None, false) => warn!("{line}"),
        }
        Ok(())
    }

    async fn record_remediation(&self, record: &RemediationRecord) -> Result<(), AuditError> {
        let line = remediation_line(record);
        if record.success {
            info!("{line}");
        } else {
            error!("{line}");
        }
        Ok(())
    }

    async fn record_lifecycle(&self, record: &LifecycleRecord) -> Result<(), AuditError> {
        match record.event {
            LifecycleEvent::Start => info!("Starting monitor: {}", record.detail),
            LifecycleEvent::Stop => info!("Monitor stopping: {}", record.detail),
        }
        Ok(())
    }
}

/// Appends one JSON document per record to a file.
pub struct JsonLinesSink {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesSink {
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|parent| !parent.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|source| AuditError::Open {
                    path: path.clone(),
                    source,
                })?;
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|source| AuditError::Open {
                path: path.clone(),
                source,
            })?;

        Ok(Self {
            path,
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    async fn append(&self, record: AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(&record)?;
        line.push(b'\n');
        let mut file = self.file.lock().await;
        file.write_all(&line).await?;
        Ok(())
    }
}

#[async_trait]
impl AuditSink for JsonLinesSink {
    async fn record_status(&self, record: &StatusRecord) -> Result<(), AuditError> {
        self.append(AuditRecord::Status(record.clone())).await
    }

    async fn record_remediation(&self, record: &RemediationRecord) -> Result<(), AuditError> {
        self.append(AuditRecord::Remediation(record.clone())).await
    }

    async fn record_lifecycle(&self, record: &LifecycleRecord) -> Result<(), AuditError> {
        self.append(AuditRecord::Lifecycle(record.clone())).await
    }

    async fn flush(&self) -> Result<(), AuditError> {
        let mut file = self.file.lock().await;
        file.flush().await?;
        file.sync_data().await?;
        Ok(())
    }
}

/// Forwards every record to each inner sink; one failing sink does not stop
/// delivery to the others.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn AuditSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: Arc<dyn AuditSink>) -> Self {
        self.sinks.push(sink);
        self
    }

    fn settle(results: Vec<Result<(), AuditError>>) -> Result<(), AuditError> {
        results.into_iter().fold(Ok(()), |acc, result| match result {
            Ok(()) => acc,
            Err(err) => Err(err),
        })
    }
}

#[async_trait]
impl AuditSink for FanoutSink {
    async fn record_status(&self, record: &StatusRecord) -> Result<(), AuditError> {
        let mut results = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            results.push(sink.record_status(record).await);
        }
        Self::settle(results)
    }

    async fn record_remediation(&self, record: &RemediationRecord) -> Result<(), AuditError> {
        let mut results = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            results.push(sink.record_remediation(record).await);
        }
        Self::settle(results)
    }

    async fn record_lifecycle(&self, record: &LifecycleRecord) -> Result<(), AuditError> {
        let mut results = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            results.push(sink.record_lifecycle(record).await);
        }
        Self::settle(results)
    }

    async fn flush(&self) -> Result<(), AuditError> {
        let mut results = Vec::with_capacity(self.sinks.len());
        for sink in &self.sinks {
            results.push(sink.flush().await);
        }
        Self::settle(results)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct TargetSnapshot {
    pub target_name: String,
    pub service: String,
    pub host: String,
    pub method: String,
    pub status: String,
    pub is_active: bool,
    pub error: Option<String>,
    pub checked_at: DateTime<Utc>,
    pub last_remediation: Option<RemediationSnapshot>,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct RemediationSnapshot {
    pub action: String,
    pub success: bool,
    pub error_detail: Option<String>,
    pub attempted_at: DateTime<Utc>,
}

/// Latest observation per target, read by the status endpoint.
#[derive(Debug, Default)]
pub struct StatusBoard {
    targets: RwLock<BTreeMap<String, TargetSnapshot>>,
}

impl StatusBoard {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Result<Vec<TargetSnapshot>, AuditError> {
        let targets = self.targets.read().map_err(|_| AuditError::Poisoned)?;
        Ok(targets.values().cloned().collect())
    }

    pub fn get(&self, target_name: &str) -> Result<Option<TargetSnapshot>, AuditError> {
        let targets = self.targets.read().map_err(|_| AuditError::Poisoned)?;
        Ok(targets.get(target_name).cloned())
    }
}

#[async_trait]
impl AuditSink for StatusBoard {
    async fn record_status(&self, record: &StatusRecord) -> Result<(), AuditError> {
        let mut targets = self.targets.write().map_err(|_| AuditError::Poisoned)?;
        let last_remediation = targets
            .get(&record.target_name)
            .and_then(|snapshot| snapshot.last_remediation.clone());
        targets.insert(
            record.target_name.clone(),
            TargetSnapshot {
                target_name: record.target_name.clone(),
                service: record.service.clone(),
                host: record.host.clone(),
                method: record.method.clone(),
                status: record.status.clone(),
                is_active: record.is_active,
                error: record.error.clone(),
                checked_at: record.timestamp,
                last_remediation,
            },
        );
        Ok(())
    }

    async fn record_remediation(&self, record: &RemediationRecord) -> Result<(), AuditError> {
        let mut targets = self.targets.write().map_err(|_| AuditError::Poisoned)?;
        if let Some(snapshot) = targets.get_mut(&record.target_name) {
            snapshot.last_remediation = Some(RemediationSnapshot {
                action: record.action.clone(),
                success: record.success,
                error_detail: record.error_detail.clone(),
                attempted_at: record.timestamp,
            });
        }
        Ok(())
    }

    async fn record_lifecycle(&self, _record: &LifecycleRecord) -> Result<(), AuditError> {
        Ok(())
    }
}


#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::testing::{remediation, status, RecordingSink};
    use super::*;

    #[test]
    fn status_line_keeps_parser_tokens() {
        assert_eq!(
            status_line(&status("nginx", "inactive", false)),
            "[nginx] status=inactive active=false"
        );
        assert_eq!(
            status_line(&status("web", "active", true)),
            "[web] status=active active=true"
        );
    }

    #[test]
    fn remediation_lines_match_expected_shape() {
        assert_eq!(
            remediation_line(&remediation("nginx", true, None)),
            "[nginx] restart executed successfully"
        );
        assert_eq!(
            remediation_line(&remediation("nginx", false, Some("rc=1 Access denied"))),
            "[nginx] restart failed: rc=1 Access denied"
        );
    }

    #[tokio::test]
    async fn json_lines_sink_appends_tagged_records() {
        let dir = tempfile::tempdir().expect("temp dir");
        let path = dir.path().join("audit").join("records.jsonl");
        let sink = JsonLinesSink::open(&path).await.expect("open sink");

        sink.record_status(&status("nginx", "active", true))
            .await
            .expect("status write");
        sink.record_lifecycle(&LifecycleRecord {
            timestamp: Utc::now(),
            event: LifecycleEvent::Stop,
            detail: json!({ "reason": "shutdown_signal" }),
        })
        .await
        .expect("lifecycle write");
        sink.flush().await.expect("flush");

        let contents = std::fs::read_to_string(sink.path()).expect("read audit file");
        let lines: Vec<serde_json::Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).expect("valid json line"))
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["kind"], "status");
        assert_eq!(lines[0]["target_name"], "nginx");
        assert_eq!(lines[0]["is_active"], true);
        assert_eq!(lines[1]["kind"], "lifecycle");
        assert_eq!(lines[1]["event"], "stop");
        assert_eq!(lines[1]["detail"]["reason"], "shutdown_signal");
    }

    #[tokio::test]
    async fn fanout_delivers_to_every_sink() {
        let first = Arc::new(RecordingSink::default());
        let second = Arc::new(RecordingSink::default());
        let fanout = FanoutSink::new().with(first.clone()).with(second.clone());

        fanout
            .record_remediation(&remediation("nginx", true, None))
            .await
            .expect("fanout write");

        assert_eq!(first.remediations().len(), 1);
        assert_eq!(second.remediations().len(), 1);
    }

    #[tokio::test]
    async fn status_board_keeps_latest_snapshot_and_remediation() {
        let board = StatusBoard::new();
        board
            .record_status(&status("nginx", "inactive", false))
            .await
            .expect("status");
        board
            .record_remediation(&remediation("nginx", true, None))
            .await
            .expect("remediation");
        board
            .record_status(&status("nginx", "active", true))
            .await
            .expect("status");

        let snapshot = board.get("nginx").expect("board read").expect("present");
        assert!(snapshot.is_active);
        assert_eq!(snapshot.status, "active");
        assert!(snapshot.last_remediation.expect("kept").success);
        assert!(board.get("missing").expect("board read").is_none());
    }
}
