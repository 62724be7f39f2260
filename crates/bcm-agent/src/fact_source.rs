//! Reads the hardware facts published by the BCM daemon.
//!
//! The daemon owns the document format. It is read tolerantly: unknown
//! keys are ignored and every hardware field is optional. A source that
//! cannot be reached or parsed reports [`FactReading::Unavailable`] and the
//! caller simply tries again on its next tick.

use core::error::Error;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use derive_more::Display;
use error_stack::Report;
use error_stack::ResultExt;
use serde::Deserialize;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::net::UnixStream;
use tracing::debug;

use crate::domain::HardwareSnapshot;
use crate::domain::HealthStatus;

/// Default location of the document written by the BCM daemon.
pub const DEFAULT_FACT_FILE: &str = "/etc/bcm-agent/config.json";

const MAX_DOCUMENT_BYTES: u64 = 1024 * 1024;
const SOCKET_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while fetching or decoding the fact document.
#[derive(Debug, Display)]
pub enum FactSourceError {
    #[display("Failed to read fact source {path}")]
    Io { path: String },

    #[display("Timed out reading fact source {path}")]
    Timeout { path: String },

    #[display("Malformed fact document: {message}")]
    Malformed { message: String },
}

impl Error for FactSourceError {}

/// Outcome of a single poll of the fact source.
#[derive(Debug)]
pub enum FactReading {
    Available(HardwareSnapshot),
    Unavailable(Report<FactSourceError>),
}

impl FactReading {
    pub fn is_available(&self) -> bool {
        matches!(self, FactReading::Available(_))
    }
}

/// Anything that can produce the latest hardware snapshot on demand.
#[async_trait]
pub trait FactSource: Send + Sync {
    /// Polls the source once. Never retries.
    async fn read(&self) -> FactReading;

    /// Human readable location, used in logs.
    fn describe(&self) -> String;
}

/// Reads the fact document from a regular file.
pub struct FileFactSource {
    path: PathBuf,
    node_name: String,
}

impl FileFactSource {
    pub fn new(path: impl Into<PathBuf>, node_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            node_name: node_name.into(),
        }
    }

    async fn fetch(&self) -> Result<HardwareSnapshot, Report<FactSourceError>> {
        let path = self.path.display().to_string();
        let file = tokio::fs::File::open(&self.path)
            .await
            .change_context(FactSourceError::Io { path: path.clone() })?;
        let content = read_capped(file)
            .await
            .change_context(FactSourceError::Io { path })?;
        parse_document(&content, &self.node_name, Utc::now())
    }
}

#[async_trait]
impl FactSource for FileFactSource {
    async fn read(&self) -> FactReading {
        match self.fetch().await {
            Ok(snapshot) => FactReading::Available(snapshot),
            Err(e) => FactReading::Unavailable(e),
        }
    }

    fn describe(&self) -> String {
        format!("file {}", self.path.display())
    }
}

/// Reads the fact document from a local Unix socket.
///
/// The daemon is expected to write one document and close the connection.
pub struct SocketFactSource {
    path: PathBuf,
    node_name: String,
    timeout: Duration,
}

impl SocketFactSource {
    pub fn new(path: impl Into<PathBuf>, node_name: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            node_name: node_name.into(),
            timeout: SOCKET_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn fetch(&self) -> Result<HardwareSnapshot, Report<FactSourceError>> {
        let path = self.path.display().to_string();
        let content = tokio::time::timeout(self.timeout, async {
            let stream = UnixStream::connect(&self.path).await?;
            read_capped(stream).await
        })
        .await
        .change_context(FactSourceError::Timeout { path: path.clone() })?
        .change_context(FactSourceError::Io { path })?;

        parse_document(&content, &self.node_name, Utc::now())
    }
}

#[async_trait]
impl FactSource for SocketFactSource {
    async fn read(&self) -> FactReading {
        match self.fetch().await {
            Ok(snapshot) => FactReading::Available(snapshot),
            Err(e) => FactReading::Unavailable(e),
        }
    }

    fn describe(&self) -> String {
        format!("socket {}", self.path.display())
    }
}

/// Reads `reader` to the end, refusing documents over [`MAX_DOCUMENT_BYTES`].
async fn read_capped(reader: impl AsyncRead + Unpin) -> std::io::Result<Vec<u8>> {
    let mut content = Vec::new();
    reader
        .take(MAX_DOCUMENT_BYTES + 1)
        .read_to_end(&mut content)
        .await?;
    if content.len() as u64 > MAX_DOCUMENT_BYTES {
        return Err(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("document is larger than {MAX_DOCUMENT_BYTES} bytes"),
        ));
    }
    Ok(content)
}

#[derive(Debug, Default, Deserialize)]
struct FactDocument {
    #[serde(alias = "nodeName")]
    node_name: Option<String>,
    host: Option<String>,
    #[serde(alias = "gpuCount")]
    gpu_count: Option<u32>,
    #[serde(alias = "cpuModel")]
    cpu_model: Option<String>,
    #[serde(alias = "cpuCount")]
    cpu_count: Option<u32>,
    #[serde(alias = "memoryGB", alias = "memoryGb")]
    memory_gb: Option<u64>,
    #[serde(alias = "healthStatus", alias = "health")]
    health_status: Option<String>,
    #[serde(default)]
    components: BTreeMap<String, String>,
    timestamp: Option<f64>,
}

/// Decodes a fact document into a snapshot.
///
/// `node_name` is used when the document does not name the node and `now`
/// when it carries no timestamp.
pub fn parse_document(
    content: &[u8],
    node_name: &str,
    now: DateTime<Utc>,
) -> Result<HardwareSnapshot, Report<FactSourceError>> {
    let document: FactDocument =
        serde_json::from_slice(content).change_context(FactSourceError::Malformed {
            message: "document is not a valid fact object".to_string(),
        })?;

    let last_updated = match document.timestamp {
        Some(ts) => timestamp_from_secs(ts).ok_or_else(|| {
            Report::new(FactSourceError::Malformed {
                message: format!("invalid timestamp {ts}"),
            })
        })?,
        None => now,
    };

    let mut snapshot = HardwareSnapshot::new(
        non_empty(document.node_name).unwrap_or_else(|| node_name.to_string()),
        last_updated,
    );
    snapshot.bcm_cluster = non_empty(document.host);
    snapshot.gpu_count = document.gpu_count;
    snapshot.cpu_model = non_empty(document.cpu_model);
    snapshot.cpu_count = document.cpu_count;
    snapshot.memory_gb = document.memory_gb;
    snapshot.health = document
        .health_status
        .as_deref()
        .map(HealthStatus::parse)
        .unwrap_or_default();
    snapshot.components = document
        .components
        .iter()
        .filter(|(name, _)| !name.trim().is_empty())
        .map(|(name, status)| (name.clone(), HealthStatus::parse(status)))
        .collect();

    debug!(node = %snapshot.node_name, "Parsed fact document");
    Ok(snapshot)
}

fn timestamp_from_secs(ts: f64) -> Option<DateTime<Utc>> {
    if !ts.is_finite() || ts < 0.0 {
        return None;
    }
    let secs = ts.trunc() as i64;
    let nanos = (ts.fract() * 1e9) as u32;
    DateTime::from_timestamp(secs, nanos)
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use chrono::TimeZone;
    use tempfile::NamedTempFile;
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    use super::*;

    fn fixed_now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 3, 1, 12, 0, 0).unwrap()
    }

    #[test]
    fn parses_full_document() {
        let doc = br#"{
            "node_name": "gpu-node-01",
            "host": "bcm-head-01",
            "gpu_count": 8,
            "cpu_model": "AMD-EPYC-7763",
            "cpu_count": 128,
            "memory_gb": 512,
            "health_status": "healthy",
            "components": {"gpu": "healthy", "psu": "warning"},
            "timestamp": 1740830400.5
        }"#;

        let snapshot = parse_document(doc, "fallback", fixed_now()).unwrap();

        assert_eq!(snapshot.node_name, "gpu-node-01");
        assert_eq!(snapshot.bcm_cluster.as_deref(), Some("bcm-head-01"));
        assert_eq!(snapshot.gpu_count, Some(8));
        assert_eq!(snapshot.cpu_model.as_deref(), Some("AMD-EPYC-7763"));
        assert_eq!(snapshot.cpu_count, Some(128));
        assert_eq!(snapshot.memory_gb, Some(512));
        assert_eq!(snapshot.health, HealthStatus::Healthy);
        assert_eq!(snapshot.components.get("psu"), Some(&HealthStatus::Degraded));
        assert_eq!(snapshot.last_updated.timestamp(), 1740830400);
    }

    #[test]
    fn accepts_camel_case_keys() {
        let doc = br#"{"gpuCount": 4, "cpuModel": "Xeon", "memoryGB": 256, "healthStatus": "DEGRADED"}"#;

        let snapshot = parse_document(doc, "node-a", fixed_now()).unwrap();

        assert_eq!(snapshot.gpu_count, Some(4));
        assert_eq!(snapshot.cpu_model.as_deref(), Some("Xeon"));
        assert_eq!(snapshot.memory_gb, Some(256));
        assert_eq!(snapshot.health, HealthStatus::Degraded);
    }

    #[test]
    fn missing_fields_fall_back() {
        let doc = br#"{"node_name": "", "cpu_model": "  ", "unrelated": [1, 2, 3]}"#;

        let snapshot = parse_document(doc, "node-a", fixed_now()).unwrap();

        assert_eq!(snapshot.node_name, "node-a");
        assert_eq!(snapshot.cpu_model, None);
        assert_eq!(snapshot.gpu_count, None);
        assert_eq!(snapshot.health, HealthStatus::Unknown);
        assert_eq!(snapshot.last_updated, fixed_now());
    }

    #[test]
    fn rejects_non_object_documents() {
        assert!(parse_document(b"[1, 2]", "node-a", fixed_now()).is_err());
        assert!(parse_document(b"not json", "node-a", fixed_now()).is_err());
        assert!(parse_document(b"", "node-a", fixed_now()).is_err());
    }

    #[test]
    fn rejects_wrongly_typed_fields() {
        let result = parse_document(br#"{"gpu_count": "eight"}"#, "node-a", fixed_now());
        assert!(result.is_err(), "string gpu count should be malformed");
    }

    #[test]
    fn rejects_negative_timestamp() {
        let result = parse_document(br#"{"timestamp": -5}"#, "node-a", fixed_now());
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn file_source_reads_document() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"gpu_count": 2}"#).unwrap();

        let source = FileFactSource::new(file.path(), "node-a");
        match source.read().await {
            FactReading::Available(snapshot) => {
                assert_eq!(snapshot.gpu_count, Some(2));
                assert_eq!(snapshot.node_name, "node-a");
            }
            FactReading::Unavailable(e) => panic!("expected snapshot, got {e:?}"),
        }
    }

    #[tokio::test]
    async fn oversized_file_is_unavailable() {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(br#"{"gpu_count": 2}"#).unwrap();
        file.write_all(&vec![b' '; MAX_DOCUMENT_BYTES as usize]).unwrap();

        let source = FileFactSource::new(file.path(), "node-a");

        assert!(!source.read().await.is_available());
    }

    #[tokio::test]
    async fn file_source_missing_file_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = FileFactSource::new(dir.path().join("absent.json"), "node-a");

        assert!(!source.read().await.is_available());
    }

    #[tokio::test]
    async fn socket_source_reads_document() {
        let dir = tempfile::tempdir().unwrap();
        let socket_path = dir.path().join("facts.sock");
        let listener = UnixListener::bind(&socket_path).unwrap();

        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream
                .write_all(br#"{"cpu_count": 64, "health_status": "ok"}"#)
                .await
                .unwrap();
            stream.shutdown().await.unwrap();
        });

        let source = SocketFactSource::new(&socket_path, "node-a");
        match source.read().await {
            FactReading::Available(snapshot) => {
                assert_eq!(snapshot.cpu_count, Some(64));
                assert_eq!(snapshot.health, HealthStatus::Healthy);
            }
            FactReading::Unavailable(e) => panic!("expected snapshot, got {e:?}"),
        }
        server.await.unwrap();
    }

    #[tokio::test]
    async fn socket_source_without_listener_is_unavailable() {
        let dir = tempfile::tempdir().unwrap();
        let source = SocketFactSource::new(dir.path().join("missing.sock"), "node-a")
            .with_timeout(Duration::from_millis(200));

        assert!(!source.read().await.is_available());
    }
}
