// Storage module - persists gathered metric snapshots
//
// This module is responsible for:
// 1. Encoding gathered metric families in the Prometheus text format
// 2. Writing them to a textfile (atomically) or to stdout
// 3. Handling write errors gracefully so the scheduler keeps running

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use prometheus::proto::MetricFamily;
use prometheus::{Encoder, TextEncoder};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tracing::{debug, error, info};

/// Errors that can occur during snapshot storage
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Failed to encode metric snapshot: {0}")]
    EncodeError(#[from] prometheus::Error),

    #[error("Failed to write metric snapshot to {target}: {source}")]
    WriteError {
        target: String,
        source: std::io::Error,
    },
}

/// Metric families gathered in one collection cycle
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// When the registry was gathered
    pub scraped_at: DateTime<Utc>,

    pub families: Vec<MetricFamily>,
}

impl Snapshot {
    pub fn new(families: Vec<MetricFamily>) -> Self {
        Snapshot {
            scraped_at: Utc::now(),
            families,
        }
    }

    /// Total number of samples across all families
    pub fn sample_count(&self) -> usize {
        self.families
            .iter()
            .map(|family| family.get_metric().len())
            .sum()
    }

    /// Encodes the snapshot in the text exposition format
    ///
    /// The first line is a `# Scraped at <RFC3339>` comment, which
    /// exposition parsers skip.
    pub fn encode(&self) -> Result<Vec<u8>, StorageError> {
        let mut buffer = format!("# Scraped at {}\n", self.scraped_at.to_rfc3339()).into_bytes();
        TextEncoder::new().encode(&self.families, &mut buffer)?;
        Ok(buffer)
    }
}

/// Destination for encoded snapshots
#[async_trait]
pub trait SnapshotWriter: Send + Sync {
    /// Human-readable target, used for logging
    fn target(&self) -> String;

    /// Writes one encoded snapshot, replacing the previous one
    async fn write(&self, encoded: &[u8]) -> Result<(), StorageError>;
}

/// Writes snapshots to a file, for textfile-style collectors.
///
/// The snapshot is written to a sibling `.tmp` file and renamed over the
/// target, so readers never see a partial file.
pub struct TextfileWriter {
    path: PathBuf,
}

impl TextfileWriter {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        TextfileWriter { path: path.into() }
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(|name| name.to_os_string())
            .unwrap_or_default();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn write_error(path: &Path, source: std::io::Error) -> StorageError {
        StorageError::WriteError {
            target: path.display().to_string(),
            source,
        }
    }
}

#[async_trait]
impl SnapshotWriter for TextfileWriter {
    fn target(&self) -> String {
        self.path.display().to_string()
    }

    async fn write(&self, encoded: &[u8]) -> Result<(), StorageError> {
        let temp_path = self.temp_path();

        tokio::fs::write(&temp_path, encoded)
            .await
            .map_err(|e| Self::write_error(&temp_path, e))?;
        tokio::fs::rename(&temp_path, &self.path)
            .await
            .map_err(|e| Self::write_error(&self.path, e))?;

        Ok(())
    }
}

/// Prints snapshots to standard output
pub struct StdoutWriter;

#[async_trait]
impl SnapshotWriter for StdoutWriter {
    fn target(&self) -> String {
        "<stdout>".to_string()
    }

    async fn write(&self, encoded: &[u8]) -> Result<(), StorageError> {
        let to_error = |source| StorageError::WriteError {
            target: self.target(),
            source,
        };

        let mut stdout = tokio::io::stdout();
        stdout.write_all(encoded).await.map_err(to_error)?;
        stdout.flush().await.map_err(to_error)
    }
}

/// Snapshot storage manager
///
/// Encodes snapshots and hands them to the configured writer.
pub struct MetricStorage {
    writer: Box<dyn SnapshotWriter>,
}

impl MetricStorage {
    pub fn new(writer: Box<dyn SnapshotWriter>) -> Self {
        MetricStorage { writer }
    }

    /// Picks the writer for the configured output
    ///
    /// # Arguments
    /// * `output` - Textfile path, or `None` for stdout
    pub fn for_output(output: Option<&Path>) -> Self {
        match output {
            Some(path) => Self::new(Box::new(TextfileWriter::new(path))),
            None => Self::new(Box::new(StdoutWriter)),
        }
    }

    pub fn target(&self) -> String {
        self.writer.target()
    }

    /// Encodes and writes a snapshot
    ///
    /// # Returns
    /// * `Ok(())` - Snapshot written
    /// * `Err(StorageError)` - Encoding or I/O failure
    pub async fn store_snapshot(&self, snapshot: &Snapshot) -> Result<(), StorageError> {
        let encoded = snapshot.encode()?;

        debug!(
            "Storing snapshot to '{}': {} families, {} bytes",
            self.writer.target(),
            snapshot.families.len(),
            encoded.len()
        );

        self.writer.write(&encoded).await
    }

    /// Stores a snapshot with a single retry, logging instead of failing
    ///
    /// # Returns
    /// `true` if the snapshot was eventually written
    pub async fn store_snapshot_safe(&self, snapshot: &Snapshot) -> bool {
        const MAX_RETRIES: u32 = 1;

        for attempt in 0..=MAX_RETRIES {
            match self.store_snapshot(snapshot).await {
                Ok(()) => {
                    if attempt > 0 {
                        info!("Stored snapshot after {} retry(ies)", attempt);
                    }
                    return true;
                }
                Err(e) => {
                    if attempt < MAX_RETRIES {
                        error!(
                            "Failed to store snapshot (attempt {}): {}. Retrying...",
                            attempt + 1,
                            e
                        );
                        tokio::time::sleep(tokio::time::Duration::from_millis(100)).await;
                    } else {
                        error!(
                            "Failed to store snapshot after {} attempts: {}. Giving up.",
                            attempt + 1,
                            e
                        );
                    }
                }
            }
        }

        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use prometheus::core::Collector;
    use prometheus::{IntCounter, Opts};
    use std::sync::{Arc, Mutex};

    fn families() -> Vec<MetricFamily> {
        let counter =
            IntCounter::with_opts(Opts::new("test_snapshots_total", "Snapshots written.")).unwrap();
        counter.inc_by(4);
        counter.collect()
    }

    #[test]
    fn test_encode_snapshot() {
        let snapshot = Snapshot::new(families());
        let text = String::from_utf8(snapshot.encode().unwrap()).unwrap();

        assert!(text.starts_with("# Scraped at "));
        assert!(text.contains("# TYPE test_snapshots_total counter"));
        assert!(text.contains("test_snapshots_total 4"));
        assert_eq!(snapshot.sample_count(), 1);
    }

    struct CapturingWriter {
        written: Arc<Mutex<Vec<u8>>>,
    }

    #[async_trait]
    impl SnapshotWriter for CapturingWriter {
        fn target(&self) -> String {
            "<capture>".to_string()
        }

        async fn write(&self, encoded: &[u8]) -> Result<(), StorageError> {
            self.written.lock().unwrap().extend_from_slice(encoded);
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_stream_snapshot_holds_only_exposition_lines() {
        let written = Arc::new(Mutex::new(Vec::new()));
        let storage = MetricStorage::new(Box::new(CapturingWriter {
            written: Arc::clone(&written),
        }));

        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_writer(std::io::stderr)
            .finish();
        let _guard = tracing::subscriber::set_default(subscriber);

        assert!(storage.store_snapshot_safe(&Snapshot::new(families())).await);

        let text = String::from_utf8(written.lock().unwrap().clone()).unwrap();
        assert!(!text.is_empty());
        for line in text.lines().filter(|line| !line.is_empty()) {
            if line.starts_with('#') {
                continue;
            }
            let mut parts = line.split_whitespace();
            let name = parts.next().unwrap();
            let value = parts.next().unwrap();
            assert!(parts.next().is_none(), "unexpected line: {}", line);
            assert!(name.starts_with("test_snapshots_total"), "unexpected line: {}", line);
            assert!(value.parse::<f64>().is_ok(), "unexpected line: {}", line);
        }
    }

    #[tokio::test]
    async fn test_textfile_writer_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("remote_info.prom");
        std::fs::write(&path, "stale").unwrap();

        let storage = MetricStorage::for_output(Some(path.as_path()));
        assert!(storage.store_snapshot_safe(&Snapshot::new(families())).await);

        let written = std::fs::read_to_string(&path).unwrap();
        assert!(written.contains("test_snapshots_total 4"));
        assert!(!written.contains("stale"));
        assert!(!dir.path().join("remote_info.prom.tmp").exists());
    }

    #[tokio::test]
    async fn test_textfile_writer_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let storage = MetricStorage::for_output(Some(dir.path().join("missing/out.prom").as_path()));

        let result = storage.store_snapshot(&Snapshot::new(families())).await;
        assert!(matches!(result, Err(StorageError::WriteError { .. })));
        assert!(!storage.store_snapshot_safe(&Snapshot::new(families())).await);
    }
}
