//! Record sinks.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use super::model::ProxyRecord;
use crate::config::{RecordingConfig, SinkKind};

#[derive(Debug, Error)]
pub enum SinkError {
    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write record: {0}")]
    Io(#[from] std::io::Error),
}

/// Destination for finished records.
pub trait RecordSink: Send + Sync {
    fn emit<'a>(
        &'a self,
        record: &'a ProxyRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>>;
}

/// Prints one JSON line per record on stdout.
#[derive(Debug, Default)]
pub struct ConsoleSink;

impl RecordSink for ConsoleSink {
    fn emit<'a>(
        &'a self,
        record: &'a ProxyRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            let line = serde_json::to_string(record)?;
            println!("Request Log: {line}");
            Ok(())
        })
    }
}

/// Writes one pretty-printed JSON file per record.
///
/// Files are named `<timestamp>_<request id>.json`, so a directory listing
/// sorts chronologically. Request ids can come from callers, so a name that
/// is already taken gets a random suffix instead of being overwritten.
#[derive(Debug, Clone)]
pub struct FileSink {
    directory: PathBuf,
}

impl FileSink {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    pub fn path_for(&self, record: &ProxyRecord) -> PathBuf {
        let stamp = record.timestamp.format("%Y-%m-%dT%H-%M-%S%.3fZ");
        let id: String = record
            .request_id
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '-' { c } else { '_' })
            .collect();
        self.directory.join(format!("{stamp}_{id}.json"))
    }
}

impl RecordSink for FileSink {
    fn emit<'a>(
        &'a self,
        record: &'a ProxyRecord,
    ) -> Pin<Box<dyn Future<Output = Result<(), SinkError>> + Send + 'a>> {
        Box::pin(async move {
            let contents = serde_json::to_vec_pretty(record)?;
            tokio::fs::create_dir_all(&self.directory).await?;

            let path = self.path_for(record);
            let mut file = match create_new(&path).await {
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                    let stem = path.file_stem().unwrap_or_default().to_string_lossy();
                    let unique = format!("{}_{}.json", stem, Uuid::new_v4().simple());
                    create_new(&path.with_file_name(unique)).await?
                }
                other => other?,
            };
            file.write_all(&contents).await?;
            file.flush().await?;
            Ok(())
        })
    }
}

async fn create_new(path: &Path) -> std::io::Result<tokio::fs::File> {
    tokio::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)
        .await
}

/// Fire-and-forget front for a sink.
///
/// A disabled recorder drops everything; an enabled one writes each record
/// on its own task. Sink failures are logged, never surfaced to callers.
#[derive(Clone, Default)]
pub struct Recorder {
    sink: Option<Arc<dyn RecordSink>>,
}

impl Recorder {
    pub fn new(sink: Arc<dyn RecordSink>) -> Self {
        Self { sink: Some(sink) }
    }

    pub fn disabled() -> Self {
        Self { sink: None }
    }

    /// Build a recorder from configuration.
    pub fn from_config(config: &RecordingConfig) -> Self {
        if !config.enabled {
            return Self::disabled();
        }
        match config.sink {
            SinkKind::Console => Self::new(Arc::new(ConsoleSink)),
            SinkKind::File => Self::new(Arc::new(FileSink::new(&config.directory))),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.sink.is_some()
    }

    pub fn submit(&self, record: ProxyRecord) {
        let Some(sink) = self.sink.clone() else {
            return;
        };
        tokio::spawn(async move {
            if let Err(e) = sink.emit(&record).await {
                tracing::warn!(
                    request_id = %record.request_id,
                    error = %e,
                    "Failed to emit proxy record"
                );
            }
        });
    }
}
