//! Append-only detection log.
//!
//! One tab separated line per detection:
//! `instant \t channel \t keyword \t nickname \t elapsed \t message`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;

use crate::error::Result;
use crate::message::format_local;

/// Default event log file name.
pub const EVENT_LOG_FILE: &str = "keyword_times.log";

/// Placeholder for an unknown broadcast elapsed time.
pub const UNKNOWN_ELAPSED: &str = "-";

/// A single detection, serialized immediately after construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetectionRecord {
    pub instant: DateTime<Utc>,
    pub channel_name: String,
    pub keyword: String,
    pub nickname: String,
    /// `HH:MM:SS` since broadcast start, or [`UNKNOWN_ELAPSED`].
    pub elapsed: String,
    pub message: String,
}

impl DetectionRecord {
    /// Render the log line (without trailing newline).
    pub fn to_line(&self) -> String {
        format!(
            "{}\t{}\t{}\t{}\t{}\t{}",
            format_local(self.instant),
            sanitize_field(&self.channel_name),
            sanitize_field(&self.keyword),
            sanitize_field(&self.nickname),
            self.elapsed,
            sanitize_field(&self.message),
        )
    }
}

/// Tabs and newlines would break the line format.
fn sanitize_field(s: &str) -> String {
    s.replace(['\t', '\r', '\n'], " ")
}

/// Format whole seconds as `HH:MM:SS`. Hours are not wrapped at 24.
pub fn format_duration(total_secs: i64) -> String {
    let total_secs = total_secs.max(0);
    let hours = total_secs / 3600;
    let minutes = (total_secs % 3600) / 60;
    let seconds = total_secs % 60;
    format!("{hours:02}:{minutes:02}:{seconds:02}")
}

/// Elapsed broadcast time at `at`, clamped at zero.
pub fn elapsed_since(start: Option<DateTime<Utc>>, at: DateTime<Utc>) -> String {
    match start {
        Some(start) => format_duration((at - start).num_seconds()),
        None => UNKNOWN_ELAPSED.to_string(),
    }
}

/// Destination for detection records.
#[async_trait]
pub trait DetectionSink: Send {
    async fn append(&mut self, record: &DetectionRecord) -> Result<()>;

    /// Flush and release the underlying resource. Further appends are no-ops.
    async fn close(&mut self) -> Result<()>;
}

/// Tab separated event log, opened in append mode and flushed per line.
pub struct TsvEventLog {
    path: PathBuf,
    file: Option<File>,
    record_count: u64,
}

impl TsvEventLog {
    /// Open (or create) the log at `path`.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Some(file),
            record_count: 0,
        })
    }

    pub fn output_path(&self) -> &Path {
        &self.path
    }

    /// Records written through this handle.
    pub fn record_count(&self) -> u64 {
        self.record_count
    }
}

#[async_trait]
impl DetectionSink for TsvEventLog {
    async fn append(&mut self, record: &DetectionRecord) -> Result<()> {
        if let Some(file) = &mut self.file {
            let mut line = record.to_line();
            line.push('\n');
            file.write_all(line.as_bytes()).await?;
            file.flush().await?;
            self.record_count += 1;
        }
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn record(message: &str) -> DetectionRecord {
        DetectionRecord {
            instant: DateTime::from_timestamp(1_700_000_000, 0).unwrap(),
            channel_name: "streamer".into(),
            keyword: "win".into(),
            nickname: "viewer".into(),
            elapsed: "01:02:03".into(),
            message: message.into(),
        }
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "00:00:00");
        assert_eq!(format_duration(3723), "01:02:03");
        assert_eq!(format_duration(90_000), "25:00:00");
        assert_eq!(format_duration(-5), "00:00:00");
    }

    #[test]
    fn test_elapsed_since() {
        let start = DateTime::from_timestamp(1_000, 0).unwrap();
        let at = DateTime::from_timestamp(1_065, 0).unwrap();

        assert_eq!(elapsed_since(Some(start), at), "00:01:05");
        assert_eq!(elapsed_since(Some(at), start), "00:00:00");
        assert_eq!(elapsed_since(None, at), UNKNOWN_ELAPSED);
    }

    #[test]
    fn test_line_layout() {
        let line = record("we\twin\nnow").to_line();
        let fields: Vec<&str> = line.split('\t').collect();

        assert_eq!(fields.len(), 6);
        assert_eq!(fields[0], format_local(DateTime::from_timestamp(1_700_000_000, 0).unwrap()));
        assert_eq!(&fields[1..5], &["streamer", "win", "viewer", "01:02:03"]);
        assert_eq!(fields[5], "we win now");
    }

    #[tokio::test]
    async fn test_appends_across_handles() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("logs").join(EVENT_LOG_FILE);

        let mut log = TsvEventLog::open(&path).await.unwrap();
        log.append(&record("first")).await.unwrap();
        log.close().await.unwrap();
        // Closed handles ignore further records.
        log.append(&record("ignored")).await.unwrap();
        assert_eq!(log.record_count(), 1);

        let mut log = TsvEventLog::open(&path).await.unwrap();
        log.append(&record("second")).await.unwrap();
        log.close().await.unwrap();

        let text = tokio::fs::read_to_string(&path).await.unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 2);
        assert!(lines[0].ends_with("\tfirst"));
        assert!(lines[1].ends_with("\tsecond"));
    }
}
