//! Input record sources for annotation runs.

use std::path::PathBuf;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};

use crate::models::InputRecord;

#[derive(Debug, thiserror::Error)]
pub enum InputError {
    #[error("Input IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed input record at index {index}: {reason}")]
    Malformed { index: u64, reason: String },

    #[error("Input range {start}..={end} exceeds dataset of {len} records")]
    OutOfRange { start: u64, end: u64, len: u64 },
}

/// Random access to the records of a run's source dataset.
#[async_trait]
pub trait InputSource: Send + Sync {
    /// Records `start..=end`, in dataset order.
    async fn read_range(&self, start: u64, end: u64) -> Result<Vec<InputRecord>, InputError>;

    /// Total number of records.
    async fn len(&self) -> Result<u64, InputError>;
}

/// JSON Lines file, one record per non-empty line.
#[derive(Debug, Clone)]
pub struct JsonlInputSource {
    path: PathBuf,
}

impl JsonlInputSource {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl InputSource for JsonlInputSource {
    async fn read_range(&self, start: u64, end: u64) -> Result<Vec<InputRecord>, InputError> {
        if start > end {
            return Err(InputError::OutOfRange { start, end, len: 0 });
        }
        let file = tokio::fs::File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut index = 0u64;
        let mut records = Vec::with_capacity((end - start + 1) as usize);

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            if index >= start {
                let record = serde_json::from_str(&line).map_err(|e| InputError::Malformed {
                    index,
                    reason: e.to_string(),
                })?;
                records.push(record);
            }
            if index == end {
                return Ok(records);
            }
            index += 1;
        }

        Err(InputError::OutOfRange {
            start,
            end,
            len: index,
        })
    }

    async fn len(&self) -> Result<u64, InputError> {
        let file = tokio::fs::File::open(&self.path).await?;
        let mut lines = BufReader::new(file).lines();
        let mut count = 0u64;
        while let Some(line) = lines.next_line().await? {
            if !line.trim().is_empty() {
                count += 1;
            }
        }
        Ok(count)
    }
}

/// Records held in memory.
#[derive(Debug, Clone, Default)]
pub struct InMemoryInputSource {
    records: Vec<InputRecord>,
}

impl InMemoryInputSource {
    pub fn new(records: Vec<InputRecord>) -> Self {
        Self { records }
    }
}

#[async_trait]
impl InputSource for InMemoryInputSource {
    async fn read_range(&self, start: u64, end: u64) -> Result<Vec<InputRecord>, InputError> {
        let len = self.records.len() as u64;
        if end >= len || start > end {
            return Err(InputError::OutOfRange { start, end, len });
        }
        Ok(self.records[start as usize..=end as usize].to_vec())
    }

    async fn len(&self) -> Result<u64, InputError> {
        Ok(self.records.len() as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn line(id: &str) -> String {
        format!(
            r#"{{"id":"{}","subreddit":"rust","created_utc":"2025-03-01T00:00:00Z","title":"t"}}"#,
            id
        )
    }

    #[tokio::test]
    async fn reads_inclusive_range_skipping_blank_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", line("a")).unwrap();
        writeln!(file).unwrap();
        writeln!(file, "{}", line("b")).unwrap();
        writeln!(file, "{}", line("c")).unwrap();
        writeln!(file, "{}", line("d")).unwrap();

        let source = JsonlInputSource::new(file.path());
        assert_eq!(source.len().await.unwrap(), 4);
        let ids: Vec<_> = source
            .read_range(1, 2)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
    }

    #[tokio::test]
    async fn malformed_line_in_range_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", line("a")).unwrap();
        writeln!(file, "not json").unwrap();

        let source = JsonlInputSource::new(file.path());
        // Lines outside the requested range are never parsed.
        assert_eq!(source.read_range(0, 0).await.unwrap().len(), 1);
        assert!(matches!(
            source.read_range(0, 1).await,
            Err(InputError::Malformed { index: 1, .. })
        ));
        assert!(matches!(
            source.read_range(0, 5).await,
            Err(InputError::Malformed { .. })
        ));
    }

    #[tokio::test]
    async fn range_past_end_is_an_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", line("a")).unwrap();
        let source = JsonlInputSource::new(file.path());
        assert!(matches!(
            source.read_range(0, 3).await,
            Err(InputError::OutOfRange { len: 1, .. })
        ));
    }
}
