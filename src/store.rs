use crate::error::StoreError;
use crate::record::{header_row, Record};
use log::{debug, info};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs::{self, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InitOutcome {
    Created,
    AlreadyPresent,
}

/// Append-only results log.
///
/// The file is opened and closed on every operation; no handle outlives a call.
#[derive(Debug, Clone)]
pub struct RecordStore {
    path: PathBuf,
}

impl RecordStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the log with its header row unless it already exists.
    /// An existing file is never truncated or rewritten.
    pub async fn ensure_initialized(&self) -> Result<InitOutcome, StoreError> {
        let file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&self.path)
            .await;

        let mut file = match file {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("Results log already present at {:?}", self.path);
                return Ok(InitOutcome::AlreadyPresent);
            }
            Err(e) => return Err(StoreError::io(&self.path, e)),
        };

        let header = format!("{}\n", header_row());
        file.write_all(header.as_bytes())
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;

        info!("Created results log at {:?}", self.path);
        Ok(InitOutcome::Created)
    }

    /// Writes exactly one row to the end of the log.
    pub async fn append(&self, record: &Record) -> Result<(), StoreError> {
        let mut file = OpenOptions::new()
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;

        let line = format!("{}\n", record.to_row());
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        file.flush()
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;

        debug!("Appended record: {}", line.trim_end());
        Ok(())
    }

    /// Number of rows after the header, counted without parsing them.
    pub async fn count_records(&self) -> Result<u64, StoreError> {
        let file = fs::File::open(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;

        let mut lines = BufReader::new(file).lines();
        let mut count = 0u64;
        while let Some(line) = lines
            .next_line()
            .await
            .map_err(|e| StoreError::io(&self.path, e))?
        {
            if !line.is_empty() {
                count += 1;
            }
        }

        Ok(count.saturating_sub(1))
    }

    /// Reads every record back, skipping the header row.
    #[allow(dead_code)]
    pub async fn read_records(&self) -> Result<Vec<Record>, StoreError> {
        let content = fs::read_to_string(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;

        content
            .lines()
            .enumerate()
            .skip(1)
            .filter(|(_, line)| !line.is_empty())
            .map(|(idx, line)| {
                Record::from_row(line).map_err(|reason| StoreError::Malformed {
                    path: self.path.clone(),
                    line: idx + 1,
                    reason,
                })
            })
            .collect()
    }
}
