//! Destination table addressing and read access.

use object_store::path::Path;
use snafu::prelude::*;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::error::{ConfigError, InvalidTablePathSnafu, SinkError};
use crate::record::EnrichedRecord;
use crate::storage::StorageProviderRef;

/// Fully-qualified `project.dataset.table` path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableRef {
    pub project: String,
    pub dataset: String,
    pub table: String,
}

impl TableRef {
    /// Prefix holding the committed objects of the table.
    pub fn data_prefix(&self) -> String {
        format!("{}/{}/{}", self.project, self.dataset, self.table)
    }

    /// Object that holds the rows of one batch.
    pub fn batch_path(&self, batch_id: Uuid) -> Path {
        Path::from(format!("{}/{batch_id}.ndjson", self.data_prefix()))
    }
}

impl FromStr for TableRef {
    type Err = ConfigError;

    fn from_str(path: &str) -> Result<Self, Self::Err> {
        let parts: Vec<&str> = path.split('.').collect();
        match parts.as_slice() {
            [project, dataset, table]
                if !project.is_empty() && !dataset.is_empty() && !table.is_empty() =>
            {
                Ok(Self {
                    project: project.to_string(),
                    dataset: dataset.to_string(),
                    table: table.to_string(),
                })
            }
            _ => InvalidTablePathSnafu { path }.fail(),
        }
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.project, self.dataset, self.table)
    }
}

/// Reads the committed rows of a table.
pub struct TableReader {
    storage: StorageProviderRef,
    table: TableRef,
}

impl TableReader {
    pub fn new(storage: StorageProviderRef, table: TableRef) -> Self {
        Self { storage, table }
    }

    /// Committed batch objects, sorted by path.
    pub async fn objects(&self) -> Result<Vec<Path>, SinkError> {
        let prefix = self.table.data_prefix();
        let paths = self
            .storage
            .list_with_prefix(&prefix)
            .await
            .map_err(|e| SinkError::ReadRows {
                path: prefix.clone(),
                message: e.to_string(),
            })?;
        Ok(paths
            .into_iter()
            .filter(|p| p.extension() == Some("ndjson"))
            .collect())
    }

    /// All rows currently visible in the table.
    pub async fn rows(&self) -> Result<Vec<EnrichedRecord>, SinkError> {
        let mut rows = Vec::new();
        for path in self.objects().await? {
            let read_error = |message: String| SinkError::ReadRows {
                path: path.to_string(),
                message,
            };
            let bytes = self
                .storage
                .get(path.clone())
                .await
                .map_err(|e| read_error(e.to_string()))?;
            for line in bytes.split(|b| *b == b'\n').filter(|l| !l.is_empty()) {
                let row: EnrichedRecord =
                    serde_json::from_slice(line).map_err(|e| read_error(e.to_string()))?;
                rows.push(row);
            }
        }
        Ok(rows)
    }

    pub async fn row_count(&self) -> Result<usize, SinkError> {
        Ok(self.rows().await?.len())
    }
}
