//! JSONL discovery ingest.
//!
//! One raw record per line. A malformed line is logged and skipped; it
//! never aborts the rest of the stream.

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tracing::{info, warn};

use crate::error::IngestError;
use crate::targets::model::RawTargetRecord;
use crate::targets::store::{TargetStore, Upserted};

/// Counts from one ingest run.
#[derive(Debug, Default, Clone, Serialize)]
pub struct IngestSummary {
    pub created: usize,
    pub merged: usize,
    pub skipped: usize,
}

impl IngestSummary {
    pub fn total(&self) -> usize {
        self.created + self.merged + self.skipped
    }
}

/// Consume a JSONL line stream into the target store.
pub async fn ingest_stream<R>(
    store: &TargetStore,
    reader: R,
) -> Result<IngestSummary, IngestError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    let mut summary = IngestSummary::default();
    let mut line_no = 0usize;

    while let Some(line) = lines.next_line().await? {
        line_no += 1;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        let record: RawTargetRecord = match serde_json::from_str(trimmed) {
            Ok(record) => record,
            Err(e) => {
                warn!(line = line_no, error = %e, "Skipping malformed discovery record");
                summary.skipped += 1;
                continue;
            }
        };

        match store.upsert(&record).await {
            Ok(Upserted::Created(_)) => summary.created += 1,
            Ok(Upserted::Merged(_)) => summary.merged += 1,
            Err(e) => {
                warn!(line = line_no, error = %e, "Failed to upsert discovery record");
                summary.skipped += 1;
            }
        }
    }

    info!(
        created = summary.created,
        merged = summary.merged,
        skipped = summary.skipped,
        "Ingest complete"
    );
    Ok(summary)
}

/// Ingest a JSONL file from disk.
pub async fn ingest_file(
    store: &TargetStore,
    path: &std::path::Path,
) -> Result<IngestSummary, IngestError> {
    let file = tokio::fs::File::open(path).await?;
    ingest_stream(store, file).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LibSqlBackend;
    use std::sync::Arc;

    async fn store() -> TargetStore {
        let db = LibSqlBackend::new_memory().await.unwrap();
        TargetStore::new(Arc::new(db))
    }

    #[tokio::test]
    async fn ingests_valid_lines() {
        let store = store().await;
        let input = concat!(
            r#"{"organization":"Acme","role_title":"Engineer","source_id":"board-a"}"#,
            "\n",
            r#"{"organization":"Globex","role_title":"Designer","source_id":"board-a"}"#,
            "\n",
        );

        let summary = ingest_stream(&store, input.as_bytes()).await.unwrap();
        assert_eq!(summary.created, 2);
        assert_eq!(summary.merged, 0);
        assert_eq!(summary.skipped, 0);
    }

    #[tokio::test]
    async fn malformed_lines_are_isolated() {
        let store = store().await;
        let input = concat!(
            r#"{"organization":"Acme","role_title":"Engineer","source_id":"a"}"#,
            "\n",
            "this is not json\n",
            "\n",
            r#"{"organization":"Globex","role_title":"Engineer","source_id":"a"}"#,
            "\n",
        );

        let summary = ingest_stream(&store, input.as_bytes()).await.unwrap();
        assert_eq!(summary.created, 2);
        assert_eq!(summary.skipped, 1);
    }

    #[tokio::test]
    async fn duplicate_records_merge() {
        let store = store().await;
        let line = r#"{"organization":"Acme Corp","role_title":"Engineer","source_id":"a"}"#;
        let input = format!("{line}\n{line}\n");

        let summary = ingest_stream(&store, input.as_bytes()).await.unwrap();
        assert_eq!(summary.created, 1);
        assert_eq!(summary.merged, 1);
    }

    #[tokio::test]
    async fn ingest_file_roundtrip() {
        let store = store().await;
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("discovery.jsonl");
        tokio::fs::write(
            &path,
            r#"{"organization":"Acme","role_title":"Engineer","source_id":"file"}"#,
        )
        .await
        .unwrap();

        let summary = ingest_file(&store, &path).await.unwrap();
        assert_eq!(summary.created, 1);
    }
}
