//! Filesystem spool of raw inbound messages.
//!
//! A fetcher (procmail rule, IMAP sync, whatever) drops `.eml` files into
//! the spool directory; `drain` parses them and moves each file into a
//! `processed/` subdirectory so a crash mid-run never loses or re-reads a
//! message silently. Files that fail to parse go to `rejected/` instead.

use std::path::{Path, PathBuf};

use tracing::{debug, info, warn};

use crate::error::ClassifyError;
use crate::feedback::types::InboundEmail;

const PROCESSED_DIR: &str = "processed";
const REJECTED_DIR: &str = "rejected";

/// Reads and drains a spool directory of raw `.eml` files.
pub struct SpoolReader {
    dir: PathBuf,
}

impl SpoolReader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Parse every `.eml` file in the spool, moving each to `processed/`
    /// (or `rejected/` when unparsable). Returns the parsed messages in
    /// filename order.
    pub async fn drain(&self) -> Result<Vec<InboundEmail>, ClassifyError> {
        if !self.dir.exists() {
            return Err(ClassifyError::Spool(format!(
                "spool directory {} does not exist",
                self.dir.display()
            )));
        }
        tokio::fs::create_dir_all(self.dir.join(PROCESSED_DIR)).await?;
        tokio::fs::create_dir_all(self.dir.join(REJECTED_DIR)).await?;

        let mut files = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.dir).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.is_file() && path.extension().is_some_and(|ext| ext == "eml") {
                files.push(path);
            }
        }
        files.sort();

        let mut emails = Vec::new();
        for path in files {
            let raw = tokio::fs::read(&path).await?;
            match InboundEmail::from_rfc822(&raw) {
                Ok(email) => {
                    debug!(file = %path.display(), sender = %email.sender, "Spooled message parsed");
                    self.archive(&path, PROCESSED_DIR).await?;
                    emails.push(email);
                }
                Err(e) => {
                    warn!(file = %path.display(), error = %e, "Unparsable spool file");
                    self.archive(&path, REJECTED_DIR).await?;
                }
            }
        }

        info!(count = emails.len(), spool = %self.dir.display(), "Spool drained");
        Ok(emails)
    }

    async fn archive(&self, path: &Path, subdir: &str) -> Result<(), ClassifyError> {
        let name = path
            .file_name()
            .ok_or_else(|| ClassifyError::Spool(format!("bad spool path {}", path.display())))?;
        tokio::fs::rename(path, self.dir.join(subdir).join(name)).await?;
        Ok(())
    }
}
