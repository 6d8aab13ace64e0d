use std::path::{Path, PathBuf};

use tokio::io::AsyncWriteExt;

use crate::entry::AuditEntry;

/// Errors that can occur during audit log I/O.
#[derive(Debug, thiserror::Error)]
pub enum AuditWriteError {
    #[error("failed to create parent directories: {0}")]
    CreateDir(std::io::Error),

    #[error("failed to open audit log file: {0}")]
    OpenFile(std::io::Error),

    #[error("failed to serialize audit entry: {0}")]
    Serialize(#[from] serde_json::Error),

    #[error("failed to write to audit log: {0}")]
    Write(std::io::Error),

    #[error("failed to flush audit log: {0}")]
    Flush(std::io::Error),

    #[error("failed to read audit log: {0}")]
    Read(std::io::Error),

    #[error("malformed audit entry on line {line}: {source}")]
    Malformed {
        line: usize,
        #[source]
        source: serde_json::Error,
    },
}

/// Append-only JSON-lines file writer. One [`AuditEntry`] per line.
pub struct AuditWriter {
    path: PathBuf,
    file: tokio::fs::File,
    written: u64,
}

impl AuditWriter {
    /// Open (or create) the log at `path` in append mode, creating parent
    /// directories as needed.
    pub async fn new(path: impl AsRef<Path>) -> Result<Self, AuditWriteError> {
        let path = path.as_ref();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(AuditWriteError::CreateDir)?;
        }

        let file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await
            .map_err(AuditWriteError::OpenFile)?;

        Ok(Self {
            path: path.to_path_buf(),
            file,
            written: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Entries written by this writer, not counting lines already in the file.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, entry: &AuditEntry) -> Result<(), AuditWriteError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        self.file
            .write_all(&line)
            .await
            .map_err(AuditWriteError::Write)?;
        self.written += 1;

        Ok(())
    }

    pub async fn flush(&mut self) -> Result<(), AuditWriteError> {
        self.file.flush().await.map_err(AuditWriteError::Flush)
    }
}

/// Read back every entry of a JSON-lines audit log. Blank lines are skipped.
pub async fn read_entries(path: impl AsRef<Path>) -> Result<Vec<AuditEntry>, AuditWriteError> {
    let contents = tokio::fs::read_to_string(path)
        .await
        .map_err(AuditWriteError::Read)?;
    contents
        .lines()
        .enumerate()
        .filter(|(_, line)| !line.trim().is_empty())
        .map(|(idx, line)| {
            serde_json::from_str(line).map_err(|source| AuditWriteError::Malformed {
                line: idx + 1,
                source,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::entry::{AuditEventType, AuditSource};

    fn entry(n: u64) -> AuditEntry {
        AuditEntry::new(
            AuditEventType::PolicyEvaluated,
            AuditSource::new("test"),
            json!({"n": n}),
        )
    }

    #[tokio::test]
    async fn appends_json_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/audit.jsonl");

        let mut writer = AuditWriter::new(&path).await.unwrap();
        writer.write(&entry(1)).await.unwrap();
        writer.write(&entry(2)).await.unwrap();
        writer.flush().await.unwrap();
        assert_eq!(writer.written(), 2);
        drop(writer);

        // Reopening appends rather than truncating.
        let mut writer = AuditWriter::new(&path).await.unwrap();
        writer.write(&entry(3)).await.unwrap();
        writer.flush().await.unwrap();

        let entries = read_entries(&path).await.unwrap();
        let ns: Vec<_> = entries.iter().map(|e| e.details["n"].clone()).collect();
        assert_eq!(ns, vec![json!(1), json!(2), json!(3)]);
    }

    #[tokio::test]
    async fn malformed_lines_are_reported() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        std::fs::write(&path, "\n{not json}\n").unwrap();

        let err = read_entries(&path).await.unwrap_err();
        assert!(
            matches!(err, AuditWriteError::Malformed { line: 2, .. }),
            "unexpected error: {err}"
        );
    }
}
