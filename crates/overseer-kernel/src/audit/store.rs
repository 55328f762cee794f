//! Line-oriented audit storage backends

use super::AuditError;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// Append-only storage of serialized records, one per line
pub trait AuditStore: Send + Sync + std::fmt::Debug {
    /// Append one line
    ///
    /// # Errors
    /// The line could not be persisted.
    fn append_line(&self, line: &str) -> Result<(), AuditError>;

    /// Every stored line in write order
    ///
    /// # Errors
    /// The store could not be read.
    fn read_lines(&self) -> Result<Vec<String>, AuditError>;
}

/// JSON-lines file opened in append mode
#[derive(Debug)]
pub struct FileAuditStore {
    path: PathBuf,
}

impl FileAuditStore {
    /// Use the file at `path`, creating parent directories as needed
    ///
    /// # Errors
    /// Parent directories could not be created.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        Ok(Self { path })
    }

    /// Backing file path
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl AuditStore for FileAuditStore {
    fn append_line(&self, line: &str) -> Result<(), AuditError> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        file.write_all(b"\n")?;
        file.flush()?;
        Ok(())
    }

    fn read_lines(&self) -> Result<Vec<String>, AuditError> {
        let file = match File::open(&self.path) {
            Ok(f) => f,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut lines = Vec::new();
        for (number, raw) in BufReader::new(file).split(b'\n').enumerate() {
            let line = match String::from_utf8(raw?) {
                Ok(line) => line,
                Err(e) => {
                    warn!(line = number + 1, error = %e, "Skipping audit line that is not UTF-8");
                    continue;
                }
            };
            if !line.trim().is_empty() {
                lines.push(line);
            }
        }
        Ok(lines)
    }
}

/// In-memory store
#[derive(Debug, Default)]
pub struct MemoryAuditStore {
    lines: Mutex<Vec<String>>,
}

impl MemoryAuditStore {
    /// Create an empty store
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-seeded with raw lines
    #[must_use]
    pub fn with_lines<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: Mutex::new(lines.into_iter().map(Into::into).collect()),
        }
    }
}

impl AuditStore for MemoryAuditStore {
    fn append_line(&self, line: &str) -> Result<(), AuditError> {
        self.lines.lock().push(line.to_string());
        Ok(())
    }

    fn read_lines(&self) -> Result<Vec<String>, AuditError> {
        Ok(self.lines.lock().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn file_store_creates_parents_and_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileAuditStore::open(dir.path().join("data/actions.log")).unwrap();
        assert!(store.read_lines().unwrap().is_empty());
        store.append_line("{\"a\":1}").unwrap();
        store.append_line("{\"a\":2}").unwrap();
        assert_eq!(store.read_lines().unwrap(), vec!["{\"a\":1}", "{\"a\":2}"]);
    }

    #[test]
    fn file_store_skips_lines_that_are_not_utf8() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("actions.log");
        let store = FileAuditStore::open(&path).unwrap();
        store.append_line("{\"a\":1}").unwrap();
        OpenOptions::new()
            .append(true)
            .open(&path)
            .unwrap()
            .write_all(b"\xff\xfe garbage\n")
            .unwrap();
        store.append_line("{\"a\":2}").unwrap();
        assert_eq!(store.read_lines().unwrap(), vec!["{\"a\":1}", "{\"a\":2}"]);
    }
}
