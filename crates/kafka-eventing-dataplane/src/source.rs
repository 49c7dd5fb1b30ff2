//! File-backed contract source
//!
//! Data-plane pods see the contract ConfigMap as a projected volume. The
//! kubelet updates such volumes by swapping a `..data` symlink inside the
//! mount directory, so the watch is placed on the parent directory rather
//! than on the file itself.

use async_trait::async_trait;
use futures::stream::{self, BoxStream, StreamExt};
use kafka_eventing_contract::{ContractError, ContractSource};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, error};

/// Contract source reading a file and watching its directory with `notify`
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
}

impl FileSource {
    /// Create a source for the given contract file
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Path of the watched contract file
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn watch_dir(&self) -> PathBuf {
        match self.path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
            _ => PathBuf::from("."),
        }
    }
}

#[async_trait]
impl ContractSource for FileSource {
    async fn read(&self) -> kafka_eventing_contract::Result<Option<Vec<u8>>> {
        match tokio::fs::read(&self.path).await {
            Ok(raw) => Ok(Some(raw)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(ContractError::Io(e)),
        }
    }

    fn changes(&self) -> kafka_eventing_contract::Result<BoxStream<'static, ()>> {
        let (tx, rx) = mpsc::unbounded_channel();

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| {
            match res {
                Ok(event) => {
                    if matches!(
                        event.kind,
                        EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_)
                    ) {
                        let _ = tx.send(());
                    }
                }
                Err(e) => error!(error = %e, "Contract file watch error"),
            }
        })
        .map_err(|e| ContractError::Storage(e.to_string()))?;

        let dir = self.watch_dir();
        watcher
            .watch(&dir, RecursiveMode::NonRecursive)
            .map_err(|e| ContractError::Storage(e.to_string()))?;
        debug!(dir = %dir.display(), "Watching contract directory");

        // The watcher lives inside the stream state; dropping the stream
        // stops the watch.
        Ok(stream::unfold(
            (rx, watcher),
            |(mut rx, watcher): (mpsc::UnboundedReceiver<()>, RecommendedWatcher)| async move {
                rx.recv().await.map(|_| ((), (rx, watcher)))
            },
        )
        .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_missing_file_reads_none() {
        let dir = TempDir::new().unwrap();
        let source = FileSource::new(dir.path().join("data"));
        assert!(source.read().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_read_existing_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        std::fs::write(&path, br#"{"generation":1}"#).unwrap();

        let source = FileSource::new(&path);
        assert_eq!(source.path(), path.as_path());
        assert_eq!(
            source.read().await.unwrap(),
            Some(br#"{"generation":1}"#.to_vec())
        );
    }

    #[tokio::test]
    async fn test_write_triggers_change() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        let source = FileSource::new(&path);

        let mut changes = source.changes().unwrap();
        std::fs::write(&path, br#"{"generation":2}"#).unwrap();

        let next = tokio::time::timeout(Duration::from_secs(5), changes.next())
            .await
            .expect("no change notification");
        assert_eq!(next, Some(()));
    }

    #[test]
    fn test_watch_dir_of_bare_file_name() {
        let source = FileSource::new("data");
        assert_eq!(source.watch_dir(), PathBuf::from("."));
    }
}
