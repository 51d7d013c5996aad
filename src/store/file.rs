// src/store/file.rs

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::JoinHandle;

use anyhow::{Context, Result, anyhow};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::dag::{Task, TaskStatus};
use crate::store::PersistenceStore;

/// Store that keeps a JSON snapshot of all task records on disk.
///
/// `save_task` / `save_status` only update the in-memory records and mark
/// them dirty. A background writer thread rewrites the snapshot, coalescing
/// every change that arrived since its last write, so callers never wait on
/// the disk. Dropping the store flushes whatever is still pending.
///
/// The snapshot is written to a temporary sibling file and renamed into
/// place, so a reader never sees a half-written file.
#[derive(Debug)]
pub struct JsonFileStore {
    inner: Arc<Snapshot>,
    dirty: Option<mpsc::UnboundedSender<()>>,
    writer: Option<JoinHandle<()>>,
}

#[derive(Debug)]
struct Snapshot {
    path: PathBuf,
    records: Mutex<BTreeMap<String, Task>>,
    /// Serializes file writes between the writer thread and `flush`.
    io: Mutex<()>,
}

impl Snapshot {
    fn records(&self) -> MutexGuard<'_, BTreeMap<String, Task>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> Result<()> {
        let _io = self.io.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("creating dir {:?}", parent))?;
            }
        }

        let tasks: Vec<Task> = self.records().values().cloned().collect();
        let json = serde_json::to_string_pretty(&tasks).context("serializing task records")?;

        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, json).with_context(|| format!("writing {:?}", tmp))?;
        fs::rename(&tmp, &self.path)
            .with_context(|| format!("renaming {:?} to {:?}", tmp, self.path))?;
        Ok(())
    }
}

/// Writer thread: one snapshot per burst of changes, until the store is
/// dropped.
fn writer_loop(snapshot: Arc<Snapshot>, mut dirty: mpsc::UnboundedReceiver<()>) {
    while dirty.blocking_recv().is_some() {
        let mut coalesced = 0usize;
        while dirty.try_recv().is_ok() {
            coalesced += 1;
        }

        match snapshot.write() {
            Ok(()) => debug!(path = ?snapshot.path, coalesced, "task store written"),
            Err(err) => warn!(path = ?snapshot.path, error = %format!("{err:#}"), "task store write failed"),
        }
    }
}

impl JsonFileStore {
    /// Open (or create) the store at `path`, loading existing records.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let records = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("reading task store {:?}", path))?;
            let tasks: Vec<Task> = serde_json::from_str(&contents)
                .with_context(|| format!("parsing task store {:?}", path))?;
            tasks.into_iter().map(|t| (t.id.clone(), t)).collect()
        } else {
            BTreeMap::new()
        };

        debug!(path = ?path, records = records.len(), "opened JSON task store");
        let inner = Arc::new(Snapshot {
            path,
            records: Mutex::new(records),
            io: Mutex::new(()),
        });

        let (dirty, dirty_rx) = mpsc::unbounded_channel();
        let snapshot = Arc::clone(&inner);
        let writer = std::thread::Builder::new()
            .name("dagsched-store".to_string())
            .spawn(move || writer_loop(snapshot, dirty_rx))
            .context("spawning task store writer")?;

        Ok(Self {
            inner,
            dirty: Some(dirty),
            writer: Some(writer),
        })
    }

    pub fn path(&self) -> &Path {
        &self.inner.path
    }

    /// Write the current snapshot now, on the calling thread.
    pub fn flush(&self) -> Result<()> {
        self.inner.write()
    }

    fn mark_dirty(&self) -> Result<()> {
        self.dirty
            .as_ref()
            .and_then(|tx| tx.send(()).ok())
            .ok_or_else(|| anyhow!("task store writer has stopped"))
    }
}

impl PersistenceStore for JsonFileStore {
    fn save_task(&self, task: &Task) -> Result<()> {
        self.inner.records().insert(task.id.clone(), task.clone());
        self.mark_dirty()
    }

    fn save_status(&self, task_id: &str, status: TaskStatus) -> Result<()> {
        {
            let mut records = self.inner.records();
            let task = records
                .get_mut(task_id)
                .ok_or_else(|| anyhow!("status update for unsaved task '{task_id}'"))?;
            task.status = status;
        }
        self.mark_dirty()
    }

    fn load_tasks(&self) -> Result<Vec<Task>> {
        Ok(self.inner.records().values().cloned().collect())
    }
}

impl Drop for JsonFileStore {
    fn drop(&mut self) {
        // Closing the channel lets the writer finish its last snapshot.
        drop(self.dirty.take());
        if let Some(writer) = self.writer.take() {
            if writer.join().is_err() {
                warn!(path = ?self.inner.path, "task store writer panicked");
            }
        }
    }
}
