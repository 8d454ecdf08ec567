//! Persistence of task records.
//!
//! The engine calls [`Store::save`] whenever an operation reports a
//! change. Saving the same task twice is harmless.

use std::cell::RefCell;
use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::rc::Rc;

use tracing::debug;

use crate::error::{GridError, Result};
use crate::task::{Task, TaskId, TaskRecord};

pub trait Store {
    fn save(&mut self, task: &dyn Task) -> Result<()>;
}

impl<S: Store> Store for Rc<RefCell<S>> {
    fn save(&mut self, task: &dyn Task) -> Result<()> {
        self.borrow_mut().save(task)
    }
}

/// Keeps the latest record of each task in memory.
#[derive(Debug, Default)]
pub struct MemoryStore {
    records: HashMap<TaskId, TaskRecord>,
    saves: usize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: TaskId) -> Option<&TaskRecord> {
        self.records.get(&id)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Number of `save` calls so far.
    pub fn save_count(&self) -> usize {
        self.saves
    }
}

impl Store for MemoryStore {
    fn save(&mut self, task: &dyn Task) -> Result<()> {
        self.saves += 1;
        self.records.insert(task.id(), task.record());
        Ok(())
    }
}

/// One pretty-printed JSON file per task, `<dir>/<id>.json`.
///
/// Files are written to a temporary name and renamed into place, so a
/// crash never leaves a truncated record behind.
#[derive(Debug, Clone)]
pub struct FileStore {
    dir: PathBuf,
}

impl FileStore {
    pub fn open(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn path_for(&self, id: TaskId) -> PathBuf {
        self.dir.join(format!("{id}.json"))
    }

    pub fn load(&self, id: TaskId) -> Result<TaskRecord> {
        let path = self.path_for(id);
        if !path.exists() {
            return Err(GridError::InvalidArgument(format!(
                "no stored record for task {id}"
            )));
        }
        let contents = fs::read_to_string(&path)?;
        Ok(serde_json::from_str(&contents)?)
    }

    /// Every record in the store, in no particular order.
    pub fn load_all(&self) -> Result<Vec<TaskRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let contents = fs::read_to_string(&path)?;
            records.push(serde_json::from_str(&contents)?);
        }
        Ok(records)
    }
}

impl Store for FileStore {
    fn save(&mut self, task: &dyn Task) -> Result<()> {
        let record = task.record();
        let json = serde_json::to_string_pretty(&record)?;
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.write_all(json.as_bytes())?;
        let path = self.path_for(record.id);
        tmp.persist(&path).map_err(|e| GridError::Io(e.error))?;
        debug!(task = %record.name, path = %path.display(), "Saved task");
        Ok(())
    }
}
