//! Descriptor hash table: `(uuid, type, arg) -> fd-entry`, ref-counted, with
//! lazy open on first use and a sweep to close idle entries (spec.md §4.2).

use crate::backend::{FileBackend, StorageBackend};
use crate::error::Result;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FileKind {
    Md,
    Itb(u32),
    Range(u32),
    Bitmap,
    TxgEnd,
}

impl FileKind {
    pub fn filename(&self) -> String {
        match self {
            FileKind::Md => "md".to_string(),
            FileKind::Itb(n) => format!("itb-{n}"),
            FileKind::Range(id) => format!("range-{id}"),
            FileKind::Bitmap => "bitmap".to_string(),
            FileKind::TxgEnd => "txg-end".to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FdKey {
    pub uuid: u64,
    pub kind: FileKind,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FdState {
    Open,
    Abuf,
    Mdisk,
    Bitmap,
    /// Set after an Io/Corrupt error; future opens attempt recovery before
    /// reuse (spec.md §7 propagation policy).
    Poisoned,
}

pub struct FdEntry {
    pub state: FdState,
    pub backend: Box<dyn StorageBackend>,
    refcount: AtomicUsize,
    last_used: Mutex<Instant>,
}

impl FdEntry {
    pub fn get(&self) {
        self.refcount.fetch_add(1, Ordering::SeqCst);
        *self.last_used.lock() = Instant::now();
    }

    pub fn put(&self) {
        self.refcount.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn refcount(&self) -> usize {
        self.refcount.load(Ordering::SeqCst)
    }

    pub fn idle_for(&self) -> std::time::Duration {
        self.last_used.lock().elapsed()
    }
}

/// Per-(uuid, type, arg) descriptor table, rooted at a data directory.
pub struct Fdht {
    root: PathBuf,
    table: RwLock<HashMap<FdKey, std::sync::Arc<Mutex<FdEntry>>>>,
}

impl Fdht {
    pub fn new(root: impl AsRef<Path>) -> Self {
        Self {
            root: root.as_ref().to_path_buf(),
            table: RwLock::new(HashMap::new()),
        }
    }

    fn path_for(&self, key: FdKey) -> PathBuf {
        self.root
            .join(format!("{:016x}", key.uuid))
            .join(key.kind.filename())
    }

    /// Returns the entry for `key`, opening (creating parent dirs as
    /// needed) on first use.
    pub fn lookup_create(&self, key: FdKey) -> Result<std::sync::Arc<Mutex<FdEntry>>> {
        if let Some(e) = self.table.read().get(&key) {
            e.lock().get();
            return Ok(e.clone());
        }
        let mut table = self.table.write();
        if let Some(e) = table.get(&key) {
            e.lock().get();
            return Ok(e.clone());
        }
        let path = self.path_for(key);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let backend = FileBackend::open(&path)?;
        let state = match key.kind {
            FileKind::Md => FdState::Mdisk,
            FileKind::Itb(_) => FdState::Abuf,
            FileKind::Range(_) => FdState::Open,
            FileKind::Bitmap => FdState::Bitmap,
            FileKind::TxgEnd => FdState::Open,
        };
        let entry = std::sync::Arc::new(Mutex::new(FdEntry {
            state,
            backend: Box::new(backend),
            refcount: AtomicUsize::new(1),
            last_used: Mutex::new(Instant::now()),
        }));
        table.insert(key, entry.clone());
        Ok(entry)
    }

    pub fn mark_poisoned(&self, key: FdKey) {
        if let Some(e) = self.table.read().get(&key) {
            e.lock().state = FdState::Poisoned;
        }
    }

    /// Closes entries with zero refcount idle longer than `max_idle`.
    pub fn sweep_idle(&self, max_idle: std::time::Duration) -> usize {
        let mut table = self.table.write();
        let before = table.len();
        table.retain(|_, e| {
            let entry = e.lock();
            !(entry.refcount() == 0 && entry.idle_for() > max_idle)
        });
        before - table.len()
    }

    pub fn len(&self) -> usize {
        self.table.read().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_create_opens_once_and_refcounts() {
        let dir = std::env::temp_dir().join(format!("fdht-test-{}", std::process::id()));
        let fdht = Fdht::new(&dir);
        let key = FdKey {
            uuid: 7,
            kind: FileKind::Md,
        };
        let a = fdht.lookup_create(key).unwrap();
        let b = fdht.lookup_create(key).unwrap();
        assert!(std::sync::Arc::ptr_eq(&a, &b));
        assert_eq!(a.lock().refcount(), 2);
        std::fs::remove_dir_all(&dir).ok();
    }
}
