//! Persistence layer.
//!
//! A `Store` holds named blobs and replaces them atomically. `Datasets`
//! sits on top of a store and knows the two CSV files the pipeline keeps:
//! the quotes snapshot and the holdings ledger. Both stages receive a
//! `Datasets` instead of reaching for file paths.

pub mod codec;

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use crate::types::{HoldingRecord, PipelineError, Snapshot};

// ---------------------------------------------------------------------------
// Store abstraction
// ---------------------------------------------------------------------------

/// Named-blob storage with all-or-nothing replacement.
pub trait Store: Send + Sync {
    /// Read a blob. `Ok(None)` when it doesn't exist yet.
    fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>>;

    /// Replace a blob. Readers see either the old or the new contents,
    /// never a mix.
    fn replace(&self, name: &str, contents: &[u8]) -> io::Result<()>;

    /// Human-readable location for logs and errors.
    fn location(&self, name: &str) -> String;
}

/// Files in a directory, replaced via write-to-temp + fsync + rename.
pub struct FileStore {
    root: PathBuf,
}

impl FileStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn path(&self, name: &str) -> PathBuf {
        self.root.join(name)
    }

    fn temp_path(&self, name: &str) -> PathBuf {
        self.root
            .join(format!(".{name}.{}.tmp", uuid::Uuid::new_v4().simple()))
    }
}

impl Store for FileStore {
    fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        match fs::read(self.path(name)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn replace(&self, name: &str, contents: &[u8]) -> io::Result<()> {
        fs::create_dir_all(&self.root)?;
        let target = self.path(name);
        let temp = self.temp_path(name);

        let written = (|| {
            let mut file = fs::File::create(&temp)?;
            file.write_all(contents)?;
            file.sync_all()?;
            fs::rename(&temp, &target)
        })();

        if let Err(e) = written {
            let _ = fs::remove_file(&temp);
            return Err(e);
        }

        debug!(path = %target.display(), bytes = contents.len(), "File replaced");
        Ok(())
    }

    fn location(&self, name: &str) -> String {
        self.path(name).display().to_string()
    }
}

/// In-memory store for tests and dry runs.
#[derive(Default, Clone)]
pub struct MemoryStore {
    blobs: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
    fail_writes: Arc<AtomicBool>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a blob directly, bypassing the failure switch.
    pub fn put(&self, name: &str, contents: impl Into<Vec<u8>>) {
        self.lock().insert(name.to_string(), contents.into());
    }

    pub fn get(&self, name: &str) -> Option<Vec<u8>> {
        self.lock().get(name).cloned()
    }

    /// Make every subsequent `replace` fail with an I/O error.
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        self.blobs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Store for MemoryStore {
    fn read(&self, name: &str) -> io::Result<Option<Vec<u8>>> {
        Ok(self.get(name))
    }

    fn replace(&self, name: &str, contents: &[u8]) -> io::Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(io::Error::new(io::ErrorKind::Other, "write refused"));
        }
        self.put(name, contents);
        Ok(())
    }

    fn location(&self, name: &str) -> String {
        format!("memory:{name}")
    }
}

// ---------------------------------------------------------------------------
// Datasets
// ---------------------------------------------------------------------------

/// The pipeline's two data files on top of a store.
#[derive(Clone)]
pub struct Datasets {
    store: Arc<dyn Store>,
    quotes_file: String,
    holdings_file: String,
}

impl Datasets {
    pub fn new(
        store: Arc<dyn Store>,
        quotes_file: impl Into<String>,
        holdings_file: impl Into<String>,
    ) -> Self {
        Self {
            store,
            quotes_file: quotes_file.into(),
            holdings_file: holdings_file.into(),
        }
    }

    /// File-backed datasets as described by the storage config.
    pub fn from_config(cfg: &crate::config::StorageConfig) -> Self {
        Self::new(
            Arc::new(FileStore::new(&cfg.data_dir)),
            cfg.quotes_file.clone(),
            cfg.holdings_file.clone(),
        )
    }

    pub fn quotes_location(&self) -> String {
        self.store.location(&self.quotes_file)
    }

    pub fn holdings_location(&self) -> String {
        self.store.location(&self.holdings_file)
    }

    fn read(&self, name: &str) -> Result<Option<Vec<u8>>, PipelineError> {
        self.store
            .read(name)
            .map_err(|source| PipelineError::PersistenceFailure {
                path: self.store.location(name),
                source,
            })
    }

    fn replace(&self, name: &str, contents: &[u8]) -> Result<(), PipelineError> {
        self.store
            .replace(name, contents)
            .map_err(|source| PipelineError::PersistenceFailure {
                path: self.store.location(name),
                source,
            })
    }

    /// Load the last persisted snapshot. Missing file → empty snapshot.
    /// Unreadable rows are logged and dropped.
    pub fn load_snapshot(&self) -> Result<Snapshot, PipelineError> {
        let Some(bytes) = self.read(&self.quotes_file)? else {
            info!(path = %self.quotes_location(), "No quotes snapshot yet");
            return Ok(Snapshot::new());
        };

        let (snapshot, errors) = codec::decode_quotes(&bytes);
        for e in &errors {
            warn!(path = %self.quotes_location(), error = %e, "Skipping malformed quote row");
        }
        debug!(records = snapshot.len(), "Quotes snapshot loaded");
        Ok(snapshot)
    }

    /// Atomically replace the snapshot file.
    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<(), PipelineError> {
        let bytes = codec::encode_quotes(snapshot).map_err(|source| {
            PipelineError::PersistenceFailure {
                path: self.quotes_location(),
                source,
            }
        })?;
        self.replace(&self.quotes_file, &bytes)?;
        info!(path = %self.quotes_location(), records = snapshot.len(), "Quotes snapshot saved");
        Ok(())
    }

    /// Load the holdings ledger. Missing file → empty ledger.
    pub fn load_holdings(&self) -> Result<Vec<HoldingRecord>, PipelineError> {
        let Some(bytes) = self.read(&self.holdings_file)? else {
            info!(path = %self.holdings_location(), "No holdings ledger yet, starting fresh");
            return Ok(Vec::new());
        };

        let holdings = codec::decode_holdings(&bytes).map_err(|e| PipelineError::CorruptDataset {
            path: self.holdings_location(),
            message: e.to_string(),
        })?;
        debug!(records = holdings.len(), "Holdings ledger loaded");
        Ok(holdings)
    }

    /// Atomically replace the holdings ledger.
    pub fn save_holdings(&self, holdings: &[HoldingRecord]) -> Result<(), PipelineError> {
        let bytes = codec::encode_holdings(holdings).map_err(|source| {
            PipelineError::PersistenceFailure {
                path: self.holdings_location(),
                source,
            }
        })?;
        self.replace(&self.holdings_file, &bytes)?;
        info!(path = %self.holdings_location(), records = holdings.len(), "Holdings ledger saved");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
