//! Durable storage for term, vote and log
//!
//! The peer hands the persister an opaque byte blob after every change to its
//! persistent state and reads it back once at startup. The encoding is
//! bincode over [`PersistentState`].

use crate::log::RaftLog;
use crate::state::PersistentState;
use crate::Result;
use parking_lot::Mutex;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Stable storage for a peer's persistent state
pub trait Persister: Send + Sync + 'static {
    /// Replace the stored state. Must be durable when it returns.
    fn save(&self, state: &[u8]) -> io::Result<()>;

    /// The last saved state, or `None` for a brand new peer.
    fn load(&self) -> io::Result<Option<Vec<u8>>>;
}

pub(crate) fn encode(state: &PersistentState) -> Result<Vec<u8>> {
    Ok(bincode::serialize(state)?)
}

pub(crate) fn decode(bytes: &[u8]) -> Result<PersistentState> {
    let mut state: PersistentState = bincode::deserialize(bytes)?;
    // Entries must sit at the index they claim.
    state.log = RaftLog::from_entries(state.log.entries().to_vec())?;
    Ok(state)
}

/// Reads and decodes whatever the persister holds.
pub(crate) fn restore(persister: &dyn Persister) -> Result<PersistentState> {
    match persister.load()? {
        Some(bytes) if !bytes.is_empty() => decode(&bytes),
        _ => Ok(PersistentState::default()),
    }
}

/// In-memory persister
///
/// Clones share the same buffer, so a test can drop a node and build a new
/// one over a clone to simulate a crash and restart.
#[derive(Debug, Clone, Default)]
pub struct MemoryPersister {
    state: Arc<Mutex<Option<Vec<u8>>>>,
}

impl MemoryPersister {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Persister for MemoryPersister {
    fn save(&self, state: &[u8]) -> io::Result<()> {
        *self.state.lock() = Some(state.to_vec());
        Ok(())
    }

    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        Ok(self.state.lock().clone())
    }
}

/// File-backed persister
///
/// Each save writes a sibling temporary file, syncs it and renames it over
/// the target, so a crash mid-write leaves the previous state intact.
#[derive(Debug)]
pub struct FilePersister {
    path: PathBuf,
    // Serializes writers to the temporary file.
    write_lock: Mutex<()>,
}

impl FilePersister {
    /// Creates the parent directory if it doesn't exist
    pub fn new(path: impl Into<PathBuf>) -> io::Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(Self {
            path,
            write_lock: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }
}

impl Persister for FilePersister {
    fn save(&self, state: &[u8]) -> io::Result<()> {
        let _guard = self.write_lock.lock();
        let tmp = self.temp_path();
        {
            let mut file = File::create(&tmp)?;
            file.write_all(state)?;
            file.sync_all()?;
        }
        fs::rename(&tmp, &self.path)
    }

    fn load(&self) -> io::Result<Option<Vec<u8>>> {
        match fs::read(&self.path) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }
}
