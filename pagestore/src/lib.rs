//! Stores the serialized state of pages, per session.
//!
//! A web application keeps the pages of each user session so that postbacks, AJAX requests and
//! the browser's back button can find the page instance they were rendered from. Pages are
//! serialized by the caller; this crate only stores byte blobs keyed by (session id, page id).
//!
//! [`DiskDataStore`] keeps one data file per session. Within that file, a [`PageWindowManager`]
//! assigns each page a _window_ (a byte range) and evicts the oldest pages when the session
//! exceeds its size budget. Open files are shared through a bounded [`FileChannelPool`]. When the
//! store is destroyed, the window tables of all sessions are written to an index file, so that the
//! next store created on the same folder can read pages written by this one.
//!
//! [`MemoryDataStore`] implements the same [`DataStore`] contract without touching the disk.
//!
//! # Disk layout
//!
//! ```text
//! <store_folder>/<application_name>-filestore/
//!     PageStoreIndex
//!     <sanitized session id>/data
//! ```

#![forbid(unused_must_use)]
#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![allow(clippy::collapsible_if)]

mod channel_pool;
pub mod index;
mod memory;
mod session;
mod windows;

#[cfg(test)]
mod tests;

pub use channel_pool::{FileChannel, FileChannelPool, DEFAULT_FILE_CHANNEL_POOL_CAPACITY};
pub use memory::{MemoryDataStore, DEFAULT_MAX_PAGES_PER_SESSION};
pub use session::{SessionEntry, SESSION_DATA_FILE_NAME};
pub use windows::{FreeRange, PageWindow, PageWindowManager, WindowSnapshot};

use crate::index::{SessionSnapshot, StoreIndex, INDEX_FILE_NAME};
use anyhow::{bail, Context};
use std::collections::HashMap;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, info, trace_span, warn};

/// The default size budget of one session's data file.
pub const DEFAULT_MAX_SIZE_PER_SESSION: u64 = 10 * 1024 * 1024;

/// Stores serialized pages, keyed by session id and page id.
///
/// Implementations are shared by all request threads. Failures are logged, never returned: a
/// failed write behaves like a write that was later evicted, and a failed read is a miss.
pub trait DataStore: Send + Sync {
    /// Reads a stored page. Never creates any session state.
    fn get_data(&self, session_id: &str, page_id: u32) -> Option<Vec<u8>>;

    /// Stores a page, replacing any page that has the same id. Empty data is not stored.
    fn store_data(&self, session_id: &str, page_id: u32, data: &[u8]);

    /// Forgets a stored page.
    fn remove_data(&self, session_id: &str, page_id: u32);

    /// Forgets every page of a session and releases everything held for it.
    fn remove_session(&self, session_id: &str);

    /// Called when the application shuts down.
    fn destroy(&self);

    /// Indicates whether the stored data is replicated to other nodes.
    fn is_replicated(&self) -> bool {
        false
    }
}

/// Options for [`DiskDataStore::new`].
#[derive(Clone, Debug)]
pub struct DiskDataStoreOptions {
    /// The store folder is named `<application_name>-filestore`.
    pub application_name: String,

    /// The folder that contains the store folder.
    pub store_folder: PathBuf,

    /// The size budget of each session's data file, in bytes. When storing a page would exceed
    /// it, the oldest pages of the session are evicted.
    pub max_size_per_session: u64,

    /// The number of session data files kept open.
    pub file_channel_pool_capacity: usize,
}

impl Default for DiskDataStoreOptions {
    fn default() -> Self {
        Self {
            application_name: "trellis".to_string(),
            store_folder: std::env::temp_dir(),
            max_size_per_session: DEFAULT_MAX_SIZE_PER_SESSION,
            file_channel_pool_capacity: DEFAULT_FILE_CHANNEL_POOL_CAPACITY,
        }
    }
}

/// Locates the files of a disk store.
#[derive(Clone, Debug)]
pub struct StoreFolder {
    root: PathBuf,
}

impl StoreFolder {
    /// Describes the store folder of `application_name` within `store_folder`. Nothing is created.
    pub fn new(store_folder: &Path, application_name: &str) -> Self {
        Self {
            root: store_folder.join(format!("{application_name}-filestore")),
        }
    }

    /// The store folder itself.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// The path of the index file.
    pub fn index_file(&self) -> PathBuf {
        self.root.join(INDEX_FILE_NAME)
    }

    /// The folder that holds the data file of a session.
    pub fn session_folder(&self, session_id: &str) -> PathBuf {
        self.root.join(sanitize_session_id(session_id))
    }

    /// The data file of a session.
    pub fn session_data_file(&self, session_id: &str) -> PathBuf {
        self.session_folder(session_id).join(SESSION_DATA_FILE_NAME)
    }
}

/// Converts a session id into a name that can be used as a single folder name.
pub fn sanitize_session_id(session_id: &str) -> String {
    let name: String = session_id
        .chars()
        .map(|c| match c {
            '*' | '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect();

    // "", "." and ".." would name the store folder or its parent.
    if name.chars().all(|c| c == '.') {
        "_".repeat(name.len().max(1))
    } else {
        name
    }
}

/// Finds a live session, other than `session_id`, whose folder is `folder`. Different session ids
/// can sanitize to the same folder name.
fn session_sharing_folder<'a>(
    sessions: &'a HashMap<String, Arc<SessionEntry>>,
    session_id: &str,
    folder: &Path,
) -> Option<&'a str> {
    sessions
        .values()
        .find(|e| e.session_id() != session_id && e.folder() == folder)
        .map(|e| e.session_id())
}

fn warn_on_shared_folder(
    sessions: &HashMap<String, Arc<SessionEntry>>,
    session_id: &str,
    folder: &Path,
) {
    if let Some(other) = session_sharing_folder(sessions, session_id, folder) {
        warn!(
            session = session_id,
            other_session = other,
            folder = %folder.display(),
            "session ids map to the same session folder; their pages share one data file"
        );
    }
}

/// Stores the pages of each session in a data file of its own.
pub struct DiskDataStore {
    folder: StoreFolder,
    max_size_per_session: u64,
    pool: FileChannelPool,

    /// Lock ordering: this lock is acquired before any session entry's lock.
    sessions: Mutex<HashMap<String, Arc<SessionEntry>>>,
}

impl DiskDataStore {
    /// Creates the store folder (if necessary) and loads the index written by the last store that
    /// used it. The index file is deleted after it has been read.
    pub fn new(options: DiskDataStoreOptions) -> anyhow::Result<Self> {
        let folder = StoreFolder::new(&options.store_folder, &options.application_name);

        if let Err(e) = std::fs::create_dir_all(folder.root()) {
            if e.kind() == io::ErrorKind::PermissionDenied {
                bail!(
                    "Cannot create the page store folder {}: permission denied. Set \
                     `store_folder` to a folder that the application can write to, or use \
                     `MemoryDataStore` instead of `DiskDataStore`.",
                    folder.root().display()
                );
            }
            return Err(e).with_context(|| {
                format!(
                    "Failed to create the page store folder {}",
                    folder.root().display()
                )
            });
        }

        let store = Self {
            folder,
            max_size_per_session: options.max_size_per_session,
            pool: FileChannelPool::new(options.file_channel_pool_capacity),
            sessions: Mutex::new(HashMap::new()),
        };

        store.load_index();
        Ok(store)
    }

    fn lock_sessions(&self) -> MutexGuard<'_, HashMap<String, Arc<SessionEntry>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn load_index(&self) {
        let index_file = self.folder.index_file();
        let len = match std::fs::metadata(&index_file) {
            Ok(m) => m.len(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => return,
            Err(e) => {
                error!(path = %index_file.display(), "cannot access index file: {e}");
                return;
            }
        };

        if len != 0 {
            match StoreIndex::read_from(&index_file) {
                Ok(index) => self.restore_sessions(index),
                Err(e) => error!(path = %index_file.display(), "ignoring index file: {e:#}"),
            }
        }

        if let Err(e) = std::fs::remove_file(&index_file) {
            error!(path = %index_file.display(), "failed to delete index file: {e}");
        }
    }

    fn restore_sessions(&self, index: StoreIndex) {
        let mut sessions = self.lock_sessions();
        for s in index.sessions {
            let folder = self.folder.session_folder(&s.session_id);
            warn_on_shared_folder(&sessions, &s.session_id, &folder);
            match SessionEntry::restore(&s.session_id, folder, s.windows, self.max_size_per_session)
            {
                Ok(entry) => {
                    sessions.insert(s.session_id, Arc::new(entry));
                }
                Err(e) => warn!(session = %s.session_id, "ignoring session in index: {e:#}"),
            }
        }
        info!(num_sessions = sessions.len(), "loaded page store index");
    }

    fn save_index(&self) {
        let index_file = self.folder.index_file();

        let mut index = StoreIndex::default();
        {
            let sessions = self.lock_sessions();
            for entry in sessions.values() {
                if let Some(windows) = entry.snapshot() {
                    index.sessions.push(SessionSnapshot {
                        session_id: entry.session_id().to_string(),
                        windows,
                    });
                }
            }
        }

        if index.sessions.is_empty() {
            debug!("no sessions; not writing an index file");
            return;
        }

        index.sessions.sort_by(|a, b| a.session_id.cmp(&b.session_id));

        match index.write_to(&index_file) {
            Ok(()) => info!(
                num_sessions = index.sessions.len(),
                "saved page store index"
            ),
            Err(e) => error!("{e:#}"),
        }
    }

    /// Finds the entry of a session, without creating it.
    pub fn session_entry(&self, session_id: &str) -> Option<Arc<SessionEntry>> {
        self.lock_sessions().get(session_id).cloned()
    }

    fn get_or_create_session_entry(&self, session_id: &str) -> Arc<SessionEntry> {
        let mut sessions = self.lock_sessions();
        if let Some(entry) = sessions.get(session_id) {
            return entry.clone();
        }

        debug!(session = session_id, "creating session entry");
        let folder = self.folder.session_folder(session_id);
        warn_on_shared_folder(&sessions, session_id, &folder);
        let entry = Arc::new(SessionEntry::new(
            session_id,
            folder,
            self.max_size_per_session,
        ));
        sessions.insert(session_id.to_string(), entry.clone());
        entry
    }

    /// The ids of all live sessions, sorted.
    pub fn session_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_sessions().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// The folder that contains this store's files.
    pub fn folder(&self) -> &StoreFolder {
        &self.folder
    }

    /// The pool of open session data files.
    pub fn file_channel_pool(&self) -> &FileChannelPool {
        &self.pool
    }

    /// The size budget of each session's data file.
    pub fn max_size_per_session(&self) -> u64 {
        self.max_size_per_session
    }
}

impl DataStore for DiskDataStore {
    fn get_data(&self, session_id: &str, page_id: u32) -> Option<Vec<u8>> {
        let entry = self.session_entry(session_id)?;
        entry.load_page(&self.pool, page_id)
    }

    fn store_data(&self, session_id: &str, page_id: u32, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let entry = self.get_or_create_session_entry(session_id);
        entry.save_page(&self.pool, page_id, data);
    }

    fn remove_data(&self, session_id: &str, page_id: u32) {
        if let Some(entry) = self.session_entry(session_id) {
            entry.remove_page(page_id);
        }
    }

    fn remove_session(&self, session_id: &str) {
        let _span = trace_span!("remove_session", session = session_id).entered();

        let Some(entry) = self.session_entry(session_id) else {
            return;
        };

        // The entry stays in the map until it is unbound. Stores that find it in the meantime
        // are dropped, and a new entry cannot create files that this unbind would then delete.
        entry.unbind(&self.pool);

        let mut sessions = self.lock_sessions();
        if sessions
            .get(session_id)
            .is_some_and(|e| Arc::ptr_eq(e, &entry))
        {
            sessions.remove(session_id);
        }
    }

    fn destroy(&self) {
        let _span = trace_span!("destroy").entered();
        self.save_index();
        self.pool.destroy();
    }
}
