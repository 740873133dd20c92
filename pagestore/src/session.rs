//! Per-session page storage.
//!
//! Each session owns one data file, `<store>/<sanitized session id>/data`. A [`SessionEntry`] pairs
//! that file with the [`PageWindowManager`] that decides where each page lives inside it. All
//! operations on one entry serialize through the entry's mutex. Different entries use different
//! files and proceed concurrently.

use crate::channel_pool::FileChannelPool;
use crate::windows::{PageWindow, PageWindowManager, WindowSnapshot};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use sync_file::{ReadAt, WriteAt};
use tracing::{debug, error, trace, trace_span, warn};

/// The name of the data file within a session folder.
pub const SESSION_DATA_FILE_NAME: &str = "data";

const FOLDER_CREATE_ROUNDS: u32 = 5;
const FOLDER_CREATE_ATTEMPTS_PER_ROUND: u32 = 10;
const FOLDER_CREATE_BACKOFF: Duration = Duration::from_millis(100);

struct SessionState {
    windows: PageWindowManager,

    /// True once the session folder is known to exist.
    folder_ready: bool,

    /// Set when the session has been removed. Every operation on an unbound entry is a no-op.
    unbound: bool,
}

/// The stored pages of one session.
pub struct SessionEntry {
    session_id: String,
    folder: PathBuf,
    data_file: PathBuf,
    state: Mutex<SessionState>,
}

impl SessionEntry {
    /// Creates an entry for a session that has no stored pages. Nothing is created on disk until
    /// the first page is saved.
    pub fn new(session_id: &str, folder: PathBuf, max_size_per_session: u64) -> Self {
        Self::with_windows(
            session_id,
            folder,
            PageWindowManager::new(max_size_per_session),
            false,
        )
    }

    /// Re-creates an entry from a window table that was saved in the store index.
    pub fn restore(
        session_id: &str,
        folder: PathBuf,
        snapshot: WindowSnapshot,
        max_size_per_session: u64,
    ) -> anyhow::Result<Self> {
        let windows = PageWindowManager::from_snapshot(snapshot, max_size_per_session)?;
        let folder_ready = folder.is_dir();
        Ok(Self::with_windows(session_id, folder, windows, folder_ready))
    }

    fn with_windows(
        session_id: &str,
        folder: PathBuf,
        windows: PageWindowManager,
        folder_ready: bool,
    ) -> Self {
        let data_file = folder.join(SESSION_DATA_FILE_NAME);
        Self {
            session_id: session_id.to_string(),
            folder,
            data_file,
            state: Mutex::new(SessionState {
                windows,
                folder_ready,
                unbound: false,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The session id, as given by the caller.
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// The session folder.
    pub fn folder(&self) -> &Path {
        &self.folder
    }

    /// The session's data file.
    pub fn data_file(&self) -> &Path {
        &self.data_file
    }

    /// Indicates whether this entry has been unbound.
    pub fn is_unbound(&self) -> bool {
        self.lock().unbound
    }

    /// The number of pages currently stored for this session.
    pub fn num_pages(&self) -> usize {
        self.lock().windows.num_windows()
    }

    /// The window of a stored page, if any.
    pub fn page_window(&self, page_id: u32) -> Option<PageWindow> {
        let state = self.lock();
        if state.unbound {
            return None;
        }
        state.windows.get_page_window(page_id)
    }

    /// Writes the serialized form of a page to the data file.
    ///
    /// Empty data is not stored. A write that fails is logged and dropped; the page is then not
    /// stored at all.
    pub fn save_page(&self, pool: &FileChannelPool, page_id: u32, data: &[u8]) {
        let _span = trace_span!("save_page", session = %self.session_id, page_id).entered();

        if data.is_empty() {
            trace!("page has no data; not storing it");
            return;
        }

        let Ok(size) = u32::try_from(data.len()) else {
            error!(size = data.len(), "page is too large to store");
            return;
        };

        let mut state = self.lock();
        if state.unbound {
            debug!("session was removed; dropping page");
            return;
        }

        if !state.folder_ready {
            state.folder_ready = create_folder_with_retries(&self.folder);
        }

        let window = state.windows.create_page_window(page_id, size);
        trace!(
            offset = window.file_part_offset,
            size,
            file_end = state.windows.file_end(),
            "allocated page window"
        );

        if let Err(e) = self.write_window(pool, &window, data) {
            error!(
                path = %self.data_file.display(),
                offset = window.file_part_offset,
                size,
                "failed to write page: {e}"
            );
            state.windows.remove_page(page_id);
        }
    }

    fn write_window(
        &self,
        pool: &FileChannelPool,
        window: &PageWindow,
        data: &[u8],
    ) -> io::Result<()> {
        let Some(channel) = pool.get_file_channel(&self.data_file, true)? else {
            return Err(io::Error::from(io::ErrorKind::NotFound));
        };
        channel.file().write_all_at(data, window.file_part_offset)
    }

    /// Reads the serialized form of a page.
    ///
    /// Returns `None` if the page is not stored, the session was removed, the data file does not
    /// exist or cannot be read.
    pub fn load_page(&self, pool: &FileChannelPool, page_id: u32) -> Option<Vec<u8>> {
        let _span = trace_span!("load_page", session = %self.session_id, page_id).entered();

        let state = self.lock();
        if state.unbound {
            return None;
        }

        let window = state.windows.get_page_window(page_id)?;

        let channel = match pool.get_file_channel(&self.data_file, false) {
            Ok(Some(channel)) => channel,
            Ok(None) => {
                warn!(path = %self.data_file.display(), "session data file is missing");
                return None;
            }
            Err(e) => {
                error!(path = %self.data_file.display(), "failed to open session data file: {e}");
                return None;
            }
        };

        let mut data = vec![0u8; window.file_part_size as usize];
        if let Err(e) = channel.file().read_exact_at(&mut data, window.file_part_offset) {
            error!(
                path = %self.data_file.display(),
                offset = window.file_part_offset,
                size = window.file_part_size,
                "failed to read page: {e}"
            );
            return None;
        }

        Some(data)
    }

    /// Forgets a stored page. Its space in the data file can be reused.
    pub fn remove_page(&self, page_id: u32) {
        let mut state = self.lock();
        if state.unbound {
            return;
        }
        if state.windows.remove_page(page_id).is_some() {
            trace!(session = %self.session_id, page_id, "removed page");
        }
    }

    /// Closes and deletes the data file and the session folder. After this, every operation on
    /// this entry is a no-op.
    pub fn unbind(&self, pool: &FileChannelPool) {
        let mut state = self.lock();
        if state.unbound {
            return;
        }
        state.unbound = true;

        debug!(session = %self.session_id, "unbinding session");
        pool.close_and_delete_file_channel(&self.data_file);

        match std::fs::remove_dir_all(&self.folder) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => error!(
                folder = %self.folder.display(),
                "failed to delete session folder: {e}"
            ),
        }
    }

    /// The window table of this session, or `None` if it has been unbound.
    pub fn snapshot(&self) -> Option<WindowSnapshot> {
        let state = self.lock();
        if state.unbound {
            None
        } else {
            Some(state.windows.snapshot())
        }
    }

    /// Checks the consistency of the window table.
    pub fn check_invariants(&self) -> anyhow::Result<()> {
        self.lock().windows.check_invariants()
    }
}

/// Creates `folder` and its parents.
///
/// Folder creation can fail transiently when another thread is deleting a folder on the same path,
/// so this retries in rounds with a short sleep between them. Returns false (after logging) if the
/// folder could not be created.
pub(crate) fn create_folder_with_retries(folder: &Path) -> bool {
    let mut last_error = None;

    for round in 0..FOLDER_CREATE_ROUNDS {
        for _ in 0..FOLDER_CREATE_ATTEMPTS_PER_ROUND {
            match std::fs::create_dir_all(folder) {
                Ok(()) => return true,
                Err(e) => last_error = Some(e),
            }
        }

        if round + 1 < FOLDER_CREATE_ROUNDS {
            std::thread::sleep(FOLDER_CREATE_BACKOFF);
        }
    }

    if let Some(e) = last_error {
        error!(folder = %folder.display(), "failed to create session folder: {e}");
    }
    false
}
