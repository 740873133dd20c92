//! A bounded pool of open session data files.
//!
//! Opening a file for every page read or write is expensive, and keeping every session's file open
//! exhausts file descriptors. The pool keeps up to `capacity` files open. Borrowing a file hands out
//! a [`FileChannel`], which returns the file to the pool when it is dropped. When a new file needs
//! to be opened and the pool is full, idle files are closed in least-recently-used order.
//!
//! The pool's mutex protects only its bookkeeping. Opening files and all reads and writes happen
//! without holding it, so borrowers of different files never wait for each other.

use std::collections::HashMap;
use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use sync_file::RandomAccessFile;
use tracing::{debug, error, trace};

/// The number of files that the pool keeps open by default.
pub const DEFAULT_FILE_CHANNEL_POOL_CAPACITY: usize = 50;

struct PooledFile {
    file: Arc<RandomAccessFile>,

    /// Number of [`FileChannel`] values currently borrowing this file.
    borrows: usize,

    /// Value of `PoolState::tick` when this file was last borrowed or returned.
    last_used: u64,
}

struct PoolState {
    files: HashMap<PathBuf, PooledFile>,
    tick: u64,
}

/// Keeps a bounded set of session data files open for positional reads and writes.
pub struct FileChannelPool {
    capacity: usize,
    state: Mutex<PoolState>,
}

/// A file borrowed from a [`FileChannelPool`]. The file is returned to the pool when this value is
/// dropped.
///
/// The file supports concurrent positional reads and writes through [`sync_file::ReadAt`] and
/// [`sync_file::WriteAt`].
pub struct FileChannel<'a> {
    pool: &'a FileChannelPool,
    path: PathBuf,
    file: Arc<RandomAccessFile>,
}

impl<'a> FileChannel<'a> {
    /// The path of the borrowed file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The borrowed file.
    pub fn file(&self) -> &RandomAccessFile {
        &self.file
    }
}

impl<'a> Drop for FileChannel<'a> {
    fn drop(&mut self) {
        self.pool.release(&self.path, &self.file);
    }
}

impl FileChannelPool {
    /// Creates an empty pool that keeps up to `capacity` idle files open.
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            state: Mutex::new(PoolState {
                files: HashMap::new(),
                tick: 0,
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Borrows the file at `path`.
    ///
    /// If the file is not already open, it is opened. When `for_writing` is true the file is
    /// created if it does not exist; otherwise a missing file produces `Ok(None)`.
    pub fn get_file_channel(
        &self,
        path: &Path,
        for_writing: bool,
    ) -> io::Result<Option<FileChannel<'_>>> {
        if let Some(channel) = self.borrow_open(path) {
            return Ok(Some(channel));
        }

        // Open the file without holding the lock.
        let mut options = File::options();
        options.read(true).write(true).create(for_writing);
        let file = match options.open(path) {
            Ok(f) => f,
            Err(e) if !for_writing && e.kind() == io::ErrorKind::NotFound => {
                trace!(path = %path.display(), "file does not exist");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };
        let file = Arc::new(RandomAccessFile::from(file));

        let mut state = self.lock();
        state.tick += 1;
        let tick = state.tick;

        // Another thread may have opened the same file while we were opening ours. If so, use
        // theirs and drop ours.
        if let Some(entry) = state.files.get_mut(path) {
            entry.borrows += 1;
            entry.last_used = tick;
            return Ok(Some(FileChannel {
                pool: self,
                path: path.to_path_buf(),
                file: entry.file.clone(),
            }));
        }

        Self::close_idle_files(&mut state, self.capacity);

        debug!(path = %path.display(), "opened pooled file");
        state.files.insert(
            path.to_path_buf(),
            PooledFile {
                file: file.clone(),
                borrows: 1,
                last_used: tick,
            },
        );

        Ok(Some(FileChannel {
            pool: self,
            path: path.to_path_buf(),
            file,
        }))
    }

    fn borrow_open(&self, path: &Path) -> Option<FileChannel<'_>> {
        let mut state = self.lock();
        state.tick += 1;
        let tick = state.tick;
        let entry = state.files.get_mut(path)?;
        entry.borrows += 1;
        entry.last_used = tick;
        Some(FileChannel {
            pool: self,
            path: path.to_path_buf(),
            file: entry.file.clone(),
        })
    }

    /// Returns a borrowed file to the pool. This is the same as dropping `channel`.
    pub fn return_file_channel(&self, channel: FileChannel<'_>) {
        drop(channel);
    }

    fn release(&self, path: &Path, file: &Arc<RandomAccessFile>) {
        let mut state = self.lock();
        state.tick += 1;
        let tick = state.tick;

        // The entry may have been closed (or closed and reopened) while it was borrowed. In that
        // case this borrow is not counted by the current entry.
        if let Some(entry) = state.files.get_mut(path) {
            if Arc::ptr_eq(&entry.file, file) {
                entry.borrows -= 1;
                entry.last_used = tick;
            }
        }
    }

    /// Closes idle files, least recently used first, until there is room for one more file.
    fn close_idle_files(state: &mut PoolState, capacity: usize) {
        while state.files.len() >= capacity {
            let victim = state
                .files
                .iter()
                .filter(|(_, f)| f.borrows == 0)
                .min_by_key(|(_, f)| f.last_used)
                .map(|(path, _)| path.clone());

            let Some(victim) = victim else {
                debug!(
                    open_files = state.files.len(),
                    capacity, "all pooled files are in use; exceeding pool capacity"
                );
                break;
            };

            debug!(path = %victim.display(), "closing least recently used file");
            state.files.remove(&victim);
        }
    }

    /// Closes the file at `path` (if it is open) and deletes it.
    ///
    /// Threads that are still borrowing the file keep their handle until they return it.
    pub fn close_and_delete_file_channel(&self, path: &Path) {
        let removed = self.lock().files.remove(path);
        if removed.is_some() {
            debug!(path = %path.display(), "closed pooled file");
        }
        drop(removed);

        match std::fs::remove_file(path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => error!(path = %path.display(), "failed to delete file: {e}"),
        }
    }

    /// Closes all files in the pool.
    pub fn destroy(&self) {
        let mut state = self.lock();
        debug!(open_files = state.files.len(), "closing all pooled files");
        state.files.clear();
    }

    /// The number of files currently held open by the pool.
    pub fn num_open_files(&self) -> usize {
        self.lock().files.len()
    }

    /// The maximum number of idle files the pool keeps open.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Indicates whether the file at `path` is currently held open by the pool.
    pub fn is_open(&self, path: &Path) -> bool {
        self.lock().files.contains_key(path)
    }
}
