//! A [`DataStore`] that keeps pages in memory.

use crate::DataStore;
use std::collections::{HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::{debug, trace};

/// The number of pages per session that [`MemoryDataStore`] keeps by default.
pub const DEFAULT_MAX_PAGES_PER_SESSION: usize = 20;

/// Keeps up to a fixed number of pages per session in memory. When a session is full, storing a
/// new page evicts the page that was stored least recently.
pub struct MemoryDataStore {
    max_pages_per_session: usize,
    sessions: Mutex<HashMap<String, VecDeque<(u32, Vec<u8>)>>>,
}

impl Default for MemoryDataStore {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_PAGES_PER_SESSION)
    }
}

impl MemoryDataStore {
    /// Creates an empty store.
    pub fn new(max_pages_per_session: usize) -> Self {
        Self {
            max_pages_per_session: max_pages_per_session.max(1),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, VecDeque<(u32, Vec<u8>)>>> {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// The number of sessions that have stored pages.
    pub fn num_sessions(&self) -> usize {
        self.lock().len()
    }

    /// The ids of the pages stored for a session, oldest first.
    pub fn page_ids(&self, session_id: &str) -> Vec<u32> {
        self.lock()
            .get(session_id)
            .map(|pages| pages.iter().map(|(id, _)| *id).collect())
            .unwrap_or_default()
    }
}

impl DataStore for MemoryDataStore {
    fn get_data(&self, session_id: &str, page_id: u32) -> Option<Vec<u8>> {
        let sessions = self.lock();
        let pages = sessions.get(session_id)?;
        pages
            .iter()
            .find(|(id, _)| *id == page_id)
            .map(|(_, data)| data.clone())
    }

    fn store_data(&self, session_id: &str, page_id: u32, data: &[u8]) {
        if data.is_empty() {
            return;
        }

        let mut sessions = self.lock();
        let pages = sessions.entry(session_id.to_string()).or_default();
        pages.retain(|(id, _)| *id != page_id);

        while pages.len() >= self.max_pages_per_session {
            if let Some((evicted, _)) = pages.pop_front() {
                trace!(session = session_id, page_id = evicted, "evicted page");
            }
        }

        pages.push_back((page_id, data.to_vec()));
    }

    fn remove_data(&self, session_id: &str, page_id: u32) {
        let mut sessions = self.lock();
        if let Some(pages) = sessions.get_mut(session_id) {
            pages.retain(|(id, _)| *id != page_id);
        }
    }

    fn remove_session(&self, session_id: &str) {
        if self.lock().remove(session_id).is_some() {
            debug!(session = session_id, "removed session");
        }
    }

    fn destroy(&self) {
        self.lock().clear();
    }
}
