//! The store index file.
//!
//! Window tables live in memory while the application runs. When a [`crate::DiskDataStore`] is
//! destroyed, it writes the window table of every live session to a single index file at the root
//! of the store folder. The next store created on the same folder reads the index file and then
//! deletes it, so the index is a one-shot recovery checkpoint rather than a journal.
//!
//! # Layout
//!
//! All integers are little-endian.
//!
//! ```text
//! IndexHeader
//! for each session:
//!     SessionHeader
//!     session id (UTF-8, session_id_len bytes)
//!     WindowRecord * num_windows        (oldest first)
//!     FreeRangeRecord * num_free_ranges (sorted by offset)
//! ```

use crate::windows::{FreeRange, PageWindow, WindowSnapshot};
use anyhow::{bail, Context};
use std::mem::size_of;
use std::path::Path;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned, LE, U32, U64};

/// The name of the index file, within the store folder.
pub const INDEX_FILE_NAME: &str = "PageStoreIndex";

/// Identifies a page store index file.
pub const INDEX_MAGIC: [u8; 8] = *b"TRLSIDX\0";

/// The only index file version that this crate reads and writes.
pub const INDEX_VERSION: u32 = 1;

#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct IndexHeader {
    magic: [u8; 8],
    version: U32<LE>,
    num_sessions: U32<LE>,
}

#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct SessionHeader {
    session_id_len: U32<LE>,
    num_windows: U32<LE>,
    num_free_ranges: U32<LE>,
    reserved: U32<LE>,
    file_end: U64<LE>,
}

#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct WindowRecord {
    page_id: U32<LE>,
    size: U32<LE>,
    offset: U64<LE>,
}

#[derive(IntoBytes, FromBytes, KnownLayout, Immutable, Unaligned)]
#[repr(C)]
struct FreeRangeRecord {
    offset: U64<LE>,
    size: U64<LE>,
}

static_assertions::const_assert_eq!(size_of::<IndexHeader>(), 16);
static_assertions::const_assert_eq!(size_of::<SessionHeader>(), 24);
static_assertions::const_assert_eq!(size_of::<WindowRecord>(), 16);
static_assertions::const_assert_eq!(size_of::<FreeRangeRecord>(), 16);

/// The window table of one session, as stored in the index file.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SessionSnapshot {
    /// The session id, before any sanitizing for use as a folder name.
    pub session_id: String,
    /// The window table of the session's data file.
    pub windows: WindowSnapshot,
}

/// The contents of an index file.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct StoreIndex {
    /// One entry per live session.
    pub sessions: Vec<SessionSnapshot>,
}

impl StoreIndex {
    /// Reads and parses an index file. The file is not modified.
    pub fn read_from(path: &Path) -> anyhow::Result<Self> {
        let bytes = std::fs::read(path)
            .with_context(|| format!("Failed to read index file {}", path.display()))?;
        Self::parse(&bytes)
    }

    /// Encodes this index and writes it to `path`, replacing any existing file.
    pub fn write_to(&self, path: &Path) -> anyhow::Result<()> {
        let bytes = self.to_bytes()?;
        std::fs::write(path, bytes)
            .with_context(|| format!("Failed to write index file {}", path.display()))
    }

    /// Parses the contents of an index file.
    pub fn parse(bytes: &[u8]) -> anyhow::Result<Self> {
        let mut p = Parser::new(bytes);

        let header: &IndexHeader = p.get()?;
        if header.magic != INDEX_MAGIC {
            bail!("The file is not a page store index (magic is wrong).");
        }
        if header.version.get() != INDEX_VERSION {
            bail!(
                "The page store index has version {}, but only version {} is supported.",
                header.version.get(),
                INDEX_VERSION
            );
        }

        let num_sessions = header.num_sessions.get();
        let mut sessions = Vec::new();

        for i in 0..num_sessions {
            let session: &SessionHeader = p.get()?;
            let id_bytes = p.bytes(session.session_id_len.get() as usize)?;
            let Ok(session_id) = std::str::from_utf8(id_bytes) else {
                bail!("Session {i} in the page store index has an id that is not valid UTF-8.");
            };

            let windows: &[WindowRecord] = p.slice(session.num_windows.get() as usize)?;
            let free_ranges: &[FreeRangeRecord] = p.slice(session.num_free_ranges.get() as usize)?;

            sessions.push(SessionSnapshot {
                session_id: session_id.to_string(),
                windows: WindowSnapshot {
                    windows: windows
                        .iter()
                        .map(|w| PageWindow {
                            page_id: w.page_id.get(),
                            file_part_offset: w.offset.get(),
                            file_part_size: w.size.get(),
                        })
                        .collect(),
                    free_ranges: free_ranges
                        .iter()
                        .map(|r| FreeRange {
                            offset: r.offset.get(),
                            size: r.size.get(),
                        })
                        .collect(),
                    file_end: session.file_end.get(),
                },
            });
        }

        if !p.is_empty() {
            bail!(
                "The page store index has {} bytes of trailing data.",
                p.len()
            );
        }

        Ok(Self { sessions })
    }

    /// Encodes this index in the index file format.
    pub fn to_bytes(&self) -> anyhow::Result<Vec<u8>> {
        let mut out: Vec<u8> = Vec::new();

        let Ok(num_sessions) = u32::try_from(self.sessions.len()) else {
            bail!("Too many sessions to store in the page store index.");
        };

        out.extend_from_slice(
            IndexHeader {
                magic: INDEX_MAGIC,
                version: U32::new(INDEX_VERSION),
                num_sessions: U32::new(num_sessions),
            }
            .as_bytes(),
        );

        for session in self.sessions.iter() {
            let id = session.session_id.as_bytes();
            let (Ok(id_len), Ok(num_windows), Ok(num_free_ranges)) = (
                u32::try_from(id.len()),
                u32::try_from(session.windows.windows.len()),
                u32::try_from(session.windows.free_ranges.len()),
            ) else {
                bail!(
                    "Session {} is too large to store in the page store index.",
                    session.session_id
                );
            };

            out.extend_from_slice(
                SessionHeader {
                    session_id_len: U32::new(id_len),
                    num_windows: U32::new(num_windows),
                    num_free_ranges: U32::new(num_free_ranges),
                    reserved: U32::new(0),
                    file_end: U64::new(session.windows.file_end),
                }
                .as_bytes(),
            );
            out.extend_from_slice(id);

            for w in session.windows.windows.iter() {
                out.extend_from_slice(
                    WindowRecord {
                        page_id: U32::new(w.page_id),
                        size: U32::new(w.file_part_size),
                        offset: U64::new(w.file_part_offset),
                    }
                    .as_bytes(),
                );
            }

            for r in session.windows.free_ranges.iter() {
                out.extend_from_slice(
                    FreeRangeRecord {
                        offset: U64::new(r.offset),
                        size: U64::new(r.size),
                    }
                    .as_bytes(),
                );
            }
        }

        Ok(out)
    }
}

/// A byte-oriented parser for index records.
struct Parser<'a> {
    bytes: &'a [u8],
}

impl<'a> Parser<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes }
    }

    fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Parses a reference to a record.
    fn get<T: FromBytes + Unaligned + KnownLayout + Immutable>(&mut self) -> anyhow::Result<&'a T> {
        let Ok((value, rest)) = T::ref_from_prefix(self.bytes) else {
            bail!("The page store index is truncated.");
        };
        self.bytes = rest;
        Ok(value)
    }

    /// Parses a reference to `n` consecutive records.
    fn slice<T: FromBytes + Unaligned + Immutable>(&mut self, n: usize) -> anyhow::Result<&'a [T]> {
        let Ok((values, rest)) = <[T]>::ref_from_prefix_with_elems(self.bytes, n) else {
            bail!("The page store index is truncated.");
        };
        self.bytes = rest;
        Ok(values)
    }

    /// Takes the next `n` bytes.
    fn bytes(&mut self, n: usize) -> anyhow::Result<&'a [u8]> {
        if self.bytes.len() < n {
            bail!("The page store index is truncated.");
        }
        let (lo, hi) = self.bytes.split_at(n);
        self.bytes = hi;
        Ok(lo)
    }
}
