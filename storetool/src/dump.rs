use crate::StoreLocation;
use anyhow::{Context, Result, bail};
use pretty_hex::PrettyHex;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use trellis_pagestore::index::StoreIndex;

/// Dumps the stored bytes of a page.
#[derive(clap::Parser)]
pub struct DumpOptions {
    #[command(flatten)]
    store: StoreLocation,

    /// The session that owns the page.
    session: String,

    /// The page id.
    page: u32,

    /// Max length of the data to dump. Defaults to the whole page.
    #[arg(long)]
    len: Option<u32>,
}

pub fn dump_command(options: &DumpOptions) -> Result<()> {
    let folder = options.store.folder();
    let index = StoreIndex::read_from(&folder.index_file())?;

    let Some(session) = index
        .sessions
        .iter()
        .find(|s| s.session_id == options.session)
    else {
        bail!("The index has no session named {:?}.", options.session);
    };

    let Some(window) = session
        .windows
        .windows
        .iter()
        .find(|w| w.page_id == options.page)
    else {
        bail!(
            "Session {:?} has no page {}.",
            options.session,
            options.page
        );
    };

    let len = match options.len {
        Some(len) => len.min(window.file_part_size),
        None => window.file_part_size,
    };

    let data_file = folder.session_data_file(&options.session);
    let mut f = File::open(&data_file)
        .with_context(|| format!("Failed to open {}", data_file.display()))?;
    f.seek(SeekFrom::Start(window.file_part_offset))?;

    let mut buffer: Vec<u8> = vec![0; len as usize];
    f.read_exact(&mut buffer).with_context(|| {
        format!(
            "The data file is shorter than the window of page {} (offset 0x{:x}, size 0x{:x}).",
            window.page_id, window.file_part_offset, window.file_part_size
        )
    })?;

    println!(
        "page {} : offset 0x{:x}, size 0x{:x}",
        window.page_id, window.file_part_offset, window.file_part_size
    );

    println!("{:?}", buffer.hex_dump());

    Ok(())
}
