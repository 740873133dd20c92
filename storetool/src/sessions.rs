use crate::StoreLocation;
use anyhow::{Result, bail};
use trellis_pagestore::index::StoreIndex;

/// Lists the sessions of a page store.
#[derive(clap::Parser)]
pub struct SessionsOptions {
    #[command(flatten)]
    store: StoreLocation,

    /// Show the page windows and free ranges of each session.
    #[arg(long)]
    pages: bool,
}

pub fn sessions_command(options: &SessionsOptions) -> Result<()> {
    let folder = options.store.folder();
    let index_file = folder.index_file();
    if !index_file.exists() {
        bail!(
            "There is no index at {}. The store is either empty, or still running.",
            index_file.display()
        );
    }

    let index = StoreIndex::read_from(&index_file)?;
    println!("{} sessions", index.sessions.len());

    for session in index.sessions.iter() {
        let w = &session.windows;
        let data_file = folder.session_data_file(&session.session_id);
        let data_file_len = std::fs::metadata(&data_file).map(|m| m.len()).ok();
        let total: u64 = w.windows.iter().map(|p| p.file_part_size as u64).sum();

        println!();
        println!("session {:?}", session.session_id);
        println!("    pages     : {}", w.windows.len());
        println!("    page bytes: {total}");
        println!("    file end  : {}", w.file_end);
        match data_file_len {
            Some(len) => println!("    data file : {} ({len} bytes)", data_file.display()),
            None => println!("    data file : {} (missing)", data_file.display()),
        }

        if options.pages {
            for p in w.windows.iter() {
                println!(
                    "    page {:8} : offset 0x{:08x}, size 0x{:06x}",
                    p.page_id, p.file_part_offset, p.file_part_size
                );
            }
            for r in w.free_ranges.iter() {
                println!(
                    "    free          : offset 0x{:08x}, size 0x{:06x}",
                    r.offset, r.size
                );
            }
        }
    }

    Ok(())
}
