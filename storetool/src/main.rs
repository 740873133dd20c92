#![forbid(unused_must_use)]
#![allow(clippy::collapsible_else_if)]

use clap::Parser;

mod dump;
mod map;
mod sessions;

#[derive(clap::Parser)]
struct CommandWithFlags {
    /// Reduce logging to just warnings and errors.
    #[arg(long)]
    quiet: bool,

    /// Turn on debug output. Noisy!
    #[arg(long)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(clap::Subcommand)]
enum Command {
    /// Lists the sessions recorded in the index of a page store, with their pages. The store must
    /// not be in use; a running store deletes its index when it starts.
    Sessions(sessions::SessionsOptions),
    /// Dumps the stored bytes of one page as a hex dump.
    Dump(dump::DumpOptions),
    /// Decodes a URL with the framework's mappers (plus any mounted pages), and encodes the
    /// resulting handler again.
    Map(map::MapOptions),
}

fn main() -> anyhow::Result<()> {
    let command_with_flags = CommandWithFlags::parse();
    configure_tracing(&command_with_flags);

    match command_with_flags.command {
        Command::Sessions(args) => sessions::sessions_command(&args)?,
        Command::Dump(args) => dump::dump_command(&args)?,
        Command::Map(args) => map::map_command(&args)?,
    }

    Ok(())
}

fn configure_tracing(args: &CommandWithFlags) {
    use tracing_subscriber::filter::LevelFilter;

    let max_level = if args.quiet {
        LevelFilter::WARN
    } else if args.verbose {
        LevelFilter::DEBUG
    } else {
        LevelFilter::INFO
    };

    tracing_subscriber::fmt()
        .with_max_level(max_level)
        .with_writer(std::io::stderr)
        .without_time()
        .init();
}

/// Locates a page store on disk.
#[derive(clap::Args)]
struct StoreLocation {
    /// The folder that contains the `<app>-filestore` folder.
    #[arg(long)]
    store_folder: std::path::PathBuf,

    /// The application name that the store was created with.
    #[arg(long, default_value = "trellis")]
    app: String,
}

impl StoreLocation {
    fn folder(&self) -> trellis_pagestore::StoreFolder {
        trellis_pagestore::StoreFolder::new(&self.store_folder, &self.app)
    }
}
