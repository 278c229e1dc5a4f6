use std::path::PathBuf;

use anyhow::{ensure, Result};
use argh::FromArgs;
use metrolib::{
    format::{
        bin_archive::{BinArchive, HeaderSize},
        reflection::ReflectionFlags,
    },
    util::file::map_file,
};

#[derive(FromArgs, PartialEq, Debug)]
/// process reflected .bin archives
#[argh(subcommand, name = "bin")]
pub struct Args {
    #[argh(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum SubCommand {
    Info(InfoArgs),
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// prints the layout of an archive
#[argh(subcommand, name = "info")]
pub struct InfoArgs {
    #[argh(positional)]
    /// input file
    input: PathBuf,
    #[argh(option)]
    /// bytes preceding the flags byte
    header_size: Option<usize>,
    #[argh(switch)]
    /// guess the header size from the data chunk id
    auto_header: bool,
    #[argh(switch)]
    /// list every strings table entry
    strings: bool,
}

pub fn run(args: Args) -> Result<()> {
    match args.command {
        SubCommand::Info(c_args) => info(c_args),
    }
}

const FLAG_NAMES: [(ReflectionFlags, &str); 6] = [
    (ReflectionFlags::HAS_DEBUG_INFO, "debug_info"),
    (ReflectionFlags::EDITOR, "editor"),
    (ReflectionFlags::STRINGS_TABLE, "strings_table"),
    (ReflectionFlags::PLAIN, "plain"),
    (ReflectionFlags::NO_SECTIONS, "no_sections"),
    (ReflectionFlags::MULTIPART, "multipart"),
];

fn info(args: InfoArgs) -> Result<()> {
    ensure!(
        !(args.auto_header && args.header_size.is_some()),
        "--header-size and --auto-header are mutually exclusive"
    );
    let header = if args.auto_header {
        HeaderSize::AutoDetect
    } else {
        HeaderSize::Fixed(args.header_size.unwrap_or(0))
    };
    let data = map_file(&args.input)?;
    let archive = BinArchive::new(&data, header)?;

    let flags = archive.flags();
    let names = FLAG_NAMES
        .iter()
        .filter(|(flag, _)| flags.contains(*flag))
        .map(|(_, name)| *name)
        .collect::<Vec<_>>();
    log::info!("Header size: {}", archive.header_size());
    log::info!("Flags: {:#04X} [{}]", flags.bits(), names.join(", "));
    for (id, chunk) in archive.chunks().iter() {
        log::info!("Chunk {}: {} bytes", id, chunk.len());
    }
    log::info!("Payload: {} bytes", archive.payload()?.len());
    if let Some(table) = archive.strings_table() {
        log::info!("Strings table: {} entries", table.len());
        if args.strings {
            for (idx, s) in table.iter().enumerate() {
                log::info!("- {}: {}", idx, s);
            }
        }
    }
    Ok(())
}
