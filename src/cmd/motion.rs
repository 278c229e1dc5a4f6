use std::path::PathBuf;

use anyhow::{Context, Result};
use argh::FromArgs;
use metrolib::{
    format::{motion::Motion, GameVersion},
    util::file::map_file,
};

use crate::cmd::skeleton::load_skeleton;

#[derive(FromArgs, PartialEq, Debug)]
/// process motions
#[argh(subcommand, name = "motion")]
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
/// prints a motion summary
#[argh(subcommand, name = "info")]
pub struct InfoArgs {
    #[argh(positional)]
    /// input file
    input: PathBuf,
    #[argh(option)]
    /// skeleton to check the motion against
    skeleton: Option<PathBuf>,
    #[argh(option, default = "GameVersion::Exodus")]
    /// game version (2033, ll, redux, a1, exodus)
    game: GameVersion,
    #[argh(switch)]
    /// only read the header and info chunks
    header_only: bool,
}

pub fn run(args: Args) -> Result<()> {
    match args.command {
        SubCommand::Info(c_args) => info(c_args),
    }
}

fn info(args: InfoArgs) -> Result<()> {
    let data = map_file(&args.input)?;
    let motion = match (args.game, args.header_only) {
        (GameVersion::Og2033, true) => Motion::load_header_2033(&data),
        (GameVersion::Og2033, false) => Motion::load_2033(&data),
        (game, true) => Motion::load_header(&data, game),
        (game, false) => Motion::load(&data, game),
    }
    .with_context(|| format!("Failed to load motion '{}'", args.input.display()))?;

    log::info!("Version: {}", motion.version);
    log::info!("Bones CRC: {:#010X}", motion.bones_crc);
    log::info!("{} bones, {} locators", motion.num_bones, motion.num_locators);
    log::info!("{} frames ({:.3}s)", motion.num_frames(), motion.duration());
    log::info!(
        "Speed {}, accrue {}, falloff {}",
        motion.info.speed,
        motion.info.accrue,
        motion.info.falloff
    );
    let flags = motion.info.flags.names().collect::<Vec<_>>();
    if !flags.is_empty() {
        log::info!("Flags: {}", flags.join(", "));
    }
    log::info!("Animated bones: {}", motion.num_animated_bones());

    if let Some(path) = &args.skeleton {
        let skeleton_data = map_file(path)?;
        let skeleton = load_skeleton(&skeleton_data, args.game)
            .with_context(|| format!("Failed to load skeleton '{}'", path.display()))?;
        let binding = motion.bind(&skeleton)?;
        let animated = (0..skeleton.num_bones())
            .filter(|&idx| binding.is_bone_animated(idx))
            .filter_map(|idx| skeleton.bone_name(idx))
            .collect::<Vec<_>>();
        log::info!("Matches skeleton; animated: {}", animated.join(", "));
    }
    Ok(())
}
