use std::path::PathBuf;

use anyhow::{Context, Result};
use argh::FromArgs;
use metrolib::{
    format::{skeleton::Skeleton, GameVersion},
    util::file::{map_file, write_file},
};

#[derive(FromArgs, PartialEq, Debug)]
/// process skeletons
#[argh(subcommand, name = "skeleton")]
pub struct Args {
    #[argh(subcommand)]
    command: SubCommand,
}

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
enum SubCommand {
    Info(InfoArgs),
    Json(JsonArgs),
    Pack(PackArgs),
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// prints a skeleton summary and bone tree
#[argh(subcommand, name = "info")]
pub struct InfoArgs {
    #[argh(positional)]
    /// input file
    input: PathBuf,
    #[argh(option, default = "GameVersion::Exodus")]
    /// game version (2033, ll, redux, a1, exodus)
    game: GameVersion,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// dumps a skeleton as JSON
#[argh(subcommand, name = "json")]
pub struct JsonArgs {
    #[argh(positional)]
    /// input file
    input: PathBuf,
    #[argh(positional)]
    /// output file
    output: PathBuf,
}

#[derive(FromArgs, PartialEq, Eq, Debug)]
/// builds a binary skeleton from JSON
#[argh(subcommand, name = "pack")]
pub struct PackArgs {
    #[argh(positional)]
    /// input file
    input: PathBuf,
    #[argh(positional)]
    /// output file
    output: PathBuf,
}

pub fn run(args: Args) -> Result<()> {
    match args.command {
        SubCommand::Info(c_args) => info(c_args),
        SubCommand::Json(c_args) => json(c_args),
        SubCommand::Pack(c_args) => pack(c_args),
    }
}

pub fn load_skeleton(data: &[u8], game: GameVersion) -> Result<Skeleton> {
    if game == GameVersion::Og2033 {
        Skeleton::load_2033(data)
    } else {
        Skeleton::load(data)
    }
}

fn info(args: InfoArgs) -> Result<()> {
    let data = map_file(&args.input)?;
    let skeleton = load_skeleton(&data, args.game)
        .with_context(|| format!("Failed to load skeleton '{}'", args.input.display()))?;
    log::info!("Version: {}", skeleton.ver);
    log::info!("Bones CRC: {:#010X}", skeleton.bones_crc());
    log::info!(
        "{} bones, {} locators, {} aux bones",
        skeleton.num_bones(),
        skeleton.num_locators(),
        skeleton.num_aux_bones()
    );
    if !skeleton.parent_skeleton.is_empty() {
        log::info!("Parent skeleton: {}", skeleton.parent_skeleton);
    }
    for folder in skeleton.motion_folders() {
        log::info!("Motions: {}", folder);
    }
    let bbox = skeleton.bind_pose_bbox();
    if !bbox.is_empty() {
        log::info!("Bind pose bounds: {} .. {}", bbox.min, bbox.max);
    }
    for idx in 0..skeleton.num_attach_points() {
        if skeleton.bone_parent_idx(idx).is_none() {
            print_tree(&skeleton, idx, 0);
        }
    }
    Ok(())
}

fn print_tree(skeleton: &Skeleton, idx: usize, depth: usize) {
    let kind = if skeleton.is_attach_point_a_locator(idx) {
        " (locator)"
    } else if skeleton.is_attach_point_an_aux_bone(idx) {
        " (aux)"
    } else {
        ""
    };
    log::info!("{:indent$}{}{}", "", skeleton.bone_name(idx).unwrap_or_default(), kind, indent = depth * 2);
    for child in 0..skeleton.num_attach_points() {
        if skeleton.bone_parent_idx(child) == Some(idx) {
            print_tree(skeleton, child, depth + 1);
        }
    }
}

fn json(args: JsonArgs) -> Result<()> {
    let data = map_file(&args.input)?;
    let skeleton = Skeleton::load(&data)?;
    let value = skeleton.to_json()?;
    write_file(&args.output, serde_json::to_string_pretty(&value)?.as_bytes())?;
    log::info!("Wrote {}", args.output.display());
    Ok(())
}

fn pack(args: PackArgs) -> Result<()> {
    let data = map_file(&args.input)?;
    let value: serde_json::Value = serde_json::from_slice(&data)
        .with_context(|| format!("Failed to parse '{}'", args.input.display()))?;
    let skeleton = Skeleton::from_json(&value)?;
    write_file(&args.output, &skeleton.save()?)?;
    log::info!("Wrote {} ({} bones)", args.output.display(), skeleton.num_bones());
    Ok(())
}
