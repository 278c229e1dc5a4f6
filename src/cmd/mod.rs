pub mod bin;
pub mod model;
pub mod motion;
pub mod skeleton;

use argh::FromArgs;

#[derive(FromArgs, PartialEq, Debug)]
#[argh(subcommand)]
pub enum SubCommand {
    Bin(bin::Args),
    Model(model::Args),
    Motion(motion::Args),
    Skeleton(skeleton::Args),
}
