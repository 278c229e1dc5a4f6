use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use argh::FromArgs;
use metrolib::{
    format::{
        model::{LoadFlags, Model, ModelLoadParams, ModelResolver, MAX_LODS},
        GameVersion,
    },
    util::file::map_file,
};

#[derive(FromArgs, PartialEq, Debug)]
/// process models
#[argh(subcommand, name = "model")]
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
/// prints a model summary
#[argh(subcommand, name = "info")]
pub struct InfoArgs {
    #[argh(positional)]
    /// input file
    input: PathBuf,
    #[argh(option, default = "GameVersion::Exodus")]
    /// game version (2033, ll, redux, a1, exodus)
    game: GameVersion,
    #[argh(option)]
    /// content/meshes folder for linked meshes and skeletons (default: the model's folder)
    meshes: Option<PathBuf>,
    #[argh(switch)]
    /// skip vertex and face buffers
    no_geometry: bool,
    #[argh(switch)]
    /// skip collision children
    no_collision: bool,
    #[argh(switch)]
    /// skip the skeleton of skeleton models
    no_skeleton: bool,
    #[argh(option)]
    /// texture preset to apply
    tpreset: Option<String>,
}

pub fn run(args: Args) -> Result<()> {
    match args.command {
        SubCommand::Info(c_args) => info(c_args),
    }
}

/// Resolves links against a `content/meshes` folder.
struct MeshesDir {
    root: PathBuf,
    model_dir: PathBuf,
    game: GameVersion,
}

impl MeshesDir {
    fn open(path: &Path) -> Result<Option<Vec<u8>>> {
        if !path.is_file() {
            return Ok(None);
        }
        Ok(Some(map_file(path)?.to_vec()))
    }

    fn link_path(&self, name: &str, ext: &str) -> PathBuf {
        let name = name.replace('\\', "/");
        match name.strip_prefix("./") {
            Some(relative) => self.model_dir.join(format!("{relative}{ext}")),
            None => self.root.join(format!("{name}{ext}")),
        }
    }
}

impl ModelResolver for MeshesDir {
    fn open_mesh(&self, name: &str) -> Result<Option<Vec<u8>>> { Self::open(&self.link_path(name, ".mesh")) }

    fn open_skeleton(&self, name: &str) -> Result<Option<Vec<u8>>> {
        let ext = if self.game == GameVersion::Og2033 { ".skeleton" } else { ".skeleton.bin" };
        Self::open(&self.link_path(name, ext))
    }
}

fn info(args: InfoArgs) -> Result<()> {
    let mut load_flags = LoadFlags(0);
    if !args.no_geometry {
        load_flags = load_flags | LoadFlags::GEOMETRY;
    }
    if !args.no_collision {
        load_flags = load_flags | LoadFlags::COLLISION;
    }
    if !args.no_skeleton {
        load_flags = load_flags | LoadFlags::SKELETON;
    }
    let model_dir = args.input.parent().map(Path::to_path_buf).unwrap_or_default();
    let root = args.meshes.clone().unwrap_or_else(|| model_dir.clone());
    let resolver = MeshesDir { root, model_dir, game: args.game };

    let data = map_file(&args.input)?;
    let mut model = Model::load(&data, ModelLoadParams::new(load_flags, args.game), &resolver)
        .with_context(|| format!("Failed to load model '{}'", args.input.display()))?;
    if let Some(name) = &args.tpreset {
        if !model.apply_texture_preset(name) {
            log::warn!("No texture preset '{}'", name);
        }
    }

    let base = model.base();
    log::info!("Type: {:?}, version {}", base.model_type, base.version);
    log::info!("Bounds: {} .. {}", base.bbox.min, base.bbox.max);
    log::info!("Sphere: {} r {}", base.bsphere.center, base.bsphere.radius);
    if base.checksum != 0 {
        log::info!("Checksum: {:#010X}", base.checksum);
    }
    if let Some(skeleton) = model.skeleton() {
        log::info!("Skeleton: {} bones, CRC {:#010X}", skeleton.num_bones(), skeleton.bones_crc());
    }
    if let Some(extras) = model.extras() {
        for preset in &extras.texture_presets {
            log::info!("Texture preset '{}': {} items", preset.name, preset.items.len());
        }
        for (from, to) in &extras.texture_replacements {
            log::info!("Texture replacement: {} -> {}", from, to);
        }
        if let Some(comment) = &extras.comment {
            log::info!("Comment: {}", comment.text());
        }
    }
    for lod in 0..MAX_LODS {
        let geom = model.collect_geom_data(lod);
        if lod > 0 && geom.is_empty() {
            continue;
        }
        log::info!("LOD {}: {} meshes", lod, geom.len());
        for gd in &geom {
            let mesh_base = gd.model.base();
            log::info!(
                "- {:?} {:?}: {} vertices, {} faces, texture '{}', material '{}'{}",
                mesh_base.model_type,
                gd.mesh.vertex_type,
                gd.mesh.vertices_count,
                gd.mesh.faces_count,
                gd.texture,
                mesh_base.materials[3],
                if mesh_base.is_collision { " (collision)" } else { "" }
            );
        }
    }
    Ok(())
}
