use anyhow::{bail, Result};
use clap::Parser;
use clap::Subcommand;
use clap_serde_derive::ClapSerde;

use multimodal_runner::config::{Config, DEFAULT_CONFIG_FILE};
use multimodal_runner::dispatch::canonical_id;
use multimodal_runner::repository::{ArtifactRepository, HubRepository};
use multimodal_runner::telemetry::init_telemetry;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    #[command(subcommand)]
    cmd: Commands,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

#[derive(Subcommand)]
enum Commands {
    /// Shows what the artifact cache holds for a model
    Status {
        /// Model id or friendly name
        #[clap(short, long)]
        model_id: String,
    },
    /// Downloads a model into the artifact cache
    Download {
        /// Model id or friendly name
        #[clap(short, long)]
        model_id: String,

        /// Drop the cached copy and download it again
        #[clap(short, long)]
        force: bool,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    let config = Config::load(&args.config_file, args.opt_config)?;
    init_telemetry(config.log_file(), false)?;
    let repository = HubRepository::new(config.cache_dir.clone());

    match args.cmd {
        Commands::Status { model_id } => {
            let model_id = canonical_id(&model_id);
            let status = repository.cache_status(&model_id);
            match &status.path {
                Some(path) => println!("{model_id}: {}", path.display()),
                None => println!("{model_id}: not cached"),
            }
            println!(
                "files: {} ({} non-empty), {} bytes, valid: {}",
                status.files,
                status.valid_files,
                status.total_bytes,
                status.is_valid()
            );
        }
        Commands::Download { model_id, force } => {
            let model_id = canonical_id(&model_id);
            let result = if force || !repository.cache_status(&model_id).is_valid() {
                repository.force_fetch(&model_id, &config.cache_dir)
            } else {
                repository.resolve(&model_id)
            };
            match result {
                Ok(path) => println!("{model_id} is available at {}", path.display()),
                Err(err) => bail!("Failed to download {model_id}: {err}"),
            }
        }
    }
    Ok(())
}
