use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{ArgAction, Parser};
use clap_serde_derive::ClapSerde;
use tracing::{error, info};

use multimodal_runner::config::{Config, DEFAULT_CONFIG_FILE};
use multimodal_runner::inference::candle_runtime::CandleRuntime;
use multimodal_runner::inference::model_config::GenerationOptions;
use multimodal_runner::media::SymphoniaCodec;
use multimodal_runner::repository::HubRepository;
use multimodal_runner::telemetry::init_telemetry;
use multimodal_runner::{DispatchRequest, Dispatcher, ModelCache};

#[macro_export]
macro_rules! exit_err {
    ($code:expr, $fmt:expr $(, $arg:expr)*) => {
        {
            error!($fmt $(, $arg)*);
            std::process::exit($code)
        }
    };
}

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long, env, default_value = DEFAULT_CONFIG_FILE)]
    config_file: String,

    /// Model id or friendly name
    #[arg(long, alias = "model_id")]
    model_id: String,

    /// Request payload: text, media paths or both
    #[arg(long)]
    input: String,

    #[arg(long, alias = "max_length", default_value_t = 250)]
    max_length: usize,

    #[arg(long, default_value_t = 0.7)]
    temperature: f64,

    #[arg(long, alias = "top_p", default_value_t = 0.9)]
    top_p: f64,

    #[arg(
        long,
        alias = "trust_remote_code",
        action = ArgAction::Set,
        num_args = 0..=1,
        default_value_t = true,
        default_missing_value = "true"
    )]
    trust_remote_code: bool,

    /// Load models on the CPU with f32 weights
    #[arg(long, alias = "cpu_optimize")]
    cpu_optimize: bool,

    /// Never transfer artifacts, use the local cache only
    #[arg(long, alias = "offline_mode")]
    offline_mode: bool,

    /// Directory holding the model, used before the artifact cache
    #[arg(long, alias = "local_model_path")]
    local_model_path: Option<PathBuf>,

    /// Shorter generation and less logging
    #[arg(long, alias = "fast_mode")]
    fast_mode: bool,

    /// Models to load before the request is handled
    #[arg(long, alias = "preload_models", num_args = 1.., value_delimiter = ',')]
    preload_models: Vec<String>,

    #[arg(long, alias = "batch_size", default_value_t = 1)]
    batch_size: usize,

    /// Configuration options
    #[command(flatten)]
    pub opt_config: <Config as ClapSerde>::Opt,
}

impl Args {
    fn dispatch_request(&self) -> DispatchRequest {
        DispatchRequest {
            model_id: self.model_id.clone(),
            input: self.input.clone(),
            local_model_path: self.local_model_path.clone(),
            options: GenerationOptions {
                max_length: self.max_length,
                temperature: self.temperature,
                top_p: self.top_p,
                cpu_optimize: self.cpu_optimize,
                trust_remote_code: self.trust_remote_code,
                fast_mode: self.fast_mode,
                offline_mode: self.offline_mode,
                batch_size: self.batch_size,
            },
            preload_models: self.preload_models.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let request = args.dispatch_request();
    let config = match Config::load(&args.config_file, args.opt_config) {
        Ok(config) => config,
        Err(err) => {
            init_telemetry(None, false)?;
            exit_err!(1, "{:#}", err);
        }
    };
    init_telemetry(config.log_file(), request.options.fast_mode)?;

    if !request.options.fast_mode {
        info!(
            "Supported features: avx: {}, neon: {}, simd128: {}, f16c: {}",
            candle_core::utils::with_avx(),
            candle_core::utils::with_neon(),
            candle_core::utils::with_simd128(),
            candle_core::utils::with_f16c()
        );
    }

    let cache = ModelCache::new(
        Arc::new(HubRepository::new(config.cache_dir.clone())),
        Arc::new(CandleRuntime::new()),
        config.cache_settings(request.options.offline_mode),
    );
    let dispatcher = Dispatcher::new(
        cache,
        Arc::new(SymphoniaCodec::new()),
        config.audio_output_dir.clone(),
    );

    let worker = tokio::task::spawn_blocking(move || dispatcher.run(&request));
    tokio::select! {
        joined = worker => match joined {
            Ok(Ok(line)) => {
                println!("{line}");
                Ok(())
            }
            Ok(Err(err)) => exit_err!(1, "ERROR: {:#}", err),
            Err(err) => exit_err!(1, "ERROR: dispatch worker failed: {}", err),
        },
        _ = interrupted() => exit_err!(1, "ERROR: Operation cancelled by user"),
    }
}

async fn interrupted() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!("Failed to listen for interrupt signal: {}", e);
        std::future::pending::<()>().await;
    }
}
