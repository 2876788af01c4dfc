use crate::autonomous;
use crate::classifier::{CompiledModel, Layer, SCHEMA_VERSION};
use crate::collect::collect_from;
use crate::config::{config_path, load_config, save_config, Config, Engine};
use crate::frame::{open_source, Encoding};
use crate::motor::LoggingMotor;
use crate::teleop::TeleopServer;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::atomic::AtomicBool;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rover-pilot", version, about = "Camera car controller")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Serve the control page, commands and the labelled stream
    Teleop {
        /// Listen address
        #[arg(short, long)]
        bind: Option<String>,
        /// Replay images from a directory instead of the camera
        #[arg(long)]
        frames_dir: Option<PathBuf>,
    },
    /// Drive from the on-board classifier
    Autonomous {
        #[arg(short, long, value_enum)]
        engine: Option<Engine>,
        /// Compiled model file
        #[arg(short, long)]
        model: Option<PathBuf>,
        /// Replay images from a directory instead of the camera
        #[arg(long)]
        frames_dir: Option<PathBuf>,
    },
    /// Save labelled frames from a running car
    Collect {
        /// Stream URL, e.g. http://192.168.4.1/stream
        url: String,
        /// Output directory
        #[arg(short, long, default_value = "dataset")]
        out: PathBuf,
        /// Stop after this many frames
        #[arg(short, long)]
        limit: Option<usize>,
    },
    /// Inspect or initialise the configuration file
    Config {
        #[command(subcommand)]
        action: ConfigSubcommand,
    },
    /// Work with compiled models
    Model {
        #[command(subcommand)]
        action: ModelSubcommand,
    },
}

#[derive(Subcommand)]
pub enum ConfigSubcommand {
    /// Print the effective configuration
    Show,
    /// Write the effective configuration back to disk
    Init,
}

#[derive(Subcommand)]
pub enum ModelSubcommand {
    /// Print layer shapes and the arena size a model needs
    Inspect { path: PathBuf },
}

pub fn run_cli() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let cli = Cli::parse();
    execute(cli)
}

pub fn execute(cli: Cli) -> ExitCode {
    let ok = match cli.command {
        Commands::Teleop { bind, frames_dir } => {
            let mut cfg = load_config();
            if let Some(b) = bind {
                cfg.bind = b;
            }
            if frames_dir.is_some() {
                cfg.frames_dir = frames_dir;
            }
            run_teleop(&cfg)
        }
        Commands::Autonomous {
            engine,
            model,
            frames_dir,
        } => {
            let mut cfg = load_config();
            if let Some(e) = engine {
                cfg.engine = e;
            }
            if let Some(m) = model {
                cfg.model_path = m;
            }
            if frames_dir.is_some() {
                cfg.frames_dir = frames_dir;
            }
            run_autonomous(&cfg)
        }
        Commands::Collect { url, out, limit } => match collect_from(&url, &out, limit) {
            Ok(n) => {
                info!(frames = n, dir = %out.display(), "collection finished");
                true
            }
            Err(e) => {
                error!("collection failed: {e}");
                false
            }
        },
        Commands::Config { action } => match action {
            ConfigSubcommand::Show => show_config(&load_config()),
            ConfigSubcommand::Init => {
                save_config(&load_config());
                info!(path = %config_path().display(), "configuration written");
                true
            }
        },
        Commands::Model {
            action: ModelSubcommand::Inspect { path },
        } => inspect_model(&path),
    };
    if ok {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// Set only on shutdown; the loops poll it between passes.
static SHUTDOWN: AtomicBool = AtomicBool::new(false);

fn run_teleop(cfg: &Config) -> bool {
    let source = match open_source(cfg, Encoding::Jpeg) {
        Ok(s) => s,
        Err(e) => {
            error!("startup failed: {e}");
            return false;
        }
    };
    let motor = LoggingMotor::new(cfg.default_speed);
    let mut server = match TeleopServer::bind(cfg, source, motor) {
        Ok(s) => s,
        Err(e) => {
            error!("startup failed: {e}");
            return false;
        }
    };
    server.run(&SHUTDOWN).is_ok()
}

fn run_autonomous(cfg: &Config) -> bool {
    match autonomous::start(cfg, LoggingMotor::new(cfg.default_speed)) {
        Ok(mut pilot) => {
            pilot.run(&SHUTDOWN);
            true
        }
        Err(e) => {
            error!("startup failed: {e}");
            false
        }
    }
}

fn show_config(cfg: &Config) -> bool {
    match serde_json::to_string_pretty(cfg) {
        Ok(text) => {
            println!("{text}");
            true
        }
        Err(e) => {
            error!("failed to encode config: {e}");
            false
        }
    }
}

fn inspect_model(path: &Path) -> bool {
    let model = match CompiledModel::read(path) {
        Ok(m) => m,
        Err(e) => {
            error!("failed to load {}: {e}", path.display());
            return false;
        }
    };
    let (shapes, arena) = match (model.shapes(), model.arena_requirement()) {
        (Ok(s), Ok(a)) => (s, a),
        (Err(e), _) | (_, Err(e)) => {
            error!("invalid model {}: {e}", path.display());
            return false;
        }
    };
    println!("schema {SCHEMA_VERSION}");
    println!(
        "input {}x{}x{}",
        model.input.height, model.input.width, model.input.channels
    );
    for (index, (layer, shape)) in model.layers.iter().zip(&shapes[1..]).enumerate() {
        let kind = match layer {
            Layer::AvgPool { size } => format!("avgpool {size}"),
            Layer::Dense { outputs, relu, .. } => {
                format!("dense {outputs}{}", if *relu { " relu" } else { "" })
            }
        };
        println!(
            "{index}: {kind} -> {}x{}x{}",
            shape.height, shape.width, shape.channels
        );
    }
    println!("arena bytes: {arena}");
    true
}
