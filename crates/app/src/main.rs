use std::{path::PathBuf, sync::Arc, thread, time::Duration};

use beatlight_core::{
    AppConfig, LightShow, LoggingBridge, MemoryLink, OutputFrame, SerialLink, SyntheticSource,
};
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

const SAMPLE_RATE: u32 = 44_100;
const FFT_SIZE: usize = 16_384;

fn main() -> beatlight_core::Result<()> {
    init_tracing();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            port,
            seconds,
            tempo,
        } => run_show(config.as_ref(), port, seconds, tempo),
        Commands::InitConfig { output } => init_config(&output),
    }
}

fn run_show(
    config_path: Option<&PathBuf>,
    port: Option<PathBuf>,
    seconds: u64,
    tempo: f32,
) -> beatlight_core::Result<()> {
    let mut config = match config_path {
        Some(path) => AppConfig::load(path)?,
        None => AppConfig::default(),
    };
    let source = SyntheticSource::new(SAMPLE_RATE, FFT_SIZE, tempo)?;
    config.analysis.bin_hz = source.bin_hz();
    tracing::info!(
        ?config_path,
        ?port,
        seconds,
        tempo,
        bin_hz = config.analysis.bin_hz,
        "starting light show"
    );

    let bridge = Arc::new(LoggingBridge);
    match port {
        Some(port) => {
            let show = LightShow::new(config, source, bridge, SerialLink::new(port))?;
            play(&show, seconds)
        }
        None => {
            let link = MemoryLink::new();
            let show = LightShow::new(config, source, bridge, link.clone())?;
            play(&show, seconds)?;
            let frames = OutputFrame::decode_session(&link.bytes())?;
            let flushes = frames
                .iter()
                .filter(|frame| matches!(frame, OutputFrame::Flush))
                .count();
            tracing::info!(frames = frames.len(), flushes, "dry run finished");
            Ok(())
        }
    }
}

fn play(show: &LightShow, seconds: u64) -> beatlight_core::Result<()> {
    show.enable()?;
    thread::sleep(Duration::from_secs(seconds));
    let stopped = show.disable();
    if let Some(fault) = show.take_fault() {
        tracing::error!(%fault, "light output failed during the show");
    }
    stopped
}

fn init_config(output: &PathBuf) -> beatlight_core::Result<()> {
    tracing::info!(?output, "writing default configuration");
    AppConfig::default().save(output)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .try_init();
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Audio-reactive LED matrix and smart bulb driver", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the light show against a synthetic drum loop.
    Run {
        /// JSON configuration file. Defaults are used when omitted.
        #[arg(short, long)]
        config: Option<PathBuf>,
        /// Serial device of the LED controller. Frames stay in memory when
        /// omitted.
        #[arg(short, long)]
        port: Option<PathBuf>,
        /// How long to run before shutting down.
        #[arg(short, long, default_value_t = 10)]
        seconds: u64,
        /// Tempo of the synthetic drum loop.
        #[arg(short, long, default_value_t = 120.0)]
        tempo: f32,
    },
    /// Write the default configuration to a file.
    InitConfig {
        /// Destination path for the configuration.
        output: PathBuf,
    },
}
