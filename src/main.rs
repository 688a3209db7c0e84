use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use localscribe::audio;
use localscribe::config::{self, Config, Overrides};
use localscribe::last::{self, Unit};
use localscribe::record;

/// Environment variable overriding the log filter.
const LOG_ENV_VAR: &str = "LOCALSCRIBE_LOG";

#[derive(Parser)]
#[command(name = "localscribe")]
#[command(about = "Live microphone transcription with transcript metadata")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Record live transcription from the microphone
    Record(RecordArgs),
    /// Print transcript lines from the last N minutes/hours/days/meetings
    Last(LastArgs),
}

#[derive(Args)]
struct RecordArgs {
    /// Path to config file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// WebSocket server URL
    #[arg(short, long)]
    server: Option<String>,

    /// API key for authentication
    #[arg(long)]
    api_key: Option<String>,

    /// Output directory for transcripts
    #[arg(short = 'd', long)]
    output_dir: Option<String>,

    /// Filename template (e.g. transcript_%Y%m%d_%H%M%S.txt)
    #[arg(short = 't', long)]
    template: Option<String>,

    /// Output file path (overrides directory and template)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Audio gain multiplier
    #[arg(short, long)]
    gain: Option<f64>,

    /// Audio input device index (-1 = default device)
    #[arg(long, allow_negative_numbers = true)]
    device: Option<i32>,

    /// Pause streaming on VAD end-of-turn detection
    #[arg(long)]
    vad_pause: bool,

    /// Silence threshold for line breaks (seconds)
    #[arg(long)]
    pause_threshold: Option<f64>,

    /// Reset the connection after this many seconds of dead air (0 = off)
    #[arg(long)]
    dead_air_reset: Option<f64>,

    /// Enable debug output
    #[arg(long)]
    debug: bool,

    /// List available audio input devices and exit
    #[arg(short, long)]
    list_devices: bool,

    /// Heartbeat timestamp interval in seconds (0 to disable)
    #[arg(long)]
    heartbeat: Option<u64>,

    /// Enable Zoom meeting detection
    #[arg(long)]
    zoom: bool,

    /// Enable Google Meet detection
    #[arg(long)]
    meet: bool,
}

#[derive(Args)]
struct LastArgs {
    /// Transcription directory (overrides $TRANSCRIPTION_DIR)
    #[arg(long)]
    dir: Option<String>,

    /// Keep all metadata lines instead of hiding them
    #[arg(long)]
    keepmeta: bool,

    /// Remove datestamps from the start of legacy lines
    #[arg(long)]
    trimdate: bool,

    /// Query as of "YYYY/MM/DD HH:MM:SS TZ" instead of now
    #[arg(long)]
    asof: Option<String>,

    /// Window size
    n: u32,

    /// Window unit: minutes, hours, days, weeks, months, or meetings
    #[arg(value_parser = parse_unit)]
    unit: Unit,
}

fn parse_unit(s: &str) -> Result<Unit, String> {
    s.parse().map_err(|e: anyhow::Error| e.to_string())
}

fn init_logging(debug: bool) -> Result<()> {
    let default = if debug {
        "localscribe=debug"
    } else {
        "localscribe=info"
    };

    // LOCALSCRIBE_LOG overrides the level implied by --debug.
    let filter = EnvFilter::builder()
        .with_env_var(LOG_ENV_VAR)
        .with_default_directive(default.parse()?)
        .from_env()?;

    // stdout carries the live transcript; logs go to stderr.
    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr).with_ansi(false))
        .with(filter)
        .init();

    Ok(())
}

async fn cmd_record(args: RecordArgs) -> Result<()> {
    if args.list_devices {
        let devices = audio::list_devices().context("Failed to list devices")?;
        println!("Available audio input devices:");
        println!();
        for device in devices {
            println!("  {device}");
        }
        return Ok(());
    }

    let cfg = match config::find_config_file(args.config.as_deref()) {
        Some(path) => Config::load_from(&path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };

    let overrides = Overrides {
        server_url: args.server,
        api_key: args.api_key,
        output_dir: args.output_dir,
        filename_template: args.template,
        gain: args.gain,
        device_index: args.device,
        vad_pause: args.vad_pause.then_some(true),
        pause_threshold: args.pause_threshold,
        dead_air_reset: args.dead_air_reset,
        debug: args.debug.then_some(true),
        heartbeat_interval: args.heartbeat,
        zoom_detection: args.zoom.then_some(true),
        meet_detection: args.meet.then_some(true),
    };

    let cfg = cfg.merge(&overrides);
    cfg.validate().context("Invalid configuration")?;

    record::run(cfg, args.output).await
}

fn cmd_last(args: LastArgs) -> Result<()> {
    let opts = last::Options {
        count: args.n,
        unit: args.unit,
        dir: args.dir,
        keep_meta: args.keepmeta,
        trim_date: args.trimdate,
        as_of: args.asof,
    };

    let mut stdout = std::io::stdout().lock();
    last::run(&opts, &mut stdout)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let debug = matches!(&cli.command, Commands::Record(args) if args.debug);
    init_logging(debug)?;

    match cli.command {
        Commands::Record(args) => cmd_record(args).await,
        Commands::Last(args) => cmd_last(args),
    }
}
