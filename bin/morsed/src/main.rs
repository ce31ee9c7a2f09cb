//! ---
//! morse_section: "01-core-functionality"
//! morse_subsection: "binary"
//! morse_type: "source"
//! morse_scope: "code"
//! morse_description: "Binary entrypoint for the relay stages."
//! morse_version: "v0.1.0"
//! morse_owner: "tbd"
//! ---
use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use morse_common::config::{AppConfig, WireFormat};
use morse_common::logging::init_tracing;
use morse_metrics::{new_registry, spawn_http_server, ProcessMetrics, SharedRegistry, StageMetrics};
use morse_msg::MqttTransport;
use morse_signal::{indicator, PulseTiming, SignalPlayer};
use morse_stage::{Encoder, Passthrough, Renderer, Stage, StageKind, StagePlan, StageRunner, StageStats};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

const DEFAULT_CONFIG_PATH: &str = "configs/morse.toml";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Keyboard to Morse relay stage",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[arg(long, env = "MORSE_BROKER_HOST", help = "Override broker host")]
    broker_host: Option<String>,

    #[arg(long, help = "Override broker port")]
    broker_port: Option<u16>,

    #[arg(long, value_name = "MS", help = "Override the signal base unit in milliseconds")]
    unit_ms: Option<u64>,

    #[arg(long, value_enum, help = "Override envelope wire format")]
    wire_format: Option<CliWireFormat>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CliWireFormat {
    Marker,
    Json,
}

impl From<CliWireFormat> for WireFormat {
    fn from(value: CliWireFormat) -> Self {
        match value {
            CliWireFormat::Marker => WireFormat::Marker,
            CliWireFormat::Json => WireFormat::Json,
        }
    }
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Read lines from stdin and publish them as source events")]
    Producer,
    #[command(about = "Encode source events into Morse code")]
    Transformer,
    #[command(about = "Play encoded events on the indicator")]
    Display,
    #[command(about = "Print the Morse encoding of TEXT and exit")]
    Encode { text: Vec<String> },
    #[command(about = "Validate configuration and print the effective settings")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from(DEFAULT_CONFIG_PATH));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let mut config = loaded.config;
    apply_overrides(&mut config, &cli);
    config.validate().context("invalid configuration after CLI overrides")?;
    let load_duration = load_started.elapsed();

    let kind = match cli.command {
        Commands::Producer => StageKind::Producer,
        Commands::Transformer => StageKind::Transformer,
        Commands::Display => StageKind::Consumer,
        Commands::Encode { text } => {
            println!("{}", morse_signal::encode(&text.join(" ")));
            return Ok(());
        }
        Commands::CheckConfig => {
            match &loaded.source {
                Some(path) => println!("# loaded from {}", path.display()),
                None => println!("# built-in defaults"),
            }
            print!(
                "{}",
                toml::to_string_pretty(&config).context("failed to render configuration")?
            );
            return Ok(());
        }
    };

    init_tracing(&format!("morsed-{}", kind), &config.logging)?;
    match &loaded.source {
        Some(path) => info!(path = %path.display(), "configuration loaded"),
        None => info!("no configuration file found; using defaults"),
    }

    let registry = new_registry();
    let process_metrics = ProcessMetrics::new(registry.clone())?;
    process_metrics.observe_config_load(load_duration.as_secs_f64());
    process_metrics.inc_start();
    process_metrics.set_build_info(env!("CARGO_PKG_VERSION"), kind.as_str());

    let metrics_server = if config.metrics.enabled {
        info!(address = %config.metrics.listen, "metrics exporter enabled");
        Some(spawn_http_server(registry.clone(), config.metrics.listen)?)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    let stats = run_stage(kind, &config, process_metrics.registry()).await?;
    info!(stage = %kind, received = stats.received, published = stats.published, duplicates = stats.duplicates, "stage finished");

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }
    Ok(())
}

fn apply_overrides(config: &mut AppConfig, cli: &Cli) {
    if let Some(host) = &cli.broker_host {
        config.broker.host = host.clone();
    }
    if let Some(port) = cli.broker_port {
        config.broker.port = port;
    }
    if let Some(unit) = cli.unit_ms {
        config.timing.unit = Duration::from_millis(unit);
        config.timing.wpm = None;
    }
    if let Some(format) = cli.wire_format {
        config.broker.wire_format = format.into();
    }
}

async fn run_stage(kind: StageKind, config: &AppConfig, registry: SharedRegistry) -> Result<StageStats> {
    let plan = StagePlan::for_kind(kind, config);
    let transport = MqttTransport::connect(&config.broker, plan.connect_options());
    let metrics = StageMetrics::new(&registry, kind.as_str())?;
    let wire_format = config.broker.wire_format;

    match kind {
        StageKind::Producer => {
            let runner = StageRunner::new(plan, transport, Passthrough, wire_format);
            drive(runner.with_metrics(metrics), Some(spawn_stdin_reader())).await
        }
        StageKind::Transformer => {
            let stage = Encoder::new(config.transformer.mirror_upstream_offline);
            let runner = StageRunner::new(plan, transport, stage, wire_format);
            drive(runner.with_metrics(metrics), None).await
        }
        StageKind::Consumer => {
            let timing = PulseTiming::from_config(&config.timing)?;
            let player = SignalPlayer::new(indicator::from_kind(config.display.indicator), timing);
            info!(unit_ms = timing.unit().as_millis() as u64, "signal player ready");
            let runner = StageRunner::new(plan, transport, Renderer::new(player), wire_format);
            drive(runner.with_metrics(metrics), None).await
        }
    }
}

async fn drive<S: Stage + 'static>(
    runner: StageRunner<MqttTransport, S>,
    input: Option<mpsc::Receiver<String>>,
) -> Result<StageStats> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    let mut task = tokio::spawn(runner.run(input, shutdown_rx));

    tokio::select! {
        result = &mut task => return result.context("stage task join failure")?,
        signal = signal::ctrl_c() => {
            if let Err(err) = signal {
                warn!(error = %err, "failed to listen for ctrl-c; shutting down");
            } else {
                info!("ctrl-c received; shutting down");
            }
        }
    }
    let _ = shutdown_tx.send(());
    task.await.context("stage task join failure")?
}

fn spawn_stdin_reader() -> mpsc::Receiver<String> {
    let (tx, rx) = mpsc::channel(32);
    tokio::spawn(async move {
        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if tx.send(line).await.is_err() {
                        break;
                    }
                }
                Ok(None) => break,
                Err(err) => {
                    warn!(error = %err, "stdin read failed");
                    break;
                }
            }
        }
    });
    rx
}
