//! Duplex CLI: hands-free voice conversation with barge-in.
//!
//! Usage:
//!   cargo run -p duplex-cli -- [--config duplex.toml] [--dry-run] [--no-speaker]
//!   cargo run -p duplex-cli -- --devices
//!
//! Speak, pause, and the assistant answers. Start talking while it answers and it
//! stops mid-sentence and listens. Ctrl+C to quit.

use anyhow::{bail, Context};
use duplex_voice::{
    list_devices, AudioSink, Backends, BotState, CpalSource, EchoGenerator, Generator,
    HttpRecognizer, NullSink, OllamaGenerator, PiperSynthesizer, Recognizer, RodioSink,
    SharedState, SilenceSynthesizer, SilentRecognizer, Synthesizer, VoiceConfig, VoicePipeline,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Default)]
struct Args {
    config: Option<PathBuf>,
    devices: bool,
    dry_run: bool,
    no_speaker: bool,
}

fn parse_args() -> anyhow::Result<Option<Args>> {
    let mut parsed = Args::default();
    let mut args = std::env::args().skip(1);
    while let Some(a) = args.next() {
        match a.as_str() {
            "--config" => {
                parsed.config = Some(args.next().context("--config needs a path")?.into())
            }
            "--devices" => parsed.devices = true,
            "--dry-run" => parsed.dry_run = true,
            "--no-speaker" => parsed.no_speaker = true,
            "-h" | "--help" => return Ok(None),
            other => bail!("unknown argument: {}", other),
        }
    }
    Ok(Some(parsed))
}

fn print_usage() {
    eprintln!("duplex - voice conversation with barge-in");
    eprintln!("  --config PATH   TOML config (default: $DUPLEX_CONFIG or config/duplex.toml)");
    eprintln!("  --devices       List audio devices as JSON and exit");
    eprintln!("  --dry-run       No network or Piper: echo replies, silent clips");
    eprintln!("  --no-speaker    Time playback instead of using the output device");
    eprintln!();
    eprintln!("Environment: DUPLEX__SECTION__KEY overrides any config value;");
    eprintln!("STT_API_KEY or OPENAI_API_KEY enables recognition.");
}

fn recognizer(config: &VoiceConfig, dry_run: bool) -> Arc<dyn Recognizer> {
    if dry_run {
        return Arc::new(SilentRecognizer::new());
    }
    match HttpRecognizer::from_config(&config.recognition) {
        Ok(r) => {
            info!("👂 Recognition: {} ({})", r.endpoint(), r.model);
            Arc::new(r)
        }
        Err(e) => {
            warn!("Recognition disabled, nothing will be understood: {}", e);
            Arc::new(SilentRecognizer::new())
        }
    }
}

fn generator(config: &VoiceConfig, dry_run: bool) -> Arc<dyn Generator> {
    if dry_run {
        info!("🧠 Generation: echo");
        return Arc::new(EchoGenerator);
    }
    let g = OllamaGenerator::from_config(&config.generation);
    info!("🧠 Generation: {} ({})", g.endpoint(), g.model);
    Arc::new(g)
}

fn synthesizer(config: &VoiceConfig, dry_run: bool) -> Arc<dyn Synthesizer> {
    if dry_run {
        return Arc::new(SilenceSynthesizer::default());
    }
    match PiperSynthesizer::from_config(&config.synthesis) {
        Ok(p) => {
            info!("🗣️ Synthesis: Piper ({})", p.model.display());
            Arc::new(p)
        }
        Err(e) => {
            warn!("Synthesis: silent clips ({})", e);
            Arc::new(SilenceSynthesizer::default())
        }
    }
}

fn sink(config: &VoiceConfig, no_speaker: bool) -> Arc<dyn AudioSink> {
    if no_speaker {
        return Arc::new(NullSink::new());
    }
    match RodioSink::open_default(config.synthesis.volume) {
        Ok(s) => Arc::new(s),
        Err(e) => {
            warn!("No output device, playback is timed only: {}", e);
            Arc::new(NullSink::new())
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let Some(args) = parse_args()? else {
        print_usage();
        return Ok(());
    };

    let devices = list_devices().context("listing audio devices")?;
    if args.devices {
        println!("{}", serde_json::to_string_pretty(&devices)?);
        return Ok(());
    }
    if !devices.has_input() {
        bail!("no default input device; run with --devices to see what is available");
    }
    info!(
        "🔊 Devices: input {}, output {}",
        devices.default_input.as_deref().unwrap_or("-"),
        devices.default_output.as_deref().unwrap_or("-")
    );

    let config = match &args.config {
        Some(path) => VoiceConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => VoiceConfig::load().context("loading config")?,
    };

    let backends = Backends {
        source: Box::new(CpalSource::new(config.audio.sample_rate)),
        recognizer: recognizer(&config, args.dry_run),
        generator: generator(&config, args.dry_run),
        synthesizer: synthesizer(&config, args.dry_run),
        sink: sink(&config, args.no_speaker || args.dry_run),
    };

    let shared = SharedState::new();
    let mut transitions = shared.subscribe();
    let handle = VoicePipeline::start(config, shared.clone(), backends)
        .context("starting voice pipeline")?;

    let reporter = tokio::spawn(async move {
        loop {
            match transitions.recv().await {
                // Transitions themselves are logged by the state machine.
                Ok(t) if t.to == BotState::Speaking => {
                    if let Some(latency) = shared.last_turn_latency() {
                        info!("⏱️ Turn latency: {}ms", latency.as_millis());
                    }
                }
                Ok(_) => {}
                Err(RecvError::Lagged(n)) => {
                    warn!("State reporter lagged, {} transitions missed", n)
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    info!("🎤 Listening... (Ctrl+C to stop)");
    tokio::signal::ctrl_c().await.context("waiting for Ctrl+C")?;

    handle.shutdown().await;
    reporter.abort();
    info!("👋 Bye");
    Ok(())
}
