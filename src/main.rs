use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use voice_duplex::audio::{AudioBackendFactory, AudioSink, AudioSource};
use voice_duplex::http::{create_router, AppState, DefaultLauncher};
use voice_duplex::session::{HttpSessionApi, SessionApi, SessionDeps, KNOWN_CHARACTERS};
use voice_duplex::{Config, VoiceSession};

#[derive(Parser)]
#[command(name = "voice-duplex", version, about = "Full-duplex voice streaming client")]
struct Cli {
    /// Configuration file (without extension)
    #[arg(long, default_value = "config/voice-duplex")]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the local HTTP control API
    Serve {
        /// WAV file used as the microphone
        #[arg(long)]
        input: Option<PathBuf>,
        /// WAV file receiving played audio
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// Talk to a character until Ctrl-C
    Talk {
        #[arg(long)]
        character: Option<String>,
        #[arg(long)]
        input: Option<PathBuf>,
        #[arg(long)]
        output: Option<PathBuf>,
    },
    /// List available characters
    Characters,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = Config::load(&cli.config)?;

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));
    info!("Voice service: {}", cfg.session.base_url);

    match cli.command {
        Command::Serve { input, output } => serve(cfg, input, output).await,
        Command::Talk {
            character,
            input,
            output,
        } => talk(cfg, character, input, output).await,
        Command::Characters => characters(cfg).await,
    }
}

fn endpoints(input: Option<PathBuf>, output: Option<PathBuf>) -> (AudioSource, AudioSink) {
    let source = input.map(AudioSource::File).unwrap_or(AudioSource::Device);
    let sink = output
        .map(AudioSink::File)
        .unwrap_or(AudioSink::Device(None));
    (source, sink)
}

async fn serve(cfg: Config, input: Option<PathBuf>, output: Option<PathBuf>) -> Result<()> {
    let (source, sink) = endpoints(input, output);
    let launcher = DefaultLauncher::new(&cfg, source, sink).context("Failed to build launcher")?;

    let addr = format!("{}:{}", cfg.service.http.bind, cfg.service.http.port);
    let state = AppState::new(cfg, Arc::new(launcher));
    let app = create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("HTTP server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
        })
        .await
        .context("HTTP server failed")?;

    if let Some(mut session) = state.active.lock().await.take_running() {
        let stats = session.stop().await;
        info!("Stopped session {} on shutdown", stats.session_id);
    }
    Ok(())
}

async fn talk(
    cfg: Config,
    character: Option<String>,
    input: Option<PathBuf>,
    output: Option<PathBuf>,
) -> Result<()> {
    let (source, sink) = endpoints(input, output);
    let character = character.unwrap_or_else(|| cfg.session.character.clone());

    let deps = SessionDeps {
        api: Arc::new(HttpSessionApi::new(&cfg.session.base_url)?),
        capture: AudioBackendFactory::capture(&source)?,
        output: AudioBackendFactory::output(&sink, cfg.playback.output_sample_rate)?,
    };

    let mut session = VoiceSession::start(&cfg, &character, deps)
        .await
        .context("Failed to start voice session")?;
    info!("Talking to {} (Ctrl-C to stop)", session.info().character);

    tokio::select! {
        result = tokio::signal::ctrl_c() => {
            if let Err(e) = result {
                warn!("Failed to listen for Ctrl-C: {}", e);
            }
            info!("Stopping");
        }
        _ = session.closed() => warn!("Session ended"),
    }

    let stats = session.stop().await;
    info!(
        "Session {}: {:.1}s, {} frames sent, {} chunks played, {} evicted",
        stats.session_id,
        stats.duration_secs,
        stats.frames_sent,
        stats.chunks_played,
        stats.chunks_evicted
    );

    if let Some(err) = stats.terminal_error {
        anyhow::bail!(err);
    }
    Ok(())
}

async fn characters(cfg: Config) -> Result<()> {
    let api = HttpSessionApi::new(&cfg.session.base_url)?;
    let characters = match api.characters().await {
        Ok(list) => list,
        Err(e) => {
            warn!("Service unavailable ({}), showing known characters", e);
            KNOWN_CHARACTERS.iter().map(|c| c.to_string()).collect()
        }
    };
    for character in characters {
        println!("{}", character);
    }
    Ok(())
}
