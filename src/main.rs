use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use speech2text_service::{
    create_router, AppState, ChannelEmitter, ServiceConfig, SessionEvent, Speech2TextService,
    StopReason, TracingEmitter, DEFAULT_DURATION_SECS,
};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "speech2text-service", version, about = "Speech-to-text session service")]
struct Cli {
    /// Path to a TOML config file (settings also come from SPEECH2TEXT_* env vars)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the HTTP control service
    Serve {
        /// Listen address override, e.g. 127.0.0.1:8099
        #[arg(long)]
        listen: Option<String>,
    },
    /// Record a single session from the terminal and print the transcript
    Record {
        /// Maximum recording duration in seconds
        #[arg(long, default_value_t = DEFAULT_DURATION_SECS)]
        duration: i64,
        /// Print the transcript without typing it into the focused window
        #[arg(long)]
        preview: bool,
        /// Copy the transcript to the clipboard
        #[arg(long)]
        clipboard: bool,
    },
    /// Print the service status line
    Status,
    /// Check that required tools and the whisper backend are available
    Check,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ServiceConfig::load(cli.config.as_deref())?;

    match cli.command {
        Command::Serve { listen } => serve(config, listen).await,
        Command::Record {
            duration,
            preview,
            clipboard,
        } => record(config, duration, preview, clipboard).await,
        Command::Status => status(config).await,
        Command::Check => check(config).await,
    }
}

async fn serve(config: ServiceConfig, listen: Option<String>) -> Result<()> {
    let addr = listen.unwrap_or_else(|| config.http.listen_addr());
    let service = Arc::new(Speech2TextService::new(config, Arc::new(TracingEmitter)));

    // A backend that cannot even be resolved (missing model or server
    // binary) is a configuration problem; refuse to start. One that is
    // merely not ready yet is only worth a warning.
    let ready = service
        .ensure_backend()
        .await
        .context("whisper backend failed to start")?;
    if ready {
        info!("whisper backend ready at {}", service.backend_url());
    } else {
        warn!(
            "whisper backend not ready at {}, recordings will fail until it is",
            service.backend_url()
        );
    }

    let router = create_router(AppState::new(service.clone()));
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("speech2text service listening on {}", addr);

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;

    info!("shutting down");
    service.shutdown().await;
    Ok(())
}

async fn record(
    config: ServiceConfig,
    duration: i64,
    preview: bool,
    clipboard: bool,
) -> Result<()> {
    let (emitter, mut events) = ChannelEmitter::new();
    let service = Arc::new(Speech2TextService::new(config, Arc::new(emitter)));

    let session_id = service.start_recording(duration, clipboard, preview).await?;
    info!("recording session {} (Ctrl+C stops, twice cancels)", session_id);

    let mut stop_requested = false;
    let mut failure = None;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                if stop_requested {
                    service.cancel_recording(&session_id).await;
                } else {
                    stop_requested = true;
                    service.stop_recording(&session_id).await;
                }
            }
            event = events.recv() => {
                let Some(event) = event else { break };
                match event {
                    SessionEvent::TranscriptionReady { text, .. } => {
                        println!("{}", text);
                        break;
                    }
                    SessionEvent::RecordingError { message, .. } => {
                        failure = Some(message);
                        break;
                    }
                    SessionEvent::RecordingStopped {
                        reason: StopReason::Cancelled,
                        ..
                    } => {
                        info!("recording cancelled");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    service.shutdown().await;
    if let Some(message) = failure {
        anyhow::bail!(message);
    }
    Ok(())
}

async fn status(config: ServiceConfig) -> Result<()> {
    let service = Speech2TextService::new(config, Arc::new(TracingEmitter));
    println!("{}", service.service_status().await);
    service.shutdown().await;
    Ok(())
}

async fn check(config: ServiceConfig) -> Result<()> {
    let service = Speech2TextService::new(config, Arc::new(TracingEmitter));
    let (ok, missing) = service.check_dependencies().await;
    service.shutdown().await;

    if ok {
        println!("all dependencies available");
        return Ok(());
    }
    for item in &missing {
        println!("missing: {}", item);
    }
    std::process::exit(1);
}
