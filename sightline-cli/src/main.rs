//! Sightline CLI Application

use anyhow::{Context, Result};
use bytes::Bytes;
use clap::{Parser, Subcommand};
use rand::Rng;
use sightline_core::prelude::*;
use sightline_core::{RtcTransportFactory, SampleCapture, SampleTrack};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    /// JSON session config; missing fields take defaults
    #[arg(short, long, env = "SIGHTLINE_CONFIG")]
    config: Option<PathBuf>,

    /// Log filter (e.g. "sightline=debug"), overrides RUST_LOG
    #[arg(long)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a loopback call between two in-process participants
    Demo {
        /// Seconds to keep the call up before hanging up
        #[arg(long, default_value = "10")]
        duration: u64,

        /// Keep the configured STUN servers instead of host candidates only
        #[arg(long)]
        stun: bool,

        /// Responder sends a camera track too
        #[arg(long)]
        responder_video: bool,
    },

    /// Print the effective configuration
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = match &cli.log {
        Some(directive) => tracing_subscriber::EnvFilter::new(directive),
        None => tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("sightline=info")),
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = load_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Demo {
            duration,
            stun,
            responder_video,
        } => {
            handle_demo(config, Duration::from_secs(duration), stun, responder_video).await?;
        }
        Commands::Config => {
            println!("{}", serde_json::to_string_pretty(&config)?);
        }
    }

    Ok(())
}

fn load_config(path: Option<&PathBuf>) -> Result<SessionConfig> {
    let Some(path) = path else {
        return Ok(SessionConfig::default());
    };
    let json = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    SessionConfig::from_json(&json).with_context(|| format!("loading config {}", path.display()))
}

/// One side of the loopback call
struct Side {
    label: &'static str,
    service: CallService,
    capture: Arc<SampleCapture>,
    observer: Arc<EventObserver>,
}

impl Side {
    fn new(label: &'static str, config: SessionConfig, relay: Arc<MemoryRelay>) -> Result<Self> {
        let capture = Arc::new(SampleCapture::new());
        let service = CallService::builder()
            .with_config(config)
            .with_relay(relay)
            .with_capture(capture.clone())
            .with_transports(Arc::new(RtcTransportFactory::new()))
            .build()?;
        Ok(Self {
            label,
            service,
            capture,
            observer: Arc::new(EventObserver::default()),
        })
    }

    fn print_events(&self) -> JoinHandle<()> {
        let label = self.label;
        let mut events = self.observer.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(event) => println!("[{label}] {}", describe(&event)),
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Event printer lagging");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

async fn handle_demo(
    mut config: SessionConfig,
    duration: Duration,
    stun: bool,
    responder_video: bool,
) -> Result<()> {
    if !stun {
        config.ice_servers.clear();
    }

    let relay = Arc::new(MemoryRelay::new());
    let requester = Side::new("requester", config.clone(), relay.clone())?;
    let volunteer = Side::new("volunteer", config, relay)?;
    let printers = [requester.print_events(), volunteer.print_events()];

    let call_id = CallId::new();
    let requester_id = ParticipantId::new(format!("requester-{}", random_word()));
    let volunteer_id = ParticipantId::new(format!("volunteer-{}", random_word()));
    println!("Call {call_id}: {requester_id} -> {volunteer_id}");

    let volunteer_params =
        SessionParams::responder(volunteer_id.clone(), requester_id.clone(), call_id.clone())
            .with_local_video(responder_video);
    let (requester_call, volunteer_call) = tokio::join!(
        requester.service.initiate_call(
            requester_id,
            volunteer_id,
            call_id,
            requester.observer.clone()
        ),
        volunteer
            .service
            .start_session(volunteer_params, volunteer.observer.clone()),
    );
    let requester_call = requester_call?;
    let volunteer_call = volunteer_call?;

    let pumps: Vec<JoinHandle<()>> = requester
        .capture
        .tracks()
        .into_iter()
        .chain(volunteer.capture.tracks())
        .map(pump_samples)
        .collect();

    tokio::select! {
        () = tokio::time::sleep(duration) => {}
        () = requester_call.closed() => {}
        () = volunteer_call.closed() => {}
        result = tokio::signal::ctrl_c() => result?,
    }

    println!(
        "requester: {}",
        serde_json::to_string(&requester_call.snapshot())?
    );
    println!(
        "volunteer: {}",
        serde_json::to_string(&volunteer_call.snapshot())?
    );

    requester_call.end_call().await;
    volunteer_call.closed().await;

    for pump in pumps {
        pump.abort();
    }
    for printer in printers {
        printer.abort();
    }
    println!("Call ended");
    Ok(())
}

/// Feed a track with filler frames at 50 fps until it stops
fn pump_samples(track: Arc<SampleTrack>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let frame = Duration::from_millis(20);
        let mut ticker = tokio::time::interval(frame);
        loop {
            ticker.tick().await;
            if let Err(e) = track.write_sample(Bytes::from_static(&[0u8; 160]), frame).await {
                tracing::debug!(error = %e, "Sample pump stopped");
                break;
            }
        }
    })
}

fn describe(event: &SessionEvent) -> String {
    match event {
        SessionEvent::ConnectionState(state) => format!("connection: {state}"),
        SessionEvent::RemoteStream { kinds, .. } if kinds.is_empty() => {
            "remote stream discarded".to_owned()
        }
        SessionEvent::RemoteStream { kinds, .. } => {
            let kinds: Vec<&str> = kinds.iter().map(|k| k.as_str()).collect();
            format!("remote stream: {}", kinds.join(", "))
        }
        SessionEvent::Error(e) => format!("error: {e}"),
        SessionEvent::Reconnecting(attempt) => format!("reconnecting (attempt {attempt})"),
        SessionEvent::CallEnded => "call ended".to_owned(),
    }
}

fn random_word() -> &'static str {
    const WORDS: &[&str] = &[
        "alpha", "bravo", "charlie", "delta", "echo", "foxtrot", "golf", "hotel", "india",
        "juliet", "kilo", "lima", "mike", "november", "oscar", "papa", "quebec", "romeo", "sierra",
        "tango", "uniform", "victor", "whiskey", "xray", "yankee", "zulu",
    ];
    WORDS[rand::thread_rng().gen_range(0..WORDS.len())]
}
