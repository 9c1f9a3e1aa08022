//! `hub-ctl`: drive a hub session from outside the process that owns it.
//!
//! Every subcommand becomes one control request against `POST /control`.
//! Failures print the hub's reason and exit non-zero.

mod server_api;

use anyhow::Result;
use clap::{Parser, Subcommand};
use music_hub_types::{ControlArgs, ControlRequest, ControlVerb};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "hub-ctl", version)]
struct Args {
    /// Base URL of the hub, e.g. http://192.168.1.10:8080
    #[arg(long, default_value = "http://127.0.0.1:8080")]
    server: String,

    /// Tenant whose session the command targets.
    #[arg(long)]
    tenant: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Connect the session to a playback target.
    Join { target: String },
    /// Disconnect and destroy the session.
    Leave,
    /// Acquire a track and add it to the queue.
    Play {
        /// Search text or URL.
        #[arg(required = true, num_args = 1..)]
        query: Vec<String>,
        #[arg(long)]
        requested_by: Option<String>,
        /// Join this target first if the session is not connected.
        #[arg(long)]
        target: Option<String>,
    },
    Pause,
    Resume,
    Skip,
    /// Clear the queue and stop playback.
    Stop,
    /// Toggle repeat of the current track.
    Loop,
    Shuffle,
    /// Print the queue.
    Queue,
    NowPlaying,
    /// List the verbs the hub publishes.
    Verbs,
    /// List every live session.
    Sessions,
}

fn main() -> Result<()> {
    let args = Args::parse();
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    match args.command {
        Command::Verbs => {
            let info = server_api::control_info(&args.server)?;
            println!("control v{}", info.version);
            for verb in info.verbs {
                println!("  {verb}");
            }
            Ok(())
        }
        Command::Sessions => {
            let sessions = server_api::sessions(&args.server)?;
            println!("{}", serde_json::to_string_pretty(&sessions)?);
            Ok(())
        }
        command => {
            let tenant = args
                .tenant
                .ok_or_else(|| anyhow::anyhow!("--tenant is required for this command"))?;
            let Some(request) = build_request(&tenant, command) else {
                return Ok(());
            };
            tracing::debug!(tenant_id = %tenant, verb = %request.verb, "sending control request");
            let response = server_api::dispatch(&args.server, &request)?;
            if !response.ok {
                eprintln!(
                    "{} failed: {}",
                    request.verb,
                    response.reason.as_deref().unwrap_or("unknown error")
                );
                std::process::exit(1);
            }
            match response.data {
                Some(data) => println!("{}", serde_json::to_string_pretty(&data)?),
                None => println!("ok"),
            }
            Ok(())
        }
    }
}

/// Map a session subcommand onto its control request.
fn build_request(tenant: &str, command: Command) -> Option<ControlRequest> {
    let (verb, args) = match command {
        Command::Join { target } => (
            ControlVerb::Join,
            ControlArgs {
                target: Some(target),
                ..ControlArgs::default()
            },
        ),
        Command::Leave => (ControlVerb::Leave, ControlArgs::default()),
        Command::Play {
            query,
            requested_by,
            target,
        } => (
            ControlVerb::Play,
            ControlArgs {
                query: Some(query.join(" ")),
                target,
                requested_by,
            },
        ),
        Command::Pause => (ControlVerb::Pause, ControlArgs::default()),
        Command::Resume => (ControlVerb::Resume, ControlArgs::default()),
        Command::Skip => (ControlVerb::Skip, ControlArgs::default()),
        Command::Stop => (ControlVerb::Stop, ControlArgs::default()),
        Command::Loop => (ControlVerb::LoopToggle, ControlArgs::default()),
        Command::Shuffle => (ControlVerb::Shuffle, ControlArgs::default()),
        Command::Queue => (ControlVerb::QueueQuery, ControlArgs::default()),
        Command::NowPlaying => (ControlVerb::NowPlaying, ControlArgs::default()),
        Command::Verbs | Command::Sessions => return None,
    };
    Some(ControlRequest::new(tenant, verb).with_args(args))
}
