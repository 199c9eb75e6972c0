use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::sync::mpsc;
use tracing::info;

use lookout::api::{
    Ammunition, CoordinatorClient, CoordinatorConfig, CreateSessionRequest,
};
use lookout::config::{ClientConfig, IceSettings};
use lookout::protocol::QueueEvent;
use lookout::session::{SessionError, SessionSupervisor};
use lookout::telemetry::logging::{self, LogConfig, LogLevel};

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let cli = Cli::parse();
    logging::init(&LogConfig {
        level: cli.log_level,
    })
    .context("logging setup failed")?;

    let api = CoordinatorClient::new(CoordinatorConfig::new(&cli.coordinator)?)?;

    match cli.command {
        Command::Videos => handle_videos(&api).await,
        Command::Watch(args) => handle_watch(&api, args).await,
    }
}

#[derive(Parser, Debug)]
#[command(
    name = "lookout",
    about = "Queue for a remote video-analysis worker and watch its session",
    version
)]
struct Cli {
    #[arg(
        long,
        global = true,
        env = "LOOKOUT_COORDINATOR_URL",
        default_value = "http://127.0.0.1:8000",
        help = "Base URL of the queue coordinator"
    )]
    coordinator: String,

    #[arg(long, global = true, value_enum, env = "LOOKOUT_LOG", default_value_t = LogLevel::Info)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// List the video files a session can be created for
    Videos,
    /// Create a session, join the worker queue, and watch its events
    Watch(WatchArgs),
}

#[derive(Args, Debug)]
struct WatchArgs {
    /// Video file the worker should process
    #[arg(long)]
    video: String,

    /// Optional caller-chosen session identifier
    #[arg(long)]
    custom_id: Option<String>,

    #[arg(long, default_value_t = 0)]
    atgm: u32,
    #[arg(long, default_value_t = 0)]
    cluster_shells: u32,
    #[arg(long, default_value_t = 0)]
    unitary_shells: u32,
    #[arg(long, default_value_t = 0)]
    fpv_drones: u32,

    #[arg(long, env = "LOOKOUT_STUN_URL")]
    stun_url: Option<String>,
    /// TURN relay the media path is forced through
    #[arg(long, env = "LOOKOUT_TURN_URL")]
    turn_url: Vec<String>,
    #[arg(long, env = "LOOKOUT_TURN_USERNAME", default_value = "")]
    turn_username: String,
    #[arg(long, env = "LOOKOUT_TURN_CREDENTIAL", default_value = "")]
    turn_credential: String,

    /// Candidate gathering bound in milliseconds
    #[arg(long, default_value_t = 5000)]
    gather_timeout_ms: u64,
}

async fn handle_videos(api: &CoordinatorClient) -> anyhow::Result<()> {
    let videos = api.list_videos().await?;
    for video in videos {
        println!("{video}");
    }
    Ok(())
}

async fn handle_watch(api: &CoordinatorClient, args: WatchArgs) -> anyhow::Result<()> {
    let mut ice = IceSettings::default();
    if let Some(stun) = args.stun_url {
        ice.stun_urls = vec![stun];
    }
    ice.turn_urls = args.turn_url;
    ice.turn_username = args.turn_username;
    ice.turn_credential = args.turn_credential;

    let config = ClientConfig {
        ice,
        gather_timeout: Duration::from_millis(args.gather_timeout_ms),
        ..ClientConfig::default()
    };

    let created = api
        .create_session(CreateSessionRequest {
            custom_id: args.custom_id,
            filename: args.video,
            ammunition: Ammunition {
                atgm: args.atgm,
                cluster_shells: args.cluster_shells,
                unitary_shells: args.unitary_shells,
                fpv_drones: args.fpv_drones,
            },
        })
        .await?;
    info!(
        target = "cli",
        session_id = %created.session_id,
        filename = %created.filename,
        "session created"
    );

    let (media_tx, mut media_rx): (lookout::transport::webrtc::MediaSink, _) =
        mpsc::unbounded_channel();
    let (event_tx, mut event_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        while let Some(track) = media_rx.recv().await {
            info!(target = "cli", kind = %track.kind(), "receiving remote video");
        }
    });
    tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            report_event(event);
        }
    });

    let supervisor = Arc::new(SessionSupervisor::new());
    let outcome = tokio::select! {
        result = supervisor.run(api, &created.session_id, media_tx, event_tx, &config) => result,
        _ = tokio::signal::ctrl_c() => {
            info!(target = "cli", "interrupt received; shutting down");
            supervisor.shutdown().await;
            Err(SessionError::Cancelled)
        }
    };

    match outcome {
        Ok(()) => {
            info!(target = "cli", "session ended");
            Ok(())
        }
        Err(SessionError::Cancelled) => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn report_event(event: QueueEvent) {
    match event {
        QueueEvent::QueuePosition { position } => {
            info!(target = "cli", position, "waiting in queue");
        }
        QueueEvent::Assigned { worker_id } => {
            info!(target = "cli", worker_id = %worker_id, "worker assigned");
        }
        QueueEvent::Answer { .. } => {
            info!(target = "cli", "worker answered; establishing media session");
        }
        QueueEvent::Error { reason } => {
            info!(target = "cli", reason = %reason, "coordinator reported failure");
        }
        QueueEvent::Done => {
            info!(target = "cli", "coordinator reported session done");
        }
        QueueEvent::Logs { logs } => {
            info!(
                target = "cli",
                total = logs.total_amount,
                tanks = logs.amount.tanks,
                ifv = logs.amount.ifv,
                apc = logs.amount.apc,
                tactic = %logs.tactic,
                command = %logs.command,
                priority = %logs.priority,
                "detection update"
            );
        }
    }
}
