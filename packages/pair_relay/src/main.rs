use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::prelude::*;

use pair_relay::client::{ClientEvent, RelayClient};
use pair_relay::config::{
    ClientConfig, DEFAULT_CONFIG_FILE, FileConfig, RelayConfig, load_config,
};
use pair_relay::protocol::AudioType;
use pair_relay::server::RelayServer;
use pair_relay::session_store::Role;

#[derive(Parser)]
#[command(name = "pair-relay")]
#[command(about = "Pairing relay for askers and helpers")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the relay server in the foreground
    Serve(ServeArgs),

    /// Connect to a relay as an interactive peer
    Connect(ConnectArgs),
}

#[derive(Parser)]
struct ServeArgs {
    /// Host to bind to
    #[arg(short = 'b', long, env = "WS_HOST")]
    host: Option<String>,

    /// Port for the relay
    #[arg(short, long, env = "WS_PORT")]
    port: Option<u16>,

    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[derive(Clone, Copy, ValueEnum)]
enum RoleArg {
    Asker,
    Helper,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Asker => Role::Asker,
            RoleArg::Helper => Role::Helper,
        }
    }
}

#[derive(Parser)]
struct ConnectArgs {
    /// Role to take once connected
    #[arg(short, long, value_enum)]
    role: RoleArg,

    /// Asker UID to pair with (helpers only)
    #[arg(long)]
    pair_with: Option<String>,

    /// Relay WebSocket URL
    #[arg(short, long, env = "WS_SERVER_URL")]
    url: Option<String>,

    /// Resume a previous session
    #[arg(long)]
    uid: Option<String>,

    /// Configuration file
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Enable debug logging
    #[arg(short, long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Serve(args) => run_server(args).await,
        Commands::Connect(args) => run_client(args).await,
    }
}

fn init_tracing(debug: bool) {
    let default_directive = if debug {
        "pair_relay=debug,tower_http=debug,info"
    } else {
        "pair_relay=info,tower_http=info,warn"
    };
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_directive));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(env_filter)
        .init();
}

fn load_file_config(path: &Path) -> Result<FileConfig> {
    load_config(path)
        .extract()
        .with_context(|| format!("Invalid configuration in {}", path.display()))
}

async fn run_server(args: ServeArgs) -> Result<()> {
    init_tracing(args.debug);

    let mut file_config = load_file_config(&args.config)?;
    if let Some(host) = args.host {
        file_config.server.host = host;
    }
    if let Some(port) = args.port {
        file_config.server.port = port;
    }
    let config = RelayConfig::from_file(&file_config);

    info!(
        ttl_secs = config.session_ttl.as_secs(),
        heartbeat_secs = config.heartbeat_interval.as_secs(),
        "Starting pair relay"
    );
    let server = RelayServer::bind(&config).await?;
    info!("Health check at http://{}/health", server.local_addr());

    tokio::signal::ctrl_c()
        .await
        .context("Failed to install Ctrl+C handler")?;
    info!("Received shutdown signal, closing connections...");

    server.shutdown();
    server.wait().await?;
    info!("Relay stopped");
    Ok(())
}

async fn run_client(args: ConnectArgs) -> Result<()> {
    init_tracing(args.debug);

    let file_config = load_file_config(&args.config)?;
    let config = ClientConfig::from_file(&file_config.client);
    let role = Role::from(args.role);
    if role == Role::Asker && args.pair_with.is_some() {
        warn!("--pair-with is ignored for askers");
    }

    let client = RelayClient::new(config);
    let events = client.subscribe();
    let printer = tokio::spawn(print_events(events));

    let uid = client
        .connect(role, args.pair_with, args.url, args.uid)
        .await
        .context("Failed to connect to relay")?;
    println!("Your UID: {uid}");
    match role {
        Role::Asker => println!("Type a question and press enter. /quit to leave."),
        Role::Helper => println!("Type an answer and press enter. /quit to leave."),
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match run_line(&client, role, line).await {
            Ok(LineOutcome::Continue) => {}
            Ok(LineOutcome::Quit) => break,
            Err(e) => println!("! {e}"),
        }
    }

    client.disconnect().await;
    printer.abort();
    Ok(())
}

enum LineOutcome {
    Continue,
    Quit,
}

async fn run_line(client: &RelayClient, role: Role, line: &str) -> Result<LineOutcome> {
    let Some(command) = line.strip_prefix('/') else {
        match role {
            Role::Asker => client.send_question(line).await?,
            Role::Helper => client.send_answer(line).await?,
        }
        return Ok(LineOutcome::Continue);
    };

    let words: Vec<&str> = command.split_whitespace().collect();
    match words.as_slice() {
        ["quit"] | ["exit"] => return Ok(LineOutcome::Quit),
        ["reconnect"] => {
            let uid = client.reconnect().await?;
            println!("Reconnected as {uid}");
        }
        ["status"] => {
            let status = client.status().await;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        ["audio", action, kind] => {
            let audio_type = parse_audio_type(kind)?;
            match *action {
                "start" => client.start_audio(audio_type).await?,
                "stop" => client.stop_audio(audio_type).await?,
                other => anyhow::bail!("Unknown audio action: {other}"),
            }
        }
        _ => anyhow::bail!("Commands: /audio start|stop mic|system, /reconnect, /status, /quit"),
    }
    Ok(LineOutcome::Continue)
}

fn parse_audio_type(kind: &str) -> Result<AudioType> {
    match kind {
        "mic" => Ok(AudioType::Mic),
        "system" => Ok(AudioType::System),
        other => anyhow::bail!("Unknown audio type: {other}"),
    }
}

async fn print_events(mut events: broadcast::Receiver<ClientEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(skipped = n, "Event printer lagged");
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => return,
        };
        match event {
            ClientEvent::Connected { uid } => println!("* connected as {uid}"),
            ClientEvent::Reconnected {
                uid, paired_with, ..
            } => match paired_with {
                Some(partner) => println!("* resumed {uid}, paired with {partner}"),
                None => println!("* resumed {uid}"),
            },
            ClientEvent::Disconnected => println!("* disconnected"),
            ClientEvent::Reconnecting { attempt, delay } => {
                println!("* reconnecting (attempt {attempt}) in {}ms", delay.as_millis())
            }
            ClientEvent::ReconnectFailed { reason } => {
                println!("* gave up reconnecting: {reason}. Use /reconnect to retry.")
            }
            ClientEvent::RoleSet { role, .. } => println!("* role set to {role}"),
            ClientEvent::Paired {
                paired_with_uid, ..
            } => println!("* paired with {paired_with_uid}"),
            ClientEvent::QuestionReceived { question, from } => println!("[{from}] Q: {question}"),
            ClientEvent::AnswerReceived { answer, from } => println!("[{from}] A: {answer}"),
            ClientEvent::PartnerDisconnected { reconnect_window } => {
                println!("* partner disconnected, may return within {reconnect_window}s")
            }
            ClientEvent::PartnerReconnected { partner_uid } => {
                println!("* partner {partner_uid} is back")
            }
            ClientEvent::AudioStarted { audio_type, from } => {
                println!("* {from} started {audio_type} audio")
            }
            ClientEvent::AudioStopped { audio_type, from } => {
                println!("* {from} stopped {audio_type} audio")
            }
            // Audio payloads are not rendered by the line client
            ClientEvent::AudioReceived { .. } | ClientEvent::AudioFrame { .. } => {}
            ClientEvent::ServerError { error } => println!("! relay: {error}"),
            ClientEvent::TransportError { error } => println!("! transport: {error}"),
        }
    }
}
