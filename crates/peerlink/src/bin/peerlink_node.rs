//! PeerLink node binary
//!
//! Joins the rendezvous topic, lists peers as they come and go, and chats
//! with one peer over a data channel.
//!
//! # Usage
//!
//! ```bash
//! # Connect to a local broker with a random peer ID
//! cargo run --bin peerlink_node -- --broker-host localhost
//!
//! # Mobile preset over TLS, calling a known peer on start
//! cargo run --bin peerlink_node -- \
//!   --preset mobile-network \
//!   --broker-host broker.example.com \
//!   --call peer_1a2b3c4d
//!
//! # TURN relay
//! cargo run --bin peerlink_node -- \
//!   --turn-servers turn:turn.example.com:3478:user:pass
//! ```
//!
//! Stdin commands: `/call <peer>`, `/hangup`, `/peers`, `/status`; any
//! other line is sent as a chat message.

use clap::Parser;
use peerlink::{
    IceServerConfig, MqttTransport, NodeEvent, PeerId, PeerLinkConfig, PeerNode, SessionEvent,
    WebRtcEngine,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// PeerLink node
///
/// Peer discovery and data-channel chat over an MQTT rendezvous topic.
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// TOML configuration file; CLI flags override its values
    #[arg(short, long, env = "PEERLINK_CONFIG")]
    config: Option<PathBuf>,

    /// Configuration preset: mobile-network, lan
    #[arg(long, env = "PEERLINK_PRESET")]
    preset: Option<ConfigPreset>,

    /// Broker hostname
    #[arg(long, env = "PEERLINK_BROKER_HOST")]
    broker_host: Option<String>,

    /// Broker port
    #[arg(long, env = "PEERLINK_BROKER_PORT")]
    broker_port: Option<u16>,

    /// Connect to the broker over TLS
    #[arg(long, env = "PEERLINK_BROKER_TLS")]
    tls: bool,

    /// Broker username
    #[arg(long, env = "PEERLINK_BROKER_USER")]
    username: Option<String>,

    /// Broker password
    #[arg(long, env = "PEERLINK_BROKER_PASSWORD", hide_env_values = true)]
    password: Option<String>,

    /// Shared signaling topic
    #[arg(long, env = "PEERLINK_SIGNALING_TOPIC")]
    signaling_topic: Option<String>,

    /// Telemetry topic
    #[arg(long, env = "PEERLINK_TELEMETRY_TOPIC")]
    telemetry_topic: Option<String>,

    /// Local peer ID (random when omitted)
    #[arg(long, env = "PEERLINK_PEER_ID")]
    peer_id: Option<String>,

    /// Peer to call once connected
    #[arg(long)]
    call: Option<String>,

    /// STUN servers (comma-separated)
    #[arg(long, value_delimiter = ',', env = "PEERLINK_STUN_SERVERS")]
    stun_servers: Vec<String>,

    /// TURN servers (format: turn:host:port:username:password, comma-separated)
    #[arg(long, value_delimiter = ',', env = "PEERLINK_TURN_SERVERS")]
    turn_servers: Vec<String>,

    /// Initial reconnection backoff in milliseconds
    #[arg(long, env = "PEERLINK_RECONNECT_BASE_MS")]
    reconnect_base_ms: Option<u64>,

    /// Maximum reconnection backoff in milliseconds
    #[arg(long, env = "PEERLINK_RECONNECT_MAX_MS")]
    reconnect_max_ms: Option<u64>,

    /// Maximum reconnection attempts before waiting for a network change
    #[arg(long, env = "PEERLINK_RECONNECT_ATTEMPTS")]
    reconnect_attempts: Option<u32>,

    /// Log as JSON lines
    #[arg(long, env = "PEERLINK_LOG_JSON")]
    log_json: bool,
}

/// Configuration preset for quick setup
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum ConfigPreset {
    /// TLS broker, default backoff tuned for cellular links
    MobileNetwork,
    /// Plain TCP broker on the local network, faster aging
    Lan,
}

/// Parse TURN server string (format: turn:host:port:username:password or turns:host:port:username:password)
fn parse_turn_server(s: &str) -> Result<IceServerConfig, String> {
    let parts: Vec<&str> = s.split(':').collect();
    if parts.len() < 5 {
        return Err(format!(
            "Invalid TURN server format: '{}'. Expected: turn:host:port:username:password",
            s
        ));
    }

    let protocol = parts[0];
    if protocol != "turn" && protocol != "turns" {
        return Err(format!(
            "Invalid TURN protocol: '{}'. Expected 'turn' or 'turns'",
            protocol
        ));
    }

    // Password may contain colons
    let credential = parts[4..].join(":");
    Ok(IceServerConfig::turn(
        &format!("{}:{}:{}", protocol, parts[1], parts[2]),
        parts[3],
        &credential,
    ))
}

/// Build the node configuration: file or preset first, then CLI overrides
fn build_config_from_args(args: &Args) -> Result<PeerLinkConfig, Box<dyn std::error::Error>> {
    let host = args.broker_host.clone().unwrap_or_else(|| "localhost".to_string());

    let mut config = match (&args.config, args.preset) {
        (Some(path), _) => {
            info!("Loading configuration from {}", path.display());
            PeerLinkConfig::from_file(path)?
        }
        (None, Some(ConfigPreset::MobileNetwork)) => {
            info!("Using mobile_network preset");
            PeerLinkConfig::mobile_network_preset(&host)
        }
        (None, Some(ConfigPreset::Lan)) => {
            info!("Using lan preset");
            PeerLinkConfig::lan_preset(&host)
        }
        (None, None) => PeerLinkConfig::default(),
    };

    if let Some(host) = &args.broker_host {
        config.broker.host = host.clone();
    }
    if let Some(port) = args.broker_port {
        config.broker.port = port;
    }
    if args.tls {
        config.broker.use_tls = true;
    }
    if let (Some(username), Some(password)) = (&args.username, &args.password) {
        config = config.with_credentials(username, password);
    }
    if let Some(topic) = &args.signaling_topic {
        config.signaling_topic = topic.clone();
    }
    if let Some(topic) = &args.telemetry_topic {
        config.telemetry_topic = topic.clone();
    }
    if let Some(peer_id) = &args.peer_id {
        config = config.with_peer_id(peer_id);
    }
    if let Some(base) = args.reconnect_base_ms {
        config.reconnect.base_delay_ms = base;
    }
    if let Some(max) = args.reconnect_max_ms {
        config.reconnect.max_delay_ms = max;
    }
    if let Some(attempts) = args.reconnect_attempts {
        config.reconnect.max_attempts = attempts;
    }

    let mut ice_servers: Vec<IceServerConfig> = Vec::new();
    for url in &args.stun_servers {
        ice_servers.push(IceServerConfig::stun(url));
    }
    for turn in &args.turn_servers {
        let server = parse_turn_server(turn).map_err(|e| format!("Failed to parse TURN server: {}", e))?;
        info!("Adding TURN server: {:?}", server.urls);
        ice_servers.push(server);
    }
    if !ice_servers.is_empty() {
        config.ice_servers = ice_servers;
    }

    config.validate()?;
    Ok(config)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .thread_name("peerlink-worker")
        .enable_all()
        .build()?;

    runtime.block_on(async_main(args))
}

async fn async_main(args: Args) -> Result<(), Box<dyn std::error::Error>> {
    init_tracing(args.log_json)?;

    info!(version = peerlink::version(), "PeerLink node starting");

    let mut config = build_config_from_args(&args)?;
    let peer_id = match &config.peer_id {
        Some(id) => PeerId::new(id.clone()),
        None => {
            let id = PeerId::random();
            config = config.with_peer_id(id.as_str());
            id
        }
    };

    let transport = MqttTransport::new(config.broker.clone(), &peer_id);
    let engine = WebRtcEngine::new(config.ice_servers.clone(), config.session.clone());
    let (node, mut events) = PeerNode::start(config, Arc::new(transport), Arc::new(engine))?;

    println!("Local peer: {}", node.local_peer_id());

    if let Some(target) = &args.call {
        match node.call(PeerId::new(target.clone())).await {
            Ok(session_id) => println!("Calling {} ({})", target, session_id),
            Err(e) => warn!("Initial call to {} failed: {}", target, e),
        }
    }

    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl+C received, shutting down");
                break;
            }
            event = events.recv() => {
                match event {
                    Some(event) => print_event(&event),
                    None => break,
                }
            }
            line = lines.next_line() => {
                match line {
                    Ok(Some(line)) => handle_line(&node, line.trim()).await,
                    Ok(None) => {
                        info!("stdin closed, shutting down");
                        break;
                    }
                    Err(e) => {
                        error!("Failed to read stdin: {}", e);
                        break;
                    }
                }
            }
        }
    }

    node.shutdown().await?;
    Ok(())
}

async fn handle_line(node: &PeerNode, line: &str) {
    if line.is_empty() {
        return;
    }

    if let Some(target) = line.strip_prefix("/call ") {
        match node.call(PeerId::new(target.trim())).await {
            Ok(session_id) => println!("Calling {} ({})", target.trim(), session_id),
            Err(e) => println!("Call failed: {}", e),
        }
        return;
    }

    match line {
        "/hangup" => {
            if let Err(e) = node.hang_up().await {
                println!("Hang up failed: {}", e);
            }
        }
        "/peers" => {
            let peers = node.peers();
            if peers.is_empty() {
                println!("No peers");
            }
            for (peer_id, entry) in peers {
                println!("  {} {:?}", peer_id, entry.state);
            }
        }
        "/status" => match node.session_status().await {
            Ok(Some(status)) => println!("{:#?}", status),
            Ok(None) => println!("No active session"),
            Err(e) => println!("Status unavailable: {}", e),
        },
        _ if line.starts_with('/') => println!("Unknown command: {}", line),
        text => match node.send_message(text.to_string()).await {
            Ok(outcome) => tracing::debug!("Message {:?}", outcome),
            Err(e) => println!("Send failed: {}", e),
        },
    }
}

fn print_event(event: &NodeEvent) {
    match event {
        NodeEvent::Presence(presence) => {
            println!("[presence] {} is {:?}", presence.peer_id, presence.state);
        }
        NodeEvent::Link(state) => println!("[link] {:?}", state),
        NodeEvent::Session(SessionEvent::Opened { peer, .. }) => {
            println!("[session] channel open with {}", peer);
        }
        NodeEvent::Session(SessionEvent::Closed { peer, .. }) => {
            println!("[session] closed with {}", peer);
        }
        NodeEvent::Session(SessionEvent::Failed { peer, reason, .. }) => {
            println!("[session] failed with {}: {}", peer, reason);
        }
        NodeEvent::Session(SessionEvent::Error { error, .. }) => {
            println!("[session] error: {}", error);
        }
        NodeEvent::Session(SessionEvent::Message { from, payload, .. }) => {
            println!("<{}> {}", from, String::from_utf8_lossy(payload));
        }
        NodeEvent::Session(other) => tracing::debug!("Session event: {:?}", other),
    }
}

fn init_tracing(json: bool) -> Result<(), Box<dyn std::error::Error>> {
    let env_filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info,peerlink=debug"))?;

    let registry = tracing_subscriber::registry().with(env_filter);
    if json {
        registry.with(tracing_subscriber::fmt::layer().json()).try_init()?;
    } else {
        registry.with(tracing_subscriber::fmt::layer()).try_init()?;
    }
    Ok(())
}
