//! EngineLink - Transport and session layer for cloud-device streaming engines
//!
//! Command line front end: an echo server and a load-generating client that
//! exercise the full stack (version check, framing, heartbeat).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc};
use std::time::{Duration, Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use parking_lot::Mutex;
use serde::Serialize;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use enginelink::config::{self, Config};
use enginelink::handshake::{EngineType, VersionCheck, ENGINE_VERSION};
use enginelink::protocol::{self, MessageType};
use enginelink::session::{BreakReason, NetComm, SessionStats};
use enginelink::transport::{resolve_host, RawConnection, TcpConnection};

/// EngineLink - Framed transport for streaming engines
#[derive(Parser)]
#[command(name = "enginelink")]
#[command(author = "EngineLink Contributors")]
#[command(version)]
#[command(about = "Framed, sequenced transport between a cloud engine and its agent", long_about = None)]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run an echo server
    Server {
        /// Port to listen on
        #[arg(short, long)]
        port: Option<u16>,

        /// Engine type to announce
        #[arg(short, long)]
        engine: Option<EngineType>,
    },

    /// Connect to a server and measure echo throughput
    Client {
        /// Server address to connect to
        #[arg(short, long)]
        server: String,

        /// Server port
        #[arg(short, long)]
        port: Option<u16>,

        /// Engine type expected from the server
        #[arg(short, long)]
        engine: Option<EngineType>,

        /// Messages to send
        #[arg(short = 'n', long, default_value_t = 100)]
        count: usize,

        /// Payload size of each message in bytes
        #[arg(long, default_value_t = 4096)]
        size: usize,

        /// Message type to send
        #[arg(short = 't', long = "type", default_value = "gl")]
        message_type: MessageType,

        /// Seconds to wait for all echoes
        #[arg(long, default_value_t = 30)]
        wait: u64,

        /// Print the report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show current configuration
    Config {
        /// Generate sample configuration
        #[arg(long)]
        generate: bool,

        /// Output path for generated config
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Show protocol information
    Info,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Load configuration
    let config = if let Some(config_path) = &cli.config {
        Config::load(config_path)?
    } else {
        Config::load_default().unwrap_or_default()
    };

    // Initialize logging
    let filter = if cli.verbose || config.general.verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::new("info")
    };

    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(filter)
        .init();

    match cli.command {
        Commands::Server { port, engine } => {
            let mut config = config;
            if let Some(engine) = engine {
                config.handshake.engine_type = engine;
            }
            let port = port.unwrap_or(config.network.port);
            run_server(config, port)?;
        }
        Commands::Client {
            server,
            port,
            engine,
            count,
            size,
            message_type,
            wait,
            json,
        } => {
            let mut config = config;
            if let Some(engine) = engine {
                config.handshake.engine_type = engine;
            }
            let port = port.unwrap_or(config.network.port);
            let options = EchoOptions {
                count,
                size,
                message_type,
                wait: Duration::from_secs(wait),
            };
            let report = run_client(&config, &server, port, options)?;
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                print_report(&report);
            }
        }
        Commands::Config { generate, output } => {
            if generate {
                let sample = config::generate_sample_config()?;
                if let Some(path) = output {
                    std::fs::write(&path, &sample)?;
                    println!("Configuration written to: {}", path.display());
                } else {
                    println!("{}", sample);
                }
            } else {
                println!("{}", toml::to_string_pretty(&config)?);
            }
        }
        Commands::Info => {
            print_info(&config);
        }
    }

    Ok(())
}

/// Accept connections and echo every application message back
fn run_server(config: Config, port: u16) -> anyhow::Result<()> {
    let bind = config
        .network
        .bind_address
        .clone()
        .unwrap_or_else(|| "0.0.0.0".to_string());
    let addr = resolve_host(&bind, port)?;
    let listener = TcpConnection::listen(addr)
        .with_context(|| format!("Failed to listen on {}", addr))?;

    tracing::info!(
        "Starting EngineLink echo server on {} ({} {})",
        addr,
        config.handshake.engine_type,
        config.handshake.version
    );
    println!("Listening on {}. Press Ctrl+C to stop.", addr);

    loop {
        let conn = match TcpConnection::accept(&listener) {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!("Accept failed: {}", e);
                continue;
            }
        };
        let peer = conn.peer_addr();
        tracing::info!("Accepted connection from {:?}", peer);
        match serve_connection(&config, conn) {
            Ok(stats) => tracing::info!(
                "Session with {:?} ended: {} bytes in, {} bytes out",
                peer,
                stats.bytes_received,
                stats.bytes_sent
            ),
            Err(e) => tracing::error!("Session with {:?} failed: {:#}", peer, e),
        }
    }
}

fn serve_connection(config: &Config, conn: TcpConnection) -> anyhow::Result<SessionStats> {
    VersionCheck::new(&conn, config.handshake.engine_type)
        .with_version(config.handshake.version.clone())
        .check_server(config.handshake.timeout())?;

    let comm = Arc::new(NetComm::from_config(config));
    comm.set_socket(conn)?;

    for message_type in MessageType::ALL.iter().copied().filter(|t| t.is_application()) {
        let weak = Arc::downgrade(&comm);
        comm.register_hook(
            message_type,
            move |data| {
                let Some(comm) = weak.upgrade() else {
                    return 1;
                };
                match comm.send(message_type, data) {
                    Ok(()) => 0,
                    Err(e) => {
                        tracing::warn!("Echo of {} failed: {}", message_type, e);
                        1
                    }
                }
            },
            false,
        );
    }

    let (tx, rx) = mpsc::channel();
    let tx = Mutex::new(tx);
    comm.set_break_callback(move |reason| {
        let _ = tx.lock().send(reason);
    });
    comm.start()?;

    if let Ok(reason) = rx.recv() {
        tracing::info!("Session {} broken: {}", comm.id(), reason);
    }
    comm.stop();
    Ok(comm.stats())
}

struct EchoOptions {
    count: usize,
    size: usize,
    message_type: MessageType,
    wait: Duration,
}

enum ClientSignal {
    Done,
    Broken(BreakReason),
}

/// Result of one client run
#[derive(Debug, Serialize)]
struct EchoReport {
    server: SocketAddr,
    message_type: MessageType,
    payload_size: usize,
    messages_sent: usize,
    messages_echoed: usize,
    elapsed_ms: u128,
    throughput_mbps: f64,
    broken: Option<String>,
    session: SessionStats,
}

fn run_client(
    config: &Config,
    server: &str,
    port: u16,
    options: EchoOptions,
) -> anyhow::Result<EchoReport> {
    if options.size == 0 {
        anyhow::bail!("Payload size must be positive");
    }
    if !options.message_type.is_application() {
        anyhow::bail!("{} is reserved for the liveness monitor", options.message_type);
    }

    let addr: SocketAddr = if server.contains(':') {
        server.parse()?
    } else {
        resolve_host(server, port)?
    };

    tracing::info!("Connecting to {}", addr);
    let conn = TcpConnection::connect(addr, config.network.connect_timeout())
        .with_context(|| format!("Failed to connect to {}", addr))?;
    VersionCheck::new(&conn, config.handshake.engine_type)
        .with_version(config.handshake.version.clone())
        .check_client(config.handshake.timeout())?;

    let comm = NetComm::from_config(config);
    comm.set_socket(conn)?;

    let (tx, rx) = mpsc::channel();
    let tx = Arc::new(Mutex::new(tx));
    let echoed = Arc::new(AtomicUsize::new(0));
    {
        let echoed = echoed.clone();
        let tx = tx.clone();
        let count = options.count;
        comm.register_hook(
            options.message_type,
            move |_data| {
                if echoed.fetch_add(1, Ordering::SeqCst) + 1 == count {
                    let _ = tx.lock().send(ClientSignal::Done);
                }
                0
            },
            false,
        );
    }
    comm.set_break_callback(move |reason| {
        let _ = tx.lock().send(ClientSignal::Broken(reason));
    });
    comm.start()?;

    let payload: Vec<u8> = (0..options.size).map(|i| (i % 251) as u8).collect();
    let started = Instant::now();
    let mut sent = 0;
    let mut broken = None;
    for _ in 0..options.count {
        if let Err(e) = comm.send(options.message_type, &payload) {
            broken = Some(e.to_string());
            break;
        }
        sent += 1;
    }

    if broken.is_none() && sent > 0 {
        match rx.recv_timeout(options.wait) {
            Ok(ClientSignal::Done) => {}
            Ok(ClientSignal::Broken(reason)) => broken = Some(reason.to_string()),
            Err(_) => tracing::warn!("Timed out waiting for echoes"),
        }
    }
    let elapsed = started.elapsed();
    comm.stop();

    let messages_echoed = echoed.load(Ordering::SeqCst);
    let secs = elapsed.as_secs_f64().max(f64::EPSILON);
    Ok(EchoReport {
        server: addr,
        message_type: options.message_type,
        payload_size: options.size,
        messages_sent: sent,
        messages_echoed,
        elapsed_ms: elapsed.as_millis(),
        throughput_mbps: (messages_echoed * options.size * 2) as f64 * 8.0 / secs / 1e6,
        broken,
        session: comm.stats(),
    })
}

fn print_report(report: &EchoReport) {
    println!("\n========================================");
    println!("  EngineLink Echo Report");
    println!("========================================");
    println!("  Server:     {}", report.server);
    println!("  Type:       {}", report.message_type);
    println!("  Messages:   {} sent, {} echoed", report.messages_sent, report.messages_echoed);
    println!("  Payload:    {} bytes", report.payload_size);
    println!("  Elapsed:    {} ms", report.elapsed_ms);
    println!("  Throughput: {:.2} Mbit/s", report.throughput_mbps);
    println!("  Latency:    {} us", report.session.latency_us);
    if let Some(reason) = &report.broken {
        println!("  Broken:     {}", reason);
    }
    println!("========================================");
}

/// Print protocol information
fn print_info(config: &Config) {
    println!("EngineLink Protocol Information");
    println!("===============================\n");

    println!("Engine Version: {}", ENGINE_VERSION);
    println!("Engine Type: {}", config.handshake.engine_type);
    println!("Default Port: {}", protocol::DEFAULT_PORT);
    println!("Frame Header: {} bytes", protocol::HEADER_SIZE);
    println!(
        "Frame Payload: {} bytes ({} on the wire)",
        config.transport.frame_capacity(),
        config.transport.fragment_size_full
    );
    println!("Max Message: {} bytes", config.transport.max_message_size);
    println!(
        "Integrity Hash: {}",
        if config.transport.integrity_hash { "on" } else { "off" }
    );

    println!("\nMessage Types:");
    for message_type in MessageType::ALL {
        println!("  {:>2}  {}", message_type.as_u8(), message_type.name());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parsing() {
        let cli = Cli::try_parse_from(["enginelink", "info"]);
        assert!(cli.is_ok());

        let cli = Cli::try_parse_from([
            "enginelink", "client", "--server", "127.0.0.1", "-t", "audio", "-n", "5", "--json",
        ])
        .unwrap();
        match cli.command {
            Commands::Client {
                message_type,
                count,
                json,
                ..
            } => {
                assert_eq!(message_type, MessageType::Audio);
                assert_eq!(count, 5);
                assert!(json);
            }
            _ => panic!("expected client command"),
        }

        assert!(Cli::try_parse_from(["enginelink", "client", "-s", "x", "-t", "bogus"]).is_err());
    }
}
