//! dnsconduit - reliable byte streams over recursive DNS
//!
//! The client turns local TCP connections into DNS queries; the server is
//! the authoritative name server for the tunnel domain and forwards every
//! tunnel to a fixed TCP target.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use log::{error, info, warn};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use dnsconduit::{
    optimal_seg_len, AcceptedTunnel, ConnIdGenerator, DnsTunnelServer, ProxiedConnection,
    Responder, TunnelConfig, UdpResolver, SEGMENT_HEADER_LEN,
};

/// Tunnels announced by the responder but not yet picked up
const ACCEPT_QUEUE: usize = 64;

#[derive(Parser)]
#[command(name = "dnsconduit")]
#[command(version = "0.1.0")]
#[command(about = "Reliable byte-stream tunnel over DNS", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(short, long)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Accept local TCP connections and tunnel each one over DNS
    Client {
        /// Recursive resolver to send queries to
        #[arg(short, long)]
        resolver: Option<SocketAddr>,

        /// Tunnel suffix domain
        #[arg(short, long)]
        domain: Option<String>,

        /// Local listen address
        #[arg(short, long, default_value = "127.0.0.1:1080")]
        listen: SocketAddr,
    },

    /// Answer tunnel queries and forward each tunnel to a TCP target
    Server {
        /// UDP address to serve DNS on
        #[arg(short, long, default_value = "0.0.0.0:53")]
        bind: SocketAddr,

        /// Tunnel suffix domain
        #[arg(short, long)]
        domain: Option<String>,

        /// TCP target every tunnel is connected to
        #[arg(short, long)]
        forward: SocketAddr,
    },

    /// Show the segment budget for a suffix domain
    Seglen {
        /// Suffix domain
        domain: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize logger
    if cli.verbose {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Debug)
            .init();
    } else {
        env_logger::Builder::from_default_env()
            .filter_level(log::LevelFilter::Info)
            .init();
    }

    match cli.command {
        Commands::Client {
            resolver,
            domain,
            listen,
        } => {
            let mut config = load_config(cli.config)?;
            if let Some(resolver) = resolver {
                config.resolver_addr = resolver;
            }
            if let Some(domain) = domain {
                config.suffix_domain = domain;
            }
            run_client(config, listen).await?;
        }
        Commands::Server {
            bind,
            domain,
            forward,
        } => {
            let mut config = load_config(cli.config)?;
            if let Some(domain) = domain {
                config.suffix_domain = domain;
            }
            run_server(config, bind, forward).await?;
        }
        Commands::Seglen { domain } => {
            let budget = optimal_seg_len(&domain);
            println!("Domain:          {}", domain);
            println!("Segment budget:  {} bytes", budget);
            println!(
                "Payload per query: {} bytes",
                budget.saturating_sub(SEGMENT_HEADER_LEN)
            );
        }
    }

    Ok(())
}

fn load_config(path: Option<PathBuf>) -> Result<TunnelConfig> {
    match path {
        Some(path) => TunnelConfig::from_file(&path)
            .with_context(|| format!("Failed to load config from {}", path.display())),
        None => Ok(TunnelConfig::default()),
    }
}

fn validated(config: TunnelConfig) -> Result<TunnelConfig> {
    config
        .validate()
        .map_err(|e| anyhow::anyhow!("Invalid configuration: {}", e))?;
    Ok(config)
}

async fn run_client(config: TunnelConfig, listen: SocketAddr) -> Result<()> {
    let config = Arc::new(validated(config)?);
    let resolver = Arc::new(UdpResolver::new(config.resolver_addr, config.io_timeout));
    let injector = config.fault_injector();
    let ids = Arc::new(ConnIdGenerator::new());
    let shutdown = CancellationToken::new();

    let listener = TcpListener::bind(listen)
        .await
        .with_context(|| format!("Failed to bind {}", listen))?;

    info!("dnsconduit client listening on {}", listen);
    info!(
        "Tunneling via resolver {} under {}.{} (io timeout {})",
        config.resolver_addr,
        config.proxy_prefix,
        config.suffix_domain,
        humantime::format_duration(config.io_timeout)
    );
    if config.drop_percentage > 0 {
        warn!(
            "Dropping {}% of resolver responses for testing",
            config.drop_percentage
        );
    }

    loop {
        let (stream, peer) = tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down client");
                shutdown.cancel();
                return Ok(());
            }
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!("Accept error: {}", e);
                    continue;
                }
            },
        };

        let conn_id = ids.next_id();
        info!("[Conn {:04x}] new local connection from {}", conn_id, peer);

        let conn = match ProxiedConnection::new(
            &config,
            conn_id,
            resolver.clone(),
            injector.clone(),
            stream,
        ) {
            Ok(conn) => conn,
            Err(e) => {
                error!("[Conn {:04x}] {}", conn_id, e);
                continue;
            }
        };

        let kill = conn.cancel_token();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            let watcher = tokio::spawn(async move {
                shutdown.cancelled().await;
                kill.cancel();
            });

            match conn.start().await {
                Ok(handle) => match handle.wait().await {
                    Ok(stats) => info!(
                        "[Conn {:04x}] finished: {} segments out, {} in",
                        conn_id, stats.segments_sent, stats.segments_received
                    ),
                    Err(e) => warn!("[Conn {:04x}] {}", conn_id, e),
                },
                Err(e) => warn!("[Conn {:04x}] {}", conn_id, e),
            }
            watcher.abort();
        });
    }
}

async fn run_server(config: TunnelConfig, bind: SocketAddr, forward: SocketAddr) -> Result<()> {
    let config = validated(config)?;
    let (accept_tx, mut accept_rx) = mpsc::channel(ACCEPT_QUEUE);
    let responder = Arc::new(Responder::new(config.responder_config()?, accept_tx));

    let server = DnsTunnelServer::bind(bind, responder)
        .await
        .with_context(|| format!("Failed to bind {}", bind))?;
    info!(
        "dnsconduit server forwarding tunnels to {} (idle timeout {})",
        forward,
        humantime::format_duration(config.server.idle_timeout)
    );

    let cancel = CancellationToken::new();
    let server_task = {
        let cancel = cancel.clone();
        tokio::spawn(async move { server.run(cancel).await })
    };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down server");
                break;
            }
            tunnel = accept_rx.recv() => match tunnel {
                Some(tunnel) => {
                    tokio::spawn(forward_tunnel(tunnel, forward));
                }
                None => break,
            },
        }
    }

    cancel.cancel();
    server_task.await??;
    Ok(())
}

async fn forward_tunnel(tunnel: AcceptedTunnel, forward: SocketAddr) {
    let AcceptedTunnel {
        conn_id,
        mut stream,
    } = tunnel;

    let mut target = match TcpStream::connect(forward).await {
        Ok(target) => target,
        Err(e) => {
            warn!("[Conn {:04x}] cannot reach {}: {}", conn_id, forward, e);
            return;
        }
    };

    info!("[Conn {:04x}] forwarding to {}", conn_id, forward);
    match tokio::io::copy_bidirectional(&mut stream, &mut target).await {
        Ok((to_target, from_target)) => info!(
            "[Conn {:04x}] done: {} bytes to target, {} bytes back",
            conn_id, to_target, from_target
        ),
        Err(e) => warn!("[Conn {:04x}] forwarding ended: {}", conn_id, e),
    }
}
