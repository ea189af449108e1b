//! Entry point for `rxp`.
//!
//! Parses CLI arguments and dispatches into either **server** or **client**
//! mode, then reads commands from stdin.  All protocol work is delegated to
//! library modules; `main.rs` owns only process setup (logging, argument
//! parsing, the command shell).

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};

use rxp::state::ConnectionState;
use rxp::timer::TimerConfig;
use rxp::{Client, ClientConfig, DirStore, Server, ServerConfig};

/// Reliable file transfer over UDP.
#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    mode: Mode,
}

#[derive(Args, Clone, Copy)]
struct TimerArgs {
    /// Read timeout per receive, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,
    /// Timeouts tolerated per protocol step.
    #[arg(long, default_value_t = 5)]
    retries: u32,
}

impl From<TimerArgs> for TimerConfig {
    fn from(args: TimerArgs) -> Self {
        TimerConfig::default()
            .with_read_timeout(Duration::from_millis(args.timeout_ms))
            .with_max_retries(args.retries)
    }
}

#[derive(Subcommand)]
enum Mode {
    /// Serve files from a directory.  Type `terminate` to stop.
    Server {
        /// Local UDP address to bind.
        #[arg(short, long, default_value = "0.0.0.0:3251")]
        bind: SocketAddr,
        /// RXP port to answer on.
        #[arg(short, long, default_value_t = 3251)]
        port: u16,
        /// Directory files are served from and stored to.
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
        #[command(flatten)]
        timers: TimerArgs,
    },
    /// Connect to a server.  Commands: connect, post <file>, get <file>,
    /// disconnect, quit.
    Client {
        /// Local UDP address to bind.
        #[arg(short, long, default_value = "0.0.0.0:3250")]
        bind: SocketAddr,
        /// Server UDP address.
        #[arg(short, long)]
        server: SocketAddr,
        /// Our RXP port.
        #[arg(short, long, default_value_t = 3250)]
        port: u16,
        /// RXP port of the server.
        #[arg(long, default_value_t = 3251)]
        server_port: u16,
        /// Directory files are uploaded from and downloaded to.
        #[arg(short, long, default_value = ".")]
        dir: PathBuf,
        #[command(flatten)]
        timers: TimerArgs,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialise env_logger; set RUST_LOG to control verbosity.
    env_logger::init();

    let cli = Cli::parse();

    match cli.mode {
        Mode::Server {
            bind,
            port,
            dir,
            timers,
        } => run_server(bind, port, dir, timers.into()).await,
        Mode::Client {
            bind,
            server,
            port,
            server_port,
            dir,
            timers,
        } => {
            let config = ClientConfig {
                rxp_port: port,
                server_port,
                timers: timers.into(),
            };
            run_client(bind, server, config, dir).await
        }
    }
}

async fn run_server(bind: SocketAddr, port: u16, dir: PathBuf, timers: TimerConfig) -> anyhow::Result<()> {
    let config = ServerConfig {
        rxp_port: port,
        timers,
    };
    let server = Server::bind(bind, config, Arc::new(DirStore::new(dir)))
        .await
        .with_context(|| format!("binding server to {bind}"))?;
    let handle = server.spawn();
    println!("serving on {}; type `terminate` to stop", handle.local_addr());

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    while let Some(line) = lines.next_line().await? {
        match line.trim() {
            "terminate" => break,
            "" => {}
            other => println!("unknown command {other:?}; try `terminate`"),
        }
    }

    let reports = handle.terminate().await.context("stopping server")?;
    println!("server stopped after {} session(s)", reports.len());
    Ok(())
}

async fn run_client(
    bind: SocketAddr,
    server: SocketAddr,
    config: ClientConfig,
    dir: PathBuf,
) -> anyhow::Result<()> {
    let mut client = Client::bind(bind, server, config, Arc::new(DirStore::new(dir)))
        .await
        .with_context(|| format!("binding client to {bind}"))?;
    println!("commands: connect | post <file> | get <file> | disconnect | quit");

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        // Answered outside the select so typing cannot cut the close short.
        match client.finish_peer_close().await {
            Ok(true) => println!("server closed the connection"),
            Ok(false) => {}
            Err(e) => println!("error: {e}"),
        }

        let line = if client.state() == ConnectionState::Established {
            tokio::select! {
                line = lines.next_line() => line?,
                fin = client.await_peer_fin(Duration::from_millis(500)) => {
                    fin?;
                    continue;
                }
            }
        } else {
            lines.next_line().await?
        };
        let Some(line) = line else { break };

        let mut words = line.split_whitespace();
        let result = match (words.next(), words.next()) {
            (Some("connect"), None) => client.connect().await.map(|()| println!("connected")),
            (Some("post" | "put"), Some(name)) => client
                .post(name)
                .await
                .map(|n| println!("uploaded {name} ({n} bytes)")),
            (Some("get"), Some(name)) => client
                .get(name)
                .await
                .map(|stored| println!("saved {stored}")),
            (Some("disconnect"), None) => client.disconnect().await.map(|()| println!("disconnected")),
            (Some("quit" | "exit"), None) => break,
            (None, _) => Ok(()),
            _ => {
                println!("unknown command {line:?}");
                Ok(())
            }
        };
        if let Err(e) = result {
            println!("error: {e}");
        }
    }
    Ok(())
}
