use std::io::{self, BufRead, Write};
use std::time::Duration;

use anyhow::{Context, bail};
use clap::{Parser, Subcommand};
use netcrusher::{
    DatagramCrusher, DatagramCrusherBuilder, NetCrusher, Reactor, TcpCrusher, TcpCrusherBuilder,
};
use serde_json::json;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "netcrusher")]
#[command(about = "Controllable TCP/UDP relay for network failure testing")]
struct Args {
    #[command(subcommand)]
    mode: Mode,

    /// Reactor tick (selector wait bound and idle sweep period) in milliseconds
    #[arg(long, env = "NETCRUSHER_TICK_MS", default_value_t = 20, global = true)]
    tick_ms: u64,
}

#[derive(Subcommand)]
enum Mode {
    /// Relay TCP connections
    Tcp {
        #[command(flatten)]
        endpoints: Endpoints,
    },
    /// Relay UDP datagrams
    Udp {
        #[command(flatten)]
        endpoints: Endpoints,

        /// Evict sessions idle for longer than this; 0 keeps them forever
        #[arg(long, env = "NETCRUSHER_MAX_IDLE_MS", default_value_t = 0)]
        max_idle_ms: u64,
    },
}

#[derive(clap::Args)]
struct Endpoints {
    /// Address clients connect to
    #[arg(short, long, env = "NETCRUSHER_BIND")]
    bind: String,

    /// Address traffic is relayed to
    #[arg(short, long, env = "NETCRUSHER_CONNECT")]
    connect: String,
}

enum Relay {
    Tcp(TcpCrusher),
    Udp(DatagramCrusher),
}

impl Relay {
    fn crusher(&self) -> &dyn NetCrusher {
        match self {
            Relay::Tcp(crusher) => crusher,
            Relay::Udp(crusher) => crusher,
        }
    }

    fn status(&self) -> anyhow::Result<serde_json::Value> {
        let crusher = self.crusher();
        let mut status = json!({
            "state": crusher.state(),
            "bind": crusher.bind_address(),
            "connect": crusher.connect_address(),
        });
        if !crusher.is_open() {
            return Ok(status);
        }

        match self {
            Relay::Tcp(crusher) => {
                status["accepted"] = json!(crusher.accepted_count());
                status["pairs"] = serde_json::to_value(crusher.pairs()?)?;
            }
            Relay::Udp(crusher) => {
                status["inner"] = serde_json::to_value(crusher.inner()?)?;
                status["outers"] = serde_json::to_value(crusher.outers()?)?;
            }
        }
        Ok(status)
    }

    /// Run one stdin command. Returns false on `quit`.
    fn handle(&self, line: &str) -> anyhow::Result<bool> {
        let crusher = self.crusher();
        match line {
            "open" => crusher.open()?,
            "close" => crusher.close()?,
            "crush" => crusher.crush()?,
            "freeze" => crusher.freeze()?,
            "unfreeze" => crusher.unfreeze()?,
            "status" => println!("{}", serde_json::to_string_pretty(&self.status()?)?),
            "quit" | "exit" => return Ok(false),
            "" => return Ok(true),
            other => bail!(
                "unknown command '{other}' (open, close, crush, freeze, unfreeze, status, quit)"
            ),
        }
        Ok(true)
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("netcrusher=info".parse()?))
        .with_writer(io::stderr)
        .init();

    let args = Args::parse();

    let reactor = Reactor::builder()
        .tick(Duration::from_millis(args.tick_ms))
        .build()
        .context("failed to start reactor")?;

    let relay = match args.mode {
        Mode::Tcp { endpoints } => Relay::Tcp(
            TcpCrusherBuilder::new()
                .reactor(&reactor)
                .bind_address(endpoints.bind.as_str())
                .connect_address(endpoints.connect.as_str())
                .build_and_open()
                .context("failed to open TCP crusher")?,
        ),
        Mode::Udp {
            endpoints,
            max_idle_ms,
        } => Relay::Udp(
            DatagramCrusherBuilder::new()
                .reactor(&reactor)
                .bind_address(endpoints.bind.as_str())
                .connect_address(endpoints.connect.as_str())
                .max_idle(Duration::from_millis(max_idle_ms))
                .build_and_open()
                .context("failed to open datagram crusher")?,
        ),
    };

    info!(
        bind = %relay.crusher().bind_address(),
        connect = %relay.crusher().connect_address(),
        "Ready, reading commands from stdin"
    );

    let stdin = io::stdin();
    for line in stdin.lock().lines() {
        let line = line?;
        match relay.handle(line.trim()) {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => warn!(error = %e, "Command failed"),
        }
        io::stdout().flush()?;
    }

    relay.crusher().close()?;
    drop(relay);
    reactor.close();
    info!("Shut down");
    Ok(())
}
