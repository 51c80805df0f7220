//! Line-oriented operator front-end.
//!
//! Every subcommand maps one-to-one onto a core operation. Exit codes: 0 on
//! success, 1 on not-found / invalid argument, 2 on busy or refused.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use rfgate_lib::device::{MacScope, PairingState};
use rfgate_lib::error::GatewayError;
use rfgate_lib::gateway::{Gateway, GatewayConfig};
use rfgate_lib::packet::{Address, Frame};
use rfgate_lib::radio::UdpRadio;
use rfgate_lib::registry::DeviceRegistry;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::process::ExitCode;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::info;

#[derive(Parser)]
#[command(name = "rfgate", about = "Two-way sub-GHz gateway controller", version)]
struct Cli {
    /// Local endpoint of the radio frame tunnel.
    #[arg(long, default_value = "0.0.0.0:7700")]
    bind: SocketAddr,

    /// Radio bridge endpoint the tunnel talks to.
    #[arg(long, default_value = "127.0.0.1:7701")]
    peer: SocketAddr,

    /// 32-hex-character system key; RFGATE_SYSTEM_KEY works too.
    #[arg(long, env = "RFGATE_SYSTEM_KEY")]
    key: Option<String>,

    /// Device database path.
    #[arg(long, default_value = "devices.json")]
    registry: PathBuf,

    /// Authenticate the full command bytes in challenge answers instead of
    /// the response byte alone (for peers that expect that variant).
    #[arg(long)]
    full_command_mac: bool,

    #[command(subcommand)]
    command: Cmd,
}

#[derive(Subcommand)]
enum Cmd {
    /// Pair a device by address (hold its pairing button).
    Pair { addr: String },
    /// Listen and pair the first device that announces itself.
    AutoPair,
    /// Cancel the pairing session of a running `pair` (sent via Ctrl-C).
    CancelPair,
    /// List known devices.
    List,
    /// Show everything known about one device.
    Info { addr: String },
    /// Remove a device from the registry.
    Del { addr: String },
    /// Set the free-text description of a device.
    Desc { addr: String, text: Vec<String> },
    /// Rewrite the device database.
    Save,
    /// Reload the device database from disk.
    Reload,
    /// Switch a paired device on.
    On { addr: String },
    /// Switch a paired device off.
    Off { addr: String },
    /// Query device status.
    Status { addr: String },
    /// Send an arbitrary command byte with payload bytes (hex).
    Test {
        addr: String,
        cmd: String,
        bytes: Vec<String>,
    },
    /// Run the gateway loop until interrupted.
    Run,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    match run(Cli::parse()).await {
        Ok(code) => code,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::from(1)
        }
    }
}

async fn run(cli: Cli) -> Result<ExitCode> {
    match &cli.command {
        // Registry-only verbs need no radio.
        Cmd::List => return list(&cli),
        Cmd::Info { addr } => return info_cmd(&cli, addr),
        Cmd::Del { addr } => return del(&cli, addr),
        Cmd::Desc { addr, text } => return desc(&cli, addr, text),
        Cmd::Save => return save(&cli),
        Cmd::Reload => return reload(&cli),
        Cmd::CancelPair => {
            // One-shot process: a live session only exists inside `pair`,
            // where Ctrl-C cancels it.
            eprintln!("no pairing session in this process");
            return Ok(ExitCode::from(1));
        }
        _ => {}
    }

    let config = GatewayConfig {
        system_key: cli.key.as_deref().map(parse_key).transpose()?,
        registry_path: cli.registry.clone(),
        default_mac_scope: if cli.full_command_mac {
            MacScope::FullCommand
        } else {
            MacScope::ResponseByte
        },
        ..GatewayConfig::default()
    };
    let (radio, mut inbound) = UdpRadio::bind(cli.bind, cli.peer)
        .await
        .context("binding radio tunnel")?;
    let mut gw = Gateway::new(config, radio).context("starting gateway")?;

    match &cli.command {
        Cmd::Pair { addr } => {
            let addr = parse_addr(addr)?;
            if let Err(err) = gw.start_pairing(addr, Instant::now()) {
                eprintln!("cannot start pairing: {err}");
                return Ok(ExitCode::from(2));
            }
            println!("pairing {addr}, press and hold the device's pairing button");
            let finished = tokio::select! {
                _ = gw.run_until(&mut inbound, |gw| !gw.pairing().is_active()) => true,
                _ = tokio::signal::ctrl_c() => false,
            };
            if !finished {
                gw.cancel_pairing();
                println!("pairing cancelled");
                return Ok(ExitCode::from(2));
            }
            let state = gw.registry().get(addr).map(|d| d.pairing_state);
            if state == Some(PairingState::Paired) {
                println!("paired {addr}");
                Ok(ExitCode::SUCCESS)
            } else {
                match gw.pairing().last_failure() {
                    Some(err) => eprintln!("pairing failed: {err}"),
                    None => eprintln!("pairing ended in {state:?}"),
                }
                Ok(ExitCode::from(1))
            }
        }
        Cmd::AutoPair => {
            gw.enable_auto_pair().map_err(|e| anyhow!("{e}"))?;
            println!("auto-pair listening, Ctrl-C to stop");
            tokio::select! {
                _ = gw.run_until(&mut inbound, |_| false) => {}
                _ = tokio::signal::ctrl_c() => info!("auto-pair stopped"),
            }
            Ok(ExitCode::SUCCESS)
        }
        Cmd::On { addr } => command_and_confirm(&mut gw, &mut inbound, addr, |gw, a, now| {
            gw.switch(a, true, now)
        })
        .await,
        Cmd::Off { addr } => command_and_confirm(&mut gw, &mut inbound, addr, |gw, a, now| {
            gw.switch(a, false, now)
        })
        .await,
        Cmd::Status { addr } => command_and_confirm(&mut gw, &mut inbound, addr, |gw, a, now| {
            gw.status_query(a, now)
        })
        .await,
        Cmd::Test { addr, cmd, bytes } => {
            let cmd = u8::from_str_radix(cmd, 16).context("command byte must be hex")?;
            let payload: Vec<u8> = bytes
                .iter()
                .map(|b| u8::from_str_radix(b, 16))
                .collect::<Result<_, _>>()
                .context("payload bytes must be hex")?;
            let addr = addr.clone();
            command_and_confirm(&mut gw, &mut inbound, &addr, move |gw, a, now| {
                gw.raw_command(a, cmd, &payload, now)
            })
            .await
        }
        Cmd::Run => {
            println!("gateway running, Ctrl-C to stop");
            tokio::select! {
                _ = gw.run_until(&mut inbound, |_| false) => {}
                _ = tokio::signal::ctrl_c() => info!("gateway stopped"),
            }
            Ok(ExitCode::SUCCESS)
        }
        _ => unreachable!("registry verbs handled above"),
    }
}

/// Send one authenticated command and stay on the air long enough for the
/// challenge exchange and the `0x04` confirmation.
async fn command_and_confirm(
    gw: &mut Gateway<UdpRadio>,
    inbound: &mut mpsc::Receiver<Frame>,
    addr: &str,
    send: impl FnOnce(&mut Gateway<UdpRadio>, Address, Instant) -> Result<(), GatewayError>,
) -> Result<ExitCode> {
    let addr = parse_addr(addr)?;
    if let Err(err) = send(gw, addr, Instant::now()) {
        eprintln!("cannot send command: {err}");
        return Ok(ExitCode::from(1));
    }
    let answered = tokio::time::timeout(
        Duration::from_secs(5),
        gw.run_until(inbound, |gw| {
            gw.registry()
                .get(addr)
                .map(|d| d.last_response.is_some() && !d.pending_challenge)
                .unwrap_or(false)
        }),
    )
    .await
    .is_ok();
    if answered {
        println!("command authenticated by {addr}");
        Ok(ExitCode::SUCCESS)
    } else {
        eprintln!("no challenge exchange within 5s");
        Ok(ExitCode::from(1))
    }
}

fn open_registry(cli: &Cli) -> Result<DeviceRegistry> {
    let mut reg = DeviceRegistry::new(&cli.registry);
    reg.load_durable().context("loading device database")?;
    Ok(reg)
}

fn list(cli: &Cli) -> Result<ExitCode> {
    let reg = open_registry(cli)?;
    if reg.is_empty() {
        println!("no devices known");
        return Ok(ExitCode::SUCCESS);
    }
    println!("address  state          type  name");
    for dev in reg.all() {
        println!(
            "{}   {:<14} {:04x}  {}",
            dev.address(),
            format!("{:?}", dev.pairing_state),
            dev.capabilities.node_type,
            dev.capabilities.name,
        );
    }
    Ok(ExitCode::SUCCESS)
}

fn info_cmd(cli: &Cli, addr: &str) -> Result<ExitCode> {
    let reg = open_registry(cli)?;
    let addr = parse_addr(addr)?;
    let Some(dev) = reg.get(addr) else {
        eprintln!("device {addr} not found");
        return Ok(ExitCode::from(1));
    };
    println!("device {addr}");
    println!("  state:         {:?}", dev.pairing_state);
    println!("  description:   {}", dev.description);
    println!("  node type:     0x{:04x}", dev.capabilities.node_type);
    println!("  node subtype:  0x{:02x}", dev.capabilities.node_subtype);
    println!("  manufacturer:  0x{:02x}", dev.capabilities.manufacturer);
    println!("  multi info:    0x{:02x}", dev.capabilities.multi_info);
    println!("  timestamp:     {}", dev.capabilities.timestamp);
    println!("  name:          {}", dev.capabilities.name);
    println!("  system key:    {}", present(dev.system_key.is_some()));
    println!("  stack key:     {}", present(dev.stack_key.is_some()));
    println!("  session key:   {}", present(dev.session_key.is_some()));
    println!("  sequence:      {}", dev.sequence_number);
    println!("  mac scope:     {:?}", dev.mac_scope);
    if let Some(info) = &dev.capabilities.general_info1 {
        println!("  general info 1: {}", hex::encode(info));
    }
    if let Some(info) = &dev.capabilities.general_info2 {
        println!("  general info 2: {}", hex::encode(info));
    }
    if let Some(prio) = &dev.priority_addr {
        println!("  priority addr: {}", hex::encode(prio));
    }
    Ok(ExitCode::SUCCESS)
}

fn del(cli: &Cli, addr: &str) -> Result<ExitCode> {
    let mut reg = open_registry(cli)?;
    let addr = parse_addr(addr)?;
    if reg.remove(addr).is_none() {
        eprintln!("device {addr} not found");
        return Ok(ExitCode::from(1));
    }
    reg.save_durable()?;
    println!("removed {addr}");
    Ok(ExitCode::SUCCESS)
}

fn desc(cli: &Cli, addr: &str, text: &[String]) -> Result<ExitCode> {
    let mut reg = open_registry(cli)?;
    let addr = parse_addr(addr)?;
    if !reg.set_description(addr, &text.join(" ")) {
        eprintln!("device {addr} not found");
        return Ok(ExitCode::from(1));
    }
    println!("description updated");
    Ok(ExitCode::SUCCESS)
}

fn save(cli: &Cli) -> Result<ExitCode> {
    let reg = open_registry(cli)?;
    reg.save_durable()?;
    println!("saved {} devices", reg.len());
    Ok(ExitCode::SUCCESS)
}

fn reload(cli: &Cli) -> Result<ExitCode> {
    let mut reg = open_registry(cli)?;
    let count = reg.load_durable()?;
    println!("reloaded {count} devices");
    Ok(ExitCode::SUCCESS)
}

fn present(yes: bool) -> &'static str {
    if yes {
        "yes"
    } else {
        "no"
    }
}

fn parse_addr(s: &str) -> Result<Address> {
    s.parse()
        .map_err(|_| anyhow!("address must be 6 hex characters, e.g. 4c79dc"))
}

fn parse_key(s: &str) -> Result<[u8; 16]> {
    let invalid = || GatewayError::InvalidKey {
        expected: 32,
        actual: s.len(),
    };
    let raw = hex::decode(s).map_err(|_| invalid())?;
    let key = raw.as_slice().try_into().map_err(|_| invalid())?;
    Ok(key)
}
