use std::io::{self, BufRead};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Parser, ValueEnum};
use log::{error, info, warn};

use biotel_rs::config::ClientConfig;
use biotel_rs::dispatch::DeviceDispatcher;
use biotel_rs::session::DeviceSession;
use biotel_rs::types::{
    DeviceProfile, DeviceRecord, ElementType, InterfaceType, SlotParameters, UioState,
};

/// Stream telemetry from one device and log per-slot statistics.
#[derive(Parser, Debug)]
#[command(name = "biotel", version)]
struct Args {
    /// Transport to use.
    #[arg(long, value_enum, default_value_t = Interface::Usb)]
    interface: Interface,

    /// Known device id; skips scanning and re-finds that device instead.
    #[arg(long)]
    device: Option<String>,

    /// Client configuration (JSON).
    #[arg(long)]
    config: Option<PathBuf>,

    /// Slot parameters (JSON).  Defaults to slot 0: 2 × i16 at 100 Hz.
    #[arg(long)]
    profile: Option<PathBuf>,

    /// Scan timeout in milliseconds, overriding the configuration.
    #[arg(long)]
    scan_ms: Option<u64>,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Interface {
    Ble,
    Usb,
    Emulated,
}

impl From<Interface> for InterfaceType {
    fn from(i: Interface) -> Self {
        match i {
            Interface::Ble => InterfaceType::Ble,
            Interface::Usb => InterfaceType::Usb,
            Interface::Emulated => InterfaceType::Emulated,
        }
    }
}

#[derive(Debug, PartialEq)]
enum Command {
    Quit,
    SetUio(UioState),
}

/// `q` or `u <hex>`; anything else is `None`.
fn parse_command(line: &str) -> Option<Command> {
    let mut parts = line.split_whitespace();
    match (parts.next()?, parts.next()) {
        ("q", None) => Some(Command::Quit),
        ("u", Some(hex)) => {
            let hex = hex.trim_start_matches("0x");
            u16::from_str_radix(hex, 16)
                .ok()
                .map(|lines| Command::SetUio(UioState { lines }))
        }
        _ => None,
    }
}

fn default_profile() -> DeviceProfile {
    DeviceProfile::default().with_slot(
        0,
        SlotParameters {
            channel_count: 2,
            sample_rate_hz: 100.0,
            element_type: ElementType::I16,
            metric_count: 4,
        },
    )
}

async fn find_device(
    dispatcher: &DeviceDispatcher,
    interface: InterfaceType,
    device: Option<String>,
    config: &ClientConfig,
) -> Result<DeviceRecord> {
    if let Some(id) = device {
        let known = [DeviceRecord {
            name: id.clone(),
            id,
            interface_type: interface,
        }];
        let found = dispatcher
            .refresh_previous_devices(&known, |r| info!("Found again: {}  id={}", r.name, r.id))
            .await?;
        return found
            .into_iter()
            .next()
            .with_context(|| format!("{} is not reachable over {interface}", known[0].id));
    }

    info!("Scanning {interface} for {} ms …", config.scan_timeout_ms);
    let found = dispatcher
        .scan(
            interface,
            Arc::new(|r: DeviceRecord| {
                info!("Found: {}  id={}", r.name, r.id);
                true
            }),
            config.scan_timeout(),
        )
        .await?;
    match found.into_iter().next() {
        Some(record) => Ok(record),
        None => bail!("no {interface} device found"),
    }
}

fn log_stats(session: &DeviceSession) {
    for slot in session.profile().configured_slots() {
        let stats = session.with_stream(slot, |s| {
            (
                s.len(),
                s.metrics().len(),
                s.qos_state(),
                s.segment_bounds().len(),
                s.fiducials().len(),
            )
        });
        if let Ok((rows, metrics, qos, segments, fiducials)) = stats {
            info!(
                "[slot {slot}] rows={rows:6}  metrics={metrics:4}  qos={qos}  segments={segments:3}  fiducials={fiducials:3}"
            );
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // ── Logging ───────────────────────────────────────────────────────────────
    // Set RUST_LOG=debug for verbose output, e.g.:
    //   RUST_LOG=biotel_rs=debug cargo run -- --interface emulated
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    // ── Configuration ─────────────────────────────────────────────────────────
    let mut config = match &args.config {
        Some(path) => ClientConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => ClientConfig::default(),
    };
    if let Some(ms) = args.scan_ms {
        config.scan_timeout_ms = ms;
    }
    if args.interface == Interface::Emulated {
        config.enable_emulated = true;
    }
    let profile = match &args.profile {
        Some(path) => DeviceProfile::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => default_profile(),
    };

    // ── Connect ───────────────────────────────────────────────────────────────
    let dispatcher = Arc::new(DeviceDispatcher::platform_default(&config).await);
    let device = find_device(&dispatcher, args.interface.into(), args.device, &config).await?;

    let (disc_tx, mut disc_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    info!("Connecting to {} ({}) …", device.name, device.id);
    let session = DeviceSession::open(
        dispatcher.clone(),
        &device.id,
        profile,
        &config,
        Arc::new(move |id: &str| {
            disc_tx.send(id.to_owned()).ok();
        }),
    )
    .await?;
    info!("✅  Connected to: {}", device.name);

    match dispatcher.get_device_battery_level(&device.id).await {
        Ok(level) => info!("Battery: {level}%"),
        Err(e) => warn!("Battery level unavailable: {e}"),
    }
    match dispatcher.get_device_strength(&device.id).await {
        Ok(strength) => info!("Strength: {strength}/100"),
        Err(e) => warn!("Strength unavailable: {e}"),
    }

    info!("Commands (type + Enter):");
    info!("  q        – quit");
    info!("  u <hex>  – set UIO lines, e.g. 'u 0x0003'\n");

    // ── Stdin command loop ────────────────────────────────────────────────────
    // Lines are read on a dedicated OS thread (to avoid holding a non-Send
    // StdinLock across await points), then relayed to the main loop.
    let (line_tx, mut line_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    std::thread::spawn(move || {
        let stdin = io::stdin();
        for line in stdin.lock().lines() {
            match line {
                Ok(l) => {
                    if line_tx.send(l.trim().to_owned()).is_err() {
                        break;
                    }
                }
                Err(_) => break,
            }
        }
    });

    // ── Main loop ─────────────────────────────────────────────────────────────
    let mut ticker = tokio::time::interval(Duration::from_secs(1));
    loop {
        tokio::select! {
            _ = ticker.tick() => log_stats(&session),
            Some(line) = line_rx.recv() => {
                if line.is_empty() {
                    continue;
                }
                match parse_command(&line) {
                    Some(Command::Quit) => {
                        info!("Quit requested.");
                        break;
                    }
                    Some(Command::SetUio(state)) => {
                        info!("Setting UIO lines to {:#06x} …", state.lines);
                        if let Err(e) = dispatcher.set_uio_state(&device.id, state).await {
                            error!("UIO error: {e}");
                        }
                    }
                    None => warn!("Unknown command: '{line}'"),
                }
            }
            Some(id) = disc_rx.recv() => {
                info!("❌  Disconnected from {id}.");
                return Ok(());
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Ctrl-C received.");
                break;
            }
        }
    }

    session.close().await?;
    info!("Disconnected – exiting.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commands_parse() {
        assert_eq!(parse_command("q"), Some(Command::Quit));
        assert_eq!(
            parse_command("u 0x0003"),
            Some(Command::SetUio(UioState { lines: 3 }))
        );
        assert_eq!(
            parse_command("u ff00"),
            Some(Command::SetUio(UioState { lines: 0xFF00 }))
        );
        assert_eq!(parse_command("u zz"), None);
        assert_eq!(parse_command("u"), None);
        assert_eq!(parse_command("q now"), None);
        assert_eq!(parse_command("x"), None);
    }

    #[test]
    fn args_parse() {
        let args = Args::try_parse_from(["biotel", "--interface", "emulated", "--scan-ms", "500"]).unwrap();
        assert_eq!(args.interface, Interface::Emulated);
        assert_eq!(args.scan_ms, Some(500));
        assert!(Args::try_parse_from(["biotel", "--interface", "serial"]).is_err());
    }
}
