//! gatt-bridge command-line node
//!
//! Scans for peripherals, connects to the first one found, maps its
//! characteristics and runs the requested reads and writes.
//!
//! ```bash
//! gatt-bridge-node --simulated --read battery-level --read model-number
//! gatt-bridge-node --name-filter thermo --write uart-rx="AT+RESET" --no-response
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use gatt_bridge::test_utils::{demo_peripherals, SimulatedRadio};
use gatt_bridge::{
    BridgeConfig, BridgeContext, CallbackAdapter, Characteristic, ConnectResult,
    DisconnectResult, ReadOptions, ScanOptions, ScanStatus, Scanner, ServiceDiscoveryResult,
    WriteOptions, DEFAULT_SCAN_SECS,
};

#[derive(Parser, Debug)]
#[command(name = "gatt-bridge-node")]
#[command(about = "Scan for a BLE peripheral, then read and write its characteristics")]
struct Args {
    /// Scan window in seconds
    #[arg(long, default_value_t = DEFAULT_SCAN_SECS)]
    scan_secs: u64,

    /// Only accept devices whose name contains this text (case-insensitive)
    #[arg(long, short = 'f')]
    name_filter: Option<String>,

    /// JSON configuration file
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Characteristic to read, e.g. battery-level (repeatable)
    #[arg(long = "read", short = 'r')]
    reads: Vec<Characteristic>,

    /// Write text to a characteristic, e.g. uart-rx=hello (repeatable)
    #[arg(long = "write", short = 'w', value_parser = parse_write)]
    writes: Vec<(Characteristic, String)>,

    /// Do not wait for write acknowledgements
    #[arg(long)]
    no_response: bool,

    /// Use the built-in simulated radio instead of a real adapter
    #[arg(long)]
    simulated: bool,

    /// Enable verbose logging
    #[arg(long, short)]
    verbose: bool,
}

fn parse_write(raw: &str) -> Result<(Characteristic, String), String> {
    let (name, text) = raw
        .split_once('=')
        .ok_or_else(|| format!("expected <characteristic>=<text>, got {raw:?}"))?;
    let characteristic = name.parse::<Characteristic>().map_err(|e| e.to_string())?;
    Ok((characteristic, text.to_string()))
}

/// Printable text when the value is UTF-8, hex otherwise
fn render(value: &[u8]) -> String {
    match std::str::from_utf8(value) {
        Ok(text) if !text.chars().any(|c| c.is_control() && c != '\n' && c != '\r') => {
            format!("{:?}", text)
        }
        _ => value
            .iter()
            .map(|b| format!("{b:02X}"))
            .collect::<Vec<_>>()
            .join(" "),
    }
}

fn load_config(args: &Args) -> anyhow::Result<BridgeConfig> {
    let mut config = match &args.config {
        Some(path) => BridgeConfig::from_json_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => BridgeConfig::default(),
    };
    if let Some(filter) = &args.name_filter {
        config.discovery.name_filter = Some(filter.clone());
    }
    Ok(config)
}

async fn build_context(args: &Args, config: BridgeConfig) -> anyhow::Result<Arc<BridgeContext>> {
    let adapter = Arc::new(CallbackAdapter::from_config(&config.discovery));

    if args.simulated {
        info!("Using simulated radio");
        let radio = SimulatedRadio::new(adapter.clone());
        for peripheral in demo_peripherals() {
            radio.add_peripheral(peripheral);
        }
        return Ok(BridgeContext::from_parts(config, adapter, Arc::new(radio))?);
    }

    #[cfg(feature = "ble")]
    {
        let radio = gatt_bridge::BtleplugRadio::new(adapter.clone()).await?;
        Ok(BridgeContext::from_parts(config, adapter, Arc::new(radio))?)
    }

    #[cfg(not(feature = "ble"))]
    {
        bail!("built without the `ble` feature; rebuild with it or pass --simulated")
    }
}

async fn run(args: Args) -> anyhow::Result<()> {
    let config = load_config(&args)?;
    let timing = config.timing.clone();
    let context = build_context(&args, config).await?;

    let scan = Scanner::new(context)
        .scan(ScanOptions::seconds(args.scan_secs))
        .await;
    match scan.status {
        ScanStatus::Success => {}
        ScanStatus::NoDevicesFound => {
            warn!("No devices found in {}s", args.scan_secs);
            return Ok(());
        }
        other => bail!("scan finished with {other}"),
    }

    for device in &scan.devices {
        let name = if device.name().is_empty() { "<unnamed>" } else { device.name() };
        let rssi = device
            .rssi()
            .map(|r| format!("{r} dBm"))
            .unwrap_or_else(|| "-".to_string());
        println!("{:<40} {:<24} {}", device.identity(), name, rssi);
    }

    let Some(mut session) = scan.devices.into_iter().next() else {
        return Ok(());
    };

    match session.connect().await {
        ConnectResult::Connected => info!("Connected to {}", session.identity()),
        other => bail!("connect to {} finished with {other}", session.identity()),
    }

    let discovery = session.discover_services().await;
    if discovery != ServiceDiscoveryResult::Success {
        session.disconnect().await;
        bail!("service discovery finished with {discovery}");
    }
    let mapped: Vec<String> = session
        .characteristics()
        .iter()
        .map(|c| c.to_string())
        .collect();
    println!("characteristics: {}", mapped.join(", "));

    for characteristic in &args.reads {
        let result = session
            .read_characteristic(ReadOptions::from_timing(*characteristic, &timing))
            .await;
        if result.is_success() {
            println!("read  {characteristic}: {}", render(&result.data));
        } else {
            println!("read  {characteristic}: {}", result.status);
        }
    }

    for (characteristic, text) in &args.writes {
        let options = WriteOptions::from_strings(*characteristic, !args.no_response, [text])
            .with_timing(&timing);
        let result = session.write_characteristic(options).await;
        println!("write {characteristic}: {result}");
    }

    match session.disconnect().await {
        DisconnectResult::Disconnected => info!("Disconnected"),
        other => warn!("disconnect finished with {other}"),
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Initialize logging
    let level = if args.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder().with_max_level(level).finish();
    tracing::subscriber::set_global_default(subscriber)?;

    info!("Starting gatt-bridge-node v{}", gatt_bridge::VERSION);
    run(args).await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_write() {
        let (characteristic, text) = parse_write("uart-rx=AT+RESET=1").unwrap();
        assert_eq!(characteristic, Characteristic::UartRx);
        assert_eq!(text, "AT+RESET=1");
        assert!(parse_write("uart-rx").is_err());
        assert!(parse_write("flux-capacitor=1").is_err());
    }

    #[test]
    fn test_render() {
        assert_eq!(render(b"TS-100"), "\"TS-100\"");
        assert_eq!(render(&[0x57, 0x00]), "57 00");
    }

    #[test]
    fn test_args() {
        let args = Args::parse_from([
            "gatt-bridge-node",
            "--simulated",
            "-r",
            "battery-level",
            "--read",
            "model-number",
            "--write",
            "uart-rx=hi",
        ]);
        assert_eq!(
            args.reads,
            vec![Characteristic::BatteryLevel, Characteristic::ModelNumber]
        );
        assert_eq!(args.writes, vec![(Characteristic::UartRx, "hi".to_string())]);
        assert_eq!(args.scan_secs, DEFAULT_SCAN_SECS);
    }

    #[tokio::test(start_paused = true)]
    async fn test_simulated_run() {
        let args = Args::parse_from([
            "gatt-bridge-node",
            "--simulated",
            "--name-filter",
            "thermo",
            "--read",
            "battery-level",
        ]);
        run(args).await.unwrap();
    }
}
