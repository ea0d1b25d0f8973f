//! Devices command implementation.

use anyhow::{Context, Result};

use peerlink_core::connection::resolve_local_ip;
use peerlink_core::discovery::{Device, DiscoveryOptions, DiscoveryService};
use peerlink_core::events::EventBus;

use super::DevicesArgs;
use crate::ui::{parse_duration, truncate_string};

/// Run the devices command.
pub async fn run(args: DevicesArgs) -> Result<()> {
    let config = super::load_config();

    let duration = parse_duration(&args.duration)
        .context("Invalid duration format. Use formats like '5s', '10s', '30s'")?;

    if !args.json {
        println!();
        println!("Listening for devices ({})...", args.duration);
        println!();
    }

    let local_ip = resolve_local_ip(config.network.local_ip);
    let options = DiscoveryOptions::from_config(&config, local_ip);
    let service = DiscoveryService::bind(options, EventBus::default())
        .await
        .context("Failed to start discovery")?;
    service.start().await?;

    tokio::time::sleep(duration).await;
    let devices = service.devices().await;
    service.stop().await;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&devices)?);
    } else {
        display_devices(&devices);
    }

    Ok(())
}

/// Display devices as text table.
fn display_devices(devices: &[Device]) {
    println!("Devices on Network:");
    println!("{}", "─".repeat(60));
    println!("  {:16}  {:24}  {:10}", "Address", "Name", "Last seen");
    println!("{}", "─".repeat(60));

    if devices.is_empty() {
        println!("  (no devices found)");
        println!("{}", "─".repeat(60));
        return;
    }

    for device in devices {
        let ago = device.last_seen.elapsed().as_secs();
        println!(
            "  {:16}  {:24}  {:>8}s",
            device.ip.to_string(),
            truncate_string(&device.hostname, 24),
            ago
        );
    }

    println!("{}", "─".repeat(60));
}
