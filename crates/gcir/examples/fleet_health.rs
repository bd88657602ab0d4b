//! Survey the health of a blaster fleet.
//!
//! Connects to a run of sequential-IP iTach devices and prints the passive
//! state plus an active `getversion` check for every slot.
//!
//! # Usage
//!
//! ```sh
//! cargo run -p gcir --example fleet_health -- 192.168.70.60 4
//! ```

use std::time::Duration;

use gcir::net::Registry;
use gcir::{DeviceConfig, Dispatcher, KeysetCatalogue, RegistryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "192.168.70.60".into());
    let count: u32 = args.next().unwrap_or_else(|| "1".into()).parse()?;

    let config =
        RegistryConfig::sequential_slots(vec![DeviceConfig::new(host.as_str()).count(count)])?;
    let dispatcher = Dispatcher::new(Registry::open(config), KeysetCatalogue::new());

    // Let the fleet connect.
    tokio::time::sleep(Duration::from_secs(1)).await;

    println!("{:<6} {:<22} {:<8} {:<14} check", "slot", "endpoint", "addr", "state");
    let checks = dispatcher.check().await;
    for (slot_health, (_, check)) in dispatcher.health().iter().zip(checks.iter()) {
        let check = match check {
            Ok(version) => version.clone(),
            Err(e) => format!("error: {e}"),
        };
        println!(
            "{:<6} {:<22} {:<8} {:<14} {}",
            slot_health.slot,
            slot_health.endpoint.to_string(),
            slot_health.address.to_string(),
            slot_health.health.state.to_string(),
            check
        );
    }

    dispatcher.shutdown(Duration::from_secs(5)).await;
    Ok(())
}
