//! Press a named key on a blaster port.
//!
//! Decodes a RedRat keyset file, connects to one iTach, and presses a key
//! on IR port 1.
//!
//! # Usage
//!
//! ```sh
//! cargo run -p gcir --example press_key -- \
//!     keysets/REDRAT_KEYMANAGER.xml 192.168.70.60 XR11 POWER
//! ```

use std::time::Duration;

use gcir::net::Registry;
use gcir::{DeviceConfig, Dispatcher, RegistryConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let mut args = std::env::args().skip(1);
    let keyset_path = args.next().unwrap_or_else(|| "REDRAT_KEYMANAGER.xml".into());
    let host = args.next().unwrap_or_else(|| "192.168.70.60".into());
    let device = args.next().unwrap_or_else(|| "XR11".into());
    let key = args.next().unwrap_or_else(|| "POWER".into());

    println!("Loading keyset from {keyset_path}...");
    let catalogue = gcir::keyset::load_file(&keyset_path)?;
    println!(
        "{} devices, {} keys",
        catalogue.device_count(),
        catalogue.key_count()
    );

    let config = RegistryConfig::sequential_slots(vec![DeviceConfig::new(host.as_str())])?;
    let dispatcher = Dispatcher::new(Registry::open(config), catalogue);

    // Give the background connect a moment.
    tokio::time::sleep(Duration::from_millis(500)).await;

    println!("Pressing {device}/{key} on {host} port 1...");
    let outcome = dispatcher.press(1, &device, &key, 1).await?;
    println!(
        "completeir for id {} after {} ms",
        outcome.request_id,
        outcome.elapsed.as_millis()
    );

    dispatcher.shutdown(Duration::from_secs(5)).await;
    Ok(())
}
