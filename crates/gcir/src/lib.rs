//! # gcir -- Global Caché iTach IR dispatch
//!
//! `gcir` is an asynchronous Rust library for driving fleets of Global
//! Caché iTach IP2IR blasters: it decodes RedRat keyset databases into
//! device-ready IR waveforms, keeps persistent TCP connections to every IR
//! port with health tracking and automatic reconnect, and exposes
//! press / press-and-hold / stop semantics over named keys.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::time::Duration;
//! use gcir::{DeviceConfig, Dispatcher, RegistryConfig};
//! use gcir::net::Registry;
//!
//! #[tokio::main]
//! async fn main() -> gcir::Result<()> {
//!     // Decode the RedRat keyset database.
//!     let catalogue = gcir::keyset::load_file("keysets/REDRAT_KEYMANAGER.xml")?;
//!
//!     // Two blasters on sequential IPs, three IR ports each -> slots 1..=6.
//!     let config = RegistryConfig::sequential_slots(vec![
//!         DeviceConfig::new("192.168.70.60").count(2),
//!     ])?;
//!     let dispatcher = Dispatcher::new(Registry::open(config), catalogue);
//!
//!     // Press GUIDE on the set-top box wired to slot 4.
//!     let outcome = dispatcher.press(4, "XR11", "GUIDE", 1).await?;
//!     println!("acknowledged id {} in {:?}", outcome.request_id, outcome.elapsed);
//!
//!     // Hold VOL_UP for two seconds.
//!     dispatcher.press_and_hold(4, "XR11", "VOL_UP", 2_000).await?;
//!
//!     dispatcher.shutdown(Duration::from_secs(5)).await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! The library is organized as a workspace of focused crates:
//!
//! | Crate                | Purpose                                       |
//! |----------------------|-----------------------------------------------|
//! | `gcir-core`          | Types ([`IrWaveform`], addressing, health), errors, configuration |
//! | `gcir-keyset`        | RedRat XML decoder and cycle quantizer        |
//! | `gcir-protocol`      | Global Caché wire codec (`sendir` et al.)     |
//! | `gcir-net`           | Per-port connections, reconnect, registry     |
//! | `gcir-test-harness`  | Mock iTach endpoint for tests                 |
//! | **`gcir`**           | This facade crate -- dispatcher + re-exports  |
//!
//! ## Concurrency model
//!
//! Every IR port gets its own TCP connection, owned by a background actor
//! task. A port transmits one command at a time: the next `sendir` is
//! written only after the previous one's `completeir` arrived (or the
//! request errored or timed out). Different ports, and different devices,
//! proceed independently. Dispatcher calls suspend until the device
//! acknowledges completion, so a resolved `press` means the IR actually
//! finished playing.
//!
//! ## Health and recovery
//!
//! Lost links reconnect automatically with jittered exponential backoff
//! (1 s doubling to a 60 s cap). [`Dispatcher::health`] reports the passive
//! per-slot state; [`Dispatcher::check`] actively round-trips a
//! `getversion,0` per slot.

pub use gcir_core::*;

/// RedRat keyset decoding.
///
/// Provides [`load_file`](keyset::load_file) / [`parse_str`](keyset::parse_str)
/// and the [`KeysetCatalogue`](keyset::KeysetCatalogue).
pub mod keyset {
    pub use gcir_keyset::*;
}

/// Global Caché wire codec.
///
/// Pure `sendir`/`stopir`/query encoding and response parsing.
pub mod protocol {
    pub use gcir_protocol::*;
}

/// Connection management and the device registry.
pub mod net {
    pub use gcir_net::*;
}

mod dispatcher;

pub use dispatcher::{Dispatcher, PressOutcome, MAX_REPEATS};
pub use gcir_keyset::KeysetCatalogue;
pub use gcir_net::{ConnectionOptions, Registry, SlotHealth};
