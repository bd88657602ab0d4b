//! gcir-keyset: RedRat keyset decoding for gcir.
//!
//! Turns a RedRat `KeyManager` XML export into a [`KeysetCatalogue`] of
//! [`IrWaveform`](gcir_core::IrWaveform)s ready for Global Caché dispatch:
//!
//! ```no_run
//! # fn main() -> gcir_core::Result<()> {
//! let catalogue = gcir_keyset::load_file("keysets/REDRAT_KEYMANAGER.xml")?;
//! let waveform = catalogue.waveform("XR11", "POWER")?;
//! println!("{} cycles of base signal", waveform.base_cycles.len());
//! # Ok(())
//! # }
//! ```

pub mod catalogue;
pub mod quantize;
pub mod redrat;

pub use catalogue::KeysetCatalogue;
pub use redrat::{load_file, parse_str, SEGMENT_SENTINEL};
