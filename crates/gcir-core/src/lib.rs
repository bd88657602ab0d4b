//! gcir-core: Core types, errors, and configuration for gcir.
//!
//! This crate defines the shapes shared by every gcir layer. The keyset
//! decoder produces [`IrWaveform`]s, the wire codec consumes them, and the
//! connection layer reports [`HealthRecord`]s -- none of which depend on any
//! I/O machinery.
//!
//! # Key types
//!
//! - [`IrWaveform`] -- canonical IR signal in modulation cycles
//! - [`LogicalAddress`] / [`DeviceEndpoint`] -- device addressing
//! - [`ConnectionState`] / [`HealthRecord`] -- connection health
//! - [`DeviceConfig`] / [`RegistryConfig`] -- registry construction input
//! - [`Error`] / [`Result`] -- error handling

pub mod config;
pub mod error;
pub mod types;

// Re-export key types at crate root for ergonomic `use gcir_core::*`.
pub use config::{DeviceConfig, RegistryConfig, SlotMapping, MAX_SOCKETS_PER_DEVICE};
pub use error::{Error, Result};
pub use types::{
    ConnectionState, DeviceEndpoint, HealthRecord, IrWaveform, LogicalAddress, ParseAddressError,
    DEFAULT_TCP_PORT,
};
