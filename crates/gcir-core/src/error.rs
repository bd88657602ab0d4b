//! Error types for gcir.
//!
//! All fallible operations across the library return [`Result<T>`], which
//! uses [`Error`] as the error type. Keyset-load, configuration, lookup,
//! transport, and device-reported errors are all captured here.

/// The error type for all gcir operations.
///
/// Variants cover the full range of failure modes encountered when decoding
/// keysets and driving Global Caché devices: bad input files, unknown
/// addresses, link failures, and errors reported by the device itself.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The RedRat keyset file could not be decoded.
    ///
    /// The message names the offending device/key where known.
    #[error("bad keyset: {0}")]
    BadKeyset(String),

    /// The device or slot configuration is invalid.
    #[error("bad configuration: {0}")]
    BadConfig(String),

    /// The requested slot is not present in the registry's slot map.
    #[error("unknown slot {0}")]
    UnknownSlot(u16),

    /// The requested device name is not in the keyset catalogue.
    #[error("unknown device {0:?}")]
    UnknownDevice(String),

    /// The requested key name is not defined for the device.
    #[error("unknown key {key:?} for device {device:?}")]
    UnknownKey {
        /// The device whose keyset was consulted.
        device: String,
        /// The key name that was not found.
        key: String,
    },

    /// The connection is not in the Ready state (connecting, faulted, or
    /// draining). The request was not attempted.
    #[error("connection not ready")]
    NotReady,

    /// The TCP link to the device was lost while a request was pending.
    #[error("link lost")]
    LinkLost,

    /// Timed out waiting for the device to acknowledge a request.
    #[error("timeout waiting for response")]
    Timeout,

    /// The per-port outbound queue is full.
    #[error("device busy: outbound queue full")]
    DeviceBusy,

    /// The device returned an `ERR` response with the given numeric code.
    #[error("device error {0}")]
    DeviceError(u16),

    /// The in-flight request was cancelled by a `stopir`.
    #[error("cancelled by stop")]
    Cancelled,

    /// An internal invariant was violated. Indicates a bug; not retriable.
    #[error("invariant violated: {0}")]
    Invariant(String),

    /// An underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`Error`] as the error type.
pub type Result<T> = std::result::Result<T, Error>;
