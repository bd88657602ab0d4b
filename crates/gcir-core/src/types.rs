//! Core types used throughout gcir.
//!
//! These types are shared by the keyset decoder, the wire codec, and the
//! connection layer: the canonical waveform representation, device
//! addressing, and per-connection health snapshots.

use std::fmt;
use std::str::FromStr;
use std::time::Instant;

/// Default Global Caché Unified TCP listener port.
pub const DEFAULT_TCP_PORT: u16 = 4998;

/// A decoded IR signal in the canonical form consumed by Global Caché
/// devices: pulse/space durations expressed as integer counts of modulation
/// carrier cycles.
///
/// Invariants (established by the keyset decoder):
/// - `base_cycles` is non-empty with even length; every element is >= 1.
/// - `repeat_cycles` is empty or has even length; every element is >= 1.
/// - `intra_sig_pause_cycles` >= 1; it is the space inserted before each
///   replay of the repeat segment.
#[derive(Debug, Clone, PartialEq)]
pub struct IrWaveform {
    /// Carrier frequency in hertz, typically 36–40 kHz.
    pub modulation_freq_hz: f64,
    /// Alternating pulse/space durations emitted exactly once per command.
    pub base_cycles: Vec<u32>,
    /// Alternating pulse/space durations replayed for key repeats. May be
    /// empty for signals that have no repeat form.
    pub repeat_cycles: Vec<u32>,
    /// How many times the repeat segment follows the base segment for one
    /// logical press (the keyset's `NoRepeats`).
    pub repeat_count_default: u32,
    /// Space duration preceding each repeat segment, in cycles.
    pub intra_sig_pause_cycles: u32,
}

impl IrWaveform {
    /// Whether this waveform carries a repeat segment.
    pub fn has_repeat(&self) -> bool {
        !self.repeat_cycles.is_empty()
    }

    /// Duration of one playback of the base segment, in milliseconds.
    pub fn base_duration_ms(&self) -> f64 {
        cycles_to_ms(&self.base_cycles, self.modulation_freq_hz)
    }

    /// Duration of one replay of the repeat segment, in milliseconds,
    /// including the intra-signal pause that precedes each replay.
    ///
    /// Returns 0.0 when there is no repeat segment.
    pub fn repeat_duration_ms(&self) -> f64 {
        if self.repeat_cycles.is_empty() {
            return 0.0;
        }
        let pause = self.intra_sig_pause_cycles as f64 / self.modulation_freq_hz * 1000.0;
        pause + cycles_to_ms(&self.repeat_cycles, self.modulation_freq_hz)
    }
}

fn cycles_to_ms(cycles: &[u32], freq_hz: f64) -> f64 {
    cycles.iter().map(|&c| c as f64).sum::<f64>() / freq_hz * 1000.0
}

/// A `module:port` pair addressing one IR connector on a device.
///
/// Both components are 1-based; iTach units expose IR as module 1,
/// ports 1–3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LogicalAddress {
    /// Module number, >= 1.
    pub module: u8,
    /// Port number within the module, >= 1.
    pub port: u8,
}

impl LogicalAddress {
    /// Create a new logical address.
    pub fn new(module: u8, port: u8) -> Self {
        LogicalAddress { module, port }
    }
}

impl fmt::Display for LogicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.module, self.port)
    }
}

/// Error returned when a string cannot be parsed into a [`LogicalAddress`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseAddressError(String);

impl fmt::Display for ParseAddressError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid module:port address: {:?}", self.0)
    }
}

impl std::error::Error for ParseAddressError {}

impl FromStr for LogicalAddress {
    type Err = ParseAddressError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let (module, port) = s
            .split_once(':')
            .ok_or_else(|| ParseAddressError(s.to_string()))?;
        let module: u8 = module
            .parse()
            .map_err(|_| ParseAddressError(s.to_string()))?;
        let port: u8 = port.parse().map_err(|_| ParseAddressError(s.to_string()))?;
        if module == 0 || port == 0 {
            return Err(ParseAddressError(s.to_string()));
        }
        Ok(LogicalAddress { module, port })
    }
}

/// A device's TCP endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceEndpoint {
    /// Hostname or IP address.
    pub host: String,
    /// TCP port, [`DEFAULT_TCP_PORT`] unless overridden.
    pub tcp_port: u16,
}

impl DeviceEndpoint {
    /// Create an endpoint on the default Global Caché port (4998).
    pub fn new(host: impl Into<String>) -> Self {
        DeviceEndpoint {
            host: host.into(),
            tcp_port: DEFAULT_TCP_PORT,
        }
    }

    /// Create an endpoint with an explicit TCP port.
    pub fn with_port(host: impl Into<String>, tcp_port: u16) -> Self {
        DeviceEndpoint {
            host: host.into(),
            tcp_port,
        }
    }
}

impl fmt::Display for DeviceEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.tcp_port)
    }
}

/// Lifecycle state of a device connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No socket; nothing scheduled.
    Disconnected,
    /// TCP connect in progress.
    Connecting,
    /// Socket up; accepting requests.
    Ready,
    /// Close requested; refusing new requests, finishing in-flight work.
    Draining,
    /// Socket lost or connect failed; reconnect scheduled with backoff.
    Faulted,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Ready => "ready",
            ConnectionState::Draining => "draining",
            ConnectionState::Faulted => "faulted",
        };
        write!(f, "{s}")
    }
}

/// Point-in-time health snapshot of one device connection.
#[derive(Debug, Clone)]
pub struct HealthRecord {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// When the last successful exchange completed.
    pub last_ok_at: Option<Instant>,
    /// Consecutive failed exchanges since the last success.
    pub consecutive_failures: u32,
    /// Description of the most recent error, if any.
    pub last_error: Option<String>,
}

impl Default for HealthRecord {
    fn default() -> Self {
        HealthRecord {
            state: ConnectionState::Disconnected,
            last_ok_at: None,
            consecutive_failures: 0,
            last_error: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_waveform() -> IrWaveform {
        IrWaveform {
            modulation_freq_hz: 40_000.0,
            base_cycles: vec![10, 40],
            repeat_cycles: vec![40, 10],
            repeat_count_default: 1,
            intra_sig_pause_cycles: 200,
        }
    }

    #[test]
    fn base_duration_from_cycles() {
        let w = sample_waveform();
        // 50 cycles at 40 kHz = 1.25 ms.
        assert!((w.base_duration_ms() - 1.25).abs() < 1e-9);
    }

    #[test]
    fn repeat_duration_includes_pause() {
        let w = sample_waveform();
        // (200 + 50) cycles at 40 kHz = 6.25 ms.
        assert!((w.repeat_duration_ms() - 6.25).abs() < 1e-9);
    }

    #[test]
    fn repeat_duration_zero_without_repeat_segment() {
        let mut w = sample_waveform();
        w.repeat_cycles.clear();
        assert!(!w.has_repeat());
        assert_eq!(w.repeat_duration_ms(), 0.0);
    }

    #[test]
    fn address_display_round_trip() {
        let addr = LogicalAddress::new(1, 3);
        assert_eq!(addr.to_string(), "1:3");
        assert_eq!("1:3".parse::<LogicalAddress>().unwrap(), addr);
    }

    #[test]
    fn address_parse_rejects_garbage() {
        assert!("1".parse::<LogicalAddress>().is_err());
        assert!("a:b".parse::<LogicalAddress>().is_err());
        assert!("0:1".parse::<LogicalAddress>().is_err());
        assert!("1:0".parse::<LogicalAddress>().is_err());
    }

    #[test]
    fn endpoint_defaults_to_gc_port() {
        let ep = DeviceEndpoint::new("192.168.70.60");
        assert_eq!(ep.tcp_port, 4998);
        assert_eq!(ep.to_string(), "192.168.70.60:4998");
    }

    #[test]
    fn connection_state_display() {
        assert_eq!(ConnectionState::Ready.to_string(), "ready");
        assert_eq!(ConnectionState::Faulted.to_string(), "faulted");
    }

    #[test]
    fn health_record_default_is_disconnected() {
        let h = HealthRecord::default();
        assert_eq!(h.state, ConnectionState::Disconnected);
        assert!(h.last_ok_at.is_none());
        assert_eq!(h.consecutive_failures, 0);
    }
}
