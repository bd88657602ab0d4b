//! Global Caché Unified TCP command/response encoding and decoding.
//!
//! The protocol is ASCII lines terminated by a carriage return (`\r`, byte
//! `0x0D`). Commands flow from controller to device; each command that takes
//! a request id is acknowledged by a matching `completeir` line.
//!
//! # Line formats
//!
//! ```text
//! Command:   sendir,<module>:<port>,<id>,<freq>,<repeat>,<offset>,<d1>,<d2>,...\r
//!            stopir,<module>:<port>\r
//!            getdevices\r  get_IRL\r  getversion,0\r
//! Response:  completeir,<module>:<port>,<id>\r
//!            busyIR,<module>:<port>,<id>\r
//!            stopir,<module>:<port>\r
//!            device,<module>,<ports> <TYPE>\r   endlistdevices\r
//!            ERR_<module>:<port>,<code>\r       ERR <code>\r
//! ```
//!
//! All encoding/decoding here is pure parsing -- no I/O is performed.

use bytes::{BufMut, BytesMut};

use gcir_core::{Error, IrWaveform, LogicalAddress, Result};

/// Command/response terminator byte.
pub const TERMINATOR: u8 = 0x0D;

// ---------------------------------------------------------------------------
// Request ids
// ---------------------------------------------------------------------------

/// Per-connection `sendir` request-id sequence.
///
/// Ids run 1..=65535 and wrap, skipping 0. The window between reuse (65535
/// requests) is far wider than any plausible set of outstanding ids.
#[derive(Debug, Clone)]
pub struct RequestIdSeq {
    next: u16,
}

impl RequestIdSeq {
    /// Start a fresh sequence at id 1.
    pub fn new() -> Self {
        RequestIdSeq { next: 1 }
    }

    /// Take the next id.
    pub fn next_id(&mut self) -> u16 {
        let id = self.next;
        self.next = if self.next == u16::MAX { 1 } else { self.next + 1 };
        id
    }
}

impl Default for RequestIdSeq {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Command encoding
// ---------------------------------------------------------------------------

/// A fully-specified `sendir` command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendIr {
    /// Target IR connector.
    pub address: LogicalAddress,
    /// Request id echoed back in `completeir`.
    pub id: u16,
    /// Carrier frequency in hertz.
    pub freq_hz: u32,
    /// Total transmissions of the repeat unit (see [`SendIr::from_waveform`]).
    pub repeat: u32,
    /// 1-based index into `durations` where replays start.
    pub offset: u32,
    /// Flattened pulse/space durations in carrier cycles.
    pub durations: Vec<u32>,
}

impl SendIr {
    /// Build a `sendir` from a decoded waveform.
    ///
    /// With a repeat segment present, the duration list is
    /// `base ++ pause ++ repeat` and the offset points at the pause, so the
    /// device plays the base once and then replays pause+repeat
    /// `repeat - 1` further times. Base-only waveforms replay from the
    /// start: offset 1, `repeat` total transmissions.
    pub fn from_waveform(
        address: LogicalAddress,
        id: u16,
        waveform: &IrWaveform,
        repeat: u32,
    ) -> SendIr {
        let (durations, offset) = if waveform.has_repeat() {
            let mut durations =
                Vec::with_capacity(waveform.base_cycles.len() + 1 + waveform.repeat_cycles.len());
            durations.extend_from_slice(&waveform.base_cycles);
            durations.push(waveform.intra_sig_pause_cycles);
            durations.extend_from_slice(&waveform.repeat_cycles);
            (durations, waveform.base_cycles.len() as u32 + 1)
        } else {
            (waveform.base_cycles.clone(), 1)
        };
        SendIr {
            address,
            id,
            freq_hz: waveform.modulation_freq_hz.round() as u32,
            repeat,
            offset,
            durations,
        }
    }

    /// Encode the command as a `\r`-terminated wire line.
    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(40 + self.durations.len() * 6);
        buf.put_slice(
            format!(
                "sendir,{},{},{},{},{}",
                self.address, self.id, self.freq_hz, self.repeat, self.offset
            )
            .as_bytes(),
        );
        for d in &self.durations {
            buf.put_slice(format!(",{d}").as_bytes());
        }
        buf.put_u8(TERMINATOR);
        buf.to_vec()
    }

    /// Parse a `sendir` line (with or without the trailing `\r`) back into
    /// its fields. Used by the test harness to validate controller output.
    pub fn parse(line: &str) -> Result<SendIr> {
        let line = line.trim_end_matches('\r');
        let mut fields = line.split(',');
        let bad = |what: &str| Error::Invariant(format!("malformed sendir line ({what}): {line:?}"));
        if fields.next() != Some("sendir") {
            return Err(bad("verb"));
        }
        let address: LogicalAddress = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| bad("address"))?;
        let id: u16 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| bad("id"))?;
        let freq_hz: u32 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| bad("freq"))?;
        let repeat: u32 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| bad("repeat"))?;
        let offset: u32 = fields
            .next()
            .and_then(|s| s.parse().ok())
            .ok_or_else(|| bad("offset"))?;
        let durations: Vec<u32> = fields
            .map(|s| s.parse().map_err(|_| bad("duration")))
            .collect::<Result<_>>()?;
        if durations.is_empty() {
            return Err(bad("empty durations"));
        }
        Ok(SendIr {
            address,
            id,
            freq_hz,
            repeat,
            offset,
            durations,
        })
    }
}

/// Encode a `stopir` command for the given port.
pub fn encode_stopir(address: LogicalAddress) -> Vec<u8> {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_slice(format!("stopir,{address}").as_bytes());
    buf.put_u8(TERMINATOR);
    buf.to_vec()
}

/// Encode a `getdevices` query.
pub fn encode_getdevices() -> Vec<u8> {
    b"getdevices\r".to_vec()
}

/// Encode a `getversion,0` query.
pub fn encode_getversion() -> Vec<u8> {
    b"getversion,0\r".to_vec()
}

/// Encode a `get_IRL` query (reports whether the IR learner is active).
pub fn encode_get_irl() -> Vec<u8> {
    b"get_IRL\r".to_vec()
}

// ---------------------------------------------------------------------------
// Response decoding
// ---------------------------------------------------------------------------

/// A decoded line from the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// `sendir` with the given id finished transmitting.
    CompleteIr {
        /// Port that finished.
        address: LogicalAddress,
        /// Request id of the finished command.
        id: u16,
    },
    /// The port is still transmitting a prior command; the new one is held.
    BusyIr {
        /// Port that is busy.
        address: LogicalAddress,
        /// Id of the command that found the port busy.
        id: u16,
    },
    /// Acknowledgement of a `stopir`.
    StopIr {
        /// Port whose transmission was cancelled.
        address: LogicalAddress,
    },
    /// One `device,...` line of a `getdevices` listing.
    Device {
        /// Module number.
        module: u8,
        /// Number of ports on the module.
        ports: u8,
        /// Module kind as reported (`IR`, `ETHERNET`, ...).
        kind: String,
    },
    /// Terminator of a `getdevices` listing.
    EndListDevices,
    /// An `ERR` response, optionally naming the offending port.
    Err {
        /// Port the error refers to, when the device included one.
        address: Option<LogicalAddress>,
        /// Numeric error code; 0 when the device sent none.
        code: u16,
    },
    /// The IR learner is enabled; IR transmission is unavailable.
    LearnerEnabled,
    /// Any other line: version strings and unrecognized traffic, routed to
    /// whichever query is pending.
    Info(String),
}

/// Decode one `\r`-terminated line from the device.
///
/// Total: lines that match no known frame become [`Response::Info`].
pub fn parse_response(line: &str) -> Response {
    let line = line.trim_end_matches('\r').trim_end_matches('\n');

    if let Some(rest) = line.strip_prefix("completeir,") {
        if let Some((address, id)) = parse_addr_id(rest) {
            return Response::CompleteIr { address, id };
        }
    }
    if let Some(rest) = line.strip_prefix("busyIR,") {
        if let Some((address, id)) = parse_addr_id(rest) {
            return Response::BusyIr { address, id };
        }
    }
    if let Some(rest) = line.strip_prefix("stopir,") {
        if let Ok(address) = rest.parse() {
            return Response::StopIr { address };
        }
    }
    if let Some(rest) = line.strip_prefix("device,") {
        // "device,<module>,<ports> <TYPE>"
        if let Some((module, rest)) = rest.split_once(',') {
            let (ports, kind) = rest.split_once(' ').unwrap_or((rest, ""));
            if let (Ok(module), Ok(ports)) = (module.parse(), ports.parse()) {
                return Response::Device {
                    module,
                    ports,
                    kind: kind.trim().to_string(),
                };
            }
        }
    }
    if line == "endlistdevices" {
        return Response::EndListDevices;
    }
    if line == "IR Learner Enabled" {
        return Response::LearnerEnabled;
    }
    if let Some(rest) = line.strip_prefix("ERR") {
        // Accept both "ERR_<module>:<port>,<code>" and "ERR <code>".
        let rest = rest.trim_start_matches(['_', ' ']);
        if let Some((addr, code)) = rest.split_once(',') {
            return Response::Err {
                address: addr.parse().ok(),
                code: code.trim().parse().unwrap_or(0),
            };
        }
        return Response::Err {
            address: None,
            code: rest.trim().parse().unwrap_or(0),
        };
    }

    Response::Info(line.to_string())
}

/// Parse `"<module>:<port>,<id>"`.
fn parse_addr_id(s: &str) -> Option<(LogicalAddress, u16)> {
    let (addr, id) = s.split_once(',')?;
    Some((addr.parse().ok()?, id.trim().parse().ok()?))
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

    // -----------------------------------------------------------------------
    // sendir encoding
    // -----------------------------------------------------------------------

    #[test]
    fn sendir_line_from_waveform() {
        let cmd = SendIr::from_waveform(LogicalAddress::new(1, 2), 7, &sample_waveform(), 3);
        assert_eq!(cmd.encode(), b"sendir,1:2,7,40000,3,3,10,40,200,40,10\r");
    }

    #[test]
    fn sendir_base_only_uses_offset_one() {
        let mut w = sample_waveform();
        w.repeat_cycles.clear();
        let cmd = SendIr::from_waveform(LogicalAddress::new(1, 1), 9, &w, 2);
        assert_eq!(cmd.offset, 1);
        assert_eq!(cmd.durations, vec![10, 40]);
        assert_eq!(cmd.encode(), b"sendir,1:1,9,40000,2,1,10,40\r");
    }

    #[test]
    fn sendir_rounds_fractional_frequency() {
        let mut w = sample_waveform();
        w.modulation_freq_hz = 38_222.7;
        let cmd = SendIr::from_waveform(LogicalAddress::new(1, 1), 1, &w, 1);
        assert_eq!(cmd.freq_hz, 38_223);
    }

    // -----------------------------------------------------------------------
    // sendir round trip
    // -----------------------------------------------------------------------

    #[test]
    fn sendir_parse_recovers_every_field() {
        let original = SendIr::from_waveform(LogicalAddress::new(2, 3), 41, &sample_waveform(), 5);
        let line = String::from_utf8(original.encode()).unwrap();
        let parsed = SendIr::parse(&line).unwrap();
        assert_eq!(parsed, original);
    }

    #[test]
    fn sendir_parse_rejects_malformed() {
        assert!(SendIr::parse("sendir,1:2,7,40000,3").is_err());
        assert!(SendIr::parse("stopir,1:2").is_err());
        assert!(SendIr::parse("sendir,1:2,7,40000,3,3,10,forty").is_err());
    }

    // -----------------------------------------------------------------------
    // Request ids
    // -----------------------------------------------------------------------

    #[test]
    fn id_seq_skips_zero_and_wraps() {
        let mut seq = RequestIdSeq { next: u16::MAX };
        assert_eq!(seq.next_id(), 65_535);
        assert_eq!(seq.next_id(), 1);
    }

    #[test]
    fn id_seq_unique_over_window() {
        let mut seq = RequestIdSeq::new();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..1024 {
            assert!(seen.insert(seq.next_id()), "id reused inside window");
        }
    }

    // -----------------------------------------------------------------------
    // Other commands
    // -----------------------------------------------------------------------

    #[test]
    fn simple_command_lines() {
        assert_eq!(encode_stopir(LogicalAddress::new(1, 2)), b"stopir,1:2\r");
        assert_eq!(encode_getdevices(), b"getdevices\r");
        assert_eq!(encode_getversion(), b"getversion,0\r");
        assert_eq!(encode_get_irl(), b"get_IRL\r");
    }

    // -----------------------------------------------------------------------
    // Response decoding
    // -----------------------------------------------------------------------

    #[test]
    fn parse_completeir() {
        assert_eq!(
            parse_response("completeir,1:2,7\r"),
            Response::CompleteIr {
                address: LogicalAddress::new(1, 2),
                id: 7
            }
        );
    }

    #[test]
    fn parse_busyir() {
        assert_eq!(
            parse_response("busyIR,1:2,7"),
            Response::BusyIr {
                address: LogicalAddress::new(1, 2),
                id: 7
            }
        );
    }

    #[test]
    fn parse_stopir_ack() {
        assert_eq!(
            parse_response("stopir,1:3"),
            Response::StopIr {
                address: LogicalAddress::new(1, 3)
            }
        );
    }

    #[test]
    fn parse_device_listing() {
        assert_eq!(
            parse_response("device,1,3 IR"),
            Response::Device {
                module: 1,
                ports: 3,
                kind: "IR".into()
            }
        );
        assert_eq!(parse_response("endlistdevices"), Response::EndListDevices);
    }

    #[test]
    fn parse_err_with_address() {
        assert_eq!(
            parse_response("ERR_1:2,014"),
            Response::Err {
                address: Some(LogicalAddress::new(1, 2)),
                code: 14
            }
        );
    }

    #[test]
    fn parse_err_bare_code() {
        assert_eq!(
            parse_response("ERR 3"),
            Response::Err {
                address: None,
                code: 3
            }
        );
    }

    #[test]
    fn parse_learner_enabled() {
        assert_eq!(parse_response("IR Learner Enabled"), Response::LearnerEnabled);
    }

    #[test]
    fn version_line_is_info() {
        assert_eq!(
            parse_response("710-1001-05\r"),
            Response::Info("710-1001-05".into())
        );
    }

    #[test]
    fn completeir_with_garbage_id_is_info() {
        assert_eq!(
            parse_response("completeir,1:2,banana"),
            Response::Info("completeir,1:2,banana".into())
        );
    }
}
