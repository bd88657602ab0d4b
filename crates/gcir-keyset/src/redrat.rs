//! RedRat `KeyManager` XML decoder.
//!
//! RedRat's signal database stores each IR packet as a table of distinct
//! durations (`Lengths`, in milliseconds) plus a Base64 `SigData` blob of
//! two-byte index pairs into that table. A `0x7F` sentinel in the index
//! stream separates the base segment from the repeat segment. This module
//! walks the document, resolves the indices, quantizes the millisecond
//! sequences to modulation cycles, and builds a [`KeysetCatalogue`].

use std::path::Path;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use roxmltree::{Document, Node};
use tracing::{debug, warn};

use gcir_core::{Error, IrWaveform, Result};

use crate::catalogue::KeysetCatalogue;
use crate::quantize::{quantize_sequence, quantize_single};

/// Marks the boundary between base and repeat segments in the index stream.
pub const SEGMENT_SENTINEL: u8 = 0x7F;

/// The only IRPacket flavour this decoder understands.
const SUPPORTED_PACKET_TYPE: &str = "ProntoModulatedSignal";

/// Floor for the quantized intra-signal pause. Some keysets carry pauses so
/// short that the device would run repeats together.
const MIN_INTRA_SIG_PAUSE_CYCLES: u32 = 10;

/// Load a keyset catalogue from a RedRat `KeyManager` XML file.
pub fn load_file(path: impl AsRef<Path>) -> Result<KeysetCatalogue> {
    let path = path.as_ref();
    let xml = std::fs::read_to_string(path)
        .map_err(|e| Error::BadKeyset(format!("{}: {e}", path.display())))?;
    parse_str(&xml)
}

/// Parse a keyset catalogue from RedRat `KeyManager` XML text.
pub fn parse_str(xml: &str) -> Result<KeysetCatalogue> {
    let doc = Document::parse(xml).map_err(|e| Error::BadKeyset(format!("malformed XML: {e}")))?;

    let mut catalogue = KeysetCatalogue::new();
    for device in doc
        .root_element()
        .descendants()
        .filter(|n| n.is_element() && n.tag_name().name() == "AVDevice")
    {
        let device_name = child_text(device, "Name")
            .ok_or_else(|| Error::BadKeyset("AVDevice without a Name".into()))?
            .trim()
            .to_string();

        let Some(signals) = child_element(device, "Signals") else {
            debug!(device = %device_name, "AVDevice has no Signals node, skipping");
            continue;
        };

        for packet in signals
            .children()
            .filter(|n| n.is_element() && n.tag_name().name() == "IRPacket")
        {
            decode_packet(packet, &device_name, &mut catalogue)?;
        }
    }

    debug!(
        devices = catalogue.device_count(),
        keys = catalogue.key_count(),
        "keyset catalogue loaded"
    );
    Ok(catalogue)
}

/// Decode one `IRPacket` node and insert the result into the catalogue.
fn decode_packet(packet: Node<'_, '_>, device_name: &str, catalogue: &mut KeysetCatalogue) -> Result<()> {
    let key_name = child_text(packet, "Name")
        .ok_or_else(|| Error::BadKeyset(format!("device {device_name:?}: IRPacket without a Name")))?
        .trim()
        .to_string();

    let packet_type = packet
        .attributes()
        .find(|a| a.name() == "type")
        .map(|a| a.value())
        .unwrap_or("");
    if packet_type != SUPPORTED_PACKET_TYPE {
        warn!(
            device = %device_name,
            key = %key_name,
            packet_type = %packet_type,
            "unsupported IRPacket type, skipping"
        );
        return Ok(());
    }

    let Some(lengths_node) = child_element(packet, "Lengths") else {
        debug!(device = %device_name, key = %key_name, "IRPacket without Lengths, skipping");
        return Ok(());
    };

    let at = |field: &str| format!("device {device_name:?} key {key_name:?}: {field}");

    let freq: f64 = parse_child(packet, "ModulationFreq", &at)?;
    if !(freq > 0.0) {
        return Err(Error::BadKeyset(at("ModulationFreq must be positive")));
    }
    let pause_ms: f64 = parse_child(packet, "IntraSigPause", &at)?;
    let repeat_count_default: u32 = parse_child(packet, "NoRepeats", &at)?;

    let lengths: Vec<f64> = lengths_node
        .children()
        .filter(|n| n.is_element())
        .map(|n| {
            n.text()
                .unwrap_or("")
                .trim()
                .parse::<f64>()
                .map_err(|_| Error::BadKeyset(at("non-numeric entry in Lengths")))
        })
        .collect::<Result<_>>()?;

    let sig_data = child_text(packet, "SigData").ok_or_else(|| Error::BadKeyset(at("missing SigData")))?;
    let sig_data: String = sig_data.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let raw = BASE64
        .decode(sig_data.as_bytes())
        .map_err(|e| Error::BadKeyset(at(&format!("invalid SigData Base64: {e}"))))?;
    if raw.len() % 2 != 0 {
        return Err(Error::BadKeyset(at("SigData is not a sequence of byte pairs")));
    }

    // The high byte of each pair selects toggle/double-signal variants that
    // GC dispatch does not use; only the low byte indexes Lengths.
    let indices: Vec<u8> = raw.chunks_exact(2).map(|pair| pair[1]).collect();

    let mut segments = indices.split(|&b| b == SEGMENT_SENTINEL);
    let base_ms = resolve_segment(segments.next().unwrap_or(&[]), &lengths, &at)?;
    let repeat_ms = resolve_segment(segments.next().unwrap_or(&[]), &lengths, &at)?;

    let base_cycles = quantize_sequence(&base_ms, freq);
    let repeat_cycles = quantize_sequence(&repeat_ms, freq);

    if base_cycles.is_empty() || base_cycles.len() % 2 != 0 {
        return Err(Error::BadKeyset(at("base segment must be non-empty with even length")));
    }
    if repeat_cycles.len() % 2 != 0 {
        return Err(Error::BadKeyset(at("repeat segment must have even length")));
    }

    let intra_sig_pause_cycles = quantize_single(pause_ms, freq).max(MIN_INTRA_SIG_PAUSE_CYCLES);

    let waveform = IrWaveform {
        modulation_freq_hz: freq,
        base_cycles,
        repeat_cycles,
        repeat_count_default,
        intra_sig_pause_cycles,
    };

    if catalogue
        .insert(device_name.to_string(), key_name.clone(), waveform)
        .is_some()
    {
        warn!(device = %device_name, key = %key_name, "duplicate key name, overwriting");
    }
    Ok(())
}

/// Map an index segment to its millisecond durations.
fn resolve_segment(segment: &[u8], lengths: &[f64], at: &dyn Fn(&str) -> String) -> Result<Vec<f64>> {
    segment
        .iter()
        .map(|&idx| {
            lengths.get(idx as usize).copied().ok_or_else(|| {
                Error::BadKeyset(at(&format!(
                    "SigData index {idx} out of range (Lengths has {} entries)",
                    lengths.len()
                )))
            })
        })
        .collect()
}

fn child_element<'a, 'input>(node: Node<'a, 'input>, name: &str) -> Option<Node<'a, 'input>> {
    node.children()
        .find(|c| c.is_element() && c.tag_name().name() == name)
}

fn child_text<'a>(node: Node<'a, '_>, name: &str) -> Option<&'a str> {
    child_element(node, name).and_then(|c| c.text())
}

fn parse_child<T: std::str::FromStr>(
    node: Node<'_, '_>,
    name: &str,
    at: &dyn Fn(&str) -> String,
) -> Result<T> {
    child_text(node, name)
        .ok_or_else(|| Error::BadKeyset(at(&format!("missing {name}"))))?
        .trim()
        .parse::<T>()
        .map_err(|_| Error::BadKeyset(at(&format!("invalid {name}"))))
}
