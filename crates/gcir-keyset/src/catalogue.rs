//! The in-memory keyset catalogue.
//!
//! A [`KeysetCatalogue`] maps `(device_name, key_name)` to a decoded
//! [`IrWaveform`]. It is built once by the decoder and read-only afterwards;
//! reload is handled by building a fresh catalogue and swapping the shared
//! reference at the dispatcher level.

use std::collections::HashMap;

use gcir_core::{Error, IrWaveform, Result};

/// All decoded keysets, indexed by device name then key name.
#[derive(Debug, Default, Clone)]
pub struct KeysetCatalogue {
    devices: HashMap<String, HashMap<String, IrWaveform>>,
}

impl KeysetCatalogue {
    /// Create an empty catalogue.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a waveform, returning the previous entry if the key was
    /// already defined for the device.
    pub(crate) fn insert(
        &mut self,
        device: String,
        key: String,
        waveform: IrWaveform,
    ) -> Option<IrWaveform> {
        self.devices.entry(device).or_default().insert(key, waveform)
    }

    /// Look up the waveform for a named key on a named device.
    pub fn waveform(&self, device: &str, key: &str) -> Result<&IrWaveform> {
        let keys = self
            .devices
            .get(device)
            .ok_or_else(|| Error::UnknownDevice(device.to_string()))?;
        keys.get(key).ok_or_else(|| Error::UnknownKey {
            device: device.to_string(),
            key: key.to_string(),
        })
    }

    /// All device names, sorted.
    pub fn device_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.devices.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// All key names for a device, sorted.
    pub fn key_names(&self, device: &str) -> Result<Vec<&str>> {
        let keys = self
            .devices
            .get(device)
            .ok_or_else(|| Error::UnknownDevice(device.to_string()))?;
        let mut names: Vec<&str> = keys.keys().map(String::as_str).collect();
        names.sort_unstable();
        Ok(names)
    }

    /// Number of devices in the catalogue.
    pub fn device_count(&self) -> usize {
        self.devices.len()
    }

    /// Total number of keys across all devices.
    pub fn key_count(&self) -> usize {
        self.devices.values().map(HashMap::len).sum()
    }

    /// Whether the catalogue holds no devices at all.
    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wf(freq: f64) -> IrWaveform {
        IrWaveform {
            modulation_freq_hz: freq,
            base_cycles: vec![10, 40],
            repeat_cycles: vec![],
            repeat_count_default: 0,
            intra_sig_pause_cycles: 200,
        }
    }

    #[test]
    fn lookup_round_trip() {
        let mut cat = KeysetCatalogue::new();
        cat.insert("STB".into(), "POWER".into(), wf(38_000.0));
        let w = cat.waveform("STB", "POWER").unwrap();
        assert_eq!(w.modulation_freq_hz, 38_000.0);
    }

    #[test]
    fn unknown_device_and_key() {
        let mut cat = KeysetCatalogue::new();
        cat.insert("STB".into(), "POWER".into(), wf(38_000.0));
        assert!(matches!(
            cat.waveform("TV", "POWER"),
            Err(Error::UnknownDevice(_))
        ));
        assert!(matches!(
            cat.waveform("STB", "GUIDE"),
            Err(Error::UnknownKey { .. })
        ));
    }

    #[test]
    fn insert_overwrites_and_reports() {
        let mut cat = KeysetCatalogue::new();
        assert!(cat.insert("STB".into(), "POWER".into(), wf(38_000.0)).is_none());
        let prev = cat.insert("STB".into(), "POWER".into(), wf(40_000.0));
        assert_eq!(prev.unwrap().modulation_freq_hz, 38_000.0);
        assert_eq!(cat.waveform("STB", "POWER").unwrap().modulation_freq_hz, 40_000.0);
        assert_eq!(cat.key_count(), 1);
    }

    #[test]
    fn names_are_sorted() {
        let mut cat = KeysetCatalogue::new();
        cat.insert("XR11".into(), "VOL_UP".into(), wf(38_000.0));
        cat.insert("XR11".into(), "GUIDE".into(), wf(38_000.0));
        cat.insert("Samsung-TV".into(), "POWER".into(), wf(38_000.0));
        assert_eq!(cat.device_names(), ["Samsung-TV", "XR11"]);
        assert_eq!(cat.key_names("XR11").unwrap(), ["GUIDE", "VOL_UP"]);
    }
}
