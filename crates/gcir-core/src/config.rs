//! Registry configuration.
//!
//! The surrounding service owns config *loading* (YAML, env, flags); gcir
//! consumes the already-parsed shape defined here: a list of device entries
//! plus the slot map that assigns flat 1-based slot indices to `module:port`
//! addresses on those devices.

use std::net::Ipv4Addr;

use crate::error::{Error, Result};
use crate::types::{DeviceEndpoint, LogicalAddress, DEFAULT_TCP_PORT};

/// Protocol cap on concurrent TCP sockets per device.
pub const MAX_SOCKETS_PER_DEVICE: u8 = 8;

/// One configured iTach device entry.
///
/// `count > 1` replicates the entry over sequential IPv4 host addresses,
/// which is how racks of identically-configured blasters are provisioned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Hostname or IPv4 address.
    pub host: String,
    /// TCP port, 4998 unless overridden.
    pub tcp_port: u16,
    /// IR module number on the device (iTach: 1).
    pub module: u8,
    /// Number of IR ports to open connections for (iTach: up to 3).
    pub max_ports: u8,
    /// Replication count; entries beyond the first get sequential IPs.
    pub count: u32,
}

impl DeviceConfig {
    /// Create an entry with the standard iTach defaults
    /// (port 4998, module 1, 3 IR ports, no replication).
    pub fn new(host: impl Into<String>) -> Self {
        DeviceConfig {
            host: host.into(),
            tcp_port: DEFAULT_TCP_PORT,
            module: 1,
            max_ports: 3,
            count: 1,
        }
    }

    /// Override the TCP port.
    pub fn tcp_port(mut self, port: u16) -> Self {
        self.tcp_port = port;
        self
    }

    /// Override the IR module number.
    pub fn module(mut self, module: u8) -> Self {
        self.module = module;
        self
    }

    /// Override the number of IR ports to manage.
    pub fn max_ports(mut self, ports: u8) -> Self {
        self.max_ports = ports;
        self
    }

    /// Replicate this entry `count` times over sequential host IPs.
    pub fn count(mut self, count: u32) -> Self {
        self.count = count;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.host.is_empty() {
            return Err(Error::BadConfig("device host is empty".into()));
        }
        if self.module == 0 {
            return Err(Error::BadConfig(format!("{}: module must be >= 1", self.host)));
        }
        if self.max_ports == 0 || self.max_ports > MAX_SOCKETS_PER_DEVICE {
            return Err(Error::BadConfig(format!(
                "{}: max_ports must be 1..={MAX_SOCKETS_PER_DEVICE}, got {}",
                self.host, self.max_ports
            )));
        }
        if self.count == 0 {
            return Err(Error::BadConfig(format!("{}: count must be >= 1", self.host)));
        }
        Ok(())
    }

    /// Expand the replication count into concrete single-device entries.
    ///
    /// Fails with [`Error::BadConfig`] if `count > 1` and the host is not an
    /// IPv4 address (sequential hostnames are not a thing).
    pub fn expand(&self) -> Result<Vec<DeviceConfig>> {
        self.validate()?;
        if self.count == 1 {
            let mut one = self.clone();
            one.count = 1;
            return Ok(vec![one]);
        }
        let base: Ipv4Addr = self.host.parse().map_err(|_| {
            Error::BadConfig(format!(
                "{}: count > 1 requires an IPv4 host to derive sequential addresses",
                self.host
            ))
        })?;
        let base = u32::from(base);
        let mut out = Vec::with_capacity(self.count as usize);
        for i in 0..self.count {
            let ip = base.checked_add(i).ok_or_else(|| {
                Error::BadConfig(format!("{}: sequential IP range overflows", self.host))
            })?;
            let mut entry = self.clone();
            entry.host = Ipv4Addr::from(ip).to_string();
            entry.count = 1;
            out.push(entry);
        }
        Ok(out)
    }

    /// The TCP endpoint of this (already expanded) entry.
    pub fn endpoint(&self) -> DeviceEndpoint {
        DeviceEndpoint::with_port(self.host.clone(), self.tcp_port)
    }
}

/// One entry of the slot map: flat slot index to a port on a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotMapping {
    /// Flat 1-based slot index used by callers.
    pub slot: u16,
    /// Index into the expanded device list.
    pub device: usize,
    /// `module:port` on that device.
    pub address: LogicalAddress,
}

/// Validated registry construction input: expanded devices plus slot map.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Expanded device entries (`count` already resolved, every entry 1).
    pub devices: Vec<DeviceConfig>,
    /// Injective slot map over `devices`.
    pub slots: Vec<SlotMapping>,
}

impl RegistryConfig {
    /// Build a config from device entries and an explicit slot map.
    ///
    /// Device replication counts are expanded first; `slots` indexes the
    /// expanded list. The map must be injective and every address must fall
    /// within the target device's module/port range.
    pub fn new(devices: Vec<DeviceConfig>, slots: Vec<SlotMapping>) -> Result<Self> {
        let mut expanded = Vec::new();
        for d in &devices {
            expanded.extend(d.expand()?);
        }
        let mut seen_slots = std::collections::HashSet::new();
        let mut seen_targets = std::collections::HashSet::new();
        for m in &slots {
            if m.slot == 0 {
                return Err(Error::BadConfig("slot indices are 1-based".into()));
            }
            if !seen_slots.insert(m.slot) {
                return Err(Error::BadConfig(format!("slot {} mapped twice", m.slot)));
            }
            let device = expanded.get(m.device).ok_or_else(|| {
                Error::BadConfig(format!("slot {}: device index {} out of range", m.slot, m.device))
            })?;
            if m.address.module != device.module || m.address.port == 0 || m.address.port > device.max_ports
            {
                return Err(Error::BadConfig(format!(
                    "slot {}: address {} not present on {} (module {}, {} ports)",
                    m.slot, m.address, device.host, device.module, device.max_ports
                )));
            }
            if !seen_targets.insert((m.device, m.address)) {
                return Err(Error::BadConfig(format!(
                    "slot {}: target {} on device {} mapped twice",
                    m.slot, m.address, m.device
                )));
            }
        }
        Ok(RegistryConfig {
            devices: expanded,
            slots,
        })
    }

    /// Build a config with the natural flat slot map: slot 1 is the first
    /// port of the first device, counting up across ports then devices.
    pub fn sequential_slots(devices: Vec<DeviceConfig>) -> Result<Self> {
        let mut expanded = Vec::new();
        for d in &devices {
            expanded.extend(d.expand()?);
        }
        let mut slots = Vec::new();
        let mut next_slot: u16 = 1;
        for (idx, device) in expanded.iter().enumerate() {
            for port in 1..=device.max_ports {
                slots.push(SlotMapping {
                    slot: next_slot,
                    device: idx,
                    address: LogicalAddress::new(device.module, port),
                });
                next_slot = next_slot.checked_add(1).ok_or_else(|| {
                    Error::BadConfig("more than 65535 slots configured".into())
                })?;
            }
        }
        Ok(RegistryConfig {
            devices: expanded,
            slots,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn device_config_defaults() {
        let d = DeviceConfig::new("192.168.70.60");
        assert_eq!(d.tcp_port, 4998);
        assert_eq!(d.module, 1);
        assert_eq!(d.max_ports, 3);
        assert_eq!(d.count, 1);
    }

    #[test]
    fn expand_single_entry_is_identity() {
        let d = DeviceConfig::new("blaster.lab.local");
        let out = d.expand().unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].host, "blaster.lab.local");
    }

    #[test]
    fn expand_count_walks_sequential_ips() {
        let d = DeviceConfig::new("192.168.70.60").count(3);
        let out = d.expand().unwrap();
        let hosts: Vec<_> = out.iter().map(|d| d.host.as_str()).collect();
        assert_eq!(hosts, ["192.168.70.60", "192.168.70.61", "192.168.70.62"]);
        assert!(out.iter().all(|d| d.count == 1));
    }

    #[test]
    fn expand_count_requires_ipv4() {
        let d = DeviceConfig::new("blaster.lab.local").count(2);
        assert!(matches!(d.expand(), Err(Error::BadConfig(_))));
    }

    #[test]
    fn expand_rejects_zero_ports() {
        let d = DeviceConfig::new("192.168.70.60").max_ports(0);
        assert!(matches!(d.expand(), Err(Error::BadConfig(_))));
    }

    #[test]
    fn sequential_slots_cover_all_ports() {
        let cfg = RegistryConfig::sequential_slots(vec![
            DeviceConfig::new("192.168.70.60").count(2).max_ports(3),
        ])
        .unwrap();
        assert_eq!(cfg.devices.len(), 2);
        assert_eq!(cfg.slots.len(), 6);
        assert_eq!(cfg.slots[0].slot, 1);
        assert_eq!(cfg.slots[0].device, 0);
        assert_eq!(cfg.slots[0].address, LogicalAddress::new(1, 1));
        assert_eq!(cfg.slots[5].slot, 6);
        assert_eq!(cfg.slots[5].device, 1);
        assert_eq!(cfg.slots[5].address, LogicalAddress::new(1, 3));
    }

    #[test]
    fn explicit_map_rejects_duplicate_slot() {
        let devices = vec![DeviceConfig::new("192.168.70.60")];
        let slots = vec![
            SlotMapping { slot: 1, device: 0, address: LogicalAddress::new(1, 1) },
            SlotMapping { slot: 1, device: 0, address: LogicalAddress::new(1, 2) },
        ];
        assert!(matches!(
            RegistryConfig::new(devices, slots),
            Err(Error::BadConfig(_))
        ));
    }

    #[test]
    fn explicit_map_rejects_duplicate_target() {
        let devices = vec![DeviceConfig::new("192.168.70.60")];
        let slots = vec![
            SlotMapping { slot: 1, device: 0, address: LogicalAddress::new(1, 1) },
            SlotMapping { slot: 2, device: 0, address: LogicalAddress::new(1, 1) },
        ];
        assert!(matches!(
            RegistryConfig::new(devices, slots),
            Err(Error::BadConfig(_))
        ));
    }

    #[test]
    fn explicit_map_rejects_out_of_range_port() {
        let devices = vec![DeviceConfig::new("192.168.70.60").max_ports(2)];
        let slots = vec![SlotMapping {
            slot: 1,
            device: 0,
            address: LogicalAddress::new(1, 3),
        }];
        assert!(matches!(
            RegistryConfig::new(devices, slots),
            Err(Error::BadConfig(_))
        ));
    }
}
