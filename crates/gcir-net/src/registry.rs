//! The device registry: slot index to managed connection.
//!
//! Built once from a validated [`RegistryConfig`]. Every configured IR port
//! gets its own [`DeviceConnection`]; the slot map then exposes a subset of
//! those ports under flat 1-based slot indices for the dispatcher.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinSet;
use tracing::debug;

use gcir_core::{
    DeviceEndpoint, Error, HealthRecord, LogicalAddress, RegistryConfig, Result,
};

use crate::connection::{ConnectionOptions, DeviceConnection};

/// Health of one slot, for diagnostics.
#[derive(Debug, Clone)]
pub struct SlotHealth {
    /// Flat slot index.
    pub slot: u16,
    /// Device the slot points at.
    pub endpoint: DeviceEndpoint,
    /// `module:port` on that device.
    pub address: LogicalAddress,
    /// Connection health snapshot.
    pub health: HealthRecord,
}

/// Owns every [`DeviceConnection`] and maps slots onto them.
pub struct Registry {
    slots: BTreeMap<u16, Arc<DeviceConnection>>,
    connections: Vec<Arc<DeviceConnection>>,
}

impl Registry {
    /// Open connections for every configured port, with default options.
    ///
    /// Must be called within a tokio runtime; connects proceed in the
    /// background.
    pub fn open(config: RegistryConfig) -> Self {
        Self::open_with_options(config, ConnectionOptions::default())
    }

    /// Open connections with explicit per-connection options.
    pub fn open_with_options(config: RegistryConfig, options: ConnectionOptions) -> Self {
        let mut connections = Vec::new();
        let mut by_target: HashMap<(usize, LogicalAddress), Arc<DeviceConnection>> =
            HashMap::new();
        for (idx, device) in config.devices.iter().enumerate() {
            for port in 1..=device.max_ports {
                let address = LogicalAddress::new(device.module, port);
                let conn = Arc::new(DeviceConnection::open_with_options(
                    device.endpoint(),
                    address,
                    options.clone(),
                ));
                by_target.insert((idx, address), Arc::clone(&conn));
                connections.push(conn);
            }
        }

        let mut slots = BTreeMap::new();
        for mapping in &config.slots {
            // The config validated every mapping against the device list.
            if let Some(conn) = by_target.get(&(mapping.device, mapping.address)) {
                slots.insert(mapping.slot, Arc::clone(conn));
            }
        }

        debug!(
            devices = config.devices.len(),
            connections = connections.len(),
            slots = slots.len(),
            "registry opened"
        );
        Registry { slots, connections }
    }

    /// Resolve a slot to its connection.
    pub fn resolve(&self, slot: u16) -> Result<&Arc<DeviceConnection>> {
        self.slots.get(&slot).ok_or(Error::UnknownSlot(slot))
    }

    /// Health of every slot, ordered by slot index.
    pub fn list(&self) -> Vec<SlotHealth> {
        self.slots
            .iter()
            .map(|(&slot, conn)| SlotHealth {
                slot,
                endpoint: conn.endpoint().clone(),
                address: conn.address(),
                health: conn.health(),
            })
            .collect()
    }

    /// Actively health-check every slot (`getversion,0` per connection),
    /// concurrently. Results are ordered by slot index.
    pub async fn check_all(&self) -> Vec<(u16, Result<String>)> {
        let mut set = JoinSet::new();
        for (&slot, conn) in &self.slots {
            let conn = Arc::clone(conn);
            set.spawn(async move { (slot, conn.check().await) });
        }
        let mut results = Vec::with_capacity(self.slots.len());
        while let Some(joined) = set.join_next().await {
            if let Ok(entry) = joined {
                results.push(entry);
            }
        }
        results.sort_by_key(|(slot, _)| *slot);
        results
    }

    /// Number of mapped slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// Number of managed connections (one per configured port).
    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    /// Drain and close every connection, each bounded by `deadline`.
    pub async fn shutdown(&self, deadline: Duration) {
        debug!(connections = self.connections.len(), "registry shutting down");
        let mut set = JoinSet::new();
        for conn in &self.connections {
            let conn = Arc::clone(conn);
            set.spawn(async move { conn.close(deadline).await });
        }
        while set.join_next().await.is_some() {}
    }
}
