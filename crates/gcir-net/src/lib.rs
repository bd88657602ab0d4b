//! gcir-net: socket management for Global Caché devices.
//!
//! Each IR port gets a [`DeviceConnection`]: a handle over a background
//! actor that owns the TCP socket, serializes the port's command stream,
//! correlates `completeir` acknowledgements by request id, and reconnects
//! with jittered exponential backoff when the link drops. The [`Registry`]
//! owns all connections for a fleet and maps flat slot indices onto them.

pub mod backoff;
pub mod connection;
pub mod registry;

pub use connection::{
    ConnectionOptions, DeviceConnection, ModuleInfo, QueryReply, SendReceipt,
};
pub use registry::{Registry, SlotHealth};
