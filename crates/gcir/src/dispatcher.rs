//! The dispatch façade: named key presses in, `sendir` commands out.
//!
//! A [`Dispatcher`] ties the keyset catalogue to the device registry. Callers
//! speak in `(slot, device_name, key_name)`; the dispatcher resolves the
//! waveform, computes the repeat count for press or press-and-hold
//! semantics, and drives the right connection.

use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;

use tracing::{debug, warn};

use gcir_core::{IrWaveform, Result};
use gcir_keyset::KeysetCatalogue;
use gcir_net::{Registry, SlotHealth};

/// Per-command repeat cap of the iTach `sendir` implementation.
pub const MAX_REPEATS: u32 = 50;

/// Result of a completed press.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PressOutcome {
    /// The request id the device acknowledged.
    pub request_id: u16,
    /// Wall time from wire write to `completeir`.
    pub elapsed: Duration,
}

/// Routes named key presses to the right device port.
pub struct Dispatcher {
    registry: Registry,
    catalogue: RwLock<Arc<KeysetCatalogue>>,
}

impl Dispatcher {
    /// Build a dispatcher over an opened registry and a loaded catalogue.
    pub fn new(registry: Registry, catalogue: KeysetCatalogue) -> Self {
        Dispatcher {
            registry,
            catalogue: RwLock::new(Arc::new(catalogue)),
        }
    }

    /// Snapshot of the current catalogue.
    ///
    /// In-flight dispatches keep the snapshot they started with even if the
    /// catalogue is swapped underneath them.
    pub fn catalogue(&self) -> Arc<KeysetCatalogue> {
        Arc::clone(
            &self
                .catalogue
                .read()
                .unwrap_or_else(PoisonError::into_inner),
        )
    }

    /// Atomically install a fully-built replacement catalogue.
    pub fn swap_catalogue(&self, next: KeysetCatalogue) {
        let next = Arc::new(next);
        let mut current = self
            .catalogue
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        debug!(
            devices = next.device_count(),
            keys = next.key_count(),
            "catalogue swapped"
        );
        *current = next;
    }

    /// Press a key: transmit its waveform with `count` logical presses.
    ///
    /// For waveforms with a repeat segment, each press plays the keyset's
    /// default number of repeats; base-only waveforms are simply transmitted
    /// `count` times.
    pub async fn press(
        &self,
        slot: u16,
        device: &str,
        key: &str,
        count: u32,
    ) -> Result<PressOutcome> {
        let waveform = self.catalogue().waveform(device, key)?.clone();
        let repeat = clamp_repeat(press_repeat(&waveform, count));
        self.dispatch(slot, device, key, &waveform, repeat).await
    }

    /// Hold a key for approximately `duration_ms` milliseconds.
    ///
    /// The repeat count is chosen so the transmission covers the requested
    /// duration: the base segment plus however many replays are needed.
    pub async fn press_and_hold(
        &self,
        slot: u16,
        device: &str,
        key: &str,
        duration_ms: u64,
    ) -> Result<PressOutcome> {
        let waveform = self.catalogue().waveform(device, key)?.clone();
        let repeat = clamp_repeat(hold_repeat(
            waveform.base_duration_ms(),
            waveform.repeat_duration_ms(),
            duration_ms as f64,
        ));
        self.dispatch(slot, device, key, &waveform, repeat).await
    }

    async fn dispatch(
        &self,
        slot: u16,
        device: &str,
        key: &str,
        waveform: &IrWaveform,
        repeat: u32,
    ) -> Result<PressOutcome> {
        let connection = self.registry.resolve(slot)?;
        debug!(slot, device, key, repeat, address = %connection.address(), "dispatching press");
        let receipt = connection.send_ir(waveform, repeat).await?;
        Ok(PressOutcome {
            request_id: receipt.request_id,
            elapsed: receipt.elapsed,
        })
    }

    /// Cancel whatever the slot's port is transmitting.
    pub async fn stop(&self, slot: u16) -> Result<()> {
        let connection = self.registry.resolve(slot)?;
        debug!(slot, address = %connection.address(), "stopping transmission");
        connection.stop_ir().await
    }

    /// Key names defined for a device, sorted.
    pub fn list_keys(&self, device: &str) -> Result<Vec<String>> {
        Ok(self
            .catalogue()
            .key_names(device)?
            .into_iter()
            .map(str::to_string)
            .collect())
    }

    /// Device names in the catalogue, sorted.
    pub fn device_names(&self) -> Vec<String> {
        self.catalogue()
            .device_names()
            .into_iter()
            .map(str::to_string)
            .collect()
    }

    /// Passive health snapshot of every slot.
    pub fn health(&self) -> Vec<SlotHealth> {
        self.registry.list()
    }

    /// Active health check of every slot (one `getversion,0` each).
    pub async fn check(&self) -> Vec<(u16, Result<String>)> {
        self.registry.check_all().await
    }

    /// Drain and close every connection.
    pub async fn shutdown(&self, deadline: Duration) {
        self.registry.shutdown(deadline).await;
    }
}

/// Repeat count for `count` logical presses of a waveform.
fn press_repeat(waveform: &IrWaveform, count: u32) -> u32 {
    let count = count.max(1);
    if waveform.has_repeat() {
        count.saturating_mul(waveform.repeat_count_default.max(1))
    } else {
        count
    }
}

/// Repeat count that covers `duration_ms` of transmission.
///
/// With a repeat segment: the base plays once, and enough replays follow to
/// reach the duration. Without one, the whole base is replayed instead.
fn hold_repeat(base_ms: f64, repeat_ms: f64, duration_ms: f64) -> u32 {
    let repeat = if repeat_ms > 0.0 {
        ((duration_ms - base_ms) / repeat_ms).ceil() + 1.0
    } else {
        (duration_ms / base_ms).round()
    };
    repeat.max(1.0) as u32
}

fn clamp_repeat(repeat: u32) -> u32 {
    if repeat > MAX_REPEATS {
        warn!(repeat, cap = MAX_REPEATS, "repeat count clamped to device cap");
        MAX_REPEATS
    } else {
        repeat
    }
}
