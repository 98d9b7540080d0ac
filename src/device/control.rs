//! Tile control interface.
//!
//! [`TileControl`] is the boundary between the control plane and the
//! hardware. Every method is a stateless primitive on one absolute tile (or
//! on a set of tiles, for broadcast reservations). Implementations report
//! failures as a [`DriverStatus`]; callers OR statuses together across a
//! logical operation.
//!
//! The crate ships one implementation, the emulated
//! [`TileArray`](super::TileArray). A hardware backend maps each method to
//! the equivalent aie-rt call.

use std::fmt;
use std::ops::BitOr;

use serde::{Deserialize, Serialize};

use super::resources::AcquiredResource;
use super::{AieGeneration, TileLoc};
use crate::error::DriverStatus;

/// Result of a single primitive.
pub type DriverResult<T> = std::result::Result<T, DriverStatus>;

/// Lock value meaning "any value" on binary locks.
pub const LOCK_WITH_NO_VALUE: i8 = -1;

/// Hardware module within a tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModuleKind {
    /// Core module (compute tiles).
    Core,
    /// Memory module (compute tiles and memory tiles).
    Memory,
    /// PL/NoC interface module (shim tiles).
    Pl,
}

/// DMA channel direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DmaDirection {
    /// Stream to memory (array -> host).
    S2mm,
    /// Memory to stream (host -> array).
    Mm2s,
}

impl fmt::Display for DmaDirection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DmaDirection::S2mm => write!(f, "S2MM"),
            DmaDirection::Mm2s => write!(f, "MM2S"),
        }
    }
}

/// Buffer descriptor contents programmed into a shim DMA slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BdParams {
    /// Host address of the first byte.
    pub address: u64,
    /// Transfer length in bytes.
    pub length: u32,
    /// AXI burst length.
    pub burst_length: u8,
    /// Skip lock handshakes for this descriptor.
    pub lock_free: bool,
    /// Descriptor to continue with after this one.
    pub next_bd: Option<u16>,
}

impl BdParams {
    /// Single contiguous transfer.
    pub fn simple(address: u64, length: u32) -> Self {
        Self { address, length, ..Default::default() }
    }

    /// Set the AXI burst length.
    pub fn with_burst(mut self, burst_length: u8) -> Self {
        self.burst_length = burst_length;
        self
    }

    /// Mark the descriptor lock-free.
    pub fn lock_free(mut self) -> Self {
        self.lock_free = true;
        self
    }

    /// Chain to another descriptor.
    pub fn with_next(mut self, next: u16) -> Self {
        self.next_bd = Some(next);
        self
    }
}

/// Logical event, mapped to generation-specific event numbers by the backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    /// Stream switch event port `n` saw a running (valid, ready) word.
    PortRunning(u8),
    /// Stream switch event port `n` went idle.
    PortIdle(u8),
    /// Performance counter `n` reached its event value.
    PerfCounter(u8),
    /// Software-generated user event 0.
    UserEvent0,
    /// Event arriving on broadcast channel `n`.
    Broadcast(u8),
}

/// Stream switch port role as seen from the switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PortRole {
    /// Port the switch receives from.
    Slave,
    /// Port the switch sends to.
    Master,
}

/// Stream switch port side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PortSide {
    South,
    North,
    East,
    West,
}

/// One of the two broadcast switches of a module.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BroadcastSwitch {
    A,
    B,
}

/// Set of broadcast propagation directions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct BroadcastDirs(pub u8);

impl BroadcastDirs {
    pub const NONE: Self = Self(0);
    pub const SOUTH: Self = Self(1 << 0);
    pub const WEST: Self = Self(1 << 1);
    pub const NORTH: Self = Self(1 << 2);
    pub const EAST: Self = Self(1 << 3);

    #[inline]
    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }

    #[inline]
    pub fn without(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }
}

impl BitOr for BroadcastDirs {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

/// Primitive hardware operations on an array partition.
///
/// All coordinates are absolute. Methods take `&self`; implementations
/// provide their own interior synchronization. Blocking primitives
/// (`lock_acquire`, `dma_wait_done`) honor the timeout they are given and
/// report expiry as [`DriverStatus::LOCK_TIMEOUT`] or
/// [`DriverStatus::DMA_TIMEOUT`].
///
/// # Example
///
/// ```ignore
/// let core = device.locate(TileKind::Compute, 0, 0)?;
/// ctrl.write_word(core, 0x4000, 3)?;
/// ctrl.core_enable(core)?;
/// while !ctrl.core_read_done(core)? {}
/// ctrl.core_disable(core)?;
/// ```
pub trait TileControl: Send + Sync + fmt::Debug {
    /// Generation of the array behind this interface.
    fn generation(&self) -> AieGeneration;

    // --- data memory -------------------------------------------------------

    fn read_word(&self, tile: TileLoc, addr: u64) -> DriverResult<u32>;
    fn write_word(&self, tile: TileLoc, addr: u64, value: u32) -> DriverResult<()>;
    /// Read `buf.len()` bytes; lengths need not be word multiples.
    fn block_read(&self, tile: TileLoc, addr: u64, buf: &mut [u8]) -> DriverResult<()>;
    /// Write `data`; lengths need not be word multiples.
    fn block_write(&self, tile: TileLoc, addr: u64, data: &[u8]) -> DriverResult<()>;

    // --- locks ---------------------------------------------------------------

    /// Acquire `lock` with a generation-specific value
    /// ([`LOCK_WITH_NO_VALUE`] on binary locks, a signed delta on
    /// semaphores).
    fn lock_acquire(&self, tile: TileLoc, lock: u16, value: i8, timeout: u32) -> DriverResult<()>;
    fn lock_release(&self, tile: TileLoc, lock: u16, value: i8, timeout: u32) -> DriverResult<()>;
    fn lock_set_value(&self, tile: TileLoc, lock: u16, value: i8) -> DriverResult<()>;

    // --- shim DMA ------------------------------------------------------------

    fn dma_channel_enable(&self, tile: TileLoc, channel: u8, dir: DmaDirection) -> DriverResult<()>;
    /// Start-queue depth of the tile's DMA channels.
    fn dma_queue_depth(&self, tile: TileLoc) -> DriverResult<u8>;
    fn dma_program_descriptor(&self, tile: TileLoc, bd: u16, params: &BdParams) -> DriverResult<()>;
    /// Push a descriptor (chain) onto a channel's start queue.
    fn dma_push_to_queue(
        &self,
        tile: TileLoc,
        channel: u8,
        dir: DmaDirection,
        bd: u16,
        repeat: u32,
        completion_token: bool,
    ) -> DriverResult<()>;
    /// Descriptors queued or in progress on a channel.
    fn dma_pending_count(&self, tile: TileLoc, channel: u8, dir: DmaDirection) -> DriverResult<u8>;
    /// Wait up to `timeout` polls for the channel to go idle.
    fn dma_wait_done(&self, tile: TileLoc, channel: u8, dir: DmaDirection, timeout: u32) -> DriverResult<()>;

    // --- cores ---------------------------------------------------------------

    fn core_enable(&self, tile: TileLoc) -> DriverResult<()>;
    fn core_disable(&self, tile: TileLoc) -> DriverResult<()>;
    fn core_read_done(&self, tile: TileLoc) -> DriverResult<bool>;
    /// Clear the core's "disable event occurred" status.
    fn core_clear_disable_event(&self, tile: TileLoc) -> DriverResult<()>;
    /// Arm (`Some`) or disarm (`None`) the event that enables the core.
    fn core_set_enable_event(&self, tile: TileLoc, event: Option<Event>) -> DriverResult<()>;
    fn read_timer(&self, tile: TileLoc, module: ModuleKind) -> DriverResult<u64>;
    fn event_generate(&self, tile: TileLoc, module: ModuleKind, event: Event) -> DriverResult<()>;

    // --- performance counters ----------------------------------------------

    fn perf_counter_configure(
        &self,
        tile: TileLoc,
        module: ModuleKind,
        id: u8,
        start: Event,
        stop: Event,
    ) -> DriverResult<()>;
    fn perf_counter_set_event_value(&self, tile: TileLoc, module: ModuleKind, id: u8, value: u32) -> DriverResult<()>;
    fn perf_counter_get(&self, tile: TileLoc, module: ModuleKind, id: u8) -> DriverResult<u32>;
    /// Clear the counter value and its start/stop/reset control.
    fn perf_counter_reset(&self, tile: TileLoc, module: ModuleKind, id: u8) -> DriverResult<()>;

    // --- stream switch event ports -----------------------------------------

    fn stream_switch_select_port(
        &self,
        tile: TileLoc,
        port: u8,
        role: PortRole,
        side: PortSide,
        stream_id: u8,
    ) -> DriverResult<()>;
    fn stream_switch_reset_port(&self, tile: TileLoc, port: u8) -> DriverResult<()>;

    // --- broadcast -----------------------------------------------------------

    /// Drive `event` onto broadcast `channel` from this tile.
    fn broadcast_configure(&self, tile: TileLoc, module: ModuleKind, channel: u8, event: Event) -> DriverResult<()>;
    fn broadcast_reset(&self, tile: TileLoc, module: ModuleKind, channel: u8) -> DriverResult<()>;
    fn broadcast_block(
        &self,
        tile: TileLoc,
        module: ModuleKind,
        switch: BroadcastSwitch,
        channel: u8,
        dirs: BroadcastDirs,
    ) -> DriverResult<()>;
    fn broadcast_unblock(
        &self,
        tile: TileLoc,
        module: ModuleKind,
        switch: BroadcastSwitch,
        channel: u8,
        dirs: BroadcastDirs,
    ) -> DriverResult<()>;

    // --- resource allocation -----------------------------------------------

    /// Reserve a performance counter; `Ok(None)` when all are taken.
    fn request_perf_counter(&self, tile: TileLoc, module: ModuleKind) -> DriverResult<Option<u8>>;
    /// Reserve a stream switch event port; `Ok(None)` when all are taken.
    fn request_event_port(&self, tile: TileLoc) -> DriverResult<Option<u8>>;
    /// Reserve one broadcast channel id free on every listed tile.
    fn request_broadcast(&self, tiles: &[TileLoc], module: ModuleKind) -> DriverResult<Option<u8>>;
    fn release_resource(&self, resource: &AcquiredResource) -> DriverResult<()>;

    /// Reset every tile of the partition.
    fn reset_array(&self) -> DriverResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broadcast_dirs() {
        let all = BroadcastDirs::WEST | BroadcastDirs::NORTH | BroadcastDirs::SOUTH;
        assert!(all.contains(BroadcastDirs::NORTH));
        assert!(!all.contains(BroadcastDirs::EAST));
        assert_eq!(all.without(BroadcastDirs::WEST), BroadcastDirs::NORTH | BroadcastDirs::SOUTH);
    }

    #[test]
    fn test_bd_builder() {
        let bd = BdParams::simple(0x1000, 256).with_burst(16).lock_free().with_next(3);
        assert_eq!(bd.address, 0x1000);
        assert_eq!(bd.length, 256);
        assert_eq!(bd.burst_length, 16);
        assert!(bd.lock_free);
        assert_eq!(bd.next_bd, Some(3));
    }
}
