//! Hardware limits and protocol constants used by the control plane.
//!
//! Memory and lock sizes follow AMD AM020 (AIE-ML Architecture Manual) and
//! AM009 (AI Engine Architecture Manual). Resource counts follow the
//! per-module event/trace hardware (AM025 register reference).

// ============================================================================
// Memory and locks
// ============================================================================

/// Data memory per AIE-ML compute tile: 64 KB (AM020 Ch4)
pub const COMPUTE_TILE_DATA_MEMORY_SIZE: usize = 64 * 1024;

/// Data memory per first-generation AIE compute tile: 32 KB (AM009 Ch4)
pub const AIE_COMPUTE_TILE_DATA_MEMORY_SIZE: usize = 32 * 1024;

/// Data memory per memory tile: 512 KB (AM020 Ch5)
pub const MEM_TILE_DATA_MEMORY_SIZE: usize = 512 * 1024;

/// Locks per compute tile: 16
pub const COMPUTE_TILE_NUM_LOCKS: usize = 16;

/// Locks per memory tile: 64 (AM020 Ch5)
pub const MEM_TILE_NUM_LOCKS: usize = 64;

/// Locks per shim tile: 16
pub const SHIM_TILE_NUM_LOCKS: usize = 16;

/// Largest AIE-ML semaphore value (6-bit state)
pub const LOCK_MAX_VALUE: u8 = 63;

/// Default lock acquire timeout passed to the tile control interface.
pub const LOCK_TIMEOUT: u32 = 0x7FFF_FFFF;

// ============================================================================
// Shim DMA
// ============================================================================

/// Buffer descriptors per shim DMA
pub const SHIM_NUM_BDS: usize = 16;

/// Channels per direction on a shim DMA (S2MM 0/1, MM2S 0/1)
pub const SHIM_DMA_CHANNELS: usize = 2;

/// Start-queue depth of a shim DMA channel
pub const SHIM_DMA_QUEUE_DEPTH: u8 = 4;

/// Logical streaming channels 0/1 are S2MM, 2/3 are MM2S.
pub const LOGICAL_CHANNELS: u8 = 4;

// ============================================================================
// Events and counters
// ============================================================================

/// Performance counters in a core module
pub const CORE_PERF_COUNTERS: usize = 4;

/// Performance counters in a compute tile memory module
pub const MEMORY_PERF_COUNTERS: usize = 2;

/// Performance counters in a memory tile
pub const MEM_TILE_PERF_COUNTERS: usize = 4;

/// Performance counters in a shim PL module
pub const PL_PERF_COUNTERS: usize = 2;

/// Stream switch event ports per tile
pub const STREAM_SWITCH_EVENT_PORTS: usize = 8;

/// Broadcast channels per module
pub const BROADCAST_CHANNELS: usize = 16;

/// Broadcast channel used to start cores together.
pub const ENABLE_BROADCAST_CHANNEL: u8 = 6;

/// Minimum timer ticks between firing the enable broadcast and disarming
/// the cores' enable event.
pub const ENABLE_BROADCAST_DELAY: u64 = 150;

/// Broadcast relay latency per column hop, in cycles.
pub const BROADCAST_HOP_CYCLES: i64 = 2;

/// Fixed broadcast latency independent of distance, in cycles.
pub const BROADCAST_FIXED_CYCLES: i64 = 2;

// ============================================================================
// Graph control
// ============================================================================

/// Largest cycle budget accepted by cycle-bounded waits (48-bit timer).
pub const MAX_CYCLE_BUDGET: u64 = 0xFFFF_FFFF_FFFF;

/// Byte distance from a core's iteration cell back to its termination flag.
pub const END_FLAG_OFFSET: u64 = 4;
