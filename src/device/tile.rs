//! Emulated tile state.
//!
//! Each tile contains:
//! - Data memory (compute and memory tiles)
//! - Locks, binary or semaphore depending on generation
//! - Core enable/done state (compute tiles)
//! - Shim DMA descriptors and channel start queues (shim tiles)
//! - Performance counters, stream switch event ports and broadcast state
//! - Resource reservation tables
//!
//! Only the state the control plane can observe is modelled; nothing here
//! executes kernels or moves stream data.

use std::collections::{HashMap, VecDeque};

use byteorder::{ByteOrder, LittleEndian};

use super::control::{BdParams, BroadcastDirs, BroadcastSwitch, DmaDirection, Event, ModuleKind, PortRole, PortSide};
use super::control::LOCK_WITH_NO_VALUE;
use super::limits;
use super::resources::TileResources;
use super::{AieGeneration, TileKind};

/// Result of a lock operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockResult {
    /// Operation succeeded
    Success,
    /// Semaphore would go negative, or is below the required value
    WouldUnderflow,
    /// Semaphore would exceed [`Lock::MAX_VALUE`]
    WouldOverflow,
    /// Binary lock is held, or holds a different value than requested
    Busy,
}

/// Lock state.
///
/// AIE-ML locks are 6-bit semaphores (0-63) changed by signed deltas:
/// - Acquire with `v < 0`: waits until `value >= -v`, then adds `v`
/// - Acquire with `v >= 0`: succeeds immediately without a change
/// - Release with `v`: adds `v`, saturating at [`Lock::MAX_VALUE`]
///
/// First-generation AIE locks are binary: an acquired flag plus a 0/1
/// value. Acquire waits until the lock is free and holds the requested
/// value ([`LOCK_WITH_NO_VALUE`] matches either), release stores the new
/// value and frees the lock.
#[derive(Debug, Clone, Copy, Default)]
pub struct Lock {
    /// Current value (semaphore count, or 0/1 for binary locks)
    pub value: u8,
    /// Binary locks only: lock is held
    pub acquired: bool,
    /// Set when a release would exceed MAX_VALUE
    pub overflow: bool,
    /// Set when an operation would go negative
    pub underflow: bool,
}

impl Lock {
    /// Maximum semaphore value (6-bit: 0-63)
    pub const MAX_VALUE: u8 = limits::LOCK_MAX_VALUE;

    /// Create a lock with an initial value (clamped to 0-63)
    #[inline]
    pub fn new(value: u8) -> Self {
        Self { value: value.min(Self::MAX_VALUE), ..Default::default() }
    }

    /// Semaphore acquire.
    ///
    /// Checks `value >= expected_value` and applies `delta`.
    #[inline]
    pub fn acquire_with_value(&mut self, expected_value: u8, delta: i8) -> LockResult {
        if self.value < expected_value {
            return LockResult::WouldUnderflow;
        }
        let new_value = (self.value as i16) + (delta as i16);
        if new_value < 0 {
            self.underflow = true;
            return LockResult::WouldUnderflow;
        }
        if new_value > Self::MAX_VALUE as i16 {
            self.overflow = true;
            self.value = Self::MAX_VALUE;
            return LockResult::WouldOverflow;
        }
        self.value = new_value as u8;
        LockResult::Success
    }

    /// Semaphore release, saturating at MAX_VALUE.
    #[inline]
    pub fn release_with_value(&mut self, delta: i8) -> LockResult {
        let new_value = (self.value as i16) + (delta as i16);
        if new_value < 0 {
            self.underflow = true;
            self.value = 0;
            return LockResult::WouldUnderflow;
        }
        if new_value > Self::MAX_VALUE as i16 {
            self.overflow = true;
            self.value = Self::MAX_VALUE;
            return LockResult::WouldOverflow;
        }
        self.value = new_value as u8;
        LockResult::Success
    }

    /// Binary acquire for `value` (0, 1 or [`LOCK_WITH_NO_VALUE`]).
    pub fn acquire_binary(&mut self, value: i8) -> LockResult {
        if self.acquired {
            return LockResult::Busy;
        }
        if value != LOCK_WITH_NO_VALUE && self.value as i8 != value {
            return LockResult::Busy;
        }
        self.acquired = true;
        LockResult::Success
    }

    /// Binary release, storing `value` unless it is [`LOCK_WITH_NO_VALUE`].
    pub fn release_binary(&mut self, value: i8) -> LockResult {
        if value != LOCK_WITH_NO_VALUE {
            self.value = (value as u8) & 1;
        }
        self.acquired = false;
        LockResult::Success
    }

    /// Generation-dispatched acquire.
    pub fn acquire(&mut self, generation: AieGeneration, value: i8) -> LockResult {
        match generation {
            AieGeneration::Aie => self.acquire_binary(value),
            AieGeneration::AieMl if value < 0 => self.acquire_with_value(value.unsigned_abs(), value),
            AieGeneration::AieMl => LockResult::Success,
        }
    }

    /// Generation-dispatched release.
    pub fn release(&mut self, generation: AieGeneration, value: i8) -> LockResult {
        match generation {
            AieGeneration::Aie => self.release_binary(value),
            AieGeneration::AieMl => self.release_with_value(value),
        }
    }

    /// Set the lock value directly and free it.
    #[inline]
    pub fn set(&mut self, value: u8) {
        self.value = value.min(Self::MAX_VALUE);
        self.acquired = false;
    }

    /// Check if the lock has any error flags set.
    #[inline]
    pub fn has_error(&self) -> bool {
        self.overflow || self.underflow
    }
}

/// Core enable/done state.
#[derive(Debug, Clone, Copy, Default)]
pub struct CoreState {
    /// Core is enabled
    pub enabled: bool,
    /// Done bit (set when the kernel finishes, cleared by enabling)
    pub done: bool,
    /// Event that enables the core when it arrives
    pub enable_event: Option<Event>,
    /// "Disable event occurred" status
    pub disable_event_seen: bool,
    /// Done polls observed since the last enable
    pub polls_since_enable: u32,
}

impl CoreState {
    /// Enable the core, clearing the done bit.
    #[inline]
    pub fn enable(&mut self) {
        self.enabled = true;
        self.done = false;
        self.polls_since_enable = 0;
    }

    #[inline]
    pub fn disable(&mut self) {
        if self.enabled {
            self.disable_event_seen = true;
        }
        self.enabled = false;
    }
}

/// One shim DMA channel.
#[derive(Debug, Clone, Default)]
pub struct ShimChannel {
    /// Channel enabled
    pub enabled: bool,
    /// Descriptors pushed and not yet retired, oldest first
    pub queue: VecDeque<QueuedTask>,
    /// Descriptors retired since reset
    pub completed: u64,
}

/// Start-queue entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedTask {
    pub bd: u16,
    pub repeat: u32,
    pub completion_token: bool,
}

impl ShimChannel {
    /// Retire up to `n` queued descriptors, returning how many retired.
    pub fn retire(&mut self, n: usize) -> usize {
        let n = n.min(self.queue.len());
        self.queue.drain(..n);
        self.completed += n as u64;
        n
    }
}

/// Performance counter state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PerfCounter {
    pub value: u32,
    pub start: Option<Event>,
    pub stop: Option<Event>,
    pub event_value: u32,
}

/// Stream switch event port selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPortSelect {
    pub role: PortRole,
    pub side: PortSide,
    pub stream_id: u8,
}

/// Emulated tile.
#[derive(Debug, Clone)]
pub struct Tile {
    pub kind: TileKind,
    pub col: u8,
    pub row: u8,
    memory: Vec<u8>,
    pub locks: Vec<Lock>,
    pub core: CoreState,
    /// Shim DMA descriptors by slot
    pub bds: Vec<Option<BdParams>>,
    /// Shim DMA channels, `[S2MM, MM2S][channel]`
    pub channels: [[ShimChannel; limits::SHIM_DMA_CHANNELS]; 2],
    pub perf_counters: HashMap<(ModuleKind, u8), PerfCounter>,
    pub event_ports: [Option<EventPortSelect>; limits::STREAM_SWITCH_EVENT_PORTS],
    /// Events driven onto broadcast channels
    pub broadcasts: HashMap<(ModuleKind, u8), Event>,
    /// Blocked directions per broadcast switch and channel
    pub broadcast_blocks: HashMap<(ModuleKind, BroadcastSwitch, u8), BroadcastDirs>,
    pub resources: TileResources,
}

impl Tile {
    pub fn new(kind: TileKind, generation: AieGeneration, col: u8, row: u8) -> Self {
        let (mem_size, num_locks) = match (kind, generation) {
            (TileKind::Shim, _) => (0, limits::SHIM_TILE_NUM_LOCKS),
            (TileKind::MemTile, _) => (limits::MEM_TILE_DATA_MEMORY_SIZE, limits::MEM_TILE_NUM_LOCKS),
            (TileKind::Compute, AieGeneration::Aie) => {
                (limits::AIE_COMPUTE_TILE_DATA_MEMORY_SIZE, limits::COMPUTE_TILE_NUM_LOCKS)
            }
            (TileKind::Compute, AieGeneration::AieMl) => {
                (limits::COMPUTE_TILE_DATA_MEMORY_SIZE, limits::COMPUTE_TILE_NUM_LOCKS)
            }
        };
        let num_bds = if kind == TileKind::Shim { limits::SHIM_NUM_BDS } else { 0 };

        Self {
            kind,
            col,
            row,
            memory: vec![0; mem_size],
            locks: vec![Lock::default(); num_locks],
            core: CoreState::default(),
            bds: vec![None; num_bds],
            channels: Default::default(),
            perf_counters: HashMap::new(),
            event_ports: [None; limits::STREAM_SWITCH_EVENT_PORTS],
            broadcasts: HashMap::new(),
            broadcast_blocks: HashMap::new(),
            resources: TileResources::new(kind),
        }
    }

    /// Data memory size in bytes.
    #[inline]
    pub fn memory_size(&self) -> usize {
        self.memory.len()
    }

    /// Copy data memory into `buf`. Returns false if out of range.
    pub fn read_data(&self, offset: usize, buf: &mut [u8]) -> bool {
        match self.memory.get(offset..offset.saturating_add(buf.len())) {
            Some(src) => {
                buf.copy_from_slice(src);
                true
            }
            None => false,
        }
    }

    /// Copy `data` into data memory. Returns false if out of range.
    pub fn write_data(&mut self, offset: usize, data: &[u8]) -> bool {
        match self.memory.get_mut(offset..offset.saturating_add(data.len())) {
            Some(dst) => {
                dst.copy_from_slice(data);
                true
            }
            None => false,
        }
    }

    pub fn read_data_u32(&self, offset: usize) -> Option<u32> {
        let mut word = [0u8; 4];
        self.read_data(offset, &mut word).then(|| LittleEndian::read_u32(&word))
    }

    pub fn write_data_u32(&mut self, offset: usize, value: u32) -> bool {
        let mut word = [0u8; 4];
        LittleEndian::write_u32(&mut word, value);
        self.write_data(offset, &word)
    }

    /// Shim DMA channel, if present.
    pub fn channel_mut(&mut self, channel: u8, dir: DmaDirection) -> Option<&mut ShimChannel> {
        if self.kind != TileKind::Shim {
            return None;
        }
        let d = match dir {
            DmaDirection::S2mm => 0,
            DmaDirection::Mm2s => 1,
        };
        self.channels[d].get_mut(channel as usize)
    }

    /// Number of performance counters in a module of this tile.
    pub fn perf_counter_count(&mut self, module: ModuleKind) -> usize {
        self.resources.perf_counters(module).capacity()
    }

    /// Return the tile to its power-on state.
    pub fn reset(&mut self, generation: AieGeneration) {
        *self = Tile::new(self.kind, generation, self.col, self.row);
    }
}
