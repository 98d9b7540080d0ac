//! Emulated tile array.
//!
//! [`TileArray`] implements [`TileControl`] entirely in host memory. It is
//! the default backend for the binary and the backend every unit test in
//! this crate drives. Beyond the trait it exposes hooks that stand in for
//! the array side: forcing core done bits, retiring DMA descriptors,
//! presetting counters, injecting release failures.
//!
//! # Timing Model
//!
//! Nothing runs concurrently with the host, so blocking primitives resolve
//! immediately: a lock acquire that cannot succeed now reports
//! [`DriverStatus::LOCK_TIMEOUT`], a DMA wait on a busy channel reports
//! [`DriverStatus::DMA_TIMEOUT`]. The array timer is shared by all tiles
//! and advances by a fixed step on every read, so cycle-based waits
//! terminate.
//!
//! # Storage
//!
//! Tiles are stored in a flat Vec, column-major: `tiles[col * rows + row]`.

use std::sync::{Arc, Mutex, MutexGuard};

use super::control::{
    BdParams, BroadcastDirs, BroadcastSwitch, DmaDirection, DriverResult, Event, ModuleKind,
    PortRole, PortSide, TileControl,
};
use super::limits;
use super::resources::AcquiredResource;
use super::tile::{CoreState, EventPortSelect, Lock, LockResult, PerfCounter, QueuedTask, Tile};
use super::{AieGeneration, DeviceConfig, TileKind, TileLoc};
use crate::error::DriverStatus;

/// Primitive call counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct EmuStats {
    pub word_reads: u64,
    pub word_writes: u64,
    pub block_reads: u64,
    pub block_writes: u64,
    pub lock_acquires: u64,
    pub lock_releases: u64,
    pub bd_writes: u64,
    pub dma_pushes: u64,
    pub dma_pending_polls: u64,
    pub dma_wait_done_calls: u64,
    pub core_enables: u64,
    pub core_disables: u64,
    pub done_polls: u64,
    pub timer_reads: u64,
    pub events_generated: u64,
    pub releases: u64,
    pub release_failures: u64,
    pub array_resets: u64,
}

#[derive(Debug)]
struct ArrayState {
    tiles: Vec<Tile>,
    rows: u8,
    timer: u64,
    timer_step: u64,
    /// Retire one queued descriptor per pending-count poll, and everything
    /// on a done wait.
    auto_drain: bool,
    /// Enabled cores report done after this many done polls.
    core_autocomplete: Option<u32>,
    /// Index (0-based, counted over all calls) of a release to fail.
    fail_release_at: Option<u64>,
    events: Vec<(TileLoc, ModuleKind, Event)>,
    stats: EmuStats,
}

impl ArrayState {
    fn tile_mut(&mut self, loc: TileLoc) -> DriverResult<&mut Tile> {
        let idx = loc.col() as usize * self.rows as usize + loc.row() as usize;
        if loc.row() >= self.rows {
            return Err(DriverStatus::INVALID_TILE);
        }
        self.tiles.get_mut(idx).ok_or(DriverStatus::INVALID_TILE)
    }

    fn compute_mut(&mut self, loc: TileLoc) -> DriverResult<&mut Tile> {
        let tile = self.tile_mut(loc)?;
        if tile.kind != TileKind::Compute {
            return Err(DriverStatus::INVALID_TILE);
        }
        Ok(tile)
    }

    fn channel_mut(
        &mut self,
        loc: TileLoc,
        channel: u8,
        dir: DmaDirection,
    ) -> DriverResult<&mut super::tile::ShimChannel> {
        self.tile_mut(loc)?
            .channel_mut(channel, dir)
            .ok_or(DriverStatus::INVALID_DMA)
    }

    fn counter_mut(&mut self, loc: TileLoc, module: ModuleKind, id: u8) -> DriverResult<&mut PerfCounter> {
        let tile = self.tile_mut(loc)?;
        if id as usize >= tile.perf_counter_count(module) {
            return Err(DriverStatus::INVALID_RESOURCE);
        }
        Ok(tile.perf_counters.entry((module, id)).or_default())
    }
}

/// Emulated array partition.
#[derive(Debug)]
pub struct TileArray {
    device: Arc<DeviceConfig>,
    state: Mutex<ArrayState>,
}

impl TileArray {
    /// Create an array for the given geometry.
    pub fn new(device: Arc<DeviceConfig>) -> Self {
        let rows = device.num_rows;
        let capacity = device.num_cols as usize * rows as usize;
        let mut tiles = Vec::with_capacity(capacity);

        // Column-major, matching tile_mut indexing
        for col in 0..device.num_cols {
            for row in 0..rows {
                let kind = device.tile_kind(TileLoc::absolute(col, row));
                tiles.push(Tile::new(kind, device.generation, col, row));
            }
        }

        log::debug!(
            "Emulated {} array: {} columns x {} rows",
            device.generation, device.num_cols, rows
        );

        Self {
            device,
            state: Mutex::new(ArrayState {
                tiles,
                rows,
                timer: 0,
                timer_step: 1,
                auto_drain: false,
                core_autocomplete: None,
                fail_release_at: None,
                events: Vec::new(),
                stats: EmuStats::default(),
            }),
        }
    }

    /// Phoenix-sized AIE-ML array.
    pub fn npu1() -> Self {
        Self::new(Arc::new(DeviceConfig::npu1()))
    }

    /// VCK190-sized first-generation array.
    pub fn vck190() -> Self {
        Self::new(Arc::new(DeviceConfig::vck190()))
    }

    pub fn device(&self) -> &Arc<DeviceConfig> {
        &self.device
    }

    fn lock_state(&self) -> DriverResult<MutexGuard<'_, ArrayState>> {
        self.state.lock().map_err(|_| DriverStatus::ERR)
    }

    fn with<T>(&self, f: impl FnOnce(&mut ArrayState) -> DriverResult<T>) -> DriverResult<T> {
        let mut state = self.lock_state()?;
        f(&mut state)
    }

    // --- array-side hooks ---------------------------------------------------

    /// Call counters so far.
    pub fn stats(&self) -> EmuStats {
        self.with(|s| Ok(s.stats)).unwrap_or_default()
    }

    /// Force a core's done bit.
    pub fn set_core_done(&self, tile: TileLoc, done: bool) -> DriverResult<()> {
        self.with(|s| {
            s.compute_mut(tile)?.core.done = done;
            Ok(())
        })
    }

    pub fn core_state(&self, tile: TileLoc) -> Option<CoreState> {
        self.with(|s| Ok(s.compute_mut(tile)?.core)).ok()
    }

    /// Make enabled cores finish after `polls` done polls (`None` = never).
    pub fn set_core_autocomplete(&self, polls: Option<u32>) {
        let _ = self.with(|s| {
            s.core_autocomplete = polls;
            Ok(())
        });
    }

    /// Retire one descriptor per pending poll and everything on a done wait.
    pub fn set_auto_drain(&self, enabled: bool) {
        let _ = self.with(|s| {
            s.auto_drain = enabled;
            Ok(())
        });
    }

    /// Retire up to `n` descriptors on a channel.
    pub fn drain_dma(&self, tile: TileLoc, channel: u8, dir: DmaDirection, n: usize) -> DriverResult<usize> {
        self.with(|s| Ok(s.channel_mut(tile, channel, dir)?.retire(n)))
    }

    /// Descriptor ids waiting on a channel, oldest first.
    pub fn queued(&self, tile: TileLoc, channel: u8, dir: DmaDirection) -> Vec<QueuedTask> {
        self.with(|s| Ok(s.channel_mut(tile, channel, dir)?.queue.iter().copied().collect()))
            .unwrap_or_default()
    }

    pub fn channel_enabled(&self, tile: TileLoc, channel: u8, dir: DmaDirection) -> bool {
        self.with(|s| Ok(s.channel_mut(tile, channel, dir)?.enabled)).unwrap_or(false)
    }

    pub fn descriptor(&self, tile: TileLoc, bd: u16) -> Option<BdParams> {
        self.with(|s| Ok(s.tile_mut(tile)?.bds.get(bd as usize).copied().flatten()))
            .ok()
            .flatten()
    }

    pub fn set_timer(&self, value: u64) {
        let _ = self.with(|s| {
            s.timer = value;
            Ok(())
        });
    }

    /// Ticks the timer advances per read.
    pub fn set_timer_step(&self, step: u64) {
        let _ = self.with(|s| {
            s.timer_step = step;
            Ok(())
        });
    }

    pub fn set_perf_counter(&self, tile: TileLoc, module: ModuleKind, id: u8, value: u32) -> DriverResult<()> {
        self.with(|s| {
            s.counter_mut(tile, module, id)?.value = value;
            Ok(())
        })
    }

    pub fn perf_counter(&self, tile: TileLoc, module: ModuleKind, id: u8) -> Option<PerfCounter> {
        self.with(|s| Ok(*s.counter_mut(tile, module, id)?)).ok()
    }

    pub fn event_port(&self, tile: TileLoc, port: u8) -> Option<EventPortSelect> {
        self.with(|s| Ok(s.tile_mut(tile)?.event_ports.get(port as usize).copied().flatten()))
            .ok()
            .flatten()
    }

    /// Fail the `index`-th release call (0-based, over the array's lifetime).
    pub fn fail_release_at(&self, index: Option<u64>) {
        let _ = self.with(|s| {
            s.fail_release_at = index;
            Ok(())
        });
    }

    pub fn lock(&self, tile: TileLoc, id: u16) -> Option<Lock> {
        self.with(|s| Ok(s.tile_mut(tile)?.locks.get(id as usize).copied())).ok().flatten()
    }

    /// Events generated so far, in order.
    pub fn generated_events(&self) -> Vec<(TileLoc, ModuleKind, Event)> {
        self.with(|s| Ok(s.events.clone())).unwrap_or_default()
    }

    pub fn broadcast_event(&self, tile: TileLoc, module: ModuleKind, channel: u8) -> Option<Event> {
        self.with(|s| Ok(s.tile_mut(tile)?.broadcasts.get(&(module, channel)).copied()))
            .ok()
            .flatten()
    }

    pub fn broadcast_blocked(
        &self,
        tile: TileLoc,
        module: ModuleKind,
        switch: BroadcastSwitch,
        channel: u8,
    ) -> BroadcastDirs {
        self.with(|s| {
            Ok(s.tile_mut(tile)?
                .broadcast_blocks
                .get(&(module, switch, channel))
                .copied()
                .unwrap_or_default())
        })
        .unwrap_or_default()
    }

    pub fn perf_counters_in_use(&self, tile: TileLoc, module: ModuleKind) -> usize {
        self.with(|s| Ok(s.tile_mut(tile)?.resources.perf_counters(module).in_use()))
            .unwrap_or(0)
    }

    pub fn event_ports_in_use(&self, tile: TileLoc) -> usize {
        self.with(|s| Ok(s.tile_mut(tile)?.resources.event_ports.in_use())).unwrap_or(0)
    }

    pub fn broadcasts_in_use(&self, tile: TileLoc, module: ModuleKind) -> usize {
        self.with(|s| Ok(s.tile_mut(tile)?.resources.broadcast(module).in_use()))
            .unwrap_or(0)
    }

    /// Reserve a broadcast channel outside the control plane, as another
    /// tool sharing the partition would.
    pub fn reserve_broadcast(&self, tile: TileLoc, module: ModuleKind, id: u8) -> bool {
        self.with(|s| Ok(s.tile_mut(tile)?.resources.broadcast(module).reserve(id)))
            .unwrap_or(false)
    }
}

impl TileControl for TileArray {
    fn generation(&self) -> AieGeneration {
        self.device.generation
    }

    fn read_word(&self, tile: TileLoc, addr: u64) -> DriverResult<u32> {
        self.with(|s| {
            s.stats.word_reads += 1;
            s.tile_mut(tile)?
                .read_data_u32(addr as usize)
                .ok_or(DriverStatus::INVALID_ADDRESS)
        })
    }

    fn write_word(&self, tile: TileLoc, addr: u64, value: u32) -> DriverResult<()> {
        self.with(|s| {
            s.stats.word_writes += 1;
            log::trace!("{} write 0x{:05X} = 0x{:08X}", tile, addr, value);
            if s.tile_mut(tile)?.write_data_u32(addr as usize, value) {
                Ok(())
            } else {
                Err(DriverStatus::INVALID_ADDRESS)
            }
        })
    }

    fn block_read(&self, tile: TileLoc, addr: u64, buf: &mut [u8]) -> DriverResult<()> {
        self.with(|s| {
            s.stats.block_reads += 1;
            if s.tile_mut(tile)?.read_data(addr as usize, buf) {
                Ok(())
            } else {
                Err(DriverStatus::INVALID_ADDRESS)
            }
        })
    }

    fn block_write(&self, tile: TileLoc, addr: u64, data: &[u8]) -> DriverResult<()> {
        self.with(|s| {
            s.stats.block_writes += 1;
            log::trace!("{} block write 0x{:05X} ({} bytes)", tile, addr, data.len());
            if s.tile_mut(tile)?.write_data(addr as usize, data) {
                Ok(())
            } else {
                Err(DriverStatus::INVALID_ADDRESS)
            }
        })
    }

    fn lock_acquire(&self, tile: TileLoc, lock: u16, value: i8, _timeout: u32) -> DriverResult<()> {
        let generation = self.device.generation;
        self.with(|s| {
            s.stats.lock_acquires += 1;
            let l = s
                .tile_mut(tile)?
                .locks
                .get_mut(lock as usize)
                .ok_or(DriverStatus::INVALID_LOCK)?;
            match l.acquire(generation, value) {
                LockResult::Success => Ok(()),
                // Nothing else can change the lock while we wait
                _ => {
                    log::debug!("{} lock {} acquire({}) would block (value {})", tile, lock, value, l.value);
                    Err(DriverStatus::LOCK_TIMEOUT)
                }
            }
        })
    }

    fn lock_release(&self, tile: TileLoc, lock: u16, value: i8, _timeout: u32) -> DriverResult<()> {
        let generation = self.device.generation;
        self.with(|s| {
            s.stats.lock_releases += 1;
            let l = s
                .tile_mut(tile)?
                .locks
                .get_mut(lock as usize)
                .ok_or(DriverStatus::INVALID_LOCK)?;
            l.release(generation, value);
            Ok(())
        })
    }

    fn lock_set_value(&self, tile: TileLoc, lock: u16, value: i8) -> DriverResult<()> {
        if value < 0 {
            return Err(DriverStatus::INVALID_LOCK);
        }
        self.with(|s| {
            s.tile_mut(tile)?
                .locks
                .get_mut(lock as usize)
                .ok_or(DriverStatus::INVALID_LOCK)?
                .set(value as u8);
            Ok(())
        })
    }

    fn dma_channel_enable(&self, tile: TileLoc, channel: u8, dir: DmaDirection) -> DriverResult<()> {
        self.with(|s| {
            s.channel_mut(tile, channel, dir)?.enabled = true;
            Ok(())
        })
    }

    fn dma_queue_depth(&self, tile: TileLoc) -> DriverResult<u8> {
        self.with(|s| match s.tile_mut(tile)?.kind {
            TileKind::Shim => Ok(limits::SHIM_DMA_QUEUE_DEPTH),
            _ => Err(DriverStatus::INVALID_DMA),
        })
    }

    fn dma_program_descriptor(&self, tile: TileLoc, bd: u16, params: &BdParams) -> DriverResult<()> {
        self.with(|s| {
            s.stats.bd_writes += 1;
            let slot = s
                .tile_mut(tile)?
                .bds
                .get_mut(bd as usize)
                .ok_or(DriverStatus::INVALID_DMA)?;
            *slot = Some(*params);
            Ok(())
        })
    }

    fn dma_push_to_queue(
        &self,
        tile: TileLoc,
        channel: u8,
        dir: DmaDirection,
        bd: u16,
        repeat: u32,
        completion_token: bool,
    ) -> DriverResult<()> {
        self.with(|s| {
            s.stats.dma_pushes += 1;
            let programmed = matches!(s.tile_mut(tile)?.bds.get(bd as usize), Some(Some(_)));
            if !programmed {
                return Err(DriverStatus::INVALID_DMA);
            }
            let ch = s.channel_mut(tile, channel, dir)?;
            if ch.queue.len() >= limits::SHIM_DMA_QUEUE_DEPTH as usize {
                return Err(DriverStatus::QUEUE_FULL);
            }
            ch.queue.push_back(QueuedTask { bd, repeat, completion_token });
            Ok(())
        })
    }

    fn dma_pending_count(&self, tile: TileLoc, channel: u8, dir: DmaDirection) -> DriverResult<u8> {
        self.with(|s| {
            s.stats.dma_pending_polls += 1;
            let auto_drain = s.auto_drain;
            let ch = s.channel_mut(tile, channel, dir)?;
            let pending = ch.queue.len() as u8;
            if auto_drain {
                ch.retire(1);
            }
            Ok(pending)
        })
    }

    fn dma_wait_done(&self, tile: TileLoc, channel: u8, dir: DmaDirection, _timeout: u32) -> DriverResult<()> {
        self.with(|s| {
            s.stats.dma_wait_done_calls += 1;
            let auto_drain = s.auto_drain;
            let ch = s.channel_mut(tile, channel, dir)?;
            if auto_drain {
                let n = ch.queue.len();
                ch.retire(n);
            }
            if ch.queue.is_empty() {
                Ok(())
            } else {
                Err(DriverStatus::DMA_TIMEOUT)
            }
        })
    }

    fn core_enable(&self, tile: TileLoc) -> DriverResult<()> {
        self.with(|s| {
            s.stats.core_enables += 1;
            s.compute_mut(tile)?.core.enable();
            Ok(())
        })
    }

    fn core_disable(&self, tile: TileLoc) -> DriverResult<()> {
        self.with(|s| {
            s.stats.core_disables += 1;
            s.compute_mut(tile)?.core.disable();
            Ok(())
        })
    }

    fn core_read_done(&self, tile: TileLoc) -> DriverResult<bool> {
        self.with(|s| {
            s.stats.done_polls += 1;
            let autocomplete = s.core_autocomplete;
            let core = &mut s.compute_mut(tile)?.core;
            if let (true, Some(after)) = (core.enabled, autocomplete) {
                core.polls_since_enable += 1;
                if core.polls_since_enable >= after {
                    core.done = true;
                }
            }
            Ok(core.done)
        })
    }

    fn core_clear_disable_event(&self, tile: TileLoc) -> DriverResult<()> {
        self.with(|s| {
            s.compute_mut(tile)?.core.disable_event_seen = false;
            Ok(())
        })
    }

    fn core_set_enable_event(&self, tile: TileLoc, event: Option<Event>) -> DriverResult<()> {
        self.with(|s| {
            s.compute_mut(tile)?.core.enable_event = event;
            Ok(())
        })
    }

    fn read_timer(&self, tile: TileLoc, _module: ModuleKind) -> DriverResult<u64> {
        self.with(|s| {
            s.tile_mut(tile)?;
            s.stats.timer_reads += 1;
            let now = s.timer;
            s.timer = s.timer.wrapping_add(s.timer_step);
            Ok(now)
        })
    }

    fn event_generate(&self, tile: TileLoc, module: ModuleKind, event: Event) -> DriverResult<()> {
        self.with(|s| {
            s.tile_mut(tile)?;
            s.stats.events_generated += 1;
            s.events.push((tile, module, event));
            log::trace!("{} generate {:?} on {:?}", tile, event, module);

            // Broadcast events reach every core armed for them
            if let Event::Broadcast(_) = event {
                for t in s.tiles.iter_mut().filter(|t| t.kind == TileKind::Compute) {
                    if t.core.enable_event == Some(event) {
                        t.core.enable();
                    }
                }
            }
            Ok(())
        })
    }

    fn perf_counter_configure(
        &self,
        tile: TileLoc,
        module: ModuleKind,
        id: u8,
        start: Event,
        stop: Event,
    ) -> DriverResult<()> {
        self.with(|s| {
            let c = s.counter_mut(tile, module, id)?;
            c.start = Some(start);
            c.stop = Some(stop);
            Ok(())
        })
    }

    fn perf_counter_set_event_value(&self, tile: TileLoc, module: ModuleKind, id: u8, value: u32) -> DriverResult<()> {
        self.with(|s| {
            s.counter_mut(tile, module, id)?.event_value = value;
            Ok(())
        })
    }

    fn perf_counter_get(&self, tile: TileLoc, module: ModuleKind, id: u8) -> DriverResult<u32> {
        self.with(|s| Ok(s.counter_mut(tile, module, id)?.value))
    }

    fn perf_counter_reset(&self, tile: TileLoc, module: ModuleKind, id: u8) -> DriverResult<()> {
        self.with(|s| {
            *s.counter_mut(tile, module, id)? = PerfCounter::default();
            Ok(())
        })
    }

    fn stream_switch_select_port(
        &self,
        tile: TileLoc,
        port: u8,
        role: PortRole,
        side: PortSide,
        stream_id: u8,
    ) -> DriverResult<()> {
        self.with(|s| {
            let slot = s
                .tile_mut(tile)?
                .event_ports
                .get_mut(port as usize)
                .ok_or(DriverStatus::INVALID_RESOURCE)?;
            *slot = Some(EventPortSelect { role, side, stream_id });
            Ok(())
        })
    }

    fn stream_switch_reset_port(&self, tile: TileLoc, port: u8) -> DriverResult<()> {
        self.with(|s| {
            let slot = s
                .tile_mut(tile)?
                .event_ports
                .get_mut(port as usize)
                .ok_or(DriverStatus::INVALID_RESOURCE)?;
            *slot = None;
            Ok(())
        })
    }

    fn broadcast_configure(&self, tile: TileLoc, module: ModuleKind, channel: u8, event: Event) -> DriverResult<()> {
        if channel as usize >= limits::BROADCAST_CHANNELS {
            return Err(DriverStatus::INVALID_RESOURCE);
        }
        self.with(|s| {
            s.tile_mut(tile)?.broadcasts.insert((module, channel), event);
            Ok(())
        })
    }

    fn broadcast_reset(&self, tile: TileLoc, module: ModuleKind, channel: u8) -> DriverResult<()> {
        self.with(|s| {
            s.tile_mut(tile)?.broadcasts.remove(&(module, channel));
            Ok(())
        })
    }

    fn broadcast_block(
        &self,
        tile: TileLoc,
        module: ModuleKind,
        switch: BroadcastSwitch,
        channel: u8,
        dirs: BroadcastDirs,
    ) -> DriverResult<()> {
        self.with(|s| {
            let entry = s
                .tile_mut(tile)?
                .broadcast_blocks
                .entry((module, switch, channel))
                .or_default();
            *entry = *entry | dirs;
            Ok(())
        })
    }

    fn broadcast_unblock(
        &self,
        tile: TileLoc,
        module: ModuleKind,
        switch: BroadcastSwitch,
        channel: u8,
        dirs: BroadcastDirs,
    ) -> DriverResult<()> {
        self.with(|s| {
            let entry = s
                .tile_mut(tile)?
                .broadcast_blocks
                .entry((module, switch, channel))
                .or_default();
            *entry = entry.without(dirs);
            Ok(())
        })
    }

    fn request_perf_counter(&self, tile: TileLoc, module: ModuleKind) -> DriverResult<Option<u8>> {
        self.with(|s| Ok(s.tile_mut(tile)?.resources.perf_counters(module).request()))
    }

    fn request_event_port(&self, tile: TileLoc) -> DriverResult<Option<u8>> {
        self.with(|s| Ok(s.tile_mut(tile)?.resources.event_ports.request()))
    }

    fn request_broadcast(&self, tiles: &[TileLoc], module: ModuleKind) -> DriverResult<Option<u8>> {
        self.with(|s| {
            for loc in tiles {
                s.tile_mut(*loc)?;
            }
            for id in 0..limits::BROADCAST_CHANNELS as u8 {
                let mut free = true;
                for loc in tiles {
                    free &= s.tile_mut(*loc)?.resources.broadcast(module).is_free(id);
                }
                if free {
                    for loc in tiles {
                        s.tile_mut(*loc)?.resources.broadcast(module).reserve(id);
                    }
                    return Ok(Some(id));
                }
            }
            Ok(None)
        })
    }

    fn release_resource(&self, resource: &AcquiredResource) -> DriverResult<()> {
        self.with(|s| {
            let index = s.stats.releases;
            s.stats.releases += 1;
            if s.fail_release_at == Some(index) {
                s.stats.release_failures += 1;
                return Err(DriverStatus::ERR);
            }

            let released = match resource {
                AcquiredResource::PerfCounter { tile, module, id } => {
                    s.tile_mut(*tile)?.resources.perf_counters(*module).release(*id)
                }
                AcquiredResource::EventPort { tile, id } => {
                    s.tile_mut(*tile)?.resources.event_ports.release(*id)
                }
                AcquiredResource::Broadcast { tiles, module, id } => {
                    let mut all = true;
                    for loc in tiles {
                        all &= s.tile_mut(*loc)?.resources.broadcast(*module).release(*id);
                    }
                    all
                }
            };
            if released {
                Ok(())
            } else {
                s.stats.release_failures += 1;
                Err(DriverStatus::INVALID_RESOURCE)
            }
        })
    }

    fn reset_array(&self) -> DriverResult<()> {
        let generation = self.device.generation;
        self.with(|s| {
            s.stats.array_resets += 1;
            for tile in s.tiles.iter_mut() {
                tile.reset(generation);
            }
            s.events.clear();
            Ok(())
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn core(array: &TileArray) -> TileLoc {
        array.device().locate(TileKind::Compute, 0, 0).unwrap()
    }

    #[test]
    fn test_array_layout() {
        let array = TileArray::npu1();
        let s = array.lock_state().unwrap();
        assert_eq!(s.tiles.len(), 5 * 6);
        assert_eq!(s.tiles[0].kind, TileKind::Shim);
        assert_eq!(s.tiles[1].kind, TileKind::MemTile);
        assert_eq!(s.tiles[2].kind, TileKind::Compute);
        // col 1, row 3 at 1 * 6 + 3
        assert_eq!((s.tiles[9].col, s.tiles[9].row), (1, 3));
    }

    #[test]
    fn test_word_and_block_access() {
        let array = TileArray::npu1();
        let t = core(&array);
        array.write_word(t, 0x400, 42).unwrap();
        assert_eq!(array.read_word(t, 0x400).unwrap(), 42);

        array.block_write(t, 0x500, &[1, 2, 3, 4, 5]).unwrap();
        let mut buf = [0u8; 5];
        array.block_read(t, 0x500, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 5]);

        assert_eq!(array.write_word(t, 0x10_0000, 1), Err(DriverStatus::INVALID_ADDRESS));
        assert_eq!(
            array.write_word(TileLoc::absolute(9, 2), 0, 1),
            Err(DriverStatus::INVALID_TILE)
        );
        assert_eq!(array.stats().word_writes, 3);
    }

    #[test]
    fn test_lock_acquire_reports_timeout() {
        let array = TileArray::npu1();
        let t = core(&array);
        assert_eq!(array.lock_acquire(t, 0, -1, 100), Err(DriverStatus::LOCK_TIMEOUT));
        array.lock_set_value(t, 0, 1).unwrap();
        assert_eq!(array.lock_acquire(t, 0, -1, 100), Ok(()));
        assert_eq!(array.lock(t, 0).unwrap().value, 0);
        assert_eq!(array.lock_acquire(t, 99, -1, 100), Err(DriverStatus::INVALID_LOCK));
    }

    #[test]
    fn test_dma_queue_and_drain() {
        let array = TileArray::npu1();
        let shim = TileLoc::absolute(0, 0);
        array.dma_channel_enable(shim, 0, DmaDirection::Mm2s).unwrap();
        assert!(array.channel_enabled(shim, 0, DmaDirection::Mm2s));
        assert_eq!(
            array.dma_push_to_queue(shim, 0, DmaDirection::Mm2s, 0, 1, false),
            Err(DriverStatus::INVALID_DMA)
        );

        for bd in 0..4 {
            array.dma_program_descriptor(shim, bd, &BdParams::simple(0x1000, 64)).unwrap();
            array.dma_push_to_queue(shim, 0, DmaDirection::Mm2s, bd, 1, false).unwrap();
        }
        assert_eq!(
            array.dma_push_to_queue(shim, 0, DmaDirection::Mm2s, 0, 1, false),
            Err(DriverStatus::QUEUE_FULL)
        );
        assert_eq!(array.dma_pending_count(shim, 0, DmaDirection::Mm2s), Ok(4));
        assert_eq!(
            array.dma_wait_done(shim, 0, DmaDirection::Mm2s, 1),
            Err(DriverStatus::DMA_TIMEOUT)
        );
        assert_eq!(array.drain_dma(shim, 0, DmaDirection::Mm2s, 4), Ok(4));
        assert_eq!(array.dma_wait_done(shim, 0, DmaDirection::Mm2s, 1), Ok(()));
        assert_eq!(array.stats().dma_wait_done_calls, 2);
    }

    #[test]
    fn test_auto_drain() {
        let array = TileArray::npu1();
        let shim = TileLoc::absolute(1, 0);
        array.set_auto_drain(true);
        array.dma_program_descriptor(shim, 2, &BdParams::simple(0, 4)).unwrap();
        array.dma_push_to_queue(shim, 1, DmaDirection::S2mm, 2, 1, false).unwrap();
        array.dma_push_to_queue(shim, 1, DmaDirection::S2mm, 2, 1, false).unwrap();
        assert_eq!(array.dma_pending_count(shim, 1, DmaDirection::S2mm), Ok(2));
        assert_eq!(array.dma_pending_count(shim, 1, DmaDirection::S2mm), Ok(1));
        assert_eq!(array.dma_pending_count(shim, 1, DmaDirection::S2mm), Ok(0));
    }

    #[test]
    fn test_core_autocomplete() {
        let array = TileArray::npu1();
        let t = core(&array);
        array.set_core_autocomplete(Some(2));
        array.core_enable(t).unwrap();
        assert_eq!(array.core_read_done(t), Ok(false));
        assert_eq!(array.core_read_done(t), Ok(true));
        assert!(array.core_state(t).unwrap().enabled);
        assert!(array.core_enable(TileLoc::absolute(0, 0)).is_err());
    }

    #[test]
    fn test_broadcast_enable_event() {
        let array = TileArray::npu1();
        let t = core(&array);
        let event = Event::Broadcast(limits::ENABLE_BROADCAST_CHANNEL);
        array.core_set_enable_event(t, Some(event)).unwrap();
        array.event_generate(TileLoc::absolute(0, 0), ModuleKind::Pl, event).unwrap();
        assert!(array.core_state(t).unwrap().enabled);
        // Unarmed core stays off
        let other = TileLoc::absolute(1, 2);
        assert!(!array.core_state(other).unwrap().enabled);
    }

    #[test]
    fn test_timer_advances() {
        let array = TileArray::npu1();
        let t = core(&array);
        array.set_timer(100);
        array.set_timer_step(10);
        assert_eq!(array.read_timer(t, ModuleKind::Core), Ok(100));
        assert_eq!(array.read_timer(t, ModuleKind::Core), Ok(110));
    }

    #[test]
    fn test_broadcast_request_spans_tiles() {
        let array = TileArray::npu1();
        let tiles: Vec<_> = (1..4).map(|c| TileLoc::absolute(c, 0)).collect();
        assert!(array.reserve_broadcast(tiles[1], ModuleKind::Pl, 0));
        let id = array.request_broadcast(&tiles, ModuleKind::Pl).unwrap();
        assert_eq!(id, Some(1));
        for t in &tiles {
            assert!(array.broadcasts_in_use(*t, ModuleKind::Pl) >= 1);
        }
        let res = AcquiredResource::Broadcast { tiles: tiles.clone(), module: ModuleKind::Pl, id: 1 };
        array.release_resource(&res).unwrap();
        assert_eq!(array.broadcasts_in_use(tiles[0], ModuleKind::Pl), 0);
        assert_eq!(array.broadcasts_in_use(tiles[1], ModuleKind::Pl), 1);
    }

    #[test]
    fn test_release_failure_injection() {
        let array = TileArray::npu1();
        let shim = TileLoc::absolute(0, 0);
        let id = array.request_event_port(shim).unwrap().unwrap();
        let res = AcquiredResource::EventPort { tile: shim, id };
        array.fail_release_at(Some(0));
        assert_eq!(array.release_resource(&res), Err(DriverStatus::ERR));
        assert_eq!(array.event_ports_in_use(shim), 1);
        assert_eq!(array.release_resource(&res), Ok(()));
        assert_eq!(array.release_resource(&res), Err(DriverStatus::INVALID_RESOURCE));
        assert_eq!(array.stats().release_failures, 2);
    }

    #[test]
    fn test_reset_array() {
        let array = TileArray::npu1();
        let t = core(&array);
        array.write_word(t, 0, 7).unwrap();
        array.core_enable(t).unwrap();
        array.reset_array().unwrap();
        assert_eq!(array.read_word(t, 0), Ok(0));
        assert!(!array.core_state(t).unwrap().enabled);
    }
}
