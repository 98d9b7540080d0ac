//! Event and counter resource bookkeeping.
//!
//! Profiling reserves performance counters, stream switch event ports and
//! broadcast channels. Each tile keeps one [`ResourcePool`] per resource
//! class; a broadcast reservation must find one channel id that is free on
//! every tile it spans.

use super::control::ModuleKind;
use super::limits;
use super::{TileKind, TileLoc};

/// A reserved hardware resource.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum AcquiredResource {
    /// Performance counter `id` of `module` in `tile`.
    PerfCounter { tile: TileLoc, module: ModuleKind, id: u8 },
    /// Stream switch event port `id` in `tile`.
    EventPort { tile: TileLoc, id: u8 },
    /// Broadcast channel `id` reserved on every tile in `tiles`, ordered
    /// west to east.
    Broadcast { tiles: Vec<TileLoc>, module: ModuleKind, id: u8 },
}

impl AcquiredResource {
    /// Short name for logs.
    pub fn label(&self) -> &'static str {
        match self {
            AcquiredResource::PerfCounter { .. } => "performance counter",
            AcquiredResource::EventPort { .. } => "stream switch event port",
            AcquiredResource::Broadcast { .. } => "broadcast channel",
        }
    }
}

/// Fixed set of numbered slots.
#[derive(Debug, Clone, Default)]
pub struct ResourcePool {
    taken: Vec<bool>,
}

impl ResourcePool {
    pub fn new(count: usize) -> Self {
        Self { taken: vec![false; count] }
    }

    /// Number of slots.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.taken.len()
    }

    /// Take the lowest free slot.
    pub fn request(&mut self) -> Option<u8> {
        let id = self.taken.iter().position(|t| !t)?;
        self.taken[id] = true;
        Some(id as u8)
    }

    #[inline]
    pub fn is_free(&self, id: u8) -> bool {
        matches!(self.taken.get(id as usize), Some(false))
    }

    /// Take a specific slot. Returns false if it is taken or out of range.
    pub fn reserve(&mut self, id: u8) -> bool {
        match self.taken.get_mut(id as usize) {
            Some(slot) if !*slot => {
                *slot = true;
                true
            }
            _ => false,
        }
    }

    /// Return a slot. Returns false if it was not taken.
    pub fn release(&mut self, id: u8) -> bool {
        match self.taken.get_mut(id as usize) {
            Some(slot) if *slot => {
                *slot = false;
                true
            }
            _ => false,
        }
    }

    /// Number of slots in use.
    pub fn in_use(&self) -> usize {
        self.taken.iter().filter(|t| **t).count()
    }
}

/// All resource pools of one tile.
#[derive(Debug, Clone)]
pub struct TileResources {
    core_perf: ResourcePool,
    memory_perf: ResourcePool,
    pl_perf: ResourcePool,
    pub event_ports: ResourcePool,
    core_broadcast: ResourcePool,
    memory_broadcast: ResourcePool,
    pl_broadcast: ResourcePool,
}

impl TileResources {
    pub fn new(kind: TileKind) -> Self {
        let (core, memory, pl) = match kind {
            TileKind::Shim => (0, 0, limits::PL_PERF_COUNTERS),
            TileKind::MemTile => (0, limits::MEM_TILE_PERF_COUNTERS, 0),
            TileKind::Compute => (limits::CORE_PERF_COUNTERS, limits::MEMORY_PERF_COUNTERS, 0),
        };
        let broadcast = |present: bool| {
            ResourcePool::new(if present { limits::BROADCAST_CHANNELS } else { 0 })
        };
        Self {
            core_perf: ResourcePool::new(core),
            memory_perf: ResourcePool::new(memory),
            pl_perf: ResourcePool::new(pl),
            event_ports: ResourcePool::new(limits::STREAM_SWITCH_EVENT_PORTS),
            core_broadcast: broadcast(kind == TileKind::Compute),
            memory_broadcast: broadcast(kind != TileKind::Shim),
            pl_broadcast: broadcast(kind == TileKind::Shim),
        }
    }

    pub fn perf_counters(&mut self, module: ModuleKind) -> &mut ResourcePool {
        match module {
            ModuleKind::Core => &mut self.core_perf,
            ModuleKind::Memory => &mut self.memory_perf,
            ModuleKind::Pl => &mut self.pl_perf,
        }
    }

    pub fn broadcast(&mut self, module: ModuleKind) -> &mut ResourcePool {
        match module {
            ModuleKind::Core => &mut self.core_broadcast,
            ModuleKind::Memory => &mut self.memory_broadcast,
            ModuleKind::Pl => &mut self.pl_broadcast,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_request_release() {
        let mut pool = ResourcePool::new(2);
        assert_eq!(pool.request(), Some(0));
        assert_eq!(pool.request(), Some(1));
        assert_eq!(pool.request(), None);
        assert_eq!(pool.in_use(), 2);

        assert!(pool.release(0));
        assert!(!pool.release(0));
        assert_eq!(pool.request(), Some(0));
    }

    #[test]
    fn test_pool_reserve() {
        let mut pool = ResourcePool::new(4);
        assert!(pool.reserve(2));
        assert!(!pool.reserve(2));
        assert!(!pool.reserve(9));
        assert!(!pool.is_free(2));
        assert!(pool.is_free(3));
    }

    #[test]
    fn test_shim_resources() {
        let mut res = TileResources::new(TileKind::Shim);
        assert_eq!(res.perf_counters(ModuleKind::Pl).capacity(), 2);
        assert_eq!(res.perf_counters(ModuleKind::Core).capacity(), 0);
        assert_eq!(res.broadcast(ModuleKind::Pl).capacity(), 16);
        assert_eq!(res.event_ports.capacity(), 8);
    }
}
