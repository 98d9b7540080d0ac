//! Stream profiling with shim performance counters.
//!
//! A profiling session watches one or two shim streams through stream
//! switch event ports and counts cycles or events with the PL module's
//! performance counters. Four measurements exist:
//!
//! | Option                               | Counters | Start event       | Stop event            |
//! |--------------------------------------|----------|-------------------|-----------------------|
//! | `StreamRunningToIdleCycles`          | 1        | port running      | port idle             |
//! | `StreamStartToBytesTransferredCycles`| 2        | port running      | second counter event  |
//! | `StreamStartDifferenceCycles`        | 2        | user event 0      | each port running     |
//! | `StreamRunningEventCount`            | 1        | port running      | port running          |
//!
//! Measuring the start difference between streams in different columns
//! relays user event 0 from the first shim to the second over a broadcast
//! channel. The channel is blocked on every shim it spans so the event only
//! travels along the row, and reads are corrected for the relay latency.

use std::sync::Arc;

use smallvec::SmallVec;

use crate::array_manager::ArrayManager;
use crate::device::limits::{BROADCAST_FIXED_CYCLES, BROADCAST_HOP_CYCLES};
use crate::device::{
    AcquiredResource, BroadcastDirs, BroadcastSwitch, DriverResult, Event, ModuleKind, PortRole,
    PortSide, TileControl, TileLoc,
};
use crate::error::{CtrlError, DriverStatus, Result};

/// What to measure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProfilingOption {
    /// Cycles from the first running word to the stream going idle.
    StreamRunningToIdleCycles,
    /// Cycles from the first running word until `value` bytes have passed.
    StreamStartToBytesTransferredCycles,
    /// Cycles between the first running words of two streams.
    StreamStartDifferenceCycles,
    /// Running words seen on the stream.
    StreamRunningEventCount,
}

/// Shim stream switch port carrying a host or PL stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StreamEndpoint {
    pub tile: TileLoc,
    pub role: PortRole,
    pub stream_id: u8,
}

/// A reserved PL performance counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CounterRef {
    pub tile: TileLoc,
    pub id: u8,
}

/// A reserved stream switch event port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EventPortRef {
    pub tile: TileLoc,
    pub id: u8,
}

/// A broadcast channel reserved on every shim from west to east.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BroadcastRef {
    pub tiles: Vec<TileLoc>,
    /// Shim driving the channel.
    pub source: TileLoc,
    pub id: u8,
}

/// Resources held by a running measurement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProfilingHandle {
    RunningToIdle {
        counter: CounterRef,
        port: EventPortRef,
    },
    BytesTransferred {
        counter: CounterRef,
        /// Counts running words and fires at the byte threshold.
        threshold: CounterRef,
        port: EventPortRef,
    },
    StartDifference {
        first: CounterRef,
        second: CounterRef,
        ports: [EventPortRef; 2],
        /// Present when the two streams are in different columns.
        broadcast: Option<BroadcastRef>,
    },
    RunningEventCount {
        counter: CounterRef,
        port: EventPortRef,
    },
}

fn counter_resource(c: &CounterRef) -> AcquiredResource {
    AcquiredResource::PerfCounter { tile: c.tile, module: ModuleKind::Pl, id: c.id }
}

fn port_resource(p: &EventPortRef) -> AcquiredResource {
    AcquiredResource::EventPort { tile: p.tile, id: p.id }
}

impl ProfilingHandle {
    pub fn option(&self) -> ProfilingOption {
        match self {
            ProfilingHandle::RunningToIdle { .. } => ProfilingOption::StreamRunningToIdleCycles,
            ProfilingHandle::BytesTransferred { .. } => ProfilingOption::StreamStartToBytesTransferredCycles,
            ProfilingHandle::StartDifference { .. } => ProfilingOption::StreamStartDifferenceCycles,
            ProfilingHandle::RunningEventCount { .. } => ProfilingOption::StreamRunningEventCount,
        }
    }

    /// Every held resource, counters first.
    pub fn resources(&self) -> SmallVec<[AcquiredResource; 5]> {
        let mut out = SmallVec::new();
        match self {
            ProfilingHandle::RunningToIdle { counter, port }
            | ProfilingHandle::RunningEventCount { counter, port } => {
                out.push(counter_resource(counter));
                out.push(port_resource(port));
            }
            ProfilingHandle::BytesTransferred { counter, threshold, port } => {
                out.push(counter_resource(counter));
                out.push(counter_resource(threshold));
                out.push(port_resource(port));
            }
            ProfilingHandle::StartDifference { first, second, ports, broadcast } => {
                out.push(counter_resource(first));
                out.push(counter_resource(second));
                out.extend(ports.iter().map(port_resource));
                if let Some(b) = broadcast {
                    out.push(AcquiredResource::Broadcast { tiles: b.tiles.clone(), module: ModuleKind::Pl, id: b.id });
                }
            }
        }
        out
    }

    fn broadcast_source(&self) -> Option<TileLoc> {
        match self {
            ProfilingHandle::StartDifference { broadcast: Some(b), .. } => Some(b.source),
            _ => None,
        }
    }
}

/// Directions to block so a broadcast only travels along the shim row.
///
/// `tiles` runs west to east.
fn isolation_blocks(tiles: &[TileLoc]) -> SmallVec<[(TileLoc, BroadcastSwitch, BroadcastDirs); 8]> {
    let vertical = BroadcastDirs::NORTH | BroadcastDirs::SOUTH;
    let mut out = SmallVec::new();
    if let [west, middle @ .., east] = tiles {
        out.push((*west, BroadcastSwitch::A, BroadcastDirs::WEST | vertical));
        out.push((*west, BroadcastSwitch::B, vertical));
        for tile in middle {
            out.push((*tile, BroadcastSwitch::A, vertical));
            out.push((*tile, BroadcastSwitch::B, vertical));
        }
        out.push((*east, BroadcastSwitch::A, BroadcastDirs::EAST | vertical));
    }
    out
}

/// Resources reserved by one `start`, released on drop unless committed.
struct Reservation<'a> {
    ctrl: &'a dyn TileControl,
    held: Vec<AcquiredResource>,
}

impl<'a> Reservation<'a> {
    fn new(ctrl: &'a dyn TileControl) -> Self {
        Self { ctrl, held: Vec::new() }
    }

    fn take<T>(&mut self, what: String, request: DriverResult<Option<u8>>, resource: impl FnOnce(u8) -> (AcquiredResource, T)) -> Result<T> {
        match request {
            Ok(Some(id)) => {
                let (held, value) = resource(id);
                log::debug!("Reserved {} {}", held.label(), id);
                self.held.push(held);
                Ok(value)
            }
            Ok(None) => Err(CtrlError::ResourceUnavailable(what)),
            Err(status) => Err(CtrlError::driver(status, format!("requesting {}", what))),
        }
    }

    fn counter(&mut self, tile: TileLoc) -> Result<CounterRef> {
        let request = self.ctrl.request_perf_counter(tile, ModuleKind::Pl);
        self.take(format!("performance counter on {}", tile), request, |id| {
            let c = CounterRef { tile, id };
            (counter_resource(&c), c)
        })
    }

    fn event_port(&mut self, tile: TileLoc) -> Result<EventPortRef> {
        let request = self.ctrl.request_event_port(tile);
        self.take(format!("stream switch event port on {}", tile), request, |id| {
            let p = EventPortRef { tile, id };
            (port_resource(&p), p)
        })
    }

    fn broadcast(&mut self, tiles: Vec<TileLoc>, source: TileLoc) -> Result<BroadcastRef> {
        let request = self.ctrl.request_broadcast(&tiles, ModuleKind::Pl);
        let what = format!("broadcast channel across {} shims", tiles.len());
        self.take(what, request, |id| {
            let held = AcquiredResource::Broadcast { tiles: tiles.clone(), module: ModuleKind::Pl, id };
            (held, BroadcastRef { tiles, source, id })
        })
    }

    /// Keep everything reserved.
    fn commit(mut self) {
        self.held.clear();
    }
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        for resource in self.held.drain(..).rev() {
            match self.ctrl.release_resource(&resource) {
                Ok(()) => log::debug!("Rolled back {}", resource.label()),
                Err(status) => log::error!("Failed to roll back {}: status {}", resource.label(), status),
            }
        }
    }
}

/// Profiling entry points over one array.
#[derive(Debug, Clone)]
pub struct ProfilingSession {
    manager: Arc<ArrayManager>,
}

impl ProfilingSession {
    pub fn new(manager: Arc<ArrayManager>) -> Self {
        Self { manager }
    }

    fn ctrl(&self) -> &dyn TileControl {
        self.manager.ctrl()
    }

    /// Shim port carrying the stream of a GMIO or PLIO port.
    pub fn endpoint(&self, port: &str) -> Result<StreamEndpoint> {
        let device = self.manager.device();
        match (self.manager.gmio(port), self.manager.plio(port)) {
            (Some(_), Some(_)) => Err(CtrlError::user(format!("port '{}' is both a GMIO and a PLIO port", port))),
            (Some(g), None) => {
                let c = g.config();
                Ok(StreamEndpoint { tile: device.shim(c.shim_col)?, role: c.direction.switch_role(), stream_id: c.stream_id })
            }
            (None, Some(p)) => {
                Ok(StreamEndpoint { tile: device.shim(p.shim_col)?, role: p.direction.switch_role(), stream_id: p.stream_id })
            }
            (None, None) => Err(CtrlError::not_found("stream port", port)),
        }
    }

    /// Reserve and configure the resources for one measurement.
    ///
    /// `port2` is required by, and only used by,
    /// [`ProfilingOption::StreamStartDifferenceCycles`]. `value` is the byte
    /// threshold of [`ProfilingOption::StreamStartToBytesTransferredCycles`].
    pub fn start(&self, option: ProfilingOption, port1: &str, port2: Option<&str>, value: u32) -> Result<ProfilingHandle> {
        let first = self.endpoint(port1)?;
        let second = match (option, port2) {
            (ProfilingOption::StreamStartDifferenceCycles, Some(p)) => Some(self.endpoint(p)?),
            (ProfilingOption::StreamStartDifferenceCycles, None) => {
                return Err(CtrlError::user("start difference needs two ports"));
            }
            _ => None,
        };

        let mut reservation = Reservation::new(self.ctrl());
        let handle = match second {
            None => self.start_single(&mut reservation, option, first, value)?,
            Some(second) => self.start_difference(&mut reservation, first, second)?,
        };
        reservation.commit();

        log::info!("Started {:?} on '{}'", option, port1);
        Ok(handle)
    }

    fn select_port(&self, status: &mut DriverStatus, port: &EventPortRef, ep: &StreamEndpoint) {
        status.absorb(self.ctrl().stream_switch_select_port(ep.tile, port.id, ep.role, PortSide::South, ep.stream_id));
    }

    fn configure(&self, status: &mut DriverStatus, counter: &CounterRef, start: Event, stop: Event) {
        status.absorb(self.ctrl().perf_counter_configure(counter.tile, ModuleKind::Pl, counter.id, start, stop));
    }

    fn start_single(
        &self,
        reservation: &mut Reservation<'_>,
        option: ProfilingOption,
        ep: StreamEndpoint,
        value: u32,
    ) -> Result<ProfilingHandle> {
        let port = reservation.event_port(ep.tile)?;
        let counter = reservation.counter(ep.tile)?;
        let running = Event::PortRunning(port.id);

        let mut status = DriverStatus::OK;
        self.select_port(&mut status, &port, &ep);
        let handle = match option {
            ProfilingOption::StreamRunningToIdleCycles => {
                self.configure(&mut status, &counter, running, Event::PortIdle(port.id));
                ProfilingHandle::RunningToIdle { counter, port }
            }
            ProfilingOption::StreamRunningEventCount => {
                self.configure(&mut status, &counter, running, running);
                ProfilingHandle::RunningEventCount { counter, port }
            }
            ProfilingOption::StreamStartToBytesTransferredCycles => {
                let threshold = reservation.counter(ep.tile)?;
                // The stream moves one 32-bit word per running event
                status.absorb(self.ctrl().perf_counter_set_event_value(ep.tile, ModuleKind::Pl, threshold.id, value / 4));
                self.configure(&mut status, &counter, running, Event::PerfCounter(threshold.id));
                self.configure(&mut status, &threshold, running, running);
                ProfilingHandle::BytesTransferred { counter, threshold, port }
            }
            ProfilingOption::StreamStartDifferenceCycles => {
                return Err(CtrlError::user("start difference needs two ports"));
            }
        };
        status.check("configuring profiling counters")?;
        Ok(handle)
    }

    fn start_difference(
        &self,
        reservation: &mut Reservation<'_>,
        ep1: StreamEndpoint,
        ep2: StreamEndpoint,
    ) -> Result<ProfilingHandle> {
        let port1 = reservation.event_port(ep1.tile)?;
        let first = reservation.counter(ep1.tile)?;
        let port2 = reservation.event_port(ep2.tile)?;
        let second = reservation.counter(ep2.tile)?;

        let (c1, c2) = (ep1.tile.col(), ep2.tile.col());
        let broadcast = if c1 == c2 {
            None
        } else {
            let tiles = (c1.min(c2)..=c1.max(c2)).map(|c| TileLoc::absolute(c, ep1.tile.row())).collect();
            Some(reservation.broadcast(tiles, ep1.tile)?)
        };

        let ctrl = self.ctrl();
        let mut status = DriverStatus::OK;
        self.select_port(&mut status, &port1, &ep1);
        self.configure(&mut status, &first, Event::UserEvent0, Event::PortRunning(port1.id));
        self.select_port(&mut status, &port2, &ep2);

        match &broadcast {
            None => {
                self.configure(&mut status, &second, Event::UserEvent0, Event::PortRunning(port2.id));
            }
            Some(b) => {
                self.configure(&mut status, &second, Event::Broadcast(b.id), Event::PortRunning(port2.id));
                for (tile, switch, dirs) in isolation_blocks(&b.tiles) {
                    status.absorb(ctrl.broadcast_block(tile, ModuleKind::Pl, switch, b.id, dirs));
                }
                status.absorb(ctrl.broadcast_configure(ep1.tile, ModuleKind::Pl, b.id, Event::UserEvent0));
            }
        }
        status.absorb(ctrl.event_generate(ep1.tile, ModuleKind::Pl, Event::UserEvent0));
        status.check("configuring start difference profiling")?;

        Ok(ProfilingHandle::StartDifference { first, second, ports: [port1, port2], broadcast })
    }

    fn counter_value(&self, counter: &CounterRef) -> Result<u32> {
        self.ctrl()
            .perf_counter_get(counter.tile, ModuleKind::Pl, counter.id)
            .map_err(|s| CtrlError::driver(s, format!("reading performance counter {} on {}", counter.id, counter.tile)))
    }

    /// Current measurement.
    ///
    /// The start difference is signed: negative when the second stream
    /// started first.
    pub fn read(&self, handle: &ProfilingHandle) -> Result<i64> {
        match handle {
            ProfilingHandle::StartDifference { first, second, .. } => {
                let v1 = self.counter_value(first)? as i64;
                let v2 = self.counter_value(second)? as i64;
                let mut value = v2 - v1;
                let hops = (first.tile.col() as i64 - second.tile.col() as i64).abs();
                if hops > 0 {
                    value += hops * BROADCAST_HOP_CYCLES + BROADCAST_FIXED_CYCLES;
                }
                Ok(value)
            }
            ProfilingHandle::RunningToIdle { counter, .. }
            | ProfilingHandle::BytesTransferred { counter, .. }
            | ProfilingHandle::RunningEventCount { counter, .. } => Ok(self.counter_value(counter)? as i64),
        }
    }

    /// Reset and release every resource of `handle`.
    ///
    /// A failed release is logged and reported at the end; the remaining
    /// resources are still released.
    pub fn stop(&self, handle: ProfilingHandle) -> Result<()> {
        let ctrl = self.ctrl();
        let mut status = DriverStatus::OK;

        for resource in handle.resources() {
            match &resource {
                AcquiredResource::PerfCounter { tile, module, id } => {
                    status.absorb(ctrl.perf_counter_reset(*tile, *module, *id));
                }
                AcquiredResource::EventPort { tile, id } => {
                    status.absorb(ctrl.stream_switch_reset_port(*tile, *id));
                }
                AcquiredResource::Broadcast { tiles, module, id } => {
                    if let Some(source) = handle.broadcast_source() {
                        status.absorb(ctrl.broadcast_reset(source, *module, *id));
                    }
                    for (tile, switch, dirs) in isolation_blocks(tiles) {
                        status.absorb(ctrl.broadcast_unblock(tile, *module, switch, *id, dirs));
                    }
                }
            }
            if let Err(s) = ctrl.release_resource(&resource) {
                log::error!("Failed to release {}: status {}", resource.label(), s);
                status |= DriverStatus::ERR;
            }
        }

        log::info!("Stopped {:?}", handle.option());
        status.check("stopping profiling")
    }
}
