//! Graph lifecycle control.
//!
//! A [`Graph`] drives the cores one compiled data-flow graph is mapped to.
//!
//! ```text
//!            run / run_iterations
//!   Reset ------------------------> Running ---- wait / wait_done ----> Stopped
//!     ^                             |  ^  |                               |
//!     |                 suspend /   |  |  | end                           | run
//!     |               wait_cycles   v  |  v                               |
//!   reset (any)              Suspended  resume  Ended <---- end ----------+
//!                                |                ^
//!                                +-- end_cycles --+
//! ```
//!
//! Every operation checks its source state and fails with
//! [`CtrlError::StateConflict`] without touching hardware when the check
//! fails. A graph opened in [`AccessMode::Shared`] can observe the graph
//! and read RTP ports but cannot change its state.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::array_manager::ArrayManager;
use crate::device::{limits, Event, ModuleKind, TileKind, TileLoc};
use crate::error::{CtrlError, DriverStatus, Result};
use crate::poll::Poller;
use crate::rtp::RtpChannel;

/// Lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum GraphState {
    Reset,
    Running,
    Stopped,
    Suspended,
    Ended,
}

impl fmt::Display for GraphState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// How a graph handle was opened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum AccessMode {
    /// Full control.
    #[default]
    Exclusive,
    /// Observe only; lifecycle and RTP updates are refused.
    Shared,
}

/// One core of the graph, in absolute coordinates.
#[derive(Debug, Clone, Copy)]
struct GraphCore {
    tile: TileLoc,
    iter_mem: TileLoc,
    iter_mem_addr: u64,
    triggered: bool,
}

impl GraphCore {
    /// Termination flag cell, one word before the iteration count.
    fn end_flag_addr(&self) -> u64 {
        self.iter_mem_addr - limits::END_FLAG_OFFSET
    }
}

/// Host handle on one mapped graph.
#[derive(Debug)]
pub struct Graph {
    manager: Arc<ArrayManager>,
    id: u32,
    name: String,
    cores: Vec<GraphCore>,
    rtps: HashMap<String, RtpChannel>,
    state: GraphState,
    mode: AccessMode,
    /// Timer value at the last run or resume.
    start_time: u64,
}

impl Graph {
    /// Open the graph called `name`.
    pub fn open(manager: Arc<ArrayManager>, name: &str, mode: AccessMode) -> Result<Self> {
        let config = manager
            .metadata()
            .graph(name)
            .ok_or_else(|| CtrlError::not_found("graph", name))?
            .clone();
        let device = manager.device();

        let cores = config
            .cores
            .iter()
            .map(|c| {
                Ok(GraphCore {
                    tile: device.locate(TileKind::Compute, c.col, c.row)?,
                    iter_mem: device.locate(TileKind::Compute, c.iter_mem_col, c.iter_mem_row)?,
                    iter_mem_addr: c.iter_mem_addr,
                    triggered: c.triggered,
                })
            })
            .collect::<Result<Vec<_>>>()?;
        if cores.is_empty() {
            return Err(CtrlError::Config(format!("graph '{}' has no cores", name)));
        }

        let rtps = manager
            .metadata()
            .rtps_for_graph(config.id)
            .map(|r| Ok((r.name.clone(), RtpChannel::new(r.clone(), device)?)))
            .collect::<Result<HashMap<_, _>>>()?;

        log::info!(
            "Opened graph '{}' ({:?}): {} cores, {} RTP ports",
            name,
            mode,
            cores.len(),
            rtps.len()
        );

        Ok(Self {
            manager,
            id: config.id,
            name: config.name,
            cores,
            rtps,
            state: GraphState::Reset,
            mode,
            start_time: 0,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn mode(&self) -> AccessMode {
        self.mode
    }

    /// Current lifecycle state.
    pub fn status(&self) -> GraphState {
        self.state
    }

    /// Names of the graph's RTP ports.
    pub fn rtp_ports(&self) -> impl Iterator<Item = &str> {
        self.rtps.keys().map(String::as_str)
    }

    fn conflict(&self, op: &'static str, reason: String) -> CtrlError {
        CtrlError::StateConflict { graph: self.name.clone(), op, reason }
    }

    fn require_exclusive(&self, op: &'static str) -> Result<()> {
        match self.mode {
            AccessMode::Exclusive => Ok(()),
            AccessMode::Shared => Err(self.conflict(op, "in a shared context".into())),
        }
    }

    fn guard(&self, op: &'static str, allowed: &[GraphState]) -> Result<()> {
        self.require_exclusive(op)?;
        if allowed.contains(&self.state) {
            Ok(())
        } else {
            Err(self.conflict(op, format!("while {}", self.state)))
        }
    }

    fn transition(&mut self, to: GraphState) {
        log::info!("Graph '{}': {} -> {}", self.name, self.state, to);
        self.state = to;
    }

    // --- core primitives ----------------------------------------------------

    fn read_timer(&self) -> Result<u64> {
        let tile = self.cores[0].tile;
        self.manager
            .ctrl()
            .read_timer(tile, ModuleKind::Core)
            .map_err(|s| CtrlError::driver(s, format!("reading timer of {}", tile)))
    }

    /// Poll the timer until `cycles` have elapsed since `start`.
    fn wait_until_elapsed(&self, start: u64, cycles: u64, poller: &Poller<'_>) -> Result<()> {
        let tile = self.cores[0].tile;
        let what = format!("graph '{}' waiting {} cycles", self.name, cycles);
        poller.poll(&what, || {
            let now = self
                .manager
                .ctrl()
                .read_timer(tile, ModuleKind::Core)
                .map_err(|s| CtrlError::driver(s, what.clone()))?;
            Ok((now.wrapping_sub(start) >= cycles).then_some(()))
        })
    }

    fn write_each(&self, what: &str, cores: impl Iterator<Item = (TileLoc, u64)>, value: u32) -> Result<()> {
        let ctrl = self.manager.ctrl();
        let mut status = DriverStatus::OK;
        for (tile, addr) in cores {
            status.absorb(ctrl.write_word(tile, addr, value));
        }
        status.check(format!("graph '{}': {}", self.name, what))
    }

    fn disable_all(&self) -> Result<()> {
        let ctrl = self.manager.ctrl();
        let mut status = DriverStatus::OK;
        for core in &self.cores {
            status.absorb(ctrl.core_disable(core.tile));
        }
        status.check(format!("graph '{}': disabling cores", self.name))
    }

    fn enable_cores(&self) -> Result<()> {
        if self.manager.runtime().broadcast_enable_core() {
            return self.broadcast_enable();
        }
        let ctrl = self.manager.ctrl();
        let mut status = DriverStatus::OK;
        for core in &self.cores {
            status.absorb(ctrl.core_enable(core.tile));
        }
        status.check(format!("graph '{}': enabling cores", self.name))
    }

    /// Start every core with one broadcast event.
    ///
    /// Cores are armed to enable on the broadcast, the event is fired from
    /// the shim, and the cores are disarmed once the event has had time to
    /// reach every column.
    fn broadcast_enable(&self) -> Result<()> {
        let ctrl = self.manager.ctrl();
        let event = Event::Broadcast(limits::ENABLE_BROADCAST_CHANNEL);

        let mut status = DriverStatus::OK;
        for core in &self.cores {
            status.absorb(ctrl.core_clear_disable_event(core.tile));
            status.absorb(ctrl.core_set_enable_event(core.tile, Some(event)));
        }
        status.check(format!("graph '{}': arming broadcast enable", self.name))?;

        let fired = self.manager.device().shim(0).and_then(|shim| {
            ctrl.event_generate(shim, ModuleKind::Pl, event)
                .map_err(|s| CtrlError::driver(s, "firing enable broadcast"))?;
            let start = self.read_timer()?;
            let poller = self.manager.poller(self.manager.runtime().timer_poll());
            self.wait_until_elapsed(start, self.manager.runtime().enable_delay_cycles(), &poller)
        });

        for core in &self.cores {
            status.absorb(ctrl.core_set_enable_event(core.tile, None));
        }
        fired?;
        log::debug!("Graph '{}': {} cores started by broadcast", self.name, self.cores.len());
        status.check(format!("graph '{}': disarming broadcast enable", self.name))
    }

    /// Wait for every non-triggered core's done bit, disabling each as it
    /// finishes. Triggered cores have no done bit and count as done.
    fn wait_cores(&self, poller: &Poller<'_>) -> Result<()> {
        let ctrl = self.manager.ctrl();
        for core in self.cores.iter().filter(|c| !c.triggered) {
            let what = format!("graph '{}' waiting for {} done", self.name, core.tile);
            poller.poll(&what, || {
                ctrl.core_read_done(core.tile)
                    .map(|done| done.then_some(()))
                    .map_err(|s| CtrlError::driver(s, what.clone()))
            })?;
            ctrl.core_disable(core.tile)
                .map_err(|s| CtrlError::driver(s, format!("disabling {}", core.tile)))?;
        }
        Ok(())
    }

    fn core_poller(&self, deadline: Option<Instant>) -> Poller<'_> {
        self.manager
            .poller(self.manager.runtime().core_poll())
            .with_deadline(deadline)
    }

    // --- lifecycle ----------------------------------------------------------

    /// Start the graph with no iteration limit.
    pub fn run(&mut self) -> Result<()> {
        self.run_iterations(0)
    }

    /// Start the graph for `iterations` iterations; 0 runs unbounded.
    pub fn run_iterations(&mut self, iterations: u32) -> Result<()> {
        self.guard("run", &[GraphState::Stopped, GraphState::Reset])?;

        if iterations > 0 {
            self.write_each(
                "writing iteration count",
                self.cores.iter().map(|c| (c.iter_mem, c.iter_mem_addr)),
                iterations,
            )?;
        }
        self.start_time = self.read_timer()?;
        self.enable_cores()?;
        log::debug!("Graph '{}' started at cycle {} for {} iterations", self.name, self.start_time, iterations);
        self.transition(GraphState::Running);
        Ok(())
    }

    /// Block until every core reports done.
    pub fn wait(&mut self) -> Result<()> {
        self.wait_done(-1)
    }

    /// Block until every core reports done or `timeout_ms` elapses.
    /// A negative timeout waits forever.
    pub fn wait_done(&mut self, timeout_ms: i64) -> Result<()> {
        self.guard("wait", &[GraphState::Running])?;
        let deadline = u64::try_from(timeout_ms)
            .ok()
            .map(|ms| Instant::now() + Duration::from_millis(ms));
        self.wait_cores(&self.core_poller(deadline))?;
        self.transition(GraphState::Stopped);
        Ok(())
    }

    /// Let the graph run for `cycles` cycles since the last start, then
    /// disable its cores without checking for completion.
    pub fn wait_cycles(&mut self, cycles: u64) -> Result<()> {
        if cycles > limits::MAX_CYCLE_BUDGET {
            return Err(CtrlError::user(format!(
                "cycle budget {} exceeds maximum {}",
                cycles,
                limits::MAX_CYCLE_BUDGET
            )));
        }
        self.guard("wait", &[GraphState::Running])?;

        let poller = self.manager.poller(self.manager.runtime().timer_poll());
        self.wait_until_elapsed(self.start_time, cycles, &poller)?;
        self.disable_all()?;
        self.transition(GraphState::Suspended);
        Ok(())
    }

    /// Disable every core without checking done bits.
    pub fn suspend(&mut self) -> Result<()> {
        self.guard("suspend", &[GraphState::Running])?;
        self.disable_all()?;
        self.transition(GraphState::Suspended);
        Ok(())
    }

    /// Re-enable the cores that have not finished.
    pub fn resume(&mut self) -> Result<()> {
        self.guard("resume", &[GraphState::Suspended])?;
        self.start_time = self.read_timer()?;

        let ctrl = self.manager.ctrl();
        let mut status = DriverStatus::OK;
        for core in &self.cores {
            // Enabling clears the done bit, so finished cores stay off
            if status.absorb(ctrl.core_read_done(core.tile)) == Some(false) {
                status.absorb(ctrl.core_enable(core.tile));
            }
        }
        status.check(format!("graph '{}': resuming cores", self.name))?;
        self.transition(GraphState::Running);
        Ok(())
    }

    /// Wait for completion and run each core through its termination path.
    ///
    /// Only a running graph is terminated; ending a stopped or already
    /// ended graph just moves it to [`GraphState::Ended`].
    pub fn end(&mut self) -> Result<()> {
        self.guard("end", &[GraphState::Running, GraphState::Stopped, GraphState::Ended])?;
        if self.state != GraphState::Running {
            self.transition(GraphState::Ended);
            return Ok(());
        }

        let poller = self.core_poller(None);
        self.wait_cores(&poller)?;

        let ctrl = self.manager.ctrl();
        for core in self.cores.iter().filter(|c| !c.triggered) {
            let context = format!("graph '{}': terminating {}", self.name, core.tile);
            let mut status = DriverStatus::OK;
            status.absorb(ctrl.write_word(core.iter_mem, core.end_flag_addr(), 1));
            status.absorb(ctrl.core_enable(core.tile));
            status.check(context.clone())?;

            poller.poll(&context, || {
                ctrl.core_read_done(core.tile)
                    .map(|done| done.then_some(()))
                    .map_err(|s| CtrlError::driver(s, context.clone()))
            })?;
            ctrl.core_disable(core.tile).map_err(|s| CtrlError::driver(s, context))?;
        }

        self.transition(GraphState::Ended);
        Ok(())
    }

    /// End after a cycle budget, from Running or Suspended.
    pub fn end_cycles(&mut self, cycles: u64) -> Result<()> {
        self.guard("end", &[GraphState::Running, GraphState::Suspended])?;
        if self.state == GraphState::Running {
            self.wait_cycles(cycles)?;
        }
        self.write_each(
            "writing termination flag",
            self.cores.iter().map(|c| (c.iter_mem, c.end_flag_addr())),
            1,
        )?;
        self.transition(GraphState::Ended);
        Ok(())
    }

    /// Disable every core and return to [`GraphState::Reset`].
    pub fn reset(&mut self) -> Result<()> {
        self.require_exclusive("reset")?;
        self.disable_all()?;
        self.transition(GraphState::Reset);
        Ok(())
    }

    /// Array timer value as seen by the graph's first core.
    pub fn timestamp(&self) -> Result<u64> {
        self.read_timer()
    }

    /// Release the handle, waiting for a running graph to finish.
    pub fn close(mut self) -> Result<()> {
        if self.state == GraphState::Running && self.mode == AccessMode::Exclusive {
            self.wait()?;
        }
        log::info!("Closed graph '{}'", self.name);
        Ok(())
    }

    // --- runtime parameters -------------------------------------------------

    fn rtp(&self, port: &str) -> Result<&RtpChannel> {
        self.rtps.get(port).ok_or_else(|| CtrlError::not_found("RTP port", port))
    }

    /// Hand `bytes` to an input RTP port.
    pub fn update_rtp(&mut self, port: &str, bytes: &[u8]) -> Result<()> {
        self.require_exclusive("update RTP")?;
        let running = self.state == GraphState::Running;
        let lock_timeout = self.manager.runtime().lock_timeout();
        let manager = Arc::clone(&self.manager);
        let channel = self
            .rtps
            .get_mut(port)
            .ok_or_else(|| CtrlError::not_found("RTP port", port))?;
        channel.update(manager.ctrl(), self.id, bytes, running, lock_timeout)
    }

    /// Copy the current value of an output RTP port into `out`.
    pub fn read_rtp(&self, port: &str, out: &mut [u8]) -> Result<()> {
        let running = self.state == GraphState::Running;
        let channel = self.rtp(port)?;
        channel.read(self.manager.ctrl(), self.id, out, running, self.manager.runtime().lock_timeout())
    }
}
