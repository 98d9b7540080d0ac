//! Runtime parameter (RTP) ping-pong handoff.
//!
//! Each RTP port owns two data buffers (ping, pong) and a selector word
//! naming the current one, each optionally guarded by a hardware lock.
//! An update writes the non-current buffer and flips the selector; a read
//! follows the selector to the current buffer. The array side consumes
//! the other buffer at its own pace.
//!
//! ```text
//!   host update                         array core
//!   -----------                         ----------
//!   acquire selector lock (write)
//!   sel = read(selector) ^ 1
//!   acquire buffer[sel] lock (write)
//!   write buffer[sel]
//!   write selector = sel
//!   release selector lock (read)  --->  acquire selector lock (read)
//!   release buffer[sel] lock (read) ->  acquire buffer[sel] lock (read)
//! ```
//!
//! Lock values depend on the hardware generation; see [`LockPolicy`].

use std::sync::Mutex;

use crate::device::{DeviceConfig, TileControl, TileKind, TileLoc, AieGeneration, LOCK_WITH_NO_VALUE};
use crate::error::{CtrlError, DriverStatus, Result};
use crate::graph::Graph;
use crate::metadata::{RtpBufferConfig, RtpConfig};

/// Lock values for one side of a handoff.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPair {
    /// Value to acquire with; `None` skips the acquire.
    pub acquire: Option<i8>,
    /// Value to release with.
    pub release: i8,
}

/// Per-generation lock values for RTP handoffs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockPolicy {
    pub update_sync: LockPair,
    pub update_async: LockPair,
    /// First update ever on an asynchronous port, before the array side
    /// has touched its locks.
    pub update_async_first: LockPair,
    pub read_sync: LockPair,
    pub read_async: LockPair,
}

/// Binary lock states.
const ACQ_WRITE: i8 = 0;
const ACQ_READ: i8 = 1;
const REL_READ: i8 = 1;
const REL_WRITE: i8 = 0;

impl LockPolicy {
    /// First-generation binary locks: value 0 = writable, 1 = readable.
    pub const AIE: Self = Self {
        update_sync: LockPair { acquire: Some(ACQ_WRITE), release: REL_READ },
        update_async: LockPair { acquire: Some(LOCK_WITH_NO_VALUE), release: REL_READ },
        update_async_first: LockPair { acquire: Some(LOCK_WITH_NO_VALUE), release: REL_READ },
        read_sync: LockPair { acquire: Some(ACQ_READ), release: REL_WRITE },
        read_async: LockPair { acquire: Some(ACQ_READ), release: REL_READ },
    };

    /// AIE-ML semaphores: take one token, give it back.
    ///
    /// An asynchronous port's semaphore starts empty, so the first update
    /// only deposits the token the array side will take.
    pub const AIE_ML: Self = Self {
        update_sync: LockPair { acquire: Some(-1), release: 1 },
        update_async: LockPair { acquire: Some(-1), release: 1 },
        update_async_first: LockPair { acquire: None, release: 1 },
        read_sync: LockPair { acquire: Some(-1), release: 1 },
        read_async: LockPair { acquire: Some(-1), release: 1 },
    };

    pub fn for_generation(generation: AieGeneration) -> &'static Self {
        match generation {
            AieGeneration::Aie => &Self::AIE,
            AieGeneration::AieMl => &Self::AIE_ML,
        }
    }

    pub fn update(&self, is_async: bool, first_async_update: bool) -> LockPair {
        match (is_async, first_async_update) {
            (false, _) => self.update_sync,
            (true, true) => self.update_async_first,
            (true, false) => self.update_async,
        }
    }

    pub fn read(&self, is_async: bool) -> LockPair {
        if is_async {
            self.read_async
        } else {
            self.read_sync
        }
    }
}

/// An RTP buffer or selector word at an absolute location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RtpSlot {
    tile: TileLoc,
    addr: u64,
    lock: u16,
}

impl RtpSlot {
    fn locate(cfg: &RtpBufferConfig, device: &DeviceConfig) -> Result<Self> {
        Ok(Self {
            tile: device.locate(TileKind::Compute, cfg.col, cfg.row)?,
            addr: cfg.addr,
            lock: cfg.lock_id,
        })
    }
}

/// One runtime parameter port.
#[derive(Debug, Clone)]
pub struct RtpChannel {
    config: RtpConfig,
    selector: RtpSlot,
    ping: RtpSlot,
    pong: RtpSlot,
    first_async_update: bool,
}

impl RtpChannel {
    pub fn new(config: RtpConfig, device: &DeviceConfig) -> Result<Self> {
        Ok(Self {
            selector: RtpSlot::locate(&config.selector, device)?,
            ping: RtpSlot::locate(&config.ping, device)?,
            pong: RtpSlot::locate(&config.pong, device)?,
            config,
            first_async_update: true,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &RtpConfig {
        &self.config
    }

    fn slot(&self, selector: u32) -> &RtpSlot {
        if selector & 1 == 1 {
            &self.pong
        } else {
            &self.ping
        }
    }

    /// Reject updates the protocol cannot serve.
    pub fn check_update(&self, graph_id: u32, len: usize, running: bool) -> Result<()> {
        let c = &self.config;
        if c.graph_id != graph_id {
            return Err(CtrlError::user(format!("RTP port '{}' does not belong to graph {}", c.name, graph_id)));
        }
        if !c.is_input {
            return Err(CtrlError::user(format!("RTP update on output port '{}'", c.name)));
        }
        if len != c.num_bytes {
            return Err(CtrlError::user(format!(
                "RTP port '{}' takes {} bytes, got {}",
                c.name, c.num_bytes, len
            )));
        }
        if c.is_pl {
            return Err(CtrlError::user(format!("RTP port '{}' is a PL port", c.name)));
        }
        if c.is_connected && !c.is_async {
            return Err(CtrlError::user(format!(
                "update of connected synchronous RTP port '{}' is not supported",
                c.name
            )));
        }
        if c.is_connected && c.is_async && running {
            return Err(CtrlError::user(format!(
                "connected asynchronous RTP port '{}' cannot be updated while the graph is running",
                c.name
            )));
        }
        Ok(())
    }

    /// Reject reads the protocol cannot serve.
    pub fn check_read(&self, graph_id: u32, len: usize) -> Result<()> {
        let c = &self.config;
        if c.graph_id != graph_id {
            return Err(CtrlError::user(format!("RTP port '{}' does not belong to graph {}", c.name, graph_id)));
        }
        if c.is_input {
            return Err(CtrlError::user(format!("RTP read on input port '{}'", c.name)));
        }
        if c.is_connected {
            return Err(CtrlError::user(format!("read of connected RTP port '{}' is not supported", c.name)));
        }
        if c.is_pl {
            return Err(CtrlError::user(format!("RTP port '{}' is a PL port", c.name)));
        }
        if len != c.num_bytes {
            return Err(CtrlError::user(format!(
                "RTP port '{}' holds {} bytes, buffer is {}",
                c.name, c.num_bytes, len
            )));
        }
        Ok(())
    }

    /// Hand `bytes` to the array side.
    ///
    /// Locks are released whenever the port has them, even if the acquire
    /// was skipped or failed, so the array side can always make progress.
    /// Data-path steps stop at the first failing primitive.
    pub fn update(
        &mut self,
        ctrl: &dyn TileControl,
        graph_id: u32,
        bytes: &[u8],
        running: bool,
        lock_timeout: u32,
    ) -> Result<()> {
        self.check_update(graph_id, bytes.len(), running)?;

        let has_lock = self.config.has_lock;
        let is_async = self.config.is_async;
        // An async port on a stopped graph has nobody to hand the lock back
        let need_lock = has_lock && !(is_async && !running);
        let locks = LockPolicy::for_generation(ctrl.generation()).update(is_async, self.first_async_update);
        let sel = self.selector;

        let mut status = DriverStatus::OK;
        if let (true, Some(value)) = (need_lock, locks.acquire) {
            status.absorb(ctrl.lock_acquire(sel.tile, sel.lock, value, lock_timeout));
        }

        let mut target = None;
        if status.is_ok() {
            if let Some(current) = status.absorb(ctrl.read_word(sel.tile, sel.addr)) {
                let next = (current & 1) ^ 1;
                target = Some((next, *self.slot(next)));
            }
        }

        if let Some((next, buf)) = target {
            if let (true, Some(value)) = (need_lock, locks.acquire) {
                status.absorb(ctrl.lock_acquire(buf.tile, buf.lock, value, lock_timeout));
            }
            if status.is_ok() {
                status.absorb(ctrl.block_write(buf.tile, buf.addr, bytes));
            }
            if status.is_ok() {
                status.absorb(ctrl.write_word(sel.tile, sel.addr, next));
            }
            log::debug!(
                "RTP '{}': wrote {} bytes to {} buffer",
                self.config.name,
                bytes.len(),
                if next == 1 { "pong" } else { "ping" }
            );
        }

        if has_lock {
            status.absorb(ctrl.lock_release(sel.tile, sel.lock, locks.release, lock_timeout));
            if let Some((_, buf)) = target {
                status.absorb(ctrl.lock_release(buf.tile, buf.lock, locks.release, lock_timeout));
            }
        }

        if status.is_ok() && is_async {
            self.first_async_update = false;
        }
        status.check(format!("update of RTP port '{}'", self.config.name))
    }

    /// Copy the current buffer into `out`.
    ///
    /// An async port read while the graph is not running takes no locks at
    /// all: neither acquires nor releases are issued.
    pub fn read(
        &self,
        ctrl: &dyn TileControl,
        graph_id: u32,
        out: &mut [u8],
        running: bool,
        lock_timeout: u32,
    ) -> Result<()> {
        self.check_read(graph_id, out.len())?;

        let is_async = self.config.is_async;
        let need_lock = self.config.has_lock && !(is_async && !running);
        let locks = LockPolicy::for_generation(ctrl.generation()).read(is_async);
        let sel = self.selector;

        let mut status = DriverStatus::OK;
        if let (true, Some(value)) = (need_lock, locks.acquire) {
            status.absorb(ctrl.lock_acquire(sel.tile, sel.lock, value, lock_timeout));
        }

        let mut source = None;
        if status.is_ok() {
            source = status.absorb(ctrl.read_word(sel.tile, sel.addr)).map(|s| *self.slot(s));
        }
        if let (true, Some(buf), Some(value)) = (need_lock, source, locks.acquire) {
            status.absorb(ctrl.lock_acquire(buf.tile, buf.lock, value, lock_timeout));
        }
        if need_lock {
            status.absorb(ctrl.lock_release(sel.tile, sel.lock, locks.release, lock_timeout));
        }
        if let (true, Some(buf)) = (status.is_ok(), source) {
            status.absorb(ctrl.block_read(buf.tile, buf.addr, out));
        }
        if let (true, Some(buf)) = (need_lock, source) {
            status.absorb(ctrl.lock_release(buf.tile, buf.lock, locks.release, lock_timeout));
        }

        status.check(format!("read of RTP port '{}'", self.config.name))
    }
}

#[derive(Debug)]
enum AsyncState {
    Idle,
    Pending(Vec<u8>),
}

/// Host-side asynchronous RTP update.
///
/// Accepts one update at a time; the transfer is performed when the owner
/// of the graph calls [`AsyncRtpBuffer::wait`]. A second submission while
/// one is outstanding is a state conflict.
#[derive(Debug)]
pub struct AsyncRtpBuffer {
    graph: String,
    port: String,
    state: Mutex<AsyncState>,
}

impl AsyncRtpBuffer {
    pub fn new(graph: impl Into<String>, port: impl Into<String>) -> Self {
        Self { graph: graph.into(), port: port.into(), state: Mutex::new(AsyncState::Idle) }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, AsyncState>> {
        self.state
            .lock()
            .map_err(|_| CtrlError::driver(DriverStatus::ERR, format!("async RTP '{}' state poisoned", self.port)))
    }

    pub fn is_pending(&self) -> bool {
        matches!(self.lock().as_deref(), Ok(AsyncState::Pending(_)))
    }

    /// Stage an update.
    pub fn submit(&self, bytes: &[u8]) -> Result<()> {
        let mut state = self.lock()?;
        if let AsyncState::Pending(_) = *state {
            return Err(CtrlError::StateConflict {
                graph: self.graph.clone(),
                op: "submit RTP update",
                reason: format!("while an update of '{}' is outstanding", self.port),
            });
        }
        *state = AsyncState::Pending(bytes.to_vec());
        Ok(())
    }

    /// Perform the staged update on `graph`. Idle afterwards, even on error.
    pub fn wait(&self, graph: &mut Graph) -> Result<()> {
        let pending = std::mem::replace(&mut *self.lock()?, AsyncState::Idle);
        match pending {
            AsyncState::Pending(bytes) => graph.update_rtp(&self.port, &bytes),
            AsyncState::Idle => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DeviceConfig, TileArray};
    use crate::error::ErrorKind;

    fn slot(addr: u64, lock_id: u16) -> RtpBufferConfig {
        RtpBufferConfig { col: 0, row: 0, addr, lock_id }
    }

    fn port(is_input: bool) -> RtpConfig {
        RtpConfig {
            name: "g.k.p".into(),
            graph_id: 7,
            is_input,
            is_async: false,
            is_connected: false,
            is_pl: false,
            num_bytes: 6,
            has_lock: true,
            selector: slot(0x1000, 1),
            ping: slot(0x1010, 2),
            pong: slot(0x1020, 3),
        }
    }

    #[test]
    fn test_policy_table() {
        let aie = LockPolicy::for_generation(AieGeneration::Aie);
        assert_eq!(aie.update(false, true).acquire, Some(0));
        assert_eq!(aie.update(true, false).acquire, Some(LOCK_WITH_NO_VALUE));
        assert_eq!(aie.read(false).release, 0);
        assert_eq!(aie.read(true).release, 1);

        let ml = LockPolicy::for_generation(AieGeneration::AieMl);
        assert_eq!(ml.update(true, true).acquire, None);
        assert_eq!(ml.update(true, false).acquire, Some(-1));
        assert_eq!(ml.update(false, true).acquire, Some(-1));
    }

    #[test]
    fn test_round_trip_binary_locks() {
        let array = TileArray::vck190();
        let device = DeviceConfig::vck190();
        let mut input = RtpChannel::new(port(true), &device).unwrap();
        let output = RtpChannel::new(port(false), &device).unwrap();

        input.update(&array, 7, b"abcdef", true, 100).unwrap();
        let core = TileLoc::absolute(0, 1);
        assert_eq!(array.read_word(core, 0x1000), Ok(1));
        assert_eq!(array.lock(core, 1).unwrap().value, 1);
        assert!(!array.lock(core, 1).unwrap().acquired);

        let mut out = [0u8; 6];
        output.read(&array, 7, &mut out, true, 100).unwrap();
        assert_eq!(&out, b"abcdef");
        // Sync read hands both locks back for writing
        assert_eq!(array.lock(core, 1).unwrap().value, 0);
        assert_eq!(array.lock(core, 3).unwrap().value, 0);
    }

    #[test]
    fn test_selector_alternates() {
        let array = TileArray::vck190();
        let device = DeviceConfig::vck190();
        let mut input = RtpChannel::new(port(true), &device).unwrap();
        let core = TileLoc::absolute(0, 1);

        input.update(&array, 7, &[1; 6], true, 100).unwrap();
        // Array side consumes: hand the locks back for writing
        array.lock_set_value(core, 1, 0).unwrap();
        array.lock_set_value(core, 3, 0).unwrap();
        input.update(&array, 7, &[2; 6], true, 100).unwrap();

        assert_eq!(array.read_word(core, 0x1000), Ok(0));
        let mut buf = [0u8; 6];
        array.block_read(core, 0x1010, &mut buf).unwrap();
        assert_eq!(buf, [2; 6]);
        array.block_read(core, 0x1020, &mut buf).unwrap();
        assert_eq!(buf, [1; 6]);
    }

    #[test]
    fn test_sync_update_blocks_until_consumed() {
        let array = TileArray::vck190();
        let device = DeviceConfig::vck190();
        let mut input = RtpChannel::new(port(true), &device).unwrap();
        input.update(&array, 7, &[1; 6], true, 100).unwrap();

        // Selector lock still readable (value 1): acquire-for-write times out
        let err = input.update(&array, 7, &[2; 6], true, 100).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Driver);
        assert!(err.is_timeout());
        // Data untouched, lock released again
        let core = TileLoc::absolute(0, 1);
        assert_eq!(array.read_word(core, 0x1000), Ok(1));
        assert!(!array.lock(core, 1).unwrap().acquired);
    }

    #[test]
    fn test_validation_before_hardware() {
        let array = TileArray::vck190();
        let device = DeviceConfig::vck190();
        let mut input = RtpChannel::new(port(true), &device).unwrap();

        assert_eq!(input.update(&array, 7, &[0; 5], true, 1).unwrap_err().kind(), ErrorKind::User);
        assert_eq!(input.update(&array, 8, &[0; 6], true, 1).unwrap_err().kind(), ErrorKind::User);

        let mut cfg = port(true);
        cfg.is_connected = true;
        let mut connected_sync = RtpChannel::new(cfg.clone(), &device).unwrap();
        assert!(connected_sync.update(&array, 7, &[0; 6], false, 1).is_err());

        cfg.is_async = true;
        let mut connected_async = RtpChannel::new(cfg, &device).unwrap();
        assert!(connected_async.update(&array, 7, &[0; 6], true, 1).is_err());
        assert!(connected_async.update(&array, 7, &[0; 6], false, 1).is_ok());

        let mut pl = port(true);
        pl.is_pl = true;
        let mut pl = RtpChannel::new(pl, &device).unwrap();
        assert!(pl.update(&array, 7, &[0; 6], true, 1).is_err());

        let output = RtpChannel::new(port(false), &device).unwrap();
        let mut out = [0u8; 6];
        assert!(input.read(&array, 7, &mut out, true, 1).is_err());
        let mut short = [0u8; 2];
        assert!(output.read(&array, 7, &mut short, true, 1).is_err());

        // Only the successful async update reached the hardware
        assert_eq!(array.stats().block_writes, 1);
    }

    #[test]
    fn test_async_stopped_skips_acquire_but_releases() {
        let array = TileArray::vck190();
        let device = DeviceConfig::vck190();
        let mut cfg = port(true);
        cfg.is_async = true;
        let mut input = RtpChannel::new(cfg, &device).unwrap();
        let core = TileLoc::absolute(0, 1);

        input.update(&array, 7, &[3; 6], false, 1).unwrap();
        input.update(&array, 7, &[4; 6], false, 1).unwrap();
        let stats = array.stats();
        assert_eq!(stats.lock_acquires, 0);
        assert_eq!(stats.lock_releases, 4);
        assert_eq!(array.lock(core, 1).unwrap().value, 1);
    }

    #[test]
    fn test_semaphore_first_async_update() {
        let array = TileArray::npu1();
        let device = DeviceConfig::npu1();
        let mut cfg = port(true);
        cfg.is_async = true;
        let mut input = RtpChannel::new(cfg, &device).unwrap();
        let core = TileLoc::absolute(0, 2);

        // Empty semaphores: only the first update may skip the acquire
        input.update(&array, 7, &[5; 6], true, 1).unwrap();
        assert_eq!(array.lock(core, 1).unwrap().value, 1);
        assert_eq!(array.stats().lock_acquires, 0);

        // Array side has released the ping buffer
        array.lock_set_value(core, 2, 1).unwrap();
        input.update(&array, 7, &[6; 6], true, 1).unwrap();
        assert_eq!(array.stats().lock_acquires, 2);
        assert_eq!(array.lock(core, 1).unwrap().value, 1);
        assert_eq!(array.read_word(core, 0x1000), Ok(0));
    }

    #[test]
    fn test_async_read_outside_running_takes_no_locks() {
        for (array, device, core) in [
            (TileArray::vck190(), DeviceConfig::vck190(), TileLoc::absolute(0, 1)),
            (TileArray::npu1(), DeviceConfig::npu1(), TileLoc::absolute(0, 2)),
        ] {
            let mut cfg = port(false);
            cfg.is_async = true;
            let output = RtpChannel::new(cfg, &device).unwrap();
            array.block_write(core, 0x1010, b"ping!!").unwrap();

            let mut out = [0u8; 6];
            output.read(&array, 7, &mut out, false, 100).unwrap();
            assert_eq!(&out, b"ping!!");
            let stats = array.stats();
            assert_eq!(stats.lock_acquires, 0);
            assert_eq!(stats.lock_releases, 0);

            // Running: the array side never released the selector, so the read blocks
            let err = output.read(&array, 7, &mut out, true, 1).unwrap_err();
            assert!(err.is_timeout());
        }
    }

    #[test]
    fn test_sync_read_locks_even_when_stopped() {
        let array = TileArray::vck190();
        let device = DeviceConfig::vck190();
        let output = RtpChannel::new(port(false), &device).unwrap();
        let mut out = [0u8; 6];
        assert!(output.read(&array, 7, &mut out, false, 1).unwrap_err().is_timeout());
        assert_eq!(array.stats().lock_acquires, 1);
    }

    #[test]
    fn test_lockless_port_no_lock_traffic() {
        let array = TileArray::npu1();
        let device = DeviceConfig::npu1();
        let mut cfg = port(true);
        cfg.has_lock = false;
        let mut input = RtpChannel::new(cfg.clone(), &device).unwrap();
        cfg.is_input = false;
        let output = RtpChannel::new(cfg, &device).unwrap();

        input.update(&array, 7, b"nolock", true, 1).unwrap();
        input.update(&array, 7, b"again!", false, 1).unwrap();
        let mut out = [0u8; 6];
        output.read(&array, 7, &mut out, true, 1).unwrap();
        assert_eq!(&out, b"again!");

        let stats = array.stats();
        assert_eq!(stats.lock_acquires, 0);
        assert_eq!(stats.lock_releases, 0);
        assert_eq!(stats.block_writes, 2);
    }

    #[test]
    fn test_async_buffer_single_outstanding() {
        let buf = AsyncRtpBuffer::new("g", "g.k.p");
        assert!(!buf.is_pending());
        buf.submit(&[1, 2]).unwrap();
        assert!(buf.is_pending());
        let err = buf.submit(&[3, 4]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::StateConflict);
    }
}
