//! Single-channel host streaming ports (GMIO).

use std::sync::{Mutex, MutexGuard};

use super::{BdPool, HostBuffer, ShimDmaChannel};
use crate::device::{BdParams, DeviceConfig, TileControl};
use crate::error::{CtrlError, DriverStatus, Result};
use crate::metadata::{GmioConfig, StreamDirection};
use crate::poll::Poller;

/// A host stream served by one shim DMA channel.
///
/// The descriptor pool sits behind a mutex so the port can live in the
/// shared, read-only registry of the
/// [`ArrayManager`](crate::ArrayManager).
#[derive(Debug)]
pub struct StreamingPort {
    config: GmioConfig,
    channel: ShimDmaChannel,
    pool: Mutex<BdPool>,
}

impl StreamingPort {
    /// Enable the port's shim channel and size its descriptor pool.
    pub fn new(config: GmioConfig, device: &DeviceConfig, ctrl: &dyn TileControl) -> Result<Self> {
        let channel = ShimDmaChannel {
            tile: device.shim(config.shim_col)?,
            channel: config.physical_channel(),
            dir: config.direction.dma(),
        };

        let mut status = DriverStatus::OK;
        status.absorb(ctrl.dma_channel_enable(channel.tile, channel.channel, channel.dir));
        let depth = status.absorb(ctrl.dma_queue_depth(channel.tile)).unwrap_or(0);
        status.check(format!("configuring GMIO port '{}'", config.name))?;

        log::debug!("GMIO '{}' on {} with {} descriptor slots", config.name, channel, depth);
        Ok(Self {
            pool: Mutex::new(BdPool::new(config.channel, depth)),
            config,
            channel,
        })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &GmioConfig {
        &self.config
    }

    pub fn channel(&self) -> &ShimDmaChannel {
        &self.channel
    }

    fn pool(&self) -> Result<MutexGuard<'_, BdPool>> {
        self.pool
            .lock()
            .map_err(|_| CtrlError::driver(DriverStatus::ERR, format!("GMIO '{}' state poisoned", self.config.name)))
    }

    /// Slots currently queued in hardware.
    pub fn in_flight(&self) -> usize {
        self.pool().map(|p| p.in_flight()).unwrap_or(0)
    }

    /// Queue one transfer of `size` bytes at `address`.
    pub fn enqueue(&self, ctrl: &dyn TileControl, address: u64, size: u32, poller: &Poller<'_>) -> Result<u16> {
        let mut bd = BdParams::simple(address, size).with_burst(self.config.burst_length);
        if self.config.direction == StreamDirection::HostToArray {
            bd = bd.lock_free();
        }
        self.pool()?.enqueue(ctrl, &self.channel, &bd, poller)
    }

    /// Block until every queued transfer has finished.
    pub fn wait(&self, ctrl: &dyn TileControl, poller: &Poller<'_>) -> Result<()> {
        self.pool()?.wait(ctrl, &self.channel, poller)
    }

    /// Validate a sync request and queue it.
    ///
    /// `blocking` additionally waits for the channel to go idle.
    #[allow(clippy::too_many_arguments)]
    pub fn sync(
        &self,
        ctrl: &dyn TileControl,
        buffer: &HostBuffer,
        dir: StreamDirection,
        size: usize,
        offset: usize,
        blocking: bool,
        poller: &Poller<'_>,
    ) -> Result<()> {
        if dir != self.config.direction {
            return Err(CtrlError::user(format!(
                "GMIO port '{}' is {:?}, sync requested {:?}",
                self.config.name, self.config.direction, dir
            )));
        }
        if size == 0 {
            return Err(CtrlError::user(format!("GMIO port '{}': empty sync", self.config.name)));
        }
        let len = u32::try_from(size)
            .map_err(|_| CtrlError::user(format!("sync size {} exceeds a single descriptor", size)))?;
        let address = buffer.slice_address(offset as u64, size as u64)?;

        self.enqueue(ctrl, address, len, poller)?;
        if blocking {
            self.wait(ctrl, poller)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DmaDirection, TileArray, TileLoc};
    use crate::error::ErrorKind;
    use crate::poll::PollPolicy;

    fn gmio(channel: u8, direction: StreamDirection) -> GmioConfig {
        GmioConfig {
            id: 0,
            name: "in".into(),
            direction,
            shim_col: 1,
            channel,
            stream_id: 3,
            burst_length: 16,
        }
    }

    #[test]
    fn test_new_enables_channel() {
        let array = TileArray::npu1();
        let port = StreamingPort::new(gmio(3, StreamDirection::HostToArray), array.device(), &array).unwrap();
        assert_eq!(port.channel().tile, TileLoc::absolute(1, 0));
        assert_eq!(port.channel().channel, 1);
        assert_eq!(port.channel().dir, DmaDirection::Mm2s);
        assert!(array.channel_enabled(TileLoc::absolute(1, 0), 1, DmaDirection::Mm2s));
    }

    #[test]
    fn test_sync_programs_lock_free_descriptor() {
        let array = TileArray::npu1();
        let port = StreamingPort::new(gmio(2, StreamDirection::HostToArray), array.device(), &array).unwrap();
        let poller = Poller::new(PollPolicy::UNBOUNDED, None);
        let bo = HostBuffer::new(0x10_0000, 1024);

        port.sync(&array, &bo, StreamDirection::HostToArray, 256, 512, false, &poller).unwrap();
        // Logical channel 2, depth 4: first slot is 8
        let bd = array.descriptor(TileLoc::absolute(1, 0), 8).unwrap();
        assert_eq!(bd.address, 0x10_0200);
        assert_eq!(bd.length, 256);
        assert!(bd.lock_free);
        assert_eq!(port.in_flight(), 1);
        assert_eq!(array.stats().dma_wait_done_calls, 0);
    }

    #[test]
    fn test_blocking_sync_waits() {
        let array = TileArray::npu1();
        array.set_auto_drain(true);
        let port = StreamingPort::new(gmio(0, StreamDirection::ArrayToHost), array.device(), &array).unwrap();
        let poller = Poller::new(PollPolicy::UNBOUNDED, None);
        let bo = HostBuffer::new(0x2000, 64);

        port.sync(&array, &bo, StreamDirection::ArrayToHost, 64, 0, true, &poller).unwrap();
        assert_eq!(array.stats().dma_wait_done_calls, 1);
        assert_eq!(port.in_flight(), 0);
        let bd = array.descriptor(TileLoc::absolute(1, 0), 0).unwrap();
        assert!(!bd.lock_free);
    }

    #[test]
    fn test_sync_validation() {
        let array = TileArray::npu1();
        let port = StreamingPort::new(gmio(2, StreamDirection::HostToArray), array.device(), &array).unwrap();
        let poller = Poller::new(PollPolicy::UNBOUNDED, None);
        let bo = HostBuffer::new(0x2000, 64);

        let err = port.sync(&array, &bo, StreamDirection::ArrayToHost, 64, 0, false, &poller).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
        let err = port.sync(&array, &bo, StreamDirection::HostToArray, 64, 8, false, &poller).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
        let err = port.sync(&array, &bo, StreamDirection::HostToArray, 0, 0, false, &poller).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
        // Nothing reached the hardware
        assert_eq!(array.stats().dma_pushes, 0);
    }
}
