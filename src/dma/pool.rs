//! Buffer descriptor slot recycling for a streaming port.

use std::collections::VecDeque;

use super::ShimDmaChannel;
use crate::device::{BdParams, TileControl};
use crate::error::{CtrlError, Result};
use crate::poll::Poller;

/// Descriptor slots of one shim channel.
///
/// Slots move `available -> in_flight` on enqueue and back when the
/// hardware reports them drained. At most `depth` descriptors are ever
/// outstanding, so the channel's start queue cannot overflow.
#[derive(Debug, Clone)]
pub struct BdPool {
    available: VecDeque<u16>,
    in_flight: VecDeque<u16>,
    depth: u8,
}

impl BdPool {
    /// Slots `logical_channel * depth .. (logical_channel + 1) * depth`.
    pub fn new(logical_channel: u8, depth: u8) -> Self {
        let base = logical_channel as u16 * depth as u16;
        Self {
            available: (base..base + depth as u16).collect(),
            in_flight: VecDeque::with_capacity(depth as usize),
            depth,
        }
    }

    #[inline]
    pub fn depth(&self) -> u8 {
        self.depth
    }

    #[inline]
    pub fn available(&self) -> usize {
        self.available.len()
    }

    #[inline]
    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Program `bd` into a free slot and queue it.
    ///
    /// Spins on the channel's pending count while every slot is in flight.
    /// Returns the slot used.
    pub fn enqueue(
        &mut self,
        ctrl: &dyn TileControl,
        channel: &ShimDmaChannel,
        bd: &BdParams,
        poller: &Poller<'_>,
    ) -> Result<u16> {
        if self.available.is_empty() {
            let what = format!("waiting for a free descriptor on {}", channel);
            poller.poll(&what, || {
                let pending = ctrl
                    .dma_pending_count(channel.tile, channel.channel, channel.dir)
                    .map_err(|s| CtrlError::driver(s, what.clone()))?;
                let drained = self.depth.saturating_sub(pending) as usize;
                for _ in 0..drained.min(self.in_flight.len()) {
                    if let Some(slot) = self.in_flight.pop_front() {
                        self.available.push_back(slot);
                    }
                }
                Ok((!self.available.is_empty()).then_some(()))
            })?;
        }

        let slot = self
            .available
            .pop_front()
            .ok_or_else(|| CtrlError::driver(crate::error::DriverStatus::ERR, "descriptor pool empty"))?;

        let programmed = ctrl
            .dma_program_descriptor(channel.tile, slot, bd)
            .and_then(|()| ctrl.dma_push_to_queue(channel.tile, channel.channel, channel.dir, slot, 1, false));
        if let Err(status) = programmed {
            self.available.push_front(slot);
            return Err(CtrlError::driver(status, format!("enqueue on {}", channel)));
        }

        log::debug!(
            "{}: BD {} -> 0x{:X} ({} bytes), {} in flight",
            channel,
            slot,
            bd.address,
            bd.length,
            self.in_flight.len() + 1
        );
        self.in_flight.push_back(slot);
        Ok(slot)
    }

    /// Wait for the channel to go idle and reclaim every slot.
    pub fn wait(&mut self, ctrl: &dyn TileControl, channel: &ShimDmaChannel, poller: &Poller<'_>) -> Result<()> {
        channel.wait_idle(ctrl, poller)?;
        self.available.extend(self.in_flight.drain(..));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DmaDirection, TileArray, TileLoc};
    use crate::error::ErrorKind;
    use crate::poll::PollPolicy;

    fn mm2s(channel: u8) -> ShimDmaChannel {
        ShimDmaChannel { tile: TileLoc::absolute(0, 0), channel, dir: DmaDirection::Mm2s }
    }

    #[test]
    fn test_slot_numbering() {
        let pool = BdPool::new(3, 4);
        assert_eq!(pool.available.iter().copied().collect::<Vec<_>>(), vec![12, 13, 14, 15]);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_enqueue_within_depth() {
        let array = TileArray::npu1();
        let ch = mm2s(0);
        let mut pool = BdPool::new(2, 4);
        let poller = Poller::new(PollPolicy::UNBOUNDED, None);

        for i in 0..4u64 {
            let slot = pool.enqueue(&array, &ch, &BdParams::simple(0x1000 + i * 64, 64), &poller).unwrap();
            assert_eq!(slot, 8 + i as u16);
        }
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.in_flight(), 4);
        assert_eq!(array.stats().dma_pending_polls, 0);
        assert_eq!(array.descriptor(ch.tile, 9).unwrap().address, 0x1040);
    }

    #[test]
    fn test_enqueue_blocks_until_drained() {
        let array = TileArray::npu1();
        let ch = mm2s(0);
        let mut pool = BdPool::new(2, 4);
        let poller = Poller::new(PollPolicy::UNBOUNDED, None);
        for _ in 0..4 {
            pool.enqueue(&array, &ch, &BdParams::simple(0, 16), &poller).unwrap();
        }

        // First poll sees a full queue, the second sees one drained slot
        array.set_auto_drain(true);
        let slot = pool.enqueue(&array, &ch, &BdParams::simple(0, 16), &poller).unwrap();
        assert_eq!(slot, 8);
        assert_eq!(array.stats().dma_pending_polls, 2);
        assert!(pool.in_flight() <= 4);
        assert!(array.queued(ch.tile, 0, DmaDirection::Mm2s).len() <= 4);
    }

    #[test]
    fn test_enqueue_without_drain_never_overflows() {
        let array = TileArray::npu1();
        let ch = mm2s(1);
        let mut pool = BdPool::new(3, 4);
        let poller = Poller::new(PollPolicy::bounded(50), None);
        for _ in 0..4 {
            pool.enqueue(&array, &ch, &BdParams::simple(0, 16), &poller).unwrap();
        }

        let err = pool.enqueue(&array, &ch, &BdParams::simple(0, 16), &poller).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Timeout);
        assert_eq!(array.stats().dma_pending_polls, 50);
        assert_eq!(array.stats().dma_pushes, 4);
        assert_eq!(pool.in_flight(), 4);

        // Once the hardware drains, the same pool makes progress again
        array.drain_dma(ch.tile, 1, DmaDirection::Mm2s, 1).unwrap();
        assert!(pool.enqueue(&array, &ch, &BdParams::simple(0, 16), &poller).is_ok());
    }

    #[test]
    fn test_wait_reclaims_all() {
        let array = TileArray::npu1();
        let ch = mm2s(0);
        let mut pool = BdPool::new(2, 4);
        let poller = Poller::new(PollPolicy::UNBOUNDED, None);
        pool.enqueue(&array, &ch, &BdParams::simple(0, 16), &poller).unwrap();
        pool.enqueue(&array, &ch, &BdParams::simple(0, 16), &poller).unwrap();

        array.set_auto_drain(true);
        pool.wait(&array, &ch, &poller).unwrap();
        assert_eq!(pool.available(), 4);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_wait_times_out_when_busy() {
        let array = TileArray::npu1();
        let ch = mm2s(0);
        let mut pool = BdPool::new(2, 4);
        let unbounded = Poller::new(PollPolicy::UNBOUNDED, None);
        pool.enqueue(&array, &ch, &BdParams::simple(0, 16), &unbounded).unwrap();

        let bounded = Poller::new(PollPolicy::bounded(3), None);
        let err = pool.wait(&array, &ch, &bounded).unwrap_err();
        assert!(err.is_timeout());
        // Nothing reclaimed on failure
        assert_eq!(pool.in_flight(), 1);
    }
}
