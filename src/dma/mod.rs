//! Shim DMA streaming between host memory and the array.
//!
//! Two kinds of streaming port exist:
//!
//! - [`StreamingPort`] (GMIO): one shim channel, descriptors recycled from a
//!   small [`BdPool`] sized to the channel's start-queue depth.
//! - [`ExternalBufferGroup`]: one logical transfer fanned out over several
//!   pre-assigned descriptors, possibly on several shim tiles.
//!
//! Both bottom out in the shim DMA primitives of
//! [`TileControl`](crate::device::TileControl).

pub mod pool;
pub mod gmio;
pub mod external;

pub use pool::BdPool;
pub use gmio::StreamingPort;
pub use external::{ExternalBufferGroup, ExternalSyncRequest, PING_PONG_BUFFERS};

use std::fmt;

use crate::device::{DmaDirection, TileControl, TileLoc};
use crate::error::{CtrlError, DriverStatus, Result};
use crate::poll::Poller;

/// Polls handed to one `dma_wait_done` call before re-checking
/// cancellation and poll bounds.
const WAIT_SLICE: u32 = 1000;

/// A buffer in host memory, as seen by the shim DMA.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostBuffer {
    /// Device-visible address of the first byte.
    pub address: u64,
    /// Size in bytes.
    pub size: usize,
}

impl HostBuffer {
    pub fn new(address: u64, size: usize) -> Self {
        Self { address, size }
    }

    /// Address of `offset`, checking that `offset + len` stays inside.
    pub fn slice_address(&self, offset: u64, len: u64) -> Result<u64> {
        let end = offset
            .checked_add(len)
            .ok_or_else(|| CtrlError::user("transfer range overflows"))?;
        if end > self.size as u64 {
            return Err(CtrlError::user(format!(
                "sync range {}+{} exceeds buffer size {}",
                offset, len, self.size
            )));
        }
        Ok(self.address + offset)
    }
}

/// One shim DMA channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ShimDmaChannel {
    pub tile: TileLoc,
    pub channel: u8,
    pub dir: DmaDirection,
}

impl ShimDmaChannel {
    /// Block until the channel reports idle.
    pub fn wait_idle(&self, ctrl: &dyn TileControl, poller: &Poller<'_>) -> Result<()> {
        let what = format!("waiting for {} to go idle", self);
        poller.poll(&what, || match ctrl.dma_wait_done(self.tile, self.channel, self.dir, WAIT_SLICE) {
            Ok(()) => Ok(Some(())),
            Err(status) if status == DriverStatus::DMA_TIMEOUT => Ok(None),
            Err(status) => Err(CtrlError::driver(status, what.clone())),
        })
    }
}

impl fmt::Display for ShimDmaChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {} channel {}", self.tile, self.dir, self.channel)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_slice_address() {
        let bo = HostBuffer::new(0x8000, 256);
        assert_eq!(bo.slice_address(0, 256).unwrap(), 0x8000);
        assert_eq!(bo.slice_address(128, 64).unwrap(), 0x8080);
        assert!(bo.slice_address(200, 64).is_err());
        assert!(bo.slice_address(u64::MAX, 2).is_err());
    }
}
