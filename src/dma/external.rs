//! Multi-descriptor external buffer groups.

use super::{HostBuffer, ShimDmaChannel};
use crate::device::{BdParams, DeviceConfig, TileControl, TileLoc};
use crate::error::{CtrlError, DriverStatus, Result};
use crate::metadata::{ExternalBufferConfig, ShimPortConfig};
use crate::poll::Poller;

/// A sync request against an external buffer group.
#[derive(Debug, Clone, Copy)]
pub struct ExternalSyncRequest<'a> {
    /// Host buffers, indexed by each sub-port's `buffer_index`.
    pub buffers: &'a [HostBuffer],
    /// Repeat count for every enqueued task.
    pub repetition: u32,
    /// Do not wait for the channels to go idle, even for a blocking sync.
    /// Defaults to on for a ping-pong pair of buffers.
    pub skip_completion_wait: bool,
}

/// Buffer count treated as a ping-pong pair by [`ExternalSyncRequest::new`].
pub const PING_PONG_BUFFERS: usize = 2;

impl<'a> ExternalSyncRequest<'a> {
    pub fn new(buffers: &'a [HostBuffer]) -> Self {
        Self { buffers, repetition: 1, skip_completion_wait: buffers.len() == PING_PONG_BUFFERS }
    }

    /// Ping-pong pair. The caller's pipeline owns completion of ping-pong
    /// transfers, so the dispatcher never waits on them.
    pub fn ping_pong(buffers: &'a [HostBuffer; 2]) -> Self {
        Self { buffers, repetition: 1, skip_completion_wait: true }
    }

    pub fn with_repetition(mut self, repetition: u32) -> Self {
        self.repetition = repetition;
        self
    }

    /// Override the ping-pong default.
    pub fn with_skip_completion_wait(mut self, skip: bool) -> Self {
        self.skip_completion_wait = skip;
        self
    }
}

/// Sub-ports sharing one shim channel, in configuration order.
#[derive(Debug, Clone)]
struct ChannelTask {
    channel: ShimDmaChannel,
    ports: Vec<usize>,
}

/// A named port fanning one transfer out over pre-assigned descriptors.
#[derive(Debug, Clone)]
pub struct ExternalBufferGroup {
    config: ExternalBufferConfig,
    tiles: Vec<TileLoc>,
    tasks: Vec<ChannelTask>,
}

impl ExternalBufferGroup {
    pub fn new(config: ExternalBufferConfig, device: &DeviceConfig) -> Result<Self> {
        let mut tiles = Vec::with_capacity(config.shim_ports.len());
        let mut tasks: Vec<ChannelTask> = Vec::new();

        for (i, port) in config.shim_ports.iter().enumerate() {
            let channel = ShimDmaChannel {
                tile: device.shim(port.shim_col)?,
                channel: port.channel,
                dir: port.direction.dma(),
            };
            tiles.push(channel.tile);
            match tasks.iter_mut().find(|t| t.channel == channel) {
                Some(task) => task.ports.push(i),
                None => tasks.push(ChannelTask { channel, ports: vec![i] }),
            }
        }

        Ok(Self { config, tiles, tasks })
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    pub fn config(&self) -> &ExternalBufferConfig {
        &self.config
    }

    /// No sub-ports: data passes through without shim DMA involvement.
    pub fn is_pass_through(&self) -> bool {
        self.config.shim_ports.is_empty()
    }

    /// Distinct channels the group drives.
    pub fn channels(&self) -> impl Iterator<Item = &ShimDmaChannel> {
        self.tasks.iter().map(|t| &t.channel)
    }

    fn descriptor(&self, port: &ShimPortConfig, buffer: &HostBuffer, next: Option<u16>) -> Result<BdParams> {
        let len = match port.length {
            Some(len) => len as u64,
            None => (buffer.size as u64).checked_sub(port.offset).ok_or_else(|| {
                CtrlError::user(format!(
                    "external buffer '{}': offset {} beyond buffer size {}",
                    self.config.name, port.offset, buffer.size
                ))
            })?,
        };
        let address = buffer.slice_address(port.offset, len)?;
        let length = u32::try_from(len)
            .map_err(|_| CtrlError::user(format!("descriptor length {} too large", len)))?;
        let mut bd = BdParams::simple(address, length);
        bd.next_bd = next;
        Ok(bd)
    }

    /// Program every sub-port descriptor and enqueue one task per channel.
    pub fn enqueue(&self, ctrl: &dyn TileControl, request: &ExternalSyncRequest<'_>) -> Result<()> {
        if request.buffers.len() != self.config.num_bufs {
            return Err(CtrlError::user(format!(
                "external buffer '{}' expects {} buffers, got {}",
                self.config.name,
                self.config.num_bufs,
                request.buffers.len()
            )));
        }

        // Validate everything before touching hardware
        let mut programmed = Vec::with_capacity(self.config.shim_ports.len());
        for task in &self.tasks {
            for (k, &i) in task.ports.iter().enumerate() {
                let port = &self.config.shim_ports[i];
                let next = task.ports.get(k + 1).map(|&n| self.config.shim_ports[n].bd_id);
                let bd = self.descriptor(port, &request.buffers[port.buffer_index], next)?;
                programmed.push((self.tiles[i], port.bd_id, bd));
            }
        }

        let mut status = DriverStatus::OK;
        for (tile, bd_id, bd) in &programmed {
            log::debug!("{} '{}': BD {} -> 0x{:X} ({} bytes)", tile, self.config.name, bd_id, bd.address, bd.length);
            status.absorb(ctrl.dma_program_descriptor(*tile, *bd_id, bd));
        }
        for task in &self.tasks {
            let first = &self.config.shim_ports[task.ports[0]];
            let token = task.ports.iter().any(|&i| self.config.shim_ports[i].task_complete_token);
            let ch = &task.channel;
            status.absorb(ctrl.dma_push_to_queue(ch.tile, ch.channel, ch.dir, first.bd_id, request.repetition, token));
        }
        status.check(format!("sync of external buffer '{}'", self.config.name))
    }

    /// Block until every channel of the group is idle.
    pub fn wait(&self, ctrl: &dyn TileControl, poller: &Poller<'_>) -> Result<()> {
        for task in &self.tasks {
            task.channel.wait_idle(ctrl, poller)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{DmaDirection, TileArray};
    use crate::error::ErrorKind;
    use crate::metadata::StreamDirection;
    use crate::poll::PollPolicy;

    fn sub_port(buffer_index: usize, shim_col: u8, channel: u8, bd_id: u16) -> ShimPortConfig {
        ShimPortConfig {
            buffer_index,
            shim_col,
            direction: StreamDirection::ArrayToHost,
            channel,
            bd_id,
            offset: 0,
            length: None,
            task_complete_token: false,
        }
    }

    fn group(ports: Vec<ShimPortConfig>, num_bufs: usize) -> ExternalBufferGroup {
        let config = ExternalBufferConfig { id: 0, name: "ext".into(), num_bufs, shim_ports: ports };
        ExternalBufferGroup::new(config, &crate::device::DeviceConfig::npu1()).unwrap()
    }

    #[test]
    fn test_one_task_per_channel() {
        let array = TileArray::npu1();
        let mut second = sub_port(1, 1, 0, 5);
        second.offset = 16;
        second.length = Some(32);
        let g = group(vec![sub_port(0, 1, 0, 4), second, sub_port(1, 2, 1, 0)], 2);
        assert_eq!(g.channels().count(), 2);

        let bufs = [HostBuffer::new(0x1000, 64), HostBuffer::new(0x2000, 64)];
        g.enqueue(&array, &ExternalSyncRequest::new(&bufs).with_repetition(3)).unwrap();

        let shim1 = TileLoc::absolute(1, 0);
        let q = array.queued(shim1, 0, DmaDirection::S2mm);
        assert_eq!(q.len(), 1);
        assert_eq!(q[0].bd, 4);
        assert_eq!(q[0].repeat, 3);

        // First descriptor chains to the second on the same channel
        let bd4 = array.descriptor(shim1, 4).unwrap();
        assert_eq!(bd4.next_bd, Some(5));
        assert_eq!(bd4.length, 64);
        let bd5 = array.descriptor(shim1, 5).unwrap();
        assert_eq!(bd5.address, 0x2010);
        assert_eq!(bd5.length, 32);
        assert_eq!(bd5.next_bd, None);

        assert_eq!(array.queued(TileLoc::absolute(2, 0), 1, DmaDirection::S2mm).len(), 1);
        assert_eq!(array.stats().dma_pushes, 2);
    }

    #[test]
    fn test_buffer_count_checked_first() {
        let array = TileArray::npu1();
        let g = group(vec![sub_port(0, 1, 0, 0)], 2);
        let bufs = [HostBuffer::new(0x1000, 64)];
        let err = g.enqueue(&array, &ExternalSyncRequest::new(&bufs)).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
        assert_eq!(array.stats().bd_writes, 0);
    }

    #[test]
    fn test_wait_covers_every_channel() {
        let array = TileArray::npu1();
        array.set_auto_drain(true);
        let g = group(vec![sub_port(0, 1, 0, 0), sub_port(0, 3, 1, 2)], 1);
        let bufs = [HostBuffer::new(0x1000, 64)];
        g.enqueue(&array, &ExternalSyncRequest::new(&bufs)).unwrap();
        g.wait(&array, &Poller::new(PollPolicy::UNBOUNDED, None)).unwrap();
        assert_eq!(array.stats().dma_wait_done_calls, 2);
    }

    #[test]
    fn test_pass_through() {
        let g = group(Vec::new(), 1);
        assert!(g.is_pass_through());
        let array = TileArray::npu1();
        g.wait(&array, &Poller::new(PollPolicy::UNBOUNDED, None)).unwrap();
        assert_eq!(array.stats().dma_wait_done_calls, 0);
    }

    #[test]
    fn test_ping_pong_request() {
        let bufs = [HostBuffer::new(0, 8), HostBuffer::new(8, 8)];
        let req = ExternalSyncRequest::ping_pong(&bufs);
        assert!(req.skip_completion_wait);
        assert_eq!(req.buffers.len(), 2);
        assert!(ExternalSyncRequest::new(&bufs).skip_completion_wait);
        assert!(!ExternalSyncRequest::new(&bufs).with_skip_completion_wait(false).skip_completion_wait);

        let three = [HostBuffer::new(0, 8), HostBuffer::new(8, 8), HostBuffer::new(16, 8)];
        assert!(!ExternalSyncRequest::new(&three).skip_completion_wait);
        assert!(!ExternalSyncRequest::new(&three[..1]).skip_completion_wait);
    }
}
