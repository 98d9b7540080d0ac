//! Device-wide registries and host buffer sync dispatch.
//!
//! The [`ArrayManager`] is built once per loaded program. It owns the
//! device geometry, runtime tuning, the tile control backend and every
//! streaming port, and is shared (behind an `Arc`) by all graph handles
//! and profiling sessions. Registries are filled in [`ArrayManager::new`]
//! and never change afterwards.

use std::collections::HashMap;
use std::slice;
use std::sync::Arc;

use crate::config::RuntimeConfig;
use crate::device::{DeviceConfig, TileControl};
use crate::dma::{ExternalBufferGroup, ExternalSyncRequest, HostBuffer, StreamingPort};
use crate::error::{CtrlError, Result};
use crate::graph::{AccessMode, Graph};
use crate::metadata::{Metadata, PlioConfig, StreamDirection};
use crate::poll::{CancelToken, PollPolicy, Poller};

/// A resolved streaming port name.
#[derive(Debug, Clone, Copy)]
pub enum PortRef<'a> {
    Stream(&'a StreamingPort),
    External(&'a ExternalBufferGroup),
}

/// Owner of the device configuration and streaming port registries.
#[derive(Debug)]
pub struct ArrayManager {
    metadata: Metadata,
    device: Arc<DeviceConfig>,
    runtime: Arc<RuntimeConfig>,
    ctrl: Arc<dyn TileControl>,
    gmios: HashMap<String, StreamingPort>,
    externals: HashMap<String, ExternalBufferGroup>,
    plios: HashMap<String, PlioConfig>,
    cancel: CancelToken,
}

impl ArrayManager {
    /// Validate `metadata` against the backend and build every port.
    pub fn new(metadata: Metadata, runtime: Arc<RuntimeConfig>, ctrl: Arc<dyn TileControl>) -> Result<Self> {
        metadata.validate()?;
        if ctrl.generation() != metadata.device.generation {
            return Err(CtrlError::Config(format!(
                "metadata targets {} but the array is {}",
                metadata.device.generation,
                ctrl.generation()
            )));
        }
        let device = Arc::new(metadata.device.clone());

        let mut gmios = HashMap::with_capacity(metadata.gmios.len());
        for g in &metadata.gmios {
            gmios.insert(g.name.clone(), StreamingPort::new(g.clone(), &device, ctrl.as_ref())?);
        }
        let mut externals = HashMap::with_capacity(metadata.external_buffers.len());
        for e in &metadata.external_buffers {
            externals.insert(e.name.clone(), ExternalBufferGroup::new(e.clone(), &device)?);
        }
        let mut plios = HashMap::with_capacity(metadata.plios.len());
        for p in &metadata.plios {
            device.shim(p.shim_col)?;
            plios.insert(p.name.clone(), p.clone());
        }

        log::info!(
            "{} array: {} graphs, {} GMIO ports, {} external buffers, {} PLIO ports",
            device.generation,
            metadata.graphs.len(),
            gmios.len(),
            externals.len(),
            plios.len()
        );

        Ok(Self {
            metadata,
            device,
            runtime,
            ctrl,
            gmios,
            externals,
            plios,
            cancel: CancelToken::new(),
        })
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn device(&self) -> &Arc<DeviceConfig> {
        &self.device
    }

    pub fn runtime(&self) -> &Arc<RuntimeConfig> {
        &self.runtime
    }

    pub fn ctrl(&self) -> &dyn TileControl {
        self.ctrl.as_ref()
    }

    /// Token aborting every wait issued through this manager.
    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Poller honouring this manager's cancellation token.
    pub fn poller(&self, policy: PollPolicy) -> Poller<'_> {
        Poller::new(policy, Some(&self.cancel))
    }

    pub fn gmio(&self, name: &str) -> Option<&StreamingPort> {
        self.gmios.get(name)
    }

    pub fn external(&self, name: &str) -> Option<&ExternalBufferGroup> {
        self.externals.get(name)
    }

    pub fn plio(&self, name: &str) -> Option<&PlioConfig> {
        self.plios.get(name)
    }

    /// Open a graph handle sharing this manager.
    pub fn open_graph(self: &Arc<Self>, name: &str, mode: AccessMode) -> Result<Graph> {
        Graph::open(Arc::clone(self), name, mode)
    }

    /// Look a port up in the external-buffer registry, then the streaming
    /// registry. A name found in both is ambiguous.
    pub fn resolve(&self, port: &str) -> Result<PortRef<'_>> {
        match (self.externals.get(port), self.gmios.get(port)) {
            (Some(_), Some(_)) => Err(CtrlError::user(format!(
                "port '{}' is ambiguous: both an external buffer and a GMIO port",
                port
            ))),
            (Some(group), None) => Ok(PortRef::External(group)),
            (None, Some(stream)) => Ok(PortRef::Stream(stream)),
            (None, None) => Err(CtrlError::not_found("port", port)),
        }
    }

    fn dma_poller(&self) -> Poller<'_> {
        self.poller(self.runtime.dma_poll())
    }

    /// Move `size` bytes at `offset` of `buffer` through `port` and wait
    /// for the transfer to finish.
    pub fn sync(&self, port: &str, buffer: &HostBuffer, dir: StreamDirection, size: usize, offset: usize) -> Result<()> {
        self.sync_buffer(port, buffer, dir, size, offset, true)
    }

    /// Queue the transfer without waiting.
    pub fn sync_nb(&self, port: &str, buffer: &HostBuffer, dir: StreamDirection, size: usize, offset: usize) -> Result<()> {
        self.sync_buffer(port, buffer, dir, size, offset, false)
    }

    fn sync_buffer(
        &self,
        port: &str,
        buffer: &HostBuffer,
        dir: StreamDirection,
        size: usize,
        offset: usize,
        blocking: bool,
    ) -> Result<()> {
        match self.resolve(port)? {
            PortRef::Stream(stream) => {
                stream.sync(self.ctrl(), buffer, dir, size, offset, blocking, &self.dma_poller())
            }
            PortRef::External(group) => {
                // Sub-ports carry their own offsets and lengths
                if offset != 0 || size != buffer.size {
                    return Err(CtrlError::user(format!(
                        "external buffer '{}' syncs whole buffers only",
                        port
                    )));
                }
                if group.config().shim_ports.iter().any(|p| p.direction != dir) {
                    return Err(CtrlError::user(format!(
                        "external buffer '{}' does not move data {:?}",
                        port, dir
                    )));
                }
                self.sync_group(group, &ExternalSyncRequest::new(slice::from_ref(buffer)), blocking)
            }
        }
    }

    /// Sync a set of host buffers through `port`.
    ///
    /// A streaming port takes exactly one buffer and moves all of it.
    pub fn sync_external(&self, port: &str, request: &ExternalSyncRequest<'_>, blocking: bool) -> Result<()> {
        match self.resolve(port)? {
            PortRef::External(group) => self.sync_group(group, request, blocking),
            PortRef::Stream(stream) => match request.buffers {
                [buffer] => {
                    let dir = stream.config().direction;
                    let blocking = blocking && !request.skip_completion_wait;
                    stream.sync(self.ctrl(), buffer, dir, buffer.size, 0, blocking, &self.dma_poller())
                }
                _ => Err(CtrlError::user(format!(
                    "GMIO port '{}' takes one buffer, got {}",
                    port,
                    request.buffers.len()
                ))),
            },
        }
    }

    fn sync_group(&self, group: &ExternalBufferGroup, request: &ExternalSyncRequest<'_>, blocking: bool) -> Result<()> {
        group.enqueue(self.ctrl(), request)?;
        if !blocking {
            return Ok(());
        }
        if group.is_pass_through() || request.skip_completion_wait {
            log::debug!("External buffer '{}': completion left to the caller", group.name());
            return Ok(());
        }
        group.wait(self.ctrl(), &self.dma_poller())
    }

    /// Block until every transfer queued on `port` has finished.
    pub fn wait(&self, port: &str) -> Result<()> {
        match self.resolve(port)? {
            PortRef::Stream(stream) => stream.wait(self.ctrl(), &self.dma_poller()),
            PortRef::External(group) => group.wait(self.ctrl(), &self.dma_poller()),
        }
    }

    /// Reset every tile of the partition.
    pub fn reset_array(&self) -> Result<()> {
        log::info!("Resetting {} array", self.device.generation);
        self.ctrl
            .reset_array()
            .map_err(|s| CtrlError::driver(s, "array reset"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::{TileArray, TileLoc};
    use crate::error::ErrorKind;
    use crate::metadata::{ExternalBufferConfig, GmioConfig, ShimPortConfig};

    fn gmio(name: &str) -> GmioConfig {
        GmioConfig {
            id: 0,
            name: name.into(),
            direction: StreamDirection::HostToArray,
            shim_col: 1,
            channel: 2,
            stream_id: 3,
            burst_length: 16,
        }
    }

    fn external(name: &str, num_bufs: usize) -> ExternalBufferConfig {
        let port = |buffer_index, channel| ShimPortConfig {
            buffer_index,
            shim_col: 2,
            direction: StreamDirection::ArrayToHost,
            channel,
            bd_id: channel as u16 * 4,
            offset: 0,
            length: None,
            task_complete_token: false,
        };
        ExternalBufferConfig {
            id: 0,
            name: name.into(),
            num_bufs,
            shim_ports: (0..num_bufs).map(|i| port(i, i as u8)).collect(),
        }
    }

    fn setup(md: Metadata) -> (Arc<TileArray>, ArrayManager) {
        let array = Arc::new(TileArray::new(Arc::new(md.device.clone())));
        let manager = ArrayManager::new(md, Arc::new(RuntimeConfig::default()), array.clone()).unwrap();
        (array, manager)
    }

    fn sample() -> Metadata {
        let mut md = Metadata::empty(DeviceConfig::npu1());
        md.gmios.push(gmio("in"));
        md.external_buffers.push(external("pp", 2));
        md.external_buffers.push(external("one", 1));
        md
    }

    #[test]
    fn test_generation_mismatch() {
        let md = Metadata::empty(DeviceConfig::npu1());
        let array = Arc::new(TileArray::vck190());
        let err = ArrayManager::new(md, Arc::new(RuntimeConfig::default()), array).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Config);
    }

    #[test]
    fn test_resolve() {
        let mut md = sample();
        md.gmios.push(gmio("pp"));
        md.gmios[1].channel = 3;
        let (_array, manager) = setup(md);

        assert!(matches!(manager.resolve("in"), Ok(PortRef::Stream(_))));
        assert!(matches!(manager.resolve("one"), Ok(PortRef::External(_))));

        let err = manager.resolve("pp").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
        assert!(err.to_string().contains("ambiguous"));
        let err = manager.resolve("nope").unwrap_err();
        assert!(matches!(err, CtrlError::NotFound { .. }));
    }

    #[test]
    fn test_ping_pong_never_waits() {
        let (array, manager) = setup(sample());
        array.set_auto_drain(true);
        let bufs = [HostBuffer::new(0x1000, 256), HostBuffer::new(0x2000, 256)];

        manager.sync_external("pp", &ExternalSyncRequest::ping_pong(&bufs), true).unwrap();
        assert_eq!(array.stats().dma_pushes, 2);
        assert_eq!(array.stats().dma_wait_done_calls, 0);

        // Any two-buffer request is a ping-pong pair by default
        manager.sync_external("pp", &ExternalSyncRequest::new(&bufs), true).unwrap();
        assert_eq!(array.stats().dma_pushes, 4);
        assert_eq!(array.stats().dma_wait_done_calls, 0);

        // Waiting only when asked for explicitly
        let request = ExternalSyncRequest::new(&bufs).with_skip_completion_wait(false);
        manager.sync_external("pp", &request, true).unwrap();
        assert_eq!(array.stats().dma_wait_done_calls, 2);
    }

    #[test]
    fn test_gmio_sync_blocking_and_not() {
        let (array, manager) = setup(sample());
        array.set_auto_drain(true);
        let bo = HostBuffer::new(0x8000, 1024);

        manager.sync_nb("in", &bo, StreamDirection::HostToArray, 512, 0).unwrap();
        assert_eq!(array.stats().dma_wait_done_calls, 0);
        manager.sync("in", &bo, StreamDirection::HostToArray, 512, 512).unwrap();
        assert_eq!(array.stats().dma_wait_done_calls, 1);
        assert_eq!(manager.gmio("in").unwrap().in_flight(), 0);
    }

    #[test]
    fn test_buffer_bounds_checked() {
        let (array, manager) = setup(sample());
        let bo = HostBuffer::new(0x8000, 1024);
        let err = manager.sync("in", &bo, StreamDirection::HostToArray, 512, 768).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
        assert_eq!(array.stats().dma_pushes, 0);
    }

    #[test]
    fn test_external_through_sync() {
        let (array, manager) = setup(sample());
        let bo = HostBuffer::new(0x4000, 128);
        manager.sync_nb("one", &bo, StreamDirection::ArrayToHost, 128, 0).unwrap();
        let shim = TileLoc::absolute(2, 0);
        assert_eq!(array.descriptor(shim, 0).unwrap().address, 0x4000);

        let err = manager.sync_nb("one", &bo, StreamDirection::HostToArray, 128, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
        let err = manager.sync_nb("one", &bo, StreamDirection::ArrayToHost, 64, 0).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::User);
    }

    #[test]
    fn test_wait_and_reset() {
        let (array, manager) = setup(sample());
        let bo = HostBuffer::new(0x8000, 64);
        manager.sync_nb("in", &bo, StreamDirection::HostToArray, 64, 0).unwrap();

        array.set_auto_drain(true);
        manager.wait("in").unwrap();
        manager.wait("one").unwrap();
        assert!(manager.wait("missing").is_err());

        manager.reset_array().unwrap();
        assert_eq!(array.stats().array_resets, 1);
    }

    #[test]
    fn test_stream_port_through_sync_external() {
        let (array, manager) = setup(sample());
        let bufs = [HostBuffer::new(0x8000, 64)];
        manager.sync_external("in", &ExternalSyncRequest::new(&bufs), false).unwrap();
        assert_eq!(array.stats().dma_pushes, 1);

        let two = [HostBuffer::new(0, 8), HostBuffer::new(8, 8)];
        assert!(manager.sync_external("in", &ExternalSyncRequest::new(&two), false).is_err());
    }
}
