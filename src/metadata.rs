//! Compiled-program metadata.
//!
//! The compiler that maps a data-flow graph onto the array emits which
//! cores run it, where its runtime parameters live, and which shim
//! channels carry its host streams. This module holds those facts as
//! plain `serde` structures, loadable from TOML:
//!
//! ```toml
//! [device]
//! generation = "aie-ml"
//! num_cols = 5
//! num_rows = 6
//! reserved_rows = 1
//! col_shift = 25
//! row_shift = 20
//!
//! [[graph]]
//! id = 0
//! name = "gr"
//! cores = [{ col = 0, row = 0, iter_mem_col = 0, iter_mem_row = 0, iter_mem_addr = 0x4004 }]
//!
//! [[gmio]]
//! id = 0
//! name = "in"
//! direction = "host-to-array"
//! shim_col = 0
//! channel = 2
//! ```
//!
//! Core, iteration-memory and RTP buffer coordinates are relative compute
//! tile coordinates; the row offset is applied by
//! [`DeviceConfig::locate`](crate::device::DeviceConfig::locate).

use std::collections::HashSet;
use std::path::Path;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::device::{limits, DeviceConfig, DmaDirection, PortRole};
use crate::error::{CtrlError, Result};

/// Direction of a host stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum StreamDirection {
    /// Host memory to the array (shim MM2S).
    HostToArray,
    /// Array to host memory (shim S2MM).
    ArrayToHost,
}

impl StreamDirection {
    /// Shim DMA direction serving this stream.
    pub fn dma(&self) -> DmaDirection {
        match self {
            StreamDirection::HostToArray => DmaDirection::Mm2s,
            StreamDirection::ArrayToHost => DmaDirection::S2mm,
        }
    }

    /// Stream switch role of the shim south port carrying this stream.
    pub fn switch_role(&self) -> PortRole {
        match self {
            StreamDirection::HostToArray => PortRole::Slave,
            StreamDirection::ArrayToHost => PortRole::Master,
        }
    }
}

/// One core of a graph.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreConfig {
    pub col: u8,
    pub row: u8,
    /// Tile holding the iteration-count cell.
    pub iter_mem_col: u8,
    pub iter_mem_row: u8,
    /// Address of the iteration-count cell. The termination flag sits in
    /// the word before it.
    pub iter_mem_addr: u64,
    /// Multi-rate core without an observable done bit.
    #[serde(default)]
    pub triggered: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphConfig {
    pub id: u32,
    pub name: String,
    pub cores: Vec<CoreConfig>,
}

/// Location of one RTP buffer (or the selector word) and its lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpBufferConfig {
    pub col: u8,
    pub row: u8,
    pub addr: u64,
    #[serde(default)]
    pub lock_id: u16,
}

/// Runtime parameter port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RtpConfig {
    /// Fully qualified port name.
    pub name: String,
    pub graph_id: u32,
    pub is_input: bool,
    #[serde(default)]
    pub is_async: bool,
    /// Port also has an array-side connection.
    #[serde(default)]
    pub is_connected: bool,
    /// Port lives in programmable logic rather than the array.
    #[serde(default)]
    pub is_pl: bool,
    pub num_bytes: usize,
    #[serde(default)]
    pub has_lock: bool,
    pub selector: RtpBufferConfig,
    pub ping: RtpBufferConfig,
    pub pong: RtpBufferConfig,
}

/// Host streaming port served by one shim DMA channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GmioConfig {
    pub id: u32,
    pub name: String,
    pub direction: StreamDirection,
    pub shim_col: u8,
    /// Logical channel: 0/1 are S2MM 0/1, 2/3 are MM2S 0/1.
    pub channel: u8,
    /// Shim stream switch port, used for profiling.
    #[serde(default)]
    pub stream_id: u8,
    #[serde(default = "default_burst_length")]
    pub burst_length: u8,
}

fn default_burst_length() -> u8 {
    16
}

impl GmioConfig {
    /// Physical channel number within the direction.
    pub fn physical_channel(&self) -> u8 {
        if self.channel > 1 {
            self.channel - 2
        } else {
            self.channel
        }
    }
}

/// Programmable-logic stream crossing the shim.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlioConfig {
    pub id: u32,
    pub name: String,
    pub direction: StreamDirection,
    pub shim_col: u8,
    pub stream_id: u8,
}

/// One descriptor of an external buffer group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShimPortConfig {
    /// Which of the supplied host buffers this descriptor moves.
    pub buffer_index: usize,
    pub shim_col: u8,
    pub direction: StreamDirection,
    /// Physical channel number.
    pub channel: u8,
    /// Pre-assigned descriptor slot.
    pub bd_id: u16,
    /// Byte offset into the host buffer.
    #[serde(default)]
    pub offset: u64,
    /// Bytes to move; the rest of the buffer when absent.
    #[serde(default)]
    pub length: Option<u32>,
    /// Ask the DMA to emit a task-complete token.
    #[serde(default)]
    pub task_complete_token: bool,
}

/// Multi-descriptor streaming port.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalBufferConfig {
    pub id: u32,
    pub name: String,
    /// Host buffers a sync must supply.
    pub num_bufs: usize,
    #[serde(default)]
    pub shim_ports: Vec<ShimPortConfig>,
}

/// Everything the control plane needs to know about one loaded program.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub device: DeviceConfig,
    #[serde(default, rename = "graph")]
    pub graphs: Vec<GraphConfig>,
    #[serde(default, rename = "rtp")]
    pub rtps: Vec<RtpConfig>,
    #[serde(default, rename = "gmio")]
    pub gmios: Vec<GmioConfig>,
    #[serde(default, rename = "plio")]
    pub plios: Vec<PlioConfig>,
    #[serde(default, rename = "external_buffer")]
    pub external_buffers: Vec<ExternalBufferConfig>,
}

impl Metadata {
    /// Metadata with no ports or graphs.
    pub fn empty(device: DeviceConfig) -> Self {
        Self {
            device,
            graphs: Vec::new(),
            rtps: Vec::new(),
            gmios: Vec::new(),
            plios: Vec::new(),
            external_buffers: Vec::new(),
        }
    }

    /// Parse and validate TOML metadata.
    pub fn from_toml(text: &str) -> anyhow::Result<Self> {
        let metadata: Metadata = toml::from_str(text).context("Failed to parse metadata")?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Load and validate a metadata file.
    pub fn from_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        let metadata = Self::from_toml(&text).with_context(|| format!("Invalid metadata in {}", path.display()))?;
        log::info!(
            "Loaded metadata from {}: {} graphs, {} RTP ports, {} GMIO ports, {} external buffers",
            path.display(),
            metadata.graphs.len(),
            metadata.rtps.len(),
            metadata.gmios.len(),
            metadata.external_buffers.len()
        );
        Ok(metadata)
    }

    pub fn graph(&self, name: &str) -> Option<&GraphConfig> {
        self.graphs.iter().find(|g| g.name == name)
    }

    /// RTP ports belonging to a graph.
    pub fn rtps_for_graph(&self, graph_id: u32) -> impl Iterator<Item = &RtpConfig> {
        self.rtps.iter().filter(move |r| r.graph_id == graph_id)
    }

    /// Check cross-references and ranges.
    pub fn validate(&self) -> Result<()> {
        self.device.validate()?;

        let mut names = HashSet::new();
        for g in &self.graphs {
            if !names.insert(g.name.as_str()) {
                return Err(CtrlError::Config(format!("duplicate graph '{}'", g.name)));
            }
            if g.cores.is_empty() {
                return Err(CtrlError::Config(format!("graph '{}' has no cores", g.name)));
            }
            if g.cores.iter().any(|c| c.iter_mem_addr < limits::END_FLAG_OFFSET) {
                return Err(CtrlError::Config(format!(
                    "graph '{}' has an iteration cell without room for its termination flag",
                    g.name
                )));
            }
        }

        for r in &self.rtps {
            if !self.graphs.iter().any(|g| g.id == r.graph_id) {
                return Err(CtrlError::Config(format!(
                    "RTP port '{}' refers to unknown graph id {}",
                    r.name, r.graph_id
                )));
            }
            if r.num_bytes == 0 {
                return Err(CtrlError::Config(format!("RTP port '{}' has zero size", r.name)));
            }
        }

        let mut ports = HashSet::new();
        for g in &self.gmios {
            if !ports.insert(g.name.as_str()) {
                return Err(CtrlError::Config(format!("duplicate GMIO port '{}'", g.name)));
            }
            if g.channel >= limits::LOGICAL_CHANNELS {
                return Err(CtrlError::Config(format!(
                    "GMIO port '{}' uses logical channel {}",
                    g.name, g.channel
                )));
            }
            let expected = if g.channel > 1 { StreamDirection::HostToArray } else { StreamDirection::ArrayToHost };
            if g.direction != expected {
                return Err(CtrlError::Config(format!(
                    "GMIO port '{}' direction does not match logical channel {}",
                    g.name, g.channel
                )));
            }
        }

        let mut groups = HashSet::new();
        for e in &self.external_buffers {
            if !groups.insert(e.name.as_str()) {
                return Err(CtrlError::Config(format!("duplicate external buffer '{}'", e.name)));
            }
            for p in &e.shim_ports {
                if p.buffer_index >= e.num_bufs {
                    return Err(CtrlError::Config(format!(
                        "external buffer '{}' sub-port uses buffer {} of {}",
                        e.name, p.buffer_index, e.num_bufs
                    )));
                }
                if p.channel as usize >= limits::SHIM_DMA_CHANNELS || p.bd_id as usize >= limits::SHIM_NUM_BDS {
                    return Err(CtrlError::Config(format!(
                        "external buffer '{}' sub-port uses channel {} descriptor {}",
                        e.name, p.channel, p.bd_id
                    )));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
[device]
generation = "aie-ml"
num_cols = 5
num_rows = 6
reserved_rows = 1
col_shift = 25
row_shift = 20

[[graph]]
id = 1
name = "gr"
cores = [
  { col = 0, row = 0, iter_mem_col = 0, iter_mem_row = 0, iter_mem_addr = 0x4004 },
  { col = 1, row = 0, iter_mem_col = 1, iter_mem_row = 0, iter_mem_addr = 0x4004, triggered = true },
]

[[rtp]]
name = "gr.k.in[1]"
graph_id = 1
is_input = true
num_bytes = 4
has_lock = true
selector = { col = 0, row = 0, addr = 0x3000, lock_id = 1 }
ping = { col = 0, row = 0, addr = 0x3010, lock_id = 2 }
pong = { col = 0, row = 0, addr = 0x3020, lock_id = 3 }

[[gmio]]
id = 0
name = "in"
direction = "host-to-array"
shim_col = 2
channel = 3

[[external_buffer]]
id = 0
name = "ext"
num_bufs = 2
shim_ports = [
  { buffer_index = 0, shim_col = 1, direction = "array-to-host", channel = 0, bd_id = 0 },
]
"#;

    #[test]
    fn test_parse_sample() {
        let md = Metadata::from_toml(SAMPLE).unwrap();
        assert_eq!(md.graphs.len(), 1);
        let gr = md.graph("gr").unwrap();
        assert_eq!(gr.cores.len(), 2);
        assert!(gr.cores[1].triggered);
        assert_eq!(md.rtps_for_graph(1).count(), 1);
        assert!(!md.rtps[0].is_async);
        assert_eq!(md.gmios[0].burst_length, 16);
        assert_eq!(md.gmios[0].physical_channel(), 1);
        assert_eq!(md.gmios[0].direction.dma(), DmaDirection::Mm2s);
        assert_eq!(md.external_buffers[0].shim_ports[0].length, None);
    }

    #[test]
    fn test_rejects_unknown_graph_reference() {
        let mut md = Metadata::from_toml(SAMPLE).unwrap();
        md.rtps[0].graph_id = 9;
        assert!(md.validate().is_err());
    }

    #[test]
    fn test_rejects_mismatched_gmio_direction() {
        let mut md = Metadata::from_toml(SAMPLE).unwrap();
        md.gmios[0].channel = 0;
        assert!(md.validate().is_err());
        md.gmios[0].channel = 4;
        assert!(md.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_buffer_index() {
        let mut md = Metadata::from_toml(SAMPLE).unwrap();
        md.external_buffers[0].shim_ports[0].buffer_index = 2;
        assert!(md.validate().is_err());
    }

    #[test]
    fn test_stream_direction_roles() {
        assert_eq!(StreamDirection::HostToArray.switch_role(), PortRole::Slave);
        assert_eq!(StreamDirection::ArrayToHost.switch_role(), PortRole::Master);
        assert_eq!(StreamDirection::ArrayToHost.dma(), DmaDirection::S2mm);
    }
}
