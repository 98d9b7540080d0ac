//! xdna-ctrl library
//!
//! Host-side control plane for AI Engine arrays: graph lifecycle, runtime
//! parameter handoff, shim DMA streaming and stream profiling, all driven
//! through the [`device::TileControl`] interface.

pub mod error;
pub mod config;
pub mod poll;
pub mod device;
pub mod metadata;
pub mod dma;
pub mod rtp;
pub mod graph;
pub mod array_manager;
pub mod profiling;
pub mod ffi;

pub use array_manager::{ArrayManager, PortRef};
pub use config::RuntimeConfig;
pub use error::{CtrlError, DriverStatus, ErrorKind, Result};
pub use graph::{AccessMode, Graph, GraphState};
pub use metadata::Metadata;
pub use poll::{CancelToken, PollPolicy};
pub use profiling::{ProfilingHandle, ProfilingOption, ProfilingSession};
pub use rtp::AsyncRtpBuffer;
