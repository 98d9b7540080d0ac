//! Foreign Function Interface for xdna-ctrl.
//!
//! This module provides C-callable functions for driving loaded programs
//! from C/C++ host code.
//!
//! # Safety
//! All functions in this module use the `extern "C"` ABI and must be
//! called with valid pointers. Null pointer checks are performed where
//! appropriate.
//!
//! # Errors
//! Every fallible function returns an [`XdnaCtrlResult`]. The message of
//! the most recent failure on the calling thread is available through
//! [`xdna_ctrl_last_error`]. Panics are caught at the boundary and reported
//! as [`XdnaCtrlResult::Panic`].
//!
//! # Memory Management
//! - Handles returned by `xdna_ctrl_*_create`/`_open`/`_start` functions
//!   must be freed with the corresponding `_destroy`/`_close`/`_stop`.
//! - RTP data is copied; the caller retains ownership of its pointers.

use std::cell::RefCell;
use std::ffi::{c_char, CStr};
use std::panic::{self, AssertUnwindSafe};
use std::slice;
use std::sync::Arc;

use crate::array_manager::ArrayManager;
use crate::config::RuntimeConfig;
use crate::device::TileArray;
use crate::dma::HostBuffer;
use crate::error::{CtrlError, ErrorKind};
use crate::graph::{AccessMode, Graph};
use crate::metadata::{Metadata, StreamDirection};
use crate::profiling::{ProfilingHandle, ProfilingOption, ProfilingSession};

/// Opaque handle to a loaded program on an emulated array.
pub struct XdnaCtrlDevice {
    manager: Arc<ArrayManager>,
    array: Arc<TileArray>,
}

/// Opaque graph handle.
pub struct XdnaCtrlGraph {
    graph: Graph,
}

/// Opaque handle to a running profiling measurement.
pub struct XdnaCtrlProfile {
    session: ProfilingSession,
    handle: ProfilingHandle,
}

/// Result codes for FFI operations.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XdnaCtrlResult {
    Success = 0,
    InvalidHandle = 1,
    NullPointer = 2,
    InvalidString = 3,
    User = 4,
    StateConflict = 5,
    ResourceUnavailable = 6,
    Timeout = 7,
    Cancelled = 8,
    Driver = 9,
    Config = 10,
    Panic = 11,
}

impl From<ErrorKind> for XdnaCtrlResult {
    fn from(kind: ErrorKind) -> Self {
        match kind {
            ErrorKind::User => XdnaCtrlResult::User,
            ErrorKind::StateConflict => XdnaCtrlResult::StateConflict,
            ErrorKind::ResourceUnavailable => XdnaCtrlResult::ResourceUnavailable,
            ErrorKind::Timeout => XdnaCtrlResult::Timeout,
            ErrorKind::Cancelled => XdnaCtrlResult::Cancelled,
            ErrorKind::Driver => XdnaCtrlResult::Driver,
            ErrorKind::Config => XdnaCtrlResult::Config,
        }
    }
}

/// Failure inside an entry point, before it becomes a result code.
struct FfiError {
    code: XdnaCtrlResult,
    message: String,
}

impl FfiError {
    fn new(code: XdnaCtrlResult, message: impl Into<String>) -> Self {
        Self { code, message: message.into() }
    }
}

impl From<CtrlError> for FfiError {
    fn from(e: CtrlError) -> Self {
        Self::new(e.kind().into(), e.to_string())
    }
}

type FfiResult<T> = std::result::Result<T, FfiError>;

thread_local! {
    static LAST_ERROR: RefCell<String> = const { RefCell::new(String::new()) };
}

fn set_last_error(message: String) {
    LAST_ERROR.with(|e| *e.borrow_mut() = message);
}

/// Run an entry point body, recording its failure and catching panics.
fn call(name: &str, f: impl FnOnce() -> FfiResult<()>) -> XdnaCtrlResult {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(())) => XdnaCtrlResult::Success,
        Ok(Err(e)) => {
            log::error!("{}: {}", name, e.message);
            set_last_error(e.message);
            e.code
        }
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            log::error!("{}: panicked: {}", name, msg);
            set_last_error(format!("panic: {}", msg));
            XdnaCtrlResult::Panic
        }
    }
}

unsafe fn c_str<'a>(ptr: *const c_char, what: &str) -> FfiResult<&'a str> {
    if ptr.is_null() {
        return Err(FfiError::new(XdnaCtrlResult::NullPointer, format!("{} is null", what)));
    }
    CStr::from_ptr(ptr)
        .to_str()
        .map_err(|_| FfiError::new(XdnaCtrlResult::InvalidString, format!("{} is not UTF-8", what)))
}

unsafe fn handle_mut<'a, T>(ptr: *mut T, what: &str) -> FfiResult<&'a mut T> {
    ptr.as_mut()
        .ok_or_else(|| FfiError::new(XdnaCtrlResult::InvalidHandle, format!("{} handle is null", what)))
}

unsafe fn out_ptr<'a, T>(ptr: *mut T, what: &str) -> FfiResult<&'a mut T> {
    ptr.as_mut()
        .ok_or_else(|| FfiError::new(XdnaCtrlResult::NullPointer, format!("{} output is null", what)))
}

fn direction(raw: u32) -> FfiResult<StreamDirection> {
    match raw {
        0 => Ok(StreamDirection::HostToArray),
        1 => Ok(StreamDirection::ArrayToHost),
        _ => Err(FfiError::new(XdnaCtrlResult::User, format!("invalid direction {}", raw))),
    }
}

fn profiling_option(raw: u32) -> FfiResult<ProfilingOption> {
    match raw {
        0 => Ok(ProfilingOption::StreamRunningToIdleCycles),
        1 => Ok(ProfilingOption::StreamStartToBytesTransferredCycles),
        2 => Ok(ProfilingOption::StreamStartDifferenceCycles),
        3 => Ok(ProfilingOption::StreamRunningEventCount),
        _ => Err(FfiError::new(XdnaCtrlResult::User, format!("invalid profiling option {}", raw))),
    }
}

// ============================================================================
// Device
// ============================================================================

/// Load a metadata file and build a control plane over an emulated array.
///
/// # Safety
/// - `metadata_path` must be a valid null-terminated C string
/// - `device_out` must be a valid pointer; it receives a handle that must
///   be freed with `xdna_ctrl_device_destroy`
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_device_create(
    metadata_path: *const c_char,
    device_out: *mut *mut XdnaCtrlDevice,
) -> XdnaCtrlResult {
    let _ = env_logger::try_init();

    call("xdna_ctrl_device_create", || {
        let path = c_str(metadata_path, "metadata path")?;
        let out = out_ptr(device_out, "device")?;
        let metadata = Metadata::from_file(path)
            .map_err(|e| FfiError::new(XdnaCtrlResult::Config, format!("{:#}", e)))?;
        let array = Arc::new(TileArray::new(Arc::new(metadata.device.clone())));
        let manager = ArrayManager::new(metadata, Arc::new(RuntimeConfig::load()), array.clone())?;
        *out = Box::into_raw(Box::new(XdnaCtrlDevice { manager: Arc::new(manager), array }));
        Ok(())
    })
}

/// Destroy a device.
///
/// Graph and profiling handles keep the control plane alive until they are
/// released too.
///
/// # Safety
/// `device` must be a handle returned by `xdna_ctrl_device_create`, or null
/// (in which case this is a no-op).
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_device_destroy(device: *mut XdnaCtrlDevice) {
    if !device.is_null() {
        drop(Box::from_raw(device));
    }
}

/// Make enabled cores report done after `polls` done polls (0 = never).
///
/// # Safety
/// `device` must be valid.
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_device_set_core_autocomplete(
    device: *mut XdnaCtrlDevice,
    polls: u32,
) -> XdnaCtrlResult {
    call("xdna_ctrl_device_set_core_autocomplete", || {
        let device = handle_mut(device, "device")?;
        device.array.set_core_autocomplete((polls > 0).then_some(polls));
        Ok(())
    })
}

/// Abort every wait in progress on this device.
///
/// # Safety
/// `device` must be valid.
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_device_cancel(device: *mut XdnaCtrlDevice) -> XdnaCtrlResult {
    call("xdna_ctrl_device_cancel", || {
        handle_mut(device, "device")?.manager.cancel_token().cancel();
        Ok(())
    })
}

/// Reset every tile of the array.
///
/// # Safety
/// `device` must be valid.
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_device_reset(device: *mut XdnaCtrlDevice) -> XdnaCtrlResult {
    call("xdna_ctrl_device_reset", || Ok(handle_mut(device, "device")?.manager.reset_array()?))
}

// ============================================================================
// Streaming
// ============================================================================

/// Move `size` bytes at `offset` of a host buffer through a streaming port.
///
/// `direction` is 0 for host-to-array, 1 for array-to-host.
///
/// # Safety
/// - `device` must be valid
/// - `port` must be a valid null-terminated C string
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_sync(
    device: *mut XdnaCtrlDevice,
    port: *const c_char,
    buffer_address: u64,
    buffer_size: u64,
    direction: u32,
    size: u64,
    offset: u64,
    blocking: bool,
) -> XdnaCtrlResult {
    call("xdna_ctrl_sync", || {
        let device = handle_mut(device, "device")?;
        let port = c_str(port, "port")?;
        let dir = self::direction(direction)?;
        let buffer = HostBuffer::new(buffer_address, buffer_size as usize);
        let manager = &device.manager;
        if blocking {
            manager.sync(port, &buffer, dir, size as usize, offset as usize)?;
        } else {
            manager.sync_nb(port, &buffer, dir, size as usize, offset as usize)?;
        }
        Ok(())
    })
}

/// Wait for every transfer queued on a streaming port.
///
/// # Safety
/// - `device` must be valid
/// - `port` must be a valid null-terminated C string
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_wait(device: *mut XdnaCtrlDevice, port: *const c_char) -> XdnaCtrlResult {
    call("xdna_ctrl_wait", || {
        let device = handle_mut(device, "device")?;
        let port = c_str(port, "port")?;
        Ok(device.manager.wait(port)?)
    })
}

// ============================================================================
// Graphs
// ============================================================================

/// Open a graph by name. `shared` selects shared (read-only) access.
///
/// # Safety
/// - `device` must be valid
/// - `name` must be a valid null-terminated C string
/// - `graph_out` must be a valid pointer; it receives a handle that must be
///   freed with `xdna_ctrl_graph_close`
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_graph_open(
    device: *mut XdnaCtrlDevice,
    name: *const c_char,
    shared: bool,
    graph_out: *mut *mut XdnaCtrlGraph,
) -> XdnaCtrlResult {
    call("xdna_ctrl_graph_open", || {
        let device = handle_mut(device, "device")?;
        let name = c_str(name, "graph name")?;
        let out = out_ptr(graph_out, "graph")?;
        let mode = if shared { AccessMode::Shared } else { AccessMode::Exclusive };
        let graph = device.manager.open_graph(name, mode)?;
        *out = Box::into_raw(Box::new(XdnaCtrlGraph { graph }));
        Ok(())
    })
}

/// Close a graph, waiting for it first if it is running.
///
/// The handle is freed even when the wait fails.
///
/// # Safety
/// `graph` must be a handle returned by `xdna_ctrl_graph_open`, or null.
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_graph_close(graph: *mut XdnaCtrlGraph) -> XdnaCtrlResult {
    if graph.is_null() {
        return XdnaCtrlResult::Success;
    }
    let graph = Box::from_raw(graph);
    call("xdna_ctrl_graph_close", move || Ok(graph.graph.close()?))
}

/// Run for `iterations` iterations (0 = run forever).
///
/// # Safety
/// `graph` must be valid.
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_graph_run(graph: *mut XdnaCtrlGraph, iterations: u32) -> XdnaCtrlResult {
    call("xdna_ctrl_graph_run", || Ok(handle_mut(graph, "graph")?.graph.run_iterations(iterations)?))
}

/// Wait for completion. A negative `timeout_ms` waits without a deadline.
///
/// # Safety
/// `graph` must be valid.
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_graph_wait(graph: *mut XdnaCtrlGraph, timeout_ms: i64) -> XdnaCtrlResult {
    call("xdna_ctrl_graph_wait", || Ok(handle_mut(graph, "graph")?.graph.wait_done(timeout_ms)?))
}

/// Let the graph run for `cycles` cycles since its last start, then
/// disable its cores.
///
/// # Safety
/// `graph` must be valid.
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_graph_wait_cycles(graph: *mut XdnaCtrlGraph, cycles: u64) -> XdnaCtrlResult {
    call("xdna_ctrl_graph_wait_cycles", || Ok(handle_mut(graph, "graph")?.graph.wait_cycles(cycles)?))
}

/// # Safety
/// `graph` must be valid.
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_graph_suspend(graph: *mut XdnaCtrlGraph) -> XdnaCtrlResult {
    call("xdna_ctrl_graph_suspend", || Ok(handle_mut(graph, "graph")?.graph.suspend()?))
}

/// # Safety
/// `graph` must be valid.
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_graph_resume(graph: *mut XdnaCtrlGraph) -> XdnaCtrlResult {
    call("xdna_ctrl_graph_resume", || Ok(handle_mut(graph, "graph")?.graph.resume()?))
}

/// End the graph once its cores are done.
///
/// # Safety
/// `graph` must be valid.
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_graph_end(graph: *mut XdnaCtrlGraph) -> XdnaCtrlResult {
    call("xdna_ctrl_graph_end", || Ok(handle_mut(graph, "graph")?.graph.end()?))
}

/// End the graph after letting it run for `cycles`. A suspended graph is
/// ended right away, whatever the budget.
///
/// # Safety
/// `graph` must be valid.
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_graph_end_cycles(graph: *mut XdnaCtrlGraph, cycles: u64) -> XdnaCtrlResult {
    call("xdna_ctrl_graph_end_cycles", || Ok(handle_mut(graph, "graph")?.graph.end_cycles(cycles)?))
}

/// # Safety
/// `graph` must be valid.
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_graph_reset(graph: *mut XdnaCtrlGraph) -> XdnaCtrlResult {
    call("xdna_ctrl_graph_reset", || Ok(handle_mut(graph, "graph")?.graph.reset()?))
}

/// Current graph state: 0 reset, 1 running, 2 stopped, 3 suspended,
/// 4 ended. Returns -1 for a null handle.
///
/// # Safety
/// `graph` must be valid or null.
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_graph_status(graph: *const XdnaCtrlGraph) -> i32 {
    match graph.as_ref() {
        Some(g) => g.graph.status() as i32,
        None => -1,
    }
}

/// Read the array timer of the graph's first core.
///
/// # Safety
/// - `graph` must be valid
/// - `timestamp_out` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_graph_timestamp(
    graph: *mut XdnaCtrlGraph,
    timestamp_out: *mut u64,
) -> XdnaCtrlResult {
    call("xdna_ctrl_graph_timestamp", || {
        let graph = handle_mut(graph, "graph")?;
        let out = out_ptr(timestamp_out, "timestamp")?;
        *out = graph.graph.timestamp()?;
        Ok(())
    })
}

/// Write a runtime parameter.
///
/// # Safety
/// - `graph` must be valid
/// - `port` must be a valid null-terminated C string
/// - `data` must point to at least `size` bytes
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_graph_update(
    graph: *mut XdnaCtrlGraph,
    port: *const c_char,
    data: *const u8,
    size: u64,
) -> XdnaCtrlResult {
    call("xdna_ctrl_graph_update", || {
        let graph = handle_mut(graph, "graph")?;
        let port = c_str(port, "port")?;
        if data.is_null() && size > 0 {
            return Err(FfiError::new(XdnaCtrlResult::NullPointer, "RTP data is null"));
        }
        let bytes = if size == 0 { &[][..] } else { slice::from_raw_parts(data, size as usize) };
        Ok(graph.graph.update_rtp(port, bytes)?)
    })
}

/// Read a runtime parameter into `data`.
///
/// # Safety
/// - `graph` must be valid
/// - `port` must be a valid null-terminated C string
/// - `data` must point to at least `size` writable bytes
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_graph_read(
    graph: *mut XdnaCtrlGraph,
    port: *const c_char,
    data: *mut u8,
    size: u64,
) -> XdnaCtrlResult {
    call("xdna_ctrl_graph_read", || {
        let graph = handle_mut(graph, "graph")?;
        let port = c_str(port, "port")?;
        if data.is_null() && size > 0 {
            return Err(FfiError::new(XdnaCtrlResult::NullPointer, "RTP output is null"));
        }
        let out = if size == 0 { &mut [][..] } else { slice::from_raw_parts_mut(data, size as usize) };
        Ok(graph.graph.read_rtp(port, out)?)
    })
}

// ============================================================================
// Profiling
// ============================================================================

/// Start a profiling measurement.
///
/// `option`: 0 running-to-idle cycles, 1 start-to-bytes-transferred cycles
/// (`value` = byte count), 2 start difference cycles (needs `port2`),
/// 3 running event count.
///
/// # Safety
/// - `device` must be valid
/// - `port1` must be a valid null-terminated C string; `port2` too, or null
/// - `profile_out` must be a valid pointer; it receives a handle that must
///   be freed with `xdna_ctrl_profile_stop`
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_profile_start(
    device: *mut XdnaCtrlDevice,
    option: u32,
    port1: *const c_char,
    port2: *const c_char,
    value: u32,
    profile_out: *mut *mut XdnaCtrlProfile,
) -> XdnaCtrlResult {
    call("xdna_ctrl_profile_start", || {
        let device = handle_mut(device, "device")?;
        let option = profiling_option(option)?;
        let port1 = c_str(port1, "port1")?;
        let port2 = if port2.is_null() { None } else { Some(c_str(port2, "port2")?) };
        let out = out_ptr(profile_out, "profile")?;

        let session = ProfilingSession::new(device.manager.clone());
        let handle = session.start(option, port1, port2, value)?;
        *out = Box::into_raw(Box::new(XdnaCtrlProfile { session, handle }));
        Ok(())
    })
}

/// Read the current measurement.
///
/// # Safety
/// - `profile` must be valid
/// - `value_out` must be a valid pointer
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_profile_read(profile: *mut XdnaCtrlProfile, value_out: *mut i64) -> XdnaCtrlResult {
    call("xdna_ctrl_profile_read", || {
        let profile = handle_mut(profile, "profile")?;
        let out = out_ptr(value_out, "value")?;
        *out = profile.session.read(&profile.handle)?;
        Ok(())
    })
}

/// Release every resource of a measurement and free the handle.
///
/// # Safety
/// `profile` must be a handle returned by `xdna_ctrl_profile_start`, or null.
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_profile_stop(profile: *mut XdnaCtrlProfile) -> XdnaCtrlResult {
    if profile.is_null() {
        return XdnaCtrlResult::Success;
    }
    let profile = Box::from_raw(profile);
    call("xdna_ctrl_profile_stop", move || {
        let XdnaCtrlProfile { session, handle } = *profile;
        Ok(session.stop(handle)?)
    })
}

// ============================================================================
// Diagnostics
// ============================================================================

/// Copy the last error message of the calling thread into `buffer`.
///
/// Returns the full message length in bytes (excluding the terminator);
/// the copy is truncated to `buffer_size - 1` bytes.
///
/// # Safety
/// `buffer` must point to at least `buffer_size` bytes, or be null.
#[no_mangle]
pub unsafe extern "C" fn xdna_ctrl_last_error(buffer: *mut c_char, buffer_size: u64) -> u64 {
    LAST_ERROR.with(|e| {
        let msg = e.borrow();
        if !buffer.is_null() && buffer_size > 0 {
            let n = msg.len().min(buffer_size as usize - 1);
            let out = slice::from_raw_parts_mut(buffer as *mut u8, n + 1);
            out[..n].copy_from_slice(&msg.as_bytes()[..n]);
            out[n] = 0;
        }
        msg.len() as u64
    })
}

/// Get version information.
#[no_mangle]
pub extern "C" fn xdna_ctrl_version() -> u32 {
    // Version 0.1.0 = 0x000100
    0x000100
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;
    use std::ptr;

    const METADATA: &str = r#"
[device]
generation = "aie-ml"
num_cols = 5
num_rows = 6
reserved_rows = 1
col_shift = 25
row_shift = 20

[[graph]]
id = 0
name = "gr"
cores = [{ col = 0, row = 0, iter_mem_col = 0, iter_mem_row = 0, iter_mem_addr = 0x4004 }]

[[gmio]]
id = 0
name = "in"
direction = "host-to-array"
shim_col = 1
channel = 2
stream_id = 3

[[plio]]
id = 0
name = "out"
direction = "array-to-host"
shim_col = 1
stream_id = 0
"#;

    fn create_device(tag: &str) -> *mut XdnaCtrlDevice {
        let path = std::env::temp_dir().join(format!("xdna-ctrl-ffi-{}-{}.toml", tag, std::process::id()));
        std::fs::write(&path, METADATA).unwrap();
        let c_path = CString::new(path.to_str().unwrap()).unwrap();
        let mut device = ptr::null_mut();
        let rc = unsafe { xdna_ctrl_device_create(c_path.as_ptr(), &mut device) };
        std::fs::remove_file(&path).unwrap();
        assert_eq!(rc, XdnaCtrlResult::Success);
        assert!(!device.is_null());
        device
    }

    fn last_error() -> String {
        let mut buf = [0 as c_char; 256];
        let len = unsafe { xdna_ctrl_last_error(buf.as_mut_ptr(), buf.len() as u64) };
        let msg = unsafe { CStr::from_ptr(buf.as_ptr()) }.to_str().unwrap().to_string();
        assert_eq!(msg.len() as u64, len.min(255));
        msg
    }

    #[test]
    fn test_graph_lifecycle() {
        let device = create_device("graph");
        let name = CString::new("gr").unwrap();
        let mut graph = ptr::null_mut();
        unsafe {
            assert_eq!(xdna_ctrl_device_set_core_autocomplete(device, 3), XdnaCtrlResult::Success);
            assert_eq!(xdna_ctrl_graph_open(device, name.as_ptr(), false, &mut graph), XdnaCtrlResult::Success);
            assert_eq!(xdna_ctrl_graph_status(graph), 0);

            assert_eq!(xdna_ctrl_graph_run(graph, 2), XdnaCtrlResult::Success);
            assert_eq!(xdna_ctrl_graph_status(graph), 1);
            assert_eq!(xdna_ctrl_graph_run(graph, 2), XdnaCtrlResult::StateConflict);
            assert!(last_error().contains("gr"));

            assert_eq!(xdna_ctrl_graph_wait(graph, -1), XdnaCtrlResult::Success);
            assert_eq!(xdna_ctrl_graph_status(graph), 2);
            let mut ts = 0;
            assert_eq!(xdna_ctrl_graph_timestamp(graph, &mut ts), XdnaCtrlResult::Success);
            assert_eq!(xdna_ctrl_graph_end(graph), XdnaCtrlResult::Success);
            assert_eq!(xdna_ctrl_graph_status(graph), 4);
            assert_eq!(xdna_ctrl_graph_close(graph), XdnaCtrlResult::Success);
            xdna_ctrl_device_destroy(device);
        }
    }

    #[test]
    fn test_end_suspended_without_budget() {
        let device = create_device("suspended");
        let name = CString::new("gr").unwrap();
        let mut graph = ptr::null_mut();
        unsafe {
            assert_eq!(xdna_ctrl_graph_open(device, name.as_ptr(), false, &mut graph), XdnaCtrlResult::Success);
            assert_eq!(xdna_ctrl_graph_run(graph, 0), XdnaCtrlResult::Success);
            assert_eq!(xdna_ctrl_graph_suspend(graph), XdnaCtrlResult::Success);
            assert_eq!(xdna_ctrl_graph_status(graph), 3);

            assert_eq!(xdna_ctrl_graph_end(graph), XdnaCtrlResult::StateConflict);
            assert_eq!(xdna_ctrl_graph_end_cycles(graph, 0), XdnaCtrlResult::Success);
            assert_eq!(xdna_ctrl_graph_status(graph), 4);
            assert_eq!(xdna_ctrl_graph_close(graph), XdnaCtrlResult::Success);
            xdna_ctrl_device_destroy(device);
        }
    }

    #[test]
    fn test_error_codes() {
        let device = create_device("errors");
        let missing = CString::new("missing").unwrap();
        let mut graph = ptr::null_mut();
        unsafe {
            assert_eq!(xdna_ctrl_graph_open(device, missing.as_ptr(), false, &mut graph), XdnaCtrlResult::User);
            assert!(graph.is_null());
            assert!(last_error().contains("missing"));

            assert_eq!(xdna_ctrl_graph_run(ptr::null_mut(), 1), XdnaCtrlResult::InvalidHandle);
            assert_eq!(xdna_ctrl_graph_status(ptr::null()), -1);
            assert_eq!(xdna_ctrl_wait(device, ptr::null()), XdnaCtrlResult::NullPointer);

            let port = CString::new("in").unwrap();
            let rc = xdna_ctrl_sync(device, port.as_ptr(), 0x1000, 64, 1, 64, 0, true);
            assert_eq!(rc, XdnaCtrlResult::User);
            let rc = xdna_ctrl_sync(device, port.as_ptr(), 0x1000, 64, 7, 64, 0, true);
            assert_eq!(rc, XdnaCtrlResult::User);
            let rc = xdna_ctrl_sync(device, port.as_ptr(), 0x1000, 64, 0, 64, 0, false);
            assert_eq!(rc, XdnaCtrlResult::Success);
            xdna_ctrl_device_destroy(device);
        }
    }

    #[test]
    fn test_missing_metadata_file() {
        let path = CString::new("/nonexistent/xdna-ctrl.toml").unwrap();
        let mut device = ptr::null_mut();
        let rc = unsafe { xdna_ctrl_device_create(path.as_ptr(), &mut device) };
        assert_eq!(rc, XdnaCtrlResult::Config);
        assert!(device.is_null());
        assert!(last_error().contains("nonexistent"));
    }

    #[test]
    fn test_profiling() {
        let device = create_device("profile");
        let port = CString::new("in").unwrap();
        let other = CString::new("out").unwrap();
        let mut profile = ptr::null_mut();
        unsafe {
            let rc = xdna_ctrl_profile_start(device, 2, port.as_ptr(), ptr::null(), 0, &mut profile);
            assert_eq!(rc, XdnaCtrlResult::User);
            let rc = xdna_ctrl_profile_start(device, 9, port.as_ptr(), ptr::null(), 0, &mut profile);
            assert_eq!(rc, XdnaCtrlResult::User);

            let rc = xdna_ctrl_profile_start(device, 2, port.as_ptr(), other.as_ptr(), 0, &mut profile);
            assert_eq!(rc, XdnaCtrlResult::Success);
            let mut value = -1;
            assert_eq!(xdna_ctrl_profile_read(profile, &mut value), XdnaCtrlResult::Success);
            assert_eq!(value, 0);
            assert_eq!(xdna_ctrl_profile_stop(profile), XdnaCtrlResult::Success);
            xdna_ctrl_device_destroy(device);
        }
    }

    #[test]
    fn test_last_error_truncates() {
        set_last_error("abcdef".into());
        let mut buf = [0 as c_char; 4];
        let len = unsafe { xdna_ctrl_last_error(buf.as_mut_ptr(), 4) };
        assert_eq!(len, 6);
        assert_eq!(unsafe { CStr::from_ptr(buf.as_ptr()) }.to_bytes(), b"abc");
        assert_eq!(xdna_ctrl_version(), 0x000100);
    }
}
