//! Device geometry and the tile control boundary.
//!
//! This module provides:
//! - Hardware generations and their lock models ([`AieGeneration`])
//! - Partition geometry and tile location translation ([`DeviceConfig`])
//! - The primitive hardware interface every controller bottoms out in
//!   ([`TileControl`])
//! - An in-process emulated array implementing that interface ([`TileArray`])
//!
//! # Row Offsets
//!
//! Compiled-program metadata names tiles relative to their tile class.
//! The absolute row depends on how many memory-tile rows the partition
//! reserves:
//!
//! ```text
//!                      relative row      absolute row
//!   compute tile   ->  r             ->  r + reserved_rows + 1
//!   memory tile    ->  r             ->  r + 1
//!   shim tile      ->  r             ->  r
//!
//!     Col 0    Col 1    Col 2    Col 3
//!   +--------+--------+--------+--------+
//! 3 |Compute |Compute |Compute |Compute |  <- relative compute row 1
//!   +--------+--------+--------+--------+
//! 2 |Compute |Compute |Compute |Compute |  <- relative compute row 0
//!   +--------+--------+--------+--------+
//! 1 |MemTile |MemTile |MemTile |MemTile |  <- reserved_rows = 1
//!   +--------+--------+--------+--------+
//! 0 | Shim   | Shim   | Shim   | Shim   |
//!   +--------+--------+--------+--------+
//! ```
//!
//! [`TileLoc`] values are always absolute and can only be produced by
//! [`DeviceConfig::locate`] (or explicitly with [`TileLoc::absolute`]), so
//! the offset is applied exactly once on the way to the hardware.
//!
//! # Example
//!
//! ```
//! use xdna_ctrl::device::{DeviceConfig, TileKind};
//!
//! let device = DeviceConfig::npu1();
//! let core = device.locate(TileKind::Compute, 1, 0).unwrap();
//! assert_eq!((core.col(), core.row()), (1, 2));
//! ```

pub mod limits;
pub mod control;
pub mod resources;
pub mod tile;
pub mod array;

pub use control::{
    BdParams, BroadcastDirs, BroadcastSwitch, DmaDirection, DriverResult, Event, ModuleKind,
    PortRole, PortSide, TileControl, LOCK_WITH_NO_VALUE,
};
pub use resources::{AcquiredResource, ResourcePool, TileResources};
pub use tile::{CoreState, Lock, LockResult, ShimChannel, Tile};
pub use array::{EmuStats, TileArray};

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{CtrlError, Result};

/// AI Engine hardware generation.
///
/// Generations differ in lock semantics: first-generation AIE locks are
/// binary (acquired flag plus a 0/1 value), AIE-ML locks are 6-bit
/// semaphores driven by signed deltas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AieGeneration {
    /// First generation AI Engine (Versal AI Core).
    Aie,
    /// AI Engine ML (Versal AI Edge, Phoenix/Strix NPUs).
    AieMl,
}

impl AieGeneration {
    /// True when locks are semaphores rather than binary locks.
    pub fn has_semaphore_locks(&self) -> bool {
        matches!(self, AieGeneration::AieMl)
    }
}

impl fmt::Display for AieGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AieGeneration::Aie => write!(f, "AIE"),
            AieGeneration::AieMl => write!(f, "AIE-ML"),
        }
    }
}

/// Tile class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TileKind {
    /// Array edge interface tile (DMA to host memory, PL streams).
    Shim,
    /// Shared memory tile (AIE-ML only).
    MemTile,
    /// Core tile with program and data memory.
    Compute,
}

/// Absolute tile coordinate as understood by [`TileControl`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TileLoc {
    col: u8,
    row: u8,
}

impl TileLoc {
    /// Build an absolute location directly.
    ///
    /// Metadata coordinates must go through [`DeviceConfig::locate`]
    /// instead; this is for backends and array-wide addressing.
    #[inline]
    pub const fn absolute(col: u8, row: u8) -> Self {
        Self { col, row }
    }

    #[inline]
    pub fn col(&self) -> u8 {
        self.col
    }

    #[inline]
    pub fn row(&self) -> u8 {
        self.row
    }
}

impl fmt::Display for TileLoc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tile({},{})", self.col, self.row)
    }
}

/// Partition geometry.
///
/// Created once, wrapped in an `Arc` and handed to every controller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Hardware generation.
    pub generation: AieGeneration,
    /// Base address of the array in the host address map.
    #[serde(default)]
    pub base_address: u64,
    /// Number of columns in the partition.
    pub num_cols: u8,
    /// Number of rows, shim row included.
    pub num_rows: u8,
    /// Rows between the shim row and the first compute row.
    #[serde(default)]
    pub reserved_rows: u8,
    /// Bit position of the column in a tile address.
    pub col_shift: u8,
    /// Bit position of the row in a tile address.
    pub row_shift: u8,
}

impl DeviceConfig {
    /// Versal AI Core (VCK190): 50 columns of first-generation tiles.
    pub fn vck190() -> Self {
        Self {
            generation: AieGeneration::Aie,
            base_address: 0x200_0000_0000,
            num_cols: 50,
            num_rows: 9,
            reserved_rows: 0,
            col_shift: 23,
            row_shift: 18,
        }
    }

    /// Phoenix NPU: 5 columns, one memory-tile row, four compute rows.
    pub fn npu1() -> Self {
        Self {
            generation: AieGeneration::AieMl,
            base_address: 0,
            num_cols: 5,
            num_rows: 6,
            reserved_rows: 1,
            col_shift: 25,
            row_shift: 20,
        }
    }

    /// Check internal consistency.
    pub fn validate(&self) -> Result<()> {
        if self.num_cols == 0 {
            return Err(CtrlError::Config("device has no columns".into()));
        }
        if self.num_rows < self.reserved_rows + 2 {
            return Err(CtrlError::Config(format!(
                "{} rows cannot hold a shim row, {} reserved rows and a compute row",
                self.num_rows, self.reserved_rows
            )));
        }
        if self.generation == AieGeneration::Aie && self.reserved_rows != 0 {
            return Err(CtrlError::Config("AIE devices have no memory-tile rows".into()));
        }
        Ok(())
    }

    /// Row offset applied to a relative coordinate of the given class.
    #[inline]
    pub fn row_offset(&self, kind: TileKind) -> u8 {
        match kind {
            TileKind::Compute => self.reserved_rows + 1,
            TileKind::MemTile => 1,
            TileKind::Shim => 0,
        }
    }

    /// Translate a relative metadata coordinate into an absolute tile.
    pub fn locate(&self, kind: TileKind, col: u8, row: u8) -> Result<TileLoc> {
        let abs_row = row
            .checked_add(self.row_offset(kind))
            .filter(|r| *r < self.num_rows)
            .ok_or_else(|| {
                CtrlError::Config(format!("{:?} row {} is outside the partition", kind, row))
            })?;
        if col >= self.num_cols {
            return Err(CtrlError::Config(format!(
                "column {} is outside the {}-column partition",
                col, self.num_cols
            )));
        }
        Ok(TileLoc::absolute(col, abs_row))
    }

    /// Shim tile of a column.
    #[inline]
    pub fn shim(&self, col: u8) -> Result<TileLoc> {
        self.locate(TileKind::Shim, col, 0)
    }

    /// Class of an absolute tile.
    pub fn tile_kind(&self, loc: TileLoc) -> TileKind {
        if loc.row == 0 {
            TileKind::Shim
        } else if loc.row <= self.reserved_rows {
            TileKind::MemTile
        } else {
            TileKind::Compute
        }
    }

    /// True if the location lies inside the partition.
    #[inline]
    pub fn contains(&self, loc: TileLoc) -> bool {
        loc.col < self.num_cols && loc.row < self.num_rows
    }

    /// Host-visible address of a register or memory offset in a tile.
    pub fn tile_address(&self, loc: TileLoc, offset: u64) -> u64 {
        self.base_address
            + ((loc.col as u64) << self.col_shift)
            + ((loc.row as u64) << self.row_shift)
            + offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_row_offsets_npu1() {
        let device = DeviceConfig::npu1();
        assert_eq!(device.row_offset(TileKind::Compute), 2);
        assert_eq!(device.row_offset(TileKind::MemTile), 1);
        assert_eq!(device.row_offset(TileKind::Shim), 0);

        let core = device.locate(TileKind::Compute, 3, 1).unwrap();
        assert_eq!(core, TileLoc::absolute(3, 3));
        assert_eq!(device.tile_kind(core), TileKind::Compute);
        assert_eq!(device.tile_kind(TileLoc::absolute(0, 1)), TileKind::MemTile);
        assert_eq!(device.tile_kind(device.shim(2).unwrap()), TileKind::Shim);
    }

    #[test]
    fn test_row_offsets_vck190() {
        let device = DeviceConfig::vck190();
        let core = device.locate(TileKind::Compute, 24, 0).unwrap();
        assert_eq!(core, TileLoc::absolute(24, 1));
    }

    #[test]
    fn test_locate_out_of_range() {
        let device = DeviceConfig::npu1();
        assert!(device.locate(TileKind::Compute, 0, 4).is_err());
        assert!(device.locate(TileKind::Compute, 5, 0).is_err());
        assert!(device.locate(TileKind::Compute, 0, 255).is_err());
    }

    #[test]
    fn test_tile_address() {
        let device = DeviceConfig::npu1();
        let addr = device.tile_address(TileLoc::absolute(1, 2), 0x32000);
        assert_eq!(addr, 0x0223_2000);

        let versal = DeviceConfig::vck190();
        let addr = versal.tile_address(TileLoc::absolute(1, 1), 0);
        assert_eq!(addr, 0x200_0000_0000 + (1 << 23) + (1 << 18));
    }

    #[test]
    fn test_validate() {
        assert!(DeviceConfig::npu1().validate().is_ok());
        assert!(DeviceConfig::vck190().validate().is_ok());

        let mut bad = DeviceConfig::vck190();
        bad.reserved_rows = 1;
        assert!(bad.validate().is_err());

        let mut tiny = DeviceConfig::npu1();
        tiny.num_rows = 2;
        assert!(tiny.validate().is_err());
    }

    #[test]
    fn test_generation_from_toml() {
        #[derive(Deserialize)]
        struct Wrap {
            generation: AieGeneration,
        }
        let w: Wrap = toml::from_str("generation = \"aie-ml\"").unwrap();
        assert_eq!(w.generation, AieGeneration::AieMl);
        assert!(w.generation.has_semaphore_locks());
        assert_eq!(AieGeneration::Aie.to_string(), "AIE");
    }
}
