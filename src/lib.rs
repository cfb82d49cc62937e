//! A flash translation layer for SPI NAND chips.
//!
//! [`Device`] presents a chip as a flat array of page sized sectors.
//! Underneath, a [`SectorMap`] keeps a log structured journal of sector
//! writes with a radix tree threaded through the per-page metadata,
//! handling wear leveling, garbage collection, bad blocks and recovery
//! after power loss. The map only talks to the chip through the
//! [`Nand`] trait, implemented for SPI NAND parts by
//! [`adapter::SpiNandAdapter`].

mod bytes;
pub mod adapter;
pub mod chip;
pub mod command;
pub mod config;
pub mod delay;
pub mod device;
pub mod emul;
pub mod error;
pub mod journal;
pub mod map;
pub mod nand;
pub mod spi;
pub mod status;

pub use config::DeviceConfig;
pub use device::Device;
pub use error::{DeviceError, FtlError};
pub use map::{Sector, SectorMap};
pub use nand::{Block, Nand, Page};
