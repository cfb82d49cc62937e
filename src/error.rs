use thiserror::Error;

/// Errors raised by the NAND adapter, the journal and the sector map.
///
/// `BadBlock` and `Ecc` come from the chip. `Recover` is internal to the
/// journal/map pair and never escapes a public map operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FtlError {
    #[error("block has gone bad")]
    BadBlock,
    #[error("uncorrectable ECC error")]
    Ecc,
    #[error("too many bad blocks")]
    TooBad,
    #[error("journal recovery is required")]
    Recover,
    #[error("journal is full")]
    JournalFull,
    #[error("sector not found")]
    NotFound,
    #[error("sector map is full")]
    MapFull,
    #[error("NAND transport failure")]
    Transport,
}

/// The closed set of errors reported to users of [`crate::Device`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DeviceError {
    #[error("sector {sector} is unreadable")]
    Unreadable { sector: u32 },
    #[error("device is full")]
    DeviceFull,
    #[error("hardware fault: {0}")]
    Hardware(FtlError),
    #[error("sector {sector} is out of range (capacity {capacity})")]
    OutOfRange { sector: u32, capacity: u32 },
    #[error("buffer is {len} bytes, expected {expected}")]
    BufferSize { len: usize, expected: usize },
    #[error("unsupported chip: manufacturer {manufacturer:#04x}, device {device:#06x}")]
    UnknownChip { manufacturer: u8, device: u16 },
    #[error("SPI transport failure")]
    Transport,
    #[error("device lock poisoned")]
    Poisoned,
}

impl DeviceError {
    /// Classify a map error raised while writing or maintaining the map.
    pub(crate) fn from_write(e: FtlError) -> Self {
        match e {
            FtlError::TooBad | FtlError::JournalFull | FtlError::MapFull => DeviceError::DeviceFull,
            FtlError::Transport => DeviceError::Transport,
            e => DeviceError::Hardware(e),
        }
    }

    /// Classify a map error raised while reading `sector`.
    pub(crate) fn from_read(e: FtlError, sector: u32) -> Self {
        match e {
            FtlError::Ecc => DeviceError::Unreadable { sector },
            FtlError::Transport => DeviceError::Transport,
            e => DeviceError::Hardware(e),
        }
    }
}
