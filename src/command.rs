// SPI NAND command opcodes and feature register addresses shared by the
// supported Winbond, Alliance and GigaDevice parts.

pub const SET_REGISTER: u8 = 0x1F;
pub const READ_REGISTER: u8 = 0x0F;
pub const WRITE_ENABLE: u8 = 0x06;
pub const READ_ID: u8 = 0x9F;

/// Latch a page into the chip's cache. 3 address bytes (row).
pub const PAGE_READ: u8 = 0x13;
/// Commit the cache to a page. 3 address bytes (row).
pub const PROGRAM_EXECUTE: u8 = 0x10;
/// Random data load into the cache. 2 address bytes (column).
pub const PROGRAM_LOAD: u8 = 0x84;
/// Stream out of the cache. 2 address bytes (column) and 8 dummy bits.
pub const READ_FAST: u8 = 0x0B;
/// Erase the block containing the given row. 3 address bytes.
pub const ERASE_BLOCK: u8 = 0xD8;

pub const REG_PROTECT: u8 = 0xA0;
pub const REG_CONFIG: u8 = 0xB0;
pub const REG_STATUS: u8 = 0xC0;

/// ECC enable bit of the configuration register.
pub const CONFIG_ECC_ENABLE: u8 = 1 << 4;
