// Chip identification: maps the READ ID response of the supported parts
// to their geometry and typical operation times.

use crate::error::DeviceError;

pub const MFR_ALLIANCE: u8 = 0x52;
pub const MFR_WINBOND: u8 = 0xEF;
pub const MFR_GIGADEVICE: u8 = 0xC8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vendor {
    Alliance,
    Winbond,
    GigaDevice,
}

/// Typical duration of each chip operation, in microseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timing {
    pub read_page_us: u32,
    pub program_page_us: u32,
    pub erase_block_us: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChipInfo {
    pub vendor: Vendor,
    pub device_id: u16,
    pub log2_page_size: u8,
    pub log2_ppb: u8,
    pub num_blocks: u32,
    pub timing: Timing,
}

const LOG2_PAGE_2K: u8 = 11;
const LOG2_PAGE_4K: u8 = 12;
const LOG2_PPB: u8 = 6;

impl ChipInfo {
    /// Identify a chip from its READ ID response: manufacturer id then
    /// two device id bytes. Winbond parts use both device bytes, the
    /// others only the first.
    pub fn identify(id: [u8; 3]) -> Result<Self, DeviceError> {
        let [mfr, d0, d1] = id;

        match mfr {
            MFR_WINBOND => {
                let device_id = u16::from_be_bytes([d0, d1]);
                let num_blocks = match device_id {
                    0xAA20 | 0xBA20 => 512,
                    0xAA21 | 0xBA21 | 0xBC21 => 1024,
                    _ => return Err(unknown(mfr, device_id)),
                };
                let timing = Timing { read_page_us: 10, program_page_us: 320, erase_block_us: 2500 };
                Ok(Self::new(Vendor::Winbond, device_id, LOG2_PAGE_2K, num_blocks, timing))
            }
            MFR_GIGADEVICE => {
                let num_blocks = match d0 {
                    0x51 | 0x41 | 0x31 | 0x21 => 1024,
                    0x52 | 0x42 | 0x32 | 0x22 => 2048,
                    0x55 | 0x45 | 0x35 | 0x25 => 4096,
                    _ => return Err(unknown(mfr, d0 as u16)),
                };
                let timing = Timing { read_page_us: 25, program_page_us: 380, erase_block_us: 3200 };
                Ok(Self::new(Vendor::GigaDevice, d0 as u16, LOG2_PAGE_2K, num_blocks, timing))
            }
            MFR_ALLIANCE => {
                let (log2_page_size, num_blocks) = match d0 {
                    0x25 => (LOG2_PAGE_2K, 1024),
                    0x2E | 0x8E => (LOG2_PAGE_2K, 2048),
                    0x2F | 0x8F => (LOG2_PAGE_2K, 4096),
                    0x2D | 0x8D => (LOG2_PAGE_4K, 4096),
                    _ => return Err(unknown(mfr, d0 as u16)),
                };
                let timing = Timing { read_page_us: 25, program_page_us: 400, erase_block_us: 3000 };
                Ok(Self::new(Vendor::Alliance, d0 as u16, log2_page_size, num_blocks, timing))
            }
            _ => Err(unknown(mfr, u16::from_be_bytes([d0, d1]))),
        }
    }

    fn new(vendor: Vendor, device_id: u16, log2_page_size: u8, num_blocks: u32, timing: Timing) -> Self {
        ChipInfo { vendor, device_id, log2_page_size, log2_ppb: LOG2_PPB, num_blocks, timing }
    }

    pub fn page_size(&self) -> usize {
        1 << self.log2_page_size
    }

    pub fn pages_per_block(&self) -> u32 {
        1 << self.log2_ppb
    }

    pub fn page_count(&self) -> u32 {
        self.num_blocks << self.log2_ppb
    }

    /// Size of the spare area following the data area of each page.
    pub fn spare_size(&self) -> usize {
        self.page_size() / 32
    }
}

fn unknown(manufacturer: u8, device: u16) -> DeviceError {
    DeviceError::UnknownChip { manufacturer, device }
}
