// A SPI NAND chip emulated in memory, speaking the same command set as
// the real parts. Used by the tests and for running on a host.
//
// Flash contents are kept sparsely: a page that was never programmed
// since its block was erased has no entry and reads as 0xff.

use fnv::{FnvHashMap, FnvHashSet};
use log::debug;
use thiserror::Error;

use crate::chip::ChipInfo;
use crate::command::*;
use crate::error::DeviceError;
use crate::spi::{SpiBus, Transaction};
use crate::status::{EccState, Status};

/// Protect register value at power up: all blocks locked.
const PROTECT_LOCKED: u8 = 0x38;

/// READ ID response of a 64 MiB Winbond part: 512 blocks of 64 pages
/// of 2 KiB.
pub const WINBOND_512: [u8; 3] = [0xEF, 0xAA, 0x20];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum EmulError {
    #[error("chip has no power")]
    PowerLoss,
    #[error("unsupported command {0:#04x}")]
    UnknownCommand(u8),
    #[error("transfer out of range of the page cache")]
    OutOfRange,
}

#[derive(Debug, Default, Clone)]
pub struct EmulStats {
    pub programs: u64,
    pub erases: u64,
    pub reads: u64,
    pub program_failures: u64,
    pub erase_failures: u64,
    block_programs: FnvHashMap<u32, u64>,
}

impl EmulStats {
    /// Number of page programs issued to the given block.
    pub fn block_programs(&self, blk: u32) -> u64 {
        self.block_programs.get(&blk).copied().unwrap_or(0)
    }
}

pub struct EmulatedNand {
    id: [u8; 3],
    chip: ChipInfo,
    pages: FnvHashMap<u32, Vec<u8>>,
    cache: Vec<u8>,
    protect: u8,
    config: u8,
    status: Status,

    failed_blocks: FnvHashSet<u32>,
    ecc_pages: FnvHashMap<u32, EccState>,
    busy_reads: u32,
    busy_left: u32,

    /// Program/erase operations left before power is cut.
    power_budget: Option<u64>,
    powered: bool,

    stats: EmulStats,
}

impl EmulatedNand {
    /// An erased chip answering READ ID with `id`.
    pub fn new(id: [u8; 3]) -> Result<Self, DeviceError> {
        let chip = ChipInfo::identify(id)?;
        let raw_size = chip.page_size() + chip.spare_size();

        Ok(EmulatedNand {
            id,
            chip,
            pages: FnvHashMap::default(),
            cache: vec![0xFF; raw_size],
            protect: PROTECT_LOCKED,
            config: 0,
            status: Status::default(),
            failed_blocks: FnvHashSet::default(),
            ecc_pages: FnvHashMap::default(),
            busy_reads: 0,
            busy_left: 0,
            power_budget: None,
            powered: true,
            stats: EmulStats::default(),
        })
    }

    pub fn chip(&self) -> &ChipInfo {
        &self.chip
    }

    /// Erase and program on this block report failure from now on.
    pub fn fail_block(&mut self, blk: u32) {
        self.failed_blocks.insert(blk);
    }

    /// Report the given ECC outcome whenever `page` is read.
    pub fn set_ecc(&mut self, page: u32, state: EccState) {
        if state == EccState::Clean {
            self.ecc_pages.remove(&page);
        } else {
            self.ecc_pages.insert(page, state);
        }
    }

    /// Number of busy status reads reported after each operation.
    pub fn set_busy_reads(&mut self, n: u32) {
        self.busy_reads = n;
    }

    /// Cut power during the program or erase after the next `ops`. The
    /// interrupted program is torn: only every other byte reaches the
    /// page.
    pub fn cut_power_after(&mut self, ops: u64) {
        self.power_budget = Some(ops);
    }

    /// Power the chip back up. Volatile state returns to its reset values.
    pub fn restore_power(&mut self) {
        self.powered = true;
        self.power_budget = None;
        self.protect = PROTECT_LOCKED;
        self.config = 0;
        self.status = Status::default();
        self.busy_left = 0;
        self.cache.fill(0xFF);
    }

    pub fn is_powered(&self) -> bool {
        self.powered
    }

    pub fn stats(&self) -> &EmulStats {
        &self.stats
    }

    /// Raw page contents including the spare area, if programmed.
    pub fn page(&self, page: u32) -> Option<&[u8]> {
        self.pages.get(&page).map(|p| &p[..])
    }

    pub fn protect(&self) -> u8 {
        self.protect
    }

    pub fn config(&self) -> u8 {
        self.config
    }

    fn block_of(&self, page: u32) -> u32 {
        page >> self.chip.log2_ppb
    }

    fn begin_op(&mut self) {
        self.busy_left = self.busy_reads;
        self.status.set_erase_failed(false);
        self.status.set_program_failed(false);
    }

    // Consume one unit of the power budget. False if power is cut now.
    fn spend_power(&mut self) -> bool {
        match self.power_budget {
            Some(0) => {
                self.powered = false;
                false
            }
            Some(n) => {
                self.power_budget = Some(n - 1);
                true
            }
            None => true,
        }
    }

    fn page_read(&mut self, page: u32) {
        self.begin_op();
        self.stats.reads += 1;
        match self.pages.get(&page) {
            Some(data) => self.cache.copy_from_slice(data),
            None => self.cache.fill(0xFF),
        }

        let ecc = match self.ecc_pages.get(&page) {
            Some(EccState::Corrected) => 0b01,
            Some(EccState::Uncorrectable) => 0b10,
            Some(EccState::Marginal) => 0b11,
            _ => 0b00,
        };
        self.status.set_ecc(ecc);
    }

    fn program_execute(&mut self, page: u32) -> Result<(), EmulError> {
        self.begin_op();
        let write_enabled = self.status.write_enabled();
        self.status.set_write_enabled(false);

        if !write_enabled || self.protect != 0 {
            self.status.set_program_failed(true);
            return Ok(());
        }

        let blk = self.block_of(page);
        let raw_size = self.cache.len();
        let torn = !self.spend_power();
        let step = if torn { 2 } else { 1 };

        let cell = self.pages.entry(page).or_insert_with(|| vec![0xFF; raw_size]);
        for (c, d) in cell.iter_mut().zip(&self.cache).step_by(step) {
            *c &= *d;
        }

        self.stats.programs += 1;
        *self.stats.block_programs.entry(blk).or_insert(0) += 1;

        if torn {
            debug!("emulated nand: power cut while programming page {}", page);
            return Err(EmulError::PowerLoss);
        }
        if self.failed_blocks.contains(&blk) {
            self.stats.program_failures += 1;
            self.status.set_program_failed(true);
        }
        Ok(())
    }

    fn erase_block(&mut self, page: u32) -> Result<(), EmulError> {
        self.begin_op();
        let write_enabled = self.status.write_enabled();
        self.status.set_write_enabled(false);

        let blk = self.block_of(page);
        if !write_enabled || self.protect != 0 || self.failed_blocks.contains(&blk) {
            self.stats.erase_failures += 1;
            self.status.set_erase_failed(true);
            return Ok(());
        }

        if !self.spend_power() {
            debug!("emulated nand: power cut while erasing block {}", blk);
            return Err(EmulError::PowerLoss);
        }

        let first = blk << self.chip.log2_ppb;
        for p in first..first + self.chip.pages_per_block() {
            self.pages.remove(&p);
        }
        self.stats.erases += 1;
        Ok(())
    }

    fn read_register(&mut self, reg: u8) -> u8 {
        match reg {
            REG_PROTECT => self.protect,
            REG_CONFIG => self.config,
            REG_STATUS if self.busy_left > 0 => {
                self.busy_left -= 1;
                u8::from(self.status) | 0x01
            }
            REG_STATUS => u8::from(self.status),
            _ => 0,
        }
    }

    fn cache_range(&self, column: u32, len: usize) -> Result<std::ops::Range<usize>, EmulError> {
        let start = column as usize;
        if start + len > self.cache.len() {
            return Err(EmulError::OutOfRange);
        }
        Ok(start..start + len)
    }
}

impl SpiBus for EmulatedNand {
    type Error = EmulError;

    fn transfer(&mut self, t: &mut Transaction) -> Result<(), EmulError> {
        if !self.powered {
            return Err(EmulError::PowerLoss);
        }

        match t.command {
            WRITE_ENABLE => self.status.set_write_enabled(true),
            READ_ID => {
                let n = t.miso.len().min(3);
                t.miso[..n].copy_from_slice(&self.id[..n]);
            }
            READ_REGISTER => {
                let v = self.read_register(t.address as u8);
                if let Some(b) = t.miso.first_mut() {
                    *b = v;
                }
            }
            SET_REGISTER => {
                let v = t.mosi.first().copied().unwrap_or(0);
                match t.address as u8 {
                    REG_PROTECT => self.protect = v,
                    REG_CONFIG => self.config = v,
                    _ => (),
                }
            }
            PAGE_READ => self.page_read(t.address),
            READ_FAST => {
                let range = self.cache_range(t.address, t.miso.len())?;
                t.miso.copy_from_slice(&self.cache[range]);
            }
            PROGRAM_LOAD => {
                let range = self.cache_range(t.address, t.mosi.len())?;
                self.cache[range].copy_from_slice(t.mosi);
            }
            PROGRAM_EXECUTE => self.program_execute(t.address)?,
            ERASE_BLOCK => self.erase_block(t.address)?,
            c => return Err(EmulError::UnknownCommand(c)),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::SpiNandAdapter;
    use crate::delay::NoDelay;
    use crate::error::FtlError;
    use crate::nand::Nand;
    use crate::spi::SpiNand;

    fn adapter(mut nand: EmulatedNand) -> SpiNandAdapter<EmulatedNand, NoDelay> {
        let chip = *nand.chip();
        nand.protect = 0;
        SpiNandAdapter::new(SpiNand::new(nand, NoDelay, 1000), chip)
    }

    fn page_of(byte: u8) -> Vec<u8> {
        vec![byte; 2048]
    }

    #[test]
    fn program_ands_and_erase_clears() {
        let mut a = adapter(EmulatedNand::new(WINBOND_512).unwrap());
        let mut buf = vec![0u8; 2048];

        assert!(a.is_free(5));
        a.prog(5, &page_of(0xF0)).unwrap();
        assert!(!a.is_free(5));
        assert!(a.is_free(6));

        a.read(5, 0, 2048, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xF0));

        a.erase(0).unwrap();
        assert!(a.is_free(5));
        a.read(5, 0, 2048, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0xFF));
    }

    #[test]
    fn partial_read() {
        let mut a = adapter(EmulatedNand::new(WINBOND_512).unwrap());
        let mut data = page_of(0);
        data[100..104].copy_from_slice(&[1, 2, 3, 4]);
        a.prog(64, &data).unwrap();

        let mut buf = [0xEEu8; 8];
        a.read(64, 100, 4, &mut buf).unwrap();
        assert_eq!(buf, [1, 2, 3, 4, 0xEE, 0xEE, 0xEE, 0xEE]);
    }

    #[test]
    fn write_protect_blocks_programs() {
        let nand = EmulatedNand::new(WINBOND_512).unwrap();
        let chip = *nand.chip();
        let mut a = SpiNandAdapter::new(SpiNand::new(nand, NoDelay, 1000), chip);

        assert_eq!(a.prog(0, &page_of(0)), Err(FtlError::BadBlock));
        assert_eq!(a.erase(0), Err(FtlError::BadBlock));
    }

    #[test]
    fn bad_block_marking() {
        let mut nand = EmulatedNand::new(WINBOND_512).unwrap();
        nand.fail_block(3);
        let mut a = adapter(nand);

        assert!(!a.is_bad(3));
        assert_eq!(a.erase(3), Err(FtlError::BadBlock));
        assert_eq!(a.prog(3 << 6, &page_of(0)), Err(FtlError::BadBlock));

        a.mark_bad(3);
        assert!(a.is_bad(3));
        assert!(!a.is_bad(2));

        // A healthy block can be marked bad too.
        a.prog(4 << 6, &page_of(0x11)).unwrap();
        a.mark_bad(4);
        assert!(a.is_bad(4));
    }

    #[test]
    fn marking_bad_leaves_no_data_behind() {
        let mut a = adapter(EmulatedNand::new(WINBOND_512).unwrap());
        a.prog(4 << 6, &page_of(0x11)).unwrap();
        a.prog((4 << 6) + 1, &page_of(0x22)).unwrap();
        a.mark_bad(4);
        assert!(a.is_bad(4));

        let bus = a.release();
        let first = bus.page(4 << 6).expect("marker page");
        assert!(first[..2048].iter().all(|&b| b == 0xFF));
        assert_eq!(&first[2048..2050], &[0, 0]);
        assert_eq!(&first[2050..2052], &[0xFF, 0xFF]);
        assert_eq!(bus.page((4 << 6) + 1), None);
    }

    #[test]
    fn ecc_outcomes() {
        let mut nand = EmulatedNand::new(WINBOND_512).unwrap();
        nand.set_ecc(10, EccState::Uncorrectable);
        nand.set_ecc(11, EccState::Marginal);
        nand.set_ecc(12, EccState::Corrected);
        let mut a = adapter(nand);
        let mut buf = [0x55u8; 16];

        assert_eq!(a.read(10, 0, 16, &mut buf), Err(FtlError::Ecc));
        assert_eq!(buf, [0x55u8; 16]);
        assert_eq!(a.copy(10, 20), Err(FtlError::Ecc));
        assert!(a.is_free(20));

        a.read(12, 0, 16, &mut buf).unwrap();
        assert!(!a.take_refresh_hint());

        a.read(11, 0, 16, &mut buf).unwrap();
        assert!(a.take_refresh_hint());
        assert!(!a.take_refresh_hint());
    }

    #[test]
    fn internal_copy() {
        let mut a = adapter(EmulatedNand::new(WINBOND_512).unwrap());
        a.prog(1, &page_of(0x3C)).unwrap();
        a.copy(1, 70).unwrap();

        let mut buf = vec![0u8; 2048];
        a.read(70, 0, 2048, &mut buf).unwrap();
        assert!(buf.iter().all(|&b| b == 0x3C));
        assert!(!a.is_free(70));
    }

    #[test]
    fn busy_polling_and_stats() {
        let mut nand = EmulatedNand::new(WINBOND_512).unwrap();
        nand.set_busy_reads(4);
        let mut a = adapter(nand);

        a.prog(130, &page_of(0)).unwrap();
        a.prog(131, &page_of(0)).unwrap();
        a.erase(3).unwrap();

        let bus = a.release();
        assert_eq!(bus.stats().programs, 2);
        assert_eq!(bus.stats().erases, 1);
        assert_eq!(bus.stats().block_programs(2), 2);
        assert_eq!(bus.stats().block_programs(3), 0);
    }

    #[test]
    fn power_cut_tears_program() {
        let mut nand = EmulatedNand::new(WINBOND_512).unwrap();
        nand.cut_power_after(1);
        let mut a = adapter(nand);

        a.prog(0, &page_of(0x00)).unwrap();
        assert_eq!(a.prog(1, &page_of(0x00)), Err(FtlError::Transport));
        assert!(a.is_bad(0)); // Nothing can be verified without power.

        let mut bus = a.release();
        assert!(!bus.is_powered());
        let torn = bus.page(1).unwrap();
        assert_eq!(&torn[..4], &[0x00, 0xFF, 0x00, 0xFF]);

        bus.restore_power();
        assert!(bus.is_powered());
        assert_eq!(bus.protect(), PROTECT_LOCKED);
    }

    #[test]
    fn unknown_command() {
        let mut nand = EmulatedNand::new(WINBOND_512).unwrap();
        assert_eq!(nand.transfer(&mut Transaction::command(0x42)), Err(EmulError::UnknownCommand(0x42)));
    }
}
