// The NAND operations needed by the journal, built from SPI NAND
// commands. Chip status bits are turned into typed errors here and
// nowhere else.
//
// Spare area layout, relative to the end of the data area:
//   0..2  bad block indicator, first page of a block only (0xffff = good)
//   2..4  used marker (0xffff = never programmed since erase)

use std::fmt::Debug;

use log::{debug, error};

use crate::bytes::r16;
use crate::chip::ChipInfo;
use crate::delay::Delay;
use crate::error::FtlError;
use crate::nand::{Block, Nand, Page};
use crate::spi::{SpiBus, SpiNand};
use crate::status::{EccState, Status};

const MARKER_CLEAR: [u8; 2] = [0x00, 0x00];
const MARKER_ERASED: u16 = 0xFFFF;

pub struct SpiNandAdapter<B: SpiBus, D: Delay> {
    driver: SpiNand<B, D>,
    chip: ChipInfo,
    refresh: bool,
}

fn transport<E: Debug>(op: &str, e: E) -> FtlError {
    error!("spi nand: {} failed: {:?}", op, e);
    FtlError::Transport
}

impl<B: SpiBus, D: Delay> SpiNandAdapter<B, D> {
    pub fn new(driver: SpiNand<B, D>, chip: ChipInfo) -> Self {
        SpiNandAdapter { driver, chip, refresh: false }
    }

    pub fn release(self) -> B {
        self.driver.release()
    }

    fn first_page(&self, blk: Block) -> Page {
        blk << self.chip.log2_ppb
    }

    fn spare_column(&self, offset: usize) -> u16 {
        (self.chip.page_size() + offset) as u16
    }

    fn read_page_and_wait(&mut self, page: Page) -> Result<Status, FtlError> {
        self.driver.read_page(page).map_err(|e| transport("page read", e))?;
        self.driver
            .wait_for_ready(self.chip.timing.read_page_us)
            .map_err(|e| transport("page read", e))
    }

    fn read_marker(&mut self, page: Page, offset: usize) -> Result<u16, FtlError> {
        let mut marker = [0u8; 2];
        self.read_page_and_wait(page)?;
        let column = self.spare_column(offset);
        self.driver.read(column, &mut marker).map_err(|e| transport("spare read", e))?;
        Ok(r16(&marker))
    }

    fn execute_and_check(&mut self, page: Page) -> Result<(), FtlError> {
        self.driver.program_execute(page).map_err(|e| transport("program execute", e))?;
        let status = self
            .driver
            .wait_for_ready(self.chip.timing.program_page_us)
            .map_err(|e| transport("program execute", e))?;

        if status.program_failed() {
            debug!("spi nand: program failed on page {}", page);
            return Err(FtlError::BadBlock);
        }
        Ok(())
    }

    fn try_mark_bad(&mut self, blk: Block) -> Result<(), FtlError> {
        let page = self.first_page(blk);

        // The erase result doesn't matter; the marker is written either way.
        self.driver.write_enable().map_err(|e| transport("write enable", e))?;
        self.driver.erase_block(page).map_err(|e| transport("erase", e))?;
        self.driver
            .wait_for_ready(self.chip.timing.erase_block_us)
            .map_err(|e| transport("erase", e))?;

        // Stage a whole erased page so nothing left in the cache is
        // programmed back along with the marker.
        let page_size = self.chip.page_size();
        let mut image = vec![0xFFu8; page_size + self.chip.spare_size()];
        image[page_size..page_size + 2].copy_from_slice(&MARKER_CLEAR);

        self.driver.write_enable().map_err(|e| transport("write enable", e))?;
        self.driver.program_load(0, &image).map_err(|e| transport("program load", e))?;
        self.execute_and_check(page)
    }
}

impl<B: SpiBus, D: Delay> Nand for SpiNandAdapter<B, D> {
    fn log2_page_size(&self) -> u8 {
        self.chip.log2_page_size
    }

    fn log2_ppb(&self) -> u8 {
        self.chip.log2_ppb
    }

    fn num_blocks(&self) -> u32 {
        self.chip.num_blocks
    }

    fn is_bad(&mut self, blk: Block) -> bool {
        let page = self.first_page(blk);
        match self.read_marker(page, 0) {
            Ok(marker) => {
                if marker != MARKER_ERASED {
                    debug!("spi nand: block {} is marked bad ({:#06x})", blk, marker);
                }
                marker != MARKER_ERASED
            }
            Err(_) => true,
        }
    }

    fn mark_bad(&mut self, blk: Block) {
        debug!("spi nand: marking block {} bad", blk);
        if let Err(e) = self.try_mark_bad(blk) {
            error!("spi nand: could not mark block {} bad: {}", blk, e);
        }
    }

    fn erase(&mut self, blk: Block) -> Result<(), FtlError> {
        let page = self.first_page(blk);

        self.driver.write_enable().map_err(|e| transport("write enable", e))?;
        self.driver.erase_block(page).map_err(|e| transport("erase", e))?;
        let status = self
            .driver
            .wait_for_ready(self.chip.timing.erase_block_us)
            .map_err(|e| transport("erase", e))?;

        if status.erase_failed() {
            debug!("spi nand: erase failed on block {}", blk);
            return Err(FtlError::BadBlock);
        }
        Ok(())
    }

    fn prog(&mut self, page: Page, data: &[u8]) -> Result<(), FtlError> {
        // The cache has to be loaded from the target before it is
        // reprogrammed, so the spare area is left erased.
        self.read_page_and_wait(page)?;

        self.driver.write_enable().map_err(|e| transport("write enable", e))?;
        self.driver
            .program_load(0, &data[..self.chip.page_size()])
            .map_err(|e| transport("program load", e))?;
        let column = self.spare_column(2);
        self.driver.program_load(column, &MARKER_CLEAR).map_err(|e| transport("program load", e))?;

        self.execute_and_check(page)
    }

    fn is_free(&mut self, page: Page) -> bool {
        matches!(self.read_marker(page, 2), Ok(MARKER_ERASED))
    }

    fn read(&mut self, page: Page, offset: usize, length: usize, data: &mut [u8]) -> Result<(), FtlError> {
        let status = self.read_page_and_wait(page)?;

        match status.ecc_state() {
            EccState::Uncorrectable => {
                debug!("spi nand: uncorrectable ECC error on page {}", page);
                return Err(FtlError::Ecc);
            }
            EccState::Marginal => {
                debug!("spi nand: page {} is near the ECC limit", page);
                self.refresh = true;
            }
            EccState::Clean | EccState::Corrected => (),
        }

        self.driver
            .read(offset as u16, &mut data[..length])
            .map_err(|e| transport("read", e))
    }

    fn copy(&mut self, src: Page, dst: Page) -> Result<(), FtlError> {
        let status = self.read_page_and_wait(src)?;
        if status.ecc_state() == EccState::Uncorrectable {
            debug!("spi nand: uncorrectable ECC error on page {} during copy", src);
            return Err(FtlError::Ecc);
        }

        self.driver.write_enable().map_err(|e| transport("write enable", e))?;
        self.execute_and_check(dst)
    }

    fn take_refresh_hint(&mut self) -> bool {
        std::mem::take(&mut self.refresh)
    }
}
