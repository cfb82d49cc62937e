// A simulated NAND chip implementing the `Nand` trait directly, with
// injectable bad blocks, delayed failures ("timebombs") and ECC errors.
#![allow(dead_code)]

use spi_nand_ftl::FtlError;
use spi_nand_ftl::nand::{Block, Nand, Page};

use rand::{Rng, RngCore, SeedableRng};
use rand::rngs::SmallRng;
use std::collections::HashSet;
use std::iter::zip;

pub const LOG2_PAGE_SIZE: u8 = 9;
pub const LOG2_PAGES_PER_BLOCK: u8 = 3;
const LOG2_BLOCK_SIZE: u8 = LOG2_PAGE_SIZE + LOG2_PAGES_PER_BLOCK;
pub const NUM_BLOCKS: usize = 113;

pub const PAGE_SIZE: usize = 1 << LOG2_PAGE_SIZE; // 512 bytes, enough for 3 user metadata.
const PAGES_PER_BLOCK: usize = 1 << LOG2_PAGES_PER_BLOCK; // 8 pages/block
const BLOCK_SIZE: usize = 1 << LOG2_BLOCK_SIZE; // 4096 bytes
const MEM_SIZE: usize = NUM_BLOCKS * BLOCK_SIZE; // 4096 * 113 = 462_848 bytes

const BLOCK_BAD_MARK: u8 = 0x01;
const BLOCK_FAILED: u8 = 0x02;
const BLOCK_BOTH: u8 = BLOCK_FAILED | BLOCK_BAD_MARK;

// Struct used to capture call counts.
#[derive(Default)]
pub struct SimStats {
    frozen: bool,
    pub is_bad: usize,
    pub mark_bad: usize,
    pub erase: usize,
    pub erase_fail: usize,
    pub is_erased: usize,
    pub prog: usize,
    pub prog_fail: usize,
    pub read: usize,
    pub read_bytes: usize,
    pub ecc_fail: usize,
    pub copy_fail: usize,
}

// Struct to keep track of blocks.
#[derive(Clone, Copy)]
struct BlockStatus {
    flags: u8,
    // Index of the next unprogrammed page.  0 means a fully erased
    // block, and  PAGES_PER_BLOCK is a fully programmed block.
    next_page: usize,
    // Timebomb counter: if non-zero, this is the number of
    // operations until permanent failure.
    timebomb: usize,
}

pub struct SimNand {
    // The simulated memory
    pages: Vec<u8>,
    // Keeps track of whether blocks are good.
    blocks: [BlockStatus; NUM_BLOCKS],
    // Pages which fail ECC when read.
    ecc_pages: HashSet<Page>,
    // Pages whose internal copy fails as if the destination went bad.
    copy_faults: HashSet<Page>,
    rng: SmallRng,
    // Keep track of statistics.
    pub stats: SimStats,
}

// Simulation controls, outside of the Nand trait.
impl SimNand {
    pub fn new() -> Self {
        Self::with_seed(0)
    }

    /// The seed drives the placement of injected bad blocks and timebombs.
    pub fn with_seed(seed: u64) -> Self {
        let block = BlockStatus {flags: 0, next_page: PAGES_PER_BLOCK, timebomb: 0};

        SimNand {
            pages: vec![0x55u8; MEM_SIZE],
            blocks: [block; NUM_BLOCKS],
            ecc_pages: HashSet::new(),
            copy_faults: HashSet::new(),
            rng: SmallRng::seed_from_u64(seed),
            stats: Default::default(),
        }
    }

    pub fn sim_reset(&mut self) {
        self.stats = Default::default();
        self.pages.fill(0x55);
        self.ecc_pages.clear();
        self.copy_faults.clear();
        for block in self.blocks.iter_mut() {
            block.flags = 0;
            block.next_page = PAGES_PER_BLOCK;
            block.timebomb = 0;
        }
    }

    fn timebomb_tick(&mut self, blkno: usize) {
        if self.blocks[blkno].timebomb != 0 {
            self.blocks[blkno].timebomb -= 1;
            if self.blocks[blkno].timebomb == 0 {
                self.blocks[blkno].flags |= BLOCK_FAILED;
            }
        }
    }

    fn rep_status(&self, blkno: usize) -> char {
        match self.blocks[blkno].flags {
            BLOCK_FAILED => 'b',
            BLOCK_BAD_MARK => '?',
            BLOCK_BOTH => 'B',
            _ => if self.blocks[blkno].next_page != 0 {
                    ':'
                } else {
                    '.'
                },
        }
    }

    pub fn sim_set_failed(&mut self, blkno: usize) {
        self.blocks[blkno].flags |= BLOCK_FAILED;
    }

    pub fn sim_set_timebomb(&mut self, blkno: usize, ttl: usize) {
        self.blocks[blkno].timebomb = ttl;
    }

    pub fn sim_inject_bad(&mut self, count: usize) {
        for _i in 0..count {
            let blkno: usize = self.rng.gen::<usize>() % NUM_BLOCKS;
            self.blocks[blkno].flags |= BLOCK_BOTH;
        }
    }

    pub fn sim_inject_failed(&mut self, count: usize) {
        for _i in 0..count {
            let blkno: usize = self.rng.gen::<usize>() % NUM_BLOCKS;
            self.sim_set_failed(blkno);
        }
    }

    pub fn sim_inject_timebombs(&mut self, count: usize, max_ttl: usize) {
        for _i in 0..count {
            let blkno: usize = self.rng.gen::<usize>() % NUM_BLOCKS;
            let ttl: usize = self.rng.gen::<usize>() % max_ttl + 1;
            self.sim_set_timebomb(blkno, ttl);
        }
    }

    /// Reads and copies of this page report an uncorrectable ECC error
    /// until the block is erased.
    pub fn sim_set_ecc(&mut self, page: Page) {
        self.ecc_pages.insert(page);
    }

    /// Internal copies from this page report a bad block. Moving the
    /// data with `read` and `prog` still works.
    pub fn sim_fail_copy_from(&mut self, page: Page) {
        self.copy_faults.insert(page);
    }

    pub fn is_marked_bad(&self, blkno: usize) -> bool {
        self.blocks[blkno].flags & BLOCK_BAD_MARK != 0
    }

    pub fn sim_dump(&self) {
        println!("NAND operation counts:");
        println!("    is_bad:         {}", self.stats.is_bad);
        println!("    mark_bad        {}", self.stats.mark_bad);
        println!("    erase:          {}", self.stats.erase);
        println!("    erase failures: {}", self.stats.erase_fail);
        println!("    is_erased:      {}", self.stats.is_erased);
        println!("    prog:           {}", self.stats.prog);
        println!("    prog failures:  {}", self.stats.prog_fail);
        println!("    read:           {}", self.stats.read);
        println!("    read (bytes):   {}", self.stats.read_bytes);
        println!("    ECC failures:   {}", self.stats.ecc_fail);
        println!("    copy failures:  {}", self.stats.copy_fail);
        println!();

        println!("Block status:");

        let mut i: usize = 0;
        while i < NUM_BLOCKS {
            let j = (NUM_BLOCKS - i).min(64);
            print!("    ");
            for k in 0..j {
                print!("{}", self.rep_status(i + k));
            }
            println!();
            i += j;
        }
    }

    // Stop counting, while tests poke around in the chip.
    pub fn freeze(&mut self) {
        self.stats.frozen = true;
    }

    pub fn thaw(&mut self) {
        self.stats.frozen = false;
    }
}

impl Nand for SimNand {
    fn log2_page_size(&self) -> u8 {LOG2_PAGE_SIZE}
    fn log2_ppb(&self) -> u8 {LOG2_PAGES_PER_BLOCK}
    fn num_blocks(&self) -> u32 {NUM_BLOCKS as u32}

    fn is_bad(&mut self, blk: Block) -> bool {
        let block = blk as usize;
        assert!(block < NUM_BLOCKS, "sim: is_bad called on invalid block {blk}");
        if !self.stats.frozen {
            self.stats.is_bad += 1;
        }
        self.blocks[block].flags & BLOCK_BAD_MARK != 0
    }

    fn mark_bad(&mut self, blk: Block) {
        let block = blk as usize;
        assert!(block < NUM_BLOCKS, "sim: mark_bad called on invalid block {blk}");
        if !self.stats.frozen {
            self.stats.mark_bad += 1;
        }
        self.blocks[block].flags |= BLOCK_BAD_MARK;
    }

    fn is_free(&mut self, page: Page) -> bool {
        let blk: usize = (page >> LOG2_PAGES_PER_BLOCK) as usize;
        let pageno: u32 = page & ((1 << LOG2_PAGES_PER_BLOCK) - 1);
        assert!(blk < NUM_BLOCKS, "sim: is_free called on invalid block {blk}");

        if !self.stats.frozen {
            self.stats.is_erased += 1;
        }
        self.blocks[blk].next_page <= pageno as usize
    }

    fn erase(&mut self, blk: Block) -> Result<(), FtlError> {
        let block = blk as usize;
        assert!(block < NUM_BLOCKS, "sim: erase called on invalid block {blk}");
        assert!(self.blocks[block].flags & BLOCK_BAD_MARK == 0,
            "sim: erase called on block which is marked bad: {block}");

        if !self.stats.frozen {
            self.stats.erase += 1;
        }

        // Remove the PAGES_PER_BLOCK indication of full.
        self.blocks[block].next_page = 0;

        self.timebomb_tick(block);

        let blk_idx: usize = block << LOG2_BLOCK_SIZE;

        if self.blocks[block].flags & BLOCK_FAILED != 0 {
            if !self.stats.frozen {
                self.stats.erase_fail += 1;
            }
            seq_gen((blk * 57 + 29) as u64, &mut self.pages[blk_idx..(blk_idx + BLOCK_SIZE)]);
            return Err(FtlError::BadBlock);
        }

        self.ecc_pages.retain(|&p| p >> LOG2_PAGES_PER_BLOCK != blk);
        self.pages[blk_idx..(blk_idx + BLOCK_SIZE)].fill(0xFF);
        Ok(())
    }

    fn read(&mut self, page: Page, offset: usize, length: usize, data: &mut [u8]) -> Result<(), FtlError> {
        let blkno: usize = (page >> LOG2_PAGES_PER_BLOCK) as usize;
        let page_idx: usize = (page as usize) << LOG2_PAGE_SIZE;
        assert!(blkno < NUM_BLOCKS, "sim: read called on invalid block {blkno}");
        assert!(offset + length <= PAGE_SIZE,
            "sim: read called on invalid range: offset = {offset}, length = {length}");

        if !self.stats.frozen {
            self.stats.read += 1;
            self.stats.read_bytes += length;
        }

        if self.ecc_pages.contains(&page) {
            if !self.stats.frozen {
                self.stats.ecc_fail += 1;
            }
            return Err(FtlError::Ecc);
        }

        let start: usize = page_idx + offset;
        data[..length].copy_from_slice(&self.pages[start..start + length]);
        Ok(())
    }

    fn copy(&mut self, src: Page, dst: Page) -> Result<(), FtlError> {
        let mut buf = [0u8; PAGE_SIZE];

        if self.copy_faults.contains(&src) {
            if !self.stats.frozen {
                self.stats.copy_fail += 1;
            }
            // The destination page is used up with junk.
            seq_gen((dst * 57 + 29) as u64, &mut buf);
            let _ = self.prog(dst, &buf);
            return Err(FtlError::BadBlock);
        }

        self.read(src, 0, PAGE_SIZE, &mut buf)?;
        self.prog(dst, &buf)
    }

    fn prog(&mut self, page: Page, data: &[u8]) -> Result<(), FtlError> {
        let blkno: usize = (page >> LOG2_PAGES_PER_BLOCK) as usize;
        let pageno: usize = (page as usize) & ((1 << LOG2_PAGES_PER_BLOCK) - 1);
        let page_idx: usize = (page as usize) << LOG2_PAGE_SIZE;
        assert!(blkno < NUM_BLOCKS, "sim: prog called on invalid block {blkno}");
        assert!(self.blocks[blkno].flags & BLOCK_BAD_MARK == 0,
            "sim: prog called on block which is marked bad: {blkno}");
        assert!(pageno >= self.blocks[blkno].next_page, "sim: prog \
            out-of-order page programming.  Block {blkno}, page {pageno} \
            (expected {})", self.blocks[blkno].next_page);

        if !self.stats.frozen {
            self.stats.prog += 1;
        }
        self.blocks[blkno].next_page = pageno + 1;
        self.timebomb_tick(blkno);

        if self.blocks[blkno].flags & BLOCK_FAILED != 0 {
            if !self.stats.frozen {
                self.stats.prog_fail += 1;
            }
            seq_gen((page * 57 + 29) as u64, &mut self.pages[page_idx..(page_idx + PAGE_SIZE)]);
            return Err(FtlError::BadBlock);
        }

        self.pages[page_idx..page_idx + PAGE_SIZE].copy_from_slice(&data[..PAGE_SIZE]);
        Ok(())
    }
}

pub fn seq_gen(seed: u64, buf: &mut [u8]) {
    let mut small_rng = SmallRng::seed_from_u64(seed);
    small_rng.fill_bytes(buf);
}

pub fn seq_assert(seed: u64, buf: &[u8]) {
    let mut expected = vec![0u8; buf.len()];
    seq_gen(seed, &mut expected);

    for (&element, expect) in zip(buf, expected) {
        assert_eq!(element, expect, "seq_assert: mismatch in sequences.");
    }
}
