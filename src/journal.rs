use crc::{Crc, CRC_32_ISO_HDLC};
use log::{debug, warn};

use crate::bytes::{r32, w32};
use crate::error::FtlError;
use crate::nand::{Block, Nand, Page};

/// Number of bytes used by the journal checkpoint header, as well
/// as positions in the header.
const HEADER_SIZE: usize = 16;
const HEADER_EPOCH_IDX: usize = 3; // One byte after the 3-byte "magic number".
const HEADER_TAIL_IDX: usize = 4;  // 4-byte tail
const HEADER_BBC_IDX: usize = 8;   // 4-byte bad blocks before current head
const HEADER_BBL_IDX: usize = 12;  // 4-byte est. total bad blocks

/// Global metadata available for a higher layer. This metadata is
/// persistent once the journal reaches a checkpoint, and is restored on
/// startup.
const COOKIE_SIZE: usize = 4;

/// Every checkpoint page ends with a CRC-32 over the rest of the page,
/// so a torn checkpoint is never mistaken for a valid one.
const CHECKSUM_SIZE: usize = 4;
const CHECKPOINT_CRC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// This is the size of the metadata slice which accompanies each written
/// page. This is independent of the underlying page/OOB size.
pub const META_SIZE: usize = 132;

/// When a block fails, or garbage is encountered, we try again on the
/// next block/checkpoint. We can do this up to the given number of
/// times.
pub const MAX_RETRIES: u8 = 8;

/// This is a page number which can be used to represent "no such page".
/// It's guaranteed to never be a valid user page.
pub const PAGE_NONE: Page = 0xffffffff;

// State flags
const F_DIRTY: u8 = 0x01;
const F_BAD_META: u8 = 0x02;
const F_RECOVERY: u8 = 0x04;
const F_ENUM_DONE: u8 = 0x08;

/// The journal layer presents the NAND pages as a double-ended queue.
/// Pages, with associated metadata may be pushed onto the end of the
/// queue, and pages may be popped from the end.
///
/// Block erase, metadata storage are handled automatically. Bad blocks
/// are handled by relocating data to the next available non-bad page in
/// the sequence.
///
/// It's up to the user to ensure that the queue doesn't grow beyond the
/// capacity of the NAND chip, but helper functions are provided to
/// assist with this. If the head meets the tail, the journal will refuse
/// to enqueue more pages.
pub struct Journal<T: Nand> {
    nand: T,

    /// One page of working memory. Holds the checkpoint header, the
    /// cookie and the buffered metadata of the current checkpoint group.
    page_buf: Vec<u8>,

    /// Scratch page used when a page has to be copied through the host.
    copy_buf: Vec<u8>,

    /// Source pages whose internal copy reported a bad block. Copies of
    /// these go through the host until one succeeds.
    host_copies: Vec<Page>,

    /// In the journal, user data is grouped into checkpoints of
    /// 2**log2_ppc contiguous aligned pages.
    ///
    /// The last page of each checkpoint contains the journal header
    /// and the metadata for the other pages in the period (the user
    /// pages).
    log2_ppc: u8,

    /// Epoch counter. This is incremented whenever the journal head
    /// passes the end of the chip and wraps around.
    epoch: u8,

    /// General purpose flags field
    flags: u8,

    /// Bad-block counters. bb_last is our best estimate of the
    /// number of bad blocks in the chip as a whole. bb_current is
    /// the number of bad blocks in all blocks before the current
    /// head.
    bb_current: Block,
    bb_last: Block,

    /// Log head and tail. The tail pointer points to the last user
    /// page in the log, and the head pointer points to the next free
    /// raw page.
    tail_sync: Page,
    tail: Page,
    head: Page,

    /// This points to the last written user page in the journal
    root: Page,

    /// Recovery mode: recover_root points to the last valid user
    /// page in the block requiring recovery. recover_next points to
    /// the next user page needing recovery.
    ///
    /// If we had buffered metadata before recovery started, it will
    /// have been dumped to a free page, indicated by recover_meta.
    /// If this block later goes bad, we will have to defer bad-block
    /// marking until recovery is complete (F_BAD_META).
    recover_next: Page,
    recover_root: Page,
    recover_meta: Page,
}

// ///////////////////////////////////////////////////////////////////////
// Public interface
// ///////////////////////////////////////////////////////////////////////
//
impl<T: Nand> Journal<T> {
    /// Initialize a journal. You must supply a NAND chip driver, and a
    /// single page buffer. The buffer is resized to one page and is used
    /// exclusively by the journal.
    /// No NAND operations are performed at this point.
    pub fn new(nand: T, mut page_buf: Vec<u8>) -> Self {
        let psize = nand.log2_page_size();
        let max = nand.log2_ppb();
        page_buf.resize(1 << psize, 0xFF);

        let mut j = Journal {
            nand,
            page_buf,
            copy_buf: Vec::new(),
            host_copies: Vec::new(),
            log2_ppc: choose_ppc(psize, max),
            epoch: 0,
            flags: 0,
            bb_current: 0,
            bb_last: 0, // Gets updated in reset().
            tail_sync: 0,
            tail: 0,
            head: 0,
            root: PAGE_NONE,
            recover_next: 0,
            recover_root: 0,
            recover_meta: 0,
        };

        j.reset();
        j
    }

    /// Start up the journal -- search the NAND for the journal head, or
    /// initialize a blank journal if one isn't found.
    ///
    /// This operation is O(log N), where N is the number of pages in the
    /// NAND chip. All other operations are O(1).
    ///
    /// If this operation fails, the journal will be reset to an empty state.
    pub fn resume(&mut self) -> Result<(), FtlError> {
        let first = match self.find_checkblock(0) {
            Ok(first) => first,
            Err(e) => {
                self.reset();
                return Err(e);
            }
        };

        // Find the last checkpoint-containing block in this epoch.
        self.epoch = self.hdr_get_epoch();
        let last = self.find_last_checkblock(first);

        // Find the last programmed checkpoint group in the block.
        let last_group = self.find_last_group(last);

        // Perform a linear scan to find the last good checkpoint
        // (and therefore the root).
        if let Err(e) = self.find_root(last_group) {
            self.reset();
            return Err(e);
        }

        // Restore settings from the checkpoint.
        self.tail = self.hdr_get_tail();
        self.bb_current = self.hdr_get_bb_current();
        self.bb_last = self.hdr_get_bb_last();
        self.hdr_clear_user();

        // Perform another linear scan to find the next free user page.
        self.find_head(last_group);

        self.flags = 0;
        self.tail_sync = self.tail;

        self.clear_recovery();
        self.host_copies.clear();
        debug!(
            "journal resumed: epoch={}, head={}, tail={}, root={}",
            self.epoch, self.head, self.tail, self.root
        );
        Ok(())
    }

    /// Reset the journal to the cold empty state, as if the chip had
    /// never been written. Nothing on the NAND is touched.
    pub fn reset(&mut self) {
        // We don't yet have a bad block estimate, so make
        // a conservative guess.
        self.epoch = 0;
        self.bb_last = self.nand.num_blocks() >> 6;
        self.bb_current = 0;
        self.flags = 0;

        // Empty journal
        self.head = 0;
        self.tail = 0;
        self.tail_sync = 0;
        self.root = PAGE_NONE;

        // No recovery required.
        self.clear_recovery();
        self.host_copies.clear();

        // Empty metadata buffer.
        self.page_buf.fill(0xFF);
    }

    /// Obtain an upper bound on the number of user pages storable in the
    /// journal.
    pub fn capacity(&self) -> Page {
        let max_bad = self.bb_last.max(self.bb_current);
        let good_blocks = self.nand.num_blocks().saturating_sub(max_bad + 1);
        let log2_cpb = self.nand.log2_ppb() - self.log2_ppc;
        let good_cps: Page = good_blocks << log2_cpb;

        // Good checkpoints * (checkpoint period - 1)
        (good_cps << self.log2_ppc) - good_cps
    }

    /// Obtain an upper bound on the number of user pages consumed by the
    /// journal.
    pub fn size(&self) -> Page {
        // Find the number of raw pages, and the number of checkpoints
        // between the head and tail. The difference between the two
        // is the number of user pages (upper limit).
        let mut num_pages = self.head;
        let mut num_cps = self.head >> self.log2_ppc;

        if self.head < self.tail_sync {
            let total_pages = self.total_pages();
            num_pages += total_pages;
            num_cps += total_pages >> self.log2_ppc;
        }

        num_pages -= self.tail_sync;
        num_cps -= self.tail_sync >> self.log2_ppc;

        num_pages - num_cps
    }

    /// Get the "cookie" data, a global metadata location for the map layer.
    pub fn cookie(&self) -> u32 {
        r32(&self.page_buf[HEADER_SIZE..HEADER_SIZE + COOKIE_SIZE])
    }

    /// Set the "cookie" data, a global metadata location for the map layer.
    pub fn set_cookie(&mut self, value: u32) {
        w32(&mut self.page_buf[HEADER_SIZE..HEADER_SIZE + COOKIE_SIZE], value);
    }

    /// The last user page written to the journal, or `PAGE_NONE`.
    pub fn root(&self) -> Page {
        self.root
    }

    /// Read metadata associated with a page. This assumes that the page
    /// provided is a valid data page. The actual page data is read via the
    /// normal NAND interface.
    pub fn read_meta(&mut self, page: Page, buf: &mut [u8]) -> Result<(), FtlError> {
        // Offset of metadata within the metadata page
        let ppc_mask: Page = (1 << self.log2_ppc) - 1;
        let offset = hdr_user_offset(page & ppc_mask);

        // Special case: buffered metadata
        if align_eq(page, self.head, self.log2_ppc) {
            buf[..META_SIZE].copy_from_slice(&self.page_buf[offset..offset + META_SIZE]);
            return Ok(());
        }

        // Special case: incomplete metadata dumped at start of recovery
        if self.recover_meta != PAGE_NONE && align_eq(page, self.recover_root, self.log2_ppc) {
            return self.nand.read(self.recover_meta, offset, META_SIZE, buf);
        }

        // General case: fetch from metadata page for checkpoint group
        self.nand.read(page | ppc_mask, offset, META_SIZE, buf)
    }

    /// Advance the tail to the next non-bad block and return the page that's
    /// ready to read. If no page is ready, return `PAGE_NONE`.
    pub fn peek(&mut self) -> Page {
        if self.head == self.tail {
            return PAGE_NONE;
        }

        let log2_ppb = self.nand.log2_ppb();
        if is_aligned(self.tail, log2_ppb) {
            let mut block: Block = self.tail >> log2_ppb;

            for _ in 0..MAX_RETRIES {
                if block == (self.head >> log2_ppb) || !self.nand.is_bad(block) {
                    self.tail = block << log2_ppb;
                    if self.tail == self.head {
                        self.root = PAGE_NONE;
                    }
                    return self.tail;
                }
                block = self.next_block(block);
            }
        }
        self.tail
    }

    /// Remove the last page from the journal. This doesn't take permanent
    /// effect until the next checkpoint.
    pub fn dequeue(&mut self) {
        if self.head == self.tail {
            return;
        }

        self.tail = self.next_upage(self.tail);

        // If the journal is clean at the time of dequeue, then this
        // data was always obsolete, and can be reused immediately.
        if self.flags & (F_DIRTY | F_RECOVERY) == 0 {
            self.tail_sync = self.tail;
        }

        if self.head == self.tail {
            self.root = PAGE_NONE;
        }
    }

    /// Remove all pages from the journal. This doesn't take permanent effect
    /// until the next checkpoint.
    pub fn clear(&mut self) {
        self.tail = self.head;
        self.root = PAGE_NONE;
        self.flags |= F_DIRTY;

        self.hdr_clear_user();
    }

    /// Append a page to the journal. Both raw page data and metadata must be
    /// specified; `None` data leaves the user page unprogrammed and `None`
    /// metadata marks it as filler. The push operation is not persistent
    /// until a checkpoint is reached.
    ///
    /// This operation may fail with `FtlError::Recover`. If this occurs, the
    /// upper layer must complete the assisted recovery procedure and then
    /// try again.
    ///
    /// This operation may be used as part of a recovery. If further errors
    /// occur during recovery, `Recover` is returned, and the procedure must
    /// be restarted.
    pub fn enqueue(&mut self, data: Option<&[u8]>, meta: Option<&[u8]>) -> Result<(), FtlError> {
        for _ in 0..MAX_RETRIES {
            let res = match self.prepare_head() {
                Ok(()) => match data {
                    Some(data) => self.nand.prog(self.head, data),
                    None => Ok(()),
                },
                Err(e) => Err(e),
            };

            match res {
                Ok(()) => return self.push_meta(meta),
                Err(e) => self.recover_from(e)?,
            }
        }
        Err(FtlError::TooBad)
    }

    /// Copy an existing page to the front of the journal. New metadata must
    /// be specified. This operation is not persistent until a checkpoint is
    /// reached.
    ///
    /// The chip's internal copy is tried first. If it reports a bad block,
    /// every later copy of the same page, including the retry after
    /// recovery, moves the data through the host instead.
    ///
    /// Recovery semantics are the same as for [`Journal::enqueue`].
    pub fn copy(&mut self, page: Page, meta: Option<&[u8]>) -> Result<(), FtlError> {
        for _ in 0..MAX_RETRIES {
            let res = match self.prepare_head() {
                Ok(()) if self.host_copies.contains(&page) => self.copy_via_host(page),
                Ok(()) => {
                    let res = self.nand.copy(page, self.head);
                    if res == Err(FtlError::BadBlock) {
                        debug!("journal: internal copy of page {} failed, using host copy", page);
                        self.host_copies.push(page);
                    }
                    res
                }
                Err(e) => Err(e),
            };

            match res {
                Ok(()) => {
                    self.host_copies.retain(|&p| p != page);
                    return self.push_meta(meta);
                }
                Err(e) => self.recover_from(e)?,
            }
        }
        Err(FtlError::TooBad)
    }

    /// Is the journal checkpointed? If true, then all pages enqueued are now
    /// persistent.
    pub fn is_clean(&self) -> bool {
        self.flags & F_DIRTY == 0
    }

    /// True if journal is in recovery.
    pub fn in_recovery(&self) -> bool {
        self.flags & F_RECOVERY != 0
    }

    /// If an operation returns `Recover`, you must begin the recovery
    /// procedure. You must then:
    ///
    ///    - call `next_recoverable()` to obtain the next block to be
    ///      recovered (if any). If there are no blocks remaining to be
    ///      recovered, `PAGE_NONE` is returned.
    ///
    ///    - proceed to the next checkpoint. Once the journal is clean,
    ///      recovery will finish automatically.
    ///
    /// If any operation during recovery fails due to a bad block, `Recover`
    /// is returned again, and recovery restarts. Do not add new data to the
    /// journal (rewrites of recovered data are fine) until recovery is
    /// complete.
    pub fn next_recoverable(&mut self) -> Page {
        let n = self.recover_next;

        if !self.in_recovery() {
            return PAGE_NONE;
        }

        if self.flags & F_ENUM_DONE != 0 {
            return PAGE_NONE;
        }

        if self.recover_next == self.recover_root {
            self.flags |= F_ENUM_DONE;
        } else {
            self.recover_next = self.next_upage(self.recover_next);
        }

        n
    }

    pub fn nand(&self) -> &T {
        &self.nand
    }

    pub fn nand_mut(&mut self) -> &mut T {
        &mut self.nand
    }

    /// Tear down the journal, handing back the NAND driver.
    pub fn into_nand(self) -> T {
        self.nand
    }

    // Some more getters, mostly for testing
    pub fn log2_ppc(&self) -> u8 {self.log2_ppc}
    pub fn log2_ppb(&self) -> u8 {self.nand.log2_ppb()}
    pub fn num_blocks(&self) -> u32 {self.nand.num_blocks()}
    pub fn head(&self) -> Page {self.head}
    pub fn tail(&self) -> Page {self.tail}
    pub fn tail_sync(&self) -> Page {self.tail_sync}
    pub fn bb_current(&self) -> Block {self.bb_current}
    pub fn bb_last(&self) -> Block {self.bb_last}
    pub fn epoch(&self) -> u8 {self.epoch}

    /// Only needed by tests which reclaim space without a map on top.
    pub fn set_tail_sync(&mut self, v: Page) {self.tail_sync = v;}
}

// ///////////////////////////////////////////////////////////////////////
// Private methods
// ///////////////////////////////////////////////////////////////////////
//
impl<T: Nand> Journal<T> {
    // ********************************************************************
    // Metapage binary format helpers. All of them work on the start of
    // the page buffer.

    // Does the page buffer contain a valid checkpoint page?
    fn hdr_is_valid(&self) -> bool {
        self.hdr_has_magic() && self.hdr_get_checksum() == self.hdr_checksum()
    }

    fn hdr_has_magic(&self) -> bool {
        self.page_buf[0..3] == *b"Dha"
    }

    // Insert the magic characters into the buffer.
    fn hdr_put_magic(&mut self) {
        self.page_buf[0..3].copy_from_slice(b"Dha");
    }

    // What epoch is this page?
    fn hdr_get_epoch(&self) -> u8 {
        self.page_buf[HEADER_EPOCH_IDX]
    }

    fn hdr_set_epoch(&mut self, e: u8) {
        self.page_buf[HEADER_EPOCH_IDX] = e;
    }

    fn hdr_get_tail(&self) -> Page {
        r32(&self.page_buf[HEADER_TAIL_IDX..HEADER_BBC_IDX])
    }

    fn hdr_set_tail(&mut self, tail: Page) {
        w32(&mut self.page_buf[HEADER_TAIL_IDX..HEADER_BBC_IDX], tail)
    }

    fn hdr_get_bb_current(&self) -> Block {
        r32(&self.page_buf[HEADER_BBC_IDX..HEADER_BBL_IDX])
    }

    fn hdr_set_bb_current(&mut self, bbc: Block) {
        w32(&mut self.page_buf[HEADER_BBC_IDX..HEADER_BBL_IDX], bbc)
    }

    fn hdr_get_bb_last(&self) -> Block {
        r32(&self.page_buf[HEADER_BBL_IDX..HEADER_SIZE])
    }

    fn hdr_set_bb_last(&mut self, bbl: Block) {
        w32(&mut self.page_buf[HEADER_BBL_IDX..HEADER_SIZE], bbl)
    }

    fn checksum_idx(&self) -> usize {
        self.page_buf.len() - CHECKSUM_SIZE
    }

    fn hdr_get_checksum(&self) -> u32 {
        r32(&self.page_buf[self.checksum_idx()..])
    }

    // Checksum of everything in the page except the checksum itself.
    fn hdr_checksum(&self) -> u32 {
        CHECKPOINT_CRC.checksum(&self.page_buf[..self.checksum_idx()])
    }

    fn hdr_seal(&mut self) {
        let crc = self.hdr_checksum();
        let idx = self.checksum_idx();
        w32(&mut self.page_buf[idx..], crc);
    }

    // Wipe everything after the cookie: buffered metadata and checksum.
    fn hdr_clear_user(&mut self) {
        self.page_buf[HEADER_SIZE + COOKIE_SIZE..].fill(0xFF);
    }

    // ********************************************************************
    // Page geometry helpers on the struct

    fn total_pages(&self) -> Page {
        self.nand.num_blocks() << self.nand.log2_ppb()
    }

    // What is the successor of this block?
    fn next_block(&self, blk: Block) -> Block {
        let block = blk + 1;
        if block >= self.nand.num_blocks() {
            0
        } else {
            block
        }
    }

    fn skip_block(&mut self) -> Result<(), FtlError> {
        let log2_ppb = self.nand.log2_ppb();
        let next = self.next_block(self.head >> log2_ppb);

        // We can't roll onto the same block as the tail.
        if self.tail_sync >> log2_ppb == next {
            return Err(FtlError::JournalFull);
        }

        self.head = next << log2_ppb;
        if self.head == 0 {
            self.roll_stats();
        }
        Ok(())
    }

    fn next_upage(&self, page: Page) -> Page {
        let mut p = page + 1;

        if is_aligned(p + 1, self.log2_ppc) {
            p += 1;
        }

        if p >= self.total_pages() {
            p = 0;
        }
        p
    }

    // ********************************************************************
    // Journal setup/resume helpers

    fn clear_recovery(&mut self) {
        self.recover_next = PAGE_NONE;
        self.recover_root = PAGE_NONE;
        self.recover_meta = PAGE_NONE;
        self.flags &= !(F_BAD_META | F_RECOVERY | F_ENUM_DONE);
    }

    fn roll_stats(&mut self) {
        self.bb_last = self.bb_current;
        self.bb_current = 0;
        self.epoch = self.epoch.wrapping_add(1);
    }

    // Load a checkpoint page into the page buffer. True if the read
    // succeeded and the page holds a valid checkpoint.
    fn load_checkpoint(&mut self, page: Page) -> bool {
        let size = self.page_buf.len();
        self.nand.read(page, 0, size, &mut self.page_buf).is_ok() && self.hdr_is_valid()
    }

    // Find the first checkpoint-containing block. If a block contains any
    // checkpoints at all, then it must contain one in the first checkpoint
    // location -- otherwise, we would have considered the block eraseable.
    fn find_checkblock(&mut self, block: Block) -> Result<Block, FtlError> {
        let mut blk = block;
        let mut i: u8 = 0;

        while blk < self.nand.num_blocks() && i < MAX_RETRIES {
            let p: Page = (blk << self.nand.log2_ppb()) | ((1 << self.log2_ppc) - 1);

            if !self.nand.is_bad(blk) && self.load_checkpoint(p) {
                return Ok(blk);
            }
            blk += 1;
            i += 1;
        }

        Err(FtlError::TooBad)
    }

    // Perform a binary search for the last checkblock of the current
    // epoch, starting at "first".
    fn find_last_checkblock(&mut self, first: Block) -> Block {
        let mut low = first;
        let mut high = self.nand.num_blocks() - 1;

        while low <= high {
            let mid = (low + high) >> 1;

            // This loads data into the page buffer in the process.
            match self.find_checkblock(mid) {
                Ok(found) if self.hdr_get_epoch() == self.epoch => {
                    if found + 1 >= self.nand.num_blocks() {
                        return found;
                    }
                    match self.find_checkblock(found + 1) {
                        Ok(nf) if self.hdr_get_epoch() == self.epoch => low = nf,
                        _ => return found,
                    }
                }
                _ => {
                    if mid == 0 {
                        return first;
                    }
                    high = mid - 1;
                }
            }
        }
        first
    }

    // Test whether a checkpoint group is in a state fit for reprogramming,
    // but allow for the fact that is_free() might not have any way of
    // distinguishing between an unprogrammed page, and a page programmed
    // with all-0xff bytes (but if so, it must be ok to reprogram such a
    // page).
    //
    // All pages in the group are checked. The final page in a checkpoint
    // group is guaranteed to contain non-0xff bytes, so this returns true
    // only if the group is truly unprogrammed, or if it was partially
    // programmed with some all-0xff user pages (which changes nothing for
    // us).
    fn cp_free(&mut self, first_user: Page) -> bool {
        let count: Page = 1 << self.log2_ppc;
        (0..count).all(|i| self.nand.is_free(first_user + i))
    }

    // Find the last checkpoint group in an erase block.
    // If a checkpoint group is completely unprogrammed, everything
    // following it will be completely unprogrammed also.
    // Therefore, binary search checkpoint groups until we find the
    // last programmed one.
    fn find_last_group(&mut self, block: Block) -> Page {
        let log2_ppb = self.nand.log2_ppb();
        let num_groups: i64 = 1 << (log2_ppb - self.log2_ppc);
        let mut low: i64 = 0;
        let mut high: i64 = num_groups - 1;

        while low <= high {
            let mid = (low + high) >> 1;
            let page: Page = ((mid as Page) << self.log2_ppc) | (block << log2_ppb);

            if self.cp_free(page) {
                high = mid - 1;
            } else if mid + 1 >= num_groups || self.cp_free(page + (1 << self.log2_ppc)) {
                return page;
            } else {
                low = mid + 1;
            }
        }
        block << log2_ppb
    }

    // Find and set the root of the journal, scanning backwards from the
    // group containing "start" to the first group of its block.
    // Leaves the checkpoint page in the buffer.
    fn find_root(&mut self, start: Page) -> Result<(), FtlError> {
        let log2_ppb = self.nand.log2_ppb();
        let block: Block = start >> log2_ppb;
        let last: Page = (start & ((1 << log2_ppb) - 1)) >> self.log2_ppc;

        for i in (0..=last).rev() {
            let page: Page = (block << log2_ppb) + ((i + 1) << self.log2_ppc) - 1;

            if self.load_checkpoint(page) && self.hdr_get_epoch() == self.epoch {
                self.root = page - 1;
                return Ok(());
            }
            debug!("journal: checkpoint at page {} is not valid, stepping back", page);
        }
        Err(FtlError::TooBad)
    }

    // Starting from the last good checkpoint, find either:
    //   (a) the next free user-page in the same block, or
    //   (b) the first page of the next block.
    //
    // The block we end up on might be bad, but that's OK --
    // we'll skip it when we go to prepare the next write.
    fn find_head(&mut self, start: Page) {
        let log2_ppb = self.nand.log2_ppb();

        self.head = self.next_upage(start);
        if self.head == 0 {
            self.roll_stats();
        }

        loop {
            // How many free pages trail this checkpoint group?
            let ppc: Page = 1 << self.log2_ppc;
            let first: Page = self.head & !(ppc - 1);
            let mut n: Page = 0;

            while n < ppc && self.nand.is_free(first + ppc - n - 1) {
                n += 1;
            }

            // If we have some, then we've found our next free user page.
            if n > 1 {
                self.head = first + ppc - n;
                break;
            }

            // Skip to the next checkpoint group.
            self.head = first + ppc;
            if self.head >= self.total_pages() {
                self.head = 0;
                self.roll_stats();
            }

            // If we hit the end of the block, we're done.
            if is_aligned(self.head, log2_ppb) {
                // Make sure we don't chase over the tail.
                if align_eq(self.head, self.tail, log2_ppb) {
                    self.tail = self.next_block(self.tail >> log2_ppb) << log2_ppb;
                }
                break;
            }
        }
    }

    // Make sure the head pointer is on a ready-to-program page.
    fn prepare_head(&mut self) -> Result<(), FtlError> {
        let log2_ppb = self.nand.log2_ppb();
        let next = self.next_upage(self.head);

        // We can't write if doing so would cause the head pointer to
        // roll onto the same block as the last-synched tail.
        if align_eq(next, self.tail_sync, log2_ppb) && !align_eq(next, self.head, log2_ppb) {
            return Err(FtlError::JournalFull);
        }

        self.flags |= F_DIRTY;
        if !is_aligned(self.head, log2_ppb) {
            return Ok(());
        }

        for _ in 0..MAX_RETRIES {
            let block: Block = self.head >> log2_ppb;

            if !self.nand.is_bad(block) {
                return self.nand.erase(block);
            }

            self.bb_current += 1;
            self.skip_block()?;
        }

        Err(FtlError::TooBad)
    }

    fn copy_via_host(&mut self, src: Page) -> Result<(), FtlError> {
        let size = self.page_buf.len();
        let mut buf = std::mem::take(&mut self.copy_buf);
        buf.resize(size, 0xFF);

        let res = match self.nand.read(src, 0, size, &mut buf) {
            Ok(()) => self.nand.prog(self.head, &buf),
            Err(e) => Err(e),
        };

        self.copy_buf = buf;
        res
    }

    fn restart_recovery(&mut self, old_head: Page) {
        let log2_ppb = self.nand.log2_ppb();

        // Mark the current head bad immediately, unless we're also using
        // it to hold our dumped metadata (it will then be marked bad at
        // the end of recovery).
        if self.recover_meta != PAGE_NONE && align_eq(self.recover_meta, old_head, log2_ppb) {
            self.flags |= F_BAD_META;
        } else {
            self.nand.mark_bad(old_head >> log2_ppb);
        }

        // Start recovery again. Reset the source enumeration to the
        // start of the original bad block, and reset the destination
        // enumeration to the newly found good block.
        self.flags &= !F_ENUM_DONE;
        self.recover_next = self.recover_root & !((1 << log2_ppb) - 1);
        self.root = self.recover_root;
    }

    fn dump_meta(&mut self) -> Result<(), FtlError> {
        // We've just begun recovery on a new erasable block, but we have
        // buffered metadata from the failed block.
        for _ in 0..MAX_RETRIES {
            let res = match self.prepare_head() {
                Ok(()) => self.nand.prog(self.head, &self.page_buf),
                Err(e) => Err(e),
            };

            match res {
                Ok(()) => {
                    self.recover_meta = self.head;
                    self.head = self.next_upage(self.head);
                    if self.head == 0 {
                        self.roll_stats();
                    }
                    self.hdr_clear_user();
                    return Ok(());
                }
                // Report fatal errors.
                Err(FtlError::BadBlock) => (),
                Err(e) => return Err(e),
            }

            self.bb_current += 1;
            self.nand.mark_bad(self.head >> self.nand.log2_ppb());
            self.skip_block()?;
        }

        Err(FtlError::TooBad)
    }

    fn recover_from(&mut self, write_err: FtlError) -> Result<(), FtlError> {
        let log2_ppb = self.nand.log2_ppb();
        let old_head = self.head;

        if write_err != FtlError::BadBlock {
            return Err(write_err);
        }
        warn!("journal: block {} went bad, relocating", old_head >> log2_ppb);

        // Advance to the next free page.
        self.bb_current += 1;
        self.skip_block()?;

        // Are we already in the middle of a recovery?
        if self.in_recovery() {
            self.restart_recovery(old_head);
            return Err(FtlError::Recover);
        }

        // Were we block aligned? No recovery required!
        if is_aligned(old_head, log2_ppb) {
            self.nand.mark_bad(old_head >> log2_ppb);
            return Ok(());
        }

        self.recover_root = self.root;
        self.recover_next = self.recover_root & !((1 << log2_ppb) - 1);

        // Are we holding buffered metadata? Dump it first.
        if !is_aligned(old_head, self.log2_ppc) {
            self.dump_meta()?;
        }

        self.flags |= F_RECOVERY;
        debug!("journal: recovery started from page {}", self.recover_next);
        Err(FtlError::Recover)
    }

    fn finish_recovery(&mut self) {
        let log2_ppb = self.nand.log2_ppb();

        // We just recovered the last page. Mark the recovered
        // block as bad.
        self.nand.mark_bad(self.recover_root >> log2_ppb);

        // If we had to dump metadata, and the page on which we
        // did this also went bad, mark it bad too.
        if self.flags & F_BAD_META != 0 {
            self.nand.mark_bad(self.recover_meta >> log2_ppb);
        }

        self.clear_recovery();
        debug!("journal: recovery complete");
    }

    // Adds metadata to the page buffer, and writes the checkpoint page
    // once the group is full.
    // meta: None for a filler page, otherwise META_SIZE bytes.
    fn push_meta(&mut self, meta: Option<&[u8]>) -> Result<(), FtlError> {
        let old_head = self.head;
        let offset = hdr_user_offset(self.head & ((1 << self.log2_ppc) - 1));

        // We have just written a user page. Add the metadata
        // to the buffer.
        match meta {
            Some(meta) => self.page_buf[offset..offset + META_SIZE].copy_from_slice(&meta[..META_SIZE]),
            None => self.page_buf[offset..offset + META_SIZE].fill(0xFF),
        }

        // Unless we've filled the buffer, don't do any I/O.
        if !is_aligned(self.head + 2, self.log2_ppc) {
            self.root = self.head;
            self.head += 1;
            return Ok(());
        }

        // We don't need to check for immediate recover, because that'll
        // never happen -- we're not block-aligned.
        self.hdr_put_magic();
        self.hdr_set_epoch(self.epoch);
        self.hdr_set_tail(self.tail);
        self.hdr_set_bb_current(self.bb_current);
        self.hdr_set_bb_last(self.bb_last);
        self.hdr_seal();

        if let Err(e) = self.nand.prog(self.head + 1, &self.page_buf) {
            return self.recover_from(e);
        }

        self.flags &= !F_DIRTY;
        self.root = old_head;
        self.head = self.next_upage(self.head);

        if self.head == 0 {
            self.roll_stats();
        }

        if self.flags & F_ENUM_DONE != 0 {
            self.finish_recovery();
        }

        if self.flags & F_RECOVERY == 0 {
            self.tail_sync = self.tail;
        }

        Ok(())
    }
}

// ********************************************************************
// Page geometry helpers independent of the struct

fn hdr_user_offset(which: Page) -> usize {
    HEADER_SIZE + COOKIE_SIZE + (which as usize) * META_SIZE
}

// Is this page aligned to N bits?
fn is_aligned(p: Page, n: u8) -> bool {
    p & ((1u32 << n) - 1) == 0
}

// Are these two pages from the same alignment group?
fn align_eq(a: Page, b: Page, n: u8) -> bool {
    (a ^ b) >> n == 0
}

// Calculate a checkpoint period: the largest value of ppc such that
// (2**ppc - 1) metadata blocks can fit on a page with one journal header
// and its checksum.
fn choose_ppc(log2_psize: u8, max: u8) -> u8 {
    let max_meta: usize = (1 << log2_psize) - HEADER_SIZE - COOKIE_SIZE - CHECKSUM_SIZE;
    let mut total_meta: usize = META_SIZE;
    let mut ppc: u8 = 1;

    while ppc < max {
        total_meta <<= 1;
        total_meta += META_SIZE;

        if total_meta > max_meta {
            break;
        }
        ppc += 1;
    }
    ppc
}
