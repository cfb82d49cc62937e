// The sector map: a radix tree of logical sectors embedded in the
// per-page metadata of the journal.
//
// Every user page in the journal carries the id of the sector it holds
// and one "alt" pointer per bit of the sector id. Walking from the
// journal root, at depth d we either stay on the current page (bit d of
// the target agrees with the page's id) or jump to the alt pointer for
// depth d. A lookup therefore reads at most 32 metadata records.

use log::{debug, warn};

use crate::bytes::{r32, w32};
use crate::error::FtlError;
use crate::journal::{Journal, MAX_RETRIES, META_SIZE, PAGE_NONE};
use crate::nand::{Nand, Page};

/// Logical sector number.
pub type Sector = u32;

/// This is a sector number which can be used to represent "no such
/// sector". Filler pages carry it as their id.
pub const SECTOR_NONE: Sector = 0xffffffff;

/// One level of the tree per bit of the sector id.
pub const RADIX_DEPTH: usize = Sector::BITS as usize;

fn d_bit(depth: usize) -> Sector {
    1 << (RADIX_DEPTH - depth - 1)
}

/// Sector id stored in a metadata record.
pub fn meta_get_id(meta: &[u8]) -> Sector {
    r32(&meta[0..4])
}

fn meta_set_id(meta: &mut [u8], id: Sector) {
    w32(&mut meta[0..4], id)
}

/// Alt pointer for the given tree depth stored in a metadata record.
pub fn meta_get_alt(meta: &[u8], level: usize) -> Page {
    let idx = 4 + (level << 2);
    r32(&meta[idx..idx + 4])
}

fn meta_set_alt(meta: &mut [u8], level: usize, alt: Page) {
    let idx = 4 + (level << 2);
    w32(&mut meta[idx..idx + 4], alt)
}

pub struct SectorMap<T: Nand> {
    journal: Journal<T>,

    /// Number of garbage collection passes per write once the journal
    /// has reached capacity. Also sets the spare space reserved for
    /// collection.
    gc_ratio: u8,

    /// Number of live sectors.
    count: Sector,

    /// Advertised capacity, fixed between `new`/`resume`/`clear`.
    capacity: Sector,

    /// Sectors whose only copy failed ECC while being collected.
    lost: Vec<Sector>,
    unreported: Vec<Sector>,
}

impl<T: Nand> SectorMap<T> {
    /// Initialize a map. You need to supply a buffer for page metadata,
    /// and specify a garbage collection ratio. This is the ratio of
    /// garbage collection operations to real writes when automatic
    /// collection is active.
    ///
    /// Smaller values lead to faster and more predictable IO, at the
    /// expense of capacity. You should always initialize the same chip
    /// with the same garbage collection ratio.
    pub fn new(nand: T, page_buf: Vec<u8>, gc_ratio: u8) -> Self {
        let mut map = SectorMap {
            journal: Journal::new(nand, page_buf),
            gc_ratio: gc_ratio.max(1),
            count: 0,
            capacity: 0,
            lost: Vec::new(),
            unreported: Vec::new(),
        };
        map.capacity = map.live_capacity();
        map
    }

    /// Recover stored state, if possible. If there is no valid stored
    /// state on the chip, an error is returned and the map is left
    /// empty.
    pub fn resume(&mut self) -> Result<(), FtlError> {
        let res = self.journal.resume();
        self.count = match res {
            Ok(()) => self.journal.cookie(),
            Err(_) => 0,
        };
        self.lost.clear();
        self.capacity = self.live_capacity();
        res
    }

    /// Clear the map (delete all sectors) and return the journal to its
    /// cold empty state.
    pub fn clear(&mut self) {
        self.count = 0;
        self.lost.clear();
        self.unreported.clear();
        self.journal.reset();
        self.capacity = self.live_capacity();
    }

    /// Obtain the maximum capacity of the map.
    pub fn capacity(&self) -> Sector {
        self.capacity
    }

    /// Obtain the current number of allocated sectors.
    pub fn size(&self) -> Sector {
        self.count
    }

    /// Size of a sector in bytes.
    pub fn sector_size(&self) -> usize {
        1 << self.journal.nand().log2_page_size()
    }

    /// Find the physical page which holds the current data for this
    /// sector. Returns `FtlError::NotFound` if the sector has never been
    /// written or was trimmed.
    pub fn find(&mut self, target: Sector) -> Result<Page, FtlError> {
        self.trace_path(target, None)
    }

    /// Read from the given logical sector. If the sector is unmapped, a
    /// blank page (0xff) will be returned.
    ///
    /// Afterwards the NAND's refresh hint only reflects the read of the
    /// sector's data page, never the metadata walked to find it.
    pub fn read(&mut self, s: Sector, data: &mut [u8]) -> Result<(), FtlError> {
        let size = self.sector_size();
        let found = self.find(s);
        self.journal.nand_mut().take_refresh_hint();

        match found {
            Ok(p) => self.journal.nand_mut().read(p, 0, size, data),
            Err(FtlError::NotFound) if self.lost.contains(&s) => Err(FtlError::Ecc),
            Err(FtlError::NotFound) => {
                data[..size].fill(0xFF);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// Write data to a logical sector.
    pub fn write(&mut self, dst: Sector, data: &[u8]) -> Result<(), FtlError> {
        loop {
            let mut meta = [0u8; META_SIZE];
            let old_count = self.count;

            self.prepare_write(dst, &mut meta)?;

            match self.journal.enqueue(Some(data), Some(&meta)) {
                Ok(()) => break,
                Err(e) => {
                    self.count = old_count;
                    self.try_recover(e)?;
                }
            }
        }
        self.forget_lost(dst);
        Ok(())
    }

    /// Copy any flash page to a logical sector.
    pub fn copy_page(&mut self, src: Page, dst: Sector) -> Result<(), FtlError> {
        loop {
            let mut meta = [0u8; META_SIZE];
            let old_count = self.count;

            self.prepare_write(dst, &mut meta)?;

            match self.journal.copy(src, Some(&meta)) {
                Ok(()) => break,
                Err(e) => {
                    self.count = old_count;
                    self.try_recover(e)?;
                }
            }
        }
        self.forget_lost(dst);
        Ok(())
    }

    /// Copy one sector to another. If the source sector is unmapped, the
    /// destination sector will be trimmed.
    pub fn copy_sector(&mut self, src: Sector, dst: Sector) -> Result<(), FtlError> {
        match self.find(src) {
            Ok(p) => self.copy_page(p, dst),
            Err(FtlError::NotFound) => self.trim(dst),
            Err(e) => Err(e),
        }
    }

    /// Delete a logical sector. You don't necessarily need to do this, but
    /// it's a useful hint if you no longer require the sector's data to be
    /// kept.
    pub fn trim(&mut self, s: Sector) -> Result<(), FtlError> {
        loop {
            self.auto_gc()?;

            match self.try_delete(s) {
                Ok(()) => break,
                Err(e) => self.try_recover(e)?,
            }
        }
        self.forget_lost(s);
        Ok(())
    }

    /// Synchronize the map. Once this returns successfully, all changes
    /// to date are persistent and durable. Conversely, there is no
    /// guarantee that unsynchronized changes will be persistent.
    pub fn sync(&mut self) -> Result<(), FtlError> {
        while !self.journal.is_clean() {
            let p = self.journal.peek();

            let ret = if p == PAGE_NONE {
                self.pad_queue()
            } else {
                let r = self.raw_gc(p);
                if r.is_ok() {
                    self.journal.dequeue();
                }
                r
            };

            if let Err(e) = ret {
                self.try_recover(e)?;
            }
        }
        Ok(())
    }

    /// Perform one garbage collection step. You can do this whenever you
    /// like, but it's not necessary. Garbage collection happens
    /// automatically when writes reach the reserved space.
    pub fn gc(&mut self) -> Result<(), FtlError> {
        if self.count == 0 {
            return Ok(());
        }

        loop {
            let tail = self.journal.peek();

            if tail == PAGE_NONE {
                break;
            }

            match self.raw_gc(tail) {
                Ok(()) => {
                    self.journal.dequeue();
                    break;
                }
                Err(e) => self.try_recover(e)?,
            }
        }
        Ok(())
    }

    /// Sectors lost to uncorrectable ECC errors during garbage collection
    /// since the last call. Reads of these sectors keep reporting
    /// `FtlError::Ecc` until they are written or trimmed.
    pub fn take_lost_sectors(&mut self) -> Vec<Sector> {
        std::mem::take(&mut self.unreported)
    }

    pub fn journal(&self) -> &Journal<T> {
        &self.journal
    }

    pub fn journal_mut(&mut self) -> &mut Journal<T> {
        &mut self.journal
    }

    pub fn into_nand(self) -> T {
        self.journal.into_nand()
    }
}

// Private methods
impl<T: Nand> SectorMap<T> {
    // Capacity given the journal's current bad block estimate.
    fn live_capacity(&self) -> Sector {
        let cap = self.journal.capacity();
        let reserve = cap / (self.gc_ratio as Sector + 1);
        let safety_margin = (MAX_RETRIES as Sector) << self.journal.log2_ppb();

        if reserve + safety_margin >= cap {
            return 0;
        }
        cap - reserve - safety_margin
    }

    fn set_count_cookie(&mut self, count: Sector) {
        self.journal.set_cookie(count);
    }

    fn forget_lost(&mut self, s: Sector) {
        self.lost.retain(|&l| l != s);
    }

    // Trace the path from the root to the given sector, emitting
    // alt-pointers in the given metadata buffer. On success the location
    // of the sector's page is returned.
    fn trace_path(&mut self, target: Sector, mut new_meta: Option<&mut [u8; META_SIZE]>) -> Result<Page, FtlError> {
        let mut meta = [0u8; META_SIZE];
        let mut depth: usize = 0;
        let mut p = self.journal.root();

        if let Some(nm) = new_meta.as_deref_mut() {
            meta_set_id(nm, target);
        }

        let found = if p == PAGE_NONE {
            false
        } else {
            self.journal.read_meta(p, &mut meta)?;
            loop {
                if depth >= RADIX_DEPTH {
                    break true;
                }

                let id = meta_get_id(&meta);
                if id == SECTOR_NONE {
                    break false;
                }

                if (target ^ id) & d_bit(depth) != 0 {
                    if let Some(nm) = new_meta.as_deref_mut() {
                        meta_set_alt(nm, depth, p);
                    }

                    p = meta_get_alt(&meta, depth);
                    if p == PAGE_NONE {
                        depth += 1;
                        break false;
                    }
                    self.journal.read_meta(p, &mut meta)?;
                } else if let Some(nm) = new_meta.as_deref_mut() {
                    meta_set_alt(nm, depth, meta_get_alt(&meta, depth));
                }

                depth += 1;
            }
        };

        if found {
            return Ok(p);
        }

        if let Some(nm) = new_meta {
            for level in depth..RADIX_DEPTH {
                meta_set_alt(nm, level, PAGE_NONE);
            }
        }
        Err(FtlError::NotFound)
    }

    // Check the given page. If it's garbage, do nothing. Otherwise,
    // rewrite it at the front of the map. Return raw errors from the
    // journal (do not perform recovery).
    fn raw_gc(&mut self, src: Page) -> Result<(), FtlError> {
        let mut meta = [0u8; META_SIZE];

        self.journal.read_meta(src, &mut meta)?;

        // Is the page just filler/garbage?
        let target = meta_get_id(&meta);
        if target == SECTOR_NONE {
            return Ok(());
        }

        // Find out where the sector once represented by this page
        // currently resides (if anywhere).
        let current = match self.trace_path(target, Some(&mut meta)) {
            Ok(current) => current,
            Err(FtlError::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        };

        // Is this page still the most current representative? If not,
        // do nothing.
        if current != src {
            return Ok(());
        }

        // Rewrite it at the front of the journal with updated metadata.
        self.set_count_cookie(self.count);
        match self.journal.copy(src, Some(&meta)) {
            Err(FtlError::Ecc) => {
                warn!("map: sector {} lost to ECC failure at page {}", target, src);
                if !self.lost.contains(&target) {
                    self.lost.push(target);
                }
                if !self.unreported.contains(&target) {
                    self.unreported.push(target);
                }
                self.try_delete(target)
            }
            res => res,
        }
    }

    fn pad_queue(&mut self) -> Result<(), FtlError> {
        let p = self.journal.root();
        let mut root_meta = [0u8; META_SIZE];

        self.set_count_cookie(self.count);

        if p == PAGE_NONE {
            return self.journal.enqueue(None, None);
        }

        self.journal.read_meta(p, &mut root_meta)?;
        self.journal.copy(p, Some(&root_meta))
    }

    // Attempt to recover the journal.
    fn try_recover(&mut self, cause: FtlError) -> Result<(), FtlError> {
        let mut restart_count: u8 = 0;

        if cause != FtlError::Recover {
            return Err(cause);
        }

        while self.journal.in_recovery() {
            let p = self.journal.next_recoverable();

            let ret = if p == PAGE_NONE {
                self.pad_queue()
            } else {
                self.raw_gc(p)
            };

            match ret {
                Ok(()) => (),
                Err(FtlError::Recover) => {
                    if restart_count >= MAX_RETRIES {
                        return Err(FtlError::TooBad);
                    }
                    debug!("map: recovery restarted");
                    restart_count += 1;
                }
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    fn auto_gc(&mut self) -> Result<(), FtlError> {
        if self.journal.size() < self.live_capacity() {
            return Ok(());
        }

        for _ in 0..self.gc_ratio {
            self.gc()?;
        }
        Ok(())
    }

    fn prepare_write(&mut self, dst: Sector, meta: &mut [u8; META_SIZE]) -> Result<(), FtlError> {
        self.auto_gc()?;

        match self.trace_path(dst, Some(meta)) {
            Ok(_) => (),
            Err(FtlError::NotFound) => {
                if self.count >= self.live_capacity() {
                    return Err(FtlError::MapFull);
                }
                self.count += 1;
            }
            Err(e) => return Err(e),
        }

        self.set_count_cookie(self.count);
        Ok(())
    }

    fn try_delete(&mut self, s: Sector) -> Result<(), FtlError> {
        let mut meta = [0u8; META_SIZE];
        let mut alt_meta = [0u8; META_SIZE];

        match self.trace_path(s, Some(&mut meta)) {
            Ok(_) => (),
            Err(FtlError::NotFound) => return Ok(()),
            Err(e) => return Err(e),
        }

        // Select any of the closest cousins of this node which are
        // subtrees of at least the requested order.
        let cousin = (0..RADIX_DEPTH)
            .rev()
            .map(|level| (level, meta_get_alt(&meta, level)))
            .find(|&(_, alt)| alt != PAGE_NONE);

        // Special case: deletion of last sector.
        let (level, alt_page) = match cousin {
            Some(c) => c,
            None => {
                self.count = 0;
                self.journal.clear();
                return Ok(());
            }
        };

        // Rewrite the cousin with an up-to-date path which doesn't point
        // to the original node.
        self.journal.read_meta(alt_page, &mut alt_meta)?;

        meta_set_id(&mut meta, meta_get_id(&alt_meta));

        meta_set_alt(&mut meta, level, PAGE_NONE);
        for l in level + 1..RADIX_DEPTH {
            meta_set_alt(&mut meta, l, meta_get_alt(&alt_meta, l));
        }

        self.set_count_cookie(self.count - 1);
        self.journal.copy(alt_page, Some(&meta))?;

        self.count -= 1;
        Ok(())
    }
}
