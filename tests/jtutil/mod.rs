// Helpers for driving a journal over the simulated NAND.
#![allow(dead_code)]

use spi_nand_ftl::journal::{Journal, MAX_RETRIES, META_SIZE, PAGE_NONE};
use spi_nand_ftl::map::meta_get_id;
use spi_nand_ftl::nand::{Nand, Page};
use spi_nand_ftl::FtlError;
use crate::sim::{seq_assert, seq_gen, SimNand, PAGE_SIZE};

/// To specify how many pages to enqueue.
pub enum Pages {
    All,
    Count(usize),
}

pub type SimJournal = Journal<SimNand>;

pub fn new_journal(nand: SimNand) -> SimJournal {
    // We start it with 0, but it gets changed to 0xFF when initialized.
    Journal::new(nand, vec![0u8; PAGE_SIZE])
}

fn check_upage(j: &SimJournal, page: Page) {
    let mask: Page = (1 << j.log2_ppc()) - 1;
    assert!((!page) & mask != 0);
    assert!(page < (j.num_blocks() << j.log2_ppb()));
}

pub fn jt_check(j: &SimJournal) {
    // Head and tail pointers always point to a valid user-page
    // index (never a meta-page, and never out-of-bounds).
    check_upage(j, j.head());
    check_upage(j, j.tail());
    check_upage(j, j.tail_sync());

    // The head never advances forward onto the same block
    // as the tail.
    if (j.head() ^ j.tail_sync()) >> j.log2_ppb() == 0 {
        assert!(j.head() >= j.tail_sync());
    }

    // The current tail is always between the head and the
    // synchronized tail.
    assert!(j.head().wrapping_sub(j.tail_sync()) >= j.tail().wrapping_sub(j.tail_sync()));

    // The root always points to a valid user page in a non-empty
    // journal.
    if j.root() != PAGE_NONE {
        let raw_size = j.head().wrapping_sub(j.tail());
        let root_offset = j.root().wrapping_sub(j.tail());

        check_upage(j, j.root());
        assert!(root_offset < raw_size);
    }
}

fn recover(j: &mut SimJournal) {
    let mut retry_count: usize = 0;

    while j.in_recovery() {
        let page = j.next_recoverable();

        jt_check(j);

        let res = if page == PAGE_NONE {
            j.enqueue(None, None)
        } else {
            let mut meta = [0u8; META_SIZE];
            j.read_meta(page, &mut meta).expect("read_meta");
            j.copy(page, Some(&meta))
        };

        jt_check(j);

        match res {
            Err(FtlError::Recover) => {
                println!("    recover: restart");
                retry_count += 1;
                if retry_count >= MAX_RETRIES as usize {
                    panic!("recover with too many bad");
                }
            }
            Err(e) => panic!("copy {:?}", e),
            Ok(()) => (),
        }
    }
    jt_check(j);
}

fn enqueue(j: &mut SimJournal, id: u32) -> Result<(), FtlError> {
    let mut r = [0u8; PAGE_SIZE];
    let mut meta = [0u8; META_SIZE];
    seq_gen(id as u64, &mut r);
    meta[0..4].copy_from_slice(&id.to_le_bytes());

    for _i in 0..MAX_RETRIES {
        jt_check(j);
        match j.enqueue(Some(&r), Some(&meta)) {
            Ok(()) => return Ok(()),
            Err(FtlError::Recover) => recover(j),
            Err(e) => return Err(e),
        }
    }
    Err(FtlError::TooBad)
}

/// Enqueue pages with ids counting up from `start`. Returns the number
/// enqueued before the journal filled up.
pub fn jt_enqueue_sequence(j: &mut SimJournal, start: usize, count: Pages) -> usize {
    let count: usize = match count {
        Pages::All => (j.num_blocks() << j.log2_ppb()) as usize,
        Pages::Count(count) => count,
    };

    for i in 0..count {
        let mut meta = [0u8; META_SIZE];

        match enqueue(j, (start + i) as u32) {
            Ok(()) => (),
            Err(FtlError::JournalFull) => return i,
            Err(e) => panic!("enqueue {:?} i = {}", e, i),
        }

        assert!(j.size() >= i as u32);
        let root = j.root();

        j.read_meta(root, &mut meta).expect("read meta");
        assert_eq!(meta_get_id(&meta), (start + i) as u32);
    }
    count
}

pub fn jt_dequeue_sequence(j: &mut SimJournal, next: usize, count: usize) {
    let mut count = count;
    let mut next = next;
    // To track garbage collection.
    let max_garbage: usize = 1 << j.log2_ppc();
    let mut garbage_count: usize = 0;

    while count > 0 {
        let mut meta = [0u8; META_SIZE];
        let tail = j.peek();

        assert_ne!(tail, PAGE_NONE);

        jt_check(j);
        j.read_meta(tail, &mut meta).expect("read meta");

        jt_check(j);
        j.dequeue();
        let id = meta_get_id(&meta);

        if id == PAGE_NONE {
            garbage_count += 1;
            assert!(garbage_count < max_garbage);
        } else {
            let mut r = [0u8; PAGE_SIZE];

            assert_eq!(id as usize, next);
            garbage_count = 0;
            next += 1;
            count -= 1;
            j.nand_mut().read(tail, 0, PAGE_SIZE, &mut r).expect("nand_read");

            seq_assert(id as u64, &r);
        }

        jt_check(j);
    }
}
