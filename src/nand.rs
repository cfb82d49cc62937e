// The capability interface between the flash translation layer and a
// NAND chip.

use crate::error::FtlError;

/// Each page in a NAND device is indexed, starting at 0. It's required
/// that there be a power-of-two number of pages in a eraseblock, so you can
/// view a page number is being a concatenation (in binary) of a block
/// number and the number of a page within a block.
pub type Page = u32;

/// Blocks are also indexed, starting at 0.
pub type Block = u32;

/// Each NAND chip must be represented by a structure that implements
/// this trait. These operations are the complete contract the journal
/// and sector map are allowed to depend on.
pub trait Nand {
    /// Get the base-2 logarithm of the page size. If your device supports
    /// partial programming, you may want to subdivide the actual
    /// pages into separate ECC-correctable regions and present those
    /// as pages.
    fn log2_page_size(&self) -> u8;

    /// Get the base-2 logarithm of the number of pages within an erase block.
    fn log2_ppb(&self) -> u8;

    /// Get the total number of erase blocks.
    fn num_blocks(&self) -> u32;

    /// Is the given block bad? Implementations that cannot tell must
    /// answer `true`.
    fn is_bad(&mut self, blk: Block) -> bool;

    /// Mark the given block as bad (or attempt to). No return value is
    /// required, because there's nothing that can be done in response.
    fn mark_bad(&mut self, blk: Block);

    /// Erase the given block. The status reported by the chip should
    /// be checked. If an erase operation fails, return
    /// `Err(FtlError::BadBlock)`.
    fn erase(&mut self, blk: Block) -> Result<(), FtlError>;

    /// Program the given page with a full page of data. If the operation
    /// fails, return `Err(FtlError::BadBlock)`. Pages will be programmed
    /// sequentially within a block, and will not be reprogrammed.
    fn prog(&mut self, page: Page, data: &[u8]) -> Result<(), FtlError>;

    /// Check that the given page is erased. Implementations that cannot
    /// tell must answer `false`.
    fn is_free(&mut self, page: Page) -> bool;

    /// Read `length` bytes of a page starting at `offset` into
    /// `data[..length]`. ECC must be handled by the NAND implementation:
    /// an uncorrectable error returns `Err(FtlError::Ecc)` and leaves
    /// `data` untouched.
    fn read(&mut self, page: Page, offset: usize, length: usize, data: &mut [u8]) -> Result<(), FtlError>;

    /// Read a page from one location and reprogram it in another location.
    /// This might be done using the chip's internal buffers, but it must use
    /// ECC.
    fn copy(&mut self, src: Page, dst: Page) -> Result<(), FtlError>;

    /// True if the most recent successful read needed so much ECC
    /// correction that the data should be rewritten elsewhere. Reading the
    /// hint clears it.
    fn take_refresh_hint(&mut self) -> bool {
        false
    }
}
