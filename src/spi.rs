// Byte level command driver for SPI NAND chips. No policy lives here:
// every method is one or two bus transactions, and chip reported
// failures are left in the returned status for the adapter to judge.

use std::fmt::Debug;

use crate::command::*;
use crate::delay::Delay;
use crate::status::Status;

/// One SPI transaction: an opcode, an optional address phase, dummy
/// clocks, then data out (`mosi`) followed by data in (`miso`).
pub struct Transaction<'a> {
    pub command: u8,
    pub address: u32,
    /// Number of address bytes sent, most significant first. 0 to 3.
    pub address_bytes: u8,
    pub dummy_bits: u8,
    pub mosi: &'a [u8],
    pub miso: &'a mut [u8],
}

impl<'a> Transaction<'a> {
    pub fn command(command: u8) -> Self {
        Transaction {
            command,
            address: 0,
            address_bytes: 0,
            dummy_bits: 0,
            mosi: &[],
            miso: &mut [],
        }
    }

    pub fn address(mut self, address: u32, bytes: u8) -> Self {
        self.address = address;
        self.address_bytes = bytes;
        self
    }

    pub fn dummy(mut self, bits: u8) -> Self {
        self.dummy_bits = bits;
        self
    }

    pub fn write(mut self, data: &'a [u8]) -> Self {
        self.mosi = data;
        self
    }

    pub fn read(mut self, data: &'a mut [u8]) -> Self {
        self.miso = data;
        self
    }
}

/// A SPI bus with the NAND chip selected. Transactions are executed one
/// at a time; the bus owns chip select framing.
pub trait SpiBus {
    type Error: Debug;

    fn transfer(&mut self, t: &mut Transaction) -> Result<(), Self::Error>;
}

pub struct SpiNand<B: SpiBus, D: Delay> {
    bus: B,
    delay: D,
    spin_threshold_us: u32,
}

impl<B: SpiBus, D: Delay> SpiNand<B, D> {
    pub fn new(bus: B, delay: D, spin_threshold_us: u32) -> Self {
        SpiNand { bus, delay, spin_threshold_us }
    }

    pub fn read_register(&mut self, reg: u8) -> Result<u8, B::Error> {
        let mut val = [0u8; 1];
        self.bus.transfer(&mut Transaction::command(READ_REGISTER).address(reg as u32, 1).read(&mut val))?;
        Ok(val[0])
    }

    pub fn write_register(&mut self, reg: u8, val: u8) -> Result<(), B::Error> {
        let data = [val];
        self.bus.transfer(&mut Transaction::command(SET_REGISTER).address(reg as u32, 1).write(&data))
    }

    pub fn write_enable(&mut self) -> Result<(), B::Error> {
        self.bus.transfer(&mut Transaction::command(WRITE_ENABLE))
    }

    /// Manufacturer id followed by two device id bytes.
    pub fn read_id(&mut self) -> Result<[u8; 3], B::Error> {
        let mut id = [0u8; 3];
        self.bus.transfer(&mut Transaction::command(READ_ID).dummy(8).read(&mut id))?;
        Ok(id)
    }

    /// Latch `page` into the chip's cache. Poll with `wait_for_ready`.
    pub fn read_page(&mut self, page: u32) -> Result<(), B::Error> {
        self.bus.transfer(&mut Transaction::command(PAGE_READ).address(page, 3))
    }

    /// Stream `data.len()` bytes from the cache starting at `column`. The
    /// column may extend into the spare area.
    pub fn read(&mut self, column: u16, data: &mut [u8]) -> Result<(), B::Error> {
        self.bus.transfer(&mut Transaction::command(READ_FAST).address(column as u32, 2).dummy(8).read(data))
    }

    /// Load `data` into the cache at `column`, leaving the rest of the
    /// cache as it is. May be called several times before executing.
    pub fn program_load(&mut self, column: u16, data: &[u8]) -> Result<(), B::Error> {
        self.bus.transfer(&mut Transaction::command(PROGRAM_LOAD).address(column as u32, 2).write(data))
    }

    pub fn program_execute(&mut self, page: u32) -> Result<(), B::Error> {
        self.bus.transfer(&mut Transaction::command(PROGRAM_EXECUTE).address(page, 3))
    }

    /// Erase the block containing `page`.
    pub fn erase_block(&mut self, page: u32) -> Result<(), B::Error> {
        self.bus.transfer(&mut Transaction::command(ERASE_BLOCK).address(page, 3))
    }

    pub fn status(&mut self) -> Result<Status, B::Error> {
        self.read_register(REG_STATUS).map(Status::from)
    }

    /// Poll until the chip is idle and return the final status. Short
    /// operations are waited out with a spin delay first; long ones
    /// yield the thread between polls.
    pub fn wait_for_ready(&mut self, expected_us: u32) -> Result<Status, B::Error> {
        let spin = expected_us < self.spin_threshold_us;
        if spin {
            self.delay.delay_us(expected_us);
        }

        loop {
            let status = self.status()?;
            if !status.busy() {
                return Ok(status);
            }
            if !spin {
                self.delay.yield_now();
            }
        }
    }

    pub fn release(self) -> B {
        self.bus
    }
}
