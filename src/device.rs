// The device handle: one SPI NAND chip presented as an array of
// sectors. Every entry point takes the device lock, so a `Device` can
// be shared between threads.

use std::sync::{Mutex, MutexGuard};

use log::{info, warn};

use crate::adapter::SpiNandAdapter;
use crate::chip::ChipInfo;
use crate::command::{CONFIG_ECC_ENABLE, REG_CONFIG, REG_PROTECT};
use crate::config::DeviceConfig;
use crate::delay::Delay;
use crate::error::{DeviceError, FtlError};
use crate::map::{Sector, SectorMap};
use crate::nand::Nand;
use crate::spi::{SpiBus, SpiNand};

type Map<B, D> = SectorMap<SpiNandAdapter<B, D>>;

pub struct Device<B: SpiBus, D: Delay> {
    map: Mutex<Map<B, D>>,
    chip: ChipInfo,
}

impl<B: SpiBus, D: Delay> Device<B, D> {
    /// Identify the chip on `bus`, unlock it, enable on-chip ECC and load
    /// the sector map stored on it. A chip without a valid map starts
    /// out empty.
    pub fn init(bus: B, delay: D, config: DeviceConfig) -> Result<Self, DeviceError> {
        let mut driver = SpiNand::new(bus, delay, config.spin_threshold_us);

        let id = driver.read_id().map_err(|_| DeviceError::Transport)?;
        let chip = ChipInfo::identify(id)?;
        info!(
            "spi nand: {:?} device {:#06x}, {} blocks of {} pages of {} bytes",
            chip.vendor,
            chip.device_id,
            chip.num_blocks,
            chip.pages_per_block(),
            chip.page_size()
        );

        driver.write_register(REG_PROTECT, 0).map_err(|_| DeviceError::Transport)?;
        let cfg = driver.read_register(REG_CONFIG).map_err(|_| DeviceError::Transport)?;
        driver
            .write_register(REG_CONFIG, cfg | CONFIG_ECC_ENABLE)
            .map_err(|_| DeviceError::Transport)?;

        let adapter = SpiNandAdapter::new(driver, chip);
        let page_buf = vec![0xFFu8; chip.page_size()];
        let mut map = SectorMap::new(adapter, page_buf, config.gc_factor);

        match map.resume() {
            Ok(()) => info!("spi nand: resumed map, {} of {} sectors in use", map.size(), map.capacity()),
            Err(FtlError::Transport) => return Err(DeviceError::Transport),
            Err(e) => warn!("spi nand: no map found ({}), starting empty", e),
        }

        Ok(Device { map: Mutex::new(map), chip })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Map<B, D>>, DeviceError> {
        self.map.lock().map_err(|_| DeviceError::Poisoned)
    }

    fn check_sector(&self, map: &Map<B, D>, sector: Sector) -> Result<(), DeviceError> {
        let capacity = map.capacity();
        if sector >= capacity {
            return Err(DeviceError::OutOfRange { sector, capacity });
        }
        Ok(())
    }

    fn check_buffer(&self, len: usize) -> Result<(), DeviceError> {
        let expected = self.chip.page_size();
        if len != expected {
            return Err(DeviceError::BufferSize { len, expected });
        }
        Ok(())
    }

    /// Read one sector. Sectors that were never written read as 0xff.
    pub fn read_sector(&self, sector: Sector, buf: &mut [u8]) -> Result<(), DeviceError> {
        self.check_buffer(buf.len())?;
        let mut map = self.lock()?;
        self.check_sector(&map, sector)?;

        map.read(sector, buf).map_err(|e| DeviceError::from_read(e, sector))?;

        // Data that only just survived ECC is moved somewhere fresh.
        // Unmapped sectors never raise the hint.
        if map.journal_mut().nand_mut().take_refresh_hint() {
            warn!("spi nand: sector {} needed heavy ECC correction, rewriting", sector);
            if let Err(e) = map.write(sector, buf) {
                warn!("spi nand: refresh of sector {} failed: {}", sector, e);
            }
        }
        Ok(())
    }

    /// Write one sector. The data is durable after the next `sync`, or
    /// once enough further writes have filled the current checkpoint.
    pub fn write_sector(&self, sector: Sector, data: &[u8]) -> Result<(), DeviceError> {
        self.check_buffer(data.len())?;
        let mut map = self.lock()?;
        self.check_sector(&map, sector)?;

        map.write(sector, data).map_err(DeviceError::from_write)
    }

    /// Copy `src` to `dst` without passing the data through the host.
    pub fn copy_sector(&self, src: Sector, dst: Sector) -> Result<(), DeviceError> {
        let mut map = self.lock()?;
        self.check_sector(&map, src)?;
        self.check_sector(&map, dst)?;

        map.copy_sector(src, dst).map_err(|e| match e {
            FtlError::Ecc => DeviceError::Unreadable { sector: src },
            e => DeviceError::from_write(e),
        })
    }

    /// Discard the contents of a sector. It reads as 0xff afterwards.
    pub fn trim(&self, sector: Sector) -> Result<(), DeviceError> {
        let mut map = self.lock()?;
        self.check_sector(&map, sector)?;

        map.trim(sector).map_err(DeviceError::from_write)
    }

    /// Make every completed write durable.
    pub fn sync(&self) -> Result<(), DeviceError> {
        self.lock()?.sync().map_err(DeviceError::from_write)
    }

    /// Run one garbage collection step ahead of need.
    pub fn gc(&self) -> Result<(), DeviceError> {
        self.lock()?.gc().map_err(DeviceError::from_write)
    }

    /// Erase every block on the chip and start over with an empty map.
    /// Blocks that fail to erase are left as they are.
    pub fn erase_chip(&self) -> Result<(), DeviceError> {
        let mut map = self.lock()?;
        warn!("spi nand: erasing chip");

        let mut failed = 0;
        {
            let nand = map.journal_mut().nand_mut();
            for blk in 0..nand.num_blocks() {
                match nand.erase(blk) {
                    Ok(()) => (),
                    Err(FtlError::BadBlock) => failed += 1,
                    Err(_) => return Err(DeviceError::Transport),
                }
            }
        }
        if failed > 0 {
            warn!("spi nand: {} blocks failed to erase", failed);
        }

        map.clear();
        Ok(())
    }

    /// Number of sectors.
    pub fn capacity(&self) -> Result<Sector, DeviceError> {
        Ok(self.lock()?.capacity())
    }

    /// Number of sectors currently holding data.
    pub fn used_sectors(&self) -> Result<Sector, DeviceError> {
        Ok(self.lock()?.size())
    }

    pub fn sector_size(&self) -> usize {
        self.chip.page_size()
    }

    pub fn block_size(&self) -> usize {
        self.chip.page_size() << self.chip.log2_ppb
    }

    pub fn block_count(&self) -> u32 {
        self.chip.num_blocks
    }

    pub fn page_count(&self) -> u32 {
        self.chip.page_count()
    }

    pub fn chip(&self) -> &ChipInfo {
        &self.chip
    }

    /// Sectors whose data was lost to ECC failures during garbage
    /// collection since the last call.
    pub fn take_lost_sectors(&self) -> Result<Vec<Sector>, DeviceError> {
        Ok(self.lock()?.take_lost_sectors())
    }

    /// Close the device and hand back the bus. Unsynced writes may be
    /// lost; call `sync` first.
    pub fn deinit(self) -> B {
        let map = self.map.into_inner().unwrap_or_else(|e| e.into_inner());
        map.into_nand().release()
    }
}
