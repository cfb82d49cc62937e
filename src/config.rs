/// Settings for [`crate::Device::init`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Garbage collection ratio. Higher values reserve less of the chip
    /// for collection, giving more capacity but slower writes once the
    /// chip fills. 0 is treated as 1.
    pub gc_factor: u8,

    /// Operations expected to finish sooner than this are waited out
    /// with a busy delay; longer ones yield the thread while polling.
    pub spin_threshold_us: u32,
}

pub const DEFAULT_GC_FACTOR: u8 = 45;
pub const DEFAULT_SPIN_THRESHOLD_US: u32 = 1000;

impl Default for DeviceConfig {
    fn default() -> Self {
        DeviceConfig {
            gc_factor: DEFAULT_GC_FACTOR,
            spin_threshold_us: DEFAULT_SPIN_THRESHOLD_US,
        }
    }
}

impl DeviceConfig {
    pub fn with_gc_factor(mut self, gc_factor: u8) -> Self {
        self.gc_factor = gc_factor;
        self
    }

    pub fn with_spin_threshold_us(mut self, us: u32) -> Self {
        self.spin_threshold_us = us;
        self
    }
}
