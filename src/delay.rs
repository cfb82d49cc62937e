use std::thread;
use std::time::{Duration, Instant};

/// Clock used while waiting for the chip. Injected so tests can run
/// without real delays.
pub trait Delay {
    /// Busy-wait for the given number of microseconds.
    fn delay_us(&mut self, us: u32);

    /// Give the processor to other threads between status polls.
    fn yield_now(&mut self);
}

/// Delay on the host using the standard clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay_us(&mut self, us: u32) {
        let until = Instant::now() + Duration::from_micros(us as u64);
        while Instant::now() < until {
            std::hint::spin_loop();
        }
    }

    fn yield_now(&mut self) {
        thread::sleep(Duration::from_micros(1));
    }
}

/// Delay that never waits, for chips that complete instantly.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoDelay;

impl Delay for NoDelay {
    fn delay_us(&mut self, _us: u32) {}
    fn yield_now(&mut self) {}
}
