use bitfield::bitfield;

bitfield! {
    /// Contents of the status register (0xC0).
    #[derive(Clone, Copy, PartialEq, Eq, Default)]
    pub struct Status(u8);
    impl Debug;
    pub busy, set_busy: 0;
    pub write_enabled, set_write_enabled: 1;
    pub erase_failed, set_erase_failed: 2;
    pub program_failed, set_program_failed: 3;
    pub u8, ecc, set_ecc: 5, 4;
}

/// Outcome of on-chip ECC for the last page read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EccState {
    Clean,
    Corrected,
    Uncorrectable,
    /// Corrected, but at the limit of the code's strength.
    Marginal,
}

impl Status {
    pub fn ecc_state(&self) -> EccState {
        match self.ecc() {
            0b00 => EccState::Clean,
            0b01 => EccState::Corrected,
            0b10 => EccState::Uncorrectable,
            _ => EccState::Marginal,
        }
    }
}

impl From<u8> for Status {
    fn from(v: u8) -> Self {
        Status(v)
    }
}

impl From<Status> for u8 {
    fn from(s: Status) -> Self {
        s.0
    }
}
