//! ARM64 exception frame.

use crate::arch::EntryPoint;

/// EL0t: user mode with SP_EL0
pub const SPSR_EL0T: u64 = 0b0000;
/// EL1h: kernel mode with SP_EL1, DAIF clear so IRQs stay enabled
pub const SPSR_EL1H: u64 = 0b0101;
/// Mask of the M[3:0] mode field
pub const SPSR_MODE_MASK: u64 = 0b1111;

/// x0-x30, the interrupted SP, ELR/SPSR, and the FP control/status pair.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct A64Frame {
    pub x: [u64; 31],
    pub sp: u64,
    pub elr: u64,
    pub spsr: u64,
    pub fpcr: u64,
    pub fpsr: u64,
}

impl A64Frame {
    pub fn new_thread(entry: &EntryPoint) -> Self {
        let mut frame = Self {
            elr: entry.ip,
            sp: entry.sp,
            spsr: if entry.user { SPSR_EL0T } else { SPSR_EL1H },
            ..Self::default()
        };
        frame.x[0] = entry.arg;
        // Returning from the entry function lands on the exit stub
        frame.x[30] = entry.return_address;
        frame
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        self.spsr & SPSR_MODE_MASK == SPSR_EL0T
    }

    pub fn clear_call_arguments(&mut self) {
        for reg in &mut self.x[1..8] {
            *reg = 0;
        }
    }
}
