//! x86_64 CPU operations.
//!
//! Implements [`CpuOps`] with the `x86_64` crate. The core id is read from
//! IA32_TSC_AUX, which the SMP bring-up code loads with each core's index.

use core::arch::asm;

use x86_64::instructions::{self, interrupts};
use x86_64::registers::model_specific::Msr;

use crate::arch::{CpuOps, FpuState, ThreadBases};

/// MSR holding this core's index
const IA32_TSC_AUX: u32 = 0xC000_0103;
const IA32_FS_BASE: u32 = 0xC000_0100;
const IA32_GS_BASE: u32 = 0xC000_0101;
const IA32_KERNEL_GS_BASE: u32 = 0xC000_0102;

/// x86_64 CPU operations implementation.
pub struct X86Cpu {
    /// Writes RSP0 of the executing core's TSS
    set_rsp0: fn(u64),
}

impl X86Cpu {
    pub const fn new(set_rsp0: fn(u64)) -> Self {
        Self { set_rsp0 }
    }
}

impl CpuOps for X86Cpu {
    fn core_id(&self) -> usize {
        unsafe { Msr::new(IA32_TSC_AUX).read() as usize }
    }

    #[inline(always)]
    fn interrupts_enabled(&self) -> bool {
        interrupts::are_enabled()
    }

    #[inline(always)]
    unsafe fn enable_interrupts(&self) {
        interrupts::enable();
    }

    #[inline(always)]
    unsafe fn disable_interrupts(&self) {
        interrupts::disable();
    }

    #[inline(always)]
    fn halt(&self) {
        instructions::hlt();
    }

    fn raise_yield(&self) {
        // Must match TaskingConfig::yield_vector
        unsafe {
            asm!("int 0x30", options(nomem, nostack));
        }
    }

    fn save_fpu(&self, state: &mut FpuState) {
        unsafe {
            asm!("fxsave64 [{}]", in(reg) state.bytes.as_mut_ptr(), options(nostack));
        }
    }

    fn restore_fpu(&self, state: &FpuState) {
        unsafe {
            asm!("fxrstor64 [{}]", in(reg) state.bytes.as_ptr(), options(nostack, readonly));
        }
    }

    fn thread_bases(&self) -> ThreadBases {
        unsafe {
            ThreadBases {
                fs: Msr::new(IA32_FS_BASE).read(),
                gs: Msr::new(IA32_GS_BASE).read(),
                shadow_gs: Msr::new(IA32_KERNEL_GS_BASE).read(),
            }
        }
    }

    fn set_thread_bases(&self, bases: &ThreadBases) {
        unsafe {
            Msr::new(IA32_FS_BASE).write(bases.fs);
            Msr::new(IA32_GS_BASE).write(bases.gs);
            Msr::new(IA32_KERNEL_GS_BASE).write(bases.shadow_gs);
        }
    }

    fn set_kernel_stack(&self, top: u64) {
        (self.set_rsp0)(top);
    }
}
