//! x86_64 trap frame as pushed by the interrupt entry stubs.

use crate::arch::EntryPoint;

/// Kernel code segment selector (GDT index 1, RPL 0)
pub const KERNEL_CS: u64 = 0x08;
/// Kernel data segment selector
pub const KERNEL_SS: u64 = 0x10;
/// User code segment selector (RPL 3)
pub const USER_CS: u64 = 0x33;
/// User data segment selector (RPL 3)
pub const USER_SS: u64 = 0x2B;

/// Bit 1 of RFLAGS always reads as one
pub const RFLAGS_RESERVED: u64 = 1 << 1;
/// Interrupt enable flag
pub const RFLAGS_IF: u64 = 1 << 9;
/// CPUID-available flag, set so user code can query features
pub const RFLAGS_ID: u64 = 1 << 21;

/// General purpose registers in push order, then the hardware frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct X64Frame {
    pub r15: u64,
    pub r14: u64,
    pub r13: u64,
    pub r12: u64,
    pub r11: u64,
    pub r10: u64,
    pub r9: u64,
    pub r8: u64,
    pub rbp: u64,
    pub rdi: u64,
    pub rsi: u64,
    pub rdx: u64,
    pub rcx: u64,
    pub rbx: u64,
    pub rax: u64,
    pub interrupt_number: u64,
    pub error_code: u64,
    pub rip: u64,
    pub cs: u64,
    pub rflags: u64,
    pub rsp: u64,
    pub ss: u64,
}

impl X64Frame {
    pub fn new_thread(entry: &EntryPoint) -> Self {
        let (cs, ss) = if entry.user {
            (USER_CS, USER_SS)
        } else {
            (KERNEL_CS, KERNEL_SS)
        };
        Self {
            rip: entry.ip,
            rsp: entry.sp,
            rdi: entry.arg,
            cs,
            ss,
            rflags: RFLAGS_RESERVED | RFLAGS_IF | RFLAGS_ID,
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }

    /// Zero the System V argument registers after the first
    pub fn clear_call_arguments(&mut self) {
        self.rsi = 0;
        self.rdx = 0;
        self.rcx = 0;
        self.r8 = 0;
        self.r9 = 0;
    }
}
