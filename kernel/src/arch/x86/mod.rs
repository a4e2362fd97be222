//! 32-bit x86 trap frame.
//!
//! Layout follows `pusha` plus the four data segments, then the hardware
//! frame. A ring 0 trap does not push ESP/SS but the entry stub fills them
//! so every frame has the same shape.

use crate::arch::EntryPoint;

pub const KERNEL_CS: u32 = 0x08;
pub const KERNEL_DS: u32 = 0x10;
pub const USER_CS: u32 = 0x1B;
pub const USER_DS: u32 = 0x23;

pub const EFLAGS_RESERVED: u32 = 1 << 1;
pub const EFLAGS_IF: u32 = 1 << 9;
pub const EFLAGS_ID: u32 = 1 << 21;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct X32Frame {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub esp_at_pusha: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
    pub gs: u32,
    pub fs: u32,
    pub es: u32,
    pub ds: u32,
    pub interrupt_number: u32,
    pub error_code: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
    pub _reserved: u32,
}

impl X32Frame {
    /// Arguments travel on the stack on i386, so `entry.arg` is ignored here
    pub fn new_thread(entry: &EntryPoint) -> Self {
        let (cs, ds) = if entry.user {
            (USER_CS, USER_DS)
        } else {
            (KERNEL_CS, KERNEL_DS)
        };
        Self {
            eip: entry.ip as u32,
            esp: entry.sp as u32,
            cs,
            ss: ds,
            ds,
            es: ds,
            fs: ds,
            gs: ds,
            eflags: EFLAGS_RESERVED | EFLAGS_IF | EFLAGS_ID,
            ..Self::default()
        }
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        self.cs & 3 == 3
    }

    pub fn clear_call_arguments(&mut self) {
        self.eax = 0;
        self.ecx = 0;
        self.edx = 0;
    }
}
