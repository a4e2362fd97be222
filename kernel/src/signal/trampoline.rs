//! Signal trampoline for returning from signal handlers
//!
//! Delivery leaves the handler address in the lowest stack slot and points
//! the instruction pointer here. The trampoline calls the handler, then
//! issues the sigreturn syscall that restores the pre-signal context. The
//! code is generated per process because the syscall number depends on the
//! process's compatibility mode.

use crate::arch::Architecture;

/// Largest trampoline of any architecture
pub const TRAMPOLINE_MAX: usize = 20;

/// Machine code for one (architecture, sigreturn number) pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Trampoline {
    code: [u8; TRAMPOLINE_MAX],
    len: usize,
}

impl Trampoline {
    pub fn build(arch: Architecture, sigreturn: u64) -> Self {
        let mut t = Trampoline {
            code: [0; TRAMPOLINE_MAX],
            len: 0,
        };
        let nr = sigreturn as u32;
        match arch {
            // =================================================================
            // x86_64
            // =================================================================
            Architecture::X86_64 => {
                t.emit(&[0x48, 0x8B, 0x04, 0x24]); // mov rax, [rsp]
                t.emit(&[0xFF, 0xD0]); // call rax
                t.emit(&[0x48, 0xC7, 0xC0]); // mov rax, imm32
                t.emit(&nr.to_le_bytes());
                t.emit(&[0x0F, 0x05]); // syscall
                t.emit(&[0x0F, 0x0B]); // ud2 (should never reach here)
            }
            // =================================================================
            // i386
            // =================================================================
            Architecture::X86_32 => {
                t.emit(&[0x58]); // pop eax
                t.emit(&[0xFF, 0xD0]); // call eax
                t.emit(&[0xB8]); // mov eax, imm32
                t.emit(&nr.to_le_bytes());
                t.emit(&[0xCD, 0x80]); // int 0x80
                t.emit(&[0x0F, 0x0B]); // ud2
            }
            // =================================================================
            // ARM64 (little-endian)
            // =================================================================
            Architecture::Aarch64 => {
                t.emit(&0xF940_03E9u32.to_le_bytes()); // ldr x9, [sp]
                t.emit(&0xD63F_0120u32.to_le_bytes()); // blr x9
                let mov_x8 = 0xD280_0008u32 | ((nr & 0xFFFF) << 5); // movz x8, #nr
                t.emit(&mov_x8.to_le_bytes());
                t.emit(&0xD400_0001u32.to_le_bytes()); // svc #0
                t.emit(&0xD420_0020u32.to_le_bytes()); // brk #1
            }
        }
        t
    }

    fn emit(&mut self, bytes: &[u8]) {
        self.code[self.len..self.len + bytes.len()].copy_from_slice(bytes);
        self.len += bytes.len();
    }

    pub fn bytes(&self) -> &[u8] {
        &self.code[..self.len]
    }
}
