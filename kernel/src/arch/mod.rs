//! Architecture abstraction for the tasking core.
//!
//! The architecture is chosen once at boot and stored as an [`Architecture`]
//! value; trap frames are a closed [`TrapFrame`] variant set. The scheduler
//! copies frames and touches only the documented fields (instruction and
//! stack pointer, first argument, privilege), never anything else.
//!
//! # Supported Architectures
//!
//! - `x86_64`: [`X64Frame`], hardware [`CpuOps`] in `x86_64::cpu`
//! - `x86` (32-bit): [`X32Frame`]
//! - `aarch64`: [`A64Frame`]

pub mod aarch64;
pub mod traits;
pub mod x86;
pub mod x86_64;

pub use self::aarch64::A64Frame;
pub use self::traits::*;
pub use self::x86::X32Frame;
pub use self::x86_64::X64Frame;

/// Size of a page handed out by [`PageAllocator`]
pub const PAGE_SIZE: u64 = 4096;

/// Plain integer records that may be viewed as raw bytes.
///
/// # Safety
///
/// Implementors must be `repr(C)`, contain only integers, and have no
/// padding, so every byte pattern is a valid value.
pub(crate) unsafe trait Plain: Copy + Default {
    fn as_bytes(&self) -> &[u8] {
        unsafe {
            core::slice::from_raw_parts(self as *const Self as *const u8, core::mem::size_of::<Self>())
        }
    }

    fn as_bytes_mut(&mut self) -> &mut [u8] {
        unsafe {
            core::slice::from_raw_parts_mut(self as *mut Self as *mut u8, core::mem::size_of::<Self>())
        }
    }
}

unsafe impl Plain for X64Frame {}
unsafe impl Plain for X32Frame {}
unsafe impl Plain for A64Frame {}
unsafe impl Plain for ThreadBases {}
unsafe impl Plain for FpuState {}

/// FXSAVE-format floating point and SIMD state
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct FpuState {
    pub bytes: [u8; 512],
}

impl FpuState {
    /// Power-on state: x87 control word 0x37F, MXCSR 0x1F80
    pub fn new() -> Self {
        let mut bytes = [0u8; 512];
        bytes[0..2].copy_from_slice(&0x037Fu16.to_le_bytes());
        bytes[24..28].copy_from_slice(&0x1F80u32.to_le_bytes());
        Self { bytes }
    }
}

impl Default for FpuState {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for FpuState {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("FpuState").finish_non_exhaustive()
    }
}

/// Where and how a new thread starts
#[derive(Debug, Clone, Copy, Default)]
pub struct EntryPoint {
    pub ip: u64,
    pub sp: u64,
    pub arg: u64,
    /// Where the entry function returns to (the thread exit stub)
    pub return_address: u64,
    pub user: bool,
}

/// The closed set of supported CPU architectures
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    X86_64,
    X86_32,
    Aarch64,
}

impl Architecture {
    /// Frame a new thread will be entered with
    pub fn new_frame(&self, entry: &EntryPoint) -> TrapFrame {
        match self {
            Architecture::X86_64 => TrapFrame::X86_64(X64Frame::new_thread(entry)),
            Architecture::X86_32 => TrapFrame::X86_32(X32Frame::new_thread(entry)),
            Architecture::Aarch64 => TrapFrame::Aarch64(A64Frame::new_thread(entry)),
        }
    }

    /// All-zero frame of this architecture
    pub fn empty_frame(&self) -> TrapFrame {
        match self {
            Architecture::X86_64 => TrapFrame::X86_64(X64Frame::default()),
            Architecture::X86_32 => TrapFrame::X86_32(X32Frame::default()),
            Architecture::Aarch64 => TrapFrame::Aarch64(A64Frame::default()),
        }
    }

    /// Copy the interrupted context into a thread's saved frame.
    ///
    /// Returns false, leaving `saved` untouched, if either frame belongs to
    /// another architecture.
    pub fn save_context(&self, live: &TrapFrame, saved: &mut TrapFrame) -> bool {
        if live.architecture() != *self || saved.architecture() != *self {
            log::error!("save_context: frame is not {:?}", self);
            return false;
        }
        *saved = *live;
        true
    }

    /// Load a thread's saved frame into the frame the trap return restores
    pub fn restore_context(&self, saved: &TrapFrame, live: &mut TrapFrame) -> bool {
        if live.architecture() != *self || saved.architecture() != *self {
            log::error!("restore_context: frame is not {:?}", self);
            return false;
        }
        *live = *saved;
        true
    }

    /// Bytes below the stack pointer a leaf function may use without moving it
    pub fn red_zone(&self) -> u64 {
        match self {
            Architecture::X86_32 => 0,
            Architecture::X86_64 | Architecture::Aarch64 => 128,
        }
    }

    pub fn word_size(&self) -> u64 {
        match self {
            Architecture::X86_32 => 4,
            Architecture::X86_64 | Architecture::Aarch64 => 8,
        }
    }

    /// Distance from the stack pointer at sigreturn to the saved signal block.
    ///
    /// The handler slot and the argument/alignment slot sit below the block;
    /// on i386 the trampoline already popped the handler slot.
    pub fn sigreturn_offset(&self) -> u64 {
        match self {
            Architecture::X86_32 => 12,
            Architecture::X86_64 | Architecture::Aarch64 => 16,
        }
    }
}

/// An interrupted register set, tagged with its architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapFrame {
    X86_64(X64Frame),
    X86_32(X32Frame),
    Aarch64(A64Frame),
}

impl TrapFrame {
    pub fn architecture(&self) -> Architecture {
        match self {
            TrapFrame::X86_64(_) => Architecture::X86_64,
            TrapFrame::X86_32(_) => Architecture::X86_32,
            TrapFrame::Aarch64(_) => Architecture::Aarch64,
        }
    }

    /// Returns the instruction pointer (RIP on x86, ELR on ARM).
    pub fn instruction_pointer(&self) -> u64 {
        match self {
            TrapFrame::X86_64(f) => f.rip,
            TrapFrame::X86_32(f) => f.eip as u64,
            TrapFrame::Aarch64(f) => f.elr,
        }
    }

    pub fn set_instruction_pointer(&mut self, addr: u64) {
        match self {
            TrapFrame::X86_64(f) => f.rip = addr,
            TrapFrame::X86_32(f) => f.eip = addr as u32,
            TrapFrame::Aarch64(f) => f.elr = addr,
        }
    }

    /// Returns the interrupted stack pointer.
    pub fn stack_pointer(&self) -> u64 {
        match self {
            TrapFrame::X86_64(f) => f.rsp,
            TrapFrame::X86_32(f) => f.esp as u64,
            TrapFrame::Aarch64(f) => f.sp,
        }
    }

    pub fn set_stack_pointer(&mut self, addr: u64) {
        match self {
            TrapFrame::X86_64(f) => f.rsp = addr,
            TrapFrame::X86_32(f) => f.esp = addr as u32,
            TrapFrame::Aarch64(f) => f.sp = addr,
        }
    }

    /// Set the first call argument register.
    ///
    /// i386 passes arguments on the stack; its first argument is written to
    /// memory by the caller and this is a no-op.
    pub fn set_argument(&mut self, value: u64) {
        match self {
            TrapFrame::X86_64(f) => f.rdi = value,
            TrapFrame::X86_32(_) => {}
            TrapFrame::Aarch64(f) => f.x[0] = value,
        }
    }

    /// Hand a native program its argc, argv, envp and envc in registers
    pub fn set_startup_registers(&mut self, argc: u64, argv: u64, envp: u64, envc: u64) {
        match self {
            TrapFrame::X86_64(f) => {
                f.rdi = argc;
                f.rsi = argv;
                f.rdx = envp;
                f.rcx = envc;
            }
            TrapFrame::X86_32(f) => {
                f.eax = argc as u32;
                f.ebx = argv as u32;
                f.edx = envp as u32;
                f.ecx = envc as u32;
            }
            TrapFrame::Aarch64(f) => {
                f.x[0] = argc;
                f.x[1] = argv;
                f.x[2] = envp;
                f.x[3] = envc;
            }
        }
    }

    pub fn clear_call_arguments(&mut self) {
        match self {
            TrapFrame::X86_64(f) => f.clear_call_arguments(),
            TrapFrame::X86_32(f) => f.clear_call_arguments(),
            TrapFrame::Aarch64(f) => f.clear_call_arguments(),
        }
    }

    /// Returns true if the interrupt came from userspace.
    pub fn is_user_mode(&self) -> bool {
        match self {
            TrapFrame::X86_64(f) => f.is_user(),
            TrapFrame::X86_32(f) => f.is_user(),
            TrapFrame::Aarch64(f) => f.is_user(),
        }
    }

    pub(crate) fn as_bytes(&self) -> &[u8] {
        match self {
            TrapFrame::X86_64(f) => f.as_bytes(),
            TrapFrame::X86_32(f) => f.as_bytes(),
            TrapFrame::Aarch64(f) => f.as_bytes(),
        }
    }

    pub(crate) fn as_bytes_mut(&mut self) -> &mut [u8] {
        match self {
            TrapFrame::X86_64(f) => f.as_bytes_mut(),
            TrapFrame::X86_32(f) => f.as_bytes_mut(),
            TrapFrame::Aarch64(f) => f.as_bytes_mut(),
        }
    }
}
