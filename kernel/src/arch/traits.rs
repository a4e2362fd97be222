//! Collaborator traits consumed by the tasking core.
//!
//! Everything the scheduler needs from the hardware, the memory manager and
//! the interrupt layer crosses one of these interfaces. They are object safe
//! so the scheduler can hold them as `Arc<dyn ...>` chosen at boot.

use alloc::sync::Arc;

use super::{FpuState, TrapFrame};

/// Thread-local base registers (FS/GS on x86, TPIDR on ARM)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct ThreadBases {
    pub fs: u64,
    pub gs: u64,
    pub shadow_gs: u64,
}

/// Handle to a page table root owned by the memory manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AddressSpace(pub u64);

/// A free that could not complete now and should be retried
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FreeError {
    /// The allocator's own bookkeeping is busy or exhausted
    Busy,
    /// The region is still mapped somewhere that cannot be torn down yet
    InUse,
}

/// A user or kernel memory access hit an unmapped or protected page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryFault {
    pub address: u64,
}

/// CPU-local operations of the executing core.
pub trait CpuOps: Send + Sync {
    /// Index of the executing core, `0..core_count`
    fn core_id(&self) -> usize;

    /// Returns true if interrupts are currently enabled.
    fn interrupts_enabled(&self) -> bool;

    /// Enable interrupts on the current CPU.
    ///
    /// # Safety
    ///
    /// Enabling interrupts may cause immediate interrupt handling.
    /// Caller must ensure the system is in a consistent state.
    unsafe fn enable_interrupts(&self);

    /// Disable interrupts on the current CPU.
    ///
    /// # Safety
    ///
    /// Disabling interrupts affects system responsiveness.
    unsafe fn disable_interrupts(&self);

    /// Halt until the next interrupt
    fn halt(&self);

    /// Raise the yield software interrupt, entering the scheduler synchronously
    fn raise_yield(&self);

    fn save_fpu(&self, state: &mut FpuState);
    fn restore_fpu(&self, state: &FpuState);

    fn thread_bases(&self) -> ThreadBases;
    fn set_thread_bases(&self, bases: &ThreadBases);

    /// Stack used on the next privilege transition into the kernel
    fn set_kernel_stack(&self, top: u64);
}

/// Monotonic time and the per-core one-shot timer.
pub trait TimerOps: Send + Sync {
    /// Monotonic nanoseconds since boot
    fn now_ns(&self) -> u64;

    /// Arm the core's timer to fire after `slice` scheduler quanta
    fn one_shot(&self, core: usize, slice: u32);
}

/// Kernel page allocator.
pub trait PageAllocator: Send + Sync {
    /// Allocate `count` contiguous kernel pages.
    ///
    /// Never returns on exhaustion: the allocator halts the system, since a
    /// kernel without stacks cannot continue.
    fn allocate_pages(&self, count: usize) -> u64;

    /// Release pages; an error means try again on a later cleanup pass.
    fn free_pages(&self, addr: u64, count: usize) -> Result<(), FreeError>;
}

/// Page-table management for process address spaces.
pub trait AddressSpaces: Send + Sync {
    /// New user address space with the kernel half mapped (halts on exhaustion)
    fn create(&self) -> AddressSpace;

    fn destroy(&self, space: AddressSpace) -> Result<(), FreeError>;

    /// Switch the executing core to `space`; `None` selects the kernel tables
    fn activate(&self, space: Option<AddressSpace>);

    /// Map `count` fresh user pages, returning their base (halts on exhaustion)
    fn map_user_pages(&self, space: AddressSpace, count: usize) -> u64;

    fn unmap_user_pages(&self, space: AddressSpace, addr: u64, count: usize) -> Result<(), FreeError>;
}

/// Byte access to memory of a given address space (`None` = kernel).
pub trait UserMemory: Send + Sync {
    fn write(&self, space: Option<AddressSpace>, addr: u64, bytes: &[u8]) -> Result<(), MemoryFault>;
    fn read(&self, space: Option<AddressSpace>, addr: u64, out: &mut [u8]) -> Result<(), MemoryFault>;
}

/// Something an interrupt vector can be bound to.
pub trait InterruptHandler: Send + Sync {
    /// Handle the interrupt; the frame is restored on return
    fn handle(&self, frame: &mut TrapFrame);
}

/// Vector registration, used once at boot.
pub trait InterruptRegistrar {
    /// Bind `handler` to `vector`. Returns false if the vector is taken.
    fn register(&mut self, vector: u8, handler: Arc<dyn InterruptHandler>) -> bool;
}

/// The set of collaborators a scheduler is constructed with
#[derive(Clone)]
pub struct Platform {
    pub cpu: Arc<dyn CpuOps>,
    pub timer: Arc<dyn TimerOps>,
    pub pages: Arc<dyn PageAllocator>,
    pub spaces: Arc<dyn AddressSpaces>,
    pub memory: Arc<dyn UserMemory>,
}
