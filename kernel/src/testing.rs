//! Host-side collaborators for unit tests.
//!
//! Every hardware and memory-manager interface the scheduler consumes has a
//! mock here that records what it was asked to do. [`TestKernel`] boots a
//! scheduler over a full set of them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::vec::Vec;

use crate::arch::{
    AddressSpace, AddressSpaces, Architecture, CpuOps, EntryPoint, FpuState, FreeError, InterruptHandler,
    InterruptRegistrar, MemoryFault, PageAllocator, Platform, ThreadBases, TimerOps, TrapFrame, UserMemory,
    PAGE_SIZE,
};
use crate::config::{BootEntries, ProcessLimits, TaskingConfig};
use crate::process::process::PcbParts;
use crate::process::{Credentials, Pcb, DEFAULT_UMASK};
use crate::task::info::{CoreAffinity, ExecutionMode, TaskArchitecture, TaskCompatibility, TaskInfo, TaskPriority};
use crate::task::stack::Stack;
use crate::task::thread::{Tcb, TcbParts};
use crate::task::{Pid, Scheduler, TaskStatus, Tid};

// =============================================================================
// CPU
// =============================================================================

type YieldHook = Arc<dyn Fn() + Send + Sync>;

pub struct MockCpu {
    core: AtomicUsize,
    interrupts: AtomicBool,
    /// FPU contents "loaded" on the core
    fpu: Mutex<FpuState>,
    bases: Mutex<ThreadBases>,
    kernel_stack: AtomicU64,
    yields: AtomicUsize,
    yield_hook: Mutex<Option<YieldHook>>,
}

impl MockCpu {
    pub fn new(core: usize) -> Self {
        Self {
            core: AtomicUsize::new(core),
            interrupts: AtomicBool::new(false),
            fpu: Mutex::new(FpuState::new()),
            bases: Mutex::new(ThreadBases::default()),
            kernel_stack: AtomicU64::new(0),
            yields: AtomicUsize::new(0),
            yield_hook: Mutex::new(None),
        }
    }

    pub fn set_core(&self, core: usize) {
        self.core.store(core, Ordering::SeqCst);
    }

    /// Run `hook` whenever the scheduler raises the yield interrupt
    pub fn set_yield_hook(&self, hook: Box<dyn Fn() + Send + Sync>) {
        *self.yield_hook.lock().unwrap() = Some(Arc::from(hook));
    }

    pub fn clear_yield_hook(&self) {
        *self.yield_hook.lock().unwrap() = None;
    }

    pub fn yields(&self) -> usize {
        self.yields.load(Ordering::SeqCst)
    }

    /// Tag the live FPU state so a save can be recognised later
    pub fn tag_fpu(&self, tag: u8) {
        self.fpu.lock().unwrap().bytes[511] = tag;
    }

    pub fn fpu_tag(&self) -> u8 {
        self.fpu.lock().unwrap().bytes[511]
    }

    pub fn kernel_stack(&self) -> u64 {
        self.kernel_stack.load(Ordering::SeqCst)
    }
}

impl CpuOps for MockCpu {
    fn core_id(&self) -> usize {
        self.core.load(Ordering::SeqCst)
    }

    fn interrupts_enabled(&self) -> bool {
        self.interrupts.load(Ordering::SeqCst)
    }

    unsafe fn enable_interrupts(&self) {
        self.interrupts.store(true, Ordering::SeqCst);
    }

    unsafe fn disable_interrupts(&self) {
        self.interrupts.store(false, Ordering::SeqCst);
    }

    fn halt(&self) {}

    fn raise_yield(&self) {
        self.yields.fetch_add(1, Ordering::SeqCst);
        let hook = self.yield_hook.lock().unwrap().clone();
        if let Some(hook) = hook {
            hook();
        }
    }

    fn save_fpu(&self, state: &mut FpuState) {
        *state = *self.fpu.lock().unwrap();
    }

    fn restore_fpu(&self, state: &FpuState) {
        *self.fpu.lock().unwrap() = *state;
    }

    fn thread_bases(&self) -> ThreadBases {
        *self.bases.lock().unwrap()
    }

    fn set_thread_bases(&self, bases: &ThreadBases) {
        *self.bases.lock().unwrap() = *bases;
    }

    fn set_kernel_stack(&self, top: u64) {
        self.kernel_stack.store(top, Ordering::SeqCst);
    }
}

// =============================================================================
// Clock
// =============================================================================

#[derive(Default)]
pub struct MockClock {
    now: AtomicU64,
    one_shots: Mutex<Vec<(usize, u32)>>,
}

impl MockClock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now.fetch_add(ms * 1_000_000, Ordering::SeqCst);
    }

    pub fn now_ms(&self) -> u64 {
        self.now.load(Ordering::SeqCst) / 1_000_000
    }

    /// Every one-shot armed so far, as (core, slice)
    pub fn one_shots(&self) -> Vec<(usize, u32)> {
        self.one_shots.lock().unwrap().clone()
    }
}

impl TimerOps for MockClock {
    fn now_ns(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn one_shot(&self, core: usize, slice: u32) {
        self.one_shots.lock().unwrap().push((core, slice));
    }
}

// =============================================================================
// Page allocator
// =============================================================================

/// Bump allocator that counts outstanding pages
pub struct MockPages {
    next: AtomicU64,
    outstanding: AtomicUsize,
    refuse_frees: AtomicBool,
    freed: Mutex<Vec<(u64, usize)>>,
}

impl MockPages {
    pub fn new() -> Self {
        Self {
            next: AtomicU64::new(0xFFFF_8000_0000_0000),
            outstanding: AtomicUsize::new(0),
            refuse_frees: AtomicBool::new(false),
            freed: Mutex::new(Vec::new()),
        }
    }

    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Make every free report `Busy` until turned off again
    pub fn refuse_frees(&self, refuse: bool) {
        self.refuse_frees.store(refuse, Ordering::SeqCst);
    }
}

impl PageAllocator for MockPages {
    fn allocate_pages(&self, count: usize) -> u64 {
        self.outstanding.fetch_add(count, Ordering::SeqCst);
        self.next.fetch_add(count as u64 * PAGE_SIZE, Ordering::SeqCst)
    }

    fn free_pages(&self, addr: u64, count: usize) -> Result<(), FreeError> {
        if self.refuse_frees.load(Ordering::SeqCst) {
            return Err(FreeError::Busy);
        }
        let mut freed = self.freed.lock().unwrap();
        assert!(!freed.iter().any(|&(a, _)| a == addr), "double free of {:#x}", addr);
        freed.push((addr, count));
        self.outstanding.fetch_sub(count, Ordering::SeqCst);
        Ok(())
    }
}

// =============================================================================
// Address spaces and memory
// =============================================================================

#[derive(Default)]
pub struct MockSpaces {
    next_space: AtomicU64,
    next_page: AtomicU64,
    live: Mutex<Vec<AddressSpace>>,
    activated: Mutex<Vec<Option<AddressSpace>>>,
    unmapped: AtomicUsize,
}

impl MockSpaces {
    pub fn new() -> Self {
        Self {
            next_space: AtomicU64::new(1),
            next_page: AtomicU64::new(0x7000_0000),
            ..Self::default()
        }
    }

    pub fn live(&self) -> usize {
        self.live.lock().unwrap().len()
    }

    pub fn last_activated(&self) -> Option<Option<AddressSpace>> {
        self.activated.lock().unwrap().last().copied()
    }

    pub fn unmapped_pages(&self) -> usize {
        self.unmapped.load(Ordering::SeqCst)
    }
}

impl AddressSpaces for MockSpaces {
    fn create(&self) -> AddressSpace {
        let space = AddressSpace(self.next_space.fetch_add(1, Ordering::SeqCst));
        self.live.lock().unwrap().push(space);
        space
    }

    fn destroy(&self, space: AddressSpace) -> Result<(), FreeError> {
        let mut live = self.live.lock().unwrap();
        let index = live.iter().position(|&s| s == space).ok_or(FreeError::InUse)?;
        live.swap_remove(index);
        Ok(())
    }

    fn activate(&self, space: Option<AddressSpace>) {
        self.activated.lock().unwrap().push(space);
    }

    fn map_user_pages(&self, _space: AddressSpace, count: usize) -> u64 {
        self.next_page.fetch_add(count as u64 * PAGE_SIZE, Ordering::SeqCst)
    }

    fn unmap_user_pages(&self, _space: AddressSpace, _addr: u64, count: usize) -> Result<(), FreeError> {
        self.unmapped.fetch_add(count, Ordering::SeqCst);
        Ok(())
    }
}

/// Byte-addressed memory per address space; unwritten bytes read as zero
#[derive(Default)]
pub struct MockMemory {
    bytes: Mutex<HashMap<(Option<AddressSpace>, u64), u8>>,
    /// Accesses below this address fault
    fault_below: AtomicU64,
}

impl MockMemory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fault_below(&self, addr: u64) {
        self.fault_below.store(addr, Ordering::SeqCst);
    }

    pub fn read_u64(&self, space: Option<AddressSpace>, addr: u64) -> u64 {
        let mut word = [0u8; 8];
        let _ = UserMemory::read(self, space, addr, &mut word);
        u64::from_le_bytes(word)
    }

    pub fn read_u32(&self, space: Option<AddressSpace>, addr: u64) -> u32 {
        let mut word = [0u8; 4];
        let _ = UserMemory::read(self, space, addr, &mut word);
        u32::from_le_bytes(word)
    }

    fn check(&self, addr: u64) -> Result<(), MemoryFault> {
        if addr < self.fault_below.load(Ordering::SeqCst) {
            return Err(MemoryFault { address: addr });
        }
        Ok(())
    }
}

impl UserMemory for MockMemory {
    fn write(&self, space: Option<AddressSpace>, addr: u64, bytes: &[u8]) -> Result<(), MemoryFault> {
        self.check(addr)?;
        let mut memory = self.bytes.lock().unwrap();
        for (i, &byte) in bytes.iter().enumerate() {
            memory.insert((space, addr + i as u64), byte);
        }
        Ok(())
    }

    fn read(&self, space: Option<AddressSpace>, addr: u64, out: &mut [u8]) -> Result<(), MemoryFault> {
        self.check(addr)?;
        let memory = self.bytes.lock().unwrap();
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = memory.get(&(space, addr + i as u64)).copied().unwrap_or(0);
        }
        Ok(())
    }
}

// =============================================================================
// Interrupts
// =============================================================================

#[derive(Default)]
pub struct MockRegistrar {
    pub vectors: Vec<(u8, Arc<dyn InterruptHandler>)>,
}

impl MockRegistrar {
    pub fn fire(&self, vector: u8, frame: &mut TrapFrame) -> bool {
        match self.vectors.iter().find(|(v, _)| *v == vector) {
            Some((_, handler)) => {
                handler.handle(frame);
                true
            }
            None => false,
        }
    }
}

impl InterruptRegistrar for MockRegistrar {
    fn register(&mut self, vector: u8, handler: Arc<dyn InterruptHandler>) -> bool {
        if self.vectors.iter().any(|(v, _)| *v == vector) {
            return false;
        }
        self.vectors.push((vector, handler));
        true
    }
}

// =============================================================================
// Control blocks and a booted scheduler
// =============================================================================

fn test_info() -> TaskInfo {
    TaskInfo::new(
        0,
        TaskPriority::Normal,
        CoreAffinity::all(1),
        TaskArchitecture::X64,
        TaskCompatibility::Native,
    )
}

/// A free-standing user PCB
pub fn test_pcb(pid: Pid, parent: Option<Pid>) -> Arc<Pcb> {
    Arc::new(Pcb::new(PcbParts {
        id: pid,
        parent,
        name: format!("p{}", pid.0),
        mode: ExecutionMode::User,
        info: test_info(),
        address_space: Some(AddressSpace(pid.0 + 100)),
        limits: ProcessLimits::default(),
        working_directory: String::from("/"),
        program_break: 0,
        credentials: Credentials::default(),
        umask: DEFAULT_UMASK,
        tls: None,
    }))
}

/// A free-standing Ready user TCB
pub fn test_tcb(owner: Pid, tid: Tid) -> Arc<Tcb> {
    let pages = MockPages::new();
    Arc::new(Tcb::new(TcbParts {
        id: tid,
        owner,
        name: format!("t{}", tid.0),
        mode: ExecutionMode::User,
        info: test_info(),
        frame: Architecture::X86_64.empty_frame(),
        stack: Stack::allocate_kernel(&pages, 1, 0),
        user_stack: None,
        syscall: None,
        tls: None,
        status: TaskStatus::Ready,
    }))
}

pub const KERNEL_MAIN: u64 = 0xFFFF_FFFF_8010_0000;
pub const IDLE_LOOP: u64 = 0xFFFF_FFFF_8020_0000;
pub const CLEANUP_LOOP: u64 = 0xFFFF_FFFF_8030_0000;
pub const THREAD_EXIT: u64 = 0xFFFF_FFFF_8040_0000;

/// A scheduler booted over mock collaborators, with handles to each mock
pub struct TestKernel {
    pub scheduler: Arc<Scheduler>,
    pub cpu: Arc<MockCpu>,
    pub clock: Arc<MockClock>,
    pub pages: Arc<MockPages>,
    pub spaces: Arc<MockSpaces>,
    pub memory: Arc<MockMemory>,
}

impl TestKernel {
    pub fn new(cores: usize) -> Self {
        Self::with_config(TaskingConfig::default().with_core_count(cores))
    }

    pub fn with_config(config: TaskingConfig) -> Self {
        let cpu = Arc::new(MockCpu::new(0));
        let clock = Arc::new(MockClock::new());
        let pages = Arc::new(MockPages::new());
        let spaces = Arc::new(MockSpaces::new());
        let memory = Arc::new(MockMemory::new());
        let platform = Platform {
            cpu: cpu.clone(),
            timer: clock.clone(),
            pages: pages.clone(),
            spaces: spaces.clone(),
            memory: memory.clone(),
        };
        let entries = BootEntries {
            kernel_main: KERNEL_MAIN,
            idle_loop: IDLE_LOOP,
            cleanup_loop: CLEANUP_LOOP,
            thread_exit: THREAD_EXIT,
        };
        let scheduler = Scheduler::boot(config, platform, entries).expect("boot");
        Self {
            scheduler,
            cpu,
            clock,
            pages,
            spaces,
            memory,
        }
    }

    /// Run one tick on `core` with `frame` as the interrupted context
    pub fn tick_on(&self, core: usize, frame: &mut TrapFrame) {
        self.cpu.set_core(core);
        self.scheduler.schedule(frame);
    }

    /// Tick core 0 from an empty kernel frame; returns the loaded frame
    pub fn tick(&self) -> TrapFrame {
        let mut frame = self.scheduler.config().architecture.empty_frame();
        self.tick_on(0, &mut frame);
        frame
    }

    /// Thread currently assigned to `core`
    pub fn running_on(&self, core: usize) -> Option<Tid> {
        self.scheduler.core(core)?.current_tid()
    }

    /// A user frame as a thread would be interrupted with
    pub fn user_frame(&self, ip: u64, sp: u64) -> TrapFrame {
        self.scheduler.config().architecture.new_frame(&EntryPoint {
            ip,
            sp,
            user: true,
            ..EntryPoint::default()
        })
    }

    /// Take every thread except the boot threads out of contention
    pub fn park_boot_threads(&self) {
        for thread in self.scheduler.threads_of(crate::task::scheduler::KERNEL_PID) {
            let idle = (0..self.scheduler.config().core_count)
                .any(|core| self.scheduler.core(core).and_then(|c| c.idle()) == Some(thread.id()));
            if !idle {
                thread.status_cell().store(TaskStatus::Blocked);
            }
        }
    }
}
