//! Per-core scheduling context and the per-thread syscall block
//!
//! [`CoreContext`] is indexed by core id and touched only with atomics, so
//! the tick on one core and lifecycle calls on another never need a lock
//! to read it. The current pid and tid pair sits behind a sequence counter
//! so a reader never sees one thread's tid with another's pid.
//! [`GsBlock`] is the small record the assembly syscall entry
//! stub finds through the shadow GS base; its offsets are ABI.

use alloc::boxed::Box;
use alloc::vec::Vec;
use core::mem::offset_of;
use core::sync::atomic::{fence, AtomicBool, AtomicU64, Ordering};

use crate::arch::Plain;
use crate::task::{Pid, Tid};

/// Sentinel stored in id slots that hold nothing
const NONE: u64 = u64::MAX;

/// Checksum seed; each core stores `CORE_MAGIC ^ id`
const CORE_MAGIC: u64 = 0xC0DE_5C4E_D000_0000;

/// Scheduling state of one hardware core
#[repr(C, align(64))]
pub struct CoreContext {
    id: usize,
    /// Odd while `set_current` is mid-write
    current_seq: AtomicU64,
    current_pid: AtomicU64,
    current_tid: AtomicU64,
    idle_tid: AtomicU64,
    /// Arena position the round-robin sweep resumes after
    last_pid: AtomicU64,
    last_tid: AtomicU64,
    ticks: AtomicU64,
    idle_ticks: AtomicU64,
    /// Time spent in the last tick's selection
    last_tick_ns: AtomicU64,
    update_frame: AtomicBool,
    checksum: AtomicU64,
}

impl CoreContext {
    pub fn new(id: usize) -> Self {
        Self {
            id,
            current_seq: AtomicU64::new(0),
            current_pid: AtomicU64::new(NONE),
            current_tid: AtomicU64::new(NONE),
            idle_tid: AtomicU64::new(NONE),
            last_pid: AtomicU64::new(NONE),
            last_tid: AtomicU64::new(NONE),
            ticks: AtomicU64::new(0),
            idle_ticks: AtomicU64::new(0),
            last_tick_ns: AtomicU64::new(0),
            update_frame: AtomicBool::new(false),
            checksum: AtomicU64::new(CORE_MAGIC ^ id as u64),
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.checksum.load(Ordering::Relaxed) == CORE_MAGIC ^ self.id as u64
    }

    pub fn current(&self) -> Option<(Pid, Tid)> {
        let (pid, tid) = loop {
            let before = self.current_seq.load(Ordering::Acquire);
            if before & 1 == 1 {
                core::hint::spin_loop();
                continue;
            }
            let pid = self.current_pid.load(Ordering::Relaxed);
            let tid = self.current_tid.load(Ordering::Relaxed);
            fence(Ordering::Acquire);
            if self.current_seq.load(Ordering::Relaxed) == before {
                break (pid, tid);
            }
        };
        (pid != NONE && tid != NONE).then_some((Pid(pid), Tid(tid)))
    }

    #[inline]
    pub fn current_tid(&self) -> Option<Tid> {
        let tid = self.current_tid.load(Ordering::Acquire);
        (tid != NONE).then_some(Tid(tid))
    }

    /// Publish the pair as one unit. Only the core itself (or boot, before
    /// the core starts) writes it.
    pub fn set_current(&self, pid: Pid, tid: Tid) {
        let seq = self.current_seq.load(Ordering::Relaxed);
        self.current_seq.store(seq.wrapping_add(1), Ordering::Relaxed);
        fence(Ordering::Release);
        self.current_pid.store(pid.0, Ordering::Relaxed);
        self.current_tid.store(tid.0, Ordering::Release);
        self.current_seq.store(seq.wrapping_add(2), Ordering::Release);
    }

    pub fn idle(&self) -> Option<Tid> {
        let tid = self.idle_tid.load(Ordering::Relaxed);
        (tid != NONE).then_some(Tid(tid))
    }

    pub fn set_idle(&self, tid: Tid) {
        self.idle_tid.store(tid.0, Ordering::Relaxed);
    }

    pub fn last_position(&self) -> Option<(Pid, Tid)> {
        let pid = self.last_pid.load(Ordering::Relaxed);
        let tid = self.last_tid.load(Ordering::Relaxed);
        (pid != NONE).then_some((Pid(pid), Tid(tid)))
    }

    pub fn set_last_position(&self, pid: Pid, tid: Tid) {
        self.last_pid.store(pid.0, Ordering::Relaxed);
        self.last_tid.store(tid.0, Ordering::Relaxed);
    }

    /// Ask the next tick to reload the current thread's frame without switching
    pub fn request_update_frame(&self) {
        self.update_frame.store(true, Ordering::Release);
    }

    pub fn take_update_frame(&self) -> bool {
        self.update_frame.swap(false, Ordering::AcqRel)
    }

    pub fn record_tick(&self, idle: bool, elapsed_ns: u64) {
        self.ticks.fetch_add(1, Ordering::Relaxed);
        if idle {
            self.idle_ticks.fetch_add(1, Ordering::Relaxed);
        }
        self.last_tick_ns.store(elapsed_ns, Ordering::Relaxed);
    }

    pub fn ticks(&self) -> u64 {
        self.ticks.load(Ordering::Relaxed)
    }

    pub fn idle_ticks(&self) -> u64 {
        self.idle_ticks.load(Ordering::Relaxed)
    }

    pub fn last_tick_ns(&self) -> u64 {
        self.last_tick_ns.load(Ordering::Relaxed)
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&self) {
        self.checksum.store(0, Ordering::Relaxed);
    }
}

/// One [`CoreContext`] per core, fixed at boot
pub struct CoreTable {
    cores: Box<[CoreContext]>,
}

impl CoreTable {
    pub fn new(count: usize) -> Self {
        let cores: Vec<CoreContext> = (0..count).map(CoreContext::new).collect();
        Self {
            cores: cores.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn get(&self, id: usize) -> Option<&CoreContext> {
        self.cores.get(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &CoreContext> {
        self.cores.iter()
    }

    pub fn len(&self) -> usize {
        self.cores.len()
    }

    /// Whether any core is executing `tid` right now
    pub fn is_running_anywhere(&self, tid: Tid) -> bool {
        self.cores.iter().any(|core| core.current_tid() == Some(tid))
    }
}

// =============================================================================
// Syscall block
// =============================================================================

/// Per-thread block the syscall entry stub reaches through shadow GS.
///
/// The entry stub loads `syscall_stack` after saving the user stack pointer
/// to `temp_stack`. Field offsets are fixed; see the assertions below.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(C)]
pub struct GsBlock {
    /// Top of the kernel stack used on syscall entry (offset 0x00)
    pub syscall_stack: u64,
    /// Scratch slot for the user stack pointer (offset 0x08)
    pub temp_stack: u64,
    /// Entry-stub flags (offset 0x10)
    pub flags: u64,
    /// Reserved for the entry stub (offset 0x18)
    pub padding: u64,
    /// Lowest address of the syscall stack (offset 0x20)
    pub syscall_stack_base: u64,
    /// Size of the syscall stack in pages (offset 0x28)
    pub syscall_stack_pages: u64,
    /// Tid of the owning thread (offset 0x30)
    pub thread: u64,
    _reserved: u64,
}

unsafe impl Plain for GsBlock {}

pub const GS_SYSCALL_STACK: usize = 0x00;
pub const GS_TEMP_STACK: usize = 0x08;
pub const GS_THREAD: usize = 0x30;

const _: () = {
    assert!(offset_of!(GsBlock, syscall_stack) == GS_SYSCALL_STACK);
    assert!(offset_of!(GsBlock, temp_stack) == GS_TEMP_STACK);
    assert!(offset_of!(GsBlock, flags) == 0x10);
    assert!(offset_of!(GsBlock, padding) == 0x18);
    assert!(offset_of!(GsBlock, syscall_stack_base) == 0x20);
    assert!(offset_of!(GsBlock, syscall_stack_pages) == 0x28);
    assert!(offset_of!(GsBlock, thread) == GS_THREAD);
    assert!(core::mem::size_of::<GsBlock>() == 64);
};

impl GsBlock {
    /// Block for `tid` whose syscall stack spans `pages` pages from `base`
    pub fn new(tid: Tid, base: u64, pages: u64, page_size: u64) -> Self {
        Self {
            // Leave 16 bytes so the first push stays inside the stack
            syscall_stack: base + pages * page_size - 0x10,
            syscall_stack_base: base,
            syscall_stack_pages: pages,
            thread: tid.0,
            ..Self::default()
        }
    }

    pub(crate) fn to_bytes(&self) -> &[u8] {
        self.as_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn core_context_tracks_current_and_checksum() {
        let table = CoreTable::new(2);
        let core = table.get(1).expect("core 1 exists");
        assert!(core.is_valid());
        assert_eq!(core.current(), None, "no thread before the first switch");

        core.set_current(Pid(3), Tid(9));
        assert_eq!(core.current(), Some((Pid(3), Tid(9))));
        assert!(table.is_running_anywhere(Tid(9)));
        assert!(!table.is_running_anywhere(Tid(10)));

        core.corrupt();
        assert!(!core.is_valid(), "corruption is detected");
        assert!(table.get(2).is_none());
    }

    #[test]
    fn current_pair_never_tears() {
        use std::sync::Arc;

        let core = Arc::new(CoreContext::new(0));
        let done = Arc::new(AtomicBool::new(false));
        let writer = {
            let core = core.clone();
            let done = done.clone();
            std::thread::spawn(move || {
                for n in 1..20_000u64 {
                    core.set_current(Pid(n), Tid(n));
                }
                done.store(true, Ordering::SeqCst);
            })
        };
        while !done.load(Ordering::SeqCst) {
            if let Some((pid, tid)) = core.current() {
                assert_eq!(pid.0, tid.0, "pid and tid come from the same switch");
            }
        }
        writer.join().expect("writer panicked");
        assert_eq!(core.current(), Some((Pid(19_999), Tid(19_999))));
    }

    #[test]
    fn update_frame_flag_is_consumed_once() {
        let core = CoreContext::new(0);
        core.request_update_frame();
        assert!(core.take_update_frame());
        assert!(!core.take_update_frame(), "flag clears after one tick");
    }

    #[test]
    fn tick_counters() {
        let core = CoreContext::new(0);
        core.record_tick(false, 10);
        core.record_tick(true, 20);
        assert_eq!(core.ticks(), 2);
        assert_eq!(core.idle_ticks(), 1);
        assert_eq!(core.last_tick_ns(), 20);
    }

    #[test]
    fn gs_block_layout() {
        let block = GsBlock::new(Tid(4), 0x10_0000, 2, 4096);
        assert_eq!(block.syscall_stack, 0x10_0000 + 2 * 4096 - 0x10);
        let bytes = block.to_bytes();
        assert_eq!(&bytes[GS_THREAD..GS_THREAD + 8], &4u64.to_le_bytes());
        assert_eq!(&bytes[0x20..0x28], &0x10_0000u64.to_le_bytes());
    }
}
