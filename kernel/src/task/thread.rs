//! Thread control block
//!
//! A [`Tcb`] is shared as `Arc<Tcb>` between the task arena and whoever
//! looked it up. Fields the tick reads (status, priority, affinity, sleep
//! deadline, mask) are atomics; the saved register context sits behind a
//! spinlock that only the scheduler and the owning core's syscall/signal
//! path take.

use alloc::string::String;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, Ordering};

use crate::arch::{CpuOps, FpuState, ThreadBases, TrapFrame};
use crate::signal::constants::UNCATCHABLE_SIGNALS;
use crate::signal::ActionTable;
use crate::spinlock::SpinLock;
use crate::task::info::{ExecutionMode, TaskInfo, TaskPriority};
use crate::task::stack::{Stack, SyscallBlock};
use crate::task::tls::TlsBlock;
use crate::task::wait::WaitTarget;
use crate::task::{AtomicStatus, KillCode, Pid, TaskStatus, Tid};

/// Value of `checksum` for an intact TCB
const TCB_MAGIC: u64 = 0x7463_625F_C0FF_EE01;

/// Instruction pointers kept for post-mortem dumps
pub const IP_HISTORY: usize = 128;

/// Register state saved while the thread is off-core
pub struct ThreadContext {
    pub frame: TrapFrame,
    pub fpu: FpuState,
    pub bases: ThreadBases,
    /// Newest first
    ip_history: [u64; IP_HISTORY],
}

impl ThreadContext {
    pub fn new(frame: TrapFrame) -> Self {
        Self {
            frame,
            fpu: FpuState::new(),
            bases: ThreadBases::default(),
            ip_history: [0; IP_HISTORY],
        }
    }

    pub fn record_ip(&mut self, ip: u64) {
        self.ip_history.copy_within(0..IP_HISTORY - 1, 1);
        self.ip_history[0] = ip;
    }

    pub fn ip_history(&self) -> &[u64; IP_HISTORY] {
        &self.ip_history
    }
}

/// Privilege and debugging attributes
pub struct ThreadSecurity {
    pub mode: ExecutionMode,
    critical: AtomicBool,
    debug: AtomicBool,
    kernel_debug: AtomicBool,
}

/// Everything needed to build a TCB; the scheduler fills it in
pub(crate) struct TcbParts {
    pub id: Tid,
    pub owner: Pid,
    pub name: String,
    pub mode: ExecutionMode,
    pub info: TaskInfo,
    pub frame: TrapFrame,
    /// Kernel stack; also the privilege-transition stack of user threads
    pub stack: Stack,
    pub user_stack: Option<Stack>,
    pub syscall: Option<SyscallBlock>,
    pub tls: Option<TlsBlock>,
    pub status: TaskStatus,
}

pub struct Tcb {
    id: Tid,
    owner: Pid,
    checksum: AtomicU64,
    status: AtomicStatus,
    exit_code: AtomicI32,
    /// Claimed by the one caller allowed to publish the exit code
    dying: AtomicBool,
    /// Wake deadline in clock nanoseconds while Sleeping
    sleep_until: AtomicU64,
    /// Set while blocked by a job-control stop
    stopped: AtomicBool,
    signal_mask: AtomicU64,
    pub info: TaskInfo,
    pub security: ThreadSecurity,
    stack: Stack,
    user_stack: Option<Stack>,
    syscall: Option<SyscallBlock>,
    tls: Option<TlsBlock>,
    /// Linux `CLONE_PARENT_SETTID`-style address the tid was written to
    set_child_tid: AtomicU64,
    /// Zeroed when the thread is reaped (`set_tid_address`)
    clear_child_tid: AtomicU64,
    name: SpinLock<String>,
    context: SpinLock<ThreadContext>,
    actions: SpinLock<ActionTable>,
    wait: SpinLock<Option<WaitTarget>>,
}

impl Tcb {
    pub(crate) fn new(parts: TcbParts) -> Self {
        Self {
            id: parts.id,
            owner: parts.owner,
            checksum: AtomicU64::new(TCB_MAGIC),
            status: AtomicStatus::new(parts.status),
            // Overwritten by a normal exit
            exit_code: AtomicI32::new(KillCode::Crash.into()),
            dying: AtomicBool::new(false),
            sleep_until: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
            signal_mask: AtomicU64::new(0),
            info: parts.info,
            security: ThreadSecurity {
                mode: parts.mode,
                critical: AtomicBool::new(parts.mode == ExecutionMode::Kernel),
                debug: AtomicBool::new(false),
                kernel_debug: AtomicBool::new(false),
            },
            stack: parts.stack,
            user_stack: parts.user_stack,
            syscall: parts.syscall,
            tls: parts.tls,
            set_child_tid: AtomicU64::new(0),
            clear_child_tid: AtomicU64::new(0),
            name: SpinLock::new("tcb.name", parts.name),
            context: SpinLock::new("tcb.context", ThreadContext::new(parts.frame)),
            actions: SpinLock::new("tcb.actions", ActionTable::new()),
            wait: SpinLock::new("tcb.wait", None),
        }
    }

    #[inline]
    pub fn id(&self) -> Tid {
        self.id
    }

    /// Owning process
    #[inline]
    pub fn owner(&self) -> Pid {
        self.owner
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.checksum.load(Ordering::Relaxed) == TCB_MAGIC
    }

    #[inline]
    pub fn status(&self) -> TaskStatus {
        self.status.load()
    }

    pub(crate) fn status_cell(&self) -> &AtomicStatus {
        &self.status
    }

    pub fn name(&self) -> String {
        self.name.lock().clone()
    }

    pub fn rename(&self, name: &str) {
        let mut current = self.name.lock();
        log::debug!("{}: renamed {:?} -> {:?}", self.id, *current, name);
        current.clear();
        current.push_str(name);
    }

    #[inline]
    pub fn priority(&self) -> TaskPriority {
        self.info.priority()
    }

    pub fn set_priority(&self, priority: TaskPriority) {
        log::debug!("{}: priority {:?}", self.id, priority);
        self.info.set_priority(priority);
    }

    pub fn is_critical(&self) -> bool {
        self.security.critical.load(Ordering::Relaxed)
    }

    pub fn set_critical(&self, critical: bool) {
        self.security.critical.store(critical, Ordering::Relaxed);
    }

    pub fn is_debugged(&self) -> bool {
        self.security.debug.load(Ordering::Relaxed)
    }

    pub fn set_debug_mode(&self, enabled: bool) {
        self.security.debug.store(enabled, Ordering::Relaxed);
    }

    pub fn set_kernel_debug_mode(&self, enabled: bool) {
        self.security.kernel_debug.store(enabled, Ordering::Relaxed);
    }

    pub fn is_kernel_debugged(&self) -> bool {
        self.security.kernel_debug.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        self.security.mode.is_user()
    }

    /// Ready or Running to Blocked. Returns false from any other state.
    pub fn block(&self) -> bool {
        self.status.transition(TaskStatus::Ready, TaskStatus::Blocked).is_ok()
            || self.status.transition(TaskStatus::Running, TaskStatus::Blocked).is_ok()
    }

    /// Blocked to Ready. Returns false if the thread was not blocked.
    pub fn unblock(&self) -> bool {
        self.status.transition(TaskStatus::Blocked, TaskStatus::Ready).is_ok()
    }

    /// Exit code; meaningful once the thread is Terminated
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Publish an exit code and Terminated, in that order.
    ///
    /// Lock-free and allocation-free. Of several concurrent callers exactly
    /// one wins; the rest, like callers on a dead thread, get false and
    /// leave the exit code alone.
    pub fn terminate(&self, code: i32) -> bool {
        if self.status().is_terminal() || self.dying.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.exit_code.store(code, Ordering::Release);
        self.status.store(TaskStatus::Terminated);
        true
    }

    /// Overwrite the exit code without changing status
    pub(crate) fn store_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
    }

    pub fn sleep_until(&self) -> u64 {
        self.sleep_until.load(Ordering::Acquire)
    }

    pub(crate) fn set_sleep_until(&self, deadline: u64) {
        self.sleep_until.store(deadline, Ordering::Release);
    }

    /// Running or Ready to Sleeping until `deadline`
    pub(crate) fn sleep(&self, deadline: u64) -> bool {
        self.set_sleep_until(deadline);
        self.status.transition(TaskStatus::Running, TaskStatus::Sleeping).is_ok()
            || self.status.transition(TaskStatus::Ready, TaskStatus::Sleeping).is_ok()
    }

    /// Sleeping to Ready, before or at the deadline
    pub(crate) fn wake(&self) -> bool {
        self.status.transition(TaskStatus::Sleeping, TaskStatus::Ready).is_ok()
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::Release);
    }

    // =========================================================================
    // Signal mask (KILL and STOP can never be blocked)
    // =========================================================================

    #[inline]
    pub fn signal_mask(&self) -> u64 {
        self.signal_mask.load(Ordering::Acquire)
    }

    /// Add `mask` to the blocked set, returning the old mask
    pub fn block_signals(&self, mask: u64) -> u64 {
        self.signal_mask.fetch_or(mask & !UNCATCHABLE_SIGNALS, Ordering::AcqRel)
    }

    /// Remove `mask` from the blocked set, returning the old mask
    pub fn unblock_signals(&self, mask: u64) -> u64 {
        self.signal_mask.fetch_and(!mask, Ordering::AcqRel)
    }

    /// Replace the blocked set, returning the old mask
    pub fn set_signal_mask(&self, mask: u64) -> u64 {
        self.signal_mask.swap(mask & !UNCATCHABLE_SIGNALS, Ordering::AcqRel)
    }

    pub fn stack(&self) -> &Stack {
        &self.stack
    }

    pub fn user_stack(&self) -> Option<&Stack> {
        self.user_stack.as_ref()
    }

    pub fn syscall_block(&self) -> Option<&SyscallBlock> {
        self.syscall.as_ref()
    }

    pub fn tls(&self) -> Option<&TlsBlock> {
        self.tls.as_ref()
    }

    /// Linux thread group id, shared by every thread of a process
    #[inline]
    pub fn tgid(&self) -> Pid {
        self.owner
    }

    pub fn set_child_tid(&self) -> u64 {
        self.set_child_tid.load(Ordering::Acquire)
    }

    pub(crate) fn store_set_child_tid(&self, addr: u64) {
        self.set_child_tid.store(addr, Ordering::Release);
    }

    pub fn clear_child_tid(&self) -> u64 {
        self.clear_child_tid.load(Ordering::Acquire)
    }

    pub fn set_clear_child_tid(&self, addr: u64) {
        self.clear_child_tid.store(addr, Ordering::Release);
    }

    pub(crate) fn context(&self) -> &SpinLock<ThreadContext> {
        &self.context
    }

    pub(crate) fn actions(&self) -> &SpinLock<ActionTable> {
        &self.actions
    }

    pub(crate) fn wait_target(&self) -> &SpinLock<Option<WaitTarget>> {
        &self.wait
    }

    /// Copy the saved frame (for debuggers and tests)
    pub fn saved_frame(&self, cpu: &dyn CpuOps) -> TrapFrame {
        self.context.lock_irq(cpu).frame
    }

    /// Copy up to `out.len()` recent instruction pointers, newest first
    pub fn ip_history(&self, cpu: &dyn CpuOps, out: &mut [u64]) -> usize {
        let context = self.context.lock_irq(cpu);
        let n = out.len().min(IP_HISTORY);
        out[..n].copy_from_slice(&context.ip_history()[..n]);
        n
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&self) {
        self.checksum.store(0, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for Tcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Tcb")
            .field("id", &self.id)
            .field("owner", &self.owner)
            .field("status", &self.status)
            .field("priority", &self.priority())
            .finish_non_exhaustive()
    }
}
