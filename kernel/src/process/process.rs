//! Process control block

use alloc::string::String;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicI32, AtomicU32, AtomicU64, AtomicUsize, Ordering};

use crate::arch::{AddressSpace, CpuOps};
use crate::config::ProcessLimits;
use crate::error::{TaskError, TaskResult};
use crate::signal::{DispositionTable, SignalQueue};
use crate::spinlock::SpinLock;
use crate::task::info::{ExecutionMode, TaskInfo};
use crate::task::tls::TlsTemplate;
use crate::task::{AtomicStatus, KillCode, Pid, TaskStatus};

/// Value of `checksum` for an intact PCB
const PCB_MAGIC: u64 = 0x7063_625F_C0FF_EE02;

/// Heap cursor of a user process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProgramBreak {
    /// First byte after the loaded image
    pub start: u64,
    pub current: u64,
}

impl ProgramBreak {
    /// Move the break to `new`, keeping growth under `limit` bytes.
    ///
    /// `new == 0` queries the current break.
    pub fn adjust(&mut self, new: u64, limit: u64) -> TaskResult<u64> {
        if new == 0 {
            return Ok(self.current);
        }
        if new < self.start {
            return Err(TaskError::InvalidState);
        }
        if new - self.start > limit {
            return Err(TaskError::LimitExceeded("memory"));
        }
        self.current = new;
        Ok(new)
    }
}

/// Handles to per-process state owned by other subsystems
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResourceHandles {
    pub file_table: Option<u64>,
    pub ipc_endpoint: Option<u64>,
    pub symbol_table: Option<u64>,
}

/// A user and group id pair
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Ids {
    pub uid: u16,
    pub gid: u16,
}

impl Ids {
    /// Nobody: no user or group has been assigned
    pub const NOBODY: Ids = Ids {
        uid: u16::MAX,
        gid: u16::MAX,
    };
}

/// Who a process runs as
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub real: Ids,
    pub effective: Ids,
    pub process_group: Pid,
    pub session: Pid,
}

impl Default for Credentials {
    fn default() -> Self {
        Self {
            real: Ids::NOBODY,
            effective: Ids::NOBODY,
            process_group: Pid(0),
            session: Pid(0),
        }
    }
}

/// Default file-creation mask: read and write for everyone
pub const DEFAULT_UMASK: u32 = 0o666;

/// A process to notify with `sig` when this one changes state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Watcher {
    pub pid: Pid,
    pub sig: u32,
}

struct ProcessDetails {
    name: String,
    working_directory: String,
    resources: ResourceHandles,
    credentials: Credentials,
    tls: Option<TlsTemplate>,
}

/// Everything needed to build a PCB; the scheduler fills it in
pub(crate) struct PcbParts {
    pub id: Pid,
    pub parent: Option<Pid>,
    pub name: String,
    pub mode: ExecutionMode,
    pub info: TaskInfo,
    pub address_space: Option<AddressSpace>,
    pub limits: ProcessLimits,
    pub working_directory: String,
    pub program_break: u64,
    pub credentials: Credentials,
    pub umask: u32,
    pub tls: Option<TlsTemplate>,
}

pub struct Pcb {
    id: Pid,
    /// Non-owning; used for exit status propagation only
    parent: Option<Pid>,
    mode: ExecutionMode,
    checksum: AtomicU64,
    status: AtomicStatus,
    exit_code: AtomicI32,
    /// Claimed by the one caller allowed to publish the exit code
    dying: AtomicBool,
    /// Set once a waiter has collected the exit status
    reaped: AtomicBool,
    /// Set while stopped by a job-control signal
    stopped: AtomicBool,
    critical: AtomicBool,
    pub info: TaskInfo,
    address_space: Option<AddressSpace>,
    /// User address of the sigreturn trampoline, 0 until first needed
    trampoline: AtomicU64,
    /// Most recent signal sent, 0 before the first
    last_signal: AtomicU32,
    umask: AtomicU32,
    watcher_count: AtomicUsize,
    watchers: SpinLock<Vec<Watcher>>,
    details: SpinLock<ProcessDetails>,
    program_break: SpinLock<ProgramBreak>,
    limits: SpinLock<ProcessLimits>,
    signals: SpinLock<SignalQueue>,
    dispositions: SpinLock<DispositionTable>,
}

impl Pcb {
    pub(crate) fn new(parts: PcbParts) -> Self {
        Self {
            id: parts.id,
            parent: parts.parent,
            mode: parts.mode,
            checksum: AtomicU64::new(PCB_MAGIC),
            status: AtomicStatus::new(TaskStatus::Ready),
            exit_code: AtomicI32::new(KillCode::Crash.into()),
            dying: AtomicBool::new(false),
            reaped: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            critical: AtomicBool::new(parts.mode == ExecutionMode::Kernel),
            info: parts.info,
            address_space: parts.address_space,
            trampoline: AtomicU64::new(0),
            last_signal: AtomicU32::new(0),
            umask: AtomicU32::new(parts.umask & 0o777),
            watcher_count: AtomicUsize::new(0),
            watchers: SpinLock::new("pcb.watchers", Vec::new()),
            details: SpinLock::new(
                "pcb.details",
                ProcessDetails {
                    name: parts.name,
                    working_directory: parts.working_directory,
                    resources: ResourceHandles::default(),
                    credentials: parts.credentials,
                    tls: parts.tls,
                },
            ),
            program_break: SpinLock::new(
                "pcb.brk",
                ProgramBreak {
                    start: parts.program_break,
                    current: parts.program_break,
                },
            ),
            limits: SpinLock::new("pcb.limits", parts.limits),
            signals: SpinLock::new("pcb.signals", SignalQueue::new()),
            dispositions: SpinLock::new("pcb.dispositions", DispositionTable::new()),
        }
    }

    #[inline]
    pub fn id(&self) -> Pid {
        self.id
    }

    pub fn parent(&self) -> Option<Pid> {
        self.parent
    }

    #[inline]
    pub fn execution_mode(&self) -> ExecutionMode {
        self.mode
    }

    #[inline]
    pub fn is_user(&self) -> bool {
        self.mode.is_user()
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.checksum.load(Ordering::Relaxed) == PCB_MAGIC
    }

    #[inline]
    pub fn status(&self) -> TaskStatus {
        self.status.load()
    }

    pub(crate) fn status_cell(&self) -> &AtomicStatus {
        &self.status
    }

    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Acquire)
    }

    /// Publish the exit code, then the terminal `status`.
    ///
    /// Lock-free and allocation-free. Only the first of racing callers
    /// gets true; the others leave the exit code alone.
    pub(crate) fn terminate(&self, code: i32, status: TaskStatus) -> bool {
        if self.status().is_terminal() || self.dying.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.exit_code.store(code, Ordering::Release);
        self.status.store(status);
        true
    }

    pub(crate) fn store_exit_code(&self, code: i32) {
        self.exit_code.store(code, Ordering::Release);
    }

    /// Claim the exit status. Only the first caller gets true.
    pub(crate) fn claim_reap(&self) -> bool {
        !self.reaped.swap(true, Ordering::AcqRel)
    }

    pub fn is_reaped(&self) -> bool {
        self.reaped.load(Ordering::Acquire)
    }

    pub(crate) fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub(crate) fn set_stopped(&self, stopped: bool) {
        self.stopped.store(stopped, Ordering::Release);
    }

    pub fn is_critical(&self) -> bool {
        self.critical.load(Ordering::Relaxed)
    }

    pub fn set_critical(&self, critical: bool) {
        self.critical.store(critical, Ordering::Relaxed);
    }

    /// `None` for kernel processes sharing the kernel page table
    pub fn address_space(&self) -> Option<AddressSpace> {
        self.address_space
    }

    pub fn trampoline(&self) -> u64 {
        self.trampoline.load(Ordering::Acquire)
    }

    pub(crate) fn set_trampoline(&self, addr: u64) {
        self.trampoline.store(addr, Ordering::Release);
    }

    // =========================================================================
    // Names and resources (never touched by the tick)
    // =========================================================================

    pub fn name(&self) -> String {
        self.details.lock().name.clone()
    }

    pub fn rename(&self, name: &str) {
        let mut details = self.details.lock();
        log::debug!("{}: renamed {:?} -> {:?}", self.id, details.name, name);
        details.name.clear();
        details.name.push_str(name);
    }

    pub fn working_directory(&self) -> String {
        self.details.lock().working_directory.clone()
    }

    pub fn set_working_directory(&self, path: &str) {
        let mut details = self.details.lock();
        details.working_directory.clear();
        details.working_directory.push_str(path);
    }

    pub fn resources(&self) -> ResourceHandles {
        self.details.lock().resources
    }

    pub fn set_resources(&self, resources: ResourceHandles) {
        self.details.lock().resources = resources;
    }

    pub fn credentials(&self) -> Credentials {
        self.details.lock().credentials
    }

    pub fn set_credentials(&self, credentials: Credentials) {
        log::debug!("{}: credentials {:?}", self.id, credentials);
        self.details.lock().credentials = credentials;
    }

    /// File-creation mask
    pub fn umask(&self) -> u32 {
        self.umask.load(Ordering::Relaxed)
    }

    /// `umask`: install `mask` (permission bits only) and return the old one
    pub fn set_umask(&self, mask: u32) -> u32 {
        self.umask.swap(mask & 0o777, Ordering::Relaxed)
    }

    /// Template copied into each new thread's TLS block
    pub fn tls_template(&self) -> Option<TlsTemplate> {
        self.details.lock().tls
    }

    pub fn set_tls_template(&self, template: Option<TlsTemplate>) {
        self.details.lock().tls = template;
    }

    pub fn limits(&self) -> ProcessLimits {
        *self.limits.lock()
    }

    pub fn set_limits(&self, limits: ProcessLimits) {
        *self.limits.lock() = limits;
    }

    /// `brk`: move the program break, bounded by the soft memory limit
    pub fn brk(&self, new: u64) -> TaskResult<u64> {
        let limit = self.limits.lock().soft.memory;
        self.program_break.lock().adjust(new, limit)
    }

    // =========================================================================
    // Watchers
    // =========================================================================

    pub fn has_watchers(&self) -> bool {
        self.watcher_count.load(Ordering::Acquire) > 0
    }

    /// Have `pid` sent `sig` when this process dies. A pid may watch with
    /// several signals; registering the same pair twice is a no-op.
    pub fn add_watcher(&self, pid: Pid, sig: u32) {
        let watcher = Watcher { pid, sig };
        let mut watchers = self.watchers.lock();
        if !watchers.contains(&watcher) {
            watchers.push(watcher);
            self.watcher_count.store(watchers.len(), Ordering::Release);
        }
    }

    pub fn remove_watcher(&self, pid: Pid, sig: u32) -> TaskResult<()> {
        let mut watchers = self.watchers.lock();
        let index = watchers
            .iter()
            .position(|w| *w == Watcher { pid, sig })
            .ok_or(TaskError::NotWatcher(pid))?;
        watchers.remove(index);
        self.watcher_count.store(watchers.len(), Ordering::Release);
        Ok(())
    }

    pub fn is_watched_by(&self, pid: Pid) -> bool {
        self.watchers.lock().iter().any(|w| w.pid == pid)
    }

    /// In registration order
    pub fn watchers(&self) -> Vec<Watcher> {
        self.watchers.lock().clone()
    }

    // =========================================================================
    // Signal state (the tick delivers signals, so lock with interrupts off)
    // =========================================================================

    pub(crate) fn signals(&self) -> &SpinLock<SignalQueue> {
        &self.signals
    }

    pub(crate) fn dispositions(&self) -> &SpinLock<DispositionTable> {
        &self.dispositions
    }

    /// Number of queued signals
    pub fn pending_signals(&self, cpu: &dyn CpuOps) -> usize {
        self.signals.lock_irq(cpu).len()
    }

    pub fn last_signal(&self) -> Option<u32> {
        let sig = self.last_signal.load(Ordering::Acquire);
        (sig != 0).then_some(sig)
    }

    pub(crate) fn record_signal(&self, sig: u32) {
        self.last_signal.store(sig, Ordering::Release);
    }

    #[cfg(test)]
    pub(crate) fn corrupt(&self) {
        self.checksum.store(0, Ordering::Relaxed);
    }
}

impl core::fmt::Debug for Pcb {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pcb")
            .field("id", &self.id)
            .field("parent", &self.parent)
            .field("mode", &self.mode)
            .field("status", &self.status)
            .finish_non_exhaustive()
    }
}
