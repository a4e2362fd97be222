//! Preemptive multitasking: thread control blocks, the task arena and the
//! per-core scheduler.
//!
//! Processes and threads live in a [`table::TaskTable`] arena keyed by
//! [`Pid`]/[`Tid`]. Ownership and parentage are ids into that arena, so a
//! terminated task can be dropped from it without leaving anything dangling.

use core::fmt;
use core::sync::atomic::{AtomicU8, Ordering};

pub mod cleanup;
pub mod global;
pub mod info;
pub mod lifecycle;
pub mod scheduler;
pub mod stack;
pub mod startup;
pub mod table;
pub mod thread;
pub mod tls;
pub mod wait;

#[cfg(test)]
mod tests;

pub use info::{CoreAffinity, ExecutionMode, TaskArchitecture, TaskCompatibility, TaskInfo, TaskPriority};
pub use scheduler::Scheduler;
pub use thread::Tcb;

/// Process identifier. The kernel process is pid 0.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Pid(pub u64);

/// Thread identifier. Tid 0 is never handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Tid(pub u64);

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pid {}", self.0)
    }
}

impl fmt::Display for Tid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tid {}", self.0)
    }
}

/// Lifecycle state of a thread or process
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum TaskStatus {
    Unknown = 0,
    /// Runnable, waiting for a core
    Ready = 1,
    /// Executing on some core
    Running = 2,
    /// Waiting for its wake deadline
    Sleeping = 3,
    /// Waiting for an external event (I/O, wait target, stop signal)
    Blocked = 4,
    /// Stopped by a job-control signal
    Stopped = 5,
    /// Dead, exit status not yet collected by a watcher
    Zombie = 6,
    /// Dead from a core-dumping signal, status not yet collected
    CoreDump = 7,
    /// Dead; resources are reclaimed by the next cleanup pass
    Terminated = 8,
}

impl TaskStatus {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TaskStatus::Ready,
            2 => TaskStatus::Running,
            3 => TaskStatus::Sleeping,
            4 => TaskStatus::Blocked,
            5 => TaskStatus::Stopped,
            6 => TaskStatus::Zombie,
            7 => TaskStatus::CoreDump,
            8 => TaskStatus::Terminated,
            _ => TaskStatus::Unknown,
        }
    }

    /// Zombie, CoreDump and Terminated never run again
    #[inline]
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Zombie | TaskStatus::CoreDump | TaskStatus::Terminated)
    }
}

/// A [`TaskStatus`] readable from any core without locks
pub struct AtomicStatus(AtomicU8);

impl AtomicStatus {
    pub const fn new(status: TaskStatus) -> Self {
        Self(AtomicU8::new(status as u8))
    }

    #[inline]
    pub fn load(&self) -> TaskStatus {
        TaskStatus::from_u8(self.0.load(Ordering::Acquire))
    }

    #[inline]
    pub fn store(&self, status: TaskStatus) {
        self.0.store(status as u8, Ordering::Release);
    }

    /// Move from `current` to `new`; on failure returns the status found
    #[inline]
    pub fn transition(&self, current: TaskStatus, new: TaskStatus) -> Result<TaskStatus, TaskStatus> {
        self.0
            .compare_exchange(current as u8, new as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(TaskStatus::from_u8)
            .map_err(TaskStatus::from_u8)
    }

    /// Store `new` unless the task already died; false if it had
    pub fn store_if_live(&self, new: TaskStatus) -> bool {
        self.0
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (!TaskStatus::from_u8(current).is_terminal()).then_some(new as u8)
            })
            .is_ok()
    }
}

impl fmt::Debug for AtomicStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.load(), f)
    }
}

/// Exit codes the kernel assigns when a task did not choose its own
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum KillCode {
    SchedulerDestruction = -0xFFFF,
    CxxAbiException = -0xECE97,
    ByOtherProcess = -0x7A55,
    Syscall = -0xCA11,
    /// Also the exit code of a thread that never exited normally
    Crash = -0xDEAD,
    OutOfMemory = -0x1008,
    Error = -1,
    Success = 0,
}

impl From<KillCode> for i32 {
    fn from(code: KillCode) -> i32 {
        code as i32
    }
}
