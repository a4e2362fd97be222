//! Per-task accounting and scheduling attributes, shared by PCB and TCB.

use core::sync::atomic::{AtomicU64, AtomicU8, Ordering};

use crate::arch::Architecture;
use crate::config::MAX_CORES;

/// Scheduling priority; larger values win every tick
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum TaskPriority {
    Unknown = 0,
    Idle = 1,
    Low = 2,
    Normal = 5,
    High = 8,
    Critical = 10,
}

impl TaskPriority {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => TaskPriority::Idle,
            2 => TaskPriority::Low,
            5 => TaskPriority::Normal,
            8 => TaskPriority::High,
            10 => TaskPriority::Critical,
            _ => TaskPriority::Unknown,
        }
    }

    /// Quanta armed on the one-shot timer when this priority is selected
    pub fn time_slice(self) -> u32 {
        match self {
            TaskPriority::Unknown => TaskPriority::Normal as u32,
            other => other as u32,
        }
    }
}

/// Bitmask of cores a task may run on
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CoreAffinity(pub u64);

impl CoreAffinity {
    /// Every core of a machine with `cores` cores
    pub fn all(cores: usize) -> Self {
        if cores >= MAX_CORES {
            CoreAffinity(u64::MAX)
        } else {
            CoreAffinity((1u64 << cores) - 1)
        }
    }

    pub fn only(core: usize) -> Self {
        CoreAffinity(1u64 << core)
    }

    #[inline]
    pub fn contains(self, core: usize) -> bool {
        core < MAX_CORES && self.0 & (1u64 << core) != 0
    }

    pub fn with(self, core: usize) -> Self {
        CoreAffinity(self.0 | (1u64 << core))
    }

    pub fn without(self, core: usize) -> Self {
        CoreAffinity(self.0 & !(1u64 << core))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskArchitecture {
    Unknown,
    X32,
    X64,
    Arm32,
    Arm64,
}

impl From<Architecture> for TaskArchitecture {
    fn from(arch: Architecture) -> Self {
        match arch {
            Architecture::X86_64 => TaskArchitecture::X64,
            Architecture::X86_32 => TaskArchitecture::X32,
            Architecture::Aarch64 => TaskArchitecture::Arm64,
        }
    }
}

/// ABI personality a task's syscalls and signals follow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskCompatibility {
    Unknown,
    Native,
    Linux,
    Windows,
}

/// Privilege a task executes at
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionMode {
    Unknown,
    Kernel,
    /// Kernel privilege, but treated as a service process
    System,
    User,
}

impl ExecutionMode {
    #[inline]
    pub fn is_user(self) -> bool {
        self == ExecutionMode::User
    }
}

/// Accounting plus the attributes the tick reads lock-free
#[derive(Debug)]
pub struct TaskInfo {
    pub spawn_time: u64,
    pub architecture: TaskArchitecture,
    pub compatibility: TaskCompatibility,
    user_time: AtomicU64,
    kernel_time: AtomicU64,
    last_update: AtomicU64,
    priority: AtomicU8,
    affinity: AtomicU64,
}

impl TaskInfo {
    pub fn new(
        now: u64,
        priority: TaskPriority,
        affinity: CoreAffinity,
        architecture: TaskArchitecture,
        compatibility: TaskCompatibility,
    ) -> Self {
        Self {
            spawn_time: now,
            architecture,
            compatibility,
            user_time: AtomicU64::new(0),
            kernel_time: AtomicU64::new(0),
            last_update: AtomicU64::new(now),
            priority: AtomicU8::new(priority as u8),
            affinity: AtomicU64::new(affinity.0),
        }
    }

    #[inline]
    pub fn priority(&self) -> TaskPriority {
        TaskPriority::from_u8(self.priority.load(Ordering::Relaxed))
    }

    pub fn set_priority(&self, priority: TaskPriority) {
        self.priority.store(priority as u8, Ordering::Relaxed);
    }

    #[inline]
    pub fn affinity(&self) -> CoreAffinity {
        CoreAffinity(self.affinity.load(Ordering::Relaxed))
    }

    pub fn set_affinity(&self, affinity: CoreAffinity) {
        self.affinity.store(affinity.0, Ordering::Relaxed);
    }

    /// Charge the time since the last update to user or kernel time
    pub fn update_usage(&self, mode: ExecutionMode, now: u64) {
        let last = self.last_update.swap(now, Ordering::Relaxed);
        let elapsed = now.saturating_sub(last);
        if mode.is_user() {
            self.user_time.fetch_add(elapsed, Ordering::Relaxed);
        } else {
            self.kernel_time.fetch_add(elapsed, Ordering::Relaxed);
        }
    }

    pub fn user_time(&self) -> u64 {
        self.user_time.load(Ordering::Relaxed)
    }

    pub fn kernel_time(&self) -> u64 {
        self.kernel_time.load(Ordering::Relaxed)
    }
}
