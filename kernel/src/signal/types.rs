//! Signal-related data structures

use alloc::boxed::Box;
use alloc::collections::VecDeque;

use super::constants::*;
use crate::task::{TaskCompatibility, Tid};

/// What happens to a process when a signal takes its default action
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Terminate the process
    Terminate,
    /// Ignore the signal
    Ignore,
    /// Terminate with core dump
    CoreDump,
    /// Stop (pause) the process
    Stop,
    /// Continue a stopped process
    Continue,
}

/// Get the default disposition for a signal
pub fn default_disposition(sig: u32) -> Disposition {
    match sig {
        // Terminate
        SIGHUP | SIGINT | SIGQUIT | SIGKILL | SIGUSR1 | SIGUSR2 | SIGPIPE | SIGALRM | SIGTERM
        | SIGVTALRM | SIGPROF | SIGPOLL => Disposition::Terminate,

        // Core dump
        SIGILL | SIGTRAP | SIGABRT | SIGBUS | SIGFPE | SIGSEGV | SIGXCPU | SIGXFSZ | SIGSYS => {
            Disposition::CoreDump
        }

        // Stop
        SIGSTOP | SIGTSTP | SIGTTIN | SIGTTOU => Disposition::Stop,

        // Continue
        SIGCONT => Disposition::Continue,

        // CHLD, URG, the compatibility slots and real-time signals
        _ => Disposition::Ignore,
    }
}

/// Exit code of a process killed by `sig`
pub fn signal_exit_code(sig: u32, compat: TaskCompatibility) -> i32 {
    match compat {
        TaskCompatibility::Linux => 128 + to_linux(sig) as i32,
        _ => 100 + sig as i32,
    }
}

/// Per-process disposition table, seeded with the defaults
#[derive(Clone)]
pub struct DispositionTable {
    entries: [Disposition; NSIG as usize],
}

impl DispositionTable {
    pub fn new() -> Self {
        let mut entries = [Disposition::Ignore; NSIG as usize];
        for sig in 1..=NSIG {
            entries[(sig - 1) as usize] = default_disposition(sig);
        }
        Self { entries }
    }

    pub fn get(&self, sig: u32) -> Disposition {
        if is_valid_signal(sig) {
            self.entries[(sig - 1) as usize]
        } else {
            Disposition::Ignore
        }
    }

    pub fn set(&mut self, sig: u32, disposition: Disposition) {
        if is_valid_signal(sig) {
            self.entries[(sig - 1) as usize] = disposition;
        }
    }

    pub fn reset(&mut self, sig: u32) {
        self.set(sig, default_disposition(sig));
    }
}

impl Default for DispositionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Signal handler configuration (matches the sigaction structure layout)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct SignalAction {
    /// Handler address (SIG_DFL, SIG_IGN, or user function pointer)
    pub handler: u64,
    /// Signals to block during handler execution
    pub mask: u64,
    /// Flags (SA_RESTART, SA_SIGINFO, etc.)
    pub flags: u64,
    /// Restorer function for sigreturn (unused; the kernel maps its own)
    pub restorer: u64,
}

impl Default for SignalAction {
    fn default() -> Self {
        SignalAction {
            handler: SIG_DFL,
            mask: 0,
            flags: 0,
            restorer: 0,
        }
    }
}

impl SignalAction {
    pub const fn handler(handler: u64, mask: u64, flags: u64) -> Self {
        SignalAction {
            handler,
            mask,
            flags,
            restorer: 0,
        }
    }

    /// Check if handler is the default action
    #[inline]
    pub fn is_default(&self) -> bool {
        self.handler == SIG_DFL
    }

    /// Check if handler ignores the signal
    #[inline]
    pub fn is_ignore(&self) -> bool {
        self.handler == SIG_IGN
    }

    /// Check if handler is a user function
    #[inline]
    pub fn is_user_handler(&self) -> bool {
        self.handler > SIG_IGN
    }
}

/// Per-thread handler table.
///
/// Boxed: 64 entries of 32 bytes would otherwise sit inline in every TCB.
#[derive(Clone)]
pub struct ActionTable {
    handlers: Box<[SignalAction; NSIG as usize]>,
}

impl ActionTable {
    pub fn new() -> Self {
        Self {
            handlers: Box::new([SignalAction::default(); NSIG as usize]),
        }
    }

    pub fn get(&self, sig: u32) -> SignalAction {
        if is_valid_signal(sig) {
            self.handlers[(sig - 1) as usize]
        } else {
            SignalAction::default()
        }
    }

    /// Store `action`, returning the previous one
    pub fn set(&mut self, sig: u32, action: SignalAction) -> SignalAction {
        if !is_valid_signal(sig) {
            return SignalAction::default();
        }
        core::mem::replace(&mut self.handlers[(sig - 1) as usize], action)
    }

    pub fn has_user_handler(&self, sig: u32) -> bool {
        self.get(sig).is_user_handler()
    }
}

impl Default for ActionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// One pending signal
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueuedSignal {
    pub sig: u32,
    /// sigqueue payload
    pub value: u64,
    /// Thread the signal is directed at; `None` means any thread
    pub tid: Option<Tid>,
}

impl QueuedSignal {
    #[inline]
    pub fn targets(&self, tid: Tid) -> bool {
        self.tid.map_or(true, |target| target == tid)
    }
}

/// FIFO of pending signals for one process
#[derive(Default)]
pub struct SignalQueue {
    pending: VecDeque<QueuedSignal>,
    /// Bumped on every push so waiters can tell something arrived
    generation: u64,
}

impl SignalQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, signal: QueuedSignal) {
        self.pending.push_back(signal);
        self.generation = self.generation.wrapping_add(1);
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Remove and return the first signal `tid` may receive with `mask` applied
    pub fn pop_deliverable(&mut self, tid: Tid, mask: u64) -> Option<QueuedSignal> {
        let index = self
            .pending
            .iter()
            .position(|s| s.targets(tid) && mask & sig_mask(s.sig) == 0)?;
        self.pending.remove(index)
    }

    /// Remove and return the first instance of `sig` for `tid`, mask ignored
    pub fn take(&mut self, sig: u32, tid: Tid) -> Option<QueuedSignal> {
        let index = self.pending.iter().position(|s| s.sig == sig && s.targets(tid))?;
        self.pending.remove(index)
    }

    /// Drop every pending instance of `sig`; returns how many
    pub fn discard(&mut self, sig: u32) -> usize {
        let before = self.pending.len();
        self.pending.retain(|s| s.sig != sig);
        before - self.pending.len()
    }

    /// Whether an instance of `sig` that `tid` may take is queued
    pub fn is_pending_for(&self, sig: u32, tid: Tid) -> bool {
        self.pending.iter().any(|s| s.sig == sig && s.targets(tid))
    }
}
