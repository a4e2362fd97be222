//! Native signal numbers and their Linux equivalents
//!
//! Native numbering is alphabetical over the POSIX set, followed by three
//! kernel-specific compatibility slots and the real-time range. Processes
//! running with Linux compatibility see Linux numbers; conversion happens
//! at the syscall and delivery boundary only.

pub const SIGABRT: u32 = 1;
pub const SIGALRM: u32 = 2;
pub const SIGBUS: u32 = 3;
pub const SIGCHLD: u32 = 4;
pub const SIGCONT: u32 = 5;
pub const SIGFPE: u32 = 6;
pub const SIGHUP: u32 = 7;
pub const SIGILL: u32 = 8;
pub const SIGINT: u32 = 9;
pub const SIGKILL: u32 = 10; // Cannot be caught or blocked
pub const SIGPIPE: u32 = 11;
pub const SIGQUIT: u32 = 12;
pub const SIGSEGV: u32 = 13;
pub const SIGSTOP: u32 = 14; // Cannot be caught or blocked
pub const SIGTERM: u32 = 15;
pub const SIGTSTP: u32 = 16;
pub const SIGTTIN: u32 = 17;
pub const SIGTTOU: u32 = 18;
pub const SIGUSR1: u32 = 19;
pub const SIGUSR2: u32 = 20;
pub const SIGPOLL: u32 = 21;
pub const SIGPROF: u32 = 22;
pub const SIGSYS: u32 = 23;
pub const SIGTRAP: u32 = 24;
pub const SIGURG: u32 = 25;
pub const SIGVTALRM: u32 = 26;
pub const SIGXCPU: u32 = 27;
pub const SIGXFSZ: u32 = 28;
/// Compatibility slots; Linux STKFLT, WINCH and PWR land here
pub const SIGCOMP1: u32 = 29;
pub const SIGCOMP2: u32 = 30;
pub const SIGCOMP3: u32 = 31;

// Real-time signals (32-64)
pub const SIGRTMIN: u32 = 32;
pub const SIGRTMAX: u32 = 64;

/// Maximum signal number supported
pub const NSIG: u32 = 64;

// Linux numbers with no native name of their own
pub const LINUX_SIGSTKFLT: u32 = 16;
pub const LINUX_SIGWINCH: u32 = 28;
pub const LINUX_SIGPWR: u32 = 30;

// Signal handler special values
/// Default action for the signal
pub const SIG_DFL: u64 = 0;
/// Ignore the signal
pub const SIG_IGN: u64 = 1;

// sigprocmask "how" values
/// Block signals in set
pub const SIG_BLOCK: i32 = 0;
/// Unblock signals in set
pub const SIG_UNBLOCK: i32 = 1;
/// Set blocked signals to set
pub const SIG_SETMASK: i32 = 2;

// sigaction flags
/// Restart interrupted syscalls
pub const SA_RESTART: u64 = 0x10000000;
/// Don't block signal during handler
pub const SA_NODEFER: u64 = 0x40000000;
/// Provide siginfo_t to handler
pub const SA_SIGINFO: u64 = 0x00000004;
/// Reset the handler to SIG_DFL once delivered
pub const SA_RESETHAND: u64 = 0x80000000;

/// Native number and Linux number, for every signal whose numbers differ
/// below the real-time range
const LINUX_MAP: [(u32, u32); 31] = [
    (SIGHUP, 1),
    (SIGINT, 2),
    (SIGQUIT, 3),
    (SIGILL, 4),
    (SIGTRAP, 5),
    (SIGABRT, 6),
    (SIGBUS, 7),
    (SIGFPE, 8),
    (SIGKILL, 9),
    (SIGUSR1, 10),
    (SIGSEGV, 11),
    (SIGUSR2, 12),
    (SIGPIPE, 13),
    (SIGALRM, 14),
    (SIGTERM, 15),
    (SIGCOMP1, LINUX_SIGSTKFLT),
    (SIGCHLD, 17),
    (SIGCONT, 18),
    (SIGSTOP, 19),
    (SIGTSTP, 20),
    (SIGTTIN, 21),
    (SIGTTOU, 22),
    (SIGURG, 23),
    (SIGXCPU, 24),
    (SIGXFSZ, 25),
    (SIGVTALRM, 26),
    (SIGPROF, 27),
    (SIGCOMP2, LINUX_SIGWINCH),
    (SIGPOLL, 29),
    (SIGCOMP3, LINUX_SIGPWR),
    (SIGSYS, 31),
];

/// Convert signal number to bit mask
///
/// Returns 0 for invalid signal numbers (0 or > NSIG)
#[inline]
pub const fn sig_mask(sig: u32) -> u64 {
    if sig == 0 || sig > NSIG {
        0
    } else {
        1u64 << (sig - 1)
    }
}

/// Signals that cannot be caught, blocked, or ignored
pub const UNCATCHABLE_SIGNALS: u64 = sig_mask(SIGKILL) | sig_mask(SIGSTOP);

/// Check if a signal number is valid
#[inline]
pub const fn is_valid_signal(sig: u32) -> bool {
    sig > 0 && sig <= NSIG
}

/// Check if a signal can be caught/blocked
#[inline]
pub const fn is_catchable(sig: u32) -> bool {
    sig != SIGKILL && sig != SIGSTOP
}

/// Native signal number as a Linux process sees it; 0 if invalid
pub fn to_linux(sig: u32) -> u32 {
    if sig >= SIGRTMIN && sig <= SIGRTMAX {
        return sig;
    }
    LINUX_MAP
        .iter()
        .find(|&&(native, _)| native == sig)
        .map_or(0, |&(_, linux)| linux)
}

/// Linux signal number in native numbering; 0 if invalid
pub fn from_linux(sig: u32) -> u32 {
    if sig >= SIGRTMIN && sig <= SIGRTMAX {
        return sig;
    }
    LINUX_MAP
        .iter()
        .find(|&&(_, linux)| linux == sig)
        .map_or(0, |&(native, _)| native)
}

fn convert_mask(mask: u64, convert: fn(u32) -> u32) -> u64 {
    (1..=NSIG)
        .filter(|&sig| mask & sig_mask(sig) != 0)
        .fold(0, |acc, sig| acc | sig_mask(convert(sig)))
}

pub fn mask_to_linux(mask: u64) -> u64 {
    convert_mask(mask, to_linux)
}

pub fn mask_from_linux(mask: u64) -> u64 {
    convert_mask(mask, from_linux)
}

/// Get signal name for debugging
pub fn signal_name(sig: u32) -> &'static str {
    match sig {
        SIGABRT => "SIGABRT",
        SIGALRM => "SIGALRM",
        SIGBUS => "SIGBUS",
        SIGCHLD => "SIGCHLD",
        SIGCONT => "SIGCONT",
        SIGFPE => "SIGFPE",
        SIGHUP => "SIGHUP",
        SIGILL => "SIGILL",
        SIGINT => "SIGINT",
        SIGKILL => "SIGKILL",
        SIGPIPE => "SIGPIPE",
        SIGQUIT => "SIGQUIT",
        SIGSEGV => "SIGSEGV",
        SIGSTOP => "SIGSTOP",
        SIGTERM => "SIGTERM",
        SIGTSTP => "SIGTSTP",
        SIGTTIN => "SIGTTIN",
        SIGTTOU => "SIGTTOU",
        SIGUSR1 => "SIGUSR1",
        SIGUSR2 => "SIGUSR2",
        SIGPOLL => "SIGPOLL",
        SIGPROF => "SIGPROF",
        SIGSYS => "SIGSYS",
        SIGTRAP => "SIGTRAP",
        SIGURG => "SIGURG",
        SIGVTALRM => "SIGVTALRM",
        SIGXCPU => "SIGXCPU",
        SIGXFSZ => "SIGXFSZ",
        SIGCOMP1 => "SIGCOMP1",
        SIGCOMP2 => "SIGCOMP2",
        SIGCOMP3 => "SIGCOMP3",
        _ if sig >= SIGRTMIN && sig <= SIGRTMAX => "SIGRT",
        _ => "UNKNOWN",
    }
}
