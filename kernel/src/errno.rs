//! POSIX errno values
//!
//! Error numbers surfaced to user space by the tasking syscalls. Callers
//! return them negated.

/// Operation not permitted
pub const EPERM: i32 = 1;

/// No such file or directory (also: watcher not registered)
pub const ENOENT: i32 = 2;

/// No such process
pub const ESRCH: i32 = 3;

/// Interrupted system call
pub const EINTR: i32 = 4;

/// No child processes
pub const ECHILD: i32 = 10;

/// Resource temporarily unavailable (would block)
pub const EAGAIN: i32 = 11;

/// Cannot allocate memory
pub const ENOMEM: i32 = 12;

/// Bad address
pub const EFAULT: i32 = 14;

/// Device or resource busy
pub const EBUSY: i32 = 16;

/// Invalid argument
pub const EINVAL: i32 = 22;

/// Connection timed out
pub const ETIMEDOUT: i32 = 110;
