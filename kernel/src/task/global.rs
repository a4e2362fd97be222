//! Process-wide scheduler handle.
//!
//! Boot code installs the scheduler once; syscall and driver code that has
//! no other path to it looks it up here. Everything inside the crate takes
//! the scheduler explicitly.

use alloc::sync::Arc;

use conquer_once::spin::OnceCell;

use crate::task::Scheduler;

static SCHEDULER: OnceCell<Arc<Scheduler>> = OnceCell::uninit();

/// Publish `scheduler`. Returns false if one was already installed.
pub fn install(scheduler: Arc<Scheduler>) -> bool {
    if SCHEDULER.try_init_once(|| scheduler).is_err() {
        log::warn!("Scheduler handle already installed");
        return false;
    }
    true
}

/// The installed scheduler, if boot got that far
pub fn get() -> Option<&'static Arc<Scheduler>> {
    SCHEDULER.try_get().ok()
}
