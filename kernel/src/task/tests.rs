//! Scheduler scenarios driven through mock collaborators.
//!
//! Each test boots a [`TestKernel`], parks the kernel's own threads so only
//! the threads under test compete, and steps the scheduler tick by tick.

use std::sync::Arc;

use crate::arch::{TrapFrame, UserMemory};
use crate::error::TaskError;
use crate::process::{Credentials, Ids, Pcb, DEFAULT_UMASK};
use crate::signal::constants::*;
use crate::signal::delivery::{StackInfo, SIGNAL_MAGIC};
use crate::signal::{signal_exit_code, SignalAction};
use crate::task::cleanup::CleanupReport;
use crate::task::info::{CoreAffinity, TaskCompatibility, TaskPriority};
use crate::task::lifecycle::{ProcessOptions, ThreadOptions};
use crate::task::scheduler::KERNEL_PID;
use crate::task::startup::{ProgramArgs, AT_PAGESZ};
use crate::task::tls::TlsTemplate;
use crate::task::{KillCode, Pid, TaskStatus, Tcb, Tid};
use crate::testing::{MockRegistrar, TestKernel, IDLE_LOOP};

const USER_IP: u64 = 0x40_1000;
const USER_SP: u64 = 0x7fff_0000;
const HANDLER: u64 = 0x40_2000;

fn user_process(k: &TestKernel, name: &str) -> Arc<Pcb> {
    k.scheduler
        .create_process(ProcessOptions::user(name))
        .expect("create process")
}

fn user_thread(k: &TestKernel, pid: Pid, name: &str, priority: TaskPriority) -> Arc<Tcb> {
    k.scheduler
        .create_thread(pid, ThreadOptions::new(name, USER_IP).with_priority(priority))
        .expect("create thread")
}

fn idle_of(k: &TestKernel, core: usize) -> Tid {
    k.scheduler.core(core).and_then(|c| c.idle()).expect("idle thread")
}

/// One process with one thread, already running on core 0
fn running_user(k: &TestKernel) -> (Arc<Pcb>, Arc<Tcb>) {
    k.park_boot_threads();
    let pcb = user_process(k, "app");
    let tcb = user_thread(k, pcb.id(), "main", TaskPriority::Normal);
    let mut frame = k.user_frame(USER_IP, USER_SP);
    k.tick_on(0, &mut frame);
    assert_eq!(k.running_on(0), Some(tcb.id()), "the only user thread runs");
    (pcb, tcb)
}

// =============================================================================
// Boot
// =============================================================================

#[test]
fn boot_creates_kernel_threads() {
    let k = TestKernel::new(2);
    let kernel = k.scheduler.process(KERNEL_PID).expect("kernel process");
    assert_eq!(kernel.name(), "Kernel");
    assert!(!kernel.is_user());

    let threads = k.scheduler.threads_of(KERNEL_PID);
    let names: Vec<_> = threads.iter().map(|t| t.name()).collect();
    assert_eq!(names, ["Main Thread", "Idle Thread 0", "Idle Thread 1", "Cleanup"]);
    assert_eq!(threads[0].status(), TaskStatus::Running, "boot context is the main thread");
    assert_eq!(k.running_on(0), Some(threads[0].id()));
    assert_eq!(k.running_on(1), None, "secondary cores start with nothing");

    assert_eq!(threads[1].priority(), TaskPriority::Idle);
    assert_eq!(threads[2].info.affinity(), CoreAffinity::only(1));
    assert_eq!(idle_of(&k, 1), threads[2].id());
    assert_eq!(threads[3].priority(), TaskPriority::Low);
    assert_eq!(k.scheduler.cleanup_thread(), threads[3].id());
    assert_eq!(threads[1].saved_frame(&*k.cpu).instruction_pointer(), IDLE_LOOP);

    k.scheduler.start();
    assert_eq!(k.clock.one_shots().len(), 2, "one first slice per core");
}

#[test]
fn interrupts_register_once() {
    let k = TestKernel::new(1);
    let mut registrar = MockRegistrar::default();
    assert!(k.scheduler.register_interrupts(&mut registrar).is_ok());
    assert_eq!(registrar.vectors.len(), 1, "tick and yield share a vector");
    assert_eq!(
        k.scheduler.register_interrupts(&mut registrar),
        Err(TaskError::InvalidState),
        "a taken vector is refused"
    );

    k.park_boot_threads();
    let mut frame = k.scheduler.config().architecture.empty_frame();
    assert!(registrar.fire(0x30, &mut frame));
    assert_eq!(k.running_on(0), Some(idle_of(&k, 0)), "the handler runs the tick");
}

// =============================================================================
// Selection
// =============================================================================

#[test]
fn equal_priority_threads_take_turns() {
    let k = TestKernel::new(1);
    k.park_boot_threads();
    let pcb = user_process(&k, "workers");
    let ids: Vec<Tid> = (0..3)
        .map(|i| user_thread(&k, pcb.id(), &format!("w{}", i), TaskPriority::Normal).id())
        .collect();

    let mut seen = Vec::new();
    for _ in 0..ids.len() {
        k.tick();
        seen.push(k.running_on(0).expect("something runs"));
    }
    assert_eq!(seen, ids, "each equal thread runs once within three ticks");

    k.tick();
    assert_eq!(k.running_on(0), Some(ids[0]), "round robin wraps around");
}

#[test]
fn higher_priority_always_wins() {
    let k = TestKernel::new(1);
    k.park_boot_threads();
    let pcb = user_process(&k, "mixed");
    let low = user_thread(&k, pcb.id(), "low", TaskPriority::Low);
    let high = user_thread(&k, pcb.id(), "high", TaskPriority::High);

    for _ in 0..5 {
        k.tick();
        assert_eq!(k.running_on(0), Some(high.id()), "a Ready high thread is never passed over");
        assert_eq!(low.status(), TaskStatus::Ready);
    }
    assert_eq!(
        k.clock.one_shots().last(),
        Some(&(0, TaskPriority::High.time_slice())),
        "the slice follows the chosen priority"
    );

    high.block();
    k.tick();
    assert_eq!(k.running_on(0), Some(low.id()), "blocked threads are skipped");
}

#[test]
fn affinity_restricts_cores() {
    let k = TestKernel::new(2);
    k.park_boot_threads();
    let pcb = user_process(&k, "pinned");
    let pinned = k
        .scheduler
        .create_thread(pcb.id(), ThreadOptions::new("pinned", USER_IP).with_affinity(CoreAffinity::only(1)))
        .expect("create thread");

    let mut frame = k.scheduler.config().architecture.empty_frame();
    k.tick_on(0, &mut frame);
    assert_eq!(k.running_on(0), Some(idle_of(&k, 0)), "core 0 may not run it");
    assert_eq!(pinned.status(), TaskStatus::Ready);

    k.tick_on(1, &mut frame);
    assert_eq!(k.running_on(1), Some(pinned.id()));
    assert_eq!(k.cpu.kernel_stack(), pinned.stack().top(), "kernel stack follows the thread");
    assert_eq!(k.spaces.last_activated(), Some(pcb.address_space()), "and so does the address space");
}

#[test]
fn corrupt_threads_are_skipped_and_dropped() {
    let k = TestKernel::new(1);
    k.park_boot_threads();
    let pcb = user_process(&k, "damaged");
    let broken = user_thread(&k, pcb.id(), "broken", TaskPriority::High);
    let healthy = user_thread(&k, pcb.id(), "healthy", TaskPriority::Normal);
    broken.corrupt();

    for _ in 0..3 {
        k.tick();
        assert_eq!(k.running_on(0), Some(healthy.id()), "a bad checksum is never selected");
    }

    let before = k.pages.outstanding();
    let report = k.scheduler.cleanup();
    assert_eq!(report.corrupt_dropped, 1);
    assert_eq!(k.pages.outstanding(), before, "nothing behind a corrupt block is freed");
    assert_eq!(k.scheduler.threads_of(pcb.id()).len(), 1);
}

#[test]
fn corrupt_core_context_leaves_frame_alone() {
    let k = TestKernel::new(1);
    k.park_boot_threads();
    k.scheduler.core(0).expect("core 0").corrupt();
    let mut frame = k.user_frame(USER_IP, USER_SP);
    k.tick_on(0, &mut frame);
    assert_eq!(frame, k.user_frame(USER_IP, USER_SP));
}

#[test]
fn stopped_scheduler_does_nothing() {
    let k = TestKernel::new(1);
    let main = k.running_on(0);
    k.scheduler.stop();
    let mut frame = k.user_frame(USER_IP, USER_SP);
    k.tick_on(0, &mut frame);
    assert_eq!(frame.instruction_pointer(), USER_IP, "frame untouched");
    assert_eq!(k.running_on(0), main);
    assert_eq!(
        k.scheduler.create_process(ProcessOptions::user("late")).err(),
        Some(TaskError::SchedulerStopped)
    );
}

#[test]
fn update_frame_reloads_without_switching() {
    let k = TestKernel::new(1);
    let (pcb, tcb) = running_user(&k);
    let _other = user_thread(&k, pcb.id(), "other", TaskPriority::Normal);

    tcb.context().lock().frame.set_instruction_pointer(0xABC0);
    k.scheduler.update_frame();
    assert_eq!(k.cpu.yields(), 1, "update_frame enters the scheduler");

    let mut frame = k.user_frame(USER_IP, USER_SP);
    k.tick_on(0, &mut frame);
    assert_eq!(frame.instruction_pointer(), 0xABC0, "the rewritten frame is loaded");
    assert_eq!(k.running_on(0), Some(tcb.id()), "no switch happened");

    k.tick_on(0, &mut frame);
    assert_ne!(k.running_on(0), Some(tcb.id()), "the flag is consumed by one tick");
}

// =============================================================================
// Sleeping and waiting
// =============================================================================

#[test]
fn sleep_wakes_within_one_tick_of_deadline() {
    let k = TestKernel::new(1);
    let (pcb, tcb) = running_user(&k);

    k.scheduler.sleep(10);
    assert_eq!(tcb.status(), TaskStatus::Sleeping);
    assert_eq!(pcb.status(), TaskStatus::Sleeping, "single-threaded process sleeps too");

    for _ in 0..9 {
        k.tick();
        assert_ne!(k.running_on(0), Some(tcb.id()), "never runs before the deadline");
        k.clock.advance_ms(1);
    }
    k.tick();
    assert_eq!(tcb.status(), TaskStatus::Sleeping, "9ms is not 10ms");

    k.clock.advance_ms(1);
    k.tick();
    assert_eq!(k.running_on(0), Some(tcb.id()), "runs on the first tick at the deadline");
    assert_eq!(tcb.status(), TaskStatus::Running);
}

#[test]
fn sleep_no_switch_does_not_yield() {
    let k = TestKernel::new(1);
    let (_, tcb) = running_user(&k);
    assert!(k.scheduler.sleep_no_switch(5));
    assert_eq!(k.cpu.yields(), 0);
    assert_eq!(tcb.status(), TaskStatus::Sleeping);
    assert_eq!(tcb.sleep_until(), 5_000_000);
}

#[test]
fn wait_for_thread_blocks_until_it_exits() {
    let k = TestKernel::new(1);
    let (pcb, waiter) = running_user(&k);
    let worker = user_thread(&k, pcb.id(), "worker", TaskPriority::Normal);

    let scheduler = k.scheduler.clone();
    let target = worker.clone();
    let arch = k.scheduler.config().architecture;
    k.cpu.set_yield_hook(Box::new(move || {
        assert_eq!(target.status(), TaskStatus::Ready);
        scheduler.kill_thread(&target, 9);
        let mut frame = arch.empty_frame();
        scheduler.schedule(&mut frame);
    }));

    assert_eq!(k.scheduler.wait_for_thread(worker.id()), Ok(9));
    assert_eq!(k.running_on(0), Some(waiter.id()), "the tick woke the waiter");
    assert!(waiter.wait_target().lock().is_none(), "target cleared after waking");
    k.cpu.clear_yield_hook();

    assert_eq!(
        k.scheduler.wait_for_thread(waiter.id()),
        Err(TaskError::InvalidState),
        "waiting on yourself is refused"
    );
}

#[test]
fn woken_waiter_runs_on_the_same_tick() {
    let k = TestKernel::new(1);
    let (_, waiter) = running_user(&k);
    let other = user_process(&k, "other");
    let worker = user_thread(&k, other.id(), "worker", TaskPriority::Normal);

    let scheduler = k.scheduler.clone();
    let target = worker.clone();
    let arch = k.scheduler.config().architecture;
    k.cpu.set_yield_hook(Box::new(move || {
        scheduler.kill_thread(&target, 5);
        let mut frame = arch.empty_frame();
        scheduler.schedule(&mut frame);
    }));

    // The waiter's process is single-threaded, so it was mirrored Blocked
    assert_eq!(k.scheduler.wait_for_thread(worker.id()), Ok(5));
    assert_eq!(k.running_on(0), Some(waiter.id()), "no idle tick in between");
    k.cpu.clear_yield_hook();
}

#[test]
fn explicit_block_and_status_changes() {
    let k = TestKernel::new(1);
    k.park_boot_threads();
    let pcb = user_process(&k, "svc");
    let tcb = user_thread(&k, pcb.id(), "main", TaskPriority::Normal);

    k.scheduler.block_thread(tcb.id()).expect("block");
    assert_eq!(k.scheduler.block_thread(tcb.id()), Err(TaskError::InvalidState));
    k.tick();
    assert_ne!(k.running_on(0), Some(tcb.id()), "blocked threads are skipped");
    k.scheduler.unblock_thread(tcb.id()).expect("unblock");
    k.tick();
    assert_eq!(k.running_on(0), Some(tcb.id()));

    k.scheduler.set_process_exit_code(pcb.id(), 12).expect("exit code");
    assert_eq!(tcb.exit_code(), 12, "a sole thread follows its process");
    k.scheduler.kill_process(&pcb, 3);
    assert_eq!(
        k.scheduler.set_process_status(pcb.id(), TaskStatus::Ready),
        Err(TaskError::InvalidState),
        "the dead stay dead"
    );
    assert!(pcb.status().is_terminal());
}

#[test]
fn wait_for_process_reaps_exactly_once() {
    let k = TestKernel::new(1);
    let (parent, _) = running_user(&k);
    let child = user_process(&k, "child");
    assert_eq!(child.parent(), Some(parent.id()));
    assert!(child.is_watched_by(parent.id()), "the parent watches its child");
    user_thread(&k, child.id(), "child-main", TaskPriority::Normal);

    assert!(k.scheduler.kill_process(&child, 42));
    assert_eq!(child.status(), TaskStatus::Zombie, "kept for the watcher");
    assert_eq!(k.scheduler.children_of(parent.id()), [child.id()]);

    assert_eq!(k.scheduler.wait_for_process(child.id()), Ok(42));
    assert_eq!(
        k.scheduler.wait_for_process(child.id()),
        Err(TaskError::AlreadyReaped(child.id())),
        "the status is collected once"
    );
    assert!(k.scheduler.process(child.id()).is_none(), "reaped processes are invisible");
    assert!(k.scheduler.children_of(parent.id()).is_empty());

    let report = k.scheduler.cleanup();
    assert_eq!(report.processes_freed, 1);
    assert_eq!(report.threads_freed, 1);
    assert_eq!(report.notifications_sent, 1, "SIGCHLD went to the parent");
    assert_eq!(
        k.scheduler.wait_for_process(child.id()),
        Err(TaskError::NoSuchProcess(child.id()))
    );
}

#[test]
fn wait_status_returns_on_death_too() {
    let k = TestKernel::new(1);
    let (_, _) = running_user(&k);
    let other = user_process(&k, "other");
    k.scheduler.kill_process(&other, 3);
    assert_eq!(
        k.scheduler.wait_for_process_status(other.id(), TaskStatus::Sleeping),
        Ok(TaskStatus::Zombie)
    );
}

// =============================================================================
// Killing and cleanup
// =============================================================================

#[test]
fn kill_never_blocks_on_held_locks() {
    let k = TestKernel::new(1);
    k.park_boot_threads();
    let pcb = user_process(&k, "victim");
    let tcb = user_thread(&k, pcb.id(), "t", TaskPriority::Normal);
    let pages = k.pages.outstanding();

    let _list = k.scheduler.list_lock.lock();
    let _table = k.scheduler.tasks.lock();
    assert!(k.scheduler.kill_thread(&tcb, 5));
    assert!(k.scheduler.kill_process(&pcb, 6));
    assert!(!k.scheduler.kill_process(&pcb, 7), "second kill reports already dead");
    assert_eq!(pcb.exit_code(), 6);
    assert_eq!(tcb.exit_code(), 5);
    assert_eq!(k.pages.outstanding(), pages, "killing frees nothing");
}

#[test]
fn kernel_process_cannot_be_killed() {
    let k = TestKernel::new(1);
    assert_eq!(k.scheduler.kill_process_id(KERNEL_PID, 1), Err(TaskError::InvalidState));
    assert_eq!(k.scheduler.kill_process_id(Pid(77), 1), Err(TaskError::NoSuchProcess(Pid(77))));
    assert_eq!(k.scheduler.kill_thread_id(Tid(900), 1), Err(TaskError::NoSuchThread(Tid(900))));
}

#[test]
fn killed_threads_are_reaped_exactly_once() {
    let k = TestKernel::new(1);
    k.park_boot_threads();
    let pcb = user_process(&k, "batch");
    let _keeper = user_thread(&k, pcb.id(), "keeper", TaskPriority::Normal);
    let baseline_pages = k.pages.outstanding();
    let baseline_threads = k.scheduler.threads_of(pcb.id()).len();

    let threads: Vec<_> = (0..5)
        .map(|i| user_thread(&k, pcb.id(), &format!("b{}", i), TaskPriority::Normal))
        .collect();
    assert!(k.pages.outstanding() > baseline_pages);
    for thread in &threads {
        k.scheduler.kill_thread(thread, 0);
    }

    let report = k.scheduler.cleanup();
    assert_eq!(report.threads_freed, 5);
    assert_eq!(k.scheduler.threads_of(pcb.id()).len(), baseline_threads);
    assert_eq!(k.pages.outstanding(), baseline_pages, "every page came back");
    assert_eq!(k.spaces.unmapped_pages(), 5 * k.scheduler.config().user_stack_pages);

    assert_eq!(k.scheduler.cleanup(), CleanupReport::default(), "nothing left to reap");
    assert_eq!(k.pages.outstanding(), baseline_pages, "and nothing freed twice");
}

#[test]
fn running_threads_wait_for_the_next_pass() {
    let k = TestKernel::new(1);
    let (_, tcb) = running_user(&k);
    k.scheduler.kill_thread(&tcb, 1);
    assert_eq!(k.scheduler.cleanup().threads_freed, 0, "still current on core 0");

    k.tick();
    assert_eq!(k.scheduler.cleanup().threads_freed, 1);
}

#[test]
fn refused_frees_are_retried() {
    let k = TestKernel::new(1);
    k.park_boot_threads();
    let pcb = user_process(&k, "retry");
    let baseline = k.pages.outstanding();
    let tcb = user_thread(&k, pcb.id(), "t", TaskPriority::Normal);
    k.scheduler.kill_thread(&tcb, 0);

    k.pages.refuse_frees(true);
    let report = k.scheduler.cleanup();
    assert_eq!(report.threads_freed, 1);
    assert_eq!(report.frees_deferred, 3, "kernel stack and both syscall block regions");
    assert!(k.pages.outstanding() > baseline);

    k.pages.refuse_frees(false);
    let report = k.scheduler.cleanup();
    assert_eq!(report.frees_deferred, 0);
    assert_eq!(k.pages.outstanding(), baseline);
}

#[test]
fn process_dies_with_its_last_thread() {
    let k = TestKernel::new(1);
    k.park_boot_threads();
    let pcb = user_process(&k, "short");
    let a = user_thread(&k, pcb.id(), "a", TaskPriority::Normal);
    let b = user_thread(&k, pcb.id(), "b", TaskPriority::Normal);
    k.scheduler.kill_thread(&a, 1);
    k.scheduler.kill_thread(&b, 2);

    k.tick();
    assert_eq!(pcb.status(), TaskStatus::Terminated, "no watchers, so no zombie");
    assert_eq!(pcb.exit_code(), 2, "the last thread's code");

    let spaces = k.spaces.live();
    let report = k.scheduler.cleanup();
    assert_eq!(report.processes_freed, 1);
    assert_eq!(k.spaces.live(), spaces - 1, "address space destroyed");
    assert_eq!(k.spaces.unmapped_pages(), 0, "user stacks go with the space");
}

#[test]
fn cleanup_before_tick_retires_process() {
    let k = TestKernel::new(1);
    let (parent, _) = running_user(&k);
    let child = user_process(&k, "child");
    let only = user_thread(&k, child.id(), "only", TaskPriority::Normal);
    assert!(k.scheduler.kill_thread(&only, 7));

    // No tick between the kill and the reaper
    let report = k.scheduler.cleanup();
    assert_eq!(report.threads_freed, 1);
    assert_eq!(report.processes_freed, 0, "kept for the watcher");
    assert_eq!(child.status(), TaskStatus::Zombie);
    assert_eq!(child.exit_code(), 7, "the last thread's code");
    assert!(k.scheduler.threads_of(child.id()).is_empty());

    for _ in 0..3 {
        k.tick();
    }
    assert_eq!(child.status(), TaskStatus::Zombie, "an empty process is not resurrected");
    assert_eq!(k.scheduler.children_of(parent.id()), [child.id()]);
    assert_eq!(k.scheduler.cleanup().notifications_sent, 1);
    assert_eq!(k.scheduler.wait_for_process(child.id()), Ok(7));
}

#[test]
fn racing_process_kills_agree_on_one_code() {
    let k = TestKernel::new(1);
    let (parent, _) = running_user(&k);
    for round in 0..50 {
        let child = user_process(&k, &format!("c{}", round));
        user_thread(&k, child.id(), "t", TaskPriority::Normal);
        let barrier = Arc::new(std::sync::Barrier::new(2));
        let racers: Vec<_> = [1, 2]
            .into_iter()
            .map(|code| {
                let scheduler = k.scheduler.clone();
                let child = child.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    scheduler.kill_process(&child, code).then_some(code)
                })
            })
            .collect();
        let winners: Vec<i32> = racers
            .into_iter()
            .filter_map(|racer| racer.join().expect("racer panicked"))
            .collect();
        assert_eq!(winners.len(), 1, "round {}: exactly one kill succeeds", round);
        assert_eq!(child.exit_code(), winners[0], "round {}: the winner's code sticks", round);
        assert_eq!(child.status(), TaskStatus::Zombie);
        assert_eq!(k.scheduler.cleanup().notifications_sent, 1, "one SIGCHLD per death");
        assert_eq!(k.scheduler.wait_for_process(child.id()), Ok(winners[0]));
    }
    assert!(k.scheduler.children_of(parent.id()).is_empty());
}

#[test]
fn t2_runs_and_t1_is_reaped() {
    let k = TestKernel::new(1);
    k.park_boot_threads();
    let p = user_process(&k, "P");
    let t1 = user_thread(&k, p.id(), "T1", TaskPriority::Normal);
    let t2 = user_thread(&k, p.id(), "T2", TaskPriority::High);

    k.tick();
    assert_eq!(t2.status(), TaskStatus::Running);

    k.scheduler.kill_thread(&t1, 0);
    k.scheduler.cleanup();
    let remaining: Vec<Tid> = k.scheduler.threads_of(p.id()).iter().map(|t| t.id()).collect();
    assert_eq!(remaining, [t2.id()]);
}

#[test]
fn user_faults_kill_only_the_process() {
    let k = TestKernel::new(1);
    let (pcb, _) = running_user(&k);
    let mut frame = k.user_frame(USER_IP, USER_SP);
    k.scheduler.handle_user_fault(&mut frame, 0xdead_0000);

    assert_eq!(pcb.status(), TaskStatus::Terminated);
    assert_eq!(pcb.exit_code(), signal_exit_code(SIGSEGV, TaskCompatibility::Native));
    assert_eq!(k.running_on(0), Some(idle_of(&k, 0)), "rescheduled away");
    assert!(!k.scheduler.is_stopped());

    let mut kernel = k.scheduler.config().architecture.empty_frame();
    k.scheduler.handle_user_fault(&mut kernel, 0);
    assert!(k.scheduler.is_stopped(), "kernel faults stop scheduling");
}

#[test]
fn shutdown_spares_the_caller_and_idle() {
    let k = TestKernel::new(2);
    let main = k.scheduler.current_thread().expect("main thread");
    let pcb = user_process(&k, "doomed");
    user_thread(&k, pcb.id(), "t", TaskPriority::Normal);

    k.scheduler.shutdown();
    assert_eq!(pcb.exit_code(), KillCode::SchedulerDestruction as i32);
    assert!(pcb.status().is_terminal());
    assert_eq!(main.status(), TaskStatus::Running, "the caller survives");
    for core in 0..2 {
        let idle = k.scheduler.thread(idle_of(&k, core)).expect("idle");
        assert!(!idle.status().is_terminal(), "idle threads survive");
    }
    let cleanup = k.scheduler.thread(k.scheduler.cleanup_thread()).expect("cleanup");
    assert!(!cleanup.status().is_terminal(), "the reaper outlives the shutdown");

    let report = k.scheduler.cleanup();
    assert_eq!(report.processes_freed, 1, "and still reclaims the doomed");
    assert!(k.scheduler.process(pcb.id()).is_none());
}

#[test]
fn thread_limit_applies_to_user_processes() {
    let k = TestKernel::new(1);
    let pcb = user_process(&k, "limited");
    let mut limits = pcb.limits();
    limits.soft.threads = 2;
    pcb.set_limits(limits);
    user_thread(&k, pcb.id(), "a", TaskPriority::Normal);
    user_thread(&k, pcb.id(), "b", TaskPriority::Normal);
    assert_eq!(
        k.scheduler
            .create_thread(pcb.id(), ThreadOptions::new("c", USER_IP))
            .err(),
        Some(TaskError::LimitExceeded("threads"))
    );
}

#[test]
fn arena_grows_past_initial_capacity() {
    let k = TestKernel::new(1);
    let pids: Vec<Pid> = (0..40).map(|i| user_process(&k, &format!("p{}", i)).id()).collect();
    for &pid in &pids {
        assert!(k.scheduler.process(pid).is_some());
    }
    assert_eq!(k.scheduler.process_ids().len(), pids.len() + 1, "plus the kernel");
}

// =============================================================================
// Program start and process attributes
// =============================================================================

#[test]
fn startup_arguments_reach_native_registers() {
    let k = TestKernel::new(1);
    k.park_boot_threads();
    let pcb = user_process(&k, "app");
    let space = pcb.address_space();
    let args = ProgramArgs::new(&["/bin/app", "-x"])
        .with_env(&["PATH=/bin"])
        .with_aux(AT_PAGESZ, 4096);
    let tcb = k
        .scheduler
        .create_thread(pcb.id(), ThreadOptions::new("main", USER_IP).with_args(args))
        .expect("create thread");

    let frame = tcb.saved_frame(&*k.cpu);
    let sp = frame.stack_pointer();
    let stack = tcb.user_stack().expect("user stack");
    assert!(stack.contains(sp), "arguments live on the thread's own stack");
    assert_eq!(sp % 16, 0);
    assert_eq!(k.memory.read_u64(space, sp), 2, "argc at the stack pointer");
    match frame {
        TrapFrame::X86_64(f) => {
            assert_eq!(f.rdi, 2, "argc");
            assert_eq!(f.rsi, sp + 8, "argv");
            assert_eq!(f.rdx, sp + 8 + 2 * 8 + 8, "envp follows argv and its null");
            assert_eq!(f.rcx, 1, "envc");
        }
        other => panic!("unexpected frame {:?}", other),
    }
    let env = k.memory.read_u64(space, sp + 32);
    assert_ne!(env, 0);
    assert_eq!(k.memory.read_u64(space, sp + 40), 0, "envp ends in null");
    assert_eq!(k.memory.read_u64(space, sp + 48), AT_PAGESZ);
}

#[test]
fn linux_programs_read_arguments_from_the_stack_only() {
    let k = TestKernel::new(1);
    k.park_boot_threads();
    let pcb = k
        .scheduler
        .create_process(ProcessOptions::user("linux").with_compatibility(TaskCompatibility::Linux))
        .expect("create process");
    let tcb = k
        .scheduler
        .create_thread(
            pcb.id(),
            ThreadOptions::new("main", USER_IP).with_args(ProgramArgs::new(&["a", "b", "c"])),
        )
        .expect("create thread");
    let frame = tcb.saved_frame(&*k.cpu);
    assert_eq!(k.memory.read_u64(pcb.address_space(), frame.stack_pointer()), 3);
    match frame {
        TrapFrame::X86_64(f) => assert_eq!((f.rsi, f.rdx, f.rcx), (0, 0, 0), "registers stay clear"),
        other => panic!("unexpected frame {:?}", other),
    }
}

#[test]
fn each_thread_gets_its_own_tls_block() {
    let k = TestKernel::new(1);
    k.park_boot_threads();
    let image = 0x40_9000;
    let pcb = k
        .scheduler
        .create_process(ProcessOptions::user("tls").with_tls(TlsTemplate {
            image,
            file_size: 4,
            mem_size: 64,
        }))
        .expect("create process");
    let space = pcb.address_space();
    k.memory.write(space, image, &[0xaa, 0xbb, 0xcc, 0xdd]).expect("image");

    let a = user_thread(&k, pcb.id(), "a", TaskPriority::Normal);
    let b = user_thread(&k, pcb.id(), "b", TaskPriority::Normal);
    let (tls_a, tls_b) = (*a.tls().expect("tls a"), *b.tls().expect("tls b"));
    assert_ne!(tls_a.base(), tls_b.base(), "blocks are per thread");
    assert_eq!(k.memory.read_u32(space, tls_b.base()), 0xddcc_bbaa, "image copied");
    assert_eq!(k.memory.read_u64(space, tls_b.base() + 8), 0, "tail zeroed");
    assert_eq!(k.memory.read_u64(space, tls_a.thread_pointer()), tls_a.thread_pointer());

    let bases = a.context().lock().bases;
    assert_eq!(bases.fs, tls_a.thread_pointer());
    assert_eq!(bases.gs, tls_a.thread_pointer());
    assert_ne!(bases.shadow_gs, 0, "the syscall block keeps the shadow base");

    let before = k.spaces.unmapped_pages();
    k.scheduler.kill_thread(&a, 0);
    assert_eq!(k.scheduler.cleanup().threads_freed, 1);
    assert_eq!(
        k.spaces.unmapped_pages() - before,
        k.scheduler.config().user_stack_pages + 1,
        "user stack and TLS page unmapped while the space lives"
    );
}

#[test]
fn child_tid_words_are_set_and_cleared() {
    let k = TestKernel::new(1);
    let (pcb, main) = running_user(&k);
    let space = pcb.address_space();
    let (set, clear) = (0x60_0000, 0x60_0010);
    k.memory.write(space, clear, &[0xff; 4]).expect("seed");

    let worker = k
        .scheduler
        .create_thread(pcb.id(), ThreadOptions::new("worker", USER_IP).with_child_tid(set, clear))
        .expect("create thread");
    assert_eq!(k.memory.read_u32(space, set) as u64, worker.id().0, "tid written at creation");
    assert_eq!(worker.tgid(), pcb.id());
    assert_eq!(worker.clear_child_tid(), clear);

    k.scheduler.kill_thread(&worker, 0);
    k.scheduler.cleanup();
    assert_eq!(k.memory.read_u32(space, clear), 0, "zeroed when reaped");

    assert_eq!(k.scheduler.set_tid_address(0), Err(TaskError::InvalidState));
    assert_eq!(k.scheduler.set_tid_address(0x60_0020), Ok(main.id()));
    assert_eq!(main.clear_child_tid(), 0x60_0020);
}

#[test]
fn children_inherit_credentials_and_umask() {
    let k = TestKernel::new(1);
    let booted = user_process(&k, "from-kernel");
    assert_eq!(booted.credentials(), Credentials::default());
    assert_eq!(booted.umask(), DEFAULT_UMASK);

    let (parent, _) = running_user(&k);
    let user = Credentials {
        real: Ids { uid: 1000, gid: 100 },
        effective: Ids { uid: 0, gid: 100 },
        process_group: parent.id(),
        session: parent.id(),
    };
    parent.set_credentials(user);
    assert_eq!(parent.set_umask(0o022), DEFAULT_UMASK);

    let child = user_process(&k, "child");
    assert_eq!(child.credentials(), user);
    assert_eq!(child.umask(), 0o022);

    let explicit = Credentials {
        real: Ids { uid: 5, gid: 5 },
        ..user
    };
    let other = k
        .scheduler
        .create_process(ProcessOptions::user("other").with_credentials(explicit))
        .expect("create process");
    assert_eq!(other.credentials(), explicit, "explicit credentials win");
}

#[test]
fn watchers_get_their_own_signal() {
    let k = TestKernel::new(1);
    let (parent, _) = running_user(&k);
    let child = user_process(&k, "child");
    user_thread(&k, child.id(), "t", TaskPriority::Normal);
    k.scheduler
        .add_watcher(child.id(), parent.id(), SIGUSR1)
        .expect("watch");
    assert_eq!(
        k.scheduler.add_watcher(child.id(), parent.id(), 0),
        Err(TaskError::InvalidSignal(0))
    );
    assert_eq!(
        k.scheduler.add_watcher(child.id(), Pid(999), SIGUSR1),
        Err(TaskError::NoSuchProcess(Pid(999)))
    );

    k.scheduler.kill_process(&child, 1);
    assert_eq!(k.scheduler.cleanup().notifications_sent, 2, "SIGCHLD and SIGUSR1");
    assert_eq!(k.scheduler.last_signal(parent.id()), Ok(Some(SIGUSR1)));
    assert_eq!(parent.pending_signals(&*k.cpu), 1, "SIGCHLD is ignored, SIGUSR1 queued");
    assert_eq!(k.scheduler.has_pending_signal(parent.id()), Ok(true));

    assert_eq!(k.scheduler.remove_signal(parent.id(), SIGUSR1), Ok(()));
    assert_eq!(
        k.scheduler.remove_signal(parent.id(), SIGUSR1),
        Err(TaskError::NotPending(SIGUSR1)),
        "nothing left to remove"
    );
    assert_eq!(k.scheduler.has_pending_signal(parent.id()), Ok(false));
}

#[test]
fn removed_watchers_are_not_notified() {
    let k = TestKernel::new(1);
    let (parent, _) = running_user(&k);
    let child = user_process(&k, "child");
    user_thread(&k, child.id(), "t", TaskPriority::Normal);
    assert_eq!(
        k.scheduler.remove_watcher(child.id(), parent.id(), SIGUSR1),
        Err(TaskError::NotWatcher(parent.id()))
    );
    k.scheduler
        .remove_watcher(child.id(), parent.id(), SIGCHLD)
        .expect("unwatch");

    k.scheduler.kill_process(&child, 1);
    assert_eq!(child.status(), TaskStatus::Terminated, "nobody is waiting");
    assert_eq!(k.scheduler.cleanup().notifications_sent, 0);
    assert_eq!(k.scheduler.last_signal(parent.id()), Ok(None));
}

// =============================================================================
// Signals
// =============================================================================

fn install_handler(k: &TestKernel, pcb: &Pcb, tcb: &Tcb, sig: u32, flags: u64) {
    let previous = k
        .scheduler
        .set_action(pcb.id(), tcb.id(), sig, SignalAction::handler(HANDLER, 0, flags))
        .expect("set_action");
    assert!(previous.is_default());
}

#[test]
fn masked_signals_wait_for_unmask() {
    let k = TestKernel::new(1);
    let (pcb, tcb) = running_user(&k);
    install_handler(&k, &pcb, &tcb, SIGUSR1, 0);
    k.scheduler.block_signals(tcb.id(), sig_mask(SIGUSR1)).expect("mask");
    k.scheduler.send_signal(pcb.id(), SIGUSR1, 7, None).expect("send");

    let mut frame = k.user_frame(USER_IP, USER_SP);
    k.tick_on(0, &mut frame);
    assert_eq!(frame.instruction_pointer(), USER_IP, "handler not entered while masked");
    assert_eq!(pcb.pending_signals(&*k.cpu), 1, "still queued");
    assert_eq!(tcb.status(), TaskStatus::Running);

    k.scheduler.unblock_signals(tcb.id(), sig_mask(SIGUSR1)).expect("unmask");
    k.tick_on(0, &mut frame);
    assert_eq!(frame.instruction_pointer(), pcb.trampoline(), "delivered once unmasked");
    assert_eq!(pcb.pending_signals(&*k.cpu), 0);
}

#[test]
fn handler_entry_and_sigreturn_round_trip() {
    let k = TestKernel::new(1);
    let (pcb, tcb) = running_user(&k);
    install_handler(&k, &pcb, &tcb, SIGUSR1, 0);
    k.scheduler.send_signal(pcb.id(), SIGUSR1, 0, Some(tcb.id())).expect("send");

    k.cpu.tag_fpu(0x5A);
    let interrupted = k.user_frame(USER_IP, USER_SP);
    let mut frame = interrupted;
    k.tick_on(0, &mut frame);

    let block = (USER_SP - 128 - StackInfo::SIZE) & !0xF;
    let sp = block - 16;
    assert_eq!(frame.instruction_pointer(), pcb.trampoline());
    assert_eq!(frame.stack_pointer(), sp);
    let space = pcb.address_space();
    assert_eq!(k.memory.read_u64(space, sp), HANDLER, "handler slot below the block");
    assert_eq!(k.memory.read_u64(space, block), SIGNAL_MAGIC);
    match frame {
        TrapFrame::X86_64(f) => {
            assert_eq!(f.rdi, SIGUSR1 as u64, "signal number is the first argument");
            assert_eq!(f.rsi, 0);
        }
        other => panic!("unexpected frame {:?}", other),
    }
    assert_eq!(tcb.signal_mask(), sig_mask(SIGUSR1), "the signal is deferred while handled");

    // The handler clobbers the FPU, then the trampoline issues sigreturn
    k.cpu.tag_fpu(0x11);
    k.scheduler.restore_handle_signal(&mut frame).expect("sigreturn");
    assert_eq!(frame, interrupted, "pre-signal frame restored");
    assert_eq!(k.cpu.fpu_tag(), 0x5A, "FPU state restored");
    assert_eq!(tcb.signal_mask(), 0, "mask restored");
}

#[test]
fn trampoline_write_fault_is_reported() {
    let k = TestKernel::new(1);
    let (pcb, tcb) = running_user(&k);
    k.memory.set_fault_below(u64::MAX);
    let result = k
        .scheduler
        .set_action(pcb.id(), tcb.id(), SIGUSR1, SignalAction::handler(HANDLER, 0, 0));
    assert!(matches!(result, Err(TaskError::MemoryFault(_))), "got {:?}", result);
    assert_eq!(pcb.trampoline(), 0);
    let action = k.scheduler.get_action(pcb.id(), tcb.id(), SIGUSR1).expect("get_action");
    assert!(action.is_default(), "nothing installed");

    k.scheduler.cleanup();
    assert_eq!(k.spaces.unmapped_pages(), 1, "the trampoline page went back");
}

#[test]
fn nodefer_and_resethand() {
    let k = TestKernel::new(1);
    let (pcb, tcb) = running_user(&k);
    install_handler(&k, &pcb, &tcb, SIGUSR2, SA_NODEFER | SA_RESETHAND);
    k.scheduler.send_signal(pcb.id(), SIGUSR2, 0, None).expect("send");

    let mut frame = k.user_frame(USER_IP, USER_SP);
    k.tick_on(0, &mut frame);
    assert_eq!(frame.instruction_pointer(), pcb.trampoline());
    assert_eq!(tcb.signal_mask(), 0, "SA_NODEFER leaves the signal unmasked");
    let action = k.scheduler.get_action(pcb.id(), tcb.id(), SIGUSR2).expect("get_action");
    assert!(action.is_default(), "SA_RESETHAND restores the default");
}

#[test]
fn linux_processes_get_linux_numbers() {
    let k = TestKernel::new(1);
    k.park_boot_threads();
    let pcb = k
        .scheduler
        .create_process(ProcessOptions::user("linux").with_compatibility(TaskCompatibility::Linux))
        .expect("create process");
    let tcb = user_thread(&k, pcb.id(), "main", TaskPriority::Normal);
    let mut frame = k.user_frame(USER_IP, USER_SP);
    k.tick_on(0, &mut frame);

    install_handler(&k, &pcb, &tcb, SIGUSR1, 0);
    let space = pcb.address_space();
    let sigreturn = k.memory.read_u32(space, pcb.trampoline() + 9);
    assert_eq!(sigreturn, 15, "rt_sigreturn in the trampoline");

    k.scheduler.send_signal(pcb.id(), SIGUSR1, 0, None).expect("send");
    k.tick_on(0, &mut frame);
    match frame {
        TrapFrame::X86_64(f) => assert_eq!(f.rdi, 10, "Linux SIGUSR1"),
        other => panic!("unexpected frame {:?}", other),
    }
}

#[test]
fn corrupt_sigreturn_kills_with_crash() {
    let k = TestKernel::new(1);
    let (pcb, _) = running_user(&k);
    let mut frame = k.user_frame(USER_IP, USER_SP);
    assert_eq!(
        k.scheduler.restore_handle_signal(&mut frame),
        Err(TaskError::BadSignalFrame)
    );
    assert_eq!(pcb.exit_code(), KillCode::Crash as i32);
    assert!(pcb.status().is_terminal());
}

#[test]
fn default_terminate_reschedules() {
    let k = TestKernel::new(1);
    let (pcb, _) = running_user(&k);
    k.scheduler.send_signal(pcb.id(), SIGTERM, 0, None).expect("send");

    let mut frame = k.user_frame(USER_IP, USER_SP);
    k.tick_on(0, &mut frame);
    assert_eq!(pcb.status(), TaskStatus::Terminated);
    assert_eq!(pcb.exit_code(), 115, "100 + native SIGTERM");
    assert_eq!(k.running_on(0), Some(idle_of(&k, 0)), "selection ran again");
}

#[test]
fn stop_and_continue() {
    let k = TestKernel::new(1);
    let (pcb, tcb) = running_user(&k);
    k.scheduler.send_signal(pcb.id(), SIGSTOP, 0, None).expect("stop");
    assert_eq!(pcb.status(), TaskStatus::Stopped);
    assert_eq!(tcb.status(), TaskStatus::Blocked);

    k.tick();
    k.tick();
    assert_eq!(k.running_on(0), Some(idle_of(&k, 0)), "stopped threads do not run");

    k.scheduler.send_signal(pcb.id(), SIGCONT, 0, None).expect("continue");
    assert_eq!(tcb.status(), TaskStatus::Ready);
    assert_eq!(pcb.pending_signals(&*k.cpu), 0, "no handler, so SIGCONT is not queued");
    k.tick();
    assert_eq!(k.running_on(0), Some(tcb.id()));
}

#[test]
fn ignored_signals_are_discarded() {
    let k = TestKernel::new(1);
    let (pcb, tcb) = running_user(&k);
    k.scheduler.send_signal(pcb.id(), SIGCHLD, 0, None).expect("send");
    assert_eq!(pcb.pending_signals(&*k.cpu), 0, "SIGCHLD is ignored by default");

    k.scheduler.block_signals(tcb.id(), sig_mask(SIGINT)).expect("mask");
    k.scheduler.send_signal(pcb.id(), SIGINT, 0, None).expect("send");
    assert_eq!(pcb.pending_signals(&*k.cpu), 1);
    let ignore = SignalAction::handler(SIG_IGN, 0, 0);
    k.scheduler.set_action(pcb.id(), tcb.id(), SIGINT, ignore).expect("ignore");
    assert_eq!(pcb.pending_signals(&*k.cpu), 0, "SIG_IGN discards queued instances");
}

#[test]
fn signal_argument_errors() {
    let k = TestKernel::new(1);
    let (pcb, tcb) = running_user(&k);
    assert_eq!(
        k.scheduler.send_signal(pcb.id(), 0, 0, None),
        Err(TaskError::InvalidSignal(0))
    );
    assert_eq!(
        k.scheduler.send_signal(Pid(999), SIGTERM, 0, None),
        Err(TaskError::NoSuchProcess(Pid(999)))
    );
    assert_eq!(
        k.scheduler.send_signal(pcb.id(), SIGTERM, 0, Some(Tid(999))),
        Err(TaskError::NoSuchThread(Tid(999)))
    );
    let handler = SignalAction::handler(HANDLER, 0, 0);
    assert_eq!(
        k.scheduler.set_action(pcb.id(), tcb.id(), SIGKILL, handler),
        Err(TaskError::UncatchableSignal(SIGKILL))
    );
    let main = k.scheduler.threads_of(KERNEL_PID)[0].clone();
    assert_eq!(
        k.scheduler.set_action(KERNEL_PID, main.id(), SIGUSR1, handler),
        Err(TaskError::KernelHandler)
    );
}

#[test]
fn sigkill_ignores_masks() {
    let k = TestKernel::new(1);
    let (pcb, tcb) = running_user(&k);
    k.scheduler.set_signal_mask(tcb.id(), u64::MAX).expect("mask");
    k.scheduler.send_signal(pcb.id(), SIGKILL, 0, None).expect("kill");
    assert_eq!(pcb.exit_code(), signal_exit_code(SIGKILL, TaskCompatibility::Native));
    assert!(pcb.status().is_terminal());
}

#[test]
fn wait_signal_consumes_the_value() {
    let k = TestKernel::new(1);
    let (pcb, tcb) = running_user(&k);
    k.scheduler.block_signals(tcb.id(), sig_mask(SIGUSR1)).expect("mask");

    let scheduler = k.scheduler.clone();
    let pid = pcb.id();
    let tid = tcb.id();
    let waiter = tcb.clone();
    k.cpu.set_yield_hook(Box::new(move || {
        assert_eq!(waiter.status(), TaskStatus::Blocked);
        scheduler.send_signal(pid, SIGUSR1, 77, Some(tid)).expect("send");
        assert_eq!(waiter.status(), TaskStatus::Ready, "sending wakes the waiter");
    }));

    assert_eq!(k.scheduler.wait_signal(SIGUSR1), Ok(77));
    assert_eq!(pcb.pending_signals(&*k.cpu), 0, "the instance was consumed");
    k.cpu.clear_yield_hook();
}

#[test]
fn wait_any_signal_is_interrupted() {
    let k = TestKernel::new(1);
    let (pcb, _) = running_user(&k);
    let scheduler = k.scheduler.clone();
    let pid = pcb.id();
    k.cpu.set_yield_hook(Box::new(move || {
        scheduler.send_signal(pid, SIGUSR2, 0, None).expect("send");
    }));
    assert_eq!(k.scheduler.wait_any_signal(), Err(TaskError::Interrupted));
    k.cpu.clear_yield_hook();
}

#[test]
fn wait_signal_timeout_expires() {
    let k = TestKernel::new(1);
    let (_, tcb) = running_user(&k);

    let scheduler = k.scheduler.clone();
    let clock = k.clock.clone();
    let arch = k.scheduler.config().architecture;
    k.cpu.set_yield_hook(Box::new(move || {
        clock.advance_ms(5);
        let mut frame = arch.empty_frame();
        scheduler.schedule(&mut frame);
    }));

    assert_eq!(k.scheduler.wait_signal_timeout(SIGUSR1, 20), Err(TaskError::TimedOut));
    assert_eq!(k.clock.now_ms(), 20, "gave up at the deadline");
    assert_eq!(k.running_on(0), Some(tcb.id()), "woken by the deadline");
    k.cpu.clear_yield_hook();
}

#[test]
fn shutdown_signal_skips_the_caller() {
    let k = TestKernel::new(1);
    let (me, _) = running_user(&k);
    let other = user_process(&k, "other");
    user_thread(&k, other.id(), "t", TaskPriority::Normal);

    k.scheduler.signal_shutdown();
    assert_eq!(other.pending_signals(&*k.cpu), 1, "SIGTERM queued");
    assert_eq!(me.pending_signals(&*k.cpu), 0);
}

// =============================================================================
// Global handle
// =============================================================================

#[test]
fn global_handle_installs_once() {
    let first = TestKernel::new(1);
    let second = TestKernel::new(1);
    assert!(crate::task::global::install(first.scheduler.clone()));
    assert!(!crate::task::global::install(second.scheduler.clone()), "second install refused");
    let installed = crate::task::global::get().expect("installed");
    assert!(Arc::ptr_eq(installed, &first.scheduler));
}
