//! Creating, killing and looking up tasks.
//!
//! Creation allocates (stacks, address spaces, arena slots) and therefore
//! runs in thread context under the list lock. Killing only publishes an
//! exit code and a status with atomic stores: it is safe from any core and
//! from interrupt context, never blocks and never frees. The cleanup pass
//! reclaims what killing leaves behind.

use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use crate::arch::{AddressSpace, Architecture, EntryPoint, MemoryFault};
use crate::error::{TaskError, TaskResult};
use crate::process::process::PcbParts;
use crate::process::{Credentials, Pcb, DEFAULT_UMASK};
use crate::signal::constants::{SIGCHLD, SIGTERM};
use crate::task::info::{CoreAffinity, ExecutionMode, TaskCompatibility, TaskInfo, TaskPriority};
use crate::task::scheduler::KERNEL_PID;
use crate::task::stack::{PendingFree, Stack, SyscallBlock};
use crate::task::startup::{self, ProgramArgs, StartupStack};
use crate::task::thread::{Tcb, TcbParts};
use crate::task::tls::{TlsBlock, TlsTemplate};
use crate::task::{KillCode, Pid, Scheduler, TaskStatus, Tid};

pub(crate) const NS_PER_MS: u64 = 1_000_000;

/// How to create a process
#[derive(Debug, Clone)]
pub struct ProcessOptions {
    pub name: String,
    pub mode: ExecutionMode,
    pub priority: TaskPriority,
    /// Defaults to every core
    pub affinity: Option<CoreAffinity>,
    pub compatibility: TaskCompatibility,
    pub working_directory: String,
    /// First byte after the loaded image; the heap grows from here
    pub program_break: u64,
    /// Inherited from the parent when unset
    pub credentials: Option<Credentials>,
    pub tls: Option<TlsTemplate>,
}

impl ProcessOptions {
    pub fn user(name: &str) -> Self {
        Self {
            name: String::from(name),
            mode: ExecutionMode::User,
            priority: TaskPriority::Normal,
            affinity: None,
            compatibility: TaskCompatibility::Native,
            working_directory: String::from("/"),
            program_break: 0,
            credentials: None,
            tls: None,
        }
    }

    pub fn kernel(name: &str) -> Self {
        Self {
            mode: ExecutionMode::Kernel,
            ..Self::user(name)
        }
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_affinity(mut self, affinity: CoreAffinity) -> Self {
        self.affinity = Some(affinity);
        self
    }

    pub fn with_compatibility(mut self, compatibility: TaskCompatibility) -> Self {
        self.compatibility = compatibility;
        self
    }

    pub fn with_working_directory(mut self, path: &str) -> Self {
        self.working_directory = String::from(path);
        self
    }

    pub fn with_program_break(mut self, addr: u64) -> Self {
        self.program_break = addr;
        self
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = Some(credentials);
        self
    }

    pub fn with_tls(mut self, template: TlsTemplate) -> Self {
        self.tls = Some(template);
        self
    }
}

/// How to create a thread; priority and affinity default to the process's
#[derive(Debug, Clone)]
pub struct ThreadOptions {
    pub name: String,
    pub entry: u64,
    pub arg: u64,
    pub priority: Option<TaskPriority>,
    pub affinity: Option<CoreAffinity>,
    /// User threads only: start here instead of the top of a fresh stack
    pub stack_pointer: Option<u64>,
    /// User threads only: argv, envp and auxv laid out on the fresh stack
    pub args: Option<ProgramArgs>,
    /// User addresses for the new tid (written now) and for zero at reap
    pub set_child_tid: u64,
    pub clear_child_tid: u64,
}

impl ThreadOptions {
    pub fn new(name: &str, entry: u64) -> Self {
        Self {
            name: String::from(name),
            entry,
            arg: 0,
            priority: None,
            affinity: None,
            stack_pointer: None,
            args: None,
            set_child_tid: 0,
            clear_child_tid: 0,
        }
    }

    pub fn with_arg(mut self, arg: u64) -> Self {
        self.arg = arg;
        self
    }

    pub fn with_priority(mut self, priority: TaskPriority) -> Self {
        self.priority = Some(priority);
        self
    }

    pub fn with_affinity(mut self, affinity: CoreAffinity) -> Self {
        self.affinity = Some(affinity);
        self
    }

    pub fn with_stack_pointer(mut self, sp: u64) -> Self {
        self.stack_pointer = Some(sp);
        self
    }

    pub fn with_args(mut self, args: ProgramArgs) -> Self {
        self.args = Some(args);
        self
    }

    pub fn with_child_tid(mut self, set: u64, clear: u64) -> Self {
        self.set_child_tid = set;
        self.clear_child_tid = clear;
        self
    }
}

impl Scheduler {
    // =========================================================================
    // Creation
    // =========================================================================

    /// Create a process with no threads.
    ///
    /// The calling thread's process becomes the parent and, unless it is the
    /// kernel, a SIGCHLD watcher that keeps the new process as a zombie until
    /// reaped. Credentials and the file-creation mask come from the parent.
    pub fn create_process(&self, options: ProcessOptions) -> TaskResult<Arc<Pcb>> {
        if self.is_stopped() {
            return Err(TaskError::SchedulerStopped);
        }
        let creator = self.current_process();
        let parent = creator.as_ref().map(|p| p.id());
        let credentials = options
            .credentials
            .or_else(|| creator.as_ref().map(|p| p.credentials()))
            .unwrap_or_default();
        let umask = creator.as_ref().map_or(DEFAULT_UMASK, |p| p.umask());
        let pid = self.allocate_pid();
        let now = self.platform.timer.now_ns();
        let affinity = options
            .affinity
            .unwrap_or(CoreAffinity::all(self.config.core_count));
        let address_space = options.mode.is_user().then(|| self.platform.spaces.create());

        let pcb = Arc::new(Pcb::new(PcbParts {
            id: pid,
            parent,
            name: options.name,
            mode: options.mode,
            info: TaskInfo::new(
                now,
                options.priority,
                affinity,
                self.config.architecture.into(),
                options.compatibility,
            ),
            address_space,
            limits: self.config.limits,
            working_directory: options.working_directory,
            program_break: options.program_break,
            credentials,
            umask,
            tls: options.tls,
        }));
        if let Some(parent) = parent.filter(|&p| p != KERNEL_PID) {
            pcb.add_watcher(parent, SIGCHLD);
        }

        {
            let _list = self.list_lock.lock();
            self.insert_process(Arc::clone(&pcb));
        }
        log::info!(
            "Created process {} '{}' ({:?}, parent {:?})",
            pid,
            pcb.name(),
            options.mode,
            parent
        );
        Ok(pcb)
    }

    /// Create a Ready thread in process `pid`.
    ///
    /// Every thread gets a guarded kernel stack. User threads also get a user
    /// stack in the process's address space and a syscall block, whose
    /// [`GsBlock`](crate::per_cpu::GsBlock) is written before the thread
    /// becomes visible, plus a TLS block when the process has a template.
    /// Program arguments go on the user stack; native programs also find
    /// argc, argv, envp and envc in the first argument registers.
    pub fn create_thread(&self, pid: Pid, options: ThreadOptions) -> TaskResult<Arc<Tcb>> {
        if self.is_stopped() {
            return Err(TaskError::SchedulerStopped);
        }
        let pcb = self.process(pid).ok_or(TaskError::NoSuchProcess(pid))?;
        if pcb.status().is_terminal() {
            return Err(TaskError::InvalidState);
        }
        let space = match (pcb.is_user(), pcb.address_space()) {
            (true, None) => return Err(TaskError::InvalidState),
            (_, space) => space,
        };

        let _list = self.list_lock.lock();
        let live = self
            .tasks
            .lock_irq(self.cpu())
            .threads_of(pid)
            .iter()
            .filter(|t| !t.status().is_terminal())
            .count();
        if pcb.is_user() && live as u64 >= pcb.limits().soft.threads {
            log::warn!("{}: thread limit reached ({})", pid, live);
            return Err(TaskError::LimitExceeded("threads"));
        }

        let tid = self.allocate_tid();
        let arch = self.config.architecture;
        let pages = &*self.platform.pages;
        let kernel_stack = Stack::allocate_kernel(pages, self.config.kernel_stack_pages, self.config.guard_pages);

        let mut user_stack = None;
        let mut syscall = None;
        let mut tls = None;
        let mut args_stack = None;
        let mut shadow_gs = 0;
        let entry = match space.filter(|_| pcb.is_user()) {
            Some(space) => {
                let stack = Stack::allocate_user(&*self.platform.spaces, space, self.config.user_stack_pages);
                let (block, gs) = SyscallBlock::allocate(pages, tid, self.config.syscall_stack_pages);
                user_stack = Some(stack);
                syscall = Some(block);
                shadow_gs = block.block;
                let written = self
                    .platform
                    .memory
                    .write(None, block.block, gs.to_bytes())
                    .and_then(|()| self.write_user_start(&pcb, space, tid, &stack, &options, &mut tls));
                match written {
                    Ok(laid_out) => args_stack = laid_out,
                    Err(fault) => {
                        self.abandon_stacks(&kernel_stack, user_stack.as_ref(), syscall.as_ref(), tls.as_ref());
                        return Err(fault.into());
                    }
                }
                EntryPoint {
                    ip: options.entry,
                    sp: args_stack
                        .map(|s| s.sp)
                        .or(options.stack_pointer)
                        .unwrap_or(stack.top() - 16),
                    arg: options.arg,
                    return_address: 0,
                    user: true,
                }
            }
            None => {
                let sp = match self.prepare_kernel_stack(&kernel_stack, options.arg) {
                    Ok(sp) => sp,
                    Err(error) => {
                        self.abandon_stacks(&kernel_stack, None, None, None);
                        return Err(error);
                    }
                };
                EntryPoint {
                    ip: options.entry,
                    sp,
                    arg: options.arg,
                    return_address: self.entries.thread_exit,
                    user: false,
                }
            }
        };

        let mut frame = arch.new_frame(&entry);
        if let Some(s) = args_stack.filter(|_| pcb.info.compatibility == TaskCompatibility::Native) {
            frame.set_startup_registers(s.argc, s.argv, s.envp, s.envc);
        }

        let tcb = Arc::new(Tcb::new(TcbParts {
            id: tid,
            owner: pid,
            name: options.name,
            mode: pcb.execution_mode(),
            info: TaskInfo::new(
                self.platform.timer.now_ns(),
                options.priority.unwrap_or(pcb.info.priority()),
                options.affinity.unwrap_or(pcb.info.affinity()),
                arch.into(),
                pcb.info.compatibility,
            ),
            frame,
            stack: kernel_stack,
            user_stack,
            syscall,
            tls,
            status: TaskStatus::Ready,
        }));
        {
            let mut context = tcb.context().lock_irq(self.cpu());
            context.bases.shadow_gs = shadow_gs;
            if let Some(tls) = &tls {
                context.bases.fs = tls.thread_pointer();
                context.bases.gs = tls.thread_pointer();
            }
        }
        if pcb.is_user() {
            tcb.store_set_child_tid(options.set_child_tid);
            tcb.set_clear_child_tid(options.clear_child_tid);
        }

        self.insert_thread(Arc::clone(&tcb));
        log::info!(
            "Created thread {} '{}' in {} (entry {:#x}, {:?})",
            tid,
            tcb.name(),
            pid,
            options.entry,
            tcb.priority()
        );
        Ok(tcb)
    }

    /// TLS block, child-tid word and program arguments of a new user thread.
    ///
    /// `tls` is set as soon as the block is mapped so a later fault still
    /// frees it.
    fn write_user_start(
        &self,
        pcb: &Pcb,
        space: AddressSpace,
        tid: Tid,
        stack: &Stack,
        options: &ThreadOptions,
        tls: &mut Option<TlsBlock>,
    ) -> Result<Option<StartupStack>, MemoryFault> {
        let memory = &*self.platform.memory;
        let word = self.config.architecture.word_size();
        if let Some(template) = pcb.tls_template() {
            match TlsBlock::allocate(&*self.platform.spaces, memory, space, &template, word) {
                Ok(block) => *tls = Some(block),
                Err((block, fault)) => {
                    *tls = Some(block);
                    return Err(fault);
                }
            }
        }
        if options.set_child_tid != 0 {
            memory.write(Some(space), options.set_child_tid, &(tid.0 as u32).to_le_bytes())?;
        }
        options
            .args
            .as_ref()
            .map(|args| startup::lay_out(memory, space, stack.top(), word, args))
            .transpose()
    }

    /// Lay out the kernel stack so the entry function returns into the exit stub
    fn prepare_kernel_stack(&self, stack: &Stack, arg: u64) -> TaskResult<u64> {
        let top = stack.top() - 16;
        let exit = self.entries.thread_exit;
        let memory = &self.platform.memory;
        match self.config.architecture {
            Architecture::X86_64 => {
                let sp = top - 8;
                memory.write(None, sp, &exit.to_le_bytes())?;
                Ok(sp)
            }
            Architecture::X86_32 => {
                let sp = top - 8;
                memory.write(None, sp, &(exit as u32).to_le_bytes())?;
                memory.write(None, sp + 4, &(arg as u32).to_le_bytes())?;
                Ok(sp)
            }
            // Return address travels in x30
            Architecture::Aarch64 => Ok(top),
        }
    }

    fn abandon_stacks(
        &self,
        kernel: &Stack,
        user: Option<&Stack>,
        syscall: Option<&SyscallBlock>,
        tls: Option<&TlsBlock>,
    ) {
        let mut deferred = self.deferred.lock();
        deferred.push(kernel.pending_free());
        deferred.extend(user.map(Stack::pending_free));
        if let Some(block) = syscall {
            deferred.extend(block.pending_frees());
        }
        deferred.extend(tls.map(TlsBlock::pending_free));
    }

    pub(crate) fn defer_free(&self, free: PendingFree) {
        self.deferred.lock().push(free);
    }

    // =========================================================================
    // Termination (lock-free, allocation-free)
    // =========================================================================

    /// Mark `thread` Terminated with `code`. Returns false if already dead.
    pub fn kill_thread(&self, thread: &Tcb, code: i32) -> bool {
        let killed = thread.terminate(code);
        if killed {
            log::debug!("{}: killed with code {}", thread.id(), code);
        }
        killed
    }

    /// Mark `process` dead with `code`. Its threads stop being scheduled at
    /// once; cleanup terminates and frees them.
    pub fn kill_process(&self, process: &Pcb, code: i32) -> bool {
        self.retire_process(process, code, false)
    }

    pub fn kill_thread_id(&self, tid: Tid, code: i32) -> TaskResult<()> {
        let thread = self.thread(tid).ok_or(TaskError::NoSuchThread(tid))?;
        self.kill_thread(&thread, code);
        Ok(())
    }

    pub fn kill_process_id(&self, pid: Pid, code: i32) -> TaskResult<()> {
        let process = self.process(pid).ok_or(TaskError::NoSuchProcess(pid))?;
        if !self.kill_process(&process, code) && process.id() == KERNEL_PID {
            return Err(TaskError::InvalidState);
        }
        Ok(())
    }

    /// Publish a process's death.
    ///
    /// Watched processes stay as Zombie (or CoreDump) until reaped, and a
    /// child-state notification is queued for the cleanup task.
    pub(crate) fn retire_process(&self, process: &Pcb, code: i32, core_dump: bool) -> bool {
        if process.id() == KERNEL_PID {
            log::error!("Refusing to kill the kernel process (code {})", code);
            return false;
        }
        let watched = process.has_watchers();
        let status = match (watched, core_dump) {
            (false, _) => TaskStatus::Terminated,
            (true, false) => TaskStatus::Zombie,
            (true, true) => TaskStatus::CoreDump,
        };
        if !process.terminate(code, status) {
            return false;
        }
        if watched && self.notifications.push(process.id()).is_err() {
            log::warn!("{}: child-state notification dropped, queue full", process.id());
        }
        log::info!("{}: exited with code {} ({:?})", process.id(), code, status);
        true
    }

    /// Linux `set_tid_address`: zero the word at `addr` when the caller is
    /// reaped. Returns the caller's tid.
    pub fn set_tid_address(&self, addr: u64) -> TaskResult<Tid> {
        if addr == 0 {
            return Err(TaskError::InvalidState);
        }
        let me = self.current_thread().ok_or(TaskError::InvalidState)?;
        me.set_clear_child_tid(addr);
        Ok(me.id())
    }

    /// Terminate the calling thread and give up the core for good
    pub fn exit_thread(&self, code: i32) {
        if let Some(me) = self.current_thread() {
            self.kill_thread(&me, code);
        }
        self.yield_now();
    }

    // =========================================================================
    // Sleeping and status
    // =========================================================================

    /// Sleep the calling thread for `ms` milliseconds
    pub fn sleep(&self, ms: u64) {
        if self.sleep_no_switch(ms) {
            self.yield_now();
        }
    }

    /// Mark the calling thread Sleeping without yielding.
    ///
    /// The thread keeps running until the next tick takes it off the core.
    pub fn sleep_no_switch(&self, ms: u64) -> bool {
        let Some(me) = self.current_thread() else {
            return false;
        };
        let deadline = self
            .platform
            .timer
            .now_ns()
            .saturating_add(ms.saturating_mul(NS_PER_MS));
        if !me.sleep(deadline) {
            return false;
        }
        let table = self.tasks.lock_irq(self.cpu());
        if table.threads_of(me.owner()).len() == 1 {
            if let Some(pcb) = table.process(me.owner()) {
                if !pcb.is_stopped() {
                    pcb.status_cell().store_if_live(TaskStatus::Sleeping);
                }
            }
        }
        true
    }

    /// Set a process's status; a single-threaded process's thread follows
    pub fn set_process_status(&self, pid: Pid, status: TaskStatus) -> TaskResult<()> {
        let table = self.tasks.lock_irq(self.cpu());
        let pcb = table.process(pid).ok_or(TaskError::NoSuchProcess(pid))?;
        if !pcb.status_cell().store_if_live(status) {
            return Err(TaskError::InvalidState);
        }
        if let [only] = table.threads_of(pid) {
            only.status_cell().store_if_live(status);
        }
        Ok(())
    }

    /// Set a process's exit code; a single-threaded process's thread follows
    pub fn set_process_exit_code(&self, pid: Pid, code: i32) -> TaskResult<()> {
        let table = self.tasks.lock_irq(self.cpu());
        let pcb = table.process(pid).ok_or(TaskError::NoSuchProcess(pid))?;
        pcb.store_exit_code(code);
        if let [only] = table.threads_of(pid) {
            only.store_exit_code(code);
        }
        Ok(())
    }

    /// Ready or Running to Blocked, under the scheduling lock
    pub fn block_thread(&self, tid: Tid) -> TaskResult<()> {
        let table = self.tasks.lock_irq(self.cpu());
        let thread = table.thread(tid).ok_or(TaskError::NoSuchThread(tid))?;
        if thread.block() {
            Ok(())
        } else {
            Err(TaskError::InvalidState)
        }
    }

    /// Blocked to Ready, under the scheduling lock
    pub fn unblock_thread(&self, tid: Tid) -> TaskResult<()> {
        let table = self.tasks.lock_irq(self.cpu());
        let thread = table.thread(tid).ok_or(TaskError::NoSuchThread(tid))?;
        if thread.unblock() {
            Self::follow_wake(&table, thread);
            Ok(())
        } else {
            Err(TaskError::InvalidState)
        }
    }

    // =========================================================================
    // Shutdown
    // =========================================================================

    /// Ask every other live process to terminate with SIGTERM
    pub fn signal_shutdown(&self) {
        let mine = self.current_process().map(|p| p.id());
        for pid in self.process_ids() {
            if Some(pid) == mine || pid == KERNEL_PID {
                continue;
            }
            if let Err(error) = self.send_signal(pid, SIGTERM, 0, None) {
                log::debug!("shutdown: {}: {}", pid, error);
            }
        }
        log::info!("Scheduler: SIGTERM sent to all processes");
    }

    /// Kill every process and thread except the caller, the idle threads and
    /// the cleanup thread, which stays to reclaim what this leaves behind
    pub fn shutdown(&self) {
        let me = self.current_thread();
        let my_pid = me.as_ref().map(|t| t.owner());
        let my_tid = me.as_ref().map(|t| t.id());
        let reaper = self.cleanup_thread();
        let code = KillCode::SchedulerDestruction.into();

        let table = self.tasks.lock_irq(self.cpu());
        for thread in table.threads() {
            let idle = self.cores.iter().any(|core| core.idle() == Some(thread.id()));
            if Some(thread.id()) == my_tid || thread.id() == reaper || idle {
                continue;
            }
            if Some(thread.owner()) == my_pid || thread.owner() == KERNEL_PID {
                thread.terminate(code);
            }
        }
        for process in table.processes() {
            if Some(process.id()) != my_pid && process.id() != KERNEL_PID {
                self.retire_process(process, code, false);
            }
        }
        drop(table);
        log::info!("Scheduler: shut down all tasks");
    }

    // =========================================================================
    // Lookups (reaped processes are invisible)
    // =========================================================================

    pub fn process(&self, pid: Pid) -> Option<Arc<Pcb>> {
        self.process_entry(pid).filter(|p| !p.is_reaped())
    }

    /// Arena entry for `pid`, reaped or not
    pub(crate) fn process_entry(&self, pid: Pid) -> Option<Arc<Pcb>> {
        self.tasks.lock_irq(self.cpu()).process(pid).cloned()
    }

    pub fn thread(&self, tid: Tid) -> Option<Arc<Tcb>> {
        self.tasks.lock_irq(self.cpu()).thread(tid).cloned()
    }

    pub fn current_thread(&self) -> Option<Arc<Tcb>> {
        let (pid, tid) = self.cores.get(self.cpu().core_id())?.current()?;
        self.tasks.lock_irq(self.cpu()).thread_in(pid, tid).cloned()
    }

    pub fn current_process(&self) -> Option<Arc<Pcb>> {
        let (pid, _) = self.cores.get(self.cpu().core_id())?.current()?;
        self.process(pid)
    }

    /// Snapshot of the live process ids
    pub fn process_ids(&self) -> Vec<Pid> {
        let _list = self.list_lock.lock();
        let count = self.tasks.lock_irq(self.cpu()).processes().len();
        let mut ids = Vec::with_capacity(count);
        let table = self.tasks.lock_irq(self.cpu());
        ids.extend(
            table
                .processes()
                .iter()
                .filter(|p| !p.is_reaped())
                .map(|p| p.id())
                .take(count),
        );
        ids
    }

    /// Snapshot of a process's threads
    pub fn threads_of(&self, pid: Pid) -> Vec<Arc<Tcb>> {
        let _list = self.list_lock.lock();
        let count = self.tasks.lock_irq(self.cpu()).threads_of(pid).len();
        let mut threads = Vec::with_capacity(count);
        let table = self.tasks.lock_irq(self.cpu());
        threads.extend(table.threads_of(pid).iter().take(count).cloned());
        threads
    }

    /// Snapshot of the live children of `pid`
    pub fn children_of(&self, pid: Pid) -> Vec<Pid> {
        let _list = self.list_lock.lock();
        let count = self.tasks.lock_irq(self.cpu()).children_of(pid).count();
        let mut children = Vec::with_capacity(count);
        let table = self.tasks.lock_irq(self.cpu());
        children.extend(
            table
                .children_of(pid)
                .filter(|p| !p.is_reaped())
                .map(|p| p.id())
                .take(count),
        );
        children
    }
}
