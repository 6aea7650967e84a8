//! # Process Management
//!
//! One process is one protected user context: a validated program, its
//! RAM image, the MPU configuration covering exactly those two, a file
//! descriptor table inherited from the parent, and (for now) a single
//! thread.
//!
//! ## Submodules
//!
//! - `elf`: ELF32 validation and program ownership
//! - `cache`: shared cache of programs copied to RAM
//! - `image`: materializing a program into a pool block
//! - `args`: the packed, relocatable argv/envp block
//!
//! ## Lifecycle
//!
//! `spawn` packs the arguments, loads the program and calls `create`,
//! which builds the process, publishes it in the table under a fresh PID
//! and starts its main thread. When the main loop ends the process turns
//! zombie; `waitpid` reaps zombies and frees the last resources. Orphaned
//! children are reparented to PID 0, the kernel itself.
//!
//! The process table mutex serializes creation, termination and waiting.
//! It is never held together with the process pool mutex.

pub mod args;
pub mod cache;
pub mod elf;
pub mod image;

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI32, Ordering};

use spin::{Mutex, MutexGuard, RwLock};

use ferrox_abi::{errno, Pid, WaitFlags};

use crate::arch::FaultInfo;
use crate::config::{WATERMARK_FILL, WATERMARK_LEN};
use crate::fs::FileDescriptorTable;
use crate::mm::pool::pool;
use crate::mm::MpuConfiguration;
use crate::sched::{scheduler, CondVar, ThreadHandle};

pub use args::{ArgsBlock, ArgsError};
pub use elf::{ElfError, ElfProgram};
pub use image::ProcessImage;

/// Process operation errors.
#[derive(Debug)]
pub enum ProcessError {
    /// Program validation or fetch failed
    Elf(ElfError),
    /// argv/envp exceed the argument block limits
    ArgsTooBig,
    /// Process pool could not hold the image
    OutOfMemory,
    /// The scheduler could not create the main thread
    ThreadCreation,
}

impl ProcessError {
    /// Negative errno for the syscall boundary.
    pub fn errno(&self) -> i32 {
        match self {
            ProcessError::Elf(e) => e.errno(),
            ProcessError::ArgsTooBig => -errno::E2BIG,
            ProcessError::OutOfMemory => -errno::ENOMEM,
            ProcessError::ThreadCreation => -errno::ENOMEM,
        }
    }
}

impl From<ElfError> for ProcessError {
    fn from(e: ElfError) -> Self {
        ProcessError::Elf(e)
    }
}

impl core::fmt::Display for ProcessError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ProcessError::Elf(e) => write!(f, "program load failed: {}", e),
            ProcessError::ArgsTooBig => write!(f, "argument list too long"),
            ProcessError::OutOfMemory => write!(f, "out of memory"),
            ProcessError::ThreadCreation => write!(f, "thread creation failed"),
        }
    }
}

/// Everything `execve` replaces in one piece: the program, its image,
/// the MPU regions derived from them and the argv/envp addresses inside
/// the image.
pub(crate) struct LoadedState {
    pub program: ElfProgram,
    pub image: ProcessImage,
    pub mpu: MpuConfiguration,
    pub argc: usize,
    /// Address of the argv array inside the image; doubles as the initial
    /// stack pointer.
    pub argv: usize,
    /// Address of the envp array inside the image.
    pub envp: usize,
}

/// One protected user context.
pub struct Process {
    pid: AtomicI32,
    exit_code: AtomicI32,
    /// Written only by the process's own thread (during `execve`) while
    /// it is in kernelspace mode; the scheduler reads the MPU out of it
    /// only for userspace-mode threads, so the read lock is uncontended
    /// by construction.
    pub(crate) loaded: RwLock<LoadedState>,
    pub(crate) file_table: Mutex<FileDescriptorTable>,
    fault: Mutex<Option<FaultInfo>>,
    threads: Mutex<Vec<ThreadHandle>>,
}

impl Process {
    /// Builds a process from a validated program: loads the image,
    /// relocates the arguments into it and derives the MPU regions. The
    /// process is not yet published anywhere.
    fn new(
        file_table: FileDescriptorTable,
        program: ElfProgram,
        args: ArgsBlock,
    ) -> Result<Arc<Self>, ProcessError> {
        let loaded = Self::load_state(program, args)?;
        Ok(Arc::new(Self {
            pid: AtomicI32::new(0),
            exit_code: AtomicI32::new(0),
            loaded: RwLock::new(loaded),
            file_table: Mutex::new(file_table),
            fault: Mutex::new(None),
            // Capacity for the first thread is reserved here so that
            // attaching it after the process became visible cannot fail
            threads: Mutex::new(Vec::with_capacity(1)),
        }))
    }

    fn load_state(program: ElfProgram, args: ArgsBlock) -> Result<LoadedState, ProcessError> {
        let image = ProcessImage::load(&program, pool())
            .map_err(|_| ProcessError::OutOfMemory)?;
        // The validator checked data+stack+watermark against the RAM
        // size, but the args block size was unknown then. The block is
        // not part of the stack: it pushes the stack down and eats from
        // the heap area, so the only way this fails is a heap area
        // smaller than the args block.
        if image.data_bss_size() + WATERMARK_LEN + image.main_stack_size() + args.size()
            > image.size()
        {
            return Err(ProcessError::OutOfMemory);
        }
        let argv = image.base() + image.size() - args.size();
        // SAFETY: [argv, argv + args.size()) is inside the image block by
        // the check above
        unsafe { args.relocate_to(argv as *mut u8, argv as u32) };

        // Watermark below the stack: overruns of the main stack land here
        // and are detectable
        let watermark = argv - image.main_stack_size() - WATERMARK_LEN;
        // SAFETY: the watermark area is inside the image, above data+bss
        unsafe {
            let words = watermark as *mut u32;
            for i in 0..WATERMARK_LEN / 4 {
                words.add(i).write(WATERMARK_FILL);
            }
        }

        // XIP filesystems may store the program without the alignment the
        // MPU wants, so grow the region to the nearest valid one. The
        // extra bytes are readable but the region is read-only, so the
        // protection of everything writable is intact.
        let (code_base, code_size) = if program.is_copied_in_ram() {
            (program.elf_base(), program.elf_size())
        } else {
            MpuConfiguration::round_region_for_mpu(program.elf_base(), program.elf_size())
        };
        let mpu = MpuConfiguration::new(code_base, code_size, image.base(), image.size());

        Ok(LoadedState {
            argc: args.number_of_arguments(),
            argv,
            envp: argv + args.env_index(),
            program,
            image,
            mpu,
        })
    }

    /// Replaces the running program in place; the `execve` back end.
    ///
    /// TODO: the old image is deallocated before the new one is
    /// allocated. If the new allocation fails the process cannot be
    /// resurrected, because its memory is gone, and the caller has to
    /// kill it. A reserve-then-swap primitive in the pool would make
    /// this recoverable.
    pub(crate) fn reload(
        &self,
        program: ElfProgram,
        args: ArgsBlock,
    ) -> Result<(), ProcessError> {
        let mut loaded = self.loaded.write();
        let new_state = {
            let placeholder = ProcessImage::empty(pool());
            let old_image = core::mem::replace(&mut loaded.image, placeholder);
            drop(old_image); // old block returns to the pool here
            Self::load_state(program, args)?
        };
        *loaded = new_state;
        Ok(())
    }

    /// The process id, zero until the table published the process.
    pub fn pid(&self) -> Pid {
        self.pid.load(Ordering::Relaxed)
    }

    /// The MPU configuration of the currently loaded program.
    pub fn mpu(&self) -> MpuConfiguration {
        self.loaded.read().mpu
    }

    /// Raw wait-status word, valid once the process is a zombie.
    pub fn exit_code(&self) -> i32 {
        self.exit_code.load(Ordering::Relaxed)
    }

    pub(crate) fn set_exit_code(&self, status: i32) {
        self.exit_code.store(status, Ordering::Relaxed);
    }

    /// Records a hardware fault for the dispatcher to find. Called from
    /// the fault-capture path.
    pub fn record_fault(&self, fault: FaultInfo) {
        *self.fault.lock() = Some(fault);
    }

    pub(crate) fn take_fault(&self) -> Option<FaultInfo> {
        self.fault.lock().take()
    }

    /// Main loop of a process's first thread. Runs in kernelspace mode;
    /// every iteration switches to userspace and services whatever
    /// brought the thread back: a syscall, a termination request or a
    /// fault.
    pub(crate) fn main_loop(proc: Arc<Process>) {
        use crate::syscall::{handle_svc, SvcResult};
        let sched = scheduler();
        let mut running = true;
        while running {
            {
                let loaded = proc.loaded.read();
                sched.setup_userspace_context(
                    loaded.program.entry_point(),
                    loaded.argc,
                    loaded.argv,
                    loaded.envp,
                    loaded.image.base(),
                    loaded.image.main_stack_size(),
                );
            }
            let mut svc_result = SvcResult::Resume;
            loop {
                let mut sp = sched.switch_to_userspace();

                let fault = proc.take_fault();
                // A fault leaves the saved frame unreliable; skip the svc
                if fault.is_none() {
                    svc_result = handle_svc(&proc, &mut sp);
                }

                if sched.test_terminate() || svc_result == SvcResult::Exit {
                    running = false;
                }
                if fault.is_some() || svc_result == SvcResult::Segfault {
                    running = false;
                    proc.set_exit_code(ferrox_abi::wait::signal_status(
                        ferrox_abi::signal::SIGSEGV,
                    ));
                    log::error!("process {} terminated due to a fault", proc.pid());
                    let loaded = proc.loaded.read();
                    log::error!("* code base address was {:#x}", loaded.program.elf_base());
                    log::error!("* data base address was {:#x}", loaded.image.base());
                    loaded.mpu.log_configuration();
                    if let Some(f) = fault {
                        f.log();
                    }
                }
                if !running || svc_result == SvcResult::Execve {
                    break;
                }
            }
            if running && svc_result == SvcResult::Execve {
                proc.file_table.lock().cloexec();
            }
        }
        proc.file_table.lock().close_all();
        PROCESS_TABLE.finalize(&proc);
    }
}

/// One row of the process table. Relationship state lives here, under
/// the table mutex, not inside `Process`: the table is the only place
/// that links processes to each other, so there is no pointer graph to
/// corrupt.
struct TableEntry {
    /// `None` only for PID 0, the kernel itself.
    proc: Option<Arc<Process>>,
    ppid: Pid,
    children: Vec<Pid>,
    zombies: Vec<Pid>,
    /// Count of `waitpid` calls targeting specifically this process.
    wait_count: i32,
    /// Waiters targeting this process sleep here.
    waiting: Arc<CondVar>,
    zombie: bool,
}

impl TableEntry {
    fn new(proc: Option<Arc<Process>>, ppid: Pid) -> Self {
        Self {
            proc,
            ppid,
            children: Vec::new(),
            zombies: Vec::new(),
            wait_count: 0,
            waiting: Arc::new(CondVar::new()),
            zombie: false,
        }
    }
}

struct Inner {
    pid_counter: Pid,
    entries: BTreeMap<Pid, TableEntry>,
}

/// Outcome of a `waitpid` call that did not error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// A child was reaped; its PID and wait status.
    Reaped { pid: Pid, status: i32 },
    /// `WNOHANG` and nothing has terminated yet.
    NothingYet,
    /// The target terminated but another waiter performs the reap.
    Deferred,
}

/// `waitpid` errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    /// The caller has no children, or the target is not its child.
    NoChildren,
}

/// The global registry of all live and zombie processes.
pub struct ProcessTable {
    inner: Mutex<Inner>,
    /// Waiters for "any child" sleep here.
    generic_waiting: CondVar,
}

/// The one process table.
pub static PROCESS_TABLE: ProcessTable = ProcessTable::new();

impl ProcessTable {
    const fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                pid_counter: 1,
                entries: BTreeMap::new(),
            }),
            generic_waiting: CondVar::new(),
        }
    }

    /// Locks the table, materializing the kernel's own entry on first
    /// use.
    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock();
        if !inner.entries.contains_key(&0) {
            inner.entries.insert(0, TableEntry::new(None, 0));
        }
        inner
    }

    fn alloc_pid(inner: &mut Inner) -> Pid {
        loop {
            if inner.pid_counter <= 0 {
                // The counter wrapped; zero stays reserved for the kernel
                inner.pid_counter = 1;
            }
            if !inner.entries.contains_key(&inner.pid_counter) {
                let pid = inner.pid_counter;
                inner.pid_counter = inner.pid_counter.wrapping_add(1);
                return pid;
            }
            inner.pid_counter = inner.pid_counter.wrapping_add(1);
        }
    }

    /// Creates a process executing `program` with `args`, as a child of
    /// the calling process. Returns the new PID.
    pub fn create(&self, program: ElfProgram, args: ArgsBlock) -> Result<Pid, ProcessError> {
        let parent_pid = scheduler().current_pid();

        // Snapshot the parent's descriptor table outside the table lock;
        // the parent is the caller, so it cannot go away concurrently
        let parent_fdt = {
            let inner = self.lock_inner();
            match inner.entries.get(&parent_pid).and_then(|e| e.proc.clone()) {
                Some(parent) => parent.file_table.lock().clone(),
                None => FileDescriptorTable::new(),
            }
        };

        // Loading must succeed before the process joins the table
        let proc = Process::new(parent_fdt, program, args)?;

        let pid = {
            let mut inner = self.lock_inner();
            let pid = Self::alloc_pid(&mut inner);
            proc.pid.store(pid, Ordering::Relaxed);
            inner.entries.insert(pid, TableEntry::new(Some(proc.clone()), parent_pid));
            if let Some(parent) = inner.entries.get_mut(&parent_pid) {
                parent.children.push(pid);
            }
            pid
        };

        match scheduler().create_userspace_thread(Process::main_loop, proc.clone()) {
            Ok(thread) => {
                // Cannot fail: capacity was reserved at construction
                proc.threads.lock().push(thread);
                scheduler().wakeup(thread);
                log::debug!("created process {} (parent {})", pid, parent_pid);
                Ok(pid)
            }
            Err(_) => {
                // Roll back the publication made above
                let mut inner = self.lock_inner();
                inner.entries.remove(&pid);
                if let Some(parent) = inner.entries.get_mut(&parent_pid) {
                    parent.children.retain(|&c| c != pid);
                }
                Err(ProcessError::ThreadCreation)
            }
        }
    }

    /// Packs the arguments, loads `path` and creates the process.
    pub fn spawn(
        &self,
        path: &str,
        argv: &[&[u8]],
        envp: &[&[u8]],
    ) -> Result<Pid, ProcessError> {
        let args = ArgsBlock::new(argv, envp).map_err(|_| ProcessError::ArgsTooBig)?;
        let abs = self.resolve_path(path)?;
        let program = ElfProgram::from_path(&abs)?;
        self.create(program, args)
    }

    /// Resolves `path` against the calling process's working directory.
    fn resolve_path(&self, path: &str) -> Result<alloc::string::String, ProcessError> {
        let current = {
            let inner = self.lock_inner();
            inner
                .entries
                .get(&scheduler().current_pid())
                .and_then(|e| e.proc.clone())
        };
        let resolved = match current {
            Some(proc) => proc.file_table.lock().absolute_path(path),
            None => FileDescriptorTable::new().absolute_path(path),
        };
        resolved.map_err(|e| match e {
            crate::fs::FsError::NameTooLong => ProcessError::Elf(ElfError::NameTooLong),
            _ => ProcessError::Elf(ElfError::NotFound),
        })
    }

    /// The process registered under `pid`, if any.
    pub fn get(&self, pid: Pid) -> Option<Arc<Process>> {
        self.lock_inner().entries.get(&pid).and_then(|e| e.proc.clone())
    }

    /// Parent PID of `pid`: zero for kernel-created processes, `None`
    /// when `pid` names no process.
    pub fn getppid(&self, pid: Pid) -> Option<Pid> {
        self.lock_inner().entries.get(&pid).map(|e| e.ppid)
    }

    /// Waits for child termination; the decision logic of the `waitpid`
    /// syscall. `pid <= 0` waits for any child, a positive `pid` for that
    /// specific child.
    pub fn waitpid(&self, pid: Pid, options: WaitFlags) -> Result<WaitOutcome, WaitError> {
        let self_pid = scheduler().current_pid();
        let mut inner = self.lock_inner();

        if pid <= 0 {
            // Wait for a generic child process
            loop {
                let (zombie_pid, has_children) = {
                    let entry =
                        inner.entries.get_mut(&self_pid).ok_or(WaitError::NoChildren)?;
                    let zombie = if entry.zombies.is_empty() {
                        None
                    } else {
                        Some(entry.zombies.remove(0))
                    };
                    (zombie, !entry.children.is_empty())
                };
                if let Some(zombie_pid) = zombie_pid {
                    let joined = inner
                        .entries
                        .remove(&zombie_pid)
                        .expect("zombie list referenced a pid not in the table");
                    debug_assert_eq!(joined.wait_count, 0);
                    let status = joined
                        .proc
                        .as_ref()
                        .map(|p| p.exit_code())
                        .unwrap_or_default();
                    return Ok(WaitOutcome::Reaped {
                        pid: zombie_pid,
                        status,
                    });
                }
                if options.contains(WaitFlags::WNOHANG) {
                    return Ok(WaitOutcome::NothingYet);
                }
                if !has_children {
                    return Err(WaitError::NoChildren);
                }
                inner = self.generic_waiting.wait(inner, &self.inner);
            }
        }

        // Wait on one specific child process
        let entry = inner.entries.get(&pid);
        let is_child = entry.is_some_and(|e| e.ppid == self_pid) && pid != self_pid;
        if !is_child {
            return Err(WaitError::NoChildren);
        }
        if !inner.entries[&pid].zombie {
            if options.contains(WaitFlags::WNOHANG) {
                return Ok(WaitOutcome::NothingYet);
            }
            let waiting = {
                let entry = inner.entries.get_mut(&pid).ok_or(WaitError::NoChildren)?;
                entry.wait_count += 1;
                entry.waiting.clone()
            };
            loop {
                inner = waiting.wait(inner, &self.inner);
                if inner.entries.get(&pid).is_none_or(|e| e.zombie) {
                    break;
                }
            }
            if let Some(entry) = inner.entries.get_mut(&pid) {
                entry.wait_count -= 1;
            }
        }
        let Some(entry) = inner.entries.get(&pid) else {
            // Another waiter already reaped it
            return Ok(WaitOutcome::Deferred);
        };
        if entry.wait_count != 0 {
            // Not the last targeted waiter out; the reap is theirs
            return Ok(WaitOutcome::Deferred);
        }
        let joined = inner.entries.remove(&pid).expect("entry checked above");
        let status = joined
            .proc
            .as_ref()
            .map(|p| p.exit_code())
            .unwrap_or_default();
        if let Some(parent) = inner.entries.get_mut(&self_pid) {
            parent.zombies.retain(|&z| z != pid);
        }
        Ok(WaitOutcome::Reaped { pid, status })
    }

    /// Turns a terminated process into a zombie: reparents its children
    /// to the kernel, detaches it from its parent and wakes whoever is
    /// waiting. Called by the main loop after the last userspace return.
    pub(crate) fn finalize(&self, proc: &Arc<Process>) {
        let pid = proc.pid();
        let mut inner = self.lock_inner();
        let Some(entry) = inner.entries.get_mut(&pid) else {
            log::error!("finalize of unknown process {}", pid);
            return;
        };
        entry.zombie = true;
        let children = core::mem::take(&mut entry.children);
        let zombies = core::mem::take(&mut entry.zombies);
        let ppid = entry.ppid;
        let wait_count = entry.wait_count;
        let waiting = entry.waiting.clone();

        // Orphans, live or dead, become the kernel's
        for &child in children.iter().chain(zombies.iter()) {
            if let Some(c) = inner.entries.get_mut(&child) {
                c.ppid = 0;
            }
        }
        let kernel = inner.entries.get_mut(&0).expect("kernel entry exists");
        kernel.children.extend_from_slice(&children);
        kernel.zombies.extend_from_slice(&zombies);

        let parent = inner
            .entries
            .get_mut(&ppid)
            .unwrap_or_else(|| panic!("parent {} of {} not in table", ppid, pid));
        parent.children.retain(|&c| c != pid);
        if wait_count > 0 {
            // Targeted waiters reap it; it never enters a zombie list
            waiting.broadcast();
        } else {
            parent.zombies.push(pid);
            self.generic_waiting.broadcast();
        }
        log::debug!("process {} is now a zombie (status {:#x})", pid, proc.exit_code());
    }

    /// Number of table entries, the kernel's included; diagnostics only.
    pub fn len(&self) -> usize {
        self.lock_inner().entries.len()
    }

    /// Always false: the kernel entry exists.
    pub fn is_empty(&self) -> bool {
        false
    }
}
