//! # Scheduler Interface
//!
//! The process subsystem does not implement scheduling. This module is
//! the two-way seam between the two:
//!
//! - downward, the process code consumes the scheduler through the
//!   [`SchedulerOps`] trait (thread creation, wakeup, parking, time), and
//!   builds its condition variables on top of park/unpark
//! - upward, the scheduler's context-switch path calls
//!   [`prepare_switch`] to learn which saved context to load and what to
//!   do with the MPU for the thread it selected
//!
//! The second direction carries the protection invariant: a thread that
//! is about to run userspace code gets its process's MPU regions
//! programmed, everything else runs with the process regions disabled.
//! User code therefore never executes without the MPU constraining it.

use alloc::collections::VecDeque;
use alloc::sync::Arc;

use spin::{Mutex, MutexGuard, Once};

use ferrox_abi::Pid;

use crate::mm::MpuConfiguration;
use crate::process::Process;
use crate::syscall::SyscallParameters;

/// Opaque identity of a thread, minted by the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ThreadHandle(pub u32);

/// Scheduler-side failures surfaced to the process subsystem.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedError {
    /// Not enough memory for the thread control block or its stacks
    OutOfMemory,
}

/// What the process subsystem needs from the thread scheduler.
///
/// `unpark` is sticky: an `unpark` delivered while the target is not yet
/// parked must make that target's next `park_current` return immediately.
/// Condition variables depend on this to close the race between
/// registering as a waiter and actually parking.
pub trait SchedulerOps: Send + Sync {
    /// PID of the process owning the current thread; 0 for kernel threads.
    fn current_pid(&self) -> Pid;

    /// Handle of the current thread.
    fn current_thread(&self) -> ThreadHandle;

    /// Creates the main thread of a process, dormant. The thread will run
    /// `main(proc)` in kernelspace mode once woken with `wakeup`.
    fn create_userspace_thread(
        &self,
        main: fn(Arc<Process>),
        proc: Arc<Process>,
    ) -> Result<ThreadHandle, SchedError>;

    /// Starts a thread created dormant.
    fn wakeup(&self, thread: ThreadHandle);

    /// True when the current thread has been asked to terminate.
    fn test_terminate(&self) -> bool;

    /// Blocks the current thread until someone unparks it. May return
    /// spuriously; callers re-check their predicate in a loop.
    fn park_current(&self);

    /// Wakes `thread` out of `park_current`, stickily.
    fn unpark(&self, thread: ThreadHandle);

    /// Monotonic clock, nanoseconds since boot.
    fn monotonic_ns(&self) -> i64;

    /// Blocks the current thread until the monotonic clock passes
    /// `deadline`.
    fn sleep_until_ns(&self, deadline: i64);

    /// Resolution of the monotonic clock in nanoseconds.
    fn clock_resolution_ns(&self) -> i64 {
        1
    }

    /// Initializes the current thread's userspace saved context: program
    /// counter at `entry`, stack pointer at `argv` (the args block is the
    /// initial stack top), `argc`/`argv`/`envp` in the argument
    /// registers. `image_base` and `stack_size` let the thread library
    /// place its stack bookkeeping.
    fn setup_userspace_context(
        &self,
        entry: usize,
        argc: usize,
        argv: usize,
        envp: usize,
        image_base: usize,
        stack_size: usize,
    );

    /// Switches the current thread to userspace mode and returns when it
    /// traps back in, handing over the supervisor-call frame.
    fn switch_to_userspace(&self) -> SyscallParameters<'static>;
}

static SCHEDULER: Once<&'static dyn SchedulerOps> = Once::new();

/// Installs the scheduler. Called once during boot, before the first
/// process is created.
pub fn set_scheduler(sched: &'static dyn SchedulerOps) {
    SCHEDULER.call_once(|| sched);
}

/// The installed scheduler.
///
/// # Panics
///
/// If called before `set_scheduler`; that is a boot ordering bug.
pub fn scheduler() -> &'static dyn SchedulerOps {
    *SCHEDULER.get().expect("scheduler used before init")
}

/// Condition variable built over the scheduler's park/unpark.
///
/// Waiters can wake spuriously; use it the POSIX way, re-checking the
/// predicate under the lock in a loop.
pub struct CondVar {
    waiters: Mutex<VecDeque<ThreadHandle>>,
}

impl CondVar {
    pub const fn new() -> Self {
        Self {
            waiters: Mutex::new(VecDeque::new()),
        }
    }

    /// Atomically releases `guard`, waits for a `broadcast`, and
    /// re-acquires `lock`.
    ///
    /// The waiter registers itself before dropping the guard, so a
    /// broadcast arriving between the drop and the park is not lost
    /// (sticky unpark, see [`SchedulerOps`]).
    pub fn wait<'a, T>(&self, guard: MutexGuard<'a, T>, lock: &'a Mutex<T>) -> MutexGuard<'a, T> {
        let me = scheduler().current_thread();
        self.waiters.lock().push_back(me);
        drop(guard);
        scheduler().park_current();
        lock.lock()
    }

    /// Wakes every current waiter.
    pub fn broadcast(&self) {
        let mut waiters = self.waiters.lock();
        while let Some(t) = waiters.pop_front() {
            scheduler().unpark(t);
        }
    }
}

impl Default for CondVar {
    fn default() -> Self {
        Self::new()
    }
}

/// Saved-context pointers and mode of a thread, as the scheduler's
/// switch path sees them. Process threads carry two saved contexts: the
/// kernel one used while servicing syscalls and the userspace one used
/// while running user code.
pub struct ThreadSwitchState {
    pub kernel_ctx: *mut u32,
    pub user_ctx: *mut u32,
    /// True when the thread was preempted while in userspace mode.
    pub in_userspace: bool,
    /// The owning process; `None` for kernel threads.
    pub process: Option<Arc<Process>>,
}

/// What the switch path must do with the MPU before resuming a thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MpuAction {
    /// Kernel thread, or process thread in kernelspace mode: no user
    /// regions active.
    Disable,
    /// Userspace-mode process thread: program these regions.
    Program(MpuConfiguration),
}

/// Picks the saved context and MPU action for the thread the scheduler
/// selected. Call with interrupts disabled, immediately before the
/// context restore.
pub fn prepare_switch(t: &ThreadSwitchState) -> (*mut u32, MpuAction) {
    match (&t.process, t.in_userspace) {
        (Some(proc), true) => (t.user_ctx, MpuAction::Program(proc.mpu())),
        _ => (t.kernel_ctx, MpuAction::Disable),
    }
}

/// Applies an `MpuAction` to the hardware.
pub fn apply_mpu(action: &MpuAction) {
    match action {
        MpuAction::Disable => crate::arch::disable_mpu(),
        MpuAction::Program(cfg) => crate::arch::enable_mpu(cfg),
    }
}
