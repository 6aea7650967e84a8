//! # Syscall Dispatcher
//!
//! Every trap from userspace lands here with the saved-register frame of
//! the calling thread. The dispatcher decodes the syscall id, validates
//! every argument, calls the kernel service and writes results back into
//! the frame.
//!
//! The core rule: before any kernel service dereferences a user-supplied
//! pointer, the corresponding `within_for_reading`/`within_for_writing`
//! check against the caller's MPU configuration must have succeeded.
//! A failed check costs the caller `-EFAULT` and nothing else; the
//! kernel state does not change.
//!
//! The outer loop's state machine is explicit: each handled SVC yields a
//! [`SvcResult`] telling the main loop whether to resume userspace,
//! reload after `execve`, exit cleanly, or kill the process.

use alloc::sync::Arc;
use alloc::vec::Vec;

use ferrox_abi::{errno, signal, wait, OpenFlags, Syscall, WaitFlags};

use crate::fs::Stat;
use crate::mm::MpuConfiguration;
use crate::process::{Process, WaitError, WaitOutcome, PROCESS_TABLE};
use crate::sched::scheduler;

/// View over the saved register frame of a thread at the SVC boundary:
/// the syscall id plus four word-sized slots that carry arguments in and
/// results out. A 64 bit result occupies slots 0 and 1.
pub struct SyscallParameters<'a> {
    id: u32,
    regs: &'a mut [usize; 4],
}

impl<'a> SyscallParameters<'a> {
    pub fn new(id: u32, regs: &'a mut [usize; 4]) -> Self {
        Self { id, regs }
    }

    pub fn syscall_id(&self) -> u32 {
        self.id
    }

    pub fn parameter(&self, index: usize) -> usize {
        self.regs[index]
    }

    pub fn set_parameter(&mut self, index: usize, value: usize) {
        self.regs[index] = value;
    }

    /// Writes an `int`-shaped result into slot 0.
    pub fn set_return(&mut self, value: i32) {
        self.regs[0] = value as isize as usize;
    }

    /// Splits a 64 bit result across slots 0 (low) and 1 (high).
    pub fn set_return64(&mut self, value: i64) {
        self.regs[0] = (value as u64 & 0xffff_ffff) as usize;
        self.regs[1] = (value as u64 >> 32) as usize;
    }

    /// Reassembles a 64 bit argument from a (high, low) slot pair.
    pub fn parameter64(&self, high: usize, low: usize) -> i64 {
        (self.regs[low] as u32 as i64) | ((self.regs[high] as u32 as i64) << 32)
    }
}

/// What the main loop does after a handled supervisor call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SvcResult {
    /// Switch back to userspace and keep running.
    Resume,
    /// The process exited; become a zombie.
    Exit,
    /// The program was replaced in place; restart from its entry point.
    Execve,
    /// Unrecoverable: kill the process with a signal exit code.
    Segfault,
}

/// Word alignment check for struct out-pointers from userspace.
fn aligned(p: usize) -> bool {
    p & 0b11 == 0
}

/// Borrows the NUL-terminated string at `p`.
///
/// # Safety
///
/// `within_for_reading_cstr(p)` must have returned true for the caller's
/// MPU configuration, which proves a terminator exists inside readable
/// memory.
unsafe fn user_cstr<'a>(p: usize) -> &'a [u8] {
    let mut len = 0usize;
    // SAFETY: the terminator was found by the validation walk
    unsafe {
        while core::ptr::read_volatile((p + len) as *const u8) != 0 {
            len += 1;
        }
        core::slice::from_raw_parts(p as *const u8, len)
    }
}

/// Borrows the string at `p` as UTF-8, after validating that it lies
/// entirely inside the caller's readable regions. Non-UTF-8 bytes fail
/// too: no mounted filesystem can name such a file.
unsafe fn user_path<'a>(mpu: &MpuConfiguration, p: usize) -> Option<&'a str> {
    // SAFETY: bounds-checked byte walk
    if !unsafe { mpu.within_for_reading_cstr(p as *const u8) } {
        return None;
    }
    // SAFETY: the walk above found the terminator
    core::str::from_utf8(unsafe { user_cstr(p) }).ok()
}

/// Validates a null-terminated string array such as the argv of `execve`:
/// each slot must be readable, each non-null slot must point at a valid
/// C string inside the caller's regions. Returns the collected strings,
/// or `None` on any failure.
fn validate_string_array<'a>(
    mpu: &MpuConfiguration,
    array: usize,
) -> Option<Vec<&'a [u8]>> {
    let mut out = Vec::new();
    let mut slot = array;
    loop {
        // Is the array element itself safe to dereference?
        if !mpu.within_for_reading(slot, core::mem::size_of::<usize>()) {
            return None;
        }
        // SAFETY: the slot is inside the caller's readable regions
        let ptr = unsafe { core::ptr::read_unaligned(slot as *const usize) };
        if ptr == 0 {
            return Some(out);
        }
        // Is the string it points at entirely readable?
        // SAFETY: bounds-checked byte walk
        if !unsafe { mpu.within_for_reading_cstr(ptr as *const u8) } {
            return None;
        }
        // SAFETY: terminator found above
        out.push(unsafe { user_cstr(ptr) });
        slot += core::mem::size_of::<usize>();
    }
}

/// Writes `st` to the user pointer `p`, which must already have passed
/// the write and alignment checks.
unsafe fn put_stat(p: usize, st: &Stat) {
    // SAFETY: caller validated [p, p+size_of::<Stat>()) as writable
    unsafe { core::ptr::write_unaligned(p as *mut Stat, *st) }
}

/// Handles one supervisor call from `proc`'s thread. Argument validation
/// precedes every kernel call; see the module docs.
pub fn handle_svc(proc: &Arc<Process>, sp: &mut SyscallParameters) -> SvcResult {
    let mpu = proc.mpu();
    let Some(syscall) = Syscall::from_id(sp.syscall_id()) else {
        // Bad syscall id: kill the process
        log::error!(
            "process {}: unexpected syscall number {}",
            proc.pid(),
            sp.syscall_id()
        );
        proc.set_exit_code(wait::signal_status(signal::SIGSYS));
        return SvcResult::Segfault;
    };

    match syscall {
        // The scheduler services these in the trap path; by the time the
        // dispatcher sees one there is nothing left to do
        Syscall::Yield | Syscall::Userspace => {}

        Syscall::Open => {
            let name = sp.parameter(0);
            let flags = sp.parameter(1) as u32;
            match unsafe { user_path(&mpu, name) } {
                Some(path) => {
                    let mode = if OpenFlags::from_bits_truncate(flags).contains(OpenFlags::CREAT)
                    {
                        sp.parameter(2) as u32
                    } else {
                        0
                    };
                    let res = proc.file_table.lock().open(path, flags, mode);
                    sp.set_return(res.unwrap_or_else(|e| e.errno()));
                }
                None => sp.set_return(-errno::EFAULT),
            }
        }

        Syscall::Close => {
            let res = proc.file_table.lock().close(sp.parameter(0) as i32);
            sp.set_return(res.map(|_| 0).unwrap_or_else(|e| e.errno()));
        }

        Syscall::Read => {
            let fd = sp.parameter(0) as i32;
            let ptr = sp.parameter(1);
            let size = sp.parameter(2);
            if mpu.within_for_writing(ptr, size) {
                // SAFETY: the range is inside the caller's writable region
                let buf = unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, size) };
                let res = proc.file_table.lock().read(fd, buf);
                sp.set_return(res.map(|n| n as i32).unwrap_or_else(|e| e.errno()));
            } else {
                sp.set_return(-errno::EFAULT);
            }
        }

        Syscall::Write => {
            let fd = sp.parameter(0) as i32;
            let ptr = sp.parameter(1);
            let size = sp.parameter(2);
            if mpu.within_for_reading(ptr, size) {
                // SAFETY: the range is inside the caller's readable regions
                let buf = unsafe { core::slice::from_raw_parts(ptr as *const u8, size) };
                let res = proc.file_table.lock().write(fd, buf);
                sp.set_return(res.map(|n| n as i32).unwrap_or_else(|e| e.errno()));
            } else {
                sp.set_return(-errno::EFAULT);
            }
        }

        Syscall::Lseek => {
            let pos = sp.parameter64(1, 2);
            let res = proc.file_table.lock().lseek(
                sp.parameter(0) as i32,
                pos,
                sp.parameter(3) as u32,
            );
            match res {
                Ok(off) => sp.set_return64(off),
                Err(e) => sp.set_return64(e.errno() as i64),
            }
        }

        Syscall::Stat | Syscall::Lstat => {
            let name = sp.parameter(0);
            let pstat = sp.parameter(1);
            let path = unsafe { user_path(&mpu, name) };
            if path.is_some()
                && mpu.within_for_writing(pstat, core::mem::size_of::<Stat>())
                && aligned(pstat)
            {
                let ft = proc.file_table.lock();
                let res = if syscall == Syscall::Stat {
                    ft.stat(path.unwrap_or_default())
                } else {
                    ft.lstat(path.unwrap_or_default())
                };
                match res {
                    Ok(st) => {
                        // SAFETY: write-checked and aligned above
                        unsafe { put_stat(pstat, &st) };
                        sp.set_return(0);
                    }
                    Err(e) => sp.set_return(e.errno()),
                }
            } else {
                sp.set_return(-errno::EFAULT);
            }
        }

        Syscall::Fstat => {
            let pstat = sp.parameter(1);
            if mpu.within_for_writing(pstat, core::mem::size_of::<Stat>()) && aligned(pstat) {
                match proc.file_table.lock().fstat(sp.parameter(0) as i32) {
                    Ok(st) => {
                        // SAFETY: write-checked and aligned above
                        unsafe { put_stat(pstat, &st) };
                        sp.set_return(0);
                    }
                    Err(e) => sp.set_return(e.errno()),
                }
            } else {
                sp.set_return(-errno::EFAULT);
            }
        }

        Syscall::Fcntl => {
            use ferrox_abi::{F_DUPFD, F_SETFD, F_SETFL};
            let fd = sp.parameter(0) as i32;
            let cmd = sp.parameter(1) as u32;
            // Some fcntl commands take an optional third argument that
            // may be an int or a pointer. None of the pointer-argument
            // commands are supported, so pass the int through for the
            // known int commands and zero otherwise.
            let arg = match cmd {
                F_DUPFD | F_SETFD | F_SETFL => sp.parameter(2) as u32,
                _ => 0,
            };
            let res = proc.file_table.lock().fcntl(fd, cmd, arg);
            sp.set_return(res.unwrap_or_else(|e| e.errno()));
        }

        Syscall::Ioctl => {
            // No way to validate the argument, which may be a pointer of
            // driver-defined size; reject until per-ioctl validation
            // exists. Moving checks into filesystem code doesn't work:
            // that code is also reachable from kernel threads.
            sp.set_return(-errno::EFAULT);
        }

        Syscall::Isatty => {
            let res = proc.file_table.lock().isatty(sp.parameter(0) as i32);
            sp.set_return(res.map(|b| b as i32).unwrap_or_else(|e| e.errno()));
        }

        Syscall::Getcwd => {
            let ptr = sp.parameter(0);
            let size = sp.parameter(1);
            if mpu.within_for_writing(ptr, size) {
                // SAFETY: write-checked above
                let buf = unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, size) };
                let res = proc.file_table.lock().getcwd(buf);
                // Slot 0 keeps the buffer pointer; the result goes to 1
                sp.set_parameter(
                    1,
                    res.map(|n| n as i32).unwrap_or_else(|e| e.errno()) as isize as usize,
                );
            } else {
                sp.set_parameter(1, (-errno::EFAULT) as isize as usize);
            }
        }

        Syscall::Chdir => {
            match unsafe { user_path(&mpu, sp.parameter(0)) } {
                Some(path) => {
                    let res = proc.file_table.lock().chdir(path);
                    sp.set_return(res.map(|_| 0).unwrap_or_else(|e| e.errno()));
                }
                None => sp.set_return(-errno::EFAULT),
            }
        }

        Syscall::Getdents => {
            let fd = sp.parameter(0) as i32;
            let ptr = sp.parameter(1);
            let size = sp.parameter(2);
            if mpu.within_for_writing(ptr, size) {
                // SAFETY: write-checked above
                let buf = unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, size) };
                let res = proc.file_table.lock().getdents(fd, buf);
                sp.set_return(res.map(|n| n as i32).unwrap_or_else(|e| e.errno()));
            } else {
                sp.set_return(-errno::EFAULT);
            }
        }

        Syscall::Mkdir => {
            match unsafe { user_path(&mpu, sp.parameter(0)) } {
                Some(path) => {
                    let res = with_vfs_path(proc, path, |vfs, abs| {
                        vfs.mkdir(abs, sp.parameter(1) as u32).map(|_| 0)
                    });
                    sp.set_return(res);
                }
                None => sp.set_return(-errno::EFAULT),
            }
        }

        Syscall::Rmdir => {
            match unsafe { user_path(&mpu, sp.parameter(0)) } {
                Some(path) => {
                    let res = with_vfs_path(proc, path, |vfs, abs| vfs.rmdir(abs).map(|_| 0));
                    sp.set_return(res);
                }
                None => sp.set_return(-errno::EFAULT),
            }
        }

        Syscall::Link => {
            // No mounted filesystem supports hard links
            sp.set_return(-errno::EMLINK);
        }

        Syscall::Unlink => {
            match unsafe { user_path(&mpu, sp.parameter(0)) } {
                Some(path) => {
                    let res = with_vfs_path(proc, path, |vfs, abs| vfs.unlink(abs).map(|_| 0));
                    sp.set_return(res);
                }
                None => sp.set_return(-errno::EFAULT),
            }
        }

        Syscall::Symlink => {
            // No writable filesystem supports symlinks
            sp.set_return(-errno::ENOENT);
        }

        Syscall::Readlink => {
            let path = unsafe { user_path(&mpu, sp.parameter(0)) };
            let ptr = sp.parameter(1);
            let size = sp.parameter(2);
            if let Some(path) = path {
                if mpu.within_for_writing(ptr, size) {
                    // SAFETY: write-checked above
                    let buf =
                        unsafe { core::slice::from_raw_parts_mut(ptr as *mut u8, size) };
                    let res =
                        with_vfs_path(proc, path, |vfs, abs| {
                            vfs.readlink(abs, buf).map(|n| n as i32)
                        });
                    sp.set_return(res);
                } else {
                    sp.set_return(-errno::EFAULT);
                }
            } else {
                sp.set_return(-errno::EFAULT);
            }
        }

        Syscall::Truncate => {
            let size = sp.parameter64(1, 2);
            match unsafe { user_path(&mpu, sp.parameter(0)) } {
                Some(path) => {
                    let res = with_vfs_path(proc, path, |vfs, abs| {
                        vfs.truncate(abs, size).map(|_| 0)
                    });
                    sp.set_return(res);
                }
                None => sp.set_return(-errno::EFAULT),
            }
        }

        Syscall::Ftruncate => {
            let size = sp.parameter64(1, 2);
            let res = proc.file_table.lock().ftruncate(sp.parameter(0) as i32, size);
            sp.set_return(res.map(|_| 0).unwrap_or_else(|e| e.errno()));
        }

        Syscall::Rename => {
            let old = unsafe { user_path(&mpu, sp.parameter(0)) };
            let new = unsafe { user_path(&mpu, sp.parameter(1)) };
            match (old, new) {
                (Some(old), Some(new)) => {
                    let res = with_vfs_path(proc, old, |vfs, old_abs| {
                        let ft = proc.file_table.lock();
                        let new_abs = ft.absolute_path(new)?;
                        vfs.rename(old_abs, &new_abs).map(|_| 0)
                    });
                    sp.set_return(res);
                }
                _ => sp.set_return(-errno::EFAULT),
            }
        }

        // TODO: permission bits are not stored by any mounted filesystem
        Syscall::Chmod
        | Syscall::Fchmod
        | Syscall::Chown
        | Syscall::Fchown
        | Syscall::Lchown => {
            sp.set_return(-errno::EFAULT);
        }

        Syscall::Dup => {
            let res = proc.file_table.lock().dup(sp.parameter(0) as i32);
            sp.set_return(res.unwrap_or_else(|e| e.errno()));
        }

        Syscall::Dup2 => {
            let res = proc
                .file_table
                .lock()
                .dup2(sp.parameter(0) as i32, sp.parameter(1) as i32);
            sp.set_return(res.unwrap_or_else(|e| e.errno()));
        }

        Syscall::Pipe => {
            // Slot 0 is preserved on purpose; the result goes to slot 1
            // and the two descriptors to slots 2 and 3
            match proc.file_table.lock().pipe() {
                Ok((read_fd, write_fd)) => {
                    sp.set_parameter(1, 0);
                    sp.set_parameter(2, read_fd as usize);
                    sp.set_parameter(3, write_fd as usize);
                }
                Err(e) => sp.set_parameter(1, e.errno() as isize as usize),
            }
        }

        Syscall::Access => {
            sp.set_return(-errno::EFAULT); // TODO: stub
        }

        Syscall::Gettime => {
            let t = scheduler().monotonic_ns();
            sp.set_return64(t);
        }

        Syscall::Settime => {
            // NOTE: positive error code, matching the userspace wrapper
            sp.set_return(errno::EFAULT);
        }

        Syscall::Nanosleep => {
            let mut t = sp.parameter64(1, 0);
            let clockid_and_flags = sp.parameter(3);
            // Bit 8 distinguishes absolute from relative sleeps
            if clockid_and_flags & (1 << 8) == 0 {
                t += scheduler().monotonic_ns();
            }
            scheduler().sleep_until_ns(t);
            sp.set_return(0);
        }

        Syscall::Getres => {
            // Resolutions of one second or more are not representable:
            // only the nanosecond part is returned, in slot 2
            sp.set_return(0);
            sp.set_parameter(2, scheduler().clock_resolution_ns() as usize);
        }

        Syscall::Adjtime => {
            sp.set_return(-errno::EFAULT); // TODO: stub
        }

        Syscall::Exit => {
            proc.set_exit_code(wait::exit_status(sp.parameter(0) as i32));
            return SvcResult::Exit;
        }

        Syscall::Execve => {
            let path_ptr = sp.parameter(0);
            let argv = validate_string_array(&mpu, sp.parameter(1));
            let envp = validate_string_array(&mpu, sp.parameter(2));
            let path = unsafe { user_path(&mpu, path_ptr) };
            match (path, argv, envp) {
                (Some(path), Some(argv), Some(envp)) => {
                    match crate::process::ArgsBlock::new(&argv, &envp) {
                        Ok(args) => {
                            let loaded = proc
                                .file_table
                                .lock()
                                .absolute_path(path)
                                .map_err(|e| e.errno())
                                .and_then(|abs| {
                                    crate::process::ElfProgram::from_path(&abs)
                                        .map_err(|e| e.errno())
                                });
                            match loaded {
                                Ok(program) => {
                                    // TODO: once threads within processes
                                    // exist, kill all other threads here
                                    match proc.reload(program, args) {
                                        Ok(()) => return SvcResult::Execve,
                                        // The old image is already gone;
                                        // there is no process to return
                                        // an error to
                                        Err(_) => return SvcResult::Segfault,
                                    }
                                }
                                Err(code) => sp.set_return(code),
                            }
                        }
                        Err(_) => sp.set_return(-errno::E2BIG),
                    }
                }
                _ => sp.set_return(-errno::EFAULT),
            }
        }

        Syscall::Spawn => {
            let pidp = sp.parameter(0);
            let path = unsafe { user_path(&mpu, sp.parameter(1)) };
            let argv = validate_string_array(&mpu, sp.parameter(2));
            let envp = validate_string_array(&mpu, sp.parameter(3));
            let pidp_ok = pidp == 0
                || (mpu.within_for_writing(pidp, core::mem::size_of::<ferrox_abi::Pid>())
                    && aligned(pidp));
            match (pidp_ok, path, argv, envp) {
                (true, Some(path), Some(argv), Some(envp)) => {
                    match PROCESS_TABLE.spawn(path, &argv, &envp) {
                        Ok(pid) => {
                            if pidp != 0 {
                                // SAFETY: write-checked and aligned above
                                unsafe {
                                    core::ptr::write(pidp as *mut ferrox_abi::Pid, pid)
                                };
                            }
                            sp.set_return(0);
                        }
                        // NOTE: positive error codes, matching the
                        // userspace wrapper
                        Err(e) => sp.set_return(-e.errno()),
                    }
                }
                _ => sp.set_return(errno::EFAULT),
            }
        }

        Syscall::Kill => {
            sp.set_return(-errno::EFAULT); // TODO: stub
        }

        Syscall::Waitpid => {
            let pid = sp.parameter(0) as i32;
            let wstatus = sp.parameter(1);
            let options = WaitFlags::from_bits_truncate(sp.parameter(2) as u32);
            if mpu.within_for_writing(wstatus, core::mem::size_of::<i32>())
                && aligned(wstatus)
            {
                let result = match PROCESS_TABLE.waitpid(pid, options) {
                    Ok(WaitOutcome::Reaped { pid, status }) => {
                        // SAFETY: write-checked and aligned above
                        unsafe { core::ptr::write(wstatus as *mut i32, status) };
                        pid
                    }
                    Ok(WaitOutcome::NothingYet) => 0,
                    Ok(WaitOutcome::Deferred) => -1,
                    Err(WaitError::NoChildren) => -errno::ECHILD,
                };
                sp.set_return(result);
            } else {
                sp.set_return(-errno::EFAULT);
            }
        }

        Syscall::Getpid => {
            sp.set_return(proc.pid());
        }

        Syscall::Getppid => {
            sp.set_return(PROCESS_TABLE.getppid(proc.pid()).unwrap_or(0));
        }

        // TODO: no user and group model yet
        Syscall::Getuid
        | Syscall::Getgid
        | Syscall::Geteuid
        | Syscall::Getegid
        | Syscall::Setuid
        | Syscall::Setgid => {
            sp.set_return(-errno::EFAULT);
        }

        // TODO: mount table manipulation from userspace
        Syscall::Mount | Syscall::Umount | Syscall::Mkfs => {
            sp.set_return(-errno::EFAULT);
        }
    }
    SvcResult::Resume
}

/// Resolves `path` through the caller's working directory and runs `op`
/// against the root filesystem, flattening errors to an errno return.
fn with_vfs_path<F>(proc: &Arc<Process>, path: &str, op: F) -> i32
where
    F: FnOnce(&Arc<dyn crate::fs::Vfs>, &str) -> Result<i32, crate::fs::FsError>,
{
    let abs = match proc.file_table.lock().absolute_path(path) {
        Ok(abs) => abs,
        Err(e) => return e.errno(),
    };
    let Some(vfs) = crate::fs::root() else {
        return -errno::ENOENT;
    };
    op(&vfs, &abs).unwrap_or_else(|e| e.errno())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{self, install_test_root, loaded_process, ElfBuilder};
    use ferrox_abi::{O_RDONLY, SEEK_END};

    fn call(proc: &Arc<Process>, id: u32, params: [usize; 4]) -> (SvcResult, [usize; 4]) {
        let mut regs = params;
        let result = {
            let mut sp = SyscallParameters::new(id, &mut regs);
            handle_svc(proc, &mut sp)
        };
        (result, regs)
    }

    /// Address of a scratch offset inside the process image's heap area.
    fn image_addr(proc: &Arc<Process>, off: usize) -> usize {
        proc.loaded.read().image.base() + off
    }

    /// Plants bytes into the process image, as if userspace wrote them.
    fn poke(proc: &Arc<Process>, off: usize, bytes: &[u8]) -> usize {
        let at = image_addr(proc, off);
        // SAFETY: the image block is live and off stays in the heap area
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), at as *mut u8, bytes.len());
        }
        at
    }

    fn poke_usize(proc: &Arc<Process>, off: usize, v: usize) -> usize {
        poke(proc, off, &v.to_ne_bytes())
    }

    #[test]
    fn unknown_syscall_kills_with_sigsys() {
        let proc = loaded_process();
        let (result, _) = call(&proc, 99, [0; 4]);
        assert_eq!(result, SvcResult::Segfault);
        assert!(wait::wifsignaled(proc.exit_code()));
        assert_eq!(wait::wtermsig(proc.exit_code()), signal::SIGSYS);
    }

    #[test]
    fn exit_encodes_wait_status() {
        let proc = loaded_process();
        let (result, _) = call(&proc, Syscall::Exit as u32, [42, 0, 0, 0]);
        assert_eq!(result, SvcResult::Exit);
        assert!(wait::wifexited(proc.exit_code()));
        assert_eq!(wait::wexitstatus(proc.exit_code()), 42);
    }

    #[test]
    fn open_validates_the_name_pointer() {
        let proc = loaded_process();
        install_test_root(&[("/etc/disp", b"dispatcher test file")]);

        // A pointer far outside both regions
        let (result, regs) = call(&proc, Syscall::Open as u32, [0x10, 0, 0, 0]);
        assert_eq!(result, SvcResult::Resume);
        assert_eq!(regs[0] as i32, -errno::EFAULT);

        // The same call with the path inside the image succeeds
        let name = poke(&proc, 256, b"/etc/disp\0");
        let (_, regs) = call(&proc, Syscall::Open as u32, [name, O_RDONLY as usize, 0, 0]);
        let fd = regs[0] as i32;
        assert!(fd >= 0, "open failed: {}", fd);

        // Read into a buffer inside the image
        let buf = image_addr(&proc, 512);
        let (_, regs) = call(&proc, Syscall::Read as u32, [fd as usize, buf, 10, 0]);
        assert_eq!(regs[0] as i32, 10);
        // SAFETY: buf points into the live image
        let got = unsafe { core::slice::from_raw_parts(buf as *const u8, 10) };
        assert_eq!(got, b"dispatcher");
    }

    #[test]
    fn read_rejects_buffers_the_caller_cannot_write() {
        let proc = loaded_process();
        install_test_root(&[("/etc/disp2", b"contents")]);
        let name = poke(&proc, 256, b"/etc/disp2\0");
        let (_, regs) = call(&proc, Syscall::Open as u32, [name, 0, 0, 0]);
        let fd = regs[0] as usize;

        // Buffer entirely outside the process
        let (_, regs) = call(&proc, Syscall::Read as u32, [fd, 0x2000, 8, 0]);
        assert_eq!(regs[0] as i32, -errno::EFAULT);

        // Buffer inside the read-only code region: readable, not writable
        let code = proc.loaded.read().program.elf_base();
        let (_, regs) = call(&proc, Syscall::Read as u32, [fd, code, 8, 0]);
        assert_eq!(regs[0] as i32, -errno::EFAULT);
    }

    #[test]
    fn write_checks_come_before_the_filesystem() {
        let proc = loaded_process();
        install_test_root(&[("/etc/ro", b"read only")]);
        let name = poke(&proc, 256, b"/etc/ro\0");
        let (_, regs) = call(&proc, Syscall::Open as u32, [name, 0, 0, 0]);
        let fd = regs[0] as usize;

        // Invalid buffer loses to -EFAULT before the filesystem runs
        let (_, regs) = call(&proc, Syscall::Write as u32, [fd, 0x2000, 4, 0]);
        assert_eq!(regs[0] as i32, -errno::EFAULT);

        // Valid buffer reaches the filesystem, which refuses politely
        let buf = poke(&proc, 512, b"data");
        let (_, regs) = call(&proc, Syscall::Write as u32, [fd, buf, 4, 0]);
        assert_eq!(regs[0] as i32, -errno::EROFS);
    }

    #[test]
    fn lseek_returns_64_bits_across_two_slots() {
        let proc = loaded_process();
        install_test_root(&[("/etc/ten", b"0123456789")]);
        let name = poke(&proc, 256, b"/etc/ten\0");
        let (_, regs) = call(&proc, Syscall::Open as u32, [name, 0, 0, 0]);
        let fd = regs[0] as usize;

        let (_, regs) = call(&proc, Syscall::Lseek as u32, [fd, 0, 0, SEEK_END as usize]);
        assert_eq!(regs[0], 10);
        assert_eq!(regs[1], 0);
    }

    #[test]
    fn stat_requires_an_aligned_out_pointer() {
        let proc = loaded_process();
        install_test_root(&[("/etc/st", b"stat me")]);
        let name = poke(&proc, 256, b"/etc/st\0");

        let misaligned = image_addr(&proc, 513);
        let (_, regs) = call(&proc, Syscall::Stat as u32, [name, misaligned, 0, 0]);
        assert_eq!(regs[0] as i32, -errno::EFAULT);

        let aligned_out = image_addr(&proc, 512);
        let (_, regs) = call(&proc, Syscall::Stat as u32, [name, aligned_out, 0, 0]);
        assert_eq!(regs[0] as i32, 0);
        // SAFETY: out pointer is inside the live image
        let st = unsafe { core::ptr::read_unaligned(aligned_out as *const Stat) };
        assert_eq!(st.st_size, 7);
        assert!(st.st_mode & crate::fs::S_IFREG != 0);
    }

    #[test]
    fn getcwd_preserves_the_buffer_pointer_slot() {
        let proc = loaded_process();
        let buf = image_addr(&proc, 640);
        let (_, regs) = call(&proc, Syscall::Getcwd as u32, [buf, 64, 0, 0]);
        // Slot 0 still carries the pointer; slot 1 carries the result
        assert_eq!(regs[0], buf);
        assert_eq!(regs[1] as i32, 1);
        // SAFETY: buf is inside the live image
        let got = unsafe { core::slice::from_raw_parts(buf as *const u8, 2) };
        assert_eq!(got, b"/\0");
    }

    #[test]
    fn pipe_returns_descriptors_in_slots_two_and_three() {
        let proc = loaded_process();
        let (result, regs) = call(&proc, Syscall::Pipe as u32, [0x1234, 0, 0, 0]);
        assert_eq!(result, SvcResult::Resume);
        // Slot 0 untouched, result in slot 1, the two ends in 2 and 3
        assert_eq!(regs[0], 0x1234);
        assert_eq!(regs[1] as i32, 0);
        let (read_fd, write_fd) = (regs[2], regs[3]);
        assert_ne!(read_fd, write_fd);

        // The descriptors work through the ordinary read/write syscalls
        let buf = poke(&proc, 768, b"through the pipe");
        let (_, regs) = call(&proc, Syscall::Write as u32, [write_fd, buf, 16, 0]);
        assert_eq!(regs[0] as i32, 16);
        let out = image_addr(&proc, 896);
        let (_, regs) = call(&proc, Syscall::Read as u32, [read_fd, out, 16, 0]);
        assert_eq!(regs[0] as i32, 16);
        // SAFETY: out points into the live image
        let got = unsafe { core::slice::from_raw_parts(out as *const u8, 16) };
        assert_eq!(got, b"through the pipe");
    }

    #[test]
    fn getpid_and_getppid() {
        let proc = loaded_process();
        let (_, regs) = call(&proc, Syscall::Getpid as u32, [0; 4]);
        assert_eq!(regs[0] as i32, proc.pid());
        let (_, regs) = call(&proc, Syscall::Getppid as u32, [0; 4]);
        assert_eq!(regs[0] as i32, 0);
    }

    #[test]
    fn waitpid_demands_a_writable_status_pointer() {
        let proc = loaded_process();
        let (_, regs) = call(&proc, Syscall::Waitpid as u32, [1, 0, 0, 0]);
        assert_eq!(regs[0] as i32, -errno::EFAULT);
    }

    #[test]
    fn spawn_with_user_arrays() {
        let proc = loaded_process();
        let elf = ElfBuilder::new().build();
        install_test_root(&[("/bin/spawnee", elf.as_bytes())]);
        testutil::set_current_pid(proc.pid());

        // Lay out userspace memory: strings, then the pointer arrays
        let path = poke(&proc, 1024, b"/bin/spawnee\0");
        let a0 = poke(&proc, 1100, b"echo\0");
        let a1 = poke(&proc, 1110, b"hello\0");
        let a2 = poke(&proc, 1120, b"world\0");
        let e0 = poke(&proc, 1130, b"K=V\0");
        let argv = image_addr(&proc, 1160);
        for (i, p) in [a0, a1, a2, 0usize].iter().enumerate() {
            poke_usize(&proc, 1160 + i * core::mem::size_of::<usize>(), *p);
        }
        let envp = image_addr(&proc, 1200);
        for (i, p) in [e0, 0usize].iter().enumerate() {
            poke_usize(&proc, 1200 + i * core::mem::size_of::<usize>(), *p);
        }
        let pidp = image_addr(&proc, 1240);

        let (result, regs) = call(&proc, Syscall::Spawn as u32, [pidp, path, argv, envp]);
        assert_eq!(result, SvcResult::Resume);
        assert_eq!(regs[0], 0, "spawn failed: {}", regs[0] as i32);

        // SAFETY: pidp is inside the live image
        let child = unsafe { core::ptr::read(pidp as *const ferrox_abi::Pid) };
        assert!(child > 0);
        assert_eq!(PROCESS_TABLE.getppid(child), Some(proc.pid()));

        // The child's argv/envp were packed and relocated into its image:
        // every pointer must land inside the child's own block and
        // dereference to the original strings
        let cproc = PROCESS_TABLE.get(child).unwrap();
        let loaded = cproc.loaded.read();
        assert_eq!(loaded.argc, 3);
        let dst_addr = loaded.argv as u32;
        let expect: [&[u8]; 4] = [b"echo", b"hello", b"world", b"K=V"];
        let mut found = alloc::vec::Vec::new();
        for (array, count) in [(loaded.argv, 3), (loaded.envp, 1)] {
            for i in 0..count + 1 {
                // SAFETY: the slots are inside the child's live image
                let slot =
                    unsafe { core::ptr::read_unaligned((array + i * 4) as *const u32) };
                if i == count {
                    assert_eq!(slot, 0, "array not null terminated");
                } else {
                    let off = slot.wrapping_sub(dst_addr) as usize;
                    assert!(off < loaded.image.size(), "pointer outside image");
                    let s = loaded.argv + off;
                    // SAFETY: inside the child's image
                    let got = unsafe { user_cstr(s) };
                    found.push(got.to_vec());
                }
            }
        }
        for (got, want) in found.iter().zip(expect) {
            assert_eq!(got.as_slice(), want);
        }
    }

    #[test]
    fn spawn_rejects_a_bad_argv_array() {
        let proc = loaded_process();
        testutil::set_current_pid(proc.pid());
        let path = poke(&proc, 1500, b"/bin/spawnee\0");
        let envp = image_addr(&proc, 1540);
        poke_usize(&proc, 1540, 0);

        // argv array pointer outside the process
        let (result, regs) =
            call(&proc, Syscall::Spawn as u32, [0, path, 0x4000, envp]);
        assert_eq!(result, SvcResult::Resume);
        // Positive error code by the spawn wrapper convention
        assert_eq!(regs[0] as i32, errno::EFAULT);
    }

    #[test]
    fn execve_replaces_the_loaded_program() {
        let proc = loaded_process();
        let marker = 0xfeed_faceu32;
        let elf = ElfBuilder::new().data_words(&[marker, 0, 0, 0]).build();
        install_test_root(&[("/bin/execve-target", elf.as_bytes())]);
        testutil::set_current_pid(proc.pid());

        let old_entry = proc.loaded.read().program.entry_point();
        let path = poke(&proc, 1800, b"/bin/execve-target\0");
        let argv = image_addr(&proc, 1840);
        poke_usize(&proc, 1840, 0);
        let envp = image_addr(&proc, 1860);
        poke_usize(&proc, 1860, 0);

        let (result, _) = call(&proc, Syscall::Execve as u32, [path, argv, envp, 0]);
        assert_eq!(result, SvcResult::Execve);

        let loaded = proc.loaded.read();
        // The first data word of the fresh image is the marker
        // SAFETY: reading the live image
        let w = unsafe { core::ptr::read(loaded.image.base() as *const u32) };
        assert_eq!(w, marker);
        assert_eq!(loaded.argc, 0);
        // The entry point belongs to the newly loaded program
        assert_ne!(loaded.program.entry_point(), old_entry);
    }

    #[test]
    fn execve_of_garbage_reports_enoexec() {
        let proc = loaded_process();
        install_test_root(&[("/bin/notelf", b"#!/bin/sh\n")]);
        testutil::set_current_pid(proc.pid());

        let path = poke(&proc, 2048, b"/bin/notelf\0");
        let argv = image_addr(&proc, 2100);
        poke_usize(&proc, 2100, 0);
        let envp = image_addr(&proc, 2120);
        poke_usize(&proc, 2120, 0);

        let old_base = proc.loaded.read().image.base();
        let (result, regs) = call(&proc, Syscall::Execve as u32, [path, argv, envp, 0]);
        assert_eq!(result, SvcResult::Resume);
        assert_eq!(regs[0] as i32, -errno::ENOEXEC);
        // The old program keeps running
        assert_eq!(proc.loaded.read().image.base(), old_base);
    }

    #[test]
    fn stub_syscalls_return_efault() {
        let proc = loaded_process();
        for id in [
            Syscall::Chmod,
            Syscall::Chown,
            Syscall::Access,
            Syscall::Kill,
            Syscall::Getuid,
            Syscall::Setgid,
            Syscall::Mount,
            Syscall::Mkfs,
        ] {
            let (result, regs) = call(&proc, id as u32, [0; 4]);
            assert_eq!(result, SvcResult::Resume);
            assert_eq!(regs[0] as i32, -errno::EFAULT);
        }
        // Hard links and symlinks fail with their own codes
        let (_, regs) = call(&proc, Syscall::Link as u32, [0; 4]);
        assert_eq!(regs[0] as i32, -errno::EMLINK);
        let (_, regs) = call(&proc, Syscall::Symlink as u32, [0; 4]);
        assert_eq!(regs[0] as i32, -errno::ENOENT);
    }
}
