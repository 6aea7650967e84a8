//! # Ferrox ABI
//!
//! Definitions shared between the kernel and userspace applications: the
//! supervisor-call numbering, errno values, signal numbers, the `wait`
//! status word encoding and the flag words that cross the kernel boundary.
//!
//! Everything in this crate is part of the binary contract with compiled
//! programs. Changing a value here breaks every executable built against
//! the previous one.

#![no_std]

use bitflags::bitflags;

/// Process identifier. Zero is the kernel itself and is never a process.
pub type Pid = i32;

/// Maximum accepted path length, terminator included.
pub const PATH_MAX: usize = 512;

/// List of Ferrox supervisor calls.
///
/// `Yield` and `Userspace` are available to kernel threads as well; all the
/// others are reserved to process threads running in userspace mode. The
/// SVC frame exposes four word-sized parameter slots that double as return
/// value slots; a 64 bit return value occupies slots 0 and 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum Syscall {
    /// Ask the scheduler to switch to another thread. No parameters.
    Yield = 0,
    /// Return from kernelspace mode to userspace mode after an SVC.
    Userspace = 1,

    // File and directory syscalls
    Open = 2,
    Close = 3,
    Read = 4,
    Write = 5,
    Lseek = 6,
    Stat = 7,
    Lstat = 8,
    Fstat = 9,
    Fcntl = 10,
    Ioctl = 11,
    Isatty = 12,
    Getcwd = 13,
    Chdir = 14,
    Getdents = 15,
    Mkdir = 16,
    Rmdir = 17,
    Link = 18,
    Unlink = 19,
    Symlink = 20,
    Readlink = 21,
    Truncate = 22,
    Ftruncate = 23,
    Rename = 24,
    Chmod = 25,
    Fchmod = 26,
    Chown = 27,
    Fchown = 28,
    Lchown = 29,
    Dup = 30,
    Dup2 = 31,
    Pipe = 32,
    Access = 33,
    // 34..=37 reserved for future use

    // Time syscalls
    Gettime = 38,
    Settime = 39,
    Nanosleep = 40,
    Getres = 41,
    Adjtime = 42,

    // Process syscalls
    Exit = 43,
    Execve = 44,
    Spawn = 45,
    Kill = 46,
    Waitpid = 47,
    Getpid = 48,
    Getppid = 49,
    Getuid = 50,
    Getgid = 51,
    Geteuid = 52,
    Getegid = 53,
    Setuid = 54,
    Setgid = 55,

    // Filesystem syscalls
    Mount = 56,
    Umount = 57,
    Mkfs = 58,
}

impl Syscall {
    /// Decodes a raw SVC id. Returns `None` for ids outside the table,
    /// including the reserved 34..=37 range.
    pub fn from_id(id: u32) -> Option<Self> {
        Some(match id {
            0 => Self::Yield,
            1 => Self::Userspace,
            2 => Self::Open,
            3 => Self::Close,
            4 => Self::Read,
            5 => Self::Write,
            6 => Self::Lseek,
            7 => Self::Stat,
            8 => Self::Lstat,
            9 => Self::Fstat,
            10 => Self::Fcntl,
            11 => Self::Ioctl,
            12 => Self::Isatty,
            13 => Self::Getcwd,
            14 => Self::Chdir,
            15 => Self::Getdents,
            16 => Self::Mkdir,
            17 => Self::Rmdir,
            18 => Self::Link,
            19 => Self::Unlink,
            20 => Self::Symlink,
            21 => Self::Readlink,
            22 => Self::Truncate,
            23 => Self::Ftruncate,
            24 => Self::Rename,
            25 => Self::Chmod,
            26 => Self::Fchmod,
            27 => Self::Chown,
            28 => Self::Fchown,
            29 => Self::Lchown,
            30 => Self::Dup,
            31 => Self::Dup2,
            32 => Self::Pipe,
            33 => Self::Access,
            38 => Self::Gettime,
            39 => Self::Settime,
            40 => Self::Nanosleep,
            41 => Self::Getres,
            42 => Self::Adjtime,
            43 => Self::Exit,
            44 => Self::Execve,
            45 => Self::Spawn,
            46 => Self::Kill,
            47 => Self::Waitpid,
            48 => Self::Getpid,
            49 => Self::Getppid,
            50 => Self::Getuid,
            51 => Self::Getgid,
            52 => Self::Geteuid,
            53 => Self::Getegid,
            54 => Self::Setuid,
            55 => Self::Setgid,
            56 => Self::Mount,
            57 => Self::Umount,
            58 => Self::Mkfs,
            _ => return None,
        })
    }
}

/// Errno values, newlib numbering (the libc the ARM embedded toolchain
/// links against). Syscalls return these negated in parameter slot 0,
/// except where a specific slot convention is documented.
pub mod errno {
    pub const EPERM: i32 = 1;
    pub const ENOENT: i32 = 2;
    pub const EINTR: i32 = 4;
    pub const EIO: i32 = 5;
    pub const E2BIG: i32 = 7;
    pub const ENOEXEC: i32 = 8;
    pub const EBADF: i32 = 9;
    pub const ECHILD: i32 = 10;
    pub const ENOMEM: i32 = 12;
    pub const EACCES: i32 = 13;
    pub const EFAULT: i32 = 14;
    pub const EBUSY: i32 = 16;
    pub const EEXIST: i32 = 17;
    pub const ENOTDIR: i32 = 20;
    pub const EISDIR: i32 = 21;
    pub const EINVAL: i32 = 22;
    pub const ENFILE: i32 = 23;
    pub const EMFILE: i32 = 24;
    pub const ENOTTY: i32 = 25;
    pub const ENOSPC: i32 = 28;
    pub const ESPIPE: i32 = 29;
    pub const EROFS: i32 = 30;
    pub const EMLINK: i32 = 31;
    pub const EPIPE: i32 = 32;
    pub const ERANGE: i32 = 34;
    pub const ENOSYS: i32 = 88;
    pub const ENOTEMPTY: i32 = 90;
    pub const ENAMETOOLONG: i32 = 91;
}

/// Signal numbers, newlib numbering. Only the ones the kernel itself
/// raises are listed; there is no userspace signal delivery.
pub mod signal {
    /// Process killed after touching memory outside its MPU regions.
    pub const SIGSEGV: i32 = 11;
    /// Process killed after issuing an unknown syscall id.
    pub const SIGSYS: i32 = 12;
    /// Process killed by another process.
    pub const SIGKILL: i32 = 9;
}

bitflags! {
    /// Options accepted by `waitpid`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct WaitFlags: u32 {
        /// Do not block if no child has terminated yet.
        const WNOHANG = 1;
    }
}

/// POSIX `wait` status word encoding.
///
/// A normal exit stores `(code & 0xff) << 8`; a termination by signal
/// stores the signal number in the low seven bits.
pub mod wait {
    /// Builds the status word for a normal exit.
    pub const fn exit_status(code: i32) -> i32 {
        (code & 0xff) << 8
    }

    /// Builds the status word for a termination by signal.
    pub const fn signal_status(sig: i32) -> i32 {
        sig & 0x7f
    }

    pub const fn wifexited(status: i32) -> bool {
        status & 0x7f == 0
    }

    pub const fn wexitstatus(status: i32) -> i32 {
        (status >> 8) & 0xff
    }

    pub const fn wifsignaled(status: i32) -> bool {
        status & 0x7f != 0
    }

    pub const fn wtermsig(status: i32) -> i32 {
        status & 0x7f
    }
}

/// Open flags, newlib numbering. The access mode is a two-bit field, not
/// a flag, so it is kept outside the `bitflags` word.
pub const O_RDONLY: u32 = 0;
pub const O_WRONLY: u32 = 1;
pub const O_RDWR: u32 = 2;
pub const O_ACCMODE: u32 = 3;

bitflags! {
    /// Modifier bits of the `open` flags word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: u32 {
        const APPEND = 0x0008;
        const CREAT = 0x0200;
        const TRUNC = 0x0400;
        const EXCL = 0x0800;
    }
}

/// `lseek` whence values.
pub const SEEK_SET: u32 = 0;
pub const SEEK_CUR: u32 = 1;
pub const SEEK_END: u32 = 2;

/// `fcntl` commands understood by the kernel.
pub const F_DUPFD: u32 = 0;
pub const F_GETFD: u32 = 1;
pub const F_SETFD: u32 = 2;
pub const F_GETFL: u32 = 3;
pub const F_SETFL: u32 = 4;

/// File descriptor flag set by `F_SETFD`: close the descriptor on execve.
pub const FD_CLOEXEC: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn syscall_ids_round_trip() {
        assert_eq!(Syscall::from_id(0), Some(Syscall::Yield));
        assert_eq!(Syscall::from_id(2), Some(Syscall::Open));
        assert_eq!(Syscall::from_id(45), Some(Syscall::Spawn));
        assert_eq!(Syscall::from_id(58), Some(Syscall::Mkfs));
        assert_eq!(Syscall::from_id(59), None);
        // Reserved gap between file and time syscalls
        for id in 34..=37 {
            assert_eq!(Syscall::from_id(id), None);
        }
    }

    #[test]
    fn wait_status_encoding() {
        let st = wait::exit_status(42);
        assert!(wait::wifexited(st));
        assert!(!wait::wifsignaled(st));
        assert_eq!(wait::wexitstatus(st), 42);

        let st = wait::signal_status(signal::SIGSEGV);
        assert!(wait::wifsignaled(st));
        assert!(!wait::wifexited(st));
        assert_eq!(wait::wtermsig(st), signal::SIGSEGV);
    }
}
