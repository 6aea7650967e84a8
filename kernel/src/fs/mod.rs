//! # Filesystem Interface
//!
//! The process subsystem's view of the filesystem stack: the `File` and
//! `Vfs` traits the syscall dispatcher calls through, and the per-process
//! file descriptor table.
//!
//! The filesystem implementations themselves live behind the `Vfs` trait;
//! the kernel ships `ramfs` for early boot and everything else is a board
//! support concern.
//!
//! ## File descriptor tables
//!
//! Each process owns a fixed-capacity table of `MAX_OPEN_FILES` slots.
//! A slot holds a shared handle to an open file plus a close-on-exec bit.
//! `spawn` clones the parent's table slot by slot (the handles are shared,
//! so parent and child see the same file offsets, as POSIX wants);
//! `execve` closes the slots marked close-on-exec; process exit closes
//! everything.

pub mod pipe;
pub mod ramfs;

use alloc::string::String;
use alloc::sync::Arc;

use spin::RwLock;

use ferrox_abi::{errno, OpenFlags, O_ACCMODE, O_RDONLY, O_WRONLY, PATH_MAX};

use crate::config::MAX_OPEN_FILES;

/// Filesystem operation errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsError {
    NotFound,
    NameTooLong,
    NotSupported,
    BadDescriptor,
    TooManyOpenFiles,
    NotDirectory,
    IsDirectory,
    InvalidArgument,
    ReadOnly,
    AlreadyExists,
    BrokenPipe,
    IllegalSeek,
    Io,
}

impl FsError {
    /// Negative errno value for the syscall boundary.
    pub fn errno(&self) -> i32 {
        match self {
            FsError::NotFound => -errno::ENOENT,
            FsError::NameTooLong => -errno::ENAMETOOLONG,
            FsError::NotSupported => -errno::ENOSYS,
            FsError::BadDescriptor => -errno::EBADF,
            FsError::TooManyOpenFiles => -errno::EMFILE,
            FsError::NotDirectory => -errno::ENOTDIR,
            FsError::IsDirectory => -errno::EISDIR,
            FsError::InvalidArgument => -errno::EINVAL,
            FsError::ReadOnly => -errno::EROFS,
            FsError::AlreadyExists => -errno::EEXIST,
            FsError::BrokenPipe => -errno::EPIPE,
            FsError::IllegalSeek => -errno::ESPIPE,
            FsError::Io => -errno::EIO,
        }
    }
}

impl core::fmt::Display for FsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            FsError::NotFound => write!(f, "no such file or directory"),
            FsError::NameTooLong => write!(f, "path too long"),
            FsError::NotSupported => write!(f, "operation not supported"),
            FsError::BadDescriptor => write!(f, "bad file descriptor"),
            FsError::TooManyOpenFiles => write!(f, "too many open files"),
            FsError::NotDirectory => write!(f, "not a directory"),
            FsError::IsDirectory => write!(f, "is a directory"),
            FsError::InvalidArgument => write!(f, "invalid argument"),
            FsError::ReadOnly => write!(f, "read-only filesystem"),
            FsError::AlreadyExists => write!(f, "file exists"),
            FsError::BrokenPipe => write!(f, "broken pipe"),
            FsError::IllegalSeek => write!(f, "illegal seek"),
            FsError::Io => write!(f, "I/O error"),
        }
    }
}

/// File mode bits reported in `Stat::st_mode`.
pub const S_IFREG: u32 = 0x8000;
pub const S_IFDIR: u32 = 0x4000;
pub const S_IFCHR: u32 = 0x2000;
pub const S_IFIFO: u32 = 0x1000;

/// File metadata, in the layout userspace receives from `stat`-family
/// syscalls. The dispatcher validates user pointers against
/// `size_of::<Stat>()` and word alignment before writing one of these.
#[derive(Debug, Clone, Copy, Default)]
#[repr(C)]
pub struct Stat {
    pub st_dev: u32,
    pub st_ino: u32,
    pub st_mode: u32,
    pub st_size: i64,
    pub st_blksize: u32,
    pub st_blocks: u32,
}

/// One open file. Handles are shared: `dup` and process spawning clone
/// the `Arc`, so every alias sees the same file offset. Implementations
/// keep their offset behind interior mutability.
pub trait File: Send + Sync {
    fn read(&self, buf: &mut [u8]) -> Result<usize, FsError>;
    fn write(&self, buf: &[u8]) -> Result<usize, FsError>;
    fn lseek(&self, offset: i64, whence: u32) -> Result<i64, FsError>;
    fn fstat(&self) -> Result<Stat, FsError>;

    fn isatty(&self) -> bool {
        false
    }

    /// Reads directory entries; only meaningful for directories.
    fn getdents(&self, _buf: &mut [u8]) -> Result<usize, FsError> {
        Err(FsError::NotSupported)
    }

    fn ftruncate(&self, _len: i64) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }
}

/// Where the program loader finds the bytes of an executable.
pub enum ProgramSource {
    /// Execute-in-place capable filesystem: the file is directly mapped,
    /// no copy needed. The pointer stays valid as long as the filesystem
    /// is mounted.
    Xip { base: usize, size: usize },
    /// The file must be copied to RAM to execute it. `(inode, device)`
    /// identify the file for the program cache.
    Stored {
        file: Arc<dyn File>,
        inode: u32,
        device: u32,
        size: usize,
    },
}

/// The filesystem operations the process subsystem needs. Paths handed to
/// a `Vfs` are already absolute.
pub trait Vfs: Send + Sync {
    fn open(&self, path: &str, flags: u32, mode: u32) -> Result<Arc<dyn File>, FsError>;
    fn stat(&self, path: &str) -> Result<Stat, FsError>;

    fn lstat(&self, path: &str) -> Result<Stat, FsError> {
        self.stat(path)
    }

    /// Resolves `path` for the program loader.
    fn program_source(&self, path: &str) -> Result<ProgramSource, FsError>;

    fn mkdir(&self, _path: &str, _mode: u32) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn rmdir(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn unlink(&self, _path: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn rename(&self, _old: &str, _new: &str) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn truncate(&self, _path: &str, _len: i64) -> Result<(), FsError> {
        Err(FsError::NotSupported)
    }

    fn readlink(&self, _path: &str, _buf: &mut [u8]) -> Result<usize, FsError> {
        Err(FsError::NotSupported)
    }
}

/// The mounted root filesystem, installed by the board support package.
static ROOT: RwLock<Option<Arc<dyn Vfs>>> = RwLock::new(None);

/// Mounts `vfs` as the root filesystem.
pub fn set_root(vfs: Arc<dyn Vfs>) {
    *ROOT.write() = Some(vfs);
}

/// The root filesystem, if one is mounted.
pub fn root() -> Option<Arc<dyn Vfs>> {
    ROOT.read().clone()
}

#[derive(Clone)]
struct FdEntry {
    file: Arc<dyn File>,
    cloexec: bool,
}

/// Per-process file descriptor table.
#[derive(Clone)]
pub struct FileDescriptorTable {
    slots: [Option<FdEntry>; MAX_OPEN_FILES],
    cwd: String,
}

impl Default for FileDescriptorTable {
    fn default() -> Self {
        Self::new()
    }
}

impl FileDescriptorTable {
    pub fn new() -> Self {
        const EMPTY: Option<FdEntry> = None;
        Self {
            slots: [EMPTY; MAX_OPEN_FILES],
            cwd: String::from("/"),
        }
    }

    /// Resolves `path` against the current working directory, bounded by
    /// `PATH_MAX`. No symlink or dot-segment processing: the filesystems
    /// this kernel mounts store plain absolute names.
    pub fn absolute_path(&self, path: &str) -> Result<String, FsError> {
        if path.is_empty() {
            return Err(FsError::NotFound);
        }
        let abs = if path.starts_with('/') {
            String::from(path)
        } else if self.cwd.ends_with('/') {
            let mut s = self.cwd.clone();
            s.push_str(path);
            s
        } else {
            let mut s = self.cwd.clone();
            s.push('/');
            s.push_str(path);
            s
        };
        if abs.len() >= PATH_MAX {
            return Err(FsError::NameTooLong);
        }
        Ok(abs)
    }

    fn free_slot(&self, from: usize) -> Result<usize, FsError> {
        (from..MAX_OPEN_FILES)
            .find(|&i| self.slots[i].is_none())
            .ok_or(FsError::TooManyOpenFiles)
    }

    fn entry(&self, fd: i32) -> Result<&FdEntry, FsError> {
        if fd < 0 || fd as usize >= MAX_OPEN_FILES {
            return Err(FsError::BadDescriptor);
        }
        self.slots[fd as usize].as_ref().ok_or(FsError::BadDescriptor)
    }

    /// The open file behind `fd`.
    pub fn get(&self, fd: i32) -> Result<Arc<dyn File>, FsError> {
        Ok(self.entry(fd)?.file.clone())
    }

    pub fn open(&mut self, path: &str, flags: u32, mode: u32) -> Result<i32, FsError> {
        let abs = self.absolute_path(path)?;
        let vfs = root().ok_or(FsError::NotFound)?;
        let file = vfs.open(&abs, flags, mode)?;
        let slot = self.free_slot(0)?;
        self.slots[slot] = Some(FdEntry {
            file,
            cloexec: false,
        });
        Ok(slot as i32)
    }

    pub fn close(&mut self, fd: i32) -> Result<(), FsError> {
        self.entry(fd)?;
        self.slots[fd as usize] = None;
        Ok(())
    }

    pub fn read(&self, fd: i32, buf: &mut [u8]) -> Result<usize, FsError> {
        self.entry(fd)?.file.read(buf)
    }

    pub fn write(&self, fd: i32, buf: &[u8]) -> Result<usize, FsError> {
        self.entry(fd)?.file.write(buf)
    }

    pub fn lseek(&self, fd: i32, offset: i64, whence: u32) -> Result<i64, FsError> {
        self.entry(fd)?.file.lseek(offset, whence)
    }

    pub fn fstat(&self, fd: i32) -> Result<Stat, FsError> {
        self.entry(fd)?.file.fstat()
    }

    pub fn isatty(&self, fd: i32) -> Result<bool, FsError> {
        Ok(self.entry(fd)?.file.isatty())
    }

    pub fn getdents(&self, fd: i32, buf: &mut [u8]) -> Result<usize, FsError> {
        self.entry(fd)?.file.getdents(buf)
    }

    pub fn ftruncate(&self, fd: i32, len: i64) -> Result<(), FsError> {
        self.entry(fd)?.file.ftruncate(len)
    }

    pub fn stat(&self, path: &str) -> Result<Stat, FsError> {
        let abs = self.absolute_path(path)?;
        root().ok_or(FsError::NotFound)?.stat(&abs)
    }

    pub fn lstat(&self, path: &str) -> Result<Stat, FsError> {
        let abs = self.absolute_path(path)?;
        root().ok_or(FsError::NotFound)?.lstat(&abs)
    }

    pub fn dup(&mut self, fd: i32) -> Result<i32, FsError> {
        let entry = self.entry(fd)?.clone();
        let slot = self.free_slot(0)?;
        // A duplicated descriptor never inherits close-on-exec
        self.slots[slot] = Some(FdEntry {
            cloexec: false,
            ..entry
        });
        Ok(slot as i32)
    }

    /// Creates a pipe and returns `(read_fd, write_fd)`. Either both
    /// descriptors are installed or neither is.
    pub fn pipe(&mut self) -> Result<(i32, i32), FsError> {
        let (read_end, write_end) = pipe::new_pipe();
        let read_fd = self.free_slot(0)?;
        self.slots[read_fd] = Some(FdEntry {
            file: read_end,
            cloexec: false,
        });
        let write_fd = match self.free_slot(0) {
            Ok(slot) => slot,
            Err(e) => {
                self.slots[read_fd] = None;
                return Err(e);
            }
        };
        self.slots[write_fd] = Some(FdEntry {
            file: write_end,
            cloexec: false,
        });
        Ok((read_fd as i32, write_fd as i32))
    }

    pub fn dup2(&mut self, old_fd: i32, new_fd: i32) -> Result<i32, FsError> {
        let entry = self.entry(old_fd)?.clone();
        if new_fd < 0 || new_fd as usize >= MAX_OPEN_FILES {
            return Err(FsError::BadDescriptor);
        }
        if old_fd == new_fd {
            return Ok(new_fd);
        }
        self.slots[new_fd as usize] = Some(FdEntry {
            cloexec: false,
            ..entry
        });
        Ok(new_fd)
    }

    /// `fcntl` commands that only take an integer argument.
    pub fn fcntl(&mut self, fd: i32, cmd: u32, arg: u32) -> Result<i32, FsError> {
        use ferrox_abi::{FD_CLOEXEC, F_DUPFD, F_GETFD, F_GETFL, F_SETFD, F_SETFL};
        self.entry(fd)?;
        match cmd {
            F_DUPFD => {
                let from = arg as usize;
                if from >= MAX_OPEN_FILES {
                    return Err(FsError::InvalidArgument);
                }
                let entry = self.entry(fd)?.clone();
                let slot = self.free_slot(from)?;
                self.slots[slot] = Some(FdEntry {
                    cloexec: false,
                    ..entry
                });
                Ok(slot as i32)
            }
            F_GETFD => {
                let entry = self.entry(fd)?;
                Ok(if entry.cloexec { FD_CLOEXEC as i32 } else { 0 })
            }
            F_SETFD => {
                let cloexec = arg & FD_CLOEXEC != 0;
                if let Some(entry) = self.slots[fd as usize].as_mut() {
                    entry.cloexec = cloexec;
                }
                Ok(0)
            }
            F_GETFL | F_SETFL => {
                // No per-descriptor status flags are tracked yet
                Ok(0)
            }
            _ => Err(FsError::InvalidArgument),
        }
    }

    pub fn getcwd(&self, buf: &mut [u8]) -> Result<usize, FsError> {
        let cwd = self.cwd.as_bytes();
        if buf.len() < cwd.len() + 1 {
            return Err(FsError::InvalidArgument);
        }
        buf[..cwd.len()].copy_from_slice(cwd);
        buf[cwd.len()] = 0;
        Ok(cwd.len())
    }

    pub fn chdir(&mut self, path: &str) -> Result<(), FsError> {
        let abs = self.absolute_path(path)?;
        let vfs = root().ok_or(FsError::NotFound)?;
        let st = vfs.stat(&abs)?;
        if st.st_mode & S_IFDIR == 0 {
            return Err(FsError::NotDirectory);
        }
        self.cwd = abs;
        Ok(())
    }

    /// Closes every descriptor marked close-on-exec. Run on `execve`.
    pub fn cloexec(&mut self) {
        for slot in self.slots.iter_mut() {
            if slot.as_ref().is_some_and(|e| e.cloexec) {
                *slot = None;
            }
        }
    }

    /// Closes everything. Run when the process terminates.
    pub fn close_all(&mut self) {
        for slot in self.slots.iter_mut() {
            *slot = None;
        }
    }

    /// Number of occupied slots.
    pub fn open_count(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

/// True when the access mode of `flags` permits reading.
pub fn readable(flags: u32) -> bool {
    flags & O_ACCMODE != O_WRONLY
}

/// True when the access mode of `flags` permits writing.
pub fn writable(flags: u32) -> bool {
    flags & O_ACCMODE != O_RDONLY
}

/// True when `flags` asks for file creation.
pub fn wants_create(flags: u32) -> bool {
    OpenFlags::from_bits_truncate(flags).contains(OpenFlags::CREAT)
}
