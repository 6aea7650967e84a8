//! # RAM Filesystem
//!
//! A flat, read-only, in-memory filesystem holding the programs and data
//! the board needs before (or instead of) real storage is mounted. File
//! content is stored 8-byte aligned so that a filesystem flagged as XIP
//! can hand the program loader a directly executable pointer.
//!
//! Directories are implicit: `/bin/init` creates `/bin` as far as `stat`
//! is concerned. There is no write support; read-write storage comes from
//! the board support package's real filesystem drivers.

use alloc::borrow::ToOwned;
use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, RwLock};

use super::{File, FsError, ProgramSource, Stat, Vfs, S_IFDIR, S_IFREG};

/// One stored file. Content lives in a `u64` buffer so its address is
/// 8-byte aligned, which the ELF loader requires of XIP programs.
struct Node {
    ino: u32,
    words: Vec<u64>,
    len: usize,
}

impl Node {
    fn bytes(&self) -> &[u8] {
        // SAFETY: words holds at least len bytes, and u8 has no alignment
        // requirement
        unsafe { core::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }
}

/// In-RAM filesystem.
pub struct RamFs {
    device: u32,
    xip: bool,
    inner: RwLock<Inner>,
}

struct Inner {
    files: Vec<(String, Arc<Node>)>,
    next_ino: u32,
}

impl RamFs {
    /// Creates an empty filesystem. `device` distinguishes this instance
    /// in `(inode, device)` keys; `xip` marks the content as executable in
    /// place.
    pub fn new(device: u32, xip: bool) -> Self {
        Self {
            device,
            xip,
            inner: RwLock::new(Inner {
                files: Vec::new(),
                next_ino: 1,
            }),
        }
    }

    /// Adds (or replaces) a file.
    pub fn add_file(&self, path: &str, content: &[u8]) {
        let mut words = alloc::vec![0u64; content.len().div_ceil(8)];
        // SAFETY: the buffer holds at least content.len() bytes
        unsafe {
            core::ptr::copy_nonoverlapping(
                content.as_ptr(),
                words.as_mut_ptr() as *mut u8,
                content.len(),
            );
        }
        let mut inner = self.inner.write();
        let ino = inner.next_ino;
        inner.next_ino += 1;
        let node = Arc::new(Node {
            ino,
            words,
            len: content.len(),
        });
        if let Some(slot) = inner.files.iter_mut().find(|(p, _)| p == path) {
            slot.1 = node;
        } else {
            inner.files.push((path.to_owned(), node));
        }
    }

    fn lookup(&self, path: &str) -> Result<Arc<Node>, FsError> {
        self.inner
            .read()
            .files
            .iter()
            .find(|(p, _)| p == path)
            .map(|(_, n)| n.clone())
            .ok_or(FsError::NotFound)
    }

    fn is_dir(&self, path: &str) -> bool {
        if path == "/" {
            return true;
        }
        let prefix = path.trim_end_matches('/');
        self.inner
            .read()
            .files
            .iter()
            .any(|(p, _)| p.len() > prefix.len() + 1 && p.starts_with(prefix) && p.as_bytes()[prefix.len()] == b'/')
    }

    fn file_stat(&self, node: &Node) -> Stat {
        Stat {
            st_dev: self.device,
            st_ino: node.ino,
            st_mode: S_IFREG | 0o555,
            st_size: node.len as i64,
            st_blksize: 512,
            st_blocks: (node.len as u32).div_ceil(512),
        }
    }
}

impl Vfs for RamFs {
    fn open(&self, path: &str, flags: u32, _mode: u32) -> Result<Arc<dyn File>, FsError> {
        if super::writable(flags) || super::wants_create(flags) {
            return Err(FsError::ReadOnly);
        }
        let node = self.lookup(path)?;
        Ok(Arc::new(RamFile {
            stat: self.file_stat(&node),
            node,
            pos: Mutex::new(0),
        }))
    }

    fn stat(&self, path: &str) -> Result<Stat, FsError> {
        match self.lookup(path) {
            Ok(node) => Ok(self.file_stat(&node)),
            Err(FsError::NotFound) if self.is_dir(path) => Ok(Stat {
                st_dev: self.device,
                st_ino: 0,
                st_mode: S_IFDIR | 0o555,
                st_size: 0,
                st_blksize: 512,
                st_blocks: 0,
            }),
            Err(e) => Err(e),
        }
    }

    fn program_source(&self, path: &str) -> Result<ProgramSource, FsError> {
        let node = self.lookup(path)?;
        if self.xip {
            Ok(ProgramSource::Xip {
                base: node.bytes().as_ptr() as usize,
                size: node.len,
            })
        } else {
            let stat = self.file_stat(&node);
            let size = node.len;
            let inode = node.ino;
            Ok(ProgramSource::Stored {
                file: Arc::new(RamFile {
                    stat,
                    node,
                    pos: Mutex::new(0),
                }),
                inode,
                device: self.device,
                size,
            })
        }
    }
}

/// An open handle into a `RamFs` file.
struct RamFile {
    node: Arc<Node>,
    stat: Stat,
    pos: Mutex<usize>,
}

impl File for RamFile {
    fn read(&self, buf: &mut [u8]) -> Result<usize, FsError> {
        let mut pos = self.pos.lock();
        let bytes = self.node.bytes();
        let avail = bytes.len().saturating_sub(*pos);
        let n = avail.min(buf.len());
        buf[..n].copy_from_slice(&bytes[*pos..*pos + n]);
        *pos += n;
        Ok(n)
    }

    fn write(&self, _buf: &[u8]) -> Result<usize, FsError> {
        Err(FsError::ReadOnly)
    }

    fn lseek(&self, offset: i64, whence: u32) -> Result<i64, FsError> {
        let mut pos = self.pos.lock();
        let base = match whence {
            ferrox_abi::SEEK_SET => 0,
            ferrox_abi::SEEK_CUR => *pos as i64,
            ferrox_abi::SEEK_END => self.node.len as i64,
            _ => return Err(FsError::InvalidArgument),
        };
        let target = base + offset;
        if target < 0 {
            return Err(FsError::InvalidArgument);
        }
        *pos = target as usize;
        Ok(target)
    }

    fn fstat(&self) -> Result<Stat, FsError> {
        Ok(self.stat)
    }
}
