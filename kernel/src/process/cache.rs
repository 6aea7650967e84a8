//! # Program Cache
//!
//! Reference-counted cache of programs copied from non-XIP filesystems
//! into the process pool, keyed by `(inode, device)`, so that several
//! instances of the same executable share one copy of the code bytes.
//!
//! Files in XIP-capable filesystems never enter the cache: the loader
//! uses the flash-mapped bytes directly and nothing needs unloading.
//!
//! If a program is modified on disk in a way that keeps the inode while
//! at least one instance is running, later spawns hit the cache and get
//! the old version. Invalidation would need some inotify-like framework.

use alloc::vec::Vec;

use spin::Mutex;

use crate::fs::{self, ProgramSource};
use crate::mm::pool::{pool, PoolError};
use crate::process::elf::ElfError;

/// What `load` hands back to `ElfProgram`.
pub struct LoadedProgram {
    pub base: usize,
    pub size: usize,
    /// True when the bytes live in a cache-owned pool block and the
    /// program must call `unload` when done.
    pub copied_in_ram: bool,
}

struct Entry {
    inode: u32,
    device: u32,
    base: usize,
    size: usize,
    use_count: i32,
}

/// Lookup is O(n): the cache is indexed by `(inode, device)` on load and
/// by pointer on unload, few programs are loaded at once, and spawning is
/// already a heavy operation.
static ENTRIES: Mutex<Vec<Entry>> = Mutex::new(Vec::new());

/// Fetches the bytes of the executable at `path` (already absolute).
pub fn load(path: &str) -> Result<LoadedProgram, ElfError> {
    if path.is_empty() {
        return Err(ElfError::IoError);
    }
    let vfs = fs::root().ok_or(ElfError::NotFound)?;
    let source = vfs.program_source(path).map_err(|e| match e {
        fs::FsError::NotFound => ElfError::NotFound,
        fs::FsError::NameTooLong => ElfError::NameTooLong,
        _ => ElfError::IoError,
    })?;

    let (file, inode, device, file_size) = match source {
        ProgramSource::Xip { base, size } => {
            log::trace!("cache: {} is XIP @ {:#x}", path, base);
            return Ok(LoadedProgram {
                base,
                size,
                copied_in_ram: false,
            });
        }
        ProgramSource::Stored {
            file,
            inode,
            device,
            size,
        } => (file, inode, device, size),
    };

    let mut entries = ENTRIES.lock();
    if let Some(entry) = entries
        .iter_mut()
        .find(|e| e.inode == inode && e.device == device)
    {
        entry.use_count += 1;
        log::trace!(
            "cache: hit for {} @ {:#x}, use count {}",
            path,
            entry.base,
            entry.use_count
        );
        return Ok(LoadedProgram {
            base: entry.base,
            size: entry.size,
            copied_in_ram: true,
        });
    }

    // Miss: copy the file into a fresh pool block. The cache mutex stays
    // held across the read so a concurrent spawn of the same program
    // cannot load a second copy.
    let (base, block_size) = pool().allocate(file_size).map_err(|e| match e {
        PoolError::OutOfMemory => ElfError::OutOfMemory,
        _ => ElfError::IoError,
    })?;
    // SAFETY: the block was just allocated for us and is block_size bytes
    let block = unsafe { core::slice::from_raw_parts_mut(base as *mut u8, block_size) };
    let mut read = 0;
    while read < file_size {
        match file.read(&mut block[read..file_size]) {
            Ok(0) | Err(_) => {
                let _ = pool().deallocate(base);
                return Err(ElfError::IoError);
            }
            Ok(n) => read += n,
        }
    }
    // Zero the slack so a process cannot read another tenant's leftovers
    block[file_size..].fill(0);

    entries.push(Entry {
        inode,
        device,
        base,
        size: block_size,
        use_count: 1,
    });
    log::trace!("cache: loaded {} @ {:#x} ({} bytes)", path, base, file_size);
    Ok(LoadedProgram {
        base,
        size: block_size,
        copied_in_ram: true,
    })
}

/// Drops one reference to the cached program at `base`, deallocating the
/// pool block when the last reference goes away.
pub fn unload(base: usize) {
    let mut entries = ENTRIES.lock();
    let Some(idx) = entries.iter().position(|e| e.base == base) else {
        log::debug!("cache: unload of unknown program @ {:#x}", base);
        return;
    };
    entries[idx].use_count -= 1;
    if entries[idx].use_count <= 0 {
        log::trace!("cache: evicting program @ {:#x}", base);
        let _ = pool().deallocate(base);
        entries.remove(idx);
    }
}

/// Current number of cached programs; diagnostics only.
pub fn cached_count() -> usize {
    ENTRIES.lock().len()
}
