//! Shared fixtures for the hosted test suite: an aligned arena for pool
//! tests, a process pool and RAM filesystem installed behind the global
//! hooks, a scriptable scheduler stub, and a builder producing valid (or
//! deliberately broken) ARM ELF32 executables.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::sync::Arc;
use alloc::vec::Vec;

use spin::{Mutex, Once};

use ferrox_abi::Pid;

use crate::config::{DATA_BASE, MIN_PROCESS_STACK_SIZE};
use crate::fs::ramfs::RamFs;
use crate::fs::{File, FsError, Stat};
use crate::mm::pool::{self, ProcessPool};
use crate::process::{Process, PROCESS_TABLE};
use crate::sched::{SchedError, SchedulerOps, ThreadHandle};
use crate::syscall::SyscallParameters;

/// A heap arena aligned to its own (power of two) size, so pool
/// invariants hold exactly as they do over the reserved RAM on hardware.
pub struct TestArena {
    ptr: *mut u8,
    size: usize,
}

impl TestArena {
    pub fn new(size: usize) -> Self {
        assert!(size.is_power_of_two());
        let layout = Layout::from_size_align(size, size).unwrap();
        // SAFETY: size is non-zero and the layout is valid
        let ptr = unsafe { alloc_zeroed(layout) };
        assert!(!ptr.is_null());
        Self { ptr, size }
    }

    pub fn base(&self) -> usize {
        self.ptr as usize
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Drop for TestArena {
    fn drop(&mut self) {
        let layout = Layout::from_size_align(self.size, self.size).unwrap();
        // SAFETY: allocated with the same layout in new()
        unsafe { dealloc(self.ptr, layout) };
    }
}

// SAFETY: the arena is plain memory
unsafe impl Send for TestArena {}
unsafe impl Sync for TestArena {}

/// Installs (once) a 4 MiB arena as the global process pool and returns
/// it. Tests share it, so no test may exhaust it on purpose; exhaustion
/// tests build their own pool with `leaked_pool`.
pub fn test_pool() -> &'static ProcessPool {
    static INIT: Once<()> = Once::new();
    INIT.call_once(|| {
        let arena = TestArena::new(4 * 1024 * 1024);
        pool::init(arena.base(), arena.size());
        core::mem::forget(arena);
    });
    pool::pool()
}

/// A private pool over a leaked arena, for tests that need to control
/// exhaustion or observe deallocation.
pub fn leaked_pool(size: usize) -> &'static ProcessPool {
    let arena = TestArena::new(size);
    let pool = alloc::boxed::Box::leak(alloc::boxed::Box::new(ProcessPool::new(
        arena.base(),
        arena.size(),
    )));
    core::mem::forget(arena);
    pool
}

static TEST_ROOT: Once<Arc<RamFs>> = Once::new();

/// Adds `files` to the shared test root filesystem, mounting it on first
/// use. Paths are shared across the whole test binary; tests use unique
/// names unless they mean to share content.
pub fn install_test_root<B: AsRef<[u8]>>(files: &[(&str, B)]) {
    let fs = TEST_ROOT.call_once(|| {
        let fs = Arc::new(RamFs::new(1, false));
        crate::fs::set_root(fs.clone());
        fs
    });
    for (path, content) in files {
        fs.add_file(path, content.as_ref());
    }
}

std::thread_local! {
    static CURRENT_PID: core::cell::Cell<Pid> = const { core::cell::Cell::new(0) };
    static THREAD_CREATION_FAILS: core::cell::Cell<bool> = const { core::cell::Cell::new(false) };
}

/// Pretends the current test thread belongs to process `pid`.
pub fn set_current_pid(pid: Pid) {
    CURRENT_PID.with(|c| c.set(pid));
}

/// Makes the stub scheduler refuse the next thread creations.
pub fn set_thread_creation_fails(fails: bool) {
    THREAD_CREATION_FAILS.with(|c| c.set(fails));
}

/// Scheduler stub: threads are minted but never run, blocking waits are
/// a test bug and panic.
struct TestScheduler;

impl SchedulerOps for TestScheduler {
    fn current_pid(&self) -> Pid {
        CURRENT_PID.with(|c| c.get())
    }

    fn current_thread(&self) -> ThreadHandle {
        ThreadHandle(0)
    }

    fn create_userspace_thread(
        &self,
        _main: fn(Arc<Process>),
        _proc: Arc<Process>,
    ) -> Result<ThreadHandle, SchedError> {
        if THREAD_CREATION_FAILS.with(|c| c.get()) {
            return Err(SchedError::OutOfMemory);
        }
        use core::sync::atomic::{AtomicU32, Ordering};
        static NEXT: AtomicU32 = AtomicU32::new(1);
        Ok(ThreadHandle(NEXT.fetch_add(1, Ordering::Relaxed)))
    }

    fn wakeup(&self, _thread: ThreadHandle) {}

    fn test_terminate(&self) -> bool {
        false
    }

    fn park_current(&self) {
        panic!("blocking wait reached in a hosted test");
    }

    fn unpark(&self, _thread: ThreadHandle) {}

    fn monotonic_ns(&self) -> i64 {
        0
    }

    fn sleep_until_ns(&self, _deadline: i64) {}

    fn setup_userspace_context(
        &self,
        _entry: usize,
        _argc: usize,
        _argv: usize,
        _envp: usize,
        _image_base: usize,
        _stack_size: usize,
    ) {
    }

    fn switch_to_userspace(&self) -> SyscallParameters<'static> {
        panic!("userspace switch reached in a hosted test");
    }
}

static TEST_SCHEDULER: TestScheduler = TestScheduler;

/// Installs the stub scheduler (once).
pub fn install_test_scheduler() {
    crate::sched::set_scheduler(&TEST_SCHEDULER);
}

/// A spawned, table-registered process for dispatcher tests.
pub fn loaded_process() -> Arc<Process> {
    install_test_scheduler();
    test_pool();
    let elf = ElfBuilder::new().build();
    install_test_root(&[("/bin/testproc", elf.as_bytes())]);
    set_current_pid(0);
    let pid = PROCESS_TABLE
        .spawn("/bin/testproc", &[b"testproc".as_slice()], &[])
        .unwrap();
    PROCESS_TABLE.get(pid).unwrap()
}

/// A writable file recording everything written to it.
pub struct SinkFile {
    data: Mutex<Vec<u8>>,
}

impl SinkFile {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            data: Mutex::new(Vec::new()),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.data.lock().clone()
    }
}

impl File for SinkFile {
    fn read(&self, _buf: &mut [u8]) -> Result<usize, FsError> {
        Ok(0)
    }

    fn write(&self, buf: &[u8]) -> Result<usize, FsError> {
        self.data.lock().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn lseek(&self, _offset: i64, _whence: u32) -> Result<i64, FsError> {
        Err(FsError::NotSupported)
    }

    fn fstat(&self) -> Result<Stat, FsError> {
        Ok(Stat::default())
    }
}

/// 8-byte aligned ELF bytes.
pub struct AlignedElf {
    words: Vec<u64>,
    len: usize,
}

impl AlignedElf {
    pub fn as_bytes(&self) -> &[u8] {
        // SAFETY: words holds at least len bytes
        unsafe { core::slice::from_raw_parts(self.words.as_ptr() as *const u8, self.len) }
    }
}

/// Builds ARM ELF32 executables in the exact shape the validator
/// accepts, with hooks to break any individual property.
///
/// Layout of the produced file: ELF header, program header table, a few
/// words of text (the code segment covers everything up to here), the
/// data segment, the dynamic segment, and the relocation table.
pub struct ElfBuilder {
    data_words: Vec<u32>,
    bss_size: u32,
    ram_size: u32,
    stack_size: u32,
    relocs: Vec<(u32, u8)>,
    extra_null_phdrs: u16,
    extra_dyn_tags: Vec<(i32, u32)>,
    drop_dyn_tag: Option<i32>,
    abi_revision: u32,
    code_flags: Option<u32>,
    memsz_shrink: u32,
    patches: Vec<(usize, Vec<u8>)>,
}

const EHDR_SIZE: usize = 52;
const PHDR_SIZE: usize = 32;

impl ElfBuilder {
    pub fn new() -> Self {
        Self {
            data_words: alloc::vec![0; 4],
            bss_size: 16,
            ram_size: 16 * 1024,
            stack_size: MIN_PROCESS_STACK_SIZE as u32,
            relocs: Vec::new(),
            extra_null_phdrs: 0,
            extra_dyn_tags: Vec::new(),
            drop_dyn_tag: None,
            abi_revision: 1,
            code_flags: None,
            memsz_shrink: 0,
            patches: Vec::new(),
        }
    }

    pub fn data_words(mut self, words: &[u32]) -> Self {
        self.data_words = words.to_vec();
        self
    }

    pub fn bss_size(mut self, size: u32) -> Self {
        self.bss_size = size;
        self
    }

    pub fn ram_size(mut self, size: u32) -> Self {
        self.ram_size = size;
        self
    }

    pub fn stack_size(mut self, size: u32) -> Self {
        self.stack_size = size;
        self
    }

    /// Adds a relocation entry of the given type at virtual address
    /// `r_offset`.
    pub fn reloc(mut self, r_offset: u32, r_type: u8) -> Self {
        self.relocs.push((r_offset, r_type));
        self
    }

    pub fn extra_null_phdrs(mut self, count: u16) -> Self {
        self.extra_null_phdrs = count;
        self
    }

    pub fn extra_dyn_tag(mut self, tag: i32, value: u32) -> Self {
        self.extra_dyn_tags.push((tag, value));
        self
    }

    pub fn drop_dyn_tag(mut self, tag: i32) -> Self {
        self.drop_dyn_tag = Some(tag);
        self
    }

    pub fn abi_revision(mut self, revision: u32) -> Self {
        self.abi_revision = revision;
        self
    }

    pub fn code_flags(mut self, flags: u32) -> Self {
        self.code_flags = Some(flags);
        self
    }

    /// Shrinks the data segment's `p_memsz` below `p_filesz`.
    pub fn shrink_data_memsz(mut self, by: u32) -> Self {
        self.memsz_shrink = by;
        self
    }

    /// Overwrites two bytes at `offset` in the finished file.
    pub fn patch_u16(mut self, offset: usize, value: u16) -> Self {
        self.patches.push((offset, value.to_le_bytes().to_vec()));
        self
    }

    /// Overwrites four bytes at `offset` in the finished file.
    pub fn patch_u32(mut self, offset: usize, value: u32) -> Self {
        self.patches.push((offset, value.to_le_bytes().to_vec()));
        self
    }

    pub fn build(&self) -> AlignedElf {
        use crate::process::elf::{
            DT_MX_ABI, DT_MX_RAMSIZE, DT_MX_STACKSIZE, DT_REL, DT_RELENT, DT_RELSZ,
            EF_ARM_EABI_VER5, EM_ARM, ET_EXEC, PT_DYNAMIC, PT_LOAD,
        };

        let phnum = 3 + self.extra_null_phdrs as usize;
        let phoff = EHDR_SIZE;
        let text_off = phoff + phnum * PHDR_SIZE;
        let text: [u32; 2] = [0xbf00_bf00, 0x4770_bf00]; // nops and a bx lr
        let code_end = text_off + core::mem::size_of_val(&text);
        let entry = text_off;

        let data_off = code_end;
        let data_filesz = self.data_words.len() * 4;
        let dyn_off = data_off + data_filesz;

        let mut dyn_tags: Vec<(i32, u32)> = alloc::vec![
            (DT_MX_ABI, self.abi_revision),
            (DT_MX_RAMSIZE, self.ram_size),
            (DT_MX_STACKSIZE, self.stack_size),
        ];
        let relsz = self.relocs.len() * 8;
        // Relocation table location is only known after the dynamic
        // segment size; count the tags first
        let mut tag_count = dyn_tags.len() + self.extra_dyn_tags.len() + 1; // +NULL
        if !self.relocs.is_empty() {
            tag_count += 3;
        }
        let dyn_size = tag_count * 8;
        let rel_off = dyn_off + dyn_size;
        if !self.relocs.is_empty() {
            dyn_tags.push((DT_REL, rel_off as u32));
            dyn_tags.push((DT_RELSZ, relsz as u32));
            dyn_tags.push((DT_RELENT, 8));
        }
        dyn_tags.extend_from_slice(&self.extra_dyn_tags);
        if let Some(dropped) = self.drop_dyn_tag {
            dyn_tags.retain(|&(t, _)| t != dropped);
        }
        dyn_tags.push((0, 0)); // DT_NULL

        let total = rel_off + relsz;
        let mut bytes = alloc::vec![0u8; total];

        // ELF header
        let ident: [u8; 7] = [0x7f, b'E', b'L', b'F', 1, 1, 1];
        bytes[..7].copy_from_slice(&ident);
        put_u16(&mut bytes, 16, ET_EXEC);
        put_u16(&mut bytes, 18, EM_ARM);
        put_u32(&mut bytes, 20, 1); // e_version
        put_u32(&mut bytes, 24, entry as u32);
        put_u32(&mut bytes, 28, phoff as u32);
        put_u32(&mut bytes, 36, EF_ARM_EABI_VER5);
        put_u16(&mut bytes, 40, EHDR_SIZE as u16);
        put_u16(&mut bytes, 42, PHDR_SIZE as u16);
        put_u16(&mut bytes, 44, phnum as u16);

        // Code segment: covers headers and text, like a real linker lays
        // it out
        let code_flags = self.code_flags.unwrap_or(0x1 | 0x4); // X | R
        put_phdr(
            &mut bytes,
            phoff,
            PT_LOAD,
            0,
            0,
            code_end as u32,
            code_end as u32,
            code_flags,
            4,
        );
        // Data segment
        put_phdr(
            &mut bytes,
            phoff + PHDR_SIZE,
            PT_LOAD,
            data_off as u32,
            DATA_BASE,
            data_filesz as u32,
            data_filesz as u32 + self.bss_size - self.memsz_shrink,
            0x2 | 0x4, // W | R
            4,
        );
        // Dynamic segment
        put_phdr(
            &mut bytes,
            phoff + 2 * PHDR_SIZE,
            PT_DYNAMIC,
            dyn_off as u32,
            0,
            dyn_size as u32,
            dyn_size as u32,
            0x4,
            4,
        );
        // Any extra headers stay PT_NULL (zeroed)

        for (i, w) in text.iter().enumerate() {
            put_u32(&mut bytes, text_off + i * 4, *w);
        }
        for (i, w) in self.data_words.iter().enumerate() {
            put_u32(&mut bytes, data_off + i * 4, *w);
        }
        for (i, (tag, value)) in dyn_tags.iter().enumerate() {
            put_u32(&mut bytes, dyn_off + i * 8, *tag as u32);
            put_u32(&mut bytes, dyn_off + i * 8 + 4, *value);
        }
        for (i, (r_offset, r_type)) in self.relocs.iter().enumerate() {
            put_u32(&mut bytes, rel_off + i * 8, *r_offset);
            put_u32(&mut bytes, rel_off + i * 8 + 4, (1 << 8) | *r_type as u32);
        }

        for (offset, patch) in &self.patches {
            bytes[*offset..*offset + patch.len()].copy_from_slice(patch);
        }

        let mut words = alloc::vec![0u64; total.div_ceil(8)];
        // SAFETY: the word buffer holds at least total bytes
        unsafe {
            core::ptr::copy_nonoverlapping(bytes.as_ptr(), words.as_mut_ptr() as *mut u8, total);
        }
        AlignedElf { words, len: total }
    }
}

impl Default for ElfBuilder {
    fn default() -> Self {
        Self::new()
    }
}

fn put_u16(bytes: &mut [u8], offset: usize, value: u16) {
    bytes[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(bytes: &mut [u8], offset: usize, value: u32) {
    bytes[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[allow(clippy::too_many_arguments)]
fn put_phdr(
    bytes: &mut [u8],
    at: usize,
    p_type: u32,
    p_offset: u32,
    p_vaddr: u32,
    p_filesz: u32,
    p_memsz: u32,
    p_flags: u32,
    p_align: u32,
) {
    put_u32(bytes, at, p_type);
    put_u32(bytes, at + 4, p_offset);
    put_u32(bytes, at + 8, p_vaddr);
    put_u32(bytes, at + 12, p_vaddr);
    put_u32(bytes, at + 16, p_filesz);
    put_u32(bytes, at + 20, p_memsz);
    put_u32(bytes, at + 24, p_flags);
    put_u32(bytes, at + 28, p_align);
}
