//! # ELF Program Validation
//!
//! Full-recognition loader front end for Ferrox executables: little-endian
//! ARM ELF32 files carrying the Ferrox dynamic tags.
//!
//! Validation follows the full-recognition-before-processing discipline:
//! every field the loader will later read is checked in advance, so the
//! loader itself is straight-line code that cannot derail on malformed
//! input. Unused fields are unchecked; when a new field is needed, a new
//! check must be added here first.
//!
//! A file is accepted only if it declares a single read/execute segment
//! containing the entry point, at most one read/write segment (write and
//! execute never coexist), and at most one dynamic segment that follows
//! the writable one. The ordering rule and W^X are deliberate hardening:
//! the ELF spec itself does not require either, so a future toolchain
//! could emit files this validator rejects.

use bitflags::bitflags;

use ferrox_abi::errno;

use crate::config::{
    CTXSAVE_STACK_ALIGNMENT, MAX_PROCESS_IMAGE_SIZE, MIN_PROCESS_STACK_SIZE, WATERMARK_LEN,
};
use crate::process::cache;

/// ELF identification bytes this kernel accepts: magic, ELF32,
/// little-endian, version 1. The remaining ident bytes are ignored.
pub const ELF_MAGIC: [u8; 7] = [0x7f, b'E', b'L', b'F', 1, 1, 1];

pub const ET_EXEC: u16 = 2;
pub const EM_ARM: u16 = 0x28;
pub const EV_CURRENT: u32 = 1;

/// Mask and required value of the ARM EABI version field of `e_flags`.
pub const EF_ARM_EABI_MASK: u32 = 0xff00_0000;
pub const EF_ARM_EABI_VER5: u32 = 0x0500_0000;
/// Set when the executable uses the VFP hard-float ABI.
pub const EF_ARM_VFP_FLOAT: u32 = 0x400;

pub const PT_LOAD: u32 = 1;
pub const PT_DYNAMIC: u32 = 2;

bitflags! {
    /// Segment permission word (`p_flags`).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct SegmentFlags: u32 {
        const X = 0x1;
        const W = 0x2;
        const R = 0x4;
    }
}

// Standard dynamic tags the validator reacts to
pub const DT_REL: i32 = 17;
pub const DT_RELSZ: i32 = 18;
pub const DT_RELENT: i32 = 19;
pub const DT_RELA: i32 = 7;
pub const DT_RELASZ: i32 = 8;
pub const DT_RELAENT: i32 = 9;

// Ferrox dynamic tags, outside the standard range. Their presence stamps
// a file as built for this OS.
pub const DT_MX_ABI: i32 = 0x1000_0000;
pub const DT_MX_RAMSIZE: i32 = 0x1000_0001;
pub const DT_MX_STACKSIZE: i32 = 0x1000_0002;
/// The only ABI revision this kernel implements.
pub const DV_MX_ABI_V1: u32 = 1;

pub const R_ARM_NONE: u8 = 0;
pub const R_ARM_RELATIVE: u8 = 23;

/// ELF32 file header.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Elf32Ehdr {
    pub e_ident: [u8; 16],
    pub e_type: u16,
    pub e_machine: u16,
    pub e_version: u32,
    pub e_entry: u32,
    pub e_phoff: u32,
    pub e_shoff: u32,
    pub e_flags: u32,
    pub e_ehsize: u16,
    pub e_phentsize: u16,
    pub e_phnum: u16,
    pub e_shentsize: u16,
    pub e_shnum: u16,
    pub e_shstrndx: u16,
}

/// ELF32 program header.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Elf32Phdr {
    pub p_type: u32,
    pub p_offset: u32,
    pub p_vaddr: u32,
    pub p_paddr: u32,
    pub p_filesz: u32,
    pub p_memsz: u32,
    pub p_flags: u32,
    pub p_align: u32,
}

/// ELF32 dynamic section entry.
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Elf32Dyn {
    pub d_tag: i32,
    pub d_val: u32,
}

/// ELF32 relocation entry (without addend).
#[derive(Debug, Clone, Copy)]
#[repr(C)]
pub struct Elf32Rel {
    pub r_offset: u32,
    pub r_info: u32,
}

impl Elf32Rel {
    pub fn r_type(&self) -> u8 {
        self.r_info as u8
    }
}

/// Why a byte sequence was rejected, or why a file could not be fetched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ElfError {
    /// File smaller than one ELF header
    TooSmall,
    /// ELF bytes not 8-byte aligned in memory
    Unaligned,
    /// Not an ELF32 little-endian version 1 file
    BadMagic,
    /// `e_type` is not EXEC
    NotExecutable,
    /// `e_machine` is not ARM
    WrongMachine,
    /// `e_version` is not CURRENT
    BadVersion,
    /// Entry point outside the file or outside the code segment
    BadEntryPoint,
    /// Program header table offset out of range or misaligned
    BadProgramHeaderTable,
    /// Not an ARM EABI v5 file
    BadAbiFlags,
    /// Hard-float executable on a target built without FPU support
    FpuRequired,
    /// `e_ehsize`/`e_phentsize` disagree with the real structure sizes
    BadHeaderSize,
    /// More than 20 program headers
    TooManyProgramHeaders,
    /// A segment's offset plus size overflows or exceeds the file
    SegmentOutOfBounds,
    /// `p_align` not in the supported set, or `p_offset` misaligned
    BadSegmentAlignment,
    /// Segment flags outside {R,W,X}, R missing, or W and X together
    BadSegmentFlags,
    /// More than one code, data or dynamic segment
    DuplicateSegment,
    /// No code segment at all
    MissingCodeSegment,
    /// Writable segment larger than memory allows, or `memsz < filesz`
    BadDataSegment,
    /// Dynamic segment before the writable segment, or misaligned
    BadDynamicSegment,
    /// Missing or unknown `DT_MX_ABI` tag: not built for this OS
    NotFerroxExecutable,
    /// RELA relocations are unsupported
    RelaUnsupported,
    /// Relocation table out of bounds, or an entry of unsupported type
    /// or targeting memory outside the data segment
    BadRelocation,
    /// Stack or RAM size tags inconsistent with the limits
    BadImageSize,
    /// Path does not resolve to a file
    NotFound,
    /// Path exceeds `PATH_MAX` after resolution
    NameTooLong,
    /// Process pool could not hold a copy of the file
    OutOfMemory,
    /// The filesystem failed while reading the file
    IoError,
}

impl ElfError {
    /// Negative errno value reported to callers of `spawn`/`execve`.
    pub fn errno(&self) -> i32 {
        match self {
            ElfError::NotFound => -errno::ENOENT,
            ElfError::NameTooLong => -errno::ENAMETOOLONG,
            ElfError::OutOfMemory => -errno::ENOMEM,
            ElfError::IoError => -errno::EFAULT,
            _ => -errno::ENOEXEC,
        }
    }
}

impl core::fmt::Display for ElfError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ElfError::TooSmall => write!(f, "file too small"),
            ElfError::Unaligned => write!(f, "load address alignment error"),
            ElfError::BadMagic => write!(f, "unrecognized format"),
            ElfError::NotExecutable => write!(f, "not an executable"),
            ElfError::WrongMachine => write!(f, "wrong CPU architecture"),
            ElfError::BadVersion => write!(f, "unsupported ELF version"),
            ElfError::BadEntryPoint => write!(f, "invalid entry point"),
            ElfError::BadProgramHeaderTable => write!(f, "invalid program header table"),
            ElfError::BadAbiFlags => write!(f, "not an ARM EABI v5 file"),
            ElfError::FpuRequired => write!(f, "FPU required"),
            ElfError::BadHeaderSize => write!(f, "header size mismatch"),
            ElfError::TooManyProgramHeaders => write!(f, "too many program headers"),
            ElfError::SegmentOutOfBounds => write!(f, "segment out of bounds"),
            ElfError::BadSegmentAlignment => write!(f, "unsupported segment alignment"),
            ElfError::BadSegmentFlags => write!(f, "invalid segment flags"),
            ElfError::DuplicateSegment => write!(f, "duplicate segment"),
            ElfError::MissingCodeSegment => write!(f, "no code segment"),
            ElfError::BadDataSegment => write!(f, "invalid data segment"),
            ElfError::BadDynamicSegment => write!(f, "invalid dynamic segment"),
            ElfError::NotFerroxExecutable => write!(f, "not a Ferrox executable"),
            ElfError::RelaUnsupported => write!(f, "RELA relocations unsupported"),
            ElfError::BadRelocation => write!(f, "invalid relocation"),
            ElfError::BadImageSize => write!(f, "invalid stack or RAM size"),
            ElfError::NotFound => write!(f, "no such file"),
            ElfError::NameTooLong => write!(f, "path too long"),
            ElfError::OutOfMemory => write!(f, "out of memory"),
            ElfError::IoError => write!(f, "I/O error"),
        }
    }
}

/// A validated executable.
///
/// The ELF bytes either live in execute-in-place flash (`copied_in_ram`
/// false, borrowed from the filesystem image) or in a Program Cache block
/// inside the process pool (`copied_in_ram` true, this object holds a
/// cache reference released on drop).
#[derive(Debug)]
pub struct ElfProgram {
    base: usize,
    size: usize,
    copied_in_ram: bool,
}

impl ElfProgram {
    /// Loads and validates the executable at `path`.
    ///
    /// Files in XIP-capable filesystems are used in place; everything else
    /// goes through the Program Cache, which copies the file into a
    /// process pool block shared between instances of the same program.
    pub fn from_path(path: &str) -> Result<Self, ElfError> {
        let loaded = cache::load(path)?;
        let program = Self {
            base: loaded.base,
            size: loaded.size,
            copied_in_ram: loaded.copied_in_ram,
        };
        // Dropping on failure releases the cache reference taken above
        program.validate()?;
        Ok(program)
    }

    /// Validates an executable already mapped in memory, usually the
    /// microcontroller's flash. Ownership of the bytes stays with the
    /// caller.
    ///
    /// # Safety
    ///
    /// `[base, base + size)` must stay readable for the whole lifetime of
    /// the returned program and of every process created from it.
    pub unsafe fn from_raw(base: *const u8, size: usize) -> Result<Self, ElfError> {
        let program = Self {
            base: base as usize,
            size,
            copied_in_ram: false,
        };
        program.validate()?;
        Ok(program)
    }

    /// Address of the first byte of the ELF file.
    pub fn elf_base(&self) -> usize {
        self.base
    }

    /// Size in bytes of the ELF file.
    pub fn elf_size(&self) -> usize {
        self.size
    }

    /// True if the bytes were copied into the process pool; false for XIP
    /// programs whose bytes stay in flash.
    pub fn is_copied_in_ram(&self) -> bool {
        self.copied_in_ram
    }

    /// The already relocated entry point address.
    pub fn entry_point(&self) -> usize {
        self.base + self.view().ehdr().e_entry as usize
    }

    /// Borrowed structured view over the file bytes.
    pub(crate) fn view(&self) -> ElfView<'_> {
        // SAFETY: the constructors guarantee [base, base+size) stays
        // readable while self lives
        ElfView {
            bytes: unsafe { core::slice::from_raw_parts(self.base as *const u8, self.size) },
        }
    }

    fn validate(&self) -> Result<(), ElfError> {
        if self.base % 8 != 0 {
            log::debug!("elf: load address alignment error");
            return Err(ElfError::Unaligned);
        }
        self.view().validate()
    }
}

impl Drop for ElfProgram {
    fn drop(&mut self) {
        if self.copied_in_ram {
            cache::unload(self.base);
        }
    }
}

/// Structured accessors over raw ELF bytes. Every accessor except
/// `validate` assumes validation already passed.
pub(crate) struct ElfView<'a> {
    pub(crate) bytes: &'a [u8],
}

impl<'a> ElfView<'a> {
    pub fn ehdr(&self) -> &'a Elf32Ehdr {
        // SAFETY: validate() checked the size, and the base is 8-byte
        // aligned, more than the header's natural alignment
        unsafe { &*(self.bytes.as_ptr() as *const Elf32Ehdr) }
    }

    /// The program header table.
    pub fn phdrs(&self) -> &'a [Elf32Phdr] {
        let ehdr = self.ehdr();
        // SAFETY: validate() checked e_phoff alignment and that the whole
        // table lies inside the file
        unsafe {
            core::slice::from_raw_parts(
                self.bytes.as_ptr().add(ehdr.e_phoff as usize) as *const Elf32Phdr,
                ehdr.e_phnum as usize,
            )
        }
    }

    /// The entries of a dynamic segment.
    pub fn dyn_entries(&self, phdr: &Elf32Phdr) -> &'a [Elf32Dyn] {
        // SAFETY: validate() checked the segment bounds and alignment
        unsafe {
            core::slice::from_raw_parts(
                self.bytes.as_ptr().add(phdr.p_offset as usize) as *const Elf32Dyn,
                phdr.p_memsz as usize / core::mem::size_of::<Elf32Dyn>(),
            )
        }
    }

    /// The relocation table at file offset `off`, `sz` bytes long.
    pub fn rel_entries(&self, off: u32, sz: u32) -> &'a [Elf32Rel] {
        // SAFETY: validate() checked table bounds and 4-byte alignment
        unsafe {
            core::slice::from_raw_parts(
                self.bytes.as_ptr().add(off as usize) as *const Elf32Rel,
                sz as usize / core::mem::size_of::<Elf32Rel>(),
            )
        }
    }

    /// The writable (data) segment header, if the file has one.
    pub fn data_segment(&self) -> Option<&'a Elf32Phdr> {
        self.phdrs().iter().find(|p| {
            p.p_type == PT_LOAD
                && SegmentFlags::from_bits_truncate(p.p_flags).contains(SegmentFlags::W)
        })
    }

    /// The dynamic segment header, if the file has one.
    pub fn dynamic_segment(&self) -> Option<&'a Elf32Phdr> {
        self.phdrs().iter().find(|p| p.p_type == PT_DYNAMIC)
    }

    /// Runs every check of the full-recognition pass. On success all the
    /// other accessors of this view are safe to call.
    pub fn validate(&self) -> Result<(), ElfError> {
        let size = self.bytes.len();
        if size < core::mem::size_of::<Elf32Ehdr>() {
            return Err(ElfError::TooSmall);
        }
        let ehdr = self.ehdr();
        if ehdr.e_ident[..ELF_MAGIC.len()] != ELF_MAGIC {
            log::debug!("elf: unrecognized format");
            return Err(ElfError::BadMagic);
        }
        if ehdr.e_type != ET_EXEC {
            return Err(ElfError::NotExecutable);
        }
        if ehdr.e_machine != EM_ARM {
            log::debug!("elf: wrong CPU architecture");
            return Err(ElfError::WrongMachine);
        }
        if ehdr.e_version != EV_CURRENT {
            return Err(ElfError::BadVersion);
        }
        if ehdr.e_entry as usize >= size {
            return Err(ElfError::BadEntryPoint);
        }
        if ehdr.e_phoff as usize >= size - core::mem::size_of::<Elf32Phdr>() {
            return Err(ElfError::BadProgramHeaderTable);
        }
        if ehdr.e_phoff % 4 != 0 {
            return Err(ElfError::BadProgramHeaderTable);
        }
        if ehdr.e_flags & EF_ARM_EABI_MASK != EF_ARM_EABI_VER5 {
            return Err(ElfError::BadAbiFlags);
        }
        #[cfg(not(feature = "fpu"))]
        if ehdr.e_flags & EF_ARM_VFP_FLOAT != 0 {
            log::debug!("elf: FPU required");
            return Err(ElfError::FpuRequired);
        }
        if ehdr.e_ehsize as usize != core::mem::size_of::<Elf32Ehdr>() {
            return Err(ElfError::BadHeaderSize);
        }
        if ehdr.e_phentsize as usize != core::mem::size_of::<Elf32Phdr>() {
            return Err(ElfError::BadHeaderSize);
        }
        // The bound itself is arbitrary; what matters is keeping the next
        // multiplication far away from 32 bit wraparound
        if ehdr.e_phnum > 20 {
            return Err(ElfError::TooManyProgramHeaders);
        }
        let table_len = ehdr.e_phnum as usize * core::mem::size_of::<Elf32Phdr>();
        if ehdr.e_phoff as usize + table_len > size {
            return Err(ElfError::BadProgramHeaderTable);
        }

        let mut code_segment_present = false;
        let mut data_segment_present = false;
        let mut dynamic_segment_present = false;
        let mut data_segment_size = 0u32;
        for phdr in self.phdrs() {
            // Three separate comparisons: the sum check alone could pass
            // after a 32 bit wraparound
            if phdr.p_offset as usize >= size {
                return Err(ElfError::SegmentOutOfBounds);
            }
            if phdr.p_filesz as usize >= size {
                return Err(ElfError::SegmentOutOfBounds);
            }
            if phdr.p_offset as usize + phdr.p_filesz as usize > size {
                return Err(ElfError::SegmentOutOfBounds);
            }
            match phdr.p_align {
                0 | 1 => {}
                2 | 4 | 8 | 16 | 32 | 64 => {
                    if phdr.p_offset % phdr.p_align != 0 {
                        log::debug!("elf: segment alignment error");
                        return Err(ElfError::BadSegmentAlignment);
                    }
                }
                _ => return Err(ElfError::BadSegmentAlignment),
            }

            match phdr.p_type {
                PT_LOAD => {
                    let flags = SegmentFlags::from_bits(phdr.p_flags)
                        .ok_or(ElfError::BadSegmentFlags)?;
                    if !flags.contains(SegmentFlags::R) {
                        return Err(ElfError::BadSegmentFlags);
                    }
                    if flags.contains(SegmentFlags::W | SegmentFlags::X) {
                        log::debug!("elf: file violates W^X");
                        return Err(ElfError::BadSegmentFlags);
                    }
                    if flags.contains(SegmentFlags::X) {
                        if code_segment_present {
                            return Err(ElfError::DuplicateSegment);
                        }
                        code_segment_present = true;
                        if ehdr.e_entry < phdr.p_offset
                            || ehdr.e_entry > phdr.p_offset + phdr.p_filesz
                            || phdr.p_filesz != phdr.p_memsz
                        {
                            return Err(ElfError::BadEntryPoint);
                        }
                    }
                    if flags.contains(SegmentFlags::W) {
                        if data_segment_present {
                            return Err(ElfError::DuplicateSegment);
                        }
                        data_segment_present = true;
                        if phdr.p_memsz < phdr.p_filesz {
                            return Err(ElfError::BadDataSegment);
                        }
                        let max = (MAX_PROCESS_IMAGE_SIZE - MIN_PROCESS_STACK_SIZE) as u32;
                        if phdr.p_memsz >= max {
                            log::debug!("elf: data segment too big");
                            return Err(ElfError::BadDataSegment);
                        }
                        data_segment_size = phdr.p_memsz;
                    }
                }
                PT_DYNAMIC => {
                    if dynamic_segment_present {
                        return Err(ElfError::DuplicateSegment);
                    }
                    dynamic_segment_present = true;
                    // The dynamic segment must come after the data segment
                    if !data_segment_present {
                        return Err(ElfError::BadDynamicSegment);
                    }
                    if phdr.p_align < 4 {
                        return Err(ElfError::BadDynamicSegment);
                    }
                    // The scan below walks p_memsz bytes, which the LOAD
                    // bound checks above did not cover
                    if phdr.p_offset as usize + phdr.p_memsz as usize > size {
                        return Err(ElfError::SegmentOutOfBounds);
                    }
                    self.validate_dynamic_segment(phdr, data_segment_size)?;
                }
                _ => {
                    // Other segment types are ignored
                }
            }
        }
        if !code_segment_present {
            return Err(ElfError::MissingCodeSegment);
        }
        Ok(())
    }

    fn validate_dynamic_segment(
        &self,
        dynamic: &Elf32Phdr,
        data_segment_size: u32,
    ) -> Result<(), ElfError> {
        let size = self.bytes.len();
        let mut dt_rel = 0u32;
        let mut dt_relsz = 0u32;
        let mut has_relocs = 0u32;
        let mut abi_tag_found = false;
        let mut ram_size = 0u32;
        let mut stack_size = 0u32;
        for dyn_entry in self.dyn_entries(dynamic) {
            match dyn_entry.d_tag {
                DT_REL => {
                    has_relocs |= 0x1;
                    dt_rel = dyn_entry.d_val;
                }
                DT_RELSZ => {
                    has_relocs |= 0x2;
                    dt_relsz = dyn_entry.d_val;
                }
                DT_RELENT => {
                    has_relocs |= 0x4;
                    if dyn_entry.d_val as usize != core::mem::size_of::<Elf32Rel>() {
                        return Err(ElfError::BadRelocation);
                    }
                }
                DT_MX_ABI => {
                    if dyn_entry.d_val == DV_MX_ABI_V1 {
                        abi_tag_found = true;
                    } else {
                        log::debug!("elf: unknown DT_MX_ABI revision");
                        return Err(ElfError::NotFerroxExecutable);
                    }
                }
                DT_MX_RAMSIZE => ram_size = dyn_entry.d_val,
                DT_MX_STACKSIZE => stack_size = dyn_entry.d_val,
                DT_RELA | DT_RELASZ | DT_RELAENT => {
                    log::debug!("elf: RELA relocations unsupported");
                    return Err(ElfError::RelaUnsupported);
                }
                _ => {
                    // Other entries are ignored
                }
            }
        }
        if !abi_tag_found {
            log::debug!("elf: not a Ferrox executable");
            return Err(ElfError::NotFerroxExecutable);
        }
        if (stack_size as usize) < MIN_PROCESS_STACK_SIZE {
            log::debug!("elf: requested stack is too small");
            return Err(ElfError::BadImageSize);
        }
        if ram_size as usize > MAX_PROCESS_IMAGE_SIZE {
            log::debug!("elf: requested image size is too large");
            return Err(ElfError::BadImageSize);
        }
        // This can only guarantee that static data and stack fit in the
        // RAM size. The argv/envp block size isn't known yet, so memory
        // can still run out at load time; usually the RAM size is
        // oversized to leave room for the heap anyway.
        if stack_size as usize % CTXSAVE_STACK_ALIGNMENT != 0
            || ram_size % 4 != 0
            || stack_size as usize > MAX_PROCESS_IMAGE_SIZE
            || data_segment_size as usize > MAX_PROCESS_IMAGE_SIZE
            || data_segment_size as usize + stack_size as usize + WATERMARK_LEN
                > ram_size as usize
        {
            return Err(ElfError::BadImageSize);
        }

        if has_relocs != 0 && has_relocs != 0x7 {
            return Err(ElfError::BadRelocation);
        }
        if has_relocs != 0 {
            if dt_rel as usize >= size {
                return Err(ElfError::BadRelocation);
            }
            if dt_relsz as usize >= size {
                return Err(ElfError::BadRelocation);
            }
            if dt_rel as usize + dt_relsz as usize > size {
                return Err(ElfError::BadRelocation);
            }
            if dt_rel % 4 != 0 {
                return Err(ElfError::BadRelocation);
            }
            for rel in self.rel_entries(dt_rel, dt_relsz) {
                match rel.r_type() {
                    R_ARM_NONE => {}
                    R_ARM_RELATIVE => {
                        let data_base = crate::config::DATA_BASE;
                        if rel.r_offset < data_base {
                            return Err(ElfError::BadRelocation);
                        }
                        if rel.r_offset > data_base + data_segment_size - 4 {
                            return Err(ElfError::BadRelocation);
                        }
                        if rel.r_offset % 4 != 0 {
                            return Err(ElfError::BadRelocation);
                        }
                    }
                    _ => {
                        log::debug!("elf: unexpected relocation type {}", rel.r_type());
                        return Err(ElfError::BadRelocation);
                    }
                }
            }
        }
        Ok(())
    }
}
