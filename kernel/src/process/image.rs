//! # Process Image
//!
//! The RAM footprint of one process: a single pool block holding, from
//! low to high addresses, the initialized data, the zeroed bss, the heap
//! growth area, the stack overflow watermark, the main stack and finally
//! the argv/envp block whose top is the initial stack pointer.
//!
//! `load` materializes a validated ELF into a fresh block. Because the
//! validator already proved every field it touches, this code is
//! straight-line: scan the dynamic segment for sizes and the relocation
//! table, copy, zero, relocate.

use crate::config::{DATA_BASE, WATERMARK_LEN};
use crate::mm::pool::{PoolError, ProcessPool};
use crate::process::elf::{
    ElfProgram, DT_MX_RAMSIZE, DT_MX_STACKSIZE, DT_REL, DT_RELSZ, R_ARM_RELATIVE,
};

/// The loaded RAM image of a process. Owns its pool block; dropping the
/// image returns the block.
pub struct ProcessImage {
    base: usize,
    size: usize,
    main_stack_size: usize,
    data_bss_size: usize,
    pool: &'static ProcessPool,
}

impl ProcessImage {
    /// An image that owns nothing; placeholder while `execve` swaps the
    /// real one out.
    pub(crate) fn empty(pool: &'static ProcessPool) -> Self {
        Self {
            base: 0,
            size: 0,
            main_stack_size: 0,
            data_bss_size: 0,
            pool,
        }
    }

    /// Builds the image of `program` in a fresh block of `pool`:
    /// allocates `DT_MX_RAMSIZE` bytes, copies the data segment, zeroes
    /// up to the stack reservation and applies the relocations.
    ///
    /// Every word the relocation pass rewrites is inside the data segment
    /// (the validator enforced the bounds), so loading cannot write
    /// outside the freshly allocated block.
    pub fn load(program: &ElfProgram, pool: &'static ProcessPool) -> Result<Self, PoolError> {
        let view = program.view();
        let mut ram_size = 0u32;
        let mut stack_size = 0u32;
        let mut dt_rel = 0u32;
        let mut dt_relsz = 0u32;
        let mut has_relocs = false;
        // The validator guarantees the dynamic segment exists for any
        // program with a data segment; a dataless program would have been
        // rejected for a missing DT_MX_RAMSIZE already
        if let Some(dynamic) = view.dynamic_segment() {
            for dyn_entry in view.dyn_entries(dynamic) {
                match dyn_entry.d_tag {
                    DT_MX_RAMSIZE => ram_size = dyn_entry.d_val,
                    DT_MX_STACKSIZE => stack_size = dyn_entry.d_val,
                    DT_REL => {
                        has_relocs = true;
                        dt_rel = dyn_entry.d_val;
                    }
                    DT_RELSZ => {
                        has_relocs = true;
                        dt_relsz = dyn_entry.d_val;
                    }
                    _ => {}
                }
            }
        }

        let (base, size) = pool.allocate(ram_size as usize)?;
        let mut image = Self {
            base,
            size,
            main_stack_size: stack_size as usize,
            data_bss_size: 0,
            pool,
        };

        let data_segment = view
            .data_segment()
            .expect("validated program has no data segment");

        // SAFETY: [base, base+size) was just allocated for this image;
        // the source range is inside the ELF bytes (validated)
        unsafe {
            let dst = base as *mut u8;
            let src = (program.elf_base() + data_segment.p_offset as usize) as *const u8;
            core::ptr::copy_nonoverlapping(src, dst, data_segment.p_filesz as usize);
            // Zero everything after .data up to the stack reservation, not
            // just .bss: a fresh image must not leak a previous tenant's
            // bytes through the heap area. The args block size isn't known
            // here, so up to MAX_PROCESS_ARGS_BLOCK_SIZE bytes of the
            // stack top get zeroed twice; harmless.
            let zero_from = data_segment.p_filesz as usize;
            let zero_to = size - image.main_stack_size - WATERMARK_LEN;
            core::ptr::write_bytes(dst.add(zero_from), 0, zero_to - zero_from);
        }

        image.data_bss_size = data_segment.p_memsz as usize;

        if has_relocs {
            // SAFETY: the relocation offsets were validated to stay within
            // the data segment, which lies inside the block
            let words = unsafe {
                core::slice::from_raw_parts_mut(base as *mut u32, size / 4)
            };
            let ram_base = base as u32;
            let elf_base = program.elf_base() as u32;
            log::trace!(
                "image: relocating, code base {:#x}, data base {:#x}",
                elf_base,
                ram_base
            );
            for rel in view.rel_entries(dt_rel, dt_relsz) {
                if rel.r_type() != R_ARM_RELATIVE {
                    continue;
                }
                let offset = ((rel.r_offset - DATA_BASE) / 4) as usize;
                let word = words[offset];
                // A word pointing at or above DATA_BASE is a data pointer
                // and moves with the image; anything below is a code
                // pointer and moves with the ELF
                words[offset] = if word >= DATA_BASE {
                    word.wrapping_add(ram_base).wrapping_sub(DATA_BASE)
                } else {
                    word.wrapping_add(elf_base)
                };
            }
        }
        Ok(image)
    }

    /// Base address of the image block.
    pub fn base(&self) -> usize {
        self.base
    }

    /// Total size of the image block in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Size of the main stack, excluding the watermark area.
    pub fn main_stack_size(&self) -> usize {
        self.main_stack_size
    }

    /// Combined size of the .data and .bss sections.
    pub fn data_bss_size(&self) -> usize {
        self.data_bss_size
    }
}

impl Drop for ProcessImage {
    fn drop(&mut self) {
        if self.size != 0 {
            let _ = self.pool.deallocate(self.base);
        }
    }
}
