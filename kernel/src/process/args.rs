//! # Argument Block
//!
//! Snapshot of argv/envp taken at syscall entry, while the strings are
//! still valid under the calling process's MPU regions, packed into one
//! self-contained buffer that can later be copied into the new process's
//! image.
//!
//! Layout: `narg+1` pointer slots (argv, null terminated), `nenv+1`
//! pointer slots (envp, null terminated), then the string bytes. The
//! block becomes the initial stack pointer of the new process, so its
//! size is padded to the context-save stack alignment, padding zeroed.
//!
//! Until relocation the pointer slots hold offsets from the block start;
//! `relocate_to` writes the block at its destination and turns every
//! non-null slot into the destination address plus that offset. This
//! keeps the block position-independent without requiring the kernel heap
//! to live inside the 32 bit user address space.

use alloc::vec;
use alloc::vec::Vec;

use crate::config::{CTXSAVE_STACK_ALIGNMENT, MAX_PROCESS_ARGS, MAX_PROCESS_ARGS_BLOCK_SIZE};

/// Argument block construction errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgsError {
    /// Too many entries, or the packed block exceeds the size limit
    TooBig,
}

impl core::fmt::Display for ArgsError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            ArgsError::TooBig => write!(f, "argument list too long"),
        }
    }
}

/// The packed, relocatable argv/envp buffer.
pub struct ArgsBlock {
    block: Vec<u8>,
    env_array_index: usize,
    narg: usize,
}

impl ArgsBlock {
    /// Packs `argv` and `envp`. Each entry is one string without its NUL
    /// terminator; terminators are added while packing.
    pub fn new(argv: &[&[u8]], envp: &[&[u8]]) -> Result<Self, ArgsError> {
        let narg = argv.len();
        let nenv = envp.len();
        if narg > MAX_PROCESS_ARGS || nenv > MAX_PROCESS_ARGS {
            return Err(ArgsError::TooBig);
        }
        let array_block_size = 4 * (narg + nenv + 2);
        // 64 bit accumulation so hostile string lengths cannot wrap the sum
        let mut total = array_block_size as u64;
        for s in argv.iter().chain(envp.iter()) {
            total += s.len() as u64 + 1;
        }
        if total > MAX_PROCESS_ARGS_BLOCK_SIZE as u64 {
            return Err(ArgsError::TooBig);
        }

        // The block defines the initial stack pointer of the new process,
        // so pad it to the context save alignment. Padding may push the
        // size over the limit.
        let unpadded = total as usize;
        let padded = unpadded.next_multiple_of(CTXSAVE_STACK_ALIGNMENT);
        if padded > MAX_PROCESS_ARGS_BLOCK_SIZE {
            return Err(ArgsError::TooBig);
        }

        let mut block = vec![0u8; padded];
        let env_array_index = 4 * (narg + 1);
        let mut slot = 0usize;
        let mut string_at = array_block_size;
        let mut append = |strings: &[&[u8]]| {
            for s in strings {
                block[slot..slot + 4].copy_from_slice(&(string_at as u32).to_le_bytes());
                slot += 4;
                block[string_at..string_at + s.len()].copy_from_slice(s);
                // NUL terminator is already there: the block starts zeroed
                string_at += s.len() + 1;
            }
            // The terminating null slot is the zero the block began with
            slot += 4;
        };
        append(argv);
        append(envp);

        Ok(Self {
            block,
            env_array_index,
            narg,
        })
    }

    /// Size of the block in bytes, padding included.
    pub fn size(&self) -> usize {
        self.block.len()
    }

    /// Number of argv entries.
    pub fn number_of_arguments(&self) -> usize {
        self.narg
    }

    /// Byte offset of the envp pointer array within the block.
    pub fn env_index(&self) -> usize {
        self.env_array_index
    }

    /// Copies the block to `dst` and rewrites every non-null pointer slot
    /// to `dst_addr` plus the slot's offset, so the argv and envp arrays
    /// at the destination reference the destination's own string area.
    ///
    /// `dst_addr` is the address the destination has in the address space
    /// of the process that will read the block; on hardware it equals
    /// `dst as u32`.
    ///
    /// # Safety
    ///
    /// `dst` must be valid for writes of `self.size()` bytes.
    pub unsafe fn relocate_to(&self, dst: *mut u8, dst_addr: u32) {
        // SAFETY: caller guarantees dst covers size() bytes
        unsafe {
            core::ptr::copy_nonoverlapping(self.block.as_ptr(), dst, self.block.len());
        }
        let mut fix = |mut slot: usize| {
            loop {
                let off = u32::from_le_bytes(self.block[slot..slot + 4].try_into().unwrap());
                if off == 0 {
                    break;
                }
                // SAFETY: slot is inside the copied block
                unsafe {
                    let p = dst.add(slot) as *mut u32;
                    p.write_unaligned(dst_addr.wrapping_add(off));
                }
                slot += 4;
            }
        };
        fix(0);
        fix(self.env_array_index);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Reads a relocated pointer array at `base + slot_off` and returns
    /// the pointer values up to the null terminator.
    fn read_array(buf: &[u8], slot_off: usize) -> Vec<u32> {
        let mut out = Vec::new();
        let mut at = slot_off;
        loop {
            let v = u32::from_le_bytes(buf[at..at + 4].try_into().unwrap());
            if v == 0 {
                break;
            }
            out.push(v);
            at += 4;
        }
        out
    }

    #[test]
    fn pack_and_relocate_round_trip() {
        let argv: [&[u8]; 3] = [b"echo", b"hello", b"world"];
        let envp: [&[u8]; 1] = [b"K=V"];
        let args = ArgsBlock::new(&argv, &envp).unwrap();
        assert_eq!(args.number_of_arguments(), 3);
        assert_eq!(args.size() % CTXSAVE_STACK_ALIGNMENT, 0);

        let mut dst = vec![0u8; args.size()];
        let dst_addr = 0x6410_8000u32;
        unsafe { args.relocate_to(dst.as_mut_ptr(), dst_addr) };

        let argv = read_array(&dst, 0);
        assert_eq!(argv.len(), 3);
        let envp = read_array(&dst, args.env_index());
        assert_eq!(envp.len(), 1);

        // Every pointer lands inside [dst_addr, dst_addr + size)
        for &p in argv.iter().chain(envp.iter()) {
            assert!(p >= dst_addr && p < dst_addr + args.size() as u32);
        }

        // And dereferencing through the offsets yields the original
        // strings, in order, NUL terminated
        let expect: [&[u8]; 4] = [b"echo", b"hello", b"world", b"K=V"];
        for (&p, want) in argv.iter().chain(envp.iter()).zip(expect) {
            let off = (p - dst_addr) as usize;
            assert_eq!(&dst[off..off + want.len()], want);
            assert_eq!(dst[off + want.len()], 0);
        }
    }

    #[test]
    fn empty_arrays() {
        let args = ArgsBlock::new(&[], &[]).unwrap();
        // Two null terminator slots, padded
        assert_eq!(args.size(), 8);
        assert_eq!(args.number_of_arguments(), 0);

        let mut dst = vec![0xffu8; args.size()];
        unsafe { args.relocate_to(dst.as_mut_ptr(), 0x1000) };
        assert_eq!(read_array(&dst, 0).len(), 0);
        assert_eq!(read_array(&dst, args.env_index()).len(), 0);
    }

    #[test]
    fn too_many_entries() {
        let one: &[u8] = b"x";
        let many = vec![one; MAX_PROCESS_ARGS + 1];
        assert!(matches!(ArgsBlock::new(&many, &[]), Err(ArgsError::TooBig)));
        assert!(matches!(ArgsBlock::new(&[], &many), Err(ArgsError::TooBig)));
    }

    #[test]
    fn size_limit_boundary() {
        // Slots take (1+1)+(0+1) = 3 words = 12 bytes; one string of
        // MAX - 12 - 1 bytes packs to exactly MAX, already aligned
        let len = MAX_PROCESS_ARGS_BLOCK_SIZE - 12 - 1;
        let s = vec![b'a'; len];
        let args = ArgsBlock::new(&[s.as_slice()], &[]).unwrap();
        assert_eq!(args.size(), MAX_PROCESS_ARGS_BLOCK_SIZE);

        // One more byte crosses the limit
        let s = vec![b'a'; len + 1];
        assert!(ArgsBlock::new(&[s.as_slice()], &[]).is_err());

        // A shorter string whose padded size still reaches the limit
        let s = vec![b'a'; len - 2];
        let args = ArgsBlock::new(&[s.as_slice()], &[]).unwrap();
        assert_eq!(args.size(), MAX_PROCESS_ARGS_BLOCK_SIZE);
    }

    #[test]
    fn padding_is_zeroed() {
        // Slots 12 bytes + "abcd\0" = 17 bytes, padded to 24
        let args = ArgsBlock::new(&[b"abcd".as_slice()], &[]).unwrap();
        assert_eq!(args.size(), 24);
        let mut dst = vec![0xffu8; args.size()];
        unsafe { args.relocate_to(dst.as_mut_ptr(), 0x1000) };
        assert!(dst[17..].iter().all(|&b| b == 0));
    }
}
