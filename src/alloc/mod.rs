//! Persistent memory allocation over the pool heap
//!
//! The façade is deliberately narrow ([`palloc`], [`pfree`], and the aligned
//! and sizing variants) so that a different crash-consistent allocator can
//! be dropped in without disturbing the transaction engine. Every entry point
//! is durable in its own metadata before it returns, serialized by a per-pool
//! lock, and never re-enters the engine.

pub(crate) mod buddy;

use crate::pool::Pool;
use crate::result::Result;
use crate::utils::read_addr;
use crate::Error;
use buddy::{get_idx, NONE};
use std::mem;

/// Size of the block word kept ahead of every user area
const BLOCK_WORD: u64 = mem::size_of::<u64>() as u64;

/// Block words carry either the size class (tag bit set) or, for over-aligned
/// allocations, the offset of the block start (tag bit clear; block offsets
/// are 8-byte multiples).
#[inline]
fn class_tag(idx: usize) -> u64 {
    ((idx as u64) << 1) | 1
}

/// Allocates at least `size` bytes and writes the resulting user offset
/// through `out`.
///
/// `out` is the caller's slot, typically a field of an undo-log entry in
/// pool memory, and is persisted after the store when it lies within the
/// pool, so the allocation and the record of it become durable together.
pub(crate) fn palloc(pool: &Pool, out: &mut u64, size: usize) -> Result<()> {
    if size == 0 {
        return Err(Error::Invalid("zero-sized allocation".to_string()));
    }
    let _g = pool.heap_guard();
    let heap = unsafe { pool.heap() };
    let need = size + BLOCK_WORD as usize;
    let block = heap.alloc_impl(pool, need);
    if block == NONE {
        return Err(Error::NoMem);
    }
    unsafe {
        let hdr: &mut u64 = read_addr(pool.base() + block);
        *hdr = class_tag(get_idx(need));
        pool.persist_obj(hdr);
    }
    *out = block + BLOCK_WORD;
    if pool.contains_addr(out as *const u64 as u64) {
        pool.persist_obj(out);
    }
    crate::log!(White, "ALLOC", "off 0x{:x} len {}", *out, size);
    Ok(())
}

/// Aligned variant of [`palloc`]; `align` must be a power of two
pub(crate) fn palloc_aligned(
    pool: &Pool,
    out: &mut u64,
    size: usize,
    align: usize,
) -> Result<()> {
    if !align.is_power_of_two() {
        return Err(Error::Invalid(format!("alignment {} is not a power of two", align)));
    }
    if align as u64 <= BLOCK_WORD {
        return palloc(pool, out, size);
    }
    if size == 0 {
        return Err(Error::Invalid("zero-sized allocation".to_string()));
    }
    let _g = pool.heap_guard();
    let heap = unsafe { pool.heap() };
    let need = size + align + BLOCK_WORD as usize;
    let block = heap.alloc_impl(pool, need);
    if block == NONE {
        return Err(Error::NoMem);
    }
    let user = (block + BLOCK_WORD + align as u64 - 1) & !(align as u64 - 1);
    unsafe {
        let hdr: &mut u64 = read_addr(pool.base() + block);
        *hdr = class_tag(get_idx(need));
        pool.persist_obj(hdr);
        if user != block + BLOCK_WORD {
            let back: &mut u64 = read_addr(pool.base() + user - BLOCK_WORD);
            *back = block;
            pool.persist_obj(back);
        }
    }
    *out = user;
    if pool.contains_addr(out as *const u64 as u64) {
        pool.persist_obj(out);
    }
    crate::log!(White, "ALLOC", "off 0x{:x} len {} align {}", *out, size, align);
    Ok(())
}

/// Resolves a user offset back to its block start and size class
fn decode(pool: &Pool, off: u64) -> Result<(u64, usize)> {
    if off < BLOCK_WORD || off as usize >= pool.size() {
        return Err(Error::Invalid(format!("bad heap offset 0x{:x}", off)));
    }
    unsafe {
        let w = *read_addr::<u64>(pool.base() + off - BLOCK_WORD);
        if w & 1 == 1 {
            Ok((off - BLOCK_WORD, (w >> 1) as usize))
        } else {
            let block = w;
            if block as usize >= pool.size() {
                return Err(Error::Invalid(format!("bad block word at 0x{:x}", off)));
            }
            let hdr = *read_addr::<u64>(pool.base() + block);
            if hdr & 1 == 0 {
                return Err(Error::Invalid(format!("bad block word at 0x{:x}", off)));
            }
            Ok((block, (hdr >> 1) as usize))
        }
    }
}

/// Releases an offset previously produced by [`palloc`]
pub(crate) fn pfree(pool: &Pool, off: u64) -> Result<()> {
    let _g = pool.heap_guard();
    let (block, idx) = decode(pool, off)?;
    let heap = unsafe { pool.heap() };
    heap.dealloc_impl(pool, block, idx);
    crate::log!(Red, "DEALLOC", "off 0x{:x}", off);
    Ok(())
}

/// Usable bytes behind a user offset; 0 when the offset does not decode
pub(crate) fn usable_size(pool: &Pool, off: u64) -> usize {
    match decode(pool, off) {
        Ok((block, idx)) => (1usize << idx) - (off - block) as usize,
        Err(_) => 0,
    }
}

/// True unless `off` falls inside a free block. Recovery uses this to avoid
/// re-freeing an offset whose free already took effect before a crash.
pub(crate) fn is_allocated(pool: &Pool, off: u64) -> bool {
    let _g = pool.heap_guard();
    let heap = unsafe { pool.heap() };
    heap.is_allocated(pool, off, 1)
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::pool::{Pool, DEFAULT_POOL_SIZE};

    fn open(name: &str) -> Pool {
        let path = std::env::temp_dir().join(format!("pobj_alloc_{}_{}.pool", name, std::process::id()));
        let _ = std::fs::remove_file(&path);
        Pool::create(&path, DEFAULT_POOL_SIZE).unwrap()
    }

    #[test]
    fn alloc_free_restores_available() {
        let pool = open("restore");
        let before = pool.available();
        let mut offs = [0u64; 8];
        for (i, o) in offs.iter_mut().enumerate() {
            palloc(&pool, o, 24 + i * 40).unwrap();
            assert_ne!(*o, 0);
        }
        for o in &offs {
            pfree(&pool, *o).unwrap();
        }
        assert_eq!(pool.available(), before);
    }

    #[test]
    fn split_and_merge() {
        let pool = open("merge");
        let before = pool.available();

        // force a split, free in reverse, and expect full coalescing
        let mut a = 0u64;
        let mut b = 0u64;
        palloc(&pool, &mut a, 56).unwrap();
        palloc(&pool, &mut b, 4000).unwrap();
        assert!(usable_size(&pool, a) >= 56);
        assert!(usable_size(&pool, b) >= 4000);
        pfree(&pool, b).unwrap();
        pfree(&pool, a).unwrap();
        assert_eq!(pool.available(), before);

        let mut c = 0u64;
        palloc(&pool, &mut c, 56).unwrap();
        assert!(is_allocated(&pool, c));
        pfree(&pool, c).unwrap();
        assert!(!is_allocated(&pool, c));
    }

    #[test]
    fn zero_sized_alloc_rejected() {
        let pool = open("zero");
        let mut off = 0u64;
        match palloc(&pool, &mut off, 0) {
            Err(Error::Invalid(_)) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }

    #[test]
    fn aligned_allocation() {
        let pool = open("aligned");
        let before = pool.available();
        let mut off = 0u64;
        palloc_aligned(&pool, &mut off, 100, 256).unwrap();
        assert_eq!(off % 256, 0);
        assert!(usable_size(&pool, off) >= 100);
        pfree(&pool, off).unwrap();
        assert_eq!(pool.available(), before);
    }

    #[test]
    fn exhaustion_reports_nomem() {
        let pool = open("exhaust");
        let mut off = 0u64;
        match palloc(&pool, &mut off, pool.size() * 2) {
            Err(Error::NoMem) => {}
            other => panic!("unexpected: {:?}", other),
        }
    }
}
