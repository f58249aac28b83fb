//! Low-level durability primitives

#![allow(unused)]

#[cfg(target_arch = "x86_64")]
use std::arch::x86_64::{_mm_clflush, _mm_mfence, _mm_sfence};

/// Reports whether a mapped byte range should be treated as true persistent
/// memory.
///
/// Ordinary mapped files need `msync` to reach durability. A DAX mapping can
/// be flushed with cache-line instructions instead; since the kernel gives no
/// portable answer, the `PMEM_IS_PMEM_FORCE` environment variable makes the
/// claim on behalf of the operator.
pub fn is_pmem(_addr: *const u8, _len: usize) -> bool {
    match std::env::var("PMEM_IS_PMEM_FORCE") {
        Ok(v) => v == "1",
        Err(_) => false,
    }
}

/// Flushes the cache lines covering `addr..addr+len` back to memory
#[inline]
pub fn clflush(addr: *const u8, len: usize) {
    #[cfg(all(target_arch = "x86_64", not(feature = "no_persist")))]
    unsafe {
        let mut start = (addr as usize >> 6) << 6;
        let end = addr as usize + len;
        while start < end {
            _mm_clflush(start as *const u8);
            start += 64;
        }
    }
}

/// Store fence
#[inline(always)]
pub fn sfence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        _mm_sfence();
    }
}

/// Memory fence
#[inline]
pub fn mfence() {
    #[cfg(target_arch = "x86_64")]
    unsafe {
        _mm_mfence();
    }
}

/// Synchronizes the pages covering `addr..addr+len` with the backing file
pub fn msync(addr: *const u8, len: usize) {
    #[cfg(not(feature = "no_persist"))]
    unsafe {
        let off = addr as usize;
        let end = off + len;
        let page = (off >> 12) << 12;
        if libc::msync(
            page as *mut libc::c_void,
            end - page,
            libc::MS_SYNC,
        ) != 0
        {
            panic!("msync failed: {}", std::io::Error::last_os_error());
        }
    }
}

/// Makes `addr..addr+len` durable and acts like a write barrier
///
/// On true PMEM the range is flushed line by line and fenced; otherwise the
/// backing file is synchronized. Callers must not batch persists across a
/// transaction boundary, as that would reorder observable commit points.
#[inline]
pub fn persist(is_pmem: bool, addr: *const u8, len: usize) {
    #[cfg(not(feature = "no_persist"))]
    {
        if is_pmem && cfg!(target_arch = "x86_64") && !cfg!(feature = "use_msync") {
            clflush(addr, len);
            sfence();
        } else {
            msync(addr, len);
        }
    }
}

/// Makes a whole object durable
#[inline]
pub fn persist_obj<T: ?Sized>(is_pmem: bool, obj: &T) {
    persist(
        is_pmem,
        obj as *const T as *const u8,
        std::mem::size_of_val(obj),
    );
}
