use crate::pool::Pool;
use crate::utils::{read_addr, Ring};
use std::mem;

/// Free-list terminator; offset 0 is a legal block address, so the allocator
/// uses the all-ones pattern for "none".
pub(crate) const NONE: u64 = u64::MAX;

/// One staged metadata update: write `val` into the u64 at pool offset `off`
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub(crate) struct RedoEntry {
    pub off: u64,
    pub val: u64,
}

#[inline]
const fn num_bits<T>() -> u32 {
    (mem::size_of::<T>() << 3) as u32
}

#[inline]
pub(crate) fn get_idx(x: usize) -> usize {
    if x == 0 {
        usize::MAX
    } else {
        let x = x.max(mem::size_of::<u64>());
        (num_bits::<usize>() - (x - 1).leading_zeros()) as usize
    }
}

/// Buddy allocation algorithm
///
/// Keeps 64 free lists of available blocks; list `k` holds blocks of
/// `2^k` bytes, linked through the first word of each free block. The heap
/// is seeded with a single block of the largest power of two that fits the
/// region, split on demand, and re-merged by buddy parity on free.
///
/// Metadata updates are staged in the `aux` ring first, persisted, marked
/// valid, and only then applied to the lists. A crash between those steps is
/// recovered at the next open by re-applying the staged writes, which are
/// idempotent.
#[repr(C)]
pub(crate) struct BuddyAlg {
    /// Free lists; `NONE` marks an empty list
    buddies: [u64; 64],

    /// The index of the seed (largest) list
    last_idx: u64,

    /// Start of the managed region, as a pool offset
    base: u64,

    /// Managed bytes (a power of two)
    size: u64,

    /// Available bytes
    available: u64,

    /// Staged value of `available`, applied on drain
    available_log: u64,

    /// Nonzero while staged updates are being materialized
    aux_valid: u64,

    /// Staged metadata updates for the operation in flight
    aux: Ring<RedoEntry, 128>,
}

impl BuddyAlg {
    /// Initializes the metadata over the region `[base, base + len)`
    pub fn init(&mut self, pool: &Pool, base: u64, len: usize) {
        let mut idx = get_idx(len);
        if 1usize << idx > len {
            idx -= 1;
        }
        self.buddies = [NONE; 64];
        self.base = base;
        self.size = 1 << idx;
        self.available = self.size;
        self.available_log = self.size;
        self.last_idx = idx as u64;
        self.aux_valid = 0;
        self.aux.clear();
        self.buddies[idx] = base;
        *Self::word(pool, base) = NONE;
        pool.persist_off(base, 8);
    }

    #[inline]
    fn word<'a>(pool: &Pool, off: u64) -> &'a mut u64 {
        debug_assert!(
            off as usize + 8 <= pool.size(),
            "off(0x{:x}) out of range",
            off
        );
        unsafe { read_addr(pool.base() + off) }
    }

    /// Pool offset of a free-list head field within this struct
    #[inline]
    fn head_off(pool: &Pool, field: &u64) -> u64 {
        field as *const u64 as u64 - pool.base()
    }

    #[inline]
    fn stage(&mut self, off: u64, val: u64) {
        self.aux.push(RedoEntry { off, val });
    }

    /// Materializes the staged updates
    ///
    /// The ring and the valid flag are persisted before any list word is
    /// touched, so an interrupted drain can always be finished by
    /// [`recover`](Self::recover).
    fn drain_aux(&mut self, pool: &Pool) {
        pool.persist_obj(&self.aux);
        pool.persist_obj(&self.available_log);
        self.aux_valid = 1;
        pool.persist_obj(&self.aux_valid);

        let base = pool.base();
        self.aux.foreach(|e| unsafe {
            let w: &mut u64 = read_addr(base + e.off);
            *w = e.val;
            pool.persist_obj(w);
        });
        self.available = self.available_log;
        pool.persist_obj(&self.available);

        self.aux_valid = 0;
        pool.persist_obj(&self.aux_valid);
        self.aux.clear();
    }

    /// Finishes an interrupted drain, if any
    pub fn recover(&mut self, pool: &Pool) {
        if self.aux_valid != 0 {
            let base = pool.base();
            self.aux.foreach(|e| unsafe {
                let w: &mut u64 = read_addr(base + e.off);
                *w = e.val;
                pool.persist_obj(w);
            });
            self.available = self.available_log;
            pool.persist_obj(&self.available);
            self.aux_valid = 0;
            pool.persist_obj(&self.aux_valid);
        }
        self.aux.clear();
    }

    /// Carves a block of at least `len` bytes out of the free lists
    ///
    /// Returns the block offset, or [`NONE`] when no block of the rounded
    /// size class is available.
    pub fn alloc_impl(&mut self, pool: &Pool, len: usize) -> u64 {
        let idx = get_idx(len);
        if idx > self.last_idx as usize {
            return NONE;
        }
        let len = 1u64 << idx;
        if len > self.available {
            return NONE;
        }

        let mut i = idx;
        while i <= self.last_idx as usize && self.buddies[i] == NONE {
            i += 1;
        }
        if i > self.last_idx as usize {
            // free space exists only in smaller fragments
            return NONE;
        }

        let block = self.buddies[i];
        let next = *Self::word(pool, block);
        self.stage(Self::head_off(pool, &self.buddies[i]), next);

        // split down to the requested class, pushing each upper half
        let mut k = i;
        while k > idx {
            k -= 1;
            let upper = block + (1u64 << k);
            self.stage(upper, self.buddies[k]);
            self.stage(Self::head_off(pool, &self.buddies[k]), upper);
        }

        self.available_log = self.available - len;
        self.drain_aux(pool);
        block
    }

    /// Returns the block at `off` of class `idx` to the free lists
    pub fn dealloc_impl(&mut self, pool: &Pool, off: u64, idx: usize) {
        self.available_log = self.available + (1u64 << idx);
        self.free_block(pool, off, idx);
        self.drain_aux(pool);
    }

    fn free_block(&mut self, pool: &Pool, off: u64, idx: usize) {
        if (idx as u64) < self.last_idx {
            let rel = off - self.base;
            let buddy = self.base + (rel ^ (1u64 << idx));
            let mut prev: Option<u64> = None;
            let mut curr = self.buddies[idx];
            while curr != NONE {
                let next = *Self::word(pool, curr);
                if curr == buddy {
                    // detach the buddy and merge one class up
                    match prev {
                        Some(p) => self.stage(p, next),
                        None => self.stage(Self::head_off(pool, &self.buddies[idx]), next),
                    }
                    self.free_block(pool, off.min(buddy), idx + 1);
                    return;
                }
                debug_assert_ne!(next, curr, "cyclic link in free_block");
                prev = Some(curr);
                curr = next;
            }
        }
        self.stage(off, self.buddies[idx]);
        self.stage(Self::head_off(pool, &self.buddies[idx]), off);
    }

    /// Determines whether the range `[off, off + len)` overlaps a free block
    ///
    /// Walks every free list; used to guard replayed frees during recovery.
    pub fn is_allocated(&mut self, pool: &Pool, off: u64, len: usize) -> bool {
        if !self.aux.is_empty() {
            return true;
        }
        let end = off + len as u64 - 1;
        for idx in 0..=self.last_idx as usize {
            let blen = 1u64 << idx;
            let mut curr = self.buddies[idx];
            while curr != NONE {
                let r = curr + blen;
                if (off >= curr && off < r) || (end >= curr && end < r) || (off <= curr && end >= r)
                {
                    return false;
                }
                let next = *Self::word(pool, curr);
                debug_assert_ne!(next, curr, "cyclic link in is_allocated");
                curr = next;
            }
        }
        true
    }

    #[inline]
    pub fn available(&self) -> u64 {
        self.available
    }
}
