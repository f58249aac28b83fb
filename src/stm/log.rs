//! Persistent undo-log records
//!
//! Each transaction frame owns a [`TxLog`] record linked from the pool's
//! active list, and a forward-linked chain of [`TxOp`] entries. Records and
//! entries live in pool memory, addressed by offsets only, so the chain a
//! crash leaves behind can be walked, and undone, at the next open.

use crate::alloc;
use crate::pool::Pool;
use crate::result::Result;
use crate::utils::read_addr;
use std::mem;
use std::ptr;

/// Entry already processed; skipped by commit, abort, and recovery
pub(crate) const OP_DONE: u64 = 0;
/// `off` holds the allocation produced inside the transaction
pub(crate) const OP_ALLOC: u64 = 1;
/// `off` holds a user-requested free, honored at commit
pub(crate) const OP_FREE: u64 = 2;
/// `len` bytes at `off` were overwritten; `aux` is the pre-image backup
pub(crate) const OP_SET: u64 = 3;

#[repr(C)]
pub(crate) struct TxOp {
    pub kind: u64,
    pub next: u64,
    pub off: u64,
    pub aux: u64,
    pub len: u64,
}

#[repr(C)]
pub(crate) struct TxLog {
    /// Persisted before the commit fan-out; decides replay direction
    pub committed: u64,
    pub next: u64,
    pub head: u64,
}

#[inline]
#[allow(clippy::mut_from_ref)]
pub(crate) unsafe fn op_at<'a>(pool: &Pool, off: u64) -> &'a mut TxOp {
    read_addr(pool.base() + off)
}

#[inline]
#[allow(clippy::mut_from_ref)]
pub(crate) unsafe fn log_at<'a>(pool: &Pool, off: u64) -> &'a mut TxLog {
    read_addr(pool.base() + off)
}

/// Allocates a fresh log record and links it into the pool's active list
pub(crate) fn new_log(pool: &Pool) -> Result<u64> {
    let mut off = 0u64;
    alloc::palloc(pool, &mut off, mem::size_of::<TxLog>())?;
    unsafe {
        let log = log_at(pool, off);
        log.committed = 0;
        log.head = 0;
        let _g = pool.txl_guard();
        let meta = pool.meta();
        log.next = meta.tx_head;
        pool.persist_obj(log);
        meta.tx_head = off;
        pool.persist_obj(&meta.tx_head);
    }
    Ok(off)
}

/// Appends one entry to a frame's chain and returns its offset
///
/// The entry is fully persisted before it is linked, so a partially
/// appended entry is never reachable.
pub(crate) fn append(
    pool: &Pool,
    log_off: u64,
    tail: u64,
    kind: u64,
    off: u64,
    aux: u64,
    len: u64,
) -> Result<u64> {
    let mut node = 0u64;
    alloc::palloc(pool, &mut node, mem::size_of::<TxOp>())?;
    unsafe {
        let op = op_at(pool, node);
        op.kind = kind;
        op.next = 0;
        op.off = off;
        op.aux = aux;
        op.len = len;
        pool.persist_obj(op);
        if tail == 0 {
            let log = log_at(pool, log_off);
            log.head = node;
            pool.persist_obj(&log.head);
        } else {
            let t = op_at(pool, tail);
            t.next = node;
            pool.persist_obj(&t.next);
        }
    }
    Ok(node)
}

/// On-commit action: allocations stand, frees happen, backups are dropped
pub(crate) unsafe fn commit_op(pool: &Pool, op: &mut TxOp) {
    match op.kind {
        OP_FREE => {
            let _ = alloc::pfree(pool, op.off);
        }
        OP_SET => {
            let _ = alloc::pfree(pool, op.aux);
        }
        _ => {}
    }
    op.kind = OP_DONE;
    pool.persist_obj(&op.kind);
}

/// On-abort action: allocations are reclaimed, frees are forgotten, and
/// overwritten ranges get their pre-image back (the backup itself is
/// reclaimed by the `Alloc` entry that produced it)
pub(crate) unsafe fn abort_op(pool: &Pool, op: &mut TxOp) {
    match op.kind {
        OP_ALLOC => {
            if op.off != 0 {
                let _ = alloc::pfree(pool, op.off);
            }
        }
        OP_SET => {
            let dst = (pool.base() + op.off) as *mut u8;
            let src = (pool.base() + op.aux) as *const u8;
            ptr::copy_nonoverlapping(src, dst, op.len as usize);
            pool.persist_range(dst, op.len as usize);
        }
        _ => {}
    }
    op.kind = OP_DONE;
    pool.persist_obj(&op.kind);
}

/// Unlinks a log record from the pool's active list and reclaims it,
/// together with its chain when `reclaim_ops` is set (a spliced chain
/// belongs to the parent and stays)
pub(crate) fn drop_log(pool: &Pool, log_off: u64, reclaim_ops: bool) {
    unsafe {
        {
            let _g = pool.txl_guard();
            let meta = pool.meta();
            if meta.tx_head == log_off {
                meta.tx_head = log_at(pool, log_off).next;
                pool.persist_obj(&meta.tx_head);
            } else {
                let mut cur = meta.tx_head;
                while cur != 0 {
                    let l = log_at(pool, cur);
                    if l.next == log_off {
                        l.next = log_at(pool, log_off).next;
                        pool.persist_obj(&l.next);
                        break;
                    }
                    cur = l.next;
                }
            }
        }
        if reclaim_ops {
            let mut op = log_at(pool, log_off).head;
            while op != 0 {
                let next = op_at(pool, op).next;
                let _ = alloc::pfree(pool, op);
                op = next;
            }
        }
        let _ = alloc::pfree(pool, log_off);
    }
}

/// Frees during recovery are guarded: an offset whose free already took
/// effect before the crash sits in a free list and is skipped
unsafe fn free_guarded(pool: &Pool, off: u64) {
    if off != 0 && alloc::is_allocated(pool, off) {
        let _ = alloc::pfree(pool, off);
    }
}

unsafe fn recover_commit_op(pool: &Pool, op: &TxOp) {
    match op.kind {
        OP_FREE => free_guarded(pool, op.off),
        OP_SET => free_guarded(pool, op.aux),
        _ => {}
    }
}

unsafe fn recover_abort_op(pool: &Pool, op: &TxOp) {
    match op.kind {
        OP_ALLOC => free_guarded(pool, op.off),
        OP_SET => {
            let dst = (pool.base() + op.off) as *mut u8;
            let src = (pool.base() + op.aux) as *const u8;
            ptr::copy_nonoverlapping(src, dst, op.len as usize);
            pool.persist_range(dst, op.len as usize);
        }
        _ => {}
    }
}

/// Replays whatever the last run left in the active-transaction list
///
/// Committed logs have their remaining commit actions finished; uncommitted
/// logs are rolled back in reverse. Chains are forward-walked and reversed
/// in memory rather than trusting any persisted tail.
pub(crate) fn recover(pool: &Pool) {
    unsafe {
        let meta = pool.meta();
        let mut recovered = 0u32;
        while meta.tx_head != 0 {
            let log_off = meta.tx_head;
            let log = log_at(pool, log_off);

            let max_ops = pool.size() / mem::size_of::<TxOp>();
            let mut chain = Vec::new();
            let mut cur = log.head;
            while cur != 0 && chain.len() <= max_ops {
                chain.push(cur);
                cur = op_at(pool, cur).next;
            }

            if log.committed != 0 {
                for &o in &chain {
                    recover_commit_op(pool, op_at(pool, o));
                }
            } else {
                for &o in chain.iter().rev() {
                    recover_abort_op(pool, op_at(pool, o));
                }
            }

            meta.tx_head = log.next;
            pool.persist_obj(&meta.tx_head);
            for &o in &chain {
                free_guarded(pool, o);
            }
            free_guarded(pool, log_off);
            recovered += 1;
        }
        if recovered > 0 {
            crate::log!(Magenta, "REPLAY", "{} interrupted transaction(s)", recovered);
        }
    }
}
