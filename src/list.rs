//! Transactional doubly-linked list
//!
//! A circular, sentinel-headed list over [`Oid`] linkage. Any object whose
//! first bytes are a [`List`] can be threaded; the head cell is its own
//! sentinel, so an empty list satisfies `next == prev == head`. Every link
//! write is routed through the engine's field-set, which is all it takes to
//! make ordinary pointer-graph surgery crash-consistent.

use crate::oid::Oid;
use crate::pool::Pool;
use crate::result::Result;
use crate::Error;
use std::mem;
use std::ptr::addr_of_mut;

/// Linkage embedded at the head of every list-capable object
#[repr(C)]
#[derive(Clone, Copy)]
pub struct List {
    pub next: Oid,
    pub prev: Oid,
}

/// Resolves an item's linkage against the current mapping
///
/// Offsets are what persist; the base stored inside an `Oid` may belong to
/// an earlier mapping, so the pointer is always re-derived from `pool`.
fn linkage(pool: &Pool, item: Oid) -> Result<*mut List> {
    if item.is_null() || !pool.contains_off(item.off(), mem::size_of::<List>()) {
        return Err(Error::Invalid(format!(
            "bad list offset 0x{:x}",
            item.off()
        )));
    }
    Ok((pool.base() + item.off()) as *mut List)
}

/// Initializes `head` as the sentinel of an empty list
pub fn init_head(pool: &Pool, head: Oid) -> Result<()> {
    let h = linkage(pool, head)?;
    pool.transaction(|tx| unsafe {
        tx.set(addr_of_mut!((*h).next), head)?;
        tx.set(addr_of_mut!((*h).prev), head)
    })
}

/// Inserts `new` between two known consecutive items
fn add_between(pool: &Pool, new: Oid, prev: Oid, next: Oid) -> Result<()> {
    let dnew = linkage(pool, new)?;
    let dprev = linkage(pool, prev)?;
    let dnext = linkage(pool, next)?;
    pool.transaction(|tx| unsafe {
        tx.set(addr_of_mut!((*dnext).prev), new)?;
        tx.set(addr_of_mut!((*dnew).next), next)?;
        tx.set(addr_of_mut!((*dnew).prev), prev)?;
        tx.set(addr_of_mut!((*dprev).next), new)
    })
}

/// Inserts `new` right after the head
pub fn add(pool: &Pool, new: Oid, head: Oid) -> Result<()> {
    let h = linkage(pool, head)?;
    let next = pool.rebase(unsafe { (*h).next });
    add_between(pool, new, head, next)
}

/// Inserts `new` right before the head (at the tail)
pub fn add_tail(pool: &Pool, new: Oid, head: Oid) -> Result<()> {
    let h = linkage(pool, head)?;
    let prev = pool.rebase(unsafe { (*h).prev });
    add_between(pool, new, prev, head)
}

/// Unthreads `item` by stitching its neighbors together
///
/// The item itself is not freed and its own links are left untouched.
pub fn del(pool: &Pool, item: Oid) -> Result<()> {
    let l = linkage(pool, item)?;
    let (prev, next) = unsafe { (pool.rebase((*l).prev), pool.rebase((*l).next)) };
    let dprev = linkage(pool, prev)?;
    let dnext = linkage(pool, next)?;
    pool.transaction(|tx| unsafe {
        tx.set(addr_of_mut!((*dnext).prev), prev)?;
        tx.set(addr_of_mut!((*dprev).next), next)
    })
}

/// Threads `new` into `old`'s position without touching `old`'s own links
pub fn replace(pool: &Pool, old: Oid, new: Oid) -> Result<()> {
    let dold = linkage(pool, old)?;
    let (prev, next) = unsafe { (pool.rebase((*dold).prev), pool.rebase((*dold).next)) };
    let dprev = linkage(pool, prev)?;
    let dnext = linkage(pool, next)?;
    let dnew = linkage(pool, new)?;
    pool.transaction(|tx| unsafe {
        tx.set(addr_of_mut!((*dnew).next), next)?;
        tx.set(addr_of_mut!((*dnext).prev), new)?;
        tx.set(addr_of_mut!((*dnew).prev), prev)?;
        tx.set(addr_of_mut!((*dprev).next), new)
    })
}

/// Tests whether `item` is the last item before the head
pub fn is_last(pool: &Pool, item: Oid, head: Oid) -> Result<bool> {
    let l = linkage(pool, item)?;
    Ok(unsafe { (*l).next } == head)
}

/// Tests whether the list is empty
pub fn is_empty(pool: &Pool, head: Oid) -> Result<bool> {
    let h = linkage(pool, head)?;
    Ok(unsafe { (*h).next } == head)
}

/// Read-only iteration from `head.next` until the head comes around again
///
/// Mutations during iteration are undefined unless the caller serializes
/// them inside its own transactions and locks.
pub fn iter<'p>(pool: &'p Pool, head: Oid) -> Result<Iter<'p>> {
    let h = linkage(pool, head)?;
    let first = pool.rebase(unsafe { (*h).next });
    Ok(Iter {
        pool,
        head,
        curr: first,
    })
}

/// Iterator over the items of a list, sentinel excluded
pub struct Iter<'p> {
    pool: &'p Pool,
    head: Oid,
    curr: Oid,
}

impl<'p> Iterator for Iter<'p> {
    type Item = Oid;

    fn next(&mut self) -> Option<Oid> {
        if self.curr == self.head {
            return None;
        }
        let l = match linkage(self.pool, self.curr) {
            Ok(l) => l,
            Err(_) => return None,
        };
        let item = self.curr;
        self.curr = self.pool.rebase(unsafe { (*l).next });
        Some(item)
    }
}
